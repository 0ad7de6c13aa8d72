use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use conclave_core::ProjectId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectRow {
    pub id: ProjectId,
    pub name: String,
    pub path: String,
    pub created_at: DateTime<Utc>,
}

const PROJECT_COLUMNS: &str = "id, name, path, created_at";

pub struct ProjectRepo {
    db: Database,
}

impl ProjectRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register a project. Fails with `Constraint` if the path is already registered.
    #[instrument(skip(self), fields(name, path))]
    pub fn create(&self, name: &str, path: &str) -> Result<ProjectRow, StoreError> {
        let id = ProjectId::new();
        let now = row_helpers::now_text();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO projects (id, name, path, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id.as_str(), name, path, now],
            )?;

            Ok(ProjectRow {
                id,
                name: name.to_string(),
                path: path.to_string(),
                created_at: row_helpers::parse_timestamp(&now, "projects", "created_at"),
            })
        })
    }

    /// Get a project by ID.
    #[instrument(skip(self), fields(project_id = %id))]
    pub fn get(&self, id: &ProjectId) -> Result<ProjectRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_project(row),
                None => Err(StoreError::NotFound(format!("project {id}"))),
            }
        })
    }

    /// Look up the project registered for a path, if any.
    #[instrument(skip(self), fields(path))]
    pub fn get_by_path(&self, path: &str) -> Result<Option<ProjectRow>, StoreError> {
        self.db.with_conn(|conn| {
            let id: Option<String> = conn
                .query_row("SELECT id FROM projects WHERE path = ?1", [path], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(id)
        })?
        .map(|id| self.get(&ProjectId::from_raw(id)))
        .transpose()
    }

    /// List all projects in registration order.
    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<ProjectRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PROJECT_COLUMNS} FROM projects ORDER BY created_at ASC, rowid ASC"
            ))?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_project(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_project(row: &rusqlite::Row<'_>) -> Result<ProjectRow, StoreError> {
    let created_at: String = row_helpers::get(row, 3, "projects", "created_at")?;
    Ok(ProjectRow {
        id: ProjectId::from_raw(row_helpers::get::<String>(row, 0, "projects", "id")?),
        name: row_helpers::get(row, 1, "projects", "name")?,
        path: row_helpers::get(row, 2, "projects", "path")?,
        created_at: row_helpers::parse_timestamp(&created_at, "projects", "created_at"),
    })
}
