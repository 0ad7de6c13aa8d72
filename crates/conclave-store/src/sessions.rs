use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use conclave_core::{ProjectId, SessionId, SessionMode};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: SessionId,
    pub project_id: ProjectId,
    pub name: String,
    pub mode: SessionMode,
    pub active: bool,
    pub worktree_path: Option<String>,
    pub resume_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied by the caller when creating a session.
#[derive(Clone, Debug)]
pub struct NewSession<'a> {
    pub project_id: &'a ProjectId,
    pub name: &'a str,
    pub mode: SessionMode,
    pub worktree_path: Option<&'a str>,
}

const SESSION_COLUMNS: &str = "id, project_id, name, mode, active, worktree_path, resume_token, created_at, updated_at";

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new, inactive session.
    ///
    /// The project must exist; a dangling `project_id` is a constraint violation.
    #[instrument(skip(self, new), fields(project_id = %new.project_id, name = new.name, mode = %new.mode))]
    pub fn create(&self, new: NewSession<'_>) -> Result<SessionRow, StoreError> {
        let id = SessionId::new();
        let now = row_helpers::now_text();

        self.db.with_tx(|tx| {
            if let Some(path) = new.worktree_path {
                ensure_worktree_unused(tx, path, None)?;
            }
            tx.execute(
                "INSERT INTO sessions (id, project_id, name, mode, active, worktree_path, resume_token, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, NULL, ?6, ?7)",
                rusqlite::params![
                    id.as_str(),
                    new.project_id.as_str(),
                    new.name,
                    new.mode.as_str(),
                    new.worktree_path,
                    now,
                    now,
                ],
            )?;

            let ts = row_helpers::parse_timestamp(&now, "sessions", "created_at");
            Ok(SessionRow {
                id,
                project_id: new.project_id.clone(),
                name: new.name.to_string(),
                mode: new.mode,
                active: false,
                worktree_path: new.worktree_path.map(str::to_string),
                resume_token: None,
                created_at: ts,
                updated_at: ts,
            })
        })
    }

    /// Get a session by ID.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    /// List sessions for a project, most recently updated first.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub fn list(&self, project_id: &ProjectId) -> Result<Vec<SessionRow>, StoreError> {
        self.query_many(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE project_id = ?1
                 ORDER BY updated_at DESC, rowid DESC"
            ),
            &[&project_id.as_str()],
        )
    }

    /// All sessions currently flagged active, across projects.
    #[instrument(skip(self))]
    pub fn list_active(&self) -> Result<Vec<SessionRow>, StoreError> {
        self.query_many(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE active = 1
                 ORDER BY updated_at DESC, rowid DESC"
            ),
            &[],
        )
    }

    /// Toggle the active flag. Also bumps `updated_at`.
    #[instrument(skip(self), fields(session_id = %id, active))]
    pub fn set_active(&self, id: &SessionId, active: bool) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET active = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![active, row_helpers::now_text(), id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }

    /// Clear every active flag. Returns the number of rows reset.
    ///
    /// Run once at startup: no process handle survives a restart.
    #[instrument(skip(self))]
    pub fn reset_all_active(&self) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE sessions SET active = 0, updated_at = ?1 WHERE active = 1",
                [row_helpers::now_text()],
            )?)
        })
    }

    /// Record the session's working copy. The path must not belong to another session.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn set_worktree_path(&self, id: &SessionId, path: Option<&str>) -> Result<(), StoreError> {
        self.db.with_tx(|tx| {
            if let Some(path) = path {
                ensure_worktree_unused(tx, path, Some(id))?;
            }
            let changed = tx.execute(
                "UPDATE sessions SET worktree_path = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![path, row_helpers::now_text(), id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }

    #[instrument(skip(self, token), fields(session_id = %id))]
    pub fn set_resume_token(&self, id: &SessionId, token: Option<&str>) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET resume_token = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![token, row_helpers::now_text(), id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }

    /// Delete a session. Its messages go with it (ON DELETE CASCADE).
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn delete(&self, id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }

    fn query_many(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::types::ToSql],
    ) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(params)?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }
}

fn ensure_worktree_unused(
    conn: &rusqlite::Connection,
    path: &str,
    owner: Option<&SessionId>,
) -> Result<(), StoreError> {
    let holder: Option<String> = conn
        .query_row(
            "SELECT id FROM sessions WHERE worktree_path = ?1 AND id != ?2 LIMIT 1",
            rusqlite::params![path, owner.map_or("", |id| id.as_str())],
            |row| row.get(0),
        )
        .optional()?;
    match holder {
        Some(other) => Err(StoreError::Conflict(format!(
            "worktree {path} already belongs to session {other}"
        ))),
        None => Ok(()),
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    let mode: String = row_helpers::get(row, 3, "sessions", "mode")?;
    let created_at: String = row_helpers::get(row, 7, "sessions", "created_at")?;
    let updated_at: String = row_helpers::get(row, 8, "sessions", "updated_at")?;

    Ok(SessionRow {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        project_id: ProjectId::from_raw(row_helpers::get::<String>(row, 1, "sessions", "project_id")?),
        name: row_helpers::get(row, 2, "sessions", "name")?,
        mode: row_helpers::parse_enum(&mode, "sessions", "mode")?,
        active: row_helpers::get(row, 4, "sessions", "active")?,
        worktree_path: row_helpers::get_opt(row, 5, "sessions", "worktree_path")?,
        resume_token: row_helpers::get_opt(row, 6, "sessions", "resume_token")?,
        created_at: row_helpers::parse_timestamp(&created_at, "sessions", "created_at"),
        updated_at: row_helpers::parse_timestamp(&updated_at, "sessions", "updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projects::ProjectRepo;

    fn setup() -> (Database, ProjectId) {
        let db = Database::in_memory().unwrap();
        let project = ProjectRepo::new(db.clone()).create("p", "/tmp/p").unwrap();
        (db, project.id)
    }

    fn new_session<'a>(project_id: &'a ProjectId, name: &'a str) -> NewSession<'a> {
        NewSession {
            project_id,
            name,
            mode: SessionMode::Agent,
            worktree_path: None,
        }
    }

    fn set_updated_at(db: &Database, id: &SessionId, ts: &str) {
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                rusqlite::params![ts, id.as_str()],
            )?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn create_session_is_inactive() {
        let (db, project_id) = setup();
        let repo = SessionRepo::new(db);
        let session = repo.create(new_session(&project_id, "s1")).unwrap();

        let fetched = repo.get(&session.id).unwrap();
        assert!(fetched.id.as_str().starts_with("sess_"));
        assert_eq!(fetched.name, "s1");
        assert_eq!(fetched.mode, SessionMode::Agent);
        assert!(!fetched.active);
        assert!(fetched.worktree_path.is_none());
        assert!(fetched.resume_token.is_none());
    }

    #[test]
    fn mode_is_stored_as_text() {
        let (db, project_id) = setup();
        let repo = SessionRepo::new(db.clone());
        let session = repo
            .create(NewSession {
                mode: SessionMode::Plan,
                ..new_session(&project_id, "planner")
            })
            .unwrap();

        let raw: String = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT mode FROM sessions WHERE id = ?1",
                    [session.id.as_str()],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(raw, "plan");
    }

    #[test]
    fn unknown_project_is_rejected() {
        let (db, _) = setup();
        let repo = SessionRepo::new(db);
        let missing = ProjectId::from_raw("proj_missing");
        let result = repo.create(new_session(&missing, "orphan"));
        assert!(matches!(result, Err(StoreError::Constraint(_))));
    }

    #[test]
    fn get_nonexistent_fails() {
        let (db, _) = setup();
        let repo = SessionRepo::new(db);
        let result = repo.get(&SessionId::from_raw("sess_nonexistent"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn list_orders_by_updated_at_desc() {
        let (db, project_id) = setup();
        let repo = SessionRepo::new(db.clone());
        let a = repo.create(new_session(&project_id, "a")).unwrap();
        let b = repo.create(new_session(&project_id, "b")).unwrap();
        let c = repo.create(new_session(&project_id, "c")).unwrap();

        set_updated_at(&db, &a.id, "2025-01-03T00:00:00.000000Z");
        set_updated_at(&db, &b.id, "2025-01-01T00:00:00.000000Z");
        set_updated_at(&db, &c.id, "2025-01-02T00:00:00.000000Z");

        let names: Vec<_> = repo.list(&project_id).unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a", "c", "b"]);
    }

    #[test]
    fn set_active_bumps_updated_at() {
        let (db, project_id) = setup();
        let repo = SessionRepo::new(db.clone());
        let old = repo.create(new_session(&project_id, "old")).unwrap();
        let fresh = repo.create(new_session(&project_id, "fresh")).unwrap();
        set_updated_at(&db, &old.id, "2000-01-01T00:00:00.000000Z");
        set_updated_at(&db, &fresh.id, "2001-01-01T00:00:00.000000Z");

        repo.set_active(&old.id, true).unwrap();

        let listed = repo.list(&project_id).unwrap();
        assert_eq!(listed[0].id, old.id);
        assert!(listed[0].active);
        assert!(!listed[1].active);
    }

    #[test]
    fn list_is_scoped_to_project() {
        let (db, project_id) = setup();
        let other = ProjectRepo::new(db.clone()).create("q", "/tmp/q").unwrap();
        let repo = SessionRepo::new(db);
        repo.create(new_session(&project_id, "mine")).unwrap();
        repo.create(new_session(&other.id, "theirs")).unwrap();

        let listed = repo.list(&project_id).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "mine");
    }

    #[test]
    fn reset_all_active_clears_flags() {
        let (db, project_id) = setup();
        let repo = SessionRepo::new(db);
        let a = repo.create(new_session(&project_id, "a")).unwrap();
        let b = repo.create(new_session(&project_id, "b")).unwrap();
        repo.set_active(&a.id, true).unwrap();
        repo.set_active(&b.id, true).unwrap();
        assert_eq!(repo.list_active().unwrap().len(), 2);

        assert_eq!(repo.reset_all_active().unwrap(), 2);
        assert!(repo.list_active().unwrap().is_empty());
    }

    #[test]
    fn set_active_on_missing_session_fails() {
        let (db, _) = setup();
        let repo = SessionRepo::new(db);
        let result = repo.set_active(&SessionId::from_raw("sess_gone"), false);
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn worktree_path_must_be_unique() {
        let (db, project_id) = setup();
        let repo = SessionRepo::new(db);
        let a = repo.create(new_session(&project_id, "a")).unwrap();
        let b = repo.create(new_session(&project_id, "b")).unwrap();

        repo.set_worktree_path(&a.id, Some("/wt/a")).unwrap();
        // Re-setting your own path is fine.
        repo.set_worktree_path(&a.id, Some("/wt/a")).unwrap();

        let result = repo.set_worktree_path(&b.id, Some("/wt/a"));
        assert!(matches!(result, Err(StoreError::Conflict(_))));

        let result = repo.create(NewSession {
            worktree_path: Some("/wt/a"),
            ..new_session(&project_id, "c")
        });
        assert!(matches!(result, Err(StoreError::Conflict(_))));

        repo.set_worktree_path(&a.id, None).unwrap();
        repo.set_worktree_path(&b.id, Some("/wt/a")).unwrap();
        assert_eq!(repo.get(&b.id).unwrap().worktree_path.as_deref(), Some("/wt/a"));
    }

    #[test]
    fn resume_token_roundtrip() {
        let (db, project_id) = setup();
        let repo = SessionRepo::new(db);
        let s = repo.create(new_session(&project_id, "s")).unwrap();
        repo.set_resume_token(&s.id, Some("tok-123")).unwrap();
        assert_eq!(repo.get(&s.id).unwrap().resume_token.as_deref(), Some("tok-123"));
    }

    #[test]
    fn delete_session() {
        let (db, project_id) = setup();
        let repo = SessionRepo::new(db);
        let s = repo.create(new_session(&project_id, "s")).unwrap();
        repo.delete(&s.id).unwrap();
        assert!(repo.get(&s.id).is_err());
        assert!(matches!(repo.delete(&s.id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn invalid_mode_returns_corrupt_row() {
        let (db, project_id) = setup();
        let now = row_helpers::now_text();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, project_id, name, mode, active, created_at, updated_at)
                 VALUES ('sess_bad', ?1, 'bad', 'INVALID_MODE', 0, ?2, ?2)",
                rusqlite::params![project_id.as_str(), now],
            )?;
            Ok(())
        })
        .unwrap();

        let repo = SessionRepo::new(db);
        let result = repo.get(&SessionId::from_raw("sess_bad"));
        assert!(matches!(result, Err(StoreError::CorruptRow { column: "mode", .. })));
    }

    #[test]
    fn malformed_updated_at_is_tolerated() {
        let (db, project_id) = setup();
        let repo = SessionRepo::new(db.clone());
        let s = repo.create(new_session(&project_id, "s")).unwrap();
        set_updated_at(&db, &s.id, "not-a-date");

        let before = Utc::now();
        let fetched = repo.get(&s.id).unwrap();
        assert!(fetched.updated_at >= before);
    }
}
