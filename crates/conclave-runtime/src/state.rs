//! Application state: the pool and the store behind one command surface.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use conclave_core::{ProjectId, Role, SessionId, SessionMode};
use conclave_process::{Conversation, SpawnSpec};
use conclave_store::{
    Database, MessageRepo, MessageRow, NewSession, ProjectRepo, ProjectRow, SessionRepo,
    SessionRow, StoreError,
};
use conclave_worktree::{slugify, WorktreeError, WorktreeInfo, WorktreeManager};

use crate::config::RuntimeConfig;
use crate::errors::{Result, RuntimeError};
use crate::launch;
use crate::pool::{PollReport, SessionExit, SessionPool};

/// A discrete request from the display layer.
#[derive(Clone, Debug)]
pub enum Command {
    CreateProject { name: String, path: PathBuf },
    SwitchProject(ProjectId),
    /// `mode: None` uses the configured default.
    CreateSession { name: String, mode: Option<SessionMode> },
    SelectSession(SessionId),
    DeleteSession(SessionId),
    StartSession(SessionId),
    KillSession(SessionId),
    /// To the selected session.
    SendMessage(String),
    SendMessageTo { session_id: SessionId, text: String },
    /// The selected session.
    Interrupt,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", content = "row", rename_all = "snake_case")]
pub enum CommandReply {
    Done,
    Project(ProjectRow),
    Session(SessionRow),
}

/// Result of [`AppState::dispatch`], always paired with fresh state.
#[derive(Debug)]
pub struct CommandOutcome {
    pub result: Result<CommandReply>,
    pub snapshot: Snapshot,
}

/// Read-only view for the display layer.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Snapshot {
    pub projects: Vec<ProjectRow>,
    pub active_project: Option<ProjectId>,
    /// Sessions of the active project, most recently updated first.
    pub sessions: Vec<SessionRow>,
    pub active_session: Option<SessionId>,
    pub transcript: Vec<MessageRow>,
    /// Raw output tail per session.
    pub background: BTreeMap<SessionId, String>,
    pub running: Vec<SessionId>,
    pub status: Option<String>,
}

pub struct AppState {
    config: RuntimeConfig,
    projects: ProjectRepo,
    sessions: SessionRepo,
    messages: MessageRepo,
    pool: SessionPool,
    active_project: Option<ProjectId>,
    active_session: Option<SessionId>,
    transcript: Vec<MessageRow>,
    status: Option<String>,
}

impl AppState {
    /// Build the facade over an opened database.
    ///
    /// No process survives a restart, so every session still flagged active
    /// is reset first.
    pub fn new(db: Database, config: RuntimeConfig) -> Result<Self> {
        let sessions = SessionRepo::new(db.clone());
        let reset = sessions.reset_all_active()?;
        if reset > 0 {
            info!(reset, "cleared stale active flags");
        }
        let pool = SessionPool::new(config.max_sessions, config.output_buffer_bytes);
        Ok(Self {
            projects: ProjectRepo::new(db.clone()),
            messages: MessageRepo::new(db),
            sessions,
            pool,
            config,
            active_project: None,
            active_session: None,
            transcript: Vec::new(),
            status: None,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn active_project(&self) -> Option<&ProjectId> {
        self.active_project.as_ref()
    }

    pub fn active_session(&self) -> Option<&SessionId> {
        self.active_session.as_ref()
    }

    pub fn transcript(&self) -> &[MessageRow] {
        &self.transcript
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    /// Apply one command and report the outcome with a fresh snapshot.
    pub async fn dispatch(&mut self, command: Command) -> CommandOutcome {
        debug!(?command, "dispatch");
        let result = match command {
            Command::CreateProject { name, path } => {
                self.create_project(&name, &path).map(CommandReply::Project)
            }
            Command::SwitchProject(id) => self.switch_project(&id).map(|()| CommandReply::Done),
            Command::CreateSession { name, mode } => {
                self.create_session(&name, mode).map(CommandReply::Session)
            }
            Command::SelectSession(id) => self.select_session(&id).map(|()| CommandReply::Done),
            Command::DeleteSession(id) => self.delete_session(&id).map(|()| CommandReply::Done),
            Command::StartSession(id) => self.start_session(&id).await.map(|()| CommandReply::Done),
            Command::KillSession(id) => self.kill_session(&id).map(|()| CommandReply::Done),
            Command::SendMessage(text) => self.send_message(&text).await.map(|()| CommandReply::Done),
            Command::SendMessageTo { session_id, text } => self
                .send_message_to(&session_id, &text)
                .await
                .map(|()| CommandReply::Done),
            Command::Interrupt => self.interrupt().map(|()| CommandReply::Done),
        };
        if let Err(e) = &result {
            warn!(category = e.category(), error = %e, "command failed");
            self.status = Some(e.to_string());
        }
        CommandOutcome {
            result,
            snapshot: self.snapshot(),
        }
    }

    // ── Projects ────────────────────────────────────────────────────

    /// Register a repository and make it the active project.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn create_project(&mut self, name: &str, path: &Path) -> Result<ProjectRow> {
        let manager = WorktreeManager::open(path)?;
        let root = manager.repo_root().canonicalize().map_err(WorktreeError::from)?;
        let root = root.to_string_lossy();
        let project = self.projects.create(name, root.as_ref())?;
        info!(project_id = %project.id, "project registered");

        self.set_active_project(Some(project.id.clone()));
        self.status = Some(format!("project {} registered", project.name));
        Ok(project)
    }

    /// Select the project registered at `path`, registering it first if
    /// needed.
    pub fn ensure_project(&mut self, name: &str, path: &Path) -> Result<ProjectRow> {
        let manager = WorktreeManager::open(path)?;
        let root = manager.repo_root().canonicalize().map_err(WorktreeError::from)?;
        match self.projects.get_by_path(root.to_string_lossy().as_ref())? {
            Some(project) => {
                self.switch_project(&project.id)?;
                Ok(project)
            }
            None => self.create_project(name, path),
        }
    }

    pub fn switch_project(&mut self, id: &ProjectId) -> Result<()> {
        let project = self.projects.get(id)?;
        self.set_active_project(Some(project.id));
        self.status = Some(format!("switched to {}", project.name));
        Ok(())
    }

    fn set_active_project(&mut self, id: Option<ProjectId>) {
        if self.active_project != id {
            self.active_session = None;
            self.transcript.clear();
        }
        self.active_project = id;
    }

    // ── Sessions ────────────────────────────────────────────────────

    /// Create an inactive session in the active project and select it.
    /// The working copy and process are created on first start.
    #[instrument(skip(self))]
    pub fn create_session(&mut self, name: &str, mode: Option<SessionMode>) -> Result<SessionRow> {
        let project_id = self
            .active_project
            .clone()
            .ok_or(RuntimeError::NoActiveProject)?;
        let slug = slugify(name)?;
        let taken = self
            .sessions
            .list(&project_id)?
            .iter()
            .any(|s| slugify(&s.name).is_ok_and(|other| other == slug));
        if taken {
            return Err(WorktreeError::Conflict(format!(
                "a session named like {name:?} already exists"
            ))
            .into());
        }

        let session = self.sessions.create(NewSession {
            project_id: &project_id,
            name,
            mode: mode.unwrap_or(self.config.default_mode),
            worktree_path: None,
        })?;
        info!(session_id = %session.id, mode = %session.mode, "session created");

        self.active_session = Some(session.id.clone());
        self.transcript.clear();
        self.status = Some(format!("session {} created", session.name));
        Ok(session)
    }

    /// Make `id` the foreground session and load its transcript.
    pub fn select_session(&mut self, id: &SessionId) -> Result<()> {
        let session = self.sessions.get(id)?;
        if self.active_project.as_ref() != Some(&session.project_id) {
            self.set_active_project(Some(session.project_id.clone()));
        }
        self.transcript = self.messages.list(id)?;
        self.active_session = Some(session.id);
        self.status = Some(format!("selected {}", session.name));
        Ok(())
    }

    /// Stop the process, remove the working copy, then delete the row and
    /// its transcript.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn delete_session(&mut self, id: &SessionId) -> Result<()> {
        let session = self.sessions.get(id)?;
        let project = self.projects.get(&session.project_id)?;

        // The handle is gone from here on, even if a later step fails.
        self.pool.forget(id);
        self.sessions.set_active(id, false)?;

        if session.worktree_path.is_some() {
            match self.worktree_manager(&project) {
                Ok(manager) => manager.remove(&session.name)?,
                Err(RuntimeError::Worktree(WorktreeError::RepoNotFound(path))) => {
                    warn!(path = %path.display(), "project repository is gone, skipping worktree removal");
                }
                Err(e) => return Err(e),
            }
        }

        self.sessions.delete(id)?;
        if self.active_session.as_ref() == Some(id) {
            self.active_session = None;
            self.transcript.clear();
        }
        info!("session deleted");
        self.status = Some(format!("session {} deleted", session.name));
        Ok(())
    }

    /// Spawn the session's agent, creating its working copy first if needed.
    /// Already running is not an error.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn start_session(&mut self, id: &SessionId) -> Result<()> {
        if self.pool.contains(id) {
            return Ok(());
        }
        self.pool.ensure_capacity()?;

        let session = self.sessions.get(id)?;
        let project = self.projects.get(&session.project_id)?;
        let working_dir = self.ensure_worktree(&project, &session).await?;

        let conversation = match (&session.resume_token, &self.config.invocation.session_id_flag) {
            (Some(token), _) => Conversation::Resume(token.clone()),
            (None, Some(_)) => Conversation::Assign(uuid::Uuid::now_v7().to_string()),
            (None, None) => Conversation::Fresh,
        };

        self.pool.spawn(SpawnSpec {
            binary: self.config.agent_binary.clone(),
            session_id: id.clone(),
            mode: session.mode,
            working_dir,
            conversation: conversation.clone(),
            invocation: self.config.invocation.clone(),
        })?;

        if let Err(e) = self.sessions.set_active(id, true) {
            self.pool.discard(id);
            return Err(e.into());
        }
        if let Conversation::Assign(token) = &conversation {
            if let Err(e) = self.sessions.set_resume_token(id, Some(token)) {
                warn!(error = %e, "failed to store resume token");
            }
        }

        info!(resumed = matches!(conversation, Conversation::Resume(_)), "session started");
        self.status = Some(format!("session {} started", session.name));
        Ok(())
    }

    pub fn kill_session(&mut self, id: &SessionId) -> Result<()> {
        self.pool.kill(id)?;
        self.status = Some(format!("stopping session {}", id.short()));
        Ok(())
    }

    // ── Conversation ────────────────────────────────────────────────

    pub async fn send_message(&mut self, text: &str) -> Result<()> {
        let id = self
            .active_session
            .clone()
            .ok_or(RuntimeError::NoActiveSession)?;
        self.send_message_to(&id, text).await
    }

    /// Deliver a line to a session, starting it first if it is not running,
    /// then record it as a user message.
    pub async fn send_message_to(&mut self, id: &SessionId, text: &str) -> Result<()> {
        if !self.pool.contains(id) {
            self.start_session(id).await?;
        }
        self.pool.send_line(id, text)?;

        let message = self.messages.append(id, Role::User, text)?;
        if self.active_session.as_ref() == Some(id) {
            self.transcript.push(message);
        }
        Ok(())
    }

    pub fn interrupt(&mut self) -> Result<()> {
        let id = self
            .active_session
            .clone()
            .ok_or(RuntimeError::NoActiveSession)?;
        self.pool.interrupt(&id)
    }

    // ── Tick ────────────────────────────────────────────────────────

    /// Drain all running sessions once. Never blocks.
    pub fn poll(&mut self) -> PollReport {
        let report = self.pool.poll(
            self.active_session.as_ref(),
            &self.sessions,
            &self.messages,
            &mut self.transcript,
        );

        for (id, exit) in &report.finished {
            let what = match exit {
                SessionExit::Finished { code } => format!("exited with code {code}"),
                SessionExit::Killed => "was stopped".to_string(),
                SessionExit::Lost => "was lost".to_string(),
            };
            self.status = Some(format!("session {} {what}", id.short()));
        }
        if let Some(notice) = report.notices.last() {
            self.status = Some(notice.clone());
        }
        report
    }

    pub fn snapshot(&self) -> Snapshot {
        let projects = self.projects.list().unwrap_or_else(|e| {
            warn!(error = %e, "failed to list projects");
            Vec::new()
        });
        let sessions = match &self.active_project {
            Some(project_id) => self.sessions.list(project_id).unwrap_or_else(|e| {
                warn!(error = %e, "failed to list sessions");
                Vec::new()
            }),
            None => Vec::new(),
        };
        let mut running: Vec<SessionId> = self.pool.running().cloned().collect();
        running.sort();

        Snapshot {
            projects,
            active_project: self.active_project.clone(),
            sessions,
            active_session: self.active_session.clone(),
            transcript: self.transcript.clone(),
            background: self
                .pool
                .outputs()
                .map(|(id, text)| (id.clone(), text.to_string()))
                .collect(),
            running,
            status: self.status.clone(),
        }
    }

    /// Kill everything and wait up to `grace` for the exits to drain.
    /// Sessions still registered afterwards are marked inactive regardless.
    pub async fn shutdown(&mut self, grace: Duration) {
        self.pool.kill_all();
        let deadline = tokio::time::Instant::now() + grace;
        while !self.pool.is_empty() && tokio::time::Instant::now() < deadline {
            self.poll();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let leftover: Vec<SessionId> = self.pool.running().cloned().collect();
        for id in leftover {
            self.pool.discard(&id);
            if let Err(e) = self.sessions.set_active(&id, false) {
                warn!(session_id = %id, error = %e, "failed to mark session inactive on shutdown");
            }
        }
        info!("session engine stopped");
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn worktrees_root(&self, project: &ProjectRow) -> Option<PathBuf> {
        self.config
            .worktrees_root
            .as_ref()
            .map(|root| root.join(project.id.short()))
    }

    fn worktree_manager(&self, project: &ProjectRow) -> Result<WorktreeManager> {
        launch::open_manager(Path::new(&project.path), self.worktrees_root(project).as_deref())
    }

    /// Path of the session's working copy, finding or creating it under the
    /// start deadline when the stored one is gone.
    async fn ensure_worktree(&self, project: &ProjectRow, session: &SessionRow) -> Result<PathBuf> {
        if let Some(path) = session.worktree_path.as_deref().map(PathBuf::from) {
            if path.is_dir() {
                return Ok(path);
            }
            warn!(path = %path.display(), "stored worktree is missing, recreating");
        }

        let info = launch::prepare_worktree(
            PathBuf::from(&project.path),
            self.worktrees_root(project),
            session.name.clone(),
            self.config.start_timeout,
        )
        .await?;

        self.record_worktree(&session.id, &info)?;
        Ok(info.path)
    }

    fn record_worktree(&self, id: &SessionId, info: &WorktreeInfo) -> Result<()> {
        let path = info.path.to_string_lossy();
        match self.sessions.set_worktree_path(id, Some(path.as_ref())) {
            Ok(()) => Ok(()),
            Err(StoreError::Conflict(detail)) => Err(WorktreeError::Conflict(detail).into()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AppState {
        AppState::new(Database::in_memory().unwrap(), RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn create_session_requires_project() {
        let mut app = state();
        assert!(matches!(
            app.create_session("s1", None),
            Err(RuntimeError::NoActiveProject)
        ));
    }

    #[test]
    fn create_project_requires_repository() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = state();
        let result = app.create_project("p", dir.path());
        assert!(matches!(
            result,
            Err(RuntimeError::Worktree(WorktreeError::RepoNotFound(_)))
        ));
        assert!(app.snapshot().projects.is_empty());
    }

    #[test]
    fn ensure_project_reuses_registration() {
        let dir = tempfile::tempdir().unwrap();
        git2::Repository::init(dir.path()).unwrap();
        let mut app = state();

        let first = app.ensure_project("a", dir.path()).unwrap();
        let second = app.ensure_project("b", dir.path()).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(app.snapshot().projects.len(), 1);
        assert_eq!(app.active_project(), Some(&first.id));
        assert!(matches!(
            app.create_project("c", dir.path()),
            Err(RuntimeError::Store(_))
        ));
    }

    #[test]
    fn interrupt_without_selection_fails() {
        let mut app = state();
        assert!(matches!(app.interrupt(), Err(RuntimeError::NoActiveSession)));
    }

    #[tokio::test]
    async fn send_without_selection_fails() {
        let mut app = state();
        let outcome = app.dispatch(Command::SendMessage("hi".into())).await;
        assert!(matches!(outcome.result, Err(RuntimeError::NoActiveSession)));
        assert_eq!(outcome.snapshot.status.as_deref(), Some("no session selected"));
    }

    #[test]
    fn stale_active_flags_are_reset() {
        let db = Database::in_memory().unwrap();
        let project = ProjectRepo::new(db.clone()).create("p", "/tmp/p").unwrap();
        let sessions = SessionRepo::new(db.clone());
        let s = sessions
            .create(NewSession {
                project_id: &project.id,
                name: "s1",
                mode: SessionMode::Agent,
                worktree_path: None,
            })
            .unwrap();
        sessions.set_active(&s.id, true).unwrap();

        let _app = AppState::new(db, RuntimeConfig::default()).unwrap();
        assert!(!sessions.get(&s.id).unwrap().active);
    }
}
