use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use conclave_core::{SessionId, SessionMode};

/// How the agent binary is told which mode it runs in and which
/// conversation it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationConfig {
    /// Read-only mode arguments.
    pub plan_args: Vec<String>,
    /// Full-capability mode arguments.
    pub agent_args: Vec<String>,
    pub resume_flag: String,
    /// Flag that assigns a conversation token on first launch. `None` for
    /// agents that cannot be told their token up front.
    pub session_id_flag: Option<String>,
    pub extra_args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            plan_args: vec!["--permission-mode".into(), "plan".into()],
            agent_args: vec!["--dangerously-skip-permissions".into()],
            resume_flag: "--resume".into(),
            session_id_flag: Some("--session-id".into()),
            extra_args: Vec::new(),
            env: Vec::new(),
        }
    }
}

/// Which conversation the process continues.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Conversation {
    /// Let the agent pick; nothing is passed.
    #[default]
    Fresh,
    /// Start a new conversation under this token.
    Assign(String),
    /// Continue the conversation stored under this token.
    Resume(String),
}

impl Conversation {
    pub fn token(&self) -> Option<&str> {
        match self {
            Self::Fresh => None,
            Self::Assign(t) | Self::Resume(t) => Some(t),
        }
    }
}

impl InvocationConfig {
    /// Full argument list: mode flags, conversation flags, then extras.
    pub fn args(&self, mode: SessionMode, conversation: &Conversation) -> Vec<String> {
        let mode_args = if mode.is_read_only() {
            &self.plan_args
        } else {
            &self.agent_args
        };
        let mut args = mode_args.clone();
        match conversation {
            Conversation::Fresh => {}
            Conversation::Assign(token) => {
                if let Some(flag) = &self.session_id_flag {
                    args.push(flag.clone());
                    args.push(token.clone());
                }
            }
            Conversation::Resume(token) => {
                args.push(self.resume_flag.clone());
                args.push(token.clone());
            }
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Everything needed to launch one session's agent.
#[derive(Clone, Debug)]
pub struct SpawnSpec {
    pub binary: PathBuf,
    pub session_id: SessionId,
    pub mode: SessionMode,
    pub working_dir: PathBuf,
    pub conversation: Conversation,
    pub invocation: InvocationConfig,
}

impl SpawnSpec {
    pub fn args(&self) -> Vec<String> {
        self.invocation.args(self.mode, &self.conversation)
    }
}
