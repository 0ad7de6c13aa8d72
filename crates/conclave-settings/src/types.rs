//! Settings type definitions.
//!
//! Field names are camelCase on disk. Every section is `#[serde(default)]`
//! so a settings file only needs the keys it changes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use conclave_core::SessionMode;

/// Root settings, loaded from `~/.conclave/settings.json`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConclaveSettings {
    pub agent: AgentSettings,
    pub runtime: RuntimeSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

/// How the agent binary is launched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    /// Executable name or path.
    pub binary: String,
    /// Mode for sessions created without an explicit one.
    pub default_mode: SessionMode,
    pub plan_args: Vec<String>,
    pub agent_args: Vec<String>,
    pub resume_flag: String,
    /// Set to `null` in JSON to keep the default; an empty string disables it.
    pub session_id_flag: String,
    pub extra_args: Vec<String>,
    /// Extra environment for every agent process.
    pub env: BTreeMap<String, String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            default_mode: SessionMode::Agent,
            plan_args: vec!["--permission-mode".to_string(), "plan".to_string()],
            agent_args: vec!["--dangerously-skip-permissions".to_string()],
            resume_flag: "--resume".to_string(),
            session_id_flag: "--session-id".to_string(),
            extra_args: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeSettings {
    /// Ceiling on concurrently running agent processes.
    pub max_sessions: usize,
    /// Poll interval of the front end.
    pub tick_ms: u64,
    /// Deadline for creating a session's working copy.
    pub start_timeout_ms: u64,
    /// Per-session cap on retained background output.
    pub output_buffer_bytes: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            max_sessions: 8,
            tick_ms: 100,
            start_timeout_ms: 10_000,
            output_buffer_bytes: 256 * 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    pub database_path: PathBuf,
    /// Parent directory for session working copies. Defaults to a sibling of
    /// each project's repository when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktrees_root: Option<PathBuf>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: conclave_home().join("conclave.db"),
            worktrees_root: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level filter; `RUST_LOG` takes precedence.
    pub level: String,
    pub json: bool,
    /// Log to this file instead of stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

/// `~/.conclave`, or `/tmp/.conclave` without a home directory.
pub fn conclave_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".conclave")
}
