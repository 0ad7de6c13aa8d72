use std::path::PathBuf;
use std::time::Duration;

use conclave_core::SessionMode;
use conclave_process::InvocationConfig;
use conclave_settings::ConclaveSettings;

/// Resolved knobs for the session engine.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub agent_binary: PathBuf,
    pub invocation: InvocationConfig,
    pub default_mode: SessionMode,
    pub max_sessions: usize,
    pub start_timeout: Duration,
    pub output_buffer_bytes: usize,
    /// Shared parent for working copies; `None` uses each repository's sibling directory.
    pub worktrees_root: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_settings(&ConclaveSettings::default())
    }
}

impl RuntimeConfig {
    pub fn from_settings(settings: &ConclaveSettings) -> Self {
        let agent = &settings.agent;
        let session_id_flag = Some(agent.session_id_flag.trim())
            .filter(|flag| !flag.is_empty())
            .map(str::to_string);
        Self {
            agent_binary: PathBuf::from(&agent.binary),
            invocation: InvocationConfig {
                plan_args: agent.plan_args.clone(),
                agent_args: agent.agent_args.clone(),
                resume_flag: agent.resume_flag.clone(),
                session_id_flag,
                extra_args: agent.extra_args.clone(),
                env: agent
                    .env
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            },
            default_mode: agent.default_mode,
            max_sessions: settings.runtime.max_sessions,
            start_timeout: Duration::from_millis(settings.runtime.start_timeout_ms),
            output_buffer_bytes: settings.runtime.output_buffer_bytes,
            worktrees_root: settings.storage.worktrees_root.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_settings() {
        let config = RuntimeConfig::default();
        assert_eq!(config.agent_binary, PathBuf::from("claude"));
        assert_eq!(config.max_sessions, 8);
        assert_eq!(config.start_timeout, Duration::from_secs(10));
        assert_eq!(config.invocation, InvocationConfig::default());
    }

    #[test]
    fn empty_session_id_flag_disables_assignment() {
        let mut settings = ConclaveSettings::default();
        settings.agent.session_id_flag = "  ".into();
        settings.agent.env.insert("FOO".into(), "bar".into());
        let config = RuntimeConfig::from_settings(&settings);
        assert_eq!(config.invocation.session_id_flag, None);
        assert_eq!(config.invocation.env, vec![("FOO".to_string(), "bar".to_string())]);
    }
}
