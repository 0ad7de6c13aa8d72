//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ConclaveSettings::default()`]
//! 2. If `~/.conclave/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `CONCLAVE_*` environment overrides (highest priority)
//! 4. Validate

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use conclave_core::SessionMode;

use crate::errors::{Result, SettingsError};
use crate::types::{conclave_home, ConclaveSettings};

pub fn settings_path() -> PathBuf {
    conclave_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ConclaveSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a malformed one is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ConclaveSettings> {
    load_with_env(path, |name| std::env::var(name).ok())
}

/// Same as [`load_settings_from_path`] with an explicit environment.
pub fn load_with_env(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ConclaveSettings> {
    let defaults = serde_json::to_value(ConclaveSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ConclaveSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, env);
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, arrays and primitives are replaced, and nulls in
/// `source` leave `target` untouched.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `CONCLAVE_*` overrides. Invalid values are ignored with a warning.
pub fn apply_env_overrides(settings: &mut ConclaveSettings, env: impl Fn(&str) -> Option<String>) {
    if let Some(v) = read_string(&env, "CONCLAVE_AGENT_BINARY") {
        settings.agent.binary = v;
    }
    if let Some(v) = read_parsed::<SessionMode>(&env, "CONCLAVE_DEFAULT_MODE") {
        settings.agent.default_mode = v;
    }
    if let Some(v) = read_usize(&env, "CONCLAVE_MAX_SESSIONS", 1, 1_000) {
        settings.runtime.max_sessions = v;
    }
    if let Some(v) = read_u64(&env, "CONCLAVE_TICK_MS", 1, 60_000) {
        settings.runtime.tick_ms = v;
    }
    if let Some(v) = read_u64(&env, "CONCLAVE_START_TIMEOUT_MS", 100, 600_000) {
        settings.runtime.start_timeout_ms = v;
    }
    if let Some(v) = read_string(&env, "CONCLAVE_DB_PATH") {
        settings.storage.database_path = PathBuf::from(v);
    }
    if let Some(v) = read_string(&env, "CONCLAVE_WORKTREES_ROOT") {
        settings.storage.worktrees_root = Some(PathBuf::from(v));
    }
    if let Some(v) = read_string(&env, "CONCLAVE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_bool(&env, "CONCLAVE_LOG_JSON") {
        settings.logging.json = v;
    }
}

pub fn validate(settings: &ConclaveSettings) -> Result<()> {
    if settings.agent.binary.trim().is_empty() {
        return Err(SettingsError::InvalidValue("agent.binary must not be empty".into()));
    }
    if settings.runtime.max_sessions == 0 {
        return Err(SettingsError::InvalidValue(
            "runtime.maxSessions must be at least 1".into(),
        ));
    }
    if settings.runtime.tick_ms == 0 {
        return Err(SettingsError::InvalidValue("runtime.tickMs must be at least 1".into()));
    }
    if settings.runtime.start_timeout_ms == 0 {
        return Err(SettingsError::InvalidValue(
            "runtime.startTimeoutMs must be at least 1".into(),
        ));
    }
    Ok(())
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers ─────────────────────────────────────────────────────────

fn read_string(env: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    env(name).filter(|v| !v.is_empty())
}

fn read_bool(env: &impl Fn(&str) -> Option<String>, name: &str) -> Option<bool> {
    let val = env(name)?;
    let result = parse_bool(&val);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_u64(env: &impl Fn(&str) -> Option<String>, name: &str, min: u64, max: u64) -> Option<u64> {
    let val = env(name)?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_usize(
    env: &impl Fn(&str) -> Option<String>,
    name: &str,
    min: usize,
    max: usize,
) -> Option<usize> {
    let val = env(name)?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

fn read_parsed<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Option<T> {
    let val = env(name)?;
    let result = val.parse().ok();
    if result.is_none() {
        warn!(key = name, value = %val, "invalid env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"runtime": {"maxSessions": 8, "tickMs": 100}});
        let source = serde_json::json!({"runtime": {"maxSessions": 2}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["runtime"]["maxSessions"], 2);
        assert_eq!(merged["runtime"]["tickMs"], 100);
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"items": [1, 2, 3]});
        let source = serde_json::json!({"items": [4]});
        assert_eq!(deep_merge(target, source)["items"], serde_json::json!([4]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_new_keys_added() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"b": 2}));
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    // ── loading ─────────────────────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_with_env(Path::new("/nonexistent/settings.json"), no_env).unwrap();
        assert_eq!(settings, ConclaveSettings::default());
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"agent": {"binary": "/usr/local/bin/agent", "defaultMode": "plan"}, "runtime": {"maxSessions": 3}}"#,
        )
        .unwrap();

        let settings = load_with_env(&path, no_env).unwrap();
        assert_eq!(settings.agent.binary, "/usr/local/bin/agent");
        assert_eq!(settings.agent.default_mode, SessionMode::Plan);
        assert_eq!(settings.runtime.max_sessions, 3);
        assert_eq!(settings.agent.resume_flag, "--resume");
        assert_eq!(settings.runtime.tick_ms, 100);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();
        assert!(matches!(load_with_env(&path, no_env), Err(SettingsError::Json(_))));
    }

    #[test]
    fn load_rejects_zero_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"runtime": {"maxSessions": 0}}"#).unwrap();
        assert!(matches!(
            load_with_env(&path, no_env),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn load_rejects_unknown_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"agent": {"defaultMode": "yolo"}}"#).unwrap();
        assert!(matches!(load_with_env(&path, no_env), Err(SettingsError::Json(_))));
    }

    // ── env overrides ───────────────────────────────────────────────

    #[test]
    fn env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"runtime": {"maxSessions": 3}}"#).unwrap();

        let env = env_from(&[
            ("CONCLAVE_MAX_SESSIONS", "5"),
            ("CONCLAVE_AGENT_BINARY", "fake-agent"),
            ("CONCLAVE_DEFAULT_MODE", "plan"),
            ("CONCLAVE_DB_PATH", "/tmp/c.db"),
            ("CONCLAVE_TICK_MS", "50"),
            ("CONCLAVE_LOG_LEVEL", "debug"),
            ("CONCLAVE_LOG_JSON", "yes"),
        ]);
        let settings = load_with_env(&path, env).unwrap();
        assert_eq!(settings.runtime.max_sessions, 5);
        assert_eq!(settings.agent.binary, "fake-agent");
        assert_eq!(settings.agent.default_mode, SessionMode::Plan);
        assert_eq!(settings.storage.database_path, PathBuf::from("/tmp/c.db"));
        assert_eq!(settings.runtime.tick_ms, 50);
        assert_eq!(settings.logging.level, "debug");
        assert!(settings.logging.json);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut settings = ConclaveSettings::default();
        apply_env_overrides(
            &mut settings,
            env_from(&[
                ("CONCLAVE_MAX_SESSIONS", "0"),
                ("CONCLAVE_TICK_MS", "fast"),
                ("CONCLAVE_DEFAULT_MODE", "yolo"),
                ("CONCLAVE_AGENT_BINARY", ""),
            ]),
        );
        assert_eq!(settings, ConclaveSettings::default());
    }

    // ── parsing ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for v in ["true", "TRUE", "1", "yes", "on"] {
            assert_eq!(parse_bool(v), Some(true), "{v}");
        }
        for v in ["false", "0", "no", "Off"] {
            assert_eq!(parse_bool(v), Some(false), "{v}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_usize_range("4", 1, 10), Some(4));
        assert_eq!(parse_usize_range("0", 1, 10), None);
        assert_eq!(parse_u64_range("11", 1, 10), None);
        assert_eq!(parse_u64_range("-1", 0, 10), None);
    }
}
