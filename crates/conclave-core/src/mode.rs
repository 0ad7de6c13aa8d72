use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Returned when a stored or configured string names no known variant.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Capability level granted to a spawned agent process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Read-only inspection.
    Plan,
    /// Full read-write execution.
    #[default]
    Agent,
}

impl SessionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Agent => "agent",
        }
    }

    pub fn is_read_only(self) -> bool {
        matches!(self, Self::Plan)
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionMode {
    type Err = ParseEnumError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "agent" => Ok(Self::Agent),
            other => Err(ParseEnumError {
                kind: "session mode",
                value: other.to_string(),
            }),
        }
    }
}

/// Author of a transcript message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ParseEnumError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(ParseEnumError {
                kind: "role",
                value: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_stored_strings() {
        assert_eq!("plan".parse::<SessionMode>().unwrap(), SessionMode::Plan);
        assert_eq!("agent".parse::<SessionMode>().unwrap(), SessionMode::Agent);
        assert_eq!(SessionMode::Agent.to_string(), "agent");
    }

    #[test]
    fn mode_rejects_unknown() {
        let err = "AGENT".parse::<SessionMode>().unwrap_err();
        assert_eq!(err.to_string(), "unknown session mode: AGENT");
    }

    #[test]
    fn plan_is_read_only() {
        assert!(SessionMode::Plan.is_read_only());
        assert!(!SessionMode::Agent.is_read_only());
    }

    #[test]
    fn mode_serde_matches_display() {
        let json = serde_json::to_string(&SessionMode::Plan).unwrap();
        assert_eq!(json, "\"plan\"");
    }

    #[test]
    fn role_roundtrips_through_str() {
        for role in [Role::User, Role::Assistant, Role::System] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("tool".parse::<Role>().is_err());
    }
}
