use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Last eight characters, for status lines. The leading
            /// characters of a v7 uuid are the timestamp, so the tail is
            /// what tells ids minted together apart.
            pub fn short(&self) -> &str {
                let body = self
                    .0
                    .strip_prefix(concat!($prefix, "_"))
                    .unwrap_or(&self.0);
                body.len()
                    .checked_sub(8)
                    .and_then(|start| body.get(start..))
                    .unwrap_or(body)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(ProjectId, "proj");
branded_id!(SessionId, "sess");
branded_id!(MessageId, "msg");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_have_prefixes() {
        assert!(ProjectId::new().as_str().starts_with("proj_"));
        assert!(SessionId::new().as_str().starts_with("sess_"));
        assert!(MessageId::new().as_str().starts_with("msg_"));
    }

    #[test]
    fn ids_are_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn serde_is_transparent() {
        let id = ProjectId::from_raw("proj_abc");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"proj_abc\"");
    }

    #[test]
    fn short_is_the_tail() {
        let id = SessionId::from_raw("sess_0123456789abcdef");
        assert_eq!(id.short(), "89abcdef");

        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a.short(), b.short());

        let raw = SessionId::from_raw("tiny");
        assert_eq!(raw.short(), "tiny");
    }

    #[test]
    fn monotonic_ordering() {
        let ids: Vec<MessageId> = (0..100).map(|_| MessageId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0] < w[1], "not monotonic: {} >= {}", w[0], w[1]);
        }
    }
}
