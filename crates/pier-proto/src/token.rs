use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scopes signaling traffic to one negotiation attempt.
///
/// Fresh tokens are UUIDv7 (millisecond timestamp followed by random bits), so
/// two attempts never share a token and later attempts sort after earlier ones.
/// Tokens received from the wire are treated as opaque strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn generate() -> Self {
        Self(Uuid::now_v7().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
