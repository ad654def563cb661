//! Session identifier type

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a session, assigned by the server
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Create a new session ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw ID value
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is empty (connection level frames)
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_display() {
        let id = SessionId::new("a1b2");
        assert_eq!(format!("{}", id), "a1b2");
    }

    #[test]
    fn test_session_id_equality() {
        let id1 = SessionId::from("one");
        let id2 = SessionId::new("one".to_string());
        let id3 = SessionId::from("two");

        assert_eq!(id1, id2);
        assert_ne!(id1, id3);
        assert!(SessionId::default().is_empty());
    }
}
