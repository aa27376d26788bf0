//! Participant identity
//!
//! Participants are identified by an opaque id issued by the (external)
//! authentication layer. The email is display metadata only and plays no
//! part in negotiation.

use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Opaque participant identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    /// Create a new participant identifier
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A call participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Identifier
    pub id: ParticipantId,
    /// Display email
    pub email: Option<String>,
}

impl Participant {
    /// Participant with an id only
    pub fn new(id: impl Into<ParticipantId>) -> Self {
        Self {
            id: id.into(),
            email: None,
        }
    }

    /// Attach a display email
    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Email if known, otherwise the id
    pub fn display_name(&self) -> &str {
        self.email.as_deref().unwrap_or_else(|| self.id.as_str())
    }
}

impl Display for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_display() {
        let alice = Participant::new("uid-alice").with_email("alice@example.com");
        assert_eq!(alice.to_string(), "alice@example.com");

        let bob = Participant::new("uid-bob");
        assert_eq!(bob.display_name(), "uid-bob");
    }

    #[test]
    fn test_participant_id_serialization() {
        let id = ParticipantId::new("uid-alice");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"uid-alice\"");
        let back: ParticipantId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
