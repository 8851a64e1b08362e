use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::ClientId;

/// One entry in a group's bounded chat history.
///
/// `kind` is the protocol-level message kind: empty for an ordinary chat
/// message, "me" for an action message, "join" or "leave" for membership
/// announcements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ClientId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    pub value: serde_json::Value,
}

impl ChatEntry {
    pub fn new(
        source: Option<ClientId>,
        username: Option<String>,
        kind: &str,
        value: serde_json::Value,
    ) -> Self {
        Self {
            id: super::id::generate_id(),
            source,
            username,
            time: Utc::now(),
            kind: kind.to_string(),
            value,
        }
    }

    #[must_use]
    pub fn is_announcement(&self) -> bool {
        self.kind == "join" || self.kind == "leave"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entry() {
        let entry = ChatEntry::new(
            Some(ClientId::from("c1")),
            Some("alice".to_string()),
            "",
            serde_json::json!("hello"),
        );
        assert_eq!(entry.id.len(), 12);
        assert!(!entry.is_announcement());
    }

    #[test]
    fn test_announcement() {
        let entry = ChatEntry::new(None, Some("bob".to_string()), "join", serde_json::Value::Null);
        assert!(entry.is_announcement());
    }
}
