use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::password::Password;
use super::permission::Permissions;
use crate::Result;

/// One user entry in a group description
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserDescription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<Password>,
    #[serde(default)]
    pub permissions: Permissions,
}

/// The `locked` field: a bare boolean, or a message shown to clients
/// that are refused entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Locked {
    Flag(bool),
    Message(String),
}

impl Locked {
    #[must_use]
    pub fn is_locked(&self) -> bool {
        match self {
            Self::Flag(flag) => *flag,
            Self::Message(_) => true,
        }
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Flag(_) => None,
            Self::Message(message) => Some(message),
        }
    }
}

/// A public key used to verify stateless (signed) tokens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthKey {
    /// JWS algorithm name ("HS256", "ES256", ...)
    pub alg: String,
    /// Secret or PEM-encoded public key, depending on the algorithm
    pub key: String,
}

/// The declarative configuration of a group, one JSON file per group.
///
/// Unknown fields are rejected on load so that a typo in a description
/// file fails loudly rather than silently granting defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct GroupDescription {
    /// Filled from the file name, never serialized
    #[serde(skip)]
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,

    /// Listed in the public group directory
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub public: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_clients: Option<usize>,
    /// Chat history entries older than this many seconds are evicted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_history_age: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_history_size: Option<usize>,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub allow_recording: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub allow_anonymous: bool,
    /// Record join and leave events in the chat history
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub announce_joins: bool,

    /// Lock the group when the last operator leaves
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub auto_lock: bool,
    /// With no operator present, cap the group at this many clients;
    /// when the last operator leaves a larger group, everyone is kicked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_kick_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked: Option<Locked>,

    /// Accept stateless tokens signed by any configured key even when
    /// they grant permissions beyond the issuing user's.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub unrestricted_tokens: bool,

    /// Codec names in preference order
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub codecs: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub auth_keys: Vec<AuthKey>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub users: BTreeMap<String, UserDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wildcard_user: Option<UserDescription>,
}

impl GroupDescription {
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.as_ref().is_some_and(Locked::is_locked)
    }

    /// Strong ETag over the canonical JSON serialization
    pub fn etag(&self) -> Result<String> {
        let canonical = serde_json::to_vec(self)?;
        Ok(super::strong_etag(&canonical))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::permission::{Permission, Permissions};

    #[test]
    fn test_unknown_fields_rejected() {
        let r: std::result::Result<GroupDescription, _> =
            serde_json::from_str("{\"max-clients\": 10, \"max-cilents\": 10}");
        assert!(r.is_err());
    }

    #[test]
    fn test_parse_minimal() {
        let desc: GroupDescription = serde_json::from_str("{}").unwrap();
        assert!(!desc.public);
        assert!(desc.users.is_empty());
        assert!(!desc.is_locked());
    }

    #[test]
    fn test_parse_users_and_wildcard() {
        let desc: GroupDescription = serde_json::from_str(
            r#"{
                "max-clients": 12,
                "allow-anonymous": true,
                "users": {
                    "admin": {"password": "secret", "permissions": "op"}
                },
                "wildcard-user": {"password": {"type": "wildcard"}, "permissions": "presenter"}
            }"#,
        )
        .unwrap();
        assert_eq!(desc.max_clients, Some(12));
        let admin = &desc.users["admin"];
        assert!(admin.password.as_ref().unwrap().matches("secret"));
        assert!(admin
            .permissions
            .expand()
            .unwrap()
            .has(Permission::Op));
        assert!(desc.wildcard_user.is_some());
    }

    #[test]
    fn test_locked_forms() {
        let desc: GroupDescription = serde_json::from_str("{\"locked\": true}").unwrap();
        assert!(desc.is_locked());

        let desc: GroupDescription =
            serde_json::from_str("{\"locked\": \"closed for maintenance\"}").unwrap();
        assert!(desc.is_locked());
        assert_eq!(
            desc.locked.unwrap().message(),
            Some("closed for maintenance")
        );

        let desc: GroupDescription = serde_json::from_str("{\"locked\": false}").unwrap();
        assert!(!desc.is_locked());
    }

    #[test]
    fn test_etag_changes_with_content() {
        let mut desc = GroupDescription::default();
        let etag = desc.etag().unwrap();
        assert_eq!(etag, desc.etag().unwrap());

        desc.users.insert(
            "alice".to_string(),
            UserDescription {
                password: Some(Password::plain("x")),
                permissions: Permissions::Preset("observer".to_string()),
            },
        );
        assert_ne!(etag, desc.etag().unwrap());
    }

    #[test]
    fn test_name_not_serialized() {
        let desc = GroupDescription {
            name: "test".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_string(&desc).unwrap();
        assert!(!json.contains("test"));
    }
}
