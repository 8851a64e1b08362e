use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, FixedOffset, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A server-stored bearer token, revocable by deletion.
///
/// Timestamps keep the offset they were issued with, so a token file
/// written in one timezone round-trips unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatefulToken {
    pub token: String,
    pub group: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub include_subgroups: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<FixedOffset>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<FixedOffset>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<DateTime<FixedOffset>>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(b: &bool) -> bool {
    !*b
}

impl StatefulToken {
    /// Generate a fresh token value: 16 random bytes, base64url without
    /// padding.
    #[must_use]
    pub fn new_value() -> String {
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        URL_SAFE_NO_PAD.encode(raw)
    }

    /// Whether this token applies to `group`, honoring `includeSubgroups`.
    #[must_use]
    pub fn matches_group(&self, group: &str) -> bool {
        if self.group == group {
            return true;
        }
        self.include_subgroups && group.starts_with(&format!("{}/", self.group))
    }

    /// Validate this token for a join attempt.
    ///
    /// On success returns the effective username and the token's
    /// permissions. A token that binds a username overrides the one the
    /// client supplied; otherwise the client's username is used verbatim.
    /// A token without an expiry never expires.
    pub fn check(&self, group: &str, username: Option<&str>) -> Result<(String, Vec<String>)> {
        if !self.matches_group(group) {
            return Err(Error::Unauthorized("Token for wrong group".to_string()));
        }

        let now = Utc::now();
        if let Some(not_before) = self.not_before {
            if now < not_before {
                return Err(Error::Unauthorized("Token not yet valid".to_string()));
            }
        }
        if let Some(expires) = self.expires {
            if now >= expires {
                return Err(Error::Unauthorized("Token has expired".to_string()));
            }
        }

        let username = match &self.username {
            Some(bound) => bound.clone(),
            None => username.unwrap_or_default().to_string(),
        };
        Ok((username, self.permissions.clone()))
    }

    /// Strong ETag over the record's canonical JSON serialization
    pub fn etag(&self) -> Result<String> {
        let canonical = serde_json::to_vec(self)?;
        Ok(super::strong_etag(&canonical))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(group: &str, username: Option<&str>, subgroups: bool) -> StatefulToken {
        StatefulToken {
            token: "token".to_string(),
            group: group.to_string(),
            include_subgroups: subgroups,
            username: username.map(str::to_string),
            permissions: vec!["present".to_string(), "message".to_string()],
            expires: Some((Utc::now() + Duration::hours(1)).fixed_offset()),
            not_before: None,
            issued_by: None,
            issued_at: None,
        }
    }

    #[test]
    fn test_check_bound_username_overrides() {
        let t = token("group", Some("user"), false);
        let (username, permissions) = t.check("group", Some("user2")).unwrap();
        assert_eq!(username, "user");
        assert_eq!(permissions, vec!["present", "message"]);
    }

    #[test]
    fn test_check_unbound_username_accepts_caller() {
        let t = token("group", None, false);
        let (username, _) = t.check("group", Some("alice")).unwrap();
        assert_eq!(username, "alice");
        let (username, _) = t.check("group", None).unwrap();
        assert_eq!(username, "");
    }

    #[test]
    fn test_check_wrong_group() {
        let t = token("group", Some("user"), false);
        assert!(t.check("group2", Some("user")).is_err());
    }

    #[test]
    fn test_check_subgroups() {
        let t = token("room", Some("alice"), true);
        assert!(t.check("room/child", Some("alice")).is_ok());
        assert!(t.check("room", Some("alice")).is_ok());
        assert!(t.check("rooms", Some("alice")).is_err());

        let exact = token("room", Some("alice"), false);
        assert!(exact.check("room/child", Some("alice")).is_err());
    }

    #[test]
    fn test_check_expired() {
        let mut t = token("group", Some("user"), false);
        t.expires = Some((Utc::now() - Duration::hours(1)).fixed_offset());
        assert!(t.check("group", Some("user")).is_err());
    }

    #[test]
    fn test_check_without_expiry() {
        let mut t = token("group", Some("user"), false);
        t.expires = None;
        let (username, _) = t.check("group", Some("user")).unwrap();
        assert_eq!(username, "user");
    }

    #[test]
    fn test_check_not_before() {
        let mut t = token("group", Some("user"), false);
        t.not_before = Some((Utc::now() + Duration::minutes(30)).fixed_offset());
        assert!(t.check("group", Some("user")).is_err());
    }

    #[test]
    fn test_new_value_unique() {
        let a = StatefulToken::new_value();
        let b = StatefulToken::new_value();
        assert_ne!(a, b);
        assert!(a.len() >= 16);
    }

    #[test]
    fn test_etag_tracks_content() {
        let t = token("group", Some("user"), false);
        let mut u = t.clone();
        assert_eq!(t.etag().unwrap(), u.etag().unwrap());
        u.expires = Some((Utc::now() + Duration::hours(2)).fixed_offset());
        assert_ne!(t.etag().unwrap(), u.etag().unwrap());
    }

    #[test]
    fn test_json_preserves_offset() {
        let t = StatefulToken {
            token: "tok".to_string(),
            group: "g".to_string(),
            include_subgroups: false,
            username: None,
            permissions: vec![],
            expires: Some(
                DateTime::parse_from_rfc3339("2026-01-01T12:00:00+05:30").unwrap(),
            ),
            not_before: None,
            issued_by: None,
            issued_at: None,
        };
        let json = serde_json::to_string(&t).unwrap();
        assert!(json.contains("+05:30"));
        let u: StatefulToken = serde_json::from_str(&json).unwrap();
        assert_eq!(t, u);
    }
}
