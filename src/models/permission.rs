use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{Error, Result};

/// A single client capability within a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// Operator: may kick, lock, grant and revoke
    Op,
    /// May publish media
    Present,
    /// May record the group
    Record,
    /// May send chat messages
    Message,
    /// May mint tokens
    Token,
    /// May send captions
    Caption,
}

impl Permission {
    pub const ALL: [Self; 6] = [
        Self::Op,
        Self::Present,
        Self::Record,
        Self::Message,
        Self::Token,
        Self::Caption,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Op => "op",
            Self::Present => "present",
            Self::Record => "record",
            Self::Message => "message",
            Self::Token => "token",
            Self::Caption => "caption",
        }
    }

    /// Single-letter alias used for compact display
    #[must_use]
    pub const fn letter(&self) -> char {
        match self {
            Self::Op => 'o',
            Self::Present => 'p',
            Self::Record => 'r',
            Self::Message => 'm',
            Self::Token => 't',
            Self::Caption => 'c',
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "op" => Ok(Self::Op),
            "present" => Ok(Self::Present),
            "record" => Ok(Self::Record),
            "message" => Ok(Self::Message),
            "token" => Ok(Self::Token),
            "caption" => Ok(Self::Caption),
            _ => Err(Error::Invalid(format!("Unknown permission: {name}"))),
        }
    }

    pub fn from_letter(letter: char) -> Result<Self> {
        match letter {
            'o' => Ok(Self::Op),
            'p' => Ok(Self::Present),
            'r' => Ok(Self::Record),
            'm' => Ok(Self::Message),
            't' => Ok(Self::Token),
            'c' => Ok(Self::Caption),
            _ => Err(Error::Invalid(format!("Unknown permission letter: {letter}"))),
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An explicit set of permissions. Equality is set equality.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<Permission>);

impl PermissionSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn has(&self, permission: Permission) -> bool {
        self.0.contains(&permission)
    }

    pub fn grant(&mut self, permission: Permission) {
        self.0.insert(permission);
    }

    pub fn revoke(&mut self, permission: Permission) {
        self.0.remove(&permission);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Permission> + '_ {
        self.0.iter().copied()
    }

    /// Permission names in canonical order, the form carried by tokens
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|p| p.as_str().to_string()).collect()
    }

    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut set = Self::new();
        for name in names {
            set.grant(Permission::from_name(name.as_ref())?);
        }
        Ok(set)
    }

    /// Compact display form: the single-letter aliases, sorted
    #[must_use]
    pub fn format(&self) -> String {
        let mut letters: Vec<char> = self.0.iter().map(Permission::letter).collect();
        letters.sort_unstable();
        letters.into_iter().collect()
    }

    /// Inverse of [`format`](Self::format)
    pub fn parse(s: &str) -> Result<Self> {
        let mut set = Self::new();
        for letter in s.chars() {
            set.grant(Permission::from_letter(letter)?);
        }
        Ok(set)
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Expand a preset name into its permission set
#[must_use]
pub fn preset(name: &str) -> Option<PermissionSet> {
    use Permission::{Caption, Message, Op, Present, Token};
    let set: &[Permission] = match name {
        "op" => &[Op, Present, Token, Message],
        "presenter" => &[Present, Message],
        "observer" => &[Message],
        "admin" => &[Op, Token],
        "caption" => &[Caption, Message],
        _ => return None,
    };
    Some(set.iter().copied().collect())
}

/// Permissions as persisted in a user description: either a preset name,
/// kept for human readability, or an explicit array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Permissions {
    Preset(String),
    List(Vec<Permission>),
}

impl Permissions {
    pub fn expand(&self) -> Result<PermissionSet> {
        match self {
            Self::Preset(name) => preset(name)
                .ok_or_else(|| Error::Invalid(format!("Unknown permission preset: {name}"))),
            Self::List(list) => Ok(list.iter().copied().collect()),
        }
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_sorted() {
        let set: PermissionSet = [Permission::Token, Permission::Op, Permission::Message]
            .into_iter()
            .collect();
        assert_eq!(set.format(), "mot");
    }

    #[test]
    fn test_parse_format_round_trip() {
        for name in ["op", "presenter", "observer", "admin", "caption"] {
            let set = preset(name).unwrap();
            assert_eq!(PermissionSet::parse(&set.format()).unwrap(), set);
        }
        let empty = PermissionSet::new();
        assert_eq!(PermissionSet::parse(&empty.format()).unwrap(), empty);
    }

    #[test]
    fn test_parse_unknown_letter() {
        assert!(PermissionSet::parse("ox").is_err());
    }

    #[test]
    fn test_preset_expansion() {
        let op = preset("op").unwrap();
        assert!(op.has(Permission::Op));
        assert!(op.has(Permission::Present));
        assert!(op.has(Permission::Token));
        assert!(op.has(Permission::Message));
        assert!(!op.has(Permission::Record));

        let observer = preset("observer").unwrap();
        assert_eq!(observer.names(), vec!["message".to_string()]);

        assert!(preset("superuser").is_none());
    }

    #[test]
    fn test_permissions_json_forms() {
        let p: Permissions = serde_json::from_str("\"presenter\"").unwrap();
        assert_eq!(
            p.expand().unwrap(),
            [Permission::Present, Permission::Message]
                .into_iter()
                .collect()
        );

        let p: Permissions = serde_json::from_str("[\"present\", \"message\"]").unwrap();
        assert_eq!(
            p.expand().unwrap(),
            [Permission::Present, Permission::Message]
                .into_iter()
                .collect()
        );

        let p: Permissions = serde_json::from_str("\"no-such-preset\"").unwrap();
        assert!(p.expand().is_err());
    }

    #[test]
    fn test_set_equality_ignores_order() {
        let a = PermissionSet::from_names(&["present", "message"]).unwrap();
        let b = PermissionSet::from_names(&["message", "present"]).unwrap();
        assert_eq!(a, b);
    }
}
