pub mod chat;
pub mod group;
pub mod id;
pub mod password;
pub mod permission;
pub mod token;

pub use chat::ChatEntry;
pub use group::{GroupDescription, Locked, UserDescription};
pub use id::{generate_id, ClientId, ConnId};
pub use password::Password;
pub use permission::{Permission, PermissionSet, Permissions};
pub use token::StatefulToken;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

/// Strong ETag over a canonical serialization: SHA-256, base64url without
/// padding, wrapped in double quotes.
#[must_use]
pub fn strong_etag(canonical: &[u8]) -> String {
    let digest = Sha256::digest(canonical);
    format!("\"{}\"", URL_SAFE_NO_PAD.encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strong_etag_is_quoted_and_deterministic() {
        let a = strong_etag(b"hello");
        let b = strong_etag(b"hello");
        let c = strong_etag(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with('"') && a.ends_with('"'));
    }
}
