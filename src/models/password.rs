use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize};
use subtle::ConstantTimeEq;

use crate::{Error, Result};

/// Default bcrypt cost
pub const BCRYPT_COST: u32 = 8;
/// Default PBKDF2 iteration count
pub const PBKDF2_ITERATIONS: u32 = 4096;
/// Default PBKDF2 derived key length in bytes
pub const PBKDF2_KEY_LENGTH: usize = 32;
/// Default PBKDF2 salt length in bytes
pub const PBKDF2_SALT_LENGTH: usize = 8;

/// A stored password record.
///
/// The JSON form is tagged by `type`; a bare JSON string is accepted as
/// shorthand for a plaintext record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Password {
    Plain {
        key: String,
    },
    Bcrypt {
        key: String,
    },
    Pbkdf2 {
        hash: String,
        key: String,
        salt: String,
        iterations: u32,
    },
    /// Matches any password, including the empty one
    Wildcard,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum PasswordRecord {
    Plain {
        key: String,
    },
    Bcrypt {
        key: String,
    },
    Pbkdf2 {
        hash: String,
        key: String,
        salt: String,
        iterations: u32,
    },
    Wildcard,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PasswordRepr {
    Literal(String),
    Record(PasswordRecord),
}

impl<'de> Deserialize<'de> for Password {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let repr = PasswordRepr::deserialize(deserializer)?;
        Ok(match repr {
            PasswordRepr::Literal(key) => Self::Plain { key },
            PasswordRepr::Record(PasswordRecord::Plain { key }) => Self::Plain { key },
            PasswordRepr::Record(PasswordRecord::Bcrypt { key }) => Self::Bcrypt { key },
            PasswordRepr::Record(PasswordRecord::Pbkdf2 {
                hash,
                key,
                salt,
                iterations,
            }) => Self::Pbkdf2 {
                hash,
                key,
                salt,
                iterations,
            },
            PasswordRepr::Record(PasswordRecord::Wildcard) => Self::Wildcard,
        })
    }
}

impl Password {
    /// Hash a password with bcrypt. `cost` must lie in [4, 31].
    pub fn bcrypt(password: &str, cost: Option<u32>) -> Result<Self> {
        let cost = cost.unwrap_or(BCRYPT_COST);
        if !(4..=31).contains(&cost) {
            return Err(Error::Invalid(format!("Bad bcrypt cost: {cost}")));
        }
        let key = bcrypt::hash(password, cost)
            .map_err(|e| Error::Internal(format!("Failed to hash password: {e}")))?;
        Ok(Self::Bcrypt { key })
    }

    /// Derive a PBKDF2-SHA256 record with a fresh random salt
    pub fn pbkdf2(
        password: &str,
        iterations: Option<u32>,
        key_length: Option<usize>,
        salt_length: Option<usize>,
    ) -> Result<Self> {
        let iterations = iterations.unwrap_or(PBKDF2_ITERATIONS);
        if iterations == 0 {
            return Err(Error::Invalid("Bad PBKDF2 iteration count".to_string()));
        }
        let mut salt = vec![0u8; salt_length.unwrap_or(PBKDF2_SALT_LENGTH)];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut key = vec![0u8; key_length.unwrap_or(PBKDF2_KEY_LENGTH)];
        pbkdf2::pbkdf2_hmac::<sha2::Sha256>(password.as_bytes(), &salt, iterations, &mut key);
        Ok(Self::Pbkdf2 {
            hash: "sha-256".to_string(),
            key: hex::encode(key),
            salt: hex::encode(salt),
            iterations,
        })
    }

    #[must_use]
    pub fn plain(password: &str) -> Self {
        Self::Plain {
            key: password.to_string(),
        }
    }

    #[must_use]
    pub const fn wildcard() -> Self {
        Self::Wildcard
    }

    /// Check a password against this record.
    ///
    /// A malformed record of a known type fails to match rather than
    /// returning an error; unknown record types are rejected at
    /// deserialization time.
    #[must_use]
    pub fn matches(&self, password: &str) -> bool {
        match self {
            Self::Wildcard => true,
            Self::Plain { key } => key.as_bytes().ct_eq(password.as_bytes()).into(),
            Self::Bcrypt { key } => bcrypt::verify(password, key).unwrap_or(false),
            Self::Pbkdf2 {
                hash,
                key,
                salt,
                iterations,
            } => {
                if hash != "sha-256" || *iterations == 0 {
                    return false;
                }
                let (Ok(key), Ok(salt)) = (hex::decode(key), hex::decode(salt)) else {
                    return false;
                };
                if key.is_empty() {
                    return false;
                }
                let mut derived = vec![0u8; key.len()];
                pbkdf2::pbkdf2_hmac::<sha2::Sha256>(
                    password.as_bytes(),
                    &salt,
                    *iterations,
                    &mut derived,
                );
                derived.ct_eq(&key).into()
            }
        }
    }
}
