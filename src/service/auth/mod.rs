//! Authentication
//!
//! Given a group name and a credential, resolve the effective username
//! and permission set, or reject. Password, stateful-token and
//! stateless (signed) token paths all come through here.

use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use serde::Deserialize;
use std::sync::Arc;
use tokio::task;
use tracing::warn;

use crate::models::group::{AuthKey, GroupDescription};
use crate::models::{PermissionSet, UserDescription};
use crate::service::descriptions::DescriptionStore;
use crate::service::token_store::TokenStore;
use crate::{Error, Result};

/// The credential presented on join
#[derive(Debug, Clone)]
pub enum Credential {
    Password(String),
    /// Either a stateful token value or a signed (stateless) token
    Token(String),
}

pub struct Authenticator {
    descriptions: Arc<DescriptionStore>,
    tokens: Arc<TokenStore>,
}

impl Authenticator {
    #[must_use]
    pub fn new(descriptions: Arc<DescriptionStore>, tokens: Arc<TokenStore>) -> Self {
        Self {
            descriptions,
            tokens,
        }
    }

    #[must_use]
    pub fn token_store(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    /// Authenticate a join attempt.
    ///
    /// Returns the effective username and permission set. Failures are
    /// deliberately uninformative about which part of the credential was
    /// wrong.
    pub async fn authenticate(
        &self,
        group: &str,
        username: Option<&str>,
        credential: &Credential,
    ) -> Result<(String, PermissionSet)> {
        let desc = self.descriptions.get(group)?;

        match credential {
            Credential::Token(value) => self.check_token(&desc, group, username, value),
            Credential::Password(password) => {
                self.check_password(&desc, username, password).await
            }
        }
    }

    fn check_token(
        &self,
        desc: &GroupDescription,
        group: &str,
        username: Option<&str>,
        value: &str,
    ) -> Result<(String, PermissionSet)> {
        match self.tokens.get(value) {
            Ok((token, _etag)) => {
                let (username, permissions) = token.check(group, username)?;
                let permissions = PermissionSet::from_names(&permissions)?;
                Ok((username, permissions))
            }
            Err(Error::NotFound(_)) => check_stateless(desc, group, username, value),
            Err(e) => Err(e),
        }
    }

    async fn check_password(
        &self,
        desc: &GroupDescription,
        username: Option<&str>,
        password: &str,
    ) -> Result<(String, PermissionSet)> {
        let username = username.unwrap_or("");
        if username.is_empty() && !desc.allow_anonymous {
            return Err(Error::Unauthorized("Username required".to_string()));
        }

        let user: &UserDescription = match desc.users.get(username) {
            Some(user) => user,
            None => desc
                .wildcard_user
                .as_ref()
                .ok_or_else(|| Error::Unauthorized("Not authorized".to_string()))?,
        };
        let permissions = user.permissions.expand()?;
        let record = user
            .password
            .clone()
            .ok_or_else(|| Error::Unauthorized("Not authorized".to_string()))?;

        // password verification is CPU-bound, keep it off the runtime
        let password = password.to_string();
        let matched = task::spawn_blocking(move || record.matches(&password))
            .await
            .map_err(|e| Error::Internal(format!("Password verification task failed: {e}")))?;
        if !matched {
            return Err(Error::Unauthorized("Not authorized".to_string()));
        }
        Ok((username.to_string(), permissions))
    }
}

/// Claims carried by a stateless token. Permissions come pre-expanded,
/// like in stateful tokens.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatelessClaims {
    #[serde(default)]
    sub: Option<String>,
    group: String,
    #[serde(default)]
    include_subgroups: bool,
    #[serde(default)]
    permissions: Vec<String>,
}

fn check_stateless(
    desc: &GroupDescription,
    group: &str,
    username: Option<&str>,
    value: &str,
) -> Result<(String, PermissionSet)> {
    if desc.auth_keys.is_empty() {
        return Err(Error::Unauthorized("Unknown token".to_string()));
    }

    let mut last = Error::Unauthorized("Invalid token".to_string());
    for key in &desc.auth_keys {
        match verify_stateless(key, value) {
            Ok(claims) => {
                if !group_matches(&claims.group, claims.include_subgroups, group) {
                    return Err(Error::Unauthorized("Token for wrong group".to_string()));
                }
                let effective = match claims.sub {
                    Some(bound) => bound,
                    None => username.unwrap_or_default().to_string(),
                };
                let permissions = PermissionSet::from_names(&claims.permissions)?;
                return Ok((effective, permissions));
            }
            Err(e) => last = e,
        }
    }
    Err(last)
}

fn verify_stateless(key: &AuthKey, value: &str) -> Result<StatelessClaims> {
    let algorithm: Algorithm = key
        .alg
        .parse()
        .map_err(|_| Error::Invalid(format!("Unknown token algorithm: {}", key.alg)))?;
    let decoding_key = decoding_key(algorithm, &key.key)?;

    let mut validation = Validation::new(algorithm);
    validation.validate_exp = true;
    validation.validate_nbf = true;
    validation.leeway = 60; // 60 seconds leeway for clock skew
    validation.validate_aud = false;
    validation.set_required_spec_claims(&["exp"]);

    let data: TokenData<StatelessClaims> =
        decode(value, &decoding_key, &validation).map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                Error::Unauthorized("Token has expired".to_string())
            }
            jsonwebtoken::errors::ErrorKind::ImmatureSignature => {
                Error::Unauthorized("Token not yet valid".to_string())
            }
            _ => Error::Unauthorized("Invalid token".to_string()),
        })?;
    Ok(data.claims)
}

fn decoding_key(algorithm: Algorithm, key: &str) -> Result<DecodingKey> {
    match algorithm {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
            Ok(DecodingKey::from_secret(key.as_bytes()))
        }
        Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(key.as_bytes())
            .map_err(|e| bad_key(&e)),
        Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 | Algorithm::PS256
        | Algorithm::PS384 | Algorithm::PS512 => {
            DecodingKey::from_rsa_pem(key.as_bytes()).map_err(|e| bad_key(&e))
        }
        Algorithm::EdDSA => DecodingKey::from_ed_pem(key.as_bytes()).map_err(|e| bad_key(&e)),
    }
}

fn bad_key(e: &jsonwebtoken::errors::Error) -> Error {
    warn!("Bad auth key in group description: {e}");
    Error::Invalid(format!("Bad auth key: {e}"))
}

fn group_matches(claim: &str, include_subgroups: bool, group: &str) -> bool {
    if claim == group {
        return true;
    }
    include_subgroups && group.starts_with(&format!("{claim}/"))
}
