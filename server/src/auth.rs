//! Session authentication with short-lived JWTs.
//!
//! Clients obtain a token from `POST /auth/login` and send it as
//! `Authorization: Bearer <token>` on every other request. Tokens are signed
//! with HS256 and expire after 15 minutes. An expired token can still be
//! exchanged for a fresh one through `POST /auth/renew` for up to 7 days after
//! it was first issued; renewal keeps the original `iat`.
//!
//! How a login is verified is pluggable through [`Authenticator`]:
//!
//! - [`DummyAuth`] - every login succeeds as `dummyuser` (development)
//! - [`PasswordAuth`] - username/password checked against argon2 hashes
//!
//! # Example
//!
//! ```rust
//! use chirp_server::auth::JwtAuth;
//!
//! let jwt = JwtAuth::new(b"not a secret");
//! let token = jwt.issue("paul").unwrap();
//! let claims = jwt.verify(&token).unwrap();
//! assert_eq!(claims.username, "paul");
//! ```

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use argon2::password_hash::{PasswordHash, PasswordVerifier};
use argon2::Argon2;
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ConfigError;

/// Lifetime of an issued token, in seconds (15 minutes).
pub const TOKEN_LIFETIME_SECS: i64 = 15 * 60;

/// How long after first issue an expired token may still be renewed, in
/// seconds (7 days).
pub const RENEW_WINDOW_SECS: i64 = 7 * 24 * 60 * 60;

/// Username reported by [`DummyAuth`].
pub const DUMMY_USER: &str = "dummyuser";

/// Errors that can occur while authenticating a request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No `Authorization` header (or `token` parameter) was supplied.
    #[error("no authorization header supplied")]
    MissingHeader,

    /// The `Authorization` header is not a bearer token.
    #[error("invalid authorization header")]
    InvalidHeader,

    /// The token's `exp` is in the past.
    #[error("expired token")]
    ExpiredToken,

    /// Signature, encoding, or claims are not valid.
    #[error("invalid token")]
    InvalidToken,

    /// The token expired and its renewal window has passed.
    #[error("unrenewable expired token")]
    UnrenewableToken,

    /// Login credentials were rejected.
    #[error("user authentication failed")]
    AuthenticationFailed,

    /// Signing a new token failed.
    #[error("failed to sign token: {0}")]
    Signing(String),
}

impl AuthError {
    /// Machine-readable code for error responses.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingHeader => "missing_token",
            Self::InvalidHeader => "invalid_header",
            Self::ExpiredToken => "expired_token",
            Self::InvalidToken => "invalid_token",
            Self::UnrenewableToken => "unrenewable_token",
            Self::AuthenticationFailed => "authentication_failed",
            Self::Signing(_) => "server_error",
        }
    }
}

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Authenticated username.
    pub username: String,

    /// Issued-at, seconds since the Unix epoch. Preserved across renewals.
    pub iat: i64,

    /// Expiry, seconds since the Unix epoch.
    pub exp: i64,
}

impl Claims {
    /// Claims for a fresh token issued now.
    #[must_use]
    pub fn issued_now(username: impl Into<String>) -> Self {
        let now = Utc::now().timestamp();
        Self {
            username: username.into(),
            iat: now,
            exp: now + TOKEN_LIFETIME_SECS,
        }
    }
}

/// Signs and verifies session tokens.
#[derive(Clone)]
pub struct JwtAuth {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl fmt::Debug for JwtAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtAuth").field("secret", &"<redacted>").finish()
    }
}

impl JwtAuth {
    /// Creates a signer/verifier from a shared HMAC secret.
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
        }
    }

    fn validation(validate_exp: bool) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = validate_exp;
        validation.set_required_spec_claims(&["exp", "iat"]);
        validation
    }

    /// Signs `claims` into a token.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Signing`] if encoding fails.
    pub fn encode(&self, claims: &Claims) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|err| AuthError::Signing(err.to_string()))
    }

    /// Issues a fresh 15-minute token for `username`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Signing`] if encoding fails.
    pub fn issue(&self, username: &str) -> Result<String, AuthError> {
        self.encode(&Claims::issued_now(username))
    }

    /// Verifies a token and returns its claims.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::ExpiredToken`] for an expired token and
    /// [`AuthError::InvalidToken`] for anything else that fails validation.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding_key, &Self::validation(true))
            .map(|data| data.claims)
            .map_err(map_jwt_error)
    }

    /// Exchanges a token for a new one with a fresh expiry.
    ///
    /// Valid tokens are always renewable. Expired tokens are renewable until
    /// [`RENEW_WINDOW_SECS`] after their original `iat`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::UnrenewableToken`] when the renewal window has
    /// passed, or [`AuthError::InvalidToken`] if the token is not genuine.
    pub fn renew(&self, token: &str) -> Result<String, AuthError> {
        let mut claims = match self.verify(token) {
            Ok(claims) => claims,
            Err(AuthError::ExpiredToken) => {
                let claims = decode::<Claims>(token, &self.decoding_key, &Self::validation(false))
                    .map(|data| data.claims)
                    .map_err(map_jwt_error)?;
                let renewable_until = claims.iat + RENEW_WINDOW_SECS;
                if renewable_until < Utc::now().timestamp() {
                    debug!(username = %claims.username, "Renewal window has passed");
                    return Err(AuthError::UnrenewableToken);
                }
                claims
            }
            Err(err) => return Err(err),
        };

        claims.exp = Utc::now().timestamp() + TOKEN_LIFETIME_SECS;
        self.encode(&claims)
    }
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::ExpiredToken,
        _ => {
            debug!(error = %err, "Token validation failed");
            AuthError::InvalidToken
        }
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header value.
///
/// # Errors
///
/// Returns [`AuthError::InvalidHeader`] for any other scheme.
pub fn bearer_token(header_value: &str) -> Result<&str, AuthError> {
    header_value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::InvalidHeader)
}

/// Login request body.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Decides who is logging in.
pub trait Authenticator: Send + Sync + fmt::Debug {
    /// Returns the authenticated username, or `None` to reject the login.
    fn authenticate(&self, credentials: Option<&Credentials>) -> Option<String>;
}

/// Accepts every login as [`DUMMY_USER`]. For testing and development.
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyAuth;

impl Authenticator for DummyAuth {
    fn authenticate(&self, _credentials: Option<&Credentials>) -> Option<String> {
        Some(DUMMY_USER.to_string())
    }
}

/// Verifies usernames and passwords against argon2 PHC hashes.
#[derive(Clone, Default)]
pub struct PasswordAuth {
    users: HashMap<String, String>,
}

impl fmt::Debug for PasswordAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordAuth")
            .field("users", &self.users.len())
            .finish()
    }
}

impl PasswordAuth {
    /// Creates an authenticator from `username -> password hash` pairs.
    #[must_use]
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }

    /// Loads users from a JSON file of the form `{"paul": "$argon2id$..."}`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidFormat`] if the file cannot be read or
    /// parsed, or if any entry is not a valid PHC hash.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidFormat {
            var: "CHIRP_USERS_FILE".to_string(),
            message,
        };

        let contents = fs::read_to_string(path)
            .map_err(|err| invalid(format!("cannot read {}: {err}", path.display())))?;
        let users: HashMap<String, String> = serde_json::from_str(&contents)
            .map_err(|err| invalid(format!("cannot parse {}: {err}", path.display())))?;

        if let Some((username, _)) = users
            .iter()
            .find(|(_, hash)| PasswordHash::new(hash).is_err())
        {
            return Err(invalid(format!("password hash for '{username}' is malformed")));
        }

        Ok(Self::new(users))
    }

    /// Number of known users.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

impl Authenticator for PasswordAuth {
    fn authenticate(&self, credentials: Option<&Credentials>) -> Option<String> {
        let credentials = credentials?;
        let hash = self.users.get(&credentials.username)?;
        let parsed = match PasswordHash::new(hash) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(username = %credentials.username, error = %err, "Stored password hash is malformed");
                return None;
            }
        };

        Argon2::default()
            .verify_password(credentials.password.as_bytes(), &parsed)
            .ok()
            .map(|()| credentials.username.clone())
    }
}
