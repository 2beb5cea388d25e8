//! Error types for the Chirp server.
//!
//! [`ServerError`] is the top-level error returned by request handlers. It
//! converts into an HTTP response carrying a JSON body of the form
//! `{"error": "...", "code": "..."}`.
//!
//! # Example
//!
//! ```rust
//! use chirp_server::error::ServerError;
//! use chirp_server::replay::ResyncImpossible;
//!
//! let err: ServerError = ResyncImpossible { last_id: 3 }.into();
//! assert!(err.is_client_error());
//! ```

use std::error::Error;
use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::replay::ResyncImpossible;
use crate::topic::TopicLimitReached;

/// Top-level error type for the Chirp server.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error during startup.
    Config(ConfigError),

    /// Authentication or authorization failure.
    Auth(AuthError),

    /// Request body or parameters failed validation.
    Validation(String),

    /// The requested resource does not exist.
    ///
    /// Also used when a client asks to resume a stream from an event that is
    /// no longer in the replay log.
    NotFound(String),

    /// The server refuses to allocate more resources, such as a new room.
    Unavailable(String),

    /// Unexpected internal server error.
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::Auth(err) => write!(f, "authentication failed: {err}"),
            Self::Validation(msg) => write!(f, "validation error: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Unavailable(msg) => write!(f, "unavailable: {msg}"),
            Self::Internal(msg) => write!(f, "internal server error: {msg}"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Auth(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<AuthError> for ServerError {
    fn from(err: AuthError) -> Self {
        Self::Auth(err)
    }
}

impl From<ResyncImpossible> for ServerError {
    fn from(err: ResyncImpossible) -> Self {
        Self::NotFound(err.to_string())
    }
}

impl From<TopicLimitReached> for ServerError {
    fn from(err: TopicLimitReached) -> Self {
        Self::Unavailable(err.to_string())
    }
}

impl ServerError {
    /// Creates a new validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a new not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Creates a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// HTTP status code for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Auth(AuthError::Signing(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code included in the response body.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "server_error",
            Self::Auth(err) => err.code(),
            Self::Validation(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Returns `true` if this error indicates a client-side problem.
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }

    /// Returns `true` if this error indicates a server-side problem.
    pub fn is_server_error(&self) -> bool {
        self.status().is_server_error()
    }
}

/// JSON error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable description.
    pub error: String,

    /// Machine-readable code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    /// Creates a response body without a code.
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    /// Attaches a machine-readable code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if self.is_server_error() {
            error!(error = %self, "Request failed");
        }

        // Internal details stay in the log.
        let message = match &self {
            Self::Validation(msg) | Self::NotFound(msg) | Self::Unavailable(msg) => msg.clone(),
            Self::Auth(err) if status.is_client_error() => err.to_string(),
            _ => "internal server error".to_string(),
        };

        (
            status,
            Json(ErrorResponse::new(message).with_code(self.code())),
        )
            .into_response()
    }
}

/// A specialized Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_validation_displays_correctly() {
        let err = ServerError::validation("missing field `message`");
        assert_eq!(err.to_string(), "validation error: missing field `message`");
    }

    #[test]
    fn server_error_not_found_displays_correctly() {
        let err = ServerError::not_found("no such room");
        assert_eq!(err.to_string(), "not found: no such room");
    }

    #[test]
    fn server_error_internal_displays_correctly() {
        let err = ServerError::internal("users file unreadable");
        assert_eq!(
            err.to_string(),
            "internal server error: users file unreadable"
        );
    }

    #[test]
    fn server_error_auth_displays_correctly() {
        let err = ServerError::from(AuthError::ExpiredToken);
        assert_eq!(err.to_string(), "authentication failed: expired token");
    }

    #[test]
    fn resync_impossible_converts_to_not_found() {
        let err: ServerError = ResyncImpossible { last_id: 5 }.into();
        assert!(matches!(err, ServerError::NotFound(_)));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn topic_limit_converts_to_unavailable() {
        let err: ServerError = TopicLimitReached { limit: 8 }.into();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code(), "unavailable");
        assert_eq!(err.to_string(), "unavailable: topic limit of 8 reached");
    }

    #[test]
    fn config_error_converts_to_server_error() {
        let err: ServerError = ConfigError::MissingEnvVar("CHIRP_JWT_SECRET".into()).into();
        assert!(matches!(err, ServerError::Config(_)));
        assert!(err.source().is_some());
        assert!(err.is_server_error());
    }

    #[test]
    fn status_codes_match_variants() {
        assert_eq!(
            ServerError::from(AuthError::MissingHeader).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ServerError::validation("x").status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ServerError::internal("x").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn signing_failure_is_server_error() {
        let err = ServerError::from(AuthError::Signing("bad key".into()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.is_server_error());
    }

    #[test]
    fn is_client_error_classification() {
        assert!(ServerError::validation("bad").is_client_error());
        assert!(ServerError::not_found("gone").is_client_error());
        assert!(ServerError::from(AuthError::InvalidToken).is_client_error());
        assert!(!ServerError::internal("oops").is_client_error());
    }

    #[test]
    fn source_is_none_for_message_variants() {
        assert!(ServerError::validation("x").source().is_none());
        assert!(ServerError::not_found("x").source().is_none());
        assert!(ServerError::Unavailable("x".into()).source().is_none());
        assert!(ServerError::internal("x").source().is_none());
    }

    #[test]
    fn error_response_skips_missing_code() {
        let body = serde_json::to_value(ErrorResponse::new("boom")).unwrap();
        assert_eq!(body, serde_json::json!({"error": "boom"}));

        let body = serde_json::to_value(ErrorResponse::new("boom").with_code("x")).unwrap();
        assert_eq!(body, serde_json::json!({"error": "boom", "code": "x"}));
    }

    #[test]
    fn internal_errors_hide_details_in_response() {
        let response = ServerError::internal("secret path /etc/users.json").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
