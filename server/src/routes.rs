//! HTTP route handlers for the Chirp server.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `POST /auth/login` - Exchange credentials for a session token
//! - `POST /auth/renew` - Exchange a session token for a fresh one
//! - `POST /messages` - Publish a chat message to the default channel
//! - `POST /rooms/{room}/messages` - Publish a chat message to a room
//! - `GET /events` - Server-sent event stream of the default channel
//! - `GET /rooms/{room}/events` - Server-sent event stream of a room
//! - `GET /health` - Health check endpoint
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`], which contains:
//! - Configuration (including auth settings)
//! - Event broadcaster holding topics, subscribers and replay logs
//! - Token signer and login authenticator
//! - Server start time for uptime reporting
//!
//! Message and event routes sit behind [`require_auth`], which attaches the
//! caller's [`AuthenticatedUser`] to the request.
//!
//! # Example
//!
//! ```rust,no_run
//! use chirp_server::routes::{create_router, AppState};
//! use chirp_server::config::Config;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let listen_addr = config.listen_addr();
//!     let state = AppState::new(config).expect("failed to build state");
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind(listen_addr).await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, Query, Request, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::{bearer_token, AuthError, Authenticator, Credentials, DummyAuth, JwtAuth, PasswordAuth};
use crate::broadcast::EventBroadcaster;
use crate::config::{Config, ConfigError};
use crate::error::ServerError;
use crate::sse;
use crate::timestamp;

// ============================================================================
// Constants
// ============================================================================

/// Event type of published chat messages.
pub const MESSAGE_EVENT: &str = "message";

/// Username attached to requests when authentication is disabled.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Maximum request body size (64 KB).
const MAX_BODY_SIZE: usize = 64 * 1024;

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Topics, subscribers and replay logs.
    pub broadcaster: EventBroadcaster,

    /// Token signer; `None` only when authentication is disabled and no
    /// secret was configured.
    pub jwt: Option<JwtAuth>,

    /// Decides who may log in.
    pub authenticator: Arc<dyn Authenticator>,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates application state from configuration.
    ///
    /// Loads the users file when one is configured; otherwise every login
    /// succeeds as the dummy user.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the users file cannot be loaded, or if
    /// authentication is enabled without a token secret.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        let authenticator: Arc<dyn Authenticator> = match &config.users_file {
            Some(path) => {
                let users = PasswordAuth::from_file(path)?;
                info!(path = %path.display(), user_count = users.user_count(), "Loaded users file");
                Arc::new(users)
            }
            None => Arc::new(DummyAuth),
        };

        let jwt = config
            .jwt_secret
            .as_deref()
            .map(|secret| JwtAuth::new(secret.as_bytes()));
        if jwt.is_none() && !config.unsafe_no_auth {
            return Err(ConfigError::MissingEnvVar("CHIRP_JWT_SECRET".to_string()));
        }

        let broadcaster = EventBroadcaster::with_config(config.broadcaster_config());
        Ok(Self::with_components(config, broadcaster, jwt, authenticator))
    }

    /// Creates application state from prebuilt parts.
    ///
    /// Useful for testing or when a custom authenticator is needed.
    #[must_use]
    pub fn with_components(
        config: Config,
        broadcaster: EventBroadcaster,
        jwt: Option<JwtAuth>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            broadcaster,
            jwt,
            authenticator,
            start_time: Instant::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"<Config>")
            .field("broadcaster", &self.broadcaster)
            .field("jwt", &self.jwt)
            .field("authenticator", &self.authenticator)
            .field("start_time", &self.start_time)
            .finish()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
///
/// `/health` and `/auth/*` are public. Everything else requires a session
/// token unless `unsafe_no_auth` is set.
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/messages", post(post_message))
        .route("/rooms/{room}/messages", post(post_room_message))
        .route("/events", get(get_events))
        .route("/rooms/{room}/events", get(get_room_events))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    // Only the path is recorded: event stream URIs can carry a token.
    let trace_layer =
        TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            tracing::debug_span!(
                "http.request",
                method = %request.method(),
                path = %request.uri().path(),
                version = ?request.version()
            )
        });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/auth/login", post(post_login))
        .route("/auth/renew", post(post_renew))
        .route("/health", get(get_health))
        .merge(protected)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(trace_layer)
        .layer(cors)
        .with_state(state)
}

/// Decodes a JSON body into `T`, reporting every rejection as 422.
fn json_body<T: DeserializeOwned>(payload: Result<Json<Value>, JsonRejection>) -> Result<T, ServerError> {
    let Json(value) = payload.map_err(|rejection| ServerError::validation(rejection.body_text()))?;
    object_body(value)
}

/// Decodes `T` from a JSON object.
///
/// Derived struct impls also accept arrays, so the shape is checked first.
fn object_body<T: DeserializeOwned>(value: Value) -> Result<T, ServerError> {
    if !value.is_object() {
        return Err(ServerError::validation("request body must be a JSON object"));
    }
    serde_json::from_value(value)
        .map_err(|err| ServerError::validation(format!("invalid request body: {err}")))
}

// ============================================================================
// Authentication middleware
// ============================================================================

/// Username of the caller, attached to requests by [`require_auth`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Finds the session token of a request.
///
/// The `Authorization` header wins. `GET` requests may instead carry a
/// `token` query parameter, since `EventSource` cannot set headers.
fn request_token(headers: &HeaderMap, method: &Method, uri: &Uri) -> Result<String, AuthError> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        let value = value.to_str().map_err(|_| AuthError::InvalidHeader)?;
        return bearer_token(value).map(str::to_string);
    }

    if method == Method::GET {
        if let Ok(Query(TokenQuery { token: Some(token) })) = Query::<TokenQuery>::try_from_uri(uri) {
            if !token.is_empty() {
                return Ok(token);
            }
        }
    }

    Err(AuthError::MissingHeader)
}

/// Verifies the caller's session token and records who they are.
///
/// # Errors
///
/// Responds 401 for a missing, malformed, expired or forged token.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ServerError> {
    let user = if state.config.unsafe_no_auth {
        AuthenticatedUser(ANONYMOUS_USER.to_string())
    } else {
        let jwt = state
            .jwt
            .as_ref()
            .ok_or_else(|| ServerError::internal("token secret not configured"))?;
        let token = request_token(request.headers(), request.method(), request.uri())
            .inspect_err(|err| debug!(error = %err, path = %request.uri().path(), "Rejected request"))?;
        let claims = jwt
            .verify(&token)
            .inspect_err(|err| debug!(error = %err, path = %request.uri().path(), "Rejected token"))?;
        AuthenticatedUser(claims.username)
    };

    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

// ============================================================================
// POST /auth/login, POST /auth/renew
// ============================================================================

/// Response body carrying a session token.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

/// Request body of `POST /auth/renew`.
#[derive(Debug, Deserialize)]
pub struct RenewRequest {
    pub token: String,
}

fn signer(state: &AppState) -> Result<&JwtAuth, ServerError> {
    state
        .jwt
        .as_ref()
        .ok_or_else(|| ServerError::not_found("token authentication is not configured"))
}

/// POST /auth/login - Exchange credentials for a session token.
///
/// The body is optional: authenticators that ignore credentials accept an
/// empty request.
///
/// # Responses
///
/// - `200 OK` - `{"token": "..."}`
/// - `401 Unauthorized` - Credentials rejected
/// - `422 Unprocessable Entity` - Body is not a credentials object
async fn post_login(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<TokenResponse>, ServerError> {
    let jwt = signer(&state)?;
    let credentials: Option<Credentials> = if body.is_empty() {
        None
    } else {
        let value = serde_json::from_slice(&body)
            .map_err(|err| ServerError::validation(format!("invalid credentials: {err}")))?;
        Some(object_body(value)?)
    };

    // Argon2 verification blocks for a noticeable time.
    let authenticator = Arc::clone(&state.authenticator);
    let username = tokio::task::spawn_blocking(move || authenticator.authenticate(credentials.as_ref()))
        .await
        .map_err(|err| ServerError::internal(format!("authentication task failed: {err}")))?
        .ok_or(AuthError::AuthenticationFailed)?;

    let token = jwt.issue(&username)?;
    info!(username = %username, "User logged in");
    Ok(Json(TokenResponse { token }))
}

/// POST /auth/renew - Exchange a session token for one with a fresh expiry.
///
/// Expired tokens remain renewable for a week after they were first issued.
async fn post_renew(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<TokenResponse>, ServerError> {
    let request: RenewRequest = json_body(payload)?;
    let token = signer(&state)?.renew(&request.token)?;
    debug!("Token renewed");
    Ok(Json(TokenResponse { token }))
}

// ============================================================================
// POST /messages, POST /rooms/{room}/messages
// ============================================================================

/// Request body for publishing a chat message.
#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    /// Message text.
    pub message: String,

    /// Client send time as produced by `JSON.stringify(new Date())`.
    /// Defaults to the time the server received the message.
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// A published chat message; also the data of its `message` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub author: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

fn publish_message(
    state: &AppState,
    room: Option<&str>,
    AuthenticatedUser(author): AuthenticatedUser,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<ChatMessage>), ServerError> {
    let request: MessageRequest = json_body(payload)?;
    let timestamp = timestamp::timestamp(request.timestamp.as_deref())
        .map_err(|err| ServerError::validation(format!("invalid timestamp: {err}")))?;

    let message = ChatMessage {
        id: Uuid::new_v4(),
        author,
        message: request.message,
        timestamp,
    };
    let data = serde_json::to_value(&message)
        .map_err(|err| ServerError::internal(format!("failed to encode message: {err}")))?;

    let event_id = state.broadcaster.try_publish(MESSAGE_EVENT, data, room)?;
    info!(
        event_id,
        room = room.unwrap_or_default(),
        author = %message.author,
        "Message published"
    );

    Ok((StatusCode::ACCEPTED, Json(message)))
}

/// POST /messages - Publish to the default channel.
///
/// # Responses
///
/// - `202 Accepted` - The published message
/// - `401 Unauthorized` - Missing or invalid token
/// - `422 Unprocessable Entity` - Body is not `{"message": "..."}`
/// - `503 Service Unavailable` - The room would exceed the topic limit
async fn post_message(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<ChatMessage>), ServerError> {
    publish_message(&state, None, user, payload)
}

/// POST /rooms/{room}/messages - Publish to a named room.
async fn post_room_message(
    State(state): State<AppState>,
    Path(room): Path<String>,
    Extension(user): Extension<AuthenticatedUser>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<ChatMessage>), ServerError> {
    publish_message(&state, Some(&room), user, payload)
}

// ============================================================================
// GET /events, GET /rooms/{room}/events
// ============================================================================

/// GET /events - Stream the default channel.
///
/// # Responses
///
/// - `200 OK` - `text/event-stream`, backfill after `Last-Event-ID` then
///   live events
/// - `401 Unauthorized` - Missing or invalid token
/// - `404 Not Found` - `Last-Event-ID` is no longer in the replay log
async fn get_events(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    info!(username = %user.0, "Event stream client connecting");
    sse::streaming_response(&state.broadcaster, &headers, None)
}

/// GET /rooms/{room}/events - Stream a named room.
async fn get_room_events(
    State(state): State<AppState>,
    Path(room): Path<String>,
    Extension(user): Extension<AuthenticatedUser>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    info!(username = %user.0, room = %room, "Event stream client connecting");
    sse::streaming_response(&state.broadcaster, &headers, Some(&room))
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Number of topics referenced so far.
    pub topics: usize,

    /// Number of live subscribers across all topics.
    pub subscribers: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint.
///
/// No authentication required.
///
/// # Response
///
/// ```json
/// {
///   "status": "ok",
///   "topics": 3,
///   "subscribers": 42,
///   "uptime_seconds": 3600
/// }
/// ```
async fn get_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        topics: state.broadcaster.topic_count(),
        subscribers: state.broadcaster.subscriber_count(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================
