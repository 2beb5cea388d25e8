//! Privacy tests for authentication data in logs.
//!
//! No session token, password or password hash may appear in log output, even
//! at TRACE level. This covers token signing, verification and renewal, the
//! login endpoint, and the auth middleware (including tokens passed in the
//! query string of event stream requests).
//!
//! # Test Approach
//!
//! 1. Install a tracing Layer that records every event and span field
//! 2. Exercise the code paths that handle secrets
//! 3. Assert that none of those secrets show up in the captured output

use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};
use argon2::Argon2;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use chirp_server::auth::{Authenticator, Credentials, JwtAuth, PasswordAuth};
use chirp_server::broadcast::EventBroadcaster;
use chirp_server::config::Config;
use chirp_server::routes::{create_router, AppState};

const SECRET: &str = "privacy-test-secret";
const PASSWORD: &str = "correct horse battery staple";

// ============================================================================
// Log Capture Infrastructure
// ============================================================================

/// Captured log lines shared between the layer and the test.
#[derive(Clone, Default)]
struct LogCapture {
    logs: Arc<Mutex<Vec<String>>>,
}

impl LogCapture {
    fn push(&self, line: String) {
        self.logs.lock().unwrap().push(line);
    }

    fn get_logs(&self) -> String {
        self.logs.lock().unwrap().join("\n")
    }
}

/// A tracing Layer recording events and span fields.
struct CaptureLayer {
    capture: LogCapture,
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
        let mut visitor = StringVisitor::default();
        attrs.record(&mut visitor);
        self.capture
            .push(format!("span {}: {}", attrs.metadata().name(), visitor.parts.join(" ")));
    }

    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = StringVisitor::default();
        event.record(&mut visitor);
        self.capture.push(format!(
            "[{}] {}: {}",
            event.metadata().level(),
            event.metadata().target(),
            visitor.parts.join(" ")
        ));
    }
}

#[derive(Default)]
struct StringVisitor {
    parts: Vec<String>,
}

impl Visit for StringVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        self.parts.push(format!("{}={:?}", field.name(), value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.parts.push(format!("{}={}", field.name(), value));
    }
}

/// Runs `test_fn` with a TRACE-level capturing subscriber and returns the logs.
fn with_log_capture<F: FnOnce()>(test_fn: F) -> String {
    let capture = LogCapture::default();
    let layer = CaptureLayer {
        capture: capture.clone(),
    };
    let subscriber = tracing_subscriber::registry()
        .with(layer.with_filter(tracing_subscriber::filter::LevelFilter::TRACE));

    tracing::subscriber::with_default(subscriber, test_fn);
    capture.get_logs()
}

/// Async version of [`with_log_capture`].
async fn with_log_capture_async<F, Fut>(test_fn: F) -> String
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let capture = LogCapture::default();
    let layer = CaptureLayer {
        capture: capture.clone(),
    };
    let subscriber = tracing_subscriber::registry()
        .with(layer.with_filter(tracing_subscriber::filter::LevelFilter::TRACE));

    let _guard = tracing::subscriber::set_default(subscriber);
    test_fn().await;
    capture.get_logs()
}

// ============================================================================
// Privacy Assertion Helpers
// ============================================================================

fn assert_not_in_logs(logs: &str, value: &str, what: &str) {
    assert!(
        !logs.contains(value),
        "{what} found in logs!\nValue: {value}\nLogs:\n{logs}"
    );
}

/// JWTs always start with "eyJ", the encoding of `{"`.
fn assert_no_jwt_in_logs(logs: &str) {
    assert!(!logs.contains("eyJ"), "JWT found in logs!\nLogs:\n{logs}");
}

fn hash(password: &str) -> String {
    Argon2::default()
        .hash_password(password.as_bytes(), &SaltString::generate(&mut OsRng))
        .unwrap()
        .to_string()
}

fn auth_app() -> axum::Router {
    create_router(
        AppState::new(Config {
            jwt_secret: Some(SECRET.to_string()),
            ..Config::default()
        })
        .unwrap(),
    )
}

// ============================================================================
// Token handling
// ============================================================================

#[test]
fn tokens_not_logged_by_issue_verify_and_renew() {
    let jwt = JwtAuth::new(SECRET.as_bytes());
    let forged = JwtAuth::new(b"someone else").issue("mallory").unwrap();

    let logs = with_log_capture(|| {
        let token = jwt.issue("paul").unwrap();
        jwt.verify(&token).unwrap();
        jwt.renew(&token).unwrap();
        assert!(jwt.verify(&forged).is_err());
        assert!(jwt.renew("definitely.not.valid").is_err());
    });

    assert_not_in_logs(&logs, &forged, "forged token");
    assert_not_in_logs(&logs, SECRET, "signing secret");
    assert_no_jwt_in_logs(&logs);
}

#[test]
fn passwords_and_hashes_not_logged_by_password_auth() {
    let stored = hash(PASSWORD);
    let auth = PasswordAuth::new([("paul".to_string(), stored.clone())].into());

    let logs = with_log_capture(|| {
        for password in [PASSWORD, "wrong password"] {
            auth.authenticate(Some(&Credentials {
                username: "paul".to_string(),
                password: password.to_string(),
            }));
        }
    });

    assert_not_in_logs(&logs, PASSWORD, "password");
    assert_not_in_logs(&logs, "wrong password", "password");
    assert_not_in_logs(&logs, &stored, "password hash");
}

// ============================================================================
// HTTP paths
// ============================================================================

#[tokio::test]
async fn login_does_not_log_token_or_password() {
    let app = auth_app();

    let logs = with_log_capture_async(|| async {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/auth/login")
                    .header("Content-Type", "application/json")
                    .body(Body::from(
                        json!({"username": "paul", "password": PASSWORD}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    })
    .await;

    assert!(logs.contains("User logged in"), "login not logged:\n{logs}");
    assert_not_in_logs(&logs, PASSWORD, "password");
    assert_no_jwt_in_logs(&logs);
}

#[tokio::test]
async fn middleware_does_not_log_rejected_or_accepted_tokens() {
    let app = auth_app();
    let valid = JwtAuth::new(SECRET.as_bytes()).issue("paul").unwrap();
    let forged = JwtAuth::new(b"someone else").issue("paul").unwrap();

    let logs = with_log_capture_async(|| async {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/events")
                    .header("Authorization", format!("Bearer {forged}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/rooms/private/events?token={valid}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    })
    .await;

    assert!(logs.contains("/rooms/private/events"), "request not traced:\n{logs}");
    assert_not_in_logs(&logs, &forged, "forged token");
    assert_not_in_logs(&logs, &valid, "valid token");
    assert_no_jwt_in_logs(&logs);
}

#[test]
fn app_state_debug_does_not_expose_secret() {
    let state = AppState::with_components(
        Config {
            jwt_secret: Some(SECRET.to_string()),
            ..Config::default()
        },
        EventBroadcaster::new(),
        Some(JwtAuth::new(SECRET.as_bytes())),
        Arc::new(PasswordAuth::new([("paul".to_string(), hash(PASSWORD))].into())),
    );

    let debug = format!("{state:?}");
    assert_not_in_logs(&debug, SECRET, "signing secret");
    assert!(!debug.contains("$argon2"), "password hash in Debug output: {debug}");
}
