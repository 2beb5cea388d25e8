//! Chirp Server - Main entry point.
//!
//! This binary starts the Chirp relay with:
//! - Structured JSON logging
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//!
//! # Configuration
//!
//! See [`chirp_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! # Development mode (no auth)
//! CHIRP_UNSAFE_NO_AUTH=true cargo run --bin chirp-server
//!
//! # Production mode
//! CHIRP_JWT_SECRET="change-me" \
//! CHIRP_USERS_FILE=/etc/chirp/users.json \
//! CHIRP_BIND_ADDR= \
//! PORT=8080 \
//! cargo run --release --bin chirp-server
//! ```

use std::process::ExitCode;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use chirp_server::config::Config;
use chirp_server::routes::{create_router, AppState};

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            print_usage(&err);
            return ExitCode::from(1);
        }
    };

    let auth_mode = if config.unsafe_no_auth {
        "disabled (UNSAFE)"
    } else if config.users_file.is_some() {
        "password"
    } else {
        "dummy"
    };
    info!(
        port = config.port,
        auth_mode = auth_mode,
        replay_capacity = config.replay_capacity,
        queue_capacity = config.queue_capacity,
        "Chirp server starting"
    );

    let listen_addr = config.listen_addr();
    let state = match AppState::new(config) {
        Ok(state) => state,
        Err(err) => {
            error!(error = %err, "Failed to initialize server");
            print_usage(&err);
            return ExitCode::from(1);
        }
    };
    let broadcaster = state.broadcaster.clone();
    let app = create_router(state);

    let listener = match TcpListener::bind(&listen_addr).await {
        Ok(listener) => {
            info!(address = %listen_addr, "Server listening");
            listener
        }
        Err(err) => {
            error!(
                error = %err,
                address = %listen_addr,
                "Failed to bind to address"
            );
            return ExitCode::from(1);
        }
    };

    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        broadcaster.disconnect_all();
    });
    info!("Server ready to accept connections");

    if let Err(err) = server.await {
        error!(error = %err, "Server error");
        return ExitCode::from(1);
    }

    info!("Server shutdown complete");
    ExitCode::SUCCESS
}

fn print_usage(err: &dyn std::error::Error) {
    eprintln!("Error: {err}");
    eprintln!();
    eprintln!("Required environment variables (when auth enabled):");
    eprintln!("  CHIRP_JWT_SECRET       - HMAC secret for session tokens");
    eprintln!();
    eprintln!("Optional environment variables:");
    eprintln!("  PORT                   - HTTP server port (default: 3000)");
    eprintln!("  CHIRP_BIND_ADDR        - Bind host (default: 127.0.0.1, empty: all interfaces)");
    eprintln!("  CHIRP_USERS_FILE       - JSON file of usernames and argon2 hashes");
    eprintln!("  CHIRP_REPLAY_CAPACITY  - Events kept per topic for replay (default: 1000)");
    eprintln!("  CHIRP_QUEUE_CAPACITY   - Events buffered per subscriber (default: 100)");
    eprintln!("  CHIRP_MAX_TOPICS       - Rooms clients may create (default: 1024)");
    eprintln!("  CHIRP_UNSAFE_NO_AUTH   - Disable auth (dev only, set to 'true')");
    eprintln!("  RUST_LOG               - Log level filter (default: info)");
}

/// Initialize structured logging with tracing.
///
/// JSON output, filtered by `RUST_LOG` when set.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
