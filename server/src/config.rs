//! Server configuration module.
//!
//! Parses configuration from environment variables for the Chirp server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PORT` | No | 3000 | HTTP server port |
//! | `CHIRP_BIND_ADDR` | No | 127.0.0.1 | Bind host; empty listens on all interfaces |
//! | `CHIRP_JWT_SECRET` | Yes* | - | HMAC secret used to sign session tokens |
//! | `CHIRP_USERS_FILE` | No | - | JSON file mapping usernames to argon2 hashes |
//! | `CHIRP_UNSAFE_NO_AUTH` | No | false | Disable all authentication (dev only) |
//! | `CHIRP_REPLAY_CAPACITY` | No | 1000 | Events retained per topic for replay |
//! | `CHIRP_QUEUE_CAPACITY` | No | 100 | Events buffered per subscriber |
//! | `CHIRP_MAX_TOPICS` | No | 1024 | Rooms clients may create |
//!
//! *Not required if `CHIRP_UNSAFE_NO_AUTH=true`
//!
//! Without `CHIRP_USERS_FILE`, every login succeeds as `dummyuser`.

use std::env;
use std::path::PathBuf;

use thiserror::Error;
use tracing::warn;

use crate::broadcast::{BroadcasterConfig, DEFAULT_MAX_TOPICS};
use crate::replay::DEFAULT_REPLAY_CAPACITY;
use crate::subscription::DEFAULT_QUEUE_CAPACITY;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 3000;

/// Default bind host.
const DEFAULT_BIND_ADDR: &str = "127.0.0.1";

/// Bind host used when `CHIRP_BIND_ADDR` is set but empty.
const ALL_INTERFACES: &str = "0.0.0.0";

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),
}

/// Server configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,

    /// Host the listener binds to.
    pub bind_addr: String,

    /// HMAC secret for session tokens.
    pub jwt_secret: Option<String>,

    /// Path of the username/password-hash file.
    pub users_file: Option<PathBuf>,

    /// When true, disables all authentication (development only).
    pub unsafe_no_auth: bool,

    /// Events retained per topic for replay.
    pub replay_capacity: usize,

    /// Events buffered per subscriber before it is evicted.
    pub queue_capacity: usize,

    /// Rooms that requests may create.
    pub max_topics: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            jwt_secret: None,
            users_file: None,
            unsafe_no_auth: false,
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_topics: DEFAULT_MAX_TOPICS,
        }
    }
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `CHIRP_JWT_SECRET` is missing (when `CHIRP_UNSAFE_NO_AUTH` is not true)
    /// - A capacity is not a positive integer
    /// - Port number is not a valid u16
    ///
    /// # Example
    ///
    /// ```no_run
    /// use chirp_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on {}", config.listen_addr());
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            port: parse_port()?,
            bind_addr: parse_bind_addr(),
            jwt_secret: env::var("CHIRP_JWT_SECRET").ok().filter(|s| !s.is_empty()),
            users_file: env::var_os("CHIRP_USERS_FILE").map(PathBuf::from),
            unsafe_no_auth: parse_bool_env("CHIRP_UNSAFE_NO_AUTH"),
            replay_capacity: parse_capacity("CHIRP_REPLAY_CAPACITY", DEFAULT_REPLAY_CAPACITY)?,
            queue_capacity: parse_capacity("CHIRP_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)?,
            max_topics: parse_capacity("CHIRP_MAX_TOPICS", DEFAULT_MAX_TOPICS)?,
        };

        config.validate()?;

        if config.unsafe_no_auth {
            warn!(
                "CHIRP_UNSAFE_NO_AUTH is enabled - all authentication is disabled. \
                 Do not use in production!"
            );
        }

        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Ensures a signing secret is present unless authentication is disabled.
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.unsafe_no_auth && self.jwt_secret.is_none() {
            return Err(ConfigError::MissingEnvVar("CHIRP_JWT_SECRET".to_string()));
        }
        Ok(())
    }

    /// `host:port` string for the listener.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    /// Broker sizing derived from this configuration.
    #[must_use]
    pub fn broadcaster_config(&self) -> BroadcasterConfig {
        BroadcasterConfig {
            replay_capacity: self.replay_capacity,
            queue_capacity: self.queue_capacity,
            max_topics: self.max_topics,
            ..BroadcasterConfig::default()
        }
    }
}

/// Parse a boolean environment variable.
///
/// Returns `true` if the variable is set to "true" (case-insensitive),
/// `false` otherwise.
fn parse_bool_env(name: &str) -> bool {
    env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Parse the CHIRP_BIND_ADDR environment variable.
fn parse_bind_addr() -> String {
    match env::var("CHIRP_BIND_ADDR") {
        Ok(addr) if addr.trim().is_empty() => ALL_INTERFACES.to_string(),
        Ok(addr) => addr.trim().to_string(),
        Err(_) => DEFAULT_BIND_ADDR.to_string(),
    }
}

/// Parse a positive integer capacity, falling back to `default` if unset.
fn parse_capacity(var: &str, default: usize) -> Result<usize, ConfigError> {
    let raw = match env::var(var) {
        Ok(raw) => raw,
        Err(_) => return Ok(default),
    };

    match raw.trim().parse::<usize>() {
        Ok(0) => Err(ConfigError::InvalidFormat {
            var: var.to_string(),
            message: "must be greater than zero".to_string(),
        }),
        Ok(capacity) => Ok(capacity),
        Err(err) => Err(ConfigError::InvalidFormat {
            var: var.to_string(),
            message: format!("expected a positive integer, got '{raw}': {err}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    /// Helper to temporarily set environment variables for testing.
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old_value = env::var(key).ok();
            self.vars.push((key.to_string(), old_value));
            env::set_var(key, value);
        }

        fn remove(&mut self, key: &str) {
            let old_value = env::var(key).ok();
            self.vars.push((key.to_string(), old_value));
            env::remove_var(key);
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.iter().rev() {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    fn clear_all(guard: &mut EnvGuard) {
        for key in [
            "PORT",
            "CHIRP_BIND_ADDR",
            "CHIRP_JWT_SECRET",
            "CHIRP_USERS_FILE",
            "CHIRP_UNSAFE_NO_AUTH",
            "CHIRP_REPLAY_CAPACITY",
            "CHIRP_QUEUE_CAPACITY",
            "CHIRP_MAX_TOPICS",
        ] {
            guard.remove(key);
        }
    }

    #[test]
    #[serial]
    fn test_config_with_unsafe_no_auth() {
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("CHIRP_UNSAFE_NO_AUTH", "true");

        let config = Config::from_env().expect("should parse config");
        assert!(config.unsafe_no_auth);
        assert!(config.jwt_secret.is_none());
        assert!(config.users_file.is_none());
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.listen_addr(), "127.0.0.1:3000");
        assert_eq!(config.replay_capacity, 1000);
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.max_topics, 1024);
    }

    #[test]
    #[serial]
    fn test_config_with_auth_enabled() {
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("CHIRP_JWT_SECRET", "not a secret");
        guard.set("CHIRP_USERS_FILE", "/tmp/users.json");
        guard.set("PORT", "9090");
        guard.set("CHIRP_REPLAY_CAPACITY", "50");
        guard.set("CHIRP_QUEUE_CAPACITY", "5");
        guard.set("CHIRP_MAX_TOPICS", "12");

        let config = Config::from_env().expect("should parse config");
        assert!(!config.unsafe_no_auth);
        assert_eq!(config.jwt_secret.as_deref(), Some("not a secret"));
        assert_eq!(config.users_file, Some(PathBuf::from("/tmp/users.json")));
        assert_eq!(config.port, 9090);

        let broadcaster = config.broadcaster_config();
        assert_eq!(broadcaster.replay_capacity, 50);
        assert_eq!(broadcaster.queue_capacity, 5);
        assert_eq!(broadcaster.max_topics, 12);
    }

    #[test]
    #[serial]
    fn test_config_missing_secret_without_unsafe_no_auth() {
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref v) if v == "CHIRP_JWT_SECRET"));
    }

    #[test]
    #[serial]
    fn test_config_empty_secret_is_missing() {
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("CHIRP_JWT_SECRET", "");

        assert!(Config::from_env().is_err());
    }

    #[test]
    #[serial]
    fn test_parse_bind_addr() {
        let mut guard = EnvGuard::new();
        guard.remove("CHIRP_BIND_ADDR");
        assert_eq!(parse_bind_addr(), "127.0.0.1");

        guard.set("CHIRP_BIND_ADDR", "");
        assert_eq!(parse_bind_addr(), "0.0.0.0");

        guard.set("CHIRP_BIND_ADDR", " 10.0.0.1 ");
        assert_eq!(parse_bind_addr(), "10.0.0.1");
    }

    #[test]
    #[serial]
    fn test_parse_capacity() {
        let mut guard = EnvGuard::new();
        guard.remove("TEST_CAPACITY");
        assert_eq!(parse_capacity("TEST_CAPACITY", 7), Ok(7));

        guard.set("TEST_CAPACITY", "12");
        assert_eq!(parse_capacity("TEST_CAPACITY", 7), Ok(12));

        guard.set("TEST_CAPACITY", "0");
        assert!(matches!(
            parse_capacity("TEST_CAPACITY", 7),
            Err(ConfigError::InvalidFormat { ref var, .. }) if var == "TEST_CAPACITY"
        ));

        guard.set("TEST_CAPACITY", "lots");
        assert!(parse_capacity("TEST_CAPACITY", 7).is_err());
    }

    #[test]
    #[serial]
    fn test_parse_bool_env_true() {
        let mut guard = EnvGuard::new();
        guard.set("TEST_BOOL", "true");
        assert!(parse_bool_env("TEST_BOOL"));

        guard.set("TEST_BOOL", "TRUE");
        assert!(parse_bool_env("TEST_BOOL"));
    }

    #[test]
    #[serial]
    fn test_parse_bool_env_false() {
        let mut guard = EnvGuard::new();
        guard.set("TEST_BOOL", "false");
        assert!(!parse_bool_env("TEST_BOOL"));

        guard.set("TEST_BOOL", "anything-else");
        assert!(!parse_bool_env("TEST_BOOL"));

        guard.remove("TEST_BOOL");
        assert!(!parse_bool_env("TEST_BOOL"));
    }

    #[test]
    #[serial]
    fn test_parse_port_default() {
        let mut guard = EnvGuard::new();
        guard.remove("PORT");
        assert_eq!(parse_port().expect("should parse port"), DEFAULT_PORT);
    }

    #[test]
    #[serial]
    fn test_parse_port_invalid() {
        let mut guard = EnvGuard::new();
        guard.set("PORT", "not-a-number");
        assert!(matches!(parse_port().unwrap_err(), ConfigError::InvalidPort(_)));

        guard.set("PORT", "99999");
        assert!(parse_port().is_err());
    }
}
