//! Timestamp parsing for client-supplied dates.
//!
//! Browsers serialize dates with `JSON.stringify(new Date())`, which yields
//! strings like `"2020-12-09T23:44:53.782Z"`. These are RFC 3339 and are
//! normalized to UTC here.

use chrono::{DateTime, ParseError, Utc};

/// Parses a JS `Date.toJSON()` string (or any RFC 3339 timestamp).
///
/// # Errors
///
/// Returns a [`ParseError`] if `value` is not a valid RFC 3339 timestamp.
pub fn parse(value: &str) -> Result<DateTime<Utc>, ParseError> {
    DateTime::parse_from_rfc3339(value).map(|parsed| parsed.with_timezone(&Utc))
}

/// Parses `value` if present, otherwise returns the current time.
///
/// An empty string counts as absent.
///
/// # Errors
///
/// Returns a [`ParseError`] if a non-empty `value` cannot be parsed.
pub fn timestamp(value: Option<&str>) -> Result<DateTime<Utc>, ParseError> {
    match value {
        Some(value) if !value.is_empty() => parse(value),
        _ => Ok(Utc::now()),
    }
}
