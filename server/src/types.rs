//! Shared event types for the Chirp server.
//!
//! Events are immutable once created. Their ids come from a single sequencer
//! shared by every topic, so a client's `Last-Event-ID` orders events
//! unambiguously even across topics.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a published event.
pub type EventId = u64;

/// A published event.
///
/// `data` is opaque to the broker. It is only inspected when the event is
/// serialized for the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique, strictly increasing id.
    pub id: EventId,

    /// Application-defined event name (the SSE `event:` field).
    pub event_type: String,

    /// JSON payload.
    pub data: Value,
}

impl Event {
    /// Creates a new event.
    #[must_use]
    pub fn new(id: EventId, event_type: impl Into<String>, data: Value) -> Self {
        Self {
            id,
            event_type: event_type.into(),
            data,
        }
    }
}

/// Key of a topic in the registry. `None` is the default channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TopicKey(Option<String>);

impl TopicKey {
    /// The default ("no topic") channel.
    #[must_use]
    pub fn default_channel() -> Self {
        Self(None)
    }

    /// Returns the topic name, or `None` for the default channel.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl From<Option<&str>> for TopicKey {
    fn from(topic: Option<&str>) -> Self {
        Self(topic.map(str::to_owned))
    }
}

impl From<&str> for TopicKey {
    fn from(topic: &str) -> Self {
        Self(Some(topic.to_owned()))
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(name) => f.write_str(name),
            None => f.write_str("<default>"),
        }
    }
}
