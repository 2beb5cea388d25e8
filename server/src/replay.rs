//! Bounded per-topic history used to backfill reconnecting clients.
//!
//! A [`ReplayLog`] keeps the most recent `capacity` events of one topic in
//! publish order. When a client reconnects with the id of the last event it
//! saw, every event after that id is handed back. If the id has already been
//! evicted (or never existed) a clean resynchronization is impossible and
//! [`ResyncImpossible`] is returned instead.

use std::collections::VecDeque;

use thiserror::Error;

use crate::types::{Event, EventId};

/// Default number of events retained per topic.
pub const DEFAULT_REPLAY_CAPACITY: usize = 1000;

/// The requested `last_id` is not present in the replay log.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("event {last_id} is not in the replay log")]
pub struct ResyncImpossible {
    /// The id the client asked to resume from.
    pub last_id: EventId,
}

/// Fixed-capacity FIFO of the most recent events of a topic.
#[derive(Debug)]
pub struct ReplayLog {
    events: VecDeque<Event>,
    capacity: usize,
}

impl ReplayLog {
    /// Creates an empty log holding at most `capacity` events.
    ///
    /// Storage grows with the log rather than being reserved up front.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "replay log capacity must be positive");
        Self {
            events: VecDeque::new(),
            capacity,
        }
    }

    /// Appends an event, evicting the oldest one when full.
    pub fn push(&mut self, event: Event) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Returns every event published strictly after `last_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`ResyncImpossible`] if no retained event has id `last_id`.
    pub fn events_after(&self, last_id: EventId) -> Result<Vec<Event>, ResyncImpossible> {
        let mut iter = self.events.iter();
        if iter.by_ref().any(|event| event.id == last_id) {
            Ok(iter.cloned().collect())
        } else {
            Err(ResyncImpossible { last_id })
        }
    }

    /// Number of retained events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns `true` if nothing has been published to this topic yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Maximum number of retained events.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ReplayLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }
}
