//! Event broadcasting infrastructure for the Chirp server.
//!
//! This module provides the publish/subscribe broker that distributes events
//! to every subscriber of a topic, and keeps a bounded replay log per topic so
//! that reconnecting clients can catch up on what they missed.
//!
//! # Architecture
//!
//! - [`EventBroadcaster`] - The broker. Owns the topic registry and the global
//!   event sequencer. Cheap to clone; every clone shares the same state.
//! - [`Subscription`] - A consumer's bounded queue plus a pull interface.
//! - [`ReplayLog`](crate::replay::ReplayLog) - Per-topic backfill history.
//!
//! # Backpressure
//!
//! Publishing never waits on a subscriber. Each event is offered to every
//! queue with a non-blocking enqueue; a queue that is full belongs to a
//! consumer that stopped pulling, and it is evicted from the topic. The
//! evicted subscriber drains what it already received and then ends.
//!
//! # Example
//!
//! ```rust
//! use chirp_server::broadcast::EventBroadcaster;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let broadcaster = EventBroadcaster::new();
//! let mut subscription = broadcaster.subscribe(None);
//!
//! broadcaster.publish("message", json!("Hello"), None);
//!
//! let event = subscription.next().await.unwrap();
//! assert_eq!(event.id, 0);
//! assert_eq!(event.event_type, "message");
//! assert_eq!(event.data, json!("Hello"));
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::replay::{ResyncImpossible, DEFAULT_REPLAY_CAPACITY};
use crate::subscription::{Subscription, DEFAULT_PULL_TIMEOUT, DEFAULT_QUEUE_CAPACITY};
use crate::topic::{EnqueueResult, EventSequencer, Topic, TopicLimitReached, TopicRegistry, TopicState};
use crate::types::{Event, EventId, TopicKey};

/// Default maximum number of named topics reachable through the `try_` methods.
pub const DEFAULT_MAX_TOPICS: usize = 1024;

/// Sizing and timing knobs for an [`EventBroadcaster`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcasterConfig {
    /// Events retained per topic for replay.
    pub replay_capacity: usize,

    /// Capacity of each subscriber queue.
    pub queue_capacity: usize,

    /// How long one pull waits before re-polling.
    pub pull_timeout: Duration,

    /// Named topics [`try_publish`](EventBroadcaster::try_publish) and
    /// [`try_subscribe`](EventBroadcaster::try_subscribe) may create.
    pub max_topics: usize,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            pull_timeout: DEFAULT_PULL_TIMEOUT,
            max_topics: DEFAULT_MAX_TOPICS,
        }
    }
}

#[derive(Debug)]
struct Inner {
    registry: TopicRegistry,
    sequencer: EventSequencer,
    next_subscriber_id: AtomicU64,
    disconnected: AtomicBool,
    config: BroadcasterConfig,
}

/// Central publish/subscribe hub.
///
/// One instance is constructed at startup and cloned into every handler that
/// needs to publish or subscribe.
///
/// # Thread Safety
///
/// `EventBroadcaster` is `Clone`, `Send`, and `Sync`. Publishes to different
/// topics only contend on the registry lock for the brief lookup step.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    inner: Arc<Inner>,
}

impl EventBroadcaster {
    /// Creates a broker with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BroadcasterConfig::default())
    }

    /// Creates a broker with custom capacities.
    ///
    /// # Panics
    ///
    /// Panics if either capacity is 0.
    ///
    /// # Example
    ///
    /// ```rust
    /// use chirp_server::broadcast::{BroadcasterConfig, EventBroadcaster};
    ///
    /// let broadcaster = EventBroadcaster::with_config(BroadcasterConfig {
    ///     replay_capacity: 10,
    ///     queue_capacity: 2,
    ///     ..BroadcasterConfig::default()
    /// });
    /// assert_eq!(broadcaster.config().queue_capacity, 2);
    /// ```
    #[must_use]
    pub fn with_config(config: BroadcasterConfig) -> Self {
        assert!(config.replay_capacity > 0, "replay capacity must be positive");
        assert!(config.queue_capacity > 0, "queue capacity must be positive");
        debug!(
            replay_capacity = config.replay_capacity,
            queue_capacity = config.queue_capacity,
            "Created event broadcaster"
        );
        Self {
            inner: Arc::new(Inner {
                registry: TopicRegistry::new(config.replay_capacity),
                sequencer: EventSequencer::new(),
                next_subscriber_id: AtomicU64::new(0),
                disconnected: AtomicBool::new(false),
                config,
            }),
        }
    }

    /// The configuration this broker was created with.
    #[must_use]
    pub fn config(&self) -> &BroadcasterConfig {
        &self.inner.config
    }

    /// Publishes an event to `topic` (or the default channel).
    ///
    /// The event is appended to the topic's replay log and offered to every
    /// current subscriber. Subscribers whose queues are full are evicted.
    /// Delivery failures are never reported to the caller.
    ///
    /// Returns the id assigned to the event.
    pub fn publish(
        &self,
        event_type: impl Into<String>,
        data: Value,
        topic: Option<&str>,
    ) -> EventId {
        let topic = self.inner.registry.resolve(&TopicKey::from(topic));
        self.publish_to(&topic, event_type.into(), data)
    }

    /// Publishes like [`publish`](Self::publish), but will not create a named
    /// topic beyond [`BroadcasterConfig::max_topics`].
    ///
    /// # Errors
    ///
    /// Returns [`TopicLimitReached`] if `topic` is new and the limit is reached.
    /// Nothing is published in that case.
    pub fn try_publish(
        &self,
        event_type: impl Into<String>,
        data: Value,
        topic: Option<&str>,
    ) -> Result<EventId, TopicLimitReached> {
        let topic = self
            .inner
            .registry
            .try_resolve(&TopicKey::from(topic), self.inner.config.max_topics)?;
        Ok(self.publish_to(&topic, event_type.into(), data))
    }

    fn publish_to(&self, topic: &Topic, event_type: String, data: Value) -> EventId {
        let key = topic.key();
        let mut state = topic.lock();

        // Drawn under the topic lock so replay order always equals id order.
        let event = Event::new(self.inner.sequencer.next_id(), event_type, data);
        let id = event.id;
        trace!(event_id = id, event_type = %event.event_type, topic = %key, "Publishing event");

        state.replay.push(event.clone());
        let TopicState { subscribers, .. } = &mut *state;
        let before = subscribers.len();
        subscribers.retain(
            |subscriber_id, sender| match TopicState::enqueue(sender, event.clone()) {
                EnqueueResult::Ok => true,
                EnqueueResult::Full => {
                    warn!(
                        subscriber_id,
                        event_id = id,
                        topic = %key,
                        "Subscriber queue full, evicting slow consumer"
                    );
                    false
                }
                EnqueueResult::Closed => {
                    debug!(subscriber_id, topic = %key, "Dropping closed subscriber queue");
                    false
                }
            },
        );
        trace!(
            event_id = id,
            delivered = subscribers.len(),
            removed = before - subscribers.len(),
            "Event fanned out"
        );

        id
    }

    /// Subscribes to events published to `topic` from now on.
    ///
    /// Events published before this call are only reachable through
    /// [`replay`](Self::replay).
    #[must_use]
    pub fn subscribe(&self, topic: Option<&str>) -> Subscription {
        let topic = self.inner.registry.resolve(&TopicKey::from(topic));
        self.subscribe_to(topic)
    }

    /// Subscribes like [`subscribe`](Self::subscribe), but will not create a
    /// named topic beyond [`BroadcasterConfig::max_topics`].
    ///
    /// # Errors
    ///
    /// Returns [`TopicLimitReached`] if `topic` is new and the limit is reached.
    pub fn try_subscribe(&self, topic: Option<&str>) -> Result<Subscription, TopicLimitReached> {
        let topic = self
            .inner
            .registry
            .try_resolve(&TopicKey::from(topic), self.inner.config.max_topics)?;
        Ok(self.subscribe_to(topic))
    }

    fn subscribe_to(&self, topic: Arc<Topic>) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.inner.config.queue_capacity);
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut state = topic.lock();
            // disconnect_all sets the flag before clearing each topic under
            // this lock, so a queue is never left behind.
            if self.inner.disconnected.load(Ordering::SeqCst) {
                debug!(subscriber_id = id, topic = %topic.key(), "Broker disconnected, subscription starts closed");
                drop(sender);
            } else {
                state.subscribers.insert(id, sender);
                debug!(
                    subscriber_id = id,
                    topic = %topic.key(),
                    subscriber_count = state.subscribers.len(),
                    "New subscriber added"
                );
            }
        }

        Subscription::new(id, topic, receiver, self.inner.config.pull_timeout)
    }

    /// Returns the events of `topic` published after `last_id`.
    ///
    /// With no `last_id` nothing was seen before, and the backfill is empty.
    ///
    /// # Errors
    ///
    /// Returns [`ResyncImpossible`] if `last_id` is no longer (or never was)
    /// in the topic's replay log. The caller must start over without replay.
    pub fn replay(
        &self,
        last_id: Option<EventId>,
        topic: Option<&str>,
    ) -> Result<Vec<Event>, ResyncImpossible> {
        let Some(last_id) = last_id else {
            return Ok(Vec::new());
        };

        let key = TopicKey::from(topic);
        let topic = self
            .inner
            .registry
            .get(&key)
            .ok_or(ResyncImpossible { last_id })?;
        let events = topic.lock().replay.events_after(last_id)?;
        debug!(last_id, topic = %key, replayed = events.len(), "Computed backfill");
        Ok(events)
    }

    /// Returns `true` once `topic` has been created by a publish or subscribe.
    #[must_use]
    pub fn has_topic(&self, topic: Option<&str>) -> bool {
        self.inner.registry.get(&TopicKey::from(topic)).is_some()
    }

    /// Number of topics referenced so far.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Total number of live subscriber queues across all topics.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .registry
            .topics()
            .iter()
            .map(|topic| topic.subscriber_count())
            .sum()
    }

    /// Number of live subscriber queues of one topic.
    #[must_use]
    pub fn topic_subscriber_count(&self, topic: Option<&str>) -> usize {
        self.inner
            .registry
            .get(&TopicKey::from(topic))
            .map_or(0, |topic| topic.subscriber_count())
    }

    /// Drops every subscriber queue on every topic.
    ///
    /// Open subscriptions end once they drain what they already hold, and
    /// subscriptions created afterwards start out closed. Used on shutdown so
    /// long-lived streams let their connections close. Returns the number of
    /// queues dropped.
    pub fn disconnect_all(&self) -> usize {
        self.inner.disconnected.store(true, Ordering::SeqCst);
        let dropped: usize = self
            .inner
            .registry
            .topics()
            .iter()
            .map(|topic| {
                let mut state = topic.lock();
                let count = state.subscribers.len();
                state.subscribers.clear();
                count
            })
            .sum();
        info!(subscribers = dropped, "Disconnected all subscribers");
        dropped
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
