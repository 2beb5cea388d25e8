//! Topic registry and event sequencer.
//!
//! Each topic owns its subscriber set and replay log behind a single per-topic
//! lock. The registry lock is held only while a topic entry is looked up or
//! created, so unrelated topics never contend with each other during
//! publish or subscribe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::replay::ReplayLog;
use crate::subscription::SubscriberId;
use crate::types::{Event, EventId, TopicKey};

/// Issues one globally monotonic id per published event.
#[derive(Debug, Default)]
pub struct EventSequencer {
    next: AtomicU64,
}

impl EventSequencer {
    /// Creates a sequencer whose first id is 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes and returns the next id. Ids are never reused.
    pub fn next_id(&self) -> EventId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Id the next publish will receive.
    #[must_use]
    pub fn peek(&self) -> EventId {
        self.next.load(Ordering::Relaxed)
    }
}

/// Creating another named topic would exceed the registry's limit.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("topic limit of {limit} reached")]
pub struct TopicLimitReached {
    /// The configured maximum number of named topics.
    pub limit: usize,
}

/// Outcome of a non-blocking enqueue into a subscriber queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// The event was queued.
    Ok,
    /// The queue is at capacity; the consumer has stalled.
    Full,
    /// The consumer side is gone.
    Closed,
}

/// Mutable state of one topic, guarded by the topic lock.
#[derive(Debug)]
pub struct TopicState {
    pub(crate) subscribers: HashMap<SubscriberId, mpsc::Sender<Event>>,
    pub(crate) replay: ReplayLog,
}

impl TopicState {
    fn new(replay_capacity: usize) -> Self {
        Self {
            subscribers: HashMap::new(),
            replay: ReplayLog::with_capacity(replay_capacity),
        }
    }

    /// Attempts to queue `event` for one subscriber without waiting.
    pub(crate) fn enqueue(sender: &mpsc::Sender<Event>, event: Event) -> EnqueueResult {
        match sender.try_send(event) {
            Ok(()) => EnqueueResult::Ok,
            Err(TrySendError::Full(_)) => EnqueueResult::Full,
            Err(TrySendError::Closed(_)) => EnqueueResult::Closed,
        }
    }
}

/// One isolated event channel.
#[derive(Debug)]
pub struct Topic {
    key: TopicKey,
    state: Mutex<TopicState>,
}

impl Topic {
    fn new(key: TopicKey, replay_capacity: usize) -> Self {
        Self {
            key,
            state: Mutex::new(TopicState::new(replay_capacity)),
        }
    }

    /// The key this topic was registered under.
    #[must_use]
    pub fn key(&self) -> &TopicKey {
        &self.key
    }

    /// Acquires the topic lock.
    ///
    /// The guarded sections never panic midway through a mutation, so a
    /// poisoned lock still holds consistent state and is recovered.
    pub(crate) fn lock(&self) -> MutexGuard<'_, TopicState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes a subscriber queue. Returns `false` if it was already gone.
    pub(crate) fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.lock().subscribers.remove(&id).is_some()
    }

    /// Returns `true` while the subscriber's queue is in the subscriber set.
    #[must_use]
    pub fn is_subscribed(&self, id: SubscriberId) -> bool {
        self.lock().subscribers.contains_key(&id)
    }

    /// Number of live subscriber queues.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Number of events currently held in the replay log.
    #[must_use]
    pub fn replay_len(&self) -> usize {
        self.lock().replay.len()
    }
}

/// Maps topic keys to their lazily created state.
#[derive(Debug)]
pub struct TopicRegistry {
    topics: Mutex<HashMap<TopicKey, Arc<Topic>>>,
    replay_capacity: usize,
}

impl TopicRegistry {
    /// Creates an empty registry whose topics retain `replay_capacity` events.
    #[must_use]
    pub fn new(replay_capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            replay_capacity,
        }
    }

    /// Returns the topic for `key`, creating it on first use.
    pub fn resolve(&self, key: &TopicKey) -> Arc<Topic> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(topic) = topics.get(key) {
            return Arc::clone(topic);
        }
        self.create(&mut topics, key)
    }

    /// Like [`resolve`](Self::resolve), but refuses to create a named topic
    /// once `limit` named topics exist. The default channel is always allowed.
    ///
    /// # Errors
    ///
    /// Returns [`TopicLimitReached`] if `key` is new and the limit is reached.
    pub fn try_resolve(&self, key: &TopicKey, limit: usize) -> Result<Arc<Topic>, TopicLimitReached> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(topic) = topics.get(key) {
            return Ok(Arc::clone(topic));
        }

        let named = topics.len() - usize::from(topics.contains_key(&TopicKey::default_channel()));
        if key.name().is_some() && named >= limit {
            debug!(topic = %key, limit, "Refusing to create topic");
            return Err(TopicLimitReached { limit });
        }
        Ok(self.create(&mut topics, key))
    }

    /// Returns the topic for `key` if it has been created.
    #[must_use]
    pub fn get(&self, key: &TopicKey) -> Option<Arc<Topic>> {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn create(&self, topics: &mut HashMap<TopicKey, Arc<Topic>>, key: &TopicKey) -> Arc<Topic> {
        debug!(topic = %key, "Creating topic");
        let topic = Arc::new(Topic::new(key.clone(), self.replay_capacity));
        topics.insert(key.clone(), Arc::clone(&topic));
        topic
    }

    /// Number of topics created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if no topic has been referenced yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all topics, taken under the registry lock.
    #[must_use]
    pub fn topics(&self) -> Vec<Arc<Topic>> {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;

    #[test]
    fn sequencer_starts_at_zero_and_increments() {
        let sequencer = EventSequencer::new();
        assert_eq!(sequencer.peek(), 0);
        assert_eq!(sequencer.next_id(), 0);
        assert_eq!(sequencer.next_id(), 1);
        assert_eq!(sequencer.next_id(), 2);
        assert_eq!(sequencer.peek(), 3);
    }

    #[test]
    fn sequencer_ids_unique_across_threads() {
        let sequencer = Arc::new(EventSequencer::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sequencer = Arc::clone(&sequencer);
                thread::spawn(move || (0..1000).map(|_| sequencer.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut ids: Vec<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort_unstable();

        assert_eq!(ids, (0..8000).collect::<Vec<_>>());
    }

    #[test]
    fn resolve_is_idempotent() {
        let registry = TopicRegistry::new(10);
        let a = registry.resolve(&TopicKey::from("general"));
        let b = registry.resolve(&TopicKey::from("general"));

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn resolve_separates_topics() {
        let registry = TopicRegistry::new(10);
        assert!(registry.is_empty());

        let default = registry.resolve(&TopicKey::default_channel());
        let general = registry.resolve(&TopicKey::from("general"));

        assert!(!Arc::ptr_eq(&default, &general));
        assert_eq!(general.key().name(), Some("general"));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.topics().len(), 2);
    }

    #[test]
    fn get_never_creates() {
        let registry = TopicRegistry::new(10);
        assert!(registry.get(&TopicKey::from("general")).is_none());
        assert!(registry.is_empty());

        let general = registry.resolve(&TopicKey::from("general"));
        let found = registry.get(&TopicKey::from("general")).unwrap();
        assert!(Arc::ptr_eq(&general, &found));
    }

    #[test]
    fn try_resolve_bounds_named_topics() {
        let registry = TopicRegistry::new(10);
        registry.try_resolve(&TopicKey::from("a"), 2).unwrap();
        registry.try_resolve(&TopicKey::from("b"), 2).unwrap();

        assert_eq!(
            registry.try_resolve(&TopicKey::from("c"), 2).unwrap_err(),
            TopicLimitReached { limit: 2 }
        );
        assert_eq!(registry.len(), 2);

        // Existing topics and the default channel stay reachable.
        assert!(registry.try_resolve(&TopicKey::from("a"), 2).is_ok());
        assert!(registry.try_resolve(&TopicKey::default_channel(), 2).is_ok());
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn concurrent_resolve_creates_one_topic() {
        let registry = Arc::new(TopicRegistry::new(10));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.resolve(&TopicKey::from("race")))
            })
            .collect();

        let topics: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(topics.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn enqueue_reports_full_and_closed() {
        let (tx, rx) = mpsc::channel(1);
        let event = Event::new(0, "message", json!(null));

        assert_eq!(TopicState::enqueue(&tx, event.clone()), EnqueueResult::Ok);
        assert_eq!(TopicState::enqueue(&tx, event.clone()), EnqueueResult::Full);

        drop(rx);
        assert_eq!(TopicState::enqueue(&tx, event), EnqueueResult::Closed);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let registry = TopicRegistry::new(10);
        let topic = registry.resolve(&TopicKey::default_channel());
        let (tx, _rx) = mpsc::channel(1);
        topic.lock().subscribers.insert(1, tx);

        assert!(topic.is_subscribed(1));
        assert_eq!(topic.subscriber_count(), 1);
        assert!(topic.unsubscribe(1));
        assert!(!topic.unsubscribe(1));
        assert!(!topic.is_subscribed(1));
        assert_eq!(topic.replay_len(), 0);
    }
}
