//! Subscription handles for consuming published events.
//!
//! A [`Subscription`] owns the receiving side of one bounded subscriber queue.
//! Its topic only holds the sending side, which doubles as the membership
//! marker: once the broker evicts a stalled subscriber (or the subscription is
//! closed) the sender is dropped, the queue stops receiving, and the consumer
//! observes [`Pull::Closed`] after draining whatever was already buffered.
//!
//! Dropping a subscription always unregisters its queue, so abandoning a
//! stream mid-pull (for example when an HTTP client disconnects) cannot leak
//! subscriber set entries.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, Stream};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::topic::Topic;
use crate::types::{Event, TopicKey};

/// Identifier of a subscriber queue within the broker.
pub type SubscriberId = u64;

/// Default capacity of a subscriber queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Default time a single pull waits before reporting [`Pull::TimedOut`].
pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of a single [`Subscription::pull`].
#[derive(Debug, Clone, PartialEq)]
pub enum Pull {
    /// The next event in publish order.
    Event(Event),
    /// No event arrived within the timeout. The subscription is still live.
    TimedOut,
    /// The subscription was closed or evicted and its queue is drained.
    Closed,
}

/// A live subscription to one topic.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    topic: Arc<Topic>,
    receiver: mpsc::Receiver<Event>,
    pull_timeout: Duration,
    closed: bool,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriberId,
        topic: Arc<Topic>,
        receiver: mpsc::Receiver<Event>,
        pull_timeout: Duration,
    ) -> Self {
        Self {
            id,
            topic,
            receiver,
            pull_timeout,
            closed: false,
        }
    }

    /// This subscription's queue id.
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// The topic this subscription listens to.
    #[must_use]
    pub fn topic(&self) -> &TopicKey {
        self.topic.key()
    }

    /// Returns `true` while the queue is still registered with its topic.
    ///
    /// Becomes `false` after [`close`](Self::close) or after the broker
    /// evicted this subscriber for falling behind.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.closed && self.topic.is_subscribed(self.id)
    }

    /// Waits up to `timeout` for the next event.
    ///
    /// Only the calling task is suspended. Buffered events are still returned
    /// after an eviction; [`Pull::Closed`] is reported once they run out.
    pub async fn pull(&mut self, timeout: Duration) -> Pull {
        if self.closed {
            return Pull::Closed;
        }

        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Some(event)) => Pull::Event(event),
            Ok(None) => Pull::Closed,
            Err(_) => Pull::TimedOut,
        }
    }

    /// Returns the next event, re-polling on timeouts.
    ///
    /// Returns `None` once the subscription is closed or evicted.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.pull(self.pull_timeout).await {
                Pull::Event(event) => return Some(event),
                Pull::TimedOut => {
                    trace!(subscriber_id = self.id, topic = %self.topic(), "Pull timed out, polling again");
                }
                Pull::Closed => {
                    debug!(subscriber_id = self.id, topic = %self.topic(), "Subscription ended");
                    return None;
                }
            }
        }
    }

    /// Removes this subscription's queue from its topic.
    ///
    /// Idempotent, and safe to race against a concurrent eviction.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.receiver.close();

        if self.topic.unsubscribe(self.id) {
            debug!(subscriber_id = self.id, topic = %self.topic(), "Subscriber removed");
        }
    }

    /// Converts the subscription into a stream of live events.
    ///
    /// The stream ends when the subscription is evicted. Dropping the stream
    /// drops (and therefore closes) the subscription.
    pub fn into_stream(self) -> impl Stream<Item = Event> + Send + 'static {
        stream::unfold(self, |mut subscription| async move {
            let event = subscription.next().await?;
            Some((event, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
