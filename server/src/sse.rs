//! Server-sent event streaming.
//!
//! Joins a topic's backfill and its live feed into one `text/event-stream`
//! response. Each event is sent as a single chunk:
//!
//! ```text
//! id: 3
//! event: message
//! data: {"text":"hello"}
//!
//! ```
//!
//! Browsers resend the id of the last event they received in the
//! `Last-Event-ID` header when they reconnect. Missed events are replayed
//! first. If that id is no longer in the replay log the request fails with
//! 404, telling the client to reconnect without the header.
//!
//! The subscription is registered *before* the backfill is read, so an event
//! published during the handoff shows up at least once. A client may see it
//! twice (once from each side) but never zero times. Resuming a topic that
//! does not exist fails before anything is subscribed, so such requests never
//! create topics.

use std::convert::Infallible;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::Response;
use futures_util::future;
use futures_util::stream::{self, Stream, StreamExt};
use tracing::{debug, error};

use crate::broadcast::EventBroadcaster;
use crate::error::ServerError;
use crate::replay::ResyncImpossible;
use crate::types::{Event, EventId};

/// Request header carrying the id of the last event a client received.
pub const HEADER_LAST_EVENT_ID: &str = "Last-Event-ID";

/// MIME type of server-sent event streams.
pub const EVENT_STREAM_MIME: &str = "text/event-stream";

/// Formats one event as an SSE record, terminated by a blank line.
///
/// # Errors
///
/// Returns an error if the event data cannot be encoded as JSON.
pub fn encode_event(event: &Event) -> Result<String, serde_json::Error> {
    let data = serde_json::to_string(&event.data)?;
    Ok(format!(
        "id: {}\nevent: {}\ndata: {}\n\n",
        event.id, event.event_type, data
    ))
}

/// Reads `Last-Event-ID` from request headers.
///
/// Returns `Ok(None)` when the header is absent.
///
/// # Errors
///
/// A header that is not an unsigned integer cannot name any event, so it is
/// reported as [`ServerError::NotFound`] like an id missing from the log.
pub fn last_event_id(headers: &HeaderMap) -> Result<Option<EventId>, ServerError> {
    let Some(value) = headers.get(HEADER_LAST_EVENT_ID) else {
        return Ok(None);
    };

    value
        .to_str()
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .map(Some)
        .ok_or_else(|| {
            debug!(header = ?value, "Unparseable Last-Event-ID");
            ServerError::not_found("Last-Event-ID does not name a known event")
        })
}

/// Builds the ordered event sequence for one streaming client.
///
/// Subscribes to `topic`, then computes the backfill after `last_id`, and
/// chains the two. The returned stream owns the subscription; dropping it
/// unregisters the subscriber.
///
/// # Errors
///
/// Returns [`ServerError::NotFound`] if `last_id` is not in the replay log.
/// The subscription created for the attempt is released before returning.
/// Returns [`ServerError::Unavailable`] if `topic` is new and the broker's
/// topic limit is reached.
pub fn event_stream(
    broadcaster: &EventBroadcaster,
    topic: Option<&str>,
    last_id: Option<EventId>,
) -> Result<impl Stream<Item = Event> + Send + 'static, ServerError> {
    if let Some(last_id) = last_id {
        if !broadcaster.has_topic(topic) {
            return Err(ResyncImpossible { last_id }.into());
        }
    }

    let subscription = broadcaster.try_subscribe(topic)?;
    let backfill = broadcaster.replay(last_id, topic)?;

    debug!(
        subscriber_id = subscription.id(),
        topic = %subscription.topic(),
        backfill = backfill.len(),
        "Starting event stream"
    );

    Ok(stream::iter(backfill).chain(subscription.into_stream()))
}

/// Encodes an event stream into SSE chunks.
///
/// Events whose data fails to encode are logged and skipped.
pub fn encode_stream(
    events: impl Stream<Item = Event> + Send + 'static,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    events.filter_map(|event| {
        let chunk = match encode_event(&event) {
            Ok(record) => Some(Ok(Bytes::from(record))),
            Err(err) => {
                error!(event_id = event.id, error = %err, "Failed to encode event");
                None
            }
        };
        future::ready(chunk)
    })
}

/// Creates a streaming `text/event-stream` response for `topic`.
///
/// # Errors
///
/// Returns [`ServerError::NotFound`] if the request's `Last-Event-ID` cannot
/// be resumed from, or [`ServerError::Unavailable`] if no more topics may be
/// created.
pub fn streaming_response(
    broadcaster: &EventBroadcaster,
    headers: &HeaderMap,
    topic: Option<&str>,
) -> Result<Response, ServerError> {
    let last_id = last_event_id(headers)?;
    let events = event_stream(broadcaster, topic, last_id)?;

    let mut response = Response::new(Body::from_stream(encode_stream(events)));
    let response_headers = response.headers_mut();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(EVENT_STREAM_MIME),
    );
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(response)
}
