//! Chirp Server - JSON relay with replayable server-sent events.
//!
//! This crate provides an in-memory publish/subscribe broker and the HTTP
//! surface around it:
//! - Publishing typed JSON events to named topics
//! - Fanning events out to bounded per-subscriber queues
//! - Replaying missed events to reconnecting `text/event-stream` clients
//!
//! # Architecture
//!
//! [`broadcast::EventBroadcaster`] owns the topic registry and the global
//! event sequencer. Each topic keeps its subscriber set and a bounded replay
//! log behind one lock. Subscribers that fall behind are evicted rather than
//! slowing down publishers. Nothing is persisted.

pub mod auth;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod replay;
pub mod routes;
pub mod sse;
pub mod subscription;
pub mod timestamp;
pub mod topic;
pub mod types;
