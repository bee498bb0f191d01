//! Weir — a streaming message broker over a subject-based pub/sub transport.
//!
//! Publishers send messages on named channels; the broker assigns each
//! message a dense per-channel sequence, persists it through a pluggable
//! store, and delivers it to subscribers with at-least-once semantics,
//! per-subscriber flow control, ack tracking, and redelivery of expired
//! unacknowledged messages. Subscriptions may be plain, durable, or members
//! of load-balanced queue groups (including durable queue groups, whose
//! progress survives all members leaving).

pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod proto;
pub mod server;
pub mod store;
pub mod transport;
mod utils;
#[cfg(test)]
mod utils_test;

pub use client::{Connection, Message, MessageHandler, StartAt, Subscription, SubscriptionOptions};
pub use config::Config;
pub use error::ProtoError;
pub use server::Server;
pub use store::{FileStore, MemoryStore, Store, StoreLimits};
pub use transport::{MemoryTransport, Transport};
