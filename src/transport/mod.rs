//! The subject-based pub/sub transport the broker runs on.
//!
//! The broker core only depends on the [`Transport`] trait: subject-routed
//! publish, request/reply with unique inboxes, and handler-based
//! subscriptions. Subjects are dot-separated token paths; subscription
//! patterns additionally support the `*` single-token wildcard and a trailing
//! `>` tail wildcard.

mod memory;
#[cfg(test)]
mod memory_test;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use memory::MemoryTransport;

/// A message delivered by the transport.
#[derive(Clone, Debug, Default)]
pub struct TransportMessage {
    /// The subject the message was published on.
    pub subject: String,
    /// The reply subject, or empty when the publish carried none.
    pub reply: String,
    /// The message payload.
    pub data: Vec<u8>,
}

/// A handler invoked for each message arriving on a subscription.
///
/// Handlers for a single subscription are invoked sequentially in arrival
/// order; handlers of different subscriptions run in parallel.
pub type MsgHandler = Arc<dyn Fn(TransportMessage) + Send + Sync>;

/// A handle to a transport subscription, used to drop interest.
#[derive(Debug)]
pub struct InterestHandle {
    pub(crate) id: u64,
}

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error("invalid transport subject: {0}")]
    InvalidSubject(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

/// The transport contract the broker consumes.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Generate a new unique inbox subject.
    fn new_inbox(&self) -> String;

    /// Register interest in the given subject pattern.
    fn subscribe(&self, subject: &str, handler: MsgHandler) -> Result<InterestHandle, TransportError>;

    /// Drop the interest identified by the given handle.
    fn unsubscribe(&self, handle: &InterestHandle);

    /// Publish a message to the given subject.
    fn publish(&self, subject: &str, data: Vec<u8>) -> Result<(), TransportError>;

    /// Publish a message carrying a reply subject.
    fn publish_request(&self, subject: &str, reply: &str, data: Vec<u8>) -> Result<(), TransportError>;

    /// Publish a request and await a single reply within the timeout.
    async fn request(&self, subject: &str, data: Vec<u8>, timeout: Duration) -> Result<TransportMessage, TransportError>;
}
