//! Message & subscription storage.
//!
//! The broker core depends only on the abstract contract defined here: a
//! [`Store`] hands out a per-channel [`MsgLog`] + [`SubLog`] pair and a
//! process-wide [`ClientLog`]. Two implementations are provided: the default
//! in-memory store and a sled-backed file store.

mod file;
#[cfg(test)]
mod file_test;
mod memory;
#[cfg(test)]
mod memory_test;

use std::sync::Arc;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::models::SubRecord;
use crate::proto::MsgProto;

/// The wildcard channel name accepted by [`Store::msgs_state`].
pub const ALL_CHANNELS: &str = "*";

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("channel limit reached")]
    TooManyChannels,
    #[error("subscription limit reached for channel")]
    TooManySubs,
    #[error("store is closed")]
    Closed,
    #[error("storage failure: {0}")]
    Storage(#[source] anyhow::Error),
}

/// Per-channel retention and cardinality limits.
#[derive(Clone, Copy, Debug)]
pub struct StoreLimits {
    pub max_channels: usize,
    pub max_msgs: usize,
    pub max_bytes: u64,
    pub max_subs: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_channels: 100,
            max_msgs: 1_000_000,
            max_bytes: 1024 * 1024 * 1024,
            max_subs: 1000,
        }
    }
}

/// The storage handles of a single channel.
#[derive(Clone)]
pub struct ChannelEntry {
    pub msgs: Arc<dyn MsgLog>,
    pub subs: Arc<dyn SubLog>,
}

/// A channel recovered from a store on startup.
pub struct RecoveredChannel {
    pub name: String,
    pub subs: Vec<RecoveredSub>,
}

/// A subscription recovered from a store on startup.
pub struct RecoveredSub {
    pub record: SubRecord,
    /// Sequences which were in flight when the record was last updated.
    pub pending: Vec<u64>,
}

/// The storage contract the broker core depends on.
pub trait Store: Send + Sync + 'static {
    /// The type name of this store.
    fn name(&self) -> &'static str;

    /// Recover all previously stored channel & subscription state.
    fn recover(&self) -> Result<Vec<RecoveredChannel>, StoreError>;

    /// Look up the given channel, creating it if it does not exist.
    fn create_channel(&self, channel: &str) -> Result<ChannelEntry, StoreError>;

    /// Look up the given channel.
    fn lookup_channel(&self, channel: &str) -> Option<ChannelEntry>;

    /// Message count & byte totals for a channel, or for `"*"` all channels.
    fn msgs_state(&self, channel: &str) -> Result<(usize, u64), StoreError>;

    /// The process-wide client log.
    fn clients(&self) -> Arc<dyn ClientLog>;

    /// Close the store.
    fn close(&self) -> Result<(), StoreError>;
}

/// The append-only per-channel message log.
pub trait MsgLog: Send + Sync + 'static {
    /// Assign the next sequence, stamp the timestamp, and store the message.
    ///
    /// When the channel count limit is exceeded the message at `first` is
    /// evicted and `first` advances (strict FIFO).
    fn append(&self, subject: &str, reply: &str, data: &[u8]) -> Result<MsgProto, StoreError>;

    /// Return the stored message with the given sequence, if present.
    fn lookup(&self, seq: u64) -> Option<MsgProto>;

    /// The sequence of the first message stored.
    fn first_sequence(&self) -> u64;

    /// The sequence of the last message stored.
    fn last_sequence(&self) -> u64;

    /// The first message stored.
    fn first_msg(&self) -> Option<MsgProto>;

    /// The last message stored.
    fn last_msg(&self) -> Option<MsgProto>;

    /// The sequence of the first message whose timestamp is >= the given
    /// timestamp. Returns `last_sequence() + 1` when every stored message is
    /// older, which callers treat as "no messages yet".
    fn sequence_for_timestamp(&self, timestamp: i64) -> u64;

    /// Message count and byte totals.
    fn state(&self) -> (usize, u64);
}

/// The per-channel subscription log.
pub trait SubLog: Send + Sync + 'static {
    /// Record a new subscription, assigning its stable ID.
    fn create_sub(&self, record: &mut SubRecord) -> Result<(), StoreError>;

    /// Record an updated last-sent sequence for the subscription.
    fn update_last_sent(&self, sub_id: u64, last_sent: u64) -> Result<(), StoreError>;

    /// Invalidate the subscription.
    fn delete_sub(&self, sub_id: u64) -> Result<(), StoreError>;

    /// Record that the given sequence is in flight for the subscription.
    fn add_seq_pending(&self, sub_id: u64, seq: u64) -> Result<(), StoreError>;

    /// Record that the given sequence has been acknowledged.
    fn ack_seq_pending(&self, sub_id: u64, seq: u64) -> Result<(), StoreError>;
}

/// The process-wide client registration log.
pub trait ClientLog: Send + Sync + 'static {
    /// Record a client registration.
    fn add_client(&self, client_id: &str, hb_inbox: &str) -> Result<(), StoreError>;

    /// Remove a client registration.
    fn delete_client(&self, client_id: &str) -> Result<(), StoreError>;
}
