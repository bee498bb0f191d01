//! The in-memory store implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::models::SubRecord;
use crate::proto::MsgProto;
use crate::store::{
    ChannelEntry, ClientLog, MsgLog, RecoveredChannel, Store, StoreError, StoreLimits, SubLog, ALL_CHANNELS,
};

/// The default in-memory store.
pub struct MemoryStore {
    limits: StoreLimits,
    channels: RwLock<HashMap<String, MemChannel>>,
    clients: Arc<MemClientLog>,
    closed: AtomicBool,
}

struct MemChannel {
    msgs: Arc<MemMsgLog>,
    subs: Arc<MemSubLog>,
}

impl MemoryStore {
    /// Create a new instance with the given limits.
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            limits,
            channels: RwLock::new(HashMap::new()),
            clients: Arc::new(MemClientLog::default()),
            closed: AtomicBool::new(false),
        }
    }
}

impl Store for MemoryStore {
    fn name(&self) -> &'static str {
        "MEMORY"
    }

    fn recover(&self) -> Result<Vec<RecoveredChannel>, StoreError> {
        Ok(Vec::new())
    }

    fn create_channel(&self, channel: &str) -> Result<ChannelEntry, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if let Some(entry) = self.lookup_channel(channel) {
            return Ok(entry);
        }
        let mut channels = self.channels.write();
        // Double check under the write lock.
        if let Some(chan) = channels.get(channel) {
            return Ok(ChannelEntry { msgs: chan.msgs.clone(), subs: chan.subs.clone() });
        }
        if channels.len() >= self.limits.max_channels {
            return Err(StoreError::TooManyChannels);
        }
        let chan = MemChannel {
            msgs: Arc::new(MemMsgLog::new(channel, self.limits)),
            subs: Arc::new(MemSubLog::new(self.limits)),
        };
        let entry = ChannelEntry { msgs: chan.msgs.clone(), subs: chan.subs.clone() };
        channels.insert(channel.to_string(), chan);
        Ok(entry)
    }

    fn lookup_channel(&self, channel: &str) -> Option<ChannelEntry> {
        let channels = self.channels.read();
        channels
            .get(channel)
            .map(|chan| ChannelEntry { msgs: chan.msgs.clone(), subs: chan.subs.clone() })
    }

    fn msgs_state(&self, channel: &str) -> Result<(usize, u64), StoreError> {
        if channel == ALL_CHANNELS {
            let channels = self.channels.read();
            let mut totals = (0, 0);
            for chan in channels.values() {
                let (count, bytes) = chan.msgs.state();
                totals.0 += count;
                totals.1 += bytes;
            }
            return Ok(totals);
        }
        Ok(self.lookup_channel(channel).map(|chan| chan.msgs.state()).unwrap_or((0, 0)))
    }

    fn clients(&self) -> Arc<dyn ClientLog> {
        self.clients.clone()
    }

    fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// The in-memory per-channel message log.
pub struct MemMsgLog {
    subject: String,
    limits: StoreLimits,
    inner: RwLock<MsgLogInner>,
}

struct MsgLogInner {
    first: u64,
    last: u64,
    msgs: HashMap<u64, MsgProto>,
    total_bytes: u64,
}

impl MemMsgLog {
    fn new(subject: &str, limits: StoreLimits) -> Self {
        Self {
            subject: subject.to_string(),
            limits,
            inner: RwLock::new(MsgLogInner {
                first: 1,
                last: 0,
                msgs: HashMap::with_capacity(64),
                total_bytes: 0,
            }),
        }
    }
}

impl MsgLog for MemMsgLog {
    fn append(&self, subject: &str, reply: &str, data: &[u8]) -> Result<MsgProto, StoreError> {
        let mut inner = self.inner.write();
        inner.last += 1;
        let msg = MsgProto {
            sequence: inner.last,
            subject: subject.to_string(),
            reply: reply.to_string(),
            data: data.to_vec(),
            timestamp: time::OffsetDateTime::now_utc().unix_timestamp_nanos() as i64,
            redelivered: false,
        };
        inner.total_bytes += msg.data.len() as u64;
        let last = inner.last;
        inner.msgs.insert(last, msg.clone());

        // FIFO retention by count.
        while inner.msgs.len() > self.limits.max_msgs {
            let first = inner.first;
            if let Some(evicted) = inner.msgs.remove(&first) {
                inner.total_bytes -= evicted.data.len() as u64;
                tracing::warn!(subject = %self.subject, sequence = first, "removing message from the store, channel limit reached");
            }
            inner.first += 1;
        }
        Ok(msg)
    }

    fn lookup(&self, seq: u64) -> Option<MsgProto> {
        let inner = self.inner.read();
        inner.msgs.get(&seq).cloned()
    }

    fn first_sequence(&self) -> u64 {
        self.inner.read().first
    }

    fn last_sequence(&self) -> u64 {
        self.inner.read().last
    }

    fn first_msg(&self) -> Option<MsgProto> {
        let inner = self.inner.read();
        inner.msgs.get(&inner.first).cloned()
    }

    fn last_msg(&self) -> Option<MsgProto> {
        let inner = self.inner.read();
        inner.msgs.get(&inner.last).cloned()
    }

    fn sequence_for_timestamp(&self, timestamp: i64) -> u64 {
        let inner = self.inner.read();
        // Binary search over the dense [first, last] range.
        let (mut lo, mut hi) = (inner.first, inner.last + 1);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match inner.msgs.get(&mid) {
                Some(msg) if msg.timestamp >= timestamp => hi = mid,
                Some(_) => lo = mid + 1,
                None => return inner.last + 1,
            }
        }
        lo
    }

    fn state(&self) -> (usize, u64) {
        let inner = self.inner.read();
        (inner.msgs.len(), inner.total_bytes)
    }
}

/// The in-memory per-channel subscription log.
///
/// Subscription state lives in the server while the process runs; this log
/// only tracks counts and assigns stable IDs.
pub struct MemSubLog {
    limits: StoreLimits,
    inner: Mutex<SubLogInner>,
}

#[derive(Default)]
struct SubLogInner {
    next_sub_id: u64,
    subs_count: usize,
}

impl MemSubLog {
    fn new(limits: StoreLimits) -> Self {
        Self { limits, inner: Mutex::new(SubLogInner::default()) }
    }
}

impl SubLog for MemSubLog {
    fn create_sub(&self, record: &mut SubRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.subs_count >= self.limits.max_subs {
            return Err(StoreError::TooManySubs);
        }
        inner.next_sub_id += 1;
        inner.subs_count += 1;
        record.id = inner.next_sub_id;
        Ok(())
    }

    fn update_last_sent(&self, _sub_id: u64, _last_sent: u64) -> Result<(), StoreError> {
        Ok(())
    }

    fn delete_sub(&self, _sub_id: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.subs_count = inner.subs_count.saturating_sub(1);
        Ok(())
    }

    fn add_seq_pending(&self, _sub_id: u64, _seq: u64) -> Result<(), StoreError> {
        Ok(())
    }

    fn ack_seq_pending(&self, _sub_id: u64, _seq: u64) -> Result<(), StoreError> {
        Ok(())
    }
}

/// The in-memory client log.
#[derive(Default)]
pub struct MemClientLog {
    clients: Mutex<HashMap<String, String>>,
}

impl ClientLog for MemClientLog {
    fn add_client(&self, client_id: &str, hb_inbox: &str) -> Result<(), StoreError> {
        self.clients.lock().insert(client_id.to_string(), hb_inbox.to_string());
        Ok(())
    }

    fn delete_client(&self, client_id: &str) -> Result<(), StoreError> {
        self.clients.lock().remove(client_id);
        Ok(())
    }
}
