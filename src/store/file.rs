//! The sled-backed file store implementation.
//!
//! Each channel gets its own pair of DB trees: one for messages, one for
//! metadata (subscription records & pending sequences). Keys are built with
//! the `utils::encode_byte_prefix*` helpers so that range scans preserve
//! sequence order.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use parking_lot::{Mutex, RwLock};
use sled::{Config as SledConfig, Db, Tree};

use crate::models::SubRecord;
use crate::proto::MsgProto;
use crate::store::{
    ChannelEntry, ClientLog, MsgLog, RecoveredChannel, RecoveredSub, Store, StoreError, StoreLimits, SubLog,
    ALL_CHANNELS,
};
use crate::utils;

/// The key prefix used for storing channel messages.
const PREFIX_MSG: &[u8; 1] = b"e";
/// The key prefix used for storing subscription records.
const PREFIX_SUB: &[u8; 1] = b"s";
/// The key prefix used for storing pending sequences, keyed by sub ID + seq.
const PREFIX_PENDING: &[u8; 1] = b"p";

/// The tree holding the set of known channels.
const TREE_CHANNELS: &str = "channels";
/// The tree holding client registrations.
const TREE_CLIENTS: &str = "clients";
/// The tree name prefix for per-channel message trees.
const TREE_MSGS_PREFIX: &str = "msgs:";
/// The tree name prefix for per-channel metadata trees.
const TREE_META_PREFIX: &str = "meta:";

const ERR_ITER_FAILURE: &str = "error returned during key/value iteration from database";

fn storage_err(err: impl Into<anyhow::Error>) -> StoreError {
    StoreError::Storage(err.into())
}

/// The sled-backed file store.
pub struct FileStore {
    db: Db,
    limits: StoreLimits,
    channels: RwLock<HashMap<String, ChannelEntry>>,
    clients: Arc<FileClientLog>,
    closed: AtomicBool,
}

impl FileStore {
    /// Open the store at the given path.
    pub fn open(path: &Path, limits: StoreLimits) -> Result<Self> {
        std::fs::create_dir_all(path).context("error creating dir for file store")?;
        let db = SledConfig::new()
            .path(path)
            .mode(sled::Mode::HighThroughput)
            .open()
            .context("error opening file store database")?;
        let clients_tree = db.open_tree(TREE_CLIENTS).context("error opening clients tree")?;
        Ok(Self {
            db,
            limits,
            channels: RwLock::new(HashMap::new()),
            clients: Arc::new(FileClientLog { tree: clients_tree }),
            closed: AtomicBool::new(false),
        })
    }

    fn open_channel(&self, channel: &str) -> Result<ChannelEntry, StoreError> {
        let msgs_tree = self
            .db
            .open_tree(format!("{}{}", TREE_MSGS_PREFIX, channel))
            .map_err(storage_err)?;
        let meta_tree = self
            .db
            .open_tree(format!("{}{}", TREE_META_PREFIX, channel))
            .map_err(storage_err)?;
        let msgs = FileMsgLog::open(channel, msgs_tree, self.limits).map_err(storage_err)?;
        let subs = FileSubLog::open(meta_tree, self.limits).map_err(storage_err)?;
        Ok(ChannelEntry { msgs: Arc::new(msgs), subs: Arc::new(subs) })
    }
}

impl Store for FileStore {
    fn name(&self) -> &'static str {
        "FILE"
    }

    fn recover(&self) -> Result<Vec<RecoveredChannel>, StoreError> {
        let channels_tree = self.db.open_tree(TREE_CHANNELS).map_err(storage_err)?;
        let mut recovered = Vec::new();
        for name_res in channels_tree.iter().keys() {
            let name_ivec = name_res.context(ERR_ITER_FAILURE).map_err(storage_err)?;
            let name = std::str::from_utf8(&name_ivec)
                .context("error decoding channel name from storage")
                .map_err(storage_err)?
                .to_string();
            self.create_channel(&name)?;

            // Scan subscription records & their pending sequences.
            let meta_tree = self
                .db
                .open_tree(format!("{}{}", TREE_META_PREFIX, &name))
                .map_err(storage_err)?;
            let mut subs = Vec::new();
            for kv_res in meta_tree.scan_prefix(PREFIX_SUB) {
                let (_key, val) = kv_res.context(ERR_ITER_FAILURE).map_err(storage_err)?;
                let record: SubRecord = utils::decode_model(&val)
                    .context("error decoding subscription record from storage")
                    .map_err(storage_err)?;
                let mut pending = Vec::new();
                let pending_start = utils::encode_byte_prefix_pair(PREFIX_PENDING, record.id, 0);
                let pending_stop = utils::encode_byte_prefix_pair(PREFIX_PENDING, record.id, u64::MAX);
                for key_res in meta_tree.range(pending_start..=pending_stop).keys() {
                    let key = key_res.context(ERR_ITER_FAILURE).map_err(storage_err)?;
                    let seq = utils::decode_u64(&key[9..]).map_err(storage_err)?;
                    pending.push(seq);
                }
                subs.push(RecoveredSub { record, pending });
            }
            recovered.push(RecoveredChannel { name, subs });
        }
        Ok(recovered)
    }

    fn create_channel(&self, channel: &str) -> Result<ChannelEntry, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if let Some(entry) = self.lookup_channel(channel) {
            return Ok(entry);
        }
        let mut channels = self.channels.write();
        if let Some(entry) = channels.get(channel) {
            return Ok(entry.clone());
        }
        if channels.len() >= self.limits.max_channels {
            return Err(StoreError::TooManyChannels);
        }
        let entry = self.open_channel(channel)?;
        let channels_tree = self.db.open_tree(TREE_CHANNELS).map_err(storage_err)?;
        channels_tree.insert(channel.as_bytes(), vec![]).map_err(storage_err)?;
        channels.insert(channel.to_string(), entry.clone());
        Ok(entry)
    }

    fn lookup_channel(&self, channel: &str) -> Option<ChannelEntry> {
        self.channels.read().get(channel).cloned()
    }

    fn msgs_state(&self, channel: &str) -> Result<(usize, u64), StoreError> {
        if channel == ALL_CHANNELS {
            let channels = self.channels.read();
            let mut totals = (0, 0);
            for entry in channels.values() {
                let (count, bytes) = entry.msgs.state();
                totals.0 += count;
                totals.1 += bytes;
            }
            return Ok(totals);
        }
        Ok(self.lookup_channel(channel).map(|entry| entry.msgs.state()).unwrap_or((0, 0)))
    }

    fn clients(&self) -> Arc<dyn ClientLog> {
        self.clients.clone()
    }

    fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.db.flush().map_err(storage_err)?;
        Ok(())
    }
}

/// The sled-backed per-channel message log.
pub struct FileMsgLog {
    subject: String,
    tree: Tree,
    limits: StoreLimits,
    inner: RwLock<FileMsgLogInner>,
}

struct FileMsgLogInner {
    first: u64,
    last: u64,
    count: usize,
    total_bytes: u64,
}

impl FileMsgLog {
    fn open(subject: &str, tree: Tree, limits: StoreLimits) -> Result<Self> {
        // Recover first/last sequences & totals from the tree.
        let (mut first, mut last, mut count, mut total_bytes) = (1u64, 0u64, 0usize, 0u64);
        if let Some((key, _val)) = tree.first().context("error fetching first message record")? {
            first = utils::decode_u64(&key[1..])?;
        }
        if let Some((key, _val)) = tree.last().context("error fetching last message record")? {
            last = utils::decode_u64(&key[1..])?;
        }
        for val_res in tree.iter().values() {
            let val = val_res.context(ERR_ITER_FAILURE)?;
            let msg: MsgProto = utils::decode_model(&val)?;
            count += 1;
            total_bytes += msg.data.len() as u64;
        }
        Ok(Self {
            subject: subject.to_string(),
            tree,
            limits,
            inner: RwLock::new(FileMsgLogInner { first, last, count, total_bytes }),
        })
    }

    fn fetch(&self, seq: u64) -> Option<MsgProto> {
        let val = self.tree.get(utils::encode_byte_prefix(PREFIX_MSG, seq)).ok()??;
        utils::decode_model(&val).ok()
    }
}

impl MsgLog for FileMsgLog {
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
        let encoded = utils::encode_model(&msg).map_err(storage_err)?;
        self.tree
            .insert(utils::encode_byte_prefix(PREFIX_MSG, msg.sequence), encoded)
            .map_err(storage_err)?;
        inner.count += 1;
        inner.total_bytes += msg.data.len() as u64;

        // FIFO retention by count.
        while inner.count > self.limits.max_msgs {
            let first = inner.first;
            let evicted = self
                .tree
                .remove(utils::encode_byte_prefix(PREFIX_MSG, first))
                .map_err(storage_err)?;
            if let Some(val) = evicted {
                let old: MsgProto = utils::decode_model(&val).map_err(storage_err)?;
                inner.total_bytes -= old.data.len() as u64;
                tracing::warn!(subject = %self.subject, sequence = first, "removing message from the store, channel limit reached");
            }
            inner.count -= 1;
            inner.first += 1;
        }
        Ok(msg)
    }

    fn lookup(&self, seq: u64) -> Option<MsgProto> {
        let inner = self.inner.read();
        if seq < inner.first || seq > inner.last {
            return None;
        }
        drop(inner);
        self.fetch(seq)
    }

    fn first_sequence(&self) -> u64 {
        self.inner.read().first
    }

    fn last_sequence(&self) -> u64 {
        self.inner.read().last
    }

    fn first_msg(&self) -> Option<MsgProto> {
        let first = self.inner.read().first;
        self.fetch(first)
    }

    fn last_msg(&self) -> Option<MsgProto> {
        let last = self.inner.read().last;
        self.fetch(last)
    }

    fn sequence_for_timestamp(&self, timestamp: i64) -> u64 {
        let inner = self.inner.read();
        let (mut lo, mut hi) = (inner.first, inner.last + 1);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.fetch(mid) {
                Some(msg) if msg.timestamp >= timestamp => hi = mid,
                Some(_) => lo = mid + 1,
                None => return inner.last + 1,
            }
        }
        lo
    }

    fn state(&self) -> (usize, u64) {
        let inner = self.inner.read();
        (inner.count, inner.total_bytes)
    }
}

/// The sled-backed per-channel subscription log.
pub struct FileSubLog {
    tree: Tree,
    limits: StoreLimits,
    inner: Mutex<FileSubLogInner>,
}

struct FileSubLogInner {
    next_sub_id: u64,
    subs_count: usize,
}

impl FileSubLog {
    fn open(tree: Tree, limits: StoreLimits) -> Result<Self> {
        // Recover the highest assigned sub ID and the live record count.
        let (mut next_sub_id, mut subs_count) = (0u64, 0usize);
        for kv_res in tree.scan_prefix(PREFIX_SUB) {
            let (_key, val) = kv_res.context(ERR_ITER_FAILURE)?;
            let record: SubRecord = utils::decode_model(&val)?;
            next_sub_id = next_sub_id.max(record.id);
            subs_count += 1;
        }
        Ok(Self { tree, limits, inner: Mutex::new(FileSubLogInner { next_sub_id, subs_count }) })
    }

    fn write_record(&self, record: &SubRecord) -> Result<(), StoreError> {
        let encoded = utils::encode_model(record).map_err(storage_err)?;
        self.tree
            .insert(utils::encode_byte_prefix(PREFIX_SUB, record.id), encoded)
            .map_err(storage_err)?;
        Ok(())
    }

    fn read_record(&self, sub_id: u64) -> Result<Option<SubRecord>, StoreError> {
        let val = self
            .tree
            .get(utils::encode_byte_prefix(PREFIX_SUB, sub_id))
            .map_err(storage_err)?;
        val.map(|val| utils::decode_model(&val).map_err(storage_err)).transpose()
    }
}

impl SubLog for FileSubLog {
    fn create_sub(&self, record: &mut SubRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.subs_count >= self.limits.max_subs {
            return Err(StoreError::TooManySubs);
        }
        inner.next_sub_id += 1;
        inner.subs_count += 1;
        record.id = inner.next_sub_id;
        drop(inner);
        self.write_record(record)
    }

    fn update_last_sent(&self, sub_id: u64, last_sent: u64) -> Result<(), StoreError> {
        let record = self
            .read_record(sub_id)?
            .ok_or_else(|| storage_err(anyhow!("no subscription record found for ID {}", sub_id)))?;
        if last_sent > record.last_sent {
            self.write_record(&SubRecord { last_sent, ..record })?;
        }
        Ok(())
    }

    fn delete_sub(&self, sub_id: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.subs_count = inner.subs_count.saturating_sub(1);
        drop(inner);
        self.tree
            .remove(utils::encode_byte_prefix(PREFIX_SUB, sub_id))
            .map_err(storage_err)?;
        // Drop any pending sequence records along with the subscription.
        let start = utils::encode_byte_prefix_pair(PREFIX_PENDING, sub_id, 0);
        let stop = utils::encode_byte_prefix_pair(PREFIX_PENDING, sub_id, u64::MAX);
        let keys: Vec<_> = self
            .tree
            .range(start..=stop)
            .keys()
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage_err)?;
        for key in keys {
            self.tree.remove(key).map_err(storage_err)?;
        }
        Ok(())
    }

    fn add_seq_pending(&self, sub_id: u64, seq: u64) -> Result<(), StoreError> {
        self.tree
            .insert(utils::encode_byte_prefix_pair(PREFIX_PENDING, sub_id, seq), vec![])
            .map_err(storage_err)?;
        Ok(())
    }

    fn ack_seq_pending(&self, sub_id: u64, seq: u64) -> Result<(), StoreError> {
        self.tree
            .remove(utils::encode_byte_prefix_pair(PREFIX_PENDING, sub_id, seq))
            .map_err(storage_err)?;
        Ok(())
    }
}

/// The sled-backed client log.
pub struct FileClientLog {
    tree: Tree,
}

impl ClientLog for FileClientLog {
    fn add_client(&self, client_id: &str, hb_inbox: &str) -> Result<(), StoreError> {
        self.tree
            .insert(client_id.as_bytes(), hb_inbox.as_bytes())
            .map_err(storage_err)?;
        Ok(())
    }

    fn delete_client(&self, client_id: &str) -> Result<(), StoreError> {
        self.tree.remove(client_id.as_bytes()).map_err(storage_err)?;
        Ok(())
    }
}
