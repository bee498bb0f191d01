use std::time::Duration;

use anyhow::{Context, Result};
use rand::prelude::*;

use crate::models::SubRecord;
use crate::store::{MemoryStore, Store, StoreError, StoreLimits};

fn small_limits() -> StoreLimits {
    StoreLimits { max_channels: 2, max_msgs: 5, max_bytes: 1024 * 1024, max_subs: 2 }
}

#[tokio::test]
async fn append_assigns_dense_sequences() -> Result<()> {
    let store = MemoryStore::new(StoreLimits::default());
    let chan = store.create_channel("foo").context("error creating channel")?;

    let total = rand::thread_rng().gen_range(50..100u64);
    for idx in 0..total {
        let msg = chan.msgs.append("foo", "", &[idx as u8]).context("error appending message")?;
        assert_eq!(msg.sequence, idx + 1, "expected dense sequences starting at 1");
        assert!(!msg.redelivered, "stored messages must not be flagged redelivered");
    }
    assert_eq!(chan.msgs.first_sequence(), 1);
    assert_eq!(chan.msgs.last_sequence(), total);
    for seq in chan.msgs.first_sequence()..=chan.msgs.last_sequence() {
        let msg = chan.msgs.lookup(seq).context("expected message in dense range")?;
        assert_eq!(msg.sequence, seq, "lookup returned wrong sequence");
    }
    Ok(())
}

#[tokio::test]
async fn retention_evicts_oldest_first() -> Result<()> {
    let store = MemoryStore::new(small_limits());
    let chan = store.create_channel("foo").context("error creating channel")?;

    for idx in 0..8u8 {
        chan.msgs.append("foo", "", &[idx; 4]).context("error appending message")?;
    }
    assert_eq!(chan.msgs.first_sequence(), 4, "expected first sequence to advance on eviction");
    assert_eq!(chan.msgs.last_sequence(), 8);
    assert!(chan.msgs.lookup(3).is_none(), "expected evicted message to be gone");
    assert!(chan.msgs.lookup(4).is_some(), "expected first retained message to be present");

    let (count, bytes) = chan.msgs.state();
    assert_eq!(count, 5, "expected count capped at the limit");
    assert_eq!(bytes, 5 * 4, "expected byte total to track retained payloads");
    Ok(())
}

#[tokio::test]
async fn sequence_for_timestamp_bounds() -> Result<()> {
    let store = MemoryStore::new(StoreLimits::default());
    let chan = store.create_channel("foo").context("error creating channel")?;

    assert_eq!(chan.msgs.sequence_for_timestamp(0), 1, "empty log should return the sentinel last+1");

    let first = chan.msgs.append("foo", "", b"a")?;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = chan.msgs.append("foo", "", b"b")?;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let third = chan.msgs.append("foo", "", b"c")?;

    assert_eq!(chan.msgs.sequence_for_timestamp(first.timestamp - 1), 1, "older than all should resolve to first");
    assert_eq!(chan.msgs.sequence_for_timestamp(second.timestamp), 2, "exact timestamp should resolve to its sequence");
    assert_eq!(
        chan.msgs.sequence_for_timestamp(second.timestamp + 1),
        3,
        "between two messages should resolve to the later one",
    );
    assert_eq!(
        chan.msgs.sequence_for_timestamp(third.timestamp + 1),
        4,
        "newer than all should resolve to the last+1 sentinel",
    );
    Ok(())
}

#[tokio::test]
async fn sub_log_assigns_ids_and_enforces_limit() -> Result<()> {
    let store = MemoryStore::new(small_limits());
    let chan = store.create_channel("foo").context("error creating channel")?;

    let mut first = SubRecord::default();
    let mut second = SubRecord::default();
    chan.subs.create_sub(&mut first).context("error creating first sub")?;
    chan.subs.create_sub(&mut second).context("error creating second sub")?;
    assert_ne!(first.id, 0, "expected assigned sub ID");
    assert_ne!(first.id, second.id, "expected distinct sub IDs");

    let mut third = SubRecord::default();
    let res = chan.subs.create_sub(&mut third);
    assert!(matches!(res, Err(StoreError::TooManySubs)), "expected sub limit to be enforced");

    chan.subs.delete_sub(second.id).context("error deleting sub")?;
    chan.subs.create_sub(&mut third).context("expected sub creation after delete")?;
    Ok(())
}

#[tokio::test]
async fn channel_limit_enforced_and_creation_idempotent() -> Result<()> {
    let store = MemoryStore::new(small_limits());
    store.create_channel("one").context("error creating channel")?;
    store.create_channel("one").context("channel creation should be idempotent")?;
    store.create_channel("two").context("error creating channel")?;
    let res = store.create_channel("three");
    assert!(matches!(res, Err(StoreError::TooManyChannels)), "expected channel limit to be enforced");
    assert!(store.lookup_channel("one").is_some());
    assert!(store.lookup_channel("three").is_none());
    Ok(())
}

#[tokio::test]
async fn msgs_state_aggregates_all_channels() -> Result<()> {
    let store = MemoryStore::new(StoreLimits::default());
    let one = store.create_channel("one")?;
    let two = store.create_channel("two")?;
    one.msgs.append("one", "", b"aaaa")?;
    two.msgs.append("two", "", b"bb")?;
    two.msgs.append("two", "", b"bb")?;

    let (count, bytes) = store.msgs_state("*").context("error reading aggregate state")?;
    assert_eq!(count, 3, "expected aggregate count across channels");
    assert_eq!(bytes, 8, "expected aggregate bytes across channels");

    let (count, bytes) = store.msgs_state("one")?;
    assert_eq!((count, bytes), (1, 4), "expected per-channel state");
    Ok(())
}
