use anyhow::{Context, Result};

use crate::models::SubRecord;
use crate::store::{FileStore, Store, StoreLimits};

fn open_store(dir: &tempfile::TempDir) -> Result<FileStore> {
    FileStore::open(dir.path(), StoreLimits::default()).context("error opening file store")
}

#[tokio::test]
async fn messages_survive_reopen() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir")?;
    {
        let store = open_store(&tmpdir)?;
        let chan = store.create_channel("foo")?;
        for idx in 0..5u8 {
            chan.msgs.append("foo", "", &[idx])?;
        }
        store.close().context("error closing store")?;
    }

    let store = open_store(&tmpdir)?;
    let recovered = store.recover().context("error recovering store")?;
    assert_eq!(recovered.len(), 1, "expected one recovered channel");
    assert_eq!(recovered[0].name, "foo");

    let chan = store.lookup_channel("foo").context("expected recovered channel to be registered")?;
    assert_eq!(chan.msgs.first_sequence(), 1);
    assert_eq!(chan.msgs.last_sequence(), 5);
    let (count, bytes) = chan.msgs.state();
    assert_eq!(count, 5);
    assert_eq!(bytes, 5);
    let msg = chan.msgs.lookup(3).context("expected recovered message")?;
    assert_eq!(msg.sequence, 3);
    assert_eq!(msg.data, vec![2]);

    let appended = chan.msgs.append("foo", "", b"x")?;
    assert_eq!(appended.sequence, 6, "expected appends to continue after the recovered last sequence");
    Ok(())
}

#[tokio::test]
async fn sub_records_and_pending_survive_reopen() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir")?;
    let sub_id = {
        let store = open_store(&tmpdir)?;
        let chan = store.create_channel("foo")?;
        let mut record = SubRecord {
            client_id: "c1".into(),
            subject: "foo".into(),
            durable_name: "dur".into(),
            max_in_flight: 16,
            ack_wait_in_secs: 30,
            last_sent: 2,
            is_durable: true,
            ..Default::default()
        };
        chan.subs.create_sub(&mut record)?;
        chan.subs.add_seq_pending(record.id, 1)?;
        chan.subs.add_seq_pending(record.id, 2)?;
        chan.subs.ack_seq_pending(record.id, 1)?;
        chan.subs.update_last_sent(record.id, 4)?;
        // Stale update must not roll the persisted value back.
        chan.subs.update_last_sent(record.id, 3)?;
        store.close()?;
        record.id
    };

    let store = open_store(&tmpdir)?;
    let recovered = store.recover()?;
    let channel = recovered.iter().find(|chan| chan.name == "foo").context("expected recovered channel")?;
    assert_eq!(channel.subs.len(), 1, "expected one recovered subscription");
    let sub = &channel.subs[0];
    assert_eq!(sub.record.id, sub_id);
    assert_eq!(sub.record.durable_name, "dur");
    assert_eq!(sub.record.last_sent, 4, "expected the monotonic last_sent update to persist");
    assert_eq!(sub.pending, vec![2], "expected only the unacked sequence to survive");
    Ok(())
}

#[tokio::test]
async fn delete_sub_drops_record_and_pending() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir")?;
    {
        let store = open_store(&tmpdir)?;
        let chan = store.create_channel("foo")?;
        let mut record = SubRecord { is_durable: true, ..Default::default() };
        chan.subs.create_sub(&mut record)?;
        chan.subs.add_seq_pending(record.id, 7)?;
        chan.subs.delete_sub(record.id)?;
        store.close()?;
    }

    let store = open_store(&tmpdir)?;
    let recovered = store.recover()?;
    let channel = recovered.iter().find(|chan| chan.name == "foo").context("expected recovered channel")?;
    assert!(channel.subs.is_empty(), "expected deleted subscription to be gone, got {}", channel.subs.len());
    Ok(())
}
