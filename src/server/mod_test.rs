use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use crate::client::{Connection, Message, MessageHandler, StartAt, SubscriptionOptions};
use crate::config::Config;
use crate::proto::ConnectRequest;
use crate::server::Server;
use crate::store::{FileStore, MemoryStore, Store, StoreLimits};
use crate::transport::{MemoryTransport, Transport};
use crate::utils;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn setup(cluster_id: &str) -> Result<(Server, Arc<MemoryTransport>)> {
    let config = Config::new_test(cluster_id);
    let transport = Arc::new(MemoryTransport::new());
    let store = Arc::new(MemoryStore::new(StoreLimits::default()));
    let server = Server::start(config, transport.clone(), store).context("error starting server")?;
    Ok((server, transport))
}

fn collector() -> (MessageHandler, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: MessageHandler = Arc::new(move |msg| {
        let _res = tx.send(msg);
    });
    (handler, rx)
}

async fn recv_msg(rx: &mut mpsc::UnboundedReceiver<Message>) -> Result<Message> {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .context("timeout awaiting delivery")?
        .context("delivery channel closed")
}

async fn assert_no_msg(rx: &mut mpsc::UnboundedReceiver<Message>, wait: Duration) {
    let res = tokio::time::timeout(wait, rx.recv()).await;
    assert!(res.is_err(), "expected no delivery, got one with seq {:?}", res.ok().flatten().map(|m| m.sequence));
}

#[tokio::test]
async fn basic_fanout_delivers_in_order() -> Result<()> {
    let (_server, transport) = setup("fanout")?;
    let conn = Connection::connect(transport.clone(), "fanout", "c1").await?;

    for payload in ["a", "b", "c"] {
        conn.publish("foo", payload.as_bytes()).await?;
    }

    let (handler, mut rx) = collector();
    let sub = conn
        .subscribe("foo", SubscriptionOptions { start_at: StartAt::First, ..Default::default() }, handler)
        .await?;
    for (idx, payload) in ["a", "b", "c"].iter().enumerate() {
        let msg = recv_msg(&mut rx).await?;
        assert_eq!(msg.sequence, idx as u64 + 1, "expected dense in-order sequences");
        assert_eq!(msg.data, payload.as_bytes(), "payload mismatch at seq {}", msg.sequence);
        assert!(!msg.redelivered, "first deliveries must not be flagged redelivered");
    }
    sub.unsubscribe().await?;
    conn.close().await?;
    Ok(())
}

#[tokio::test]
async fn ack_wait_expiry_redelivers_exactly_once() -> Result<()> {
    let (_server, transport) = setup("redelivery")?;
    let conn = Connection::connect(transport.clone(), "redelivery", "c1").await?;

    let (handler, mut rx) = collector();
    let _sub = conn
        .subscribe(
            "foo",
            SubscriptionOptions {
                manual_acks: true,
                ack_wait: Duration::from_secs(1),
                max_in_flight: 1,
                start_at: StartAt::First,
                ..Default::default()
            },
            handler,
        )
        .await?;
    conn.publish("foo", b"hello").await?;

    let first = recv_msg(&mut rx).await?;
    assert_eq!(first.sequence, 1);
    assert!(!first.redelivered);

    // Withhold the ack; exactly one redelivery is expected.
    let second = recv_msg(&mut rx).await?;
    assert_eq!(second.sequence, 1, "redelivery must carry the original sequence");
    assert!(second.redelivered, "redelivery must be flagged");
    assert_no_msg(&mut rx, Duration::from_millis(1500)).await;

    second.ack().context("error acking redelivered message")?;
    conn.close().await?;
    Ok(())
}

#[tokio::test]
async fn queue_group_balances_across_members() -> Result<()> {
    let (_server, transport) = setup("balance")?;
    let conn = Connection::connect(transport.clone(), "balance", "c1").await?;

    let opts = SubscriptionOptions {
        manual_acks: true,
        max_in_flight: 10,
        start_at: StartAt::First,
        ..Default::default()
    };
    let (handler_a, mut rx_a) = collector();
    let (handler_b, mut rx_b) = collector();
    let _sub_a = conn.queue_subscribe("foo", "g", opts.clone(), handler_a).await?;
    let _sub_b = conn.queue_subscribe("foo", "g", opts, handler_b).await?;

    for idx in 0..4u8 {
        conn.publish("foo", &[idx]).await?;
    }
    tokio::time::sleep(Duration::from_millis(250)).await;

    let mut count_a = 0;
    while let Ok(Some(_msg)) = tokio::time::timeout(Duration::from_millis(50), rx_a.recv()).await {
        count_a += 1;
    }
    let mut count_b = 0;
    while let Ok(Some(_msg)) = tokio::time::timeout(Duration::from_millis(50), rx_b.recv()).await {
        count_b += 1;
    }
    assert_eq!(count_a + count_b, 4, "every message goes to exactly one member");
    assert!(
        (count_a as i64 - count_b as i64).abs() <= 1,
        "expected balanced assignment, got {}/{}",
        count_a,
        count_b,
    );
    conn.close().await?;
    Ok(())
}

#[tokio::test]
async fn durable_reattach_resumes_after_last_ack() -> Result<()> {
    let (_server, transport) = setup("durable")?;
    let publisher = Connection::connect(transport.clone(), "durable", "pub").await?;
    publisher.publish("foo", b"one").await?;

    let opts = SubscriptionOptions { durable_name: "d1".into(), start_at: StartAt::First, ..Default::default() };
    let conn = Connection::connect(transport.clone(), "durable", "c1").await?;
    let (handler, mut rx) = collector();
    let _sub = conn.subscribe("foo", opts.clone(), handler).await?;
    let msg = recv_msg(&mut rx).await?;
    assert_eq!(msg.sequence, 1);
    // Let the auto-ack land before disconnecting.
    tokio::time::sleep(Duration::from_millis(200)).await;
    conn.close().await?;

    publisher.publish("foo", b"two").await?;

    let conn = Connection::connect(transport.clone(), "durable", "c1").await?;
    let (handler, mut rx) = collector();
    let _sub = conn.subscribe("foo", opts, handler).await?;
    let msg = recv_msg(&mut rx).await?;
    assert_eq!(msg.sequence, 2, "expected the durable to resume after its last acked sequence");
    conn.close().await?;
    publisher.close().await?;
    Ok(())
}

#[tokio::test]
async fn duplicate_durable_registration_rejected() -> Result<()> {
    let (_server, transport) = setup("durable-dup")?;
    let conn = Connection::connect(transport.clone(), "durable-dup", "c1").await?;
    let opts = SubscriptionOptions { durable_name: "d1".into(), ..Default::default() };
    let (handler, _rx) = collector();
    let _sub = conn.subscribe("foo", opts.clone(), handler.clone()).await?;

    let res = conn.subscribe("foo", opts, handler).await;
    let err = res.err().context("expected duplicate durable registration to be rejected")?;
    assert!(err.to_string().contains("duplicate durable"), "unexpected error: {}", err);
    conn.close().await?;
    Ok(())
}

#[tokio::test]
async fn durable_queue_group_shadow_survives_members_leaving() -> Result<()> {
    let (server, transport) = setup("shadow")?;
    let publisher = Connection::connect(transport.clone(), "shadow", "pub").await?;

    let opts = SubscriptionOptions { durable_name: "d".into(), start_at: StartAt::First, ..Default::default() };
    let members = Connection::connect(transport.clone(), "shadow", "members").await?;
    let (handler, mut rx) = collector();
    let _sub_a = members.queue_subscribe("foo", "g", opts.clone(), handler.clone()).await?;
    let _sub_b = members.queue_subscribe("foo", "g", opts.clone(), handler).await?;

    for payload in ["one", "two", "three"] {
        publisher.publish("foo", payload.as_bytes()).await?;
    }
    for _ in 0..3 {
        recv_msg(&mut rx).await?;
    }
    // Let auto-acks land, then drop both members by closing their connection.
    tokio::time::sleep(Duration::from_millis(200)).await;
    members.close().await?;

    {
        let chan = server.inner.channels.lookup("foo").context("expected channel")?;
        let group = chan.subs.lookup_group("d:g").context("expected durable queue group to survive")?;
        let qinner = group.lock();
        assert!(qinner.subs.is_empty(), "expected no live members");
        assert!(qinner.shadow.is_some(), "expected a shadow to be parked");
        assert_eq!(qinner.last_sent, 3, "expected group progress to survive");
    }

    publisher.publish("foo", b"four").await?;

    let revived = Connection::connect(transport.clone(), "shadow", "revived").await?;
    let (handler, mut rx) = collector();
    let _sub = revived.queue_subscribe("foo", "g", opts, handler).await?;
    let msg = recv_msg(&mut rx).await?;
    assert_eq!(msg.sequence, 4, "expected the revived group to resume at the shadow's progress");
    assert!(!msg.redelivered);

    revived.close().await?;
    publisher.close().await?;
    Ok(())
}

#[tokio::test]
async fn time_delta_start_resolves_to_matching_sequence() -> Result<()> {
    let (_server, transport) = setup("timestart")?;
    let conn = Connection::connect(transport.clone(), "timestart", "c1").await?;

    for payload in ["one", "two", "three"] {
        conn.publish("foo", payload.as_bytes()).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Read the stored timestamps back through a throwaway subscription.
    let (handler, mut rx) = collector();
    let probe = conn
        .subscribe("foo", SubscriptionOptions { start_at: StartAt::First, ..Default::default() }, handler)
        .await?;
    let _msg1 = recv_msg(&mut rx).await?;
    let msg2 = recv_msg(&mut rx).await?;
    let _msg3 = recv_msg(&mut rx).await?;
    probe.unsubscribe().await?;

    // Aim between msg1 and msg2 so the resolved start is msg2.
    let target = msg2.timestamp - Duration::from_millis(20).as_nanos() as i64;
    let delta = crate::server::unix_now_nanos() - target;
    let (handler, mut rx) = collector();
    let _sub = conn
        .subscribe(
            "foo",
            SubscriptionOptions { start_at: StartAt::TimeDelta(Duration::from_nanos(delta as u64)), ..Default::default() },
            handler,
        )
        .await?;
    let msg = recv_msg(&mut rx).await?;
    assert_eq!(msg.sequence, 2, "expected delivery to start at the first message at or after the target time");
    conn.close().await?;
    Ok(())
}

#[tokio::test]
async fn wildcard_subjects_rejected() -> Result<()> {
    let (_server, transport) = setup("wildcards")?;
    let conn = Connection::connect(transport.clone(), "wildcards", "c1").await?;

    let err = conn.publish("foo.*", b"x").await.err().context("expected wildcard publish to fail")?;
    assert!(err.to_string().contains("invalid subject"), "unexpected error: {}", err);

    let (handler, _rx) = collector();
    let err = conn
        .subscribe("foo.>", SubscriptionOptions::default(), handler)
        .await
        .err()
        .context("expected wildcard subscribe to fail")?;
    assert!(err.to_string().contains("invalid subject"), "unexpected error: {}", err);
    conn.close().await?;
    Ok(())
}

#[tokio::test]
async fn invalid_subscription_requests_rejected() -> Result<()> {
    let (_server, transport) = setup("invalid-subs")?;
    let conn = Connection::connect(transport.clone(), "invalid-subs", "c1").await?;
    conn.publish("foo", b"x").await?;

    let (handler, _rx) = collector();
    let err = conn
        .subscribe("foo", SubscriptionOptions { ack_wait: Duration::from_millis(100), ..Default::default() }, handler.clone())
        .await
        .err()
        .context("expected sub-second ack wait to be rejected")?;
    assert!(err.to_string().contains("invalid ack wait"), "unexpected error: {}", err);

    let err = conn
        .subscribe("foo", SubscriptionOptions { durable_name: "qsub:".into(), ..Default::default() }, handler.clone())
        .await
        .err()
        .context("expected colon in durable name to be rejected")?;
    assert!(err.to_string().contains("durable name"), "unexpected error: {}", err);

    let err = conn
        .subscribe("foo", SubscriptionOptions { start_at: StartAt::Sequence(42), ..Default::default() }, handler.clone())
        .await
        .err()
        .context("expected out-of-range start sequence to be rejected")?;
    assert!(err.to_string().contains("invalid start sequence"), "unexpected error: {}", err);

    let err = conn
        .subscribe(
            "foo",
            SubscriptionOptions { start_at: StartAt::TimeDelta(Duration::from_secs(3600)), ..Default::default() },
            handler,
        )
        .await
        .err()
        .context("expected out-of-range start time to be rejected")?;
    assert!(err.to_string().contains("invalid start time"), "unexpected error: {}", err);

    conn.close().await?;
    Ok(())
}

#[tokio::test]
async fn duplicate_client_rejected() -> Result<()> {
    let (_server, transport) = setup("dup-client")?;
    let conn = Connection::connect(transport.clone(), "dup-client", "c1").await?;
    let err = Connection::connect(transport.clone(), "dup-client", "c1")
        .await
        .err()
        .context("expected duplicate client ID to be rejected")?;
    assert!(err.to_string().contains("already registered"), "unexpected error: {}", err);

    // After closing, the ID becomes available again.
    conn.close().await?;
    let conn = Connection::connect(transport.clone(), "dup-client", "c1").await?;
    conn.close().await?;
    Ok(())
}

#[tokio::test]
async fn max_in_flight_caps_delivery_and_ack_resumes() -> Result<()> {
    let (_server, transport) = setup("stall")?;
    let conn = Connection::connect(transport.clone(), "stall", "c1").await?;
    for idx in 0..3u8 {
        conn.publish("foo", &[idx]).await?;
    }

    let (handler, mut rx) = collector();
    let _sub = conn
        .subscribe(
            "foo",
            SubscriptionOptions { manual_acks: true, max_in_flight: 1, start_at: StartAt::First, ..Default::default() },
            handler,
        )
        .await?;

    let first = recv_msg(&mut rx).await?;
    assert_eq!(first.sequence, 1);
    assert_no_msg(&mut rx, Duration::from_millis(300)).await;

    // Acking twice is idempotent and releases exactly one slot.
    first.ack()?;
    first.ack()?;
    let second = recv_msg(&mut rx).await?;
    assert_eq!(second.sequence, 2, "expected the stalled subscription to resume on ack");
    assert_no_msg(&mut rx, Duration::from_millis(300)).await;

    second.ack()?;
    let third = recv_msg(&mut rx).await?;
    assert_eq!(third.sequence, 3);
    third.ack()?;
    conn.close().await?;
    Ok(())
}

#[tokio::test]
async fn unsubscribe_stops_delivery() -> Result<()> {
    let (_server, transport) = setup("unsub")?;
    let conn = Connection::connect(transport.clone(), "unsub", "c1").await?;

    let (handler, mut rx) = collector();
    let sub = conn.subscribe("foo", SubscriptionOptions::default(), handler).await?;
    conn.publish("foo", b"one").await?;
    let msg = recv_msg(&mut rx).await?;
    assert_eq!(msg.sequence, 1);

    sub.unsubscribe().await?;
    conn.publish("foo", b"two").await?;
    assert_no_msg(&mut rx, Duration::from_millis(300)).await;
    conn.close().await?;
    Ok(())
}

#[tokio::test]
async fn close_removes_non_durable_subscriptions() -> Result<()> {
    let (server, transport) = setup("close")?;
    let conn = Connection::connect(transport.clone(), "close", "c1").await?;
    let (handler, _rx) = collector();
    let _sub = conn.subscribe("foo", SubscriptionOptions::default(), handler).await?;
    conn.close().await?;

    let chan = server.inner.channels.lookup("foo").context("expected channel")?;
    assert!(chan.subs.read().psubs.is_empty(), "expected plain subscription to be removed on close");
    assert_eq!(server.inner.clients.count(), 0, "expected client registration to be released");
    Ok(())
}

#[tokio::test]
async fn queue_member_leave_transfers_pending_messages() -> Result<()> {
    let (_server, transport) = setup("transfer")?;
    let conn = Connection::connect(transport.clone(), "transfer", "c1").await?;
    conn.publish("foo", b"msg1").await?;

    // First member holds the message without acking.
    let (handler_a, mut rx_a) = collector();
    let sub_a = conn
        .queue_subscribe(
            "foo",
            "group",
            SubscriptionOptions { manual_acks: true, max_in_flight: 1, start_at: StartAt::First, ..Default::default() },
            handler_a,
        )
        .await?;
    let held = recv_msg(&mut rx_a).await?;
    assert_eq!(held.sequence, 1);

    // Second member joins with a short ack wait, then the first leaves.
    let (handler_b, mut rx_b) = collector();
    let _sub_b = conn
        .queue_subscribe(
            "foo",
            "group",
            SubscriptionOptions { manual_acks: true, ack_wait: Duration::from_secs(1), ..Default::default() },
            handler_b,
        )
        .await?;
    sub_a.unsubscribe().await?;

    let transferred = recv_msg(&mut rx_b).await?;
    assert_eq!(transferred.sequence, 1, "expected the in-flight message to move to the remaining member");
    assert!(transferred.redelivered, "transferred deliveries are redeliveries");
    transferred.ack()?;
    conn.close().await?;
    Ok(())
}

#[tokio::test]
async fn heartbeat_timeout_closes_unresponsive_client() -> Result<()> {
    let (server, transport) = setup("heartbeats")?;

    // Hand-roll a connect whose heartbeat inbox nobody answers.
    let req = ConnectRequest {
        client_id: "silent".into(),
        heartbeat_inbox: transport.new_inbox(),
    };
    let discover = format!("_STAN.discover.{}", "heartbeats");
    let reply = transport
        .request(&discover, utils::encode_model(&req)?, Duration::from_secs(2))
        .await
        .ok()
        .context("timeout awaiting connect response")?;
    assert!(!reply.data.is_empty(), "expected a connect response");
    assert_eq!(server.inner.clients.count(), 1, "expected the client to be registered");

    // Probes run every 250ms with a 250ms timeout and tolerate 3 failures.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if server.inner.clients.count() == 0 {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("expected the unresponsive client to be closed by the heartbeat monitor");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Ok(())
}

#[tokio::test]
async fn file_store_restart_preserves_durable_progress() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir")?;
    let opts = SubscriptionOptions { durable_name: "d1".into(), start_at: StartAt::First, ..Default::default() };

    {
        let config = Config::new_test("restart");
        let transport = Arc::new(MemoryTransport::new());
        let store: Arc<dyn Store> = Arc::new(FileStore::open(tmpdir.path(), StoreLimits::default())?);
        let server = Server::start(config, transport.clone(), store)?;

        let conn = Connection::connect(transport.clone(), "restart", "c1").await?;
        conn.publish("foo", b"one").await?;
        conn.publish("foo", b"two").await?;
        let (handler, mut rx) = collector();
        let _sub = conn.subscribe("foo", opts.clone(), handler).await?;
        assert_eq!(recv_msg(&mut rx).await?.sequence, 1);
        assert_eq!(recv_msg(&mut rx).await?.sequence, 2);
        tokio::time::sleep(Duration::from_millis(200)).await;
        conn.close().await?;
        server.shutdown();
        transport.close();
    }

    let config = Config::new_test("restart");
    let transport = Arc::new(MemoryTransport::new());
    let store: Arc<dyn Store> = Arc::new(FileStore::open(tmpdir.path(), StoreLimits::default())?);
    let _server = Server::start(config, transport.clone(), store)?;

    let conn = Connection::connect(transport.clone(), "restart", "c1").await?;
    conn.publish("foo", b"three").await?;
    let (handler, mut rx) = collector();
    let _sub = conn.subscribe("foo", opts, handler).await?;
    let msg = recv_msg(&mut rx).await?;
    assert_eq!(msg.sequence, 3, "expected the recovered durable to resume after its stored progress");
    conn.close().await?;
    Ok(())
}
