use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use crate::transport::memory::{parse_pattern, pattern_matches};
use crate::transport::{MemoryTransport, Transport, TransportError, TransportMessage};

fn subject_tokens(subject: &str) -> Vec<&str> {
    subject.split('.').collect()
}

#[test]
fn parse_pattern_rejects_interior_tail_wildcard() {
    assert!(parse_pattern("foo.>.bar").is_err(), "expected interior > token to be rejected");
    assert!(parse_pattern("foo..bar").is_err(), "expected empty token to be rejected");
    assert!(parse_pattern("foo.>").is_ok(), "expected trailing > token to be accepted");
}

#[test]
fn pattern_matching_behavior() {
    let cases = vec![
        ("foo.bar", "foo.bar", true),
        ("foo.bar", "foo.baz", false),
        ("foo.*", "foo.bar", true),
        ("foo.*", "foo.bar.baz", false),
        ("foo.>", "foo.bar", true),
        ("foo.>", "foo.bar.baz", true),
        ("foo.>", "foo", false),
        ("foo", "foo.bar", false),
    ];
    for (pattern, subject, expected) in cases {
        let parsed = parse_pattern(pattern).unwrap();
        let got = pattern_matches(&parsed, &subject_tokens(subject));
        assert_eq!(got, expected, "pattern {} vs subject {}: expected {}, got {}", pattern, subject, expected, got);
    }
}

#[tokio::test]
async fn publish_delivers_in_order() -> Result<()> {
    let transport = MemoryTransport::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<TransportMessage>();
    let _handle = transport.subscribe(
        "orders.created",
        Arc::new(move |msg| {
            let _res = tx.send(msg);
        }),
    )?;

    for idx in 0..100u32 {
        transport.publish("orders.created", idx.to_be_bytes().to_vec())?;
    }
    for idx in 0..100u32 {
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .context("timeout awaiting delivery")?
            .context("delivery channel closed")?;
        assert_eq!(msg.data, idx.to_be_bytes().to_vec(), "out of order delivery at index {}", idx);
    }
    Ok(())
}

#[tokio::test]
async fn tail_wildcard_interest_receives_nested_subjects() -> Result<()> {
    let transport = MemoryTransport::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<TransportMessage>();
    let _handle = transport.subscribe(
        "events.>",
        Arc::new(move |msg| {
            let _res = tx.send(msg);
        }),
    )?;

    transport.publish("events.a", b"one".to_vec())?;
    transport.publish("events.a.b.c", b"two".to_vec())?;
    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?.context("channel closed")?;
    let second = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?.context("channel closed")?;
    assert_eq!(first.subject, "events.a");
    assert_eq!(second.subject, "events.a.b.c");
    Ok(())
}

#[tokio::test]
async fn request_reply_roundtrip() -> Result<()> {
    let transport = MemoryTransport::new();
    let responder = transport.clone();
    let _handle = transport.subscribe(
        "echo",
        Arc::new(move |msg| {
            let _res = responder.publish(&msg.reply, msg.data);
        }),
    )?;

    let reply = transport
        .request("echo", b"ping".to_vec(), Duration::from_secs(5))
        .await
        .context("error from request")?;
    assert_eq!(reply.data, b"ping".to_vec(), "expected echoed payload");
    Ok(())
}

#[tokio::test]
async fn request_times_out_without_responder() -> Result<()> {
    let transport = MemoryTransport::new();
    let res = transport.request("nobody.home", Vec::new(), Duration::from_millis(50)).await;
    assert!(
        matches!(res, Err(TransportError::Timeout(_))),
        "expected timeout error, got {:?}",
        res.map(|msg| msg.subject),
    );
    Ok(())
}

#[tokio::test]
async fn unsubscribe_stops_delivery() -> Result<()> {
    let transport = MemoryTransport::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<TransportMessage>();
    let handle = transport.subscribe(
        "updates",
        Arc::new(move |msg| {
            let _res = tx.send(msg);
        }),
    )?;

    transport.publish("updates", b"before".to_vec())?;
    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?.context("channel closed")?;
    assert_eq!(first.data, b"before".to_vec());

    transport.unsubscribe(&handle);
    transport.publish("updates", b"after".to_vec())?;
    let res = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(
        matches!(res, Ok(None) | Err(_)),
        "expected no further deliveries after unsubscribe",
    );
    Ok(())
}
