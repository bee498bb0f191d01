//! The in-process transport implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::transport::{InterestHandle, MsgHandler, Transport, TransportError, TransportMessage};

/// An in-process subject router.
///
/// Each subscription owns an unbounded queue drained by a dedicated task, so
/// deliveries to a single subscription arrive in publish order while distinct
/// subscriptions are served in parallel.
pub struct MemoryTransport {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    routes: RwLock<HashMap<u64, Route>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

struct Route {
    pattern: Vec<PatternToken>,
    queue: mpsc::UnboundedSender<TransportMessage>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) enum PatternToken {
    Literal(String),
    /// The `*` single-token wildcard.
    Any,
    /// The `>` tail wildcard, valid only as the final token.
    Tail,
}

impl MemoryTransport {
    /// Create a new instance.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RouterInner {
                routes: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Shut the router down, dropping all interest.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.routes.write().clear();
    }

    fn route_to(&self, subject: &str, reply: &str, data: Vec<u8>) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let tokens: Vec<&str> = subject.split('.').collect();
        if tokens.iter().any(|token| token.is_empty()) {
            return Err(TransportError::InvalidSubject(subject.to_string()));
        }
        let routes = self.inner.routes.read();
        for route in routes.values() {
            if pattern_matches(&route.pattern, &tokens) {
                // Dropped receivers are cleaned up on unsubscribe; a failed
                // send here just means the interest is already gone.
                let _res = route.queue.send(TransportMessage {
                    subject: subject.to_string(),
                    reply: reply.to_string(),
                    data: data.clone(),
                });
            }
        }
        Ok(())
    }
}

impl Clone for MemoryTransport {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn new_inbox(&self) -> String {
        format!("_INBOX.{}", Uuid::new_v4().to_simple())
    }

    fn subscribe(&self, subject: &str, handler: MsgHandler) -> Result<InterestHandle, TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let pattern = parse_pattern(subject)?;
        let (tx, mut rx) = mpsc::unbounded_channel::<TransportMessage>();
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.routes.write().insert(id, Route { pattern, queue: tx });

        // The drain task serializes handler invocations for this interest.
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                handler(msg);
            }
        });
        Ok(InterestHandle { id })
    }

    fn unsubscribe(&self, handle: &InterestHandle) {
        self.inner.routes.write().remove(&handle.id);
    }

    fn publish(&self, subject: &str, data: Vec<u8>) -> Result<(), TransportError> {
        self.route_to(subject, "", data)
    }

    fn publish_request(&self, subject: &str, reply: &str, data: Vec<u8>) -> Result<(), TransportError> {
        self.route_to(subject, reply, data)
    }

    async fn request(&self, subject: &str, data: Vec<u8>, timeout: Duration) -> Result<TransportMessage, TransportError> {
        let inbox = self.new_inbox();
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let handle = self.subscribe(
            &inbox,
            Arc::new(move |msg| {
                if let Some(tx) = slot.lock().take() {
                    let _res = tx.send(msg);
                }
            }),
        )?;
        let res = match self.publish_request(subject, &inbox, data) {
            Ok(()) => tokio::time::timeout(timeout, rx).await,
            Err(err) => {
                self.unsubscribe(&handle);
                return Err(err);
            }
        };
        self.unsubscribe(&handle);
        match res {
            Ok(Ok(msg)) => Ok(msg),
            _ => Err(TransportError::Timeout(timeout)),
        }
    }
}

/// Parse a subscription pattern into tokens.
pub(super) fn parse_pattern(subject: &str) -> Result<Vec<PatternToken>, TransportError> {
    let raw: Vec<&str> = subject.split('.').collect();
    let mut pattern = Vec::with_capacity(raw.len());
    for (idx, token) in raw.iter().enumerate() {
        let parsed = match *token {
            "" => return Err(TransportError::InvalidSubject(subject.to_string())),
            "*" => PatternToken::Any,
            ">" => {
                if idx != raw.len() - 1 {
                    return Err(TransportError::InvalidSubject(subject.to_string()));
                }
                PatternToken::Tail
            }
            literal => PatternToken::Literal(literal.to_string()),
        };
        pattern.push(parsed);
    }
    Ok(pattern)
}

/// Test whether a literal subject matches a subscription pattern.
pub(super) fn pattern_matches(pattern: &[PatternToken], subject: &[&str]) -> bool {
    let mut tokens = subject.iter();
    for (idx, pat) in pattern.iter().enumerate() {
        match pat {
            PatternToken::Tail => return subject.len() > idx,
            PatternToken::Any => {
                if tokens.next().is_none() {
                    return false;
                }
            }
            PatternToken::Literal(expected) => match tokens.next() {
                Some(token) if *token == expected.as_str() => (),
                _ => return false,
            },
        }
    }
    tokens.next().is_none()
}
