//! The thin broker client, used by tests and for embedding.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use prost::Message as _;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::DEFAULT_DISCOVER_PREFIX;
use crate::error::ProtoError;
use crate::proto::{
    Ack, CloseRequest, CloseResponse, ConnectRequest, ConnectResponse, MsgProto, PubAck, PubMsg, StartPosition,
    SubscriptionRequest, SubscriptionResponse, UnsubscribeRequest,
};
use crate::transport::{InterestHandle, Transport};
use crate::utils;

/// The default window of unacknowledged deliveries.
pub const DEFAULT_MAX_INFLIGHT: usize = 1024;
/// The default time the broker waits for an ack before redelivering.
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);
/// How long client requests wait for a broker response.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
/// The subject prefix publish acks are received on.
const ACK_SUBJECT_PREFIX: &str = "_STAN.acks";

/// Where in the channel a new subscription starts.
#[derive(Clone, Debug)]
pub enum StartAt {
    /// Only messages published after the subscription is created.
    NewOnly,
    /// The last message received on the channel.
    LastReceived,
    /// The message closest to `now - delta`.
    TimeDelta(Duration),
    /// The given sequence.
    Sequence(u64),
    /// All available messages.
    First,
}

impl Default for StartAt {
    fn default() -> Self {
        Self::NewOnly
    }
}

/// Options controlling a subscription's behavior.
#[derive(Clone, Debug)]
pub struct SubscriptionOptions {
    /// The durable name; state survives disconnects when set.
    pub durable_name: String,
    /// The maximum number of unacknowledged deliveries.
    pub max_in_flight: usize,
    /// How long the broker waits for an ack before redelivering.
    pub ack_wait: Duration,
    /// The starting point within the channel.
    pub start_at: StartAt,
    /// When set, the handler is responsible for calling [`Message::ack`].
    pub manual_acks: bool,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            durable_name: String::new(),
            max_in_flight: DEFAULT_MAX_INFLIGHT,
            ack_wait: DEFAULT_ACK_WAIT,
            start_at: StartAt::default(),
            manual_acks: false,
        }
    }
}

/// A message delivered to a subscription handler.
#[derive(Clone)]
pub struct Message {
    /// The channel-scoped sequence number.
    pub sequence: u64,
    /// The channel subject.
    pub subject: String,
    /// The optional reply subject the publisher attached.
    pub reply: String,
    /// The message payload.
    pub data: Vec<u8>,
    /// Commit timestamp, nanoseconds since the unix epoch.
    pub timestamp: i64,
    /// Whether this delivery is a redelivery.
    pub redelivered: bool,

    ack_subject: String,
    manual_acks: bool,
    transport: Arc<dyn Transport>,
}

impl Message {
    /// Manually acknowledge this message.
    pub fn ack(&self) -> Result<(), ProtoError> {
        if self.sequence == 0 {
            return Err(ProtoError::NilMessage);
        }
        if !self.manual_acks {
            return Err(ProtoError::ManualAckInAutoMode);
        }
        let ack = Ack { subject: self.subject.clone(), sequence: self.sequence };
        let data = utils::encode_model(&ack).map_err(|_err| ProtoError::ConnectionClosed)?;
        self.transport
            .publish(&self.ack_subject, data)
            .map_err(|_err| ProtoError::ConnectionClosed)
    }
}

/// A handler invoked for each delivered message.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// A client connection to a broker.
pub struct Connection {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    transport: Arc<dyn Transport>,
    client_id: String,
    pub_prefix: String,
    sub_requests: String,
    unsub_requests: String,
    close_requests: String,
    hb_interest: InterestHandle,
    closed: AtomicBool,
}

impl Connection {
    /// Connect to the broker serving the given cluster ID.
    pub async fn connect(transport: Arc<dyn Transport>, cluster_id: &str, client_id: &str) -> Result<Self> {
        // Answer heartbeat probes on a dedicated inbox.
        let hb_inbox = transport.new_inbox();
        let hb_transport = transport.clone();
        let hb_interest = transport
            .subscribe(
                &hb_inbox,
                Arc::new(move |msg| {
                    if !msg.reply.is_empty() {
                        let _res = hb_transport.publish(&msg.reply, Vec::new());
                    }
                }),
            )
            .context("error subscribing to heartbeat inbox")?;

        let req = ConnectRequest { client_id: client_id.to_string(), heartbeat_inbox: hb_inbox };
        let discover_subject = format!("{}.{}", DEFAULT_DISCOVER_PREFIX, cluster_id);
        let reply = match transport
            .request(&discover_subject, utils::encode_model(&req)?, REQUEST_TIMEOUT)
            .await
        {
            Ok(reply) => reply,
            Err(_err) => {
                transport.unsubscribe(&hb_interest);
                return Err(ProtoError::ConnectReqTimeout.into());
            }
        };
        let resp = ConnectResponse::decode(reply.data.as_slice()).context("error decoding connect response")?;
        if !resp.error.is_empty() {
            transport.unsubscribe(&hb_interest);
            bail!(resp.error);
        }

        Ok(Self {
            inner: Arc::new(ConnInner {
                transport,
                client_id: client_id.to_string(),
                pub_prefix: resp.pub_prefix,
                sub_requests: resp.sub_requests,
                unsub_requests: resp.unsub_requests,
                close_requests: resp.close_requests,
                hb_interest,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// The ID this connection registered with.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ProtoError::ConnectionClosed.into());
        }
        Ok(())
    }

    /// Publish a message and await the broker's ack.
    pub async fn publish(&self, subject: &str, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let guid = Uuid::new_v4().to_simple().to_string();
        let msg = PubMsg {
            guid: guid.clone(),
            client_id: self.inner.client_id.clone(),
            subject: subject.to_string(),
            reply: String::new(),
            data: data.to_vec(),
        };
        let pub_subject = format!("{}.{}", self.inner.pub_prefix, subject);

        // The broker replies on a per-publish ack subject derived from the
        // guid.
        let ack_subject = format!("{}.{}", ACK_SUBJECT_PREFIX, guid);
        let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
        let slot = parking_lot::Mutex::new(Some(ack_tx));
        let interest = self
            .inner
            .transport
            .subscribe(
                &ack_subject,
                Arc::new(move |msg| {
                    if let Some(tx) = slot.lock().take() {
                        let _res = tx.send(msg);
                    }
                }),
            )
            .context("error subscribing to publish ack subject")?;

        let published = self
            .inner
            .transport
            .publish_request(&pub_subject, &ack_subject, utils::encode_model(&msg)?);
        let reply = match published {
            Ok(()) => tokio::time::timeout(REQUEST_TIMEOUT, ack_rx).await,
            Err(err) => {
                self.inner.transport.unsubscribe(&interest);
                return Err(err).context("error publishing message");
            }
        };
        self.inner.transport.unsubscribe(&interest);
        let reply = match reply {
            Ok(Ok(reply)) => reply,
            _ => return Err(ProtoError::PublishAckTimeout.into()),
        };

        let ack = PubAck::decode(reply.data.as_slice()).context("error decoding publish ack")?;
        if !ack.error.is_empty() {
            bail!(ack.error);
        }
        if ack.guid != guid {
            bail!("publish ack guid mismatch");
        }
        Ok(())
    }

    /// Create a plain subscription on the given subject.
    pub async fn subscribe(&self, subject: &str, opts: SubscriptionOptions, handler: MessageHandler) -> Result<Subscription> {
        self.subscribe_inner(subject, "", opts, handler).await
    }

    /// Create a queue subscription on the given subject & group.
    pub async fn queue_subscribe(
        &self, subject: &str, q_group: &str, opts: SubscriptionOptions, handler: MessageHandler,
    ) -> Result<Subscription> {
        self.subscribe_inner(subject, q_group, opts, handler).await
    }

    async fn subscribe_inner(
        &self, subject: &str, q_group: &str, opts: SubscriptionOptions, handler: MessageHandler,
    ) -> Result<Subscription> {
        self.ensure_open()?;

        // Register delivery interest first so messages sent immediately after
        // the broker's response are buffered; the dispatch task starts
        // draining once the ack inbox is known.
        let inbox = self.inner.transport.new_inbox();
        let (delivery_tx, mut delivery_rx) = mpsc::unbounded_channel::<MsgProto>();
        let interest = self
            .inner
            .transport
            .subscribe(
                &inbox,
                Arc::new(move |msg| match MsgProto::decode(msg.data.as_slice()) {
                    Ok(proto) => {
                        let _res = delivery_tx.send(proto);
                    }
                    Err(err) => tracing::error!(error = ?err, "error decoding delivered message"),
                }),
            )
            .context("error subscribing to delivery inbox")?;

        let mut req = SubscriptionRequest {
            client_id: self.inner.client_id.clone(),
            subject: subject.to_string(),
            q_group: q_group.to_string(),
            inbox: inbox.clone(),
            max_in_flight: opts.max_in_flight as u32,
            ack_wait_in_secs: opts.ack_wait.as_secs() as i32,
            start_position: StartPosition::NewOnly as i32,
            start_sequence: 0,
            start_time_delta: 0,
            durable_name: opts.durable_name.clone(),
        };
        match opts.start_at {
            StartAt::NewOnly => req.start_position = StartPosition::NewOnly as i32,
            StartAt::LastReceived => req.start_position = StartPosition::LastReceived as i32,
            StartAt::TimeDelta(delta) => {
                req.start_position = StartPosition::TimeDeltaStart as i32;
                req.start_time_delta = delta.as_nanos() as i64;
            }
            StartAt::Sequence(seq) => {
                req.start_position = StartPosition::SequenceStart as i32;
                req.start_sequence = seq;
            }
            StartAt::First => req.start_position = StartPosition::First as i32,
        }

        let reply = match self
            .inner
            .transport
            .request(&self.inner.sub_requests, utils::encode_model(&req)?, REQUEST_TIMEOUT)
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                self.inner.transport.unsubscribe(&interest);
                return Err(err).context("timeout awaiting subscription response");
            }
        };
        let resp = SubscriptionResponse::decode(reply.data.as_slice()).context("error decoding subscription response")?;
        if !resp.error.is_empty() {
            self.inner.transport.unsubscribe(&interest);
            bail!(resp.error);
        }
        let ack_subject = resp.ack_inbox;

        // The dispatch task serializes handler invocations & auto-acks.
        let (transport, ack_inbox, manual_acks) = (self.inner.transport.clone(), ack_subject.clone(), opts.manual_acks);
        let dispatch = tokio::spawn(async move {
            while let Some(proto) = delivery_rx.recv().await {
                let (ack_channel, ack_seq) = (proto.subject.clone(), proto.sequence);
                handler(Message {
                    sequence: proto.sequence,
                    subject: proto.subject,
                    reply: proto.reply,
                    data: proto.data,
                    timestamp: proto.timestamp,
                    redelivered: proto.redelivered,
                    ack_subject: ack_inbox.clone(),
                    manual_acks,
                    transport: transport.clone(),
                });
                if !manual_acks {
                    let ack = Ack { subject: ack_channel, sequence: ack_seq };
                    if let Ok(data) = utils::encode_model(&ack) {
                        let _res = transport.publish(&ack_inbox, data);
                    }
                }
            }
        });

        Ok(Subscription {
            conn: self.inner.clone(),
            subject: subject.to_string(),
            ack_subject,
            interest,
            dispatch,
        })
    }

    /// Close this connection; non-durable subscriptions are removed by the
    /// broker, durable state is retained.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(ProtoError::ConnectionClosed.into());
        }
        self.inner.transport.unsubscribe(&self.inner.hb_interest);
        let req = CloseRequest { client_id: self.inner.client_id.clone() };
        let reply = self
            .inner
            .transport
            .request(&self.inner.close_requests, utils::encode_model(&req)?, REQUEST_TIMEOUT)
            .await
            .map_err(|_err| ProtoError::CloseReqTimeout)?;
        let resp = CloseResponse::decode(reply.data.as_slice()).context("error decoding close response")?;
        if !resp.error.is_empty() {
            bail!(resp.error);
        }
        Ok(())
    }
}

/// A handle to an active subscription.
pub struct Subscription {
    conn: Arc<ConnInner>,
    subject: String,
    ack_subject: String,
    interest: InterestHandle,
    dispatch: JoinHandle<()>,
}

impl Subscription {
    /// Remove this subscription; for a durable, its state is deleted.
    pub async fn unsubscribe(self) -> Result<()> {
        self.conn.transport.unsubscribe(&self.interest);
        self.dispatch.abort();
        let req = UnsubscribeRequest {
            client_id: self.conn.client_id.clone(),
            subject: self.subject.clone(),
            inbox: self.ack_subject.clone(),
        };
        let reply = self
            .conn
            .transport
            .request(&self.conn.unsub_requests, utils::encode_model(&req)?, REQUEST_TIMEOUT)
            .await
            .context("timeout awaiting unsubscribe response")?;
        let resp = SubscriptionResponse::decode(reply.data.as_slice()).context("error decoding unsubscribe response")?;
        if !resp.error.is_empty() {
            bail!(resp.error);
        }
        Ok(())
    }
}
