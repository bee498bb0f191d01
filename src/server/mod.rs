//! The broker server.
//!
//! The server couples the per-channel message log, the subscription state
//! machine, the queue-group load balancer, and the client lifecycle around a
//! shared per-channel lock discipline. Locks are always acquired coarse to
//! fine: channel map, then a channel's subscription set, then a queue group,
//! then individual subscriptions. Transport publishes are issued with no
//! channel-wide lock held.

pub mod clients;
mod delivery;
#[cfg(test)]
mod mod_test;
pub mod subs;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use prost::Message;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ProtoError, ShutdownError};
use crate::models::SubRecord;
use crate::proto::{
    Ack, CloseRequest, CloseResponse, ConnectRequest, ConnectResponse, PubAck, PubMsg, StartPosition,
    SubscriptionRequest, SubscriptionResponse, UnsubscribeRequest,
};
use crate::server::clients::ClientRegistry;
use crate::server::subs::{durable_key, QueueJoin, SubInner, SubState, SubscriptionSet, DURABLE_GROUP_SEP};
use crate::store::{MsgLog, Store, StoreError, SubLog};
use crate::transport::{InterestHandle, Transport, TransportMessage};
use crate::utils;

/// The default prefix of the subjects clients publish messages on.
pub const DEFAULT_PUB_PREFIX: &str = "_STAN.pub";
/// The default prefix of the subject subscription requests arrive on.
pub const DEFAULT_SUB_PREFIX: &str = "_STAN.sub";
/// The default prefix of the subject unsubscribe requests arrive on.
pub const DEFAULT_UNSUB_PREFIX: &str = "_STAN.unsub";
/// The default prefix of the subject close requests arrive on.
pub const DEFAULT_CLOSE_PREFIX: &str = "_STAN.close";

pub(crate) const METRIC_MSGS_PUBLISHED: &str = "weir_messages_published";
pub(crate) const METRIC_MSGS_REDELIVERED: &str = "weir_messages_redelivered";
pub(crate) const METRIC_CONNECTED_CLIENTS: &str = "weir_connected_clients";

/// Nanoseconds since the unix epoch.
pub(crate) fn unix_now_nanos() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp_nanos() as i64
}

/// Check a channel subject for validity: dot-separated non-empty tokens, no
/// wildcards.
pub(crate) fn is_valid_subject(subject: &str) -> bool {
    if subject.is_empty() {
        return false;
    }
    subject
        .split('.')
        .all(|token| !token.is_empty() && !token.contains('*') && !token.contains('>'))
}

/// A channel: one message log plus one subscription set, keyed by subject.
pub(crate) struct Channel {
    pub name: String,
    pub msgs: Arc<dyn MsgLog>,
    pub subs_log: Arc<dyn SubLog>,
    pub subs: SubscriptionSet,
}

/// The map of all live channels, keyed by subject.
pub(crate) struct ChannelMap {
    channels: RwLock<HashMap<String, Arc<Channel>>>,
}

impl ChannelMap {
    fn new() -> Self {
        Self { channels: RwLock::new(HashMap::new()) }
    }

    /// Look up a channel by subject.
    pub(crate) fn lookup(&self, subject: &str) -> Option<Arc<Channel>> {
        self.channels.read().get(subject).cloned()
    }

    /// Look up a channel, creating it on first use.
    pub(crate) fn lookup_or_create(&self, store: &dyn Store, subject: &str) -> Result<Arc<Channel>, StoreError> {
        if let Some(chan) = self.lookup(subject) {
            return Ok(chan);
        }
        let mut channels = self.channels.write();
        if let Some(chan) = channels.get(subject) {
            return Ok(chan.clone());
        }
        let entry = store.create_channel(subject)?;
        let chan = Arc::new(Channel {
            name: subject.to_string(),
            msgs: entry.msgs,
            subs_log: entry.subs,
            subs: SubscriptionSet::new(),
        });
        channels.insert(subject.to_string(), chan.clone());
        Ok(chan)
    }

    /// Snapshot all live channels.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Channel>> {
        self.channels.read().values().cloned().collect()
    }
}

/// A running broker server.
pub struct Server {
    pub(crate) inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    pub(crate) config: Arc<Config>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) store: Arc<dyn Store>,

    /// Subject prefix we receive published messages on.
    pub(crate) pub_prefix: String,
    /// Subject we receive subscription requests on.
    pub(crate) sub_requests: String,
    /// Subject we receive unsubscribe requests on.
    pub(crate) unsub_requests: String,
    /// Subject we receive close requests on.
    pub(crate) close_requests: String,

    pub(crate) channels: ChannelMap,
    pub(crate) clients: ClientRegistry,
    control_interest: Mutex<Vec<InterestHandle>>,

    /// A weak self-handle used by spawned tasks & transport handlers; tasks
    /// never keep the server alive.
    pub(crate) self_ref: Weak<ServerInner>,
}

impl Server {
    /// Start a broker server on the given transport & store.
    ///
    /// Fails if any required control subject cannot be subscribed.
    pub fn start(config: Arc<Config>, transport: Arc<dyn Transport>, store: Arc<dyn Store>) -> Result<Self> {
        let server_id = Uuid::new_v4().to_simple().to_string();
        let inner = Arc::new_cyclic(|self_ref| ServerInner {
            config,
            transport,
            store,
            pub_prefix: format!("{}.{}", DEFAULT_PUB_PREFIX, server_id),
            sub_requests: format!("{}.{}", DEFAULT_SUB_PREFIX, server_id),
            unsub_requests: format!("{}.{}", DEFAULT_UNSUB_PREFIX, server_id),
            close_requests: format!("{}.{}", DEFAULT_CLOSE_PREFIX, server_id),
            channels: ChannelMap::new(),
            clients: ClientRegistry::new(),
            control_interest: Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        });

        metrics::register_counter!(METRIC_MSGS_PUBLISHED, metrics::Unit::Count, "the number of messages committed to channel logs");
        metrics::register_counter!(METRIC_MSGS_REDELIVERED, metrics::Unit::Count, "the number of message redeliveries performed");
        metrics::register_gauge!(METRIC_CONNECTED_CLIENTS, metrics::Unit::Count, "the number of currently registered clients");

        inner.recover_state().context("error recovering store state")?;
        // Failing to own the control subjects is unrecoverable.
        inner
            .init_subscriptions()
            .map_err(ShutdownError::from)
            .context("error subscribing to control subjects")?;
        tracing::info!("message store is {}", inner.store.name());
        Ok(Self { inner })
    }

    /// Shut the server down: drop control interest, stop heartbeat & ack
    /// timer tasks, and close the store.
    pub fn shutdown(&self) {
        tracing::debug!("broker server shutting down");
        for handle in self.inner.control_interest.lock().drain(..) {
            self.inner.transport.unsubscribe(&handle);
        }
        for chan in self.inner.channels.snapshot() {
            for sub in chan.subs.all_subs() {
                let mut inner = sub.lock();
                inner.clear_ack_timer();
                if let Some(handle) = inner.ack_interest.take() {
                    self.inner.transport.unsubscribe(&handle);
                }
            }
        }
        for client in self.inner.clients.drain() {
            tracing::debug!(client = %client.client_id, "dropping client on shutdown");
        }
        if let Err(err) = self.inner.store.close() {
            tracing::error!(error = ?err, "error closing store during shutdown");
        }
    }
}

impl ServerInner {
    /// Setup the control subject subscriptions: discovery, publish,
    /// subscribe, unsubscribe & close.
    fn init_subscriptions(&self) -> Result<()> {
        let discover_subject = format!("{}.{}", self.config.discover_prefix, self.config.cluster_id);
        let pub_subject = format!("{}.>", self.pub_prefix);
        let interest = vec![
            self.subscribe_control(&discover_subject, ServerInner::process_connect)?,
            self.subscribe_control(&pub_subject, ServerInner::process_client_publish)?,
            self.subscribe_control(&self.sub_requests, ServerInner::process_subscription_request)?,
            self.subscribe_control(&self.unsub_requests, ServerInner::process_unsubscribe_request)?,
            self.subscribe_control(&self.close_requests, ServerInner::process_close_request)?,
        ];
        *self.control_interest.lock() = interest;

        tracing::debug!(
            discover = %discover_subject,
            publish = %pub_subject,
            subscribe = %self.sub_requests,
            unsubscribe = %self.unsub_requests,
            close = %self.close_requests,
            "control subjects registered",
        );
        Ok(())
    }

    fn subscribe_control(
        &self, subject: &str, handler: fn(&ServerInner, TransportMessage),
    ) -> Result<InterestHandle> {
        let weak = self.self_ref.clone();
        self.transport
            .subscribe(
                subject,
                Arc::new(move |msg| {
                    if let Some(server) = weak.upgrade() {
                        handler(&server, msg);
                    }
                }),
            )
            .with_context(|| format!("could not subscribe to control subject {}", subject))
    }

    /// Rebuild channel & durable subscription state from the store.
    fn recover_state(&self) -> Result<()> {
        let recovered = self.store.recover().context("error reading recovered state from store")?;
        for channel in recovered {
            let chan = self
                .channels
                .lookup_or_create(&*self.store, &channel.name)
                .context("error recreating recovered channel")?;
            for recovered_sub in channel.subs {
                let record = recovered_sub.record;
                if !record.is_durable {
                    let _res = chan.subs_log.delete_sub(record.id);
                    continue;
                }
                let mut acks_pending = HashMap::new();
                for seq in recovered_sub.pending {
                    if let Some(msg) = chan.msgs.lookup(seq) {
                        acks_pending.insert(seq, msg);
                    }
                }
                let sub = Arc::new(SubState::new(
                    record.id,
                    SubInner {
                        // Recovered subscriptions start detached.
                        client_id: String::new(),
                        subject: record.subject.clone(),
                        q_group: record.q_group.clone(),
                        inbox: record.inbox.clone(),
                        ack_inbox: record.ack_inbox.clone(),
                        durable_name: record.durable_name.clone(),
                        last_sent: record.last_sent,
                        ack_wait: Duration::from_secs(record.ack_wait_in_secs.max(1) as u64),
                        max_in_flight: record.max_in_flight.max(1) as usize,
                        stalled: false,
                        acks_pending,
                        ack_timer: None,
                        ack_interest: None,
                    },
                ));
                if !record.q_group.is_empty() {
                    let durable = record.q_group.contains(DURABLE_GROUP_SEP);
                    if let Some(displaced) = chan.subs.recover_queue_shadow(&record.q_group, durable, sub) {
                        let _res = chan.subs_log.delete_sub(displaced.id);
                    }
                } else {
                    let key = durable_key(&record.client_id, &record.subject, &record.durable_name);
                    chan.subs.recover_durable(key, sub);
                }
            }
        }
        Ok(())
    }

    /// Encode & publish a reply, dropping it when the request carried no
    /// reply subject.
    pub(crate) fn publish_reply<M: Message>(&self, reply: &str, resp: &M) {
        if reply.is_empty() {
            return;
        }
        let data = match utils::encode_model(resp) {
            Ok(data) => data,
            Err(err) => {
                tracing::error!(error = ?err, "error encoding reply model");
                return;
            }
        };
        if let Err(err) = self.transport.publish(reply, data) {
            tracing::error!(error = ?err, subject = reply, "error publishing reply");
        }
    }

    fn reply_sub_err(&self, reply: &str, err: &ProtoError) {
        self.publish_reply(reply, &SubscriptionResponse { ack_inbox: String::new(), error: err.to_string() });
    }

    /// Process a client connect request.
    #[tracing::instrument(level = "trace", skip(self, msg))]
    fn process_connect(&self, msg: TransportMessage) {
        let req = match ConnectRequest::decode(msg.data.as_slice()) {
            Ok(req) if !req.client_id.is_empty() && !req.heartbeat_inbox.is_empty() => req,
            _ => {
                self.publish_reply(&msg.reply, &ConnectResponse {
                    error: ProtoError::InvalidConnectRequest.to_string(),
                    ..Default::default()
                });
                return;
            }
        };

        let client = match self.clients.register(&req.client_id, &req.heartbeat_inbox) {
            Ok(client) => client,
            Err(err) => {
                tracing::debug!(client = %req.client_id, "connect failed; already connected");
                self.publish_reply(&msg.reply, &ConnectResponse { error: err.to_string(), ..Default::default() });
                return;
            }
        };
        if let Err(err) = self.store.clients().add_client(&req.client_id, &req.heartbeat_inbox) {
            tracing::error!(error = ?err, client = %req.client_id, "error recording client registration");
        }

        self.publish_reply(&msg.reply, &ConnectResponse {
            pub_prefix: self.pub_prefix.clone(),
            sub_requests: self.sub_requests.clone(),
            unsub_requests: self.unsub_requests.clone(),
            close_requests: self.close_requests.clone(),
            error: String::new(),
        });

        client.set_hb_task(self.spawn_heartbeat(&req.client_id));
        metrics::increment_gauge!(METRIC_CONNECTED_CLIENTS, 1.0);
        tracing::debug!(client = %req.client_id, "client connected");
    }

    /// Spawn the periodic heartbeat probe for a client.
    fn spawn_heartbeat(&self, client_id: &str) -> tokio::task::JoinHandle<()> {
        let weak = self.self_ref.clone();
        let client_id = client_id.to_string();
        tokio::spawn(async move {
            loop {
                let (interval, timeout, max_failed) = match weak.upgrade() {
                    Some(server) => (
                        server.config.heartbeat_interval(),
                        server.config.heartbeat_timeout(),
                        server.config.max_failed_heartbeats,
                    ),
                    None => return,
                };
                tokio::time::sleep(interval).await;
                let server = match weak.upgrade() {
                    Some(server) => server,
                    None => return,
                };
                let client = match server.clients.lookup(&client_id) {
                    Some(client) => client,
                    None => return,
                };
                match server.transport.request(&client.hb_inbox, Vec::new(), timeout).await {
                    Ok(_res) => client.reset_failed_heartbeats(),
                    Err(_err) => {
                        let fhb = client.bump_failed_heartbeats();
                        if fhb > max_failed {
                            tracing::debug!(client = %client_id, "timed out on heartbeats");
                            server.close_client(&client_id);
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Remove a client: non-durable subscriptions are dropped, durable state
    /// is detached, and the registration is released.
    pub(crate) fn close_client(&self, client_id: &str) {
        self.remove_all_non_durable_subscribers(client_id);
        if self.clients.unregister(client_id).is_some() {
            if let Err(err) = self.store.clients().delete_client(client_id) {
                tracing::error!(error = ?err, client = %client_id, "error removing client registration");
            }
            metrics::decrement_gauge!(METRIC_CONNECTED_CLIENTS, 1.0);
            tracing::debug!(client = %client_id, "client closed");
        }
    }

    fn remove_all_non_durable_subscribers(&self, client_id: &str) {
        let client = match self.clients.lookup(client_id) {
            Some(client) => client,
            None => return,
        };
        for sub in client.snapshot_subs() {
            let (subject, is_durable, is_queue, ack_inbox) = {
                let mut inner = sub.lock();
                inner.clear_ack_timer();
                (inner.subject.clone(), inner.is_durable(), inner.is_queue(), inner.ack_inbox.clone())
            };
            let chan = match self.channels.lookup(&subject) {
                Some(chan) => chan,
                None => continue,
            };
            if is_queue {
                // Queue members always leave their group; a durable group
                // survives through its shadow.
                self.remove_subscription(&chan, &sub, false);
            } else if is_durable {
                // Detach only: the durable state survives for re-attach.
                let mut inner = sub.lock();
                inner.client_id.clear();
                if let Some(handle) = inner.ack_interest.take() {
                    self.transport.unsubscribe(&handle);
                }
                drop(inner);
                chan.subs.detach_ack(&ack_inbox);
            } else {
                self.remove_subscription(&chan, &sub, true);
            }
        }
    }

    /// Remove a subscription from its channel, transferring a departing
    /// queue member's in-flight messages to the remaining members.
    pub(crate) fn remove_subscription(&self, chan: &Arc<Channel>, sub: &Arc<SubState>, delete_durable: bool) {
        let pending = {
            let mut inner = sub.lock();
            inner.clear_ack_timer();
            if let Some(handle) = inner.ack_interest.take() {
                self.transport.unsubscribe(&handle);
            }
            inner.sorted_pending()
        };
        match chan.subs.remove(sub, delete_durable) {
            Some(removal) => {
                if removal.shadow_installed {
                    // The record rides along with the shadow.
                    return;
                }
                if !removal.remaining.is_empty() {
                    self.transfer_queue_pending(chan, &removal.group, pending);
                }
                if let Err(err) = chan.subs_log.delete_sub(sub.id) {
                    tracing::error!(error = ?err, "error deleting subscription record");
                }
            }
            None => {
                if let Err(err) = chan.subs_log.delete_sub(sub.id) {
                    tracing::error!(error = ?err, "error deleting subscription record");
                }
            }
        }
    }

    /// Process an inbound publish.
    #[tracing::instrument(level = "trace", skip(self, msg))]
    fn process_client_publish(&self, msg: TransportMessage) {
        let pm = PubMsg::decode(msg.data.as_slice()).unwrap_or_default();
        if !is_valid_subject(&pm.subject) {
            tracing::error!(client = %pm.client_id, subject = %pm.subject, "received publish for invalid subject");
            self.publish_reply(&msg.reply, &PubAck { guid: pm.guid, error: ProtoError::InvalidSubject.to_string() });
            return;
        }
        if pm.guid.is_empty() || self.clients.lookup(&pm.client_id).is_none() {
            tracing::error!(client = %pm.client_id, subject = %pm.subject, "received invalid client publish message");
            self.publish_reply(&msg.reply, &PubAck {
                guid: pm.guid,
                error: ProtoError::BadPublishMsg.to_string(),
            });
            return;
        }
        let chan = match self.channels.lookup_or_create(&*self.store, &pm.subject) {
            Ok(chan) => chan,
            Err(err) => {
                tracing::error!(error = ?err, subject = %pm.subject, "error creating channel for publish");
                self.publish_reply(&msg.reply, &PubAck { guid: pm.guid, error: err.to_string() });
                return;
            }
        };

        // Ack the publisher, then commit & fan out.
        self.publish_reply(&msg.reply, &PubAck { guid: pm.guid.clone(), error: String::new() });
        if let Err(err) = chan.msgs.append(&pm.subject, &pm.reply, &pm.data) {
            tracing::error!(error = ?err, subject = %pm.subject, "error appending message to channel log");
            return;
        }
        metrics::counter!(METRIC_MSGS_PUBLISHED, 1);
        self.process_msg(&chan);
    }

    /// Process an inbound ack from a subscriber, routed by ack inbox.
    pub(crate) fn process_ack_msg(&self, msg: TransportMessage) {
        let ack = match Ack::decode(msg.data.as_slice()) {
            Ok(ack) => ack,
            Err(err) => {
                tracing::error!(error = ?err, "received undecodable ack");
                return;
            }
        };
        let chan = match self.channels.lookup(&ack.subject) {
            Some(chan) => chan,
            None => {
                tracing::error!(subject = %ack.subject, "ack received for unknown channel");
                return;
            }
        };
        let sub = match chan.subs.lookup_by_ack_inbox(&msg.subject) {
            Some(sub) => sub,
            None => return,
        };
        self.process_ack(&chan, &sub, &ack);
    }

    /// Process a subscription request.
    #[tracing::instrument(level = "trace", skip(self, msg))]
    fn process_subscription_request(&self, msg: TransportMessage) {
        let sr = match SubscriptionRequest::decode(msg.data.as_slice()) {
            Ok(sr) => sr,
            Err(_err) => {
                tracing::error!("received undecodable subscription request");
                self.reply_sub_err(&msg.reply, &ProtoError::BadSubscriptionRequest);
                return;
            }
        };
        if sr.ack_wait_in_secs <= 0 {
            tracing::debug!(client = %sr.client_id, "invalid ack wait in subscription request");
            self.reply_sub_err(&msg.reply, &ProtoError::InvalidAckWait);
            return;
        }
        if !is_valid_subject(&sr.subject) {
            tracing::debug!(client = %sr.client_id, subject = %sr.subject, "invalid subject in subscription request");
            self.reply_sub_err(&msg.reply, &ProtoError::InvalidSubject);
            return;
        }
        if sr.client_id.is_empty() {
            tracing::debug!("missing client ID in subscription request");
            self.reply_sub_err(&msg.reply, &ProtoError::BadSubscriptionRequest);
            return;
        }
        if sr.durable_name.contains(DURABLE_GROUP_SEP) {
            self.reply_sub_err(&msg.reply, &ProtoError::InvalidDurableName);
            return;
        }
        let chan = match self.channels.lookup_or_create(&*self.store, &sr.subject) {
            Ok(chan) => chan,
            Err(err) => {
                tracing::error!(error = ?err, subject = %sr.subject, "error creating channel for subscription");
                self.publish_reply(&msg.reply, &SubscriptionResponse { ack_inbox: String::new(), error: err.to_string() });
                return;
            }
        };

        // A queue subscription can't reuse a durable name which is live as a
        // plain durable for the same client & subject.
        if !sr.q_group.is_empty() && !sr.durable_name.is_empty() {
            let key = durable_key(&sr.client_id, &sr.subject, &sr.durable_name);
            let live_plain_durable = chan
                .subs
                .lookup_by_durable(&key)
                .map(|durable| !durable.lock().client_id.is_empty())
                .unwrap_or(false);
            if live_plain_durable {
                self.reply_sub_err(&msg.reply, &ProtoError::DurableQueueConflict);
                return;
            }
        }

        // Check for a plain durable re-attach.
        let mut reattached = None;
        if sr.q_group.is_empty() && !sr.durable_name.is_empty() {
            if let Some(durable) = chan.subs.lookup_by_durable(&durable_key(&sr.client_id, &sr.subject, &sr.durable_name)) {
                let old_ack_inbox = {
                    let inner = durable.lock();
                    if !inner.client_id.is_empty() {
                        drop(inner);
                        tracing::debug!(client = %sr.client_id, "duplicate durable registration");
                        self.reply_sub_err(&msg.reply, &ProtoError::DuplicateDurable);
                        return;
                    }
                    inner.ack_inbox.clone()
                };
                // Re-attach: adopt the new client, inbox & ack inbox, and
                // merge the new request's tuning.
                let new_ack_inbox = self.transport.new_inbox();
                {
                    let mut inner = durable.lock();
                    inner.client_id = sr.client_id.clone();
                    inner.inbox = sr.inbox.clone();
                    inner.ack_inbox = new_ack_inbox.clone();
                    inner.ack_wait = Duration::from_secs(sr.ack_wait_in_secs as u64);
                    inner.max_in_flight = sr.max_in_flight.max(1) as usize;
                }
                chan.subs.rebind_ack_inbox(&old_ack_inbox, &new_ack_inbox, &durable);
                reattached = Some(durable);
            }
        }

        // Resolve & validate the start position for fresh subscriptions.
        let start_seq = match &reattached {
            Some(_sub) => 0,
            None => match self.resolve_start_sequence(&chan, &sr) {
                Ok(seq) => seq,
                Err(err) => {
                    tracing::debug!(client = %sr.client_id, error = %err, "invalid start position in subscription request");
                    self.reply_sub_err(&msg.reply, &err);
                    return;
                }
            },
        };

        let is_reattach = reattached.is_some();
        let mut joined_group = None;
        let sub = match reattached {
            Some(sub) => sub,
            None => {
                let ack_inbox = self.transport.new_inbox();
                let group_name = if sr.q_group.is_empty() {
                    String::new()
                } else if sr.durable_name.is_empty() {
                    sr.q_group.clone()
                } else {
                    format!("{}{}{}", sr.durable_name, DURABLE_GROUP_SEP, sr.q_group)
                };
                let mut record = SubRecord {
                    id: 0,
                    client_id: sr.client_id.clone(),
                    subject: sr.subject.clone(),
                    q_group: group_name.clone(),
                    inbox: sr.inbox.clone(),
                    ack_inbox: ack_inbox.clone(),
                    durable_name: sr.durable_name.clone(),
                    max_in_flight: sr.max_in_flight.max(1),
                    ack_wait_in_secs: sr.ack_wait_in_secs,
                    last_sent: start_seq.saturating_sub(1),
                    is_durable: !sr.durable_name.is_empty(),
                };
                if let Err(err) = chan.subs_log.create_sub(&mut record) {
                    tracing::error!(error = ?err, "error creating subscription record");
                    self.publish_reply(&msg.reply, &SubscriptionResponse { ack_inbox: String::new(), error: err.to_string() });
                    return;
                }
                let sub = Arc::new(SubState::new(
                    record.id,
                    SubInner {
                        client_id: sr.client_id.clone(),
                        subject: sr.subject.clone(),
                        q_group: group_name.clone(),
                        inbox: sr.inbox.clone(),
                        ack_inbox,
                        durable_name: sr.durable_name.clone(),
                        last_sent: start_seq.saturating_sub(1),
                        ack_wait: Duration::from_secs(sr.ack_wait_in_secs as u64),
                        max_in_flight: sr.max_in_flight.max(1) as usize,
                        stalled: false,
                        acks_pending: HashMap::new(),
                        ack_timer: None,
                        ack_interest: None,
                    },
                ));
                if group_name.is_empty() {
                    chan.subs.store_plain(&sub);
                } else {
                    let durable_group = !sr.durable_name.is_empty();
                    let join = chan.subs.store_queue(&sub, &group_name, durable_group, start_seq.saturating_sub(1));
                    if let QueueJoin::AdoptedShadow { group, shadow } = &join {
                        // The shadow is discarded; its in-flight messages
                        // move to the revived group.
                        let shadow_pending = shadow.lock().sorted_pending();
                        if let Err(err) = chan.subs_log.delete_sub(shadow.id) {
                            tracing::error!(error = ?err, "error deleting shadow subscription record");
                        }
                        self.transfer_queue_pending(&chan, group, shadow_pending);
                    }
                    joined_group = Some(join.group().clone());
                }
                tracing::debug!(client = %sr.client_id, subject = %sr.subject, inbox = %sr.inbox, "subscribed");
                sub
            }
        };
        if let Some(client) = self.clients.lookup(&sr.client_id) {
            client.add_sub(&sub);
        }

        // Register interest on the ack inbox; the handler re-resolves the
        // subscription through the channel's ack-inbox index.
        let ack_inbox = sub.lock().ack_inbox.clone();
        let weak = self.self_ref.clone();
        let interest = self.transport.subscribe(
            &ack_inbox,
            Arc::new(move |msg| {
                if let Some(server) = weak.upgrade() {
                    server.process_ack_msg(msg);
                }
            }),
        );
        match interest {
            Ok(handle) => sub.lock().ack_interest = Some(handle),
            Err(err) => {
                tracing::error!(error = ?err, "could not subscribe to ack subject");
                self.reply_sub_err(&msg.reply, &ProtoError::InvalidSubscription);
                return;
            }
        }

        self.publish_reply(&msg.reply, &SubscriptionResponse { ack_inbox: ack_inbox.clone(), error: String::new() });

        // Drive delivery: a re-attached durable first gets its outstanding
        // messages, then forward delivery resumes.
        if is_reattach {
            self.perform_durable_redelivery(&chan, &sub);
            self.send_available_messages(&chan, &sub);
            return;
        }
        match joined_group {
            Some(group) => self.send_available_messages_to_queue(&chan, &group),
            None => self.send_available_messages(&chan, &sub),
        }
    }

    /// Resolve the first sequence to deliver for a fresh subscription.
    fn resolve_start_sequence(&self, chan: &Arc<Channel>, sr: &SubscriptionRequest) -> Result<u64, ProtoError> {
        match StartPosition::from_i32(sr.start_position) {
            Some(StartPosition::NewOnly) | None => Ok(chan.msgs.last_sequence() + 1),
            Some(StartPosition::LastReceived) => Ok(chan.msgs.last_sequence().max(1)),
            Some(StartPosition::TimeDeltaStart) => {
                let start_time = unix_now_nanos() - sr.start_time_delta;
                match (chan.msgs.first_msg(), chan.msgs.last_msg()) {
                    (Some(first), Some(last)) if start_time >= first.timestamp && start_time <= last.timestamp => {
                        Ok(chan.msgs.sequence_for_timestamp(start_time))
                    }
                    _ => Err(ProtoError::InvalidStartTime),
                }
            }
            Some(StartPosition::SequenceStart) => {
                let (first, last) = (chan.msgs.first_sequence(), chan.msgs.last_sequence());
                if sr.start_sequence < first || sr.start_sequence > last {
                    return Err(ProtoError::InvalidStartSequence);
                }
                Ok(sr.start_sequence)
            }
            Some(StartPosition::First) => Ok(chan.msgs.first_sequence()),
        }
    }

    /// Process an unsubscribe request.
    #[tracing::instrument(level = "trace", skip(self, msg))]
    fn process_unsubscribe_request(&self, msg: TransportMessage) {
        let req = match UnsubscribeRequest::decode(msg.data.as_slice()) {
            Ok(req) => req,
            Err(_err) => {
                tracing::error!("received undecodable unsubscribe request");
                self.reply_sub_err(&msg.reply, &ProtoError::BadSubscriptionRequest);
                return;
            }
        };
        let chan = match self.channels.lookup(&req.subject) {
            Some(chan) => chan,
            None => {
                tracing::error!(client = %req.client_id, subject = %req.subject, "unsubscribe request for unknown channel");
                self.reply_sub_err(&msg.reply, &ProtoError::InvalidSubscription);
                return;
            }
        };
        let sub = match chan.subs.lookup_by_ack_inbox(&req.inbox) {
            Some(sub) => sub,
            None => {
                tracing::error!(client = %req.client_id, inbox = %req.inbox, "unsubscribe request for unknown inbox");
                self.reply_sub_err(&msg.reply, &ProtoError::InvalidSubscription);
                return;
            }
        };
        self.remove_subscription(&chan, &sub, true);
        if let Some(client) = self.clients.lookup(&req.client_id) {
            tracing::debug!(client = %req.client_id, subject = %req.subject, "unsubscribing");
            client.remove_sub(&sub);
        }
        self.publish_reply(&msg.reply, &SubscriptionResponse { ack_inbox: req.inbox.clone(), error: String::new() });
    }

    /// Process a client close request.
    #[tracing::instrument(level = "trace", skip(self, msg))]
    fn process_close_request(&self, msg: TransportMessage) {
        let req = match CloseRequest::decode(msg.data.as_slice()) {
            Ok(req) if !req.client_id.is_empty() => req,
            _ => {
                tracing::error!(subject = %msg.subject, "received invalid close request");
                self.publish_reply(&msg.reply, &CloseResponse { error: ProtoError::InvalidCloseRequest.to_string() });
                return;
            }
        };
        self.close_client(&req.client_id);
        self.publish_reply(&msg.reply, &CloseResponse { error: String::new() });
    }
}
