//! Subscription state & per-channel subscription indices.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use tokio::task::JoinHandle;

use crate::proto::MsgProto;
use crate::transport::InterestHandle;

/// The separator of a durable queue group's composite `durable:group` name.
pub const DURABLE_GROUP_SEP: char = ':';

/// Build the lookup key of a plain durable subscription.
pub fn durable_key(client_id: &str, subject: &str, durable_name: &str) -> String {
    format!("{}-{}-{}", client_id, subject, durable_name)
}

/// A timer driving ack-expiration redelivery for one subscription.
///
/// The underlying task carries only the subscription's identity (channel
/// subject + ack inbox) and re-resolves the subscription when it fires, so a
/// timer outliving its subscription is a no-op.
pub struct AckTimer {
    task: JoinHandle<()>,
}

impl AckTimer {
    /// Wrap a spawned expiration task.
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    /// Stop the timer.
    pub fn stop(self) {
        self.task.abort();
    }
}

/// The mutable state of a subscription, guarded by the subscription lock.
pub struct SubInner {
    /// The owning client, empty while a durable is detached.
    pub client_id: String,
    /// The channel subject.
    pub subject: String,
    /// The queue group this subscription belongs to, composite form for
    /// durable queue groups; empty for plain subscriptions.
    pub q_group: String,
    /// The delivery inbox.
    pub inbox: String,
    /// The ack inbox.
    pub ack_inbox: String,
    /// The durable name, when durable.
    pub durable_name: String,
    /// The last sequence sent to this subscription.
    pub last_sent: u64,
    /// How long to wait for an ack before redelivering.
    pub ack_wait: Duration,
    /// The maximum number of unacknowledged deliveries.
    pub max_in_flight: usize,
    /// Set when a send was refused because the in-flight window was full.
    pub stalled: bool,
    /// In-flight messages keyed by sequence.
    pub acks_pending: HashMap<u64, MsgProto>,
    /// The ack-expiration timer; armed iff deliveries are in flight.
    pub ack_timer: Option<AckTimer>,
    /// The transport interest on the ack inbox.
    pub ack_interest: Option<InterestHandle>,
}

impl SubInner {
    /// Whether this subscription survives client disconnects.
    pub fn is_durable(&self) -> bool {
        !self.durable_name.is_empty()
    }

    /// Whether this subscription is a queue group member.
    pub fn is_queue(&self) -> bool {
        !self.q_group.is_empty()
    }

    /// Stop and clear the ack timer.
    pub fn clear_ack_timer(&mut self) {
        if let Some(timer) = self.ack_timer.take() {
            timer.stop();
        }
    }

    /// Copies of the in-flight messages, sorted by sequence.
    pub fn sorted_pending(&self) -> Vec<MsgProto> {
        let mut msgs: Vec<MsgProto> = self.acks_pending.values().cloned().collect();
        msgs.sort_by_key(|msg| msg.sequence);
        msgs
    }
}

/// A subscription.
pub struct SubState {
    /// The store-assigned stable ID.
    pub id: u64,
    inner: Mutex<SubInner>,
}

impl SubState {
    /// Create a new instance.
    pub fn new(id: u64, inner: SubInner) -> Self {
        Self { id, inner: Mutex::new(inner) }
    }

    /// Acquire the subscription lock.
    pub fn lock(&self) -> MutexGuard<'_, SubInner> {
        self.inner.lock()
    }
}

/// The mutable state of a queue group, guarded by the group lock.
pub struct QueueInner {
    /// The highest sequence the group has delivered.
    pub last_sent: u64,
    /// Set when the group's last send was refused by a full member.
    pub stalled: bool,
    /// The live members, in join order.
    pub subs: Vec<Arc<SubState>>,
    /// The parked record keeping a durable group's state alive while no live
    /// member exists. Never present on a non-durable group.
    pub shadow: Option<Arc<SubState>>,
}

/// A queue group of a channel.
pub struct QueueGroup {
    /// The group name; composite `durable:group` form when durable.
    pub name: String,
    /// Whether the group survives its last member leaving.
    pub durable: bool,
    inner: Mutex<QueueInner>,
}

impl QueueGroup {
    fn new(name: &str, durable: bool) -> Self {
        Self {
            name: name.to_string(),
            durable,
            inner: Mutex::new(QueueInner {
                last_sent: 0,
                stalled: false,
                subs: Vec::with_capacity(4),
                shadow: None,
            }),
        }
    }

    /// Acquire the group lock.
    pub fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock()
    }
}

/// How a new member entered its queue group.
pub enum QueueJoin {
    /// The member created the group.
    Created(Arc<QueueGroup>),
    /// The member joined a group with other live members.
    Joined(Arc<QueueGroup>),
    /// The member revived a durable group, displacing its shadow.
    AdoptedShadow {
        group: Arc<QueueGroup>,
        shadow: Arc<SubState>,
    },
}

impl QueueJoin {
    /// The joined group.
    pub fn group(&self) -> &Arc<QueueGroup> {
        match self {
            Self::Created(group) | Self::Joined(group) => group,
            Self::AdoptedShadow { group, .. } => group,
        }
    }
}

/// The outcome of removing a queue group member.
pub struct QueueRemoval {
    pub group: Arc<QueueGroup>,
    /// The members remaining after removal.
    pub remaining: Vec<Arc<SubState>>,
    /// Set when the departing member was parked as the group's shadow.
    pub shadow_installed: bool,
}

/// The indices over all subscriptions of one channel.
pub struct SubscriptionSet {
    inner: RwLock<SetInner>,
}

/// The inner indices, guarded by the set lock.
pub struct SetInner {
    /// Plain subscribers.
    pub psubs: Vec<Arc<SubState>>,
    /// Queue groups by (possibly composite) group name.
    pub qsubs: HashMap<String, Arc<QueueGroup>>,
    /// Plain durables by durable key.
    durables: HashMap<String, Arc<SubState>>,
    /// All subscriptions by ack inbox.
    acks: HashMap<String, Arc<SubState>>,
}

impl SubscriptionSet {
    /// Create a new instance.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(SetInner {
                psubs: Vec::with_capacity(4),
                qsubs: HashMap::new(),
                durables: HashMap::new(),
                acks: HashMap::new(),
            }),
        }
    }

    /// Acquire the set lock in read mode, for delivery fan-out.
    pub fn read(&self) -> RwLockReadGuard<'_, SetInner> {
        self.inner.read()
    }

    /// Store a plain subscription.
    pub fn store_plain(&self, sub: &Arc<SubState>) {
        let (ack_inbox, durable) = {
            let inner = sub.lock();
            let durable = inner
                .is_durable()
                .then(|| durable_key(&inner.client_id, &inner.subject, &inner.durable_name));
            (inner.ack_inbox.clone(), durable)
        };
        let mut set = self.inner.write();
        set.acks.insert(ack_inbox, sub.clone());
        set.psubs.push(sub.clone());
        if let Some(key) = durable {
            set.durables.insert(key, sub.clone());
        }
    }

    /// Store a queue subscription, creating its group on demand.
    ///
    /// A freshly created group starts at `created_last_sent`; a member
    /// joining an existing group adopts the group's `last_sent` instead.
    pub fn store_queue(&self, sub: &Arc<SubState>, group_name: &str, durable: bool, created_last_sent: u64) -> QueueJoin {
        let ack_inbox = sub.lock().ack_inbox.clone();
        let mut set = self.inner.write();
        set.acks.insert(ack_inbox, sub.clone());
        let created = !set.qsubs.contains_key(group_name);
        let group = set
            .qsubs
            .entry(group_name.to_string())
            .or_insert_with(|| Arc::new(QueueGroup::new(group_name, durable)))
            .clone();

        let mut qinner = group.lock();
        let shadow = qinner.shadow.take();
        if created {
            qinner.last_sent = created_last_sent;
        } else {
            sub.lock().last_sent = qinner.last_sent;
        }
        qinner.subs.push(sub.clone());
        drop(qinner);

        match (created, shadow) {
            (true, _) => QueueJoin::Created(group),
            (false, Some(shadow)) => QueueJoin::AdoptedShadow { group, shadow },
            (false, None) => QueueJoin::Joined(group),
        }
    }

    /// Remove a subscription from every index.
    ///
    /// The caller is expected to have already stopped the subscription's ack
    /// timer and dropped its ack interest. For a queue member, the outcome
    /// reports the remaining members so pending deliveries can be
    /// transferred; when the last member of a durable group leaves, the
    /// member is parked as the group's shadow instead of being discarded.
    pub fn remove(&self, sub: &Arc<SubState>, delete_durable: bool) -> Option<QueueRemoval> {
        let (ack_inbox, q_group, durable) = {
            let mut inner = sub.lock();
            inner.client_id.clear();
            let durable = inner
                .is_durable()
                .then(|| inner.durable_name.clone());
            (inner.ack_inbox.clone(), inner.q_group.clone(), durable)
        };

        let mut set = self.inner.write();
        set.acks.remove(&ack_inbox);
        if delete_durable && durable.is_some() {
            set.durables.retain(|_, entry| !Arc::ptr_eq(entry, sub));
        }

        if q_group.is_empty() {
            set.psubs.retain(|entry| !Arc::ptr_eq(entry, sub));
            return None;
        }

        let group = set.qsubs.get(&q_group)?.clone();
        let mut qinner = group.lock();
        qinner.subs.retain(|entry| !Arc::ptr_eq(entry, sub));
        let remaining = qinner.subs.clone();
        let mut shadow_installed = false;
        if remaining.is_empty() {
            if group.durable && !delete_durable {
                qinner.shadow = Some(sub.clone());
                shadow_installed = true;
            } else {
                set.qsubs.remove(&q_group);
            }
        }
        drop(qinner);
        Some(QueueRemoval { group, remaining, shadow_installed })
    }

    /// Remove the stale ack-inbox index entry of a detaching durable.
    pub fn detach_ack(&self, ack_inbox: &str) {
        self.inner.write().acks.remove(ack_inbox);
    }

    /// Move a re-attaching durable to its new ack inbox.
    pub fn rebind_ack_inbox(&self, old_inbox: &str, new_inbox: &str, sub: &Arc<SubState>) {
        let mut set = self.inner.write();
        set.acks.remove(old_inbox);
        set.acks.insert(new_inbox.to_string(), sub.clone());
    }

    /// Look up a plain durable by its durable key.
    pub fn lookup_by_durable(&self, key: &str) -> Option<Arc<SubState>> {
        self.inner.read().durables.get(key).cloned()
    }

    /// Look up a subscription by its ack inbox.
    pub fn lookup_by_ack_inbox(&self, ack_inbox: &str) -> Option<Arc<SubState>> {
        self.inner.read().acks.get(ack_inbox).cloned()
    }

    /// Look up a queue group by name.
    pub fn lookup_group(&self, name: &str) -> Option<Arc<QueueGroup>> {
        self.inner.read().qsubs.get(name).cloned()
    }

    /// Snapshot every subscription known to this set: plain subscribers,
    /// queue group members, and shadows.
    pub fn all_subs(&self) -> Vec<Arc<SubState>> {
        let set = self.inner.read();
        let mut subs = set.psubs.clone();
        for group in set.qsubs.values() {
            let qinner = group.lock();
            subs.extend(qinner.subs.iter().cloned());
            subs.extend(qinner.shadow.iter().cloned());
        }
        subs
    }

    /// Install a recovered plain durable under its durable key.
    ///
    /// The subscription joins the plain list detached; it only becomes
    /// reachable again once a client re-attaches to it.
    pub fn recover_durable(&self, key: String, sub: Arc<SubState>) {
        let mut set = self.inner.write();
        set.psubs.push(sub.clone());
        set.durables.insert(key, sub);
    }

    /// Install a recovered durable queue record as its group's shadow.
    ///
    /// When several records of one group are recovered the one with the
    /// highest `last_sent` wins; the displaced record is returned so its
    /// storage can be released.
    pub fn recover_queue_shadow(&self, group_name: &str, durable: bool, sub: Arc<SubState>) -> Option<Arc<SubState>> {
        let mut set = self.inner.write();
        let group = set
            .qsubs
            .entry(group_name.to_string())
            .or_insert_with(|| Arc::new(QueueGroup::new(group_name, durable)))
            .clone();
        drop(set);

        let mut qinner = group.lock();
        let last_sent = sub.lock().last_sent;
        if last_sent > qinner.last_sent {
            qinner.last_sent = last_sent;
        }
        let displace = match &qinner.shadow {
            Some(existing) => existing.lock().last_sent < last_sent,
            None => true,
        };
        if displace {
            qinner.shadow.replace(sub)
        } else {
            Some(sub)
        }
    }
}
