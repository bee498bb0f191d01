//! The delivery engine: forward delivery, flow control, ack processing, and
//! redelivery of expired in-flight messages.

use std::sync::Arc;
use std::time::Duration;

use crate::proto::{Ack, MsgProto};
use crate::server::subs::{AckTimer, QueueGroup, QueueInner, SubInner, SubState};
use crate::server::{unix_now_nanos, Channel, ServerInner, METRIC_MSGS_REDELIVERED};
use crate::utils;

/// Select the queue group member with the smallest in-flight count. Ties are
/// broken by join order.
pub(crate) fn find_best_queue_sub(subs: &[Arc<SubState>]) -> Option<Arc<SubState>> {
    let mut best: Option<(Arc<SubState>, usize)> = None;
    for sub in subs {
        let outstanding = sub.lock().acks_pending.len();
        match &best {
            Some((_, best_outstanding)) if outstanding >= *best_outstanding => (),
            _ => best = Some((sub.clone(), outstanding)),
        }
    }
    best.map(|(sub, _)| sub)
}

impl ServerInner {
    /// Send a message to a subscription. The caller holds the subscription
    /// lock.
    ///
    /// Returns false without mutating state when the in-flight window is
    /// full (marking the subscription stalled) or the transport publish
    /// fails.
    pub(crate) fn send_msg_to_sub(&self, chan: &Channel, sub: &SubState, inner: &mut SubInner, msg: &MsgProto) -> bool {
        tracing::trace!(client = %inner.client_id, subject = %msg.subject, inbox = %inner.inbox, seq = msg.sequence, "sending msg");

        // Don't send if we have too many outstanding already.
        if inner.acks_pending.len() >= inner.max_in_flight {
            inner.stalled = true;
            tracing::debug!(client = %inner.client_id, subject = %msg.subject, seq = msg.sequence, "stalled");
            return false;
        }

        let old_last_sent = inner.last_sent;
        inner.last_sent = msg.sequence;
        let data = match utils::encode_model(msg) {
            Ok(data) => data,
            Err(err) => {
                inner.last_sent = old_last_sent;
                tracing::error!(error = ?err, "error encoding message for delivery");
                return false;
            }
        };
        if let Err(err) = self.transport.publish(&inner.inbox, data) {
            inner.last_sent = old_last_sent;
            tracing::error!(error = ?err, client = %inner.client_id, seq = msg.sequence, inbox = %inner.inbox, "failed sending msg");
            return false;
        }

        inner.acks_pending.insert(msg.sequence, msg.clone());
        if let Err(err) = chan.subs_log.add_seq_pending(sub.id, msg.sequence) {
            tracing::error!(error = ?err, "error recording pending sequence");
        }
        if let Err(err) = chan.subs_log.update_last_sent(sub.id, inner.last_sent) {
            tracing::error!(error = ?err, "error recording last sent sequence");
        }

        if inner.ack_timer.is_none() {
            let ack_wait = inner.ack_wait;
            self.arm_ack_timer(inner, ack_wait);
        }
        true
    }

    /// Send a message to the best member of a queue group. The caller holds
    /// the group lock.
    pub(crate) fn send_msg_to_queue_group(&self, chan: &Channel, qinner: &mut QueueInner, msg: &MsgProto) -> bool {
        let sub = match find_best_queue_sub(&qinner.subs) {
            Some(sub) => sub,
            None => return false,
        };
        let (sent, last_sent) = {
            let mut inner = sub.lock();
            let sent = self.send_msg_to_sub(chan, &sub, &mut inner, msg);
            (sent, inner.last_sent)
        };
        if !sent {
            qinner.stalled = true;
            return false;
        }
        if last_sent > qinner.last_sent {
            qinner.last_sent = last_sent;
        }
        true
    }

    /// Drain available messages to a plain subscription, stopping at the end
    /// of the log or the first refused send.
    pub(crate) fn send_available_messages(&self, chan: &Arc<Channel>, sub: &Arc<SubState>) {
        let mut inner = sub.lock();
        loop {
            let next_seq = inner.last_sent + 1;
            match chan.msgs.lookup(next_seq) {
                Some(next_msg) => {
                    if !self.send_msg_to_sub(chan, sub, &mut inner, &next_msg) {
                        break;
                    }
                }
                None => break,
            }
        }
    }

    /// Drain available messages to a queue group, stopping at the end of the
    /// log or the first refused send.
    pub(crate) fn send_available_messages_to_queue(&self, chan: &Arc<Channel>, group: &Arc<QueueGroup>) {
        let mut qinner = group.lock();
        loop {
            let next_seq = qinner.last_sent + 1;
            match chan.msgs.lookup(next_seq) {
                Some(next_msg) => {
                    if !self.send_msg_to_queue_group(chan, &mut qinner, &next_msg) {
                        break;
                    }
                }
                None => break,
            }
        }
    }

    /// Fan a newly committed message out to every subscriber of a channel.
    pub(crate) fn process_msg(&self, chan: &Arc<Channel>) {
        let set = chan.subs.read();
        for sub in set.psubs.iter() {
            self.send_available_messages(chan, sub);
        }
        for group in set.qsubs.values() {
            self.send_available_messages_to_queue(chan, group);
        }
    }

    /// Process an ack: clear the in-flight entry, manage the ack timer, and
    /// resume delivery when the subscription or its group was stalled.
    pub(crate) fn process_ack(&self, chan: &Arc<Channel>, sub: &Arc<SubState>, ack: &Ack) {
        let (mut stalled, q_group) = {
            let mut inner = sub.lock();
            tracing::trace!(client = %inner.client_id, subject = %inner.subject, seq = ack.sequence, "removing pending ack");
            inner.acks_pending.remove(&ack.sequence);
            let stalled = inner.stalled;
            if inner.acks_pending.len() < inner.max_in_flight {
                inner.stalled = false;
            }
            if inner.ack_timer.is_some() {
                if inner.acks_pending.is_empty() {
                    inner.clear_ack_timer();
                } else {
                    let ack_wait = inner.ack_wait;
                    inner.clear_ack_timer();
                    self.arm_ack_timer(&mut inner, ack_wait);
                }
            }
            (stalled, inner.q_group.clone())
        };
        if let Err(err) = chan.subs_log.ack_seq_pending(sub.id, ack.sequence) {
            tracing::error!(error = ?err, "error recording acked sequence");
        }

        let group = if q_group.is_empty() { None } else { chan.subs.lookup_group(&q_group) };
        if let Some(group) = &group {
            let mut qinner = group.lock();
            stalled = qinner.stalled;
            qinner.stalled = false;
        }
        if !stalled {
            return;
        }
        match &group {
            Some(group) => self.send_available_messages_to_queue(chan, group),
            None => self.send_available_messages(chan, sub),
        }
    }

    /// Arm the ack-expiration timer. The caller holds the subscription lock.
    ///
    /// The spawned task carries only the subscription's identity and
    /// re-resolves it when firing, so a stale timer cannot resurrect a
    /// removed subscription.
    pub(crate) fn arm_ack_timer(&self, inner: &mut SubInner, delay: Duration) {
        let (subject, ack_inbox) = (inner.subject.clone(), inner.ack_inbox.clone());
        let weak = self.self_ref.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(server) = weak.upgrade() {
                server.perform_ack_expiration_redelivery(&subject, &ack_inbox);
            }
        });
        inner.ack_timer = Some(AckTimer::new(task));
    }

    /// Redeliver expired in-flight messages after an ack-wait timeout.
    pub(crate) fn perform_ack_expiration_redelivery(&self, subject: &str, ack_inbox: &str) {
        let chan = match self.channels.lookup(subject) {
            Some(chan) => chan,
            None => return,
        };
        let sub = match chan.subs.lookup_by_ack_inbox(ack_inbox) {
            Some(sub) => sub,
            None => return,
        };
        tracing::debug!(subject = %subject, "redelivering on ack expiration");
        self.perform_redelivery(&chan, &sub, true);
    }

    /// Redeliver all outstanding messages to a re-attached durable.
    pub(crate) fn perform_durable_redelivery(&self, chan: &Arc<Channel>, sub: &Arc<SubState>) {
        tracing::debug!("redelivering to re-attached durable");
        self.perform_redelivery(chan, sub, false);
    }

    /// Redelivery worker; honors per-message expiration when asked to.
    fn perform_redelivery(&self, chan: &Arc<Channel>, sub: &Arc<SubState>, check_expiration: bool) {
        let (exp_nanos, sorted_msgs, inbox, client_id, q_group) = {
            let mut inner = sub.lock();
            if check_expiration {
                // Drop the handle of the timer which fired this pass; any
                // re-arming below starts a fresh one.
                inner.clear_ack_timer();
            }
            (
                inner.ack_wait.as_nanos() as i64,
                inner.sorted_pending(),
                inner.inbox.clone(),
                inner.client_id.clone(),
                inner.q_group.clone(),
            )
        };

        // A client with failed heartbeats is unreachable; let the next timer
        // or ack trigger the work instead.
        let client = match self.clients.lookup(&client_id) {
            Some(client) => client,
            None => return,
        };
        if client.failed_heartbeats() > 0 {
            return;
        }

        let now = unix_now_nanos();
        for mut msg in sorted_msgs {
            let remaining = msg.timestamp + exp_nanos - now;
            if check_expiration && remaining > 0 {
                // Pending messages are sorted by sequence, so expirations are
                // ascending; re-arm for the first unexpired one and stop.
                tracing::trace!(client = %client_id, seq = msg.sequence, "redelivery, skipping");
                let mut inner = sub.lock();
                if inner.ack_timer.is_none() {
                    self.arm_ack_timer(&mut inner, Duration::from_nanos(remaining as u64));
                }
                return;
            }

            tracing::trace!(client = %client_id, seq = msg.sequence, "redelivery, sending");
            msg.redelivered = true;
            metrics::counter!(METRIC_MSGS_REDELIVERED, 1);

            if !q_group.is_empty() {
                // Queue groups re-select the best member, which is not
                // necessarily the original one.
                {
                    let mut inner = sub.lock();
                    inner.acks_pending.remove(&msg.sequence);
                    if inner.acks_pending.is_empty() {
                        inner.clear_ack_timer();
                    }
                }
                if let Err(err) = chan.subs_log.ack_seq_pending(sub.id, msg.sequence) {
                    tracing::error!(error = ?err, "error releasing pending sequence for transfer");
                }
                let group = match chan.subs.lookup_group(&q_group) {
                    Some(group) => group,
                    None => break,
                };
                let qinner = group.lock();
                let qsub = match find_best_queue_sub(&qinner.subs) {
                    Some(qsub) => qsub,
                    None => {
                        tracing::error!(client = %client_id, "unable to find queue member for redelivery");
                        break;
                    }
                };
                let mut qsub_inner = qsub.lock();
                qsub_inner.clear_ack_timer();
                self.send_msg_to_sub(chan, &qsub, &mut qsub_inner, &msg);
            } else {
                let data = match utils::encode_model(&msg) {
                    Ok(data) => data,
                    Err(err) => {
                        tracing::error!(error = ?err, "error encoding message for redelivery");
                        break;
                    }
                };
                if self.transport.publish(&inbox, data).is_err() {
                    // The in-flight record is kept; retry on a later tick.
                    let mut inner = sub.lock();
                    if inner.ack_timer.is_none() {
                        let ack_wait = inner.ack_wait;
                        self.arm_ack_timer(&mut inner, ack_wait);
                    }
                    break;
                }
            }
        }
    }

    /// Park a departing queue member's in-flight messages on the remaining
    /// members. Each message becomes in-flight on the least-loaded member and
    /// that member's ack timer is (re)armed for its own ack wait; the stale
    /// timestamps make the messages immediately eligible for redelivery when
    /// it fires.
    pub(crate) fn transfer_queue_pending(&self, chan: &Arc<Channel>, group: &Arc<QueueGroup>, pending: Vec<MsgProto>) {
        if pending.is_empty() {
            return;
        }
        let qinner = group.lock();
        for mut msg in pending {
            msg.redelivered = true;
            let qsub = match find_best_queue_sub(&qinner.subs) {
                Some(qsub) => qsub,
                None => break,
            };
            let mut inner = qsub.lock();
            inner.acks_pending.insert(msg.sequence, msg.clone());
            if let Err(err) = chan.subs_log.add_seq_pending(qsub.id, msg.sequence) {
                tracing::error!(error = ?err, "error recording transferred pending sequence");
            }
            if inner.ack_timer.is_none() {
                let ack_wait = inner.ack_wait;
                self.arm_ack_timer(&mut inner, ack_wait);
            }
        }
    }
}
