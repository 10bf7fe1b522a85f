use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use bytestring::ByteString;
use crossbeam::queue::SegQueue;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use itertools::Itertools;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::expiration::ExpirationList;
use crate::message::{BrokerMessage, Message};
use crate::settings::SubscriptionSettings;
use crate::types::{HolderId, LockToken, SequenceNo, TimestampMillis};
use crate::utils::timestamp_millis;

/// The authoritative store and lock engine for one subscription, queue or
/// dead-letter queue.
///
/// Holds every live message (locked and deferred ones included) keyed by
/// sequence number, plus a FIFO of dispatch candidates. Candidates carry
/// sequence numbers only; the map entry is re-checked on pop, so a completed
/// message never resurfaces stale. All lock state transitions are linearized
/// through per-key atomic replace on the item map, with the expiration list's
/// atomic insert/remove deciding the winner between competing renew, release,
/// defer and expiry calls on the same lock.
pub struct MessageQueue {
    name: ByteString,
    cfg: SubscriptionSettings,
    items: DashMap<SequenceNo, BrokerMessage>,
    candidates: SegQueue<SequenceNo>,
    dequeue_wake: Notify,
    next_seq: AtomicU64,
    expiration: Arc<ExpirationList>,
    deadletter: Option<Arc<MessageQueue>>,
}

impl MessageQueue {
    /// Creates the queue and its expiry sweep task. The sweep interval is
    /// half the lock duration. `deadletter`, when present, must be a distinct
    /// queue; a dead-letter queue itself is built with `None`.
    pub fn new(
        name: impl Into<ByteString>,
        cfg: SubscriptionSettings,
        deadletter: Option<Arc<MessageQueue>>,
        stop: CancellationToken,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|this: &Weak<MessageQueue>| {
            let this = this.clone();
            let sweep_interval = (cfg.lock_duration / 2).max(Duration::from_millis(1));
            let expiration = ExpirationList::new(
                sweep_interval,
                move |message| {
                    if let Some(queue) = this.upgrade() {
                        queue.on_lock_expiration(message);
                    }
                },
                stop,
            );
            Self {
                name,
                cfg,
                items: DashMap::new(),
                candidates: SegQueue::new(),
                dequeue_wake: Notify::new(),
                next_seq: AtomicU64::new(0),
                expiration,
                deadletter,
            }
        })
    }

    #[inline]
    pub fn name(&self) -> &ByteString {
        &self.name
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn max_delivery_count(&self) -> u32 {
        self.cfg.max_delivery_count
    }

    #[inline]
    pub fn has_deadletter(&self) -> bool {
        self.deadletter.is_some()
    }

    #[inline]
    pub fn deadletter_queue(&self) -> Option<&Arc<MessageQueue>> {
        self.deadletter.as_ref()
    }

    /// Stores the message under the next sequence number and appends it to
    /// the dispatch candidates. Always succeeds.
    pub fn enqueue(&self, mut message: Message) -> SequenceNo {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let now = timestamp_millis();
        message.sequence_no = seq;
        message.enqueued_at = now;
        message.expires_at = now + self.cfg.time_to_live.as_millis() as TimestampMillis;
        message.locked_until = None;
        message.delivery_tag = Bytes::new();

        self.items.insert(seq, BrokerMessage::new(message));
        self.candidates.push(seq);
        self.dequeue_wake.notify_one();

        log::trace!("{:?} enqueued message {}", self.name, seq);
        seq
    }

    /// Re-appends an existing message to the dispatch candidates; fails when
    /// it no longer lives in this queue.
    pub fn re_enqueue(&self, message: &Message) -> bool {
        if self.items.contains_key(&message.sequence_no) {
            self.candidates.push(message.sequence_no);
            self.dequeue_wake.notify_one();
            true
        } else {
            false
        }
    }

    /// FIFO blocking pop of the next dispatch candidate. Suspends until a
    /// candidate is available or `stop` fires; `None` on cancellation.
    pub async fn dequeue(&self, stop: &CancellationToken) -> Option<Message> {
        loop {
            while let Some(seq) = self.candidates.pop() {
                // completed or dead-lettered while waiting in the FIFO
                if let Some(entry) = self.items.get(&seq) {
                    return Some(entry.value().message.clone());
                }
            }
            tokio::select! {
                _ = self.dequeue_wake.notified() => {},
                _ = stop.cancelled() => return None,
            }
        }
    }

    /// Claims the message for `holder`: fresh token, expiry now + lock
    /// duration. Returns the delivery copy carrying the token as its delivery
    /// tag, or `None` when the message is gone or already locked.
    pub fn try_lock(&self, message: &Message, holder: &HolderId) -> Option<Message> {
        self.try_lock_seq(message.sequence_no, holder)
    }

    pub fn try_lock_seq(&self, seq: SequenceNo, holder: &HolderId) -> Option<Message> {
        let mut entry = match self.items.entry(seq) {
            Entry::Occupied(entry) => entry,
            Entry::Vacant(_) => return None,
        };
        if entry.get().is_locked {
            return None;
        }

        let lock_token = Uuid::new_v4();
        let locked_until = timestamp_millis() + self.cfg.lock_duration.as_millis() as TimestampMillis;
        let locked = entry.get().clone().lock(lock_token, locked_until, holder.clone());

        if !self.expiration.try_add(locked.clone()) {
            return None;
        }
        entry.insert(locked.clone());

        let mut delivery = locked.message;
        delivery.delivery_tag = Bytes::copy_from_slice(lock_token.as_bytes());
        delivery.locked_until = Some(locked_until);

        log::trace!(
            "{:?} added lock {} until {} for message {}",
            self.name,
            lock_token,
            locked_until,
            seq
        );
        Some(delivery)
    }

    /// Extends a held lock by a full lock duration from now. `None` when the
    /// lock is unknown or already expired; both collapse to the same failure.
    pub fn try_renew_lock(&self, lock_token: LockToken, holder: &HolderId) -> Option<TimestampMillis> {
        let message = self.expiration.try_remove(lock_token, holder)?;

        let locked_until = timestamp_millis() + self.cfg.lock_duration.as_millis() as TimestampMillis;
        let renewed = message.renew_lock(locked_until);

        if !self.expiration.try_add(renewed.clone()) {
            return None;
        }
        self.replace_existing(renewed);
        Some(locked_until)
    }

    /// Completes the delivery: the message is permanently removed.
    pub fn try_remove(&self, lock_token: LockToken, holder: &HolderId) -> bool {
        match self.expiration.try_remove(lock_token, holder) {
            Some(message) => self.items.remove(&message.sequence_no()).is_some(),
            None => false,
        }
    }

    /// Removes by sequence number, regardless of lock state.
    pub fn try_remove_message(&self, message: &Message) -> bool {
        self.items.remove(&message.sequence_no).is_some()
    }

    /// Abandons the delivery: unlocks and, unless deferred, counts the failed
    /// attempt, dead-lettering once the delivery count reaches the maximum
    /// and re-appending to the candidates otherwise.
    pub fn try_release(&self, lock_token: LockToken, holder: &HolderId) -> bool {
        let message = match self.expiration.try_remove(lock_token, holder) {
            Some(message) => message,
            None => return false,
        };

        let released = message.unlock();
        if released.is_deferred {
            self.replace_existing(released);
        } else {
            self.requeue_or_deadletter(released);
        }
        true
    }

    /// Undoes a `try_lock` whose delivery never reached the transport:
    /// unlocks without counting an attempt and without re-appending. The
    /// caller re-appends through the normal dispatch path. Fails when the
    /// lock already expired.
    pub fn try_revert_lock(&self, lock_token: LockToken, holder: &HolderId) -> bool {
        match self.expiration.try_remove(lock_token, holder) {
            Some(message) => self.replace_existing(message.unlock()),
            None => false,
        }
    }

    /// Unlocks and marks deferred: excluded from dispatch, reachable only
    /// through [`Self::deferred_messages`].
    pub fn try_defer(&self, lock_token: LockToken, holder: &HolderId) -> bool {
        match self.expiration.try_remove(lock_token, holder) {
            Some(message) => {
                self.replace_existing(message.defer());
                true
            }
            None => false,
        }
    }

    /// Moves the locked message into the dead-letter queue. Fails when no
    /// dead-letter queue is configured or the lock is gone.
    pub fn try_deadletter(&self, lock_token: LockToken, holder: &HolderId) -> bool {
        let deadletter = match self.deadletter.as_ref() {
            Some(deadletter) => deadletter,
            None => return false,
        };
        let message = match self.expiration.try_remove(lock_token, holder) {
            Some(message) => message,
            None => return false,
        };
        if self.items.remove(&message.sequence_no()).is_none() {
            return false;
        }
        self.deadletter_enqueue(deadletter, message.message);
        true
    }

    /// Moves an unlocked message into the dead-letter queue by sequence
    /// number.
    pub fn try_deadletter_message(&self, message: &Message) -> bool {
        let deadletter = match self.deadletter.as_ref() {
            Some(deadletter) => deadletter,
            None => return false,
        };
        match self.items.remove(&message.sequence_no) {
            Some((_, removed)) => {
                self.deadletter_enqueue(deadletter, removed.message);
                true
            }
            None => false,
        }
    }

    /// Returns the entries that are deferred and currently unlocked. A
    /// sequence number not matching that predicate is silently omitted; the
    /// caller compares counts to detect partial failure.
    pub fn deferred_messages(&self, seqs: &[SequenceNo]) -> Vec<Message> {
        seqs.iter()
            .filter_map(|seq| {
                self.items
                    .get(seq)
                    .filter(|entry| entry.is_deferred && !entry.is_locked)
                    .map(|entry| entry.message.clone())
            })
            .collect()
    }

    /// Read-only ordered scan of up to `max_messages` entries with sequence
    /// numbers beyond `from_seq_exclusive`. Never touches lock state or
    /// delivery counts.
    pub fn peek(&self, max_messages: usize, from_seq_exclusive: Option<SequenceNo>) -> Vec<Message> {
        self.items
            .iter()
            .filter(|entry| from_seq_exclusive.map_or(true, |from| *entry.key() > from))
            .map(|entry| (*entry.key(), entry.value().message.clone()))
            .sorted_by_key(|(seq, _)| *seq)
            .take(max_messages)
            .map(|(_, message)| message)
            .collect()
    }

    /// Sole path by which a message abandoned by timeout re-enters
    /// circulation or is dead-lettered.
    fn on_lock_expiration(&self, message: BrokerMessage) {
        log::trace!(
            "{:?} lock {} for message {} expired",
            self.name,
            message.lock_token,
            message.sequence_no()
        );

        let unlocked = message.unlock();
        if unlocked.is_deferred {
            // deferred messages are never auto-requeued
            self.replace_existing(unlocked);
        } else {
            self.requeue_or_deadletter(unlocked);
        }
    }

    /// Counts one failed delivery attempt. The expiry and release paths both
    /// come through here, so the threshold is applied exactly once per
    /// attempt.
    fn requeue_or_deadletter(&self, mut message: BrokerMessage) {
        message.message.delivery_count += 1;

        if message.message.delivery_count >= self.cfg.max_delivery_count {
            if let Some(deadletter) = self.deadletter.as_ref() {
                if self.items.remove(&message.sequence_no()).is_some() {
                    log::debug!(
                        "{:?} message {} exceeded max delivery count {}, dead-lettering",
                        self.name,
                        message.sequence_no(),
                        self.cfg.max_delivery_count
                    );
                    self.deadletter_enqueue(deadletter, message.message);
                }
                return;
            }
            // no dead-letter target (this is a dead-letter queue itself):
            // keep the message in circulation rather than lose it
            log::warn!(
                "{:?} message {} exceeded max delivery count but has no dead-letter queue",
                self.name,
                message.sequence_no()
            );
        }

        let seq = message.sequence_no();
        if self.replace_existing(message) {
            self.candidates.push(seq);
            self.dequeue_wake.notify_one();
        }
    }

    fn deadletter_enqueue(&self, deadletter: &Arc<MessageQueue>, mut message: Message) {
        message.locked_until = None;
        message.delivery_tag = Bytes::new();
        let seq = deadletter.enqueue(message);
        log::trace!("{:?} dead-lettered message as {} in {:?}", self.name, seq, deadletter.name);
    }

    /// Atomic replace-by-key; drops the update when the message was removed
    /// concurrently (completed wins over any late transition).
    fn replace_existing(&self, message: BrokerMessage) -> bool {
        match self.items.entry(message.sequence_no()) {
            Entry::Occupied(mut entry) => {
                entry.insert(message);
                true
            }
            Entry::Vacant(_) => false,
        }
    }
}
