use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::message::BrokerMessage;
use crate::types::{HolderId, LockToken};
use crate::utils::timestamp_millis;

pub trait OnExpirationFn: 'static + Sync + Send + Fn(BrokerMessage) {}
impl<T> OnExpirationFn for T where T: 'static + Sync + Send + Fn(BrokerMessage) {}

/// Tracks the locked messages of one queue, keyed by (lock token, holder),
/// and fires `on_expiration` exactly once per entry whose deadline passes.
///
/// The background sweep waits on a wake signal while the set is empty, then
/// sleeps a fixed interval between scans. The owning queue configures that
/// interval to half the lock duration, bounding the worst-case slack between
/// expiry and reclaim to half a lock duration. Once an entry is removed, by
/// completion or by firing, it is never processed again.
pub struct ExpirationList {
    items: DashMap<(LockToken, HolderId), BrokerMessage>,
    wake: Notify,
}

impl ExpirationList {
    /// Creates the list and spawns its sweep task. The sweep stops
    /// permanently once `stop` is cancelled; no callbacks fire afterwards.
    pub fn new<F>(sweep_interval: Duration, on_expiration: F, stop: CancellationToken) -> Arc<Self>
    where
        F: OnExpirationFn,
    {
        let list = Arc::new(Self { items: DashMap::new(), wake: Notify::new() });
        let sweeper = list.clone();
        tokio::spawn(async move {
            sweeper.sweep(sweep_interval, on_expiration, stop).await;
        });
        list
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Inserts a locked message; fails when an entry with the same
    /// (token, holder) key already exists, which signals a duplicate lock
    /// upstream. Wakes the sweep on success.
    #[inline]
    pub fn try_add(&self, message: BrokerMessage) -> bool {
        match self.items.entry((message.lock_token, message.lock_holder.clone())) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(message);
                self.wake.notify_one();
                true
            }
        }
    }

    /// Keyed lookup; absence is a routine outcome (lock expired or never
    /// existed), not an error.
    #[inline]
    pub fn try_get(&self, lock_token: LockToken, holder: &HolderId) -> Option<BrokerMessage> {
        self.items.get(&(lock_token, holder.clone())).map(|entry| entry.value().clone())
    }

    /// Keyed removal; the winner of a race between completion and the sweep
    /// is whoever removes the entry first.
    #[inline]
    pub fn try_remove(&self, lock_token: LockToken, holder: &HolderId) -> Option<BrokerMessage> {
        self.items.remove(&(lock_token, holder.clone())).map(|(_, message)| message)
    }

    async fn sweep<F>(self: Arc<Self>, interval: Duration, on_expiration: F, stop: CancellationToken)
    where
        F: OnExpirationFn,
    {
        loop {
            if self.items.is_empty() {
                tokio::select! {
                    _ = self.wake.notified() => {},
                    _ = stop.cancelled() => break,
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {},
                _ = stop.cancelled() => break,
            }

            let now = timestamp_millis();
            let expired = self
                .items
                .iter()
                .filter(|entry| entry.value().locked_until <= now)
                .map(|entry| entry.key().clone())
                .collect::<Vec<_>>();

            for key in expired {
                if let Some((_, message)) = self.items.remove(&key) {
                    log::trace!(
                        "lock {} held by {:?} for message {} expired",
                        key.0,
                        key.1,
                        message.sequence_no()
                    );
                    on_expiration(message);
                }
            }
        }
        log::debug!("expiration sweep stopped, {} tracked locks dropped", self.items.len());
    }
}
