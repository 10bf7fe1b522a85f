use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use crate::message::Message;
use crate::queue::MessageQueue;
use crate::types::{DeliveryTag, HolderId};

/// How deliveries to a receiving link are settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleMode {
    /// Fire-and-forget: the message is settled the moment it is sent.
    SettleOnSend,
    /// Settled when the peer acknowledges receipt; used by the management
    /// receive path to lock deferred messages.
    SettleOnReceive,
    /// Peek-lock: settled by an explicit disposition against the lock token.
    SettleOnDispose,
}

impl SettleMode {
    /// The wire encoding of the receiver-settle-mode property.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::SettleOnSend),
            1 => Some(Self::SettleOnReceive),
            2 => Some(Self::SettleOnDispose),
            _ => None,
        }
    }

    #[inline]
    pub fn is_peek_lock(&self) -> bool {
        !matches!(self, Self::SettleOnSend)
    }
}

/// The peer's verdict on a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Accepted,
    Rejected,
    Modified { undeliverable_here: bool },
    Released,
}

/// Where delivered messages go; implemented by the transport (or a test
/// channel). An `Err` is a transport failure, reported back to the dispatch
/// loop as a failed delivery.
#[async_trait]
pub trait DeliverySink: Sync + Send {
    async fn deliver(&self, message: Message) -> crate::Result<()>;
}

#[async_trait]
impl DeliverySink for tokio::sync::mpsc::UnboundedSender<Message> {
    async fn deliver(&self, message: Message) -> crate::Result<()> {
        self.send(message).map_err(|_| anyhow::anyhow!("delivery channel closed"))
    }
}

/// One receiving link on a subscription.
///
/// Tracks the credit window and drain flag the transport reports, counts
/// successfully handed-off messages for the dispatch loop's fairness ordering,
/// and maps the peer's settlements onto queue dispositions. Starts drained;
/// the transport grants credit through [`Consumer::on_credit`].
pub struct Consumer {
    name: HolderId,
    settle_mode: SettleMode,
    queue: Arc<MessageQueue>,
    sink: Arc<dyn DeliverySink>,
    /// Subscription wakeup, fired when this consumer leaves drain.
    on_active: Arc<Notify>,
    credit: AtomicU32,
    drain: AtomicBool,
    received: AtomicUsize,
    next_tag: AtomicU32,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("name", &self.name)
            .field("settle_mode", &self.settle_mode)
            .field("credit", &self.credit)
            .field("drain", &self.drain)
            .field("received", &self.received)
            .field("next_tag", &self.next_tag)
            .finish_non_exhaustive()
    }
}

impl Consumer {
    pub fn new(
        name: impl Into<HolderId>,
        settle_mode: SettleMode,
        queue: Arc<MessageQueue>,
        sink: Arc<dyn DeliverySink>,
        on_active: Arc<Notify>,
    ) -> Self {
        Self {
            name: name.into(),
            settle_mode,
            queue,
            sink,
            on_active,
            credit: AtomicU32::new(0),
            drain: AtomicBool::new(true),
            received: AtomicUsize::new(0),
            next_tag: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn name(&self) -> &HolderId {
        &self.name
    }

    #[inline]
    pub fn settle_mode(&self) -> SettleMode {
        self.settle_mode
    }

    #[inline]
    pub fn is_drain(&self) -> bool {
        self.drain.load(Ordering::Acquire)
    }

    /// Messages successfully handed to the transport; the dispatch loop's
    /// fairness key.
    #[inline]
    pub fn received_messages(&self) -> usize {
        self.received.load(Ordering::Acquire)
    }

    /// Credit update from the transport. Leaving drain wakes the dispatch
    /// loop immediately instead of waiting for the next queue signal.
    pub fn on_credit(&self, credit: u32, drain: bool) {
        log::trace!("consumer {:?} credit {} drain {}", self.name, credit, drain);

        self.credit.store(credit, Ordering::Release);
        let was_drain = self.drain.swap(drain, Ordering::AcqRel);
        if was_drain && !drain {
            self.on_active.notify_one();
        }
    }

    /// Attempts one delivery. `false` asks the dispatch loop to retry with
    /// the next consumer (no credit, lock unavailable, or a transport failure
    /// whose lock could be reverted); `true` means the message was handed off
    /// or is deliberately left to its lock expiry.
    pub async fn try_to_deliver(&self, message: &Message) -> bool {
        log::trace!(
            "trying to deliver message {} to {:?}",
            message.sequence_no,
            self.name
        );

        if self.credit.load(Ordering::Acquire) == 0 {
            log::trace!("consumer {:?} has no credit", self.name);
            return false;
        }

        let delivery = match self.prepare_delivery(message) {
            Some(delivery) => delivery,
            None => return false,
        };

        self.received.fetch_add(1, Ordering::AcqRel);

        match self.sink.deliver(delivery.clone()).await {
            Ok(()) => {
                log::trace!(
                    "delivered message {} to {:?}, delivery count {}",
                    delivery.sequence_no,
                    self.name,
                    delivery.delivery_count
                );
                true
            }
            Err(e) => {
                log::error!(
                    "error delivering message {} to {:?}: {:?}",
                    message.sequence_no,
                    self.name,
                    e
                );

                if self.settle_mode == SettleMode::SettleOnDispose {
                    if let Some(lock_token) = delivery.lock_token() {
                        if self.queue.try_revert_lock(lock_token, &self.name) {
                            // retried right away by the dispatch loop
                            return false;
                        }
                    }
                }
                // lock already gone or not peek-lock: let expiry recover it
                true
            }
        }
    }

    /// Peek-lock links claim the queue lock (the token becomes the delivery
    /// tag); fire-and-forget links clone with a fresh tag and leave the queue
    /// untouched.
    fn prepare_delivery(&self, message: &Message) -> Option<Message> {
        if self.settle_mode == SettleMode::SettleOnDispose {
            self.queue.try_lock(message, &self.name)
        } else {
            let mut delivery = message.clone();
            let tag = self.next_tag.fetch_add(1, Ordering::AcqRel) + 1;
            delivery.delivery_tag = Bytes::copy_from_slice(&tag.to_le_bytes());
            Some(delivery)
        }
    }

    /// Applies the peer's settlement against the queue. `false` tells the
    /// peer the settlement failed (lock lost, unknown state); it must not
    /// assume the message was handled.
    pub fn settle(&self, delivery_tag: &DeliveryTag, settlement: Settlement) -> bool {
        let lock_token = match uuid::Uuid::from_slice(delivery_tag.as_ref()) {
            Ok(token) => token,
            Err(_) => {
                log::warn!("invalid delivery tag in settlement: {:?}", delivery_tag);
                return false;
            }
        };

        log::trace!("settling {} from {:?} as {:?}", lock_token, self.name, settlement);

        let settled = match settlement {
            Settlement::Accepted => self.queue.try_remove(lock_token, &self.name),
            Settlement::Rejected => self.queue.try_deadletter(lock_token, &self.name),
            Settlement::Modified { undeliverable_here: true } => {
                self.queue.try_defer(lock_token, &self.name)
            }
            Settlement::Modified { undeliverable_here: false } => {
                self.queue.try_release(lock_token, &self.name)
            }
            Settlement::Released => false,
        };

        if !settled {
            log::trace!("settlement of {} from {:?} failed", lock_token, self.name);
        }
        settled
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::settings::SubscriptionSettings;

    struct FailingSink;

    #[async_trait]
    impl DeliverySink for FailingSink {
        async fn deliver(&self, _message: Message) -> crate::Result<()> {
            Err(anyhow::anyhow!("link detached"))
        }
    }

    fn queue(stop: &CancellationToken) -> Arc<MessageQueue> {
        MessageQueue::new("test", SubscriptionSettings::new("test"), None, stop.clone())
    }

    fn consumer(queue: Arc<MessageQueue>, sink: Arc<dyn DeliverySink>, mode: SettleMode) -> Consumer {
        Consumer::new("link-1", mode, queue, sink, Arc::new(Notify::new()))
    }

    #[tokio::test]
    async fn no_credit_fails_fast() {
        let stop = CancellationToken::new();
        let queue = queue(&stop);
        let (tx, _rx) = mpsc::unbounded_channel();
        let consumer = consumer(queue.clone(), Arc::new(tx), SettleMode::SettleOnDispose);

        queue.enqueue(Message::with_payload("x"));
        let msg = queue.dequeue(&stop).await.unwrap();

        assert!(consumer.is_drain());
        assert!(!consumer.try_to_deliver(&msg).await);
        assert_eq!(consumer.received_messages(), 0);
        // the message was never locked
        assert!(queue.try_lock(&msg, &"other".into()).is_some());
        stop.cancel();
    }

    #[tokio::test]
    async fn peek_lock_delivery_carries_the_lock_token() {
        let stop = CancellationToken::new();
        let queue = queue(&stop);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = consumer(queue.clone(), Arc::new(tx), SettleMode::SettleOnDispose);
        consumer.on_credit(10, false);

        queue.enqueue(Message::with_payload("x"));
        let msg = queue.dequeue(&stop).await.unwrap();

        assert!(consumer.try_to_deliver(&msg).await);
        let delivery = rx.recv().await.unwrap();
        let token = delivery.lock_token().expect("peek-lock delivery carries a token");

        // locked for everyone else until settled
        assert!(queue.try_lock(&msg, &"other".into()).is_none());
        assert!(consumer.settle(&delivery.delivery_tag, Settlement::Accepted));
        assert!(queue.is_empty());
        // idempotence: token is gone now
        assert!(!queue.try_remove(token, &"link-1".into()));
        stop.cancel();
    }

    #[tokio::test]
    async fn settle_on_send_does_not_lock() {
        let stop = CancellationToken::new();
        let queue = queue(&stop);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = consumer(queue.clone(), Arc::new(tx), SettleMode::SettleOnSend);
        consumer.on_credit(10, false);

        queue.enqueue(Message::with_payload("x"));
        let msg = queue.dequeue(&stop).await.unwrap();

        assert!(consumer.try_to_deliver(&msg).await);
        let delivery = rx.recv().await.unwrap();
        assert!(delivery.lock_token().is_none());
        assert!(!delivery.delivery_tag.is_empty());
        // queue lock state untouched
        assert!(queue.try_lock(&msg, &"other".into()).is_some());
        stop.cancel();
    }

    #[tokio::test]
    async fn settlement_routes_to_the_right_disposition() {
        let stop = CancellationToken::new();
        let dlq = MessageQueue::new("t/$deadletterqueue", SubscriptionSettings::new("test"), None, stop.clone());
        let queue = MessageQueue::new("t", SubscriptionSettings::new("test"), Some(dlq.clone()), stop.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = consumer(queue.clone(), Arc::new(tx), SettleMode::SettleOnDispose);
        consumer.on_credit(10, false);

        // reject dead-letters
        queue.enqueue(Message::with_payload("bad"));
        let msg = queue.dequeue(&stop).await.unwrap();
        assert!(consumer.try_to_deliver(&msg).await);
        let delivery = rx.recv().await.unwrap();
        assert!(consumer.settle(&delivery.delivery_tag, Settlement::Rejected));
        assert_eq!(dlq.len(), 1);

        // modify + undeliverable defers
        queue.enqueue(Message::with_payload("later"));
        let msg = queue.dequeue(&stop).await.unwrap();
        assert!(consumer.try_to_deliver(&msg).await);
        let delivery = rx.recv().await.unwrap();
        assert!(consumer.settle(&delivery.delivery_tag, Settlement::Modified { undeliverable_here: true }));
        assert_eq!(queue.deferred_messages(&[msg.sequence_no]).len(), 1);

        // released is never a valid disposition here
        assert!(!consumer.settle(&delivery.delivery_tag, Settlement::Released));
        stop.cancel();
    }

    #[tokio::test]
    async fn transport_failure_reverts_the_lock() {
        let stop = CancellationToken::new();
        let queue = queue(&stop);
        let consumer = consumer(queue.clone(), Arc::new(FailingSink), SettleMode::SettleOnDispose);
        consumer.on_credit(10, false);

        queue.enqueue(Message::with_payload("x"));
        let msg = queue.dequeue(&stop).await.unwrap();

        // failed send reports a failed delivery so the loop retries promptly
        assert!(!consumer.try_to_deliver(&msg).await);
        // lock reverted, message immediately claimable again
        assert!(queue.try_lock(&msg, &"other".into()).is_some());
        stop.cancel();
    }

    #[tokio::test]
    async fn leaving_drain_fires_the_wakeup() {
        let stop = CancellationToken::new();
        let queue = queue(&stop);
        let (tx, _rx) = mpsc::unbounded_channel();
        let wake = Arc::new(Notify::new());
        let consumer = Consumer::new("link-1", SettleMode::SettleOnDispose, queue, Arc::new(tx), wake.clone());

        consumer.on_credit(10, false);
        // the permit was stored even though no one was waiting yet
        tokio::time::timeout(Duration::from_millis(100), wake.notified())
            .await
            .expect("un-drain must signal the dispatch loop");

        // staying un-drained does not signal again
        consumer.on_credit(20, false);
        assert!(tokio::time::timeout(Duration::from_millis(50), wake.notified()).await.is_err());
        stop.cancel();
    }

    #[test]
    fn settle_mode_codes() {
        assert_eq!(SettleMode::from_code(0), Some(SettleMode::SettleOnSend));
        assert_eq!(SettleMode::from_code(1), Some(SettleMode::SettleOnReceive));
        assert_eq!(SettleMode::from_code(2), Some(SettleMode::SettleOnDispose));
        assert_eq!(SettleMode::from_code(7), None);
    }
}
