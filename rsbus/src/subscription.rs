use std::sync::Arc;

use bytestring::ByteString;
use dashmap::DashMap;
use itertools::Itertools;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::consumer::{Consumer, DeliverySink, SettleMode};
use crate::management;
use crate::message::Message;
use crate::queue::MessageQueue;
use crate::types::{Addr, HolderId};

/// Endpoint name suffix of a dead-letter subscription.
pub const DEADLETTER_QUEUE: &str = "$deadletterqueue";
/// Endpoint name suffix of a management subscription.
pub const MANAGEMENT: &str = "$management";

/// Behavior of the dispatch loop when a message is pulled; the only part
/// that varies between subscription endpoints.
pub enum SubscriptionKind {
    /// Plain delivery, unconditional re-append when every consumer fails.
    /// Used for dead-letter endpoints, which must never dead-letter into
    /// themselves.
    Queue,
    /// Plain delivery with a dead-letter threshold check before re-append.
    Topic,
    /// Pulled items are management requests against the target queue.
    Management { target: Arc<MessageQueue> },
}

/// One named endpoint of a topic: a message queue, its consumers and the
/// dispatch loop pumping one into the other.
///
/// The loop dequeues, waits for a non-drained consumer when none is active,
/// then processes the message on a small bounded pool so a stalled consumer
/// cannot serialize all deliveries. Delivery order across messages is not
/// guaranteed once retries interleave.
pub struct Subscription {
    name: ByteString,
    kind: SubscriptionKind,
    queue: Arc<MessageQueue>,
    consumers: DashMap<Addr, Arc<Consumer>>,
    /// Edge-triggered "a consumer left drain" signal.
    active_wake: Arc<Notify>,
    stop: CancellationToken,
}

/// Parallel message-processing slots per subscription.
const MAX_PROCESS_TASKS: usize = 3;

impl Subscription {
    pub fn new(
        name: impl Into<ByteString>,
        kind: SubscriptionKind,
        queue: Arc<MessageQueue>,
        stop: CancellationToken,
    ) -> Arc<Self> {
        let subscription = Arc::new(Self {
            name: name.into(),
            kind,
            queue,
            consumers: DashMap::new(),
            active_wake: Arc::new(Notify::new()),
            stop,
        });
        let this = subscription.clone();
        tokio::spawn(async move {
            this.dispatch_loop().await;
        });
        subscription
    }

    #[inline]
    pub fn name(&self) -> &ByteString {
        &self.name
    }

    #[inline]
    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    /// Whether a consumer of this subscription is registered under `address`.
    #[inline]
    pub fn has_address(&self, address: &Addr) -> bool {
        self.consumers.contains_key(address)
    }

    #[inline]
    pub fn consumer(&self, address: &Addr) -> Option<Arc<Consumer>> {
        self.consumers.get(address).map(|entry| entry.value().clone())
    }

    /// Accepts a message into this subscription's queue.
    pub fn write(&self, message: Message) {
        let seq = self.queue.enqueue(message);
        log::trace!("write message {} to subscription {:?}", seq, self.name);
    }

    /// Registers a receiving link under its address. Fails when the address
    /// is already taken.
    pub fn attach_consumer(
        &self,
        address: impl Into<Addr>,
        link_name: impl Into<HolderId>,
        settle_mode: SettleMode,
        sink: Arc<dyn DeliverySink>,
    ) -> Option<Arc<Consumer>> {
        let address = address.into();
        let consumer = Arc::new(Consumer::new(
            link_name,
            settle_mode,
            self.queue.clone(),
            sink,
            self.active_wake.clone(),
        ));
        match self.consumers.entry(address.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                log::trace!("attach consumer {:?} to subscription {:?}", address, self.name);
                entry.insert(consumer.clone());
                Some(consumer)
            }
        }
    }

    pub fn detach_consumer(&self, address: &Addr) -> bool {
        let detached = self.consumers.remove(address).is_some();
        if detached {
            log::trace!("detach consumer {:?} from subscription {:?}", address, self.name);
        }
        detached
    }

    async fn dispatch_loop(self: Arc<Self>) {
        let pool = Arc::new(Semaphore::new(MAX_PROCESS_TASKS));

        loop {
            log::trace!("subscription {:?} waiting for a message", self.name);
            let message = match self.queue.dequeue(&self.stop).await {
                Some(message) => message,
                None => break,
            };

            if !self.consumers.iter().any(|c| !c.is_drain()) {
                log::trace!(
                    "no consumers for message {} in subscription {:?}, waiting",
                    message.sequence_no,
                    self.name
                );
                tokio::select! {
                    _ = self.active_wake.notified() => {},
                    _ = self.stop.cancelled() => break,
                }
            }

            let permit = match pool.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let this = self.clone();
            tokio::spawn(async move {
                this.process_message(message).await;
                drop(permit);
            });
        }
        log::debug!("subscription {:?} dispatch loop stopped", self.name);
    }

    async fn process_message(&self, message: Message) {
        match &self.kind {
            SubscriptionKind::Management { target } => {
                management::handle_request(self, target, message).await;
            }
            SubscriptionKind::Queue | SubscriptionKind::Topic => {
                self.deliver_message(message).await;
            }
        }
    }

    async fn deliver_message(&self, message: Message) {
        log::trace!("process message {} in subscription {:?}", message.sequence_no, self.name);

        // fewest received messages first, to spread load across consumers
        let active = self
            .consumers
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|consumer| !consumer.is_drain())
            .sorted_by_key(|consumer| consumer.received_messages())
            .collect::<Vec<_>>();

        for consumer in active {
            if consumer.try_to_deliver(&message).await {
                log::trace!(
                    "delivered message {} in subscription {:?} to {:?}",
                    message.sequence_no,
                    self.name,
                    consumer.name()
                );
                return;
            }
        }

        if matches!(self.kind, SubscriptionKind::Topic)
            && message.delivery_count >= self.queue.max_delivery_count()
            && self.queue.try_deadletter_message(&message)
        {
            log::debug!(
                "undeliverable message {} in subscription {:?} dead-lettered",
                message.sequence_no,
                self.name
            );
            return;
        }

        if !self.queue.re_enqueue(&message) {
            log::error!(
                "can not re-enqueue message {} in subscription {:?}",
                message.sequence_no,
                self.name
            );
        }
    }
}
