use std::sync::Arc;

use bytestring::ByteString;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::consumer::{Consumer, DeliverySink, SettleMode};
use crate::handler::{parse_address, SubscriptionHandler};
use crate::message::Message;
use crate::queue::MessageQueue;
use crate::settings::{BrokerSettings, SubscriptionSettings, TopicSettings};
use crate::subscription::{Subscription, SubscriptionKind, DEADLETTER_QUEUE, MANAGEMENT};
use crate::types::Addr;
use crate::ServiceError;

/// One topic: its subscriptions (each with dead-letter and management
/// endpoints) and the publish fan-out over them.
pub struct TopicNode {
    name: ByteString,
    handler: SubscriptionHandler,
}

impl TopicNode {
    /// Builds the topic from its configuration. Every configured
    /// subscription gets three endpoints: the dead-letter subscription, the
    /// main subscription whose queue dead-letters into it, and a management
    /// subscription operating on the main queue.
    fn new(cfg: &TopicSettings, stop: &CancellationToken) -> Self {
        let subscriptions = cfg
            .subscriptions
            .iter()
            .flat_map(|sub| Self::build_subscription(&cfg.name, sub, stop))
            .collect::<Vec<_>>();
        Self {
            name: cfg.name.clone(),
            handler: SubscriptionHandler::new(subscriptions),
        }
    }

    fn build_subscription(
        topic: &ByteString,
        cfg: &SubscriptionSettings,
        stop: &CancellationToken,
    ) -> Vec<Arc<Subscription>> {
        let deadletter_name = format!("{}/{}", cfg.name, DEADLETTER_QUEUE);
        let management_name = format!("{}/{}", cfg.name, MANAGEMENT);

        let deadletter_queue = MessageQueue::new(
            format!("{}/{}", topic, deadletter_name),
            cfg.clone(),
            None,
            stop.clone(),
        );
        let main_queue = MessageQueue::new(
            format!("{}/{}", topic, cfg.name),
            cfg.clone(),
            Some(deadletter_queue.clone()),
            stop.clone(),
        );
        let management_queue = MessageQueue::new(
            format!("{}/{}", topic, management_name),
            cfg.clone(),
            None,
            stop.clone(),
        );

        vec![
            Subscription::new(deadletter_name, SubscriptionKind::Queue, deadletter_queue, stop.clone()),
            Subscription::new(cfg.name.clone(), SubscriptionKind::Topic, main_queue.clone(), stop.clone()),
            Subscription::new(
                management_name,
                SubscriptionKind::Management { target: main_queue },
                management_queue,
                stop.clone(),
            ),
        ]
    }

    #[inline]
    pub fn name(&self) -> &ByteString {
        &self.name
    }

    #[inline]
    pub fn handler(&self) -> &SubscriptionHandler {
        &self.handler
    }

    #[inline]
    pub fn subscription(&self, name: &str) -> Option<Arc<Subscription>> {
        self.handler.get(name)
    }

    /// Publishes into this topic. A message carrying a reply address goes
    /// only to the subscription holding that consumer; anything else fans out
    /// to every message subscription.
    pub fn publish(&self, message: Message) -> Result<(), ServiceError> {
        if let Some(reply_to) = message.reply_to.as_ref() {
            let subscription = self
                .handler
                .subscription_by_address(reply_to)
                .ok_or_else(|| ServiceError::AddressNotFound(reply_to.clone()))?;
            subscription.write(message);
            return Ok(());
        }

        let subscriptions = self.handler.message_subscriptions();
        if subscriptions.is_empty() {
            log::warn!("there is no subscriber in topic {:?}", self.name);
            return Err(ServiceError::NoSubscriber);
        }
        for subscription in subscriptions {
            subscription.write(message.clone());
        }
        Ok(())
    }
}

/// The broker: all configured topics plus the shutdown signal their dispatch
/// and sweep tasks observe.
///
/// Everything is in-memory; dropping the broker after [`Broker::shutdown`]
/// discards all messages.
pub struct Broker {
    topics: DashMap<String, Arc<TopicNode>>,
    stop: CancellationToken,
}

impl Broker {
    pub fn new(settings: BrokerSettings) -> Self {
        let stop = CancellationToken::new();
        let topics = DashMap::new();
        for topic in &settings.topics {
            topics.insert(topic.name.to_lowercase(), Arc::new(TopicNode::new(topic, &stop)));
        }
        log::debug!("broker started with {} topics", topics.len());
        Self { topics, stop }
    }

    #[inline]
    pub fn topic(&self, name: &str) -> Option<Arc<TopicNode>> {
        self.topics.get(&name.to_lowercase()).map(|entry| entry.value().clone())
    }

    #[inline]
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// Publishes into the named topic.
    pub fn publish(&self, topic: &str, message: Message) -> Result<(), ServiceError> {
        self.topic(topic)
            .ok_or_else(|| ServiceError::NodeNotFound(topic.into()))?
            .publish(message)
    }

    /// Attaches a consuming link to the subscription named by `source`
    /// (`{topic}/Subscriptions/{subscription}` with an optional
    /// `/$deadletterqueue` or `/$management` suffix). The returned handle
    /// carries the credit and settlement entry points.
    pub fn attach_consumer(
        &self,
        source: &str,
        consumer_address: impl Into<Addr>,
        link_name: impl Into<ByteString>,
        settle_mode: SettleMode,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<Arc<Consumer>, ServiceError> {
        let node = parse_address(source).node;
        self.topic(&node)
            .ok_or(ServiceError::NodeNotFound(node))?
            .handler()
            .attach_consumer(source, consumer_address, link_name, settle_mode, sink)
    }

    pub fn detach_consumer(&self, source: &str, consumer_address: &Addr) -> bool {
        let node = parse_address(source).node;
        match self.topic(&node) {
            Some(topic) => topic.handler().detach_consumer(source, consumer_address),
            None => false,
        }
    }

    /// Stops every dispatch loop and expiry sweep. In-flight deliveries are
    /// not aborted, but nothing new starts.
    pub fn shutdown(&self) {
        log::debug!("broker shutting down");
        self.stop.cancel();
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::settings::TopicSettings;

    fn broker() -> Broker {
        Broker::new(
            BrokerSettings::default().topic(
                TopicSettings::new("orders")
                    .subscription(SubscriptionSettings::new("sub1"))
                    .subscription(SubscriptionSettings::new("sub2")),
            ),
        )
    }

    #[tokio::test]
    async fn publish_fans_out_to_all_message_subscriptions() {
        let broker = broker();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        broker
            .attach_consumer("orders/Subscriptions/sub1", "a1", "l1", SettleMode::SettleOnSend, Arc::new(tx1))
            .unwrap()
            .on_credit(10, false);
        broker
            .attach_consumer("orders/Subscriptions/sub2", "a2", "l2", SettleMode::SettleOnSend, Arc::new(tx2))
            .unwrap()
            .on_credit(10, false);

        broker.publish("orders", Message::with_payload("fan-out")).unwrap();

        let m1 = tokio::time::timeout(Duration::from_secs(1), rx1.recv()).await.unwrap().unwrap();
        let m2 = tokio::time::timeout(Duration::from_secs(1), rx2.recv()).await.unwrap().unwrap();
        assert_eq!(m1.payload, "fan-out");
        assert_eq!(m2.payload, "fan-out");
    }

    #[tokio::test]
    async fn reply_addressed_publish_goes_to_one_subscription() {
        let broker = broker();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        broker
            .attach_consumer("orders/Subscriptions/sub1", "reply-addr", "l1", SettleMode::SettleOnSend, Arc::new(tx1))
            .unwrap()
            .on_credit(10, false);
        broker
            .attach_consumer("orders/Subscriptions/sub2", "a2", "l2", SettleMode::SettleOnSend, Arc::new(tx2))
            .unwrap()
            .on_credit(10, false);

        broker
            .publish("orders", Message::with_payload("reply").reply_to("reply-addr"))
            .unwrap();

        let m1 = tokio::time::timeout(Duration::from_secs(1), rx1.recv()).await.unwrap().unwrap();
        assert_eq!(m1.payload, "reply");
        assert!(tokio::time::timeout(Duration::from_millis(100), rx2.recv()).await.is_err());
    }

    #[tokio::test]
    async fn publish_to_unknown_reply_address_fails() {
        let broker = broker();
        let err = broker
            .publish("orders", Message::with_payload("x").reply_to("nowhere"))
            .unwrap_err();
        assert!(matches!(err, ServiceError::AddressNotFound(_)));

        let err = broker.publish("missing", Message::with_payload("x")).unwrap_err();
        assert!(matches!(err, ServiceError::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn every_subscription_has_its_three_endpoints() {
        let broker = broker();
        let topic = broker.topic("orders").unwrap();

        assert!(topic.subscription("sub1").is_some());
        assert!(topic.subscription("sub1/$deadletterqueue").is_some());
        assert!(topic.subscription("sub1/$management").is_some());

        // only the main subscriptions take part in fan-out
        assert_eq!(topic.handler().message_subscriptions().len(), 2);
        broker.shutdown();
    }
}
