use std::sync::Arc;

use bytestring::ByteString;
use dashmap::DashMap;

use crate::consumer::{Consumer, DeliverySink, SettleMode};
use crate::subscription::{Subscription, DEADLETTER_QUEUE, MANAGEMENT};
use crate::types::{Addr, HolderId};
use crate::ServiceError;

/// Components of a consumer source address,
/// `{topic}/Subscriptions/{subscription}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressInfo {
    pub node: ByteString,
    pub subscription: Option<ByteString>,
}

/// Splits an address into its topic and subscription parts. The subscription
/// part keeps any trailing endpoint segments
/// (`sub1/$deadletterqueue`, `sub1/$management`).
pub fn parse_address(address: &str) -> AddressInfo {
    let parts = address.split('/').filter(|p| !p.is_empty()).collect::<Vec<_>>();
    AddressInfo {
        node: ByteString::from(parts.first().copied().unwrap_or_default()),
        subscription: if parts.len() > 2 { Some(ByteString::from(parts[2..].join("/"))) } else { None },
    }
}

/// Routes inbound attachments and messages to the subscriptions of one topic.
///
/// Subscriptions are registered under their lower-cased name; lookups are
/// case-insensitive. The dead-letter and management endpoints are addressable
/// for consumption but excluded from message fan-out.
pub struct SubscriptionHandler {
    subscriptions: DashMap<String, Arc<Subscription>>,
}

impl SubscriptionHandler {
    pub fn new(subscriptions: impl IntoIterator<Item = Arc<Subscription>>) -> Self {
        let map = DashMap::new();
        for subscription in subscriptions {
            map.insert(subscription.name().to_lowercase(), subscription);
        }
        Self { subscriptions: map }
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<Arc<Subscription>> {
        self.subscriptions.get(&name.to_lowercase()).map(|entry| entry.value().clone())
    }

    /// The subscriptions that receive published messages; endpoint
    /// subscriptions (dead-letter, management) are excluded.
    pub fn message_subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .iter()
            .filter(|entry| {
                let name = entry.value().name();
                !name.ends_with(MANAGEMENT) && !name.ends_with(DEADLETTER_QUEUE)
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Finds the subscription holding a consumer registered under `address`;
    /// used to route reply-addressed publishes.
    pub fn subscription_by_address(&self, address: &Addr) -> Option<Arc<Subscription>> {
        self.subscriptions
            .iter()
            .find(|entry| entry.value().has_address(address))
            .map(|entry| entry.value().clone())
    }

    /// Attaches a consuming link: resolves the subscription from the source
    /// address and registers the consumer under its own address.
    pub fn attach_consumer(
        &self,
        source: &str,
        consumer_address: impl Into<Addr>,
        link_name: impl Into<HolderId>,
        settle_mode: SettleMode,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<Arc<Consumer>, ServiceError> {
        let info = parse_address(source);
        let name = info.subscription.as_deref().unwrap_or_default();

        let subscription = match self.get(name) {
            Some(subscription) => subscription,
            None => {
                log::warn!("can not find the subscription {:?}", name);
                return Err(ServiceError::SubscriptionNotFound(name.into()));
            }
        };
        let consumer_address = consumer_address.into();
        subscription
            .attach_consumer(consumer_address.clone(), link_name, settle_mode, sink)
            .ok_or(ServiceError::ConsumerExists(consumer_address))
    }

    /// Detaches the consumer registered under `consumer_address` from the
    /// subscription named by the source address.
    pub fn detach_consumer(&self, source: &str, consumer_address: &Addr) -> bool {
        let info = parse_address(source);
        let name = info.subscription.as_deref().unwrap_or_default();
        match self.get(name) {
            Some(subscription) => subscription.detach_consumer(consumer_address),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::queue::MessageQueue;
    use crate::settings::SubscriptionSettings;
    use crate::subscription::SubscriptionKind;

    fn subscription(name: &str, stop: &CancellationToken) -> Arc<Subscription> {
        let queue = MessageQueue::new(name.to_owned(), SubscriptionSettings::new("sub1"), None, stop.clone());
        Subscription::new(name.to_owned(), SubscriptionKind::Topic, queue, stop.clone())
    }

    #[test]
    fn parses_topic_and_subscription() {
        let info = parse_address("orders/Subscriptions/sub1");
        assert_eq!(info.node, "orders");
        assert_eq!(info.subscription.as_deref(), Some("sub1"));

        let info = parse_address("orders/Subscriptions/sub1/$deadletterqueue");
        assert_eq!(info.subscription.as_deref(), Some("sub1/$deadletterqueue"));

        let info = parse_address("orders");
        assert_eq!(info.node, "orders");
        assert!(info.subscription.is_none());
    }

    #[tokio::test]
    async fn lookups_are_case_insensitive() {
        let stop = CancellationToken::new();
        let handler = SubscriptionHandler::new([subscription("Sub1", &stop)]);

        assert!(handler.get("sub1").is_some());
        assert!(handler.get("SUB1").is_some());
        assert!(handler.get("other").is_none());
        stop.cancel();
    }

    #[tokio::test]
    async fn endpoint_subscriptions_are_excluded_from_fanout() {
        let stop = CancellationToken::new();
        let handler = SubscriptionHandler::new([
            subscription("sub1", &stop),
            subscription("sub1/$deadletterqueue", &stop),
            subscription("sub1/$management", &stop),
        ]);

        let fanout = handler.message_subscriptions();
        assert_eq!(fanout.len(), 1);
        assert_eq!(fanout[0].name(), "sub1");
        stop.cancel();
    }

    #[tokio::test]
    async fn attach_routes_by_source_address() {
        let stop = CancellationToken::new();
        let handler = SubscriptionHandler::new([subscription("sub1", &stop)]);
        let (tx, _rx) = mpsc::unbounded_channel();

        let consumer = handler
            .attach_consumer(
                "orders/Subscriptions/sub1",
                "client-addr",
                "link-1",
                SettleMode::SettleOnDispose,
                Arc::new(tx),
            )
            .unwrap();
        assert_eq!(consumer.name(), "link-1");

        let addr: Addr = "client-addr".into();
        let found = handler.subscription_by_address(&addr).unwrap();
        assert_eq!(found.name(), "sub1");

        assert!(handler.detach_consumer("orders/Subscriptions/sub1", &addr));
        assert!(handler.subscription_by_address(&addr).is_none());
        stop.cancel();
    }

    #[tokio::test]
    async fn attach_to_unknown_subscription_fails() {
        let stop = CancellationToken::new();
        let handler = SubscriptionHandler::new([subscription("sub1", &stop)]);
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = handler
            .attach_consumer(
                "orders/Subscriptions/nope",
                "client-addr",
                "link-1",
                SettleMode::SettleOnDispose,
                Arc::new(tx),
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::SubscriptionNotFound(_)));
        stop.cancel();
    }
}
