use bytestring::ByteString;

/// Failures surfaced across the attach and publish boundary. Routine
/// lock/queue misses are plain `Option`/`bool` results on
/// [`crate::queue::MessageQueue`]; this enum carries the cases a peer needs
/// to be told about in a structured way.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("can't find the node '{0}'")]
    NodeNotFound(ByteString),
    #[error("can't find the subscription '{0}'")]
    SubscriptionNotFound(ByteString),
    #[error("can't find a subscription for address '{0}'")]
    AddressNotFound(ByteString),
    #[error("there is no subscriber in the topic to process this message")]
    NoSubscriber,
    #[error("a consumer with address '{0}' is already attached")]
    ConsumerExists(ByteString),
}
