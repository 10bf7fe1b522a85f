use bytes::Bytes;
use bytestring::ByteString;
use uuid::Uuid;

/// Per-queue message sequence number, assigned from a strictly increasing
/// counter at enqueue time and never reused within a queue's lifetime.
pub type SequenceNo = u64;

/// Exclusive, time-bounded claim identifier, valid only while the message
/// is locked.
pub type LockToken = Uuid;

/// Identifier of the link that holds a lock (the consumer's link name).
pub type HolderId = ByteString;

/// Entity address, e.g. `orders/Subscriptions/audit`.
pub type Addr = ByteString;

/// Timestamp in milliseconds since the Unix epoch.
pub type TimestampMillis = i64;

/// Opaque per-delivery identifier handed to the transport. Carries the lock
/// token bytes for peek-lock deliveries.
pub type DeliveryTag = Bytes;
