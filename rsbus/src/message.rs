use std::collections::HashMap;

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Addr, DeliveryTag, HolderId, LockToken, SequenceNo, TimestampMillis};

/// One enqueued payload plus its delivery metadata.
///
/// An explicit value type with a first-class deep copy (`Clone`): copies cross
/// every component boundary, so no two components ever share a mutable
/// message. The broker stamps `sequence_no`, `enqueued_at` and `expires_at` at
/// enqueue time; `delivery_tag` and `locked_until` are stamped on the copy
/// handed to a consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Option<ByteString>,
    pub correlation_id: Option<ByteString>,
    /// Target address, used to route management replies to a consumer.
    pub to: Option<Addr>,
    /// Reply address; publishes carrying one are routed to that subscription.
    pub reply_to: Option<Addr>,
    /// Opaque data body.
    #[serde(default)]
    pub payload: Bytes,
    /// Structured map body, used by management requests and responses.
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    /// Application properties.
    #[serde(default)]
    pub properties: HashMap<ByteString, serde_json::Value>,

    #[serde(default)]
    pub sequence_no: SequenceNo,
    /// Times this message was handed out without being completed.
    #[serde(default)]
    pub delivery_count: u32,
    /// Per-delivery identifier; the lock token bytes for peek-lock deliveries.
    #[serde(default)]
    pub delivery_tag: DeliveryTag,
    #[serde(default)]
    pub enqueued_at: TimestampMillis,
    #[serde(default)]
    pub expires_at: TimestampMillis,
    #[serde(default)]
    pub locked_until: Option<TimestampMillis>,
}

impl Message {
    #[inline]
    pub fn with_payload(payload: impl Into<Bytes>) -> Self {
        Self { payload: payload.into(), ..Default::default() }
    }

    #[inline]
    pub fn with_value(value: serde_json::Value) -> Self {
        Self { value: Some(value), ..Default::default() }
    }

    #[inline]
    pub fn message_id(mut self, id: impl Into<ByteString>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    #[inline]
    pub fn to(mut self, to: impl Into<Addr>) -> Self {
        self.to = Some(to.into());
        self
    }

    #[inline]
    pub fn reply_to(mut self, reply_to: impl Into<Addr>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    #[inline]
    pub fn property(mut self, key: impl Into<ByteString>, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// String-typed application property, when present.
    #[inline]
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }

    /// The lock token carried in the delivery tag, when the tag holds one.
    #[inline]
    pub fn lock_token(&self) -> Option<LockToken> {
        Uuid::from_slice(self.delivery_tag.as_ref()).ok()
    }
}

/// Authoritative queue entry: a [`Message`] plus its lock state.
///
/// In exactly one of four states: unlocked-active, locked, deferred-unlocked
/// or deferred-locked. Transitions are pure, produce a new value and assert
/// their precondition; a violated precondition is a defect in the calling
/// component, not a routine failure, and panics the calling task.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub message: Message,
    pub is_deferred: bool,
    pub is_locked: bool,
    pub locked_until: TimestampMillis,
    /// Unique while locked; nil otherwise.
    pub lock_token: LockToken,
    pub lock_holder: HolderId,
}

impl BrokerMessage {
    #[inline]
    pub fn new(message: Message) -> Self {
        Self {
            message,
            is_deferred: false,
            is_locked: false,
            locked_until: 0,
            lock_token: LockToken::nil(),
            lock_holder: HolderId::new(),
        }
    }

    #[inline]
    pub fn sequence_no(&self) -> SequenceNo {
        self.message.sequence_no
    }

    /// Requires unlocked.
    #[inline]
    pub fn lock(mut self, lock_token: LockToken, locked_until: TimestampMillis, holder: HolderId) -> Self {
        assert!(!self.is_locked, "message {} is already locked", self.sequence_no());
        self.is_locked = true;
        self.locked_until = locked_until;
        self.lock_token = lock_token;
        self.lock_holder = holder;
        self
    }

    /// Requires locked; the token and holder stay unchanged.
    #[inline]
    pub fn renew_lock(mut self, locked_until: TimestampMillis) -> Self {
        assert!(self.is_locked, "message {} is not locked", self.sequence_no());
        self.locked_until = locked_until;
        self
    }

    /// Clears the lock fields regardless of the current state.
    #[inline]
    pub fn unlock(mut self) -> Self {
        self.is_locked = false;
        self.locked_until = 0;
        self.lock_token = LockToken::nil();
        self.lock_holder = HolderId::new();
        self
    }

    /// Requires locked; produces the deferred, unlocked state.
    #[inline]
    pub fn defer(self) -> Self {
        assert!(self.is_locked, "message {} is not locked", self.sequence_no());
        let mut m = self.unlock();
        m.is_deferred = true;
        m
    }
}
