//! Management operations: protocol-level orchestration over a subscription's
//! message queue. Requests arrive as ordinary messages on the management
//! endpoint's own queue, carrying the operation name in their application
//! properties and the parameters in their map body; responses are routed back
//! to the consumer registered under the request's reply address.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::consumer::SettleMode;
use crate::message::Message;
use crate::queue::MessageQueue;
use crate::subscription::Subscription;
use crate::types::{HolderId, LockToken, SequenceNo};

pub mod operations {
    pub const RENEW_LOCK: &str = "com.microsoft:renew-lock";
    pub const RECEIVE_BY_SEQUENCE_NUMBER: &str = "com.microsoft:receive-by-sequence-number";
    pub const UPDATE_DISPOSITION: &str = "com.microsoft:update-disposition";
    pub const PEEK_MESSAGE: &str = "com.microsoft:peek-message";
}

pub mod properties {
    pub const OPERATION: &str = "operation";
    pub const ASSOCIATED_LINK_NAME: &str = "associated-link-name";
    pub const STATUS_CODE: &str = "statusCode";
    pub const STATUS_DESCRIPTION: &str = "statusDescription";
    pub const ERROR_CONDITION: &str = "errorCondition";

    pub const LOCK_TOKEN: &str = "lock-token";
    pub const LOCK_TOKENS: &str = "lock-tokens";
    pub const SEQUENCE_NUMBERS: &str = "sequence-numbers";
    pub const RECEIVER_SETTLE_MODE: &str = "receiver-settle-mode";
    pub const DISPOSITION_STATUS: &str = "disposition-status";
    pub const EXPIRATIONS: &str = "expirations";
    pub const FROM_SEQUENCE_NUMBER: &str = "from-sequence-number";
    pub const MESSAGE_COUNT: &str = "message-count";
    pub const MESSAGE: &str = "message";
    pub const MESSAGES: &str = "messages";
}

pub mod conditions {
    pub const MESSAGE_LOCK_LOST: &str = "com.microsoft:message-lock-lost";
    pub const MESSAGE_NOT_FOUND: &str = "com.microsoft:message-not-found";
    pub const ARGUMENT_ERROR: &str = "com.microsoft:argument-error";
}

pub mod status {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const FORBIDDEN: u16 = 403;
}

pub mod disposition {
    pub const COMPLETED: &str = "completed";
    pub const DEFERED: &str = "defered";
    pub const SUSPENDED: &str = "suspended";
    pub const ABANDONED: &str = "abandoned";
}

/// Builds management responses: status in the application properties, payload
/// in the map body, routing copied from the request.
pub struct ResponseBuilder {
    message: Message,
    body: Map<String, Value>,
}

impl ResponseBuilder {
    fn with_status(status_code: u16) -> Self {
        Self {
            message: Message::default().property(properties::STATUS_CODE, status_code),
            body: Map::new(),
        }
    }

    pub fn success() -> Self {
        Self::with_status(status::OK)
    }

    pub fn failed(status_code: u16) -> Self {
        Self::with_status(status_code)
    }

    pub fn error(mut self, condition: &str, description: impl Into<String>) -> Self {
        self.message = self
            .message
            .property(properties::ERROR_CONDITION, condition)
            .property(properties::STATUS_DESCRIPTION, description.into());
        self
    }

    /// Routes the response to the request's reply address and correlates it
    /// with the request's message id.
    pub fn reply_to(mut self, request: &Message) -> Self {
        self.message.to = request.reply_to.clone();
        self.message.correlation_id = request.message_id.clone();
        self
    }

    pub fn body_entry(mut self, key: &str, value: Value) -> Self {
        self.body.insert(key.to_owned(), value);
        self
    }

    /// Embeds a message list; peek-locked entries carry their lock token
    /// alongside the message.
    pub fn messages(mut self, messages: Vec<Message>) -> Self {
        let list = messages
            .into_iter()
            .map(|message| {
                let lock_token = message.lock_token();
                let mut entry = Map::new();
                entry.insert(
                    properties::MESSAGE.to_owned(),
                    serde_json::to_value(&message).unwrap_or(Value::Null),
                );
                if let Some(token) = lock_token {
                    entry.insert(properties::LOCK_TOKEN.to_owned(), json!(token.to_string()));
                }
                Value::Object(entry)
            })
            .collect::<Vec<_>>();
        self.body.insert(properties::MESSAGES.to_owned(), Value::Array(list));
        self
    }

    pub fn build(mut self) -> Message {
        if !self.body.is_empty() {
            self.message.value = Some(Value::Object(self.body));
        }
        self.message
    }
}

/// Request constructors for the four supported operations.
pub mod requests {
    use super::*;
    use crate::types::Addr;

    fn request(operation: &str, reply_to: impl Into<Addr>, body: Map<String, Value>) -> Message {
        let mut message = Message::with_value(Value::Object(body))
            .property(properties::OPERATION, operation)
            .reply_to(reply_to);
        message.message_id = Some(uuid::Uuid::new_v4().to_string().into());
        message
    }

    pub fn renew_lock(
        lock_token: LockToken,
        link_name: &str,
        reply_to: impl Into<Addr>,
    ) -> Message {
        let mut body = Map::new();
        body.insert(properties::LOCK_TOKENS.into(), json!([lock_token.to_string()]));
        request(operations::RENEW_LOCK, reply_to, body)
            .property(properties::ASSOCIATED_LINK_NAME, link_name)
    }

    pub fn receive_by_sequence_number(
        sequence_numbers: &[SequenceNo],
        settle_mode: SettleMode,
        link_name: Option<&str>,
        reply_to: impl Into<Addr>,
    ) -> Message {
        let mut body = Map::new();
        body.insert(properties::SEQUENCE_NUMBERS.into(), json!(sequence_numbers));
        body.insert(
            properties::RECEIVER_SETTLE_MODE.into(),
            json!(match settle_mode {
                SettleMode::SettleOnSend => 0u32,
                SettleMode::SettleOnReceive => 1,
                SettleMode::SettleOnDispose => 2,
            }),
        );
        let message = request(operations::RECEIVE_BY_SEQUENCE_NUMBER, reply_to, body);
        match link_name {
            Some(link_name) => message.property(properties::ASSOCIATED_LINK_NAME, link_name),
            None => message,
        }
    }

    pub fn update_disposition(
        lock_tokens: &[LockToken],
        disposition_status: &str,
        link_name: &str,
        reply_to: impl Into<Addr>,
    ) -> Message {
        let mut body = Map::new();
        body.insert(
            properties::LOCK_TOKENS.into(),
            json!(lock_tokens.iter().map(|t| t.to_string()).collect::<Vec<_>>()),
        );
        body.insert(properties::DISPOSITION_STATUS.into(), json!(disposition_status));
        request(operations::UPDATE_DISPOSITION, reply_to, body)
            .property(properties::ASSOCIATED_LINK_NAME, link_name)
    }

    pub fn peek_message(
        from_sequence_number: SequenceNo,
        message_count: usize,
        reply_to: impl Into<Addr>,
    ) -> Message {
        let mut body = Map::new();
        body.insert(properties::FROM_SEQUENCE_NUMBER.into(), json!(from_sequence_number));
        body.insert(properties::MESSAGE_COUNT.into(), json!(message_count));
        request(operations::PEEK_MESSAGE, reply_to, body)
    }
}

/// Dispatches one management request against `target` and delivers the
/// response through the subscription's reply consumer.
pub(crate) async fn handle_request(
    subscription: &Subscription,
    target: &Arc<MessageQueue>,
    request: Message,
) {
    let response = match request.property_str(properties::OPERATION) {
        None => {
            log::warn!("management request without an operation");
            argument_error(&request, "required `operation` parameter is missing")
        }
        Some(operation) => {
            log::trace!("process management operation {:?}", operation);
            match operation {
                operations::RENEW_LOCK => renew_lock(target, &request),
                operations::RECEIVE_BY_SEQUENCE_NUMBER => receive_by_sequence_number(target, &request),
                operations::UPDATE_DISPOSITION => update_disposition(target, &request),
                operations::PEEK_MESSAGE => peek_messages(target, &request),
                other => argument_error(&request, format!("The operation `{other}` is invalid.")),
            }
        }
    };
    deliver_response(subscription, response).await;
}

fn argument_error(request: &Message, description: impl Into<String>) -> Message {
    ResponseBuilder::failed(status::BAD_REQUEST)
        .error(conditions::ARGUMENT_ERROR, description)
        .reply_to(request)
        .build()
}

fn renew_lock(target: &Arc<MessageQueue>, request: &Message) -> Message {
    let (lock_tokens, link_name) = match (read_lock_tokens(request), read_link_name(request)) {
        (Some(tokens), Some(link)) if !tokens.is_empty() => (tokens, link),
        _ => return argument_error(request, "required parameters are missing"),
    };

    log::trace!("renewing lock {} in link {:?}", lock_tokens[0], link_name);

    match target.try_renew_lock(lock_tokens[0], &link_name) {
        Some(locked_until) => ResponseBuilder::success()
            .body_entry(properties::EXPIRATIONS, json!([locked_until]))
            .reply_to(request)
            .build(),
        None => ResponseBuilder::failed(status::FORBIDDEN)
            .error(
                conditions::MESSAGE_LOCK_LOST,
                "The lock supplied is invalid. Either the lock expired, or the message has \
                 already been removed from the queue, or was received by a different receiver \
                 instance.",
            )
            .reply_to(request)
            .build(),
    }
}

fn receive_by_sequence_number(target: &Arc<MessageQueue>, request: &Message) -> Message {
    let sequence_numbers = read_sequence_numbers(request);
    let settle_mode = read_u32(request, properties::RECEIVER_SETTLE_MODE).and_then(SettleMode::from_code);
    let link_name = read_link_name(request);

    let (sequence_numbers, settle_mode) = match (sequence_numbers, settle_mode) {
        (Some(seqs), Some(mode)) => (seqs, mode),
        _ => return argument_error(request, "required parameters are missing"),
    };
    if settle_mode == SettleMode::SettleOnReceive && link_name.is_none() {
        return argument_error(request, "required parameters are missing");
    }

    let deferred = target.deferred_messages(&sequence_numbers);
    let mut settled = Vec::with_capacity(deferred.len());
    for message in deferred {
        match settle_mode {
            SettleMode::SettleOnSend => {
                if target.try_remove_message(&message) {
                    settled.push(message);
                }
            }
            SettleMode::SettleOnReceive => {
                if let Some(link_name) = link_name.as_ref() {
                    if let Some(locked) = target.try_lock(&message, link_name) {
                        settled.push(locked);
                    }
                }
            }
            SettleMode::SettleOnDispose => {}
        }
    }

    if settled.len() != sequence_numbers.len() {
        return ResponseBuilder::failed(status::BAD_REQUEST)
            .error(
                conditions::MESSAGE_NOT_FOUND,
                "can not find messages or messages are not deferred",
            )
            .reply_to(request)
            .build();
    }

    ResponseBuilder::success().messages(settled).reply_to(request).build()
}

fn update_disposition(target: &Arc<MessageQueue>, request: &Message) -> Message {
    let lock_tokens = read_lock_tokens(request);
    let disposition = request
        .value
        .as_ref()
        .and_then(|v| v.get(properties::DISPOSITION_STATUS))
        .and_then(|v| v.as_str())
        .map(str::to_owned);
    let link_name = read_link_name(request);

    let (lock_tokens, disposition, link_name) = match (lock_tokens, disposition, link_name) {
        (Some(tokens), Some(disposition), Some(link)) => (tokens, disposition, link),
        _ => return argument_error(request, "required parameters are missing"),
    };

    type Disposition = fn(&MessageQueue, LockToken, &HolderId) -> bool;
    let apply: Disposition = match disposition.as_str() {
        disposition::COMPLETED => MessageQueue::try_remove,
        disposition::SUSPENDED => MessageQueue::try_deadletter,
        disposition::ABANDONED => MessageQueue::try_release,
        disposition::DEFERED => MessageQueue::try_defer,
        other => return argument_error(request, format!("unknown disposition status `{other}`")),
    };

    // parameters validated; each token is applied best-effort
    for lock_token in lock_tokens {
        if !apply(target, lock_token, &link_name) {
            log::trace!("disposition {:?} of lock {} failed", disposition, lock_token);
        }
    }

    ResponseBuilder::success().reply_to(request).build()
}

fn peek_messages(target: &Arc<MessageQueue>, request: &Message) -> Message {
    let from = request
        .value
        .as_ref()
        .and_then(|v| v.get(properties::FROM_SEQUENCE_NUMBER))
        .and_then(|v| v.as_u64());
    let count = read_u32(request, properties::MESSAGE_COUNT);

    let (from, count) = match (from, count) {
        (Some(from), Some(count)) => (from, count),
        _ => return argument_error(request, "required parameters are missing"),
    };

    let messages = target.peek(count as usize, Some(from));
    ResponseBuilder::success().messages(messages).reply_to(request).build()
}

async fn deliver_response(subscription: &Subscription, response: Message) {
    let to = match response.to.as_ref() {
        Some(to) => to.clone(),
        None => {
            log::error!("management response has no receiver address");
            return;
        }
    };

    match subscription.consumer(&to) {
        Some(consumer) if !consumer.is_drain() => {
            if !consumer.try_to_deliver(&response).await {
                log::error!("delivering management response to {:?} failed", to);
            }
        }
        _ => log::error!("management response receiver {:?} is absent or drained", to),
    }
}

fn read_link_name(request: &Message) -> Option<HolderId> {
    request.property_str(properties::ASSOCIATED_LINK_NAME).map(HolderId::from)
}

fn read_lock_tokens(request: &Message) -> Option<Vec<LockToken>> {
    let tokens = request
        .value
        .as_ref()?
        .get(properties::LOCK_TOKENS)?
        .as_array()?
        .iter()
        .map(|v| v.as_str().and_then(|s| s.parse::<LockToken>().ok()))
        .collect::<Option<Vec<_>>>()?;
    Some(tokens)
}

fn read_sequence_numbers(request: &Message) -> Option<Vec<SequenceNo>> {
    request
        .value
        .as_ref()?
        .get(properties::SEQUENCE_NUMBERS)?
        .as_array()?
        .iter()
        .map(|v| v.as_u64())
        .collect()
}

fn read_u32(request: &Message, key: &str) -> Option<u32> {
    request.value.as_ref()?.get(key)?.as_u64().and_then(|v| u32::try_from(v).ok())
}
