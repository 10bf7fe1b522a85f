#![deny(unsafe_code)]

//! In-memory message broker engine with Service Bus style delivery semantics:
//! topics, subscriptions, peek-lock delivery, lock renewal, deferral and
//! dead-lettering, without a backing database.
//!
//! The engine is transport-agnostic. A network layer attaches producers and
//! consumers through [`broker::Broker`], supplies a [`consumer::DeliverySink`]
//! per consuming link and feeds peer settlements back through the returned
//! [`consumer::Consumer`] handle.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rsbus::broker::Broker;
//! use rsbus::consumer::{Settlement, SettleMode};
//! use rsbus::message::Message;
//! use rsbus::settings::BrokerSettings;
//!
//! #[tokio::main]
//! async fn main() -> rsbus::Result<()> {
//!     let broker = Broker::new(BrokerSettings::load("rsbus")?);
//!
//!     let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!     let consumer = broker.attach_consumer(
//!         "orders/Subscriptions/sub1",
//!         "client-1",
//!         "link-1",
//!         SettleMode::SettleOnDispose,
//!         Arc::new(tx),
//!     )?;
//!     consumer.on_credit(32, false);
//!
//!     broker.publish("orders", Message::with_payload("hello"))?;
//!     if let Some(delivery) = rx.recv().await {
//!         consumer.settle(&delivery.delivery_tag, Settlement::Accepted);
//!     }
//!     Ok(())
//! }
//! ```

pub mod broker; // Topic assembly and attach surface
pub mod consumer; // Per-link delivery and settlement
pub mod expiration; // Lock expiry tracking and sweep
pub mod handler; // Address based subscription routing
pub mod management; // Protocol-level management operations
pub mod message; // Message value type and lock state machine
pub mod queue; // Authoritative per-subscription store
pub mod settings; // Configuration surface
pub mod subscription; // Dispatch loop and fairness
pub mod types; // Common aliases
pub mod utils; // Time and duration helpers

mod error;

pub use error::ServiceError;

/// Crate-level error type.
pub type Error = anyhow::Error;
/// Crate-level result type.
pub type Result<T> = anyhow::Result<T>;
