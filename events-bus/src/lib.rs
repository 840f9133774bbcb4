//! In-process communication hub for the plugin runtime
//!
//! This crate provides the two messaging primitives plugins use to talk to
//! each other and to the host:
//! - **Event Bus**: typed publish/subscribe with synchronous, isolated-failure
//!   fan-out and a bounded fail-fast asynchronous queue
//! - **Message Broker**: directed messages with one handler per type and
//!   exactly-once request/reply correlation
//!
//! # Delivery Semantics
//!
//! - `publish` waits for every subscriber, each bounded by the event TTL, and
//!   reports every failing subscriber without cancelling the others
//! - `publish_async` never blocks; a saturated queue is reported as `QueueFull`
//! - `send_request` resolves with exactly one reply or a timeout; the reply
//!   slot is single-use, so duplicate replies cannot be observed
//! - Event priority is advisory metadata and does not affect ordering
//!
//! # Example
//!
//! ```rust,no_run
//! use events_bus::{message_handler, BrokerConfig, Message, MessageBroker};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn run() -> events_bus::Result<()> {
//! let broker = MessageBroker::new(BrokerConfig::default());
//! broker
//!     .register_handler("echo", message_handler(|m| async move { Ok(Some(m.reply(m.payload.clone()))) }))
//!     .await?;
//!
//! let reply = broker
//!     .send_request(Message::new("echo", "host", "echo-plugin", json!({"hello": "world"})), Duration::from_secs(1))
//!     .await?;
//! assert_eq!(reply.payload, json!({"hello": "world"}));
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod bus;
pub mod error;
pub mod event;
pub mod handlers;

pub use broker::*;
pub use bus::*;
pub use error::*;
pub use event::*;
pub use handlers::*;
