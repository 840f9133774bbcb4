use thiserror::Error;
use uuid::Uuid;

use crate::bus::SubscriptionId;

#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("Event queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Event bus is closed")]
    Closed,

    #[error("Event {0} expired before delivery")]
    Expired(Uuid),

    #[error("Delivery of '{event_type}' failed for {} of {total} subscribers", .failures.len())]
    DeliveryFailed {
        event_type: String,
        total: usize,
        failures: Vec<DeliveryFailure>,
    },

    #[error("No handler registered for message type '{0}'")]
    HandlerNotFound(String),

    #[error("A handler is already registered for message type '{0}'")]
    HandlerAlreadyRegistered(String),

    #[error("Message handler for '{message_type}' failed: {reason}")]
    HandlerFailed { message_type: String, reason: String },

    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout { request_id: Uuid, timeout_ms: u64 },

    #[error("Reply slot for request {0} closed without a reply")]
    ReplySlotClosed(Uuid),

    #[error("Reply chain started by message {origin} exceeded {max_hops} hops")]
    ReplyLoop { origin: Uuid, max_hops: usize },

    #[error("Internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}

/// One subscriber's failure inside an otherwise completed fan-out.
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub subscription_id: SubscriptionId,
    pub subscriber: String,
    pub reason: String,
}

impl EventBusError {
    /// Failures collected during a fan-out, empty for every other variant.
    pub fn delivery_failures(&self) -> &[DeliveryFailure] {
        match self {
            Self::DeliveryFailed { failures, .. } => failures,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, EventBusError>;
