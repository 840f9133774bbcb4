//! Directed request/reply message broker
//!
//! One handler per message type. Replies are routed back through the broker;
//! a reply whose correlation id matches an outstanding request is handed to
//! that request's single-use reply slot instead of a type handler.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{EventBusError, Result};
use crate::event::Message;
use crate::handlers::MessageHandler;

/// What happens when a handler is registered for a type that already has one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationMode {
    /// Silently replace the previous handler (a warning is logged).
    #[default]
    Replace,
    /// Refuse with [`EventBusError::HandlerAlreadyRegistered`].
    Reject,
}

/// Message broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Internal address stamped into `reply_to` by `send_request`
    pub reply_address: String,
    pub registration_mode: RegistrationMode,
    /// Upper bound on reply-of-reply chains started by one message
    pub max_reply_hops: usize,
    pub default_request_timeout_ms: u64,
}

impl BrokerConfig {
    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_millis(self.default_request_timeout_ms)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            reply_address: "broker.reply".to_string(),
            registration_mode: RegistrationMode::Replace,
            max_reply_hops: 8,
            default_request_timeout_ms: 30_000,
        }
    }
}

type ReplySlot = oneshot::Sender<Message>;

struct BrokerInner {
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    pending: DashMap<Uuid, ReplySlot>,
    config: BrokerConfig,
}

/// Request/reply broker. Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct MessageBroker {
    inner: Arc<BrokerInner>,
}

/// Removes an outstanding reply slot and aborts its delivery task when the
/// waiting request goes away, whether it completed, timed out or was dropped
/// by its caller.
struct PendingGuard<'a> {
    request_id: Uuid,
    pending: &'a DashMap<Uuid, ReplySlot>,
    delivery: JoinHandle<()>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.delivery.abort();
        self.pending.remove(&self.request_id);
    }
}

impl MessageBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                handlers: RwLock::new(HashMap::new()),
                pending: DashMap::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Register the handler for `message_type`.
    ///
    /// Returns `true` when a previous handler was replaced.
    pub async fn register_handler(
        &self,
        message_type: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<bool> {
        let message_type = message_type.into();
        let mut handlers = self.inner.handlers.write().await;

        if handlers.contains_key(&message_type) {
            if self.inner.config.registration_mode == RegistrationMode::Reject {
                return Err(EventBusError::HandlerAlreadyRegistered(message_type));
            }
            warn!(message_type = %message_type, "Replacing existing message handler");
        }

        let replaced = handlers.insert(message_type.clone(), handler).is_some();
        debug!(message_type = %message_type, replaced, "Registered message handler");
        Ok(replaced)
    }

    pub async fn unregister_handler(&self, message_type: &str) -> bool {
        let removed = self.inner.handlers.write().await.remove(message_type).is_some();
        if removed {
            debug!(message_type = %message_type, "Unregistered message handler");
        }
        removed
    }

    pub async fn has_handler(&self, message_type: &str) -> bool {
        self.inner.handlers.read().await.contains_key(message_type)
    }

    /// Number of requests currently waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Deliver `message`, following any replies it produces.
    pub async fn send_message(&self, message: Message) -> Result<()> {
        self.inner.route(message).await
    }

    /// Send `request` and wait for its single reply.
    ///
    /// The broker assigns a fresh request id and points `reply_to` at its own
    /// reply address. Exactly one of {reply, timeout} resolves the call; a
    /// handler that fails produces no reply, so the caller sees
    /// [`EventBusError::RequestTimeout`]. Once the call resolves, or the
    /// returned future is dropped, the reply slot is freed and a handler
    /// still running for the request is aborted. Never retried.
    pub async fn send_request(&self, mut request: Message, timeout: Duration) -> Result<Message> {
        request.id = Uuid::new_v4();
        request.correlation_id = None;
        request.reply_to = Some(self.inner.config.reply_address.clone());

        let request_id = request.id;
        let message_type = request.message_type.clone();
        let (slot, reply) = oneshot::channel();
        self.inner.pending.insert(request_id, slot);

        let inner = Arc::clone(&self.inner);
        let delivery = tokio::spawn(async move {
            if let Err(e) = inner.route(request).await {
                warn!(
                    request_id = %request_id,
                    message_type = %message_type,
                    error = %e,
                    "Request delivery failed; no reply will be produced"
                );
            }
        });
        let _guard = PendingGuard {
            request_id,
            pending: &self.inner.pending,
            delivery,
        };

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(EventBusError::ReplySlotClosed(request_id)),
            Err(_) => Err(EventBusError::RequestTimeout {
                request_id,
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

impl BrokerInner {
    async fn route(&self, message: Message) -> Result<()> {
        let origin = message.id;
        let mut next = Some(message);
        let mut hops = 0usize;

        while let Some(message) = next.take() {
            if hops > self.config.max_reply_hops {
                return Err(EventBusError::ReplyLoop {
                    origin,
                    max_hops: self.config.max_reply_hops,
                });
            }
            next = self.dispatch(message).await?;
            hops += 1;
        }
        Ok(())
    }

    /// Deliver one message and return the re-addressed reply, if any.
    async fn dispatch(&self, message: Message) -> Result<Option<Message>> {
        if let Some(correlation_id) = message.correlation_id {
            if let Some((_, slot)) = self.pending.remove(&correlation_id) {
                if slot.send(message).is_err() {
                    debug!(correlation_id = %correlation_id, "Requester gone before reply arrived");
                }
                return Ok(None);
            }
        }

        let handler = self
            .handlers
            .read()
            .await
            .get(&message.message_type)
            .cloned()
            .ok_or_else(|| EventBusError::HandlerNotFound(message.message_type.clone()))?;

        let message_id = message.id;
        let message_type = message.message_type.clone();
        let responder = message.to.clone();
        let reply_to = message.reply_to.clone();

        let outcome = tokio::spawn(async move { handler.handle(message).await }).await;
        let reply = match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                return Err(EventBusError::HandlerFailed {
                    message_type,
                    reason: format!("{e:#}"),
                })
            }
            Err(join_error) => {
                let reason = if join_error.is_panic() {
                    "handler panicked".to_string()
                } else {
                    join_error.to_string()
                };
                return Err(EventBusError::HandlerFailed { message_type, reason });
            }
        };

        match (reply, reply_to) {
            (Some(mut reply), Some(reply_to)) => {
                reply.to = reply_to;
                reply.correlation_id = Some(message_id);
                if reply.from.is_empty() {
                    reply.from = responder;
                }
                Ok(Some(reply))
            }
            (Some(_), None) => {
                debug!(message_type = %message_type, "Discarding reply to a message without reply_to");
                Ok(None)
            }
            (None, _) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::message_handler;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_send_message_without_handler_fails() {
        let broker = MessageBroker::new(BrokerConfig::default());
        let err = broker
            .send_message(Message::new("missing", "a", "b", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, EventBusError::HandlerNotFound(t) if t == "missing"));
    }

    #[tokio::test]
    async fn test_reregistration_replaces_by_default() {
        let broker = MessageBroker::new(BrokerConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let first = message_handler(|_m| async { Ok(None) });
        let counter = Arc::clone(&calls);
        let second = message_handler(move |_m| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        });

        assert!(!broker.register_handler("t", first).await.unwrap());
        assert!(broker.register_handler("t", second).await.unwrap());

        broker.send_message(Message::new("t", "a", "b", json!({}))).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reject_mode_refuses_duplicate_registration() {
        let broker = MessageBroker::new(BrokerConfig {
            registration_mode: RegistrationMode::Reject,
            ..BrokerConfig::default()
        });

        broker.register_handler("t", message_handler(|_m| async { Ok(None) })).await.unwrap();
        let err = broker
            .register_handler("t", message_handler(|_m| async { Ok(None) }))
            .await
            .unwrap_err();
        assert!(matches!(err, EventBusError::HandlerAlreadyRegistered(_)));
    }

    #[tokio::test]
    async fn test_reply_loop_is_bounded() {
        let broker = MessageBroker::new(BrokerConfig {
            max_reply_hops: 3,
            ..BrokerConfig::default()
        });

        // Every reply asks for another reply addressed back to the same type.
        broker
            .register_handler(
                "ping",
                message_handler(|m| async move {
                    let mut reply = m.reply(json!({}));
                    reply.message_type = "ping".to_string();
                    reply.reply_to = Some("loop".to_string());
                    Ok(Some(reply))
                }),
            )
            .await
            .unwrap();

        let err = broker
            .send_message(Message::new("ping", "a", "b", json!({})).with_reply_to("loop"))
            .await
            .unwrap_err();
        assert!(matches!(err, EventBusError::ReplyLoop { max_hops: 3, .. }));
    }

    #[tokio::test]
    async fn test_dropped_request_frees_reply_slot() {
        let broker = MessageBroker::new(BrokerConfig::default());
        broker
            .register_handler(
                "never",
                message_handler(|_m| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(None)
                }),
            )
            .await
            .unwrap();

        let request = broker.send_request(
            Message::new("never", "a", "b", json!({})),
            Duration::from_secs(30),
        );
        let cancelled = tokio::time::timeout(Duration::from_millis(50), request).await;

        assert!(cancelled.is_err());
        assert_eq!(broker.pending_requests(), 0);
    }
}
