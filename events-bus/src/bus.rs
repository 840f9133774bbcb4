//! Publish/subscribe event bus
//!
//! Synchronous fan-out with per-subscriber deadlines and failure isolation,
//! plus a bounded asynchronous queue drained by a single background worker.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DeliveryFailure, EventBusError, Result};
use crate::event::Event;
use crate::handlers::EventHandler;

/// Event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Capacity of the asynchronous publish queue
    pub queue_capacity: usize,
    /// Deadline applied to each subscriber when an event carries no TTL
    pub default_handler_timeout_ms: u64,
}

impl EventBusConfig {
    pub fn default_handler_timeout(&self) -> Duration {
        Duration::from_millis(self.default_handler_timeout_ms)
    }
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            default_handler_timeout_ms: 30_000,
        }
    }
}

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    subscriber: String,
    handler: Arc<dyn EventHandler>,
}

struct BusInner {
    subscriptions: RwLock<HashMap<String, Vec<Subscription>>>,
    config: EventBusConfig,
}

struct AsyncQueue {
    sender: parking_lot::Mutex<Option<mpsc::Sender<Event>>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// In-process event bus. Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
    queue: Arc<AsyncQueue>,
}

impl EventBus {
    /// Create a bus and spawn its queue worker on the current Tokio runtime.
    pub fn new(config: EventBusConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let inner = Arc::new(BusInner {
            subscriptions: RwLock::new(HashMap::new()),
            config,
        });
        let worker = tokio::spawn(drain_queue(Arc::clone(&inner), receiver));

        Self {
            inner,
            queue: Arc::new(AsyncQueue {
                sender: parking_lot::Mutex::new(Some(sender)),
                worker: tokio::sync::Mutex::new(Some(worker)),
            }),
        }
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.inner.config
    }

    /// Register `handler` for every event of `event_type`.
    pub async fn subscribe(
        &self,
        event_type: impl Into<String>,
        subscriber: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let event_type = event_type.into();
        let subscription = Subscription {
            id: SubscriptionId::new(),
            subscriber: subscriber.into(),
            handler,
        };
        let id = subscription.id;

        debug!(
            event_type = %event_type,
            subscriber = %subscription.subscriber,
            subscription_id = %id,
            "Subscribed to event type"
        );

        let mut subscriptions = self.inner.subscriptions.write().await;
        subscriptions.entry(event_type).or_default().push(subscription);
        id
    }

    /// Remove one subscription. Returns `false` when it was not present.
    pub async fn unsubscribe(&self, event_type: &str, subscription_id: SubscriptionId) -> bool {
        let mut subscriptions = self.inner.subscriptions.write().await;
        let Some(list) = subscriptions.get_mut(event_type) else {
            return false;
        };

        let before = list.len();
        list.retain(|s| s.id != subscription_id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscriptions.remove(event_type);
        }

        if removed {
            debug!(event_type = %event_type, subscription_id = %subscription_id, "Unsubscribed");
        }
        removed
    }

    pub async fn subscriber_count(&self, event_type: &str) -> usize {
        self.inner
            .subscriptions
            .read()
            .await
            .get(event_type)
            .map_or(0, Vec::len)
    }

    /// Deliver `event` to every subscriber of its type and wait for all of them.
    ///
    /// Each subscriber runs in its own task bounded by the event's remaining
    /// TTL. Returns the number of subscribers reached, or
    /// [`EventBusError::DeliveryFailed`] listing every subscriber that failed,
    /// timed out or panicked. A failure never prevents delivery to the others.
    pub async fn publish(&self, event: Event) -> Result<usize> {
        self.inner.deliver(Arc::new(event)).await
    }

    /// Enqueue `event` for background delivery without waiting.
    ///
    /// Fails fast with [`EventBusError::QueueFull`] when the queue is saturated.
    pub fn publish_async(&self, event: Event) -> Result<()> {
        let guard = self.queue.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(EventBusError::Closed);
        };

        sender.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(event) => {
                warn!(event_type = %event.event_type, event_id = %event.id, "Event queue full");
                EventBusError::QueueFull {
                    capacity: sender.max_capacity(),
                }
            }
            mpsc::error::TrySendError::Closed(_) => EventBusError::Closed,
        })
    }

    /// Number of events waiting in the asynchronous queue.
    pub fn queued_events(&self) -> usize {
        self.queue
            .sender
            .lock()
            .as_ref()
            .map_or(0, |s| s.max_capacity() - s.capacity())
    }

    pub fn is_closed(&self) -> bool {
        self.queue.sender.lock().is_none()
    }

    /// Stop accepting queued events, let the worker drain what is already
    /// queued, and wait for it to finish.
    pub async fn close(&self) {
        let sender = self.queue.sender.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        if let Some(worker) = self.queue.worker.lock().await.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "Event bus worker ended abnormally");
            }
        }
        info!("Event bus closed");
    }
}

impl BusInner {
    async fn deliver(&self, event: Arc<Event>) -> Result<usize> {
        let deadline = match event.remaining_ttl() {
            Some(remaining) if remaining.is_zero() => {
                warn!(event_type = %event.event_type, event_id = %event.id, "Dropping expired event");
                return Err(EventBusError::Expired(event.id));
            }
            Some(remaining) => remaining,
            None => self.config.default_handler_timeout(),
        };

        // Snapshot under the read lock; handlers run without it.
        let subscribers: Vec<Subscription> = {
            let subscriptions = self.subscriptions.read().await;
            subscriptions.get(&event.event_type).cloned().unwrap_or_default()
        };

        if subscribers.is_empty() {
            debug!(event_type = %event.event_type, event_id = %event.id, "No subscribers for event");
            return Ok(0);
        }

        let total = subscribers.len();
        let deliveries = subscribers
            .into_iter()
            .map(|subscription| invoke_subscriber(subscription, Arc::clone(&event), deadline));
        let failures: Vec<DeliveryFailure> = futures::future::join_all(deliveries)
            .await
            .into_iter()
            .filter_map(std::result::Result::err)
            .collect();

        for failure in &failures {
            warn!(
                event_type = %event.event_type,
                event_id = %event.id,
                subscriber = %failure.subscriber,
                subscription_id = %failure.subscription_id,
                reason = %failure.reason,
                "Subscriber failed to handle event"
            );
        }

        if failures.is_empty() {
            debug!(event_type = %event.event_type, event_id = %event.id, delivered = total, "Event delivered");
            Ok(total)
        } else {
            Err(EventBusError::DeliveryFailed {
                event_type: event.event_type.clone(),
                total,
                failures,
            })
        }
    }
}

async fn invoke_subscriber(
    subscription: Subscription,
    event: Arc<Event>,
    deadline: Duration,
) -> std::result::Result<(), DeliveryFailure> {
    let handler = Arc::clone(&subscription.handler);
    let mut task = tokio::spawn(async move { handler.handle(&event).await });

    let reason = match tokio::time::timeout(deadline, &mut task).await {
        Ok(Ok(Ok(()))) => return Ok(()),
        Ok(Ok(Err(e))) => format!("{e:#}"),
        Ok(Err(join_error)) if join_error.is_panic() => "subscriber panicked".to_string(),
        Ok(Err(join_error)) => join_error.to_string(),
        Err(_) => {
            task.abort();
            format!("timed out after {}ms", deadline.as_millis())
        }
    };

    Err(DeliveryFailure {
        subscription_id: subscription.id,
        subscriber: subscription.subscriber,
        reason,
    })
}

async fn drain_queue(inner: Arc<BusInner>, mut receiver: mpsc::Receiver<Event>) {
    while let Some(event) = receiver.recv().await {
        let event_type = event.event_type.clone();
        if let Err(e) = inner.deliver(Arc::new(event)).await {
            warn!(event_type = %event_type, error = %e, "Queued event delivery failed");
        }
    }
    debug!("Event bus worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::event_handler;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: Arc<AtomicUsize>) -> Arc<dyn EventHandler> {
        event_handler(move |_event| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new(EventBusConfig::default());
        let delivered = bus.publish(Event::new("nobody.listens", "test", json!({}))).await.unwrap();
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_publish_only_reaches_matching_type() {
        let bus = EventBus::new(EventBusConfig::default());
        let hits = Arc::new(AtomicUsize::new(0));
        let misses = Arc::new(AtomicUsize::new(0));

        bus.subscribe("a", "s1", counting_handler(Arc::clone(&hits))).await;
        bus.subscribe("b", "s2", counting_handler(Arc::clone(&misses))).await;

        bus.publish(Event::new("a", "test", json!({}))).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(misses.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_single_handler() {
        let bus = EventBus::new(EventBusConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));

        let first = bus.subscribe("a", "s1", counting_handler(Arc::clone(&counter))).await;
        bus.subscribe("a", "s2", counting_handler(Arc::clone(&counter))).await;

        assert!(bus.unsubscribe("a", first).await);
        assert!(!bus.unsubscribe("a", first).await);
        assert_eq!(bus.subscriber_count("a").await, 1);

        bus.publish(Event::new("a", "test", json!({}))).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_bounded_by_ttl() {
        let bus = EventBus::new(EventBusConfig::default());
        let fast = Arc::new(AtomicUsize::new(0));

        bus.subscribe(
            "slow",
            "sleeper",
            event_handler(|_event| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }),
        )
        .await;
        bus.subscribe("slow", "fast", counting_handler(Arc::clone(&fast))).await;

        let event = Event::new("slow", "test", json!({})).with_ttl(Duration::from_millis(50));
        let err = bus.publish(event).await.unwrap_err();

        assert_eq!(err.delivery_failures().len(), 1);
        assert_eq!(err.delivery_failures()[0].subscriber, "sleeper");
        assert_eq!(fast.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_drains_queued_events() {
        let bus = EventBus::new(EventBusConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe("queued", "s1", counting_handler(Arc::clone(&counter))).await;

        for _ in 0..5 {
            bus.publish_async(Event::new("queued", "test", json!({}))).unwrap();
        }
        bus.close().await;

        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert!(bus.is_closed());
        assert!(matches!(
            bus.publish_async(Event::new("queued", "test", json!({}))),
            Err(EventBusError::Closed)
        ));
    }
}
