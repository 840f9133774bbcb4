//! Integration tests for the communication hub
//!
//! Covers the delivery guarantees plugins rely on:
//! - request/reply correlation through the broker
//! - isolated-failure fan-out on the event bus
//! - fail-fast behaviour of the asynchronous queue

use events_bus::*;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

fn echo_handler() -> Arc<dyn MessageHandler> {
    message_handler(|m| async move {
        let payload = m.payload.clone();
        Ok(Some(m.reply(payload)))
    })
}

#[tokio::test]
async fn test_echo_request_reply_is_correlated() {
    let broker = MessageBroker::new(BrokerConfig::default());
    let seen = Arc::new(parking_lot::Mutex::new(None));
    let seen_by_handler = Arc::clone(&seen);
    broker
        .register_handler(
            "echo",
            message_handler(move |m| {
                *seen_by_handler.lock() = Some(m.id);
                async move {
                    let payload = m.payload.clone();
                    Ok(Some(m.reply(payload)))
                }
            }),
        )
        .await
        .unwrap();

    let request = Message::new("echo", "caller", "echo-plugin", json!({"value": 42}));
    let reply = broker.send_request(request, Duration::from_secs(2)).await.unwrap();

    let request_id = (*seen.lock()).expect("handler must see the request");
    assert_eq!(reply.correlation_id, Some(request_id));
    assert_eq!(reply.payload, json!({"value": 42}));
    assert_eq!(reply.to, broker.config().reply_address);
    assert_eq!(reply.from, "echo-plugin");
    assert_ne!(request_id, reply.id);
    assert_eq!(broker.pending_requests(), 0);
}

#[tokio::test]
async fn test_failing_handler_surfaces_as_timeout() {
    let broker = MessageBroker::new(BrokerConfig::default());
    broker
        .register_handler("broken", message_handler(|_m| async { Err::<Option<Message>, _>(anyhow::anyhow!("handler exploded")) }))
        .await
        .unwrap();

    let err = broker
        .send_request(Message::new("broken", "caller", "p", json!({})), Duration::from_millis(100))
        .await
        .unwrap_err();

    assert!(matches!(err, EventBusError::RequestTimeout { timeout_ms: 100, .. }));
    assert_eq!(broker.pending_requests(), 0);
}

struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_timed_out_request_aborts_its_handler() {
    let broker = MessageBroker::new(BrokerConfig::default());
    let dropped = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&dropped);
    broker
        .register_handler(
            "stall",
            message_handler(move |_m| {
                let guard = SetOnDrop(Arc::clone(&flag));
                async move {
                    let _guard = guard;
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(None)
                }
            }),
        )
        .await
        .unwrap();

    let err = broker
        .send_request(Message::new("stall", "caller", "p", json!({})), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, EventBusError::RequestTimeout { .. }));

    tokio::time::timeout(Duration::from_secs(2), async {
        while !dropped.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("handler should be aborted after the request times out");
    assert_eq!(broker.pending_requests(), 0);
}

#[tokio::test]
async fn test_request_to_unknown_type_times_out() {
    let broker = MessageBroker::new(BrokerConfig::default());
    let err = broker
        .send_request(Message::new("nobody", "caller", "p", json!({})), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, EventBusError::RequestTimeout { .. }));
}

#[tokio::test]
async fn test_reply_routed_to_type_handler_when_not_pending() {
    let broker = MessageBroker::new(BrokerConfig::default());
    let received = Arc::new(AtomicUsize::new(0));

    broker.register_handler("echo", echo_handler()).await.unwrap();
    let counter = Arc::clone(&received);
    broker
        .register_handler(
            "echo.reply",
            message_handler(move |m| {
                let counter = Arc::clone(&counter);
                async move {
                    assert!(m.correlation_id.is_some());
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
            }),
        )
        .await
        .unwrap();

    let message = Message::new("echo", "plugin-a", "plugin-b", json!({})).with_reply_to("plugin-a");
    broker.send_message(message).await.unwrap();

    assert_eq!(received.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_publish_isolates_single_failing_subscriber() {
    let bus = EventBus::new(EventBusConfig::default());
    let delivered = Arc::new(AtomicUsize::new(0));

    for i in 0..4 {
        let counter = Arc::clone(&delivered);
        bus.subscribe(
            "plugin.tick",
            format!("ok-{i}"),
            event_handler(move |_e| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await;
    }
    bus.subscribe(
        "plugin.tick",
        "failing",
        event_handler(|_e| async { Err::<(), _>(anyhow::anyhow!("subscriber refused event")) }),
    )
    .await;

    let err = bus
        .publish(Event::new("plugin.tick", "test", json!({})))
        .await
        .unwrap_err();

    assert_eq!(delivered.load(Ordering::SeqCst), 4);
    match err {
        EventBusError::DeliveryFailed { total, failures, .. } => {
            assert_eq!(total, 5);
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].subscriber, "failing");
            assert!(failures[0].reason.contains("refused"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

async fn misbehave(_event: Event) -> anyhow::Result<()> {
    panic!("misbehaving extension")
}

#[tokio::test]
async fn test_panicking_subscriber_is_isolated() {
    let bus = EventBus::new(EventBusConfig::default());
    let delivered = Arc::new(AtomicUsize::new(0));

    bus.subscribe(
        "boom",
        "panicker",
        event_handler(misbehave),
    )
    .await;
    let counter = Arc::clone(&delivered);
    bus.subscribe(
        "boom",
        "survivor",
        event_handler(move |_e| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    )
    .await;

    let err = bus.publish(Event::new("boom", "test", json!({}))).await.unwrap_err();

    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    assert_eq!(err.delivery_failures().len(), 1);
    assert_eq!(err.delivery_failures()[0].reason, "subscriber panicked");
}

#[tokio::test]
async fn test_publish_async_fails_fast_when_queue_full() {
    let bus = EventBus::new(EventBusConfig {
        queue_capacity: 1,
        ..EventBusConfig::default()
    });
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let (started_tx, release_rx) = (Arc::clone(&started), Arc::clone(&release));
    bus.subscribe(
        "slow",
        "blocker",
        event_handler(move |_e| {
            let (started, release) = (Arc::clone(&started_tx), Arc::clone(&release_rx));
            async move {
                started.notify_one();
                release.notified().await;
                Ok(())
            }
        }),
    )
    .await;

    // First event occupies the worker, second fills the queue.
    bus.publish_async(Event::new("slow", "test", json!({"n": 1}))).unwrap();
    started.notified().await;
    bus.publish_async(Event::new("slow", "test", json!({"n": 2}))).unwrap();

    let err = bus
        .publish_async(Event::new("slow", "test", json!({"n": 3})))
        .unwrap_err();
    assert!(matches!(err, EventBusError::QueueFull { capacity: 1 }));

    release.notify_one();
    started.notified().await;
    release.notify_one();
    bus.close().await;
}

#[tokio::test]
async fn test_priority_does_not_reorder_delivery() {
    let bus = EventBus::new(EventBusConfig::default());
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let log = Arc::clone(&seen);
    bus.subscribe(
        "ordered",
        "recorder",
        event_handler(move |e| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(e.payload["n"].as_i64().unwrap_or_default());
                Ok(())
            }
        }),
    )
    .await;

    bus.publish_async(Event::new("ordered", "t", json!({"n": 1})).with_priority(EventPriority::Low))
        .unwrap();
    bus.publish_async(Event::new("ordered", "t", json!({"n": 2})).with_priority(EventPriority::Critical))
        .unwrap();
    bus.close().await;

    assert_eq!(*seen.lock(), vec![1, 2]);
}
