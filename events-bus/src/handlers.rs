// Handler seams for the event bus and the message broker
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use crate::event::{Event, Message};

/// Subscriber invoked for every event of the types it subscribed to.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Single active handler for one message type.
///
/// Returning `Ok(Some(reply))` asks the broker to route the reply back to the
/// inbound message's `reply_to` address.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> anyhow::Result<Option<Message>>;
}

struct FnEventHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnEventHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.f)(event.clone()).await
    }
}

struct FnMessageHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnMessageHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<Message>>> + Send,
{
    async fn handle(&self, message: Message) -> anyhow::Result<Option<Message>> {
        (self.f)(message).await
    }
}

/// Wrap an async closure as an [`EventHandler`].
pub fn event_handler<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnEventHandler { f })
}

/// Wrap an async closure as a [`MessageHandler`].
pub fn message_handler<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Message>>> + Send + 'static,
{
    Arc::new(FnMessageHandler { f })
}
