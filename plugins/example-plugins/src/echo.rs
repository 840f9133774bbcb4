//! Echo plugin
//!
//! Reflects whatever it receives: HTTP bodies, data payloads, `echo.ping`
//! events (answered with `echo.pong`) and `echo` broker requests.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use events_bus::message_handler;
use parking_lot::RwLock;
use plugin_runtime_core::{
    Capability, DataCapability, Event, EventCapability, HttpCapability, HttpRequest, HttpResponse, HttpRoute,
    Plugin, PluginContext, PluginDescriptor, PluginResult, PluginRuntimeError, PluginTransport,
};
use serde_json::json;
use tracing::debug;

pub const ECHO_ID: &str = "echo";
pub const PING_EVENT: &str = "echo.ping";
pub const PONG_EVENT: &str = "echo.pong";
pub const ECHO_MESSAGE: &str = "echo";

#[derive(Default)]
pub struct EchoPlugin {
    transport: RwLock<Option<PluginTransport>>,
    echoed: AtomicU64,
}

impl EchoPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn descriptor() -> PluginDescriptor {
        PluginDescriptor::new(ECHO_ID, "Echo", "1.0.0")
            .with_description("Reflects requests, data and ping events")
            .with_author("Plugin Host")
            .with_category("diagnostics")
            .with_tag("demo")
            .with_capability(Capability::Http)
            .with_capability(Capability::Data)
            .with_capability(Capability::Event)
    }

    /// Number of payloads reflected so far
    pub fn echoed(&self) -> u64 {
        self.echoed.load(Ordering::Relaxed)
    }

    fn transport(&self) -> PluginResult<PluginTransport> {
        self.transport
            .read()
            .clone()
            .ok_or_else(|| PluginRuntimeError::with_context("plugin has no context yet", ECHO_ID))
    }
}

#[async_trait]
impl Plugin for EchoPlugin {
    async fn initialize(&self, ctx: &PluginContext) -> PluginResult<()> {
        *self.transport.write() = Some(ctx.transport().clone());
        Ok(())
    }

    async fn start(&self) -> PluginResult<()> {
        let transport = self.transport()?;
        transport
            .serve(
                ECHO_MESSAGE,
                message_handler(|message| async move {
                    let payload = message.payload.clone();
                    Ok::<_, anyhow::Error>(Some(message.reply(payload)))
                }),
            )
            .await?;
        Ok(())
    }

    async fn stop(&self) -> PluginResult<()> {
        let transport = self.transport()?;
        transport.withdraw(ECHO_MESSAGE).await;
        Ok(())
    }

    async fn cleanup(&self) -> PluginResult<()> {
        self.transport.write().take();
        Ok(())
    }

    fn http(&self) -> Option<&dyn HttpCapability> {
        Some(self)
    }

    fn events(&self) -> Option<&dyn EventCapability> {
        Some(self)
    }

    fn data(&self) -> Option<&dyn DataCapability> {
        Some(self)
    }
}

#[async_trait]
impl HttpCapability for EchoPlugin {
    fn routes(&self) -> Vec<HttpRoute> {
        vec![HttpRoute::new("GET", "/echo"), HttpRoute::new("POST", "/echo")]
    }

    async fn handle_request(&self, request: HttpRequest) -> PluginResult<HttpResponse> {
        let response = match (request.method.as_str(), request.path.as_str()) {
            ("POST", "/echo") => HttpResponse::ok(request.body),
            ("GET", "/echo") => HttpResponse::ok(json!({ "query": request.query })),
            _ => return Ok(HttpResponse::not_found()),
        };
        self.echoed.fetch_add(1, Ordering::Relaxed);
        Ok(response)
    }
}

#[async_trait]
impl EventCapability for EchoPlugin {
    fn subscriptions(&self) -> Vec<String> {
        vec![PING_EVENT.to_string()]
    }

    async fn on_event(&self, event: &Event) -> PluginResult<()> {
        debug!(event_id = %event.id, source = %event.source, "Echo received ping");
        let transport = self.transport()?;
        let pong = transport.event(PONG_EVENT, event.payload.clone()).with_target(event.source.clone());
        transport.publish_async(pong)?;
        self.echoed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl DataCapability for EchoPlugin {
    async fn process(&self, input: serde_json::Value) -> PluginResult<serde_json::Value> {
        self.echoed.fetch_add(1, Ordering::Relaxed);
        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use events_bus::{event_handler, Message};
    use plugin_runtime_core::{PluginConfig, PluginRuntime, RuntimeConfig};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn started(dir: &tempfile::TempDir) -> (PluginRuntime, Arc<EchoPlugin>) {
        let mut config = RuntimeConfig::default();
        config.lifecycle.data_root = dir.path().join("data");
        config.lifecycle.temp_root = dir.path().join("tmp");
        let runtime = PluginRuntime::new(config);

        let echo = Arc::new(EchoPlugin::new());
        runtime.register_plugin(EchoPlugin::descriptor(), echo.clone()).await.unwrap();
        runtime.initialize(ECHO_ID, PluginConfig::new()).await.unwrap();
        runtime.start(ECHO_ID).await.unwrap();
        (runtime, echo)
    }

    #[tokio::test]
    async fn test_http_and_data_are_reflected() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, echo) = started(&dir).await;

        let response = runtime
            .handle_http(ECHO_ID, HttpRequest::new("POST", "/echo").with_body(json!({ "a": 1 })))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, json!({ "a": 1 }));

        let missing = runtime.handle_http(ECHO_ID, HttpRequest::new("GET", "/nope")).await.unwrap();
        assert_eq!(missing.status, 404);

        assert_eq!(runtime.process_data(ECHO_ID, json!([1, 2])).await.unwrap(), json!([1, 2]));
        assert_eq!(echo.echoed(), 2);
    }

    #[tokio::test]
    async fn test_broker_requests_are_answered_while_started() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, _echo) = started(&dir).await;

        let request = Message::new(ECHO_MESSAGE, "tester", ECHO_ID, json!("hello"));
        let reply = runtime
            .send_request(request.clone(), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(reply.payload, json!("hello"));

        runtime.stop(ECHO_ID).await.unwrap();
        assert!(runtime
            .send_request(request, Some(Duration::from_millis(50)))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_ping_is_answered_with_pong() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, _echo) = started(&dir).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        runtime
            .subscribe(
                PONG_EVENT,
                "tester",
                event_handler(move |event| {
                    let tx = tx.clone();
                    async move {
                        tx.send(event)?;
                        Ok::<(), anyhow::Error>(())
                    }
                }),
            )
            .await;

        let delivered = runtime
            .publish(Event::new(PING_EVENT, "tester", json!({ "n": 1 })))
            .await
            .unwrap();
        assert_eq!(delivered, 1);

        let pong = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pong.source, ECHO_ID);
        assert_eq!(pong.target.as_deref(), Some("tester"));
        assert_eq!(pong.payload, json!({ "n": 1 }));
    }
}
