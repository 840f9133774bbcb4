// Event and message envelopes carried by the bus and the broker
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Advisory priority. Stored and forwarded, never used for ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Undirected, typed fan-out notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type: String,
    pub source: String,
    pub target: Option<String>,
    pub payload: serde_json::Value,
    pub priority: EventPriority,
    /// Time-to-live in milliseconds; `0` means "use the bus default".
    pub ttl_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            source: source.into(),
            target: None,
            payload,
            priority: EventPriority::Normal,
            ttl_ms: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_ms > 0).then(|| Duration::from_millis(self.ttl_ms))
    }

    /// Portion of the TTL left, measured from the event's creation time.
    ///
    /// `None` when the event carries no TTL, `Some(Duration::ZERO)` once it
    /// has expired.
    pub fn remaining_ttl(&self) -> Option<Duration> {
        let ttl = self.ttl()?;
        let age = (Utc::now() - self.timestamp).to_std().unwrap_or(Duration::ZERO);
        Some(ttl.saturating_sub(age))
    }
}

/// Directed, typed payload that may expect a correlated reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub message_type: String,
    pub from: String,
    pub to: String,
    pub payload: serde_json::Value,
    pub correlation_id: Option<Uuid>,
    pub reply_to: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(
        message_type: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type: message_type.into(),
            from: from.into(),
            to: to.into(),
            payload,
            correlation_id: None,
            reply_to: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn is_reply(&self) -> bool {
        self.correlation_id.is_some()
    }

    /// Build a reply to this message. The broker fills in the final
    /// addressing from `reply_to` when it routes the reply.
    pub fn reply(&self, payload: serde_json::Value) -> Message {
        Message {
            id: Uuid::new_v4(),
            message_type: format!("{}.reply", self.message_type),
            from: self.to.clone(),
            to: self.reply_to.clone().unwrap_or_else(|| self.from.clone()),
            payload,
            correlation_id: Some(self.id),
            reply_to: None,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_without_ttl_has_no_deadline() {
        let event = Event::new("plugin.started", "p1", json!({}));
        assert_eq!(event.ttl(), None);
        assert_eq!(event.remaining_ttl(), None);
    }

    #[test]
    fn test_expired_event_has_zero_remaining_ttl() {
        let mut event = Event::new("plugin.started", "p1", json!({})).with_ttl(Duration::from_millis(10));
        event.timestamp = Utc::now() - chrono::Duration::seconds(5);
        assert_eq!(event.remaining_ttl(), Some(Duration::ZERO));
    }

    #[test]
    fn test_reply_correlates_to_original() {
        let request = Message::new("echo", "caller", "echo-plugin", json!({"n": 1})).with_reply_to("broker.reply");
        let reply = request.reply(json!({"n": 1}));

        assert_eq!(reply.correlation_id, Some(request.id));
        assert_eq!(reply.to, "broker.reply");
        assert_eq!(reply.from, "echo-plugin");
        assert_eq!(reply.message_type, "echo.reply");
        assert!(reply.is_reply());
    }
}
