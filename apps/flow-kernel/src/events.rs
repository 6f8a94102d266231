// apps/flow-kernel/src/events.rs
// Purpose: Typed execution events and the in-process fan-out bus.
// Architecture: Domain Event Layer
// Dependencies: Serde, Chrono, Uuid, Tokio broadcast

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    #[serde(rename = "execution.started")]
    ExecutionStarted,
    #[serde(rename = "execution.succeeded")]
    ExecutionSucceeded,
    #[serde(rename = "execution.failed")]
    ExecutionFailed,
    #[serde(rename = "execution.cancelled")]
    ExecutionCancelled,
    #[serde(rename = "node.started")]
    NodeStarted,
    #[serde(rename = "node.succeeded")]
    NodeSucceeded,
    #[serde(rename = "node.failed")]
    NodeFailed,
    #[serde(rename = "node.skipped")]
    NodeSkipped,
    #[serde(rename = "node.retrying")]
    NodeRetrying,
    #[serde(rename = "agent.probed")]
    AgentProbed,
    #[serde(rename = "agent.latency")]
    AgentLatency,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub id: Uuid,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl EngineEvent {
    pub fn execution(kind: EventKind, execution_id: Uuid, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            execution_id: Some(execution_id),
            node_id: None,
            agent_id: None,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn node(kind: EventKind, execution_id: Uuid, node_id: &str, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            execution_id: Some(execution_id),
            node_id: Some(node_id.to_string()),
            agent_id: None,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn agent(kind: EventKind, agent_id: &str, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            execution_id: None,
            node_id: None,
            agent_id: Some(agent_id.to_string()),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Broadcast fan-out to streaming, webhook and metrics subscribers.
/// Publishing never blocks and never fails the caller; slow subscribers
/// lag and drop, they do not stall the orchestrator.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_kind_serializes_dotted() {
        let s = serde_json::to_string(&EventKind::NodeRetrying).unwrap();
        assert_eq!(s, r#""node.retrying""#);
        let s = serde_json::to_string(&EventKind::ExecutionStarted).unwrap();
        assert_eq!(s, r#""execution.started""#);
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_fail() {
        let bus = EventBus::new(8);
        bus.publish(EngineEvent::agent(
            EventKind::AgentProbed,
            "echo",
            json!({"healthy": true}),
        ));
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let exec = Uuid::new_v4();
        bus.publish(EngineEvent::node(
            EventKind::NodeStarted,
            exec,
            "a",
            json!({}),
        ));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.kind, EventKind::NodeStarted);
        assert_eq!(got.execution_id, Some(exec));
        assert_eq!(got.node_id.as_deref(), Some("a"));
    }
}
