// apps/flow-kernel/src/models.rs
// Purpose: Core data model shared across catalog, store, orchestrator and proxy.
// Architecture: Shared Data Layer
// Dependencies: Serde, Chrono, Uuid

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

// === FLOW DEFINITION ===

/// A validated, immutable flow: a DAG of nodes with one entry point and at
/// least one exit point. Produced by the catalog, never constructed by hand
/// outside of tests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowDefinition {
    pub flow_id: String,
    pub version: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub entry_point: String,
    pub exit_points: Vec<String>,
    pub nodes: Vec<NodeDef>,
    /// None means system scope, visible to every tenant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl FlowDefinition {
    pub fn node(&self, node_id: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.id.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeDef {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// The six node shapes the orchestrator understands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeKind {
    Agent {
        agent_id: String,
        #[serde(default)]
        config: Value,
        /// Per-node dispatch timeout in seconds. Engine default applies when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_retries: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_error_node: Option<String>,
    },
    Decision {
        condition: String,
        #[serde(rename = "then")]
        then_node: String,
        #[serde(rename = "else")]
        else_node: String,
    },
    Loop {
        body: Vec<String>,
        until: String,
        max_iterations: u32,
    },
    Fork {
        branches: Vec<String>,
    },
    Join {
        sources: Vec<String>,
        strategy: MergeStrategy,
    },
    Output {},
}

impl NodeDef {
    pub fn on_error_node(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Agent { on_error_node, .. } => on_error_node.as_deref(),
            _ => None,
        }
    }

    pub fn is_agent(&self) -> bool {
        matches!(self.kind, NodeKind::Agent { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "expr")]
pub enum MergeStrategy {
    /// Resolve on the first succeeded source; losers are cancelled.
    FirstComplete,
    /// Resolve when every source is terminal; any failure fails the join.
    AllComplete,
    /// Resolve when every source is terminal; pick the succeeded source
    /// maximizing the expression evaluated over its output.
    BestBy(String),
}

// === AGENT REGISTRY ===

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Input,
    Processor,
    Output,
    Conditional,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentHealth {
    Unknown,
    Ready,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    /// Base URL of the agent service; `/health` and `/execute` hang off it.
    pub endpoint: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub agent_type: AgentType,
    #[serde(default)]
    pub version: String,
    /// None means system scope, visible to every tenant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_tenant_id: Option<String>,
    /// Bearer token injected on outbound calls to this agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default = "default_health")]
    pub health: AgentHealth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_at: Option<DateTime<Utc>>,
}

fn default_health() -> AgentHealth {
    AgentHealth::Unknown
}

/// What an agent's `GET /health` must return.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealthReport {
    pub agent_id: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub ready: bool,
    pub agent_type: AgentType,
}

// === EXECUTION STATE ===

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Legal transitions: pending -> running -> {succeeded, failed, cancelled}.
    /// Terminals are absorbing.
    pub fn can_transition(self, to: ExecutionStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

/// Error surfaced on a failed execution. Raw agent bodies are not exposed here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionError {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub flow_id: String,
    pub tenant_id: String,
    pub status: ExecutionStatus,
    pub input_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionContext {
    pub fn new(flow_id: &str, tenant_id: &str, input_data: Value) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            flow_id: flow_id.to_string(),
            tenant_id: tenant_id.to_string(),
            status: ExecutionStatus::Pending,
            input_data,
            output_data: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// One row per `(execution_id, node_id, iteration)`. Iteration is non-zero
/// only for nodes inside a loop body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub execution_id: Uuid,
    pub node_id: String,
    #[serde(default)]
    pub iteration: u32,
    pub status: NodeStatus,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    /// Populated from the agent response when present; never computed here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

/// Durable trace of one edge traversal: the payload `from_node` handed
/// to `to_node`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub message_id: Uuid,
    pub execution_id: Uuid,
    pub from_node: String,
    pub to_node: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl AgentMessage {
    pub fn new(execution_id: Uuid, from_node: &str, to_node: &str, payload: Value) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            execution_id,
            from_node: from_node.to_string(),
            to_node: to_node.to_string(),
            payload,
            created_at: Utc::now(),
        }
    }
}

// === SUBMISSION & LISTING ===

/// Per-submission overrides. Everything falls back to `EngineConfig`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Whole-execution deadline in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<u64>,
    /// Per-execution parallelism cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecutionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreMetrics {
    pub total_executions: usize,
    pub by_status: HashMap<String, usize>,
    pub total_cost_usd: f64,
}

// === AGENT WIRE CONTRACT ===

/// Body of `POST /execute` sent to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCallRequest {
    pub execution_id: Uuid,
    pub node_id: String,
    pub input: Value,
    pub config: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentCallStatus {
    Success,
    Error,
}

/// Body an agent must return from `POST /execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCallResponse {
    pub status: AgentCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub execution_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    /// Explicit scratch updates the agent wants carried through the execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}
