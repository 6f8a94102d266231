// apps/flow-kernel/src/store/mod.rs
// Purpose: Execution store contract. One trait, two backends, selected at boot.
// Architecture: Persistence Layer
// Dependencies: async-trait

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{
    AgentMessage, ExecutionContext, ExecutionError, ExecutionFilter, ExecutionStatus, NodeResult,
    StoreMetrics,
};

/// Fields set together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdate {
    pub output_data: Option<Value>,
    pub error: Option<ExecutionError>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TransitionUpdate {
    pub fn started_now() -> Self {
        Self {
            started_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn completed(output_data: Option<Value>, error: Option<ExecutionError>) -> Self {
        Self {
            output_data,
            error,
            started_at: None,
            completed_at: Some(Utc::now()),
        }
    }
}

/// Durable backend for execution state. Node results are keyed
/// `(execution_id, node_id, iteration)` and writes there are idempotent;
/// replaying a write is a no-op and attempts never decrease.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Persist a new context. The context must be in `pending` state.
    async fn create_execution(&self, ctx: &ExecutionContext) -> Result<(), EngineError>;

    /// Compare-and-set on status following the legal transition table.
    /// Returns the updated context.
    async fn transition(
        &self,
        execution_id: Uuid,
        new_status: ExecutionStatus,
        update: TransitionUpdate,
    ) -> Result<ExecutionContext, EngineError>;

    async fn upsert_node_result(&self, result: &NodeResult) -> Result<(), EngineError>;

    /// Messages are ordered by `created_at` within an execution.
    async fn append_message(&self, message: &AgentMessage) -> Result<(), EngineError>;

    async fn get_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionContext>, EngineError>;

    /// Always filtered by owner tenant; newest first.
    async fn list_executions(
        &self,
        tenant_id: &str,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionContext>, EngineError>;

    async fn node_results(&self, execution_id: Uuid) -> Result<Vec<NodeResult>, EngineError>;

    async fn messages(&self, execution_id: Uuid) -> Result<Vec<AgentMessage>, EngineError>;

    async fn metrics(&self, tenant_id: &str) -> Result<StoreMetrics, EngineError>;
}

/// Shared transition legality check.
fn check_transition(
    current: ExecutionStatus,
    next: ExecutionStatus,
) -> Result<(), EngineError> {
    if current.is_terminal() {
        return Err(EngineError::AlreadyTerminal);
    }
    if !current.can_transition(next) {
        return Err(EngineError::IllegalTransition {
            from: format!("{current:?}").to_lowercase(),
            to: format!("{next:?}").to_lowercase(),
        });
    }
    Ok(())
}

fn apply_update(ctx: &mut ExecutionContext, status: ExecutionStatus, update: TransitionUpdate) {
    ctx.status = status;
    if update.output_data.is_some() {
        ctx.output_data = update.output_data;
    }
    if update.error.is_some() {
        ctx.error = update.error;
    }
    if update.started_at.is_some() {
        ctx.started_at = update.started_at;
    }
    if update.completed_at.is_some() {
        ctx.completed_at = update.completed_at;
    }
}

fn passes_filter(ctx: &ExecutionContext, tenant_id: &str, filter: &ExecutionFilter) -> bool {
    ctx.tenant_id == tenant_id
        && filter.status.map(|s| ctx.status == s).unwrap_or(true)
        && filter
            .flow_id
            .as_deref()
            .map(|f| ctx.flow_id == f)
            .unwrap_or(true)
}
