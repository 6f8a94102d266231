// apps/flow-kernel/src/store/memory.rs
// Purpose: In-memory execution store for development and tests.
// Architecture: Persistence Layer
// Dependencies: DashMap

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::{apply_update, check_transition, passes_filter, ExecutionStore, TransitionUpdate};
use crate::error::EngineError;
use crate::models::{
    AgentMessage, ExecutionContext, ExecutionFilter, ExecutionStatus, NodeResult, StoreMetrics,
};

#[derive(Default)]
pub struct MemoryStore {
    executions: DashMap<Uuid, ExecutionContext>,
    // BTreeMap keeps results in (node_id, iteration) order
    node_results: DashMap<Uuid, BTreeMap<(String, u32), NodeResult>>,
    messages: DashMap<Uuid, Vec<AgentMessage>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create_execution(&self, ctx: &ExecutionContext) -> Result<(), EngineError> {
        self.executions.insert(ctx.execution_id, ctx.clone());
        Ok(())
    }

    async fn transition(
        &self,
        execution_id: Uuid,
        new_status: ExecutionStatus,
        update: TransitionUpdate,
    ) -> Result<ExecutionContext, EngineError> {
        let mut entry = self
            .executions
            .get_mut(&execution_id)
            .ok_or(EngineError::NotFound)?;
        check_transition(entry.status, new_status)?;
        apply_update(&mut entry, new_status, update);
        Ok(entry.clone())
    }

    async fn upsert_node_result(&self, result: &NodeResult) -> Result<(), EngineError> {
        let mut rows = self.node_results.entry(result.execution_id).or_default();
        let key = (result.node_id.clone(), result.iteration);
        match rows.get(&key) {
            // attempts only increase; a stale replay is a no-op
            Some(existing) if existing.attempts > result.attempts => Ok(()),
            _ => {
                rows.insert(key, result.clone());
                Ok(())
            }
        }
    }

    async fn append_message(&self, message: &AgentMessage) -> Result<(), EngineError> {
        self.messages
            .entry(message.execution_id)
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn get_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionContext>, EngineError> {
        Ok(self.executions.get(&execution_id).map(|e| e.clone()))
    }

    async fn list_executions(
        &self,
        tenant_id: &str,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionContext>, EngineError> {
        let mut out: Vec<ExecutionContext> = self
            .executions
            .iter()
            .filter(|e| passes_filter(e.value(), tenant_id, filter))
            .map(|e| e.clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let out = out
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(out)
    }

    async fn node_results(&self, execution_id: Uuid) -> Result<Vec<NodeResult>, EngineError> {
        Ok(self
            .node_results
            .get(&execution_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn messages(&self, execution_id: Uuid) -> Result<Vec<AgentMessage>, EngineError> {
        Ok(self
            .messages
            .get(&execution_id)
            .map(|m| m.clone())
            .unwrap_or_default())
    }

    async fn metrics(&self, tenant_id: &str) -> Result<StoreMetrics, EngineError> {
        let mut metrics = StoreMetrics::default();
        for entry in self.executions.iter() {
            if entry.tenant_id != tenant_id {
                continue;
            }
            metrics.total_executions += 1;
            let status = serde_json::to_value(entry.status)
                .expect("status serializes")
                .as_str()
                .expect("status is a string")
                .to_string();
            *metrics.by_status.entry(status).or_default() += 1;
            if let Some(rows) = self.node_results.get(&entry.execution_id) {
                metrics.total_cost_usd += rows
                    .values()
                    .filter_map(|r| r.cost_usd)
                    .sum::<f64>();
            }
        }
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn ctx(tenant: &str) -> ExecutionContext {
        ExecutionContext::new("flow", tenant, json!({"x": 1}))
    }

    fn node_result(execution_id: Uuid, node_id: &str, attempts: u32) -> NodeResult {
        NodeResult {
            execution_id,
            node_id: node_id.into(),
            iteration: 0,
            status: crate::models::NodeStatus::Succeeded,
            input: json!({}),
            output: Some(json!({"attempts": attempts})),
            error: None,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            attempts,
            cost_usd: Some(0.25),
        }
    }

    #[tokio::test]
    async fn transitions_follow_the_table() {
        let store = MemoryStore::new();
        let ctx = ctx("acme");
        let id = ctx.execution_id;
        store.create_execution(&ctx).await.unwrap();

        // pending cannot complete directly
        assert!(matches!(
            store
                .transition(id, ExecutionStatus::Succeeded, TransitionUpdate::default())
                .await,
            Err(EngineError::IllegalTransition { .. })
        ));

        store
            .transition(id, ExecutionStatus::Running, TransitionUpdate::started_now())
            .await
            .unwrap();
        let done = store
            .transition(
                id,
                ExecutionStatus::Succeeded,
                TransitionUpdate::completed(Some(json!({"ok": true})), None),
            )
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Succeeded);
        assert!(done.completed_at.is_some());

        // terminals are absorbing
        assert!(matches!(
            store
                .transition(id, ExecutionStatus::Cancelled, TransitionUpdate::default())
                .await,
            Err(EngineError::AlreadyTerminal)
        ));
    }

    #[tokio::test]
    async fn node_result_upsert_is_idempotent_and_monotonic() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();

        store
            .upsert_node_result(&node_result(id, "a", 2))
            .await
            .unwrap();
        // replay with fewer attempts is a no-op
        store
            .upsert_node_result(&node_result(id, "a", 1))
            .await
            .unwrap();
        let rows = store.node_results(id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].attempts, 2);

        // same key overwrites, distinct iteration is a new row
        let mut iter1 = node_result(id, "a", 1);
        iter1.iteration = 1;
        store.upsert_node_result(&iter1).await.unwrap();
        assert_eq!(store.node_results(id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn messages_keep_append_order() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        for (from, to) in [("a", "b"), ("b", "c"), ("c", "d")] {
            store
                .append_message(&AgentMessage::new(id, from, to, json!({})))
                .await
                .unwrap();
        }
        let msgs = store.messages(id).await.unwrap();
        let edges: Vec<(String, String)> = msgs
            .iter()
            .map(|m| (m.from_node.clone(), m.to_node.clone()))
            .collect();
        assert_eq!(
            edges,
            vec![
                ("a".into(), "b".into()),
                ("b".into(), "c".into()),
                ("c".into(), "d".into())
            ]
        );
    }

    #[tokio::test]
    async fn listing_is_tenant_scoped_and_filtered() {
        let store = MemoryStore::new();
        let mine = ctx("acme");
        let theirs = ctx("globex");
        store.create_execution(&mine).await.unwrap();
        store.create_execution(&theirs).await.unwrap();

        let listed = store
            .list_executions("acme", &ExecutionFilter::default())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].tenant_id, "acme");

        let running_only = store
            .list_executions(
                "acme",
                &ExecutionFilter {
                    status: Some(ExecutionStatus::Running),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(running_only.is_empty());

        let limited = store
            .list_executions(
                "acme",
                &ExecutionFilter {
                    limit: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(limited.is_empty());
    }

    #[tokio::test]
    async fn metrics_aggregate_per_tenant() {
        let store = MemoryStore::new();
        let a = ctx("acme");
        let b = ctx("acme");
        let other = ctx("globex");
        for c in [&a, &b, &other] {
            store.create_execution(c).await.unwrap();
        }
        store
            .upsert_node_result(&node_result(a.execution_id, "n", 1))
            .await
            .unwrap();
        store
            .upsert_node_result(&node_result(b.execution_id, "n", 1))
            .await
            .unwrap();

        let metrics = store.metrics("acme").await.unwrap();
        assert_eq!(metrics.total_executions, 2);
        assert_eq!(metrics.by_status["pending"], 2);
        assert!((metrics.total_cost_usd - 0.5).abs() < 1e-9);
    }
}
