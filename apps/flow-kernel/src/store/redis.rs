// apps/flow-kernel/src/store/redis.rs
// Purpose: Redis-backed execution store for production deployments.
// Architecture: Persistence Layer
// Dependencies: redis (tokio-comp, connection-manager)

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use super::{apply_update, check_transition, passes_filter, ExecutionStore, TransitionUpdate};
use crate::error::EngineError;
use crate::models::{
    AgentMessage, ExecutionContext, ExecutionError, ExecutionFilter, ExecutionStatus, NodeResult,
    StoreMetrics,
};

/// Terminal executions linger for a day before Redis reclaims them.
const TERMINAL_TTL_SECS: i64 = 86_400;

const ACTIVE_SET: &str = "sys:active_execs";

pub struct RedisStore {
    conn: ConnectionManager,
}

fn store_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::StoreUnavailable(e.to_string())
}

fn state_key(id: Uuid) -> String {
    format!("exec:{id}:state")
}

fn nodes_key(id: Uuid) -> String {
    format!("exec:{id}:nodes")
}

fn messages_key(id: Uuid) -> String {
    format!("exec:{id}:messages")
}

fn tenant_key(tenant_id: &str) -> String {
    format!("tenant:{tenant_id}:execs")
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, EngineError> {
        let client = redis::Client::open(url).map_err(store_err)?;
        let conn = ConnectionManager::new(client).await.map_err(store_err)?;
        Ok(Self { conn })
    }

    async fn read_state(
        &self,
        conn: &mut ConnectionManager,
        id: Uuid,
    ) -> Result<Option<ExecutionContext>, EngineError> {
        let raw: Option<String> = conn.get(state_key(id)).await.map_err(store_err)?;
        match raw {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json).map(Some).map_err(store_err),
        }
    }

    async fn write_state(
        &self,
        conn: &mut ConnectionManager,
        ctx: &ExecutionContext,
    ) -> Result<(), EngineError> {
        let json = serde_json::to_string(ctx).map_err(store_err)?;
        conn.set::<_, _, ()>(state_key(ctx.execution_id), json)
            .await
            .map_err(store_err)
    }

    /// Executions found non-terminal on boot were interrupted by a crash of
    /// their coordinator; mark them failed so clients stop waiting on them.
    pub async fn rehydrate(&self) -> Result<usize, EngineError> {
        let mut conn = self.conn.clone();
        let active: Vec<String> = conn.smembers(ACTIVE_SET).await.map_err(store_err)?;
        let mut interrupted = 0usize;

        for raw_id in active {
            let Ok(id) = raw_id.parse::<Uuid>() else {
                let _: Result<(), _> = conn.srem(ACTIVE_SET, &raw_id).await;
                continue;
            };
            let Some(mut ctx) = self.read_state(&mut conn, id).await? else {
                let _: Result<(), _> = conn.srem(ACTIVE_SET, &raw_id).await;
                continue;
            };
            if !ctx.status.is_terminal() {
                tracing::warn!("rehydrating interrupted execution {id}");
                ctx.status = ExecutionStatus::Failed;
                ctx.error = Some(ExecutionError {
                    kind: "Interrupted".to_string(),
                    message: "engine restarted while the execution was in flight".to_string(),
                });
                ctx.completed_at = Some(chrono::Utc::now());
                self.write_state(&mut conn, &ctx).await?;
                interrupted += 1;
            }
            self.retire(&mut conn, id).await?;
        }

        Ok(interrupted)
    }

    async fn retire(&self, conn: &mut ConnectionManager, id: Uuid) -> Result<(), EngineError> {
        conn.srem::<_, _, ()>(ACTIVE_SET, id.to_string())
            .await
            .map_err(store_err)?;
        for key in [state_key(id), nodes_key(id), messages_key(id)] {
            conn.expire::<_, ()>(key, TERMINAL_TTL_SECS)
                .await
                .map_err(store_err)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for RedisStore {
    async fn create_execution(&self, ctx: &ExecutionContext) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        self.write_state(&mut conn, ctx).await?;
        conn.sadd::<_, _, ()>(ACTIVE_SET, ctx.execution_id.to_string())
            .await
            .map_err(store_err)?;
        conn.sadd::<_, _, ()>(tenant_key(&ctx.tenant_id), ctx.execution_id.to_string())
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn transition(
        &self,
        execution_id: Uuid,
        new_status: ExecutionStatus,
        update: TransitionUpdate,
    ) -> Result<ExecutionContext, EngineError> {
        let mut conn = self.conn.clone();
        let mut ctx = self
            .read_state(&mut conn, execution_id)
            .await?
            .ok_or(EngineError::NotFound)?;

        check_transition(ctx.status, new_status)?;
        apply_update(&mut ctx, new_status, update);
        self.write_state(&mut conn, &ctx).await?;

        if new_status.is_terminal() {
            self.retire(&mut conn, execution_id).await?;
        }
        Ok(ctx)
    }

    async fn upsert_node_result(&self, result: &NodeResult) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        let field = format!("{}:{}", result.node_id, result.iteration);

        // attempts only increase; a stale replay is a no-op
        let existing: Option<String> = conn
            .hget(nodes_key(result.execution_id), &field)
            .await
            .map_err(store_err)?;
        if let Some(raw) = existing {
            if let Ok(prev) = serde_json::from_str::<NodeResult>(&raw) {
                if prev.attempts > result.attempts {
                    return Ok(());
                }
            }
        }

        let json = serde_json::to_string(result).map_err(store_err)?;
        conn.hset::<_, _, _, ()>(nodes_key(result.execution_id), field, json)
            .await
            .map_err(store_err)
    }

    async fn append_message(&self, message: &AgentMessage) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(message).map_err(store_err)?;
        conn.rpush::<_, _, ()>(messages_key(message.execution_id), json)
            .await
            .map_err(store_err)
    }

    async fn get_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionContext>, EngineError> {
        let mut conn = self.conn.clone();
        self.read_state(&mut conn, execution_id).await
    }

    async fn list_executions(
        &self,
        tenant_id: &str,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionContext>, EngineError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(tenant_key(tenant_id))
            .await
            .map_err(store_err)?;

        let mut out = Vec::new();
        for raw_id in ids {
            let Ok(id) = raw_id.parse::<Uuid>() else { continue };
            // expired terminal rows drop out of the listing
            if let Some(ctx) = self.read_state(&mut conn, id).await? {
                if passes_filter(&ctx, tenant_id, filter) {
                    out.push(ctx);
                }
            }
        }

        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn node_results(&self, execution_id: Uuid) -> Result<Vec<NodeResult>, EngineError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .hvals(nodes_key(execution_id))
            .await
            .map_err(store_err)?;
        let mut rows: Vec<NodeResult> = raw
            .iter()
            .map(|json| serde_json::from_str(json).map_err(store_err))
            .collect::<Result<_, _>>()?;
        rows.sort_by(|a, b| {
            a.node_id
                .cmp(&b.node_id)
                .then(a.iteration.cmp(&b.iteration))
        });
        Ok(rows)
    }

    async fn messages(&self, execution_id: Uuid) -> Result<Vec<AgentMessage>, EngineError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .lrange(messages_key(execution_id), 0, -1)
            .await
            .map_err(store_err)?;
        raw.iter()
            .map(|json| serde_json::from_str(json).map_err(store_err))
            .collect()
    }

    async fn metrics(&self, tenant_id: &str) -> Result<StoreMetrics, EngineError> {
        let executions = self
            .list_executions(tenant_id, &ExecutionFilter::default())
            .await?;

        let mut metrics = StoreMetrics {
            total_executions: executions.len(),
            ..StoreMetrics::default()
        };
        for ctx in &executions {
            let status = serde_json::to_value(ctx.status)
                .map_err(store_err)?
                .as_str()
                .unwrap_or("unknown")
                .to_string();
            *metrics.by_status.entry(status).or_default() += 1;
            for row in self.node_results(ctx.execution_id).await? {
                if let Some(cost) = row.cost_usd {
                    metrics.total_cost_usd += cost;
                }
            }
        }
        Ok(metrics)
    }
}
