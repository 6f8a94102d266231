// apps/flow-kernel/src/engine.rs
// Purpose: The engine handle. Owns catalog, registry, store, proxy and bus;
//          exposes the API the HTTP layer consumes.
// Architecture: Domain Logic Layer
// Dependencies: tokio, tokio-util, DashMap

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::FlowCatalog;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::models::{
    AgentMessage, AgentRecord, ExecutionContext, ExecutionFilter, ExecutionOptions, NodeResult,
    StoreMetrics,
};
use crate::orchestrator::Coordinator;
use crate::proxy::{AgentProxy, ProxyConfig};
use crate::registry::AgentRegistry;
use crate::store::ExecutionStore;

/// One engine per process. Everything hangs off this handle; nothing lives
/// in module-level state.
pub struct Engine {
    config: EngineConfig,
    catalog: Arc<FlowCatalog>,
    registry: Arc<AgentRegistry>,
    store: Arc<dyn ExecutionStore>,
    proxy: Arc<AgentProxy>,
    bus: EventBus,
    /// Keyed semaphore capping concurrent executions per tenant.
    tenant_gates: DashMap<String, Arc<Semaphore>>,
    cancellations: Arc<DashMap<Uuid, CancellationToken>>,
}

impl Engine {
    pub fn new(config: EngineConfig, store: Arc<dyn ExecutionStore>) -> Arc<Self> {
        let bus = EventBus::new(config.event_bus_capacity);
        let proxy = Arc::new(AgentProxy::new(
            ProxyConfig {
                concurrency: config.proxy_concurrency,
                queue: config.proxy_queue,
                response_size_cap: config.response_size_cap,
                breaker_threshold: config.breaker_threshold,
                breaker_open: config.breaker_open,
                ..ProxyConfig::default()
            },
            bus.clone(),
        ));
        let registry = Arc::new(AgentRegistry::new(proxy.clone(), bus.clone()));

        Arc::new(Self {
            config,
            catalog: Arc::new(FlowCatalog::new()),
            registry,
            store,
            proxy,
            bus,
            tenant_gates: DashMap::new(),
            cancellations: Arc::new(DashMap::new()),
        })
    }

    pub fn catalog(&self) -> &FlowCatalog {
        &self.catalog
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Spawn the background health sweeper for registered agents.
    pub fn start_sweeper(&self) -> tokio::task::JoinHandle<()> {
        self.registry.spawn_sweeper(self.config.sweep_interval)
    }

    fn tenant_gate(&self, tenant_id: &str) -> Arc<Semaphore> {
        self.tenant_gates
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.tenant_parallelism)))
            .clone()
    }

    // === EXECUTIONS ===

    /// Validate, persist and launch an execution. Returns immediately with
    /// the execution id; the coordinator runs in the background, queued
    /// behind the tenant's concurrency gate.
    pub async fn submit(
        self: &Arc<Self>,
        flow_id: &str,
        input: Value,
        tenant_id: &str,
        options: ExecutionOptions,
    ) -> Result<Uuid, EngineError> {
        let flow = self.catalog.get(flow_id, tenant_id)?;

        let ctx = ExecutionContext::new(flow_id, tenant_id, input);
        let execution_id = ctx.execution_id;
        self.store.create_execution(&ctx).await?;

        let cancel = CancellationToken::new();
        self.cancellations.insert(execution_id, cancel.clone());

        let gate = self.tenant_gate(tenant_id);
        let engine = self.clone();
        tokio::spawn(async move {
            let _permit = gate.acquire_owned().await.expect("gate is never closed");
            let coordinator = Coordinator::new(
                flow,
                ctx,
                &options,
                engine.store.clone(),
                engine.registry.clone(),
                engine.proxy.clone(),
                engine.bus.clone(),
                engine.config.clone(),
                cancel,
            );
            coordinator.run().await;
            engine.cancellations.remove(&execution_id);
        });

        Ok(execution_id)
    }

    /// Tenant-scoped status lookup. Another tenant's execution reads as
    /// NotFound so existence does not leak.
    pub async fn status(
        &self,
        execution_id: Uuid,
        tenant_id: &str,
    ) -> Result<ExecutionContext, EngineError> {
        match self.store.get_execution(execution_id).await? {
            Some(ctx) if ctx.tenant_id == tenant_id => Ok(ctx),
            _ => Err(EngineError::NotFound),
        }
    }

    /// Cooperative cancellation: flips the execution's cancel flag; the
    /// coordinator aborts in-flight dispatches at their next suspension point.
    pub async fn cancel(&self, execution_id: Uuid, tenant_id: &str) -> Result<(), EngineError> {
        let ctx = self.status(execution_id, tenant_id).await?;
        if ctx.status.is_terminal() {
            return Err(EngineError::AlreadyTerminal);
        }
        match self.cancellations.get(&execution_id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(EngineError::AlreadyTerminal),
        }
    }

    /// Event stream for one execution; the caller filters by execution id.
    pub async fn subscribe(
        &self,
        execution_id: Uuid,
        tenant_id: &str,
    ) -> Result<broadcast::Receiver<EngineEvent>, EngineError> {
        self.status(execution_id, tenant_id).await?;
        Ok(self.bus.subscribe())
    }

    pub async fn list_executions(
        &self,
        tenant_id: &str,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionContext>, EngineError> {
        self.store.list_executions(tenant_id, filter).await
    }

    pub async fn node_results(
        &self,
        execution_id: Uuid,
        tenant_id: &str,
    ) -> Result<Vec<NodeResult>, EngineError> {
        self.status(execution_id, tenant_id).await?;
        self.store.node_results(execution_id).await
    }

    pub async fn messages(
        &self,
        execution_id: Uuid,
        tenant_id: &str,
    ) -> Result<Vec<AgentMessage>, EngineError> {
        self.status(execution_id, tenant_id).await?;
        self.store.messages(execution_id).await
    }

    pub async fn metrics(&self, tenant_id: &str) -> Result<StoreMetrics, EngineError> {
        self.store.metrics(tenant_id).await
    }

    // === AGENTS ===

    pub fn register_agent(
        &self,
        mut record: AgentRecord,
        tenant_id: Option<&str>,
    ) -> Result<AgentRecord, EngineError> {
        record.owner_tenant_id = tenant_id.map(String::from);
        self.registry.register(record)
    }

    pub fn deregister_agent(
        &self,
        agent_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<(), EngineError> {
        self.registry.deregister(agent_id, tenant_id)
    }

    pub fn list_agents(&self, tenant_id: &str, capability: Option<&str>) -> Vec<AgentRecord> {
        self.registry.list(tenant_id, capability)
    }
}
