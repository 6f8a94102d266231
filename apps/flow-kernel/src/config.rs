// apps/flow-kernel/src/config.rs
// Purpose: Engine tunables, read once from the environment at boot.
// Architecture: Application Boot
// Dependencies: std

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-execution parallel dispatch cap.
    pub parallelism: usize,
    /// Default per-node dispatch timeout.
    pub node_timeout: Duration,
    /// Default whole-execution deadline.
    pub execution_deadline: Duration,
    /// Default retry budget for agent nodes.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Process-wide outbound dispatch cap.
    pub proxy_concurrency: usize,
    /// Bounded dispatch wait queue beyond the cap.
    pub proxy_queue: usize,
    pub response_size_cap: usize,
    pub breaker_threshold: u32,
    pub breaker_open: Duration,
    /// Registry health sweep interval.
    pub sweep_interval: Duration,
    /// Concurrent executions allowed per tenant.
    pub tenant_parallelism: usize,
    pub event_bus_capacity: usize,
    pub port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: 8,
            node_timeout: Duration::from_secs(30),
            execution_deadline: Duration::from_secs(300),
            max_retries: 0,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            proxy_concurrency: 256,
            proxy_queue: 1024,
            response_size_cap: 4 * 1024 * 1024,
            breaker_threshold: 5,
            breaker_open: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            tenant_parallelism: 4,
            event_bus_capacity: 256,
            port: 3000,
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    /// FLOW_* environment variables override the defaults above.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            parallelism: env_u64("FLOW_PARALLELISM", d.parallelism as u64) as usize,
            node_timeout: Duration::from_secs(env_u64(
                "FLOW_NODE_TIMEOUT_SECS",
                d.node_timeout.as_secs(),
            )),
            execution_deadline: Duration::from_secs(env_u64(
                "FLOW_DEADLINE_SECS",
                d.execution_deadline.as_secs(),
            )),
            max_retries: env_u64("FLOW_MAX_RETRIES", d.max_retries as u64) as u32,
            retry_base_delay: Duration::from_millis(env_u64(
                "FLOW_RETRY_BASE_MS",
                d.retry_base_delay.as_millis() as u64,
            )),
            retry_max_delay: Duration::from_secs(env_u64(
                "FLOW_RETRY_MAX_SECS",
                d.retry_max_delay.as_secs(),
            )),
            proxy_concurrency: env_u64("FLOW_PROXY_CONCURRENCY", d.proxy_concurrency as u64)
                as usize,
            proxy_queue: env_u64("FLOW_PROXY_QUEUE", d.proxy_queue as u64) as usize,
            response_size_cap: env_u64("FLOW_RESPONSE_CAP_BYTES", d.response_size_cap as u64)
                as usize,
            breaker_threshold: env_u64("FLOW_BREAKER_THRESHOLD", d.breaker_threshold as u64)
                as u32,
            breaker_open: Duration::from_secs(env_u64(
                "FLOW_BREAKER_OPEN_SECS",
                d.breaker_open.as_secs(),
            )),
            sweep_interval: Duration::from_secs(env_u64(
                "FLOW_SWEEP_SECS",
                d.sweep_interval.as_secs(),
            )),
            tenant_parallelism: env_u64("FLOW_TENANT_PARALLELISM", d.tenant_parallelism as u64)
                as usize,
            event_bus_capacity: env_u64("FLOW_EVENT_CAPACITY", d.event_bus_capacity as u64)
                as usize,
            port: env_u64("FLOW_PORT", d.port as u64) as u16,
        }
    }
}
