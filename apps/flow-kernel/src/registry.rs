// apps/flow-kernel/src/registry.rs
// Purpose: Agent registry. Discovery, ownership scopes and liveness probing.
// Architecture: Discovery Layer
// Dependencies: DashMap, Tokio

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus, EventKind};
use crate::models::{AgentHealth, AgentRecord};
use crate::proxy::AgentProxy;

/// Consecutive failed probes before an agent is marked unhealthy.
const UNHEALTHY_AFTER: u32 = 3;

#[derive(Debug, Clone)]
struct RegisteredAgent {
    record: AgentRecord,
    consecutive_probe_failures: u32,
}

/// Agent ids are unique across scopes: a tenant cannot shadow a system agent
/// and two tenants cannot share an id. Health is advisory; the registry never
/// refuses a lookup because an agent is unhealthy.
pub struct AgentRegistry {
    agents: DashMap<String, RegisteredAgent>,
    capabilities: DashMap<String, HashSet<String>>,
    proxy: Arc<AgentProxy>,
    bus: EventBus,
}

impl AgentRegistry {
    pub fn new(proxy: Arc<AgentProxy>, bus: EventBus) -> Self {
        Self {
            agents: DashMap::new(),
            capabilities: DashMap::new(),
            proxy,
            bus,
        }
    }

    /// Same-scope re-registration returns the existing record untouched.
    /// A collision across scopes is a conflict.
    pub fn register(&self, record: AgentRecord) -> Result<AgentRecord, EngineError> {
        if let Some(existing) = self.agents.get(&record.agent_id) {
            if existing.record.owner_tenant_id == record.owner_tenant_id {
                return Ok(existing.record.clone());
            }
            return Err(EngineError::AgentConflict(record.agent_id));
        }

        for capability in &record.capabilities {
            self.capabilities
                .entry(capability.clone())
                .or_default()
                .insert(record.agent_id.clone());
        }
        let out = record.clone();
        self.agents.insert(
            record.agent_id.clone(),
            RegisteredAgent {
                record,
                consecutive_probe_failures: 0,
            },
        );
        Ok(out)
    }

    /// A tenant sees its own agents plus system-scope agents.
    pub fn lookup(&self, agent_id: &str, tenant_id: &str) -> Result<AgentRecord, EngineError> {
        match self.agents.get(agent_id) {
            Some(entry)
                if entry.record.owner_tenant_id.is_none()
                    || entry.record.owner_tenant_id.as_deref() == Some(tenant_id) =>
            {
                Ok(entry.record.clone())
            }
            _ => Err(EngineError::AgentUnknown(agent_id.to_string())),
        }
    }

    /// Owners deregister their own agents; system agents are deregistered
    /// with no tenant scope.
    pub fn deregister(&self, agent_id: &str, tenant_id: Option<&str>) -> Result<(), EngineError> {
        let owned = match self.agents.get(agent_id) {
            Some(entry) => entry.record.owner_tenant_id.as_deref() == tenant_id,
            None => false,
        };
        if !owned {
            return Err(EngineError::NotFound);
        }
        if let Some((_, entry)) = self.agents.remove(agent_id) {
            for capability in &entry.record.capabilities {
                if let Some(mut ids) = self.capabilities.get_mut(capability) {
                    ids.remove(agent_id);
                }
            }
        }
        Ok(())
    }

    pub fn list(&self, tenant_id: &str, capability: Option<&str>) -> Vec<AgentRecord> {
        let allowed_ids: Option<HashSet<String>> = capability.map(|cap| {
            self.capabilities
                .get(cap)
                .map(|ids| ids.value().clone())
                .unwrap_or_default()
        });

        let mut out: Vec<AgentRecord> = self
            .agents
            .iter()
            .filter(|e| {
                e.record.owner_tenant_id.is_none()
                    || e.record.owner_tenant_id.as_deref() == Some(tenant_id)
            })
            .filter(|e| {
                allowed_ids
                    .as_ref()
                    .map(|ids| ids.contains(&e.record.agent_id))
                    .unwrap_or(true)
            })
            .map(|e| e.record.clone())
            .collect();
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }

    /// Best-effort probe of one agent. Three consecutive failures mark it
    /// unhealthy; a single success restores ready.
    pub async fn health_probe(&self, agent_id: &str) -> Result<AgentHealth, EngineError> {
        let record = self
            .agents
            .get(agent_id)
            .map(|e| e.record.clone())
            .ok_or_else(|| EngineError::AgentUnknown(agent_id.to_string()))?;

        let probe = self.proxy.probe_health(&record).await;
        let succeeded = matches!(&probe, Ok(report) if report.ready);

        let health = {
            let mut entry = match self.agents.get_mut(agent_id) {
                Some(entry) => entry,
                // deregistered mid-probe
                None => return Err(EngineError::AgentUnknown(agent_id.to_string())),
            };
            entry.record.last_probe_at = Some(Utc::now());
            if succeeded {
                entry.consecutive_probe_failures = 0;
                entry.record.health = AgentHealth::Ready;
            } else {
                entry.consecutive_probe_failures += 1;
                if entry.consecutive_probe_failures >= UNHEALTHY_AFTER {
                    entry.record.health = AgentHealth::Unhealthy;
                }
            }
            entry.record.health
        };

        self.bus.publish(EngineEvent::agent(
            EventKind::AgentProbed,
            agent_id,
            json!({"healthy": succeeded, "health": health}),
        ));

        Ok(health)
    }

    /// Background sweeper probing every registered agent on an interval.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let ids: Vec<String> =
                    registry.agents.iter().map(|e| e.key().clone()).collect();
                for agent_id in ids {
                    if let Err(err) = registry.health_probe(&agent_id).await {
                        tracing::debug!("probe of {agent_id} failed: {err}");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::models::AgentType;
    use crate::proxy::ProxyConfig;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn registry() -> Arc<AgentRegistry> {
        let bus = EventBus::default();
        let proxy = Arc::new(AgentProxy::new(ProxyConfig::default(), bus.clone()));
        Arc::new(AgentRegistry::new(proxy, bus))
    }

    fn record(agent_id: &str, owner: Option<&str>) -> AgentRecord {
        AgentRecord {
            agent_id: agent_id.into(),
            endpoint: "http://127.0.0.1:1".into(),
            capabilities: vec!["echo".into()],
            agent_type: AgentType::Processor,
            version: "1.0.0".into(),
            owner_tenant_id: owner.map(String::from),
            auth_token: None,
            health: AgentHealth::Unknown,
            last_probe_at: None,
        }
    }

    #[test]
    fn same_scope_registration_is_idempotent() {
        let reg = registry();
        reg.register(record("echo", Some("acme"))).unwrap();
        let again = reg.register(record("echo", Some("acme"))).unwrap();
        assert_eq!(again.agent_id, "echo");
    }

    #[test]
    fn cross_scope_collision_is_a_conflict() {
        let reg = registry();
        reg.register(record("echo", Some("acme"))).unwrap();
        assert!(matches!(
            reg.register(record("echo", Some("globex"))),
            Err(EngineError::AgentConflict(_))
        ));
        assert!(matches!(
            reg.register(record("echo", None)),
            Err(EngineError::AgentConflict(_))
        ));
    }

    #[test]
    fn lookup_scoping_hides_other_tenants() {
        let reg = registry();
        reg.register(record("mine", Some("acme"))).unwrap();
        reg.register(record("shared", None)).unwrap();

        assert!(reg.lookup("mine", "acme").is_ok());
        assert!(reg.lookup("shared", "acme").is_ok());
        assert!(reg.lookup("shared", "globex").is_ok());
        assert!(matches!(
            reg.lookup("mine", "globex"),
            Err(EngineError::AgentUnknown(_))
        ));
        assert!(matches!(
            reg.lookup("nope", "acme"),
            Err(EngineError::AgentUnknown(_))
        ));
    }

    #[test]
    fn capability_filter_narrows_listing() {
        let reg = registry();
        let mut summarize = record("summarize", None);
        summarize.capabilities = vec!["summarize".into()];
        reg.register(summarize).unwrap();
        reg.register(record("echo-1", None)).unwrap();

        let all = reg.list("acme", None);
        assert_eq!(all.len(), 2);
        let echoes = reg.list("acme", Some("echo"));
        assert_eq!(echoes.len(), 1);
        assert_eq!(echoes[0].agent_id, "echo-1");
        assert!(reg.list("acme", Some("never")).is_empty());
    }

    #[test]
    fn deregister_requires_ownership() {
        let reg = registry();
        reg.register(record("mine", Some("acme"))).unwrap();
        assert!(matches!(
            reg.deregister("mine", Some("globex")),
            Err(EngineError::NotFound)
        ));
        reg.deregister("mine", Some("acme")).unwrap();
        assert!(reg.lookup("mine", "acme").is_err());
        assert!(reg.list("acme", Some("echo")).is_empty());
    }

    #[tokio::test]
    async fn three_failed_probes_mark_unhealthy_one_success_restores() {
        let ready = Arc::new(AtomicBool::new(false));
        let ready_flag = ready.clone();
        let app = Router::new().route(
            "/health",
            get(move || {
                let ready = ready_flag.clone();
                async move {
                    Json(serde_json::json!({
                        "agent_id": "flappy",
                        "version": "1.0.0",
                        "capabilities": [],
                        "ready": ready.load(Ordering::SeqCst),
                        "agent_type": "processor",
                    }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let reg = registry();
        let mut rec = record("flappy", None);
        rec.endpoint = format!("http://{addr}");
        reg.register(rec).unwrap();

        assert_eq!(reg.health_probe("flappy").await.unwrap(), AgentHealth::Unknown);
        assert_eq!(reg.health_probe("flappy").await.unwrap(), AgentHealth::Unknown);
        assert_eq!(
            reg.health_probe("flappy").await.unwrap(),
            AgentHealth::Unhealthy
        );

        ready.store(true, Ordering::SeqCst);
        assert_eq!(reg.health_probe("flappy").await.unwrap(), AgentHealth::Ready);

        let rec = reg.lookup("flappy", "anyone").unwrap();
        assert!(rec.last_probe_at.is_some());
    }
}
