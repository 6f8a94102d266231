// apps/flow-kernel/src/proxy.rs
// Purpose: Outbound HTTP client for agent dispatch and health probes.
// Architecture: Transport Layer
// Dependencies: reqwest, tokio, serde_json

use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use crate::breaker::BreakerTable;
use crate::error::AgentError;
use crate::events::{EngineEvent, EventBus, EventKind};
use crate::models::{AgentCallRequest, AgentCallResponse, AgentCallStatus, AgentHealthReport, AgentRecord};

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Process-wide concurrent dispatch cap.
    pub concurrency: usize,
    /// Bounded wait queue beyond the cap; excess fails with Saturated.
    pub queue: usize,
    /// Response body cap in bytes.
    pub response_size_cap: usize,
    pub probe_timeout: Duration,
    pub breaker_threshold: u32,
    pub breaker_open: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            concurrency: 256,
            queue: 1024,
            response_size_cap: 4 * 1024 * 1024,
            probe_timeout: Duration::from_secs(5),
            breaker_threshold: 5,
            breaker_open: Duration::from_secs(60),
        }
    }
}

/// Stateless dispatch client. All engine traffic to agents funnels through
/// one proxy so the concurrency cap and breaker see every call.
pub struct AgentProxy {
    http: reqwest::Client,
    /// Admission: holds executing + queued dispatches. try_acquire only.
    admission: Arc<Semaphore>,
    /// Execution: holds dispatches actually on the wire.
    dispatch: Arc<Semaphore>,
    breaker: BreakerTable,
    bus: EventBus,
    config: ProxyConfig,
}

impl AgentProxy {
    pub fn new(config: ProxyConfig, bus: EventBus) -> Self {
        Self {
            http: reqwest::Client::new(),
            admission: Arc::new(Semaphore::new(config.concurrency + config.queue)),
            dispatch: Arc::new(Semaphore::new(config.concurrency)),
            breaker: BreakerTable::new(config.breaker_threshold, config.breaker_open),
            bus,
            config,
        }
    }

    /// POST /execute with the per-node timeout applied end-to-end.
    pub async fn execute(
        &self,
        record: &AgentRecord,
        request: &AgentCallRequest,
        timeout: Duration,
    ) -> Result<AgentCallResponse, AgentError> {
        self.breaker.check(&record.agent_id)?;

        let _admitted = self
            .admission
            .try_acquire()
            .map_err(|_| AgentError::saturated())?;
        let _slot = self
            .dispatch
            .acquire()
            .await
            .map_err(|_| AgentError::saturated())?;

        let started = Instant::now();
        let result = tokio::time::timeout(timeout, self.call(record, request)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(inner) => inner,
            Err(_) => Err(AgentError::timeout()),
        };

        match &outcome {
            Ok(_) => self.breaker.record_success(&record.agent_id),
            Err(err) if err.counts_for_breaker() => self.breaker.record_failure(&record.agent_id),
            Err(_) => {}
        }

        self.bus.publish(EngineEvent::agent(
            EventKind::AgentLatency,
            &record.agent_id,
            json!({"millis": elapsed_ms, "ok": outcome.is_ok()}),
        ));

        outcome
    }

    async fn call(
        &self,
        record: &AgentRecord,
        request: &AgentCallRequest,
    ) -> Result<AgentCallResponse, AgentError> {
        let url = format!("{}/execute", record.endpoint.trim_end_matches('/'));

        let mut builder = self.http.post(&url).json(request);
        if let Some(token) = &record.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| AgentError::network(e.to_string()))?;

        let status = response.status();
        let body = self.read_capped(response).await?;

        if !status.is_success() {
            return Err(AgentError::http(
                status.as_u16(),
                String::from_utf8_lossy(&body).into_owned(),
            ));
        }

        let parsed: AgentCallResponse = serde_json::from_slice(&body)
            .map_err(|e| AgentError::contract(format!("invalid execute response: {e}")))?;

        if parsed.execution_id != request.execution_id {
            return Err(AgentError::contract(format!(
                "response execution_id {} does not match request {}",
                parsed.execution_id, request.execution_id
            )));
        }

        match parsed.status {
            AgentCallStatus::Success => Ok(parsed),
            AgentCallStatus::Error => Err(AgentError::app(
                parsed
                    .error_message
                    .unwrap_or_else(|| "agent reported an error".to_string()),
            )),
        }
    }

    async fn read_capped(&self, mut response: reqwest::Response) -> Result<Vec<u8>, AgentError> {
        let cap = self.config.response_size_cap;
        if let Some(len) = response.content_length() {
            if len as usize > cap {
                return Err(AgentError::contract(format!(
                    "response of {len} bytes exceeds the {cap} byte cap"
                )));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| AgentError::network(e.to_string()))?
        {
            if body.len() + chunk.len() > cap {
                return Err(AgentError::contract(format!(
                    "response exceeds the {cap} byte cap"
                )));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    /// GET /health. Any transport error, non-2xx or malformed body is a
    /// failed probe; the registry decides what that means for health state.
    pub async fn probe_health(&self, record: &AgentRecord) -> Result<AgentHealthReport, AgentError> {
        let url = format!("{}/health", record.endpoint.trim_end_matches('/'));

        let mut builder = self.http.get(&url).timeout(self.config.probe_timeout);
        if let Some(token) = &record.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| AgentError::network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::http(status.as_u16(), String::new()));
        }

        response
            .json::<AgentHealthReport>()
            .await
            .map_err(|e| AgentError::contract(format!("invalid health body: {e}")))
    }

    pub fn breaker(&self) -> &BreakerTable {
        &self.breaker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentErrorKind;
    use crate::models::AgentType;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::Value;
    use uuid::Uuid;

    async fn spawn_server(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn record(endpoint: &str) -> AgentRecord {
        AgentRecord {
            agent_id: "echo".into(),
            endpoint: endpoint.into(),
            capabilities: vec![],
            agent_type: AgentType::Processor,
            version: "1.0.0".into(),
            owner_tenant_id: None,
            auth_token: Some("secret".into()),
            health: crate::models::AgentHealth::Unknown,
            last_probe_at: None,
        }
    }

    fn call_request() -> AgentCallRequest {
        AgentCallRequest {
            execution_id: Uuid::new_v4(),
            node_id: "a".into(),
            input: json!({"x": 1}),
            config: json!({}),
        }
    }

    fn echo_app() -> Router {
        Router::new().route(
            "/execute",
            post(|Json(body): Json<Value>| async move {
                Json(json!({
                    "status": "success",
                    "output": body["input"],
                    "execution_id": body["execution_id"],
                }))
            }),
        )
    }

    #[tokio::test]
    async fn executes_and_returns_agent_output() {
        let endpoint = spawn_server(echo_app()).await;
        let proxy = AgentProxy::new(ProxyConfig::default(), EventBus::default());

        let req = call_request();
        let resp = proxy
            .execute(&record(&endpoint), &req, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resp.output.unwrap(), json!({"x": 1}));
    }

    #[tokio::test]
    async fn non_2xx_maps_to_http_error() {
        let app = Router::new().route(
            "/execute",
            post(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let endpoint = spawn_server(app).await;
        let proxy = AgentProxy::new(ProxyConfig::default(), EventBus::default());

        let err = proxy
            .execute(&record(&endpoint), &call_request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind, AgentErrorKind::Http);
        assert_eq!(err.status, Some(500));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn malformed_body_is_a_contract_violation() {
        let app = Router::new().route("/execute", post(|| async { "not json" }));
        let endpoint = spawn_server(app).await;
        let proxy = AgentProxy::new(ProxyConfig::default(), EventBus::default());

        let err = proxy
            .execute(&record(&endpoint), &call_request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind, AgentErrorKind::Contract);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn slow_agent_times_out() {
        let app = Router::new().route(
            "/execute",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                "late"
            }),
        );
        let endpoint = spawn_server(app).await;
        let proxy = AgentProxy::new(ProxyConfig::default(), EventBus::default());

        let err = proxy
            .execute(&record(&endpoint), &call_request(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind, AgentErrorKind::Timeout);
    }

    #[tokio::test]
    async fn saturation_fails_fast_beyond_the_queue() {
        let app = Router::new().route(
            "/execute",
            post(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                "slow"
            }),
        );
        let endpoint = spawn_server(app).await;
        let config = ProxyConfig {
            concurrency: 1,
            queue: 0,
            ..ProxyConfig::default()
        };
        let proxy = Arc::new(AgentProxy::new(config, EventBus::default()));

        let first = {
            let proxy = proxy.clone();
            let rec = record(&endpoint);
            tokio::spawn(async move {
                proxy.execute(&rec, &call_request(), Duration::from_secs(5)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = proxy
            .execute(&record(&endpoint), &call_request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind, AgentErrorKind::Saturated);
        let _ = first.await;
    }

    #[tokio::test]
    async fn breaker_opens_after_consecutive_failures_and_fails_fast() {
        let app = Router::new().route(
            "/execute",
            post(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let endpoint = spawn_server(app).await;
        let proxy = AgentProxy::new(ProxyConfig::default(), EventBus::default());
        let rec = record(&endpoint);

        for _ in 0..5 {
            let err = proxy
                .execute(&rec, &call_request(), Duration::from_secs(5))
                .await
                .unwrap_err();
            assert_eq!(err.kind, AgentErrorKind::Http);
        }

        let started = Instant::now();
        let err = proxy
            .execute(&rec, &call_request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind, AgentErrorKind::BreakerOpen);
        assert!(started.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn mismatched_execution_id_is_a_contract_violation() {
        let app = Router::new().route(
            "/execute",
            post(|| async {
                Json(json!({
                    "status": "success",
                    "output": {},
                    "execution_id": Uuid::new_v4(),
                }))
            }),
        );
        let endpoint = spawn_server(app).await;
        let proxy = AgentProxy::new(ProxyConfig::default(), EventBus::default());

        let err = proxy
            .execute(&record(&endpoint), &call_request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind, AgentErrorKind::Contract);
    }

    #[tokio::test]
    async fn health_probe_parses_the_contract() {
        let app = Router::new().route(
            "/health",
            get(|| async {
                Json(json!({
                    "agent_id": "echo",
                    "version": "1.0.0",
                    "capabilities": ["echo"],
                    "ready": true,
                    "agent_type": "processor",
                }))
            }),
        );
        let endpoint = spawn_server(app).await;
        let proxy = AgentProxy::new(ProxyConfig::default(), EventBus::default());

        let report = proxy.probe_health(&record(&endpoint)).await.unwrap();
        assert!(report.ready);
        assert_eq!(report.agent_id, "echo");
    }

    #[tokio::test]
    async fn health_probe_rejects_missing_fields() {
        let app = Router::new().route(
            "/health",
            get(|| async { Json(json!({"status": "ok"})) }),
        );
        let endpoint = spawn_server(app).await;
        let proxy = AgentProxy::new(ProxyConfig::default(), EventBus::default());

        let err = proxy.probe_health(&record(&endpoint)).await.unwrap_err();
        assert_eq!(err.kind, AgentErrorKind::Contract);
    }
}
