// apps/flow-kernel/src/server/handlers.rs
// Purpose: HTTP/WS translation layer over the engine API. No logic lives
//          here beyond extraction and status mapping.
// Architecture: API Layer
// Dependencies: Axum, Engine

use axum::{
    async_trait,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        FromRequestParts, Path, Query, State,
    },
    http::{request::Parts, StatusCode},
    response::IntoResponse,
    Json,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::models::{AgentRecord, ExecutionFilter, ExecutionOptions};

/// Ownership scope from the `X-Tenant-Id` header. Upstream auth resolves
/// credentials to this opaque id; absent means the anonymous public tenant.
pub struct TenantId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for TenantId
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let tenant = parts
            .headers
            .get("X-Tenant-Id")
            .and_then(|h| h.to_str().ok())
            .unwrap_or("public");

        if tenant.is_empty()
            || !tenant
                .chars()
                .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            tracing::warn!("rejected invalid tenant id: {tenant}");
            return Err(StatusCode::BAD_REQUEST);
        }

        Ok(TenantId(tenant.to_string()))
    }
}

fn status_of(err: &EngineError) -> StatusCode {
    match err {
        EngineError::NotFound => StatusCode::NOT_FOUND,
        EngineError::AlreadyTerminal | EngineError::AgentConflict(_) => StatusCode::CONFLICT,
        EngineError::FlowInvalid(_) | EngineError::Expression { .. } => StatusCode::BAD_REQUEST,
        EngineError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: EngineError) -> (StatusCode, Json<Value>) {
    (status_of(&err), Json(json!({"error": err.to_string()})))
}

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "service": "flow-kernel"}))
}

// === FLOWS ===

/// POST /flows with a YAML document body.
pub async fn create_flow(
    State(engine): State<Arc<Engine>>,
    tenant: TenantId,
    body: String,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let loaded = engine
        .catalog()
        .load_yaml(&body, Some(&tenant.0))
        .map_err(reject)?;
    Ok(Json(json!({
        "flow_id": loaded.def.flow_id,
        "version": loaded.def.version,
        "nodes": loaded.def.nodes.len(),
    })))
}

pub async fn list_flows(
    State(engine): State<Arc<Engine>>,
    tenant: TenantId,
) -> Json<Value> {
    let flows = engine.catalog().list(&tenant.0);
    Json(json!({ "flows": flows }))
}

// === EXECUTIONS ===

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub options: ExecutionOptions,
}

/// POST /flows/:flow_id/executions
pub async fn submit_execution(
    State(engine): State<Arc<Engine>>,
    tenant: TenantId,
    Path(flow_id): Path<String>,
    Json(body): Json<SubmitBody>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let execution_id = engine
        .submit(&flow_id, body.input, &tenant.0, body.options)
        .await
        .map_err(reject)?;
    Ok(Json(json!({"execution_id": execution_id})))
}

pub async fn get_execution(
    State(engine): State<Arc<Engine>>,
    tenant: TenantId,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let ctx = engine
        .status(execution_id, &tenant.0)
        .await
        .map_err(reject)?;
    let results = engine
        .node_results(execution_id, &tenant.0)
        .await
        .map_err(reject)?;
    Ok(Json(json!({"execution": ctx, "node_results": results})))
}

pub async fn list_executions(
    State(engine): State<Arc<Engine>>,
    tenant: TenantId,
    Query(filter): Query<ExecutionFilter>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let executions = engine
        .list_executions(&tenant.0, &filter)
        .await
        .map_err(reject)?;
    Ok(Json(json!({"executions": executions})))
}

pub async fn cancel_execution(
    State(engine): State<Arc<Engine>>,
    tenant: TenantId,
    Path(execution_id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    engine
        .cancel(execution_id, &tenant.0)
        .await
        .map_err(reject)?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn get_messages(
    State(engine): State<Arc<Engine>>,
    tenant: TenantId,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let messages = engine
        .messages(execution_id, &tenant.0)
        .await
        .map_err(reject)?;
    Ok(Json(json!({"messages": messages})))
}

pub async fn get_metrics(
    State(engine): State<Arc<Engine>>,
    tenant: TenantId,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let metrics = engine.metrics(&tenant.0).await.map_err(reject)?;
    Ok(Json(json!(metrics)))
}

// === AGENTS ===

pub async fn register_agent(
    State(engine): State<Arc<Engine>>,
    tenant: TenantId,
    Json(record): Json<AgentRecord>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let registered = engine
        .register_agent(record, Some(&tenant.0))
        .map_err(reject)?;
    Ok(Json(json!({"agent": registered})))
}

pub async fn deregister_agent(
    State(engine): State<Arc<Engine>>,
    tenant: TenantId,
    Path(agent_id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    engine
        .deregister_agent(&agent_id, Some(&tenant.0))
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct AgentListQuery {
    pub capability: Option<String>,
}

pub async fn list_agents(
    State(engine): State<Arc<Engine>>,
    tenant: TenantId,
    Query(query): Query<AgentListQuery>,
) -> Json<Value> {
    let agents = engine.list_agents(&tenant.0, query.capability.as_deref());
    Json(json!({"agents": agents}))
}

// === EVENT STREAMING ===

/// GET /ws/executions/:execution_id
pub async fn ws_execution_stream(
    State(engine): State<Arc<Engine>>,
    tenant: TenantId,
    Path(execution_id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_execution(socket, engine, tenant.0, execution_id))
}

async fn stream_execution(
    socket: WebSocket,
    engine: Arc<Engine>,
    tenant_id: String,
    execution_id: Uuid,
) {
    let (mut sender, mut receiver) = socket.split();

    let mut events = match engine.subscribe(execution_id, &tenant_id).await {
        Ok(rx) => rx,
        Err(err) => {
            let _ = sender
                .send(Message::Text(json!({"error": err.to_string()}).to_string()))
                .await;
            return;
        }
    };

    // initial snapshot so late subscribers see the current state
    if let Ok(ctx) = engine.status(execution_id, &tenant_id).await {
        let terminal = ctx.status.is_terminal();
        let snapshot = json!({"type": "snapshot", "execution": ctx});
        if sender
            .send(Message::Text(snapshot.to_string()))
            .await
            .is_err()
        {
            return;
        }
        if terminal {
            let _ = sender.close().await;
            return;
        }
    }

    loop {
        tokio::select! {
            msg = receiver.next() => {
                if msg.is_none() {
                    tracing::debug!("stream client left: {execution_id}");
                    break;
                }
            }
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    // a lagged subscriber skips what it missed
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                };
                if event.execution_id != Some(execution_id) {
                    continue;
                }
                let kind = event.kind;
                let frame = json!({"type": "event", "event": event});
                if sender.send(Message::Text(frame.to_string())).await.is_err() {
                    break;
                }
                if matches!(
                    kind,
                    crate::events::EventKind::ExecutionSucceeded
                        | crate::events::EventKind::ExecutionFailed
                        | crate::events::EventKind::ExecutionCancelled
                ) {
                    let _ = sender.close().await;
                    break;
                }
            }
        }
    }
}
