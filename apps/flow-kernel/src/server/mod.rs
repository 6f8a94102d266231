pub mod handlers;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::engine::Engine;

/// The full HTTP surface over one engine handle.
pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/flows", post(handlers::create_flow).get(handlers::list_flows))
        .route(
            "/flows/:flow_id/executions",
            post(handlers::submit_execution),
        )
        .route("/executions", get(handlers::list_executions))
        .route("/executions/:execution_id", get(handlers::get_execution))
        .route(
            "/executions/:execution_id/cancel",
            post(handlers::cancel_execution),
        )
        .route(
            "/executions/:execution_id/messages",
            get(handlers::get_messages),
        )
        .route("/metrics", get(handlers::get_metrics))
        .route(
            "/agents",
            post(handlers::register_agent).get(handlers::list_agents),
        )
        .route("/agents/:agent_id", delete(handlers::deregister_agent))
        .route(
            "/ws/executions/:execution_id",
            get(handlers::ws_execution_stream),
        )
        .layer(cors)
        .with_state(engine)
}
