// apps/flow-kernel/src/main.rs
// Purpose: Entry point. Selects the store, recovers interrupted executions
//          and starts the server.
// Architecture: Application Boot
// Dependencies: Axum, Tokio, Tracing

use anyhow::Context;
use std::sync::Arc;

use flow_kernel::config::EngineConfig;
use flow_kernel::engine::Engine;
use flow_kernel::server;
use flow_kernel::store::{ExecutionStore, MemoryStore, RedisStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("flow_kernel=debug".parse().expect("valid directive"))
                .add_directive("tower_http=info".parse().expect("valid directive")),
        )
        .init();

    let config = EngineConfig::from_env();
    tracing::info!("initializing flow kernel");

    // store selection happens exactly once, here
    let store: Arc<dyn ExecutionStore> = match std::env::var("REDIS_URL") {
        Ok(url) => {
            let store = RedisStore::connect(&url)
                .await
                .context("connecting to redis")?;
            let interrupted = store.rehydrate().await.context("rehydrating state")?;
            if interrupted > 0 {
                tracing::warn!("marked {interrupted} interrupted executions as failed");
            }
            tracing::info!("using redis store at {url}");
            Arc::new(store)
        }
        Err(_) => {
            tracing::warn!("REDIS_URL not set, using the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let engine = Engine::new(config.clone(), store);
    engine.start_sweeper();

    let app = server::router(engine);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    tracing::info!("flow kernel listening on http://{addr}");
    axum::serve(listener, app).await.context("serving")?;

    Ok(())
}
