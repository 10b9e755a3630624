//! HTTP server startup and routing.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::{config::Config, memory_db::ChatDatabase, shared_state::AppState, transport::BroadcastPublisher};

const TOPIC_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Open the database, wire the pipeline and serve until the listener fails.
pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing("info");
    crate::metrics::init_metrics()?;
    cfg.print_config();

    let database = Arc::new(ChatDatabase::open_with_model(&cfg.database_path, &cfg.embedding_model)?);
    let addr = cfg.api_addr()?;
    let state = AppState::new(cfg, database);
    spawn_topic_sweeper(state.publisher.clone());

    let app = build_router(state);
    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Periodically drop conversation topics whose subscribers all left.
fn spawn_topic_sweeper(publisher: Arc<BroadcastPublisher>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TOPIC_SWEEP_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let pruned = publisher.prune();
            if pruned > 0 {
                debug!("Dropped {} idle event topics", pruned);
            }
        }
    });
}

pub fn build_router(state: AppState) -> axum::Router {
    use axum::{
        routing::{delete, get, post},
        Router,
    };
    use tower_http::{
        cors::{Any, CorsLayer},
        timeout::TimeoutLayer,
        trace::TraceLayer,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any);
    let timeout = Duration::from_secs(state.config.request_timeout_seconds);

    Router::new()
        .route("/v1/conversations/:id", delete(crate::api::delete_conversation))
        .route("/v1/conversations/:id/messages", post(crate::api::post_message))
        .route("/v1/conversations/:id/events", get(crate::api::conversation_events))
        .route("/v1/turns/:id/stop", post(crate::api::stop_turn))
        .route("/health", get(crate::api::health))
        .route("/metrics", get(crate::api::metrics))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(timeout))
        .with_state(state)
}
