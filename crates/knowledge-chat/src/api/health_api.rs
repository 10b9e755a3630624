use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{error, warn};

use crate::shared_state::AppState;

/// GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let knowledge = match state.database.embeddings.get_stats() {
        Ok(stats) => json!({
            "documents": stats.total_knowledge,
            "vectors": stats.total_vectors,
            "dimension": stats.dimension,
        }),
        Err(e) => {
            warn!("Knowledge stats unavailable: {}", e);
            serde_json::Value::Null
        }
    };
    Json(json!({
        "status": "ok",
        "active_answers": state.coordinator.active_answers(),
        "subscribed_topics": state.publisher.topic_count(),
        "knowledge": knowledge,
    }))
}

/// GET /metrics
pub async fn metrics() -> Response {
    match crate::metrics::render() {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
