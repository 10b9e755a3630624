//! Posting messages and stopping answers.
//!
//! Batch requests wait for the whole answer. Streaming requests return 202 as
//! soon as the user turn is committed; the answer then flows over the
//! conversation's event stream.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use super::ApiError;
use crate::memory_db::schema::{Progress, VectorFilter};
use crate::pipeline::{AgentKind, ChatRequest};
use crate::shared_state::AppState;

/// Turn ids must sort by creation time, so only UUIDv7 is accepted.
fn validate_turn_id(turn_id: &str) -> Result<(), ValidationError> {
    match Uuid::parse_str(turn_id) {
        Ok(id) if id.get_version_num() == 7 => Ok(()),
        _ => Err(ValidationError::new("turn_id_not_uuid_v7")),
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct PostMessageRequest {
    #[validate(custom = "validate_turn_id")]
    pub turn_id: String,
    #[validate(length(min = 1, max = 32000))]
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub agent: AgentKind,
    #[serde(default)]
    pub stream: bool,
    #[validate(length(min = 1))]
    pub user_id: String,
    #[serde(default)]
    pub space_id: Option<String>,
    #[serde(default)]
    pub resources: Vec<String>,
}

impl PostMessageRequest {
    fn into_chat_request(self, conversation_id: String) -> ChatRequest {
        ChatRequest {
            conversation_id,
            turn_id: self.turn_id,
            text: self.text,
            attachments: self.attachments,
            agent: self.agent,
            stream: self.stream,
            filter: VectorFilter {
                user_id: self.user_id,
                space_id: self.space_id,
                resources: self.resources,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub user_turn_id: String,
    pub sequence: i64,
    /// Stop the answer with `POST /v1/turns/{turn_id}/stop`.
    pub turn_id: String,
}

/// POST /v1/conversations/:id/messages
pub async fn post_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(body): Json<PostMessageRequest>,
) -> Result<Response, ApiError> {
    body.validate().map_err(|e| ApiError::invalid(e.to_string()))?;
    let request = body.into_chat_request(conversation_id);

    if request.stream {
        let accepted = state.coordinator.accept(request).await?;
        let receipt = AcceptedResponse {
            user_turn_id: accepted.user_turn().id.clone(),
            sequence: accepted.user_turn().sequence,
            turn_id: accepted.assistant_turn_id().to_string(),
        };
        let answer_sequence = accepted.assistant_sequence();
        let coordinator = state.coordinator.clone();
        tokio::spawn(async move {
            coordinator.run(accepted).await;
        });
        debug!("Streaming answer {} (sequence {})", receipt.turn_id, answer_sequence);
        return Ok((StatusCode::ACCEPTED, Json(receipt)).into_response());
    }

    let outcome = state.coordinator.handle(request).await?;
    let status = match (outcome.progress, outcome.failure_kind()) {
        (Progress::Failed, Some(kind)) => {
            StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        }
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome)).into_response())
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub turn_id: String,
    pub stopped: bool,
}

/// POST /v1/turns/:id/stop
pub async fn stop_turn(
    State(state): State<AppState>,
    Path(turn_id): Path<String>,
) -> Result<Json<StopResponse>, ApiError> {
    if !state.coordinator.stop(&turn_id) {
        return Err(ApiError::not_found(format!("no answer in progress for turn {}", turn_id)));
    }
    info!("Stop requested for turn {}", turn_id);
    Ok(Json(StopResponse { turn_id, stopped: true }))
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub conversation_id: String,
    pub deleted_turns: usize,
}

/// DELETE /v1/conversations/:id
pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<Json<DeletedResponse>, ApiError> {
    let deleted_turns = state.coordinator.delete_conversation(&conversation_id).await?;
    Ok(Json(DeletedResponse { conversation_id, deleted_turns }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_id_must_be_uuid_v7() {
        assert!(validate_turn_id(&Uuid::now_v7().to_string()).is_ok());
        assert!(validate_turn_id(&Uuid::new_v4().to_string()).is_err());
        assert!(validate_turn_id("turn-1").is_err());
    }

    #[test]
    fn test_body_validation() {
        let body: PostMessageRequest = serde_json::from_value(serde_json::json!({
            "turn_id": Uuid::now_v7().to_string(),
            "text": "",
            "user_id": "u1",
        }))
        .unwrap();
        assert!(body.validate().is_err());
        assert_eq!(body.agent, AgentKind::Normal);
        assert!(!body.stream);
    }
}
