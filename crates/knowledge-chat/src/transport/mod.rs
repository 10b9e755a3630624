//! Pub/sub and mutual-exclusion seams between the pipeline and its clients.

pub mod broadcast;
pub mod lock;

pub use broadcast::BroadcastPublisher;
pub use lock::{request_lock_key, DedupLock, LocalDedupLock, LockGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory_db::schema::{ConversationTurn, Progress, Role};

pub const TURN_CREATED_EVENT: &str = "turn.created";
pub const STREAM_EVENT: &str = "turn.stream";

/// Every event of a conversation goes to this topic.
pub fn topic_for(conversation_id: &str) -> String {
    format!("conversation:{}", conversation_id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedEvent {
    pub topic: String,
    pub kind: String,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, kind: &str, payload: serde_json::Value) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnCreatedEvent {
    pub turn_id: String,
    pub conversation_id: String,
    pub sequence: i64,
    pub send_time: DateTime<Utc>,
    pub role: Role,
    pub text: String,
    pub attachments: Vec<String>,
    pub progress: Progress,
}

impl From<&ConversationTurn> for TurnCreatedEvent {
    fn from(turn: &ConversationTurn) -> Self {
        Self {
            turn_id: turn.id.clone(),
            conversation_id: turn.conversation_id.clone(),
            sequence: turn.sequence,
            send_time: turn.created_at,
            role: turn.role,
            text: turn.text.clone(),
            attachments: turn.attachments.clone(),
            progress: turn.progress,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Text,
    ToolStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub turn_id: String,
    pub conversation_id: String,
    pub kind: StreamKind,
    pub payload: serde_json::Value,
    /// Characters of text delivered so far, this chunk included.
    pub offset: usize,
    pub progress: Progress,
}

/// Serialize and publish `event` under `kind` on the conversation's topic.
pub async fn publish_to_conversation<T: Serialize + Sync>(
    publisher: &dyn EventPublisher,
    conversation_id: &str,
    kind: &str,
    event: &T,
) -> anyhow::Result<()> {
    let payload = serde_json::to_value(event)?;
    publisher.publish(&topic_for(conversation_id), kind, payload).await
}
