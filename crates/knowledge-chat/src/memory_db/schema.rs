//! Row types and schema definitions for conversation, summary and knowledge storage
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Author of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(anyhow::anyhow!("Unknown turn role: {}", other)),
        }
    }
}

/// Lifecycle status of a turn. Only `Uncomplete` and `Generating` are non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Progress {
    Uncomplete,
    Generating,
    Complete,
    Canceled,
    Failed,
}

impl Progress {
    pub fn as_str(&self) -> &'static str {
        match self {
            Progress::Uncomplete => "uncomplete",
            Progress::Generating => "generating",
            Progress::Complete => "complete",
            Progress::Canceled => "canceled",
            Progress::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "uncomplete" => Ok(Progress::Uncomplete),
            "generating" => Ok(Progress::Generating),
            "complete" => Ok(Progress::Complete),
            "canceled" => Ok(Progress::Canceled),
            "failed" => Ok(Progress::Failed),
            other => Err(anyhow::anyhow!("Unknown turn progress: {}", other)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Progress::Complete | Progress::Canceled | Progress::Failed)
    }
}

/// One message within a conversation.
///
/// `id` is a time-sortable identifier (UUIDv7 text for server-assigned turns), so
/// lexical order of ids is also creation order. `sequence` is assigned once at
/// creation and is strictly increasing per conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub text: String,
    pub encrypted: bool,
    pub progress: Progress,
    pub sequence: i64,
    pub preview: Option<String>,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Rolling digest of everything up to and including `boundary_turn_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: i64,
    pub conversation_id: String,
    pub boundary_turn_id: String,
    pub digest: String,
    pub created_at: DateTime<Utc>,
}

/// A knowledge item. `content` may be ciphertext when `encrypted` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Knowledge {
    pub id: String,
    pub user_id: String,
    pub space_id: Option<String>,
    pub resource: String,
    pub title: String,
    pub content: String,
    pub encrypted: bool,
    pub created_at: DateTime<Utc>,
}

/// One nearest-neighbour hit. A knowledge item may be chunked into several
/// vectors, so hits can repeat a `knowledge_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub knowledge_id: String,
    pub similarity: f32,
    pub original_length: usize,
}

/// Scope applied to a vector query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VectorFilter {
    pub user_id: String,
    #[serde(default)]
    pub space_id: Option<String>,
    /// Empty means every resource kind.
    #[serde(default)]
    pub resources: Vec<String>,
}

/// Knowledge ids surfaced earlier in a conversation, kept for answer continuity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PinnedDocumentSet {
    pub version: u32,
    pub knowledge_ids: Vec<String>,
}

impl PinnedDocumentSet {
    pub const CURRENT_VERSION: u32 = 1;

    /// Append ids not already pinned. Returns how many were added.
    pub fn merge<'a>(&mut self, ids: impl IntoIterator<Item = &'a String>) -> usize {
        let mut added = 0;
        for id in ids {
            if !self.knowledge_ids.contains(id) {
                self.knowledge_ids.push(id.clone());
                added += 1;
            }
        }
        self.version = Self::CURRENT_VERSION;
        added
    }
}

/// Migration scripts, applied in order by `migrate`.
pub const MIGRATIONS: &[(i32, &str)] = &[(1, SCHEMA_V1), (2, SCHEMA_V2)];

pub const SCHEMA_V1: &str = "
-- Conversations (only the bits the pipeline touches)
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    title TEXT,
    created_at TIMESTAMP NOT NULL
);
-- Turns
CREATE TABLE IF NOT EXISTS turns (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    role TEXT NOT NULL,
    text TEXT NOT NULL DEFAULT '',
    encrypted BOOLEAN NOT NULL DEFAULT FALSE,
    progress TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    preview TEXT,
    attachments TEXT NOT NULL DEFAULT '[]',
    created_at TIMESTAMP NOT NULL
);
-- Rolling summaries, superseded by newer rows
CREATE TABLE IF NOT EXISTS conversation_summaries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL,
    boundary_turn_id TEXT NOT NULL,
    digest TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL
);
-- Knowledge items and their chunk vectors
CREATE TABLE IF NOT EXISTS knowledge (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    space_id TEXT,
    resource TEXT NOT NULL,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    encrypted BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMP NOT NULL
);
CREATE TABLE IF NOT EXISTS knowledge_vectors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    knowledge_id TEXT NOT NULL,
    embedding BLOB NOT NULL,
    embedding_model TEXT NOT NULL,
    original_length INTEGER NOT NULL,
    FOREIGN KEY (knowledge_id) REFERENCES knowledge(id) ON DELETE CASCADE
);
-- Pinned documents, one payload per conversation
CREATE TABLE IF NOT EXISTS pinned_documents (
    conversation_id TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    updated_at TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_turns_conversation ON turns (conversation_id, id);
CREATE INDEX IF NOT EXISTS idx_summaries_conversation ON conversation_summaries (conversation_id, id);
CREATE INDEX IF NOT EXISTS idx_knowledge_owner ON knowledge (user_id, space_id);
CREATE INDEX IF NOT EXISTS idx_vectors_knowledge ON knowledge_vectors (knowledge_id);
";

pub const SCHEMA_V2: &str = "
-- Request leases for the database-backed dedup lock
CREATE TABLE IF NOT EXISTS request_locks (
    key TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_turns_sequence ON turns (conversation_id, sequence);
";
