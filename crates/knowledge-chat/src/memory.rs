//! Storage contracts consumed by the request pipeline.
//!
//! The pipeline never talks to a database directly; it only sees these narrow
//! read/write traits. `memory_db` provides the SQLite implementation.

use async_trait::async_trait;

use crate::memory_db::schema::{
    ConversationSummary, ConversationTurn, Knowledge, PinnedDocumentSet, Progress, VectorFilter,
    VectorHit,
};

#[async_trait]
pub trait TurnStore: Send + Sync {
    async fn create_turn(&self, turn: &ConversationTurn) -> anyhow::Result<()>;

    /// Only used to roll back a turn whose creation event could not be published.
    async fn delete_turn(&self, turn_id: &str) -> anyhow::Result<()>;

    /// Bulk cascade: turns, summaries, pins and title of a conversation.
    /// Returns how many turns went.
    async fn delete_conversation(&self, conversation_id: &str) -> anyhow::Result<usize>;

    async fn get_turn(&self, turn_id: &str) -> anyhow::Result<Option<ConversationTurn>>;

    /// Highest assigned sequence in the conversation, 0 when empty.
    async fn latest_sequence(&self, conversation_id: &str) -> anyhow::Result<i64>;

    /// Turns with an id strictly greater than `after_turn_id`, ascending by id.
    async fn list_turns_after(
        &self,
        conversation_id: &str,
        after_turn_id: Option<&str>,
    ) -> anyhow::Result<Vec<ConversationTurn>>;

    async fn append_text(&self, turn_id: &str, chunk: &str) -> anyhow::Result<()>;

    async fn rewrite_text(&self, turn_id: &str, text: &str) -> anyhow::Result<()>;

    async fn set_preview(&self, turn_id: &str, preview: &str) -> anyhow::Result<()>;

    async fn set_progress(&self, turn_id: &str, progress: Progress) -> anyhow::Result<()>;

    async fn conversation_title(&self, conversation_id: &str) -> anyhow::Result<Option<String>>;

    async fn set_conversation_title(&self, conversation_id: &str, title: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait SummaryStore: Send + Sync {
    async fn latest_summary(&self, conversation_id: &str) -> anyhow::Result<Option<ConversationSummary>>;

    async fn create_summary(
        &self,
        conversation_id: &str,
        boundary_turn_id: &str,
        digest: &str,
    ) -> anyhow::Result<ConversationSummary>;
}

#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Nearest vectors to `query`, best first, at most `limit`.
    async fn query_similar(
        &self,
        filter: &VectorFilter,
        query: &[f32],
        limit: usize,
    ) -> anyhow::Result<Vec<VectorHit>>;

    /// Knowledge rows for `ids`; missing ids are skipped. Content is returned as stored.
    async fn get_knowledge(&self, ids: &[String]) -> anyhow::Result<Vec<Knowledge>>;
}

#[async_trait]
pub trait PinStore: Send + Sync {
    async fn get_pins(&self, conversation_id: &str) -> anyhow::Result<PinnedDocumentSet>;

    async fn set_pins(&self, conversation_id: &str, pins: &PinnedDocumentSet) -> anyhow::Result<()>;
}
