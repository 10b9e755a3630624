//! Inference capability consumed by the pipeline: generate, generate streaming,
//! embed and rerank. Which model serves a call is configuration, not pipeline logic.

pub mod http_backend;

pub use http_backend::HttpInference;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::memory_db::schema::Role;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_max_tokens() -> u32 { 2000 }
fn default_temperature() -> f32 { 0.7 }

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

/// Non-streaming answer. A backend may return several choices; callers that
/// expect one treat anything else as suspicious.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub choices: Vec<String>,
    pub usage: Option<Usage>,
}

impl Completion {
    pub fn text(&self) -> String {
        self.choices.concat()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamChunk {
    pub delta: String,
    pub usage: Option<Usage>,
}

pub type ChatStream = BoxStream<'static, anyhow::Result<StreamChunk>>;

#[derive(Debug, Clone, Default)]
pub struct Embeddings {
    pub vectors: Vec<Vec<f32>>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RerankScore {
    /// Index into the documents passed to `rerank`.
    pub index: usize,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RerankOutcome {
    /// Best first. May omit documents the reranker considered irrelevant.
    Ranked { scores: Vec<RerankScore>, usage: Option<Usage> },
    Unsupported,
}

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn generate(&self, messages: &[ChatMessage], options: &GenerationOptions) -> anyhow::Result<Completion>;

    async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> anyhow::Result<ChatStream>;

    async fn embed(&self, texts: &[String]) -> anyhow::Result<Embeddings>;

    async fn rerank(&self, query: &str, documents: &[String]) -> anyhow::Result<RerankOutcome>;
}
