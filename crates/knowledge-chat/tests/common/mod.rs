#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

use knowledge_chat::crypto::Plaintext;
use knowledge_chat::inference::{
    ChatMessage, ChatStream, Completion, Embeddings, GenerationOptions, InferenceBackend, RerankOutcome, StreamChunk,
};
use knowledge_chat::memory_db::schema::VectorFilter;
use knowledge_chat::memory_db::ChatDatabase;
use knowledge_chat::pipeline::{AgentKind, ChatRequest, PipelineDeps, RequestCoordinator};
use knowledge_chat::transport::BroadcastPublisher;
use knowledge_chat::PipelineSettings;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamMode {
    Chunks,
    /// Never yields; only a stop or the model deadline ends it.
    Hang,
    Fail,
}

/// Inference backend answering from a script.
pub struct ScriptedInference {
    pub chunks: Vec<String>,
    pub mode: StreamMode,
    pub first_chunk_delay: Duration,
    pub completion: String,
    pub completion_delay: Duration,
    pub embedding: Vec<f32>,
    pub streamed_contexts: Mutex<Vec<Vec<ChatMessage>>>,
    pub generate_calls: AtomicUsize,
    pub embed_calls: AtomicUsize,
}

impl ScriptedInference {
    pub fn replying(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            mode: StreamMode::Chunks,
            first_chunk_delay: Duration::ZERO,
            completion: "Greeting".to_string(),
            completion_delay: Duration::ZERO,
            embedding: vec![1.0, 0.0, 0.0],
            streamed_contexts: Mutex::new(Vec::new()),
            generate_calls: AtomicUsize::new(0),
            embed_calls: AtomicUsize::new(0),
        }
    }

    pub fn hanging() -> Self {
        Self { mode: StreamMode::Hang, ..Self::replying(&[]) }
    }

    pub fn failing() -> Self {
        Self { mode: StreamMode::Fail, ..Self::replying(&[]) }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.first_chunk_delay = delay;
        self
    }

    pub fn with_completion_delay(mut self, delay: Duration) -> Self {
        self.completion_delay = delay;
        self
    }

    pub fn contexts(&self) -> Vec<Vec<ChatMessage>> {
        self.streamed_contexts.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceBackend for ScriptedInference {
    async fn generate(&self, _messages: &[ChatMessage], _options: &GenerationOptions) -> anyhow::Result<Completion> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.completion_delay).await;
        Ok(Completion { choices: vec![self.completion.clone()], usage: None })
    }

    async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        _options: &GenerationOptions,
    ) -> anyhow::Result<ChatStream> {
        self.streamed_contexts.lock().unwrap().push(messages.to_vec());
        let chunks = self.chunks.clone();
        let mode = self.mode;
        let delay = self.first_chunk_delay;

        let stream = async_stream::stream! {
            tokio::time::sleep(delay).await;
            match mode {
                StreamMode::Hang => {
                    futures::future::pending::<()>().await;
                }
                StreamMode::Fail => {
                    yield Err(anyhow::anyhow!("backend died"));
                }
                StreamMode::Chunks => {
                    for delta in chunks {
                        yield Ok(StreamChunk { delta, usage: None });
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn embed(&self, texts: &[String]) -> anyhow::Result<Embeddings> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Embeddings {
            vectors: texts.iter().map(|_| self.embedding.clone()).collect(),
            usage: None,
        })
    }

    async fn rerank(&self, _query: &str, _documents: &[String]) -> anyhow::Result<RerankOutcome> {
        Ok(RerankOutcome::Unsupported)
    }
}

pub struct Harness {
    _dir: TempDir,
    pub db: Arc<ChatDatabase>,
    pub publisher: Arc<BroadcastPublisher>,
    pub inference: Arc<ScriptedInference>,
    pub coordinator: Arc<RequestCoordinator>,
}

pub fn harness(inference: ScriptedInference, settings: PipelineSettings) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(ChatDatabase::open(&dir.path().join("chat.db")).unwrap());
    let publisher = Arc::new(BroadcastPublisher::new(256));
    let inference = Arc::new(inference);

    let deps = PipelineDeps {
        turns: Arc::new(db.conversations.clone()),
        summaries: Arc::new(db.summaries.clone()),
        knowledge: Arc::new(db.embeddings.clone()),
        pins: Arc::new(db.pins.clone()),
        inference: inference.clone(),
        publisher: publisher.clone(),
        lock: Arc::new(db.dedup_lock()),
        cipher: Arc::new(Plaintext),
    };
    let coordinator = Arc::new(RequestCoordinator::new(deps, settings));
    Harness { _dir: dir, db, publisher, inference, coordinator }
}

pub fn message(conversation_id: &str, text: &str, stream: bool) -> ChatRequest {
    ChatRequest {
        conversation_id: conversation_id.to_string(),
        turn_id: Uuid::now_v7().to_string(),
        text: text.to_string(),
        attachments: Vec::new(),
        agent: AgentKind::Normal,
        stream,
        filter: VectorFilter {
            user_id: "alice".to_string(),
            space_id: None,
            resources: Vec::new(),
        },
    }
}

/// Poll `check` until it holds or a second has passed.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
