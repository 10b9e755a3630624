//! Process-wide state handed to every API handler.

use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::crypto::{Plaintext, TextCipher};
use crate::inference::{HttpInference, InferenceBackend};
use crate::memory_db::ChatDatabase;
use crate::pipeline::{PipelineDeps, RequestCoordinator};
use crate::transport::{BroadcastPublisher, DedupLock};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<RequestCoordinator>,
    /// Concrete publisher so handlers can subscribe to conversation topics.
    pub publisher: Arc<BroadcastPublisher>,
    pub database: Arc<ChatDatabase>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wire the pipeline over `database` and an HTTP inference backend.
    pub fn new(config: Config, database: Arc<ChatDatabase>) -> Self {
        let inference: Arc<dyn InferenceBackend> = Arc::new(HttpInference::new(
            config.backend_url.as_str(),
            config.chat_model.as_str(),
            config.embedding_model.as_str(),
            config.rerank_model.as_str(),
        ));
        Self::with_backend(config, database, inference, Arc::new(Plaintext))
    }

    pub fn with_backend(
        config: Config,
        database: Arc<ChatDatabase>,
        inference: Arc<dyn InferenceBackend>,
        cipher: Arc<dyn TextCipher>,
    ) -> Self {
        let publisher = Arc::new(BroadcastPublisher::new(config.event_buffer));
        let lock: Arc<dyn DedupLock> = Arc::new(database.dedup_lock());

        let deps = PipelineDeps {
            turns: Arc::new(database.conversations.clone()),
            summaries: Arc::new(database.summaries.clone()),
            knowledge: Arc::new(database.embeddings.clone()),
            pins: Arc::new(database.pins.clone()),
            inference,
            publisher: publisher.clone(),
            lock,
            cipher,
        };
        let coordinator = Arc::new(RequestCoordinator::new(deps, config.pipeline.clone()));
        info!("Request pipeline ready (backend {})", config.backend_url);

        Self {
            coordinator,
            publisher,
            database,
            config: Arc::new(config),
        }
    }
}
