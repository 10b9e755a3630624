//! Rolling conversation digests.
//!
//! A digest absorbs every turn up to its boundary; older digests are folded
//! into the next one instead of being mutated.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{BoundaryExt, PipelineError, PipelineResult};
use crate::inference::{ChatMessage, GenerationOptions, InferenceBackend};
use crate::memory::SummaryStore;
use crate::memory_db::schema::ConversationSummary;

pub struct SummaryGenerator {
    inference: Arc<dyn InferenceBackend>,
    summaries: Arc<dyn SummaryStore>,
    prompt: String,
    timeout: Duration,
    options: GenerationOptions,
}

impl SummaryGenerator {
    pub fn new(
        inference: Arc<dyn InferenceBackend>,
        summaries: Arc<dyn SummaryStore>,
        prompt: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            inference,
            summaries,
            prompt: prompt.into(),
            timeout,
            options: GenerationOptions {
                max_tokens: 512,
                temperature: 0.3,
            },
        }
    }

    /// Summarize `turns` (plus the digest they continue from) and store the
    /// result keyed by `boundary_turn_id`. Nothing is stored when the model call fails.
    pub async fn generate(
        &self,
        conversation_id: &str,
        boundary_turn_id: &str,
        previous_digest: Option<&str>,
        turns: &[ChatMessage],
    ) -> PipelineResult<ConversationSummary> {
        debug!(
            "Summarizing {} turns of {} up to {}",
            turns.len(),
            conversation_id,
            boundary_turn_id
        );
        let messages = self.build_messages(previous_digest, turns);

        let completion = tokio::time::timeout(self.timeout, self.inference.generate(&messages, &self.options))
            .await
            .map_err(|_| {
                PipelineError::upstream(anyhow::anyhow!(
                    "summary generation timed out after {}s",
                    self.timeout.as_secs()
                ))
                .at("summary.generate")
            })?
            .upstream_at("summary.generate")?;

        if completion.choices.len() != 1 {
            warn!(
                "Summary for {} came back in {} parts; storing them joined",
                conversation_id,
                completion.choices.len()
            );
        }
        let digest = completion.text().trim().to_string();
        if digest.is_empty() {
            warn!("Summary for {} is empty; storing it anyway", conversation_id);
        }

        let summary = self
            .summaries
            .create_summary(conversation_id, boundary_turn_id, &digest)
            .await
            .storage_at("summary.store")?;
        info!(
            "Stored summary {} for {} (boundary {}, {} chars)",
            summary.id,
            conversation_id,
            boundary_turn_id,
            digest.len()
        );
        Ok(summary)
    }

    fn build_messages(&self, previous_digest: Option<&str>, turns: &[ChatMessage]) -> Vec<ChatMessage> {
        let mut transcript = String::new();
        if let Some(digest) = previous_digest.filter(|d| !d.trim().is_empty()) {
            transcript.push_str("Earlier summary:\n");
            transcript.push_str(digest);
            transcript.push_str("\n\n");
        }
        transcript.push_str("Conversation:\n");
        for turn in turns {
            transcript.push_str(turn.role.as_str());
            transcript.push_str(": ");
            transcript.push_str(&turn.content);
            transcript.push('\n');
        }
        vec![ChatMessage::system(self.prompt.clone()), ChatMessage::user(transcript)]
    }

    /// Tokens the prompt framing costs before any turn is added.
    pub fn framing_tokens(&self, previous_digest: Option<&str>) -> usize {
        crate::utils::TextUtils::estimate_message_tokens(&self.build_messages(previous_digest, &[]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{ChatStream, Completion, Embeddings, RerankOutcome};
    use crate::memory_db::ChatDatabase;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct CannedModel {
        reply: anyhow::Result<Vec<String>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl CannedModel {
        fn new(reply: anyhow::Result<Vec<String>>) -> Self {
            Self { reply, seen: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl InferenceBackend for CannedModel {
        async fn generate(&self, messages: &[ChatMessage], _: &GenerationOptions) -> anyhow::Result<Completion> {
            self.seen.lock().unwrap().push(messages.to_vec());
            match &self.reply {
                Ok(choices) => Ok(Completion { choices: choices.clone(), usage: None }),
                Err(e) => Err(anyhow::anyhow!("{}", e)),
            }
        }

        async fn generate_stream(&self, _: &[ChatMessage], _: &GenerationOptions) -> anyhow::Result<ChatStream> {
            Err(anyhow::anyhow!("not used"))
        }

        async fn embed(&self, _: &[String]) -> anyhow::Result<Embeddings> {
            Err(anyhow::anyhow!("not used"))
        }

        async fn rerank(&self, _: &str, _: &[String]) -> anyhow::Result<RerankOutcome> {
            Ok(RerankOutcome::Unsupported)
        }
    }

    fn setup(model: Arc<CannedModel>) -> (tempfile::TempDir, Arc<ChatDatabase>, SummaryGenerator) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(ChatDatabase::open(&dir.path().join("chat.db")).unwrap());
        let store: Arc<dyn SummaryStore> = Arc::new(db.summaries.clone());
        let generator = SummaryGenerator::new(model, store, "summarize", Duration::from_secs(5));
        (dir, db, generator)
    }

    #[tokio::test]
    async fn test_generate_stores_digest_under_boundary() {
        let model = Arc::new(CannedModel::new(Ok(vec!["They greeted each other.".to_string()])));
        let (_dir, db, generator) = setup(model.clone());

        let turns = vec![ChatMessage::user("hi"), ChatMessage::new(crate::memory_db::Role::Assistant, "hello")];
        let summary = generator.generate("c1", "0002", Some("old digest"), &turns).await.unwrap();
        assert_eq!(summary.boundary_turn_id, "0002");
        assert_eq!(summary.digest, "They greeted each other.");

        let latest = db.summaries.latest_summary("c1").await.unwrap().unwrap();
        assert_eq!(latest.boundary_turn_id, "0002");

        let seen = model.seen.lock().unwrap();
        assert!(seen[0][1].content.contains("old digest"));
        assert!(seen[0][1].content.contains("assistant: hello"));
    }

    #[tokio::test]
    async fn test_empty_or_split_reply_is_still_stored() {
        let model = Arc::new(CannedModel::new(Ok(vec!["part one ".to_string(), "part two".to_string()])));
        let (_dir, _db, generator) = setup(model);
        let summary = generator.generate("c1", "0003", None, &[ChatMessage::user("x")]).await.unwrap();
        assert_eq!(summary.digest, "part one part two");

        let model = Arc::new(CannedModel::new(Ok(vec![])));
        let (_dir, _db, generator) = setup(model);
        let summary = generator.generate("c1", "0003", None, &[ChatMessage::user("x")]).await.unwrap();
        assert_eq!(summary.digest, "");
    }

    #[tokio::test]
    async fn test_model_failure_stores_nothing() {
        let model = Arc::new(CannedModel::new(Err(anyhow::anyhow!("backend down"))));
        let (_dir, db, generator) = setup(model);
        let err = generator.generate("c1", "0003", None, &[ChatMessage::user("x")]).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Upstream);
        assert!(db.summaries.latest_summary("c1").await.unwrap().is_none());
    }
}
