//! Supporting-document retrieval: vector search, adaptive similarity filter,
//! rerank with graceful fallback, and pinned-document merge.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::RetrievalSettings;
use crate::crypto::{open_text, TextCipher};
use crate::error::{BoundaryExt, PipelineResult};
use crate::inference::{InferenceBackend, RerankOutcome, Usage};
use crate::memory::{KnowledgeStore, PinStore};
use crate::memory_db::schema::{Knowledge, VectorFilter, VectorHit};

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedDocument {
    pub knowledge_id: String,
    pub title: String,
    pub content: String,
    pub similarity: f32,
    pub original_length: usize,
    pub rerank_score: Option<f32>,
    /// Came from the conversation's pinned set rather than this search.
    pub pinned: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RetrievalOutcome {
    pub documents: Vec<RetrievedDocument>,
    pub embedding_usage: Option<Usage>,
    pub rerank_usage: Option<Usage>,
    pub reranked: bool,
    /// Hits returned by the vector search before filtering.
    pub candidates: usize,
}

impl RetrievalOutcome {
    pub fn knowledge_ids(&self) -> Vec<String> {
        self.documents.iter().map(|d| d.knowledge_id.clone()).collect()
    }

    /// Documents rendered as a prompt section, cut off at `max_chars`.
    pub fn render(&self, max_chars: usize) -> String {
        let mut out = String::new();
        for (i, doc) in self.documents.iter().enumerate() {
            let entry = format!("[{}] {}\n{}\n\n", i + 1, doc.title, doc.content);
            if out.len() + entry.len() > max_chars {
                break;
            }
            out.push_str(&entry);
        }
        out.trim_end().to_string()
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalQuery {
    pub query: String,
    pub filter: VectorFilter,
    /// Pinned documents of this conversation are merged into the result.
    pub conversation_id: Option<String>,
}

/// Hits that survived the similarity filter plus the best raw hits.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateSelection {
    pub kept: Vec<VectorHit>,
    pub high_score: Vec<VectorHit>,
    pub cos_limit: f32,
}

/// Similarity floor for `hits` (best first). Lowered below the configured
/// limit when there are many hits but even the best is weak.
pub fn adaptive_cos_limit(hits: &[VectorHit], settings: &RetrievalSettings) -> f32 {
    let best = hits.first().map(|h| h.similarity).unwrap_or(0.0);
    if hits.len() > settings.adaptive_min_results && best < settings.cos_limit {
        best - settings.adaptive_step
    } else {
        settings.cos_limit
    }
}

/// Apply the similarity filter to `hits` sorted best first. Repeated
/// knowledge ids keep only their best hit.
pub fn select_candidates(hits: &[VectorHit], settings: &RetrievalSettings) -> CandidateSelection {
    let cos_limit = adaptive_cos_limit(hits, settings);
    let mut seen = HashSet::new();
    let mut kept = Vec::new();
    let mut high_score = Vec::new();
    let mut extra = 0usize;

    for (rank, hit) in hits.iter().enumerate() {
        if !seen.insert(hit.knowledge_id.as_str()) {
            continue;
        }
        let is_high = high_score.len() < settings.high_score_keep;
        if is_high {
            high_score.push(hit.clone());
        }

        let admissible = rank == 0
            || hit.similarity >= cos_limit
            || hit.original_length <= settings.short_content_len;
        if !admissible {
            continue;
        }
        if !is_high {
            if extra >= settings.max_extra_results {
                continue;
            }
            extra += 1;
        }
        kept.push(hit.clone());
    }

    CandidateSelection { kept, high_score, cos_limit }
}

fn contains(docs: &[RetrievedDocument], knowledge_id: &str) -> bool {
    docs.iter().any(|d| d.knowledge_id == knowledge_id)
}

pub struct RetrievalEngine {
    inference: Arc<dyn InferenceBackend>,
    knowledge: Arc<dyn KnowledgeStore>,
    pins: Arc<dyn PinStore>,
    cipher: Arc<dyn TextCipher>,
    settings: RetrievalSettings,
    /// Bound on each embed and rerank call.
    call_timeout: Duration,
}

impl RetrievalEngine {
    pub fn new(
        inference: Arc<dyn InferenceBackend>,
        knowledge: Arc<dyn KnowledgeStore>,
        pins: Arc<dyn PinStore>,
        cipher: Arc<dyn TextCipher>,
        settings: RetrievalSettings,
        call_timeout: Duration,
    ) -> Self {
        Self { inference, knowledge, pins, cipher, settings, call_timeout }
    }

    /// Embedding and search failures are returned; rerank and pin failures
    /// only degrade the result.
    pub async fn retrieve(&self, query: &RetrievalQuery) -> PipelineResult<RetrievalOutcome> {
        let embeddings = tokio::time::timeout(self.call_timeout, self.inference.embed(std::slice::from_ref(&query.query)))
            .await
            .map_err(|_| anyhow::anyhow!("embedding timed out after {}s", self.call_timeout.as_secs_f32()))
            .and_then(|r| r)
            .upstream_at("retrieval.embed")?;
        let vector = embeddings
            .vectors
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("embedding backend returned no vector"))
            .upstream_at("retrieval.embed")?;

        let hits = self
            .knowledge
            .query_similar(&query.filter, &vector, self.settings.top_k)
            .await
            .storage_at("retrieval.search")?;
        let selection = select_candidates(&hits, &self.settings);
        debug!(
            "Retrieval kept {} of {} hits (cos_limit {:.3})",
            selection.kept.len(),
            hits.len(),
            selection.cos_limit
        );

        let mut outcome = RetrievalOutcome {
            embedding_usage: embeddings.usage,
            candidates: hits.len(),
            ..RetrievalOutcome::default()
        };

        let mut wanted: Vec<&VectorHit> = selection.kept.iter().collect();
        for hit in &selection.high_score {
            if !selection.kept.iter().any(|k| k.knowledge_id == hit.knowledge_id) {
                wanted.push(hit);
            }
        }
        let fetched = self.load(&wanted).await?;
        let (survivors, mut reserve): (Vec<RetrievedDocument>, Vec<RetrievedDocument>) = fetched
            .into_iter()
            .partition(|doc| selection.kept.iter().any(|k| k.knowledge_id == doc.knowledge_id));

        let (mut documents, dropped) = self.rerank(&query.query, survivors, &mut outcome).await;

        if outcome.reranked {
            // The best raw matches survive whatever the reranker thought of them.
            reserve.extend(dropped);
            let mut restored = 0;
            for hit in &selection.high_score {
                if contains(&documents, &hit.knowledge_id) {
                    continue;
                }
                if let Some(pos) = reserve.iter().position(|d| d.knowledge_id == hit.knowledge_id) {
                    documents.push(reserve.swap_remove(pos));
                    restored += 1;
                }
            }
            if restored > 0 {
                debug!("Re-inserted {} high-score documents", restored);
            }
        }
        outcome.documents = documents;

        if let Some(conversation_id) = &query.conversation_id {
            self.merge_pins(conversation_id, &mut outcome).await;
        }

        info!(
            "Retrieved {} documents ({} candidates, reranked: {})",
            outcome.documents.len(),
            outcome.candidates,
            outcome.reranked
        );
        Ok(outcome)
    }

    /// Fetch and decrypt knowledge for `hits`, keeping their order.
    async fn load(&self, hits: &[&VectorHit]) -> PipelineResult<Vec<RetrievedDocument>> {
        if hits.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = hits.iter().map(|h| h.knowledge_id.clone()).collect();
        let rows = self.knowledge.get_knowledge(&ids).await.storage_at("retrieval.fetch")?;

        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(hit) = hits.iter().find(|h| h.knowledge_id == row.id) else {
                continue;
            };
            if let Some(doc) = self.open(row, hit.similarity, hit.original_length, false) {
                documents.push(doc);
            }
        }
        Ok(documents)
    }

    fn open(&self, row: Knowledge, similarity: f32, original_length: usize, pinned: bool) -> Option<RetrievedDocument> {
        match open_text(self.cipher.as_ref(), &row.content, row.encrypted) {
            Ok(content) => Some(RetrievedDocument {
                knowledge_id: row.id,
                title: row.title,
                content,
                similarity,
                original_length,
                rerank_score: None,
                pinned,
            }),
            Err(e) => {
                warn!("Skipping knowledge {} that failed to decrypt: {}", row.id, e);
                None
            }
        }
    }

    /// Returns the ranked documents and the ones the reranker left out.
    async fn rerank(
        &self,
        query: &str,
        documents: Vec<RetrievedDocument>,
        outcome: &mut RetrievalOutcome,
    ) -> (Vec<RetrievedDocument>, Vec<RetrievedDocument>) {
        if documents.is_empty() {
            return (documents, Vec::new());
        }
        let texts: Vec<String> = documents.iter().map(|d| d.content.clone()).collect();
        let ranked = match tokio::time::timeout(self.call_timeout, self.inference.rerank(query, &texts)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("timed out after {}s", self.call_timeout.as_secs_f32())),
        };
        match ranked {
            Ok(RerankOutcome::Ranked { scores, usage }) => {
                outcome.reranked = true;
                outcome.rerank_usage = usage;
                let mut slots: Vec<Option<RetrievedDocument>> = documents.into_iter().map(Some).collect();
                let mut ranked = Vec::with_capacity(scores.len());
                for score in scores {
                    if let Some(mut doc) = slots.get_mut(score.index).and_then(Option::take) {
                        doc.rerank_score = Some(score.score);
                        ranked.push(doc);
                    }
                }
                (ranked, slots.into_iter().flatten().collect())
            }
            Ok(RerankOutcome::Unsupported) => {
                debug!("Rerank unsupported, keeping similarity order");
                (documents, Vec::new())
            }
            Err(e) => {
                warn!("Rerank failed, keeping similarity order: {}", e);
                (documents, Vec::new())
            }
        }
    }

    async fn merge_pins(&self, conversation_id: &str, outcome: &mut RetrievalOutcome) {
        let pins = match self.pins.get_pins(conversation_id).await {
            Ok(pins) => pins,
            Err(e) => {
                warn!("Could not read pinned documents of {}: {}", conversation_id, e);
                return;
            }
        };
        let missing: Vec<String> = pins
            .knowledge_ids
            .into_iter()
            .filter(|id| !contains(&outcome.documents, id))
            .collect();
        if missing.is_empty() {
            return;
        }

        match self.knowledge.get_knowledge(&missing).await {
            Ok(rows) => {
                let before = outcome.documents.len();
                for row in rows {
                    let length = row.content.chars().count();
                    if let Some(doc) = self.open(row, 0.0, length, true) {
                        outcome.documents.push(doc);
                    }
                }
                debug!("Merged {} pinned documents", outcome.documents.len() - before);
            }
            Err(e) => warn!("Could not load pinned documents of {}: {}", conversation_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Plaintext;
    use crate::inference::{
        ChatMessage, ChatStream, Completion, Embeddings, GenerationOptions, RerankScore,
    };
    use crate::memory_db::schema::PinnedDocumentSet;
    use crate::memory_db::ChatDatabase;
    use async_trait::async_trait;
    use chrono::Utc;
    use proptest::prelude::*;

    fn hit(id: &str, similarity: f32, original_length: usize) -> VectorHit {
        VectorHit { knowledge_id: id.to_string(), similarity, original_length }
    }

    fn ids(hits: &[VectorHit]) -> Vec<&str> {
        hits.iter().map(|h| h.knowledge_id.as_str()).collect()
    }

    #[test]
    fn test_limit_stays_put_with_few_results() {
        let settings = RetrievalSettings::default();
        let hits = vec![hit("a", 0.9, 500), hit("b", 0.45, 500), hit("c", 0.2, 500)];
        let selection = select_candidates(&hits, &settings);
        assert!((selection.cos_limit - 0.5).abs() < 1e-6);
        assert_eq!(ids(&selection.kept), vec!["a"]);
        assert_eq!(ids(&selection.high_score), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_weak_best_score_lowers_limit() {
        let settings = RetrievalSettings::default();
        let mut hits = vec![
            hit("best", 0.45, 1000),
            hit("good", 0.40, 1000),
            hit("fair", 0.38, 1000),
            hit("short", 0.30, 150),
            hit("long", 0.30, 500),
        ];
        for i in 0..7 {
            hits.push(hit(&format!("noise{}", i), 0.1, 1000));
        }

        let selection = select_candidates(&hits, &settings);
        assert!((selection.cos_limit - 0.35).abs() < 1e-6);
        assert_eq!(ids(&selection.kept), vec!["best", "good", "fair", "short"]);
    }

    #[test]
    fn test_extra_results_are_capped() {
        let settings = RetrievalSettings::default();
        let hits: Vec<VectorHit> = (0..30).map(|i| hit(&format!("k{:02}", i), 0.9, 1000)).collect();
        let selection = select_candidates(&hits, &settings);
        assert_eq!(selection.kept.len(), settings.high_score_keep + settings.max_extra_results);
    }

    #[test]
    fn test_repeated_knowledge_keeps_best_chunk() {
        let settings = RetrievalSettings::default();
        let hits = vec![hit("a", 0.9, 1000), hit("a", 0.8, 100), hit("b", 0.7, 1000)];
        let selection = select_candidates(&hits, &settings);
        assert_eq!(ids(&selection.kept), vec!["a", "b"]);
        assert_eq!(selection.kept[0].similarity, 0.9);
    }

    proptest! {
        #[test]
        fn prop_selection_is_bounded_and_unique(
            scores in proptest::collection::vec((0.0f32..1.0, 0usize..1000, 0usize..8), 0..60)
        ) {
            let settings = RetrievalSettings::default();
            let mut hits: Vec<VectorHit> = scores
                .iter()
                .map(|(s, len, id)| hit(&format!("k{}", id), *s, *len))
                .collect();
            hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));

            let selection = select_candidates(&hits, &settings);
            prop_assert!(selection.kept.len() <= settings.high_score_keep + settings.max_extra_results);
            prop_assert!(selection.high_score.len() <= settings.high_score_keep);
            let unique: HashSet<&str> = selection.kept.iter().map(|h| h.knowledge_id.as_str()).collect();
            prop_assert_eq!(unique.len(), selection.kept.len());
            if let Some(first) = hits.first() {
                prop_assert_eq!(&selection.kept[0].knowledge_id, &first.knowledge_id);
            }
        }
    }

    enum RerankMode {
        Unsupported,
        Failing,
        Stalled,
        /// Returns only these indices, scored in the given order.
        Only(Vec<usize>),
    }

    struct FakeModel {
        rerank: RerankMode,
        embed_fails: bool,
        embed_stalls: bool,
    }

    impl FakeModel {
        fn reranking(rerank: RerankMode) -> Self {
            Self { rerank, embed_fails: false, embed_stalls: false }
        }
    }

    #[async_trait]
    impl InferenceBackend for FakeModel {
        async fn generate(&self, _: &[ChatMessage], _: &GenerationOptions) -> anyhow::Result<Completion> {
            Err(anyhow::anyhow!("not used"))
        }

        async fn generate_stream(&self, _: &[ChatMessage], _: &GenerationOptions) -> anyhow::Result<ChatStream> {
            Err(anyhow::anyhow!("not used"))
        }

        async fn embed(&self, texts: &[String]) -> anyhow::Result<Embeddings> {
            if self.embed_fails {
                return Err(anyhow::anyhow!("embedding backend down"));
            }
            if self.embed_stalls {
                std::future::pending::<()>().await;
            }
            Ok(Embeddings { vectors: texts.iter().map(|_| vec![1.0, 0.0]).collect(), usage: None })
        }

        async fn rerank(&self, _: &str, documents: &[String]) -> anyhow::Result<RerankOutcome> {
            match &self.rerank {
                RerankMode::Unsupported => Ok(RerankOutcome::Unsupported),
                RerankMode::Failing => Err(anyhow::anyhow!("reranker crashed")),
                RerankMode::Stalled => {
                    std::future::pending::<()>().await;
                    Ok(RerankOutcome::Unsupported)
                }
                RerankMode::Only(order) => Ok(RerankOutcome::Ranked {
                    scores: order
                        .iter()
                        .filter(|i| **i < documents.len())
                        .enumerate()
                        .map(|(rank, index)| RerankScore { index: *index, score: 1.0 - rank as f32 * 0.1 })
                        .collect(),
                    usage: None,
                }),
            }
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<ChatDatabase>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let db = Arc::new(ChatDatabase::open(&dir.path().join("chat.db")).unwrap());
            Self { _dir: dir, db }
        }

        /// A knowledge item whose vector scores `similarity` against the fake query embedding.
        fn add(&self, id: &str, similarity: f32, length: usize) {
            self.db
                .embeddings
                .store_knowledge(&Knowledge {
                    id: id.to_string(),
                    user_id: "alice".to_string(),
                    space_id: None,
                    resource: "knowledge".to_string(),
                    title: format!("title {}", id),
                    content: format!("content {}", id),
                    encrypted: false,
                    created_at: Utc::now(),
                })
                .unwrap();
            let y = (1.0 - similarity * similarity).max(0.0).sqrt();
            self.db.embeddings.store_vector(id, &[similarity, y], length).unwrap();
        }

        fn engine(&self, model: FakeModel) -> RetrievalEngine {
            self.engine_with_timeout(model, Duration::from_secs(10))
        }

        fn engine_with_timeout(&self, model: FakeModel, call_timeout: Duration) -> RetrievalEngine {
            RetrievalEngine::new(
                Arc::new(model),
                Arc::new(self.db.embeddings.clone()),
                Arc::new(self.db.pins.clone()),
                Arc::new(Plaintext),
                RetrievalSettings::default(),
                call_timeout,
            )
        }
    }

    fn query(conversation_id: Option<&str>) -> RetrievalQuery {
        RetrievalQuery {
            query: "what is in my notes".to_string(),
            filter: VectorFilter { user_id: "alice".to_string(), space_id: None, resources: Vec::new() },
            conversation_id: conversation_id.map(str::to_string),
        }
    }

    fn doc_ids(outcome: &RetrievalOutcome) -> Vec<&str> {
        outcome.documents.iter().map(|d| d.knowledge_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_unsupported_rerank_keeps_similarity_order() {
        let fx = Fixture::new();
        fx.add("k1", 0.95, 1000);
        fx.add("k2", 0.85, 1000);
        fx.add("k3", 0.75, 1000);
        fx.add("k4", 0.65, 1000);
        fx.add("k5", 0.10, 1000);

        let outcome = fx
            .engine(FakeModel::reranking(RerankMode::Unsupported))
            .retrieve(&query(None))
            .await
            .unwrap();
        assert!(!outcome.reranked);
        assert_eq!(outcome.candidates, 5);
        assert_eq!(doc_ids(&outcome), vec!["k1", "k2", "k3", "k4"]);
        assert_eq!(outcome.documents[0].content, "content k1");
    }

    #[tokio::test]
    async fn test_rerank_failure_degrades_to_similarity_order() {
        let fx = Fixture::new();
        fx.add("k1", 0.95, 1000);
        fx.add("k2", 0.85, 1000);

        let outcome = fx
            .engine(FakeModel::reranking(RerankMode::Failing))
            .retrieve(&query(None))
            .await
            .unwrap();
        assert_eq!(doc_ids(&outcome), vec!["k1", "k2"]);
    }

    #[tokio::test]
    async fn test_high_score_documents_survive_rerank() {
        let fx = Fixture::new();
        fx.add("k1", 0.95, 1000);
        fx.add("k2", 0.85, 1000);
        fx.add("k3", 0.75, 1000);
        fx.add("k4", 0.65, 1000);

        // The reranker only likes k4 then k2.
        let outcome = fx
            .engine(FakeModel::reranking(RerankMode::Only(vec![3, 1])))
            .retrieve(&query(None))
            .await
            .unwrap();
        assert!(outcome.reranked);
        assert_eq!(doc_ids(&outcome), vec!["k4", "k2", "k1", "k3"]);
        assert!(outcome.documents[0].rerank_score.is_some());
        assert!(outcome.documents[2].rerank_score.is_none());
    }

    #[tokio::test]
    async fn test_pinned_documents_are_merged_once() {
        let fx = Fixture::new();
        fx.add("k1", 0.95, 1000);
        fx.add("pinned", 0.0, 1000);
        let mut pins = PinnedDocumentSet::default();
        pins.merge(&["k1".to_string(), "pinned".to_string(), "gone".to_string()]);
        fx.db.pins.set_pins("c1", &pins).await.unwrap();

        let outcome = fx
            .engine(FakeModel::reranking(RerankMode::Unsupported))
            .retrieve(&query(Some("c1")))
            .await
            .unwrap();
        assert_eq!(doc_ids(&outcome), vec!["k1", "pinned"]);
        assert!(!outcome.documents[0].pinned);
        assert!(outcome.documents[1].pinned);
    }

    #[tokio::test]
    async fn test_embedding_failure_is_fatal() {
        let fx = Fixture::new();
        fx.add("k1", 0.95, 1000);
        let err = fx
            .engine(FakeModel { rerank: RerankMode::Unsupported, embed_fails: true, embed_stalls: false })
            .retrieve(&query(None))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Upstream);
        assert_eq!(err.trace(), vec!["retrieval.embed"]);
    }

    #[tokio::test]
    async fn test_stalled_embedding_times_out() {
        let fx = Fixture::new();
        fx.add("k1", 0.95, 1000);
        let model = FakeModel { rerank: RerankMode::Unsupported, embed_fails: false, embed_stalls: true };
        let err = fx
            .engine_with_timeout(model, Duration::from_millis(50))
            .retrieve(&query(None))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Upstream);
        assert_eq!(err.trace(), vec!["retrieval.embed"]);
    }

    #[tokio::test]
    async fn test_stalled_rerank_degrades_to_similarity_order() {
        let fx = Fixture::new();
        fx.add("k1", 0.95, 1000);
        fx.add("k2", 0.85, 1000);

        let outcome = fx
            .engine_with_timeout(FakeModel::reranking(RerankMode::Stalled), Duration::from_millis(50))
            .retrieve(&query(None))
            .await
            .unwrap();
        assert!(!outcome.reranked);
        assert_eq!(doc_ids(&outcome), vec!["k1", "k2"]);
    }

    #[test]
    fn test_render_respects_budget() {
        let outcome = RetrievalOutcome {
            documents: vec![
                RetrievedDocument {
                    knowledge_id: "a".into(),
                    title: "A".into(),
                    content: "alpha".into(),
                    similarity: 0.9,
                    original_length: 5,
                    rerank_score: None,
                    pinned: false,
                },
                RetrievedDocument {
                    knowledge_id: "b".into(),
                    title: "B".into(),
                    content: "b".repeat(100),
                    similarity: 0.8,
                    original_length: 100,
                    rerank_score: None,
                    pinned: false,
                },
            ],
            ..RetrievalOutcome::default()
        };
        assert_eq!(outcome.render(50), "[1] A\nalpha");
    }
}
