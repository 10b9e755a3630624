//! Agent strategies.
//!
//! Every strategy has the same three steps: `init_turn` gathers supporting
//! knowledge, `build_context` assembles the model input and `respond` drives
//! the model into a response channel. Dispatch is an exhaustive match on
//! [`AgentKind`].

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PipelineSettings;
use crate::context_engine::{
    AssembleRequest, AssembledContext, ContextAssembler, HistoryCutoff, RetrievalEngine, RetrievalOutcome,
    RetrievalQuery,
};
use crate::error::{BoundaryExt, PipelineError, PipelineResult};
use crate::inference::{ChatMessage, GenerationOptions, InferenceBackend};
use crate::memory_db::schema::{Progress, VectorFilter};
use crate::pipeline::response_channel::{ResponseChannel, ResponseContent};
use crate::utils::TextUtils;

const DOCUMENT_SECTION_CHARS: usize = 12_000;

const JOURNAL_PROMPT: &str =
    "You are answering questions about the user's own journal. Ground every answer in the entries below.";

const BUTLER_PROMPT: &str =
    "You are a personal butler. Help the user organise their knowledge base and answer plainly.";

const QUERY_REWRITE_PROMPT: &str = "Rewrite the user's question as a short keyword search query. \
Reply with the query only.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    #[default]
    Normal,
    Butler,
    Journal,
    AutoAgent,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Normal => "normal",
            AgentKind::Butler => "butler",
            AgentKind::Journal => "journal",
            AgentKind::AutoAgent => "auto_agent",
        }
    }

    fn uses_retrieval(&self) -> bool {
        !matches!(self, AgentKind::Butler)
    }
}

/// Per-request state threaded through the strategy steps.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub conversation_id: String,
    pub user_turn_id: String,
    /// Plaintext of the message being answered.
    pub query: String,
    pub filter: VectorFilter,
    /// Query rewrites performed so far by the auto agent.
    pub depth: u32,
    pub cancel: CancellationToken,
}

pub struct AgentRunner {
    inference: Arc<dyn InferenceBackend>,
    assembler: Arc<ContextAssembler>,
    retrieval: Arc<RetrievalEngine>,
    settings: PipelineSettings,
}

impl AgentRunner {
    pub fn new(
        inference: Arc<dyn InferenceBackend>,
        assembler: Arc<ContextAssembler>,
        retrieval: Arc<RetrievalEngine>,
        settings: PipelineSettings,
    ) -> Self {
        Self { inference, assembler, retrieval, settings }
    }

    /// Supporting knowledge for the answer. Retrieval failures degrade to an
    /// answer without documents.
    pub async fn init_turn(&self, kind: AgentKind, ctx: &mut RequestContext) -> PipelineResult<RetrievalOutcome> {
        if !kind.uses_retrieval() {
            return Ok(RetrievalOutcome::default());
        }

        let mut filter = ctx.filter.clone();
        if kind == AgentKind::Journal {
            filter.resources = vec![self.settings.retrieval.journal_resource.clone()];
        }

        let mut query = ctx.query.clone();
        loop {
            let outcome = self.retrieve(ctx, &query, &filter).await;
            let exhausted = kind != AgentKind::AutoAgent || ctx.depth >= self.settings.max_agent_depth;
            if !outcome.documents.is_empty() || exhausted {
                return Ok(outcome);
            }
            ctx.depth += 1;
            query = self.rewrite_query(ctx, &query).await?;
            info!("Auto agent retrying retrieval (depth {}) with {:?}", ctx.depth, query);
        }
    }

    async fn retrieve(&self, ctx: &RequestContext, query: &str, filter: &VectorFilter) -> RetrievalOutcome {
        let request = RetrievalQuery {
            query: query.to_string(),
            filter: filter.clone(),
            conversation_id: Some(ctx.conversation_id.clone()),
        };
        match self.retrieval.retrieve(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Retrieval failed for {}, answering without documents: {}", ctx.conversation_id, e);
                RetrievalOutcome::default()
            }
        }
    }

    async fn rewrite_query(&self, ctx: &RequestContext, query: &str) -> PipelineResult<String> {
        let messages = [ChatMessage::system(QUERY_REWRITE_PROMPT), ChatMessage::user(query)];
        let options = GenerationOptions { max_tokens: 64, temperature: 0.0 };
        let completion = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(PipelineError::canceled().at("agent.rewrite")),
            result = tokio::time::timeout(self.settings.retrieval_timeout, self.inference.generate(&messages, &options)) => result
                .map_err(|_| anyhow::anyhow!("query rewrite timed out after {}s", self.settings.retrieval_timeout.as_secs()))
                .and_then(|r| r)
                .upstream_at("agent.rewrite")?,
        };
        let rewritten = TextUtils::normalize_whitespace(&completion.text()).trim().to_string();
        if rewritten.is_empty() {
            Ok(query.to_string())
        } else {
            Ok(rewritten)
        }
    }

    pub async fn build_context(
        &self,
        kind: AgentKind,
        ctx: &RequestContext,
        retrieval: &RetrievalOutcome,
    ) -> PipelineResult<AssembledContext> {
        let base = match kind {
            AgentKind::Normal | AgentKind::AutoAgent => self.settings.system_prompt.clone(),
            AgentKind::Journal => Some(JOURNAL_PROMPT.to_string()),
            AgentKind::Butler => Some(BUTLER_PROMPT.to_string()),
        };
        let documents = retrieval.render(DOCUMENT_SECTION_CHARS);
        let system_prompt = match (base, documents.is_empty()) {
            (base, true) => base,
            (Some(base), false) => Some(format!("{}\n\nReference documents:\n{}", base, documents)),
            (None, false) => Some(format!("Reference documents:\n{}", documents)),
        };

        let request = AssembleRequest {
            conversation_id: ctx.conversation_id.clone(),
            cutoff: HistoryCutoff::After(ctx.user_turn_id.clone()),
            system_prompt,
            prompt: None,
        };
        self.assembler.assemble(&request).await
    }

    /// Stream the model's answer into `channel`. A stop request or the model
    /// deadline both end the answer as canceled.
    pub async fn respond(
        &self,
        kind: AgentKind,
        ctx: &RequestContext,
        context: &AssembledContext,
        channel: &mut dyn ResponseChannel,
    ) -> PipelineResult<()> {
        if kind == AgentKind::Butler {
            channel
                .receive(ResponseContent::ToolStatus(json!({"agent": "butler", "status": "thinking"})), Progress::Generating)
                .await?;
        }

        let deadline = tokio::time::sleep(self.settings.model_timeout);
        tokio::pin!(deadline);

        let options = GenerationOptions {
            max_tokens: self.settings.max_answer_tokens,
            temperature: self.settings.temperature,
        };
        let mut stream = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(PipelineError::canceled().at("agent.respond")),
            _ = &mut deadline => return Err(timed_out(self.settings.model_timeout)),
            result = self.inference.generate_stream(&context.messages, &options) => {
                result.upstream_at("agent.respond")?
            }
        };

        let mut chunks = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(PipelineError::canceled().at("agent.respond")),
                _ = &mut deadline => return Err(timed_out(self.settings.model_timeout)),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    if chunk.delta.is_empty() {
                        continue;
                    }
                    chunks += 1;
                    channel.receive(ResponseContent::Text(chunk.delta), Progress::Generating).await?;
                }
                Some(Err(e)) => return Err(PipelineError::upstream(e).at("agent.respond")),
                None => break,
            }
        }

        if kind == AgentKind::Butler {
            channel
                .receive(ResponseContent::ToolStatus(json!({"agent": "butler", "status": "done"})), Progress::Generating)
                .await?;
        }
        debug!("Agent {} streamed {} chunks for {}", kind.as_str(), chunks, ctx.conversation_id);
        Ok(())
    }
}

fn timed_out(limit: Duration) -> PipelineError {
    warn!("Model call exceeded {:?}", limit);
    PipelineError::canceled().at("agent.respond")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_kind_wire_names() {
        let kinds: Vec<AgentKind> = serde_json::from_str(r#"["normal","butler","journal","auto_agent"]"#).unwrap();
        assert_eq!(
            kinds,
            vec![AgentKind::Normal, AgentKind::Butler, AgentKind::Journal, AgentKind::AutoAgent]
        );
        for kind in kinds {
            assert_eq!(serde_json::to_value(kind).unwrap(), kind.as_str());
        }
    }

    #[test]
    fn test_only_butler_skips_retrieval() {
        assert!(AgentKind::Normal.uses_retrieval());
        assert!(AgentKind::Journal.uses_retrieval());
        assert!(AgentKind::AutoAgent.uses_retrieval());
        assert!(!AgentKind::Butler.uses_retrieval());
    }
}
