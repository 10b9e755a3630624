//! Token-bounded model context for one request.
//!
//! History after the latest summary boundary is replayed turn by turn. When it
//! grows past the turn ceiling or the token budget, the older part is folded into
//! a new summary and assembly runs exactly once more.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::summary_generator::SummaryGenerator;
use crate::crypto::{open_text, TextCipher};
use crate::error::{BoundaryExt, PipelineError, PipelineResult, ResultExt};
use crate::inference::ChatMessage;
use crate::memory::{SummaryStore, TurnStore};
use crate::memory_db::schema::{ConversationSummary, Progress};
use crate::utils::TextUtils;

/// Where replayed history stops, relative to the turn being answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryCutoff {
    /// Replay everything stored.
    None,
    /// Stop at the first turn whose id sorts after this one.
    After(String),
    /// Stop at this turn or anything after it.
    AtOrAfter(String),
}

impl HistoryCutoff {
    pub fn stops_at(&self, turn_id: &str) -> bool {
        match self {
            HistoryCutoff::None => false,
            HistoryCutoff::After(id) => turn_id > id.as_str(),
            HistoryCutoff::AtOrAfter(id) => turn_id >= id.as_str(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssembleRequest {
    pub conversation_id: String,
    pub cutoff: HistoryCutoff,
    /// Leading system entry; the summary digest is appended to it.
    pub system_prompt: Option<String>,
    /// Appended after the replayed history.
    pub prompt: Option<ChatMessage>,
}

#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub messages: Vec<ChatMessage>,
    pub summary: Option<ConversationSummary>,
    /// Ids of the replayed turns, oldest first.
    pub turn_ids: Vec<String>,
    pub estimated_tokens: usize,
    /// A summary was generated while assembling.
    pub summarized: bool,
}

#[derive(Debug, Clone)]
pub struct AssemblerLimits {
    pub max_context_tokens: usize,
    pub max_history_turns: usize,
    pub min_turns_for_summary: usize,
}

impl Default for AssemblerLimits {
    fn default() -> Self {
        Self {
            max_context_tokens: 6000,
            max_history_turns: 20,
            min_turns_for_summary: 4,
        }
    }
}

/// One pass over storage.
struct Pass {
    context: AssembledContext,
    /// Stored turns ahead of the cutoff, whether replayed or not.
    raw_count: usize,
    kept: Vec<ChatMessage>,
}

enum Verdict {
    Fits,
    Summarize,
    Insufficient(String),
}

pub struct ContextAssembler {
    turns: Arc<dyn TurnStore>,
    summaries: Arc<dyn SummaryStore>,
    summarizer: Arc<SummaryGenerator>,
    cipher: Arc<dyn TextCipher>,
    limits: AssemblerLimits,
}

impl ContextAssembler {
    pub fn new(
        turns: Arc<dyn TurnStore>,
        summaries: Arc<dyn SummaryStore>,
        summarizer: Arc<SummaryGenerator>,
        cipher: Arc<dyn TextCipher>,
        limits: AssemblerLimits,
    ) -> Self {
        Self { turns, summaries, summarizer, cipher, limits }
    }

    pub async fn assemble(&self, request: &AssembleRequest) -> PipelineResult<AssembledContext> {
        let mut summarized = false;

        for attempt in 0..2 {
            let pass = self.collect(request).await.at("context.assemble")?;
            let verdict = self.judge(&pass, attempt);

            match verdict {
                Verdict::Fits => {
                    debug!(
                        "Context for {}: {} turns, ~{} tokens (attempt {})",
                        request.conversation_id,
                        pass.context.turn_ids.len(),
                        pass.context.estimated_tokens,
                        attempt
                    );
                    let mut context = pass.context;
                    context.summarized = summarized;
                    return Ok(context);
                }
                Verdict::Insufficient(detail) => {
                    warn!("Context for {} is insufficient: {}", request.conversation_id, detail);
                    return Err(PipelineError::insufficient_context(detail).at("context.assemble"));
                }
                Verdict::Summarize => {
                    self.summarize_prefix(request, &pass).await.at("context.assemble")?;
                    summarized = true;
                }
            }
        }

        Err(PipelineError::insufficient_context("history still overflows after summarization")
            .at("context.assemble"))
    }

    fn judge(&self, pass: &Pass, attempt: u32) -> Verdict {
        let over_tokens = pass.context.estimated_tokens > self.limits.max_context_tokens;
        let over_count = pass.raw_count > self.limits.max_history_turns;
        if !over_tokens && !over_count {
            return Verdict::Fits;
        }

        if attempt > 0 {
            // Only the token budget is binding after the one allowed summary.
            return if over_tokens {
                Verdict::Insufficient(format!(
                    "~{} tokens exceed the budget of {} after summarization",
                    pass.context.estimated_tokens, self.limits.max_context_tokens
                ))
            } else {
                Verdict::Fits
            };
        }

        if pass.kept.is_empty() || pass.kept.len() < self.limits.min_turns_for_summary {
            return if over_tokens {
                Verdict::Insufficient(format!(
                    "{} turns (~{} tokens) exceed the budget of {} and are too few to summarize",
                    pass.kept.len(),
                    pass.context.estimated_tokens,
                    self.limits.max_context_tokens
                ))
            } else {
                Verdict::Fits
            };
        }

        Verdict::Summarize
    }

    async fn collect(&self, request: &AssembleRequest) -> PipelineResult<Pass> {
        let conversation_id = request.conversation_id.as_str();
        let summary = self
            .summaries
            .latest_summary(conversation_id)
            .await
            .storage_at("summaries.latest")?;

        let mut messages = Vec::new();
        let digest = summary.as_ref().map(|s| s.digest.as_str()).filter(|d| !d.trim().is_empty());
        match (request.system_prompt.as_deref(), digest) {
            (Some(base), Some(digest)) => {
                messages.push(ChatMessage::system(format!("{}\n\nConversation so far:\n{}", base, digest)))
            }
            (Some(base), None) => messages.push(ChatMessage::system(base)),
            (None, Some(digest)) => messages.push(ChatMessage::system(format!("Conversation so far:\n{}", digest))),
            (None, None) => {}
        }

        let boundary = summary.as_ref().map(|s| s.boundary_turn_id.as_str());
        let stored = self
            .turns
            .list_turns_after(conversation_id, boundary)
            .await
            .storage_at("turns.list")?;

        let mut raw_count = 0;
        let mut kept = Vec::new();
        let mut turn_ids = Vec::new();
        for turn in stored {
            if request.cutoff.stops_at(&turn.id) {
                break;
            }
            raw_count += 1;
            if turn.progress != Progress::Complete {
                continue;
            }
            let text = open_text(self.cipher.as_ref(), &turn.text, turn.encrypted).storage_at("turns.decrypt")?;
            if TextUtils::is_noise(&text) {
                continue;
            }
            kept.push(ChatMessage::new(turn.role, text));
            turn_ids.push(turn.id);
        }

        messages.extend(kept.iter().cloned());
        if let Some(prompt) = &request.prompt {
            messages.push(prompt.clone());
        }
        let estimated_tokens = TextUtils::estimate_message_tokens(&messages);

        Ok(Pass {
            context: AssembledContext {
                messages,
                summary,
                turn_ids,
                estimated_tokens,
                summarized: false,
            },
            raw_count,
            kept,
        })
    }

    /// Fold everything but the most recent turns into a new summary.
    async fn summarize_prefix(&self, request: &AssembleRequest, pass: &Pass) -> PipelineResult<()> {
        let kept = pass.kept.len();
        // Leave the last 3 turns (2 for very short histories) outside the digest.
        let boundary_idx = if kept >= 3 { kept - 3 } else { kept.saturating_sub(2) };
        let Some(boundary_turn_id) = pass.context.turn_ids.get(boundary_idx) else {
            return Err(PipelineError::insufficient_context("no replayed turns to summarize"));
        };
        let mut prefix: Vec<ChatMessage> = pass.kept[..=boundary_idx].to_vec();

        let previous_digest = pass.context.summary.as_ref().map(|s| s.digest.as_str());
        let budget = self
            .limits
            .max_context_tokens
            .saturating_sub(self.summarizer.framing_tokens(previous_digest));
        fit_prefix(&mut prefix, budget);

        info!(
            "Summarizing {} of {} turns in {} (boundary {})",
            prefix.len(),
            kept,
            request.conversation_id,
            boundary_turn_id
        );
        self.summarizer
            .generate(&request.conversation_id, boundary_turn_id, previous_digest, &prefix)
            .await?;
        Ok(())
    }
}

/// Drop the oldest entries until the prefix fits `budget`; a lone oversized
/// entry is cut down instead.
fn fit_prefix(prefix: &mut Vec<ChatMessage>, budget: usize) {
    let mut dropped = 0;
    while prefix.len() > 1 && TextUtils::estimate_message_tokens(prefix) > budget {
        prefix.remove(0);
        dropped += 1;
    }
    if dropped > 0 {
        warn!("Dropped {} oldest turns from an oversized summary prefix", dropped);
    }
    if let Some(only) = prefix.first_mut() {
        if TextUtils::estimate_message_tokens(std::slice::from_ref(only)) > budget {
            let max_chars = budget.saturating_sub(crate::utils::text_utils::MESSAGE_OVERHEAD_TOKENS) * 4;
            only.content = TextUtils::preview(&only.content, max_chars).into_owned();
        }
    }
}
