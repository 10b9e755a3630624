//! Request lifecycle: one AI request per conversation at a time.
//!
//! `accept` takes the conversation lease, rejects replays, assigns the next
//! sequence and commits the user turn. `run` dispatches the agent strategy
//! into a response channel and always ends in a terminal assistant state.
//! The lease is held until `run` finishes.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::agents::{AgentKind, AgentRunner, RequestContext};
use super::background::spawn_detached;
use super::cancel_registry::{CancelRegistration, CancelRegistry};
use super::response_channel::{
    collect_text, BatchChannel, CompletionCallback, ReplyInit, ReplyOutcome, ResponseChannel, StreamingChannel,
};
use crate::config::PipelineSettings;
use crate::context_engine::{AssemblerLimits, ContextAssembler, RetrievalEngine, SummaryGenerator};
use crate::crypto::TextCipher;
use crate::error::{BoundaryExt, PipelineError, PipelineResult};
use crate::inference::{ChatMessage, GenerationOptions, InferenceBackend};
use crate::memory::{KnowledgeStore, PinStore, SummaryStore, TurnStore};
use crate::memory_db::schema::{ConversationTurn, Progress, Role, VectorFilter};
use crate::metrics;
use crate::transport::{
    publish_to_conversation, request_lock_key, DedupLock, EventPublisher, LockGuard, TurnCreatedEvent,
    TURN_CREATED_EVENT,
};
use crate::utils::TextUtils;

const TITLE_PROMPT: &str = "Write a title of at most six words for a conversation that starts with \
the following message. Reply with the title only.";
const TITLE_MAX_CHARS: usize = 60;

/// One inbound chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub conversation_id: String,
    /// Client-assigned, time-sortable turn id. Replays are rejected.
    pub turn_id: String,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub agent: AgentKind,
    #[serde(default)]
    pub stream: bool,
    /// Knowledge scope for retrieval.
    #[serde(default)]
    pub filter: VectorFilter,
}

/// Collaborators the pipeline consumes.
#[derive(Clone)]
pub struct PipelineDeps {
    pub turns: Arc<dyn TurnStore>,
    pub summaries: Arc<dyn SummaryStore>,
    pub knowledge: Arc<dyn KnowledgeStore>,
    pub pins: Arc<dyn PinStore>,
    pub inference: Arc<dyn InferenceBackend>,
    pub publisher: Arc<dyn EventPublisher>,
    pub lock: Arc<dyn DedupLock>,
    pub cipher: Arc<dyn TextCipher>,
}

/// A committed user turn waiting for its answer. Holds the conversation lease.
pub struct AcceptedRequest {
    request: ChatRequest,
    user_turn: ConversationTurn,
    assistant_turn_id: String,
    registration: CancelRegistration,
    _lease: LockGuard,
    started: Instant,
}

impl AcceptedRequest {
    pub fn user_turn(&self) -> &ConversationTurn {
        &self.user_turn
    }

    pub fn assistant_turn_id(&self) -> &str {
        &self.assistant_turn_id
    }

    /// Sequence the assistant turn will get.
    pub fn assistant_sequence(&self) -> i64 {
        self.user_turn.sequence + 1
    }
}

pub struct RequestCoordinator {
    turns: Arc<dyn TurnStore>,
    pins: Arc<dyn PinStore>,
    inference: Arc<dyn InferenceBackend>,
    publisher: Arc<dyn EventPublisher>,
    lock: Arc<dyn DedupLock>,
    agents: AgentRunner,
    cancels: Arc<CancelRegistry>,
    settings: PipelineSettings,
}

impl RequestCoordinator {
    pub fn new(deps: PipelineDeps, settings: PipelineSettings) -> Self {
        let summarizer = Arc::new(SummaryGenerator::new(
            deps.inference.clone(),
            deps.summaries.clone(),
            settings.summary_prompt.clone(),
            settings.summary_timeout,
        ));
        let assembler = Arc::new(ContextAssembler::new(
            deps.turns.clone(),
            deps.summaries.clone(),
            summarizer,
            deps.cipher.clone(),
            AssemblerLimits {
                max_context_tokens: settings.max_context_tokens,
                max_history_turns: settings.max_history_turns,
                min_turns_for_summary: settings.min_turns_for_summary,
            },
        ));
        let retrieval = Arc::new(RetrievalEngine::new(
            deps.inference.clone(),
            deps.knowledge.clone(),
            deps.pins.clone(),
            deps.cipher.clone(),
            settings.retrieval.clone(),
            settings.retrieval_timeout,
        ));
        let agents = AgentRunner::new(deps.inference.clone(), assembler, retrieval, settings.clone());

        Self {
            turns: deps.turns,
            pins: deps.pins,
            inference: deps.inference,
            publisher: deps.publisher,
            lock: deps.lock,
            agents,
            cancels: Arc::new(CancelRegistry::new()),
            settings,
        }
    }

    /// Accept and answer `request`. Contention and bookkeeping failures are
    /// returned as errors; everything after the user turn is committed ends
    /// up in the outcome instead.
    pub async fn handle(&self, request: ChatRequest) -> PipelineResult<ReplyOutcome> {
        let accepted = self.accept(request).await?;
        Ok(self.run(accepted).await)
    }

    pub async fn accept(&self, request: ChatRequest) -> PipelineResult<AcceptedRequest> {
        metrics::inc_request(request.agent.as_str());
        let conversation_id = request.conversation_id.clone();

        let key = request_lock_key(&conversation_id);
        let lease = LockGuard::acquire(self.lock.clone(), key, self.settings.lock_ttl)
            .storage_at("coordinator.lock")?
            .ok_or_else(|| {
                metrics::inc_contention("duplicate_request");
                warn!("Rejected concurrent AI request for conversation {}", conversation_id);
                PipelineError::duplicate_request(&conversation_id)
            })?;

        let existing = self
            .bookkeeping("coordinator.idempotency", self.turns.get_turn(&request.turn_id))
            .await?;
        if existing.is_some() {
            metrics::inc_contention("already_exists");
            return Err(PipelineError::already_exists(&request.turn_id));
        }

        let sequence = self
            .bookkeeping("coordinator.sequence", self.turns.latest_sequence(&conversation_id))
            .await?
            + 1;

        let user_turn = ConversationTurn {
            id: request.turn_id.clone(),
            conversation_id: conversation_id.clone(),
            role: Role::User,
            text: request.text.clone(),
            encrypted: false,
            progress: Progress::Complete,
            sequence,
            preview: Some(TextUtils::preview(&request.text, self.settings.preview_chars).into_owned()),
            attachments: request.attachments.clone(),
            created_at: Utc::now(),
        };
        self.commit_user_turn(&user_turn).await?;

        let assistant_turn_id = Uuid::now_v7().to_string();
        let registration = self.cancels.register(&assistant_turn_id);
        info!(
            "Accepted turn {} (sequence {}) in {}; answering as {} with {}",
            user_turn.id,
            sequence,
            conversation_id,
            assistant_turn_id,
            request.agent.as_str()
        );

        Ok(AcceptedRequest {
            request,
            user_turn,
            assistant_turn_id,
            registration,
            _lease: lease,
            started: Instant::now(),
        })
    }

    /// Store the user turn and announce it; the row is removed again when
    /// the announcement fails.
    async fn commit_user_turn(&self, turn: &ConversationTurn) -> PipelineResult<()> {
        self.bookkeeping("coordinator.persist_user_turn", self.turns.create_turn(turn))
            .await?;

        let event = TurnCreatedEvent::from(turn);
        let published =
            publish_to_conversation(self.publisher.as_ref(), &turn.conversation_id, TURN_CREATED_EVENT, &event).await;
        if let Err(e) = published {
            if let Err(rollback) = self.turns.delete_turn(&turn.id).await {
                error!("Failed to roll back turn {} after publish failure: {}", turn.id, rollback);
            }
            return Err(PipelineError::storage(e).at("coordinator.publish_user_turn"));
        }
        Ok(())
    }

    async fn bookkeeping<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> PipelineResult<T> {
        match tokio::time::timeout(self.settings.bookkeeping_timeout, call).await {
            Ok(result) => result.storage_at(operation),
            Err(_) => Err(PipelineError::storage(anyhow::anyhow!(
                "timed out after {:?}",
                self.settings.bookkeeping_timeout
            ))
            .at(operation)),
        }
    }

    /// Answer an accepted request. Never fails: problems end as a failed or
    /// canceled assistant turn.
    pub async fn run(&self, accepted: AcceptedRequest) -> ReplyOutcome {
        metrics::inc_active();
        let AcceptedRequest { request, user_turn, assistant_turn_id, registration, _lease, started } = accepted;

        let mut ctx = RequestContext {
            conversation_id: request.conversation_id.clone(),
            user_turn_id: user_turn.id.clone(),
            query: request.text.clone(),
            filter: request.filter.clone(),
            depth: 0,
            cancel: registration.token(),
        };
        let init = ReplyInit {
            conversation_id: request.conversation_id.clone(),
            user_turn_id: user_turn.id.clone(),
            turn_id: assistant_turn_id,
            sequence: user_turn.sequence + 1,
            related_documents: Vec::new(),
        };
        let callback = self.completion_callback(&request);

        let outcome = if request.stream {
            let mut channel =
                StreamingChannel::new(self.turns.clone(), self.publisher.clone(), self.settings.preview_chars)
                    .on_complete(callback);
            self.dispatch(request.agent, &mut ctx, init, &mut channel).await
        } else {
            let (channel, receiver) = BatchChannel::new(self.settings.batch_channel_capacity);
            let collector = tokio::spawn(collect_text(receiver));
            let mut channel = channel.on_complete(callback);
            let mut outcome = self.dispatch(request.agent, &mut ctx, init, &mut channel).await;
            drop(channel);
            match collector.await {
                Ok(text) => outcome.text = Some(text),
                Err(e) => error!("Batch collector for {} failed: {}", outcome.turn_id, e),
            }
            outcome
        };

        drop(registration);
        metrics::dec_active();
        metrics::observe_reply_duration(started.elapsed().as_secs_f64());
        info!(
            "Turn {} in {} finished {} after {:?}",
            outcome.turn_id,
            outcome.conversation_id,
            outcome.progress.as_str(),
            started.elapsed()
        );
        outcome
    }

    async fn dispatch(
        &self,
        kind: AgentKind,
        ctx: &mut RequestContext,
        mut init: ReplyInit,
        channel: &mut dyn ResponseChannel,
    ) -> ReplyOutcome {
        let retrieval = self.agents.init_turn(kind, ctx).await;
        if let Ok(found) = &retrieval {
            init.related_documents = found.knowledge_ids();
        }
        if let Err(e) = channel.recv_init(init).await {
            error!("Failed to open assistant turn in {}: {}", ctx.conversation_id, e);
            return channel.done(Err(e)).await;
        }

        let result = match retrieval {
            Ok(found) => match self.agents.build_context(kind, ctx, &found).await {
                Ok(context) => self.agents.respond(kind, ctx, &context, channel).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        let mode = if channel.is_stream() { "streamed" } else { "batch" };
        match &result {
            Err(e) if e.is_canceled() => info!("{} answer in {} stopped: {}", mode, ctx.conversation_id, e),
            Err(e) => error!("{} answer in {} failed: {}", mode, ctx.conversation_id, e),
            Ok(()) => {}
        }
        channel.done(result).await
    }

    /// Secondary effects of a finished answer, detached from the request.
    fn completion_callback(&self, request: &ChatRequest) -> CompletionCallback {
        let pins = self.pins.clone();
        let turns = self.turns.clone();
        let inference = self.inference.clone();
        let auto_title = self.settings.auto_title;
        let question = request.text.clone();

        Box::new(move |outcome: &ReplyOutcome| {
            if outcome.progress != Progress::Complete {
                return;
            }
            let conversation_id = outcome.conversation_id.clone();

            if !outcome.related_documents.is_empty() {
                let ids = outcome.related_documents.clone();
                let conversation_id = conversation_id.clone();
                spawn_detached("pin_documents", async move {
                    pin_documents(pins.as_ref(), &conversation_id, &ids).await
                });
            }
            if auto_title {
                spawn_detached("auto_title", async move {
                    name_conversation(turns.as_ref(), inference.as_ref(), &conversation_id, &question).await
                });
            }
        })
    }

    /// Remove a conversation with all its turns. Refused while an answer for
    /// it is running.
    pub async fn delete_conversation(&self, conversation_id: &str) -> PipelineResult<usize> {
        let key = request_lock_key(conversation_id);
        let _lease = LockGuard::acquire(self.lock.clone(), key, self.settings.lock_ttl)
            .storage_at("coordinator.delete_lock")?
            .ok_or_else(|| PipelineError::duplicate_request(conversation_id))?;
        let deleted = self
            .bookkeeping("coordinator.delete_conversation", self.turns.delete_conversation(conversation_id))
            .await?;
        info!("Deleted conversation {} ({} turns)", conversation_id, deleted);
        Ok(deleted)
    }

    /// Stop the answer being generated under `turn_id`.
    pub fn stop(&self, turn_id: &str) -> bool {
        self.cancels.cancel(turn_id)
    }

    pub fn active_answers(&self) -> usize {
        self.cancels.active()
    }
}

async fn pin_documents(pins: &dyn PinStore, conversation_id: &str, ids: &[String]) -> anyhow::Result<()> {
    let mut pinned = pins.get_pins(conversation_id).await?;
    let added = pinned.merge(ids);
    if added > 0 {
        pins.set_pins(conversation_id, &pinned).await?;
        info!("Pinned {} documents in {}", added, conversation_id);
    }
    Ok(())
}

async fn name_conversation(
    turns: &dyn TurnStore,
    inference: &dyn InferenceBackend,
    conversation_id: &str,
    question: &str,
) -> anyhow::Result<()> {
    if turns.conversation_title(conversation_id).await?.is_some() {
        return Ok(());
    }
    let messages = [ChatMessage::system(TITLE_PROMPT), ChatMessage::user(question)];
    let options = GenerationOptions { max_tokens: 32, temperature: 0.3 };
    let completion = inference.generate(&messages, &options).await?;

    let text = completion.text();
    let title = TextUtils::normalize_whitespace(&text);
    let title = title.trim().trim_matches('"');
    if title.is_empty() {
        return Ok(());
    }
    let title = TextUtils::truncate_with_ellipsis(title, TITLE_MAX_CHARS);
    turns.set_conversation_title(conversation_id, &title).await?;
    info!("Named conversation {} {:?}", conversation_id, title);
    Ok(())
}
