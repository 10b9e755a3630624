//! How an answer leaves the system.
//!
//! Both adapters follow `uncomplete -> generating* -> {complete | canceled | failed}`.
//! The streaming adapter persists the assistant turn and publishes an event per
//! chunk; the batch adapter hands content to a bounded channel and persists nothing.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::{BoundaryExt, ErrorKind, PipelineError, PipelineResult};
use crate::memory::TurnStore;
use crate::memory_db::schema::{ConversationTurn, Progress, Role};
use crate::metrics;
use crate::transport::{
    publish_to_conversation, EventPublisher, StreamEvent, StreamKind, TurnCreatedEvent, STREAM_EVENT,
    TURN_CREATED_EVENT,
};
use crate::utils::{TextUtils, EMPTY_REPLY_APOLOGY, INSUFFICIENT_CONTEXT_REPLY, UPSTREAM_FAILURE_REPLY};

/// One unit of answer content. The set of kinds is closed, so an unknown
/// kind cannot reach a channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum ResponseContent {
    Text(String),
    ToolStatus(serde_json::Value),
}

/// Everything needed to open the assistant turn.
#[derive(Debug, Clone)]
pub struct ReplyInit {
    pub conversation_id: String,
    pub user_turn_id: String,
    pub turn_id: String,
    pub sequence: i64,
    /// Knowledge ids the answer is built on.
    pub related_documents: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplyOutcome {
    pub conversation_id: String,
    pub user_turn_id: String,
    pub turn_id: String,
    pub sequence: i64,
    pub progress: Progress,
    /// Characters of text delivered.
    pub sent_chars: usize,
    /// Full answer text in batch mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ReplyFailure>,
    pub related_documents: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplyFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl ReplyOutcome {
    pub fn failure_kind(&self) -> Option<ErrorKind> {
        self.failure.as_ref().map(|f| f.kind)
    }
}

/// Runs once the channel reached its terminal state.
pub type CompletionCallback = Box<dyn FnOnce(&ReplyOutcome) + Send + Sync + 'static>;

#[async_trait]
pub trait ResponseChannel: Send {
    fn is_stream(&self) -> bool;

    /// Must precede any `receive`.
    async fn recv_init(&mut self, init: ReplyInit) -> PipelineResult<()>;

    async fn receive(&mut self, content: ResponseContent, progress: Progress) -> PipelineResult<()>;

    /// Terminal transition; `result` is how generation ended.
    async fn done(&mut self, result: PipelineResult<()>) -> ReplyOutcome;
}

/// Terminal progress for a finished generation.
fn terminal_progress(result: &PipelineResult<()>, stopped: bool, sent_chars: usize) -> Progress {
    match result {
        _ if stopped => Progress::Canceled,
        Err(e) if e.is_canceled() => Progress::Canceled,
        Err(_) => Progress::Failed,
        Ok(()) if sent_chars == 0 => Progress::Failed,
        Ok(()) => Progress::Complete,
    }
}

fn failure_for(result: &PipelineResult<()>, progress: Progress) -> Option<ReplyFailure> {
    match (result, progress) {
        (Err(e), _) => Some(ReplyFailure { kind: e.kind(), message: e.to_string() }),
        (Ok(()), Progress::Failed) => Some(ReplyFailure {
            kind: ErrorKind::Upstream,
            message: "reply ended without usable content".to_string(),
        }),
        (Ok(()), Progress::Canceled) => Some(ReplyFailure {
            kind: ErrorKind::Canceled,
            message: "stopped".to_string(),
        }),
        _ => None,
    }
}

/// Text stored in place of the answer of a failed turn.
fn failure_text(result: &PipelineResult<()>, progress: Progress) -> Option<&'static str> {
    match result {
        _ if progress != Progress::Failed => None,
        Ok(()) => Some(EMPTY_REPLY_APOLOGY),
        Err(e) if e.kind() == ErrorKind::InsufficientContext => Some(INSUFFICIENT_CONTEXT_REPLY),
        Err(_) => Some(UPSTREAM_FAILURE_REPLY),
    }
}

fn outcome_for(
    init: &Option<ReplyInit>,
    progress: Progress,
    sent_chars: usize,
    failure: Option<ReplyFailure>,
) -> ReplyOutcome {
    let (conversation_id, user_turn_id, turn_id, sequence, related_documents) = match init {
        Some(init) => (
            init.conversation_id.clone(),
            init.user_turn_id.clone(),
            init.turn_id.clone(),
            init.sequence,
            init.related_documents.clone(),
        ),
        None => Default::default(),
    };
    ReplyOutcome {
        conversation_id,
        user_turn_id,
        turn_id,
        sequence,
        progress,
        sent_chars,
        text: None,
        failure,
        related_documents,
    }
}

pub struct StreamingChannel {
    turns: Arc<dyn TurnStore>,
    publisher: Arc<dyn EventPublisher>,
    preview_chars: usize,
    init: Option<ReplyInit>,
    sent_chars: usize,
    progress: Progress,
    preview_stored: bool,
    /// Set once a canceled chunk arrived; no more writes after that, nor
    /// after any other terminal chunk.
    stopped: bool,
    on_complete: Option<CompletionCallback>,
}

impl StreamingChannel {
    pub fn new(turns: Arc<dyn TurnStore>, publisher: Arc<dyn EventPublisher>, preview_chars: usize) -> Self {
        Self {
            turns,
            publisher,
            preview_chars,
            init: None,
            sent_chars: 0,
            progress: Progress::Uncomplete,
            preview_stored: false,
            stopped: false,
            on_complete: None,
        }
    }

    pub fn on_complete(mut self, callback: CompletionCallback) -> Self {
        self.on_complete = Some(callback);
        self
    }

    fn opened(&self) -> PipelineResult<&ReplyInit> {
        self.init
            .as_ref()
            .ok_or_else(|| PipelineError::internal("content delivered before the reply was opened"))
    }

    async fn publish(&self, kind: StreamKind, payload: serde_json::Value, progress: Progress) {
        let Some(init) = &self.init else { return };
        let event = StreamEvent {
            turn_id: init.turn_id.clone(),
            conversation_id: init.conversation_id.clone(),
            kind,
            payload,
            offset: self.sent_chars,
            progress,
        };
        if let Err(e) =
            publish_to_conversation(self.publisher.as_ref(), &init.conversation_id, STREAM_EVENT, &event).await
        {
            warn!("Failed to publish stream event for {}: {}", init.turn_id, e);
        }
    }

    async fn receive_text(&mut self, turn_id: &str, chunk: &str, progress: Progress) -> PipelineResult<()> {
        if !self.preview_stored && !chunk.is_empty() && progress != Progress::Canceled {
            let preview = TextUtils::preview(chunk, self.preview_chars);
            self.turns.set_preview(turn_id, &preview).await.storage_at("channel.preview")?;
            self.preview_stored = true;
        }

        match progress {
            Progress::Canceled => {
                self.turns
                    .set_progress(turn_id, Progress::Canceled)
                    .await
                    .storage_at("channel.cancel")?;
                self.stopped = true;
            }
            Progress::Failed => {
                self.turns.rewrite_text(turn_id, chunk).await.storage_at("channel.rewrite")?;
            }
            _ => {
                self.turns.append_text(turn_id, chunk).await.storage_at("channel.append")?;
                if self.progress == Progress::Uncomplete {
                    self.turns
                        .set_progress(turn_id, Progress::Generating)
                        .await
                        .storage_at("channel.progress")?;
                }
            }
        }
        self.progress = progress;
        Ok(())
    }

    /// Best effort: the terminal state is logged when it cannot be stored.
    async fn persist_terminal(&self, turn_id: &str, progress: Progress, replacement: Option<&str>) {
        if let Some(text) = replacement {
            if let Err(e) = self.turns.rewrite_text(turn_id, text).await {
                error!("Failed to store failure text for turn {}: {}", turn_id, e);
            }
        }
        if let Err(e) = self.turns.set_progress(turn_id, progress).await {
            error!("Failed to mark turn {} {}: {}", turn_id, progress.as_str(), e);
        }
    }
}

#[async_trait]
impl ResponseChannel for StreamingChannel {
    fn is_stream(&self) -> bool {
        true
    }

    async fn recv_init(&mut self, init: ReplyInit) -> PipelineResult<()> {
        let turn = ConversationTurn {
            id: init.turn_id.clone(),
            conversation_id: init.conversation_id.clone(),
            role: Role::Assistant,
            text: String::new(),
            encrypted: false,
            progress: Progress::Uncomplete,
            sequence: init.sequence,
            preview: None,
            attachments: init.related_documents.clone(),
            created_at: Utc::now(),
        };
        self.turns.create_turn(&turn).await.storage_at("channel.recv_init")?;
        debug!("Opened assistant turn {} (sequence {})", init.turn_id, init.sequence);
        self.init = Some(init);

        // A row without its event still gets a terminal state from `done`.
        let event = TurnCreatedEvent::from(&turn);
        publish_to_conversation(self.publisher.as_ref(), &turn.conversation_id, TURN_CREATED_EVENT, &event)
            .await
            .storage_at("channel.recv_init")
    }

    async fn receive(&mut self, content: ResponseContent, progress: Progress) -> PipelineResult<()> {
        let turn_id = self.opened()?.turn_id.clone();
        match content {
            ResponseContent::Text(chunk) => {
                if self.stopped || self.progress.is_terminal() {
                    return Ok(());
                }
                self.receive_text(&turn_id, &chunk, progress).await?;
                self.sent_chars += TextUtils::char_len(&chunk);
                self.publish(StreamKind::Text, serde_json::Value::String(chunk), progress).await;
            }
            ResponseContent::ToolStatus(status) => {
                self.publish(StreamKind::ToolStatus, status, progress).await;
            }
        }
        Ok(())
    }

    async fn done(&mut self, result: PipelineResult<()>) -> ReplyOutcome {
        // A terminal chunk already decided the outcome and stored its text.
        let delivered = self.progress.is_terminal();
        let progress = if delivered {
            self.progress
        } else {
            terminal_progress(&result, self.stopped, self.sent_chars)
        };
        let failure = failure_for(&result, progress);

        if let Some(init) = &self.init {
            let turn_id = init.turn_id.clone();
            if self.stopped {
                debug!("Turn {} already stopped", turn_id);
            } else {
                let replacement = if delivered { None } else { failure_text(&result, progress) };
                self.persist_terminal(&turn_id, progress, replacement).await;
            }
            if progress == Progress::Failed && result.is_ok() {
                warn!("Backend produced no content for turn {}", turn_id);
            }
            self.publish(StreamKind::Text, serde_json::Value::String(String::new()), progress).await;
        }
        metrics::inc_terminal(progress.as_str(), "stream");

        let outcome = outcome_for(&self.init, progress, self.sent_chars, failure);
        if let Some(callback) = self.on_complete.take() {
            callback(&outcome);
        }
        outcome
    }
}

/// Delivers content to a bounded channel; nothing is stored.
pub struct BatchChannel {
    sender: mpsc::Sender<ResponseContent>,
    init: Option<ReplyInit>,
    sent_chars: usize,
    on_complete: Option<CompletionCallback>,
}

impl BatchChannel {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ResponseContent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let channel = Self {
            sender,
            init: None,
            sent_chars: 0,
            on_complete: None,
        };
        (channel, receiver)
    }

    pub fn on_complete(mut self, callback: CompletionCallback) -> Self {
        self.on_complete = Some(callback);
        self
    }
}

#[async_trait]
impl ResponseChannel for BatchChannel {
    fn is_stream(&self) -> bool {
        false
    }

    async fn recv_init(&mut self, init: ReplyInit) -> PipelineResult<()> {
        self.init = Some(init);
        Ok(())
    }

    async fn receive(&mut self, content: ResponseContent, _progress: Progress) -> PipelineResult<()> {
        if let ResponseContent::Text(chunk) = &content {
            self.sent_chars += TextUtils::char_len(chunk);
        }
        // The reader going away is the batch equivalent of a stop.
        self.sender
            .send(content)
            .await
            .map_err(|_| PipelineError::canceled().at("channel.receive"))
    }

    async fn done(&mut self, result: PipelineResult<()>) -> ReplyOutcome {
        let progress = terminal_progress(&result, false, self.sent_chars);
        let failure = failure_for(&result, progress);
        metrics::inc_terminal(progress.as_str(), "batch");

        let outcome = outcome_for(&self.init, progress, self.sent_chars, failure);
        if let Some(callback) = self.on_complete.take() {
            callback(&outcome);
        }
        outcome
    }
}

/// Concatenate the text a batch channel delivers.
pub async fn collect_text(mut receiver: mpsc::Receiver<ResponseContent>) -> String {
    let mut text = String::new();
    while let Some(content) = receiver.recv().await {
        if let ResponseContent::Text(chunk) = content {
            text.push_str(&chunk);
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::ChatDatabase;
    use crate::transport::{topic_for, BroadcastPublisher, PublishedEvent};
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<ChatDatabase>,
        publisher: Arc<BroadcastPublisher>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let db = Arc::new(ChatDatabase::open(&dir.path().join("chat.db")).unwrap());
            Self { _dir: dir, db, publisher: Arc::new(BroadcastPublisher::new(64)) }
        }

        fn channel(&self) -> StreamingChannel {
            StreamingChannel::new(Arc::new(self.db.conversations.clone()), self.publisher.clone(), 4)
        }

        fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
            self.publisher.subscribe(&topic_for("c1"))
        }
    }

    fn init() -> ReplyInit {
        ReplyInit {
            conversation_id: "c1".to_string(),
            user_turn_id: "0001".to_string(),
            turn_id: "0002".to_string(),
            sequence: 2,
            related_documents: vec!["k1".to_string()],
        }
    }

    fn stream_events(rx: &mut broadcast::Receiver<PublishedEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if event.kind == STREAM_EVENT {
                events.push(serde_json::from_value(event.payload).unwrap());
            }
        }
        events
    }

    #[tokio::test]
    async fn test_streamed_text_is_persisted_with_offsets() {
        let fx = Fixture::new();
        let mut rx = fx.subscribe();
        let mut channel = fx.channel();

        channel.recv_init(init()).await.unwrap();
        let created = rx.try_recv().unwrap();
        assert_eq!(created.kind, TURN_CREATED_EVENT);
        assert_eq!(created.payload["progress"], "uncomplete");

        channel.receive(ResponseContent::Text("Hello".into()), Progress::Generating).await.unwrap();
        channel.receive(ResponseContent::Text(" world".into()), Progress::Generating).await.unwrap();
        let outcome = channel.done(Ok(())).await;

        assert_eq!(outcome.progress, Progress::Complete);
        assert_eq!(outcome.sent_chars, 11);
        let events = stream_events(&mut rx);
        let offsets: Vec<usize> = events.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![5, 11, 11]);
        assert_eq!(events[2].progress, Progress::Complete);

        let turn = fx.db.conversations.get_turn("0002").await.unwrap().unwrap();
        assert_eq!(turn.text, "Hello world");
        assert_eq!(turn.progress, Progress::Complete);
        assert_eq!(turn.preview.as_deref(), Some("Hell"));
        assert_eq!(turn.attachments, vec!["k1".to_string()]);
    }

    #[tokio::test]
    async fn test_zero_content_marks_failed_with_apology() {
        let fx = Fixture::new();
        let mut channel = fx.channel();
        channel.recv_init(init()).await.unwrap();
        channel
            .receive(ResponseContent::ToolStatus(serde_json::json!({"step": "search"})), Progress::Generating)
            .await
            .unwrap();

        let outcome = channel.done(Ok(())).await;
        assert_eq!(outcome.progress, Progress::Failed);
        let turn = fx.db.conversations.get_turn("0002").await.unwrap().unwrap();
        assert_eq!(turn.progress, Progress::Failed);
        assert_eq!(turn.text, EMPTY_REPLY_APOLOGY);
    }

    #[tokio::test]
    async fn test_upstream_error_rewrites_text() {
        let fx = Fixture::new();
        let mut channel = fx.channel();
        channel.recv_init(init()).await.unwrap();
        channel.receive(ResponseContent::Text("partial".into()), Progress::Generating).await.unwrap();

        let outcome = channel.done(Err(PipelineError::upstream(anyhow::anyhow!("backend died")))).await;
        assert_eq!(outcome.progress, Progress::Failed);
        assert_eq!(outcome.failure_kind(), Some(ErrorKind::Upstream));
        let turn = fx.db.conversations.get_turn("0002").await.unwrap().unwrap();
        assert_eq!(turn.text, UPSTREAM_FAILURE_REPLY);
    }

    #[tokio::test]
    async fn test_cancellation_marks_canceled() {
        let fx = Fixture::new();
        let mut channel = fx.channel();
        channel.recv_init(init()).await.unwrap();

        let outcome = channel.done(Err(PipelineError::canceled())).await;
        assert_eq!(outcome.progress, Progress::Canceled);
        let turn = fx.db.conversations.get_turn("0002").await.unwrap().unwrap();
        assert_eq!(turn.progress, Progress::Canceled);
        assert_eq!(turn.text, "");
    }

    #[tokio::test]
    async fn test_canceled_chunk_stops_further_writes() {
        let fx = Fixture::new();
        let mut channel = fx.channel();
        channel.recv_init(init()).await.unwrap();
        channel.receive(ResponseContent::Text("abc".into()), Progress::Generating).await.unwrap();
        channel.receive(ResponseContent::Text(String::new()), Progress::Canceled).await.unwrap();
        channel.receive(ResponseContent::Text("late".into()), Progress::Generating).await.unwrap();

        let outcome = channel.done(Ok(())).await;
        assert_eq!(outcome.progress, Progress::Canceled);
        let turn = fx.db.conversations.get_turn("0002").await.unwrap().unwrap();
        assert_eq!(turn.text, "abc");
        assert_eq!(turn.progress, Progress::Canceled);
    }

    #[tokio::test]
    async fn test_failed_chunk_is_final() {
        let fx = Fixture::new();
        let mut channel = fx.channel();
        channel.recv_init(init()).await.unwrap();
        channel.receive(ResponseContent::Text("abc".into()), Progress::Generating).await.unwrap();
        channel.receive(ResponseContent::Text("Tool crashed.".into()), Progress::Failed).await.unwrap();
        channel.receive(ResponseContent::Text("late".into()), Progress::Generating).await.unwrap();

        let outcome = channel.done(Ok(())).await;
        assert_eq!(outcome.progress, Progress::Failed);
        let turn = fx.db.conversations.get_turn("0002").await.unwrap().unwrap();
        assert_eq!(turn.text, "Tool crashed.");
        assert_eq!(turn.progress, Progress::Failed);
    }

    #[tokio::test]
    async fn test_receive_before_init_is_internal_error() {
        let fx = Fixture::new();
        let mut channel = fx.channel();
        let err = channel
            .receive(ResponseContent::Text("x".into()), Progress::Generating)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[tokio::test]
    async fn test_callback_sees_terminal_outcome() {
        let fx = Fixture::new();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let mut channel = fx
            .channel()
            .on_complete(Box::new(move |outcome| *sink.lock().unwrap() = Some(outcome.progress)));
        channel.recv_init(init()).await.unwrap();
        channel.receive(ResponseContent::Text("ok".into()), Progress::Generating).await.unwrap();
        channel.done(Ok(())).await;
        assert_eq!(*seen.lock().unwrap(), Some(Progress::Complete));
    }

    #[tokio::test]
    async fn test_batch_channel_forwards_without_storing() {
        let fx = Fixture::new();
        let (mut channel, receiver) = BatchChannel::new(8);
        let collector = tokio::spawn(collect_text(receiver));

        channel.recv_init(init()).await.unwrap();
        channel.receive(ResponseContent::Text("Hello".into()), Progress::Generating).await.unwrap();
        channel.receive(ResponseContent::Text(" world".into()), Progress::Generating).await.unwrap();
        let outcome = channel.done(Ok(())).await;
        drop(channel);

        assert_eq!(outcome.progress, Progress::Complete);
        assert_eq!(collector.await.unwrap(), "Hello world");
        assert!(fx.db.conversations.get_turn("0002").await.unwrap().is_none());
    }
}
