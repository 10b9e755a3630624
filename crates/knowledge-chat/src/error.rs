//! Pipeline error taxonomy.
//!
//! Storage and inference boundaries speak `anyhow`; everything above them is
//! converted into a [`PipelineError`] that carries a classification and the
//! symbolic path of operations it travelled through.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Another AI request for the same conversation is in flight.
    DuplicateRequest,
    /// The client turn id was already stored.
    AlreadyExists,
    /// Context stayed over budget after one summarization pass.
    InsufficientContext,
    /// The inference backend failed.
    Upstream,
    /// Stopped by the user or by the request deadline.
    Canceled,
    Storage,
    Internal,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::DuplicateRequest => "duplicate_request",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::InsufficientContext => "insufficient_context",
            ErrorKind::Upstream => "upstream_failure",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Storage => "storage_failure",
            ErrorKind::Internal => "internal",
        }
    }

    /// Contention errors are the caller's to retry, never the server's.
    pub fn is_contention(&self) -> bool {
        matches!(self, ErrorKind::DuplicateRequest | ErrorKind::AlreadyExists)
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::DuplicateRequest | ErrorKind::AlreadyExists | ErrorKind::Canceled => 409,
            ErrorKind::InsufficientContext => 422,
            ErrorKind::Upstream => 502,
            ErrorKind::Storage | ErrorKind::Internal => 500,
        }
    }
}

impl serde::Serialize for ErrorKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}{}", render_trace(.trace))]
pub struct PipelineError {
    kind: ErrorKind,
    message: String,
    trace: Vec<&'static str>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

fn render_trace(trace: &[&'static str]) -> String {
    if trace.is_empty() {
        String::new()
    } else {
        format!(" (at {})", trace.join(" > "))
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            trace: Vec::new(),
            source: None,
        }
    }

    pub fn duplicate_request(conversation_id: &str) -> Self {
        Self::new(
            ErrorKind::DuplicateRequest,
            format!("an AI request is already running for conversation {}", conversation_id),
        )
    }

    pub fn already_exists(turn_id: &str) -> Self {
        Self::new(ErrorKind::AlreadyExists, format!("turn {} already exists", turn_id))
    }

    pub fn insufficient_context(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InsufficientContext, detail)
    }

    pub fn canceled() -> Self {
        Self::new(ErrorKind::Canceled, "request canceled")
    }

    pub fn storage(source: anyhow::Error) -> Self {
        Self::with_source(ErrorKind::Storage, source)
    }

    pub fn upstream(source: anyhow::Error) -> Self {
        Self::with_source(ErrorKind::Upstream, source)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    fn with_source(kind: ErrorKind, source: anyhow::Error) -> Self {
        Self {
            kind,
            message: source.to_string(),
            trace: Vec::new(),
            source: Some(source.into()),
        }
    }

    /// Record that the error passed through `operation`. Innermost first.
    pub fn at(mut self, operation: &'static str) -> Self {
        self.trace.push(operation);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Outermost operation first.
    pub fn trace(&self) -> Vec<&'static str> {
        self.trace.iter().rev().copied().collect()
    }

    pub fn is_canceled(&self) -> bool {
        self.kind == ErrorKind::Canceled
    }
}

/// `.at(op)` for results that already carry a [`PipelineError`].
pub trait ResultExt<T> {
    fn at(self, operation: &'static str) -> PipelineResult<T>;
}

impl<T> ResultExt<T> for PipelineResult<T> {
    fn at(self, operation: &'static str) -> PipelineResult<T> {
        self.map_err(|e| e.at(operation))
    }
}

/// Classifies results coming off a storage or inference boundary.
pub trait BoundaryExt<T> {
    fn storage_at(self, operation: &'static str) -> PipelineResult<T>;
    fn upstream_at(self, operation: &'static str) -> PipelineResult<T>;
}

impl<T> BoundaryExt<T> for anyhow::Result<T> {
    fn storage_at(self, operation: &'static str) -> PipelineResult<T> {
        self.map_err(|e| PipelineError::storage(e).at(operation))
    }

    fn upstream_at(self, operation: &'static str) -> PipelineResult<T> {
        self.map_err(|e| PipelineError::upstream(e).at(operation))
    }
}
