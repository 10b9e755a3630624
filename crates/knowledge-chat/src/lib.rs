//! Conversational AI request pipeline.
//!
//! One inbound chat message becomes a token-bounded model context, at most
//! one AI request runs per conversation, supporting knowledge is retrieved and
//! reranked, and the answer is streamed back while it is persisted.

pub mod config;
pub mod context_engine;
pub mod crypto;
pub mod error;
pub mod inference;
pub mod memory;
pub mod memory_db;
pub mod metrics;
pub mod pipeline;
pub mod shared_state;
pub mod telemetry;
pub mod transport;
pub mod utils;

#[cfg(feature = "cli")]
pub mod api;
#[cfg(feature = "cli")]
pub mod server;

pub use config::{Config, PipelineSettings, RetrievalSettings};
pub use error::{ErrorKind, PipelineError, PipelineResult};
pub use pipeline::{AgentKind, ChatRequest, PipelineDeps, ReplyOutcome, RequestCoordinator};
pub use shared_state::AppState;

#[cfg(feature = "cli")]
pub use server::{build_router, run_server};
