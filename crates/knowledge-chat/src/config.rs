use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_SUMMARY_PROMPT: &str = "Summarize the conversation so far into a short digest. \
Keep names, decisions, open questions and any facts the user asked to remember. \
Write plain prose without headings.";

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant answering from the user's knowledge base. \
Cite the supporting documents when they are relevant.";

/// Adaptive similarity filter knobs used by retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalSettings {
    /// Nearest vectors fetched before filtering.
    pub top_k: usize,
    pub cos_limit: f32,
    /// How far below the best score the limit drops when results are weak.
    pub adaptive_step: f32,
    /// The limit only adapts when more than this many results came back.
    pub adaptive_min_results: usize,
    /// Passages at most this long are kept regardless of score.
    pub short_content_len: usize,
    pub max_extra_results: usize,
    pub high_score_keep: usize,
    /// Resource kind searched by the journal agent.
    pub journal_resource: String,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: 100,
            cos_limit: 0.5,
            adaptive_step: 0.1,
            adaptive_min_results: 10,
            short_content_len: 200,
            max_extra_results: 15,
            high_score_keep: 3,
            journal_resource: "journal".to_string(),
        }
    }
}

/// Everything the request pipeline needs to know, independent of the server.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub system_prompt: Option<String>,
    pub summary_prompt: String,
    pub max_context_tokens: usize,
    /// Raw history turns above which a summary is forced.
    pub max_history_turns: usize,
    /// Fewer kept turns than this cannot be summarized any further.
    pub min_turns_for_summary: usize,
    pub retrieval: RetrievalSettings,
    pub bookkeeping_timeout: Duration,
    pub summary_timeout: Duration,
    /// Bound on each embed, rerank and query-rewrite call.
    pub retrieval_timeout: Duration,
    pub model_timeout: Duration,
    pub lock_ttl: Duration,
    pub batch_channel_capacity: usize,
    pub preview_chars: usize,
    pub max_answer_tokens: u32,
    pub temperature: f32,
    pub auto_title: bool,
    /// Query rewrites the auto agent may attempt per request.
    pub max_agent_depth: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            system_prompt: Some(DEFAULT_SYSTEM_PROMPT.to_string()),
            summary_prompt: DEFAULT_SUMMARY_PROMPT.to_string(),
            max_context_tokens: 6000,
            max_history_turns: 20,
            min_turns_for_summary: 4,
            retrieval: RetrievalSettings::default(),
            bookkeeping_timeout: Duration::from_secs(5),
            summary_timeout: Duration::from_secs(30),
            retrieval_timeout: Duration::from_secs(10),
            model_timeout: Duration::from_secs(300),
            lock_ttl: Duration::from_secs(450),
            batch_channel_capacity: 64,
            preview_chars: 64,
            max_answer_tokens: 2000,
            temperature: 0.7,
            auto_title: true,
            max_agent_depth: 2,
        }
    }
}

impl PipelineSettings {
    /// Longest a request can hold its lease when every phase runs into its
    /// timeout: three bookkeeping steps, one summary, every retrieval attempt
    /// of the auto agent (embed + rerank, plus the rewrites between them) and
    /// the answer itself.
    pub fn lifecycle_budget(&self) -> Duration {
        let depth = self.max_agent_depth;
        let retrieval_calls = 2 * (depth + 1) + depth;
        self.bookkeeping_timeout * 3 + self.summary_timeout + self.retrieval_timeout * retrieval_calls + self.model_timeout
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub database_path: PathBuf,
    pub backend_url: String,
    pub chat_model: String,
    pub embedding_model: String,
    /// Empty disables reranking.
    pub rerank_model: String,
    pub request_timeout_seconds: u64,
    pub event_buffer: usize,
    pub pipeline: PipelineSettings,
}

fn env_or<T>(name: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(name)
        .unwrap_or_else(|_| default.into())
        .parse()
        .with_context(|| format!("Invalid value for {}", name))
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let defaults = PipelineSettings::default();
        let retrieval_defaults = RetrievalSettings::default();

        let retrieval = RetrievalSettings {
            top_k: env_or("RETRIEVAL_TOP_K", "100")?,
            cos_limit: env_or("RETRIEVAL_COS_LIMIT", "0.5")?,
            adaptive_step: env_or("RETRIEVAL_ADAPTIVE_STEP", "0.1")?,
            adaptive_min_results: env_or("RETRIEVAL_ADAPTIVE_MIN_RESULTS", "10")?,
            short_content_len: env_or("RETRIEVAL_SHORT_CONTENT_LEN", "200")?,
            max_extra_results: env_or("RETRIEVAL_MAX_EXTRA_RESULTS", "15")?,
            high_score_keep: env_or("RETRIEVAL_HIGH_SCORE_KEEP", "3")?,
            journal_resource: env::var("JOURNAL_RESOURCE").unwrap_or(retrieval_defaults.journal_resource),
        };

        let system_prompt = match env::var("SYSTEM_PROMPT") {
            Ok(prompt) if prompt.trim().is_empty() => None,
            Ok(prompt) => Some(prompt),
            Err(_) => defaults.system_prompt,
        };

        let pipeline = PipelineSettings {
            system_prompt,
            summary_prompt: env::var("SUMMARY_PROMPT").unwrap_or(defaults.summary_prompt),
            max_context_tokens: env_or("MAX_CONTEXT_TOKENS", "6000")?,
            max_history_turns: env_or("MAX_HISTORY_TURNS", "20")?,
            min_turns_for_summary: env_or("MIN_TURNS_FOR_SUMMARY", "4")?,
            retrieval,
            bookkeeping_timeout: secs(env_or("BOOKKEEPING_TIMEOUT_SECONDS", "5")?),
            summary_timeout: secs(env_or("SUMMARY_TIMEOUT_SECONDS", "30")?),
            retrieval_timeout: secs(env_or("RETRIEVAL_TIMEOUT_SECONDS", "10")?),
            model_timeout: secs(env_or("MODEL_TIMEOUT_SECONDS", "300")?),
            lock_ttl: secs(env_or("LOCK_TTL_SECONDS", "450")?),
            batch_channel_capacity: env_or("BATCH_CHANNEL_CAPACITY", "64")?,
            preview_chars: env_or("PREVIEW_CHARS", "64")?,
            max_answer_tokens: env_or("MAX_ANSWER_TOKENS", "2000")?,
            temperature: env_or("TEMPERATURE", "0.7")?,
            auto_title: env_or("AUTO_TITLE", "true")?,
            max_agent_depth: env_or("MAX_AGENT_DEPTH", "2")?,
        };

        let config = Self {
            api_host: env::var("API_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            api_port: env_or("API_PORT", "8000")?,
            database_path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "data/knowledge-chat.db".into()),
            ),
            backend_url: env::var("BACKEND_URL").unwrap_or_else(|_| "http://127.0.0.1:8081".into()),
            chat_model: env::var("CHAT_MODEL").unwrap_or_else(|_| "local-llm".into()),
            embedding_model: env::var("EMBEDDING_MODEL").unwrap_or_else(|_| "local-embedding".into()),
            rerank_model: env::var("RERANK_MODEL").unwrap_or_default(),
            request_timeout_seconds: env_or("REQUEST_TIMEOUT_SECONDS", "600")?,
            event_buffer: env_or("EVENT_BUFFER", "256")?,
            pipeline,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        if p.min_turns_for_summary < 2 {
            return Err(anyhow::anyhow!("MIN_TURNS_FOR_SUMMARY must be at least 2"));
        }
        if p.max_context_tokens == 0 || p.max_history_turns == 0 {
            return Err(anyhow::anyhow!("Context limits must be positive"));
        }
        if p.lock_ttl < p.lifecycle_budget() {
            warn!(
                "LOCK_TTL_SECONDS ({}s) is shorter than the worst-case request ({}s); a slow request may outlive its lease",
                p.lock_ttl.as_secs(),
                p.lifecycle_budget().as_secs()
            );
        }
        if !(0.0..=1.0).contains(&p.retrieval.cos_limit) {
            return Err(anyhow::anyhow!("RETRIEVAL_COS_LIMIT must be within 0..=1"));
        }
        Ok(())
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- Database: {}", self.database_path.display());
        info!("- Backend URL: {}", self.backend_url);
        info!("- Models: chat={} embedding={} rerank={}",
            self.chat_model,
            self.embedding_model,
            if self.rerank_model.is_empty() { "<disabled>" } else { &self.rerank_model });
        info!("- Context budget: {} tokens / {} turns", self.pipeline.max_context_tokens, self.pipeline.max_history_turns);
        info!("- Model timeout: {}s, lock TTL: {}s", self.pipeline.model_timeout.as_secs(), self.pipeline.lock_ttl.as_secs());
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("Invalid API address {}:{}", self.api_host, self.api_port))
    }
}
