//! OpenAI-compatible HTTP inference backend.
//!
//! Talks to any server exposing `/v1/chat/completions`, `/v1/embeddings` and
//! optionally `/v1/rerank` (llama-server, vLLM, TEI and friends).
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    ChatMessage, ChatStream, Completion, Embeddings, GenerationOptions, InferenceBackend, RerankOutcome,
    RerankScore, StreamChunk, Usage,
};

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<ChatDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatDelta {
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f32,
}

pub struct HttpInference {
    backend_url: String,
    chat_model: String,
    embedding_model: String,
    rerank_model: String,
    http_client: reqwest::Client,
}

impl HttpInference {
    pub fn new(
        backend_url: impl Into<String>,
        chat_model: impl Into<String>,
        embedding_model: impl Into<String>,
        rerank_model: impl Into<String>,
    ) -> Self {
        let backend_url = backend_url.into().trim_end_matches('/').to_string();
        info!("HTTP inference backend initialized: {}", backend_url);
        Self {
            backend_url,
            chat_model: chat_model.into(),
            embedding_model: embedding_model.into(),
            rerank_model: rerank_model.into(),
            http_client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(600))
                .build()
                .unwrap_or_default(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.backend_url)
    }

    fn embeddings_url(&self) -> String {
        format!("{}/v1/embeddings", self.backend_url)
    }

    fn rerank_url(&self) -> String {
        format!("{}/v1/rerank", self.backend_url)
    }

    async fn post_chat(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
        stream: bool,
    ) -> anyhow::Result<reqwest::Response> {
        let request = ChatCompletionRequest {
            model: &self.chat_model,
            messages,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            stream,
        };
        let response = self.http_client
            .post(self.completions_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("LLM backend request failed: {}", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("LLM backend returned {}: {}", status, body));
        }
        Ok(response)
    }
}

/// Parse one SSE `data:` payload. `Ok(None)` marks the end of the stream.
fn parse_sse_data(data: &str) -> anyhow::Result<Option<(StreamChunk, bool)>> {
    if data == "[DONE]" {
        return Ok(None);
    }
    let envelope: StreamEnvelope = serde_json::from_str(data)
        .map_err(|e| anyhow::anyhow!("Malformed stream chunk: {}", e))?;
    let finished = envelope.choices.iter().any(|c| c.finish_reason.is_some());
    let delta = envelope.choices
        .into_iter()
        .filter_map(|c| c.delta.and_then(|d| d.content))
        .collect::<String>();
    Ok(Some((StreamChunk { delta, usage: envelope.usage }, finished)))
}

/// Splits an SSE byte stream into lines. Bytes are only decoded once a whole
/// line has arrived, so a character split across network chunks stays intact.
#[derive(Default)]
struct SseLines {
    pending: Vec<u8>,
}

impl SseLines {
    fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let newline = self.pending.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=newline).collect();
        Some(String::from_utf8_lossy(&line[..newline]).into_owned())
    }
}

#[async_trait]
impl InferenceBackend for HttpInference {
    async fn generate(&self, messages: &[ChatMessage], options: &GenerationOptions) -> anyhow::Result<Completion> {
        debug!("Generating completion over {} messages", messages.len());
        let response = self.post_chat(messages, options, false).await?;
        let completion: ChatCompletionResponse = response.json().await
            .map_err(|e| anyhow::anyhow!("Failed to parse LLM response: {}", e))?;
        let choices = completion.choices
            .into_iter()
            .filter_map(|c| c.message.and_then(|m| m.content))
            .collect();
        Ok(Completion { choices, usage: completion.usage })
    }

    async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> anyhow::Result<ChatStream> {
        debug!("Starting streaming completion over {} messages", messages.len());
        let response = self.post_chat(messages, options, true).await?;
        let byte_stream = response.bytes_stream();

        let stream = async_stream::try_stream! {
            let mut lines = SseLines::default();
            futures_util::pin_mut!(byte_stream);
            while let Some(chunk_result) = byte_stream.next().await {
                let chunk = chunk_result
                    .map_err(|e| anyhow::anyhow!("Stream read error: {}", e))?;
                lines.push(&chunk);

                while let Some(line) = lines.next_line() {
                    let Some(data) = line.trim().strip_prefix("data:") else {
                        continue;
                    };
                    match parse_sse_data(data.trim())? {
                        None => return,
                        Some((chunk, finished)) => {
                            if !chunk.delta.is_empty() || chunk.usage.is_some() {
                                yield chunk;
                            }
                            if finished {
                                return;
                            }
                        }
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn embed(&self, texts: &[String]) -> anyhow::Result<Embeddings> {
        if texts.is_empty() {
            return Ok(Embeddings::default());
        }
        debug!("Generating embeddings for {} text(s)", texts.len());
        let request = EmbeddingRequest {
            model: &self.embedding_model,
            input: texts,
        };
        let response = self.http_client
            .post(self.embeddings_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Embedding request failed: {}", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Embedding endpoint returned {}: {}", status, body));
        }
        let parsed: EmbeddingResponse = response.json().await
            .map_err(|e| anyhow::anyhow!("Failed to parse embedding response: {}", e))?;
        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();
        debug!("Generated {} embeddings (dim={})",
            vectors.len(),
            vectors.first().map(|e| e.len()).unwrap_or(0));
        Ok(Embeddings { vectors, usage: parsed.usage })
    }

    async fn rerank(&self, query: &str, documents: &[String]) -> anyhow::Result<RerankOutcome> {
        if self.rerank_model.is_empty() {
            return Ok(RerankOutcome::Unsupported);
        }
        let request = RerankRequest {
            model: &self.rerank_model,
            query,
            documents,
        };
        let response = self.http_client
            .post(self.rerank_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Rerank request failed: {}", e))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::NOT_IMPLEMENTED {
            warn!("Rerank endpoint unavailable ({})", status);
            return Ok(RerankOutcome::Unsupported);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Rerank endpoint returned {}: {}", status, body));
        }
        let parsed: RerankResponse = response.json().await
            .map_err(|e| anyhow::anyhow!("Failed to parse rerank response: {}", e))?;
        let mut scores: Vec<RerankScore> = parsed.results
            .into_iter()
            .filter(|r| r.index < documents.len())
            .map(|r| RerankScore { index: r.index, score: r.relevance_score })
            .collect();
        scores.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(RerankOutcome::Ranked { scores, usage: parsed.usage })
    }
}
