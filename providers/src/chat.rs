//! Streaming chat completions against an OpenAI-compatible runtime.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

use hearth_types::{ChatMessage, GenerateError, Sampling};
use hearth_worker::{CancellationToken, FragmentSink};

use crate::retry::{RetryConfig, RetryOutcome};
use crate::sse::{self, MAX_SSE_BUFFER_BYTES};

const MAX_SSE_PARSE_ERRORS: usize = 3;

#[derive(Debug, Serialize)]
pub(crate) struct ChatBody<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub stream: bool,
    pub temperature: f64,
    pub top_k: u32,
    pub max_tokens: u32,
    /// Lets the runtime reuse its KV cache for a shared prompt prefix.
    pub cache_prompt: bool,
}

impl<'a> ChatBody<'a> {
    pub(crate) fn new(
        model: &'a str,
        messages: &'a [ChatMessage],
        sampling: Sampling,
        cache_prompt: bool,
    ) -> Self {
        Self {
            model,
            messages,
            stream: true,
            temperature: sampling.temperature.value(),
            top_k: sampling.top_k.value(),
            max_tokens: sampling.max_new_tokens,
            cache_prompt,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<ChunkError>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkError {
    message: String,
}

pub(crate) struct ChatStream<'a> {
    pub client: &'a reqwest::Client,
    pub url: Url,
    pub retry: &'a RetryConfig,
    pub idle_timeout: Duration,
}

impl ChatStream<'_> {
    /// Run one streamed completion, forwarding content deltas to `fragments`.
    ///
    /// Returns the accumulated text. Cancellation is checked between chunks and
    /// yields whatever was produced so far.
    pub(crate) async fn run(
        &self,
        body: &ChatBody<'_>,
        fragments: &FragmentSink,
        cancel: &CancellationToken,
    ) -> Result<String, GenerateError> {
        let send = self
            .retry
            .send(|| self.client.post(self.url.clone()).json(body));
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(String::new()),
            outcome = send => outcome,
        };
        let response = match outcome {
            RetryOutcome::Success(response) => response,
            RetryOutcome::HttpError(response) if response.status() == StatusCode::NOT_FOUND => {
                let detail = crate::read_capped_error_body(response).await;
                return Err(GenerateError::Unavailable(format!(
                    "model {} is not served: {detail}",
                    body.model
                )));
            }
            RetryOutcome::HttpError(response) => {
                let status = response.status();
                let detail = crate::read_capped_error_body(response).await;
                return Err(GenerateError::Failed(format!("runtime error {status}: {detail}")));
            }
            RetryOutcome::ConnectionError { attempts, source } => {
                return Err(GenerateError::Unavailable(format!(
                    "runtime unreachable after {attempts} attempts: {source}"
                )));
            }
        };

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut text = String::new();
        let mut parse_errors = 0usize;
        let mut finished = false;

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::debug!(chars = text.len(), "Generation cancelled mid-stream");
                    return Ok(text);
                }
                next = tokio::time::timeout(self.idle_timeout, stream.next()) => next,
            };
            let Ok(next) = next else {
                return Err(GenerateError::Failed("stream idle timeout".to_string()));
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| GenerateError::Failed(format!("stream read failed: {e}")))?;
            buffer.extend_from_slice(&chunk);
            if buffer.len() > MAX_SSE_BUFFER_BYTES {
                return Err(GenerateError::Failed(
                    "SSE buffer exceeded maximum size (4 MiB)".to_string(),
                ));
            }

            while let Some(event) = sse::drain_next_event(&mut buffer) {
                let Ok(event) = std::str::from_utf8(&event) else {
                    return Err(GenerateError::Failed(
                        "received invalid UTF-8 from SSE stream".to_string(),
                    ));
                };
                let Some(data) = sse::extract_data(event) else {
                    continue;
                };
                if data == "[DONE]" {
                    return Ok(text);
                }

                let chunk = match serde_json::from_str::<ChatChunk>(&data) {
                    Ok(chunk) => {
                        parse_errors = 0;
                        chunk
                    }
                    Err(e) => {
                        parse_errors += 1;
                        tracing::warn!(%e, payload_bytes = data.len(), "Invalid SSE JSON payload");
                        if parse_errors >= MAX_SSE_PARSE_ERRORS {
                            return Err(GenerateError::Failed(format!("invalid stream payload: {e}")));
                        }
                        continue;
                    }
                };
                if let Some(error) = chunk.error {
                    return Err(GenerateError::Failed(error.message));
                }
                for choice in chunk.choices {
                    if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                        text.push_str(&content);
                        if !fragments.emit(content).await {
                            return Ok(text);
                        }
                    }
                    finished |= choice.finish_reason.is_some();
                }
            }
        }

        if finished {
            Ok(text)
        } else {
            Err(GenerateError::Failed(
                "connection closed before stream completed".to_string(),
            ))
        }
    }
}
