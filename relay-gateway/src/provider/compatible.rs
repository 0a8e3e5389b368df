//! OpenAI-compatible streaming provider.
//!
//! DeepSeek, OpenAI and most hosted models accept the same
//! `/chat/completions` request with `"stream": true` and answer with an SSE
//! body of `chat.completion.chunk` objects terminated by `data: [DONE]`.

use super::sse::{SseDecoder, DONE_SENTINEL};
use super::{Balance, ChatRequest, CompletionProvider, CompletionStream, ProviderError, StreamEvent};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// A provider that speaks the OpenAI-compatible chat completions API.
pub struct CompatibleProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: Client,
}

#[derive(Debug, Serialize)]
struct StreamingRequest<'a> {
    #[serde(flatten)]
    request: &'a ChatRequest,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChunkResponse {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<ChunkError>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    #[serde(default)]
    balance_infos: Vec<Balance>,
}

impl CompatibleProvider {
    /// Create a new OpenAI-compatible provider.
    ///
    /// `base_url` is the API root; `/chat/completions` is appended to it.
    pub fn new(name: &str, base_url: &str, api_key: &str) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    /// Create DeepSeek provider.
    pub fn deepseek(api_key: &str) -> Self {
        Self::new("deepseek", "https://api.deepseek.com", api_key)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn error(&self, model: &str, message: impl Into<String>) -> ProviderError {
        ProviderError::new(self.name.clone(), model, message)
    }
}

#[async_trait]
impl CompletionProvider for CompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open_stream(
        &self,
        request: ChatRequest,
    ) -> Result<Box<dyn CompletionStream>, ProviderError> {
        if self.api_key.is_empty() {
            return Err(self.error(&request.model, format!("{} API key not set", self.name)));
        }

        let url = format!("{}/chat/completions", self.base_url);
        let body = StreamingRequest {
            request: &request,
            stream: true,
        };

        tracing::debug!(
            provider = %self.name,
            model = %request.model,
            messages = request.messages.len(),
            "Opening completion stream"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.error(&request.model, format!("Request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(self
                .error(
                    &request.model,
                    format!("API error ({}): {}", status.as_u16(), error_text),
                )
                .with_status(status.as_u16()));
        }

        Ok(Box::new(CompatibleStream {
            provider: self.name.clone(),
            model: request.model,
            response: Some(response),
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            pending_error: None,
            done: false,
        }))
    }

    async fn balance(&self) -> Result<Balance, ProviderError> {
        let url = format!("{}/user/balance", self.base_url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| self.error("", format!("Request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(self
                .error("", format!("API error ({}): {}", status.as_u16(), error_text))
                .with_status(status.as_u16()));
        }

        let result: BalanceResponse = response
            .json()
            .await
            .map_err(|e| self.error("", format!("Failed to parse balance: {e}")))?;

        result
            .balance_infos
            .into_iter()
            .next()
            .ok_or_else(|| self.error("", "balance not available"))
    }
}

// ============================================================================
// Stream
// ============================================================================

/// SSE-backed completion stream over a reqwest response body.
struct CompatibleStream {
    provider: String,
    model: String,
    response: Option<reqwest::Response>,
    decoder: SseDecoder,
    pending: VecDeque<StreamEvent>,
    /// Failure seen after the events still in `pending`
    pending_error: Option<ProviderError>,
    done: bool,
}

impl CompatibleStream {
    /// Turn one SSE payload into an event; `Ok(None)` marks `[DONE]`.
    fn parse_payload(&self, payload: &str) -> Result<Option<StreamEvent>, ProviderError> {
        if payload.trim() == DONE_SENTINEL {
            return Ok(None);
        }

        let chunk: ChunkResponse = serde_json::from_str(payload).map_err(|e| {
            ProviderError::new(&self.provider, &self.model, format!("Malformed chunk: {e}"))
        })?;

        if let Some(error) = chunk.error {
            return Err(ProviderError::new(
                &self.provider,
                &self.model,
                format!("Stream error: {}", error.message),
            ));
        }

        let finish_reason = chunk
            .choices
            .iter()
            .find_map(|c| c.finish_reason.clone());
        let deltas = chunk
            .choices
            .into_iter()
            .map(|c| c.delta.content.unwrap_or_default())
            .collect();

        Ok(Some(StreamEvent {
            deltas,
            finish_reason,
        }))
    }

    /// Queue parsed events. A failing payload ends the stream once the
    /// events before it have been handed out.
    fn enqueue(&mut self, payloads: Vec<String>) {
        for payload in payloads {
            match self.parse_payload(&payload) {
                Ok(Some(event)) => self.pending.push_back(event),
                Ok(None) => {
                    self.done = true;
                    break;
                }
                Err(e) => {
                    self.pending_error = Some(e);
                    self.done = true;
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl CompletionStream for CompatibleStream {
    async fn next_event(&mut self) -> Result<Option<StreamEvent>, ProviderError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if self.done {
                self.close();
                return match self.pending_error.take() {
                    Some(e) => Err(e),
                    None => Ok(None),
                };
            }
            let Some(response) = self.response.as_mut() else {
                return Ok(None);
            };

            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let payloads = self.decoder.feed(&chunk);
                    self.enqueue(payloads);
                }
                Ok(None) => {
                    let rest: Vec<String> = self.decoder.finish().into_iter().collect();
                    self.done = true;
                    self.enqueue(rest);
                }
                Err(e) => {
                    self.close();
                    return Err(ProviderError::new(
                        &self.provider,
                        &self.model,
                        format!("Stream interrupted: {e}"),
                    ));
                }
            }
        }
    }

    fn close(&mut self) {
        if self.response.take().is_some() {
            tracing::debug!(provider = %self.provider, "Completion stream closed");
        }
    }
}
