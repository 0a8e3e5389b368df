//! Streaming delivery engine.
//!
//! Turns one completion stream into a sequence of visible message writes:
//!
//! ```text
//! open stream ──► typing ──► fold deltas ──► throttled publish/update ─┐
//!      │                          ▲                                    │
//!      │                          └────────────── next event ◄─────────┘
//!      ▼                                   │ end / transport error
//!  error reply                             ▼
//!                     wait out interval ──► final publish/update ──► history
//!                                              │ update failed
//!                                              ▼
//!                                     delete + republish
//! ```
//!
//! Two visible writes of one exchange are never closer together than the
//! conversation's reply interval. The final write always happens, even when
//! the text did not change since the last intermediate write.

use crate::history::{ConversationHistory, HistoryStore};
use crate::message::{MessageHandle, ReplyTarget};
use crate::traits::{ChannelError, ChannelResult, Degradation, Delivery, MessageSink};
use relay_gateway::{ChatRequest, CompletionProvider, CompletionStream, ProviderError, StreamEvent, Turn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Prefix of every error reply shown in a conversation.
pub const ERROR_PREFIX: &str = "❌ Error";

// ============================================================================
// Request Context
// ============================================================================

/// Everything sent to the backend for one exchange.
#[derive(Debug, Clone)]
pub struct RequestContext {
    model: String,
    system: Option<Turn>,
    history: ConversationHistory,
    replied_to: Option<Turn>,
    user: Turn,
    max_tokens: Option<u32>,
    temperature: Option<f64>,
}

impl RequestContext {
    pub fn new(model: impl Into<String>, user: Turn) -> Self {
        Self {
            model: model.into(),
            system: None,
            history: Vec::new(),
            replied_to: None,
            user,
            max_tokens: None,
            temperature: None,
        }
    }

    /// Set the system preamble. An empty prompt sends no system turn.
    pub fn with_system_prompt(mut self, prompt: &str) -> Self {
        self.system = (!prompt.is_empty()).then(|| Turn::system(prompt));
        self
    }

    pub fn with_history(mut self, history: ConversationHistory) -> Self {
        self.history = history;
        self
    }

    /// The message the user replied to, already rendered as an assistant turn.
    pub fn with_replied_to(mut self, turn: Option<Turn>) -> Self {
        self.replied_to = turn;
        self
    }

    pub fn with_sampling(mut self, max_tokens: u32, temperature: f64) -> Self {
        self.max_tokens = Some(max_tokens);
        self.temperature = Some(temperature);
        self
    }

    /// Conversation in send order: system, history, replied-to, user.
    pub fn messages(&self) -> Vec<Turn> {
        self.system
            .iter()
            .chain(self.history.iter())
            .chain(self.replied_to.iter())
            .chain(std::iter::once(&self.user))
            .cloned()
            .collect()
    }

    pub fn to_chat_request(&self) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: self.messages(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }

    /// Turns recorded once the exchange succeeds, followed by the answer.
    fn completed_turns(&self, answer: &str) -> Vec<Turn> {
        self.replied_to
            .iter()
            .cloned()
            .chain([self.user.clone(), Turn::assistant(answer)])
            .collect()
    }
}

/// One exchange to run.
#[derive(Debug, Clone)]
pub struct Exchange {
    /// Where the reply is published
    pub target: ReplyTarget,
    pub request: RequestContext,
    /// Minimum spacing between visible writes
    pub min_reply_interval: Duration,
}

/// Result of a delivered exchange.
#[derive(Debug, Clone)]
pub struct ExchangeOutcome {
    /// Final answer text
    pub text: String,
    /// The final write, `None` when the answer was empty
    pub delivery: Option<Delivery>,
    /// Writes made before the final one
    pub intermediate_writes: usize,
    /// The stream broke off before its end; `text` is partial
    pub truncated: bool,
}

/// Why an exchange failed.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("failed to open completion stream: {0}")]
    StreamOpen(#[source] ProviderError),

    #[error("reply delivery failed: {0}")]
    Delivery(#[source] ChannelError),

    #[error("exchange cancelled")]
    Cancelled,
}

// ============================================================================
// Engine
// ============================================================================

/// Per-exchange reply state.
struct StreamingReply {
    text: String,
    last_published_text: String,
    last_publish_at: Instant,
    handle: Option<MessageHandle>,
    intermediate_writes: usize,
}

impl StreamingReply {
    fn new(opened_at: Instant) -> Self {
        Self {
            text: String::new(),
            last_published_text: String::new(),
            last_publish_at: opened_at,
            handle: None,
            intermediate_writes: 0,
        }
    }

    fn fold(&mut self, event: &StreamEvent) {
        for delta in &event.deltas {
            self.text.push_str(delta);
        }
    }

    fn should_publish(&self, min_interval: Duration) -> bool {
        self.last_publish_at.elapsed() > min_interval
            && !self.text.is_empty()
            && self.text != self.last_published_text
    }

    /// Record a write attempt; the handle is kept when the write failed.
    fn record_write(&mut self, handle: Option<MessageHandle>) {
        if handle.is_some() {
            self.handle = handle;
        }
        self.last_published_text.clone_from(&self.text);
        self.last_publish_at = Instant::now();
    }
}

/// Closes the wrapped stream on drop.
struct StreamGuard(Box<dyn CompletionStream>);

impl StreamGuard {
    async fn next_event(&mut self) -> Result<Option<StreamEvent>, ProviderError> {
        self.0.next_event().await
    }

    fn close(&mut self) {
        self.0.close();
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Drives completion streams into rate-limited message writes.
pub struct StreamingEngine {
    provider: Arc<dyn CompletionProvider>,
    sink: Arc<dyn MessageSink>,
    history: Arc<HistoryStore>,
}

impl StreamingEngine {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        sink: Arc<dyn MessageSink>,
        history: Arc<HistoryStore>,
    ) -> Self {
        Self {
            provider,
            sink,
            history,
        }
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    /// Run one exchange to completion.
    ///
    /// The caller must not run two exchanges on one conversation at once.
    pub async fn run(
        &self,
        exchange: Exchange,
        cancel: &CancellationToken,
    ) -> Result<ExchangeOutcome, ExchangeError> {
        let Exchange {
            target,
            request,
            min_reply_interval,
        } = exchange;
        let conversation = target.conversation;

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExchangeError::Cancelled),
            opened = self.provider.open_stream(request.to_chat_request()) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => StreamGuard(stream),
            Err(e) => {
                tracing::warn!(
                    conversation_id = %conversation,
                    provider = %e.provider,
                    status = ?e.status_code,
                    "Completion stream open failed: {e}"
                );
                self.report_error(&target, &e.to_string()).await;
                return Err(ExchangeError::StreamOpen(e));
            }
        };

        let mut reply = StreamingReply::new(Instant::now());
        if let Err(e) = self.sink.notify_typing(conversation).await {
            tracing::debug!(conversation_id = %conversation, "Typing indicator failed: {e}");
        }

        let mut truncated = false;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ExchangeError::Cancelled),
                next = stream.next_event() => next,
            };
            match next {
                Ok(Some(event)) => {
                    reply.fold(&event);
                    if reply.should_publish(min_reply_interval) {
                        self.write_intermediate(&target, &mut reply).await;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(
                        conversation_id = %conversation,
                        received_chars = reply.text.chars().count(),
                        "Completion stream interrupted, keeping partial answer: {e}"
                    );
                    truncated = true;
                    break;
                }
            }
        }
        stream.close();

        if reply.text.is_empty() {
            tracing::info!(conversation_id = %conversation, "Completion finished without text");
            return Ok(ExchangeOutcome {
                text: String::new(),
                delivery: None,
                intermediate_writes: reply.intermediate_writes,
                truncated,
            });
        }

        let elapsed = reply.last_publish_at.elapsed();
        if elapsed < min_reply_interval {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ExchangeError::Cancelled),
                _ = tokio::time::sleep(min_reply_interval - elapsed) => {}
            }
        }

        let delivery = match self.write_final(&target, &reply).await {
            Ok(delivery) => delivery,
            Err(e) => {
                tracing::error!(conversation_id = %conversation, "Reply delivery failed: {e}");
                self.report_error(&target, &e.to_string()).await;
                return Err(ExchangeError::Delivery(e));
            }
        };

        self.history
            .append(conversation, request.completed_turns(&reply.text));

        tracing::info!(
            conversation_id = %conversation,
            message_id = delivery.handle.message_id,
            chars = reply.text.chars().count(),
            intermediate_writes = reply.intermediate_writes,
            degradation = ?delivery.degradation,
            truncated,
            "Reply delivered"
        );

        Ok(ExchangeOutcome {
            text: reply.text,
            delivery: Some(delivery),
            intermediate_writes: reply.intermediate_writes,
            truncated,
        })
    }

    async fn write_intermediate(&self, target: &ReplyTarget, reply: &mut StreamingReply) {
        let result = match &reply.handle {
            None => self.sink.publish(target, &reply.text).await,
            Some(handle) => self.sink.update(handle, &reply.text).await,
        };

        let handle = match result {
            Ok(delivery) => Some(delivery.handle),
            Err(e) => {
                tracing::warn!(
                    conversation_id = %target.conversation,
                    "Intermediate reply write failed: {e}"
                );
                None
            }
        };
        reply.record_write(handle);
        reply.intermediate_writes += 1;
    }

    /// Final unconditional write, replacing the message when the update fails.
    async fn write_final(&self, target: &ReplyTarget, reply: &StreamingReply) -> ChannelResult<Delivery> {
        let Some(handle) = reply.handle else {
            return self.sink.publish(target, &reply.text).await;
        };

        match self.sink.update(&handle, &reply.text).await {
            Ok(delivery) => Ok(delivery),
            Err(e) => {
                tracing::warn!(
                    conversation_id = %handle.conversation,
                    message_id = handle.message_id,
                    "Final reply update failed, republishing: {e}"
                );
                if let Err(e) = self.sink.delete(&handle).await {
                    tracing::debug!(
                        message_id = handle.message_id,
                        "Stale reply delete failed: {e}"
                    );
                }
                let delivery = self.sink.publish(target, &reply.text).await?;
                Ok(Delivery::new(delivery.handle, Degradation::Republished))
            }
        }
    }

    async fn report_error(&self, target: &ReplyTarget, reason: &str) {
        let text = format!("{ERROR_PREFIX}: {reason}");
        if let Err(e) = self.sink.send_text(target, &text).await {
            tracing::error!(conversation_id = %target.conversation, "Error reply failed: {e}");
        }
    }
}
