//! Streaming completion provider abstraction.
//!
//! A provider opens a completion stream for a [`ChatRequest`]; the stream
//! yields [`StreamEvent`]s until the backend signals the end of the answer.

mod compatible;
pub mod sse;

pub use compatible::CompatibleProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ============================================================================
// Provider Traits
// ============================================================================

/// Interface for streaming chat-completion backends.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Get the provider name.
    fn name(&self) -> &str;

    /// Open a streaming completion for the request.
    ///
    /// Failing here means no partial answer exists.
    async fn open_stream(
        &self,
        request: ChatRequest,
    ) -> Result<Box<dyn CompletionStream>, ProviderError>;

    /// Query the account balance, for backends that expose one.
    async fn balance(&self) -> Result<Balance, ProviderError> {
        Err(ProviderError::new(
            self.name(),
            "",
            "balance is not supported by this provider",
        ))
    }
}

/// An open completion stream.
///
/// `Ok(None)` from [`CompletionStream::next_event`] is the clean end-of-stream
/// signal; `Err` is a transport failure after which the stream is unusable.
#[async_trait]
pub trait CompletionStream: Send {
    /// Wait for the next event.
    async fn next_event(&mut self) -> Result<Option<StreamEvent>, ProviderError>;

    /// Release the underlying connection. Calling it twice is harmless.
    fn close(&mut self);
}

/// Error from a provider.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub provider: String,
    pub model: String,
    pub message: String,
    pub status_code: Option<u16>,
}

impl ProviderError {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            message: message.into(),
            status_code: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.model.is_empty() {
            write!(f, "[{}] {}", self.provider, self.message)
        } else {
            write!(f, "[{}:{}] {}", self.provider, self.model, self.message)
        }
    }
}

impl std::error::Error for ProviderError {}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Speaker of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role-tagged utterance. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    role: Role,
    content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

/// Streaming chat request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    /// Model to use
    pub model: String,
    /// Conversation, oldest first, system preamble included
    pub messages: Vec<Turn>,
    /// Maximum tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

/// One event received from a completion stream.
///
/// Holds one delta per choice; any of them may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamEvent {
    pub deltas: Vec<String>,
    pub finish_reason: Option<String>,
}

impl StreamEvent {
    /// Event with a single delta.
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            deltas: vec![text.into()],
            finish_reason: None,
        }
    }
}

/// Account balance reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Balance {
    pub currency: String,
    pub total_balance: String,
}
