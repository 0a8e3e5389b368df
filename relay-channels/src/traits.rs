//! Channel traits for implementing channel adapters.

use crate::message::{ConversationId, IncomingMessage, MessageHandle, ReplyTarget};
use async_trait::async_trait;

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Channel error type.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Rate limited: retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    /// The platform answered but refused the call.
    #[error("API error ({code}): {description}")]
    Api { code: i64, description: String },

    #[error("Message send failed: {0}")]
    SendFailed(String),
}

impl ChannelError {
    /// Whether the platform rejected the rich-text markup of the message.
    pub fn is_markup_rejected(&self) -> bool {
        matches!(self, Self::Api { code: 400, description } if description.contains("parse entities"))
    }

    /// Whether an edit was refused because the content is unchanged.
    pub fn is_not_modified(&self) -> bool {
        matches!(self, Self::Api { code: 400, description } if description.contains("message is not modified"))
    }
}

/// Fallback applied to get a write through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Degradation {
    /// Delivered as requested.
    #[default]
    None,
    /// Rich text was rejected, delivered as plain text.
    PlainText,
    /// An update failed; the old message was replaced by a new one.
    Republished,
}

/// Result of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub handle: MessageHandle,
    pub degradation: Degradation,
}

impl Delivery {
    pub const fn new(handle: MessageHandle, degradation: Degradation) -> Self {
        Self {
            handle,
            degradation,
        }
    }

    pub const fn direct(handle: MessageHandle) -> Self {
        Self::new(handle, Degradation::None)
    }
}

/// Low-level message primitives the relay drives.
///
/// Implementations sanitize outbound text themselves; callers pass the raw
/// model output.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Publish a new message.
    async fn publish(&self, target: &ReplyTarget, text: &str) -> ChannelResult<Delivery>;

    /// Replace the text of a delivered message.
    async fn update(&self, handle: &MessageHandle, text: &str) -> ChannelResult<Delivery>;

    /// Delete a delivered message.
    async fn delete(&self, handle: &MessageHandle) -> ChannelResult<()>;

    /// Show a "typing" indicator in the conversation.
    async fn notify_typing(&self, conversation: ConversationId) -> ChannelResult<()>;

    /// Send a one-off text, split across several messages when too long.
    async fn send_text(&self, target: &ReplyTarget, text: &str) -> ChannelResult<()>;
}

/// Channel adapter trait.
///
/// Implement this trait to add support for a new messaging channel.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Get the channel name.
    fn name(&self) -> &'static str;

    /// Initialize the channel (connect, authenticate, etc.).
    async fn init(&mut self) -> ChannelResult<()>;

    /// Start listening for incoming messages.
    ///
    /// Runs until the surrounding task is dropped, calling `callback` for
    /// every text message.
    async fn listen<F>(&self, callback: F) -> ChannelResult<()>
    where
        F: Fn(IncomingMessage) + Send + Sync + 'static;

    /// Shutdown the channel gracefully.
    async fn shutdown(&self) -> ChannelResult<()>;
}
