//! Relay Channels - Telegram relay for streaming chat completions.
//!
//! This crate provides:
//! - The Telegram channel adapter and its HTML sanitizer
//! - The bounded per-conversation history store
//! - The streaming delivery engine (throttled edits, final flush, recovery)
//! - The chat bridge dispatching commands and chat exchanges
//!
//! ## Architecture
//!
//! ```text
//! Telegram → listen → ChatBridge → StreamingEngine → CompletionProvider
//!                         ↓               ↓
//!                   HistoryStore     MessageSink (publish / update / delete)
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod bridge;
pub mod history;
pub mod message;
pub mod streaming;
pub mod telegram;
pub mod traits;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use bridge::{parse_command, ChatBridge, Command, Handled, ParsedCommand};
pub use history::{ConversationGate, ConversationHistory, HistoryStore};
pub use message::{ChatKind, ConversationId, IncomingMessage, MessageHandle, RepliedMessage, ReplyTarget};
pub use streaming::{
    Exchange, ExchangeError, ExchangeOutcome, RequestContext, StreamingEngine, ERROR_PREFIX,
};
pub use telegram::TelegramChannel;
pub use traits::{Channel, ChannelError, ChannelResult, Degradation, Delivery, MessageSink};
