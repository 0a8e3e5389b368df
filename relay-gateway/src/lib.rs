//! Relay Gateway - streaming LLM provider clients.
//!
//! This crate provides:
//! - The [`CompletionProvider`] / [`CompletionStream`] abstraction
//! - An OpenAI-compatible streaming client with a DeepSeek preset
//! - An incremental SSE decoder

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod provider;

pub use provider::{
    Balance, ChatRequest, CompatibleProvider, CompletionProvider, CompletionStream, ProviderError,
    Role, StreamEvent, Turn,
};
