//! Relay Common - shared configuration, errors and logging for deeprelay.
//!
//! This crate provides:
//! - Configuration types and loading (file, environment)
//! - Configuration validation
//! - Error types and handling utilities
//! - Logging setup and span helpers

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod validation;

pub use config::{ChatConfig, Config, LlmConfig, ObservabilityConfig, TelegramConfig};
pub use error::{Error, Result, ResultExt};
pub use validation::{Validate, ValidationError, ValidationResult};
