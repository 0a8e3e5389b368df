//! Configuration management for deeprelay.
//!
//! The relay reads an optional JSON file at `~/.deeprelay/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Command-line flags (applied by the binary)
//! 2. Environment variables
//! 3. Config file values
//! 4. Default values
//!
//! # Environment Variable Mapping
//!
//! - `DS_API_KEY` → llm.api_key
//! - `DS_BASE_URL` → llm.base_url
//! - `DS_MODEL` → llm.model
//! - `DS_TEMPERATURE` → llm.temperature
//! - `DS_MAX_REPLY_TOKENS` → llm.max_reply_tokens
//! - `DS_INITIAL_PROMPT` → chat.initial_prompt
//! - `DS_HISTORY_SIZE` → chat.history_size
//! - `BOT_TOKEN` → telegram.bot_token
//! - `ADMIN_USERIDS` → telegram.admin_user_ids (comma separated)
//! - `RELAY_LOG_LEVEL` → observability.log_level

use crate::error::{Error, Result, ResultExt};
use crate::validation::Validate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".deeprelay"),
        |dirs| dirs.home_dir().join(".deeprelay"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration for the relay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub chat: ChatConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ============================================================================
// Telegram
// ============================================================================

/// Telegram bot configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot API token
    #[serde(default)]
    pub bot_token: String,

    /// Users notified when the relay starts
    #[serde(default)]
    pub admin_user_ids: Vec<i64>,

    /// Bot API base URL override (tests, local Bot API servers)
    #[serde(default)]
    pub api_base: Option<String>,
}

// ============================================================================
// Completion backend
// ============================================================================

/// Streaming completion backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: String,

    /// OpenAI-compatible API root (without `/chat/completions`)
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Upper bound on generated tokens per reply
    #[serde(default = "default_max_reply_tokens")]
    pub max_reply_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_reply_tokens: default_max_reply_tokens(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.deepseek.com".into()
}

fn default_model() -> String {
    "deepseek-chat".into()
}

const fn default_temperature() -> f64 {
    1.3
}

const fn default_max_reply_tokens() -> u32 {
    2048
}

// ============================================================================
// Chat behaviour
// ============================================================================

/// Conversation behaviour: preamble, history bound, throttling, command name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// System preamble sent first in every request
    #[serde(default)]
    pub initial_prompt: String,

    /// Maximum number of turns replayed per conversation (0 disables replay)
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// Command that starts a chat exchange, without the leading `/`
    #[serde(default = "default_chat_command")]
    pub chat_command: String,

    /// Minimum spacing between visible edits in private chats
    #[serde(default = "default_private_reply_interval_ms")]
    pub private_reply_interval_ms: u64,

    /// Minimum spacing between visible edits in groups
    #[serde(default = "default_group_reply_interval_ms")]
    pub group_reply_interval_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            initial_prompt: String::new(),
            history_size: default_history_size(),
            chat_command: default_chat_command(),
            private_reply_interval_ms: default_private_reply_interval_ms(),
            group_reply_interval_ms: default_group_reply_interval_ms(),
        }
    }
}

impl ChatConfig {
    pub fn private_reply_interval(&self) -> Duration {
        Duration::from_millis(self.private_reply_interval_ms)
    }

    pub fn group_reply_interval(&self) -> Duration {
        Duration::from_millis(self.group_reply_interval_ms)
    }
}

const fn default_history_size() -> usize {
    4
}

fn default_chat_command() -> String {
    "ds".into()
}

const fn default_private_reply_interval_ms() -> u64 {
    1000
}

const fn default_group_reply_interval_ms() -> u64 {
    3000
}

// ============================================================================
// Observability
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// Loading
// ============================================================================

impl Config {
    /// Load configuration from the default path, falling back to defaults.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).context(format!("failed to read {}", path.display()))?;

        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Validate the fully resolved configuration.
    pub fn ensure_valid(&self) -> Result<()> {
        self.validate().context("invalid configuration")
    }

    /// Apply environment overrides from the given variable map.
    ///
    /// Malformed numeric values and ID lists are configuration errors.
    pub fn apply_env_overrides(&mut self, env: &HashMap<String, String>) -> Result<()> {
        let get = |key: &str| env.get(key).filter(|v| !v.is_empty());

        if let Some(key) = get("DS_API_KEY") {
            self.llm.api_key = key.clone();
        }
        if let Some(url) = get("DS_BASE_URL") {
            self.llm.base_url = url.clone();
        }
        if let Some(model) = get("DS_MODEL") {
            self.llm.model = model.clone();
        }
        if let Some(raw) = get("DS_TEMPERATURE") {
            self.llm.temperature = raw
                .parse()
                .map_err(|_| Error::Config(format!("invalid temperature: {raw}")))?;
        }
        if let Some(raw) = get("DS_MAX_REPLY_TOKENS") {
            self.llm.max_reply_tokens = raw
                .parse()
                .map_err(|_| Error::Config(format!("invalid max reply tokens: {raw}")))?;
        }
        if let Some(prompt) = get("DS_INITIAL_PROMPT") {
            self.chat.initial_prompt = prompt.clone();
        }
        if let Some(raw) = get("DS_HISTORY_SIZE") {
            self.chat.history_size = raw
                .parse()
                .map_err(|_| Error::Config(format!("invalid history size: {raw}")))?;
        }
        if let Some(token) = get("BOT_TOKEN") {
            self.telegram.bot_token = token.clone();
        }
        if let Some(raw) = get("ADMIN_USERIDS") {
            self.telegram.admin_user_ids = parse_id_list(raw, "admin user ids")?;
        }
        if let Some(level) = get("RELAY_LOG_LEVEL") {
            self.observability.log_level = level.clone();
        }

        Ok(())
    }
}

/// Parse a comma separated list of Telegram IDs. Empty entries are skipped.
pub fn parse_id_list(raw: &str, what: &str) -> Result<Vec<i64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|_| Error::Config(format!("{what} contains invalid ID: {s}")))
        })
        .collect()
}
