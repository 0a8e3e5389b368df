//! deeprelay - Main entry point.

use anyhow::{Context, Result};
use clap::Parser;
use relay_channels::{Channel, ChatBridge, HistoryStore, TelegramChannel};
use relay_common::config::{parse_id_list, Config};
use relay_common::logging::init_logging;
use relay_gateway::{CompatibleProvider, CompletionProvider};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Queue of received messages waiting for a handler task.
const INCOMING_QUEUE: usize = 256;

/// deeprelay - stream DeepSeek answers into Telegram chats.
#[derive(Parser, Debug, Default)]
#[command(name = "relay-channels")]
#[command(version)]
#[command(about = "Relay Telegram chats to a streaming chat-completion backend.", long_about = None)]
struct Cli {
    /// Config file (default: ~/.deeprelay/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// DeepSeek API key
    #[arg(long)]
    ds_api_key: Option<String>,

    /// Telegram bot token
    #[arg(long)]
    bot_token: Option<String>,

    /// System prompt sent before every conversation
    #[arg(long)]
    ds_initial_prompt: Option<String>,

    /// Sampling temperature
    #[arg(long)]
    ds_temperature: Option<f64>,

    /// Upper bound on generated tokens per reply
    #[arg(long)]
    ds_max_reply_tokens: Option<u32>,

    /// Turns replayed per conversation (0 disables history)
    #[arg(long)]
    ds_history_size: Option<usize>,

    /// Comma separated Telegram user ids notified at startup
    #[arg(long)]
    admin_user_ids: Option<String>,

    /// Chat command name, without the leading slash
    #[arg(long)]
    chat_cmd: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long)]
    log_format: Option<String>,
}

impl Cli {
    /// Apply command-line flags on top of the loaded configuration.
    fn apply(&self, config: &mut Config) -> Result<()> {
        if let Some(key) = &self.ds_api_key {
            config.llm.api_key.clone_from(key);
        }
        if let Some(token) = &self.bot_token {
            config.telegram.bot_token.clone_from(token);
        }
        if let Some(prompt) = &self.ds_initial_prompt {
            config.chat.initial_prompt.clone_from(prompt);
        }
        if let Some(temperature) = self.ds_temperature {
            config.llm.temperature = temperature;
        }
        if let Some(tokens) = self.ds_max_reply_tokens {
            config.llm.max_reply_tokens = tokens;
        }
        if let Some(size) = self.ds_history_size {
            config.chat.history_size = size;
        }
        if let Some(raw) = &self.admin_user_ids {
            config.telegram.admin_user_ids = parse_id_list(raw, "admin user ids")?;
        }
        if let Some(cmd) = &self.chat_cmd {
            config.chat.chat_command.clone_from(cmd);
        }
        if let Some(level) = &self.log_level {
            config.observability.log_level.clone_from(level);
        }
        if let Some(format) = &self.log_format {
            config.observability.log_format.clone_from(format);
        }
        Ok(())
    }
}

/// Resolve configuration: defaults, then file, then environment, then flags.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let env: HashMap<String, String> = std::env::vars().collect();
    config.apply_env_overrides(&env)?;
    cli.apply(&mut config)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    // Initialize logging
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    config.ensure_valid()?;

    tracing::info!("deeprelay v{}", env!("CARGO_PKG_VERSION"));

    let mut telegram = TelegramChannel::new(config.telegram.bot_token.clone());
    if let Some(api_base) = &config.telegram.api_base {
        telegram = telegram.with_api_base(api_base.as_str());
    }
    telegram.init().await.context("can't init telegram bot")?;
    let telegram = Arc::new(telegram);

    let provider: Arc<dyn CompletionProvider> = Arc::new(CompatibleProvider::new(
        "deepseek",
        &config.llm.base_url,
        &config.llm.api_key,
    ));
    let history = Arc::new(HistoryStore::new(config.chat.history_size));
    let bridge = Arc::new(
        ChatBridge::new(&config, provider, telegram.clone(), history)
            .with_bot_id(telegram.bot_id()),
    );

    bridge.notify_admins("🤖 Bot started").await;

    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(INCOMING_QUEUE);
    let processor = ChatBridge::spawn_processor(bridge, rx, cancel.clone());

    tokio::select! {
        result = telegram.listen(move |message| {
            if let Err(e) = tx.try_send(message) {
                tracing::warn!("Dropping incoming message: {e}");
            }
        }) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    cancel.cancel();
    if let Err(e) = processor.await {
        tracing::warn!("Bridge processor ended abnormally: {e}");
    }
    telegram.shutdown().await?;

    Ok(())
}
