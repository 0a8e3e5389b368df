//! Chat bridge between the messaging channel and the completion backend.
//!
//! Handles the complete message flow:
//! 1. Receive an `IncomingMessage` from the channel listener
//! 2. Parse commands (`/ds`, `/dsbalance`, `/dshelp`, `/start`)
//! 3. Run chat exchanges through the streaming engine, one at a time per conversation
//! 4. Reply to everything else directly through the sink

use crate::history::{ConversationGate, HistoryStore};
use crate::message::{ChatKind, ConversationId, IncomingMessage, ReplyTarget};
use crate::streaming::{
    Exchange, ExchangeError, ExchangeOutcome, RequestContext, StreamingEngine, ERROR_PREFIX,
};
use crate::traits::MessageSink;
use relay_common::config::{ChatConfig, Config, LlmConfig};
use relay_gateway::{CompletionProvider, Turn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

const WELCOME_TEXT: &str =
    "🤖 Welcome! This is the DeepSeek Telegram relay.\n\nSend /dshelp to list the available commands.";

// ============================================================================
// Command Parsing
// ============================================================================

/// A recognized command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Chat with the given text
    Chat(String),
    Balance,
    Help,
    Start,
    /// Anything else starting with a command prefix
    Unknown(String),
}

/// A command with the prefix character it was written with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub command: Command,
    pub prefix: char,
}

/// Parse `/cmd[@bot] text` or `!cmd[@bot] text`; `None` for plain text.
pub fn parse_command(text: &str, chat_command: &str) -> Option<ParsedCommand> {
    let prefix = text.chars().next().filter(|c| *c == '/' || *c == '!')?;

    let (head, rest) = match text.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim_start()),
        None => (text, ""),
    };
    let name = head[prefix.len_utf8()..]
        .split('@')
        .next()
        .unwrap_or_default();

    let command = match name {
        _ if name == chat_command => Command::Chat(rest.to_string()),
        "dsbalance" => Command::Balance,
        "dshelp" => Command::Help,
        "start" => Command::Start,
        other => Command::Unknown(other.to_string()),
    };
    Some(ParsedCommand { command, prefix })
}

// ============================================================================
// Chat Bridge
// ============================================================================

/// How a message was handled.
#[derive(Debug, Clone)]
pub enum Handled {
    /// A chat exchange ran
    Exchange(ExchangeOutcome),
    /// A command was answered directly
    Replied,
    /// Nothing addressed to the relay
    Ignored,
}

/// Routes incoming messages to commands and chat exchanges.
pub struct ChatBridge {
    engine: StreamingEngine,
    provider: Arc<dyn CompletionProvider>,
    sink: Arc<dyn MessageSink>,
    gate: ConversationGate,
    chat: ChatConfig,
    llm: LlmConfig,
    admin_user_ids: Vec<i64>,
    bot_id: Option<i64>,
}

impl ChatBridge {
    /// Create a new bridge.
    pub fn new(
        config: &Config,
        provider: Arc<dyn CompletionProvider>,
        sink: Arc<dyn MessageSink>,
        history: Arc<HistoryStore>,
    ) -> Self {
        Self {
            engine: StreamingEngine::new(provider.clone(), sink.clone(), history),
            provider,
            sink,
            gate: ConversationGate::new(),
            chat: config.chat.clone(),
            llm: config.llm.clone(),
            admin_user_ids: config.telegram.admin_user_ids.clone(),
            bot_id: None,
        }
    }

    /// Set the bot's own user id, enabling replies-to-bot as implicit chat.
    pub fn with_bot_id(mut self, bot_id: Option<i64>) -> Self {
        self.bot_id = bot_id;
        self
    }

    fn reply_interval(&self, kind: ChatKind) -> Duration {
        match kind {
            ChatKind::Private => self.chat.private_reply_interval(),
            ChatKind::Group => self.chat.group_reply_interval(),
        }
    }

    fn is_reply_to_bot(&self, message: &IncomingMessage) -> bool {
        match (self.bot_id, &message.reply_to) {
            (Some(bot), Some(replied)) => replied.from_id == Some(bot),
            _ => false,
        }
    }

    /// Handle one incoming message.
    pub async fn handle(
        &self,
        message: IncomingMessage,
        cancel: &CancellationToken,
    ) -> Result<Handled, ExchangeError> {
        let kind = message.conversation.kind();
        let target = ReplyTarget::for_message(&message);

        if let Some(parsed) = parse_command(&message.text, &self.chat.chat_command) {
            match parsed.command {
                Command::Chat(text) => {
                    tracing::debug!("Interpreting as chat command");
                    return self.chat(&message, text, cancel).await;
                }
                Command::Balance => self.balance(&target).await,
                Command::Help => self.reply(&target, &self.help_text(parsed.prefix)).await,
                Command::Start if kind == ChatKind::Private => {
                    self.reply(&target, WELCOME_TEXT).await;
                }
                Command::Start => return Ok(Handled::Ignored),
                Command::Unknown(name) => {
                    tracing::debug!(command = %name, "Invalid command");
                    if kind == ChatKind::Group {
                        return Ok(Handled::Ignored);
                    }
                    self.reply(&target, &format!("{ERROR_PREFIX}: invalid command"))
                        .await;
                }
            }
            return Ok(Handled::Replied);
        }

        if kind == ChatKind::Private || self.is_reply_to_bot(&message) {
            let text = message.text.clone();
            return self.chat(&message, text, cancel).await;
        }

        tracing::debug!("Group message not addressed to the relay, ignoring");
        Ok(Handled::Ignored)
    }

    async fn chat(
        &self,
        message: &IncomingMessage,
        text: String,
        cancel: &CancellationToken,
    ) -> Result<Handled, ExchangeError> {
        let conversation = message.conversation;
        let target = ReplyTarget::for_message(message);
        let replied_to = message
            .reply_to
            .as_ref()
            .filter(|r| !r.text.is_empty())
            .map(|r| Turn::assistant(r.text.clone()));

        if text.trim().is_empty() && replied_to.is_none() {
            self.reply(&target, &format!("{ERROR_PREFIX}: empty message"))
                .await;
            return Ok(Handled::Replied);
        }

        let turn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExchangeError::Cancelled),
            guard = self.gate.acquire(conversation) => guard,
        };

        let request = RequestContext::new(self.llm.model.clone(), Turn::user(text))
            .with_system_prompt(&self.chat.initial_prompt)
            .with_history(self.engine.history().get(conversation))
            .with_replied_to(replied_to)
            .with_sampling(self.llm.max_reply_tokens, self.llm.temperature);

        let exchange = Exchange {
            target,
            request,
            min_reply_interval: self.reply_interval(conversation.kind()),
        };

        let result = self.engine.run(exchange, cancel).await;
        drop(turn);
        self.gate.prune(conversation);
        result.map(Handled::Exchange)
    }

    async fn balance(&self, target: &ReplyTarget) {
        let text = match self.provider.balance().await {
            Ok(balance) => format!("💰 {} {}", balance.total_balance, balance.currency),
            Err(e) => {
                tracing::warn!("Balance query failed: {e}");
                format!("{ERROR_PREFIX}: {}", e.message)
            }
        };
        self.reply(target, &text).await;
    }

    fn help_text(&self, prefix: char) -> String {
        format!(
            "🤖 DeepSeek Telegram relay\n\n\
             Available commands:\n\n\
             {prefix}{} - send chat message\n\
             {prefix}dsbalance - show balance\n\
             {prefix}dshelp - show this help",
            self.chat.chat_command
        )
    }

    async fn reply(&self, target: &ReplyTarget, text: &str) {
        if let Err(e) = self.sink.send_text(target, text).await {
            tracing::error!(conversation_id = %target.conversation, "Reply failed: {e}");
        }
    }

    /// Send a text to every configured admin user.
    pub async fn notify_admins(&self, text: &str) {
        for id in &self.admin_user_ids {
            let target = ReplyTarget::standalone(ConversationId(*id));
            if let Err(e) = self.sink.send_text(&target, text).await {
                tracing::warn!(admin_id = id, "Admin notification failed: {e}");
            }
        }
    }

    /// Start a background processor that handles messages from a channel.
    pub fn spawn_processor(
        bridge: Arc<Self>,
        mut rx: mpsc::Receiver<IncomingMessage>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Chat bridge processor started");

            while let Some(message) = rx.recv().await {
                let bridge = bridge.clone();
                let cancel = cancel.clone();
                let span = relay_common::channel_span!(
                    "telegram",
                    message.trace_id,
                    conversation_id = %message.conversation,
                    chat_kind = message.conversation.kind().as_str(),
                    message_id = message.message_id
                );

                // Process each message in its own task
                tokio::spawn(
                    async move {
                        match bridge.handle(message, &cancel).await {
                            Ok(_) => {}
                            Err(ExchangeError::Cancelled) => {
                                tracing::debug!("Exchange cancelled");
                            }
                            Err(e) => tracing::warn!(error = %e, "Exchange failed"),
                        }
                    }
                    .instrument(span),
                );
            }

            tracing::info!("Chat bridge processor stopped");
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
