//! Telegram channel adapter.
//!
//! Provides the `TelegramChannel` implementation for receiving and sending messages
//! through the Telegram Bot API.

pub mod format;

use crate::message::{ConversationId, IncomingMessage, MessageHandle, RepliedMessage, ReplyTarget};
use crate::traits::{Channel, ChannelError, ChannelResult, Degradation, Delivery, MessageSink};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

/// Default Bot API endpoint.
pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Long-poll timeout passed to `getUpdates`.
const POLL_TIMEOUT_SECS: u64 = 30;

/// Pause after a failed poll.
const POLL_BACKOFF: Duration = Duration::from_secs(5);

// ============================================================================
// Telegram Channel
// ============================================================================

/// Telegram channel - long-polls the Bot API for updates.
pub struct TelegramChannel {
    bot_token: String,
    api_base: String,
    client: reqwest::Client,
    /// Bot user id, known after `init`
    bot_id: Option<i64>,
    bot_username: Option<String>,
}

impl TelegramChannel {
    /// Create a new Telegram channel.
    pub fn new(bot_token: String) -> Self {
        Self {
            bot_token,
            api_base: DEFAULT_API_BASE.to_string(),
            client: reqwest::Client::new(),
            bot_id: None,
            bot_username: None,
        }
    }

    /// Point the channel at another Bot API server.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Bot user id, available once `init` succeeded.
    pub fn bot_id(&self) -> Option<i64> {
        self.bot_id
    }

    pub fn bot_username(&self) -> Option<&str> {
        self.bot_username.as_deref()
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.bot_token)
    }

    /// Call a Bot API method and return its `result`.
    async fn call(&self, method: &str, body: &Value) -> ChannelResult<Value> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;

        let status = resp.status();
        let data: Value = resp
            .json()
            .await
            .map_err(|e| ChannelError::Connection(format!("{method}: invalid response: {e}")))?;

        if data.get("ok").and_then(Value::as_bool) == Some(true) {
            return Ok(data.get("result").cloned().unwrap_or(Value::Null));
        }

        let code = data
            .get("error_code")
            .and_then(Value::as_i64)
            .unwrap_or_else(|| i64::from(status.as_u16()));
        let description = data
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();

        if code == 429 {
            let retry_after_secs = data
                .get("parameters")
                .and_then(|p| p.get("retry_after"))
                .and_then(Value::as_u64)
                .unwrap_or(1);
            return Err(ChannelError::RateLimited { retry_after_secs });
        }
        if code == 401 {
            return Err(ChannelError::Auth(description));
        }
        Err(ChannelError::Api { code, description })
    }

    /// Send one message: HTML first, plain text when Telegram rejects the markup.
    async fn send_message(&self, target: &ReplyTarget, text: &str) -> ChannelResult<Delivery> {
        let mut body = json!({
            "chat_id": target.conversation.as_i64(),
            "text": format::sanitize(text),
            "parse_mode": "HTML",
        });
        if let Some(message_id) = target.reply_to {
            body["reply_parameters"] = json!({
                "message_id": message_id,
                "allow_sending_without_reply": true,
            });
        }

        match self.call("sendMessage", &body).await {
            Ok(result) => Ok(Delivery::direct(self.handle_from(target.conversation, &result)?)),
            Err(e) if e.is_markup_rejected() => {
                tracing::warn!(
                    conversation_id = %target.conversation,
                    "Telegram HTML parsing failed, retrying without parse_mode: {e}"
                );
                body["text"] = Value::String(format::plain(text));
                if let Some(obj) = body.as_object_mut() {
                    obj.remove("parse_mode");
                }
                let result = self.call("sendMessage", &body).await?;
                Ok(Delivery::new(
                    self.handle_from(target.conversation, &result)?,
                    Degradation::PlainText,
                ))
            }
            Err(e) => Err(e),
        }
    }

    /// Edit the text of an existing message.
    async fn edit_message_text(
        &self,
        handle: &MessageHandle,
        text: &str,
    ) -> ChannelResult<Delivery> {
        let mut body = json!({
            "chat_id": handle.conversation.as_i64(),
            "message_id": handle.message_id,
            "text": format::sanitize(text),
            "parse_mode": "HTML",
        });

        let first = match self.call("editMessageText", &body).await {
            Ok(_) => return Ok(Delivery::direct(*handle)),
            Err(e) => e,
        };
        if first.is_not_modified() {
            return Ok(Delivery::direct(*handle));
        }
        if !first.is_markup_rejected() {
            return Err(first);
        }

        tracing::warn!(
            conversation_id = %handle.conversation,
            message_id = handle.message_id,
            "Telegram HTML parsing failed on edit, retrying without parse_mode: {first}"
        );
        body["text"] = Value::String(format::plain(text));
        if let Some(obj) = body.as_object_mut() {
            obj.remove("parse_mode");
        }
        match self.call("editMessageText", &body).await {
            Ok(_) => Ok(Delivery::new(*handle, Degradation::PlainText)),
            Err(e) if e.is_not_modified() => Ok(Delivery::new(*handle, Degradation::PlainText)),
            Err(e) => Err(e),
        }
    }

    fn handle_from(&self, conversation: ConversationId, result: &Value) -> ChannelResult<MessageHandle> {
        result
            .get("message_id")
            .and_then(Value::as_i64)
            .map(|id| MessageHandle::new(conversation, id))
            .ok_or_else(|| ChannelError::SendFailed("response carries no message_id".into()))
    }

    /// Turn one `getUpdates` entry into an incoming message, if it is a text message.
    fn parse_update(update: &Value) -> Option<IncomingMessage> {
        let message = update.get("message")?;
        let text = message.get("text").and_then(Value::as_str)?;
        if text.is_empty() {
            return None;
        }

        let chat_id = message.get("chat")?.get("id")?.as_i64()?;
        let from = message.get("from");
        let reply_to = message.get("reply_to_message").and_then(|r| {
            Some(RepliedMessage {
                message_id: r.get("message_id")?.as_i64()?,
                from_id: r.get("from").and_then(|f| f.get("id")).and_then(Value::as_i64),
                text: r
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            })
        });

        Some(IncomingMessage {
            message_id: message.get("message_id")?.as_i64()?,
            conversation: ConversationId(chat_id),
            user_id: from.and_then(|f| f.get("id")).and_then(Value::as_i64),
            username: from
                .and_then(|f| f.get("username"))
                .and_then(Value::as_str)
                .map(String::from),
            text: text.to_string(),
            reply_to,
            timestamp: message
                .get("date")
                .and_then(Value::as_i64)
                .map_or(0, |secs| secs * 1000),
            trace_id: relay_common::logging::generate_trace_id(),
        })
    }
}

/// Split a message into chunks that fit within Telegram's limit.
///
/// Prefers paragraph, line, sentence and word boundaries; `max_len` counts
/// characters.
fn split_message(message: &str, max_len: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = message;

    while !remaining.is_empty() {
        let chunk = format::truncate_chars(remaining, max_len);
        if chunk.len() == remaining.len() {
            chunks.push(remaining.to_string());
            break;
        }

        let split_pos = chunk
            .rfind("\n\n")
            .or_else(|| chunk.rfind('\n'))
            .or_else(|| chunk.rfind(". ").map(|p| p + 1))
            .or_else(|| chunk.rfind(' '))
            .filter(|p| *p > 0)
            .unwrap_or(chunk.len());

        chunks.push(remaining[..split_pos].to_string());
        remaining = remaining[split_pos..].trim_start();
    }

    chunks
}

#[async_trait]
impl MessageSink for TelegramChannel {
    async fn publish(&self, target: &ReplyTarget, text: &str) -> ChannelResult<Delivery> {
        self.send_message(target, text).await
    }

    async fn update(&self, handle: &MessageHandle, text: &str) -> ChannelResult<Delivery> {
        self.edit_message_text(handle, text).await
    }

    async fn delete(&self, handle: &MessageHandle) -> ChannelResult<()> {
        let body = json!({
            "chat_id": handle.conversation.as_i64(),
            "message_id": handle.message_id,
        });
        self.call("deleteMessage", &body).await.map(|_| ())
    }

    async fn notify_typing(&self, conversation: ConversationId) -> ChannelResult<()> {
        let body = json!({
            "chat_id": conversation.as_i64(),
            "action": "typing",
        });
        self.call("sendChatAction", &body).await.map(|_| ())
    }

    async fn send_text(&self, target: &ReplyTarget, text: &str) -> ChannelResult<()> {
        for chunk in split_message(text, format::MAX_MESSAGE_LEN) {
            self.send_message(target, &chunk).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn init(&mut self) -> ChannelResult<()> {
        // Verify bot token by calling getMe
        let me = self.call("getMe", &json!({})).await.map_err(|e| match e {
            ChannelError::Api { description, .. } => {
                ChannelError::Auth(format!("Invalid bot token: {description}"))
            }
            other => other,
        })?;

        self.bot_id = me.get("id").and_then(Value::as_i64);
        self.bot_username = me.get("username").and_then(Value::as_str).map(String::from);

        tracing::info!(
            bot_id = ?self.bot_id,
            bot_username = ?self.bot_username,
            "Telegram channel initialized"
        );
        Ok(())
    }

    async fn listen<F>(&self, callback: F) -> ChannelResult<()>
    where
        F: Fn(IncomingMessage) + Send + Sync + 'static,
    {
        let mut offset: i64 = 0;

        tracing::info!("Telegram channel listening for messages...");

        loop {
            let body = json!({
                "offset": offset,
                "timeout": POLL_TIMEOUT_SECS,
                "allowed_updates": ["message"],
            });

            let updates = match self.call("getUpdates", &body).await {
                Ok(result) => result,
                Err(ChannelError::RateLimited { retry_after_secs }) => {
                    tracing::warn!(retry_after_secs, "Telegram poll rate limited");
                    tokio::time::sleep(Duration::from_secs(retry_after_secs)).await;
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Telegram poll error: {e}");
                    tokio::time::sleep(POLL_BACKOFF).await;
                    continue;
                }
            };

            let Some(results) = updates.as_array() else {
                continue;
            };

            for update in results {
                if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                    offset = uid + 1;
                }

                let Some(msg) = Self::parse_update(update) else {
                    continue;
                };

                tracing::info!(
                    channel = "telegram",
                    trace_id = %msg.trace_id,
                    conversation_id = %msg.conversation,
                    message_id = msg.message_id,
                    user = %msg.sender(),
                    text = %msg.text,
                    "IM message received"
                );

                callback(msg);
            }
        }
    }

    async fn shutdown(&self) -> ChannelResult<()> {
        tracing::info!("Telegram channel shutting down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telegram_channel_name() {
        let ch = TelegramChannel::new("fake-token".into());
        assert_eq!(ch.name(), "telegram");
    }

    #[test]
    fn telegram_api_url() {
        let ch = TelegramChannel::new("123:ABC".into());
        assert_eq!(
            ch.api_url("getMe"),
            "https://api.telegram.org/bot123:ABC/getMe"
        );

        let ch = TelegramChannel::new("123:ABC".into()).with_api_base("http://localhost:8081/");
        assert_eq!(ch.api_url("getMe"), "http://localhost:8081/bot123:ABC/getMe");
    }

    #[test]
    fn split_message_short() {
        let result = split_message("Hello, World!", 4096);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0], "Hello, World!");
    }

    #[test]
    fn split_message_long() {
        let msg = "x".repeat(5000);
        let result = split_message(&msg, 4096);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].len(), 4096);
    }

    #[test]
    fn split_message_prefers_line_breaks() {
        let msg = format!("{}\n{}", "a".repeat(10), "b".repeat(10));
        let result = split_message(&msg, 15);
        assert_eq!(result, vec!["a".repeat(10), "b".repeat(10)]);
    }

    #[test]
    fn split_message_counts_characters() {
        let msg = "你".repeat(5000);
        let result = split_message(&msg, 4096);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].chars().count(), 4096);
        assert_eq!(result[1].chars().count(), 904);
    }

    #[test]
    fn parse_text_update() {
        let update = json!({
            "update_id": 10,
            "message": {
                "message_id": 5,
                "date": 1_700_000_000,
                "chat": {"id": -100123, "type": "supergroup"},
                "from": {"id": 42, "username": "alice"},
                "text": "/ds hello",
                "reply_to_message": {
                    "message_id": 4,
                    "from": {"id": 99, "is_bot": true},
                    "text": "earlier answer"
                }
            }
        });

        let msg = TelegramChannel::parse_update(&update).unwrap();
        assert_eq!(msg.conversation, ConversationId(-100123));
        assert_eq!(msg.message_id, 5);
        assert_eq!(msg.user_id, Some(42));
        assert_eq!(msg.username.as_deref(), Some("alice"));
        assert_eq!(msg.timestamp, 1_700_000_000_000);
        let reply = msg.reply_to.unwrap();
        assert_eq!(reply.from_id, Some(99));
        assert_eq!(reply.text, "earlier answer");
    }

    #[test]
    fn parse_ignores_non_text_updates() {
        let photo = json!({
            "update_id": 11,
            "message": {"message_id": 6, "chat": {"id": 1}, "photo": []}
        });
        assert!(TelegramChannel::parse_update(&photo).is_none());

        let edited = json!({"update_id": 12, "edited_message": {"text": "x"}});
        assert!(TelegramChannel::parse_update(&edited).is_none());
    }
}
