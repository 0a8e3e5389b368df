//! Message types for channel communication.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one chat on the messaging platform.
///
/// Telegram uses negative ids for groups and channels, non-negative ids for
/// private chats with a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub i64);

impl ConversationId {
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Conversation class, used to pick the reply interval and threading.
    pub const fn kind(self) -> ChatKind {
        if self.0 < 0 {
            ChatKind::Group
        } else {
            ChatKind::Private
        }
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Conversation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Private,
    Group,
}

impl ChatKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Group => "group",
        }
    }
}

/// Incoming text message, already stripped of platform noise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    /// Platform message id
    pub message_id: i64,
    /// Chat the message was posted in
    pub conversation: ConversationId,
    /// Sender user id
    pub user_id: Option<i64>,
    /// Sender username, when the user has one
    pub username: Option<String>,
    /// Message text
    pub text: String,
    /// The message this one replies to
    #[serde(default)]
    pub reply_to: Option<RepliedMessage>,
    /// Timestamp (Unix millis)
    pub timestamp: i64,
    /// Trace id carried through every log line of this message
    pub trace_id: String,
}

impl IncomingMessage {
    /// Sender identity for logs.
    pub fn sender(&self) -> String {
        match (&self.username, self.user_id) {
            (Some(name), Some(id)) => format!("{name}#{id}"),
            (Some(name), None) => name.clone(),
            (None, Some(id)) => format!("#{id}"),
            (None, None) => "unknown".to_string(),
        }
    }
}

/// The message an incoming message replies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepliedMessage {
    pub message_id: i64,
    /// Author of the replied-to message
    pub from_id: Option<i64>,
    /// Its text, empty for media messages
    #[serde(default)]
    pub text: String,
}

/// Handle to a message the relay has delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageHandle {
    pub conversation: ConversationId,
    pub message_id: i64,
}

impl MessageHandle {
    pub const fn new(conversation: ConversationId, message_id: i64) -> Self {
        Self {
            conversation,
            message_id,
        }
    }
}

/// Where a new message is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTarget {
    pub conversation: ConversationId,
    /// Message to thread the reply under
    pub reply_to: Option<i64>,
}

impl ReplyTarget {
    /// A standalone message in the conversation.
    pub const fn standalone(conversation: ConversationId) -> Self {
        Self {
            conversation,
            reply_to: None,
        }
    }

    /// A reply threaded under `message_id`.
    pub const fn in_thread(conversation: ConversationId, message_id: i64) -> Self {
        Self {
            conversation,
            reply_to: Some(message_id),
        }
    }

    /// Threading policy: private chats get standalone messages, groups
    /// always reply under the triggering message.
    pub fn for_message(message: &IncomingMessage) -> Self {
        match message.conversation.kind() {
            ChatKind::Private => Self::standalone(message.conversation),
            ChatKind::Group => Self::in_thread(message.conversation, message.message_id),
        }
    }
}
