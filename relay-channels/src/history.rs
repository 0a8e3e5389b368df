//! Bounded per-conversation history.
//!
//! Each conversation keeps its most recent turns, oldest first. Appending past
//! the bound evicts from the front. Histories live for the process lifetime;
//! gate locks are pruned once a conversation has no exchange in flight.
//!
//! The store locks per call only. Two exchanges appending to the same
//! conversation concurrently may interleave their turns, so callers run at
//! most one exchange per conversation at a time; [`ConversationGate`] is the
//! lock the bridge uses for that.

use crate::message::ConversationId;
use dashmap::DashMap;
use relay_gateway::Turn;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Snapshot of one conversation's turns, oldest first.
pub type ConversationHistory = Vec<Turn>;

/// In-memory history keyed by conversation.
#[derive(Debug)]
pub struct HistoryStore {
    bound: usize,
    histories: DashMap<ConversationId, VecDeque<Turn>>,
}

impl HistoryStore {
    /// Create a store keeping at most `bound` turns per conversation.
    ///
    /// A bound of 0 disables context replay.
    pub fn new(bound: usize) -> Self {
        Self {
            bound,
            histories: DashMap::new(),
        }
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    /// Current turns of a conversation, possibly empty.
    pub fn get(&self, conversation: ConversationId) -> ConversationHistory {
        self.histories
            .get(&conversation)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Append turns in order, then evict the oldest down to the bound.
    pub fn append(&self, conversation: ConversationId, turns: impl IntoIterator<Item = Turn>) {
        if self.bound == 0 {
            return;
        }

        let mut history = self.histories.entry(conversation).or_default();
        history.extend(turns);
        while history.len() > self.bound {
            history.pop_front();
        }

        tracing::debug!(
            conversation_id = %conversation,
            turns = history.len(),
            bound = self.bound,
            "History updated"
        );
    }

    /// Number of stored turns for a conversation.
    pub fn len(&self, conversation: ConversationId) -> usize {
        self.histories.get(&conversation).map_or(0, |h| h.len())
    }

    pub fn is_empty(&self, conversation: ConversationId) -> bool {
        self.len(conversation) == 0
    }

    /// Forget a conversation.
    pub fn clear(&self, conversation: ConversationId) {
        self.histories.remove(&conversation);
    }
}

/// Per-conversation exclusive lock held for a whole exchange.
#[derive(Debug, Default)]
pub struct ConversationGate {
    locks: DashMap<ConversationId, Arc<Mutex<()>>>,
}

impl ConversationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other exchange runs on `conversation`.
    pub async fn acquire(&self, conversation: ConversationId) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(conversation)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop the lock of `conversation` when no exchange holds or awaits it.
    pub fn prune(&self, conversation: ConversationId) {
        self.locks
            .remove_if(&conversation, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Number of conversations with a live lock.
    pub fn tracked(&self) -> usize {
        self.locks.len()
    }
}
