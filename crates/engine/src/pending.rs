//! Replies waiting for a connected transport.

use std::collections::{HashMap, VecDeque};

use {
    parley_common::ConversationId,
    serde::{Deserialize, Serialize},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRecord {
    pub message: String,
    /// Unix millis at enqueue time.
    pub timestamp: i64,
}

/// Per-conversation FIFO of undelivered replies. Conversations are
/// flushed in the order they first queued something.
#[derive(Debug, Default)]
pub struct PendingQueue {
    order: Vec<ConversationId>,
    records: HashMap<ConversationId, VecDeque<PendingRecord>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, conversation: &ConversationId, message: String, now_ms: i64) {
        if !self.records.contains_key(conversation) {
            self.order.push(conversation.clone());
        }
        let queue = self.records.entry(conversation.clone()).or_default();
        queue.push_back(PendingRecord {
            message,
            timestamp: now_ms,
        });
    }

    /// Copy of everything currently queued, for one flush pass.
    pub fn plan(&self) -> Vec<(ConversationId, Vec<PendingRecord>)> {
        self.snapshot()
    }

    /// Drop the first `delivered` records of a conversation. Records queued
    /// after the flush pass started are kept.
    pub fn acknowledge(&mut self, conversation: &ConversationId, delivered: usize) {
        let Some(queue) = self.records.get_mut(conversation) else {
            return;
        };
        let n = delivered.min(queue.len());
        queue.drain(..n);
        if queue.is_empty() {
            self.records.remove(conversation);
            self.order.retain(|c| c != conversation);
        }
    }

    /// Total queued records.
    pub fn len(&self) -> usize {
        self.records.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn conversation_count(&self) -> usize {
        self.order.len()
    }

    pub fn snapshot(&self) -> Vec<(ConversationId, Vec<PendingRecord>)> {
        self.order
            .iter()
            .filter_map(|c| {
                self.records
                    .get(c)
                    .map(|q| (c.clone(), q.iter().cloned().collect()))
            })
            .collect()
    }

    /// Load a snapshot, placing its records ahead of anything already
    /// queued for the same conversation.
    pub fn restore(&mut self, entries: Vec<(ConversationId, Vec<PendingRecord>)>) {
        let mut order: Vec<ConversationId> = Vec::new();
        for (conversation, records) in entries {
            if records.is_empty() {
                continue;
            }
            let queue = self.records.entry(conversation.clone()).or_default();
            for record in records.into_iter().rev() {
                queue.push_front(record);
            }
            if !order.contains(&conversation) {
                order.push(conversation);
            }
        }
        for conversation in std::mem::take(&mut self.order) {
            if !order.contains(&conversation) {
                order.push(conversation);
            }
        }
        self.order = order;
    }
}
