//! Per-conversation debounce of inbound text.

use std::{collections::HashMap, time::Duration};

use {
    parley_common::{ConversationId, DedupKey},
    serde::{Deserialize, Serialize},
    tokio_util::sync::CancellationToken,
};

/// Persisted form of one conversation's unflushed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub messages: Vec<String>,
    /// Unix millis of the latest message in the batch.
    #[serde(rename = "lastMessageTime")]
    pub last_message_time: i64,
}

/// A batch detached for answering.
#[derive(Debug, Clone)]
pub struct Batch {
    pub conversation: ConversationId,
    /// In arrival order.
    pub texts: Vec<String>,
    /// Dedup keys held until the batch is answered.
    pub keys: Vec<DedupKey>,
}

/// Instructions for arming a flush timer. The timer must fire
/// [`BatchAggregator::take_due`] with the same generation after `delay`,
/// unless `cancel` is triggered first.
#[derive(Debug, Clone)]
pub struct FlushTicket {
    pub conversation: ConversationId,
    pub generation: u64,
    pub delay: Duration,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
struct BatchState {
    texts: Vec<String>,
    keys: Vec<DedupKey>,
    last_activity_ms: i64,
    generation: u64,
    timer: CancellationToken,
}

pub struct BatchAggregator {
    quiet_period: Duration,
    states: HashMap<ConversationId, BatchState>,
    next_generation: u64,
    root: CancellationToken,
}

impl BatchAggregator {
    /// Timers armed from the returned tickets are children of `root`.
    pub fn new(quiet_period: Duration, root: CancellationToken) -> Self {
        Self {
            quiet_period,
            states: HashMap::new(),
            next_generation: 0,
            root,
        }
    }

    /// Append `text` and rearm the conversation's timer. Any previously
    /// armed timer is cancelled.
    pub fn push(
        &mut self,
        conversation: &ConversationId,
        text: String,
        key: Option<DedupKey>,
        now_ms: i64,
    ) -> FlushTicket {
        self.next_generation += 1;
        let generation = self.next_generation;
        let timer = self.root.child_token();

        let state = self
            .states
            .entry(conversation.clone())
            .or_insert_with(|| BatchState {
                texts: Vec::new(),
                keys: Vec::new(),
                last_activity_ms: now_ms,
                generation,
                timer: CancellationToken::new(),
            });
        state.timer.cancel();
        state.texts.push(text);
        state.keys.extend(key);
        state.last_activity_ms = now_ms;
        state.generation = generation;
        state.timer = timer.clone();

        FlushTicket {
            conversation: conversation.clone(),
            generation,
            delay: self.quiet_period,
            cancel: timer,
        }
    }

    /// Detach the batch if `generation` is still the armed one. Stale
    /// firings get `None`.
    pub fn take_due(&mut self, conversation: &ConversationId, generation: u64) -> Option<Batch> {
        if self.states.get(conversation)?.generation != generation {
            return None;
        }
        let state = self.states.remove(conversation)?;
        state.timer.cancel();
        if state.texts.is_empty() {
            return None;
        }
        Some(Batch {
            conversation: conversation.clone(),
            texts: state.texts,
            keys: state.keys,
        })
    }

    /// Rebuild batches from a snapshot. Each one is re-armed with what is
    /// left of its quiet period, measured from its last activity.
    pub fn restore(
        &mut self,
        records: impl IntoIterator<Item = (ConversationId, BatchRecord)>,
        now_ms: i64,
    ) -> Vec<FlushTicket> {
        let mut tickets = Vec::new();
        for (conversation, record) in records {
            if record.messages.is_empty() {
                continue;
            }
            self.next_generation += 1;
            let generation = self.next_generation;
            let timer = self.root.child_token();

            let elapsed = u64::try_from(now_ms - record.last_message_time).unwrap_or(0);
            let delay = self
                .quiet_period
                .saturating_sub(Duration::from_millis(elapsed));

            let state = self
                .states
                .entry(conversation.clone())
                .or_insert_with(|| BatchState {
                    texts: Vec::new(),
                    keys: Vec::new(),
                    last_activity_ms: record.last_message_time,
                    generation,
                    timer: CancellationToken::new(),
                });
            state.timer.cancel();
            // Restored texts predate anything received since startup.
            let mut texts = record.messages;
            texts.append(&mut state.texts);
            state.texts = texts;
            state.last_activity_ms = state.last_activity_ms.max(record.last_message_time);
            state.generation = generation;
            state.timer = timer.clone();

            tickets.push(FlushTicket {
                conversation,
                generation,
                delay,
                cancel: timer,
            });
        }
        tickets
    }

    pub fn snapshot(&self) -> HashMap<ConversationId, BatchRecord> {
        self.states
            .iter()
            .map(|(conversation, state)| {
                (conversation.clone(), BatchRecord {
                    messages: state.texts.clone(),
                    last_message_time: state.last_activity_ms,
                })
            })
            .collect()
    }

    /// Conversations with unflushed text.
    pub fn active_count(&self) -> usize {
        self.states.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn aggregator() -> BatchAggregator {
        BatchAggregator::new(Duration::from_secs(5), CancellationToken::new())
    }

    fn conv() -> ConversationId {
        ConversationId::new("15551234567@s.whatsapp.net")
    }

    #[test]
    fn rearming_cancels_previous_timer() {
        let mut agg = aggregator();
        let first = agg.push(&conv(), "hi".into(), None, 1_000);
        let second = agg.push(&conv(), "how are you".into(), None, 2_000);

        assert!(first.cancel.is_cancelled());
        assert!(!second.cancel.is_cancelled());
        assert_eq!(second.delay, Duration::from_secs(5));
        assert!(agg.take_due(&conv(), first.generation).is_none());

        let batch = agg.take_due(&conv(), second.generation).unwrap();
        assert_eq!(batch.texts, vec!["hi", "how are you"]);
        assert_eq!(agg.active_count(), 0);
    }

    #[test]
    fn stale_generation_after_take_is_noop() {
        let mut agg = aggregator();
        let ticket = agg.push(&conv(), "hi".into(), None, 0);
        assert!(agg.take_due(&conv(), ticket.generation).is_some());
        assert!(agg.take_due(&conv(), ticket.generation).is_none());
    }

    #[test]
    fn keys_travel_with_the_batch() {
        let mut agg = aggregator();
        let k1 = DedupKey::new(&conv(), 1, "A");
        let k2 = DedupKey::new(&conv(), 2, "B");
        agg.push(&conv(), "a".into(), Some(k1.clone()), 0);
        let ticket = agg.push(&conv(), "b".into(), Some(k2.clone()), 0);
        let batch = agg.take_due(&conv(), ticket.generation).unwrap();
        assert_eq!(batch.keys, vec![k1, k2]);
    }

    #[test]
    fn conversations_are_independent() {
        let mut agg = aggregator();
        let other = ConversationId::new("2@s.whatsapp.net");
        let a = agg.push(&conv(), "a".into(), None, 0);
        let b = agg.push(&other, "b".into(), None, 0);
        assert!(!a.cancel.is_cancelled());
        assert_eq!(agg.active_count(), 2);
        assert_eq!(agg.take_due(&other, b.generation).unwrap().texts, vec!["b"]);
        assert_eq!(agg.active_count(), 1);
    }

    #[test]
    fn snapshot_then_restore_reproduces_state() {
        let mut agg = aggregator();
        agg.push(&conv(), "one".into(), None, 10_000);
        agg.push(&conv(), "two".into(), None, 12_000);
        let snapshot = agg.snapshot();

        let mut restored = aggregator();
        let tickets = restored.restore(snapshot.clone(), 14_000);
        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].delay, Duration::from_secs(3));
    }

    #[test]
    fn restore_of_expired_batch_fires_immediately() {
        let mut agg = aggregator();
        let tickets = agg.restore(
            [(conv(), BatchRecord {
                messages: vec!["old".into()],
                last_message_time: 0,
            })],
            60_000,
        );
        assert_eq!(tickets[0].delay, Duration::ZERO);
    }

    #[test]
    fn restore_skips_empty_records() {
        let mut agg = aggregator();
        let tickets = agg.restore(
            [(conv(), BatchRecord {
                messages: vec![],
                last_message_time: 0,
            })],
            0,
        );
        assert!(tickets.is_empty());
        assert_eq!(agg.active_count(), 0);
    }

    #[test]
    fn record_uses_camel_case_timestamp() {
        let json = serde_json::to_value(BatchRecord {
            messages: vec!["x".into()],
            last_message_time: 5,
        })
        .unwrap();
        assert_eq!(json["lastMessageTime"], 5);
    }
}
