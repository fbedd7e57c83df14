//! Bounded ledger of recently seen inbound messages.

use std::collections::{HashSet, VecDeque};

use parley_common::DedupKey;

/// How a processing slot ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Remember the key so later redeliveries are dropped.
    Completed,
    /// Forget the key so a redelivery is processed again.
    Abandoned,
}

/// At-most-once gate for inbound messages.
///
/// A key is either unknown, in progress, or seen. Seen keys are kept in
/// insertion order; once the set grows past `capacity` the oldest half is
/// evicted.
#[derive(Debug)]
pub struct DedupLedger {
    capacity: usize,
    seen: HashSet<DedupKey>,
    order: VecDeque<DedupKey>,
    in_progress: HashSet<DedupKey>,
}

impl DedupLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
            in_progress: HashSet::new(),
        }
    }

    /// Claim `key` for processing. Returns `false` if it is already seen or
    /// being processed.
    pub fn try_acquire(&mut self, key: &DedupKey) -> bool {
        if self.seen.contains(key) || self.in_progress.contains(key) {
            return false;
        }
        self.in_progress.insert(key.clone());
        true
    }

    pub fn release(&mut self, key: &DedupKey, how: Release) {
        if !self.in_progress.remove(key) {
            return;
        }
        if how == Release::Completed && self.seen.insert(key.clone()) {
            self.order.push_back(key.clone());
            if self.seen.len() > self.capacity {
                self.evict_oldest_half();
            }
        }
    }

    fn evict_oldest_half(&mut self) {
        let evict = self.seen.len() / 2;
        for key in self.order.drain(..evict) {
            self.seen.remove(&key);
        }
    }

    /// Number of remembered keys.
    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    pub fn in_progress_len(&self) -> usize {
        self.in_progress.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, parley_common::ConversationId};

    fn key(n: i64) -> DedupKey {
        DedupKey::new(&ConversationId::new("1@s.whatsapp.net"), n, "MSG")
    }

    #[test]
    fn same_key_is_acquired_once() {
        let mut ledger = DedupLedger::new(200);
        let k = key(1);
        assert!(ledger.try_acquire(&k));
        assert!(!ledger.try_acquire(&k));
        ledger.release(&k, Release::Completed);
        assert!(!ledger.try_acquire(&k));
    }

    #[test]
    fn abandoned_key_can_be_retried() {
        let mut ledger = DedupLedger::new(200);
        let k = key(1);
        assert!(ledger.try_acquire(&k));
        ledger.release(&k, Release::Abandoned);
        assert_eq!(ledger.seen_len(), 0);
        assert!(ledger.try_acquire(&k));
    }

    #[test]
    fn release_without_acquire_is_ignored() {
        let mut ledger = DedupLedger::new(200);
        ledger.release(&key(1), Release::Completed);
        assert_eq!(ledger.seen_len(), 0);
        assert!(ledger.try_acquire(&key(1)));
    }

    #[test]
    fn overflow_evicts_oldest_half() {
        let mut ledger = DedupLedger::new(4);
        for n in 0..5 {
            let k = key(n);
            assert!(ledger.try_acquire(&k));
            ledger.release(&k, Release::Completed);
        }
        // 5 > 4, so the two oldest were dropped.
        assert_eq!(ledger.seen_len(), 3);
        assert!(ledger.try_acquire(&key(0)));
        assert!(ledger.try_acquire(&key(1)));
        assert!(!ledger.try_acquire(&key(2)));
        assert!(!ledger.try_acquire(&key(4)));
    }

    #[test]
    fn in_progress_keys_are_never_evicted() {
        let mut ledger = DedupLedger::new(2);
        let held = key(100);
        assert!(ledger.try_acquire(&held));
        for n in 0..10 {
            let k = key(n);
            ledger.try_acquire(&k);
            ledger.release(&k, Release::Completed);
        }
        assert!(!ledger.try_acquire(&held));
        assert_eq!(ledger.in_progress_len(), 1);
    }
}
