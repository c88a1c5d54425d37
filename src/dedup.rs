//! Consumer-side event de-duplication
//!
//! Push and poll delivery can both surface the same ledger event. Every
//! consumer keeps an [`EventDeduplicator`] keyed by
//! `(chain, transaction hash, event kind)` and drops repeats.

use crate::types::{EventKey, NormalizedChainEvent};

use std::collections::{HashSet, VecDeque};

/// Bounded set of seen idempotency keys with insertion-order eviction
#[derive(Debug)]
pub struct EventDeduplicator {
    capacity: usize,
    seen: HashSet<EventKey>,
    order: VecDeque<EventKey>,
}

impl EventDeduplicator {
    /// Remember at most `capacity` keys
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Returns `true` the first time an event is seen
    pub fn first_seen(&mut self, event: &NormalizedChainEvent) -> bool {
        self.insert(event.idempotency_key())
    }

    /// Returns `true` if the key was not already present
    pub fn insert(&mut self, key: EventKey) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.seen.insert(key);
        true
    }

    /// Whether a key is currently remembered
    pub fn contains(&self, key: &EventKey) -> bool {
        self.seen.contains(key)
    }

    /// Number of remembered keys
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether no keys are remembered
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChainId, EventKind};

    fn event(tx: &str, kind: EventKind) -> NormalizedChainEvent {
        NormalizedChainEvent {
            kind,
            operation_id: "op".into(),
            chain: ChainId::Arbitrum,
            block_number: 1,
            tx_hash: tx.into(),
            timestamp: 0,
            payload: vec![],
        }
    }

    #[test]
    fn test_replay_is_dropped() {
        let mut dedup = EventDeduplicator::new(8);
        assert!(dedup.first_seen(&event("0xaa", EventKind::VaultUnlocked)));
        assert!(!dedup.first_seen(&event("0xAA", EventKind::VaultUnlocked)));
        // same tx, different kind is a different event
        assert!(dedup.first_seen(&event("0xaa", EventKind::VaultWithdrawal)));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn test_oldest_key_evicted() {
        let mut dedup = EventDeduplicator::new(2);
        let a = event("0x01", EventKind::VaultCreated);
        assert!(dedup.first_seen(&a));
        assert!(dedup.first_seen(&event("0x02", EventKind::VaultCreated)));
        assert!(dedup.first_seen(&event("0x03", EventKind::VaultCreated)));

        assert!(!dedup.contains(&a.idempotency_key()));
        assert!(dedup.first_seen(&a));
    }
}
