//! Typed event bus
//!
//! One broadcast channel per [`EventCategory`]. Consumers subscribe to the
//! categories they care about, so the set of listeners is known up front
//! and a slow consumer only lags its own receiver.

use crate::types::{EmittedEvent, EventCategory, EventKind, NormalizedChainEvent};

use tokio::sync::broadcast;
use tracing::trace;

/// Name emitted alongside `vault:unlocked` to request cross-chain verification
pub const TRINITY_VERIFY: &str = "trinity:verify";

/// Publish/subscribe hub for emitted events
#[derive(Debug, Clone)]
pub struct EventBus {
    vault: broadcast::Sender<EmittedEvent>,
    trinity: broadcast::Sender<EmittedEvent>,
    htlc: broadcast::Sender<EmittedEvent>,
    emergency: broadcast::Sender<EmittedEvent>,
}

impl EventBus {
    /// Create a bus whose channels each buffer `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self {
            vault: broadcast::channel(capacity).0,
            trinity: broadcast::channel(capacity).0,
            htlc: broadcast::channel(capacity).0,
            emergency: broadcast::channel(capacity).0,
        }
    }

    fn sender(&self, category: EventCategory) -> &broadcast::Sender<EmittedEvent> {
        match category {
            EventCategory::Vault => &self.vault,
            EventCategory::Trinity => &self.trinity,
            EventCategory::Htlc => &self.htlc,
            EventCategory::Emergency => &self.emergency,
        }
    }

    /// Subscribe to one category
    pub fn subscribe(&self, category: EventCategory) -> broadcast::Receiver<EmittedEvent> {
        self.sender(category).subscribe()
    }

    /// Publish a normalized event under its emitted name
    ///
    /// Returns the number of emitted events (two for `VaultUnlocked`).
    pub fn publish(&self, event: &NormalizedChainEvent) -> usize {
        self.emit(event.kind.category(), EmittedEvent::from_normalized(event.kind.event_name(), event));
        if event.kind == EventKind::VaultUnlocked {
            self.emit(EventCategory::Trinity, EmittedEvent::from_normalized(TRINITY_VERIFY, event));
            return 2;
        }
        1
    }

    fn emit(&self, category: EventCategory, event: EmittedEvent) {
        // no subscribers is not an error
        if let Err(e) = self.sender(category).send(event) {
            trace!("No subscribers for {}", e.0.event_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChainId;

    fn event(kind: EventKind) -> NormalizedChainEvent {
        NormalizedChainEvent {
            kind,
            operation_id: "vault-7".into(),
            chain: ChainId::Solana,
            block_number: 99,
            tx_hash: "5sig".into(),
            timestamp: 1_700_000_000,
            payload: vec![1],
        }
    }

    #[tokio::test]
    async fn test_publish_routes_by_category() {
        let bus = EventBus::new(16);
        let mut vault = bus.subscribe(EventCategory::Vault);
        let mut htlc = bus.subscribe(EventCategory::Htlc);

        bus.publish(&event(EventKind::VaultDeposit));
        bus.publish(&event(EventKind::HtlcCreated));

        let emitted = vault.recv().await.unwrap();
        assert_eq!(emitted.event_name, "vault:deposit");
        assert_eq!(emitted.chain_block_number, 99);
        assert_eq!(htlc.recv().await.unwrap().event_name, "htlc:created");
        assert!(vault.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_vault_unlocked_also_emits_verify() {
        let bus = EventBus::new(16);
        let mut vault = bus.subscribe(EventCategory::Vault);
        let mut trinity = bus.subscribe(EventCategory::Trinity);

        assert_eq!(bus.publish(&event(EventKind::VaultUnlocked)), 2);
        assert_eq!(vault.recv().await.unwrap().event_name, "vault:unlocked");

        let verify = trinity.recv().await.unwrap();
        assert_eq!(verify.event_name, TRINITY_VERIFY);
        assert_eq!(verify.vault_or_swap_id, "vault-7");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        assert_eq!(bus.publish(&event(EventKind::EmergencyRecovery)), 1);
    }
}
