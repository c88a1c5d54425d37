//! Trinity Coordinator
//!
//! Wires the endpoint registry, router, observers, enclave bridge,
//! consensus verifier and HTLC state machine into one service object.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    TRINITY COORDINATOR                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐          │
//! │  │  Arbitrum   │  │   Solana    │  │     TON     │ observers│
//! │  └──────┬──────┘  └──────┬──────┘  └──────┬──────┘          │
//! │         └── events ──────┼── verification ┘                 │
//! │                          ▼                                  │
//! │  ┌───────────────────────────────┐  ┌─────────────────────┐ │
//! │  │ CONSENSUS VERIFIER (2-of-3)   │  │ HTLC STATE MACHINE  │ │
//! │  └───────────────┬───────────────┘  └──────────┬──────────┘ │
//! │                  └────── ENCLAVE BRIDGE ───────┘            │
//! ├─────────────────────────────────────────────────────────────┤
//! │      ENDPOINT REGISTRY  ──►  OPERATION ROUTER               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every consensus-relevant event makes the observing chain's enclave
//! sign a vote. Events that gate fund release additionally ask the other
//! chains' enclaves to verify the operation and vote at once.

use crate::clock::{ChainClock, Clock, SystemClock};
use crate::config::TrinityConfig;
use crate::consensus::{vote_digest, ChainVote, ConsensusStatus, ConsensusVerifier, Decision, VoteOutcome};
use crate::crypto::{hash_concat, sha256};
use crate::dedup::EventDeduplicator;
use crate::enclave::{BridgeMetrics, ConnectionStatus, EnclaveBridge, VaultPayload};
use crate::error::{TrinityError, TrinityResult};
use crate::events::EventBus;
use crate::htlc::{HtlcStateMachine, HtlcSwap, SwapReceipt, SwapState};
use crate::observer::ChainObserver;
use crate::registry::{EndpointRegistry, EndpointSnapshot};
use crate::router::{ExecutionReceipt, OperationRouter, RouteQuote, RouterMetrics};
use crate::rpc::{ChainRpc, RawChainEvent};
use crate::types::{
    ChainId, EmittedEvent, EventCategory, EventKind, NormalizedChainEvent, OperationKind, Priority,
    Signature,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Hash a chain asserts for an operation: operation id and event payload
pub fn operation_hash(operation_id: &str, payload: &[u8]) -> [u8; 32] {
    let id_len = (operation_id.len() as u32).to_be_bytes();
    hash_concat(&[&id_len, operation_id.as_bytes(), payload])
}

/// Payload hash a chain votes when its enclave disputes an operation
///
/// Chain-specific, so two dissenting chains never agree with each other.
fn dissent_hash(chain: ChainId, hash: &[u8; 32]) -> [u8; 32] {
    hash_concat(&[b"dissent", &[chain.as_u8()], hash])
}

/// Enclave vault key for a vault id
pub fn vault_key(vault_id: &str) -> [u8; 32] {
    sha256(vault_id.as_bytes())
}

/// Coordinator counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorStats {
    /// Observer events handled after de-duplication
    pub events_processed: u64,
    /// Events dropped as already seen
    pub duplicate_events: u64,
    /// Votes accepted by the verifier
    pub votes_cast: u64,
    /// Votes that could not be signed or were refused
    pub vote_failures: u64,
    /// Immediate cross-chain verifications raised
    pub verifications_triggered: u64,
    /// Operations that reached quorum
    pub operations_approved: u64,
    /// Operations rejected on conflicting votes
    pub operations_rejected: u64,
    /// Swaps registered
    pub swaps_initiated: u64,
    /// Swaps locked from source-chain events
    pub swaps_locked: u64,
    /// Swaps claimed
    pub swaps_claimed: u64,
    /// Swaps refunded
    pub swaps_refunded: u64,
    /// Vault deposits authorized
    pub vault_deposits: u64,
    /// Vault withdrawals authorized
    pub vault_withdrawals: u64,
}

#[derive(Default)]
struct StatsInternal {
    events_processed: AtomicU64,
    duplicate_events: AtomicU64,
    votes_cast: AtomicU64,
    vote_failures: AtomicU64,
    verifications_triggered: AtomicU64,
    operations_approved: AtomicU64,
    operations_rejected: AtomicU64,
    swaps_initiated: AtomicU64,
    swaps_locked: AtomicU64,
    swaps_claimed: AtomicU64,
    swaps_refunded: AtomicU64,
    vault_deposits: AtomicU64,
    vault_withdrawals: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Trinity Coordinator - cross-chain consensus and swap service
pub struct TrinityCoordinator {
    config: TrinityConfig,
    rpc: Arc<dyn ChainRpc>,
    registry: Arc<EndpointRegistry>,
    router: OperationRouter,
    bus: EventBus,
    observers: BTreeMap<ChainId, Arc<ChainObserver>>,
    bridge: Arc<EnclaveBridge>,
    verifier: Arc<ConsensusVerifier>,
    htlc: Arc<HtlcStateMachine>,
    chain_clock: Arc<ChainClock>,
    event_dedup: Mutex<EventDeduplicator>,
    verify_dedup: Mutex<EventDeduplicator>,
    verifications: Mutex<Option<mpsc::Receiver<NormalizedChainEvent>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stats: StatsInternal,
}

impl TrinityCoordinator {
    /// Build a coordinator reading time from the system clock
    pub fn new(config: TrinityConfig, rpc: Arc<dyn ChainRpc>, bridge: Arc<EnclaveBridge>) -> TrinityResult<Self> {
        Self::with_clock(config, rpc, bridge, Arc::new(SystemClock))
    }

    /// Build a coordinator whose chain clock falls back to `fallback`
    pub fn with_clock(
        config: TrinityConfig,
        rpc: Arc<dyn ChainRpc>,
        bridge: Arc<EnclaveBridge>,
        fallback: Arc<dyn Clock>,
    ) -> TrinityResult<Self> {
        config.validate().map_err(TrinityError::ConfigurationError)?;

        let registry = Arc::new(EndpointRegistry::new(config.router.clone()));
        let router = OperationRouter::new(registry.clone(), rpc.clone());
        let bus = EventBus::new(config.observer.bus_capacity);
        let chain_clock = Arc::new(ChainClock::new(fallback, config.observer.chain_clock_staleness_secs));

        let (verify_tx, verify_rx) = mpsc::channel(config.observer.bus_capacity);
        let observers = ChainId::ALL
            .iter()
            .map(|chain| {
                let observer = ChainObserver::new(
                    *chain,
                    registry.clone(),
                    rpc.clone(),
                    config.observer.clone(),
                    bus.clone(),
                )
                .with_verification(verify_tx.clone())
                .with_chain_clock(chain_clock.clone());
                (*chain, Arc::new(observer))
            })
            .collect();

        let verifier = Arc::new(ConsensusVerifier::new(config.consensus.clone()).with_bridge(bridge.clone()));
        let htlc = Arc::new(HtlcStateMachine::new(
            config.htlc.clone(),
            bridge.clone(),
            chain_clock.clone(),
        ));
        let dedup_capacity = config.observer.dedup_capacity;

        Ok(Self {
            config,
            rpc,
            registry,
            router,
            bus,
            observers,
            bridge,
            verifier,
            htlc,
            chain_clock,
            event_dedup: Mutex::new(EventDeduplicator::new(dedup_capacity)),
            verify_dedup: Mutex::new(EventDeduplicator::new(dedup_capacity)),
            verifications: Mutex::new(Some(verify_rx)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stats: StatsInternal::default(),
        })
    }

    /// Connect the enclaves and spawn every background task
    ///
    /// Returns how many enclaves came up. Chains whose enclave is down keep
    /// observing; the heartbeat reconnects them later.
    pub async fn start(self: &Arc<Self>) -> TrinityResult<usize> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(TrinityError::InternalError("coordinator already started".into()));
        }
        let connected = self.bridge.connect_all().await;
        info!(
            "Starting Trinity coordinator: {}/{} enclaves connected, quorum {}-of-{}",
            connected,
            self.bridge.chains().len(),
            self.config.consensus.required_quorum,
            self.config.consensus.total_chains
        );

        let mut tasks = vec![
            self.registry.spawn_health_checks(self.rpc.clone(), self.cancel.child_token()),
            self.bridge.spawn_heartbeat(self.cancel.child_token()),
            self.verifier.spawn_expiry(self.cancel.child_token()),
            self.htlc.spawn_expiry(self.cancel.child_token()),
        ];
        for observer in self.observers.values() {
            tasks.push(observer.spawn_polling(self.cancel.child_token()));
            tasks.push(self.spawn_event_consumer(observer.subscribe()));
        }
        let verifications = self
            .verifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(rx) = verifications {
            tasks.push(self.spawn_verification_loop(rx));
        }

        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).extend(tasks);
        Ok(connected)
    }

    /// Feed a push subscription into a chain's observer
    pub fn attach_push_source(
        &self,
        chain: ChainId,
        events: mpsc::Receiver<RawChainEvent>,
    ) -> TrinityResult<()> {
        let observer = self
            .observers
            .get(&chain)
            .ok_or_else(|| TrinityError::InvalidInput(format!("no observer for {}", chain)))?;
        let handle = observer.spawn_push(events, self.cancel.child_token());
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).push(handle);
        Ok(())
    }

    fn spawn_event_consumer(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<NormalizedChainEvent>,
    ) -> JoinHandle<()> {
        let coordinator = self.clone();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(event) => coordinator.handle_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // polling re-delivers nothing already scanned; skipped events are lost
                            error!("Event consumer lagged, {} events skipped", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    fn spawn_verification_loop(
        self: &Arc<Self>,
        mut requests: mpsc::Receiver<NormalizedChainEvent>,
    ) -> JoinHandle<()> {
        let coordinator = self.clone();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            // one task per request so a slow enclave holds up only its own operation
            let mut running: JoinSet<()> = JoinSet::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(finished) = running.join_next(), if !running.is_empty() => {
                        if let Err(e) = finished {
                            error!("Verification task ended abnormally: {}", e);
                        }
                    }
                    request = requests.recv() => match request {
                        Some(event) => {
                            let coordinator = coordinator.clone();
                            running.spawn(async move { coordinator.verify_across_chains(event).await });
                        }
                        None => break,
                    },
                }
            }
            // drain in-flight checks; shutdown fails their enclave requests
            while let Some(finished) = running.join_next().await {
                if let Err(e) = finished {
                    error!("Verification task ended abnormally: {}", e);
                }
            }
        })
    }

    fn first_seen(dedup: &Mutex<EventDeduplicator>, event: &NormalizedChainEvent) -> bool {
        dedup.lock().unwrap_or_else(PoisonError::into_inner).first_seen(event)
    }

    async fn handle_event(&self, event: NormalizedChainEvent) {
        if !Self::first_seen(&self.event_dedup, &event) {
            bump(&self.stats.duplicate_events);
            debug!("[{}] Duplicate {:?} in {} dropped", event.chain, event.kind, event.tx_hash);
            return;
        }
        bump(&self.stats.events_processed);

        if event.kind == EventKind::HtlcCreated {
            match self.htlc.on_lock_event(&event).await {
                Ok(_) => bump(&self.stats.swaps_locked),
                Err(TrinityError::UnknownSwap(id)) => {
                    debug!("[{}] Lock event for untracked swap {}", event.chain, id)
                }
                Err(e) => warn!("[{}] Lock of swap {} failed: {}", event.chain, event.operation_id, e),
            }
        }

        if event.kind.is_consensus_relevant() {
            let hash = operation_hash(&event.operation_id, &event.payload);
            self.cast_vote(event.chain, &event.operation_id, hash).await;
        }
    }

    /// Ask every other chain's enclave to check a gating event and vote
    async fn verify_across_chains(&self, event: NormalizedChainEvent) {
        if !Self::first_seen(&self.verify_dedup, &event) {
            return;
        }
        bump(&self.stats.verifications_triggered);
        let hash = operation_hash(&event.operation_id, &event.payload);
        info!(
            "[{}] {:?} for {} requires cross-chain verification",
            event.chain, event.kind, event.operation_id
        );

        let checks = self
            .bridge
            .chains()
            .into_iter()
            .filter(|chain| *chain != event.chain)
            .map(|chain| {
                let operation_id = event.operation_id.as_str();
                async move {
                    match self.bridge.verify_operation(chain, &hash).await {
                        Ok(true) => self.cast_vote(chain, operation_id, hash).await,
                        Ok(false) => {
                            warn!("[{}] Enclave disputes operation {}", chain, operation_id);
                            self.cast_vote(chain, operation_id, dissent_hash(chain, &hash)).await
                        }
                        Err(e) => {
                            bump(&self.stats.vote_failures);
                            warn!("[{}] Verification of {} failed: {}", chain, operation_id, e);
                        }
                    }
                }
            });
        futures::future::join_all(checks).await;
    }

    async fn cast_vote(&self, chain: ChainId, operation_id: &str, payload_hash: [u8; 32]) {
        let signature = match self
            .bridge
            .sign_vote(chain, &vote_digest(operation_id, chain, &payload_hash))
            .await
        {
            Ok(signature) => signature,
            Err(e) => {
                bump(&self.stats.vote_failures);
                warn!("[{}] Could not sign vote for {}: {}", chain, operation_id, e);
                return;
            }
        };
        let vote = ChainVote::new(chain, operation_id, payload_hash).signed(signature);
        match self.submit_vote(vote).await {
            Ok(_) => {}
            Err(TrinityError::ConsensusConflict { operation_id }) => {
                warn!("[{}] Operation {} rejected on conflicting votes", chain, operation_id)
            }
            Err(e) => warn!("[{}] Vote for {} refused: {}", chain, operation_id, e),
        }
    }

    // === Operation submission ===

    /// `submitOperation`
    pub fn submit_operation(
        &self,
        source: ChainId,
        destination: ChainId,
        amount: u128,
        kind: OperationKind,
        priority: Priority,
    ) -> TrinityResult<RouteQuote> {
        self.router.submit_operation(source, destination, amount, kind, priority)
    }

    /// `executeOperation`; retries once on another endpoint
    pub async fn execute_operation(
        &self,
        route_id: &str,
        signed_transaction: Vec<u8>,
    ) -> TrinityResult<ExecutionReceipt> {
        self.router.execute_operation(route_id, signed_transaction).await
    }

    // === Consensus ===

    /// Submit a chain vote directly
    pub async fn submit_vote(&self, vote: ChainVote) -> TrinityResult<VoteOutcome> {
        let result = self.verifier.submit_vote(vote).await;
        match &result {
            Ok(outcome) if outcome.counted => {
                bump(&self.stats.votes_cast);
                if outcome.decision == Decision::Approved {
                    bump(&self.stats.operations_approved);
                }
            }
            Ok(_) => {}
            Err(TrinityError::ConsensusConflict { .. }) => bump(&self.stats.operations_rejected),
            Err(_) => bump(&self.stats.vote_failures),
        }
        result
    }

    /// `getConsensusStatus`
    pub async fn get_consensus_status(&self, operation_id: &str) -> TrinityResult<ConsensusStatus> {
        self.verifier.get_consensus_status(operation_id).await
    }

    /// Terminal consensus decisions as they happen
    pub fn subscribe_decisions(&self) -> broadcast::Receiver<ConsensusStatus> {
        self.verifier.subscribe()
    }

    // === HTLC ===

    /// `initSwap`
    pub async fn init_swap(
        &self,
        hashlock: [u8; 32],
        timelock: u64,
        amount: u128,
        recipient: &str,
        source: ChainId,
        destination: ChainId,
    ) -> TrinityResult<String> {
        let swap_id = self
            .htlc
            .init_swap(hashlock, timelock, amount, recipient, source, destination)
            .await?;
        bump(&self.stats.swaps_initiated);
        Ok(swap_id)
    }

    /// `initSwap` with the configured default timelock window
    pub async fn init_swap_default(
        &self,
        hashlock: [u8; 32],
        amount: u128,
        recipient: &str,
        source: ChainId,
        destination: ChainId,
    ) -> TrinityResult<String> {
        let timelock = self.chain_clock.now_unix(source) + self.config.htlc.default_timelock_secs;
        self.init_swap(hashlock, timelock, amount, recipient, source, destination)
            .await
    }

    /// `claimSwap`
    pub async fn claim_swap(&self, swap_id: &str, preimage: &[u8]) -> TrinityResult<SwapReceipt> {
        let before = self.htlc.get_swap_state(swap_id)?;
        let receipt = self.htlc.claim_swap(swap_id, preimage).await?;
        if before != SwapState::Claimed {
            bump(&self.stats.swaps_claimed);
        }
        Ok(receipt)
    }

    /// `refundSwap`
    pub async fn refund_swap(&self, swap_id: &str) -> TrinityResult<SwapReceipt> {
        let before = self.htlc.get_swap_state(swap_id)?;
        let receipt = self.htlc.refund_swap(swap_id).await?;
        if before != SwapState::Refunded {
            bump(&self.stats.swaps_refunded);
        }
        Ok(receipt)
    }

    /// `getSwapState`
    pub fn get_swap_state(&self, swap_id: &str) -> TrinityResult<SwapState> {
        self.htlc.get_swap_state(swap_id)
    }

    /// Full swap snapshot
    pub fn swap(&self, swap_id: &str) -> TrinityResult<HtlcSwap> {
        self.htlc.swap(swap_id)
    }

    // === Vaults ===

    /// Have `chain`'s enclave sign a vault deposit
    pub async fn authorize_vault_deposit(
        &self,
        chain: ChainId,
        vault_id: &str,
        amount: u128,
        address: &str,
    ) -> TrinityResult<Signature> {
        let payload = VaultPayload {
            vault_id: vault_key(vault_id),
            amount,
            address: address.to_string(),
            proof: None,
        };
        let signature = self.bridge.vault_deposit(chain, &payload).await?;
        bump(&self.stats.vault_deposits);
        info!("[{}] Deposit of {} into vault {} authorized", chain, amount, vault_id);
        Ok(signature)
    }

    /// Have `chain`'s enclave sign a vault withdrawal
    ///
    /// Fails with `ConsensusNotReached` unless the vault id has an approved
    /// consensus record; the proof digest travels with the request.
    pub async fn authorize_vault_withdrawal(
        &self,
        chain: ChainId,
        vault_id: &str,
        amount: u128,
        address: &str,
    ) -> TrinityResult<Signature> {
        let proof = self.verifier.approved_proof(vault_id).await?;
        let payload = VaultPayload {
            vault_id: vault_key(vault_id),
            amount,
            address: address.to_string(),
            proof: Some(proof.to_vec()),
        };
        let signature = self.bridge.vault_withdraw(chain, &payload).await?;
        bump(&self.stats.vault_withdrawals);
        info!("[{}] Withdrawal of {} from vault {} authorized", chain, amount, vault_id);
        Ok(signature)
    }

    // === Introspection ===

    /// Observer for a chain
    pub fn observer(&self, chain: ChainId) -> Option<&Arc<ChainObserver>> {
        self.observers.get(&chain)
    }

    /// Subscribe to emitted events of one category
    pub fn subscribe_events(&self, category: EventCategory) -> broadcast::Receiver<EmittedEvent> {
        self.bus.subscribe(category)
    }

    /// Enclave bridge
    pub fn bridge(&self) -> &Arc<EnclaveBridge> {
        &self.bridge
    }

    /// Endpoint registry
    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// Snapshot of every endpoint
    pub fn endpoints(&self) -> Vec<EndpointSnapshot> {
        self.registry
            .all_endpoints()
            .iter()
            .map(|endpoint| endpoint.snapshot())
            .collect()
    }

    /// `getConnectionStatus()`
    pub fn connection_status(&self) -> Vec<ConnectionStatus> {
        self.bridge.connection_status()
    }

    /// Enclave bridge counters
    pub fn enclave_metrics(&self) -> BridgeMetrics {
        self.bridge.metrics()
    }

    /// Router counters
    pub fn router_metrics(&self) -> RouterMetrics {
        self.router.metrics()
    }

    /// Coordinator counters
    pub fn stats(&self) -> CoordinatorStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CoordinatorStats {
            events_processed: load(&self.stats.events_processed),
            duplicate_events: load(&self.stats.duplicate_events),
            votes_cast: load(&self.stats.votes_cast),
            vote_failures: load(&self.stats.vote_failures),
            verifications_triggered: load(&self.stats.verifications_triggered),
            operations_approved: load(&self.stats.operations_approved),
            operations_rejected: load(&self.stats.operations_rejected),
            swaps_initiated: load(&self.stats.swaps_initiated),
            swaps_locked: load(&self.stats.swaps_locked),
            swaps_claimed: load(&self.stats.swaps_claimed),
            swaps_refunded: load(&self.stats.swaps_refunded),
            vault_deposits: load(&self.stats.vault_deposits),
            vault_withdrawals: load(&self.stats.vault_withdrawals),
        }
    }

    /// Cancel background tasks and fail pending enclave requests
    pub async fn shutdown(&self) {
        info!("Shutting down Trinity coordinator");
        self.cancel.cancel();
        self.bridge.shutdown();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                error!("Background task ended abnormally: {}", e);
            }
        }
    }
}
