//! HTLC Swap State Machine
//!
//! ```text
//!            lock event            claim(preimage), now <= timelock
//!   Init ──────────────► Locked ──────────────────────────────► Claimed
//!    │                     │
//!    │ now > timelock      │ refund, now > timelock
//!    ▼                     ▼
//!  Expired              Refunded
//! ```
//!
//! Transitions for one swap id are linearized. A transition that is
//! still waiting on its enclave signature counts as final for any
//! concurrent request: the first committed terminal transition wins.
//! Re-applying the committed transition returns the stored signature
//! without asking the enclave again.
//!
//! A lock observed after the timelock leaves the swap `Expired`; the
//! recorded lock transaction makes it refundable by the source enclave.

use crate::clock::Clock;
use crate::config::HtlcConfig;
use crate::crypto::{hash_concat, secure_compare, sha256};
use crate::enclave::{EnclaveBridge, HtlcClaimPayload, HtlcInitPayload};
use crate::error::{TrinityError, TrinityResult};
use crate::types::{current_timestamp, ChainId, EventKind, NormalizedChainEvent, Signature};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Swap lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SwapState {
    /// Registered, assets not yet locked
    Init,
    /// Assets escrowed on the source chain
    Locked,
    /// Released to the recipient
    Claimed,
    /// Returned to the sender
    Refunded,
    /// Never locked before the timelock passed
    Expired,
}

impl SwapState {
    /// Whether the state can no longer change
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Claimed | Self::Refunded | Self::Expired)
    }

    /// Display name used in errors
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::Locked => "Locked",
            Self::Claimed => "Claimed",
            Self::Refunded => "Refunded",
            Self::Expired => "Expired",
        }
    }
}

/// Signed result of a claim or refund
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapReceipt {
    /// Hex swap id
    pub swap_id: String,
    /// State the transition produced
    pub state: SwapState,
    /// Chain whose enclave signed
    pub chain: ChainId,
    /// Enclave signature over the release or refund
    pub signature: Signature,
}

/// Snapshot of a swap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtlcSwap {
    /// Hex swap id
    pub swap_id: String,
    /// sha256 commitment
    pub hashlock: [u8; 32],
    /// Absolute expiry, unix seconds
    pub timelock: u64,
    /// Locked amount
    pub amount: u128,
    /// Locking party, once the lock event names one
    pub sender: Option<String>,
    /// Recipient on the destination chain
    pub recipient: String,
    /// Chain holding the escrow
    pub source: ChainId,
    /// Chain paying out on claim
    pub destination: ChainId,
    /// Current state
    pub state: SwapState,
    /// Unix seconds at registration
    pub created_at: u64,
    /// Transaction that locked the assets
    pub lock_tx: Option<String>,
}

#[derive(Debug)]
struct SwapEntry {
    swap: HtlcSwap,
    id: [u8; 32],
    init_signature: Signature,
    lock_signature: Option<Signature>,
    receipt: Option<SwapReceipt>,
    in_flight: bool,
}

/// Clears the in-flight marker if a transition is abandoned midway
struct InFlight<'a> {
    entry: &'a Mutex<SwapEntry>,
    armed: bool,
}

impl InFlight<'_> {
    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(self.entry).in_flight = false;
        }
    }
}

fn lock(entry: &Mutex<SwapEntry>) -> MutexGuard<'_, SwapEntry> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Parse a hex swap id, with or without `0x`
pub fn parse_swap_id(swap_id: &str) -> TrinityResult<[u8; 32]> {
    let trimmed = swap_id.strip_prefix("0x").unwrap_or(swap_id);
    hex::decode(trimmed)
        .ok()
        .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
        .ok_or_else(|| TrinityError::UnknownSwap(swap_id.to_string()))
}

/// Digest the source enclave co-signs when a lock is confirmed
pub fn lock_digest(swap_id: &[u8; 32], lock_tx: &str) -> [u8; 32] {
    hash_concat(&[b"htlc-lock", swap_id, lock_tx.as_bytes()])
}

/// Linearized swap registry driving enclave signatures
pub struct HtlcStateMachine {
    config: HtlcConfig,
    bridge: Arc<EnclaveBridge>,
    clock: Arc<dyn Clock>,
    swaps: RwLock<HashMap<[u8; 32], Arc<Mutex<SwapEntry>>>>,
}

impl HtlcStateMachine {
    /// State machine signing through `bridge` and reading time from `clock`
    pub fn new(config: HtlcConfig, bridge: Arc<EnclaveBridge>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            bridge,
            clock,
            swaps: RwLock::new(HashMap::new()),
        }
    }

    /// Configuration
    pub fn config(&self) -> &HtlcConfig {
        &self.config
    }

    fn entry(&self, swap_id: &str) -> TrinityResult<Arc<Mutex<SwapEntry>>> {
        let id = parse_swap_id(swap_id)?;
        self.swaps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or_else(|| TrinityError::UnknownSwap(swap_id.to_string()))
    }

    /// `initSwap`: register a swap and return its hex id
    ///
    /// The source enclave derives the same id from the committed terms and
    /// signs it; a mismatch is a protocol error.
    pub async fn init_swap(
        &self,
        hashlock: [u8; 32],
        timelock: u64,
        amount: u128,
        recipient: &str,
        source: ChainId,
        destination: ChainId,
    ) -> TrinityResult<String> {
        if source == destination {
            return Err(TrinityError::InvalidSwapParams("source and destination must differ".into()));
        }
        if amount == 0 {
            return Err(TrinityError::InvalidSwapParams("amount must be > 0".into()));
        }
        if recipient.is_empty() {
            return Err(TrinityError::InvalidSwapParams("recipient is required".into()));
        }
        let now = self.clock.now_unix(source);
        let window = timelock.saturating_sub(now);
        if timelock <= now || window < self.config.min_timelock_secs || window > self.config.max_timelock_secs {
            return Err(TrinityError::InvalidSwapParams(format!(
                "timelock {} must lie {}..={}s after {}",
                timelock, self.config.min_timelock_secs, self.config.max_timelock_secs, now
            )));
        }

        let terms = HtlcInitPayload {
            hashlock,
            timelock,
            amount,
            recipient: recipient.to_string(),
        };
        let expected = terms.swap_id();
        let (id, init_signature) = self.bridge.htlc_init(source, &terms).await?;
        if id != expected {
            return Err(TrinityError::EnclaveProtocol(format!(
                "{} enclave derived swap id {} for terms hashing to {}",
                source,
                hex::encode(id),
                hex::encode(expected)
            )));
        }

        let swap_id = hex::encode(id);
        let entry = SwapEntry {
            swap: HtlcSwap {
                swap_id: swap_id.clone(),
                hashlock,
                timelock,
                amount,
                sender: None,
                recipient: recipient.to_string(),
                source,
                destination,
                state: SwapState::Init,
                created_at: current_timestamp(),
                lock_tx: None,
            },
            id,
            init_signature,
            lock_signature: None,
            receipt: None,
            in_flight: false,
        };

        let mut swaps = self.swaps.write().unwrap_or_else(PoisonError::into_inner);
        if swaps.contains_key(&id) {
            return Err(TrinityError::InvalidSwapParams(format!("swap {} already registered", swap_id)));
        }
        swaps.insert(id, Arc::new(Mutex::new(entry)));
        info!(
            "[{}] Swap {} registered: {} -> {} ({}), timelock {}",
            source, swap_id, source, destination, amount, timelock
        );
        Ok(swap_id)
    }

    /// `Init → Locked` from a source-chain `HtlcCreated` event
    pub async fn on_lock_event(&self, event: &NormalizedChainEvent) -> TrinityResult<SwapState> {
        if event.kind != EventKind::HtlcCreated {
            return Err(TrinityError::InvalidInput(format!(
                "{:?} does not lock a swap",
                event.kind
            )));
        }
        let sender = String::from_utf8(event.payload.clone()).ok().filter(|s| !s.is_empty());
        self.confirm_lock(&event.operation_id, event.chain, &event.tx_hash, sender)
            .await
    }

    /// `Init → Locked`: the source enclave co-signs the lock confirmation
    ///
    /// A repeated confirmation of a locked swap is a no-op. A lock seen
    /// after the timelock never reaches `Locked`: the swap is expired with
    /// the lock transaction recorded so [`refund_swap`](Self::refund_swap)
    /// can return the escrow.
    pub async fn confirm_lock(
        &self,
        swap_id: &str,
        chain: ChainId,
        lock_tx: &str,
        sender: Option<String>,
    ) -> TrinityResult<SwapState> {
        let entry = self.entry(swap_id)?;
        let (id, source) = {
            let mut guard = lock(&entry);
            if chain != guard.swap.source {
                return Err(TrinityError::InvalidInput(format!(
                    "lock for swap {} reported by {}, escrow is on {}",
                    swap_id, chain, guard.swap.source
                )));
            }
            let now = self.clock.now_unix(guard.swap.source);
            match guard.swap.state {
                SwapState::Locked => {
                    debug!("[{}] Swap {} already locked", chain, guard.swap.swap_id);
                    return Ok(SwapState::Locked);
                }
                SwapState::Expired => {
                    Self::record_late_lock(&mut guard, lock_tx, sender);
                    return Err(TrinityError::SwapExpired);
                }
                SwapState::Init if guard.in_flight => {
                    return Err(TrinityError::SwapAlreadyFinalized {
                        swap_id: guard.swap.swap_id.clone(),
                    })
                }
                SwapState::Init if now > guard.swap.timelock => {
                    guard.swap.state = SwapState::Expired;
                    Self::record_late_lock(&mut guard, lock_tx, sender);
                    return Err(TrinityError::SwapExpired);
                }
                SwapState::Init => {}
                state => {
                    return Err(TrinityError::InvalidSwapState {
                        expected: SwapState::Init.name(),
                        actual: state.name(),
                    })
                }
            }
        guard.in_flight = true;
            (guard.id, guard.swap.source)
        };
        let marker = InFlight { entry: &entry, armed: true };

        let signature = self.bridge.sign_vote(source, &lock_digest(&id, lock_tx)).await?;

        let mut guard = lock(&entry);
        guard.swap.state = SwapState::Locked;
        guard.swap.lock_tx = Some(lock_tx.to_string());
        guard.swap.sender = sender;
        guard.lock_signature = Some(signature);
        guard.in_flight = false;
        marker.commit();
        info!("[{}] Swap {} locked in {}", source, guard.swap.swap_id, lock_tx);
        Ok(SwapState::Locked)
    }

    fn record_late_lock(entry: &mut SwapEntry, lock_tx: &str, sender: Option<String>) {
        if entry.swap.lock_tx.is_some() {
            return;
        }
        entry.swap.lock_tx = Some(lock_tx.to_string());
        entry.swap.sender = sender;
        warn!(
            "[{}] Swap {} locked in {} after its timelock {}, escrow awaits refund",
            entry.swap.source, entry.swap.swap_id, lock_tx, entry.swap.timelock
        );
    }

    /// `claimSwap`: reveal the preimage and have the destination enclave sign the release
    pub async fn claim_swap(&self, swap_id: &str, preimage: &[u8]) -> TrinityResult<SwapReceipt> {
        let entry = self.entry(swap_id)?;
        let (id, destination) = {
            let mut guard = lock(&entry);
            let matches = secure_compare(&sha256(preimage), &guard.swap.hashlock);
            if let Some(receipt) = Self::replay(&guard, SwapState::Claimed)? {
                if !matches {
                    return Err(TrinityError::InvalidPreimage);
                }
                return Ok(receipt);
            }
            if guard.swap.state != SwapState::Locked {
                return Err(TrinityError::InvalidSwapState {
                    expected: SwapState::Locked.name(),
                    actual: guard.swap.state.name(),
                });
            }
            if !matches {
                warn!("Claim of swap {} with a wrong preimage", guard.swap.swap_id);
                return Err(TrinityError::InvalidPreimage);
            }
            let now = self.clock.now_unix(guard.swap.source);
            if now > guard.swap.timelock {
                return Err(TrinityError::SwapExpired);
            }
            guard.in_flight = true;
            (guard.id, guard.swap.destination)
        };
        let marker = InFlight { entry: &entry, armed: true };

        let payload = HtlcClaimPayload {
            swap_id: id,
            preimage: preimage.to_vec(),
        };
        let signature = self.bridge.htlc_claim(destination, &payload).await?;
        Ok(Self::finish(&entry, marker, SwapState::Claimed, destination, signature))
    }

    /// `refundSwap`: after the timelock, have the source enclave sign the refund
    ///
    /// An expired swap whose lock arrived late is refunded too; its state
    /// stays `Expired` and the receipt carries that state.
    pub async fn refund_swap(&self, swap_id: &str) -> TrinityResult<SwapReceipt> {
        let entry = self.entry(swap_id)?;
        let (id, source, target) = {
            let mut guard = lock(&entry);
            let late_lock = guard.swap.state == SwapState::Expired && guard.swap.lock_tx.is_some();
            let target = if late_lock { SwapState::Expired } else { SwapState::Refunded };
            if let Some(receipt) = Self::replay(&guard, target)? {
                return Ok(receipt);
            }
            if !late_lock {
                if guard.swap.state != SwapState::Locked {
                    return Err(TrinityError::InvalidSwapState {
                        expected: SwapState::Locked.name(),
                        actual: guard.swap.state.name(),
                    });
                }
                let now = self.clock.now_unix(guard.swap.source);
                if now <= guard.swap.timelock {
                    return Err(TrinityError::TimelockNotExpired {
                        timelock: guard.swap.timelock,
                        now,
                    });
                }
            }
            guard.in_flight = true;
            (guard.id, guard.swap.source, target)
        };
        let marker = InFlight { entry: &entry, armed: true };

        let signature = self.bridge.htlc_refund(source, &id).await?;
        Ok(Self::finish(&entry, marker, target, source, signature))
    }

    /// Stored receipt for a replay of the committed transition; rejects
    /// anything else once the swap is final or a transition is in flight
    fn replay(entry: &SwapEntry, target: SwapState) -> TrinityResult<Option<SwapReceipt>> {
        let late_refund_pending = entry.swap.state == SwapState::Expired
            && target == SwapState::Expired
            && entry.receipt.is_none();
        if (!entry.swap.state.is_terminal() || late_refund_pending) && !entry.in_flight {
            return Ok(None);
        }
        match &entry.receipt {
            Some(receipt) if receipt.state == target => Ok(Some(receipt.clone())),
            _ => Err(TrinityError::SwapAlreadyFinalized {
                swap_id: entry.swap.swap_id.clone(),
            }),
        }
    }

    fn finish(
        entry: &Mutex<SwapEntry>,
        marker: InFlight<'_>,
        state: SwapState,
        chain: ChainId,
        signature: Signature,
    ) -> SwapReceipt {
        let mut guard = lock(entry);
        let receipt = SwapReceipt {
            swap_id: guard.swap.swap_id.clone(),
            state,
            chain,
            signature,
        };
        guard.swap.state = state;
        guard.receipt = Some(receipt.clone());
        guard.in_flight = false;
        marker.commit();
        info!("[{}] Swap {} {}", chain, guard.swap.swap_id, state.name());
        receipt
    }

    /// `getSwapState`
    pub fn get_swap_state(&self, swap_id: &str) -> TrinityResult<SwapState> {
        let entry = self.entry(swap_id)?;
        let guard = lock(&entry);
        Ok(guard.swap.state)
    }

    /// Full snapshot of a swap
    pub fn swap(&self, swap_id: &str) -> TrinityResult<HtlcSwap> {
        let entry = self.entry(swap_id)?;
        let guard = lock(&entry);
        Ok(guard.swap.clone())
    }

    /// Signature the source enclave issued at init
    pub fn init_signature(&self, swap_id: &str) -> TrinityResult<Signature> {
        let entry = self.entry(swap_id)?;
        let guard = lock(&entry);
        Ok(guard.init_signature.clone())
    }

    /// Co-signature over the lock confirmation, once locked
    pub fn lock_signature(&self, swap_id: &str) -> TrinityResult<Option<Signature>> {
        let entry = self.entry(swap_id)?;
        let guard = lock(&entry);
        Ok(guard.lock_signature.clone())
    }

    /// Expire swaps that were never locked before their timelock
    pub fn sweep_expired(&self) -> usize {
        let entries: Vec<_> = self
            .swaps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut expired = 0;
        for entry in entries {
            let mut guard = lock(&entry);
            if guard.swap.state != SwapState::Init || guard.in_flight {
                continue;
            }
            if self.clock.now_unix(guard.swap.source) > guard.swap.timelock {
                guard.swap.state = SwapState::Expired;
                info!("[{}] Swap {} expired unlocked", guard.swap.source, guard.swap.swap_id);
                expired += 1;
            }
        }
        expired
    }

    /// Spawn the expiry sweep
    pub fn spawn_expiry(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let machine = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(machine.config.expiry_sweep_secs));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        machine.sweep_expired();
                    }
                }
            }
        })
    }

    /// Number of swaps ever registered
    pub fn len(&self) -> usize {
        self.swaps.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no swaps are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
