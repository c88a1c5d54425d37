//! Time sources for timelock and deadline checks
//!
//! Timelocks are compared against the chain's own clock when one has been
//! observed recently and against coordinator wall-clock otherwise.

use crate::types::{current_timestamp, ChainId};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Source of unix time, optionally per chain
pub trait Clock: Send + Sync {
    /// Current unix seconds as seen by `chain`
    fn now_unix(&self, chain: ChainId) -> u64;
}

/// Coordinator wall-clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self, _chain: ChainId) -> u64 {
        current_timestamp()
    }
}

/// Settable clock for tests and simulations
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Start at `now`
    pub fn new(now: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(now)),
        }
    }

    /// Jump to `now`
    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move forward by `secs`
    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_unix(&self, _chain: ChainId) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
struct BlockTime {
    block_timestamp: u64,
    observed_at: u64,
}

/// Latest observed block time per chain, with a wall-clock fallback
///
/// A reading older than `staleness_secs` (by the fallback clock) is ignored.
pub struct ChainClock {
    fallback: Arc<dyn Clock>,
    staleness_secs: u64,
    observed: RwLock<HashMap<ChainId, BlockTime>>,
}

impl ChainClock {
    /// Chain clock over a fallback clock
    pub fn new(fallback: Arc<dyn Clock>, staleness_secs: u64) -> Self {
        Self {
            fallback,
            staleness_secs,
            observed: RwLock::new(HashMap::new()),
        }
    }

    /// Record a block timestamp; older readings never move the clock backwards
    pub fn observe(&self, chain: ChainId, block_timestamp: u64) {
        let observed_at = self.fallback.now_unix(chain);
        let mut observed = match self.observed.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = observed.entry(chain).or_insert(BlockTime {
            block_timestamp,
            observed_at,
        });
        if block_timestamp >= entry.block_timestamp {
            *entry = BlockTime {
                block_timestamp,
                observed_at,
            };
        }
    }

    /// Latest block timestamp seen for a chain
    pub fn last_block_time(&self, chain: ChainId) -> Option<u64> {
        let observed = match self.observed.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        observed.get(&chain).map(|b| b.block_timestamp)
    }
}

impl Clock for ChainClock {
    fn now_unix(&self, chain: ChainId) -> u64 {
        let wall = self.fallback.now_unix(chain);
        let observed = match self.observed.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match observed.get(&chain) {
            // extrapolate the block time by the wall time elapsed since it was seen
            Some(b) if wall.saturating_sub(b.observed_at) <= self.staleness_secs => {
                b.block_timestamp + wall.saturating_sub(b.observed_at)
            }
            _ => wall,
        }
    }
}
