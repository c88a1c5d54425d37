//! # Trinity Coordinator
//!
//! Cross-chain consensus and atomic-swap engine for Trinity Protocol.
//!
//! A vault operation (creation, unlock, withdrawal or swap) executes only
//! once two of three independent ledgers (Arbitrum, Solana, TON) agree it
//! is valid. Keys never leave the per-chain enclaves; the coordinator only
//! ever asks them to sign.
//!
//! ## Architecture
//!
//! 1. **Endpoint Registry & Operation Router** - latency-aware endpoint
//!    selection with a health-check sweep and a single failover retry
//! 2. **Chain Event Observers** - push subscription plus a polling
//!    back-stop per chain, normalized onto a typed event bus
//! 3. **Enclave Signing Bridge** - correlation-id request/response channel
//!    to one enclave per chain, with timeouts and heartbeats
//! 4. **Consensus Verifier** - 2-of-3 vote aggregation producing an
//!    enclave co-signed consensus proof
//! 5. **HTLC State Machine** - hash-time-locked swaps with linearized,
//!    first-writer-wins terminal transitions
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trinity_coordinator::{
//!     ChainId, EnclaveBridge, HttpRpcClient, TrinityConfig, TrinityCoordinator,
//! };
//!
//! # async fn run() -> trinity_coordinator::TrinityResult<()> {
//! let config = TrinityConfig::default();
//! let rpc = Arc::new(HttpRpcClient::new(config.router.execution_timeout())?);
//! let bridge = Arc::new(EnclaveBridge::with_unix_sockets(config.enclave.clone()));
//! let coordinator = Arc::new(TrinityCoordinator::new(config, rpc, bridge)?);
//! coordinator.start().await?;
//!
//! let status = coordinator.get_consensus_status("op-17").await?;
//! println!("{:?}", status.decision);
//!
//! coordinator.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod clock;
pub mod config;
pub mod consensus;
pub mod coordinator;
pub mod crypto;
pub mod dedup;
pub mod enclave;
pub mod error;
pub mod events;
pub mod htlc;
pub mod observer;
pub mod registry;
pub mod router;
pub mod rpc;
pub mod types;

pub use clock::{ChainClock, Clock, ManualClock, SystemClock};
pub use config::TrinityConfig;
pub use consensus::{ChainVote, ConsensusStatus, ConsensusVerifier, Decision};
pub use coordinator::{CoordinatorStats, TrinityCoordinator};
pub use dedup::EventDeduplicator;
pub use enclave::{EnclaveBridge, EnclaveServer, SoftwareEnclave};
pub use error::{TrinityError, TrinityResult};
pub use events::EventBus;
pub use htlc::{HtlcStateMachine, SwapReceipt, SwapState};
pub use observer::ChainObserver;
pub use registry::{EndpointRegistry, HealthStatus};
pub use router::OperationRouter;
pub use rpc::{ChainRpc, HttpRpcClient};
pub use types::*;
