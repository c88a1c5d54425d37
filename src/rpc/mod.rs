//! Chain RPC seam
//!
//! Everything the coordinator needs from a ledger goes through
//! [`ChainRpc`]: reading the head height, scanning a block range for
//! watched events, submitting signed transactions and probing health.
//! [`HttpRpcClient`] speaks each chain's JSON-RPC dialect; tests supply
//! in-memory implementations.

use crate::error::TrinityResult;
use crate::types::{ChainId, EventKind, OperationKind};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

mod evm;
mod http;

pub use evm::{decode_evm_log, event_signature, event_topic, EvmLog};
pub use http::HttpRpcClient;

/// Event as read from a ledger, before normalization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawChainEvent {
    /// Chain the event came from
    pub chain: ChainId,
    /// Decoded kind
    pub kind: EventKind,
    /// Vault, operation or swap id
    pub operation_id: String,
    /// Block / slot / seqno
    pub block_number: u64,
    /// Transaction hash
    pub tx_hash: String,
    /// Block time reported by the chain, when available
    pub block_timestamp: Option<u64>,
    /// Undecoded event data
    pub payload: Vec<u8>,
}

/// A signed chain call handed to an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainCall {
    /// Target chain
    pub chain: ChainId,
    /// Operation this call belongs to
    pub kind: OperationKind,
    /// Serialized signed transaction
    pub payload: Vec<u8>,
}

/// Read/write access to a ledger through a specific endpoint
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Current head height (block number, slot or masterchain seqno)
    async fn block_number(&self, endpoint: &str, chain: ChainId) -> TrinityResult<u64>;

    /// Watched events in the inclusive range `[from, to]`
    async fn fetch_events(
        &self,
        endpoint: &str,
        chain: ChainId,
        from: u64,
        to: u64,
        addresses: &[String],
    ) -> TrinityResult<Vec<RawChainEvent>>;

    /// Submit a signed transaction, returning its hash
    async fn submit_transaction(&self, endpoint: &str, call: &ChainCall) -> TrinityResult<String>;

    /// Cheap liveness probe used by the health sweep
    async fn probe(&self, endpoint: &str, chain: ChainId) -> TrinityResult<()> {
        self.block_number(endpoint, chain).await.map(|_| ())
    }
}
