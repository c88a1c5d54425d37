//! EVM log decoding for the vault and HTLC bridge contracts

use super::RawChainEvent;
use crate::crypto::keccak256;
use crate::error::{TrinityError, TrinityResult};
use crate::types::{ChainId, EventKind};

use serde::Deserialize;

/// Canonical Solidity signature of each watched event
pub fn event_signature(kind: EventKind) -> &'static str {
    match kind {
        EventKind::VaultCreated => "VaultCreated(string,address,uint256,uint256)",
        EventKind::VaultUnlocked => "VaultUnlocked(string,uint256)",
        EventKind::VaultDeposit => "VaultDeposit(string,address,uint256)",
        EventKind::VaultWithdrawal => "VaultWithdrawal(string,address,uint256)",
        EventKind::VerificationRequested => "CrossChainVerificationRequested(string,string,bytes32)",
        EventKind::EmergencyRecovery => "EmergencyRecoveryTriggered(string,address,uint256)",
        EventKind::HtlcCreated => "HTLCCreated(bytes32,address,uint256,bytes32,uint256)",
        EventKind::SwapInitiated => "CrossChainSwapInitiated(bytes32,string,string,uint256)",
    }
}

/// topic0 of a watched event
pub fn event_topic(kind: EventKind) -> [u8; 32] {
    keccak256(event_signature(kind).as_bytes())
}

/// Log entry as returned by `eth_getLogs`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvmLog {
    /// Emitting contract
    pub address: String,
    /// Indexed topics, topic0 first
    pub topics: Vec<String>,
    /// ABI-encoded non-indexed data
    pub data: String,
    /// Hex block number
    pub block_number: Option<String>,
    /// Transaction hash
    pub transaction_hash: Option<String>,
    /// Hex block timestamp (returned by some providers)
    #[serde(default)]
    pub block_timestamp: Option<String>,
    /// Set when the log was removed by a reorg
    #[serde(default)]
    pub removed: bool,
}

fn parse_hex_u64(value: &str) -> TrinityResult<u64> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16)
        .map_err(|e| TrinityError::InvalidInput(format!("bad hex quantity {}: {}", value, e)))
}

/// Decode one log; `Ok(None)` for logs that are not watched events
pub fn decode_evm_log(chain: ChainId, log: &EvmLog) -> TrinityResult<Option<RawChainEvent>> {
    if log.removed {
        return Ok(None);
    }
    let Some(topic0) = log.topics.first() else {
        return Ok(None);
    };
    let topic0 = hex::decode(topic0.trim_start_matches("0x"))?;
    let Some(kind) = EventKind::ALL
        .into_iter()
        .find(|kind| event_topic(*kind).as_slice() == topic0.as_slice())
    else {
        return Ok(None);
    };

    // indexed ids (string vault ids arrive hashed) are always topic1
    let operation_id = log
        .topics
        .get(1)
        .map(|t| t.to_ascii_lowercase())
        .ok_or_else(|| TrinityError::InvalidInput(format!("{:?} log without id topic", kind)))?;
    let block_number = log
        .block_number
        .as_deref()
        .map(parse_hex_u64)
        .transpose()?
        .ok_or_else(|| TrinityError::InvalidInput("pending log without block number".into()))?;
    let tx_hash = log
        .transaction_hash
        .clone()
        .ok_or_else(|| TrinityError::InvalidInput("log without transaction hash".into()))?;
    let block_timestamp = log.block_timestamp.as_deref().map(parse_hex_u64).transpose()?;

    Ok(Some(RawChainEvent {
        chain,
        kind,
        operation_id,
        block_number,
        tx_hash,
        block_timestamp,
        payload: hex::decode(log.data.trim_start_matches("0x"))?,
    }))
}
