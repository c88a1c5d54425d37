//! Core types shared across the coordinator
//!
//! Chain identifiers, key and signature containers, and the
//! chain-agnostic event model produced by the observers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Blockchain chain identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChainId {
    /// Arbitrum (Ethereum L2) - primary security chain
    Arbitrum = 1,
    /// Solana - high-frequency monitoring chain
    Solana = 2,
    /// TON - quantum-resistant recovery chain
    Ton = 3,
}

impl ChainId {
    /// All chains participating in Trinity consensus
    pub const ALL: [ChainId; 3] = [ChainId::Arbitrum, ChainId::Solana, ChainId::Ton];

    /// Get the numeric identifier for this chain
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Create ChainId from numeric value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Arbitrum),
            2 => Some(Self::Solana),
            3 => Some(Self::Ton),
            _ => None,
        }
    }

    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Arbitrum => "Arbitrum",
            Self::Solana => "Solana",
            Self::Ton => "TON",
        }
    }

    /// Lowercase slug used in socket paths and config keys
    pub fn slug(&self) -> &'static str {
        match self {
            Self::Arbitrum => "arbitrum",
            Self::Solana => "solana",
            Self::Ton => "ton",
        }
    }

    /// Signature scheme this chain's enclave signs with
    pub fn signing_algorithm(&self) -> KeyAlgorithm {
        match self {
            Self::Arbitrum => KeyAlgorithm::Secp256k1,
            Self::Solana => KeyAlgorithm::Ed25519,
            Self::Ton => KeyAlgorithm::Dilithium5,
        }
    }

    /// Parse a chain from its slug or display name
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "arbitrum" | "ethereum" | "1" => Some(Self::Arbitrum),
            "solana" | "2" => Some(Self::Solana),
            "ton" | "3" => Some(Self::Ton),
            _ => None,
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Key algorithm type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// Ed25519 (used for Solana)
    Ed25519,
    /// Secp256k1 (used for Arbitrum)
    Secp256k1,
    /// CRYSTALS-Dilithium Level 5 (post-quantum, used for TON)
    Dilithium5,
}

impl KeyAlgorithm {
    /// Key type flag carried in `GENERATE_KEY` payloads
    pub fn key_type_flag(&self) -> u8 {
        match self {
            Self::Ed25519 => 0,
            Self::Secp256k1 => 1,
            Self::Dilithium5 => 2,
        }
    }

    /// Parse a `GENERATE_KEY` key type flag
    pub fn from_key_type_flag(flag: u8) -> Option<Self> {
        match flag {
            0 => Some(Self::Ed25519),
            1 => Some(Self::Secp256k1),
            2 => Some(Self::Dilithium5),
            _ => None,
        }
    }

    /// Encoded public key length in bytes
    pub fn public_key_len(&self) -> usize {
        match self {
            Self::Ed25519 => 32,
            Self::Secp256k1 => 33,
            Self::Dilithium5 => 2592,
        }
    }

    /// Signature length in bytes
    pub fn signature_len(&self) -> usize {
        match self {
            Self::Ed25519 => 64,
            Self::Secp256k1 => 65,
            Self::Dilithium5 => 4595,
        }
    }
}

/// Public key for signature verification
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    /// Encoded key bytes (32, 33 or 2592 bytes depending on algorithm)
    pub bytes: Vec<u8>,
    /// Key algorithm type
    pub algorithm: KeyAlgorithm,
}

impl PublicKey {
    /// Create a new public key
    pub fn new(bytes: Vec<u8>, algorithm: KeyAlgorithm) -> Self {
        Self { bytes, algorithm }
    }

    /// Get hex-encoded representation
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "PublicKey({:?}, {}...)", self.algorithm, &hex[..hex.len().min(16)])
    }
}

/// Digital signature
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Raw signature bytes
    pub bytes: Vec<u8>,
    /// Algorithm used
    pub algorithm: KeyAlgorithm,
}

impl Signature {
    /// Create a new signature
    pub fn new(bytes: Vec<u8>, algorithm: KeyAlgorithm) -> Self {
        Self { bytes, algorithm }
    }

    /// Get hex-encoded representation
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}...)", &self.to_hex()[..16.min(self.bytes.len() * 2)])
    }
}

/// Ledger event kinds watched by the observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Vault created
    VaultCreated,
    /// Vault unlocked; gates fund release
    VaultUnlocked,
    /// Deposit into a vault
    VaultDeposit,
    /// Withdrawal from a vault
    VaultWithdrawal,
    /// Explicit cross-chain verification request; gates fund release
    VerificationRequested,
    /// Emergency recovery triggered
    EmergencyRecovery,
    /// HTLC lock created on the source chain
    HtlcCreated,
    /// Cross-chain swap initiated
    SwapInitiated,
}

impl EventKind {
    /// Every watched kind
    pub const ALL: [EventKind; 8] = [
        EventKind::VaultCreated,
        EventKind::VaultUnlocked,
        EventKind::VaultDeposit,
        EventKind::VaultWithdrawal,
        EventKind::VerificationRequested,
        EventKind::EmergencyRecovery,
        EventKind::HtlcCreated,
        EventKind::SwapInitiated,
    ];

    /// Name under which the event is published
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::VaultCreated => "vault:created",
            Self::VaultUnlocked => "vault:unlocked",
            Self::VaultDeposit => "vault:deposit",
            Self::VaultWithdrawal => "vault:withdrawal",
            Self::VerificationRequested => "trinity:verification-requested",
            Self::EmergencyRecovery => "emergency:recovery",
            Self::HtlcCreated => "htlc:created",
            Self::SwapInitiated => "swap:initiated",
        }
    }

    /// Publish/subscribe category
    pub fn category(&self) -> EventCategory {
        match self {
            Self::VaultCreated | Self::VaultUnlocked | Self::VaultDeposit | Self::VaultWithdrawal => {
                EventCategory::Vault
            }
            Self::VerificationRequested => EventCategory::Trinity,
            Self::EmergencyRecovery => EventCategory::Emergency,
            Self::HtlcCreated | Self::SwapInitiated => EventCategory::Htlc,
        }
    }

    /// Kinds that must trigger cross-chain verification without waiting for a poll tick
    pub fn requires_immediate_verification(&self) -> bool {
        matches!(self, Self::VaultUnlocked | Self::VerificationRequested)
    }

    /// Kinds on which the observing chain casts a consensus vote
    pub fn is_consensus_relevant(&self) -> bool {
        matches!(
            self,
            Self::VaultUnlocked
                | Self::VaultWithdrawal
                | Self::VerificationRequested
                | Self::EmergencyRecovery
        )
    }
}

/// Event bus categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    /// Vault lifecycle
    Vault,
    /// Trinity verification
    Trinity,
    /// HTLC and swap lifecycle
    Htlc,
    /// Emergency recovery
    Emergency,
}

/// Chain-agnostic event produced by an observer; immutable once created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedChainEvent {
    /// Event kind
    pub kind: EventKind,
    /// Vault, operation or swap id the event refers to
    pub operation_id: String,
    /// Chain the event was observed on
    pub chain: ChainId,
    /// Block (or slot / seqno) number
    pub block_number: u64,
    /// Transaction hash
    pub tx_hash: String,
    /// Wall-clock timestamp (unix seconds)
    pub timestamp: u64,
    /// Opaque event payload
    pub payload: Vec<u8>,
}

impl NormalizedChainEvent {
    /// Consumer-side idempotency key
    pub fn idempotency_key(&self) -> EventKey {
        // hex hashes are case-insensitive, base58 signatures are not
        let tx_hash = if self.tx_hash.starts_with("0x") || self.tx_hash.starts_with("0X") {
            self.tx_hash.to_ascii_lowercase()
        } else {
            self.tx_hash.clone()
        };
        EventKey {
            chain: self.chain,
            tx_hash,
            kind: self.kind,
        }
    }
}

/// Idempotency key for de-duplicating events delivered by both push and poll
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    /// Observing chain
    pub chain: ChainId,
    /// Transaction hash (lowercased when hex)
    pub tx_hash: String,
    /// Event kind
    pub kind: EventKind,
}

/// Event shape handed to external observability collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmittedEvent {
    /// Published name, e.g. `vault:unlocked`
    pub event_name: String,
    /// Vault or swap id
    pub vault_or_swap_id: String,
    /// Block number on the observing chain
    pub chain_block_number: u64,
    /// Observing chain
    pub chain: ChainId,
    /// Transaction hash
    pub transaction_hash: String,
    /// Unix seconds
    pub timestamp: u64,
    /// Opaque payload
    pub data: Vec<u8>,
}

impl EmittedEvent {
    /// Build the emitted form of a normalized event under a given name
    pub fn from_normalized(name: &str, event: &NormalizedChainEvent) -> Self {
        Self {
            event_name: name.to_string(),
            vault_or_swap_id: event.operation_id.clone(),
            chain_block_number: event.block_number,
            chain: event.chain,
            transaction_hash: event.tx_hash.clone(),
            timestamp: event.timestamp,
            data: event.payload.clone(),
        }
    }
}

/// Kind of operation submitted through the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Vault creation
    VaultCreate,
    /// Vault unlock
    VaultUnlock,
    /// Vault withdrawal
    VaultWithdraw,
    /// Vault deposit
    VaultDeposit,
    /// Atomic swap leg
    Swap,
    /// Plain cross-chain transfer
    Transfer,
}

/// Scheduling priority for submitted operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Background work
    Low,
    /// Default
    Normal,
    /// Fund-release paths
    High,
}

/// Get current Unix timestamp in seconds
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get current Unix timestamp in milliseconds
pub fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
