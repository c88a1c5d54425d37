//! Error types for the Trinity coordinator
//!
//! Errors are grouped by how callers should react to them:
//! transient failures may be retried once, safety and swap-invariant
//! violations never are, and infrastructure failures degrade a single
//! chain without stopping the others.

use crate::types::ChainId;
use std::fmt;

/// Result type for coordinator operations
pub type TrinityResult<T> = Result<T, TrinityError>;

/// Main error type for the Trinity coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrinityError {
    // === Endpoint & RPC Errors ===

    /// No registered endpoint for this chain is healthy or degraded
    NoEndpointAvailable {
        /// Chain that has no usable endpoint
        chain: ChainId,
    },

    /// Chain cannot be reached through any endpoint
    ChainUnavailable {
        /// Affected chain
        chain: ChainId,
        /// Last failure observed
        reason: String,
    },

    /// A single RPC call failed
    RpcFailed {
        /// Endpoint URL that failed
        endpoint: String,
        /// Failure description
        reason: String,
    },

    /// A single RPC call exceeded its deadline
    RpcTimeout {
        /// Endpoint URL that timed out
        endpoint: String,
    },

    /// Endpoint answered with a rate-limit response
    RateLimited {
        /// Endpoint URL
        endpoint: String,
    },

    /// Route id was never issued or has already been executed
    UnknownRoute(String),

    // === Enclave Errors ===

    /// No response from the enclave before the request deadline
    EnclaveTimeout {
        /// Chain whose enclave timed out
        chain: ChainId,
    },

    /// Enclave channel is not connected
    EnclaveDisconnected {
        /// Chain whose enclave is unreachable
        chain: ChainId,
    },

    /// Enclave processed the request and refused it
    EnclaveRejected {
        /// Chain whose enclave refused
        chain: ChainId,
        /// Error string returned by the enclave
        reason: String,
    },

    /// Enclave answered with a malformed payload
    EnclaveProtocol(String),

    /// Bridge or coordinator is shutting down
    ShuttingDown,

    // === Consensus Errors ===

    /// Two chains asserted different payload hashes for one operation
    ConsensusConflict {
        /// Operation id
        operation_id: String,
    },

    /// Operation id has no consensus record
    UnknownOperation(String),

    /// Vote failed validation (bad signature, wrong length)
    InvalidVote {
        /// Chain that cast the vote
        chain: ChainId,
        /// Reason for rejection
        reason: String,
    },

    /// Operation requires an approved consensus record
    ConsensusNotReached {
        /// Operation id
        operation_id: String,
    },

    // === HTLC Errors ===

    /// Preimage does not hash to the committed hashlock
    InvalidPreimage,

    /// Claim attempted after the timelock passed
    SwapExpired,

    /// Refund attempted before the timelock passed
    TimelockNotExpired {
        /// Absolute timelock (unix seconds)
        timelock: u64,
        /// Current time used for the comparison
        now: u64,
    },

    /// Swap already reached a terminal state or a transition is in flight
    SwapAlreadyFinalized {
        /// Hex swap id
        swap_id: String,
    },

    /// Transition is not legal from the swap's current state
    InvalidSwapState {
        /// State the transition requires
        expected: &'static str,
        /// State the swap is actually in
        actual: &'static str,
    },

    /// Swap id is not known to the state machine
    UnknownSwap(String),

    /// Swap parameters were rejected at init time
    InvalidSwapParams(String),

    // === Cryptographic Errors ===

    /// Random number generation failed
    RngFailed,

    /// Signing, verification or key handling failed
    CryptoError(String),

    /// Encryption failed
    EncryptionFailed,

    /// Decryption or tag verification failed
    DecryptionFailed,

    // === System Errors ===

    /// Configuration error
    ConfigurationError(String),

    /// Malformed input
    InvalidInput(String),

    /// Serialization error
    SerializationError(String),

    /// IO error (sockets, files)
    Io(String),

    /// Internal error (should not happen)
    InternalError(String),
}

impl fmt::Display for TrinityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoEndpointAvailable { chain } => {
                write!(f, "No endpoint available for {}", chain)
            }
            Self::ChainUnavailable { chain, reason } => {
                write!(f, "Chain {} unavailable: {}", chain, reason)
            }
            Self::RpcFailed { endpoint, reason } => {
                write!(f, "RPC call to {} failed: {}", endpoint, reason)
            }
            Self::RpcTimeout { endpoint } => write!(f, "RPC call to {} timed out", endpoint),
            Self::RateLimited { endpoint } => write!(f, "Rate limited by {}", endpoint),
            Self::UnknownRoute(id) => write!(f, "Unknown route: {}", id),
            Self::EnclaveTimeout { chain } => {
                write!(f, "Enclave request timeout for {}", chain)
            }
            Self::EnclaveDisconnected { chain } => {
                write!(f, "Enclave for {} is disconnected", chain)
            }
            Self::EnclaveRejected { chain, reason } => {
                write!(f, "Enclave for {} rejected request: {}", chain, reason)
            }
            Self::EnclaveProtocol(msg) => write!(f, "Enclave protocol error: {}", msg),
            Self::ShuttingDown => write!(f, "Coordinator is shutting down"),
            Self::ConsensusConflict { operation_id } => {
                write!(f, "Conflicting votes for operation {}", operation_id)
            }
            Self::UnknownOperation(id) => write!(f, "Unknown operation: {}", id),
            Self::InvalidVote { chain, reason } => {
                write!(f, "Invalid vote from {}: {}", chain, reason)
            }
            Self::ConsensusNotReached { operation_id } => {
                write!(f, "Consensus not reached for operation {}", operation_id)
            }
            Self::InvalidPreimage => write!(f, "Preimage does not match hashlock"),
            Self::SwapExpired => write!(f, "Swap timelock has expired"),
            Self::TimelockNotExpired { timelock, now } => write!(
                f,
                "Timelock not expired: expires at {}, now {}",
                timelock, now
            ),
            Self::SwapAlreadyFinalized { swap_id } => {
                write!(f, "Swap {} already finalized", swap_id)
            }
            Self::InvalidSwapState { expected, actual } => write!(
                f,
                "Invalid swap state: expected {}, found {}",
                expected, actual
            ),
            Self::UnknownSwap(id) => write!(f, "Unknown swap: {}", id),
            Self::InvalidSwapParams(msg) => write!(f, "Invalid swap parameters: {}", msg),
            Self::RngFailed => write!(f, "Random number generation failed"),
            Self::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),
            Self::EncryptionFailed => write!(f, "Encryption failed"),
            Self::DecryptionFailed => write!(f, "Decryption failed"),
            Self::ConfigurationError(msg) => write!(f, "Configuration error: {}", msg),
            Self::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            Self::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            Self::Io(msg) => write!(f, "IO error: {}", msg),
            Self::InternalError(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for TrinityError {}

impl TrinityError {
    /// Transient failures that the router may retry once
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RpcFailed { .. }
                | Self::RpcTimeout { .. }
                | Self::RateLimited { .. }
                | Self::EnclaveTimeout { .. }
                | Self::ChainUnavailable { .. }
        )
    }

    /// Safety and invariant violations; retrying cannot change the outcome
    pub fn is_safety_violation(&self) -> bool {
        matches!(
            self,
            Self::ConsensusConflict { .. }
                | Self::InvalidPreimage
                | Self::SwapExpired
                | Self::TimelockNotExpired { .. }
                | Self::SwapAlreadyFinalized { .. }
                | Self::InvalidSwapState { .. }
                | Self::InvalidVote { .. }
        )
    }

    /// Infrastructure unavailability scoped to one chain
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::NoEndpointAvailable { .. }
                | Self::ChainUnavailable { .. }
                | Self::EnclaveDisconnected { .. }
        )
    }

    /// Chain the error is scoped to, if any
    pub fn chain(&self) -> Option<ChainId> {
        match self {
            Self::NoEndpointAvailable { chain }
            | Self::ChainUnavailable { chain, .. }
            | Self::EnclaveTimeout { chain }
            | Self::EnclaveDisconnected { chain }
            | Self::EnclaveRejected { chain, .. }
            | Self::InvalidVote { chain, .. } => Some(*chain),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for TrinityError {
    fn from(e: serde_json::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<hex::FromHexError> for TrinityError {
    fn from(e: hex::FromHexError) -> Self {
        Self::InvalidInput(format!("Hex decode error: {}", e))
    }
}

impl From<std::io::Error> for TrinityError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<reqwest::Error> for TrinityError {
    fn from(e: reqwest::Error) -> Self {
        let endpoint = e.url().map(|u| u.to_string()).unwrap_or_default();
        if e.is_timeout() {
            Self::RpcTimeout { endpoint }
        } else {
            Self::RpcFailed { endpoint, reason: e.to_string() }
        }
    }
}

impl From<bincode::Error> for TrinityError {
    fn from(e: bincode::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TrinityError::EnclaveTimeout {
            chain: ChainId::Solana,
        };
        assert_eq!(err.to_string(), "Enclave request timeout for Solana");

        let err = TrinityError::TimelockNotExpired {
            timelock: 200,
            now: 100,
        };
        assert!(err.to_string().contains("expires at 200"));
    }

    #[test]
    fn test_retry_classification() {
        assert!(TrinityError::RpcTimeout {
            endpoint: "http://rpc".into()
        }
        .is_retryable());
        assert!(!TrinityError::InvalidPreimage.is_retryable());
        assert!(TrinityError::InvalidPreimage.is_safety_violation());
        assert!(TrinityError::ConsensusConflict {
            operation_id: "op-1".into()
        }
        .is_safety_violation());
    }

    #[test]
    fn test_infrastructure_scoped_to_chain() {
        let err = TrinityError::EnclaveDisconnected {
            chain: ChainId::Ton,
        };
        assert!(err.is_infrastructure());
        assert_eq!(err.chain(), Some(ChainId::Ton));
        assert_eq!(TrinityError::ShuttingDown.chain(), None);
    }
}
