//! Enclave wire protocol
//!
//! Newline-delimited JSON in both directions. Byte fields travel as hex.
//!
//! Request: `{"id", "type", "chainId", "payload", "timestamp"}`
//! Response: `{"id", "success", "payload"?, "error"?, "attestation"?}`
//!
//! The binary payload layouts below are shared by the bridge and every
//! enclave implementation.

use crate::crypto::sha256;
use crate::error::{TrinityError, TrinityResult};
use crate::types::{current_timestamp_ms, ChainId};

use serde::{Deserialize, Serialize};

/// Length of the measurement hash carried in attestations
pub const MEASUREMENT_LEN: usize = 32;

/// Enclave randomness carried in attestations
pub const ATTESTATION_NONCE_LEN: usize = 32;

/// User data bound into an attestation when the caller supplies none
pub const DEFAULT_USER_DATA_LEN: usize = 64;

/// Request message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Open a session; answers measurement ‖ public key
    Initialize,
    /// Rotate the signing key; payload is a key type flag
    GenerateKey,
    /// Sign a consensus vote digest
    SignVote,
    /// Check an operation digest against the enclave's own chain view
    VerifyOperation,
    /// Produce attestation evidence
    GenerateAttestation,
    /// Register an HTLC and derive its swap id
    HtlcInit,
    /// Sign an HTLC claim release
    HtlcClaim,
    /// Sign an HTLC refund
    HtlcRefund,
    /// Sign a vault deposit
    VaultDeposit,
    /// Sign a vault withdrawal (requires a consensus proof)
    VaultWithdraw,
    /// Seal data under the enclave key
    SealData,
    /// Unseal previously sealed data
    UnsealData,
    /// Health and identity report
    GetStatus,
    /// Enter emergency mode; signing requests are refused afterwards
    EmergencyInitiate,
}

impl MessageType {
    /// Types that produce a signature with the chain key
    pub fn is_signing(&self) -> bool {
        matches!(
            self,
            Self::SignVote
                | Self::HtlcInit
                | Self::HtlcClaim
                | Self::HtlcRefund
                | Self::VaultDeposit
                | Self::VaultWithdraw
        )
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}

mod opt_hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_str(&hex::encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|s| hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Request sent to an enclave
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnclaveRequest {
    /// Correlation id
    pub id: String,
    /// Message type
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Target chain
    #[serde(rename = "chainId")]
    pub chain_id: u8,
    /// Opaque payload
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    /// Unix milliseconds
    pub timestamp: i64,
}

impl EnclaveRequest {
    /// New request stamped with the current time
    pub fn new(id: String, message_type: MessageType, chain: ChainId, payload: Vec<u8>) -> Self {
        Self {
            id,
            message_type,
            chain_id: chain.as_u8(),
            payload,
            timestamp: current_timestamp_ms() as i64,
        }
    }
}

/// Response from an enclave
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnclaveResponse {
    /// Correlation id of the request
    pub id: String,
    /// Whether the request was honoured
    pub success: bool,
    /// Result bytes
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_hex_bytes")]
    pub payload: Option<Vec<u8>>,
    /// Failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Signature binding the result to the enclave key
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_hex_bytes")]
    pub attestation: Option<Vec<u8>>,
}

impl EnclaveResponse {
    /// Successful response
    pub fn ok(id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            success: true,
            payload: Some(payload),
            error: None,
            attestation: None,
        }
    }

    /// Failed response
    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            payload: None,
            error: Some(error.into()),
            attestation: None,
        }
    }

    /// Attach an attestation signature
    pub fn with_attestation(mut self, attestation: Vec<u8>) -> Self {
        self.attestation = Some(attestation);
        self
    }
}

fn take<'a>(bytes: &mut &'a [u8], n: usize, what: &str) -> TrinityResult<&'a [u8]> {
    if bytes.len() < n {
        return Err(TrinityError::EnclaveProtocol(format!("truncated {}", what)));
    }
    let (head, tail) = bytes.split_at(n);
    *bytes = tail;
    Ok(head)
}

fn take_array<const N: usize>(bytes: &mut &[u8], what: &str) -> TrinityResult<[u8; N]> {
    let head = take(bytes, N, what)?;
    let mut out = [0u8; N];
    out.copy_from_slice(head);
    Ok(out)
}

/// `HTLC_INIT` payload: hashlock(32) ‖ timelock u64 LE ‖ amount u128 LE ‖ recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtlcInitPayload {
    /// sha256 commitment
    pub hashlock: [u8; 32],
    /// Absolute unix seconds
    pub timelock: u64,
    /// Locked amount
    pub amount: u128,
    /// Recipient address on the destination chain
    pub recipient: String,
}

impl HtlcInitPayload {
    /// Encode to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 8 + 16 + self.recipient.len());
        out.extend_from_slice(&self.hashlock);
        out.extend_from_slice(&self.timelock.to_le_bytes());
        out.extend_from_slice(&self.amount.to_le_bytes());
        out.extend_from_slice(self.recipient.as_bytes());
        out
    }

    /// Decode from wire bytes
    pub fn decode(mut bytes: &[u8]) -> TrinityResult<Self> {
        let hashlock = take_array::<32>(&mut bytes, "hashlock")?;
        let timelock = u64::from_le_bytes(take_array::<8>(&mut bytes, "timelock")?);
        let amount = u128::from_le_bytes(take_array::<16>(&mut bytes, "amount")?);
        let recipient = String::from_utf8(bytes.to_vec())
            .map_err(|_| TrinityError::EnclaveProtocol("recipient is not utf-8".into()))?;
        Ok(Self {
            hashlock,
            timelock,
            amount,
            recipient,
        })
    }

    /// Swap id: sha256 of the encoded payload
    pub fn swap_id(&self) -> [u8; 32] {
        sha256(&self.encode())
    }
}

/// `HTLC_CLAIM` payload: swap id(32) ‖ preimage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtlcClaimPayload {
    /// Swap id
    pub swap_id: [u8; 32],
    /// Secret revealed by the claimant
    pub preimage: Vec<u8>,
}

impl HtlcClaimPayload {
    /// Encode to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.swap_id.to_vec();
        out.extend_from_slice(&self.preimage);
        out
    }

    /// Decode from wire bytes
    pub fn decode(mut bytes: &[u8]) -> TrinityResult<Self> {
        let swap_id = take_array::<32>(&mut bytes, "swap id")?;
        Ok(Self {
            swap_id,
            preimage: bytes.to_vec(),
        })
    }
}

/// Vault payload: vault id(32) ‖ amount u128 LE ‖ address len u16 BE ‖ address ‖ proof?
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultPayload {
    /// sha256 of the vault id string
    pub vault_id: [u8; 32],
    /// Amount moved
    pub amount: u128,
    /// Depositor or withdrawal destination
    pub address: String,
    /// Consensus proof hash (withdrawals)
    pub proof: Option<Vec<u8>>,
}

impl VaultPayload {
    /// Encode to wire bytes
    pub fn encode(&self) -> TrinityResult<Vec<u8>> {
        let address_len = u16::try_from(self.address.len())
            .map_err(|_| TrinityError::InvalidInput("vault address too long".into()))?;
        let mut out = Vec::with_capacity(32 + 16 + 2 + self.address.len() + 32);
        out.extend_from_slice(&self.vault_id);
        out.extend_from_slice(&self.amount.to_le_bytes());
        out.extend_from_slice(&address_len.to_be_bytes());
        out.extend_from_slice(self.address.as_bytes());
        if let Some(proof) = &self.proof {
            out.extend_from_slice(proof);
        }
        Ok(out)
    }

    /// Decode from wire bytes
    pub fn decode(mut bytes: &[u8]) -> TrinityResult<Self> {
        let vault_id = take_array::<32>(&mut bytes, "vault id")?;
        let amount = u128::from_le_bytes(take_array::<16>(&mut bytes, "amount")?);
        let address_len = u16::from_be_bytes(take_array::<2>(&mut bytes, "address length")?);
        let address = String::from_utf8(take(&mut bytes, address_len as usize, "address")?.to_vec())
            .map_err(|_| TrinityError::EnclaveProtocol("address is not utf-8".into()))?;
        Ok(Self {
            vault_id,
            amount,
            address,
            proof: (!bytes.is_empty()).then(|| bytes.to_vec()),
        })
    }
}

/// Parsed `GENERATE_ATTESTATION` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationEvidence {
    /// Enclave measurement hash
    pub measurement: [u8; 32],
    /// Caller data bound into the report
    pub user_data: Vec<u8>,
    /// Enclave-generated randomness
    pub randomness: [u8; 32],
    /// Signature over the encoded report
    pub signature: Vec<u8>,
}

impl AttestationEvidence {
    /// measurement(32) ‖ user-data length u16 BE ‖ user data ‖ randomness(32)
    pub fn encode_report(measurement: &[u8; 32], user_data: &[u8], randomness: &[u8; 32]) -> TrinityResult<Vec<u8>> {
        let len = u16::try_from(user_data.len())
            .map_err(|_| TrinityError::InvalidInput("attestation user data too long".into()))?;
        let mut out = Vec::with_capacity(MEASUREMENT_LEN + 2 + user_data.len() + ATTESTATION_NONCE_LEN);
        out.extend_from_slice(measurement);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(user_data);
        out.extend_from_slice(randomness);
        Ok(out)
    }

    /// Parse a report and its detached signature
    pub fn decode(mut report: &[u8], signature: Vec<u8>) -> TrinityResult<Self> {
        let measurement = take_array::<32>(&mut report, "measurement")?;
        let len = u16::from_be_bytes(take_array::<2>(&mut report, "user data length")?);
        let user_data = take(&mut report, len as usize, "user data")?.to_vec();
        let randomness = take_array::<32>(&mut report, "randomness")?;
        if !report.is_empty() {
            return Err(TrinityError::EnclaveProtocol("trailing attestation bytes".into()));
        }
        Ok(Self {
            measurement,
            user_data,
            randomness,
            signature,
        })
    }
}

/// `GET_STATUS` answer, bincode-encoded on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnclaveStatus {
    /// Chain served
    pub chain_id: u8,
    /// Enclave measurement
    pub measurement: [u8; 32],
    /// Current signing public key
    pub public_key: Vec<u8>,
    /// Key type flag of the signing key
    pub key_type: u8,
    /// Whether emergency mode is active
    pub emergency: bool,
    /// Requests handled since start
    pub requests_served: u64,
}

impl EnclaveStatus {
    /// Encode for the wire
    pub fn encode(&self) -> TrinityResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from the wire
    pub fn decode(bytes: &[u8]) -> TrinityResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let request = EnclaveRequest {
            id: "abc".into(),
            message_type: MessageType::HtlcInit,
            chain_id: 2,
            payload: vec![0xde, 0xad],
            timestamp: 1_700_000_000_000,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "HTLC_INIT");
        assert_eq!(json["chainId"], 2);
        assert_eq!(json["payload"], "dead");

        let parsed: EnclaveRequest = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_response_optional_fields() {
        let parsed: EnclaveResponse =
            serde_json::from_str(r#"{"id":"x","success":false,"error":"denied"}"#).unwrap();
        assert_eq!(parsed, EnclaveResponse::failure("x", "denied"));

        let json = serde_json::to_string(&EnclaveResponse::ok("y", vec![1])).unwrap();
        assert!(!json.contains("attestation"));
        assert!(json.contains(r#""payload":"01""#));
    }

    #[test]
    fn test_message_type_names() {
        assert_eq!(serde_json::to_string(&MessageType::GenerateAttestation).unwrap(), "\"GENERATE_ATTESTATION\"");
        assert_eq!(serde_json::to_string(&MessageType::EmergencyInitiate).unwrap(), "\"EMERGENCY_INITIATE\"");
        assert!(MessageType::HtlcRefund.is_signing());
        assert!(!MessageType::GetStatus.is_signing());
    }

    #[test]
    fn test_htlc_init_layout() {
        let payload = HtlcInitPayload {
            hashlock: [7u8; 32],
            timelock: 1_700_003_600,
            amount: 100,
            recipient: "recipientX".into(),
        };
        let bytes = payload.encode();
        assert_eq!(bytes.len(), 32 + 8 + 16 + 10);
        assert_eq!(&bytes[32..40], &1_700_003_600u64.to_le_bytes());
        assert_eq!(HtlcInitPayload::decode(&bytes).unwrap(), payload);
        assert_eq!(payload.swap_id(), sha256(&bytes));
    }

    #[test]
    fn test_vault_payload_with_proof() {
        let payload = VaultPayload {
            vault_id: [1u8; 32],
            amount: 5,
            address: "0xabc".into(),
            proof: Some(vec![9u8; 32]),
        };
        let bytes = payload.encode().unwrap();
        assert_eq!(&bytes[48..50], &[0, 5]);
        assert_eq!(VaultPayload::decode(&bytes).unwrap(), payload);

        let short = VaultPayload::decode(&bytes[..40]);
        assert!(matches!(short, Err(TrinityError::EnclaveProtocol(_))));
    }

    #[test]
    fn test_attestation_report_layout() {
        let report = AttestationEvidence::encode_report(&[3u8; 32], &[0u8; 64], &[4u8; 32]).unwrap();
        assert_eq!(report.len(), 32 + 2 + 64 + 32);
        assert_eq!(&report[32..34], &[0, 64]);

        let evidence = AttestationEvidence::decode(&report, vec![1]).unwrap();
        assert_eq!(evidence.user_data.len(), DEFAULT_USER_DATA_LEN);
        assert_eq!(evidence.randomness, [4u8; 32]);
    }
}
