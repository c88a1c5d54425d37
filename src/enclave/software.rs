//! Software enclave
//!
//! Serves the enclave side of the wire protocol with real keys held in
//! process memory. Used for simulation, local development and tests; a
//! hardware enclave answers the same messages with the same layouts.

use super::protocol::{
    AttestationEvidence, EnclaveRequest, EnclaveResponse, EnclaveStatus, HtlcClaimPayload,
    HtlcInitPayload, MessageType, VaultPayload, DEFAULT_USER_DATA_LEN,
};
use crate::crypto::{
    aes256_gcm_decrypt, aes256_gcm_encrypt, derive_chain_key, random_array, sha256, KeyPair,
    NONCE_LEN, TAG_LEN,
};
use crate::error::{TrinityError, TrinityResult};
use crate::types::{ChainId, KeyAlgorithm};

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Version string folded into the measurement
const ENCLAVE_VERSION: &[u8] = b"trinity-software-enclave/1";

/// In-memory signer for one chain
pub struct SoftwareEnclave {
    chain: ChainId,
    measurement: [u8; 32],
    keypair: RwLock<KeyPair>,
    seal_key: Zeroizing<[u8; 32]>,
    emergency: AtomicBool,
    disputed: Mutex<HashSet<[u8; 32]>>,
    requests_served: AtomicU64,
}

impl SoftwareEnclave {
    /// Create an enclave with a fresh key for the chain's signing scheme
    pub fn new(chain: ChainId) -> TrinityResult<Self> {
        let keypair = KeyPair::generate(chain.signing_algorithm())?;
        let master = Zeroizing::new(random_array::<32>()?);
        let seal_key = Zeroizing::new(derive_chain_key(&master[..], chain.as_u8(), "seal")?);

        let mut measured = ENCLAVE_VERSION.to_vec();
        measured.push(chain.as_u8());
        let measurement = sha256(&measured);

        info!(
            "[{}] Software enclave ready ({:?}, measurement {})",
            chain,
            keypair.algorithm(),
            hex::encode(&measurement[..8])
        );
        Ok(Self {
            chain,
            measurement,
            keypair: RwLock::new(keypair),
            seal_key,
            emergency: AtomicBool::new(false),
            disputed: Mutex::new(HashSet::new()),
            requests_served: AtomicU64::new(0),
        })
    }

    /// Chain served
    pub fn chain(&self) -> ChainId {
        self.chain
    }

    /// Measurement hash
    pub fn measurement(&self) -> [u8; 32] {
        self.measurement
    }

    /// Current signing public key
    pub fn public_key(&self) -> crate::types::PublicKey {
        self.keypair
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .public_key()
            .clone()
    }

    /// Make `VERIFY_OPERATION` deny a digest, as if this chain disagreed
    pub fn dispute(&self, digest: [u8; 32]) {
        self.disputed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(digest);
    }

    /// Whether emergency mode has been entered
    pub fn in_emergency(&self) -> bool {
        self.emergency.load(Ordering::Acquire)
    }

    /// Handle one request
    pub fn handle(&self, request: &EnclaveRequest) -> EnclaveResponse {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
        if request.chain_id != self.chain.as_u8() {
            return EnclaveResponse::failure(
                &request.id,
                format!("enclave serves chain {}, got {}", self.chain.as_u8(), request.chain_id),
            );
        }
        if request.message_type.is_signing() && self.in_emergency() {
            return EnclaveResponse::failure(&request.id, "emergency mode: signing disabled");
        }

        debug!("[{}] {:?} {}", self.chain, request.message_type, request.id);
        match self.dispatch(request) {
            Ok(response) => response,
            Err(e) => {
                warn!("[{}] {:?} refused: {}", self.chain, request.message_type, e);
                EnclaveResponse::failure(&request.id, e.to_string())
            }
        }
    }

    fn sign(&self, message: &[u8]) -> TrinityResult<Vec<u8>> {
        let keypair = self.keypair.read().unwrap_or_else(PoisonError::into_inner);
        Ok(keypair.sign(message)?.bytes)
    }

    fn dispatch(&self, request: &EnclaveRequest) -> TrinityResult<EnclaveResponse> {
        let id = request.id.as_str();
        let payload = request.payload.as_slice();

        match request.message_type {
            MessageType::Initialize => {
                let mut out = self.measurement.to_vec();
                out.extend_from_slice(&self.public_key().bytes);
                Ok(EnclaveResponse::ok(id, out))
            }
            MessageType::GenerateKey => {
                let flag = *payload
                    .first()
                    .ok_or_else(|| TrinityError::InvalidInput("missing key type flag".into()))?;
                let algorithm = KeyAlgorithm::from_key_type_flag(flag)
                    .ok_or_else(|| TrinityError::InvalidInput(format!("unknown key type {}", flag)))?;
                if algorithm != self.chain.signing_algorithm() {
                    return Err(TrinityError::InvalidInput(format!(
                        "{} signs with {:?}, not {:?}",
                        self.chain,
                        self.chain.signing_algorithm(),
                        algorithm
                    )));
                }
                let fresh = KeyPair::generate(algorithm)?;
                let public_key = fresh.public_key().bytes.clone();
                *self.keypair.write().unwrap_or_else(PoisonError::into_inner) = fresh;
                info!("[{}] Signing key rotated", self.chain);
                Ok(EnclaveResponse::ok(id, public_key))
            }
            MessageType::SignVote => {
                if payload.is_empty() {
                    return Err(TrinityError::InvalidInput("empty vote digest".into()));
                }
                Ok(EnclaveResponse::ok(id, self.sign(payload)?))
            }
            MessageType::VerifyOperation => {
                let digest: [u8; 32] = payload
                    .try_into()
                    .map_err(|_| TrinityError::InvalidInput("operation digest must be 32 bytes".into()))?;
                let disputed = self
                    .disputed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .contains(&digest);
                Ok(EnclaveResponse::ok(id, vec![u8::from(!disputed)]))
            }
            MessageType::GenerateAttestation => {
                let user_data = if payload.is_empty() {
                    vec![0u8; DEFAULT_USER_DATA_LEN]
                } else {
                    payload.to_vec()
                };
                let randomness = random_array::<32>()?;
                let report = AttestationEvidence::encode_report(&self.measurement, &user_data, &randomness)?;
                let signature = self.sign(&report)?;
                Ok(EnclaveResponse::ok(id, report).with_attestation(signature))
            }
            MessageType::HtlcInit => {
                let init = HtlcInitPayload::decode(payload)?;
                let swap_id = init.swap_id();
                let signature = self.sign(&swap_id)?;
                Ok(EnclaveResponse::ok(id, swap_id.to_vec()).with_attestation(signature))
            }
            MessageType::HtlcClaim => {
                let claim = HtlcClaimPayload::decode(payload)?;
                if claim.preimage.is_empty() {
                    return Err(TrinityError::InvalidInput("empty preimage".into()));
                }
                Ok(EnclaveResponse::ok(id, self.sign(payload)?))
            }
            MessageType::HtlcRefund => {
                if payload.len() != 32 {
                    return Err(TrinityError::InvalidInput("refund payload is a 32-byte swap id".into()));
                }
                Ok(EnclaveResponse::ok(id, self.sign(payload)?))
            }
            MessageType::VaultDeposit => {
                VaultPayload::decode(payload)?;
                Ok(EnclaveResponse::ok(id, self.sign(payload)?))
            }
            MessageType::VaultWithdraw => {
                let vault = VaultPayload::decode(payload)?;
                if vault.proof.is_none() {
                    return Err(TrinityError::InvalidInput("withdrawal requires a consensus proof".into()));
                }
                Ok(EnclaveResponse::ok(id, self.sign(payload)?))
            }
            MessageType::SealData => Ok(EnclaveResponse::ok(id, self.seal(payload)?)),
            MessageType::UnsealData => Ok(EnclaveResponse::ok(id, self.unseal(payload)?)),
            MessageType::GetStatus => {
                let keypair = self.keypair.read().unwrap_or_else(PoisonError::into_inner);
                let status = EnclaveStatus {
                    chain_id: self.chain.as_u8(),
                    measurement: self.measurement,
                    public_key: keypair.public_key().bytes.clone(),
                    key_type: keypair.algorithm().key_type_flag(),
                    emergency: self.in_emergency(),
                    requests_served: self.requests_served.load(Ordering::Relaxed),
                };
                Ok(EnclaveResponse::ok(id, status.encode()?))
            }
            MessageType::EmergencyInitiate => {
                // acknowledge before the switch so the ack itself is signed
                let signature = self.sign(payload)?;
                self.emergency.store(true, Ordering::Release);
                warn!(
                    "[{}] Emergency mode entered: {}",
                    self.chain,
                    String::from_utf8_lossy(payload)
                );
                Ok(EnclaveResponse::ok(id, signature))
            }
        }
    }

    /// iv(12) ‖ tag(16) ‖ ciphertext
    fn seal(&self, plaintext: &[u8]) -> TrinityResult<Vec<u8>> {
        let iv = random_array::<NONCE_LEN>()?;
        let aad = [self.chain.as_u8()];
        let sealed = aes256_gcm_encrypt(&self.seal_key, &iv, plaintext, &aad)?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut out = Vec::with_capacity(NONCE_LEN + TAG_LEN + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(tag);
        out.extend_from_slice(ciphertext);
        Ok(out)
    }

    fn unseal(&self, sealed: &[u8]) -> TrinityResult<Vec<u8>> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(TrinityError::DecryptionFailed);
        }
        let (iv, rest) = sealed.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);
        let iv: [u8; NONCE_LEN] = iv.try_into().map_err(|_| TrinityError::DecryptionFailed)?;

        let mut combined = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        combined.extend_from_slice(ciphertext);
        combined.extend_from_slice(tag);
        aes256_gcm_decrypt(&self.seal_key, &iv, &combined, &[self.chain.as_u8()])
    }
}
