//! Consensus Verifier - 2-of-3 multi-chain consensus
//!
//! Collects one vote per chain for each operation id and decides:
//! - `Approved` once `required_quorum` distinct chains agree on the payload hash
//! - `Rejected` as soon as two chains assert different payload hashes
//! - `Expired` when the vote deadline passes without quorum
//!
//! Each record sits behind its own lock, so votes for different
//! operations never contend and votes for the same operation cannot race
//! on the quorum check. Once approved, the decision digest is co-signed
//! by an enclave to form a portable consensus proof.
//!
//! Terminal records past retention are compacted to a settled entry that
//! keeps the decision and proof; the vote payloads are dropped. Votes for
//! a settled operation stay audit-only.

use crate::config::ConsensusConfig;
use crate::crypto::{hash_concat, verify_signature};
use crate::enclave::EnclaveBridge;
use crate::error::{TrinityError, TrinityResult};
use crate::types::{current_timestamp, ChainId, PublicKey, Signature};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Decision state of a consensus record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    /// Waiting for votes
    Pending,
    /// Quorum reached on one payload hash
    Approved,
    /// Conflicting payload hashes
    Rejected,
    /// Deadline passed without quorum
    Expired,
}

impl Decision {
    /// Whether the decision can no longer change
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Digest a chain's enclave signs when voting
pub fn vote_digest(operation_id: &str, chain: ChainId, payload_hash: &[u8; 32]) -> [u8; 32] {
    let id_len = (operation_id.len() as u32).to_be_bytes();
    hash_concat(&[
        b"trinity-vote",
        &id_len,
        operation_id.as_bytes(),
        &[chain.as_u8()],
        payload_hash,
    ])
}

/// Digest of an approved decision: operation id, ordered voting chains, payload hash
pub fn proof_digest(operation_id: &str, chains: &[ChainId], payload_hash: &[u8; 32]) -> [u8; 32] {
    let mut ordered: Vec<u8> = chains.iter().map(ChainId::as_u8).collect();
    ordered.sort_unstable();
    let id_len = (operation_id.len() as u32).to_be_bytes();
    hash_concat(&[
        b"trinity-proof",
        &id_len,
        operation_id.as_bytes(),
        &ordered,
        payload_hash,
    ])
}

/// A signed attestation from one chain about one operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVote {
    /// Voting chain
    pub chain: ChainId,
    /// Operation id
    pub operation_id: String,
    /// Hash of the operation payload as this chain sees it
    pub payload_hash: [u8; 32],
    /// Enclave signature over [`vote_digest`]
    pub signature: Option<Signature>,
    /// Unix seconds
    pub timestamp: u64,
}

impl ChainVote {
    /// Unsigned vote stamped now
    pub fn new(chain: ChainId, operation_id: impl Into<String>, payload_hash: [u8; 32]) -> Self {
        Self {
            chain,
            operation_id: operation_id.into(),
            payload_hash,
            signature: None,
            timestamp: current_timestamp(),
        }
    }

    /// Attach the enclave signature
    pub fn signed(mut self, signature: Signature) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Digest this vote is signed over
    pub fn digest(&self) -> [u8; 32] {
        vote_digest(&self.operation_id, self.chain, &self.payload_hash)
    }
}

/// Consensus record for one operation id
#[derive(Debug)]
struct ConsensusRecord {
    operation_id: String,
    votes: BTreeMap<ChainId, ChainVote>,
    /// Conflicting and post-decision votes, kept for audit
    audit: Vec<ChainVote>,
    payload_hash: [u8; 32],
    decision: Decision,
    proof_hash: Option<[u8; 32]>,
    proof_signature: Option<(ChainId, Signature)>,
    deadline: Instant,
    decided_at: Option<Instant>,
}

/// One vote as reported by `get_consensus_status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteSummary {
    /// Voting chain
    pub chain: ChainId,
    /// Unix seconds
    pub timestamp: u64,
}

/// Answer to `get_consensus_status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusStatus {
    /// Operation id
    pub operation_id: String,
    /// Current decision
    pub decision: Decision,
    /// Counted votes, in chain order
    pub votes: Vec<VoteSummary>,
    /// Votes recorded for audit only
    pub audit_votes: usize,
    /// Hex proof digest once approved
    pub proof_hash: Option<String>,
    /// Chain whose enclave co-signed the proof
    pub proof_signer: Option<ChainId>,
    /// Hex co-signature over the proof digest
    pub proof_signature: Option<String>,
}

impl ConsensusRecord {
    fn status(&self) -> ConsensusStatus {
        ConsensusStatus {
            operation_id: self.operation_id.clone(),
            decision: self.decision,
            votes: self
                .votes
                .values()
                .map(|v| VoteSummary {
                    chain: v.chain,
                    timestamp: v.timestamp,
                })
                .collect(),
            audit_votes: self.audit.len(),
            proof_hash: self.proof_hash.map(hex::encode),
            proof_signer: self.proof_signature.as_ref().map(|(chain, _)| *chain),
            proof_signature: self.proof_signature.as_ref().map(|(_, sig)| sig.to_hex()),
        }
    }

    fn decide(&mut self, decision: Decision) {
        self.decision = decision;
        self.decided_at = Some(Instant::now());
    }

    fn settle(&self) -> SettledRecord {
        let status = self.status();
        SettledRecord {
            decision: self.decision,
            votes: status.votes,
            proof_hash: self.proof_hash,
            proof_signature: self.proof_signature.clone(),
        }
    }
}

/// Decision kept after a terminal record is pruned
#[derive(Debug, Clone)]
struct SettledRecord {
    decision: Decision,
    votes: Vec<VoteSummary>,
    proof_hash: Option<[u8; 32]>,
    proof_signature: Option<(ChainId, Signature)>,
}

impl SettledRecord {
    fn status(&self, operation_id: &str) -> ConsensusStatus {
        ConsensusStatus {
            operation_id: operation_id.to_string(),
            decision: self.decision,
            votes: self.votes.clone(),
            audit_votes: 0,
            proof_hash: self.proof_hash.map(hex::encode),
            proof_signer: self.proof_signature.as_ref().map(|(chain, _)| *chain),
            proof_signature: self.proof_signature.as_ref().map(|(_, sig)| sig.to_hex()),
        }
    }
}

enum Slot {
    Live(Arc<Mutex<ConsensusRecord>>),
    Settled(SettledRecord),
}

/// Result of submitting a vote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteOutcome {
    /// Decision after the vote
    pub decision: Decision,
    /// Whether the vote counted toward quorum
    pub counted: bool,
}

type RecordMap = RwLock<HashMap<String, Arc<Mutex<ConsensusRecord>>>>;
type SettledMap = RwLock<HashMap<String, SettledRecord>>;

/// Aggregates chain votes into consensus decisions
pub struct ConsensusVerifier {
    config: ConsensusConfig,
    records: RecordMap,
    settled: SettledMap,
    keys: RwLock<HashMap<ChainId, PublicKey>>,
    bridge: Option<Arc<EnclaveBridge>>,
    decisions: broadcast::Sender<ConsensusStatus>,
}

impl ConsensusVerifier {
    /// Verifier without an enclave bridge
    ///
    /// Approved proofs stay unsigned and votes from chains without a
    /// registered key are accepted unsigned.
    pub fn new(config: ConsensusConfig) -> Self {
        let (decisions, _) = broadcast::channel(256);
        Self {
            config,
            records: RwLock::new(HashMap::new()),
            settled: RwLock::new(HashMap::new()),
            keys: RwLock::new(HashMap::new()),
            bridge: None,
            decisions,
        }
    }

    /// Co-sign approved proofs through `bridge` and check votes against
    /// the keys its enclaves currently report
    ///
    /// With a bridge, every vote must be signed by a known enclave key.
    pub fn with_bridge(mut self, bridge: Arc<EnclaveBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// Configuration
    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Require votes from `chain` to carry a valid signature under `key`
    ///
    /// A key reported by the bridge for the same chain takes precedence.
    pub fn register_chain_key(&self, chain: ChainId, key: PublicKey) {
        debug!("[{}] Registered vote key {:?}", chain, key);
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(chain, key);
    }

    /// Terminal decisions as they happen
    pub fn subscribe(&self) -> broadcast::Receiver<ConsensusStatus> {
        self.decisions.subscribe()
    }

    fn vote_key(&self, chain: ChainId) -> Option<PublicKey> {
        self.bridge
            .as_ref()
            .and_then(|bridge| bridge.public_key(chain))
            .or_else(|| {
                self.keys
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&chain)
                    .cloned()
            })
    }

    fn check_signature(&self, vote: &ChainVote) -> TrinityResult<()> {
        let invalid = |reason: &str| TrinityError::InvalidVote {
            chain: vote.chain,
            reason: reason.into(),
        };
        let Some(key) = self.vote_key(vote.chain) else {
            if self.bridge.is_some() {
                return Err(invalid("no enclave key known for chain"));
            }
            return Ok(());
        };
        let signature = vote.signature.as_ref().ok_or_else(|| invalid("unsigned vote"))?;
        if signature.bytes.len() != vote.chain.signing_algorithm().signature_len() {
            return Err(invalid("signature length does not match chain scheme"));
        }
        if !verify_signature(&key, &vote.digest(), signature)? {
            return Err(invalid("signature does not verify"));
        }
        Ok(())
    }

    fn record(&self, operation_id: &str) -> Option<Arc<Mutex<ConsensusRecord>>> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(operation_id)
            .cloned()
    }

    fn settled(&self, operation_id: &str) -> Option<SettledRecord> {
        self.settled
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(operation_id)
            .cloned()
    }

    fn slot(&self, vote: &ChainVote) -> Slot {
        if let Some(record) = self.record(&vote.operation_id) {
            return Slot::Live(record);
        }
        let deadline = Instant::now() + Duration::from_secs(self.config.vote_deadline_secs);
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        // pruning moves records under the same write lock
        if let Some(settled) = self.settled(&vote.operation_id) {
            return Slot::Settled(settled);
        }
        let record = records
            .entry(vote.operation_id.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ConsensusRecord {
                    operation_id: vote.operation_id.clone(),
                    votes: BTreeMap::new(),
                    audit: Vec::new(),
                    payload_hash: vote.payload_hash,
                    decision: Decision::Pending,
                    proof_hash: None,
                    proof_signature: None,
                    deadline,
                    decided_at: None,
                }))
            })
            .clone();
        Slot::Live(record)
    }

    /// Submit one chain's vote
    ///
    /// Duplicate votes from a chain are ignored. A vote whose payload hash
    /// conflicts with an earlier one rejects the operation and fails with
    /// `ConsensusConflict`. Votes after a terminal decision are kept for
    /// audit and change nothing.
    pub async fn submit_vote(&self, vote: ChainVote) -> TrinityResult<VoteOutcome> {
        self.check_signature(&vote)?;

        let record = match self.slot(&vote) {
            Slot::Live(record) => record,
            Slot::Settled(settled) => {
                debug!(
                    "[{}] Vote for settled operation {} ({:?}) ignored",
                    vote.chain, vote.operation_id, settled.decision
                );
                return Ok(VoteOutcome {
                    decision: settled.decision,
                    counted: false,
                });
            }
        };
        let mut record = record.lock().await;

        if record.decision.is_terminal() {
            debug!(
                "[{}] Late vote for {} ({:?}) recorded for audit",
                vote.chain, vote.operation_id, record.decision
            );
            record.audit.push(vote);
            return Ok(VoteOutcome {
                decision: record.decision,
                counted: false,
            });
        }
        if record.votes.contains_key(&vote.chain) {
            debug!("[{}] Duplicate vote for {} ignored", vote.chain, vote.operation_id);
            return Ok(VoteOutcome {
                decision: record.decision,
                counted: false,
            });
        }
        if vote.payload_hash != record.payload_hash {
            warn!(
                "[{}] Conflicting payload hash for {}; rejecting operation",
                vote.chain, vote.operation_id
            );
            let operation_id = vote.operation_id.clone();
            record.audit.push(vote);
            record.decide(Decision::Rejected);
            let _ = self.decisions.send(record.status());
            return Err(TrinityError::ConsensusConflict { operation_id });
        }

        let chain = vote.chain;
        record.votes.insert(chain, vote);
        debug!(
            "[{}] Vote counted for {} ({}/{})",
            chain,
            record.operation_id,
            record.votes.len(),
            self.config.required_quorum
        );
        if record.votes.len() < self.config.required_quorum as usize {
            return Ok(VoteOutcome {
                decision: Decision::Pending,
                counted: true,
            });
        }

        let chains: Vec<ChainId> = record.votes.keys().copied().collect();
        let proof = proof_digest(&record.operation_id, &chains, &record.payload_hash);
        record.proof_hash = Some(proof);
        record.decide(Decision::Approved);
        info!(
            "Consensus reached for {} with {:?} (proof {})",
            record.operation_id,
            chains,
            hex::encode(&proof[..8])
        );
        let operation_id = record.operation_id.clone();
        drop(record);

        // enclave round-trips happen outside the record lock
        self.co_sign(&operation_id, proof).await;
        if let Some(record) = self.record(&operation_id) {
            let _ = self.decisions.send(record.lock().await.status());
        }
        Ok(VoteOutcome {
            decision: Decision::Approved,
            counted: true,
        })
    }

    async fn co_sign(&self, operation_id: &str, proof: [u8; 32]) {
        let Some(bridge) = &self.bridge else {
            return;
        };
        for signer in &self.config.proof_signers {
            match bridge.sign_vote(*signer, &proof).await {
                Ok(signature) => {
                    if let Some(record) = self.record(operation_id) {
                        record.lock().await.proof_signature = Some((*signer, signature));
                    }
                    debug!("[{}] Co-signed consensus proof for {}", signer, operation_id);
                    return;
                }
                Err(e) => warn!("[{}] Proof co-signature failed for {}: {}", signer, operation_id, e),
            }
        }
        warn!("Consensus proof for {} left without enclave co-signature", operation_id);
    }

    /// `getConsensusStatus(operationId)`
    pub async fn get_consensus_status(&self, operation_id: &str) -> TrinityResult<ConsensusStatus> {
        if let Some(record) = self.record(operation_id) {
            let status = record.lock().await.status();
            return Ok(status);
        }
        self.settled(operation_id)
            .map(|settled| settled.status(operation_id))
            .ok_or_else(|| TrinityError::UnknownOperation(operation_id.to_string()))
    }

    /// Proof digest of an approved operation
    pub async fn approved_proof(&self, operation_id: &str) -> TrinityResult<[u8; 32]> {
        let not_reached = || TrinityError::ConsensusNotReached {
            operation_id: operation_id.to_string(),
        };
        let (decision, proof_hash) = match self.record(operation_id) {
            Some(record) => {
                let record = record.lock().await;
                (record.decision, record.proof_hash)
            }
            None => {
                let settled = self.settled(operation_id).ok_or_else(not_reached)?;
                (settled.decision, settled.proof_hash)
            }
        };
        match (decision, proof_hash) {
            (Decision::Approved, Some(proof)) => Ok(proof),
            _ => Err(not_reached()),
        }
    }

    /// Expire overdue pending records and compact terminal ones past retention
    ///
    /// Returns `(expired, compacted)`.
    pub async fn sweep(&self) -> (usize, usize) {
        let now = Instant::now();
        let retention = Duration::from_secs(self.config.record_retention_secs);
        let records: Vec<_> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect();

        let mut expired = 0;
        let mut stale = Vec::new();
        for (id, record) in records {
            let mut record = record.lock().await;
            if record.decision == Decision::Pending && now >= record.deadline {
                info!(
                    "Consensus for {} expired with {}/{} votes",
                    id,
                    record.votes.len(),
                    self.config.required_quorum
                );
                record.decide(Decision::Expired);
                let _ = self.decisions.send(record.status());
                expired += 1;
            } else if record
                .decided_at
                .is_some_and(|at| now.duration_since(at) >= retention)
            {
                stale.push((id, record.settle()));
            }
        }

        if !stale.is_empty() {
            let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
            let mut settled = self.settled.write().unwrap_or_else(PoisonError::into_inner);
            for (id, entry) in &stale {
                settled.insert(id.clone(), entry.clone());
                records.remove(id);
            }
        }
        (expired, stale.len())
    }

    /// Spawn the expiry sweep
    pub fn spawn_expiry(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let verifier = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(verifier.config.expiry_sweep_secs));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let (expired, compacted) = verifier.sweep().await;
                        if expired + compacted > 0 {
                            debug!("Consensus sweep: {} expired, {} compacted", expired, compacted);
                        }
                    }
                }
            }
        })
    }

    /// Number of records still holding their votes
    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no records hold votes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnclaveConfig;
    use crate::crypto::{sha256, KeyPair};
    use crate::enclave::tests::{software_bridge, software_transports};
    use crate::enclave::EnclaveTransport;

    fn verifier() -> ConsensusVerifier {
        ConsensusVerifier::new(ConsensusConfig::default())
    }

    #[tokio::test]
    async fn test_consensus_2_of_3() {
        let verifier = verifier();
        let hash = sha256(b"unlock vault-9");

        let first = verifier
            .submit_vote(ChainVote::new(ChainId::Arbitrum, "op-17", hash))
            .await
            .unwrap();
        assert_eq!(first.decision, Decision::Pending);

        let second = verifier
            .submit_vote(ChainVote::new(ChainId::Solana, "op-17", hash))
            .await
            .unwrap();
        assert_eq!(second.decision, Decision::Approved);

        let status = verifier.get_consensus_status("op-17").await.unwrap();
        assert_eq!(status.decision, Decision::Approved);
        assert_eq!(status.votes.len(), 2);
        assert!(status.proof_hash.is_some_and(|p| !p.is_empty()));
    }

    #[tokio::test]
    async fn test_duplicate_vote_not_counted_twice() {
        let verifier = verifier();
        let hash = sha256(b"op");
        verifier.submit_vote(ChainVote::new(ChainId::Ton, "op-1", hash)).await.unwrap();
        let again = verifier.submit_vote(ChainVote::new(ChainId::Ton, "op-1", hash)).await.unwrap();

        assert!(!again.counted);
        assert_eq!(again.decision, Decision::Pending);
        assert_eq!(verifier.get_consensus_status("op-1").await.unwrap().votes.len(), 1);
    }

    #[tokio::test]
    async fn test_consensus_rejection_on_conflict() {
        let verifier = verifier();
        verifier
            .submit_vote(ChainVote::new(ChainId::Arbitrum, "op-2", sha256(b"a")))
            .await
            .unwrap();
        let err = verifier
            .submit_vote(ChainVote::new(ChainId::Solana, "op-2", sha256(b"b")))
            .await
            .unwrap_err();
        assert_eq!(err, TrinityError::ConsensusConflict { operation_id: "op-2".into() });

        // a third, agreeing vote cannot revive the operation
        let late = verifier
            .submit_vote(ChainVote::new(ChainId::Ton, "op-2", sha256(b"a")))
            .await
            .unwrap();
        assert_eq!(late.decision, Decision::Rejected);
        assert!(!late.counted);

        let status = verifier.get_consensus_status("op-2").await.unwrap();
        assert_eq!(status.decision, Decision::Rejected);
        assert!(status.proof_hash.is_none());
        assert_eq!(status.audit_votes, 2);
    }

    #[tokio::test]
    async fn test_decision_independent_of_vote_order() {
        let hash = sha256(b"payload");
        let mut proofs = Vec::new();
        for order in [[ChainId::Ton, ChainId::Arbitrum], [ChainId::Arbitrum, ChainId::Ton]] {
            let verifier = verifier();
            for chain in order {
                verifier.submit_vote(ChainVote::new(chain, "op-3", hash)).await.unwrap();
            }
            proofs.push(verifier.approved_proof("op-3").await.unwrap());
        }
        assert_eq!(proofs[0], proofs[1]);
    }

    #[tokio::test]
    async fn test_late_vote_after_approval_is_audit_only() {
        let verifier = verifier();
        let hash = sha256(b"x");
        for chain in [ChainId::Arbitrum, ChainId::Solana] {
            verifier.submit_vote(ChainVote::new(chain, "op-4", hash)).await.unwrap();
        }
        let proof = verifier.approved_proof("op-4").await.unwrap();

        let late = verifier.submit_vote(ChainVote::new(ChainId::Ton, "op-4", hash)).await.unwrap();
        assert_eq!(late.decision, Decision::Approved);
        let status = verifier.get_consensus_status("op-4").await.unwrap();
        assert_eq!(status.votes.len(), 2);
        assert_eq!(status.proof_hash, Some(hex::encode(proof)));
    }

    #[tokio::test]
    async fn test_forged_vote_rejected() {
        let verifier = verifier();
        let enclave_key = KeyPair::generate(ChainId::Solana.signing_algorithm()).unwrap();
        verifier.register_chain_key(ChainId::Solana, enclave_key.public_key().clone());

        let vote = ChainVote::new(ChainId::Solana, "op-5", sha256(b"p"));
        let err = verifier.submit_vote(vote.clone()).await.unwrap_err();
        assert!(matches!(err, TrinityError::InvalidVote { chain: ChainId::Solana, .. }));

        let forger = KeyPair::generate(ChainId::Solana.signing_algorithm()).unwrap();
        let forged = vote.clone().signed(forger.sign(&vote.digest()).unwrap());
        assert!(verifier.submit_vote(forged).await.is_err());

        let genuine = vote.clone().signed(enclave_key.sign(&vote.digest()).unwrap());
        assert!(verifier.submit_vote(genuine).await.unwrap().counted);
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let verifier = verifier();
        assert_eq!(
            verifier.get_consensus_status("nope").await.unwrap_err(),
            TrinityError::UnknownOperation("nope".into())
        );
        assert!(matches!(
            verifier.approved_proof("nope").await,
            Err(TrinityError::ConsensusNotReached { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_record_expires() {
        let verifier = verifier();
        let mut decisions = verifier.subscribe();
        verifier
            .submit_vote(ChainVote::new(ChainId::Arbitrum, "op-6", sha256(b"e")))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(verifier.sweep().await, (0, 0));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(verifier.sweep().await, (1, 0));
        assert_eq!(
            verifier.get_consensus_status("op-6").await.unwrap().decision,
            Decision::Expired
        );
        assert_eq!(decisions.recv().await.unwrap().decision, Decision::Expired);

        // a vote after expiry changes nothing
        let late = verifier
            .submit_vote(ChainVote::new(ChainId::Solana, "op-6", sha256(b"e")))
            .await
            .unwrap();
        assert_eq!(late.decision, Decision::Expired);

        tokio::time::advance(Duration::from_secs(3_600)).await;
        assert_eq!(verifier.sweep().await, (0, 1));
        assert!(verifier.is_empty());
        assert_eq!(
            verifier.get_consensus_status("op-6").await.unwrap().decision,
            Decision::Expired
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_compacted_decision_stays_final() {
        let verifier = verifier();
        verifier
            .submit_vote(ChainVote::new(ChainId::Arbitrum, "op-9", sha256(b"a")))
            .await
            .unwrap();
        assert!(verifier
            .submit_vote(ChainVote::new(ChainId::Solana, "op-9", sha256(b"b")))
            .await
            .is_err());
        for chain in [ChainId::Arbitrum, ChainId::Solana] {
            verifier
                .submit_vote(ChainVote::new(chain, "op-10", sha256(b"c")))
                .await
                .unwrap();
        }
        let proof = verifier.approved_proof("op-10").await.unwrap();

        tokio::time::advance(Duration::from_secs(3_601)).await;
        assert_eq!(verifier.sweep().await, (0, 2));
        assert!(verifier.is_empty());

        // agreeing votes after compaction cannot revive a rejected operation
        for chain in [ChainId::Solana, ChainId::Ton] {
            let late = verifier
                .submit_vote(ChainVote::new(chain, "op-9", sha256(b"a")))
                .await
                .unwrap();
            assert_eq!(late.decision, Decision::Rejected);
            assert!(!late.counted);
        }
        assert!(verifier.is_empty());
        assert_eq!(
            verifier.get_consensus_status("op-9").await.unwrap().decision,
            Decision::Rejected
        );
        assert!(verifier.approved_proof("op-9").await.is_err());

        let status = verifier.get_consensus_status("op-10").await.unwrap();
        assert_eq!(status.decision, Decision::Approved);
        assert_eq!(status.votes.len(), 2);
        assert_eq!(status.proof_hash, Some(hex::encode(proof)));
        assert_eq!(verifier.approved_proof("op-10").await.unwrap(), proof);
    }

    #[tokio::test]
    async fn test_approved_proof_is_enclave_cosigned() {
        let (bridge, _) = software_bridge(EnclaveConfig::default(), &[ChainId::Arbitrum, ChainId::Solana]).await;
        let verifier = ConsensusVerifier::new(ConsensusConfig::default()).with_bridge(bridge.clone());
        let hash = sha256(b"withdraw");
        for chain in [ChainId::Solana, ChainId::Arbitrum] {
            let vote = ChainVote::new(chain, "op-7", hash);
            let signature = bridge.sign_vote(chain, &vote.digest()).await.unwrap();
            verifier.submit_vote(vote.signed(signature)).await.unwrap();
        }

        let status = verifier.get_consensus_status("op-7").await.unwrap();
        assert_eq!(status.proof_signer, Some(ChainId::Arbitrum));
        let signature = Signature::new(
            hex::decode(status.proof_signature.unwrap()).unwrap(),
            ChainId::Arbitrum.signing_algorithm(),
        );
        let proof = verifier.approved_proof("op-7").await.unwrap();
        let key = bridge.public_key(ChainId::Arbitrum).unwrap();
        assert!(verify_signature(&key, &proof, &signature).unwrap());
    }

    #[tokio::test]
    async fn test_cosign_falls_back_to_next_signer() {
        // only Ton is connected; Arbitrum and Solana are tried first and fail
        let (bridge, _) = software_bridge(EnclaveConfig::default(), &[ChainId::Ton]).await;
        let verifier = ConsensusVerifier::new(ConsensusConfig::default()).with_bridge(bridge);
        let hash = sha256(b"y");
        for chain in [ChainId::Solana, ChainId::Arbitrum] {
            let key = KeyPair::generate(chain.signing_algorithm()).unwrap();
            verifier.register_chain_key(chain, key.public_key().clone());
            let vote = ChainVote::new(chain, "op-8", hash);
            let signature = key.sign(&vote.digest()).unwrap();
            verifier.submit_vote(vote.signed(signature)).await.unwrap();
        }
        let status = verifier.get_consensus_status("op-8").await.unwrap();
        assert_eq!(status.proof_signer, Some(ChainId::Ton));
        assert_eq!(status.proof_signature.unwrap().len(), 4595 * 2);
    }

    #[tokio::test]
    async fn test_unsigned_votes_rejected_with_bridge() {
        let (bridge, _) = software_bridge(EnclaveConfig::default(), &[ChainId::Arbitrum]).await;
        let verifier = ConsensusVerifier::new(ConsensusConfig::default()).with_bridge(bridge.clone());
        let hash = sha256(b"unsigned");

        for chain in [ChainId::Solana, ChainId::Ton, ChainId::Arbitrum] {
            assert!(matches!(
                verifier.submit_vote(ChainVote::new(chain, "op-11", hash)).await,
                Err(TrinityError::InvalidVote { .. })
            ));
        }
        assert!(verifier.is_empty());

        let vote = ChainVote::new(ChainId::Arbitrum, "op-11", hash);
        let signature = bridge.sign_vote(ChainId::Arbitrum, &vote.digest()).await.unwrap();
        assert!(verifier.submit_vote(vote.signed(signature)).await.unwrap().counted);
    }

    #[tokio::test]
    async fn test_late_connected_enclave_can_vote() {
        let transports: Vec<(ChainId, Arc<dyn EnclaveTransport>)> =
            software_transports(&[ChainId::Arbitrum, ChainId::Solana])
                .into_iter()
                .map(|(chain, transport)| (chain, transport as Arc<dyn EnclaveTransport>))
                .collect();
        let bridge = Arc::new(EnclaveBridge::new(EnclaveConfig::default(), transports));
        bridge.connect(ChainId::Arbitrum).await.unwrap();
        let verifier = ConsensusVerifier::new(ConsensusConfig::default()).with_bridge(bridge.clone());
        let hash = sha256(b"late");

        let early = ChainVote::new(ChainId::Solana, "op-12", hash);
        assert!(matches!(
            verifier.submit_vote(early).await,
            Err(TrinityError::InvalidVote { chain: ChainId::Solana, .. })
        ));

        bridge.connect(ChainId::Solana).await.unwrap();
        for chain in [ChainId::Solana, ChainId::Arbitrum] {
            let vote = ChainVote::new(chain, "op-12", hash);
            let signature = bridge.sign_vote(chain, &vote.digest()).await.unwrap();
            verifier.submit_vote(vote.signed(signature)).await.unwrap();
        }
        assert_eq!(
            verifier.get_consensus_status("op-12").await.unwrap().decision,
            Decision::Approved
        );
    }

    #[tokio::test]
    async fn test_rotated_enclave_key_is_used() {
        let (bridge, _) = software_bridge(EnclaveConfig::default(), &[ChainId::Arbitrum]).await;
        let verifier = ConsensusVerifier::new(ConsensusConfig::default()).with_bridge(bridge.clone());
        let vote = ChainVote::new(ChainId::Arbitrum, "op-13", sha256(b"rotate"));
        let stale = bridge.sign_vote(ChainId::Arbitrum, &vote.digest()).await.unwrap();

        bridge
            .generate_key(ChainId::Arbitrum, ChainId::Arbitrum.signing_algorithm())
            .await
            .unwrap();
        assert!(matches!(
            verifier.submit_vote(vote.clone().signed(stale)).await,
            Err(TrinityError::InvalidVote { .. })
        ));

        let fresh = bridge.sign_vote(ChainId::Arbitrum, &vote.digest()).await.unwrap();
        assert!(verifier.submit_vote(vote.signed(fresh)).await.unwrap().counted);
    }
}
