//! # Enclave Signing Bridge
//!
//! Request/response channel to one hardware-isolated signer per chain.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  EnclaveTransport   ┌──────────────────┐
//! │ EnclaveBridge│────────────────────►│ Arbitrum enclave │ secp256k1
//! │              │────────────────────►│ Solana enclave   │ ed25519
//! │  pending map │────────────────────►│ TON enclave      │ Dilithium5
//! └──────▲───────┘                     └────────┬─────────┘
//!        └──────────── ResponseSink ◄───────────┘
//! ```
//!
//! Every request carries a random correlation id. The caller parks on a
//! oneshot keyed by that id; the transport's reader resolves it through
//! the [`ResponseSink`]. A request that sees no answer before the
//! configured deadline fails with `EnclaveTimeout` naming its chain, and
//! a hung enclave on one chain never holds up requests to another.

mod protocol;
mod socket;
mod software;

pub use protocol::{
    AttestationEvidence, EnclaveRequest, EnclaveResponse, EnclaveStatus, HtlcClaimPayload,
    HtlcInitPayload, MessageType, VaultPayload, ATTESTATION_NONCE_LEN, DEFAULT_USER_DATA_LEN,
    MEASUREMENT_LEN,
};
pub use socket::{EnclaveServer, UnixSocketTransport};
pub use software::SoftwareEnclave;

use crate::config::EnclaveConfig;
use crate::crypto::correlation_id;
use crate::error::{TrinityError, TrinityResult};
use crate::types::{current_timestamp, ChainId, KeyAlgorithm, PublicKey, Signature};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outstanding requests keyed by correlation id
type PendingMap = Mutex<HashMap<String, (ChainId, oneshot::Sender<EnclaveResponse>)>>;

/// Delivers enclave responses to the callers waiting on them
#[derive(Clone)]
pub struct ResponseSink {
    pending: Arc<PendingMap>,
}

impl ResponseSink {
    /// Resolve the pending request matching `response.id`
    ///
    /// Returns `false` for responses nobody is waiting on (late or unknown).
    pub fn deliver(&self, response: EnclaveResponse) -> bool {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&response.id);
        match waiter {
            Some((_, tx)) => tx.send(response).is_ok(),
            None => {
                debug!("Dropping response for unknown request {}", response.id);
                false
            }
        }
    }
}

/// Channel to one enclave
#[async_trait]
pub trait EnclaveTransport: Send + Sync {
    /// Channel address, for status reports
    fn address(&self) -> String;

    /// Open (or reopen) the channel; responses go to `sink`
    async fn connect(&self, sink: ResponseSink) -> TrinityResult<()>;

    /// Write one request
    async fn send(&self, request: &EnclaveRequest) -> TrinityResult<()>;
}

/// Transport to a [`SoftwareEnclave`] in the same process
pub struct InProcessTransport {
    enclave: Arc<SoftwareEnclave>,
    sink: Mutex<Option<ResponseSink>>,
    offline: AtomicBool,
}

impl InProcessTransport {
    /// Wrap an enclave
    pub fn new(enclave: Arc<SoftwareEnclave>) -> Self {
        Self {
            enclave,
            sink: Mutex::new(None),
            offline: AtomicBool::new(false),
        }
    }

    /// Enclave behind this transport
    pub fn enclave(&self) -> &Arc<SoftwareEnclave> {
        &self.enclave
    }

    /// Simulate the channel dropping or coming back
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl EnclaveTransport for InProcessTransport {
    fn address(&self) -> String {
        format!("in-process:{}", self.enclave.chain().slug())
    }

    async fn connect(&self, sink: ResponseSink) -> TrinityResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TrinityError::EnclaveDisconnected {
                chain: self.enclave.chain(),
            });
        }
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
        Ok(())
    }

    async fn send(&self, request: &EnclaveRequest) -> TrinityResult<()> {
        let chain = self.enclave.chain();
        if self.offline.load(Ordering::SeqCst) {
            return Err(TrinityError::EnclaveDisconnected { chain });
        }
        let sink = self
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TrinityError::EnclaveDisconnected { chain })?;

        let enclave = self.enclave.clone();
        let request = request.clone();
        // Dilithium signing is CPU-bound
        tokio::task::spawn_blocking(move || sink.deliver(enclave.handle(&request)));
        Ok(())
    }
}

/// Successful enclave answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnclaveReply {
    /// Result bytes
    pub payload: Vec<u8>,
    /// Attestation signature, when the message type produces one
    pub attestation: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
struct ConnectionState {
    connected: bool,
    last_heartbeat: Option<u64>,
    public_key: Option<PublicKey>,
    measurement: Option<[u8; 32]>,
    missed_heartbeats: u32,
}

struct EnclaveConnection {
    transport: Arc<dyn EnclaveTransport>,
    state: RwLock<ConnectionState>,
}

impl EnclaveConnection {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, ConnectionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ConnectionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-chain connection report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Chain
    pub chain: ChainId,
    /// Channel address
    pub address: String,
    /// Whether requests are currently accepted
    pub connected: bool,
    /// Unix seconds of the last good heartbeat
    pub last_heartbeat: Option<u64>,
    /// Hex public key reported by the enclave
    pub public_key: Option<String>,
    /// Hex measurement reported by the enclave
    pub measurement: Option<String>,
}

/// Bridge counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeMetrics {
    /// Configured enclave channels
    pub total_connections: usize,
    /// Channels currently connected
    pub active_connections: usize,
    /// Requests awaiting a response
    pub pending_requests: usize,
    /// Requests written since start
    pub requests_sent: u64,
    /// Requests that hit their deadline
    pub timeouts: u64,
}

/// Removes a pending entry if the request future ends without a response
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Request/response bridge to the per-chain enclaves
pub struct EnclaveBridge {
    config: EnclaveConfig,
    connections: BTreeMap<ChainId, EnclaveConnection>,
    pending: Arc<PendingMap>,
    shutting_down: AtomicBool,
    requests_sent: AtomicU64,
    timeouts: AtomicU64,
}

impl EnclaveBridge {
    /// Create a bridge over one transport per chain
    pub fn new(
        config: EnclaveConfig,
        transports: impl IntoIterator<Item = (ChainId, Arc<dyn EnclaveTransport>)>,
    ) -> Self {
        let connections = transports
            .into_iter()
            .map(|(chain, transport)| {
                (
                    chain,
                    EnclaveConnection {
                        transport,
                        state: RwLock::new(ConnectionState::default()),
                    },
                )
            })
            .collect();
        Self {
            config,
            connections,
            pending: Arc::new(Mutex::new(HashMap::new())),
            shutting_down: AtomicBool::new(false),
            requests_sent: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    /// Bridge over Unix sockets at the configured paths
    pub fn with_unix_sockets(config: EnclaveConfig) -> Self {
        let transports: Vec<(ChainId, Arc<dyn EnclaveTransport>)> = config
            .socket_paths
            .iter()
            .map(|(chain, path)| {
                let transport: Arc<dyn EnclaveTransport> =
                    Arc::new(UnixSocketTransport::new(*chain, path.clone()));
                (*chain, transport)
            })
            .collect();
        Self::new(config, transports)
    }

    /// Chains with a configured channel
    pub fn chains(&self) -> Vec<ChainId> {
        self.connections.keys().copied().collect()
    }

    fn sink(&self) -> ResponseSink {
        ResponseSink {
            pending: self.pending.clone(),
        }
    }

    fn connection(&self, chain: ChainId) -> TrinityResult<&EnclaveConnection> {
        self.connections
            .get(&chain)
            .ok_or(TrinityError::EnclaveDisconnected { chain })
    }

    /// Whether a chain's enclave currently accepts requests
    pub fn is_connected(&self, chain: ChainId) -> bool {
        self.connections
            .get(&chain)
            .map(|c| c.read().connected)
            .unwrap_or(false)
    }

    /// Public key reported by a chain's enclave
    pub fn public_key(&self, chain: ChainId) -> Option<PublicKey> {
        self.connections.get(&chain).and_then(|c| c.read().public_key.clone())
    }

    /// Connect and initialize every configured enclave; returns how many came up
    ///
    /// A chain that fails stays disconnected and is retried by the heartbeat.
    pub async fn connect_all(&self) -> usize {
        let attempts = self.connections.keys().map(|chain| async move {
            match self.connect(*chain).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("[{}] Enclave connection failed: {}", chain, e);
                    false
                }
            }
        });
        futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter(|up| *up)
            .count()
    }

    /// Connect and initialize one enclave
    pub async fn connect(&self, chain: ChainId) -> TrinityResult<()> {
        let connection = self.connection(chain)?;
        connection.transport.connect(self.sink()).await?;
        self.initialize(chain).await?;
        info!("[{}] Enclave connected at {}", chain, connection.transport.address());
        Ok(())
    }

    /// Send a request and wait for its response
    pub async fn request(
        &self,
        chain: ChainId,
        message_type: MessageType,
        payload: Vec<u8>,
    ) -> TrinityResult<EnclaveReply> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(TrinityError::ShuttingDown);
        }
        let connection = self.connection(chain)?;
        let bypass = matches!(message_type, MessageType::Initialize | MessageType::GetStatus);
        if !bypass && !connection.read().connected {
            return Err(TrinityError::EnclaveDisconnected { chain });
        }

        let id = correlation_id()?;
        let request = EnclaveRequest::new(id.clone(), message_type, chain, payload);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), (chain, tx));
        let _guard = PendingGuard {
            pending: &self.pending,
            id: id.clone(),
        };

        if let Err(e) = connection.transport.send(&request).await {
            debug!("[{}] Send of {:?} failed: {}", chain, message_type, e);
            return Err(TrinityError::EnclaveDisconnected { chain });
        }
        self.requests_sent.fetch_add(1, Ordering::Relaxed);

        let response = match tokio::time::timeout(self.config.request_timeout(), rx).await {
            Ok(Ok(response)) => response,
            // sender dropped: the bridge drained its pending map
            Ok(Err(_)) => return Err(TrinityError::ShuttingDown),
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!("[{}] Enclave request {} ({:?}) timed out", chain, id, message_type);
                return Err(TrinityError::EnclaveTimeout { chain });
            }
        };

        if !response.success {
            return Err(TrinityError::EnclaveRejected {
                chain,
                reason: response.error.unwrap_or_else(|| "unspecified".into()),
            });
        }
        Ok(EnclaveReply {
            payload: response.payload.unwrap_or_default(),
            attestation: response.attestation,
        })
    }

    /// `INITIALIZE`: record measurement and public key, mark connected
    pub async fn initialize(&self, chain: ChainId) -> TrinityResult<PublicKey> {
        let reply = self.request(chain, MessageType::Initialize, Vec::new()).await?;
        let algorithm = chain.signing_algorithm();
        if reply.payload.len() != MEASUREMENT_LEN + algorithm.public_key_len() {
            return Err(TrinityError::EnclaveProtocol(format!(
                "{} INITIALIZE answered {} bytes",
                chain,
                reply.payload.len()
            )));
        }
        let (measurement, key) = reply.payload.split_at(MEASUREMENT_LEN);
        let mut measured = [0u8; 32];
        measured.copy_from_slice(measurement);
        let public_key = PublicKey::new(key.to_vec(), algorithm);

        let connection = self.connection(chain)?;
        let mut state = connection.write();
        state.connected = true;
        state.missed_heartbeats = 0;
        state.last_heartbeat = Some(current_timestamp());
        state.measurement = Some(measured);
        state.public_key = Some(public_key.clone());
        Ok(public_key)
    }

    /// `GENERATE_KEY`: rotate the chain's signing key
    pub async fn generate_key(&self, chain: ChainId, algorithm: KeyAlgorithm) -> TrinityResult<PublicKey> {
        let reply = self
            .request(chain, MessageType::GenerateKey, vec![algorithm.key_type_flag()])
            .await?;
        if reply.payload.len() != algorithm.public_key_len() {
            return Err(TrinityError::EnclaveProtocol(format!(
                "{:?} public key must be {} bytes, got {}",
                algorithm,
                algorithm.public_key_len(),
                reply.payload.len()
            )));
        }
        let public_key = PublicKey::new(reply.payload, algorithm);
        self.connection(chain)?.write().public_key = Some(public_key.clone());
        Ok(public_key)
    }

    fn signature(chain: ChainId, bytes: Vec<u8>) -> TrinityResult<Signature> {
        let algorithm = chain.signing_algorithm();
        if bytes.len() != algorithm.signature_len() {
            return Err(TrinityError::EnclaveProtocol(format!(
                "{} signature must be {} bytes, got {}",
                chain,
                algorithm.signature_len(),
                bytes.len()
            )));
        }
        Ok(Signature::new(bytes, algorithm))
    }

    /// `SIGN_VOTE` over a vote digest
    pub async fn sign_vote(&self, chain: ChainId, digest: &[u8; 32]) -> TrinityResult<Signature> {
        let reply = self.request(chain, MessageType::SignVote, digest.to_vec()).await?;
        Self::signature(chain, reply.payload)
    }

    /// `VERIFY_OPERATION`: does this chain's view agree with the digest
    pub async fn verify_operation(&self, chain: ChainId, digest: &[u8; 32]) -> TrinityResult<bool> {
        let reply = self.request(chain, MessageType::VerifyOperation, digest.to_vec()).await?;
        match reply.payload.as_slice() {
            [verdict] => Ok(*verdict == 1),
            other => Err(TrinityError::EnclaveProtocol(format!(
                "VERIFY_OPERATION answered {} bytes",
                other.len()
            ))),
        }
    }

    /// `GENERATE_ATTESTATION`, binding optional caller data
    pub async fn generate_attestation(
        &self,
        chain: ChainId,
        user_data: Option<&[u8]>,
    ) -> TrinityResult<AttestationEvidence> {
        let reply = self
            .request(
                chain,
                MessageType::GenerateAttestation,
                user_data.map(<[u8]>::to_vec).unwrap_or_default(),
            )
            .await?;
        let signature = reply
            .attestation
            .ok_or_else(|| TrinityError::EnclaveProtocol("attestation without signature".into()))?;
        let evidence = AttestationEvidence::decode(&reply.payload, signature)?;
        self.connection(chain)?.write().measurement = Some(evidence.measurement);
        Ok(evidence)
    }

    /// `HTLC_INIT`: returns the enclave-derived swap id and its signature
    pub async fn htlc_init(
        &self,
        chain: ChainId,
        payload: &HtlcInitPayload,
    ) -> TrinityResult<([u8; 32], Signature)> {
        let reply = self.request(chain, MessageType::HtlcInit, payload.encode()).await?;
        let swap_id: [u8; 32] = reply
            .payload
            .as_slice()
            .try_into()
            .map_err(|_| TrinityError::EnclaveProtocol("swap id must be 32 bytes".into()))?;
        let signature = reply
            .attestation
            .ok_or_else(|| TrinityError::EnclaveProtocol("HTLC_INIT without signature".into()))?;
        Ok((swap_id, Self::signature(chain, signature)?))
    }

    /// `HTLC_CLAIM`: sign the release transaction
    pub async fn htlc_claim(&self, chain: ChainId, payload: &HtlcClaimPayload) -> TrinityResult<Signature> {
        let reply = self.request(chain, MessageType::HtlcClaim, payload.encode()).await?;
        Self::signature(chain, reply.payload)
    }

    /// `HTLC_REFUND`: sign the refund transaction
    pub async fn htlc_refund(&self, chain: ChainId, swap_id: &[u8; 32]) -> TrinityResult<Signature> {
        let reply = self.request(chain, MessageType::HtlcRefund, swap_id.to_vec()).await?;
        Self::signature(chain, reply.payload)
    }

    /// `VAULT_DEPOSIT`
    pub async fn vault_deposit(&self, chain: ChainId, payload: &VaultPayload) -> TrinityResult<Signature> {
        let reply = self.request(chain, MessageType::VaultDeposit, payload.encode()?).await?;
        Self::signature(chain, reply.payload)
    }

    /// `VAULT_WITHDRAW`; the payload must carry the consensus proof
    pub async fn vault_withdraw(&self, chain: ChainId, payload: &VaultPayload) -> TrinityResult<Signature> {
        let reply = self.request(chain, MessageType::VaultWithdraw, payload.encode()?).await?;
        Self::signature(chain, reply.payload)
    }

    /// `SEAL_DATA`: returns iv ‖ tag ‖ ciphertext
    pub async fn seal(&self, chain: ChainId, data: &[u8]) -> TrinityResult<Vec<u8>> {
        Ok(self.request(chain, MessageType::SealData, data.to_vec()).await?.payload)
    }

    /// `UNSEAL_DATA`
    pub async fn unseal(&self, chain: ChainId, sealed: &[u8]) -> TrinityResult<Vec<u8>> {
        Ok(self.request(chain, MessageType::UnsealData, sealed.to_vec()).await?.payload)
    }

    /// `GET_STATUS`
    pub async fn get_status(&self, chain: ChainId) -> TrinityResult<EnclaveStatus> {
        let reply = self.request(chain, MessageType::GetStatus, Vec::new()).await?;
        EnclaveStatus::decode(&reply.payload)
    }

    /// `EMERGENCY_INITIATE`: the enclave refuses signing afterwards
    pub async fn emergency_initiate(&self, chain: ChainId, reason: &str) -> TrinityResult<Signature> {
        warn!("[{}] Initiating enclave emergency mode: {}", chain, reason);
        let reply = self
            .request(chain, MessageType::EmergencyInitiate, reason.as_bytes().to_vec())
            .await?;
        Self::signature(chain, reply.payload)
    }

    /// Heartbeat one chain: probe a live channel or reconnect a dropped one
    pub async fn heartbeat_chain(&self, chain: ChainId) {
        let Some(connection) = self.connections.get(&chain) else {
            return;
        };
        let connected = connection.read().connected;
        let outcome = if connected {
            self.get_status(chain).await.map(|_| ())
        } else {
            self.connect(chain).await
        };

        let mut state = connection.write();
        match outcome {
            Ok(()) => {
                state.connected = true;
                state.missed_heartbeats = 0;
                state.last_heartbeat = Some(current_timestamp());
            }
            Err(e) => {
                state.missed_heartbeats += 1;
                debug!("[{}] Heartbeat failed ({}): {}", chain, state.missed_heartbeats, e);
                if state.connected && state.missed_heartbeats >= self.config.max_missed_heartbeats {
                    state.connected = false;
                    warn!(
                        "[{}] Enclave marked disconnected after {} missed heartbeats",
                        chain, state.missed_heartbeats
                    );
                }
            }
        }
    }

    /// One heartbeat round across every chain
    pub async fn heartbeat(&self) {
        let beats = self.connections.keys().map(|chain| self.heartbeat_chain(*chain));
        futures::future::join_all(beats).await;
    }

    /// Spawn one heartbeat loop per chain
    ///
    /// The returned handle completes once every chain's loop has stopped.
    pub fn spawn_heartbeat(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let loops: Vec<_> = self
            .connections
            .keys()
            .map(|chain| self.spawn_chain_heartbeat(*chain, cancel.clone()))
            .collect();
        tokio::spawn(async move {
            for result in futures::future::join_all(loops).await {
                if let Err(e) = result {
                    warn!("Heartbeat loop ended abnormally: {}", e);
                }
            }
            info!("Enclave heartbeat cancelled");
        })
    }

    fn spawn_chain_heartbeat(self: &Arc<Self>, chain: ChainId, cancel: CancellationToken) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(bridge.config.heartbeat_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick fires immediately; connect_all just ran
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = async {
                        interval.tick().await;
                        bridge.heartbeat_chain(chain).await;
                    } => {}
                }
            }
            debug!("[{}] Heartbeat loop stopped", chain);
        })
    }

    /// `getConnectionStatus()`
    pub fn connection_status(&self) -> Vec<ConnectionStatus> {
        self.connections
            .iter()
            .map(|(chain, connection)| {
                let state = connection.read();
                ConnectionStatus {
                    chain: *chain,
                    address: connection.transport.address(),
                    connected: state.connected,
                    last_heartbeat: state.last_heartbeat,
                    public_key: state.public_key.as_ref().map(PublicKey::to_hex),
                    measurement: state.measurement.map(hex::encode),
                }
            })
            .collect()
    }

    /// `getMetrics()`
    pub fn metrics(&self) -> BridgeMetrics {
        BridgeMetrics {
            total_connections: self.connections.len(),
            active_connections: self.connections.values().filter(|c| c.read().connected).count(),
            pending_requests: self.pending.lock().unwrap_or_else(PoisonError::into_inner).len(),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Refuse new requests and fail every pending one with `ShuttingDown`
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let drained: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (id, (chain, _tx)) in &drained {
            debug!("[{}] Abandoning request {}", chain, id);
        }
        for connection in self.connections.values() {
            connection.write().connected = false;
        }
        info!("Enclave bridge shut down ({} pending requests rejected)", drained.len());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crypto::{sha256, verify_signature};
    use std::time::Duration;

    /// Accepts requests and never answers
    pub(crate) struct SilentTransport;

    #[async_trait]
    impl EnclaveTransport for SilentTransport {
        fn address(&self) -> String {
            "silent".into()
        }

        async fn connect(&self, _sink: ResponseSink) -> TrinityResult<()> {
            Ok(())
        }

        async fn send(&self, _request: &EnclaveRequest) -> TrinityResult<()> {
            Ok(())
        }
    }

    pub(crate) fn software_transports(
        chains: &[ChainId],
    ) -> Vec<(ChainId, Arc<InProcessTransport>)> {
        chains
            .iter()
            .map(|chain| {
                let enclave = Arc::new(SoftwareEnclave::new(*chain).unwrap());
                (*chain, Arc::new(InProcessTransport::new(enclave)))
            })
            .collect()
    }

    pub(crate) async fn software_bridge(
        config: EnclaveConfig,
        chains: &[ChainId],
    ) -> (Arc<EnclaveBridge>, Vec<(ChainId, Arc<InProcessTransport>)>) {
        let transports = software_transports(chains);
        let bridge = Arc::new(EnclaveBridge::new(
            config,
            transports
                .iter()
                .map(|(chain, t)| (*chain, t.clone() as Arc<dyn EnclaveTransport>)),
        ));
        assert_eq!(bridge.connect_all().await, chains.len());
        (bridge, transports)
    }

    fn short_timeout() -> EnclaveConfig {
        EnclaveConfig {
            request_timeout_ms: 200,
            ..EnclaveConfig::default()
        }
    }

    #[tokio::test]
    async fn test_connect_reports_identity() {
        let (bridge, transports) = software_bridge(EnclaveConfig::default(), &ChainId::ALL).await;
        for (chain, transport) in &transports {
            let key = bridge.public_key(*chain).unwrap();
            assert_eq!(key, transport.enclave().public_key());
            assert_eq!(key.bytes.len(), chain.signing_algorithm().public_key_len());
        }

        let status = bridge.connection_status();
        assert_eq!(status.len(), 3);
        assert!(status.iter().all(|s| s.connected && s.measurement.is_some()));
        assert_eq!(bridge.metrics().active_connections, 3);
    }

    #[tokio::test]
    async fn test_sign_vote_exact_sizes() {
        let (bridge, _) = software_bridge(EnclaveConfig::default(), &ChainId::ALL).await;
        let digest = sha256(b"op-17");
        for chain in ChainId::ALL {
            let signature = bridge.sign_vote(chain, &digest).await.unwrap();
            assert_eq!(signature.bytes.len(), chain.signing_algorithm().signature_len());
            let key = bridge.public_key(chain).unwrap();
            assert!(verify_signature(&key, &digest, &signature).unwrap());
        }
        assert_eq!(bridge.metrics().pending_requests, 0);
    }

    #[tokio::test]
    async fn test_timeout_names_chain_and_clears_pending() {
        let bridge = EnclaveBridge::new(
            short_timeout(),
            [(ChainId::Ton, Arc::new(SilentTransport) as Arc<dyn EnclaveTransport>)],
        );
        let err = bridge.get_status(ChainId::Ton).await.unwrap_err();
        assert_eq!(err, TrinityError::EnclaveTimeout { chain: ChainId::Ton });
        assert_eq!(bridge.metrics().pending_requests, 0);
        assert_eq!(bridge.metrics().timeouts, 1);
    }

    #[tokio::test]
    async fn test_hung_chain_does_not_block_others() {
        let transports = software_transports(&[ChainId::Solana]);
        let bridge = Arc::new(EnclaveBridge::new(
            short_timeout(),
            [
                (ChainId::Ton, Arc::new(SilentTransport) as Arc<dyn EnclaveTransport>),
                (ChainId::Solana, transports[0].1.clone() as Arc<dyn EnclaveTransport>),
            ],
        ));
        bridge.connect(ChainId::Solana).await.unwrap();

        let hung = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.get_status(ChainId::Ton).await })
        };
        let started = tokio::time::Instant::now();
        bridge.sign_vote(ChainId::Solana, &[1u8; 32]).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(hung.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_disconnected_chain_fails_fast() {
        let bridge = EnclaveBridge::new(
            EnclaveConfig::default(),
            [(ChainId::Arbitrum, Arc::new(SilentTransport) as Arc<dyn EnclaveTransport>)],
        );
        let err = bridge.sign_vote(ChainId::Arbitrum, &[0u8; 32]).await.unwrap_err();
        assert_eq!(err, TrinityError::EnclaveDisconnected { chain: ChainId::Arbitrum });

        let err = bridge.sign_vote(ChainId::Solana, &[0u8; 32]).await.unwrap_err();
        assert_eq!(err, TrinityError::EnclaveDisconnected { chain: ChainId::Solana });
    }

    #[tokio::test]
    async fn test_rejection_surfaces_enclave_error() {
        let (bridge, _) = software_bridge(EnclaveConfig::default(), &[ChainId::Solana]).await;
        let err = bridge
            .generate_key(ChainId::Solana, KeyAlgorithm::Dilithium5)
            .await
            .unwrap_err();
        assert!(matches!(err, TrinityError::EnclaveRejected { chain: ChainId::Solana, .. }));
    }

    #[tokio::test]
    async fn test_generate_key_updates_reported_key() {
        let (bridge, _) = software_bridge(EnclaveConfig::default(), &[ChainId::Arbitrum]).await;
        let before = bridge.public_key(ChainId::Arbitrum).unwrap();
        let rotated = bridge
            .generate_key(ChainId::Arbitrum, KeyAlgorithm::Secp256k1)
            .await
            .unwrap();
        assert_eq!(rotated.bytes.len(), 33);
        assert_ne!(rotated, before);
        assert_eq!(bridge.public_key(ChainId::Arbitrum), Some(rotated));
    }

    #[tokio::test]
    async fn test_seal_round_trip_and_attestation() {
        let (bridge, transports) = software_bridge(EnclaveConfig::default(), &[ChainId::Ton]).await;
        let sealed = bridge.seal(ChainId::Ton, b"htlc secret").await.unwrap();
        assert_eq!(bridge.unseal(ChainId::Ton, &sealed).await.unwrap(), b"htlc secret");

        let evidence = bridge
            .generate_attestation(ChainId::Ton, Some(b"nonce-from-verifier"))
            .await
            .unwrap();
        assert_eq!(evidence.measurement, transports[0].1.enclave().measurement());
        assert_eq!(evidence.user_data, b"nonce-from-verifier");
        assert_eq!(evidence.signature.len(), 4595);
    }

    #[tokio::test]
    async fn test_heartbeat_marks_disconnected_then_recovers() {
        let (bridge, transports) = software_bridge(EnclaveConfig::default(), &[ChainId::Solana]).await;
        let transport = &transports[0].1;

        transport.set_offline(true);
        bridge.heartbeat().await;
        bridge.heartbeat().await;
        assert!(bridge.is_connected(ChainId::Solana));
        bridge.heartbeat().await;
        assert!(!bridge.is_connected(ChainId::Solana));
        assert_eq!(bridge.metrics().active_connections, 0);

        transport.set_offline(false);
        bridge.heartbeat().await;
        assert!(bridge.is_connected(ChainId::Solana));
    }

    #[tokio::test]
    async fn test_hung_enclave_does_not_stall_other_heartbeats() {
        let config = EnclaveConfig {
            heartbeat_interval_secs: 1,
            request_timeout_ms: 10_000,
            ..EnclaveConfig::default()
        };
        let (_, arbitrum) = software_transports(&[ChainId::Arbitrum]).remove(0);
        let bridge = Arc::new(EnclaveBridge::new(
            config,
            [
                (ChainId::Arbitrum, arbitrum as Arc<dyn EnclaveTransport>),
                (ChainId::Solana, Arc::new(SilentTransport) as Arc<dyn EnclaveTransport>),
            ],
        ));
        bridge.connect(ChainId::Arbitrum).await.unwrap();

        let cancel = CancellationToken::new();
        let heartbeat = bridge.spawn_heartbeat(cancel.clone());
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        // INITIALIZE plus two status probes for Arbitrum while Solana's reconnect hangs
        assert!(bridge.metrics().requests_sent >= 4);
        assert!(bridge.is_connected(ChainId::Arbitrum));
        assert!(!bridge.is_connected(ChainId::Solana));

        cancel.cancel();
        heartbeat.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_rejects_pending() {
        let bridge = Arc::new(EnclaveBridge::new(
            EnclaveConfig::default(),
            [(ChainId::Ton, Arc::new(SilentTransport) as Arc<dyn EnclaveTransport>)],
        ));
        let waiting = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.get_status(ChainId::Ton).await })
        };
        while bridge.metrics().pending_requests == 0 {
            tokio::task::yield_now().await;
        }

        bridge.shutdown();
        assert_eq!(waiting.await.unwrap().unwrap_err(), TrinityError::ShuttingDown);
        assert_eq!(bridge.get_status(ChainId::Ton).await.unwrap_err(), TrinityError::ShuttingDown);
    }

    #[test]
    fn test_late_response_dropped() {
        let bridge = EnclaveBridge::new(EnclaveConfig::default(), Vec::new());
        assert!(!bridge.sink().deliver(EnclaveResponse::ok("nobody", vec![])));
    }
}
