//! Configuration for the Trinity coordinator
//!
//! Every section carries the constants the coordinator has always run
//! with as defaults, and validates itself before a coordinator is built.

use crate::error::{TrinityError, TrinityResult};
use crate::types::ChainId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Main coordinator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrinityConfig {
    /// Endpoint registry and operation router
    pub router: RouterConfig,
    /// Chain event observers
    pub observer: ObserverConfig,
    /// Enclave signing bridge
    pub enclave: EnclaveConfig,
    /// Consensus verifier
    pub consensus: ConsensusConfig,
    /// HTLC swap state machine
    pub htlc: HtlcConfig,
}

impl TrinityConfig {
    /// Parse a JSON document and validate it
    pub fn from_json_str(json: &str) -> TrinityResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate().map_err(TrinityError::ConfigurationError)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        self.router.validate()?;
        self.observer.validate()?;
        self.enclave.validate()?;
        self.consensus.validate()?;
        self.htlc.validate()?;
        Ok(())
    }
}

/// A candidate RPC endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSpec {
    /// Endpoint URL
    pub url: String,
    /// Hosting region
    pub region: String,
    /// Seed latency estimate in milliseconds
    pub initial_latency_ms: f64,
    /// Seed reliability score (0-100)
    pub initial_reliability: f64,
}

impl EndpointSpec {
    fn new(url: &str, region: &str, latency: f64, reliability: f64) -> Self {
        Self {
            url: url.into(),
            region: region.into(),
            initial_latency_ms: latency,
            initial_reliability: reliability,
        }
    }
}

/// Static latency estimate between two chains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainPairDelay {
    /// One side of the pair
    pub from: ChainId,
    /// Other side of the pair
    pub to: ChainId,
    /// Estimated delay in milliseconds
    pub delay_ms: u64,
}

/// Endpoint registry and operation router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Candidate endpoints per chain
    pub endpoints: BTreeMap<ChainId, Vec<EndpointSpec>>,
    /// Health-check sweep interval in seconds
    pub health_check_interval_secs: u64,
    /// Per-probe timeout in milliseconds
    pub probe_timeout_ms: u64,
    /// Deadline for a single chain call during execution
    pub execution_timeout_ms: u64,
    /// Weight of the previous average in the latency EMA
    pub latency_smoothing: f64,
    /// Reliability points removed per failure
    pub failure_penalty: f64,
    /// Latency ceiling for healthy endpoints
    pub healthy_latency_ms: f64,
    /// Reliability floor for healthy endpoints
    pub healthy_reliability: f64,
    /// Latency ceiling for degraded endpoints
    pub degraded_latency_ms: f64,
    /// Reliability floor for degraded endpoints
    pub degraded_reliability: f64,
    /// Cross-chain delay table
    pub cross_chain_delays: Vec<ChainPairDelay>,
    /// Delay assumed for pairs missing from the table
    pub default_cross_chain_delay_ms: u64,
    /// Number of route outcomes kept for metrics
    pub route_history_limit: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        let mut endpoints = BTreeMap::new();
        endpoints.insert(
            ChainId::Arbitrum,
            vec![
                EndpointSpec::new("https://sepolia-rollup.arbitrum.io/rpc", "us-east", 120.0, 99.9),
                EndpointSpec::new("https://arb-sepolia.g.alchemy.com/v2/demo", "us-west", 140.0, 99.8),
                EndpointSpec::new("https://arbitrum-sepolia.infura.io/v3/demo", "eu-central", 180.0, 98.5),
            ],
        );
        endpoints.insert(
            ChainId::Solana,
            vec![
                EndpointSpec::new("https://api.devnet.solana.com", "us-east", 80.0, 99.5),
                EndpointSpec::new("https://devnet.rpcpool.com", "us-west", 90.0, 99.7),
                EndpointSpec::new("https://solana-devnet.gateway.pokt.network", "eu-west", 100.0, 99.2),
            ],
        );
        endpoints.insert(
            ChainId::Ton,
            vec![
                EndpointSpec::new("https://testnet.toncenter.com/api/v2/jsonRPC", "eu-central", 150.0, 99.0),
                EndpointSpec::new("https://testnet.tonapi.io/v2/jsonRPC", "eu-west", 160.0, 98.8),
            ],
        );

        Self {
            endpoints,
            health_check_interval_secs: 10,
            probe_timeout_ms: 5_000,
            execution_timeout_ms: 30_000,
            latency_smoothing: 0.8,
            failure_penalty: 0.1,
            healthy_latency_ms: 500.0,
            healthy_reliability: 99.0,
            degraded_latency_ms: 2_000.0,
            degraded_reliability: 95.0,
            cross_chain_delays: vec![
                ChainPairDelay { from: ChainId::Arbitrum, to: ChainId::Solana, delay_ms: 200 },
                ChainPairDelay { from: ChainId::Arbitrum, to: ChainId::Ton, delay_ms: 250 },
                ChainPairDelay { from: ChainId::Solana, to: ChainId::Ton, delay_ms: 180 },
            ],
            default_cross_chain_delay_ms: 300,
            route_history_limit: 1_000,
        }
    }
}

impl RouterConfig {
    /// Configuration with no endpoints registered
    pub fn empty() -> Self {
        Self {
            endpoints: BTreeMap::new(),
            ..Self::default()
        }
    }

    /// Static cross-chain delay for a pair; symmetric, zero for the same chain
    pub fn cross_chain_delay_ms(&self, a: ChainId, b: ChainId) -> u64 {
        if a == b {
            return 0;
        }
        self.cross_chain_delays
            .iter()
            .find(|d| (d.from == a && d.to == b) || (d.from == b && d.to == a))
            .map(|d| d.delay_ms)
            .unwrap_or(self.default_cross_chain_delay_ms)
    }

    /// Health-check interval as a duration
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// Probe timeout as a duration
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Execution deadline as a duration
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    fn validate(&self) -> Result<(), String> {
        if self.health_check_interval_secs == 0 {
            return Err("health_check_interval_secs must be > 0".into());
        }
        if self.probe_timeout_ms == 0 || self.execution_timeout_ms == 0 {
            return Err("probe and execution timeouts must be > 0".into());
        }
        if !(0.0..1.0).contains(&self.latency_smoothing) {
            return Err("latency_smoothing must be in [0, 1)".into());
        }
        if self.failure_penalty < 0.0 {
            return Err("failure_penalty must be >= 0".into());
        }
        if self.healthy_latency_ms > self.degraded_latency_ms {
            return Err("healthy_latency_ms must be <= degraded_latency_ms".into());
        }
        if self.healthy_reliability < self.degraded_reliability {
            return Err("healthy_reliability must be >= degraded_reliability".into());
        }
        if self.route_history_limit == 0 {
            return Err("route_history_limit must be > 0".into());
        }
        for (chain, list) in &self.endpoints {
            for spec in list {
                if spec.url.is_empty() {
                    return Err(format!("empty endpoint url for {}", chain));
                }
                if !(0.0..=100.0).contains(&spec.initial_reliability) {
                    return Err(format!("reliability for {} must be within 0-100", spec.url));
                }
            }
        }
        Ok(())
    }
}

/// Per-chain observation target
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainWatch {
    /// Contract / program addresses to watch
    pub addresses: Vec<String>,
}

/// Chain event observer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    /// Poll cadence in seconds
    pub poll_interval_secs: u64,
    /// Maximum blocks scanned per poll tick
    pub max_blocks_per_poll: u64,
    /// Addresses watched per chain
    pub watch: BTreeMap<ChainId, ChainWatch>,
    /// Capacity of each event-bus channel
    pub bus_capacity: usize,
    /// Number of idempotency keys remembered by each consumer
    pub dedup_capacity: usize,
    /// Seconds after which an observed block time is considered stale
    pub chain_clock_staleness_secs: u64,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            max_blocks_per_poll: 1_000,
            watch: BTreeMap::new(),
            bus_capacity: 1_024,
            dedup_capacity: 10_000,
            chain_clock_staleness_secs: 120,
        }
    }
}

impl ObserverConfig {
    /// Poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    fn validate(&self) -> Result<(), String> {
        if self.poll_interval_secs == 0 {
            return Err("poll_interval_secs must be > 0".into());
        }
        if self.max_blocks_per_poll == 0 {
            return Err("max_blocks_per_poll must be > 0".into());
        }
        if self.bus_capacity == 0 || self.dedup_capacity == 0 {
            return Err("bus_capacity and dedup_capacity must be > 0".into());
        }
        Ok(())
    }
}

/// Enclave signing bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnclaveConfig {
    /// Channel address per chain
    pub socket_paths: BTreeMap<ChainId, String>,
    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Consecutive heartbeat failures before a connection is marked disconnected
    pub max_missed_heartbeats: u32,
}

impl Default for EnclaveConfig {
    fn default() -> Self {
        let socket_paths = ChainId::ALL
            .iter()
            .map(|chain| (*chain, format!("/tmp/trinity-shield-{}.sock", chain.slug())))
            .collect();
        Self {
            socket_paths,
            request_timeout_ms: 30_000,
            heartbeat_interval_secs: 10,
            max_missed_heartbeats: 3,
        }
    }
}

impl EnclaveConfig {
    /// Request timeout as a duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Heartbeat interval as a duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    fn validate(&self) -> Result<(), String> {
        if self.request_timeout_ms == 0 {
            return Err("request_timeout_ms must be > 0".into());
        }
        if self.heartbeat_interval_secs == 0 {
            return Err("heartbeat_interval_secs must be > 0".into());
        }
        if self.max_missed_heartbeats == 0 {
            return Err("max_missed_heartbeats must be > 0".into());
        }
        Ok(())
    }
}

/// Consensus verifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Minimum distinct chain votes required (2-of-3)
    pub required_quorum: u8,
    /// Total chains in the system
    pub total_chains: u8,
    /// Seconds from first vote until a pending record expires
    pub vote_deadline_secs: u64,
    /// Cadence of the expiry sweep
    pub expiry_sweep_secs: u64,
    /// Seconds a terminal record is kept before removal
    pub record_retention_secs: u64,
    /// Chains whose enclaves may co-sign consensus proofs, in preference order
    pub proof_signers: Vec<ChainId>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            required_quorum: 2,
            total_chains: 3,
            vote_deadline_secs: 300,
            expiry_sweep_secs: 5,
            record_retention_secs: 3_600,
            proof_signers: vec![ChainId::Arbitrum, ChainId::Solana, ChainId::Ton],
        }
    }
}

impl ConsensusConfig {
    fn validate(&self) -> Result<(), String> {
        if self.required_quorum > self.total_chains {
            return Err("required_quorum cannot exceed total_chains".into());
        }
        if self.required_quorum < 2 {
            return Err("required_quorum must be >= 2 for Byzantine fault tolerance".into());
        }
        if self.vote_deadline_secs == 0 || self.expiry_sweep_secs == 0 {
            return Err("vote_deadline_secs and expiry_sweep_secs must be > 0".into());
        }
        if self.proof_signers.is_empty() {
            return Err("at least one proof signer is required".into());
        }
        Ok(())
    }
}

/// HTLC swap state machine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HtlcConfig {
    /// Default timelock window when a caller does not supply one
    pub default_timelock_secs: u64,
    /// Smallest window accepted at init
    pub min_timelock_secs: u64,
    /// Largest window accepted at init
    pub max_timelock_secs: u64,
    /// Cadence of the expiry sweep for never-locked swaps
    pub expiry_sweep_secs: u64,
}

impl Default for HtlcConfig {
    fn default() -> Self {
        Self {
            default_timelock_secs: 3_600,
            min_timelock_secs: 300,
            max_timelock_secs: 7 * 24 * 3_600,
            expiry_sweep_secs: 30,
        }
    }
}

impl HtlcConfig {
    fn validate(&self) -> Result<(), String> {
        if self.min_timelock_secs > self.max_timelock_secs {
            return Err("min_timelock_secs must be <= max_timelock_secs".into());
        }
        if !(self.min_timelock_secs..=self.max_timelock_secs).contains(&self.default_timelock_secs) {
            return Err("default_timelock_secs must lie within [min, max]".into());
        }
        if self.expiry_sweep_secs == 0 {
            return Err("expiry_sweep_secs must be > 0".into());
        }
        Ok(())
    }
}
