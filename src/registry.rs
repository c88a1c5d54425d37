//! Chain Endpoint Registry
//!
//! Holds the candidate RPC endpoints of every chain with live latency,
//! reliability and load figures. Counters live in per-endpoint atomics so
//! concurrent callers on different chains (or endpoints) never contend on
//! a shared lock; the only lock guards the endpoint topology, which is
//! written at registration time.

use crate::config::{EndpointSpec, RouterConfig};
use crate::error::{TrinityError, TrinityResult};
use crate::rpc::ChainRpc;
use crate::types::{current_timestamp, ChainId};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reliability regained per successful call
const SUCCESS_RECOVERY: f64 = 0.01;

/// Endpoint health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum HealthStatus {
    /// Preferred for selection
    Healthy = 0,
    /// Used only when no healthy endpoint exists
    Degraded = 1,
    /// Never selected
    Down = 2,
}

impl HealthStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Healthy,
            1 => Self::Degraded,
            _ => Self::Down,
        }
    }
}

/// f64 stored as bits in an `AtomicU64`
#[derive(Debug)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }

    /// Compare-and-swap update; returns the new value
    fn update(&self, f: impl Fn(f64) -> f64) -> f64 {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = f(f64::from_bits(current)).to_bits();
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return f64::from_bits(next),
                Err(actual) => current = actual,
            }
        }
    }
}

/// A single RPC endpoint; never deleted, only demoted or promoted
#[derive(Debug)]
pub struct ChainEndpoint {
    url: String,
    chain: ChainId,
    region: String,
    current_latency_ms: AtomicF64,
    avg_latency_ms: AtomicF64,
    reliability: AtomicF64,
    status: AtomicU8,
    outstanding: AtomicU64,
    request_count: AtomicU64,
    error_count: AtomicU64,
    last_checked: AtomicU64,
}

impl ChainEndpoint {
    fn new(chain: ChainId, spec: &EndpointSpec, status: HealthStatus) -> Self {
        Self {
            url: spec.url.clone(),
            chain,
            region: spec.region.clone(),
            current_latency_ms: AtomicF64::new(spec.initial_latency_ms),
            avg_latency_ms: AtomicF64::new(spec.initial_latency_ms),
            reliability: AtomicF64::new(spec.initial_reliability),
            status: AtomicU8::new(status as u8),
            outstanding: AtomicU64::new(0),
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_checked: AtomicU64::new(0),
        }
    }

    /// Endpoint URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Chain served by this endpoint
    pub fn chain(&self) -> ChainId {
        self.chain
    }

    /// Current health classification
    pub fn status(&self) -> HealthStatus {
        HealthStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Smoothed latency in milliseconds
    pub fn avg_latency_ms(&self) -> f64 {
        self.avg_latency_ms.load()
    }

    /// Reliability score (0-100)
    pub fn reliability(&self) -> f64 {
        self.reliability.load()
    }

    /// Requests currently in flight
    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Weighted score: 50% inverse latency, 30% reliability, 20% inverse load
    pub fn score(&self) -> f64 {
        let latency_score = 1000.0 / (self.avg_latency_ms() + 1.0);
        let load_score = 100.0 / (self.outstanding() as f64 + 1.0);
        latency_score * 0.5 + self.reliability() * 0.3 + load_score * 0.2
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> EndpointSnapshot {
        EndpointSnapshot {
            url: self.url.clone(),
            chain: self.chain,
            region: self.region.clone(),
            current_latency_ms: self.current_latency_ms.load(),
            avg_latency_ms: self.avg_latency_ms(),
            reliability: self.reliability(),
            status: self.status(),
            outstanding: self.outstanding(),
            request_count: self.request_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            last_checked: self.last_checked.load(Ordering::Relaxed),
        }
    }

    fn set_status(&self, status: HealthStatus) {
        let previous = self.status.swap(status as u8, Ordering::AcqRel);
        if previous != status as u8 {
            info!(
                "[{}] Endpoint {} {:?} -> {:?}",
                self.chain,
                self.url,
                HealthStatus::from_u8(previous),
                status
            );
        }
    }
}

/// Serializable view of an endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSnapshot {
    /// Endpoint URL
    pub url: String,
    /// Chain
    pub chain: ChainId,
    /// Region
    pub region: String,
    /// Last observed latency
    pub current_latency_ms: f64,
    /// Smoothed latency
    pub avg_latency_ms: f64,
    /// Reliability (0-100)
    pub reliability: f64,
    /// Health classification
    pub status: HealthStatus,
    /// Requests in flight
    pub outstanding: u64,
    /// Requests routed so far
    pub request_count: u64,
    /// Failures so far
    pub error_count: u64,
    /// Unix seconds of the last probe
    pub last_checked: u64,
}

/// In-flight marker; the outstanding count drops when the lease is dropped
#[derive(Debug)]
pub struct EndpointLease {
    endpoint: Arc<ChainEndpoint>,
}

impl EndpointLease {
    fn acquire(endpoint: Arc<ChainEndpoint>) -> Self {
        endpoint.outstanding.fetch_add(1, Ordering::AcqRel);
        endpoint.request_count.fetch_add(1, Ordering::Relaxed);
        Self { endpoint }
    }

    /// Leased endpoint
    pub fn endpoint(&self) -> &Arc<ChainEndpoint> {
        &self.endpoint
    }
}

impl Drop for EndpointLease {
    fn drop(&mut self) {
        self.endpoint.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Registry of endpoints for every chain
pub struct EndpointRegistry {
    config: RouterConfig,
    chains: RwLock<BTreeMap<ChainId, Vec<Arc<ChainEndpoint>>>>,
}

impl EndpointRegistry {
    /// Create a registry seeded with the configured endpoints
    pub fn new(config: RouterConfig) -> Self {
        let registry = Self {
            chains: RwLock::new(BTreeMap::new()),
            config: config.clone(),
        };
        for (chain, specs) in &config.endpoints {
            for spec in specs {
                registry.register(*chain, spec.clone());
            }
        }
        registry
    }

    /// Router configuration
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Register an endpoint; registering the same URL twice keeps the first
    pub fn register(&self, chain: ChainId, spec: EndpointSpec) -> Arc<ChainEndpoint> {
        let mut chains = match self.chains.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let list = chains.entry(chain).or_default();
        if let Some(existing) = list.iter().find(|e| e.url == spec.url) {
            return existing.clone();
        }
        let status = self.classify(spec.initial_latency_ms, spec.initial_reliability);
        let endpoint = Arc::new(ChainEndpoint::new(chain, &spec, status));
        list.push(endpoint.clone());
        debug!("[{}] Registered endpoint {} ({:?})", chain, spec.url, status);
        endpoint
    }

    /// Every endpoint of a chain
    pub fn endpoints(&self, chain: ChainId) -> Vec<Arc<ChainEndpoint>> {
        let chains = match self.chains.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        chains.get(&chain).cloned().unwrap_or_default()
    }

    /// Every endpoint of every chain
    pub fn all_endpoints(&self) -> Vec<Arc<ChainEndpoint>> {
        let chains = match self.chains.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        chains.values().flatten().cloned().collect()
    }

    /// Look up an endpoint by URL
    pub fn find(&self, chain: ChainId, url: &str) -> Option<Arc<ChainEndpoint>> {
        self.endpoints(chain).into_iter().find(|e| e.url == url)
    }

    /// Best endpoint for a chain
    ///
    /// Prefers healthy endpoints, falls back to degraded ones, and fails
    /// with `NoEndpointAvailable` when every endpoint is down.
    pub fn select_endpoint(&self, chain: ChainId) -> TrinityResult<Arc<ChainEndpoint>> {
        self.select_excluding(chain, None)
    }

    /// Best endpoint other than `exclude`
    pub fn select_excluding(
        &self,
        chain: ChainId,
        exclude: Option<&str>,
    ) -> TrinityResult<Arc<ChainEndpoint>> {
        let candidates: Vec<_> = self
            .endpoints(chain)
            .into_iter()
            .filter(|e| Some(e.url.as_str()) != exclude)
            .collect();

        let best_with = |status: HealthStatus| {
            candidates
                .iter()
                .filter(|e| e.status() == status)
                .max_by(|a, b| a.score().total_cmp(&b.score()))
                .cloned()
        };

        best_with(HealthStatus::Healthy)
            .or_else(|| best_with(HealthStatus::Degraded))
            .ok_or(TrinityError::NoEndpointAvailable { chain })
    }

    /// Mark an endpoint busy for the lifetime of the returned lease
    pub fn lease(&self, endpoint: Arc<ChainEndpoint>) -> EndpointLease {
        EndpointLease::acquire(endpoint)
    }

    /// Record the outcome of a request against an endpoint
    pub fn record_outcome(&self, endpoint: &ChainEndpoint, latency_ms: f64, success: bool) {
        if success {
            let smoothing = self.config.latency_smoothing;
            endpoint.current_latency_ms.store(latency_ms);
            endpoint
                .avg_latency_ms
                .update(|old| old * smoothing + latency_ms * (1.0 - smoothing));
            endpoint.reliability.update(|r| (r + SUCCESS_RECOVERY).min(100.0));
        } else {
            endpoint.error_count.fetch_add(1, Ordering::Relaxed);
            let penalty = self.config.failure_penalty;
            endpoint.reliability.update(|r| (r - penalty).max(0.0));
        }
        endpoint.set_status(self.classify(endpoint.avg_latency_ms(), endpoint.reliability()));
    }

    /// Force an endpoint down until the next successful probe
    pub fn mark_down(&self, endpoint: &ChainEndpoint) {
        endpoint.set_status(HealthStatus::Down);
    }

    /// Health classification from latency and reliability thresholds
    pub fn classify(&self, latency_ms: f64, reliability: f64) -> HealthStatus {
        if latency_ms < self.config.healthy_latency_ms && reliability > self.config.healthy_reliability {
            HealthStatus::Healthy
        } else if latency_ms < self.config.degraded_latency_ms
            && reliability > self.config.degraded_reliability
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Down
        }
    }

    /// Probe one endpoint with the configured timeout and reclassify it
    pub async fn probe_endpoint(&self, rpc: &dyn ChainRpc, endpoint: &ChainEndpoint) {
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.config.probe_timeout(),
            rpc.probe(&endpoint.url, endpoint.chain),
        )
        .await;
        endpoint.last_checked.store(current_timestamp(), Ordering::Relaxed);

        match outcome {
            Ok(Ok(())) => {
                let latency = started.elapsed().as_secs_f64() * 1000.0;
                let smoothing = self.config.latency_smoothing;
                endpoint.current_latency_ms.store(latency);
                let avg = endpoint
                    .avg_latency_ms
                    .update(|old| old * smoothing + latency * (1.0 - smoothing));
                endpoint.set_status(self.classify(avg, endpoint.reliability()));
            }
            Ok(Err(e)) => {
                warn!("[{}] Health probe failed for {}: {}", endpoint.chain, endpoint.url, e);
                self.probe_failed(endpoint);
            }
            Err(_) => {
                warn!("[{}] Health probe timed out for {}", endpoint.chain, endpoint.url);
                self.probe_failed(endpoint);
            }
        }
    }

    fn probe_failed(&self, endpoint: &ChainEndpoint) {
        endpoint.error_count.fetch_add(1, Ordering::Relaxed);
        let penalty = self.config.failure_penalty;
        endpoint.reliability.update(|r| (r - penalty).max(0.0));
        endpoint.set_status(HealthStatus::Down);
    }

    /// Probe every endpoint concurrently
    pub async fn health_sweep(&self, rpc: &dyn ChainRpc) {
        let endpoints = self.all_endpoints();
        futures::future::join_all(endpoints.iter().map(|e| self.probe_endpoint(rpc, e))).await;
    }

    /// Spawn the periodic health-check sweep
    pub fn spawn_health_checks(
        self: &Arc<Self>,
        rpc: Arc<dyn ChainRpc>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            info!(
                "Starting endpoint health checks every {}s",
                registry.config.health_check_interval_secs
            );
            let mut interval = tokio::time::interval(registry.config.health_check_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Endpoint health checks cancelled");
                        break;
                    }
                    _ = interval.tick() => registry.health_sweep(rpc.as_ref()).await,
                }
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::rpc::{ChainCall, RawChainEvent};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Probe double: URLs in `failing` error out, URLs in `hanging` never answer
    #[derive(Default)]
    pub(crate) struct ProbeRpc {
        pub failing: Mutex<HashSet<String>>,
        pub hanging: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl ChainRpc for ProbeRpc {
        async fn block_number(&self, endpoint: &str, _chain: ChainId) -> TrinityResult<u64> {
            let hang = self.hanging.lock().unwrap().contains(endpoint);
            if hang {
                std::future::pending::<()>().await;
            }
            let fail = self.failing.lock().unwrap().contains(endpoint);
            if fail {
                return Err(TrinityError::RpcFailed {
                    endpoint: endpoint.into(),
                    reason: "refused".into(),
                });
            }
            Ok(1)
        }

        async fn fetch_events(
            &self,
            _endpoint: &str,
            _chain: ChainId,
            _from: u64,
            _to: u64,
            _addresses: &[String],
        ) -> TrinityResult<Vec<RawChainEvent>> {
            Ok(Vec::new())
        }

        async fn submit_transaction(&self, _endpoint: &str, _call: &ChainCall) -> TrinityResult<String> {
            Ok("0x0".into())
        }
    }

    pub(crate) fn spec(url: &str, latency: f64, reliability: f64) -> EndpointSpec {
        EndpointSpec {
            url: url.into(),
            region: "test".into(),
            initial_latency_ms: latency,
            initial_reliability: reliability,
        }
    }

    #[test]
    fn test_select_prefers_best_score() {
        let registry = EndpointRegistry::new(RouterConfig::default());
        let best = registry.select_endpoint(ChainId::Solana).unwrap();
        assert_eq!(best.url(), "https://api.devnet.solana.com");
    }

    #[test]
    fn test_failover_skips_down_endpoint() {
        let registry = EndpointRegistry::new(RouterConfig::default());
        let best = registry.select_endpoint(ChainId::Arbitrum).unwrap();
        registry.mark_down(&best);

        let next = registry.select_endpoint(ChainId::Arbitrum).unwrap();
        assert_ne!(next.url(), best.url());
        assert_ne!(next.status(), HealthStatus::Down);
    }

    #[test]
    fn test_degraded_used_only_without_healthy() {
        let registry = EndpointRegistry::new(RouterConfig::empty());
        let degraded = registry.register(ChainId::Ton, spec("http://degraded", 50.0, 97.0));
        let healthy = registry.register(ChainId::Ton, spec("http://healthy", 400.0, 99.5));
        registry.record_outcome(&degraded, 50.0, true);
        registry.record_outcome(&healthy, 400.0, true);
        assert_eq!(degraded.status(), HealthStatus::Degraded);

        // degraded has the better raw score but healthy wins
        assert_eq!(registry.select_endpoint(ChainId::Ton).unwrap().url(), "http://healthy");

        registry.mark_down(&healthy);
        assert_eq!(registry.select_endpoint(ChainId::Ton).unwrap().url(), "http://degraded");

        registry.mark_down(&degraded);
        assert_eq!(
            registry.select_endpoint(ChainId::Ton).unwrap_err(),
            TrinityError::NoEndpointAvailable { chain: ChainId::Ton }
        );
    }

    #[test]
    fn test_initial_status_follows_seed_metrics() {
        let registry = EndpointRegistry::new(RouterConfig::default());
        let ton = registry.endpoints(ChainId::Ton);
        assert!(ton.iter().all(|e| e.status() == HealthStatus::Degraded));
        assert_eq!(
            registry.select_endpoint(ChainId::Ton).unwrap().url(),
            "https://testnet.toncenter.com/api/v2/jsonRPC"
        );

        let slow = registry.register(ChainId::Arbitrum, spec("http://slow", 2_500.0, 99.9));
        assert_eq!(slow.status(), HealthStatus::Down);
        let infura = registry.find(ChainId::Arbitrum, "https://arbitrum-sepolia.infura.io/v3/demo").unwrap();
        assert_eq!(infura.status(), HealthStatus::Degraded);
    }

    #[test]
    fn test_record_outcome_smooths_latency() {
        let registry = EndpointRegistry::new(RouterConfig::empty());
        let endpoint = registry.register(ChainId::Solana, spec("http://a", 100.0, 99.9));
        registry.record_outcome(&endpoint, 200.0, true);
        assert!((endpoint.avg_latency_ms() - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_failure_penalty_floors_at_zero() {
        let registry = EndpointRegistry::new(RouterConfig::empty());
        let endpoint = registry.register(ChainId::Solana, spec("http://a", 100.0, 0.05));
        registry.record_outcome(&endpoint, 0.0, false);
        registry.record_outcome(&endpoint, 0.0, false);
        assert_eq!(endpoint.reliability(), 0.0);
        assert_eq!(endpoint.snapshot().error_count, 2);
        assert_eq!(endpoint.status(), HealthStatus::Down);
    }

    #[test]
    fn test_lease_tracks_outstanding_load() {
        let registry = EndpointRegistry::new(RouterConfig::empty());
        let endpoint = registry.register(ChainId::Arbitrum, spec("http://a", 100.0, 99.9));
        let before = endpoint.score();
        {
            let _lease = registry.lease(endpoint.clone());
            assert_eq!(endpoint.outstanding(), 1);
            assert!(endpoint.score() < before);
        }
        assert_eq!(endpoint.outstanding(), 0);
        assert_eq!(endpoint.snapshot().request_count, 1);
    }

    #[test]
    fn test_duplicate_registration_ignored() {
        let registry = EndpointRegistry::new(RouterConfig::empty());
        registry.register(ChainId::Arbitrum, spec("http://a", 100.0, 99.9));
        registry.register(ChainId::Arbitrum, spec("http://a", 10.0, 50.0));
        assert_eq!(registry.endpoints(ChainId::Arbitrum).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_sweep_marks_failures_down() {
        let registry = EndpointRegistry::new(RouterConfig::empty());
        let ok = registry.register(ChainId::Solana, spec("http://ok", 100.0, 99.9));
        let bad = registry.register(ChainId::Solana, spec("http://bad", 100.0, 99.9));
        let hung = registry.register(ChainId::Solana, spec("http://hung", 100.0, 99.9));

        let rpc = ProbeRpc::default();
        rpc.failing.lock().unwrap().insert("http://bad".into());
        rpc.hanging.lock().unwrap().insert("http://hung".into());

        registry.health_sweep(&rpc).await;

        assert_eq!(ok.status(), HealthStatus::Healthy);
        assert_eq!(bad.status(), HealthStatus::Down);
        assert_eq!(hung.status(), HealthStatus::Down);
        assert!(ok.snapshot().last_checked > 0);
        assert_eq!(registry.select_endpoint(ChainId::Solana).unwrap().url(), "http://ok");
    }
}
