//! Chain Event Observer
//!
//! One observer per chain. Events reach it two ways: a push stream fed by
//! whatever subscription the chain offers, and a polling back-stop that
//! scans `[last_processed_block + 1, head]` every tick. Both paths share
//! [`ChainObserver::ingest`], which normalizes, republishes and, for
//! events that gate fund release, raises a verification request at once.
//!
//! The observer does not de-duplicate; consumers do, keyed by
//! `(chain, tx hash, kind)`.

use crate::clock::ChainClock;
use crate::config::ObserverConfig;
use crate::error::{TrinityError, TrinityResult};
use crate::events::EventBus;
use crate::registry::EndpointRegistry;
use crate::rpc::{ChainRpc, RawChainEvent};
use crate::types::{current_timestamp, ChainId, EventKind, NormalizedChainEvent};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Observer counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObserverStats {
    /// Chain observed
    pub chain: Option<ChainId>,
    /// Last block whose range has been scanned
    pub last_processed_block: Option<u64>,
    /// Latest block time reported by the chain
    pub last_block_time: Option<u64>,
    /// Events normalized and published
    pub events_observed: u64,
    /// Verification requests raised
    pub verifications_requested: u64,
    /// Poll ticks completed
    pub polls: u64,
    /// Poll ticks that failed
    pub poll_errors: u64,
}

/// Watches one chain for vault and HTLC lifecycle events
pub struct ChainObserver {
    chain: ChainId,
    registry: Arc<EndpointRegistry>,
    rpc: Arc<dyn ChainRpc>,
    config: ObserverConfig,
    addresses: Vec<String>,
    kinds: HashSet<EventKind>,
    bus: EventBus,
    consumers: broadcast::Sender<NormalizedChainEvent>,
    verification: Option<mpsc::Sender<NormalizedChainEvent>>,
    chain_clock: Option<Arc<ChainClock>>,
    /// Poll cursor; `None` until the first tick pins it to the head
    cursor: Mutex<Option<u64>>,
    last_processed: AtomicU64,
    last_block_time: AtomicU64,
    events_observed: AtomicU64,
    verifications_requested: AtomicU64,
    polls: AtomicU64,
    poll_errors: AtomicU64,
}

impl ChainObserver {
    /// Observer watching every event kind at the configured addresses
    pub fn new(
        chain: ChainId,
        registry: Arc<EndpointRegistry>,
        rpc: Arc<dyn ChainRpc>,
        config: ObserverConfig,
        bus: EventBus,
    ) -> Self {
        let addresses = config
            .watch
            .get(&chain)
            .map(|w| w.addresses.clone())
            .unwrap_or_default();
        let (consumers, _) = broadcast::channel(config.bus_capacity);
        Self {
            chain,
            registry,
            rpc,
            addresses,
            kinds: EventKind::ALL.into_iter().collect(),
            bus,
            consumers,
            verification: None,
            chain_clock: None,
            cursor: Mutex::new(None),
            last_processed: AtomicU64::new(0),
            last_block_time: AtomicU64::new(0),
            events_observed: AtomicU64::new(0),
            verifications_requested: AtomicU64::new(0),
            polls: AtomicU64::new(0),
            poll_errors: AtomicU64::new(0),
            config,
        }
    }

    /// Restrict the watched event kinds
    pub fn watch_kinds(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    /// Send gating events to a verification channel
    pub fn with_verification(mut self, tx: mpsc::Sender<NormalizedChainEvent>) -> Self {
        self.verification = Some(tx);
        self
    }

    /// Feed observed block times into a chain clock
    pub fn with_chain_clock(mut self, clock: Arc<ChainClock>) -> Self {
        self.chain_clock = Some(clock);
        self
    }

    /// Resume polling after `block` instead of at the current head
    pub fn with_start_block(self, block: u64) -> Self {
        self.last_processed.store(block, Ordering::Release);
        Self {
            cursor: Mutex::new(Some(block)),
            ..self
        }
    }

    /// Observed chain
    pub fn chain(&self) -> ChainId {
        self.chain
    }

    /// Receive every normalized event
    pub fn subscribe(&self) -> broadcast::Receiver<NormalizedChainEvent> {
        self.consumers.subscribe()
    }

    /// Last block covered by polling
    pub async fn last_processed_block(&self) -> Option<u64> {
        *self.cursor.lock().await
    }

    /// Counter snapshot
    pub fn stats(&self) -> ObserverStats {
        let last = self.last_processed.load(Ordering::Acquire);
        let block_time = self.last_block_time.load(Ordering::Acquire);
        ObserverStats {
            chain: Some(self.chain),
            last_processed_block: (last > 0).then_some(last),
            last_block_time: (block_time > 0).then_some(block_time),
            events_observed: self.events_observed.load(Ordering::Relaxed),
            verifications_requested: self.verifications_requested.load(Ordering::Relaxed),
            polls: self.polls.load(Ordering::Relaxed),
            poll_errors: self.poll_errors.load(Ordering::Relaxed),
        }
    }

    /// Normalize and publish a raw event from either delivery path
    ///
    /// Returns the normalized event, or `None` when the kind is not watched
    /// or the event belongs to another chain.
    pub async fn ingest(&self, raw: RawChainEvent) -> Option<NormalizedChainEvent> {
        if raw.chain != self.chain || !self.kinds.contains(&raw.kind) {
            return None;
        }
        if let Some(block_time) = raw.block_timestamp {
            self.last_block_time.fetch_max(block_time, Ordering::AcqRel);
            if let Some(clock) = &self.chain_clock {
                clock.observe(self.chain, block_time);
            }
        }

        let event = NormalizedChainEvent {
            kind: raw.kind,
            operation_id: raw.operation_id,
            chain: raw.chain,
            block_number: raw.block_number,
            tx_hash: raw.tx_hash,
            timestamp: current_timestamp(),
            payload: raw.payload,
        };
        self.events_observed.fetch_add(1, Ordering::Relaxed);
        debug!(
            "[{}] {} {} at block {}",
            self.chain,
            event.kind.event_name(),
            event.operation_id,
            event.block_number
        );

        self.bus.publish(&event);
        // lagging or absent consumers do not stall observation
        let _ = self.consumers.send(event.clone());

        if event.kind.requires_immediate_verification() {
            if let Some(tx) = &self.verification {
                self.verifications_requested.fetch_add(1, Ordering::Relaxed);
                info!(
                    "[{}] {} gates fund release; requesting cross-chain verification",
                    self.chain, event.operation_id
                );
                if tx.send(event.clone()).await.is_err() {
                    warn!("[{}] Verification channel closed", self.chain);
                }
            }
        }
        Some(event)
    }

    /// One polling tick; returns the number of events ingested
    pub async fn poll_once(&self) -> TrinityResult<usize> {
        let mut cursor = self.cursor.lock().await;

        let endpoint = self.registry.select_endpoint(self.chain)?;
        let lease = self.registry.lease(endpoint.clone());
        let started = Instant::now();
        let head = match self.rpc.block_number(endpoint.url(), self.chain).await {
            Ok(head) => {
                let latency = started.elapsed().as_secs_f64() * 1000.0;
                self.registry.record_outcome(&endpoint, latency, true);
                head
            }
            Err(e) => {
                if !matches!(e, TrinityError::RateLimited { .. }) {
                    self.registry.record_outcome(&endpoint, 0.0, false);
                }
                return Err(e);
            }
        };

        let Some(last) = *cursor else {
            info!("[{}] Observer starting at block {}", self.chain, head);
            *cursor = Some(head);
            self.last_processed.store(head, Ordering::Release);
            self.polls.fetch_add(1, Ordering::Relaxed);
            return Ok(0);
        };
        if head <= last {
            self.polls.fetch_add(1, Ordering::Relaxed);
            return Ok(0);
        }

        let from = last + 1;
        let to = head.min(last + self.config.max_blocks_per_poll);
        let events = match self
            .rpc
            .fetch_events(endpoint.url(), self.chain, from, to, &self.addresses)
            .await
        {
            Ok(events) => events,
            Err(e) => {
                if !matches!(e, TrinityError::RateLimited { .. }) {
                    self.registry.record_outcome(&endpoint, 0.0, false);
                }
                warn!("[{}] Log scan of {}..={} failed: {}", self.chain, from, to, e);
                return Err(e);
            }
        };
        drop(lease);

        let mut ingested = 0;
        for raw in events {
            if raw.block_number < from || raw.block_number > to {
                continue;
            }
            if self.ingest(raw).await.is_some() {
                ingested += 1;
            }
        }

        *cursor = Some(to);
        self.last_processed.store(to, Ordering::Release);
        self.polls.fetch_add(1, Ordering::Relaxed);
        debug!("[{}] Scanned blocks {}..={} ({} events)", self.chain, from, to, ingested);
        Ok(ingested)
    }

    /// Spawn the polling back-stop
    pub fn spawn_polling(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let observer = self.clone();
        tokio::spawn(async move {
            info!(
                "[{}] Polling every {}s",
                observer.chain, observer.config.poll_interval_secs
            );
            let mut interval = tokio::time::interval(observer.config.poll_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("[{}] Observer polling cancelled", observer.chain);
                        break;
                    }
                    _ = interval.tick() => {
                        match observer.poll_once().await {
                            Ok(_) => {}
                            Err(TrinityError::RateLimited { endpoint }) => {
                                observer.poll_errors.fetch_add(1, Ordering::Relaxed);
                                warn!("[{}] Rate limited by {}; skipping tick", observer.chain, endpoint);
                            }
                            Err(e) => {
                                observer.poll_errors.fetch_add(1, Ordering::Relaxed);
                                error!("[{}] Poll failed: {}", observer.chain, e);
                            }
                        }
                    }
                }
            }
        })
    }

    /// Spawn the push path over a stream of raw events
    pub fn spawn_push(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<RawChainEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let observer = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    raw = events.recv() => match raw {
                        Some(raw) => {
                            observer.ingest(raw).await;
                        }
                        None => {
                            warn!("[{}] Push subscription ended; relying on polling", observer.chain);
                            break;
                        }
                    },
                }
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{ChainWatch, RouterConfig};
    use crate::dedup::EventDeduplicator;
    use crate::registry::tests::spec;
    use crate::rpc::ChainCall;
    use crate::types::EventCategory;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    /// In-memory ledger: a head height and a list of events
    #[derive(Default)]
    pub(crate) struct LedgerRpc {
        pub head: AtomicU64,
        pub events: std::sync::Mutex<Vec<RawChainEvent>>,
        pub ranges: std::sync::Mutex<Vec<(u64, u64)>>,
        pub rate_limited: AtomicBool,
        pub logs_down: AtomicBool,
    }

    #[async_trait]
    impl ChainRpc for LedgerRpc {
        async fn block_number(&self, endpoint: &str, _chain: ChainId) -> TrinityResult<u64> {
            if self.rate_limited.load(Ordering::SeqCst) {
                return Err(TrinityError::RateLimited { endpoint: endpoint.into() });
            }
            Ok(self.head.load(Ordering::SeqCst))
        }

        async fn fetch_events(
            &self,
            endpoint: &str,
            chain: ChainId,
            from: u64,
            to: u64,
            _addresses: &[String],
        ) -> TrinityResult<Vec<RawChainEvent>> {
            if self.logs_down.load(Ordering::SeqCst) {
                return Err(TrinityError::RpcFailed {
                    endpoint: endpoint.into(),
                    reason: "log query failed".into(),
                });
            }
            self.ranges.lock().unwrap().push((from, to));
            Ok(self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.chain == chain && (from..=to).contains(&e.block_number))
                .cloned()
                .collect())
        }

        async fn submit_transaction(&self, _endpoint: &str, _call: &ChainCall) -> TrinityResult<String> {
            Ok("0x0".into())
        }
    }

    pub(crate) fn raw(kind: EventKind, id: &str, block: u64, tx: &str) -> RawChainEvent {
        RawChainEvent {
            chain: ChainId::Arbitrum,
            kind,
            operation_id: id.into(),
            block_number: block,
            tx_hash: tx.into(),
            block_timestamp: Some(1_700_000_000 + block),
            payload: vec![],
        }
    }

    fn observer(rpc: Arc<LedgerRpc>) -> ChainObserver {
        let registry = Arc::new(EndpointRegistry::new(RouterConfig::empty()));
        registry.register(ChainId::Arbitrum, spec("http://arb", 100.0, 99.9));
        let mut config = ObserverConfig::default();
        config.max_blocks_per_poll = 10;
        config.watch.insert(
            ChainId::Arbitrum,
            ChainWatch {
                addresses: vec!["0xvault".into()],
            },
        );
        ChainObserver::new(ChainId::Arbitrum, registry, rpc, config, EventBus::new(64))
    }

    #[tokio::test]
    async fn test_first_poll_pins_cursor_to_head() {
        let rpc = Arc::new(LedgerRpc::default());
        rpc.head.store(500, Ordering::SeqCst);
        rpc.events.lock().unwrap().push(raw(EventKind::VaultCreated, "v1", 400, "0x01"));
        let observer = observer(rpc.clone());

        assert_eq!(observer.poll_once().await.unwrap(), 0);
        assert_eq!(observer.last_processed_block().await, Some(500));
        assert!(rpc.ranges.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_poll_scans_each_range_once() {
        let rpc = Arc::new(LedgerRpc::default());
        rpc.head.store(25, Ordering::SeqCst);
        rpc.events.lock().unwrap().extend([
            raw(EventKind::VaultCreated, "v1", 3, "0x01"),
            raw(EventKind::VaultDeposit, "v1", 14, "0x02"),
        ]);
        let observer = observer(rpc.clone()).with_start_block(0);
        let mut rx = observer.subscribe();

        assert_eq!(observer.poll_once().await.unwrap(), 1);
        assert_eq!(observer.poll_once().await.unwrap(), 1);
        assert_eq!(observer.poll_once().await.unwrap(), 0);
        assert_eq!(observer.poll_once().await.unwrap(), 0);

        assert_eq!(*rpc.ranges.lock().unwrap(), vec![(1, 10), (11, 20), (21, 25)]);
        assert_eq!(observer.last_processed_block().await, Some(25));
        assert_eq!(rx.recv().await.unwrap().operation_id, "v1");
        assert_eq!(observer.stats().events_observed, 2);
    }

    #[tokio::test]
    async fn test_rate_limit_leaves_cursor() {
        let rpc = Arc::new(LedgerRpc::default());
        rpc.head.store(5, Ordering::SeqCst);
        rpc.rate_limited.store(true, Ordering::SeqCst);
        let observer = observer(rpc.clone()).with_start_block(2);

        assert!(matches!(observer.poll_once().await, Err(TrinityError::RateLimited { .. })));
        assert_eq!(observer.last_processed_block().await, Some(2));

        let endpoint = observer.registry.find(ChainId::Arbitrum, "http://arb").unwrap();
        assert_eq!(endpoint.snapshot().error_count, 0);
    }

    #[tokio::test]
    async fn test_failed_log_scan_marks_endpoint() {
        let rpc = Arc::new(LedgerRpc::default());
        rpc.head.store(5, Ordering::SeqCst);
        rpc.logs_down.store(true, Ordering::SeqCst);
        let observer = observer(rpc.clone()).with_start_block(2);
        let endpoint = observer.registry.find(ChainId::Arbitrum, "http://arb").unwrap();
        let before = endpoint.snapshot().reliability;

        assert!(observer.poll_once().await.is_err());
        assert_eq!(observer.last_processed_block().await, Some(2));
        let after = endpoint.snapshot();
        assert_eq!(after.error_count, 1);
        assert!(after.reliability < before);

        rpc.logs_down.store(false, Ordering::SeqCst);
        assert_eq!(observer.poll_once().await.unwrap(), 0);
        assert_eq!(observer.last_processed_block().await, Some(5));
    }

    #[tokio::test]
    async fn test_gating_event_requests_verification_immediately() {
        let rpc = Arc::new(LedgerRpc::default());
        let (tx, mut rx) = mpsc::channel(8);
        let observer = observer(rpc).with_verification(tx);

        observer.ingest(raw(EventKind::VaultDeposit, "v1", 1, "0x01")).await;
        observer.ingest(raw(EventKind::VaultUnlocked, "v1", 2, "0x02")).await;

        let request = rx.try_recv().unwrap();
        assert_eq!(request.kind, EventKind::VaultUnlocked);
        assert!(rx.try_recv().is_err());
        assert_eq!(observer.stats().verifications_requested, 1);
    }

    #[tokio::test]
    async fn test_unwatched_kind_dropped() {
        let observer = observer(Arc::new(LedgerRpc::default())).watch_kinds([EventKind::HtlcCreated]);
        assert!(observer.ingest(raw(EventKind::VaultCreated, "v1", 1, "0x01")).await.is_none());
        assert!(observer.ingest(raw(EventKind::HtlcCreated, "s1", 1, "0x02")).await.is_some());
    }

    #[tokio::test]
    async fn test_push_and_poll_dedup_at_consumer() {
        let rpc = Arc::new(LedgerRpc::default());
        rpc.head.store(10, Ordering::SeqCst);
        let event = raw(EventKind::HtlcCreated, "swap-1", 7, "0xABC");
        rpc.events.lock().unwrap().push(event.clone());
        let observer = observer(rpc).with_start_block(5);
        let mut rx = observer.subscribe();
        let bus_rx = observer.bus.subscribe(EventCategory::Htlc);

        observer.ingest(event).await;
        observer.poll_once().await.unwrap();

        let mut dedup = EventDeduplicator::new(16);
        let mut applied = 0;
        while let Ok(event) = rx.try_recv() {
            if dedup.first_seen(&event) {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
        assert_eq!(bus_rx.len(), 2);
    }

    #[tokio::test]
    async fn test_block_time_feeds_chain_clock() {
        let clock = Arc::new(ChainClock::new(Arc::new(ManualClock::new(1_800_000_000)), 3_600 * 24 * 365 * 10));
        let observer = observer(Arc::new(LedgerRpc::default())).with_chain_clock(clock.clone());
        observer.ingest(raw(EventKind::VaultCreated, "v1", 42, "0x01")).await;
        assert_eq!(clock.last_block_time(ChainId::Arbitrum), Some(1_700_000_042));
        assert_eq!(observer.stats().last_block_time, Some(1_700_000_042));
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_task_stops_on_cancel() {
        let rpc = Arc::new(LedgerRpc::default());
        rpc.head.store(3, Ordering::SeqCst);
        let observer = Arc::new(observer(rpc));
        let cancel = CancellationToken::new();
        let handle = observer.spawn_polling(cancel.clone());

        tokio::time::sleep(std::time::Duration::from_secs(25)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert!(observer.stats().polls >= 3);
    }
}
