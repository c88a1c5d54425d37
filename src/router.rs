//! Operation Router
//!
//! Outward-facing entry point for chain operations. `submit_operation`
//! picks the endpoints for a source/destination pair and quotes an
//! estimated latency; `execute_operation` drives the signed call through
//! the registry under a deadline, feeding the outcome back into endpoint
//! scoring. A failed attempt is retried exactly once on a different
//! endpoint of the same chain.

use crate::crypto::random_array;
use crate::error::{TrinityError, TrinityResult};
use crate::registry::{ChainEndpoint, EndpointRegistry};
use crate::rpc::{ChainCall, ChainRpc};
use crate::types::{current_timestamp, current_timestamp_ms, ChainId, OperationKind, Priority};

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Answer to `submit_operation`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteQuote {
    /// Route handle for `execute_operation`
    pub route_id: String,
    /// Source latency + destination latency + cross-chain delay
    pub estimated_latency_ms: u64,
}

/// A resolved route awaiting execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutePlan {
    /// Route handle
    pub route_id: String,
    /// Chain the operation executes on
    pub source: ChainId,
    /// Chain the operation settles on
    pub destination: ChainId,
    /// Amount in the smallest unit of the source asset
    pub amount: u128,
    /// Operation kind
    pub kind: OperationKind,
    /// Scheduling priority
    pub priority: Priority,
    /// Endpoint chosen on the source chain
    pub source_endpoint: String,
    /// Endpoint chosen on the destination chain
    pub destination_endpoint: String,
    /// Quoted latency
    pub estimated_latency_ms: u64,
    /// Unix seconds
    pub created_at: u64,
}

/// Answer to `execute_operation`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReceipt {
    /// Route handle
    pub route_id: String,
    /// Whether the chain accepted the call
    pub success: bool,
    /// Wall time across all attempts
    pub actual_latency_ms: u64,
    /// Hash reported by the chain
    pub transaction_hash: Option<String>,
    /// Endpoint that answered
    pub endpoint: String,
    /// 1, or 2 when the retry was used
    pub attempts: u8,
}

/// One entry of the route history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteOutcome {
    /// Route handle
    pub route_id: String,
    /// Source chain
    pub source: ChainId,
    /// Destination chain
    pub destination: ChainId,
    /// Quoted latency
    pub estimated_latency_ms: u64,
    /// Measured latency
    pub actual_latency_ms: u64,
    /// Outcome
    pub success: bool,
    /// Unix seconds
    pub completed_at: u64,
}

/// Router metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterMetrics {
    /// Executions attempted
    pub total_operations: u64,
    /// Executions that succeeded
    pub successful_operations: u64,
    /// Executions that surfaced an error
    pub failed_operations: u64,
    /// Mean latency of successful executions
    pub average_latency_ms: f64,
    /// Most recent outcomes, oldest first
    pub history: Vec<RouteOutcome>,
}

#[derive(Default)]
struct MetricsState {
    total: u64,
    successful: u64,
    failed: u64,
    latency_sum_ms: u64,
    history: VecDeque<RouteOutcome>,
}

/// Routes operations across chains through the endpoint registry
pub struct OperationRouter {
    registry: Arc<EndpointRegistry>,
    rpc: Arc<dyn ChainRpc>,
    routes: Mutex<HashMap<String, RoutePlan>>,
    metrics: Mutex<MetricsState>,
}

impl OperationRouter {
    /// Create a router over a registry and an RPC implementation
    pub fn new(registry: Arc<EndpointRegistry>, rpc: Arc<dyn ChainRpc>) -> Self {
        Self {
            registry,
            rpc,
            routes: Mutex::new(HashMap::new()),
            metrics: Mutex::new(MetricsState::default()),
        }
    }

    /// Endpoint registry behind this router
    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// Select endpoints for a chain pair and quote the expected latency
    pub fn submit_operation(
        &self,
        source: ChainId,
        destination: ChainId,
        amount: u128,
        kind: OperationKind,
        priority: Priority,
    ) -> TrinityResult<RouteQuote> {
        let source_endpoint = self.registry.select_endpoint(source)?;
        let destination_endpoint = self.registry.select_endpoint(destination)?;

        let delay = self.registry.config().cross_chain_delay_ms(source, destination);
        let estimated_latency_ms = source_endpoint.avg_latency_ms().round() as u64
            + destination_endpoint.avg_latency_ms().round() as u64
            + delay;

        let route_id = format!(
            "route_{}_{}",
            current_timestamp_ms(),
            hex::encode(random_array::<4>()?)
        );
        let plan = RoutePlan {
            route_id: route_id.clone(),
            source,
            destination,
            amount,
            kind,
            priority,
            source_endpoint: source_endpoint.url().to_string(),
            destination_endpoint: destination_endpoint.url().to_string(),
            estimated_latency_ms,
            created_at: current_timestamp(),
        };

        debug!(
            "Route {} {} -> {} via {} (est {} ms, {:?})",
            route_id, source, destination, plan.source_endpoint, estimated_latency_ms, priority
        );
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(route_id.clone(), plan);

        Ok(RouteQuote {
            route_id,
            estimated_latency_ms,
        })
    }

    /// Resolved plan for a route that has not been executed yet
    pub fn route(&self, route_id: &str) -> Option<RoutePlan> {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(route_id)
            .cloned()
    }

    /// Execute a submitted route by sending the signed call to the source chain
    ///
    /// The route is consumed whatever the outcome.
    pub async fn execute_operation(
        &self,
        route_id: &str,
        signed_transaction: Vec<u8>,
    ) -> TrinityResult<ExecutionReceipt> {
        let plan = self
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(route_id)
            .ok_or_else(|| TrinityError::UnknownRoute(route_id.to_string()))?;

        let call = ChainCall {
            chain: plan.source,
            kind: plan.kind,
            payload: signed_transaction,
        };
        let started = Instant::now();
        let result = self.execute_with_retry(&plan, &call).await;
        let actual_latency_ms = started.elapsed().as_millis() as u64;

        self.record(&plan, actual_latency_ms, result.is_ok());
        match result {
            Ok((endpoint, transaction_hash, attempts)) => {
                info!(
                    "Route {} executed on {} in {} ms ({} attempt(s))",
                    route_id, endpoint, actual_latency_ms, attempts
                );
                Ok(ExecutionReceipt {
                    route_id: route_id.to_string(),
                    success: true,
                    actual_latency_ms,
                    transaction_hash: Some(transaction_hash),
                    endpoint,
                    attempts,
                })
            }
            Err(e) => {
                warn!("Route {} failed: {}", route_id, e);
                Err(e)
            }
        }
    }

    /// Submit a call to a chain outside of a quoted route, with the same retry policy
    pub async fn dispatch(&self, call: &ChainCall) -> TrinityResult<String> {
        let first = self.registry.select_endpoint(call.chain)?;
        match self.attempt(&first, call).await {
            Ok(hash) => Ok(hash),
            Err(e) if e.is_retryable() => {
                let second = self.registry.select_excluding(call.chain, Some(first.url()))?;
                self.attempt(&second, call).await
            }
            Err(e) => Err(e),
        }
    }

    async fn execute_with_retry(
        &self,
        plan: &RoutePlan,
        call: &ChainCall,
    ) -> TrinityResult<(String, String, u8)> {
        // the endpoint chosen at submit time may have been demoted since
        let first = match self.registry.find(plan.source, &plan.source_endpoint) {
            Some(e) if e.status() != crate::registry::HealthStatus::Down => e,
            _ => self.registry.select_endpoint(plan.source)?,
        };

        let error = match self.attempt(&first, call).await {
            Ok(hash) => return Ok((first.url().to_string(), hash, 1)),
            Err(e) if e.is_retryable() => e,
            Err(e) => return Err(e),
        };

        let second = match self.registry.select_excluding(plan.source, Some(first.url())) {
            Ok(endpoint) => endpoint,
            Err(_) => {
                return Err(TrinityError::ChainUnavailable {
                    chain: plan.source,
                    reason: error.to_string(),
                })
            }
        };
        warn!(
            "Route {} retrying on {} after: {}",
            plan.route_id,
            second.url(),
            error
        );
        let hash = self.attempt(&second, call).await?;
        Ok((second.url().to_string(), hash, 2))
    }

    async fn attempt(&self, endpoint: &Arc<ChainEndpoint>, call: &ChainCall) -> TrinityResult<String> {
        let _lease = self.registry.lease(endpoint.clone());
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.registry.config().execution_timeout(),
            self.rpc.submit_transaction(endpoint.url(), call),
        )
        .await
        .unwrap_or_else(|_| {
            Err(TrinityError::RpcTimeout {
                endpoint: endpoint.url().to_string(),
            })
        });

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.registry.record_outcome(endpoint, latency_ms, outcome.is_ok());
        outcome
    }

    fn record(&self, plan: &RoutePlan, actual_latency_ms: u64, success: bool) {
        let limit = self.registry.config().route_history_limit;
        let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        metrics.total += 1;
        if success {
            metrics.successful += 1;
            metrics.latency_sum_ms += actual_latency_ms;
        } else {
            metrics.failed += 1;
        }
        metrics.history.push_back(RouteOutcome {
            route_id: plan.route_id.clone(),
            source: plan.source,
            destination: plan.destination,
            estimated_latency_ms: plan.estimated_latency_ms,
            actual_latency_ms,
            success,
            completed_at: current_timestamp(),
        });
        while metrics.history.len() > limit {
            metrics.history.pop_front();
        }
    }

    /// Metrics snapshot
    pub fn metrics(&self) -> RouterMetrics {
        let metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        let average_latency_ms = if metrics.successful == 0 {
            0.0
        } else {
            metrics.latency_sum_ms as f64 / metrics.successful as f64
        };
        RouterMetrics {
            total_operations: metrics.total,
            successful_operations: metrics.successful,
            failed_operations: metrics.failed,
            average_latency_ms,
            history: metrics.history.iter().cloned().collect(),
        }
    }
}
