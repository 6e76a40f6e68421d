//! # Stage: Router Facade
//!
//! ## Responsibility
//! Turn one [`RouteRequest`] into one [`RouteResponse`]: validate the
//! prompt, estimate complexity and select a starting tier, consult the
//! fingerprint cache, run the cascade, bill the ledger, and emit an audit
//! event.
//!
//! ## Guarantees
//! - Each backend execution is billed exactly once, as soon as its adapter
//!   returns, even if every caller disconnects later in the cascade.
//!   Cache hits and joined waiters report `cost == 0`.
//! - Forced requests bypass both the estimator and the cache.
//! - Failures are never cached; the cascade's attempt log is preserved in
//!   the error.
//!
//! ## NOT Responsible For
//! - Transport (see `web_api`)
//! - Backend wire protocols (see `backend`)

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::audit::{AuditSink, RoutingEvent, TracingAuditSink};
use crate::backend::{AdapterSet, ExecutionResult};
use crate::cache::{fingerprint, CacheOutcome, CacheStats, FingerprintCache};
use crate::cascade::{CascadeController, QualityGate};
use crate::config::RouterConfig;
use crate::ledger::{CostLedger, CostSnapshot};
use crate::routing::{
    ComplexityEstimate, ComplexityEstimator, ComplexityFactors, ModelSelector, RoutingDecision,
};
use crate::{AttemptFailure, RouteRequest, RouterError, Tier};

// ── Response envelope ────────────────────────────────────────────────────

/// How the request was routed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingInfo {
    /// Complexity score; `None` when estimation was bypassed.
    pub complexity: Option<f64>,
    /// Estimator rationale, or why it was bypassed.
    pub reasoning: String,
    /// Per-factor subscores; `None` when estimation was bypassed.
    pub factors: Option<ComplexityFactors>,
    /// Tier the cascade started from.
    pub selected_tier: Tier,
    /// Whether the tier was forced by the caller.
    pub forced: bool,
}

/// Response to a routed request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteResponse {
    /// Request identifier.
    pub request_id: String,
    /// Name of the adapter that produced the response.
    pub backend: String,
    /// Tier that produced the response.
    pub tier: Tier,
    /// Generated text.
    pub response: String,
    /// Incremental cost billed to this request.
    pub cost: f64,
    /// `true` if served from the cache or a shared in-flight computation.
    pub cached: bool,
    /// Routing decision details.
    pub routing: RoutingInfo,
    /// Attempts that failed or were rejected before the served one.
    pub attempts: Vec<AttemptFailure>,
    /// End-to-end latency of this call.
    pub latency_ms: u64,
}

/// Aggregate statistics for `/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    /// Ledger aggregates.
    pub ledger: CostSnapshot,
    /// Cache counters.
    pub cache: CacheStats,
}

/// Liveness of one adapter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendHealth {
    /// Tier served.
    pub tier: Tier,
    /// Adapter name.
    pub backend: String,
    /// Whether the probe succeeded.
    pub live: bool,
}

/// Liveness of every adapter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// `"ok"` if all adapters are live, `"degraded"` if some are, `"down"` if none.
    pub status: &'static str,
    /// Per-adapter results in tier order.
    pub backends: Vec<BackendHealth>,
}

impl HealthReport {
    /// `true` if at least one adapter is live.
    pub fn any_live(&self) -> bool {
        self.backends.iter().any(|b| b.live)
    }
}

// ── Internals ────────────────────────────────────────────────────────────

/// Result of one executed route, shared between single-flight waiters.
#[derive(Debug, Clone)]
struct Routed {
    result: ExecutionResult,
    decision: RoutingDecision,
    estimate: Option<ComplexityEstimate>,
    failures: Vec<AttemptFailure>,
    total_cost: f64,
}

struct Core {
    estimator: ComplexityEstimator,
    selector: ModelSelector,
    cascade: CascadeController,
    ledger: Arc<CostLedger>,
}

impl Core {
    fn decide(
        &self,
        text: &str,
        forced: Option<Tier>,
    ) -> (RoutingDecision, Option<ComplexityEstimate>) {
        match forced {
            Some(tier) => (self.selector.forced(tier), None),
            None => {
                let estimate = self.estimator.estimate(text);
                (self.selector.decide(&estimate), Some(estimate))
            }
        }
    }

    /// Run the cascade for an already-made decision, billing each execution
    /// the moment its adapter returns.
    async fn execute(
        &self,
        text: &str,
        request_id: &str,
        decision: RoutingDecision,
        estimate: Option<ComplexityEstimate>,
    ) -> Result<Routed, RouterError> {
        info!(
            request_id,
            tier = %decision.selected_tier,
            complexity = ?estimate.as_ref().map(|e| e.score),
            forced = decision.forced,
            "routing decision"
        );

        let ledger = &self.ledger;
        let bill = |execution: &ExecutionResult| {
            ledger.record_execution(execution, request_id);
        };
        let outcome = self
            .cascade
            .run(text, decision.selected_tier, decision.forced, &bill)
            .await
            .map_err(|failure| failure.error)?;

        let total_cost = outcome.total_cost();
        Ok(Routed {
            failures: outcome.failures(),
            decision: decision.with_cost(total_cost),
            result: outcome.result,
            estimate,
            total_cost,
        })
    }
}

// ── Router ───────────────────────────────────────────────────────────────

/// The cost-aware router.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
///
/// # Panics
///
/// This type and its methods never panic.
pub struct Router {
    core: Arc<Core>,
    cache: FingerprintCache<Routed>,
    audit: Arc<dyn AuditSink>,
    cache_enabled: bool,
    cache_ttl: Duration,
    max_prompt_chars: usize,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("cascade", &self.core.cascade)
            .field("cache_enabled", &self.cache_enabled)
            .field("cache_ttl", &self.cache_ttl)
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Build a router over `adapters`, billing into `ledger`.
    pub fn new(config: &RouterConfig, adapters: AdapterSet, ledger: Arc<CostLedger>) -> Self {
        Self {
            core: Arc::new(Core {
                estimator: ComplexityEstimator::with_config(config.estimator.clone()),
                selector: ModelSelector::new(config.routing.clone()),
                cascade: CascadeController::new(adapters),
                ledger,
            }),
            cache: FingerprintCache::new(config.cache.max_entries),
            audit: Arc::new(TracingAuditSink),
            cache_enabled: config.cache.enabled,
            cache_ttl: Duration::from_secs(config.cache.cache_ttl_seconds),
            max_prompt_chars: config.routing.max_prompt_chars,
        }
    }

    /// Build a router, its adapters and its ledger from configuration.
    ///
    /// The ledger's savings baseline is the premium tier's price.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Config`] if an adapter cannot be built.
    pub fn from_config(config: &RouterConfig) -> Result<Self, RouterError> {
        let adapters = AdapterSet::from_config(&config.backends)?;
        let ledger = Arc::new(CostLedger::with_premium_baseline(
            config.backends.premium.cost_per_1k_tokens,
        ));
        Ok(Self::new(config, adapters, ledger))
    }

    /// Replace the cascade's quality gate.
    ///
    /// Computations already in flight keep the gate they started with.
    pub fn with_quality_gate(mut self, gate: Arc<dyn QualityGate>) -> Self {
        self.core = Arc::new(Core {
            estimator: self.core.estimator.clone(),
            selector: self.core.selector.clone(),
            cascade: self.core.cascade.clone().with_quality_gate(gate),
            ledger: Arc::clone(&self.core.ledger),
        });
        self
    }

    /// Replace the audit sink.
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    /// The ledger this router bills into.
    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.core.ledger
    }

    /// Spawn the background task that purges expired cache entries.
    pub fn spawn_cache_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        self.cache.spawn_sweeper(interval)
    }

    fn validate(&self, text: &str) -> Result<(), RouterError> {
        if text.trim().is_empty() {
            return Err(RouterError::InvalidInput(
                "prompt must not be empty".to_string(),
            ));
        }
        let chars = text.chars().count();
        if chars > self.max_prompt_chars {
            return Err(RouterError::InvalidInput(format!(
                "prompt is {chars} characters, limit is {}",
                self.max_prompt_chars
            )));
        }
        Ok(())
    }

    /// Estimate complexity without routing.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::InvalidInput`] for empty or oversized prompts.
    pub fn estimate(&self, text: &str) -> Result<ComplexityEstimate, RouterError> {
        self.validate(text)?;
        Ok(self.core.estimator.estimate(text))
    }

    /// Route one request.
    ///
    /// # Errors
    ///
    /// - [`RouterError::InvalidInput`] for empty or oversized prompts, or a
    ///   forced tier with no backend.
    /// - [`RouterError::ExhaustedFailed`] when every tier failed.
    /// - A transient error when a forced request's only tier failed.
    #[instrument(skip_all, fields(request_id = %request.request_id()))]
    pub async fn handle(&self, request: RouteRequest) -> Result<RouteResponse, RouterError> {
        let started = Instant::now();
        self.validate(request.text())?;

        let forced = request.forced_backend();
        let fp = (forced.is_none() && self.cache_enabled).then(|| fingerprint(request.text()));
        let (decision, estimate) = self.core.decide(request.text(), forced);

        let outcome = match &fp {
            Some(key) => {
                let core = Arc::clone(&self.core);
                let text = request.text().to_string();
                let request_id = request.request_id().to_string();
                let (decision, estimate) = (decision.clone(), estimate.clone());
                self.cache
                    .get_or_compute(key, self.cache_ttl, move || async move {
                        core.execute(&text, &request_id, decision, estimate).await
                    })
                    .await
            }
            None => self
                .core
                .execute(
                    request.text(),
                    request.request_id(),
                    decision.clone(),
                    estimate.clone(),
                )
                .await
                .map(|routed| (routed, CacheOutcome::Computed)),
        };

        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match outcome {
            Ok((routed, cache_outcome)) => {
                let cached = cache_outcome.is_shared();
                if cached {
                    debug!(outcome = ?cache_outcome, "served from shared result");
                }
                let response = RouteResponse {
                    request_id: request.request_id().to_string(),
                    backend: routed.result.backend.clone(),
                    tier: routed.result.backend_tier,
                    response: routed.result.response_text.clone(),
                    cost: if cached { 0.0 } else { routed.total_cost },
                    cached,
                    routing: RoutingInfo {
                        complexity: routed.estimate.as_ref().map(|e| e.score),
                        reasoning: routed.decision.reasoning.clone(),
                        factors: routed.estimate.as_ref().map(|e| e.factors),
                        selected_tier: routed.decision.selected_tier,
                        forced: routed.decision.forced,
                    },
                    attempts: if cached { Vec::new() } else { routed.failures },
                    latency_ms,
                };
                self.audit
                    .record(&RoutingEvent {
                        request_id: response.request_id.clone(),
                        fingerprint: fp,
                        selected_tier: response.routing.selected_tier,
                        final_tier: Some(response.tier),
                        complexity: response.routing.complexity,
                        cached,
                        forced: response.routing.forced,
                        failures: response.attempts.clone(),
                        cost: response.cost,
                        error: None,
                        latency_ms,
                        timestamp: Utc::now(),
                    })
                    .await;
                Ok(response)
            }
            Err(error) => {
                let failures = match &error {
                    RouterError::ExhaustedFailed { attempts } => attempts.clone(),
                    _ => Vec::new(),
                };
                self.audit
                    .record(&RoutingEvent {
                        request_id: request.request_id().to_string(),
                        fingerprint: fp,
                        selected_tier: decision.selected_tier,
                        final_tier: None,
                        complexity: estimate.as_ref().map(|e| e.score),
                        cached: false,
                        forced: decision.forced,
                        failures,
                        cost: 0.0,
                        error: Some(error.kind().to_string()),
                        latency_ms,
                        timestamp: Utc::now(),
                    })
                    .await;
                Err(error)
            }
        }
    }

    /// Ledger and cache aggregates.
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            ledger: self.core.ledger.snapshot(),
            cache: self.cache.stats(),
        }
    }

    /// Probe every adapter concurrently.
    pub async fn health(&self) -> HealthReport {
        let adapters: Vec<_> = self.core.cascade.adapters().iter().collect();
        let live = join_all(adapters.iter().map(|a| a.health())).await;
        let backends: Vec<BackendHealth> = adapters
            .iter()
            .zip(live)
            .map(|(a, live)| BackendHealth {
                tier: a.tier(),
                backend: a.name().to_string(),
                live,
            })
            .collect();
        let up = backends.iter().filter(|b| b.live).count();
        let status = if up == backends.len() && up > 0 {
            "ok"
        } else if up > 0 {
            "degraded"
        } else {
            "down"
        };
        HealthReport { status, backends }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::backend::{BackendAdapter, EchoBackend, EchoMode, ErrorKind};

    fn adapters_with(cheap: EchoMode, mid: EchoMode, premium: EchoMode) -> AdapterSet {
        let mk = |tier: Tier, mode: EchoMode, rate: f64| {
            BackendAdapter::new(
                tier,
                Arc::new(EchoBackend::new(format!("{tier}-echo")).with_mode(mode)),
                Duration::from_millis(500),
            )
            .with_cost_per_1k_tokens(rate)
        };
        AdapterSet::new()
            .with(mk(Tier::Cheap, cheap, 0.0))
            .with(mk(Tier::Mid, mid, 1.0))
            .with(mk(Tier::Premium, premium, 10.0))
    }

    fn adapters(cheap: EchoMode) -> AdapterSet {
        adapters_with(cheap, EchoMode::Echo, EchoMode::Echo)
    }

    /// Cheap fails, mid succeeds but is rejected by the gate, premium hangs.
    fn stalls_after_billing_mid(config: &RouterConfig) -> Router {
        let gate = |_: &str, r: &ExecutionResult| r.backend_tier != Tier::Mid;
        Router::new(
            config,
            adapters_with(
                EchoMode::Fail(ErrorKind::Unavailable),
                EchoMode::Echo,
                EchoMode::Hang,
            ),
            Arc::new(CostLedger::new()),
        )
        .with_quality_gate(Arc::new(gate))
    }

    fn router(cheap: EchoMode) -> Router {
        Router::new(
            &RouterConfig::default(),
            adapters(cheap),
            Arc::new(CostLedger::new()),
        )
    }

    #[tokio::test]
    async fn test_empty_prompt_is_invalid_input() {
        let r = router(EchoMode::Echo);
        let err = r.handle(RouteRequest::new("   ")).await.unwrap_err();
        assert!(matches!(err, RouterError::InvalidInput(_)));
        assert!(r.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_prompt_is_invalid_input() {
        let mut config = RouterConfig::default();
        config.routing.max_prompt_chars = 10;
        let r = Router::new(&config, adapters(EchoMode::Echo), Arc::new(CostLedger::new()));
        let err = r.handle(RouteRequest::new("x".repeat(11))).await.unwrap_err();
        assert!(matches!(err, RouterError::InvalidInput(_)));
        assert!(r.estimate(&"x".repeat(11)).is_err());
    }

    #[tokio::test]
    async fn test_simple_prompt_served_by_cheap_tier() {
        let r = router(EchoMode::Echo);
        let resp = r.handle(RouteRequest::new("What is Python?")).await.unwrap();
        assert_eq!(resp.tier, Tier::Cheap);
        assert_eq!(resp.response, "What is Python?");
        assert_eq!(resp.routing.complexity, Some(0.0));
        assert!(!resp.cached);
        assert!(resp.attempts.is_empty());
        assert_eq!(r.ledger().len(), 1);
    }

    #[tokio::test]
    async fn test_repeat_is_cached_with_zero_cost() {
        let r = router(EchoMode::Fail(ErrorKind::Unavailable));
        let first = r.handle(RouteRequest::new("hello there")).await.unwrap();
        assert_eq!(first.tier, Tier::Mid);
        assert!(first.cost > 0.0);
        assert_eq!(first.attempts.len(), 1);
        let records = r.ledger().len();

        let second = r.handle(RouteRequest::new("Hello   there")).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.cost, 0.0);
        assert_eq!(second.response, first.response);
        assert_eq!(r.ledger().len(), records);
    }

    #[tokio::test]
    async fn test_forced_bypasses_estimator_and_cache() {
        let r = router(EchoMode::Echo);
        let req = || RouteRequest::new("What is Python?").with_forced_backend(Tier::Premium);
        let a = r.handle(req()).await.unwrap();
        let b = r.handle(req()).await.unwrap();
        assert_eq!(a.tier, Tier::Premium);
        assert!(a.routing.forced);
        assert!(a.routing.complexity.is_none());
        assert!(!b.cached);
        assert!(b.cost > 0.0);
        assert_eq!(r.ledger().len(), 2);
        assert_eq!(r.stats().cache.entries, 0);
    }

    #[tokio::test]
    async fn test_cache_disabled_executes_every_time() {
        let mut config = RouterConfig::default();
        config.cache.enabled = false;
        let r = Router::new(&config, adapters(EchoMode::Echo), Arc::new(CostLedger::new()));
        r.handle(RouteRequest::new("same")).await.unwrap();
        let second = r.handle(RouteRequest::new("same")).await.unwrap();
        assert!(!second.cached);
        assert_eq!(r.ledger().len(), 2);
    }

    #[tokio::test]
    async fn test_audit_sink_receives_event() {
        let sink = Arc::new(MemoryAuditSink::new());
        let r = router(EchoMode::Echo).with_audit_sink(sink.clone());
        r.handle(RouteRequest::new("hi").with_request_id("req-7"))
            .await
            .unwrap();
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].request_id, "req-7");
        assert_eq!(events[0].final_tier, Some(Tier::Cheap));
    }

    #[tokio::test]
    async fn test_health_reports_degraded() {
        let r = router(EchoMode::Fail(ErrorKind::Unavailable));
        let h = r.health().await;
        assert_eq!(h.status, "degraded");
        assert!(h.any_live());
        assert_eq!(h.backends.len(), 3);
        assert!(!h.backends[0].live);
    }

    #[tokio::test]
    async fn test_with_quality_gate_escalates() {
        let gate = |_: &str, r: &ExecutionResult| r.backend_tier == Tier::Premium;
        let r = router(EchoMode::Echo).with_quality_gate(Arc::new(gate));
        let resp = r.handle(RouteRequest::new("quick one")).await.unwrap();
        assert_eq!(resp.tier, Tier::Premium);
        assert_eq!(resp.attempts.len(), 2);
        assert_eq!(resp.attempts[0].kind, ErrorKind::QualityRejected);
    }

    #[tokio::test]
    async fn test_with_quality_gate_applies_while_core_is_shared() {
        let r = router(EchoMode::Echo);
        let _held = Arc::clone(&r.core);
        let gate = |_: &str, r: &ExecutionResult| r.backend_tier == Tier::Premium;
        let r = r.with_quality_gate(Arc::new(gate));
        let resp = r.handle(RouteRequest::new("quick one")).await.unwrap();
        assert_eq!(resp.tier, Tier::Premium);
    }

    #[tokio::test]
    async fn test_dropped_request_keeps_billed_attempt_cached_path() {
        let r = stalls_after_billing_mid(&RouterConfig::default());
        let call = r.handle(RouteRequest::new("hello there").with_request_id("gone"));
        assert!(tokio::time::timeout(Duration::from_millis(100), call)
            .await
            .is_err());

        let records = r.ledger().records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].backend_tier, Tier::Mid);
        assert_eq!(records[0].request_id, "gone");
        assert!(records[0].cost > 0.0);
    }

    #[tokio::test]
    async fn test_dropped_request_keeps_billed_attempt_uncached_path() {
        let mut config = RouterConfig::default();
        config.cache.enabled = false;
        let r = stalls_after_billing_mid(&config);
        let call = r.handle(RouteRequest::new("hello there"));
        assert!(tokio::time::timeout(Duration::from_millis(100), call)
            .await
            .is_err());

        assert_eq!(r.ledger().len(), 1);
        assert_eq!(r.ledger().records()[0].backend_tier, Tier::Mid);
    }

    #[tokio::test]
    async fn test_failed_route_audits_the_decision_made() {
        let mut config = RouterConfig::default();
        config.routing.force_premium_only = true;
        let sink = Arc::new(MemoryAuditSink::new());
        let fail = || EchoMode::Fail(ErrorKind::Unavailable);
        let r = Router::new(
            &config,
            adapters_with(fail(), fail(), fail()),
            Arc::new(CostLedger::new()),
        )
        .with_audit_sink(sink.clone());

        assert!(r.handle(RouteRequest::new("What is Python?")).await.is_err());

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].selected_tier, Tier::Premium);
        assert_eq!(events[0].complexity, Some(0.0));
        assert!(!events[0].forced);
        assert_eq!(events[0].final_tier, None);
        assert_eq!(events[0].error.as_deref(), Some("exhausted_failed"));
    }

    #[tokio::test]
    async fn test_failed_forced_route_audits_forced_tier() {
        let sink = Arc::new(MemoryAuditSink::new());
        let r = Router::new(
            &RouterConfig::default(),
            adapters_with(EchoMode::Echo, EchoMode::Fail(ErrorKind::Timeout), EchoMode::Echo),
            Arc::new(CostLedger::new()),
        )
        .with_audit_sink(sink.clone());

        let err = r
            .handle(RouteRequest::new("hello").with_forced_backend(Tier::Mid))
            .await
            .unwrap_err();
        assert_eq!(err, RouterError::BackendTimeout { tier: Tier::Mid });

        let events = sink.events();
        assert_eq!(events[0].selected_tier, Tier::Mid);
        assert!(events[0].forced);
        assert!(events[0].complexity.is_none());
    }
}
