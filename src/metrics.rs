//! Prometheus metrics for the router.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The helper functions
//! (`inc_request`, `record_backend_latency`, …) are no-ops if `init_metrics`
//! was never called, so library users and tests can route requests without
//! a registry: observability simply degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `router_requests_total` | Counter | `tier` |
//! | `router_escalations_total` | Counter | `from`, `to` |
//! | `router_cache_events_total` | Counter | `outcome` |
//! | `router_backend_errors_total` | Counter | `tier`, `kind` |
//! | `router_backend_latency_seconds` | Histogram | `tier` |
//! | `router_cost_micro_usd_total` | Counter | |

use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    core::Collector, CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
    TextEncoder,
};

use crate::backend::ErrorKind;
use crate::{RouterError, Tier};

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All router metrics, bundled so they can be stored in a single
/// [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Registry that owns all metric descriptors.
    pub registry: Registry,
    /// Backend attempts per tier.
    pub requests_total: CounterVec,
    /// Tier escalations.
    pub escalations_total: CounterVec,
    /// Cache hits, joins and misses.
    pub cache_events_total: CounterVec,
    /// Backend failures by tier and kind.
    pub backend_errors_total: CounterVec,
    /// Backend call latency per tier.
    pub backend_latency: HistogramVec,
    /// Billed spend in micro-dollars.
    pub cost_micro_usd: IntCounter,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn register<C: Collector + Clone + 'static>(registry: &Registry, c: C) -> Result<C, RouterError> {
    registry
        .register(Box::new(c.clone()))
        .map_err(|e| RouterError::Internal(format!("metrics registration failed: {e}")))?;
    Ok(c)
}

fn build(registry: Registry) -> Result<Metrics, RouterError> {
    let init = |e: prometheus::Error| RouterError::Internal(format!("metrics init failed: {e}"));

    let requests_total = register(
        &registry,
        CounterVec::new(
            Opts::new("router_requests_total", "Backend attempts per tier"),
            &["tier"],
        )
        .map_err(init)?,
    )?;
    let escalations_total = register(
        &registry,
        CounterVec::new(
            Opts::new("router_escalations_total", "Tier escalations"),
            &["from", "to"],
        )
        .map_err(init)?,
    )?;
    let cache_events_total = register(
        &registry,
        CounterVec::new(
            Opts::new("router_cache_events_total", "Fingerprint cache outcomes"),
            &["outcome"],
        )
        .map_err(init)?,
    )?;
    let backend_errors_total = register(
        &registry,
        CounterVec::new(
            Opts::new("router_backend_errors_total", "Backend failures by tier and kind"),
            &["tier", "kind"],
        )
        .map_err(init)?,
    )?;
    let backend_latency = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                "router_backend_latency_seconds",
                "Backend call latency per tier",
            ),
            &["tier"],
        )
        .map_err(init)?,
    )?;
    let cost_micro_usd = register(
        &registry,
        IntCounter::new("router_cost_micro_usd_total", "Billed spend in micro-dollars")
            .map_err(init)?,
    )?;

    Ok(Metrics {
        registry,
        requests_total,
        escalations_total,
        cache_events_total,
        backend_errors_total,
        backend_latency,
        cost_micro_usd,
    })
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`RouterError::Internal`] if metric construction or registration
/// fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), RouterError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let bundle = build(Registry::new())?;
    // A racing initialiser produces identical descriptors; first one wins.
    let _ = METRICS.set(bundle);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count one backend attempt on `tier`.
///
/// # Panics
///
/// This function never panics.
pub fn inc_request(tier: Tier) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.requests_total.get_metric_with_label_values(&[tier.as_str()]) {
            c.inc();
        }
    }
}

/// Count an escalation from one tier to the next.
///
/// # Panics
///
/// This function never panics.
pub fn inc_escalation(from: Tier, to: Tier) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .escalations_total
            .get_metric_with_label_values(&[from.as_str(), to.as_str()])
        {
            c.inc();
        }
    }
}

/// Count a cache outcome (`hit`, `joined` or `miss`).
///
/// # Panics
///
/// This function never panics.
pub fn inc_cache_event(outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.cache_events_total.get_metric_with_label_values(&[outcome]) {
            c.inc();
        }
    }
}

/// Count a backend failure.
///
/// # Panics
///
/// This function never panics.
pub fn inc_backend_error(tier: Tier, kind: ErrorKind) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .backend_errors_total
            .get_metric_with_label_values(&[tier.as_str(), kind.as_str()])
        {
            c.inc();
        }
    }
}

/// Observe one backend call latency.
///
/// # Panics
///
/// This function never panics.
pub fn record_backend_latency(tier: Tier, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.backend_latency.get_metric_with_label_values(&[tier.as_str()]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Add billed spend. Non-positive amounts are ignored.
///
/// # Panics
///
/// This function never panics.
pub fn add_cost(usd: f64) {
    if let Some(m) = metrics() {
        if usd.is_finite() && usd > 0.0 {
            m.cost_micro_usd.inc_by((usd * 1_000_000.0).round() as u64);
        }
    }
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    let families = m.registry.gather();
    let mut buffer = Vec::new();
    if TextEncoder::new().encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok(), "second call must be a no-op");
    }

    #[test]
    fn test_helpers_never_panic() {
        inc_request(Tier::Cheap);
        inc_escalation(Tier::Cheap, Tier::Mid);
        inc_cache_event("hit");
        inc_backend_error(Tier::Premium, ErrorKind::Timeout);
        record_backend_latency(Tier::Mid, Duration::from_millis(5));
        add_cost(0.25);
        add_cost(f64::NAN);
    }

    #[test]
    fn test_local_bundle_counts_exactly() {
        // The global registry cannot be reset between tests, so exact counts
        // are checked on a private bundle.
        let m = build(Registry::new()).unwrap();
        m.requests_total.with_label_values(&["cheap"]).inc();
        m.requests_total.with_label_values(&["cheap"]).inc();
        m.cost_micro_usd.inc_by(1_500);
        assert_eq!(m.requests_total.with_label_values(&["cheap"]).get(), 2.0);
        assert_eq!(m.cost_micro_usd.get(), 1_500);
    }

    #[test]
    fn test_gather_metrics_contains_router_families() {
        init_metrics().unwrap();
        inc_request(Tier::Premium);
        let text = gather_metrics();
        assert!(text.contains("router_requests_total"));
    }
}
