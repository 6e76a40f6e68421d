//! Audit trail for routing decisions.
//!
//! After every handled request the router emits one [`RoutingEvent`] to its
//! [`AuditSink`]. The default sink writes a structured `tracing` event;
//! deployments that need a durable trail plug in their own sink.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{AttemptFailure, Tier};

/// One handled request, as seen by the audit trail.
///
/// Never contains prompt text; the fingerprint identifies the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingEvent {
    /// Request identifier.
    pub request_id: String,
    /// Normalized prompt fingerprint; `None` for forced requests.
    pub fingerprint: Option<String>,
    /// Tier the selector chose.
    pub selected_tier: Tier,
    /// Tier that served the response, if any.
    pub final_tier: Option<Tier>,
    /// Complexity score; `None` when estimation was bypassed.
    pub complexity: Option<f64>,
    /// Whether the response came from the cache.
    pub cached: bool,
    /// Whether the tier was forced.
    pub forced: bool,
    /// Failed or rejected attempts, in order.
    pub failures: Vec<AttemptFailure>,
    /// Incremental cost billed for this request.
    pub cost: f64,
    /// Error kind when the request failed.
    pub error: Option<String>,
    /// End-to-end latency.
    pub latency_ms: u64,
    /// When the request finished.
    pub timestamp: DateTime<Utc>,
}

/// Receiver of routing events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Record one event. Must not fail the request.
    async fn record(&self, event: &RoutingEvent);
}

/// Emits each event as a structured `tracing` record at `info` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &RoutingEvent) {
        info!(
            target: "audit",
            request_id = %event.request_id,
            selected_tier = %event.selected_tier,
            final_tier = ?event.final_tier,
            complexity = ?event.complexity,
            cached = event.cached,
            forced = event.forced,
            failures = event.failures.len(),
            cost = event.cost,
            error = ?event.error,
            latency_ms = event.latency_ms,
            "request routed"
        );
    }
}

/// Keeps events in memory. Intended for tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<RoutingEvent>>,
}

impl MemoryAuditSink {
    /// An empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// A clone of every recorded event.
    pub fn events(&self) -> Vec<RoutingEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: &RoutingEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> RoutingEvent {
        RoutingEvent {
            request_id: "r1".into(),
            fingerprint: Some("abc".into()),
            selected_tier: Tier::Cheap,
            final_tier: Some(Tier::Cheap),
            complexity: Some(0.1),
            cached: false,
            forced: false,
            failures: vec![],
            cost: 0.0,
            error: None,
            latency_ms: 3,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_sink_collects_events() {
        let sink = MemoryAuditSink::new();
        sink.record(&event()).await;
        sink.record(&event()).await;
        assert_eq!(sink.events().len(), 2);
    }

    #[tokio::test]
    async fn test_tracing_sink_does_not_panic() {
        TracingAuditSink.record(&event()).await;
    }

    #[test]
    fn test_event_serializes_tiers_lowercase() {
        let json = serde_json::to_value(event()).unwrap();
        assert_eq!(json["selected_tier"], "cheap");
    }
}
