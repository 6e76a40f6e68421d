//! Backend abstraction and adapters.
//!
//! A [`Backend`] is anything that can turn a prompt into a completion: a
//! local llama.cpp server, an OpenAI-compatible endpoint, the Anthropic
//! API, or the in-process [`EchoBackend`] used for tests and demos.
//!
//! A [`BackendAdapter`] binds a backend to a [`Tier`], a timeout and a
//! per-token price, and exposes the uniform [`BackendAdapter::execute`]
//! contract: it never returns an error. Failures come back as an
//! [`ExecutionResult`] with `succeeded == false` and a classified
//! [`ErrorKind`].

pub mod echo;
pub mod http;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{BackendKind, BackendsConfig, TierBackendConfig};
use crate::{metrics, RouterError, Tier};

pub use echo::{EchoBackend, EchoMode};
pub use http::{AnthropicBackend, LlamaCppBackend, OpenAiCompatBackend};

/// Classified failure reason reported by an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No answer within the configured timeout.
    Timeout,
    /// Connection failure or server-side error.
    Unavailable,
    /// Rate limit or quota rejection.
    QuotaExceeded,
    /// The backend answered with something unusable.
    InvalidResponse,
    /// A quality gate judged the output inadequate.
    QualityRejected,
}

impl ErrorKind {
    /// Stable label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::InvalidResponse => "invalid_response",
            ErrorKind::QualityRejected => "quality_rejected",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors a [`Backend`] implementation may return.
///
/// Messages must not contain credentials or prompt text.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    /// The call timed out.
    #[error("timed out")]
    Timeout,
    /// The backend is unreachable or failing.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// The backend rejected the call for quota reasons.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    /// The response could not be used.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    /// Map to the adapter-level [`ErrorKind`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::Timeout => ErrorKind::Timeout,
            BackendError::Unavailable(_) => ErrorKind::Unavailable,
            BackendError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            BackendError::InvalidResponse(_) => ErrorKind::InvalidResponse,
        }
    }
}

/// Raw output of a backend call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Completion {
    /// Generated text.
    pub text: String,
    /// Prompt tokens reported by the backend, if any.
    pub prompt_tokens: Option<u64>,
    /// Completion tokens reported by the backend, if any.
    pub completion_tokens: Option<u64>,
}

impl Completion {
    /// A completion with no usage information.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Total tokens billed for this call, falling back to whitespace word
    /// counts when the backend did not report usage.
    pub fn billed_tokens(&self, prompt: &str) -> u64 {
        let prompt_tokens = self
            .prompt_tokens
            .unwrap_or_else(|| prompt.split_whitespace().count() as u64);
        let completion_tokens = self
            .completion_tokens
            .unwrap_or_else(|| self.text.split_whitespace().count() as u64);
        prompt_tokens + completion_tokens
    }
}

/// Trait for inference backends.
///
/// Implementations must be thread-safe (`Send + Sync`) for use across tasks.
/// The trait is object-safe to allow dynamic dispatch via `Arc<dyn Backend>`.
/// Implementations need not enforce timeouts; [`BackendAdapter`] does.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name used in logs, metrics and error details.
    fn name(&self) -> &str;

    /// Produce a completion for `prompt`.
    async fn complete(&self, prompt: &str) -> Result<Completion, BackendError>;

    /// Liveness probe. Defaults to `true` for backends without one.
    async fn health(&self) -> bool {
        true
    }
}

/// Outcome of one adapter invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// Tier that served (or failed) the call.
    pub backend_tier: Tier,
    /// Adapter name.
    pub backend: String,
    /// Generated text; empty on failure.
    pub response_text: String,
    /// Billed cost in USD, always `>= 0`.
    pub actual_cost: f64,
    /// Wall-clock duration of the attempt.
    pub latency: Duration,
    /// Whether the call produced a usable completion.
    pub succeeded: bool,
    /// Classified failure reason when `succeeded` is false.
    pub error_kind: Option<ErrorKind>,
    /// Sanitized failure detail when `succeeded` is false.
    pub error_message: Option<String>,
    /// Tokens billed for the call.
    pub tokens: u64,
}

impl ExecutionResult {
    /// Latency in whole milliseconds.
    pub fn latency_ms(&self) -> u64 {
        u64::try_from(self.latency.as_millis()).unwrap_or(u64::MAX)
    }

    /// Convert a failed result into the matching transient [`RouterError`].
    ///
    /// Returns `None` for successful results.
    pub fn to_error(&self) -> Option<RouterError> {
        let kind = self.error_kind?;
        Some(match kind {
            ErrorKind::Timeout => RouterError::BackendTimeout {
                tier: self.backend_tier,
            },
            ErrorKind::QuotaExceeded => RouterError::QuotaExceeded {
                tier: self.backend_tier,
            },
            ErrorKind::Unavailable | ErrorKind::InvalidResponse | ErrorKind::QualityRejected => {
                RouterError::BackendUnavailable {
                    tier: self.backend_tier,
                    reason: self
                        .error_message
                        .clone()
                        .unwrap_or_else(|| kind.to_string()),
                }
            }
        })
    }
}

/// A [`Backend`] bound to a tier, a timeout, and a price.
///
/// Cloning is cheap; the backend is shared.
#[derive(Clone)]
pub struct BackendAdapter {
    tier: Tier,
    backend: Arc<dyn Backend>,
    timeout: Duration,
    cost_per_1k_tokens: f64,
}

impl fmt::Debug for BackendAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendAdapter")
            .field("tier", &self.tier)
            .field("backend", &self.backend.name())
            .field("timeout", &self.timeout)
            .field("cost_per_1k_tokens", &self.cost_per_1k_tokens)
            .finish()
    }
}

impl BackendAdapter {
    /// Bind `backend` to `tier` with the given timeout. Unmetered by default.
    pub fn new(tier: Tier, backend: Arc<dyn Backend>, timeout: Duration) -> Self {
        Self {
            tier,
            backend,
            timeout,
            cost_per_1k_tokens: 0.0,
        }
    }

    /// Set the USD price per 1 000 billed tokens. Negative rates are clamped to zero.
    pub fn with_cost_per_1k_tokens(mut self, rate: f64) -> Self {
        self.cost_per_1k_tokens = rate.max(0.0);
        self
    }

    /// Tier this adapter serves.
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Backend name.
    pub fn name(&self) -> &str {
        self.backend.name()
    }

    /// Configured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// USD price per 1 000 tokens.
    pub fn cost_per_1k_tokens(&self) -> f64 {
        self.cost_per_1k_tokens
    }

    /// Run the backend under the adapter timeout.
    ///
    /// On timeout the backend future is dropped, which cancels any
    /// in-flight HTTP request and releases its connection.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn execute(&self, prompt: &str) -> ExecutionResult {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.backend.complete(prompt)).await;
        let latency = started.elapsed();
        metrics::record_backend_latency(self.tier, latency);

        let outcome = match outcome {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout),
        };

        match outcome {
            Ok(completion) => {
                let tokens = completion.billed_tokens(prompt);
                let actual_cost = tokens as f64 / 1000.0 * self.cost_per_1k_tokens;
                debug!(
                    tier = %self.tier,
                    backend = self.name(),
                    tokens,
                    cost = actual_cost,
                    latency_ms = latency.as_millis() as u64,
                    "backend call succeeded"
                );
                ExecutionResult {
                    backend_tier: self.tier,
                    backend: self.name().to_string(),
                    response_text: completion.text,
                    actual_cost,
                    latency,
                    succeeded: true,
                    error_kind: None,
                    error_message: None,
                    tokens,
                }
            }
            Err(e) => {
                let kind = e.kind();
                warn!(
                    tier = %self.tier,
                    backend = self.name(),
                    kind = %kind,
                    error = %e,
                    latency_ms = latency.as_millis() as u64,
                    "backend call failed"
                );
                metrics::inc_backend_error(self.tier, kind);
                ExecutionResult {
                    backend_tier: self.tier,
                    backend: self.name().to_string(),
                    response_text: String::new(),
                    actual_cost: 0.0,
                    latency,
                    succeeded: false,
                    error_kind: Some(kind),
                    error_message: Some(e.to_string()),
                    tokens: 0,
                }
            }
        }
    }

    /// Liveness probe bounded by the adapter timeout.
    pub async fn health(&self) -> bool {
        tokio::time::timeout(self.timeout, self.backend.health())
            .await
            .unwrap_or(false)
    }
}

/// One adapter per tier.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Default)]
pub struct AdapterSet {
    adapters: BTreeMap<Tier, BackendAdapter>,
}

impl AdapterSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the adapter for its tier.
    pub fn insert(&mut self, adapter: BackendAdapter) {
        self.adapters.insert(adapter.tier(), adapter);
    }

    /// Builder form of [`AdapterSet::insert`].
    pub fn with(mut self, adapter: BackendAdapter) -> Self {
        self.insert(adapter);
        self
    }

    /// Adapter for `tier`, if registered.
    pub fn get(&self, tier: Tier) -> Option<&BackendAdapter> {
        self.adapters.get(&tier)
    }

    /// Registered adapters in tier order.
    pub fn iter(&self) -> impl Iterator<Item = &BackendAdapter> {
        self.adapters.values()
    }

    /// Number of registered tiers.
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// `true` if no adapter is registered.
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Build adapters from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Config`] if a metered backend's API key
    /// variable is unset, or if no tier is enabled.
    pub fn from_config(config: &BackendsConfig) -> Result<Self, RouterError> {
        let timeout = Duration::from_millis(config.per_tier_timeout_ms);
        let mut set = Self::new();
        for (tier, tier_cfg) in config.tiers() {
            if !tier_cfg.enabled {
                continue;
            }
            let backend = build_backend(tier_cfg)?;
            set.insert(
                BackendAdapter::new(tier, backend, timeout)
                    .with_cost_per_1k_tokens(tier_cfg.cost_per_1k_tokens),
            );
        }
        if set.is_empty() {
            return Err(RouterError::Config(
                "no backend tier is enabled".to_string(),
            ));
        }
        Ok(set)
    }
}

fn build_backend(cfg: &TierBackendConfig) -> Result<Arc<dyn Backend>, RouterError> {
    let backend: Arc<dyn Backend> = match cfg.kind {
        BackendKind::LlamaCpp => {
            let mut b = LlamaCppBackend::new().with_max_tokens(cfg.max_tokens);
            if let Some(url) = &cfg.url {
                b = b.with_base_url(url);
            }
            Arc::new(b)
        }
        BackendKind::OpenAi => {
            let env = cfg.api_key_env.as_deref().unwrap_or("OPENAI_API_KEY");
            let mut b = OpenAiCompatBackend::from_env(cfg.model.clone(), env)?
                .with_max_tokens(cfg.max_tokens);
            if let Some(url) = &cfg.url {
                b = b.with_base_url(url);
            }
            Arc::new(b)
        }
        BackendKind::Anthropic => {
            let env = cfg.api_key_env.as_deref().unwrap_or("ANTHROPIC_API_KEY");
            let mut b = AnthropicBackend::from_env(cfg.model.clone(), env)?
                .with_max_tokens(cfg.max_tokens);
            if let Some(url) = &cfg.url {
                b = b.with_base_url(url);
            }
            Arc::new(b)
        }
        BackendKind::Echo => Arc::new(EchoBackend::new(cfg.model.clone())),
    };
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(backend: EchoBackend, timeout_ms: u64) -> BackendAdapter {
        BackendAdapter::new(Tier::Cheap, Arc::new(backend), Duration::from_millis(timeout_ms))
    }

    #[tokio::test]
    async fn test_execute_success_reports_zero_cost_when_unmetered() {
        let a = adapter(EchoBackend::new("echo"), 1_000);
        let r = a.execute("hello world").await;
        assert!(r.succeeded);
        assert_eq!(r.response_text, "hello world");
        assert_eq!(r.actual_cost, 0.0);
        assert_eq!(r.backend_tier, Tier::Cheap);
        assert!(r.error_kind.is_none());
    }

    #[tokio::test]
    async fn test_execute_meters_tokens() {
        let a = BackendAdapter::new(
            Tier::Premium,
            Arc::new(EchoBackend::new("echo")),
            Duration::from_secs(1),
        )
        .with_cost_per_1k_tokens(10.0);
        // 2 prompt words + 2 echoed words = 4 tokens
        let r = a.execute("two words").await;
        assert_eq!(r.tokens, 4);
        assert!((r.actual_cost - 0.04).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_execute_timeout_is_classified_not_thrown() {
        let backend = EchoBackend::new("slow").with_mode(EchoMode::Hang);
        let a = adapter(backend, 20);
        let r = a.execute("anything").await;
        assert!(!r.succeeded);
        assert_eq!(r.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(r.actual_cost, 0.0);
        assert!(matches!(
            r.to_error(),
            Some(RouterError::BackendTimeout { tier: Tier::Cheap })
        ));
    }

    #[tokio::test]
    async fn test_execute_timeout_drops_backend_future() {
        let backend = Arc::new(EchoBackend::new("slow").with_mode(EchoMode::Hang));
        let a = BackendAdapter::new(Tier::Mid, backend.clone(), Duration::from_millis(20));
        let _ = a.execute("x").await;
        assert_eq!(backend.calls(), 1);
        assert_eq!(backend.in_flight(), 0, "timed-out call must be released");
    }

    #[tokio::test]
    async fn test_execute_failure_carries_kind_and_message() {
        let backend = EchoBackend::new("down").with_mode(EchoMode::Fail(ErrorKind::QuotaExceeded));
        let r = adapter(backend, 1_000).execute("x").await;
        assert_eq!(r.error_kind, Some(ErrorKind::QuotaExceeded));
        assert!(r.error_message.is_some());
        assert!(matches!(r.to_error(), Some(RouterError::QuotaExceeded { .. })));
    }

    #[test]
    fn test_negative_rate_clamped() {
        let a = adapter(EchoBackend::new("e"), 10).with_cost_per_1k_tokens(-1.0);
        assert_eq!(a.cost_per_1k_tokens(), 0.0);
    }

    #[test]
    fn test_completion_prefers_reported_usage() {
        let c = Completion {
            text: "a b c".into(),
            prompt_tokens: Some(10),
            completion_tokens: Some(20),
        };
        assert_eq!(c.billed_tokens("ignored prompt"), 30);
        assert_eq!(Completion::text("a b c").billed_tokens("x y"), 5);
    }

    #[tokio::test]
    async fn test_health_times_out_to_false() {
        let backend = EchoBackend::new("h").with_mode(EchoMode::Hang);
        assert!(!adapter(backend, 20).health().await);
        assert!(adapter(EchoBackend::new("ok"), 20).health().await);
    }

    #[test]
    fn test_adapter_set_orders_by_tier() {
        let set = AdapterSet::new()
            .with(BackendAdapter::new(
                Tier::Premium,
                Arc::new(EchoBackend::new("p")),
                Duration::from_secs(1),
            ))
            .with(adapter(EchoBackend::new("c"), 10));
        let tiers: Vec<_> = set.iter().map(|a| a.tier()).collect();
        assert_eq!(tiers, vec![Tier::Cheap, Tier::Premium]);
        assert!(set.get(Tier::Mid).is_none());
    }

    #[test]
    fn test_from_config_echo_backends() {
        let mut cfg = BackendsConfig::default();
        for t in [&mut cfg.cheap, &mut cfg.mid, &mut cfg.premium] {
            t.kind = BackendKind::Echo;
        }
        let set = AdapterSet::from_config(&cfg).unwrap();
        assert_eq!(set.len(), 3);
        let premium = set.get(Tier::Premium).unwrap();
        assert!(premium.cost_per_1k_tokens() > 0.0);
        assert_eq!(
            premium.timeout(),
            Duration::from_millis(cfg.per_tier_timeout_ms)
        );
    }

    #[test]
    fn test_from_config_all_disabled_is_config_error() {
        let mut cfg = BackendsConfig::default();
        for t in [&mut cfg.cheap, &mut cfg.mid, &mut cfg.premium] {
            t.enabled = false;
        }
        assert!(matches!(
            AdapterSet::from_config(&cfg),
            Err(RouterError::Config(_))
        ));
    }
}
