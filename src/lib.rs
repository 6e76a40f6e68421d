//! # tokio-cost-router
//!
//! A cost-aware request router for LLM inference over Tokio.
//!
//! ## Architecture
//!
//! Each request flows through a fixed sequence of components:
//! ```text
//! RouteRequest → FingerprintCache ─hit→ response
//!                      │ miss
//!                      ▼
//!              ComplexityEstimator → ModelSelector → Cascade(cheap → mid → premium)
//!                                                        │
//!                                              BackendAdapter(s) → CostLedger
//! ```
//!
//! The cheapest tier able to answer is tried first; transient failures
//! escalate one tier at a time towards premium.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod audit;
pub mod backend;
pub mod cache;
pub mod cascade;
pub mod config;
pub mod ledger;
pub mod metrics;
pub mod router;
pub mod routing;

#[cfg(feature = "web-api")]
pub mod web_api;

// Re-exports for convenience
pub use backend::{Backend, BackendAdapter, ErrorKind, ExecutionResult};
pub use cache::{CacheOutcome, FingerprintCache};
pub use cascade::{CascadeController, QualityGate};
pub use config::RouterConfig;
pub use ledger::CostLedger;
pub use router::{RouteResponse, Router};
pub use routing::{ComplexityEstimator, ModelSelector};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`RouterError::Internal`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing() -> Result<(), RouterError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| RouterError::Internal(format!("tracing init failed: {e}")))
}

// ── Tier ──────────────────────────────────────────────────────────────────

/// Backend class, ordered from cheapest to most capable.
///
/// The derived `Ord` follows declaration order, so `Cheap < Mid < Premium`
/// and escalation always moves "up".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    schemars::JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Free or near-free local-class model.
    Cheap,
    /// Mid-tier hosted model.
    Mid,
    /// Premium, metered model.
    Premium,
}

impl Tier {
    /// All tiers in escalation order.
    pub const ALL: [Tier; 3] = [Tier::Cheap, Tier::Mid, Tier::Premium];

    /// The next tier up, or `None` at premium.
    pub fn next(self) -> Option<Tier> {
        match self {
            Tier::Cheap => Some(Tier::Mid),
            Tier::Mid => Some(Tier::Premium),
            Tier::Premium => None,
        }
    }

    /// Stable lowercase label used in logs, metrics and JSON.
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Cheap => "cheap",
            Tier::Mid => "mid",
            Tier::Premium => "premium",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = RouterError;

    /// Parses a tier name. `local` and `cloud` are accepted as aliases for
    /// cheap and premium.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cheap" | "local" => Ok(Tier::Cheap),
            "mid" | "standard" => Ok(Tier::Mid),
            "premium" | "cloud" => Ok(Tier::Premium),
            other => Err(RouterError::InvalidInput(format!(
                "unknown backend tier '{other}' (expected cheap, mid or premium)"
            ))),
        }
    }
}

// ── Request ───────────────────────────────────────────────────────────────

/// A single routing request. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteRequest {
    text: String,
    forced_backend: Option<Tier>,
    request_id: String,
}

impl RouteRequest {
    /// Create a request with a freshly generated request id.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            forced_backend: None,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Pin the request to a tier, bypassing estimation and the cache.
    pub fn with_forced_backend(mut self, tier: Tier) -> Self {
        self.forced_backend = Some(tier);
        self
    }

    /// Use a caller-assigned request id.
    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = id.into();
        self
    }

    /// The raw prompt text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Forced tier, if any.
    pub fn forced_backend(&self) -> Option<Tier> {
        self.forced_backend
    }

    /// Opaque request identifier used for log and ledger correlation.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

// ── Errors ────────────────────────────────────────────────────────────────

/// One failed (or rejected) attempt inside a cascade.
///
/// `message` is sanitized: it never contains credentials or prompt text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptFailure {
    /// Tier that was attempted.
    pub tier: Tier,
    /// Adapter name serving that tier.
    pub backend: String,
    /// Classified reason.
    pub kind: ErrorKind,
    /// Short human-readable detail.
    pub message: String,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {} - {}", self.tier, self.backend, self.kind, self.message)
    }
}

/// Top-level router errors.
///
/// Transient backend variants are normally absorbed by the cascade; callers
/// of [`Router::handle`] only see them when a single-tier plan fails.
/// `Clone` is required because one computation result is shared among all
/// single-flight waiters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouterError {
    /// The prompt was empty, oversized, or otherwise malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A backend did not answer within its timeout.
    #[error("backend timeout on {tier} tier")]
    BackendTimeout {
        /// Tier whose adapter timed out.
        tier: Tier,
    },

    /// A backend could not be reached or returned a server error.
    #[error("backend unavailable on {tier} tier: {reason}")]
    BackendUnavailable {
        /// Tier whose adapter was unavailable.
        tier: Tier,
        /// Sanitized reason.
        reason: String,
    },

    /// A backend rejected the call for quota or rate-limit reasons.
    #[error("quota exceeded on {tier} tier")]
    QuotaExceeded {
        /// Tier whose quota is exhausted.
        tier: Tier,
    },

    /// Every tier in the plan failed.
    #[error("all tiers failed: {}", format_attempts(.attempts))]
    ExhaustedFailed {
        /// Per-tier failure reasons, in attempt order.
        attempts: Vec<AttemptFailure>,
    },

    /// A configuration value is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Catch-all for unexpected internal failures.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RouterError {
    /// Short machine-readable kind used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            RouterError::InvalidInput(_) => "invalid_input",
            RouterError::BackendTimeout { .. } => "backend_timeout",
            RouterError::BackendUnavailable { .. } => "backend_unavailable",
            RouterError::QuotaExceeded { .. } => "quota_exceeded",
            RouterError::ExhaustedFailed { .. } => "exhausted_failed",
            RouterError::Config(_) => "config",
            RouterError::Internal(_) => "internal",
        }
    }
}

fn format_attempts(attempts: &[AttemptFailure]) -> String {
    if attempts.is_empty() {
        return "no tiers attempted".to_string();
    }
    attempts
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
