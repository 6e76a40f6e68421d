//! # Stage: Router Configuration
//!
//! ## Responsibility
//! Parse, override from the environment, and validate the TOML
//! configuration for a router instance:
//! ```text
//! tokio-cost-router serve --config router.toml
//! ```
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `RouterConfig`
//! - Complete defaults: an empty file is a valid configuration
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building adapters from config (that belongs to `backend`)
//! - Serving HTTP (that belongs to `web_api`)

pub mod loader;
pub mod validation;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use crate::routing::config::{EstimatorConfig, FactorWeights, RoutingConfig};
pub use validation::ConfigError;

use crate::Tier;

// ── Default value functions ──────────────────────────────────────────────

/// Default cache TTL: 300 seconds.
fn default_cache_ttl_seconds() -> u64 {
    300
}

/// Default cache capacity: 10 000 entries.
fn default_cache_max_entries() -> usize {
    10_000
}

/// Default sweep interval for expired entries: 60 seconds.
fn default_sweep_interval_seconds() -> u64 {
    60
}

/// Default per-tier backend timeout: 30 000 ms.
fn default_per_tier_timeout_ms() -> u64 {
    30_000
}

/// Default maximum generated tokens per call.
fn default_max_tokens() -> u32 {
    256
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

/// Default bind port, kept off llama.cpp's default `8080`.
fn default_port() -> u16 {
    3000
}

/// Default maximum HTTP request body: 1 MiB.
fn default_max_request_size() -> usize {
    1024 * 1024
}

/// Default enabled state: true.
fn default_true() -> bool {
    true
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a router instance.
///
/// Every section and field has a documented default, so partial files are
/// accepted.
///
/// # Example
///
/// ```toml
/// [routing]
/// threshold_cheap_mid = 0.25
///
/// [cache]
/// cache_ttl_seconds = 600
///
/// [backends.premium]
/// kind = "anthropic"
/// model = "claude-3-5-sonnet-20241022"
/// cost_per_1k_tokens = 0.015
/// ```
///
/// # Panics
///
/// This type never panics during construction or access.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RouterConfig {
    /// Tier thresholds and request limits.
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Fingerprint cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Backend adapters per tier.
    #[serde(default)]
    pub backends: BackendsConfig,
    /// Complexity estimator term lists and weights.
    #[serde(default)]
    pub estimator: EstimatorConfig,
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,
}

// ── Cache ────────────────────────────────────────────────────────────────

/// Fingerprint cache configuration.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CacheConfig {
    /// When false every request is executed.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// How long a result stays valid, in seconds.
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
    /// Capacity bound; the oldest entry is evicted first.
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    /// How often the background sweeper purges expired entries.
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_ttl_seconds: default_cache_ttl_seconds(),
            max_entries: default_cache_max_entries(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
        }
    }
}

// ── Backends ─────────────────────────────────────────────────────────────

/// Supported backend implementations.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Local llama.cpp server.
    LlamaCpp,
    /// OpenAI-compatible chat completions API.
    OpenAi,
    /// Anthropic Messages API.
    Anthropic,
    /// In-process echo backend (testing only).
    Echo,
}

/// One tier's backend.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct TierBackendConfig {
    /// Backend implementation.
    pub kind: BackendKind,
    /// Base URL override. `None` uses the backend default.
    #[serde(default)]
    pub url: Option<String>,
    /// Model identifier sent to the backend.
    pub model: String,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// USD per 1 000 billed tokens.
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
    /// Maximum tokens to generate per call.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Disabled tiers are skipped by the cascade.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl TierBackendConfig {
    fn new(kind: BackendKind, model: &str, cost_per_1k_tokens: f64) -> Self {
        Self {
            kind,
            url: None,
            model: model.to_string(),
            api_key_env: None,
            cost_per_1k_tokens,
            max_tokens: default_max_tokens(),
            enabled: true,
        }
    }
}

fn default_cheap_backend() -> TierBackendConfig {
    TierBackendConfig::new(BackendKind::LlamaCpp, "local", 0.0)
}

fn default_mid_backend() -> TierBackendConfig {
    TierBackendConfig::new(BackendKind::OpenAi, "gpt-4o-mini", 0.0006)
}

fn default_premium_backend() -> TierBackendConfig {
    TierBackendConfig::new(BackendKind::Anthropic, "claude-3-5-sonnet-20241022", 0.015)
}

/// Backend configuration for all tiers.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BackendsConfig {
    /// Timeout applied to every backend call, in milliseconds.
    #[serde(default = "default_per_tier_timeout_ms")]
    pub per_tier_timeout_ms: u64,
    /// Cheap tier (local-class model).
    #[serde(default = "default_cheap_backend")]
    pub cheap: TierBackendConfig,
    /// Mid tier.
    #[serde(default = "default_mid_backend")]
    pub mid: TierBackendConfig,
    /// Premium tier (metered).
    #[serde(default = "default_premium_backend")]
    pub premium: TierBackendConfig,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            per_tier_timeout_ms: default_per_tier_timeout_ms(),
            cheap: default_cheap_backend(),
            mid: default_mid_backend(),
            premium: default_premium_backend(),
        }
    }
}

impl BackendsConfig {
    /// Tier configurations in escalation order.
    pub fn tiers(&self) -> [(Tier, &TierBackendConfig); 3] {
        [
            (Tier::Cheap, &self.cheap),
            (Tier::Mid, &self.mid),
            (Tier::Premium, &self.premium),
        ]
    }

    /// Configuration for `tier`.
    pub fn tier(&self, tier: Tier) -> &TierBackendConfig {
        match tier {
            Tier::Cheap => &self.cheap,
            Tier::Mid => &self.mid,
            Tier::Premium => &self.premium,
        }
    }
}

// ── Server ───────────────────────────────────────────────────────────────

/// HTTP server configuration.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum request body size in bytes.
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_request_size: default_max_request_size(),
        }
    }
}

// ── Environment overrides ────────────────────────────────────────────────

/// Environment variables that override file configuration.
pub const ENV_OVERRIDES: [&str; 5] = [
    "ROUTER_THRESHOLD_CHEAP_MID",
    "ROUTER_THRESHOLD_MID_PREMIUM",
    "ROUTER_CACHE_TTL_SECONDS",
    "ROUTER_FORCE_PREMIUM_ONLY",
    "ROUTER_PER_TIER_TIMEOUT_MS",
];

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::Env {
        var: var.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

impl RouterConfig {
    /// Apply overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] if a set variable cannot be parsed.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|var| std::env::var(var).ok())
    }

    /// Apply overrides using `lookup` to resolve variable names.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] if a present value cannot be parsed.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let [cheap_mid, mid_premium, ttl, force, timeout] = ENV_OVERRIDES;
        if let Some(v) = lookup(cheap_mid) {
            self.routing.threshold_cheap_mid = parse_env(cheap_mid, &v)?;
        }
        if let Some(v) = lookup(mid_premium) {
            self.routing.threshold_mid_premium = parse_env(mid_premium, &v)?;
        }
        if let Some(v) = lookup(ttl) {
            self.cache.cache_ttl_seconds = parse_env(ttl, &v)?;
        }
        if let Some(v) = lookup(force) {
            self.routing.force_premium_only = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => {
                    return Err(ConfigError::Env {
                        var: force.to_string(),
                        value: v,
                        reason: "expected a boolean".to_string(),
                    })
                }
            };
        }
        if let Some(v) = lookup(timeout) {
            self.backends.per_tier_timeout_ms = parse_env(timeout, &v)?;
        }
        Ok(())
    }
}

/// Export the JSON Schema for [`RouterConfig`] as a pretty-printed string.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
///
/// # Panics
///
/// This function never panics.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(RouterConfig);
    serde_json::to_string_pretty(&schema)
}
