//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`RouterConfig`] that cannot
//! be expressed through the type system alone (range checks, cross-field
//! invariants).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::RouterConfig;
use crate::{routing, RouterError};

/// Errors arising from configuration parsing, validation, or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "backends.per_tier_timeout_ms").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// An environment override could not be parsed.
    #[error("Environment variable {var}={value:?} is invalid: {reason}")]
    Env {
        /// Variable name.
        var: String,
        /// Raw value.
        value: String,
        /// Parse failure.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl From<ConfigError> for RouterError {
    fn from(e: ConfigError) -> Self {
        RouterError::Config(e.to_string())
    }
}

/// Validate all semantic constraints on a [`RouterConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &RouterConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors: Vec<ConfigError> =
        routing::config::validate(&config.routing, &config.estimator)
            .into_iter()
            .map(ConfigError::Validation)
            .collect();

    // ── Cache ────────────────────────────────────────────────────────
    if config.cache.enabled && config.cache.max_entries == 0 {
        errors.push(ConfigError::InvalidField {
            field: "cache.max_entries".into(),
            value: "0".into(),
            reason: "must be at least 1 when the cache is enabled".into(),
        });
    }

    if config.cache.sweep_interval_seconds == 0 {
        errors.push(ConfigError::InvalidField {
            field: "cache.sweep_interval_seconds".into(),
            value: "0".into(),
            reason: "must be at least 1 second".into(),
        });
    }

    // ── Backends ─────────────────────────────────────────────────────
    if config.backends.per_tier_timeout_ms == 0 {
        errors.push(ConfigError::InvalidField {
            field: "backends.per_tier_timeout_ms".into(),
            value: "0".into(),
            reason: "must be at least 1 ms".into(),
        });
    }

    for (tier, backend) in config.backends.tiers() {
        if !backend.cost_per_1k_tokens.is_finite() || backend.cost_per_1k_tokens < 0.0 {
            errors.push(ConfigError::InvalidField {
                field: format!("backends.{tier}.cost_per_1k_tokens"),
                value: backend.cost_per_1k_tokens.to_string(),
                reason: "must be a finite value >= 0".into(),
            });
        }

        if backend.model.trim().is_empty() {
            errors.push(ConfigError::InvalidField {
                field: format!("backends.{tier}.model"),
                value: "\"\"".into(),
                reason: "must not be empty".into(),
            });
        }

        if backend.max_tokens == 0 {
            errors.push(ConfigError::InvalidField {
                field: format!("backends.{tier}.max_tokens"),
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        if let Some(url) = &backend.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(ConfigError::InvalidField {
                    field: format!("backends.{tier}.url"),
                    value: url.clone(),
                    reason: "must start with http:// or https://".into(),
                });
            }
        }
    }

    if config.backends.tiers().iter().all(|(_, b)| !b.enabled) {
        errors.push(ConfigError::Validation(
            "at least one backend tier must be enabled".into(),
        ));
    }

    // ── Server ───────────────────────────────────────────────────────
    if config.server.host.trim().is_empty() {
        errors.push(ConfigError::InvalidField {
            field: "server.host".into(),
            value: "\"\"".into(),
            reason: "must not be empty".into(),
        });
    }

    if config.server.max_request_size == 0 {
        errors.push(ConfigError::InvalidField {
            field: "server.max_request_size".into(),
            value: "0".into(),
            reason: "must be at least 1 byte".into(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
