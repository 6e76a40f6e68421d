//! Model selection logic.
//!
//! The [`ModelSelector`] maps a complexity score (or an explicit override)
//! to a [`Tier`] using the half-open threshold intervals from
//! [`RoutingConfig`]:
//!
//! ```text
//! [0.0, T1) → cheap    [T1, T2) → mid    [T2, 1.0] → premium
//! ```
//!
//! A score exactly equal to a threshold belongs to the higher tier.

use serde::{Deserialize, Serialize};

use crate::Tier;

use super::config::RoutingConfig;
use super::estimator::ComplexityEstimate;

/// The routing decision for a single request.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Tier the cascade starts from.
    pub selected_tier: Tier,
    /// Rationale: the estimator's reasoning, or why it was bypassed.
    pub reasoning: String,
    /// Cost of the execution that served the request; `None` until executed.
    pub estimated_cost: Option<f64>,
    /// `true` if the tier came from an override rather than the score.
    pub forced: bool,
}

impl RoutingDecision {
    /// Attach the executed cost.
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.estimated_cost = Some(cost);
        self
    }
}

/// Threshold-based tier selector.
///
/// Stateless beyond its configuration and cheap to clone.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug, Clone, Default)]
pub struct ModelSelector {
    config: RoutingConfig,
}

impl ModelSelector {
    /// Create a selector with the given thresholds.
    pub fn new(config: RoutingConfig) -> Self {
        Self { config }
    }

    /// Select a tier for `score`, honouring `override_tier` and
    /// `force_premium_only` first.
    ///
    /// # Example
    ///
    /// ```rust
    /// use tokio_cost_router::routing::ModelSelector;
    /// use tokio_cost_router::Tier;
    /// let selector = ModelSelector::default();
    /// assert_eq!(selector.select(0.1, None), Tier::Cheap);
    /// assert_eq!(selector.select(0.3, None), Tier::Mid);
    /// assert_eq!(selector.select(0.1, Some(Tier::Premium)), Tier::Premium);
    /// ```
    pub fn select(&self, score: f64, override_tier: Option<Tier>) -> Tier {
        if let Some(tier) = override_tier {
            return tier;
        }
        if self.config.force_premium_only {
            return Tier::Premium;
        }
        if score < self.config.threshold_cheap_mid {
            Tier::Cheap
        } else if score < self.config.threshold_mid_premium {
            Tier::Mid
        } else {
            Tier::Premium
        }
    }

    /// Build a [`RoutingDecision`] from an estimate.
    pub fn decide(&self, estimate: &ComplexityEstimate) -> RoutingDecision {
        let selected_tier = self.select(estimate.score, None);
        let reasoning = if self.config.force_premium_only {
            format!("force_premium_only is set; {}", estimate.reasoning)
        } else {
            estimate.reasoning.clone()
        };
        RoutingDecision {
            selected_tier,
            reasoning,
            estimated_cost: None,
            forced: false,
        }
    }

    /// Build a [`RoutingDecision`] for a forced tier; the estimator is not
    /// consulted.
    pub fn forced(&self, tier: Tier) -> RoutingDecision {
        RoutingDecision {
            selected_tier: tier,
            reasoning: format!("forced backend '{tier}'; estimation bypassed"),
            estimated_cost: None,
            forced: true,
        }
    }

    /// Whether every non-forced request starts at premium.
    pub fn force_premium_only(&self) -> bool {
        self.config.force_premium_only
    }

    /// The thresholds in use.
    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }
}
