//! # Stage: Complexity Estimation and Tier Selection
//!
//! ## Responsibility
//! Turn a prompt into a complexity score with a rationale, and turn that
//! score into the tier the cascade starts from.  Simple prompts go to the
//! cheap tier; prompts in the middle band go to the mid tier; hard prompts
//! go straight to premium.
//!
//! ## Guarantees
//! - Deterministic: the same prompt text and configuration always produce
//!   the same score, reasoning and initial tier.
//! - Pure: estimation and selection perform no I/O and hold no shared
//!   mutable state.
//! - Bounded: scores are clamped to `[0.0, 1.0]`.
//!
//! ## NOT Responsible For
//! - Calling backends or escalating between tiers (that belongs to `cascade`)
//! - Judging output quality (pluggable `cascade::QualityGate`)

pub mod config;
pub mod estimator;
pub mod selector;

// Re-exports for convenience
pub use config::{EstimatorConfig, FactorWeights, RoutingConfig};
pub use estimator::{ComplexityEstimate, ComplexityEstimator, ComplexityFactors, TaskType};
pub use selector::{ModelSelector, RoutingDecision};
