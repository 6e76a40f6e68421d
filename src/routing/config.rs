//! Routing configuration types.
//!
//! Provides [`RoutingConfig`] for tier thresholds and request limits, and
//! [`EstimatorConfig`] for the keyword sets, task cues and factor weights
//! the [`super::ComplexityEstimator`] scores against. All fields have
//! defaults and are (de)serialisable via serde so operators can tune them
//! from TOML without redeploying.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ── Default value functions ────────────────────────────────────────────

/// Default score below which requests route to the cheap tier.
fn default_threshold_cheap_mid() -> f64 {
    0.3
}

/// Default score at or above which requests route to the premium tier.
fn default_threshold_mid_premium() -> f64 {
    0.6
}

/// Default upper bound on prompt size, in characters.
fn default_max_prompt_chars() -> usize {
    32_000
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

fn default_raising_keywords() -> Vec<String> {
    strings(&[
        "analyze",
        "analyse",
        "implement",
        "design",
        "optimize",
        "optimise",
        "architecture",
        "refactor",
        "debug",
        "algorithm",
        "trade-off",
        "tradeoff",
    ])
}

fn default_lowering_keywords() -> Vec<String> {
    strings(&["what is", "what's", "define", "list", "who is", "when was", "translate"])
}

fn default_question_openers() -> Vec<String> {
    strings(&[
        "what", "who", "when", "where", "which", "is", "are", "does", "do", "can",
    ])
}

fn default_definition_cues() -> Vec<String> {
    strings(&["define", "definition of", "meaning of", "what does"])
}

fn default_generation_cues() -> Vec<String> {
    strings(&["write", "generate", "create", "implement", "build", "produce"])
}

fn default_analysis_cues() -> Vec<String> {
    strings(&[
        "analyze",
        "analyse",
        "compare",
        "evaluate",
        "explain why",
        "debug",
        "review",
        "assess",
        "diagnose",
    ])
}

fn default_creative_cues() -> Vec<String> {
    strings(&[
        "design",
        "story",
        "poem",
        "brainstorm",
        "imagine",
        "invent",
        "architecture",
    ])
}

// ── RoutingConfig ──────────────────────────────────────────────────────

/// Configuration for the model selection layer.
///
/// Controls how an estimated complexity score maps to a [`crate::Tier`].
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RoutingConfig {
    /// Score below which requests route to the cheap tier.
    ///
    /// Range: `0.0..=1.0`.  Default: `0.3`.
    #[serde(default = "default_threshold_cheap_mid")]
    pub threshold_cheap_mid: f64,

    /// Score at or above which requests route to the premium tier.
    ///
    /// Range: `0.0..=1.0`, must be `>= threshold_cheap_mid`.  Default: `0.6`.
    #[serde(default = "default_threshold_mid_premium")]
    pub threshold_mid_premium: f64,

    /// Route every non-forced request to premium regardless of score.
    #[serde(default)]
    pub force_premium_only: bool,

    /// Requests longer than this (in characters) are rejected.
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            threshold_cheap_mid: default_threshold_cheap_mid(),
            threshold_mid_premium: default_threshold_mid_premium(),
            force_premium_only: false,
            max_prompt_chars: default_max_prompt_chars(),
        }
    }
}

// ── EstimatorConfig ────────────────────────────────────────────────────

/// Weights applied to each complexity factor before summing.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct FactorWeights {
    /// Weight of the length factor.
    pub length: f64,
    /// Weight of the keyword factor.
    pub keyword: f64,
    /// Weight of the code-presence factor.
    pub code_presence: f64,
    /// Weight of the task-type factor.
    pub task_type: f64,
}

impl Default for FactorWeights {
    fn default() -> Self {
        Self {
            length: 0.30,
            keyword: 0.30,
            code_presence: 0.25,
            task_type: 0.15,
        }
    }
}

/// Term lists and weights consumed by the complexity estimator.
///
/// Matching is case-insensitive substring matching; entries should be
/// lowercase. Empty lists disable the corresponding signal.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct EstimatorConfig {
    /// Terms that raise complexity (+0.3 on first hit).
    #[serde(default = "default_raising_keywords")]
    pub raising_keywords: Vec<String>,

    /// Terms that lower complexity (-0.1 on first hit).
    #[serde(default = "default_lowering_keywords")]
    pub lowering_keywords: Vec<String>,

    /// First words that, combined with a trailing `?`, mark a question.
    #[serde(default = "default_question_openers")]
    pub question_openers: Vec<String>,

    /// Cues for definition requests.
    #[serde(default = "default_definition_cues")]
    pub definition_cues: Vec<String>,

    /// Cues for generation requests.
    #[serde(default = "default_generation_cues")]
    pub generation_cues: Vec<String>,

    /// Cues for analysis requests.
    #[serde(default = "default_analysis_cues")]
    pub analysis_cues: Vec<String>,

    /// Cues for creative or design requests.
    #[serde(default = "default_creative_cues")]
    pub creative_cues: Vec<String>,

    /// Factor weights.
    #[serde(default)]
    pub weights: FactorWeights,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            raising_keywords: default_raising_keywords(),
            lowering_keywords: default_lowering_keywords(),
            question_openers: default_question_openers(),
            definition_cues: default_definition_cues(),
            generation_cues: default_generation_cues(),
            analysis_cues: default_analysis_cues(),
            creative_cues: default_creative_cues(),
            weights: FactorWeights::default(),
        }
    }
}

/// Validate a [`RoutingConfig`] and [`EstimatorConfig`] pair, returning a
/// list of human-readable errors.
///
/// # Returns
///
/// An empty `Vec` on success, or one error string per violated constraint.
///
/// # Panics
///
/// This function never panics.
pub fn validate(routing: &RoutingConfig, estimator: &EstimatorConfig) -> Vec<String> {
    let mut errors = Vec::new();

    if !(0.0..=1.0).contains(&routing.threshold_cheap_mid) {
        errors.push(format!(
            "routing.threshold_cheap_mid must be in [0.0, 1.0], got {}",
            routing.threshold_cheap_mid
        ));
    }

    if !(0.0..=1.0).contains(&routing.threshold_mid_premium) {
        errors.push(format!(
            "routing.threshold_mid_premium must be in [0.0, 1.0], got {}",
            routing.threshold_mid_premium
        ));
    }

    if routing.threshold_mid_premium < routing.threshold_cheap_mid {
        errors.push(format!(
            "routing.threshold_mid_premium ({}) must be >= routing.threshold_cheap_mid ({})",
            routing.threshold_mid_premium, routing.threshold_cheap_mid
        ));
    }

    if routing.max_prompt_chars == 0 {
        errors.push("routing.max_prompt_chars must be > 0".to_string());
    }

    let w = &estimator.weights;
    for (name, value) in [
        ("length", w.length),
        ("keyword", w.keyword),
        ("code_presence", w.code_presence),
        ("task_type", w.task_type),
    ] {
        if value < 0.0 || !value.is_finite() {
            errors.push(format!(
                "estimator.weights.{name} must be a finite value >= 0, got {value}"
            ));
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds() {
        let cfg = RoutingConfig::default();
        assert!((cfg.threshold_cheap_mid - 0.3).abs() < f64::EPSILON);
        assert!((cfg.threshold_mid_premium - 0.6).abs() < f64::EPSILON);
        assert!(!cfg.force_premium_only);
    }

    #[test]
    fn test_default_weights_sum_to_one() {
        let w = FactorWeights::default();
        let sum = w.length + w.keyword + w.code_presence + w.task_type;
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_default_config_validates() {
        let errors = validate(&RoutingConfig::default(), &EstimatorConfig::default());
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let routing = RoutingConfig {
            threshold_cheap_mid: 0.7,
            threshold_mid_premium: 0.5,
            ..RoutingConfig::default()
        };
        let errors = validate(&routing, &EstimatorConfig::default());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("threshold_mid_premium"));
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let routing = RoutingConfig {
            threshold_cheap_mid: -0.1,
            threshold_mid_premium: 1.5,
            max_prompt_chars: 0,
            ..RoutingConfig::default()
        };
        let estimator = EstimatorConfig {
            weights: FactorWeights {
                length: -1.0,
                ..FactorWeights::default()
            },
            ..EstimatorConfig::default()
        };
        let errors = validate(&routing, &estimator);
        assert_eq!(errors.len(), 4, "got: {errors:?}");
    }

    #[test]
    fn test_estimator_config_partial_toml_keeps_defaults() {
        let cfg: EstimatorConfig =
            toml::from_str(r#"raising_keywords = ["kubernetes"]"#).unwrap();
        assert_eq!(cfg.raising_keywords, vec!["kubernetes".to_string()]);
        assert_eq!(cfg.lowering_keywords, default_lowering_keywords());
        assert_eq!(cfg.weights, FactorWeights::default());
    }
}
