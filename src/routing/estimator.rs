//! Prompt complexity estimation.
//!
//! Analyses a prompt string and produces a complexity score in the range
//! `0.0..=1.0` plus a human-readable rationale.  The score drives tier
//! selection:
//!
//! | Score         | Tier    |
//! |---------------|---------|
//! | `< 0.3`       | cheap   |
//! | `0.3 – 0.6`   | mid     |
//! | `>= 0.6`      | premium |
//!
//! ## Factors
//!
//! | Factor        | Weight | Range          |
//! |---------------|--------|----------------|
//! | length        | 0.30   | `0.0..=0.7`    |
//! | keyword       | 0.30   | `-0.1..=0.3`   |
//! | code presence | 0.25   | `0.0..=0.4`    |
//! | task type     | 0.15   | `-0.1..=0.3`   |
//!
//! The weighted sum is clamped to `[0.0, 1.0]`.  Long, structured
//! multi-requirement prompts can still land close to a threshold; that is
//! a tuning concern for the keyword and cue lists, not something the
//! estimator corrects for.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::config::EstimatorConfig;

/// Maximum combined contribution of the code-presence factor.
const CODE_PRESENCE_CAP: f64 = 0.4;

/// A prompt complexity estimator.
///
/// Holds its keyword configuration by value, so an estimator can be rebuilt
/// from a reloaded [`EstimatorConfig`] without touching global state.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug, Clone, Default)]
pub struct ComplexityEstimator {
    config: EstimatorConfig,
}

/// Lexical classification of what a prompt asks for.
///
/// Variants are listed in classification priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// A direct question ("What is X?").
    Question,
    /// A request for a definition.
    Definition,
    /// A request to produce code or text.
    Generation,
    /// A request to analyse, compare, or debug.
    Analysis,
    /// A creative or design request.
    Creative,
    /// No recognised cue.
    Neutral,
}

impl TaskType {
    /// Subscore contributed by this classification.
    pub fn subscore(self) -> f64 {
        match self {
            TaskType::Question | TaskType::Definition => -0.1,
            TaskType::Generation | TaskType::Creative => 0.2,
            TaskType::Analysis => 0.3,
            TaskType::Neutral => 0.0,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            TaskType::Question => "question",
            TaskType::Definition => "definition",
            TaskType::Generation => "generation",
            TaskType::Analysis => "analysis",
            TaskType::Creative => "creative",
            TaskType::Neutral => "neutral",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four independent subscores, before weighting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComplexityFactors {
    /// Length step-function subscore (`0.0..=0.7`).
    pub length: f64,
    /// Keyword subscore (`-0.1..=0.3`).
    pub keyword: f64,
    /// Code-presence subscore (`0.0..=0.4`).
    pub code_presence: f64,
    /// Task-type subscore (`-0.1..=0.3`).
    pub task_type: f64,
}

/// Result of estimating one prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityEstimate {
    /// Final clamped score in `[0.0, 1.0]`.
    pub score: f64,
    /// Weighted sum before clamping.
    pub raw_score: f64,
    /// Rationale built from the factors; always starts with the length factor.
    pub reasoning: String,
    /// Individual subscores.
    pub factors: ComplexityFactors,
    /// Task classification behind the task-type subscore.
    pub task: TaskType,
}

impl ComplexityEstimator {
    /// Create an estimator with the default term lists and weights.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an estimator from an explicit configuration.
    pub fn with_config(config: EstimatorConfig) -> Self {
        Self { config }
    }

    /// The configuration this estimator scores against.
    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Estimate the complexity of a prompt.
    ///
    /// # Example
    ///
    /// ```rust
    /// use tokio_cost_router::routing::ComplexityEstimator;
    /// let estimate = ComplexityEstimator::new().estimate("What is Python?");
    /// assert_eq!(estimate.score, 0.0);
    /// assert!(estimate.reasoning.starts_with("length"));
    /// ```
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn estimate(&self, text: &str) -> ComplexityEstimate {
        let lower = text.to_lowercase();
        let char_count = text.chars().count();

        let length = length_subscore(char_count);
        let (keyword, raised_by, lowered_by) = self.keyword_subscore(&lower);
        let code = code_presence(text);
        let task = self.classify(text, &lower);
        let task_type = task.subscore();

        let w = &self.config.weights;
        let raw_score = length * w.length
            + keyword * w.keyword
            + code.subscore * w.code_presence
            + task_type * w.task_type;
        let score = clamp_score(raw_score);

        let keyword_desc = match (raised_by, lowered_by) {
            (Some(r), Some(l)) => format!("+'{r}' -'{l}'"),
            (Some(r), None) => format!("+'{r}'"),
            (None, Some(l)) => format!("-'{l}'"),
            (None, None) => "none".to_string(),
        };

        let reasoning = format!(
            "length: {char_count} chars -> {length:.2}; keyword: {keyword_desc} -> {keyword:.2}; \
             code: {code_desc} -> {code_score:.2}; task: {task} -> {task_type:.2}; \
             score {score:.3}",
            code_desc = code.describe(),
            code_score = code.subscore,
        );

        ComplexityEstimate {
            score,
            raw_score,
            reasoning,
            factors: ComplexityFactors {
                length,
                keyword,
                code_presence: code.subscore,
                task_type,
            },
            task,
        }
    }

    /// Shorthand for `estimate(text).score`.
    pub fn score(&self, text: &str) -> f64 {
        self.estimate(text).score
    }

    // ── Individual factors ─────────────────────────────────────────────

    /// +0.3 for the first raising term, -0.1 for the first lowering term.
    fn keyword_subscore<'a>(&'a self, lower: &str) -> (f64, Option<&'a str>, Option<&'a str>) {
        let raised = first_hit(lower, &self.config.raising_keywords);
        let lowered = first_hit(lower, &self.config.lowering_keywords);

        let mut total = 0.0;
        if raised.is_some() {
            total += 0.3;
        }
        if lowered.is_some() {
            total -= 0.1;
        }
        (total, raised, lowered)
    }

    /// First matching category wins: question, definition, generation,
    /// analysis, creative, else neutral.
    fn classify(&self, text: &str, lower: &str) -> TaskType {
        if self.is_question(text, lower) {
            TaskType::Question
        } else if first_hit(lower, &self.config.definition_cues).is_some() {
            TaskType::Definition
        } else if first_hit(lower, &self.config.generation_cues).is_some() {
            TaskType::Generation
        } else if first_hit(lower, &self.config.analysis_cues).is_some() {
            TaskType::Analysis
        } else if first_hit(lower, &self.config.creative_cues).is_some() {
            TaskType::Creative
        } else {
            TaskType::Neutral
        }
    }

    fn is_question(&self, text: &str, lower: &str) -> bool {
        if !text.trim_end().ends_with('?') {
            return false;
        }
        let first_word = lower
            .split_whitespace()
            .next()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric() && c != '\''))
            .unwrap_or("");
        self.config
            .question_openers
            .iter()
            .any(|opener| opener == first_word)
    }
}

/// Step function over the character count.
fn length_subscore(chars: usize) -> f64 {
    match chars {
        0..=49 => 0.0,
        50..=99 => 0.1,
        100..=299 => 0.3,
        300..=499 => 0.5,
        _ => 0.7,
    }
}

fn first_hit<'a>(lower: &str, terms: &'a [String]) -> Option<&'a str> {
    terms
        .iter()
        .map(String::as_str)
        .find(|term| !term.is_empty() && lower.contains(term))
}

/// Clamp a raw score to the valid `[0.0, 1.0]` range.
fn clamp_score(raw: f64) -> f64 {
    raw.clamp(0.0, 1.0)
}

// ── Code presence ──────────────────────────────────────────────────────

struct CodeSignal {
    fenced_blocks: usize,
    inline_span: bool,
    declaration: bool,
    subscore: f64,
}

impl CodeSignal {
    fn describe(&self) -> String {
        let mut parts = Vec::new();
        if self.fenced_blocks > 0 {
            parts.push(format!("{} fenced block(s)", self.fenced_blocks));
        }
        if self.inline_span {
            parts.push("inline code".to_string());
        }
        if self.declaration {
            parts.push("declarations".to_string());
        }
        if parts.is_empty() {
            "none".to_string()
        } else {
            parts.join(", ")
        }
    }
}

fn inline_code_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"`[^`\n]+`").ok())
        .as_ref()
}

fn declaration_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"\b(?:def|fn|function|func)\s+[A-Za-z_][A-Za-z0-9_]*\s*[(<]",
            r"\bclass\s+[A-Za-z_][A-Za-z0-9_]*\s*[:({<]",
            r"\b(?:struct|interface|impl|enum)\s+[A-Za-z_][A-Za-z0-9_]*\s*[{<]",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Fenced blocks +0.3 (+0.1 if more than one), inline spans +0.2 when no
/// fence is present, declarations +0.2; capped at 0.4.
fn code_presence(text: &str) -> CodeSignal {
    let fences = text.matches("```").count();
    // An unterminated trailing fence still opens a block.
    let fenced_blocks = fences.div_ceil(2);

    let inline_span = fenced_blocks == 0
        && inline_code_pattern().is_some_and(|re| re.is_match(text));
    let declaration = declaration_patterns().iter().any(|re| re.is_match(text));

    let mut total: f64 = 0.0;
    if fenced_blocks > 0 {
        total += 0.3;
        if fenced_blocks > 1 {
            total += 0.1;
        }
    } else if inline_span {
        total += 0.2;
    }
    if declaration {
        total += 0.2;
    }

    CodeSignal {
        fenced_blocks,
        inline_span,
        declaration,
        subscore: total.min(CODE_PRESENCE_CAP),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
