//! # Stage: Fallback Cascade
//!
//! ## Responsibility
//! Execute a request against the selected tier and, when that tier fails
//! or its output is rejected by the [`QualityGate`], escalate one tier at a
//! time towards premium.
//!
//! ## Guarantees
//! - Explicit state machine: every step goes through [`transition`]; an
//!   event that is not valid in the current state is an internal error,
//!   never a silent fallthrough.
//! - Sequential: tiers are attempted one at a time, never in parallel, so
//!   premium is never billed twice for one request.
//! - Complete attempt log: every attempt, failed or rejected, is kept in
//!   [`CascadeOutcome::executions`] and reported on exhaustion.
//!
//! ## NOT Responsible For
//! - Choosing the starting tier (see `routing::selector`)
//! - Ledger writes (the caller observes each execution through
//!   [`CascadeController::run`] and bills it)
//!
//! ```text
//!   Selected ──Start──▶ Executing ──AttemptSucceeded──▶ Succeeded
//!                        ▲    │
//!                  Resume│    │AttemptFailed / QualityRejected
//!                        │    ▼
//!                      Escalating        (no higher tier) ──▶ ExhaustedFailed
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend::{AdapterSet, ErrorKind, ExecutionResult};
use crate::{metrics, AttemptFailure, RouterError, Tier};

// ── State machine ──────────────────────────────────────────────────────

/// Cascade state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeState {
    /// A starting tier has been chosen; nothing has run yet.
    Selected,
    /// An attempt is running on the current tier.
    Executing,
    /// An attempt produced an accepted result. Terminal.
    Succeeded,
    /// The current tier failed; the next tier is about to run.
    Escalating,
    /// Every tier in the plan failed. Terminal.
    ExhaustedFailed,
}

impl CascadeState {
    /// `true` for states with no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, CascadeState::Succeeded | CascadeState::ExhaustedFailed)
    }
}

impl fmt::Display for CascadeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CascadeState::Selected => "selected",
            CascadeState::Executing => "executing",
            CascadeState::Succeeded => "succeeded",
            CascadeState::Escalating => "escalating",
            CascadeState::ExhaustedFailed => "exhausted_failed",
        };
        f.write_str(s)
    }
}

/// Input to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeEvent {
    /// Begin the first attempt.
    Start,
    /// The attempt succeeded and was accepted.
    AttemptSucceeded,
    /// The attempt failed.
    AttemptFailed,
    /// The attempt succeeded but the quality gate rejected it.
    QualityRejected,
    /// Move from escalation onto the next tier.
    Resume,
}

/// The cascade transition table.
///
/// `has_next_tier` tells whether the plan has a tier above the current one.
/// A quality rejection on the last tier is accepted as success.
///
/// # Errors
///
/// Returns [`RouterError::Internal`] for an event that is not valid in
/// `state`.
pub fn transition(
    state: CascadeState,
    event: CascadeEvent,
    has_next_tier: bool,
) -> Result<CascadeState, RouterError> {
    use CascadeEvent as E;
    use CascadeState as S;

    match (state, event) {
        (S::Selected, E::Start) => Ok(S::Executing),
        (S::Executing, E::AttemptSucceeded) => Ok(S::Succeeded),
        (S::Executing, E::AttemptFailed) if has_next_tier => Ok(S::Escalating),
        (S::Executing, E::AttemptFailed) => Ok(S::ExhaustedFailed),
        (S::Executing, E::QualityRejected) if has_next_tier => Ok(S::Escalating),
        (S::Executing, E::QualityRejected) => Ok(S::Succeeded),
        (S::Escalating, E::Resume) => Ok(S::Executing),
        (state, event) => Err(RouterError::Internal(format!(
            "invalid cascade transition: {event:?} in state {state}"
        ))),
    }
}

// ── Quality gate ───────────────────────────────────────────────────────

/// Policy deciding whether a successful result is good enough to return.
///
/// Consulted only when a higher tier is still available; the last tier's
/// output is always accepted.
#[async_trait]
pub trait QualityGate: Send + Sync {
    /// Return `true` to accept `result` for `prompt`.
    async fn accept(&self, prompt: &str, result: &ExecutionResult) -> bool;
}

/// Accepts every result.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl QualityGate for AcceptAll {
    async fn accept(&self, _prompt: &str, _result: &ExecutionResult) -> bool {
        true
    }
}

/// Rejects responses shorter than `min_chars` after trimming.
#[derive(Debug, Clone, Copy)]
pub struct MinLengthGate {
    /// Minimum accepted response length in characters.
    pub min_chars: usize,
}

#[async_trait]
impl QualityGate for MinLengthGate {
    async fn accept(&self, _prompt: &str, result: &ExecutionResult) -> bool {
        result.response_text.trim().chars().count() >= self.min_chars
    }
}

#[async_trait]
impl<F> QualityGate for F
where
    F: Fn(&str, &ExecutionResult) -> bool + Send + Sync,
{
    async fn accept(&self, prompt: &str, result: &ExecutionResult) -> bool {
        self(prompt, result)
    }
}

// ── Controller ─────────────────────────────────────────────────────────

/// Result of a cascade that ended in [`CascadeState::Succeeded`].
#[derive(Debug, Clone)]
pub struct CascadeOutcome {
    /// The execution whose response is returned.
    pub result: ExecutionResult,
    /// Every attempt in order, the served one last.
    pub executions: Vec<ExecutionResult>,
    /// States visited, starting with `Selected`.
    pub trace: Vec<CascadeState>,
}

impl CascadeOutcome {
    /// Number of tier changes performed.
    pub fn escalations(&self) -> usize {
        self.executions.len().saturating_sub(1)
    }

    /// Sum of the billed cost of every attempt.
    pub fn total_cost(&self) -> f64 {
        self.executions.iter().map(|e| e.actual_cost).sum()
    }

    /// The attempts that failed or were rejected before the served one.
    pub fn failures(&self) -> Vec<AttemptFailure> {
        let served = self.executions.len().saturating_sub(1);
        self.executions[..served].iter().map(attempt_failure).collect()
    }
}

/// A failed cascade: the error plus every execution it performed.
#[derive(Debug, Clone)]
pub struct CascadeFailure {
    /// The error to surface.
    pub error: RouterError,
    /// Every attempt in order.
    pub executions: Vec<ExecutionResult>,
}

fn attempt_failure(e: &ExecutionResult) -> AttemptFailure {
    let kind = e.error_kind.unwrap_or(ErrorKind::QualityRejected);
    AttemptFailure {
        tier: e.backend_tier,
        backend: e.backend.clone(),
        kind,
        message: e
            .error_message
            .clone()
            .unwrap_or_else(|| kind.to_string()),
    }
}

/// Runs the tier plan for one request.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Clone)]
pub struct CascadeController {
    adapters: AdapterSet,
    gate: Arc<dyn QualityGate>,
}

impl fmt::Debug for CascadeController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CascadeController")
            .field("adapters", &self.adapters)
            .finish_non_exhaustive()
    }
}

impl CascadeController {
    /// Create a controller over `adapters` that accepts every result.
    pub fn new(adapters: AdapterSet) -> Self {
        Self {
            adapters,
            gate: Arc::new(AcceptAll),
        }
    }

    /// Replace the quality gate.
    pub fn with_quality_gate(mut self, gate: Arc<dyn QualityGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Registered adapters.
    pub fn adapters(&self) -> &AdapterSet {
        &self.adapters
    }

    /// Tiers to attempt, in order.
    ///
    /// A forced plan is the single forced tier. Otherwise the plan is the
    /// selected tier followed by every higher tier, keeping only tiers with
    /// a registered adapter.
    ///
    /// # Errors
    ///
    /// - [`RouterError::InvalidInput`] if a forced tier has no adapter.
    /// - [`RouterError::Config`] if no adapter exists at or above `start`.
    pub fn plan(&self, start: Tier, forced: bool) -> Result<Vec<Tier>, RouterError> {
        if forced {
            return match self.adapters.get(start) {
                Some(_) => Ok(vec![start]),
                None => Err(RouterError::InvalidInput(format!(
                    "no backend is configured for forced tier '{start}'"
                ))),
            };
        }
        let plan: Vec<Tier> = Tier::ALL
            .into_iter()
            .filter(|t| *t >= start && self.adapters.get(*t).is_some())
            .collect();
        if plan.is_empty() {
            return Err(RouterError::Config(format!(
                "no backend is configured at or above tier '{start}'"
            )));
        }
        Ok(plan)
    }

    /// Run the cascade for `prompt` starting at `start`, handing every
    /// execution to `on_attempt` as soon as its adapter returns.
    ///
    /// `on_attempt` runs before the quality gate and before the next tier
    /// starts, so an attempt is observed even if this future is dropped
    /// later in the cascade.
    ///
    /// # Errors
    ///
    /// - [`RouterError::ExhaustedFailed`] when every tier of a multi-tier
    ///   plan failed; the error lists each attempt.
    /// - The classified transient error when a forced single-tier plan
    ///   failed.
    /// - Errors from [`CascadeController::plan`].
    pub async fn run(
        &self,
        prompt: &str,
        start: Tier,
        forced: bool,
        on_attempt: &(dyn Fn(&ExecutionResult) + Send + Sync),
    ) -> Result<CascadeOutcome, CascadeFailure> {
        let plan = self.plan(start, forced).map_err(|error| CascadeFailure {
            error,
            executions: Vec::new(),
        })?;

        let mut state = CascadeState::Selected;
        let mut trace = vec![state];
        let mut executions: Vec<ExecutionResult> = Vec::with_capacity(plan.len());

        let fail = |error: RouterError, executions: Vec<ExecutionResult>| CascadeFailure {
            error,
            executions,
        };

        for (idx, tier) in plan.iter().copied().enumerate() {
            let next = plan.get(idx + 1).copied();
            let event = if idx == 0 {
                CascadeEvent::Start
            } else {
                CascadeEvent::Resume
            };
            state = transition(state, event, next.is_some()).map_err(|e| fail(e, Vec::new()))?;
            trace.push(state);

            let Some(adapter) = self.adapters.get(tier) else {
                continue;
            };
            metrics::inc_request(tier);
            let result = adapter.execute(prompt).await;
            on_attempt(&result);

            let event = if !result.succeeded {
                CascadeEvent::AttemptFailed
            } else if next.is_some() && !self.gate.accept(prompt, &result).await {
                CascadeEvent::QualityRejected
            } else {
                CascadeEvent::AttemptSucceeded
            };
            executions.push(result);

            state = transition(state, event, next.is_some())
                .map_err(|e| fail(e, executions.clone()))?;
            trace.push(state);

            match state {
                CascadeState::Succeeded => {
                    let Some(result) = executions.last().cloned() else {
                        return Err(fail(
                            RouterError::Internal("succeeded without an attempt".into()),
                            executions,
                        ));
                    };
                    return Ok(CascadeOutcome {
                        result,
                        executions,
                        trace,
                    });
                }
                CascadeState::Escalating => {
                    if let (Some(to), Some(last)) = (next, executions.last_mut()) {
                        if event == CascadeEvent::QualityRejected {
                            last.error_kind = Some(ErrorKind::QualityRejected);
                            last.error_message = Some("rejected by quality gate".to_string());
                        }
                        info!(
                            from = %tier,
                            to = %to,
                            reason = %last.error_kind.map(|k| k.as_str()).unwrap_or("unknown"),
                            "escalating to next tier"
                        );
                        metrics::inc_escalation(tier, to);
                    }
                }
                CascadeState::ExhaustedFailed => break,
                CascadeState::Selected | CascadeState::Executing => {}
            }
        }

        let error = if forced && executions.len() == 1 {
            executions
                .first()
                .and_then(ExecutionResult::to_error)
                .unwrap_or_else(|| RouterError::Internal("forced attempt failed".into()))
        } else {
            RouterError::ExhaustedFailed {
                attempts: executions.iter().map(attempt_failure).collect(),
            }
        };
        warn!(error = %error, attempts = executions.len(), "cascade exhausted");
        Err(fail(error, executions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendAdapter, EchoBackend, EchoMode};
    use std::time::Duration;

    fn adapter(tier: Tier, mode: EchoMode) -> BackendAdapter {
        BackendAdapter::new(
            tier,
            Arc::new(EchoBackend::new(format!("{tier}-echo")).with_mode(mode)),
            Duration::from_millis(200),
        )
    }

    fn ignore(_: &ExecutionResult) {}

    fn all_tiers(cheap: EchoMode, mid: EchoMode, premium: EchoMode) -> AdapterSet {
        AdapterSet::new()
            .with(adapter(Tier::Cheap, cheap))
            .with(adapter(Tier::Mid, mid))
            .with(adapter(Tier::Premium, premium))
    }

    #[test]
    fn test_transition_table_happy_path() {
        let s = transition(CascadeState::Selected, CascadeEvent::Start, true).unwrap();
        assert_eq!(s, CascadeState::Executing);
        let s = transition(s, CascadeEvent::AttemptSucceeded, true).unwrap();
        assert_eq!(s, CascadeState::Succeeded);
        assert!(s.is_terminal());
    }

    #[test]
    fn test_transition_failure_depends_on_next_tier() {
        assert_eq!(
            transition(CascadeState::Executing, CascadeEvent::AttemptFailed, true).unwrap(),
            CascadeState::Escalating
        );
        assert_eq!(
            transition(CascadeState::Executing, CascadeEvent::AttemptFailed, false).unwrap(),
            CascadeState::ExhaustedFailed
        );
    }

    #[test]
    fn test_transition_quality_rejection_on_last_tier_is_accepted() {
        assert_eq!(
            transition(CascadeState::Executing, CascadeEvent::QualityRejected, false).unwrap(),
            CascadeState::Succeeded
        );
    }

    #[test]
    fn test_transition_invalid_event_is_error() {
        assert!(transition(CascadeState::Succeeded, CascadeEvent::Start, true).is_err());
        assert!(transition(CascadeState::Selected, CascadeEvent::Resume, true).is_err());
        assert!(transition(CascadeState::ExhaustedFailed, CascadeEvent::Resume, true).is_err());
    }

    #[test]
    fn test_plan_skips_missing_tiers() {
        let c = CascadeController::new(
            AdapterSet::new()
                .with(adapter(Tier::Cheap, EchoMode::Echo))
                .with(adapter(Tier::Premium, EchoMode::Echo)),
        );
        assert_eq!(c.plan(Tier::Cheap, false).unwrap(), vec![Tier::Cheap, Tier::Premium]);
        assert_eq!(c.plan(Tier::Mid, false).unwrap(), vec![Tier::Premium]);
        assert!(matches!(
            c.plan(Tier::Mid, true),
            Err(RouterError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_first_tier_success_does_not_escalate() {
        let c = CascadeController::new(all_tiers(EchoMode::Echo, EchoMode::Echo, EchoMode::Echo));
        let out = c.run("hello", Tier::Cheap, false, &ignore).await.unwrap();
        assert_eq!(out.result.backend_tier, Tier::Cheap);
        assert_eq!(out.escalations(), 0);
        assert_eq!(
            out.trace,
            vec![
                CascadeState::Selected,
                CascadeState::Executing,
                CascadeState::Succeeded
            ]
        );
    }

    #[tokio::test]
    async fn test_escalates_cheap_to_mid_to_premium() {
        let c = CascadeController::new(all_tiers(
            EchoMode::Fail(ErrorKind::Unavailable),
            EchoMode::Fail(ErrorKind::Timeout),
            EchoMode::Reply("premium answer".into()),
        ));
        let out = c.run("hard", Tier::Cheap, false, &ignore).await.unwrap();
        assert_eq!(out.result.backend_tier, Tier::Premium);
        assert_eq!(out.result.response_text, "premium answer");
        assert_eq!(out.executions.len(), 3);
        assert_eq!(out.escalations(), 2);
    }

    #[tokio::test]
    async fn test_all_tiers_failing_lists_every_attempt() {
        let c = CascadeController::new(all_tiers(
            EchoMode::Fail(ErrorKind::Unavailable),
            EchoMode::Fail(ErrorKind::QuotaExceeded),
            EchoMode::Fail(ErrorKind::InvalidResponse),
        ));
        let failure = c.run("x", Tier::Cheap, false, &ignore).await.unwrap_err();
        match failure.error {
            RouterError::ExhaustedFailed { attempts } => {
                let tiers: Vec<_> = attempts.iter().map(|a| a.tier).collect();
                assert_eq!(tiers, vec![Tier::Cheap, Tier::Mid, Tier::Premium]);
                assert_eq!(attempts[1].kind, ErrorKind::QuotaExceeded);
            }
            other => panic!("expected ExhaustedFailed, got {other:?}"),
        }
        assert_eq!(failure.executions.len(), 3);
    }

    #[tokio::test]
    async fn test_forced_plan_does_not_escalate() {
        let c = CascadeController::new(all_tiers(
            EchoMode::Fail(ErrorKind::Timeout),
            EchoMode::Echo,
            EchoMode::Echo,
        ));
        let failure = c.run("x", Tier::Cheap, true, &ignore).await.unwrap_err();
        assert_eq!(failure.error, RouterError::BackendTimeout { tier: Tier::Cheap });
        assert_eq!(failure.executions.len(), 1);
    }

    #[tokio::test]
    async fn test_quality_gate_rejection_escalates() {
        let gate = |_: &str, r: &ExecutionResult| r.backend_tier != Tier::Cheap;
        let c = CascadeController::new(all_tiers(EchoMode::Echo, EchoMode::Echo, EchoMode::Echo))
            .with_quality_gate(Arc::new(gate));
        let out = c.run("x", Tier::Cheap, false, &ignore).await.unwrap();
        assert_eq!(out.result.backend_tier, Tier::Mid);
        assert_eq!(
            out.executions[0].error_kind,
            Some(ErrorKind::QualityRejected)
        );
    }

    #[tokio::test]
    async fn test_observer_sees_attempts_before_cascade_is_dropped() {
        let gate = |_: &str, r: &ExecutionResult| r.backend_tier != Tier::Mid;
        let c = CascadeController::new(all_tiers(
            EchoMode::Fail(ErrorKind::Unavailable),
            EchoMode::Echo,
            EchoMode::Hang,
        ))
        .with_quality_gate(Arc::new(gate));

        let seen = parking_lot::Mutex::new(Vec::new());
        let observe = |r: &ExecutionResult| seen.lock().push((r.backend_tier, r.succeeded));
        let run = c.run("x", Tier::Cheap, false, &observe);
        assert!(tokio::time::timeout(Duration::from_millis(50), run)
            .await
            .is_err());

        assert_eq!(
            *seen.lock(),
            vec![(Tier::Cheap, false), (Tier::Mid, true)]
        );
    }

    #[tokio::test]
    async fn test_quality_gate_on_last_tier_accepts() {
        let c = CascadeController::new(all_tiers(EchoMode::Echo, EchoMode::Echo, EchoMode::Echo))
            .with_quality_gate(Arc::new(MinLengthGate { min_chars: 1_000 }));
        let out = c.run("short", Tier::Premium, false, &ignore).await.unwrap();
        assert_eq!(out.result.backend_tier, Tier::Premium);
        assert_eq!(out.executions.len(), 1);
    }
}
