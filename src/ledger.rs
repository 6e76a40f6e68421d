//! Cost accounting.
//!
//! [`CostLedger`] is an append-only log of what each backend call cost.
//! Records are never edited; a correction is a new
//! [`RecordKind::Compensation`] record carrying a negative amount.
//!
//! The ledger also reports savings against an all-premium baseline: what
//! the same tokens would have cost had every request gone to the premium
//! tier.
//!
//! Aggregations are computed in micro-dollars (1 USD = 1 000 000
//! micro-dollars) to avoid floating-point drift over long-running sums.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::ExecutionResult;
use crate::{metrics, Tier};

/// Whether a record bills or corrects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// A billed backend call. `cost >= 0`.
    Charge,
    /// A correction of earlier charges. `cost <= 0`.
    Compensation,
}

/// One immutable ledger line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// Tier the cost is attributed to.
    pub backend_tier: Tier,
    /// Signed USD amount.
    pub cost: f64,
    /// When the record was appended.
    pub timestamp: DateTime<Utc>,
    /// Request the record belongs to.
    pub request_id: String,
    /// Charge or compensation.
    pub kind: RecordKind,
    /// Tokens billed (zero for compensations).
    pub tokens: u64,
}

/// Aggregate view of the ledger at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSnapshot {
    /// Net spend in USD, compensations included.
    pub total_cost_usd: f64,
    /// Net spend per tier.
    pub cost_by_tier: BTreeMap<Tier, f64>,
    /// Charge records per tier.
    pub requests_by_tier: BTreeMap<Tier, u64>,
    /// Total billed tokens.
    pub total_tokens: u64,
    /// What the billed tokens would have cost on the premium tier.
    pub baseline_cost_usd: f64,
    /// `baseline - actual`, floored at zero.
    pub savings_usd: f64,
    /// Savings as a percentage of the baseline.
    pub savings_percent: f64,
    /// Cheap charges as a fraction of cheap + premium charges.
    pub cheap_premium_ratio: f64,
    /// Number of records in the log.
    pub record_count: usize,
}

/// Append-only, thread-safe cost log.
///
/// Writers take a short exclusive lock to push one record; readers take a
/// shared lock. No record is ever modified after it is appended.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug, Default)]
pub struct CostLedger {
    records: RwLock<Vec<LedgerRecord>>,
    /// Premium price per 1K tokens, in micro-dollars, for the savings baseline.
    premium_rate_micro: i64,
}

impl CostLedger {
    /// Create an empty ledger with no savings baseline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty ledger whose savings baseline prices every billed
    /// token at `premium_cost_per_1k` USD per 1 000 tokens.
    pub fn with_premium_baseline(premium_cost_per_1k: f64) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            premium_rate_micro: f64_to_micro(premium_cost_per_1k.max(0.0)),
        }
    }

    /// Append a charge. Negative costs are clamped to zero; use
    /// [`CostLedger::compensate`] for corrections.
    pub fn record(&self, tier: Tier, cost: f64, tokens: u64, request_id: &str) {
        let cost = if cost.is_finite() { cost.max(0.0) } else { 0.0 };
        metrics::add_cost(cost);
        debug!(tier = %tier, cost, tokens, request_id, "ledger charge");
        self.push(LedgerRecord {
            backend_tier: tier,
            cost,
            timestamp: Utc::now(),
            request_id: request_id.to_string(),
            kind: RecordKind::Charge,
            tokens,
        });
    }

    /// Append a charge for an executed attempt.
    ///
    /// Successful attempts are always recorded. Failed attempts are
    /// recorded only when they reported a billed cost.
    ///
    /// Returns `true` if a record was appended.
    pub fn record_execution(&self, result: &ExecutionResult, request_id: &str) -> bool {
        if !result.succeeded && result.actual_cost <= 0.0 {
            return false;
        }
        self.record(
            result.backend_tier,
            result.actual_cost,
            result.tokens,
            request_id,
        );
        true
    }

    /// Append a compensating record that reduces net spend on `tier` by
    /// `amount` USD.
    pub fn compensate(&self, tier: Tier, amount: f64, request_id: &str) {
        let amount = if amount.is_finite() { amount.abs() } else { 0.0 };
        info!(tier = %tier, amount, request_id, "ledger compensation");
        self.push(LedgerRecord {
            backend_tier: tier,
            cost: -amount,
            timestamp: Utc::now(),
            request_id: request_id.to_string(),
            kind: RecordKind::Compensation,
            tokens: 0,
        });
    }

    fn push(&self, record: LedgerRecord) {
        self.records.write().push(record);
    }

    /// Net spend over the last `window`, or over all time when `None`.
    pub fn total_cost(&self, window: Option<Duration>) -> f64 {
        let since = window_start(window);
        let micro: i64 = self
            .records
            .read()
            .iter()
            .filter(|r| in_window(r, since))
            .map(|r| f64_to_micro(r.cost))
            .sum();
        micro_to_f64(micro)
    }

    /// Net spend per tier over the last `window`, or over all time when `None`.
    pub fn cost_by_tier(&self, window: Option<Duration>) -> BTreeMap<Tier, f64> {
        let since = window_start(window);
        let mut micro: BTreeMap<Tier, i64> = BTreeMap::new();
        for r in self.records.read().iter().filter(|r| in_window(r, since)) {
            *micro.entry(r.backend_tier).or_default() += f64_to_micro(r.cost);
        }
        micro
            .into_iter()
            .map(|(tier, m)| (tier, micro_to_f64(m)))
            .collect()
    }

    /// Number of charge records per tier.
    pub fn requests_by_tier(&self) -> BTreeMap<Tier, u64> {
        let mut counts = BTreeMap::new();
        for r in self
            .records
            .read()
            .iter()
            .filter(|r| r.kind == RecordKind::Charge)
        {
            *counts.entry(r.backend_tier).or_default() += 1;
        }
        counts
    }

    /// Fraction of cheap-tier charges among cheap and premium charges.
    ///
    /// `1.0` means everything stayed cheap, `0.0` means everything went
    /// premium (or nothing was charged yet). Mid-tier usage is excluded.
    pub fn tier_usage_ratio(&self) -> f64 {
        let counts = self.requests_by_tier();
        let cheap = counts.get(&Tier::Cheap).copied().unwrap_or(0);
        let premium = counts.get(&Tier::Premium).copied().unwrap_or(0);
        if cheap + premium == 0 {
            0.0
        } else {
            cheap as f64 / (cheap + premium) as f64
        }
    }

    /// A clone of every record, oldest first.
    pub fn records(&self) -> Vec<LedgerRecord> {
        self.records.read().clone()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// `true` if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Aggregate statistics, including savings against the all-premium
    /// baseline.
    pub fn snapshot(&self) -> CostSnapshot {
        let records = self.records.read();

        let mut total_micro: i64 = 0;
        let mut tier_micro: BTreeMap<Tier, i64> = BTreeMap::new();
        let mut requests_by_tier: BTreeMap<Tier, u64> = BTreeMap::new();
        let mut total_tokens: u64 = 0;
        for r in records.iter() {
            let m = f64_to_micro(r.cost);
            total_micro += m;
            *tier_micro.entry(r.backend_tier).or_default() += m;
            if r.kind == RecordKind::Charge {
                *requests_by_tier.entry(r.backend_tier).or_default() += 1;
                total_tokens += r.tokens;
            }
        }
        let record_count = records.len();
        drop(records);

        let baseline_micro =
            (total_tokens as i128 * self.premium_rate_micro as i128 / 1000) as i64;
        let savings_micro = (baseline_micro - total_micro).max(0);
        let cheap = requests_by_tier.get(&Tier::Cheap).copied().unwrap_or(0);
        let premium = requests_by_tier.get(&Tier::Premium).copied().unwrap_or(0);

        CostSnapshot {
            total_cost_usd: micro_to_f64(total_micro),
            cost_by_tier: tier_micro
                .into_iter()
                .map(|(t, m)| (t, micro_to_f64(m)))
                .collect(),
            requests_by_tier,
            total_tokens,
            baseline_cost_usd: micro_to_f64(baseline_micro),
            savings_usd: micro_to_f64(savings_micro),
            savings_percent: if baseline_micro > 0 {
                savings_micro as f64 / baseline_micro as f64 * 100.0
            } else {
                0.0
            },
            cheap_premium_ratio: if cheap + premium > 0 {
                cheap as f64 / (cheap + premium) as f64
            } else {
                0.0
            },
            record_count,
        }
    }
}

fn window_start(window: Option<Duration>) -> Option<DateTime<Utc>> {
    let window = chrono::Duration::from_std(window?).ok()?;
    Utc::now().checked_sub_signed(window)
}

fn in_window(record: &LedgerRecord, since: Option<DateTime<Utc>>) -> bool {
    since.map_or(true, |s| record.timestamp >= s)
}

/// Convert USD to micro-dollars.
fn f64_to_micro(usd: f64) -> i64 {
    (usd * 1_000_000.0).round() as i64
}

/// Convert micro-dollars to USD.
fn micro_to_f64(micro: i64) -> f64 {
    micro as f64 / 1_000_000.0
}
