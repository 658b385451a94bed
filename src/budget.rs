//! Daily token budget gate.
//!
//! Every oracle call in the improvement loop goes through one shared
//! [`TokenBudget`]. The gate enforces two rules: a call whose estimate does
//! not fit in what remains today is denied outright, and lower-priority work
//! is cut off progressively as the day's spend grows. Denial is silent from
//! the caller's perspective: `tracked_generate` returns `None` and the agent
//! skips its work until tomorrow.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, Utc};
use tracing::{debug, warn};

use crate::oracle::{GenerationRequest, GenerationResponse, Oracle};
use crate::store::LoopStore;

/// Default daily ceiling in tokens.
pub const DEFAULT_DAILY_BUDGET: u64 = 500_000;

/// Spend thresholds that progressively shed lower-priority work.
///
/// A tier stays eligible while remaining budget exceeds its threshold:
/// tier 1 runs until the ceiling is hit, tier 5 work stops once fewer than
/// 350k tokens remain.
pub const PRIORITY_THRESHOLDS: [(u8, u64); 5] = [
    (1, 0),
    (2, 100_000),
    (3, 180_000),
    (4, 250_000),
    (5, 350_000),
];

fn threshold_for(tier: u8) -> u64 {
    PRIORITY_THRESHOLDS
        .iter()
        .find(|(t, _)| *t == tier)
        .map(|(_, v)| *v)
        // Unknown tiers are treated as the most expendable.
        .unwrap_or(PRIORITY_THRESHOLDS[4].1)
}

struct DayState {
    date: NaiveDate,
    spent: u64,
    breakdown: BTreeMap<String, u64>,
}

impl DayState {
    fn fresh(date: NaiveDate) -> Self {
        Self {
            date,
            spent: 0,
            breakdown: BTreeMap::new(),
        }
    }
}

/// Shared day-scoped token counter with priority gating.
pub struct TokenBudget {
    ceiling: u64,
    state: Mutex<DayState>,
    store: Option<Arc<LoopStore>>,
}

impl TokenBudget {
    pub fn new(ceiling: u64) -> Self {
        Self {
            ceiling,
            state: Mutex::new(DayState::fresh(Utc::now().date_naive())),
            store: None,
        }
    }

    /// Read the ceiling from TAILOR_DAILY_TOKEN_BUDGET, falling back to the
    /// default.
    pub fn from_env() -> Self {
        let ceiling = std::env::var("TAILOR_DAILY_TOKEN_BUDGET")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_DAILY_BUDGET);
        Self::new(ceiling)
    }

    /// Attach a store and restore today's spend from it, so a process
    /// restart does not reset the day's counter.
    pub async fn with_store(mut self, store: Arc<LoopStore>) -> Self {
        let today = Utc::now().date_naive().to_string();
        match store.get_daily_usage(&today).await {
            Ok(Some((spent, breakdown))) => {
                let breakdown: BTreeMap<String, u64> =
                    serde_json::from_str(&breakdown).unwrap_or_default();
                let mut state = self.lock_state();
                state.spent = spent.max(0) as u64;
                state.breakdown = breakdown;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to restore daily token usage"),
        }
        self.store = Some(store);
        self
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    pub fn spent_today(&self) -> u64 {
        let mut state = self.lock_state();
        roll_day(&mut state);
        state.spent
    }

    pub fn remaining(&self) -> u64 {
        self.ceiling.saturating_sub(self.spent_today())
    }

    /// Spend per label for today, for the status surface.
    pub fn breakdown(&self) -> BTreeMap<String, u64> {
        let mut state = self.lock_state();
        roll_day(&mut state);
        state.breakdown.clone()
    }

    /// Whether work of the given priority tier is still eligible today.
    pub fn has_budget(&self, tier: u8) -> bool {
        self.remaining() > threshold_for(tier)
    }

    /// Run one oracle call under the budget.
    ///
    /// Denies the call, with no side effects, if the estimate does not fit
    /// in the remainder of today's ceiling. On success, debits the tokens
    /// the provider actually reported. On oracle failure nothing is debited
    /// and the caller sees `None`, same as a denial.
    pub async fn tracked_generate(
        &self,
        oracle: &dyn Oracle,
        req: &GenerationRequest,
        estimated_tokens: u64,
    ) -> Option<GenerationResponse> {
        {
            let mut state = self.lock_state();
            roll_day(&mut state);
            if state.spent + estimated_tokens > self.ceiling {
                debug!(
                    label = req.label,
                    estimated_tokens,
                    spent = state.spent,
                    ceiling = self.ceiling,
                    "budget denied oracle call"
                );
                return None;
            }
        }

        match oracle.generate(req).await {
            Ok(resp) => {
                let actual = resp.total_tokens();
                let (date, spent, breakdown) = {
                    let mut state = self.lock_state();
                    roll_day(&mut state);
                    state.spent += actual;
                    *state.breakdown.entry(req.label.to_string()).or_insert(0) += actual;
                    (
                        state.date.to_string(),
                        state.spent,
                        serde_json::to_string(&state.breakdown).unwrap_or_else(|_| "{}".into()),
                    )
                };
                if let Some(store) = &self.store {
                    if let Err(e) = store
                        .upsert_daily_usage(&date, self.ceiling as i64, spent as i64, &breakdown)
                        .await
                    {
                        warn!(error = %e, "failed to persist daily token usage");
                    }
                }
                Some(resp)
            }
            Err(e) => {
                warn!(label = req.label, code = e.code(), error = %e, "oracle call failed under budget");
                None
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, DayState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn roll_day(state: &mut DayState) {
    let today = Utc::now().date_naive();
    if state.date != today {
        *state = DayState::fresh(today);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{OracleError, ScriptedOracle};

    fn request(label: &'static str) -> GenerationRequest {
        GenerationRequest::prompt("test/model", "hello", label)
    }

    #[test]
    fn tiers_gate_on_remaining_budget() {
        let budget = TokenBudget::new(300_000);
        // Nothing spent: everything eligible.
        for tier in 1..=4 {
            assert!(budget.has_budget(tier), "tier {tier} should be eligible");
        }
        // 300k ceiling leaves less than the 350k tier-5 floor from the start.
        assert!(!budget.has_budget(5));
    }

    #[tokio::test]
    async fn spend_sheds_tiers_progressively() {
        let budget = TokenBudget::new(300_000);
        let oracle = ScriptedOracle::new();
        oracle.push_text("ok", 260_000);

        let resp = budget
            .tracked_generate(&oracle, &request("test"), 260_000)
            .await;
        assert!(resp.is_some());

        // 40k remaining: tier 1 still runs, tier 4 (250k floor) is denied.
        assert_eq!(budget.remaining(), 40_000);
        assert!(budget.has_budget(1));
        assert!(!budget.has_budget(4));
    }

    #[tokio::test]
    async fn denial_has_no_side_effects() {
        let budget = TokenBudget::new(10_000);
        let oracle = ScriptedOracle::new();
        oracle.push_text("never consumed", 500);

        let resp = budget
            .tracked_generate(&oracle, &request("test"), 11_000)
            .await;
        assert!(resp.is_none());
        assert_eq!(budget.spent_today(), 0);
        // The oracle was never invoked.
        assert_eq!(oracle.call_count(), 0);
    }

    #[tokio::test]
    async fn debits_actual_tokens_not_estimate() {
        let budget = TokenBudget::new(100_000);
        let oracle = ScriptedOracle::new();
        oracle.push_text("short reply", 1_200);

        budget
            .tracked_generate(&oracle, &request("piggyback-judge"), 7_000)
            .await
            .unwrap();
        assert_eq!(budget.spent_today(), 1_200);
        assert_eq!(budget.breakdown()["piggyback-judge"], 1_200);
    }

    #[tokio::test]
    async fn oracle_failure_debits_nothing() {
        let budget = TokenBudget::new(100_000);
        let oracle = ScriptedOracle::new();
        oracle.push_error(OracleError::provider("test", "boom", false));

        let resp = budget
            .tracked_generate(&oracle, &request("test"), 5_000)
            .await;
        assert!(resp.is_none());
        assert_eq!(budget.spent_today(), 0);
        assert_eq!(oracle.call_count(), 1);
    }

    #[tokio::test]
    async fn cumulative_spend_never_exceeds_ceiling() {
        let budget = TokenBudget::new(20_000);
        let oracle = ScriptedOracle::new();
        for _ in 0..10 {
            oracle.push_text("ok", 5_000);
        }

        let mut granted = 0;
        for _ in 0..10 {
            if budget
                .tracked_generate(&oracle, &request("test"), 5_000)
                .await
                .is_some()
            {
                granted += 1;
            }
        }
        assert_eq!(granted, 4);
        assert_eq!(budget.spent_today(), 20_000);
    }
}
