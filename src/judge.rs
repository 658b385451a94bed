//! Piggyback judge: scores recent production analyses in one batched call.
//!
//! "Piggyback" because measurement rides on traffic that already happened.
//! The judge never generates new analyses; it reads unscored ones, scores
//! them on the five dimensions, and publishes a daily aggregate for the
//! critic to consume. Already-scored items are never re-selected, so the
//! pass is idempotent by construction.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use crate::budget::TokenBudget;
use crate::bus::{BusEvent, IntelligenceBus};
use crate::oracle::{decode_array, GenerationRequest, Oracle};
use crate::scores::{Dimension, JudgeScores};
use crate::store::{Analysis, LoopStore, StoreError};

/// Only analyses from the last 48 hours are eligible.
const SAMPLE_WINDOW_SECS: i64 = 48 * 60 * 60;
/// At most this many items per pass, to bound the batch prompt.
const SAMPLE_LIMIT: usize = 30;
/// Token estimate submitted to the budget gate.
const TOKEN_ESTIMATE: u64 = 7_000;
/// Feedback longer than this is truncated in the batch prompt.
const FEEDBACK_SNIPPET_CHARS: usize = 600;

pub const JUDGE_TIER: u8 = 1;

#[derive(Debug)]
pub enum JudgeOutcome {
    /// Nothing unevaluated in the window.
    NoSamples,
    /// The budget gate denied the call (or the oracle failed).
    BudgetDenied,
    /// The oracle answered but produced no usable scores.
    ParseFailed,
    Evaluated(JudgeSummary),
}

#[derive(Debug, Clone)]
pub struct JudgeSummary {
    pub evaluated: usize,
    pub aggregate: JudgeScores,
    pub bottom_dimension: Dimension,
}

/// One item's scores as returned by the oracle. `index` refers to the
/// 1-based numbering in the batch prompt.
#[derive(Debug, Deserialize)]
struct ScoredItem {
    index: usize,
    #[serde(flatten)]
    scores: JudgeScores,
}

pub struct PiggybackJudge {
    store: Arc<LoopStore>,
    bus: IntelligenceBus,
    budget: Arc<TokenBudget>,
    oracle: Arc<dyn Oracle>,
    model: String,
}

impl PiggybackJudge {
    pub fn new(
        store: Arc<LoopStore>,
        budget: Arc<TokenBudget>,
        oracle: Arc<dyn Oracle>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            bus: IntelligenceBus::new(store.clone()),
            store,
            budget,
            oracle,
            model: model.into(),
        }
    }

    pub async fn run(&self) -> Result<JudgeOutcome, StoreError> {
        if !self.budget.has_budget(JUDGE_TIER) {
            return Ok(JudgeOutcome::BudgetDenied);
        }

        let since = crate::store::now_epoch() - SAMPLE_WINDOW_SECS;
        let batch = self.store.unevaluated_analyses(since, SAMPLE_LIMIT).await?;
        if batch.is_empty() {
            return Ok(JudgeOutcome::NoSamples);
        }

        let req = GenerationRequest::prompt(
            &self.model,
            batch_prompt(&batch),
            "piggyback-judge",
        )
        .max_output_tokens(3_000)
        .json();

        let resp = match self
            .budget
            .tracked_generate(self.oracle.as_ref(), &req, TOKEN_ESTIMATE)
            .await
        {
            Some(resp) => resp,
            None => return Ok(JudgeOutcome::BudgetDenied),
        };

        let items: Vec<ScoredItem> = match decode_array(&resp.text) {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "judge response did not decode");
                return Ok(JudgeOutcome::ParseFailed);
            }
        };

        // Persist per item; one bad row must not sink the rest of the batch.
        let mut scored = Vec::new();
        for item in items {
            let Some(analysis) = item.index.checked_sub(1).and_then(|i| batch.get(i)) else {
                warn!(index = item.index, "judge returned out-of-range index");
                continue;
            };
            match self.store.set_judge_scores(&analysis.id, &item.scores).await {
                Ok(()) => scored.push(item.scores),
                Err(e) => {
                    warn!(analysis_id = %analysis.id, error = %e, "failed to persist judge scores")
                }
            }
        }

        if scored.is_empty() {
            return Ok(JudgeOutcome::ParseFailed);
        }

        let aggregate = JudgeScores::aggregate(&scored);
        let bottom = aggregate.bottom_dimension();

        let event = BusEvent::PiggybackScores {
            date: Utc::now().date_naive().to_string(),
            sample_size: scored.len(),
            aggregate,
            bottom_dimension: bottom.as_str().to_string(),
            top_insight: bottom.advice().to_string(),
        };
        if let Err(e) = self.bus.publish("piggyback-judge", &event).await {
            warn!(error = %e, "failed to publish judge aggregate");
        }

        info!(
            evaluated = scored.len(),
            bottom = %bottom,
            overall = aggregate.overall,
            "piggyback judge pass complete"
        );
        Ok(JudgeOutcome::Evaluated(JudgeSummary {
            evaluated: scored.len(),
            aggregate,
            bottom_dimension: bottom,
        }))
    }
}

fn batch_prompt(batch: &[Analysis]) -> String {
    let mut out = String::with_capacity(batch.len() * 256);
    out.push_str(
        "You are auditing outfit feedback written by a fashion stylist AI. \
         Score each item 1-10 on: specificity (references specific visible garments), \
         voiceConsistency (decisive editorial voice, no hedging), actionability \
         (concrete, doable advice), styleAlignment (stays within the outfit's style \
         lane), occasionFit (addresses the stated occasion), and overall.\n\n",
    );
    for (i, analysis) in batch.iter().enumerate() {
        let snippet: String = analysis.feedback.chars().take(FEEDBACK_SNIPPET_CHARS).collect();
        out.push_str(&format!(
            "--- Item {} ---\nOccasion: {}\nSetting: {}\nVibe: {}\nAI score: {:.1}\nFeedback: {}\n\n",
            i + 1,
            analysis.occasion,
            analysis.setting,
            analysis.vibe,
            analysis.ai_score,
            snippet,
        ));
    }
    out.push_str(
        "Respond with only a JSON array, one object per item: \
         [{\"index\": 1, \"specificity\": 7, \"voiceConsistency\": 8, \
         \"actionability\": 6, \"styleAlignment\": 7, \"occasionFit\": 8, \
         \"overall\": 7}, ...]",
    );
    out
}
