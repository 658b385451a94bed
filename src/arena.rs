//! Arena: self-play validation and the regression gate.
//!
//! The arena is the sole authority on whether a drafted section version may
//! go live. A candidate must beat the current baseline head-to-head across a
//! scenario set AND hold the line on the fixed regression suite; the
//! conjunction is deliberate, since a candidate can win comparisons while
//! quietly regressing a previously fixed edge case.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::budget::TokenBudget;
use crate::bus::{BusEvent, IntelligenceBus};
use crate::oracle::{decode_array, decode_object, GenerationRequest, Oracle};
use crate::scores::{JudgeScores, JUDGE_DIMENSIONS};
use crate::sections::SectionLibrary;
use crate::store::{LoopStore, MatchWinner, StoreError};

/// Challenger must win strictly more than this share of matches.
pub const WIN_RATE_THRESHOLD: f64 = 0.55;
/// Scenarios per session.
pub const SCENARIO_COUNT: usize = 12;
/// Live samples drawn from recent evaluated analyses.
const LIVE_SCENARIO_LIMIT: usize = 6;
/// Regression suite size.
pub const REGRESSION_CASE_LIMIT: usize = 20;
/// Largest tolerated per-dimension drop against a frozen baseline.
pub const REGRESSION_TOLERANCE: f64 = 1.0;

const GENERATE_TOKEN_ESTIMATE: u64 = 8_000;
const JUDGE_TOKEN_ESTIMATE: u64 = 8_000;
const REGRESSION_TOKEN_ESTIMATE: u64 = 6_000;

/// Terminal result of one arena session.
#[derive(Debug, Clone)]
pub struct ArenaVerdict {
    pub session_id: i64,
    pub win_rate: f64,
    pub match_count: usize,
    pub regression_passed: bool,
    pub should_deploy: bool,
    pub summary: String,
}

impl ArenaVerdict {
    fn no_deploy(session_id: i64, summary: impl Into<String>) -> Self {
        Self {
            session_id,
            win_rate: 0.0,
            match_count: 0,
            regression_passed: false,
            should_deploy: false,
            summary: summary.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct Scenario {
    id: String,
    source: &'static str,
    occasion: String,
    setting: String,
    vibe: String,
    outfit: Option<&'static str>,
}

/// Hand-authored scenarios that top up the set when few live samples exist.
fn synthetic_scenarios() -> Vec<Scenario> {
    const LIBRARY: [(&str, &str, &str); 8] = [
        ("syn_1", "job interview tech startup", "Navy slacks, light pink button-down, brown belt, brown dress shoes"),
        ("syn_2", "cocktail party", "Black fitted dress, gold statement necklace, black heels"),
        ("syn_3", "hanging with friends", "Oversized graphic hoodie, baggy cargo pants, Air Force 1s, crossbody bag"),
        ("syn_4", "brunch", "Light blue jeans, white t-shirt, olive bomber jacket, white sneakers"),
        ("syn_5", "gym session", "Black compression leggings, oversized gray cotton tee, neon green running shoes"),
        ("syn_6", "first date dinner", "Dark wash jeans, silk blouse, strappy heels, small gold clutch"),
        ("syn_7", "office work from home", "Oversized blazer, cropped white tee, straight leg jeans, white sneakers"),
        ("syn_8", "music festival", "Crochet crop top, denim cutoff shorts, cowboy boots, layered necklaces"),
    ];
    LIBRARY
        .iter()
        .map(|(id, occasion, outfit)| Scenario {
            id: (*id).to_string(),
            source: "synthetic",
            occasion: (*occasion).to_string(),
            setting: String::new(),
            vibe: String::new(),
            outfit: Some(*outfit),
        })
        .collect()
}

pub struct Arena {
    store: Arc<LoopStore>,
    sections: SectionLibrary,
    bus: IntelligenceBus,
    budget: Arc<TokenBudget>,
    oracle: Arc<dyn Oracle>,
    model: String,
}

impl Arena {
    pub fn new(
        store: Arc<LoopStore>,
        budget: Arc<TokenBudget>,
        oracle: Arc<dyn Oracle>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            sections: SectionLibrary::new(store.clone()),
            bus: IntelligenceBus::new(store.clone()),
            store,
            budget,
            oracle,
            model: model.into(),
        }
    }

    /// Validate one candidate section version against the live baseline.
    ///
    /// The session row is created before any generation so aborted runs
    /// still leave an audit trail. Budget denial mid-session is a normal
    /// outcome: the session ends `failed` and the verdict says do not
    /// deploy, but no error propagates.
    pub async fn run_session(
        &self,
        section_key: &str,
        candidate_version: i64,
        candidate_content: &str,
        trigger: &str,
    ) -> Result<ArenaVerdict, StoreError> {
        let baseline_version = self
            .sections
            .active(section_key)
            .await?
            .map(|s| s.version)
            .unwrap_or(0);

        let session_id = self
            .store
            .create_arena_session(section_key, candidate_version, baseline_version, trigger)
            .await?;
        info!(
            session_id,
            section_key, candidate_version, baseline_version, "arena session started"
        );

        let baseline_prompt = self.sections.assemble_containing(section_key).await?;
        let candidate_prompt = self
            .sections
            .assemble_with_override(section_key, candidate_version, candidate_content)
            .await?;

        let scenarios = self.gather_scenarios().await?;

        let Some(baseline_responses) = self
            .generate_batch(&baseline_prompt.text, &scenarios, "arena-generate-baseline")
            .await
        else {
            let summary = "Token budget exhausted (baseline generation)";
            self.store.fail_arena_session(session_id, summary).await?;
            self.publish_result(session_id, section_key, candidate_version, 0.0, false, false)
                .await;
            return Ok(ArenaVerdict::no_deploy(session_id, summary));
        };

        let Some(challenger_responses) = self
            .generate_batch(&candidate_prompt.text, &scenarios, "arena-generate-candidate")
            .await
        else {
            let summary = "Token budget exhausted (candidate generation)";
            self.store.fail_arena_session(session_id, summary).await?;
            self.publish_result(session_id, section_key, candidate_version, 0.0, false, false)
                .await;
            return Ok(ArenaVerdict::no_deploy(session_id, summary));
        };

        let outcomes = self
            .judge_matches(session_id, &scenarios, &baseline_responses, &challenger_responses)
            .await?;

        let wins = outcomes
            .iter()
            .filter(|w| **w == MatchWinner::Challenger)
            .count();
        // Ties stay in the denominator: an indecisive challenger is not a winner.
        let win_rate = if outcomes.is_empty() {
            0.0
        } else {
            wins as f64 / outcomes.len() as f64
        };

        let regression_passed = self.run_regression(&candidate_prompt.text).await?;
        let should_deploy = win_rate > WIN_RATE_THRESHOLD && regression_passed;

        let summary = format!(
            "Win rate: {:.0}% ({}/{}). Regression: {}. Deploy: {}",
            win_rate * 100.0,
            wins,
            outcomes.len(),
            if regression_passed { "PASS" } else { "FAIL" },
            if should_deploy { "YES" } else { "NO" },
        );
        self.store
            .complete_arena_session(
                session_id,
                win_rate,
                outcomes.len() as i64,
                regression_passed,
                should_deploy,
                &summary,
            )
            .await?;
        self.publish_result(
            session_id,
            section_key,
            candidate_version,
            win_rate,
            regression_passed,
            should_deploy,
        )
        .await;

        info!(session_id, %summary, "arena session complete");
        Ok(ArenaVerdict {
            session_id,
            win_rate,
            match_count: outcomes.len(),
            regression_passed,
            should_deploy,
            summary,
        })
    }

    async fn gather_scenarios(&self) -> Result<Vec<Scenario>, StoreError> {
        let live = self
            .store
            .evaluated_analyses_since(0, LIVE_SCENARIO_LIMIT)
            .await?;
        let mut scenarios: Vec<Scenario> = live
            .into_iter()
            .map(|a| Scenario {
                id: a.id,
                source: "live",
                occasion: a.occasion,
                setting: a.setting,
                vibe: a.vibe,
                outfit: None,
            })
            .collect();
        for s in synthetic_scenarios() {
            if scenarios.len() >= SCENARIO_COUNT {
                break;
            }
            scenarios.push(s);
        }
        scenarios.truncate(SCENARIO_COUNT);
        Ok(scenarios)
    }

    /// One batched generation over all scenarios. None means the budget
    /// denied the call, the oracle failed, or the reply did not decode.
    async fn generate_batch(
        &self,
        prompt: &str,
        scenarios: &[Scenario],
        label: &'static str,
    ) -> Option<BTreeMap<String, String>> {
        let mut text = format!(
            "{prompt}\n\n---\n\nYou will be asked to evaluate multiple outfits. For each, \
             provide a brief editorial assessment (2-3 sentences). Focus on the most \
             important observation.\n\n"
        );
        for (i, s) in scenarios.iter().enumerate() {
            text.push_str(&format!("OUTFIT {} (ID: {}):\nOccasion: {}\n", i + 1, s.id, s.occasion));
            if let Some(outfit) = s.outfit {
                text.push_str(&format!("Visible outfit: {outfit}\n"));
            }
            if !s.vibe.is_empty() {
                text.push_str(&format!("Vibe: {}\n", s.vibe));
            }
            text.push('\n');
        }
        text.push_str(
            "Return JSON: {\"responses\": {\"<id>\": \"<2-3 sentence editorial assessment>\", ...}}",
        );

        let req = GenerationRequest::prompt(&self.model, text, label)
            .max_output_tokens(2_500)
            .json();
        let resp = self
            .budget
            .tracked_generate(self.oracle.as_ref(), &req, GENERATE_TOKEN_ESTIMATE)
            .await?;

        #[derive(Deserialize)]
        struct BatchResponses {
            #[serde(default)]
            responses: BTreeMap<String, String>,
        }
        match decode_object::<BatchResponses>(&resp.text) {
            Ok(parsed) => Some(parsed.responses),
            Err(e) => {
                warn!(label, error = %e, "batched generation did not decode");
                None
            }
        }
    }

    /// Blind pairwise judging, one batched call. Sides are labeled A and B
    /// so the judge cannot favor the incumbent.
    async fn judge_matches(
        &self,
        session_id: i64,
        scenarios: &[Scenario],
        baseline: &BTreeMap<String, String>,
        challenger: &BTreeMap<String, String>,
    ) -> Result<Vec<MatchWinner>, StoreError> {
        let mut text = String::from(
            "You are a fashion editorial quality judge comparing two AI fashion assistant \
             responses.\n\nFor each outfit scenario below, you will see Response A and \
             Response B. Judge which is better on these criteria:\n\
             - More specific to the outfit described\n\
             - Better editorial voice (decisive, no hedging)\n\
             - More actionable advice\n\
             - Better style lane alignment\n\
             - More appropriate for the occasion\n\n",
        );
        for (i, s) in scenarios.iter().enumerate() {
            let a = baseline.get(&s.id).map(String::as_str).unwrap_or("No response");
            let b = challenger.get(&s.id).map(String::as_str).unwrap_or("No response");
            text.push_str(&format!(
                "Scenario {} (ID: {}):\nOutfit context: {}{}\nResponse A: {a}\nResponse B: {b}\n---\n",
                i + 1,
                s.id,
                s.occasion,
                s.outfit.map(|o| format!(" - {o}")).unwrap_or_default(),
            ));
        }
        text.push_str(
            "Return ONLY a JSON array: [{\"id\": \"<scenario_id>\", \"winner\": \"A\" or \
             \"B\" or \"tie\", \"reason\": \"<one sentence>\"}, ...]",
        );

        let req = GenerationRequest::prompt(&self.model, text, "arena-judge")
            .max_output_tokens(2_000)
            .json();
        let Some(resp) = self
            .budget
            .tracked_generate(self.oracle.as_ref(), &req, JUDGE_TOKEN_ESTIMATE)
            .await
        else {
            warn!(session_id, "arena judging denied or failed, no matches recorded");
            return Ok(Vec::new());
        };

        #[derive(Deserialize)]
        struct Comparison {
            id: String,
            winner: String,
            #[serde(default)]
            reason: String,
        }
        let comparisons: Vec<Comparison> = match decode_array(&resp.text) {
            Ok(c) => c,
            Err(e) => {
                warn!(session_id, error = %e, "arena judge response did not decode");
                return Ok(Vec::new());
            }
        };

        let mut outcomes = Vec::new();
        for comp in comparisons {
            let Some(scenario) = scenarios.iter().find(|s| s.id == comp.id) else {
                warn!(session_id, id = %comp.id, "judge referenced unknown scenario");
                continue;
            };
            let winner = match comp.winner.as_str() {
                "B" => MatchWinner::Challenger,
                "A" => MatchWinner::Baseline,
                _ => MatchWinner::Tie,
            };
            self.store
                .insert_arena_match(
                    session_id,
                    &scenario.occasion,
                    scenario.source,
                    &scenario.occasion,
                    &scenario.setting,
                    &scenario.vibe,
                    baseline.get(&scenario.id).map(String::as_str).unwrap_or(""),
                    challenger.get(&scenario.id).map(String::as_str).unwrap_or(""),
                    winner,
                    &comp.reason,
                )
                .await?;
            outcomes.push(winner);
        }
        Ok(outcomes)
    }

    /// Replay the fixed suite against the candidate prompt. One violation
    /// fails the whole gate; no averaging can mask a localized regression.
    /// An empty suite passes by default (bootstrap state).
    async fn run_regression(&self, candidate_prompt: &str) -> Result<bool, StoreError> {
        let cases = self
            .store
            .active_regression_cases(REGRESSION_CASE_LIMIT)
            .await?;
        if cases.is_empty() {
            info!("no regression cases seeded, passing by default");
            return Ok(true);
        }

        let mut text = format!(
            "{candidate_prompt}\n\nEvaluate these outfit scenarios. For each, score 1-10 \
             on: specificity, voiceConsistency, actionability, styleAlignment, occasionFit.\n\n"
        );
        for (i, c) in cases.iter().enumerate() {
            text.push_str(&format!(
                "Case {} (ID: {}): occasion: {}, setting: {}, vibe: {}, outfit: {}\n",
                i + 1,
                c.id,
                c.occasion,
                c.setting,
                c.vibe,
                c.context_snapshot,
            ));
        }
        text.push_str(
            "Return JSON array: [{\"id\": <case id>, \"scores\": {\"specificity\": <n>, \
             \"voiceConsistency\": <n>, \"actionability\": <n>, \"styleAlignment\": <n>, \
             \"occasionFit\": <n>}}]",
        );

        let req = GenerationRequest::prompt(&self.model, text, "arena-regression")
            .max_output_tokens(1_500)
            .json();
        let Some(resp) = self
            .budget
            .tracked_generate(self.oracle.as_ref(), &req, REGRESSION_TOKEN_ESTIMATE)
            .await
        else {
            warn!("regression replay denied or failed, passing by default");
            return Ok(true);
        };

        #[derive(Deserialize)]
        struct CaseScores {
            id: i64,
            scores: RegressionScores,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RegressionScores {
            specificity: f64,
            voice_consistency: f64,
            actionability: f64,
            style_alignment: f64,
            occasion_fit: f64,
        }

        let replayed: Vec<CaseScores> = match decode_array(&resp.text) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "regression response did not decode, passing by default");
                return Ok(true);
            }
        };

        for replay in &replayed {
            let Some(case) = cases.iter().find(|c| c.id == replay.id) else {
                continue;
            };
            let new = JudgeScores {
                specificity: replay.scores.specificity,
                voice_consistency: replay.scores.voice_consistency,
                actionability: replay.scores.actionability,
                style_alignment: replay.scores.style_alignment,
                occasion_fit: replay.scores.occasion_fit,
                overall: 0.0,
            };
            for dim in JUDGE_DIMENSIONS {
                let drop = case.baseline_scores.get(dim) - new.get(dim);
                if drop > REGRESSION_TOLERANCE {
                    warn!(
                        case = %case.name,
                        dimension = %dim,
                        baseline = case.baseline_scores.get(dim),
                        replayed = new.get(dim),
                        "regression gate failed"
                    );
                    return Ok(false);
                }
            }
        }

        info!(cases = cases.len(), "regression gate passed");
        Ok(true)
    }

    /// Re-score the suite against the current active prompt and freeze the
    /// results as new baselines. Only run this when the current prompt is
    /// known-good; calibrating after a bad deploy blesses the regression.
    pub async fn calibrate_baselines(&self) -> Result<usize, StoreError> {
        let cases = self
            .store
            .active_regression_cases(REGRESSION_CASE_LIMIT)
            .await?;
        if cases.is_empty() {
            return Ok(0);
        }

        let current = self.sections.assemble().await?;
        let mut text = format!(
            "{}\n\nEvaluate these outfit scenarios on 5 dimensions (1-10 each): \
             specificity, voiceConsistency, actionability, styleAlignment, occasionFit.\n\n",
            current.text
        );
        for (i, c) in cases.iter().enumerate() {
            text.push_str(&format!(
                "Case {} (ID: {}): occasion: {}, setting: {}, vibe: {}, outfit: {}\n",
                i + 1,
                c.id,
                c.occasion,
                c.setting,
                c.vibe,
                c.context_snapshot,
            ));
        }
        text.push_str(
            "Return JSON: [{\"id\": <id>, \"scores\": {\"specificity\": <n>, \
             \"voiceConsistency\": <n>, \"actionability\": <n>, \"styleAlignment\": <n>, \
             \"occasionFit\": <n>}}]",
        );

        let req = GenerationRequest::prompt(&self.model, text, "regression-calibrate")
            .max_output_tokens(1_500)
            .json();
        let Some(resp) = self
            .budget
            .tracked_generate(self.oracle.as_ref(), &req, REGRESSION_TOKEN_ESTIMATE)
            .await
        else {
            return Ok(0);
        };

        #[derive(Deserialize)]
        struct CaseScores {
            id: i64,
            scores: JudgeScores,
        }
        let baselines: Vec<CaseScores> = match decode_array(&resp.text) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "calibration response did not decode");
                return Ok(0);
            }
        };

        let mut updated = 0;
        for nb in &baselines {
            if !cases.iter().any(|c| c.id == nb.id) {
                continue;
            }
            match self.store.update_regression_baseline(nb.id, &nb.scores).await {
                Ok(()) => updated += 1,
                Err(e) => warn!(case_id = nb.id, error = %e, "failed to update baseline"),
            }
        }
        info!(updated, "regression baselines calibrated");
        Ok(updated)
    }

    async fn publish_result(
        &self,
        session_id: i64,
        section_key: &str,
        candidate_version: i64,
        win_rate: f64,
        regression_passed: bool,
        deployed: bool,
    ) {
        let event = BusEvent::ArenaResult {
            session_id,
            section_key: section_key.to_string(),
            candidate_version,
            win_rate,
            regression_passed,
            deployed,
        };
        if let Err(e) = self.bus.publish("arena", &event).await {
            warn!(error = %e, "failed to publish arena result");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::ScriptedOracle;
    use crate::store::{SectionOrigin, SessionStatus};

    fn scores(v: f64) -> JudgeScores {
        JudgeScores {
            specificity: v,
            voice_consistency: v,
            actionability: v,
            style_alignment: v,
            occasion_fit: v,
            overall: v,
        }
    }

    async fn fixture(budget_tokens: u64) -> (Arena, Arc<LoopStore>, Arc<ScriptedOracle>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LoopStore::new(dir.path().join("loop.sqlite")).unwrap());
        let oracle = Arc::new(ScriptedOracle::new());
        let budget = Arc::new(TokenBudget::new(budget_tokens));
        let arena = Arena::new(store.clone(), budget, oracle.clone(), "test/model");

        // Minimal baseline sections.
        let lib = SectionLibrary::new(store.clone());
        for key in ["voice_persona", "styling_moves"] {
            lib.create_version(key, &format!("[{key}]"), SectionOrigin::Manual, "seed", None)
                .await
                .unwrap();
            lib.activate(key, 1, None).await.unwrap();
        }
        (arena, store, oracle, dir)
    }

    fn responses_json(ids: &[&str]) -> String {
        let body = ids
            .iter()
            .map(|id| format!(r#""{id}": "Editorial note for {id}.""#))
            .collect::<Vec<_>>()
            .join(", ");
        format!(r#"{{"responses": {{{body}}}}}"#)
    }

    fn verdicts_json(outcomes: &[(&str, &str)]) -> String {
        let body = outcomes
            .iter()
            .map(|(id, w)| format!(r#"{{"id": "{id}", "winner": "{w}", "reason": "r"}}"#))
            .collect::<Vec<_>>()
            .join(", ");
        format!("[{body}]")
    }

    fn synthetic_ids() -> Vec<&'static str> {
        vec!["syn_1", "syn_2", "syn_3", "syn_4", "syn_5", "syn_6", "syn_7", "syn_8"]
    }

    #[tokio::test]
    async fn challenger_deploys_on_wins_and_clean_regression() {
        let (arena, store, oracle, _dir) = fixture(500_000).await;
        let ids = synthetic_ids();
        oracle.push_text(responses_json(&ids), 6_000);
        oracle.push_text(responses_json(&ids), 6_000);
        // 5 challenger wins, 2 baseline, 1 tie out of 8: 0.625 > 0.55.
        let outcomes: Vec<(&str, &str)> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, if i < 5 { "B" } else if i < 7 { "A" } else { "tie" }))
            .collect();
        oracle.push_text(verdicts_json(&outcomes), 5_000);

        let verdict = arena
            .run_session("styling_moves", 2, "[candidate moves]", "surgeon")
            .await
            .unwrap();

        assert_eq!(verdict.match_count, 8);
        assert!((verdict.win_rate - 0.625).abs() < 1e-9);
        assert!(verdict.regression_passed); // empty suite passes by default
        assert!(verdict.should_deploy);

        let session = store.get_arena_session(verdict.session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.match_count, 8);
        assert_eq!(store.matches_for_session(verdict.session_id).await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn ties_count_against_the_challenger() {
        let (arena, _store, oracle, _dir) = fixture(500_000).await;
        let ids = synthetic_ids();
        oracle.push_text(responses_json(&ids), 6_000);
        oracle.push_text(responses_json(&ids), 6_000);
        // 4 wins, 0 losses, 4 ties: 4/8 = 0.5, below threshold.
        let outcomes: Vec<(&str, &str)> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, if i < 4 { "B" } else { "tie" }))
            .collect();
        oracle.push_text(verdicts_json(&outcomes), 5_000);

        let verdict = arena
            .run_session("styling_moves", 2, "[candidate]", "surgeon")
            .await
            .unwrap();
        assert!((verdict.win_rate - 0.5).abs() < 1e-9);
        assert!(!verdict.should_deploy);
    }

    #[tokio::test]
    async fn budget_denial_fails_session_without_error() {
        let (arena, store, oracle, _dir) = fixture(1_000).await;

        let verdict = arena
            .run_session("styling_moves", 2, "[candidate]", "surgeon")
            .await
            .unwrap();

        assert!(!verdict.should_deploy);
        assert_eq!(oracle.call_count(), 0);
        let session = store.get_arena_session(verdict.session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session.summary.unwrap().contains("budget"));
    }

    #[tokio::test]
    async fn one_regressed_dimension_blocks_deploy_despite_wins() {
        let (arena, store, oracle, _dir) = fixture(500_000).await;
        let case_id = store
            .insert_regression_case("first date", "first date dinner", "wine bar", "date night", "navy blazer, white tee", &scores(8.0))
            .await
            .unwrap();

        let ids = synthetic_ids();
        oracle.push_text(responses_json(&ids), 6_000);
        oracle.push_text(responses_json(&ids), 6_000);
        // Challenger sweeps every match.
        let outcomes: Vec<(&str, &str)> = ids.iter().map(|id| (*id, "B")).collect();
        oracle.push_text(verdicts_json(&outcomes), 5_000);
        // Replay drops specificity 8.0 -> 6.5, beyond the 1.0 tolerance.
        oracle.push_text(
            format!(
                r#"[{{"id": {case_id}, "scores": {{"specificity": 6.5, "voiceConsistency": 9, "actionability": 9, "styleAlignment": 9, "occasionFit": 9}}}}]"#
            ),
            4_000,
        );

        let verdict = arena
            .run_session("styling_moves", 2, "[candidate]", "surgeon")
            .await
            .unwrap();
        assert!((verdict.win_rate - 1.0).abs() < 1e-9);
        assert!(!verdict.regression_passed);
        assert!(!verdict.should_deploy);
    }

    #[tokio::test]
    async fn drop_within_tolerance_passes() {
        let (arena, store, oracle, _dir) = fixture(500_000).await;
        let case_id = store
            .insert_regression_case("brunch", "brunch", "cafe", "casual", "jeans, tee, bomber", &scores(8.0))
            .await
            .unwrap();

        let ids = synthetic_ids();
        oracle.push_text(responses_json(&ids), 6_000);
        oracle.push_text(responses_json(&ids), 6_000);
        let outcomes: Vec<(&str, &str)> = ids.iter().map(|id| (*id, "B")).collect();
        oracle.push_text(verdicts_json(&outcomes), 5_000);
        // Exactly 1.0 drop is tolerated; the gate fails only beyond it.
        oracle.push_text(
            format!(
                r#"[{{"id": {case_id}, "scores": {{"specificity": 7, "voiceConsistency": 8, "actionability": 8, "styleAlignment": 8, "occasionFit": 8}}}}]"#
            ),
            4_000,
        );

        let verdict = arena
            .run_session("styling_moves", 2, "[candidate]", "surgeon")
            .await
            .unwrap();
        assert!(verdict.regression_passed);
        assert!(verdict.should_deploy);
    }

    #[tokio::test]
    async fn live_samples_top_up_with_synthetic() {
        let (arena, store, oracle, _dir) = fixture(500_000).await;
        for i in 0..4 {
            let id = format!("live-{i}");
            store
                .insert_analysis(&id, "dinner", "restaurant", "smart casual", 7.0, "Good fit.")
                .await
                .unwrap();
            store.set_judge_scores(&id, &scores(7.5)).await.unwrap();
        }

        // 4 live + 8 synthetic = 12 scenarios.
        let mut ids: Vec<String> = (0..4).map(|i| format!("live-{i}")).collect();
        ids.extend(synthetic_ids().iter().map(|s| s.to_string()));
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();

        oracle.push_text(responses_json(&id_refs), 6_000);
        oracle.push_text(responses_json(&id_refs), 6_000);
        // 7 wins, 4 losses, 1 tie: 7/12 ≈ 0.583.
        let outcomes: Vec<(&str, &str)> = id_refs
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, if i < 7 { "B" } else if i < 11 { "A" } else { "tie" }))
            .collect();
        oracle.push_text(verdicts_json(&outcomes), 5_000);

        let verdict = arena
            .run_session("styling_moves", 2, "[candidate]", "surgeon")
            .await
            .unwrap();
        assert_eq!(verdict.match_count, 12);
        assert!((verdict.win_rate - 7.0 / 12.0).abs() < 1e-9);
        assert!(verdict.should_deploy);

        let matches = store.matches_for_session(verdict.session_id).await.unwrap();
        assert_eq!(matches.iter().filter(|m| m.scenario_source == "live").count(), 4);
    }

    #[tokio::test]
    async fn calibration_overwrites_baselines() {
        let (arena, store, oracle, _dir) = fixture(500_000).await;
        let case_id = store
            .insert_regression_case("gym", "gym session", "gym", "athletic", "leggings, tee", &scores(6.0))
            .await
            .unwrap();
        oracle.push_text(
            format!(
                r#"[{{"id": {case_id}, "scores": {{"specificity": 8, "voiceConsistency": 8, "actionability": 8, "styleAlignment": 8, "occasionFit": 8, "overall": 8}}}}]"#
            ),
            4_000,
        );

        assert_eq!(arena.calibrate_baselines().await.unwrap(), 1);
        let cases = store.active_regression_cases(20).await.unwrap();
        assert!((cases[0].baseline_scores.specificity - 8.0).abs() < 1e-9);
    }
}
