//! Critic agent: turns judge scores into structured, section-mapped critiques.
//!
//! Runs over a 7-day window of bus aggregates plus raw scored analyses. If
//! every dimension averages at or above the healthy threshold the critic
//! produces nothing at all; silence is the correct output for a healthy
//! prompt.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use crate::budget::TokenBudget;
use crate::bus::{BusEvent, IntelligenceBus};
use crate::oracle::{decode_object, GenerationRequest, Oracle};
use crate::scores::{FollowUpDimension, JUDGE_DIMENSIONS};
use crate::store::{Analysis, LoopStore, StoreError, Weakness};

/// Dimensions averaging below this across the window count as weak.
const WEAK_MEAN_THRESHOLD: f64 = 7.5;
/// Individual item scores below this count as weak examples.
const WEAK_ITEM_THRESHOLD: f64 = 6.0;
/// Diagnosis window.
const WINDOW_SECS: i64 = 7 * 24 * 60 * 60;
/// Raw analyses scanned per run.
const RAW_SAMPLE_LIMIT: usize = 50;
/// Weak examples quoted in the critique prompt.
const EXAMPLE_LIMIT: usize = 8;
/// Token estimate for the single batched critique call.
const TOKEN_ESTIMATE: u64 = 10_000;

pub const CRITIC_TIER: u8 = 1;
pub const FOLLOWUP_CRITIC_TIER: u8 = 2;

/// Which prompt sections each dimension's quality flows from. First entry is
/// the primary suspect, handed to the surgeon.
pub const DIMENSION_TO_SECTION: [(&str, &[&str]); 5] = [
    ("specificity", &["styling_moves", "examples", "analysis_scoring"]),
    ("voiceConsistency", &["voice_persona", "voice_examples"]),
    ("actionability", &["styling_moves", "examples"]),
    ("styleAlignment", &["style_lanes", "style_coherence"]),
    ("occasionFit", &["occasion_dress_codes", "seasonal_practical"]),
];

pub fn sections_for_dimension(dimension: &str) -> &'static [&'static str] {
    DIMENSION_TO_SECTION
        .iter()
        .find(|(d, _)| *d == dimension)
        .map(|(_, s)| *s)
        .unwrap_or(&[])
}

/// Map a window mean to 0..=5 severity. 7.5 is healthy (0); every half point
/// below adds one step; 5.0 and below saturate at 5.
pub fn severity_for_mean(mean: f64) -> u8 {
    let raw = ((WEAK_MEAN_THRESHOLD - mean) * 2.0).ceil();
    raw.clamp(0.0, 5.0) as u8
}

#[derive(Debug)]
pub enum CriticOutcome {
    BudgetDenied,
    /// No judge aggregates in the window yet.
    NoSignals,
    /// Every dimension at or above threshold. Nothing to critique.
    Healthy,
    Critiqued(CritiqueSummary),
}

#[derive(Debug, Clone)]
pub struct CritiqueSummary {
    pub critique_id: i64,
    pub weaknesses: Vec<Weakness>,
    pub top_section: String,
    pub top_severity: u8,
    pub summary: String,
}

/// The surgeon's work order: the single worst section and why.
#[derive(Debug, Clone)]
pub struct CritiqueTarget {
    pub critique_id: i64,
    pub section_key: String,
    pub dimension: String,
    pub severity: u8,
    pub pattern: String,
}

#[derive(Debug, Deserialize)]
struct CritiqueLlmOutput {
    #[serde(default)]
    patterns: BTreeMap<String, String>,
    #[serde(default)]
    summary: Option<String>,
}

pub struct CriticAgent {
    store: Arc<LoopStore>,
    bus: IntelligenceBus,
    budget: Arc<TokenBudget>,
    oracle: Arc<dyn Oracle>,
    model: String,
}

impl CriticAgent {
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

    pub async fn run(&self) -> Result<CriticOutcome, StoreError> {
        if !self.budget.has_budget(CRITIC_TIER) {
            return Ok(CriticOutcome::BudgetDenied);
        }

        let now = crate::store::now_epoch();
        let since = now - WINDOW_SECS;

        // Daily aggregates published by the judge.
        let aggregates = self.bus.read_recent("piggyback_scores", since, 7).await?;
        if aggregates.is_empty() {
            return Ok(CriticOutcome::NoSignals);
        }

        // Window mean per dimension across the daily aggregates.
        let mut weak_dimensions: Vec<(String, f64)> = Vec::new();
        for dim in JUDGE_DIMENSIONS {
            let values: Vec<f64> = aggregates
                .iter()
                .filter_map(|r| match &r.event {
                    BusEvent::PiggybackScores { aggregate, .. } => Some(aggregate.get(dim)),
                    _ => None,
                })
                .collect();
            if values.is_empty() {
                continue;
            }
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            if mean < WEAK_MEAN_THRESHOLD {
                weak_dimensions.push((dim.as_str().to_string(), mean));
            }
        }

        if weak_dimensions.is_empty() {
            info!("all dimensions at or above threshold, no critique needed");
            return Ok(CriticOutcome::Healthy);
        }
        weak_dimensions.sort_by(|a, b| a.1.total_cmp(&b.1));

        // Raw weak items illustrating the two worst dimensions.
        let raw = self
            .store
            .evaluated_analyses_since(since, RAW_SAMPLE_LIMIT)
            .await?;
        let top_weak: Vec<&str> = weak_dimensions
            .iter()
            .take(2)
            .map(|(d, _)| d.as_str())
            .collect();
        let examples: Vec<&Analysis> = raw
            .iter()
            .filter(|a| {
                a.judge_scores.as_ref().is_some_and(|s| {
                    JUDGE_DIMENSIONS.iter().any(|dim| {
                        top_weak.contains(&dim.as_str()) && s.get(*dim) < WEAK_ITEM_THRESHOLD
                    })
                })
            })
            .take(EXAMPLE_LIMIT)
            .collect();

        let req = GenerationRequest::prompt(
            &self.model,
            critique_prompt(&weak_dimensions, &examples),
            "critic-analysis",
        )
        .max_output_tokens(1_500)
        .json();

        let resp = match self
            .budget
            .tracked_generate(self.oracle.as_ref(), &req, TOKEN_ESTIMATE)
            .await
        {
            Some(resp) => resp,
            None => return Ok(CriticOutcome::BudgetDenied),
        };

        // Pattern sentences are color, not structure. A response that does
        // not decode falls back to threshold boilerplate.
        let llm: Option<CritiqueLlmOutput> = match decode_object(&resp.text) {
            Ok(out) => Some(out),
            Err(e) => {
                warn!(error = %e, "critique response did not decode, using fallback patterns");
                None
            }
        };

        let weaknesses: Vec<Weakness> = weak_dimensions
            .iter()
            .map(|(dim, mean)| Weakness {
                dimension: dim.clone(),
                avg_score: *mean,
                affected_sections: sections_for_dimension(dim)
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                pattern: llm
                    .as_ref()
                    .and_then(|o| o.patterns.get(dim).cloned())
                    .unwrap_or_else(|| format!("{dim} scoring below threshold")),
                severity: severity_for_mean(*mean),
            })
            .collect();

        let mut section_mappings: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut severity_scores: BTreeMap<String, u8> = BTreeMap::new();
        for w in &weaknesses {
            for section in &w.affected_sections {
                section_mappings
                    .entry(section.clone())
                    .or_default()
                    .push(w.dimension.clone());
                let entry = severity_scores.entry(section.clone()).or_insert(0);
                *entry = (*entry).max(w.severity);
            }
        }

        let (top_section, top_severity) = severity_scores
            .iter()
            .max_by_key(|(_, sev)| **sev)
            .map(|(s, sev)| (s.clone(), *sev))
            .unwrap_or_else(|| ("voice_persona".to_string(), 0));

        let critique_id = self
            .store
            .insert_critique(&weaknesses, &section_mappings, &severity_scores, since, now)
            .await?;

        for w in &weaknesses {
            let event = BusEvent::CritiqueFinding {
                critique_id,
                dimension: w.dimension.clone(),
                avg_score: w.avg_score,
                affected_sections: w.affected_sections.clone(),
                severity: w.severity,
            };
            if let Err(e) = self.bus.publish("critic-agent", &event).await {
                warn!(error = %e, "failed to publish critique finding");
            }
        }

        let summary = llm.and_then(|o| o.summary).unwrap_or_else(|| {
            format!(
                "Found {} weak dimensions, {top_section} needs most attention",
                weaknesses.len()
            )
        });
        info!(
            critique_id,
            weaknesses = weaknesses.len(),
            top_section = %top_section,
            top_severity,
            "critique recorded"
        );

        Ok(CriticOutcome::Critiqued(CritiqueSummary {
            critique_id,
            weaknesses,
            top_section,
            top_severity,
            summary,
        }))
    }

    /// The surgeon pulls its work order here: the highest-severity section
    /// from the most recent unconsumed critique.
    pub async fn top_unaddressed_critique(&self) -> Result<Option<CritiqueTarget>, StoreError> {
        let Some(report) = self.store.latest_unaddressed_critique().await? else {
            return Ok(None);
        };

        let Some((section_key, severity)) = report
            .severity_scores
            .iter()
            .max_by_key(|(_, sev)| **sev)
            .map(|(s, sev)| (s.clone(), *sev))
        else {
            return Ok(None);
        };

        let dimension = report
            .section_mappings
            .get(&section_key)
            .and_then(|dims| dims.first())
            .cloned()
            .unwrap_or_else(|| "specificity".to_string());
        let pattern = report
            .weaknesses
            .iter()
            .find(|w| w.affected_sections.contains(&section_key))
            .map(|w| w.pattern.clone())
            .unwrap_or_else(|| format!("{dimension} scoring below threshold"));

        Ok(Some(CritiqueTarget {
            critique_id: report.id,
            section_key,
            dimension,
            severity,
            pattern,
        }))
    }

    pub async fn mark_addressed(&self, critique_id: i64) -> Result<bool, StoreError> {
        self.store.mark_critique_addressed(critique_id).await
    }

    /// Follow-up measurement pass: scores recent Q&A pairs on the three
    /// follow-up dimensions and publishes the weakest one.
    pub async fn run_follow_up(&self) -> Result<CriticOutcome, StoreError> {
        if !self.budget.has_budget(FOLLOWUP_CRITIC_TIER) {
            return Ok(CriticOutcome::BudgetDenied);
        }

        let since = crate::store::now_epoch() - WINDOW_SECS;
        let follow_ups = self.store.recent_follow_ups(since, 10).await?;
        if follow_ups.is_empty() {
            return Ok(CriticOutcome::NoSignals);
        }

        let mut prompt = String::from(
            "Evaluate these fashion follow-up Q&A pairs on 3 dimensions (1-10 each):\n\
             - contextual_relevance: does the answer directly address the specific question?\n\
             - editorial_voice: decisive, specific, no hedging?\n\
             - actionability: concrete, usable advice?\n\n",
        );
        for (i, f) in follow_ups.iter().enumerate() {
            prompt.push_str(&format!("Q{}: {}\nA{}: {}\n\n", i + 1, f.question, i + 1, f.answer));
        }
        prompt.push_str(
            "Return JSON: {\"avgScores\": {\"contextual_relevance\": <n>, \
             \"editorial_voice\": <n>, \"actionability\": <n>}, \
             \"weakestDimension\": \"<name>\", \"pattern\": \"<what causes weakness>\"}",
        );

        let req = GenerationRequest::prompt(&self.model, prompt, "followup-critic")
            .max_output_tokens(500)
            .json();
        let resp = match self
            .budget
            .tracked_generate(self.oracle.as_ref(), &req, 4_000)
            .await
        {
            Some(resp) => resp,
            None => return Ok(CriticOutcome::BudgetDenied),
        };

        #[derive(Deserialize)]
        struct FollowUpLlmOutput {
            #[serde(rename = "avgScores")]
            avg_scores: BTreeMap<String, f64>,
            #[serde(rename = "weakestDimension")]
            weakest_dimension: String,
        }

        let parsed: FollowUpLlmOutput = match decode_object(&resp.text) {
            Ok(out) => out,
            Err(e) => {
                warn!(error = %e, "follow-up critique response did not decode");
                return Ok(CriticOutcome::NoSignals);
            }
        };

        let score_of = |d: FollowUpDimension| {
            parsed.avg_scores.get(d.as_str()).copied().unwrap_or(7.0)
        };
        let event = BusEvent::FollowUpScores {
            date: Utc::now().date_naive().to_string(),
            sample_size: follow_ups.len(),
            contextual_relevance: score_of(FollowUpDimension::ContextualRelevance),
            editorial_voice: score_of(FollowUpDimension::EditorialVoice),
            actionability: score_of(FollowUpDimension::Actionability),
            weakest: parsed.weakest_dimension.clone(),
        };
        if let Err(e) = self.bus.publish("followup-critic", &event).await {
            warn!(error = %e, "failed to publish follow-up scores");
        }

        info!(weakest = %parsed.weakest_dimension, "follow-up critic pass complete");
        Ok(CriticOutcome::Critiqued(CritiqueSummary {
            critique_id: 0,
            weaknesses: Vec::new(),
            top_section: FollowUpDimension::ContextualRelevance.section_key().to_string(),
            top_severity: 0,
            summary: format!("Follow-up {} averaging below threshold", parsed.weakest_dimension),
        }))
    }
}

fn critique_prompt(weak_dimensions: &[(String, f64)], examples: &[&Analysis]) -> String {
    let dim_list = weak_dimensions
        .iter()
        .map(|(d, avg)| format!("- {d}: avg {avg:.1}/10"))
        .collect::<Vec<_>>()
        .join("\n");

    let mut example_block = String::new();
    for (i, a) in examples.iter().enumerate() {
        let scores = a
            .judge_scores
            .as_ref()
            .and_then(|s| serde_json::to_string(s).ok())
            .unwrap_or_else(|| "{}".to_string());
        example_block.push_str(&format!(
            "Example {}:\nOccasion: {}, Vibe: {}\nFeedback: {}\nJudge scores: {}\n---\n",
            i + 1,
            a.occasion,
            a.vibe,
            a.feedback.chars().take(400).collect::<String>(),
            scores,
        ));
    }

    let pattern_keys = weak_dimensions
        .iter()
        .take(2)
        .map(|(d, _)| format!("\"{d}\": \"<one sentence: what pattern causes low scores>\""))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "You are analyzing patterns in AI fashion feedback quality. These dimensions \
         are scoring below {WEAK_MEAN_THRESHOLD}/10:\n\n{dim_list}\n\n\
         Here are {} weak analyses:\n{example_block}\n\
         Analyze WHY each dimension is weak. What patterns explain the low scores?\n\n\
         Return JSON: {{\"patterns\": {{{pattern_keys}}}, \
         \"summary\": \"<one sentence overall critique summary>\"}}",
        examples.len(),
    )
}
