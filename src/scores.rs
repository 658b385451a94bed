//! The five fixed judge dimensions and their score records.
//!
//! Every evaluator in the crate (piggyback judge, arena judge, regression
//! gate) scores on the same five dimensions so results stay comparable
//! across stages.

use serde::{Deserialize, Serialize};

/// Quality dimensions, scored 1-10 each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Dimension {
    /// Are suggestions tied to specific visible garments, not generic?
    Specificity,
    /// Decisive editorial voice, no hedging.
    VoiceConsistency,
    /// Concrete, doable advice.
    Actionability,
    /// Suggestions stay within the detected style lane.
    StyleAlignment,
    /// Feedback addresses the stated occasion.
    OccasionFit,
}

pub const JUDGE_DIMENSIONS: [Dimension; 5] = [
    Dimension::Specificity,
    Dimension::VoiceConsistency,
    Dimension::Actionability,
    Dimension::StyleAlignment,
    Dimension::OccasionFit,
];

impl Dimension {
    /// Key used in oracle JSON and bus payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            Dimension::Specificity => "specificity",
            Dimension::VoiceConsistency => "voiceConsistency",
            Dimension::Actionability => "actionability",
            Dimension::StyleAlignment => "styleAlignment",
            Dimension::OccasionFit => "occasionFit",
        }
    }

    /// Canned advice string published with the daily bottom-dimension insight.
    pub fn advice(self) -> &'static str {
        match self {
            Dimension::Specificity => {
                "surgeon should focus on making suggestions reference specific visible garments"
            }
            Dimension::VoiceConsistency => {
                "surgeon should strengthen voice guidelines to eliminate hedging language"
            }
            Dimension::Actionability => "surgeon should add more concrete next-step examples",
            Dimension::StyleAlignment => {
                "surgeon should strengthen style lane rules to prevent cross-lane suggestions"
            }
            Dimension::OccasionFit => {
                "surgeon should improve occasion mapping in the dress code section"
            }
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One evaluated item's scores across the five dimensions plus overall.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeScores {
    pub specificity: f64,
    pub voice_consistency: f64,
    pub actionability: f64,
    pub style_alignment: f64,
    pub occasion_fit: f64,
    #[serde(default)]
    pub overall: f64,
}

impl JudgeScores {
    pub fn get(&self, dim: Dimension) -> f64 {
        match dim {
            Dimension::Specificity => self.specificity,
            Dimension::VoiceConsistency => self.voice_consistency,
            Dimension::Actionability => self.actionability,
            Dimension::StyleAlignment => self.style_alignment,
            Dimension::OccasionFit => self.occasion_fit,
        }
    }

    fn set(&mut self, dim: Dimension, value: f64) {
        match dim {
            Dimension::Specificity => self.specificity = value,
            Dimension::VoiceConsistency => self.voice_consistency = value,
            Dimension::Actionability => self.actionability = value,
            Dimension::StyleAlignment => self.style_alignment = value,
            Dimension::OccasionFit => self.occasion_fit = value,
        }
    }

    /// Mean per dimension across a batch. Empty input yields a neutral 7.0
    /// on every dimension, matching the judge's no-data default.
    pub fn aggregate(batch: &[JudgeScores]) -> JudgeScores {
        let mut agg = JudgeScores {
            specificity: 7.0,
            voice_consistency: 7.0,
            actionability: 7.0,
            style_alignment: 7.0,
            occasion_fit: 7.0,
            overall: 7.0,
        };
        if batch.is_empty() {
            return agg;
        }
        let n = batch.len() as f64;
        for dim in JUDGE_DIMENSIONS {
            let sum: f64 = batch.iter().map(|s| s.get(dim)).sum();
            agg.set(dim, sum / n);
        }
        agg.overall = batch.iter().map(|s| s.overall).sum::<f64>() / n;
        agg
    }

    /// The single lowest-scoring dimension.
    pub fn bottom_dimension(&self) -> Dimension {
        let mut bottom = Dimension::Specificity;
        let mut bottom_score = f64::INFINITY;
        for dim in JUDGE_DIMENSIONS {
            let score = self.get(dim);
            if score < bottom_score {
                bottom_score = score;
                bottom = dim;
            }
        }
        bottom
    }
}

/// Follow-up Q&A quality dimensions, the smaller parallel measurement
/// stream used by the follow-up critic and surgeon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpDimension {
    ContextualRelevance,
    EditorialVoice,
    Actionability,
}

pub const FOLLOWUP_DIMENSIONS: [FollowUpDimension; 3] = [
    FollowUpDimension::ContextualRelevance,
    FollowUpDimension::EditorialVoice,
    FollowUpDimension::Actionability,
];

impl FollowUpDimension {
    pub fn as_str(self) -> &'static str {
        match self {
            FollowUpDimension::ContextualRelevance => "contextual_relevance",
            FollowUpDimension::EditorialVoice => "editorial_voice",
            FollowUpDimension::Actionability => "actionability",
        }
    }

    /// The follow-up prompt section responsible for this dimension.
    pub fn section_key(self) -> &'static str {
        match self {
            FollowUpDimension::ContextualRelevance => "followup_context_rules",
            FollowUpDimension::EditorialVoice => "followup_persona",
            FollowUpDimension::Actionability => "followup_response_format",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn aggregate_means_per_dimension() {
        let agg = JudgeScores::aggregate(&[scores(6.0), scores(8.0)]);
        assert!((agg.specificity - 7.0).abs() < 1e-9);
        assert!((agg.overall - 7.0).abs() < 1e-9);
    }

    #[test]
    fn aggregate_of_empty_batch_is_neutral() {
        let agg = JudgeScores::aggregate(&[]);
        for dim in JUDGE_DIMENSIONS {
            assert!((agg.get(dim) - 7.0).abs() < 1e-9);
        }
    }

    #[test]
    fn bottom_dimension_picks_lowest() {
        let mut s = scores(8.0);
        s.style_alignment = 5.5;
        assert_eq!(s.bottom_dimension(), Dimension::StyleAlignment);
    }

    #[test]
    fn serde_uses_camel_case_keys() {
        let json = serde_json::to_string(&scores(7.0)).unwrap();
        assert!(json.contains("voiceConsistency"));
        assert!(json.contains("occasionFit"));
    }
}
