//! Surgeon: the only agent that edits prompt sections.
//!
//! Two modes. Reactive takes the critic's top unaddressed finding and drafts
//! a targeted fix; proactive picks a section weighted toward ones not
//! touched recently and drafts exploratory variants. Every draft is created
//! inactive and goes live only if the arena gate says deploy. Rejected
//! drafts land in the section's genealogy so later edits do not retry the
//! same direction.

use std::sync::Arc;

use rand::Rng;
use serde::Deserialize;
use tracing::{info, warn};

use crate::arena::{Arena, ArenaVerdict, WIN_RATE_THRESHOLD};
use crate::budget::TokenBudget;
use crate::bus::{BusEvent, IntelligenceBus};
use crate::critic::{CriticAgent, CritiqueTarget};
use crate::oracle::{decode_object, GenerationRequest, Oracle};
use crate::sections::{SectionLibrary, FOLLOWUP_SECTION_KEYS, SECTION_KEYS};
use crate::store::{LoopStore, PromptSection, SectionOrigin, StoreError};

pub const SURGEON_TIER: u8 = 1;
pub const MUTATION_TIER: u8 = 2;
pub const EVENING_TIER: u8 = 3;
pub const ADDITIONAL_MUTATIONS_TIER: u8 = 4;
pub const FOLLOWUP_SURGEON_TIER: u8 = 3;
pub const EXAMPLE_ROTATION_TIER: u8 = 2;

const EDIT_TOKEN_ESTIMATE: u64 = 7_000;
const FOLLOWUP_EDIT_TOKEN_ESTIMATE: u64 = 5_000;
const FOLLOWUP_MUTATION_TOKEN_ESTIMATE: u64 = 4_000;
const ROTATION_TOKEN_ESTIMATE: u64 = 7_000;

/// Example rotation only fires when some vibe averages at or below this.
const ROTATION_SCORE_THRESHOLD: f64 = 7.0;
const ROTATION_WINDOW_SECS: i64 = 7 * 24 * 60 * 60;
const ROTATION_SAMPLE_LIMIT: usize = 30;
/// Failed directions quoted back in the mutation prompt.
const FAILED_ATTEMPT_CONTEXT: usize = 3;

#[derive(Debug, Clone)]
pub enum SurgeonOutcome {
    BudgetDenied,
    /// No critique to fix, no section to mutate, or the draft did not parse.
    NothingToDo,
    Deployed {
        section_key: String,
        version: i64,
        win_rate: f64,
    },
    Rejected {
        section_key: String,
        version: i64,
        reason: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SectionEdit {
    improved_content: String,
    #[serde(default)]
    changelog: String,
}

#[derive(Debug, Deserialize)]
struct MutationVariant {
    content: String,
    #[serde(default)]
    changelog: String,
}

#[derive(Debug, Deserialize)]
struct MutationPair {
    variant1: MutationVariant,
    #[serde(default)]
    variant2: Option<MutationVariant>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RotationPlan {
    #[serde(default)]
    needs_update: bool,
    #[serde(default)]
    updated_content: String,
    #[serde(default)]
    changelog: String,
}

pub struct SurgeonAgent {
    store: Arc<LoopStore>,
    sections: SectionLibrary,
    bus: IntelligenceBus,
    budget: Arc<TokenBudget>,
    oracle: Arc<dyn Oracle>,
    critic: CriticAgent,
    arena: Arena,
    model: String,
}

impl SurgeonAgent {
    pub fn new(
        store: Arc<LoopStore>,
        budget: Arc<TokenBudget>,
        oracle: Arc<dyn Oracle>,
        model: impl Into<String>,
    ) -> Self {
        let model = model.into();
        Self {
            sections: SectionLibrary::new(store.clone()),
            bus: IntelligenceBus::new(store.clone()),
            critic: CriticAgent::new(store.clone(), budget.clone(), oracle.clone(), model.clone()),
            arena: Arena::new(store.clone(), budget.clone(), oracle.clone(), model.clone()),
            store,
            budget,
            oracle,
            model,
        }
    }

    /// Daily main pass: reactive fix if a critique is waiting, then a
    /// proactive mutation if the deeper budget tier is still open.
    pub async fn run(&self) -> Result<Vec<SurgeonOutcome>, StoreError> {
        if !self.budget.has_budget(SURGEON_TIER) {
            return Ok(vec![SurgeonOutcome::BudgetDenied]);
        }

        let mut outcomes = Vec::new();
        if let Some(target) = self.critic.top_unaddressed_critique().await? {
            info!(
                section_key = %target.section_key,
                dimension = %target.dimension,
                severity = target.severity,
                "surgeon reactive mode"
            );
            outcomes.push(self.reactive_fix(&target).await?);
        }

        if self.budget.has_budget(MUTATION_TIER) {
            outcomes.push(self.proactive_mutation().await?);
        }
        Ok(outcomes)
    }

    /// Evening second pass: one reactive fix if a critique is still open,
    /// otherwise one mutation.
    pub async fn run_evening(&self) -> Result<SurgeonOutcome, StoreError> {
        if !self.budget.has_budget(EVENING_TIER) {
            return Ok(SurgeonOutcome::BudgetDenied);
        }
        match self.critic.top_unaddressed_critique().await? {
            Some(target) => self.reactive_fix(&target).await,
            None => self.proactive_mutation().await,
        }
    }

    /// Late-night pass: two extra mutations, only on surplus days.
    pub async fn run_additional_mutations(&self) -> Result<Vec<SurgeonOutcome>, StoreError> {
        if !self.budget.has_budget(ADDITIONAL_MUTATIONS_TIER) {
            return Ok(vec![SurgeonOutcome::BudgetDenied]);
        }
        let mut outcomes = Vec::new();
        outcomes.push(self.proactive_mutation().await?);
        outcomes.push(self.proactive_mutation().await?);
        Ok(outcomes)
    }

    // -------------------------------------------------------------------------
    // Reactive fix
    // -------------------------------------------------------------------------

    async fn reactive_fix(&self, target: &CritiqueTarget) -> Result<SurgeonOutcome, StoreError> {
        let Some(current) = self.sections.active(&target.section_key).await? else {
            warn!(section_key = %target.section_key, "critiqued section has no active version");
            return Ok(SurgeonOutcome::NothingToDo);
        };

        let genealogy = failed_summary(&current, usize::MAX);
        let text = format!(
            "You are improving one section of an AI fashion editorial system prompt.\n\n\
             SECTION TO IMPROVE: \"{key}\"\n\
             CURRENT CONTENT:\n{content}\n\n\
             IDENTIFIED WEAKNESS: the \"{dimension}\" dimension is scoring below threshold.\n\
             PATTERN FOUND BY THE CRITIC: {pattern}\n\n\
             {genealogy}\
             Write an improved version of this section that addresses the weakness. It must:\n\
             1. Fix the identified pattern\n\
             2. Not degrade other dimensions\n\
             3. Stay consistent with the editorial voice (decisive, no hedging)\n\
             4. Not repeat approaches that already failed\n\n\
             Return JSON: {{\"improvedContent\": \"<improved section text>\", \
             \"changelog\": \"<one sentence: what changed and why>\"}}",
            key = target.section_key,
            content = current.content,
            dimension = target.dimension,
            pattern = target.pattern,
        );

        let req = GenerationRequest::prompt(&self.model, text, "surgeon-reactive")
            .max_output_tokens(2_500)
            .json();
        let Some(resp) = self
            .budget
            .tracked_generate(self.oracle.as_ref(), &req, EDIT_TOKEN_ESTIMATE)
            .await
        else {
            return Ok(SurgeonOutcome::BudgetDenied);
        };
        let edit: SectionEdit = match decode_object(&resp.text) {
            Ok(edit) => edit,
            Err(e) => {
                warn!(error = %e, "reactive edit did not decode");
                return Ok(SurgeonOutcome::NothingToDo);
            }
        };

        let draft = self
            .sections
            .create_version(
                &target.section_key,
                &edit.improved_content,
                SectionOrigin::ReactiveFix,
                &edit.changelog,
                Some(current.version),
            )
            .await?;

        let verdict = self
            .arena
            .run_session(&target.section_key, draft.version, &edit.improved_content, "critique")
            .await?;

        if verdict.should_deploy {
            self.sections
                .activate(&target.section_key, draft.version, Some(verdict.win_rate))
                .await?;
            self.critic.mark_addressed(target.critique_id).await?;
            self.publish_mutation(
                "reactive",
                &target.section_key,
                draft.version,
                Some(verdict.win_rate),
                &edit.changelog,
                &format!(
                    "Fixed {} in {}: {}",
                    target.dimension, target.section_key, edit.changelog
                ),
            )
            .await;
            info!(
                section_key = %target.section_key,
                version = draft.version,
                win_rate = verdict.win_rate,
                "deployed reactive fix"
            );
            Ok(SurgeonOutcome::Deployed {
                section_key: target.section_key.clone(),
                version: draft.version,
                win_rate: verdict.win_rate,
            })
        } else {
            let reason = rejection_reason(&verdict);
            // Genealogy lives on the version the next edit prompt will read.
            self.store
                .record_failed_attempt(&target.section_key, current.version, &edit.changelog, &reason)
                .await?;
            info!(section_key = %target.section_key, %reason, "reactive fix rejected");
            Ok(SurgeonOutcome::Rejected {
                section_key: target.section_key.clone(),
                version: draft.version,
                reason,
            })
        }
    }

    // -------------------------------------------------------------------------
    // Proactive mutation
    // -------------------------------------------------------------------------

    async fn proactive_mutation(&self) -> Result<SurgeonOutcome, StoreError> {
        let candidates: Vec<PromptSection> = self
            .store
            .active_sections_by_age()
            .await?
            .into_iter()
            .filter(|s| SECTION_KEYS.contains(&s.section_key.as_str()))
            .collect();
        let Some(current) = pick_weighted_by_age(&candidates) else {
            return Ok(SurgeonOutcome::NothingToDo);
        };

        let genealogy = failed_summary(current, FAILED_ATTEMPT_CONTEXT);
        let text = format!(
            "You are improving a section of an AI fashion editorial system prompt.\n\n\
             SECTION: \"{key}\"\n\
             CURRENT CONTENT:\n{content}\n\n\
             GOAL: generate 2 variant improvements. Each focuses on ONE of these approaches:\n\
             - Make suggestions more specific and actionable (less generic)\n\
             - Strengthen editorial voice (more decisive, more fashion vocabulary)\n\
             - Add more concrete examples for edge cases\n\
             - Clarify rules that might cause ambiguous behavior\n\n\
             {genealogy}\
             Return JSON: {{\"variant1\": {{\"content\": \"<improved version>\", \
             \"changelog\": \"<one sentence what changed>\"}}, \
             \"variant2\": {{\"content\": \"<second improved version>\", \
             \"changelog\": \"<different approach from variant1>\"}}}}",
            key = current.section_key,
            content = current.content,
        );

        let req = GenerationRequest::prompt(&self.model, text, "surgeon-mutation")
            .max_output_tokens(3_000)
            .json();
        let Some(resp) = self
            .budget
            .tracked_generate(self.oracle.as_ref(), &req, EDIT_TOKEN_ESTIMATE)
            .await
        else {
            return Ok(SurgeonOutcome::BudgetDenied);
        };
        let pair: MutationPair = match decode_object(&resp.text) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "mutation variants did not decode");
                return Ok(SurgeonOutcome::NothingToDo);
            }
        };

        let first = self
            .try_variant(current, &pair.variant1, "proactive", "Arena loss", "Regression fail")
            .await?;
        if matches!(first, SurgeonOutcome::Deployed { .. }) {
            return Ok(first);
        }

        // Variant 2 only gets arena time when variant 1 lost.
        if let Some(v2) = &pair.variant2 {
            let second = self
                .try_variant(current, v2, "proactive_v2", "Arena loss (v2)", "Regression fail (v2)")
                .await?;
            if matches!(second, SurgeonOutcome::Deployed { .. }) {
                return Ok(second);
            }
        }
        Ok(first)
    }

    async fn try_variant(
        &self,
        current: &PromptSection,
        variant: &MutationVariant,
        mode: &str,
        arena_loss_reason: &str,
        regression_reason: &str,
    ) -> Result<SurgeonOutcome, StoreError> {
        let draft = self
            .sections
            .create_version(
                &current.section_key,
                &variant.content,
                SectionOrigin::ProactiveMutation,
                &variant.changelog,
                Some(current.version),
            )
            .await?;

        let verdict = self
            .arena
            .run_session(&current.section_key, draft.version, &variant.content, "mutation")
            .await?;

        if verdict.should_deploy {
            self.sections
                .activate(&current.section_key, draft.version, Some(verdict.win_rate))
                .await?;
            self.publish_mutation(
                mode,
                &current.section_key,
                draft.version,
                Some(verdict.win_rate),
                &variant.changelog,
                &format!(
                    "Proactive improvement to {}: {}",
                    current.section_key, variant.changelog
                ),
            )
            .await;
            info!(
                section_key = %current.section_key,
                version = draft.version,
                mode,
                "deployed proactive mutation"
            );
            Ok(SurgeonOutcome::Deployed {
                section_key: current.section_key.clone(),
                version: draft.version,
                win_rate: verdict.win_rate,
            })
        } else {
            let reason = if verdict.regression_passed {
                arena_loss_reason.to_string()
            } else {
                regression_reason.to_string()
            };
            self.store
                .record_failed_attempt(&current.section_key, current.version, &variant.changelog, &reason)
                .await?;
            Ok(SurgeonOutcome::Rejected {
                section_key: current.section_key.clone(),
                version: draft.version,
                reason,
            })
        }
    }

    // -------------------------------------------------------------------------
    // Follow-up surgeon
    // -------------------------------------------------------------------------

    /// Improve the follow-up prompt. Targets the weakest dimension from the
    /// follow-up critic's latest aggregate; with no aggregate on the bus, it
    /// mutates a random follow-up section instead.
    pub async fn run_follow_up(&self) -> Result<SurgeonOutcome, StoreError> {
        if !self.budget.has_budget(FOLLOWUP_SURGEON_TIER) {
            return Ok(SurgeonOutcome::BudgetDenied);
        }

        let records = self.bus.read_recent("follow_up_scores", 0, 5).await?;
        let weakest = records.iter().find_map(|r| match &r.event {
            BusEvent::FollowUpScores { weakest, .. } => Some(weakest.clone()),
            _ => None,
        });

        let Some(weakest) = weakest else {
            return self.follow_up_mutation().await;
        };
        let Some(section_key) = crate::scores::FOLLOWUP_DIMENSIONS
            .iter()
            .find(|d| d.as_str() == weakest)
            .map(|d| d.section_key())
        else {
            warn!(%weakest, "unknown follow-up dimension on the bus");
            return self.follow_up_mutation().await;
        };
        let Some(current) = self.sections.active(section_key).await? else {
            return Ok(SurgeonOutcome::NothingToDo);
        };

        let text = format!(
            "You are improving a follow-up conversation section of an AI fashion \
             assistant prompt.\n\n\
             SECTION: \"{section_key}\"\n\
             CURRENT CONTENT:\n{content}\n\n\
             WEAKNESS: {weakest} is scoring below threshold.\n\n\
             Improve this section to specifically address the weakness.\n\n\
             Return JSON: {{\"improvedContent\": \"<improved section>\", \
             \"changelog\": \"<what changed and why>\"}}",
            content = current.content,
        );
        let req = GenerationRequest::prompt(&self.model, text, "followup-surgeon")
            .max_output_tokens(2_000)
            .json();
        let Some(resp) = self
            .budget
            .tracked_generate(self.oracle.as_ref(), &req, FOLLOWUP_EDIT_TOKEN_ESTIMATE)
            .await
        else {
            return Ok(SurgeonOutcome::BudgetDenied);
        };
        let edit: SectionEdit = match decode_object(&resp.text) {
            Ok(edit) => edit,
            Err(e) => {
                warn!(error = %e, "follow-up edit did not decode");
                return Ok(SurgeonOutcome::NothingToDo);
            }
        };

        self.deploy_if_arena_approves(
            section_key,
            &current,
            &edit.improved_content,
            &edit.changelog,
            SectionOrigin::ReactiveFix,
            "followup",
        )
        .await
    }

    async fn follow_up_mutation(&self) -> Result<SurgeonOutcome, StoreError> {
        let idx = rand::thread_rng().gen_range(0..FOLLOWUP_SECTION_KEYS.len());
        let section_key = FOLLOWUP_SECTION_KEYS[idx];
        let Some(current) = self.sections.active(section_key).await? else {
            return Ok(SurgeonOutcome::NothingToDo);
        };

        let text = format!(
            "Improve this follow-up conversation section of an AI fashion assistant:\n\n\
             SECTION: \"{section_key}\"\n\
             CURRENT:\n{content}\n\n\
             Make it more specific, more editorial, or add clearer response guidelines.\n\n\
             Return JSON: {{\"improvedContent\": \"<improved version>\", \
             \"changelog\": \"<what changed>\"}}",
            content = current.content,
        );
        let req = GenerationRequest::prompt(&self.model, text, "followup-mutation")
            .max_output_tokens(2_000)
            .json();
        let Some(resp) = self
            .budget
            .tracked_generate(self.oracle.as_ref(), &req, FOLLOWUP_MUTATION_TOKEN_ESTIMATE)
            .await
        else {
            return Ok(SurgeonOutcome::BudgetDenied);
        };
        let edit: SectionEdit = match decode_object(&resp.text) {
            Ok(edit) => edit,
            Err(e) => {
                warn!(error = %e, "follow-up mutation did not decode");
                return Ok(SurgeonOutcome::NothingToDo);
            }
        };

        self.deploy_if_arena_approves(
            section_key,
            &current,
            &edit.improved_content,
            &edit.changelog,
            SectionOrigin::ProactiveMutation,
            "followup-mutation",
        )
        .await
    }

    // -------------------------------------------------------------------------
    // Example rotation
    // -------------------------------------------------------------------------

    /// Weekly: if some style lane has been scoring poorly, ask for a
    /// replacement example targeting it. The draft still goes through the
    /// arena like any other edit.
    pub async fn run_example_rotation(&self) -> Result<SurgeonOutcome, StoreError> {
        if !self.budget.has_budget(EXAMPLE_ROTATION_TIER) {
            return Ok(SurgeonOutcome::BudgetDenied);
        }

        let since = crate::store::now_epoch() - ROTATION_WINDOW_SECS;
        let recent = self
            .store
            .evaluated_analyses_since(since, ROTATION_SAMPLE_LIMIT)
            .await?;

        let mut by_vibe: std::collections::BTreeMap<String, Vec<f64>> = Default::default();
        for analysis in &recent {
            let Some(scores) = &analysis.judge_scores else { continue };
            if analysis.vibe.is_empty() {
                continue;
            }
            by_vibe
                .entry(analysis.vibe.clone())
                .or_default()
                .push(scores.overall);
        }
        let weakest = by_vibe
            .iter()
            .map(|(vibe, scores)| {
                (vibe.clone(), scores.iter().sum::<f64>() / scores.len() as f64)
            })
            .min_by(|a, b| a.1.total_cmp(&b.1));

        let Some((vibe, avg)) = weakest else {
            info!("no scored vibes in the window, skipping rotation");
            return Ok(SurgeonOutcome::NothingToDo);
        };
        if avg > ROTATION_SCORE_THRESHOLD {
            info!(%vibe, avg, "all vibes scoring well, skipping rotation");
            return Ok(SurgeonOutcome::NothingToDo);
        }

        let Some(current) = self.sections.active("examples").await? else {
            return Ok(SurgeonOutcome::NothingToDo);
        };

        let text = format!(
            "You are improving the examples section of an AI fashion assistant prompt.\n\n\
             CURRENT EXAMPLES SECTION:\n{content}\n\n\
             The weakest performing style lane is \"{vibe}\" (avg score {avg:.1}/10).\n\n\
             If the current examples lack a strong example of this style lane, generate \
             one and replace the weakest existing example.\n\n\
             Return JSON: {{\"needsUpdate\": <true/false>, \
             \"updatedContent\": \"<full updated section if needsUpdate>\", \
             \"changelog\": \"<what was replaced and why>\"}}",
            content = current.content,
        );
        let req = GenerationRequest::prompt(&self.model, text, "example-rotation")
            .max_output_tokens(3_000)
            .json();
        let Some(resp) = self
            .budget
            .tracked_generate(self.oracle.as_ref(), &req, ROTATION_TOKEN_ESTIMATE)
            .await
        else {
            return Ok(SurgeonOutcome::BudgetDenied);
        };
        let plan: RotationPlan = match decode_object(&resp.text) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "rotation plan did not decode");
                return Ok(SurgeonOutcome::NothingToDo);
            }
        };
        if !plan.needs_update || plan.updated_content.is_empty() {
            info!("examples already cover the weak lane");
            return Ok(SurgeonOutcome::NothingToDo);
        }

        self.deploy_if_arena_approves(
            "examples",
            &current,
            &plan.updated_content,
            &plan.changelog,
            SectionOrigin::ProactiveMutation,
            "rotation",
        )
        .await
    }

    // -------------------------------------------------------------------------
    // Shared draft-gate-deploy path
    // -------------------------------------------------------------------------

    async fn deploy_if_arena_approves(
        &self,
        section_key: &str,
        current: &PromptSection,
        content: &str,
        changelog: &str,
        origin: SectionOrigin,
        mode: &str,
    ) -> Result<SurgeonOutcome, StoreError> {
        let draft = self
            .sections
            .create_version(section_key, content, origin, changelog, Some(current.version))
            .await?;
        let verdict = self
            .arena
            .run_session(section_key, draft.version, content, mode)
            .await?;

        if verdict.should_deploy {
            self.sections
                .activate(section_key, draft.version, Some(verdict.win_rate))
                .await?;
            self.publish_mutation(
                mode,
                section_key,
                draft.version,
                Some(verdict.win_rate),
                changelog,
                &format!("Improved {section_key}: {changelog}"),
            )
            .await;
            info!(section_key, version = draft.version, mode, "deployed");
            Ok(SurgeonOutcome::Deployed {
                section_key: section_key.to_string(),
                version: draft.version,
                win_rate: verdict.win_rate,
            })
        } else {
            let reason = rejection_reason(&verdict);
            self.store
                .record_failed_attempt(section_key, current.version, changelog, &reason)
                .await?;
            Ok(SurgeonOutcome::Rejected {
                section_key: section_key.to_string(),
                version: draft.version,
                reason,
            })
        }
    }

    async fn publish_mutation(
        &self,
        mode: &str,
        section_key: &str,
        version: i64,
        win_rate: Option<f64>,
        changelog: &str,
        insight: &str,
    ) {
        let event = BusEvent::MutationResult {
            mode: mode.to_string(),
            section_key: section_key.to_string(),
            version,
            win_rate,
            changelog: changelog.to_string(),
            insight: insight.to_string(),
        };
        if let Err(e) = self.bus.publish("surgeon", &event).await {
            warn!(error = %e, "failed to publish mutation result");
        }
    }
}

fn rejection_reason(verdict: &ArenaVerdict) -> String {
    if verdict.regression_passed {
        format!(
            "Lost arena (win rate {:.0}% < {:.0}%)",
            verdict.win_rate * 100.0,
            WIN_RATE_THRESHOLD * 100.0
        )
    } else {
        "Failed regression".to_string()
    }
}

fn failed_summary(section: &PromptSection, take_last: usize) -> String {
    if section.failed_attempts.is_empty() {
        return String::new();
    }
    let start = section.failed_attempts.len().saturating_sub(take_last);
    let lines = section.failed_attempts[start..]
        .iter()
        .map(|f| format!("- {}: failed because {}", f.changelog, f.fail_reason))
        .collect::<Vec<_>>()
        .join("\n");
    format!("Previous failed attempts (avoid these directions):\n{lines}\n\n")
}

/// Weighted random pick, older sections weighted highest: weights n..1 in
/// age order.
fn pick_weighted_by_age(sections: &[PromptSection]) -> Option<&PromptSection> {
    if sections.is_empty() {
        return None;
    }
    let n = sections.len();
    let total: usize = (1..=n).sum();
    let mut draw = rand::thread_rng().gen_range(0..total);
    for (i, section) in sections.iter().enumerate() {
        let weight = n - i;
        if draw < weight {
            return Some(section);
        }
        draw -= weight;
    }
    sections.first()
}
