//! Prompt section registry and assembly.
//!
//! The production prompt is not a blob. It is an ordered set of versioned
//! sections, each independently evolvable, assembled fresh on every use so
//! a deployment is nothing more than flipping which version is active.

use std::sync::Arc;

use crate::store::{LoopStore, PromptSection, SectionOrigin, StoreError};

/// The sections that make up the main analysis prompt, in assembly order.
pub const SECTION_KEYS: [&str; 13] = [
    "voice_persona",
    "voice_examples",
    "color_theory",
    "proportions_silhouette",
    "fit_principles",
    "body_balance",
    "occasion_dress_codes",
    "style_coherence",
    "style_lanes",
    "styling_moves",
    "seasonal_practical",
    "examples",
    "analysis_scoring",
];

/// The sections that make up the follow-up answering prompt.
pub const FOLLOWUP_SECTION_KEYS: [&str; 3] = [
    "followup_persona",
    "followup_context_rules",
    "followup_response_format",
];

/// Assembly position for a key, also used as the stored order_index.
pub fn order_index(section_key: &str) -> i64 {
    SECTION_KEYS
        .iter()
        .chain(FOLLOWUP_SECTION_KEYS.iter())
        .position(|k| *k == section_key)
        .map(|i| i as i64)
        .unwrap_or(i64::MAX)
}

pub fn is_known_key(section_key: &str) -> bool {
    SECTION_KEYS.contains(&section_key) || FOLLOWUP_SECTION_KEYS.contains(&section_key)
}

/// A prompt built from the currently active section versions.
#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub text: String,
    /// "key:version|key:version|..." in assembly order. Two prompts with the
    /// same fingerprint are byte-identical.
    pub fingerprint: String,
    pub section_versions: Vec<(String, i64)>,
}

pub struct SectionLibrary {
    store: Arc<LoopStore>,
}

impl SectionLibrary {
    pub fn new(store: Arc<LoopStore>) -> Self {
        Self { store }
    }

    /// Assemble the main analysis prompt from active sections.
    pub async fn assemble(&self) -> Result<AssembledPrompt, StoreError> {
        self.assemble_keys(&SECTION_KEYS, None).await
    }

    /// Assemble the follow-up prompt from active follow-up sections.
    pub async fn assemble_follow_up(&self) -> Result<AssembledPrompt, StoreError> {
        self.assemble_keys(&FOLLOWUP_SECTION_KEYS, None).await
    }

    /// Assemble whichever prompt (main or follow-up) contains `section_key`.
    pub async fn assemble_containing(
        &self,
        section_key: &str,
    ) -> Result<AssembledPrompt, StoreError> {
        self.assemble_keys(Self::scope_of(section_key), None).await
    }

    /// The key set (main or follow-up) a section is assembled into.
    pub fn scope_of(section_key: &str) -> &'static [&'static str] {
        if FOLLOWUP_SECTION_KEYS.contains(&section_key) {
            &FOLLOWUP_SECTION_KEYS
        } else {
            &SECTION_KEYS
        }
    }

    /// Assemble the prompt containing `section_key` with that section's
    /// content swapped for a candidate. The arena uses this to build the
    /// challenger side.
    pub async fn assemble_with_override(
        &self,
        section_key: &str,
        candidate_version: i64,
        candidate_content: &str,
    ) -> Result<AssembledPrompt, StoreError> {
        self.assemble_keys(
            Self::scope_of(section_key),
            Some((section_key, candidate_version, candidate_content)),
        )
        .await
    }

    async fn assemble_keys(
        &self,
        keys: &[&str],
        override_section: Option<(&str, i64, &str)>,
    ) -> Result<AssembledPrompt, StoreError> {
        let sections = self.store.active_sections(keys).await?;

        let mut parts = Vec::with_capacity(sections.len());
        let mut section_versions = Vec::with_capacity(sections.len());
        for section in &sections {
            match override_section {
                Some((key, version, content)) if key == section.section_key => {
                    parts.push(content.to_string());
                    section_versions.push((section.section_key.clone(), version));
                }
                _ => {
                    parts.push(section.content.clone());
                    section_versions.push((section.section_key.clone(), section.version));
                }
            }
        }

        let fingerprint = section_versions
            .iter()
            .map(|(k, v)| format!("{k}:{v}"))
            .collect::<Vec<_>>()
            .join("|");

        Ok(AssembledPrompt {
            text: parts.join("\n\n"),
            fingerprint,
            section_versions,
        })
    }

    /// Create a new, inactive version of a section. Activation is a separate
    /// step that only the arena gate (or a manual command) takes.
    pub async fn create_version(
        &self,
        section_key: &str,
        content: &str,
        created_by: SectionOrigin,
        changelog: &str,
        parent_version: Option<i64>,
    ) -> Result<PromptSection, StoreError> {
        self.store
            .create_section_version(
                section_key,
                content,
                created_by,
                changelog,
                parent_version,
                order_index(section_key),
            )
            .await
    }

    pub async fn active(&self, section_key: &str) -> Result<Option<PromptSection>, StoreError> {
        self.store.get_active_section(section_key).await
    }

    /// Deploy: atomically make `version` the single active version of its
    /// section.
    pub async fn activate(
        &self,
        section_key: &str,
        version: i64,
        arena_win_rate: Option<f64>,
    ) -> Result<(), StoreError> {
        self.store
            .activate_section(section_key, version, arena_win_rate)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_library() -> (SectionLibrary, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LoopStore::new(dir.path().join("loop.sqlite")).unwrap());
        let lib = SectionLibrary::new(store);
        for key in ["voice_persona", "styling_moves", "examples"] {
            lib.create_version(key, &format!("[{key} v1]"), SectionOrigin::Manual, "seed", None)
                .await
                .unwrap();
            lib.activate(key, 1, None).await.unwrap();
        }
        (lib, dir)
    }

    #[tokio::test]
    async fn assembly_preserves_canonical_order() {
        let (lib, _dir) = seeded_library().await;
        let prompt = lib.assemble().await.unwrap();
        // styling_moves comes before examples regardless of creation order.
        assert_eq!(
            prompt.text,
            "[voice_persona v1]\n\n[styling_moves v1]\n\n[examples v1]"
        );
        assert_eq!(
            prompt.fingerprint,
            "voice_persona:1|styling_moves:1|examples:1"
        );
    }

    #[tokio::test]
    async fn fingerprint_tracks_deployments() {
        let (lib, _dir) = seeded_library().await;
        let before = lib.assemble().await.unwrap();

        lib.create_version(
            "styling_moves",
            "[styling_moves v2]",
            SectionOrigin::ReactiveFix,
            "sharper moves",
            Some(1),
        )
        .await
        .unwrap();
        // Not deployed yet: assembly unchanged.
        let mid = lib.assemble().await.unwrap();
        assert_eq!(before.fingerprint, mid.fingerprint);

        lib.activate("styling_moves", 2, Some(0.6)).await.unwrap();
        let after = lib.assemble().await.unwrap();
        assert_ne!(before.fingerprint, after.fingerprint);
        assert!(after.text.contains("[styling_moves v2]"));
    }

    #[tokio::test]
    async fn override_swaps_only_the_target_section() {
        let (lib, _dir) = seeded_library().await;
        let prompt = lib
            .assemble_with_override("styling_moves", 7, "[candidate moves]")
            .await
            .unwrap();
        assert!(prompt.text.contains("[candidate moves]"));
        assert!(!prompt.text.contains("[styling_moves v1]"));
        assert!(prompt.text.contains("[voice_persona v1]"));
        assert!(prompt.fingerprint.contains("styling_moves:7"));
    }

    #[test]
    fn order_index_is_stable() {
        assert_eq!(order_index("voice_persona"), 0);
        assert_eq!(order_index("analysis_scoring"), 12);
        assert_eq!(order_index("followup_persona"), 13);
        assert!(!is_known_key("nonexistent"));
    }
}
