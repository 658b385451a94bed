//! Intelligence bus: how agents leave findings for each other.
//!
//! Entries are typed at both ends. Writers serialize a [`BusEvent`] variant;
//! readers decode strictly and skip rows that no longer parse (old schema,
//! manual edits) with a warning instead of propagating garbage downstream.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::scores::JudgeScores;
use crate::store::{BusEntry, LoopStore, StoreError};

/// How long an entry stays readable before the purge sweeps it.
pub const BUS_ENTRY_TTL_SECS: i64 = 14 * 24 * 60 * 60;

/// Everything agents publish to the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    /// Daily aggregate from the piggyback judge.
    PiggybackScores {
        date: String,
        sample_size: usize,
        aggregate: JudgeScores,
        bottom_dimension: String,
        top_insight: String,
    },
    /// One weakness diagnosed by the critic.
    CritiqueFinding {
        critique_id: i64,
        dimension: String,
        avg_score: f64,
        affected_sections: Vec<String>,
        severity: u8,
    },
    /// Outcome of an arena session, win or lose.
    ArenaResult {
        session_id: i64,
        section_key: String,
        candidate_version: i64,
        win_rate: f64,
        regression_passed: bool,
        deployed: bool,
    },
    /// A surgeon mutation's fate.
    MutationResult {
        mode: String,
        section_key: String,
        version: i64,
        win_rate: Option<f64>,
        changelog: String,
        insight: String,
    },
    /// Aggregate from the follow-up critic's measurement pass.
    FollowUpScores {
        date: String,
        sample_size: usize,
        contextual_relevance: f64,
        editorial_voice: f64,
        actionability: f64,
        weakest: String,
    },
}

impl BusEvent {
    /// Stable discriminant, stored in its own column for filtered reads.
    pub fn entry_type(&self) -> &'static str {
        match self {
            BusEvent::PiggybackScores { .. } => "piggyback_scores",
            BusEvent::CritiqueFinding { .. } => "critique_finding",
            BusEvent::ArenaResult { .. } => "arena_result",
            BusEvent::MutationResult { .. } => "mutation_result",
            BusEvent::FollowUpScores { .. } => "follow_up_scores",
        }
    }
}

/// A decoded bus entry with its envelope metadata.
#[derive(Debug, Clone)]
pub struct BusRecord {
    pub id: i64,
    pub agent: String,
    pub event: BusEvent,
    pub created_at: i64,
}

pub struct IntelligenceBus {
    store: Arc<LoopStore>,
}

impl IntelligenceBus {
    pub fn new(store: Arc<LoopStore>) -> Self {
        Self { store }
    }

    /// Publish an event under the given agent name. Entries expire after
    /// [`BUS_ENTRY_TTL_SECS`].
    pub async fn publish(&self, agent: &str, event: &BusEvent) -> Result<i64, StoreError> {
        let payload = serde_json::to_string(event)?;
        let expires_at = crate::store::now_epoch() + BUS_ENTRY_TTL_SECS;
        self.store
            .insert_bus_entry(agent, event.entry_type(), &payload, expires_at)
            .await
    }

    /// Read recent events of one type, newest first. Rows whose payload no
    /// longer decodes are skipped with a warning.
    pub async fn read_recent(
        &self,
        entry_type: &str,
        since: i64,
        limit: usize,
    ) -> Result<Vec<BusRecord>, StoreError> {
        let rows = self
            .store
            .recent_bus_entries(Some(entry_type), since, limit)
            .await?;
        Ok(rows.into_iter().filter_map(decode_entry).collect())
    }

    /// Read recent events across all types, newest first.
    pub async fn read_all(&self, since: i64, limit: usize) -> Result<Vec<BusRecord>, StoreError> {
        let rows = self.store.recent_bus_entries(None, since, limit).await?;
        Ok(rows.into_iter().filter_map(decode_entry).collect())
    }

    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        self.store.purge_expired_bus_entries().await
    }
}

fn decode_entry(row: BusEntry) -> Option<BusRecord> {
    match serde_json::from_str::<BusEvent>(&row.payload) {
        Ok(event) => Some(BusRecord {
            id: row.id,
            agent: row.agent,
            event,
            created_at: row.created_at,
        }),
        Err(e) => {
            warn!(
                id = row.id,
                entry_type = %row.entry_type,
                error = %e,
                "skipping undecodable bus entry"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_bus() -> (IntelligenceBus, Arc<LoopStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LoopStore::new(dir.path().join("loop.sqlite")).unwrap());
        (IntelligenceBus::new(store.clone()), store, dir)
    }

    fn sample_event() -> BusEvent {
        BusEvent::ArenaResult {
            session_id: 4,
            section_key: "styling_moves".into(),
            candidate_version: 3,
            win_rate: 0.58,
            regression_passed: true,
            deployed: true,
        }
    }

    #[tokio::test]
    async fn round_trips_typed_events() {
        let (bus, _store, _dir) = temp_bus().await;
        bus.publish("arena", &sample_event()).await.unwrap();

        let records = bus.read_recent("arena_result", 0, 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].agent, "arena");
        match &records[0].event {
            BusEvent::ArenaResult {
                section_key,
                win_rate,
                deployed,
                ..
            } => {
                assert_eq!(section_key, "styling_moves");
                assert!((win_rate - 0.58).abs() < 1e-9);
                assert!(deployed);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn type_filter_excludes_other_events() {
        let (bus, _store, _dir) = temp_bus().await;
        bus.publish("arena", &sample_event()).await.unwrap();
        bus.publish(
            "critic",
            &BusEvent::CritiqueFinding {
                critique_id: 1,
                dimension: "specificity".into(),
                avg_score: 6.2,
                affected_sections: vec!["styling_moves".into()],
                severity: 3,
            },
        )
        .await
        .unwrap();

        let arena_only = bus.read_recent("arena_result", 0, 10).await.unwrap();
        assert_eq!(arena_only.len(), 1);
        let all = bus.read_all(0, 10).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn undecodable_rows_are_skipped_not_fatal() {
        let (bus, store, _dir) = temp_bus().await;
        bus.publish("arena", &sample_event()).await.unwrap();
        // A row written by an older schema, by hand.
        store
            .insert_bus_entry(
                "arena",
                "arena_result",
                r#"{"winRate": 0.5}"#,
                crate::store::now_epoch() + 3600,
            )
            .await
            .unwrap();

        let records = bus.read_recent("arena_result", 0, 10).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn payload_carries_type_tag() {
        let json = serde_json::to_string(&sample_event()).unwrap();
        assert!(json.contains(r#""type":"arena_result""#));
    }
}
