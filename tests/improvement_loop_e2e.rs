//! Full-cycle tests: judge -> critic -> surgeon -> arena -> deploy, driven by
//! a scripted oracle against a real on-disk store.

use std::sync::Arc;

use tailor_harness::budget::TokenBudget;
use tailor_harness::bus::{BusEvent, IntelligenceBus};
use tailor_harness::oracle::ScriptedOracle;
use tailor_harness::scheduler::AgentRegistry;
use tailor_harness::sections::SectionLibrary;
use tailor_harness::store::{LoopStore, SectionOrigin, SessionStatus};

struct World {
    registry: AgentRegistry,
    store: Arc<LoopStore>,
    oracle: Arc<ScriptedOracle>,
    budget: Arc<TokenBudget>,
    _dir: tempfile::TempDir,
}

async fn seeded_world(ceiling: u64) -> World {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LoopStore::new(dir.path().join("loop.sqlite")).unwrap());
    let oracle = Arc::new(ScriptedOracle::new());
    let budget = Arc::new(TokenBudget::new(ceiling));
    let registry = AgentRegistry::new(store.clone(), budget.clone(), oracle.clone(), "test/model");

    let lib = SectionLibrary::new(store.clone());
    for key in ["voice_persona", "styling_moves", "examples"] {
        lib.create_version(key, &format!("[{key} v1]"), SectionOrigin::Manual, "seed", None)
            .await
            .unwrap();
        lib.activate(key, 1, None).await.unwrap();
    }
    World {
        registry,
        store,
        oracle,
        budget,
        _dir: dir,
    }
}

async fn seed_analyses(store: &LoopStore, n: usize) {
    for i in 0..n {
        store
            .insert_analysis(
                &format!("a-{i}"),
                "brunch",
                "outdoor cafe",
                "casual",
                7.0,
                "The bomber works but the sneakers read gym, not brunch.",
            )
            .await
            .unwrap();
    }
}

fn judge_item(index: usize, specificity: f64, rest: f64) -> String {
    format!(
        r#"{{"index": {index}, "specificity": {specificity}, "voiceConsistency": {rest}, "actionability": {rest}, "styleAlignment": {rest}, "occasionFit": {rest}, "overall": {rest}}}"#
    )
}

fn scenario_ids(live: usize) -> Vec<String> {
    let mut ids: Vec<String> = (0..live).map(|i| format!("a-{i}")).collect();
    ids.extend((1..=8).map(|i| format!("syn_{i}")));
    ids
}

fn responses_json(ids: &[String]) -> String {
    let body = ids
        .iter()
        .map(|id| format!(r#""{id}": "Editorial note for {id}.""#))
        .collect::<Vec<_>>()
        .join(", ");
    format!(r#"{{"responses": {{{body}}}}}"#)
}

fn verdicts_json(ids: &[String], winner: &str) -> String {
    let body = ids
        .iter()
        .map(|id| format!(r#"{{"id": "{id}", "winner": "{winner}", "reason": "r"}}"#))
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{body}]")
}

#[tokio::test]
async fn weak_dimension_flows_through_to_a_deployed_fix() {
    // Ceiling sized so the reactive fix runs but the deeper mutation and
    // follow-up tiers close once it has spent.
    let world = seeded_world(110_000).await;
    seed_analyses(&world.store, 3).await;

    // Judge: specificity lands at 6.0, everything else healthy.
    world.oracle.push_text(
        format!(
            "[{}, {}, {}]",
            judge_item(1, 6.0, 8.0),
            judge_item(2, 6.0, 8.0),
            judge_item(3, 6.0, 8.0)
        ),
        2_000,
    );
    // Critic names the pattern behind the weak dimension.
    world.oracle.push_text(
        r#"{"patterns": {"specificity": "suggestions rarely name visible garments"}, "summary": "feedback is too generic"}"#,
        2_000,
    );
    // Surgeon drafts a fix for the primary suspect section.
    world.oracle.push_text(
        r#"{"improvedContent": "[styling_moves v2]", "changelog": "name garments explicitly"}"#,
        2_000,
    );
    // Arena: 3 live scenarios plus the 8 synthetic ones; challenger sweeps.
    let ids = scenario_ids(3);
    world.oracle.push_text(responses_json(&ids), 5_000);
    world.oracle.push_text(responses_json(&ids), 5_000);
    world.oracle.push_text(verdicts_json(&ids, "B"), 4_000);

    let report = world.registry.run_cycle().await;
    assert_eq!(report.completed.len(), 5);
    assert!(report.failed.is_empty());
    assert_eq!(world.oracle.call_count(), 6);

    // The fix went live.
    let active = world
        .store
        .get_active_section("styling_moves")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(active.version, 2);
    assert_eq!(active.content, "[styling_moves v2]");

    // The critique was consumed by the deploy.
    assert!(world
        .store
        .latest_unaddressed_critique()
        .await
        .unwrap()
        .is_none());

    // The arena session is on record as completed and deployed.
    let bus = IntelligenceBus::new(world.store.clone());
    let arena_records = bus.read_recent("arena_result", 0, 5).await.unwrap();
    assert_eq!(arena_records.len(), 1);
    let BusEvent::ArenaResult {
        session_id,
        deployed,
        win_rate,
        ..
    } = &arena_records[0].event
    else {
        panic!("wrong event variant: {:?}", arena_records[0].event);
    };
    assert!(*deployed);
    assert!(*win_rate > 0.99);
    let session = world.store.get_arena_session(*session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.match_count, 11);

    // Every call was debited against the shared day counter.
    assert_eq!(world.budget.spent_today(), 20_000);
    assert_eq!(bus.read_recent("mutation_result", 0, 5).await.unwrap().len(), 1);
}

#[tokio::test]
async fn healthy_scores_skip_the_critic_and_still_explore() {
    let world = seeded_world(500_000).await;
    seed_analyses(&world.store, 2).await;

    // Judge: everything healthy. The critic should stay silent and make no
    // oracle call; the surgeon falls through to a proactive mutation.
    world.oracle.push_text(
        format!("[{}, {}]", judge_item(1, 8.5, 8.5), judge_item(2, 8.5, 8.5)),
        2_000,
    );
    world.oracle.push_text(
        r#"{"variant1": {"content": "[variant one]", "changelog": "direction one"},
            "variant2": {"content": "[variant two]", "changelog": "direction two"}}"#,
        3_000,
    );
    let ids = scenario_ids(2);
    world.oracle.push_text(responses_json(&ids), 5_000);
    world.oracle.push_text(responses_json(&ids), 5_000);
    world.oracle.push_text(verdicts_json(&ids, "B"), 4_000);

    let report = world.registry.run_cycle().await;
    assert_eq!(report.completed.len(), 5);
    assert!(report.failed.is_empty());
    // judge + mutation draft + two generations + arena judge.
    assert_eq!(world.oracle.call_count(), 5);

    assert!(world
        .store
        .latest_unaddressed_critique()
        .await
        .unwrap()
        .is_none());

    // Variant 1 won its arena outright, so it is the new active version of
    // whichever section the age-weighted draw picked.
    let bus = IntelligenceBus::new(world.store.clone());
    let records = bus.read_recent("mutation_result", 0, 5).await.unwrap();
    assert_eq!(records.len(), 1);
    let BusEvent::MutationResult { section_key, version, .. } = &records[0].event else {
        panic!("wrong event variant: {:?}", records[0].event);
    };
    let active = world
        .store
        .get_active_section(section_key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(active.version, *version);
    assert_eq!(active.content, "[variant one]");
}

#[tokio::test]
async fn starved_budget_day_completes_without_oracle_calls() {
    let world = seeded_world(5_000).await;
    seed_analyses(&world.store, 2).await;

    let report = world.registry.run_cycle().await;
    // Every stage either gets denied by the gate or finds nothing eligible,
    // and none of that is an error.
    assert_eq!(report.completed.len(), 5);
    assert!(report.failed.is_empty());
    assert_eq!(world.oracle.call_count(), 0);
    assert_eq!(world.budget.spent_today(), 0);

    // The unevaluated analyses are still waiting for a richer day.
    assert_eq!(
        world.store.unevaluated_analyses(0, 30).await.unwrap().len(),
        2
    );
}
