//! Explicit agent pipeline.
//!
//! One cycle runs the agents in data-dependency order: the judge writes
//! aggregates the critic reads, the critic writes the critique the surgeon
//! consumes. Ordering is enforced here, in code, rather than by staggering
//! wall-clock schedules and hoping the previous stage finished. A stage
//! failure is logged and the cycle moves on; the next cycle re-derives
//! everything from the store.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::budget::TokenBudget;
use crate::bus::IntelligenceBus;
use crate::critic::CriticAgent;
use crate::judge::PiggybackJudge;
use crate::oracle::Oracle;
use crate::store::{LoopStore, StoreError};
use crate::surgeon::SurgeonAgent;

/// One stage of the improvement cycle.
#[async_trait]
pub trait AgentTask: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self) -> Result<(), StoreError>;
}

struct JudgeTask {
    judge: PiggybackJudge,
}

#[async_trait]
impl AgentTask for JudgeTask {
    fn name(&self) -> &'static str {
        "piggyback-judge"
    }
    async fn run(&self) -> Result<(), StoreError> {
        self.judge.run().await.map(|_| ())
    }
}

struct CriticTask {
    critic: CriticAgent,
}

#[async_trait]
impl AgentTask for CriticTask {
    fn name(&self) -> &'static str {
        "critic"
    }
    async fn run(&self) -> Result<(), StoreError> {
        self.critic.run().await.map(|_| ())
    }
}

struct SurgeonTask {
    surgeon: SurgeonAgent,
}

#[async_trait]
impl AgentTask for SurgeonTask {
    fn name(&self) -> &'static str {
        "surgeon"
    }
    async fn run(&self) -> Result<(), StoreError> {
        self.surgeon.run().await.map(|_| ())
    }
}

struct FollowUpCriticTask {
    critic: CriticAgent,
}

#[async_trait]
impl AgentTask for FollowUpCriticTask {
    fn name(&self) -> &'static str {
        "followup-critic"
    }
    async fn run(&self) -> Result<(), StoreError> {
        self.critic.run_follow_up().await.map(|_| ())
    }
}

struct FollowUpSurgeonTask {
    surgeon: SurgeonAgent,
}

#[async_trait]
impl AgentTask for FollowUpSurgeonTask {
    fn name(&self) -> &'static str {
        "followup-surgeon"
    }
    async fn run(&self) -> Result<(), StoreError> {
        self.surgeon.run_follow_up().await.map(|_| ())
    }
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub completed: Vec<&'static str>,
    pub failed: Vec<(&'static str, String)>,
    pub purged_bus_entries: usize,
}

/// All agents, wired to shared deps, in execution order.
pub struct AgentRegistry {
    tasks: Vec<Box<dyn AgentTask>>,
    bus: IntelligenceBus,
}

impl AgentRegistry {
    pub fn new(
        store: Arc<LoopStore>,
        budget: Arc<TokenBudget>,
        oracle: Arc<dyn Oracle>,
        model: impl Into<String>,
    ) -> Self {
        let model = model.into();
        let tasks: Vec<Box<dyn AgentTask>> = vec![
            Box::new(JudgeTask {
                judge: PiggybackJudge::new(
                    store.clone(),
                    budget.clone(),
                    oracle.clone(),
                    model.clone(),
                ),
            }),
            Box::new(CriticTask {
                critic: CriticAgent::new(
                    store.clone(),
                    budget.clone(),
                    oracle.clone(),
                    model.clone(),
                ),
            }),
            Box::new(SurgeonTask {
                surgeon: SurgeonAgent::new(
                    store.clone(),
                    budget.clone(),
                    oracle.clone(),
                    model.clone(),
                ),
            }),
            Box::new(FollowUpCriticTask {
                critic: CriticAgent::new(
                    store.clone(),
                    budget.clone(),
                    oracle.clone(),
                    model.clone(),
                ),
            }),
            Box::new(FollowUpSurgeonTask {
                surgeon: SurgeonAgent::new(store.clone(), budget, oracle, model),
            }),
        ];
        Self {
            tasks,
            bus: IntelligenceBus::new(store),
        }
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|t| t.name()).collect()
    }

    /// Run every registered stage once, in order. Stage errors do not stop
    /// the cycle.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        for task in &self.tasks {
            info!(stage = task.name(), "cycle stage starting");
            match task.run().await {
                Ok(()) => report.completed.push(task.name()),
                Err(e) => {
                    error!(stage = task.name(), error = %e, "cycle stage failed");
                    report.failed.push((task.name(), e.to_string()));
                }
            }
        }

        match self.bus.purge_expired().await {
            Ok(purged) => report.purged_bus_entries = purged,
            Err(e) => error!(error = %e, "bus purge failed"),
        }

        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            purged = report.purged_bus_entries,
            "cycle finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::ScriptedOracle;

    #[tokio::test]
    async fn stages_run_in_dependency_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LoopStore::new(dir.path().join("loop.sqlite")).unwrap());
        let registry = AgentRegistry::new(
            store,
            Arc::new(TokenBudget::new(500_000)),
            Arc::new(ScriptedOracle::new()),
            "test/model",
        );
        assert_eq!(
            registry.task_names(),
            vec![
                "piggyback-judge",
                "critic",
                "surgeon",
                "followup-critic",
                "followup-surgeon",
            ]
        );
    }

    #[tokio::test]
    async fn empty_store_cycle_completes_without_oracle_calls() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LoopStore::new(dir.path().join("loop.sqlite")).unwrap());
        let oracle = Arc::new(ScriptedOracle::new());
        let registry = AgentRegistry::new(
            store,
            Arc::new(TokenBudget::new(500_000)),
            oracle.clone(),
            "test/model",
        );

        let report = registry.run_cycle().await;
        assert_eq!(report.completed.len(), 5);
        assert!(report.failed.is_empty());
        // Nothing to judge, critique, or operate on: every stage no-ops.
        assert_eq!(oracle.call_count(), 0);
    }
}
