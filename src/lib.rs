#![forbid(unsafe_code)]

//! # tailor-harness
//!
//! A budgeted, self-improving prompt pipeline for an AI fashion editorial
//! service.
//!
//! The production system prompt is stored as versioned sections. Each cycle,
//! a piggyback judge scores recent live output, a critic diagnoses which
//! sections are responsible for weak dimensions, and a surgeon drafts
//! targeted rewrites. No draft goes live on anyone's say-so: it must beat
//! the current prompt head-to-head in the arena AND hold a fixed regression
//! suite. Every LLM call passes a shared daily token budget that sheds
//! lower-priority work first as the day's spend grows.

pub mod arena;
pub mod budget;
pub mod bus;
pub mod config;
pub mod critic;
pub mod judge;
pub mod oracle;
pub mod scheduler;
pub mod scores;
pub mod sections;
pub mod store;
pub mod surgeon;

pub use arena::{Arena, ArenaVerdict, WIN_RATE_THRESHOLD};
pub use budget::{TokenBudget, DEFAULT_DAILY_BUDGET};
pub use bus::{BusEvent, BusRecord, IntelligenceBus};
pub use config::LoopConfig;
pub use critic::{CriticAgent, CriticOutcome, CritiqueTarget};
pub use judge::{JudgeOutcome, PiggybackJudge};
pub use oracle::{Oracle, OracleGateway, OpenRouterOracle, ScriptedOracle};
pub use scheduler::{AgentRegistry, AgentTask, CycleReport};
pub use scores::{Dimension, FollowUpDimension, JudgeScores};
pub use sections::{SectionLibrary, FOLLOWUP_SECTION_KEYS, SECTION_KEYS};
pub use store::{LoopStore, PromptSection, SectionOrigin, StoreError};
pub use surgeon::{SurgeonAgent, SurgeonOutcome};
