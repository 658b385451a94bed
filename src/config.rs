//! Environment-driven configuration for the improvement loop.

use std::path::PathBuf;

use crate::budget::DEFAULT_DAILY_BUDGET;
use crate::store::LoopStore;

pub const DEFAULT_MODEL: &str = "google/gemini-2.5-flash-lite";

#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Model id used for every agent call.
    pub model: String,
    /// Daily token ceiling shared across all agents.
    pub daily_token_budget: u64,
    /// SQLite database path.
    pub store_path: PathBuf,
}

impl LoopConfig {
    pub fn from_env() -> Self {
        let model = std::env::var("TAILOR_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let daily_token_budget = std::env::var("TAILOR_DAILY_TOKEN_BUDGET")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_DAILY_BUDGET);
        Self {
            model,
            daily_token_budget,
            store_path: LoopStore::default_path(),
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            daily_token_budget: DEFAULT_DAILY_BUDGET,
            store_path: LoopStore::default_path(),
        }
    }
}
