//! Core types for the generation oracle boundary.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Chat message role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Request for one oracle generation.
///
/// Every request carries a `label` naming the code path that issued it
/// ("piggyback_judge", "arena_generate_baseline", ...) so usage records and
/// the budget breakdown stay attributable.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Model id, e.g. "google/gemini-2.0-flash-lite-001".
    pub model: String,
    /// Messages in the conversation.
    pub messages: Vec<Message>,
    /// Sampling temperature (0.0 - 2.0).
    pub temperature: f32,
    /// Hard cap on generated tokens. Acts as backpressure against
    /// unbounded generation length; always set by budgeted callers.
    pub max_output_tokens: Option<u32>,
    /// Whether to request JSON output from the provider.
    pub json_mode: bool,
    /// Which code path made this call.
    pub label: &'static str,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>, label: &'static str) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.0,
            max_output_tokens: None,
            json_mode: false,
            label,
        }
    }

    /// Convenience constructor for the common single-user-message case.
    pub fn prompt(model: impl Into<String>, text: impl Into<String>, label: &'static str) -> Self {
        Self::new(model, vec![Message::user(text)], label)
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = Some(max);
        self
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Unknown(String),
}

impl From<Option<String>> for FinishReason {
    fn from(s: Option<String>) -> Self {
        match s.as_deref() {
            Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            Some(other) => FinishReason::Unknown(other.to_string()),
            None => FinishReason::Unknown("none".to_string()),
        }
    }
}

/// Response from one oracle generation.
#[derive(Debug, Clone)]
pub struct GenerationResponse {
    /// Generated text.
    pub text: String,
    /// Input tokens consumed.
    pub input_tokens: u32,
    /// Output tokens generated.
    pub output_tokens: u32,
    /// Time taken for the request.
    pub latency: Duration,
    /// Why the model stopped.
    pub finish_reason: FinishReason,
}

impl GenerationResponse {
    /// Total tokens this call cost, used for budget debits.
    pub fn total_tokens(&self) -> u64 {
        u64::from(self.input_tokens) + u64::from(self.output_tokens)
    }

    pub(crate) fn empty() -> Self {
        Self {
            text: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            latency: Duration::from_millis(0),
            finish_reason: FinishReason::Unknown("error".to_string()),
        }
    }
}
