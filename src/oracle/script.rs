//! Deterministic scripted oracle for tests and dry runs.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::error::OracleError;
use super::types::{FinishReason, GenerationRequest, GenerationResponse};
use super::Oracle;

/// An oracle that replays a fixed script of responses in order.
///
/// Each queued entry is either canned text (with a token count) or an error.
/// Requests received are recorded so tests can assert on prompt content and
/// call ordering. An exhausted script returns a non-retryable provider error
/// rather than panicking, so a miscounted test fails with a readable message.
#[derive(Default)]
pub struct ScriptedOracle {
    queue: Mutex<VecDeque<Result<GenerationResponse, OracleError>>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a text response costing `tokens` total (split 60/40 input/output,
    /// matching how providers typically skew for batch prompts).
    pub fn push_text(&self, text: impl Into<String>, tokens: u32) {
        let input = tokens * 6 / 10;
        let output = tokens - input;
        self.push_response(GenerationResponse {
            text: text.into(),
            input_tokens: input,
            output_tokens: output,
            latency: Duration::from_millis(5),
            finish_reason: FinishReason::Stop,
        });
    }

    pub fn push_response(&self, resp: GenerationResponse) {
        self.queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(Ok(resp));
    }

    pub fn push_error(&self, err: OracleError) {
        self.queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(Err(err));
    }

    /// All requests received so far, in order.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Number of calls made against this oracle.
    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn generate(&self, req: &GenerationRequest) -> Result<GenerationResponse, OracleError> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(req.clone());

        self.queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or_else(|| {
                Err(OracleError::provider(
                    "scripted",
                    "script exhausted: no response queued for this call",
                    false,
                ))
            })
    }
}
