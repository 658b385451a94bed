//! Generation oracle boundary.
//!
//! The rest of the crate treats the hosted LLM as an opaque, unreliable,
//! cost-constrained text oracle behind the [`Oracle`] trait. The OpenRouter
//! adapter is the production implementation; [`ScriptedOracle`] serves tests
//! and dry runs.

pub mod decode;
pub mod error;
pub mod openrouter;
pub mod script;
pub mod types;

use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

pub use decode::{decode_array, decode_object, DecodeError};
pub use error::{ErrorContext, OracleError};
pub use openrouter::OpenRouterOracle;
pub use script::ScriptedOracle;
pub use types::*;

#[async_trait::async_trait]
pub trait Oracle: Send + Sync {
    async fn generate(&self, req: &GenerationRequest) -> Result<GenerationResponse, OracleError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

/// Retrying wrapper around an [`Oracle`].
///
/// Retries transient provider failures with exponential backoff and logs one
/// usage line per attempt. Budget debits happen strictly above this layer,
/// on a returned success, so retries can never double-charge the day's
/// counter.
pub struct OracleGateway<O: Oracle> {
    inner: O,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl<O: Oracle> Oracle for OracleGateway<O> {
    async fn generate(&self, req: &GenerationRequest) -> Result<GenerationResponse, OracleError> {
        OracleGateway::generate(self, req).await
    }
}

impl<O: Oracle> OracleGateway<O> {
    pub fn new(inner: O) -> Self {
        Self {
            inner,
            config: GatewayConfig::default(),
        }
    }

    pub fn with_config(inner: O, config: GatewayConfig) -> Self {
        Self { inner, config }
    }

    pub async fn generate(
        &self,
        req: &GenerationRequest,
    ) -> Result<GenerationResponse, OracleError> {
        let mut last_error: Option<OracleError> = None;

        for attempt in 0..=self.config.max_retries {
            match self.inner.generate(req).await {
                Ok(resp) => {
                    info!(
                        label = req.label,
                        model = %req.model,
                        input_tokens = resp.input_tokens,
                        output_tokens = resp.output_tokens,
                        latency_ms = resp.latency.as_millis() as u64,
                        "oracle call succeeded"
                    );
                    return Ok(resp);
                }
                Err(err) => {
                    warn!(
                        label = req.label,
                        model = %req.model,
                        code = err.code(),
                        attempt,
                        "oracle call failed"
                    );

                    if !err.is_retryable() || attempt == self.config.max_retries {
                        return Err(err);
                    }

                    let delay = backoff_delay(self.config.retry_base_delay, attempt);
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| OracleError::provider("oracle", "unknown error", false)))
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u64.pow(attempt.min(5));
    base * multiplier as u32
}
