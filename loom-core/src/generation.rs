//! Text generation seam.
//!
//! Everything that talks to a language model goes through the
//! [`TextGenerator`] trait, so extraction and rewriting can run against
//! a real client or a scripted test double.

use oracle::{Message, Oracle, Request};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("generation backend error: {0}")]
    Backend(String),

    #[error("generation returned empty output")]
    Empty,
}

/// One generation call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: String,
    pub prompt: String,
    pub json_mode: bool,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl GenerationRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            json_mode: false,
            max_tokens: 4096,
            temperature: 0.2,
        }
    }

    pub fn with_json_mode(mut self) -> Self {
        self.json_mode = true;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// A backend that turns a prompt into text.
pub trait TextGenerator {
    fn generate(
        &self,
        request: &GenerationRequest,
    ) -> impl std::future::Future<Output = Result<String, GenerateError>> + Send;
}

impl TextGenerator for Oracle {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerateError> {
        let mut req = Request::new(vec![
            Message::system(request.system.clone()),
            Message::user(request.prompt.clone()),
        ])
        .with_max_tokens(request.max_tokens as usize)
        .with_temperature(request.temperature);
        if request.json_mode {
            req = req.with_json_mode();
        }
        let completion = self
            .complete(req)
            .await
            .map_err(|e| GenerateError::Backend(e.to_string()))?;
        if completion.content.trim().is_empty() {
            return Err(GenerateError::Empty);
        }
        Ok(completion.content)
    }
}

/// Retry schedule for generation calls: bounded attempts with doubling
/// backoff, each attempt under a per-call deadline.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            deadline: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry (attempt is zero-based; the first
    /// attempt has no delay).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            Duration::ZERO
        } else {
            self.base_delay * 2u32.saturating_pow(attempt - 1)
        }
    }
}
