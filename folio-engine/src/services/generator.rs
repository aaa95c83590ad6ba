//! Text generation backends
//!
//! The worker talks to generation through the `Generator` trait. The HTTP
//! backend posts prompts to the configured provider with a rate limiter in
//! front; the scripted backend replays canned responses for tests and dry
//! runs.

use crate::config::GeneratorSettings;
use async_trait::async_trait;
use folio_common::{Error, Result};
use governor::{Quota, RateLimiter};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Raw provider response plus whatever usage accounting it reported
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub raw: Value,
    pub tokens: u64,
}

/// One prompt in, one raw response out
///
/// Implementations must be safe to call concurrently; the worker serializes
/// chapter generations itself but runs independent nodes in parallel.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    async fn generate(&self, prompt: &str) -> Result<GenerationOutput>;
}

/// Token count as reported by the provider, zero when absent
fn token_usage(raw: &Value) -> u64 {
    raw.get("usage")
        .and_then(|usage| usage.get("total_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

// ============================================================================
// HTTP backend
// ============================================================================

/// Rate-limited HTTP generation client
pub struct HttpGenerator {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    rate_limiter: RateLimiter<
        governor::state::direct::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl HttpGenerator {
    /// Build from settings; fails when no generation URL is configured
    pub fn new(settings: &GeneratorSettings) -> Result<Self> {
        let url = settings
            .url
            .clone()
            .ok_or_else(|| Error::Config("GENERATOR_URL is not set".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Generator(format!("failed to build HTTP client: {}", e)))?;

        let per_second = NonZeroU32::new(settings.requests_per_second.max(1))
            .unwrap_or(NonZeroU32::MIN);
        let rate_limiter = RateLimiter::direct(Quota::per_second(per_second));

        Ok(Self {
            client,
            url,
            api_key: settings.api_key.clone(),
            rate_limiter,
        })
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    fn name(&self) -> &'static str {
        "HttpGenerator"
    }

    async fn generate(&self, prompt: &str) -> Result<GenerationOutput> {
        self.rate_limiter.until_ready().await;

        debug!(url = %self.url, prompt_chars = prompt.len(), "Sending generation request");

        let mut request = self.client.post(&self.url).json(&json!({ "prompt": prompt }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Generator(format!("generation request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(Error::Generator(format!(
                "generation endpoint returned {}: {}",
                status, snippet
            )));
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|e| Error::Generator(format!("generation response was not JSON: {}", e)))?;
        let tokens = token_usage(&raw);

        Ok(GenerationOutput { raw, tokens })
    }
}

// ============================================================================
// Scripted backend
// ============================================================================

/// Replays canned responses in order; errors once the script runs out
///
/// Records every prompt it receives so tests can assert on the continuity
/// context that reached the generator.
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<Value>>,
    prompts: Mutex<Vec<String>>,
    failure: Option<String>,
}

impl ScriptedGenerator {
    pub fn new(responses: Vec<Value>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            prompts: Mutex::new(Vec::new()),
            failure: None,
        }
    }

    /// A generator that fails every call with the given message
    pub fn always_failing(message: &str) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
            failure: Some(message.to_string()),
        }
    }

    /// Prompts received so far, in call order
    pub async fn prompts(&self) -> Vec<String> {
        self.prompts.lock().await.clone()
    }

    /// Append a response to the end of the script
    pub async fn push_response(&self, response: Value) {
        self.responses.lock().await.push_back(response);
    }

    pub async fn remaining(&self) -> usize {
        self.responses.lock().await.len()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &'static str {
        "ScriptedGenerator"
    }

    async fn generate(&self, prompt: &str) -> Result<GenerationOutput> {
        self.prompts.lock().await.push(prompt.to_string());

        if let Some(message) = &self.failure {
            return Err(Error::Generator(message.clone()));
        }

        let raw = self
            .responses
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| Error::Generator("scripted responses exhausted".to_string()))?;
        let tokens = token_usage(&raw);
        Ok(GenerationOutput { raw, tokens })
    }
}

// ============================================================================
// Tests
// ============================================================================
