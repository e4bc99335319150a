//! Agents that make up the design pipeline, plus the shared model-call
//! contract they are built on.

use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Draft, Validator};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::error::{ConfigError, ModelError};
use crate::io::config::{AgentSettings, ModelConfig, validate_temperature};
use crate::io::generator::{GenerationRequest, GenerationResponse, Message, TextGenerator};

pub mod executor;
pub mod generator;
pub mod planner;
pub mod validator;

pub use executor::ExecutorAgent;
pub use generator::{GenerationInput, GeneratorAgent};
pub use planner::PlannerAgent;
pub use validator::ValidatorAgent;

/// Shared retry-with-backoff wrapper around a [`TextGenerator`].
#[derive(Clone)]
pub struct AgentBase {
    name: &'static str,
    generator: Arc<dyn TextGenerator>,
    settings: AgentSettings,
    retry: ModelConfig,
}

impl AgentBase {
    /// Fails fast on a temperature outside [0, 1] or a zero retry bound.
    pub fn new(
        name: &'static str,
        generator: Arc<dyn TextGenerator>,
        settings: AgentSettings,
        retry: ModelConfig,
    ) -> Result<Self, ConfigError> {
        validate_temperature(settings.temperature)?;
        if retry.max_retries == 0 {
            return Err(ConfigError::ZeroRetries);
        }
        Ok(Self {
            name,
            generator,
            settings,
            retry,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Call the model, retrying any failure up to `max_retries` attempts.
    ///
    /// The delay before attempt `n + 1` is `retry_base_delay * 2^(n - 1)`.
    #[instrument(skip_all, fields(agent = self.name, context = context))]
    pub fn call_model(
        &self,
        messages: Vec<Message>,
        context: &str,
    ) -> Result<GenerationResponse, ModelError> {
        let request = GenerationRequest {
            messages,
            model: self.settings.model.clone(),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        };
        let max_attempts = self.retry.max_retries;
        let mut last_error = None;
        for attempt in 1..=max_attempts {
            match self.generator.generate(&request) {
                Ok(response) => {
                    debug!(
                        attempt,
                        latency_ms = response.latency.as_millis() as u64,
                        "model call succeeded"
                    );
                    return Ok(response);
                }
                Err(err) => {
                    warn!(attempt, max_attempts, err = %format!("{err:#}"), "model call failed");
                    last_error = Some(err);
                    if attempt < max_attempts {
                        thread::sleep(backoff_delay(self.retry.retry_base_delay(), attempt));
                    }
                }
            }
        }
        Err(ModelError {
            context: context.to_string(),
            attempts: max_attempts,
            source: last_error.unwrap_or_else(|| anyhow!("no attempts were made")),
        })
    }
}

/// Delay after failed attempt `attempt` (1-indexed).
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor)
}

static JSON_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*\n(\{.*?\})\s*```").unwrap());
static CODE_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:python|py|Python)?[ \t]*\n(.*?)```").unwrap());

/// Pull a JSON object out of a model reply: a fenced block if present,
/// otherwise the outermost braces.
pub(crate) fn extract_json(reply: &str) -> Option<&str> {
    if let Some(caps) = JSON_FENCE_RE.captures(reply)
        && let Some(body) = caps.get(1)
    {
        return Some(body.as_str());
    }
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (start < end).then(|| &reply[start..=end])
}

/// Pull a script out of a model reply: the longest fenced block if any,
/// otherwise the whole reply.
pub(crate) fn extract_code(reply: &str) -> String {
    CODE_FENCE_RE
        .captures_iter(reply)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .max_by_key(|body| body.len())
        .unwrap_or(reply)
        .trim()
        .to_string()
}

/// Compile an embedded JSON Schema (Draft 2020-12).
pub(crate) fn compile_schema(raw: &str) -> Result<Validator> {
    let schema: Value = serde_json::from_str(raw).context("parse json schema")?;
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile json schema")
}

/// Parse `reply` as JSON and check it against `schema`.
pub(crate) fn parse_checked(reply: &str, schema: &Validator) -> Result<Value, String> {
    let raw = extract_json(reply).ok_or_else(|| "reply contained no JSON object".to_string())?;
    let value: Value = serde_json::from_str(raw).map_err(|e| format!("invalid JSON: {e}"))?;
    let messages: Vec<String> = schema.iter_errors(&value).map(|e| e.to_string()).collect();
    if !messages.is_empty() {
        return Err(format!("schema validation failed: {}", messages.join("; ")));
    }
    Ok(value)
}
