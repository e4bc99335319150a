//! Text generation capability consumed by every agent.
//!
//! The [`TextGenerator`] trait decouples agents from the model backend.
//! Production uses [`CommandGenerator`], which shells out to a CLI model
//! client; tests use scripted generators that return queued replies without
//! spawning processes.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::io::config::GeneratorCommandConfig;
use crate::io::process::run_command_with_timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
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

/// Parameters for one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub messages: Vec<Message>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub content: String,
    pub model: String,
    pub provider: String,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
    #[serde(with = "crate::core::types::duration_millis")]
    pub latency: Duration,
}

/// Abstraction over text generation backends.
///
/// Implementations must be safe to share across concurrent requests; errors
/// are opaque and retried by the caller.
pub trait TextGenerator: Send + Sync {
    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse>;
}

/// Generator that spawns a CLI model client and reads its reply from stdout.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    config: GeneratorCommandConfig,
}

impl CommandGenerator {
    pub fn new(config: GeneratorCommandConfig) -> Self {
        Self { config }
    }
}

impl TextGenerator for CommandGenerator {
    #[instrument(skip_all, fields(model = %request.model, messages = request.messages.len()))]
    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("generator command is empty"))?;
        info!(program = %program, "starting command generator");

        let mut cmd = Command::new(program);
        cmd.args(args);
        let prompt = render_conversation(&request.messages);
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            timeout,
            self.config.output_limit_bytes,
        )
        .with_context(|| format!("run generator command {program}"))?;

        if output.timed_out {
            warn!(timeout_secs = timeout.as_secs(), "generator command timed out");
            return Err(anyhow!("generator command timed out after {timeout:?}"));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.exit_code(), "generator command failed");
            return Err(anyhow!(
                "generator command failed with status {:?}: {}",
                output.exit_code(),
                output.stderr_text().trim()
            ));
        }

        let content = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if content.is_empty() {
            return Err(anyhow!("generator command produced no output"));
        }
        debug!(bytes = content.len(), "command generator completed");
        Ok(GenerationResponse {
            content,
            model: request.model.clone(),
            provider: program.clone(),
            usage: TokenUsage::default(),
            finish_reason: Some(if output.stdout_truncated > 0 {
                "length".to_string()
            } else {
                "stop".to_string()
            }),
            latency: output.elapsed,
        })
    }
}

/// Flatten a conversation into one prompt for single-turn CLI clients.
pub fn render_conversation(messages: &[Message]) -> String {
    let mut buf = String::new();
    for message in messages {
        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str("## ");
        buf.push_str(message.role.as_str());
        buf.push('\n');
        buf.push_str(message.content.trim());
    }
    buf.push('\n');
    buf
}
