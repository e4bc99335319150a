//! Pipeline configuration stored as TOML.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Pipeline configuration (TOML).
///
/// Missing fields default to values suitable for a local interpreter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ForgeConfig {
    /// Design iteration ceiling used when a request does not set its own.
    pub max_iterations: u32,

    pub model: ModelConfig,

    pub agents: AgentsConfig,

    pub planner: PlannerConfig,

    pub sandbox: SandboxConfig,

    pub generator_command: GeneratorCommandConfig,
}

/// Retry policy shared by every model call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    pub max_retries: u32,
    /// First backoff delay; doubles after every failed attempt.
    pub retry_base_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentsConfig {
    pub planner: AgentSettings,
    pub generator: AgentSettings,
    pub validator: AgentSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlannerConfig {
    /// Model round-trips allowed to produce a well-formed, acyclic plan.
    pub max_plan_attempts: u32,
    pub max_tasks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Interpreter argv; the prepared program is written to its stdin.
    pub interpreter: Vec<String>,
    /// Reject (rather than warn about) modules outside the allow-list.
    pub strict: bool,
    pub allow_file_io: bool,
    pub timeout_secs: u64,
    pub memory_limit_mb: u64,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Scripting modules of the target engine.
    pub engine_modules: Vec<String>,
    /// Added to the built-in math/data allow-list.
    pub extra_allowed_modules: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorCommandConfig {
    /// Command for the CLI-backed text generator (e.g. `["codex","exec","-"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            model: ModelConfig::default(),
            agents: AgentsConfig::default(),
            planner: PlannerConfig::default(),
            sandbox: SandboxConfig::default(),
            generator_command: GeneratorCommandConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 1000,
        }
    }
}

impl ModelConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            temperature: 0.2,
            max_tokens: 4096,
        }
    }
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            planner: AgentSettings {
                temperature: 0.2,
                ..AgentSettings::default()
            },
            generator: AgentSettings {
                temperature: 0.1,
                max_tokens: 8192,
                ..AgentSettings::default()
            },
            validator: AgentSettings {
                temperature: 0.0,
                max_tokens: 2048,
                ..AgentSettings::default()
            },
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_plan_attempts: 2,
            max_tasks: 25,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: vec!["python3".to_string(), "-I".to_string(), "-".to_string()],
            strict: true,
            allow_file_io: false,
            timeout_secs: 30,
            memory_limit_mb: 1024,
            output_limit_bytes: 100_000,
            engine_modules: [
                "FreeCAD",
                "App",
                "Part",
                "PartDesign",
                "Sketcher",
                "Draft",
                "Mesh",
            ]
            .iter()
            .map(|m| m.to_string())
            .collect(),
            extra_allowed_modules: Vec::new(),
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for GeneratorCommandConfig {
    fn default() -> Self {
        Self {
            command: vec!["codex".to_string(), "exec".to_string(), "-".to_string()],
            timeout_secs: 300,
            output_limit_bytes: 200_000,
        }
    }
}

impl ForgeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        if self.model.max_retries == 0 {
            return Err(ConfigError::ZeroRetries);
        }
        for settings in [
            &self.agents.planner,
            &self.agents.generator,
            &self.agents.validator,
        ] {
            validate_temperature(settings.temperature)?;
        }
        if self.planner.max_plan_attempts == 0 {
            return Err(ConfigError::Invalid(
                "planner.max_plan_attempts must be > 0".to_string(),
            ));
        }
        if self.planner.max_tasks == 0 {
            return Err(ConfigError::Invalid("planner.max_tasks must be > 0".to_string()));
        }
        if !non_empty_argv(&self.sandbox.interpreter) {
            return Err(ConfigError::Invalid(
                "sandbox.interpreter must be a non-empty array".to_string(),
            ));
        }
        if self.sandbox.timeout_secs == 0 {
            return Err(ConfigError::Invalid("sandbox.timeout_secs must be > 0".to_string()));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.output_limit_bytes must be > 0".to_string(),
            ));
        }
        if !non_empty_argv(&self.generator_command.command) {
            return Err(ConfigError::Invalid(
                "generator_command.command must be a non-empty array".to_string(),
            ));
        }
        if self.generator_command.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "generator_command.timeout_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn validate_temperature(temperature: f32) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&temperature) {
        return Err(ConfigError::TemperatureOutOfRange(temperature));
    }
    Ok(())
}

fn non_empty_argv(argv: &[String]) -> bool {
    argv.first().is_some_and(|program| !program.trim().is_empty())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ForgeConfig::default()`.
pub fn load_config(path: &Path) -> Result<ForgeConfig> {
    if !path.exists() {
        let cfg = ForgeConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ForgeConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ForgeConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
