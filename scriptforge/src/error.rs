//! Typed error taxonomy for the design pipeline.
//!
//! Script validation and execution failures are not errors here: they flow
//! through the pipeline as [`ScriptValidationReport`] and [`ExecutionResult`]
//! data so the router can refine instead of aborting.
//!
//! [`ScriptValidationReport`]: crate::sandbox::ScriptValidationReport
//! [`ExecutionResult`]: crate::core::types::ExecutionResult

use thiserror::Error;

/// Bad setup detected at construction or startup time.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("temperature {0} is outside [0, 1]")]
    TemperatureOutOfRange(f32),
    #[error("max_retries must be > 0")]
    ZeroRetries,
    #[error("max_iterations must be > 0")]
    ZeroIterations,
    #[error("{0}")]
    Invalid(String),
}

/// Rejected design request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("prompt must be at least {min} characters (got {actual})")]
    PromptTooShort { min: usize, actual: usize },
}

/// Text generation failed after every retry.
#[derive(Debug, Error)]
#[error("model call failed ({context}) after {attempts} attempt(s): {source}")]
pub struct ModelError {
    /// Caller-supplied label describing what the call was for.
    pub context: String,
    pub attempts: u32,
    #[source]
    pub source: anyhow::Error,
}

/// Structural violations of a task graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("duplicate task id '{0}'")]
    DuplicateTask(String),
    #[error("unknown task id '{0}'")]
    UnknownTask(String),
    #[error("task '{0}' cannot depend on itself")]
    SelfDependency(String),
    #[error("task graph contains a cycle")]
    Cycle,
}

/// Planner agent failures.
#[derive(Debug, Error)]
pub enum PlanningError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("plan rejected after {attempts} attempt(s): {reason}")]
    Rejected { attempts: u32, reason: String },
    #[error("render planner prompt: {0:#}")]
    Prompt(#[source] anyhow::Error),
}

/// Generator agent failures.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("model returned an empty script")]
    EmptyScript,
    #[error("nothing to generate from: no task graph and no previous script")]
    MissingInput,
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("render generator prompt: {0:#}")]
    Prompt(#[source] anyhow::Error),
}

/// An agent's own logic failed, independent of routing.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("planning failed: {0}")]
    Planning(#[from] PlanningError),
    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),
    #[error("{agent} failed: {message}")]
    Internal { agent: &'static str, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_error_message_carries_context_and_cause() {
        let err = ModelError {
            context: "planner".to_string(),
            attempts: 3,
            source: anyhow::anyhow!("connection reset"),
        };
        let msg = err.to_string();
        assert!(msg.contains("model call failed (planner)"));
        assert!(msg.contains("3 attempt(s)"));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn agent_error_wraps_planning_rejection() {
        let err: AgentError = PlanningError::Rejected {
            attempts: 2,
            reason: "task graph contains a cycle".to_string(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "planning failed: plan rejected after 2 attempt(s): task graph contains a cycle"
        );
    }
}
