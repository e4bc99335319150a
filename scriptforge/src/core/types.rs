//! Shared deterministic records threaded through the pipeline.
//!
//! These types are the typed boundary for model output: anything an agent
//! parses out of free text lands in one of these records before it moves
//! further down the pipeline.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::RequestError;

/// Minimum prompt length accepted by [`DesignRequest::new`].
pub const MIN_PROMPT_CHARS: usize = 5;

/// A user's design submission. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignRequest {
    id: String,
    prompt: String,
    created_at: DateTime<Utc>,
    constraints: BTreeMap<String, Value>,
}

impl DesignRequest {
    pub fn new(prompt: impl Into<String>) -> Result<Self, RequestError> {
        Self::with_constraints(prompt, BTreeMap::new())
    }

    pub fn with_constraints(
        prompt: impl Into<String>,
        constraints: BTreeMap<String, Value>,
    ) -> Result<Self, RequestError> {
        let prompt = prompt.into();
        let actual = prompt.trim().chars().count();
        if actual < MIN_PROMPT_CHARS {
            return Err(RequestError::PromptTooShort {
                min: MIN_PROMPT_CHARS,
                actual,
            });
        }
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            prompt,
            created_at: Utc::now(),
            constraints,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn constraints(&self) -> &BTreeMap<String, Value> {
        &self.constraints
    }
}

/// Lifecycle status of a design request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesignStatus {
    Pending,
    Planning,
    Generating,
    Executing,
    Validating,
    Completed,
    Failed,
}

impl DesignStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DesignStatus::Completed | DesignStatus::Failed)
    }
}

/// User-facing view of one design request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignState {
    pub request: DesignRequest,
    pub status: DesignStatus,
    /// Script of the final attempt, if one was generated.
    pub script: Option<String>,
    /// Overall score of the last validation, if any ran.
    pub score: Option<f64>,
    /// Human-readable failure reason; set only when `status` is `Failed`.
    pub error_message: Option<String>,
}

impl DesignState {
    pub fn new(request: DesignRequest) -> Self {
        Self {
            request,
            status: DesignStatus::Pending,
            script: None,
            score: None,
            error_message: None,
        }
    }
}

/// Classification of a single sandbox invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    ExecutionFailed,
    Timeout,
    ValidationFailed,
}

/// Normalized outcome of validating and running one script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed or never started.
    pub exit_code: Option<i32>,
    #[serde(with = "duration_millis")]
    pub execution_time: Duration,
    pub created_objects: Vec<String>,
    pub metadata: BTreeMap<String, Value>,
}

impl ExecutionResult {
    /// Result for a script that was rejected before running.
    pub fn validation_failed(errors: &[String]) -> Self {
        Self {
            success: false,
            status: ExecutionStatus::ValidationFailed,
            stdout: String::new(),
            stderr: errors.join("\n"),
            exit_code: None,
            execution_time: Duration::ZERO,
            created_objects: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Result for a failure inside the execution machinery itself.
    pub fn internal_failure(message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            success: false,
            status: ExecutionStatus::ExecutionFailed,
            stdout: String::new(),
            stderr: message.into(),
            exit_code: None,
            execution_time: elapsed,
            created_objects: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Outcome of statically inspecting a script.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScriptValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Modules and call targets that tripped the blocklist, in source order.
    pub blocked_operations: Vec<String>,
    /// Allow-listed modules the script actually imports, sorted and unique.
    pub allowed_modules_used: Vec<String>,
}

/// Next step chosen by the router after validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteAction {
    Success,
    Refine,
    Replan,
    Fail,
}

impl RouteAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteAction::Success => "success",
            RouteAction::Refine => "refine",
            RouteAction::Replan => "replan",
            RouteAction::Fail => "fail",
        }
    }
}

pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_rejects_short_prompt() {
        let err = DesignRequest::new("  box ").unwrap_err();
        assert_eq!(err, RequestError::PromptTooShort { min: 5, actual: 3 });
    }

    #[test]
    fn request_assigns_unique_ids() {
        let a = DesignRequest::new("create a cube").expect("request");
        let b = DesignRequest::new("create a cube").expect("request");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.prompt(), "create a cube");
        assert!(a.constraints().is_empty());
    }

    #[test]
    fn validation_failed_result_is_never_success() {
        let result = ExecutionResult::validation_failed(&["import of 'os' is blocked".to_string()]);
        assert!(!result.success);
        assert_eq!(result.status, ExecutionStatus::ValidationFailed);
        assert!(result.stderr.contains("'os'"));
        assert_eq!(result.exit_code, None);
    }

    #[test]
    fn execution_result_serializes_duration_as_millis() {
        let mut result = ExecutionResult::internal_failure("boom", Duration::from_millis(1500));
        result.created_objects.push("Box".to_string());
        let json = serde_json::to_value(&result).expect("serialize");
        assert_eq!(json["execution_time"], 1500);
        assert_eq!(json["status"], "execution_failed");
        let back: ExecutionResult = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, result);
    }
}
