//! Validator agent: scores one design attempt.
//!
//! Three independent assessments feed the weighted overall score:
//! a deterministic geometric check of the execution result, and model-backed
//! semantic and reviewer passes. A model-backed pass that fails is dropped
//! from the weighting and reported as a warning.

use std::sync::Arc;

use anyhow::Result;
use jsonschema::Validator;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::core::types::{DesignRequest, ExecutionResult, ExecutionStatus};
use crate::core::validation::{DesignValidationResult, Severity};
use crate::io::generator::Message;
use crate::io::prompt::{AssessmentPrompt, PromptEngine};

use super::{AgentBase, compile_schema, parse_checked};

const ASSESSMENT_SCHEMA: &str = include_str!("../../schemas/assessment.schema.json");

const SYSTEM_PROMPT: &str =
    "You assess CAD scripts and their execution results. You answer only with the requested JSON.";

/// Captured output shown to assessors is cut to this many characters.
const DEFAULT_EXCERPT_CHARS: usize = 4000;

#[derive(Debug, Deserialize)]
struct Assessment {
    score: f64,
    #[serde(default)]
    issues: Vec<AssessmentIssue>,
    #[serde(default)]
    suggestions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AssessmentIssue {
    severity: Severity,
    message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Semantic,
    Reviewer,
}

impl Pass {
    fn as_str(self) -> &'static str {
        match self {
            Pass::Semantic => "semantic",
            Pass::Reviewer => "reviewer",
        }
    }
}

pub struct ValidatorAgent {
    base: AgentBase,
    prompts: Arc<PromptEngine>,
    schema: Validator,
    excerpt_chars: usize,
}

impl ValidatorAgent {
    pub fn new(base: AgentBase, prompts: Arc<PromptEngine>) -> Result<Self> {
        Ok(Self {
            base,
            prompts,
            schema: compile_schema(ASSESSMENT_SCHEMA)?,
            excerpt_chars: DEFAULT_EXCERPT_CHARS,
        })
    }

    #[instrument(skip_all, fields(request_id = %request.id(), status = ?execution.status))]
    pub fn validate(
        &self,
        request: &DesignRequest,
        script: &str,
        execution: &ExecutionResult,
    ) -> DesignValidationResult {
        let mut result = DesignValidationResult::default();

        let (geometric, findings) = geometric_assessment(execution);
        result.geometric_score = Some(geometric);
        for (severity, message) in findings {
            result.push_issue(severity, "geometric", message);
        }

        let prompt = AssessmentPrompt {
            prompt: request.prompt(),
            script,
            execution,
            geometric_score: Some(geometric),
            excerpt_chars: self.excerpt_chars,
        };
        result.semantic_score = self.model_pass(Pass::Semantic, &prompt, &mut result);
        result.reviewer_score = self.model_pass(Pass::Reviewer, &prompt, &mut result);

        result.finalize(execution.success);
        info!(
            overall = result.overall_score,
            geometric = ?result.geometric_score,
            semantic = ?result.semantic_score,
            reviewer = ?result.reviewer_score,
            issues = result.issues.len(),
            "design validated"
        );
        result
    }

    /// Run one model-backed pass, folding its issues into `result`.
    fn model_pass(
        &self,
        pass: Pass,
        prompt: &AssessmentPrompt<'_>,
        result: &mut DesignValidationResult,
    ) -> Option<f64> {
        match self.assess(pass, prompt) {
            Ok(assessment) => {
                for issue in assessment.issues {
                    result.push_issue(issue.severity, pass.as_str(), issue.message);
                }
                result.suggestions.extend(
                    assessment
                        .suggestions
                        .into_iter()
                        .filter(|s| !s.trim().is_empty()),
                );
                Some(assessment.score.clamp(0.0, 1.0))
            }
            Err(reason) => {
                warn!(pass = pass.as_str(), reason = %reason, "assessment unavailable");
                result.push_issue(
                    Severity::Warning,
                    pass.as_str(),
                    format!("assessment unavailable: {reason}"),
                );
                None
            }
        }
    }

    fn assess(&self, pass: Pass, prompt: &AssessmentPrompt<'_>) -> Result<Assessment, String> {
        let rendered = match pass {
            Pass::Semantic => self.prompts.render_semantic(prompt),
            Pass::Reviewer => self.prompts.render_reviewer(prompt),
        }
        .map_err(|e| format!("render prompt: {e:#}"))?;
        let response = self
            .base
            .call_model(
                vec![Message::system(SYSTEM_PROMPT), Message::user(rendered)],
                pass.as_str(),
            )
            .map_err(|e| e.to_string())?;
        let value = parse_checked(&response.content, &self.schema)?;
        let assessment: Assessment = serde_json::from_value(value)
            .map_err(|e| format!("assessment has invalid fields: {e}"))?;
        if !assessment.score.is_finite() {
            return Err("assessment score is not a finite number".to_string());
        }
        Ok(assessment)
    }
}

/// Deterministic score derived from the execution result alone.
pub fn geometric_assessment(execution: &ExecutionResult) -> (f64, Vec<(Severity, String)>) {
    if !execution.success {
        let detail = last_line(&execution.stderr);
        let message = match execution.status {
            ExecutionStatus::ValidationFailed => {
                format!("script was rejected before execution: {detail}")
            }
            ExecutionStatus::Timeout => format!(
                "execution timed out after {:.1}s",
                execution.execution_time.as_secs_f64()
            ),
            ExecutionStatus::ExecutionFailed | ExecutionStatus::Success => {
                format!("script failed: {detail}")
            }
        };
        return (0.0, vec![(Severity::Critical, message)]);
    }
    if execution.created_objects.is_empty() {
        return (
            0.3,
            vec![(
                Severity::Error,
                "script ran but reported no created objects (print CREATED:<name>)".to_string(),
            )],
        );
    }
    if execution.metadata.get("shape_valid") == Some(&Value::Bool(false)) {
        return (
            0.4,
            vec![(Severity::Error, "engine reported an invalid shape".to_string())],
        );
    }
    if !execution.stderr.trim().is_empty() {
        return (
            0.9,
            vec![(
                Severity::Warning,
                format!("script wrote to stderr: {}", last_line(&execution.stderr)),
            )],
        );
    }
    (1.0, Vec::new())
}

fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("no error output")
}
