//! Prompt templates for the four agents.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use serde_json::Value;

use crate::core::task_graph::{OperationType, TaskGraph};
use crate::core::types::ExecutionResult;

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const GENERATOR_TEMPLATE: &str = include_str!("prompts/generator.md");
const SEMANTIC_TEMPLATE: &str = include_str!("prompts/semantic.md");
const REVIEWER_TEMPLATE: &str = include_str!("prompts/reviewer.md");

/// Inputs for a planning prompt.
#[derive(Debug, Clone, Default)]
pub struct PlannerPrompt<'a> {
    pub prompt: &'a str,
    pub constraints: Option<String>,
    pub max_tasks: usize,
    /// Failure notes from earlier attempts (replan path).
    pub replan_context: &'a [String],
    /// Why the model's previous plan was rejected.
    pub rejection: Option<&'a str>,
}

/// Inputs for a generation prompt.
#[derive(Debug, Clone, Default)]
pub struct GeneratorPrompt<'a> {
    pub prompt: &'a str,
    pub levels: Vec<Vec<TaskView>>,
    pub allowed_modules: Vec<String>,
    pub previous_script: Option<&'a str>,
    pub feedback: Option<&'a str>,
}

/// Inputs for the semantic and reviewer assessments.
#[derive(Debug, Clone)]
pub struct AssessmentPrompt<'a> {
    pub prompt: &'a str,
    pub script: &'a str,
    pub execution: &'a ExecutionResult,
    pub geometric_score: Option<f64>,
    /// Captured output is cut to this many characters.
    pub excerpt_chars: usize,
}

/// Template view of one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskView {
    pub id: String,
    pub operation: String,
    pub description: String,
    pub parameters: String,
    pub dependencies: Vec<String>,
}

impl TaskView {
    /// Task views grouped by execution level.
    pub fn levels(graph: &TaskGraph, order: &[Vec<String>]) -> Vec<Vec<TaskView>> {
        order
            .iter()
            .map(|level| {
                level
                    .iter()
                    .filter_map(|id| graph.task(id))
                    .map(|task| TaskView {
                        id: task.id.clone(),
                        operation: task.operation.as_str().to_string(),
                        description: task.description.clone(),
                        parameters: Value::Object(
                            task.parameters
                                .iter()
                                .map(|(k, v)| (k.clone(), v.clone()))
                                .collect(),
                        )
                        .to_string(),
                        dependencies: task.dependencies.clone(),
                    })
                    .collect()
            })
            .collect()
    }
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("planner", PLANNER_TEMPLATE)
            .context("load planner template")?;
        env.add_template("generator", GENERATOR_TEMPLATE)
            .context("load generator template")?;
        env.add_template("semantic", SEMANTIC_TEMPLATE)
            .context("load semantic template")?;
        env.add_template("reviewer", REVIEWER_TEMPLATE)
            .context("load reviewer template")?;
        Ok(Self { env })
    }

    pub fn render_planner(&self, input: &PlannerPrompt<'_>) -> Result<String> {
        let operations: Vec<&str> = OperationType::KNOWN.iter().map(|op| op.as_str()).collect();
        let template = self.env.get_template("planner")?;
        let rendered = template.render(context! {
            prompt => input.prompt.trim(),
            constraints => input.constraints.as_deref(),
            max_tasks => input.max_tasks,
            operations => operations,
            replan_context => input.replan_context,
            rejection => input.rejection.map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }

    pub fn render_generator(&self, input: &GeneratorPrompt<'_>) -> Result<String> {
        let template = self.env.get_template("generator")?;
        let rendered = template.render(context! {
            prompt => input.prompt.trim(),
            levels => &input.levels,
            allowed_modules => &input.allowed_modules,
            previous_script => input.previous_script.map(str::trim_end).filter(|s| !s.is_empty()),
            feedback => input.feedback.map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }

    pub fn render_semantic(&self, input: &AssessmentPrompt<'_>) -> Result<String> {
        let execution = input.execution;
        let template = self.env.get_template("semantic")?;
        let metadata = (!execution.metadata.is_empty())
            .then(|| serde_json::to_string(&execution.metadata))
            .transpose()
            .context("serialize execution metadata")?;
        let rendered = template.render(context! {
            prompt => input.prompt.trim(),
            script => input.script.trim_end(),
            status => status_label(execution),
            created_objects => &execution.created_objects,
            metadata => metadata,
            stdout => excerpt(&execution.stdout, input.excerpt_chars),
        })?;
        Ok(rendered)
    }

    pub fn render_reviewer(&self, input: &AssessmentPrompt<'_>) -> Result<String> {
        let execution = input.execution;
        let template = self.env.get_template("reviewer")?;
        let rendered = template.render(context! {
            prompt => input.prompt.trim(),
            script => input.script.trim_end(),
            status => status_label(execution),
            geometric_score => input.geometric_score,
            stderr => excerpt(&execution.stderr, input.excerpt_chars),
        })?;
        Ok(rendered)
    }
}

fn status_label(execution: &ExecutionResult) -> String {
    match serde_json::to_value(execution.status) {
        Ok(Value::String(s)) => s,
        _ => format!("{:?}", execution.status),
    }
}

/// Keep the tail of long output, where errors usually are.
fn excerpt(text: &str, max_chars: usize) -> Option<String> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let count = text.chars().count();
    if count <= max_chars {
        return Some(text.to_string());
    }
    let tail: String = text.chars().skip(count - max_chars).collect();
    Some(format!("[... {} chars omitted]\n{tail}", count - max_chars))
}
