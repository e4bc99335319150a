//! Planner agent: decomposes a prompt into a validated task graph.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use jsonschema::Validator;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::core::task_graph::{DependencyKind, OperationType, TaskGraph, TaskNode};
use crate::core::types::DesignRequest;
use crate::error::PlanningError;
use crate::io::config::PlannerConfig;
use crate::io::generator::Message;
use crate::io::prompt::{PlannerPrompt, PromptEngine};

use super::{AgentBase, compile_schema, parse_checked};

const PLAN_SCHEMA: &str = include_str!("../../schemas/plan.schema.json");

const SYSTEM_PROMPT: &str =
    "You are a CAD planning engine. You answer only with the requested JSON.";

#[derive(Debug, Deserialize)]
struct RawPlan {
    tasks: Vec<RawTask>,
}

#[derive(Debug, Deserialize)]
struct RawTask {
    id: String,
    description: String,
    operation: OperationType,
    #[serde(default)]
    parameters: BTreeMap<String, Value>,
    #[serde(default)]
    dependencies: Vec<String>,
}

pub struct PlannerAgent {
    base: AgentBase,
    prompts: Arc<PromptEngine>,
    schema: Validator,
    config: PlannerConfig,
}

impl PlannerAgent {
    pub fn new(base: AgentBase, prompts: Arc<PromptEngine>, config: PlannerConfig) -> Result<Self> {
        Ok(Self {
            base,
            prompts,
            schema: compile_schema(PLAN_SCHEMA)?,
            config,
        })
    }

    /// Produce an acyclic task graph for `request`.
    ///
    /// Malformed or cyclic replies are rejected and the model is asked again
    /// with the rejection reason, up to `max_plan_attempts` times.
    /// `replan_context` carries failure notes from earlier attempts.
    #[instrument(skip_all, fields(request_id = %request.id(), replan = !replan_context.is_empty()))]
    pub fn plan(
        &self,
        request: &DesignRequest,
        replan_context: &[String],
    ) -> Result<TaskGraph, PlanningError> {
        let constraints = (!request.constraints().is_empty())
            .then(|| serde_json::to_string_pretty(request.constraints()).ok())
            .flatten();
        let mut rejection: Option<String> = None;

        for attempt in 1..=self.config.max_plan_attempts {
            let prompt = self
                .prompts
                .render_planner(&PlannerPrompt {
                    prompt: request.prompt(),
                    constraints: constraints.clone(),
                    max_tasks: self.config.max_tasks,
                    replan_context,
                    rejection: rejection.as_deref(),
                })
                .map_err(PlanningError::Prompt)?;
            let response = self.base.call_model(
                vec![Message::system(SYSTEM_PROMPT), Message::user(prompt)],
                "plan design",
            )?;

            match self.parse_plan(&response.content) {
                Ok(graph) => {
                    info!(attempt, tasks = graph.len(), "plan accepted");
                    return Ok(graph);
                }
                Err(reason) => {
                    warn!(attempt, reason = %reason, "plan rejected");
                    rejection = Some(reason);
                }
            }
        }

        Err(PlanningError::Rejected {
            attempts: self.config.max_plan_attempts,
            reason: rejection.unwrap_or_else(|| "no plan produced".to_string()),
        })
    }

    /// Turn a model reply into a task graph, or explain why it is unusable.
    fn parse_plan(&self, reply: &str) -> Result<TaskGraph, String> {
        let value = parse_checked(reply, &self.schema)?;
        let plan: RawPlan =
            serde_json::from_value(value).map_err(|e| format!("plan has invalid fields: {e}"))?;
        if plan.tasks.len() > self.config.max_tasks {
            return Err(format!(
                "plan has {} tasks; at most {} are allowed",
                plan.tasks.len(),
                self.config.max_tasks
            ));
        }

        let mut graph = TaskGraph::new();
        let mut edges = Vec::new();
        for task in plan.tasks {
            for dep in &task.dependencies {
                edges.push((dep.clone(), task.id.clone()));
            }
            graph
                .add_task(TaskNode::new(
                    task.id,
                    task.description,
                    task.operation,
                    task.parameters,
                ))
                .map_err(|e| e.to_string())?;
        }

        let errors: Vec<String> = edges
            .iter()
            .filter_map(|(from, to)| {
                graph
                    .add_dependency(from, to, DependencyKind::Requires)
                    .err()
                    .map(|e| format!("{e} (dependency of '{to}')"))
            })
            .collect();
        if !errors.is_empty() {
            return Err(errors.join("; "));
        }
        if graph.has_cycles() {
            return Err("task graph contains a cycle; dependencies must form a DAG".to_string());
        }
        Ok(graph)
    }
}
