//! Design pipeline orchestrator.
//!
//! A [`Pipeline`] is built once per configuration and reused across requests.
//! Everything a single request mutates lives in its own [`PipelineState`], so
//! one pipeline can serve concurrent requests from several threads.
//!
//! Node order is fixed: planner, generator, executor, validator. After the
//! validator the router picks the next edge: `refine` re-enters the generator
//! with the same task graph, `replan` re-enters the planner, `success` and
//! `fail` terminate.

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::agents::{
    AgentBase, ExecutorAgent, GenerationInput, GeneratorAgent, PlannerAgent, ValidatorAgent,
};
use crate::core::router::{self, RouteDecision};
use crate::core::state::{NodeKind, PipelineState};
use crate::core::types::{DesignRequest, DesignStatus, ExecutionResult, RouteAction};
use crate::core::validation::Severity;
use crate::error::{AgentError, ConfigError};
use crate::io::config::ForgeConfig;
use crate::io::events::{EventSink, EventStatus, NullSink, PipelineEvent, emit_quietly};
use crate::io::generator::TextGenerator;
use crate::io::prompt::PromptEngine;
use crate::io::store::RequestStore;
use crate::sandbox::{InProcessRuntime, Sandbox};

/// Issues quoted in a replan note.
const REPLAN_NOTE_ISSUES: usize = 3;

pub struct Pipeline {
    planner: PlannerAgent,
    generator: GeneratorAgent,
    executor: ExecutorAgent,
    validator: ValidatorAgent,
    sandbox: Arc<Sandbox>,
    sink: Arc<dyn EventSink>,
    store: Option<Arc<dyn RequestStore>>,
    default_max_iterations: u32,
}

impl Pipeline {
    /// Build every agent from `config`. All agents share `generator`.
    pub fn new(config: &ForgeConfig, generator: Arc<dyn TextGenerator>) -> Result<Self> {
        config.validate()?;
        let prompts = Arc::new(PromptEngine::new()?);
        let sandbox = Arc::new(Sandbox::new(config.sandbox.clone()));

        let base = |name: &'static str, settings| {
            AgentBase::new(name, generator.clone(), settings, config.model.clone())
        };
        let planner = PlannerAgent::new(
            base("planner", config.agents.planner.clone())?,
            prompts.clone(),
            config.planner.clone(),
        )?;
        let allowed_modules = sandbox.policy().allowed_modules.iter().cloned().collect();
        let generator_agent = GeneratorAgent::new(
            base("generator", config.agents.generator.clone())?,
            prompts.clone(),
            allowed_modules,
        );
        let validator = ValidatorAgent::new(
            base("validator", config.agents.validator.clone())?,
            prompts,
        )?;

        Ok(Self {
            planner,
            generator: generator_agent,
            executor: ExecutorAgent::new(sandbox.clone()),
            validator,
            sandbox,
            sink: Arc::new(NullSink),
            store: None,
            default_max_iterations: config.max_iterations,
        })
    }

    /// Execute scripts through a host runtime instead of a child interpreter.
    pub fn with_runtime(mut self, runtime: Arc<dyn InProcessRuntime>) -> Self {
        self.executor = self.executor.with_runtime(runtime);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Write a snapshot to `store` after every node.
    pub fn with_store(mut self, store: Arc<dyn RequestStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn default_max_iterations(&self) -> u32 {
        self.default_max_iterations
    }

    /// Build a request from `prompt` and run it to a terminal state.
    ///
    /// Errors only for a prompt that is too short or a zero iteration
    /// ceiling; design failures come back as a failed state.
    pub fn run_prompt(&self, prompt: &str, max_iterations: Option<u32>) -> Result<PipelineState> {
        let max_iterations = max_iterations.unwrap_or(self.default_max_iterations);
        if max_iterations == 0 {
            return Err(ConfigError::ZeroIterations.into());
        }
        let request = DesignRequest::new(prompt)?;
        Ok(self.run(request, max_iterations))
    }

    /// Run `request` until it completes or fails. Never panics on agent
    /// failures; they end the run as a failed state.
    #[instrument(skip_all, fields(request_id = %request.id(), max_iterations = max_iterations))]
    pub fn run(&self, request: DesignRequest, max_iterations: u32) -> PipelineState {
        let mut state = PipelineState::new(request, max_iterations);
        let mut next = Some(NodeKind::Planner);
        while let Some(node) = next {
            next = self.step(&mut state, node);
        }

        let status = if state.design.status == DesignStatus::Completed {
            EventStatus::Completed
        } else {
            EventStatus::Failed
        };
        let mut event = PipelineEvent::new(state.request().id(), None, status, state.attempt())
            .with("iterations", state.attempt());
        if let Some(score) = state.design.score {
            event = event.with("score", score);
        }
        if let Some(reason) = &state.design.error_message {
            event = event.with("reason", reason.as_str());
        }
        emit_quietly(self.sink.as_ref(), &event);
        self.save(&state);

        info!(
            status = ?state.design.status,
            attempts = state.attempt(),
            score = ?state.design.score,
            errors = state.error_count,
            "design finished"
        );
        state
    }

    /// Run one node and return the node to enter next, if any.
    fn step(&self, state: &mut PipelineState, node: NodeKind) -> Option<NodeKind> {
        let entered = state.enter_node(node);
        self.emit(state, Some(node), EventStatus::Started);
        self.save(state);

        let outcome = match node {
            NodeKind::Planner => self.plan(state),
            NodeKind::Generator => self.generate(state),
            NodeKind::Executor => self.execute(state),
            NodeKind::Validator => self.validate(state),
        };

        let next = match outcome {
            Ok(metadata) => {
                state.exit_node(node, entered, None);
                let mut event = PipelineEvent::new(
                    state.request().id(),
                    Some(node),
                    EventStatus::Completed,
                    state.attempt(),
                );
                for (key, value) in metadata {
                    event = event.with(key, value);
                }
                emit_quietly(self.sink.as_ref(), &event);
                match node {
                    NodeKind::Planner => Some(NodeKind::Generator),
                    NodeKind::Generator => Some(NodeKind::Executor),
                    NodeKind::Executor => Some(NodeKind::Validator),
                    NodeKind::Validator => self.route(state),
                }
            }
            Err(err) => {
                let message = err.to_string();
                warn!(node = %node, err = %message, "node failed");
                state.exit_node(node, entered, Some(message.clone()));
                state.record_error(message.clone());
                let event = PipelineEvent::new(
                    state.request().id(),
                    Some(node),
                    EventStatus::Failed,
                    state.attempt(),
                )
                .with("error", message.as_str());
                emit_quietly(self.sink.as_ref(), &event);
                state.fail(message);
                None
            }
        };
        self.save(state);
        next
    }

    fn plan(&self, state: &mut PipelineState) -> Result<Vec<(&'static str, Value)>, AgentError> {
        let graph = self
            .planner
            .plan(state.request(), &state.replan_context)?;
        let tasks = graph.len();
        debug!(summary = %graph.summary(), "task graph");
        state.task_graph = Some(graph);
        state.script = None;
        state.execution = None;
        state.validation = None;
        Ok(vec![("tasks", Value::from(tasks))])
    }

    fn generate(&self, state: &mut PipelineState) -> Result<Vec<(&'static str, Value)>, AgentError> {
        let refining = state.next_action == Some(RouteAction::Refine);
        let feedback = if refining {
            state.validation.as_ref().map(|v| v.feedback())
        } else {
            None
        };
        let script = self.generator.generate(GenerationInput {
            request: state.request(),
            task_graph: state.task_graph.as_ref(),
            previous_script: if refining { state.script.as_deref() } else { None },
            feedback: feedback.as_deref(),
        })?;
        let bytes = script.len();
        state.script = Some(script);
        state.execution = None;
        state.validation = None;
        Ok(vec![("script_bytes", Value::from(bytes)), ("refine", Value::from(refining))])
    }

    fn execute(&self, state: &mut PipelineState) -> Result<Vec<(&'static str, Value)>, AgentError> {
        let script = state.script.as_deref().ok_or(AgentError::Internal {
            agent: "executor",
            message: "no script to execute".to_string(),
        })?;
        let result = self.executor.execute(script, state.request());
        record_task_outcome(state, &result);
        let metadata = vec![
            ("execution_status", serde_json::to_value(result.status).unwrap_or(Value::Null)),
            ("created_objects", Value::from(result.created_objects.len())),
        ];
        state.execution = Some(result);
        Ok(metadata)
    }

    fn validate(&self, state: &mut PipelineState) -> Result<Vec<(&'static str, Value)>, AgentError> {
        let (Some(script), Some(execution)) = (state.script.as_deref(), state.execution.as_ref())
        else {
            return Err(AgentError::Internal {
                agent: "validator",
                message: "nothing to validate: no script or execution result".to_string(),
            });
        };
        let result = self.validator.validate(state.request(), script, execution);
        let score = result.overall_score;
        state.validation = Some(result);
        Ok(vec![("score", Value::from(score))])
    }

    /// Apply the router's decision. A loop-back that would reach the
    /// iteration ceiling is turned into a failure before it is taken.
    fn route(&self, state: &mut PipelineState) -> Option<NodeKind> {
        let mut decision = router::route(state);
        if matches!(decision.action, RouteAction::Refine | RouteAction::Replan)
            && state.iteration + 1 >= state.max_iterations
        {
            decision = router::route_score(
                state.validation.as_ref().map(|v| v.overall_score),
                state.iteration + 1,
                state.max_iterations,
            );
        }
        let RouteDecision { action, reason } = decision;
        info!(action = action.as_str(), reason = %reason, attempt = state.attempt(), "routed");

        let mut event = PipelineEvent::new(
            state.request().id(),
            Some(NodeKind::Validator),
            EventStatus::Routed,
            state.attempt(),
        )
        .with("action", action.as_str())
        .with("reason", reason.as_str());
        if let Some(validation) = &state.validation {
            event = event.with("score", validation.overall_score);
        }
        emit_quietly(self.sink.as_ref(), &event);

        state.next_action = Some(action);
        state.route_reason = Some(reason.clone());
        match action {
            RouteAction::Success => {
                state.complete();
                None
            }
            RouteAction::Fail => {
                state.fail(reason);
                None
            }
            RouteAction::Refine => {
                state.record_loop_back(NodeKind::Generator);
                Some(NodeKind::Generator)
            }
            RouteAction::Replan => {
                let note = replan_note(state);
                state.replan_context.push(note);
                state.task_graph = None;
                state.record_loop_back(NodeKind::Planner);
                Some(NodeKind::Planner)
            }
        }
    }

    fn emit(&self, state: &PipelineState, node: Option<NodeKind>, status: EventStatus) {
        let event = PipelineEvent::new(state.request().id(), node, status, state.attempt());
        emit_quietly(self.sink.as_ref(), &event);
    }

    fn save(&self, state: &PipelineState) {
        if let Some(store) = &self.store
            && let Err(err) = store.put(state.snapshot())
        {
            warn!(
                err = %format!("{err:#}"),
                request_id = %state.request().id(),
                "snapshot write failed"
            );
        }
    }
}

/// Mirror one whole-script execution onto the task graph.
///
/// The script covers every task, so all of them share its outcome.
fn record_task_outcome(state: &mut PipelineState, result: &ExecutionResult) {
    let Some(graph) = state.task_graph.as_mut() else {
        return;
    };
    let Ok(levels) = graph.execution_order() else {
        return;
    };
    let failure = (!result.success).then(|| {
        result
            .stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("script failed")
            .to_string()
    });
    for id in levels.iter().flatten() {
        let marked = graph.mark_started(id).and_then(|()| match &failure {
            None => graph.mark_completed(id, None),
            Some(message) => graph.mark_failed(id, message.clone()),
        });
        if let Err(err) = marked {
            warn!(task = %id, err = %err, "task bookkeeping failed");
        }
    }
}

/// Failure context handed to the planner when replanning.
fn replan_note(state: &PipelineState) -> String {
    let Some(validation) = &state.validation else {
        return format!("attempt {} produced no validation result", state.attempt());
    };
    let issues: Vec<&str> = validation
        .issues
        .iter()
        .filter(|issue| issue.severity >= Severity::Warning)
        .take(REPLAN_NOTE_ISSUES)
        .map(|issue| issue.message.as_str())
        .collect();
    let detail = if issues.is_empty() {
        "no issues reported".to_string()
    } else {
        issues.join("; ")
    };
    format!(
        "attempt {} scored {:.2}: {detail}",
        state.attempt(),
        validation.overall_score
    )
}
