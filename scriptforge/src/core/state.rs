//! Per-request pipeline state.
//!
//! One [`PipelineState`] is created per request and threaded through every
//! node; nodes read earlier fields and write their own outputs. Nothing here is
//! shared between requests.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::task_graph::TaskGraph;
use crate::core::types::{
    DesignRequest, DesignState, DesignStatus, ExecutionResult, RouteAction, duration_millis,
};
use crate::core::validation::DesignValidationResult;

/// Pipeline nodes, in their unconditional order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Planner,
    Generator,
    Executor,
    Validator,
}

impl NodeKind {
    pub const ALL: [NodeKind; 4] = [
        NodeKind::Planner,
        NodeKind::Generator,
        NodeKind::Executor,
        NodeKind::Validator,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Planner => "planner",
            NodeKind::Generator => "generator",
            NodeKind::Executor => "executor",
            NodeKind::Validator => "validator",
        }
    }

    /// Design status shown while this node runs.
    pub fn design_status(self) -> DesignStatus {
        match self {
            NodeKind::Planner => DesignStatus::Planning,
            NodeKind::Generator => DesignStatus::Generating,
            NodeKind::Executor => DesignStatus::Executing,
            NodeKind::Validator => DesignStatus::Validating,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the append-only visit history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeVisit {
    pub node: NodeKind,
    /// Attempt number (1-indexed) the visit belonged to.
    pub attempt: u32,
    pub entered_at: DateTime<Utc>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub error: Option<String>,
}

/// Polling view of a request, as written to a request store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub request_id: String,
    pub status: DesignStatus,
    pub iteration: u32,
    pub script: Option<String>,
    pub validation_score: Option<f64>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineState {
    pub design: DesignState,
    pub current_node: Option<NodeKind>,
    pub previous_node: Option<NodeKind>,
    pub history: Vec<NodeVisit>,
    /// Loop-backs taken so far (refine or replan). The first attempt runs at 0.
    pub iteration: u32,
    pub max_iterations: u32,
    pub task_graph: Option<TaskGraph>,
    pub script: Option<String>,
    pub execution: Option<ExecutionResult>,
    pub validation: Option<DesignValidationResult>,
    pub next_action: Option<RouteAction>,
    pub route_reason: Option<String>,
    /// Cumulative time spent in each node.
    pub node_durations: BTreeMap<NodeKind, Duration>,
    pub error_count: u32,
    pub last_error: Option<String>,
    /// Times each node was re-entered through a loop-back edge.
    pub retry_counts: BTreeMap<NodeKind, u32>,
    /// Failure context handed to the planner on replans.
    pub replan_context: Vec<String>,
}

impl PipelineState {
    pub fn new(request: DesignRequest, max_iterations: u32) -> Self {
        Self {
            design: DesignState::new(request),
            current_node: None,
            previous_node: None,
            history: Vec::new(),
            iteration: 0,
            max_iterations,
            task_graph: None,
            script: None,
            execution: None,
            validation: None,
            next_action: None,
            route_reason: None,
            node_durations: BTreeMap::new(),
            error_count: 0,
            last_error: None,
            retry_counts: BTreeMap::new(),
            replan_context: Vec::new(),
        }
    }

    pub fn request(&self) -> &DesignRequest {
        &self.design.request
    }

    /// Current attempt number, 1-indexed.
    pub fn attempt(&self) -> u32 {
        self.iteration + 1
    }

    pub fn is_terminal(&self) -> bool {
        self.design.status.is_terminal()
    }

    /// Mark `node` as running and return the entry instant for [`Self::exit_node`].
    pub fn enter_node(&mut self, node: NodeKind) -> (Instant, DateTime<Utc>) {
        self.previous_node = self.current_node;
        self.current_node = Some(node);
        self.design.status = node.design_status();
        (Instant::now(), Utc::now())
    }

    /// Append the visit to history and accumulate its duration.
    pub fn exit_node(
        &mut self,
        node: NodeKind,
        entered: (Instant, DateTime<Utc>),
        error: Option<String>,
    ) {
        let duration = entered.0.elapsed();
        *self.node_durations.entry(node).or_default() += duration;
        self.history.push(NodeVisit {
            node,
            attempt: self.attempt(),
            entered_at: entered.1,
            duration,
            error,
        });
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.error_count += 1;
        self.last_error = Some(message.into());
    }

    pub fn record_loop_back(&mut self, node: NodeKind) {
        self.iteration += 1;
        *self.retry_counts.entry(node).or_default() += 1;
    }

    pub fn complete(&mut self) {
        self.design.status = DesignStatus::Completed;
        self.design.script = self.script.clone();
        self.design.score = self.validation.as_ref().map(|v| v.overall_score);
        self.design.error_message = None;
        self.current_node = None;
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.design.status = DesignStatus::Failed;
        self.design.script = self.script.clone();
        self.design.score = self.validation.as_ref().map(|v| v.overall_score);
        self.design.error_message = Some(reason.into());
        self.current_node = None;
    }

    pub fn snapshot(&self) -> RequestSnapshot {
        RequestSnapshot {
            request_id: self.request().id().to_string(),
            status: self.design.status,
            iteration: self.attempt(),
            script: self.script.clone(),
            validation_score: self.validation.as_ref().map(|v| v.overall_score),
            error_message: self.design.error_message.clone(),
        }
    }

    /// Node names in visit order.
    pub fn visited_nodes(&self) -> Vec<NodeKind> {
        self.history.iter().map(|visit| visit.node).collect()
    }
}
