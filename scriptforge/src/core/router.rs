//! Pure routing decision after each validation.
//!
//! Thresholds are fixed so that a given score always routes the same way.
//!
//! | overall score  | action  |
//! |----------------|---------|
//! | `>= 0.8`       | success |
//! | `[0.4, 0.8)`   | refine  |
//! | `[0.2, 0.4)`   | replan  |
//! | `< 0.2`        | fail    |

use crate::core::state::PipelineState;
use crate::core::types::RouteAction;

pub const SUCCESS_THRESHOLD: f64 = 0.8;
pub const REFINE_THRESHOLD: f64 = 0.4;
pub const REPLAN_THRESHOLD: f64 = 0.2;

#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    pub action: RouteAction,
    pub reason: String,
}

/// Route on the state's validation result and iteration counters.
pub fn route(state: &PipelineState) -> RouteDecision {
    route_score(
        state.validation.as_ref().map(|v| v.overall_score),
        state.iteration,
        state.max_iterations,
    )
}

/// Decision order: iteration ceiling, missing validation, then score bands.
pub fn route_score(score: Option<f64>, iteration: u32, max_iterations: u32) -> RouteDecision {
    if iteration >= max_iterations {
        return RouteDecision {
            action: RouteAction::Fail,
            reason: format!("max iterations exceeded ({iteration}/{max_iterations})"),
        };
    }
    let Some(score) = score else {
        return RouteDecision {
            action: RouteAction::Fail,
            reason: "no validation result".to_string(),
        };
    };
    let action = action_for_score(score);
    let reason = match action {
        RouteAction::Success => format!("score {score:.3} meets success threshold {SUCCESS_THRESHOLD}"),
        RouteAction::Refine => format!("score {score:.3} in refine band [{REFINE_THRESHOLD}, {SUCCESS_THRESHOLD})"),
        RouteAction::Replan => format!("score {score:.3} in replan band [{REPLAN_THRESHOLD}, {REFINE_THRESHOLD})"),
        RouteAction::Fail => format!("score {score:.3} below replan threshold {REPLAN_THRESHOLD}"),
    };
    RouteDecision { action, reason }
}

/// Score band lookup. NaN falls through to `Fail`.
pub fn action_for_score(score: f64) -> RouteAction {
    if score >= SUCCESS_THRESHOLD {
        RouteAction::Success
    } else if score >= REFINE_THRESHOLD {
        RouteAction::Refine
    } else if score >= REPLAN_THRESHOLD {
        RouteAction::Replan
    } else {
        RouteAction::Fail
    }
}
