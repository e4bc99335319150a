//! Prompt-to-CAD-script design pipeline.
//!
//! A design request flows through four agents: the planner decomposes the
//! prompt into a task graph, the generator writes one script for it, the
//! executor runs the script in a sandbox, and the validator scores the
//! result. A pure router then completes, refines, replans or fails the
//! request. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (task graphs, routing, scoring,
//!   per-request state). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (config files, model backends,
//!   process execution, events, request storage).
//!
//! [`agents`] and [`sandbox`] build on both; [`pipeline`] and [`service`]
//! orchestrate them.

pub mod agents;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod sandbox;
pub mod service;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
