//! End-to-end pipeline runs with scripted model replies and an in-process
//! runtime.
//!
//! Model replies are consumed in call order: planner, generator, semantic
//! assessor, reviewer, then again for every loop-back.

use std::sync::Arc;
use std::time::Duration;

use scriptforge::core::state::NodeKind;
use scriptforge::core::types::{DesignStatus, ExecutionStatus, RouteAction};
use scriptforge::io::config::ForgeConfig;
use scriptforge::io::events::EventStatus;
use scriptforge::io::store::{InMemoryStore, RequestStore};
use scriptforge::pipeline::Pipeline;
use scriptforge::sandbox::InProcessOutput;
use scriptforge::test_support::{
    CUBE_SCRIPT, FailingSink, RecordingSink, ScriptedGenerator, ScriptedRuntime, assessment_reply,
    plan_reply, plan_task, script_reply,
};

const CUBE_PROMPT: &str = "create a 10x10x10 cube";

fn config() -> ForgeConfig {
    let mut config = ForgeConfig::default();
    config.model.max_retries = 1;
    config.model.retry_base_delay_ms = 0;
    config
}

fn cube_plan() -> String {
    plan_reply(&[plan_task("cube", "primitive", &[])])
}

fn build(
    config: &ForgeConfig,
    generator: &Arc<ScriptedGenerator>,
    runtime: &Arc<ScriptedRuntime>,
) -> Pipeline {
    Pipeline::new(config, generator.clone())
        .expect("pipeline")
        .with_runtime(runtime.clone())
}

#[test]
fn cube_completes_on_first_attempt() {
    let generator = Arc::new(ScriptedGenerator::new());
    generator.push_reply(cube_plan());
    generator.push_reply(script_reply(CUBE_SCRIPT));
    generator.push_reply(assessment_reply(0.9));
    generator.push_reply(assessment_reply(0.85));
    let runtime = Arc::new(ScriptedRuntime::succeeding("CREATED:Cube\n"));
    let sink = Arc::new(RecordingSink::new());
    let pipeline = build(&config(), &generator, &runtime).with_sink(sink.clone());

    let state = pipeline.run_prompt(CUBE_PROMPT, Some(3)).expect("run");

    assert_eq!(state.design.status, DesignStatus::Completed);
    assert_eq!(state.attempt(), 1);
    assert_eq!(state.next_action, Some(RouteAction::Success));
    let graph = state.task_graph.as_ref().expect("graph");
    assert!((1..=3).contains(&graph.len()));
    let script = state.design.script.as_deref().expect("script");
    assert!(!script.is_empty());
    let execution = state.execution.as_ref().expect("execution");
    assert!(execution.success);
    assert_eq!(execution.created_objects, vec!["Cube"]);
    assert!(state.design.score.is_some_and(|s| s >= 0.8));
    assert!(state.design.error_message.is_none());
    assert_eq!(
        state.visited_nodes(),
        vec![
            NodeKind::Planner,
            NodeKind::Generator,
            NodeKind::Executor,
            NodeKind::Validator
        ]
    );
    for node in NodeKind::ALL {
        assert!(state.node_durations.contains_key(&node), "{node}");
    }
    assert_eq!(generator.remaining(), 0);

    let events = sink.events();
    let started = events
        .iter()
        .filter(|e| e.status == EventStatus::Started)
        .count();
    assert_eq!(started, 4);
    let routed = events
        .iter()
        .find(|e| e.status == EventStatus::Routed)
        .expect("routed event");
    assert_eq!(routed.metadata["action"], "success");
    let last = events.last().expect("final event");
    assert_eq!(last.node, None);
    assert_eq!(last.status, EventStatus::Completed);
}

#[test]
fn refine_reuses_graph_and_passes_feedback() {
    let generator = Arc::new(ScriptedGenerator::new());
    generator.push_reply(cube_plan());
    generator.push_reply(script_reply("import Part\nPart.makeBox(5, 5, 5)\nprint('CREATED:Cube')"));
    generator.push_reply(
        r#"{"score": 0.5, "issues": [{"severity": "error", "message": "cube is 5mm, expected 10mm"}], "suggestions": ["use 10 for every side"]}"#,
    );
    generator.push_reply(assessment_reply(0.5));
    generator.push_reply(script_reply(CUBE_SCRIPT));
    generator.push_reply(assessment_reply(0.9));
    generator.push_reply(assessment_reply(0.9));
    let runtime = Arc::new(ScriptedRuntime::succeeding("CREATED:Cube\n"));
    let pipeline = build(&config(), &generator, &runtime);

    let state = pipeline.run_prompt(CUBE_PROMPT, Some(3)).expect("run");

    assert_eq!(state.design.status, DesignStatus::Completed);
    assert_eq!(state.attempt(), 2);
    assert_eq!(state.retry_counts[&NodeKind::Generator], 1);
    assert_eq!(
        state.visited_nodes(),
        vec![
            NodeKind::Planner,
            NodeKind::Generator,
            NodeKind::Executor,
            NodeKind::Validator,
            NodeKind::Generator,
            NodeKind::Executor,
            NodeKind::Validator,
        ]
    );
    assert_eq!(state.history[4].attempt, 2);
    assert_eq!(runtime.runs(), 2);

    let requests = generator.requests();
    assert_eq!(requests.len(), 7);
    let refine_prompt = &requests[4].messages[1].content;
    assert!(refine_prompt.contains("Refinement feedback"));
    assert!(refine_prompt.contains("cube is 5mm, expected 10mm"));
    assert!(refine_prompt.contains("use 10 for every side"));
    assert!(refine_prompt.contains("Part.makeBox(5, 5, 5)"));
}

#[test]
fn low_score_replans_with_failure_context() {
    let generator = Arc::new(ScriptedGenerator::new());
    generator.push_reply(cube_plan());
    generator.push_reply(script_reply("import Part\nPrt.makeBox(10, 10, 10)"));
    generator.push_reply(assessment_reply(0.6));
    generator.push_reply(assessment_reply(0.5));
    generator.push_reply(plan_reply(&[
        plan_task("sketch", "sketch", &[]),
        plan_task("pad", "extrude", &["sketch"]),
    ]));
    generator.push_reply(script_reply(CUBE_SCRIPT));
    generator.push_reply(assessment_reply(0.9));
    generator.push_reply(assessment_reply(0.9));
    let runtime = Arc::new(ScriptedRuntime::succeeding("CREATED:Cube\n"));
    runtime.push(InProcessOutput {
        stdout: String::new(),
        stderr: "Traceback (most recent call last):\nNameError: name 'Prt' is not defined\n"
            .to_string(),
        completed: false,
    });
    let pipeline = build(&config(), &generator, &runtime);

    let state = pipeline.run_prompt(CUBE_PROMPT, Some(3)).expect("run");

    assert_eq!(state.design.status, DesignStatus::Completed);
    assert_eq!(state.retry_counts[&NodeKind::Planner], 1);
    assert_eq!(state.task_graph.as_ref().expect("graph").len(), 2);
    assert_eq!(state.replan_context.len(), 1);
    // (0.0 * 0.4 + 0.6 * 0.4 + 0.5 * 0.2) = 0.34
    assert!(
        state.replan_context[0].starts_with("attempt 1 scored 0.34"),
        "{}",
        state.replan_context[0]
    );
    assert!(state.replan_context[0].contains("NameError"));

    let replan_prompt = &generator.requests()[4].messages[1].content;
    assert!(replan_prompt.contains("Previous attempts failed"));
    assert!(replan_prompt.contains("attempt 1 scored 0.34"));
}

#[test]
fn disallowed_import_never_executes() {
    let generator = Arc::new(ScriptedGenerator::new());
    generator.push_reply(cube_plan());
    generator.push_reply(script_reply("import os\nimport Part\nos.system('rm -rf /')"));
    generator.push_reply(assessment_reply(0.1));
    generator.push_reply(assessment_reply(0.1));
    let runtime = Arc::new(ScriptedRuntime::succeeding("CREATED:Cube\n"));
    let pipeline = build(&config(), &generator, &runtime);

    let state = pipeline.run_prompt(CUBE_PROMPT, Some(3)).expect("run");

    let execution = state.execution.as_ref().expect("execution");
    assert_eq!(execution.status, ExecutionStatus::ValidationFailed);
    assert!(!execution.success);
    assert!(execution.stderr.contains("import of 'os' is blocked"));
    assert_eq!(runtime.runs(), 0);

    let report = pipeline
        .sandbox()
        .validate(state.script.as_deref().expect("script"));
    assert!(!report.valid);

    assert_eq!(state.design.status, DesignStatus::Failed);
    let reason = state.design.error_message.as_deref().expect("reason");
    assert!(reason.contains("below replan threshold"), "{reason}");
    assert!(state.design.score.is_some_and(|s| s < 0.2));
}

#[test]
fn planner_failure_ends_in_failed_state() {
    let generator = Arc::new(ScriptedGenerator::new());
    generator.push_error("rate limited");
    let runtime = Arc::new(ScriptedRuntime::succeeding(""));
    let sink = Arc::new(RecordingSink::new());
    let pipeline = build(&config(), &generator, &runtime).with_sink(sink.clone());

    let state = pipeline.run_prompt(CUBE_PROMPT, Some(3)).expect("run");

    assert_eq!(state.design.status, DesignStatus::Failed);
    assert_eq!(state.visited_nodes(), vec![NodeKind::Planner]);
    assert_eq!(state.error_count, 1);
    let last_error = state.last_error.as_deref().expect("last error");
    assert!(last_error.contains("rate limited"), "{last_error}");
    assert_eq!(state.design.score, None);

    let events = sink.events();
    assert!(
        events
            .iter()
            .any(|e| e.node == Some(NodeKind::Planner) && e.status == EventStatus::Failed)
    );
    assert!(!events.iter().any(|e| e.status == EventStatus::Routed));
    assert_eq!(events.last().expect("final").status, EventStatus::Failed);
}

#[test]
fn failing_event_sink_does_not_fail_the_run() {
    let generator = Arc::new(ScriptedGenerator::new());
    generator.push_reply(cube_plan());
    generator.push_reply(script_reply(CUBE_SCRIPT));
    generator.push_reply(assessment_reply(0.9));
    generator.push_reply(assessment_reply(0.9));
    let runtime = Arc::new(ScriptedRuntime::succeeding("CREATED:Cube\n"));
    let pipeline = build(&config(), &generator, &runtime).with_sink(Arc::new(FailingSink));

    let state = pipeline.run_prompt(CUBE_PROMPT, Some(3)).expect("run");

    assert_eq!(state.design.status, DesignStatus::Completed);
    assert_eq!(state.error_count, 0);
}

#[test]
fn iteration_ceiling_fails_with_last_score() {
    let generator = Arc::new(ScriptedGenerator::new());
    generator.push_reply(cube_plan());
    for _ in 0..2 {
        generator.push_reply(script_reply(CUBE_SCRIPT));
        generator.push_reply(assessment_reply(0.5));
        generator.push_reply(assessment_reply(0.5));
    }
    let runtime = Arc::new(ScriptedRuntime::succeeding("CREATED:Cube\n"));
    let pipeline = build(&config(), &generator, &runtime);

    let state = pipeline.run_prompt(CUBE_PROMPT, Some(2)).expect("run");

    assert_eq!(state.design.status, DesignStatus::Failed);
    assert_eq!(state.attempt(), 2);
    assert_eq!(runtime.runs(), 2);
    let reason = state.design.error_message.as_deref().expect("reason");
    assert!(reason.contains("max iterations exceeded"), "{reason}");
    // (1.0 * 0.4 + 0.5 * 0.4 + 0.5 * 0.2)
    assert!(state.design.score.is_some_and(|s| (s - 0.7).abs() < 1e-9));
    assert!(state.design.script.is_some());
    assert_eq!(generator.remaining(), 0);
}

#[test]
fn timed_out_execution_is_still_scored() {
    let mut config = config();
    config.sandbox.timeout_secs = 1;
    let generator = Arc::new(ScriptedGenerator::new());
    generator.push_reply(cube_plan());
    generator.push_reply(script_reply(CUBE_SCRIPT));
    generator.push_reply(assessment_reply(0.1));
    generator.push_reply(assessment_reply(0.1));
    let runtime = Arc::new(ScriptedRuntime::sleeping(Duration::from_millis(1500)));
    let pipeline = build(&config, &generator, &runtime);

    let state = pipeline.run_prompt(CUBE_PROMPT, Some(3)).expect("run");

    let execution = state.execution.as_ref().expect("execution");
    assert_eq!(execution.status, ExecutionStatus::Timeout);
    assert!(!execution.success);
    assert_eq!(state.visited_nodes().last(), Some(&NodeKind::Validator));
    assert_eq!(state.design.status, DesignStatus::Failed);
}

#[test]
fn store_tracks_final_snapshot() {
    let generator = Arc::new(ScriptedGenerator::new());
    generator.push_reply(cube_plan());
    generator.push_reply(script_reply(CUBE_SCRIPT));
    generator.push_reply(assessment_reply(0.95));
    generator.push_reply(assessment_reply(0.95));
    let runtime = Arc::new(ScriptedRuntime::succeeding("CREATED:Cube\n"));
    let store = Arc::new(InMemoryStore::new());
    let pipeline = build(&config(), &generator, &runtime).with_store(store.clone());

    let state = pipeline.run_prompt(CUBE_PROMPT, None).expect("run");

    let snapshot = store
        .get(state.request().id())
        .expect("get")
        .expect("snapshot");
    assert_eq!(snapshot, state.snapshot());
    assert_eq!(snapshot.status, DesignStatus::Completed);
    assert_eq!(snapshot.iteration, 1);
    assert_eq!(store.len(), 1);
}

#[test]
fn short_prompt_is_rejected_before_any_model_call() {
    let generator = Arc::new(ScriptedGenerator::new());
    let runtime = Arc::new(ScriptedRuntime::succeeding(""));
    let pipeline = build(&config(), &generator, &runtime);

    let err = pipeline.run_prompt("box", None).unwrap_err();

    assert!(err.to_string().contains("at least 5 characters"), "{err}");
    assert_eq!(generator.calls(), 0);
}
