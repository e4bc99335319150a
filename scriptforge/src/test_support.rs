//! Test doubles and fixtures for agents, sandbox and pipeline tests.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde_json::{Value, json};

use crate::core::types::{ExecutionResult, ExecutionStatus};
use crate::io::events::{EventSink, PipelineEvent};
use crate::io::generator::{GenerationRequest, GenerationResponse, TextGenerator, TokenUsage};
use crate::sandbox::{InProcessOutput, InProcessRuntime, RestrictedNamespace};

/// A minimal script the default sandbox policy accepts.
pub const CUBE_SCRIPT: &str = "import FreeCAD\nimport Part\n\ndoc = FreeCAD.newDocument(doc_name)\nbox = doc.addObject('Part::Box', 'Cube')\nbox.Length = 10\nbox.Width = 10\nbox.Height = 10\ndoc.recompute()\nprint('CREATED:Cube')\n";

/// Text generator that replays queued replies in order and records requests.
///
/// An exhausted queue yields an error, like a provider outage.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<Result<String, String>>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.replies
            .lock()
            .expect("replies lock")
            .push_back(Ok(reply.into()));
    }

    pub fn push_error(&self, message: impl Into<String>) {
        self.replies
            .lock()
            .expect("replies lock")
            .push_back(Err(message.into()));
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().expect("replies lock").len()
    }
}

impl TextGenerator for ScriptedGenerator {
    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let next = self.replies.lock().expect("replies lock").pop_front();
        match next {
            Some(Ok(content)) => Ok(GenerationResponse {
                content,
                model: request.model.clone(),
                provider: "scripted".to_string(),
                usage: TokenUsage::default(),
                finish_reason: Some("stop".to_string()),
                latency: Duration::ZERO,
            }),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted reply left")),
        }
    }
}

/// In-process runtime returning canned output without interpreting anything.
#[derive(Debug)]
pub struct ScriptedRuntime {
    queued: Mutex<VecDeque<InProcessOutput>>,
    fallback: InProcessOutput,
    delay: Option<Duration>,
    runs: AtomicUsize,
    scripts: Mutex<Vec<String>>,
}

impl ScriptedRuntime {
    fn with_fallback(fallback: InProcessOutput) -> Self {
        Self {
            queued: Mutex::new(VecDeque::new()),
            fallback,
            delay: None,
            runs: AtomicUsize::new(0),
            scripts: Mutex::new(Vec::new()),
        }
    }

    /// Every run completes and prints `stdout`.
    pub fn succeeding(stdout: &str) -> Self {
        Self::with_fallback(InProcessOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            completed: true,
        })
    }

    /// Every run raises with `stderr`.
    pub fn failing(stderr: &str) -> Self {
        Self::with_fallback(InProcessOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            completed: false,
        })
    }

    /// Every run sleeps for `delay` before completing.
    pub fn sleeping(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::succeeding("")
        }
    }

    /// Output for the next run, ahead of the fallback.
    pub fn push(&self, output: InProcessOutput) {
        self.queued.lock().expect("queue lock").push_back(output);
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().expect("scripts lock").clone()
    }
}

impl InProcessRuntime for ScriptedRuntime {
    fn run(&self, script: &str, _namespace: &RestrictedNamespace) -> Result<InProcessOutput> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.scripts
            .lock()
            .expect("scripts lock")
            .push(script.to_string());
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        let queued = self.queued.lock().expect("queue lock").pop_front();
        Ok(queued.unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Event sink that keeps every event for inspection.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().expect("events lock").clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &PipelineEvent) -> Result<()> {
        self.events
            .lock()
            .expect("events lock")
            .push(event.clone());
        Ok(())
    }
}

/// Event sink whose every delivery fails.
#[derive(Debug, Default)]
pub struct FailingSink;

impl EventSink for FailingSink {
    fn emit(&self, _event: &PipelineEvent) -> Result<()> {
        Err(anyhow!("event transport unavailable"))
    }
}

/// One task entry of a planner reply.
pub fn plan_task(id: &str, operation: &str, dependencies: &[&str]) -> Value {
    json!({
        "id": id,
        "description": format!("{id} step"),
        "operation": operation,
        "parameters": {},
        "dependencies": dependencies,
    })
}

/// Planner reply JSON for `tasks`.
pub fn plan_reply(tasks: &[Value]) -> String {
    json!({ "tasks": tasks }).to_string()
}

/// Assessment reply with a score and no issues.
pub fn assessment_reply(score: f64) -> String {
    json!({ "score": score, "issues": [], "suggestions": [] }).to_string()
}

/// Generator reply wrapping `script` in a python fence.
pub fn script_reply(script: &str) -> String {
    format!("Here is the script:\n```python\n{script}\n```\n")
}

/// Successful execution reporting `objects`.
pub fn successful_execution(objects: &[&str]) -> ExecutionResult {
    ExecutionResult {
        success: true,
        status: ExecutionStatus::Success,
        stdout: objects
            .iter()
            .map(|id| format!("CREATED:{id}\n"))
            .collect(),
        stderr: String::new(),
        exit_code: Some(0),
        execution_time: Duration::from_millis(5),
        created_objects: objects.iter().map(|id| id.to_string()).collect(),
        metadata: BTreeMap::new(),
    }
}

/// Write `contents` to a config file in a fresh temp dir.
pub fn config_file(contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("scriptforge.toml");
    fs::write(&path, contents).expect("write config");
    (dir, path)
}

/// Whether a `python3` interpreter can be spawned.
pub fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .is_ok_and(|output| output.status.success())
}
