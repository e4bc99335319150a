//! Executor: the pipeline-facing wrapper around the sandbox.
//!
//! Every failure mode comes back as a non-success [`ExecutionResult`];
//! nothing here returns an error.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tracing::{info, instrument};

use crate::core::types::{DesignRequest, ExecutionResult};
use crate::sandbox::{InProcessRuntime, Sandbox};

static CREATED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^CREATED:\s*(\S.*?)\s*$").unwrap());
static META_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^META:\s*([A-Za-z0-9_.-]+)\s*=\s*(.*?)\s*$").unwrap());

pub struct ExecutorAgent {
    sandbox: Arc<Sandbox>,
    runtime: Option<Arc<dyn InProcessRuntime>>,
    timeout: Duration,
}

impl ExecutorAgent {
    /// Runs scripts in a child interpreter with the sandbox's configured timeout.
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        let timeout = sandbox.default_timeout();
        Self {
            sandbox,
            runtime: None,
            timeout,
        }
    }

    /// Run scripts inside a host runtime instead of a child process.
    pub fn with_runtime(mut self, runtime: Arc<dyn InProcessRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Override the sandbox's configured wall-clock bound.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validate and run `script`, then collect reported objects and metadata.
    #[instrument(skip_all, fields(request_id = %request.id(), in_process = self.runtime.is_some()))]
    pub fn execute(&self, script: &str, request: &DesignRequest) -> ExecutionResult {
        let context = script_context(request);
        let mut result = match &self.runtime {
            Some(runtime) => {
                self.sandbox
                    .execute_in_process(runtime.clone(), script, &context, self.timeout)
            }
            None => self.sandbox.execute(script, &context, self.timeout),
        };
        collect_markers(&mut result);
        info!(
            status = ?result.status,
            created = result.created_objects.len(),
            elapsed_ms = result.execution_time.as_millis() as u64,
            "script executed"
        );
        result
    }
}

/// Read-only variables injected into the script's namespace.
pub fn script_context(request: &DesignRequest) -> BTreeMap<String, Value> {
    let short_id: String = request
        .id()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(8)
        .collect();
    let mut context = BTreeMap::new();
    context.insert(
        "doc_name".to_string(),
        Value::from(format!("design_{short_id}")),
    );
    context.insert("request_id".to_string(), Value::from(request.id()));
    context.insert("prompt".to_string(), Value::from(request.prompt()));
    context.insert(
        "constraints".to_string(),
        Value::Object(
            request
                .constraints()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
    );
    context
}

/// Parse `CREATED:<id>` and `META:<key>=<value>` lines out of stdout.
///
/// Metadata values are JSON when they parse as JSON, text otherwise.
pub fn collect_markers(result: &mut ExecutionResult) {
    for line in result.stdout.lines() {
        let line = line.trim();
        if let Some(caps) = CREATED_RE.captures(line) {
            let id = caps[1].to_string();
            if !result.created_objects.contains(&id) {
                result.created_objects.push(id);
            }
        } else if let Some(caps) = META_RE.captures(line) {
            let raw = &caps[2];
            let value =
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            result.metadata.insert(caps[1].to_string(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ExecutionStatus;
    use crate::io::config::SandboxConfig;
    use crate::test_support::ScriptedRuntime;

    #[test]
    fn markers_become_objects_and_metadata() {
        let mut result = ExecutionResult::internal_failure("", Duration::ZERO);
        result.stdout = "building\nCREATED:Box\nCREATED: Box \nCREATED:Hole001\nMETA:volume=1000.5\nMETA:shape_valid=true\nMETA:units=mm\n".to_string();
        collect_markers(&mut result);
        assert_eq!(result.created_objects, vec!["Box", "Hole001"]);
        assert_eq!(result.metadata["volume"], Value::from(1000.5));
        assert_eq!(result.metadata["shape_valid"], Value::Bool(true));
        assert_eq!(result.metadata["units"], Value::from("mm"));
        assert!(result.stdout.contains("building"));
    }

    #[test]
    fn context_exposes_doc_name_and_request() {
        let request = DesignRequest::new("create a 10x10x10 cube").expect("request");
        let context = script_context(&request);
        let doc_name = context["doc_name"].as_str().expect("doc name");
        assert!(doc_name.starts_with("design_"));
        assert_eq!(doc_name.len(), "design_".len() + 8);
        assert_eq!(context["prompt"], Value::from("create a 10x10x10 cube"));
    }

    #[test]
    fn in_process_runtime_reports_created_objects() {
        let sandbox = Arc::new(Sandbox::new(SandboxConfig::default()));
        let runtime = Arc::new(ScriptedRuntime::succeeding("CREATED:Cube\nMETA:volume=1000\n"));
        let executor = ExecutorAgent::new(sandbox).with_runtime(runtime.clone());
        let request = DesignRequest::new("create a cube").expect("request");

        let result = executor.execute("import Part\nPart.makeBox(10, 10, 10)\n", &request);

        assert!(result.success);
        assert_eq!(result.created_objects, vec!["Cube"]);
        assert_eq!(result.metadata["volume"], Value::from(1000));
        assert_eq!(runtime.runs(), 1);
    }

    #[test]
    fn disallowed_import_is_validation_failure() {
        let sandbox = Arc::new(Sandbox::new(SandboxConfig::default()));
        let runtime = Arc::new(ScriptedRuntime::succeeding("CREATED:Cube\n"));
        let executor = ExecutorAgent::new(sandbox).with_runtime(runtime.clone());
        let request = DesignRequest::new("create a cube").expect("request");

        let result = executor.execute("import os\nos.system('true')\n", &request);

        assert_eq!(result.status, ExecutionStatus::ValidationFailed);
        assert!(!result.success);
        assert!(result.created_objects.is_empty());
        assert_eq!(runtime.runs(), 0);
    }

    #[test]
    fn timeout_override_bounds_execution() {
        let sandbox = Arc::new(Sandbox::new(SandboxConfig::default()));
        let runtime = Arc::new(ScriptedRuntime::sleeping(Duration::from_millis(500)));
        let executor = ExecutorAgent::new(sandbox)
            .with_runtime(runtime)
            .with_timeout(Duration::from_millis(50));
        let request = DesignRequest::new("create a cube").expect("request");

        let result = executor.execute("import Part\nPart.makeBox(10, 10, 10)\n", &request);

        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert!(!result.success);
        assert!(result.execution_time < Duration::from_millis(500));
    }
}
