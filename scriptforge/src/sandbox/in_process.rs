//! In-process execution against an embedded interpreter.
//!
//! The host runtime (an engine with its own embedded interpreter) implements
//! [`InProcessRuntime`]. The sandbox hands it a [`RestrictedNamespace`] and
//! runs it on a worker thread so the wall-clock bound still applies.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::types::{ExecutionResult, ExecutionStatus};
use crate::sandbox::policy::ScriptPolicy;

/// Builtins exposed to scripts running in-process.
pub const SAFE_BUILTINS: &[&str] = &[
    "abs",
    "all",
    "any",
    "bool",
    "dict",
    "divmod",
    "enumerate",
    "filter",
    "float",
    "format",
    "frozenset",
    "int",
    "isinstance",
    "len",
    "list",
    "map",
    "max",
    "min",
    "pow",
    "print",
    "range",
    "repr",
    "reversed",
    "round",
    "set",
    "sorted",
    "str",
    "sum",
    "tuple",
    "zip",
    "Exception",
    "ValueError",
    "TypeError",
    "RuntimeError",
];

/// What a script may see when it runs inside the host interpreter.
#[derive(Debug, Clone, PartialEq)]
pub struct RestrictedNamespace {
    /// Read-only context variables.
    pub context: BTreeMap<String, Value>,
    pub doc_name: String,
    pub allowed_builtins: Vec<&'static str>,
    pub blocked_names: BTreeSet<&'static str>,
    pub allowed_modules: BTreeSet<String>,
}

impl RestrictedNamespace {
    pub fn new(policy: &ScriptPolicy, context: &BTreeMap<String, Value>) -> Self {
        let doc_name = context
            .get("doc_name")
            .and_then(Value::as_str)
            .unwrap_or("Unnamed")
            .to_string();
        Self {
            context: context.clone(),
            doc_name,
            allowed_builtins: SAFE_BUILTINS.to_vec(),
            blocked_names: policy.blocked_calls(),
            allowed_modules: policy.allowed_modules.clone(),
        }
    }
}

/// Output captured by a host runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// `false` when the script raised.
    pub completed: bool,
}

/// Host interpreter capable of running a script against a restricted namespace.
pub trait InProcessRuntime: Send + Sync {
    fn run(&self, script: &str, namespace: &RestrictedNamespace) -> Result<InProcessOutput>;
}

/// Run an already-validated script on a worker thread, bounded by `timeout`.
///
/// A runtime that overruns is abandoned on its thread; the caller gets a
/// `timeout` result immediately.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64))]
pub fn run_in_process(
    runtime: Arc<dyn InProcessRuntime>,
    script: &str,
    namespace: RestrictedNamespace,
    timeout: Duration,
) -> ExecutionResult {
    let started = Instant::now();
    let (tx, rx) = mpsc::channel();
    let script = script.to_string();
    let spawned = thread::Builder::new()
        .name("sandbox-in-process".to_string())
        .spawn(move || {
            let outcome = runtime.run(&script, &namespace);
            // The receiver is gone once the caller timed out.
            let _ = tx.send(outcome);
        });
    if let Err(err) = spawned {
        return ExecutionResult::internal_failure(
            format!("spawn in-process worker: {err}"),
            started.elapsed(),
        );
    }

    match rx.recv_timeout(timeout) {
        Ok(Ok(output)) => {
            let status = if output.completed {
                ExecutionStatus::Success
            } else {
                ExecutionStatus::ExecutionFailed
            };
            debug!(?status, "in-process run finished");
            ExecutionResult {
                success: output.completed,
                status,
                stdout: output.stdout,
                stderr: output.stderr,
                exit_code: Some(if output.completed { 0 } else { 1 }),
                execution_time: started.elapsed(),
                created_objects: Vec::new(),
                metadata: BTreeMap::new(),
            }
        }
        Ok(Err(err)) => {
            warn!(err = %format!("{err:#}"), "in-process runtime failed");
            ExecutionResult::internal_failure(format!("{err:#}"), started.elapsed())
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            warn!("in-process run timed out");
            ExecutionResult {
                success: false,
                status: ExecutionStatus::Timeout,
                stdout: String::new(),
                stderr: format!("execution timed out after {}s", timeout.as_secs_f64()),
                exit_code: None,
                execution_time: started.elapsed(),
                created_objects: Vec::new(),
                metadata: BTreeMap::new(),
            }
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => ExecutionResult::internal_failure(
            "in-process worker exited without a result",
            started.elapsed(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::SandboxConfig;
    use anyhow::anyhow;

    struct FnRuntime<F>(F);

    impl<F> InProcessRuntime for FnRuntime<F>
    where
        F: Fn(&str, &RestrictedNamespace) -> Result<InProcessOutput> + Send + Sync,
    {
        fn run(&self, script: &str, namespace: &RestrictedNamespace) -> Result<InProcessOutput> {
            (self.0)(script, namespace)
        }
    }

    fn namespace() -> RestrictedNamespace {
        let policy = ScriptPolicy::from_config(&SandboxConfig::default());
        let mut context = BTreeMap::new();
        context.insert("doc_name".to_string(), Value::from("design_7"));
        RestrictedNamespace::new(&policy, &context)
    }

    #[test]
    fn namespace_carries_context_and_restrictions() {
        let ns = namespace();
        assert_eq!(ns.doc_name, "design_7");
        assert!(ns.allowed_builtins.contains(&"print"));
        assert!(!ns.allowed_builtins.contains(&"open"));
        assert!(ns.blocked_names.contains("exec"));
        assert!(ns.allowed_modules.contains("Part"));
    }

    #[test]
    fn completed_run_is_success() {
        let runtime = Arc::new(FnRuntime(|script: &str, ns: &RestrictedNamespace| {
            Ok(InProcessOutput {
                stdout: format!("{}:{}", ns.doc_name, script.len()),
                stderr: String::new(),
                completed: true,
            })
        }));
        let result = run_in_process(runtime, "x = 1", namespace(), Duration::from_secs(1));
        assert!(result.success);
        assert_eq!(result.stdout, "design_7:5");
        assert_eq!(result.exit_code, Some(0));
    }

    #[test]
    fn raised_script_is_execution_failure() {
        let runtime = Arc::new(FnRuntime(|_: &str, _: &RestrictedNamespace| {
            Ok(InProcessOutput {
                stdout: String::new(),
                stderr: "ZeroDivisionError".to_string(),
                completed: false,
            })
        }));
        let result = run_in_process(runtime, "1/0", namespace(), Duration::from_secs(1));
        assert_eq!(result.status, ExecutionStatus::ExecutionFailed);
        assert_eq!(result.stderr, "ZeroDivisionError");
    }

    #[test]
    fn runtime_error_is_execution_failure() {
        let runtime = Arc::new(FnRuntime(|_: &str, _: &RestrictedNamespace| {
            Err(anyhow!("engine not loaded"))
        }));
        let result = run_in_process(runtime, "x = 1", namespace(), Duration::from_secs(1));
        assert_eq!(result.status, ExecutionStatus::ExecutionFailed);
        assert!(result.stderr.contains("engine not loaded"));
    }

    #[test]
    fn overrunning_runtime_times_out() {
        let runtime = Arc::new(FnRuntime(|_: &str, _: &RestrictedNamespace| {
            thread::sleep(Duration::from_secs(2));
            Ok(InProcessOutput::default())
        }));
        let started = Instant::now();
        let result = run_in_process(runtime, "x = 1", namespace(), Duration::from_millis(100));
        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert!(!result.success);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
