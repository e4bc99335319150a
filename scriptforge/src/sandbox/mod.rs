//! Two-phase script sandbox: static validation, then bounded execution.
//!
//! A [`Sandbox`] holds only its configuration and resolved policy, so one
//! instance can be shared across concurrent requests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, instrument};

pub use crate::core::types::ScriptValidationReport;
use crate::core::types::ExecutionResult;
use crate::io::config::SandboxConfig;

pub mod in_process;
pub mod policy;
pub mod subprocess;
pub mod validator;

pub use in_process::{InProcessOutput, InProcessRuntime, RestrictedNamespace};
pub use policy::ScriptPolicy;

#[derive(Debug, Clone)]
pub struct Sandbox {
    config: SandboxConfig,
    policy: ScriptPolicy,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        let policy = ScriptPolicy::from_config(&config);
        Self { config, policy }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn policy(&self) -> &ScriptPolicy {
        &self.policy
    }

    /// Configured per-execution timeout.
    pub fn default_timeout(&self) -> Duration {
        self.config.timeout()
    }

    /// Statically inspect `script`. Never executes it.
    pub fn validate(&self, script: &str) -> ScriptValidationReport {
        validator::validate_script(&self.policy, script)
    }

    /// Validate, then run `script` in an isolated interpreter process.
    ///
    /// A script that fails validation is never started; the result carries
    /// status `validation_failed` with the report's errors as stderr.
    #[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
    pub fn execute(
        &self,
        script: &str,
        context: &BTreeMap<String, Value>,
        timeout: Duration,
    ) -> ExecutionResult {
        let report = self.validate(script);
        if !report.valid {
            info!(errors = report.errors.len(), "script rejected before execution");
            return ExecutionResult::validation_failed(&report.errors);
        }
        self.execute_trusted(script, context, timeout)
    }

    /// Run `script` without static validation. Only for scripts produced by
    /// this crate itself; the interpreter-side guards still apply.
    pub fn execute_trusted(
        &self,
        script: &str,
        context: &BTreeMap<String, Value>,
        timeout: Duration,
    ) -> ExecutionResult {
        subprocess::run_in_subprocess(&self.config, &self.policy, script, context, timeout)
    }

    /// Validate, then run `script` inside a host runtime on a worker thread.
    #[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
    pub fn execute_in_process(
        &self,
        runtime: Arc<dyn InProcessRuntime>,
        script: &str,
        context: &BTreeMap<String, Value>,
        timeout: Duration,
    ) -> ExecutionResult {
        let report = self.validate(script);
        if !report.valid {
            info!(errors = report.errors.len(), "script rejected before execution");
            return ExecutionResult::validation_failed(&report.errors);
        }
        let namespace = RestrictedNamespace::new(&self.policy, context);
        in_process::run_in_process(runtime, script, namespace, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ExecutionStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRuntime(AtomicUsize);

    impl InProcessRuntime for CountingRuntime {
        fn run(
            &self,
            _script: &str,
            _namespace: &RestrictedNamespace,
        ) -> anyhow::Result<InProcessOutput> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(InProcessOutput {
                completed: true,
                ..InProcessOutput::default()
            })
        }
    }

    #[test]
    fn rejected_script_never_reaches_runtime() {
        let sandbox = Sandbox::new(SandboxConfig::default());
        let runtime = Arc::new(CountingRuntime(AtomicUsize::new(0)));
        let result = sandbox.execute_in_process(
            runtime.clone(),
            "import subprocess\nsubprocess.call(['rm'])\n",
            &BTreeMap::new(),
            Duration::from_secs(1),
        );
        assert_eq!(result.status, ExecutionStatus::ValidationFailed);
        assert!(!result.success);
        assert_eq!(runtime.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rejected_script_never_spawns_interpreter() {
        let sandbox = Sandbox::new(SandboxConfig {
            interpreter: vec!["scriptforge-no-such-interpreter".to_string()],
            ..SandboxConfig::default()
        });
        let result = sandbox.execute("eval('1')\n", &BTreeMap::new(), Duration::from_secs(1));
        assert_eq!(result.status, ExecutionStatus::ValidationFailed);
        assert!(result.stderr.contains("'eval'"));
    }

    #[test]
    fn valid_script_runs_in_process() {
        let sandbox = Sandbox::new(SandboxConfig::default());
        let runtime = Arc::new(CountingRuntime(AtomicUsize::new(0)));
        let result = sandbox.execute_in_process(
            runtime.clone(),
            "import math\nprint(math.pi)\n",
            &BTreeMap::new(),
            sandbox.default_timeout(),
        );
        assert!(result.success);
        assert_eq!(runtime.0.load(Ordering::SeqCst), 1);
    }
}
