//! Isolated interpreter execution.
//!
//! The script never touches disk: a generated prelude plus the script source
//! (as a string literal) are written to the interpreter's stdin. The prelude
//! applies rlimits, then runs the compiled script against its own builtins
//! table with blocked names removed and an import guard installed. Stdlib
//! modules keep the real builtins.

use std::collections::BTreeMap;
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::types::{ExecutionResult, ExecutionStatus};
use crate::io::config::SandboxConfig;
use crate::io::process::run_command_with_timeout;
use crate::sandbox::policy::ScriptPolicy;

/// Marker the interpreter prints for an uncaught exception.
pub const TRACEBACK_MARKER: &str = "Traceback (most recent call last)";

/// `__name__` of the script's module globals.
const SCRIPT_MODULE_NAME: &str = "__sandbox__";

const PRELUDE: &str = r#"import builtins as _sb_builtins
import json as _sb_json
import types as _sb_types
try:
    import resource as _sb_resource
    if {{ memory_bytes }} > 0:
        _sb_resource.setrlimit(_sb_resource.RLIMIT_AS, ({{ memory_bytes }}, {{ memory_bytes }}))
    _sb_resource.setrlimit(_sb_resource.RLIMIT_CPU, ({{ cpu_secs }}, {{ cpu_secs }}))
except Exception:
    pass
_sb_context = _sb_json.loads({{ context }})
_sb_allowed = frozenset({{ allowed }})
_sb_real_import = _sb_builtins.__import__
def _sb_guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
    if level != 0 or name.split(".")[0] not in _sb_allowed:
        raise ImportError("import of '%s' is not permitted in the sandbox" % name)
    return _sb_real_import(name, globals, locals, fromlist, level)
_sb_blocked = frozenset({{ blocked }})
_sb_script_builtins = {
    _sb_key: _sb_value
    for _sb_key, _sb_value in vars(_sb_builtins).items()
    if _sb_key not in _sb_blocked
}
_sb_script_builtins.update(__import__=_sb_guarded_import)
_sb_code = compile({{ script }}, "<script>", "exec")
_sb_namespace = {
    "__name__": "{{ module_name }}",
    "__builtins__": _sb_script_builtins,
    "context": _sb_types.MappingProxyType(_sb_context),
    "doc_name": _sb_context.get("doc_name", "Unnamed"),
}
exec(_sb_code, _sb_namespace)
"#;

/// Build the program fed to the interpreter.
pub fn build_program(
    config: &SandboxConfig,
    policy: &ScriptPolicy,
    script: &str,
    context: &BTreeMap<String, Value>,
    timeout: Duration,
) -> Result<String> {
    let context_json = serde_json::to_string(context).context("serialize sandbox context")?;
    let allowed: Vec<&str> = policy.allowed_modules.iter().map(String::as_str).collect();
    let blocked: Vec<&str> = policy
        .blocked_calls()
        .into_iter()
        .filter(|name| !name.contains('.') && *name != "__import__")
        .collect();
    let memory_bytes = config.memory_limit_mb.saturating_mul(1024 * 1024);
    let cpu_secs = timeout.as_secs().saturating_add(1);

    // JSON string and array-of-string literals are valid Python literals.
    let program = Environment::new()
        .render_str(
            PRELUDE,
            context! {
                memory_bytes => memory_bytes,
                cpu_secs => cpu_secs,
                module_name => SCRIPT_MODULE_NAME,
                context => serde_json::to_string(&context_json).context("encode context literal")?,
                allowed => serde_json::to_string(&allowed).context("encode allow-list literal")?,
                blocked => serde_json::to_string(&blocked).context("encode blocklist literal")?,
                script => serde_json::to_string(script).context("encode script literal")?,
            },
        )
        .context("render sandbox prelude")?;
    Ok(program)
}

/// Run `script` in a child interpreter and classify the outcome.
///
/// Never returns an error: spawn failures become an `execution_failed` result.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
pub fn run_in_subprocess(
    config: &SandboxConfig,
    policy: &ScriptPolicy,
    script: &str,
    context: &BTreeMap<String, Value>,
    timeout: Duration,
) -> ExecutionResult {
    let started = Instant::now();
    match spawn_interpreter(config, policy, script, context, timeout) {
        Ok(result) => result,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "sandbox interpreter failed to run");
            ExecutionResult::internal_failure(
                format!("sandbox interpreter failed to run: {err:#}"),
                started.elapsed(),
            )
        }
    }
}

fn spawn_interpreter(
    config: &SandboxConfig,
    policy: &ScriptPolicy,
    script: &str,
    context: &BTreeMap<String, Value>,
    timeout: Duration,
) -> Result<ExecutionResult> {
    let program = build_program(config, policy, script, context, timeout)?;
    let (interpreter, args) = config
        .interpreter
        .split_first()
        .context("sandbox interpreter is empty")?;
    let mut cmd = Command::new(interpreter);
    cmd.args(args).env_clear().env("PYTHONIOENCODING", "utf-8");
    if let Some(path) = std::env::var_os("PATH") {
        cmd.env("PATH", path);
    }

    let output = run_command_with_timeout(
        cmd,
        Some(program.as_bytes()),
        timeout,
        config.output_limit_bytes,
    )
    .context("run sandbox interpreter")?;

    let stdout = output.stdout_text();
    let mut stderr = output.stderr_text();
    let exit_code = output.exit_code();
    let status = if output.timed_out {
        stderr.push_str(&format!(
            "\nexecution timed out after {}s\n",
            timeout.as_secs_f64()
        ));
        ExecutionStatus::Timeout
    } else {
        classify(exit_code, &stderr)
    };
    debug!(?status, ?exit_code, elapsed_ms = output.elapsed.as_millis() as u64, "sandbox run finished");

    Ok(ExecutionResult {
        success: status == ExecutionStatus::Success,
        status,
        stdout,
        stderr,
        exit_code,
        execution_time: output.elapsed,
        created_objects: Vec::new(),
        metadata: BTreeMap::new(),
    })
}

/// Exit 0 with no captured exception is success; anything else failed.
pub fn classify(exit_code: Option<i32>, stderr: &str) -> ExecutionStatus {
    if exit_code == Some(0) && !stderr.contains(TRACEBACK_MARKER) {
        ExecutionStatus::Success
    } else {
        ExecutionStatus::ExecutionFailed
    }
}
