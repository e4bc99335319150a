//! Capability policy applied to generated scripts.

use std::collections::BTreeSet;

use crate::io::config::SandboxConfig;

/// General-purpose math and data modules every script may import.
pub const BASE_ALLOWED_MODULES: &[&str] = &[
    "math",
    "cmath",
    "decimal",
    "fractions",
    "numbers",
    "random",
    "statistics",
    "itertools",
    "functools",
    "operator",
    "collections",
    "dataclasses",
    "enum",
    "typing",
    "copy",
    "json",
    "re",
    "string",
    "datetime",
    "time",
];

/// Process control, shell execution, raw file I/O and dynamic code loading.
/// Importing any of these is an error in every mode.
pub const ALWAYS_BLOCKED_MODULES: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "shutil",
    "pty",
    "signal",
    "multiprocessing",
    "threading",
    "socket",
    "ctypes",
    "importlib",
    "builtins",
    "io",
    "pathlib",
    "tempfile",
    "runpy",
    "code",
    "codeop",
    "marshal",
    "pickle",
    "inspect",
    "gc",
];

/// Builtins that execute or load code, or expose the interpreter namespace.
pub const DYNAMIC_CODE_CALLS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "__import__",
    "globals",
    "locals",
    "vars",
    "breakpoint",
    "input",
];

/// Builtins that look attributes up by a computed name or build classes.
pub const REFLECTION_BUILTINS: &[&str] = &["getattr", "setattr", "delattr", "type"];

/// Stdlib helpers that resolve attributes or evaluate annotations from
/// strings. Blocked both as bare names and as module attributes.
pub const REFLECTION_HELPERS: &[&str] = &[
    "attrgetter",
    "methodcaller",
    "get_field",
    "get_type_hints",
    "ForwardRef",
];

/// Names that reach interpreter internals, blocked even as bare identifiers.
pub const BLOCKED_ATTRIBUTES: &[&str] = &[
    "__builtins__",
    "__class__",
    "__base__",
    "__globals__",
    "__subclasses__",
    "__code__",
    "__closure__",
    "__bases__",
    "__mro__",
    "__dict__",
    "__getattribute__",
    "__loader__",
    "__spec__",
];

/// Module-qualified calls that import dynamically.
pub const DYNAMIC_IMPORT_CALLS: &[&str] = &["importlib.import_module", "imp.load_source"];

/// Dunder names scripts may still spell out.
pub const PERMITTED_DUNDERS: &[&str] = &["__init__", "__name__", "__doc__", "__main__"];

/// Resolved policy for one sandbox instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptPolicy {
    pub allowed_modules: BTreeSet<String>,
    pub strict: bool,
    pub allow_file_io: bool,
}

impl ScriptPolicy {
    pub fn from_config(config: &SandboxConfig) -> Self {
        let allowed_modules = BASE_ALLOWED_MODULES
            .iter()
            .map(|m| m.to_string())
            .chain(config.engine_modules.iter().cloned())
            .chain(config.extra_allowed_modules.iter().cloned())
            .filter(|m| !is_always_blocked(m))
            .collect();
        Self {
            allowed_modules,
            strict: config.strict,
            allow_file_io: config.allow_file_io,
        }
    }

    /// A dotted module is allowed if it or its top-level package is listed.
    pub fn is_allowed_module(&self, module: &str) -> bool {
        self.allowed_modules.contains(module) || self.allowed_modules.contains(root_module(module))
    }

    /// Call targets blocked under this policy (`open` unless file I/O is enabled).
    pub fn blocked_calls(&self) -> BTreeSet<&'static str> {
        let mut blocked: BTreeSet<&'static str> = DYNAMIC_CODE_CALLS.iter().copied().collect();
        blocked.extend(REFLECTION_BUILTINS.iter().copied());
        blocked.extend(REFLECTION_HELPERS.iter().copied());
        blocked.extend(DYNAMIC_IMPORT_CALLS.iter().copied());
        if !self.allow_file_io {
            blocked.insert("open");
        }
        blocked
    }
}

pub fn is_always_blocked(module: &str) -> bool {
    ALWAYS_BLOCKED_MODULES.contains(&root_module(module))
}

/// Any `__x__` name outside [`PERMITTED_DUNDERS`].
pub fn is_blocked_dunder(name: &str) -> bool {
    name.len() > 4
        && name.starts_with("__")
        && name.ends_with("__")
        && !PERMITTED_DUNDERS.contains(&name)
}

pub fn root_module(module: &str) -> &str {
    module.split('.').next().unwrap_or(module)
}
