//! Static inspection of generated scripts.
//!
//! The script is parsed with tree-sitter's Python grammar and walked without
//! ever being executed. Validation is a pure function of the policy and the
//! source text.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, instrument};
use tree_sitter::{Node, Parser};

use crate::core::types::ScriptValidationReport;
use crate::sandbox::policy::{
    BLOCKED_ATTRIBUTES, DYNAMIC_IMPORT_CALLS, REFLECTION_HELPERS, ScriptPolicy, is_always_blocked,
    is_blocked_dunder,
};

static DUNDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__[A-Za-z]\w*?__").unwrap());

/// Validate `script` against `policy`.
#[instrument(skip_all, fields(script_bytes = script.len(), strict = policy.strict))]
pub fn validate_script(policy: &ScriptPolicy, script: &str) -> ScriptValidationReport {
    if script.trim().is_empty() {
        return rejected("script is empty".to_string());
    }

    let mut parser = Parser::new();
    if let Err(e) = parser.set_language(&tree_sitter_python::LANGUAGE.into()) {
        return rejected(format!("python grammar unavailable: {e}"));
    }
    let Some(tree) = parser.parse(script, None) else {
        return rejected("parser produced no syntax tree".to_string());
    };
    let root = tree.root_node();
    if root.has_error() {
        let message = match first_error(root) {
            Some(node) => format!(
                "syntax error at line {}, column {}",
                node.start_position().row + 1,
                node.start_position().column + 1
            ),
            None => "syntax error".to_string(),
        };
        return rejected(message);
    }

    let mut walker = Walker {
        policy,
        source: script.as_bytes(),
        blocked_calls: policy.blocked_calls(),
        errors: Vec::new(),
        warnings: Vec::new(),
        blocked: Vec::new(),
        used: BTreeSet::new(),
    };
    walker.visit(root);

    let report = ScriptValidationReport {
        valid: walker.errors.is_empty(),
        errors: walker.errors,
        warnings: walker.warnings,
        blocked_operations: walker.blocked,
        allowed_modules_used: walker.used.into_iter().collect(),
    };
    debug!(
        valid = report.valid,
        errors = report.errors.len(),
        warnings = report.warnings.len(),
        "script validated"
    );
    report
}

fn rejected(error: String) -> ScriptValidationReport {
    ScriptValidationReport {
        valid: false,
        errors: vec![error],
        ..ScriptValidationReport::default()
    }
}

fn first_error(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    for i in 0..node.child_count() {
        if let Some(child) = node.child(i)
            && child.has_error()
            && let Some(found) = first_error(child)
        {
            return Some(found);
        }
    }
    None
}

struct Walker<'a> {
    policy: &'a ScriptPolicy,
    source: &'a [u8],
    blocked_calls: BTreeSet<&'static str>,
    errors: Vec<String>,
    warnings: Vec<String>,
    blocked: Vec<String>,
    used: BTreeSet<String>,
}

impl<'a> Walker<'a> {
    fn visit(&mut self, node: Node<'_>) {
        match node.kind() {
            "import_statement" => {
                for i in 0..node.named_child_count() {
                    let Some(child) = node.named_child(i) else {
                        continue;
                    };
                    let module = match child.kind() {
                        "aliased_import" => child.child_by_field_name("name"),
                        _ => Some(child),
                    };
                    if let Some(module) = module {
                        self.check_module(self.text(module), line(module));
                    }
                }
                return;
            }
            "import_from_statement" => {
                if let Some(module) = node.child_by_field_name("module_name") {
                    if module.kind() == "relative_import" {
                        self.block(
                            self.text(module),
                            format!(
                                "relative import '{}' is not permitted (line {})",
                                self.text(module),
                                line(module)
                            ),
                        );
                    } else {
                        self.check_module(self.text(module), line(module));
                    }
                }
                self.check_imported_names(node);
                return;
            }
            "attribute" => {
                self.check_attribute(node);
                if let Some(object) = node.child_by_field_name("object") {
                    self.visit(object);
                }
                return;
            }
            "keyword_argument" => {
                if let Some(value) = node.child_by_field_name("value") {
                    self.visit(value);
                }
                return;
            }
            "identifier" => {
                self.check_identifier(node);
                return;
            }
            "string" => self.check_string(node),
            _ => {}
        }

        for i in 0..node.child_count() {
            if let Some(child) = node.child(i) {
                self.visit(child);
            }
        }
    }

    fn check_module(&mut self, module: &str, line: usize) {
        if is_always_blocked(module) {
            self.block(
                module,
                format!("import of '{module}' is blocked (line {line})"),
            );
        } else if self.policy.is_allowed_module(module) {
            self.used.insert(module.to_string());
        } else if self.policy.strict {
            self.block(
                module,
                format!("module '{module}' is not in the allow-list (line {line})"),
            );
        } else {
            self.warnings.push(format!(
                "module '{module}' is not in the allow-list (line {line})"
            ));
        }
    }

    fn check_attribute(&mut self, node: Node<'_>) {
        let dotted: String = self
            .text(node)
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        if DYNAMIC_IMPORT_CALLS.contains(&dotted.as_str()) {
            self.block(
                &dotted,
                format!("use of '{dotted}' is not permitted (line {})", line(node)),
            );
            return;
        }
        if let Some(attribute) = node.child_by_field_name("attribute") {
            let name = self.text(attribute);
            if is_blocked_dunder(name) {
                self.block(
                    name,
                    format!("access to '{name}' is not permitted (line {})", line(node)),
                );
            } else if REFLECTION_HELPERS.contains(&name) {
                self.block(
                    name,
                    format!("use of '{name}' is not permitted (line {})", line(node)),
                );
            }
        }
    }

    /// `from operator import attrgetter as ag` would hide the name from
    /// [`Self::check_identifier`], so imported names are checked here.
    fn check_imported_names(&mut self, node: Node<'_>) {
        let mut cursor = node.walk();
        let names: Vec<Node<'_>> = node.children_by_field_name("name", &mut cursor).collect();
        for child in names {
            let imported = match child.kind() {
                "aliased_import" => child.child_by_field_name("name"),
                _ => Some(child),
            };
            let Some(imported) = imported else {
                continue;
            };
            let name = self.text(imported);
            if self.blocked_calls.contains(name) || BLOCKED_ATTRIBUTES.contains(&name) {
                self.block(
                    name,
                    format!("import of '{name}' is not permitted (line {})", line(imported)),
                );
            }
        }
    }

    /// Reflection needs the target name as data; dunders spelled inside string
    /// literals are rejected like attribute access.
    fn check_string(&mut self, node: Node<'_>) {
        let text = self.text(node);
        for found in DUNDER_RE.find_iter(text) {
            let name = found.as_str();
            if is_blocked_dunder(name) {
                self.block(
                    name,
                    format!(
                        "string reference to '{name}' is not permitted (line {})",
                        line(node)
                    ),
                );
            }
        }
    }

    fn check_identifier(&mut self, node: Node<'_>) {
        let name = self.text(node);
        if self.blocked_calls.contains(name) {
            self.block(
                name,
                format!("use of '{name}' is not permitted (line {})", line(node)),
            );
        } else if BLOCKED_ATTRIBUTES.contains(&name) {
            self.block(
                name,
                format!("access to '{name}' is not permitted (line {})", line(node)),
            );
        }
    }

    fn block(&mut self, operation: &str, error: String) {
        if !self.blocked.iter().any(|b| b == operation) {
            self.blocked.push(operation.to_string());
        }
        self.errors.push(error);
    }

    fn text(&self, node: Node<'_>) -> &'a str {
        node.utf8_text(self.source).unwrap_or("")
    }
}

fn line(node: Node<'_>) -> usize {
    node.start_position().row + 1
}
