//! Stable exit codes for scriptforge CLI commands.

/// Design completed, or `check` found the script valid.
pub const OK: i32 = 0;
/// Invalid input, config, or any other error before a design could run.
pub const INVALID: i32 = 1;
/// `scriptforge run` ended in a failed design.
pub const DESIGN_FAILED: i32 = 2;
/// `scriptforge check` rejected the script.
pub const SCRIPT_REJECTED: i32 = 3;
