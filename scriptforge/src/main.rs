//! Prompt-to-CAD-script design pipeline CLI.
//!
//! `run` drives one design request through planner, generator, executor and
//! validator and prints the outcome as JSON. `check` statically validates a
//! script against the sandbox policy without running it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;

use scriptforge::core::state::PipelineState;
use scriptforge::core::types::DesignStatus;
use scriptforge::exit_codes;
use scriptforge::io::config::{ForgeConfig, load_config, write_config};
use scriptforge::io::events::{FanoutSink, JsonlSink, TracingSink};
use scriptforge::io::generator::CommandGenerator;
use scriptforge::logging;
use scriptforge::pipeline::Pipeline;
use scriptforge::sandbox::Sandbox;

const DEFAULT_CONFIG: &str = "scriptforge.toml";

#[derive(Parser)]
#[command(
    name = "scriptforge",
    version,
    about = "Turn design prompts into validated CAD scripts"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one design request to completion and print the result as JSON.
    Run {
        /// Natural-language design prompt.
        #[arg(short, long)]
        prompt: String,
        /// Iteration ceiling (defaults to `max_iterations` from the config).
        #[arg(long)]
        max_iterations: Option<u32>,
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Append progress events to this JSONL file.
        #[arg(long)]
        events: Option<PathBuf>,
    },
    /// Statically validate a script and print the report as JSON.
    Check {
        script: PathBuf,
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Write a default config file.
    InitConfig {
        path: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

/// Final outcome printed by `scriptforge run`.
#[derive(Debug, Serialize)]
struct RunSummary<'a> {
    request_id: &'a str,
    status: DesignStatus,
    iterations: u32,
    score: Option<f64>,
    error_message: Option<&'a str>,
    script: Option<&'a str>,
}

impl<'a> RunSummary<'a> {
    fn from_state(state: &'a PipelineState) -> Self {
        Self {
            request_id: state.request().id(),
            status: state.design.status,
            iterations: state.attempt(),
            score: state.design.score,
            error_message: state.design.error_message.as_deref(),
            script: state.design.script.as_deref(),
        }
    }
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            prompt,
            max_iterations,
            config,
            events,
        } => cmd_run(&prompt, max_iterations, &config, events.as_deref()),
        Command::Check { script, config } => cmd_check(&script, &config),
        Command::InitConfig { path, force } => cmd_init_config(&path, force),
    }
}

fn cmd_run(
    prompt: &str,
    max_iterations: Option<u32>,
    config_path: &Path,
    events: Option<&Path>,
) -> Result<i32> {
    let config = load_config(config_path)?;
    let mut sink = FanoutSink::new();
    sink.push(Box::new(TracingSink));
    if let Some(path) = events {
        sink.push(Box::new(JsonlSink::create(path)?));
    }
    let generator = Arc::new(CommandGenerator::new(config.generator_command.clone()));
    let pipeline = Pipeline::new(&config, generator)?.with_sink(Arc::new(sink));

    let state = pipeline.run_prompt(prompt, max_iterations)?;
    print_json(&RunSummary::from_state(&state))?;
    Ok(match state.design.status {
        DesignStatus::Completed => exit_codes::OK,
        _ => exit_codes::DESIGN_FAILED,
    })
}

fn cmd_check(script_path: &Path, config_path: &Path) -> Result<i32> {
    let config = load_config(config_path)?;
    let script = fs::read_to_string(script_path)
        .with_context(|| format!("read {}", script_path.display()))?;
    let report = Sandbox::new(config.sandbox).validate(&script);
    print_json(&report)?;
    Ok(if report.valid {
        exit_codes::OK
    } else {
        exit_codes::SCRIPT_REJECTED
    })
}

fn cmd_init_config(path: &Path, force: bool) -> Result<i32> {
    if !force && path.exists() {
        bail!("{} already exists (pass --force to overwrite)", path.display());
    }
    write_config(path, &ForgeConfig::default())?;
    println!("{}", path.display());
    Ok(exit_codes::OK)
}

/// Print `value` as pretty JSON on stdout.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_defaults() {
        let cli = Cli::parse_from(["scriptforge", "run", "--prompt", "create a cube"]);
        match cli.command {
            Command::Run {
                prompt,
                max_iterations,
                config,
                events,
            } => {
                assert_eq!(prompt, "create a cube");
                assert_eq!(max_iterations, None);
                assert_eq!(config, PathBuf::from(DEFAULT_CONFIG));
                assert!(events.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from([
            "scriptforge",
            "run",
            "-p",
            "create a cube",
            "--max-iterations",
            "5",
            "--events",
            "events.jsonl",
        ]);
        assert!(matches!(
            cli.command,
            Command::Run {
                max_iterations: Some(5),
                events: Some(_),
                ..
            }
        ));
    }

    #[test]
    fn parse_check_and_init_config() {
        let cli = Cli::parse_from(["scriptforge", "check", "part.py"]);
        assert!(matches!(cli.command, Command::Check { .. }));

        let cli = Cli::parse_from(["scriptforge", "init-config", "forge.toml", "--force"]);
        assert!(matches!(cli.command, Command::InitConfig { force: true, .. }));
    }

    #[test]
    fn check_reports_rejected_script() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("bad.py");
        fs::write(&script, "import subprocess\nsubprocess.run(['ls'])\n").expect("write");
        let code = cmd_check(&script, &temp.path().join("missing.toml")).expect("check");
        assert_eq!(code, exit_codes::SCRIPT_REJECTED);
    }

    #[test]
    fn init_config_refuses_to_overwrite() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("forge.toml");
        assert_eq!(cmd_init_config(&path, false).expect("init"), exit_codes::OK);
        assert!(cmd_init_config(&path, false).is_err());
        assert_eq!(cmd_init_config(&path, true).expect("force"), exit_codes::OK);
        assert_eq!(load_config(&path).expect("load"), ForgeConfig::default());
    }
}
