//! CLI entry point for the SPM sequencer.
//!
//! ```bash
//! # Run a plan against the configured controller
//! spm-sequencer run --plan config/plan.json
//!
//! # Same plan against the built-in simulated controller
//! spm-sequencer run --plan config/plan.json --dry-run
//!
//! # Show the command a template produces
//! spm-sequencer resolve set_bias bias=0.5
//!
//! # Validate configuration and templates
//! spm-sequencer check
//!
//! # Estimate a plan; needs no configuration file
//! spm-sequencer estimate --plan config/plan.json
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use spm_core::{ArgValue, CommandArgs};
use spm_experiment::{format_duration, load_plan, ProgressEvent, Task};
use spm_protocol::{MockController, Operation, Transport};
use spm_sequencer::logging::{self, OutputFormat, TracingConfig};
use spm_sequencer::{config::DEFAULT_CONFIG_PATH, AppConfig, Session};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "spm-sequencer")]
#[command(about = "Task queue and executor for scanning probe microscope controllers", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue every task of a plan file and run until the queue drains
    Run {
        /// JSON plan file
        #[arg(long)]
        plan: PathBuf,

        /// Use the simulated controller instead of connecting
        #[arg(long)]
        dry_run: bool,
    },

    /// Resolve a command template with `key=value` arguments
    Resolve {
        /// Operation or template name
        name: String,

        /// Arguments, e.g. `bias=0.5`
        args: Vec<String>,
    },

    /// List the tasks of a plan file with their estimated durations
    Estimate {
        /// JSON plan file
        #[arg(long)]
        plan: PathBuf,
    },

    /// Validate configuration and command templates
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { plan, dry_run } => run(&load_config(&cli.config)?, &plan, dry_run).await,
        Commands::Resolve { name, args } => resolve(&load_config(&cli.config)?, &name, &args),
        Commands::Estimate { plan } => {
            logging::init(TracingConfig::new(Level::WARN).with_format(OutputFormat::Compact))
                .map_err(anyhow::Error::msg)?;
            estimate(&plan).map(|_| ())
        }
        Commands::Check => check(&load_config(&cli.config)?),
    }
}

/// Load the configuration file and start logging as it says.
fn load_config(path: &Path) -> Result<AppConfig> {
    let config =
        AppConfig::load_from(path).with_context(|| format!("loading {}", path.display()))?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
    Ok(config)
}

fn read_plan(path: &Path) -> Result<Vec<Task>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading plan {}", path.display()))?;
    load_plan(&json).with_context(|| format!("parsing plan {}", path.display()))
}

async fn run(config: &AppConfig, plan: &Path, dry_run: bool) -> Result<()> {
    let tasks = read_plan(plan)?;
    info!(tasks = tasks.len(), plan = %plan.display(), "Plan loaded");

    if dry_run {
        let templates = config.load_templates().context("loading command templates")?;
        let session = Session::with_transport(
            templates,
            MockController::simulated(),
            config.executor_config(),
            config.executor.event_capacity,
        );
        drive(session, tasks).await
    } else {
        let session = Session::start(config)
            .await
            .with_context(|| format!("starting session on {}", config.controller.address()))?;
        drive(session, tasks).await
    }
}

async fn drive<T: Transport + 'static>(session: Session<T>, tasks: Vec<Task>) -> Result<()> {
    let mut events = session.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Event printer fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    session.enqueue_all(tasks);
    info!(
        remaining = %format_duration(session.remaining_estimate()),
        "Queue started"
    );

    tokio::select! {
        _ = session.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => warn!("Interrupted, stopping after the current step"),
    }

    let halted = session.is_halted();
    let snapshot = session.shutdown().await?;
    printer.abort();

    let history = snapshot.history.len();
    let left = snapshot.active.len();
    info!(finished = history, not_run = left, "Session ended");
    for task in &snapshot.history {
        println!("{:<24} {}", task.name, task.status);
    }
    for task in &snapshot.active {
        println!("{:<24} {} (not run)", task.name, task.status);
    }
    if halted {
        bail!("controller connection lost; {} task(s) not run", left);
    }
    Ok(())
}

fn print_event(event: &ProgressEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!(error = %e, "Could not encode event"),
    }
}

fn parse_arg(raw: &str) -> Result<(String, ArgValue)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("argument '{}' is not key=value", raw);
    };
    let value = if let Ok(i) = value.parse::<i64>() {
        ArgValue::Int(i)
    } else if let Ok(f) = value.parse::<f64>() {
        ArgValue::Float(f)
    } else {
        ArgValue::Text(value.to_string())
    };
    Ok((key.to_string(), value))
}

fn resolve(config: &AppConfig, name: &str, raw_args: &[String]) -> Result<()> {
    let templates = config.load_templates().context("loading command templates")?;
    let mut args = CommandArgs::new();
    for raw in raw_args {
        let (key, value) = parse_arg(raw)?;
        args.set(key, value);
    }
    let command = templates.resolve(name, &args)?;
    println!("{}", command);
    Ok(())
}

fn estimate(plan: &Path) -> Result<Duration> {
    let tasks = read_plan(plan)?;
    let mut total = Duration::ZERO;
    for task in &tasks {
        let estimate = task.estimated_duration();
        total = total.saturating_add(estimate);
        println!(
            "{:<24} {:<14} {:>3} steps  {}",
            task.name(),
            task.kind().to_string(),
            task.expand().len(),
            format_duration(estimate)
        );
    }
    println!("{} task(s), total {}", tasks.len(), format_duration(total));
    Ok(total)
}

fn check(config: &AppConfig) -> Result<()> {
    let templates = config.load_templates().with_context(|| {
        format!("loading command templates {}", config.commands.path.display())
    })?;
    println!("{} template(s) loaded from {}", templates.len(), config.commands.path.display());

    let missing = templates.missing(Operation::names());
    if missing.is_empty() {
        println!("All {} operations have templates", Operation::ALL.len());
    } else {
        println!("Missing templates: {}", missing.join(", "));
    }

    println!();
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arg() {
        assert_eq!(parse_arg("lines=256").unwrap(), ("lines".into(), ArgValue::Int(256)));
        assert_eq!(parse_arg("bias=-0.5").unwrap(), ("bias".into(), ArgValue::Float(-0.5)));
        assert_eq!(
            parse_arg("mode=z").unwrap(),
            ("mode".into(), ArgValue::Text("z".into()))
        );
        assert!(parse_arg("bias").is_err());
    }

    #[test]
    fn test_estimate_without_config_saturates() {
        let dir = tempfile::tempdir().unwrap();
        let plan = dir.path().join("plan.json");
        let slow = r#"{
            "kind": "image_scan", "name": "slow",
            "params": {"size": 1e-7, "x_offset": 0, "y_offset": 0, "bias": 0.1,
                       "set_point": 1e-10, "line_time": 1e16, "lines_per_frame": 500}
        }"#;
        std::fs::write(&plan, format!("[{}, {}]", slow, slow)).unwrap();

        assert_eq!(estimate(&plan).unwrap(), Duration::MAX);
    }
}
