//! Stepper command line.
//!
//! Plans and runs the demo operations against a simulated target.

mod demo;
mod steps;
mod target;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use stepper::{
    history::history_id, JobOutcome, JobTracker, MemoryDiagnostics, PropertiesContainer, Stepper, StepperConfig,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use target::SimulatedTarget;

#[derive(Parser)]
#[command(name = "stepperctl")]
#[command(version, about = "Plan and run stepper operations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the operations of the demo service
    Operations,

    /// Print the resolved step order of an operation without running it
    Plan {
        /// Operation name (see `operations`)
        operation: String,

        /// Target id
        #[arg(short, long, default_value = "board")]
        target: String,

        /// Processes to launch/attach, comma separated
        #[arg(short, long, value_delimiter = ',', default_value = "main")]
        processes: Vec<String>,
    },

    /// Run an operation against a simulated target
    ///
    /// Examples:
    ///     stepperctl run connect
    ///     stepperctl run launch --processes app,helper
    ///     stepperctl run launch --fail-at attach-context
    ///     stepperctl run connect --cancel-after 120 --json
    #[command(verbatim_doc_comment)]
    Run {
        /// Operation name (see `operations`)
        operation: String,

        /// Target id
        #[arg(short, long, default_value = "board")]
        target: String,

        /// Processes to launch/attach, comma separated
        #[arg(short, long, value_delimiter = ',', default_value = "main")]
        processes: Vec<String>,

        /// Make the named step report an error
        #[arg(long, value_name = "STEP")]
        fail_at: Option<String>,

        /// Cancel the job after this many milliseconds
        #[arg(long, value_name = "MS")]
        cancel_after: Option<u64>,

        /// Simulated round-trip time of every target call, in milliseconds
        #[arg(long, value_name = "MS", default_value_t = 50)]
        latency: u64,

        /// Extra job data (format: key=value), can be repeated
        #[arg(long = "set", value_name = "KEY=VALUE")]
        variables: Vec<String>,

        /// Print the report as JSON
        #[arg(short, long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load environment variables before reading the filter and config
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,stepper=debug".into());
    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    let config = StepperConfig::from_env().context("Failed to load STEPPER_ configuration")?;

    match cli.command {
        Commands::Operations => {
            let service = demo::service();
            for name in service.operations() {
                if let Some(entry) = service.entry(&name) {
                    println!(
                        "{:<12} group={:<12} cancelable={:<5} history={}",
                        name, entry.step_group_id, entry.cancelable, entry.history
                    );
                }
            }
            Ok(())
        }
        Commands::Plan {
            operation,
            target,
            processes,
        } => plan(config, &operation, &target, &processes),
        Commands::Run {
            operation,
            target,
            processes,
            fail_at,
            cancel_after,
            latency,
            variables,
            json,
        } => {
            let target = SimulatedTarget::new(target)
                .with_latency(Duration::from_millis(latency))
                .failing_at(fail_at);
            let data = job_data(&processes, &variables)?;
            run(config, &operation, target, data, cancel_after, json).await
        }
    }
}

struct Engine {
    stepper: Stepper,
    diagnostics: Arc<MemoryDiagnostics>,
}

fn engine(config: StepperConfig) -> Result<Engine> {
    let tracker = Arc::new(JobTracker::new());
    let registry = demo::registry(tracker.clone()).context("Invalid demo step catalogue")?;
    let diagnostics = Arc::new(MemoryDiagnostics::new());
    let stepper = Stepper::builder(registry)
        .config(config)
        .service(Arc::new(demo::service()))
        .scheduling_rules(Arc::new(demo::DemoRules))
        .tracker(tracker)
        .diagnostics(diagnostics.clone())
        .build();
    Ok(Engine { stepper, diagnostics })
}

fn group_for(operation: &str) -> Result<String> {
    match demo::service().entry(operation) {
        Some(entry) => Ok(entry.step_group_id.clone()),
        None => bail!("Unknown operation '{}' (try `stepperctl operations`)", operation),
    }
}

fn plan(config: StepperConfig, operation: &str, target: &str, processes: &[String]) -> Result<()> {
    let engine = engine(config)?;
    let group = group_for(operation)?;
    let iterations = HashMap::from([
        ("attach".to_string(), processes.len()),
        ("detach".to_string(), processes.len()),
    ]);
    let order = engine
        .stepper
        .plan(&SimulatedTarget::new(target), &group, &iterations)
        .with_context(|| format!("Failed to plan '{}'", operation))?;
    for (i, id) in order.iter().enumerate() {
        println!("{:>3}. {}", i + 1, id);
    }
    Ok(())
}

/// Parse `--set key=value` pairs; values are JSON when they parse as such.
fn job_data(processes: &[String], variables: &[String]) -> Result<PropertiesContainer> {
    let data = PropertiesContainer::new();
    data.set("processes", json!(processes));
    for pair in variables {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("Invalid --set '{}', expected KEY=VALUE", pair);
        };
        let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        data.set(key.trim(), value);
    }
    Ok(data)
}

async fn run(
    config: StepperConfig,
    operation: &str,
    target: SimulatedTarget,
    data: PropertiesContainer,
    cancel_after: Option<u64>,
    json_output: bool,
) -> Result<()> {
    let engine = engine(config)?;
    let target = Arc::new(target);
    let job = engine
        .stepper
        .run(target.clone(), operation, data)
        .with_context(|| format!("Failed to start '{}'", operation))?;
    tracing::info!(job_id = %job.id(), operation, target = %target.status().connect_state, "Job submitted");

    if let Some(ms) = cancel_after {
        let job = job.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            if !job.cancel() {
                tracing::warn!(job_id = %job.id(), "Job is not cancelable");
            }
        });
    }

    let outcome = tokio::select! {
        outcome = job.wait() => outcome,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupt received, cancelling job");
            job.cancel();
            job.wait().await
        }
    };

    let history = engine
        .stepper
        .history()
        .recent(&history_id(job.context_id(), operation));
    let diagnostics = engine.diagnostics.entries();

    if json_output {
        let report = json!({
            "job_id": job.id(),
            "operation": operation,
            "outcome": outcome,
            "target": target.status(),
            "diagnostics": diagnostics,
            "history": history,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{} on {}: {}", job.name(), job.context_id(), outcome);
        let status = target.status();
        println!("  connect state: {}", status.connect_state);
        println!("  channel open:  {}", status.channel_open);
        for (name, state) in &status.processes {
            println!("  process {}: {:?}", name, state);
        }
        for d in &diagnostics {
            println!("  [{:?}] {}", d.level, d.message);
        }
        if !history.is_empty() {
            println!("  history entries: {}", history.len());
        }
    }

    match outcome {
        JobOutcome::Failed { .. } => std::process::exit(1),
        JobOutcome::Cancelled { .. } => std::process::exit(130),
        JobOutcome::Succeeded => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_data_parses_values() {
        let data = job_data(
            &["p1".to_string()],
            &["retries=3".to_string(), "label=board one".to_string()],
        )
        .unwrap();
        assert_eq!(data.get("processes"), Some(json!(["p1"])));
        assert_eq!(data.get("retries"), Some(json!(3)));
        assert_eq!(data.get("label"), Some(json!("board one")));
    }

    #[test]
    fn test_job_data_rejects_missing_separator() {
        assert!(job_data(&[], &["oops".to_string()]).is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "stepperctl",
            "run",
            "launch",
            "--processes",
            "a,b",
            "--fail-at",
            "attach-context",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                operation,
                processes,
                fail_at,
                ..
            } => {
                assert_eq!(operation, "launch");
                assert_eq!(processes, vec!["a", "b"]);
                assert_eq!(fail_at.as_deref(), Some("attach-context"));
            }
            _ => panic!("expected run"),
        }
    }
}
