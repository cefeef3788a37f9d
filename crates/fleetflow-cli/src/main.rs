//! Fleetflow CLI
//!
//! The `fleetflow` command drives both pipeline cores:
//!
//! - `run` / `confirm` / `resume`: the Puhemies ingestion flow. `run`
//!   exits 0 when the run completes and 2 when it suspends for human
//!   input; `confirm` records a header choice; `resume` continues a
//!   suspended run.
//! - `incident-flow`: one lock-guarded fleet detection run.
//! - `validate`: score a run against synthetic truth labels.

use std::io::Write;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;

use fleetflow_core::incident::{
    run_worker, validate::validate_scenario, IncidentFlowOptions, SelectMode,
};
use fleetflow_core::puhemies::{
    continue_run, run_from_file, write_human_confirmation, Choice, HeaderSpec, PuhemiesResponse,
};
use fleetflow_core::{Config, FlowError};
use fleetflow_store::build_store;

const EXIT_SUSPENDED: i32 = 2;

#[derive(Parser)]
#[command(name = "fleetflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Batch pipelines over a shared artifact store", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a Puhemies ingestion run from a file
    Run {
        /// Path to input file (.xlsx, .xls or .csv), or a gs:// URI
        #[arg(long)]
        input: String,

        /// Run id (default: UTC timestamp)
        #[arg(long)]
        run_id: Option<String>,

        /// Artifacts root (local path or gs://bucket/prefix)
        #[arg(long, env = "ARTIFACTS_ROOT")]
        artifacts_root: Option<String>,

        /// Prompt for a header choice and resume immediately
        #[arg(long)]
        interactive: bool,
    },

    /// Confirm a header candidate for a suspended run
    Confirm {
        /// Run id to confirm
        #[arg(long)]
        run_id: String,

        /// Header candidate id to confirm
        #[arg(long)]
        choice: String,

        #[arg(long, env = "ARTIFACTS_ROOT")]
        artifacts_root: Option<String>,
    },

    /// Resume a run after confirmation, override, or recipe
    Resume {
        /// Run id to resume
        #[arg(long)]
        run_id: String,

        #[arg(long, env = "ARTIFACTS_ROOT")]
        artifacts_root: Option<String>,
    },

    /// Run incident detection against snapshots
    IncidentFlow {
        /// Run identifier (default: UTC timestamp based)
        #[arg(long)]
        run_id: Option<String>,

        #[arg(long, env = "ARTIFACTS_ROOT")]
        artifacts_root: Option<String>,

        /// Optional separate root for reading snapshots
        #[arg(long)]
        snapshot_root: Option<String>,

        /// Snapshot key prefix (default: <run-id>/snapshots)
        #[arg(long)]
        snapshot_prefix: Option<String>,

        /// Ticket key prefix (default: <run-id>/tickets)
        #[arg(long)]
        ticket_prefix: Option<String>,

        /// Purge runs older than this many hours (skip if pinned)
        #[arg(long)]
        retention_hours: Option<i64>,

        /// Consider snapshots ending within this many hours from now
        #[arg(long, default_value = "24")]
        window_hours: i64,

        /// Pick only the latest snapshot per host, or all in window
        #[arg(long, default_value = "latest")]
        select_mode: String,

        /// Safety cap on number of hosts processed
        #[arg(long)]
        max_hosts: Option<usize>,
    },

    /// Validate a run against synthetic truth labels
    Validate {
        /// Run id to validate
        #[arg(long)]
        run_id: String,

        #[arg(long, env = "ARTIFACTS_ROOT")]
        artifacts_root: Option<String>,

        /// Fail when scenario warnings are present
        #[arg(long)]
        strict_scenario: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    fleetflow_core::init_tracing(cli.json, level);

    let code = match cli.command {
        Commands::Run {
            input,
            run_id,
            artifacts_root,
            interactive,
        } => cmd_run(&input, run_id, artifacts_root, interactive).await?,
        Commands::Confirm {
            run_id,
            choice,
            artifacts_root,
        } => cmd_confirm(&run_id, &choice, artifacts_root).await?,
        Commands::Resume {
            run_id,
            artifacts_root,
        } => cmd_resume(&run_id, artifacts_root).await?,
        Commands::IncidentFlow {
            run_id,
            artifacts_root,
            snapshot_root,
            snapshot_prefix,
            ticket_prefix,
            retention_hours,
            window_hours,
            select_mode,
            max_hosts,
        } => {
            cmd_incident_flow(
                run_id,
                artifacts_root,
                snapshot_root,
                snapshot_prefix,
                ticket_prefix,
                retention_hours,
                window_hours,
                &select_mode,
                max_hosts,
            )
            .await?
        }
        Commands::Validate {
            run_id,
            artifacts_root,
            strict_scenario,
        } => cmd_validate(&run_id, artifacts_root, strict_scenario).await?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn resolve_artifacts_root(flag: Option<String>) -> String {
    flag.unwrap_or_else(|| Config::from_env().artifacts_root)
}

fn default_run_id() -> String {
    chrono::Utc::now().format("%Y%m%d-%H%M%S").to_string()
}

fn print_choices(choices: &[Choice]) {
    for (idx, choice) in choices.iter().enumerate() {
        println!(
            "{}) {} | confidence={} | {}",
            idx + 1,
            choice.id,
            choice.confidence,
            choice.normalized_headers.join(", ")
        );
    }
}

async fn cmd_run(
    input: &str,
    run_id: Option<String>,
    artifacts_root: Option<String>,
    interactive: bool,
) -> Result<i32> {
    let artifacts_root = resolve_artifacts_root(artifacts_root);
    let store = build_store(&artifacts_root)?;
    let run_id = run_id.unwrap_or_else(default_run_id);

    let response = run_from_file(store.as_ref(), &run_id, input)
        .await
        .with_context(|| format!("run failed for input {input}"))?;

    println!("{}", response.message);
    if response.is_ok() {
        return Ok(0);
    }

    if let Some(question) = &response.question {
        println!("{question}");
    }
    let choices = response.choices.clone().unwrap_or_default();
    print_choices(&choices);
    println!("Next: fleetflow confirm --run-id {run_id} --choice <candidate_id>");

    if interactive {
        print!("Choose candidate (id or number): ");
        std::io::stdout().flush().ok();
        let mut line = String::new();
        std::io::stdin()
            .read_line(&mut line)
            .context("failed to read choice")?;
        let input_choice = line.trim();
        let selected_id = match input_choice.parse::<usize>() {
            Ok(number) if number >= 1 && number <= choices.len() => {
                choices[number - 1].id.clone()
            }
            _ => input_choice.to_string(),
        };
        write_human_confirmation(store.as_ref(), &run_id, &selected_id, "interactive").await?;
        println!("Confirmation saved for {selected_id}. Resuming...");
        let resumed = continue_run(store.as_ref(), &run_id).await?;
        println!("{}", resumed.message);
        return Ok(if resumed.is_ok() { 0 } else { EXIT_SUSPENDED });
    }

    Ok(EXIT_SUSPENDED)
}

async fn cmd_confirm(run_id: &str, choice: &str, artifacts_root: Option<String>) -> Result<i32> {
    let artifacts_root = resolve_artifacts_root(artifacts_root);
    let store = build_store(&artifacts_root)?;

    let header_spec: HeaderSpec =
        fleetflow_store::read_json(store.as_ref(), &format!("{run_id}/header_spec.json"))
            .await
            .context("header_spec.json not found for run")?;
    if !header_spec
        .candidates
        .iter()
        .any(|c| c.candidate_id == choice)
    {
        anyhow::bail!("Invalid candidate id: {choice}");
    }

    write_human_confirmation(store.as_ref(), run_id, choice, "cli").await?;
    println!("Confirmation saved.");
    println!("Next: fleetflow resume --run-id {run_id}");
    Ok(0)
}

async fn cmd_resume(run_id: &str, artifacts_root: Option<String>) -> Result<i32> {
    let artifacts_root = resolve_artifacts_root(artifacts_root);
    let store = build_store(&artifacts_root)?;

    let response: PuhemiesResponse = continue_run(store.as_ref(), run_id)
        .await
        .with_context(|| format!("resume failed for run {run_id}"))?;
    println!("{}", response.message);
    if response.is_ok() {
        return Ok(0);
    }
    if let Some(question) = &response.question {
        println!("{question}");
    }
    Ok(EXIT_SUSPENDED)
}

#[allow(clippy::too_many_arguments)]
async fn cmd_incident_flow(
    run_id: Option<String>,
    artifacts_root: Option<String>,
    snapshot_root: Option<String>,
    snapshot_prefix: Option<String>,
    ticket_prefix: Option<String>,
    retention_hours: Option<i64>,
    window_hours: i64,
    select_mode: &str,
    max_hosts: Option<usize>,
) -> Result<i32> {
    let mut config = Config::from_env();
    if let Some(root) = artifacts_root {
        config.artifacts_root = root;
    }
    let select_mode = SelectMode::parse(select_mode)
        .with_context(|| format!("invalid select mode: {select_mode}"))?;
    let run_id = run_id.unwrap_or_else(|| {
        format!("run-{}", chrono::Utc::now().format("%Y%m%d-%H%M%SZ"))
    });

    let options = IncidentFlowOptions {
        run_id: run_id.clone(),
        snapshot_root,
        snapshot_prefix,
        ticket_prefix,
        retention_hours: retention_hours.unwrap_or(config.retention_hours),
        window_hours,
        select_mode,
        max_hosts,
    };

    let result = match run_worker(&config, options).await {
        Ok(result) => result,
        Err(FlowError::LockHeld) => {
            eprintln!("Another run is in progress; exiting.");
            return Ok(1);
        }
        Err(err) => return Err(err).context("incident flow failed"),
    };

    let fleet = &result.fleet_summary;
    println!("Run ID: {run_id}");
    println!("Hosts: {}", fleet.host_count);
    println!("Incidents: {}", fleet.incident_count);
    println!("Clusters: {}", fleet.clusters.len());
    println!("Overall risk: {}", fleet.overall_risk_score);
    if !result.purged_runs.is_empty() {
        println!("Purged runs: {}", result.purged_runs.join(", "));
    }
    Ok(0)
}

async fn cmd_validate(
    run_id: &str,
    artifacts_root: Option<String>,
    strict_scenario: bool,
) -> Result<i32> {
    let artifacts_root = resolve_artifacts_root(artifacts_root);
    let store = build_store(&artifacts_root)?;

    let summary = validate_scenario(store.as_ref(), run_id, strict_scenario)
        .await
        .with_context(|| format!("validation failed for run {run_id}"))?;
    println!("Validation passed for run {run_id}");
    println!(
        "precision={:.2} recall={:.2} ranking={:.2} cluster_detected={}",
        summary.incident_type_precision,
        summary.incident_type_recall,
        summary.ranking_score,
        summary.cluster_detected
    );
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_run_id_shape() {
        let run_id = default_run_id();
        assert_eq!(run_id.len(), "YYYYMMDD-HHMMSS".len());
        assert!(run_id.chars().nth(8) == Some('-'));
    }

    #[test]
    fn test_cli_parses_incident_flow() {
        let cli = Cli::try_parse_from([
            "fleetflow",
            "incident-flow",
            "--run-id",
            "run-1",
            "--select-mode",
            "all",
            "--window-hours",
            "48",
            "--max-hosts",
            "5",
        ])
        .unwrap();
        match cli.command {
            Commands::IncidentFlow {
                run_id,
                select_mode,
                window_hours,
                max_hosts,
                ..
            } => {
                assert_eq!(run_id.as_deref(), Some("run-1"));
                assert_eq!(select_mode, "all");
                assert_eq!(window_hours, 48);
                assert_eq!(max_hosts, Some(5));
            }
            _ => panic!("expected incident-flow"),
        }
    }

    #[test]
    fn test_cli_requires_input_for_run() {
        assert!(Cli::try_parse_from(["fleetflow", "run"]).is_err());
        assert!(Cli::try_parse_from(["fleetflow", "run", "--input", "a.csv"]).is_ok());
    }
}
