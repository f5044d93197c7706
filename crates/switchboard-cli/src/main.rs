use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;

use switchboard::{ExecutionEvent, Orchestrator, PlanStatus, RankPreferences, SwitchboardConfig};

#[derive(Parser)]
#[command(
    name = "switchboard",
    about = "Plan workflows and route their steps across execution backends"
)]
struct Cli {
    /// Path to switchboard.toml config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse a workflow and print the plan with its cost estimate
    Plan {
        /// Assignee for steps without a `name:` prefix
        #[arg(long)]
        assignee: Option<String>,
        #[arg(trailing_var_arg = true, required = true)]
        workflow: Vec<String>,
    },
    /// Execute a workflow against offline echo adapters
    Run {
        #[arg(long)]
        assignee: Option<String>,
        /// Print every execution event as a JSON line
        #[arg(long)]
        json: bool,
        #[arg(trailing_var_arg = true, required = true)]
        workflow: Vec<String>,
    },
    /// Show adapters ranked for a capability
    Rank {
        capability: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
        /// Favor adapters served from this host
        #[arg(long)]
        prefer_local: bool,
        /// Penalize expensive adapters more strongly
        #[arg(long)]
        prefer_cost: bool,
    },
    /// Show the configured budget window
    Budget,
}

fn load_config(path: Option<&Path>) -> Result<SwitchboardConfig> {
    match path {
        Some(path) => SwitchboardConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(SwitchboardConfig::default()),
    }
}

fn build_orchestrator(config: &SwitchboardConfig) -> Result<Orchestrator> {
    let registry =
        switchboard::echo_registry(config).context("failed to build adapter registry")?;
    if registry.is_empty() {
        tracing::warn!("no adapters configured; every step will be unavailable");
    }
    Ok(Orchestrator::from_config(config, registry))
}

async fn run_workflow(
    orchestrator: &Orchestrator,
    workflow: &str,
    assignee: Option<&str>,
    json: bool,
) -> Result<bool> {
    let plan = orchestrator.submit(workflow, assignee)?;
    let mut events = orchestrator.execute(plan).into_stream();
    let mut succeeded = false;

    while let Some(event) = events.next().await {
        if json {
            println!("{}", serde_json::to_string(&event)?);
        }
        match event {
            ExecutionEvent::StepStarted {
                step_id, adapter, ..
            } if !json => {
                eprintln!("{step_id} -> {adapter}");
            }
            ExecutionEvent::Chunk { text, .. } if !json => {
                print!("{text}");
            }
            ExecutionEvent::StepFinished { outcome } if !json => {
                println!();
                eprintln!("{}: {:?}", outcome.step_id, outcome.status);
            }
            ExecutionEvent::PlanFinished { summary } => {
                succeeded = summary.status == PlanStatus::Completed;
                if !json {
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                }
            }
            _ => {}
        }
    }

    if !json {
        eprintln!(
            "\n---\nSpend: {}",
            serde_json::to_string(&orchestrator.budget_summary())?
        );
    }
    Ok(succeeded)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let orchestrator = build_orchestrator(&config)?;

    match cli.command {
        Command::Plan { assignee, workflow } => {
            let plan = orchestrator.submit(&workflow.join(" "), assignee.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Command::Run {
            assignee,
            json,
            workflow,
        } => {
            let ok =
                run_workflow(&orchestrator, &workflow.join(" "), assignee.as_deref(), json).await?;
            if !ok {
                std::process::exit(1);
            }
        }
        Command::Rank {
            capability,
            limit,
            prefer_local,
            prefer_cost,
        } => {
            let configured = orchestrator.preferences();
            let preferences = RankPreferences {
                prefer_local: prefer_local || configured.prefer_local,
                prefer_cost: prefer_cost || configured.prefer_cost,
                ..configured.clone()
            };
            let ranked = orchestrator.rank_with(&capability, limit, &preferences);
            if ranked.is_empty() {
                eprintln!("no adapter advertises '{capability}'");
            }
            println!("{}", serde_json::to_string_pretty(&ranked)?);
        }
        Command::Budget => {
            println!(
                "{}",
                serde_json::to_string_pretty(&orchestrator.budget_summary())?
            );
        }
    }

    Ok(())
}
