use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use buildloop_core::{CostConfidence, MilestoneSummary, PhaseKind, PhaseResult, PhaseStatus};
use clap::{Args, Parser, Subcommand};
use orchestrator::{
    AgentClient, ClaudeCliClient, CheckpointStore, MilestoneDriver, PolicyTable, ProjectConfig,
    ProjectLayout, ResourceMonitor,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_PHASE_FAILED: u8 = 1;
const EXIT_SETUP_FAILED: u8 = 2;

#[derive(Parser)]
#[command(name = "buildloop")]
#[command(about = "Drive a coding agent through the phases of a project milestone", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the phases of one milestone
    Run(RunArgs),
    /// Show the checkpoints recorded for a milestone
    Status {
        #[arg(short, long, default_value = ".")]
        project: PathBuf,

        #[arg(short, long)]
        milestone: u32,
    },
    /// Print the effective phase policy table
    Phases {
        #[arg(short, long, default_value = ".")]
        project: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    #[arg(short, long, default_value = ".")]
    project: PathBuf,

    #[arg(short, long)]
    milestone: u32,

    /// Override a phase timeout, e.g. `--timeout implement=7200`
    #[arg(long = "timeout", value_name = "PHASE=SECONDS", value_parser = parse_timeout)]
    timeouts: Vec<(PhaseKind, u64)>,

    /// Run every phase even if its checkpoint says completed
    #[arg(long)]
    no_resume: bool,

    /// Run a single phase
    #[arg(long, value_parser = parse_phase)]
    only: Option<PhaseKind>,
}

fn parse_phase(s: &str) -> std::result::Result<PhaseKind, String> {
    PhaseKind::parse(s).ok_or_else(|| {
        let names: Vec<&str> = PhaseKind::ALL.iter().map(|k| k.as_str()).collect();
        format!("unknown phase '{}' (expected one of: {})", s, names.join(", "))
    })
}

fn parse_timeout(s: &str) -> std::result::Result<(PhaseKind, u64), String> {
    let (phase, seconds) = s
        .split_once('=')
        .ok_or_else(|| format!("expected PHASE=SECONDS, got '{}'", s))?;
    let seconds: u64 = seconds
        .trim()
        .parse()
        .map_err(|e| format!("invalid timeout '{}': {}", seconds, e))?;
    if seconds == 0 {
        return Err("timeout must be at least one second".to_string());
    }
    Ok((parse_phase(phase.trim())?, seconds))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let outcome = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Status { project, milestone } => status(project, milestone).await,
        Commands::Phases { project } => phases(project).await,
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(EXIT_SETUP_FAILED)
        }
    }
}

fn open_project(project: &Path) -> Result<ProjectLayout> {
    let root = project
        .canonicalize()
        .with_context(|| format!("Project directory {} not found", project.display()))?;
    Ok(ProjectLayout::new(root))
}

async fn load_policies(layout: &ProjectLayout) -> Result<(ProjectConfig, PolicyTable)> {
    let config = ProjectConfig::read(layout).await;
    let tier = ResourceMonitor::detect_tier();
    tracing::debug!(tier = tier.as_str(), "Detected memory tier");
    let policies = config
        .policy_table(tier)
        .with_context(|| format!("Invalid phase settings in {}", layout.config_path().display()))?;
    Ok((config, policies))
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let layout = open_project(&args.project)?;
    let (config, mut policies) = load_policies(&layout).await?;
    for (kind, seconds) in &args.timeouts {
        policies.set_timeout(*kind, *seconds);
    }

    let agent = match config.agent.binary {
        Some(ref binary) => ClaudeCliClient::with_binary(binary),
        None => ClaudeCliClient::discover().context("Cannot run phases without the agent")?,
    };
    tracing::info!(
        project = %layout.root().display(),
        agent = %agent.binary().display(),
        "Starting build loop"
    );
    let agent: Arc<dyn AgentClient> = Arc::new(agent);

    let mut driver = MilestoneDriver::from_config(layout, &config, policies, agent)
        .with_resume(!args.no_resume)
        .with_only(args.only);
    let summary = driver
        .run(args.milestone)
        .await
        .with_context(|| format!("Milestone {} could not be run", args.milestone))?;

    print_summary(&summary);
    if summary.succeeded {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_PHASE_FAILED))
    }
}

fn print_summary(summary: &MilestoneSummary) {
    println!();
    println!("Milestone {}", summary.milestone);
    println!("════════════════════════════════════════");
    for result in &summary.results {
        print_result(result);
    }
    println!();

    if summary.cost_is_lower_bound() {
        let unknown: Vec<&str> = summary.unknown_cost_phases.iter().map(|k| k.as_str()).collect();
        println!(
            "Total cost:     at least ${:.4} (unknown for: {})",
            summary.total_cost_usd,
            unknown.join(", ")
        );
    } else {
        println!("Total cost:     ${:.4}", summary.total_cost_usd);
    }
    println!("Total duration: {:.1}s", summary.total_duration_ms as f64 / 1000.0);

    if let Some(failed) = summary.results.iter().find(|r| !r.is_success()) {
        println!();
        println!("Phase '{}' did not complete", failed.phase);
        println!("  status:   {}", failed.status);
        println!("  messages: {}", failed.message_count);
        println!("  attempts: {}", failed.attempts);
        if let Some(ref error) = failed.error {
            println!("  error:    {}", error);
        }
    }
    println!();
}

fn print_result(result: &PhaseResult) {
    let icon = match result.status {
        PhaseStatus::Completed => "●",
        PhaseStatus::Skipped => "○",
        PhaseStatus::TimedOut => "◌",
        _ => "✗",
    };
    let cost = if result.cost_confidence == CostConfidence::Unknown {
        "      ?".to_string()
    } else {
        format!("${:.4}", result.cost_usd)
    };
    let persisted = if result.checkpoint_persisted { "" } else { "  (checkpoint not saved)" };
    println!(
        "  {} {:<12} {:<10} {:>8} {:>8.1}s{}",
        icon,
        result.phase.as_str(),
        result.status.as_str(),
        cost,
        result.duration_ms as f64 / 1000.0,
        persisted
    );
}

async fn status(project: PathBuf, milestone: u32) -> Result<ExitCode> {
    let layout = open_project(&project)?;
    let store = CheckpointStore::new(layout);
    let checkpoints = store
        .read_milestone(milestone)
        .await
        .with_context(|| format!("Failed to read checkpoints for milestone {}", milestone))?;

    println!();
    println!("Milestone {}", milestone);
    println!("Path:      {}", store.layout().root().display());
    println!();

    if checkpoints.is_empty() {
        println!("No checkpoints yet.");
    } else {
        for (kind, checkpoint) in &checkpoints {
            let ended = checkpoint
                .end_time
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {:<12} {:<10} ${:.4} {:?} {}",
                kind.as_str(),
                checkpoint.status.as_str(),
                checkpoint.cost_usd, checkpoint.cost_confidence, ended
            );
            if let Some(ref error) = checkpoint.error {
                println!("      {}", error);
            }
        }
    }
    println!();

    Ok(ExitCode::SUCCESS)
}

async fn phases(project: PathBuf) -> Result<ExitCode> {
    let layout = open_project(&project)?;
    let (_, policies) = load_policies(&layout).await?;

    println!();
    println!(
        "  {:<12} {:>8} {:>6} {:>9}  {:<36} {}",
        "phase", "timeout", "turns", "retention", "artifact", "validation"
    );
    for policy in policies.iter() {
        let validation = policy
            .evidence
            .validation
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<12} {:>7}s {:>6} {:>9}  {:<36} {}",
            policy.kind.as_str(),
            policy.timeout_seconds,
            policy.max_turns,
            policy.retention_budget,
            policy.evidence.artifact.to_string(),
            validation
        );
    }
    println!();

    Ok(ExitCode::SUCCESS)
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}
