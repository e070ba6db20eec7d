//! CLI command definitions for evalset.
//!
//! Eval sets are described by a YAML file (see [`EvalSetFile`]); tasks are
//! instantiated through the builtin [`TaskRegistry`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use serde_json::json;
use tracing::{info, warn};

use crate::logstore::FileLogStore;
use crate::metrics::{export_metrics, init_metrics};
use crate::runner::{
    LimitKind, NoSandbox, SampleError, SampleOutput, SamplePipeline, SampleRequest, SampleUsage,
};
use crate::scheduler::{EvalSetFile, Scheduler};
use crate::task::{TaskDefinition, TaskRegistry};

/// Resumable eval-set scheduler.
#[derive(Parser)]
#[command(name = "evalset")]
#[command(about = "Plan, inspect and simulate resumable eval sets")]
#[command(version)]
#[command(
    long_about = "evalset runs every task of an eval set against every configured model, \
reusing samples already completed in the log directory.\n\nExample usage:\n  \
evalset plan eval-set.yaml\n  evalset simulate eval-set.yaml --transient-rate 0.2\n  \
evalset status ./logs"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Show the outstanding work of an eval set without running anything.
    Plan(PlanArgs),

    /// List task runs recorded in a log directory.
    Status(StatusArgs),

    /// Run an eval set against a simulated sample pipeline.
    #[command(alias = "sim")]
    Simulate(SimulateArgs),
}

/// Arguments for `evalset plan`.
#[derive(Parser, Debug)]
pub struct PlanArgs {
    /// Eval-set YAML file.
    pub file: PathBuf,

    /// Override the log directory of the eval-set file.
    #[arg(long, env = "EVALSET_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Output the plan as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `evalset status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Log directory to inspect.
    #[arg(default_value = "./logs")]
    pub log_dir: PathBuf,

    /// Output the run list as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `evalset simulate`.
#[derive(Parser, Debug)]
pub struct SimulateArgs {
    /// Eval-set YAML file.
    pub file: PathBuf,

    /// Override the log directory of the eval-set file.
    #[arg(long, env = "EVALSET_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Probability that a sample fails with a provider rate limit.
    #[arg(long, default_value = "0.05")]
    pub transient_rate: f64,

    /// Probability that a sample exceeds its token limit.
    #[arg(long, default_value = "0.0")]
    pub limit_rate: f64,

    /// Minimum simulated sample latency in milliseconds.
    #[arg(long, default_value = "50")]
    pub min_latency_ms: u64,

    /// Maximum simulated sample latency in milliseconds.
    #[arg(long, default_value = "500")]
    pub max_latency_ms: u64,

    /// Print the Prometheus metrics export after the run.
    #[arg(long)]
    pub metrics: bool,

    /// Output the outcome as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments without running any command.
///
/// Use with [`run_with_cli`] when logging must be set up from the parsed
/// arguments first.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse CLI arguments and run the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Plan(args) => run_plan_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
        Commands::Simulate(args) => run_simulate_command(args).await,
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

fn load_eval_set(
    path: &Path,
    log_dir: Option<PathBuf>,
) -> anyhow::Result<(EvalSetFile, Vec<TaskDefinition>)> {
    let mut file = EvalSetFile::load(path)?;
    if let Some(dir) = log_dir {
        file.config.log_dir = dir;
    }
    let tasks = file.instantiate(&TaskRegistry::with_builtins())?;
    info!(
        file = %path.display(),
        tasks = tasks.len(),
        models = file.config.models.len(),
        log_dir = %file.config.log_dir.display(),
        "Loaded eval set"
    );
    Ok((file, tasks))
}

fn build_scheduler(file: EvalSetFile, pipeline: Arc<dyn SamplePipeline>) -> Scheduler {
    let store = Arc::new(FileLogStore::new(&file.config.log_dir));
    Scheduler::new(file.config, store, pipeline, Arc::new(NoSandbox))
}

// ============================================================================
// Commands
// ============================================================================

async fn run_plan_command(args: PlanArgs) -> anyhow::Result<()> {
    let (file, tasks) = load_eval_set(&args.file, args.log_dir)?;
    let scheduler = build_scheduler(file, Arc::new(SimulatedPipeline::default()));
    let plans = scheduler.plan(&tasks).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plans)?);
        return Ok(());
    }

    let outstanding: usize = plans.iter().map(|p| p.outstanding).sum();
    println!("Eval set plan: {} task run(s), {} sample(s) outstanding", plans.len(), outstanding);
    for plan in &plans {
        match &plan.finalized {
            Some(header) => println!(
                "  {}/{}: finalized ({}), nothing to do",
                plan.task, plan.model, header.status
            ),
            None => println!(
                "  {}/{}: {} of {} to run, {} reusable  [{}]",
                plan.task,
                plan.model,
                plan.outstanding,
                plan.samples_total,
                plan.reusable,
                plan.location
            ),
        }
    }
    Ok(())
}

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let store = FileLogStore::new(&args.log_dir);
    let runs = store.scan().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!("No task runs found in {}", args.log_dir.display());
        return Ok(());
    }

    println!("{} task run(s) in {}", runs.len(), args.log_dir.display());
    for run in &runs {
        let name = run
            .signature
            .as_ref()
            .map(|s| s.run_id())
            .unwrap_or_else(|| run.path.display().to_string());
        let status = run
            .header
            .as_ref()
            .map_or_else(|| "in progress".to_string(), |h| h.status.to_string());
        let counts: Vec<String> = run
            .counts
            .iter()
            .map(|(state, count)| format!("{}={}", state, count))
            .collect();
        println!("  {}: {}  {}", name, status, counts.join(" "));
    }
    Ok(())
}

async fn run_simulate_command(args: SimulateArgs) -> anyhow::Result<()> {
    if !(0.0..=1.0).contains(&args.transient_rate) || !(0.0..=1.0).contains(&args.limit_rate) {
        anyhow::bail!("--transient-rate and --limit-rate must be between 0 and 1");
    }
    if args.min_latency_ms > args.max_latency_ms {
        anyhow::bail!("--min-latency-ms must not exceed --max-latency-ms");
    }

    init_metrics()?;
    let (file, tasks) = load_eval_set(&args.file, args.log_dir)?;
    let pipeline = SimulatedPipeline {
        transient_rate: args.transient_rate,
        limit_rate: args.limit_rate,
        latency_ms: (args.min_latency_ms, args.max_latency_ms),
    };
    let scheduler = build_scheduler(file, Arc::new(pipeline));

    let token = scheduler.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling eval set");
            token.cancel();
        }
    });

    let outcome = scheduler.run(&tasks).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print!("{}", outcome);
    }
    if args.metrics {
        println!();
        print!("{}", export_metrics());
    }

    if !outcome.success {
        anyhow::bail!("eval set did not succeed; re-run to resume");
    }
    Ok(())
}

// ============================================================================
// Simulated pipeline
// ============================================================================

/// Pipeline that sleeps for a random latency and fails at configured rates.
#[derive(Debug, Clone)]
struct SimulatedPipeline {
    transient_rate: f64,
    limit_rate: f64,
    latency_ms: (u64, u64),
}

impl Default for SimulatedPipeline {
    fn default() -> Self {
        Self {
            transient_rate: 0.0,
            limit_rate: 0.0,
            latency_ms: (50, 500),
        }
    }
}

#[async_trait]
impl SamplePipeline for SimulatedPipeline {
    async fn execute(&self, request: SampleRequest) -> Result<SampleOutput, SampleError> {
        let (latency, roll, tokens) = {
            use rand::RngExt;
            let mut rng = rand::rng();
            let (min, max) = self.latency_ms;
            (
                rng.random_range(min..=max),
                rng.random_range(0.0..1.0),
                rng.random_range(200..4000u64),
            )
        };
        let latency = Duration::from_millis(latency);

        tokio::select! {
            _ = tokio::time::sleep(latency) => {}
            _ = request.cancel.cancelled() => {
                return Err(SampleError::Transient("simulated sample interrupted".to_string()));
            }
        }

        if roll < self.transient_rate {
            return Err(SampleError::RateLimited(format!(
                "simulated 429 for {}",
                request.unit
            )));
        }
        if roll < self.transient_rate + self.limit_rate {
            return Err(SampleError::limit(
                LimitKind::Token,
                format!("simulated sample used more than {} tokens", tokens),
            ));
        }

        let score: f64 = if roll < 0.5 { 1.0 } else { 0.0 };
        Ok(SampleOutput::new(json!({
            "sample_id": request.unit.sample_id.as_str(),
            "epoch": request.unit.epoch,
            "score": score,
        }))
        .with_usage(SampleUsage {
            tokens,
            messages: 2,
            working_time: latency,
        }))
    }
}
