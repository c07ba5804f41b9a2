// `perfrun` -- run workloads under the per-node sampling agents and summarize what they recorded.
//
// Run with --help for brief help.  The job file format is documented in perflog's config module.
//
// Subcommands:
//
//   run        execute a job file end to end, see pipeline.rs
//   stop       stop the agents on some nodes, for cleaning up after a crashed run
//   aggregate  compact a time-series tree by hand
//   reconcile  print the per-rank timing recovered from a workload log
//   report     rebuild the summary of an existing run directory
//
// Everything except `reconcile` prints nothing on success beyond the log on stderr.

mod pipeline;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use perflog::{
    aggregate_tree, cancel_on_signals, init_logging, read_run_config, CancelToken,
    EventReconciler, LifecycleController, ShellExecutor, DEFAULT_TOLERANCE_MS,
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the jobs of a job file with the agents recording them
    Run(RunArgs),

    /// Stop the agents on some nodes
    Stop(StopArgs),

    /// Compact the raw metric files of a time-series tree
    Aggregate(AggregateArgs),

    /// Print per-rank timing recovered from a workload log
    Reconcile(ReconcileArgs),

    /// Rebuild report/summary.csv for a run directory
    Report(ReportArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// The job file (JSON)
    #[arg(long, short)]
    config: PathBuf,

    /// Create the run directory here [default: the job file's output_dir]
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Log the commands instead of running them
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Args, Debug)]
pub struct StopArgs {
    /// Nodes to stop agents on, comma-separated or repeated [default: localhost]
    #[arg(long, value_delimiter = ',')]
    nodes: Vec<String>,

    /// Log the commands instead of running them
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Args, Debug)]
pub struct AggregateArgs {
    /// The time-series root, containing one directory per node
    #[arg(long)]
    root: PathBuf,

    /// How far apart, in milliseconds, device and host samples may be and still be joined
    #[arg(long, default_value_t = DEFAULT_TOLERANCE_MS)]
    tolerance_ms: i64,
}

#[derive(Args, Debug)]
pub struct ReconcileArgs {
    /// The workload's log
    #[arg(long)]
    log: PathBuf,

    /// Also write the recovered milestones here as CSV
    #[arg(long)]
    events_out: Option<PathBuf>,

    /// Print JSON instead of a table
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
pub struct ReportArgs {
    /// The run directory, run_YYYY_MM_DD_HHMMSS
    #[arg(long)]
    run_dir: PathBuf,

    /// The job file the run was made from, for descriptions and GPU counts
    #[arg(long, short)]
    config: Option<PathBuf>,
}

fn main() {
    match perfrun() {
        Ok(()) => {}
        Err(msg) => {
            eprintln!("ERROR: {}", msg);
            process::exit(1);
        }
    }
}

fn perfrun() -> Result<()> {
    let cli = Cli::parse();
    init_logging("info");

    match cli.command {
        Commands::Run(ref args) => run(args),
        Commands::Stop(ref args) => stop(args),
        Commands::Aggregate(ref args) => {
            let summary = aggregate_tree(&args.root, args.tolerance_ms)?;
            if summary.failed > 0 {
                anyhow::bail!(
                    "{} of the subject directories could not be compacted",
                    summary.failed
                );
            }
            Ok(())
        }
        Commands::Reconcile(ref args) => reconcile(args),
        Commands::Report(ref args) => {
            let jobs = match args.config {
                Some(ref path) => read_run_config(path)?
                    .jobs
                    .into_iter()
                    .filter_map(|j| j.ok())
                    .collect(),
                None => vec![],
            };
            let summary = pipeline::rebuild_summary(&args.run_dir, &jobs)?;
            info!("Summary in {}", summary.display());
            Ok(())
        }
    }
}

fn run(args: &RunArgs) -> Result<()> {
    let mut config = read_run_config(&args.config)?;
    if let Some(ref dir) = args.output_dir {
        config.global.output_dir = dir.clone();
    }

    // The workload shares our terminal, so ^C reaches it too; we only need to survive long enough
    // to stop the agents.
    let token = CancelToken::new();
    cancel_on_signals(&token)?;

    let lifecycle = LifecycleController::new(Arc::new(ShellExecutor::new(args.dry_run)));
    let mut orchestrator = pipeline::Orchestrator::new(config.global, lifecycle, token)?;
    let result = orchestrator.run(&config.jobs)?;
    if result.failed > 0 || result.skipped > 0 {
        anyhow::bail!(
            "{} case(s) failed and {} job(s) were skipped, see {}",
            result.failed,
            result.skipped,
            orchestrator.run_dir().display()
        );
    }
    Ok(())
}

fn stop(args: &StopArgs) -> Result<()> {
    let nodes = if args.nodes.is_empty() {
        vec!["localhost".to_string()]
    } else {
        args.nodes.clone()
    };
    let lifecycle = LifecycleController::new(Arc::new(ShellExecutor::new(args.dry_run)));
    let failed = lifecycle
        .stop(&nodes)
        .iter()
        .filter_map(|o| o.error())
        .map(|e| e.to_string())
        .collect::<Vec<String>>();
    if !failed.is_empty() {
        anyhow::bail!("Could not stop agents: {}", failed.join("; "));
    }
    Ok(())
}

fn reconcile(args: &ReconcileArgs) -> Result<()> {
    let reconciler = EventReconciler::new()?;
    let log = reconciler.parse_file(&args.log)?;
    let timing = reconciler.timing(&log);
    if let Some(ref out) = args.events_out {
        log.write_csv(out)?;
    }

    if args.json {
        let ranks = timing
            .windows()
            .map(|(rank, w)| {
                serde_json::json!({
                    "rank": rank,
                    "pid": log.identity.pid_of(rank),
                    "init_duration": w.init_duration,
                    "solve_duration": w.solve_duration,
                })
            })
            .collect::<Vec<_>>();
        let doc = serde_json::json!({
            "global_init_end": timing.global_init_end,
            "global_solve_start": timing.global_solve_start,
            "ranks": ranks,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        println!("{:>6} {:>10} {:>12} {:>12}", "rank", "pid", "init(s)", "solve(s)");
        for (rank, w) in timing.windows() {
            let pid = log
                .identity
                .pid_of(rank)
                .map_or("-".to_string(), |p| p.to_string());
            println!(
                "{:>6} {:>10} {:>12.4} {:>12.4}",
                rank, pid, w.init_duration, w.solve_duration
            );
        }
    }
    Ok(())
}
