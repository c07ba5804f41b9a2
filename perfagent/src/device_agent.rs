// `perf_device_agent` -- sample per-GPU memory, utilization and power for the target's processes on
// this node, once per interval, until SIGINT or SIGTERM.
//
// With no GPU backend (built without the `nvml` feature, or NVML not loadable) the agent still runs
// and writes nothing, so that perfrun can treat all nodes alike.

use anyhow::Result;
use clap::Parser;
use perflog::{
    cancel_on_signals, hostname, init_logging, lower_priority, open_gpu_backend, CancelToken,
    DeviceSampler, DurableWriter, MatchPolicy, ProcFs, ProcessMatcher, SampleLoop,
};
use std::path::PathBuf;
use std::process;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Root of the metric tree for this job
    #[arg(long)]
    timeseries_root: PathBuf,

    /// Sample processes whose command line names this target
    #[arg(long)]
    target_name: String,

    /// Seconds between samples (at least 0.1)
    #[arg(long, default_value_t = 1.0)]
    interval: f64,
}

fn main() {
    match device_agent() {
        Ok(()) => {}
        Err(msg) => {
            eprintln!("ERROR: {}", msg);
            process::exit(1);
        }
    }
}

fn device_agent() -> Result<()> {
    let cli = Cli::parse();
    init_logging("info");

    let token = CancelToken::new();
    cancel_on_signals(&token)?;
    lower_priority();

    let node = hostname();
    let gpu = open_gpu_backend();
    let devices = gpu.device_count().unwrap_or(0);
    if devices == 0 {
        warn!("No GPUs visible, device agent will record nothing");
    }
    let matcher = ProcessMatcher::new(ProcFs::default(), MatchPolicy::new(&cli.target_name));
    let mut sampler = DeviceSampler::new(gpu, matcher);
    let writer = DurableWriter::new(&cli.timeseries_root, &node)?;
    let sampling = SampleLoop::new(cli.interval);
    info!(
        node = node.as_str(),
        target = cli.target_name.as_str(),
        interval = ?sampling.interval(),
        devices,
        "Device agent started"
    );

    let cycles = sampling.run(&token, |timestamp| {
        for sample in sampler.collect(timestamp) {
            writer.write(&sample);
        }
    });

    let stats = writer.close()?;
    info!(
        cycles,
        rows = stats.rows_written,
        dropped = stats.rows_dropped,
        files = stats.files,
        "Device agent stopped"
    );
    Ok(())
}
