// `perf_host_agent` -- sample system memory, network rates, and CPU and resident memory of the
// target's processes on this node, once per interval, until SIGINT or SIGTERM.
//
// Output goes to <timeseries-root>/<hostname>/...; see the perflog crate for the layout.  The agent
// is started and stopped by `perfrun`, and logs to stderr, which perfrun redirects to a file.

use anyhow::Result;
use clap::Parser;
use perflog::{
    cancel_on_signals, hostname, init_logging, lower_priority, CancelToken, DurableWriter,
    HostSampler, MatchPolicy, ProcFs, ProcessMatcher, SampleLoop,
};
use std::path::{Path, PathBuf};
use std::process;
use tracing::info;

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
    match host_agent() {
        Ok(()) => {}
        Err(msg) => {
            eprintln!("ERROR: {}", msg);
            process::exit(1);
        }
    }
}

fn host_agent() -> Result<()> {
    let cli = Cli::parse();
    init_logging("info");

    let token = CancelToken::new();
    cancel_on_signals(&token)?;
    lower_priority();

    let node = hostname();
    let matcher = ProcessMatcher::new(ProcFs::default(), MatchPolicy::new(&cli.target_name));
    let mut sampler = HostSampler::new(matcher, Path::new("/sys"));
    let writer = DurableWriter::new(&cli.timeseries_root, &node)?;
    let sampling = SampleLoop::new(cli.interval);
    info!(
        node = node.as_str(),
        target = cli.target_name.as_str(),
        interval = ?sampling.interval(),
        network = ?sampler.network_keys(),
        "Host agent started"
    );

    // Baseline for the rate counters.
    sampling.warm_up(&token);
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
        "Host agent stopped"
    );
    Ok(())
}
