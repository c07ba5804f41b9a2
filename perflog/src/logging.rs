use tracing_subscriber::EnvFilter;

/// Install a stderr subscriber for the `tracing` macros.  The level comes from $PERF_LOG if set
/// (any `EnvFilter` directive works), otherwise `default_level`.  Calling this more than once is
/// harmless; only the first call installs anything.
///
/// Agents write their stderr to per-node log files, so there is no file sink here.

pub fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_env("PERF_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
