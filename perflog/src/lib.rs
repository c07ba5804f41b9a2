// This library holds the data path of the cluster performance monitor.
//
// Per-node sampling agents (see the `perfagent` crate) use the samplers, the process matcher and
// the durable writer to record metric streams as CSV files in a tree:
//
//   <root>/<node>/<node>-PID<pid>/<metric-kind>.csv     per-process metrics
//   <root>/<node>/<node-wide-metric>.csv                 node-wide metrics
//
// The orchestrator (see the `perfrun` crate) uses the lifecycle controller to start and stop those
// agents across a set of nodes, then the aggregator to compact each process's files into one
// time-aligned table, the event reconciler to recover per-rank timing from the workload's log, and
// the reporter to join the two into the summary.
//
// There is no control plane.  Agents are found and stopped by process name, targets are found by
// command line, and ranks are recovered from free text.  See the individual modules for the
// heuristics and their limits.

mod aggregate;
mod cancel;
mod columns;
mod config;
mod dates;
mod errors;
mod events;
mod gpu;
mod lifecycle;
mod logging;
mod matcher;
mod netstat;
mod procfs;
mod remote;
mod report;
mod sample;
mod sampler;
mod writer;

// Timestamps are local wall-clock times; the metric files carry them as text at second resolution.

pub use dates::{format_precise, format_timestamp, now, parse_timestamp, run_dir_name, Timestamp};

pub use errors::PerfError;

pub use logging::init_logging;

pub use cancel::{cancel_on_signals, CancelToken};

// What a sampler emits, and where it goes in the tree.

pub use sample::{subject_dir_name, MetricKind, MetricSample, Subject};

// Queue-backed single-consumer writer with flush/fsync on close.

pub use writer::{DurableWriter, SampleSink, WriterStats};

// Process discovery and /proc access.

pub use matcher::{MatchPolicy, ProcessMatcher, LAUNCHER_BLACKLIST, SELF_NAMES};
pub use procfs::{clock_ticks_per_second, ProcFs};

// The samplers and the loop that drives them.

pub use gpu::{open_gpu_backend, GpuHandle, GpuProcess, GpuQuery, NoGpu};
pub use netstat::{counter_delta, NetworkMonitor};
pub use sampler::{
    cpu_utilization, hostname, lower_priority, DeviceSampler, HostSampler, SampleLoop,
};

// Deploying and stopping agents across nodes.

pub use lifecycle::{
    remote_stop_command, AgentParams, LifecycleController, LocalProcessController,
    NodeProcessController, SignalKind, StopOutcome, AGENT_PATTERNS, BENIGN_EXIT_CODES,
};
pub use remote::{shell_quote, Executor, ShellExecutor};

// Compacting a process's raw files into one table.

pub use aggregate::{
    aggregate_tree, compact_subject, merge_sources, read_source, AggregateSummary, MergedTable,
    Source, AGGREGATE_SUFFIX, DEFAULT_TOLERANCE_MS,
};
pub use columns::{order_columns, source_column_name, ColumnKey};

// Recovering rank identity and phase timing from the workload's log.

pub use events::{
    EventLog, EventReconciler, Markers, Milestone, RankIdentity, TimingReport, TimingWindow,
};

// The final per-process summary.

pub use report::{find_aggregates, write_summary, JobOutcome, ProcessMetrics, Reporter, SummaryRow};

// The job file read by the orchestrator.

pub use config::{parse_run_config, read_run_config, GlobalConfig, JobConfig, RunConfig};
