// Starting and stopping the sampling agents on a set of nodes.
//
// There is no registry of running agents.  Agents are found by name: stopping a node means sending
// SIGINT to every process whose command line matches one of AGENT_PATTERNS, waiting a grace period
// for them to drain their writers, and then sending SIGKILL to whatever is left.  This makes stop
// idempotent and lets it clean up agents left behind by an earlier, crashed run.
//
// On this machine the work is done in-process through a `NodeProcessController`, which must not
// signal the controller itself.  On other nodes it is one shell command over ssh; the patterns are
// written as `[p]erf_host_agent` so that the remote shell running pkill does not match itself.
//
// Failures on one node are logged and reported and never stop the work on the other nodes.

use crate::errors::PerfError;
use crate::procfs::ProcFs;
use crate::remote::{shell_quote, Executor};

use itertools::Itertools;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Substrings of the agents' command lines.

pub const AGENT_PATTERNS: &[&str] = &["perf_host_agent", "perf_device_agent"];

/// Exit codes of a stop that still count as success: 1 is "nothing matched", 255 is an ssh
/// transport error racing with the kill, 137 and -9 are "killed".

pub const BENIGN_EXIT_CODES: &[i32] = &[1, 137, -9, 255];

const GRACE: Duration = Duration::from_secs(1);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalKind {
    Interrupt,
    Kill,
}

/// Finding and signalling processes on one node.

pub trait NodeProcessController: Send + Sync {
    /// Pids whose command line contains `pattern`, other than `exclude_pid`.
    fn list_matching(&self, pattern: &str, exclude_pid: Option<u32>) -> Vec<u32>;

    /// Signal the pids, returning how many were signalled.  A pid that is already gone is not an
    /// error.
    fn signal(&self, pids: &[u32], kind: SignalKind) -> usize;
}

#[derive(Default)]
pub struct LocalProcessController {
    procfs: ProcFs,
}

impl LocalProcessController {
    pub fn new(procfs: ProcFs) -> LocalProcessController {
        LocalProcessController { procfs }
    }
}

impl NodeProcessController for LocalProcessController {
    fn list_matching(&self, pattern: &str, exclude_pid: Option<u32>) -> Vec<u32> {
        let Ok(pids) = self.procfs.pids() else {
            return vec![];
        };
        pids.into_iter()
            .filter(|pid| Some(*pid) != exclude_pid)
            .filter(|pid| {
                self.procfs
                    .cmdline(*pid)
                    .is_ok_and(|args| args.join(" ").contains(pattern))
            })
            .collect()
    }

    fn signal(&self, pids: &[u32], kind: SignalKind) -> usize {
        let sig = match kind {
            SignalKind::Interrupt => Signal::SIGINT,
            SignalKind::Kill => Signal::SIGKILL,
        };
        let mut n = 0;
        for pid in pids {
            match kill(Pid::from_raw(*pid as i32), sig) {
                Ok(()) => n += 1,
                Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => warn!("kill {pid} {sig}: {e}"),
            }
        }
        n
    }
}

/// The remote stop command: interrupt, wait `grace`, kill.

pub fn remote_stop_command(grace: Duration) -> String {
    let patterns = AGENT_PATTERNS
        .iter()
        .map(|p| {
            let mut chars = p.chars();
            match chars.next() {
                Some(first) => format!("[{first}]{}", chars.as_str()),
                None => String::new(),
            }
        })
        .join("|");
    format!(
        "pkill -INT -f '{patterns}'; sleep {}; pkill -KILL -f '{patterns}'",
        grace.as_secs_f64()
    )
}

/// Where the agents write and log, and where their binaries are.

#[derive(Clone, Debug)]
pub struct AgentParams {
    pub timeseries_root: PathBuf,
    pub log_dir: PathBuf,
    pub agent_dir: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StopOutcome {
    pub node: String,
    pub code: i32,
}

impl StopOutcome {
    pub fn ok(&self) -> bool {
        self.code == 0
    }

    /// The failure, if the stop command did not succeed.

    pub fn error(&self) -> Option<PerfError> {
        (!self.ok()).then(|| PerfError::RemoteCommand {
            node: self.node.clone(),
            code: self.code,
        })
    }
}

pub struct LifecycleController {
    executor: Arc<dyn Executor>,
    local: Box<dyn NodeProcessController>,
    own_pid: u32,
    grace: Duration,
}

impl LifecycleController {
    pub fn new(executor: Arc<dyn Executor>) -> LifecycleController {
        LifecycleController {
            executor,
            local: Box::new(LocalProcessController::default()),
            own_pid: std::process::id(),
            grace: GRACE,
        }
    }

    pub fn with_local_controller(
        mut self,
        local: Box<dyn NodeProcessController>,
    ) -> LifecycleController {
        self.local = local;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> LifecycleController {
        self.grace = grace;
        self
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    /// Stop the agents on every node.  Never fails; the outcome for each node is returned and
    /// non-benign failures have been logged.

    pub fn stop(&self, nodes: &[String]) -> Vec<StopOutcome> {
        nodes
            .iter()
            .unique()
            .map(|node| {
                let code = if self.executor.is_local(node) {
                    self.stop_local()
                } else {
                    self.executor.run(
                        node,
                        &remote_stop_command(self.grace),
                        Some(CONTROL_TIMEOUT),
                        BENIGN_EXIT_CODES,
                    )
                };
                let outcome = StopOutcome {
                    node: node.clone(),
                    code,
                };
                if let Some(e) = outcome.error() {
                    warn!("Stopping agents: {e}");
                }
                outcome
            })
            .collect()
    }

    fn matching_agents(&self) -> Vec<u32> {
        AGENT_PATTERNS
            .iter()
            .flat_map(|p| self.local.list_matching(p, Some(self.own_pid)))
            .sorted()
            .dedup()
            .collect()
    }

    fn stop_local(&self) -> i32 {
        if self.executor.dry_run() {
            info!("[dry-run] stop local agents");
            return 0;
        }
        let pids = self.matching_agents();
        if pids.is_empty() {
            return 0;
        }
        debug!("Interrupting local agents {pids:?}");
        self.local.signal(&pids, SignalKind::Interrupt);
        thread::sleep(self.grace);
        let survivors = self.matching_agents();
        if !survivors.is_empty() {
            warn!("Killing local agents {survivors:?} that ignored SIGINT");
            self.local.signal(&survivors, SignalKind::Kill);
        }
        0
    }

    /// Stop stale agents on each node, then start a host and a device agent there.

    pub fn start(&self, nodes: &[String], target: &str, interval: f64, params: &AgentParams) {
        for node in nodes.iter().unique() {
            self.stop(std::slice::from_ref(node));
            for (agent, kind) in [("perf_host_agent", "host"), ("perf_device_agent", "device")] {
                let command = format!(
                    "{} --timeseries-root {} --target-name {} --interval {interval}",
                    shell_quote(&params.agent_dir.join(agent).to_string_lossy()),
                    shell_quote(&params.timeseries_root.to_string_lossy()),
                    shell_quote(target),
                );
                let log = params.log_dir.join(format!("agent_{kind}_{node}.log"));
                self.executor.run_detached(node, &command, &log);
            }
            info!(node = node.as_str(), target, "Started agents");
        }
    }

    /// Create `path` on every node.  Returns the nodes where that failed.

    pub fn ensure_dirs(&self, nodes: &[String], path: &Path) -> Vec<String> {
        let mut failed = vec![];
        for node in nodes.iter().unique() {
            let ok = if self.executor.is_local(node) && !self.executor.dry_run() {
                match fs::create_dir_all(path) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Creating {}: {e}", path.display());
                        false
                    }
                }
            } else {
                let command = format!("mkdir -p {}", shell_quote(&path.to_string_lossy()));
                self.executor.run(node, &command, Some(CONTROL_TIMEOUT), &[]) == 0
            };
            if !ok {
                failed.push(node.clone());
            }
        }
        failed
    }

    /// Remove `paths` recursively on every node.

    pub fn remove_paths(&self, nodes: &[String], paths: &[String]) {
        if paths.is_empty() {
            return;
        }
        let command = format!(
            "rm -rf {}",
            paths.iter().map(|p| shell_quote(p)).join(" ")
        );
        for node in nodes.iter().unique() {
            self.executor.run(node, &command, Some(CONTROL_TIMEOUT), &[]);
        }
    }
}

#[cfg(test)]
use std::sync::Mutex;

#[cfg(test)]
#[derive(Default)]
struct RecordingExecutor {
    calls: Mutex<Vec<String>>,
    code: i32,
}

#[cfg(test)]
impl Executor for RecordingExecutor {
    fn is_local(&self, node: &str) -> bool {
        node == "localhost"
    }

    fn run(

        &self,

        node: &str,

        command: &str,

        _timeout: Option<Duration>,

        ignore_codes: &[i32],

    ) -> i32 {
        self.calls.lock().unwrap().push(format!("run {node}: {command}"));
        if ignore_codes.contains(&self.code) {
            0
        } else {
            self.code
        }
    }

    fn run_detached(&self, node: &str, command: &str, log_file: &Path) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("detach {node}: {command} > {}", log_file.display()));
    }
}

#[cfg(test)]
#[derive(Default)]
struct FakeProcesses {
    // (pid, cmdline, survives SIGINT)
    procs: Mutex<Vec<(u32, String, bool)>>,
    signals: Mutex<Vec<(u32, SignalKind)>>,
}

#[cfg(test)]
impl NodeProcessController for Arc<FakeProcesses> {
    fn list_matching(&self, pattern: &str, exclude_pid: Option<u32>) -> Vec<u32> {
        self.procs
            .lock()
            .unwrap()
            .iter()
            .filter(|(pid, cmd, _)| Some(*pid) != exclude_pid && cmd.contains(pattern))
            .map(|(pid, _, _)| *pid)
            .collect()
    }

    fn signal(&self, pids: &[u32], kind: SignalKind) -> usize {
        let mut procs = self.procs.lock().unwrap();
        for pid in pids {
            self.signals.lock().unwrap().push((*pid, kind));
            procs.retain(|(p, _, stubborn)| {
                p != pid || (kind == SignalKind::Interrupt && *stubborn)
            });
        }
        pids.len()
    }
}

#[test]
fn test_remote_stop_command() {
    let cmd = remote_stop_command(Duration::from_secs(1));
    assert!(cmd
        == "pkill -INT -f '[p]erf_host_agent|[p]erf_device_agent'; sleep 1; \
            pkill -KILL -f '[p]erf_host_agent|[p]erf_device_agent'");
}

#[test]
fn test_stop_is_idempotent() {
    let exec = Arc::new(RecordingExecutor {
        code: 1,
        ..Default::default()
    });
    let fake = Arc::new(FakeProcesses::default());
    let lc = LifecycleController::new(exec.clone())
        .with_local_controller(Box::new(fake.clone()))
        .with_grace(Duration::ZERO);
    let nodes = vec!["localhost".to_string(), "n2".to_string(), "n2".to_string()];
    for _ in 0..2 {
        let outcomes = lc.stop(&nodes);
        assert!(outcomes.len() == 2);
        assert!(outcomes.iter().all(|o| o.ok()));
    }
    // One remote command per stop, none for the local node, no signals sent.
    assert!(exec.calls.lock().unwrap().len() == 2);
    assert!(fake.signals.lock().unwrap().is_empty());
}

#[test]
fn test_stop_reports_real_failures() {
    let exec = Arc::new(RecordingExecutor {
        code: 2,
        ..Default::default()
    });
    let lc = LifecycleController::new(exec).with_grace(Duration::ZERO);
    let outcomes = lc.stop(&["n1".to_string(), "n2".to_string()]);
    assert!(
        outcomes
            == vec![
                StopOutcome { node: "n1".to_string(), code: 2 },
                StopOutcome { node: "n2".to_string(), code: 2 }
            ]
    );
    assert!(matches!(
        outcomes[0].error(),
        Some(PerfError::RemoteCommand { ref node, code: 2 }) if node == "n1"
    ));
}

#[test]
fn test_local_stop_escalates() {
    let exec = Arc::new(RecordingExecutor::default());
    let fake = Arc::new(FakeProcesses::default());
    {
        let mut procs = fake.procs.lock().unwrap();
        procs.push((10, "/opt/bin/perf_host_agent --interval 1".to_string(), false));
        procs.push((11, "/opt/bin/perf_device_agent --interval 1".to_string(), true));
        procs.push((12, "/opt/solverX/bin/solve".to_string(), false));
        procs.push((13, "perfrun stop --kill perf_host_agent".to_string(), false));
    }
    let lc = LifecycleController::new(exec)
        .with_local_controller(Box::new(fake.clone()))
        .with_grace(Duration::ZERO);
    let lc = LifecycleController { own_pid: 13, ..lc };
    assert!(lc.stop(&["localhost".to_string()])[0].ok());
    let signals = fake.signals.lock().unwrap().clone();
    assert!(
        signals
            == vec![
                (10, SignalKind::Interrupt),
                (11, SignalKind::Interrupt),
                (11, SignalKind::Kill)
            ]
    );
    let left = fake.procs.lock().unwrap().iter().map(|p| p.0).collect::<Vec<u32>>();
    assert!(left == vec![12, 13]);
}

#[test]
fn test_start_launches_both_agents() {
    let exec = Arc::new(RecordingExecutor {
        code: 1,
        ..Default::default()
    });
    let lc = LifecycleController::new(exec.clone()).with_grace(Duration::ZERO);
    let params = AgentParams {
        timeseries_root: PathBuf::from("/runs/r1/metrics/case1/TimeSeries"),
        log_dir: PathBuf::from("/runs/r1/logs"),
        agent_dir: PathBuf::from("/opt/perf/bin"),
    };
    lc.start(&["n1".to_string(), "n1".to_string()], "solverX", 0.5, &params);
    let calls = exec.calls.lock().unwrap().clone();
    assert!(calls.len() == 3);
    assert!(calls[0].starts_with("run n1: pkill -INT"));
    assert!(
        calls[1]
            == "detach n1: /opt/perf/bin/perf_host_agent --timeseries-root \
                /runs/r1/metrics/case1/TimeSeries --target-name solverX --interval 0.5 \
                > /runs/r1/logs/agent_host_n1.log"
    );
    assert!(calls[2].starts_with("detach n1: /opt/perf/bin/perf_device_agent "));
    assert!(calls[2].ends_with("> /runs/r1/logs/agent_device_n1.log"));
}

#[test]
fn test_ensure_dirs_and_remove() {
    let dir = tempfile::tempdir().unwrap();
    let exec = Arc::new(RecordingExecutor::default());
    let lc = LifecycleController::new(exec.clone());
    let target = dir.path().join("a/b");
    let failed = lc.ensure_dirs(&["localhost".to_string(), "n2".to_string()], &target);
    assert!(failed.is_empty());
    assert!(target.is_dir());
    lc.remove_paths(&["n2".to_string()], &["/scratch/out dir".to_string()]);
    let calls = exec.calls.lock().unwrap().clone();
    assert!(calls[0] == format!("run n2: mkdir -p {}", target.display()));
    assert!(calls[1] == "run n2: rm -rf '/scratch/out dir'");
}
