// Running the jobs of a job file, one after the other, with the agents recording them.
//
// A run gets its own directory:
//
//   <output_dir>/run_YYYY_MM_DD_HHMMSS/
//     metrics/<case>/TimeSeries/...      what the agents wrote, compacted after the case
//     metrics/<case>/Events/walltime.csv milestones recovered from the workload's log
//     logs/<case>_solver.log             the workload's stdout and stderr
//     logs/agent_{host,device}_<node>.log
//     report/summary.csv
//
// Each case (a job, or one iteration of a looping job) runs as: create the time-series directory
// on the job's nodes, start the agents, wait for them to come up, run the workload here and wait
// for it, stop the agents, wait for the files to settle (they may be on NFS), compact, reconcile.
// A case that fails is logged, its agents are stopped, and the run moves on.  Whatever happens,
// the run ends by stopping the agents on every node it touched.
//
// The workload is assumed to fan out to the job's nodes by itself (mpirun or similar); only the
// agents are started remotely.

use anyhow::{bail, Result};
use perflog::{
    aggregate_tree, now, run_dir_name, shell_quote, write_summary, AgentParams, CancelToken,
    EventReconciler, Executor, GlobalConfig, JobConfig, JobOutcome, LifecycleController, PerfError,
    Reporter, DEFAULT_TOLERANCE_MS,
};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Where one case's files go inside a run directory.

pub struct CasePaths {
    pub timeseries_root: PathBuf,
    pub events_file: PathBuf,
    pub solver_log: PathBuf,
}

impl CasePaths {
    pub fn new(run_dir: &Path, case: &str) -> CasePaths {
        let metrics = run_dir.join("metrics").join(case);
        CasePaths {
            timeseries_root: metrics.join("TimeSeries"),
            events_file: metrics.join("Events").join("walltime.csv"),
            solver_log: run_dir.join("logs").join(format!("{case}_solver.log")),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RunResult {
    pub summary: PathBuf,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct Orchestrator {
    global: GlobalConfig,
    lifecycle: LifecycleController,
    reconciler: EventReconciler,
    reporter: Reporter,
    token: CancelToken,
    run_dir: PathBuf,
    involved: BTreeSet<String>,
}

impl Orchestrator {
    /// Create the run directory under the configured output directory.

    pub fn new(
        global: GlobalConfig,
        lifecycle: LifecycleController,
        token: CancelToken,
    ) -> Result<Orchestrator> {
        let run_dir = global.output_dir.join(run_dir_name(&now()));
        for sub in ["metrics", "logs", "report"] {
            fs::create_dir_all(run_dir.join(sub))?;
        }
        info!("Run directory {}", run_dir.display());
        Ok(Orchestrator {
            global,
            lifecycle,
            reconciler: EventReconciler::new()?,
            reporter: Reporter::new()?,
            token,
            run_dir,
            involved: BTreeSet::new(),
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Run every job and write the summary.  Jobs that could not be decoded are reported and
    /// skipped.  Only a failure to write the summary is an error; the final stop runs regardless.

    pub fn run(&mut self, jobs: &[Result<JobConfig, PerfError>]) -> Result<RunResult> {
        let mut result = RunResult {
            summary: self.run_dir.join("report").join("summary.csv"),
            ..Default::default()
        };
        let mut rows = vec![];

        'jobs: for job in jobs {
            let job = match job {
                Ok(job) => job,
                Err(e) => {
                    error!("Skipping job: {e}");
                    result.skipped += 1;
                    continue;
                }
            };
            self.involved.extend(job.nodes.iter().cloned());
            for case in job.case_names() {
                if self.token.is_cancelled() {
                    warn!("Interrupted, remaining jobs are skipped");
                    break 'jobs;
                }
                info!(case = case.as_str(), nodes = ?job.nodes, "Running case");
                match self.run_case(job, &case) {
                    Ok(outcome) => {
                        rows.extend(self.reporter.summarize_job(&outcome));
                        result.completed += 1;
                    }
                    Err(e) => {
                        error!(case = case.as_str(), "Case failed: {e}");
                        self.lifecycle.stop(&job.nodes);
                        result.failed += 1;
                    }
                }
                if job.clean_results {
                    self.lifecycle.remove_paths(&job.nodes, &job.result_paths);
                }
            }
        }

        let written = write_summary(&result.summary, &mut rows);
        self.final_stop();
        written?;
        info!(
            completed = result.completed,
            failed = result.failed,
            skipped = result.skipped,
            "Summary in {}",
            result.summary.display()
        );
        Ok(result)
    }

    fn run_case(&self, job: &JobConfig, case: &str) -> Result<JobOutcome> {
        let paths = CasePaths::new(&self.run_dir, case);

        let failed = self.lifecycle.ensure_dirs(&job.nodes, &paths.timeseries_root);
        if !failed.is_empty() {
            warn!(case, "No metric directory on {failed:?}, those nodes will record nothing");
        }
        let params = AgentParams {
            timeseries_root: paths.timeseries_root.clone(),
            log_dir: self.run_dir.join("logs"),
            agent_dir: self.global.agent_dir.clone(),
        };
        self.lifecycle.start(&job.nodes, &job.target, job.interval, &params);
        self.wait(Duration::from_secs(self.global.start_delay_secs));

        let started = Instant::now();
        let command = format!(
            "({}) > {} 2>&1",
            job.launch,
            shell_quote(&paths.solver_log.to_string_lossy())
        );
        let code = self.lifecycle.executor().run("localhost", &command, None, &[]);
        if code != 0 {
            warn!(case, code, "Workload exited with non-zero code");
        }
        info!(case, elapsed = ?started.elapsed(), "Workload finished");

        self.lifecycle.stop(&job.nodes);
        self.wait(Duration::from_secs(self.global.settle_secs));

        if paths.timeseries_root.is_dir() {
            aggregate_tree(&paths.timeseries_root, DEFAULT_TOLERANCE_MS)?;
        } else {
            warn!(case, "No metrics were recorded");
        }

        let log = self.reconciler.parse_file(&paths.solver_log)?;
        let timing = self.reconciler.timing(&log);
        log.write_csv(&paths.events_file)?;

        Ok(JobOutcome {
            job: case.to_string(),
            description: job.description.clone(),
            gpus_per_proc: job.gpus_per_proc,
            timeseries_root: paths.timeseries_root,
            log,
            timing,
        })
    }

    // Sleep, but not past a cancellation.
    fn wait(&self, d: Duration) {
        let until = Instant::now() + d;
        while !self.token.is_cancelled() {
            let left = until.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            thread::sleep(left.min(Duration::from_millis(100)));
        }
    }

    fn final_stop(&self) {
        let mut nodes = self.involved.iter().cloned().collect::<Vec<String>>();
        if nodes.is_empty() {
            nodes.push("localhost".to_string());
        }
        let failed = self
            .lifecycle
            .stop(&nodes)
            .into_iter()
            .filter(|o| !o.ok())
            .count();
        if failed > 0 {
            warn!("Final stop failed on {failed} node(s), agents may still be running");
        }
    }
}

/// Rebuild `report/summary.csv` of an existing run from its compacted metrics and workload logs.
/// Description and GPU count come from the job whose case names include the directory name, when
/// `jobs` has one.

pub fn rebuild_summary(run_dir: &Path, jobs: &[JobConfig]) -> Result<PathBuf> {
    let metrics = run_dir.join("metrics");
    if !metrics.is_dir() {
        bail!("No metrics directory in {}", run_dir.display());
    }
    let reconciler = EventReconciler::new()?;
    let reporter = Reporter::new()?;

    let mut cases = fs::read_dir(&metrics)?
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
        .collect::<Vec<String>>();
    cases.sort();

    let mut rows = vec![];
    for case in cases {
        let paths = CasePaths::new(run_dir, &case);
        let job = jobs.iter().find(|j| j.case_names().contains(&case));
        let log = match reconciler.parse_file(&paths.solver_log) {
            Ok(log) => log,
            Err(e) => {
                warn!("Reading {}: {e}", paths.solver_log.display());
                Default::default()
            }
        };
        let timing = reconciler.timing(&log);
        rows.extend(reporter.summarize_job(&JobOutcome {
            job: case.clone(),
            description: job.map(|j| j.description.clone()).unwrap_or_default(),
            gpus_per_proc: job.map_or(0, |j| j.gpus_per_proc),
            timeseries_root: paths.timeseries_root,
            log,
            timing,
        }));
    }

    let summary = run_dir.join("report").join("summary.csv");
    write_summary(&summary, &mut rows)?;
    Ok(summary)
}

#[cfg(test)]
use perflog::{NodeProcessController, ShellExecutor, SignalKind};
#[cfg(test)]
use std::sync::{Arc, Mutex};

// Runs blocking commands for real but only records agent starts.
#[cfg(test)]
struct NoAgents {
    shell: ShellExecutor,
    detached: Mutex<Vec<String>>,
}

#[cfg(test)]
impl Executor for NoAgents {
    fn is_local(&self, node: &str) -> bool {
        node == "localhost"
    }

    fn run(

        &self,

        node: &str,

        command: &str,

        timeout: Option<Duration>,

        ignore_codes: &[i32],

    ) -> i32 {
        if node == "localhost" {
            self.shell.run(node, command, timeout, ignore_codes)
        } else {
            0
        }
    }

    fn run_detached(&self, node: &str, command: &str, _log_file: &Path) {
        self.detached.lock().unwrap().push(format!("{node}: {command}"));
    }
}

#[cfg(test)]
struct NoProcesses;

#[cfg(test)]
impl NodeProcessController for NoProcesses {
    fn list_matching(&self, _pattern: &str, _exclude_pid: Option<u32>) -> Vec<u32> {
        vec![]
    }

    fn signal(&self, _pids: &[u32], _kind: SignalKind) -> usize {
        0
    }
}

#[cfg(test)]
fn test_orchestrator(out: &Path, token: CancelToken) -> (Orchestrator, Arc<NoAgents>) {
    let exec = Arc::new(NoAgents {
        shell: ShellExecutor::new(false),
        detached: Mutex::new(vec![]),
    });
    let lifecycle = LifecycleController::new(exec.clone())
        .with_local_controller(Box::new(NoProcesses))
        .with_grace(Duration::ZERO);
    let global = GlobalConfig {
        output_dir: out.to_path_buf(),
        agent_dir: PathBuf::from("/opt/perf/bin"),
        settle_secs: 0,
        start_delay_secs: 0,
        ..Default::default()
    };
    (Orchestrator::new(global, lifecycle, token).unwrap(), exec)
}

// A workload that leaves raw metrics for pid 4242 where the agents would, and prints milestones.
#[cfg(test)]
fn fake_workload(run_dir: &Path, case: &str) -> String {
    let subject = CasePaths::new(run_dir, case)
        .timeseries_root
        .join("localhost/localhost-PID4242");
    let subject = subject.display();
    format!(
        "mkdir -p {subject} && \
         printf 'Timestamp,Value\\n2024-03-01 10:00:00,50.0\\n' > {subject}/proc_cpu_util.csv && \
         printf 'Timestamp,Value\\n2024-03-01 10:00:00,2048\\n' > {subject}/proc_mem_rss.csv && \
         echo 'This is the MPI rank 0, PID: 4242 [Wall time: 1.0]' && \
         echo 'Initial field file reading completed [Wall time: 3.0, Rank: 0]' && \
         echo 'Create new monitor layer [Wall time: 4.0]' && \
         echo 'stopping the solver [Wall time: 10.5, Rank: 0]'"
    )
}

#[cfg(test)]
fn job(case: &str, launch: &str) -> JobConfig {
    JobConfig {
        case_name: case.to_string(),
        launch: launch.to_string(),
        nodes: vec!["localhost".to_string()],
        target: "solverX".to_string(),
        loop_count: 1,
        interval: 0.5,
        gpus_per_proc: 0,
        description: "one node".to_string(),
        clean_results: false,
        result_paths: vec![],
    }
}

#[test]
fn test_run_end_to_end() {
    let out = tempfile::tempdir().unwrap();
    let (mut orch, exec) = test_orchestrator(out.path(), CancelToken::new());
    let run_dir = orch.run_dir().to_path_buf();
    let scratch = out.path().join("scratch");
    fs::create_dir_all(&scratch).unwrap();

    let mut good = job("case1", &fake_workload(&run_dir, "case1"));
    good.clean_results = true;
    good.result_paths = vec![scratch.to_string_lossy().to_string()];
    let jobs = vec![
        Err(PerfError::config("broken", "field 'launch' must be present")),
        Ok(good.clone()),
        Ok(job("case2", "exit 3")),
    ];
    let result = orch.run(&jobs).unwrap();
    assert!(result.completed == 2 && result.failed == 0 && result.skipped == 1);

    let summary = fs::read_to_string(&result.summary).unwrap();
    let lines = summary.lines().collect::<Vec<&str>>();
    assert!(lines.len() == 2);
    assert!(lines[0].starts_with("pid,node,job,gpus,description,rank,"));
    assert!(lines[1] == "PID4242,localhost,case1,0,one node,0,2,50.0,[],[],2.0000,6.5000");

    // Raw files are compacted away, the milestones persisted, the result path cleaned.
    let subject = CasePaths::new(&run_dir, "case1")
        .timeseries_root
        .join("localhost/localhost-PID4242");
    assert!(subject.join("localhost_PID4242_metrics.csv").exists());
    assert!(!subject.join("proc_cpu_util.csv").exists());
    let events = fs::read_to_string(CasePaths::new(&run_dir, "case1").events_file).unwrap();
    assert!(events.starts_with("WallTime_s,Rank,Event\n"));
    assert!(!scratch.exists());

    // Two agents per case.
    let detached = exec.detached.lock().unwrap().clone();
    assert!(detached.len() == 4);
    assert!(detached[0].starts_with("localhost: /opt/perf/bin/perf_host_agent --timeseries-root "));
    assert!(detached[0].ends_with("--target-name solverX --interval 0.5"));

    // The summary can be rebuilt from what the run left behind.
    fs::remove_file(&result.summary).unwrap();
    let rebuilt = rebuild_summary(&run_dir, &[good]).unwrap();
    assert!(fs::read_to_string(rebuilt).unwrap() == summary);
}

#[test]
fn test_loop_case_names() {
    let out = tempfile::tempdir().unwrap();
    let (mut orch, _exec) = test_orchestrator(out.path(), CancelToken::new());
    let mut looping = job("case1", "true");
    looping.loop_count = 2;
    let result = orch.run(&[Ok(looping)]).unwrap();
    assert!(result.completed == 2);
    assert!(orch.run_dir().join("metrics/case1_1/Events/walltime.csv").exists());
    assert!(orch.run_dir().join("metrics/case1_2/Events/walltime.csv").exists());
}

#[test]
fn test_cancelled_run_skips_jobs() {
    let out = tempfile::tempdir().unwrap();
    let token = CancelToken::new();
    token.cancel();
    let (mut orch, exec) = test_orchestrator(out.path(), token);
    let result = orch.run(&[Ok(job("case1", "true"))]).unwrap();
    assert!(result.completed == 0);
    assert!(exec.detached.lock().unwrap().is_empty());
    // The summary still exists, with only its header.
    assert!(fs::read_to_string(&result.summary).unwrap().lines().count() == 1);
}

#[test]
fn test_rebuild_needs_metrics() {
    let dir = tempfile::tempdir().unwrap();
    assert!(rebuild_summary(dir.path(), &[]).is_err());
}
