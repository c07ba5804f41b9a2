// The two samplers and the loop that drives them.
//
// A sampler's `collect` takes one reading of everything it knows about and returns the rows; it
// never writes files.  A failed read of a metric, a process or a GPU drops that reading only.
// The agent binaries hand the rows to a `SampleSink`.
//
// The host sampler reads system memory, network rates, and CPU and resident memory for every target
// process.  CPU utilization needs two readings of the process's tick counter, so the first cycle in
// which a pid is seen reports 0%.
//
// The device sampler reads per-GPU utilization and power, then attributes them, together with each
// target process's device memory on that GPU, to one row per (pid, GPU).

use crate::cancel::CancelToken;
use crate::dates::{now, Timestamp};
use crate::errors::PerfError;
use crate::gpu::{GpuHandle, GpuQuery};
use crate::matcher::ProcessMatcher;
use crate::netstat::NetworkMonitor;
use crate::procfs::clock_ticks_per_second;
use crate::sample::{MetricKind, MetricSample, Subject};

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Percent of one core used between two readings of a process's utime+stime.

pub fn cpu_utilization(prev_ticks: u64, ticks: u64, elapsed_secs: f64, clk_tck: u64) -> f64 {
    if elapsed_secs <= 0.0 || clk_tck == 0 {
        return 0.0;
    }
    let cpu_secs = ticks.saturating_sub(prev_ticks) as f64 / clk_tck as f64;
    100.0 * cpu_secs / elapsed_secs
}

pub struct HostSampler {
    matcher: ProcessMatcher,
    network: NetworkMonitor,
    network_time: Instant,
    clk_tck: u64,
    prev_cpu: HashMap<u32, (u64, Instant)>,
}

impl HostSampler {
    /// `sys_root` is normally /sys; the /proc root comes with the matcher.

    pub fn new(matcher: ProcessMatcher, sys_root: &Path) -> HostSampler {
        HostSampler {
            matcher,
            network: NetworkMonitor::discover(sys_root),
            network_time: Instant::now(),
            clk_tck: clock_ticks_per_second(),
            prev_cpu: HashMap::new(),
        }
    }

    pub fn network_keys(&self) -> Vec<String> {
        self.network.keys().to_vec()
    }

    pub fn collect(&mut self, timestamp: Timestamp) -> Vec<MetricSample> {
        let mut rows = vec![];

        match self.matcher.procfs().used_memory_mib() {
            Ok(mib) => rows.push(MetricSample::new(
                timestamp,
                Subject::Node,
                MetricKind::SystemMemory,
                vec![mib],
            )),
            Err(e) => warn!("System memory: {e}"),
        }

        if !self.network.is_empty() {
            let t = Instant::now();
            let elapsed = t.duration_since(self.network_time).as_secs_f64();
            self.network_time = t;
            let rates = self.network.sample(elapsed);
            rows.push(MetricSample::new(
                timestamp,
                Subject::Node,
                MetricKind::Network(self.network.keys()),
                rates,
            ));
        }

        let pids = match self.matcher.targets() {
            Ok(pids) => pids,
            Err(e) => {
                warn!("Process scan: {e}");
                vec![]
            }
        };
        let mut seen = HashSet::new();
        for pid in pids {
            match self.process_rows(pid, timestamp) {
                Ok(mut r) => {
                    seen.insert(pid);
                    rows.append(&mut r);
                }
                Err(PerfError::ProcessVanished(_)) => {}
                Err(e) => debug!("Process {pid}: {e}"),
            }
        }
        self.prev_cpu.retain(|pid, _| seen.contains(pid));

        rows
    }

    fn process_rows(
        &mut self,
        pid: u32,
        timestamp: Timestamp,
    ) -> Result<Vec<MetricSample>, PerfError> {
        let procfs = self.matcher.procfs();
        let ticks = procfs.cpu_ticks(pid)?;
        let rss = procfs.rss_kib(pid)?;
        let t = Instant::now();
        let cpu = match self.prev_cpu.get(&pid) {
            Some((prev_ticks, prev_t)) => cpu_utilization(
                *prev_ticks,
                ticks,
                t.duration_since(*prev_t).as_secs_f64(),
                self.clk_tck,
            ),
            None => 0.0,
        };
        self.prev_cpu.insert(pid, (ticks, t));
        let subject = Subject::Pid(pid);
        Ok(vec![
            MetricSample::new(timestamp, subject, MetricKind::ProcCpuUtil, vec![cpu]),
            MetricSample::new(timestamp, subject, MetricKind::ProcMemRss, vec![rss as f64]),
        ])
    }
}

struct GpuState {
    index: u32,
    utilization: u32,
    power_w: f64,
}

pub struct DeviceSampler {
    gpu: Box<dyn GpuQuery>,
    matcher: ProcessMatcher,
}

impl DeviceSampler {
    pub fn new(gpu: Box<dyn GpuQuery>, matcher: ProcessMatcher) -> DeviceSampler {
        DeviceSampler { gpu, matcher }
    }

    pub fn collect(&mut self, timestamp: Timestamp) -> Vec<MetricSample> {
        let count = match self.gpu.device_count() {
            Ok(n) => n,
            Err(e) => {
                warn!("GPU count: {e}");
                0
            }
        };

        let mut states = HashMap::new();
        let mut handles = vec![];
        for index in 0..count {
            match self.gpu_state(index) {
                Ok((handle, bus_id, state)) => {
                    handles.push((handle, bus_id.clone()));
                    states.insert(bus_id, state);
                }
                Err(e) => debug!("GPU {index}: {e}"),
            }
        }

        let mut rows = vec![];
        let mut is_target = HashMap::new();
        for (handle, bus_id) in handles {
            let Some(state) = states.get(&bus_id) else {
                continue;
            };
            let procs = match self.gpu.running_processes(handle) {
                Ok(procs) => procs,
                Err(e) => {
                    debug!("GPU {} processes: {e}", state.index);
                    continue;
                }
            };
            for p in procs {
                if p.pid == self.matcher.own_pid() {
                    continue;
                }
                let matched = *is_target
                    .entry(p.pid)
                    .or_insert_with(|| self.matcher.is_target(p.pid).unwrap_or(false));
                if !matched {
                    continue;
                }
                rows.push(MetricSample::new(
                    timestamp,
                    Subject::Pid(p.pid),
                    MetricKind::Gpu(state.index),
                    vec![
                        p.used_memory_bytes as f64 / (1024.0 * 1024.0),
                        state.utilization as f64,
                        state.power_w,
                    ],
                ));
            }
        }
        rows
    }

    fn gpu_state(&self, index: u32) -> Result<(GpuHandle, String, GpuState), PerfError> {
        let handle = self.gpu.handle_for(index)?;
        let bus_id = self.gpu.bus_id(handle)?;
        let utilization = self.gpu.utilization(handle)?;
        let power_w = self.gpu.power_usage_mw(handle)? as f64 / 1000.0;
        Ok((
            handle,
            bus_id,
            GpuState {
                index,
                utilization,
                power_w,
            },
        ))
    }
}

/// Fixed-interval driver.  Each cycle gets the wall-clock time at its start; the loop then sleeps
/// for whatever is left of the interval.  The token is checked at the top of every cycle and
/// during the sleep.

pub struct SampleLoop {
    interval: Duration,
}

const MIN_INTERVAL_SECS: f64 = 0.1;
const SLEEP_SLICE: Duration = Duration::from_millis(100);

impl SampleLoop {
    pub fn new(interval_secs: f64) -> SampleLoop {
        let secs = if interval_secs.is_finite() {
            interval_secs.max(MIN_INTERVAL_SECS)
        } else {
            MIN_INTERVAL_SECS
        };
        SampleLoop {
            interval: Duration::from_secs_f64(secs),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sleep one interval, to give counters a baseline before the first cycle.

    pub fn warm_up(&self, token: &CancelToken) {
        pause(token, self.interval);
    }

    /// Run cycles until the token is cancelled.  Returns the number of cycles run.

    pub fn run<F>(&self, token: &CancelToken, mut cycle: F) -> u64
    where
        F: FnMut(Timestamp),
    {
        let mut cycles = 0;
        while !token.is_cancelled() {
            let started = Instant::now();
            cycle(now());
            cycles += 1;
            pause(token, self.interval.saturating_sub(started.elapsed()));
        }
        cycles
    }
}

fn pause(token: &CancelToken, d: Duration) {
    let until = Instant::now() + d;
    loop {
        let left = until.saturating_duration_since(Instant::now());
        if left.is_zero() || token.is_cancelled() {
            return;
        }
        thread::sleep(left.min(SLEEP_SLICE));
    }
}

/// The node name used in the metric tree.

pub fn hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.into_string().unwrap_or_else(|_| "localhost".to_string()),
        Err(e) => {
            warn!("gethostname: {e}");
            "localhost".to_string()
        }
    }
}

/// Run at the lowest scheduling priority, if allowed.

pub fn lower_priority() {
    // SAFETY: nice() only changes this process's priority.
    let r = unsafe { libc::nice(19) };
    if r == -1 {
        debug!("Could not lower priority");
    }
}

#[test]
fn test_cpu_utilization() {
    assert!(cpu_utilization(100, 150, 1.0, 100) == 50.0);
    assert!(cpu_utilization(100, 500, 2.0, 100) == 200.0);
    assert!(cpu_utilization(500, 100, 1.0, 100) == 0.0);
    assert!(cpu_utilization(100, 150, 0.0, 100) == 0.0);
}

#[test]
fn test_sample_loop_stops_on_cancel() {
    let token = CancelToken::new();
    let l = SampleLoop::new(0.01);
    assert!(l.interval() == Duration::from_millis(100));
    let mut seen = 0;
    let cycles = l.run(&token, |_| {
        seen += 1;
        if seen == 3 {
            token.cancel();
        }
    });
    assert!(cycles == 3);

    // A token cancelled up front runs nothing.
    assert!(l.run(&token, |_| panic!("ran")) == 0);
}

#[cfg(test)]
use crate::{
    gpu::{FakeDevice, FakeGpu, GpuProcess},
    matcher::MatchPolicy,
    procfs::{write_fake_process, ProcFs},
    writer::DurableWriter,
};

#[cfg(test)]
fn fake_node(root: &Path) {
    write_fake_process(root, 4242, &["/opt/solverX/bin/solve", "case.json"], (100, 20), 51200);
    write_fake_process(root, 4300, &["mpirun", "/opt/solverX/bin/solve"], (5, 5), 1024);
    write_fake_process(root, 4301, &["/usr/bin/top"], (5, 5), 1024);
    std::fs::write(
        root.join("meminfo"),
        "MemTotal: 4096000 kB\nMemAvailable: 2048000 kB\n",
    )
    .unwrap();
}

#[cfg(test)]
fn solver_matcher(proc_root: &Path, own_pid: u32) -> ProcessMatcher {
    ProcessMatcher::new(ProcFs::at(proc_root), MatchPolicy::new("solverX")).with_own_pid(own_pid)
}

#[cfg(test)]
fn fake_gpus() -> FakeGpu {
    FakeGpu {
        devices: vec![
            FakeDevice {
                bus_id: "00000000:3B:00.0".to_string(),
                utilization: 87,
                power_mw: 250400,
                processes: vec![
                    GpuProcess { pid: 4242, used_memory_bytes: 2048 * 1024 * 1024 },
                    GpuProcess { pid: 4301, used_memory_bytes: 1024 },
                    GpuProcess { pid: 9999, used_memory_bytes: 1024 },
                ],
                broken: false,
            },
            FakeDevice {
                bus_id: "00000000:5E:00.0".to_string(),
                utilization: 0,
                power_mw: 0,
                processes: vec![GpuProcess { pid: 4242, used_memory_bytes: 1 }],
                broken: true,
            },
        ],
    }
}

#[test]
fn test_host_sampler() {
    let dir = tempfile::tempdir().unwrap();
    let proc_root = dir.path().join("proc");
    fake_node(&proc_root);
    let matcher = solver_matcher(&proc_root, 1);
    let mut host = HostSampler::new(matcher, &dir.path().join("sys"));
    assert!(host.network_keys().is_empty());

    let rows = host.collect(now());
    assert!(rows.len() == 3);
    assert!(rows[0].kind == MetricKind::SystemMemory && rows[0].fields == vec![2000.0]);
    assert!(rows[1].subject == Subject::Pid(4242) && rows[1].kind == MetricKind::ProcCpuUtil);
    assert!(rows[1].fields == vec![0.0]);
    assert!(rows[2].kind == MetricKind::ProcMemRss && rows[2].fields == vec![51200.0]);
}

#[test]
fn test_host_sampler_cpu_across_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let proc_root = dir.path().join("proc");
    fake_node(&proc_root);
    let matcher = solver_matcher(&proc_root, 1);
    let mut host = HostSampler::new(matcher, &dir.path().join("sys"));

    assert!(host.collect(now())[1].fields == vec![0.0]);
    assert!(host.prev_cpu.contains_key(&4242));

    // 30 more ticks between the readings.
    thread::sleep(Duration::from_millis(20));
    let args = ["/opt/solverX/bin/solve", "case.json"];
    write_fake_process(&proc_root, 4242, &args, (120, 30), 51200);
    let rows = host.collect(now());
    assert!(rows[1].subject == Subject::Pid(4242) && rows[1].kind == MetricKind::ProcCpuUtil);
    assert!(rows[1].fields[0] > 0.0);

    // Unchanged counters read as idle.
    let rows = host.collect(now());
    assert!(rows[1].fields == vec![0.0]);

    // A process that is gone is forgotten.
    std::fs::remove_dir_all(proc_root.join("4242")).unwrap();
    let rows = host.collect(now());
    assert!(rows.len() == 1);
    assert!(host.prev_cpu.is_empty());
}

#[test]
fn test_device_sampler() {
    let dir = tempfile::tempdir().unwrap();
    fake_node(dir.path());
    let matcher = solver_matcher(dir.path(), 1);
    let mut device = DeviceSampler::new(Box::new(fake_gpus()), matcher);
    let rows = device.collect(now());
    // Only the target, and only on the GPU that answered.
    assert!(rows.len() == 1);
    assert!(rows[0].subject == Subject::Pid(4242));
    assert!(rows[0].kind == MetricKind::Gpu(0));
    assert!(rows[0].fields == vec![2048.0, 87.0, 250.4]);
}

#[test]
fn test_device_sampler_skips_own_pid() {
    let dir = tempfile::tempdir().unwrap();
    fake_node(dir.path());
    // The sampler itself looks like a target and holds memory on GPU 0.
    let matcher = solver_matcher(dir.path(), 4242);
    let mut device = DeviceSampler::new(Box::new(fake_gpus()), matcher);
    assert!(device.collect(now()).is_empty());
}

#[test]
fn test_host_and_device_agents_write_tree() {
    let dir = tempfile::tempdir().unwrap();
    let proc_root = dir.path().join("proc");
    let root = dir.path().join("TimeSeries");
    fake_node(&proc_root);

    let mut host = HostSampler::new(solver_matcher(&proc_root, 1), &dir.path().join("sys"));
    let mut device = DeviceSampler::new(Box::new(fake_gpus()), solver_matcher(&proc_root, 1));

    let writer = DurableWriter::new(&root, "node1").unwrap();
    let t = now();
    for row in host.collect(t).iter().chain(device.collect(t).iter()) {
        writer.write(row);
    }
    writer.close().unwrap();

    let gpu = std::fs::read_to_string(root.join("node1/node1-PID4242/gpu0.csv")).unwrap();
    assert!(gpu.lines().next() == Some("Timestamp,Memory(MiB),Util(%),Power(W)"));
    assert!(gpu.lines().count() == 2);
    let mem = std::fs::read_to_string(root.join("node1/system_memory.csv")).unwrap();
    assert!(mem.lines().next() == Some("Timestamp,Value"));
    assert!(root.join("node1/node1-PID4242/proc_cpu_util.csv").is_file());
    assert!(root.join("node1/node1-PID4242/proc_mem_rss.csv").is_file());
    assert!(!root.join("node1/node1-PID4301").exists());
}
