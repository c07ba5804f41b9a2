// The final summary: one row per (job, node, pid), joining each process's aggregated metrics with
// the timing window of its rank.
//
// A pid whose rank is not known gets rank -1 and rank 0's timing, except that a job whose log gave
// no rank information at all has everything at rank 0.  Missing data shows up as zeros and empty
// vectors, never as a missing row: a subject directory that has no aggregate, because its raw files
// had no complete rows or could not be compacted, still gets a row.

use crate::aggregate::{subject_dirs, AGGREGATE_SUFFIX};
use crate::columns::ColumnKey;
use crate::events::{EventLog, TimingReport};

use anyhow::Result;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const SUMMARY_HEADER: [&str; 12] = [
    "pid",
    "node",
    "job",
    "gpus",
    "description",
    "rank",
    "peak_memory(MB)",
    "average_cpu(%)",
    "peak_gpu_mem(MB)",
    "average_gpu_use(%)",
    "init_duration(s)",
    "solve_duration(s)",
];

/// What one aggregate file says about its process.  GPU vectors are indexed in parallel with
/// `gpu_indices`, which is ascending.

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProcessMetrics {
    pub pid: u32,
    pub node: String,
    pub peak_memory_mb: u64,
    pub average_cpu: f64,
    pub gpu_indices: Vec<u32>,
    pub peak_gpu_mem: Vec<u64>,
    pub average_gpu_util: Vec<f64>,
}

/// Everything the reporter needs to know about one finished job.

#[derive(Clone, Debug)]
pub struct JobOutcome {
    pub job: String,
    pub description: String,
    pub gpus_per_proc: u32,
    pub timeseries_root: PathBuf,
    pub log: EventLog,
    pub timing: TimingReport,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SummaryRow {
    pub pid: String,
    pub node: String,
    pub job: String,
    pub gpus: usize,
    pub description: String,
    pub rank: i64,
    #[serde(rename = "peak_memory(MB)")]
    pub peak_memory: u64,
    #[serde(rename = "average_cpu(%)")]
    pub average_cpu: f64,
    #[serde(rename = "peak_gpu_mem(MB)")]
    pub peak_gpu_mem: String,
    #[serde(rename = "average_gpu_use(%)")]
    pub average_gpu_use: String,
    #[serde(rename = "init_duration(s)")]
    pub init_duration: String,
    #[serde(rename = "solve_duration(s)")]
    pub solve_duration: String,
}

/// All aggregate files below `root`, sorted.

pub fn find_aggregates(root: &Path) -> Vec<PathBuf> {
    let mut found = vec![];
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(AGGREGATE_SUFFIX))
            {
                found.push(path);
            }
        }
    }
    found.sort();
    found
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        0.0
    } else {
        xs.iter().sum::<f64>() / xs.len() as f64
    }
}

fn max(xs: &[f64]) -> f64 {
    xs.iter().copied().fold(0.0, f64::max)
}

fn round_to(x: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (x * scale).round() / scale
}

/// Reads aggregates and turns them into summary rows.

pub struct Reporter {
    pid_re: Regex,
}

impl Reporter {
    pub fn new() -> Result<Reporter> {
        Ok(Reporter {
            pid_re: Regex::new(r"PID(\d+)")?,
        })
    }

    fn pid_and_node(&self, path: &Path) -> Option<(u32, String)> {
        let file_name = path.file_name()?.to_str()?;
        let dir_name = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or("");
        let pid = self
            .pid_re
            .captures(file_name)
            .or_else(|| self.pid_re.captures(dir_name))?[1]
            .parse::<u32>()
            .ok()?;
        let node = match dir_name.rsplit_once("-PID") {
            Some((node, _)) => node.to_string(),
            None => {
                let cut = file_name
                    .rfind("_PID")
                    .or_else(|| file_name.rfind("-PID"))
                    .unwrap_or(0);
                file_name[..cut].to_string()
            }
        };
        Some((pid, node))
    }

    // `<node>-PID<pid>`
    fn subject_of_dir(&self, dir: &Path) -> Option<(u32, String)> {
        let name = dir.file_name()?.to_str()?;
        let (node, _) = name.rsplit_once("-PID")?;
        let pid = self.pid_re.captures(name)?[1].parse::<u32>().ok()?;
        Some((pid, node.to_string()))
    }

    /// Summarize one aggregate file.  None if the file name carries no pid.

    pub fn read_aggregate(&self, path: &Path) -> Result<Option<ProcessMetrics>> {
        let Some((pid, node)) = self.pid_and_node(path) else {
            debug!("No pid in {}", path.display());
            return Ok(None);
        };
        read_metrics(path, pid, node).map(Some)
    }

    /// The summary rows for one job, unsorted.  Unreadable aggregates are logged and reported with
    /// zeros, as are subject directories without an aggregate.

    pub fn summarize_job(&self, outcome: &JobOutcome) -> Vec<SummaryRow> {
        let mut processes = vec![];
        let mut seen = HashSet::new();
        for path in find_aggregates(&outcome.timeseries_root) {
            let metrics = match self.read_aggregate(&path) {
                Ok(Some(m)) => m,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Reading {}: {e}", path.display());
                    continue;
                }
            };
            if let Some(dir) = path.parent() {
                seen.insert(dir.to_path_buf());
            }
            processes.push(metrics);
        }

        let dirs = subject_dirs(&outcome.timeseries_root).unwrap_or_default();
        for dir in dirs.into_iter().filter(|d| !seen.contains(d)) {
            let Some((pid, node)) = self.subject_of_dir(&dir) else {
                continue;
            };
            debug!("No aggregate in {}, reporting zeros", dir.display());
            processes.push(ProcessMetrics {
                pid,
                node,
                ..Default::default()
            });
        }

        processes
            .into_iter()
            .map(|metrics| summary_row(outcome, metrics))
            .collect()
    }
}

fn read_metrics(path: &Path, pid: u32, node: String) -> Result<ProcessMetrics> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers = reader.headers()?.clone();
    let mut columns: Vec<Vec<f64>> = vec![vec![]; headers.len()];
    for record in reader.records() {
        let record = match record {
            Ok(r) => r,
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(_) => continue,
        };
        for (i, field) in record.iter().enumerate() {
            if let (Some(col), Ok(v)) = (columns.get_mut(i), field.trim().parse::<f64>()) {
                col.push(v);
            }
        }
    }

    let mut metrics = ProcessMetrics {
        pid,
        node,
        ..Default::default()
    };
    let mut gpu_mem = BTreeMap::<u32, Vec<f64>>::new();
    let mut gpu_util = BTreeMap::<u32, Vec<f64>>::new();
    for (name, values) in headers.iter().zip(columns.iter()) {
        match ColumnKey::parse(name) {
            ColumnKey::Process(n) if n == "proc_mem_rss" => {
                metrics.peak_memory_mb = (max(values) / 1024.0) as u64;
            }
            ColumnKey::Process(n) if n == "proc_cpu_util" => {
                metrics.average_cpu = round_to(mean(values), 2);
            }
            ColumnKey::Gpu { index, name } => {
                let lower = name.to_lowercase();
                if lower.contains("mem") {
                    gpu_mem.entry(index).or_default().extend(values);
                } else if lower.contains("util") {
                    gpu_util.entry(index).or_default().extend(values);
                }
            }
            _ => {}
        }
    }

    let mut indices = gpu_mem.keys().chain(gpu_util.keys()).copied().collect::<Vec<u32>>();
    indices.sort();
    indices.dedup();
    for index in &indices {
        let mem = gpu_mem.get(index).map(|v| v.as_slice()).unwrap_or(&[]);
        let util = gpu_util.get(index).map(|v| v.as_slice()).unwrap_or(&[]);
        metrics.peak_gpu_mem.push(max(mem) as u64);
        metrics.average_gpu_util.push(round_to(mean(util), 1));
    }
    metrics.gpu_indices = indices;

    Ok(metrics)
}

fn summary_row(outcome: &JobOutcome, metrics: ProcessMetrics) -> SummaryRow {
    let mapped = outcome.log.identity.rank_of(metrics.pid);
    let rank = match mapped {
        Some(r) => r as i64,
        None if outcome.log.identity.is_empty() => 0,
        None => -1,
    };
    let window = outcome.timing.window_for(mapped.unwrap_or(0));
    let gpus = if metrics.gpu_indices.is_empty() {
        outcome.gpus_per_proc as usize
    } else {
        metrics.gpu_indices.len()
    };
    SummaryRow {
        pid: format!("PID{}", metrics.pid),
        node: metrics.node,
        job: outcome.job.clone(),
        gpus,
        description: outcome.description.clone(),
        rank,
        peak_memory: metrics.peak_memory_mb,
        average_cpu: metrics.average_cpu,
        peak_gpu_mem: format!("{:?}", metrics.peak_gpu_mem),
        average_gpu_use: format!("{:?}", metrics.average_gpu_util),
        init_duration: format!("{:.4}", window.init_duration),
        solve_duration: format!("{:.4}", window.solve_duration),
    }
}

/// Sort the rows by (job, rank) and write them as CSV, creating the directory.

pub fn write_summary(path: &Path, rows: &mut [SummaryRow]) -> Result<()> {
    rows.sort_by(|a, b| a.job.cmp(&b.job).then(a.rank.cmp(&b.rank)));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_path(path)?;
    writer.write_record(SUMMARY_HEADER)?;
    for row in rows.iter() {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
use crate::aggregate::{aggregate_tree, DEFAULT_TOLERANCE_MS};
#[cfg(test)]
use crate::events::EventReconciler;

#[test]
fn test_pid_and_node() {
    let r = Reporter::new().unwrap();
    assert!(
        r.pid_and_node(Path::new("/r/node-1/node-1-PID42/node_1_PID42_metrics.csv"))
            == Some((42, "node-1".to_string()))
    );
    assert!(r.pid_and_node(Path::new("/r/x/n7_PID9_metrics.csv")) == Some((9, "n7".to_string())));
    assert!(r.pid_and_node(Path::new("/r/x/summary_metrics.csv")).is_none());
    assert!(
        r.subject_of_dir(Path::new("/r/node-1/node-1-PID42")) == Some((42, "node-1".to_string()))
    );
    assert!(r.subject_of_dir(Path::new("/r/node-1/PID42")).is_none());
}

#[cfg(test)]
fn write_aggregate_fixture(root: &Path, node: &str, pid: u32, text: &str) {
    let dir = root.join(node).join(format!("{node}-PID{pid}"));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(format!("{node}_PID{pid}_metrics.csv")), text).unwrap();
}

#[test]
fn test_read_aggregate() {
    let dir = tempfile::tempdir().unwrap();
    write_aggregate_fixture(
        dir.path(),
        "n1",
        42,
        "Timestamp,proc_cpu_util,proc_mem_rss,gpu0_Memory(MiB),gpu0_Util(%),gpu0_Power(W),\
         gpu2_Memory(MiB),gpu2_Util(%)\n\
         2024-01-01 00:00:01,100.0,2048,512.7,80,200.0,10,1\n\
         2024-01-01 00:00:02,50.5,4096,640.2,91,210.0,20,2\n",
    );
    let m = Reporter::new()
        .unwrap()
        .read_aggregate(&dir.path().join("n1/n1-PID42/n1_PID42_metrics.csv"))
        .unwrap()
        .unwrap();
    assert!(m.pid == 42 && m.node == "n1");
    assert!(m.peak_memory_mb == 4);
    assert!(m.average_cpu == 75.25);
    assert!(m.gpu_indices == vec![0, 2]);
    assert!(m.peak_gpu_mem == vec![640, 20]);
    assert!(m.average_gpu_util == vec![85.5, 1.5]);
}

#[test]
fn test_summarize_and_write() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("TimeSeries");
    write_aggregate_fixture(
        &root,
        "n1",
        555,
        "Timestamp,proc_cpu_util,proc_mem_rss,gpu0_Memory(MiB),gpu0_Util(%)\n\
         2024-01-01 00:00:01,10,1024,100,50\n",
    );
    write_aggregate_fixture(
        &root,
        "n2",
        777,
        "Timestamp,proc_cpu_util,proc_mem_rss\n2024-01-01 00:00:01,20,2048\n",
    );

    let r = EventReconciler::new().unwrap();
    let log = r
        .parse(
            "This is the MPI rank 2, PID: 555 [Wall time: 1.0]\n\
             This is the MPI rank 0, PID: 111 [Wall time: 2.0]\n\
             Initial field file reading completed [Wall time: 4.0]\n\
             stopping the solver [Wall time: 9.0, Rank: 2]\n"
                .as_bytes(),
        )
        .unwrap();
    let timing = r.timing(&log);
    let outcome = JobOutcome {
        job: "case1".to_string(),
        description: "two nodes".to_string(),
        gpus_per_proc: 1,
        timeseries_root: root,
        log,
        timing,
    };
    let mut rows = Reporter::new().unwrap().summarize_job(&outcome);
    assert!(rows.len() == 2);

    let out = dir.path().join("report/summary.csv");
    write_summary(&out, &mut rows).unwrap();
    let text = fs::read_to_string(&out).unwrap();
    let lines = text.lines().collect::<Vec<&str>>();
    assert!(lines[0] == SUMMARY_HEADER.join(","));
    // Unmapped pid 777 sorts first at rank -1 with rank 0's window.
    assert!(lines[1] == "PID777,n2,case1,1,two nodes,-1,2,20.0,[],[],2.0000,0.0000");
    assert!(lines[2] == "PID555,n1,case1,1,two nodes,2,1,10.0,[100],[50.0],3.0000,5.0000");
}

#[test]
fn test_summary_without_rank_map() {
    let dir = tempfile::tempdir().unwrap();
    let text = "Timestamp,proc_cpu_util\n2024-01-01 00:00:01,1\n";
    write_aggregate_fixture(dir.path(), "n1", 9, text);
    let outcome = JobOutcome {
        job: "j".to_string(),
        description: String::new(),
        gpus_per_proc: 0,
        timeseries_root: dir.path().to_path_buf(),
        log: EventLog::default(),
        timing: TimingReport::default(),
    };
    let rows = Reporter::new().unwrap().summarize_job(&outcome);
    assert!(rows.len() == 1);
    assert!(rows[0].rank == 0);
    assert!(rows[0].init_duration == "0.0000");
}

#[test]
fn test_subject_without_aggregate_still_reported() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("TimeSeries");
    write_aggregate_fixture(&root, "n1", 10, "Timestamp,proc_cpu_util\n2024-01-01 00:00:01,4\n");

    // Host and GPU samples too far apart to join: compaction leaves the raw files.
    let subject = root.join("n1/n1-PID4242");
    fs::create_dir_all(&subject).unwrap();
    for (file, text) in [
        ("proc_cpu_util.csv", "Timestamp,Value\n2024-01-01 00:00:01,50\n"),
        ("proc_mem_rss.csv", "Timestamp,Value\n2024-01-01 00:00:01,2048\n"),
        ("gpu0.csv", "Timestamp,Memory(MiB),Util(%)\n2024-01-01 00:00:05,10,20\n"),
    ] {
        fs::write(subject.join(file), text).unwrap();
    }
    let summary = aggregate_tree(&root, DEFAULT_TOLERANCE_MS).unwrap();
    // n1-PID10 holds nothing but its aggregate.
    assert!(summary.skipped == 2 && summary.compacted == 0);
    assert!(subject.join("proc_cpu_util.csv").exists());

    let outcome = JobOutcome {
        job: "j".to_string(),
        description: String::new(),
        gpus_per_proc: 2,
        timeseries_root: root,
        log: EventLog::default(),
        timing: TimingReport::default(),
    };
    let mut rows = Reporter::new().unwrap().summarize_job(&outcome);
    assert!(rows.len() == 2);
    rows.sort_by(|a, b| a.pid.cmp(&b.pid));
    assert!(rows[0].pid == "PID10" && rows[0].average_cpu == 4.0);
    let missing = &rows[1];
    assert!(missing.pid == "PID4242" && missing.node == "n1");
    assert!(missing.peak_memory == 0 && missing.average_cpu == 0.0);
    assert!(missing.gpus == 2);
    assert!(missing.peak_gpu_mem == "[]" && missing.average_gpu_use == "[]");

    // An aggregate that cannot be read is reported the same way.
    let broken = tempfile::tempdir().unwrap();
    write_aggregate_fixture(broken.path(), "n2", 5, "Timestamp,proc_cpu_util\n");
    fs::write(broken.path().join("n2/n2-PID5/n2_PID5_metrics.csv"), b"\xff\xfe,\xfd\n").unwrap();
    let outcome = JobOutcome {
        timeseries_root: broken.path().to_path_buf(),
        ..outcome
    };
    let rows = Reporter::new().unwrap().summarize_job(&outcome);
    assert!(rows.len() == 1 && rows[0].pid == "PID5" && rows[0].average_cpu == 0.0);
}
