// Read the orchestrator's job file.
//
// The file is a JSON object with two fields:
//
//   global - object, optional, run-wide settings:
//     output_dir - string, where run directories are created, default "perf_runs"
//     loop - integer, how many times to run each job, default 1
//     interval - number, sampling interval in seconds, default 1.0
//     agent_dir - string, directory holding the agent binaries, default "" (use PATH)
//     settle_secs - integer, wait after stopping agents before aggregating, default 3
//     start_delay_secs - integer, wait after starting agents before launching, default 1
//     clean_results - boolean, remove each job's result_paths after it ran, default false
//
//   jobs - array of objects, one per job:
//     case_name - string, required, names the job and its directories
//     launch - string, required, the shell command that runs the workload
//     nodes - array of strings, the nodes the workload runs on, default ["localhost"]
//     target - string, the name the agents match processes by, default case_name
//     loop, interval, clean_results - override the global values
//     gpus_per_proc - integer, reported when no GPU is observed, default 0
//     description - string, free text for the summary, default ""
//     result_paths - array of strings, removed when clean_results is set, default []
//
// As for the system config files, the generic JSON parser is followed by explicit decoding.  A
// problem with one job does not invalidate the others: it is kept as an error in its slot so the
// orchestrator can report it and move on.

use crate::errors::PerfError;

use anyhow::{bail, Result};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq)]
pub struct GlobalConfig {
    pub output_dir: PathBuf,
    pub loop_count: u32,
    pub interval: f64,
    pub agent_dir: PathBuf,
    pub settle_secs: u64,
    pub start_delay_secs: u64,
    pub clean_results: bool,
}

impl Default for GlobalConfig {
    fn default() -> GlobalConfig {
        GlobalConfig {
            output_dir: PathBuf::from("perf_runs"),
            loop_count: 1,
            interval: 1.0,
            agent_dir: PathBuf::new(),
            settle_secs: 3,
            start_delay_secs: 1,
            clean_results: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct JobConfig {
    pub case_name: String,
    pub launch: String,
    pub nodes: Vec<String>,
    pub target: String,
    pub loop_count: u32,
    pub interval: f64,
    pub gpus_per_proc: u32,
    pub description: String,
    pub clean_results: bool,
    pub result_paths: Vec<String>,
}

impl JobConfig {
    /// The names of the job's runs: the case name, or `<case>_<k>` for k = 1.. when the job loops.

    pub fn case_names(&self) -> Vec<String> {
        if self.loop_count <= 1 {
            vec![self.case_name.clone()]
        } else {
            (1..=self.loop_count)
                .map(|k| format!("{}_{k}", self.case_name))
                .collect()
        }
    }
}

#[derive(Debug)]
pub struct RunConfig {
    pub global: GlobalConfig,
    pub jobs: Vec<Result<JobConfig, PerfError>>,
}

pub fn read_run_config(path: &Path) -> Result<RunConfig> {
    let text = fs::read_to_string(path)?;
    parse_run_config(&text)
}

/// Errors in the file's structure or in `global` are fatal; errors in a job are kept with the job.

pub fn parse_run_config(text: &str) -> Result<RunConfig> {
    let v: Value = serde_json::from_str(text)?;
    let Value::Object(top) = v else {
        bail!("Expected an object value")
    };

    let global = match top.get("global") {
        None => GlobalConfig::default(),
        Some(Value::Object(fields)) => {
            decode_global(fields).map_err(|reason| PerfError::config("global", reason))?
        }
        Some(_) => bail!("Field 'global' must have an object value"),
    };

    let jobs = match top.get("jobs") {
        Some(Value::Array(jobs)) => jobs
            .iter()
            .enumerate()
            .map(|(i, job)| decode_job(i, job, &global))
            .collect(),
        _ => bail!("Field 'jobs' must be present and have an array value"),
    };

    Ok(RunConfig { global, jobs })
}

fn decode_global(fields: &Map<String, Value>) -> std::result::Result<GlobalConfig, String> {
    let d = GlobalConfig::default();
    Ok(GlobalConfig {
        output_dir: grab_string(fields, "output_dir")?.map_or(d.output_dir, PathBuf::from),
        loop_count: grab_u64(fields, "loop")?.map_or(d.loop_count, |n| n.max(1) as u32),
        interval: grab_f64(fields, "interval")?.unwrap_or(d.interval),
        agent_dir: grab_string(fields, "agent_dir")?.map_or(d.agent_dir, PathBuf::from),
        settle_secs: grab_u64(fields, "settle_secs")?.unwrap_or(d.settle_secs),
        start_delay_secs: grab_u64(fields, "start_delay_secs")?.unwrap_or(d.start_delay_secs),
        clean_results: grab_bool(fields, "clean_results")?.unwrap_or(d.clean_results),
    })
}

fn decode_job(index: usize, job: &Value, global: &GlobalConfig) -> Result<JobConfig, PerfError> {
    let Value::Object(fields) = job else {
        return Err(PerfError::config(&format!("#{index}"), "expected an object value"));
    };
    // Name the job by its case name if it has a usable one, so errors can be attributed.
    let name = match fields.get("case_name") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => format!("#{index}"),
    };
    let err = |reason: String| PerfError::config(&name, reason);

    let case_name = grab_string(fields, "case_name")
        .map_err(err)?
        .filter(|s| !s.is_empty())
        .ok_or_else(|| err("field 'case_name' must be present".to_string()))?;
    let launch = grab_string(fields, "launch")
        .map_err(err)?
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| err("field 'launch' must be present".to_string()))?;
    let nodes = grab_strings(fields, "nodes")
        .map_err(err)?
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| vec!["localhost".to_string()]);
    let target = grab_string(fields, "target")
        .map_err(err)?
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| case_name.clone());
    let loop_count = grab_u64(fields, "loop")
        .map_err(err)?
        .map_or(global.loop_count, |n| n.max(1) as u32);
    let interval = grab_f64(fields, "interval")
        .map_err(err)?
        .unwrap_or(global.interval);
    if interval.is_nan() || interval <= 0.0 {
        return Err(err(format!("interval must be positive, not {interval}")));
    }

    Ok(JobConfig {
        case_name,
        launch,
        nodes,
        target,
        loop_count,
        interval,
        gpus_per_proc: grab_u64(fields, "gpus_per_proc").map_err(err)?.unwrap_or(0) as u32,
        description: grab_string(fields, "description").map_err(err)?.unwrap_or_default(),
        clean_results: grab_bool(fields, "clean_results")
            .map_err(err)?
            .unwrap_or(global.clean_results),
        result_paths: grab_strings(fields, "result_paths")
            .map_err(err)?
            .unwrap_or_default(),
    })
}

// The grab_ functions return Ok(None) for an absent field and Err for a field of the wrong type.

type Grab<T> = std::result::Result<Option<T>, String>;

fn grab_string(fields: &Map<String, Value>, name: &str) -> Grab<String> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(format!("field '{name}' must have a string value")),
    }
}

fn grab_strings(fields: &Map<String, Value>, name: &str) -> Grab<Vec<String>> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(xs)) => xs
            .iter()
            .map(|x| match x {
                Value::String(s) => Ok(s.clone()),
                _ => Err(format!("field '{name}' must be an array of strings")),
            })
            .collect::<std::result::Result<Vec<String>, String>>()
            .map(Some),
        Some(_) => Err(format!("field '{name}' must be an array of strings")),
    }
}

fn grab_u64(fields: &Map<String, Value>, name: &str) -> Grab<u64> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(n) => Ok(Some(n)),
            None => Err(format!("field '{name}' must have unsigned integer value")),
        },
        Some(_) => Err(format!("field '{name}' must have an integer value")),
    }
}

fn grab_f64(fields: &Map<String, Value>, name: &str) -> Grab<f64> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(_) => Err(format!("field '{name}' must have a numeric value")),
    }
}

fn grab_bool(fields: &Map<String, Value>, name: &str) -> Grab<bool> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(format!("field '{name}' must have a boolean value")),
    }
}

#[test]
fn test_defaults() {
    let c = parse_run_config(r#"{"jobs": [{"case_name": "case1", "launch": "./case1/solver"}]}"#)
        .unwrap();
    assert!(c.global == GlobalConfig::default());
    let job = c.jobs[0].as_ref().unwrap();
    assert!(job.nodes == vec!["localhost".to_string()]);
    assert!(job.target == "case1");
    assert!(job.loop_count == 1);
    assert!(job.interval == 1.0);
    assert!(!job.clean_results);
    assert!(job.case_names() == vec!["case1".to_string()]);
}

#[test]
fn test_overrides() {
    let c = parse_run_config(
        r#"{ "global": { "output_dir": "/scratch/runs", "loop": 3, "interval": 2.0,
                         "agent_dir": "/opt/perf/bin", "clean_results": true },
             "jobs": [ { "case_name": "case1", "nodes": ["n1", "n2"],
                         "launch": "mpirun ./case1/solver", "target": "solverX",
                         "loop": 2, "interval": 0.5, "gpus_per_proc": 1,
                         "description": "two nodes", "result_paths": ["/scratch/case1/out"],
                         "clean_results": false },
                       { "case_name": "case2", "launch": "./case2/solver" } ] }"#,
    )
    .unwrap();
    assert!(c.global.output_dir == PathBuf::from("/scratch/runs"));
    assert!(c.global.agent_dir == PathBuf::from("/opt/perf/bin"));
    assert!(c.global.settle_secs == 3);
    let j1 = c.jobs[0].as_ref().unwrap();
    assert!(j1.nodes == vec!["n1".to_string(), "n2".to_string()]);
    assert!(j1.target == "solverX");
    assert!(j1.interval == 0.5);
    assert!(j1.gpus_per_proc == 1);
    assert!(!j1.clean_results);
    assert!(j1.result_paths == vec!["/scratch/case1/out".to_string()]);
    assert!(j1.case_names() == vec!["case1_1".to_string(), "case1_2".to_string()]);
    let j2 = c.jobs[1].as_ref().unwrap();
    assert!(j2.loop_count == 3);
    assert!(j2.interval == 2.0);
    assert!(j2.clean_results);
}

#[test]
fn test_bad_job_is_isolated() {
    let c = parse_run_config(
        r#"{"jobs": [{"case_name": "nolaunch"},
                     {"case_name": "ok", "launch": "true"},
                     {"case_name": "badnodes", "launch": "true", "nodes": "n1"},
                     17]}"#,
    )
    .unwrap();
    assert!(c.jobs.len() == 4);
    match &c.jobs[0] {
        Err(PerfError::Config { job, reason }) => {
            assert!(job == "nolaunch");
            assert!(reason.contains("launch"));
        }
        _ => panic!("expected a config error"),
    }
    assert!(c.jobs[1].is_ok());
    assert!(matches!(&c.jobs[2], Err(PerfError::Config { job, .. }) if job == "badnodes"));
    assert!(matches!(&c.jobs[3], Err(PerfError::Config { job, .. }) if job == "#3"));
}

#[test]
fn test_bad_structure() {
    assert!(parse_run_config("[]").is_err());
    assert!(parse_run_config(r#"{"global": {}}"#).is_err());
    assert!(parse_run_config(r#"{"global": {"loop": "x"}, "jobs": []}"#).is_err());
    assert!(parse_run_config("{").is_err());
}
