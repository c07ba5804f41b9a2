// Recovering rank identity and phase timing from the workload's own log.
//
// The workload prints free text.  Two kinds of lines matter:
//
//   ... MPI rank 2 ... PID: 555 ...               identity: rank 2 is process 555
//   <event text> [Wall time: 12.5, Rank: 2]       milestone, the rank part is optional
//
// A line can be both.  Identity is first-writer-wins in both directions: once a rank has a pid, or
// a pid a rank, later lines don't change it.  If the OS reuses a pid within one log, events of the
// second process are attributed to the first one's rank; nothing here detects that.
//
// The rank of a milestone is its explicit rank if it has one, else the rank of a pid mentioned in
// the event text, else 0.
//
// Phase timing uses four markers.  `globalInitEnd` is the earliest init-end milestone of any rank
// (0 if none); `globalSolveStart` is the earliest solve-start milestone, falling back to
// `globalInitEnd`.  For each rank:
//
//   init  = max(0, globalInitEnd - earliest program-start of the rank)
//   solve = max(0, latest solve-end of the rank - globalSolveStart)
//
// and a rank without the relevant marker gets 0.

use anyhow::Result;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use tracing::info;

/// Case-insensitive substrings identifying the four milestones.

#[derive(Clone, Debug)]
pub struct Markers {
    pub program_start: String,
    pub init_end: String,
    pub solve_start: String,
    pub solve_end: String,
}

impl Default for Markers {
    fn default() -> Markers {
        Markers {
            program_start: "This is the MPI rank".to_string(),
            init_end: "Initial field file reading completed".to_string(),
            solve_start: "Create new monitor layer".to_string(),
            solve_end: "stopping the solver".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RankIdentity {
    rank_to_pid: HashMap<u32, u32>,
    pid_to_rank: HashMap<u32, u32>,
}

impl RankIdentity {
    pub fn record(&mut self, rank: u32, pid: u32) {
        self.rank_to_pid.entry(rank).or_insert(pid);
        self.pid_to_rank.entry(pid).or_insert(rank);
    }

    pub fn rank_of(&self, pid: u32) -> Option<u32> {
        self.pid_to_rank.get(&pid).copied()
    }

    pub fn pid_of(&self, rank: u32) -> Option<u32> {
        self.rank_to_pid.get(&rank).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.pid_to_rank.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Milestone {
    #[serde(rename = "WallTime_s")]
    pub wall_time: f64,
    #[serde(rename = "Rank")]
    pub rank: u32,
    #[serde(rename = "Event")]
    pub event: String,
}

#[derive(Clone, Debug, Default)]
pub struct EventLog {
    pub identity: RankIdentity,
    pub milestones: Vec<Milestone>,
}

impl EventLog {
    /// Write the milestones as CSV with header `WallTime_s,Rank,Event`, creating the directory.

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_path(path)?;
        writer.write_record(["WallTime_s", "Rank", "Event"])?;
        for m in &self.milestones {
            writer.serialize(m)?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TimingWindow {
    pub init_duration: f64,
    pub solve_duration: f64,
}

#[derive(Clone, Debug, Default)]
pub struct TimingReport {
    pub global_init_end: f64,
    pub global_solve_start: f64,
    windows: BTreeMap<u32, TimingWindow>,
}

impl TimingReport {
    /// The window of `rank`, else rank 0's, else zeros.

    pub fn window_for(&self, rank: u32) -> TimingWindow {
        self.windows
            .get(&rank)
            .or_else(|| self.windows.get(&0))
            .copied()
            .unwrap_or_default()
    }

    pub fn windows(&self) -> impl Iterator<Item = (u32, TimingWindow)> + '_ {
        self.windows.iter().map(|(r, w)| (*r, *w))
    }
}

pub struct EventReconciler {
    identity: Regex,
    milestone: Regex,
    inline_pid: Regex,
    markers: Markers,
}

impl EventReconciler {
    pub fn new() -> Result<EventReconciler> {
        EventReconciler::with_markers(Markers::default())
    }

    pub fn with_markers(markers: Markers) -> Result<EventReconciler> {
        Ok(EventReconciler {
            identity: Regex::new(r"(?i)MPI rank\s*(\d+).*?PID:\s*(\d+)")?,
            milestone: Regex::new(r"(?i)(.*?)\[Wall time:\s*([0-9.]+)(?:,\s*Rank:\s*(\d+))?\]")?,
            inline_pid: Regex::new(r"(?i)PID[:\s=]*(\d+)")?,
            markers,
        })
    }

    /// Parse a log file.  A log that doesn't exist yields an empty result.

    pub fn parse_file(&self, path: &Path) -> Result<EventLog> {
        match File::open(path) {
            Ok(f) => self.parse(BufReader::new(f)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No log at {}, timing will be zero", path.display());
                Ok(EventLog::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Parse log text.  Bytes that are not UTF-8 are replaced, not rejected.

    pub fn parse<R: BufRead>(&self, mut reader: R) -> Result<EventLog> {
        let mut log = EventLog::default();
        let mut buf = vec![];
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&buf);
            self.scan_line(line.trim_end(), &mut log);
        }
        Ok(log)
    }

    fn scan_line(&self, line: &str, log: &mut EventLog) {
        let lower = line.to_lowercase();
        if lower.contains("mpi rank") && lower.contains("pid:") {
            if let Some(c) = self.identity.captures(line) {
                if let (Ok(rank), Ok(pid)) = (c[1].parse::<u32>(), c[2].parse::<u32>()) {
                    log.identity.record(rank, pid);
                }
            }
        }

        let Some(c) = self.milestone.captures(line) else {
            return;
        };
        let Ok(wall_time) = c[2].parse::<f64>() else {
            return;
        };
        let text = c[1].trim();
        let explicit = c.get(3).and_then(|m| m.as_str().parse::<u32>().ok());
        let rank = explicit
            .or_else(|| {
                let pid = self.inline_pid.captures(text)?[1].parse::<u32>().ok()?;
                log.identity.rank_of(pid)
            })
            .unwrap_or(0);
        let event = if text.is_empty() { "Event" } else { text };
        log.milestones.push(Milestone {
            wall_time,
            rank,
            event: event.to_string(),
        });
    }

    /// Derive per-rank phase durations.  Every rank that appears in a milestone or in the identity
    /// map gets a window.

    pub fn timing(&self, log: &EventLog) -> TimingReport {
        let is = |m: &Milestone, marker: &str| {
            m.event.to_lowercase().contains(&marker.to_lowercase())
        };
        let earliest = |marker: &str| {
            log.milestones
                .iter()
                .filter(|m| is(m, marker))
                .map(|m| m.wall_time)
                .reduce(f64::min)
        };

        let global_init_end = earliest(&self.markers.init_end).unwrap_or(0.0);
        let global_solve_start = earliest(&self.markers.solve_start).unwrap_or(global_init_end);

        let mut ranks = log.milestones.iter().map(|m| m.rank).collect::<BTreeSet<u32>>();
        ranks.extend(log.identity.rank_to_pid.keys().copied());

        let mut windows = BTreeMap::new();
        for rank in ranks {
            let of_rank = |marker: &str| {
                log.milestones
                    .iter()
                    .filter(|m| m.rank == rank && is(m, marker))
                    .map(|m| m.wall_time)
                    .collect::<Vec<f64>>()
            };
            let start = of_rank(&self.markers.program_start).into_iter().reduce(f64::min);
            let end = of_rank(&self.markers.solve_end).into_iter().reduce(f64::max);
            windows.insert(
                rank,
                TimingWindow {
                    init_duration: start.map_or(0.0, |s| round4((global_init_end - s).max(0.0))),
                    solve_duration: end.map_or(0.0, |e| round4((e - global_solve_start).max(0.0))),
                },
            );
        }

        TimingReport {
            global_init_end,
            global_solve_start,
            windows,
        }
    }
}

fn round4(x: f64) -> f64 {
    (x * 10000.0).round() / 10000.0
}

#[cfg(test)]
fn parse_text(text: &str) -> EventLog {
    EventReconciler::new().unwrap().parse(text.as_bytes()).unwrap()
}

#[test]
fn test_rank_from_pid() {
    let log = parse_text(
        "This is the MPI rank 2 of 4, PID: 555 [Wall time: 0.5]\n\
         worker PID: 555 done with setup [Wall time: 3.25]\n",
    );
    assert!(log.identity.rank_of(555) == Some(2));
    assert!(log.identity.pid_of(2) == Some(555));
    assert!(log.milestones.len() == 2);
    assert!(log.milestones[0].rank == 2);
    assert!(log.milestones[1].rank == 2);
    assert!(log.milestones[1].wall_time == 3.25);
    assert!(log.milestones[1].event == "worker PID: 555 done with setup");
}

#[test]
fn test_rank_priority_and_first_writer() {
    let log = parse_text(
        "MPI rank 1 PID: 100\n\
         MPI rank 1 PID: 200\n\
         MPI rank 3 PID: 100\n\
         step PID=100 [Wall time: 1.0, Rank: 7]\n\
         step pid 100 [Wall time: 2.0]\n\
         step PID: 300 [Wall time: 3.0]\n\
         step [Wall time: 4.0]\n\
         no wall time here, PID: 100\n",
    );
    assert!(log.identity.pid_of(1) == Some(100));
    assert!(log.identity.rank_of(100) == Some(1));
    assert!(log.identity.rank_of(200) == Some(1));
    assert!(log.identity.pid_of(3) == Some(100));
    let ranks = log.milestones.iter().map(|m| m.rank).collect::<Vec<u32>>();
    assert!(ranks == vec![7, 1, 0, 0]);
}

#[test]
fn test_bare_milestone_is_named_event() {
    let dir = tempfile::tempdir().unwrap();
    let log = parse_text("[Wall time: 1.5]
   [Wall time: 2.5, Rank: 3]
");
    assert!(log.milestones.len() == 2);
    assert!(log.milestones.iter().all(|m| m.event == "Event"));
    assert!(log.milestones[1].rank == 3);

    let out = dir.path().join("Events/walltime.csv");
    log.write_csv(&out).unwrap();
    let text = std::fs::read_to_string(&out).unwrap();
    let lines = text.lines().collect::<Vec<&str>>();
    assert!(lines[1] == "1.5,0,Event");
    assert!(lines[2] == "2.5,3,Event");
}

#[test]
fn test_timing() {
    let r = EventReconciler::new().unwrap();
    let log = r
        .parse(
            "This is the MPI rank 0, PID: 10 [Wall time: 1.0]\n\
             This is the MPI rank 1, PID: 11 [Wall time: 1.5]\n\
             Initial field file reading completed [Wall time: 5.0, Rank: 1]\n\
             Initial field file reading completed [Wall time: 4.0, Rank: 0]\n\
             Create new monitor layer [Wall time: 6.0]\n\
             Stopping the solver [Wall time: 20.0, Rank: 0]\n\
             stopping the solver [Wall time: 21.12346, Rank: 1]\n\
             stopping the solver [Wall time: 19.0, Rank: 1]\n\
             stopping the solver [Wall time: 2.0, Rank: 5]\n"
                .as_bytes(),
        )
        .unwrap();
    let t = r.timing(&log);
    assert!(t.global_init_end == 4.0);
    assert!(t.global_solve_start == 6.0);
    assert!(t.window_for(0) == TimingWindow { init_duration: 3.0, solve_duration: 14.0 });
    assert!(t.window_for(1) == TimingWindow { init_duration: 2.5, solve_duration: 15.1235 });
    // No program start and a solve end before the global solve start.
    assert!(t.window_for(5) == TimingWindow { init_duration: 0.0, solve_duration: 0.0 });
    // Unknown ranks get rank 0's window.
    assert!(t.window_for(9) == t.window_for(0));
}

#[test]
fn test_timing_fallbacks() {
    let r = EventReconciler::new().unwrap();
    let log = r
        .parse(
            "This is the MPI rank 0 [Wall time: 1.0]\n\
             Initial field file reading completed [Wall time: 3.0]\n\
             stopping the solver [Wall time: 10.0]\n"
                .as_bytes(),
        )
        .unwrap();
    let t = r.timing(&log);
    // Solve start falls back to init end.
    assert!(t.global_solve_start == 3.0);
    assert!(t.window_for(0) == TimingWindow { init_duration: 2.0, solve_duration: 7.0 });

    let empty = r.timing(&EventLog::default());
    assert!(empty.global_init_end == 0.0 && empty.global_solve_start == 0.0);
    assert!(empty.window_for(0) == TimingWindow::default());
}

#[test]
fn test_missing_and_lossy_log() {
    let dir = tempfile::tempdir().unwrap();
    let r = EventReconciler::new().unwrap();
    let log = r.parse_file(&dir.path().join("nope.log")).unwrap();
    assert!(log.milestones.is_empty() && log.identity.is_empty());

    let p = dir.path().join("solver.log");
    fs::write(&p, b"\xff\xfe garbage\nstopping the solver [Wall time: 2.5]\n").unwrap();
    let log = r.parse_file(&p).unwrap();
    assert!(log.milestones.len() == 1);

    let out = dir.path().join("Events/walltime.csv");
    log.write_csv(&out).unwrap();
    let text = fs::read_to_string(&out).unwrap();
    assert!(text == "WallTime_s,Rank,Event\n2.5,0,stopping the solver\n");
}
