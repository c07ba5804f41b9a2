// Compacting one process's raw metric files into a single time-aligned table.
//
// The raw files in a subject directory come from two kinds of source:
//
// - host-class sources (proc_cpu_util, proc_mem_rss) are written by the same loop in the same cycle
//   and therefore carry identical timestamps; they are merged by an exact-timestamp inner join.
//
// - device-class sources (gpu<k>) are written by a different agent on its own clock; each row of
//   the base table is paired with the nearest device row, provided the two are within the
//   tolerance.
//   Ties go to the earlier device row.
//
// The base table is the first host-class source by file name, or the first device-class source if
// there are no host-class sources.  After all sources are folded in, rows with a missing value in
// any column are dropped.
//
// The aggregate replaces the raw files.  To never lose data, it is written to a temporary file in
// the same directory, flushed and fsynced, renamed into place, and the directory fsynced; only then
// are the raw files removed.  If we crash after the rename but before the removal, the next run
// finds an aggregate that already holds every row of the leftover raw files and just removes them;
// raw rows the aggregate lacks are folded into it through the same atomic path.

use crate::columns::{order_columns, source_column_name};
use crate::dates::{format_precise, parse_timestamp, Timestamp};

use anyhow::{bail, Result};
use chrono::Duration;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{debug, info, warn};

pub const AGGREGATE_SUFFIX: &str = "_metrics.csv";

pub const DEFAULT_TOLERANCE_MS: i64 = 1000;

/// One raw metric file, parsed.  Rows are sorted by time with duplicate timestamps removed.

#[derive(Clone, Debug)]
pub struct Source {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<(Timestamp, Vec<Option<f64>>)>,
}

impl Source {
    pub fn is_device_class(&self) -> bool {
        self.columns.iter().any(|c| c.to_lowercase().contains("gpu"))
    }
}

/// A merged table: complete rows only, columns in output order.

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergedTable {
    pub columns: Vec<String>,
    pub rows: Vec<(Timestamp, Vec<f64>)>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AggregateSummary {
    pub compacted: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Parse a raw metric file.  Returns None for a file without a header or without a Timestamp
/// column.  Rows with an unparsable timestamp are dropped; values that don't parse are None.  When
/// a timestamp repeats, the first row wins.

pub fn read_source(path: &Path) -> Result<Option<Source>> {
    let stem = match path.file_stem().and_then(|s| s.to_str()) {
        Some(stem) => stem.to_string(),
        None => bail!("Bad file name {}", path.display()),
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    let Some(ts_index) = headers.iter().position(|h| h.trim() == "Timestamp") else {
        return Ok(None);
    };
    let value_indices = (0..headers.len())
        .filter(|i| *i != ts_index)
        .collect::<Vec<usize>>();
    let columns = value_indices
        .iter()
        .map(|i| source_column_name(&stem, headers[*i].trim()))
        .collect::<Vec<String>>();

    let mut seen = HashSet::new();
    let mut rows = vec![];
    for record in reader.records() {
        let record = match record {
            Ok(r) => r,
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(_) => continue,
        };
        let Some(t) = record.get(ts_index).and_then(parse_timestamp) else {
            continue;
        };
        if !seen.insert(t) {
            continue;
        }
        let values = value_indices
            .iter()
            .map(|i| record.get(*i).and_then(|v| v.trim().parse::<f64>().ok()))
            .collect::<Vec<Option<f64>>>();
        rows.push((t, values));
    }
    rows.sort_by_key(|(t, _)| *t);

    Ok(Some(Source {
        name: stem,
        columns,
        rows,
    }))
}

/// Join the sources into one table.  `sources` should be in file-name order.  Returns None if there
/// are no sources.

pub fn merge_sources(sources: Vec<Source>, tolerance_ms: i64) -> Option<MergedTable> {
    let (host, device): (Vec<Source>, Vec<Source>) =
        sources.into_iter().partition(|s| !s.is_device_class());
    let mut host = host.into_iter();
    let mut device = device.into_iter();
    let base = host.next().or_else(|| device.next())?;

    let mut columns = base.columns;
    let mut rows = base.rows;
    for s in host {
        rows = exact_join(rows, &s);
        columns.extend(s.columns);
    }
    let tolerance = Duration::milliseconds(tolerance_ms);
    for s in device {
        rows = nearest_join(rows, &s, tolerance);
        columns.extend(s.columns);
    }

    let complete = rows
        .into_iter()
        .filter_map(|(t, values)| Some((t, values.into_iter().collect::<Option<Vec<f64>>>()?)))
        .collect::<Vec<(Timestamp, Vec<f64>)>>();

    let order = order_columns(&columns);
    Some(MergedTable {
        columns: order.iter().map(|i| columns[*i].clone()).collect(),
        rows: complete
            .into_iter()
            .map(|(t, values)| (t, order.iter().map(|i| values[*i]).collect()))
            .collect(),
    })
}

type Rows = Vec<(Timestamp, Vec<Option<f64>>)>;

fn exact_join(rows: Rows, other: &Source) -> Rows {
    let index = other
        .rows
        .iter()
        .map(|(t, v)| (*t, v))
        .collect::<HashMap<Timestamp, &Vec<Option<f64>>>>();
    rows.into_iter()
        .filter_map(|(t, mut values)| {
            values.extend(index.get(&t)?.iter().copied());
            Some((t, values))
        })
        .collect()
}

fn nearest_join(rows: Rows, other: &Source, tolerance: Duration) -> Rows {
    let width = other.columns.len();
    rows.into_iter()
        .map(|(t, mut values)| {
            match nearest_row(&other.rows, t, tolerance) {
                Some(v) => values.extend(v.iter().copied()),
                None => values.extend(std::iter::repeat(None).take(width)),
            }
            (t, values)
        })
        .collect()
}

// `rows` is sorted by time.
fn nearest_row(rows: &Rows, t: Timestamp, tolerance: Duration) -> Option<&Vec<Option<f64>>> {
    let after = rows.partition_point(|(rt, _)| *rt < t);
    let before = after.checked_sub(1);
    let candidate = match (before, rows.get(after)) {
        (Some(b), Some((at, _))) => {
            if t - rows[b].0 <= *at - t {
                b
            } else {
                after
            }
        }
        (Some(b), None) => b,
        (None, Some(_)) => after,
        (None, None) => return None,
    };
    let (ct, values) = &rows[candidate];
    let distance = if *ct > t { *ct - t } else { t - *ct };
    if distance <= tolerance {
        Some(values)
    } else {
        None
    }
}

/// The aggregate file name for a subject directory: `node1-PID42` -> `node1_PID42_metrics.csv`.

fn aggregate_file_name(dir: &Path) -> String {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}{AGGREGATE_SUFFIX}", name.replace('-', "_"))
}

fn raw_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = vec![];
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if path.is_file() && name.ends_with(".csv") && !name.ends_with(AGGREGATE_SUFFIX) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Compact the raw files in one subject directory.  Returns true if the directory now holds an
/// aggregate that accounts for every readable raw file, false if there was nothing to do or
/// nothing usable.  Raw files that cannot be read are never removed.

pub fn compact_subject(dir: &Path, tolerance_ms: i64) -> Result<bool> {
    let raws = raw_files(dir)?;
    if raws.is_empty() {
        return Ok(false);
    }
    let out_path = dir.join(aggregate_file_name(dir));
    let (sources, consumed) = load_sources(&raws);
    let raw_rows = sources.iter().map(|s| s.rows.len()).sum::<usize>();

    if out_path.exists() {
        return reconcile_with_aggregate(dir, &out_path, sources, &consumed, raw_rows, tolerance_ms);
    }

    let Some(table) = merge_sources(sources, tolerance_ms) else {
        return Ok(false);
    };
    if table.rows.is_empty() {
        warn!("No complete rows in {}, leaving raw files", dir.display());
        return Ok(false);
    }

    write_aggregate(dir, &out_path, &table)?;
    remove_files(&consumed)?;
    Ok(true)
}

// The sources that parsed, and the files that may be removed once they are merged: those that
// parsed and those without a usable header.  Files that fail to read are in neither list.
fn load_sources(raws: &[PathBuf]) -> (Vec<Source>, Vec<PathBuf>) {
    let mut sources = vec![];
    let mut consumed = vec![];
    for path in raws {
        match read_source(path) {
            Ok(Some(source)) => {
                sources.push(source);
                consumed.push(path.clone());
            }
            Ok(None) => {
                debug!("No usable header in {}", path.display());
                consumed.push(path.clone());
            }
            Err(e) => warn!("Skipping {}: {e}", path.display()),
        }
    }
    (sources, consumed)
}

// Raw files next to an existing aggregate.  Either we crashed between writing the aggregate and
// removing the raw files, in which case merging them again yields rows the aggregate already has,
// or they carry rows that are new.  New rows with the aggregate's columns are folded into a
// rewritten aggregate; anything else is left alone.
fn reconcile_with_aggregate(
    dir: &Path,
    out_path: &Path,
    sources: Vec<Source>,
    consumed: &[PathBuf],
    raw_rows: usize,
    tolerance_ms: i64,
) -> Result<bool> {
    let existing = read_merged(out_path)?;
    let Some(table) = merge_sources(sources, tolerance_ms) else {
        remove_files(consumed)?;
        return Ok(!consumed.is_empty());
    };
    if table.rows.is_empty() {
        if raw_rows > 0 {
            warn!("No complete rows in the raw files of {}, leaving them", dir.display());
            return Ok(false);
        }
        remove_files(consumed)?;
        return Ok(true);
    }

    let Some(positions) = table
        .columns
        .iter()
        .map(|c| existing.columns.iter().position(|e| e == c))
        .collect::<Option<Vec<usize>>>()
    else {
        bail!(
            "{} exists but lacks columns of the raw files next to it",
            out_path.display()
        );
    };
    let have = existing
        .rows
        .iter()
        .map(|(t, v)| (*t, v))
        .collect::<HashMap<Timestamp, &Vec<f64>>>();

    let mut fresh = vec![];
    for (t, values) in table.rows {
        match have.get(&t) {
            Some(row) if positions.iter().zip(&values).all(|(p, v)| row[*p] == *v) => {}
            Some(_) => bail!(
                "{} disagrees with the raw files next to it at {}",
                out_path.display(),
                format_precise(&t)
            ),
            None => fresh.push((t, values)),
        }
    }

    if fresh.is_empty() {
        info!("Removing raw files already merged into {}", out_path.display());
    } else {
        if table.columns != existing.columns {
            bail!(
                "Raw files next to {} hold {} new rows without all of its columns",
                out_path.display(),
                fresh.len()
            );
        }
        info!("Folding {} new rows into {}", fresh.len(), out_path.display());
        let mut folded = existing;
        folded.rows.extend(fresh);
        folded.rows.sort_by_key(|(t, _)| *t);
        write_aggregate(dir, out_path, &folded)?;
    }
    remove_files(consumed)?;
    Ok(true)
}

// Read back an aggregate we wrote.
fn read_merged(path: &Path) -> Result<MergedTable> {
    let mut reader = csv::ReaderBuilder::new().from_path(path)?;
    let headers = reader.headers()?.clone();
    let columns = headers.iter().skip(1).map(|h| h.to_string()).collect::<Vec<String>>();
    let mut rows = vec![];
    for record in reader.records() {
        let record = record?;
        let Some(t) = record.get(0).and_then(parse_timestamp) else {
            bail!("Bad timestamp in {}", path.display());
        };
        let values = record
            .iter()
            .skip(1)
            .map(|v| v.trim().parse::<f64>())
            .collect::<Result<Vec<f64>, _>>()?;
        if values.len() != columns.len() {
            bail!("Short row in {}", path.display());
        }
        rows.push((t, values));
    }
    Ok(MergedTable { columns, rows })
}

fn write_aggregate(dir: &Path, out_path: &Path, table: &MergedTable) -> Result<()> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".aggregate")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    {
        let mut writer = csv::Writer::from_writer(tmp.as_file_mut());
        let mut header = vec!["Timestamp".to_string()];
        header.extend(table.columns.iter().cloned());
        writer.write_record(&header)?;
        for (t, values) in &table.rows {
            let mut record = vec![format_precise(t)];
            record.extend(values.iter().map(|v| v.to_string()));
            writer.write_record(&record)?;
        }
        writer.flush()?;
    }
    tmp.as_file_mut().flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(out_path)?;
    File::open(dir)?.sync_all()?;
    Ok(())
}

fn remove_files(paths: &[PathBuf]) -> Result<()> {
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Every `<root>/<node>/*PID*` directory, sorted.

pub fn subject_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = vec![];
    for node in fs::read_dir(root)? {
        let node = node?.path();
        if !node.is_dir() {
            continue;
        }
        for subject in fs::read_dir(&node)? {
            let subject = subject?.path();
            let is_subject = subject
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains("PID"));
            if subject.is_dir() && is_subject {
                dirs.push(subject);
            }
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Compact every `<root>/<node>/*PID*` directory.  Directories are independent and are processed
/// in parallel; a failure in one is logged and counted and does not affect the others.

pub fn aggregate_tree(root: &Path, tolerance_ms: i64) -> Result<AggregateSummary> {
    if !root.is_dir() {
        bail!("No time-series tree at {}", root.display());
    }
    let dirs = subject_dirs(root)?;
    let width = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);

    let mut summary = AggregateSummary::default();
    for chunk in dirs.chunks(width) {
        let results = thread::scope(|s| {
            let handles = chunk
                .iter()
                .map(|dir| s.spawn(move || compact_subject(dir, tolerance_ms)))
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .zip(chunk)
                .map(|(h, dir)| match h.join() {
                    Ok(r) => r,
                    Err(_) => Err(anyhow::anyhow!("Aggregation of {} panicked", dir.display())),
                })
                .collect::<Vec<Result<bool>>>()
        });
        for (result, dir) in results.into_iter().zip(chunk) {
            match result {
                Ok(true) => summary.compacted += 1,
                Ok(false) => summary.skipped += 1,
                Err(e) => {
                    warn!("Aggregating {}: {e}", dir.display());
                    summary.failed += 1;
                }
            }
        }
    }
    info!(
        compacted = summary.compacted,
        skipped = summary.skipped,
        failed = summary.failed,
        "Aggregated {}",
        root.display()
    );
    Ok(summary)
}

#[cfg(test)]
fn at(s: &str) -> Timestamp {
    parse_timestamp(s).unwrap()
}

#[cfg(test)]
fn source(name: &str, columns: &[&str], rows: &[(&str, &[f64])]) -> Source {
    Source {
        name: name.to_string(),
        columns: columns.iter().map(|c| c.to_string()).collect(),
        rows: rows
            .iter()
            .map(|(t, v)| (at(t), v.iter().map(|x| Some(*x)).collect()))
            .collect(),
    }
}

#[test]
fn test_tolerance_join() {
    let host = source(
        "proc_cpu_util",
        &["proc_cpu_util"],
        &[("2024-01-01 00:00:10.000", &[50.0]), ("2024-01-01 00:00:14.000", &[60.0])],
    );
    let gpu = source(
        "gpu0",
        &["gpu0_Memory(MiB)", "gpu0_Util(%)"],
        &[("2024-01-01 00:00:10.900", &[512.0, 90.0]), ("2024-01-01 00:00:12.500", &[640.0, 95.0])],
    );
    let table = merge_sources(vec![gpu, host], DEFAULT_TOLERANCE_MS).unwrap();
    assert!(table.columns == vec!["proc_cpu_util", "gpu0_Memory(MiB)", "gpu0_Util(%)"]);
    // 10.0 pairs with 10.9; 14.0 is 1.5s from 12.5 and is dropped.
    assert!(table.rows == vec![(at("2024-01-01 00:00:10"), vec![50.0, 512.0, 90.0])]);
}

#[test]
fn test_nearest_join_prefers_earlier_on_tie() {
    let host = source("proc_cpu_util", &["proc_cpu_util"], &[("2024-01-01 00:00:10", &[1.0])]);
    let gpu = source(
        "gpu0",
        &["gpu0_Util(%)"],
        &[("2024-01-01 00:00:09.500", &[10.0]), ("2024-01-01 00:00:10.500", &[20.0])],
    );
    let table = merge_sources(vec![host, gpu], DEFAULT_TOLERANCE_MS).unwrap();
    assert!(table.rows[0].1 == vec![1.0, 10.0]);
}

#[test]
fn test_exact_join_and_device_base() {
    let cpu = source(
        "proc_cpu_util",
        &["proc_cpu_util"],
        &[("2024-01-01 00:00:01", &[1.0]), ("2024-01-01 00:00:02", &[2.0])],
    );
    let rss = source("proc_mem_rss", &["proc_mem_rss"], &[("2024-01-01 00:00:02", &[2048.0])]);
    let table = merge_sources(vec![cpu, rss], DEFAULT_TOLERANCE_MS).unwrap();
    assert!(table.rows == vec![(at("2024-01-01 00:00:02"), vec![2.0, 2048.0])]);

    // Without host sources the first GPU file is the base.
    let g1 = source("gpu1", &["gpu1_Util(%)"], &[("2024-01-01 00:00:05", &[7.0])]);
    let g0 = source("gpu0", &["gpu0_Util(%)"], &[("2024-01-01 00:00:05.400", &[3.0])]);
    let table = merge_sources(vec![g0, g1], DEFAULT_TOLERANCE_MS).unwrap();
    assert!(table.columns == vec!["gpu0_Util(%)", "gpu1_Util(%)"]);
    assert!(table.rows == vec![(at("2024-01-01 00:00:05.400"), vec![3.0, 7.0])]);

    assert!(merge_sources(vec![], DEFAULT_TOLERANCE_MS).is_none());
}

#[test]
fn test_read_source() {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("gpu0.csv");
    fs::write(
        &p,
        "Timestamp,Memory(MiB),Util(%),Power(W)\n\
         2024-01-01 00:00:02,10.0,50,100.0\n\
         2024-01-01 00:00:01,5.0,x,90.0\n\
         2024-01-01 00:00:02,99.0,99,99.0\n\
         garbage,1,2,3\n",
    )
    .unwrap();
    let s = read_source(&p).unwrap().unwrap();
    assert!(s.is_device_class());
    assert!(s.columns == vec!["gpu0_Memory(MiB)", "gpu0_Util(%)", "gpu0_Power(W)"]);
    assert!(s.rows.len() == 2);
    assert!(s.rows[0] == (at("2024-01-01 00:00:01"), vec![Some(5.0), None, Some(90.0)]));
    assert!(s.rows[1] == (at("2024-01-01 00:00:02"), vec![Some(10.0), Some(50.0), Some(100.0)]));

    let empty = dir.path().join("proc_cpu_util.csv");
    fs::write(&empty, "").unwrap();
    assert!(read_source(&empty).unwrap().is_none());
}

#[cfg(test)]
fn write_subject(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    fs::write(
        dir.join("proc_cpu_util.csv"),
        "Timestamp,Value\n2024-01-01 00:00:01,10.0\n2024-01-01 00:00:02,20.0\n",
    )
    .unwrap();
    fs::write(
        dir.join("proc_mem_rss.csv"),
        "Timestamp,Value\n2024-01-01 00:00:01,1024\n2024-01-01 00:00:02,2048\n",
    )
    .unwrap();
    fs::write(
        dir.join("gpu0.csv"),
        "Timestamp,Memory(MiB),Util(%),Power(W)\n2024-01-01 00:00:02,512.0,80,200.5\n",
    )
    .unwrap();
}

#[test]
fn test_compact_subject() {
    let dir = tempfile::tempdir().unwrap();
    let subject = dir.path().join("node-1-PID42");
    write_subject(&subject);

    assert!(compact_subject(&subject, DEFAULT_TOLERANCE_MS).unwrap());
    let names = fs::read_dir(&subject)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect::<Vec<String>>();
    assert!(names == vec!["node_1_PID42_metrics.csv".to_string()]);

    let text = fs::read_to_string(subject.join("node_1_PID42_metrics.csv")).unwrap();
    let lines = text.lines().collect::<Vec<&str>>();
    assert!(
        lines[0]
            == "Timestamp,proc_cpu_util,proc_mem_rss,gpu0_Memory(MiB),gpu0_Util(%),gpu0_Power(W)"
    );
    assert!(lines[1] == "2024-01-01 00:00:01,10,1024,512,80,200.5");
    assert!(lines[2] == "2024-01-01 00:00:02,20,2048,512,80,200.5");

    // Nothing left to do the second time around.
    assert!(!compact_subject(&subject, DEFAULT_TOLERANCE_MS).unwrap());
}

#[test]
fn test_compact_recovers_after_crash() {
    let dir = tempfile::tempdir().unwrap();
    let subject = dir.path().join("n1-PID7");
    write_subject(&subject);
    assert!(compact_subject(&subject, DEFAULT_TOLERANCE_MS).unwrap());
    let merged = fs::read_to_string(subject.join("n1_PID7_metrics.csv")).unwrap();

    // Simulate a crash between rename and removal: the raw files reappear.
    write_subject(&subject);
    assert!(compact_subject(&subject, DEFAULT_TOLERANCE_MS).unwrap());
    assert!(!subject.join("proc_cpu_util.csv").exists());
    assert!(fs::read_to_string(subject.join("n1_PID7_metrics.csv")).unwrap() == merged);

    // A raw file with a column the aggregate lacks is not deleted.
    fs::write(subject.join("gpu3.csv"), "Timestamp,Util(%)\n2024-01-01 00:00:01,5\n").unwrap();
    assert!(compact_subject(&subject, DEFAULT_TOLERANCE_MS).is_err());
    assert!(subject.join("gpu3.csv").exists());
}

#[cfg(test)]
fn write_late_host_rows(dir: &Path) {
    fs::write(
        dir.join("proc_cpu_util.csv"),
        "Timestamp,Value\n2024-01-01 00:09:00,77\n",
    )
    .unwrap();
    fs::write(
        dir.join("proc_mem_rss.csv"),
        "Timestamp,Value\n2024-01-01 00:09:00,4096\n",
    )
    .unwrap();
}

#[test]
fn test_compact_folds_late_rows_into_aggregate() {
    let dir = tempfile::tempdir().unwrap();
    let subject = dir.path().join("n1-PID7");
    write_subject(&subject);
    assert!(compact_subject(&subject, DEFAULT_TOLERANCE_MS).unwrap());

    write_late_host_rows(&subject);
    fs::write(
        subject.join("gpu0.csv"),
        "Timestamp,Memory(MiB),Util(%),Power(W)\n2024-01-01 00:09:00.200,600,81,201.5\n",
    )
    .unwrap();
    assert!(compact_subject(&subject, DEFAULT_TOLERANCE_MS).unwrap());
    assert!(!subject.join("proc_cpu_util.csv").exists());
    let text = fs::read_to_string(subject.join("n1_PID7_metrics.csv")).unwrap();
    let lines = text.lines().collect::<Vec<&str>>();
    assert!(lines.len() == 4);
    assert!(lines[1] == "2024-01-01 00:00:01,10,1024,512,80,200.5");
    assert!(lines[3] == "2024-01-01 00:09:00,77,4096,600,81,201.5");
}

#[test]
fn test_compact_keeps_raw_rows_missing_from_aggregate() {
    let dir = tempfile::tempdir().unwrap();
    let subject = dir.path().join("n1-PID7");
    write_subject(&subject);
    assert!(compact_subject(&subject, DEFAULT_TOLERANCE_MS).unwrap());
    let merged = fs::read_to_string(subject.join("n1_PID7_metrics.csv")).unwrap();

    // New host rows without the GPU columns cannot be folded in, and must not be lost.
    write_late_host_rows(&subject);
    assert!(compact_subject(&subject, DEFAULT_TOLERANCE_MS).is_err());
    assert!(subject.join("proc_cpu_util.csv").exists());
    assert!(subject.join("proc_mem_rss.csv").exists());
    assert!(fs::read_to_string(subject.join("n1_PID7_metrics.csv")).unwrap() == merged);

    // Host and GPU rows too far apart to join are left as they are.
    fs::write(
        subject.join("gpu0.csv"),
        "Timestamp,Memory(MiB),Util(%),Power(W)\n2024-01-01 00:19:00,600,81,201.5\n",
    )
    .unwrap();
    assert!(!compact_subject(&subject, DEFAULT_TOLERANCE_MS).unwrap());
    assert!(subject.join("proc_cpu_util.csv").exists());
    assert!(subject.join("gpu0.csv").exists());
}

#[test]
fn test_compact_keeps_unreadable_raw_files() {
    let dir = tempfile::tempdir().unwrap();
    let subject = dir.path().join("n1-PID7");
    write_subject(&subject);
    assert!(compact_subject(&subject, DEFAULT_TOLERANCE_MS).unwrap());

    fs::write(subject.join("gpu3.csv"), b"Timestamp,\xff\xfe\n2024-01-01 00:00:01,5\n").unwrap();
    assert!(read_source(&subject.join("gpu3.csv")).is_err());
    assert!(!compact_subject(&subject, DEFAULT_TOLERANCE_MS).unwrap());
    assert!(subject.join("gpu3.csv").exists());

    // Nor are they removed when they sit next to files that do get compacted.
    let other = dir.path().join("n1-PID8");
    write_subject(&other);
    fs::write(other.join("gpu3.csv"), b"Timestamp,\xff\xfe\n2024-01-01 00:00:01,5\n").unwrap();
    assert!(compact_subject(&other, DEFAULT_TOLERANCE_MS).unwrap());
    assert!(other.join("gpu3.csv").exists());
    assert!(!other.join("gpu0.csv").exists());
}

#[test]
fn test_aggregate_tree() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_subject(&root.join("n1/n1-PID1"));
    write_subject(&root.join("n1/n1-PID2"));
    write_subject(&root.join("n2/n2-PID3"));
    // A subject whose only file has a header and no rows has nothing to merge.
    fs::create_dir_all(root.join("n2/n2-PID4")).unwrap();
    fs::write(root.join("n2/n2-PID4/proc_cpu_util.csv"), "Timestamp,Value\n").unwrap();
    fs::write(
        root.join("n2/system_memory.csv"),
        "Timestamp,Value\n2024-01-01 00:00:01,1.0\n",
    )
    .unwrap();

    let summary = aggregate_tree(root, DEFAULT_TOLERANCE_MS).unwrap();
    assert!(summary == AggregateSummary { compacted: 3, skipped: 1, failed: 0 });
    assert!(root.join("n2/n2-PID3/n2_PID3_metrics.csv").is_file());
    assert!(root.join("n2/system_memory.csv").is_file());

    assert!(aggregate_tree(&root.join("missing"), DEFAULT_TOLERANCE_MS).is_err());
}
