// The durable writer owns every metric file an agent writes.
//
// Producers (the sampling loop, or several threads in tests) hold a `SampleSink` and enqueue rows;
// they never touch a file.  One consumer thread drains the queue in FIFO order, keeps at most one
// open handle per path, creates directories when a path is first written, and writes the header
// when, and only when, the file is empty at the time it is opened.  Whenever the queue runs dry the
// consumer flushes its buffers, so an idle agent has nothing sitting in memory.
//
// `close` enqueues a sentinel behind everything already queued, waits for the consumer to reach it,
// and then flushes and fsyncs every handle.  Rows queued before `close` are therefore on disk when
// it returns.  A SIGKILL before that point can lose buffered rows; nothing here tries to hide that.
//
// A row whose file cannot be opened or written is dropped and counted.  The handle is discarded so
// that the next row for the same path retries the open.  A row counts as written only once a flush
// of its handle has succeeded; rows buffered in a handle whose flush fails are counted as dropped.

use crate::errors::PerfError;
use crate::sample::MetricSample;

use anyhow::{anyhow, Result};
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

enum Message {
    Row {
        path: PathBuf,
        header: String,
        line: String,
    },
    Close,
}

// An open metric file and the number of rows buffered since its last successful flush.
struct OpenFile {
    w: BufWriter<File>,
    pending: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub rows_written: u64,
    pub rows_dropped: u64,
    pub files: usize,
}

/// A cloneable producer handle.  `write` only enqueues and never blocks on I/O.

#[derive(Clone)]
pub struct SampleSink {
    node_dir: PathBuf,
    node: String,
    sender: Sender<Message>,
}

impl SampleSink {
    pub fn write(&self, sample: &MetricSample) {
        let msg = Message::Row {
            path: sample.path_in(&self.node_dir, &self.node),
            header: sample.kind.header(),
            line: sample.line(),
        };
        // Only fails once the consumer is gone, ie after close.
        if self.sender.send(msg).is_err() {
            debug!("Sample for {} discarded after close", self.node);
        }
    }
}

pub struct DurableWriter {
    sink: SampleSink,
    consumer: Option<JoinHandle<WriterStats>>,
}

impl DurableWriter {
    /// Create a writer for files below `<root>/<node>`.  Nothing is created on disk until the first
    /// row arrives.

    pub fn new(root: &Path, node: &str) -> Result<DurableWriter> {
        let (sender, receiver) = channel::unbounded();
        let consumer = thread::Builder::new()
            .name("metric-writer".to_string())
            .spawn(move || consume(receiver))?;
        Ok(DurableWriter {
            sink: SampleSink {
                node_dir: root.join(node),
                node: node.to_string(),
                sender,
            },
            consumer: Some(consumer),
        })
    }

    pub fn sink(&self) -> SampleSink {
        self.sink.clone()
    }

    pub fn write(&self, sample: &MetricSample) {
        self.sink.write(sample)
    }

    /// Drain the queue, then flush, fsync and close every file.  Returns what was written.

    pub fn close(mut self) -> Result<WriterStats> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<WriterStats> {
        let Some(consumer) = self.consumer.take() else {
            return Ok(WriterStats::default());
        };
        // If the consumer has died the send fails and join reports why.
        let _ = self.sink.sender.send(Message::Close);
        consumer
            .join()
            .map_err(|_| anyhow!("Metric writer thread panicked"))
    }
}

impl Drop for DurableWriter {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Closing metric writer: {e}");
        }
    }
}

fn consume(receiver: Receiver<Message>) -> WriterStats {
    let mut files: HashMap<PathBuf, OpenFile> = HashMap::new();
    let mut stats = WriterStats::default();
    loop {
        let msg = match receiver.try_recv() {
            Ok(msg) => msg,
            Err(TryRecvError::Empty) => {
                flush_all(&mut files, &mut stats);
                match receiver.recv() {
                    Ok(msg) => msg,
                    Err(_) => break,
                }
            }
            Err(TryRecvError::Disconnected) => break,
        };
        match msg {
            Message::Close => break,
            Message::Row { path, header, line } => {
                if let Err((e, lost)) = append(&mut files, &path, &header, &line) {
                    warn!("Dropping sample: {e}");
                    stats.rows_dropped += lost;
                }
            }
        }
    }

    stats.files = files.len();
    for (path, mut f) in files.drain() {
        match f.w.flush().and_then(|_| f.w.get_ref().sync_all()) {
            Ok(()) => stats.rows_written += f.pending,
            Err(e) => {
                warn!("Final flush of {}: {e}", path.display());
                stats.rows_dropped += f.pending;
            }
        }
    }
    stats
}

// On failure, also returns the number of rows lost: this one and any still buffered.
fn append(
    files: &mut HashMap<PathBuf, OpenFile>,
    path: &Path,
    header: &str,
    line: &str,
) -> Result<(), (PerfError, u64)> {
    if !files.contains_key(path) {
        let w = open_metric_file(path, header).map_err(|e| (PerfError::io(path, e), 1))?;
        files.insert(path.to_path_buf(), OpenFile { w, pending: 0 });
    }
    let Some(f) = files.get_mut(path) else {
        return Ok(());
    };
    if let Err(e) = f.w.write_all(line.as_bytes()) {
        let lost = f.pending + 1;
        files.remove(path);
        return Err((PerfError::io(path, e), lost));
    }
    f.pending += 1;
    Ok(())
}

fn open_metric_file(path: &Path, header: &str) -> std::io::Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let empty = file.metadata()?.len() == 0;
    let mut w = BufWriter::new(file);
    if empty {
        w.write_all(header.as_bytes())?;
        w.write_all(b"\n")?;
    }
    Ok(w)
}

fn flush_all(files: &mut HashMap<PathBuf, OpenFile>, stats: &mut WriterStats) {
    let mut failed = vec![];
    for (path, f) in files.iter_mut() {
        match f.w.flush() {
            Ok(()) => stats.rows_written += f.pending,
            Err(e) => {
                warn!("Flushing {}: {e}", path.display());
                stats.rows_dropped += f.pending;
                failed.push(path.clone());
            }
        }
        f.pending = 0;
    }
    for path in failed {
        files.remove(&path);
    }
}

#[cfg(test)]
use crate::sample::{MetricKind, Subject};

#[cfg(test)]
fn sample_at(second: u32, subject: Subject, kind: MetricKind, value: f64) -> MetricSample {
    let t = chrono::NaiveDate::from_ymd_opt(2024, 5, 6)
        .unwrap()
        .and_hms_opt(12, second / 60, second % 60)
        .unwrap();
    MetricSample::new(t, subject, kind, vec![value])
}

#[test]
fn test_header_written_once_under_concurrent_producers() {
    let dir = tempfile::tempdir().unwrap();
    let writer = DurableWriter::new(dir.path(), "n1").unwrap();
    thread::scope(|s| {
        for k in 0..4 {
            let sink = writer.sink();
            s.spawn(move || {
                for i in 0..50 {
                    sink.write(&sample_at(i, Subject::Pid(7), MetricKind::ProcCpuUtil, k as f64));
                }
            });
        }
    });
    let stats = writer.close().unwrap();
    assert!(stats.rows_written == 200);
    assert!(stats.rows_dropped == 0);
    assert!(stats.files == 1);

    let text = fs::read_to_string(dir.path().join("n1/n1-PID7/proc_cpu_util.csv")).unwrap();
    let lines = text.lines().collect::<Vec<&str>>();
    assert!(lines.len() == 201);
    assert!(lines[0] == "Timestamp,Value");
    assert!(lines.iter().filter(|l| l.starts_with("Timestamp")).count() == 1);
}

#[test]
fn test_rows_survive_close_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let writer = DurableWriter::new(dir.path(), "n1").unwrap();
    for i in 0..37 {
        writer.write(&sample_at(i, Subject::Node, MetricKind::SystemMemory, 1000.0 + i as f64));
    }
    let stats = writer.close().unwrap();
    assert!(stats.rows_written == 37);

    // A second agent appending to the same file must not repeat the header.
    let writer = DurableWriter::new(dir.path(), "n1").unwrap();
    writer.write(&sample_at(40, Subject::Node, MetricKind::SystemMemory, 5.0));
    writer.close().unwrap();

    let text = fs::read_to_string(dir.path().join("n1/system_memory.csv")).unwrap();
    let lines = text.lines().collect::<Vec<&str>>();
    assert!(lines.len() == 39);
    assert!(lines[1] == "2024-05-06 12:00:00,1000.0");
    assert!(lines[38] == "2024-05-06 12:00:40,5.0");
    assert!(lines.iter().filter(|l| l.starts_with("Timestamp")).count() == 1);
}

#[test]
fn test_unwritable_path_drops_rows() {
    let dir = tempfile::tempdir().unwrap();
    // The node directory is a plain file, so nothing below it can be created.
    fs::write(dir.path().join("n1"), "not a directory").unwrap();
    let writer = DurableWriter::new(dir.path(), "n1").unwrap();
    writer.write(&sample_at(1, Subject::Node, MetricKind::SystemMemory, 1.0));
    writer.write(&sample_at(2, Subject::Pid(3), MetricKind::ProcMemRss, 1.0));
    let stats = writer.close().unwrap();
    assert!(stats.rows_written == 0);
    assert!(stats.rows_dropped == 2);
    assert!(stats.files == 0);
}

#[test]
fn test_failed_flush_counts_rows_as_dropped() {
    let full = Path::new("/dev/full");
    if !full.exists() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    // Writes to /dev/full are buffered fine and fail with ENOSPC when flushed.
    fs::create_dir_all(dir.path().join("n1/n1-PID3")).unwrap();
    std::os::unix::fs::symlink(full, dir.path().join("n1/n1-PID3/proc_mem_rss.csv")).unwrap();

    let writer = DurableWriter::new(dir.path(), "n1").unwrap();
    for i in 0..3 {
        writer.write(&sample_at(i, Subject::Pid(3), MetricKind::ProcMemRss, 1.0));
    }
    for i in 0..2 {
        writer.write(&sample_at(i, Subject::Node, MetricKind::SystemMemory, 1.0));
    }
    let stats = writer.close().unwrap();
    assert!(stats.rows_written == 2);
    assert!(stats.rows_dropped == 3);
    let text = fs::read_to_string(dir.path().join("n1/system_memory.csv")).unwrap();
    assert!(text.lines().count() == 3);
}
