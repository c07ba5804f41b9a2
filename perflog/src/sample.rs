// A sample is one row of one metric file.  The kind determines the file name, the header, and how
// the values are printed; the subject determines the directory.

use crate::dates::{format_timestamp, Timestamp};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Subject {
    /// Node-wide metrics, stored directly in the node directory.
    Node,
    /// Per-process metrics, stored in the process's subject directory.
    Pid(u32),
}

#[derive(Clone, Debug, PartialEq)]
pub enum MetricKind {
    /// Used system memory, MiB.
    SystemMemory,

    /// Receive and transmit rates, MiB/s, for each of the named interfaces in order.  The set of
    /// interfaces is fixed when the agent starts.
    Network(Arc<[String]>),

    /// CPU utilization of one process, percent of one core.
    ProcCpuUtil,

    /// Resident set size of one process, KiB.
    ProcMemRss,

    /// Device memory (MiB), utilization (%) and power (W) for a process on the GPU with this index.
    Gpu(u32),
}

impl MetricKind {
    pub fn file_name(&self) -> String {
        match self {
            MetricKind::SystemMemory => "system_memory.csv".to_string(),
            MetricKind::Network(_) => "network_metrics.csv".to_string(),
            MetricKind::ProcCpuUtil => "proc_cpu_util.csv".to_string(),
            MetricKind::ProcMemRss => "proc_mem_rss.csv".to_string(),
            MetricKind::Gpu(index) => format!("gpu{index}.csv"),
        }
    }

    pub fn header(&self) -> String {
        match self {
            MetricKind::Network(keys) => {
                let mut header = "Timestamp".to_string();
                for key in keys.iter() {
                    header += &format!(",{key}_Rx_MBps,{key}_Tx_MBps");
                }
                header
            }
            MetricKind::Gpu(_) => "Timestamp,Memory(MiB),Util(%),Power(W)".to_string(),
            _ => "Timestamp,Value".to_string(),
        }
    }

    /// Format the values of a row, without the timestamp.

    pub fn format_fields(&self, fields: &[f64]) -> String {
        match self {
            MetricKind::SystemMemory | MetricKind::ProcCpuUtil => {
                join(fields, |v| format!("{v:.1}"))
            }
            MetricKind::ProcMemRss => join(fields, |v| format!("{v:.0}")),
            MetricKind::Network(_) => join(fields, |v| format!("{v:.4}")),
            MetricKind::Gpu(_) => fields
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    if i == 1 {
                        format!("{v:.0}")
                    } else {
                        format!("{v:.1}")
                    }
                })
                .collect::<Vec<String>>()
                .join(","),
        }
    }
}

fn join(fields: &[f64], f: impl Fn(&f64) -> String) -> String {
    fields.iter().map(f).collect::<Vec<String>>().join(",")
}

/// One row destined for one metric file.  Immutable once built.

#[derive(Clone, Debug)]
pub struct MetricSample {
    pub timestamp: Timestamp,
    pub subject: Subject,
    pub kind: MetricKind,
    pub fields: Vec<f64>,
}

impl MetricSample {
    pub fn new(
        timestamp: Timestamp,
        subject: Subject,
        kind: MetricKind,
        fields: Vec<f64>,
    ) -> MetricSample {
        MetricSample {
            timestamp,
            subject,
            kind,
            fields,
        }
    }

    /// The file this sample belongs in, below `node_dir` (which is `<root>/<node>`).

    pub fn path_in(&self, node_dir: &Path, node: &str) -> PathBuf {
        match self.subject {
            Subject::Node => node_dir.join(self.kind.file_name()),
            Subject::Pid(pid) => node_dir
                .join(subject_dir_name(node, pid))
                .join(self.kind.file_name()),
        }
    }

    /// The data row, with its line terminator.

    pub fn line(&self) -> String {
        format!(
            "{},{}\n",
            format_timestamp(&self.timestamp),
            self.kind.format_fields(&self.fields)
        )
    }
}

/// The directory name for a process's metrics: `<node>-PID<pid>`.

pub fn subject_dir_name(node: &str, pid: u32) -> String {
    format!("{node}-PID{pid}")
}

#[test]
fn test_metric_kind_files() {
    assert!(MetricKind::Gpu(3).file_name() == "gpu3.csv");
    assert!(MetricKind::Gpu(3).header() == "Timestamp,Memory(MiB),Util(%),Power(W)");
    assert!(MetricKind::SystemMemory.header() == "Timestamp,Value");
    assert!(MetricKind::ProcMemRss.header() == "Timestamp,Value");

    let keys: Arc<[String]> = vec!["IB_mlx5_0_port1".to_string(), "ETH_eno1".to_string()].into();
    assert!(
        MetricKind::Network(keys).header()
            == "Timestamp,IB_mlx5_0_port1_Rx_MBps,IB_mlx5_0_port1_Tx_MBps,\
                ETH_eno1_Rx_MBps,ETH_eno1_Tx_MBps"
    );
}

#[test]
fn test_sample_line_and_path() {
    let t = chrono::NaiveDate::from_ymd_opt(2024, 1, 2)
        .unwrap()
        .and_hms_opt(3, 4, 5)
        .unwrap();
    let fields = vec![1023.94, 87.0, 250.31];
    let s = MetricSample::new(t, Subject::Pid(4242), MetricKind::Gpu(0), fields);
    assert!(s.line() == "2024-01-02 03:04:05,1023.9,87,250.3\n");
    assert!(
        s.path_in(Path::new("/r/n1"), "n1") == PathBuf::from("/r/n1/n1-PID4242/gpu0.csv")
    );

    let s = MetricSample::new(t, Subject::Node, MetricKind::SystemMemory, vec![2048.26]);
    assert!(s.line() == "2024-01-02 03:04:05,2048.3\n");
    assert!(s.path_in(Path::new("/r/n1"), "n1") == PathBuf::from("/r/n1/system_memory.csv"));
}
