// Error taxonomy for the monitor.  Most of these are not fatal: the caller decides, per variant,
// whether to skip a sample, degrade, warn, or give up on one job.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PerfError {
    /// A monitoring library is missing or failed to initialize.  Degrade, don't abort.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Opening or writing a file failed.  The affected sample is dropped.
    #[error("I/O error on {path}: {source}")]
    TransientIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The process went away between enumeration and reading its details.  Not really an error.
    #[error("process {0} vanished")]
    ProcessVanished(u32),

    /// A control command on a node returned a non-benign exit code.
    #[error("command on {node} failed with exit code {code}")]
    RemoteCommand { node: String, code: i32 },

    /// A job description is missing a required field or has a bad value.  Fatal for that job only.
    #[error("job '{job}': {reason}")]
    Config { job: String, reason: String },

    /// Data in a file we own could not be understood.
    #[error("parse error: {0}")]
    Parse(String),
}

impl PerfError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> PerfError {
        PerfError::TransientIo {
            path: path.into(),
            source,
        }
    }

    pub fn config(job: &str, reason: impl Into<String>) -> PerfError {
        PerfError::Config {
            job: job.to_string(),
            reason: reason.into(),
        }
    }
}
