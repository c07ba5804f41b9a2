// Readers for the handful of /proc files the samplers need.  The root is a parameter so that tests
// can lay out a fake tree.
//
// A pid directory that is gone by the time we read it is reported as ProcessVanished; callers skip
// the pid for the cycle.

use crate::errors::PerfError;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> ProcFs {
        ProcFs::at("/proc")
    }
}

impl ProcFs {
    pub fn at(root: impl Into<PathBuf>) -> ProcFs {
        ProcFs { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All numeric entries of the root, ascending.

    pub fn pids(&self) -> Result<Vec<u32>, PerfError> {
        let entries = fs::read_dir(&self.root).map_err(|e| PerfError::io(&self.root, e))?;
        let mut pids = entries
            .flatten()
            .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse::<u32>().ok()))
            .collect::<Vec<u32>>();
        pids.sort();
        Ok(pids)
    }

    /// The NUL-separated arguments of the process.  Empty for kernel threads.

    pub fn cmdline(&self, pid: u32) -> Result<Vec<String>, PerfError> {
        let bytes = self.read_pid_file(pid, "cmdline")?;
        Ok(bytes
            .split(|b| *b == 0)
            .filter(|a| !a.is_empty())
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect())
    }

    /// utime + stime of the process, in clock ticks.

    pub fn cpu_ticks(&self, pid: u32) -> Result<u64, PerfError> {
        let bytes = self.read_pid_file(pid, "stat")?;
        let text = String::from_utf8_lossy(&bytes);
        parse_stat_ticks(&text)
            .ok_or_else(|| PerfError::Parse(format!("/proc/{pid}/stat: unexpected format")))
    }

    /// VmRSS of the process in KiB, 0 if the process has no user memory.

    pub fn rss_kib(&self, pid: u32) -> Result<u64, PerfError> {
        let bytes = self.read_pid_file(pid, "status")?;
        let text = String::from_utf8_lossy(&bytes);
        Ok(status_field_kib(&text, "VmRSS").unwrap_or(0))
    }

    /// System-wide used memory in MiB: MemTotal less MemAvailable, or less MemFree on kernels that
    /// lack MemAvailable.

    pub fn used_memory_mib(&self) -> Result<f64, PerfError> {
        let path = self.root.join("meminfo");
        let text = fs::read_to_string(&path).map_err(|e| PerfError::io(&path, e))?;
        let total = status_field_kib(&text, "MemTotal")
            .ok_or_else(|| PerfError::Parse("meminfo: no MemTotal".to_string()))?;
        let avail = status_field_kib(&text, "MemAvailable")
            .or_else(|| status_field_kib(&text, "MemFree"))
            .ok_or_else(|| PerfError::Parse("meminfo: no MemAvailable or MemFree".to_string()))?;
        Ok(total.saturating_sub(avail) as f64 / 1024.0)
    }

    fn read_pid_file(&self, pid: u32, name: &str) -> Result<Vec<u8>, PerfError> {
        let path = self.root.join(pid.to_string()).join(name);
        fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => PerfError::ProcessVanished(pid),
            _ if e.raw_os_error() == Some(libc::ESRCH) => PerfError::ProcessVanished(pid),
            _ => PerfError::io(&path, e),
        })
    }
}

// The command name in field 2 can contain spaces and parens, so count fields from the last ')'.
// After it come state (field 3), ..., utime (field 14), stime (field 15).

fn parse_stat_ticks(text: &str) -> Option<u64> {
    let (_, rest) = text.rsplit_once(')')?;
    let fields = rest.split_whitespace().collect::<Vec<&str>>();
    let utime = fields.get(11)?.parse::<u64>().ok()?;
    let stime = fields.get(12)?.parse::<u64>().ok()?;
    Some(utime + stime)
}

// Lines of the form "Name:   12345 kB".

fn status_field_kib(text: &str, name: &str) -> Option<u64> {
    text.lines().find_map(|l| {
        let (key, value) = l.split_once(':')?;
        if key.trim() != name {
            return None;
        }
        value.split_whitespace().next()?.parse::<u64>().ok()
    })
}

/// The kernel's clock tick rate, 100 if it can't be had.

pub fn clock_ticks_per_second() -> u64 {
    // SAFETY: sysconf has no preconditions and no side effects.
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if hz > 0 {
        hz as u64
    } else {
        100
    }
}

#[cfg(test)]
pub(crate) fn write_fake_process(
    root: &Path,
    pid: u32,
    args: &[&str],
    ticks: (u64, u64),
    rss_kib: u64,
) {
    let dir = root.join(pid.to_string());
    fs::create_dir_all(&dir).unwrap();
    let mut cmdline = args.join("\0");
    cmdline.push('\0');
    fs::write(dir.join("cmdline"), cmdline).unwrap();
    let comm = args
        .first()
        .and_then(|a| a.rsplit('/').next())
        .unwrap_or("kthread");
    fs::write(
        dir.join("stat"),
        format!(
            "{pid} ({comm}) S 1 {pid} {pid} 0 -1 4194304 100 0 0 0 {} {} 0 0 20 0 1 0 100 0 0\n",
            ticks.0, ticks.1
        ),
    )
    .unwrap();
    fs::write(
        dir.join("status"),
        format!("Name:\t{comm}\nState:\tS (sleeping)\nVmRSS:\t  {rss_kib} kB\nThreads:\t1\n"),
    )
    .unwrap();
}

#[test]
fn test_parse_stat_ticks() {
    let stat = "4242 (solver (x) y) R 1 4242 4242 0 -1 4194560 5 0 0 0 250 50 0 0 20 0 4 0 9 0 0";
    assert!(parse_stat_ticks(stat) == Some(300));
    assert!(parse_stat_ticks("4242 (short) R 1 2").is_none());
    assert!(parse_stat_ticks("garbage").is_none());
}

#[test]
fn test_proc_readers() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_fake_process(root, 4242, &["/opt/solverX/bin/solve", "-c", "x.json"], (120, 30), 20480);
    fs::create_dir_all(root.join("self")).unwrap();
    fs::write(
        root.join("meminfo"),
        "MemTotal:       16384000 kB\nMemFree:         1000000 kB\nMemAvailable:    8192000 kB\n",
    )
    .unwrap();

    let procfs = ProcFs::at(root);
    assert!(procfs.pids().unwrap() == vec![4242]);
    assert!(procfs.cmdline(4242).unwrap() == vec!["/opt/solverX/bin/solve", "-c", "x.json"]);
    assert!(procfs.cpu_ticks(4242).unwrap() == 150);
    assert!(procfs.rss_kib(4242).unwrap() == 20480);
    assert!(procfs.used_memory_mib().unwrap() == 8000.0);

    assert!(matches!(procfs.cmdline(17), Err(PerfError::ProcessVanished(17))));
    assert!(matches!(procfs.cpu_ticks(17), Err(PerfError::ProcessVanished(17))));
}

#[test]
fn test_meminfo_without_available() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("meminfo"), "MemTotal: 2048 kB\nMemFree: 1024 kB\n").unwrap();
    assert!(ProcFs::at(dir.path()).used_memory_mib().unwrap() == 1.0);
}
