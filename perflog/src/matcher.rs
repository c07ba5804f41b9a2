// Deciding which processes on a node belong to the monitored workload.
//
// There is no registration: every cycle we scan the process table and look at command lines.  The
// policy is a heuristic and is kept in one place, `MatchPolicy`, so that it can be replaced:
//
// - The executable's basename must not be a launcher, a shell, or one of our own tools, and the
//   command line must not mention one of our own tools.  Launchers carry the target's path in their
//   arguments, and the agents carry it in --target-name.
//
// - The executable path must contain `/<target>/` or start with `./<target>`, or the executable
//   must be a Python interpreter whose command line contains `/<target>/`.  All comparisons are
//   case-insensitive.
//
// The agent's own pid never matches, whatever its command line says.

use crate::errors::PerfError;
use crate::procfs::ProcFs;

use tracing::debug;

/// Executable basenames that are never the workload itself.

pub const LAUNCHER_BLACKLIST: &[&str] = &[
    "mpirun",
    "mpiexec",
    "orterun",
    "hydra_pmi_proxy",
    "srun",
    "bash",
    "sh",
    "zsh",
    "csh",
    "tcsh",
    "ssh",
    "sshd",
    "sudo",
    "su",
];

/// The names of this tool's own programs.

pub const SELF_NAMES: &[&str] = &["perfrun", "perf_host_agent", "perf_device_agent"];

#[derive(Clone, Debug)]
pub struct MatchPolicy {
    target: String,
}

impl MatchPolicy {
    pub fn new(target: &str) -> MatchPolicy {
        MatchPolicy {
            target: target.to_lowercase(),
        }
    }

    /// Does the argument vector `args` (argv[0] first) belong to the target?

    pub fn matches(&self, args: &[String]) -> bool {
        let Some(exe) = args.first() else {
            return false;
        };
        if self.target.is_empty() {
            return false;
        }
        let exe = exe.to_lowercase();
        let base = exe.rsplit('/').next().unwrap_or(&exe);
        if LAUNCHER_BLACKLIST.contains(&base) || SELF_NAMES.contains(&base) {
            return false;
        }
        let full = args.join(" ").to_lowercase();
        if SELF_NAMES.iter().any(|n| full.contains(n)) {
            return false;
        }

        let dir_token = format!("/{}/", self.target);
        if exe.contains(&dir_token) || exe.starts_with(&format!("./{}", self.target)) {
            return true;
        }
        is_interpreter(base) && full.contains(&dir_token)
    }
}

fn is_interpreter(base: &str) -> bool {
    base.starts_with("python")
}

pub struct ProcessMatcher {
    procfs: ProcFs,
    policy: MatchPolicy,
    own_pid: u32,
}

impl ProcessMatcher {
    pub fn new(procfs: ProcFs, policy: MatchPolicy) -> ProcessMatcher {
        ProcessMatcher {
            procfs,
            policy,
            own_pid: std::process::id(),
        }
    }

    /// Treat `pid` as our own process.  For tests, where the real pid is not in the fake tree.

    pub fn with_own_pid(mut self, pid: u32) -> ProcessMatcher {
        self.own_pid = pid;
        self
    }

    pub fn own_pid(&self) -> u32 {
        self.own_pid
    }

    pub fn procfs(&self) -> &ProcFs {
        &self.procfs
    }

    /// Whether one process is a target.  Errs with ProcessVanished if it is gone.

    pub fn is_target(&self, pid: u32) -> Result<bool, PerfError> {
        if pid == self.own_pid {
            return Ok(false);
        }
        let args = self.procfs.cmdline(pid)?;
        Ok(self.policy.matches(&args))
    }

    /// All target pids at this moment, ascending.  Processes that exit during the scan, or whose
    /// details can't be read, are left out.

    pub fn targets(&self) -> Result<Vec<u32>, PerfError> {
        let mut found = vec![];
        for pid in self.procfs.pids()? {
            match self.is_target(pid) {
                Ok(true) => found.push(pid),
                Ok(false) => {}
                Err(PerfError::ProcessVanished(_)) => {}
                Err(e) => debug!("Skipping pid {pid}: {e}"),
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
fn argv(s: &str) -> Vec<String> {
    s.split(' ').map(|x| x.to_string()).collect()
}

#[test]
fn test_match_policy() {
    let p = MatchPolicy::new("solverX");
    assert!(p.matches(&argv("/opt/solverX/bin/solve cfg.json")));
    assert!(p.matches(&argv("/OPT/SOLVERX/BIN/SOLVE")));
    assert!(p.matches(&argv("./solverX/solve -n 4")));
    assert!(p.matches(&argv("./solverx_mpi")));
    assert!(p.matches(&argv("/usr/bin/python3 /home/u/solverX/run.py")));

    // Not the target at all.
    assert!(!p.matches(&argv("/usr/bin/top")));
    assert!(!p.matches(&argv("/usr/bin/vim /opt/solverX/cfg.json")));
    assert!(!p.matches(&argv("/opt/solverXY/bin/solve")));
    assert!(!p.matches(&[]));

    // Launchers and shells carry the path in their arguments.
    assert!(!p.matches(&argv("mpirun -np 4 /opt/solverX/bin/solve")));
    assert!(!p.matches(&argv("/usr/bin/bash /opt/solverX/bin/solve")));
    assert!(!p.matches(&argv("/opt/solverX/bash")));

    // Our own agents mention the target.
    assert!(!p.matches(&argv("/opt/solverX/perf_host_agent --target-name solverX")));
    assert!(!p.matches(&argv("/opt/solverX/bin/x perfrun")));
}

#[cfg(test)]
use crate::procfs::write_fake_process;

#[test]
fn test_process_matcher_scan() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_fake_process(root, 10, &["/usr/sbin/sshd"], (0, 0), 0);
    write_fake_process(root, 11, &["mpirun", "-np", "2", "/opt/solverX/bin/solve"], (0, 0), 0);
    write_fake_process(root, 4242, &["/opt/solverX/bin/solve"], (0, 0), 0);
    write_fake_process(root, 4243, &["/opt/solverX/bin/solve"], (0, 0), 0);
    write_fake_process(root, 5000, &["/opt/solverX/bin/solve"], (0, 0), 0);
    // A kernel thread has an empty command line.
    write_fake_process(root, 2, &[], (0, 0), 0);

    let m = ProcessMatcher::new(ProcFs::at(root), MatchPolicy::new("solverx")).with_own_pid(5000);
    assert!(m.targets().unwrap() == vec![4242, 4243]);
    assert!(m.is_target(4242).unwrap());
    assert!(!m.is_target(5000).unwrap());
    assert!(matches!(m.is_target(9999), Err(PerfError::ProcessVanished(9999))));
}
