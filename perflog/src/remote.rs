// Running commands on cluster nodes.
//
// The orchestrator needs two shapes of command: a blocking one whose exit code matters (stopping
// agents, creating directories, cleaning up), and a fire-and-forget one that must outlive us
// (starting agents).  Nodes that name this machine run through bash directly; other nodes go over
// ssh in batch mode.
//
// Exit codes: a process killed by a signal reports -<signo>.  Codes the caller lists as benign are
// reported as 0.  Failing to run the command at all is -1 and a timeout is 124, as for timeout(1).

use crate::sampler::hostname;

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Read;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const TIMED_OUT: i32 = 124;
const POLL: Duration = Duration::from_millis(20);

pub trait Executor: Send + Sync {
    fn is_local(&self, node: &str) -> bool;

    /// Run `command` through a shell on `node` and wait for it, at most `timeout` if given.
    fn run(
        &self,
        node: &str,
        command: &str,
        timeout: Option<Duration>,
        ignore_codes: &[i32],
    ) -> i32;

    /// Start `command` on `node` in the background, detached from this process and its session,
    /// with stdout and stderr going to `log_file` on that node.
    fn run_detached(&self, node: &str, command: &str, log_file: &Path);

    /// True if commands are only logged, not run.
    fn dry_run(&self) -> bool {
        false
    }
}

pub struct ShellExecutor {
    local_names: HashSet<String>,
    dry_run: bool,
}

impl ShellExecutor {
    pub fn new(dry_run: bool) -> ShellExecutor {
        let mut local_names = HashSet::from(["localhost".to_string(), "127.0.0.1".to_string()]);
        local_names.insert(hostname());
        ShellExecutor {
            local_names,
            dry_run,
        }
    }

    fn command_for(&self, node: &str, command: &str) -> Command {
        if self.is_local(node) {
            let mut c = Command::new("bash");
            c.arg("-c").arg(command);
            c
        } else {
            let mut c = Command::new("ssh");
            c.args(["-o", "StrictHostKeyChecking=no", "-o", "BatchMode=yes"])
                .arg(node)
                .arg(command);
            c
        }
    }
}

impl Executor for ShellExecutor {
    fn is_local(&self, node: &str) -> bool {
        self.local_names.contains(node)
    }

    fn dry_run(&self) -> bool {
        self.dry_run
    }

    fn run(

        &self,

        node: &str,

        command: &str,

        timeout: Option<Duration>,

        ignore_codes: &[i32],

    ) -> i32 {
        if self.dry_run {
            info!("[dry-run] {node}: {command}");
            return 0;
        }
        debug!(node, command, "run");

        let mut child = match self
            .command_for(node, command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(node, command, "Could not run command: {e}");
                return -1;
            }
        };
        let stderr = child.stderr.take().map(|mut s| {
            thread::spawn(move || {
                let mut text = String::new();
                let _ = s.read_to_string(&mut text);
                text
            })
        });

        let started = Instant::now();
        let code = loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    break status
                        .code()
                        .or_else(|| status.signal().map(|s| -s))
                        .unwrap_or(-1)
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(node, command, "Waiting for command: {e}");
                    break -1;
                }
            }
            if timeout.is_some_and(|t| started.elapsed() >= t) {
                let _ = child.kill();
                let _ = child.wait();
                break TIMED_OUT;
            }
            thread::sleep(POLL);
        };
        let stderr = stderr
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        if code == 0 || ignore_codes.contains(&code) {
            return 0;
        }
        warn!(node, command, code, stderr = stderr.trim(), "Command failed");
        code
    }

    fn run_detached(&self, node: &str, command: &str, log_file: &Path) {
        if self.dry_run {
            info!("[dry-run] {node}: {command} > {}", log_file.display());
            return;
        }
        debug!(node, command, log = %log_file.display(), "run detached");

        let spawned = if self.is_local(node) {
            if let Some(parent) = log_file.parent() {
                let _ = fs::create_dir_all(parent);
            }
            let log = match OpenOptions::new().create(true).append(true).open(log_file) {
                Ok(f) => f,
                Err(e) => {
                    warn!("Could not open {}: {e}", log_file.display());
                    return;
                }
            };
            let err = match log.try_clone() {
                Ok(f) => f,
                Err(e) => {
                    warn!("Could not open {}: {e}", log_file.display());
                    return;
                }
            };
            Command::new("setsid")
                .args(["nohup", "bash", "-c", command])
                .stdin(Stdio::null())
                .stdout(log)
                .stderr(err)
                .spawn()
        } else {
            let remote = format!(
                "nohup {command} > {} 2>&1 < /dev/null &",
                shell_quote(&log_file.to_string_lossy())
            );
            self.command_for(node, &remote)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
        };

        match spawned {
            // Reap the child whenever it exits so it doesn't linger as a zombie.
            Ok(mut child) => {
                thread::spawn(move || {
                    let _ = child.wait();
                });
            }
            Err(e) => warn!(node, command, "Could not start: {e}"),
        }
    }
}

/// Quote `s` for a POSIX shell if it needs it.

pub fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,+@%".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

#[test]
fn test_shell_quote() {
    assert!(shell_quote("/scratch/run_1/logs") == "/scratch/run_1/logs");
    assert!(shell_quote("a b") == "'a b'");
    assert!(shell_quote("it's") == r"'it'\''s'");
    assert!(shell_quote("") == "''");
    assert!(shell_quote("$(rm -rf /)") == "'$(rm -rf /)'");
}

#[test]
fn test_local_run_codes() {
    let x = ShellExecutor::new(false);
    assert!(x.is_local("localhost"));
    assert!(x.is_local(&hostname()));
    assert!(!x.is_local("node-that-does-not-exist-17"));

    assert!(x.run("localhost", "true", None, &[]) == 0);
    assert!(x.run("localhost", "exit 3", None, &[]) == 3);
    assert!(x.run("localhost", "exit 3", None, &[1, 3]) == 0);
    assert!(x.run("localhost", "kill -9 $$", None, &[]) == -9);
    assert!(x.run("localhost", "kill -9 $$", None, &[-9]) == 0);
    assert!(x.run("localhost", "sleep 5", Some(Duration::from_millis(200)), &[]) == TIMED_OUT);
}

#[test]
fn test_dry_run() {
    let x = ShellExecutor::new(true);
    assert!(x.run("localhost", "exit 3", None, &[]) == 0);
    let dir = tempfile::tempdir().unwrap();
    x.run_detached("localhost", "echo hi", &dir.path().join("log"));
    assert!(!dir.path().join("log").exists());
}

#[test]
fn test_local_detached() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("logs/agent.log");
    ShellExecutor::new(false).run_detached("localhost", "echo started", &log);
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if fs::read_to_string(&log).is_ok_and(|s| s.contains("started")) {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("detached command did not write its log");
}
