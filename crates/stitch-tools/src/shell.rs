use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use stitch_core::CancelToken;
use wait_timeout::ChildExt;

/// Poll slice for the child-wait loop; bounds how long a cancellation flag
/// flip can go unobserved.
const POLL_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellRunResult {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl ShellRunResult {
    pub fn success(&self) -> bool {
        !self.timed_out && !self.cancelled && self.status == Some(0)
    }

    /// Stdout and stderr merged for diagnostics, stdout first.
    pub fn combined_output(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
            (false, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (true, true) => String::new(),
        }
    }
}

pub trait ShellRunner {
    fn run(
        &self,
        cmd: &str,
        cwd: &Path,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ShellRunResult>;
}

#[derive(Debug, Default)]
pub struct PlatformShellRunner;

impl ShellRunner for PlatformShellRunner {
    fn run(
        &self,
        cmd: &str,
        cwd: &Path,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ShellRunResult> {
        let mut child = spawn_command(cmd, cwd)?;

        // Drain pipes on their own threads so a chatty child cannot fill a
        // pipe and deadlock the deadline loop.
        let stdout = drain_stdout(child.stdout.take());
        let stderr = drain_stderr(child.stderr.take());

        let deadline = Instant::now() + timeout;
        let mut timed_out = false;
        let mut cancelled = false;
        let status = loop {
            if cancel.is_cancelled() {
                cancelled = true;
                child.kill()?;
                break child.wait()?.code();
            }
            if Instant::now() >= deadline {
                timed_out = true;
                child.kill()?;
                break child.wait()?.code();
            }
            let slice = POLL_SLICE.min(deadline.saturating_duration_since(Instant::now()));
            if let Some(status) = child.wait_timeout(slice)? {
                break status.code();
            }
        };

        Ok(ShellRunResult {
            status,
            stdout: join_reader(stdout),
            stderr: join_reader(stderr),
            timed_out,
            cancelled,
        })
    }
}

fn drain_stdout(pipe: Option<ChildStdout>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = pipe.read_to_string(&mut buf);
            buf
        })
    })
}

fn drain_stderr(pipe: Option<ChildStderr>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = pipe.read_to_string(&mut buf);
            buf
        })
    })
}

fn join_reader(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// Interpreter fallback order: each entry is the shell program plus the
/// flags that make it run one command string and exit.
#[cfg(not(target_os = "windows"))]
const SHELL_CANDIDATES: &[(&str, &[&str])] = &[("sh", &["-lc"]), ("bash", &["-lc"])];

#[cfg(target_os = "windows")]
const SHELL_CANDIDATES: &[(&str, &[&str])] = &[
    ("cmd", &["/C"]),
    ("powershell", &["-NoLogo", "-NoProfile", "-Command"]),
];

fn spawn_command(cmd: &str, cwd: &Path) -> Result<Child> {
    let cwd = cwd.canonicalize().unwrap_or_else(|_| cwd.to_path_buf());
    let mut attempts = Vec::new();
    for (program, flags) in SHELL_CANDIDATES {
        let spawned = Command::new(program)
            .args(*flags)
            .arg(cmd)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        match spawned {
            Ok(child) => return Ok(child),
            Err(err) => attempts.push(format!("{program}: {err}")),
        }
    }
    Err(anyhow!(
        "no shell could run '{cmd}' in '{}': {}",
        cwd.display(),
        attempts.join("; ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_runner_executes_command() {
        let runner = PlatformShellRunner;
        let out = runner
            .run(
                "echo stitch",
                Path::new("."),
                Duration::from_secs(5),
                &CancelToken::new(),
            )
            .expect("run command");
        assert!(out.success());
        assert!(out.stdout.to_lowercase().contains("stitch"));
    }

    #[test]
    fn nonzero_exit_is_not_success() {
        let runner = PlatformShellRunner;
        let out = runner
            .run(
                "exit 3",
                Path::new("."),
                Duration::from_secs(5),
                &CancelToken::new(),
            )
            .expect("run command");
        assert!(!out.success());
        assert_eq!(out.status, Some(3));
    }

    #[test]
    fn deadline_kills_long_commands() {
        let runner = PlatformShellRunner;
        let out = runner
            .run(
                "sleep 5",
                Path::new("."),
                Duration::from_millis(200),
                &CancelToken::new(),
            )
            .expect("run command");
        assert!(out.timed_out);
        assert!(!out.success());
    }

    #[test]
    fn cancellation_wins_over_timeout() {
        let runner = PlatformShellRunner;
        let cancel = CancelToken::new();
        cancel.cancel();
        let out = runner
            .run("sleep 5", Path::new("."), Duration::from_secs(5), &cancel)
            .expect("run command");
        assert!(out.cancelled);
        assert!(!out.timed_out);
    }

    #[test]
    fn combined_output_orders_stdout_first() {
        let result = ShellRunResult {
            status: Some(1),
            stdout: "out".to_string(),
            stderr: "err".to_string(),
            timed_out: false,
            cancelled: false,
        };
        assert_eq!(result.combined_output(), "out\nerr");
    }
}
