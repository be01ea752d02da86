use anyhow::Result;
use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use stitch_core::{ConsoleSink, TaskEvent, runtime_dir};

/// Append-only run log plus optional verbose stderr mirroring. Progress
/// notifications are non-essential to loop correctness, so the sink
/// swallows logging failures.
pub struct Observer {
    log_path: PathBuf,
    verbose: bool,
}

impl Observer {
    pub fn new(workspace: &Path) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join("agent.log"),
            verbose: false,
        })
    }

    /// Enable or disable verbose logging to stderr.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn record_event(&self, event: &TaskEvent) -> Result<()> {
        self.append_log_line(&format!(
            "{} EVENT {}",
            Utc::now().to_rfc3339(),
            serde_json::to_string(event)?
        ))
    }

    /// Log a message to stderr with `[stitch]` prefix when verbose mode is
    /// on.
    pub fn verbose_log(&self, msg: &str) {
        if self.verbose {
            eprintln!("[stitch] {msg}");
        }
    }

    /// Log a warning — always written to the log file, and to stderr.
    pub fn warn_log(&self, msg: &str) {
        eprintln!("[stitch WARN] {msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}

impl ConsoleSink for Observer {
    fn notify(&self, event: &TaskEvent) {
        if let Err(err) = self.record_event(event) {
            self.verbose_log(&format!("dropped event: {err}"));
        } else if self.verbose
            && let Ok(json) = serde_json::to_string(event)
        {
            self.verbose_log(&json);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stitch_core::StopReason;

    #[test]
    fn events_append_to_run_log() {
        let workspace = tempfile::tempdir().expect("tempdir");
        let observer = Observer::new(workspace.path()).expect("observer");

        observer
            .record_event(&TaskEvent::TaskStarted {
                goal: "demo".to_string(),
            })
            .expect("record event");
        observer.notify(&TaskEvent::TaskFinished {
            stop_reason: StopReason::Success,
            explanation: "done".to_string(),
        });

        let log = fs::read_to_string(runtime_dir(workspace.path()).join("agent.log"))
            .expect("read log");
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("TaskStarted"));
        assert!(lines[1].contains("TaskFinished"));
        assert!(lines[1].contains("SUCCESS") || lines[1].contains("Success"));
    }

    #[test]
    fn verbose_defaults_off() {
        let workspace = tempfile::tempdir().expect("tempdir");
        let mut observer = Observer::new(workspace.path()).expect("observer");
        assert!(!observer.is_verbose());
        observer.set_verbose(true);
        assert!(observer.is_verbose());
    }
}
