//! Scripted fakes and fixtures for exercising the agent loop without a
//! real model, shell, or console.

use anyhow::Result;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stitch_core::{
    CancelToken, ConsoleSink, ContextRepository, ConversationState, ModelClient, ModelResponse,
    TaskEvent,
};
use stitch_tools::{ShellRunResult, ShellRunner};

/// Model that replays a canned queue of responses. Once drained it answers
/// with empty prose, which the loop reads as completion-by-silence.
/// Clones share the queue and the request record.
#[derive(Clone)]
pub struct ScriptedModel {
    responses: Arc<Mutex<VecDeque<ModelResponse>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<ModelResponse>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn reply(text: &str) -> ModelResponse {
        ModelResponse {
            text: text.to_string(),
            is_partial: false,
        }
    }

    pub fn partial(text: &str) -> ModelResponse {
        ModelResponse {
            text: text.to_string(),
            is_partial: true,
        }
    }

    /// The user-role prompt each request was sent with, in order.
    pub fn seen_requests(&self) -> Vec<String> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl ModelClient for ScriptedModel {
    fn send(
        &self,
        conversation: &ConversationState,
        _cancel: &CancelToken,
    ) -> stitch_core::Result<ModelResponse> {
        let last_user = conversation
            .turns
            .iter()
            .rev()
            .find(|t| matches!(t.role, stitch_core::Role::User))
            .map(|t| t.content.clone())
            .unwrap_or_default();
        self.requests.lock().expect("requests lock").push(last_user);
        let next = self.responses.lock().expect("responses lock").pop_front();
        Ok(next.unwrap_or_else(|| ModelResponse {
            text: String::new(),
            is_partial: false,
        }))
    }
}

/// Model that always fails, for exercising the internal-error path.
pub struct FailingModel;

impl ModelClient for FailingModel {
    fn send(
        &self,
        _conversation: &ConversationState,
        _cancel: &CancelToken,
    ) -> stitch_core::Result<ModelResponse> {
        Err(anyhow::anyhow!("transport unavailable"))
    }
}

/// Shell that replays canned results and records every command. Once
/// drained it reports success with empty output. Clones share state.
#[derive(Default, Clone)]
pub struct StaticShell {
    results: Arc<Mutex<VecDeque<ShellRunResult>>>,
    commands: Arc<Mutex<Vec<String>>>,
}

impl StaticShell {
    pub fn new(results: Vec<ShellRunResult>) -> Self {
        Self {
            results: Arc::new(Mutex::new(results.into())),
            commands: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn ok() -> ShellRunResult {
        ShellRunResult {
            status: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            timed_out: false,
            cancelled: false,
        }
    }

    pub fn failing(stderr: &str) -> ShellRunResult {
        ShellRunResult {
            status: Some(1),
            stdout: String::new(),
            stderr: stderr.to_string(),
            timed_out: false,
            cancelled: false,
        }
    }

    pub fn timed_out() -> ShellRunResult {
        ShellRunResult {
            status: None,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: true,
            cancelled: false,
        }
    }

    pub fn seen_commands(&self) -> Vec<String> {
        self.commands.lock().expect("commands lock").clone()
    }
}

impl ShellRunner for StaticShell {
    fn run(
        &self,
        cmd: &str,
        _cwd: &Path,
        _timeout: Duration,
        _cancel: &CancelToken,
    ) -> Result<ShellRunResult> {
        self.commands
            .lock()
            .expect("commands lock")
            .push(cmd.to_string());
        let next = self.results.lock().expect("results lock").pop_front();
        Ok(next.unwrap_or_else(Self::ok))
    }
}

/// Sink that records every event; clone freely, the buffer is shared.
#[derive(Default, Clone)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<TaskEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().expect("events lock").clone()
    }
}

impl ConsoleSink for RecordingSink {
    fn notify(&self, event: &TaskEvent) {
        self.events.lock().expect("events lock").push(event.clone());
    }
}

/// Disposable workspace with a trivial `ContextRepository` view and an
/// explicit read-only list.
pub struct TempWorkspace {
    dir: tempfile::TempDir,
    read_only: Vec<String>,
}

impl TempWorkspace {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
            read_only: Vec::new(),
        })
    }

    pub fn mark_read_only(&mut self, rel: &str) {
        self.read_only.push(rel.to_string());
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, content: &str) -> Result<()> {
        let full = self.dir.path().join(rel);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(full, content)?;
        Ok(())
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        Ok(fs::read_to_string(self.dir.path().join(rel))?)
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.dir.path().join(rel).exists()
    }

    /// A repository view over this workspace, sharing the read-only list
    /// as of this call.
    pub fn repo(&self) -> TempRepoView {
        TempRepoView {
            root: self.dir.path().to_path_buf(),
            read_only: self.read_only.clone(),
        }
    }
}

pub struct TempRepoView {
    root: PathBuf,
    read_only: Vec<String>,
}

impl ContextRepository for TempRepoView {
    fn workspace_root(&self) -> &Path {
        &self.root
    }

    fn is_read_only(&self, rel_path: &str) -> bool {
        self.read_only.iter().any(|p| p == rel_path)
    }

    fn editable_files(&self) -> stitch_core::Result<Vec<String>> {
        let mut files = Vec::new();
        collect_files(&self.root, &self.root, &mut files)?;
        files.retain(|f| !self.is_read_only(f) && !f.starts_with(".stitch/"));
        files.sort();
        Ok(files)
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_model_drains_then_goes_silent() {
        let model = ScriptedModel::new(vec![ScriptedModel::reply("hello")]);
        let conversation = ConversationState::new("hi");
        let cancel = CancelToken::new();
        let first = model.send(&conversation, &cancel).expect("send");
        assert_eq!(first.text, "hello");
        let second = model.send(&conversation, &cancel).expect("send");
        assert_eq!(second.text, "");
        assert!(!second.is_partial);
    }

    #[test]
    fn static_shell_records_commands() {
        let shell = StaticShell::new(vec![StaticShell::failing("boom")]);
        let result = shell
            .run(
                "make check",
                Path::new("."),
                Duration::from_secs(1),
                &CancelToken::new(),
            )
            .expect("run");
        assert!(!result.success());
        assert_eq!(shell.seen_commands(), vec!["make check"]);
    }

    #[test]
    fn temp_workspace_round_trips_files() {
        let ws = TempWorkspace::new().expect("workspace");
        ws.write("src/a.rs", "fn a() {}\n").expect("write");
        assert_eq!(ws.read("src/a.rs").expect("read"), "fn a() {}\n");
        let files = ws.repo().editable_files().expect("list");
        assert_eq!(files, vec!["src/a.rs"]);
    }
}
