use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub type Result<T> = anyhow::Result<T>;

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".stitch")
}

/// Position an anchor refers to. `Start` and `End` are the sentinel
/// positions `0` (before the first line) and `$` (after the last line);
/// sentinels skip content validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnchorPos {
    Start,
    End,
    Line(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub pos: AnchorPos,
    pub text: String,
}

impl Anchor {
    pub fn start() -> Self {
        Self {
            pos: AnchorPos::Start,
            text: String::new(),
        }
    }

    pub fn end() -> Self {
        Self {
            pos: AnchorPos::End,
            text: String::new(),
        }
    }

    pub fn line(line: usize, text: impl Into<String>) -> Self {
        Self {
            pos: AnchorPos::Line(line),
            text: text.into(),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self.pos, AnchorPos::Start | AnchorPos::End)
    }
}

/// A typed edit intention parsed from model output.
///
/// Insertions are canonically encoded as `ReplaceRange` with
/// `end_line = begin_line - 1` (an empty range replaces zero lines).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Directive {
    ReplaceRange {
        path: String,
        begin_line: usize,
        end_line: usize,
        new_text: String,
        begin_anchor: Anchor,
        end_anchor: Option<Anchor>,
    },
    DeleteFile {
        path: String,
    },
}

impl Directive {
    pub fn path(&self) -> &str {
        match self {
            Directive::ReplaceRange { path, .. } | Directive::DeleteFile { path } => path,
        }
    }

    pub fn is_insertion(&self) -> bool {
        matches!(
            self,
            Directive::ReplaceRange {
                begin_line,
                end_line,
                ..
            } if end_line + 1 == *begin_line
        )
    }

    /// Short human-readable form used in prompts and log lines.
    pub fn describe(&self) -> String {
        match self {
            Directive::ReplaceRange {
                path,
                begin_line,
                end_line,
                ..
            } => {
                if end_line + 1 == *begin_line {
                    format!("insert before line {begin_line} of {path}")
                } else {
                    format!("replace lines {begin_line}..{end_line} of {path}")
                }
            }
            Directive::DeleteFile { path } => format!("delete {path}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    Success,
    ParseError,
    ApplyError,
    BuildError,
    ReadOnlyEdit,
    Interrupted,
    InternalError,
}

impl StopReason {
    pub fn is_success(self) -> bool {
        matches!(self, StopReason::Success)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::Success => "SUCCESS",
            StopReason::ParseError => "PARSE_ERROR",
            StopReason::ApplyError => "APPLY_ERROR",
            StopReason::BuildError => "BUILD_ERROR",
            StopReason::ReadOnlyEdit => "READ_ONLY_EDIT",
            StopReason::Interrupted => "INTERRUPTED",
            StopReason::InternalError => "INTERNAL_ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

/// Ordered transcript of prior model turns plus the prompt that will be
/// sent at the next iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationState {
    pub turns: Vec<Turn>,
    pub next_request: String,
}

impl ConversationState {
    pub fn new(initial_request: impl Into<String>) -> Self {
        Self {
            turns: Vec::new(),
            next_request: initial_request.into(),
        }
    }

    pub fn push(&mut self, role: Role, content: impl Into<String>) {
        self.turns.push(Turn {
            role,
            content: content.into(),
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticCategory {
    Syntax,
    Flow,
    Return,
    LocalVar,
    Other,
}

impl DiagnosticCategory {
    /// Whether diagnostics of this category are surfaced to the model.
    /// Type-resolution and import-resolution findings land in `Other` and
    /// are suppressed; they usually reflect dependencies the agent cannot
    /// fix.
    pub fn is_surfaced(self) -> bool {
        !matches!(self, DiagnosticCategory::Other)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub path: String,
    pub line: usize,
    pub col: usize,
    pub severity: Severity,
    pub category: DiagnosticCategory,
    pub message: String,
    pub problem_id: Option<String>,
}

/// Mutable loop state carried across iterations of one task.
#[derive(Debug, Clone, Default)]
pub struct EditState {
    pub pending: Vec<Directive>,
    pub consecutive_parse_failures: u32,
    pub consecutive_apply_failures: u32,
    pub consecutive_build_failures: u32,
    pub blocks_applied_since_verify: u32,
    pub last_build_error: String,
    pub changed_files: BTreeSet<String>,
    pub original_contents: BTreeMap<String, String>,
    pub lint_diagnostics: BTreeMap<String, Vec<Diagnostic>>,
}

impl EditState {
    /// Record the pre-task content of a path. Write-once: the first call
    /// for a path wins and later calls never overwrite the entry.
    pub fn record_original(&mut self, path: &str, content: &str) {
        self.original_contents
            .entry(path.to_string())
            .or_insert_with(|| content.to_string());
    }

    pub fn note_changed(&mut self, path: &str) {
        self.changed_files.insert(path.to_string());
    }
}

/// Final outcome of one `run_task` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub stop_reason: StopReason,
    pub explanation: String,
    pub changed_files: BTreeSet<String>,
    pub original_contents: BTreeMap<String, String>,
    pub transcript: Vec<Turn>,
}

/// Cooperative cancellation flag, checked between phases and inside the
/// build-command output loop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: String,
    /// True when the upstream stream was cut off before completion.
    pub is_partial: bool,
}

/// Progress notifications emitted by the loop. Non-essential to
/// correctness; sinks may drop them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum TaskEvent {
    TaskStarted {
        goal: String,
    },
    ModelRequested {
        iteration: u64,
    },
    DirectivesParsed {
        iteration: u64,
        count: usize,
        partial: bool,
    },
    ApplyCompleted {
        iteration: u64,
        applied: usize,
        failed: usize,
    },
    VerifyStarted {
        iteration: u64,
        command: String,
    },
    VerifyCompleted {
        iteration: u64,
        success: bool,
        summary: String,
    },
    RetryIssued {
        iteration: u64,
        reason: String,
    },
    AwaitingReview {
        changed_files: Vec<String>,
    },
    TaskFinished {
        stop_reason: StopReason,
        explanation: String,
    },
}

pub trait ModelClient {
    fn send(&self, conversation: &ConversationState, cancel: &CancelToken)
    -> Result<ModelResponse>;
}

/// Narrow view of the user's workspace: path resolution, the read-only
/// set, and the editable-file listing.
pub trait ContextRepository {
    fn workspace_root(&self) -> &Path;

    fn is_read_only(&self, rel_path: &str) -> bool;

    fn editable_files(&self) -> Result<Vec<String>>;

    fn resolve(&self, rel_path: &str) -> PathBuf {
        self.workspace_root().join(rel_path)
    }
}

/// Fast per-language parse check run over changed files before the build
/// oracle. Implementations classify findings; only SYNTAX / FLOW / RETURN
/// / LOCAL_VAR categories are surfaced to the model.
pub trait LanguageParser {
    fn language(&self) -> &'static str;

    fn handles(&self, rel_path: &str) -> bool;

    fn parse(&self, rel_path: &str, source: &str) -> Vec<Diagnostic>;
}

pub trait ConsoleSink {
    fn notify(&self, event: &TaskEvent);
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent_loop: LoopConfig,
    pub build: BuildConfig,
    pub lint: LintConfig,
}

impl AppConfig {
    pub fn config_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.toml")
    }

    pub fn load(workspace: &Path) -> Result<Self> {
        let path = Self::config_path(workspace);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn ensure(workspace: &Path) -> Result<Self> {
        let path = Self::config_path(workspace);
        if path.exists() {
            return Self::load(workspace);
        }
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid config path"))?,
        )?;
        let cfg = Self::default();
        cfg.save(workspace)?;
        Ok(cfg)
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::config_path(workspace);
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid config path"))?,
        )?;
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub max_parse_failures: u32,
    pub max_apply_failures: u32,
    pub max_build_failures: u32,
    /// Hard bound on loop iterations. Alternating failure kinds keep
    /// resetting each other's counters; this caps the total.
    pub max_iterations: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_parse_failures: 3,
            max_apply_failures: 3,
            max_build_failures: 3,
            max_iterations: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Build/lint command template. `{{files}}` expands to the
    /// space-separated touched files, `{{#modules}} {{value}}{{/modules}}`
    /// over module names. No template means verification passes trivially.
    pub build_command: Option<String>,
    /// Scoped test command, run only after the build command passes.
    pub test_command: Option<String>,
    pub timeout_seconds: u64,
    /// Captured build output kept for retry prompts is clipped to this
    /// prefix.
    pub output_budget_bytes: usize,
    /// Treat surfaced parse diagnostics as a build failure even when the
    /// build command passes or is absent.
    pub fail_on_parse_diagnostics: bool,
    /// Probe the workspace for a conventional build command when none is
    /// configured.
    pub derive_when_unset: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            build_command: None,
            test_command: None,
            timeout_seconds: 300,
            output_budget_bytes: 32 * 1024,
            fail_on_parse_diagnostics: false,
            derive_when_unset: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LintConfig {
    /// Gates the language-aware parse check before the build oracle.
    pub enabled: bool,
}

impl Default for LintConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn config_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = AppConfig::ensure(temp.path()).expect("ensure");
        assert!(AppConfig::config_path(temp.path()).exists());

        cfg.build.build_command = Some("cargo check".to_string());
        cfg.agent_loop.max_build_failures = 5;
        cfg.save(temp.path()).expect("save");

        let loaded = AppConfig::load(temp.path()).expect("load");
        assert_eq!(loaded.build.build_command.as_deref(), Some("cargo check"));
        assert_eq!(loaded.agent_loop.max_build_failures, 5);
        assert_eq!(loaded.build.output_budget_bytes, 32 * 1024);
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = AppConfig::load(temp.path()).expect("load");
        assert_eq!(cfg.agent_loop.max_parse_failures, 3);
        assert!(cfg.build.build_command.is_none());
        assert!(cfg.lint.enabled);
    }

    #[test]
    fn record_original_is_write_once() {
        let mut state = EditState::default();
        state.record_original("a.txt", "first");
        state.record_original("a.txt", "second");
        assert_eq!(state.original_contents["a.txt"], "first");
    }

    #[test]
    fn cancel_token_latches() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn insertion_encoding() {
        let d = Directive::ReplaceRange {
            path: "a.txt".to_string(),
            begin_line: 3,
            end_line: 2,
            new_text: "x".to_string(),
            begin_anchor: Anchor::line(2, "b"),
            end_anchor: None,
        };
        assert!(d.is_insertion());
        assert_eq!(d.describe(), "insert before line 3 of a.txt");

        let r = Directive::ReplaceRange {
            path: "a.txt".to_string(),
            begin_line: 2,
            end_line: 4,
            new_text: String::new(),
            begin_anchor: Anchor::line(2, "b"),
            end_anchor: None,
        };
        assert!(!r.is_insertion());
    }

    #[test]
    fn sentinel_anchors() {
        assert!(Anchor::start().is_sentinel());
        assert!(Anchor::end().is_sentinel());
        assert!(!Anchor::line(4, "text").is_sentinel());
    }

    #[test]
    fn task_event_serializes_tagged() {
        let event = TaskEvent::ApplyCompleted {
            iteration: 2,
            applied: 3,
            failed: 1,
        };
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("\"type\":\"ApplyCompleted\""));
        assert!(json.contains("\"applied\":3"));
    }

    proptest! {
        #[test]
        fn originals_keep_first_write(contents in proptest::collection::vec("[a-z]{0,8}", 1..8)) {
            let mut state = EditState::default();
            for content in &contents {
                state.record_original("file", content);
            }
            prop_assert_eq!(&state.original_contents["file"], &contents[0]);
        }

        #[test]
        fn changed_files_grow_monotonically(paths in proptest::collection::vec("[a-z]{1,6}", 0..12)) {
            let mut state = EditState::default();
            let mut prev = 0usize;
            for path in &paths {
                state.note_changed(path);
                prop_assert!(state.changed_files.len() >= prev);
                prev = state.changed_files.len();
                prop_assert!(state.changed_files.contains(path));
            }
        }
    }
}
