//! Code-agent loop: drives a language model through iterative cycles of
//! proposing, applying, and verifying line edits against a workspace.

mod lang;
mod parser;
mod prompts;
mod task_loop;
mod verify;
mod workspace;

pub use lang::RustSyntaxParser;
pub use parser::{ParseError, ParseReport, parse_directives};
pub use verify::{BuildOutcome, derive_build_command, expand_template, modules_of, run_build};
pub use workspace::WorkspaceRepository;

use anyhow::Result;
use std::path::Path;
use stitch_core::{
    AppConfig, CancelToken, ConsoleSink, ContextRepository, LanguageParser, ModelClient,
    TaskResult,
};
use stitch_observe::Observer;
use stitch_tools::{PlatformShellRunner, ShellRunner};

/// Owns the collaborators and exposes the task entrypoint. Collaborators
/// are boxed trait objects so hosts (and tests) can swap any of them.
pub struct AgentEngine {
    pub(crate) cfg: AppConfig,
    pub(crate) repo: Box<dyn ContextRepository>,
    pub(crate) model: Box<dyn ModelClient>,
    pub(crate) shell: Box<dyn ShellRunner>,
    pub(crate) sink: Box<dyn ConsoleSink>,
    pub(crate) parsers: Vec<Box<dyn LanguageParser>>,
}

impl AgentEngine {
    pub fn new(workspace: &Path, model: Box<dyn ModelClient>) -> Result<Self> {
        let cfg = AppConfig::ensure(workspace)?;
        let repo = WorkspaceRepository::new(workspace)?;
        let observer = Observer::new(workspace)?;
        Ok(Self {
            cfg,
            repo: Box::new(repo),
            model,
            shell: Box::new(PlatformShellRunner),
            sink: Box::new(observer),
            parsers: vec![Box::new(RustSyntaxParser)],
        })
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn with_repository(mut self, repo: Box<dyn ContextRepository>) -> Self {
        self.repo = repo;
        self
    }

    pub fn with_shell(mut self, shell: Box<dyn ShellRunner>) -> Self {
        self.shell = shell;
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn ConsoleSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_language_parser(mut self, parser: Box<dyn LanguageParser>) -> Self {
        self.parsers.push(parser);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.cfg
    }

    /// Run one task to completion. `accept_immediately` skips the
    /// awaiting-review notification on success; the loop itself never
    /// blocks on review either way.
    pub fn run_task(&self, goal: &str, accept_immediately: bool) -> Result<TaskResult> {
        self.run_task_cancellable(goal, accept_immediately, &CancelToken::new())
    }

    /// Like [`run_task`](Self::run_task) with an external cancellation
    /// token, checked between phases and inside suspension points.
    pub fn run_task_cancellable(
        &self,
        goal: &str,
        accept_immediately: bool,
        cancel: &CancelToken,
    ) -> Result<TaskResult> {
        task_loop::run(self, goal, accept_immediately, cancel)
    }
}
