//! The per-task phase machine: request → parse → apply → verify, with
//! bounded per-kind failure counters and corrective retry prompts.

use crate::{AgentEngine, parser, prompts, verify};
use stitch_core::{
    CancelToken, ConversationState, EditState, Result, Role, StopReason, TaskEvent, TaskResult,
};
use stitch_edits::apply_batch;

/// Everything mutable for one task run.
struct TaskRun<'a> {
    engine: &'a AgentEngine,
    state: EditState,
    conversation: ConversationState,
    cancel: &'a CancelToken,
    iteration: u64,
}

enum Step {
    /// Go back to the model with the corrective prompt already staged in
    /// `conversation.next_request`.
    Retry,
    /// Proceed to the next phase.
    Continue,
    Stop(StopReason, String),
}

pub(crate) fn run(
    engine: &AgentEngine,
    goal: &str,
    accept_immediately: bool,
    cancel: &CancelToken,
) -> Result<TaskResult> {
    let editable = engine.repo.editable_files().unwrap_or_default();
    let mut run = TaskRun {
        engine,
        state: EditState::default(),
        conversation: ConversationState::new(prompts::initial_request(goal, &editable)),
        cancel,
        iteration: 0,
    };
    engine.sink.notify(&TaskEvent::TaskStarted {
        goal: goal.to_string(),
    });

    let max_iterations = engine.cfg.agent_loop.max_iterations.max(1);
    let mut outcome: Option<(StopReason, String)> = None;

    while run.iteration < max_iterations {
        run.iteration += 1;

        if run.cancel.is_cancelled() {
            outcome = Some((
                StopReason::Interrupted,
                "cancelled before requesting the model".to_string(),
            ));
            break;
        }

        let response = match run.request_model() {
            Ok(response) => response,
            Err(err) => {
                outcome = Some((
                    StopReason::InternalError,
                    format!("model request failed: {err}"),
                ));
                break;
            }
        };
        if run.cancel.is_cancelled() {
            outcome = Some((
                StopReason::Interrupted,
                "cancelled during the model request".to_string(),
            ));
            break;
        }

        match run.parse_phase(&response) {
            Step::Retry => continue,
            Step::Stop(reason, why) => {
                outcome = Some((reason, why));
                break;
            }
            Step::Continue => {}
        }

        match run.apply_phase() {
            Step::Retry => continue,
            Step::Stop(reason, why) => {
                outcome = Some((reason, why));
                break;
            }
            Step::Continue => {}
        }

        match run.verify_phase() {
            Step::Retry => continue,
            Step::Stop(reason, why) => {
                outcome = Some((reason, why));
                break;
            }
            Step::Continue => {}
        }
    }

    let (stop_reason, explanation) = outcome.unwrap_or((
        StopReason::InternalError,
        format!("iteration budget ({max_iterations}) exhausted without a terminal outcome"),
    ));

    if stop_reason.is_success() && !accept_immediately {
        engine.sink.notify(&TaskEvent::AwaitingReview {
            changed_files: run.state.changed_files.iter().cloned().collect(),
        });
    }
    engine.sink.notify(&TaskEvent::TaskFinished {
        stop_reason,
        explanation: explanation.clone(),
    });

    Ok(TaskResult {
        stop_reason,
        explanation,
        changed_files: run.state.changed_files,
        original_contents: run.state.original_contents,
        transcript: run.conversation.turns,
    })
}

impl TaskRun<'_> {
    fn request_model(&mut self) -> Result<stitch_core::ModelResponse> {
        self.engine.sink.notify(&TaskEvent::ModelRequested {
            iteration: self.iteration,
        });
        let request = std::mem::take(&mut self.conversation.next_request);
        self.conversation.push(Role::User, request);
        let response = self
            .engine
            .model
            .send(&self.conversation, self.cancel)?;
        self.conversation
            .push(Role::Assistant, response.text.clone());
        Ok(response)
    }

    fn retry(&mut self, prompt: String, reason: &str) -> Step {
        self.engine.sink.notify(&TaskEvent::RetryIssued {
            iteration: self.iteration,
            reason: reason.to_string(),
        });
        self.conversation.next_request = prompt;
        Step::Retry
    }

    fn parse_phase(&mut self, response: &stitch_core::ModelResponse) -> Step {
        let report = parser::parse_directives(&response.text, response.is_partial);
        self.engine.sink.notify(&TaskEvent::DirectivesParsed {
            iteration: self.iteration,
            count: report.directives.len(),
            partial: response.is_partial,
        });

        if response.is_partial {
            // Already-parsed directives survive the retry so the model
            // does not have to re-emit them.
            let kept = report.directives.len();
            self.state.pending.extend(report.directives);
            self.state.consecutive_parse_failures += 1;
            if self.state.consecutive_parse_failures
                >= self.engine.cfg.agent_loop.max_parse_failures
            {
                return Step::Stop(
                    StopReason::ParseError,
                    "the model response was cut off too many times in a row".to_string(),
                );
            }
            let prompt = if kept == 0 {
                prompts::partial_no_directives_retry()
            } else {
                prompts::partial_continue_retry(kept)
            };
            return self.retry(prompt, "partial model response");
        }

        if let Some(error) = report.error {
            self.state.consecutive_parse_failures += 1;
            if self.state.consecutive_parse_failures
                >= self.engine.cfg.agent_loop.max_parse_failures
            {
                return Step::Stop(
                    StopReason::ParseError,
                    format!("edit tags stayed malformed after repeated retries ({error})"),
                );
            }
            return self.retry(prompts::parse_error_retry(&error), "malformed edit tag");
        }

        self.state.consecutive_parse_failures = 0;

        if report.directives.is_empty() && self.state.pending.is_empty() {
            // Silence signals completion, unless a build failure is still
            // unresolved.
            if self.state.last_build_error.is_empty() {
                return Step::Stop(
                    StopReason::Success,
                    "the model signalled completion".to_string(),
                );
            }
            return Step::Stop(
                StopReason::BuildError,
                "the model stopped with the build still failing".to_string(),
            );
        }

        self.state.pending.extend(report.directives);
        Step::Continue
    }

    fn apply_phase(&mut self) -> Step {
        let batch = std::mem::take(&mut self.state.pending);
        let outcome = apply_batch(self.engine.repo.as_ref(), &batch);
        for (path, original) in &outcome.captured_originals {
            self.state.record_original(path, original);
        }
        for path in &outcome.changed_files {
            self.state.note_changed(path);
        }
        self.engine.sink.notify(&TaskEvent::ApplyCompleted {
            iteration: self.iteration,
            applied: outcome.applied,
            failed: outcome.failures.len(),
        });

        if let Some(fatal) = outcome.read_only_failure() {
            return Step::Stop(StopReason::ReadOnlyEdit, fatal.to_feedback());
        }

        if outcome.applied > 0 {
            // Partial success is progress: the failure counter resets and
            // only the failed directives go back to the model.
            self.state.consecutive_apply_failures = 0;
            self.state.blocks_applied_since_verify += outcome.applied as u32;
        } else {
            self.state.consecutive_apply_failures += 1;
            if self.state.consecutive_apply_failures
                >= self.engine.cfg.agent_loop.max_apply_failures
            {
                let summary = outcome
                    .failures
                    .first()
                    .map(|f| f.to_feedback())
                    .unwrap_or_else(|| "no directives could be applied".to_string());
                return Step::Stop(StopReason::ApplyError, summary);
            }
        }

        if !outcome.failures.is_empty() {
            return self.retry(
                prompts::apply_failures_retry(&outcome.failures, &outcome.notes),
                "apply failures",
            );
        }
        Step::Continue
    }

    fn verify_phase(&mut self) -> Step {
        debug_assert!(self.state.blocks_applied_since_verify > 0);

        if self.cancel.is_cancelled() {
            return Step::Stop(
                StopReason::Interrupted,
                "cancelled before verification".to_string(),
            );
        }

        if self.engine.cfg.lint.enabled {
            self.state.lint_diagnostics = verify::run_parse_check(
                &self.engine.parsers,
                self.engine.repo.as_ref(),
                &self.state.changed_files,
            );
        }

        if self.engine.cfg.build.fail_on_parse_diagnostics
            && !self.state.lint_diagnostics.is_empty()
        {
            self.state.blocks_applied_since_verify = 0;
            let summary = prompts::parse_diagnostics_failure(&self.state.lint_diagnostics);
            return self.build_failed("parse check", summary);
        }

        let files: Vec<String> = self.state.changed_files.iter().cloned().collect();
        let command_label = self
            .engine
            .cfg
            .build
            .build_command
            .clone()
            .unwrap_or_else(|| "(none configured)".to_string());
        self.engine.sink.notify(&TaskEvent::VerifyStarted {
            iteration: self.iteration,
            command: command_label,
        });

        let outcome = verify::run_build(
            self.engine.shell.as_ref(),
            self.engine.repo.workspace_root(),
            &self.engine.cfg.build,
            &files,
            self.cancel,
        );
        self.state.blocks_applied_since_verify = 0;

        match outcome {
            verify::BuildOutcome::NoCommand => {
                self.verify_passed("no build command configured".to_string());
                Step::Stop(
                    StopReason::Success,
                    "edits applied; no build command configured".to_string(),
                )
            }
            verify::BuildOutcome::Passed { commands } => {
                self.verify_passed(commands.join(" && "));
                Step::Stop(
                    StopReason::Success,
                    "edits applied and verification passed".to_string(),
                )
            }
            verify::BuildOutcome::Cancelled => Step::Stop(
                StopReason::Interrupted,
                "cancelled during verification".to_string(),
            ),
            verify::BuildOutcome::Failed { command, error } => self.build_failed(&command, error),
        }
    }

    fn verify_passed(&mut self, summary: String) {
        self.state.consecutive_parse_failures = 0;
        self.state.consecutive_apply_failures = 0;
        self.state.consecutive_build_failures = 0;
        self.state.last_build_error.clear();
        self.engine.sink.notify(&TaskEvent::VerifyCompleted {
            iteration: self.iteration,
            success: true,
            summary,
        });
    }

    fn build_failed(&mut self, command: &str, error: String) -> Step {
        self.state.last_build_error = error.clone();
        self.state.consecutive_build_failures += 1;
        self.engine.sink.notify(&TaskEvent::VerifyCompleted {
            iteration: self.iteration,
            success: false,
            summary: verify::truncate(&error, 400),
        });
        if self.state.consecutive_build_failures >= self.engine.cfg.agent_loop.max_build_failures {
            return Step::Stop(
                StopReason::BuildError,
                format!("`{command}` kept failing after repeated fixes"),
            );
        }
        self.retry(
            prompts::build_failure_retry(command, &error, &self.state.lint_diagnostics),
            "build failure",
        )
    }
}
