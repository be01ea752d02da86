//! Verification: a fast language-aware parse check over changed files,
//! then the external build/lint oracle whose pass/fail outcome is ground
//! truth.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::Duration;
use stitch_core::{BuildConfig, CancelToken, ContextRepository, Diagnostic, LanguageParser};
use stitch_tools::ShellRunner;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Nothing configured to run; verification passes trivially.
    NoCommand,
    Passed {
        commands: Vec<String>,
    },
    Failed {
        command: String,
        error: String,
    },
    Cancelled,
}

/// Run registered language parsers over the changed files, keeping only
/// the surfaced categories (syntax, definite-assignment, must-return,
/// unresolved locals). Missing files (deleted this task) are skipped.
/// Never fails the verify by itself.
pub fn run_parse_check(
    parsers: &[Box<dyn LanguageParser>],
    repo: &dyn ContextRepository,
    changed_files: &BTreeSet<String>,
) -> BTreeMap<String, Vec<Diagnostic>> {
    let mut out = BTreeMap::new();
    for rel in changed_files {
        let Some(parser) = parsers.iter().find(|p| p.handles(rel)) else {
            continue;
        };
        let Ok(source) = fs::read_to_string(repo.resolve(rel)) else {
            continue;
        };
        let diagnostics: Vec<Diagnostic> = parser
            .parse(rel, &source)
            .into_iter()
            .filter(|d| d.category.is_surfaced())
            .collect();
        if !diagnostics.is_empty() {
            out.insert(rel.clone(), diagnostics);
        }
    }
    out
}

/// Run the configured build command and, when it passes, the scoped test
/// command. Timeout counts as failure; cancellation wins over everything.
pub fn run_build(
    shell: &dyn ShellRunner,
    workspace: &Path,
    cfg: &BuildConfig,
    touched_files: &[String],
    cancel: &CancelToken,
) -> BuildOutcome {
    let configured = cfg.build_command.clone().or_else(|| {
        if cfg.derive_when_unset {
            derive_build_command(workspace)
        } else {
            None
        }
    });
    let Some(build_command) = configured else {
        return BuildOutcome::NoCommand;
    };

    let modules = modules_of(touched_files);
    let mut commands = vec![expand_template(&build_command, touched_files, &modules)];
    if let Some(test_command) = &cfg.test_command {
        commands.push(expand_template(test_command, touched_files, &modules));
    }

    let mut ran = Vec::new();
    for command in commands {
        if cancel.is_cancelled() {
            return BuildOutcome::Cancelled;
        }
        let result = match shell.run(
            &command,
            workspace,
            Duration::from_secs(cfg.timeout_seconds),
            cancel,
        ) {
            Ok(result) => result,
            Err(err) => {
                return BuildOutcome::Failed {
                    command,
                    error: truncate(&err.to_string(), cfg.output_budget_bytes),
                };
            }
        };
        if result.cancelled {
            return BuildOutcome::Cancelled;
        }
        if result.timed_out {
            let error = format!(
                "`{command}` timed out after {}s\n{}",
                cfg.timeout_seconds,
                result.combined_output()
            );
            return BuildOutcome::Failed {
                command,
                error: truncate(&error, cfg.output_budget_bytes),
            };
        }
        if !result.success() {
            return BuildOutcome::Failed {
                error: truncate(&result.combined_output(), cfg.output_budget_bytes),
                command,
            };
        }
        ran.push(command);
    }
    BuildOutcome::Passed { commands: ran }
}

/// Expand the recognized template tokens: `{{files}}` becomes the
/// space-separated touched-file list and `{{#modules}} {{value}}{{/modules}}`
/// repeats its section per module name. A template without tokens is used
/// unchanged; a section with no closing tag is left as-is.
pub fn expand_template(template: &str, files: &[String], modules: &[String]) -> String {
    const OPEN: &str = "{{#modules}}";
    const CLOSE: &str = "{{/modules}}";
    const VALUE: &str = "{{value}}";

    let mut out = template.replace("{{files}}", &files.join(" "));
    while let Some(open) = out.find(OPEN) {
        let section_start = open + OPEN.len();
        let Some(close_rel) = out[section_start..].find(CLOSE) else {
            break;
        };
        let close = section_start + close_rel;
        let inner = out[section_start..close].to_string();
        let rendered: String = modules.iter().map(|m| inner.replace(VALUE, m)).collect();
        out.replace_range(open..close + CLOSE.len(), &rendered);
    }
    out
}

/// Module names are the distinct leading path components of the touched
/// files; root-level files contribute none.
pub fn modules_of(files: &[String]) -> Vec<String> {
    let mut modules = BTreeSet::new();
    for file in files {
        if let Some((first, rest)) = file.split_once('/')
            && !first.is_empty()
            && !rest.is_empty()
        {
            modules.insert(first.to_string());
        }
    }
    modules.into_iter().collect()
}

/// Probe the workspace for a conventional test entrypoint. Used only when
/// the host opts in; an unconfigured oracle otherwise passes trivially.
pub fn derive_build_command(workspace: &Path) -> Option<String> {
    if workspace.join("Cargo.toml").exists() {
        return Some("cargo test -q".to_string());
    }
    if workspace.join("package.json").exists() {
        return Some("npm test --silent".to_string());
    }
    if workspace.join("pyproject.toml").exists() || workspace.join("setup.py").exists() {
        return Some("pytest -q".to_string());
    }
    if workspace.join("go.mod").exists() {
        return Some("go test ./...".to_string());
    }
    None
}

pub fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    format!("{}...(truncated)", &text[..text.floor_char_boundary(max)])
}
