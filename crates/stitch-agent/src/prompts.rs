//! Prompt construction: the initial task request and the corrective
//! prompts used on every retry path.

use crate::parser::ParseError;
use std::collections::BTreeMap;
use stitch_core::Diagnostic;
use stitch_edits::ApplyFailure;

const DIRECTIVE_GUIDE: &str = r#"Edit files by emitting edit tags. Prose around tags is ignored, so think aloud freely.

Replace an inclusive 1-based line range:
<<<edit path="src/lib.rs" lines=4..7>>>
@@begin 4: first replaced line, exactly as it appears in the file
@@end 7: last replaced line
replacement text (may be empty, may span many lines)
<<<end>>>

Insert before a line; the anchor names a neighboring existing line, or 0 for start-of-file, $ for end-of-file:
<<<insert path="src/lib.rs" before=12>>>
@@at 11: the line just above the insertion point
inserted text
<<<end>>>

Create a new file:
<<<insert path="src/new.rs" before=1>>>
@@at 0
entire file contents
<<<end>>>

Delete a file:
<<<delete path="src/old.rs">>>

If a literal body line must start with <<< or @@, prefix it with a backslash.
Line numbers refer to the file as it exists right now; after your edits are applied the numbering changes.
When the task is complete and nothing remains to edit, reply with prose only and no tags."#;

pub fn initial_request(goal: &str, editable_files: &[String]) -> String {
    let mut out = String::new();
    out.push_str("Task:\n");
    out.push_str(goal);
    out.push_str("\n\n");
    out.push_str(DIRECTIVE_GUIDE);
    if !editable_files.is_empty() {
        out.push_str("\n\nEditable files:\n");
        const LISTED: usize = 200;
        for file in editable_files.iter().take(LISTED) {
            out.push_str("- ");
            out.push_str(file);
            out.push('\n');
        }
        if editable_files.len() > LISTED {
            out.push_str(&format!("(+{} more)\n", editable_files.len() - LISTED));
        }
    }
    out.trim_end().to_string()
}

pub fn parse_error_retry(error: &ParseError) -> String {
    format!(
        "Your previous response contained a malformed edit tag ({error}). \
         Please resend all of your edits with corrected tags."
    )
}

pub fn partial_no_directives_retry() -> String {
    "Your previous response was cut off before providing any edit tags; please resend your edits."
        .to_string()
}

pub fn partial_continue_retry(kept: usize) -> String {
    format!(
        "Your previous response was cut off. {kept} complete edit tag(s) were received and kept; \
         continue from where you left off without re-sending them."
    )
}

pub fn apply_failures_retry(failures: &[ApplyFailure], notes: &[String]) -> String {
    let mut out = String::new();
    out.push_str(
        "Some edits could not be applied. Edits not listed below were applied and the file \
         contents (and line numbers) have changed accordingly. Re-read the current state if \
         unsure, then resend corrected versions of only these failed edits:\n",
    );
    for failure in failures {
        out.push_str("- ");
        out.push_str(&failure.to_feedback());
        out.push('\n');
    }
    for note in notes {
        out.push_str("Note: ");
        out.push_str(note);
        out.push('\n');
    }
    out.trim_end().to_string()
}

pub fn build_failure_retry(
    command: &str,
    error: &str,
    diagnostics: &BTreeMap<String, Vec<Diagnostic>>,
) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "The edits were applied, but `{command}` failed:\n\n```\n{error}\n```\n"
    ));
    if !diagnostics.is_empty() {
        out.push_str("\nParse diagnostics in the files you touched:\n");
        for (path, findings) in diagnostics {
            for d in findings {
                out.push_str(&format!("- {path}:{}:{} {}\n", d.line, d.col, d.message));
            }
        }
    }
    out.push_str("\nFix the problem with further edit tags.");
    out
}

pub fn parse_diagnostics_failure(diagnostics: &BTreeMap<String, Vec<Diagnostic>>) -> String {
    let mut out = String::new();
    for (path, findings) in diagnostics {
        for d in findings {
            out.push_str(&format!("{path}:{}:{} {}\n", d.line, d.col, d.message));
        }
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use stitch_core::{DiagnosticCategory, Severity};
    use stitch_edits::FailureReason;

    #[test]
    fn initial_request_lists_goal_guide_and_files() {
        let prompt = initial_request("rename the widget", &["src/lib.rs".to_string()]);
        assert!(prompt.starts_with("Task:\nrename the widget"));
        assert!(prompt.contains("<<<edit"));
        assert!(prompt.contains("- src/lib.rs"));
    }

    #[test]
    fn initial_request_caps_the_file_listing() {
        let files: Vec<String> = (0..250).map(|i| format!("src/f{i}.rs")).collect();
        let prompt = initial_request("goal", &files);
        assert!(prompt.contains("(+50 more)"));
    }

    #[test]
    fn parse_error_retry_embeds_the_exact_message() {
        let error = ParseError {
            line: 3,
            col: 9,
            message: "expected '=' after attribute 'path'".to_string(),
        };
        let prompt = parse_error_retry(&error);
        assert!(prompt.contains("line 3, column 9"));
        assert!(prompt.contains("expected '=' after attribute 'path'"));
    }

    #[test]
    fn apply_retry_names_only_failed_directives() {
        let failures = vec![ApplyFailure {
            path: "src/a.rs".to_string(),
            range: Some((4, 6)),
            reason: FailureReason::AnchorMismatch,
            detail: "anchor 4 expected \"x\" but found \"y\"".to_string(),
        }];
        let notes = vec!["replace lines 9..9 of src/a.rs: line numbers shifted by +1".to_string()];
        let prompt = apply_failures_retry(&failures, &notes);
        assert!(prompt.contains("src/a.rs (lines 4..6)"));
        assert!(prompt.contains("anchor text did not match"));
        assert!(prompt.contains("Note: "));
    }

    #[test]
    fn build_retry_includes_output_and_diagnostics() {
        let mut diagnostics = BTreeMap::new();
        diagnostics.insert(
            "src/a.rs".to_string(),
            vec![Diagnostic {
                path: "src/a.rs".to_string(),
                line: 5,
                col: 2,
                severity: Severity::Error,
                category: DiagnosticCategory::Syntax,
                message: "unclosed '{'".to_string(),
                problem_id: None,
            }],
        );
        let prompt = build_failure_retry("cargo check", "error[E0308]: mismatched types", &diagnostics);
        assert!(prompt.contains("`cargo check`"));
        assert!(prompt.contains("error[E0308]"));
        assert!(prompt.contains("src/a.rs:5:2"));
    }
}
