//! Line-edit applier: validates, self-corrects, orders, and atomically
//! applies a batch of directives against the workspace.
//!
//! The applier is all-or-nothing per file. Each target file is read once,
//! mutated in memory, and written back through a temp-sibling rename, so no
//! reader ever observes a partially edited file. Pre-edit content is
//! captured for every file the batch touches so the caller can roll back.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path};
use stitch_core::{Anchor, AnchorPos, ContextRepository, Directive};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    ReadOnly,
    FileNotFound,
    InvalidLineRange,
    AnchorMismatch,
    OverlappingEdits,
    IoError,
}

impl FailureReason {
    /// Read-only targets are fatal; everything else is worth a corrected
    /// resend from the model.
    pub fn retryable(self) -> bool {
        !matches!(self, FailureReason::ReadOnly)
    }

    pub fn describe(self) -> &'static str {
        match self {
            FailureReason::ReadOnly => "the file is read-only",
            FailureReason::FileNotFound => "the file does not exist",
            FailureReason::InvalidLineRange => "the line range is out of bounds",
            FailureReason::AnchorMismatch => {
                "the anchor text did not match the file and no unique one-line shift fixes it"
            }
            FailureReason::OverlappingEdits => "it overlaps another edit in the same batch",
            FailureReason::IoError => "writing the file failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyFailure {
    pub path: String,
    pub range: Option<(usize, usize)>,
    pub reason: FailureReason,
    pub detail: String,
}

impl ApplyFailure {
    pub fn to_feedback(&self) -> String {
        let range = match self.range {
            Some((lo, hi)) if hi + 1 == lo => format!(" (insert before line {lo})"),
            Some((lo, hi)) => format!(" (lines {lo}..{hi})"),
            None => String::new(),
        };
        if self.detail.is_empty() {
            format!("{}{}: {}", self.path, range, self.reason.describe())
        } else {
            format!(
                "{}{}: {} ({})",
                self.path,
                range,
                self.reason.describe(),
                self.detail
            )
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    pub applied: usize,
    pub failures: Vec<ApplyFailure>,
    pub changed_files: Vec<String>,
    /// Pre-edit content of every file this batch wrote or removed. The
    /// caller owns write-once semantics across batches.
    pub captured_originals: BTreeMap<String, String>,
    /// Human-readable notes, currently only anchor-shift corrections.
    pub notes: Vec<String>,
}

impl ApplyOutcome {
    pub fn read_only_failure(&self) -> Option<&ApplyFailure> {
        self.failures
            .iter()
            .find(|f| f.reason == FailureReason::ReadOnly)
    }
}

/// Apply one batch of directives. Successes and failures are both
/// returned; a batch with any read-only target writes nothing at all.
pub fn apply_batch(repo: &dyn ContextRepository, directives: &[Directive]) -> ApplyOutcome {
    let mut outcome = ApplyOutcome::default();

    let read_only: Vec<ApplyFailure> = directives
        .iter()
        .filter(|d| repo.is_read_only(d.path()))
        .map(|d| ApplyFailure {
            path: d.path().to_string(),
            range: range_of(d),
            reason: FailureReason::ReadOnly,
            detail: "declared read-only by the workspace context".to_string(),
        })
        .collect();
    if !read_only.is_empty() {
        outcome.failures = read_only;
        return outcome;
    }

    let mut by_path: BTreeMap<&str, Vec<(usize, &Directive)>> = BTreeMap::new();
    for (index, directive) in directives.iter().enumerate() {
        by_path
            .entry(directive.path())
            .or_default()
            .push((index, directive));
    }

    for (path, entries) in by_path {
        apply_file(repo, path, &entries, &mut outcome);
    }
    outcome
}

fn range_of(directive: &Directive) -> Option<(usize, usize)> {
    match directive {
        Directive::ReplaceRange {
            begin_line,
            end_line,
            ..
        } => Some((*begin_line, *end_line)),
        Directive::DeleteFile { .. } => None,
    }
}

struct StagedEdit {
    lo: usize,
    hi: usize,
    new_lines: Vec<String>,
    order: usize,
    range: (usize, usize),
}

fn apply_file(
    repo: &dyn ContextRepository,
    path: &str,
    entries: &[(usize, &Directive)],
    outcome: &mut ApplyOutcome,
) {
    if let Err(detail) = ensure_workspace_relative(path) {
        for (_, directive) in entries {
            outcome.failures.push(ApplyFailure {
                path: path.to_string(),
                range: range_of(directive),
                reason: FailureReason::FileNotFound,
                detail: detail.clone(),
            });
        }
        return;
    }

    let has_delete = entries
        .iter()
        .any(|(_, d)| matches!(d, Directive::DeleteFile { .. }));

    // A DeleteFile combined with anything else on the same path conflicts,
    // and so do two deletes.
    if has_delete && entries.len() > 1 {
        for (_, directive) in entries {
            outcome.failures.push(ApplyFailure {
                path: path.to_string(),
                range: range_of(directive),
                reason: FailureReason::OverlappingEdits,
                detail: "delete conflicts with another directive for the same file".to_string(),
            });
        }
        return;
    }

    let full = repo.resolve(path);

    if has_delete {
        if !full.exists() {
            outcome.failures.push(ApplyFailure {
                path: path.to_string(),
                range: None,
                reason: FailureReason::FileNotFound,
                detail: String::new(),
            });
            return;
        }
        let original = match fs::read_to_string(&full) {
            Ok(content) => content,
            Err(err) => {
                outcome.failures.push(ApplyFailure {
                    path: path.to_string(),
                    range: None,
                    reason: FailureReason::IoError,
                    detail: err.to_string(),
                });
                return;
            }
        };
        if let Err(err) = fs::remove_file(&full) {
            outcome.failures.push(ApplyFailure {
                path: path.to_string(),
                range: None,
                reason: FailureReason::IoError,
                detail: err.to_string(),
            });
            return;
        }
        outcome
            .captured_originals
            .insert(path.to_string(), original);
        outcome.changed_files.push(path.to_string());
        outcome.applied += 1;
        return;
    }

    let existed = full.exists();
    let original = if existed {
        match fs::read_to_string(&full) {
            Ok(content) => content,
            Err(err) => {
                for (_, directive) in entries {
                    outcome.failures.push(ApplyFailure {
                        path: path.to_string(),
                        range: range_of(directive),
                        reason: FailureReason::IoError,
                        detail: err.to_string(),
                    });
                }
                return;
            }
        }
    } else {
        String::new()
    };

    let (mut lines, trailing_newline) = split_lines(&original);
    let line_count = lines.len();

    let mut staged: Vec<StagedEdit> = Vec::new();
    for (order, directive) in entries {
        let Directive::ReplaceRange {
            begin_line,
            end_line,
            new_text,
            begin_anchor,
            end_anchor,
            ..
        } = directive
        else {
            continue;
        };
        let range = (*begin_line, *end_line);

        // A missing file supports exactly one shape: creation through an
        // insertion at sentinel `0` before line 1.
        let is_create = !existed
            && end_line + 1 == *begin_line
            && *begin_line == 1
            && begin_anchor.pos == AnchorPos::Start;
        if !existed && !is_create {
            outcome.failures.push(ApplyFailure {
                path: path.to_string(),
                range: Some(range),
                reason: FailureReason::FileNotFound,
                detail: "the file does not exist and the directive is not a create-style insert"
                    .to_string(),
            });
            continue;
        }

        let lo = *begin_line;
        let hi = *end_line;
        let is_insertion = hi + 1 == lo;
        let range_ok =
            lo >= 1 && lo <= line_count + 1 && (is_insertion || (lo <= hi && hi <= line_count));
        if !range_ok {
            outcome.failures.push(ApplyFailure {
                path: path.to_string(),
                range: Some(range),
                reason: FailureReason::InvalidLineRange,
                detail: format!("the file has {line_count} line(s)"),
            });
            continue;
        }

        let anchors: Vec<&Anchor> = [Some(begin_anchor), end_anchor.as_ref()]
            .into_iter()
            .flatten()
            .collect();
        let delta = match resolve_anchor_delta(&lines, &anchors) {
            Ok(delta) => delta,
            Err(detail) => {
                outcome.failures.push(ApplyFailure {
                    path: path.to_string(),
                    range: Some(range),
                    reason: FailureReason::AnchorMismatch,
                    detail,
                });
                continue;
            }
        };

        let (lo, hi) = if delta == 0 {
            (lo, hi)
        } else {
            let shifted_lo = lo as isize + delta;
            let shifted_hi = hi as isize + delta;
            if shifted_lo < 1
                || shifted_lo > line_count as isize + 1
                || (!is_insertion && shifted_hi > line_count as isize)
            {
                outcome.failures.push(ApplyFailure {
                    path: path.to_string(),
                    range: Some(range),
                    reason: FailureReason::InvalidLineRange,
                    detail: format!("out of bounds after shifting by {delta:+} line(s)"),
                });
                continue;
            }
            outcome.notes.push(format!(
                "{}: line numbers shifted by {delta:+} after anchor probe",
                directive.describe()
            ));
            (shifted_lo as usize, shifted_hi as usize)
        };

        staged.push(StagedEdit {
            lo,
            hi,
            new_lines: split_new_text(new_text),
            order: *order,
            range,
        });
    }

    // Overlap rejection is pairwise and symmetric: silently preferring one
    // side would mask a likely model error.
    let mut rejected = vec![false; staged.len()];
    for i in 0..staged.len() {
        for j in i + 1..staged.len() {
            if edits_conflict(&staged[i], &staged[j]) {
                rejected[i] = true;
                rejected[j] = true;
            }
        }
    }
    let (conflicting, mut accepted): (Vec<_>, Vec<_>) = staged
        .into_iter()
        .zip(rejected)
        .partition(|(_, rejected)| *rejected);
    for (edit, _) in &conflicting {
        outcome.failures.push(ApplyFailure {
            path: path.to_string(),
            range: Some(edit.range),
            reason: FailureReason::OverlappingEdits,
            detail: String::new(),
        });
    }

    if accepted.is_empty() {
        return;
    }

    // Descending application keeps every remaining edit's numbering valid.
    // At equal lo a replacement goes first so that an insertion before the
    // same line ends up above the replaced region; insertions among
    // themselves keep batch order in the output.
    accepted.sort_by(|(a, _), (b, _)| {
        b.lo.cmp(&a.lo)
            .then((a.hi < a.lo).cmp(&(b.hi < b.lo)))
            .then(b.order.cmp(&a.order))
    });
    for (edit, _) in &accepted {
        let start = edit.lo - 1;
        let end = if edit.hi < edit.lo { start } else { edit.hi };
        lines.splice(start..end, edit.new_lines.iter().cloned());
    }

    let content = join_lines(&lines, trailing_newline || !existed);
    if let Err(err) = write_atomic(&full, &content) {
        for (edit, _) in &accepted {
            outcome.failures.push(ApplyFailure {
                path: path.to_string(),
                range: Some(edit.range),
                reason: FailureReason::IoError,
                detail: err.to_string(),
            });
        }
        return;
    }

    outcome
        .captured_originals
        .insert(path.to_string(), original);
    outcome.changed_files.push(path.to_string());
    outcome.applied += accepted.len();
}

/// Validate anchors against the draft, returning the line-number shift to
/// apply to the whole directive. The first mismatching anchor picks the
/// shift, and only when exactly one neighbor matches; the chosen shift
/// must then hold for every anchor of the directive, including ones that
/// matched before the shift. A directive that already validates at its
/// stated lines is never shifted.
fn resolve_anchor_delta(lines: &[String], anchors: &[&Anchor]) -> Result<isize, String> {
    let mut delta: isize = 0;
    for anchor in anchors {
        let AnchorPos::Line(claimed) = anchor.pos else {
            continue;
        };
        let at = claimed as isize;
        if line_matches(lines, at, &anchor.text) {
            continue;
        }
        let before = line_matches(lines, at - 1, &anchor.text);
        let after = line_matches(lines, at + 1, &anchor.text);
        match (before, after) {
            (true, false) => delta = -1,
            (false, true) => delta = 1,
            (true, true) => {
                return Err(format!(
                    "anchor {claimed} expected {:?}; both neighboring lines match, refusing to guess",
                    anchor.text.trim()
                ));
            }
            (false, false) => {
                let actual = line_at(lines, at)
                    .map(|l| format!("{:?}", l.trim()))
                    .unwrap_or_else(|| "<out of range>".to_string());
                return Err(format!(
                    "anchor {claimed} expected {:?} but found {actual}",
                    anchor.text.trim()
                ));
            }
        }
        break;
    }

    if delta != 0 {
        for anchor in anchors {
            let AnchorPos::Line(claimed) = anchor.pos else {
                continue;
            };
            if !line_matches(lines, claimed as isize + delta, &anchor.text) {
                return Err(format!(
                    "anchor {claimed} expected {:?} but the anchors disagree on a {delta:+} line shift",
                    anchor.text.trim()
                ));
            }
        }
    }
    Ok(delta)
}

fn line_at(lines: &[String], number: isize) -> Option<&str> {
    if number < 1 || number as usize > lines.len() {
        return None;
    }
    Some(&lines[number as usize - 1])
}

/// Anchor text matching trims outer whitespace but preserves inner
/// whitespace.
fn line_matches(lines: &[String], number: isize, expected: &str) -> bool {
    line_at(lines, number).is_some_and(|line| line.trim() == expected.trim())
}

fn edits_conflict(a: &StagedEdit, b: &StagedEdit) -> bool {
    let a_insert = a.hi < a.lo;
    let b_insert = b.hi < b.lo;
    match (a_insert, b_insert) {
        (false, false) => a.lo <= b.hi && b.lo <= a.hi,
        (true, false) => b.lo < a.lo && a.lo <= b.hi,
        (false, true) => a.lo < b.lo && b.lo <= a.hi,
        // Two insertions never replace existing lines; equal positions are
        // kept in batch order.
        (true, true) => false,
    }
}

fn ensure_workspace_relative(path: &str) -> Result<(), String> {
    let rel = Path::new(path);
    if rel.is_absolute() {
        return Err("absolute paths are forbidden".to_string());
    }
    if rel
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Err("the path escapes the workspace root".to_string());
    }
    Ok(())
}

fn split_lines(content: &str) -> (Vec<String>, bool) {
    if content.is_empty() {
        return (Vec::new(), true);
    }
    let trailing = content.ends_with('\n');
    let mut lines: Vec<String> = content.split('\n').map(str::to_string).collect();
    if trailing {
        lines.pop();
    }
    (lines, trailing)
}

fn join_lines(lines: &[String], trailing: bool) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let mut out = lines.join("\n");
    if trailing {
        out.push('\n');
    }
    out
}

fn split_new_text(new_text: &str) -> Vec<String> {
    if new_text.is_empty() {
        return Vec::new();
    }
    let (lines, _) = split_lines(new_text);
    lines
}

/// Write-to-temp-then-rename so no reader observes a partial file.
fn write_atomic(full: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = full.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let file_name = full
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let tmp = full.with_file_name(format!(".{file_name}.{}.tmp", Uuid::now_v7()));
    fs::write(&tmp, content)?;
    fs::rename(&tmp, full).inspect_err(|_| {
        let _ = fs::remove_file(&tmp);
    })
}
