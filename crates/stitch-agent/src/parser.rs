//! Edit-directive parser. Extracts typed directives from free-form model
//! output; prose between and around tags is discarded. Pure: output
//! depends only on the inputs.

use stitch_core::{Anchor, Directive};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}, column {col}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub col: usize,
    pub message: String,
}

impl ParseError {
    fn new(line: usize, col: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            col,
            message: message.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ParseReport {
    pub directives: Vec<Directive>,
    /// First malformed-marker error encountered; later well-formed blocks
    /// are still collected.
    pub error: Option<ParseError>,
}

impl ParseReport {
    fn record(&mut self, error: ParseError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

/// Parse one model response. With `is_partial` set, an unterminated
/// trailing block is dropped silently instead of reported: the stream was
/// cut off mid-block and the model will be asked to continue.
pub fn parse_directives(text: &str, is_partial: bool) -> ParseReport {
    let lines: Vec<&str> = text
        .split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .collect();
    let mut report = ParseReport::default();
    let mut i = 0;
    while i < lines.len() {
        let trimmed = lines[i].trim();
        if let Some(inner) = marker_inner(trimmed, "edit") {
            match parse_edit_block(&lines, i, inner, is_partial) {
                Ok(Some((directive, next))) => {
                    report.directives.push(directive);
                    i = next;
                    continue;
                }
                Ok(None) => return report,
                Err(err) => report.record(err),
            }
        } else if let Some(inner) = marker_inner(trimmed, "insert") {
            match parse_insert_block(&lines, i, inner, is_partial) {
                Ok(Some((directive, next))) => {
                    report.directives.push(directive);
                    i = next;
                    continue;
                }
                Ok(None) => return report,
                Err(err) => report.record(err),
            }
        } else if let Some(inner) = marker_inner(trimmed, "delete") {
            match parse_delete_marker(inner, i + 1) {
                Ok(directive) => report.directives.push(directive),
                Err(err) => report.record(err),
            }
        } else if trimmed == "<<<end>>>" {
            report.record(ParseError::new(
                i + 1,
                1,
                "unexpected <<<end>>> without an open edit block",
            ));
        }
        i += 1;
    }
    report
}

/// Returns the attribute section of a marker line, or None when the line
/// is not a `<<<tag ...>>>` marker.
fn marker_inner<'a>(line: &'a str, tag: &str) -> Option<&'a str> {
    let rest = line.strip_prefix("<<<")?.strip_prefix(tag)?;
    let rest = rest.strip_suffix(">>>")?;
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest.trim())
    } else {
        None
    }
}

struct Attr {
    key: String,
    value: String,
    col: usize,
}

fn parse_attrs(s: &str, line_no: usize) -> Result<Vec<Attr>, ParseError> {
    let chars: Vec<(usize, char)> = s.char_indices().collect();
    let len = chars.len();
    let mut attrs: Vec<Attr> = Vec::new();
    let mut i = 0;
    while i < len {
        while i < len && chars[i].1.is_whitespace() {
            i += 1;
        }
        if i >= len {
            break;
        }
        let key_start = i;
        while i < len && (chars[i].1.is_ascii_alphanumeric() || chars[i].1 == '-' || chars[i].1 == '_')
        {
            i += 1;
        }
        if i == key_start {
            return Err(ParseError::new(line_no, i + 1, "expected attribute name"));
        }
        let key: String = chars[key_start..i].iter().map(|(_, c)| *c).collect();
        if i >= len || chars[i].1 != '=' {
            return Err(ParseError::new(
                line_no,
                i + 1,
                format!("expected '=' after attribute '{key}'"),
            ));
        }
        i += 1;
        let value_col = i + 1;
        let value = if i < len && chars[i].1 == '"' {
            i += 1;
            let mut value = String::new();
            loop {
                if i >= len {
                    return Err(ParseError::new(
                        line_no,
                        i + 1,
                        format!("unterminated quoted value for attribute '{key}'"),
                    ));
                }
                match chars[i].1 {
                    '"' => {
                        i += 1;
                        break;
                    }
                    '\\' if i + 1 < len => {
                        value.push(chars[i + 1].1);
                        i += 2;
                    }
                    c => {
                        value.push(c);
                        i += 1;
                    }
                }
            }
            value
        } else {
            let start = i;
            while i < len && !chars[i].1.is_whitespace() {
                i += 1;
            }
            if i == start {
                return Err(ParseError::new(
                    line_no,
                    i + 1,
                    format!("expected a value for attribute '{key}'"),
                ));
            }
            chars[start..i].iter().map(|(_, c)| *c).collect()
        };
        if attrs.iter().any(|a| a.key == key) {
            return Err(ParseError::new(
                line_no,
                key_start + 1,
                format!("duplicate attribute '{key}'"),
            ));
        }
        attrs.push(Attr {
            key,
            value,
            col: value_col,
        });
    }
    Ok(attrs)
}

fn require_attr<'a>(
    attrs: &'a [Attr],
    key: &str,
    line_no: usize,
    tag: &str,
) -> Result<&'a Attr, ParseError> {
    attrs.iter().find(|a| a.key == key).ok_or_else(|| {
        ParseError::new(
            line_no,
            1,
            format!("<<<{tag}>>> marker is missing the required '{key}' attribute"),
        )
    })
}

fn parse_usize(attr: &Attr, line_no: usize) -> Result<usize, ParseError> {
    attr.value.parse::<usize>().map_err(|_| {
        ParseError::new(
            line_no,
            attr.col,
            format!("attribute '{}' is not a number: '{}'", attr.key, attr.value),
        )
    })
}

/// `lines=LO..HI` with 1-based inclusive bounds; `HI = LO - 1` encodes an
/// empty range.
fn parse_range(attr: &Attr, line_no: usize) -> Result<(usize, usize), ParseError> {
    let bad = || {
        ParseError::new(
            line_no,
            attr.col,
            format!("attribute 'lines' must be LO..HI, got '{}'", attr.value),
        )
    };
    let (lo, hi) = attr.value.split_once("..").ok_or_else(bad)?;
    let lo: usize = lo.trim().parse().map_err(|_| bad())?;
    let hi: usize = hi.trim().parse().map_err(|_| bad())?;
    if lo < 1 {
        return Err(ParseError::new(
            line_no,
            attr.col,
            "line numbers are 1-based",
        ));
    }
    if hi + 1 < lo {
        return Err(ParseError::new(
            line_no,
            attr.col,
            format!("'lines' range {lo}..{hi} is reversed"),
        ));
    }
    Ok((lo, hi))
}

/// Anchor bodies: `0` (start-of-file), `$` (end-of-file), or `N: text`.
fn parse_anchor(rest: &str, line_no: usize) -> Result<Anchor, ParseError> {
    let rest = rest.trim_start();
    if rest == "0" {
        return Ok(Anchor::start());
    }
    if rest == "$" {
        return Ok(Anchor::end());
    }
    let Some((number, text)) = rest.split_once(':') else {
        return Err(ParseError::new(
            line_no,
            1,
            format!("anchor must be '0', '$', or 'N: text', got '{rest}'"),
        ));
    };
    let number: usize = number.trim().parse().map_err(|_| {
        ParseError::new(
            line_no,
            1,
            format!("anchor line number is not a number: '{}'", number.trim()),
        )
    })?;
    if number == 0 {
        return Ok(Anchor::start());
    }
    let text = text.strip_prefix(' ').unwrap_or(text);
    Ok(Anchor::line(number, text))
}

struct BlockAnchors {
    begin: Option<Anchor>,
    end: Option<Anchor>,
    at: Option<Anchor>,
    next: usize,
}

fn collect_anchors(lines: &[&str], mut idx: usize) -> Result<BlockAnchors, ParseError> {
    let mut anchors = BlockAnchors {
        begin: None,
        end: None,
        at: None,
        next: idx,
    };
    while idx < lines.len() {
        let trimmed = lines[idx].trim();
        let (slot, rest) = if let Some(rest) = trimmed.strip_prefix("@@begin") {
            (&mut anchors.begin, rest)
        } else if let Some(rest) = trimmed.strip_prefix("@@end") {
            (&mut anchors.end, rest)
        } else if let Some(rest) = trimmed.strip_prefix("@@at") {
            (&mut anchors.at, rest)
        } else {
            break;
        };
        if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
            break;
        }
        if slot.is_some() {
            return Err(ParseError::new(idx + 1, 1, "duplicate anchor line"));
        }
        *slot = Some(parse_anchor(rest, idx + 1)?);
        idx += 1;
    }
    anchors.next = idx;
    Ok(anchors)
}

/// Collect body lines until `<<<end>>>`. `Ok(None)` means the block ran
/// off the end of a partial stream and should be dropped.
fn collect_body(
    lines: &[&str],
    mut idx: usize,
    marker_line: usize,
    is_partial: bool,
) -> Result<Option<(String, usize)>, ParseError> {
    let mut body: Vec<String> = Vec::new();
    loop {
        if idx >= lines.len() {
            if is_partial {
                return Ok(None);
            }
            return Err(ParseError::new(
                marker_line,
                1,
                "unterminated edit block (missing <<<end>>>)",
            ));
        }
        if lines[idx].trim() == "<<<end>>>" {
            return Ok(Some((body.join("\n"), idx + 1)));
        }
        body.push(unescape(lines[idx]));
        idx += 1;
    }
}

/// A literal body line starting with `<<<` or `@@` is written with a
/// leading backslash; strip it, preserving indentation.
fn unescape(line: &str) -> String {
    let stripped = line.trim_start();
    if let Some(rest) = stripped.strip_prefix('\\')
        && (rest.starts_with("<<<") || rest.starts_with("@@"))
    {
        let indent = &line[..line.len() - stripped.len()];
        format!("{indent}{rest}")
    } else {
        line.to_string()
    }
}

type ParsedBlock = Option<(Directive, usize)>;

fn parse_edit_block(
    lines: &[&str],
    start: usize,
    inner: &str,
    is_partial: bool,
) -> Result<ParsedBlock, ParseError> {
    let line_no = start + 1;
    let attrs = parse_attrs(inner, line_no)?;
    let path = require_attr(&attrs, "path", line_no, "edit")?.value.clone();
    let range_attr = require_attr(&attrs, "lines", line_no, "edit")?;
    let (begin_line, end_line) = parse_range(range_attr, line_no)?;

    let anchors = collect_anchors(lines, start + 1)?;
    let Some(begin_anchor) = anchors.begin else {
        return Err(ParseError::new(
            line_no,
            1,
            "edit block is missing its @@begin anchor",
        ));
    };

    let Some((new_text, next)) = collect_body(lines, anchors.next, line_no, is_partial)? else {
        return Ok(None);
    };
    Ok(Some((
        Directive::ReplaceRange {
            path,
            begin_line,
            end_line,
            new_text,
            begin_anchor,
            end_anchor: anchors.end,
        },
        next,
    )))
}

fn parse_insert_block(
    lines: &[&str],
    start: usize,
    inner: &str,
    is_partial: bool,
) -> Result<ParsedBlock, ParseError> {
    let line_no = start + 1;
    let attrs = parse_attrs(inner, line_no)?;
    let path = require_attr(&attrs, "path", line_no, "insert")?.value.clone();
    let before_attr = require_attr(&attrs, "before", line_no, "insert")?;
    let before = parse_usize(before_attr, line_no)?;
    if before < 1 {
        return Err(ParseError::new(
            line_no,
            before_attr.col,
            "'before' is 1-based; use before=1 with @@at 0 for start-of-file",
        ));
    }

    let anchors = collect_anchors(lines, start + 1)?;
    let Some(at) = anchors.at else {
        return Err(ParseError::new(
            line_no,
            1,
            "insert block is missing its @@at anchor",
        ));
    };

    let Some((new_text, next)) = collect_body(lines, anchors.next, line_no, is_partial)? else {
        return Ok(None);
    };
    // Canonical encoding: an insertion replaces the empty range just
    // before `before`.
    Ok(Some((
        Directive::ReplaceRange {
            path,
            begin_line: before,
            end_line: before - 1,
            new_text,
            begin_anchor: at,
            end_anchor: None,
        },
        next,
    )))
}

fn parse_delete_marker(inner: &str, line_no: usize) -> Result<Directive, ParseError> {
    let attrs = parse_attrs(inner, line_no)?;
    let path = require_attr(&attrs, "path", line_no, "delete")?.value.clone();
    Ok(Directive::DeleteFile { path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use stitch_core::AnchorPos;

    #[test]
    fn parses_replace_block_between_prose() {
        let text = "Let me fix that off-by-one.\n\n\
            <<<edit path=\"src/lib.rs\" lines=4..7>>>\n\
            @@begin 4: fn add(a: u32, b: u32) -> u32 {\n\
            @@end 7: }\n\
            fn add(a: u32, b: u32) -> u32 {\n    a + b\n}\n\
            <<<end>>>\n\nThat should do it.\n";
        let report = parse_directives(text, false);
        assert!(report.error.is_none(), "error: {:?}", report.error);
        assert_eq!(report.directives.len(), 1);
        let Directive::ReplaceRange {
            path,
            begin_line,
            end_line,
            new_text,
            begin_anchor,
            end_anchor,
        } = &report.directives[0]
        else {
            panic!("expected ReplaceRange");
        };
        assert_eq!(path, "src/lib.rs");
        assert_eq!((*begin_line, *end_line), (4, 7));
        assert_eq!(new_text, "fn add(a: u32, b: u32) -> u32 {\n    a + b\n}");
        assert_eq!(begin_anchor.pos, AnchorPos::Line(4));
        assert_eq!(begin_anchor.text, "fn add(a: u32, b: u32) -> u32 {");
        assert_eq!(end_anchor.as_ref().unwrap().pos, AnchorPos::Line(7));
    }

    #[test]
    fn parses_insert_as_empty_range() {
        let text = "<<<insert path=\"a.txt\" before=3>>>\n@@at 2: second\nnew line\n<<<end>>>\n";
        let report = parse_directives(text, false);
        assert!(report.error.is_none());
        let Directive::ReplaceRange {
            begin_line,
            end_line,
            begin_anchor,
            ..
        } = &report.directives[0]
        else {
            panic!("expected ReplaceRange");
        };
        assert_eq!((*begin_line, *end_line), (3, 2));
        assert_eq!(begin_anchor.pos, AnchorPos::Line(2));
    }

    #[test]
    fn parses_new_file_insert_with_start_sentinel() {
        let text = "<<<insert path=\"src/new.rs\" before=1>>>\n@@at 0\npub fn f() {}\n<<<end>>>\n";
        let report = parse_directives(text, false);
        assert!(report.error.is_none());
        let Directive::ReplaceRange { begin_anchor, .. } = &report.directives[0] else {
            panic!("expected ReplaceRange");
        };
        assert_eq!(begin_anchor.pos, AnchorPos::Start);
    }

    #[test]
    fn parses_end_sentinel_anchor() {
        let text = "<<<insert path=\"a.txt\" before=9>>>\n@@at $\ntail\n<<<end>>>\n";
        let report = parse_directives(text, false);
        assert!(report.error.is_none());
        let Directive::ReplaceRange { begin_anchor, .. } = &report.directives[0] else {
            panic!("expected ReplaceRange");
        };
        assert_eq!(begin_anchor.pos, AnchorPos::End);
    }

    #[test]
    fn parses_delete_marker() {
        let report = parse_directives("<<<delete path=\"src/old.rs\">>>\n", false);
        assert!(report.error.is_none());
        assert_eq!(
            report.directives[0],
            Directive::DeleteFile {
                path: "src/old.rs".to_string()
            }
        );
    }

    #[test]
    fn empty_body_means_line_deletion() {
        let text = "<<<edit path=\"a.txt\" lines=2..3>>>\n@@begin 2: two\n<<<end>>>\n";
        let report = parse_directives(text, false);
        let Directive::ReplaceRange { new_text, .. } = &report.directives[0] else {
            panic!("expected ReplaceRange");
        };
        assert_eq!(new_text, "");
    }

    #[test]
    fn missing_path_reports_line_and_column() {
        let report = parse_directives("<<<edit lines=1..2>>>\n@@begin 1: x\ny\n<<<end>>>\n", false);
        let error = report.error.expect("error");
        assert_eq!(error.line, 1);
        assert!(error.message.contains("'path'"));
        assert!(report.directives.is_empty());
    }

    #[test]
    fn unparseable_number_reports_position() {
        let report =
            parse_directives("<<<edit path=\"a\" lines=x..2>>>\n@@begin 1: a\n<<<end>>>\n", false);
        let error = report.error.expect("error");
        assert_eq!(error.line, 1);
        assert!(error.col > 1);
        assert!(error.message.contains("lines"));
    }

    #[test]
    fn unterminated_block_errors_when_not_partial() {
        let report = parse_directives(
            "<<<edit path=\"a\" lines=1..1>>>\n@@begin 1: a\nnew\n",
            false,
        );
        let error = report.error.expect("error");
        assert!(error.message.contains("unterminated"));
        assert_eq!(error.line, 1);
    }

    #[test]
    fn unterminated_block_is_dropped_when_partial() {
        let text = "<<<edit path=\"a\" lines=1..1>>>\n@@begin 1: a\nAA\n<<<end>>>\n\
            <<<edit path=\"b\" lines=2..2>>>\n@@begin 2: b\nhalf of the repl";
        let report = parse_directives(text, true);
        assert!(report.error.is_none());
        assert_eq!(report.directives.len(), 1);
        assert_eq!(report.directives[0].path(), "a");
    }

    #[test]
    fn later_blocks_survive_an_earlier_malformed_marker() {
        let text = "<<<edit path=\"a\">>>\n\
            <<<edit path=\"b\" lines=1..1>>>\n@@begin 1: x\nY\n<<<end>>>\n";
        let report = parse_directives(text, false);
        assert!(report.error.is_some());
        assert_eq!(report.directives.len(), 1);
        assert_eq!(report.directives[0].path(), "b");
    }

    #[test]
    fn stray_end_marker_is_an_error() {
        let report = parse_directives("some prose\n<<<end>>>\n", false);
        let error = report.error.expect("error");
        assert_eq!(error.line, 2);
        assert!(error.message.contains("unexpected"));
    }

    #[test]
    fn missing_begin_anchor_is_an_error() {
        let report = parse_directives("<<<edit path=\"a\" lines=1..1>>>\nY\n<<<end>>>\n", false);
        let error = report.error.expect("error");
        assert!(error.message.contains("@@begin"));
    }

    #[test]
    fn quoted_path_supports_spaces_and_escapes() {
        let text = "<<<delete path=\"dir name/we\\\"ird.txt\">>>\n";
        let report = parse_directives(text, false);
        assert!(report.error.is_none());
        assert_eq!(report.directives[0].path(), "dir name/we\"ird.txt");
    }

    #[test]
    fn escaped_body_lines_keep_their_indentation() {
        let text = "<<<edit path=\"a\" lines=1..1>>>\n@@begin 1: x\n  \\<<<end>>> literal\n  \\@@begin literal\n<<<end>>>\n";
        let report = parse_directives(text, false);
        assert!(report.error.is_none());
        let Directive::ReplaceRange { new_text, .. } = &report.directives[0] else {
            panic!("expected ReplaceRange");
        };
        assert_eq!(new_text, "  <<<end>>> literal\n  @@begin literal");
    }

    #[test]
    fn body_keeps_interior_at_lines_verbatim() {
        // Only the run of anchor lines directly after the marker is
        // special; later `@@` lines are body content.
        let text =
            "<<<edit path=\"a\" lines=1..1>>>\n@@begin 1: x\nfirst\n@@ hunk-looking line\n<<<end>>>\n";
        let report = parse_directives(text, false);
        assert!(report.error.is_none());
        let Directive::ReplaceRange { new_text, .. } = &report.directives[0] else {
            panic!("expected ReplaceRange");
        };
        assert_eq!(new_text, "first\n@@ hunk-looking line");
    }

    #[test]
    fn prose_only_yields_nothing() {
        let report = parse_directives("All the requested changes are complete.\n", false);
        assert!(report.error.is_none());
        assert!(report.directives.is_empty());
    }

    #[test]
    fn crlf_input_parses() {
        let text = "<<<edit path=\"a\" lines=1..1>>>\r\n@@begin 1: x\r\nY\r\n<<<end>>>\r\n";
        let report = parse_directives(text, false);
        assert!(report.error.is_none(), "error: {:?}", report.error);
        assert_eq!(report.directives.len(), 1);
    }

    #[test]
    fn reversed_range_is_an_error() {
        let report =
            parse_directives("<<<edit path=\"a\" lines=5..2>>>\n@@begin 5: x\n<<<end>>>\n", false);
        assert!(report.error.expect("error").message.contains("reversed"));
    }

    #[test]
    fn two_blocks_parse_in_order() {
        let text = "<<<edit path=\"a\" lines=1..1>>>\n@@begin 1: one\nONE\n<<<end>>>\n\
            junk between\n\
            <<<edit path=\"b\" lines=2..2>>>\n@@begin 2: two\nTWO\n<<<end>>>\n";
        let report = parse_directives(text, false);
        assert_eq!(report.directives.len(), 2);
        assert_eq!(report.directives[0].path(), "a");
        assert_eq!(report.directives[1].path(), "b");
    }
}
