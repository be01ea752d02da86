//! Built-in language parsers for the pre-build parse check.

use stitch_core::{Diagnostic, DiagnosticCategory, LanguageParser, Severity};

/// Delimiter- and literal-aware scan over Rust source. Reports unbalanced
/// brackets and unterminated literals as SYNTAX diagnostics; everything
/// subtler is left to the build oracle.
#[derive(Debug, Default, Clone, Copy)]
pub struct RustSyntaxParser;

impl LanguageParser for RustSyntaxParser {
    fn language(&self) -> &'static str {
        "rust"
    }

    fn handles(&self, rel_path: &str) -> bool {
        rel_path.ends_with(".rs")
    }

    fn parse(&self, rel_path: &str, source: &str) -> Vec<Diagnostic> {
        scan(rel_path, source)
    }
}

#[derive(Clone, Copy)]
struct Pos {
    line: usize,
    col: usize,
}

fn diagnostic(path: &str, at: Pos, message: String, problem_id: &str) -> Diagnostic {
    Diagnostic {
        path: path.to_string(),
        line: at.line,
        col: at.col,
        severity: Severity::Error,
        category: DiagnosticCategory::Syntax,
        message,
        problem_id: Some(problem_id.to_string()),
    }
}

fn scan(path: &str, source: &str) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let mut stack: Vec<(char, Pos)> = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1usize;
    let mut col = 1usize;

    macro_rules! bump {
        ($c:expr) => {
            if $c == '\n' {
                line += 1;
                col = 1;
            } else {
                col += 1;
            }
        };
    }

    while let Some(c) = chars.next() {
        let at = Pos { line, col };
        bump!(c);
        match c {
            '/' if chars.peek() == Some(&'/') => {
                for c in chars.by_ref() {
                    bump!(c);
                    if c == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                let mut depth = 1u32;
                let mut prev = '\0';
                // Consume the '*' so "/*/" is not taken as open+close.
                if let Some(star) = chars.next() {
                    bump!(star);
                }
                for c in chars.by_ref() {
                    bump!(c);
                    if prev == '/' && c == '*' {
                        depth += 1;
                        prev = '\0';
                    } else if prev == '*' && c == '/' {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                        prev = '\0';
                    } else {
                        prev = c;
                    }
                }
                if depth > 0 {
                    diagnostics.push(diagnostic(
                        path,
                        at,
                        "unterminated block comment".to_string(),
                        "unterminated-comment",
                    ));
                }
            }
            '"' => {
                let mut terminated = false;
                while let Some(c) = chars.next() {
                    bump!(c);
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                bump!(escaped);
                            }
                        }
                        '"' => {
                            terminated = true;
                            break;
                        }
                        _ => {}
                    }
                }
                if !terminated {
                    diagnostics.push(diagnostic(
                        path,
                        at,
                        "unterminated string literal".to_string(),
                        "unterminated-string",
                    ));
                }
            }
            '\'' => {
                // A char literal closes with a quote within a couple of
                // characters; a lifetime never closes. Only consume input
                // for the literal case.
                let mut lookahead = chars.clone();
                let is_char_literal = match lookahead.next() {
                    Some('\\') => true,
                    Some(_) => lookahead.next() == Some('\''),
                    None => false,
                };
                if is_char_literal {
                    let mut escaped = false;
                    while let Some(c) = chars.next() {
                        bump!(c);
                        if escaped {
                            escaped = false;
                        } else if c == '\\' {
                            escaped = true;
                        } else if c == '\'' {
                            break;
                        }
                    }
                }
            }
            '(' | '[' | '{' => stack.push((c, at)),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, open_at)) => {
                        diagnostics.push(diagnostic(
                            path,
                            at,
                            format!(
                                "mismatched '{c}'; expected a close for '{open}' opened at {}:{}",
                                open_at.line, open_at.col
                            ),
                            "unbalanced-delimiter",
                        ));
                    }
                    None => {
                        diagnostics.push(diagnostic(
                            path,
                            at,
                            format!("unmatched closing '{c}'"),
                            "unbalanced-delimiter",
                        ));
                    }
                }
            }
            _ => {}
        }
    }

    for (open, at) in stack {
        diagnostics.push(diagnostic(
            path,
            at,
            format!("unclosed '{open}'"),
            "unbalanced-delimiter",
        ));
    }
    diagnostics
}

#[cfg(test)]
mod tests {
    use super::*;

    fn findings(source: &str) -> Vec<Diagnostic> {
        RustSyntaxParser.parse("x.rs", source)
    }

    #[test]
    fn balanced_source_is_clean() {
        let src = r#"
fn main() {
    let xs = vec![1, 2, 3];
    let doubled: Vec<u32> = xs.iter().map(|x| x * 2).collect();
    println!("{:?}", doubled);
}
"#;
        assert!(findings(src).is_empty());
    }

    #[test]
    fn unclosed_brace_is_reported_at_its_opening() {
        let found = findings("fn main() {\n    let x = 1;\n");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].category, DiagnosticCategory::Syntax);
        assert_eq!(found[0].line, 1);
        assert!(found[0].message.contains("unclosed '{'"));
    }

    #[test]
    fn unmatched_close_is_reported() {
        let found = findings("fn main() { } }\n");
        assert_eq!(found.len(), 1);
        assert!(found[0].message.contains("unmatched closing '}'"));
    }

    #[test]
    fn mismatched_pair_is_reported() {
        let found = findings("fn f(x: [u32; 2) {}\n");
        assert!(!found.is_empty());
        assert!(found[0].message.contains("mismatched"));
    }

    #[test]
    fn brackets_inside_strings_and_comments_are_ignored() {
        let src = "fn f() {\n    let s = \"}}})\";\n    // )))\n    /* {{{ */\n}\n";
        assert!(findings(src).is_empty());
    }

    #[test]
    fn char_literals_and_lifetimes_do_not_confuse_the_scan() {
        let src = "fn f<'a>(x: &'a str) -> char {\n    let c = '}';\n    let esc = '\\'';\n    c\n}\n";
        assert!(findings(src).is_empty());
    }

    #[test]
    fn unterminated_string_is_reported() {
        let found = findings("fn f() { let s = \"oops; }\n");
        assert!(
            found
                .iter()
                .any(|d| d.message.contains("unterminated string"))
        );
    }

    #[test]
    fn handles_only_rust_files() {
        assert!(RustSyntaxParser.handles("src/main.rs"));
        assert!(!RustSyntaxParser.handles("src/main.py"));
    }
}
