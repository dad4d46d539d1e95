//! Lexical masking shared by the validators.
//!
//! Pattern checks must not fire inside comments or string literals, so both validators work on
//! a masked copy of the text where comment characters (and optionally string contents) are
//! replaced by spaces. Masking keeps every byte offset and newline in place, so offsets found
//! in the masked text map directly to lines of the original.

/// Comment and quoting rules of a target grammar.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Grammar {
    /// `//` and `/* */` comments, `'…'` strings and `"…"` identifiers with backslash escapes.
    Cql,
    /// `--` and `/* */` comments, `'…'` strings with doubled-quote escapes.
    Sql,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Code,
    LineComment,
    BlockComment,
    Quoted(char),
}

/// Masked text plus lexical problems found while masking.
#[derive(Clone, Debug)]
pub(crate) struct Masked {
    pub text: String,
    /// Byte offset of a quote that is never closed.
    pub unterminated_quote: Option<(usize, char)>,
}

fn blank(out: &mut String, c: char) {
    if c == '\n' {
        out.push('\n');
    } else {
        for _ in 0..c.len_utf8() {
            out.push(' ');
        }
    }
}

/// Masks comments, and string contents when `strings` is set. Quote characters themselves are
/// always kept.
pub(crate) fn mask(code: &str, grammar: Grammar, strings: bool) -> Masked {
    let mut out = String::with_capacity(code.len());
    let mut state = State::Code;
    let mut quote_start = 0;
    let mut chars = code.char_indices().peekable();
    let line_comment = match grammar {
        Grammar::Cql => '/',
        Grammar::Sql => '-',
    };

    while let Some((offset, c)) = chars.next() {
        let next = chars.peek().map(|(_, n)| *n);
        match state {
            State::Code => {
                if c == line_comment && next == Some(line_comment) {
                    state = State::LineComment;
                    blank(&mut out, c);
                } else if c == '/' && next == Some('*') {
                    state = State::BlockComment;
                    blank(&mut out, c);
                    chars.next();
                    blank(&mut out, '*');
                } else if c == '\'' || (c == '"' && grammar == Grammar::Cql) {
                    state = State::Quoted(c);
                    quote_start = offset;
                    out.push(c);
                } else {
                    out.push(c);
                }
            }
            State::LineComment => {
                if c == '\n' {
                    state = State::Code;
                }
                blank(&mut out, c);
            }
            State::BlockComment => {
                if c == '*' && next == Some('/') {
                    state = State::Code;
                    blank(&mut out, c);
                    chars.next();
                    blank(&mut out, '/');
                } else {
                    blank(&mut out, c);
                }
            }
            State::Quoted(quote) => {
                let keep = |out: &mut String, ch: char| {
                    if strings {
                        blank(out, ch);
                    } else {
                        out.push(ch);
                    }
                };
                if c == '\\' && grammar == Grammar::Cql {
                    keep(&mut out, c);
                    if let Some((_, escaped)) = chars.next() {
                        keep(&mut out, escaped);
                    }
                } else if c == quote && grammar == Grammar::Sql && next == Some(quote) {
                    keep(&mut out, c);
                    chars.next();
                    keep(&mut out, quote);
                } else if c == quote {
                    state = State::Code;
                    out.push(c);
                } else {
                    keep(&mut out, c);
                }
            }
        }
    }

    let unterminated_quote = match state {
        State::Quoted(quote) => Some((quote_start, quote)),
        _ => None,
    };
    Masked {
        text: out,
        unterminated_quote,
    }
}

/// 1-based line of a byte offset.
pub(crate) fn line_of(text: &str, offset: usize) -> usize {
    text.as_bytes()[..offset.min(text.len())]
        .iter()
        .filter(|b| **b == b'\n')
        .count()
        + 1
}

/// A parenthesis that has no partner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ParenProblem {
    UnexpectedClose { line: usize },
    Unclosed { line: usize },
}

/// Checks parenthesis balance over masked text.
pub(crate) fn paren_problems(masked: &str) -> Vec<ParenProblem> {
    let mut problems = Vec::new();
    let mut open = Vec::new();
    let mut line = 1;
    for c in masked.chars() {
        match c {
            '\n' => line += 1,
            '(' => open.push(line),
            ')' => {
                if open.pop().is_none() {
                    problems.push(ParenProblem::UnexpectedClose { line });
                }
            }
            _ => {}
        }
    }
    problems.extend(open.into_iter().map(|line| ParenProblem::Unclosed { line }));
    problems
}

/// Byte offset of the parenthesis closing the one at `open`, in masked text.
pub(crate) fn matching_paren(masked: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (offset, c) in masked[open..].char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(open + offset);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_keeps_offsets_and_newlines() {
        let code = "a -- (x)\nb /* ( */ 'it''s (' c";
        let masked = mask(code, Grammar::Sql, true);
        assert_eq!(masked.text.len(), code.len());
        assert_eq!(masked.text.lines().count(), 2);
        assert!(!masked.text.contains('('));
        assert!(masked.text.ends_with("' c"));
        assert!(masked.unterminated_quote.is_none());
    }

    #[test]
    fn test_mask_without_strings_keeps_literals() {
        let masked = mask("x = 'A' // note", Grammar::Cql, false);
        assert_eq!(masked.text.trim_end(), "x = 'A'");
    }

    #[test]
    fn test_cql_escaped_quote_inside_identifier() {
        let masked = mask(r#"define "Say \"hi\"": true"#, Grammar::Cql, true);
        assert!(masked.unterminated_quote.is_none());
        assert!(masked.text.ends_with(": true"));
    }

    #[test]
    fn test_unterminated_quote_reports_start() {
        let masked = mask("a\nb 'open", Grammar::Sql, true);
        assert_eq!(masked.unterminated_quote, Some((4, '\'')));
        assert_eq!(line_of("a\nb 'open", 4), 2);
    }

    #[test]
    fn test_paren_problems_report_lines() {
        assert_eq!(
            paren_problems("(\n)\n)"),
            vec![ParenProblem::UnexpectedClose { line: 3 }]
        );
        assert_eq!(
            paren_problems("x\n(("),
            vec![
                ParenProblem::Unclosed { line: 2 },
                ParenProblem::Unclosed { line: 2 }
            ]
        );
    }

    #[test]
    fn test_matching_paren() {
        let text = "A AS (SELECT (1) FROM t) x";
        assert_eq!(matching_paren(text, 5), Some(23));
    }
}
