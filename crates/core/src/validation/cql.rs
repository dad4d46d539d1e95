use super::scan::{line_of, mask, paren_problems, Grammar, ParenProblem};
use super::{IssueCollector, ValidationIssue, ValidationResult};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

static LIBRARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*library\s+[A-Za-z_]\w*").expect("valid regex"));
static USING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*using\s+[A-Za-z_]\w*").expect("valid regex"));
static CONTEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*context\s+Patient\b").expect("valid regex"));
static DEFINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*define\s+(?:(?:public|private)\s+)?(?:function\s+)?"((?:[^"\\]|\\.)*)""#)
        .expect("valid regex")
});
static VALUESET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*valueset\s+"((?:[^"\\]|\\.)*)"\s*:"#).expect("valid regex")
});
static RETRIEVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\[\s*[A-Za-z]\w*\s*:\s*"((?:[^"\\]|\\.)*)"\s*\]"#).expect("valid regex")
});
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:/\*|//)\s*WARNING:\s*([^\n*]*)").expect("valid regex"));

/// Structural checks for clinical-query library text.
///
/// This is a zero-sized type used for namespacing.
pub struct CqlValidator;

impl CqlValidator {
    /// Validates clinical-query text.
    ///
    /// A bare syntax pass (balanced parentheses, terminated quotes) runs first; any failure
    /// there forces the score to 0. Declaration checks follow and only lower the score.
    pub fn validate(code: &str) -> ValidationResult {
        let mut issues = IssueCollector::default();
        let masked = mask(code, Grammar::Cql, true);

        let mut syntax_failed = false;
        for problem in paren_problems(&masked.text) {
            syntax_failed = true;
            let issue = match problem {
                ParenProblem::UnexpectedClose { line } => ValidationIssue::error(
                    "UNBALANCED_PARENTHESES",
                    format!("Unexpected closing parenthesis on line {line}"),
                )
                .at_line(line),
                ParenProblem::Unclosed { line } => ValidationIssue::error(
                    "UNBALANCED_PARENTHESES",
                    format!("Parenthesis opened on line {line} is never closed"),
                )
                .at_line(line),
            };
            issues.push(issue);
        }
        if let Some((offset, quote)) = masked.unterminated_quote {
            syntax_failed = true;
            let line = line_of(code, offset);
            let what = if quote == '"' { "identifier" } else { "string" };
            issues.push(
                ValidationIssue::error(
                    "UNTERMINATED_STRING",
                    format!("Quoted {what} opened on line {line} is never closed"),
                )
                .at_line(line)
                .with_suggestion(format!("Add the closing {quote} quote")),
            );
        }

        let plain = mask(code, Grammar::Cql, false).text;
        Self::declarations(&plain, &mut issues);
        Self::placeholders(code, &mut issues);

        issues.finish(syntax_failed)
    }

    fn declarations(plain: &str, issues: &mut IssueCollector) {
        if !LIBRARY.is_match(plain) {
            issues.push(
                ValidationIssue::warning("MISSING_LIBRARY", "No library declaration found")
                    .with_suggestion("Start the file with `library <Name> version '<version>'`"),
            );
        }
        if !USING.is_match(plain) {
            issues.push(
                ValidationIssue::warning("MISSING_USING", "No data model `using` declaration found")
                    .with_suggestion("Add `using QICore version '4.1.1'`"),
            );
        }
        if !CONTEXT.is_match(plain) {
            issues.push(
                ValidationIssue::warning("MISSING_CONTEXT", "No `context Patient` statement found")
                    .with_suggestion("Add `context Patient` before the definitions"),
            );
        }

        let mut seen: HashMap<String, usize> = HashMap::new();
        for capture in DEFINE.captures_iter(plain) {
            let Some(name) = capture.get(1) else { continue };
            let line = line_of(plain, name.start());
            if let Some(first) = seen.get(name.as_str()) {
                issues.push(
                    ValidationIssue::warning(
                        "DUPLICATE_DEFINITION",
                        format!(
                            "Definition \"{}\" is already defined on line {first}",
                            name.as_str()
                        ),
                    )
                    .at_line(line),
                );
            } else {
                seen.insert(name.as_str().to_string(), line);
            }
        }
        if !seen.contains_key("Initial Population") {
            issues.push(
                ValidationIssue::warning(
                    "MISSING_INITIAL_POPULATION",
                    "No \"Initial Population\" definition found",
                )
                .with_suggestion("Define \"Initial Population\""),
            );
        }

        let declared: HashSet<&str> = VALUESET
            .captures_iter(plain)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();
        let mut reported = HashSet::new();
        for capture in RETRIEVE.captures_iter(plain) {
            let Some(name) = capture.get(1) else { continue };
            if declared.contains(name.as_str()) || !reported.insert(name.as_str()) {
                continue;
            }
            issues.push(
                ValidationIssue::warning(
                    "UNDECLARED_VALUE_SET",
                    format!("Value set \"{}\" is retrieved but never declared", name.as_str()),
                )
                .at_line(line_of(plain, name.start()))
                .with_suggestion(format!(
                    "Declare `valueset \"{}\": '<url>'`",
                    name.as_str()
                )),
            );
        }
    }

    fn placeholders(code: &str, issues: &mut IssueCollector) {
        for capture in PLACEHOLDER.captures_iter(code) {
            let (Some(whole), Some(text)) = (capture.get(0), capture.get(1)) else {
                continue;
            };
            issues.push(
                ValidationIssue::info("GENERATOR_WARNING", text.as_str().trim().to_string())
                    .at_line(line_of(code, whole.start())),
            );
        }
    }
}
