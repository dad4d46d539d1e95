//! Structural checks for the generated T-SQL script.
//!
//! All pattern checks run over masked text (see [`super::scan`]), so nothing inside a comment
//! or string literal can trip them. Dangerous statements hidden in comments are found by a
//! separate pass over the comment text alone.

use super::scan::{line_of, mask, matching_paren, Grammar};
use super::{IssueCollector, ValidationIssue, ValidationResult};
use crate::config::ValidationConfig;
use crate::constants::{
    DEMOGRAPHICS_CTE, ONTOLOGY_CTE, PREDICATE_CTE_PREFIX, REQUIRED_PREDICATE_COLUMNS,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;

static CTE_HEAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[ \t]*(?:WITH[ \t]+|,[ \t]*)?([A-Za-z_]\w*)[ \t]+AS[ \t]*\(")
        .expect("valid regex")
});
static DANGEROUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bDROP\s+(?:TABLE|VIEW|DATABASE|SCHEMA|PROCEDURE|FUNCTION|INDEX)\b|\bTRUNCATE\s+TABLE\b|\bDELETE\s+FROM\b|\bINSERT\s+INTO\b|\bUPDATE\s+[\w.\[\]]+\s+SET\b|\bEXEC(?:UTE)?\s*\(|\bxp_cmdshell\b",
    )
    .expect("valid regex")
});
static FORBIDDEN_DATES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("CURRENT_DATE", r"(?i)\bCURRENT_DATE\b"),
        ("NOW()", r"(?i)\bNOW\s*\(\s*\)"),
        ("GETDATE()", r"(?i)\bGETDATE\s*\("),
        ("SYSDATE", r"(?i)\bSYSDATE\b"),
        ("DATE_ADD", r"(?i)\bDATE_ADD\s*\("),
        ("DATE_SUB", r"(?i)\bDATE_SUB\s*\("),
        ("INTERVAL '...'", r"(?i)\bINTERVAL\s*'"),
        ("DATE '...'", r"(?i)\bDATE\s+'"),
        ("EXTRACT(", r"(?i)\bEXTRACT\s*\("),
        ("TO_DATE(", r"(?i)\bTO_DATE\s*\("),
    ]
    .into_iter()
    .map(|(label, pattern)| (label, Regex::new(pattern).expect("valid regex")))
    .collect()
});
static APPROVED_DATES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:DATEADD|DATEDIFF|EOMONTH|DATEFROMPARTS)\s*\(|\bAS\s+DATE\s*\)")
        .expect("valid regex")
});
static POPULATION_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bpopulation_id\b").expect("valid regex"));
static POPULATION_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bpopulation_id\s*=\s*'((?:[^']|'')*)'").expect("valid regex")
});
static ONTOLOGY_JOIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bJOIN\s+ONT\b").expect("valid regex"));
static CONCEPT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b\w+_concept_name\b").expect("valid regex"));
static UNQUOTED_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*\w+\s*\}\}").expect("valid regex"));
static FROM_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bFROM\b").expect("valid regex"));
static SELECT_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*SELECT(?:\s+DISTINCT)?\b").expect("valid regex"));
static CLAUSE_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:(?:INNER|LEFT|RIGHT|FULL|CROSS)(?:\s+OUTER)?\s+)?JOIN\b|\bWHERE\b|\bGROUP\s+BY\b|\bORDER\s+BY\b|\bHAVING\b",
    )
    .expect("valid regex")
});
static ON_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bON\b").expect("valid regex"));
static ALIAS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:\bAS\s+)?([A-Za-z_]\w*)\s*$").expect("valid regex"));

// ============================================================================
// Detailed output
// ============================================================================

/// CTEs referenced by name inside another CTE's body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CteDependency {
    pub name: String,
    pub depends_on: Vec<String>,
}

/// Best-effort description of one CTE.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CteDetail {
    pub name: String,
    pub line: usize,
    /// Selected column aliases.
    pub columns: Vec<String>,
    pub join_conditions: Vec<String>,
    pub where_conditions: Vec<String>,
}

/// Validation result plus introspection of the CTE chain. The introspection never affects the
/// score.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedValidation {
    pub result: ValidationResult,
    pub dependency_graph: Vec<CteDependency>,
    pub ctes: Vec<CteDetail>,
}

// ============================================================================
// Scanning
// ============================================================================

struct Cte {
    name: String,
    line: usize,
    /// Byte range of the body, between the parentheses.
    body: std::ops::Range<usize>,
}

struct Script<'a> {
    code: &'a str,
    /// Comments and string contents blanked.
    masked: String,
    /// Comments blanked, string literals kept.
    literals: String,
    ctes: Vec<Cte>,
}

impl<'a> Script<'a> {
    fn scan(code: &'a str) -> Self {
        let masked = mask(code, Grammar::Sql, true).text;
        let literals = mask(code, Grammar::Sql, false).text;
        let ctes = CTE_HEAD
            .captures_iter(&masked)
            .filter_map(|capture| {
                let (whole, name) = (capture.get(0)?, capture.get(1)?);
                let open = whole.end() - 1;
                let close = matching_paren(&masked, open).unwrap_or(masked.len());
                Some(Cte {
                    name: name.as_str().to_string(),
                    line: line_of(code, name.start()),
                    body: open + 1..close,
                })
            })
            .collect();
        Self {
            code,
            masked,
            literals,
            ctes,
        }
    }

    fn cte(&self, name: &str) -> Option<(usize, &Cte)> {
        self.ctes
            .iter()
            .enumerate()
            .find(|(_, cte)| cte.name.eq_ignore_ascii_case(name))
    }

    fn masked_body(&self, cte: &Cte) -> &str {
        &self.masked[cte.body.clone()]
    }

    /// Comment text only; everything else blanked.
    fn comments(&self) -> String {
        let bytes: Vec<u8> = self
            .code
            .bytes()
            .zip(self.literals.bytes())
            .map(|(original, masked)| match original {
                b'\n' => b'\n',
                _ if original != masked => original,
                _ => b' ',
            })
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Select list of a CTE body, up to its first top-level `FROM`.
    fn select_clause(&self, cte: &Cte) -> std::ops::Range<usize> {
        let body = self.masked_body(cte);
        let end = FROM_KEYWORD
            .find_iter(body)
            .find(|m| depth_at(body, m.start()) == 0)
            .map(|m| m.start())
            .unwrap_or(body.len());
        let start = SELECT_KEYWORD.find(body).map(|m| m.end()).unwrap_or(0);
        cte.body.start + start.min(end)..cte.body.start + end
    }
}

fn depth_at(text: &str, offset: usize) -> i32 {
    text[..offset].chars().fold(0, |depth, c| match c {
        '(' => depth + 1,
        ')' => depth - 1,
        _ => depth,
    })
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_parameter_placeholder(value: &str) -> bool {
    let value = value.trim();
    (value.starts_with("{{") && value.ends_with("}}"))
        || (value.starts_with("${") && value.ends_with('}'))
        || value.starts_with('@')
        || value.starts_with(':')
}

// ============================================================================
// Validator
// ============================================================================

/// Structural checks for CTE-based T-SQL.
///
/// This is a zero-sized type used for namespacing.
pub struct SqlValidator;

impl SqlValidator {
    /// Validates a SQL script against the platform conventions.
    ///
    /// # Arguments
    ///
    /// * `code` - Script text, typically produced by [`crate::SqlGenerator`].
    /// * `config` - Supplies the expected population id, if any.
    ///
    /// # Returns
    ///
    /// A [`ValidationResult`]. Missing mandatory CTEs, a missing population scope and dangerous
    /// statements are errors; every other finding is a warning.
    pub fn validate(code: &str, config: &ValidationConfig) -> ValidationResult {
        let script = Script::scan(code);
        Self::check(&script, config)
    }

    /// Like [`SqlValidator::validate`], plus the CTE dependency graph and per-CTE details.
    pub fn validate_detailed(code: &str, config: &ValidationConfig) -> DetailedValidation {
        let script = Script::scan(code);
        let result = Self::check(&script, config);
        DetailedValidation {
            result,
            dependency_graph: Self::dependency_graph(&script),
            ctes: script.ctes.iter().map(|cte| Self::detail(&script, cte)).collect(),
        }
    }

    fn check(script: &Script<'_>, config: &ValidationConfig) -> ValidationResult {
        let mut issues = IssueCollector::default();
        Self::dangerous_statements(script, &mut issues);
        Self::required_ctes(script, &mut issues);
        Self::cte_names(script, &mut issues);
        Self::required_columns(script, &mut issues);
        Self::date_functions(script, &mut issues);
        Self::population_scope(script, config, &mut issues);
        Self::demographics(script, &mut issues);
        Self::placeholders(script, &mut issues);
        tracing::debug!(
            ctes = script.ctes.len(),
            has_errors = issues.has_errors(),
            "sql structural checks complete"
        );
        issues.finish(false)
    }

    fn dangerous_statements(script: &Script<'_>, issues: &mut IssueCollector) {
        for found in DANGEROUS.find_iter(&script.masked) {
            issues.push(
                ValidationIssue::error(
                    "DANGEROUS_STATEMENT",
                    format!("Statement `{}` is not allowed", collapse(found.as_str())),
                )
                .at_line(line_of(script.code, found.start()))
                .with_suggestion("Remove the statement; generated scripts only create views"),
            );
        }
        let comments = script.comments();
        for found in DANGEROUS.find_iter(&comments) {
            issues.push(
                ValidationIssue::error(
                    "DANGEROUS_COMMENT",
                    format!(
                        "Comment contains the statement `{}`",
                        collapse(found.as_str())
                    ),
                )
                .at_line(line_of(script.code, found.start())),
            );
        }
    }

    fn required_ctes(script: &Script<'_>, issues: &mut IssueCollector) {
        for required in [ONTOLOGY_CTE, DEMOGRAPHICS_CTE] {
            if script.cte(required).is_none() {
                issues.push(
                    ValidationIssue::error(
                        "MISSING_REQUIRED_CTE",
                        format!("Required CTE {required} is missing"),
                    )
                    .with_suggestion(format!("Add the {required} CTE to the WITH chain")),
                );
            }
        }
        if let (Some((ont, _)), Some((demog, cte))) =
            (script.cte(ONTOLOGY_CTE), script.cte(DEMOGRAPHICS_CTE))
        {
            if demog < ont {
                issues.push(
                    ValidationIssue::warning(
                        "CTE_ORDER",
                        format!("{DEMOGRAPHICS_CTE} is declared before {ONTOLOGY_CTE}"),
                    )
                    .at_line(cte.line)
                    .with_suggestion(format!(
                        "Declare {ONTOLOGY_CTE} before {DEMOGRAPHICS_CTE}"
                    )),
                );
            }
        }
    }

    fn cte_names(script: &Script<'_>, issues: &mut IssueCollector) {
        for cte in &script.ctes {
            let system = cte.name.eq_ignore_ascii_case(ONTOLOGY_CTE)
                || cte.name.eq_ignore_ascii_case(DEMOGRAPHICS_CTE);
            if system || cte.name.starts_with(PREDICATE_CTE_PREFIX) {
                continue;
            }
            issues.push(
                ValidationIssue::warning(
                    "CTE_NAMING",
                    format!(
                        "CTE \"{}\" does not carry the {PREDICATE_CTE_PREFIX} prefix",
                        cte.name
                    ),
                )
                .at_line(cte.line)
                .with_suggestion(format!(
                    "Rename \"{}\" to \"{PREDICATE_CTE_PREFIX}{}\"",
                    cte.name,
                    cte.name.to_uppercase()
                )),
            );
        }
    }

    fn required_columns(script: &Script<'_>, issues: &mut IssueCollector) {
        for cte in script
            .ctes
            .iter()
            .filter(|cte| cte.name.starts_with(PREDICATE_CTE_PREFIX))
        {
            let select = &script.masked[script.select_clause(cte)];
            for column in REQUIRED_PREDICATE_COLUMNS {
                let selected = select
                    .match_indices(column)
                    .any(|(at, _)| is_word_at(select, at, column.len()));
                if !selected {
                    issues.push(
                        ValidationIssue::warning(
                            "MISSING_REQUIRED_COLUMN",
                            format!("{} does not select {column}", cte.name),
                        )
                        .at_line(cte.line)
                        .with_suggestion(format!("Select src.{column} in {}", cte.name)),
                    );
                }
            }
        }
    }

    fn date_functions(script: &Script<'_>, issues: &mut IssueCollector) {
        let mut forbidden_found = false;
        for (label, pattern) in FORBIDDEN_DATES.iter() {
            if let Some(found) = pattern.find(&script.masked) {
                forbidden_found = true;
                issues.push(
                    ValidationIssue::warning(
                        "NON_STANDARD_DATE_FUNCTION",
                        format!("{label} is not an approved date construct"),
                    )
                    .at_line(line_of(script.code, found.start()))
                    .with_suggestion(
                        "Use DATEADD, DATEDIFF, EOMONTH, DATEFROMPARTS or CAST(... AS DATE)",
                    ),
                );
            }
        }
        if forbidden_found && APPROVED_DATES.is_match(&script.masked) {
            issues.push(ValidationIssue::warning(
                "MIXED_DATE_FUNCTIONS",
                "Approved and generic date constructs are mixed in one script",
            ));
        }
    }

    fn population_scope(
        script: &Script<'_>,
        config: &ValidationConfig,
        issues: &mut IssueCollector,
    ) {
        if !POPULATION_REFERENCE.is_match(&script.literals) {
            issues.push(
                ValidationIssue::error(
                    "MISSING_POPULATION_SCOPE",
                    "No population_id filter found; rows are not scoped to a population",
                )
                .with_suggestion("Filter every row source on population_id"),
            );
            return;
        }
        let Some(expected) = config
            .population_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        else {
            return;
        };
        let mut reported = HashSet::new();
        for capture in POPULATION_LITERAL.captures_iter(&script.literals) {
            let Some(value) = capture.get(1) else { continue };
            let literal = value.as_str().replace("''", "'");
            if literal == expected
                || is_parameter_placeholder(&literal)
                || !reported.insert(literal.clone())
            {
                continue;
            }
            issues.push(
                ValidationIssue::warning(
                    "POPULATION_ID_MISMATCH",
                    format!("population_id literal '{literal}' does not match '{expected}'"),
                )
                .at_line(line_of(script.code, value.start()))
                .with_suggestion(format!("Use '{expected}' or a parameter placeholder")),
            );
        }
    }

    fn demographics(script: &Script<'_>, issues: &mut IssueCollector) {
        let Some((_, cte)) = script.cte(DEMOGRAPHICS_CTE) else {
            return;
        };
        let body = script.masked_body(cte);
        if !ONTOLOGY_JOIN.is_match(body) {
            issues.push(
                ValidationIssue::warning(
                    "DEMOG_MISSING_ONTOLOGY_JOIN",
                    format!("{DEMOGRAPHICS_CTE} does not join {ONTOLOGY_CTE}"),
                )
                .at_line(cte.line)
                .with_suggestion(format!(
                    "LEFT JOIN {ONTOLOGY_CTE} once per ontology context"
                )),
            );
        }
        if !CONCEPT_NAME.is_match(body) {
            issues.push(
                ValidationIssue::warning(
                    "DEMOG_MISSING_CONCEPT_NAMES",
                    format!("{DEMOGRAPHICS_CTE} selects no *_concept_name columns"),
                )
                .at_line(cte.line)
                .with_suggestion("Select <context>_concept_name for each ontology context"),
            );
        }
    }

    fn placeholders(script: &Script<'_>, issues: &mut IssueCollector) {
        for found in UNQUOTED_PLACEHOLDER.find_iter(&script.masked) {
            issues.push(
                ValidationIssue::warning(
                    "UNQUOTED_PLACEHOLDER",
                    format!("Template placeholder {} is not quoted", found.as_str()),
                )
                .at_line(line_of(script.code, found.start()))
                .with_suggestion(format!("Write '{}'", found.as_str())),
            );
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    fn dependency_graph(script: &Script<'_>) -> Vec<CteDependency> {
        script
            .ctes
            .iter()
            .map(|cte| {
                let body = script.masked_body(cte);
                let depends_on = script
                    .ctes
                    .iter()
                    .filter(|other| other.name != cte.name)
                    .filter(|other| {
                        body.match_indices(other.name.as_str())
                            .any(|(at, _)| is_word_at(body, at, other.name.len()))
                    })
                    .map(|other| other.name.clone())
                    .collect();
                CteDependency {
                    name: cte.name.clone(),
                    depends_on,
                }
            })
            .collect()
    }

    fn detail(script: &Script<'_>, cte: &Cte) -> CteDetail {
        let select = script.select_clause(cte);
        let columns = split_top_level(&script.masked[select.clone()])
            .into_iter()
            .filter_map(|range| {
                let item = &script.masked[select.start + range.start..select.start + range.end];
                ALIAS
                    .captures(item.trim_end())
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string())
            })
            .collect();

        let body = script.masked_body(cte);
        let keywords: Vec<(usize, usize)> = CLAUSE_KEYWORD
            .find_iter(body)
            .filter(|m| depth_at(body, m.start()) == 0)
            .map(|m| (m.start(), m.end()))
            .collect();
        let mut join_conditions = Vec::new();
        let mut where_conditions = Vec::new();
        for (index, (start, end)) in keywords.iter().enumerate() {
            let segment_end = keywords
                .get(index + 1)
                .map(|(next, _)| *next)
                .unwrap_or(body.len());
            let keyword = body[*start..*end].to_ascii_uppercase();
            let original = &script.code[cte.body.start + end..cte.body.start + segment_end];
            if keyword.ends_with("JOIN") {
                let masked_segment = &body[*end..segment_end];
                if let Some(on) = ON_KEYWORD.find(masked_segment) {
                    join_conditions.push(collapse(&original[on.end()..]));
                }
            } else if keyword == "WHERE" {
                where_conditions.push(collapse(original));
            }
        }

        CteDetail {
            name: cte.name.clone(),
            line: cte.line,
            columns,
            join_conditions,
            where_conditions,
        }
    }
}

fn is_word_at(text: &str, at: usize, len: usize) -> bool {
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    let bytes = text.as_bytes();
    let before = at == 0 || !is_word(bytes[at - 1]);
    let after = at + len >= bytes.len() || !is_word(bytes[at + len]);
    before && after
}

/// Ranges of comma-separated items at parenthesis depth 0.
fn split_top_level(text: &str) -> Vec<std::ops::Range<usize>> {
    let mut items = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (offset, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                items.push(start..offset);
                start = offset + 1;
            }
            _ => {}
        }
    }
    items.push(start..text.len());
    items.retain(|range| !text[range.clone()].trim().is_empty());
    items
}
