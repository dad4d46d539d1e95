//! Structural validators for generated code.
//!
//! One validator per target grammar. Both share the [`ValidationResult`] shape: a validity
//! flag, a 0-100 compliance score and the issues found. Validation never blocks generation; it
//! only reports.

mod cql;
mod scan;
mod sql;

pub use cql::CqlValidator;
pub use sql::{CteDependency, CteDetail, DetailedValidation, SqlValidator};

use crate::config::ValidationConfig;
use crate::format::OutputFormat;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// One finding of a validator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub severity: Severity,
    /// Stable upper-snake code, e.g. `MISSING_REQUIRED_CTE`.
    pub code: String,
    pub message: String,
    /// 1-based line number, when the issue has a location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, code, message)
    }

    pub fn warning(code: &str, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, code, message)
    }

    pub fn info(code: &str, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, code, message)
    }

    fn new(severity: Severity, code: &str, message: impl Into<String>) -> Self {
        Self {
            severity,
            code: code.to_string(),
            message: message.into(),
            line: None,
            suggestion: None,
        }
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// Outcome of validating one piece of generated code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    /// True when no error-severity issue was found.
    pub valid: bool,
    /// Compliance score in `[0, 100]`.
    pub score: u32,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    /// Informational findings; they do not affect the score.
    #[serde(default)]
    pub info: Vec<ValidationIssue>,
    /// Every fix suggestion attached to an issue, in issue order.
    pub suggestions: Vec<String>,
}

/// `max(0, 100 - 10 * errors - 3 * warnings)`.
pub fn compliance_score(errors: usize, warnings: usize) -> u32 {
    let penalty = errors.saturating_mul(10).saturating_add(warnings.saturating_mul(3));
    100u32.saturating_sub(u32::try_from(penalty).unwrap_or(u32::MAX))
}

/// Collects issues in the order checks run and turns them into a [`ValidationResult`].
#[derive(Debug, Default)]
pub(crate) struct IssueCollector {
    issues: Vec<ValidationIssue>,
}

impl IssueCollector {
    pub(crate) fn push(&mut self, issue: ValidationIssue) {
        self.issues.push(issue);
    }

    pub(crate) fn has_errors(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Error)
    }

    /// Builds the result; `zero_score` forces the score to 0 (hard syntax failures).
    pub(crate) fn finish(self, zero_score: bool) -> ValidationResult {
        let suggestions = self
            .issues
            .iter()
            .filter_map(|i| i.suggestion.clone())
            .collect();
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut info = Vec::new();
        for issue in self.issues {
            match issue.severity {
                Severity::Error => errors.push(issue),
                Severity::Warning => warnings.push(issue),
                Severity::Info => info.push(issue),
            }
        }
        let score = if zero_score {
            0
        } else {
            compliance_score(errors.len(), warnings.len())
        };
        ValidationResult {
            valid: errors.is_empty(),
            score,
            errors,
            warnings,
            info,
            suggestions,
        }
    }
}

/// Validator entry points keyed by output format.
///
/// This is a zero-sized type used for namespacing.
pub struct Validator;

impl Validator {
    pub fn validate(format: OutputFormat, code: &str, config: &ValidationConfig) -> ValidationResult {
        let result = match format {
            OutputFormat::Cql => CqlValidator::validate(code),
            OutputFormat::Sql => SqlValidator::validate(code, config),
        };
        tracing::debug!(
            %format,
            score = result.score,
            errors = result.errors.len(),
            warnings = result.warnings.len(),
            "validated generated code"
        );
        result
    }

    /// Validation plus descriptive CTE analysis; the analysis is empty for clinical-query code.
    pub fn validate_detailed(
        format: OutputFormat,
        code: &str,
        config: &ValidationConfig,
    ) -> DetailedValidation {
        match format {
            OutputFormat::Cql => DetailedValidation {
                result: CqlValidator::validate(code),
                dependency_graph: Vec::new(),
                ctes: Vec::new(),
            },
            OutputFormat::Sql => SqlValidator::validate_detailed(code, config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compliance_score_formula_and_clamp() {
        assert_eq!(compliance_score(0, 0), 100);
        assert_eq!(compliance_score(1, 2), 84);
        assert_eq!(compliance_score(11, 0), 0);
    }

    #[test]
    fn test_collector_splits_by_severity() {
        let mut collector = IssueCollector::default();
        collector.push(ValidationIssue::warning("W", "w").with_suggestion("fix w"));
        collector.push(ValidationIssue::info("I", "i"));
        collector.push(ValidationIssue::error("E", "e").at_line(3));
        assert!(collector.has_errors());
        let result = collector.finish(false);
        assert!(!result.valid);
        assert_eq!(result.score, 87);
        assert_eq!(result.errors[0].line, Some(3));
        assert_eq!(result.info.len(), 1);
        assert_eq!(result.suggestions, vec!["fix w".to_string()]);
    }
}
