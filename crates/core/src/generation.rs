//! Result records shared by both generators.
//!
//! Generation never returns `Err`. Precondition failures produce a record with
//! `success == false`, no code and every failing message in `errors`; recoverable problems are
//! reported twice, as an inline comment in the code and as a structured [`GenerationWarning`].

use crate::format::OutputFormat;
use crate::overrides::AppliedOverride;
use serde::{Deserialize, Serialize};
use ums::Measure;

/// Category of a recoverable generation problem.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningCode {
    /// A declared value set has no member codes.
    ValueSetWithoutCodes,
    /// A value set has neither a URL nor an OID and cannot be declared.
    ValueSetWithoutLocator,
    /// A value set has a URL or OID but no name to declare it under.
    ValueSetWithoutName,
    /// A data element has no resolvable value set; a placeholder was emitted.
    UnresolvedValueSet,
    /// A timing window has no offset value and was defaulted to the measurement period.
    AmbiguousTiming,
    /// The numerator has no criteria; a `true` placeholder was emitted.
    EmptyNumerator,
    /// A denominator exception or numerator exclusion has no criteria and matches everyone.
    EmptyExclusion,
    /// A NOT clause carries more than one child; only the first is negated.
    NotClauseMultipleChildren,
    /// A demographic element has neither a gender nor an age range.
    EmptyDemographic,
    /// A demographic criterion needs an ontology context that is not configured.
    MissingOntologyContext,
}

/// A recoverable problem found while generating code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationWarning {
    pub code: WarningCode,
    pub message: String,
    /// The clause, element or population the warning concerns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_id: Option<String>,
}

impl GenerationWarning {
    pub fn new(code: WarningCode, message: impl Into<String>, component_id: Option<&str>) -> Self {
        Self {
            code,
            message: message.into(),
            component_id: component_id.filter(|id| !id.is_empty()).map(String::from),
        }
    }
}

/// Facts about generated clinical-query code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CqlMetadata {
    pub library_name: String,
    pub version: String,
    pub population_count: usize,
    pub value_set_count: usize,
    pub definition_count: usize,
}

/// Rough effort estimate for reviewing a generated SQL script.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    /// Classifies by number of predicate CTEs and depth of the deepest criteria tree.
    pub fn estimate(predicate_count: usize, max_depth: usize) -> Self {
        if predicate_count < 5 && max_depth <= 2 {
            Self::Low
        } else if predicate_count < 15 && max_depth <= 4 {
            Self::Medium
        } else {
            Self::High
        }
    }
}

/// Facts about a generated SQL script.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlMetadata {
    pub predicate_count: usize,
    pub data_models_used: Vec<String>,
    pub estimated_complexity: Complexity,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum GenerationMetadata {
    Cql(CqlMetadata),
    Sql(SqlMetadata),
}

/// Outcome of one generation call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    pub success: bool,
    pub format: OutputFormat,
    /// Generated text; `None` when generation failed.
    pub code: Option<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<GenerationWarning>,
    pub metadata: Option<GenerationMetadata>,
    /// Manual overrides merged into `code`, empty when none applied.
    #[serde(default)]
    pub overrides_applied: Vec<AppliedOverride>,
}

impl GenerationResult {
    pub fn failed(format: OutputFormat, errors: Vec<String>) -> Self {
        Self {
            success: false,
            format,
            code: None,
            errors,
            warnings: Vec::new(),
            metadata: None,
            overrides_applied: Vec::new(),
        }
    }

    pub fn succeeded(
        format: OutputFormat,
        code: String,
        warnings: Vec<GenerationWarning>,
        metadata: GenerationMetadata,
    ) -> Self {
        Self {
            success: true,
            format,
            code: Some(code),
            errors: Vec::new(),
            warnings,
            metadata: Some(metadata),
            overrides_applied: Vec::new(),
        }
    }
}

/// Checks the fields every generator needs, collecting every failure.
pub fn check_preconditions(measure: &Measure) -> Vec<String> {
    let mut errors = Vec::new();
    if measure.id.trim().is_empty() {
        errors.push("Measure ID is required".to_string());
    }
    if measure.populations.is_empty() {
        errors.push("At least one population definition is required".to_string());
    }
    errors
}

/// Renders a value as a single comment-safe line.
pub(crate) fn single_line(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace("*/", "* /")
}

/// Writes the component anchor comment that precedes a generated block.
pub(crate) fn component_marker(format: OutputFormat, component_id: &str, name: &str) -> String {
    format!(
        "{} {}{}] {}",
        format.comment_prefix(),
        crate::constants::COMPONENT_MARKER,
        component_id,
        single_line(name)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_preconditions_collects_all_errors() {
        let measure: Measure = serde_json::from_str(r#"{"id":"","populations":[]}"#).unwrap();
        assert_eq!(
            check_preconditions(&measure),
            vec![
                "Measure ID is required".to_string(),
                "At least one population definition is required".to_string()
            ]
        );
    }

    #[test]
    fn test_complexity_estimate_thresholds() {
        assert_eq!(Complexity::estimate(2, 1), Complexity::Low);
        assert_eq!(Complexity::estimate(2, 3), Complexity::Medium);
        assert_eq!(Complexity::estimate(14, 4), Complexity::Medium);
        assert_eq!(Complexity::estimate(15, 1), Complexity::High);
    }

    #[test]
    fn test_component_marker_uses_grammar_comment() {
        assert_eq!(
            component_marker(OutputFormat::Sql, "el-1", "Office\nVisit"),
            "-- [component:el-1] Office Visit"
        );
    }
}
