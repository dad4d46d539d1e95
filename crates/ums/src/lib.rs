//! Universal Measure Specification (UMS) model and boundary support.
//!
//! This crate holds the canonical structured representation of a clinical quality measure:
//! - measure metadata, global constraints and populations ([`measure`])
//! - the boolean criteria tree of clauses and typed data elements ([`criteria`])
//! - value set references ([`value_set`])
//!
//! It also provides [`Ums`], a namespace for translating measures to and from their YAML/JSON
//! wire text. The model has no behaviour beyond traversal helpers; code generation, validation
//! and diffing live in `ums-core`.

pub mod criteria;
pub mod measure;
pub mod value_set;

pub use criteria::{
    Comparator, CriteriaNode, DataElement, ElementType, LogicalClause, LogicalOperator,
    QuantityRequirement, TimeUnit, TimingConstraint,
};
pub use measure::{
    AgeRange, Confidence, Gender, GlobalConstraints, Measure, MeasureType, MeasurementPeriod,
    Population, PopulationType, ReviewStatus,
};
pub use value_set::{CodeReference, ValueSetReference};

/// Errors returned by the `ums` boundary crate.
#[derive(Debug, thiserror::Error)]
pub enum UmsError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("translation error: {0}")]
    Translation(String),
}

/// Type alias for Results that can fail with a [`UmsError`].
pub type UmsResult<T> = Result<T, UmsError>;

/// Measure wire-format operations.
///
/// This is a zero-sized type used for namespacing; all methods are associated functions.
pub struct Ums;

impl Ums {
    /// Parse a measure from YAML text.
    ///
    /// This uses `serde_path_to_error` to surface the path (e.g. `populations[0].criteria`)
    /// of the failing field when the YAML does not match the measure schema.
    ///
    /// # Errors
    ///
    /// Returns [`UmsError::Translation`] if the YAML is malformed, a field has an unexpected
    /// type, or unknown keys are present on a measure or population.
    pub fn measure_parse_yaml(yaml_text: &str) -> UmsResult<Measure> {
        let deserializer = serde_yaml::Deserializer::from_str(yaml_text);
        serde_path_to_error::deserialize::<_, Measure>(deserializer)
            .map_err(|err| schema_mismatch(err.path().to_string(), err.into_inner()))
    }

    /// Parse a measure from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`UmsError::Translation`] with the failing field path on schema mismatch.
    pub fn measure_parse_json(json_text: &str) -> UmsResult<Measure> {
        let mut deserializer = serde_json::Deserializer::from_str(json_text);
        serde_path_to_error::deserialize::<_, Measure>(&mut deserializer)
            .map_err(|err| schema_mismatch(err.path().to_string(), err.into_inner()))
    }

    /// Parse a measure, choosing YAML or JSON from the leading non-blank character.
    ///
    /// # Errors
    ///
    /// Returns [`UmsError::InvalidInput`] for blank input, otherwise as the format-specific
    /// parsers.
    pub fn measure_parse(text: &str) -> UmsResult<Measure> {
        match text.trim_start().chars().next() {
            None => Err(UmsError::InvalidInput("measure text is empty".into())),
            Some('{') => Self::measure_parse_json(text),
            Some(_) => Self::measure_parse_yaml(text),
        }
    }

    /// Render a measure as YAML text.
    ///
    /// # Errors
    ///
    /// Returns [`UmsError::Translation`] if serialisation fails.
    pub fn measure_render_yaml(measure: &Measure) -> UmsResult<String> {
        serde_yaml::to_string(measure)
            .map_err(|e| UmsError::Translation(format!("Failed to serialize measure: {e}")))
    }
}

fn schema_mismatch(path: String, source: impl std::fmt::Display) -> UmsError {
    let path = if path.is_empty() || path == "." {
        "<root>".to_string()
    } else {
        path
    };
    UmsError::Translation(format!("Measure schema mismatch at {path}: {source}"))
}
