//! Measure-level types of the Universal Measure Specification.
//!
//! A [`Measure`] owns its populations exclusively. Each [`Population`] holds one root
//! [`LogicalClause`] describing who qualifies for that population.

use crate::criteria::{DataElement, LogicalClause};
use crate::value_set::ValueSetReference;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A clinical quality measure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Measure {
    /// Measure identifier (e.g. `CMS130v12`). May be empty on input; generators reject it.
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steward: Option<String>,

    #[serde(default)]
    pub measure_type: MeasureType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurement_period: Option<MeasurementPeriod>,

    #[serde(default)]
    pub global_constraints: GlobalConstraints,

    /// Populations in authored order.
    #[serde(default)]
    pub populations: Vec<Population>,

    /// Value sets declared by the measure.
    #[serde(default)]
    pub value_sets: Vec<ValueSetReference>,
}

impl Measure {
    /// Returns the first population of the given type, if any.
    pub fn population(&self, population_type: PopulationType) -> Option<&Population> {
        self.populations
            .iter()
            .find(|p| p.population_type == population_type)
    }

    /// Iterates every data element of every population, depth-first in authored order.
    pub fn data_elements(&self) -> impl Iterator<Item = (&Population, &DataElement)> {
        self.populations
            .iter()
            .flat_map(|population| population.criteria.elements().map(move |e| (population, e)))
    }

    /// Resolves the value set a data element points at.
    ///
    /// A measure-level declaration with the same id or OID wins over the reference embedded
    /// in the element, so edits to the measure's value-set list flow into every element.
    pub fn resolve_value_set<'a>(&'a self, element: &'a DataElement) -> Option<&'a ValueSetReference> {
        let embedded = element.value_set.as_ref()?;
        self.value_sets
            .iter()
            .find(|vs| vs.same_identity(embedded))
            .or(Some(embedded))
    }
}

/// Kind of measure, as declared by the steward.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasureType {
    #[default]
    Process,
    Outcome,
    Structure,
    PatientReportedOutcome,
    Efficiency,
}

impl MeasureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Outcome => "outcome",
            Self::Structure => "structure",
            Self::PatientReportedOutcome => "patient_reported_outcome",
            Self::Efficiency => "efficiency",
        }
    }
}

/// Inclusive measurement period bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl MeasurementPeriod {
    /// The calendar year `year`, 1 January to 31 December.
    pub fn calendar_year(year: i32) -> Option<Self> {
        Some(Self {
            start: NaiveDate::from_ymd_opt(year, 1, 1)?,
            end: NaiveDate::from_ymd_opt(year, 12, 31)?,
        })
    }
}

impl fmt::Display for MeasurementPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.start, self.end)
    }
}

/// Constraints that apply to every patient in the measure.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_range: Option<AgeRange>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
}

impl GlobalConstraints {
    pub fn is_empty(&self) -> bool {
        self.age_range.is_none() && self.gender.is_none()
    }
}

/// Age bounds in years; either side may be open.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgeRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
}

impl AgeRange {
    pub fn is_unbounded(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }
}

impl fmt::Display for AgeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.min, self.max) {
            (Some(min), Some(max)) => write!(f, "{min}-{max} years"),
            (Some(min), None) => write!(f, ">= {min} years"),
            (None, Some(max)) => write!(f, "<= {max} years"),
            (None, None) => write!(f, "any age"),
        }
    }
}

/// Administrative gender as used by measure logic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Other,
    Unknown,
}

impl Gender {
    /// FHIR administrative-gender code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Male => "male",
            Self::Female => "female",
            Self::Other => "other",
            Self::Unknown => "unknown",
        }
    }

    /// Display name as held in terminology concept tables.
    pub fn display(&self) -> &'static str {
        match self {
            Self::Male => "Male",
            Self::Female => "Female",
            Self::Other => "Other",
            Self::Unknown => "Unknown",
        }
    }
}

/// The fixed measure sub-groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PopulationType {
    InitialPopulation,
    Denominator,
    DenominatorExclusion,
    DenominatorException,
    Numerator,
    NumeratorExclusion,
}

impl PopulationType {
    /// All population types in the order populations are emitted.
    pub const ALL: [PopulationType; 6] = [
        Self::InitialPopulation,
        Self::Denominator,
        Self::DenominatorExclusion,
        Self::DenominatorException,
        Self::Numerator,
        Self::NumeratorExclusion,
    ];

    /// Name of the population definition in generated clinical-query code.
    pub fn definition_name(&self) -> &'static str {
        match self {
            Self::InitialPopulation => "Initial Population",
            Self::Denominator => "Denominator",
            Self::DenominatorExclusion => "Denominator Exclusion",
            Self::DenominatorException => "Denominator Exception",
            Self::Numerator => "Numerator",
            Self::NumeratorExclusion => "Numerator Exclusion",
        }
    }

    /// PascalCase identifier fragment, used for SQL view names.
    pub fn pascal_name(&self) -> &'static str {
        match self {
            Self::InitialPopulation => "InitialPopulation",
            Self::Denominator => "Denominator",
            Self::DenominatorExclusion => "DenominatorExclusions",
            Self::DenominatorException => "DenominatorExceptions",
            Self::Numerator => "Numerator",
            Self::NumeratorExclusion => "NumeratorExclusions",
        }
    }
}

impl fmt::Display for PopulationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.definition_name())
    }
}

/// Reviewer sign-off state for authored content.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    #[default]
    Pending,
    Approved,
    NeedsRevision,
    Flagged,
}

/// Confidence attached to extracted or authored content.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    #[default]
    Medium,
    Low,
}

/// One measure population with its root criteria clause.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Population {
    /// Component identifier of this population.
    pub id: String,

    #[serde(rename = "type")]
    pub population_type: PopulationType,

    /// Narrative description from the source specification.
    #[serde(default)]
    pub narrative: String,

    #[serde(default)]
    pub review_status: ReviewStatus,

    /// Root clause; an empty clause means "no additional criteria".
    #[serde(default)]
    pub criteria: LogicalClause,
}
