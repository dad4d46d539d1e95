//! The criteria tree: logical clauses over typed clinical data elements.
//!
//! A [`LogicalClause`] combines its children with AND, OR or NOT. Every child is a
//! [`CriteriaNode`], an explicit tagged union of a nested clause or a [`DataElement`] leaf.
//! Children keep their authored order; generators rely on that order for deterministic output.

use crate::measure::{AgeRange, Confidence, Gender, ReviewStatus};
use crate::value_set::ValueSetReference;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Boolean operator of a clause.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
    /// Expected to carry exactly one child.
    Not,
}

impl fmt::Display for LogicalOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::And => "AND",
            Self::Or => "OR",
            Self::Not => "NOT",
        })
    }
}

/// A branch of the criteria tree.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalClause {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub operator: LogicalOperator,

    #[serde(default)]
    pub children: Vec<CriteriaNode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl LogicalClause {
    pub fn new(operator: LogicalOperator, children: Vec<CriteriaNode>) -> Self {
        Self {
            id: String::new(),
            operator,
            children,
            description: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Depth-first iterator over every data element below this clause, in authored order.
    pub fn elements(&self) -> Elements<'_> {
        Elements {
            stack: vec![self.children.iter()],
        }
    }

    /// Nesting depth of the clause; an empty clause has depth 0, a flat clause depth 1.
    pub fn depth(&self) -> usize {
        if self.children.is_empty() {
            return 0;
        }
        1 + self
            .children
            .iter()
            .map(|child| match child {
                CriteriaNode::Clause(clause) => clause.depth(),
                CriteriaNode::Element(_) => 0,
            })
            .max()
            .unwrap_or(0)
    }
}

/// Iterator returned by [`LogicalClause::elements`].
pub struct Elements<'a> {
    stack: Vec<std::slice::Iter<'a, CriteriaNode>>,
}

impl<'a> Iterator for Elements<'a> {
    type Item = &'a DataElement;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let top = self.stack.last_mut()?;
            match top.next() {
                Some(CriteriaNode::Element(element)) => return Some(element),
                Some(CriteriaNode::Clause(clause)) => self.stack.push(clause.children.iter()),
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}

/// A child of a clause: either a nested clause or a data element, never both.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CriteriaNode {
    Clause(LogicalClause),
    Element(DataElement),
}

/// Clinical category of a data element.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    Diagnosis,
    Encounter,
    Procedure,
    Observation,
    Medication,
    Immunization,
    Demographic,
    Assessment,
    Device,
    Communication,
    Allergy,
    Goal,
}

impl ElementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Diagnosis => "diagnosis",
            Self::Encounter => "encounter",
            Self::Procedure => "procedure",
            Self::Observation => "observation",
            Self::Medication => "medication",
            Self::Immunization => "immunization",
            Self::Demographic => "demographic",
            Self::Assessment => "assessment",
            Self::Device => "device",
            Self::Communication => "communication",
            Self::Allergy => "allergy",
            Self::Goal => "goal",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed clinical criterion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataElement {
    /// Component identifier, unique within the measure.
    pub id: String,

    #[serde(rename = "type")]
    pub element_type: ElementType,

    #[serde(default)]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_set: Option<ValueSetReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<TimingConstraint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<QuantityRequirement>,

    /// When set, the criterion must be absent.
    #[serde(default)]
    pub negation: bool,

    /// Demographic elements only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,

    /// Demographic elements only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_range: Option<AgeRange>,

    #[serde(default)]
    pub confidence: Confidence,

    #[serde(default)]
    pub review_status: ReviewStatus,
}

impl DataElement {
    /// Name used for the element in generated output and change reports.
    pub fn display_name(&self) -> &str {
        if self.description.trim().is_empty() {
            &self.id
        } else {
            self.description.trim()
        }
    }
}

/// Unit of a timing offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Days,
    Weeks,
    Months,
    Years,
}

impl TimeUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Days => "days",
            Self::Weeks => "weeks",
            Self::Months => "months",
            Self::Years => "years",
        }
    }
}

/// When a criterion must occur relative to the measurement period or the patient's age.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TimingConstraint {
    /// Occurs during the measurement period.
    DuringMeasurementPeriod,
    /// Occurs within `value` units on or before the end of the measurement period.
    WithinBeforeEnd {
        #[serde(default)]
        value: Option<u32>,
        unit: TimeUnit,
    },
    /// Starts within `value` units on or after the start of the measurement period.
    AfterStartOf {
        #[serde(default)]
        value: Option<u32>,
        unit: TimeUnit,
    },
    /// Ends within `value` units before the start of the measurement period.
    BeforeStartOf {
        #[serde(default)]
        value: Option<u32>,
        unit: TimeUnit,
    },
    /// Occurs while the patient's age lies between `min` and `max` units.
    AgeBased {
        #[serde(default)]
        min: Option<u32>,
        #[serde(default)]
        max: Option<u32>,
        unit: TimeUnit,
    },
}

impl fmt::Display for TimingConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn amount(value: &Option<u32>, unit: &TimeUnit) -> String {
            match value {
                Some(v) => format!("{v} {}", unit.as_str()),
                None => format!("? {}", unit.as_str()),
            }
        }
        match self {
            Self::DuringMeasurementPeriod => write!(f, "during measurement period"),
            Self::WithinBeforeEnd { value, unit } => {
                write!(f, "within {} before end of measurement period", amount(value, unit))
            }
            Self::AfterStartOf { value, unit } => {
                write!(f, "within {} after start of measurement period", amount(value, unit))
            }
            Self::BeforeStartOf { value, unit } => {
                write!(f, "within {} before start of measurement period", amount(value, unit))
            }
            Self::AgeBased { min, max, unit } => write!(
                f,
                "between age {} and {} {}",
                min.map_or("?".to_string(), |v| v.to_string()),
                max.map_or("?".to_string(), |v| v.to_string()),
                unit.as_str()
            ),
        }
    }
}

/// Comparison operator of a quantity requirement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "=")]
    Equal,
}

impl Comparator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::GreaterThan => ">",
            Self::GreaterOrEqual => ">=",
            Self::LessThan => "<",
            Self::LessOrEqual => "<=",
            Self::Equal => "=",
        }
    }
}

/// How many qualifying occurrences a criterion requires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum QuantityRequirement {
    Compare { comparator: Comparator, value: u32 },
    Range { min: u32, max: u32 },
}

impl fmt::Display for QuantityRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compare { comparator, value } => write!(f, "count {} {value}", comparator.symbol()),
            Self::Range { min, max } => write!(f, "count between {min} and {max}"),
        }
    }
}
