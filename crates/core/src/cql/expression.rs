//! Criteria tree to clinical-query expression translation.
//!
//! The walk is recursive and order-preserving: children are translated in authored order and
//! never reordered, so the same tree always produces the same text.

use crate::constants::NEUTRAL_LITERAL;
use crate::generation::{single_line, GenerationWarning, WarningCode};
use ums::{
    AgeRange, CriteriaNode, DataElement, ElementType, LogicalClause, LogicalOperator, Measure,
    QuantityRequirement, TimeUnit, TimingConstraint,
};

/// Reference to the measurement period parameter.
pub(crate) const PERIOD: &str = "\"Measurement Period\"";

/// Result of translating one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Expr {
    /// The node constrains nothing and reduces to `true`.
    Neutral,
    Code {
        text: String,
        /// True when `text` joins several operands and needs parentheses when nested.
        compound: bool,
    },
}

impl Expr {
    fn simple(text: String) -> Self {
        Self::Code {
            text,
            compound: false,
        }
    }

    /// Text of the expression, with the neutral literal for [`Expr::Neutral`].
    pub(crate) fn into_text(self) -> String {
        match self {
            Self::Neutral => NEUTRAL_LITERAL.to_string(),
            Self::Code { text, .. } => text,
        }
    }

    /// Text to use as an operand of a join, or `None` when neutral.
    pub(crate) fn into_operand(self) -> Option<String> {
        match self {
            Self::Neutral => None,
            Self::Code { text, compound } if compound => Some(format!("({text})")),
            Self::Code { text, .. } => Some(text),
        }
    }
}

/// FHIR resource a data element retrieves, with its query alias and path helpers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Resource {
    pub keyword: &'static str,
    alias: &'static str,
    /// Status filter; `{a}` is replaced by the alias.
    status: &'static str,
    /// Interval or date the timing clause applies to; `{a}` is replaced by the alias.
    timing_path: &'static str,
    /// True when the timing path is an interval that should overlap rather than lie within.
    prevalence: bool,
}

impl Resource {
    pub(crate) fn for_type(element_type: ElementType) -> Option<Self> {
        let resource = match element_type {
            ElementType::Diagnosis => Self {
                keyword: "Condition",
                alias: "Dx",
                status: "{a}.clinicalStatus ~ \"active\"",
                timing_path: "{a}.prevalenceInterval()",
                prevalence: true,
            },
            ElementType::Encounter => Self {
                keyword: "Encounter",
                alias: "Enc",
                status: "{a}.status = 'finished'",
                timing_path: "{a}.period",
                prevalence: false,
            },
            ElementType::Procedure => Self {
                keyword: "Procedure",
                alias: "Proc",
                status: "{a}.status = 'completed'",
                timing_path: "{a}.performed.toInterval()",
                prevalence: false,
            },
            ElementType::Observation | ElementType::Assessment => Self {
                keyword: "Observation",
                alias: "Obs",
                status: "{a}.status in { 'final', 'amended', 'corrected' }",
                timing_path: "{a}.effective.toInterval()",
                prevalence: false,
            },
            ElementType::Medication => Self {
                keyword: "MedicationRequest",
                alias: "Med",
                status: "{a}.status in { 'active', 'completed' }",
                timing_path: "{a}.authoredOn",
                prevalence: false,
            },
            ElementType::Immunization => Self {
                keyword: "Immunization",
                alias: "Imm",
                status: "{a}.status = 'completed'",
                timing_path: "{a}.occurrence.toInterval()",
                prevalence: false,
            },
            ElementType::Device => Self {
                keyword: "DeviceRequest",
                alias: "Dev",
                status: "{a}.status in { 'active', 'completed' }",
                timing_path: "{a}.authoredOn",
                prevalence: false,
            },
            ElementType::Communication => Self {
                keyword: "Communication",
                alias: "Comm",
                status: "{a}.status = 'completed'",
                timing_path: "{a}.sent",
                prevalence: false,
            },
            ElementType::Allergy => Self {
                keyword: "AllergyIntolerance",
                alias: "Allergy",
                status: "{a}.clinicalStatus ~ \"active\"",
                timing_path: "{a}.onset.toInterval()",
                prevalence: true,
            },
            ElementType::Goal => Self {
                keyword: "Goal",
                alias: "G",
                status: "{a}.lifecycleStatus in { 'active', 'accepted', 'achieved' }",
                timing_path: "{a}.start.toInterval()",
                prevalence: false,
            },
            ElementType::Demographic => return None,
        };
        Some(resource)
    }

    fn status_filter(&self) -> String {
        self.status.replace("{a}", self.alias)
    }

    fn path(&self) -> String {
        self.timing_path.replace("{a}", self.alias)
    }
}

/// Quotes an identifier for use inside double quotes.
pub(crate) fn quoted(name: &str) -> String {
    format!("\"{}\"", name.trim().replace('\\', "\\\\").replace('"', "\\\""))
}

/// Age-interval membership test for a range, or `None` when the range is open on both sides.
pub(crate) fn age_expression(range: &AgeRange) -> Option<String> {
    let age = format!("AgeInYearsAt(date from end of {PERIOD})");
    match (range.min, range.max) {
        (Some(min), Some(max)) => Some(format!("{age} in Interval[{min}, {max}]")),
        (Some(min), None) => Some(format!("{age} >= {min}")),
        (None, Some(max)) => Some(format!("{age} <= {max}")),
        (None, None) => None,
    }
}

/// Translates criteria trees of one measure, collecting warnings as it goes.
pub(crate) struct ExpressionBuilder<'a> {
    measure: &'a Measure,
    warnings: Vec<GenerationWarning>,
}

impl<'a> ExpressionBuilder<'a> {
    pub(crate) fn new(measure: &'a Measure) -> Self {
        Self {
            measure,
            warnings: Vec::new(),
        }
    }

    pub(crate) fn into_warnings(self) -> Vec<GenerationWarning> {
        self.warnings
    }

    /// Translates a root clause.
    pub(crate) fn clause(&mut self, clause: &LogicalClause) -> Expr {
        let mut operands = clause
            .children
            .iter()
            .filter_map(|child| self.node(child).into_operand());

        match clause.operator {
            LogicalOperator::Not => {
                let Some(first) = operands.next() else {
                    return Expr::Neutral;
                };
                let extra = clause.children.len().saturating_sub(1);
                if extra == 0 {
                    return Expr::simple(format!("not ({})", strip_parens(&first)));
                }
                let message = format!(
                    "NOT clause has {} children; only the first is negated",
                    clause.children.len()
                );
                tracing::warn!(clause = %clause.id, "{message}");
                self.warnings.push(GenerationWarning::new(
                    WarningCode::NotClauseMultipleChildren,
                    message.clone(),
                    Some(clause.id.as_str()),
                ));
                Expr::simple(format!(
                    "/* WARNING: {message} */ not ({})",
                    strip_parens(&first)
                ))
            }
            LogicalOperator::And | LogicalOperator::Or => {
                let joiner = if clause.operator == LogicalOperator::And {
                    " and "
                } else {
                    " or "
                };
                let operands: Vec<String> = operands.collect();
                match operands.len() {
                    0 => Expr::Neutral,
                    1 => Expr::simple(strip_parens(&operands[0]).to_string()),
                    _ => Expr::Code {
                        text: operands.join(joiner),
                        compound: true,
                    },
                }
            }
        }
    }

    fn node(&mut self, node: &CriteriaNode) -> Expr {
        match node {
            CriteriaNode::Clause(clause) => self.clause(clause),
            CriteriaNode::Element(element) => self.element(element),
        }
    }

    /// Translates a data element leaf.
    pub(crate) fn element(&mut self, element: &DataElement) -> Expr {
        let leaf = match Resource::for_type(element.element_type) {
            Some(resource) => self.retrieve(element, resource),
            None => self.demographic(element),
        };
        match leaf {
            Leaf::Placeholder(text) => Expr::simple(text),
            Leaf::Code(text) if element.negation => Expr::simple(format!("not ({text})")),
            Leaf::Code(text) => Expr::simple(text),
        }
    }

    fn retrieve(&mut self, element: &DataElement, resource: Resource) -> Leaf {
        let value_set = self
            .measure
            .resolve_value_set(element)
            .filter(|vs| vs.is_resolvable());
        let Some(value_set) = value_set else {
            let message = format!(
                "no value set resolved for \"{}\"",
                single_line(element.display_name())
            );
            self.warnings.push(GenerationWarning::new(
                WarningCode::UnresolvedValueSet,
                message.clone(),
                Some(element.id.as_str()),
            ));
            return Leaf::Placeholder(format!("/* WARNING: {message} */ {NEUTRAL_LITERAL}"));
        };

        let mut filters = vec![resource.status_filter()];
        filters.push(self.timing(element, &resource));
        let query = format!(
            "[{}: {}] {} where {}",
            resource.keyword,
            quoted(&value_set.name),
            resource.alias,
            filters.join(" and ")
        );

        let code = match element.quantity {
            None => format!("exists ({query})"),
            Some(QuantityRequirement::Compare { comparator, value }) => {
                format!("Count({query}) {} {value}", comparator.symbol())
            }
            Some(QuantityRequirement::Range { min, max }) => {
                format!("Count({query}) in Interval[{min}, {max}]")
            }
        };
        Leaf::Code(code)
    }

    fn timing(&mut self, element: &DataElement, resource: &Resource) -> String {
        let path = resource.path();
        let during = if resource.prevalence {
            format!("{path} overlaps {PERIOD}")
        } else {
            format!("{path} during {PERIOD}")
        };

        let windowed = |value: Option<u32>, unit: TimeUnit, template: &str| {
            value.map(|v| {
                template
                    .replace("{path}", &path)
                    .replace("{amount}", &format!("{v} {}", unit.as_str()))
            })
        };

        let resolved = match element.timing {
            None | Some(TimingConstraint::DuringMeasurementPeriod) => Some(during.clone()),
            Some(TimingConstraint::WithinBeforeEnd { value, unit }) => windowed(
                value,
                unit,
                &format!("{{path}} ends {{amount}} or less on or before end of {PERIOD}"),
            ),
            Some(TimingConstraint::AfterStartOf { value, unit }) => windowed(
                value,
                unit,
                &format!("{{path}} starts {{amount}} or less on or after start of {PERIOD}"),
            ),
            Some(TimingConstraint::BeforeStartOf { value, unit }) => windowed(
                value,
                unit,
                &format!("{{path}} ends {{amount}} or less before start of {PERIOD}"),
            ),
            Some(TimingConstraint::AgeBased { min, max, unit }) => {
                if min.is_none() && max.is_none() {
                    None
                } else {
                    let low = min.map_or("Patient.birthDate".to_string(), |v| {
                        format!("Patient.birthDate + {v} {}", unit.as_str())
                    });
                    let high = max.map_or(format!("end of {PERIOD}"), |v| {
                        format!("Patient.birthDate + {v} {}", unit.as_str())
                    });
                    Some(format!("{path} starts during Interval[{low}, {high}]"))
                }
            }
        };

        match resolved {
            Some(clause) => clause,
            None => {
                let message = format!(
                    "timing for \"{}\" has no offset; defaulted to the measurement period",
                    single_line(element.display_name())
                );
                tracing::debug!(element = %element.id, "ambiguous timing defaulted");
                self.warnings.push(GenerationWarning::new(
                    WarningCode::AmbiguousTiming,
                    message.clone(),
                    Some(element.id.as_str()),
                ));
                format!("{during} /* WARNING: {message} */")
            }
        }
    }

    fn demographic(&mut self, element: &DataElement) -> Leaf {
        let mut parts = Vec::new();
        if let Some(gender) = element.gender {
            parts.push(format!("Patient.gender = '{}'", gender.code()));
        }
        if let Some(age) = element.age_range.as_ref().and_then(age_expression) {
            parts.push(age);
        }
        if parts.is_empty() {
            let message = format!(
                "demographic \"{}\" has neither gender nor age range",
                single_line(element.display_name())
            );
            self.warnings.push(GenerationWarning::new(
                WarningCode::EmptyDemographic,
                message.clone(),
                Some(element.id.as_str()),
            ));
            return Leaf::Placeholder(format!("/* WARNING: {message} */ {NEUTRAL_LITERAL}"));
        }
        Leaf::Code(parts.join(" and "))
    }
}

enum Leaf {
    Code(String),
    /// Warning placeholder; never negated.
    Placeholder(String),
}

/// Removes one pair of parentheses that wraps the whole text.
fn strip_parens(text: &str) -> &str {
    let Some(inner) = text.strip_prefix('(').and_then(|t| t.strip_suffix(')')) else {
        return text;
    };
    let mut depth = 0i32;
    for c in inner.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return text;
                }
            }
            _ => {}
        }
    }
    if depth == 0 {
        inner
    } else {
        text
    }
}
