//! Clinical predicate CTEs.
//!
//! Every non-demographic data element becomes one `PRED_<NAME>` CTE over its source table,
//! selecting the standard column set and scoped to the population by two filters: the
//! population id and the person-exclusion anti-join.

use crate::constants::{PERSON_EXCLUSION_TABLE, PREDICATE_CTE_PREFIX};
use crate::generation::{single_line, GenerationWarning, WarningCode};
use std::collections::HashSet;
use ums::{
    DataElement, ElementType, Measure, MeasurementPeriod, QuantityRequirement, TimeUnit,
    TimingConstraint,
};

/// Source table of a clinical element type.
pub(crate) fn source_table(element_type: ElementType) -> Option<&'static str> {
    let table = match element_type {
        ElementType::Diagnosis => "dbo.CONDITION",
        ElementType::Encounter => "dbo.ENCOUNTER",
        ElementType::Procedure => "dbo.PROCEDURE_EVENT",
        ElementType::Observation | ElementType::Assessment => "dbo.RESULT",
        ElementType::Medication => "dbo.MEDICATION",
        ElementType::Immunization => "dbo.IMMUNIZATION",
        ElementType::Device => "dbo.DEVICE",
        ElementType::Communication => "dbo.COMMUNICATION",
        ElementType::Allergy => "dbo.ALLERGY",
        ElementType::Goal => "dbo.GOAL",
        ElementType::Demographic => return None,
    };
    Some(table)
}

/// Upper snake case identifier fragment, e.g. `Office Visit (ambulatory)` to `OFFICE_VISIT_AMBULATORY`.
pub(crate) fn upper_snake(text: &str) -> String {
    let mut out = String::new();
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_uppercase());
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("ELEMENT");
    }
    out
}

/// Escapes a value for a single-quoted SQL literal.
pub(crate) fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub(crate) fn cast_date(date: chrono::NaiveDate) -> String {
    format!("CAST('{date}' AS DATE)")
}

fn datepart(unit: TimeUnit) -> &'static str {
    match unit {
        TimeUnit::Days => "day",
        TimeUnit::Weeks => "week",
        TimeUnit::Months => "month",
        TimeUnit::Years => "year",
    }
}

/// How a data element is represented in the flag projection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum PredicateSource {
    /// Backed by a predicate CTE.
    Cte {
        cte_name: String,
        flag_column: String,
    },
    /// No usable value set; the element is a neutral placeholder.
    Unresolved,
}

/// How rows of the source table are restricted to the value set.
enum ConceptFilter {
    /// Join into the ontology CTE by value set OID.
    Ontology(String),
    /// Inline list of member codes.
    Codes(String),
}

/// A planned predicate CTE with its rendered text.
#[derive(Clone, Debug)]
pub(crate) struct Predicate {
    pub cte_name: String,
    pub flag_column: String,
    pub table: &'static str,
    pub quantity: Option<QuantityRequirement>,
    pub text: String,
}

/// Plans and renders predicate CTEs for a measure.
pub(crate) struct PredicatePlanner<'a> {
    measure: &'a Measure,
    period: MeasurementPeriod,
    population_literal: String,
    used_names: HashSet<String>,
    pub predicates: Vec<Predicate>,
    pub sources: Vec<(String, PredicateSource)>,
    pub warnings: Vec<GenerationWarning>,
}

impl<'a> PredicatePlanner<'a> {
    pub(crate) fn new(
        measure: &'a Measure,
        period: MeasurementPeriod,
        population_literal: String,
    ) -> Self {
        Self {
            measure,
            period,
            population_literal,
            used_names: HashSet::new(),
            predicates: Vec::new(),
            sources: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Plans every clinical element of the measure in depth-first authored order.
    pub(crate) fn plan(mut self) -> Self {
        let measure = self.measure;
        for (_, element) in measure.data_elements() {
            if self.sources.iter().any(|(id, _)| id == &element.id) {
                continue;
            }
            let Some(table) = source_table(element.element_type) else {
                continue;
            };
            let source = self.plan_element(element, table);
            self.sources.push((element.id.clone(), source));
        }
        self
    }

    pub(crate) fn source(&self, element_id: &str) -> Option<&PredicateSource> {
        self.sources
            .iter()
            .find(|(id, _)| id == element_id)
            .map(|(_, source)| source)
    }

    fn unique_name(&mut self, element: &DataElement) -> String {
        let base = upper_snake(element.display_name());
        let mut candidate = base.clone();
        let mut suffix = 2;
        while !self.used_names.insert(candidate.clone()) {
            candidate = format!("{base}_{suffix}");
            suffix += 1;
        }
        candidate
    }

    fn plan_element(&mut self, element: &DataElement, table: &'static str) -> PredicateSource {
        let concept_filter = match self.measure.resolve_value_set(element) {
            Some(vs) => match vs.oid() {
                Some(oid) => Some(ConceptFilter::Ontology(format!(
                    "    INNER JOIN ONT ont ON ont.concept_code = src.concept_code\n        AND ont.value_set_oid = {}",
                    sql_literal(oid)
                ))),
                None if !vs.codes.is_empty() => Some(ConceptFilter::Codes(format!(
                    "src.concept_code IN ({})",
                    vs.codes
                        .iter()
                        .map(|c| sql_literal(&c.code))
                        .collect::<Vec<_>>()
                        .join(", ")
                ))),
                None => None,
            },
            None => None,
        };
        let Some(concept_filter) = concept_filter else {
            let message = format!(
                "no value set resolved for \"{}\"; treated as always true",
                single_line(element.display_name())
            );
            self.warnings.push(GenerationWarning::new(
                WarningCode::UnresolvedValueSet,
                message,
                Some(element.id.as_str()),
            ));
            return PredicateSource::Unresolved;
        };

        let suffix = self.unique_name(element);
        let cte_name = format!("{PREDICATE_CTE_PREFIX}{suffix}");
        let flag_column = format!("has_{}", suffix.to_lowercase());

        let mut joins = Vec::new();
        let mut filters = vec![
            format!("src.population_id = {}", self.population_literal),
            format!(
                "NOT EXISTS (\n          SELECT 1 FROM {PERSON_EXCLUSION_TABLE} ex\n          WHERE ex.person_id = src.person_id\n            AND ex.population_id = src.population_id\n      )"
            ),
        ];
        match concept_filter {
            ConceptFilter::Ontology(join) => joins.push(join),
            ConceptFilter::Codes(filter) => filters.push(filter),
        }
        let mut comments = Vec::new();
        let (timing_joins, timing_filters) = self.timing(element, &mut comments);
        joins.extend(timing_joins);
        filters.extend(timing_filters);

        let name = element.display_name().to_string();
        let mut lines = vec![crate::generation::component_marker(
            crate::format::OutputFormat::Sql,
            &element.id,
            &name,
        )];
        lines.extend(comments);
        lines.push(format!("{cte_name} AS ("));
        lines.push("    SELECT".to_string());
        lines.push("        src.person_id,".to_string());
        lines.push("        src.population_id,".to_string());
        lines.push("        src.service_date,".to_string());
        lines.push("        src.concept_code,".to_string());
        lines.push(format!(
            "        {} AS predicate_name",
            sql_literal(&single_line(&name))
        ));
        lines.push(format!("    FROM {table} src"));
        lines.extend(joins);
        lines.push(format!("    WHERE {}", filters.join("\n      AND ")));
        lines.push(")".to_string());

        self.predicates.push(Predicate {
            cte_name: cte_name.clone(),
            flag_column: flag_column.clone(),
            table,
            quantity: element.quantity,
            text: lines.join("\n"),
        });
        PredicateSource::Cte {
            cte_name,
            flag_column,
        }
    }

    fn timing(
        &mut self,
        element: &DataElement,
        comments: &mut Vec<String>,
    ) -> (Vec<String>, Vec<String>) {
        let start = cast_date(self.period.start);
        let end = cast_date(self.period.end);
        let during = vec![
            format!("src.service_date >= {start}"),
            format!("src.service_date <= {end}"),
        ];

        let resolved = match element.timing {
            None | Some(TimingConstraint::DuringMeasurementPeriod) => Some((vec![], during.clone())),
            Some(TimingConstraint::WithinBeforeEnd { value, unit }) => value.map(|v| {
                (
                    vec![],
                    vec![
                        format!("src.service_date > DATEADD({}, -{v}, {end})", datepart(unit)),
                        format!("src.service_date <= {end}"),
                    ],
                )
            }),
            Some(TimingConstraint::AfterStartOf { value, unit }) => value.map(|v| {
                (
                    vec![],
                    vec![
                        format!("src.service_date >= {start}"),
                        format!("src.service_date <= DATEADD({}, {v}, {start})", datepart(unit)),
                    ],
                )
            }),
            Some(TimingConstraint::BeforeStartOf { value, unit }) => value.map(|v| {
                (
                    vec![],
                    vec![
                        format!("src.service_date >= DATEADD({}, -{v}, {start})", datepart(unit)),
                        format!("src.service_date < {start}"),
                    ],
                )
            }),
            Some(TimingConstraint::AgeBased { min, max, unit }) => {
                if min.is_none() && max.is_none() {
                    None
                } else {
                    let age = format!("DATEDIFF({}, dm.birth_date, src.service_date)", datepart(unit));
                    let mut filters = Vec::new();
                    if let Some(min) = min {
                        filters.push(format!("{age} >= {min}"));
                    }
                    if let Some(max) = max {
                        filters.push(format!("{age} <= {max}"));
                    }
                    Some((
                        vec!["    INNER JOIN DEMOG dm ON dm.person_id = src.person_id".to_string()],
                        filters,
                    ))
                }
            }
        };

        match resolved {
            Some(parts) => parts,
            None => {
                let message = format!(
                    "timing for \"{}\" has no offset; defaulted to the measurement period",
                    single_line(element.display_name())
                );
                comments.push(format!("-- WARNING: {message}"));
                self.warnings.push(GenerationWarning::new(
                    WarningCode::AmbiguousTiming,
                    message,
                    Some(element.id.as_str()),
                ));
                (vec![], during)
            }
        }
    }
}
