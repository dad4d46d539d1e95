//! Criteria tree to SQL boolean condition translation.
//!
//! Conditions are written over the person-level flag projection (alias `pf`), so each data
//! element becomes a comparison on its flag column. Clause semantics match the clinical-query
//! translation: neutral children are dropped, an empty clause is neutral and a NOT clause
//! negates its first surviving child.

use super::predicate::{sql_literal, PredicatePlanner, PredicateSource};
use crate::generation::{single_line, GenerationWarning, WarningCode};
use ums::{AgeRange, CriteriaNode, DataElement, Gender, LogicalClause, LogicalOperator};

/// Translated condition; `None` means the clause constrains nothing.
pub(crate) type Condition = Option<String>;

pub(crate) fn age_condition(column: &str, range: &AgeRange) -> Option<String> {
    match (range.min, range.max) {
        (Some(min), Some(max)) => Some(format!("{column} BETWEEN {min} AND {max}")),
        (Some(min), None) => Some(format!("{column} >= {min}")),
        (None, Some(max)) => Some(format!("{column} <= {max}")),
        (None, None) => None,
    }
}

pub(crate) struct ConditionBuilder<'p, 'a> {
    planner: &'p PredicatePlanner<'a>,
    contexts: &'p [String],
    pub warnings: Vec<GenerationWarning>,
}

impl<'p, 'a> ConditionBuilder<'p, 'a> {
    pub(crate) fn new(planner: &'p PredicatePlanner<'a>, contexts: &'p [String]) -> Self {
        Self {
            planner,
            contexts,
            warnings: Vec::new(),
        }
    }

    pub(crate) fn clause(&mut self, clause: &LogicalClause) -> Condition {
        self.translate(clause).map(|(text, _)| text)
    }

    /// Returns the condition text and whether it joins several operands.
    fn translate(&mut self, clause: &LogicalClause) -> Option<(String, bool)> {
        let mut operands = clause.children.iter().filter_map(|child| match child {
            CriteriaNode::Clause(nested) => match self.translate(nested)? {
                (text, true) => Some(format!("({text})")),
                (text, false) => Some(text),
            },
            CriteriaNode::Element(element) => self.element(element),
        });
        match clause.operator {
            LogicalOperator::Not => {
                let first = operands.next()?;
                if clause.children.len() > 1 {
                    self.warnings.push(GenerationWarning::new(
                        WarningCode::NotClauseMultipleChildren,
                        format!(
                            "NOT clause has {} children; only the first is negated",
                            clause.children.len()
                        ),
                        Some(clause.id.as_str()),
                    ));
                }
                Some((format!("NOT ({first})"), false))
            }
            LogicalOperator::And | LogicalOperator::Or => {
                let joiner = if clause.operator == LogicalOperator::And {
                    " AND "
                } else {
                    " OR "
                };
                let mut operands: Vec<String> = operands.collect();
                match operands.len() {
                    0 => None,
                    1 => operands.pop().map(|text| (text, false)),
                    _ => Some((operands.join(joiner), true)),
                }
            }
        }
    }

    fn element(&mut self, element: &DataElement) -> Condition {
        match self.planner.source(&element.id) {
            Some(PredicateSource::Cte { flag_column, .. }) => {
                let wanted = if element.negation { 0 } else { 1 };
                Some(format!("pf.{flag_column} = {wanted}"))
            }
            Some(PredicateSource::Unresolved) => None,
            None => self.demographic(element),
        }
    }

    /// Gender filter on the projected `gender_concept_name` column.
    ///
    /// The column only exists when the GENDER ontology context is joined; without it the
    /// filter is dropped and a warning names `subject`.
    pub(crate) fn gender(&mut self, gender: Gender, subject: &str, component_id: Option<&str>) -> Condition {
        if self.contexts.iter().any(|c| c == "GENDER") {
            return Some(format!(
                "pf.gender_concept_name = {}",
                sql_literal(gender.display())
            ));
        }
        self.warnings.push(GenerationWarning::new(
            WarningCode::MissingOntologyContext,
            format!("{subject} needs the GENDER ontology context"),
            component_id,
        ));
        None
    }

    fn demographic(&mut self, element: &DataElement) -> Condition {
        let mut parts = Vec::new();
        if let Some(gender) = element.gender {
            let subject = format!("demographic \"{}\"", single_line(element.display_name()));
            parts.extend(self.gender(gender, &subject, Some(element.id.as_str())));
        }
        if let Some(age) = element
            .age_range
            .as_ref()
            .and_then(|range| age_condition("pf.age_at_period_end", range))
        {
            parts.push(age);
        }
        match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => Some(format!("({})", parts.join(" AND "))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ums::{Measure, MeasurementPeriod};

    fn measure() -> Measure {
        serde_json::from_value(serde_json::json!({
            "id": "M",
            "populations": [{
                "id": "p", "type": "numerator",
                "criteria": { "operator": "AND", "children": [
                    { "kind": "element", "id": "visit", "type": "encounter", "description": "Visit",
                      "valueSet": { "name": "Visit", "oid": "1.1" } },
                    { "kind": "clause", "operator": "OR", "children": [
                        { "kind": "element", "id": "female", "type": "demographic", "gender": "female" },
                        { "kind": "element", "id": "older", "type": "demographic", "ageRange": { "min": 65 } }
                    ]},
                    { "kind": "clause", "operator": "NOT", "children": [
                        { "kind": "element", "id": "hospice", "type": "encounter", "description": "Hospice",
                          "valueSet": { "name": "Hospice", "oid": "1.2" } }
                    ]},
                    { "kind": "element", "id": "missing", "type": "procedure" }
                ]}
            }]
        }))
        .unwrap()
    }

    #[test]
    fn test_tree_translates_to_flag_conditions() {
        let m = measure();
        let planner = PredicatePlanner::new(
            &m,
            MeasurementPeriod::calendar_year(2025).unwrap(),
            "'{{population_id}}'".into(),
        )
        .plan();
        let contexts = vec!["GENDER".to_string()];
        let mut builder = ConditionBuilder::new(&planner, &contexts);
        let condition = builder.clause(&m.populations[0].criteria).unwrap();
        assert_eq!(
            condition,
            "pf.has_visit = 1 AND (pf.gender_concept_name = 'Female' OR pf.age_at_period_end >= 65) AND NOT (pf.has_hospice = 1)"
        );
    }

    #[test]
    fn test_gender_without_context_warns() {
        let m = measure();
        let planner = PredicatePlanner::new(
            &m,
            MeasurementPeriod::calendar_year(2025).unwrap(),
            "'x'".into(),
        )
        .plan();
        let contexts = vec!["RACE".to_string()];
        let mut builder = ConditionBuilder::new(&planner, &contexts);
        let condition = builder.clause(&m.populations[0].criteria).unwrap();
        assert!(
            condition.contains("pf.has_visit = 1 AND pf.age_at_period_end >= 65 AND NOT"),
            "{condition}"
        );
        assert_eq!(builder.warnings[0].code, WarningCode::MissingOntologyContext);
    }

    #[test]
    fn test_empty_clause_is_neutral() {
        let m = measure();
        let planner = PredicatePlanner::new(
            &m,
            MeasurementPeriod::calendar_year(2025).unwrap(),
            "'x'".into(),
        );
        let contexts = Vec::new();
        let mut builder = ConditionBuilder::new(&planner, &contexts);
        assert_eq!(builder.clause(&LogicalClause::default()), None);
    }
}
