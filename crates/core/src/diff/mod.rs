//! Version diff of two measure snapshots.
//!
//! The structural diff compares metadata field by field, data elements by id and
//! measure-level value sets by id (falling back to name). The optional code diff is a plain
//! line diff of the two generated clinical-query libraries and carries no semantic weight.

mod text;

pub use text::{line_diff, CodeDiff, DiffLine, LineChange};

use crate::config::GenerationConfig;
use crate::cql::{BundleRegistry, CqlGenerator};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use ums::{DataElement, Measure, ValueSetReference};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSummary {
    pub elements_added: usize,
    pub elements_removed: usize,
    pub elements_modified: usize,
    pub value_sets_changed: usize,
    pub total_changes: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataChange {
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementChange {
    pub element_id: String,
    pub element_name: String,
    pub change_type: ChangeKind,
    /// One human-readable line per differing field; empty for added and removed elements.
    pub changes: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueSetChange {
    pub value_set_id: String,
    pub name: String,
    pub change_type: ChangeKind,
    pub changes: Vec<String>,
}

/// Structural differences between two measure versions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasureDiff {
    pub summary: DiffSummary,
    pub metadata_changes: Vec<MetadataChange>,
    pub element_changes: Vec<ElementChange>,
    pub value_set_changes: Vec<ValueSetChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_diff: Option<CodeDiff>,
}

impl MeasureDiff {
    /// Compares two measure snapshots.
    ///
    /// Removed and modified elements are listed in old-tree order, followed by added elements
    /// in new-tree order.
    pub fn compare(old: &Measure, new: &Measure) -> Self {
        let metadata_changes = metadata_changes(old, new);

        let old_elements = elements_by_id(old);
        let new_elements = elements_by_id(new);
        let new_index: HashMap<&str, &DataElement> =
            new_elements.iter().map(|e| (e.id.as_str(), *e)).collect();
        let old_ids: HashSet<&str> = old_elements.iter().map(|e| e.id.as_str()).collect();

        let mut element_changes = Vec::new();
        for before in &old_elements {
            match new_index.get(before.id.as_str()) {
                None => element_changes.push(ElementChange {
                    element_id: before.id.clone(),
                    element_name: before.display_name().to_string(),
                    change_type: ChangeKind::Removed,
                    changes: Vec::new(),
                }),
                Some(after) => {
                    let changes = element_field_changes(before, after);
                    if !changes.is_empty() {
                        element_changes.push(ElementChange {
                            element_id: after.id.clone(),
                            element_name: after.display_name().to_string(),
                            change_type: ChangeKind::Modified,
                            changes,
                        });
                    }
                }
            }
        }
        for after in new_elements.iter().filter(|e| !old_ids.contains(e.id.as_str())) {
            element_changes.push(ElementChange {
                element_id: after.id.clone(),
                element_name: after.display_name().to_string(),
                change_type: ChangeKind::Added,
                changes: Vec::new(),
            });
        }

        let value_set_changes = value_set_changes(&old.value_sets, &new.value_sets);

        let count = |kind: ChangeKind| {
            element_changes
                .iter()
                .filter(|c| c.change_type == kind)
                .count()
        };
        let mut summary = DiffSummary {
            elements_added: count(ChangeKind::Added),
            elements_removed: count(ChangeKind::Removed),
            elements_modified: count(ChangeKind::Modified),
            value_sets_changed: value_set_changes.len(),
            total_changes: 0,
        };
        summary.total_changes = summary.elements_added
            + summary.elements_removed
            + summary.elements_modified
            + summary.value_sets_changed
            + metadata_changes.len();

        tracing::debug!(
            old_id = %old.id,
            new_id = %new.id,
            total_changes = summary.total_changes,
            "compared measure versions"
        );
        Self {
            summary,
            metadata_changes,
            element_changes,
            value_set_changes,
            code_diff: None,
        }
    }

    /// [`MeasureDiff::compare`] plus a line diff of both generated clinical-query libraries.
    ///
    /// Both libraries are generated with one shared timestamp, so the timestamp line never
    /// shows up as a change. The code diff is omitted when either measure fails generation.
    pub fn compare_with_code(
        old: &Measure,
        new: &Measure,
        config: &GenerationConfig,
        registry: &BundleRegistry,
    ) -> Self {
        let mut diff = Self::compare(old, new);
        let shared = GenerationConfig {
            generated_at: Some(config.timestamp()),
            ..config.clone()
        };
        let generator = CqlGenerator::new(registry);
        let old_code = generator.generate(old, &shared).code;
        let new_code = generator.generate(new, &shared).code;
        if let (Some(old_code), Some(new_code)) = (old_code, new_code) {
            diff.code_diff = Some(line_diff(&old_code, &new_code));
        }
        diff
    }
}

/// Data elements of every population in authored order, first occurrence of each id.
fn elements_by_id(measure: &Measure) -> Vec<&DataElement> {
    let mut seen = HashSet::new();
    measure
        .data_elements()
        .map(|(_, element)| element)
        .filter(|element| seen.insert(element.id.as_str()))
        .collect()
}

fn metadata_changes(old: &Measure, new: &Measure) -> Vec<MetadataChange> {
    fn text(value: &str) -> Option<String> {
        Some(value.to_string()).filter(|v| !v.is_empty())
    }
    let fields: [(&str, Option<String>, Option<String>); 8] = [
        ("id", text(&old.id), text(&new.id)),
        ("title", text(&old.title), text(&new.title)),
        ("version", text(&old.version), text(&new.version)),
        ("steward", old.steward.clone(), new.steward.clone()),
        (
            "measureType",
            Some(old.measure_type.as_str().to_string()),
            Some(new.measure_type.as_str().to_string()),
        ),
        (
            "measurementPeriod",
            old.measurement_period.map(|p| p.to_string()),
            new.measurement_period.map(|p| p.to_string()),
        ),
        (
            "ageRange",
            old.global_constraints.age_range.map(|r| r.to_string()),
            new.global_constraints.age_range.map(|r| r.to_string()),
        ),
        (
            "gender",
            old.global_constraints.gender.map(|g| g.code().to_string()),
            new.global_constraints.gender.map(|g| g.code().to_string()),
        ),
    ];
    fields
        .into_iter()
        .filter(|(_, before, after)| before != after)
        .map(|(field, old_value, new_value)| MetadataChange {
            field: field.to_string(),
            old_value,
            new_value,
        })
        .collect()
}

fn show<T: ToString>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none".to_string())
}

fn element_field_changes(old: &DataElement, new: &DataElement) -> Vec<String> {
    let mut changes = Vec::new();
    if old.element_type != new.element_type {
        changes.push(format!("type: {} -> {}", old.element_type, new.element_type));
    }
    if old.description.trim() != new.description.trim() {
        changes.push(format!(
            "description: \"{}\" -> \"{}\"",
            old.description.trim(),
            new.description.trim()
        ));
    }
    match (&old.value_set, &new.value_set) {
        (None, None) => {}
        (None, Some(added)) => changes.push(format!("value set added: {}", added.name)),
        (Some(removed), None) => changes.push(format!("value set removed: {}", removed.name)),
        (Some(before), Some(after)) => changes.extend(value_set_field_changes(before, after)),
    }
    if old.timing != new.timing {
        changes.push(format!("timing: {} -> {}", show(&old.timing), show(&new.timing)));
    }
    if old.quantity != new.quantity {
        changes.push(format!(
            "quantity: {} -> {}",
            show(&old.quantity),
            show(&new.quantity)
        ));
    }
    if old.negation != new.negation {
        changes.push(format!("negation: {} -> {}", old.negation, new.negation));
    }
    if old.gender != new.gender {
        changes.push(format!(
            "gender: {} -> {}",
            show(&old.gender.map(|g| g.code())),
            show(&new.gender.map(|g| g.code()))
        ));
    }
    if old.age_range != new.age_range {
        changes.push(format!(
            "age range: {} -> {}",
            show(&old.age_range),
            show(&new.age_range)
        ));
    }
    changes
}

fn value_set_field_changes(old: &ValueSetReference, new: &ValueSetReference) -> Vec<String> {
    let mut changes = Vec::new();
    if old.name != new.name {
        changes.push(format!("value set: \"{}\" -> \"{}\"", old.name, new.name));
    }
    if old.oid() != new.oid() {
        changes.push(format!(
            "value set OID: {} -> {}",
            old.oid().unwrap_or("none"),
            new.oid().unwrap_or("none")
        ));
    }
    if old.url() != new.url() {
        changes.push(format!(
            "value set URL: {} -> {}",
            old.url().unwrap_or("none"),
            new.url().unwrap_or("none")
        ));
    }
    let key = |vs: &ValueSetReference| -> HashSet<(String, String)> {
        vs.codes
            .iter()
            .map(|c| (c.system.clone(), c.code.clone()))
            .collect()
    };
    let (before, after) = (key(old), key(new));
    let added = after.difference(&before).count();
    let removed = before.difference(&after).count();
    if added > 0 || removed > 0 {
        changes.push(format!("value set codes: {added} added, {removed} removed"));
    }
    changes
}

fn value_set_changes(old: &[ValueSetReference], new: &[ValueSetReference]) -> Vec<ValueSetChange> {
    let new_index: HashMap<&str, &ValueSetReference> =
        new.iter().map(|vs| (vs.match_key(), vs)).collect();
    let old_keys: HashSet<&str> = old.iter().map(|vs| vs.match_key()).collect();

    let mut changes = Vec::new();
    for before in old {
        match new_index.get(before.match_key()) {
            None => changes.push(ValueSetChange {
                value_set_id: before.match_key().to_string(),
                name: before.name.clone(),
                change_type: ChangeKind::Removed,
                changes: Vec::new(),
            }),
            Some(after) => {
                let fields = value_set_field_changes(before, after);
                if !fields.is_empty() {
                    changes.push(ValueSetChange {
                        value_set_id: after.match_key().to_string(),
                        name: after.name.clone(),
                        change_type: ChangeKind::Modified,
                        changes: fields,
                    });
                }
            }
        }
    }
    for after in new.iter().filter(|vs| !old_keys.contains(vs.match_key())) {
        changes.push(ValueSetChange {
            value_set_id: after.match_key().to_string(),
            name: after.name.clone(),
            change_type: ChangeKind::Added,
            changes: Vec::new(),
        });
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn element(id: &str, description: &str) -> serde_json::Value {
        json!({
            "kind": "element", "id": id, "type": "procedure", "description": description,
            "valueSet": { "id": format!("vs-{id}"), "name": description, "oid": "1.2.3",
                          "codes": [{ "code": "A", "system": "CPT" }] }
        })
    }

    fn measure(children: Vec<serde_json::Value>) -> Measure {
        serde_json::from_value(json!({
            "id": "CMS130",
            "title": "Colorectal Cancer Screening",
            "version": "1.0.0",
            "populations": [
                { "id": "ip", "type": "initial_population", "criteria": { "children": [element("visit", "Office Visit")] } },
                { "id": "num", "type": "numerator", "criteria": { "operator": "OR", "children": children } }
            ],
            "valueSets": [{ "id": "vs-visit", "name": "Office Visit", "oid": "1.2.3" }]
        }))
        .unwrap()
    }

    #[test]
    fn test_single_added_element() {
        let old = measure(vec![element("colo", "Colonoscopy")]);
        let new = measure(vec![element("colo", "Colonoscopy"), element("fobt", "FOBT")]);
        let diff = MeasureDiff::compare(&old, &new);
        assert_eq!(diff.summary.elements_added, 1);
        assert_eq!(diff.element_changes.len(), 1);
        assert_eq!(diff.element_changes[0].change_type, ChangeKind::Added);
        assert_eq!(diff.element_changes[0].element_id, "fobt");
        assert_eq!(diff.summary.total_changes, 1);
        assert!(diff.code_diff.is_none());
    }

    #[test]
    fn test_identical_measures_have_no_changes() {
        let m = measure(vec![element("colo", "Colonoscopy")]);
        assert_eq!(MeasureDiff::compare(&m, &m).summary, DiffSummary::default());
    }

    #[test]
    fn test_modified_element_itemises_fields() {
        let old = measure(vec![element("colo", "Colonoscopy")]);
        let mut changed = element("colo", "Colonoscopy Performed");
        changed["valueSet"]["oid"] = json!("9.9.9");
        changed["valueSet"]["codes"] = json!([{ "code": "B", "system": "CPT" }, { "code": "C", "system": "CPT" }]);
        changed["timing"] = json!({ "type": "withinBeforeEnd", "value": 10, "unit": "years" });
        changed["negation"] = json!(true);
        let new = measure(vec![changed]);

        let diff = MeasureDiff::compare(&old, &new);
        assert_eq!(diff.summary.elements_modified, 1);
        let changes = &diff.element_changes[0].changes;
        assert_eq!(
            changes,
            &vec![
                "description: \"Colonoscopy\" -> \"Colonoscopy Performed\"".to_string(),
                "value set: \"Colonoscopy\" -> \"Colonoscopy Performed\"".to_string(),
                "value set OID: 1.2.3 -> 9.9.9".to_string(),
                "value set codes: 2 added, 1 removed".to_string(),
                "timing: none -> within 10 years before end of measurement period".to_string(),
                "negation: false -> true".to_string(),
            ]
        );
    }

    #[test]
    fn test_removed_before_added_and_metadata() {
        let old = measure(vec![element("colo", "Colonoscopy")]);
        let mut new = measure(vec![element("fobt", "FOBT")]);
        new.title = "Colorectal Screening".into();
        new.version = "2.0.0".into();
        new.value_sets.push(serde_json::from_value(json!({ "id": "vs-x", "name": "X" })).unwrap());

        let diff = MeasureDiff::compare(&old, &new);
        let kinds: Vec<ChangeKind> = diff.element_changes.iter().map(|c| c.change_type).collect();
        assert_eq!(kinds, vec![ChangeKind::Removed, ChangeKind::Added]);
        let fields: Vec<&str> = diff.metadata_changes.iter().map(|c| c.field.as_str()).collect();
        assert_eq!(fields, vec!["title", "version"]);
        assert_eq!(diff.summary.value_sets_changed, 1);
        assert_eq!(diff.value_set_changes[0].change_type, ChangeKind::Added);
        assert_eq!(diff.summary.total_changes, 1 + 1 + 1 + 2);
    }

    #[test]
    fn test_code_diff_ignores_timestamp() {
        let old = measure(vec![element("colo", "Colonoscopy")]);
        let new = measure(vec![element("colo", "Colonoscopy"), element("fobt", "FOBT")]);
        let config = GenerationConfig {
            generated_at: Some(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()),
            ..GenerationConfig::default()
        };
        let diff = MeasureDiff::compare_with_code(&old, &new, &config, &BundleRegistry::empty());
        let code = diff.code_diff.unwrap();
        assert!(code.added > 0);
        assert!(code
            .lines
            .iter()
            .filter(|l| l.change != LineChange::Unchanged)
            .all(|l| !l.text.contains("Generated:")));
    }
}
