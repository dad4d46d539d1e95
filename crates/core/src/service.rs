//! Facade over the generators, validators, override store and diff engine.
//!
//! This is the entry point the binaries use. It owns no global state: the override store is
//! injected as an `Arc` so several services (or an HTTP server's handlers) share one store.

use crate::config::{GenerationConfig, ValidationConfig};
use crate::cql::{BundleRegistry, CqlGenerator};
use crate::diff::MeasureDiff;
use crate::error::CoreResult;
use crate::format::OutputFormat;
use crate::generation::GenerationResult;
use crate::overrides::{inject, CodeOverride, EditNote, OverrideRequest, OverrideStore};
use crate::sql::SqlGenerator;
use crate::validation::{DetailedValidation, ValidationResult, Validator};
use std::sync::Arc;
use ums::Measure;

#[derive(Clone)]
pub struct MeasureService {
    store: Arc<OverrideStore>,
    registry: Arc<BundleRegistry>,
}

impl MeasureService {
    /// Creates a service with the standard boilerplate bundles.
    pub fn new(store: Arc<OverrideStore>) -> Self {
        Self::with_registry(store, BundleRegistry::standard())
    }

    pub fn with_registry(store: Arc<OverrideStore>, registry: BundleRegistry) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
        }
    }

    pub fn store(&self) -> &Arc<OverrideStore> {
        &self.store
    }

    /// Generates code for a measure and re-applies its locked overrides of that format.
    ///
    /// # Arguments
    ///
    /// * `format` - Target grammar.
    /// * `measure` - Measure to translate.
    /// * `config` - Generation options; set `generated_at` for byte-identical reruns.
    ///
    /// # Returns
    ///
    /// The generator's [`GenerationResult`], with `code` carrying the injected overrides and
    /// `overrides_applied` listing where each one went.
    pub fn generate(
        &self,
        format: OutputFormat,
        measure: &Measure,
        config: &GenerationConfig,
    ) -> GenerationResult {
        let mut result = match format {
            OutputFormat::Cql => CqlGenerator::new(&self.registry).generate(measure, config),
            OutputFormat::Sql => SqlGenerator::generate(measure, config),
        };
        let Some(code) = result.code.take() else {
            return result;
        };
        let overrides = self.store.overrides_for_measure(&measure.id, Some(format));
        let (code, applied) = inject(format, &code, &overrides);
        if !applied.is_empty() {
            tracing::info!(
                measure_id = %measure.id,
                %format,
                applied = applied.len(),
                "applied manual overrides"
            );
        }
        result.code = Some(code);
        result.overrides_applied = applied;
        result
    }

    pub fn validate(
        &self,
        format: OutputFormat,
        code: &str,
        config: &ValidationConfig,
    ) -> ValidationResult {
        Validator::validate(format, code, config)
    }

    pub fn validate_detailed(
        &self,
        format: OutputFormat,
        code: &str,
        config: &ValidationConfig,
    ) -> DetailedValidation {
        Validator::validate_detailed(format, code, config)
    }

    /// Saves and locks a manual override. See [`OverrideStore::save`].
    pub fn save_override(&self, request: OverrideRequest) -> CoreResult<Arc<CodeOverride>> {
        self.store.save(request)
    }

    pub fn revert_override(
        &self,
        measure_id: &str,
        component_id: &str,
        format: OutputFormat,
    ) -> bool {
        self.store.revert(measure_id, component_id, format)
    }

    pub fn overrides_for_measure(
        &self,
        measure_id: &str,
        format: Option<OutputFormat>,
    ) -> Vec<Arc<CodeOverride>> {
        self.store.overrides_for_measure(measure_id, format)
    }

    pub fn all_notes(&self, measure_id: &str, component_id: &str) -> Vec<EditNote> {
        self.store.all_notes(measure_id, component_id)
    }

    pub fn diff(&self, old: &Measure, new: &Measure) -> MeasureDiff {
        MeasureDiff::compare(old, new)
    }

    /// Structural diff plus a line diff of the generated clinical-query libraries.
    pub fn diff_with_code(
        &self,
        old: &Measure,
        new: &Measure,
        config: &GenerationConfig,
    ) -> MeasureDiff {
        MeasureDiff::compare_with_code(old, new, config, &self.registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn measure(id: &str) -> Measure {
        serde_json::from_value(json!({
            "id": id,
            "title": "Statin Therapy",
            "populations": [
                { "id": "ip", "type": "initial_population", "criteria": { "children": [
                    { "kind": "element", "id": "visit", "type": "encounter", "description": "Office Visit",
                      "valueSet": { "id": "vs-visit", "name": "Office Visit", "oid": "1.2.3" } }
                ]}},
                { "id": "num", "type": "numerator", "criteria": { "children": [
                    { "kind": "element", "id": "statin", "type": "medication", "description": "Statin",
                      "valueSet": { "id": "vs-statin", "name": "Statin", "oid": "1.2.4" } }
                ]}}
            ]
        }))
        .unwrap()
    }

    fn config() -> GenerationConfig {
        GenerationConfig {
            generated_at: Some(Utc.with_ymd_and_hms(2025, 2, 1, 8, 0, 0).unwrap()),
            ..GenerationConfig::default()
        }
    }

    fn service() -> MeasureService {
        MeasureService::new(Arc::new(OverrideStore::new()))
    }

    fn save(service: &MeasureService, measure_id: &str, format: OutputFormat, code: &str) {
        service
            .save_override(OverrideRequest {
                measure_id: measure_id.into(),
                component_id: "num".into(),
                format,
                code: code.into(),
                note: "Reviewed by clinical lead".into(),
                change_type: None,
                original_code: None,
            })
            .unwrap();
    }

    #[test]
    fn test_generation_is_idempotent_with_fixed_timestamp() {
        let service = service();
        for format in [OutputFormat::Cql, OutputFormat::Sql] {
            let first = service.generate(format, &measure("M1"), &config());
            let second = service.generate(format, &measure("M1"), &config());
            assert!(first.success);
            assert_eq!(first.code, second.code);
        }
    }

    #[test]
    fn test_override_survives_regeneration() {
        let service = service();
        save(&service, "M1", OutputFormat::Cql, "define \"Numerator\":\n  true");

        let mut edited = measure("M1");
        edited.title = "Statin Therapy for Cardiovascular Disease".into();
        for m in [measure("M1"), edited] {
            let result = service.generate(OutputFormat::Cql, &m, &config());
            let code = result.code.unwrap();
            assert!(code.contains("// MANUAL OVERRIDES APPLIED: 1"));
            assert!(code.contains("// MANUAL OVERRIDE\n"));
            assert!(!code.contains("[MedicationRequest: \"Statin\"]"));
            assert!(result.overrides_applied[0].anchored);
        }
    }

    #[test]
    fn test_multi_paragraph_override_is_stable_across_regenerations() {
        let service = service();
        let edited = "define \"Numerator\":\n\n  exists \"Statin\"\n\n  // second paragraph\n  and true";
        save(&service, "M1", OutputFormat::Cql, edited);

        let first = service.generate(OutputFormat::Cql, &measure("M1"), &config());
        let second = service.generate(OutputFormat::Cql, &measure("M1"), &config());
        let code = first.code.unwrap();
        assert!(code.contains(edited), "{code}");
        assert_eq!(Some(code), second.code);
        assert!(first.overrides_applied[0].anchored);
    }

    #[test]
    fn test_overrides_never_cross_measures_or_formats() {
        let service = service();
        save(&service, "M1", OutputFormat::Cql, "define \"Numerator\":\n  false");

        let other = service.generate(OutputFormat::Cql, &measure("M2"), &config());
        assert!(other.overrides_applied.is_empty());
        assert!(!other.code.unwrap().contains("MANUAL OVERRIDE"));

        let sql = service.generate(OutputFormat::Sql, &measure("M1"), &config());
        assert!(sql.overrides_applied.is_empty());
    }

    #[test]
    fn test_revert_restores_generated_code() {
        let service = service();
        let generated = service.generate(OutputFormat::Sql, &measure("M1"), &config()).code;
        save(
            &service,
            "M1",
            OutputFormat::Sql,
            "CREATE OR ALTER VIEW dbo.M1_Numerator AS\nSELECT pf.person_id, pf.population_id FROM dbo.M1_Denominator pf;",
        );
        let overridden = service.generate(OutputFormat::Sql, &measure("M1"), &config());
        assert_ne!(overridden.code, generated);
        assert!(overridden.code.unwrap().contains("FROM dbo.M1_Denominator pf;\nGO"));

        assert!(service.revert_override("M1", "num", OutputFormat::Sql));
        let reverted = service.generate(OutputFormat::Sql, &measure("M1"), &config());
        assert_eq!(reverted.code, generated);
        assert_eq!(service.all_notes("M1", "num").len(), 1);
    }

    #[test]
    fn test_generated_sql_validates_through_service() {
        let service = service();
        let code = service
            .generate(OutputFormat::Sql, &measure("M1"), &config())
            .code
            .unwrap();
        let result = service.validate(OutputFormat::Sql, &code, &ValidationConfig::default());
        assert!(result.valid, "{result:?}");
        assert_eq!(result.score, 100);

        let cql = service
            .generate(OutputFormat::Cql, &measure("M1"), &config())
            .code
            .unwrap();
        let result = service.validate(OutputFormat::Cql, &cql, &ValidationConfig::default());
        assert!(result.valid, "{result:?}");
    }
}
