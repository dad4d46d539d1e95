use super::bundles::{BoilerplateBundle, BundleRegistry};
use super::expression::{age_expression, quoted, Expr, ExpressionBuilder, PERIOD};
use crate::config::GenerationConfig;
use crate::constants::{GENERATED_PREFIX, NEUTRAL_LITERAL, QICORE_VERSION, VALUE_SET_URL_PREFIX};
use crate::format::OutputFormat;
use crate::generation::{
    check_preconditions, component_marker, single_line, CqlMetadata, GenerationMetadata,
    GenerationResult, GenerationWarning, WarningCode,
};
use chrono::SecondsFormat;
use std::collections::HashSet;
use ums::{ElementType, Measure, Population, PopulationType, ValueSetReference};

const DEFAULT_LIBRARY_VERSION: &str = "1.0.000";
const AGE_HELPER: &str = "Patient Age Valid";
const GENDER_HELPER: &str = "Patient Gender Valid";
const ENCOUNTER_HELPER: &str = "Qualifying Encounters";
const HOSPICE_EXCLUSION: &str = "Hospice.\"Has Hospice Services\"";

const SUPPLEMENTAL_DATA_ELEMENTS: [&str; 4] =
    ["SDE Ethnicity", "SDE Payer", "SDE Race", "SDE Sex"];

/// Derives the library identifier from a measure id.
///
/// Non-alphanumeric characters are stripped and an underscore is prefixed when the result
/// starts with a digit, e.g. `CMS130v12` stays as is and `130-v2` becomes `_130v2`.
pub fn library_name(measure_id: &str) -> String {
    let stripped: String = measure_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    match stripped.chars().next() {
        None => "UnnamedMeasure".to_string(),
        Some(c) if c.is_ascii_digit() => format!("_{stripped}"),
        Some(_) => stripped,
    }
}

/// Emits clinical-query library text for a measure.
#[derive(Clone, Copy, Debug)]
pub struct CqlGenerator<'r> {
    registry: &'r BundleRegistry,
}

impl<'r> CqlGenerator<'r> {
    pub fn new(registry: &'r BundleRegistry) -> Self {
        Self { registry }
    }

    /// Generates a complete library for `measure`.
    ///
    /// # Arguments
    ///
    /// * `measure` - The measure to translate; it must have an id and at least one population.
    /// * `config` - Generation options; only `measurement_period` and `generated_at` apply here.
    ///
    /// # Returns
    ///
    /// A [`GenerationResult`] that is never an `Err`: precondition failures come back with
    /// `success == false` and no code.
    pub fn generate(&self, measure: &Measure, config: &GenerationConfig) -> GenerationResult {
        let errors = check_preconditions(measure);
        if !errors.is_empty() {
            tracing::info!(measure_id = %measure.id, ?errors, "clinical-query generation rejected");
            return GenerationResult::failed(OutputFormat::Cql, errors);
        }

        let bundle = self.registry.select(measure);
        if let Some(bundle) = bundle {
            tracing::debug!(measure_id = %measure.id, bundle = bundle.name(), "boilerplate bundle selected");
        }

        let mut library = LibraryWriter::new(measure, config, bundle);
        library.preamble();
        library.helpers();
        library.populations();
        library.supplemental_data();

        let LibraryWriter {
            blocks,
            expressions,
            mut warnings,
            library_name,
            version,
            population_count,
            value_set_count,
            definition_count,
            ..
        } = library;
        warnings.extend(expressions.into_warnings());

        let mut code = blocks.join("\n\n");
        code.push('\n');

        tracing::info!(
            measure_id = %measure.id,
            library = %library_name,
            definitions = definition_count,
            warnings = warnings.len(),
            "generated clinical-query library"
        );

        GenerationResult::succeeded(
            OutputFormat::Cql,
            code,
            warnings,
            GenerationMetadata::Cql(CqlMetadata {
                library_name,
                version,
                population_count,
                value_set_count,
                definition_count,
            }),
        )
    }
}

/// Accumulates blank-line-separated blocks of library text.
struct LibraryWriter<'a> {
    measure: &'a Measure,
    config: &'a GenerationConfig,
    bundle: Option<&'a BoilerplateBundle>,
    expressions: ExpressionBuilder<'a>,
    blocks: Vec<String>,
    warnings: Vec<GenerationWarning>,
    library_name: String,
    version: String,
    population_count: usize,
    value_set_count: usize,
    definition_count: usize,
    has_age_helper: bool,
    has_gender_helper: bool,
}

impl<'a> LibraryWriter<'a> {
    fn new(
        measure: &'a Measure,
        config: &'a GenerationConfig,
        bundle: Option<&'a BoilerplateBundle>,
    ) -> Self {
        let version = match measure.version.trim() {
            "" => DEFAULT_LIBRARY_VERSION.to_string(),
            v => v.replace('\'', ""),
        };
        Self {
            measure,
            config,
            bundle,
            expressions: ExpressionBuilder::new(measure),
            blocks: Vec::new(),
            warnings: Vec::new(),
            library_name: library_name(&measure.id),
            version,
            population_count: 0,
            value_set_count: 0,
            definition_count: 0,
            has_age_helper: false,
            has_gender_helper: false,
        }
    }

    fn define(&mut self, marker: Option<String>, comments: Vec<String>, name: &str, body: &str) {
        let mut lines: Vec<String> = marker.into_iter().collect();
        lines.extend(comments);
        lines.push(format!("define {}:", quoted(name)));
        lines.extend(
            body.lines()
                .filter(|l| !l.trim().is_empty())
                .map(|l| {
                    if l.starts_with("  ") {
                        l.to_string()
                    } else {
                        format!("  {l}")
                    }
                }),
        );
        self.blocks.push(lines.join("\n"));
        self.definition_count += 1;
    }

    // ========================================================================
    // Preamble
    // ========================================================================

    fn preamble(&mut self) {
        let timestamp = self
            .config
            .timestamp()
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut header = Vec::new();
        if !self.measure.title.trim().is_empty() {
            header.push(format!("// {}", single_line(&self.measure.title)));
        }
        header.push(format!("// {GENERATED_PREFIX}{timestamp}"));
        header.push(format!(
            "library {} version '{}'",
            self.library_name, self.version
        ));
        self.blocks.push(header.join("\n"));

        self.blocks
            .push(format!("using QICore version '{QICORE_VERSION}'"));

        self.blocks.push(
            [
                "include FHIRHelpers version '4.4.000' called FHIRHelpers",
                "include QICoreCommon version '2.1.000' called QICoreCommon",
                "include SupplementalDataElements version '3.5.000' called SDE",
                "include Hospice version '6.12.000' called Hospice",
            ]
            .join("\n"),
        );

        self.blocks.push(
            [
                "codesystem \"LOINC\": 'http://loinc.org'",
                "codesystem \"SNOMEDCT\": 'http://snomed.info/sct'",
                "codesystem \"ICD10CM\": 'http://hl7.org/fhir/sid/icd-10-cm'",
                "codesystem \"CPT\": 'http://www.ama-assn.org/go/cpt'",
                "codesystem \"ConditionClinicalStatusCodes\": 'http://terminology.hl7.org/CodeSystem/condition-clinical'",
            ]
            .join("\n"),
        );

        self.blocks.push(
            "code \"active\": 'active' from \"ConditionClinicalStatusCodes\" display 'Active'"
                .to_string(),
        );

        let value_sets = self.value_set_declarations();
        if !value_sets.is_empty() {
            self.blocks.push(value_sets.join("\n"));
        }

        let period = self.config.measurement_period_for(self.measure);
        self.blocks.push(format!(
            "parameter {PERIOD} Interval<DateTime>\n  default Interval[@{}T00:00:00.000, @{}T23:59:59.999]",
            period.start, period.end
        ));

        self.blocks.push("context Patient".to_string());
    }

    /// Declares the measure's value sets, then element-embedded ones, then bundle ones,
    /// each name at most once.
    fn value_set_declarations(&mut self) -> Vec<String> {
        let mut candidates: Vec<ValueSetReference> = self.measure.value_sets.clone();
        for (_, element) in self.measure.data_elements() {
            if let Some(vs) = self.measure.resolve_value_set(element) {
                candidates.push(vs.clone());
            }
        }

        let mut lines = Vec::new();
        let mut declared = HashSet::new();
        for vs in &candidates {
            let label = if vs.name.trim().is_empty() {
                vs.id.trim()
            } else {
                vs.name.trim()
            };
            if !declared.insert(label.to_string()) {
                continue;
            }
            let locator = vs
                .url()
                .map(String::from)
                .or_else(|| vs.oid().map(|oid| format!("{VALUE_SET_URL_PREFIX}{oid}")));
            let Some(locator) = locator else {
                let message = format!(
                    "value set \"{}\" has no URL or OID and was not declared",
                    single_line(label)
                );
                lines.push(format!("// WARNING: {message}"));
                self.warnings.push(GenerationWarning::new(
                    WarningCode::ValueSetWithoutLocator,
                    message,
                    Some(vs.id.as_str()),
                ));
                continue;
            };
            if vs.name.trim().is_empty() {
                let message = format!(
                    "value set \"{}\" has no name and was not declared",
                    single_line(label)
                );
                lines.push(format!("// WARNING: {message}"));
                self.warnings.push(GenerationWarning::new(
                    WarningCode::ValueSetWithoutName,
                    message,
                    Some(vs.id.as_str()),
                ));
                continue;
            }
            if vs.codes.is_empty() {
                let message = format!("value set \"{}\" has no codes", single_line(label));
                lines.push(format!("// WARNING: {message}"));
                self.warnings.push(GenerationWarning::new(
                    WarningCode::ValueSetWithoutCodes,
                    message,
                    Some(vs.id.as_str()),
                ));
            }
            lines.push(format!("valueset {}: '{}'", quoted(&vs.name), locator));
            self.value_set_count += 1;
        }

        if let Some(bundle) = self.bundle {
            for vs in &bundle.value_sets {
                if declared.insert(vs.name.clone()) {
                    lines.push(format!(
                        "valueset {}: '{VALUE_SET_URL_PREFIX}{}'",
                        quoted(&vs.name),
                        vs.oid
                    ));
                    self.value_set_count += 1;
                }
            }
        }
        lines
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn helpers(&mut self) {
        let constraints = &self.measure.global_constraints;
        if let Some(age) = constraints.age_range.as_ref().and_then(age_expression) {
            self.define(None, Vec::new(), AGE_HELPER, &age);
            self.has_age_helper = true;
        }
        if let Some(gender) = constraints.gender {
            let body = format!("Patient.gender = '{}'", gender.code());
            self.define(None, Vec::new(), GENDER_HELPER, &body);
            self.has_gender_helper = true;
        }

        let encounter_sets = self.encounter_value_sets();
        let has_encounters = self
            .measure
            .data_elements()
            .any(|(_, e)| e.element_type == ElementType::Encounter);
        if has_encounters {
            let source = match encounter_sets.as_slice() {
                [] => "[Encounter]".to_string(),
                [single] => format!("[Encounter: {}]", quoted(single)),
                many => format!(
                    "( {} )",
                    many.iter()
                        .map(|name| format!("[Encounter: {}]", quoted(name)))
                        .collect::<Vec<_>>()
                        .join(" union ")
                ),
            };
            let body = format!(
                "{source} ValidEncounter\n    where ValidEncounter.status = 'finished'\n      and ValidEncounter.period during {PERIOD}"
            );
            self.define(None, Vec::new(), ENCOUNTER_HELPER, &body);
        }

        if let Some(bundle) = self.bundle {
            for definition in &bundle.definitions {
                self.define(None, Vec::new(), &definition.name, &definition.body);
            }
        }
    }

    fn encounter_value_sets(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for (_, element) in self.measure.data_elements() {
            if element.element_type != ElementType::Encounter {
                continue;
            }
            if let Some(vs) = self
                .measure
                .resolve_value_set(element)
                .filter(|vs| vs.is_resolvable())
            {
                let name = vs.name.trim().to_string();
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    // ========================================================================
    // Populations
    // ========================================================================

    fn populations(&mut self) {
        let measure = self.measure;

        // Initial Population
        let population = measure.population(PopulationType::InitialPopulation);
        let mut operands = Vec::new();
        if self.has_age_helper {
            operands.push(quoted(AGE_HELPER));
        }
        if self.has_gender_helper {
            operands.push(quoted(GENDER_HELPER));
        }
        operands.extend(self.tree(population).into_operand());
        let body = if operands.is_empty() {
            NEUTRAL_LITERAL.to_string()
        } else {
            operands.join("\n    and ")
        };
        self.population(PopulationType::InitialPopulation, population, Vec::new(), &body);

        // Denominator
        let population = measure.population(PopulationType::Denominator);
        let body = match population {
            Some(p) if !p.criteria.is_empty() => self.tree(Some(p)).into_text(),
            _ => quoted(PopulationType::InitialPopulation.definition_name()),
        };
        self.population(PopulationType::Denominator, population, Vec::new(), &body);

        // Denominator Exclusion
        let population = measure.population(PopulationType::DenominatorExclusion);
        let mut operands = vec![HOSPICE_EXCLUSION.to_string()];
        if let Some(bundle) = self.bundle {
            operands.extend(bundle.exclusions.iter().cloned());
        }
        operands.extend(self.tree(population).into_operand());
        let body = operands.join("\n    or ");
        self.population(
            PopulationType::DenominatorExclusion,
            population,
            Vec::new(),
            &body,
        );

        // Denominator Exception
        if let Some(population) = measure.population(PopulationType::DenominatorException) {
            self.optional_population(PopulationType::DenominatorException, population);
        }

        // Numerator
        let population = measure.population(PopulationType::Numerator);
        let fixed = self.bundle.and_then(|b| b.numerator.clone());
        let mut comments = Vec::new();
        let body = match fixed {
            Some(expression) => expression,
            None => match self.tree(population) {
                Expr::Neutral => {
                    let message = "numerator has no criteria; emitted an always-true placeholder";
                    comments.push(format!("// WARNING: {message}"));
                    self.warnings.push(GenerationWarning::new(
                        WarningCode::EmptyNumerator,
                        message,
                        population.map(|p| p.id.as_str()),
                    ));
                    NEUTRAL_LITERAL.to_string()
                }
                expr => expr.into_text(),
            },
        };
        self.population(PopulationType::Numerator, population, comments, &body);

        // Numerator Exclusion
        if let Some(population) = measure.population(PopulationType::NumeratorExclusion) {
            self.optional_population(PopulationType::NumeratorExclusion, population);
        }
    }

    /// Defines an exception or exclusion population. An empty tree still yields the neutral
    /// literal, which matches every patient, so it is flagged.
    fn optional_population(&mut self, population_type: PopulationType, population: &Population) {
        let mut comments = Vec::new();
        let body = match self.tree(Some(population)) {
            Expr::Neutral => {
                let message = format!(
                    "{} has no criteria; the always-true placeholder applies to every patient",
                    population_type.definition_name().to_lowercase()
                );
                comments.push(format!("// WARNING: {message}"));
                self.warnings.push(GenerationWarning::new(
                    WarningCode::EmptyExclusion,
                    message,
                    Some(population.id.as_str()),
                ));
                NEUTRAL_LITERAL.to_string()
            }
            expr => expr.into_text(),
        };
        self.population(population_type, Some(population), comments, &body);
    }

    fn tree(&mut self, population: Option<&Population>) -> Expr {
        match population {
            Some(p) => self.expressions.clause(&p.criteria),
            None => Expr::Neutral,
        }
    }

    fn population(
        &mut self,
        population_type: PopulationType,
        population: Option<&Population>,
        mut comments: Vec<String>,
        body: &str,
    ) {
        let name = population_type.definition_name();
        let component_id = population
            .map(|p| p.id.trim())
            .filter(|id| !id.is_empty())
            .map(String::from)
            .unwrap_or_else(|| population_default_id(population_type));
        if let Some(narrative) = population
            .map(|p| single_line(&p.narrative))
            .filter(|n| !n.is_empty())
        {
            comments.insert(0, format!("// {narrative}"));
        }
        let marker = component_marker(OutputFormat::Cql, &component_id, name);
        self.define(Some(marker), comments, name, body);
        self.population_count += 1;
    }

    fn supplemental_data(&mut self) {
        for name in SUPPLEMENTAL_DATA_ELEMENTS {
            let body = format!("SDE.{}", quoted(name));
            self.define(None, Vec::new(), name, &body);
        }
    }
}

/// Component id used for a population the measure does not declare.
pub(crate) fn population_default_id(population_type: PopulationType) -> String {
    population_type
        .definition_name()
        .to_lowercase()
        .replace(' ', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn config() -> GenerationConfig {
        GenerationConfig {
            generated_at: Some(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()),
            ..GenerationConfig::default()
        }
    }

    fn measure(json: serde_json::Value) -> Measure {
        serde_json::from_value(json).unwrap()
    }

    fn screening_measure() -> Measure {
        measure(serde_json::json!({
            "id": "CMS999v1",
            "title": "Diabetes Eye Exam",
            "version": "1.2.000",
            "measurementPeriod": { "start": "2025-01-01", "end": "2025-12-31" },
            "globalConstraints": { "ageRange": { "min": 18, "max": 75 } },
            "populations": [
                {
                    "id": "pop-ip",
                    "type": "initial_population",
                    "narrative": "Adults with a visit",
                    "criteria": {
                        "operator": "AND",
                        "children": [{
                            "kind": "element",
                            "id": "el-visit",
                            "type": "encounter",
                            "description": "Office Visit",
                            "valueSet": { "id": "vs-office", "name": "Office Visit", "oid": "1.2.3" }
                        }]
                    }
                },
                { "id": "pop-denom", "type": "denominator" },
                {
                    "id": "pop-num",
                    "type": "numerator",
                    "criteria": {
                        "operator": "OR",
                        "children": [{
                            "kind": "element",
                            "id": "el-exam",
                            "type": "procedure",
                            "description": "Retinal Exam",
                            "valueSet": { "id": "vs-exam", "name": "Retinal Exam", "url": "http://example.org/vs/exam" }
                        }]
                    }
                }
            ],
            "valueSets": [
                { "id": "vs-office", "name": "Office Visit", "oid": "1.2.3",
                  "codes": [{ "code": "99213", "system": "CPT" }] }
            ]
        }))
    }

    fn generate(measure: &Measure) -> GenerationResult {
        let registry = BundleRegistry::standard();
        CqlGenerator::new(&registry).generate(measure, &config())
    }

    #[test]
    fn test_library_name_strips_and_prefixes() {
        assert_eq!(library_name("CMS130v12"), "CMS130v12");
        assert_eq!(library_name("130-v2.x"), "_130v2x");
        assert_eq!(library_name("--"), "UnnamedMeasure");
    }

    #[test]
    fn test_empty_measure_fails_with_all_errors() {
        let result = generate(&measure(serde_json::json!({ "id": "", "populations": [] })));
        assert!(!result.success);
        assert!(result.code.is_none());
        assert_eq!(
            result.errors,
            vec![
                "Measure ID is required".to_string(),
                "At least one population definition is required".to_string()
            ]
        );
    }

    #[test]
    fn test_preamble_and_metadata() {
        let result = generate(&screening_measure());
        assert!(result.success, "{:?}", result.errors);
        let code = result.code.unwrap();
        assert!(code.contains("library CMS999v1 version '1.2.000'"));
        assert!(code.contains("using QICore version '4.1.1'"));
        assert!(code.contains("// Generated: 2025-03-01T12:00:00Z"));
        assert!(code.contains(
            "valueset \"Office Visit\": 'http://cts.nlm.nih.gov/fhir/ValueSet/1.2.3'"
        ));
        assert!(code.contains("valueset \"Retinal Exam\": 'http://example.org/vs/exam'"));
        assert!(code.contains("default Interval[@2025-01-01T00:00:00.000, @2025-12-31T23:59:59.999]"));
        assert!(code.contains("context Patient"));

        match result.metadata.unwrap() {
            GenerationMetadata::Cql(meta) => {
                assert_eq!(meta.library_name, "CMS999v1");
                assert_eq!(meta.version, "1.2.000");
                assert_eq!(meta.population_count, 4);
                assert_eq!(meta.value_set_count, 2);
                // age helper, encounter helper, 4 populations, 4 supplemental
                assert_eq!(meta.definition_count, 10);
            }
            other => panic!("unexpected metadata {other:?}"),
        }
    }

    #[test]
    fn test_value_set_without_codes_warns_in_both_channels() {
        let result = generate(&screening_measure());
        let code = result.code.unwrap();
        assert!(code.contains("// WARNING: value set \"Retinal Exam\" has no codes"));
        assert!(result
            .warnings
            .iter()
            .any(|w| w.code == WarningCode::ValueSetWithoutCodes));
    }

    #[test]
    fn test_default_denominator_references_initial_population() {
        let code = generate(&screening_measure()).code.unwrap();
        assert!(code.contains(
            "// [component:pop-denom] Denominator\ndefine \"Denominator\":\n  \"Initial Population\"\n\n"
        ));
    }

    #[test]
    fn test_initial_population_ands_helpers_with_tree() {
        let code = generate(&screening_measure()).code.unwrap();
        assert!(code.contains(
            "// [component:pop-ip] Initial Population\n// Adults with a visit\ndefine \"Initial Population\":\n  \"Patient Age Valid\"\n    and exists ([Encounter: \"Office Visit\"]"
        ));
        assert!(code.contains("define \"Qualifying Encounters\":\n  [Encounter: \"Office Visit\"] ValidEncounter"));
    }

    #[test]
    fn test_denominator_exclusion_always_has_hospice() {
        let code = generate(&screening_measure()).code.unwrap();
        assert!(code.contains(
            "define \"Denominator Exclusion\":\n  Hospice.\"Has Hospice Services\"\n\n"
        ));
    }

    #[test]
    fn test_bundle_replaces_numerator_and_adds_exclusions() {
        let mut m = screening_measure();
        m.title = "Colorectal Cancer Screening".into();
        let result = generate(&m);
        let code = result.code.unwrap();
        assert!(code.contains("define \"Colonoscopy Performed\":"));
        assert!(code.contains("valueset \"Colonoscopy\":"));
        assert!(code.contains("    or exists \"Malignant Neoplasm\""));
        assert!(code.contains(
            "define \"Numerator\":\n  exists \"Colonoscopy Performed\" or exists \"Fecal Occult Blood Test Performed\""
        ));
        assert!(!code.contains("Retinal Exam\"] Proc"));
    }

    #[test]
    fn test_empty_numerator_emits_placeholder_and_warning() {
        let mut m = screening_measure();
        m.populations.retain(|p| p.population_type != PopulationType::Numerator);
        let result = generate(&m);
        let code = result.code.unwrap();
        assert!(code.contains("// WARNING: numerator has no criteria"));
        assert!(code.contains("define \"Numerator\":\n  true"));
        assert!(code.contains("// [component:numerator] Numerator"));
        assert!(result
            .warnings
            .iter()
            .any(|w| w.code == WarningCode::EmptyNumerator));
    }

    #[test]
    fn test_empty_exception_and_exclusion_are_flagged() {
        let mut m = screening_measure();
        m.populations.push(
            serde_json::from_value(serde_json::json!({ "id": "pop-dexcep", "type": "denominator_exception" }))
                .unwrap(),
        );
        m.populations.push(
            serde_json::from_value(serde_json::json!({ "id": "pop-numex", "type": "numerator_exclusion" }))
                .unwrap(),
        );
        let result = generate(&m);
        let code = result.code.unwrap();
        assert!(code.contains("// WARNING: denominator exception has no criteria"));
        assert!(code.contains("// WARNING: numerator exclusion has no criteria"));
        assert!(code.contains("define \"Numerator Exclusion\":\n  true"));
        let flagged: Vec<_> = result
            .warnings
            .iter()
            .filter(|w| w.code == WarningCode::EmptyExclusion)
            .filter_map(|w| w.component_id.as_deref())
            .collect();
        assert_eq!(flagged, vec!["pop-dexcep", "pop-numex"]);
    }

    #[test]
    fn test_value_set_without_name_is_reported_as_unnamed() {
        let mut m = screening_measure();
        m.value_sets.push(
            serde_json::from_value(serde_json::json!({ "id": "vs-anon", "name": " ", "oid": "9.9.9" }))
                .unwrap(),
        );
        let result = generate(&m);
        let code = result.code.unwrap();
        assert!(code.contains("// WARNING: value set \"vs-anon\" has no name and was not declared"));
        assert!(!code.contains("\"vs-anon\" has no URL or OID"));
        assert!(!code.contains("ValueSet/9.9.9"));
        let warning = result
            .warnings
            .iter()
            .find(|w| w.component_id.as_deref() == Some("vs-anon"))
            .unwrap();
        assert_eq!(warning.code, WarningCode::ValueSetWithoutName);
    }

    #[test]
    fn test_generation_is_deterministic_for_fixed_timestamp() {
        let m = screening_measure();
        assert_eq!(generate(&m).code, generate(&m).code);
    }

    #[test]
    fn test_supplemental_footer_is_last() {
        let code = generate(&screening_measure()).code.unwrap();
        assert!(code.trim_end().ends_with("define \"SDE Sex\":\n  SDE.\"SDE Sex\""));
    }

    #[test]
    fn test_default_measurement_period_is_generation_year() {
        let mut m = screening_measure();
        m.measurement_period = None;
        let code = generate(&m).code.unwrap();
        assert!(code.contains("@2025-01-01T00:00:00.000, @2025-12-31T23:59:59.999"));
    }
}
