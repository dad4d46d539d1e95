use super::condition::{age_condition, ConditionBuilder};
use super::predicate::{cast_date, sql_literal, upper_snake, PredicatePlanner, PredicateSource};
use crate::config::GenerationConfig;
use crate::constants::{
    BATCH_SEPARATOR, DEMOGRAPHICS_CTE, GENERATED_PREFIX, ONTOLOGY_CTE, PERSON_EXCLUSION_TABLE,
    POPULATION_ID_PLACEHOLDER,
};
use crate::cql::{library_name, population_default_id};
use crate::format::OutputFormat;
use crate::generation::{
    check_preconditions, component_marker, single_line, Complexity, GenerationMetadata,
    GenerationResult, GenerationWarning, SqlMetadata, WarningCode,
};
use chrono::SecondsFormat;
use std::collections::HashSet;
use ums::{Measure, Population, PopulationType, QuantityRequirement};

const FLAGS_ALIAS: &str = "pf";

/// Emits a CTE-based T-SQL script for a measure.
///
/// This is a zero-sized type used for namespacing.
#[derive(Clone, Copy, Debug, Default)]
pub struct SqlGenerator;

impl SqlGenerator {
    /// Generates the predicate-flags view, one view per population and the final results view.
    ///
    /// # Arguments
    ///
    /// * `measure` - The measure to translate; it must have an id and at least one population.
    /// * `config` - Dialect, population id, measurement period override and ontology contexts.
    ///
    /// # Returns
    ///
    /// A [`GenerationResult`]; precondition failures come back with `success == false` and no code.
    pub fn generate(measure: &Measure, config: &GenerationConfig) -> GenerationResult {
        let errors = check_preconditions(measure);
        if !errors.is_empty() {
            tracing::info!(measure_id = %measure.id, ?errors, "sql generation rejected");
            return GenerationResult::failed(OutputFormat::Sql, errors);
        }

        let script = ScriptWriter::new(measure, config);
        let (code, warnings, metadata) = script.write();

        tracing::info!(
            measure_id = %measure.id,
            predicates = metadata.predicate_count,
            complexity = ?metadata.estimated_complexity,
            warnings = warnings.len(),
            "generated sql script"
        );
        GenerationResult::succeeded(
            OutputFormat::Sql,
            code,
            warnings,
            GenerationMetadata::Sql(metadata),
        )
    }
}

/// Population id as a quoted SQL literal, defaulting to the quoted placeholder.
pub(crate) fn population_literal(config: &GenerationConfig) -> String {
    sql_literal(
        config
            .population_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(POPULATION_ID_PLACEHOLDER),
    )
}

/// Identifier fragment for an ontology context, e.g. `PRIMARY LANGUAGE` to `primary_language`.
///
/// The raw context name is only ever written inside a string literal.
pub(crate) fn context_role(context: &str) -> String {
    upper_snake(context).to_lowercase()
}

/// Keeps the first context of each role so join aliases stay unique.
fn distinct_roles(contexts: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    contexts
        .into_iter()
        .filter(|context| seen.insert(context_role(context)))
        .collect()
}

struct ScriptWriter<'a> {
    measure: &'a Measure,
    config: &'a GenerationConfig,
    lib: String,
    population: String,
    contexts: Vec<String>,
    blocks: Vec<String>,
}

impl<'a> ScriptWriter<'a> {
    fn new(measure: &'a Measure, config: &'a GenerationConfig) -> Self {
        Self {
            measure,
            config,
            lib: library_name(&measure.id),
            population: population_literal(config),
            contexts: distinct_roles(config.effective_ontology_contexts()),
            blocks: Vec::new(),
        }
    }

    fn view_name(&self, suffix: &str) -> String {
        format!("dbo.{}_{suffix}", self.lib)
    }

    fn write(mut self) -> (String, Vec<GenerationWarning>, SqlMetadata) {
        let measure = self.measure;
        let period = self.config.measurement_period_for(measure);
        let planner = PredicatePlanner::new(measure, period, self.population.clone()).plan();
        let contexts = self.contexts.clone();
        let mut conditions = ConditionBuilder::new(&planner, &contexts);

        self.header(&period.to_string());
        self.predicate_flags(&planner, period.end);

        let mut views = Vec::new();
        let ip = measure.population(PopulationType::InitialPopulation);
        let mut ip_filters = Vec::new();
        if let Some(age) = measure
            .global_constraints
            .age_range
            .as_ref()
            .and_then(|range| age_condition(&format!("{FLAGS_ALIAS}.age_at_period_end"), range))
        {
            ip_filters.push(age);
        }
        if let Some(gender) = measure.global_constraints.gender {
            let component_id = ip.map(|p| p.id.as_str());
            ip_filters.extend(conditions.gender(gender, "global gender constraint", component_id));
        }
        ip_filters.extend(ip.and_then(|p| conditions.clause(&p.criteria)).map(|c| format!("({c})")));
        views.push(self.population_view(
            PopulationType::InitialPopulation,
            ip,
            None,
            ip_filters,
            "1 = 1",
            Vec::new(),
        ));

        let chain = [
            (PopulationType::Denominator, PopulationType::InitialPopulation, true, "1 = 1"),
            (PopulationType::DenominatorExclusion, PopulationType::Denominator, true, "1 = 0"),
            (PopulationType::DenominatorException, PopulationType::Denominator, false, "1 = 0"),
            (PopulationType::Numerator, PopulationType::Denominator, true, "1 = 1"),
            (PopulationType::NumeratorExclusion, PopulationType::Numerator, false, "1 = 0"),
        ];
        let mut emitted = vec![PopulationType::InitialPopulation];
        let mut extra_warnings = Vec::new();
        for (population_type, parent, always, neutral) in chain {
            let population = measure.population(population_type);
            if population.is_none() && !always {
                continue;
            }
            let filters: Vec<String> = population
                .and_then(|p| conditions.clause(&p.criteria))
                .into_iter()
                .collect();
            let mut comments = Vec::new();
            if population_type == PopulationType::Numerator && filters.is_empty() {
                let message = "numerator has no criteria; every denominator member is counted";
                comments.push(format!("-- WARNING: {message}"));
                extra_warnings.push(GenerationWarning::new(
                    WarningCode::EmptyNumerator,
                    message,
                    population.map(|p| p.id.as_str()),
                ));
            }
            views.push(self.population_view(
                population_type,
                population,
                Some(parent),
                filters,
                neutral,
                comments,
            ));
            emitted.push(population_type);
        }
        self.blocks.extend(views);
        self.final_results(&emitted);

        let mut warnings = planner.warnings.clone();
        warnings.extend(conditions.warnings);
        warnings.extend(extra_warnings);

        let mut data_models = vec!["dbo.ONTOLOGY".to_string(), "dbo.PERSON".to_string()];
        for predicate in &planner.predicates {
            if !data_models.iter().any(|t| t == predicate.table) {
                data_models.push(predicate.table.to_string());
            }
        }
        let depth = measure
            .populations
            .iter()
            .map(|p| p.criteria.depth())
            .max()
            .unwrap_or(0);
        let metadata = SqlMetadata {
            predicate_count: planner.predicates.len(),
            data_models_used: data_models,
            estimated_complexity: Complexity::estimate(planner.predicates.len(), depth),
        };

        let mut code = self.blocks.join("\n\n");
        code.push('\n');
        (code, warnings, metadata)
    }

    // ========================================================================
    // Header
    // ========================================================================

    fn header(&mut self, period: &str) {
        let rule = format!("-- {}", "=".repeat(76));
        let title = match self.measure.title.trim() {
            "" => self.measure.id.clone(),
            title => format!("{} ({})", single_line(title), self.measure.id),
        };
        let timestamp = self
            .config
            .timestamp()
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        self.blocks.push(
            [
                rule.clone(),
                format!("-- {title}"),
                format!("-- {GENERATED_PREFIX}{timestamp}"),
                format!("-- Dialect: {}", self.config.dialect.display_name()),
                format!("-- Population: {}", self.population),
                format!("-- Measurement period: {period}"),
                rule,
            ]
            .join("\n"),
        );
    }

    // ========================================================================
    // Predicate flags view: ONT, DEMOG, PRED_* and the person-level projection
    // ========================================================================

    fn predicate_flags(&mut self, planner: &PredicatePlanner<'_>, period_end: chrono::NaiveDate) {
        let view = self.view_name("PredicateFlags");
        let pop = &self.population;

        let ontology = [
            format!("CREATE OR ALTER VIEW {view} AS"),
            format!("WITH {ONTOLOGY_CTE} AS ("),
            "    SELECT".to_string(),
            "        o.concept_id,".to_string(),
            "        o.concept_code,".to_string(),
            "        o.concept_name,".to_string(),
            "        o.context_name,".to_string(),
            "        o.value_set_oid".to_string(),
            "    FROM dbo.ONTOLOGY o".to_string(),
            format!("    WHERE o.population_id = {pop}"),
            "),".to_string(),
        ]
        .join("\n");
        self.blocks.push(ontology);

        let mut demog = vec![
            format!("{DEMOGRAPHICS_CTE} AS ("),
            "    SELECT".to_string(),
            "        p.person_id,".to_string(),
            "        p.population_id,".to_string(),
        ];
        let mut columns = vec!["        p.birth_date".to_string()];
        let mut joins = Vec::new();
        for context in &self.contexts {
            let role = context_role(context);
            columns.push(format!(
                "        ont_{role}.concept_name AS {role}_concept_name"
            ));
            joins.push(format!(
                "    LEFT JOIN {ONTOLOGY_CTE} ont_{role}\n        ON ont_{role}.concept_id = p.{role}_concept_id\n        AND ont_{role}.context_name = {}",
                sql_literal(context)
            ));
        }
        demog.push(columns.join(",\n"));
        demog.push("    FROM dbo.PERSON p".to_string());
        demog.extend(joins);
        demog.push(format!("    WHERE p.population_id = {pop}"));
        demog.push(format!(
            "      AND NOT EXISTS (\n          SELECT 1 FROM {PERSON_EXCLUSION_TABLE} ex\n          WHERE ex.person_id = p.person_id\n            AND ex.population_id = p.population_id\n      )"
        ));
        let closing = if planner.predicates.is_empty() { ")" } else { ")," };
        demog.push(closing.to_string());
        self.blocks.push(demog.join("\n"));

        let count = planner.predicates.len();
        for (index, predicate) in planner.predicates.iter().enumerate() {
            let mut text = predicate.text.clone();
            if index + 1 < count {
                text.push(',');
            }
            self.blocks.push(text);
        }

        let mut projection = Vec::new();
        for (element_id, source) in &planner.sources {
            if *source == PredicateSource::Unresolved {
                projection.push(format!(
                    "-- WARNING: element {element_id} has no resolvable value set; treated as always true"
                ));
            }
        }
        projection.push("SELECT".to_string());
        let mut select = vec![
            "    d.person_id".to_string(),
            "    d.population_id".to_string(),
            format!(
                "    DATEDIFF(year, d.birth_date, {}) AS age_at_period_end",
                cast_date(period_end)
            ),
        ];
        for context in &self.contexts {
            let role = context_role(context);
            select.push(format!("    d.{role}_concept_name"));
        }
        for predicate in &planner.predicates {
            let rows = format!(
                "SELECT {{}} FROM {} x WHERE x.person_id = d.person_id",
                predicate.cte_name
            );
            let test = match predicate.quantity {
                None => format!("EXISTS ({})", rows.replace("{}", "1")),
                Some(QuantityRequirement::Compare { comparator, value }) => format!(
                    "({}) {} {value}",
                    rows.replace("{}", "COUNT(*)"),
                    comparator.symbol()
                ),
                Some(QuantityRequirement::Range { min, max }) => format!(
                    "({}) BETWEEN {min} AND {max}",
                    rows.replace("{}", "COUNT(*)")
                ),
            };
            select.push(format!(
                "    CASE WHEN {test} THEN 1 ELSE 0 END AS {}",
                predicate.flag_column
            ));
        }
        projection.push(select.join(",\n"));
        projection.push(format!("FROM {DEMOGRAPHICS_CTE} d;"));
        projection.push(BATCH_SEPARATOR.to_string());
        self.blocks.push(projection.join("\n"));
    }

    // ========================================================================
    // Population views
    // ========================================================================

    fn population_view(
        &self,
        population_type: PopulationType,
        population: Option<&Population>,
        parent: Option<PopulationType>,
        filters: Vec<String>,
        neutral: &str,
        comments: Vec<String>,
    ) -> String {
        let component_id = population
            .map(|p| p.id.trim())
            .filter(|id| !id.is_empty())
            .map(String::from)
            .unwrap_or_else(|| population_default_id(population_type));
        let mut lines = vec![component_marker(
            OutputFormat::Sql,
            &component_id,
            population_type.definition_name(),
        )];
        if let Some(narrative) = population
            .map(|p| single_line(&p.narrative))
            .filter(|n| !n.is_empty())
        {
            lines.push(format!("-- {narrative}"));
        }
        lines.extend(comments);
        lines.push(format!(
            "CREATE OR ALTER VIEW {} AS",
            self.view_name(population_type.pascal_name())
        ));
        lines.push(format!(
            "SELECT {FLAGS_ALIAS}.person_id, {FLAGS_ALIAS}.population_id"
        ));
        match parent {
            None => lines.push(format!(
                "FROM {} {FLAGS_ALIAS}",
                self.view_name("PredicateFlags")
            )),
            Some(parent) => {
                lines.push(format!("FROM {} base", self.view_name(parent.pascal_name())));
                lines.push(format!(
                    "INNER JOIN {} {FLAGS_ALIAS} ON {FLAGS_ALIAS}.person_id = base.person_id",
                    self.view_name("PredicateFlags")
                ));
            }
        }
        let condition = if filters.is_empty() {
            neutral.to_string()
        } else {
            filters.join("\n  AND ")
        };
        lines.push(format!("WHERE {condition};"));
        lines.push(BATCH_SEPARATOR.to_string());
        lines.join("\n")
    }

    fn final_results(&mut self, emitted: &[PopulationType]) {
        let has = |t: PopulationType| emitted.contains(&t);
        let mut lines = vec![
            component_marker(OutputFormat::Sql, "final_results", "Final Results"),
            format!("CREATE OR ALTER VIEW {} AS", self.view_name("FinalResults")),
            "SELECT".to_string(),
            "    dn.person_id,".to_string(),
            "    dn.population_id,".to_string(),
            "    CASE".to_string(),
            "        WHEN dx.person_id IS NOT NULL THEN 'EXCLUDED'".to_string(),
        ];
        let numerator_met = if has(PopulationType::NumeratorExclusion) {
            "nm.person_id IS NOT NULL AND nx.person_id IS NULL"
        } else {
            "nm.person_id IS NOT NULL"
        };
        lines.push(format!("        WHEN {numerator_met} THEN 'PERFORMANCE_MET'"));
        if has(PopulationType::DenominatorException) {
            lines.push("        WHEN de.person_id IS NOT NULL THEN 'EXCLUDED'".to_string());
        }
        lines.push("        ELSE 'PERFORMANCE_NOT_MET'".to_string());
        lines.push("    END AS measure_status".to_string());
        lines.push(format!(
            "FROM {} dn",
            self.view_name(PopulationType::Denominator.pascal_name())
        ));
        let joins = [
            (PopulationType::DenominatorExclusion, "dx"),
            (PopulationType::DenominatorException, "de"),
            (PopulationType::Numerator, "nm"),
            (PopulationType::NumeratorExclusion, "nx"),
        ];
        for (population_type, alias) in joins {
            if has(population_type) {
                lines.push(format!(
                    "LEFT JOIN {} {alias} ON {alias}.person_id = dn.person_id",
                    self.view_name(population_type.pascal_name())
                ));
            }
        }
        if let Some(last) = lines.last_mut() {
            last.push(';');
        }
        lines.push(BATCH_SEPARATOR.to_string());
        self.blocks.push(lines.join("\n"));
    }
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

    fn measure() -> Measure {
        serde_json::from_value(serde_json::json!({
            "id": "CMS130v12",
            "title": "Colorectal Cancer Screening",
            "measurementPeriod": { "start": "2025-01-01", "end": "2025-12-31" },
            "globalConstraints": { "ageRange": { "min": 45, "max": 75 } },
            "populations": [
                { "id": "pop-ip", "type": "initial_population", "criteria": { "children": [
                    { "kind": "element", "id": "el-visit", "type": "encounter", "description": "Office Visit",
                      "valueSet": { "id": "vs-office", "name": "Office Visit", "oid": "1.2.3" },
                      "quantity": { "type": "compare", "comparator": ">=", "value": 2 } }
                ]}},
                { "id": "pop-denom", "type": "denominator" },
                { "id": "pop-excl", "type": "denominator_exclusion", "criteria": { "children": [
                    { "kind": "element", "id": "el-cancer", "type": "diagnosis", "description": "Colon Cancer",
                      "valueSet": { "id": "vs-cancer", "name": "Malignant Neoplasm of Colon", "oid": "1.2.4" } }
                ]}},
                { "id": "pop-num", "type": "numerator", "criteria": { "operator": "OR", "children": [
                    { "kind": "element", "id": "el-colo", "type": "procedure", "description": "Colonoscopy",
                      "valueSet": { "id": "vs-colo", "name": "Colonoscopy", "oid": "1.2.5" },
                      "timing": { "type": "withinBeforeEnd", "value": 10, "unit": "years" } },
                    { "kind": "element", "id": "el-fobt", "type": "observation", "description": "FOBT",
                      "valueSet": { "id": "vs-fobt", "name": "FOBT", "oid": "1.2.6" } }
                ]}}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_script_layout_order() {
        let result = SqlGenerator::generate(&measure(), &config());
        assert!(result.success);
        let code = result.code.unwrap();
        let order = [
            "-- Generated: 2025-03-01T12:00:00Z",
            "CREATE OR ALTER VIEW dbo.CMS130v12_PredicateFlags AS",
            "WITH ONT AS (",
            "DEMOG AS (",
            "PRED_OFFICE_VISIT AS (",
            "PRED_COLON_CANCER AS (",
            "PRED_COLONOSCOPY AS (",
            "PRED_FOBT AS (",
            "FROM DEMOG d;",
            "CREATE OR ALTER VIEW dbo.CMS130v12_InitialPopulation AS",
            "CREATE OR ALTER VIEW dbo.CMS130v12_Denominator AS",
            "CREATE OR ALTER VIEW dbo.CMS130v12_DenominatorExclusions AS",
            "CREATE OR ALTER VIEW dbo.CMS130v12_Numerator AS",
            "CREATE OR ALTER VIEW dbo.CMS130v12_FinalResults AS",
        ];
        let mut cursor = 0;
        for needle in order {
            let found = code[cursor..]
                .find(needle)
                .unwrap_or_else(|| panic!("missing or out of order: {needle}"));
            cursor += found + needle.len();
        }
        assert!(!code.contains("DenominatorExceptions"));
        assert!(!code.contains("NumeratorExclusions"));
    }

    #[test]
    fn test_demographics_joins_ontology_contexts() {
        let code = SqlGenerator::generate(&measure(), &config()).code.unwrap();
        assert!(code.contains("LEFT JOIN ONT ont_gender"));
        assert!(code.contains("ont_race.concept_name AS race_concept_name"));
        assert!(code.contains("ont_ethnicity.context_name = 'ETHNICITY'"));
    }

    #[test]
    fn test_context_names_become_identifier_safe_roles() {
        let configured = GenerationConfig {
            ontology_contexts: vec!["PRIMARY LANGUAGE".into()],
            ..config()
        };
        let code = SqlGenerator::generate(&measure(), &configured).code.unwrap();
        assert!(code.contains("LEFT JOIN ONT ont_primary_language\n"));
        assert!(code.contains("ont_primary_language.concept_name AS primary_language_concept_name"));
        assert!(code.contains("ont_primary_language.concept_id = p.primary_language_concept_id"));
        assert!(code.contains("ont_primary_language.context_name = 'PRIMARY LANGUAGE'"));
        assert!(code.contains("    d.primary_language_concept_name"));
        assert!(!code.contains("primary language_"));

        let colliding = GenerationConfig {
            ontology_contexts: vec!["PRIMARY LANGUAGE".into(), "primary_language".into()],
            ..config()
        };
        let code = SqlGenerator::generate(&measure(), &colliding).code.unwrap();
        assert_eq!(code.matches("LEFT JOIN ONT ont_primary_language\n").count(), 1);
    }

    #[test]
    fn test_global_gender_requires_gender_context() {
        let mut m = measure();
        m.global_constraints.gender = Some(ums::Gender::Female);

        let code = SqlGenerator::generate(&m, &config()).code.unwrap();
        assert!(code.contains("pf.gender_concept_name = 'Female'"));

        let race_only = GenerationConfig {
            ontology_contexts: vec!["RACE".into()],
            ..config()
        };
        let result = SqlGenerator::generate(&m, &race_only);
        let code = result.code.unwrap();
        assert!(!code.contains("gender_concept_name"), "{code}");
        let warning = result
            .warnings
            .iter()
            .find(|w| w.code == WarningCode::MissingOntologyContext)
            .expect("missing context warning");
        assert_eq!(warning.component_id.as_deref(), Some("pop-ip"));
    }

    #[test]
    fn test_population_id_placeholder_and_literal() {
        let code = SqlGenerator::generate(&measure(), &config()).code.unwrap();
        assert!(code.contains("o.population_id = '{{population_id}}'"));

        let configured = GenerationConfig {
            population_id: Some("POP-42".into()),
            ..config()
        };
        let code = SqlGenerator::generate(&measure(), &configured).code.unwrap();
        assert!(code.contains("src.population_id = 'POP-42'"));
        assert!(!code.contains("{{population_id}}"));
    }

    #[test]
    fn test_flags_and_population_conditions() {
        let code = SqlGenerator::generate(&measure(), &config()).code.unwrap();
        assert!(code.contains(
            "CASE WHEN (SELECT COUNT(*) FROM PRED_OFFICE_VISIT x WHERE x.person_id = d.person_id) >= 2 THEN 1 ELSE 0 END AS has_office_visit"
        ));
        assert!(code.contains("WHERE pf.age_at_period_end BETWEEN 45 AND 75\n  AND (pf.has_office_visit = 1);"));
        assert!(code.contains("WHERE pf.has_colonoscopy = 1 OR pf.has_fobt = 1;"));
        assert!(code.contains("WHEN nm.person_id IS NOT NULL THEN 'PERFORMANCE_MET'"));
        assert!(code.contains("'PERFORMANCE_NOT_MET'"));
    }

    #[test]
    fn test_only_dialect_date_functions() {
        let code = SqlGenerator::generate(&measure(), &config()).code.unwrap();
        assert!(code.contains("DATEADD(year, -10, CAST('2025-12-31' AS DATE))"));
        for forbidden in ["GETDATE", "CURRENT_DATE", "DATE_ADD", "INTERVAL '"] {
            assert!(!code.contains(forbidden), "{forbidden}");
        }
    }

    #[test]
    fn test_metadata() {
        let result = SqlGenerator::generate(&measure(), &config());
        match result.metadata.unwrap() {
            GenerationMetadata::Sql(meta) => {
                assert_eq!(meta.predicate_count, 4);
                assert_eq!(
                    meta.data_models_used,
                    vec![
                        "dbo.ONTOLOGY",
                        "dbo.PERSON",
                        "dbo.ENCOUNTER",
                        "dbo.CONDITION",
                        "dbo.PROCEDURE_EVENT",
                        "dbo.RESULT"
                    ]
                );
                assert_eq!(meta.estimated_complexity, Complexity::Low);
            }
            other => panic!("unexpected metadata {other:?}"),
        }
    }

    #[test]
    fn test_empty_measure_fails() {
        let m: Measure = serde_json::from_str(r#"{"id":"","populations":[]}"#).unwrap();
        let result = SqlGenerator::generate(&m, &config());
        assert!(!result.success);
        assert_eq!(result.errors.len(), 2);
    }
}
