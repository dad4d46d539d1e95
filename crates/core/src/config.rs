//! Generation and validation configuration.
//!
//! Configuration is resolved once by the caller (CLI flags, environment values read at process
//! startup, or an API request body) and passed by reference into every core call. Nothing in
//! the core reads environment variables itself.

use crate::constants::DEFAULT_ONTOLOGY_CONTEXTS;
use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use ums::{Measure, MeasurementPeriod};

/// The SQL dialects the tabular generator can target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    /// Microsoft SQL Server T-SQL.
    #[default]
    Tsql,
}

impl SqlDialect {
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Tsql => "T-SQL (SQL Server)",
        }
    }
}

impl FromStr for SqlDialect {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "tsql" | "t-sql" | "mssql" | "sqlserver" => Ok(Self::Tsql),
            other => Err(CoreError::UnsupportedDialect(other.to_string())),
        }
    }
}

/// Options recognised by both generators.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default)]
    pub dialect: SqlDialect,

    /// Literal population id, or `None` for the quoted placeholder.
    #[serde(default)]
    pub population_id: Option<String>,

    /// Overrides the measure's own measurement period.
    #[serde(default)]
    pub measurement_period: Option<MeasurementPeriod>,

    /// Terminology contexts joined into the demographics CTE; empty means the defaults.
    #[serde(default)]
    pub ontology_contexts: Vec<String>,

    /// Timestamp embedded in the output; `None` means "now".
    #[serde(default)]
    pub generated_at: Option<DateTime<Utc>>,
}

impl GenerationConfig {
    /// Ontology contexts to join, upper-cased, falling back to the defaults.
    pub fn effective_ontology_contexts(&self) -> Vec<String> {
        let configured: Vec<String> = self
            .ontology_contexts
            .iter()
            .map(|c| c.trim().to_uppercase())
            .filter(|c| !c.is_empty())
            .collect();
        if configured.is_empty() {
            DEFAULT_ONTOLOGY_CONTEXTS.iter().map(|c| c.to_string()).collect()
        } else {
            configured
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.generated_at.unwrap_or_else(Utc::now)
    }

    /// Measurement period to generate for: the configured override, else the measure's own,
    /// else the calendar year of the generation timestamp.
    pub fn measurement_period_for(&self, measure: &Measure) -> MeasurementPeriod {
        let today = self.timestamp().date_naive();
        self.measurement_period
            .or(measure.measurement_period)
            .or_else(|| MeasurementPeriod::calendar_year(today.year()))
            .unwrap_or(MeasurementPeriod {
                start: today,
                end: today,
            })
    }
}

/// Options recognised by the structural validators.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationConfig {
    #[serde(default)]
    pub dialect: SqlDialect,

    /// Expected population id; literals that differ from it are reported.
    #[serde(default)]
    pub population_id: Option<String>,
}

impl From<&GenerationConfig> for ValidationConfig {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            dialect: config.dialect,
            population_id: config.population_id.clone(),
        }
    }
}

/// Parse the SQL dialect from an optional string value.
///
/// If `value` is `None` or empty/whitespace, returns the default dialect.
pub fn dialect_from_env_value(value: Option<String>) -> CoreResult<SqlDialect> {
    let value = value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let parsed = value.map(|v| v.parse::<SqlDialect>()).transpose()?;

    Ok(parsed.unwrap_or_default())
}

/// Parse a comma-separated list of ontology contexts.
pub fn ontology_contexts_from_env_value(value: Option<String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(|c| c.trim().to_uppercase())
                .filter(|c| !c.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Normalise an optional population id; blank values mean "use the placeholder".
pub fn population_id_from_env_value(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_from_env_value_defaults_when_blank() {
        assert_eq!(dialect_from_env_value(None).unwrap(), SqlDialect::Tsql);
        assert_eq!(
            dialect_from_env_value(Some("  ".into())).unwrap(),
            SqlDialect::Tsql
        );
    }

    #[test]
    fn test_dialect_from_env_value_rejects_other_dialects() {
        let err = dialect_from_env_value(Some("postgres".into())).unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedDialect(d) if d == "postgres"));
    }

    #[test]
    fn test_ontology_contexts_from_env_value_splits_and_uppercases() {
        assert_eq!(
            ontology_contexts_from_env_value(Some("gender, race,,payer ".into())),
            vec!["GENDER", "RACE", "PAYER"]
        );
    }

    #[test]
    fn test_measurement_period_for_prefers_config_then_measure() {
        let measure: Measure = serde_json::from_str(
            r#"{"id":"M","measurementPeriod":{"start":"2024-01-01","end":"2024-12-31"}}"#,
        )
        .unwrap();
        let mut config = GenerationConfig {
            generated_at: Some("2026-06-01T00:00:00Z".parse().unwrap()),
            ..GenerationConfig::default()
        };
        assert_eq!(
            config.measurement_period_for(&measure),
            MeasurementPeriod::calendar_year(2024).unwrap()
        );

        config.measurement_period = MeasurementPeriod::calendar_year(2023);
        assert_eq!(
            config.measurement_period_for(&measure),
            MeasurementPeriod::calendar_year(2023).unwrap()
        );

        config.measurement_period = None;
        let bare: Measure = serde_json::from_str(r#"{"id":"M"}"#).unwrap();
        assert_eq!(
            config.measurement_period_for(&bare),
            MeasurementPeriod::calendar_year(2026).unwrap()
        );
    }

    #[test]
    fn test_effective_ontology_contexts_falls_back_to_defaults() {
        let config = GenerationConfig::default();
        assert_eq!(
            config.effective_ontology_contexts(),
            vec!["GENDER", "RACE", "ETHNICITY"]
        );
    }
}
