//! Request and response messages of the UMS APIs.
//!
//! Core types (measures, generation results, validation results, diffs, override records) are
//! carried as-is on the wire; their OpenAPI schemas are declared as free-form objects.

use serde::{Deserialize, Serialize};
use ums::Measure;
use ums_core::diff::MeasureDiff;
use ums_core::validation::DetailedValidation;
use ums_core::{
    ChangeType, CodeOverride, EditNote, GenerationConfig, GenerationResult, OutputFormat,
    OverrideRequest, ValidationConfig, ValidationResult,
};
use utoipa::{IntoParams, ToSchema};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HealthRes {
    pub ok: bool,
    pub message: String,
}

// ============================================================================
// Generation and validation
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerateReq {
    #[schema(value_type = String, example = "cql")]
    pub format: OutputFormat,
    #[schema(value_type = Object)]
    pub measure: Measure,
    /// Falls back to the server's configured defaults when omitted.
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub config: Option<GenerationConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct GenerateRes {
    #[schema(value_type = Object)]
    pub result: GenerationResult,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValidateReq {
    #[schema(value_type = String, example = "sql")]
    pub format: OutputFormat,
    pub code: String,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub config: Option<ValidationConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ValidateRes {
    #[schema(value_type = Object)]
    pub result: ValidationResult,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct DetailedValidateRes {
    #[schema(value_type = Object)]
    pub detail: DetailedValidation,
}

// ============================================================================
// Diff
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiffReq {
    #[schema(value_type = Object)]
    pub old_measure: Measure,
    #[schema(value_type = Object)]
    pub new_measure: Measure,
    /// Also diff the generated clinical-query text of both versions.
    #[serde(default)]
    pub include_code: bool,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub config: Option<GenerationConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct DiffRes {
    #[schema(value_type = Object)]
    pub diff: MeasureDiff,
}

// ============================================================================
// Overrides
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SaveOverrideReq {
    pub measure_id: String,
    pub component_id: String,
    #[schema(value_type = String, example = "cql")]
    pub format: OutputFormat,
    pub code: String,
    /// Reason for the edit, at least 10 characters.
    pub note: String,
    #[serde(default)]
    #[schema(value_type = Option<String>, example = "logic_fix")]
    pub change_type: Option<ChangeType>,
    #[serde(default)]
    pub original_code: Option<String>,
}

impl From<SaveOverrideReq> for OverrideRequest {
    fn from(req: SaveOverrideReq) -> Self {
        Self {
            measure_id: req.measure_id,
            component_id: req.component_id,
            format: req.format,
            code: req.code,
            note: req.note,
            change_type: req.change_type,
            original_code: req.original_code,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct SaveOverrideRes {
    #[serde(rename = "override")]
    #[schema(value_type = Object)]
    pub record: CodeOverride,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RevertOverrideReq {
    pub measure_id: String,
    pub component_id: String,
    #[schema(value_type = String, example = "sql")]
    pub format: OutputFormat,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct RevertOverrideRes {
    /// False when no override existed for the key.
    pub reverted: bool,
}

/// Optional format filter for override listings.
#[derive(Clone, Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListOverridesQuery {
    #[param(value_type = Option<String>, example = "sql")]
    pub format: Option<OutputFormat>,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ListOverridesRes {
    #[schema(value_type = Vec<Object>)]
    pub overrides: Vec<CodeOverride>,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ListNotesRes {
    /// Newest first.
    #[schema(value_type = Vec<Object>)]
    pub notes: Vec<EditNote>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_save_override_req_converts_to_core_request() {
        let req: SaveOverrideReq = serde_json::from_value(json!({
            "measureId": "M1",
            "componentId": "num",
            "format": "sql",
            "code": "SELECT 1",
            "note": "Tightened the numerator join",
            "changeType": "logic_fix"
        }))
        .unwrap();

        let request = OverrideRequest::from(req);
        assert_eq!(request.format, OutputFormat::Sql);
        assert_eq!(request.change_type, Some(ChangeType::LogicFix));
        assert!(request.original_code.is_none());
    }

    #[test]
    fn test_generate_req_config_is_optional() {
        let req: GenerateReq = serde_json::from_value(json!({
            "format": "cql",
            "measure": { "id": "M1", "title": "Test", "populations": [] }
        }))
        .unwrap();
        assert!(req.config.is_none());
        assert_eq!(req.measure.id, "M1");
    }
}
