//! # API REST
//!
//! REST API implementation for UMS.
//!
//! Handles:
//! - HTTP endpoints with axum
//! - OpenAPI/Swagger documentation
//! - REST-specific concerns (JSON serialization, CORS)
//!
//! Uses `api-shared` for request/response messages and `ums-core` for all measure logic.

#![warn(rust_2018_idioms)]

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use api_shared::{
    DetailedValidateRes, DiffReq, DiffRes, GenerateReq, GenerateRes, HealthRes, HealthService,
    ListNotesRes, ListOverridesQuery, ListOverridesRes, RevertOverrideReq, RevertOverrideRes,
    SaveOverrideReq, SaveOverrideRes, ValidateReq, ValidateRes,
};
use ums_core::config::{
    dialect_from_env_value, ontology_contexts_from_env_value, population_id_from_env_value,
};
use ums_core::{CoreError, CoreResult, GenerationConfig, MeasureService, ValidationConfig};

/// Application state for the REST API server
///
/// Holds the measure service (and through it the shared override store) plus the generation
/// defaults resolved at startup. Requests that carry their own config use it instead.
#[derive(Clone)]
pub struct AppState {
    service: MeasureService,
    defaults: Arc<GenerationConfig>,
}

impl AppState {
    pub fn new(service: MeasureService, defaults: GenerationConfig) -> Self {
        Self {
            service,
            defaults: Arc::new(defaults),
        }
    }
}

/// Resolve the generation defaults from the process environment.
///
/// # Environment Variables
/// - `UMS_SQL_DIALECT`: SQL dialect (default: `tsql`)
/// - `UMS_POPULATION_ID`: literal population id (default: the quoted placeholder)
/// - `UMS_ONTOLOGY_CONTEXTS`: comma-separated terminology contexts (default: GENDER, RACE, ETHNICITY)
///
/// # Errors
/// Returns [`CoreError::UnsupportedDialect`] if `UMS_SQL_DIALECT` names an unknown dialect.
pub fn defaults_from_env() -> CoreResult<GenerationConfig> {
    Ok(GenerationConfig {
        dialect: dialect_from_env_value(std::env::var("UMS_SQL_DIALECT").ok())?,
        population_id: population_id_from_env_value(std::env::var("UMS_POPULATION_ID").ok()),
        ontology_contexts: ontology_contexts_from_env_value(
            std::env::var("UMS_ONTOLOGY_CONTEXTS").ok(),
        ),
        ..GenerationConfig::default()
    })
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        generate,
        validate,
        validate_detailed,
        diff,
        save_override,
        revert_override,
        list_overrides,
        list_notes,
    ),
    components(schemas(
        HealthRes,
        GenerateReq,
        GenerateRes,
        ValidateReq,
        ValidateRes,
        DetailedValidateRes,
        DiffReq,
        DiffRes,
        SaveOverrideReq,
        SaveOverrideRes,
        RevertOverrideReq,
        RevertOverrideRes,
        ListOverridesRes,
        ListNotesRes,
    ))
)]
pub struct ApiDoc;

/// Builds the REST router with Swagger UI and permissive CORS.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/generate", post(generate))
        .route("/validate", post(validate))
        .route("/validate/detailed", post(validate_detailed))
        .route("/diff", post(diff))
        .route("/overrides", post(save_override))
        .route("/overrides/revert", post(revert_override))
        .route("/overrides/:measure_id", get(list_overrides))
        .route(
            "/overrides/:measure_id/notes/:component_id",
            get(list_notes),
        )
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health check response", body = HealthRes)
    )
)]
/// Health check endpoint for the REST API
///
/// # Returns
/// * `Json<HealthRes>` - Health status response containing service status
async fn health() -> Json<HealthRes> {
    Json(HealthService::check_health())
}

#[utoipa::path(
    post,
    path = "/generate",
    request_body = GenerateReq,
    responses(
        (status = 200, description = "Generation result; check `success` for precondition failures", body = GenerateRes)
    )
)]
/// Generate clinical-query or SQL code for a measure
///
/// Locked manual overrides stored for the measure and format are re-applied to the output.
/// A measure that fails its preconditions still returns `200` with `success = false` and the
/// collected errors.
#[axum::debug_handler]
async fn generate(State(state): State<AppState>, Json(req): Json<GenerateReq>) -> Json<GenerateRes> {
    let config = req.config.unwrap_or_else(|| (*state.defaults).clone());
    let result = state.service.generate(req.format, &req.measure, &config);
    if !result.success {
        tracing::warn!(measure_id = %req.measure.id, errors = ?result.errors, "generation failed");
    }
    Json(GenerateRes { result })
}

#[utoipa::path(
    post,
    path = "/validate",
    request_body = ValidateReq,
    responses(
        (status = 200, description = "Validation result with compliance score", body = ValidateRes)
    )
)]
#[axum::debug_handler]
async fn validate(State(state): State<AppState>, Json(req): Json<ValidateReq>) -> Json<ValidateRes> {
    let config = req
        .config
        .unwrap_or_else(|| ValidationConfig::from(state.defaults.as_ref()));
    Json(ValidateRes {
        result: state.service.validate(req.format, &req.code, &config),
    })
}

#[utoipa::path(
    post,
    path = "/validate/detailed",
    request_body = ValidateReq,
    responses(
        (status = 200, description = "Validation result plus CTE dependency graph and details", body = DetailedValidateRes)
    )
)]
/// Validate code and return the CTE dependency graph, columns, joins and filters
///
/// Clinical-query input returns the plain validation result with an empty graph.
#[axum::debug_handler]
async fn validate_detailed(
    State(state): State<AppState>,
    Json(req): Json<ValidateReq>,
) -> Json<DetailedValidateRes> {
    let config = req
        .config
        .unwrap_or_else(|| ValidationConfig::from(state.defaults.as_ref()));
    Json(DetailedValidateRes {
        detail: state.service.validate_detailed(req.format, &req.code, &config),
    })
}

#[utoipa::path(
    post,
    path = "/diff",
    request_body = DiffReq,
    responses(
        (status = 200, description = "Structural diff between two measure versions", body = DiffRes)
    )
)]
#[axum::debug_handler]
async fn diff(State(state): State<AppState>, Json(req): Json<DiffReq>) -> Json<DiffRes> {
    let diff = if req.include_code {
        let config = req.config.unwrap_or_else(|| (*state.defaults).clone());
        state
            .service
            .diff_with_code(&req.old_measure, &req.new_measure, &config)
    } else {
        state.service.diff(&req.old_measure, &req.new_measure)
    };
    Json(DiffRes { diff })
}

#[utoipa::path(
    post,
    path = "/overrides",
    request_body = SaveOverrideReq,
    responses(
        (status = 201, description = "Override saved and locked", body = SaveOverrideRes),
        (status = 400, description = "Blank identifiers or code, or an edit note that is too short")
    )
)]
/// Save and lock a manual override for one component
///
/// # Errors
/// Returns `400 Bad Request` if:
/// - the measure id, component id or code is blank, or
/// - the edit note is shorter than the minimum length.
#[axum::debug_handler]
async fn save_override(
    State(state): State<AppState>,
    Json(req): Json<SaveOverrideReq>,
) -> Result<(StatusCode, Json<SaveOverrideRes>), (StatusCode, String)> {
    match state.service.save_override(req.into()) {
        Ok(record) => Ok((
            StatusCode::CREATED,
            Json(SaveOverrideRes {
                record: record.as_ref().clone(),
            }),
        )),
        Err(e @ (CoreError::InvalidInput(_) | CoreError::NoteTooShort { .. })) => {
            tracing::info!("Rejected override: {}", e);
            Err((StatusCode::BAD_REQUEST, e.to_string()))
        }
        Err(e) => {
            tracing::error!("Save override error: {:?}", e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, "Internal error".into()))
        }
    }
}

#[utoipa::path(
    post,
    path = "/overrides/revert",
    request_body = RevertOverrideReq,
    responses(
        (status = 200, description = "Override unlocked; notes are kept", body = RevertOverrideRes)
    )
)]
#[axum::debug_handler]
async fn revert_override(
    State(state): State<AppState>,
    Json(req): Json<RevertOverrideReq>,
) -> Json<RevertOverrideRes> {
    let reverted = state
        .service
        .revert_override(&req.measure_id, &req.component_id, req.format);
    Json(RevertOverrideRes { reverted })
}

#[utoipa::path(
    get,
    path = "/overrides/{measure_id}",
    params(
        ("measure_id" = String, Path, description = "Measure identifier"),
        ListOverridesQuery
    ),
    responses(
        (status = 200, description = "Locked overrides of the measure", body = ListOverridesRes)
    )
)]
#[axum::debug_handler]
async fn list_overrides(
    State(state): State<AppState>,
    AxumPath(measure_id): AxumPath<String>,
    Query(query): Query<ListOverridesQuery>,
) -> Json<ListOverridesRes> {
    let overrides = state
        .service
        .overrides_for_measure(&measure_id, query.format)
        .iter()
        .map(|o| o.as_ref().clone())
        .collect();
    Json(ListOverridesRes { overrides })
}

#[utoipa::path(
    get,
    path = "/overrides/{measure_id}/notes/{component_id}",
    params(
        ("measure_id" = String, Path, description = "Measure identifier"),
        ("component_id" = String, Path, description = "Component identifier")
    ),
    responses(
        (status = 200, description = "Edit notes across formats, newest first", body = ListNotesRes)
    )
)]
#[axum::debug_handler]
async fn list_notes(
    State(state): State<AppState>,
    AxumPath((measure_id, component_id)): AxumPath<(String, String)>,
) -> Json<ListNotesRes> {
    Json(ListNotesRes {
        notes: state.service.all_notes(&measure_id, &component_id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use ums_core::OverrideStore;

    fn app() -> Router {
        let defaults = GenerationConfig {
            generated_at: Some(Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()),
            ..GenerationConfig::default()
        };
        router(AppState::new(
            MeasureService::new(Arc::new(OverrideStore::new())),
            defaults,
        ))
    }

    fn measure() -> Value {
        json!({
            "id": "CMS122",
            "title": "Diabetes HbA1c Poor Control",
            "populations": [
                { "id": "ip", "type": "initial_population", "criteria": { "children": [
                    { "kind": "element", "id": "diabetes", "type": "diagnosis", "description": "Diabetes",
                      "valueSet": { "id": "vs-diabetes", "name": "Diabetes", "oid": "2.16.840.1.113883.3.464.1003.103.12.1001" } }
                ]}},
                { "id": "num", "type": "numerator", "criteria": { "children": [
                    { "kind": "element", "id": "hba1c", "type": "observation", "description": "HbA1c",
                      "valueSet": { "id": "vs-hba1c", "name": "HbA1c Laboratory Test", "oid": "2.16.840.1.113883.3.464.1003.198.12.1013" } }
                ]}}
            ]
        })
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = send(&app(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_generate_cql_and_sql() {
        let app = app();
        for format in ["cql", "sql"] {
            let (status, body) = send(
                &app,
                "POST",
                "/generate",
                Some(json!({ "format": format, "measure": measure() })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["result"]["success"], true, "{body}");
            assert!(body["result"]["code"].as_str().unwrap().contains("2025-03-01"));
        }
    }

    #[tokio::test]
    async fn test_generate_reports_precondition_failures() {
        let (status, body) = send(
            &app(),
            "POST",
            "/generate",
            Some(json!({ "format": "cql", "measure": { "id": "", "populations": [] } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["success"], false);
        assert_eq!(body["result"]["errors"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_validate_flags_dangerous_sql() {
        let (status, body) = send(
            &app(),
            "POST",
            "/validate",
            Some(json!({ "format": "sql", "code": "DROP TABLE dbo.PERSON;" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["valid"], false);
        let codes: Vec<&str> = body["result"]["errors"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|e| e["code"].as_str())
            .collect();
        assert!(codes.contains(&"DANGEROUS_STATEMENT"));
    }

    #[tokio::test]
    async fn test_override_lifecycle() {
        let app = app();
        let (status, _) = send(
            &app,
            "POST",
            "/overrides",
            Some(json!({
                "measureId": "CMS122",
                "componentId": "num",
                "format": "cql",
                "code": "define \"Numerator\":\n  true",
                "note": "Numerator simplified for pilot"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (_, body) = send(
            &app,
            "POST",
            "/generate",
            Some(json!({ "format": "cql", "measure": measure() })),
        )
        .await;
        assert_eq!(body["result"]["overridesApplied"][0]["componentId"], "num");

        let (_, listed) = send(&app, "GET", "/overrides/CMS122?format=cql", None).await;
        assert_eq!(listed["overrides"].as_array().unwrap().len(), 1);

        let (_, reverted) = send(
            &app,
            "POST",
            "/overrides/revert",
            Some(json!({ "measureId": "CMS122", "componentId": "num", "format": "cql" })),
        )
        .await;
        assert_eq!(reverted["reverted"], true);

        let (_, listed) = send(&app, "GET", "/overrides/CMS122", None).await;
        assert!(listed["overrides"].as_array().unwrap().is_empty());

        let (_, notes) = send(&app, "GET", "/overrides/CMS122/notes/num", None).await;
        assert_eq!(notes["notes"][0]["text"], "Numerator simplified for pilot");
    }

    #[tokio::test]
    async fn test_short_note_is_bad_request() {
        let (status, _) = send(
            &app(),
            "POST",
            "/overrides",
            Some(json!({
                "measureId": "CMS122",
                "componentId": "num",
                "format": "sql",
                "code": "SELECT 1",
                "note": "fix"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_diff_counts_title_change() {
        let mut renamed = measure();
        renamed["title"] = json!("Diabetes: Glycemic Status Assessment");
        let (status, body) = send(
            &app(),
            "POST",
            "/diff",
            Some(json!({ "oldMeasure": measure(), "newMeasure": renamed, "includeCode": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["diff"]["summary"]["totalChanges"], 1);
        assert_eq!(body["diff"]["metadataChanges"][0]["field"], "title");
        assert!(body["diff"]["codeDiff"]["added"].as_u64().unwrap() >= 1);
    }
}
