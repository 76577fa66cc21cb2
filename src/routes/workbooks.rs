use axum::{
    extract::State,
    http::{Method, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use crate::{
    AppState,
    clients::{
        engine::SessionGuard,
        models::{CalculationResult, EngineHealth, EngineSheets, FormulaValidation, FunctionCatalog},
    },
    error::AppError,
    services::{
        file_processor::{AnalyzeOptions, FileAnalysis, FileInput, FileOutcome},
        validator::ValidationOutcome,
    },
};
use tower_http::cors::{CorsLayer, Any};

pub fn routes() -> Router<Arc<AppState>> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        .route("/workbooks/validate", post(validate_workbook))
        .route("/workbooks/analyze", post(analyze_workbook))
        .route("/workbooks/analyze-many", post(analyze_workbooks))
        .route("/formulas/evaluate", post(evaluate_formula))
        .route("/engine/health", get(engine_health))
        .route("/engine/functions", get(engine_functions))
        .layer(cors)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    filename: String,
    #[serde(default)]
    content_type: Option<String>,
    signed_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    #[serde(flatten)]
    file: FileRef,
    #[serde(default)]
    validate_conversion: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeManyRequest {
    files: Vec<FileRef>,
    #[serde(default)]
    validate_conversion: bool,
}

#[derive(Debug, Deserialize)]
pub struct EvaluateRequest {
    formula: String,
    /// Data the formula refers to. An empty workbook is loaded when absent.
    #[serde(default)]
    sheets: Option<EngineSheets>,
}

#[derive(Debug, Serialize)]
pub struct EvaluateResponse {
    validation: FormulaValidation,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<CalculationResult>,
}

#[axum::debug_handler]
async fn validate_workbook(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FileRef>,
) -> Result<Json<ValidationOutcome>, AppError> {
    tracing::info!("Validating {}", request.filename);
    let data = state.processor.download(&request.signed_url).await?;
    Ok(Json(state.processor.validate(&data, &request.filename, request.content_type.as_deref())))
}

#[axum::debug_handler]
async fn analyze_workbook(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AnalyzeRequest>,
) -> Result<Json<FileAnalysis>, AppError> {
    let start = std::time::Instant::now();
    let options = AnalyzeOptions {
        validate_conversion: request.validate_conversion,
    };
    let file = request.file;
    let analysis = state
        .processor
        .analyze_url(&file.signed_url, &file.filename, file.content_type.as_deref(), options)
        .await?;
    tracing::info!("Request for {} completed in {:?}", file.filename, start.elapsed());
    Ok(Json(analysis))
}

#[axum::debug_handler]
async fn analyze_workbooks(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AnalyzeManyRequest>,
) -> Result<Json<Vec<FileOutcome>>, AppError> {
    if request.files.is_empty() {
        return Err(AppError::ValidationError("No file provided".to_string()));
    }
    let start = std::time::Instant::now();
    let downloads = request.files.iter().map(|file| state.processor.download(&file.signed_url));
    let bodies = futures::future::try_join_all(downloads).await?;

    let inputs = request
        .files
        .into_iter()
        .zip(bodies)
        .map(|(file, data)| FileInput {
            filename: file.filename,
            content_type: file.content_type,
            data,
        })
        .collect();
    let options = AnalyzeOptions {
        validate_conversion: request.validate_conversion,
    };
    let outcomes = state.processor.analyze_many(inputs, options).await;
    tracing::info!("Analyzed {} files in {:?}", outcomes.len(), start.elapsed());
    Ok(Json(outcomes))
}

/// Validates a single formula in a throwaway session and calculates it when valid.
#[axum::debug_handler]
async fn evaluate_formula(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EvaluateRequest>,
) -> Result<Json<EvaluateResponse>, AppError> {
    let engine = &state.engine;
    let mut guard = SessionGuard::open(engine).await?;

    let outcome = async {
        let sheets = request.sheets.clone().unwrap_or_default();
        engine.load_data(guard.session_mut(), &sheets).await?;
        let validation = engine.validate(guard.session_mut(), &request.formula).await?;
        let result = if validation.valid {
            Some(engine.calculate(guard.session_mut(), &request.formula).await?)
        } else {
            None
        };
        Ok::<_, AppError>(EvaluateResponse { validation, result })
    }
    .await;

    guard.close().await;
    Ok(Json(outcome?))
}

#[axum::debug_handler]
async fn engine_health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<EngineHealth>) {
    let health = state.engine.health().await;
    let status = if health.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

#[axum::debug_handler]
async fn engine_functions(State(state): State<Arc<AppState>>) -> Result<Json<FunctionCatalog>, AppError> {
    let catalog = state.engine.functions().await?;
    Ok(Json(catalog.as_ref().clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analyze_request_reads_camel_case() {
        let request: AnalyzeRequest = serde_json::from_str(
            r#"{"filename":"q3.xlsx","contentType":null,"signedUrl":"https://files/q3","validateConversion":true}"#,
        )
        .unwrap();
        assert_eq!(request.file.filename, "q3.xlsx");
        assert!(request.file.content_type.is_none());
        assert!(request.validate_conversion);
    }

    #[test]
    fn evaluate_request_sheets_are_optional() {
        let request: EvaluateRequest = serde_json::from_str(r#"{"formula":"=1+1"}"#).unwrap();
        assert!(request.sheets.is_none());
    }
}
