use axum::{
    response::{IntoResponse, Response},
    http::StatusCode,
};
use serde_json::json;
use axum::Json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Bad input rejected before any remote call.
    #[error("Validation error: {0}")]
    ValidationError(String),
    /// Calculation engine unreachable. The only retried class.
    #[error("Connection error: {0}")]
    ConnectionError(String),
    #[error("Session error: {0}")]
    SessionError(String),
    #[error("Formula error: {0}")]
    FormulaError(String),
    #[error("Calculation error: {0}")]
    CalculationError(String),
    #[error("File processing error: {0}")]
    FileProcessingError(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("HTTP Error: {0}")]
    HttpError(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::ConnectionError(_))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::ParseError(err.to_string())
    }
}

impl From<calamine::Error> for AppError {
    fn from(err: calamine::Error) -> Self {
        AppError::FileProcessingError(err.to_string())
    }
}

impl From<csv::Error> for AppError {
    fn from(err: csv::Error) -> Self {
        AppError::FileProcessingError(err.to_string())
    }
}

impl From<zip::result::ZipError> for AppError {
    fn from(err: zip::result::ZipError) -> Self {
        AppError::FileProcessingError(err.to_string())
    }
}

impl From<rust_xlsxwriter::XlsxError> for AppError {
    fn from(err: rust_xlsxwriter::XlsxError) -> Self {
        AppError::FileProcessingError(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::ParseError(_) => StatusCode::BAD_REQUEST,
            AppError::ConnectionError(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::SessionError(_) => StatusCode::BAD_GATEWAY,
            AppError::FormulaError(_) => StatusCode::BAD_GATEWAY,
            AppError::CalculationError(_) => StatusCode::BAD_GATEWAY,
            AppError::FileProcessingError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::HttpError(_) => StatusCode::BAD_GATEWAY,
            AppError::IoError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_errors_are_retryable() {
        assert!(AppError::ConnectionError("refused".into()).is_retryable());
        assert!(!AppError::SessionError("404".into()).is_retryable());
        assert!(!AppError::ValidationError("no session".into()).is_retryable());
    }

    #[test]
    fn status_codes_follow_error_class() {
        let resp = AppError::ValidationError("bad".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = AppError::ConnectionError("down".into()).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resp = AppError::FileProcessingError("corrupt".into()).into_response();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
