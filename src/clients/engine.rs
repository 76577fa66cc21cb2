use super::models::*;
use crate::config::EngineConfig;
use crate::error::AppError;
use crate::services::formula::normalize_formula;
use crate::services::session_registry::SessionRegistry;
use moka::sync::Cache;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const CATALOG_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }
}

/// Which responses count as a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryOn {
    /// Transport errors and 500/502/503/504.
    ConnectionLevel,
    /// Anything but a success status.
    AnyFailure,
}

impl RetryOn {
    fn retries(self, status: StatusCode) -> bool {
        match self {
            RetryOn::ConnectionLevel => matches!(
                status,
                StatusCode::INTERNAL_SERVER_ERROR
                    | StatusCode::BAD_GATEWAY
                    | StatusCode::SERVICE_UNAVAILABLE
                    | StatusCode::GATEWAY_TIMEOUT
            ),
            RetryOn::AnyFailure => !status.is_success(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Uninitialized,
    Created,
    DataLoaded,
    Analyzed,
    Validated,
    Calculated,
    Destroyed,
}

/// One engine session. Never shared between analyses.
#[derive(Debug)]
pub struct EngineSession {
    id: Option<String>,
    state: SessionState,
}

impl Default for EngineSession {
    fn default() -> Self {
        Self {
            id: None,
            state: SessionState::Uninitialized,
        }
    }
}

impl EngineSession {
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_destroyed(&self) -> bool {
        self.state == SessionState::Destroyed
    }

    fn live_id(&self) -> Result<String, AppError> {
        if self.is_destroyed() {
            return Err(AppError::SessionError(format!(
                "session {} has been destroyed",
                self.id.as_deref().unwrap_or("<none>")
            )));
        }
        self.id
            .clone()
            .ok_or_else(|| AppError::ValidationError("session has not been created".to_string()))
    }

    fn loaded_id(&self) -> Result<String, AppError> {
        let id = self.live_id()?;
        if self.state < SessionState::DataLoaded {
            return Err(AppError::SessionError(format!("session {} has no data loaded", id)));
        }
        Ok(id)
    }
}

/// HTTP client for the calculation engine's session protocol. Cheap to clone.
#[derive(Clone)]
pub struct EngineClient {
    http: Client,
    base_url: String,
    retry: RetryPolicy,
    registry: Arc<SessionRegistry>,
    catalog: Cache<(), Arc<FunctionCatalog>>,
}

impl EngineClient {
    pub fn new(config: &EngineConfig, registry: Arc<SessionRegistry>) -> Result<Self, AppError> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build engine HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy::new(config.retry_attempts, config.retry_backoff),
            registry,
            catalog: Cache::builder().max_capacity(1).time_to_live(CATALOG_TTL).build(),
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Sends with bounded retries and a fixed backoff. Responses that are not retried
    /// (including 4xx) are handed back for the caller to classify.
    async fn send_with_retry<F>(&self, operation: &str, retry_on: RetryOn, build: F) -> Result<Response, AppError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let attempts = self.retry.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let error = match build(&self.http).send().await {
                Ok(response) if !retry_on.retries(response.status()) => return Ok(response),
                Ok(response) => AppError::ConnectionError(format!("HTTP {}", response.status())),
                Err(e) if e.is_builder() => AppError::ValidationError(format!("Invalid {} request: {}", operation, e)),
                Err(e) => AppError::ConnectionError(e.to_string()),
            };
            if !error.is_retryable() {
                return Err(error);
            }
            last_error = match error {
                AppError::ConnectionError(message) => message,
                other => other.to_string(),
            };

            if attempt < attempts {
                tracing::warn!(
                    "Engine {} failed (attempt {}/{}): {}; retrying in {:?}",
                    operation,
                    attempt,
                    attempts,
                    last_error,
                    self.retry.backoff
                );
                tokio::time::sleep(self.retry.backoff).await;
            }
        }

        tracing::error!("Engine {} failed after {} attempts: {}", operation, attempts, last_error);
        Err(AppError::ConnectionError(format!(
            "{} failed after {} attempts: {}",
            operation, attempts, last_error
        )))
    }

    async fn decode<T: DeserializeOwned>(
        &self,
        response: Response,
        operation: &str,
        session_id: Option<&str>,
    ) -> Result<T, AppError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| AppError::ParseError(format!("Malformed {} response: {}", operation, e)));
        }

        let body = response.text().await.unwrap_or_default();
        let message = engine_message(&body).unwrap_or_else(|| status.to_string());
        match (status, session_id) {
            (StatusCode::NOT_FOUND, Some(id)) => Err(AppError::SessionError(format!("unknown session {}", id))),
            (s, _) if s.is_client_error() => Err(AppError::SessionError(format!(
                "{} rejected ({}): {}",
                operation, s, message
            ))),
            (s, _) => Err(AppError::ConnectionError(format!("{} failed ({}): {}", operation, s, message))),
        }
    }

    pub async fn create_session(&self) -> Result<EngineSession, AppError> {
        let response = self
            .send_with_retry("create_session", RetryOn::ConnectionLevel, |http| {
                http.post(self.url("/sessions")).json(&json!({}))
            })
            .await?;
        let created: CreateSessionResponse = self.decode(response, "create_session", None).await?;

        self.registry.register(&created.session_id);
        tracing::info!("Created engine session {}", created.session_id);
        Ok(EngineSession {
            id: Some(created.session_id),
            state: SessionState::Created,
        })
    }

    pub async fn load_data(&self, session: &mut EngineSession, sheets: &EngineSheets) -> Result<(), AppError> {
        let id = session.live_id()?;
        let path = format!("/sessions/{}/load", id);
        let body = json!({ "sheets": sheets });

        let response = self
            .send_with_retry("load_data", RetryOn::ConnectionLevel, |http| {
                http.post(self.url(&path)).json(&body)
            })
            .await?;
        let loaded: LoadResponse = self.decode(response, "load_data", Some(&id)).await?;

        self.registry.touch(&id);
        session.state = SessionState::DataLoaded;
        tracing::debug!(
            "Loaded {} sheets into session {}: {}",
            sheets.len(),
            id,
            loaded.message.as_deref().unwrap_or("ok")
        );
        Ok(())
    }

    pub async fn analyze(&self, session: &mut EngineSession) -> Result<EngineAnalysis, AppError> {
        let id = session.loaded_id()?;
        let path = format!("/sessions/{}/analyze", id);

        let response = self
            .send_with_retry("analyze", RetryOn::ConnectionLevel, |http| http.get(self.url(&path)))
            .await?;
        let analyzed: AnalyzeResponse = self.decode(response, "analyze", Some(&id)).await?;
        self.registry.touch(&id);

        if !analyzed.success {
            return Err(AppError::CalculationError(
                analyzed.error.unwrap_or_else(|| "engine analysis failed".to_string()),
            ));
        }
        session.state = SessionState::Analyzed;
        Ok(analyzed.data.unwrap_or_default())
    }

    pub async fn validate(&self, session: &mut EngineSession, formula: &str) -> Result<FormulaValidation, AppError> {
        let formula = require_formula(formula)?;
        let id = session.loaded_id()?;
        let path = format!("/sessions/{}/validate", id);
        let body = json!({ "formula": formula });

        let response = self
            .send_with_retry("validate", RetryOn::ConnectionLevel, |http| {
                http.post(self.url(&path)).json(&body)
            })
            .await?;
        let validated: ValidateResponse = self.decode(response, "validate", Some(&id)).await?;
        self.registry.touch(&id);

        if !validated.success {
            return Err(AppError::FormulaError(
                validated
                    .error
                    .unwrap_or_else(|| format!("engine could not validate {}", formula)),
            ));
        }
        session.state = SessionState::Validated;
        Ok(FormulaValidation {
            valid: validated.valid,
            errors: validated.errors.into_iter().map(EngineIssue::from).collect(),
        })
    }

    pub async fn calculate(&self, session: &mut EngineSession, formula: &str) -> Result<CalculationResult, AppError> {
        let formula = require_formula(formula)?;
        let id = session.loaded_id()?;
        let path = format!("/sessions/{}/calculate", id);
        let body = json!({ "formula": formula });

        let response = self
            .send_with_retry("calculate", RetryOn::ConnectionLevel, |http| {
                http.post(self.url(&path)).json(&body)
            })
            .await?;
        let calculated: CalculateResponse = self.decode(response, "calculate", Some(&id)).await?;
        self.registry.touch(&id);

        if !calculated.success {
            return Err(AppError::CalculationError(
                calculated
                    .error
                    .unwrap_or_else(|| format!("engine could not calculate {}", formula)),
            ));
        }
        session.state = SessionState::Calculated;
        Ok(CalculationResult {
            formula,
            value: calculated.result,
        })
    }

    /// Best effort and idempotent: failures are logged, never returned.
    pub async fn destroy_session(&self, session: &mut EngineSession) {
        if session.is_destroyed() {
            return;
        }
        session.state = SessionState::Destroyed;
        if let Some(id) = session.id.clone() {
            self.destroy_by_id(&id).await;
        }
    }

    /// Deregisters first, so a concurrent sweep and an explicit destroy send one DELETE.
    pub async fn destroy_by_id(&self, id: &str) {
        if !self.registry.remove(id) {
            tracing::debug!("Session {} already destroyed", id);
            return;
        }
        let result = self
            .http
            .delete(self.url(&format!("/sessions/{}", id)))
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() || response.status() == StatusCode::NOT_FOUND => {
                tracing::info!("Destroyed engine session {}", id);
            }
            Ok(response) => tracing::warn!("Engine refused to destroy session {}: HTTP {}", id, response.status()),
            Err(e) => tracing::warn!("Failed to destroy session {}: {}", id, e),
        }
    }

    /// Never fails; an engine that keeps failing is reported as unreachable.
    pub async fn health(&self) -> EngineHealth {
        let outcome = self
            .send_with_retry("health", RetryOn::AnyFailure, |http| http.get(self.url("/health")))
            .await;
        match outcome {
            Ok(response) => match response.json::<EngineHealthReport>().await {
                Ok(report) => EngineHealth::Healthy(report),
                Err(e) => EngineHealth::Unreachable {
                    attempts: self.retry.attempts,
                    last_error: format!("malformed health report: {}", e),
                },
            },
            Err(e) => EngineHealth::Unreachable {
                attempts: self.retry.attempts,
                last_error: e.to_string(),
            },
        }
    }

    pub async fn functions(&self) -> Result<Arc<FunctionCatalog>, AppError> {
        if let Some(catalog) = self.catalog.get(&()) {
            return Ok(catalog);
        }
        let response = self
            .send_with_retry("functions", RetryOn::ConnectionLevel, |http| http.get(self.url("/functions")))
            .await?;
        let catalog: FunctionCatalog = self.decode(response, "functions", None).await?;
        tracing::info!("Fetched engine function catalog ({} functions)", catalog.total);

        let catalog = Arc::new(catalog);
        self.catalog.insert((), Arc::clone(&catalog));
        Ok(catalog)
    }
}

fn require_formula(formula: &str) -> Result<String, AppError> {
    if formula.trim().is_empty() {
        return Err(AppError::ValidationError("formula must not be empty".to_string()));
    }
    Ok(normalize_formula(formula))
}

fn engine_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    ["error", "message"]
        .iter()
        .find_map(|key| value.get(key).and_then(|v| v.as_str()).map(str::to_string))
}

/// Owns a session and destroys it on drop if [`SessionGuard::close`] never ran.
pub struct SessionGuard {
    client: EngineClient,
    session: EngineSession,
}

impl SessionGuard {
    pub async fn open(client: &EngineClient) -> Result<Self, AppError> {
        let session = client.create_session().await?;
        Ok(Self {
            client: client.clone(),
            session,
        })
    }

    pub fn session(&self) -> &EngineSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut EngineSession {
        &mut self.session
    }

    pub async fn close(mut self) {
        self.client.destroy_session(&mut self.session).await;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.session.is_destroyed() {
            return;
        }
        self.session.state = SessionState::Destroyed;
        let Some(id) = self.session.id.clone() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!("Session {} dropped without destroy; cleaning up in background", id);
                let client = self.client.clone();
                handle.spawn(async move { client.destroy_by_id(&id).await });
            }
            Err(_) => tracing::warn!("Session {} leaked: no runtime to destroy it", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_level_statuses() {
        assert!(RetryOn::ConnectionLevel.retries(StatusCode::SERVICE_UNAVAILABLE));
        assert!(RetryOn::ConnectionLevel.retries(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!RetryOn::ConnectionLevel.retries(StatusCode::NOT_FOUND));
        assert!(!RetryOn::ConnectionLevel.retries(StatusCode::NOT_IMPLEMENTED));
        assert!(RetryOn::AnyFailure.retries(StatusCode::NOT_IMPLEMENTED));
        assert!(!RetryOn::AnyFailure.retries(StatusCode::OK));
    }

    #[test]
    fn uncreated_sessions_reject_loads() {
        let session = EngineSession::default();
        assert!(matches!(session.live_id(), Err(AppError::ValidationError(_))));
    }

    #[test]
    fn destroyed_sessions_are_never_reused() {
        let session = EngineSession {
            id: Some("s1".into()),
            state: SessionState::Destroyed,
        };
        assert!(matches!(session.live_id(), Err(AppError::SessionError(_))));
    }

    #[test]
    fn analysis_requires_loaded_data() {
        let session = EngineSession {
            id: Some("s1".into()),
            state: SessionState::Created,
        };
        assert!(matches!(session.loaded_id(), Err(AppError::SessionError(_))));
    }

    #[test]
    fn empty_formulas_are_rejected_locally() {
        assert!(matches!(require_formula("  "), Err(AppError::ValidationError(_))));
        assert_eq!(require_formula("SUM(A1)").unwrap(), "=SUM(A1)");
    }

    #[test]
    fn engine_messages_come_from_json_bodies() {
        assert_eq!(engine_message(r#"{"error":"bad sheet"}"#).as_deref(), Some("bad sheet"));
        assert_eq!(engine_message("plain text"), None);
    }
}
