use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;

use crate::logging::log_request;
use crate::model::{
    ConnectionStatus, HistoryResponse, LatestValues, ScenarioDef, ScenarioId, ScenarioResult,
    SystemState,
};

mod http;
#[cfg(test)]
pub(crate) mod testing;

pub use http::HttpTransport;

/// Uniform failure for every remote call.
///
/// `status` is `None` when no HTTP response was obtained (connect, timeout)
/// or when a success response could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HttpError {
    pub status: Option<u16>,
    pub message: String,
}

impl HttpError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self { status: None, message: message.into() }
    }

    /// Non-2xx response. The server's `error` field wins when present.
    pub fn from_response(status: u16, body: &Value) -> Self {
        let message = body
            .get("error")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP error {}", status));
        Self { status: Some(status), message }
    }

    pub fn malformed(detail: impl fmt::Display) -> Self {
        Self { status: None, message: format!("malformed response: {}", detail) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

/// Path below the API base, kept as raw segments so tag names with
/// reserved characters are escaped by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ApiPath(Vec<String>);

impl ApiPath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for ApiPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for seg in &self.0 {
            write!(f, "/{}", seg)?;
        }
        Ok(())
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, path: &ApiPath) -> Result<Value, HttpError>;
    async fn post(&self, path: &ApiPath, body: Option<Value>) -> Result<Value, HttpError>;
}

/// Typed view of the bridge API.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn http(base: &str, timeout: std::time::Duration) -> Result<Self, HttpError> {
        Ok(Self::new(Arc::new(HttpTransport::new(base, timeout)?)))
    }

    async fn get<T: DeserializeOwned>(&self, path: ApiPath) -> Result<T, HttpError> {
        log_request(Method::Get.as_str(), &path.to_string());
        let value = self.transport.get(&path).await?;
        decode(value)
    }

    async fn post<T: DeserializeOwned>(&self, path: ApiPath, body: Option<Value>) -> Result<T, HttpError> {
        log_request(Method::Post.as_str(), &path.to_string());
        let value = self.transport.post(&path, body).await?;
        decode(value)
    }

    pub async fn system_state(&self) -> Result<SystemState, HttpError> {
        self.get(ApiPath::new(["system-state"])).await
    }

    pub async fn latest_values(&self) -> Result<LatestValues, HttpError> {
        self.get(ApiPath::new(["latest-values"])).await
    }

    pub async fn history(&self, tag: &str) -> Result<HistoryResponse, HttpError> {
        self.get(ApiPath::new(["history", tag])).await
    }

    pub async fn run_scenario(&self, id: ScenarioId) -> Result<ScenarioResult, HttpError> {
        self.post(scenario_path(id, "run"), None).await
    }

    pub async fn visual_check(&self, id: ScenarioId, passed: bool) -> Result<ScenarioResult, HttpError> {
        self.post(scenario_path(id, "visual-check"), Some(json!({ "passed": passed })))
            .await
    }

    pub async fn connection_status(&self) -> Result<BTreeMap<String, ConnectionStatus>, HttpError> {
        self.get(ApiPath::new(["connection-status"])).await
    }

    pub async fn test_results(&self) -> Result<BTreeMap<ScenarioId, ScenarioResult>, HttpError> {
        self.get(ApiPath::new(["test-results"])).await
    }

    pub async fn test_scenarios(&self) -> Result<BTreeMap<ScenarioId, ScenarioDef>, HttpError> {
        self.get(ApiPath::new(["test-scenarios"])).await
    }
}

fn scenario_path(id: ScenarioId, action: &str) -> ApiPath {
    ApiPath::new(["test-scenario".to_string(), id.to_string(), action.to_string()])
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, HttpError> {
    serde_json::from_value(value).map_err(HttpError::malformed)
}
