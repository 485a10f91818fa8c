//! REST transport for the Ledgerline backend.

use crate::config::{AuthConfig, ClientConfig};
use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use ledgerline_core::{
    AggregationLevel, Backend, CalculationDefinition, CycleCode, EntityKind, LedgerResult,
    ModelField, ModelInfo, ReportId, ReportLayout, ReportLayoutCreate, ReportRunRequest,
    ReportRunResponse, RequestError, Udf, UdfCreate, UdfId,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// FastAPI error body.
#[derive(Debug, Deserialize)]
struct ErrorDetail {
    detail: Value,
}

/// What a request is about, used to turn a 404 into `NotFound`.
#[derive(Debug, Clone)]
struct Target {
    entity: EntityKind,
    id: String,
}

impl Target {
    fn new(entity: EntityKind, id: impl ToString) -> Option<Self> {
        Some(Self {
            entity,
            id: id.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct CalculationQuery {
    aggregation_level: AggregationLevel,
}

#[derive(Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    auth_header: HeaderMap,
}

impl RestClient {
    pub fn new(config: &ClientConfig) -> ClientResult<Self> {
        let timeout = Duration::from_millis(config.request_timeout_ms);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Http(e.to_string()))?;

        let auth_header = build_auth_headers(&config.auth)?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            auth_header,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T, Q>(
        &self,
        operation: &'static str,
        target: Option<Target>,
        path: &str,
        query: Option<&Q>,
    ) -> LedgerResult<T>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let mut request = self.client.get(self.url(path)).headers(self.auth_header.clone());
        if let Some(query) = query {
            request = request.query(query);
        }
        self.send(operation, target, request).await
    }

    async fn post_json<T, B>(
        &self,
        operation: &'static str,
        target: Option<Target>,
        path: &str,
        body: &B,
    ) -> LedgerResult<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let request = self
            .client
            .post(self.url(path))
            .headers(self.auth_header.clone())
            .json(body);
        self.send(operation, target, request).await
    }

    async fn put_json<T, B>(
        &self,
        operation: &'static str,
        target: Option<Target>,
        path: &str,
        body: &B,
    ) -> LedgerResult<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let request = self
            .client
            .put(self.url(path))
            .headers(self.auth_header.clone())
            .json(body);
        self.send(operation, target, request).await
    }

    /// DELETE whose response body is a boolean (or an informational object).
    async fn delete(&self, operation: &'static str, target: Option<Target>, path: &str) -> LedgerResult<()> {
        let request = self.client.delete(self.url(path)).headers(self.auth_header.clone());
        let body: Value = self.send(operation, target, request).await?;
        if body == Value::Bool(false) {
            return Err(RequestError::failed(operation, "backend reported the delete did not happen").into());
        }
        Ok(())
    }

    async fn send<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        target: Option<Target>,
        request: reqwest::RequestBuilder,
    ) -> LedgerResult<T> {
        tracing::debug!(operation, "Backend request");
        let response = request.send().await.map_err(|e| {
            tracing::warn!(operation, error = %e, "Backend request failed");
            RequestError::failed(operation, e.to_string())
        })?;
        self.parse_response(operation, target, response).await
    }

    async fn parse_response<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        target: Option<Target>,
        response: reqwest::Response,
    ) -> LedgerResult<T> {
        let status = response.status();
        if status.is_success() {
            if status == StatusCode::NO_CONTENT {
                return serde_json::from_value(Value::Null)
                    .map_err(|e| RequestError::failed(operation, format!("Unexpected response: {}", e)).into());
            }
            return response
                .json::<T>()
                .await
                .map_err(|e| RequestError::failed(operation, format!("Unexpected response: {}", e)).into());
        }

        let text = response
            .text()
            .await
            .map_err(|e| RequestError::failed(operation, e.to_string()))?;
        let err = error_from_status(operation, target, status, &text);
        tracing::warn!(operation, status = status.as_u16(), error = %err, "Backend rejected request");
        Err(err.into())
    }
}

/// Map a non-success response to the matching `RequestError`.
fn error_from_status(
    operation: &str,
    target: Option<Target>,
    status: StatusCode,
    body: &str,
) -> RequestError {
    if status == StatusCode::NOT_FOUND {
        if let Some(target) = target {
            return RequestError::NotFound {
                entity: target.entity,
                id: target.id,
            };
        }
    }

    let message = error_message(status, body);
    match status {
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
            RequestError::Rejected {
                operation: operation.to_string(),
                message,
            }
        }
        _ => RequestError::failed(operation, message),
    }
}

fn error_message(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<ErrorDetail>(body) {
        Ok(ErrorDetail {
            detail: Value::String(detail),
        }) => detail,
        Ok(ErrorDetail { detail }) => detail.to_string(),
        Err(_) => format!("HTTP {}: {}", status.as_u16(), body),
    }
}

fn build_auth_headers(auth: &AuthConfig) -> ClientResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    if let Some(api_key) = &auth.api_key {
        headers.insert(
            HeaderName::from_static("x-api-key"),
            HeaderValue::from_str(api_key).map_err(|e| ClientError::Http(e.to_string()))?,
        );
    }
    if let Some(jwt) = &auth.jwt {
        let value = format!("Bearer {}", jwt);
        headers.insert(
            HeaderName::from_static("authorization"),
            HeaderValue::from_str(&value).map_err(|e| ClientError::Http(e.to_string()))?,
        );
    }
    Ok(headers)
}

#[async_trait]
impl Backend for RestClient {
    async fn list_udfs(&self) -> LedgerResult<Vec<Udf>> {
        self.get_json::<_, ()>("list UDFs", None, "/udfs/", None).await
    }

    async fn create_udf(&self, payload: &UdfCreate) -> LedgerResult<Udf> {
        self.post_json("create UDF", None, "/udfs/", payload).await
    }

    async fn update_udf(&self, id: UdfId, payload: &UdfCreate) -> LedgerResult<Udf> {
        let path = format!("/udfs/{}", id);
        self.put_json("update UDF", Target::new(EntityKind::Udf, id), &path, payload)
            .await
    }

    async fn delete_udf(&self, id: UdfId) -> LedgerResult<()> {
        let path = format!("/udfs/{}", id);
        self.delete("delete UDF", Target::new(EntityKind::Udf, id), &path).await
    }

    async fn generate_udf_code(&self, id: UdfId) -> LedgerResult<String> {
        let path = format!("/udfs/{}/pydantic-code", id);
        self.get_json::<_, ()>("generate UDF code", Target::new(EntityKind::Udf, id), &path, None)
            .await
    }

    async fn list_models(&self) -> LedgerResult<Vec<ModelInfo>> {
        self.get_json::<_, ()>("list models", None, "/models/", None).await
    }

    async fn model_fields(&self, model_id: &str) -> LedgerResult<Vec<ModelField>> {
        let path = format!("/models/{}/fields", model_id);
        self.get_json::<_, ()>("list model fields", Target::new(EntityKind::Model, model_id), &path, None)
            .await
    }

    async fn list_calculations(
        &self,
        level: AggregationLevel,
    ) -> LedgerResult<Vec<CalculationDefinition>> {
        let query = CalculationQuery {
            aggregation_level: level,
        };
        self.get_json("list calculations", None, "/calculations/", Some(&query))
            .await
    }

    async fn list_reports(&self) -> LedgerResult<Vec<ReportLayout>> {
        self.get_json::<_, ()>("list reports", None, "/reports/", None).await
    }

    async fn create_report(&self, payload: &ReportLayoutCreate) -> LedgerResult<ReportLayout> {
        self.post_json("create report", None, "/reports/", payload).await
    }

    async fn update_report(
        &self,
        id: ReportId,
        payload: &ReportLayoutCreate,
    ) -> LedgerResult<ReportLayout> {
        let path = format!("/reports/{}", id);
        self.put_json("update report", Target::new(EntityKind::Report, id), &path, payload)
            .await
    }

    async fn delete_report(&self, id: ReportId) -> LedgerResult<()> {
        let path = format!("/reports/{}", id);
        self.delete("delete report", Target::new(EntityKind::Report, id), &path)
            .await
    }

    async fn run_report(&self, request: &ReportRunRequest) -> LedgerResult<ReportRunResponse> {
        self.post_json(
            "run report",
            Target::new(EntityKind::Report, request.report_id),
            "/reports/run",
            request,
        )
        .await
    }

    async fn list_cycles(&self) -> LedgerResult<Vec<CycleCode>> {
        self.get_json::<_, ()>("list cycles", None, "/reports/cycles", None)
            .await
    }
}
