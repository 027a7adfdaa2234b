//! ARM-style REST client.
//!
//! `GET`/`PUT`/`DELETE {endpoint}{id}?api-version=...`. Accepted mutations
//! (`201`/`202`) that carry an `Azure-AsyncOperation` or `Location` header
//! are long-running and polled through that URL.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tracing::debug;

use super::{PollHandle, PollStatus, RemoteClient, Submitted};
use crate::error::RemoteError;
use crate::id::ResourceId;

const ASYNC_OPERATION: &str = "azure-asyncoperation";
const LOCATION: &str = "location";

/// [`RemoteClient`] over HTTP.
pub struct HttpRemote {
    client: Client,
    endpoint: String,
    token: Option<String>,
    default_api_version: String,
    /// Case-folded provider type → api-version.
    api_versions: HashMap<String, String>,
}

impl HttpRemote {
    pub fn new(endpoint: impl Into<String>, default_api_version: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: None,
            default_api_version: default_api_version.into(),
            api_versions: HashMap::new(),
        }
    }

    /// Send `Authorization: Bearer <token>` with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Use `version` for identifiers of `resource_type` (e.g. `Microsoft.Cache/redis`).
    pub fn with_api_version(
        mut self,
        resource_type: impl AsRef<str>,
        version: impl Into<String>,
    ) -> Self {
        self.api_versions
            .insert(resource_type.as_ref().to_lowercase(), version.into());
        self
    }

    fn url(&self, id: &ResourceId) -> String {
        let version = self
            .api_versions
            .get(&id.resource_type().to_lowercase())
            .unwrap_or(&self.default_api_version);
        format!("{}{}?api-version={}", self.endpoint, id, version)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        self.authorize(request)
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Turn a non-success response into a [`RemoteError::Status`].
async fn status_error(response: Response) -> RemoteError {
    let status = response.status().as_u16();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    let error = body.get("error").unwrap_or(&body);
    RemoteError::Status {
        status,
        code: error
            .get("code")
            .and_then(Value::as_str)
            .map(str::to_string),
        message: error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("no error message")
            .to_string(),
    }
}

fn submitted(response: &Response) -> Submitted {
    if !matches!(
        response.status(),
        StatusCode::CREATED | StatusCode::ACCEPTED
    ) {
        return Submitted::Completed;
    }
    let headers = response.headers();
    match header(headers, ASYNC_OPERATION).or_else(|| header(headers, LOCATION)) {
        Some(url) => Submitted::Pending(PollHandle(url)),
        None => Submitted::Completed,
    }
}

/// Map an operation-status document onto [`PollStatus`].
pub(crate) fn parse_operation_status(body: &Value, retry_after: Option<Duration>) -> PollStatus {
    let Some(status) = body.get("status").and_then(Value::as_str) else {
        // Location-style polling returns the final resource without a status.
        return PollStatus::Succeeded;
    };
    match status.to_ascii_lowercase().as_str() {
        "succeeded" => PollStatus::Succeeded,
        "canceled" | "cancelled" => PollStatus::Canceled,
        "failed" => PollStatus::Failed {
            message: body
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("operation failed")
                .to_string(),
        },
        _ => PollStatus::InProgress { retry_after },
    }
}

#[async_trait]
impl RemoteClient for HttpRemote {
    async fn get(&self, id: &ResourceId) -> Result<Option<Value>, RemoteError> {
        debug!("GET {}", id);
        let response = self.send(self.client.get(self.url(id))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        response
            .json()
            .await
            .map(Some)
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }

    async fn create_or_update(
        &self,
        id: &ResourceId,
        body: Value,
    ) -> Result<Submitted, RemoteError> {
        debug!("PUT {}", id);
        let response = self
            .send(self.client.put(self.url(id)).json(&body))
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(submitted(&response))
    }

    async fn delete(&self, id: &ResourceId) -> Result<Submitted, RemoteError> {
        debug!("DELETE {}", id);
        let response = self.send(self.client.delete(self.url(id))).await?;
        // 204 from DELETE means the object was already gone.
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(Submitted::Completed);
        }
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(submitted(&response))
    }

    async fn poll(&self, handle: &PollHandle) -> Result<PollStatus, RemoteError> {
        let response = self.send(self.client.get(&handle.0)).await?;
        let delay = retry_after(response.headers());
        if response.status() == StatusCode::ACCEPTED {
            return Ok(PollStatus::InProgress { retry_after: delay });
        }
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let body: Value = response.json().await.unwrap_or(Value::Null);
        Ok(parse_operation_status(&body, delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_url_uses_per_type_api_version() {
        let remote = HttpRemote::new("https://management.example/", "2023-01-01")
            .with_api_version("Microsoft.Cache/redis", "2024-03-01");
        let redis = ResourceId::parse(
            "/subscriptions/s/resourceGroups/g/providers/Microsoft.Cache/Redis/r1",
        )
        .unwrap();
        assert_eq!(
            remote.url(&redis),
            "https://management.example/subscriptions/s/resourceGroups/g/providers/Microsoft.Cache/Redis/r1?api-version=2024-03-01"
        );

        let nic = ResourceId::parse(
            "/subscriptions/s/resourceGroups/g/providers/Microsoft.Network/networkInterfaces/n1",
        )
        .unwrap();
        assert!(remote.url(&nic).ends_with("api-version=2023-01-01"));
    }

    #[test]
    fn test_operation_status() {
        assert_eq!(
            parse_operation_status(&json!({"status": "Succeeded"}), None),
            PollStatus::Succeeded
        );
        assert_eq!(
            parse_operation_status(&json!({"status": "Canceled"}), None),
            PollStatus::Canceled
        );
        assert_eq!(
            parse_operation_status(
                &json!({"status": "Failed", "error": {"message": "quota"}}),
                None
            ),
            PollStatus::Failed {
                message: "quota".into()
            }
        );
        assert_eq!(
            parse_operation_status(
                &json!({"status": "InProgress"}),
                Some(Duration::from_secs(5))
            ),
            PollStatus::InProgress {
                retry_after: Some(Duration::from_secs(5))
            }
        );
        assert_eq!(
            parse_operation_status(&json!({"name": "r1"}), None),
            PollStatus::Succeeded
        );
    }
}
