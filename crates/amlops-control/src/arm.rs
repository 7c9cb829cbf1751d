use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tokio::time::Instant;

use amlops_common::{
    BatchDeployment, BatchEndpoint, ModelVersion, OnlineDeployment, OnlineEndpoint,
    WorkspaceConfig,
};

use crate::credential::{TokenCredential, ARM_SCOPE};
use crate::types::{ControlPlane, ControlPlaneError, Operation, Result};
use crate::wire;

pub const ARM_ENDPOINT: &str = "https://management.azure.com";
pub const API_VERSION: &str = "2023-10-01";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Container whose log `get_deployment_logs` returns.
const LOG_CONTAINER: &str = "InferenceServer";

/// Azure Resource Manager client for one workspace.
///
/// Models resolve against `registry` when set; registries are addressed in
/// the workspace's subscription and resource group.
pub struct ArmControlPlane {
    http: reqwest::Client,
    credential: Arc<dyn TokenCredential>,
    base_url: String,
    workspace: WorkspaceConfig,
    registry: Option<String>,
    location: OnceCell<String>,
    poll_timeout: Duration,
}

impl ArmControlPlane {
    pub fn new(
        workspace: WorkspaceConfig,
        credential: Arc<dyn TokenCredential>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            http,
            credential,
            base_url: ARM_ENDPOINT.to_string(),
            workspace,
            registry: None,
            location: OnceCell::new(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_registry(mut self, registry: Option<String>) -> Self {
        self.registry = registry.filter(|r| !r.is_empty());
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    fn workspace_url(&self, path: &str) -> String {
        format!("{}{}{path}", self.base_url, self.workspace.resource_id())
    }

    fn models_url(&self, name: &str) -> String {
        match &self.registry {
            Some(registry) => format!(
                "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.MachineLearningServices/registries/{registry}/models/{name}/versions",
                self.base_url, self.workspace.subscription_id, self.workspace.resource_group
            ),
            None => self.workspace_url(&format!("/models/{name}/versions")),
        }
    }

    /// Sends an authenticated request. `api_version` is false for URLs handed
    /// out by the service (`nextLink`, operation status), which carry their own.
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        api_version: bool,
    ) -> Result<reqwest::Response> {
        let token = self.credential.get_token(ARM_SCOPE).await?;
        let mut req = self
            .http
            .request(method.clone(), url)
            .bearer_auth(&token.token);
        if api_version {
            req = req.query(&[("api-version", API_VERSION)]);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        tracing::debug!(%method, url, "arm request");
        req.send().await.map_err(|source| ControlPlaneError::Transport {
            url: url.to_string(),
            source,
        })
    }

    async fn error_for(method: Method, url: &str, resp: reqwest::Response) -> ControlPlaneError {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| {
                v.get("error")?
                    .get("message")?
                    .as_str()
                    .map(str::to_string)
            })
            .unwrap_or(body);
        ControlPlaneError::Http {
            method: method.to_string(),
            url: url.to_string(),
            status,
            body: message,
        }
    }

    async fn decode(url: &str, resp: reqwest::Response) -> Result<Value> {
        resp.json().await.map_err(|e| ControlPlaneError::Decode {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    /// GET that maps 404 to `None`.
    async fn get_json(&self, url: &str) -> Result<Option<Value>> {
        let resp = self.send(Method::GET, url, None, true).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::error_for(Method::GET, url, resp).await);
        }
        Self::decode(url, resp).await.map(Some)
    }

    /// PUT of a tracked resource; returns the long-running operation handle.
    async fn put_resource(&self, url: &str, body: &Value, description: String) -> Result<Operation> {
        let resp = self.send(Method::PUT, url, Some(body), true).await?;
        if !resp.status().is_success() {
            return Err(Self::error_for(Method::PUT, url, resp).await);
        }
        let headers = resp.headers();
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let status_url = header("azure-asyncoperation").or_else(|| header("location"));
        let poll_interval = header("retry-after")
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        tracing::info!(operation = %description, accepted = status_url.is_some(), "submitted");
        Ok(Operation {
            description,
            status_url,
            poll_interval,
        })
    }

    /// Location of the workspace, fetched once. Tracked resources must be
    /// created in the same region.
    async fn location(&self) -> Result<&str> {
        let location = self
            .location
            .get_or_try_init(|| async {
                let url = self.workspace_url("");
                let ws = self
                    .get_json(&url)
                    .await?
                    .ok_or_else(|| ControlPlaneError::NotFound(format!("workspace {}", self.workspace.workspace_name)))?;
                ws.get("location")
                    .and_then(|l| l.as_str())
                    .map(str::to_string)
                    .ok_or(ControlPlaneError::Decode {
                        url,
                        reason: "workspace has no location".to_string(),
                    })
            })
            .await?;
        Ok(location.as_str())
    }

    /// One poll of an operation status URL; `true` once it has succeeded.
    async fn poll_once(&self, op: &Operation, url: &str) -> Result<bool> {
        let resp = self.send(Method::GET, url, None, false).await?;
        let status = resp.status();
        if status == StatusCode::ACCEPTED {
            return Ok(false);
        }
        if !status.is_success() {
            return Err(Self::error_for(Method::GET, url, resp).await);
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(true);
        }
        let body = resp.json::<Value>().await.unwrap_or(Value::Null);
        match wire::operation_status(&body) {
            None => Ok(true),
            Some((state, message)) => match state.as_str() {
                "Succeeded" => Ok(true),
                "Failed" | "Canceled" | "Cancelled" => Err(ControlPlaneError::OperationFailed {
                    description: op.description.clone(),
                    status: state,
                    message: message.unwrap_or_else(|| "no error details".to_string()),
                }),
                _ => {
                    tracing::debug!(operation = %op.description, state = %state, "still running");
                    Ok(false)
                }
            },
        }
    }
}

#[async_trait]
impl ControlPlane for ArmControlPlane {
    async fn get_batch_endpoint(&self, name: &str) -> Result<Option<BatchEndpoint>> {
        let url = self.workspace_url(&format!("/batchEndpoints/{name}"));
        match self.get_json(&url).await? {
            None => Ok(None),
            Some(v) => wire::batch_endpoint_from_arm(&v)
                .map(Some)
                .ok_or(ControlPlaneError::Decode {
                    url,
                    reason: "not a batch endpoint".to_string(),
                }),
        }
    }

    async fn begin_create_or_update_batch_endpoint(&self, endpoint: &BatchEndpoint) -> Result<Operation> {
        let body = wire::batch_endpoint_body(endpoint, self.location().await?);
        let url = self.workspace_url(&format!("/batchEndpoints/{}", endpoint.name));
        self.put_resource(&url, &body, format!("batch endpoint {}", endpoint.name))
            .await
    }

    async fn get_online_endpoint(&self, name: &str) -> Result<Option<OnlineEndpoint>> {
        let url = self.workspace_url(&format!("/onlineEndpoints/{name}"));
        match self.get_json(&url).await? {
            None => Ok(None),
            Some(v) => wire::online_endpoint_from_arm(&v)
                .map(Some)
                .ok_or(ControlPlaneError::Decode {
                    url,
                    reason: "not an online endpoint".to_string(),
                }),
        }
    }

    async fn begin_create_or_update_online_endpoint(&self, endpoint: &OnlineEndpoint) -> Result<Operation> {
        let body = wire::online_endpoint_body(endpoint, self.location().await?);
        let url = self.workspace_url(&format!("/onlineEndpoints/{}", endpoint.name));
        self.put_resource(&url, &body, format!("online endpoint {}", endpoint.name))
            .await
    }

    async fn begin_create_or_update_batch_deployment(&self, deployment: &BatchDeployment) -> Result<Operation> {
        let body = wire::batch_deployment_body(&self.workspace, deployment, self.location().await?);
        let url = self.workspace_url(&format!(
            "/batchEndpoints/{}/deployments/{}",
            deployment.endpoint_name, deployment.name
        ));
        self.put_resource(&url, &body, format!("batch deployment {}", deployment.name))
            .await
    }

    async fn begin_create_or_update_online_deployment(&self, deployment: &OnlineDeployment) -> Result<Operation> {
        let body = wire::online_deployment_body(&self.workspace, deployment, self.location().await?);
        let url = self.workspace_url(&format!(
            "/onlineEndpoints/{}/deployments/{}",
            deployment.endpoint_name, deployment.name
        ));
        self.put_resource(&url, &body, format!("online deployment {}", deployment.name))
            .await
    }

    async fn get_deployment_logs(&self, endpoint_name: &str, deployment_name: &str, lines: u32) -> Result<String> {
        let url = self.workspace_url(&format!(
            "/onlineEndpoints/{endpoint_name}/deployments/{deployment_name}/getLogs"
        ));
        let body = json!({ "containerType": LOG_CONTAINER, "tail": lines });
        let resp = self.send(Method::POST, &url, Some(&body), true).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ControlPlaneError::NotFound(format!(
                "logs of {endpoint_name}/{deployment_name}"
            )));
        }
        if !resp.status().is_success() {
            return Err(Self::error_for(Method::POST, &url, resp).await);
        }
        let v = Self::decode(&url, resp).await?;
        Ok(v.get("content")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string())
    }

    async fn list_model_versions(&self, name: &str) -> Result<Vec<ModelVersion>> {
        let mut versions = Vec::new();
        let first = self.models_url(name);
        let mut page = match self.get_json(&first).await? {
            Some(page) => page,
            None => return Ok(versions),
        };
        loop {
            if let Some(items) = page.get("value").and_then(|v| v.as_array()) {
                versions.extend(
                    items
                        .iter()
                        .filter_map(|item| wire::model_version_from_arm(item, self.registry.as_deref())),
                );
            }
            let Some(next) = page.get("nextLink").and_then(|n| n.as_str()).map(str::to_string) else {
                break;
            };
            let resp = self.send(Method::GET, &next, None, false).await?;
            if !resp.status().is_success() {
                return Err(Self::error_for(Method::GET, &next, resp).await);
            }
            page = Self::decode(&next, resp).await?;
        }
        Ok(versions)
    }

    async fn get_model_version(&self, name: &str, version: &str) -> Result<Option<ModelVersion>> {
        let url = format!("{}/{version}", self.models_url(name));
        Ok(self
            .get_json(&url)
            .await?
            .and_then(|v| wire::model_version_from_arm(&v, self.registry.as_deref())))
    }

    async fn create_or_update_model_version(&self, model: &ModelVersion) -> Result<ModelVersion> {
        let url = format!("{}/{}", self.models_url(&model.name), model.version);
        let body = wire::model_version_body(model);
        let resp = self.send(Method::PUT, &url, Some(&body), true).await?;
        if !resp.status().is_success() {
            return Err(Self::error_for(Method::PUT, &url, resp).await);
        }
        let v = Self::decode(&url, resp).await?;
        Ok(wire::model_version_from_arm(&v, self.registry.as_deref()).unwrap_or_else(|| model.clone()))
    }

    async fn wait(&self, op: Operation) -> Result<()> {
        let Some(url) = op.status_url.clone() else {
            return Ok(());
        };
        let deadline = Instant::now() + self.poll_timeout;
        loop {
            if Instant::now() >= deadline {
                return Err(ControlPlaneError::Timeout {
                    description: op.description,
                    timeout: self.poll_timeout,
                });
            }
            tokio::time::sleep(op.poll_interval).await;
            if self.poll_once(&op, &url).await? {
                tracing::info!(operation = %op.description, "completed");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use amlops_common::AuthMode;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, HeaderValue, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use chrono::Utc;

    use crate::credential::{AccessToken, CredentialError};

    struct StaticCredential;

    #[async_trait]
    impl TokenCredential for StaticCredential {
        fn name(&self) -> &'static str {
            "StaticCredential"
        }

        async fn get_token(&self, _scope: &str) -> std::result::Result<AccessToken, CredentialError> {
            Ok(AccessToken {
                token: "test-token".to_string(),
                expires_on: Utc::now() + chrono::Duration::hours(1),
            })
        }
    }

    #[derive(Clone)]
    struct Fake {
        base: String,
        polls: Arc<AtomicU32>,
        fail_operation: bool,
    }

    const WS: &str = "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.MachineLearningServices/workspaces/ws";

    async fn workspace(headers: HeaderMap) -> impl IntoResponse {
        assert_eq!(
            headers.get("authorization").and_then(|v| v.to_str().ok()),
            Some("Bearer test-token")
        );
        Json(json!({ "name": "ws", "location": "westeurope" }))
    }

    async fn get_endpoint(Path(name): Path<String>) -> impl IntoResponse {
        if name != "existing" {
            return (AxumStatus::NOT_FOUND, Json(json!({"error": {"message": "not found"}})));
        }
        (
            AxumStatus::OK,
            Json(json!({
                "name": "existing",
                "properties": {
                    "authMode": "Key",
                    "traffic": { "blue": 100 },
                    "scoringUri": "https://existing.westeurope.inference.ml.azure.com/score"
                }
            })),
        )
    }

    async fn put_endpoint(
        State(fake): State<Fake>,
        Path(name): Path<String>,
        Json(body): Json<Value>,
    ) -> impl IntoResponse {
        assert_eq!(body["location"], "westeurope");
        let mut headers = HeaderMap::new();
        let op = format!("{}/operations/{name}", fake.base);
        headers.insert("azure-asyncoperation", HeaderValue::from_str(&op).unwrap());
        headers.insert("retry-after", HeaderValue::from_static("0"));
        (AxumStatus::CREATED, headers, Json(body))
    }

    async fn operation(State(fake): State<Fake>) -> impl IntoResponse {
        let n = fake.polls.fetch_add(1, Ordering::SeqCst);
        if n < 2 {
            return Json(json!({ "status": "InProgress" }));
        }
        if fake.fail_operation {
            Json(json!({ "status": "Failed", "error": { "message": "image build failed" } }))
        } else {
            Json(json!({ "status": "Succeeded" }))
        }
    }

    async fn model_versions(State(fake): State<Fake>) -> impl IntoResponse {
        Json(json!({
            "value": [
                { "id": format!("{WS}/models/bert/versions/1"), "name": "1", "properties": {} },
                { "id": format!("{WS}/models/bert/versions/4"), "name": "4", "properties": {} }
            ],
            "nextLink": format!("{}/page2", fake.base)
        }))
    }

    async fn page2() -> impl IntoResponse {
        Json(json!({
            "value": [ { "id": format!("{WS}/models/bert/versions/candidate"), "name": "candidate" } ]
        }))
    }

    async fn logs(Json(body): Json<Value>) -> impl IntoResponse {
        assert_eq!(body["containerType"], "InferenceServer");
        Json(json!({ "content": format!("tail {}", body["tail"]) }))
    }

    async fn serve(fail_operation: bool) -> (ArmControlPlane, Arc<AtomicU32>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let polls = Arc::new(AtomicU32::new(0));
        let fake = Fake {
            base: base.clone(),
            polls: polls.clone(),
            fail_operation,
        };
        let app = Router::new()
            .route(WS, get(workspace))
            .route(
                &format!("{WS}/onlineEndpoints/:name"),
                get(get_endpoint).put(put_endpoint),
            )
            .route("/operations/:name", get(operation))
            .route(&format!("{WS}/models/bert/versions"), get(model_versions))
            .route("/page2", get(page2))
            .route(
                &format!("{WS}/onlineEndpoints/:ep/deployments/:dep/getLogs"),
                post(logs),
            )
            .with_state(fake);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let ws = WorkspaceConfig {
            subscription_id: "sub".to_string(),
            resource_group: "rg".to_string(),
            workspace_name: "ws".to_string(),
        };
        let cp = ArmControlPlane::new(ws, Arc::new(StaticCredential), reqwest::Client::new())
            .with_base_url(base)
            .with_poll_timeout(Duration::from_secs(10));
        (cp, polls)
    }

    #[tokio::test]
    async fn test_get_online_endpoint_maps_404_to_none() {
        let (cp, _) = serve(false).await;
        assert!(cp.get_online_endpoint("missing").await.unwrap().is_none());
        let ep = cp.get_online_endpoint("existing").await.unwrap().unwrap();
        assert_eq!(ep.traffic.get("blue"), Some(&100));
        assert_eq!(ep.auth_mode, AuthMode::Key);
    }

    #[tokio::test]
    async fn test_create_endpoint_polls_until_succeeded() {
        let (cp, polls) = serve(false).await;
        let op = cp
            .begin_create_or_update_online_endpoint(&OnlineEndpoint::new("fresh", AuthMode::Key))
            .await
            .unwrap();
        assert!(!op.is_completed());
        assert_eq!(op.poll_interval, Duration::ZERO);
        cp.wait(op).await.unwrap();
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_operation_carries_message() {
        let (cp, _) = serve(true).await;
        let op = cp
            .begin_create_or_update_online_endpoint(&OnlineEndpoint::new("fresh", AuthMode::Key))
            .await
            .unwrap();
        match cp.wait(op).await {
            Err(ControlPlaneError::OperationFailed { status, message, .. }) => {
                assert_eq!(status, "Failed");
                assert_eq!(message, "image build failed");
            }
            other => panic!("expected failed operation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_model_versions_follow_next_link() {
        let (cp, _) = serve(false).await;
        let versions = cp.list_model_versions("bert").await.unwrap();
        let names: Vec<_> = versions.iter().map(|m| m.version.as_str()).collect();
        assert_eq!(names, vec!["1", "4", "candidate"]);
        assert!(versions.iter().all(|m| m.name == "bert"));
    }

    #[tokio::test]
    async fn test_deployment_logs() {
        let (cp, _) = serve(false).await;
        assert_eq!(
            cp.get_deployment_logs("existing", "blue", 50).await.unwrap(),
            "tail 50"
        );
    }
}
