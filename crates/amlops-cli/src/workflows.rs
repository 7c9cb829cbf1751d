//! Provisioning flows built on [`ControlPlane`].
//!
//! Every create-or-update is awaited before the next step starts, so a flow
//! that returns `Ok` leaves the workspace in its final state.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{error, info};

use amlops_common::{
    AuthMode, BatchDeployment, BatchEndpoint, CodeConfiguration, DeploymentConfig, ModelVersion,
    OnlineDeployment, OnlineEndpoint, OnlineRequestSettings, DEPLOYMENT_CONFIG_ENV,
    MAX_REQUEST_TIMEOUT_MS,
};
use amlops_control::{register_model, resolve_latest_model, ControlPlane, ControlPlaneError};

/// Log lines fetched from a deployment that failed to come up.
pub const FAILURE_LOG_LINES: u32 = 100_000;

/// A deployment did not reach a healthy state.
#[derive(Debug, thiserror::Error)]
#[error("deployment {deployment} on endpoint {endpoint} failed: {source}")]
pub struct DeploymentFailed {
    pub endpoint: String,
    pub deployment: String,
    /// Container log tail, when it could be fetched.
    pub logs: Option<String>,
    #[source]
    pub source: ControlPlaneError,
}

pub async fn ensure_batch_endpoint(
    cp: &dyn ControlPlane,
    name: &str,
    auth_mode: Option<AuthMode>,
) -> Result<BatchEndpoint> {
    if let Some(existing) = cp.get_batch_endpoint(name).await? {
        info!(endpoint = name, "batch endpoint already exists");
        return Ok(existing);
    }
    info!(endpoint = name, "creating batch endpoint");
    let mut endpoint = BatchEndpoint::new(name);
    endpoint.auth_mode = auth_mode;
    let op = cp.begin_create_or_update_batch_endpoint(&endpoint).await?;
    cp.wait(op).await?;
    cp.get_batch_endpoint(name)
        .await?
        .with_context(|| format!("batch endpoint {name} vanished after creation"))
}

/// Returns the endpoint called `template.name`, creating it from `template`
/// when it does not exist yet.
pub async fn ensure_online_endpoint(
    cp: &dyn ControlPlane,
    template: OnlineEndpoint,
) -> Result<OnlineEndpoint> {
    if let Some(existing) = cp.get_online_endpoint(&template.name).await? {
        info!(endpoint = %template.name, "online endpoint already exists");
        return Ok(existing);
    }
    info!(endpoint = %template.name, auth_mode = %template.auth_mode, "creating online endpoint");
    let op = cp.begin_create_or_update_online_endpoint(&template).await?;
    cp.wait(op).await?;
    cp.get_online_endpoint(&template.name)
        .await?
        .with_context(|| format!("online endpoint {} vanished after creation", template.name))
}

/// Creates the deployment, then makes it the endpoint's default.
pub async fn create_batch_deployment(
    cp: &dyn ControlPlane,
    deployment: &BatchDeployment,
) -> Result<BatchEndpoint> {
    ensure_batch_endpoint(cp, &deployment.endpoint_name, None).await?;

    info!(deployment = %deployment.name, endpoint = %deployment.endpoint_name, "creating batch deployment");
    let op = cp.begin_create_or_update_batch_deployment(deployment).await?;
    cp.wait(op).await?;

    let mut endpoint = cp
        .get_batch_endpoint(&deployment.endpoint_name)
        .await?
        .with_context(|| format!("batch endpoint {} not found", deployment.endpoint_name))?;
    endpoint.defaults.deployment_name = Some(deployment.name.clone());
    let op = cp.begin_create_or_update_batch_endpoint(&endpoint).await?;
    cp.wait(op).await?;
    info!(deployment = %deployment.name, "set as default batch deployment");
    Ok(endpoint)
}

/// Creates the deployment and replaces the endpoint's traffic with
/// `traffic_allocation` percent to it.
pub async fn create_online_deployment(
    cp: &dyn ControlPlane,
    deployment: &OnlineDeployment,
    auth_mode: AuthMode,
    traffic_allocation: u8,
) -> Result<OnlineEndpoint> {
    if traffic_allocation > 100 {
        bail!("traffic allocation must be between 0 and 100, got {traffic_allocation}");
    }
    ensure_online_endpoint(cp, OnlineEndpoint::new(&deployment.endpoint_name, auth_mode)).await?;

    info!(deployment = %deployment.name, endpoint = %deployment.endpoint_name, "creating online deployment");
    submit_online_deployment(cp, deployment).await?;

    route_traffic(cp, &deployment.endpoint_name, &deployment.name, traffic_allocation).await
}

/// Inputs of the end-to-end `deploy` flow.
#[derive(Debug, Clone)]
pub struct DeployPlan {
    pub model_name: String,
    /// Registers this artifact as a new version instead of resolving the
    /// latest one.
    pub model_artifact_uri: Option<String>,
    pub endpoint_name: String,
    pub deployment_name: String,
    pub environment: Option<String>,
    pub code: Option<CodeConfiguration>,
    pub instance_type: String,
    pub instance_count: u32,
    pub request_settings: OnlineRequestSettings,
    pub config: DeploymentConfig,
}

impl DeployPlan {
    pub fn validate(&self) -> Result<()> {
        let timeout = self.request_settings.request_timeout_ms;
        if timeout == 0 || timeout > MAX_REQUEST_TIMEOUT_MS {
            bail!("request timeout must be between 1 and {MAX_REQUEST_TIMEOUT_MS} ms, got {timeout}");
        }
        if self.instance_count == 0 {
            bail!("instance count must be at least 1");
        }
        Ok(())
    }

    fn online_deployment(&self, model: &ModelVersion) -> OnlineDeployment {
        let mut environment_variables = BTreeMap::new();
        environment_variables.insert(DEPLOYMENT_CONFIG_ENV.to_string(), self.config.to_json());
        OnlineDeployment {
            name: self.deployment_name.clone(),
            endpoint_name: self.endpoint_name.clone(),
            model: model.asset_id(),
            code_configuration: self.code.clone(),
            environment: self.environment.as_deref().map(environment_ref),
            environment_variables,
            instance_type: self.instance_type.clone(),
            instance_count: self.instance_count,
            request_settings: Some(self.request_settings),
        }
    }
}

fn environment_ref(env: &str) -> String {
    if env.starts_with("azureml:") || env.starts_with('/') {
        env.to_string()
    } else {
        format!("azureml:{env}")
    }
}

/// Resolves (or registers) the model, deploys it behind a key-authenticated
/// endpoint and sends all traffic to the new deployment.
pub async fn deploy(cp: &dyn ControlPlane, plan: &DeployPlan) -> Result<OnlineEndpoint> {
    plan.validate()?;

    let model = match &plan.model_artifact_uri {
        Some(uri) => register_model(
            cp,
            &plan.model_name,
            uri,
            Some(format!("registered by amlops deploy on {}", Utc::now().to_rfc3339())),
        )
        .await
        .with_context(|| format!("registering model {}", plan.model_name))?,
        None => resolve_latest_model(cp, &plan.model_name)
            .await
            .with_context(|| format!("resolving model {}", plan.model_name))?,
    };
    info!(model = %model.name, version = %model.version, "deploying model");

    let mut template = OnlineEndpoint::new(&plan.endpoint_name, AuthMode::Key);
    template.description = Some(format!(
        "endpoint created on {}",
        Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
    ));
    template.tags.insert("model".to_string(), model.name.clone());
    template.tags.insert("version".to_string(), model.version.clone());
    ensure_online_endpoint(cp, template).await?;

    let deployment = plan.online_deployment(&model);
    info!(deployment = %deployment.name, endpoint = %deployment.endpoint_name, "creating online deployment");
    submit_online_deployment(cp, &deployment).await?;

    let endpoint = route_traffic(cp, &plan.endpoint_name, &plan.deployment_name, 100).await?;
    match &endpoint.scoring_uri {
        Some(uri) => info!(scoring_uri = %uri, "endpoint is serving"),
        None => info!(endpoint = %endpoint.name, "endpoint has no scoring uri yet"),
    }
    Ok(endpoint)
}

/// Submits and awaits an online deployment. On failure the container log
/// is fetched and attached to the returned [`DeploymentFailed`].
async fn submit_online_deployment(cp: &dyn ControlPlane, deployment: &OnlineDeployment) -> Result<()> {
    let outcome = match cp.begin_create_or_update_online_deployment(deployment).await {
        Ok(op) => cp.wait(op).await,
        Err(e) => Err(e),
    };
    let Err(source) = outcome else {
        return Ok(());
    };

    error!(deployment = %deployment.name, error = %source, "deployment failed, fetching logs");
    let logs = match cp
        .get_deployment_logs(&deployment.endpoint_name, &deployment.name, FAILURE_LOG_LINES)
        .await
    {
        Ok(logs) => {
            error!(deployment = %deployment.name, "deployment logs:\n{logs}");
            Some(logs)
        }
        Err(e) => {
            error!(deployment = %deployment.name, error = %e, "could not fetch deployment logs");
            None
        }
    };
    Err(DeploymentFailed {
        endpoint: deployment.endpoint_name.clone(),
        deployment: deployment.name.clone(),
        logs,
        source,
    }
    .into())
}

async fn route_traffic(
    cp: &dyn ControlPlane,
    endpoint_name: &str,
    deployment_name: &str,
    percent: u8,
) -> Result<OnlineEndpoint> {
    let mut endpoint = cp
        .get_online_endpoint(endpoint_name)
        .await?
        .with_context(|| format!("online endpoint {endpoint_name} not found"))?;
    endpoint.traffic = BTreeMap::from([(deployment_name.to_string(), percent)]);
    let op = cp.begin_create_or_update_online_endpoint(&endpoint).await?;
    cp.wait(op).await?;
    info!(endpoint = endpoint_name, deployment = deployment_name, percent, "traffic updated");

    Ok(cp.get_online_endpoint(endpoint_name).await?.unwrap_or(endpoint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use amlops_common::WorkspaceConfig;
    use amlops_control::{
        AccessToken, ArmControlPlane, CredentialError, MemoryControlPlane, TokenCredential,
    };
    use async_trait::async_trait;
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{Method, StatusCode, Uri};
    use axum::response::{IntoResponse, Response};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use tokio::sync::Mutex;

    fn plan() -> DeployPlan {
        DeployPlan {
            model_name: "inferencemodel".to_string(),
            model_artifact_uri: None,
            endpoint_name: "inference-end-point".to_string(),
            deployment_name: "blue".to_string(),
            environment: Some("gllm-env:3".to_string()),
            code: None,
            instance_type: "Standard_F8s_v2".to_string(),
            instance_count: 1,
            request_settings: OnlineRequestSettings::default(),
            config: DeploymentConfig::new("model"),
        }
    }

    async fn seed_model(cp: &MemoryControlPlane, version: &str) {
        cp.create_or_update_model_version(&ModelVersion {
            name: "inferencemodel".to_string(),
            version: version.to_string(),
            path: Some("azureml://datastores/workspaceblobstore/paths/model".to_string()),
            description: None,
            model_type: "custom_model".to_string(),
            registry: None,
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_deploy_end_to_end() {
        let cp = MemoryControlPlane::new();
        seed_model(&cp, "1").await;
        seed_model(&cp, "3").await;

        let endpoint = deploy(&cp, &plan()).await.unwrap();
        assert_eq!(endpoint.auth_mode, AuthMode::Key);
        assert_eq!(endpoint.traffic.get("blue"), Some(&100));
        assert_eq!(endpoint.tags["model"], "inferencemodel");
        assert_eq!(endpoint.tags["version"], "3");
        assert!(endpoint
            .description
            .as_deref()
            .unwrap()
            .starts_with("endpoint created on "));
        assert!(endpoint.scoring_uri.is_some());

        let deployment = cp
            .online_deployment("inference-end-point", "blue")
            .await
            .unwrap();
        assert_eq!(deployment.model, "azureml:inferencemodel:3");
        assert_eq!(deployment.environment.as_deref(), Some("azureml:gllm-env:3"));
        let blob = &deployment.environment_variables[DEPLOYMENT_CONFIG_ENV];
        assert_eq!(
            DeploymentConfig::from_json(blob).unwrap(),
            DeploymentConfig::new("model")
        );

        let journal = cp.journal().await;
        let tail: Vec<&str> = journal.iter().map(String::as_str).skip(2).collect();
        assert_eq!(
            tail,
            [
                "online_endpoint:put:inference-end-point",
                "online_deployment:put:inference-end-point/blue",
                "online_endpoint:put:inference-end-point",
            ]
        );
    }

    #[tokio::test]
    async fn test_deploy_registers_new_version_when_artifact_given() {
        let cp = MemoryControlPlane::new();
        seed_model(&cp, "4").await;
        let mut plan = plan();
        plan.model_artifact_uri = Some("azureml://datastores/blob/paths/run42/model".to_string());

        deploy(&cp, &plan).await.unwrap();
        let deployment = cp
            .online_deployment("inference-end-point", "blue")
            .await
            .unwrap();
        assert_eq!(deployment.model, "azureml:inferencemodel:5");
    }

    #[tokio::test]
    async fn test_deploy_without_registered_model_fails() {
        let cp = MemoryControlPlane::new();
        let err = deploy(&cp, &plan()).await.unwrap_err();
        assert!(format!("{err:#}").contains("inferencemodel"));
        assert!(cp.journal().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_deployment_carries_logs() {
        let cp = MemoryControlPlane::new();
        seed_model(&cp, "1").await;
        cp.fail_deployment("blue", "container crashed").await;
        cp.set_logs("inference-end-point", "blue", "loading model\nKilled")
            .await;

        let err = deploy(&cp, &plan()).await.unwrap_err();
        let failed = err.downcast_ref::<DeploymentFailed>().unwrap();
        assert_eq!(failed.deployment, "blue");
        assert_eq!(failed.logs.as_deref(), Some("loading model\nKilled"));
        assert!(failed.to_string().contains("container crashed"));

        // traffic never moves to a failed deployment
        let endpoint = cp
            .get_online_endpoint("inference-end-point")
            .await
            .unwrap()
            .unwrap();
        assert!(endpoint.traffic.is_empty());
    }

    #[tokio::test]
    async fn test_deploy_rejects_excessive_timeout() {
        let cp = MemoryControlPlane::new();
        seed_model(&cp, "1").await;
        let mut plan = plan();
        plan.request_settings.request_timeout_ms = MAX_REQUEST_TIMEOUT_MS + 1;
        assert!(deploy(&cp, &plan).await.is_err());
        assert_eq!(cp.journal().await.len(), 1);
    }

    #[tokio::test]
    async fn test_existing_endpoint_is_reused() {
        let cp = MemoryControlPlane::new();
        let mut existing = OnlineEndpoint::new("ep", AuthMode::AadToken);
        existing.description = Some("hand made".to_string());
        cp.begin_create_or_update_online_endpoint(&existing)
            .await
            .unwrap();

        let got = ensure_online_endpoint(&cp, OnlineEndpoint::new("ep", AuthMode::Key))
            .await
            .unwrap();
        assert_eq!(got.auth_mode, AuthMode::AadToken);
        assert_eq!(got.description.as_deref(), Some("hand made"));
        assert_eq!(cp.journal().await.len(), 1);
    }

    #[tokio::test]
    async fn test_online_deployment_replaces_traffic() {
        let cp = MemoryControlPlane::new();
        let deployment = |name: &str| OnlineDeployment {
            name: name.to_string(),
            endpoint_name: "ep".to_string(),
            model: "azureml:bert:1".to_string(),
            code_configuration: None,
            environment: None,
            environment_variables: BTreeMap::new(),
            instance_type: "Standard_DS2_v2".to_string(),
            instance_count: 1,
            request_settings: None,
        };

        let endpoint = create_online_deployment(&cp, &deployment("blue"), AuthMode::AmlToken, 100)
            .await
            .unwrap();
        assert_eq!(endpoint.auth_mode, AuthMode::AmlToken);
        assert_eq!(endpoint.traffic, BTreeMap::from([("blue".to_string(), 100)]));

        let endpoint = create_online_deployment(&cp, &deployment("green"), AuthMode::AmlToken, 20)
            .await
            .unwrap();
        assert_eq!(endpoint.traffic, BTreeMap::from([("green".to_string(), 20)]));
    }

    #[tokio::test]
    async fn test_batch_deployment_becomes_default() {
        let cp = MemoryControlPlane::new();
        let deployment = BatchDeployment {
            name: "b1".to_string(),
            endpoint_name: "bep".to_string(),
            model: "azureml:bert:1".to_string(),
            compute: "cpu-cluster".to_string(),
            instance_count: 2,
            max_concurrency_per_instance: 4,
            mini_batch_size: 32,
            output_action: Default::default(),
            output_file_name: "predictions.csv".to_string(),
        };

        let endpoint = create_batch_deployment(&cp, &deployment).await.unwrap();
        assert_eq!(endpoint.defaults.deployment_name.as_deref(), Some("b1"));
        assert!(cp.batch_deployment("bep", "b1").await.is_some());
        assert_eq!(
            cp.journal().await,
            [
                "batch_endpoint:put:bep",
                "batch_deployment:put:bep/b1",
                "batch_endpoint:put:bep",
            ]
        );
    }

    #[tokio::test]
    async fn test_batch_deployment_failure_leaves_default_untouched() {
        let cp = MemoryControlPlane::new();
        cp.fail_deployment("b2", "quota exceeded").await;
        let deployment = BatchDeployment {
            name: "b2".to_string(),
            endpoint_name: "bep".to_string(),
            model: "azureml:bert:1".to_string(),
            compute: "cpu-cluster".to_string(),
            instance_count: 2,
            max_concurrency_per_instance: 4,
            mini_batch_size: 32,
            output_action: Default::default(),
            output_file_name: "predictions.csv".to_string(),
        };
        assert!(create_batch_deployment(&cp, &deployment).await.is_err());
        let endpoint = cp.get_batch_endpoint("bep").await.unwrap().unwrap();
        assert!(endpoint.defaults.deployment_name.is_none());
    }

    const WS: &str = "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.MachineLearningServices/workspaces/ws";
    const UAI: &str = "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.ManagedIdentity/userAssignedIdentities/scorer";

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

    /// Resource manager stand-in: a PUT replaces the whole resource, a GET
    /// returns what was last stored.
    type Resources = Arc<Mutex<HashMap<String, Value>>>;

    async fn fake_arm(
        State(resources): State<Resources>,
        method: Method,
        uri: Uri,
        body: Bytes,
    ) -> Response {
        let path = uri.path().to_string();
        if path == WS {
            return Json(json!({ "name": "ws", "location": "eastus" })).into_response();
        }
        let mut resources = resources.lock().await;
        match method {
            Method::GET => match resources.get(&path) {
                Some(v) => Json(v.clone()).into_response(),
                None => StatusCode::NOT_FOUND.into_response(),
            },
            Method::PUT => {
                let mut stored: Value = serde_json::from_slice(&body).unwrap();
                stored["name"] = json!(path.rsplit('/').next().unwrap());
                resources.insert(path, stored.clone());
                Json(stored).into_response()
            }
            _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        }
    }

    async fn serve_arm(seed: Vec<(String, Value)>) -> (ArmControlPlane, Resources) {
        let resources: Resources = Arc::new(Mutex::new(seed.into_iter().collect()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let app = Router::new().fallback(fake_arm).with_state(resources.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let ws = WorkspaceConfig {
            subscription_id: "sub".to_string(),
            resource_group: "rg".to_string(),
            workspace_name: "ws".to_string(),
        };
        let cp = ArmControlPlane::new(ws, Arc::new(StaticCredential), reqwest::Client::new())
            .with_base_url(base);
        (cp, resources)
    }

    #[tokio::test]
    async fn test_traffic_update_keeps_identity_and_tags_over_arm() {
        let path = format!("{WS}/onlineEndpoints/ep");
        let existing = json!({
            "name": "ep",
            "location": "eastus",
            "identity": {
                "type": "UserAssigned",
                "userAssignedIdentities": { UAI: { "principalId": "p-1", "clientId": "c-1" } }
            },
            "tags": { "team": "nlp" },
            "properties": {
                "authMode": "AADToken",
                "description": "hand made",
                "traffic": { "green": 100 }
            }
        });
        let (cp, resources) = serve_arm(vec![(path.clone(), existing)]).await;

        let deployment = OnlineDeployment {
            name: "blue".to_string(),
            endpoint_name: "ep".to_string(),
            model: "azureml:bert:1".to_string(),
            code_configuration: None,
            environment: None,
            environment_variables: BTreeMap::new(),
            instance_type: "Standard_DS2_v2".to_string(),
            instance_count: 1,
            request_settings: None,
        };
        let endpoint = create_online_deployment(&cp, &deployment, AuthMode::Key, 100)
            .await
            .unwrap();
        assert_eq!(endpoint.traffic, BTreeMap::from([("blue".to_string(), 100)]));

        let stored = resources.lock().await[&path].clone();
        assert_eq!(stored["identity"]["type"], "UserAssigned");
        assert!(stored["identity"]["userAssignedIdentities"].get(UAI).is_some());
        assert_eq!(stored["tags"], json!({ "team": "nlp" }));
        assert_eq!(stored["properties"]["authMode"], "AADToken");
        assert_eq!(stored["properties"]["description"], "hand made");
        assert_eq!(stored["properties"]["traffic"], json!({ "blue": 100 }));
    }

    #[tokio::test]
    async fn test_batch_default_update_keeps_tags_over_arm() {
        let path = format!("{WS}/batchEndpoints/bep");
        let existing = json!({
            "name": "bep",
            "location": "eastus",
            "identity": { "type": "SystemAssigned", "principalId": "p-2" },
            "tags": { "team": "nlp", "cost-center": "42" },
            "properties": { "authMode": "AADToken", "description": "nightly scoring" }
        });
        let (cp, resources) = serve_arm(vec![(path.clone(), existing)]).await;

        let deployment = BatchDeployment {
            name: "b1".to_string(),
            endpoint_name: "bep".to_string(),
            model: "azureml:bert:1".to_string(),
            compute: "cpu-cluster".to_string(),
            instance_count: 2,
            max_concurrency_per_instance: 4,
            mini_batch_size: 32,
            output_action: Default::default(),
            output_file_name: "predictions.csv".to_string(),
        };
        let endpoint = create_batch_deployment(&cp, &deployment).await.unwrap();
        assert_eq!(endpoint.defaults.deployment_name.as_deref(), Some("b1"));

        let resources = resources.lock().await;
        let stored = &resources[&path];
        assert_eq!(stored["tags"], json!({ "team": "nlp", "cost-center": "42" }));
        assert_eq!(stored["identity"], json!({ "type": "SystemAssigned" }));
        assert_eq!(stored["properties"]["description"], "nightly scoring");
        assert_eq!(stored["properties"]["defaults"]["deploymentName"], "b1");
        assert!(resources.contains_key(&format!("{path}/deployments/b1")));
    }
}
