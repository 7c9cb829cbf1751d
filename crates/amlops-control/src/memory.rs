use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use amlops_common::{BatchDeployment, BatchEndpoint, ModelVersion, OnlineDeployment, OnlineEndpoint};

use crate::types::{ControlPlane, ControlPlaneError, Operation, Result};

/// In-process control plane. Operations complete synchronously.
#[derive(Debug, Clone, Default)]
pub struct MemoryControlPlane {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    batch_endpoints: BTreeMap<String, BatchEndpoint>,
    online_endpoints: BTreeMap<String, OnlineEndpoint>,
    batch_deployments: BTreeMap<(String, String), BatchDeployment>,
    online_deployments: BTreeMap<(String, String), OnlineDeployment>,
    models: BTreeMap<(String, String), ModelVersion>,
    logs: BTreeMap<(String, String), String>,
    /// Deployment names whose create-or-update is rejected.
    failing_deployments: BTreeMap<String, String>,
    /// Every mutating call in order, e.g. `online_endpoint:put:ep`.
    journal: Vec<String>,
}

impl MemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes create-or-update of deployment `name` fail with `reason`.
    pub async fn fail_deployment(&self, name: &str, reason: &str) {
        let mut inner = self.inner.write().await;
        inner
            .failing_deployments
            .insert(name.to_string(), reason.to_string());
    }

    pub async fn set_logs(&self, endpoint_name: &str, deployment_name: &str, logs: &str) {
        let mut inner = self.inner.write().await;
        inner.logs.insert(
            (endpoint_name.to_string(), deployment_name.to_string()),
            logs.to_string(),
        );
    }

    pub async fn online_deployment(&self, endpoint_name: &str, name: &str) -> Option<OnlineDeployment> {
        let inner = self.inner.read().await;
        inner
            .online_deployments
            .get(&(endpoint_name.to_string(), name.to_string()))
            .cloned()
    }

    pub async fn batch_deployment(&self, endpoint_name: &str, name: &str) -> Option<BatchDeployment> {
        let inner = self.inner.read().await;
        inner
            .batch_deployments
            .get(&(endpoint_name.to_string(), name.to_string()))
            .cloned()
    }

    pub async fn journal(&self) -> Vec<String> {
        self.inner.read().await.journal.clone()
    }

    fn scoring_uri(name: &str) -> String {
        format!("https://{name}.local.inference.ml.azure.com/score")
    }
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn get_batch_endpoint(&self, name: &str) -> Result<Option<BatchEndpoint>> {
        Ok(self.inner.read().await.batch_endpoints.get(name).cloned())
    }

    async fn begin_create_or_update_batch_endpoint(&self, endpoint: &BatchEndpoint) -> Result<Operation> {
        let mut inner = self.inner.write().await;
        if let Some(default) = &endpoint.defaults.deployment_name {
            if !inner
                .batch_deployments
                .contains_key(&(endpoint.name.clone(), default.clone()))
            {
                return Err(ControlPlaneError::Rejected(format!(
                    "default deployment '{default}' does not exist on batch endpoint '{}'",
                    endpoint.name
                )));
            }
        }
        let mut stored = endpoint.clone();
        stored.scoring_uri = Some(Self::scoring_uri(&endpoint.name));
        inner.batch_endpoints.insert(endpoint.name.clone(), stored);
        inner.journal.push(format!("batch_endpoint:put:{}", endpoint.name));
        Ok(Operation::completed(format!("batch endpoint {}", endpoint.name)))
    }

    async fn get_online_endpoint(&self, name: &str) -> Result<Option<OnlineEndpoint>> {
        Ok(self.inner.read().await.online_endpoints.get(name).cloned())
    }

    async fn begin_create_or_update_online_endpoint(&self, endpoint: &OnlineEndpoint) -> Result<Operation> {
        let mut inner = self.inner.write().await;
        for deployment in endpoint.traffic.keys() {
            if !inner
                .online_deployments
                .contains_key(&(endpoint.name.clone(), deployment.clone()))
            {
                return Err(ControlPlaneError::Rejected(format!(
                    "traffic names unknown deployment '{deployment}' on endpoint '{}'",
                    endpoint.name
                )));
            }
        }
        let total: u32 = endpoint.traffic.values().map(|p| u32::from(*p)).sum();
        if total > 100 {
            return Err(ControlPlaneError::Rejected(format!(
                "traffic on endpoint '{}' sums to {total}%",
                endpoint.name
            )));
        }
        let mut stored = endpoint.clone();
        stored.scoring_uri = Some(Self::scoring_uri(&endpoint.name));
        inner.online_endpoints.insert(endpoint.name.clone(), stored);
        inner.journal.push(format!("online_endpoint:put:{}", endpoint.name));
        Ok(Operation::completed(format!("online endpoint {}", endpoint.name)))
    }

    async fn begin_create_or_update_batch_deployment(&self, deployment: &BatchDeployment) -> Result<Operation> {
        let mut inner = self.inner.write().await;
        if !inner.batch_endpoints.contains_key(&deployment.endpoint_name) {
            return Err(ControlPlaneError::NotFound(format!(
                "batch endpoint {}",
                deployment.endpoint_name
            )));
        }
        if let Some(reason) = inner.failing_deployments.get(&deployment.name) {
            return Err(ControlPlaneError::Rejected(reason.clone()));
        }
        inner.batch_deployments.insert(
            (deployment.endpoint_name.clone(), deployment.name.clone()),
            deployment.clone(),
        );
        inner.journal.push(format!(
            "batch_deployment:put:{}/{}",
            deployment.endpoint_name, deployment.name
        ));
        Ok(Operation::completed(format!("batch deployment {}", deployment.name)))
    }

    async fn begin_create_or_update_online_deployment(&self, deployment: &OnlineDeployment) -> Result<Operation> {
        let mut inner = self.inner.write().await;
        if !inner.online_endpoints.contains_key(&deployment.endpoint_name) {
            return Err(ControlPlaneError::NotFound(format!(
                "online endpoint {}",
                deployment.endpoint_name
            )));
        }
        if let Some(reason) = inner.failing_deployments.get(&deployment.name) {
            return Err(ControlPlaneError::Rejected(reason.clone()));
        }
        inner.online_deployments.insert(
            (deployment.endpoint_name.clone(), deployment.name.clone()),
            deployment.clone(),
        );
        inner.journal.push(format!(
            "online_deployment:put:{}/{}",
            deployment.endpoint_name, deployment.name
        ));
        Ok(Operation::completed(format!("online deployment {}", deployment.name)))
    }

    async fn get_deployment_logs(&self, endpoint_name: &str, deployment_name: &str, lines: u32) -> Result<String> {
        let inner = self.inner.read().await;
        let logs = inner
            .logs
            .get(&(endpoint_name.to_string(), deployment_name.to_string()))
            .ok_or_else(|| {
                ControlPlaneError::NotFound(format!("logs of {endpoint_name}/{deployment_name}"))
            })?;
        let all: Vec<&str> = logs.lines().collect();
        let start = all.len().saturating_sub(lines as usize);
        Ok(all[start..].join("\n"))
    }

    async fn list_model_versions(&self, name: &str) -> Result<Vec<ModelVersion>> {
        let inner = self.inner.read().await;
        Ok(inner
            .models
            .iter()
            .filter(|((n, _), _)| n == name)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn get_model_version(&self, name: &str, version: &str) -> Result<Option<ModelVersion>> {
        let inner = self.inner.read().await;
        Ok(inner
            .models
            .get(&(name.to_string(), version.to_string()))
            .cloned())
    }

    async fn create_or_update_model_version(&self, model: &ModelVersion) -> Result<ModelVersion> {
        let mut inner = self.inner.write().await;
        inner
            .models
            .insert((model.name.clone(), model.version.clone()), model.clone());
        inner
            .journal
            .push(format!("model:put:{}:{}", model.name, model.version));
        Ok(model.clone())
    }

    async fn wait(&self, _op: Operation) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amlops_common::AuthMode;

    #[tokio::test]
    async fn test_missing_endpoint_is_none() {
        let cp = MemoryControlPlane::new();
        assert!(cp.get_online_endpoint("nope").await.unwrap().is_none());
        assert!(cp.get_batch_endpoint("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_traffic_must_name_existing_deployments() {
        let cp = MemoryControlPlane::new();
        let mut ep = OnlineEndpoint::new("ep", AuthMode::Key);
        cp.begin_create_or_update_online_endpoint(&ep).await.unwrap();

        ep.traffic.insert("blue".to_string(), 100);
        let err = cp
            .begin_create_or_update_online_endpoint(&ep)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_logs_are_tailed() {
        let cp = MemoryControlPlane::new();
        cp.set_logs("ep", "blue", "a\nb\nc\nd").await;
        assert_eq!(cp.get_deployment_logs("ep", "blue", 2).await.unwrap(), "c\nd");
        assert_eq!(
            cp.get_deployment_logs("ep", "blue", 100).await.unwrap(),
            "a\nb\nc\nd"
        );
        assert!(cp.get_deployment_logs("ep", "green", 10).await.is_err());
    }
}
