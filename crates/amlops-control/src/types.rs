use std::time::Duration;

use async_trait::async_trait;

use amlops_common::{BatchDeployment, BatchEndpoint, ModelVersion, OnlineDeployment, OnlineEndpoint};

use crate::credential::CredentialError;

pub type Result<T> = std::result::Result<T, ControlPlaneError>;

#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    #[error("authentication failed: {0}")]
    Credential(#[from] CredentialError),

    #[error("{method} {url} returned {status}: {body}")]
    Http {
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected response from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{description} ended as {status}: {message}")]
    OperationFailed {
        description: String,
        status: String,
        message: String,
    },

    #[error("{description} did not finish within {timeout:?}")]
    Timeout {
        description: String,
        timeout: Duration,
    },

    #[error("{0}")]
    Rejected(String),
}

/// Handle to a submitted create-or-update.
///
/// `status_url` is `None` when the service finished synchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub description: String,
    pub status_url: Option<String>,
    pub poll_interval: Duration,
}

impl Operation {
    pub fn completed(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            status_url: None,
            poll_interval: Duration::ZERO,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status_url.is_none()
    }
}

/// Workspace-scoped view of the ML control plane.
///
/// Lookups return `Ok(None)` for resources that do not exist so callers can
/// express get-or-create without matching on errors.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn get_batch_endpoint(&self, name: &str) -> Result<Option<BatchEndpoint>>;
    async fn begin_create_or_update_batch_endpoint(&self, endpoint: &BatchEndpoint) -> Result<Operation>;

    async fn get_online_endpoint(&self, name: &str) -> Result<Option<OnlineEndpoint>>;
    async fn begin_create_or_update_online_endpoint(&self, endpoint: &OnlineEndpoint) -> Result<Operation>;

    async fn begin_create_or_update_batch_deployment(&self, deployment: &BatchDeployment) -> Result<Operation>;
    async fn begin_create_or_update_online_deployment(&self, deployment: &OnlineDeployment) -> Result<Operation>;

    /// Tail of the inference server container log of an online deployment.
    async fn get_deployment_logs(&self, endpoint_name: &str, deployment_name: &str, lines: u32) -> Result<String>;

    async fn list_model_versions(&self, name: &str) -> Result<Vec<ModelVersion>>;
    async fn get_model_version(&self, name: &str, version: &str) -> Result<Option<ModelVersion>>;
    async fn create_or_update_model_version(&self, model: &ModelVersion) -> Result<ModelVersion>;

    /// Blocks until `op` reaches a terminal state.
    async fn wait(&self, op: Operation) -> Result<()>;
}
