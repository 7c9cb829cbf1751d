use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use amlops_common::{DeploymentConfig, PredictorKind, PredictorSettings};

use crate::encode::Prediction;

/// One staged upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInput {
    pub file: PathBuf,
}

/// Decoded request handed to the prediction service.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelInput {
    Json(Value),
    /// Uploads in the order they appeared in the request.
    Files(Vec<FileInput>),
}

impl ModelInput {
    /// `Files` renders as `[{"file": "<path>"}, ...]`.
    pub fn to_json(&self) -> Value {
        match self {
            ModelInput::Json(v) => v.clone(),
            ModelInput::Files(files) => Value::Array(
                files
                    .iter()
                    .map(|f| serde_json::json!({ "file": f.file.to_string_lossy() }))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
pub trait PredictionService: Send + Sync {
    /// Runs once before the first request. May take a long time.
    async fn prepare(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn predict(&self, input: ModelInput) -> anyhow::Result<Prediction>;
}

/// Builds the process's prediction service from the deployment configuration.
pub trait PredictorFactory: Send + Sync {
    fn build(&self, config: &DeploymentConfig) -> anyhow::Result<Box<dyn PredictionService>>;
}

impl<F> PredictorFactory for F
where
    F: Fn(&DeploymentConfig) -> anyhow::Result<Box<dyn PredictionService>> + Send + Sync,
{
    fn build(&self, config: &DeploymentConfig) -> anyhow::Result<Box<dyn PredictionService>> {
        self(config)
    }
}

/// Selects a built-in service by `predictor.kind`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinPredictors;

impl PredictorFactory for BuiltinPredictors {
    fn build(&self, config: &DeploymentConfig) -> anyhow::Result<Box<dyn PredictionService>> {
        match config.predictor.kind {
            PredictorKind::Echo => Ok(Box::new(EchoPredictor::new())),
            PredictorKind::Http => Ok(Box::new(HttpPredictor::new(&config.predictor)?)),
        }
    }
}

/// Returns its input. Useful as a smoke test of a deployment.
#[derive(Debug, Default, Clone)]
pub struct EchoPredictor {}

impl EchoPredictor {
    pub fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl PredictionService for EchoPredictor {
    async fn predict(&self, input: ModelInput) -> anyhow::Result<Prediction> {
        Ok(Prediction::Json(input.to_json()))
    }
}

const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Forwards inputs to a model server running next to the scoring server.
///
/// JSON inputs are posted as-is; staged files are sent as a multipart form
/// with one `file` part per upload.
#[derive(Debug, Clone)]
pub struct HttpPredictor {
    base_url: String,
    health_path: String,
    predict_path: String,
    ready_timeout: Duration,
    http: reqwest::Client,
}

impl HttpPredictor {
    pub fn new(settings: &PredictorSettings) -> anyhow::Result<Self> {
        let Some(base_url) = settings.upstream_url.as_deref() else {
            bail!("predictor.upstream_url is required for the http predictor");
        };
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            health_path: settings.health_path.clone(),
            predict_path: settings.predict_path.clone(),
            ready_timeout: Duration::from_secs(settings.ready_timeout_secs),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn multipart(files: &[FileInput]) -> anyhow::Result<reqwest::multipart::Form> {
        let mut form = reqwest::multipart::Form::new();
        for f in files {
            let data = tokio::fs::read(&f.file)
                .await
                .with_context(|| format!("failed to read staged file {}", f.file.display()))?;
            let name = f
                .file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            form = form.part("file", reqwest::multipart::Part::bytes(data).file_name(name));
        }
        Ok(form)
    }
}

#[async_trait]
impl PredictionService for HttpPredictor {
    async fn prepare(&mut self) -> anyhow::Result<()> {
        let url = self.url(&self.health_path);
        let deadline = tokio::time::Instant::now() + self.ready_timeout;
        loop {
            match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::info!(url=%url, "model server is ready");
                    return Ok(());
                }
                Ok(resp) => tracing::debug!(url=%url, status=%resp.status(), "model server not ready"),
                Err(e) => tracing::debug!(url=%url, error=%e, "model server not reachable"),
            }
            if tokio::time::Instant::now() >= deadline {
                bail!(
                    "model server at {url} not ready after {}s",
                    self.ready_timeout.as_secs()
                );
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn predict(&self, input: ModelInput) -> anyhow::Result<Prediction> {
        let url = self.url(&self.predict_path);
        let req = match &input {
            ModelInput::Json(v) => self.http.post(&url).json(v),
            ModelInput::Files(files) => self.http.post(&url).multipart(Self::multipart(files).await?),
        };
        let resp = req
            .send()
            .await
            .with_context(|| format!("model server request to {url} failed"))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("model server returned {status}: {text}");
        }
        let body: Value = resp
            .json()
            .await
            .context("model server returned a non-JSON body")?;
        Ok(Prediction::Json(body))
    }
}
