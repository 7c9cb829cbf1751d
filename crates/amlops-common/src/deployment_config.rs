use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Environment variable carrying the serialized [`DeploymentConfig`].
///
/// Written by the `deploy` workflow into the online deployment's environment
/// and read once by the scoring server at startup.
pub const DEPLOYMENT_CONFIG_ENV: &str = "AMLOPS_DEPLOYMENT_CONFIG";

/// Platform-assigned root directory of the mounted model artifacts.
pub const MODEL_DIR_ENV: &str = "AZUREML_MODEL_DIR";

#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),
    #[error("deployment configuration is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Which built-in prediction service the scoring server constructs.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PredictorKind {
    /// Returns the decoded inputs unchanged.
    #[default]
    Echo,
    /// Forwards inputs to a model server listening next to the scoring server.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictorSettings {
    #[serde(default)]
    pub kind: PredictorKind,

    /// Base URL of the model server. Required for `http`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_url: Option<String>,

    /// Path probed by `prepare` until it answers 2xx.
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Path inputs are posted to.
    #[serde(default = "default_predict_path")]
    pub predict_path: String,

    /// Upper bound on how long `prepare` waits for the model server.
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,

    /// Per-request timeout for forwarded predictions.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for PredictorSettings {
    fn default() -> Self {
        Self {
            kind: PredictorKind::default(),
            upstream_url: None,
            health_path: default_health_path(),
            predict_path: default_predict_path(),
            ready_timeout_secs: default_ready_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Inference settings handed from the `deploy` workflow to the scoring server.
///
/// Keys the struct does not name are kept in `extra` so that prediction
/// services can read their own settings without a schema change here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentConfig {
    /// Directory name the model artifacts were registered under.
    pub parent_dir_name: String,

    /// Resolved model artifact directory. Filled in by the scoring server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,

    #[serde(default)]
    pub apply_ort: bool,

    #[serde(default)]
    pub apply_deepspeed: bool,

    #[serde(default = "default_deepspeed_config")]
    pub deepspeed_config: String,

    /// 16 or 32.
    #[serde(default = "default_precision")]
    pub precision: u32,

    #[serde(default)]
    pub use_fp16: bool,

    #[serde(default)]
    pub local_rank: u32,

    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    #[serde(default)]
    pub predictor: PredictorSettings,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeploymentConfig {
    pub fn new(parent_dir_name: impl Into<String>) -> Self {
        Self {
            parent_dir_name: parent_dir_name.into(),
            model_path: None,
            apply_ort: false,
            apply_deepspeed: false,
            deepspeed_config: default_deepspeed_config(),
            precision: default_precision(),
            use_fp16: false,
            local_rank: 0,
            batch_size: default_batch_size(),
            output_dir: default_output_dir(),
            predictor: PredictorSettings::default(),
            extra: Map::new(),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigurationError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> String {
        // A struct of strings, numbers and a string-keyed map always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Resolves the model directory under `model_root` and records it.
    pub fn with_model_root(mut self, model_root: &Path) -> Self {
        self.model_path = Some(resolve_model_dir(model_root, &self.parent_dir_name));
        self
    }
}

/// Models registered through different paths land either directly in the
/// mounted root or one level below it under `parent_dir_name`.
pub fn resolve_model_dir(model_root: &Path, parent_dir_name: &str) -> PathBuf {
    let last = model_root.file_name().and_then(|n| n.to_str());
    if last == Some(parent_dir_name) {
        model_root.to_path_buf()
    } else {
        model_root.join(parent_dir_name)
    }
}

fn default_deepspeed_config() -> String {
    "./ds_config_zero3.json".to_string()
}

fn default_precision() -> u32 {
    32
}

fn default_batch_size() -> u32 {
    4
}

fn default_output_dir() -> String {
    "output".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_predict_path() -> String {
    "/predict".to_string()
}

fn default_ready_timeout_secs() -> u64 {
    600
}

fn default_request_timeout_secs() -> u64 {
    90
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_blob_applies_defaults() {
        let cfg = DeploymentConfig::from_json(r#"{"parent_dir_name":"model"}"#).unwrap();
        assert_eq!(cfg.parent_dir_name, "model");
        assert_eq!(cfg.precision, 32);
        assert_eq!(cfg.batch_size, 4);
        assert_eq!(cfg.deepspeed_config, "./ds_config_zero3.json");
        assert_eq!(cfg.predictor.kind, PredictorKind::Echo);
        assert!(cfg.extra.is_empty());
    }

    #[test]
    fn test_unknown_keys_are_kept() {
        let cfg = DeploymentConfig::from_json(
            r#"{"parent_dir_name":"m","task_name":"SingleLabelClassification","max_seq_length":128}"#,
        )
        .unwrap();
        assert_eq!(cfg.extra["task_name"], "SingleLabelClassification");
        assert_eq!(cfg.extra["max_seq_length"], 128);

        let back = DeploymentConfig::from_json(&cfg.to_json()).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn test_malformed_and_incomplete_blobs() {
        assert!(matches!(
            DeploymentConfig::from_json("{not json"),
            Err(ConfigurationError::Malformed(_))
        ));
        // parent_dir_name is required
        assert!(DeploymentConfig::from_json(r#"{"batch_size":8}"#).is_err());
    }

    #[test]
    fn test_resolve_model_dir() {
        assert_eq!(
            resolve_model_dir(Path::new("/var/azureml-app/models/bert/1"), "model"),
            PathBuf::from("/var/azureml-app/models/bert/1/model")
        );
        assert_eq!(
            resolve_model_dir(Path::new("/var/azureml-app/models/model"), "model"),
            PathBuf::from("/var/azureml-app/models/model")
        );
    }
}
