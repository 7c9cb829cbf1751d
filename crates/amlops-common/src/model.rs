use serde::{Deserialize, Serialize};

/// One registered version of a model asset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelVersion {
    pub name: String,
    pub version: String,
    /// Where the artifacts live (`azureml://datastores/...`, `https://...`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// `custom_model`, `mlflow_model` or `triton_model`.
    #[serde(default = "default_model_type")]
    pub model_type: String,
    /// Registry the model lives in; `None` for workspace models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
}

impl ModelVersion {
    /// Asset reference accepted by deployment `model` fields.
    pub fn asset_id(&self) -> String {
        match &self.registry {
            Some(registry) => format!(
                "azureml://registries/{registry}/models/{}/versions/{}",
                self.name, self.version
            ),
            None => format!("azureml:{}:{}", self.name, self.version),
        }
    }

    /// Numeric version, if the version label is an integer.
    pub fn numeric_version(&self) -> Option<u64> {
        self.version.parse().ok()
    }
}

fn default_model_type() -> String {
    "custom_model".to_string()
}

/// Highest integer version among `versions`; non-numeric labels are skipped.
/// Returns 0 when nothing numeric is registered.
pub fn latest_numeric_version(versions: &[ModelVersion]) -> u64 {
    versions
        .iter()
        .filter_map(ModelVersion::numeric_version)
        .max()
        .unwrap_or(0)
}
