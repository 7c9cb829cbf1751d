use amlops_common::{latest_numeric_version, ModelVersion};

use crate::types::{ControlPlane, ControlPlaneError, Result};

/// Latest numerically versioned registration of `name`.
///
/// Labels such as `candidate` are not considered. Fails with `NotFound`
/// when no numeric version exists.
pub async fn resolve_latest_model(cp: &dyn ControlPlane, name: &str) -> Result<ModelVersion> {
    let versions = cp.list_model_versions(name).await?;
    let latest = latest_numeric_version(&versions);
    if latest == 0 {
        return Err(ControlPlaneError::NotFound(format!("registered model {name}")));
    }
    let version = latest.to_string();
    let model = cp
        .get_model_version(name, &version)
        .await?
        .ok_or_else(|| ControlPlaneError::NotFound(format!("model {name}:{version}")))?;
    tracing::info!(model = %model.name, version = %model.version, "resolved registered model");
    Ok(model)
}

/// Registers `artifact_uri` as the next numeric version of `name`.
pub async fn register_model(
    cp: &dyn ControlPlane,
    name: &str,
    artifact_uri: &str,
    description: Option<String>,
) -> Result<ModelVersion> {
    let versions = cp.list_model_versions(name).await?;
    let next = latest_numeric_version(&versions) + 1;
    let model = ModelVersion {
        name: name.to_string(),
        version: next.to_string(),
        path: Some(artifact_uri.to_string()),
        description,
        model_type: "custom_model".to_string(),
        registry: None,
    };
    let registered = cp.create_or_update_model_version(&model).await?;
    tracing::info!(model = %registered.name, version = %registered.version, "registered model");
    Ok(registered)
}
