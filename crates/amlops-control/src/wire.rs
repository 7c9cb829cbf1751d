//! Mapping between the shared entities and Azure Resource Manager payloads.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use amlops_common::{
    iso8601_millis, AuthMode, BatchDeployment, BatchEndpoint, BatchEndpointDefaults,
    EndpointIdentity, ModelVersion, OnlineDeployment, OnlineEndpoint, WorkspaceConfig,
};

/// Expands the short `azureml:<name>:<version>` reference into an ARM id
/// under `collection` (`models`, `environments`, ...). Full ids and
/// `azureml://` URIs pass through.
pub fn asset_arm_id(workspace: &WorkspaceConfig, collection: &str, reference: &str) -> String {
    if reference.starts_with('/') || reference.starts_with("azureml://") {
        return reference.to_string();
    }
    let short = reference.strip_prefix("azureml:").unwrap_or(reference);
    match short.split_once(':') {
        Some((name, version)) => format!(
            "{}/{collection}/{name}/versions/{version}",
            workspace.resource_id()
        ),
        None => format!("{}/{collection}/{short}", workspace.resource_id()),
    }
}

pub fn compute_arm_id(workspace: &WorkspaceConfig, compute: &str) -> String {
    if compute.starts_with('/') {
        return compute.to_string();
    }
    let name = compute.strip_prefix("azureml:").unwrap_or(compute);
    format!("{}/computes/{name}", workspace.resource_id())
}

fn tags_value<'a>(tags: impl Iterator<Item = (&'a String, &'a String)>) -> Value {
    Value::Object(
        tags.map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect::<Map<String, Value>>(),
    )
}

fn tags_from_arm(v: &Value) -> BTreeMap<String, String> {
    v.get("tags")
        .and_then(|t| t.as_object())
        .map(|t| {
            t.iter()
                .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Principal and client ids are service-populated and left out.
fn identity_value(identity: &EndpointIdentity) -> Value {
    let mut value = json!({ "type": identity.kind });
    if !identity.user_assigned_identities.is_empty() {
        let assigned: Map<String, Value> = identity
            .user_assigned_identities
            .iter()
            .map(|id| (id.clone(), json!({})))
            .collect();
        value["userAssignedIdentities"] = Value::Object(assigned);
    }
    value
}

fn identity_from_arm(v: &Value) -> Option<EndpointIdentity> {
    let identity = v.get("identity")?;
    Some(EndpointIdentity {
        kind: str_field(identity, "type")?,
        user_assigned_identities: identity
            .get("userAssignedIdentities")
            .and_then(|u| u.as_object())
            .map(|u| u.keys().cloned().collect())
            .unwrap_or_default(),
    })
}

pub fn online_endpoint_body(endpoint: &OnlineEndpoint, location: &str) -> Value {
    let traffic: Map<String, Value> = endpoint
        .traffic
        .iter()
        .map(|(k, v)| (k.clone(), json!(v)))
        .collect();
    let mut properties = json!({
        "authMode": endpoint.auth_mode.as_arm(),
        "traffic": traffic,
    });
    if let Some(description) = &endpoint.description {
        properties["description"] = json!(description);
    }
    let identity = endpoint
        .identity
        .clone()
        .unwrap_or_else(EndpointIdentity::system_assigned);
    json!({
        "location": location,
        "identity": identity_value(&identity),
        "tags": tags_value(endpoint.tags.iter()),
        "properties": properties,
    })
}

pub fn online_endpoint_from_arm(v: &Value) -> Option<OnlineEndpoint> {
    let name = v.get("name")?.as_str()?.to_string();
    let props = v.get("properties")?;
    let auth_mode = props
        .get("authMode")
        .and_then(|m| m.as_str())
        .and_then(AuthMode::from_arm)
        .unwrap_or(AuthMode::Key);
    let traffic = props
        .get("traffic")
        .and_then(|t| t.as_object())
        .map(|t| {
            t.iter()
                .filter_map(|(k, v)| Some((k.clone(), u8::try_from(v.as_u64()?).ok()?)))
                .collect()
        })
        .unwrap_or_default();
    Some(OnlineEndpoint {
        name,
        auth_mode,
        description: str_field(props, "description"),
        tags: tags_from_arm(v),
        identity: identity_from_arm(v),
        traffic,
        scoring_uri: str_field(props, "scoringUri"),
    })
}

pub fn batch_endpoint_body(endpoint: &BatchEndpoint, location: &str) -> Value {
    let mut properties = json!({
        "authMode": endpoint.auth_mode.unwrap_or(AuthMode::AadToken).as_arm(),
    });
    if let Some(description) = &endpoint.description {
        properties["description"] = json!(description);
    }
    if let Some(default) = &endpoint.defaults.deployment_name {
        properties["defaults"] = json!({ "deploymentName": default });
    }
    let mut body = json!({
        "location": location,
        "tags": tags_value(endpoint.tags.iter()),
        "properties": properties,
    });
    if let Some(identity) = &endpoint.identity {
        body["identity"] = identity_value(identity);
    }
    body
}

pub fn batch_endpoint_from_arm(v: &Value) -> Option<BatchEndpoint> {
    let name = v.get("name")?.as_str()?.to_string();
    let props = v.get("properties")?;
    Some(BatchEndpoint {
        name,
        auth_mode: props
            .get("authMode")
            .and_then(|m| m.as_str())
            .and_then(AuthMode::from_arm),
        description: str_field(props, "description"),
        tags: tags_from_arm(v),
        identity: identity_from_arm(v),
        defaults: BatchEndpointDefaults {
            deployment_name: props
                .get("defaults")
                .and_then(|d| str_field(d, "deploymentName")),
        },
        scoring_uri: str_field(props, "scoringUri"),
    })
}

pub fn online_deployment_body(
    workspace: &WorkspaceConfig,
    deployment: &OnlineDeployment,
    location: &str,
) -> Value {
    let env_vars: Map<String, Value> = deployment
        .environment_variables
        .iter()
        .map(|(k, v)| (k.clone(), json!(v)))
        .collect();
    let mut properties = json!({
        "endpointComputeType": "Managed",
        "model": asset_arm_id(workspace, "models", &deployment.model),
        "instanceType": deployment.instance_type,
        "environmentVariables": env_vars,
    });
    if let Some(code) = &deployment.code_configuration {
        properties["codeConfiguration"] = json!({
            "codeId": code.code_id,
            "scoringScript": code.scoring_script,
        });
    }
    if let Some(env) = &deployment.environment {
        properties["environmentId"] = json!(asset_arm_id(workspace, "environments", env));
    }
    if let Some(rs) = &deployment.request_settings {
        properties["requestSettings"] = json!({
            "maxConcurrentRequestsPerInstance": rs.max_concurrent_requests_per_instance,
            "requestTimeout": iso8601_millis(rs.request_timeout_ms),
            "maxQueueWait": iso8601_millis(rs.max_queue_wait_ms),
        });
    }
    json!({
        "location": location,
        "sku": { "name": "Default", "capacity": deployment.instance_count },
        "properties": properties,
    })
}

pub fn batch_deployment_body(
    workspace: &WorkspaceConfig,
    deployment: &BatchDeployment,
    location: &str,
) -> Value {
    json!({
        "location": location,
        "properties": {
            "model": {
                "referenceType": "Id",
                "assetId": asset_arm_id(workspace, "models", &deployment.model),
            },
            "compute": compute_arm_id(workspace, &deployment.compute),
            "resources": { "instanceCount": deployment.instance_count },
            "maxConcurrencyPerInstance": deployment.max_concurrency_per_instance,
            "miniBatchSize": deployment.mini_batch_size,
            "outputAction": deployment.output_action.as_arm(),
            "outputFileName": deployment.output_file_name,
        }
    })
}

pub fn model_version_body(model: &ModelVersion) -> Value {
    let mut properties = json!({ "modelType": model.model_type });
    if let Some(path) = &model.path {
        properties["modelUri"] = json!(path);
    }
    if let Some(description) = &model.description {
        properties["description"] = json!(description);
    }
    json!({ "properties": properties })
}

/// Model name comes from the resource id (`.../models/<name>/versions/<v>`).
pub fn model_version_from_arm(v: &Value, registry: Option<&str>) -> Option<ModelVersion> {
    let version = v.get("name")?.as_str()?.to_string();
    let id = v.get("id").and_then(|i| i.as_str()).unwrap_or_default();
    let mut segments = id.split('/');
    let name = segments
        .by_ref()
        .skip_while(|s| !s.eq_ignore_ascii_case("models"))
        .nth(1)?
        .to_string();
    let props = v.get("properties");
    Some(ModelVersion {
        name,
        version,
        path: props.and_then(|p| str_field(p, "modelUri")),
        description: props.and_then(|p| str_field(p, "description")),
        model_type: props
            .and_then(|p| str_field(p, "modelType"))
            .unwrap_or_else(|| "custom_model".to_string()),
        registry: registry.map(str::to_string),
    })
}

/// Status of an `Azure-AsyncOperation` resource.
pub fn operation_status(v: &Value) -> Option<(String, Option<String>)> {
    let status = v.get("status")?.as_str()?.to_string();
    let message = v
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(str::to_string);
    Some((status, message))
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(|s| s.as_str()).map(str::to_string)
}
