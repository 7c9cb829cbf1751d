use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How callers authenticate against an endpoint's scoring URI.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    Key,
    AmlToken,
    AadToken,
}

impl AuthMode {
    /// Wire spelling used by the resource manager API.
    pub fn as_arm(self) -> &'static str {
        match self {
            AuthMode::Key => "Key",
            AuthMode::AmlToken => "AMLToken",
            AuthMode::AadToken => "AADToken",
        }
    }

    pub fn from_arm(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "key" => Some(AuthMode::Key),
            "amltoken" => Some(AuthMode::AmlToken),
            "aadtoken" => Some(AuthMode::AadToken),
            _ => None,
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthMode::Key => "key",
            AuthMode::AmlToken => "aml_token",
            AuthMode::AadToken => "aad_token",
        };
        f.write_str(s)
    }
}

impl FromStr for AuthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "key" => Ok(AuthMode::Key),
            "aml_token" | "amltoken" => Ok(AuthMode::AmlToken),
            "aad_token" | "aadtoken" => Ok(AuthMode::AadToken),
            other => Err(format!(
                "unknown auth mode '{other}', available: key, aml_token, aad_token"
            )),
        }
    }
}

/// Managed identity attached to an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointIdentity {
    /// `SystemAssigned`, `UserAssigned`, `SystemAssigned,UserAssigned` or `None`.
    pub kind: String,
    /// Resource ids of the attached user-assigned identities.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_assigned_identities: Vec<String>,
}

impl EndpointIdentity {
    pub fn system_assigned() -> Self {
        Self {
            kind: "SystemAssigned".to_string(),
            user_assigned_identities: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchEndpointDefaults {
    /// Deployment that receives jobs submitted without naming one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchEndpoint {
    pub name: String,
    /// Batch endpoints only accept Azure AD tokens; `None` lets the service pick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_mode: Option<AuthMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Sent back unchanged on update; omitted when `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<EndpointIdentity>,
    #[serde(default)]
    pub defaults: BatchEndpointDefaults,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scoring_uri: Option<String>,
}

impl BatchEndpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            auth_mode: None,
            description: None,
            tags: BTreeMap::new(),
            identity: None,
            defaults: BatchEndpointDefaults::default(),
            scoring_uri: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OnlineEndpoint {
    pub name: String,
    pub auth_mode: AuthMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// `None` creates the endpoint with a system-assigned identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<EndpointIdentity>,
    /// Deployment name to percentage of requests.
    #[serde(default)]
    pub traffic: BTreeMap<String, u8>,
    /// Read-only, populated by the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scoring_uri: Option<String>,
}

impl OnlineEndpoint {
    pub fn new(name: impl Into<String>, auth_mode: AuthMode) -> Self {
        Self {
            name: name.into(),
            auth_mode,
            description: None,
            tags: BTreeMap::new(),
            identity: None,
            traffic: BTreeMap::new(),
            scoring_uri: None,
        }
    }
}
