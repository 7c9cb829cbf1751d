use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::Mutex;

/// Scope for Azure Resource Manager calls.
pub const ARM_SCOPE: &str = "https://management.azure.com/.default";

/// Client id of the user-assigned identity attached to the compute.
pub const IDENTITY_CLIENT_ID_ENV: &str = "DEFAULT_IDENTITY_CLIENT_ID";

const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

/// Tokens are refreshed this many seconds before they expire.
const REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CredentialError {
    #[error("{credential} is unavailable: {reason}")]
    Unavailable {
        credential: &'static str,
        reason: String,
    },
    #[error("{credential} token request failed: {reason}")]
    Failed {
        credential: &'static str,
        reason: String,
    },
    #[error("no credential in the chain produced a token: {}", .0.join("; "))]
    Exhausted(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

impl AccessToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_on - chrono::Duration::seconds(REFRESH_MARGIN_SECS) > now
    }
}

#[async_trait]
pub trait TokenCredential: Send + Sync {
    fn name(&self) -> &'static str;
    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError>;
}

/// Managed identity of the compute the process runs on.
///
/// Uses the App Service style `IDENTITY_ENDPOINT`, the older `MSI_ENDPOINT`
/// exposed on ML compute, or the instance metadata service, in that order.
#[derive(Debug, Clone)]
pub struct ManagedIdentityCredential {
    client_id: Option<String>,
    http: reqwest::Client,
}

impl ManagedIdentityCredential {
    pub fn new(client_id: Option<String>, http: reqwest::Client) -> Self {
        Self { client_id, http }
    }

    fn request(&self, resource: &str) -> reqwest::RequestBuilder {
        if let (Ok(endpoint), Ok(header)) = (
            std::env::var("IDENTITY_ENDPOINT"),
            std::env::var("IDENTITY_HEADER"),
        ) {
            let mut query = vec![("api-version", "2019-08-01"), ("resource", resource)];
            if let Some(id) = self.client_id.as_deref() {
                query.push(("client_id", id));
            }
            return self
                .http
                .get(endpoint)
                .query(&query)
                .header("X-IDENTITY-HEADER", header);
        }

        if let Ok(endpoint) = std::env::var("MSI_ENDPOINT") {
            let mut query = vec![("api-version", "2017-09-01"), ("resource", resource)];
            if let Some(id) = self.client_id.as_deref() {
                query.push(("clientid", id));
            }
            let mut req = self.http.get(endpoint).query(&query);
            if let Ok(secret) = std::env::var("MSI_SECRET") {
                req = req.header("secret", secret);
            }
            return req;
        }

        let mut query = vec![("api-version", "2018-02-01"), ("resource", resource)];
        if let Some(id) = self.client_id.as_deref() {
            query.push(("client_id", id));
        }
        self.http
            .get(IMDS_ENDPOINT)
            .query(&query)
            .header("Metadata", "true")
            .timeout(Duration::from_secs(5))
    }
}

#[async_trait]
impl TokenCredential for ManagedIdentityCredential {
    fn name(&self) -> &'static str {
        "ManagedIdentityCredential"
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let resource = scope.trim_end_matches("/.default");
        let resp = self
            .request(resource)
            .send()
            .await
            .map_err(|e| CredentialError::Unavailable {
                credential: self.name(),
                reason: e.to_string(),
            })?;
        let status = resp.status();
        let body: Value = resp.json().await.map_err(|e| CredentialError::Failed {
            credential: self.name(),
            reason: format!("invalid token response: {e}"),
        })?;
        if !status.is_success() {
            return Err(CredentialError::Failed {
                credential: self.name(),
                reason: format!("{status}: {body}"),
            });
        }
        parse_token_response(&body, Utc::now()).ok_or_else(|| CredentialError::Failed {
            credential: self.name(),
            reason: "token response has no access_token".to_string(),
        })
    }
}

/// Service principal from `AZURE_TENANT_ID`, `AZURE_CLIENT_ID` and
/// `AZURE_CLIENT_SECRET`.
#[derive(Debug, Clone)]
pub struct EnvironmentCredential {
    http: reqwest::Client,
}

impl EnvironmentCredential {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl TokenCredential for EnvironmentCredential {
    fn name(&self) -> &'static str {
        "EnvironmentCredential"
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let var = |name: &str| {
            std::env::var(name).map_err(|_| CredentialError::Unavailable {
                credential: "EnvironmentCredential",
                reason: format!("{name} is not set"),
            })
        };
        let tenant = var("AZURE_TENANT_ID")?;
        let client_id = var("AZURE_CLIENT_ID")?;
        let secret = var("AZURE_CLIENT_SECRET")?;
        let authority =
            std::env::var("AZURE_AUTHORITY_HOST").unwrap_or_else(|_| DEFAULT_AUTHORITY.to_string());

        let url = format!(
            "{}/{tenant}/oauth2/v2.0/token",
            authority.trim_end_matches('/')
        );
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", client_id.as_str()),
            ("client_secret", secret.as_str()),
            ("scope", scope),
        ];
        let resp = self
            .http
            .post(url)
            .form(&form)
            .send()
            .await
            .map_err(|e| CredentialError::Failed {
                credential: self.name(),
                reason: e.to_string(),
            })?;
        let status = resp.status();
        let body: Value = resp.json().await.map_err(|e| CredentialError::Failed {
            credential: self.name(),
            reason: format!("invalid token response: {e}"),
        })?;
        if !status.is_success() {
            let reason = body
                .get("error_description")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("{status}"));
            return Err(CredentialError::Failed {
                credential: self.name(),
                reason,
            });
        }
        parse_token_response(&body, Utc::now()).ok_or_else(|| CredentialError::Failed {
            credential: self.name(),
            reason: "token response has no access_token".to_string(),
        })
    }
}

/// Token of the account logged in with `az login`.
#[derive(Debug, Clone, Default)]
pub struct AzureCliCredential;

#[async_trait]
impl TokenCredential for AzureCliCredential {
    fn name(&self) -> &'static str {
        "AzureCliCredential"
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let resource = scope.trim_end_matches("/.default");
        let output = Command::new("az")
            .args([
                "account",
                "get-access-token",
                "--output",
                "json",
                "--resource",
                resource,
            ])
            .output()
            .await
            .map_err(|e| CredentialError::Unavailable {
                credential: self.name(),
                reason: format!("failed to run az: {e}"),
            })?;
        if !output.status.success() {
            return Err(CredentialError::Unavailable {
                credential: self.name(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let body: Value =
            serde_json::from_slice(&output.stdout).map_err(|e| CredentialError::Failed {
                credential: self.name(),
                reason: format!("unexpected az output: {e}"),
            })?;
        parse_cli_token(&body).ok_or_else(|| CredentialError::Failed {
            credential: self.name(),
            reason: "az output has no accessToken".to_string(),
        })
    }
}

/// Tries each credential in order and returns the first token.
pub struct ChainedCredential {
    sources: Vec<Arc<dyn TokenCredential>>,
}

impl ChainedCredential {
    pub fn new(sources: Vec<Arc<dyn TokenCredential>>) -> Self {
        Self { sources }
    }

    /// Environment service principal, then managed identity, then Azure CLI.
    pub fn default_chain(client_id: Option<String>, http: reqwest::Client) -> Self {
        let sources: Vec<Arc<dyn TokenCredential>> = vec![
            Arc::new(EnvironmentCredential::new(http.clone())),
            Arc::new(ManagedIdentityCredential::new(client_id, http)),
            Arc::new(AzureCliCredential),
        ];
        Self::new(sources)
    }
}

#[async_trait]
impl TokenCredential for ChainedCredential {
    fn name(&self) -> &'static str {
        "ChainedCredential"
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let mut errors = Vec::new();
        for source in &self.sources {
            match source.get_token(scope).await {
                Ok(token) => {
                    tracing::debug!(credential = source.name(), "acquired token");
                    return Ok(token);
                }
                Err(e) => {
                    tracing::debug!(credential = source.name(), error=%e, "credential failed");
                    errors.push(e.to_string());
                }
            }
        }
        Err(CredentialError::Exhausted(errors))
    }
}

/// Reuses a token per scope until it is about to expire.
pub struct CachedCredential {
    inner: Arc<dyn TokenCredential>,
    tokens: Mutex<HashMap<String, AccessToken>>,
}

impl CachedCredential {
    pub fn new(inner: Arc<dyn TokenCredential>) -> Self {
        Self {
            inner,
            tokens: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl TokenCredential for CachedCredential {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let mut tokens = self.tokens.lock().await;
        if let Some(token) = tokens.get(scope) {
            if token.is_fresh(Utc::now()) {
                return Ok(token.clone());
            }
        }
        let token = self.inner.get_token(scope).await?;
        tokens.insert(scope.to_string(), token.clone());
        Ok(token)
    }
}

/// Credential used by the provisioning commands.
///
/// Jobs authenticate as the compute's managed identity; `local_mode` runs
/// on a workstation and walk the default chain instead.
pub fn resolve_credential(
    local_mode: bool,
    client_id: Option<String>,
    http: reqwest::Client,
) -> Arc<dyn TokenCredential> {
    let inner: Arc<dyn TokenCredential> = if local_mode {
        tracing::info!("using default credential chain");
        Arc::new(ChainedCredential::default_chain(client_id, http))
    } else {
        tracing::info!(client_id = client_id.as_deref().unwrap_or("<system-assigned>"), "using managed identity");
        Arc::new(ManagedIdentityCredential::new(client_id, http))
    };
    Arc::new(CachedCredential::new(inner))
}

/// Acquires a token up front so problems show in the log early.
///
/// Failure is not fatal here; the first control-plane call reports it again.
pub async fn probe(credential: &dyn TokenCredential) -> bool {
    match credential.get_token(ARM_SCOPE).await {
        Ok(_) => {
            tracing::info!(credential = credential.name(), "credential resolved");
            true
        }
        Err(e) => {
            tracing::warn!(credential = credential.name(), error=%e, "could not acquire a token yet");
            false
        }
    }
}

fn as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parses an OAuth token response (`access_token` with `expires_on` or
/// `expires_in`, either as numbers or numeric strings).
fn parse_token_response(body: &Value, now: DateTime<Utc>) -> Option<AccessToken> {
    let token = body.get("access_token")?.as_str()?.to_string();
    let expires_on = body
        .get("expires_on")
        .and_then(as_i64)
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        .or_else(|| {
            body.get("expires_in")
                .and_then(as_i64)
                .map(|secs| now + chrono::Duration::seconds(secs))
        })
        .unwrap_or(now + chrono::Duration::hours(1));
    Some(AccessToken { token, expires_on })
}

fn parse_cli_token(body: &Value) -> Option<AccessToken> {
    let token = body.get("accessToken")?.as_str()?.to_string();
    let expires_on = body
        .get("expires_on")
        .and_then(as_i64)
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        .or_else(|| {
            let raw = body.get("expiresOn")?.as_str()?;
            let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f").ok()?;
            Local
                .from_local_datetime(&naive)
                .single()
                .map(|t| t.with_timezone(&Utc))
        })
        .unwrap_or_else(|| Utc::now() + chrono::Duration::minutes(30));
    Some(AccessToken { token, expires_on })
}
