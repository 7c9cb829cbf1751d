use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// What a batch deployment does with per-mini-batch results.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutputAction {
    /// Append every result row to a single output file.
    #[default]
    AppendRow,
    /// Keep only per-file summaries.
    SummaryOnly,
}

impl BatchOutputAction {
    pub fn as_arm(self) -> &'static str {
        match self {
            BatchOutputAction::AppendRow => "AppendRow",
            BatchOutputAction::SummaryOnly => "SummaryOnly",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchDeployment {
    pub name: String,
    pub endpoint_name: String,
    /// Model asset id, e.g. `azureml:bert-base:3`.
    pub model: String,
    /// Compute cluster name or ARM id.
    pub compute: String,
    pub instance_count: u32,
    pub max_concurrency_per_instance: u32,
    pub mini_batch_size: u32,
    pub output_action: BatchOutputAction,
    pub output_file_name: String,
}

/// Scoring code uploaded as a code asset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CodeConfiguration {
    /// ARM id of the code asset version.
    pub code_id: String,
    pub scoring_script: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct OnlineRequestSettings {
    pub max_concurrent_requests_per_instance: u32,
    pub request_timeout_ms: u64,
    pub max_queue_wait_ms: u64,
}

impl Default for OnlineRequestSettings {
    fn default() -> Self {
        Self {
            max_concurrent_requests_per_instance: 1,
            request_timeout_ms: 5_000,
            max_queue_wait_ms: 500,
        }
    }
}

/// Upper bound the service accepts for `request_timeout_ms`.
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 90_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OnlineDeployment {
    pub name: String,
    pub endpoint_name: String,
    /// Model asset id, e.g. `azureml:bert-base:3`.
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_configuration: Option<CodeConfiguration>,
    /// Environment asset id. `None` for models that bring their own (MLflow).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
    pub instance_type: String,
    pub instance_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_settings: Option<OnlineRequestSettings>,
}

/// Formats milliseconds as an ISO-8601 duration (`PT5S`, `PT0.5S`).
pub fn iso8601_millis(ms: u64) -> String {
    let secs = ms / 1000;
    let frac = ms % 1000;
    if frac == 0 {
        format!("PT{secs}S")
    } else {
        let frac = format!("{frac:03}");
        format!("PT{secs}.{}S", frac.trim_end_matches('0'))
    }
}
