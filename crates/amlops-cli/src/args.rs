use std::path::PathBuf;

use clap::{ArgAction, Args as ClapArgs, Parser, Subcommand};

use amlops_common::{AuthMode, DeploymentConfig, PredictorKind, PredictorSettings};
use amlops_control::arm::ARM_ENDPOINT;
use amlops_control::IDENTITY_CLIENT_ID_ENV;

#[derive(Debug, Parser)]
#[command(name = "amlops")]
#[command(about = "Provision Azure ML endpoints, deployments and models", long_about = None)]
pub struct Args {
    /// Workspace config.json (searched upward from the working directory when omitted)
    #[arg(long, env = "AMLOPS_WORKSPACE_CONFIG", global = true)]
    pub workspace_config: Option<PathBuf>,

    /// Run from a workstation: use the default credential chain instead of
    /// the compute's managed identity
    #[arg(long, env = "AMLOPS_LOCAL_MODE", global = true)]
    pub local_mode: bool,

    /// Client id of the user-assigned managed identity
    #[arg(long, env = IDENTITY_CLIENT_ID_ENV, global = true)]
    pub identity_client_id: Option<String>,

    /// Resource Manager base URL
    #[arg(long, env = "AMLOPS_ARM_ENDPOINT", default_value = ARM_ENDPOINT, global = true)]
    pub arm_endpoint: String,

    /// Log output format: "text" or "json"
    #[arg(long, env = "AMLOPS_LOG_FORMAT", default_value = "text", global = true)]
    pub log_format: String,

    /// OTLP/HTTP endpoint for exporting traces
    #[arg(long, env = "AMLOPS_OTLP_ENDPOINT", global = true)]
    pub otlp_endpoint: Option<String>,

    /// Bearer token for the OTLP endpoint
    #[arg(long, env = "AMLOPS_OTLP_TOKEN", global = true)]
    pub otlp_token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create a batch endpoint if it does not exist
    CreateBatchEndpoint {
        #[arg(long)]
        endpoint_name: String,
        #[arg(long)]
        auth_mode: Option<AuthMode>,
    },
    /// Create an online endpoint if it does not exist
    CreateOnlineEndpoint {
        #[arg(long)]
        endpoint_name: String,
        #[arg(long, default_value_t = AuthMode::AmlToken)]
        auth_mode: AuthMode,
    },
    /// Create or update a batch deployment and make it the endpoint default
    CreateBatchDeployment(BatchDeploymentArgs),
    /// Create or update an online deployment and route traffic to it
    CreateOnlineDeployment(OnlineDeploymentArgs),
    /// Resolve or register a model, deploy it behind an online endpoint and
    /// route all traffic to it
    Deploy(Box<DeployArgs>),
}

#[derive(Debug, ClapArgs)]
pub struct BatchDeploymentArgs {
    #[arg(long)]
    pub deployment_name: String,
    #[arg(long)]
    pub endpoint_name: String,
    /// Model reference, e.g. azureml:<name>:<version>
    #[arg(long)]
    pub model_path: String,
    /// Compute cluster name
    #[arg(long)]
    pub compute: String,
    #[arg(long, default_value_t = 2)]
    pub instance_count: u32,
    #[arg(long, default_value_t = 4)]
    pub max_concurrency_per_instance: u32,
    /// Examples scored per mini batch
    #[arg(long, default_value_t = 32)]
    pub mini_batch_size: u32,
    #[arg(long, default_value = "predictions.csv")]
    pub output_file_name: String,
}

#[derive(Debug, ClapArgs)]
pub struct OnlineDeploymentArgs {
    #[arg(long)]
    pub deployment_name: String,
    #[arg(long)]
    pub endpoint_name: String,
    /// Model reference, e.g. azureml:<name>:<version>
    #[arg(long)]
    pub model_path: String,
    #[arg(long, default_value = "Standard_DS2_v2")]
    pub instance_type: String,
    #[arg(long, default_value_t = 1)]
    pub instance_count: u32,
    /// Percentage of endpoint traffic routed to this deployment
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub traffic_allocation: u8,
    /// Auth mode used when the endpoint has to be created
    #[arg(long, default_value_t = AuthMode::AmlToken)]
    pub auth_mode: AuthMode,
}

#[derive(Debug, ClapArgs)]
pub struct DeployArgs {
    #[arg(long, default_value = "inferencemodel")]
    pub name_for_registered_model: String,

    /// Register this already-uploaded artifact as a new model version
    /// instead of deploying the latest registered one
    #[arg(long)]
    pub model_artifact_uri: Option<String>,

    /// Registry to resolve the model from
    #[arg(long, env = "GLLM_REGISTRY_NAME")]
    pub registry_name: Option<String>,

    /// Environment for the deployment, as <name>:<version>
    #[arg(long, env = "GLLM_DEPLOYMENT_ENV_NAME")]
    pub deployment_env_name: Option<String>,

    /// ARM id of an uploaded code asset holding the scoring entrypoint
    #[arg(long)]
    pub code_id: Option<String>,

    #[arg(long, default_value = "score")]
    pub scoring_script: String,

    #[arg(long, default_value = "inference-end-point")]
    pub endpoint_name: String,

    #[arg(long, default_value = "blue")]
    pub deployment_name: String,

    #[arg(long, default_value = "Standard_F8s_v2")]
    pub instance_type: String,

    #[arg(long, default_value_t = 1)]
    pub instance_count: u32,

    #[arg(long, default_value_t = 1)]
    pub max_concurrent_requests_per_instance: u32,

    /// Request timeout in ms, at most 90000
    #[arg(long, default_value_t = 5000)]
    pub request_timeout_ms: u64,

    #[arg(long, default_value_t = 500)]
    pub max_queue_wait_ms: u64,

    #[command(flatten)]
    pub inference: InferenceArgs,
}

/// Settings serialized into the deployment configuration blob.
#[derive(Debug, Clone, ClapArgs)]
pub struct InferenceArgs {
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub apply_ort: bool,

    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub apply_deepspeed: bool,

    #[arg(long, default_value = "./ds_config_zero3.json")]
    pub deepspeed_config: String,

    /// 16 enables fp16
    #[arg(long, default_value_t = 32, value_parser = parse_precision)]
    pub precision: u32,

    #[arg(long, default_value_t = 0)]
    pub local_rank: u32,

    #[arg(long, default_value_t = 4)]
    pub batch_size: u32,

    #[arg(long, default_value = "output")]
    pub output_dir: String,

    /// Directory name the model artifacts were saved under
    #[arg(long, default_value = "model")]
    pub parent_dir_name: String,

    /// Prediction service the scoring server runs: echo or http
    #[arg(long, default_value = "echo", value_parser = parse_predictor)]
    pub predictor: PredictorKind,

    /// Model server URL for the http predictor
    #[arg(long)]
    pub predictor_upstream_url: Option<String>,
}

impl InferenceArgs {
    pub fn to_config(&self) -> DeploymentConfig {
        let mut config = DeploymentConfig::new(self.parent_dir_name.clone());
        config.apply_ort = self.apply_ort;
        config.apply_deepspeed = self.apply_deepspeed;
        config.deepspeed_config = self.deepspeed_config.clone();
        config.precision = self.precision;
        config.use_fp16 = self.precision == 16;
        config.local_rank = self.local_rank;
        config.batch_size = self.batch_size;
        config.output_dir = self.output_dir.clone();
        config.predictor = PredictorSettings {
            kind: self.predictor,
            upstream_url: self.predictor_upstream_url.clone(),
            ..PredictorSettings::default()
        };
        config
    }
}

fn parse_precision(s: &str) -> Result<u32, String> {
    match s {
        "16" => Ok(16),
        "32" => Ok(32),
        other => Err(format!("precision must be 16 or 32, got '{other}'")),
    }
}

fn parse_predictor(s: &str) -> Result<PredictorKind, String> {
    match s.to_ascii_lowercase().as_str() {
        "echo" => Ok(PredictorKind::Echo),
        "http" => Ok(PredictorKind::Http),
        other => Err(format!("unknown predictor '{other}', available: echo, http")),
    }
}
