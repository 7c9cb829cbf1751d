pub mod deployment;
pub mod deployment_config;
pub mod endpoint;
pub mod model;
pub mod workspace;

pub use deployment::{
    iso8601_millis, BatchDeployment, BatchOutputAction, CodeConfiguration, OnlineDeployment,
    OnlineRequestSettings, MAX_REQUEST_TIMEOUT_MS,
};
pub use deployment_config::{
    resolve_model_dir, ConfigurationError, DeploymentConfig, PredictorKind, PredictorSettings,
    DEPLOYMENT_CONFIG_ENV, MODEL_DIR_ENV,
};
pub use endpoint::{
    AuthMode, BatchEndpoint, BatchEndpointDefaults, EndpointIdentity, OnlineEndpoint,
};
pub use model::{latest_numeric_version, ModelVersion};
pub use workspace::{WorkspaceConfig, WorkspaceError};

pub mod telemetry;
