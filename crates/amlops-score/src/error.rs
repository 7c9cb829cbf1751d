use std::path::PathBuf;

use axum::extract::multipart::MultipartError;

use crate::encode::EncodeError;

/// Startup failure. The server does not bind its listener after this.
#[derive(Debug, thiserror::Error)]
#[error("deployment failed: {source:#}")]
pub struct DeploymentFailed {
    #[source]
    pub source: anyhow::Error,
}

impl From<anyhow::Error> for DeploymentFailed {
    fn from(source: anyhow::Error) -> Self {
        Self { source }
    }
}

/// Anything that goes wrong while scoring a single request.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("failed to read request body: {0}")]
    Body(String),

    #[error("request body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("malformed multipart body: {0}")]
    Multipart(String),

    #[error("failed to read multipart field: {0}")]
    Field(#[from] MultipartError),

    #[error("uploaded file has no usable name: {0:?}")]
    InvalidFilename(String),

    #[error("failed to stage upload {path}: {source}")]
    Stage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("prediction failed: {0:#}")]
    Predict(anyhow::Error),

    #[error("prediction panicked: {0}")]
    Panicked(String),

    #[error("failed to encode prediction: {0}")]
    Encode(#[from] EncodeError),
}

/// `err` followed by each of its sources, joined with `: `.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = cause.source();
    }
    out
}
