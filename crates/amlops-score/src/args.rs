use std::path::PathBuf;

use clap::Parser;

use crate::scratch::DEFAULT_SCRATCH_ROOT;

#[derive(Debug, Parser)]
#[command(author, version, about = "HTTP scoring server for a deployed model")]
pub struct Args {
    #[arg(long, env = "AMLOPS_SCORE_ADDR", default_value = "0.0.0.0:5001")]
    pub listen_addr: String,

    /// Directory uploads are staged under, one subdirectory per request.
    #[arg(long, env = "AMLOPS_SCRATCH_ROOT", default_value = DEFAULT_SCRATCH_ROOT)]
    pub scratch_root: PathBuf,

    /// Largest accepted request body.
    #[arg(long, env = "AMLOPS_MAX_BODY_BYTES", default_value_t = 100 * 1024 * 1024)]
    pub max_body_bytes: usize,

    /// Log output format: "text" or "json".
    #[arg(long, env = "AMLOPS_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// OTLP/HTTP endpoint for exporting traces.
    #[arg(long, env = "AMLOPS_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Bearer token for the OTLP endpoint.
    #[arg(long, env = "AMLOPS_OTLP_TOKEN")]
    pub otlp_token: Option<String>,
}
