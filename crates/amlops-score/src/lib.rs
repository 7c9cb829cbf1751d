//! Scoring adapter: decodes scoring requests, calls the prediction service
//! and encodes its results.

pub mod args;
pub mod decode;
pub mod encode;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod predictor;
pub mod scratch;
pub mod service;
pub mod state;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};

pub use encode::{encode_json, EncodeError, Prediction};
pub use error::{DeploymentFailed, RequestError};
pub use predictor::{
    BuiltinPredictors, EchoPredictor, FileInput, HttpPredictor, ModelInput, PredictionService,
    PredictorFactory,
};
pub use service::{ScoringService, StartupInputs};
pub use state::AppState;

pub fn router(st: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/", get(handlers::healthz))
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/score", post(handlers::score))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(middleware::from_fn_with_state(st.clone(), metrics::track_requests))
        .with_state(st)
}
