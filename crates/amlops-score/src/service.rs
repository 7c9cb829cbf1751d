use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use axum::extract::Request;
use futures_util::FutureExt;
use serde::Serialize;
use uuid::Uuid;

use amlops_common::{ConfigurationError, DeploymentConfig, DEPLOYMENT_CONFIG_ENV, MODEL_DIR_ENV};

use crate::decode::decode_request;
use crate::encode::encode_json;
use crate::error::{error_chain, DeploymentFailed, RequestError};
use crate::predictor::{PredictionService, PredictorFactory};
use crate::scratch::{RequestScratch, ScratchRoot};

/// Everything `init` reads from its environment.
#[derive(Debug, Clone)]
pub struct StartupInputs {
    /// Serialized [`DeploymentConfig`].
    pub config_json: Option<String>,
    /// Mounted model root before `parent_dir_name` is resolved.
    pub model_root: Option<PathBuf>,
    pub scratch_root: PathBuf,
}

impl StartupInputs {
    pub fn from_env(scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            config_json: std::env::var(DEPLOYMENT_CONFIG_ENV).ok(),
            model_root: std::env::var_os(MODEL_DIR_ENV).map(PathBuf::from),
            scratch_root: scratch_root.into(),
        }
    }
}

#[derive(Serialize)]
struct Failure<'a> {
    msg: &'static str,
    error: &'a str,
}

/// A deployment that finished `init` and can score requests.
pub struct ScoringService {
    config: DeploymentConfig,
    predictor: Box<dyn PredictionService>,
    scratch: ScratchRoot,
    failures: AtomicU64,
}

impl ScoringService {
    /// Loads the configuration, resolves the model directory, prepares the
    /// scratch root and builds and prepares the prediction service.
    pub async fn init(
        inputs: StartupInputs,
        factory: &dyn PredictorFactory,
    ) -> Result<Self, DeploymentFailed> {
        match Self::try_init(inputs, factory).await {
            Ok(service) => Ok(service),
            Err(source) => {
                let chain = format!("{source:#}");
                tracing::error!(error = %chain, "scoring service failed to start");
                Err(DeploymentFailed { source })
            }
        }
    }

    async fn try_init(inputs: StartupInputs, factory: &dyn PredictorFactory) -> anyhow::Result<Self> {
        let raw = inputs
            .config_json
            .ok_or(ConfigurationError::MissingEnv(DEPLOYMENT_CONFIG_ENV))?;
        let config = DeploymentConfig::from_json(&raw)?;
        let model_root = inputs
            .model_root
            .ok_or(ConfigurationError::MissingEnv(MODEL_DIR_ENV))?;
        let config = config.with_model_root(&model_root);

        if let Some(model_dir) = &config.model_path {
            log_model_files(model_dir).await;
        }

        let scratch = ScratchRoot::create(&inputs.scratch_root).with_context(|| {
            format!(
                "failed to create scratch root {}",
                inputs.scratch_root.display()
            )
        })?;

        let mut predictor = factory
            .build(&config)
            .context("failed to build prediction service")?;
        tracing::info!(kind = ?config.predictor.kind, "preparing prediction service");
        predictor
            .prepare()
            .await
            .context("prediction service failed to prepare")?;

        tracing::info!(
            model_path = ?config.model_path,
            scratch_root = %scratch.path().display(),
            "scoring service ready"
        );
        Ok(Self {
            config,
            predictor,
            scratch,
            failures: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &DeploymentConfig {
        &self.config
    }

    pub fn scratch_root(&self) -> &Path {
        self.scratch.path()
    }

    /// Requests answered with the failure payload so far.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Scores one request and returns the JSON response body.
    ///
    /// Never fails: errors and panics become
    /// `{"msg":"failed","error":"..."}`. Uploaded files are removed before
    /// this returns.
    pub async fn run(&self, request: Request) -> String {
        let request_id = Uuid::new_v4().simple().to_string();
        let mut scratch = self.scratch.request(&request_id);

        let outcome = AssertUnwindSafe(self.score(request, &mut scratch))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(RequestError::Panicked(panic_message(panic.as_ref()))));
        scratch.cleanup().await;

        match outcome {
            Ok(body) => {
                tracing::debug!(request_id = %request_id, "scored");
                body
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                let chain = error_chain(&e);
                tracing::error!(request_id = %request_id, error = %chain, "scoring failed");
                failure_body(&chain)
            }
        }
    }

    async fn score(&self, request: Request, scratch: &mut RequestScratch) -> Result<String, RequestError> {
        let input = decode_request(request, scratch).await?;
        let prediction = self
            .predictor
            .predict(input)
            .await
            .map_err(RequestError::Predict)?;
        Ok(encode_json(&prediction)?)
    }
}

fn failure_body(error: &str) -> String {
    let error = if error.is_empty() { "unknown error" } else { error };
    serde_json::to_string(&Failure {
        msg: "failed",
        error,
    })
    .unwrap_or_else(|_| r#"{"msg":"failed","error":"unknown error"}"#.to_string())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

/// Logs every file under `model_dir` and returns how many there were.
async fn log_model_files(model_dir: &Path) -> usize {
    if !tokio::fs::metadata(model_dir).await.is_ok_and(|m| m.is_dir()) {
        tracing::warn!(model_dir=%model_dir.display(), "model directory does not exist");
        return 0;
    }
    let mut pending = vec![model_dir.to_path_buf()];
    let mut count = 0usize;
    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir=%dir.display(), error=%e, "cannot list model directory");
                continue;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                pending.push(path);
            } else {
                tracing::info!(file=%path.display(), "model file");
                count += 1;
            }
        }
    }
    tracing::info!(model_dir=%model_dir.display(), files = count, "model directory listed");
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::header::CONTENT_TYPE;
    use ndarray::arr1;
    use serde_json::{json, Value};
    use tokio::sync::Mutex;

    use crate::encode::Prediction;
    use crate::predictor::{BuiltinPredictors, ModelInput};

    /// Records what it was asked to predict and answers with a fixed behavior.
    struct Recorder {
        seen: Arc<Mutex<Vec<ModelInput>>>,
        behavior: Behavior,
    }

    #[derive(Clone, Copy)]
    enum Behavior {
        Echo,
        Fail,
        Panic,
        Nan,
        Array,
    }

    #[async_trait]
    impl PredictionService for Recorder {
        async fn predict(&self, input: ModelInput) -> anyhow::Result<Prediction> {
            if let ModelInput::Files(files) = &input {
                for f in files {
                    assert!(f.file.exists(), "staged file missing during predict");
                }
            }
            self.seen.lock().await.push(input.clone());
            match self.behavior {
                Behavior::Echo => Ok(Prediction::Json(input.to_json())),
                Behavior::Fail => anyhow::bail!("model exploded"),
                Behavior::Panic => panic!("index out of bounds"),
                Behavior::Nan => Ok(Prediction::from(vec![1.0, f64::NAN])),
                Behavior::Array => Ok(Prediction::from(arr1(&[0.5, 1.5]))),
            }
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        service: ScoringService,
        seen: Arc<Mutex<Vec<ModelInput>>>,
    }

    async fn fixture(behavior: Behavior) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let model_root = tmp.path().join("models");
        std::fs::create_dir_all(model_root.join("model")).unwrap();
        std::fs::write(model_root.join("model").join("weights.bin"), b"w").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_for_factory = seen.clone();
        let factory = move |_: &DeploymentConfig| -> anyhow::Result<Box<dyn PredictionService>> {
            Ok(Box::new(Recorder {
                seen: seen_for_factory.clone(),
                behavior,
            }))
        };
        let inputs = StartupInputs {
            config_json: Some(r#"{"parent_dir_name":"model"}"#.to_string()),
            model_root: Some(model_root),
            scratch_root: tmp.path().join("request_files"),
        };
        let service = ScoringService::init(inputs, &factory).await.unwrap();
        Fixture {
            _tmp: tmp,
            service,
            seen,
        }
    }

    fn json_request(body: &str) -> Request {
        axum::http::Request::builder()
            .method("POST")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn upload_request(files: &[(&str, &str)]) -> Request {
        let boundary = "b0undary";
        let mut body = String::new();
        for (i, (name, content)) in files.iter().enumerate() {
            body.push_str(&format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"f{i}\"; filename=\"{name}\"\r\n\r\n{content}\r\n"
            ));
        }
        body.push_str(&format!("--{boundary}--\r\n"));
        axum::http::Request::builder()
            .method("POST")
            .header(CONTENT_TYPE, format!("multipart/form-data; boundary={boundary}"))
            .body(Body::from(body))
            .unwrap()
    }

    fn scratch_file_count(root: &Path) -> usize {
        let mut count = 0;
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(dir).unwrap().flatten() {
                if entry.path().is_dir() {
                    pending.push(entry.path());
                } else {
                    count += 1;
                }
            }
        }
        count
    }

    fn failure_of(body: &str) -> String {
        let v: Value = serde_json::from_str(body).unwrap();
        assert_eq!(v["msg"], "failed", "body: {body}");
        let error = v["error"].as_str().unwrap().to_string();
        assert!(!error.is_empty());
        error
    }

    #[tokio::test]
    async fn test_inputs_member_is_passed_through() {
        let fx = fixture(Behavior::Echo).await;
        let body = fx
            .service
            .run(json_request(r#"{"inputs": {"text": ["a", "b"]}, "ignored": 1}"#))
            .await;
        assert_eq!(body, r#"{"text":["a","b"]}"#);
        assert_eq!(
            fx.seen.lock().await[0],
            ModelInput::Json(json!({"text": ["a", "b"]}))
        );
    }

    #[tokio::test]
    async fn test_body_without_inputs_is_passed_whole() {
        let fx = fixture(Behavior::Echo).await;
        fx.service.run(json_request(r#"{"data": [1, 2]}"#)).await;
        fx.service.run(json_request("[3]")).await;
        let seen = fx.seen.lock().await;
        assert_eq!(seen[0], ModelInput::Json(json!({"data": [1, 2]})));
        assert_eq!(seen[1], ModelInput::Json(json!([3])));
    }

    #[tokio::test]
    async fn test_uploads_are_staged_then_removed() {
        let fx = fixture(Behavior::Echo).await;
        let body = fx
            .service
            .run(upload_request(&[("a.txt", "alpha"), ("b.txt", "beta")]))
            .await;
        let records: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(records.as_array().unwrap().len(), 2);
        assert!(records[0]["file"].as_str().unwrap().ends_with("a.txt"));
        assert!(records[1]["file"].as_str().unwrap().ends_with("b.txt"));
        assert_eq!(scratch_file_count(fx.service.scratch_root()), 0);
    }

    #[tokio::test]
    async fn test_float_array_result_is_encoded() {
        let fx = fixture(Behavior::Array).await;
        assert_eq!(fx.service.run(json_request("[]")).await, "[0.5,1.5]");
    }

    #[tokio::test]
    async fn test_predict_failure_is_contained() {
        let fx = fixture(Behavior::Fail).await;
        let body = fx
            .service
            .run(upload_request(&[("a.txt", "alpha")]))
            .await;
        assert!(failure_of(&body).contains("model exploded"));
        assert_eq!(fx.service.failures(), 1);
        assert_eq!(scratch_file_count(fx.service.scratch_root()), 0);
    }

    #[tokio::test]
    async fn test_predict_panic_is_contained() {
        let fx = fixture(Behavior::Panic).await;
        let body = fx
            .service
            .run(upload_request(&[("a.txt", "alpha")]))
            .await;
        assert!(failure_of(&body).contains("index out of bounds"));
        assert_eq!(scratch_file_count(fx.service.scratch_root()), 0);
    }

    #[tokio::test]
    async fn test_nan_result_fails_to_encode() {
        let fx = fixture(Behavior::Nan).await;
        let body = fx.service.run(json_request("1")).await;
        assert!(failure_of(&body).contains("not a finite number"));
    }

    #[tokio::test]
    async fn test_malformed_json_is_a_failure_payload() {
        let fx = fixture(Behavior::Echo).await;
        let body = fx.service.run(json_request("{nope")).await;
        assert!(failure_of(&body).contains("not valid JSON"));
        assert!(fx.seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_same_named_uploads_are_isolated() {
        let fx = fixture(Behavior::Echo).await;
        let service = Arc::new(fx.service);
        let mut handles = Vec::new();
        for i in 0..8 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                let content = format!("payload-{i}");
                service
                    .run(upload_request(&[("same.txt", content.as_str())]))
                    .await
            }));
        }
        for h in handles {
            let body = h.await.unwrap();
            assert!(!body.contains("\"failed\""), "body: {body}");
        }

        let seen = fx.seen.lock().await;
        let mut paths: Vec<_> = seen
            .iter()
            .map(|input| match input {
                ModelInput::Files(files) => files[0].file.clone(),
                other => panic!("unexpected input {other:?}"),
            })
            .collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 8);
        assert_eq!(scratch_file_count(service.scratch_root()), 0);
    }

    #[tokio::test]
    async fn test_init_requires_config_and_model_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let missing_config = StartupInputs {
            config_json: None,
            model_root: Some(tmp.path().to_path_buf()),
            scratch_root: tmp.path().join("request_files"),
        };
        let err = ScoringService::init(missing_config, &BuiltinPredictors)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains(DEPLOYMENT_CONFIG_ENV));

        let missing_model_dir = StartupInputs {
            config_json: Some(r#"{"parent_dir_name":"model"}"#.to_string()),
            model_root: None,
            scratch_root: tmp.path().join("request_files"),
        };
        let err = ScoringService::init(missing_model_dir, &BuiltinPredictors)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains(MODEL_DIR_ENV));

        let malformed = StartupInputs {
            config_json: Some("{".to_string()),
            model_root: Some(tmp.path().to_path_buf()),
            scratch_root: tmp.path().join("request_files"),
        };
        assert!(ScoringService::init(malformed, &BuiltinPredictors).await.is_err());
    }

    #[tokio::test]
    async fn test_init_resolves_model_path_and_creates_scratch_root() {
        let fx = fixture(Behavior::Echo).await;
        let model_path = fx.service.config().model_path.clone().unwrap();
        assert!(model_path.ends_with("models/model"));
        assert!(fx.service.scratch_root().is_dir());
    }

    #[tokio::test]
    async fn test_log_model_files_walks_nested_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let model = tmp.path().join("model");
        std::fs::create_dir_all(model.join("tokenizer")).unwrap();
        std::fs::write(model.join("weights.bin"), b"w").unwrap();
        std::fs::write(model.join("tokenizer").join("vocab.txt"), b"v").unwrap();
        std::fs::write(model.join("tokenizer").join("merges.txt"), b"m").unwrap();

        assert_eq!(log_model_files(&model).await, 3);
        assert_eq!(log_model_files(&tmp.path().join("missing")).await, 0);
    }
}
