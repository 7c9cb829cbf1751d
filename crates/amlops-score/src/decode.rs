use axum::extract::{FromRequest, Multipart, Request};
use axum::http::header::CONTENT_TYPE;
use bytes::Bytes;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::error::RequestError;
use crate::predictor::{FileInput, ModelInput};
use crate::scratch::RequestScratch;

/// Turns a scoring request into model input.
///
/// `application/json` bodies yield their `inputs` member when the body is an
/// object that has one, otherwise the whole body. `multipart/*` bodies stage
/// each file part under `scratch`; parts without a filename are skipped. Any
/// other content type yields an empty file list.
pub async fn decode_request(
    request: Request,
    scratch: &mut RequestScratch,
) -> Result<ModelInput, RequestError> {
    let essence = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .unwrap_or_default();

    if essence == "application/json" {
        let body = Bytes::from_request(request, &())
            .await
            .map_err(|e| RequestError::Body(e.body_text()))?;
        let value: Value = serde_json::from_slice(&body)?;
        return Ok(ModelInput::Json(select_inputs(value)));
    }

    if essence.starts_with("multipart/") {
        let multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| RequestError::Multipart(e.body_text()))?;
        return stage_files(multipart, scratch).await.map(ModelInput::Files);
    }

    tracing::debug!(content_type = %essence, "no decodable body, passing an empty file list");
    Ok(ModelInput::Files(Vec::new()))
}

fn select_inputs(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("inputs") => {
            map.remove("inputs").unwrap_or(Value::Null)
        }
        other => other,
    }
}

async fn stage_files(
    mut multipart: Multipart,
    scratch: &mut RequestScratch,
) -> Result<Vec<FileInput>, RequestError> {
    let mut files = Vec::new();
    while let Some(mut field) = multipart.next_field().await? {
        let Some(original) = field.file_name().map(str::to_string) else {
            continue;
        };
        let (path, mut file) = scratch.create_file(&original).await?;
        let io_err = |source: std::io::Error| RequestError::Stage {
            path: path.clone(),
            source,
        };
        while let Some(chunk) = field.chunk().await? {
            file.write_all(&chunk).await.map_err(io_err)?;
        }
        file.flush().await.map_err(io_err)?;
        tracing::debug!(file=%path.display(), "staged upload");
        files.push(FileInput { file: path });
    }
    Ok(files)
}
