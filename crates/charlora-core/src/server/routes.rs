use std::collections::HashMap;

use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use charlora_training::{JobId, JobSnapshot};
use serde::Serialize;
use serde_json::json;
use tracing::error;

use crate::diagnostics::GpuDiagnostics;
use crate::error::CoreError;
use crate::service::{ConfigTestReport, JobService, Submission, UploadedFile};

const FILES_FIELD: &str = "files";

/// A [`CoreError`] rendered as `{"detail": "..."}`.
#[derive(Debug)]
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        Self(CoreError::MalformedRequest(err.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::InvalidSubmission(_) => StatusCode::BAD_REQUEST,
            CoreError::MalformedRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::JobNotFound(_) => StatusCode::NOT_FOUND,
            other => {
                error!(error = %other, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "detail": self.0.to_string() }))).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct TrainResponse {
    pub job_id: JobId,
}

pub async fn train(
    State(service): State<JobService>,
    mut multipart: Multipart,
) -> Result<Json<TrainResponse>, ApiError> {
    let mut fields = HashMap::new();
    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        if name == FILES_FIELD {
            let filename = field.file_name().map(ToString::to_string);
            let bytes = field.bytes().await?.to_vec();
            files.push(UploadedFile { filename, bytes });
        } else {
            fields.insert(name, field.text().await?);
        }
    }

    let submission = Submission {
        name: required(&fields, "name")?.to_string(),
        trigger: required(&fields, "trigger")?.to_string(),
        base_model: required(&fields, "base_model")?.to_string(),
        resolution: number(&fields, "resolution")?,
        network_dim: number(&fields, "network_dim")?,
        steps: number(&fields, "steps")?,
        unet_only: required(&fields, "unet_only")?.to_string(),
        files,
    };
    let submitted = service.submit(submission).await?;
    Ok(Json(TrainResponse { job_id: submitted.job_id }))
}

pub async fn job_status(
    State(service): State<JobService>,
    Path(id): Path<String>,
) -> Result<Json<JobSnapshot>, ApiError> {
    Ok(Json(service.status(&JobId::from(id))?))
}

pub async fn gpu_diagnostics(State(service): State<JobService>) -> Json<GpuDiagnostics> {
    Json(service.diagnostics().await)
}

pub async fn config_test(State(service): State<JobService>) -> Json<ConfigTestReport> {
    Json(service.config_test())
}

fn required<'a>(fields: &'a HashMap<String, String>, key: &str) -> Result<&'a str, ApiError> {
    fields
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| CoreError::MalformedRequest(format!("missing form field '{key}'")).into())
}

fn number(fields: &HashMap<String, String>, key: &str) -> Result<u32, ApiError> {
    let raw = required(fields, key)?;
    raw.trim()
        .parse()
        .map_err(|_| CoreError::MalformedRequest(format!("form field '{key}' must be a non-negative integer, got {raw:?}")).into())
}
