//! Handlers for the `/jobs` resource.
//!
//! Submission streams the multipart upload straight into storage, enforcing
//! the size limit as chunks arrive. Reads pass the presented [`BearerSecret`] to the engine,
//! which decides between 401, 403 and 404.

use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{Multipart, Path, State};
use axum::http::header::{CONTENT_TYPE, LOCATION};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use docconv_core::error::CoreError;
use docconv_core::job::{JobError, JobRecord, JobStatus};
use docconv_core::types::{JobId, Timestamp};
use docconv_core::upload::UploadPolicy;
use docconv_worker::{JobLifecycleEngine, Submission};
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::middleware::auth::BearerSecret;
use crate::response::DataResponse;
use crate::state::AppState;

/// Name of the multipart field carrying the document.
pub const FILE_FIELD: &str = "file";

/// Media type of `GET /jobs/{id}/result`.
pub const MARKDOWN_CONTENT_TYPE: &str = "text/markdown; charset=utf-8";

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// Capability links. They identify the job; the secret travels separately.
#[derive(Debug, Serialize)]
pub struct JobLinks {
    #[serde(rename = "self")]
    pub self_: String,
    pub result: String,
}

impl JobLinks {
    fn for_job(id: JobId) -> Self {
        Self {
            self_: format!("/jobs/{id}"),
            result: format!("/jobs/{id}/result"),
        }
    }
}

/// Returned once, by `POST /jobs`. The only place `access_token` appears.
#[derive(Debug, Serialize)]
pub struct SubmittedJob {
    pub id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub created_at: Timestamp,
    pub access_token: String,
    pub links: JobLinks,
}

#[derive(Debug, Serialize)]
pub struct ArtifactView {
    pub name: String,
    pub size_bytes: u64,
}

/// Job detail for `GET /jobs/{id}`. Storage locations and the token digest
/// stay server-side.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub checksum: String,
    pub error: Option<JobError>,
    pub artifacts: Vec<ArtifactView>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub failed_at: Option<Timestamp>,
    pub links: JobLinks,
}

impl From<&JobRecord> for JobView {
    fn from(record: &JobRecord) -> Self {
        Self {
            id: record.id(),
            status: record.status(),
            progress: record.progress(),
            filename: record.filename().to_string(),
            content_type: record.content_type().to_string(),
            size_bytes: record.size_bytes(),
            checksum: record.checksum().to_string(),
            error: record.error().cloned(),
            artifacts: record
                .artifacts()
                .iter()
                .map(|a| ArtifactView {
                    name: a.name.clone(),
                    size_bytes: a.size_bytes,
                })
                .collect(),
            created_at: record.created_at(),
            updated_at: record.updated_at(),
            started_at: record.started_at(),
            completed_at: record.completed_at(),
            failed_at: record.failed_at(),
            links: JobLinks::for_job(record.id()),
        }
    }
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// POST /jobs
///
/// Accept a multipart upload with a single `file` field. Returns 202 with the
/// queued job, its one-time access token and a `Location` header.
pub async fn create_job(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> AppResult<impl IntoResponse> {
    let mut multipart = multipart.map_err(|e| {
        AppError::BadRequest(format!(
            "Expected a multipart/form-data upload: {}",
            e.body_text()
        ))
    })?;
    let policy = state.engine.upload_policy();

    let submission = loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| multipart_error(e, policy, 0))?
            .ok_or_else(|| {
                AppError::Core(CoreError::Validation(format!(
                    "Missing '{FILE_FIELD}' field in multipart upload"
                )))
            })?;
        if field.name() == Some(FILE_FIELD) {
            break store_file_field(&state.engine, field).await?;
        }
    };

    let record = submission.record;
    let id = record.id();

    let location = format!("/jobs/{id}");
    let data = SubmittedJob {
        id,
        status: record.status(),
        progress: record.progress(),
        filename: record.filename().to_string(),
        content_type: record.content_type().to_string(),
        size_bytes: record.size_bytes(),
        created_at: record.created_at(),
        access_token: submission.secret.into_string(),
        links: JobLinks::for_job(id),
    };

    Ok((
        StatusCode::ACCEPTED,
        [(LOCATION, location)],
        Json(DataResponse { data }),
    ))
}

/// Stream one file field into storage, rejecting it as soon as it outgrows
/// the limit.
///
/// The content type is checked before any bytes are read. An upload that
/// fails part-way is dropped together with its partial bytes.
async fn store_file_field(
    engine: &JobLifecycleEngine,
    mut field: axum::extract::multipart::Field<'_>,
) -> AppResult<Submission> {
    let filename = field.file_name().unwrap_or_default().to_string();
    let mut pending = engine
        .begin_upload(&filename, field.content_type())
        .await?;

    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| multipart_error(e, engine.upload_policy(), pending.size_bytes()))?
    {
        pending.write(&chunk).await?;
    }

    Ok(engine.commit(pending).await?)
}

/// Body-limit failures surface as 413; anything else is a malformed upload.
fn multipart_error(err: MultipartError, policy: &UploadPolicy, received: u64) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return AppError::Core(CoreError::PayloadTooLarge {
            size_bytes: received,
            limit_bytes: policy.max_bytes(),
        });
    }
    AppError::BadRequest(format!("Malformed multipart upload: {}", err.body_text()))
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

/// GET /jobs/{id}
///
/// Current status and progress. Requires the job's bearer secret.
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    secret: BearerSecret,
) -> AppResult<Json<DataResponse<JobView>>> {
    let record = state.engine.get(&id, secret.expose()).await?;
    Ok(Json(DataResponse {
        data: JobView::from(&record),
    }))
}

/// GET /jobs/{id}/result
///
/// The Markdown produced by a succeeded job. 404 until then.
pub async fn get_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
    secret: BearerSecret,
) -> AppResult<impl IntoResponse> {
    let result = state.engine.result(&id, secret.expose()).await?;
    Ok(([(CONTENT_TYPE, MARKDOWN_CONTENT_TYPE)], result.markdown))
}
