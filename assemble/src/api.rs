use crate::chunks::{ChunkStore, ChunkStoreError};
use crate::config::{Limits, Listener as ListenerConfig};
use crate::metrics_defs::{ASSEMBLE_TASK_RACE_LOST, CHUNK_UPLOADED, RELEASE_AS_ARTIFACT_BUNDLE};
use crate::releases::{Caller, ReleaseStore, TokenStore};
use crate::status::{AssembleStatusStore, StatusStoreError};
use crate::task::{AssembleArtifactsTask, EnqueueError, TaskQueue};
use crate::types::{AssembleKey, AssembleStatus, Checksum, ChunkFileState};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, FromRequestParts, Path, State, rejection::BytesRejection},
    http::{StatusCode, header::AUTHORIZATION, request::Parts},
    response::{IntoResponse, Response},
    routing::post,
};
use serde::{Deserialize, Serialize};
use shared::counter;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

struct AppStateInner {
    releases: Arc<dyn ReleaseStore>,
    tokens: TokenStore,
    statuses: Arc<dyn AssembleStatusStore>,
    chunks: Arc<dyn ChunkStore>,
    queue: TaskQueue,
    limits: Limits,
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

impl AppState {
    pub fn new(
        releases: Arc<dyn ReleaseStore>,
        tokens: TokenStore,
        statuses: Arc<dyn AssembleStatusStore>,
        chunks: Arc<dyn ChunkStore>,
        queue: TaskQueue,
        limits: Limits,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                releases,
                tokens,
                statuses,
                chunks,
                queue,
                limits,
            }),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.inner.limits.max_chunk_size;

    Router::new()
        .route(
            "/api/0/organizations/{org}/releases/{version}/assemble/",
            post(assemble_handler),
        )
        .route(
            "/api/0/organizations/{org}/chunk-upload/",
            post(chunk_upload_handler),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

pub async fn serve<F>(
    listener: &ListenerConfig,
    state: AppState,
    shutdown: F,
) -> Result<(), std::io::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state);
    let addr = format!("{}:{}", listener.host, listener.port);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("API listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Authentication credentials were not provided or are invalid")]
    Unauthorized,

    #[error("The requested resource does not exist")]
    NotFound,

    #[error("Chunk exceeds the maximum size of {0} bytes")]
    PayloadTooLarge(usize),

    #[error("{0}")]
    Unavailable(String),

    #[error("Internal error")]
    Internal(#[from] ChunkStoreError),

    #[error("Assemble status store unavailable")]
    StatusStore(#[from] StatusStoreError),
}

impl From<EnqueueError> for ApiError {
    fn from(e: EnqueueError) -> Self {
        ApiError::Unavailable(e.to_string())
    }
}

#[derive(Serialize)]
struct ApiErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(e) => {
                tracing::error!("Chunk store error: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::StatusStore(e) => {
                tracing::error!("Status store error: {e}");
                StatusCode::SERVICE_UNAVAILABLE
            }
        };

        let body = Json(ApiErrorResponse {
            error: self.to_string(),
        });

        (status, body).into_response()
    }
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .and_then(|token| state.inner.tokens.authenticate(token.trim()))
            .ok_or(ApiError::Unauthorized)
    }
}

/// Turns body extraction failures into JSON errors.
fn read_body(body: Result<Bytes, BytesRejection>, limit: usize) -> Result<Bytes, ApiError> {
    match body {
        Ok(body) if body.len() > limit => Err(ApiError::PayloadTooLarge(limit)),
        Ok(body) => Ok(body),
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            Err(ApiError::PayloadTooLarge(limit))
        }
        Err(rejection) => Err(ApiError::BadRequest(rejection.body_text())),
    }
}

#[derive(Deserialize, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AssembleRequest {
    pub checksum: Checksum,
    pub chunks: Vec<Checksum>,
}

impl AssembleRequest {
    /// Malformed JSON and schema violations are reported differently; schema
    /// violations only report the first line of the message.
    pub fn parse(body: &[u8]) -> Result<Self, ApiError> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|_| ApiError::BadRequest("Invalid json body".into()))?;

        if !value.is_object() {
            return Err(ApiError::BadRequest(format!(
                "{value} is not of type 'object'"
            )));
        }

        serde_json::from_value(value).map_err(|e| {
            let message = e.to_string();
            let first_line = message.lines().next().unwrap_or_default();
            ApiError::BadRequest(first_line.to_string())
        })
    }
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssembleResponse {
    pub state: ChunkFileState,
    pub detail: Option<String>,
    /// Always empty, uploads are never resumed partially.
    pub missing_chunks: Vec<Checksum>,
}

impl AssembleResponse {
    fn new(state: ChunkFileState) -> Self {
        AssembleResponse {
            state,
            detail: None,
            missing_chunks: Vec::new(),
        }
    }
}

impl From<AssembleStatus> for AssembleResponse {
    fn from(status: AssembleStatus) -> Self {
        let detail = match status.state {
            ChunkFileState::Ok => None,
            _ => status.detail,
        };

        AssembleResponse {
            state: status.state,
            detail,
            missing_chunks: Vec::new(),
        }
    }
}

async fn assemble_handler(
    State(state): State<AppState>,
    caller: Caller,
    Path((org, version)): Path<(String, String)>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<AssembleResponse>, ApiError> {
    let inner = &state.inner;
    let body = read_body(body, inner.limits.max_chunk_size)?;

    let organization = inner.releases.organization(&org).ok_or(ApiError::NotFound)?;
    let release = inner
        .releases
        .release(organization.id, &version)
        .filter(|release| caller.has_release_permission(release))
        .ok_or(ApiError::NotFound)?;

    let request = AssembleRequest::parse(&body)?;
    counter!(RELEASE_AS_ARTIFACT_BUNDLE).increment(1);

    let key = AssembleKey::artifact_bundle(organization.id, request.checksum.clone());

    if let Some(status) = inner.statuses.get(&key).await? {
        return Ok(Json(status.into()));
    }

    // Neither a finished file nor a running assembly exists. Without chunks this
    // is a poll for an upload that never happened.
    if request.chunks.is_empty() {
        return Ok(Json(AssembleResponse::new(ChunkFileState::NotFound)));
    }

    // Reserve the queue slot first. A `created` record must never exist without
    // its task, and nothing may wait between the two writes.
    let permit = inner.queue.try_reserve().inspect_err(|e| {
        tracing::warn!(%key, "Cannot accept assemble task: {e}");
    })?;

    if let Some(status) = inner.statuses.create_if_absent(&key).await? {
        counter!(ASSEMBLE_TASK_RACE_LOST).increment(1);
        return Ok(Json(status.into()));
    }

    let task = AssembleArtifactsTask {
        org_id: organization.id,
        version: release.version,
        checksum: request.checksum,
        chunks: request.chunks,
        project_ids: release.project_ids,
        is_release_bundle_migration: true,
    };

    tracing::info!(
        organization_id = organization.id,
        version = %task.version,
        checksum = %task.checksum,
        chunks = task.chunks.len(),
        "enqueueing artifact bundle assembly"
    );
    permit.send(task);

    Ok(Json(AssembleResponse::new(ChunkFileState::Created)))
}

#[derive(Serialize)]
struct ChunkUploadResponse {
    checksum: Checksum,
}

async fn chunk_upload_handler(
    State(state): State<AppState>,
    caller: Caller,
    Path(org): Path<String>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<ChunkUploadResponse>, ApiError> {
    let inner = &state.inner;

    let organization = inner
        .releases
        .organization(&org)
        .filter(|organization| caller.has_organization_access(organization.id))
        .ok_or(ApiError::NotFound)?;

    let body = read_body(body, inner.limits.max_chunk_size)?;

    let size = body.len();
    let checksum = inner.chunks.put(body).await?;
    counter!(CHUNK_UPLOADED).increment(1);
    tracing::debug!(organization_id = organization.id, %checksum, size, "stored chunk");

    Ok(Json(ChunkUploadResponse { checksum }))
}
