//! Upload Routes
//!
//! HTTP endpoints for the chunked upload protocol.
//!
//! Endpoints:
//! - POST /upload/chunk - Stage one chunk (multipart: fileKey, chunkIndex, file)
//! - GET /upload/chunk/status?fileKey= - List staged chunk indices
//! - POST /upload/merge - Concatenate staged chunks into the final file
//!   (JSON or urlencoded form body: fileKey, totalChunks)

use axum::{
    body::Bytes,
    extract::{
        multipart::MultipartError, DefaultBodyLimit, FromRequest, Multipart, Query, Request,
        State,
    },
    http::header,
    response::IntoResponse,
    routing::{get, post},
    Form, Json, Router,
};
use serde::Serialize;

use crate::state::AppState;
use crate::upload::{
    ChunkIndex, ChunkStatusQuery, ChunkStatusResponse, ChunkUploadResponse, ErrorKind,
    MergeRequest, MergeResponse, StoredChunk, UploadError, UploadId,
};

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    message: String,
    code: &'static str,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();

        if self.kind() == ErrorKind::StorageFailure {
            tracing::error!(error = %self, "Upload storage failure");
        }

        let body = Json(ErrorResponse {
            message: self.to_string(),
            code: self.code(),
        });

        (status, body).into_response()
    }
}

fn multipart_error(err: MultipartError) -> UploadError {
    UploadError::InvalidArgument(format!("Failed to read multipart body: {}", err.body_text()))
}

fn missing(what: &str) -> UploadError {
    UploadError::InvalidArgument(format!("Missing required parameters: {}", what))
}

// ============================================================================
// Routes
// ============================================================================

/// Create upload routes
pub fn router(max_chunk_bytes: usize) -> Router<AppState> {
    Router::new()
        .route("/chunk", post(upload_chunk))
        .route("/chunk/status", get(chunk_status))
        .route("/merge", post(merge))
        .layer(DefaultBodyLimit::max(max_chunk_bytes))
}

// ============================================================================
// Handlers
// ============================================================================

/// Stage one chunk of an upload
///
/// The payload is streamed straight into the staging area when `fileKey` and
/// `chunkIndex` precede it in the form. Otherwise it is buffered until the
/// whole form has been read.
async fn upload_chunk(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ChunkUploadResponse>, UploadError> {
    let mut file_key: Option<UploadId> = None;
    let mut chunk_index: Option<ChunkIndex> = None;
    let mut buffered: Option<Bytes> = None;
    let mut stored: Option<StoredChunk> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "fileKey" => {
                if file_key.is_some() {
                    return Err(UploadError::InvalidArgument(
                        "Duplicate fileKey field".to_string(),
                    ));
                }
                let text = field.text().await.map_err(multipart_error)?;
                file_key = Some(UploadId::parse(&text)?);
            }
            "chunkIndex" => {
                if chunk_index.is_some() {
                    return Err(UploadError::InvalidArgument(
                        "Duplicate chunkIndex field".to_string(),
                    ));
                }
                let text = field.text().await.map_err(multipart_error)?;
                chunk_index = Some(ChunkIndex::parse(&text)?);
            }
            "file" | "chunk" => {
                if stored.is_some() || buffered.is_some() {
                    return Err(UploadError::InvalidArgument(
                        "More than one chunk payload in request".to_string(),
                    ));
                }
                match (&file_key, chunk_index) {
                    (Some(id), Some(index)) => {
                        let chunk = state
                            .chunk_store()
                            .put_stream(id, index, Box::pin(field))
                            .await?;
                        stored = Some(chunk);
                    }
                    _ => {
                        buffered = Some(field.bytes().await.map_err(multipart_error)?);
                    }
                }
            }
            other => {
                tracing::debug!(field = other, "Ignoring unknown multipart field");
            }
        }
    }

    let id = file_key.ok_or_else(|| missing("fileKey"))?;
    let index = chunk_index.ok_or_else(|| missing("chunkIndex"))?;

    match (stored, buffered) {
        (Some(_), _) => {}
        (None, Some(data)) => {
            state.chunk_store().put(&id, index, data).await?;
        }
        (None, None) => return Err(missing("file")),
    }

    Ok(Json(ChunkUploadResponse {
        message: "Chunk uploaded successfully.".to_string(),
    }))
}

/// List the chunk indices staged for an upload
async fn chunk_status(
    State(state): State<AppState>,
    Query(query): Query<ChunkStatusQuery>,
) -> Result<Json<ChunkStatusResponse>, UploadError> {
    let raw = query
        .file_key
        .filter(|key| !key.is_empty())
        .ok_or_else(|| UploadError::InvalidArgument("Missing fileKey parameter.".to_string()))?;
    let id = UploadId::parse(&raw)?;

    let indices = state.chunk_store().list_indices(&id).await?;

    Ok(Json(ChunkStatusResponse {
        uploaded_chunks: indices.into_iter().collect(),
    }))
}

/// Merge all staged chunks of an upload into the final file
///
/// The merge runs in its own task so a client that disconnects midway does
/// not cut it short.
async fn merge(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<MergeResponse>, UploadError> {
    let request = read_merge_request(request).await?;

    let raw = request
        .file_key
        .filter(|key| !key.is_empty())
        .ok_or_else(|| UploadError::InvalidArgument("Missing fileKey parameter.".to_string()))?;
    let id = UploadId::parse(&raw)?;

    let assembler = state.assembler().clone();
    let total_chunks = request.total_chunks;
    let outcome = tokio::spawn(async move { assembler.merge(&id, total_chunks).await })
        .await
        .map_err(|e| UploadError::StorageFailure(format!("merge task failed: {}", e)))??;

    Ok(Json(outcome.into()))
}

/// Decode a merge request from a JSON or urlencoded form body
async fn read_merge_request(request: Request) -> Result<MergeRequest, UploadError> {
    let is_form = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);

    if is_form {
        let Form(body) = Form::<MergeRequest>::from_request(request, &())
            .await
            .map_err(|rejection| {
                UploadError::InvalidArgument(format!(
                    "Invalid merge request: {}",
                    rejection.body_text()
                ))
            })?;
        Ok(body)
    } else {
        let Json(body) = Json::<MergeRequest>::from_request(request, &())
            .await
            .map_err(|rejection| {
                UploadError::InvalidArgument(format!(
                    "Invalid merge request: {}",
                    rejection.body_text()
                ))
            })?;
        Ok(body)
    }
}
