//! Upload types for the chunked upload protocol

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::key::{ChunkIndex, UploadId};

// ============================================================================
// Constants
// ============================================================================

/// Default request body limit for a single chunk: 64MB
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 64 * 1024 * 1024;

/// Buffer size used when copying chunk files into the merged artifact
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

// ============================================================================
// Chunk Upload Types
// ============================================================================

/// A chunk that was durably written to the staging area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredChunk {
    pub index: ChunkIndex,
    pub size: u64,
}

/// Response after uploading a chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    pub message: String,
}

/// Response to a status query
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkStatusResponse {
    /// Indices staged so far, ascending
    pub uploaded_chunks: Vec<u64>,
}

/// Query string of the status endpoint
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkStatusQuery {
    #[serde(default)]
    pub file_key: Option<String>,
}

// ============================================================================
// Merge Types
// ============================================================================

/// Request to merge the staged chunks of an upload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    #[serde(default)]
    pub file_key: Option<String>,

    /// When present, the staged set must be exactly `0..total_chunks`
    #[serde(default)]
    pub total_chunks: Option<u64>,
}

/// Result of a successful merge
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub upload_id: UploadId,

    /// Final location of the merged artifact
    pub path: PathBuf,

    /// Total size in bytes
    pub size: u64,

    /// Hex-encoded SHA-256 of the merged artifact
    pub sha256: String,

    /// Number of chunks concatenated
    pub chunk_count: usize,

    pub merged_at: DateTime<Utc>,
}

/// Written into the staging area right before the merged artifact is moved
/// into place. Lets a retried merge recognize its own finished artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRecord {
    pub sha256: String,
    pub size: u64,
    pub chunk_count: usize,
    pub merged_at: DateTime<Utc>,
}

/// Response after merging an upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResponse {
    pub message: String,
    pub file_path: String,
    pub size: u64,
    pub sha256: String,
    pub chunk_count: usize,
    pub merged_at: DateTime<Utc>,
}

impl From<MergeOutcome> for MergeResponse {
    fn from(outcome: MergeOutcome) -> Self {
        Self {
            message: "File merged successfully.".to_string(),
            file_path: outcome.path.to_string_lossy().into_owned(),
            size: outcome.size,
            sha256: outcome.sha256,
            chunk_count: outcome.chunk_count,
            merged_at: outcome.merged_at,
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Coarse classification a caller uses to decide whether to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input, retry with corrected input
    InvalidArgument,
    /// Unknown or empty upload, do not retry
    NotFound,
    /// Merge in progress or upload already merged, do not retry blindly
    Conflict,
    /// I/O failure, the whole operation may be retried
    StorageFailure,
}

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("Incomplete upload: missing chunks {missing:?}")]
    IncompleteUpload { missing: Vec<u64> },

    #[error("Upload not found: {0}")]
    NotFound(String),

    #[error("No chunks to merge for upload: {0}")]
    EmptyUpload(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage failure: {0}")]
    StorageFailure(String),
}

impl UploadError {
    /// Wrap an I/O error with what was being attempted
    pub fn storage(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        Self::StorageFailure(format!("{}: {}", context, err))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) | Self::IncompleteUpload { .. } => ErrorKind::InvalidArgument,
            Self::NotFound(_) | Self::EmptyUpload(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::StorageFailure(_) => ErrorKind::StorageFailure,
        }
    }

    /// Get HTTP status code for this error
    ///
    /// Unknown and empty uploads are reported as 400, the same way the
    /// merge endpoint reports any unusable `fileKey`.
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self.kind() {
            ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::BAD_REQUEST,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::StorageFailure => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable code for the response body
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::IncompleteUpload { .. } => "INCOMPLETE_UPLOAD",
            Self::NotFound(_) => "NOT_FOUND",
            Self::EmptyUpload(_) => "EMPTY_UPLOAD",
            Self::Conflict(_) => "CONFLICT",
            Self::StorageFailure(_) => "STORAGE_FAILURE",
        }
    }
}
