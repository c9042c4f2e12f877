//! Upload identifiers and chunk indices
//!
//! Both values arrive from the client and end up as path components under
//! the staging root, so they are validated once here and carried around as
//! typed values afterwards.

use std::fmt;
use std::path::{Component, Path};
use std::str::FromStr;

use super::types::UploadError;

/// Maximum length of an upload identifier in bytes
pub const MAX_UPLOAD_ID_LEN: usize = 200;

/// Suffix clients append to the upload id; dropped from the merged file name
pub const RESERVED_SUFFIX: &str = "-chunk";

// ============================================================================
// Upload ID
// ============================================================================

/// Client-supplied token naming one upload
///
/// A valid id is a single normal path component: non-empty, no separators,
/// not `.` or `..`, no leading dot (temp files use it), no control
/// characters. Dots elsewhere are fine (`v1..2.zip`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadId(String);

impl UploadId {
    pub fn parse(raw: &str) -> Result<Self, UploadError> {
        if raw.is_empty() {
            return Err(invalid("upload id must not be empty"));
        }
        if raw.len() > MAX_UPLOAD_ID_LEN {
            return Err(invalid(format!(
                "upload id longer than {} bytes",
                MAX_UPLOAD_ID_LEN
            )));
        }
        if raw.contains('/') || raw.contains('\\') {
            return Err(invalid(format!("path separators not allowed: {}", raw)));
        }
        if raw.starts_with('.') {
            return Err(invalid(format!("upload id must not start with '.': {}", raw)));
        }
        if raw.chars().any(char::is_control) {
            return Err(invalid("upload id contains control characters"));
        }

        let mut components = Path::new(raw).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => return Err(invalid(format!("unsafe upload id: {}", raw))),
        }

        if raw.strip_suffix(RESERVED_SUFFIX) == Some("") {
            return Err(invalid(format!("upload id must not be only '{}'", RESERVED_SUFFIX)));
        }

        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of the merged artifact
    pub fn artifact_name(&self) -> &str {
        self.0.strip_suffix(RESERVED_SUFFIX).unwrap_or(&self.0)
    }
}

impl FromStr for UploadId {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Chunk Index
// ============================================================================

/// Ordinal position of a chunk within its upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkIndex(u64);

impl ChunkIndex {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Parse a decimal index. Leading zeros are accepted and normalized,
    /// signs and anything else are rejected.
    pub fn parse(raw: &str) -> Result<Self, UploadError> {
        let raw = raw.trim();
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid(format!("invalid chunk index: {:?}", raw)));
        }
        raw.parse::<u64>()
            .map(Self)
            .map_err(|_| invalid(format!("chunk index out of range: {}", raw)))
    }

    /// Parse a staged file name. Only the canonical form counts, so temp
    /// files and stray entries never show up as chunks.
    pub(crate) fn from_file_name(name: &str) -> Option<Self> {
        let index = Self::parse(name).ok()?;
        (index.file_name() == name).then_some(index)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn file_name(self) -> String {
        self.0.to_string()
    }
}

impl From<u64> for ChunkIndex {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ChunkIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn invalid(message: impl Into<String>) -> UploadError {
    UploadError::InvalidArgument(message.into())
}
