//! On-disk layout of the upload root
//!
//! ```text
//! <root>/chunks/<upload id>/<index>        staged chunk
//! <root>/chunks/<upload id>/.<index>.<uuid>.tmp   chunk being written
//! <root>/chunks/<upload id>/.commit        merge in its final step
//! <root>/files/<artifact name>             merged artifact
//! <root>/files/.<artifact name>.<uuid>.partial    artifact being written
//! ```

use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::key::{ChunkIndex, UploadId};

pub(crate) const CHUNKS_DIR: &str = "chunks";
pub(crate) const FILES_DIR: &str = "files";
pub(crate) const CHUNK_TEMP_SUFFIX: &str = ".tmp";
pub(crate) const ARTIFACT_TEMP_SUFFIX: &str = ".partial";
pub(crate) const COMMIT_RECORD: &str = ".commit";

#[derive(Debug, Clone)]
pub(crate) struct Layout {
    root: PathBuf,
}

impl Layout {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn chunks_root(&self) -> PathBuf {
        self.root.join(CHUNKS_DIR)
    }

    pub(crate) fn files_root(&self) -> PathBuf {
        self.root.join(FILES_DIR)
    }

    pub(crate) fn staging_dir(&self, id: &UploadId) -> PathBuf {
        self.chunks_root().join(id.as_str())
    }

    pub(crate) fn chunk_path(&self, id: &UploadId, index: ChunkIndex) -> PathBuf {
        self.staging_dir(id).join(index.file_name())
    }

    pub(crate) fn chunk_temp_path(&self, id: &UploadId, index: ChunkIndex) -> PathBuf {
        self.staging_dir(id)
            .join(format!(".{}.{}{}", index, Uuid::new_v4(), CHUNK_TEMP_SUFFIX))
    }

    pub(crate) fn commit_path(&self, id: &UploadId) -> PathBuf {
        self.staging_dir(id).join(COMMIT_RECORD)
    }

    pub(crate) fn artifact_path(&self, id: &UploadId) -> PathBuf {
        self.files_root().join(id.artifact_name())
    }

    pub(crate) fn artifact_temp_path(&self, id: &UploadId) -> PathBuf {
        self.files_root().join(format!(
            ".{}.{}{}",
            id.artifact_name(),
            Uuid::new_v4(),
            ARTIFACT_TEMP_SUFFIX
        ))
    }
}

/// Whether a directory entry is a temp file left by an interrupted write
pub(crate) fn is_temp_name(name: &str, suffix: &str) -> bool {
    name.starts_with('.') && name.ends_with(suffix)
}
