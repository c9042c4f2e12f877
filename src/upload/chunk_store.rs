//! Chunk Store
//!
//! Durable staging area for uploaded chunks. Every filesystem access of the
//! upload core goes through here: chunk writes, enumeration, the merged
//! artifact and cleanup.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Bytes;
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::key::{ChunkIndex, UploadId};
use super::layout::{self, Layout, ARTIFACT_TEMP_SUFFIX, CHUNK_TEMP_SUFFIX};
use super::locks::UploadLocks;
use super::types::{CommitRecord, StoredChunk, UploadError, COPY_BUFFER_SIZE};

// ============================================================================
// Chunk Store
// ============================================================================

/// Filesystem-backed chunk staging
#[derive(Clone)]
pub struct ChunkStore {
    inner: Arc<ChunkStoreInner>,
}

struct ChunkStoreInner {
    layout: Layout,

    /// Per-upload gates shared with the assembler
    locks: UploadLocks,
}

impl ChunkStore {
    /// Open the store rooted at `root`, creating its directories and
    /// removing temp files left behind by interrupted writes.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, UploadError> {
        let layout = Layout::new(root.into());

        for dir in [layout.chunks_root(), layout.files_root()] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| UploadError::storage(format!("creating {}", dir.display()), e))?;
        }

        let store = Self {
            inner: Arc::new(ChunkStoreInner {
                layout,
                locks: UploadLocks::new(),
            }),
        };

        let swept = store.sweep_temp_files().await?;
        if swept > 0 {
            tracing::info!(count = swept, "Removed temp files from interrupted writes");
        }

        tracing::debug!(root = %store.root().display(), "Chunk store opened");

        Ok(store)
    }

    pub fn root(&self) -> &Path {
        self.inner.layout.root()
    }

    pub(crate) fn locks(&self) -> &UploadLocks {
        &self.inner.locks
    }

    // ========================================================================
    // Chunk Writes
    // ========================================================================

    /// Store a chunk held in memory
    pub async fn put(
        &self,
        id: &UploadId,
        index: ChunkIndex,
        data: Bytes,
    ) -> Result<StoredChunk, UploadError> {
        let payload = futures::stream::iter([Ok::<_, std::convert::Infallible>(data)]);
        self.put_stream(id, index, payload).await
    }

    /// Store a streamed chunk.
    ///
    /// The payload goes to a temp file that is fsynced and then renamed onto
    /// the chunk's final name, so a chunk is either fully staged or absent.
    /// A previous chunk with the same index is replaced.
    pub async fn put_stream<S, E>(
        &self,
        id: &UploadId,
        index: ChunkIndex,
        mut payload: S,
    ) -> Result<StoredChunk, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        let _guard = self.inner.locks.begin_write(id).await?;

        if self.is_merged(id).await? {
            return Err(UploadError::Conflict(format!("upload already merged: {}", id)));
        }

        let layout = &self.inner.layout;
        let dir = layout.staging_dir(id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| UploadError::storage(format!("creating staging area for {}", id), e))?;

        let temp = TempPath::new(layout.chunk_temp_path(id, index));
        let chunk_path = layout.chunk_path(id, index);

        let size = write_payload(temp.path(), &mut payload).await?;
        fs::rename(temp.path(), &chunk_path)
            .await
            .map_err(|e| UploadError::storage(format!("staging chunk {}", index), e))?;
        temp.keep();

        tracing::debug!(
            upload_id = %id,
            chunk_index = %index,
            size = size,
            "Chunk stored"
        );

        Ok(StoredChunk { index, size })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Indices currently staged for an upload; empty if nothing arrived yet
    pub async fn list_indices(&self, id: &UploadId) -> Result<BTreeSet<u64>, UploadError> {
        Ok(self
            .scan(id)
            .await?
            .unwrap_or_default()
            .into_iter()
            .map(|chunk| chunk.index.value())
            .collect())
    }

    /// Every staged chunk, ascending by numeric index
    pub async fn read_all(&self, id: &UploadId) -> Result<Vec<StagedChunk>, UploadError> {
        let mut chunks = self
            .scan(id)
            .await?
            .ok_or_else(|| UploadError::NotFound(id.to_string()))?;
        chunks.sort_by_key(|chunk| chunk.index);
        Ok(chunks)
    }

    /// Whether the merged artifact for this upload exists
    pub async fn is_merged(&self, id: &UploadId) -> Result<bool, UploadError> {
        let path = self.inner.layout.artifact_path(id);
        fs::try_exists(&path)
            .await
            .map_err(|e| UploadError::storage(format!("checking {}", path.display()), e))
    }

    /// Whether a staging area exists for this upload
    pub async fn has_staging(&self, id: &UploadId) -> Result<bool, UploadError> {
        let dir = self.inner.layout.staging_dir(id);
        fs::try_exists(&dir)
            .await
            .map_err(|e| UploadError::storage(format!("checking {}", dir.display()), e))
    }

    /// `None` when the upload has no staging area
    async fn scan(&self, id: &UploadId) -> Result<Option<Vec<StagedChunk>>, UploadError> {
        let dir = self.inner.layout.staging_dir(id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(UploadError::storage(format!("listing chunks of {}", id), e)),
        };

        let mut chunks = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| UploadError::storage(format!("listing chunks of {}", id), e))?
        {
            let Some(index) = entry
                .file_name()
                .to_str()
                .and_then(ChunkIndex::from_file_name)
            else {
                continue;
            };

            // a merge may retire the directory while we walk it
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(UploadError::storage(format!("reading chunk {}", index), e)),
            };
            if !metadata.is_file() {
                continue;
            }

            chunks.push(StagedChunk {
                index,
                path: entry.path(),
                size: metadata.len(),
            });
        }

        Ok(Some(chunks))
    }

    // ========================================================================
    // Merged Artifact
    // ========================================================================

    /// Start writing the merged artifact to a temp file next to its final path
    pub(crate) async fn create_artifact(&self, id: &UploadId) -> Result<ArtifactWriter, UploadError> {
        let temp = TempPath::new(self.inner.layout.artifact_temp_path(id));
        let file = fs::File::create(temp.path())
            .await
            .map_err(|e| UploadError::storage(format!("creating output for {}", id), e))?;

        Ok(ArtifactWriter {
            file,
            temp,
            final_path: self.inner.layout.artifact_path(id),
            hasher: Sha256::new(),
            size: 0,
        })
    }

    /// Size and digest of an artifact that was already finalized
    pub(crate) async fn describe_artifact(&self, id: &UploadId) -> Result<FinalizedArtifact, UploadError> {
        let path = self.inner.layout.artifact_path(id);
        let mut file = fs::File::open(&path)
            .await
            .map_err(|e| UploadError::storage(format!("opening {}", path.display()), e))?;

        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| UploadError::storage(format!("reading {}", path.display()), e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }

        Ok(FinalizedArtifact {
            path,
            size,
            sha256: hex::encode(hasher.finalize()),
        })
    }

    /// Remove the staging area of an upload
    pub(crate) async fn retire(&self, id: &UploadId) -> Result<(), UploadError> {
        let dir = self.inner.layout.staging_dir(id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UploadError::storage(format!("removing staging area of {}", id), e)),
        }
    }

    /// Durably record that the artifact is about to be published
    pub(crate) async fn record_commit(
        &self,
        id: &UploadId,
        record: &CommitRecord,
    ) -> Result<(), UploadError> {
        let path = self.inner.layout.commit_path(id);
        let body = serde_json::to_vec(record)
            .map_err(|e| UploadError::StorageFailure(format!("encoding commit record: {}", e)))?;

        let mut file = fs::File::create(&path)
            .await
            .map_err(|e| UploadError::storage(format!("recording commit of {}", id), e))?;
        file.write_all(&body)
            .await
            .map_err(|e| UploadError::storage(format!("recording commit of {}", id), e))?;
        file.sync_all()
            .await
            .map_err(|e| UploadError::storage(format!("recording commit of {}", id), e))
    }

    /// Commit record left by an earlier merge attempt. A record that cannot
    /// be decoded was cut short before its artifact was published, so it
    /// reads as absent.
    pub(crate) async fn read_commit(&self, id: &UploadId) -> Result<Option<CommitRecord>, UploadError> {
        let path = self.inner.layout.commit_path(id);
        let body = match fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(UploadError::storage(format!("reading commit of {}", id), e)),
        };

        match serde_json::from_slice(&body) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!(upload_id = %id, error = %e, "Ignoring unreadable commit record");
                Ok(None)
            }
        }
    }

    pub(crate) async fn clear_commit(&self, id: &UploadId) -> Result<(), UploadError> {
        match fs::remove_file(self.inner.layout.commit_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UploadError::storage(format!("clearing commit of {}", id), e)),
        }
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Remove temp chunk and artifact files. Only safe while no write is in
    /// flight, which is why it runs from `open`.
    async fn sweep_temp_files(&self) -> Result<usize, UploadError> {
        let layout = &self.inner.layout;
        let mut count = remove_temp_entries(&layout.files_root(), ARTIFACT_TEMP_SUFFIX).await?;

        let chunks_root = layout.chunks_root();
        let mut uploads = fs::read_dir(&chunks_root)
            .await
            .map_err(|e| UploadError::storage(format!("listing {}", chunks_root.display()), e))?;
        while let Some(entry) = uploads
            .next_entry()
            .await
            .map_err(|e| UploadError::storage(format!("listing {}", chunks_root.display()), e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if is_dir {
                count += remove_temp_entries(&entry.path(), CHUNK_TEMP_SUFFIX).await?;
            }
        }

        Ok(count)
    }
}

// ============================================================================
// Staged Chunks
// ============================================================================

/// A chunk sitting in the staging area
#[derive(Debug, Clone)]
pub struct StagedChunk {
    pub index: ChunkIndex,
    pub path: PathBuf,
    pub size: u64,
}

impl StagedChunk {
    /// Open the chunk's bytes for reading
    pub async fn open(&self) -> Result<fs::File, UploadError> {
        fs::File::open(&self.path)
            .await
            .map_err(|e| UploadError::storage(format!("opening chunk {}", self.index), e))
    }
}

// ============================================================================
// Artifact Writer
// ============================================================================

/// Location, size and digest of a merged artifact
#[derive(Debug, Clone)]
pub struct FinalizedArtifact {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

/// Merged artifact being written; invisible under its final name until
/// [`SealedArtifact::publish`] succeeds. Dropping it at any earlier point
/// removes the partial file.
pub struct ArtifactWriter {
    file: fs::File,
    temp: TempPath,
    final_path: PathBuf,
    hasher: Sha256,
    size: u64,
}

impl ArtifactWriter {
    /// Copy one staged chunk onto the end of the artifact
    pub async fn append(&mut self, chunk: &StagedChunk) -> Result<u64, UploadError> {
        let mut source = chunk.open().await?;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut copied = 0u64;

        loop {
            let n = source
                .read(&mut buf)
                .await
                .map_err(|e| UploadError::storage(format!("reading chunk {}", chunk.index), e))?;
            if n == 0 {
                break;
            }
            self.file
                .write_all(&buf[..n])
                .await
                .map_err(|e| UploadError::storage("writing merged file", e))?;
            self.hasher.update(&buf[..n]);
            copied += n as u64;
        }

        self.size += copied;
        Ok(copied)
    }

    /// Flush and fsync the artifact; it stays under its temp name
    pub async fn seal(mut self) -> Result<SealedArtifact, UploadError> {
        sync_file(&mut self.file)
            .await
            .map_err(|e| UploadError::storage("flushing merged file", e))?;

        Ok(SealedArtifact {
            temp: self.temp,
            final_path: self.final_path,
            size: self.size,
            sha256: hex::encode(self.hasher.finalize()),
        })
    }
}

/// Fully written and synced artifact waiting to be moved into place
#[derive(Debug)]
pub struct SealedArtifact {
    temp: TempPath,
    final_path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

impl SealedArtifact {
    /// Atomically rename the artifact onto its final path
    pub async fn publish(self) -> Result<FinalizedArtifact, UploadError> {
        fs::rename(self.temp.path(), &self.final_path)
            .await
            .map_err(|e| UploadError::storage("moving merged file into place", e))?;
        self.temp.keep();

        Ok(FinalizedArtifact {
            path: self.final_path,
            size: self.size,
            sha256: self.sha256,
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

async fn write_payload<S, E>(path: &Path, payload: &mut S) -> Result<u64, UploadError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut file = fs::File::create(path)
        .await
        .map_err(|e| UploadError::storage("creating chunk file", e))?;

    let mut size = 0u64;
    while let Some(piece) = payload.next().await {
        let piece = piece.map_err(|e| {
            UploadError::InvalidArgument(format!("failed to read chunk payload: {}", e))
        })?;
        file.write_all(&piece)
            .await
            .map_err(|e| UploadError::storage("writing chunk file", e))?;
        size += piece.len() as u64;
    }

    file.sync_all()
        .await
        .map_err(|e| UploadError::storage("syncing chunk file", e))?;

    Ok(size)
}

async fn sync_file(file: &mut fs::File) -> std::io::Result<()> {
    file.flush().await?;
    file.sync_all().await
}

/// Temp file that is removed on drop unless [`TempPath::keep`] is called
/// after it was renamed into place
#[derive(Debug)]
struct TempPath {
    path: PathBuf,
    keep: bool,
}

impl TempPath {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for TempPath {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        // sync removal: drop also runs when a request future is cancelled
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove temp file");
            }
        }
    }
}

async fn remove_temp_entries(dir: &Path, suffix: &str) -> Result<usize, UploadError> {
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|e| UploadError::storage(format!("listing {}", dir.display()), e))?;

    let mut count = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| UploadError::storage(format!("listing {}", dir.display()), e))?
    {
        let is_temp = entry
            .file_name()
            .to_str()
            .map(|name| layout::is_temp_name(name, suffix))
            .unwrap_or(false);
        if is_temp {
            fs::remove_file(entry.path())
                .await
                .map_err(|e| UploadError::storage("removing stale temp file", e))?;
            count += 1;
        }
    }

    Ok(count)
}

// ============================================================================
// Tests
// ============================================================================
