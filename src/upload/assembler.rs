//! Assembler
//!
//! Concatenates the staged chunks of an upload, in ascending numeric index
//! order, into one artifact and retires the staging area.
//!
//! A merge goes through these steps while holding the upload's merge gate:
//! 1. Copy every chunk into a temp artifact, then flush and fsync it
//! 2. Write a commit record into the staging area
//! 3. Rename the artifact onto its final path
//! 4. Remove the staging area
//!
//! A failure before step 3 leaves the chunks untouched and the upload open,
//! so the merge can simply be retried. A retry that finds the commit record
//! next to a published artifact only has step 4 left to do.

use std::collections::BTreeSet;

use chrono::Utc;

use super::chunk_store::{ChunkStore, StagedChunk};
use super::key::UploadId;
use super::types::{CommitRecord, MergeOutcome, UploadError};

/// Upper bound on missing indices reported in one error
const MAX_REPORTED_MISSING: usize = 100;

/// Completeness rules applied before merging
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergePolicy {
    /// Reject uploads whose staged indices are not exactly `0..=max`
    pub require_contiguous: bool,
}

/// Merges staged uploads into their final artifact
#[derive(Clone)]
pub struct Assembler {
    store: ChunkStore,
    policy: MergePolicy,
}

impl Assembler {
    pub fn new(store: ChunkStore) -> Self {
        Self::with_policy(store, MergePolicy::default())
    }

    pub fn with_policy(store: ChunkStore, policy: MergePolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    /// Merge every staged chunk of `id` into its artifact.
    ///
    /// With `expected_chunks` the staged set must be exactly
    /// `0..expected_chunks`; otherwise the configured policy decides whether
    /// gaps are tolerated.
    pub async fn merge(
        &self,
        id: &UploadId,
        expected_chunks: Option<u64>,
    ) -> Result<MergeOutcome, UploadError> {
        let guard = self.store.locks().begin_merge(id).await?;

        let chunks = self.store.read_all(id).await?;

        if let Some(record) = self.store.read_commit(id).await? {
            if let Some(outcome) = self.resume(id, record).await? {
                guard.complete();
                return Ok(outcome);
            }
        }

        if self.store.is_merged(id).await? {
            return Err(UploadError::Conflict(format!(
                "output file for upload {} already exists",
                id
            )));
        }

        if chunks.is_empty() {
            return Err(UploadError::EmptyUpload(id.to_string()));
        }

        self.check_complete(&chunks, expected_chunks)?;

        tracing::info!(
            upload_id = %id,
            chunks = chunks.len(),
            "Assembling file from chunks"
        );

        let mut writer = self.store.create_artifact(id).await?;
        // dropping the writer or the sealed artifact on any early return
        // removes the temp file
        for chunk in &chunks {
            writer.append(chunk).await?;
        }
        let sealed = writer.seal().await?;

        let record = CommitRecord {
            sha256: sealed.sha256.clone(),
            size: sealed.size,
            chunk_count: chunks.len(),
            merged_at: Utc::now(),
        };
        self.store.record_commit(id, &record).await?;

        let artifact = sealed.publish().await?;

        if let Err(e) = self.store.retire(id).await {
            // The artifact is final; the next merge call for this upload
            // finds the commit record and finishes the cleanup.
            tracing::warn!(
                upload_id = %id,
                error = %e,
                "Merged file is in place but staging cleanup failed"
            );
        }
        guard.complete();

        tracing::info!(
            upload_id = %id,
            path = %artifact.path.display(),
            size = artifact.size,
            sha256 = %artifact.sha256,
            "File merged"
        );

        Ok(MergeOutcome {
            upload_id: id.clone(),
            path: artifact.path,
            size: artifact.size,
            sha256: artifact.sha256,
            chunk_count: record.chunk_count,
            merged_at: record.merged_at,
        })
    }

    /// Finish a merge interrupted after its commit record was written.
    /// Returns `None` when the artifact never made it into place; the stale
    /// record is dropped and the caller merges from scratch.
    async fn resume(
        &self,
        id: &UploadId,
        record: CommitRecord,
    ) -> Result<Option<MergeOutcome>, UploadError> {
        if self.store.is_merged(id).await? {
            let artifact = self.store.describe_artifact(id).await?;
            if artifact.sha256 == record.sha256 {
                self.store.retire(id).await?;

                tracing::info!(
                    upload_id = %id,
                    path = %artifact.path.display(),
                    "Finished cleanup of an interrupted merge"
                );

                return Ok(Some(MergeOutcome {
                    upload_id: id.clone(),
                    path: artifact.path,
                    size: artifact.size,
                    sha256: artifact.sha256,
                    chunk_count: record.chunk_count,
                    merged_at: record.merged_at,
                }));
            }
        }

        tracing::debug!(upload_id = %id, "Discarding stale commit record");
        self.store.clear_commit(id).await?;
        Ok(None)
    }

    fn check_complete(
        &self,
        chunks: &[StagedChunk],
        expected_chunks: Option<u64>,
    ) -> Result<(), UploadError> {
        let staged: BTreeSet<u64> = chunks.iter().map(|chunk| chunk.index.value()).collect();

        let total = match expected_chunks {
            Some(total) => {
                if let Some(extra) = staged.range(total..).next() {
                    return Err(UploadError::InvalidArgument(format!(
                        "chunk {} is beyond the expected {} chunks",
                        extra, total
                    )));
                }
                total
            }
            None if self.policy.require_contiguous => {
                staged.last().map_or(0, |max| max.saturating_add(1))
            }
            None => return Ok(()),
        };

        // every staged index is below `total` at this point
        if staged.len() as u64 == total {
            return Ok(());
        }

        let missing = (0..total)
            .filter(|index| !staged.contains(index))
            .take(MAX_REPORTED_MISSING)
            .collect();
        Err(UploadError::IncompleteUpload { missing })
    }
}
