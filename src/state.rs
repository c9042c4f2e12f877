//! Application state management

use std::sync::Arc;

use crate::config::Config;
use crate::upload::{Assembler, ChunkStore, MergePolicy, UploadError};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    pub config: Config,
    pub chunk_store: ChunkStore,
    pub assembler: Assembler,
}

impl AppState {
    /// Create a new application state
    ///
    /// Opens the chunk store under the configured upload directory, creating
    /// it on first start.
    pub async fn new(config: Config) -> Result<Self, UploadError> {
        let chunk_store = ChunkStore::open(config.storage.upload_dir.clone()).await?;
        let assembler = Assembler::with_policy(
            chunk_store.clone(),
            MergePolicy {
                require_contiguous: config.merge.require_contiguous,
            },
        );

        Ok(Self {
            inner: Arc::new(AppStateInner {
                config,
                chunk_store,
                assembler,
            }),
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the chunk store
    pub fn chunk_store(&self) -> &ChunkStore {
        &self.inner.chunk_store
    }

    /// Get the assembler
    pub fn assembler(&self) -> &Assembler {
        &self.inner.assembler
    }
}
