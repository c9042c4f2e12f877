//! Chunked Upload Module
//!
//! Large files arrive as independently uploaded chunks and are reassembled
//! on the server:
//! - Chunks are staged per upload, one file per chunk index
//! - Clients query which indices arrived to skip or resume chunks
//! - A merge concatenates the chunks in numeric index order, exactly once
//!
//! Protocol Flow:
//! 1. Client uploads chunks in any order (`ChunkStore::put`)
//! 2. Client optionally asks which chunks are staged (`ChunkStore::list_indices`)
//! 3. Client asks for the merge (`Assembler::merge`)

pub mod assembler;
pub mod chunk_store;
pub mod key;
mod layout;
pub mod locks;
pub mod types;

pub use assembler::{Assembler, MergePolicy};
pub use chunk_store::{ChunkStore, FinalizedArtifact, StagedChunk};
pub use key::{ChunkIndex, UploadId};
pub use locks::UploadLocks;
pub use types::*;
