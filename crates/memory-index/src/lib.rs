//! Per-agent local semantic memory index.
//!
//! A hybrid (dense-vector + lexical) search engine over a workspace of
//! Markdown notes and append-only chat transcripts. The overall flow is:
//! 1. The manager discovers memory documents and session transcripts,
//!    chunks them, and embeds each chunk through the configured provider
//!    (local model, OpenAI-compatible, or Gemini-compatible remote).
//! 2. Chunks, vectors, and metadata persist in an embedded SQLite store
//!    with a sqlite-vec virtual table for kNN and an FTS5 table for BM25.
//! 3. Watchers, transcript append deltas, and timers keep the index in
//!    sync; changing the provider or chunking settings triggers a full
//!    reindex into a shadow store that is atomically swapped in.
//! 4. Queries merge normalized vector and keyword scores into one ranked
//!    list.

mod batch;
mod chunking;
mod config;
mod error;
mod manager;
mod provider;
mod search;
mod session;
mod store;
mod sync;

#[cfg(test)]
mod tests;

pub use chunking::Chunk;
pub use config::{
    BatchConfig, CacheConfig, ChunkingConfig, LocalProviderConfig, MemoryConfig, MemorySource,
    ProviderConfig, ProviderSelection, QueryConfig, RemoteProviderConfig, StoreConfig, SyncConfig,
    VectorConfig,
};
pub use error::MemoryError;
pub use manager::{MemoryManager, MemoryStatus, ReadFileOptions};
pub use provider::{FallbackInfo, ProviderId};
pub use search::{SearchOptions, SearchResult};
pub use store::IndexFingerprint;
pub use sync::{SyncOptions, SyncProgress, SyncReason, SyncReport};
