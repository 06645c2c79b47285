//! Storage abstraction for data sources and their chunks.
//!
//! The [`Store`] trait defines every persistence operation the sync
//! orchestrator and retrieval engine need, so both can run against
//! SQLite in production and [`memory::InMemoryStore`] in tests.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    ChunkPage, DataSource, DataSourceUpdate, NewChunk, NewDataSource, SyncOutcome,
};

/// A chunk matched by keyword or vector search.
#[derive(Debug, Clone)]
pub struct ChunkCandidate {
    pub chunk_id: i64,
    pub data_source_id: i64,
    pub unit_name: String,
    pub row_id: Option<String>,
    pub text: String,
    /// Cosine similarity for vector search; the caller assigns a proxy
    /// score to keyword hits.
    pub score: f64,
}

/// Result of [`Store::delete_data_source`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Deleted,
    NotFound,
    /// The source is mid-sync and was left untouched.
    Syncing,
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create_data_source`](Store::create_data_source) | Insert a source in `pending` state |
/// | [`delete_data_source`](Store::delete_data_source) | Delete an idle source and all its chunks |
/// | [`try_begin_sync`](Store::try_begin_sync) | Atomic transition into `syncing` |
/// | [`finish_sync`](Store::finish_sync) | Transition out of `syncing` |
/// | [`insert_chunks`](Store::insert_chunks) | Persist chunks with embeddings |
/// | [`vector_search`](Store::vector_search) | Cosine nearest neighbours |
/// | [`keyword_search`](Store::keyword_search) | Case-insensitive substring match |
/// | [`source_chunks`](Store::source_chunks) | Every chunk of a source, for BM25 indexing |
#[async_trait]
pub trait Store: Send + Sync {
    // ═══ Data sources ═══

    async fn create_data_source(&self, new: &NewDataSource) -> Result<DataSource>;

    async fn get_data_source(&self, id: i64) -> Result<Option<DataSource>>;

    async fn list_data_sources(&self) -> Result<Vec<DataSource>>;

    /// Apply owner edits. Returns `None` if the source does not exist.
    async fn update_data_source(
        &self,
        id: i64,
        update: &DataSourceUpdate,
    ) -> Result<Option<DataSource>>;

    /// Delete a source and cascade to its chunks, unless it is syncing.
    /// The status check and the delete are one atomic step.
    async fn delete_data_source(&self, id: i64) -> Result<Removal>;

    // ═══ Sync state ═══

    /// Move a source into `syncing` unless it is already there.
    ///
    /// This is a compare-and-set: under any number of concurrent callers
    /// exactly one observes `true`. Clears the previous error and resets
    /// progress to zero.
    async fn try_begin_sync(&self, id: i64) -> Result<bool>;

    async fn set_sync_progress(&self, id: i64, progress: i64) -> Result<()>;

    /// Leave `syncing` for `synced` or `error`.
    async fn finish_sync(&self, id: i64, outcome: &SyncOutcome) -> Result<()>;

    /// Mark every source left in `syncing` (by a crashed process) as
    /// `error`. Returns how many were reset.
    async fn reset_interrupted_syncs(&self, message: &str) -> Result<u64>;

    // ═══ Chunks ═══

    /// Delete all chunks of a source. Returns the number removed.
    async fn delete_chunks(&self, data_source_id: i64) -> Result<u64>;

    /// Insert chunks. Fails if any embedding length differs from the
    /// dimension already recorded for the store.
    async fn insert_chunks(&self, chunks: &[NewChunk]) -> Result<()>;

    async fn count_chunks(&self, data_source_id: i64) -> Result<i64>;

    /// Page through chunks ordered by id, optionally filtered by a
    /// case-insensitive substring. `page` is 1-based.
    async fn list_chunks(
        &self,
        data_source_id: i64,
        page: i64,
        page_size: i64,
        query: Option<&str>,
    ) -> Result<ChunkPage>;

    /// Cosine similarity search. `scope` restricts to one data source.
    async fn vector_search(
        &self,
        query_vec: &[f32],
        scope: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>>;

    /// Substring search for one term, case-insensitive under Unicode
    /// lower-casing. Hits carry `score = 0.0`.
    async fn keyword_search(
        &self,
        term: &str,
        scope: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>>;

    /// Every chunk of one source ordered by id, with `score = 0.0`.
    async fn source_chunks(&self, data_source_id: i64) -> Result<Vec<ChunkCandidate>>;

    // ═══ Embedding dimension bookkeeping ═══

    /// Dimension of stored embeddings, if any were recorded.
    async fn embedding_dims(&self) -> Result<Option<usize>>;

    /// Drop every chunk, record the new dimension, and reset every
    /// source to `pending` with `reason` as its error message.
    async fn invalidate_embeddings(&self, dims: usize, reason: &str) -> Result<u64>;
}
