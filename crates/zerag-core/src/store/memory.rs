//! In-memory [`Store`] implementation for tests.
//!
//! All state lives in one struct behind a `std::sync::RwLock`, so the
//! sync compare-and-set is a single write-locked section. Vector search is
//! brute-force cosine similarity.

use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::embedding::cosine_similarity;
use crate::models::{
    Chunk, ChunkPage, DataSource, DataSourceUpdate, NewChunk, NewDataSource, SyncOutcome,
    SyncStatus,
};

use super::{ChunkCandidate, Removal, Store};

struct StoredChunk {
    chunk: Chunk,
    embedding: Vec<f32>,
}

#[derive(Default)]
struct Inner {
    sources: BTreeMap<i64, DataSource>,
    chunks: Vec<StoredChunk>,
    next_source_id: i64,
    next_chunk_id: i64,
    dims: Option<usize>,
}

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn candidate(sc: &StoredChunk, score: f64) -> ChunkCandidate {
    ChunkCandidate {
        chunk_id: sc.chunk.id,
        data_source_id: sc.chunk.data_source_id,
        unit_name: sc.chunk.unit_name.clone(),
        row_id: sc.chunk.row_id.clone(),
        text: sc.chunk.text.clone(),
        score,
    }
}

fn in_scope(sc: &StoredChunk, scope: Option<i64>) -> bool {
    scope.map_or(true, |id| sc.chunk.data_source_id == id)
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_data_source(&self, new: &NewDataSource) -> Result<DataSource> {
        let mut inner = self.inner.write().unwrap();
        inner.next_source_id += 1;
        let ds = DataSource {
            id: inner.next_source_id,
            name: new.name.clone(),
            kind: new.kind,
            connection: new.connection.clone(),
            chunk_strategy: new.chunk_strategy,
            sync_status: SyncStatus::Pending,
            sync_error: None,
            last_synced_at: None,
            sync_progress: 0,
            created_at: Utc::now(),
        };
        inner.sources.insert(ds.id, ds.clone());
        Ok(ds)
    }

    async fn get_data_source(&self, id: i64) -> Result<Option<DataSource>> {
        Ok(self.inner.read().unwrap().sources.get(&id).cloned())
    }

    async fn list_data_sources(&self) -> Result<Vec<DataSource>> {
        Ok(self.inner.read().unwrap().sources.values().cloned().collect())
    }

    async fn update_data_source(
        &self,
        id: i64,
        update: &DataSourceUpdate,
    ) -> Result<Option<DataSource>> {
        let mut inner = self.inner.write().unwrap();
        let Some(ds) = inner.sources.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(name) = &update.name {
            ds.name = name.clone();
        }
        if let Some(conn) = &update.connection {
            ds.connection = conn.clone();
        }
        if update.chunk_strategy.is_some() {
            ds.chunk_strategy = update.chunk_strategy;
        }
        Ok(Some(ds.clone()))
    }

    async fn delete_data_source(&self, id: i64) -> Result<Removal> {
        let mut inner = self.inner.write().unwrap();
        match inner.sources.get(&id) {
            None => return Ok(Removal::NotFound),
            Some(ds) if ds.sync_status == SyncStatus::Syncing => return Ok(Removal::Syncing),
            Some(_) => {}
        }
        inner.sources.remove(&id);
        inner.chunks.retain(|sc| sc.chunk.data_source_id != id);
        Ok(Removal::Deleted)
    }

    async fn try_begin_sync(&self, id: i64) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();
        let Some(ds) = inner.sources.get_mut(&id) else {
            bail!("data source {} not found", id);
        };
        if ds.sync_status == SyncStatus::Syncing {
            return Ok(false);
        }
        ds.sync_status = SyncStatus::Syncing;
        ds.sync_error = None;
        ds.sync_progress = 0;
        Ok(true)
    }

    async fn set_sync_progress(&self, id: i64, progress: i64) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if let Some(ds) = inner.sources.get_mut(&id) {
            ds.sync_progress = progress.clamp(0, 100);
        }
        Ok(())
    }

    async fn finish_sync(&self, id: i64, outcome: &SyncOutcome) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if let Some(ds) = inner.sources.get_mut(&id) {
            match outcome {
                SyncOutcome::Synced { at } => {
                    ds.sync_status = SyncStatus::Synced;
                    ds.sync_error = None;
                    ds.last_synced_at = Some(*at);
                    ds.sync_progress = 100;
                }
                SyncOutcome::Failed { message } => {
                    ds.sync_status = SyncStatus::Error;
                    ds.sync_error = Some(message.clone());
                    ds.sync_progress = 0;
                }
            }
        }
        Ok(())
    }

    async fn reset_interrupted_syncs(&self, message: &str) -> Result<u64> {
        let mut inner = self.inner.write().unwrap();
        let mut n = 0;
        for ds in inner.sources.values_mut() {
            if ds.sync_status == SyncStatus::Syncing {
                ds.sync_status = SyncStatus::Error;
                ds.sync_error = Some(message.to_string());
                ds.sync_progress = 0;
                n += 1;
            }
        }
        Ok(n)
    }

    async fn delete_chunks(&self, data_source_id: i64) -> Result<u64> {
        let mut inner = self.inner.write().unwrap();
        let before = inner.chunks.len();
        inner
            .chunks
            .retain(|sc| sc.chunk.data_source_id != data_source_id);
        Ok((before - inner.chunks.len()) as u64)
    }

    async fn insert_chunks(&self, chunks: &[NewChunk]) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        for c in chunks {
            let expected = *inner.dims.get_or_insert(c.embedding.len());
            if expected != c.embedding.len() {
                bail!(
                    "embedding dimension {} does not match stored dimension {}",
                    c.embedding.len(),
                    expected
                );
            }
        }
        for c in chunks {
            inner.next_chunk_id += 1;
            let chunk = Chunk {
                id: inner.next_chunk_id,
                data_source_id: c.data_source_id,
                unit_name: c.unit_name.clone(),
                row_id: c.row_id.clone(),
                chunk_index: c.chunk_index,
                text: c.text.clone(),
                hash: c.hash(),
            };
            inner.chunks.push(StoredChunk {
                chunk,
                embedding: c.embedding.clone(),
            });
        }
        Ok(())
    }

    async fn count_chunks(&self, data_source_id: i64) -> Result<i64> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .chunks
            .iter()
            .filter(|sc| sc.chunk.data_source_id == data_source_id)
            .count() as i64)
    }

    async fn list_chunks(
        &self,
        data_source_id: i64,
        page: i64,
        page_size: i64,
        query: Option<&str>,
    ) -> Result<ChunkPage> {
        let inner = self.inner.read().unwrap();
        let needle = query.map(|q| q.to_lowercase());
        let matching: Vec<&Chunk> = inner
            .chunks
            .iter()
            .map(|sc| &sc.chunk)
            .filter(|c| c.data_source_id == data_source_id)
            .filter(|c| {
                needle
                    .as_ref()
                    .map_or(true, |n| c.text.to_lowercase().contains(n))
            })
            .collect();
        let offset = ((page.max(1) - 1) * page_size.max(0)) as usize;
        Ok(ChunkPage {
            total: matching.len() as i64,
            items: matching
                .into_iter()
                .skip(offset)
                .take(page_size.max(0) as usize)
                .cloned()
                .collect(),
            page,
            page_size,
        })
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        scope: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        let inner = self.inner.read().unwrap();
        let mut scored: Vec<ChunkCandidate> = inner
            .chunks
            .iter()
            .filter(|sc| in_scope(sc, scope))
            .map(|sc| candidate(sc, cosine_similarity(query_vec, &sc.embedding) as f64))
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn keyword_search(
        &self,
        term: &str,
        scope: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        let needle = term.to_lowercase();
        if needle.trim().is_empty() {
            return Ok(Vec::new());
        }
        let inner = self.inner.read().unwrap();
        Ok(inner
            .chunks
            .iter()
            .filter(|sc| in_scope(sc, scope))
            .filter(|sc| sc.chunk.text.to_lowercase().contains(&needle))
            .take(limit)
            .map(|sc| candidate(sc, 0.0))
            .collect())
    }

    async fn source_chunks(&self, data_source_id: i64) -> Result<Vec<ChunkCandidate>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .chunks
            .iter()
            .filter(|sc| sc.chunk.data_source_id == data_source_id)
            .map(|sc| candidate(sc, 0.0))
            .collect())
    }

    async fn embedding_dims(&self) -> Result<Option<usize>> {
        Ok(self.inner.read().unwrap().dims)
    }

    async fn invalidate_embeddings(&self, dims: usize, reason: &str) -> Result<u64> {
        let mut inner = self.inner.write().unwrap();
        let removed = inner.chunks.len() as u64;
        inner.chunks.clear();
        inner.dims = Some(dims);
        for ds in inner.sources.values_mut() {
            ds.sync_status = SyncStatus::Pending;
            ds.sync_error = Some(reason.to_string());
            ds.sync_progress = 0;
        }
        Ok(removed)
    }
}
