//! Per-source BM25 indexes, built lazily and dropped on re-sync.
//!
//! An index is built from [`Store::source_chunks`] the first time a
//! source is searched and cached until the sync orchestrator finishes a
//! run for that source (or a source is deleted). The cache is bounded;
//! the least useful indexes are evicted when it is full.

use mini_moka::sync::Cache;
use std::sync::Arc;

use zerag_core::bm25::Bm25Index;
use zerag_core::store::{ChunkCandidate, Store};

use crate::error::RagResult;

pub struct KeywordIndex {
    store: Arc<dyn Store>,
    indexes: Cache<i64, Arc<Bm25Index>>,
}

impl KeywordIndex {
    pub fn new(store: Arc<dyn Store>, capacity: usize) -> Self {
        Self {
            store,
            indexes: Cache::builder().max_capacity(capacity.max(1) as u64).build(),
        }
    }

    async fn index_for(&self, data_source_id: i64) -> RagResult<Arc<Bm25Index>> {
        if let Some(index) = self.indexes.get(&data_source_id) {
            return Ok(index);
        }
        let chunks = self.store.source_chunks(data_source_id).await?;
        let index = Arc::new(Bm25Index::build(chunks));
        tracing::info!(
            data_source_id,
            chunks = index.len(),
            vocabulary = index.vocabulary_size(),
            "bm25 index built"
        );
        self.indexes.insert(data_source_id, index.clone());
        Ok(index)
    }

    /// Rank the source's chunks against `query`. Scores are raw BM25.
    pub async fn search(
        &self,
        data_source_id: i64,
        query: &str,
        limit: usize,
    ) -> RagResult<Vec<ChunkCandidate>> {
        Ok(self.index_for(data_source_id).await?.search(query, limit))
    }

    pub fn invalidate(&self, data_source_id: i64) {
        self.indexes.invalidate(&data_source_id);
        tracing::debug!(data_source_id, "bm25 index invalidated");
    }

    pub fn invalidate_all(&self) {
        let ids: Vec<i64> = self.indexes.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.indexes.invalidate(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerag_core::models::{ConnectionParams, NewChunk, NewDataSource, SourceKind};
    use zerag_core::store::memory::InMemoryStore;

    async fn add(store: &InMemoryStore, ds: i64, idx: i64, text: &str) {
        store
            .insert_chunks(&[NewChunk {
                data_source_id: ds,
                unit_name: "kb.md".into(),
                row_id: None,
                chunk_index: idx,
                text: text.into(),
                embedding: vec![1.0],
            }])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn index_is_cached_until_invalidated() {
        let store = Arc::new(InMemoryStore::new());
        let ds = store
            .create_data_source(&NewDataSource {
                name: "kb".into(),
                kind: SourceKind::File,
                connection: ConnectionParams::default(),
                chunk_strategy: None,
            })
            .await
            .unwrap();
        add(&store, ds.id, 0, "Refunds take 30 days.").await;

        let index = KeywordIndex::new(store.clone(), 4);
        assert_eq!(index.search(ds.id, "refunds", 5).await.unwrap().len(), 1);

        add(&store, ds.id, 1, "Refunds go to the original card.").await;
        assert_eq!(index.search(ds.id, "refunds", 5).await.unwrap().len(), 1);

        index.invalidate(ds.id);
        assert_eq!(index.search(ds.id, "refunds", 5).await.unwrap().len(), 2);

        add(&store, ds.id, 2, "Refunds are final.").await;
        index.invalidate_all();
        assert_eq!(index.search(ds.id, "refunds", 5).await.unwrap().len(), 3);
    }
}
