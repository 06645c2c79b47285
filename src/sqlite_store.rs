//! SQLite-backed [`Store`] implementation.
//!
//! Data sources and chunks live in the tables created by
//! [`migrate`](crate::migrate). Embeddings are stored inline on the chunk
//! row as little-endian `f32` BLOBs; vector search is a brute-force
//! cosine scan over the scoped rows. The embedding dimension in use is
//! recorded in `meta` under `embedding_dims`.
//!
//! SQLite's `lower()` folds ASCII only, so each chunk also stores
//! `text_folded`, its text lower-cased in Rust, and substring filters
//! compare against that column with a lower-cased needle.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use zerag_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use zerag_core::models::{
    Chunk, ChunkPage, ConnectionParams, DataSource, DataSourceUpdate, NewChunk, NewDataSource,
    SyncOutcome,
};
use zerag_core::store::{ChunkCandidate, Removal, Store};

const DIMS_KEY: &str = "embedding_dims";

const SOURCE_COLUMNS: &str = "id, name, kind, connection_json, chunk_strategy, sync_status, \
     sync_error, last_synced_at, sync_progress, created_at";

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn from_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn source_from_row(row: &SqliteRow) -> Result<DataSource> {
    let connection_json: String = row.get("connection_json");
    let connection: ConnectionParams = serde_json::from_str(&connection_json)
        .context("corrupt connection_json in data_sources")?;
    let kind: String = row.get("kind");
    let strategy: Option<String> = row.get("chunk_strategy");
    let status: String = row.get("sync_status");
    let last_synced: Option<i64> = row.get("last_synced_at");

    Ok(DataSource {
        id: row.get("id"),
        name: row.get("name"),
        kind: kind.parse()?,
        connection,
        chunk_strategy: strategy.map(|s| s.parse()).transpose()?,
        sync_status: status.parse()?,
        sync_error: row.get("sync_error"),
        last_synced_at: last_synced.map(from_ts),
        sync_progress: row.get("sync_progress"),
        created_at: from_ts(row.get("created_at")),
    })
}

fn chunk_from_row(row: &SqliteRow) -> Chunk {
    Chunk {
        id: row.get("id"),
        data_source_id: row.get("data_source_id"),
        unit_name: row.get("unit_name"),
        row_id: row.get("row_id"),
        chunk_index: row.get("chunk_index"),
        text: row.get("text"),
        hash: row.get("hash"),
    }
}

fn candidate_from_row(row: &SqliteRow, score: f64) -> ChunkCandidate {
    ChunkCandidate {
        chunk_id: row.get("id"),
        data_source_id: row.get("data_source_id"),
        unit_name: row.get("unit_name"),
        row_id: row.get("row_id"),
        text: row.get("text"),
        score,
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_data_source(&self, new: &NewDataSource) -> Result<DataSource> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO data_sources (name, kind, connection_json, chunk_strategy, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&new.name)
        .bind(new.kind.as_str())
        .bind(serde_json::to_string(&new.connection)?)
        .bind(new.chunk_strategy.map(|s| s.as_str()))
        .bind(Utc::now().timestamp())
        .fetch_one(&self.pool)
        .await?;

        self.get_data_source(id)
            .await?
            .context("data source vanished after insert")
    }

    async fn get_data_source(&self, id: i64) -> Result<Option<DataSource>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM data_sources WHERE id = ?",
            SOURCE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    async fn list_data_sources(&self) -> Result<Vec<DataSource>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM data_sources ORDER BY id",
            SOURCE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(source_from_row).collect()
    }

    async fn update_data_source(
        &self,
        id: i64,
        update: &DataSourceUpdate,
    ) -> Result<Option<DataSource>> {
        let connection_json = update
            .connection
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE data_sources SET
                name = COALESCE(?, name),
                connection_json = COALESCE(?, connection_json),
                chunk_strategy = COALESCE(?, chunk_strategy)
            WHERE id = ?
            "#,
        )
        .bind(&update.name)
        .bind(connection_json)
        .bind(update.chunk_strategy.map(|s| s.as_str()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_data_source(id).await
    }

    async fn delete_data_source(&self, id: i64) -> Result<Removal> {
        let mut tx = self.pool.begin().await?;
        let result =
            sqlx::query("DELETE FROM data_sources WHERE id = ? AND sync_status != 'syncing'")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        if result.rows_affected() == 0 {
            let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM data_sources WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
            tx.rollback().await?;
            return Ok(if exists.is_some() {
                Removal::Syncing
            } else {
                Removal::NotFound
            });
        }
        sqlx::query("DELETE FROM chunks WHERE data_source_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Removal::Deleted)
    }

    async fn try_begin_sync(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE data_sources
            SET sync_status = 'syncing', sync_error = NULL, sync_progress = 0
            WHERE id = ? AND sync_status != 'syncing'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.get_data_source(id).await?.is_none() {
            bail!("data source {} not found", id);
        }
        Ok(false)
    }

    async fn set_sync_progress(&self, id: i64, progress: i64) -> Result<()> {
        sqlx::query("UPDATE data_sources SET sync_progress = ? WHERE id = ?")
            .bind(progress.clamp(0, 100))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn finish_sync(&self, id: i64, outcome: &SyncOutcome) -> Result<()> {
        match outcome {
            SyncOutcome::Synced { at } => {
                sqlx::query(
                    r#"
                    UPDATE data_sources
                    SET sync_status = 'synced', sync_error = NULL,
                        last_synced_at = ?, sync_progress = 100
                    WHERE id = ?
                    "#,
                )
                .bind(at.timestamp())
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
            SyncOutcome::Failed { message } => {
                sqlx::query(
                    r#"
                    UPDATE data_sources
                    SET sync_status = 'error', sync_error = ?, sync_progress = 0
                    WHERE id = ?
                    "#,
                )
                .bind(message)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn reset_interrupted_syncs(&self, message: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE data_sources
            SET sync_status = 'error', sync_error = ?, sync_progress = 0
            WHERE sync_status = 'syncing'
            "#,
        )
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_chunks(&self, data_source_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chunks WHERE data_source_id = ?")
            .bind(data_source_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_chunks(&self, chunks: &[NewChunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        let recorded: Option<String> = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
            .bind(DIMS_KEY)
            .fetch_optional(&mut *tx)
            .await?;
        let expected = match recorded {
            Some(v) => v.parse::<usize>().context("corrupt embedding_dims in meta")?,
            None => {
                let dims = chunks[0].embedding.len();
                sqlx::query("INSERT INTO meta (key, value) VALUES (?, ?)")
                    .bind(DIMS_KEY)
                    .bind(dims.to_string())
                    .execute(&mut *tx)
                    .await?;
                dims
            }
        };

        for c in chunks {
            if c.embedding.len() != expected {
                bail!(
                    "embedding dimension {} does not match stored dimension {}",
                    c.embedding.len(),
                    expected
                );
            }
            sqlx::query(
                r#"
                INSERT INTO chunks (data_source_id, unit_name, row_id, chunk_index, text,
                                    text_folded, hash, embedding, dims)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(c.data_source_id)
            .bind(&c.unit_name)
            .bind(&c.row_id)
            .bind(c.chunk_index)
            .bind(&c.text)
            .bind(c.text.to_lowercase())
            .bind(c.hash())
            .bind(vec_to_blob(&c.embedding))
            .bind(c.embedding.len() as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn count_chunks(&self, data_source_id: i64) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE data_source_id = ?")
            .bind(data_source_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    async fn list_chunks(
        &self,
        data_source_id: i64,
        page: i64,
        page_size: i64,
        query: Option<&str>,
    ) -> Result<ChunkPage> {
        let filter = query
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_lowercase);
        let offset = (page.max(1) - 1) * page_size.max(0);

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM chunks
            WHERE data_source_id = ? AND (? IS NULL OR instr(text_folded, ?) > 0)
            "#,
        )
        .bind(data_source_id)
        .bind(&filter)
        .bind(&filter)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT id, data_source_id, unit_name, row_id, chunk_index, text, hash
            FROM chunks
            WHERE data_source_id = ? AND (? IS NULL OR instr(text_folded, ?) > 0)
            ORDER BY id
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(data_source_id)
        .bind(&filter)
        .bind(&filter)
        .bind(page_size.max(0))
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(ChunkPage {
            items: rows.iter().map(chunk_from_row).collect(),
            total,
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
        let rows = sqlx::query(
            r#"
            SELECT id, data_source_id, unit_name, row_id, text, embedding
            FROM chunks
            WHERE ? IS NULL OR data_source_id = ?
            "#,
        )
        .bind(scope)
        .bind(scope)
        .fetch_all(&self.pool)
        .await?;

        let mut scored: Vec<ChunkCandidate> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let sim = cosine_similarity(query_vec, &blob_to_vec(&blob));
                candidate_from_row(row, sim as f64)
            })
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
        if term.trim().is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT id, data_source_id, unit_name, row_id, text
            FROM chunks
            WHERE instr(text_folded, ?) > 0 AND (? IS NULL OR data_source_id = ?)
            ORDER BY id
            LIMIT ?
            "#,
        )
        .bind(term.to_lowercase())
        .bind(scope)
        .bind(scope)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|r| candidate_from_row(r, 0.0)).collect())
    }

    async fn source_chunks(&self, data_source_id: i64) -> Result<Vec<ChunkCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT id, data_source_id, unit_name, row_id, text
            FROM chunks
            WHERE data_source_id = ?
            ORDER BY id
            "#,
        )
        .bind(data_source_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| candidate_from_row(r, 0.0)).collect())
    }

    async fn embedding_dims(&self) -> Result<Option<usize>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
            .bind(DIMS_KEY)
            .fetch_optional(&self.pool)
            .await?;
        value
            .map(|v| v.parse::<usize>().context("corrupt embedding_dims in meta"))
            .transpose()
    }

    async fn invalidate_embeddings(&self, dims: usize, reason: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM chunks")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(DIMS_KEY)
        .bind(dims.to_string())
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE data_sources SET sync_status = 'pending', sync_error = ?, sync_progress = 0",
        )
        .bind(reason)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DbConfig};
    use crate::{db, migrate};
    use tempfile::TempDir;
    use zerag_core::models::{SourceKind, SyncStatus};

    async fn open() -> (TempDir, SqliteStore) {
        let tmp = TempDir::new().unwrap();
        let mut cfg = Config::minimal();
        cfg.db = DbConfig {
            path: tmp.path().join("z.sqlite"),
        };
        let pool = db::connect(&cfg).await.unwrap();
        migrate::migrate_pool(&pool).await.unwrap();
        (tmp, SqliteStore::new(pool))
    }

    fn file_source() -> NewDataSource {
        NewDataSource {
            name: "handbook".into(),
            kind: SourceKind::File,
            connection: ConnectionParams::default(),
            chunk_strategy: None,
        }
    }

    fn new_chunk(ds: i64, idx: i64, text: &str, v: Vec<f32>) -> NewChunk {
        NewChunk {
            data_source_id: ds,
            unit_name: "handbook.md".into(),
            row_id: Some(idx.to_string()),
            chunk_index: idx,
            text: text.into(),
            embedding: v,
        }
    }

    #[tokio::test]
    async fn source_roundtrip_and_update() {
        let (_tmp, store) = open().await;
        let ds = store.create_data_source(&file_source()).await.unwrap();
        assert_eq!(ds.sync_status, SyncStatus::Pending);
        assert_eq!(ds.kind, SourceKind::File);

        let updated = store
            .update_data_source(
                ds.id,
                &DataSourceUpdate {
                    name: Some("renamed".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.name, "renamed");
        assert!(store
            .update_data_source(999, &DataSourceUpdate::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn sync_state_transitions() {
        let (_tmp, store) = open().await;
        let ds = store.create_data_source(&file_source()).await.unwrap();
        assert!(store.try_begin_sync(ds.id).await.unwrap());
        assert!(!store.try_begin_sync(ds.id).await.unwrap());
        assert!(store.try_begin_sync(12345).await.is_err());

        let at = Utc::now();
        store
            .finish_sync(ds.id, &SyncOutcome::Synced { at })
            .await
            .unwrap();
        let got = store.get_data_source(ds.id).await.unwrap().unwrap();
        assert_eq!(got.sync_status, SyncStatus::Synced);
        assert_eq!(got.sync_progress, 100);
        assert_eq!(got.last_synced_at.unwrap().timestamp(), at.timestamp());

        assert!(store.try_begin_sync(ds.id).await.unwrap());
        assert_eq!(store.reset_interrupted_syncs("restart").await.unwrap(), 1);
        let got = store.get_data_source(ds.id).await.unwrap().unwrap();
        assert_eq!(got.sync_status, SyncStatus::Error);
        assert_eq!(got.sync_error.as_deref(), Some("restart"));
    }

    #[tokio::test]
    async fn chunks_search_and_cascade() {
        let (_tmp, store) = open().await;
        let ds = store.create_data_source(&file_source()).await.unwrap();
        store
            .insert_chunks(&[
                new_chunk(ds.id, 0, "Our Refund Policy lasts 30 days.", vec![1.0, 0.0]),
                new_chunk(ds.id, 1, "Shipping takes two days.", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();
        assert_eq!(store.count_chunks(ds.id).await.unwrap(), 2);
        assert_eq!(store.embedding_dims().await.unwrap(), Some(2));

        let hits = store
            .keyword_search("refund policy", Some(ds.id), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].row_id.as_deref(), Some("0"));

        let hits = store.vector_search(&[0.1, 1.0], None, 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].text.starts_with("Shipping"));

        let page = store.list_chunks(ds.id, 1, 1, Some("days")).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);

        assert!(store
            .insert_chunks(&[new_chunk(ds.id, 2, "bad", vec![1.0, 0.0, 0.0])])
            .await
            .is_err());

        assert_eq!(store.delete_data_source(ds.id).await.unwrap(), Removal::Deleted);
        assert_eq!(store.count_chunks(ds.id).await.unwrap(), 0);
        assert_eq!(store.delete_data_source(ds.id).await.unwrap(), Removal::NotFound);
    }

    #[tokio::test]
    async fn keyword_filters_fold_non_ascii_case() {
        let (_tmp, store) = open().await;
        let ds = store.create_data_source(&file_source()).await.unwrap();
        store
            .insert_chunks(&[
                new_chunk(ds.id, 0, "Überweisung dauert drei Tage.", vec![1.0, 0.0]),
                new_chunk(ds.id, 1, "ÉTÉ sale starts in June.", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let hits = store
            .keyword_search("überweisung", Some(ds.id), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "Überweisung dauert drei Tage.");

        let hits = store.keyword_search("Été", None, 10).await.unwrap();
        assert_eq!(hits.len(), 1);

        let page = store.list_chunks(ds.id, 1, 10, Some("ÜBERWEISUNG")).await.unwrap();
        assert_eq!(page.total, 1);

        let all = store.source_chunks(ds.id).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].chunk_id < all[1].chunk_id);
    }

    #[tokio::test]
    async fn syncing_source_survives_delete() {
        let (_tmp, store) = open().await;
        let ds = store.create_data_source(&file_source()).await.unwrap();
        assert!(store.try_begin_sync(ds.id).await.unwrap());
        assert_eq!(store.delete_data_source(ds.id).await.unwrap(), Removal::Syncing);
        assert!(store.get_data_source(ds.id).await.unwrap().is_some());

        store
            .finish_sync(ds.id, &SyncOutcome::Failed { message: "x".into() })
            .await
            .unwrap();
        assert_eq!(store.delete_data_source(ds.id).await.unwrap(), Removal::Deleted);
    }

    #[tokio::test]
    async fn invalidation_clears_chunks_and_records_dims() {
        let (_tmp, store) = open().await;
        let ds = store.create_data_source(&file_source()).await.unwrap();
        store
            .insert_chunks(&[new_chunk(ds.id, 0, "x", vec![1.0, 0.0])])
            .await
            .unwrap();
        assert_eq!(store.invalidate_embeddings(8, "model changed").await.unwrap(), 1);
        assert_eq!(store.embedding_dims().await.unwrap(), Some(8));
        let got = store.get_data_source(ds.id).await.unwrap().unwrap();
        assert_eq!(got.sync_status, SyncStatus::Pending);
        assert_eq!(got.sync_error.as_deref(), Some("model changed"));
    }
}
