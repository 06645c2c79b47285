//! Keyword search straight against a relational source.
//!
//! Used when the fused retrieval list looks weak. The statement is always
//! built from the source's verified table and column names with keywords
//! bound as parameters; no SQL text from the caller is ever executed, and
//! the connection is opened read-only.
//!
//! Connectors (and their pools) are kept per source id and reused until
//! they sit idle or the source's connection parameters change.

use mini_moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;

use zerag_core::models::{ConnectionParams, DataSource, Origin, RetrievedFragment, SourceKind};

use crate::config::SyncConfig;
use crate::connector_relational::RelationalConnector;
use crate::error::{RagError, RagResult};
use crate::rewrite::lexical_keywords;
use crate::traits::with_timeout;

/// Rows returned per attempt, across all tables.
pub const MAX_FALLBACK_ROWS: usize = 10;

const MAX_CACHED_CONNECTORS: u64 = 16;
const CONNECTOR_IDLE: Duration = Duration::from_secs(10 * 60);

struct CachedConnector {
    kind: SourceKind,
    connection: ConnectionParams,
    connector: Arc<RelationalConnector>,
}

pub struct SqlFallback {
    sync: SyncConfig,
    max_keywords: usize,
    connectors: Cache<i64, Arc<CachedConnector>>,
}

impl SqlFallback {
    pub fn new(sync: SyncConfig, max_keywords: usize) -> Self {
        Self {
            sync,
            max_keywords,
            connectors: Cache::builder()
                .max_capacity(MAX_CACHED_CONNECTORS)
                .time_to_idle(CONNECTOR_IDLE)
                .build(),
        }
    }

    /// The cached connector for `source`, or a fresh one when none is
    /// cached or the cached one was built from other parameters.
    pub(crate) fn connector_for(&self, source: &DataSource) -> RagResult<Arc<RelationalConnector>> {
        if let Some(cached) = self.connectors.get(&source.id) {
            if cached.kind == source.kind && cached.connection == source.connection {
                return Ok(cached.connector.clone());
            }
            tracing::debug!(data_source_id = source.id, "connection changed, reconnecting");
        }
        let connector = Arc::new(RelationalConnector::new(
            source.kind,
            &source.connection,
            &self.sync,
        )?);
        self.connectors.insert(
            source.id,
            Arc::new(CachedConnector {
                kind: source.kind,
                connection: source.connection.clone(),
                connector: connector.clone(),
            }),
        );
        Ok(connector)
    }

    /// Search the source's readable tables for rows mentioning any keyword.
    ///
    /// Without keywords, lexical keywords are extracted from `question`.
    /// Rows are ranked by the fraction of keywords they contain.
    pub async fn attempt(
        &self,
        question: &str,
        keywords: &[String],
        source: &DataSource,
    ) -> RagResult<Vec<RetrievedFragment>> {
        if !source.kind.is_relational() {
            return Err(RagError::validation(format!(
                "SQL fallback needs a relational source, '{}' is {}",
                source.name, source.kind
            )));
        }

        let mut keywords: Vec<String> = keywords
            .iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .take(self.max_keywords)
            .collect();
        if keywords.is_empty() {
            keywords = lexical_keywords(question, self.max_keywords);
        }
        if keywords.is_empty() {
            return Ok(Vec::new());
        }

        let connector = self.connector_for(source)?;
        let timeout = Duration::from_secs(self.sync.fetch_timeout_secs);
        with_timeout(
            timeout,
            "searching rows",
            self.search(&connector, &keywords),
        )
        .await
    }

    async fn search(
        &self,
        connector: &RelationalConnector,
        keywords: &[String],
    ) -> RagResult<Vec<RetrievedFragment>> {
        let total = keywords.len() as f64;
        let mut out = Vec::new();

        for table in connector.schema().await? {
            let remaining = MAX_FALLBACK_ROWS - out.len();
            if remaining == 0 {
                break;
            }
            let hits = connector
                .search_rows(&table.table, &[], keywords, remaining)
                .await?;
            out.extend(hits.into_iter().map(|hit| RetrievedFragment {
                chunk_id: None,
                chunk_text: hit.text,
                table_name: table.table.clone(),
                row_id: Some(hit.row_id),
                similarity: (hit.matched as f64 / total).min(1.0),
                origin: Origin::Sql,
                rerank_score: None,
            }));
        }

        out.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use tempfile::TempDir;
    use zerag_core::models::{ConnectionParams, SourceKind, SyncStatus};

    fn source(kind: SourceKind, connection: ConnectionParams) -> DataSource {
        DataSource {
            id: 1,
            name: "shop".into(),
            kind,
            connection,
            chunk_strategy: None,
            sync_status: SyncStatus::Synced,
            sync_error: None,
            last_synced_at: None,
            sync_progress: 100,
            created_at: Utc::now(),
        }
    }

    async fn shop(dir: &TempDir) -> ConnectionParams {
        let path = dir.path().join("shop.db");
        let pool = SqlitePoolOptions::new()
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(&path)
                    .create_if_missing(true),
            )
            .await
            .unwrap();
        sqlx::query("CREATE TABLE policies (id INTEGER PRIMARY KEY, title TEXT, body TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        for i in 1..=15 {
            sqlx::query("INSERT INTO policies (id, title, body) VALUES (?, ?, ?)")
                .bind(i)
                .bind(if i == 7 { "Refund policy" } else { "Refund note" })
                .bind("details")
                .execute(&pool)
                .await
                .unwrap();
        }
        pool.close().await;
        ConnectionParams {
            sqlite_path: Some(path.to_string_lossy().into_owned()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn rows_become_sql_fragments() {
        let tmp = TempDir::new().unwrap();
        let params = shop(&tmp).await;
        let fallback = SqlFallback::new(SyncConfig::default(), 5);
        let rows = fallback
            .attempt(
                "refund policy?",
                &["refund policy".into(), "refund".into()],
                &source(SourceKind::Sqlite, params),
            )
            .await
            .unwrap();

        assert_eq!(rows.len(), MAX_FALLBACK_ROWS);
        assert!(rows.iter().all(|r| r.origin == Origin::Sql && r.chunk_id.is_none()));
        assert_eq!(rows[0].row_id.as_deref(), Some("7"));
        assert_eq!(rows[0].similarity, 1.0);
        assert_eq!(rows[1].similarity, 0.5);
        assert_eq!(rows[0].table_name, "policies");
    }

    #[tokio::test]
    async fn connectors_are_reused_per_source() {
        let tmp = TempDir::new().unwrap();
        let params = shop(&tmp).await;
        let fallback = SqlFallback::new(SyncConfig::default(), 5);
        let mut ds = source(SourceKind::Sqlite, params);

        let first = fallback.connector_for(&ds).unwrap();
        let again = fallback.connector_for(&ds).unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        let rows = fallback.attempt("refund", &[], &ds).await.unwrap();
        assert!(!rows.is_empty());
        assert!(Arc::ptr_eq(&first, &fallback.connector_for(&ds).unwrap()));

        let other = tmp.path().join("other.db");
        ds.connection.sqlite_path = Some(other.to_string_lossy().into_owned());
        let moved = fallback.connector_for(&ds).unwrap();
        assert!(!Arc::ptr_eq(&first, &moved));
    }

    #[tokio::test]
    async fn non_relational_sources_are_rejected() {
        let fallback = SqlFallback::new(SyncConfig::default(), 5);
        let result = fallback
            .attempt("q", &[], &source(SourceKind::Web, ConnectionParams::default()))
            .await;
        assert!(matches!(result, Err(RagError::Validation(_))));
    }

    #[tokio::test]
    async fn missing_database_is_an_error_not_a_panic() {
        let fallback = SqlFallback::new(SyncConfig::default(), 5);
        let params = ConnectionParams {
            sqlite_path: Some("/nonexistent/zerag/shop.db".into()),
            ..Default::default()
        };
        let result = fallback
            .attempt("refund", &[], &source(SourceKind::Sqlite, params))
            .await;
        assert!(result.is_err());
    }
}
