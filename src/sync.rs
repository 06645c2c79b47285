//! Sync orchestration: turning a data source into stored, embedded chunks.
//!
//! ```text
//! trigger(id)
//!   ├─ load source ............................ UnknownDataSource
//!   ├─ build connector, test_connection ....... Validation / Connection
//!   ├─ try_begin_sync (compare-and-set) ....... Conflict
//!   └─ spawn supervisor ──▶ job ──▶ finish_sync(synced | error) ──▶ drop BM25 index
//!                                 │
//!        delete old chunks ◀──────┤
//!        for each unit: pull (timeout) ─▶ chunk ─▶ embed ─▶ insert ─▶ progress
//! ```
//!
//! Callers learn the result only by polling [`SyncOrchestrator::status`].
//! The supervisor awaits the job's `JoinHandle`, so a panicking job still
//! leaves the source in `error` rather than stuck in `syncing`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;
use uuid::Uuid;

use zerag_core::chunk::chunk;
use zerag_core::models::{DataSource, NewChunk, SyncOutcome, SyncStatus};
use zerag_core::store::Store;

use crate::config::{ChunkingConfig, Config};
use crate::embedding::EmbeddingService;
use crate::error::{RagError, RagResult};
use crate::keyword_index::KeywordIndex;
use crate::progress::{unit_percent, NoProgress, SyncProgressEvent, SyncProgressReporter};
use crate::traits::{pull_with_timeout, with_timeout, Connector, ConnectorFactory};

pub const INTERRUPTED_MESSAGE: &str = "interrupted by restart";
pub const NO_CONTENT_MESSAGE: &str = "no ingestible content";

/// Returned by [`SyncOrchestrator::trigger`] once the job is running.
#[derive(Debug, Clone, Serialize)]
pub struct SyncAck {
    pub message: String,
    pub data_source_id: i64,
}

/// Polling view of a source's sync state.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatusView {
    pub sync_status: SyncStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
    pub chunk_count: i64,
    pub sync_progress: i64,
}

/// What startup reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciled {
    pub interrupted: u64,
    pub invalidated_chunks: u64,
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    store: Arc<dyn Store>,
    embeddings: Arc<EmbeddingService>,
    connectors: Arc<dyn ConnectorFactory>,
    chunking: ChunkingConfig,
    fetch_timeout: Duration,
    progress: Arc<dyn SyncProgressReporter>,
    keyword_index: Option<Arc<KeywordIndex>>,
}

impl SyncOrchestrator {
    pub fn new(
        config: &Config,
        store: Arc<dyn Store>,
        embeddings: Arc<EmbeddingService>,
        connectors: Arc<dyn ConnectorFactory>,
    ) -> Self {
        Self {
            store,
            embeddings,
            connectors,
            chunking: config.chunking.clone(),
            fetch_timeout: Duration::from_secs(config.sync.fetch_timeout_secs),
            progress: Arc::new(NoProgress),
            keyword_index: None,
        }
    }

    /// Drop a source's BM25 index whenever one of its syncs finishes.
    pub fn with_keyword_index(mut self, index: Arc<KeywordIndex>) -> Self {
        self.keyword_index = Some(index);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn SyncProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    async fn load(&self, id: i64) -> RagResult<DataSource> {
        self.store
            .get_data_source(id)
            .await?
            .ok_or(RagError::UnknownDataSource(id))
    }

    /// Build the source's connector and check it can reach something.
    pub async fn test_connection(&self, id: i64) -> RagResult<()> {
        let source = self.load(id).await?;
        let connector = self.connectors.connector_for(&source)?;
        with_timeout(
            self.fetch_timeout,
            "testing connection",
            connector.test_connection(),
        )
        .await
    }

    /// Validate, then move the source into `syncing`.
    async fn begin(&self, id: i64) -> RagResult<(DataSource, Box<dyn Connector>)> {
        let source = self.load(id).await?;
        if source.sync_status == SyncStatus::Syncing {
            return Err(already_syncing(id));
        }
        let connector = self.connectors.connector_for(&source)?;
        with_timeout(
            self.fetch_timeout,
            "testing connection",
            connector.test_connection(),
        )
        .await?;
        if !self.store.try_begin_sync(id).await? {
            return Err(already_syncing(id));
        }
        Ok((source, connector))
    }

    /// Start a background sync and return immediately.
    pub async fn trigger(&self, id: i64) -> RagResult<SyncAck> {
        let (source, connector) = self.begin(id).await?;
        tokio::spawn(self.clone().supervise(source, connector));
        Ok(SyncAck {
            message: format!("sync started for data source {}", id),
            data_source_id: id,
        })
    }

    /// Sync in the foreground and return the final status.
    pub async fn run(&self, id: i64) -> RagResult<SyncStatusView> {
        let (source, connector) = self.begin(id).await?;
        self.clone().supervise(source, connector).await;
        self.status(id).await
    }

    async fn supervise(self, source: DataSource, connector: Box<dyn Connector>) {
        let id = source.id;
        let span = tracing::info_span!(
            "sync",
            run_id = %Uuid::new_v4(),
            data_source_id = id,
            kind = %source.kind,
        );

        let started = Instant::now();
        span.in_scope(|| tracing::info!(name = %source.name, "sync started"));
        let job = {
            let this = self.clone();
            tokio::spawn(
                async move { this.ingest(&source, connector.as_ref()).await }
                    .instrument(span.clone()),
            )
        };

        let mut chunks = 0;
        let outcome = match job.await {
            Ok(Ok(n)) if n > 0 => {
                chunks = n;
                SyncOutcome::Synced { at: Utc::now() }
            }
            Ok(Ok(_)) => SyncOutcome::Failed {
                message: NO_CONTENT_MESSAGE.to_string(),
            },
            Ok(Err(e)) => SyncOutcome::Failed {
                message: e.to_string(),
            },
            Err(e) => SyncOutcome::Failed {
                message: format!("sync job aborted: {}", e),
            },
        };

        async {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &outcome {
                SyncOutcome::Synced { .. } => {
                    tracing::info!(chunks, elapsed_ms, "sync finished")
                }
                SyncOutcome::Failed { message } => {
                    tracing::warn!(error = %message, elapsed_ms, "sync failed")
                }
            }
            if let Err(e) = self.store.finish_sync(id, &outcome).await {
                tracing::error!(error = %e, "could not record sync outcome");
            }
            if let Some(index) = &self.keyword_index {
                index.invalidate(id);
            }
        }
        .instrument(span)
        .await
    }

    /// Replace the source's chunks. Returns how many were stored.
    async fn ingest(&self, source: &DataSource, connector: &dyn Connector) -> RagResult<u64> {
        self.store.set_sync_progress(source.id, 5).await?;
        let removed = self.store.delete_chunks(source.id).await?;
        tracing::debug!(removed, "old chunks deleted");

        let units = with_timeout(self.fetch_timeout, "listing units", connector.list_units()).await?;
        self.progress.report(SyncProgressEvent::Listed {
            source: source.name.clone(),
            units: units.len() as u64,
        });
        self.store
            .set_sync_progress(source.id, unit_percent(0, units.len()))
            .await?;

        let strategy = source.chunk_strategy.unwrap_or(if source.kind.is_relational() {
            self.chunking.row_strategy
        } else {
            self.chunking.file_strategy
        });
        let params = self.chunking.params();
        let mut total = 0u64;

        for (i, unit) in units.iter().enumerate() {
            let pieces = pull_with_timeout(connector, unit, self.fetch_timeout).await?;

            let mut chunks = Vec::new();
            for piece in pieces {
                for text in chunk(&piece.text, strategy, &params) {
                    chunks.push(NewChunk {
                        data_source_id: source.id,
                        unit_name: piece.unit_name.clone(),
                        row_id: piece.row_id.clone(),
                        chunk_index: chunks.len() as i64,
                        text,
                        embedding: Vec::new(),
                    });
                }
            }

            if !chunks.is_empty() {
                let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
                let vectors = self.embeddings.embed_documents(&texts).await?;
                for (c, v) in chunks.iter_mut().zip(vectors) {
                    c.embedding = v;
                }
                self.store.insert_chunks(&chunks).await?;
            }

            total += chunks.len() as u64;
            tracing::debug!(unit = %unit.name, chunks = chunks.len(), "unit ingested");
            self.store
                .set_sync_progress(source.id, unit_percent(i + 1, units.len()))
                .await?;
            self.progress.report(SyncProgressEvent::Unit {
                source: source.name.clone(),
                unit: unit.name.clone(),
                n: i as u64 + 1,
                total: units.len() as u64,
                chunks: chunks.len() as u64,
            });
        }

        self.progress.report(SyncProgressEvent::Finished {
            source: source.name.clone(),
            chunks: total,
        });
        Ok(total)
    }

    pub async fn status(&self, id: i64) -> RagResult<SyncStatusView> {
        let source = self.load(id).await?;
        let chunk_count = self.store.count_chunks(id).await?;
        Ok(SyncStatusView {
            sync_status: source.sync_status,
            sync_error: source.sync_error,
            last_synced_at: source.last_synced_at,
            chunk_count,
            sync_progress: source.sync_progress,
        })
    }

    /// Run once at startup, before serving.
    ///
    /// Sources left in `syncing` by a previous process go to `error`. If
    /// the embedding dimension differs from the stored one, every chunk is
    /// dropped and every source needs a re-sync.
    pub async fn reconcile(&self) -> RagResult<Reconciled> {
        let interrupted = self.store.reset_interrupted_syncs(INTERRUPTED_MESSAGE).await?;
        if interrupted > 0 {
            tracing::warn!(interrupted, "reset syncs interrupted by restart");
        }

        let mut invalidated_chunks = 0;
        let dims = self.embeddings.dims();
        if self.embeddings.is_enabled() {
            if let Some(stored) = self.store.embedding_dims().await? {
                if stored != dims {
                    let reason = format!(
                        "embedding dimension changed from {} to {}; re-sync required",
                        stored, dims
                    );
                    invalidated_chunks = self.store.invalidate_embeddings(dims, &reason).await?;
                    if let Some(index) = &self.keyword_index {
                        index.invalidate_all();
                    }
                    tracing::warn!(stored, dims, invalidated_chunks, "embeddings invalidated");
                }
            }
        }

        Ok(Reconciled {
            interrupted,
            invalidated_chunks,
        })
    }
}

fn already_syncing(id: i64) -> RagError {
    RagError::Conflict(format!("data source {} is already syncing", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashProvider;
    use crate::traits::{SourceUnit, UnitRef};
    use async_trait::async_trait;
    use tokio::sync::Notify;
    use zerag_core::models::{ConnectionParams, NewDataSource, SourceKind};
    use zerag_core::store::memory::InMemoryStore;

    #[derive(Clone, Default)]
    struct Fake {
        units: Vec<(&'static str, &'static str)>,
        gate: Option<Arc<Notify>>,
        hang: bool,
        panic: bool,
    }

    #[async_trait]
    impl Connector for Fake {
        fn kind(&self) -> SourceKind {
            SourceKind::File
        }
        async fn test_connection(&self) -> RagResult<()> {
            Ok(())
        }
        async fn list_units(&self) -> RagResult<Vec<UnitRef>> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(self
                .units
                .iter()
                .map(|(name, _)| UnitRef {
                    name: name.to_string(),
                    locator: name.to_string(),
                })
                .collect())
        }
        async fn pull_unit(&self, unit: &UnitRef) -> RagResult<Vec<SourceUnit>> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.panic {
                panic!("connector bug");
            }
            let text = self
                .units
                .iter()
                .find(|(n, _)| *n == unit.name)
                .map(|(_, t)| t.to_string())
                .unwrap_or_default();
            Ok(vec![SourceUnit {
                unit_name: unit.name.clone(),
                row_id: None,
                text,
            }])
        }
    }

    struct FakeFactory(Fake);

    impl ConnectorFactory for FakeFactory {
        fn connector_for(&self, _source: &DataSource) -> RagResult<Box<dyn Connector>> {
            Ok(Box::new(self.0.clone()))
        }
    }

    async fn setup(fake: Fake) -> (SyncOrchestrator, Arc<InMemoryStore>, i64) {
        let store = Arc::new(InMemoryStore::new());
        let ds = store
            .create_data_source(&NewDataSource {
                name: "docs".into(),
                kind: SourceKind::File,
                connection: ConnectionParams::default(),
                chunk_strategy: None,
            })
            .await
            .unwrap();
        let mut config = Config::minimal();
        config.sync.fetch_timeout_secs = 1;
        let orch = SyncOrchestrator::new(
            &config,
            store.clone(),
            Arc::new(EmbeddingService::new(Arc::new(HashProvider::new(16)), 8, 0)),
            Arc::new(FakeFactory(fake)),
        );
        (orch, store, ds.id)
    }

    async fn settled(orch: &SyncOrchestrator, id: i64) -> SyncStatusView {
        for _ in 0..200 {
            let view = orch.status(id).await.unwrap();
            if view.sync_status != SyncStatus::Syncing {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("sync did not settle");
    }

    #[tokio::test]
    async fn one_of_many_concurrent_triggers_wins() {
        let gate = Arc::new(Notify::new());
        let (orch, _, id) = setup(Fake {
            units: vec![("a.md", "Alpha text."), ("b.md", "Beta text.")],
            gate: Some(gate.clone()),
            ..Default::default()
        })
        .await;

        let attempts = futures::future::join_all((0..8).map(|_| orch.trigger(id))).await;
        let ok = attempts.iter().filter(|r| r.is_ok()).count();
        let conflicts = attempts
            .iter()
            .filter(|r| matches!(r, Err(RagError::Conflict(_))))
            .count();
        assert_eq!(ok, 1);
        assert_eq!(conflicts, 7);
        assert_eq!(orch.status(id).await.unwrap().sync_status, SyncStatus::Syncing);

        gate.notify_one();
        let view = settled(&orch, id).await;
        assert_eq!(view.sync_status, SyncStatus::Synced);
        assert_eq!(view.chunk_count, 2);
        assert_eq!(view.sync_progress, 100);
        assert!(view.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn resync_replaces_chunks() {
        let (orch, _, id) = setup(Fake {
            units: vec![("a.md", "Alpha text."), ("b.md", "Beta text.")],
            ..Default::default()
        })
        .await;
        let first = orch.run(id).await.unwrap();
        let second = orch.run(id).await.unwrap();
        assert_eq!(first.chunk_count, 2);
        assert_eq!(second.chunk_count, 2);
        assert_eq!(second.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn empty_source_is_an_error_not_synced() {
        let (orch, _, id) = setup(Fake {
            units: vec![("blank.md", "   \n\n ")],
            ..Default::default()
        })
        .await;
        let view = orch.run(id).await.unwrap();
        assert_eq!(view.sync_status, SyncStatus::Error);
        assert_eq!(view.sync_error.as_deref(), Some(NO_CONTENT_MESSAGE));
        assert_eq!(view.chunk_count, 0);
    }

    #[tokio::test]
    async fn hanging_unit_times_out_with_message() {
        let (orch, _, id) = setup(Fake {
            units: vec![("slow.md", "never")],
            hang: true,
            ..Default::default()
        })
        .await;
        let view = orch.run(id).await.unwrap();
        assert_eq!(view.sync_status, SyncStatus::Error);
        let msg = view.sync_error.unwrap();
        assert!(msg.contains("timed out"), "{}", msg);
        assert!(msg.contains("slow.md"), "{}", msg);
    }

    #[tokio::test]
    async fn panicking_job_ends_in_error() {
        let (orch, _, id) = setup(Fake {
            units: vec![("a.md", "text")],
            panic: true,
            ..Default::default()
        })
        .await;
        orch.trigger(id).await.unwrap();
        let view = settled(&orch, id).await;
        assert_eq!(view.sync_status, SyncStatus::Error);
        assert_eq!(view.sync_progress, 0);
    }

    #[tokio::test]
    async fn unknown_source_is_rejected() {
        let (orch, _, _) = setup(Fake::default()).await;
        assert!(matches!(
            orch.trigger(404).await,
            Err(RagError::UnknownDataSource(404))
        ));
        assert!(matches!(
            orch.status(404).await,
            Err(RagError::UnknownDataSource(404))
        ));
    }

    #[tokio::test]
    async fn reconcile_resets_interrupted_and_stale_dims() {
        let (orch, store, id) = setup(Fake::default()).await;
        store
            .insert_chunks(&[NewChunk {
                data_source_id: id,
                unit_name: "old.md".into(),
                row_id: None,
                chunk_index: 0,
                text: "old".into(),
                embedding: vec![0.0; 4],
            }])
            .await
            .unwrap();
        assert!(store.try_begin_sync(id).await.unwrap());

        let report = orch.reconcile().await.unwrap();
        assert_eq!(report.interrupted, 1);
        assert_eq!(report.invalidated_chunks, 1);
        let view = orch.status(id).await.unwrap();
        assert_eq!(view.sync_status, SyncStatus::Pending);
        assert_eq!(view.chunk_count, 0);
        assert_eq!(store.embedding_dims().await.unwrap(), Some(16));
    }
}
