//! Process-wide service handles.
//!
//! The embedding model, the language model client and the store are
//! built once at startup and passed explicitly to the sync orchestrator
//! and the pipeline. Both the HTTP server and the CLI work from a
//! [`Services`] value.

use anyhow::Result;
use std::sync::Arc;

use zerag_core::store::Store;

use crate::config::Config;
use crate::db;
use crate::embedding::EmbeddingService;
use crate::keyword_index::KeywordIndex;
use crate::llm::{create_model, LanguageModel};
use crate::migrate::migrate_pool;
use crate::pipeline::Pipeline;
use crate::sqlite_store::SqliteStore;
use crate::sync::SyncOrchestrator;
use crate::traits::{BuiltinConnectors, ConnectorFactory};

#[derive(Clone)]
pub struct Services {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub sync: Arc<SyncOrchestrator>,
    pub pipeline: Arc<Pipeline>,
    /// BM25 indexes shared by retrieval and sync.
    pub keyword_index: Arc<KeywordIndex>,
}

impl Services {
    /// Wire services from already-built parts. Does not touch the store.
    pub fn assemble(
        config: &Config,
        store: Arc<dyn Store>,
        embeddings: Arc<EmbeddingService>,
        model: Arc<dyn LanguageModel>,
        connectors: Arc<dyn ConnectorFactory>,
    ) -> Self {
        let keyword_index = Arc::new(KeywordIndex::new(
            store.clone(),
            config.retrieval.bm25_index_capacity,
        ));
        let sync = SyncOrchestrator::new(config, store.clone(), embeddings.clone(), connectors)
            .with_keyword_index(keyword_index.clone());
        let pipeline = Pipeline::with_keyword_index(
            config,
            store.clone(),
            embeddings,
            model,
            keyword_index.clone(),
        );
        Self {
            config: Arc::new(config.clone()),
            store,
            sync: Arc::new(sync),
            pipeline: Arc::new(pipeline),
            keyword_index,
        }
    }

    /// Open the database, migrate it, build the configured providers and
    /// reconcile sync state left by a previous process.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate_pool(&pool).await?;

        let embeddings = Arc::new(EmbeddingService::from_config(&config.embedding)?);
        let model = create_model(&config.llm)?;
        tracing::info!(
            db = %config.db.path.display(),
            embedding_model = embeddings.model_name(),
            dims = embeddings.dims(),
            llm = model.model_name(),
            "services ready"
        );

        let services = Self::assemble(
            config,
            Arc::new(SqliteStore::new(pool)),
            embeddings,
            model,
            Arc::new(BuiltinConnectors::new(config.sync.clone())),
        );
        services.sync.reconcile().await?;
        Ok(services)
    }
}
