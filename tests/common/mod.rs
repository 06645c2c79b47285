#![allow(dead_code)]

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use zerag::config::Config;
use zerag::db;
use zerag::embedding::{EmbeddingService, HashProvider};
use zerag::error::RagResult;
use zerag::llm::{ChatMessage, LanguageModel, TokenStream};
use zerag::migrate::migrate_pool;
use zerag::services::Services;
use zerag::sqlite_store::SqliteStore;
use zerag::traits::BuiltinConnectors;
use zerag_core::models::{ChunkStrategy, ConnectionParams, FileEntry, NewDataSource, SourceKind};

/// Streams a fixed answer word by word; `complete` returns a fixed reply.
pub struct ScriptedModel {
    pub tokens: Vec<String>,
    pub reply: String,
    pub delay: Duration,
    /// Set when the consumer dropped the token stream early.
    pub aborted: Arc<AtomicBool>,
}

impl ScriptedModel {
    pub fn new(tokens: &[&str]) -> Self {
        Self {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            reply: "no rewrite available".into(),
            delay: Duration::ZERO,
            aborted: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _messages: &[ChatMessage]) -> RagResult<String> {
        Ok(self.reply.clone())
    }

    async fn stream(&self, _messages: &[ChatMessage]) -> RagResult<TokenStream> {
        let (tx, rx) = mpsc::channel(1);
        let tokens = self.tokens.clone();
        let delay = self.delay;
        let aborted = self.aborted.clone();
        tokio::spawn(async move {
            for t in tokens {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(Ok(t)).await.is_err() {
                    aborted.store(true, Ordering::SeqCst);
                    return;
                }
            }
        });
        Ok(rx)
    }
}

pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::minimal();
    config.db.path = dir.join("data").join("zerag.sqlite");
    config.chunking.max_chars = 100;
    config.chunking.overlap_chars = 0;
    config.chunking.min_chars = 0;
    config.sync.fetch_timeout_secs = 5;
    config
}

/// SQLite-backed services with hash embeddings and the built-in connectors.
pub async fn sqlite_services(config: &Config, model: ScriptedModel) -> Services {
    let pool = db::connect(config).await.unwrap();
    migrate_pool(&pool).await.unwrap();
    Services::assemble(
        config,
        Arc::new(SqliteStore::new(pool)),
        Arc::new(EmbeddingService::new(Arc::new(HashProvider::new(64)), 16, 100)),
        Arc::new(model),
        Arc::new(BuiltinConnectors::new(config.sync.clone())),
    )
}

/// Three text files with 14, 13 and 13 paragraphs of about 60 characters.
/// Paragraph chunking at 100 chars yields one chunk per paragraph.
pub fn write_paragraph_files(dir: &Path) -> Vec<PathBuf> {
    [("alpha.txt", 14), ("beta.txt", 13), ("gamma.txt", 13)]
        .iter()
        .map(|(name, count)| {
            let body: Vec<String> = (1..=*count)
                .map(|i| format!("Paragraph {:02} of {} covers refund and shipping terms.", i, name))
                .collect();
            let path = dir.join(name);
            std::fs::write(&path, body.join("\n\n")).unwrap();
            path
        })
        .collect()
}

pub fn file_source(name: &str, paths: &[PathBuf]) -> NewDataSource {
    NewDataSource {
        name: name.into(),
        kind: SourceKind::File,
        connection: ConnectionParams {
            files: paths
                .iter()
                .map(|p| FileEntry {
                    path: p.to_string_lossy().into_owned(),
                    filename: None,
                })
                .collect(),
            ..Default::default()
        },
        chunk_strategy: Some(ChunkStrategy::Paragraph),
    }
}
