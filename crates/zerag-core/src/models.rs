//! Core data types shared by ingestion, retrieval, and answering.
//!
//! | Type | Lifetime |
//! |------|----------|
//! | [`DataSource`] | Persisted; mutated by sync (status fields) and by its owner (config fields) |
//! | [`Chunk`] | Persisted; created only by sync, deleted wholesale on resync |
//! | [`RetrievedFragment`] | Per request; never stored |
//! | [`PipelineStep`] | Per request; delivered with the answer as the pipeline log |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// The type tag that selects a connector for a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Mysql,
    Postgresql,
    Sqlite,
    File,
    Web,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Mysql => "mysql",
            SourceKind::Postgresql => "postgresql",
            SourceKind::Sqlite => "sqlite",
            SourceKind::File => "file",
            SourceKind::Web => "web",
        }
    }

    /// Relational sources are eligible for SQL fallback and default to
    /// row-oriented chunking.
    pub fn is_relational(&self) -> bool {
        matches!(
            self,
            SourceKind::Mysql | SourceKind::Postgresql | SourceKind::Sqlite
        )
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "mysql" => Ok(SourceKind::Mysql),
            "postgresql" | "postgres" => Ok(SourceKind::Postgresql),
            "sqlite" => Ok(SourceKind::Sqlite),
            "file" => Ok(SourceKind::File),
            "web" => Ok(SourceKind::Web),
            other => anyhow::bail!("unknown data source type: {}", other),
        }
    }
}

/// How raw unit text is split into fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    Fixed,
    Paragraph,
    Sentence,
    Smart,
}

impl ChunkStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStrategy::Fixed => "fixed",
            ChunkStrategy::Paragraph => "paragraph",
            ChunkStrategy::Sentence => "sentence",
            ChunkStrategy::Smart => "smart",
        }
    }
}

impl FromStr for ChunkStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "fixed" => Ok(ChunkStrategy::Fixed),
            "paragraph" => Ok(ChunkStrategy::Paragraph),
            "sentence" => Ok(ChunkStrategy::Sentence),
            "smart" => Ok(ChunkStrategy::Smart),
            other => anyhow::bail!("unknown chunk strategy: {}", other),
        }
    }
}

/// Indexing state of a data source.
///
/// ```text
/// pending ──▶ syncing ──▶ synced
///                │  ▲        │
///                ▼  └────────┤
///              error ────────┘ (a new sync re-enters syncing)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Synced,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Error => "error",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "syncing" => Ok(SyncStatus::Syncing),
            "synced" => Ok(SyncStatus::Synced),
            "error" => Ok(SyncStatus::Error),
            other => anyhow::bail!("unknown sync status: {}", other),
        }
    }
}

/// Restricts ingestion (and SQL fallback) of a relational source to one
/// table, optionally to a subset of its columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    pub table: String,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
}

/// One entry of a file collection's manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    #[serde(default)]
    pub filename: Option<String>,
}

impl FileEntry {
    /// Display name used as the chunk's unit name.
    pub fn display_name(&self) -> String {
        self.filename.clone().unwrap_or_else(|| {
            std::path::Path::new(&self.path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.path.clone())
        })
    }
}

/// Connection parameters. Which fields matter depends on [`SourceKind`]:
/// network databases use host/port/database/credentials, SQLite uses
/// `sqlite_path`, file collections use `files`, web collections use `urls`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlite_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<TableConfig>,
}

impl ConnectionParams {
    /// Copy with credentials removed, for API responses.
    pub fn redacted(&self) -> Self {
        let mut out = self.clone();
        if out.password.is_some() {
            out.password = Some("********".to_string());
        }
        out
    }
}

/// A configured data source and its sync state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
    pub id: i64,
    pub name: String,
    pub kind: SourceKind,
    pub connection: ConnectionParams,
    /// `None` means "use the configured default for this kind".
    pub chunk_strategy: Option<ChunkStrategy>,
    pub sync_status: SyncStatus,
    pub sync_error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// 0–100, meaningful while `sync_status` is `syncing`.
    pub sync_progress: i64,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when creating a data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDataSource {
    pub name: String,
    pub kind: SourceKind,
    #[serde(default)]
    pub connection: ConnectionParams,
    #[serde(default)]
    pub chunk_strategy: Option<ChunkStrategy>,
}

/// Owner-editable configuration fields. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSourceUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub connection: Option<ConnectionParams>,
    #[serde(default)]
    pub chunk_strategy: Option<ChunkStrategy>,
}

/// Terminal result of a sync pass.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Synced { at: DateTime<Utc> },
    Failed { message: String },
}

/// A persisted fragment of a data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: i64,
    pub data_source_id: i64,
    /// Table name, file name, or URL the fragment came from.
    pub unit_name: String,
    /// Row or document locator for citation.
    pub row_id: Option<String>,
    pub chunk_index: i64,
    pub text: String,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
}

/// A fragment ready for insertion, embedding included.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub data_source_id: i64,
    pub unit_name: String,
    pub row_id: Option<String>,
    pub chunk_index: i64,
    pub text: String,
    pub embedding: Vec<f32>,
}

impl NewChunk {
    pub fn hash(&self) -> String {
        use sha2::{Digest, Sha256};
        hex::encode(Sha256::digest(self.text.as_bytes()))
    }
}

/// One page of a chunk listing.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkPage {
    pub items: Vec<Chunk>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

/// Which retrieval strategy surfaced a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Vector,
    Keyword,
    Hyde,
    Sql,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Vector => "vector",
            Origin::Keyword => "keyword",
            Origin::Hyde => "hyde",
            Origin::Sql => "sql",
        }
    }
}

/// A ranked retrieval result, in the shape returned to API callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedFragment {
    /// Absent for rows returned by SQL fallback.
    pub chunk_id: Option<i64>,
    pub chunk_text: String,
    pub table_name: String,
    pub row_id: Option<String>,
    /// Normalized to `[0, 1]`.
    pub similarity: f64,
    #[serde(rename = "source")]
    pub origin: Origin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f64>,
}

/// One entry of the pipeline log: a stage name plus free-form payload,
/// serialized flat as `{"step": ..., ...payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    pub step: String,
    #[serde(flatten)]
    pub detail: Map<String, Value>,
}

impl PipelineStep {
    pub fn new(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            detail: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.detail.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.detail.get(key)
    }
}
