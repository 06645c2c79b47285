//! The connector abstraction.
//!
//! A [`Connector`] turns one configured data source into raw text units.
//! Which implementation backs a source is decided by its stored
//! [`SourceKind`] through a [`ConnectorFactory`]:
//!
//! ```text
//!   DataSource.kind ──▶ ConnectorFactory ──▶ Box<dyn Connector>
//!                                               │
//!        mysql / postgresql / sqlite ──▶ RelationalConnector
//!        file                        ──▶ FileCollection
//!        web                         ──▶ WebCollection
//! ```
//!
//! The sync orchestrator lists a source's units and pulls them one at a
//! time under a timeout, so a single hanging table or URL fails the sync
//! with a descriptive message instead of stalling it.

use async_trait::async_trait;
use std::time::Duration;

use zerag_core::models::{DataSource, SourceKind};

use crate::config::SyncConfig;
use crate::connector_file::FileCollection;
use crate::connector_relational::RelationalConnector;
use crate::connector_web::WebCollection;
use crate::error::{RagError, RagResult};

/// One fetchable unit of a source: a table, a file, or a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitRef {
    /// Recorded as the chunk's unit name.
    pub name: String,
    /// Table name, file path, or URL.
    pub locator: String,
}

/// Raw text produced by a connector, before chunking.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceUnit {
    pub unit_name: String,
    /// Row id for relational records; `None` for documents.
    pub row_id: Option<String>,
    pub text: String,
}

// ═══════════════════════════════════════════════════════════════════════
// Connector Trait
// ═══════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait Connector: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Check the source is reachable and has something to ingest.
    async fn test_connection(&self) -> RagResult<()>;

    /// Enumerate units in a stable order.
    async fn list_units(&self) -> RagResult<Vec<UnitRef>>;

    /// Fetch one unit's text.
    async fn pull_unit(&self, unit: &UnitRef) -> RagResult<Vec<SourceUnit>>;

    /// Fetch every unit, each bounded by `timeout`.
    async fn pull_units(&self, timeout: Duration) -> RagResult<Vec<SourceUnit>> {
        let units = with_timeout(timeout, "listing units", self.list_units()).await?;
        let mut out = Vec::new();
        for unit in &units {
            out.extend(pull_with_timeout(self, unit, timeout).await?);
        }
        Ok(out)
    }
}

/// Run a connector call, turning expiry into a [`RagError::Connection`].
pub async fn with_timeout<T, F>(timeout: Duration, what: &str, fut: F) -> RagResult<T>
where
    F: std::future::Future<Output = RagResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(RagError::connection(format!(
            "timed out after {}s while {}",
            timeout.as_secs_f64(),
            what
        ))),
    }
}

pub async fn pull_with_timeout<C: Connector + ?Sized>(
    connector: &C,
    unit: &UnitRef,
    timeout: Duration,
) -> RagResult<Vec<SourceUnit>> {
    with_timeout(
        timeout,
        &format!("fetching {}", unit.name),
        connector.pull_unit(unit),
    )
    .await
}

// ═══════════════════════════════════════════════════════════════════════
// Factory
// ═══════════════════════════════════════════════════════════════════════

/// Builds the connector for a data source. Swapped out in tests.
pub trait ConnectorFactory: Send + Sync {
    /// Fails with [`RagError::Validation`] when the source's connection
    /// parameters do not fit its kind.
    fn connector_for(&self, source: &DataSource) -> RagResult<Box<dyn Connector>>;
}

/// Dispatches on [`SourceKind`] to the built-in connectors.
pub struct BuiltinConnectors {
    sync: SyncConfig,
}

impl BuiltinConnectors {
    pub fn new(sync: SyncConfig) -> Self {
        Self { sync }
    }
}

impl ConnectorFactory for BuiltinConnectors {
    fn connector_for(&self, source: &DataSource) -> RagResult<Box<dyn Connector>> {
        match source.kind {
            SourceKind::Mysql | SourceKind::Postgresql | SourceKind::Sqlite => Ok(Box::new(
                RelationalConnector::new(source.kind, &source.connection, &self.sync)?,
            )),
            SourceKind::File => Ok(Box::new(FileCollection::new(&source.connection)?)),
            SourceKind::Web => Ok(Box::new(WebCollection::new(
                &source.connection,
                Duration::from_secs(self.sync.fetch_timeout_secs),
            )?)),
        }
    }
}
