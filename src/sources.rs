//! `zerag sources ...` commands.

use anyhow::{bail, Context, Result};
use std::path::Path;

use zerag_core::models::NewDataSource;
use zerag_core::store::Removal;

use crate::services::Services;

pub async fn list_sources(services: &Services) -> Result<()> {
    let sources = services.store.list_data_sources().await?;
    if sources.is_empty() {
        println!("No data sources.");
        return Ok(());
    }

    println!(
        "{:<6} {:<24} {:<12} {:<10} {:>8}  LAST SYNCED",
        "ID", "NAME", "KIND", "STATUS", "CHUNKS"
    );
    for s in sources {
        let chunks = services.store.count_chunks(s.id).await?;
        let last = s
            .last_synced_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<6} {:<24} {:<12} {:<10} {:>8}  {}",
            s.id,
            s.name,
            s.kind,
            s.sync_status.as_str(),
            chunks,
            last
        );
        if let Some(err) = &s.sync_error {
            println!("       error: {}", err);
        }
    }
    Ok(())
}

/// Create a source from a JSON file shaped like the `POST /data-sources`
/// body.
pub async fn add_source(services: &Services, path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let new: NewDataSource = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid data source definition in {}", path.display()))?;
    if new.name.trim().is_empty() {
        bail!("data source name must not be empty");
    }
    let source = services.store.create_data_source(&new).await?;
    println!("created data source {} ({}, {})", source.id, source.name, source.kind);
    Ok(())
}

pub async fn remove_source(services: &Services, id: i64) -> Result<()> {
    match services.store.delete_data_source(id).await? {
        Removal::Deleted => {
            services.keyword_index.invalidate(id);
            println!("removed data source {}", id);
            Ok(())
        }
        Removal::NotFound => bail!("data source {} not found", id),
        Removal::Syncing => bail!("data source {} is syncing and cannot be deleted", id),
    }
}

pub async fn test_source(services: &Services, id: i64) -> Result<()> {
    services.sync.test_connection(id).await?;
    println!("data source {}: connection ok", id);
    Ok(())
}
