use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

/// Create the schema on a fresh database. Idempotent.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS data_sources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            connection_json TEXT NOT NULL DEFAULT '{}',
            chunk_strategy TEXT,
            sync_status TEXT NOT NULL DEFAULT 'pending',
            sync_error TEXT,
            last_synced_at INTEGER,
            sync_progress INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            data_source_id INTEGER NOT NULL,
            unit_name TEXT NOT NULL,
            row_id TEXT,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            text_folded TEXT NOT NULL DEFAULT '',
            hash TEXT NOT NULL,
            embedding BLOB NOT NULL,
            dims INTEGER NOT NULL,
            FOREIGN KEY (data_source_id) REFERENCES data_sources(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_data_source ON chunks(data_source_id)")
        .execute(pool)
        .await?;

    add_folded_text(pool).await?;

    Ok(())
}

/// Databases created before keyword matching moved to Unicode case
/// folding lack `chunks.text_folded`. Add it and fill it in.
async fn add_folded_text(pool: &SqlitePool) -> Result<()> {
    let columns = sqlx::query("PRAGMA table_info(chunks)")
        .fetch_all(pool)
        .await?;
    let present = columns
        .iter()
        .any(|c| c.get::<String, _>("name") == "text_folded");
    if present {
        return Ok(());
    }

    let mut tx = pool.begin().await?;
    sqlx::query("ALTER TABLE chunks ADD COLUMN text_folded TEXT NOT NULL DEFAULT ''")
        .execute(&mut *tx)
        .await?;
    let rows = sqlx::query("SELECT id, text FROM chunks")
        .fetch_all(&mut *tx)
        .await?;
    for row in &rows {
        let text: String = row.get("text");
        sqlx::query("UPDATE chunks SET text_folded = ? WHERE id = ?")
            .bind(text.to_lowercase())
            .bind(row.get::<i64, _>("id"))
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    tracing::info!(chunks = rows.len(), "added folded chunk text");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DbConfig};
    use tempfile::TempDir;

    #[tokio::test]
    async fn older_chunk_tables_gain_folded_text() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = Config::minimal();
        cfg.db = DbConfig {
            path: tmp.path().join("old.sqlite"),
        };
        let pool = db::connect(&cfg).await.unwrap();
        sqlx::query(
            "CREATE TABLE chunks (id INTEGER PRIMARY KEY, data_source_id INTEGER NOT NULL, \
             unit_name TEXT NOT NULL, row_id TEXT, chunk_index INTEGER NOT NULL, \
             text TEXT NOT NULL, hash TEXT NOT NULL, embedding BLOB NOT NULL, \
             dims INTEGER NOT NULL)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO chunks (data_source_id, unit_name, chunk_index, text, hash, embedding, dims) \
             VALUES (1, 'a.md', 0, 'Überweisung dauert drei Tage.', 'h', x'', 0)",
        )
        .execute(&pool)
        .await
        .unwrap();

        migrate_pool(&pool).await.unwrap();
        migrate_pool(&pool).await.unwrap();

        let folded: String = sqlx::query_scalar("SELECT text_folded FROM chunks")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(folded, "überweisung dauert drei tage.");
    }
}
