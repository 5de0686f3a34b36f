use anyhow::Result;
use sqlx::SqlitePool;

/// Create the schema if it does not exist. Safe to run repeatedly.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Documents: one row per ingested document id, version bumped on
    // re-ingestion.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            content_type TEXT NOT NULL DEFAULT 'text/plain',
            body TEXT NOT NULL,
            ingested_at INTEGER NOT NULL,
            version INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Index entries: embedded chunks, vectors stored as little-endian f32
    // BLOBs. store_id NULL means the primary corpus.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_entries (
            chunk_id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            store_id TEXT,
            seq INTEGER NOT NULL,
            text TEXT NOT NULL,
            embedding BLOB NOT NULL,
            dims INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // File-search stores.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stores (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entries_document_id ON index_entries(document_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_store_id ON index_entries(store_id)")
        .execute(pool)
        .await?;

    Ok(())
}
