use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    create_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the document table if missing. Idempotent.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    // One row per (organization, document); ids may collide across orgs.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            org_id TEXT NOT NULL,
            id TEXT NOT NULL,
            content TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            embedding BLOB,
            embedding_dims INTEGER,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (org_id, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_org ON documents(org_id)")
        .execute(pool)
        .await?;

    Ok(())
}
