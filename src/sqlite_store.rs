//! SQLite-backed [`DocumentStore`] implementation.
//!
//! One `documents` table keyed by `(org_id, id)`. Metadata is stored as a
//! JSON column and embeddings as little-endian f32 BLOBs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use dedupe_harness_core::embedding::{blob_to_vec, vec_to_blob};
use dedupe_harness_core::models::{Document, DocumentMetadata};
use dedupe_harness_core::store::DocumentStore;

/// SQLite implementation of the [`DocumentStore`] trait.
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

async fn insert_document(
    tx: &mut Transaction<'_, Sqlite>,
    org: &str,
    doc: &Document,
    now: i64,
) -> Result<()> {
    let metadata_json = serde_json::to_string(&doc.metadata)?;
    let embedding = doc.embedding.as_deref().map(vec_to_blob);
    let dims = doc.embedding.as_ref().map(|e| e.len() as i64);

    sqlx::query(
        r#"
        INSERT INTO documents (org_id, id, content, metadata_json, embedding, embedding_dims, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(org_id, id) DO UPDATE SET
            content = excluded.content,
            metadata_json = excluded.metadata_json,
            embedding = excluded.embedding,
            embedding_dims = excluded.embedding_dims,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(org)
    .bind(&doc.id)
    .bind(&doc.content)
    .bind(&metadata_json)
    .bind(embedding)
    .bind(dims)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
    let id: String = row.get("id");
    let metadata_json: String = row.get("metadata_json");
    let metadata: DocumentMetadata = serde_json::from_str(&metadata_json)
        .with_context(|| format!("corrupt metadata for document {}", id))?;
    let embedding: Option<Vec<u8>> = row.get("embedding");

    Ok(Document {
        id,
        content: row.get("content"),
        metadata,
        embedding: embedding.map(|blob| blob_to_vec(&blob)),
    })
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn upsert_documents(&self, org: &str, docs: &[Document]) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for doc in docs {
            insert_document(&mut tx, org, doc, now).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn all_documents(&self, org: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT id, content, metadata_json, embedding FROM documents WHERE org_id = ? ORDER BY id",
        )
        .bind(org)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_document).collect()
    }

    async fn get_document(&self, org: &str, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, content, metadata_json, embedding FROM documents WHERE org_id = ? AND id = ?",
        )
        .bind(org)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_document).transpose()
    }

    async fn replace_documents(&self, org: &str, docs: &[Document]) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        for doc in docs {
            sqlx::query("DELETE FROM documents WHERE org_id = ? AND id = ?")
                .bind(org)
                .bind(&doc.id)
                .execute(&mut *tx)
                .await?;
        }
        for doc in docs {
            insert_document(&mut tx, org, doc, now).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_documents(&self, org: &str, ids: &[String]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0u64;
        for id in ids {
            let result = sqlx::query("DELETE FROM documents WHERE org_id = ? AND id = ?")
                .bind(org)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            deleted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(deleted as usize)
    }

    async fn clear(&self, org: &str) -> Result<usize> {
        let result = sqlx::query("DELETE FROM documents WHERE org_id = ?")
            .bind(org)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn count(&self, org: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE org_id = ?")
            .bind(org)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};

    async fn store(dir: &tempfile::TempDir) -> SqliteDocumentStore {
        let pool = db::connect_path(&dir.path().join("docs.sqlite")).await.unwrap();
        migrate::create_schema(&pool).await.unwrap();
        SqliteDocumentStore::new(pool)
    }

    fn doc(id: &str, similar_to: &[&str], embedding: Option<Vec<f32>>) -> Document {
        let mut metadata = DocumentMetadata {
            title: format!("Title {}", id),
            similar_to: similar_to.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        metadata
            .extra
            .insert("owner".into(), serde_json::json!("platform"));
        Document {
            id: id.into(),
            content: format!("content of {}", id),
            metadata,
            embedding,
        }
    }

    #[tokio::test]
    async fn test_roundtrip_keeps_metadata_and_embedding() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let original = doc("a", &["b"], Some(vec![0.25, -1.0, 3.5]));
        store.upsert_documents("acme", &[original.clone()]).await.unwrap();

        let loaded = store.get_document("acme", "a").await.unwrap().unwrap();
        assert_eq!(loaded, original);
    }

    #[tokio::test]
    async fn test_orgs_do_not_share_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        store.upsert_documents("a", &[doc("x", &[], None)]).await.unwrap();
        store.upsert_documents("b", &[doc("x", &["y"], None)]).await.unwrap();

        assert_eq!(store.count("a").await.unwrap(), 1);
        assert_eq!(store.clear("b").await.unwrap(), 1);
        assert_eq!(store.count("a").await.unwrap(), 1);
        assert!(store.get_document("b", "x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replace_rewrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        store
            .upsert_documents("o", &[doc("a", &["b"], None), doc("b", &["a"], None)])
            .await
            .unwrap();

        store
            .replace_documents("o", &[doc("a", &[], None), doc("b", &[], None)])
            .await
            .unwrap();

        let all = store.all_documents("o").await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|d| d.metadata.similar_to.is_empty()));
    }

    #[tokio::test]
    async fn test_delete_reports_existing_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        store.upsert_documents("o", &[doc("a", &[], None)]).await.unwrap();
        let n = store
            .delete_documents("o", &["a".into(), "zzz".into()])
            .await
            .unwrap();
        assert_eq!(n, 1);
    }
}
