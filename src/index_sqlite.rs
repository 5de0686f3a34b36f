//! SQLite-backed [`VectorIndex`].
//!
//! Vectors are stored as little-endian f32 BLOBs and scored in Rust after
//! loading the candidate rows for the queried namespace. Good to a few
//! hundred thousand chunks; beyond that an ANN index belongs behind the
//! same trait.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{EngineError, Result};
use crate::index::{rank_hits, IndexEntry, VectorIndex};
use crate::models::{Document, ScoredChunk};

pub struct SqliteIndex {
    pool: SqlitePool,
    dims: usize,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool, dims: usize) -> Self {
        Self { pool, dims }
    }
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn upsert(&self, entry: IndexEntry) -> Result<()> {
        if entry.vector.len() != self.dims {
            return Err(EngineError::DimensionMismatch {
                expected: self.dims,
                got: entry.vector.len(),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO index_entries (chunk_id, document_id, store_id, seq, text, embedding, dims)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                document_id = excluded.document_id,
                store_id = excluded.store_id,
                seq = excluded.seq,
                text = excluded.text,
                embedding = excluded.embedding,
                dims = excluded.dims
            "#,
        )
        .bind(&entry.chunk_id)
        .bind(&entry.document_id)
        .bind(&entry.store_id)
        .bind(entry.seq)
        .bind(&entry.text)
        .bind(vec_to_blob(&entry.vector))
        .bind(entry.vector.len() as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        store: Option<&str>,
    ) -> Result<Vec<ScoredChunk>> {
        if vector.len() != self.dims {
            return Err(EngineError::DimensionMismatch {
                expected: self.dims,
                got: vector.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT chunk_id, document_id, seq, text, embedding
            FROM index_entries
            WHERE store_id IS ?
            "#,
        )
        .bind(store)
        .fetch_all(&self.pool)
        .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let blob: Vec<u8> = row.get("embedding");
            let candidate = blob_to_vec(&blob);
            hits.push(ScoredChunk {
                chunk_id: row.get("chunk_id"),
                document_id: row.get("document_id"),
                seq: row.get("seq"),
                text: row.get("text"),
                score: cosine_similarity(vector, &candidate),
            });
        }
        rank_hits(&mut hits, k);
        Ok(hits)
    }

    async fn delete(&self, chunk_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM index_entries WHERE chunk_id = ?")
            .bind(chunk_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_document(&self, document_id: &str, store: Option<&str>) -> Result<u64> {
        // Single statement so queries never observe a partially deleted
        // document.
        let result =
            sqlx::query("DELETE FROM index_entries WHERE document_id = ? AND store_id IS ?")
                .bind(document_id)
                .bind(store)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn delete_by_store(&self, store_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM index_entries WHERE store_id = ?")
            .bind(store_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn record_document(&self, document: &Document) -> Result<i64> {
        let version: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO documents (id, source, content_type, body, ingested_at, version)
            VALUES (?, ?, ?, ?, ?, 1)
            ON CONFLICT(id) DO UPDATE SET
                source = excluded.source,
                content_type = excluded.content_type,
                body = excluded.body,
                ingested_at = excluded.ingested_at,
                version = documents.version + 1
            RETURNING version
            "#,
        )
        .bind(&document.id)
        .bind(&document.source)
        .bind(&document.content_type)
        .bind(&document.body)
        .bind(document.ingested_at.timestamp())
        .fetch_one(&self.pool)
        .await?;

        Ok(version)
    }

    async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM index_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_index(dims: usize) -> SqliteIndex {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        SqliteIndex::new(pool, dims)
    }

    fn entry(chunk_id: &str, doc: &str, store: Option<&str>, vector: Vec<f32>) -> IndexEntry {
        IndexEntry {
            chunk_id: chunk_id.to_string(),
            document_id: doc.to_string(),
            store_id: store.map(|s| s.to_string()),
            seq: 0,
            text: format!("text of {chunk_id}"),
            vector,
        }
    }

    #[tokio::test]
    async fn upsert_query_roundtrip() {
        let index = test_index(3).await;
        index.upsert(entry("c1", "d1", None, vec![1.0, 0.0, 0.0])).await.unwrap();
        index.upsert(entry("c2", "d1", None, vec![0.0, 1.0, 0.0])).await.unwrap();

        let hits = index.query(&[1.0, 0.0, 0.0], 2, None).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, "c1");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn overwrite_and_namespace_filter() {
        let index = test_index(2).await;
        index.upsert(entry("c1", "d1", None, vec![1.0, 0.0])).await.unwrap();
        index.upsert(entry("c1", "d1", None, vec![0.0, 1.0])).await.unwrap();
        index.upsert(entry("c2", "d2", Some("s1"), vec![1.0, 0.0])).await.unwrap();

        assert_eq!(index.count().await.unwrap(), 2);
        let primary = index.query(&[0.0, 1.0], 10, None).await.unwrap();
        assert_eq!(primary.len(), 1);
        assert_eq!(primary[0].chunk_id, "c1");

        let store = index.query(&[1.0, 0.0], 10, Some("s1")).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store[0].chunk_id, "c2");
    }

    #[tokio::test]
    async fn delete_by_document_and_store() {
        let index = test_index(2).await;
        index.upsert(entry("c1", "d1", None, vec![1.0, 0.0])).await.unwrap();
        index.upsert(entry("c2", "d1", Some("s1"), vec![1.0, 0.0])).await.unwrap();
        index.upsert(entry("c3", "d2", Some("s1"), vec![0.0, 1.0])).await.unwrap();

        assert_eq!(index.delete_by_document("d1", None).await.unwrap(), 1);
        assert_eq!(index.delete_by_store("s1").await.unwrap(), 2);
        assert_eq!(index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn document_version_bumps() {
        let index = test_index(2).await;
        let doc = Document::new("d1", "test", "text/plain", "first body");
        assert_eq!(index.record_document(&doc).await.unwrap(), 1);
        let doc = Document::new("d1", "test", "text/plain", "second body");
        assert_eq!(index.record_document(&doc).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn rejects_wrong_dims() {
        let index = test_index(3).await;
        let err = index.upsert(entry("c1", "d1", None, vec![1.0])).await.unwrap_err();
        assert_eq!(err.kind(), "dimension_mismatch");
    }
}
