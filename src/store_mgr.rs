//! File-search store management.
//!
//! A store is a named, persistent namespace in the vector index, distinct
//! from the primary corpus. Stores are created explicitly, filled by
//! uploads, queried by the file-search path, and deleted explicitly;
//! deleting a store removes every index entry it owns.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::index::VectorIndex;
use crate::ingest::IngestionPipeline;
use crate::models::{Document, StoreSummary};

/// Persistence seam for store records.
#[async_trait]
pub trait StoreRegistry: Send + Sync {
    /// Insert a store record. Duplicate names are a data error.
    async fn create(&self, store: &StoreSummary) -> Result<()>;

    /// Find a store by id or by name.
    async fn resolve(&self, id_or_name: &str) -> Result<Option<StoreSummary>>;

    async fn list(&self) -> Result<Vec<StoreSummary>>;

    /// Remove a store record. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool>;
}

#[derive(Default)]
pub struct MemoryRegistry {
    stores: Mutex<HashMap<String, StoreSummary>>,
}

#[async_trait]
impl StoreRegistry for MemoryRegistry {
    async fn create(&self, store: &StoreSummary) -> Result<()> {
        let mut stores = self.stores.lock().await;
        if stores.values().any(|s| s.name == store.name) {
            return Err(EngineError::data(format!(
                "store name already exists: '{}'",
                store.name
            )));
        }
        stores.insert(store.id.clone(), store.clone());
        Ok(())
    }

    async fn resolve(&self, id_or_name: &str) -> Result<Option<StoreSummary>> {
        let stores = self.stores.lock().await;
        if let Some(store) = stores.get(id_or_name) {
            return Ok(Some(store.clone()));
        }
        Ok(stores.values().find(|s| s.name == id_or_name).cloned())
    }

    async fn list(&self) -> Result<Vec<StoreSummary>> {
        let stores = self.stores.lock().await;
        let mut all: Vec<StoreSummary> = stores.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.stores.lock().await.remove(id).is_some())
    }
}

pub struct SqliteRegistry {
    pool: SqlitePool,
}

impl SqliteRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StoreRegistry for SqliteRegistry {
    async fn create(&self, store: &StoreSummary) -> Result<()> {
        let result = sqlx::query("INSERT INTO stores (id, name, created_at) VALUES (?, ?, ?)")
            .bind(&store.id)
            .bind(&store.name)
            .bind(store.created_at)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(EngineError::data(
                format!("store name already exists: '{}'", store.name),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve(&self, id_or_name: &str) -> Result<Option<StoreSummary>> {
        let row = sqlx::query("SELECT id, name, created_at FROM stores WHERE id = ? OR name = ?")
            .bind(id_or_name)
            .bind(id_or_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| StoreSummary {
            id: r.get("id"),
            name: r.get("name"),
            created_at: r.get("created_at"),
        }))
    }

    async fn list(&self) -> Result<Vec<StoreSummary>> {
        let rows = sqlx::query("SELECT id, name, created_at FROM stores ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoreSummary {
                id: r.get("id"),
                name: r.get("name"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM stores WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

pub struct StoreManager {
    registry: Arc<dyn StoreRegistry>,
    index: Arc<dyn VectorIndex>,
    pipeline: Arc<IngestionPipeline>,
}

impl StoreManager {
    pub fn new(
        registry: Arc<dyn StoreRegistry>,
        index: Arc<dyn VectorIndex>,
        pipeline: Arc<IngestionPipeline>,
    ) -> Self {
        Self {
            registry,
            index,
            pipeline,
        }
    }

    pub async fn create_store(&self, name: &str) -> Result<StoreSummary> {
        if name.trim().is_empty() {
            return Err(EngineError::data("store name must not be empty"));
        }
        let store = StoreSummary {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: Utc::now().timestamp(),
        };
        self.registry.create(&store).await?;
        info!(store_id = %store.id, name, "store created");
        Ok(store)
    }

    /// Upload a document into a store (by id or name). Returns the
    /// assigned version and chunk count.
    pub async fn upload(&self, store_ref: &str, document: &Document) -> Result<(i64, usize)> {
        let store = self.require(store_ref).await?;
        self.pipeline.ingest_one(document, Some(&store.id)).await
    }

    pub async fn list_stores(&self) -> Result<Vec<StoreSummary>> {
        self.registry.list().await
    }

    /// Delete a store and every index entry it owns.
    pub async fn delete_store(&self, store_ref: &str) -> Result<u64> {
        let store = self.require(store_ref).await?;
        self.registry.delete(&store.id).await?;
        let removed = self.index.delete_by_store(&store.id).await?;
        info!(store_id = %store.id, removed, "store deleted");
        Ok(removed)
    }

    /// Map store references (ids or names) to store ids, failing on the
    /// first unknown reference.
    pub async fn resolve_ids(&self, store_refs: &[String]) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(store_refs.len());
        for store_ref in store_refs {
            ids.push(self.require(store_ref).await?.id);
        }
        Ok(ids)
    }

    async fn require(&self, store_ref: &str) -> Result<StoreSummary> {
        self.registry
            .resolve(store_ref)
            .await?
            .ok_or_else(|| EngineError::data(format!("unknown store: '{store_ref}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::embedding::HashProvider;
    use crate::index::MemoryIndex;

    fn manager() -> (StoreManager, Arc<MemoryIndex>) {
        let index = Arc::new(MemoryIndex::new(64));
        let pipeline = Arc::new(IngestionPipeline::new(
            Arc::clone(&index) as Arc<dyn VectorIndex>,
            Arc::new(HashProvider::new(64, 8000)),
            &Config::default(),
        ));
        let manager = StoreManager::new(
            Arc::new(MemoryRegistry::default()),
            Arc::clone(&index) as Arc<dyn VectorIndex>,
            pipeline,
        );
        (manager, index)
    }

    #[tokio::test]
    async fn create_list_delete_lifecycle() {
        let (manager, _) = manager();
        let store = manager.create_store("contracts").await.unwrap();
        assert!(!store.id.is_empty());

        let stores = manager.list_stores().await.unwrap();
        assert_eq!(stores.len(), 1);
        assert_eq!(stores[0].name, "contracts");

        manager.delete_store("contracts").await.unwrap();
        assert!(manager.list_stores().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_name_rejected() {
        let (manager, _) = manager();
        manager.create_store("notes").await.unwrap();
        let err = manager.create_store("notes").await.unwrap_err();
        assert_eq!(err.kind(), "data");
    }

    #[tokio::test]
    async fn upload_indexes_into_store_namespace() {
        let (manager, index) = manager();
        let store = manager.create_store("docs").await.unwrap();

        let doc = Document::new("guide.md", "upload", "text/plain", "how to file a claim");
        let (version, chunks) = manager.upload("docs", &doc).await.unwrap();
        assert_eq!(version, 1);
        assert_eq!(chunks, 1);

        // The primary corpus stays empty.
        let embedder = HashProvider::new(64, 8000);
        let vector = crate::embedding::embed_query(&embedder, "how to file a claim")
            .await
            .unwrap();
        assert!(index.query(&vector, 5, None).await.unwrap().is_empty());
        assert_eq!(index.query(&vector, 5, Some(&store.id)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_store_cascades_to_entries() {
        let (manager, index) = manager();
        manager.create_store("docs").await.unwrap();
        let doc = Document::new("a.md", "upload", "text/plain", "store content here");
        manager.upload("docs", &doc).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);

        let removed = manager.delete_store("docs").await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_store_is_data_error() {
        let (manager, _) = manager();
        let doc = Document::new("a.md", "upload", "text/plain", "x");
        assert_eq!(manager.upload("ghost", &doc).await.unwrap_err().kind(), "data");
        assert_eq!(
            manager
                .resolve_ids(&["ghost".to_string()])
                .await
                .unwrap_err()
                .kind(),
            "data"
        );
    }

    #[tokio::test]
    async fn resolve_by_id_and_name() {
        let (manager, _) = manager();
        let store = manager.create_store("docs").await.unwrap();
        let ids = manager
            .resolve_ids(&[store.id.clone(), "docs".to_string()])
            .await
            .unwrap();
        assert_eq!(ids, vec![store.id.clone(), store.id]);
    }
}
