//! Wąski seam do trwałego magazynu: klucz-wartość z semantyką
//! get/put/scan-by-prefix/delete. Rdzeń nie zna silnika składowania –
//! backend (Postgres, Redis, cokolwiek) żyje u kolaboratora.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt record under `{0}`")]
    Corrupt(String),
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;
    async fn put(&self, key: &str, value: Value) -> Result<(), StorageError>;
    /// Wyniki posortowane po kluczu – audyt polega na tym porządku.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Backend pamięciowy – development i testy.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: DashMap<String, Value>,
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.items.get(key).map(|e| e.value().clone()))
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.items.insert(key.to_string(), value);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageError> {
        let mut out: Vec<(String, Value)> = self
            .items
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.items.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        let s = MemoryStorage::default();
        s.put("a/1", json!({"x": 1})).await.unwrap();
        assert_eq!(s.get("a/1").await.unwrap(), Some(json!({"x": 1})));
        s.delete("a/1").await.unwrap();
        assert_eq!(s.get("a/1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn scan_prefix_is_sorted_and_scoped() {
        let s = MemoryStorage::default();
        s.put("audit/1/000002", json!(2)).await.unwrap();
        s.put("audit/1/000001", json!(1)).await.unwrap();
        s.put("audit/2/000001", json!(9)).await.unwrap();

        let rows = s.scan_prefix("audit/1/").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "audit/1/000001");
        assert_eq!(rows[1].0, "audit/1/000002");
    }
}
