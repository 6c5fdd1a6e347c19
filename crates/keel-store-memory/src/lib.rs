#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **keel-store-memory** – In-memory storage backend for Keel.
//!
//! This crate provides a fast, non-persistent backend suitable for testing,
//! development, and scenarios where durability is not required. All data is
//! held in process memory and lost when the process terminates. The backend
//! is fully interchangeable with the durable backends behind the
//! [`KvStore`] contract.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use keel_store_core::{
    ensure_active, fresh_etag, validate_key, Entity, KvStore, Predicate, StoreResult,
};

//─────────────────────────────
//  In-memory storage backend
//─────────────────────────────

/// A non-persistent key-value backend over a `HashMap`.
///
/// Clones share the same underlying map, so a store can be handed to
/// several components cheaply. The store has no transactional behavior of
/// its own; a resource adapter buffers mutations on its behalf.
#[derive(Debug, Clone)]
pub struct MemoryStore<E: Entity> {
    entries: Arc<RwLock<HashMap<String, E>>>,
}

impl<E: Entity> Default for MemoryStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> MemoryStore<E> {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self { entries: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Number of stored entities, for tests and diagnostics.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the store holds no entities.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl<E: Entity> KvStore<E> for MemoryStore<E> {
    async fn get(&self, key: &str, cancel: &CancellationToken) -> StoreResult<Option<E>> {
        ensure_active(cancel)?;
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn get_many(&self, keys: &[String], cancel: &CancellationToken) -> StoreResult<Vec<E>> {
        ensure_active(cancel)?;
        let entries = self.entries.read().await;
        Ok(keys.iter().filter_map(|k| entries.get(k).cloned()).collect())
    }

    async fn get_all(
        &self,
        predicate: Option<Predicate<'_, E>>,
        cancel: &CancellationToken,
    ) -> StoreResult<Vec<E>> {
        ensure_active(cancel)?;
        let entries = self.entries.read().await;
        let mut all: Vec<E> = match predicate {
            Some(keep) => entries.values().filter(|e| keep(e)).cloned().collect(),
            None => entries.values().cloned().collect(),
        };
        all.sort_by(|a, b| a.key().cmp(b.key()));
        Ok(all)
    }

    async fn save(&self, mut entity: E, cancel: &CancellationToken) -> StoreResult<E> {
        ensure_active(cancel)?;
        validate_key(entity.key())?;
        entity.set_etag(fresh_etag());
        self.entries
            .write()
            .await
            .insert(entity.key().to_string(), entity.clone());
        Ok(entity)
    }

    async fn save_many(&self, entities: Vec<E>, cancel: &CancellationToken) -> StoreResult<()> {
        ensure_active(cancel)?;
        for entity in &entities {
            validate_key(entity.key())?;
        }
        let mut entries = self.entries.write().await;
        for mut entity in entities {
            entity.set_etag(fresh_etag());
            entries.insert(entity.key().to_string(), entity);
        }
        Ok(())
    }

    async fn delete(&self, key: &str, cancel: &CancellationToken) -> StoreResult<bool> {
        ensure_active(cancel)?;
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn exists(&self, key: &str, cancel: &CancellationToken) -> StoreResult<bool> {
        ensure_active(cancel)?;
        Ok(self.entries.read().await.contains_key(key))
    }

    async fn count(&self, cancel: &CancellationToken) -> StoreResult<u64> {
        ensure_active(cancel)?;
        Ok(self.entries.read().await.len() as u64)
    }

    async fn clear(&self, cancel: &CancellationToken) -> StoreResult<()> {
        ensure_active(cancel)?;
        self.entries.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_store_core::StoreError;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Customer {
        key: String,
        version: u64,
        etag: Option<String>,
        name: String,
    }

    impl Entity for Customer {
        fn key(&self) -> &str {
            &self.key
        }
        fn version(&self) -> u64 {
            self.version
        }
        fn etag(&self) -> Option<&str> {
            self.etag.as_deref()
        }
        fn set_etag(&mut self, etag: String) {
            self.etag = Some(etag);
        }
    }

    fn customer(id: &str, name: &str) -> Customer {
        Customer {
            key: format!("Customer/{id}"),
            version: 1,
            etag: None,
            name: name.into(),
        }
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn basic_point_operations() {
        let store = MemoryStore::new();
        let cancel = token();

        assert_eq!(store.get("Customer/1", &cancel).await.unwrap(), None);

        store.save(customer("1", "Ada"), &cancel).await.unwrap();
        let found = store.get("Customer/1", &cancel).await.unwrap().unwrap();
        assert_eq!(found.name, "Ada");
        assert!(store.exists("Customer/1", &cancel).await.unwrap());
        assert_eq!(store.count(&cancel).await.unwrap(), 1);

        assert!(store.delete("Customer/1", &cancel).await.unwrap());
        assert!(!store.delete("Customer/1", &cancel).await.unwrap());
        assert_eq!(store.count(&cancel).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn save_stamps_a_fresh_etag() {
        let store = MemoryStore::new();
        let cancel = token();

        let first = store.save(customer("1", "Ada"), &cancel).await.unwrap();
        let second = store.save(first.clone(), &cancel).await.unwrap();

        assert!(first.etag.is_some());
        assert!(second.etag.is_some());
        assert_ne!(first.etag, second.etag);
    }

    #[tokio::test]
    async fn get_all_supports_predicates() {
        let store = MemoryStore::new();
        let cancel = token();
        store
            .save_many(
                vec![customer("1", "Ada"), customer("2", "Grace"), customer("3", "Ada")],
                &cancel,
            )
            .await
            .unwrap();

        let all = store.get_all(None, &cancel).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].key, "Customer/1");

        let keep = |c: &Customer| c.name == "Ada";
        let adas = store.get_all(Some(&keep), &cancel).await.unwrap();
        assert_eq!(adas.len(), 2);
    }

    #[tokio::test]
    async fn get_many_skips_missing_keys() {
        let store = MemoryStore::new();
        let cancel = token();
        store.save(customer("1", "Ada"), &cancel).await.unwrap();

        let found = store
            .get_many(&["Customer/1".into(), "Customer/9".into()], &cancel)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let store = MemoryStore::new();
        let cancel = token();
        let bad = Customer { key: String::new(), version: 1, etag: None, name: "x".into() };
        assert!(matches!(
            store.save(bad, &cancel).await,
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let store = MemoryStore::<Customer>::new();
        let cancel = token();
        cancel.cancel();
        assert!(matches!(
            store.get("Customer/1", &cancel).await,
            Err(StoreError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let store = MemoryStore::new();
        let cancel = token();
        store.save(customer("1", "Ada"), &cancel).await.unwrap();
        store.clear(&cancel).await.unwrap();
        assert!(store.is_empty().await);
    }
}
