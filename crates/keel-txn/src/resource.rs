//! The transactional resource adapter.
//!
//! [`TransactionalStore`] turns any [`KvStore`] into a two-phase-commit
//! participant by buffering saves and deletes until commit. Reads through
//! the adapter are consistent with the session's own staged writes but are
//! not isolated from other sessions: an un-staged key reflects whatever the
//! backend currently holds.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use keel_store_core::{
    ensure_active, validate_entity, validate_key, Entity, KvStore, StoreError, StoreResult,
    TransactionalResource,
};

//─────────────────────────────
//  Staged operations
//─────────────────────────────

/// An intent buffered inside the adapter awaiting commit.
///
/// Per key, at most one operation is staged: staging a delete clears a
/// pending save for the same key and vice versa.
#[derive(Debug, Clone)]
pub enum StagedOp<E> {
    /// The entity will be written to the backend on commit.
    Save {
        /// The staged entity.
        entity: E,
        /// When the intent was staged.
        staged_at: DateTime<Utc>,
    },
    /// The key will be removed from the backend on commit.
    Delete {
        /// When the intent was staged.
        staged_at: DateTime<Utc>,
    },
}

#[derive(Debug)]
struct StagedState<E> {
    ops: BTreeMap<String, StagedOp<E>>,
    savepoints: HashMap<String, BTreeMap<String, StagedOp<E>>>,
}

impl<E> Default for StagedState<E> {
    fn default() -> Self {
        Self { ops: BTreeMap::new(), savepoints: HashMap::new() }
    }
}

//─────────────────────────────
//  The adapter
//─────────────────────────────

/// Presents a [`KvStore`] as a two-phase-commit resource.
///
/// One mutex guards the staged-operations map and the savepoint snapshots;
/// it is only held for in-memory updates, never across backend I/O;
/// operations are cloned out before any await.
pub struct TransactionalStore<E: Entity> {
    resource_id: Uuid,
    backend: Arc<dyn KvStore<E>>,
    state: Mutex<StagedState<E>>,
}

impl<E: Entity> std::fmt::Debug for TransactionalStore<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalStore")
            .field("resource_id", &self.resource_id)
            .finish_non_exhaustive()
    }
}

impl<E: Entity> TransactionalStore<E> {
    /// Wraps `backend` in a new adapter with empty staged state.
    pub fn new(backend: Arc<dyn KvStore<E>>) -> Self {
        Self {
            resource_id: Uuid::new_v4(),
            backend,
            state: Mutex::new(StagedState::default()),
        }
    }

    /// The wrapped backend.
    pub fn backend(&self) -> &Arc<dyn KvStore<E>> {
        &self.backend
    }

    fn state(&self) -> MutexGuard<'_, StagedState<E>> {
        // A poisoned lock means a panic mid-update; recovering the guard
        // beats poisoning every later caller of this adapter.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stages `entity` for save, replacing any staged operation for its key.
    pub fn stage_save(&self, entity: E) -> StoreResult<()> {
        validate_key(entity.key())?;
        let key = entity.key().to_string();
        self.state()
            .ops
            .insert(key, StagedOp::Save { entity, staged_at: Utc::now() });
        Ok(())
    }

    /// Stages every entity in `entities` for save.
    pub fn stage_save_many(&self, entities: Vec<E>) -> StoreResult<()> {
        for entity in &entities {
            validate_key(entity.key())?;
        }
        let mut state = self.state();
        for entity in entities {
            let key = entity.key().to_string();
            state
                .ops
                .insert(key, StagedOp::Save { entity, staged_at: Utc::now() });
        }
        Ok(())
    }

    /// Stages `key` for deletion, replacing any staged save for it.
    pub fn stage_delete(&self, key: &str) -> StoreResult<()> {
        validate_key(key)?;
        self.state()
            .ops
            .insert(key.to_string(), StagedOp::Delete { staged_at: Utc::now() });
        Ok(())
    }

    /// Read-through get: a staged delete hides the key, a staged save is
    /// returned as-is, anything else is delegated to the backend.
    pub async fn get(&self, key: &str, cancel: &CancellationToken) -> StoreResult<Option<E>> {
        ensure_active(cancel)?;
        {
            let state = self.state();
            match state.ops.get(key) {
                Some(StagedOp::Delete { .. }) => return Ok(None),
                Some(StagedOp::Save { entity, .. }) => return Ok(Some(entity.clone())),
                None => {}
            }
        }
        self.backend.get(key, cancel).await
    }

    /// A read-only snapshot of the buffered operations, for tests and
    /// diagnostics.
    pub fn staged(&self) -> BTreeMap<String, StagedOp<E>> {
        self.state().ops.clone()
    }

    /// Whether any operation is currently staged.
    pub fn has_staged(&self) -> bool {
        !self.state().ops.is_empty()
    }
}

#[async_trait]
impl<E: Entity> TransactionalResource for TransactionalStore<E> {
    fn resource_id(&self) -> Uuid {
        self.resource_id
    }

    async fn prepare(&self, cancel: &CancellationToken) -> StoreResult<bool> {
        ensure_active(cancel)?;
        let ops = self.state().ops.clone();
        for (key, op) in &ops {
            match op {
                StagedOp::Save { entity, .. } => {
                    if let Err(err) = validate_entity(entity) {
                        debug!(key, error = %err, "staged save failed validation, voting no");
                        return Ok(false);
                    }
                }
                StagedOp::Delete { .. } => {
                    ensure_active(cancel)?;
                    // Best-effort: the check races with other sessions, but a
                    // target already gone now will not come back by commit.
                    if !self.backend.exists(key, cancel).await? {
                        debug!(key, "delete target missing at prepare, voting no");
                        return Ok(false);
                    }
                }
            }
        }
        if let Some(inner) = self.backend.as_transactional() {
            return inner.prepare(cancel).await;
        }
        Ok(true)
    }

    async fn commit(&self, cancel: &CancellationToken) -> StoreResult<()> {
        let ops = self.state().ops.clone();
        let mut deletes = Vec::new();
        let mut saves = Vec::new();
        for (key, op) in ops {
            match op {
                StagedOp::Delete { .. } => deletes.push(key),
                StagedOp::Save { entity, .. } => saves.push(entity),
            }
        }

        for key in &deletes {
            ensure_active(cancel)?;
            self.backend.delete(key, cancel).await?;
        }
        if !saves.is_empty() {
            ensure_active(cancel)?;
            self.backend.save_many(saves, cancel).await?;
        }

        {
            let mut state = self.state();
            state.ops.clear();
            state.savepoints.clear();
        }

        if let Some(inner) = self.backend.as_transactional() {
            inner.commit(cancel).await?;
        }
        Ok(())
    }

    async fn rollback(&self) -> StoreResult<()> {
        {
            let mut state = self.state();
            state.ops.clear();
            state.savepoints.clear();
        }
        if let Some(inner) = self.backend.as_transactional() {
            inner.rollback().await?;
        }
        Ok(())
    }

    async fn create_savepoint(&self, name: &str) -> StoreResult<()> {
        {
            let mut state = self.state();
            let snapshot = state.ops.clone();
            state.savepoints.insert(name.to_string(), snapshot);
        }
        if let Some(inner) = self.backend.as_transactional() {
            inner.create_savepoint(name).await?;
        }
        Ok(())
    }

    async fn rollback_to_savepoint(&self, name: &str) -> StoreResult<()> {
        {
            let mut state = self.state();
            let snapshot = state
                .savepoints
                .get(name)
                .cloned()
                .ok_or_else(|| StoreError::UnknownSavepoint(name.to_string()))?;
            state.ops = snapshot;
        }
        if let Some(inner) = self.backend.as_transactional() {
            inner.rollback_to_savepoint(name).await?;
        }
        Ok(())
    }

    async fn discard_savepoint(&self, name: &str) -> StoreResult<()> {
        self.state().savepoints.remove(name);
        if let Some(inner) = self.backend.as_transactional() {
            inner.discard_savepoint(name).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_store_memory::MemoryStore;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Item {
        key: String,
        version: u64,
        etag: Option<String>,
        qty: u32,
    }

    impl Entity for Item {
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

    fn item(id: &str, qty: u32) -> Item {
        Item { key: format!("Item/{id}"), version: 1, etag: None, qty }
    }

    fn adapter() -> (MemoryStore<Item>, TransactionalStore<Item>) {
        let store = MemoryStore::new();
        let backend: Arc<dyn KvStore<Item>> = Arc::new(store.clone());
        (store, TransactionalStore::new(backend))
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn staged_save_is_invisible_to_the_backend() {
        let (store, adapter) = adapter();
        let cancel = token();

        adapter.stage_save(item("1", 3)).unwrap();
        assert!(!store.exists("Item/1", &cancel).await.unwrap());
        assert_eq!(adapter.get("Item/1", &cancel).await.unwrap().unwrap().qty, 3);
    }

    #[tokio::test]
    async fn delete_clears_pending_save_and_wins() {
        let (store, adapter) = adapter();
        let cancel = token();
        store.save(item("1", 1), &cancel).await.unwrap();

        adapter.stage_save(item("1", 9)).unwrap();
        adapter.stage_delete("Item/1").unwrap();
        assert_eq!(adapter.staged().len(), 1);
        assert!(matches!(
            adapter.staged().get("Item/1"),
            Some(StagedOp::Delete { .. })
        ));

        adapter.commit(&cancel).await.unwrap();
        assert!(!store.exists("Item/1", &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn save_clears_pending_delete_and_wins() {
        let (store, adapter) = adapter();
        let cancel = token();
        store.save(item("1", 1), &cancel).await.unwrap();

        adapter.stage_delete("Item/1").unwrap();
        adapter.stage_save(item("1", 7)).unwrap();
        assert_eq!(adapter.staged().len(), 1);

        adapter.commit(&cancel).await.unwrap();
        assert_eq!(store.get("Item/1", &cancel).await.unwrap().unwrap().qty, 7);
    }

    #[tokio::test]
    async fn read_through_honors_staged_delete() {
        let (store, adapter) = adapter();
        let cancel = token();
        store.save(item("1", 1), &cancel).await.unwrap();

        adapter.stage_delete("Item/1").unwrap();
        assert_eq!(adapter.get("Item/1", &cancel).await.unwrap(), None);
        // The backend itself is untouched until commit.
        assert!(store.exists("Item/1", &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn prepare_votes_no_on_invalid_version() {
        let (_, adapter) = adapter();
        let cancel = token();
        let mut bad = item("1", 1);
        bad.version = 0;
        adapter.stage_save(bad).unwrap();

        assert!(!adapter.prepare(&cancel).await.unwrap());
    }

    #[tokio::test]
    async fn prepare_votes_no_on_missing_delete_target() {
        let (_, adapter) = adapter();
        let cancel = token();
        adapter.stage_delete("Item/ghost").unwrap();

        assert!(!adapter.prepare(&cancel).await.unwrap());
    }

    #[tokio::test]
    async fn prepare_votes_yes_on_valid_staged_state() {
        let (store, adapter) = adapter();
        let cancel = token();
        store.save(item("1", 1), &cancel).await.unwrap();

        adapter.stage_save(item("2", 2)).unwrap();
        adapter.stage_delete("Item/1").unwrap();
        assert!(adapter.prepare(&cancel).await.unwrap());
    }

    #[tokio::test]
    async fn rollback_discards_staged_state() {
        let (store, adapter) = adapter();
        let cancel = token();

        adapter.stage_save(item("1", 3)).unwrap();
        adapter.rollback().await.unwrap();

        assert!(!adapter.has_staged());
        assert!(!store.exists("Item/1", &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn commit_clears_staged_state() {
        let (store, adapter) = adapter();
        let cancel = token();

        adapter.stage_save(item("1", 3)).unwrap();
        adapter.commit(&cancel).await.unwrap();

        assert!(!adapter.has_staged());
        assert!(store.exists("Item/1", &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn savepoint_round_trip_restores_staged_set() {
        let (_, adapter) = adapter();

        adapter.stage_save(item("a", 1)).unwrap();
        adapter.create_savepoint("sp1").await.unwrap();

        adapter.stage_save(item("b", 2)).unwrap();
        adapter.stage_delete("Item/a").unwrap();
        assert_eq!(adapter.staged().len(), 2);

        adapter.rollback_to_savepoint("sp1").await.unwrap();
        let staged = adapter.staged();
        assert_eq!(staged.len(), 1);
        assert!(matches!(staged.get("Item/a"), Some(StagedOp::Save { .. })));
    }

    #[tokio::test]
    async fn unknown_savepoint_is_an_error() {
        let (_, adapter) = adapter();
        assert!(matches!(
            adapter.rollback_to_savepoint("nope").await,
            Err(StoreError::UnknownSavepoint(_))
        ));
    }

    #[tokio::test]
    async fn empty_key_cannot_be_staged() {
        let (_, adapter) = adapter();
        let bad = Item { key: String::new(), version: 1, etag: None, qty: 1 };
        assert!(matches!(adapter.stage_save(bad), Err(StoreError::InvalidKey(_))));
        assert!(matches!(adapter.stage_delete(""), Err(StoreError::InvalidKey(_))));
    }
}
