#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **keel-store-core** – Core persistence abstractions for Keel.
//!
//! This crate defines the contracts shared by every Keel storage backend and
//! by the transaction layer: the [`Entity`] marker trait, the [`KvStore`]
//! storage contract, the [`TransactionalResource`] two-phase-commit contract,
//! the entity serializer and the provider configuration model.
//!
//! Concrete backends (file, in-memory, SQLite, …) implement these traits in
//! separate crates that depend on this core abstraction and are fully
//! interchangeable behind it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub mod codec;
pub mod collab;
pub mod config;
mod error;

pub use error::{BoxedCause, StoreError, StoreResult};

//─────────────────────────────
//  Key and entity constraints
//─────────────────────────────

/// Maximum key length accepted by any backend, in bytes.
pub const MAX_KEY_BYTES: usize = 4096;

/// Maximum etag length accepted by any backend, in bytes.
pub const MAX_ETAG_BYTES: usize = 128;

//─────────────────────────────
//  Entity trait
//─────────────────────────────

/// Contract implemented by every value stored through Keel.
///
/// An entity carries a globally unique `key` within its type namespace
/// (conventionally `"<TypeName>/<Id>"`), a monotonic `version` reserved for
/// optimistic concurrency, and an opaque `etag` stamped afresh on every
/// successful save. Additional fields a service puts on its types
/// (subscriptions, checkout dates, …) are round-tripped opaquely by serde;
/// the storage contract never reads them.
pub trait Entity:
    Clone + std::fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// The entity's unique key.
    fn key(&self) -> &str;

    /// Monotonic positive version. Round-tripped by all backends, enforced
    /// by none.
    fn version(&self) -> u64;

    /// Opaque concurrency token from the last successful save, if any.
    fn etag(&self) -> Option<&str> {
        None
    }

    /// Replaces the entity's etag. Backends call this with a fresh UUID on
    /// every successful save.
    fn set_etag(&mut self, _etag: String) {}

    /// Scalar fields consumed by indexing collaborators; never read by the
    /// storage contract itself.
    fn index_fields(&self) -> BTreeMap<String, serde_json::Value> {
        BTreeMap::new()
    }
}

/// Checks the key invariants shared by all backends: non-empty, at most
/// [`MAX_KEY_BYTES`] bytes.
pub fn validate_key(key: &str) -> StoreResult<()> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey("key must not be empty".into()));
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(StoreError::InvalidKey(format!(
            "key is {} bytes, limit is {} bytes",
            key.len(),
            MAX_KEY_BYTES
        )));
    }
    Ok(())
}

/// Checks the entity invariants used by prepare-time validation: a valid
/// key, `version >= 1`, and an etag of at most [`MAX_ETAG_BYTES`] bytes
/// when present.
pub fn validate_entity<E: Entity>(entity: &E) -> StoreResult<()> {
    validate_key(entity.key())?;
    if entity.version() < 1 {
        return Err(StoreError::InvalidEntity {
            key: entity.key().to_string(),
            reason: "version must be >= 1".into(),
        });
    }
    if let Some(etag) = entity.etag() {
        if etag.len() > MAX_ETAG_BYTES {
            return Err(StoreError::InvalidEntity {
                key: entity.key().to_string(),
                reason: format!("etag exceeds {} bytes", MAX_ETAG_BYTES),
            });
        }
    }
    Ok(())
}

/// Returns `Err(Cancelled)` if the signal has fired. Backends call this at
/// entry and at every I/O boundary.
pub fn ensure_active(cancel: &CancellationToken) -> StoreResult<()> {
    if cancel.is_cancelled() {
        return Err(StoreError::Cancelled);
    }
    Ok(())
}

/// Mints the opaque token backends stamp on every successful save.
pub fn fresh_etag() -> String {
    Uuid::new_v4().to_string()
}

//─────────────────────────────
//  Storage backend contract
//─────────────────────────────

/// Borrowed predicate used by [`KvStore::get_all`] filtering.
pub type Predicate<'a, E> = &'a (dyn Fn(&E) -> bool + Send + Sync);

/// The storage provider contract: typed key-value operations over string
/// keys.
///
/// Every operation accepts a cancellation signal and may suspend at backend
/// I/O boundaries. Implementations are interchangeable: any compliant
/// backend must behave identically under the transactional interface.
#[async_trait]
pub trait KvStore<E: Entity>: Send + Sync {
    /// Fetches the entity stored under `key`, if any.
    async fn get(&self, key: &str, cancel: &CancellationToken) -> StoreResult<Option<E>>;

    /// Fetches the entities stored under `keys`, skipping missing ones.
    async fn get_many(&self, keys: &[String], cancel: &CancellationToken) -> StoreResult<Vec<E>>;

    /// Fetches every stored entity, optionally filtered by `predicate`.
    async fn get_all(
        &self,
        predicate: Option<Predicate<'_, E>>,
        cancel: &CancellationToken,
    ) -> StoreResult<Vec<E>>;

    /// Stores `entity` under its key, replacing any previous value, and
    /// returns the stored copy carrying its freshly stamped etag.
    async fn save(&self, entity: E, cancel: &CancellationToken) -> StoreResult<E>;

    /// Stores every entity in `entities`, replacing previous values.
    async fn save_many(&self, entities: Vec<E>, cancel: &CancellationToken) -> StoreResult<()>;

    /// Removes the entity stored under `key`. Returns whether a value was
    /// actually removed; deleting a missing key is not an error.
    async fn delete(&self, key: &str, cancel: &CancellationToken) -> StoreResult<bool>;

    /// Reports whether `key` currently holds a value.
    async fn exists(&self, key: &str, cancel: &CancellationToken) -> StoreResult<bool>;

    /// Number of stored entities.
    async fn count(&self, cancel: &CancellationToken) -> StoreResult<u64>;

    /// Removes every stored entity.
    async fn clear(&self, cancel: &CancellationToken) -> StoreResult<()>;

    /// The backend's own two-phase-commit participation, when it has one.
    ///
    /// A resource adapter wrapping this store delegates prepare, commit,
    /// rollback and savepoint calls to the returned resource. Backends with
    /// no transactional behavior of their own return `None` (the default).
    fn as_transactional(&self) -> Option<&dyn TransactionalResource> {
        None
    }
}

//─────────────────────────────
//  Two-phase-commit contract
//─────────────────────────────

/// Contract between the transaction coordinator and a participating
/// resource.
///
/// The coordinator drives prepare and commit in enrollment order and
/// rollback in reverse enrollment order. Once a resource has voted yes in
/// prepare it must be able to commit; the coordinator never rolls back after
/// entering the commit phase.
#[async_trait]
pub trait TransactionalResource: Send + Sync {
    /// Stable identity used for idempotent enlistment.
    fn resource_id(&self) -> Uuid;

    /// Validates staged state and votes on the outcome. `Ok(false)` is a
    /// no-vote; an error is treated as a no-vote by the coordinator.
    async fn prepare(&self, cancel: &CancellationToken) -> StoreResult<bool>;

    /// Applies staged state to the backing store. Only called after every
    /// enrolled resource voted yes.
    async fn commit(&self, cancel: &CancellationToken) -> StoreResult<()>;

    /// Discards staged state. Must complete regardless of cancellation;
    /// errors are logged and swallowed by the coordinator.
    async fn rollback(&self) -> StoreResult<()>;

    /// Records a named deep-copy snapshot of the resource's staged state.
    /// Re-using a name replaces the prior snapshot.
    async fn create_savepoint(&self, name: &str) -> StoreResult<()>;

    /// Restores staged state from the named snapshot.
    async fn rollback_to_savepoint(&self, name: &str) -> StoreResult<()>;

    /// Drops the named snapshot. Dropping an absent name is a no-op.
    async fn discard_savepoint(&self, name: &str) -> StoreResult<()>;
}

//─────────────────────────────
//  Convenience re-exports
//─────────────────────────────

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use super::codec::{JsonSerializer, Serializer};
    pub use super::config::{Capabilities, Capability, ProviderSettings, StoreSettings};
    pub use super::{
        ensure_active, fresh_etag, validate_entity, validate_key, Entity, KvStore, Predicate,
        StoreError, StoreResult, TransactionalResource,
    };
}
