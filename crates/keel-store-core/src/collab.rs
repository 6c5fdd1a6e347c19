//! Trait-shaped collaborator interfaces.
//!
//! Indexing, archival, backup, purge, migration and health checking are
//! out-of-scope collaborators: the core imports these narrow contracts and
//! never implements them on its own path. Each mirrors one of the
//! [`Capability`](crate::config::Capability) flags a provider can declare.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::StoreResult;

/// Indexing policy for one entity type.
#[derive(Debug, Clone, Default)]
pub struct IndexPolicy {
    /// Whether entities of this type are indexed at all.
    pub enabled: bool,
    /// The index-field names consumed from
    /// [`Entity::index_fields`](crate::Entity::index_fields).
    pub fields: Vec<String>,
}

/// Maintains secondary indices over saved entities.
#[async_trait]
pub trait IndexProvider: Send + Sync {
    /// The indexing policy for `entity_type`.
    fn policy(&self, entity_type: &str) -> IndexPolicy;

    /// Records the index fields of one saved entity.
    async fn index(
        &self,
        entity_type: &str,
        key: &str,
        fields: &BTreeMap<String, serde_json::Value>,
        cancel: &CancellationToken,
    ) -> StoreResult<()>;
}

/// Archival policy for one entity type.
#[derive(Debug, Clone, Default)]
pub struct ArchivePolicy {
    /// Whether entities of this type are archived.
    pub enabled: bool,
    /// Minimum age before an entity becomes archivable.
    pub min_age_days: u32,
}

/// Moves aged entities out of the hot store.
#[async_trait]
pub trait ArchiveProvider: Send + Sync {
    /// The archival policy for `entity_type`.
    fn policy(&self, entity_type: &str) -> ArchivePolicy;

    /// Archives eligible entities; returns how many were moved.
    async fn archive(&self, entity_type: &str, cancel: &CancellationToken) -> StoreResult<u64>;
}

/// Backup policy for one entity type.
#[derive(Debug, Clone, Default)]
pub struct BackupPolicy {
    /// Whether entities of this type are backed up.
    pub enabled: bool,
    /// Default backup destination, when configured.
    pub destination: Option<PathBuf>,
}

/// Copies a store's content to a backup destination.
#[async_trait]
pub trait BackupProvider: Send + Sync {
    /// The backup policy for `entity_type`.
    fn policy(&self, entity_type: &str) -> BackupPolicy;

    /// Writes a backup of `entity_type` to `destination`.
    async fn backup(
        &self,
        entity_type: &str,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> StoreResult<()>;
}

/// Purge policy for one entity type.
#[derive(Debug, Clone, Default)]
pub struct PurgePolicy {
    /// Whether entities of this type are purged.
    pub enabled: bool,
    /// Age past which entities are permanently removed.
    pub max_age_days: u32,
}

/// Permanently removes expired entities.
#[async_trait]
pub trait PurgeProvider: Send + Sync {
    /// The purge policy for `entity_type`.
    fn policy(&self, entity_type: &str) -> PurgePolicy;

    /// Purges expired entities; returns how many were removed.
    async fn purge(&self, entity_type: &str, cancel: &CancellationToken) -> StoreResult<u64>;
}

/// Migrates stored entities between schema versions.
#[async_trait]
pub trait MigrationProvider: Send + Sync {
    /// The schema version this provider migrates `entity_type` up to.
    fn target_version(&self, entity_type: &str) -> u64;

    /// Runs the migration for `entity_type`.
    async fn migrate(&self, entity_type: &str, cancel: &CancellationToken) -> StoreResult<()>;
}

/// Liveness probe a provider can expose.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Resolves `Ok` when the backing store is reachable.
    async fn check(&self, cancel: &CancellationToken) -> StoreResult<()>;
}
