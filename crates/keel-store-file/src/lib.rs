#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **keel-store-file** – Durable file-backed JSON storage backend for Keel.
//!
//! The reference backend: one JSON document per store, an in-memory cache
//! that is authoritative during a session, and the document on disk that is
//! authoritative across process restarts. Mutations touch only the cache;
//! durability happens at [`FileStore::flush`], which is also what the
//! two-phase `commit` does. `rollback` reloads the cache from disk,
//! discarding unflushed mutations.
//!
//! The whole document is held in memory; this backend is intentionally not
//! suitable for data that exceeds process memory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use keel_store_core::codec::{JsonSerializer, Serializer};
use keel_store_core::{
    ensure_active, fresh_etag, validate_key, Entity, KvStore, Predicate, StoreError, StoreResult,
    TransactionalResource,
};

/// Default per-value size ceiling: 1 MiB.
pub const DEFAULT_MAX_VALUE_BYTES: usize = 1 << 20;

//─────────────────────────────
//  Options
//─────────────────────────────

/// Tuning options for a [`FileStore`].
#[derive(Debug, Clone)]
pub struct FileStoreOptions {
    /// Serialized-value size ceiling in bytes.
    pub max_value_bytes: usize,
    /// Whether values are stored gzip-compressed inside the document.
    pub compress: bool,
}

impl Default for FileStoreOptions {
    fn default() -> Self {
        Self { max_value_bytes: DEFAULT_MAX_VALUE_BYTES, compress: false }
    }
}

//─────────────────────────────
//  File-backed storage backend
//─────────────────────────────

/// A durable key-value backend over a single JSON document.
///
/// All cache access goes through one mutex; reads take the same permit as
/// writes, and the lock is never held across file I/O: flushing clones the
/// cache under the lock and serializes outside it.
#[derive(Debug)]
pub struct FileStore<E: Entity> {
    path: PathBuf,
    cache: Mutex<BTreeMap<String, E>>,
    codec: JsonSerializer,
    max_value_bytes: usize,
    resource_id: Uuid,
}

impl<E: Entity> FileStore<E> {
    /// Opens or creates the store backed by the document at `path`.
    ///
    /// An absent file is created empty. A present but malformed file is
    /// logged and treated as empty; this is documented, non-fatal behavior.
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        Self::open_with_options(path, FileStoreOptions::default()).await
    }

    /// Opens the store with explicit [`FileStoreOptions`].
    pub async fn open_with_options(
        path: impl Into<PathBuf>,
        options: FileStoreOptions,
    ) -> StoreResult<Self> {
        let codec = if options.compress {
            JsonSerializer::compressed()
        } else {
            JsonSerializer::new()
        };
        let store = Self {
            path: path.into(),
            cache: Mutex::new(BTreeMap::new()),
            codec,
            max_value_bytes: options.max_value_bytes,
            resource_id: Uuid::new_v4(),
        };
        let initial = store.load_document().await?;
        *store.cache.lock().await = initial;
        Ok(store)
    }

    /// The path of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the current cache to disk atomically.
    ///
    /// The document is serialized to a uuid-suffixed temporary file, synced,
    /// and renamed over the target in one step, so no reader can observe a
    /// truncated or partially written document.
    pub async fn flush(&self) -> StoreResult<()> {
        let snapshot = self.cache.lock().await.clone();
        self.write_document(&snapshot).await
    }

    /// Replaces the cache with the document currently on disk.
    pub async fn reload(&self) -> StoreResult<()> {
        let fresh = self.load_document().await?;
        *self.cache.lock().await = fresh;
        Ok(())
    }

    async fn load_document(&self) -> StoreResult<BTreeMap<String, E>> {
        match fs::read(&self.path).await {
            Ok(bytes) => match self.decode_document(&bytes) {
                Ok(map) => Ok(map),
                Err(err) => {
                    warn!(
                        path = %self.path.display(),
                        error = %err,
                        "data file is malformed, starting empty"
                    );
                    Ok(BTreeMap::new())
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "data file absent, creating empty document");
                self.write_document(&BTreeMap::new()).await?;
                Ok(BTreeMap::new())
            }
            Err(err) => Err(StoreError::unavailable_from(
                format!("cannot read {}", self.path.display()),
                err,
            )),
        }
    }

    fn decode_document(&self, bytes: &[u8]) -> StoreResult<BTreeMap<String, E>> {
        let doc: Map<String, Value> =
            serde_json::from_slice(bytes).map_err(StoreError::serialization)?;
        let mut map = BTreeMap::new();
        for (key, value) in doc {
            map.insert(key, self.decode_value(&value)?);
        }
        Ok(map)
    }

    fn decode_value(&self, value: &Value) -> StoreResult<E> {
        match value {
            Value::String(text) => self.codec.deserialize(text.as_bytes()),
            other => serde_json::from_value(other.clone()).map_err(StoreError::serialization),
        }
    }

    /// Encodes one entity into its document representation and reports its
    /// serialized size for the `max_value_bytes` check.
    fn encode_value(&self, entity: &E) -> StoreResult<(Value, usize)> {
        if self.codec.is_compressing() {
            let bytes = self.codec.serialize(entity)?;
            let size = bytes.len();
            let text = String::from_utf8(bytes).map_err(StoreError::serialization)?;
            Ok((Value::String(text), size))
        } else {
            let bytes = self.codec.serialize(entity)?;
            let size = bytes.len();
            let value = serde_json::from_slice(&bytes).map_err(StoreError::serialization)?;
            Ok((value, size))
        }
    }

    fn check_value_size(&self, entity: &E) -> StoreResult<()> {
        let (_, size) = self.encode_value(entity)?;
        if size > self.max_value_bytes {
            return Err(StoreError::ValueTooLarge {
                key: entity.key().to_string(),
                size,
                limit: self.max_value_bytes,
            });
        }
        Ok(())
    }

    async fn write_document(&self, map: &BTreeMap<String, E>) -> StoreResult<()> {
        let mut doc = Map::new();
        for (key, entity) in map {
            let (value, _) = self.encode_value(entity)?;
            doc.insert(key.clone(), value);
        }
        let bytes =
            serde_json::to_vec_pretty(&Value::Object(doc)).map_err(StoreError::serialization)?;

        let mut tmp_name = self.path.clone().into_os_string();
        tmp_name.push(format!(".tmp.{}", Uuid::new_v4().simple()));
        let tmp = PathBuf::from(tmp_name);

        let io_err = |op: &str, path: &Path| {
            let what = format!("cannot {op} {}", path.display());
            move |e: std::io::Error| StoreError::unavailable_from(what.clone(), e)
        };

        let mut file = fs::File::create(&tmp).await.map_err(io_err("create", &tmp))?;
        if let Err(err) = async {
            file.write_all(&bytes).await?;
            file.sync_all().await
        }
        .await
        {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_err("write", &tmp)(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp, &self.path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_err("replace", &self.path)(err));
        }

        // Best-effort directory sync so the rename itself is durable.
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = fs::File::open(parent).await {
                let _ = dir.sync_all().await;
            }
        }

        debug!(path = %self.path.display(), entries = map.len(), "flushed document");
        Ok(())
    }
}

#[async_trait]
impl<E: Entity> KvStore<E> for FileStore<E> {
    async fn get(&self, key: &str, cancel: &CancellationToken) -> StoreResult<Option<E>> {
        ensure_active(cancel)?;
        Ok(self.cache.lock().await.get(key).cloned())
    }

    async fn get_many(&self, keys: &[String], cancel: &CancellationToken) -> StoreResult<Vec<E>> {
        ensure_active(cancel)?;
        let cache = self.cache.lock().await;
        Ok(keys.iter().filter_map(|k| cache.get(k).cloned()).collect())
    }

    async fn get_all(
        &self,
        predicate: Option<Predicate<'_, E>>,
        cancel: &CancellationToken,
    ) -> StoreResult<Vec<E>> {
        ensure_active(cancel)?;
        let cache = self.cache.lock().await;
        Ok(match predicate {
            Some(keep) => cache.values().filter(|e| keep(e)).cloned().collect(),
            None => cache.values().cloned().collect(),
        })
    }

    async fn save(&self, mut entity: E, cancel: &CancellationToken) -> StoreResult<E> {
        ensure_active(cancel)?;
        validate_key(entity.key())?;
        self.check_value_size(&entity)?;
        entity.set_etag(fresh_etag());
        self.cache
            .lock()
            .await
            .insert(entity.key().to_string(), entity.clone());
        Ok(entity)
    }

    async fn save_many(&self, entities: Vec<E>, cancel: &CancellationToken) -> StoreResult<()> {
        ensure_active(cancel)?;
        for entity in &entities {
            validate_key(entity.key())?;
            self.check_value_size(entity)?;
        }
        let mut cache = self.cache.lock().await;
        for mut entity in entities {
            entity.set_etag(fresh_etag());
            cache.insert(entity.key().to_string(), entity);
        }
        Ok(())
    }

    async fn delete(&self, key: &str, cancel: &CancellationToken) -> StoreResult<bool> {
        ensure_active(cancel)?;
        Ok(self.cache.lock().await.remove(key).is_some())
    }

    async fn exists(&self, key: &str, cancel: &CancellationToken) -> StoreResult<bool> {
        ensure_active(cancel)?;
        Ok(self.cache.lock().await.contains_key(key))
    }

    async fn count(&self, cancel: &CancellationToken) -> StoreResult<u64> {
        ensure_active(cancel)?;
        Ok(self.cache.lock().await.len() as u64)
    }

    async fn clear(&self, cancel: &CancellationToken) -> StoreResult<()> {
        ensure_active(cancel)?;
        self.cache.lock().await.clear();
        Ok(())
    }

    fn as_transactional(&self) -> Option<&dyn TransactionalResource> {
        Some(self)
    }
}

#[async_trait]
impl<E: Entity> TransactionalResource for FileStore<E> {
    fn resource_id(&self) -> Uuid {
        self.resource_id
    }

    /// The file was readable when the store loaded; nothing further to
    /// validate.
    async fn prepare(&self, cancel: &CancellationToken) -> StoreResult<bool> {
        ensure_active(cancel)?;
        Ok(true)
    }

    async fn commit(&self, cancel: &CancellationToken) -> StoreResult<()> {
        ensure_active(cancel)?;
        self.flush().await
    }

    async fn rollback(&self) -> StoreResult<()> {
        self.reload().await
    }

    /// The file store keeps no fine-grained savepoints; rollback granularity
    /// is the whole document.
    async fn create_savepoint(&self, _name: &str) -> StoreResult<()> {
        Ok(())
    }

    async fn rollback_to_savepoint(&self, _name: &str) -> StoreResult<()> {
        Ok(())
    }

    async fn discard_savepoint(&self, _name: &str) -> StoreResult<()> {
        Ok(())
    }
}
