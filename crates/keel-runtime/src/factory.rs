//! The provider factory.
//!
//! Reflection-driven provider instantiation from the source system is
//! restated as a registry of named constructor closures: the configuration's
//! `TypeName` (falling back to `Name`) keys into the registry, and each
//! constructed backend is cached so a provider name always resolves to the
//! same instance.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, info};

use keel_store_core::config::{ProviderSettings, StoreSettings};
use keel_store_core::{Entity, KvStore, StoreError, StoreResult};
use keel_store_file::{FileStore, FileStoreOptions, DEFAULT_MAX_VALUE_BYTES};
use keel_store_memory::MemoryStore;
use keel_store_sqlite::SqliteStore;

/// An async constructor closure producing a fully initialized backend from
/// one provider's configuration.
pub type BuilderFn<E> = Arc<
    dyn Fn(ProviderSettings) -> BoxFuture<'static, StoreResult<Arc<dyn KvStore<E>>>>
        + Send
        + Sync,
>;

/// Creates and caches backends for one entity type.
///
/// The factory is thread-safe: concurrent `create` calls for the same
/// provider name resolve to the same instance. Instantiate one factory per
/// entity type and share it behind an `Arc`.
pub struct StoreFactory<E: Entity> {
    settings: StoreSettings,
    builders: RwLock<HashMap<String, BuilderFn<E>>>,
    instances: Mutex<HashMap<String, Arc<dyn KvStore<E>>>>,
}

impl<E: Entity> std::fmt::Debug for StoreFactory<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreFactory")
            .field("providers", &self.settings.providers.len())
            .finish_non_exhaustive()
    }
}

impl<E: Entity> StoreFactory<E> {
    /// Builds a factory over `settings` with the built-in backend kinds
    /// (`file`, `memory`, `sqlite`) registered.
    pub fn new(settings: StoreSettings) -> Self {
        let factory = Self {
            settings,
            builders: RwLock::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
        };
        factory.register_builtins();
        factory
    }

    /// Registers (or replaces) the constructor for a backend kind. Third
    /// parties use this to plug additional backends into the registry.
    pub fn register(&self, kind: impl Into<String>, builder: BuilderFn<E>) {
        let kind = kind.into();
        debug!(kind = kind.as_str(), "backend kind registered");
        self.builders
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(kind, builder);
    }

    fn register_builtins(&self) {
        self.register(
            "memory",
            Arc::new(|_settings| {
                Box::pin(async move { Ok(Arc::new(MemoryStore::new()) as Arc<dyn KvStore<E>>) })
            }),
        );

        self.register(
            "file",
            Arc::new(|settings: ProviderSettings| {
                Box::pin(async move {
                    let path = settings.data_source.clone().ok_or_else(|| {
                        StoreError::InvalidKey(format!(
                            "provider '{}' requires DataSource for the file backend",
                            settings.name
                        ))
                    })?;
                    let options = FileStoreOptions {
                        max_value_bytes: settings
                            .max_value_bytes
                            .unwrap_or(DEFAULT_MAX_VALUE_BYTES),
                        compress: settings.enable_compression,
                    };
                    let store = FileStore::open_with_options(path, options).await?;
                    Ok(Arc::new(store) as Arc<dyn KvStore<E>>)
                })
            }),
        );

        self.register(
            "sqlite",
            Arc::new(|settings: ProviderSettings| {
                Box::pin(async move {
                    let store = SqliteStore::from_settings(&settings).await?;
                    Ok(Arc::new(store) as Arc<dyn KvStore<E>>)
                })
            }),
        );
    }

    /// Resolves the backend for the named provider, creating it on first
    /// use and returning the cached instance afterwards.
    pub async fn create(&self, name: &str) -> StoreResult<Arc<dyn KvStore<E>>> {
        // The instance lock is held across construction so racing callers
        // for the same name cannot build two backends.
        let mut instances = self.instances.lock().await;
        if let Some(existing) = instances.get(name) {
            return Ok(existing.clone());
        }

        let provider = self
            .settings
            .provider(name)
            .ok_or_else(|| StoreError::UnknownProvider(name.to_string()))?
            .clone();
        if !provider.enabled {
            return Err(StoreError::unavailable(format!("provider '{name}' is disabled")));
        }

        let kind = provider.kind().to_string();
        let builder = self
            .builders
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&kind)
            .cloned()
            .ok_or_else(|| StoreError::UnknownProvider(kind.clone()))?;

        info!(provider = name, kind = kind.as_str(), "creating backend");
        let instance = builder(provider).await?;
        instances.insert(name.to_string(), instance.clone());
        Ok(instance)
    }

    /// The configuration document this factory was built from.
    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }
}
