#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **keel-store-sqlite** – SQLite storage backend for Keel.
//!
//! A reliable, portable backend over a single SQLite database via sqlx.
//! Entities are serialized with the shared Keel codec and stored in one
//! `entities` table, so the backend behaves identically to the other
//! drivers behind the [`KvStore`] contract. `DataSource` may be a file path
//! or `:memory:`.

use std::marker::PhantomData;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use keel_store_core::codec::{JsonSerializer, Serializer};
use keel_store_core::config::ProviderSettings;
use keel_store_core::{
    ensure_active, fresh_etag, validate_key, Entity, KvStore, Predicate, StoreError, StoreResult,
};

/// Default per-value size ceiling: 1 MiB.
pub const DEFAULT_MAX_VALUE_BYTES: usize = 1 << 20;

//─────────────────────────────
//  Options
//─────────────────────────────

/// Tuning options for a [`SqliteStore`].
#[derive(Debug, Clone)]
pub struct SqliteStoreOptions {
    /// Serialized-value size ceiling in bytes.
    pub max_value_bytes: usize,
    /// Whether values are stored gzip-compressed.
    pub compress: bool,
    /// Per-operation timeout; `None` disables the wrapper.
    pub command_timeout: Option<Duration>,
    /// Connection attempts beyond the first before reporting `Unavailable`.
    pub retry_count: u32,
    /// Delay between connection attempts.
    pub retry_delay: Duration,
}

impl Default for SqliteStoreOptions {
    fn default() -> Self {
        Self {
            max_value_bytes: DEFAULT_MAX_VALUE_BYTES,
            compress: false,
            command_timeout: None,
            retry_count: 0,
            retry_delay: Duration::from_millis(100),
        }
    }
}

impl From<&ProviderSettings> for SqliteStoreOptions {
    fn from(settings: &ProviderSettings) -> Self {
        Self {
            max_value_bytes: settings.max_value_bytes.unwrap_or(DEFAULT_MAX_VALUE_BYTES),
            compress: settings.enable_compression,
            command_timeout: settings.command_timeout_seconds.map(Duration::from_secs),
            retry_count: settings.retry_count,
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
        }
    }
}

//─────────────────────────────
//  SQLite storage backend
//─────────────────────────────

/// A persistent key-value backend over a SQLite database.
#[derive(Debug)]
pub struct SqliteStore<E: Entity> {
    pool: SqlitePool,
    codec: JsonSerializer,
    max_value_bytes: usize,
    command_timeout: Option<Duration>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> SqliteStore<E> {
    /// Opens or creates the database at `path`.
    pub async fn open(path: impl AsRef<Path>, options: SqliteStoreOptions) -> StoreResult<Self> {
        let connect = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        Self::connect(connect, options).await
    }

    /// Opens a database that lives only in process memory.
    pub async fn in_memory(options: SqliteStoreOptions) -> StoreResult<Self> {
        let connect = SqliteConnectOptions::new().filename(":memory:");
        Self::connect(connect, options).await
    }

    /// Builds a store from a provider configuration entry. `DataSource` is
    /// required; `:memory:` selects the in-memory database.
    pub async fn from_settings(settings: &ProviderSettings) -> StoreResult<Self> {
        let options = SqliteStoreOptions::from(settings);
        match settings.data_source.as_deref() {
            Some(":memory:") => Self::in_memory(options).await,
            Some(path) => Self::open(path, options).await,
            None => Err(StoreError::InvalidKey(format!(
                "provider '{}' requires DataSource for the sqlite backend",
                settings.name
            ))),
        }
    }

    async fn connect(
        connect: SqliteConnectOptions,
        options: SqliteStoreOptions,
    ) -> StoreResult<Self> {
        let mut attempt: u32 = 0;
        let pool = loop {
            // A single connection keeps `:memory:` databases coherent across
            // operations; file databases gain nothing from more since SQLite
            // serializes writers anyway.
            let pool_options = SqlitePoolOptions::new().max_connections(1);
            match pool_options.connect_with(connect.clone()).await {
                Ok(pool) => break pool,
                Err(err) if attempt < options.retry_count => {
                    attempt += 1;
                    warn!(attempt, error = %err, "sqlite connect failed, retrying");
                    tokio::time::sleep(options.retry_delay).await;
                }
                Err(err) => {
                    return Err(StoreError::unavailable_from("cannot open sqlite database", err))
                }
            }
        };

        let store = Self {
            pool,
            codec: if options.compress {
                JsonSerializer::compressed()
            } else {
                JsonSerializer::new()
            },
            max_value_bytes: options.max_value_bytes,
            command_timeout: options.command_timeout,
            _entity: PhantomData,
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                key TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                etag TEXT,
                value BLOB NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::unavailable_from("cannot create entities table", e))?;
        debug!("sqlite schema ready");
        Ok(())
    }

    /// Closes the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Runs one database future under the configured command timeout.
    async fn run<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: std::future::Future<Output = Result<T, sqlx::Error>> + Send,
    {
        let result = match self.command_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| StoreError::unavailable("sqlite command timed out"))?,
            None => fut.await,
        };
        result.map_err(|e| StoreError::unavailable_from("sqlite command failed", e))
    }

    fn encode(&self, entity: &E) -> StoreResult<Vec<u8>> {
        let bytes = self.codec.serialize(entity)?;
        if bytes.len() > self.max_value_bytes {
            return Err(StoreError::ValueTooLarge {
                key: entity.key().to_string(),
                size: bytes.len(),
                limit: self.max_value_bytes,
            });
        }
        Ok(bytes)
    }
}

#[async_trait]
impl<E: Entity> KvStore<E> for SqliteStore<E> {
    async fn get(&self, key: &str, cancel: &CancellationToken) -> StoreResult<Option<E>> {
        ensure_active(cancel)?;
        let row = self
            .run(
                sqlx::query("SELECT value FROM entities WHERE key = ?")
                    .bind(key)
                    .fetch_optional(&self.pool),
            )
            .await?;
        match row {
            Some(row) => {
                let bytes: Vec<u8> = row.get("value");
                Ok(Some(self.codec.deserialize(&bytes)?))
            }
            None => Ok(None),
        }
    }

    async fn get_many(&self, keys: &[String], cancel: &CancellationToken) -> StoreResult<Vec<E>> {
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            ensure_active(cancel)?;
            if let Some(entity) = self.get(key, cancel).await? {
                found.push(entity);
            }
        }
        Ok(found)
    }

    async fn get_all(
        &self,
        predicate: Option<Predicate<'_, E>>,
        cancel: &CancellationToken,
    ) -> StoreResult<Vec<E>> {
        ensure_active(cancel)?;
        let rows = self
            .run(
                sqlx::query("SELECT value FROM entities ORDER BY key")
                    .fetch_all(&self.pool),
            )
            .await?;
        let mut all = Vec::with_capacity(rows.len());
        for row in rows {
            let bytes: Vec<u8> = row.get("value");
            let entity: E = self.codec.deserialize(&bytes)?;
            if predicate.map_or(true, |keep| keep(&entity)) {
                all.push(entity);
            }
        }
        Ok(all)
    }

    async fn save(&self, mut entity: E, cancel: &CancellationToken) -> StoreResult<E> {
        ensure_active(cancel)?;
        validate_key(entity.key())?;
        entity.set_etag(fresh_etag());
        let bytes = self.encode(&entity)?;
        self.run(
            sqlx::query(
                "INSERT OR REPLACE INTO entities (key, version, etag, value) VALUES (?, ?, ?, ?)",
            )
            .bind(entity.key())
            .bind(entity.version() as i64)
            .bind(entity.etag())
            .bind(bytes)
            .execute(&self.pool),
        )
        .await?;
        Ok(entity)
    }

    async fn save_many(&self, entities: Vec<E>, cancel: &CancellationToken) -> StoreResult<()> {
        ensure_active(cancel)?;
        let mut stamped = Vec::with_capacity(entities.len());
        for mut entity in entities {
            validate_key(entity.key())?;
            entity.set_etag(fresh_etag());
            let bytes = self.encode(&entity)?;
            stamped.push((entity, bytes));
        }

        let mut tx = self.run(self.pool.begin()).await?;
        for (entity, bytes) in &stamped {
            ensure_active(cancel)?;
            self.run(
                sqlx::query(
                    "INSERT OR REPLACE INTO entities (key, version, etag, value) \
                     VALUES (?, ?, ?, ?)",
                )
                .bind(entity.key())
                .bind(entity.version() as i64)
                .bind(entity.etag())
                .bind(bytes.as_slice())
                .execute(&mut *tx),
            )
            .await?;
        }
        self.run(tx.commit()).await?;
        Ok(())
    }

    async fn delete(&self, key: &str, cancel: &CancellationToken) -> StoreResult<bool> {
        ensure_active(cancel)?;
        let result = self
            .run(
                sqlx::query("DELETE FROM entities WHERE key = ?")
                    .bind(key)
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn exists(&self, key: &str, cancel: &CancellationToken) -> StoreResult<bool> {
        ensure_active(cancel)?;
        let row = self
            .run(
                sqlx::query("SELECT 1 FROM entities WHERE key = ?")
                    .bind(key)
                    .fetch_optional(&self.pool),
            )
            .await?;
        Ok(row.is_some())
    }

    async fn count(&self, cancel: &CancellationToken) -> StoreResult<u64> {
        ensure_active(cancel)?;
        let row = self
            .run(
                sqlx::query("SELECT COUNT(*) AS count FROM entities")
                    .fetch_one(&self.pool),
            )
            .await?;
        let count: i64 = row.get("count");
        Ok(count as u64)
    }

    async fn clear(&self, cancel: &CancellationToken) -> StoreResult<()> {
        ensure_active(cancel)?;
        self.run(sqlx::query("DELETE FROM entities").execute(&self.pool))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Payment {
        key: String,
        version: u64,
        etag: Option<String>,
        amount_cents: i64,
    }

    impl Entity for Payment {
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

    fn payment(id: &str, amount_cents: i64) -> Payment {
        Payment {
            key: format!("Payment/{id}"),
            version: 1,
            etag: None,
            amount_cents,
        }
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn basic_operations_in_memory() {
        let store = SqliteStore::in_memory(SqliteStoreOptions::default()).await.unwrap();
        let cancel = token();

        assert_eq!(store.get("Payment/1", &cancel).await.unwrap(), None);

        let saved = store.save(payment("1", 500), &cancel).await.unwrap();
        assert!(saved.etag.is_some());
        assert!(store.exists("Payment/1", &cancel).await.unwrap());
        assert_eq!(store.count(&cancel).await.unwrap(), 1);

        let found = store.get("Payment/1", &cancel).await.unwrap().unwrap();
        assert_eq!(found, saved);

        assert!(store.delete("Payment/1", &cancel).await.unwrap());
        assert!(!store.delete("Payment/1", &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn save_many_is_atomic_and_visible() {
        let store = SqliteStore::in_memory(SqliteStoreOptions::default()).await.unwrap();
        let cancel = token();

        store
            .save_many(vec![payment("1", 100), payment("2", 200)], &cancel)
            .await
            .unwrap();
        assert_eq!(store.count(&cancel).await.unwrap(), 2);

        let all = store.get_all(None, &cancel).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].key, "Payment/1");

        let keep = |p: &Payment| p.amount_cents > 150;
        let large = store.get_all(Some(&keep), &cancel).await.unwrap();
        assert_eq!(large.len(), 1);
        assert_eq!(large[0].key, "Payment/2");
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payments.db");
        let cancel = token();

        {
            let store = SqliteStore::open(&path, SqliteStoreOptions::default()).await.unwrap();
            store.save(payment("1", 999), &cancel).await.unwrap();
            store.close().await;
        }

        let store: SqliteStore<Payment> =
            SqliteStore::open(&path, SqliteStoreOptions::default()).await.unwrap();
        let found = store.get("Payment/1", &cancel).await.unwrap().unwrap();
        assert_eq!(found.amount_cents, 999);
    }

    #[tokio::test]
    async fn oversized_value_is_rejected() {
        let options = SqliteStoreOptions { max_value_bytes: 64, ..Default::default() };
        let store = SqliteStore::in_memory(options).await.unwrap();
        let cancel = token();

        let mut big = payment("1", 1);
        big.key = format!("Payment/{}", "x".repeat(128));
        assert!(matches!(
            store.save(big, &cancel).await,
            Err(StoreError::ValueTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn from_settings_requires_data_source() {
        let settings = ProviderSettings::named("payments");
        let result = SqliteStore::<Payment>::from_settings(&settings).await;
        assert!(matches!(result, Err(StoreError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn from_settings_honors_memory_data_source() {
        let mut settings = ProviderSettings::named("payments");
        settings.data_source = Some(":memory:".into());
        let store = SqliteStore::<Payment>::from_settings(&settings).await.unwrap();
        let cancel = token();
        store.save(payment("1", 10), &cancel).await.unwrap();
        assert_eq!(store.count(&cancel).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let store = SqliteStore::<Payment>::in_memory(SqliteStoreOptions::default())
            .await
            .unwrap();
        let cancel = token();
        cancel.cancel();
        assert!(matches!(
            store.get("Payment/1", &cancel).await,
            Err(StoreError::Cancelled)
        ));
    }
}
