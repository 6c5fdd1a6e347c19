#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **keel-runtime** – Config-driven provider factory and umbrella crate for
//! Keel.
//!
//! The factory turns the `Providers` configuration document into live,
//! cached backend instances: each provider name maps to a registered
//! constructor (the built-ins cover the file, memory and SQLite drivers)
//! and resolves to the same instance for the lifetime of the factory.
//!
//! Depending on this crate alone pulls in the whole Keel stack; the
//! [`prelude`] re-exports the types most services need.

pub mod factory;

pub use factory::{BuilderFn, StoreFactory};

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use keel_store_core::prelude::*;
    pub use keel_store_file::{FileStore, FileStoreOptions};
    pub use keel_store_memory::MemoryStore;
    pub use keel_store_sqlite::{SqliteStore, SqliteStoreOptions};
    pub use keel_txn::{Outcome, SessionState, Transaction, TransactionFactory, TransactionalStore};

    pub use super::{BuilderFn, StoreFactory};
}
