#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **keel-txn** – In-process distributed transactions for Keel stores.
//!
//! This crate provides the two halves of Keel's transaction layer:
//!
//! * [`Transaction`] / [`TransactionFactory`] – the coordinator: a session
//!   object driving two-phase commit over enrolled resources, with a named
//!   savepoint stack and exactly-once terminal outcome.
//! * [`TransactionalStore`] – the resource adapter: wraps any
//!   [`KvStore`](keel_store_core::KvStore) and buffers saves and deletes
//!   until the coordinator commits.
//!
//! Sessions give no isolation across each other: the last committer wins
//! key-by-key. Callers needing stronger guarantees must coordinate
//! externally.

pub mod resource;
pub mod session;

pub use resource::{StagedOp, TransactionalStore};
pub use session::{Outcome, SessionState, Transaction, TransactionFactory};

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use super::{
        Outcome, SessionState, StagedOp, Transaction, TransactionFactory, TransactionalStore,
    };
    pub use keel_store_core::prelude::*;
}
