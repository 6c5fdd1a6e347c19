//! The transaction coordinator.
//!
//! A [`Transaction`] is a session object owning the two-phase-commit state
//! machine: it enrolls resources, sequences prepare/commit in enrollment
//! order, rolls back in reverse enrollment order, and maintains the named
//! savepoint stack. A session reaches exactly one terminal outcome; a
//! session dropped while still active rolls back in the background.
//!
//! Sessions are not thread-safe by design: at most one task drives a
//! session at a time, which the `&mut self` methods enforce statically.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use keel_store_core::{StoreError, StoreResult, TransactionalResource};

//─────────────────────────────
//  Session state machine
//─────────────────────────────

/// Where a session is within the two-phase-commit state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting enlistments, staging and savepoints.
    Active,
    /// Collecting prepare votes.
    Preparing,
    /// Every resource voted yes; the session will commit.
    Prepared,
    /// Driving resource commits.
    Committing,
    /// Terminal: the commit phase ran (possibly partially).
    Committed,
    /// Driving resource rollbacks.
    Aborting,
    /// Terminal: staged state was discarded everywhere.
    Aborted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "Active",
            Self::Preparing => "Preparing",
            Self::Prepared => "Prepared",
            Self::Committing => "Committing",
            Self::Committed => "Committed",
            Self::Aborting => "Aborting",
            Self::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

/// The terminal status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every resource committed.
    Committed,
    /// Staged state was discarded; no resource committed.
    Aborted,
    /// The commit phase did not complete cleanly: some resources committed,
    /// some did not. Irrecoverable at this level; the application must
    /// reconcile.
    PartiallyCommitted,
}

//─────────────────────────────
//  Transaction session
//─────────────────────────────

/// A two-phase-commit session over enrolled resources.
pub struct Transaction {
    id: Uuid,
    state: SessionState,
    enrolled: Vec<Arc<dyn TransactionalResource>>,
    savepoints: Vec<String>,
    outcome: Option<Outcome>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("enrolled", &self.enrolled.len())
            .field("savepoints", &self.savepoints)
            .finish()
    }
}

impl Transaction {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Active,
            enrolled: Vec::new(),
            savepoints: Vec::new(),
            outcome: None,
        }
    }

    /// The session's unique id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The session's current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The terminal outcome, once the session finished.
    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    fn guard_active(&self, operation: &str) -> StoreResult<()> {
        if self.state != SessionState::Active {
            return Err(StoreError::InvalidState(format!(
                "{operation} requires an active session, state is {}",
                self.state
            )));
        }
        Ok(())
    }

    /// Registers `resource` with the session. Enlisting the same resource
    /// twice is idempotent; enlistment order determines prepare and commit
    /// order.
    pub fn enlist(&mut self, resource: Arc<dyn TransactionalResource>) -> StoreResult<()> {
        self.guard_active("enlist")?;
        let id = resource.resource_id();
        if self.enrolled.iter().any(|r| r.resource_id() == id) {
            debug!(session = %self.id, resource = %id, "resource already enrolled");
            return Ok(());
        }
        debug!(session = %self.id, resource = %id, "resource enrolled");
        self.enrolled.push(resource);
        Ok(())
    }

    /// Records a named snapshot across all enrolled resources and pushes it
    /// onto the savepoint stack. Re-using a name replaces the prior
    /// snapshot; the latest wins.
    pub async fn save_point(
        &mut self,
        name: &str,
        cancel: &CancellationToken,
    ) -> StoreResult<()> {
        self.guard_active("save_point")?;
        keel_store_core::ensure_active(cancel)?;
        for resource in &self.enrolled {
            resource.create_savepoint(name).await?;
        }
        self.savepoints.retain(|n| n != name);
        self.savepoints.push(name.to_string());
        debug!(session = %self.id, savepoint = name, "savepoint recorded");
        Ok(())
    }

    /// Applies the named snapshot to every enrolled resource, then pops the
    /// savepoint stack through `name` inclusive, discarding the popped
    /// snapshots everywhere.
    pub async fn rollback_to(
        &mut self,
        name: &str,
        cancel: &CancellationToken,
    ) -> StoreResult<()> {
        self.guard_active("rollback_to")?;
        keel_store_core::ensure_active(cancel)?;
        let position = self
            .savepoints
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| StoreError::UnknownSavepoint(name.to_string()))?;

        for resource in &self.enrolled {
            resource.rollback_to_savepoint(name).await?;
        }

        let popped = self.savepoints.split_off(position);
        for popped_name in &popped {
            for resource in &self.enrolled {
                if let Err(err) = resource.discard_savepoint(popped_name).await {
                    warn!(
                        session = %self.id,
                        savepoint = popped_name.as_str(),
                        error = %err,
                        "failed to discard savepoint"
                    );
                }
            }
        }
        debug!(session = %self.id, savepoint = name, "rolled back to savepoint");
        Ok(())
    }

    /// Runs two-phase commit over the enrolled resources.
    ///
    /// Prepare visits resources in enrollment order; any no-vote or error
    /// aborts the session (`PrepareFailed`). Once every resource voted yes
    /// the commit phase runs to completion: commit errors are logged, the
    /// remaining resources still commit, and the session terminates with a
    /// `PartiallyCommitted` outcome; prepared means will-commit, so no
    /// rollback happens past this point.
    ///
    /// Cancellation before prepare completes behaves as rollback and
    /// reports `Cancelled`. Cancellation observed later does not stop the
    /// commit phase; it is reported as `Cancelled` with a
    /// `PartiallyCommitted` outcome.
    pub async fn commit(&mut self, cancel: &CancellationToken) -> StoreResult<Outcome> {
        self.guard_active("commit")?;
        if cancel.is_cancelled() {
            self.abort().await;
            return Err(StoreError::Cancelled);
        }

        self.state = SessionState::Preparing;
        debug!(session = %self.id, resources = self.enrolled.len(), "preparing");

        let mut all_yes = true;
        let mut cancelled = false;
        for resource in &self.enrolled {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            match resource.prepare(cancel).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(
                        session = %self.id,
                        resource = %resource.resource_id(),
                        "resource voted no"
                    );
                    all_yes = false;
                }
                Err(StoreError::Cancelled) => {
                    cancelled = true;
                    break;
                }
                Err(err) => {
                    warn!(
                        session = %self.id,
                        resource = %resource.resource_id(),
                        error = %err,
                        "prepare errored, treated as no-vote"
                    );
                    all_yes = false;
                }
            }
        }

        if cancelled {
            self.abort().await;
            return Err(StoreError::Cancelled);
        }
        if !all_yes {
            self.abort().await;
            return Err(StoreError::PrepareFailed);
        }

        self.state = SessionState::Prepared;
        self.state = SessionState::Committing;
        debug!(session = %self.id, "committing");

        // Prepared resources must commit even if the caller's token fires
        // now, so the commit phase runs on a detached token.
        let detached = CancellationToken::new();
        let total = self.enrolled.len();
        let mut committed = 0usize;
        let mut commit_failed = false;
        for resource in &self.enrolled {
            match resource.commit(&detached).await {
                Ok(()) => committed += 1,
                Err(err) => {
                    error!(
                        session = %self.id,
                        resource = %resource.resource_id(),
                        error = %err,
                        "resource commit failed, continuing with remaining resources"
                    );
                    commit_failed = true;
                }
            }
        }

        self.state = SessionState::Committed;
        self.savepoints.clear();

        if commit_failed {
            self.outcome = Some(Outcome::PartiallyCommitted);
            return Err(StoreError::PartiallyCommitted { committed, total });
        }
        if cancel.is_cancelled() {
            self.outcome = Some(Outcome::PartiallyCommitted);
            return Err(StoreError::Cancelled);
        }

        self.outcome = Some(Outcome::Committed);
        info!(session = %self.id, resources = total, "session committed");
        Ok(Outcome::Committed)
    }

    /// Drives every enrolled resource to discard its staged state, in
    /// reverse enrollment order. Resource errors are logged and swallowed;
    /// rollback completes for every resource. Calling `rollback` on an
    /// already terminal session is a no-op.
    pub async fn rollback(&mut self) -> StoreResult<()> {
        match self.state {
            SessionState::Committed | SessionState::Aborted => Ok(()),
            _ => {
                self.abort().await;
                Ok(())
            }
        }
    }

    /// Releases the session: if it is neither committed nor aborted this
    /// behaves as [`rollback`](Self::rollback).
    pub async fn dispose(mut self) -> StoreResult<()> {
        self.rollback().await
    }

    async fn abort(&mut self) {
        self.state = SessionState::Aborting;
        for resource in self.enrolled.iter().rev() {
            if let Err(err) = resource.rollback().await {
                error!(
                    session = %self.id,
                    resource = %resource.resource_id(),
                    error = %err,
                    "resource rollback failed, continuing"
                );
            }
        }
        self.savepoints.clear();
        self.state = SessionState::Aborted;
        if self.outcome.is_none() {
            self.outcome = Some(Outcome::Aborted);
        }
        info!(session = %self.id, "session aborted");
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if matches!(self.state, SessionState::Committed | SessionState::Aborted) {
            return;
        }
        warn!(session = %self.id, "session dropped while active, rolling back in the background");
        let id = self.id;
        let resources = std::mem::take(&mut self.enrolled);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                for resource in resources.iter().rev() {
                    if let Err(err) = resource.rollback().await {
                        error!(session = %id, error = %err, "rollback after drop failed");
                    }
                }
            });
        } else {
            error!(session = %id, "no runtime available for rollback after drop");
        }
    }
}

//─────────────────────────────
//  Session factory
//─────────────────────────────

static FACTORY: Lazy<TransactionFactory> = Lazy::new(TransactionFactory::default);

/// Process-wide source of new transaction sessions.
#[derive(Debug, Default)]
pub struct TransactionFactory {
    sessions_started: AtomicU64,
}

impl TransactionFactory {
    /// The process-wide factory instance.
    pub fn instance() -> &'static Self {
        &FACTORY
    }

    /// Starts a new active session with a fresh id.
    pub fn begin(&self) -> Transaction {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
        let session = Transaction::new();
        debug!(session = %session.id(), "session started");
        session
    }

    /// How many sessions this factory has started.
    pub fn sessions_started(&self) -> u64 {
        self.sessions_started.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    /// A resource recording which lifecycle calls it received.
    #[derive(Debug, Default)]
    struct Probe {
        id: Uuid,
        prepared: AtomicBool,
        committed: AtomicBool,
        rolled_back: AtomicBool,
        vote: bool,
    }

    impl Probe {
        fn voting(vote: bool) -> Arc<Self> {
            Arc::new(Self { id: Uuid::new_v4(), vote, ..Self::default() })
        }
    }

    #[async_trait]
    impl TransactionalResource for Probe {
        fn resource_id(&self) -> Uuid {
            self.id
        }
        async fn prepare(&self, _cancel: &CancellationToken) -> StoreResult<bool> {
            self.prepared.store(true, Ordering::SeqCst);
            Ok(self.vote)
        }
        async fn commit(&self, _cancel: &CancellationToken) -> StoreResult<()> {
            self.committed.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn rollback(&self) -> StoreResult<()> {
            self.rolled_back.store(true, Ordering::SeqCst);
            Ok(())
        }
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

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn commit_of_empty_session_succeeds() {
        let mut session = TransactionFactory::instance().begin();
        assert_eq!(session.state(), SessionState::Active);
        let outcome = session.commit(&token()).await.unwrap();
        assert_eq!(outcome, Outcome::Committed);
        assert_eq!(session.state(), SessionState::Committed);
    }

    #[tokio::test]
    async fn enlisting_the_same_resource_twice_is_idempotent() {
        let mut session = TransactionFactory::instance().begin();
        let probe = Probe::voting(true);
        session.enlist(probe.clone()).unwrap();
        session.enlist(probe.clone()).unwrap();
        session.commit(&token()).await.unwrap();
        assert!(probe.committed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn double_commit_is_rejected() {
        let mut session = TransactionFactory::instance().begin();
        session.commit(&token()).await.unwrap();
        assert!(matches!(
            session.commit(&token()).await,
            Err(StoreError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn enlist_after_commit_is_rejected() {
        let mut session = TransactionFactory::instance().begin();
        session.commit(&token()).await.unwrap();
        assert!(matches!(
            session.enlist(Probe::voting(true)),
            Err(StoreError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn no_vote_aborts_and_rolls_back_everyone() {
        let mut session = TransactionFactory::instance().begin();
        let yes = Probe::voting(true);
        let no = Probe::voting(false);
        session.enlist(yes.clone()).unwrap();
        session.enlist(no.clone()).unwrap();

        let err = session.commit(&token()).await.unwrap_err();
        assert!(matches!(err, StoreError::PrepareFailed));
        assert_eq!(session.state(), SessionState::Aborted);
        assert_eq!(session.outcome(), Some(Outcome::Aborted));
        assert!(yes.rolled_back.load(Ordering::SeqCst));
        assert!(no.rolled_back.load(Ordering::SeqCst));
        assert!(!yes.committed.load(Ordering::SeqCst));
        assert!(!no.committed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn rollback_is_idempotent() {
        let mut session = TransactionFactory::instance().begin();
        let probe = Probe::voting(true);
        session.enlist(probe.clone()).unwrap();
        session.rollback().await.unwrap();
        session.rollback().await.unwrap();
        assert_eq!(session.state(), SessionState::Aborted);
        assert_eq!(session.outcome(), Some(Outcome::Aborted));
    }

    #[tokio::test]
    async fn cancellation_before_prepare_behaves_as_rollback() {
        let mut session = TransactionFactory::instance().begin();
        let probe = Probe::voting(true);
        session.enlist(probe.clone()).unwrap();

        let cancel = token();
        cancel.cancel();
        let err = session.commit(&cancel).await.unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
        assert_eq!(session.state(), SessionState::Aborted);
        assert!(probe.rolled_back.load(Ordering::SeqCst));
        assert!(!probe.committed.load(Ordering::SeqCst));
    }

    /// A resource that fires the caller's cancellation token from inside
    /// its own (successful) commit, so the session observes the signal only
    /// once the commit phase is already under way.
    #[derive(Debug)]
    struct CancelsMidCommit {
        id: Uuid,
        caller_token: CancellationToken,
        committed: AtomicBool,
    }

    impl CancelsMidCommit {
        fn new(caller_token: &CancellationToken) -> Arc<Self> {
            Arc::new(Self {
                id: Uuid::new_v4(),
                caller_token: caller_token.clone(),
                committed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl TransactionalResource for CancelsMidCommit {
        fn resource_id(&self) -> Uuid {
            self.id
        }
        async fn prepare(&self, _cancel: &CancellationToken) -> StoreResult<bool> {
            Ok(true)
        }
        async fn commit(&self, _cancel: &CancellationToken) -> StoreResult<()> {
            self.caller_token.cancel();
            self.committed.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn rollback(&self) -> StoreResult<()> {
            Ok(())
        }
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

    #[tokio::test]
    async fn cancellation_mid_commit_reports_partial_commit() {
        let cancel = token();
        let first = CancelsMidCommit::new(&cancel);
        let second = Probe::voting(true);

        let mut session = TransactionFactory::instance().begin();
        session.enlist(first.clone()).unwrap();
        session.enlist(second.clone()).unwrap();

        let err = session.commit(&cancel).await.unwrap_err();

        // Every commit call succeeded, but the signal fired past the point
        // of no return: the session terminates committed and reports
        // `Cancelled` with a `PartiallyCommitted` outcome.
        assert!(matches!(err, StoreError::Cancelled));
        assert_eq!(session.state(), SessionState::Committed);
        assert_eq!(session.outcome(), Some(Outcome::PartiallyCommitted));
        assert!(first.committed.load(Ordering::SeqCst));
        assert!(second.committed.load(Ordering::SeqCst));
        assert!(!second.rolled_back.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unknown_savepoint_name_is_reported() {
        let mut session = TransactionFactory::instance().begin();
        assert!(matches!(
            session.rollback_to("missing", &token()).await,
            Err(StoreError::UnknownSavepoint(_))
        ));
    }

    /// A resource appending its label to a shared journal on every
    /// lifecycle call, to observe cross-resource ordering.
    #[derive(Debug)]
    struct Journaled {
        id: Uuid,
        label: &'static str,
        journal: Arc<std::sync::Mutex<Vec<String>>>,
        vote: bool,
    }

    impl Journaled {
        fn new(
            label: &'static str,
            journal: &Arc<std::sync::Mutex<Vec<String>>>,
            vote: bool,
        ) -> Arc<Self> {
            Arc::new(Self { id: Uuid::new_v4(), label, journal: journal.clone(), vote })
        }

        fn log(&self, call: &str) {
            self.journal
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(format!("{}:{call}", self.label));
        }
    }

    #[async_trait]
    impl TransactionalResource for Journaled {
        fn resource_id(&self) -> Uuid {
            self.id
        }
        async fn prepare(&self, _cancel: &CancellationToken) -> StoreResult<bool> {
            self.log("prepare");
            Ok(self.vote)
        }
        async fn commit(&self, _cancel: &CancellationToken) -> StoreResult<()> {
            self.log("commit");
            Ok(())
        }
        async fn rollback(&self) -> StoreResult<()> {
            self.log("rollback");
            Ok(())
        }
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

    #[tokio::test]
    async fn prepare_and_commit_follow_enrollment_order() {
        let journal = Arc::new(std::sync::Mutex::new(Vec::new()));
        let a = Journaled::new("a", &journal, true);
        let b = Journaled::new("b", &journal, true);

        let mut session = TransactionFactory::instance().begin();
        session.enlist(a).unwrap();
        session.enlist(b).unwrap();
        session.commit(&token()).await.unwrap();

        let calls = journal.lock().unwrap_or_else(|p| p.into_inner()).clone();
        assert_eq!(
            calls,
            vec!["a:prepare", "b:prepare", "a:commit", "b:commit"]
        );
    }

    #[tokio::test]
    async fn abort_rolls_back_in_reverse_enrollment_order() {
        let journal = Arc::new(std::sync::Mutex::new(Vec::new()));
        let a = Journaled::new("a", &journal, true);
        let b = Journaled::new("b", &journal, false);

        let mut session = TransactionFactory::instance().begin();
        session.enlist(a).unwrap();
        session.enlist(b).unwrap();
        assert!(matches!(
            session.commit(&token()).await,
            Err(StoreError::PrepareFailed)
        ));

        let calls = journal.lock().unwrap_or_else(|p| p.into_inner()).clone();
        assert_eq!(
            calls,
            vec!["a:prepare", "b:prepare", "b:rollback", "a:rollback"]
        );
    }

    #[tokio::test]
    async fn factory_counts_sessions() {
        let before = TransactionFactory::instance().sessions_started();
        let session = TransactionFactory::instance().begin();
        assert!(TransactionFactory::instance().sessions_started() > before);
        session.dispose().await.unwrap();
    }
}
