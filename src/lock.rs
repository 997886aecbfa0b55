//! # Cluster-Wide Journal Lock
//!
//! The lock defines the total order of the journal. Taking it allocates the
//! next global revision; everything appended while it is held carries that
//! revision.
//!
//! ## Two Levels of Exclusion
//!
//! ```text
//!   thread A ─┐                          ┌─ node B (other process)
//!   thread B ─┼─ in-process owner/condvar ┤
//!   thread C ─┘            │              │
//!                          ▼              ▼
//!                ┌─────────────────────────────────┐
//!                │  BEGIN IMMEDIATE                │  database write lock:
//!                │  UPDATE global_revision +1      │  blocks until the other
//!                │  SELECT revision                │  holder commits
//!                └─────────────────────────────────┘
//! ```
//!
//! Inside a process, one thread owns the lock at a time and may re-enter it.
//! Across processes, the database write lock taken by `BEGIN IMMEDIATE`
//! serializes nodes; the counter increment under it hands out revisions in
//! commit order. There is no timeout beyond the configured busy wait: a
//! crashed holder stalls every node until its transaction is resolved.
//!
//! ## Nesting
//!
//! Only the outermost `lock` begins the transaction and only the outermost
//! `unlock` ends it. What happens when an inner `unlock(false)` is followed by
//! an outer `unlock(true)` is decided by [`NestedUnlockPolicy`].

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use rusqlite::Connection;
use tracing::{debug, warn};

use crate::config::NestedUnlockPolicy;
use crate::connection::{lock_unpoisoned, ConnectionManager, Slot};
use crate::error::{Error, Result};
use crate::schema::Statements;

/// What an `unlock` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockOutcome {
    /// An inner unlock; the transaction is still open.
    Nested,
    /// The batch transaction committed.
    Committed,
    /// The batch transaction rolled back.
    RolledBack,
}

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    level: u32,
    revision: i64,
    /// Generation of the batch connection holding the transaction. `None`
    /// while the outermost acquisition is still talking to the database.
    generation: Option<u64>,
    rollback_only: bool,
}

/// Reentrant cluster-wide lock, one per journal instance.
pub struct LockManager {
    conns: Arc<ConnectionManager>,
    statements: Arc<Statements>,
    policy: NestedUnlockPolicy,
    state: Mutex<LockState>,
    released: Condvar,
}

impl LockManager {
    pub fn new(
        conns: Arc<ConnectionManager>,
        statements: Arc<Statements>,
        policy: NestedUnlockPolicy,
    ) -> Self {
        Self {
            conns,
            statements,
            policy,
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
        }
    }

    pub fn policy(&self) -> NestedUnlockPolicy {
        self.policy
    }

    /// Acquires the lock and returns the revision allocated to it.
    ///
    /// Nested calls from the owning thread return the same revision. Other
    /// threads wait for the owner's outermost `unlock`; other nodes wait on the
    /// database.
    ///
    /// # Errors
    ///
    /// A database failure tears down the batch connection, releases the lock
    /// and returns a retryable [`Error::Connectivity`].
    pub fn lock(&self) -> Result<i64> {
        let me = thread::current().id();
        let mut state = lock_unpoisoned(&self.state);

        loop {
            match state.owner {
                Some(owner) if owner == me => {
                    state.level += 1;
                    debug!(level = state.level, revision = state.revision, "journal lock re-entered");
                    return Ok(state.revision);
                }
                Some(_) => {
                    state = self
                        .released
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                None => break,
            }
        }

        state.owner = Some(me);
        state.level = 1;
        state.rollback_only = false;
        state.generation = None;
        // Waiting on the database must not hold the in-process mutex.
        drop(state);

        let acquired = self
            .conns
            .with_connection(Slot::Batch, "lock", |conn| self.begin_and_increment(conn))
            .and_then(|revision| {
                self.conns
                    .generation(Slot::Batch)
                    .map(|generation| (revision, generation))
                    .ok_or_else(|| {
                        Error::InvalidState("batch connection vanished while locking".to_string())
                    })
            });

        match acquired {
            Ok((revision, generation)) => {
                let mut state = lock_unpoisoned(&self.state);
                state.revision = revision;
                state.generation = Some(generation);
                debug!(revision, "journal lock acquired");
                Ok(revision)
            }
            Err(e) => {
                // The failed connection was dropped, which rolled back the
                // transaction; only the in-process bookkeeping is left.
                self.conns.teardown(Slot::Batch);
                self.release();
                Err(e)
            }
        }
    }

    fn begin_and_increment(&self, conn: &Connection) -> rusqlite::Result<i64> {
        conn.execute_batch("BEGIN IMMEDIATE")?;
        conn.prepare_cached(&self.statements.increment_global)?
            .execute([])?;
        conn.prepare_cached(&self.statements.select_global)?
            .query_row([], |row| row.get(0))
    }

    /// Releases one level of the lock.
    ///
    /// At the outermost level the transaction commits or rolls back according
    /// to `success` and the nested-unlock policy.
    ///
    /// # Errors
    ///
    /// - [`Error::Consistency`] when the calling thread does not hold the lock
    /// - [`Error::Connectivity`] / [`Error::TransactionAborted`] when a commit
    ///   fails; the lock is released and nothing was written
    pub fn unlock(&self, success: bool) -> Result<UnlockOutcome> {
        let me = thread::current().id();
        let mut state = lock_unpoisoned(&self.state);

        match state.owner {
            Some(owner) if owner == me && state.level > 0 => {}
            Some(_) => {
                return Err(Error::Consistency(
                    "unlock called by a thread that does not hold the journal lock".to_string(),
                ))
            }
            None => {
                return Err(Error::Consistency(
                    "unlock called without a matching lock".to_string(),
                ))
            }
        }

        if !success {
            state.rollback_only = true;
        }
        state.level -= 1;
        if state.level > 0 {
            debug!(level = state.level, success, "journal lock released (nested)");
            return Ok(UnlockOutcome::Nested);
        }

        let commit = match self.policy {
            NestedUnlockPolicy::RollbackOnAnyFailure => !state.rollback_only,
            NestedUnlockPolicy::OutermostDecides => success,
        };
        let revision = state.revision;
        let generation = state.generation;
        drop(state);

        let outcome = match generation {
            Some(generation) if commit => self
                .conns
                .with_pinned(Slot::Batch, generation, "commit", |conn| {
                    conn.execute_batch("COMMIT")
                })
                .map(|_| UnlockOutcome::Committed),
            Some(generation) => {
                let rollback = self
                    .conns
                    .with_pinned(Slot::Batch, generation, "rollback", |conn| {
                        conn.execute_batch("ROLLBACK")
                    });
                if let Err(e) = rollback {
                    // Either way the connection is gone and took the
                    // transaction with it.
                    debug!(revision, error = %e, "rollback found no live transaction");
                }
                Ok(UnlockOutcome::RolledBack)
            }
            None => Ok(UnlockOutcome::RolledBack),
        };

        match &outcome {
            Ok(result) => debug!(revision, ?result, "journal lock released"),
            Err(e) => warn!(revision, error = %e, "journal commit failed"),
        }

        self.release();
        outcome
    }

    fn release(&self) {
        let mut state = lock_unpoisoned(&self.state);
        *state = LockState::default();
        self.released.notify_all();
    }

    /// Revision and connection generation of the lock, if the calling thread
    /// holds it.
    pub(crate) fn held(&self) -> Option<(i64, u64)> {
        let me = thread::current().id();
        let state = lock_unpoisoned(&self.state);
        match (state.owner, state.generation) {
            (Some(owner), Some(generation)) if owner == me && state.level > 0 => {
                Some((state.revision, generation))
            }
            _ => None,
        }
    }

    /// Revision allocated to the lock, if the calling thread holds it.
    pub fn locked_revision(&self) -> Option<i64> {
        self.held().map(|(revision, _)| revision)
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.held().is_some()
    }

    /// Current nesting depth, whoever holds the lock.
    pub fn level(&self) -> u32 {
        lock_unpoisoned(&self.state).level
    }

    /// Runs `f` on the connection appropriate for the calling thread.
    ///
    /// The lock holder uses its batch transaction, so it reads its own
    /// uncommitted records and its writes commit or roll back with the batch.
    /// Everyone else uses the shared autocommit connection.
    pub fn with_connection<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        match self.held() {
            Some((_, generation)) => self.conns.with_pinned(Slot::Batch, generation, operation, f),
            None => self.conns.with_connection(Slot::Shared, operation, f),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
