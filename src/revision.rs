//! # Revision Store
//!
//! Two kinds of revision live in the database:
//!
//! - the **global revision**, one counter row shared by every node and only
//!   advanced by the [`LockManager`](crate::lock::LockManager)
//! - the **local revision**, one row per node holding the highest revision
//!   that node has fully consumed
//!
//! This module owns the local revision of one node. The value is cached in
//! memory after [`RevisionStore::init`]; the cache never runs ahead of the
//! database.
//!
//! ## Migration From a Single-Node Setup
//!
//! A node that ran stand-alone before joining a cluster kept its revision in a
//! file. When such a node registers for the first time, a
//! [`LegacyRevisionSource`] seeds its row with that value.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::{params, OptionalExtension};
use tracing::{info, warn};

use crate::connection::lock_unpoisoned;
use crate::error::{Error, Result};
use crate::lock::LockManager;
use crate::schema::Statements;
use crate::types::NodeId;

// =============================================================================
// Legacy Revision Import
// =============================================================================

/// Source of a revision recorded before the node joined the cluster.
pub trait LegacyRevisionSource: Send + Sync + fmt::Debug {
    /// Returns the recorded revision, or `None` if nothing was recorded.
    fn read(&self) -> Result<Option<i64>>;
}

/// A revision file: a single 8-byte big-endian signed integer.
#[derive(Debug, Clone)]
pub struct LegacyRevisionFile {
    path: PathBuf,
}

impl LegacyRevisionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `revision` in the legacy format.
    pub fn write(&self, revision: i64) -> Result<()> {
        std::fs::write(&self.path, revision.to_be_bytes())?;
        Ok(())
    }
}

impl LegacyRevisionSource for LegacyRevisionFile {
    fn read(&self) -> Result<Option<i64>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match bytes.len() {
            0 => Ok(None),
            n if n < 8 => Err(Error::Configuration(format!(
                "legacy revision file {} is truncated ({n} bytes)",
                self.path.display()
            ))),
            _ => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes[..8]);
                Ok(Some(i64::from_be_bytes(buf)))
            }
        }
    }
}

// =============================================================================
// RevisionStore
// =============================================================================

/// Local revision of one node, backed by its `local_revisions` row.
pub struct RevisionStore {
    node_id: NodeId,
    locks: Arc<LockManager>,
    statements: Arc<Statements>,
    legacy: Option<Box<dyn LegacyRevisionSource>>,
    cached: Mutex<Option<i64>>,
}

impl fmt::Debug for RevisionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevisionStore")
            .field("node_id", &self.node_id)
            .field("cached", &*lock_unpoisoned(&self.cached))
            .finish()
    }
}

impl RevisionStore {
    pub fn new(
        node_id: NodeId,
        locks: Arc<LockManager>,
        statements: Arc<Statements>,
        legacy: Option<Box<dyn LegacyRevisionSource>>,
    ) -> Self {
        Self {
            node_id,
            locks,
            statements,
            legacy,
            cached: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Registers this node, or loads its existing revision.
    ///
    /// If the node has no row yet, one is inserted with the legacy revision
    /// (when a source is configured and has a value) or `default`. If a row
    /// exists, its value wins and `default` is ignored. Safe to call again.
    pub fn init(&self, default: i64) -> Result<i64> {
        let node = self.node_id.as_str();

        let existing: Option<i64> = self.locks.with_connection("read local revision", |conn| {
            conn.prepare_cached(&self.statements.select_local)?
                .query_row(params![node], |row| row.get(0))
                .optional()
        })?;

        let revision = match existing {
            Some(revision) => revision,
            None => {
                let seed = self.seed(default)?;
                // INSERT OR IGNORE: a concurrent init of the same node id keeps
                // whichever row landed first, and both read that row back.
                self.locks.with_connection("register local revision", |conn| {
                    conn.prepare_cached(&self.statements.insert_local)?
                        .execute(params![node, seed])?;
                    conn.prepare_cached(&self.statements.select_local)?
                        .query_row(params![node], |row| row.get(0))
                })?
            }
        };

        *lock_unpoisoned(&self.cached) = Some(revision);
        info!(node_id = %self.node_id, revision, "local revision initialized");
        Ok(revision)
    }

    fn seed(&self, default: i64) -> Result<i64> {
        let Some(source) = &self.legacy else {
            return Ok(default);
        };
        match source.read()? {
            Some(revision) => {
                info!(node_id = %self.node_id, revision, ?source, "seeding local revision from legacy source");
                Ok(revision)
            }
            None => Ok(default),
        }
    }

    /// Returns the cached local revision.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] before [`init`](Self::init) has completed.
    pub fn get(&self) -> Result<i64> {
        lock_unpoisoned(&self.cached).ok_or_else(|| {
            Error::InvalidState("local revision read before initialization".to_string())
        })
    }

    /// Persists `revision` and updates the cache, logging instead of
    /// returning a failure.
    ///
    /// A failed update leaves both the row and the cache at the old value and
    /// the connection torn down. A lagging row only makes the janitor keep
    /// more history; use [`try_set`](Self::try_set) to react to the failure.
    pub fn set(&self, revision: i64) {
        if let Err(e) = self.try_set(revision) {
            warn!(node_id = %self.node_id, revision, error = %e, "failed to persist local revision");
        }
    }

    /// Persists `revision` and updates the cache.
    ///
    /// # Errors
    ///
    /// [`Error::Consistency`] when the calling thread holds the journal lock:
    /// the write would join the batch and outlive a rollback in the cache.
    pub fn try_set(&self, revision: i64) -> Result<()> {
        self.get()?;
        if self.locks.is_held_by_current_thread() {
            return Err(Error::Consistency(format!(
                "local revision {revision} must be persisted after the journal lock is released"
            )));
        }
        let node = self.node_id.as_str();

        self.locks.with_connection("update local revision", |conn| {
            let updated = conn
                .prepare_cached(&self.statements.update_local)?
                .execute(params![revision, node])?;
            if updated == 0 {
                // Row removed behind our back; put it back.
                conn.prepare_cached(&self.statements.insert_local)?
                    .execute(params![node, revision])?;
            }
            Ok(())
        })?;

        *lock_unpoisoned(&self.cached) = Some(revision);
        Ok(())
    }

    /// Current value of the global revision counter.
    pub fn global_revision(&self) -> Result<i64> {
        self.locks.with_connection("read global revision", |conn| {
            conn.prepare_cached(&self.statements.select_global)?
                .query_row([], |row| row.get(0))
        })
    }

    /// Local revisions of every registered node, ordered by node id.
    pub fn all_local_revisions(&self) -> Result<Vec<(String, i64)>> {
        self.locks.with_connection("list local revisions", |conn| {
            let mut stmt = conn.prepare_cached(&self.statements.select_all_local)?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
