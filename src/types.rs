//! # Domain Types for the Cluster Journal
//!
//! The journal deals in very few types: who wrote something ([`NodeId`]), what
//! was written ([`JournalRecord`]) and summaries of background work
//! ([`CleanupStats`], [`SyncStats`]).
//!
//! ## Revisions
//!
//! Revisions are plain `i64` values, matching the SQL `INTEGER` column they
//! live in. The global counter starts at 0, so the first lock acquisition in a
//! fresh cluster allocates revision 1. [`REVISION_NONE`] is the "before
//! everything" sentinel accepted by the reader.
//!
//! ## Invariants
//!
//! - A record's revision is unique per lock acquisition and strictly increases
//!   in commit order across every node sharing the database
//! - Records written under one lock share a revision and keep insertion order
//! - A committed record never changes

use std::fmt;

use crate::error::{Error, Result};

/// Reading `records(REVISION_NONE)` returns the complete journal.
pub const REVISION_NONE: i64 = i64::MIN;

// =============================================================================
// Node Identification
// =============================================================================

/// Identifier of a cluster node.
///
/// The node id keys the node's local revision row and stamps every record it
/// appends, so it must stay stable across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id, rejecting empty strings.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::Configuration("node id must not be empty".to_string()));
        }
        Ok(Self(id))
    }

    /// Wraps an id already known to be valid (generated or read back from the
    /// database).
    pub(crate) fn from_trusted(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Journal Record
// =============================================================================

/// One row of the journal.
///
/// `producer_id` names the subsystem that wrote the record (the item-state
/// cache, the lock table, ...). On replay, the record is handed to the
/// [`RecordConsumer`](crate::consumer::RecordConsumer) with the same id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub revision: i64,
    pub node_id: String,
    pub producer_id: String,
    pub payload: Vec<u8>,
}

impl JournalRecord {
    /// True when the record was appended by `node`.
    pub fn is_from(&self, node: &NodeId) -> bool {
        self.node_id == node.as_str()
    }
}

// =============================================================================
// Background Work Summaries
// =============================================================================

/// Result of one janitor cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    /// Minimum local revision across the cluster, `None` when no node has
    /// registered yet (nothing is deleted then).
    pub min_revision: Option<i64>,
    /// Journal rows deleted below `min_revision`.
    pub records_deleted: usize,
}

/// Result of one [`Journal::sync`](crate::Journal::sync) pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Records read from the journal.
    pub records_read: usize,
    /// Records handed to a consumer.
    pub records_applied: usize,
    /// Records skipped because this node produced them.
    pub records_skipped_local: usize,
    /// Local revision after the pass.
    pub revision: i64,
}
