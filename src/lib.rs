//! # Cluster Journal
//!
//! A journal shared by the nodes of a cluster through one SQL database. Every
//! node appends records describing its changes; every node replays the records
//! of the others, in the same total order, to keep its caches and indexes in
//! step.
//!
//! - **Total order**: a cluster-wide lock hands out strictly increasing
//!   revisions in commit order
//! - **Batching**: every record appended under one lock shares its revision
//! - **Durable checkpoints**: each node stores the revision it has consumed
//! - **Cleanup**: a janitor deletes records every node has consumed
//!
//! ## Architecture Overview
//!
//! ```text
//!     node A                                        node B
//! ┌──────────────┐                              ┌──────────────┐
//! │   Journal    │                              │   Journal    │
//! │ lock/append  │                              │ lock/append  │
//! │ records/sync │                              │ records/sync │
//! └──────┬───────┘                              └──────┬───────┘
//!        │                                             │
//!        ▼                                             ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      shared database                            │
//! │                                                                 │
//! │  global_revision   journal(revision, node, producer, payload)   │
//! │  local_revisions(node_id, revision)                             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Total order**: two committed batches never share a revision, and a
//!    batch that commits later has a higher revision
//! 2. **Atomic batches**: a reader sees all records of a revision or none
//! 3. **Lossless replay**: `records(r)` returns every record above `r` that
//!    has not been cleaned
//! 4. **Safe cleanup**: no record at or above any node's local revision is
//!    ever deleted
//! 5. **Checkpoint never leads**: a node's local revision never passes
//!    records it has not consumed
//!
//! ## Module Organization
//!
//! - [`error`]: Error type for every failure mode
//! - [`config`]: Serde-backed configuration
//! - [`types`]: Domain types (NodeId, JournalRecord, stats)
//! - [`dialect`]: Per-database identifier rules and DDL placeholders
//! - [`schema`]: DDL scripts, table names and SQL statements
//! - [`connection`]: Connection providers and the reconnecting manager
//! - [`lock`]: Cluster-wide reentrant lock
//! - [`record`]: Record appender and paginated reader
//! - [`revision`]: Per-node local revision and legacy migration
//! - [`consumer`]: Record consumers and their registry
//! - [`janitor`]: Scheduled journal cleanup
//! - [`journal`]: The [`Journal`] facade (main entry point)

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for journal operations.
pub mod error;

/// Journal configuration.
///
/// Loaded from JSON or built in code; validated once when the journal opens.
pub mod config;

/// Domain types shared across modules.
pub mod types;

/// SQL dialects.
///
/// A dialect decides identifier case and fills the placeholders of the DDL
/// scripts. SQLite keeps names as written; the generic dialect upper-cases
/// them.
pub mod dialect;

/// Schema scripts and prepared statement text.
pub mod schema;

/// Database connections.
///
/// A [`ConnectionProvider`](connection::ConnectionProvider) opens connections;
/// the [`ConnectionManager`](connection::ConnectionManager) keeps one for the
/// lock holder's batch and one for everything else, and reconnects after
/// failures.
pub mod connection;

/// Cluster-wide journal lock.
pub mod lock;

/// Appending and replaying records.
pub mod record;

/// Local revision bookkeeping.
pub mod revision;

/// Record consumers.
pub mod consumer;

/// Background cleanup of consumed records.
pub mod janitor;

/// The journal facade.
///
/// The main entry point is [`Journal`](journal::Journal).
pub mod journal;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{ConnectionDriver, JournalConfig, NestedUnlockPolicy};
pub use connection::{
    ConnectionManager, ConnectionProvider, Credentials, DataSourceDirectory,
    DirectoryConnectionProvider, Slot, UrlConnectionProvider,
};
pub use consumer::{ConsumerRegistry, RecordConsumer};
pub use dialect::{GenericDialect, SqlDialect, SqliteDialect};
pub use error::{Error, Result};
pub use janitor::Janitor;
pub use journal::{Journal, JournalBuilder};
pub use lock::UnlockOutcome;
pub use record::RecordIterator;
pub use revision::{LegacyRevisionFile, LegacyRevisionSource, RevisionStore};
pub use types::{CleanupStats, JournalRecord, NodeId, SyncStats, REVISION_NONE};
