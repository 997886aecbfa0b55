//! # Record Append and Replay
//!
//! [`RecordAppender`] writes records under the journal lock; [`RecordReader`]
//! hands out [`RecordIterator`]s that replay them in order.
//!
//! ## Shared Revisions
//!
//! Every record appended while one lock is held gets the lock's revision. A
//! save that touches several subsystems therefore lands as one revision
//! point, and a reader sees either all of it or none of it.
//!
//! ```text
//!   lock() -> 7
//!     append("items", ..)   ─┐
//!     append("locks", ..)    ├─ revision 7, rowid order
//!     append("items", ..)   ─┘
//!   unlock(true)
//! ```
//!
//! ## Reading
//!
//! An iterator captures the highest committed revision when it is created and
//! never reads past it. Pages are keyed on `(revision, rowid)`, so records
//! sharing a revision are neither skipped nor repeated at page boundaries.
//! Revisions are allocated and committed under the same database lock, so no
//! record at or below the captured bound can commit after the iterator was
//! created.

use std::collections::VecDeque;
use std::sync::Arc;

use rusqlite::params;
use tracing::debug;

use crate::error::{Error, Result};
use crate::lock::LockManager;
use crate::schema::Statements;
use crate::types::{JournalRecord, NodeId};

// =============================================================================
// Appender
// =============================================================================

/// Writes records stamped with the current lock's revision.
pub struct RecordAppender {
    node_id: NodeId,
    locks: Arc<LockManager>,
    statements: Arc<Statements>,
}

impl RecordAppender {
    pub fn new(node_id: NodeId, locks: Arc<LockManager>, statements: Arc<Statements>) -> Self {
        Self {
            node_id,
            locks,
            statements,
        }
    }

    /// Appends one record inside the caller's lock.
    ///
    /// # Errors
    ///
    /// - [`Error::Consistency`] if the calling thread does not hold the lock
    /// - [`Error::Connectivity`] / [`Error::TransactionAborted`] if the write
    ///   fails; the batch is lost and the caller must `unlock(false)`
    pub fn append(&self, producer_id: &str, payload: Vec<u8>) -> Result<JournalRecord> {
        let revision = self.locks.locked_revision().ok_or_else(|| {
            Error::Consistency("append requires the journal lock".to_string())
        })?;

        let node = self.node_id.as_str();
        self.locks.with_connection("append", |conn| {
            conn.prepare_cached(&self.statements.insert_record)?
                .execute(params![revision, node, producer_id, payload])
        })?;

        debug!(revision, producer_id, bytes = payload.len(), "record appended");
        Ok(JournalRecord {
            revision,
            node_id: node.to_string(),
            producer_id: producer_id.to_string(),
            payload,
        })
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Creates record iterators.
pub struct RecordReader {
    locks: Arc<LockManager>,
    statements: Arc<Statements>,
    page_size: usize,
}

impl RecordReader {
    pub fn new(locks: Arc<LockManager>, statements: Arc<Statements>, page_size: usize) -> Self {
        Self {
            locks,
            statements,
            page_size: page_size.max(1),
        }
    }

    /// Returns every record with `revision > after`, ascending, up to the
    /// latest revision committed now.
    pub fn records(&self, after: i64) -> Result<RecordIterator> {
        let upper: Option<i64> = self.locks.with_connection("read records", |conn| {
            conn.prepare_cached(&self.statements.select_max_revision)?
                .query_row([], |row| row.get(0))
        })?;

        let done = upper.map_or(true, |upper| upper <= after);
        Ok(RecordIterator {
            locks: Arc::clone(&self.locks),
            statements: Arc::clone(&self.statements),
            page_size: self.page_size,
            cursor: (after, i64::MAX),
            upper: upper.unwrap_or(after),
            buffer: VecDeque::new(),
            done,
        })
    }
}

/// Single-pass, forward-only cursor over journal records.
///
/// Yields `Err` at most once; iteration ends after an error. To continue,
/// open a new iterator after the last revision that was fully processed.
pub struct RecordIterator {
    locks: Arc<LockManager>,
    statements: Arc<Statements>,
    page_size: usize,
    /// `(revision, rowid)` of the last record fetched.
    cursor: (i64, i64),
    upper: i64,
    buffer: VecDeque<JournalRecord>,
    done: bool,
}

impl RecordIterator {
    /// Highest revision this iterator will return.
    pub fn upper_bound(&self) -> i64 {
        self.upper
    }

    fn fetch_page(&mut self) -> Result<()> {
        let (revision, rowid) = self.cursor;
        let limit = self.page_size as i64;
        let upper = self.upper;

        let rows: Vec<(i64, JournalRecord)> =
            self.locks.with_connection("read records", |conn| {
                let mut stmt = conn.prepare_cached(&self.statements.select_records_page)?;
                let rows = stmt.query_map(params![revision, rowid, upper, limit], |row| {
                    Ok((
                        row.get(0)?,
                        JournalRecord {
                            revision: row.get(1)?,
                            node_id: row.get(2)?,
                            producer_id: row.get(3)?,
                            payload: row.get(4)?,
                        },
                    ))
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })?;

        if rows.len() < self.page_size {
            self.done = true;
        }
        if let Some((rowid, record)) = rows.last() {
            self.cursor = (record.revision, *rowid);
        }
        self.buffer.extend(rows.into_iter().map(|(_, record)| record));
        Ok(())
    }
}

impl Iterator for RecordIterator {
    type Item = Result<JournalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Some(Ok(record));
            }
            if self.done {
                return None;
            }
            if let Err(e) = self.fetch_page() {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::NestedUnlockPolicy;
    use crate::connection::{ConnectionManager, Credentials, UrlConnectionProvider};
    use crate::dialect::SqliteDialect;
    use crate::schema::{ensure_schema, TableNames};

    struct Fixture {
        _dir: tempfile::TempDir,
        locks: Arc<LockManager>,
        appender: RecordAppender,
        statements: Arc<Statements>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("records.db").display());
        let provider = UrlConnectionProvider::new(url, Credentials::default()).unwrap();
        let conns = Arc::new(ConnectionManager::new(
            Box::new(provider),
            Duration::ZERO,
            Duration::from_secs(10),
        ));
        let tables = TableNames::new(&SqliteDialect, "");
        ensure_schema(&conns, &SqliteDialect, &tables, "").unwrap();
        let statements = Arc::new(Statements::new(&tables));
        let locks = Arc::new(LockManager::new(
            conns,
            statements.clone(),
            NestedUnlockPolicy::default(),
        ));
        let appender = RecordAppender::new(
            NodeId::new("node-a").unwrap(),
            locks.clone(),
            statements.clone(),
        );
        Fixture {
            _dir: dir,
            locks,
            appender,
            statements,
        }
    }

    #[test]
    fn test_append_without_lock_fails() {
        let f = fixture();
        let err = f.appender.append("items", b"x".to_vec()).unwrap_err();
        assert!(matches!(err, Error::Consistency(_)));
    }

    #[test]
    fn test_records_share_lock_revision_and_keep_order() {
        let f = fixture();

        let revision = f.locks.lock().unwrap();
        for i in 0..5u8 {
            let record = f.appender.append("items", vec![i]).unwrap();
            assert_eq!(record.revision, revision);
        }
        f.locks.unlock(true).unwrap();

        // Page size 2 splits the shared revision across three pages.
        let reader = RecordReader::new(f.locks.clone(), f.statements.clone(), 2);
        let payloads: Vec<Vec<u8>> = reader
            .records(0)
            .unwrap()
            .map(|r| r.unwrap().payload)
            .collect();
        assert_eq!(payloads, vec![vec![0], vec![1], vec![2], vec![3], vec![4]]);
    }

    #[test]
    fn test_reader_stops_at_bound_captured_at_creation() {
        let f = fixture();
        let reader = RecordReader::new(f.locks.clone(), f.statements.clone(), 1);

        f.locks.lock().unwrap();
        f.appender.append("items", b"first".to_vec()).unwrap();
        f.locks.unlock(true).unwrap();

        let mut iter = reader.records(i64::MIN).unwrap();
        assert_eq!(iter.upper_bound(), 1);

        f.locks.lock().unwrap();
        f.appender.append("items", b"second".to_vec()).unwrap();
        f.locks.unlock(true).unwrap();

        assert_eq!(iter.next().unwrap().unwrap().payload, b"first".to_vec());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_empty_journal_yields_nothing() {
        let f = fixture();
        let reader = RecordReader::new(f.locks.clone(), f.statements.clone(), 8);
        assert_eq!(reader.records(i64::MIN).unwrap().count(), 0);
    }
}
