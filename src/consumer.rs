//! # Record Consumers
//!
//! A subsystem that needs to see changes made on other nodes implements
//! [`RecordConsumer`] and registers with the journal. During
//! [`Journal::sync`](crate::Journal::sync) every foreign record is handed to
//! the consumer whose id equals the record's producer id.
//!
//! The [`ConsumerRegistry`] remembers, per consumer, the last revision it has
//! fully applied. The registry lives in memory only; after a restart every
//! consumer starts again from the node's durable local revision.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::connection::lock_unpoisoned;
use crate::error::{Error, Result};
use crate::types::JournalRecord;

/// A subsystem replaying journal records produced on other nodes.
pub trait RecordConsumer: Send + Sync {
    /// Identifier matched against [`JournalRecord::producer_id`].
    fn id(&self) -> &str;

    /// Revision this consumer already applied from its own durable state.
    /// `None` starts it at the node's local revision.
    fn revision(&self) -> Option<i64> {
        None
    }

    /// Applies one record.
    ///
    /// Records arrive in journal order. After a failed sync, records of the
    /// revision that failed may be delivered again.
    fn consume(&self, record: &JournalRecord) -> Result<()>;

    /// Called after the node's local revision was checkpointed.
    fn set_revision(&self, _revision: i64) {}
}

struct Registration {
    consumer: Arc<dyn RecordConsumer>,
    last_seen: i64,
}

/// Registered consumers and the last revision each has applied.
#[derive(Default)]
pub struct ConsumerRegistry {
    registrations: Mutex<HashMap<String, Registration>>,
}

impl fmt::Debug for ConsumerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registrations = lock_unpoisoned(&self.registrations);
        let mut entries: Vec<(&String, i64)> = registrations
            .iter()
            .map(|(id, r)| (id, r.last_seen))
            .collect();
        entries.sort();
        f.debug_map().entries(entries).finish()
    }
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `consumer` as having applied everything up to `revision`.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] if a consumer with the same id is registered.
    pub fn register(&self, consumer: Arc<dyn RecordConsumer>, revision: i64) -> Result<()> {
        let id = consumer.id().to_string();
        let mut registrations = lock_unpoisoned(&self.registrations);
        if registrations.contains_key(&id) {
            return Err(Error::Configuration(format!(
                "record consumer '{id}' is already registered"
            )));
        }
        debug!(consumer = %id, revision, "record consumer registered");
        registrations.insert(
            id,
            Registration {
                consumer,
                last_seen: revision,
            },
        );
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> bool {
        lock_unpoisoned(&self.registrations).remove(id).is_some()
    }

    pub fn is_registered(&self, id: &str) -> bool {
        lock_unpoisoned(&self.registrations).contains_key(id)
    }

    pub fn last_seen(&self, id: &str) -> Option<i64> {
        lock_unpoisoned(&self.registrations)
            .get(id)
            .map(|r| r.last_seen)
    }

    /// Lowest `last_seen` over all consumers, `None` if none is registered.
    pub fn min_revision(&self) -> Option<i64> {
        lock_unpoisoned(&self.registrations)
            .values()
            .map(|r| r.last_seen)
            .min()
    }

    /// Hands `record` to its producer's consumer if that consumer has not
    /// seen the record's revision yet.
    ///
    /// Returns the consumer id when the record was applied. The registry lock
    /// is not held while the consumer runs.
    pub fn dispatch(&self, record: &JournalRecord) -> Result<Option<String>> {
        let consumer = {
            let registrations = lock_unpoisoned(&self.registrations);
            match registrations.get(&record.producer_id) {
                Some(r) if r.last_seen < record.revision => Arc::clone(&r.consumer),
                Some(_) => return Ok(None),
                None => {
                    debug!(
                        producer = %record.producer_id,
                        revision = record.revision,
                        "no consumer for record"
                    );
                    return Ok(None);
                }
            }
        };

        consumer.consume(record)?;
        Ok(Some(record.producer_id.clone()))
    }

    /// Marks `revision` as fully applied by consumer `id`. Never moves a
    /// consumer backwards.
    pub fn advance(&self, id: &str, revision: i64) {
        if let Some(r) = lock_unpoisoned(&self.registrations).get_mut(id) {
            r.last_seen = r.last_seen.max(revision);
        }
    }

    /// Marks `revision` as fully read for every consumer, including those
    /// that had nothing to apply in it.
    pub fn advance_all(&self, revision: i64) {
        for r in lock_unpoisoned(&self.registrations).values_mut() {
            r.last_seen = r.last_seen.max(revision);
        }
    }

    /// Tells every consumer the local revision was checkpointed.
    pub fn notify_checkpoint(&self, revision: i64) {
        let consumers: Vec<Arc<dyn RecordConsumer>> = lock_unpoisoned(&self.registrations)
            .values()
            .map(|r| Arc::clone(&r.consumer))
            .collect();
        for consumer in consumers {
            consumer.set_revision(revision);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collecting {
        seen: Mutex<Vec<i64>>,
    }

    impl RecordConsumer for Collecting {
        fn id(&self) -> &str {
            "items"
        }

        fn consume(&self, record: &JournalRecord) -> Result<()> {
            lock_unpoisoned(&self.seen).push(record.revision);
            Ok(())
        }
    }

    fn record(revision: i64, producer: &str) -> JournalRecord {
        JournalRecord {
            revision,
            node_id: "other".to_string(),
            producer_id: producer.to_string(),
            payload: Vec::new(),
        }
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = ConsumerRegistry::new();
        registry.register(Arc::new(Collecting::default()), 0).unwrap();
        assert!(matches!(
            registry.register(Arc::new(Collecting::default()), 0),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_dispatch_respects_last_seen() {
        let registry = ConsumerRegistry::new();
        let consumer = Arc::new(Collecting::default());
        registry.register(consumer.clone(), 3).unwrap();

        assert_eq!(registry.dispatch(&record(3, "items")).unwrap(), None);
        assert_eq!(
            registry.dispatch(&record(4, "items")).unwrap().as_deref(),
            Some("items")
        );
        assert_eq!(registry.dispatch(&record(5, "unknown")).unwrap(), None);
        assert_eq!(*lock_unpoisoned(&consumer.seen), vec![4]);
    }

    #[test]
    fn test_advance_is_monotonic() {
        let registry = ConsumerRegistry::new();
        registry.register(Arc::new(Collecting::default()), 5).unwrap();

        registry.advance("items", 3);
        assert_eq!(registry.last_seen("items"), Some(5));
        registry.advance("items", 8);
        assert_eq!(registry.min_revision(), Some(8));

        assert!(registry.unregister("items"));
        assert_eq!(registry.min_revision(), None);
    }

    #[test]
    fn test_advance_all_moves_idle_consumers() {
        let registry = ConsumerRegistry::new();
        registry.register(Arc::new(Collecting::default()), 2).unwrap();

        registry.advance_all(6);
        assert_eq!(registry.last_seen("items"), Some(6));
        registry.advance_all(4);
        assert_eq!(registry.min_revision(), Some(6));
    }
}
