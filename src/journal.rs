//! # Journal
//!
//! [`Journal`] is the entry point: one instance per cluster node, shared by
//! every thread of that node (wrap it in an `Arc`).
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                             Journal                              │
//! │                                                                  │
//! │  LockManager ── RecordAppender      RecordReader ── sync()       │
//! │       │                                  │            │          │
//! │       │            RevisionStore ────────┤   ConsumerRegistry    │
//! │       ▼                 ▼                ▼                       │
//! │  ┌────────────────────────────────────────────┐    Janitor       │
//! │  │             ConnectionManager              │◄───(own thread)  │
//! │  └────────────────────────────────────────────┘                  │
//! └────────────────────────────────┬─────────────────────────────────┘
//!                                  ▼
//!                        shared SQLite database
//! ```
//!
//! ## Writing
//!
//! ```rust,no_run
//! use cluster_journal::{Journal, JournalConfig};
//!
//! let journal = Journal::open(JournalConfig::new("node-a", "sqlite:/tmp/cluster.db"))?;
//! let revision = journal.append_batch("items", vec![b"add /a".to_vec(), b"add /b".to_vec()])?;
//! # let _ = revision;
//! # Ok::<(), cluster_journal::Error>(())
//! ```
//!
//! `append_batch` takes the lock, catches up with records from other nodes,
//! appends, commits and checkpoints. The lower-level `lock` / `append` /
//! `unlock` calls are available for callers that need to interleave their own
//! work with the batch.
//!
//! ## Reading
//!
//! Register a [`RecordConsumer`] per subsystem and call [`Journal::sync`]
//! periodically, or iterate [`Journal::records`] directly.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{ConnectionDriver, JournalConfig, GENERIC_DIALECT_TAG};
use crate::connection::{
    lock_unpoisoned, ConnectionManager, ConnectionProvider, Credentials, DataSourceDirectory,
    DirectoryConnectionProvider, UrlConnectionProvider,
};
use crate::consumer::{ConsumerRegistry, RecordConsumer};
use crate::dialect::{dialect_for, SqlDialect};
use crate::error::{Error, Result};
use crate::janitor::{clean_journal, Janitor};
use crate::lock::{LockManager, UnlockOutcome};
use crate::record::{RecordAppender, RecordIterator, RecordReader};
use crate::revision::{LegacyRevisionFile, LegacyRevisionSource, RevisionStore};
use crate::schema::{ensure_schema, Statements, TableNames};
use crate::types::{CleanupStats, JournalRecord, NodeId, SyncStats, REVISION_NONE};

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`Journal`] from configuration plus optional collaborators.
///
/// Anything not supplied explicitly is derived from the configuration.
pub struct JournalBuilder {
    config: JournalConfig,
    provider: Option<Box<dyn ConnectionProvider>>,
    dialect: Option<Box<dyn SqlDialect>>,
    directory: Option<DataSourceDirectory>,
    legacy: Option<Box<dyn LegacyRevisionSource>>,
    initial_revision: i64,
    janitor_delay: Option<Duration>,
}

impl JournalBuilder {
    pub fn new(config: JournalConfig) -> Self {
        Self {
            config,
            provider: None,
            dialect: None,
            directory: None,
            legacy: None,
            initial_revision: 0,
            janitor_delay: None,
        }
    }

    /// Uses `provider` instead of the one implied by `driver` and `url`.
    pub fn connection_provider(mut self, provider: Box<dyn ConnectionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Uses `dialect` instead of the one selected by the dialect tag.
    pub fn dialect(mut self, dialect: Box<dyn SqlDialect>) -> Self {
        self.dialect = Some(dialect);
        self
    }

    /// Directory used to resolve `url` when `driver` is `directory`.
    pub fn directory(mut self, directory: DataSourceDirectory) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Legacy revision to seed a node that registers for the first time.
    pub fn legacy_revision(mut self, source: Box<dyn LegacyRevisionSource>) -> Self {
        self.legacy = Some(source);
        self
    }

    /// Local revision of a node registering for the first time, when there is
    /// no legacy revision. Defaults to 0 (replay the whole journal).
    pub fn initial_revision(mut self, revision: i64) -> Self {
        self.initial_revision = revision;
        self
    }

    /// Delay before the janitor's first run, overriding
    /// `janitor_first_run_hour`. Has no effect unless the janitor is enabled.
    pub fn janitor_delay(mut self, delay: Duration) -> Self {
        self.janitor_delay = Some(delay);
        self
    }

    /// Validates the configuration, connects, checks the schema, registers
    /// the node and starts the janitor if enabled.
    pub fn open(self) -> Result<Journal> {
        let JournalBuilder {
            config,
            provider,
            dialect,
            directory,
            legacy,
            initial_revision,
            janitor_delay,
        } = self;

        config.validate()?;
        let node_id = config.resolve_node_id()?;

        let provider = match provider {
            Some(provider) => provider,
            None => provider_from_config(&config, directory)?,
        };

        let tag = config
            .database_type
            .as_ref()
            .map(|t| t.to_ascii_lowercase())
            .or_else(|| provider.dialect_hint())
            .unwrap_or_else(|| GENERIC_DIALECT_TAG.to_string());
        let dialect = dialect.unwrap_or_else(|| dialect_for(&tag, &config));

        let tables = TableNames::new(dialect.as_ref(), &config.schema_object_prefix);
        let statements = Arc::new(Statements::new(&tables));
        let conns = Arc::new(ConnectionManager::new(
            provider,
            config.reconnect_delay(),
            config.lock_wait(),
        ));

        if config.schema_check_enabled {
            ensure_schema(&conns, dialect.as_ref(), &tables, &config.schema_object_prefix)?;
        } else {
            debug!("schema check disabled");
        }

        let locks = Arc::new(LockManager::new(
            Arc::clone(&conns),
            Arc::clone(&statements),
            config.nested_unlock_policy,
        ));

        let legacy = legacy.or_else(|| {
            config
                .legacy_revision_file
                .as_ref()
                .map(|path| Box::new(LegacyRevisionFile::new(path)) as Box<dyn LegacyRevisionSource>)
        });
        let revisions = RevisionStore::new(
            node_id.clone(),
            Arc::clone(&locks),
            Arc::clone(&statements),
            legacy,
        );
        let revision = revisions.init(initial_revision)?;

        let janitor = match (config.janitor_enabled, janitor_delay) {
            (false, _) => None,
            (true, Some(delay)) => Some(Janitor::start_with_delay(
                Arc::clone(&conns),
                Arc::clone(&statements),
                delay,
                config.janitor_sleep(),
            )?),
            (true, None) => Some(Janitor::start(
                Arc::clone(&conns),
                Arc::clone(&statements),
                config.janitor_first_run_hour,
                config.janitor_sleep(),
            )?),
        };

        info!(
            node_id = %node_id,
            dialect = dialect.tag(),
            database = %conns.provider().describe(),
            revision,
            janitor = janitor.is_some(),
            "journal opened"
        );

        Ok(Journal {
            appender: RecordAppender::new(node_id.clone(), Arc::clone(&locks), Arc::clone(&statements)),
            reader: RecordReader::new(Arc::clone(&locks), Arc::clone(&statements), config.page_size),
            node_id,
            dialect_tag: dialect.tag().to_string(),
            tables,
            statements,
            conns,
            locks,
            revisions,
            consumers: ConsumerRegistry::new(),
            janitor: Mutex::new(janitor),
            config,
        })
    }
}

fn provider_from_config(
    config: &JournalConfig,
    directory: Option<DataSourceDirectory>,
) -> Result<Box<dyn ConnectionProvider>> {
    let credentials = Credentials {
        user: config.user.clone(),
        password: config.password.clone(),
    };
    match config.driver {
        ConnectionDriver::Url => Ok(Box::new(UrlConnectionProvider::new(
            config.url.clone(),
            credentials,
        )?)),
        ConnectionDriver::Directory => {
            let directory = directory.ok_or_else(|| {
                Error::Configuration(
                    "driver 'directory' requires a data source directory".to_string(),
                )
            })?;
            if directory.lookup(&config.url).is_none() {
                return Err(Error::Configuration(format!(
                    "data source '{}' is not bound",
                    config.url
                )));
            }
            Ok(Box::new(DirectoryConnectionProvider::new(
                config.url.clone(),
                directory,
                credentials,
            )))
        }
    }
}

// =============================================================================
// Journal
// =============================================================================

/// One cluster node's view of the shared journal.
pub struct Journal {
    node_id: NodeId,
    dialect_tag: String,
    config: JournalConfig,
    tables: TableNames,
    statements: Arc<Statements>,
    conns: Arc<ConnectionManager>,
    locks: Arc<LockManager>,
    revisions: RevisionStore,
    appender: RecordAppender,
    reader: RecordReader,
    consumers: ConsumerRegistry,
    janitor: Mutex<Option<Janitor>>,
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Journal")
            .field("node_id", &self.node_id)
            .field("dialect", &self.dialect_tag)
            .field("tables", &self.tables)
            .field("revisions", &self.revisions)
            .field("consumers", &self.consumers)
            .finish()
    }
}

impl Journal {
    /// Opens the journal described by `config`.
    pub fn open(config: JournalConfig) -> Result<Self> {
        JournalBuilder::new(config).open()
    }

    pub fn builder(config: JournalConfig) -> JournalBuilder {
        JournalBuilder::new(config)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn dialect_tag(&self) -> &str {
        &self.dialect_tag
    }

    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.conns
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.locks
    }

    pub fn revision_store(&self) -> &RevisionStore {
        &self.revisions
    }

    // =========================================================================
    // Lock / Append
    // =========================================================================

    /// Acquires the cluster-wide lock. See [`LockManager::lock`].
    pub fn lock(&self) -> Result<i64> {
        self.locks.lock()
    }

    /// Revision of the lock held by the calling thread, if any.
    pub fn locked_revision(&self) -> Option<i64> {
        self.locks.locked_revision()
    }

    /// Releases one level of the lock. See [`LockManager::unlock`].
    pub fn unlock(&self, success: bool) -> Result<UnlockOutcome> {
        self.locks.unlock(success)
    }

    /// Acquires the lock, then applies every record other nodes committed
    /// before it, so the caller's changes are based on the latest state.
    ///
    /// On a sync failure the lock is released before the error is returned.
    pub fn lock_and_sync(&self) -> Result<i64> {
        let revision = self.locks.lock()?;
        if let Err(e) = self.sync_records(false) {
            if let Err(unlock_err) = self.locks.unlock(false) {
                warn!(error = %unlock_err, "unlock after failed sync also failed");
            }
            return Err(e);
        }
        Ok(revision)
    }

    /// Appends one record under the caller's lock.
    pub fn append(&self, producer_id: &str, payload: Vec<u8>) -> Result<JournalRecord> {
        self.appender.append(producer_id, payload)
    }

    /// Appends one record as its own batch. Returns its revision.
    pub fn append_one(&self, producer_id: &str, payload: Vec<u8>) -> Result<i64> {
        self.append_batch(producer_id, std::iter::once(payload))
    }

    /// Appends `payloads` under a single lock, so they share one revision.
    ///
    /// After the commit this node's local revision moves to the new revision:
    /// the lock guaranteed nothing else committed in between, and the sync
    /// under the lock consumed everything before it.
    pub fn append_batch(
        &self,
        producer_id: &str,
        payloads: impl IntoIterator<Item = Vec<u8>>,
    ) -> Result<i64> {
        let revision = self.lock_and_sync()?;

        let mut appended = Ok(());
        for payload in payloads {
            if let Err(e) = self.appender.append(producer_id, payload) {
                appended = Err(e);
                break;
            }
        }

        let unlocked = self.locks.unlock(appended.is_ok());
        appended?;
        match unlocked? {
            UnlockOutcome::Committed => {
                self.checkpoint(revision)?;
                Ok(revision)
            }
            UnlockOutcome::RolledBack => Err(Error::Consistency(format!(
                "batch at revision {revision} was rolled back by an enclosing unlock(false)"
            ))),
            // The caller holds an outer lock; the outer unlock decides.
            UnlockOutcome::Nested => Ok(revision),
        }
    }

    // =========================================================================
    // Replay
    // =========================================================================

    /// Records with `revision > after`, ascending. See [`RecordReader::records`].
    pub fn records(&self, after: i64) -> Result<RecordIterator> {
        self.reader.records(after)
    }

    /// The whole journal, ascending.
    pub fn records_all(&self) -> Result<RecordIterator> {
        self.reader.records(REVISION_NONE)
    }

    /// Registers a consumer, starting from the revision it reports or else
    /// this node's local revision.
    pub fn register(&self, consumer: Arc<dyn RecordConsumer>) -> Result<()> {
        let revision = match consumer.revision() {
            Some(revision) => revision,
            None => self.revisions.get()?,
        };
        self.consumers.register(consumer, revision)
    }

    pub fn unregister(&self, consumer_id: &str) -> bool {
        self.consumers.unregister(consumer_id)
    }

    pub fn consumers(&self) -> &ConsumerRegistry {
        &self.consumers
    }

    /// Applies records from other nodes to the registered consumers and
    /// checkpoints the local revision.
    ///
    /// Called by the lock holder, the records are applied but the checkpoint
    /// is left for after the lock is released.
    pub fn sync(&self) -> Result<SyncStats> {
        self.sync_records(true)
    }

    fn sync_records(&self, checkpoint: bool) -> Result<SyncStats> {
        let local = self.revisions.get()?;
        let start = self
            .consumers
            .min_revision()
            .map_or(local, |min| min.min(local));

        let mut stats = SyncStats {
            revision: local,
            ..SyncStats::default()
        };
        // Consumers advance only once every record of a revision was read,
        // since one lock can produce several records with the same revision.
        // Every consumer advances, so idle ones do not pin the next start.
        let mut current: Option<i64> = None;

        for record in self.reader.records(start)? {
            let record = record?;
            if current != Some(record.revision) {
                if let Some(revision) = current {
                    self.consumers.advance_all(revision);
                }
                current = Some(record.revision);
            }

            stats.records_read += 1;
            if record.is_from(&self.node_id) {
                stats.records_skipped_local += 1;
                continue;
            }
            if self.consumers.dispatch(&record)?.is_some() {
                stats.records_applied += 1;
            }
        }

        if let Some(revision) = current {
            self.consumers.advance_all(revision);
            stats.revision = stats.revision.max(revision);
        }

        if checkpoint && stats.revision > local {
            if self.locks.is_held_by_current_thread() {
                // The batch may still roll back; the next sync or the
                // committing append_batch checkpoints instead.
                debug!(revision = stats.revision, "checkpoint deferred while holding the lock");
            } else {
                self.checkpoint(stats.revision)?;
            }
        }

        debug!(
            records_read = stats.records_read,
            records_applied = stats.records_applied,
            revision = stats.revision,
            "journal synchronized"
        );
        Ok(stats)
    }

    /// Persists the local revision, surfacing failures only when configured.
    fn checkpoint(&self, revision: i64) -> Result<()> {
        if self.config.surface_checkpoint_errors {
            self.revisions.try_set(revision)?;
        } else {
            self.revisions.set(revision);
        }
        if self.revisions.get()? == revision {
            self.consumers.notify_checkpoint(revision);
        }
        Ok(())
    }

    /// This node's local revision.
    pub fn local_revision(&self) -> Result<i64> {
        self.revisions.get()
    }

    /// Current value of the global revision counter.
    pub fn global_revision(&self) -> Result<i64> {
        self.revisions.global_revision()
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Runs one janitor cycle now.
    ///
    /// # Errors
    ///
    /// [`Error::Consistency`] when the calling thread holds the journal lock,
    /// since the cleanup transaction would wait on that lock's own batch.
    pub fn clean_journal(&self) -> Result<CleanupStats> {
        if self.locks.is_held_by_current_thread() {
            return Err(Error::Consistency(
                "clean_journal called while holding the journal lock".to_string(),
            ));
        }
        clean_journal(&self.conns, &self.statements)
    }

    pub fn janitor_running(&self) -> bool {
        lock_unpoisoned(&self.janitor)
            .as_ref()
            .is_some_and(Janitor::is_running)
    }

    /// Stops the janitor and closes all connections. Later operations fail
    /// with [`Error::InvalidState`]. Idempotent.
    pub fn close(&self) {
        if let Some(janitor) = lock_unpoisoned(&self.janitor).take() {
            janitor.stop();
        }
        if !self.conns.is_closed() {
            self.conns.close();
            info!(node_id = %self.node_id, "journal closed");
        }
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        self.close();
    }
}
