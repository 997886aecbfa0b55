//! # Connections
//!
//! How the journal reaches the shared database, and how it recovers when a
//! connection goes bad.
//!
//! ## Providers
//!
//! A [`ConnectionProvider`] opens new connections. Two strategies exist:
//!
//! - [`UrlConnectionProvider`]: the configured URL is opened directly
//! - [`DirectoryConnectionProvider`]: the configured name is looked up in a
//!   [`DataSourceDirectory`] supplied by the embedding application
//!
//! ## Slots
//!
//! The [`ConnectionManager`] keeps two connections ("slots"):
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      ConnectionManager                        │
//! │                                                               │
//! │   Slot::Batch                       Slot::Shared              │
//! │   ┌──────────────────────┐          ┌──────────────────────┐  │
//! │   │ owned by the thread  │          │ autocommit: readers, │  │
//! │   │ holding the journal  │          │ checkpoints, janitor │  │
//! │   │ lock, one open tx    │          │                      │  │
//! │   └──────────────────────┘          └──────────────────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Failure Handling
//!
//! Any SQL error drops the slot's connection, and with it every cached
//! prepared statement and any open transaction (SQLite rolls back on close).
//! The next use of the slot waits until `reconnect_delay` has passed since
//! the failure, then connects again. Each new connection gets a new
//! generation number so the lock manager can tell its transaction is gone.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::dialect::tag_from_url;
use crate::error::{Error, Result};

/// Prepared statements kept per connection.
const STATEMENT_CACHE_CAPACITY: usize = 32;

/// Locks a mutex, recovering the data if a panicking thread poisoned it.
///
/// The guarded values are plain bookkeeping that stays consistent between
/// statements, so a poisoned lock carries no torn state.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// ConnectionProvider
// =============================================================================

/// Strategy for opening a connection to the shared database.
pub trait ConnectionProvider: Send + Sync + fmt::Debug {
    /// Opens a new connection.
    fn connect(&self) -> Result<Connection>;

    /// Human-readable description for logs. Must not contain credentials.
    fn describe(&self) -> String;

    /// Dialect tag implied by the connection string, if any.
    fn dialect_hint(&self) -> Option<String> {
        None
    }
}

/// Database credentials. SQLite ignores them; other providers may not.
#[derive(Clone, Default)]
pub struct Credentials {
    pub user: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

// =============================================================================
// UrlConnectionProvider
// =============================================================================

/// Opens the database named by a connection string.
///
/// Accepted forms: `sqlite:<path>`, `sqlite://<path>` and a bare path.
#[derive(Debug, Clone)]
pub struct UrlConnectionProvider {
    url: String,
    path: PathBuf,
    credentials: Credentials,
}

impl UrlConnectionProvider {
    pub fn new(url: impl Into<String>, credentials: Credentials) -> Result<Self> {
        let url = url.into();
        let rest = match tag_from_url(&url) {
            Some(_) => url.split_once(':').map(|(_, rest)| rest).unwrap_or_default(),
            None => url.as_str(),
        };
        let rest = rest.strip_prefix("//").unwrap_or(rest);

        if rest.trim().is_empty() {
            return Err(Error::Configuration(format!(
                "connection url '{url}' does not name a database"
            )));
        }
        if rest == ":memory:" {
            return Err(Error::Configuration(
                "in-memory databases cannot be shared between cluster nodes".to_string(),
            ));
        }

        Ok(Self {
            path: PathBuf::from(rest),
            url,
            credentials,
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl ConnectionProvider for UrlConnectionProvider {
    fn connect(&self) -> Result<Connection> {
        if self.credentials.user.is_some() {
            debug!(url = %self.url, "sqlite ignores connection credentials");
        }
        Connection::open(&self.path).map_err(|e| Error::connectivity("connect", e))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }

    fn dialect_hint(&self) -> Option<String> {
        tag_from_url(&self.url)
    }
}

// =============================================================================
// Directory Lookup
// =============================================================================

/// Registry of named data sources, shared by everything in the process that
/// needs a database by name.
///
/// Cloning is cheap; clones see the same entries.
#[derive(Debug, Clone, Default)]
pub struct DataSourceDirectory {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl DataSourceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `name` to a connection URL, replacing any previous binding.
    pub fn bind(&self, name: impl Into<String>, url: impl Into<String>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(name.into(), url.into());
    }

    pub fn unbind(&self, name: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(name).is_some()
    }

    pub fn lookup(&self, name: &str) -> Option<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(name).cloned()
    }
}

/// Resolves a data source name on every connect, so rebinding the name
/// redirects the journal at its next reconnect.
#[derive(Debug, Clone)]
pub struct DirectoryConnectionProvider {
    name: String,
    directory: DataSourceDirectory,
    credentials: Credentials,
}

impl DirectoryConnectionProvider {
    pub fn new(
        name: impl Into<String>,
        directory: DataSourceDirectory,
        credentials: Credentials,
    ) -> Self {
        Self {
            name: name.into(),
            directory,
            credentials,
        }
    }

    fn resolve(&self) -> Result<UrlConnectionProvider> {
        let url = self.directory.lookup(&self.name).ok_or_else(|| {
            Error::Configuration(format!("data source '{}' is not bound", self.name))
        })?;
        UrlConnectionProvider::new(url, self.credentials.clone())
    }
}

impl ConnectionProvider for DirectoryConnectionProvider {
    fn connect(&self) -> Result<Connection> {
        self.resolve()?.connect()
    }

    fn describe(&self) -> String {
        format!("directory:{}", self.name)
    }

    fn dialect_hint(&self) -> Option<String> {
        self.directory
            .lookup(&self.name)
            .and_then(|url| tag_from_url(&url))
    }
}

// =============================================================================
// ConnectionManager
// =============================================================================

/// Which of the manager's connections an operation runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Transaction connection of the journal lock holder.
    Batch,
    /// Autocommit connection for everything else.
    Shared,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Batch => write!(f, "batch"),
            Slot::Shared => write!(f, "shared"),
        }
    }
}

#[derive(Default)]
struct SlotState {
    conn: Option<Connection>,
    generation: u64,
    last_failure: Option<Instant>,
}

/// Owns the journal's connections and reconnects them after failures.
pub struct ConnectionManager {
    provider: Box<dyn ConnectionProvider>,
    reconnect_delay: Duration,
    lock_wait: Duration,
    batch: Mutex<SlotState>,
    shared: Mutex<SlotState>,
    closed: AtomicBool,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("provider", &self.provider.describe())
            .field("reconnect_delay", &self.reconnect_delay)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl ConnectionManager {
    /// Creates a manager. No connection is opened until first use.
    ///
    /// `lock_wait` becomes the SQLite busy timeout: how long a statement waits
    /// for another node's write lock before failing.
    pub fn new(
        provider: Box<dyn ConnectionProvider>,
        reconnect_delay: Duration,
        lock_wait: Duration,
    ) -> Self {
        Self {
            provider,
            reconnect_delay,
            lock_wait,
            batch: Mutex::new(SlotState::default()),
            shared: Mutex::new(SlotState::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn provider(&self) -> &dyn ConnectionProvider {
        self.provider.as_ref()
    }

    fn slot(&self, slot: Slot) -> MutexGuard<'_, SlotState> {
        match slot {
            Slot::Batch => lock_unpoisoned(&self.batch),
            Slot::Shared => lock_unpoisoned(&self.shared),
        }
    }

    /// Runs `f` on the slot's connection, connecting first if necessary.
    ///
    /// On a SQL error the connection is torn down before the error is
    /// returned as [`Error::Connectivity`].
    pub fn with_connection<T>(
        &self,
        slot: Slot,
        operation: &'static str,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        self.ensure_open()?;
        let mut state = self.slot(slot);

        let conn = match state.conn.take() {
            Some(conn) => conn,
            None => self.reconnect(&mut state, slot)?,
        };

        self.run(&mut state, slot, conn, operation, f)
    }

    /// Runs `f` on the slot's connection only if it is still the connection
    /// of `generation`.
    ///
    /// Used inside a batch: if the connection that holds the transaction was
    /// lost, silently reconnecting would write outside the transaction.
    pub fn with_pinned<T>(
        &self,
        slot: Slot,
        generation: u64,
        operation: &'static str,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        self.ensure_open()?;
        let mut state = self.slot(slot);

        let conn = match state.conn.take() {
            Some(conn) if state.generation == generation => conn,
            other => {
                state.conn = other;
                return Err(Error::TransactionAborted {
                    operation,
                    generation,
                });
            }
        };

        self.run(&mut state, slot, conn, operation, f)
    }

    fn run<T>(
        &self,
        state: &mut SlotState,
        slot: Slot,
        conn: Connection,
        operation: &'static str,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        match f(&conn) {
            Ok(value) => {
                state.conn = Some(conn);
                Ok(value)
            }
            Err(e) => {
                // Dropping the connection discards its statement cache and
                // rolls back any open transaction.
                drop(conn);
                state.last_failure = Some(Instant::now());
                warn!(%slot, operation, error = %e, "database operation failed, connection discarded");
                Err(Error::connectivity(operation, e))
            }
        }
    }

    fn reconnect(&self, state: &mut SlotState, slot: Slot) -> Result<Connection> {
        if let Some(failed_at) = state.last_failure {
            let elapsed = failed_at.elapsed();
            if elapsed < self.reconnect_delay {
                let wait = self.reconnect_delay - elapsed;
                info!(%slot, wait_ms = wait.as_millis() as u64, "waiting before reconnect");
                std::thread::sleep(wait);
            }
        }

        let conn = match self.provider.connect().and_then(|c| self.configure(c)) {
            Ok(conn) => conn,
            Err(e) => {
                state.last_failure = Some(Instant::now());
                return Err(e);
            }
        };

        state.generation += 1;
        state.last_failure = None;
        info!(
            %slot,
            generation = state.generation,
            database = %self.provider.describe(),
            "connected to journal database"
        );
        Ok(conn)
    }

    /// Applies per-connection settings.
    fn configure(&self, conn: Connection) -> Result<Connection> {
        let setup = || -> rusqlite::Result<()> {
            conn.busy_timeout(self.lock_wait)?;
            // WAL: readers never block the lock holder and vice versa.
            conn.execute_batch("PRAGMA journal_mode = WAL")?;
            conn.execute_batch("PRAGMA synchronous = FULL")?;
            Ok(())
        };
        setup().map_err(|e| Error::connectivity("configure connection", e))?;
        conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
        Ok(conn)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::InvalidState("journal connections are closed".to_string()));
        }
        Ok(())
    }

    /// Generation of the slot's current connection, `None` when disconnected.
    pub fn generation(&self, slot: Slot) -> Option<u64> {
        let state = self.slot(slot);
        state.conn.as_ref().map(|_| state.generation)
    }

    pub fn is_connected(&self, slot: Slot) -> bool {
        self.slot(slot).conn.is_some()
    }

    /// Drops the slot's connection without recording a failure, so the next
    /// use reconnects immediately.
    pub fn teardown(&self, slot: Slot) {
        if self.slot(slot).conn.take().is_some() {
            debug!(%slot, "connection torn down");
        }
    }

    /// Closes both connections. Later operations fail with
    /// [`Error::InvalidState`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.teardown(Slot::Batch);
        self.teardown(Slot::Shared);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &tempfile::TempDir, delay: Duration) -> ConnectionManager {
        let url = format!("sqlite:{}", dir.path().join("conn.db").display());
        let provider = UrlConnectionProvider::new(url, Credentials::default()).unwrap();
        ConnectionManager::new(Box::new(provider), delay, Duration::from_secs(5))
    }

    #[test]
    fn test_url_forms() {
        let p = UrlConnectionProvider::new("sqlite:/tmp/a.db", Credentials::default()).unwrap();
        assert_eq!(p.path(), std::path::Path::new("/tmp/a.db"));
        assert_eq!(p.dialect_hint().as_deref(), Some("sqlite"));

        let p = UrlConnectionProvider::new("sqlite:///tmp/a.db", Credentials::default()).unwrap();
        assert_eq!(p.path(), std::path::Path::new("/tmp/a.db"));

        let p = UrlConnectionProvider::new("/tmp/a.db", Credentials::default()).unwrap();
        assert_eq!(p.dialect_hint(), None);

        assert!(UrlConnectionProvider::new("sqlite:", Credentials::default()).is_err());
        assert!(UrlConnectionProvider::new("sqlite::memory:", Credentials::default()).is_err());
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials {
            user: Some("admin".to_string()),
            password: Some("secret".to_string()),
        };
        let printed = format!("{creds:?}");
        assert!(printed.contains("admin"));
        assert!(!printed.contains("secret"));
    }

    #[test]
    fn test_directory_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let directory = DataSourceDirectory::new();
        let provider =
            DirectoryConnectionProvider::new("cluster", directory.clone(), Credentials::default());

        assert!(matches!(provider.connect(), Err(Error::Configuration(_))));

        directory.bind(
            "cluster",
            format!("sqlite:{}", dir.path().join("d.db").display()),
        );
        assert!(provider.connect().is_ok());
        assert_eq!(provider.dialect_hint().as_deref(), Some("sqlite"));
        assert!(directory.unbind("cluster"));
    }

    #[test]
    fn test_failure_tears_down_and_reconnects_after_delay() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir, Duration::from_millis(100));

        manager
            .with_connection(Slot::Shared, "create", |c| c.execute_batch("CREATE TABLE t (x)"))
            .unwrap();
        let first = manager.generation(Slot::Shared).unwrap();

        let err = manager
            .with_connection(Slot::Shared, "bad", |c| c.execute_batch("SELECT * FROM missing"))
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(!manager.is_connected(Slot::Shared));

        let started = Instant::now();
        manager
            .with_connection(Slot::Shared, "insert", |c| c.execute("INSERT INTO t VALUES (1)", []))
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(90));
        assert_eq!(manager.generation(Slot::Shared), Some(first + 1));
    }

    #[test]
    fn test_pinned_rejects_new_generation() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir, Duration::ZERO);

        manager
            .with_connection(Slot::Batch, "open", |c| c.execute_batch("SELECT 1"))
            .unwrap();
        let generation = manager.generation(Slot::Batch).unwrap();
        manager
            .with_pinned(Slot::Batch, generation, "pinned", |c| c.execute_batch("SELECT 1"))
            .unwrap();

        manager.teardown(Slot::Batch);
        manager
            .with_connection(Slot::Batch, "reopen", |c| c.execute_batch("SELECT 1"))
            .unwrap();

        let err = manager
            .with_pinned(Slot::Batch, generation, "pinned", |c| c.execute_batch("SELECT 1"))
            .unwrap_err();
        assert!(matches!(err, Error::TransactionAborted { .. }));
        // The newer connection is left in place.
        assert!(manager.is_connected(Slot::Batch));
    }

    #[test]
    fn test_closed_manager_rejects_operations() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir, Duration::ZERO);
        manager.close();

        let err = manager
            .with_connection(Slot::Shared, "after close", |c| c.execute_batch("SELECT 1"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }
}
