//! # Journal Configuration
//!
//! [`JournalConfig`] carries every knob an operator can turn: how to reach the
//! database, which SQL dialect to assume, reconnect behaviour, and the janitor
//! schedule. It deserializes from JSON with `serde`, filling unspecified keys
//! with defaults, and is checked once by [`JournalConfig::validate`] before the
//! journal touches the database.
//!
//! ```json
//! {
//!   "node_id": "node-a",
//!   "url": "sqlite:/var/lib/repo/cluster.db",
//!   "schema_object_prefix": "repo_",
//!   "janitor_enabled": true,
//!   "janitor_first_run_hour": 2
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::NodeId;

// =============================================================================
// Defaults
// =============================================================================

/// Delay before reconnecting after a failed database operation.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 10_000;

/// How long a node waits for another node's lock. Effectively unbounded.
pub const DEFAULT_LOCK_WAIT_MS: u64 = i32::MAX as u64;

/// Janitor interval between cleanup cycles (one day).
pub const DEFAULT_JANITOR_SLEEP_SECS: u64 = 24 * 60 * 60;

/// Local hour of day at which the janitor runs for the first time.
pub const DEFAULT_JANITOR_FIRST_RUN_HOUR: u32 = 3;

/// Number of records fetched per round trip by the record reader.
pub const DEFAULT_PAGE_SIZE: usize = 256;

/// Dialect tag used when nothing more specific is known.
pub const GENERIC_DIALECT_TAG: &str = "default";

const fn default_reconnect_delay_ms() -> u64 {
    DEFAULT_RECONNECT_DELAY_MS
}

const fn default_lock_wait_ms() -> u64 {
    DEFAULT_LOCK_WAIT_MS
}

const fn default_janitor_sleep_secs() -> u64 {
    DEFAULT_JANITOR_SLEEP_SECS
}

const fn default_janitor_first_run_hour() -> u32 {
    DEFAULT_JANITOR_FIRST_RUN_HOUR
}

const fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

const fn default_true() -> bool {
    true
}

// =============================================================================
// Enumerated Settings
// =============================================================================

/// How the journal obtains its database connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionDriver {
    /// `url` is a connection string opened directly.
    #[default]
    Url,
    /// `url` is the name of a data source registered in a
    /// [`DataSourceDirectory`](crate::connection::DataSourceDirectory).
    Directory,
}

/// What the outermost `unlock` does when a nested `unlock` reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NestedUnlockPolicy {
    /// Any `unlock(false)` at any depth marks the batch rollback-only.
    #[default]
    RollbackOnAnyFailure,
    /// Only the flag passed to the outermost `unlock` counts.
    OutermostDecides,
}

// =============================================================================
// JournalConfig
// =============================================================================

/// Configuration for one cluster node's journal.
///
/// # Invariants
///
/// After [`validate`](Self::validate) succeeds:
/// - `url` is non-empty
/// - `janitor_sleep_secs` and `page_size` are greater than zero
/// - `janitor_first_run_hour` is in `0..=23`
/// - `schema_object_prefix` and `tablespace` contain only `[A-Za-z0-9_]`,
///   since both are substituted textually into DDL and queries
#[derive(Debug, Clone, Deserialize)]
pub struct JournalConfig {
    /// Explicit node identifier.
    #[serde(default)]
    pub node_id: Option<String>,

    /// File holding a generated node id, used when `node_id` is absent.
    #[serde(default)]
    pub node_id_file: Option<PathBuf>,

    /// Connection acquisition strategy.
    #[serde(default)]
    pub driver: ConnectionDriver,

    /// Connection string, or data source name for [`ConnectionDriver::Directory`].
    #[serde(default)]
    pub url: String,

    /// Explicit dialect tag. Derived from the connection string when absent.
    #[serde(default)]
    pub database_type: Option<String>,

    /// Prefix prepended to every table name.
    #[serde(default)]
    pub schema_object_prefix: String,

    /// Database user, passed to the connection provider.
    #[serde(default)]
    pub user: Option<String>,

    /// Database password, passed to the connection provider.
    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Maximum wait for a row lock held by another node.
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,

    /// Check for (and create) the journal tables at startup.
    #[serde(default = "default_true")]
    pub schema_check_enabled: bool,

    #[serde(default)]
    pub janitor_enabled: bool,

    #[serde(default = "default_janitor_sleep_secs")]
    pub janitor_sleep_secs: u64,

    #[serde(default = "default_janitor_first_run_hour")]
    pub janitor_first_run_hour: u32,

    /// Vendor extension substituted for `${tablespace}` in DDL scripts.
    #[serde(default)]
    pub tablespace: Option<String>,

    /// Pre-cluster revision file used to seed this node's local revision.
    #[serde(default)]
    pub legacy_revision_file: Option<PathBuf>,

    #[serde(default = "default_page_size")]
    pub page_size: usize,

    #[serde(default)]
    pub nested_unlock_policy: NestedUnlockPolicy,

    /// Propagate checkpoint failures from [`Journal::sync`](crate::Journal::sync)
    /// instead of logging them.
    #[serde(default)]
    pub surface_checkpoint_errors: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            node_id_file: None,
            driver: ConnectionDriver::default(),
            url: String::new(),
            database_type: None,
            schema_object_prefix: String::new(),
            user: None,
            password: None,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            lock_wait_ms: DEFAULT_LOCK_WAIT_MS,
            schema_check_enabled: true,
            janitor_enabled: false,
            janitor_sleep_secs: DEFAULT_JANITOR_SLEEP_SECS,
            janitor_first_run_hour: DEFAULT_JANITOR_FIRST_RUN_HOUR,
            tablespace: None,
            legacy_revision_file: None,
            page_size: DEFAULT_PAGE_SIZE,
            nested_unlock_policy: NestedUnlockPolicy::default(),
            surface_checkpoint_errors: false,
        }
    }
}

impl JournalConfig {
    /// Creates a configuration for `node_id` connecting directly to `url`.
    pub fn new(node_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            url: url.into(),
            ..Self::default()
        }
    }

    /// Parses a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Checks required settings and value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::Configuration("url is required".to_string()));
        }
        if let Some(id) = &self.node_id {
            if id.trim().is_empty() {
                return Err(Error::Configuration("node_id must not be empty".to_string()));
            }
        }
        if self.janitor_sleep_secs == 0 {
            return Err(Error::Configuration(
                "janitor_sleep_secs must be greater than zero".to_string(),
            ));
        }
        if self.janitor_first_run_hour > 23 {
            return Err(Error::Configuration(format!(
                "janitor_first_run_hour must be between 0 and 23, got {}",
                self.janitor_first_run_hour
            )));
        }
        if self.page_size == 0 {
            return Err(Error::Configuration(
                "page_size must be greater than zero".to_string(),
            ));
        }
        check_identifier_fragment("schema_object_prefix", &self.schema_object_prefix)?;
        if let Some(tablespace) = &self.tablespace {
            check_identifier_fragment("tablespace", tablespace)?;
        }
        if let Some(tag) = &self.database_type {
            if tag.trim().is_empty() {
                return Err(Error::Configuration(
                    "database_type must not be empty when set".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Lock wait as a busy timeout; SQLite takes milliseconds as an `i32`.
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms.min(i32::MAX as u64))
    }

    pub fn janitor_sleep(&self) -> Duration {
        Duration::from_secs(self.janitor_sleep_secs)
    }

    /// Determines this node's id.
    ///
    /// Order: explicit `node_id`, then the contents of `node_id_file`, then a
    /// freshly generated id (written to `node_id_file` when one is configured,
    /// so the node keeps its local revision across restarts).
    pub fn resolve_node_id(&self) -> Result<NodeId> {
        if let Some(id) = &self.node_id {
            return NodeId::new(id.trim());
        }

        if let Some(path) = &self.node_id_file {
            if path.exists() {
                let text = std::fs::read_to_string(path)?;
                return NodeId::new(text.trim()).map_err(|_| {
                    Error::Configuration(format!("node id file {} is empty", path.display()))
                });
            }

            let id = generate_node_id();
            std::fs::write(path, id.as_str())?;
            info!(node_id = %id, file = %path.display(), "generated node id");
            return Ok(id);
        }

        let id = generate_node_id();
        info!(node_id = %id, "generated node id (not persisted)");
        Ok(id)
    }
}

/// Rejects anything but ASCII letters, digits and underscores.
fn check_identifier_fragment(name: &str, value: &str) -> Result<()> {
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "{name} may only contain letters, digits and '_', got '{value}'"
        )))
    }
}

/// Generates a random v4 UUID node id.
fn generate_node_id() -> NodeId {
    NodeId::from_trusted(Uuid::new_v4().to_string())
}

// =============================================================================
// Tests
// =============================================================================
