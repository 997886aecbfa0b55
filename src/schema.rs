//! # Journal Schema
//!
//! Three tables make up the journal. All nodes share them.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                          Schema Overview                           │
//! ├────────────────────────────────────────────────────────────────────┤
//! │                                                                    │
//! │  journal                 global_revision       local_revisions     │
//! │  ┌──────────────┐        ┌──────────────┐      ┌──────────────┐    │
//! │  │ revision     │◄───────│ revision     │      │ node_id (PK) │    │
//! │  │ node_id      │ stamps │ (one row)    │      │ revision     │    │
//! │  │ producer_id  │        └──────────────┘      └──────┬───────┘    │
//! │  │ payload BLOB │                                     │            │
//! │  └──────────────┘◄────────────────────────────────────┘            │
//! │                      janitor deletes below MIN(revision)           │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## DDL Scripts
//!
//! Scripts are keyed by dialect tag with a generic fallback. They contain
//! `${schema_object_prefix}` (and possibly vendor placeholders) that the
//! [`SqlDialect`] substitutes before execution. Statements are separated by
//! `;`.
//!
//! The local revision table has its own script so a database created before
//! nodes tracked local revisions can be upgraded in place.

use rusqlite::Connection;
use tracing::info;

use crate::connection::{ConnectionManager, Slot};
use crate::dialect::SqlDialect;
use crate::error::{Error, Result};

// =============================================================================
// DDL Scripts
// =============================================================================

/// Journal and global counter tables, SQLite dialect.
///
/// The counter is seeded with 0 so the first lock allocates revision 1.
/// The journal has no primary key: records written under one lock share a
/// revision. Order within a revision is the implicit rowid.
const SQLITE_JOURNAL_DDL: &str = r#"
CREATE TABLE ${schema_object_prefix}journal (
    revision    INTEGER NOT NULL,
    node_id     TEXT NOT NULL,
    producer_id TEXT NOT NULL,
    payload     BLOB NOT NULL
);
CREATE INDEX ${schema_object_prefix}journal_revision
    ON ${schema_object_prefix}journal (revision);
CREATE TABLE ${schema_object_prefix}global_revision (
    revision INTEGER NOT NULL
);
INSERT INTO ${schema_object_prefix}global_revision (revision) VALUES (0)
"#;

/// Local revision table, SQLite dialect.
const SQLITE_LOCAL_REVISIONS_DDL: &str = r#"
CREATE TABLE ${schema_object_prefix}local_revisions (
    node_id  TEXT PRIMARY KEY,
    revision INTEGER NOT NULL
)
"#;

/// Journal and global counter tables, generic fallback.
///
/// Upper-case identifiers, matching the generic dialect's folding. Each
/// table and index takes the optional tablespace clause.
const GENERIC_JOURNAL_DDL: &str = r#"
CREATE TABLE ${schema_object_prefix}JOURNAL (
    REVISION    INTEGER NOT NULL,
    NODE_ID     VARCHAR(255) NOT NULL,
    PRODUCER_ID VARCHAR(255) NOT NULL,
    PAYLOAD     BLOB NOT NULL
)${tablespace};
CREATE INDEX ${schema_object_prefix}JOURNAL_REVISION
    ON ${schema_object_prefix}JOURNAL (REVISION)${tablespace};
CREATE TABLE ${schema_object_prefix}GLOBAL_REVISION (
    REVISION INTEGER NOT NULL
)${tablespace};
INSERT INTO ${schema_object_prefix}GLOBAL_REVISION (REVISION) VALUES (0)
"#;

const GENERIC_LOCAL_REVISIONS_DDL: &str = r#"
CREATE TABLE ${schema_object_prefix}LOCAL_REVISIONS (
    NODE_ID  VARCHAR(255) PRIMARY KEY,
    REVISION INTEGER NOT NULL
)${tablespace}
"#;

/// The pair of scripts used for one dialect.
#[derive(Debug, Clone, Copy)]
pub struct DdlScripts {
    pub journal: &'static str,
    pub local_revisions: &'static str,
}

/// Returns the scripts for `tag`, or the generic fallback.
pub fn scripts_for(tag: &str) -> DdlScripts {
    match tag {
        "sqlite" => DdlScripts {
            journal: SQLITE_JOURNAL_DDL,
            local_revisions: SQLITE_LOCAL_REVISIONS_DDL,
        },
        _ => DdlScripts {
            journal: GENERIC_JOURNAL_DDL,
            local_revisions: GENERIC_LOCAL_REVISIONS_DDL,
        },
    }
}

/// Splits a script into its non-empty statements.
pub fn split_statements(script: &str) -> Vec<&str> {
    script
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

// =============================================================================
// Table Names and Statements
// =============================================================================

/// Table names after prefixing and identifier folding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub journal: String,
    pub global_revision: String,
    pub local_revisions: String,
}

impl TableNames {
    pub fn new(dialect: &dyn SqlDialect, prefix: &str) -> Self {
        let name = |table: &str| dialect.fold_identifier(&format!("{prefix}{table}"));
        Self {
            journal: name("journal"),
            global_revision: name("global_revision"),
            local_revisions: name("local_revisions"),
        }
    }
}

/// SQL text of every statement the journal runs after startup.
///
/// Executed through `prepare_cached`, so each connection prepares a statement
/// once and a fresh connection after a reconnect re-prepares on first use.
#[derive(Debug, Clone)]
pub struct Statements {
    pub increment_global: String,
    pub select_global: String,
    pub insert_record: String,
    pub select_max_revision: String,
    pub select_records_page: String,
    pub select_local: String,
    pub insert_local: String,
    pub update_local: String,
    pub select_all_local: String,
    pub select_min_local: String,
    pub delete_below: String,
}

impl Statements {
    pub fn new(tables: &TableNames) -> Self {
        let TableNames {
            journal,
            global_revision,
            local_revisions,
        } = tables;

        Self {
            increment_global: format!("UPDATE {global_revision} SET revision = revision + 1"),
            select_global: format!("SELECT revision FROM {global_revision}"),
            insert_record: format!(
                "INSERT INTO {journal} (revision, node_id, producer_id, payload) \
                 VALUES (?1, ?2, ?3, ?4)"
            ),
            select_max_revision: format!("SELECT MAX(revision) FROM {journal}"),
            // Keyset pagination on (revision, rowid): revisions repeat within
            // one lock, so the revision alone is not a cursor.
            select_records_page: format!(
                "SELECT rowid, revision, node_id, producer_id, payload FROM {journal} \
                 WHERE (revision > ?1 OR (revision = ?1 AND rowid > ?2)) AND revision <= ?3 \
                 ORDER BY revision, rowid LIMIT ?4"
            ),
            select_local: format!("SELECT revision FROM {local_revisions} WHERE node_id = ?1"),
            insert_local: format!(
                "INSERT OR IGNORE INTO {local_revisions} (node_id, revision) VALUES (?1, ?2)"
            ),
            update_local: format!("UPDATE {local_revisions} SET revision = ?1 WHERE node_id = ?2"),
            select_all_local: format!(
                "SELECT node_id, revision FROM {local_revisions} ORDER BY node_id"
            ),
            select_min_local: format!("SELECT MIN(revision) FROM {local_revisions}"),
            delete_below: format!("DELETE FROM {journal} WHERE revision < ?1"),
        }
    }
}

// =============================================================================
// Schema Check
// =============================================================================

/// Creates missing journal tables.
///
/// Runs inside one `BEGIN IMMEDIATE` transaction so nodes starting at the same
/// time do not both try to create the tables.
pub fn ensure_schema(
    conns: &ConnectionManager,
    dialect: &dyn SqlDialect,
    tables: &TableNames,
    prefix: &str,
) -> Result<()> {
    let scripts = scripts_for(dialect.tag());

    let created = conns
        .with_connection(Slot::Shared, "schema check", |conn| {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            let result = create_missing(conn, dialect, tables, prefix, scripts);
            match result {
                Ok(created) => {
                    conn.execute_batch("COMMIT")?;
                    Ok(created)
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(e)
                }
            }
        })
        .map_err(|e| Error::Schema(format!("cannot create journal schema: {e}")))?;

    if !created.is_empty() {
        info!(tables = ?created, dialect = dialect.tag(), "created journal tables");
    }
    Ok(())
}

fn create_missing(
    conn: &Connection,
    dialect: &dyn SqlDialect,
    tables: &TableNames,
    prefix: &str,
    scripts: DdlScripts,
) -> rusqlite::Result<Vec<String>> {
    let mut created = Vec::new();

    if !dialect.table_exists(conn, &tables.journal)? {
        run_script(conn, dialect, scripts.journal, prefix)?;
        created.push(tables.journal.clone());
        created.push(tables.global_revision.clone());
    }

    if !dialect.table_exists(conn, &tables.local_revisions)? {
        run_script(conn, dialect, scripts.local_revisions, prefix)?;
        created.push(tables.local_revisions.clone());
    }

    // A counter table without its row would make every lock fail.
    conn.execute(
        &format!(
            "INSERT INTO {t} (revision) SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM {t})",
            t = tables.global_revision
        ),
        [],
    )?;

    Ok(created)
}

fn run_script(
    conn: &Connection,
    dialect: &dyn SqlDialect,
    script: &str,
    prefix: &str,
) -> rusqlite::Result<()> {
    let script = dialect.substitute(script, prefix);
    for statement in split_statements(&script) {
        conn.execute_batch(statement)?;
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
