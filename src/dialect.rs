//! # SQL Dialects
//!
//! A dialect captures what differs between databases as far as the journal is
//! concerned: how unquoted identifiers are folded, which vendor placeholders a
//! DDL script may contain, and how to ask whether a table exists.
//!
//! Dialects are composed into the journal next to a
//! [`ConnectionProvider`](crate::connection::ConnectionProvider); the two vary
//! independently.
//!
//! | Tag | Type | Identifier folding | Placeholders |
//! |-----|------|--------------------|--------------|
//! | `sqlite` | [`SqliteDialect`] | preserved | prefix |
//! | anything else | [`GenericDialect`] | upper case | prefix, `${tablespace}` |

use std::fmt;

use rusqlite::{params, Connection, OptionalExtension};

use crate::config::{JournalConfig, GENERIC_DIALECT_TAG};

/// Placeholder replaced by the (folded) schema object prefix.
pub const PREFIX_PLACEHOLDER: &str = "${schema_object_prefix}";

/// Placeholder for a ` TABLESPACE <name>` clause, empty when no tablespace is
/// configured.
pub const TABLESPACE_PLACEHOLDER: &str = "${tablespace}";

/// How a database stores unquoted identifiers in its catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierCase {
    Preserve,
    Upper,
    Lower,
}

impl IdentifierCase {
    pub fn fold(self, identifier: &str) -> String {
        match self {
            IdentifierCase::Preserve => identifier.to_string(),
            IdentifierCase::Upper => identifier.to_ascii_uppercase(),
            IdentifierCase::Lower => identifier.to_ascii_lowercase(),
        }
    }
}

// =============================================================================
// SqlDialect Trait
// =============================================================================

/// Database-specific customization of schema handling.
pub trait SqlDialect: Send + Sync + fmt::Debug {
    /// Short tag selecting the DDL script, e.g. `sqlite`.
    fn tag(&self) -> &str;

    fn identifier_case(&self) -> IdentifierCase {
        IdentifierCase::Preserve
    }

    /// Folds an identifier the way the database catalog stores it.
    fn fold_identifier(&self, identifier: &str) -> String {
        self.identifier_case().fold(identifier)
    }

    /// Vendor placeholders beyond the schema object prefix, as
    /// `(placeholder, replacement)` pairs.
    fn placeholders(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    /// Substitutes the prefix and vendor placeholders into a DDL script.
    fn substitute(&self, script: &str, prefix: &str) -> String {
        let mut out = script.replace(PREFIX_PLACEHOLDER, &self.fold_identifier(prefix));
        for (placeholder, value) in self.placeholders() {
            out = out.replace(placeholder, &value);
        }
        out
    }

    /// Checks whether `table` (already folded) exists. The lookup ignores
    /// case, as SQLite's own name resolution does.
    fn table_exists(&self, conn: &Connection, table: &str) -> rusqlite::Result<bool> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
                params![table],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

// =============================================================================
// SqliteDialect
// =============================================================================

/// Dialect for databases addressed as `sqlite:<path>`.
#[derive(Debug, Clone, Default)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn tag(&self) -> &str {
        "sqlite"
    }
}

// =============================================================================
// GenericDialect
// =============================================================================

/// Fallback dialect used for unknown or untagged connection strings.
///
/// Folds identifiers to upper case, the SQL standard behaviour, and supports
/// the `${tablespace}` vendor placeholder.
#[derive(Debug, Clone)]
pub struct GenericDialect {
    tag: String,
    tablespace: Option<String>,
}

impl GenericDialect {
    pub fn new(tag: impl Into<String>, tablespace: Option<String>) -> Self {
        Self {
            tag: tag.into(),
            tablespace,
        }
    }
}

impl Default for GenericDialect {
    fn default() -> Self {
        Self::new(GENERIC_DIALECT_TAG, None)
    }
}

impl SqlDialect for GenericDialect {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn identifier_case(&self) -> IdentifierCase {
        IdentifierCase::Upper
    }

    fn placeholders(&self) -> Vec<(&'static str, String)> {
        let clause = self
            .tablespace
            .as_deref()
            .map(|t| format!(" TABLESPACE {}", self.fold_identifier(t)))
            .unwrap_or_default();
        vec![(TABLESPACE_PLACEHOLDER, clause)]
    }
}

// =============================================================================
// Selection
// =============================================================================

/// Picks the dialect for `tag`, falling back to [`GenericDialect`].
pub fn dialect_for(tag: &str, config: &JournalConfig) -> Box<dyn SqlDialect> {
    match tag.to_ascii_lowercase().as_str() {
        "sqlite" | "sqlite3" => Box::new(SqliteDialect),
        other => Box::new(GenericDialect::new(other, config.tablespace.clone())),
    }
}

/// Extracts the dialect tag from a connection string of the form
/// `<tag>:<rest>`.
///
/// Single-letter schemes are treated as drive letters, not tags.
pub fn tag_from_url(url: &str) -> Option<String> {
    let (scheme, _) = url.split_once(':')?;
    if scheme.len() > 1 && scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
        Some(scheme.to_ascii_lowercase())
    } else {
        None
    }
}
