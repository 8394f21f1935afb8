//! SQLite-backed history store.
//!
//! Tables:
//! ```text
//! entities(entity_type, entity_id, attributes_json, current_version)
//! versions(entity_type, entity_id, version, event, old_values_json,
//!          new_values_json, is_snapshot, <author column>, created_at_ms)
//! ```
//! `versions` has `(entity_type, entity_id, version)` as its primary key, so two
//! writers racing for the same version number cannot both commit.

use crate::error::StoreError;
use retrace_common::{AttributeMap, AuthorId, EntityKey, Version};
use retrace_kernel::config::is_valid_identifier;
use retrace_kernel::{
    ChangeKind, HistoryError, HistoryStore, HistoryTx, StoredEntity, VersionRecord,
};
use rusqlite::{
    Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior, params,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQL text that depends on the configured author column.
#[derive(Debug)]
struct Statements {
    insert_version: String,
    select_versions: String,
}

impl Statements {
    fn new(author_column: &str) -> Self {
        Self {
            insert_version: format!(
                "INSERT INTO versions(entity_type, entity_id, version, event, old_values_json, \
                 new_values_json, is_snapshot, {author_column}, created_at_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            select_versions: format!(
                "SELECT version, event, old_values_json, new_values_json, is_snapshot, \
                 {author_column}, created_at_ms \
                 FROM versions \
                 WHERE entity_type=?1 AND entity_id=?2 \
                 ORDER BY version ASC"
            ),
        }
    }
}

/// History store over a single SQLite database file.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    path: Option<PathBuf>,
    statements: Statements,
}

impl SqliteStore {
    /// Open or create the database at `path`. `author_column` names the column
    /// holding the acting user's identity.
    pub fn open(path: impl AsRef<Path>, author_column: &str) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        Self::init(conn, Some(path), author_column)
    }

    /// A private in-memory database.
    pub fn open_in_memory(author_column: &str) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, None, author_column)
    }

    fn init(
        conn: Connection,
        path: Option<PathBuf>,
        author_column: &str,
    ) -> Result<Self, StoreError> {
        if !is_valid_identifier(author_column) {
            return Err(StoreError::InvalidColumn(author_column.to_string()));
        }
        conn.busy_timeout(BUSY_TIMEOUT)?;
        install_schema(&conn, author_column)?;
        Ok(Self {
            conn,
            path,
            statements: Statements::new(author_column),
        })
    }

    /// Database file, or `None` for an in-memory store.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl HistoryStore for SqliteStore {
    fn atomically<T, F>(&mut self, f: F) -> Result<T, HistoryError>
    where
        F: FnOnce(&mut dyn HistoryTx) -> Result<T, HistoryError>,
    {
        // IMMEDIATE takes the write lock up front, so no other writer can
        // change the version set between our read and our commit.
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let mut scoped = SqliteTx {
            tx,
            statements: &self.statements,
        };
        let out = f(&mut scoped)?;
        scoped.tx.commit().map_err(StoreError::from)?;
        Ok(out)
    }
}

struct SqliteTx<'a> {
    tx: Transaction<'a>,
    statements: &'a Statements,
}

impl HistoryTx for SqliteTx<'_> {
    fn read_entity(&self, key: &EntityKey) -> Result<Option<StoredEntity>, HistoryError> {
        let row = self
            .tx
            .query_row(
                "SELECT attributes_json, current_version FROM entities \
                 WHERE entity_type=?1 AND entity_id=?2",
                params![key.entity_type.as_str(), key.entity_id.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?)),
            )
            .optional()
            .map_err(StoreError::from)?;

        let Some((attributes_json, pointer)) = row else {
            return Ok(None);
        };
        Ok(Some(StoredEntity {
            attributes: parse_attributes(&attributes_json)?,
            version_pointer: pointer.map(from_sql_version).transpose()?,
        }))
    }

    fn write_entity(
        &mut self,
        key: &EntityKey,
        attributes: &AttributeMap,
    ) -> Result<(), HistoryError> {
        let json = serde_json::to_string(attributes).map_err(StoreError::from)?;
        self.tx
            .execute(
                "INSERT INTO entities(entity_type, entity_id, attributes_json) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(entity_type, entity_id) DO UPDATE SET attributes_json=excluded.attributes_json",
                params![key.entity_type.as_str(), key.entity_id.as_str(), json],
            )
            .map_err(StoreError::from)?;
        Ok(())
    }

    fn write_version_pointer(
        &mut self,
        key: &EntityKey,
        version: Version,
    ) -> Result<(), HistoryError> {
        let version = to_sql_version(version)?;
        self.tx
            .execute(
                "INSERT INTO entities(entity_type, entity_id, attributes_json, current_version) \
                 VALUES (?1, ?2, '{}', ?3) \
                 ON CONFLICT(entity_type, entity_id) DO UPDATE SET current_version=excluded.current_version",
                params![key.entity_type.as_str(), key.entity_id.as_str(), version],
            )
            .map_err(StoreError::from)?;
        Ok(())
    }

    fn delete_entity(&mut self, key: &EntityKey) -> Result<(), HistoryError> {
        self.tx
            .execute(
                "DELETE FROM entities WHERE entity_type=?1 AND entity_id=?2",
                params![key.entity_type.as_str(), key.entity_id.as_str()],
            )
            .map_err(StoreError::from)?;
        Ok(())
    }

    fn max_version(&self, key: &EntityKey) -> Result<Version, HistoryError> {
        let max: i64 = self
            .tx
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM versions WHERE entity_type=?1 AND entity_id=?2",
                params![key.entity_type.as_str(), key.entity_id.as_str()],
                |row| row.get(0),
            )
            .map_err(StoreError::from)?;
        Ok(from_sql_version(max)?)
    }

    fn versions(&self, key: &EntityKey) -> Result<Vec<VersionRecord>, HistoryError> {
        let mut stmt = self
            .tx
            .prepare(&self.statements.select_versions)
            .map_err(StoreError::from)?;
        let rows = stmt
            .query_map(
                params![key.entity_type.as_str(), key.entity_id.as_str()],
                |row| {
                    Ok(VersionRow {
                        version: row.get(0)?,
                        event: row.get(1)?,
                        old_values_json: row.get(2)?,
                        new_values_json: row.get(3)?,
                        is_snapshot: row.get::<_, i64>(4)? != 0,
                        author_id: row.get(5)?,
                        created_at_ms: row.get(6)?,
                    })
                },
            )
            .map_err(StoreError::from)?;

        let mut out = Vec::new();
        for row in rows {
            let row = row.map_err(StoreError::from)?;
            out.push(row.into_record(key)?);
        }
        Ok(out)
    }

    fn insert_version(&mut self, record: &VersionRecord) -> Result<(), HistoryError> {
        let old_values = serde_json::to_string(&record.old_values).map_err(StoreError::from)?;
        let new_values = serde_json::to_string(&record.new_values).map_err(StoreError::from)?;
        let inserted = self.tx.execute(
            &self.statements.insert_version,
            params![
                record.entity.entity_type.as_str(),
                record.entity.entity_id.as_str(),
                to_sql_version(record.version)?,
                record.event.as_str(),
                old_values,
                new_values,
                i64::from(record.is_snapshot),
                record.author_id.as_ref().map(AuthorId::as_str),
                record.created_at_ms,
            ],
        );
        match inserted {
            Ok(_) => {
                debug!(entity = %record.entity, version = record.version, "version row inserted");
                Ok(())
            }
            Err(err) if is_constraint_violation(&err) => Err(HistoryError::VersionConflict {
                entity: record.entity.clone(),
                version: record.version,
            }),
            Err(err) => Err(StoreError::from(err).into()),
        }
    }
}

struct VersionRow {
    version: i64,
    event: String,
    old_values_json: String,
    new_values_json: String,
    is_snapshot: bool,
    author_id: Option<String>,
    created_at_ms: i64,
}

impl VersionRow {
    fn into_record(self, key: &EntityKey) -> Result<VersionRecord, StoreError> {
        let event = self
            .event
            .parse::<ChangeKind>()
            .map_err(|e| StoreError::OutOfRange(e.to_string()))?;
        Ok(VersionRecord {
            entity: key.clone(),
            version: from_sql_version(self.version)?,
            event,
            old_values: parse_attributes(&self.old_values_json)?,
            new_values: parse_attributes(&self.new_values_json)?,
            is_snapshot: self.is_snapshot,
            author_id: self.author_id.map(AuthorId::new),
            created_at_ms: self.created_at_ms,
        })
    }
}

fn install_schema(conn: &Connection, author_column: &str) -> Result<(), StoreError> {
    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            attributes_json TEXT NOT NULL,
            current_version INTEGER,
            PRIMARY KEY (entity_type, entity_id)
        );
        CREATE TABLE IF NOT EXISTS versions (
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            version INTEGER NOT NULL CHECK (version > 0),
            event TEXT NOT NULL,
            old_values_json TEXT NOT NULL,
            new_values_json TEXT NOT NULL,
            is_snapshot INTEGER NOT NULL DEFAULT 0,
            {author_column} TEXT,
            created_at_ms INTEGER NOT NULL,
            PRIMARY KEY (entity_type, entity_id, version)
        );
        CREATE INDEX IF NOT EXISTS versions_snapshots
            ON versions(entity_type, entity_id, version) WHERE is_snapshot = 1;
        "#
    ))?;
    Ok(())
}

fn parse_attributes(json: &str) -> Result<AttributeMap, StoreError> {
    Ok(serde_json::from_str(json)?)
}

fn to_sql_version(version: Version) -> Result<i64, StoreError> {
    i64::try_from(version).map_err(|_| StoreError::OutOfRange(format!("version {version}")))
}

fn from_sql_version(version: i64) -> Result<Version, StoreError> {
    Version::try_from(version).map_err(|_| StoreError::OutOfRange(format!("version {version}")))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, message) => {
            code.code == ErrorCode::ConstraintViolation
                || message.as_deref().is_some_and(|value| {
                    value.contains("UNIQUE constraint failed")
                        || value.contains("PRIMARY KEY constraint failed")
                })
        }
        _ => false,
    }
}
