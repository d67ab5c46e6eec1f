//! SQLite-backed canonical store.
//!
//! Logical tables are registered in `canonical_tables`; every row lives in
//! `canonical_rows` as a JSON body keyed by `(table_name, id)`. Filters and
//! ordering are applied to the decoded rows with the same helpers the
//! in-memory store uses, so both backends agree on semantics.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use masterdata_core::remote::{matches_filters, row_id, sort_rows};
use masterdata_core::{CanonicalStore, Filter, Order, RemoteError, Row};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use thiserror::Error;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS canonical_tables (
  name TEXT PRIMARY KEY,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS canonical_rows (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  table_name TEXT NOT NULL,
  id TEXT NOT NULL,
  body TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE(table_name, id),
  FOREIGN KEY (table_name) REFERENCES canonical_tables(name)
);

CREATE INDEX IF NOT EXISTS idx_canonical_rows_table ON canonical_rows(table_name);
";

#[derive(Debug, Error)]
pub enum SqliteStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("row body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("invalid table name: {0:?}")]
    InvalidTableName(String),
    #[error("duplicate id {id} in {table}")]
    DuplicateId { table: String, id: String },
    #[error("row {id} not found in {table}")]
    RowNotFound { table: String, id: String },
    #[error("row body for {0} is not a JSON object")]
    NotAnObject(String),
    #[error("schema version {0} is newer than this build supports")]
    UnsupportedSchema(i64),
}

impl From<SqliteStoreError> for RemoteError {
    fn from(e: SqliteStoreError) -> Self {
        match e {
            SqliteStoreError::UnknownTable(table) => RemoteError::UnknownTable(table),
            SqliteStoreError::RowNotFound { table, id } => RemoteError::RowNotFound { table, id },
            SqliteStoreError::DuplicateId { .. } | SqliteStoreError::InvalidTableName(_) => {
                RemoteError::Rejected(e.to_string())
            }
            other => RemoteError::Backend(other.to_string()),
        }
    }
}

pub struct SqliteCanonicalStore {
    conn: Mutex<Connection>,
}

impl SqliteCanonicalStore {
    /// Open (or create) a database file and bring its schema up to date.
    pub fn open(path: &Path) -> Result<Self, SqliteStoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        tracing::debug!("Opened canonical store at {}", path.display());
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, SqliteStoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, SqliteStoreError> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Apply forward schema migrations.
    pub fn migrate(&self) -> Result<(), SqliteStoreError> {
        let mut conn = self.conn.lock();
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        let version = current_schema_version(&conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(SqliteStoreError::UnsupportedSchema(version));
        }
        if version < 1 {
            let tx = conn.transaction()?;
            tx.execute_batch(MIGRATION_001_SQL)?;
            record_schema_version(&tx, 1)?;
            tx.commit()?;
            tracing::info!("Canonical store schema migrated to version 1");
        }
        Ok(())
    }

    pub fn schema_version(&self) -> Result<i64, SqliteStoreError> {
        let conn = self.conn.lock();
        current_schema_version(&conn)
    }

    /// Register logical tables. Already registered names are left alone.
    pub fn ensure_tables(&self, names: &[&str]) -> Result<(), SqliteStoreError> {
        for name in names {
            validate_table_name(name)?;
        }
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for name in names {
            tx.execute(
                "INSERT OR IGNORE INTO canonical_tables(name, created_at) VALUES (?1, ?2)",
                params![name, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn tables(&self) -> Result<Vec<String>, SqliteStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT name FROM canonical_tables ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    pub fn row_count(&self, table: &str) -> Result<usize, SqliteStoreError> {
        let conn = self.conn.lock();
        require_table(&conn, table)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM canonical_rows WHERE table_name = ?1",
            params![table],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn select_rows(
        &self,
        table: &str,
        filters: &[Filter],
        order: Option<&Order>,
    ) -> Result<Vec<Row>, SqliteStoreError> {
        let conn = self.conn.lock();
        require_table(&conn, table)?;
        let mut stmt =
            conn.prepare("SELECT id, body FROM canonical_rows WHERE table_name = ?1 ORDER BY seq")?;
        let bodies = stmt
            .query_map(params![table], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut rows = Vec::with_capacity(bodies.len());
        for (id, body) in bodies {
            let row = decode_row(&id, &body)?;
            if matches_filters(&row, filters) {
                rows.push(row);
            }
        }
        if let Some(order) = order {
            sort_rows(&mut rows, order);
        }
        Ok(rows)
    }

    fn insert_rows(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, SqliteStoreError> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock();
        require_table(&conn, table)?;
        let tx = conn.transaction()?;

        let mut stored = Vec::with_capacity(rows.len());
        for mut row in rows {
            let id = match row_id(&row) {
                Some(id) => id,
                None => {
                    let id = Ulid::new().to_string();
                    row.insert("id".to_string(), Value::String(id.clone()));
                    id
                }
            };
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM canonical_rows WHERE table_name = ?1 AND id = ?2)",
                params![table, id],
                |r| r.get(0),
            )?;
            if exists {
                // Dropping the transaction rolls back earlier rows of this batch.
                return Err(SqliteStoreError::DuplicateId {
                    table: table.to_string(),
                    id,
                });
            }
            tx.execute(
                "INSERT INTO canonical_rows(table_name, id, body, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![table, id, serde_json::to_string(&row)?, now],
            )?;
            stored.push(row);
        }
        tx.commit()?;
        tracing::debug!("Inserted {} rows into {}", stored.len(), table);
        Ok(stored)
    }

    fn update_row(&self, table: &str, id: &str, patch: Row) -> Result<Row, SqliteStoreError> {
        let mut conn = self.conn.lock();
        require_table(&conn, table)?;
        let tx = conn.transaction()?;
        let body: Option<String> = tx
            .query_row(
                "SELECT body FROM canonical_rows WHERE table_name = ?1 AND id = ?2",
                params![table, id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(body) = body else {
            return Err(SqliteStoreError::RowNotFound {
                table: table.to_string(),
                id: id.to_string(),
            });
        };

        let mut row = decode_row(id, &body)?;
        for (k, v) in patch {
            if k != "id" {
                row.insert(k, v);
            }
        }
        tx.execute(
            "UPDATE canonical_rows SET body = ?3, updated_at = ?4 WHERE table_name = ?1 AND id = ?2",
            params![table, id, serde_json::to_string(&row)?, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(row)
    }

    fn delete_row(&self, table: &str, id: &str) -> Result<(), SqliteStoreError> {
        let conn = self.conn.lock();
        require_table(&conn, table)?;
        let deleted = conn.execute(
            "DELETE FROM canonical_rows WHERE table_name = ?1 AND id = ?2",
            params![table, id],
        )?;
        if deleted == 0 {
            return Err(SqliteStoreError::RowNotFound {
                table: table.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CanonicalStore for SqliteCanonicalStore {
    async fn select(
        &self,
        table: &str,
        filters: &[Filter],
        order: Option<&Order>,
    ) -> Result<Vec<Row>, RemoteError> {
        Ok(self.select_rows(table, filters, order)?)
    }

    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, RemoteError> {
        Ok(self.insert_rows(table, rows)?)
    }

    async fn update(&self, table: &str, id: &str, row: Row) -> Result<Row, RemoteError> {
        Ok(self.update_row(table, id, row)?)
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        Ok(self.delete_row(table, id)?)
    }
}

fn validate_table_name(name: &str) -> Result<(), SqliteStoreError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SqliteStoreError::InvalidTableName(name.to_string()))
    }
}

fn require_table(conn: &Connection, table: &str) -> Result<(), SqliteStoreError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM canonical_tables WHERE name = ?1)",
        params![table],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(SqliteStoreError::UnknownTable(table.to_string()))
    }
}

fn decode_row(id: &str, body: &str) -> Result<Row, SqliteStoreError> {
    match serde_json::from_str::<Value>(body)? {
        Value::Object(row) => Ok(row),
        _ => Err(SqliteStoreError::NotAnObject(id.to_string())),
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64, SqliteStoreError> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<(), SqliteStoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn store() -> SqliteCanonicalStore {
        let store = SqliteCanonicalStore::open_in_memory()
            .unwrap_or_else(|e| panic!("open in-memory store: {e}"));
        store
            .ensure_tables(&["countries", "currencies"])
            .unwrap_or_else(|e| panic!("register tables: {e}"));
        store
    }

    #[test]
    fn test_schema_is_versioned() -> Result<(), SqliteStoreError> {
        let store = store();
        assert_eq!(store.schema_version()?, LATEST_SCHEMA_VERSION);
        store.migrate()?;
        assert_eq!(store.schema_version()?, LATEST_SCHEMA_VERSION);
        assert_eq!(store.tables()?, vec!["countries".to_string(), "currencies".to_string()]);
        Ok(())
    }

    #[test]
    fn test_rejects_bad_table_names() {
        let store = store();
        assert!(matches!(
            store.ensure_tables(&["countries; DROP TABLE canonical_rows"]),
            Err(SqliteStoreError::InvalidTableName(_))
        ));
    }

    #[tokio::test]
    async fn test_insert_select_roundtrip() -> Result<(), RemoteError> {
        let store = store();
        let stored = store
            .insert(
                "countries",
                vec![
                    row(json!({"name": "India", "is_active": true, "display_order": 1})),
                    row(json!({"name": "Chile", "is_active": false, "display_order": 0})),
                ],
            )
            .await?;
        assert!(stored.iter().all(|r| row_id(r).is_some()));

        let ordered = store
            .select("countries", &[], Some(&Order::asc("display_order")))
            .await?;
        assert_eq!(ordered[0].get("name"), Some(&json!("Chile")));

        let active = store
            .select("countries", &[Filter::eq("is_active", true)], None)
            .await?;
        assert_eq!(active.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_batch_rolls_back() {
        let store = store();
        let result = store
            .insert(
                "currencies",
                vec![
                    row(json!({"id": "USD", "name": "US Dollar"})),
                    row(json!({"id": "USD", "name": "again"})),
                ],
            )
            .await;
        assert!(matches!(result, Err(RemoteError::Rejected(_))));
        assert_eq!(store.row_count("currencies").unwrap_or(usize::MAX), 0);
    }

    #[tokio::test]
    async fn test_update_and_delete() -> Result<(), RemoteError> {
        let store = store();
        store
            .insert("currencies", vec![row(json!({"id": "EUR", "name": "Euro"}))])
            .await?;
        let updated = store
            .update("currencies", "EUR", row(json!({"symbol": "€", "id": "ignored"})))
            .await?;
        assert_eq!(updated.get("id"), Some(&json!("EUR")));
        assert_eq!(updated.get("symbol"), Some(&json!("€")));

        store.delete("currencies", "EUR").await?;
        assert!(matches!(
            store.delete("currencies", "EUR").await,
            Err(RemoteError::RowNotFound { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_table() {
        let store = store();
        assert_eq!(
            store.select("planets", &[], None).await,
            Err(RemoteError::UnknownTable("planets".to_string()))
        );
    }
}
