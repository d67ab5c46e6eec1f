//! Canonical (remote) store boundary.
//!
//! The migration engine and the category store are the only callers. Rows
//! are plain JSON objects; the store assigns an `id` when a row lacks one.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use thiserror::Error;

pub type Row = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("row {id} not found in {table}")]
    RowNotFound { table: String, id: String },
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("backend error: {0}")]
    Backend(String),
}

/// Equality filter on one top-level field.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub value: Value,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub field: String,
    pub ascending: bool,
}

impl Order {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: true,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: false,
        }
    }
}

#[async_trait]
pub trait CanonicalStore: Send + Sync {
    async fn select(
        &self,
        table: &str,
        filters: &[Filter],
        order: Option<&Order>,
    ) -> Result<Vec<Row>, RemoteError>;

    /// Insert rows, returning them as stored (ids filled in).
    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, RemoteError>;

    async fn update(&self, table: &str, id: &str, row: Row) -> Result<Row, RemoteError>;

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError>;
}

#[must_use]
pub fn matches_filters(row: &Row, filters: &[Filter]) -> bool {
    filters
        .iter()
        .all(|f| row.get(&f.field).is_some_and(|v| *v == f.value))
}

/// Stable sort by one field. Rows missing the field sort last either way.
pub fn sort_rows(rows: &mut [Row], order: &Order) {
    rows.sort_by(|a, b| {
        match (a.get(&order.field), b.get(&order.field)) {
            (Some(x), Some(y)) => {
                let ord = compare_values(x, y);
                if order.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            }
            (Some(_), None) => CmpOrdering::Less,
            (None, Some(_)) => CmpOrdering::Greater,
            (None, None) => CmpOrdering::Equal,
        }
    });
}

fn compare_values(a: &Value, b: &Value) -> CmpOrdering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .zip(y.as_f64())
            .and_then(|(x, y)| x.partial_cmp(&y))
            .unwrap_or(CmpOrdering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

/// String form of a row id, whatever JSON type it was stored as.
#[must_use]
pub fn row_id(row: &Row) -> Option<String> {
    match row.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// In-process canonical store with call counting and failure injection.
#[derive(Debug, Default)]
pub struct MemoryCanonicalStore {
    tables: Mutex<BTreeMap<String, Vec<Row>>>,
    failing_tables: Mutex<HashSet<String>>,
    latency: Option<Duration>,
    insert_calls: AtomicUsize,
    select_calls: AtomicUsize,
}

impl MemoryCanonicalStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that accepts any table name listed here; others are unknown.
    pub fn with_tables<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::default();
        {
            let mut map = store.tables.lock();
            for t in tables {
                map.insert(t.into(), Vec::new());
            }
        }
        store
    }

    /// Delay every call by `latency` before it touches the data.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make every call against `table` fail with a network error.
    pub fn fail_table(&self, table: &str) {
        self.failing_tables.lock().insert(table.to_string());
    }

    pub fn heal_table(&self, table: &str) {
        self.failing_tables.lock().remove(table);
    }

    #[must_use]
    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn select_calls(&self) -> usize {
        self.select_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables.lock().get(table).cloned().unwrap_or_default()
    }

    pub fn seed(&self, table: &str, rows: Vec<Row>) {
        self.tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    async fn enter(&self, table: &str) -> Result<(), RemoteError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing_tables.lock().contains(table) {
            return Err(RemoteError::Network(format!("injected failure on {table}")));
        }
        Ok(())
    }
}

#[async_trait]
impl CanonicalStore for MemoryCanonicalStore {
    async fn select(
        &self,
        table: &str,
        filters: &[Filter],
        order: Option<&Order>,
    ) -> Result<Vec<Row>, RemoteError> {
        self.select_calls.fetch_add(1, Ordering::SeqCst);
        self.enter(table).await?;
        let tables = self.tables.lock();
        let rows = tables
            .get(table)
            .ok_or_else(|| RemoteError::UnknownTable(table.to_string()))?;
        let mut out: Vec<Row> = rows
            .iter()
            .filter(|r| matches_filters(r, filters))
            .cloned()
            .collect();
        if let Some(order) = order {
            sort_rows(&mut out, order);
        }
        Ok(out)
    }

    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, RemoteError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        self.enter(table).await?;
        let mut tables = self.tables.lock();
        let existing = tables
            .get_mut(table)
            .ok_or_else(|| RemoteError::UnknownTable(table.to_string()))?;

        let mut taken: HashSet<String> = existing.iter().filter_map(row_id).collect();
        let mut stored = Vec::with_capacity(rows.len());
        for mut row in rows {
            let id = match row_id(&row) {
                Some(id) => id,
                None => {
                    let id = ulid::Ulid::new().to_string();
                    row.insert("id".to_string(), Value::String(id.clone()));
                    id
                }
            };
            if !taken.insert(id.clone()) {
                return Err(RemoteError::Rejected(format!(
                    "duplicate id {id} in {table}"
                )));
            }
            stored.push(row);
        }
        existing.extend(stored.iter().cloned());
        Ok(stored)
    }

    async fn update(&self, table: &str, id: &str, row: Row) -> Result<Row, RemoteError> {
        self.enter(table).await?;
        let mut tables = self.tables.lock();
        let rows = tables
            .get_mut(table)
            .ok_or_else(|| RemoteError::UnknownTable(table.to_string()))?;
        let target = rows
            .iter_mut()
            .find(|r| row_id(r).as_deref() == Some(id))
            .ok_or_else(|| RemoteError::RowNotFound {
                table: table.to_string(),
                id: id.to_string(),
            })?;
        for (k, v) in row {
            if k != "id" {
                target.insert(k, v);
            }
        }
        Ok(target.clone())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        self.enter(table).await?;
        let mut tables = self.tables.lock();
        let rows = tables
            .get_mut(table)
            .ok_or_else(|| RemoteError::UnknownTable(table.to_string()))?;
        let before = rows.len();
        rows.retain(|r| row_id(r).as_deref() != Some(id));
        if rows.len() == before {
            return Err(RemoteError::RowNotFound {
                table: table.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}
