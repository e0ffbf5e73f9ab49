//! In-process [`Backend`] with call counters, injected failures and latency.
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{Backend, Condition, Filter, Table};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Select,
    Insert,
    Update,
    Delete,
}

#[derive(Default)]
struct Inner {
    tables: HashMap<Table, Vec<Value>>,
    calls: HashMap<(Table, Op), usize>,
    failing: HashSet<(Table, Op)>,
    offline: bool,
    latency: Option<Duration>,
}

#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn seed(&self, table: Table, rows: Vec<Value>) {
        self.lock().tables.entry(table).or_default().extend(rows);
    }

    #[must_use]
    pub fn rows(&self, table: Table) -> Vec<Value> {
        self.lock().tables.get(&table).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn calls(&self, table: Table, op: Op) -> usize {
        self.lock().calls.get(&(table, op)).copied().unwrap_or(0)
    }

    /// Makes every `op` against `table` fail with a network error.
    pub fn fail(&self, table: Table, op: Op) {
        self.lock().failing.insert((table, op));
    }

    /// Fails every call with a network error while set.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    async fn enter(&self, table: Table, op: Op) -> Result<()> {
        let latency = {
            let mut inner = self.lock();
            *inner.calls.entry((table, op)).or_default() += 1;
            inner.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let inner = self.lock();
        if inner.offline || inner.failing.contains(&(table, op)) {
            return Err(Error::Network(format!("{table} {op:?} unavailable")));
        }
        Ok(())
    }
}

fn field_as_string(row: &Value, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn matches(row: &Value, condition: &Condition) -> bool {
    match condition {
        Condition::Eq(col, v) => field_as_string(row, col).as_deref() == Some(v.as_str()),
        Condition::Gte(col, v) => field_as_string(row, col).is_some_and(|f| f.as_str() >= v.as_str()),
    }
}

fn project(row: &Value, columns: &str) -> Value {
    if columns == "*" {
        return row.clone();
    }
    let mut out = serde_json::Map::new();
    for col in columns.split(',').map(str::trim) {
        if let Some(v) = row.get(col) {
            out.insert(col.to_string(), v.clone());
        }
    }
    Value::Object(out)
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn select(&self, table: Table, filter: &Filter) -> Result<Vec<Value>> {
        self.enter(table, Op::Select).await?;
        let inner = self.lock();
        let mut rows: Vec<Value> = inner
            .tables
            .get(&table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| filter.conditions.iter().all(|c| matches(row, c)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(col) = &filter.order_desc {
            rows.sort_by(|a, b| field_as_string(b, col).cmp(&field_as_string(a, col)));
        }
        if let Some(columns) = &filter.columns {
            rows = rows.iter().map(|r| project(r, columns)).collect();
        }
        Ok(rows)
    }

    async fn insert(&self, table: Table, rows: Vec<Value>) -> Result<()> {
        self.enter(table, Op::Insert).await?;
        self.lock().tables.entry(table).or_default().extend(rows);
        Ok(())
    }

    async fn update(&self, table: Table, key: &str, value: &str, patch: Value) -> Result<()> {
        self.enter(table, Op::Update).await?;
        let mut inner = self.lock();
        let condition = Condition::Eq(key.to_string(), value.to_string());
        let mut updated = 0;
        for row in inner.tables.entry(table).or_default().iter_mut() {
            if !matches(row, &condition) {
                continue;
            }
            if let (Value::Object(target), Value::Object(fields)) = (&mut *row, &patch) {
                for (k, v) in fields {
                    target.insert(k.clone(), v.clone());
                }
            }
            updated += 1;
        }
        if updated == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    async fn delete(&self, table: Table, key: &str, value: &str) -> Result<()> {
        self.enter(table, Op::Delete).await?;
        let condition = Condition::Eq(key.to_string(), value.to_string());
        self.lock()
            .tables
            .entry(table)
            .or_default()
            .retain(|row| !matches(row, &condition));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_update_merges_and_reports_missing() {
        let backend = MemoryBackend::new();
        backend.seed(Table::Roster, vec![json!({"id": "r1", "name": "Ana", "score": 1})]);

        backend
            .update(Table::Roster, "id", "r1", json!({"score": 5}))
            .await
            .unwrap();
        assert_eq!(backend.rows(Table::Roster)[0]["score"], json!(5));
        assert_eq!(backend.rows(Table::Roster)[0]["name"], json!("Ana"));

        let missing = backend
            .update(Table::Roster, "id", "r2", json!({"score": 1}))
            .await;
        assert!(matches!(missing, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn test_injected_failure_counts_call() {
        let backend = MemoryBackend::new();
        backend.fail(Table::AuditLog, Op::Insert);

        let result = backend.insert(Table::AuditLog, vec![json!({"id": "a"})]).await;
        assert!(matches!(result, Err(Error::Network(_))));
        assert_eq!(backend.calls(Table::AuditLog, Op::Insert), 1);
        assert!(backend.rows(Table::AuditLog).is_empty());
    }
}
