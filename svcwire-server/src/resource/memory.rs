//! In-memory transactional key/value driver for development and tests.
//!
//! Payloads are objects with an `op` field:
//! `{op: "get", key}`, `{op: "set", key, value}`, `{op: "delete", key}`,
//! `{op: "list", prefix?}`. Every op returns rows: `[{key, value}]` for
//! reads and `[{affected}]` for writes. Writes inside a transaction are
//! buffered and only become visible to other connections on commit.

use super::{ResourceConnection, ResourceDriver, ResourceError};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use svcwire_protocol::Value;

type Store = Arc<RwLock<BTreeMap<String, Value>>>;

const DEFAULT_DATABASE: &str = "default";

/// Driver holding named in-memory databases.
#[derive(Default)]
pub struct MemoryDriver {
    databases: DashMap<String, Store>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResourceDriver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self, config: &Value) -> Result<Box<dyn ResourceConnection>, ResourceError> {
        let database = match config.get("database") {
            None | Some(Value::Null) => DEFAULT_DATABASE.to_string(),
            Some(v) => v
                .as_str()
                .ok_or_else(|| ResourceError::Driver("database must be a string".into()))?
                .to_string(),
        };
        let store = self.databases.entry(database).or_default().value().clone();
        Ok(Box::new(MemoryConnection {
            store,
            pending: None,
            closed: false,
        }))
    }
}

struct MemoryConnection {
    store: Store,
    /// Buffered writes of the open transaction; `None` marks a delete.
    pending: Option<BTreeMap<String, Option<Value>>>,
    closed: bool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), ResourceError> {
        if self.closed {
            return Err(ResourceError::Driver("connection closed".into()));
        }
        Ok(())
    }

    fn read(&self, key: &str) -> Option<Value> {
        if let Some(pending) = &self.pending {
            if let Some(buffered) = pending.get(key) {
                return buffered.clone();
            }
        }
        self.store.read().get(key).cloned()
    }

    fn write(&mut self, key: String, value: Option<Value>) -> bool {
        let existed = self.read(&key).is_some();
        match &mut self.pending {
            Some(pending) => {
                pending.insert(key, value);
            }
            None => {
                let mut store = self.store.write();
                match value {
                    Some(v) => {
                        store.insert(key, v);
                    }
                    None => {
                        store.remove(&key);
                    }
                }
            }
        }
        existed
    }

    fn list(&self, prefix: &str) -> Vec<(String, Value)> {
        let mut merged: BTreeMap<String, Value> = self
            .store
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(pending) = &self.pending {
            for (k, v) in pending.iter().filter(|(k, _)| k.starts_with(prefix)) {
                match v {
                    Some(v) => {
                        merged.insert(k.clone(), v.clone());
                    }
                    None => {
                        merged.remove(k);
                    }
                }
            }
        }
        merged.into_iter().collect()
    }
}

fn row(key: String, value: Value) -> Value {
    Value::object([("key", Value::from(key)), ("value", value)])
}

fn affected(n: u64) -> Value {
    Value::Array(vec![Value::object([("affected", Value::from(n))])])
}

fn key_of(payload: &Value) -> Result<String, ResourceError> {
    payload
        .get("key")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ResourceError::Driver("missing key".into()))
}

#[async_trait]
impl ResourceConnection for MemoryConnection {
    async fn begin(&mut self) -> Result<(), ResourceError> {
        self.ensure_open()?;
        self.pending = Some(BTreeMap::new());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), ResourceError> {
        self.ensure_open()?;
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        let mut store = self.store.write();
        for (key, value) in pending {
            match value {
                Some(v) => {
                    store.insert(key, v);
                }
                None => {
                    store.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), ResourceError> {
        self.ensure_open()?;
        self.pending = None;
        Ok(())
    }

    async fn execute(&mut self, payload: Value) -> Result<Value, ResourceError> {
        self.ensure_open()?;
        let op = payload
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(|| ResourceError::Driver("missing op".into()))?;

        match op {
            "get" => {
                let key = key_of(&payload)?;
                let rows = self
                    .read(&key)
                    .map(|v| vec![row(key, v)])
                    .unwrap_or_default();
                Ok(Value::Array(rows))
            }
            "set" => {
                let key = key_of(&payload)?;
                let value = payload.get("value").cloned().unwrap_or_default();
                self.write(key, Some(value));
                Ok(affected(1))
            }
            "delete" => {
                let key = key_of(&payload)?;
                let existed = self.write(key, None);
                Ok(affected(u64::from(existed)))
            }
            "list" => {
                let prefix = payload.get("prefix").and_then(Value::as_str).unwrap_or("");
                let rows = self
                    .list(prefix)
                    .into_iter()
                    .map(|(k, v)| row(k, v))
                    .collect();
                Ok(Value::Array(rows))
            }
            other => Err(ResourceError::Driver(format!("unknown op '{other}'"))),
        }
    }

    async fn close(&mut self) -> Result<(), ResourceError> {
        self.pending = None;
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(op: &str, fields: &[(&str, Value)]) -> Value {
        let mut entries = vec![("op".to_string(), Value::from(op))];
        entries.extend(fields.iter().map(|(k, v)| (k.to_string(), v.clone())));
        Value::object(entries)
    }

    #[tokio::test]
    async fn test_transaction_isolation() {
        let driver = MemoryDriver::new();
        let mut a = driver.connect(&Value::Null).await.unwrap();
        let mut b = driver.connect(&Value::Null).await.unwrap();

        a.begin().await.unwrap();
        a.execute(op("set", &[("key", "x".into()), ("value", 1.into())]))
            .await
            .unwrap();

        let seen = a.execute(op("get", &[("key", "x".into())])).await.unwrap();
        assert_eq!(seen.as_array().map(Vec::len), Some(1));
        let unseen = b.execute(op("get", &[("key", "x".into())])).await.unwrap();
        assert_eq!(unseen.as_array().map(Vec::len), Some(0));

        a.commit().await.unwrap();
        let seen = b.execute(op("get", &[("key", "x".into())])).await.unwrap();
        assert_eq!(
            seen.as_array().and_then(|rows| rows[0].get("value").cloned()),
            Some(Value::from(1))
        );
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let driver = MemoryDriver::new();
        let mut conn = driver.connect(&Value::Null).await.unwrap();
        for key in ["user:1", "user:2", "order:1"] {
            conn.execute(op("set", &[("key", key.into()), ("value", true.into())]))
                .await
                .unwrap();
        }
        conn.begin().await.unwrap();
        let deleted = conn
            .execute(op("delete", &[("key", "user:1".into())]))
            .await
            .unwrap();
        assert_eq!(
            deleted.as_array().and_then(|r| r[0].get("affected").and_then(Value::as_u64)),
            Some(1)
        );

        let rows = conn
            .execute(op("list", &[("prefix", "user:".into())]))
            .await
            .unwrap();
        let keys: Vec<&str> = rows
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|r| r.get("key").and_then(Value::as_str))
            .collect();
        assert_eq!(keys, vec!["user:2"]);
    }

    #[tokio::test]
    async fn test_separate_databases() {
        let driver = MemoryDriver::new();
        let config = Value::object([("database", "other")]);
        let mut a = driver.connect(&config).await.unwrap();
        let mut b = driver.connect(&Value::Null).await.unwrap();
        a.execute(op("set", &[("key", "k".into()), ("value", 1.into())]))
            .await
            .unwrap();
        let rows = b.execute(op("get", &[("key", "k".into())])).await.unwrap();
        assert_eq!(rows.as_array().map(Vec::len), Some(0));
    }

    #[tokio::test]
    async fn test_unknown_op_and_closed() {
        let driver = MemoryDriver::new();
        let mut conn = driver.connect(&Value::Null).await.unwrap();
        assert!(conn.execute(op("drop", &[])).await.is_err());
        conn.close().await.unwrap();
        assert!(conn.execute(op("list", &[])).await.is_err());
    }
}
