//! Resource proxy layer.
//!
//! A client opens a stateful server-side resource (a database connection,
//! typically) and then drives it through a numeric session id. The table is
//! shared by every connection; each entry remembers the connection that
//! opened it, and only that connection may use it. When a connection closes,
//! everything it owns is rolled back and closed.

pub mod memory;

use crate::session::ConnectionId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use svcwire_protocol::{ErrorCode, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub use memory::MemoryDriver;

/// Resource proxy errors.
#[derive(Debug, Clone, Error)]
pub enum ResourceError {
    #[error("no resource driver configured")]
    NoDriver,

    #[error("resource session {0} not found")]
    NotFound(u64),

    #[error("resource session {0} belongs to another connection")]
    NotOwner(u64),

    #[error("transaction already active")]
    TransactionActive,

    #[error("no active transaction")]
    NoTransaction,

    #[error("driver error: {0}")]
    Driver(String),
}

impl ResourceError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ResourceError::NotFound(_) | ResourceError::NotOwner(_) => ErrorCode::ResourceNotFound,
            _ => ErrorCode::ResourceError,
        }
    }
}

/// Opens connections to a backing resource.
#[async_trait]
pub trait ResourceDriver: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self, config: &Value) -> Result<Box<dyn ResourceConnection>, ResourceError>;
}

/// One open connection to a backing resource. Payloads pass through
/// untouched.
#[async_trait]
pub trait ResourceConnection: Send {
    async fn begin(&mut self) -> Result<(), ResourceError>;

    async fn commit(&mut self) -> Result<(), ResourceError>;

    async fn rollback(&mut self) -> Result<(), ResourceError>;

    async fn execute(&mut self, payload: Value) -> Result<Value, ResourceError>;

    async fn close(&mut self) -> Result<(), ResourceError>;
}

struct Handle {
    conn: Box<dyn ResourceConnection>,
    in_transaction: bool,
}

struct Slot {
    owner: ConnectionId,
    handle: Mutex<Handle>,
}

/// Process-wide table of open resource sessions.
pub struct ResourceTable {
    driver: Option<Arc<dyn ResourceDriver>>,
    sessions: DashMap<u64, Arc<Slot>>,
    next_id: AtomicU64,
}

impl ResourceTable {
    pub fn new(driver: Option<Arc<dyn ResourceDriver>>) -> Self {
        Self {
            driver,
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn has_driver(&self) -> bool {
        self.driver.is_some()
    }

    /// Connects through the driver and returns a fresh session id.
    pub async fn open(&self, owner: ConnectionId, config: &Value) -> Result<u64, ResourceError> {
        let driver = self.driver.as_ref().ok_or(ResourceError::NoDriver)?;
        let conn = driver.connect(config).await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sessions.insert(
            id,
            Arc::new(Slot {
                owner,
                handle: Mutex::new(Handle {
                    conn,
                    in_transaction: false,
                }),
            }),
        );
        debug!(connection = owner, session = id, driver = driver.name(), "resource opened");
        Ok(id)
    }

    fn slot(&self, owner: ConnectionId, id: u64) -> Result<Arc<Slot>, ResourceError> {
        let slot = self
            .sessions
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or(ResourceError::NotFound(id))?;
        if slot.owner != owner {
            return Err(ResourceError::NotOwner(id));
        }
        Ok(slot)
    }

    pub async fn execute(
        &self,
        owner: ConnectionId,
        id: u64,
        payload: Value,
    ) -> Result<Value, ResourceError> {
        let slot = self.slot(owner, id)?;
        let mut handle = slot.handle.lock().await;
        handle.conn.execute(payload).await
    }

    pub async fn begin(&self, owner: ConnectionId, id: u64) -> Result<(), ResourceError> {
        let slot = self.slot(owner, id)?;
        let mut handle = slot.handle.lock().await;
        if handle.in_transaction {
            return Err(ResourceError::TransactionActive);
        }
        handle.conn.begin().await?;
        handle.in_transaction = true;
        Ok(())
    }

    pub async fn commit(&self, owner: ConnectionId, id: u64) -> Result<(), ResourceError> {
        let slot = self.slot(owner, id)?;
        let mut handle = slot.handle.lock().await;
        if !handle.in_transaction {
            return Err(ResourceError::NoTransaction);
        }
        handle.conn.commit().await?;
        handle.in_transaction = false;
        Ok(())
    }

    pub async fn rollback(&self, owner: ConnectionId, id: u64) -> Result<(), ResourceError> {
        let slot = self.slot(owner, id)?;
        let mut handle = slot.handle.lock().await;
        if !handle.in_transaction {
            return Err(ResourceError::NoTransaction);
        }
        handle.conn.rollback().await?;
        handle.in_transaction = false;
        Ok(())
    }

    /// Closes one session. An open transaction is rolled back first.
    pub async fn close(&self, owner: ConnectionId, id: u64) -> Result<(), ResourceError> {
        self.slot(owner, id)?;
        let Some((_, slot)) = self.sessions.remove(&id) else {
            return Err(ResourceError::NotFound(id));
        };
        Self::shutdown(id, &slot).await
    }

    /// Force-closes every session owned by a connection.
    pub async fn close_all_for(&self, owner: ConnectionId) -> usize {
        let ids: Vec<u64> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().owner == owner)
            .map(|entry| *entry.key())
            .collect();

        let mut closed = 0;
        for id in ids {
            if let Some((_, slot)) = self.sessions.remove(&id) {
                if let Err(e) = Self::shutdown(id, &slot).await {
                    warn!(connection = owner, session = id, error = %e, "resource close failed");
                }
                closed += 1;
            }
        }
        if closed > 0 {
            debug!(connection = owner, closed, "released resource sessions");
        }
        closed
    }

    async fn shutdown(id: u64, slot: &Slot) -> Result<(), ResourceError> {
        let mut handle = slot.handle.lock().await;
        if handle.in_transaction {
            handle.in_transaction = false;
            if let Err(e) = handle.conn.rollback().await {
                warn!(session = id, error = %e, "rollback on close failed");
            }
        }
        handle.conn.close().await
    }

    /// Number of sessions owned by a connection.
    pub fn count_for(&self, owner: ConnectionId) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().owner == owner)
            .count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
