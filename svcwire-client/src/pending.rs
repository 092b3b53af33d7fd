//! Table of in-flight requests awaiting a reply.
//!
//! Replies are matched purely by request id, so they may arrive in any
//! order. A [`Waiter`] removes its own entry when it times out or is
//! dropped, which is how a caller abandons a request.

use crate::error::ClientError;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use svcwire_protocol::Value;
use tokio::sync::oneshot;

/// Outcome delivered to a waiter.
pub type Reply = Result<Value, ClientError>;

type Slots = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// Pending-request table, private to one connection.
#[derive(Clone, Default)]
pub struct PendingTable {
    slots: Slots,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request id and returns the waiter that will receive its
    /// reply.
    pub fn register(&self, id: u64, timeout: Option<Duration>) -> Result<Waiter, ClientError> {
        let (tx, rx) = oneshot::channel();
        match self.slots.lock().entry(id) {
            Entry::Occupied(_) => return Err(ClientError::DuplicateRequestId(id)),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        Ok(Waiter {
            id,
            rx,
            timeout,
            slots: self.slots.clone(),
        })
    }

    /// Settles a request successfully. No-op if the id is not pending.
    pub fn resolve(&self, id: u64, body: Value) -> bool {
        self.settle(id, Ok(body))
    }

    /// Settles a request with an error. No-op if the id is not pending.
    pub fn reject(&self, id: u64, error: ClientError) -> bool {
        self.settle(id, Err(error))
    }

    /// Rejects every pending request. Returns how many were rejected.
    pub fn reject_all(&self, make_error: impl Fn() -> ClientError) -> usize {
        let drained: Vec<_> = self.slots.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(make_error()));
        }
        count
    }

    pub fn contains(&self, id: u64) -> bool {
        self.slots.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    fn settle(&self, id: u64, reply: Reply) -> bool {
        let tx = self.slots.lock().remove(&id);
        match tx {
            // The receiver may already be gone if the caller gave up.
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }
}

/// Handle for one in-flight request.
pub struct Waiter {
    id: u64,
    rx: oneshot::Receiver<Reply>,
    timeout: Option<Duration>,
    slots: Slots,
}

impl Waiter {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the reply, honoring the waiter's timeout.
    pub async fn wait(mut self) -> Reply {
        let reply = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, &mut self.rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    tracing::debug!(id = self.id, "request timed out");
                    return Err(ClientError::Timeout);
                }
            },
            None => (&mut self.rx).await,
        };
        reply.unwrap_or(Err(ClientError::ConnectionClosed))
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.slots.lock().remove(&self.id);
    }
}
