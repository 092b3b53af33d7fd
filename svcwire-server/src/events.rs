//! Server-side event listener registry.
//!
//! Listeners are bucketed by event name. Emission snapshots a bucket before
//! fan-out, so listeners can be added or removed while an emit is running.
//! Deliveries are queued on each connection's outbox without waiting; a full
//! outbox drops the delivery for that connection only.
//!
//! A key's entry stays locked while its bucket is edited, so the key table
//! and the buckets always describe the same listeners.

use crate::error::ServerError;
use crate::session::ConnectionId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use svcwire_protocol::message::{EventNotify, ListenerInfo, Message};
use svcwire_protocol::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Queue of outbound messages for one connection.
pub type Outbox = mpsc::Sender<Message>;

#[derive(Debug, Clone)]
struct Listener {
    connection: ConnectionId,
    key: String,
    info: Value,
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitReport {
    /// Listeners whose filter matched.
    pub matched: usize,
    /// Connections the notification was queued for.
    pub delivered: usize,
    /// Connections that could not take the notification.
    pub failed: usize,
}

/// Registry of event listeners across all connections.
#[derive(Default)]
pub struct EventRegistry {
    buckets: DashMap<String, Vec<Listener>>,
    /// (connection, key) to event name.
    keys: DashMap<(ConnectionId, String), String>,
    outboxes: DashMap<ConnectionId, Outbox>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a connection reachable for deliveries.
    pub fn attach(&self, connection: ConnectionId, outbox: Outbox) {
        self.outboxes.insert(connection, outbox);
    }

    /// Registers a listener. Keys are unique per connection while active.
    pub fn add(
        &self,
        connection: ConnectionId,
        key: &str,
        name: &str,
        info: Value,
    ) -> Result<(), ServerError> {
        // Lock order: key entry, then bucket.
        let Entry::Vacant(slot) = self.keys.entry((connection, key.to_string())) else {
            return Err(ServerError::DuplicateListener(key.to_string()));
        };
        self.buckets
            .entry(name.to_string())
            .or_default()
            .push(Listener {
                connection,
                key: key.to_string(),
                info,
            });
        slot.insert(name.to_string());
        debug!(connection, key, event = name, "listener added");
        Ok(())
    }

    /// Unregisters a listener. Returns false if it was not registered.
    pub fn remove(&self, connection: ConnectionId, key: &str) -> bool {
        let Entry::Occupied(entry) = self.keys.entry((connection, key.to_string())) else {
            return false;
        };
        let name = entry.get().clone();
        if let Some(mut bucket) = self.buckets.get_mut(&name) {
            bucket.retain(|l| !(l.connection == connection && l.key == key));
        }
        entry.remove();
        self.buckets.remove_if(&name, |_, bucket| bucket.is_empty());
        debug!(connection, key, event = %name, "listener removed");
        true
    }

    /// Drops every listener of a connection and detaches it. Returns the
    /// number of listeners removed.
    pub fn remove_all_for(&self, connection: ConnectionId) -> usize {
        self.outboxes.remove(&connection);
        let owned: Vec<String> = self
            .keys
            .iter()
            .filter(|e| e.key().0 == connection)
            .map(|e| e.key().1.clone())
            .collect();
        owned
            .iter()
            .filter(|key| self.remove(connection, key))
            .count()
    }

    /// Lists the listeners of `name`.
    pub fn infos(&self, name: &str) -> Vec<ListenerInfo> {
        self.buckets
            .get(name)
            .map(|bucket| {
                bucket
                    .iter()
                    .map(|l| ListenerInfo {
                        key: l.key.clone(),
                        info: l.info.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Delivers `data` to every listener of `name` whose filter matches.
    ///
    /// Each connection receives one notification carrying only its own
    /// matching keys. A filter that panics is logged and treated as not
    /// matching.
    pub fn emit<F>(&self, name: &str, data: &Value, match_fn: F) -> EmitReport
    where
        F: Fn(&Value, &Value) -> bool,
    {
        let snapshot = match self.buckets.get(name) {
            Some(bucket) => bucket.value().clone(),
            None => return EmitReport::default(),
        };

        let mut targets: BTreeMap<ConnectionId, Vec<String>> = BTreeMap::new();
        for listener in snapshot {
            match catch_unwind(AssertUnwindSafe(|| match_fn(&listener.info, data))) {
                Ok(true) => targets
                    .entry(listener.connection)
                    .or_default()
                    .push(listener.key),
                Ok(false) => {}
                Err(_) => warn!(
                    event = name,
                    key = %listener.key,
                    "event filter panicked, skipping listener"
                ),
            }
        }

        self.deliver(targets, data)
    }

    /// Delivers `data` to listeners by key, regardless of event name.
    pub fn emit_to_keys(&self, keys: &[String], data: &Value) -> EmitReport {
        let wanted: HashSet<&str> = keys.iter().map(String::as_str).collect();
        let mut targets: BTreeMap<ConnectionId, Vec<String>> = BTreeMap::new();
        for entry in self.keys.iter() {
            let (connection, key) = entry.key();
            if wanted.contains(key.as_str()) {
                targets.entry(*connection).or_default().push(key.clone());
            }
        }
        self.deliver(targets, data)
    }

    fn deliver(&self, targets: BTreeMap<ConnectionId, Vec<String>>, data: &Value) -> EmitReport {
        let mut report = EmitReport::default();
        for (connection, keys) in targets {
            report.matched += keys.len();
            let Some(outbox) = self.outboxes.get(&connection).map(|o| o.value().clone()) else {
                debug!(connection, "listener connection already gone");
                report.failed += 1;
                continue;
            };
            let notify = Message::EventNotify(EventNotify {
                keys,
                data: data.clone(),
            });
            match outbox.try_send(notify) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(connection, "outbox full, dropping event for lagging connection");
                    report.failed += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(connection, "outbox closed, dropping event");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Total number of registered listeners.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Number of event names with at least one listener.
    pub fn event_count(&self) -> usize {
        self.buckets.len()
    }
}
