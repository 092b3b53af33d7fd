//! Client-side listener table.
//!
//! Each registration owns a channel; deliveries for its key are pushed into
//! that channel. The table outlives a single socket so that listeners can be
//! registered again after a reconnect.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use svcwire_protocol::{EventNotify, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

struct Listener {
    name: String,
    info: Value,
    tx: mpsc::UnboundedSender<Value>,
}

/// Registration data re-sent to the server after reconnecting.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub key: String,
    pub name: String,
    pub info: Value,
}

/// Receiving end of one listener registration.
#[derive(Debug)]
pub struct EventSubscription {
    key: String,
    name: String,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl EventSubscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receives the next event payload. Returns `None` once the listener is
    /// removed.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Returns an already-delivered payload without waiting.
    pub fn try_recv(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }
}

/// Listener table shared by a connection and its read loop.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<Mutex<HashMap<String, Listener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener locally and returns its subscription.
    pub fn insert(&self, key: String, name: String, info: Value) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().insert(
            key.clone(),
            Listener {
                name: name.clone(),
                info,
                tx,
            },
        );
        EventSubscription { key, name, rx }
    }

    /// Removes a listener locally. Its subscription sees end-of-stream.
    pub fn remove(&self, key: &str) -> bool {
        self.listeners.lock().remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.listeners.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    /// Snapshot of every registration.
    pub fn registrations(&self) -> Vec<Registration> {
        self.listeners
            .lock()
            .iter()
            .map(|(key, l)| Registration {
                key: key.clone(),
                name: l.name.clone(),
                info: l.info.clone(),
            })
            .collect()
    }

    /// Delivers an event to every local listener named in it.
    ///
    /// Returns the number of deliveries. A listener whose receiver is gone
    /// is logged and skipped; the others still receive the event.
    pub fn dispatch(&self, notify: EventNotify) -> usize {
        let listeners = self.listeners.lock();
        let mut delivered = 0;
        for key in &notify.keys {
            match listeners.get(key) {
                Some(listener) => {
                    if listener.tx.send(notify.data.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        warn!(key = %key, event = %listener.name, "listener dropped its subscription");
                    }
                }
                None => debug!(key = %key, "event for unknown listener key"),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notify(keys: &[&str], data: Value) -> EventNotify {
        EventNotify {
            keys: keys.iter().map(|k| k.to_string()).collect(),
            data,
        }
    }

    #[tokio::test]
    async fn test_dispatch_to_named_keys() {
        let bus = EventBus::new();
        let mut a = bus.insert("k1".into(), "UserChanged".into(), Value::Null);
        let mut b = bus.insert("k2".into(), "UserChanged".into(), Value::Null);

        let delivered = bus.dispatch(notify(&["k1"], Value::from("hello")));
        assert_eq!(delivered, 1);
        assert_eq!(a.recv().await, Some(Value::from("hello")));
        assert_eq!(b.try_recv(), None);
    }

    #[test]
    fn test_dropped_subscription_does_not_block_others() {
        let bus = EventBus::new();
        let dropped = bus.insert("k1".into(), "E".into(), Value::Null);
        let mut live = bus.insert("k2".into(), "E".into(), Value::Null);
        drop(dropped);

        let delivered = bus.dispatch(notify(&["k1", "k2", "k3"], Value::from(1)));
        assert_eq!(delivered, 1);
        assert_eq!(live.try_recv(), Some(Value::from(1)));
    }

    #[tokio::test]
    async fn test_remove_ends_subscription() {
        let bus = EventBus::new();
        let mut sub = bus.insert("k1".into(), "E".into(), Value::Null);
        assert!(bus.remove("k1"));
        assert!(!bus.remove("k1"));
        assert_eq!(sub.recv().await, None);
    }

    #[test]
    fn test_registrations_snapshot() {
        let bus = EventBus::new();
        let info = Value::object([("dept", "dev")]);
        let _sub = bus.insert("k1".into(), "UserChanged".into(), info.clone());

        let regs = bus.registrations();
        assert_eq!(
            regs,
            vec![Registration {
                key: "k1".into(),
                name: "UserChanged".into(),
                info,
            }]
        );
    }
}
