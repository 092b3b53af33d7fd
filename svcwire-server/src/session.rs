//! Session management.
//!
//! A [`Session`] is one live connection after its handshake. It carries the
//! caller's identity and permissions, a per-connection cache of service
//! method tables, and the close hooks that release everything the
//! connection owns.

use crate::auth::Permissions;
use crate::events::EventRegistry;
use crate::resource::ResourceTable;
use crate::service::{MethodTable, ServiceContext};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Server-assigned connection id. Never reused within a process.
pub type ConnectionId = u64;

type CloseHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Waiting for the hello frame.
    Connecting = 0,
    /// Handshake complete, serving requests.
    Open = 1,
    /// Close hooks are running.
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Connecting,
            1 => SessionState::Open,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// A client session.
pub struct Session {
    /// Remote address.
    pub remote_addr: SocketAddr,
    context: Arc<ServiceContext>,
    authenticated: bool,
    state: AtomicU8,
    request_count: AtomicU64,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    /// Method tables built for this connection, by service name.
    methods: Mutex<HashMap<String, Arc<MethodTable>>>,
    close_hooks: Mutex<Vec<CloseHook>>,
}

impl Session {
    /// Creates a session in the `Connecting` state.
    pub fn new(
        remote_addr: SocketAddr,
        identity: Identity,
        events: Arc<EventRegistry>,
        resources: Arc<ResourceTable>,
    ) -> Self {
        let context = ServiceContext {
            connection_id: identity.connection_id,
            client_id: identity.client_id,
            client_name: identity.client_name,
            permissions: identity.permissions,
            events,
            resources,
        };
        Self {
            remote_addr,
            context: Arc::new(context),
            authenticated: identity.authenticated,
            state: AtomicU8::new(SessionState::Connecting as u8),
            request_count: AtomicU64::new(0),
            created_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            methods: Mutex::new(HashMap::new()),
            close_hooks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.context.connection_id
    }

    pub fn client_id(&self) -> &str {
        &self.context.client_id
    }

    /// Returns the client name.
    pub fn client_name(&self) -> Option<&str> {
        self.context.client_name.as_deref()
    }

    /// Returns whether the session is authenticated.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn permissions(&self) -> &Permissions {
        &self.context.permissions
    }

    /// Context handed to service factories.
    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.context
    }

    /// Returns the session state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Marks the handshake as complete.
    pub fn open(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Connecting as u8,
                SessionState::Open as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Records a request.
    pub fn record_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Records inbound activity of any kind.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Returns the request count.
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Returns the time since last activity.
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Returns the session age.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Returns the cached method table of a service, building it on first
    /// use. A failed build is not cached.
    pub fn method_table<E>(
        &self,
        service: &str,
        build: impl FnOnce(&ServiceContext) -> Result<MethodTable, E>,
    ) -> Result<Arc<MethodTable>, E> {
        let mut methods = self.methods.lock();
        if let Some(table) = methods.get(service) {
            return Ok(table.clone());
        }
        let table = Arc::new(build(&self.context)?);
        methods.insert(service.to_string(), table.clone());
        Ok(table)
    }

    /// Registers a hook to run when the session closes. Hooks run once, in
    /// registration order.
    pub fn on_close<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.close_hooks
            .lock()
            .push(Box::new(move || Box::pin(hook())));
    }

    /// Moves to `Closing`, runs the close hooks, then moves to `Closed`.
    ///
    /// Only the first call runs the hooks; later calls return false.
    pub async fn close(&self) -> bool {
        let prev = self.state.swap(SessionState::Closing as u8, Ordering::SeqCst);
        if matches!(
            SessionState::from_u8(prev),
            SessionState::Closing | SessionState::Closed
        ) {
            self.state.store(prev, Ordering::SeqCst);
            return false;
        }

        let hooks: Vec<CloseHook> = std::mem::take(&mut *self.close_hooks.lock());
        for hook in hooks {
            hook().await;
        }
        self.methods.lock().clear();
        self.state
            .store(SessionState::Closed as u8, Ordering::SeqCst);
        true
    }
}

/// Who is on the other end of a connection, settled at handshake.
#[derive(Debug, Clone)]
pub struct Identity {
    pub connection_id: ConnectionId,
    pub client_id: String,
    pub client_name: Option<String>,
    pub authenticated: bool,
    pub permissions: Permissions,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 12345)
    }

    fn test_session() -> Session {
        let identity = Identity {
            connection_id: 9,
            client_id: "client-a".into(),
            client_name: Some("admin".into()),
            authenticated: true,
            permissions: Permissions::from(["admin".to_string()]),
        };
        Session::new(
            test_addr(),
            identity,
            Arc::new(EventRegistry::new()),
            Arc::new(ResourceTable::new(None)),
        )
    }

    #[test]
    fn test_session_creation() {
        let session = test_session();
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(session.id(), 9);
        assert_eq!(session.client_name(), Some("admin"));
        assert!(session.permissions().contains("admin"));

        assert!(session.open());
        assert!(!session.open());
        assert_eq!(session.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn test_close_hooks_run_in_order_once() {
        let session = test_session();
        session.open();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            session.on_close(move || async move {
                order.lock().push(i);
            });
        }

        assert!(session.close().await);
        assert!(!session.close().await);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_method_table_built_once() {
        let session = test_session();
        let builds = Arc::new(AtomicU64::new(0));
        for _ in 0..3 {
            let builds = builds.clone();
            session
                .method_table("Echo", move |ctx| {
                    assert_eq!(ctx.connection_id, 9);
                    builds.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>(MethodTable::new())
                })
                .unwrap();
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_method_table_not_cached() {
        let session = test_session();
        assert!(session
            .method_table("Echo", |_| Err::<MethodTable, _>("boom"))
            .is_err());
        let rebuilt = session.method_table("Echo", |_| Ok::<_, &str>(MethodTable::new()));
        assert!(rebuilt.is_ok());
    }

    #[test]
    fn test_request_accounting() {
        let session = test_session();
        session.record_request();
        session.record_request();
        assert_eq!(session.request_count(), 2);
        assert!(session.idle_duration() < Duration::from_secs(5));
    }
}
