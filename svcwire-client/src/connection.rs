//! Connection management.
//!
//! A [`Connection`] owns one socket. After the handshake a background task
//! reads frames and routes them: replies settle the pending table, events go
//! to the listener table, progress and reload notices are broadcast. Any
//! number of requests may be in flight at once.

use crate::error::ClientError;
use crate::events::{EventBus, EventSubscription};
use crate::pending::PendingTable;
use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use svcwire_protocol::codec::{self, Decoder, Encoder, Inbound, SplitConfig};
use svcwire_protocol::message::*;
use svcwire_protocol::{Value, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Default upload fragment size (300 KiB).
pub const DEFAULT_UPLOAD_CHUNK: usize = 300 * 1024;

/// Capacity of the progress and reload broadcast channels.
const NOTICE_CHANNEL_CAPACITY: usize = 256;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Request timeout.
    pub request_timeout: Duration,
    /// Stable client identity, reused across reconnects.
    pub client_id: String,
    /// Client name; reload notices for other names are ignored.
    pub client_name: Option<String>,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Authentication token (optional).
    pub auth_token: Option<String>,
    /// Outbound splitting limits.
    pub split: SplitConfig,
    /// Idle time after which a partial inbound transfer is dropped.
    pub reassembly_timeout: Duration,
    /// Client-side ping interval. `None` relies on server pings.
    pub heartbeat_interval: Option<Duration>,
    /// Extra attempts for a failed upload fragment.
    pub upload_retries: u32,
    /// Automatic reconnection after an unrequested close. `None` disables it.
    pub reconnect: Option<ReconnectPolicy>,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            client_id: Uuid::new_v4().to_string(),
            client_name: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            auth_token: None,
            split: SplitConfig::default(),
            reassembly_timeout: Duration::from_secs(60),
            heartbeat_interval: None,
            upload_retries: 3,
            reconnect: None,
        }
    }

    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_split(mut self, threshold: usize, chunk_size: usize) -> Self {
        self.split.threshold = threshold;
        self.split.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn with_upload_retries(mut self, retries: u32) -> Self {
        self.upload_retries = retries;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }
}

/// When and how fast to reconnect after the server side drops a connection.
///
/// Delays grow exponentially from `base_delay`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max.max(base);
        self
    }

    /// Whether attempt number `attempt` (starting at 1) should be made.
    pub fn should_reconnect(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }

    /// Delay before attempt number `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Which way a transfer is going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Outbound,
    Inbound,
}

/// Progress of a split message or file upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub direction: TransferDirection,
    /// Split transfer id; `None` for uploads.
    pub transfer: Option<Uuid>,
    /// Originating request, when known.
    pub request_id: Option<u64>,
    pub total_size: u64,
    pub completed_size: u64,
}

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A connection to a svcwire server.
pub struct Connection {
    config: ConnectionConfig,
    encoder: Encoder,
    /// Write half; every outbound frame goes through this lock.
    writer: Mutex<Option<BoxWriter>>,
    pending: PendingTable,
    events: EventBus,
    /// Outbound split transfers still in flight, mapped to their request.
    transfers: SyncMutex<HashMap<Uuid, u64>>,
    upload_acks: SyncMutex<HashMap<(u64, u64), oneshot::Sender<UploadAck>>>,
    pongs: SyncMutex<HashMap<u64, oneshot::Sender<()>>>,
    next_id: AtomicU64,
    state: AtomicU8,
    welcome: SyncMutex<Option<Welcome>>,
    progress: broadcast::Sender<TransferProgress>,
    reloads: broadcast::Sender<Reload>,
    closing: watch::Sender<bool>,
    /// Set by [`Connection::close`]; suppresses automatic reconnection.
    closed_by_client: AtomicBool,
    /// Whether the session was dialed over TCP, so it can be dialed again.
    dialed: AtomicBool,
    tasks: SyncMutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        let (progress, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        let (reloads, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        let (closing, _) = watch::channel(false);
        Self {
            encoder: Encoder::new(config.split),
            config,
            writer: Mutex::new(None),
            pending: PendingTable::new(),
            events: EventBus::new(),
            transfers: SyncMutex::new(HashMap::new()),
            upload_acks: SyncMutex::new(HashMap::new()),
            pongs: SyncMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            state: AtomicU8::new(ConnectionState::Closed as u8),
            welcome: SyncMutex::new(None),
            progress,
            reloads,
            closing,
            closed_by_client: AtomicBool::new(false),
            dialed: AtomicBool::new(false),
            tasks: SyncMutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Returns whether the connection is open.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Server handshake reply of the current session.
    pub fn welcome(&self) -> Option<Welcome> {
        self.welcome.lock().clone()
    }

    /// Listener table, kept across reconnects.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribes to transfer progress notices.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<TransferProgress> {
        self.progress.subscribe()
    }

    /// Subscribes to reload notices addressed to this client.
    pub fn subscribe_reloads(&self) -> broadcast::Receiver<Reload> {
        self.reloads.subscribe()
    }

    /// Returns the number of pending requests.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }

    /// Connects to the configured address over TCP.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        debug!("Connecting to {}...", self.config.addr);

        let tcp_stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.addr),
        )
        .await
        .map_err(|_| ClientError::Timeout)??;

        tcp_stream.set_nodelay(true).ok();
        self.establish(tcp_stream, true).await
    }

    /// Runs the handshake over an established stream and starts the
    /// background tasks. Such a session is never reconnected automatically.
    pub async fn connect_with<S>(self: &Arc<Self>, stream: S) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.establish(stream, false).await
    }

    async fn establish<S>(self: &Arc<Self>, stream: S, dialed: bool) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        match self.state() {
            ConnectionState::Open | ConnectionState::Connecting => {
                return Err(ClientError::Handshake("connection already in use".into()))
            }
            ConnectionState::Closing | ConnectionState::Closed => {}
        }
        self.set_state(ConnectionState::Connecting);

        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut decoder = Decoder::new(
            self.config.split.max_message_size,
            self.config.reassembly_timeout,
        );

        let handshake = tokio::time::timeout(
            self.config.request_timeout,
            self.handshake(&mut reader, &mut writer, &mut decoder),
        )
        .await;
        let welcome = match handshake {
            Ok(Ok(welcome)) => welcome,
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Closed);
                return Err(e);
            }
            Err(_) => {
                self.set_state(ConnectionState::Closed);
                return Err(ClientError::Timeout);
            }
        };

        info!(
            connection_id = welcome.connection_id,
            server = %welcome.server_name,
            "connected"
        );

        let progress = self.progress.clone();
        decoder.reassembler_mut().set_observer(move |p| {
            let _ = progress.send(TransferProgress {
                direction: TransferDirection::Inbound,
                transfer: Some(p.id),
                request_id: None,
                total_size: p.total_size,
                completed_size: p.completed_size,
            });
        });

        *self.writer.lock().await = Some(Box::new(writer));
        *self.welcome.lock() = Some(welcome);
        self.closing.send_replace(false);
        self.closed_by_client.store(false, Ordering::SeqCst);
        self.dialed.store(dialed, Ordering::SeqCst);
        self.set_state(ConnectionState::Open);

        let mut tasks = vec![tokio::spawn(self.clone().read_loop(reader, decoder))];
        if let Some(interval) = self.config.heartbeat_interval {
            tasks.push(tokio::spawn(self.clone().heartbeat_loop(interval)));
        }
        {
            let mut slots = self.tasks.lock();
            slots.retain(|t| !t.is_finished());
            slots.extend(tasks);
        }

        self.restore_listeners().await;
        Ok(())
    }

    async fn handshake<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        decoder: &mut Decoder,
    ) -> Result<Welcome, ClientError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let hello = Message::Hello(Hello {
            protocol_version: PROTOCOL_VERSION,
            client_id: self.config.client_id.clone(),
            client_name: self.config.client_name.clone(),
            token: self.config.auth_token.clone(),
        });
        writer.write_all(&codec::encode_frame(&hello)?).await?;
        writer.flush().await?;

        let mut buf = vec![0u8; self.config.read_buffer_size];
        loop {
            while let Some(item) = decoder.next_inbound()? {
                match item {
                    Inbound::Message(Message::Welcome(welcome)) => return Ok(welcome),
                    Inbound::Message(Message::Error(err)) => return Err(err.into()),
                    Inbound::Message(other) => {
                        return Err(ClientError::Handshake(format!(
                            "unexpected {} before welcome",
                            other.kind()
                        )))
                    }
                    Inbound::Progress(_) => {}
                    Inbound::Rejected(r) => return Err(r.error.into()),
                }
            }

            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Err(ClientError::ConnectionClosed);
            }
            decoder.extend(&buf[..n]);
        }
    }

    async fn restore_listeners(&self) {
        let registrations = self.events.registrations();
        if registrations.is_empty() {
            return;
        }
        debug!(count = registrations.len(), "re-registering listeners");
        for reg in registrations {
            let key = reg.key.clone();
            let result = self
                .request(
                    |id| {
                        Message::EventAdd(EventAdd {
                            id,
                            key: reg.key,
                            name: reg.name,
                            info: reg.info,
                        })
                    },
                    Some(self.config.request_timeout),
                )
                .await;
            if let Err(e) = result {
                warn!(key = %key, error = %e, "failed to re-register listener");
            }
        }
    }

    /// Closes the connection, rejecting every pending request.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.closed_by_client.store(true, Ordering::SeqCst);
        self.shutdown("closed by client").await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }

    async fn shutdown(&self, reason: &str) {
        let prev = ConnectionState::from_u8(
            self.state
                .swap(ConnectionState::Closing as u8, Ordering::SeqCst),
        );
        if matches!(prev, ConnectionState::Closed | ConnectionState::Closing) {
            self.state.store(prev as u8, Ordering::SeqCst);
            return;
        }
        debug!(reason, "closing connection");
        self.closing.send_replace(true);

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        let rejected = self.pending.reject_all(|| ClientError::ConnectionClosed);
        self.upload_acks.lock().clear();
        self.pongs.lock().clear();
        self.transfers.lock().clear();
        self.set_state(ConnectionState::Closed);
        info!(reason, rejected, "connection closed");
    }

    async fn read_loop<R>(self: Arc<Self>, mut reader: R, mut decoder: Decoder)
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; self.config.read_buffer_size];
        let mut closing = self.closing.subscribe();
        let mut purge = tokio::time::interval(self.config.reassembly_timeout.max(Duration::from_secs(1)));
        purge.tick().await;

        let reason = loop {
            tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break "connection closed by server".to_string(),
                    Ok(n) => {
                        decoder.extend(&buf[..n]);
                        if let Err(e) = self.drain(&mut decoder).await {
                            break format!("protocol error: {e}");
                        }
                    }
                    Err(e) => break format!("read error: {e}"),
                },
                _ = purge.tick() => {
                    for transfer in decoder.purge_expired(Instant::now()) {
                        warn!(%transfer, "dropping stale inbound transfer");
                    }
                }
                _ = closing.changed() => break "closed locally".to_string(),
            }
        };

        self.shutdown(&reason).await;

        if self.config.reconnect.is_some()
            && self.dialed.load(Ordering::SeqCst)
            && !self.closed_by_client.load(Ordering::SeqCst)
        {
            let handle = tokio::spawn(self.clone().reconnect_loop());
            self.tasks.lock().push(handle);
        }
    }

    /// Dials again until the policy gives up or the client closes.
    fn reconnect_loop(self: Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let Some(policy) = self.config.reconnect.clone() else {
                return;
            };
            let mut attempt = 0;
            loop {
                attempt += 1;
                if !policy.should_reconnect(attempt) {
                    warn!(attempts = attempt - 1, "giving up reconnecting");
                    return;
                }
                let delay = policy.delay(attempt);
                debug!(attempt, ?delay, "reconnecting");
                tokio::time::sleep(delay).await;
                if self.closed_by_client.load(Ordering::SeqCst) {
                    return;
                }
                match self.connect().await {
                    Ok(()) => {
                        info!(attempt, "reconnected");
                        return;
                    }
                    Err(e) => warn!(attempt, error = %e, "reconnect failed"),
                }
            }
        })
    }

    /// Routes decoded input. An inbound message that cannot be decoded and
    /// names no request leaves its waiter unknown, so the session is failed.
    async fn drain(&self, decoder: &mut Decoder) -> Result<(), svcwire_protocol::ProtocolError> {
        while let Some(item) = decoder.next_inbound()? {
            match item {
                Inbound::Message(message) => self.handle_message(message).await,
                Inbound::Progress(p) => trace!(transfer = %p.id, completed = p.completed_size, "inbound fragment"),
                Inbound::Rejected(rejection) => {
                    warn!(error = %rejection.error, transfer = ?rejection.transfer, "discarding inbound message");
                    match rejection.request_id {
                        Some(id) => {
                            self.pending.reject(id, rejection.error.into());
                        }
                        None => return Err(rejection.error),
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_message(&self, message: Message) {
        trace!(message = %codec::to_log_string(&message), "received");
        match message {
            Message::Response(response) => {
                if !self.pending.resolve(response.request_id, response.body) {
                    debug!(id = response.request_id, "response for unknown request");
                }
            }
            Message::Error(err) => self.handle_error(err),
            Message::EventNotify(notify) => {
                self.events.dispatch(notify);
            }
            Message::Reload(reload) => {
                let addressed = match reload.client_name.as_deref() {
                    None => true,
                    Some(name) => self.config.client_name.as_deref() == Some(name),
                };
                if addressed {
                    let _ = self.reloads.send(reload);
                }
            }
            Message::Progress(p) => {
                let request_id = {
                    let mut transfers = self.transfers.lock();
                    let id = transfers.get(&p.id).copied();
                    if p.completed_size >= p.total_size {
                        transfers.remove(&p.id);
                    }
                    id
                };
                let _ = self.progress.send(TransferProgress {
                    direction: TransferDirection::Outbound,
                    transfer: Some(p.id),
                    request_id,
                    total_size: p.total_size,
                    completed_size: p.completed_size,
                });
            }
            Message::UploadAck(ack) => {
                if let Some(tx) = self.upload_acks.lock().remove(&(ack.id, ack.offset)) {
                    let _ = tx.send(ack);
                }
            }
            Message::Ping { nonce } => {
                if let Err(e) = self.send(&Message::Pong { nonce }).await {
                    debug!(error = %e, "failed to answer ping");
                }
            }
            Message::Pong { nonce } => {
                if let Some(tx) = self.pongs.lock().remove(&nonce) {
                    let _ = tx.send(());
                }
            }
            other => warn!(kind = other.kind(), "unexpected message from server"),
        }
    }

    fn handle_error(&self, err: ErrorResponse) {
        let request_id = err.request_id.or_else(|| {
            let transfer = err
                .detail
                .as_ref()
                .and_then(|d| d.get("transfer"))
                .and_then(Value::as_uuid)?;
            self.transfers.lock().remove(&transfer)
        });
        match request_id {
            Some(id) => {
                self.pending.reject(id, err.into());
            }
            None => warn!(code = %err.code, message = %err.message, "server reported an error"),
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !self.is_connected() {
                break;
            }
            match tokio::time::timeout(interval, self.ping()).await {
                Ok(Ok(rtt)) => trace!(?rtt, "heartbeat"),
                _ => {
                    warn!("heartbeat not answered, closing connection");
                    self.shutdown("heartbeat timeout").await;
                    break;
                }
            }
        }
    }

    async fn write_frames(&self, frames: &[Bytes]) -> Result<(), ClientError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ClientError::NotConnected)?;
        for frame in frames {
            writer.write_all(frame).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Sends a message that expects no reply.
    pub async fn send(&self, message: &Message) -> Result<(), ClientError> {
        let outbound = self.encoder.encode(message)?;
        self.write_frames(&outbound.frames).await
    }

    /// Sends a request-shaped message and waits for its reply.
    ///
    /// `build` receives the allocated request id.
    pub async fn request(
        &self,
        build: impl FnOnce(u64) -> Message,
        timeout: Option<Duration>,
    ) -> Result<Value, ClientError> {
        self.ensure_open()?;
        let id = self.next_request_id();
        let message = build(id);
        debug!(id, kind = message.kind(), "sending request");

        let waiter = self.pending.register(id, timeout)?;
        let outbound = self.encoder.encode(&message)?;
        let transfer = outbound.transfer.map(|(transfer, _)| transfer);
        if let Some(transfer) = transfer {
            self.transfers.lock().insert(transfer, id);
        }

        let result = match self.write_frames(&outbound.frames).await {
            Ok(()) => waiter.wait().await,
            Err(e) => Err(e),
        };

        if let Some(transfer) = transfer {
            self.transfers.lock().remove(&transfer);
        }
        result
    }

    /// Invokes `command` (`"Service.method"`) with the given parameters.
    pub async fn call(
        &self,
        url: &str,
        command: &str,
        params: Vec<Value>,
    ) -> Result<Value, ClientError> {
        self.request(
            |id| {
                Message::Request(
                    Request::new(id, command)
                        .with_url(url)
                        .with_params(params),
                )
            },
            Some(self.config.request_timeout),
        )
        .await
    }

    /// Registers a listener for `name` and returns its subscription.
    pub async fn add_listener(
        &self,
        name: &str,
        info: Value,
    ) -> Result<EventSubscription, ClientError> {
        self.ensure_open()?;
        let key = Uuid::new_v4().to_string();
        let subscription = self
            .events
            .insert(key.clone(), name.to_string(), info.clone());

        let result = self
            .request(
                |id| {
                    Message::EventAdd(EventAdd {
                        id,
                        key: key.clone(),
                        name: name.to_string(),
                        info,
                    })
                },
                Some(self.config.request_timeout),
            )
            .await;

        match result {
            Ok(_) => Ok(subscription),
            Err(e) => {
                self.events.remove(&key);
                Err(e)
            }
        }
    }

    /// Unregisters a listener. The local registration is dropped even if
    /// the server cannot be reached.
    pub async fn remove_listener(&self, key: &str) -> Result<(), ClientError> {
        if !self.events.remove(key) {
            return Err(ClientError::ListenerNotFound(key.to_string()));
        }
        self.request(
            |id| {
                Message::EventRemove(EventRemove {
                    id,
                    key: key.to_string(),
                })
            },
            Some(self.config.request_timeout),
        )
        .await?;
        Ok(())
    }

    /// Lists the listeners registered on the server for `name`.
    pub async fn listener_infos(&self, name: &str) -> Result<Vec<ListenerInfo>, ClientError> {
        let body = self
            .request(
                |id| {
                    Message::EventInfos(EventInfos {
                        id,
                        name: name.to_string(),
                    })
                },
                Some(self.config.request_timeout),
            )
            .await?;
        Ok(body.deserialize_into()?)
    }

    /// Delivers `data` to the given listener keys.
    pub async fn emit_to(&self, keys: Vec<String>, data: Value) -> Result<(), ClientError> {
        self.request(
            |id| Message::EventEmit(EventEmit { id, keys, data }),
            Some(self.config.request_timeout),
        )
        .await?;
        Ok(())
    }

    /// Round-trips a ping and returns the elapsed time.
    pub async fn ping(&self) -> Result<Duration, ClientError> {
        self.ensure_open()?;
        let nonce = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pongs.lock().insert(nonce, tx);

        let started = Instant::now();
        if let Err(e) = self.send(&Message::Ping { nonce }).await {
            self.pongs.lock().remove(&nonce);
            return Err(e);
        }
        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.pongs.lock().remove(&nonce);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Streams a local file to `file_path` on the server.
    ///
    /// Each fragment is acknowledged by the server; a failed fragment is
    /// resent at the same offset up to `upload_retries` more times.
    pub async fn upload_file(
        &self,
        local_path: &Path,
        file_path: &str,
        chunk_size: usize,
    ) -> Result<Value, ClientError> {
        self.ensure_open()?;
        let mut file = tokio::fs::File::open(local_path).await?;
        let length = file.metadata().await?.len();
        let chunk_size = chunk_size.max(1);

        let id = self.next_request_id();
        let waiter = self
            .pending
            .register(id, Some(self.config.request_timeout))?;

        let mut offset = 0u64;
        let mut buf = vec![0u8; chunk_size];
        loop {
            let n = read_chunk(&mut file, &mut buf).await?;
            let fragment = UploadFragment {
                id,
                url: String::new(),
                file_path: file_path.to_string(),
                offset,
                length,
                buffer: Bytes::copy_from_slice(&buf[..n]),
            };

            if let Err(e) = self.send_fragment_with_retry(fragment).await {
                // The server may have failed the whole upload already.
                if !self.pending.contains(id) {
                    return waiter.wait().await;
                }
                return Err(e);
            }

            offset += n as u64;
            let _ = self.progress.send(TransferProgress {
                direction: TransferDirection::Outbound,
                transfer: None,
                request_id: Some(id),
                total_size: length,
                completed_size: offset,
            });
            if n == 0 || offset >= length {
                break;
            }
        }

        waiter.wait().await
    }

    async fn send_fragment_with_retry(&self, fragment: UploadFragment) -> Result<(), ClientError> {
        let mut attempt = 0;
        loop {
            let error = match self.send_upload_fragment(fragment.clone()).await {
                Ok(UploadAck { error: None, .. }) => return Ok(()),
                Ok(UploadAck {
                    error: Some(message),
                    ..
                }) => ClientError::Upload(message),
                Err(e @ (ClientError::NotConnected | ClientError::ConnectionClosed)) => {
                    return Err(e)
                }
                Err(e) => e,
            };

            attempt += 1;
            if attempt > self.config.upload_retries || !self.pending.contains(fragment.id) {
                return Err(error);
            }
            warn!(
                id = fragment.id,
                offset = fragment.offset,
                attempt,
                error = %error,
                "retrying upload fragment"
            );
        }
    }

    async fn send_upload_fragment(&self, fragment: UploadFragment) -> Result<UploadAck, ClientError> {
        let slot = (fragment.id, fragment.offset);
        let (tx, rx) = oneshot::channel();
        self.upload_acks.lock().insert(slot, tx);

        if let Err(e) = self.send(&Message::Upload(fragment)).await {
            self.upload_acks.lock().remove(&slot);
            return Err(e);
        }
        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.upload_acks.lock().remove(&slot);
                Err(ClientError::Timeout)
            }
        }
    }
}

/// Fills `buf` from `file`, stopping early only at end of file.
async fn read_chunk(file: &mut tokio::fs::File, buf: &mut [u8]) -> Result<usize, ClientError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
