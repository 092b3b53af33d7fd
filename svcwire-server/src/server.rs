//! TCP server implementation.

use crate::auth::{Permissions, TokenValidator};
use crate::config::{Config, ResourceDriverKind};
use crate::error::ServerError;
use crate::events::{EmitReport, EventRegistry, Outbox};
use crate::handler::CommandHandler;
use crate::metrics::Metrics;
use crate::resource::{MemoryDriver, ResourceDriver, ResourceTable};
use crate::service::ServiceRegistry;
use crate::session::{ConnectionId, Identity, Session};
use crate::upload::{FileStorage, LocalFileStorage, UploadTracker};
use dashmap::DashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use svcwire_protocol::codec::{self, Decoder, Encoder, Inbound, SplitConfig};
use svcwire_protocol::message::{ErrorResponse, Hello, Message, Reload, Welcome};
use svcwire_protocol::{Value, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;

/// Queued outbound messages per connection.
const OUTBOX_CAPACITY: usize = 1024;

/// How often partial transfers, idle time and the heartbeat are checked.
const MAINTENANCE_TICK: Duration = Duration::from_secs(1);

/// Time the writer gets to flush queued messages on close.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Name reported in the welcome frame.
    pub server_name: String,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
    /// Time allowed for the hello frame.
    pub handshake_timeout: Duration,
    /// Server ping interval, `None` to disable.
    pub heartbeat_interval: Option<Duration>,
    /// Time allowed for a pong.
    pub heartbeat_timeout: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Outbound splitting and inbound size cap.
    pub split: SplitConfig,
    /// Idle time after which a partial inbound transfer is dropped.
    pub reassembly_timeout: Duration,
    /// Include stacks in error responses.
    pub expose_stack: bool,
    /// Whether a valid token is required at handshake.
    pub auth_required: bool,
    pub token_validator: TokenValidator,
    /// Driver backing resource proxy sessions.
    pub resource_driver: Option<Arc<dyn ResourceDriver>>,
    /// Upload destination; uploads are refused when unset.
    pub upload_storage: Option<Arc<dyn FileStorage>>,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("server_name", &self.server_name)
            .field("idle_timeout", &self.idle_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("max_connections", &self.max_connections)
            .field("split", &self.split)
            .field("auth_required", &self.auth_required)
            .field("resource_driver", &self.resource_driver.as_ref().map(|d| d.name()))
            .field("uploads_enabled", &self.upload_storage.is_some())
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, svcwire_protocol::DEFAULT_PORT)),
            server_name: "svcwire".to_string(),
            idle_timeout: Duration::from_secs(300),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Some(Duration::from_secs(30)),
            heartbeat_timeout: Duration::from_secs(30),
            max_connections: 1000,
            split: SplitConfig::default(),
            reassembly_timeout: Duration::from_secs(60),
            expose_stack: true,
            auth_required: false,
            token_validator: TokenValidator::default(),
            resource_driver: None,
            upload_storage: None,
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Builds the runtime configuration from the loaded file/env config.
    pub fn from_config(config: &Config) -> Self {
        let resource_driver: Option<Arc<dyn ResourceDriver>> = match config.resources.driver {
            ResourceDriverKind::None => None,
            ResourceDriverKind::Memory => Some(Arc::new(MemoryDriver::new())),
        };
        let upload_storage: Option<Arc<dyn FileStorage>> = config
            .uploads
            .enabled
            .then(|| Arc::new(LocalFileStorage::new(&config.uploads.root_dir)) as Arc<dyn FileStorage>);

        Self {
            bind_addr: config.network.bind_addr,
            idle_timeout: config.network.idle_timeout(),
            handshake_timeout: config.network.handshake_timeout(),
            heartbeat_interval: config.network.heartbeat_interval(),
            heartbeat_timeout: config.network.heartbeat_timeout(),
            max_connections: config.network.max_connections,
            split: config.protocol.split_config(),
            reassembly_timeout: config.protocol.reassembly_timeout(),
            expose_stack: config.protocol.expose_stack,
            auth_required: config.auth.required,
            token_validator: config.auth.validator(),
            resource_driver,
            upload_storage,
            ..Default::default()
        }
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Requires a token from the validator at handshake.
    pub fn with_auth(mut self, validator: TokenValidator) -> Self {
        self.auth_required = true;
        self.token_validator = validator;
        self
    }

    pub fn with_resource_driver(mut self, driver: Arc<dyn ResourceDriver>) -> Self {
        self.resource_driver = Some(driver);
        self
    }

    pub fn with_upload_storage(mut self, storage: Arc<dyn FileStorage>) -> Self {
        self.upload_storage = Some(storage);
        self
    }

    pub fn with_heartbeat(mut self, interval: Option<Duration>, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_split(mut self, split: SplitConfig) -> Self {
        self.split = split;
        self
    }

    pub fn with_expose_stack(mut self, expose: bool) -> Self {
        self.expose_stack = expose;
        self
    }

    /// Returns whether metrics are enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub handshakes_rejected: AtomicU64,
    pub errors_total: AtomicU64,
}

/// What the server keeps about a live connection.
struct ConnectionHandle {
    client_name: Option<String>,
    outbox: Outbox,
    kick: watch::Sender<bool>,
}

/// State shared by the accept loop and every connection task.
struct Shared {
    config: ServerConfig,
    handler: Arc<CommandHandler>,
    connections: DashMap<ConnectionId, ConnectionHandle>,
    /// Client id to its current connection.
    clients: DashMap<String, ConnectionId>,
    next_connection_id: AtomicU64,
    stats: ServerStats,
}

/// TCP server for svcwire.
pub struct Server {
    shared: Arc<Shared>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server serving the given services.
    pub fn new(config: ServerConfig, services: ServiceRegistry) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let events = Arc::new(EventRegistry::new());
        let resources = Arc::new(ResourceTable::new(config.resource_driver.clone()));

        let mut handler = CommandHandler::new(Arc::new(services), events, resources)
            .with_expose_stack(config.expose_stack);
        if let Some(ref storage) = config.upload_storage {
            handler = handler.with_uploads(Arc::new(UploadTracker::new(storage.clone())));
        }
        if let Some(ref metrics) = config.metrics {
            handler = handler.with_metrics(metrics.clone());
        }

        Self {
            shared: Arc::new(Shared {
                config,
                handler: Arc::new(handler),
                connections: DashMap::new(),
                clients: DashMap::new(),
                next_connection_id: AtomicU64::new(1),
                stats: ServerStats::default(),
            }),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and runs the server.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.shared.config.bind_addr).await?;
        self.run_on(listener).await
    }

    /// Runs the server on an already bound listener.
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Server listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.shared.connections.len() >= self.shared.config.max_connections {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            tcp_stream.set_nodelay(true).ok();

                            let shared = self.shared.clone();
                            let conn_shutdown = self.shutdown.subscribe();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(shared.clone(), tcp_stream, addr, conn_shutdown).await {
                                    tracing::debug!("Connection {} error: {}", addr, e);
                                    shared.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Serves a single connection over any byte stream until it closes.
    pub async fn serve<S>(&self, stream: S, addr: SocketAddr) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::handle_connection(self.shared.clone(), stream, addr, self.shutdown.subscribe()).await
    }

    async fn handle_connection<S>(
        shared: Arc<Shared>,
        stream: S,
        addr: SocketAddr,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let config = &shared.config;
        shared.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = config.metrics {
            metrics.connections_total.inc();
        }

        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut decoder = Decoder::new(config.split.max_message_size, config.reassembly_timeout);
        let mut buf = vec![0u8; 8192];

        let handshake = tokio::time::timeout(
            config.handshake_timeout,
            read_hello(&mut reader, &mut decoder, &mut buf),
        )
        .await
        .unwrap_or(Err(ServerError::HandshakeTimeout))
        .and_then(|hello| Self::authorize(config, hello));

        let (hello, permissions) = match handshake {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::info!("[{}] Handshake rejected: {}", addr, e);
                shared.stats.handshakes_rejected.fetch_add(1, Ordering::Relaxed);
                let reply = Message::Error(e.to_response());
                if let Ok(frame) = codec::encode_frame(&reply) {
                    let _ = writer.write_all(&frame).await;
                }
                let _ = writer.shutdown().await;
                return Err(e);
            }
        };

        let connection_id = shared.next_connection_id.fetch_add(1, Ordering::SeqCst);
        // Anonymous clients never replace one another.
        let client_id = if hello.client_id.is_empty() {
            format!("anonymous-{}", connection_id)
        } else {
            hello.client_id.clone()
        };
        tracing::info!(
            "[{}] Client connected: id={} client={} name={:?}",
            addr,
            connection_id,
            client_id,
            hello.client_name
        );

        let (outbox, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let writer_task = tokio::spawn(write_loop(
            writer,
            Encoder::new(config.split),
            outbox_rx,
            addr,
        ));

        let handler = shared.handler.clone();
        let session = Arc::new(Session::new(
            addr,
            Identity {
                connection_id,
                client_id: client_id.clone(),
                client_name: hello.client_name.clone(),
                authenticated: permissions.is_some(),
                permissions: permissions.unwrap_or_default(),
            },
            handler.events().clone(),
            handler.resources().clone(),
        ));
        Self::register_close_hooks(&session, &handler, connection_id);

        let (kick_tx, mut kick_rx) = watch::channel(false);
        shared.connections.insert(
            connection_id,
            ConnectionHandle {
                client_name: hello.client_name.clone(),
                outbox: outbox.clone(),
                kick: kick_tx,
            },
        );
        if let Some(previous) = shared.clients.insert(client_id.clone(), connection_id) {
            if let Some(handle) = shared.connections.get(&previous) {
                tracing::info!(
                    "[{}] Client {} reconnected, closing connection {}",
                    addr,
                    client_id,
                    previous
                );
                let _ = handle.kick.send(true);
            }
        }
        handler.events().attach(connection_id, outbox.clone());

        let welcome = Message::Welcome(Welcome {
            connection_id,
            server_name: config.server_name.clone(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            max_message_size: config.split.max_message_size,
            split_threshold: config.split.threshold as u64,
        });
        let _ = outbox.send(welcome).await;
        session.open();

        shared.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = config.metrics {
            metrics.connections_active.inc();
        }

        let mut conn = ConnectionTask {
            addr,
            session: session.clone(),
            handler: handler.clone(),
            outbox,
            tasks: JoinSet::new(),
            awaiting_pong: None,
            last_ping: Instant::now(),
            nonce: 0,
        };

        let mut maintenance = tokio::time::interval(MAINTENANCE_TICK);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let reason: &str = loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => break "server shutdown",

                _ = kick_rx.changed() => break "replaced by a newer connection",

                result = reader.read(&mut buf) => {
                    match result {
                        Ok(0) => break "closed by client",
                        Ok(n) => {
                            tracing::trace!("[{}] Received {} bytes", addr, n);
                            decoder.extend(&buf[..n]);
                            session.touch();
                            if let Err(e) = conn.drain(&mut decoder) {
                                tracing::warn!("[{}] Protocol error: {}", addr, e);
                                conn.send_now(Message::Error(ServerError::from(e).to_response()));
                                break "protocol error";
                            }
                        }
                        Err(e) => {
                            tracing::debug!("[{}] Read error: {}", addr, e);
                            break "read error";
                        }
                    }
                }

                Some(joined) = conn.tasks.join_next() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!("[{}] Request task panicked", addr);
                        }
                    }
                }

                _ = maintenance.tick() => {
                    for transfer in decoder.purge_expired(Instant::now()) {
                        tracing::warn!("[{}] Dropped stale partial transfer {}", addr, transfer);
                    }
                    if session.idle_duration() > config.idle_timeout {
                        break "idle timeout";
                    }
                    if let Some(interval) = config.heartbeat_interval {
                        if let Some(reason) = conn.heartbeat(interval, config.heartbeat_timeout) {
                            break reason;
                        }
                    }
                }
            }
        };

        tracing::info!("[{}] Client disconnected: {}", addr, reason);

        conn.tasks.abort_all();
        while conn.tasks.join_next().await.is_some() {}
        session.close().await;

        shared.connections.remove(&connection_id);
        shared
            .clients
            .remove_if(&client_id, |_, current| *current == connection_id);
        drop(conn);

        match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer_task).await {
            Ok(Ok(Err(e))) => tracing::debug!("[{}] Write error: {}", addr, e),
            Err(_) => tracing::warn!("[{}] Writer did not drain in time", addr),
            _ => {}
        }

        shared.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        if let Some(ref metrics) = config.metrics {
            metrics.connections_active.dec();
        }
        handler.update_gauge_metrics();
        Ok(())
    }

    /// Checks protocol version and token. Returns the caller's permissions
    /// when authenticated.
    fn authorize(
        config: &ServerConfig,
        hello: Hello,
    ) -> Result<(Hello, Option<Permissions>), ServerError> {
        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(ServerError::UnsupportedVersion(hello.protocol_version));
        }
        let permissions = match hello.token.as_deref() {
            Some(token) if config.token_validator.has_tokens() => Some(
                config
                    .token_validator
                    .authenticate(token)
                    .ok_or_else(|| ServerError::AuthFailed("invalid token".to_string()))?,
            ),
            _ if config.auth_required => {
                return Err(ServerError::AuthFailed("token required".to_string()))
            }
            _ => None,
        };
        Ok((hello, permissions))
    }

    fn register_close_hooks(session: &Session, handler: &CommandHandler, id: ConnectionId) {
        let events = handler.events().clone();
        session.on_close(move || async move {
            let removed = events.remove_all_for(id);
            tracing::debug!("Connection {} released {} listeners", id, removed);
        });

        let resources = handler.resources().clone();
        session.on_close(move || async move {
            resources.close_all_for(id).await;
        });

        if let Some(uploads) = handler.uploads().cloned() {
            session.on_close(move || async move {
                let aborted = uploads.abort_for(id);
                if aborted > 0 {
                    tracing::debug!("Connection {} abandoned {} uploads", id, aborted);
                }
            });
        }
    }

    /// Sends a reload notification to every connection. Clients drop it
    /// unless the name matches their own. Returns the number queued.
    pub fn broadcast_reload(&self, client_name: Option<&str>, changed_files: Vec<String>) -> usize {
        let message = Message::Reload(Reload {
            client_name: client_name.map(str::to_string),
            changed_files,
        });
        let mut queued = 0;
        for entry in self.shared.connections.iter() {
            let handle = entry.value();
            let wanted = match (client_name, handle.client_name.as_deref()) {
                (Some(target), Some(name)) => target == name,
                _ => true,
            };
            if wanted && handle.outbox.try_send(message.clone()).is_ok() {
                queued += 1;
            }
        }
        tracing::info!("Reload broadcast to {} connections", queued);
        queued
    }

    /// Emits an event to matching listeners on every connection.
    pub fn emit<F>(&self, name: &str, data: &Value, match_fn: F) -> EmitReport
    where
        F: Fn(&Value, &Value) -> bool,
    {
        let report = self.shared.handler.events().emit(name, data, match_fn);
        if let Some(ref metrics) = self.shared.config.metrics {
            metrics.events_delivered_total.inc_by(report.delivered as f64);
        }
        report
    }

    /// Returns the event registry.
    pub fn events(&self) -> &Arc<EventRegistry> {
        self.shared.handler.events()
    }

    /// Returns the resource table.
    pub fn resources(&self) -> &Arc<ResourceTable> {
        self.shared.handler.resources()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.shared.stats
    }
}

/// Reads frames until the hello arrives.
async fn read_hello<R>(
    reader: &mut R,
    decoder: &mut Decoder,
    buf: &mut [u8],
) -> Result<Hello, ServerError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(item) = decoder.next_inbound()? {
            return match item {
                Inbound::Message(Message::Hello(hello)) => Ok(hello),
                Inbound::Message(other) => Err(ServerError::InvalidRequest(format!(
                    "expected hello, got {}",
                    other.kind()
                ))),
                Inbound::Progress(_) | Inbound::Rejected(_) => Err(ServerError::InvalidRequest(
                    "expected hello as a single frame".to_string(),
                )),
            };
        }
        let n = reader.read(buf).await?;
        if n == 0 {
            return Err(ServerError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        decoder.extend(&buf[..n]);
    }
}

/// Drains the outbox onto the socket, splitting large messages.
async fn write_loop<W>(
    mut writer: W,
    encoder: Encoder,
    mut outbox: mpsc::Receiver<Message>,
    addr: SocketAddr,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbox.recv().await {
        let outbound = match encoder.encode(&message) {
            Ok(outbound) => outbound,
            Err(e) => {
                tracing::warn!("[{}] Cannot encode {}: {}", addr, message.kind(), e);
                let Some(id) = message.request_id() else {
                    continue;
                };
                // The caller still gets an answer.
                let fallback = Message::Error(
                    ErrorResponse::new(e.error_code(), e.to_string()).for_request(id),
                );
                match encoder.encode(&fallback) {
                    Ok(outbound) => outbound,
                    Err(_) => continue,
                }
            }
        };
        if let Some((transfer, size)) = outbound.transfer {
            tracing::debug!(
                "[{}] Splitting {} into {} fragments ({} bytes, transfer {})",
                addr,
                message.kind(),
                outbound.frames.len(),
                size,
                transfer
            );
        }
        for frame in outbound.frames {
            writer.write_all(&frame).await?;
        }
        writer.flush().await?;
    }
    writer.shutdown().await
}

/// Per-connection routing state.
struct ConnectionTask {
    addr: SocketAddr,
    session: Arc<Session>,
    handler: Arc<CommandHandler>,
    outbox: Outbox,
    tasks: JoinSet<()>,
    /// Nonce and send time of an unanswered server ping.
    awaiting_pong: Option<(u64, Instant)>,
    last_ping: Instant,
    nonce: u64,
}

impl ConnectionTask {
    /// Routes every complete inbound item. Framing errors are fatal to the
    /// connection; a bad logical message is only answered with an error.
    fn drain(&mut self, decoder: &mut Decoder) -> Result<(), svcwire_protocol::ProtocolError> {
        while let Some(item) = decoder.next_inbound()? {
            match item {
                Inbound::Message(message) => self.route(message),
                Inbound::Progress(progress) => self.send_now(Message::Progress(progress)),
                Inbound::Rejected(rejection) => {
                    tracing::warn!(
                        "[{}] Discarded message: {} (request={:?}, transfer={:?})",
                        self.addr,
                        rejection.error,
                        rejection.request_id,
                        rejection.transfer
                    );
                    let mut reply = ErrorResponse::new(
                        rejection.error.error_code(),
                        rejection.error.to_string(),
                    );
                    if let Some(transfer) = rejection.transfer {
                        reply = reply.with_detail(Value::object([("transfer", Value::from(transfer))]));
                    }
                    if let Some(id) = rejection.request_id {
                        reply = reply.for_request(id);
                    }
                    self.send_now(Message::Error(reply));
                }
            }
        }
        Ok(())
    }

    fn route(&mut self, message: Message) {
        match message {
            Message::Ping { nonce } => self.send_now(Message::Pong { nonce }),
            Message::Pong { nonce } => {
                if matches!(self.awaiting_pong, Some((expected, _)) if expected == nonce) {
                    self.awaiting_pong = None;
                }
            }
            Message::Progress(progress) => {
                tracing::trace!("[{}] Peer progress for {}", self.addr, progress.id);
            }
            Message::Hello(_) => {
                self.send_now(Message::Error(
                    ServerError::InvalidRequest("handshake already completed".to_string())
                        .to_response(),
                ));
            }
            message => {
                let handler = self.handler.clone();
                let session = self.session.clone();
                let outbox = self.outbox.clone();
                self.tasks.spawn(async move {
                    for reply in handler.handle(&session, message).await {
                        if outbox.send(reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        }
    }

    /// Queues a control message without waiting.
    fn send_now(&self, message: Message) {
        if let Err(e) = self.outbox.try_send(message) {
            tracing::warn!("[{}] Outbox full, dropping {}", self.addr, e.into_inner().kind());
        }
    }

    /// Sends a ping when due. Returns a close reason when the previous ping
    /// went unanswered.
    fn heartbeat(&mut self, interval: Duration, timeout: Duration) -> Option<&'static str> {
        match self.awaiting_pong {
            Some((_, sent)) if sent.elapsed() > timeout => Some("heartbeat timeout"),
            Some(_) => None,
            None if self.last_ping.elapsed() >= interval => {
                self.nonce += 1;
                self.last_ping = Instant::now();
                self.awaiting_pong = Some((self.nonce, self.last_ping));
                self.send_now(Message::Ping { nonce: self.nonce });
                None
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{MethodTable, ServiceDef};
    use svcwire_protocol::message::Request;
    use tokio::io::DuplexStream;

    fn test_server(config: ServerConfig) -> Arc<Server> {
        let mut services = ServiceRegistry::new();
        services.register(ServiceDef::new("Echo", |_| {
            MethodTable::new()
                .sync_method("echo", |_, params| Ok(params.into_iter().next().unwrap_or_default()))
        }));
        Arc::new(Server::new(config, services))
    }

    fn connect(server: &Arc<Server>) -> DuplexStream {
        let (client, server_side) = tokio::io::duplex(64 * 1024);
        let server = server.clone();
        tokio::spawn(async move {
            let _ = server
                .serve(server_side, "127.0.0.1:9".parse().unwrap())
                .await;
        });
        client
    }

    fn hello(client_id: &str, token: Option<&str>) -> Message {
        Message::Hello(Hello {
            protocol_version: PROTOCOL_VERSION,
            client_id: client_id.to_string(),
            client_name: None,
            token: token.map(str::to_string),
        })
    }

    async fn send(stream: &mut DuplexStream, message: &Message) {
        stream
            .write_all(&codec::encode_frame(message).unwrap())
            .await
            .unwrap();
    }

    async fn recv(stream: &mut DuplexStream, decoder: &mut Decoder) -> Option<Message> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(Inbound::Message(m)) = decoder.next_inbound().unwrap() {
                return Some(m);
            }
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                return None;
            }
            decoder.extend(&buf[..n]);
        }
    }

    fn decoder() -> Decoder {
        Decoder::new(svcwire_protocol::MAX_MESSAGE_SIZE, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_server_basic() {
        let server = test_server(ServerConfig::new("127.0.0.1:0".parse().unwrap()));
        assert!(!server.is_running());
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_handshake_and_request() {
        let server = test_server(ServerConfig::default());
        let mut stream = connect(&server);
        let mut decoder = decoder();

        send(&mut stream, &hello("c1", None)).await;
        let welcome = recv(&mut stream, &mut decoder).await;
        assert!(matches!(welcome, Some(Message::Welcome(ref w)) if w.connection_id == 1));

        let request = Message::Request(Request::new(4, "Echo.echo").with_params(vec!["hi".into()]));
        send(&mut stream, &request).await;
        match recv(&mut stream, &mut decoder).await {
            Some(Message::Response(r)) => {
                assert_eq!(r.request_id, 4);
                assert_eq!(r.body, Value::from("hi"));
            }
            other => panic!("unexpected: {:?}", other),
        }

        send(&mut stream, &Message::Ping { nonce: 7 }).await;
        assert_eq!(
            recv(&mut stream, &mut decoder).await,
            Some(Message::Pong { nonce: 7 })
        );
    }

    #[tokio::test]
    async fn test_handshake_rejections() {
        let server = test_server(
            ServerConfig::default().with_auth(TokenValidator::new(vec![
                TokenValidator::hash_token("secret"),
            ])),
        );

        let mut stream = connect(&server);
        let mut decoder = decoder();
        send(&mut stream, &hello("c1", Some("wrong"))).await;
        match recv(&mut stream, &mut decoder).await {
            Some(Message::Error(e)) => assert_eq!(e.code, "AUTH_FAILED"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(recv(&mut stream, &mut decoder).await.is_none());

        let mut stream = connect(&server);
        let mut decoder = self::decoder();
        let mut old = hello("c2", Some("secret"));
        if let Message::Hello(ref mut h) = old {
            h.protocol_version = 99;
        }
        send(&mut stream, &old).await;
        match recv(&mut stream, &mut decoder).await {
            Some(Message::Error(e)) => assert_eq!(e.code, "UNSUPPORTED_PROTOCOL"),
            other => panic!("unexpected: {:?}", other),
        }

        let mut stream = connect(&server);
        let mut decoder = self::decoder();
        send(&mut stream, &hello("c3", Some("secret"))).await;
        assert!(matches!(
            recv(&mut stream, &mut decoder).await,
            Some(Message::Welcome(_))
        ));
        assert_eq!(server.stats().handshakes_rejected.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_same_client_id_replaces_connection() {
        let server = test_server(ServerConfig::default());

        let mut first = connect(&server);
        let mut first_decoder = decoder();
        send(&mut first, &hello("dup", None)).await;
        assert!(recv(&mut first, &mut first_decoder).await.is_some());

        let mut second = connect(&server);
        let mut second_decoder = decoder();
        send(&mut second, &hello("dup", None)).await;
        assert!(recv(&mut second, &mut second_decoder).await.is_some());

        // The first connection is closed by the server.
        assert!(recv(&mut first, &mut first_decoder).await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_reload_by_name() {
        let server = test_server(ServerConfig::default());
        let mut stream = connect(&server);
        let mut decoder = decoder();
        let mut named = hello("c1", None);
        if let Message::Hello(ref mut h) = named {
            h.client_name = Some("admin".into());
        }
        send(&mut stream, &named).await;
        assert!(recv(&mut stream, &mut decoder).await.is_some());

        assert_eq!(server.broadcast_reload(Some("shop"), vec!["a.js".into()]), 0);
        assert_eq!(server.broadcast_reload(Some("admin"), vec!["b.js".into()]), 1);
        match recv(&mut stream, &mut decoder).await {
            Some(Message::Reload(r)) => assert_eq!(r.changed_files, vec!["b.js".to_string()]),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
