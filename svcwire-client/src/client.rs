//! High-level client API.

use crate::connection::{Connection, ConnectionConfig, TransferProgress, DEFAULT_UPLOAD_CHUNK};
use crate::error::ClientError;
use crate::events::EventSubscription;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use svcwire_protocol::message::{ListenerInfo, Reload};
use svcwire_protocol::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tracing::debug;

/// Service name of the built-in resource proxy.
pub const RESOURCE_SERVICE: &str = "DbProxy";

/// High-level client for svcwire.
pub struct Client {
    conn: Arc<Connection>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            conn: Arc::new(Connection::new(config)),
        }
    }

    /// Connects to the server.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await
    }

    /// Connects over an already established stream.
    pub async fn connect_with<S>(&self, stream: S) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.conn.connect_with(stream).await
    }

    /// Drops the current socket, if any, and connects again. Listeners are
    /// registered again on the new session.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        self.conn.close().await?;
        self.conn.connect().await
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Invokes `command` (`"Service.method"`).
    pub async fn call(&self, command: &str, params: Vec<Value>) -> Result<Value, ClientError> {
        self.conn.call("", command, params).await
    }

    /// Invokes `command` on behalf of the given caller url.
    pub async fn call_with_url(
        &self,
        url: &str,
        command: &str,
        params: Vec<Value>,
    ) -> Result<Value, ClientError> {
        self.conn.call(url, command, params).await
    }

    /// Invokes `command` and deserializes the result.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        command: &str,
        params: Vec<Value>,
    ) -> Result<T, ClientError> {
        let body = self.call(command, params).await?;
        Ok(body.deserialize_into()?)
    }

    /// Pings the server and returns the round-trip time.
    pub async fn ping(&self) -> Result<Duration, ClientError> {
        self.conn.ping().await
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Registers a listener for `name`. `info` is the filter the emitting
    /// side matches against.
    pub async fn add_listener(
        &self,
        name: &str,
        info: Value,
    ) -> Result<EventSubscription, ClientError> {
        self.conn.add_listener(name, info).await
    }

    /// Unregisters a listener by key.
    pub async fn remove_listener(&self, key: &str) -> Result<(), ClientError> {
        self.conn.remove_listener(key).await
    }

    /// Lists the server-side listeners of `name`.
    pub async fn listener_infos(&self, name: &str) -> Result<Vec<ListenerInfo>, ClientError> {
        self.conn.listener_infos(name).await
    }

    /// Emits an event from this client.
    ///
    /// The listeners of `name` are fetched, `filter(info, data)` picks the
    /// recipients, and the server delivers `data` to those keys. Returns the
    /// number of keys targeted.
    pub async fn emit<F>(&self, name: &str, data: Value, filter: F) -> Result<usize, ClientError>
    where
        F: Fn(&Value, &Value) -> bool,
    {
        let keys: Vec<String> = self
            .listener_infos(name)
            .await?
            .into_iter()
            .filter(|l| filter(&l.info, &data))
            .map(|l| l.key)
            .collect();

        if keys.is_empty() {
            debug!(event = name, "no matching listeners");
            return Ok(0);
        }
        let count = keys.len();
        self.conn.emit_to(keys, data).await?;
        Ok(count)
    }

    /// Subscribes to reload notices addressed to this client.
    pub fn subscribe_reloads(&self) -> broadcast::Receiver<Reload> {
        self.conn.subscribe_reloads()
    }

    /// Subscribes to transfer progress notices.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<TransferProgress> {
        self.conn.subscribe_progress()
    }

    // =========================================================================
    // Uploads
    // =========================================================================

    /// Uploads a local file to `file_path` on the server, in fragments of
    /// the default size.
    pub async fn upload_file(
        &self,
        local_path: impl AsRef<Path>,
        file_path: &str,
    ) -> Result<Value, ClientError> {
        self.conn
            .upload_file(local_path.as_ref(), file_path, DEFAULT_UPLOAD_CHUNK)
            .await
    }

    /// Uploads with an explicit fragment size.
    pub async fn upload_file_chunked(
        &self,
        local_path: impl AsRef<Path>,
        file_path: &str,
        chunk_size: usize,
    ) -> Result<Value, ClientError> {
        self.conn
            .upload_file(local_path.as_ref(), file_path, chunk_size)
            .await
    }

    // =========================================================================
    // Resource sessions
    // =========================================================================

    /// Opens a proxied resource session on the server.
    pub async fn open_resource(&self, config: Value) -> Result<RemoteResource, ClientError> {
        let body = self
            .call(&format!("{RESOURCE_SERVICE}.open"), vec![config])
            .await?;
        let id = body
            .as_u64()
            .ok_or_else(|| ClientError::UnexpectedResponse(format!("invalid resource id: {body}")))?;
        Ok(RemoteResource {
            conn: self.conn.clone(),
            id,
        })
    }
}

/// Handle to a server-side resource session.
///
/// The server closes the session when this connection closes; dropping the
/// handle alone does not.
pub struct RemoteResource {
    conn: Arc<Connection>,
    id: u64,
}

impl RemoteResource {
    pub fn id(&self) -> u64 {
        self.id
    }

    async fn invoke(&self, method: &str, extra: Option<Value>) -> Result<Value, ClientError> {
        let mut params = vec![Value::from(self.id)];
        params.extend(extra);
        self.conn
            .call("", &format!("{RESOURCE_SERVICE}.{method}"), params)
            .await
    }

    /// Runs an operation against the resource.
    pub async fn execute(&self, payload: Value) -> Result<Value, ClientError> {
        self.invoke("execute", Some(payload)).await
    }

    pub async fn begin(&self) -> Result<(), ClientError> {
        self.invoke("begin", None).await.map(drop)
    }

    pub async fn commit(&self) -> Result<(), ClientError> {
        self.invoke("commit", None).await.map(drop)
    }

    pub async fn rollback(&self) -> Result<(), ClientError> {
        self.invoke("rollback", None).await.map(drop)
    }

    /// Closes the session. The id is never reused.
    pub async fn close(self) -> Result<(), ClientError> {
        self.invoke("close", None).await.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let config = ConnectionConfig::new("127.0.0.1:7420".parse().unwrap())
            .with_client_name("admin");
        let client = Client::new(config);
        assert!(!client.is_connected());
        assert_eq!(
            client.connection().config().client_name.as_deref(),
            Some("admin")
        );
    }

    #[tokio::test]
    async fn test_emit_requires_connection() {
        let client = Client::new(ConnectionConfig::new("127.0.0.1:7420".parse().unwrap()));
        let result = client.emit("UserChanged", Value::Null, |_, _| true).await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
    }
}
