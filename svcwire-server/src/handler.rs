//! Command handlers.
//!
//! Turns one inbound logical message from an open session into the
//! messages to send back. Requests go through the service dispatcher;
//! event and upload messages are served here directly.

use crate::error::ServerError;
use crate::events::EventRegistry;
use crate::metrics::Metrics;
use crate::resource::ResourceTable;
use crate::service::ServiceRegistry;
use crate::session::Session;
use crate::upload::{UploadError, UploadProgress, UploadTracker};
use std::sync::Arc;
use std::time::Instant;
use svcwire_protocol::codec::to_log_string;
use svcwire_protocol::message::*;
use svcwire_protocol::{ErrorCode, Value};
use tracing::debug;

/// Command handler shared by all connections.
pub struct CommandHandler {
    services: Arc<ServiceRegistry>,
    events: Arc<EventRegistry>,
    resources: Arc<ResourceTable>,
    uploads: Option<Arc<UploadTracker>>,
    metrics: Option<Arc<Metrics>>,
    /// Whether error stacks are sent to clients.
    expose_stack: bool,
}

impl CommandHandler {
    pub fn new(
        services: Arc<ServiceRegistry>,
        events: Arc<EventRegistry>,
        resources: Arc<ResourceTable>,
    ) -> Self {
        Self {
            services,
            events,
            resources,
            uploads: None,
            metrics: None,
            expose_stack: true,
        }
    }

    pub fn with_uploads(mut self, uploads: Arc<UploadTracker>) -> Self {
        self.uploads = Some(uploads);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_expose_stack(mut self, expose: bool) -> Self {
        self.expose_stack = expose;
        self
    }

    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.events
    }

    pub fn resources(&self) -> &Arc<ResourceTable> {
        &self.resources
    }

    pub fn uploads(&self) -> Option<&Arc<UploadTracker>> {
        self.uploads.as_ref()
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    /// Refreshes the gauges backed by shared tables.
    pub fn update_gauge_metrics(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.listeners_active.set(self.events.len() as f64);
            metrics
                .resource_sessions_active
                .set(self.resources.len() as f64);
        }
    }

    /// Handles one message and returns the replies, in send order.
    pub async fn handle(&self, session: &Session, message: Message) -> Vec<Message> {
        let kind = message.kind();
        let start = Instant::now();
        session.record_request();
        debug!("[{}] <- {}", session.remote_addr, to_log_string(&message));

        let replies = match message {
            Message::Request(request) => {
                let id = request.id;
                match self.services.dispatch(session, request).await {
                    Ok(body) => vec![Message::Response(Response::new(id, body))],
                    Err(e) => vec![self.error_reply(id, e.to_response())],
                }
            }
            Message::EventAdd(add) => {
                match self.events.add(session.id(), &add.key, &add.name, add.info) {
                    Ok(()) => vec![Message::Response(Response::new(add.id, Value::Null))],
                    Err(e) => vec![self.error_reply(add.id, e.to_response())],
                }
            }
            Message::EventRemove(remove) => {
                if self.events.remove(session.id(), &remove.key) {
                    vec![Message::Response(Response::new(remove.id, Value::Null))]
                } else {
                    let err = ServerError::ListenerNotFound(remove.key);
                    vec![self.error_reply(remove.id, err.to_response())]
                }
            }
            Message::EventInfos(query) => {
                let infos = self
                    .events
                    .infos(&query.name)
                    .into_iter()
                    .map(|l| Value::object([("key", Value::from(l.key)), ("info", l.info)]))
                    .collect();
                vec![Message::Response(Response::new(query.id, Value::Array(infos)))]
            }
            Message::EventEmit(emit) => {
                let report = self.events.emit_to_keys(&emit.keys, &emit.data);
                if let Some(metrics) = &self.metrics {
                    metrics.events_delivered_total.inc_by(report.delivered as f64);
                }
                vec![Message::Response(Response::new(
                    emit.id,
                    Value::from(report.matched),
                ))]
            }
            Message::Upload(fragment) => self.handle_upload(session, fragment).await,
            other => {
                let err = ErrorResponse::new(
                    ErrorCode::BadRequest,
                    format!("unexpected message kind '{}'", other.kind()),
                );
                match other.request_id() {
                    Some(id) => vec![self.error_reply(id, err)],
                    None => vec![Message::Error(err)],
                }
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.requests_total.with_label_values(&[kind]).inc();
            metrics
                .request_duration
                .with_label_values(&[kind])
                .observe(start.elapsed().as_secs_f64());
        }
        self.update_gauge_metrics();
        replies
    }

    /// Writes one upload fragment. The fragment is always acknowledged; the
    /// request is answered once the file completes or fails for good.
    async fn handle_upload(&self, session: &Session, fragment: UploadFragment) -> Vec<Message> {
        let id = fragment.id;
        let offset = fragment.offset;
        let len = fragment.buffer.len() as u64;
        let ack = |error: Option<String>| {
            Message::UploadAck(UploadAck {
                id,
                offset,
                written: if error.is_none() { len } else { 0 },
                error,
            })
        };

        let Some(uploads) = &self.uploads else {
            let err = ServerError::from(UploadError::Disabled);
            return vec![
                self.error_reply(id, err.to_response()),
                ack(Some(err.to_string())),
            ];
        };

        match uploads.accept(session.id(), &fragment).await {
            Ok(UploadProgress::AlreadyComplete) => vec![ack(None)],
            Ok(progress) => {
                if let Some(metrics) = &self.metrics {
                    metrics.bytes_uploaded_total.inc_by(len as f64);
                }
                let mut replies = vec![ack(None)];
                if let UploadProgress::Complete { file_path, size } = progress {
                    replies.push(Message::Response(Response::new(
                        id,
                        Value::object([
                            ("file_path", Value::from(file_path)),
                            ("size", Value::from(size)),
                        ]),
                    )));
                }
                replies
            }
            Err(e) if e.is_fatal() => {
                uploads.abort(session.id(), id);
                let message = e.to_string();
                let err = ServerError::from(e);
                // The request fails before the ack so the client stops
                // retrying.
                vec![self.error_reply(id, err.to_response()), ack(Some(message))]
            }
            Err(e) => {
                debug!("[{}] upload fragment failed: {}", session.remote_addr, e);
                vec![ack(Some(e.to_string()))]
            }
        }
    }

    fn error_reply(&self, request_id: u64, mut response: ErrorResponse) -> Message {
        if !self.expose_stack {
            response.stack = None;
        }
        if let Some(metrics) = &self.metrics {
            metrics
                .errors_total
                .with_label_values(&[response.code.as_str()])
                .inc();
        }
        Message::Error(response.for_request(request_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::MemoryDriver;
    use crate::service::{MethodTable, ServiceDef, ServiceError};
    use crate::session::Identity;
    use crate::upload::LocalFileStorage;
    use bytes::Bytes;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn handler() -> CommandHandler {
        let mut services = ServiceRegistry::new();
        services.register(ServiceDef::new("Echo", |_| {
            MethodTable::new()
                .sync_method("echo", |_, params| Ok(params.into_iter().next().unwrap_or_default()))
                .sync_method("fail", |_, _| {
                    Err(ServiceError::business("OopsError", "oops").with_stack("at fail"))
                })
        }));
        CommandHandler::new(
            Arc::new(services),
            Arc::new(EventRegistry::new()),
            Arc::new(ResourceTable::new(Some(Arc::new(MemoryDriver::new())))),
        )
    }

    fn session(handler: &CommandHandler, connection_id: u64) -> Session {
        let identity = Identity {
            connection_id,
            client_id: format!("client-{connection_id}"),
            client_name: None,
            authenticated: false,
            permissions: Default::default(),
        };
        Session::new(
            "127.0.0.1:4000".parse().unwrap(),
            identity,
            handler.events().clone(),
            handler.resources().clone(),
        )
    }

    fn request(id: u64, command: &str, params: Vec<Value>) -> Message {
        Message::Request(Request::new(id, command).with_params(params))
    }

    #[tokio::test]
    async fn test_request_response() {
        let handler = handler();
        let session = session(&handler, 1);

        let replies = handler
            .handle(&session, request(1, "Echo.echo", vec!["hi".into()]))
            .await;
        assert_eq!(
            replies,
            vec![Message::Response(Response::new(1, Value::from("hi")))]
        );

        let replies = handler.handle(&session, request(2, "Missing.x", vec![])).await;
        match &replies[0] {
            Message::Error(err) => {
                assert_eq!(err.request_id, Some(2));
                assert_eq!(err.code, "NOT_FOUND");
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        assert_eq!(session.request_count(), 2);
    }

    #[tokio::test]
    async fn test_stack_hidden_when_disabled() {
        let handler = handler();
        let session = session(&handler, 1);
        let replies = handler.handle(&session, request(1, "Echo.fail", vec![])).await;
        assert!(matches!(&replies[0], Message::Error(e) if e.stack.as_deref() == Some("at fail")));

        let handler = handler.with_expose_stack(false);
        let replies = handler.handle(&session, request(2, "Echo.fail", vec![])).await;
        match &replies[0] {
            Message::Error(e) => {
                assert_eq!(e.name, "OopsError");
                assert!(e.stack.is_none());
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_listener_lifecycle() {
        let handler = handler();
        let listener = session(&handler, 1);
        let emitter = session(&handler, 2);
        let (tx, mut rx) = mpsc::channel(8);
        handler.events().attach(1, tx);

        let add = Message::EventAdd(EventAdd {
            id: 1,
            key: "k1".into(),
            name: "UserChanged".into(),
            info: Value::object([("dept", "dev")]),
        });
        let replies = handler.handle(&listener, add.clone()).await;
        assert!(matches!(&replies[0], Message::Response(r) if r.request_id == 1));

        let replies = handler.handle(&listener, add).await;
        assert!(matches!(&replies[0], Message::Error(e) if e.code == "BAD_REQUEST"));

        let infos = handler
            .handle(
                &emitter,
                Message::EventInfos(EventInfos {
                    id: 5,
                    name: "UserChanged".into(),
                }),
            )
            .await;
        match &infos[0] {
            Message::Response(r) => {
                let list = r.body.as_array().unwrap();
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].get("key"), Some(&Value::from("k1")));
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        let data = Value::object([("dept", "dev")]);
        let replies = handler
            .handle(
                &emitter,
                Message::EventEmit(EventEmit {
                    id: 6,
                    keys: vec!["k1".into()],
                    data: data.clone(),
                }),
            )
            .await;
        assert_eq!(
            replies,
            vec![Message::Response(Response::new(6, Value::from(1usize)))]
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Message::EventNotify(EventNotify {
                keys: vec!["k1".into()],
                data,
            })
        );

        let remove = |id| {
            Message::EventRemove(EventRemove {
                id,
                key: "k1".into(),
            })
        };
        let replies = handler.handle(&listener, remove(7)).await;
        assert!(matches!(&replies[0], Message::Response(_)));
        let replies = handler.handle(&listener, remove(8)).await;
        assert!(matches!(&replies[0], Message::Error(e) if e.code == "NOT_FOUND"));
    }

    #[tokio::test]
    async fn test_upload_fragments() {
        let dir = TempDir::new().unwrap();
        let handler = handler().with_uploads(Arc::new(UploadTracker::new(Arc::new(
            LocalFileStorage::new(dir.path()),
        ))));
        let session = session(&handler, 1);

        let fragment = |offset: u64, data: &'static [u8]| {
            Message::Upload(UploadFragment {
                id: 3,
                url: String::new(),
                file_path: "out/data.bin".into(),
                offset,
                length: 6,
                buffer: Bytes::from_static(data),
            })
        };

        let replies = handler.handle(&session, fragment(0, b"abc")).await;
        assert_eq!(
            replies,
            vec![Message::UploadAck(UploadAck {
                id: 3,
                offset: 0,
                written: 3,
                error: None
            })]
        );

        let replies = handler.handle(&session, fragment(3, b"def")).await;
        assert_eq!(replies.len(), 2);
        match &replies[1] {
            Message::Response(r) => {
                assert_eq!(r.request_id, 3);
                assert_eq!(r.body.get("size").and_then(Value::as_u64), Some(6));
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        assert_eq!(
            std::fs::read(dir.path().join("out/data.bin")).unwrap(),
            b"abcdef"
        );
    }

    #[tokio::test]
    async fn test_retried_fragment_after_completion_only_acked() {
        let dir = TempDir::new().unwrap();
        let handler = handler().with_uploads(Arc::new(UploadTracker::new(Arc::new(
            LocalFileStorage::new(dir.path()),
        ))));
        let session = session(&handler, 1);
        let fragment = Message::Upload(UploadFragment {
            id: 9,
            url: String::new(),
            file_path: "once.bin".into(),
            offset: 0,
            length: 3,
            buffer: Bytes::from_static(b"one"),
        });

        let replies = handler.handle(&session, fragment.clone()).await;
        assert_eq!(replies.len(), 2);
        assert!(matches!(&replies[1], Message::Response(r) if r.request_id == 9));

        let replies = handler.handle(&session, fragment).await;
        assert_eq!(
            replies,
            vec![Message::UploadAck(UploadAck {
                id: 9,
                offset: 0,
                written: 3,
                error: None
            })]
        );
        assert_eq!(handler.uploads().unwrap().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_upload_disabled_fails_request() {
        let handler = handler();
        let session = session(&handler, 1);
        let replies = handler
            .handle(
                &session,
                Message::Upload(UploadFragment {
                    id: 9,
                    url: String::new(),
                    file_path: "f".into(),
                    offset: 0,
                    length: 1,
                    buffer: Bytes::from_static(b"x"),
                }),
            )
            .await;
        assert!(matches!(&replies[0], Message::Error(e) if e.code == "UPLOAD_FAILED"));
        assert!(matches!(&replies[1], Message::UploadAck(a) if a.error.is_some()));
    }
}
