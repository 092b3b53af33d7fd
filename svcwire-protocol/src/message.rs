//! Protocol message types.
//!
//! Every frame carries exactly one [`Message`]. Most kinds travel as a JSON
//! envelope tagged by `"type"`; the two binary kinds, [`SplitFragment`] and
//! [`UploadFragment`], are framed separately by the codec.

use crate::error::ErrorCode;
use crate::value::{Value, WireError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// First frame of a connection, client to server.
    Hello(Hello),
    /// Handshake acceptance, server to client.
    Welcome(Welcome),
    Request(Request),
    Response(Response),
    Error(ErrorResponse),
    EventAdd(EventAdd),
    EventRemove(EventRemove),
    /// Lists the listeners registered for one event name.
    EventInfos(EventInfos),
    /// Client-originated event aimed at specific listener keys.
    EventEmit(EventEmit),
    EventNotify(EventNotify),
    Reload(Reload),
    Progress(Progress),
    UploadAck(UploadAck),
    Ping {
        nonce: u64,
    },
    Pong {
        nonce: u64,
    },
    #[serde(skip)]
    Split(SplitFragment),
    #[serde(skip)]
    Upload(UploadFragment),
}

impl Message {
    /// Short kind name, for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello(_) => "hello",
            Message::Welcome(_) => "welcome",
            Message::Request(_) => "request",
            Message::Response(_) => "response",
            Message::Error(_) => "error",
            Message::EventAdd(_) => "event_add",
            Message::EventRemove(_) => "event_remove",
            Message::EventInfos(_) => "event_infos",
            Message::EventEmit(_) => "event_emit",
            Message::EventNotify(_) => "event_notify",
            Message::Reload(_) => "reload",
            Message::Progress(_) => "progress",
            Message::UploadAck(_) => "upload_ack",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::Split(_) => "split",
            Message::Upload(_) => "upload",
        }
    }

    /// Id of the request this message opens, if it expects a reply.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Message::Request(r) => Some(r.id),
            Message::EventAdd(m) => Some(m.id),
            Message::EventRemove(m) => Some(m.id),
            Message::EventInfos(m) => Some(m.id),
            Message::EventEmit(m) => Some(m.id),
            Message::Upload(m) => Some(m.id),
            _ => None,
        }
    }
}

/// Client handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u16,
    /// Stable client identity. A new connection with the same id replaces
    /// the previous one.
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Server handshake reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    pub connection_id: u64,
    pub server_name: String,
    pub server_version: String,
    pub max_message_size: u64,
    pub split_threshold: u64,
}

/// Remote method invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    /// Caller context, such as the originating client path.
    #[serde(default)]
    pub url: String,
    /// `"Service.method"`.
    pub command: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl Request {
    pub fn new(id: u64, command: impl Into<String>) -> Self {
        Self {
            id,
            url: String::new(),
            command: command.into(),
            params: Vec::new(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    /// Splits the command into service and method names.
    pub fn target(&self) -> Option<(&str, &str)> {
        self.command
            .split_once('.')
            .filter(|(service, method)| !service.is_empty() && !method.is_empty())
    }
}

/// Successful result of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub request_id: u64,
    #[serde(default)]
    pub body: Value,
}

impl Response {
    pub fn new(request_id: u64, body: Value) -> Self {
        Self { request_id, body }
    }
}

/// Failed result of a request, or a protocol failure with no request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    pub name: String,
    pub message: String,
    /// Stable code; see [`ErrorCode`]. Business errors may use their own.
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            request_id: None,
            name: "Error".to_string(),
            message: message.into(),
            code: code.as_str().to_string(),
            stack: None,
            detail: None,
        }
    }

    pub fn for_request(mut self, request_id: u64) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Returns the well-known code, if this is one.
    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(&self.code)
    }

    /// Converts into an error value, keeping code and detail as fields.
    pub fn into_wire_error(self) -> WireError {
        let mut err = WireError::new(self.name, self.message).with_field("code", self.code);
        err.stack = self.stack;
        if let Some(detail) = self.detail {
            err = err.with_field("detail", detail);
        }
        err
    }
}

/// Registers interest in an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventAdd {
    pub id: u64,
    /// Client-generated token, unique per connection while registered.
    pub key: String,
    pub name: String,
    /// Opaque filter data, interpreted only by the emitting code.
    #[serde(default)]
    pub info: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRemove {
    pub id: u64,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventInfos {
    pub id: u64,
    pub name: String,
}

/// One entry of an [`EventInfos`] reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerInfo {
    pub key: String,
    #[serde(default)]
    pub info: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEmit {
    pub id: u64,
    pub keys: Vec<String>,
    #[serde(default)]
    pub data: Value,
}

/// Event delivery. `keys` holds only the receiving connection's keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventNotify {
    pub keys: Vec<String>,
    #[serde(default)]
    pub data: Value,
}

/// Development reload notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(default)]
    pub changed_files: Vec<String>,
}

/// Progress of a split transfer, sent by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub id: Uuid,
    pub total_size: u64,
    pub completed_size: u64,
}

/// Acknowledgement of one upload fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadAck {
    pub id: u64,
    pub offset: u64,
    pub written: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One chunk of a larger logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitFragment {
    /// Transfer id shared by all fragments of one message.
    pub id: Uuid,
    /// 0-based position of this fragment.
    pub index: u32,
    /// Total byte length of the original message.
    pub length: u64,
    pub data: Bytes,
}

/// Upload metadata carried in an `UPLOAD` frame's header extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadHeader {
    pub id: u64,
    #[serde(default)]
    pub url: String,
    pub file_path: String,
    pub offset: u64,
    /// Total size of the file being uploaded.
    pub length: u64,
}

/// A byte range of a file streamed to server-side storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFragment {
    pub id: u64,
    pub url: String,
    pub file_path: String,
    pub offset: u64,
    pub length: u64,
    pub buffer: Bytes,
}

impl UploadFragment {
    pub fn header(&self) -> UploadHeader {
        UploadHeader {
            id: self.id,
            url: self.url.clone(),
            file_path: self.file_path.clone(),
            offset: self.offset,
            length: self.length,
        }
    }

    pub fn from_parts(header: UploadHeader, buffer: Bytes) -> Self {
        Self {
            id: header.id,
            url: header.url,
            file_path: header.file_path,
            offset: header.offset,
            length: header.length,
            buffer,
        }
    }
}
