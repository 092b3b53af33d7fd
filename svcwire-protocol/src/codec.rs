//! Encoder and decoder between messages and frames.
//!
//! Outbound, a JSON message larger than the split threshold is cut into
//! `SPLIT` frames. Inbound, fragments are reassembled and the completed
//! payload decoded as one message. A bad logical message is reported as
//! [`Inbound::Rejected`] so the connection can answer it; only framing
//! errors are returned as `Err` and should end the connection.

use crate::error::ProtocolError;
use crate::frame::{Frame, FrameFlags};
use crate::message::{Message, Progress, UploadFragment, UploadHeader};
use crate::split::{self, Assembly, Reassembler};
use crate::value::{self, HIDDEN_BINARY};
use bytes::{Bytes, BytesMut};
use serde_json::Value as Json;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Limits applied when encoding.
#[derive(Debug, Clone, Copy)]
pub struct SplitConfig {
    /// Messages whose JSON payload exceeds this many bytes are split.
    pub threshold: usize,
    /// Maximum payload bytes per fragment.
    pub chunk_size: usize,
    /// Hard cap on the size of one logical message.
    pub max_message_size: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            threshold: crate::DEFAULT_SPLIT_THRESHOLD,
            chunk_size: crate::DEFAULT_SPLIT_CHUNK,
            max_message_size: crate::MAX_MESSAGE_SIZE,
        }
    }
}

/// Frames produced for one outbound message.
#[derive(Debug)]
pub struct Outbound {
    pub frames: Vec<Bytes>,
    /// Set when the message was split: transfer id and total size.
    pub transfer: Option<(Uuid, u64)>,
}

/// Encodes messages into frames.
#[derive(Debug, Clone, Default)]
pub struct Encoder {
    config: SplitConfig,
}

impl Encoder {
    pub fn new(config: SplitConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SplitConfig {
        &self.config
    }

    /// Encodes a message, splitting it if it is over the threshold.
    pub fn encode(&self, message: &Message) -> Result<Outbound, ProtocolError> {
        match message {
            Message::Split(_) | Message::Upload(_) => Ok(Outbound {
                frames: vec![encode_frame(message)?.freeze()],
                transfer: None,
            }),
            _ => {
                let payload = Bytes::from(serde_json::to_vec(message)?);
                if payload.len() <= self.config.threshold {
                    return Ok(Outbound {
                        frames: vec![Frame::new(payload).encode()?.freeze()],
                        transfer: None,
                    });
                }

                let id = Uuid::new_v4();
                let fragments = split::split(
                    id,
                    &payload,
                    self.config.chunk_size,
                    self.config.max_message_size,
                )?;
                let frames = fragments
                    .into_iter()
                    .map(|f| encode_frame(&Message::Split(f)).map(BytesMut::freeze))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Outbound {
                    frames,
                    transfer: Some((id, payload.len() as u64)),
                })
            }
        }
    }
}

/// Encodes a message as exactly one frame, without splitting.
pub fn encode_frame(message: &Message) -> Result<BytesMut, ProtocolError> {
    match message {
        Message::Split(fragment) => Frame::with_extension(
            FrameFlags::new().with_split(),
            split::encode_header(fragment),
            fragment.data.clone(),
        )
        .encode(),
        Message::Upload(fragment) => {
            let header = serde_json::to_vec(&fragment.header())?;
            Frame::with_extension(
                FrameFlags::new().with_upload(),
                Bytes::from(header),
                fragment.buffer.clone(),
            )
            .encode()
        }
        _ => Frame::from_json(message)?.encode(),
    }
}

/// Something the decoder produced.
#[derive(Debug)]
pub enum Inbound {
    /// A complete logical message.
    Message(Message),
    /// A fragment was accepted; the transfer is still collecting.
    Progress(Progress),
    /// A logical message was discarded.
    Rejected(Rejection),
}

/// A discarded logical message and what is known about it.
#[derive(Debug)]
pub struct Rejection {
    pub request_id: Option<u64>,
    pub transfer: Option<Uuid>,
    pub error: ProtocolError,
}

/// Decodes frames into messages, reassembling split transfers.
pub struct Decoder {
    buffer: BytesMut,
    reassembler: Reassembler,
}

impl Decoder {
    pub fn new(max_message_size: u64, reassembly_timeout: Duration) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            reassembler: Reassembler::new(max_message_size, reassembly_timeout),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Access to the reassembler, for observers and purging.
    pub fn reassembler_mut(&mut self) -> &mut Reassembler {
        &mut self.reassembler
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer)
    }

    /// Attempts to decode the next inbound item from the buffer.
    ///
    /// Fragments of an already failed transfer are consumed silently.
    pub fn next_inbound(&mut self) -> Result<Option<Inbound>, ProtocolError> {
        loop {
            let Some(frame) = self.decode_frame()? else {
                return Ok(None);
            };
            if let Some(inbound) = self.handle_frame(frame) {
                return Ok(Some(inbound));
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Option<Inbound> {
        if frame.flags.is_split() {
            let fragment = match split::decode_header(&frame.header_extension, frame.payload) {
                Ok(fragment) => fragment,
                Err(error) => {
                    return Some(Inbound::Rejected(Rejection {
                        request_id: None,
                        transfer: None,
                        error,
                    }))
                }
            };
            let transfer = fragment.id;
            return match self.reassembler.accept(fragment) {
                Ok(Assembly::Complete { payload, .. }) => Some(match decode_payload(&payload) {
                    Ok(message) => Inbound::Message(message),
                    Err(mut rejection) => {
                        rejection.transfer = Some(transfer);
                        Inbound::Rejected(rejection)
                    }
                }),
                Ok(assembly) => assembly.progress().map(Inbound::Progress),
                Err(error) => Some(Inbound::Rejected(Rejection {
                    request_id: None,
                    transfer: Some(transfer),
                    error,
                })),
            };
        }

        if frame.flags.is_upload() {
            return Some(match serde_json::from_slice::<UploadHeader>(&frame.header_extension) {
                Ok(header) => Inbound::Message(Message::Upload(UploadFragment::from_parts(
                    header,
                    frame.payload,
                ))),
                Err(e) => Inbound::Rejected(Rejection {
                    request_id: None,
                    transfer: None,
                    error: e.into(),
                }),
            });
        }

        Some(match decode_payload(&frame.payload) {
            Ok(message) => Inbound::Message(message),
            Err(rejection) => Inbound::Rejected(rejection),
        })
    }

    /// Drops partial transfers idle past the reassembly timeout.
    pub fn purge_expired(&mut self, now: Instant) -> Vec<Uuid> {
        self.reassembler.purge_expired(now)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Decodes one JSON message payload.
fn decode_payload(payload: &[u8]) -> Result<Message, Rejection> {
    let text = std::str::from_utf8(payload).map_err(|_| Rejection {
        request_id: None,
        transfer: None,
        error: ProtocolError::InvalidUtf8,
    })?;

    serde_json::from_str::<Message>(text).map_err(|err| {
        // Slow path: classify the failure and recover the request id so the
        // sender gets a correlated error.
        let json: Option<Json> = serde_json::from_str(text).ok();
        let request_id = json.as_ref().and_then(|j| j.get("id")).and_then(Json::as_u64);
        let error = match json.as_ref().and_then(value::find_unsupported_tag) {
            Some(tag) => ProtocolError::UnsupportedType(tag.to_string()),
            None => ProtocolError::Json(err),
        };
        Rejection {
            request_id,
            transfer: None,
            error,
        }
    })
}

/// Decodes a standalone JSON message, for tests and tools.
pub fn decode_json(payload: &[u8]) -> Result<Message, ProtocolError> {
    decode_payload(payload).map_err(|r| r.error)
}

/// Renders a message for logs, with binary data hidden.
pub fn to_log_string(message: &Message) -> String {
    match message {
        Message::Split(f) => format!(
            "split{{id={}, index={}, length={}, bytes={}}}",
            f.id,
            f.index,
            f.length,
            f.data.len()
        ),
        Message::Upload(f) => format!(
            "upload{{id={}, path={}, offset={}, length={}, bytes={}}}",
            f.id,
            f.file_path,
            f.offset,
            f.length,
            f.buffer.len()
        ),
        _ => match serde_json::to_value(message) {
            Ok(mut json) => {
                redact_binary(&mut json);
                json.to_string()
            }
            Err(e) => format!("<{}: {}>", message.kind(), e),
        },
    }
}

fn redact_binary(json: &mut Json) {
    match json {
        Json::Array(items) => items.iter_mut().for_each(redact_binary),
        Json::Object(map) => {
            if map.get(value::TYPE_KEY).and_then(Json::as_str) == Some("Uint8Array") {
                map.insert(value::DATA_KEY.to_string(), Json::from(HIDDEN_BINARY));
            } else {
                map.values_mut().for_each(redact_binary);
            }
        }
        _ => {}
    }
}
