//! Binary frame format.
//!
//! Frame layout (18 bytes header + optional header extension + payload):
//!
//! ```text
//! +--------+---------+--------+------------+-------------+--------+
//! | magic  | version | flags  | header_len | payload_len | crc32c |
//! | 4 bytes| 2 bytes |2 bytes |  2 bytes   |   4 bytes   | 4 bytes|
//! +--------+---------+--------+------------+-------------+--------+
//! | [header_ext] | payload                                        |
//! | header_len   | payload_len bytes                              |
//! +--------------+------------------------------------------------+
//! ```
//!
//! A plain frame carries one JSON message envelope. A `SPLIT` frame carries
//! the binary split header in its extension and a raw chunk as payload; an
//! `UPLOAD` frame carries JSON upload metadata in its extension and raw file
//! bytes as payload.

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes identifying svcwire frames: "SVCW"
pub const MAGIC: [u8; 4] = *b"SVCW";

/// Size of the fixed frame header in bytes (4+2+2+2+4+4 = 18).
pub const FRAME_HEADER_SIZE: usize = 18;

/// Frame flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u16);

impl FrameFlags {
    /// CRC32C checksum is present and valid.
    pub const CRC_PRESENT: u16 = 1 << 0;
    /// Payload is one fragment of a split message.
    pub const SPLIT: u16 = 1 << 1;
    /// Payload is a byte range of an uploaded file.
    pub const UPLOAD: u16 = 1 << 2;

    /// Valid flags mask for protocol version 1.
    const VALID_V1_MASK: u16 = 0x0007;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_crc(mut self) -> Self {
        self.0 |= Self::CRC_PRESENT;
        self
    }

    pub fn with_split(mut self) -> Self {
        self.0 |= Self::SPLIT;
        self
    }

    pub fn with_upload(mut self) -> Self {
        self.0 |= Self::UPLOAD;
        self
    }

    pub fn has_crc(&self) -> bool {
        self.0 & Self::CRC_PRESENT != 0
    }

    pub fn is_split(&self) -> bool {
        self.0 & Self::SPLIT != 0
    }

    pub fn is_upload(&self) -> bool {
        self.0 & Self::UPLOAD != 0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Result<Self, ProtocolError> {
        if bits & !Self::VALID_V1_MASK != 0 {
            return Err(ProtocolError::InvalidFlags(bits));
        }
        // A frame is either a fragment or an upload range, never both.
        if bits & Self::SPLIT != 0 && bits & Self::UPLOAD != 0 {
            return Err(ProtocolError::InvalidFlags(bits));
        }
        Ok(Self(bits))
    }
}

/// A parsed frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Protocol version.
    pub version: u16,
    /// Frame flags.
    pub flags: FrameFlags,
    /// Header extension: split header or upload metadata.
    pub header_extension: Bytes,
    /// Frame payload.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new frame with the given payload.
    pub fn new(payload: Bytes) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            flags: FrameFlags::new().with_crc(),
            header_extension: Bytes::new(),
            payload,
        }
    }

    /// Creates a new frame from a JSON-serializable value.
    pub fn from_json<T: serde::Serialize>(value: &T) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(Bytes::from(payload)))
    }

    /// Creates a frame carrying a header extension next to a raw payload.
    pub fn with_extension(flags: FrameFlags, header_extension: Bytes, payload: Bytes) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            flags: flags.with_crc(),
            header_extension,
            payload,
        }
    }

    /// Total encoded size of this frame.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.header_extension.len() + self.payload.len()
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: u32::try_from(self.payload.len()).unwrap_or(u32::MAX),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let payload_len = self.payload.len() as u32;

        let header_len = u16::try_from(self.header_extension.len())
            .map_err(|_| ProtocolError::Unframeable("header extension exceeds 64 KiB"))?;
        let mut buf = BytesMut::with_capacity(self.encoded_len());

        buf.put_slice(&MAGIC);
        buf.put_u16(self.version);
        buf.put_u16(self.flags.bits());
        buf.put_u16(header_len);
        buf.put_u32(payload_len);

        let crc = if self.flags.has_crc() {
            crc32c::crc32c(&self.payload)
        } else {
            0
        };
        buf.put_u32(crc);

        if !self.header_extension.is_empty() {
            buf.put_slice(&self.header_extension);
        }
        buf.put_slice(&self.payload);

        Ok(buf)
    }

    /// Decodes a frame from bytes.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Peek at header without consuming
        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let version = u16::from_be_bytes([buf[4], buf[5]]);
        if version != crate::PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let flags = FrameFlags::from_bits(u16::from_be_bytes([buf[6], buf[7]]))?;

        let header_len = u16::from_be_bytes([buf[8], buf[9]]) as usize;
        let payload_len = u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]);

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let payload_len = payload_len as usize;

        let crc_expected = u32::from_be_bytes([buf[14], buf[15], buf[16], buf[17]]);

        let total_len = FRAME_HEADER_SIZE + header_len + payload_len;
        if buf.len() < total_len {
            buf.reserve(total_len - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let header_extension = buf.split_to(header_len).freeze();
        let payload = buf.split_to(payload_len).freeze();

        if flags.has_crc() {
            let crc_actual = crc32c::crc32c(&payload);
            if crc_actual != crc_expected {
                return Err(ProtocolError::CrcMismatch {
                    expected: crc_expected,
                    actual: crc_actual,
                });
            }
        }

        Ok(Some(Self {
            version,
            flags,
            header_extension,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let payload = Bytes::from(r#"{"type":"ping","nonce":1}"#);
        let frame = Frame::new(payload.clone());

        let mut buf = frame.encode().unwrap();
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.version, crate::PROTOCOL_VERSION);
        assert!(decoded.flags.has_crc());
        assert!(!decoded.flags.is_split());
        assert_eq!(decoded.payload, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_crc_validation() {
        let frame = Frame::new(Bytes::from(r#"{"test":"data"}"#));
        let mut encoded = frame.encode().unwrap();

        let len = encoded.len();
        encoded[len - 1] ^= 0xFF;

        let result = Frame::decode(&mut encoded);
        assert!(matches!(result, Err(ProtocolError::CrcMismatch { .. })));
    }

    #[test]
    fn test_invalid_magic() {
        let mut buf =
            BytesMut::from(&b"BADX\x00\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00"[..]);
        let result = Frame::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::InvalidMagic(_))));
    }

    #[test]
    fn test_incomplete_header() {
        let mut buf = BytesMut::from(&b"SVCW\x00\x01\x00\x01"[..]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_incomplete_payload_keeps_buffer() {
        let frame = Frame::new(Bytes::from(r#"{"a":1}"#));
        let encoded = frame.encode().unwrap();

        let mut buf = BytesMut::from(&encoded[..encoded.len() - 2]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), encoded.len() - 2);

        buf.extend_from_slice(&encoded[encoded.len() - 2..]);
        assert!(Frame::decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_unsupported_version() {
        let mut buf =
            BytesMut::from(&b"SVCW\x00\x63\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00"[..]);
        let result = Frame::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::UnsupportedVersion(99))));
    }

    #[test]
    fn test_frame_flags() {
        let flags = FrameFlags::new().with_crc().with_split();
        assert!(flags.has_crc());
        assert!(flags.is_split());
        assert!(!flags.is_upload());

        let flags = FrameFlags::new().with_upload();
        assert!(flags.is_upload());
        assert!(!flags.has_crc());
    }

    #[test]
    fn test_invalid_flags() {
        let result = FrameFlags::from_bits(0x0100);
        assert!(matches!(result, Err(ProtocolError::InvalidFlags(0x0100))));

        let both = FrameFlags::SPLIT | FrameFlags::UPLOAD;
        assert!(matches!(
            FrameFlags::from_bits(both),
            Err(ProtocolError::InvalidFlags(_))
        ));
    }

    #[test]
    fn test_frame_too_large() {
        let huge_payload = vec![0u8; (MAX_PAYLOAD_SIZE + 1) as usize];
        let frame = Frame::new(Bytes::from(huge_payload));
        let result = frame.encode();
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_frame_with_header_extension() {
        let frame = Frame::with_extension(
            FrameFlags::new().with_split(),
            Bytes::from(&b"ext_data"[..]),
            Bytes::from(&b"\x00\x01\x02"[..]),
        );

        let mut buf = frame.encode().unwrap();
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();

        assert!(decoded.flags.is_split());
        assert!(decoded.flags.has_crc());
        assert_eq!(decoded.header_extension.as_ref(), b"ext_data");
        assert_eq!(decoded.payload.as_ref(), b"\x00\x01\x02");
    }

    #[test]
    fn test_frame_without_crc() {
        let mut frame = Frame::new(Bytes::from(r#"{"test":true}"#));
        frame.flags = FrameFlags::new();

        let mut buf = frame.encode().unwrap();
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();

        assert!(!decoded.flags.has_crc());
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let frame1 = Frame::new(Bytes::from(r#"{"id":"1"}"#));
        let frame2 = Frame::new(Bytes::from(r#"{"id":"2"}"#));

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame1.encode().unwrap());
        buf.extend_from_slice(&frame2.encode().unwrap());

        let decoded1 = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded1.payload.as_ref(), br#"{"id":"1"}"#);

        let decoded2 = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded2.payload.as_ref(), br#"{"id":"2"}"#);
    }
}
