//! Binary wire format for console <-> gateway shell frames.
//!
//! ```text
//! frame  := id(16) kind(u8) body_len(varint) body
//! body   := field*
//! field  := tag(u8) len(varint) value
//! ```
//!
//! Exactly one payload kind per frame. Unknown kinds decode to
//! [`Payload::Unknown`] and unknown field tags are skipped, so newer peers can
//! add message kinds without breaking older decoders.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use uuid::Uuid;

use super::token::SessionToken;

pub mod kind {
    pub const SHELL_CONNECT: u8 = 1;
    pub const SHELL_INPUT: u8 = 2;
    pub const SHELL_RESIZE: u8 = 3;
    pub const SHELL_OUTPUT: u8 = 4;
    pub const SHELL_ERROR: u8 = 5;
    pub const SHELL_DISCONNECT: u8 = 6;
}

mod field {
    pub const TOKEN: u8 = 1;
    pub const CMD: u8 = 2;
    pub const ROWS: u8 = 3;
    pub const COLS: u8 = 4;
    pub const DATA: u8 = 5;
    pub const ERROR: u8 = 6;
    pub const MAX: usize = 6;
}

const ID_LEN: usize = 16;
const MAX_VARINT_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("frame truncated")]
    Truncated,
    #[error("length prefix overflows u32")]
    VarintOverflow,
    #[error("{kind} frame is missing field '{field}'")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
    #[error("field '{field}' has invalid width {len}")]
    InvalidWidth { field: &'static str, len: usize },
    #[error("field '{field}' is not valid utf-8")]
    InvalidUtf8 { field: &'static str },
    #[error("{0} trailing bytes after frame body")]
    TrailingBytes(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellConnect {
    pub token: SessionToken,
    pub cmd: String,
    pub rows: u16,
    pub cols: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellInput {
    pub token: SessionToken,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellResize {
    pub token: SessionToken,
    pub rows: u16,
    pub cols: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    pub token: SessionToken,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellError {
    pub token: SessionToken,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellDisconnect {
    pub token: SessionToken,
}

/// Frame payload. One variant per message kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// console -> agent: start a shell of variant `cmd`
    ShellConnect(ShellConnect),
    /// console -> agent: operator keystrokes, verbatim
    ShellInput(ShellInput),
    /// console -> agent: terminal geometry changed
    ShellResize(ShellResize),
    /// agent -> console: shell output, verbatim
    ShellOutput(ShellOutput),
    /// agent -> console: session failed
    ShellError(ShellError),
    /// console -> agent: best-effort notice that the session was closed locally
    ShellDisconnect(ShellDisconnect),
    /// A kind this build does not know. Never constructed for sending.
    Unknown { kind: u8 },
}

impl Payload {
    pub fn kind(&self) -> u8 {
        match self {
            Payload::ShellConnect(_) => kind::SHELL_CONNECT,
            Payload::ShellInput(_) => kind::SHELL_INPUT,
            Payload::ShellResize(_) => kind::SHELL_RESIZE,
            Payload::ShellOutput(_) => kind::SHELL_OUTPUT,
            Payload::ShellError(_) => kind::SHELL_ERROR,
            Payload::ShellDisconnect(_) => kind::SHELL_DISCONNECT,
            Payload::Unknown { kind } => *kind,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Payload::ShellConnect(_) => "ShellConnect",
            Payload::ShellInput(_) => "ShellInput",
            Payload::ShellResize(_) => "ShellResize",
            Payload::ShellOutput(_) => "ShellOutput",
            Payload::ShellError(_) => "ShellError",
            Payload::ShellDisconnect(_) => "ShellDisconnect",
            Payload::Unknown { .. } => "Unknown",
        }
    }

    pub fn token(&self) -> Option<SessionToken> {
        match self {
            Payload::ShellConnect(m) => Some(m.token),
            Payload::ShellInput(m) => Some(m.token),
            Payload::ShellResize(m) => Some(m.token),
            Payload::ShellOutput(m) => Some(m.token),
            Payload::ShellError(m) => Some(m.token),
            Payload::ShellDisconnect(m) => Some(m.token),
            Payload::Unknown { .. } => None,
        }
    }
}

/// Envelope: a correlation id plus exactly one payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Transport-level correlation id, independent of the session token
    pub id: Uuid,
    pub payload: Payload,
}

impl Frame {
    pub fn new(payload: Payload) -> Self {
        Frame {
            id: Uuid::new_v4(),
            payload,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        match &self.payload {
            Payload::ShellConnect(m) => {
                put_field(&mut body, field::TOKEN, m.token.as_bytes());
                put_field(&mut body, field::CMD, m.cmd.as_bytes());
                put_field(&mut body, field::ROWS, &m.rows.to_be_bytes());
                put_field(&mut body, field::COLS, &m.cols.to_be_bytes());
            }
            Payload::ShellInput(m) => {
                put_field(&mut body, field::TOKEN, m.token.as_bytes());
                put_field(&mut body, field::DATA, &m.data);
            }
            Payload::ShellResize(m) => {
                put_field(&mut body, field::TOKEN, m.token.as_bytes());
                put_field(&mut body, field::ROWS, &m.rows.to_be_bytes());
                put_field(&mut body, field::COLS, &m.cols.to_be_bytes());
            }
            Payload::ShellOutput(m) => {
                put_field(&mut body, field::TOKEN, m.token.as_bytes());
                put_field(&mut body, field::DATA, &m.data);
            }
            Payload::ShellError(m) => {
                put_field(&mut body, field::TOKEN, m.token.as_bytes());
                put_field(&mut body, field::ERROR, m.error.as_bytes());
            }
            Payload::ShellDisconnect(m) => {
                put_field(&mut body, field::TOKEN, m.token.as_bytes());
            }
            Payload::Unknown { .. } => {}
        }

        let mut buf = BytesMut::with_capacity(ID_LEN + 1 + MAX_VARINT_LEN + body.len());
        buf.put_slice(self.id.as_bytes());
        buf.put_u8(self.payload.kind());
        put_varint(&mut buf, body.len() as u32);
        buf.put(body);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Frame, CodecError> {
        if buf.len() < ID_LEN + 1 {
            return Err(CodecError::Truncated);
        }
        let mut id = [0u8; ID_LEN];
        buf.copy_to_slice(&mut id);
        let kind = buf.get_u8();
        let body_len = get_varint(&mut buf)? as usize;
        if buf.len() < body_len {
            return Err(CodecError::Truncated);
        }
        let body = buf.split_to(body_len);
        if !buf.is_empty() {
            return Err(CodecError::TrailingBytes(buf.len()));
        }

        let payload = match kind {
            kind::SHELL_CONNECT => {
                let fields = Fields::parse(body)?;
                Payload::ShellConnect(ShellConnect {
                    token: fields.token("ShellConnect")?,
                    cmd: fields.text("ShellConnect", field::CMD, "cmd")?,
                    rows: fields.u16("ShellConnect", field::ROWS, "rows")?,
                    cols: fields.u16("ShellConnect", field::COLS, "cols")?,
                })
            }
            kind::SHELL_INPUT => {
                let fields = Fields::parse(body)?;
                Payload::ShellInput(ShellInput {
                    token: fields.token("ShellInput")?,
                    data: fields.bytes(field::DATA),
                })
            }
            kind::SHELL_RESIZE => {
                let fields = Fields::parse(body)?;
                Payload::ShellResize(ShellResize {
                    token: fields.token("ShellResize")?,
                    rows: fields.u16("ShellResize", field::ROWS, "rows")?,
                    cols: fields.u16("ShellResize", field::COLS, "cols")?,
                })
            }
            kind::SHELL_OUTPUT => {
                let fields = Fields::parse(body)?;
                Payload::ShellOutput(ShellOutput {
                    token: fields.token("ShellOutput")?,
                    data: fields.bytes(field::DATA),
                })
            }
            kind::SHELL_ERROR => {
                let fields = Fields::parse(body)?;
                Payload::ShellError(ShellError {
                    token: fields.token("ShellError")?,
                    error: fields.optional_text(field::ERROR, "error")?,
                })
            }
            kind::SHELL_DISCONNECT => {
                let fields = Fields::parse(body)?;
                Payload::ShellDisconnect(ShellDisconnect {
                    token: fields.token("ShellDisconnect")?,
                })
            }
            other => Payload::Unknown { kind: other },
        };

        Ok(Frame {
            id: Uuid::from_bytes(id),
            payload,
        })
    }
}

/// Known fields of one frame body, indexed by tag. Last occurrence wins.
struct Fields {
    values: [Option<Bytes>; field::MAX + 1],
}

impl Fields {
    fn parse(mut body: Bytes) -> Result<Self, CodecError> {
        let mut values: [Option<Bytes>; field::MAX + 1] = Default::default();
        while body.has_remaining() {
            let tag = body.get_u8();
            let len = get_varint(&mut body)? as usize;
            if body.len() < len {
                return Err(CodecError::Truncated);
            }
            let value = body.split_to(len);
            let index = tag as usize;
            if index != 0 && index <= field::MAX {
                values[index] = Some(value);
            }
        }
        Ok(Fields { values })
    }

    fn get(&self, tag: u8) -> Option<&Bytes> {
        self.values[tag as usize].as_ref()
    }

    fn token(&self, kind: &'static str) -> Result<SessionToken, CodecError> {
        let value = self.get(field::TOKEN).ok_or(CodecError::MissingField {
            kind,
            field: "token",
        })?;
        let bytes: [u8; 16] = value[..].try_into().map_err(|_| CodecError::InvalidWidth {
            field: "token",
            len: value.len(),
        })?;
        Ok(SessionToken::from_bytes(bytes))
    }

    fn text(&self, kind: &'static str, tag: u8, name: &'static str) -> Result<String, CodecError> {
        let value = self
            .get(tag)
            .ok_or(CodecError::MissingField { kind, field: name })?;
        String::from_utf8(value.to_vec()).map_err(|_| CodecError::InvalidUtf8 { field: name })
    }

    fn optional_text(&self, tag: u8, name: &'static str) -> Result<String, CodecError> {
        match self.get(tag) {
            Some(value) => String::from_utf8(value.to_vec())
                .map_err(|_| CodecError::InvalidUtf8 { field: name }),
            None => Ok(String::new()),
        }
    }

    fn u16(&self, kind: &'static str, tag: u8, name: &'static str) -> Result<u16, CodecError> {
        let value = self
            .get(tag)
            .ok_or(CodecError::MissingField { kind, field: name })?;
        let bytes: [u8; 2] = value[..].try_into().map_err(|_| CodecError::InvalidWidth {
            field: name,
            len: value.len(),
        })?;
        Ok(u16::from_be_bytes(bytes))
    }

    fn bytes(&self, tag: u8) -> Bytes {
        self.get(tag).cloned().unwrap_or_default()
    }
}

fn put_field(buf: &mut BytesMut, tag: u8, value: &[u8]) {
    buf.put_u8(tag);
    put_varint(buf, value.len() as u32);
    buf.put_slice(value);
}

fn put_varint(buf: &mut BytesMut, mut value: u32) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn get_varint(buf: &mut Bytes) -> Result<u32, CodecError> {
    let mut value: u32 = 0;
    for i in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(CodecError::Truncated);
        }
        let byte = buf.get_u8();
        let chunk = (byte & 0x7f) as u32;
        // the fifth byte may only carry the top 4 bits of a u32
        if i == MAX_VARINT_LEN - 1 && chunk > 0x0f {
            return Err(CodecError::VarintOverflow);
        }
        value |= chunk << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(CodecError::VarintOverflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn round_trip(payload: Payload) -> Frame {
        let frame = Frame::new(payload);
        let decoded = Frame::decode(frame.encode()).unwrap();
        assert_eq!(decoded, frame);
        decoded
    }

    #[test]
    fn test_connect_frame_layout() {
        let token = SessionToken::generate();
        let frame = Frame::new(Payload::ShellConnect(ShellConnect {
            token,
            cmd: "bash".into(),
            rows: 24,
            cols: 80,
        }));
        let encoded = frame.encode();

        assert_eq!(&encoded[..16], frame.id.as_bytes());
        assert_eq!(encoded[16], kind::SHELL_CONNECT);
        // token(2+16) + cmd(2+4) + rows(2+2) + cols(2+2)
        assert_eq!(encoded[17], 32);
        assert_eq!(encoded.len(), 18 + 32);
        round_trip(frame.payload);
    }

    #[test]
    fn test_binary_data_survives_unchanged() {
        let data: Vec<u8> = (0..=255u8).chain([0x1b, b'[', b'2', b'J', 0xff, 0xfe]).collect();
        let decoded = round_trip(Payload::ShellOutput(ShellOutput {
            token: SessionToken::generate(),
            data: Bytes::from(data.clone()),
        }));
        match decoded.payload {
            Payload::ShellOutput(out) => assert_eq!(out.data.to_vec(), data),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_error_and_disconnect_frames() {
        round_trip(Payload::ShellError(ShellError {
            token: SessionToken::generate(),
            error: "Agent is offline".into(),
        }));
        round_trip(Payload::ShellDisconnect(ShellDisconnect {
            token: SessionToken::generate(),
        }));
        round_trip(Payload::ShellResize(ShellResize {
            token: SessionToken::generate(),
            rows: 50,
            cols: 200,
        }));
    }

    #[test]
    fn test_unknown_kind_is_skipped_not_rejected() {
        let mut buf = BytesMut::new();
        buf.put_slice(Uuid::new_v4().as_bytes());
        buf.put_u8(42);
        put_varint(&mut buf, 3);
        buf.put_slice(&[9, 1, 0]);

        let frame = Frame::decode(buf.freeze()).unwrap();
        assert_eq!(frame.payload, Payload::Unknown { kind: 42 });
        assert_eq!(frame.payload.token(), None);
    }

    #[test]
    fn test_unknown_field_inside_known_kind_is_ignored() {
        let token = SessionToken::generate();
        let mut body = BytesMut::new();
        put_field(&mut body, 99, b"future extension");
        put_field(&mut body, field::TOKEN, token.as_bytes());
        put_field(&mut body, field::DATA, b"$ ");

        let mut buf = BytesMut::new();
        buf.put_slice(Uuid::new_v4().as_bytes());
        buf.put_u8(kind::SHELL_OUTPUT);
        put_varint(&mut buf, body.len() as u32);
        buf.put(body);

        match Frame::decode(buf.freeze()).unwrap().payload {
            Payload::ShellOutput(out) => {
                assert_eq!(out.token, token);
                assert_eq!(&out.data[..], b"$ ");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_large_payload_uses_multibyte_length() {
        let data = Bytes::from(vec![b'x'; 70_000]);
        let frame = Frame::new(Payload::ShellInput(ShellInput {
            token: SessionToken::generate(),
            data: data.clone(),
        }));
        let encoded = frame.encode();
        assert!(encoded[17] & 0x80 != 0);
        assert_eq!(Frame::decode(encoded).unwrap(), frame);
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        let token = SessionToken::generate();
        let encoded = Frame::new(Payload::ShellResize(ShellResize {
            token,
            rows: 1,
            cols: 1,
        }))
        .encode();

        assert_eq!(
            Frame::decode(encoded.slice(..encoded.len() - 1)),
            Err(CodecError::Truncated)
        );

        let mut extended = BytesMut::from(&encoded[..]);
        extended.put_u8(0);
        assert_eq!(
            Frame::decode(extended.freeze()),
            Err(CodecError::TrailingBytes(1))
        );

        let mut buf = BytesMut::new();
        buf.put_slice(Uuid::new_v4().as_bytes());
        buf.put_u8(kind::SHELL_INPUT);
        put_varint(&mut buf, 0);
        assert_eq!(
            Frame::decode(buf.freeze()),
            Err(CodecError::MissingField {
                kind: "ShellInput",
                field: "token"
            })
        );

        let mut body = BytesMut::new();
        put_field(&mut body, field::TOKEN, token.as_bytes());
        put_field(&mut body, field::CMD, &[0xff, 0xfe]);
        put_field(&mut body, field::ROWS, &[0, 24]);
        put_field(&mut body, field::COLS, &[0, 80]);
        let mut buf = BytesMut::new();
        buf.put_slice(Uuid::new_v4().as_bytes());
        buf.put_u8(kind::SHELL_CONNECT);
        put_varint(&mut buf, body.len() as u32);
        buf.put(body);
        assert_eq!(
            Frame::decode(buf.freeze()),
            Err(CodecError::InvalidUtf8 { field: "cmd" })
        );
    }

    #[test]
    fn test_varint_overflow() {
        let mut buf = Bytes::from_static(&[0xff, 0xff, 0xff, 0xff, 0x7f]);
        assert_eq!(get_varint(&mut buf), Err(CodecError::VarintOverflow));
        let mut buf = Bytes::from_static(&[0xff, 0xff, 0xff, 0xff, 0x0f]);
        assert_eq!(get_varint(&mut buf), Ok(u32::MAX));
    }
}
