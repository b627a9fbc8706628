//! Packet layout and codec.
//!
//! Every packet starts with an 8 byte header followed by a variant specific payload:
//!
//! ```text
//! offset 0: u16 size          // header + payload bytes
//! offset 2: u16 kind          // protocol family, 0 = base
//! offset 4: u16 payload_type  // 0 none, 1 error, 2 binary, 3 text, 4 wide text
//! offset 6: u16 action        // operation code, 0x8000 marks a reply
//! offset 8: payload
//! ```
//!
//! All integers are little-endian. Decoding always copies the wire bytes into an owned
//! [`Packet`]; nothing borrows from the read buffer.
use std::io::Read;

use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian},
};
use thiserror::Error;

use super::transport::read_full;

/// Size of the fixed packet header.
pub const HEADER_SIZE: usize = 8;
/// The size field is 16 bits wide, so no packet can exceed this.
pub const MAX_PACKET_SIZE: usize = u16::MAX as usize;
/// Bit set on the action of every reply.
pub const REPLY_FLAG: u16 = 0x8000;

/// Error codes carried by ERROR payloads.
pub mod error_code {
    pub const INVALID_CREDENTIALS: u32 = 1;
    pub const REPLY_TOO_LARGE: u32 = 2;
    pub const SERVICE_FAILURE: u32 = 3;
    pub const UNKNOWN_PACKET: u32 = u32::MAX;
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("packet of {size} bytes exceeds the 65535 byte limit")]
    PacketTooLarge { size: usize },
    #[error("text payload contains an embedded NUL byte")]
    EmbeddedNul,
    #[error("packet announces {size} bytes, less than the 8 byte header")]
    Undersized { size: u16 },
    #[error("connection closed after {received} of {expected} packet bytes")]
    Truncated { expected: usize, received: usize },
    #[error("packet size field says {announced} bytes but buffer holds {actual}")]
    LengthMismatch { announced: usize, actual: usize },
    #[error("unknown payload type {0}")]
    UnknownPayloadType(u16),
    #[error("{0} payload is malformed")]
    MalformedPayload(PayloadType),
    #[error("text payload is not NUL terminated")]
    MissingTerminator,
    #[error("text payload is not valid UTF-8")]
    InvalidText(#[from] std::str::Utf8Error),
    #[error("credentials field longer than 255 bytes")]
    CredentialsTooLong,
    /// The frame arrived whole but its payload could not be decoded.
    #[error("undecodable body in packet with action {:#06x}: {source}", .action.0)]
    UndecodableBody {
        kind: PacketKind,
        action: Action,
        source: Box<CodecError>,
    },
    #[error("failed to encode header: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode header: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("I/O error while reading packet: {0}")]
    Io(#[from] std::io::Error),
}

/// Protocol family namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketKind(pub u16);

impl PacketKind {
    pub const BASE: PacketKind = PacketKind(0);
}

impl Default for PacketKind {
    fn default() -> Self {
        Self::BASE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PayloadType {
    None = 0,
    Error = 1,
    Binary = 2,
    Text = 3,
    WideText = 4,
}

impl TryFrom<u16> for PayloadType {
    type Error = CodecError;

    fn try_from(value: u16) -> Result<Self, CodecError> {
        match value {
            0 => Ok(PayloadType::None),
            1 => Ok(PayloadType::Error),
            2 => Ok(PayloadType::Binary),
            3 => Ok(PayloadType::Text),
            4 => Ok(PayloadType::WideText),
            other => Err(CodecError::UnknownPayloadType(other)),
        }
    }
}

impl std::fmt::Display for PayloadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PayloadType::None => "none",
            PayloadType::Error => "error",
            PayloadType::Binary => "binary",
            PayloadType::Text => "text",
            PayloadType::WideText => "wide text",
        };
        f.write_str(name)
    }
}

/// Remote operations, the low 15 bits of an [`Action`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Operation {
    Echo = 1,
    Time = 2,
    ExecCommand = 3,
    CheckCredentials = 4,
    Ping = 5,
    Calculate = 6,
}

impl Operation {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(Operation::Echo),
            2 => Some(Operation::Time),
            3 => Some(Operation::ExecCommand),
            4 => Some(Operation::CheckCredentials),
            5 => Some(Operation::Ping),
            6 => Some(Operation::Calculate),
            _ => None,
        }
    }
}

/// Raw action field: operation code plus the reply flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action(pub u16);

impl Action {
    pub const fn request(op: Operation) -> Self {
        Action(op as u16)
    }

    /// Same operation with the reply flag set.
    pub const fn reply(self) -> Self {
        Action(self.0 | REPLY_FLAG)
    }

    pub const fn is_reply(self) -> bool {
        self.0 & REPLY_FLAG != 0
    }

    pub const fn code(self) -> u16 {
        self.0 & !REPLY_FLAG
    }

    pub fn operation(self) -> Option<Operation> {
        Operation::from_code(self.code())
    }
}

impl From<Operation> for Action {
    fn from(op: Operation) -> Self {
        Action::request(op)
    }
}

#[derive(Debug, Encode, Decode)]
struct RawHeader {
    size: u16,
    kind: u16,
    payload_type: u16,
    action: u16,
}

fn wire() -> Configuration<LittleEndian, Fixint> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    None,
    Error { code: u32, message: String },
    Binary(Vec<u8>),
    Text(String),
    /// Carried opaquely; no operation produces it.
    WideText(Vec<u8>),
}

impl Payload {
    pub fn payload_type(&self) -> PayloadType {
        match self {
            Payload::None => PayloadType::None,
            Payload::Error { .. } => PayloadType::Error,
            Payload::Binary(_) => PayloadType::Binary,
            Payload::Text(_) => PayloadType::Text,
            Payload::WideText(_) => PayloadType::WideText,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Payload::None => 0,
            Payload::Error { message, .. } => 4 + message.len() + 1,
            Payload::Binary(data) | Payload::WideText(data) => data.len(),
            Payload::Text(text) => text.len() + 1,
        }
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        match self {
            Payload::None => {}
            Payload::Error { code, message } => {
                buf.extend_from_slice(&code.to_le_bytes());
                push_cstr(buf, message)?;
            }
            Payload::Binary(data) | Payload::WideText(data) => buf.extend_from_slice(data),
            Payload::Text(text) => push_cstr(buf, text)?,
        }
        Ok(())
    }

    fn parse(payload_type: PayloadType, body: &[u8]) -> Result<Self, CodecError> {
        match payload_type {
            PayloadType::None if body.is_empty() => Ok(Payload::None),
            PayloadType::None => Err(CodecError::MalformedPayload(payload_type)),
            PayloadType::Error => {
                if body.len() < 5 {
                    return Err(CodecError::MalformedPayload(payload_type));
                }
                let (code, message) = body.split_at(4);
                let code = u32::from_le_bytes([code[0], code[1], code[2], code[3]]);
                Ok(Payload::Error {
                    code,
                    message: read_cstr(message)?,
                })
            }
            PayloadType::Binary => Ok(Payload::Binary(body.to_vec())),
            PayloadType::Text => Ok(Payload::Text(read_cstr(body)?)),
            PayloadType::WideText => Ok(Payload::WideText(body.to_vec())),
        }
    }
}

fn push_cstr(buf: &mut Vec<u8>, text: &str) -> Result<(), CodecError> {
    if text.as_bytes().contains(&0) {
        return Err(CodecError::EmbeddedNul);
    }
    buf.extend_from_slice(text.as_bytes());
    buf.push(0);
    Ok(())
}

fn read_cstr(body: &[u8]) -> Result<String, CodecError> {
    let end = body
        .iter()
        .position(|b| *b == 0)
        .ok_or(CodecError::MissingTerminator)?;
    Ok(std::str::from_utf8(&body[..end])?.to_string())
}

/// One complete header + payload unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub action: Action,
    pub payload: Payload,
}

impl Packet {
    pub fn new(kind: PacketKind, action: Action, payload: Payload) -> Self {
        Self {
            kind,
            action,
            payload,
        }
    }

    pub fn error(kind: PacketKind, action: Action, code: u32, message: impl Into<String>) -> Self {
        Self::new(
            kind,
            action,
            Payload::Error {
                code,
                message: message.into(),
            },
        )
    }

    pub fn payload_type(&self) -> PayloadType {
        self.payload.payload_type()
    }

    /// Number of bytes this packet occupies on the wire.
    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE + self.payload.encoded_len()
    }

    /// Turns a request into its reply, keeping the payload as is.
    pub fn into_reply(mut self) -> Self {
        self.action = self.action.reply();
        self
    }

    /// Whether `kind`, payload type and action all equal the expectation.
    pub fn matches(&self, kind: PacketKind, payload_type: PayloadType, action: Action) -> bool {
        self.kind == kind && self.payload_type() == payload_type && self.action == action
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Binary(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<(u32, &str)> {
        match &self.payload {
            Payload::Error { code, message } => Some((*code, message)),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let size = self.encoded_size();
        if size > MAX_PACKET_SIZE {
            return Err(CodecError::PacketTooLarge { size });
        }

        let header = RawHeader {
            size: size as u16,
            kind: self.kind.0,
            payload_type: self.payload_type() as u16,
            action: self.action.0,
        };

        let mut buf = vec![0u8; HEADER_SIZE];
        bincode::encode_into_slice(header, &mut buf, wire())?;
        buf.reserve(size - HEADER_SIZE);
        self.payload.write_body(&mut buf)?;
        Ok(buf)
    }

    /// Decodes one complete packet held in `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CodecError::Truncated {
                expected: HEADER_SIZE,
                received: bytes.len(),
            });
        }

        let (header, _): (RawHeader, usize) =
            bincode::decode_from_slice(&bytes[..HEADER_SIZE], wire())?;
        if header.size as usize != bytes.len() {
            return Err(CodecError::LengthMismatch {
                announced: header.size as usize,
                actual: bytes.len(),
            });
        }

        let (kind, action) = (PacketKind(header.kind), Action(header.action));
        let payload = PayloadType::try_from(header.payload_type)
            .and_then(|payload_type| Payload::parse(payload_type, &bytes[HEADER_SIZE..]))
            .map_err(|e| CodecError::UndecodableBody {
                kind,
                action,
                source: Box::new(e),
            })?;

        Ok(Self {
            kind,
            action,
            payload,
        })
    }

    /// Reads the 2 byte size prefix.
    ///
    /// A short read or a zero size both mean there is no packet.
    pub fn read_size<R: Read + ?Sized>(reader: &mut R) -> Result<Option<u16>, CodecError> {
        let mut size = [0u8; 2];
        if read_full(reader, &mut size)? < size.len() {
            return Ok(None);
        }

        match u16::from_le_bytes(size) {
            0 => Ok(None),
            size => Ok(Some(size)),
        }
    }

    /// Reads the `size - 2` bytes that follow the size prefix and decodes them.
    ///
    /// Running out of data here is a framing error: the prefix promised more.
    pub fn read_body<R: Read + ?Sized>(reader: &mut R, size: u16) -> Result<Self, CodecError> {
        let expected = size as usize;
        if expected < HEADER_SIZE {
            return Err(CodecError::Undersized { size });
        }

        let mut buf = vec![0u8; expected];
        buf[..2].copy_from_slice(&size.to_le_bytes());
        let received = 2 + read_full(reader, &mut buf[2..])?;
        if received < expected {
            return Err(CodecError::Truncated { expected, received });
        }

        Self::decode(&buf)
    }

    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Option<Self>, CodecError> {
        match Self::read_size(reader)? {
            Some(size) => Self::read_body(reader, size).map(Some),
            None => Ok(None),
        }
    }
}

/// Login/password pair carried in the BINARY payload of a credentials check.
///
/// Layout: login length (u8), password length (u8), login bytes, password bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

impl Credentials {
    pub fn new(login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            password: password.into(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let login_len =
            u8::try_from(self.login.len()).map_err(|_| CodecError::CredentialsTooLong)?;
        let password_len =
            u8::try_from(self.password.len()).map_err(|_| CodecError::CredentialsTooLong)?;

        let mut buf = Vec::with_capacity(2 + self.login.len() + self.password.len());
        buf.push(login_len);
        buf.push(password_len);
        buf.extend_from_slice(self.login.as_bytes());
        buf.extend_from_slice(self.password.as_bytes());
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let malformed = || CodecError::MalformedPayload(PayloadType::Binary);

        let [login_len, password_len, rest @ ..] = bytes else {
            return Err(malformed());
        };
        let (login_len, password_len) = (*login_len as usize, *password_len as usize);
        if rest.len() != login_len + password_len {
            return Err(malformed());
        }

        let (login, password) = rest.split_at(login_len);
        Ok(Self {
            login: std::str::from_utf8(login)?.to_string(),
            password: std::str::from_utf8(password)?.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn text_packet(text: &str) -> Packet {
        Packet::new(
            PacketKind::BASE,
            Action::request(Operation::Echo),
            Payload::Text(text.to_string()),
        )
    }

    #[test]
    fn text_round_trip() {
        for text in ["", "hello", "Grüße, мир"] {
            let bytes = text_packet(text).encode().unwrap();
            assert_eq!(bytes.len(), HEADER_SIZE + text.len() + 1);
            assert_eq!(
                u16::from_le_bytes([bytes[0], bytes[1]]) as usize,
                bytes.len()
            );

            let decoded = Packet::read_from(&mut Cursor::new(bytes)).unwrap().unwrap();
            assert_eq!(decoded.as_text(), Some(text));
        }
    }

    #[test]
    fn header_layout_is_little_endian() {
        let packet = Packet::new(
            PacketKind(0x0102),
            Action::request(Operation::Ping).reply(),
            Payload::Binary(vec![0xAA]),
        );
        let bytes = packet.encode().unwrap();

        assert_eq!(bytes, vec![9u8, 0, 0x02, 0x01, 2, 0, 5, 0x80, 0xAA]);
    }

    #[test]
    fn error_payload_layout() {
        let packet = Packet::error(PacketKind::BASE, Action(0x8001), 7, "bad");
        let bytes = packet.encode().unwrap();

        assert_eq!(&bytes[HEADER_SIZE..], &[7u8, 0, 0, 0, b'b', b'a', b'd', 0]);
        assert_eq!(Packet::decode(&bytes).unwrap().as_error(), Some((7, "bad")));
    }

    #[test]
    fn reply_matching_checks_all_three_fields() {
        let echo = Action::request(Operation::Echo);
        let reply = text_packet("x").into_reply();

        assert!(reply.matches(PacketKind::BASE, PayloadType::Text, echo.reply()));
        assert!(!reply.matches(PacketKind::BASE, PayloadType::Text, echo));
        assert!(!reply.matches(PacketKind::BASE, PayloadType::Binary, echo.reply()));
        assert!(!reply.matches(PacketKind(1), PayloadType::Text, echo.reply()));
    }

    #[test]
    fn action_reply_bit() {
        let action = Action::request(Operation::CheckCredentials);
        assert!(!action.is_reply());
        assert!(action.reply().is_reply());
        assert_eq!(action.reply().code(), 4);
        assert_eq!(action.reply().operation(), Some(Operation::CheckCredentials));
        assert_eq!(Action(0x7fff).operation(), None);
    }

    #[test]
    fn empty_stream_is_no_packet() {
        assert!(Packet::read_from(&mut Cursor::new(Vec::<u8>::new())).unwrap().is_none());
        assert!(Packet::read_from(&mut Cursor::new(vec![8u8])).unwrap().is_none());
        assert!(Packet::read_from(&mut Cursor::new(vec![0u8, 0])).unwrap().is_none());
    }

    #[test]
    fn short_body_is_framing_error() {
        let mut bytes = text_packet("hello").encode().unwrap();
        bytes.truncate(bytes.len() - 2);

        let err = Packet::read_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Truncated {
                expected: 14,
                received: 12
            }
        ));
    }

    #[test]
    fn undersized_prefix_is_rejected() {
        let err = Packet::read_from(&mut Cursor::new(vec![4u8, 0, 0, 0])).unwrap_err();
        assert!(matches!(err, CodecError::Undersized { size: 4 }));
    }

    #[test]
    fn unknown_payload_type_is_rejected() {
        let bytes = [8u8, 0, 0, 0, 9, 0, 1, 0];
        match Packet::decode(&bytes) {
            Err(CodecError::UndecodableBody {
                kind,
                action,
                source,
            }) => {
                assert_eq!(kind, PacketKind::BASE);
                assert_eq!(action, Action(1));
                assert!(matches!(*source, CodecError::UnknownPayloadType(9)));
            }
            other => panic!("expected undecodable body, got {other:?}"),
        }
    }

    #[test]
    fn text_without_terminator_keeps_header() {
        let bytes = [10u8, 0, 0, 0, 3, 0, 1, 0, b'h', b'i'];
        let err = Packet::read_from(&mut Cursor::new(bytes.to_vec())).unwrap_err();

        assert!(matches!(
            err,
            CodecError::UndecodableBody { action: Action(1), ref source, .. }
                if matches!(**source, CodecError::MissingTerminator)
        ));
    }

    #[test]
    fn oversized_packet_is_not_truncated() {
        let packet = Packet::new(
            PacketKind::BASE,
            Action::request(Operation::Ping),
            Payload::Binary(vec![0; MAX_PACKET_SIZE]),
        );
        assert!(matches!(
            packet.encode(),
            Err(CodecError::PacketTooLarge { .. })
        ));
    }

    #[test]
    fn embedded_nul_is_rejected() {
        assert!(matches!(
            text_packet("a\0b").encode(),
            Err(CodecError::EmbeddedNul)
        ));
    }

    #[test]
    fn credentials_layout() {
        let credentials = Credentials::new("alice", "secret");
        let bytes = credentials.to_bytes().unwrap();

        assert_eq!(&bytes[..2], &[5u8, 6]);
        assert_eq!(&bytes[2..], b"alicesecret");
        assert_eq!(Credentials::from_bytes(&bytes).unwrap(), credentials);
    }

    #[test]
    fn credentials_lengths_are_validated() {
        assert!(Credentials::from_bytes(&[]).is_err());
        assert!(Credentials::from_bytes(&[3u8, 3, b'a', b'b']).is_err());
        assert!(Credentials::new("x".repeat(256), "").to_bytes().is_err());
    }
}
