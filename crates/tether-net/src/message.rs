//! Binary wire codec for every message kind.
//!
//! Each frame starts with a one-byte message type. Multi-byte integers are
//! little-endian. The layouts are:
//!
//! ```text
//! configuration   type | major | minor | read_timeout_ms u32 | buffer_size u32 | [sub_protocol]
//! heartbeat       type
//! request         type | id[8] | name_len | name | [pad if utf16 and offset odd] | payload
//! reply           type | id[8] | [pad if utf16] | payload
//! signal          type | name_len | name | [pad if utf16 and offset odd] | payload
//! error reply     type | id[8] | code_len (>= 1) | code | message (utf-8)
//! special reply   type | id[8]
//! restore session type | id[8] | session_key (>= 1 byte)
//! close session   type | id[8]
//! session created type | session info
//! session closed  type
//! ```
//!
//! Decoding never reads past the frame. An unknown type byte decodes to
//! `Ok(None)`; a known type with a broken layout is a [`MessageError`].

use std::fmt;
use std::time::Duration;

/// Protocol major version. Peers with a different major version are rejected.
pub const PROTOCOL_MAJOR: u8 = 1;

/// Protocol minor version. Minor mismatches are tolerated.
pub const PROTOCOL_MINOR: u8 = 0;

/// Maximum length of a name or an error code in bytes.
pub const MAX_TOKEN_LEN: usize = 255;

/// One-byte message type discriminants.
pub mod msg_type {
    pub const ERROR_REPLY: u8 = 0;
    pub const REPLY_SHUTDOWN: u8 = 1;
    pub const REPLY_INTERNAL_ERROR: u8 = 2;
    pub const SESSION_NOT_FOUND: u8 = 3;
    pub const MAX_SESSION_CONNECTIONS: u8 = 4;
    pub const SESSIONS_DISABLED: u8 = 5;
    pub const REPLY_PROTOCOL_ERROR: u8 = 6;

    pub const SESSION_CREATED: u8 = 21;
    pub const SESSION_CLOSED: u8 = 22;
    pub const ACCEPT_CONF: u8 = 23;

    pub const CLOSE_SESSION: u8 = 31;
    pub const RESTORE_SESSION: u8 = 32;
    pub const HEARTBEAT: u8 = 33;

    pub const SIGNAL_BINARY: u8 = 63;
    pub const SIGNAL_UTF8: u8 = 64;
    pub const SIGNAL_UTF16: u8 = 65;

    pub const REQUEST_BINARY: u8 = 127;
    pub const REQUEST_UTF8: u8 = 128;
    pub const REQUEST_UTF16: u8 = 129;

    pub const REPLY_BINARY: u8 = 191;
    pub const REPLY_UTF8: u8 = 192;
    pub const REPLY_UTF16: u8 = 193;
}

use msg_type::*;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced while building, encoding or decoding a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    /// The frame contained no bytes at all.
    #[error("empty frame")]
    EmptyFrame,

    /// The frame is shorter than the minimum for its type.
    #[error("{kind} frame too short: {len} bytes, need at least {min}")]
    TooShort {
        /// Message kind being decoded.
        kind: &'static str,
        /// Actual frame length.
        len: usize,
        /// Minimum required length.
        min: usize,
    },

    /// A length prefix points past the end of the frame.
    #[error("declared {field} length {declared} exceeds the {remaining} remaining bytes")]
    LengthOverflow {
        /// Length-prefixed field.
        field: &'static str,
        /// Declared length.
        declared: usize,
        /// Bytes actually left in the frame.
        remaining: usize,
    },

    /// A UTF-16 payload with an odd number of bytes.
    #[error("utf-16 payload has odd length {0}")]
    UnalignedUtf16(usize),

    /// The alignment byte before a UTF-16 payload is not zero.
    #[error("{kind} frame has non-zero utf-16 padding byte 0x{byte:02x}")]
    InvalidPadding {
        /// Message kind being decoded.
        kind: &'static str,
        /// The padding byte found.
        byte: u8,
    },

    /// An empty name where one is mandatory, or an empty error code.
    #[error("{field} is empty")]
    EmptyToken {
        /// Offending field.
        field: &'static str,
    },

    /// A name or error code longer than [`MAX_TOKEN_LEN`].
    #[error("{field} length {len} exceeds {MAX_TOKEN_LEN} bytes")]
    TokenTooLong {
        /// Offending field.
        field: &'static str,
        /// Actual length.
        len: usize,
    },

    /// A name or error code byte outside printable ASCII (32..=126).
    #[error("{field} contains invalid byte 0x{byte:02x} at position {position}")]
    InvalidCharacter {
        /// Offending field.
        field: &'static str,
        /// The rejected byte.
        byte: u8,
        /// Byte offset inside the field.
        position: usize,
    },

    /// A request with neither a name nor a payload.
    #[error("request carries neither a name nor a payload")]
    EmptyRequest,

    /// A text field that is not valid UTF-8.
    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 {
        /// Offending field.
        field: &'static str,
    },

    /// A restore-session request without a key.
    #[error("session key is empty")]
    EmptySessionKey,
}

// ---------------------------------------------------------------------------
// Field types
// ---------------------------------------------------------------------------

fn validate_token(bytes: &[u8], field: &'static str) -> Result<(), MessageError> {
    if bytes.is_empty() {
        return Err(MessageError::EmptyToken { field });
    }
    if bytes.len() > MAX_TOKEN_LEN {
        return Err(MessageError::TokenTooLong {
            field,
            len: bytes.len(),
        });
    }
    if let Some(position) = bytes.iter().position(|b| !(32..=126).contains(b)) {
        return Err(MessageError::InvalidCharacter {
            field,
            byte: bytes[position],
            position,
        });
    }
    Ok(())
}

// Only called on bytes that passed `validate_token`, which are all ASCII.
fn ascii_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Request or signal name: 1 to 255 printable ASCII bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Name(String);

impl Name {
    /// Validate and wrap a name.
    pub fn new(name: impl Into<String>) -> Result<Self, MessageError> {
        let name = name.into();
        validate_token(name.as_bytes(), "name")?;
        Ok(Self(name))
    }

    /// Map an optional, possibly empty name to `Option<Name>`.
    pub fn optional(name: Option<&str>) -> Result<Option<Self>, MessageError> {
        match name {
            None | Some("") => Ok(None),
            Some(name) => Self::new(name).map(Some),
        }
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Application error code carried by an error reply. Same rules as [`Name`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ErrorCode(String);

impl ErrorCode {
    /// Validate and wrap an error code.
    pub fn new(code: impl Into<String>) -> Result<Self, MessageError> {
        let code = code.into();
        validate_token(code.as_bytes(), "error code")?;
        Ok(Self(code))
    }

    /// The code as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload encoding tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Encoding {
    /// Opaque bytes.
    #[default]
    Binary,
    /// UTF-8 text.
    Utf8,
    /// UTF-16 text (little-endian code units).
    Utf16,
}

/// Opaque payload bytes tagged with an [`Encoding`].
///
/// A UTF-16 payload always has an even byte length.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload {
    encoding: Encoding,
    data: Vec<u8>,
}

impl Payload {
    /// Build a payload, rejecting odd-length UTF-16 data.
    pub fn new(encoding: Encoding, data: impl Into<Vec<u8>>) -> Result<Self, MessageError> {
        let data = data.into();
        if encoding == Encoding::Utf16 && data.len() % 2 != 0 {
            return Err(MessageError::UnalignedUtf16(data.len()));
        }
        Ok(Self { encoding, data })
    }

    /// Binary payload.
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self {
            encoding: Encoding::Binary,
            data: data.into(),
        }
    }

    /// UTF-8 text payload.
    pub fn utf8(text: impl Into<String>) -> Self {
        Self {
            encoding: Encoding::Utf8,
            data: text.into().into_bytes(),
        }
    }

    /// UTF-16 text payload, encoded as little-endian code units.
    pub fn utf16(text: &str) -> Self {
        Self {
            encoding: Encoding::Utf16,
            data: text.encode_utf16().flat_map(u16::to_le_bytes).collect(),
        }
    }

    /// Payload encoding.
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Raw payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consume the payload, returning its bytes.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Whether the payload carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Decode a text payload. Returns `None` for binary payloads and invalid text.
    pub fn to_text(&self) -> Option<String> {
        match self.encoding {
            Encoding::Binary => None,
            Encoding::Utf8 => String::from_utf8(self.data.clone()).ok(),
            Encoding::Utf16 => {
                let units: Vec<u16> = self
                    .data
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                String::from_utf16(&units).ok()
            }
        }
    }
}

/// 8-byte request identifier. All-zero means "no identifier".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RequestId(pub [u8; 8]);

impl RequestId {
    /// The reserved all-zero identifier.
    pub const ZERO: RequestId = RequestId([0; 8]);

    /// Build an identifier from its little-endian `u64` value.
    pub fn from_u64(value: u64) -> Self {
        Self(value.to_le_bytes())
    }

    /// Little-endian `u64` view of the identifier.
    pub fn as_u64(&self) -> u64 {
        u64::from_le_bytes(self.0)
    }

    /// Whether this is the reserved zero identifier.
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 8]
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.as_u64())
    }
}

/// Handshake parameters pushed by the accepting side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfiguration {
    /// Protocol major version.
    pub major_version: u8,
    /// Protocol minor version.
    pub minor_version: u8,
    /// Server-side read timeout. Travels as whole milliseconds.
    pub read_timeout: Duration,
    /// Largest frame the server accepts, in bytes.
    pub buffer_size: u32,
    /// Optional sub-protocol name.
    pub sub_protocol: Option<String>,
}

impl ServerConfiguration {
    /// Configuration advertising this crate's protocol version.
    pub fn new(read_timeout: Duration, buffer_size: u32) -> Self {
        Self {
            major_version: PROTOCOL_MAJOR,
            minor_version: PROTOCOL_MINOR,
            read_timeout,
            buffer_size,
            sub_protocol: None,
        }
    }

    /// Set the advertised sub-protocol. An empty name advertises none.
    pub fn with_sub_protocol(mut self, sub_protocol: Option<String>) -> Self {
        self.sub_protocol = sub_protocol.filter(|name| !name.is_empty());
        self
    }
}

/// Replies that carry nothing but an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialReply {
    /// The server is shutting down and refuses new requests.
    Shutdown,
    /// The handler failed; no details are exposed.
    InternalError,
    /// The session to restore does not exist.
    SessionNotFound,
    /// The session reached its connection limit.
    MaxSessionConnections,
    /// The server has sessions disabled.
    SessionsDisabled,
    /// The server rejected the request as malformed.
    ProtocolError,
}

impl SpecialReply {
    /// Wire type byte.
    pub fn type_byte(self) -> u8 {
        match self {
            SpecialReply::Shutdown => REPLY_SHUTDOWN,
            SpecialReply::InternalError => REPLY_INTERNAL_ERROR,
            SpecialReply::SessionNotFound => SESSION_NOT_FOUND,
            SpecialReply::MaxSessionConnections => MAX_SESSION_CONNECTIONS,
            SpecialReply::SessionsDisabled => SESSIONS_DISABLED,
            SpecialReply::ProtocolError => REPLY_PROTOCOL_ERROR,
        }
    }

    /// Map a type byte back to a special reply kind.
    pub fn from_type_byte(ty: u8) -> Option<Self> {
        match ty {
            REPLY_SHUTDOWN => Some(SpecialReply::Shutdown),
            REPLY_INTERNAL_ERROR => Some(SpecialReply::InternalError),
            SESSION_NOT_FOUND => Some(SpecialReply::SessionNotFound),
            MAX_SESSION_CONNECTIONS => Some(SpecialReply::MaxSessionConnections),
            SESSIONS_DISABLED => Some(SpecialReply::SessionsDisabled),
            REPLY_PROTOCOL_ERROR => Some(SpecialReply::ProtocolError),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake configuration, sent once by the server.
    Configuration(ServerConfiguration),
    /// Keep-alive frame.
    Heartbeat,
    /// Correlated request expecting exactly one reply.
    Request {
        /// Correlation identifier.
        id: RequestId,
        /// Optional request name.
        name: Option<Name>,
        /// Request payload.
        payload: Payload,
    },
    /// Successful reply.
    Reply {
        /// Identifier of the request being answered.
        id: RequestId,
        /// Reply payload.
        payload: Payload,
    },
    /// Fire-and-forget message.
    Signal {
        /// Optional signal name.
        name: Option<Name>,
        /// Signal payload.
        payload: Payload,
    },
    /// Application-level failure reported by a request handler.
    ErrorReply {
        /// Identifier of the failed request.
        id: RequestId,
        /// Application error code.
        code: ErrorCode,
        /// Human-readable message.
        message: String,
    },
    /// Identifier-only failure reply.
    SpecialReply {
        /// Identifier of the failed request.
        id: RequestId,
        /// Failure kind.
        kind: SpecialReply,
    },
    /// Ask the server to attach an existing session.
    RestoreSession {
        /// Correlation identifier.
        id: RequestId,
        /// Key of the session to restore.
        key: String,
    },
    /// Ask the server to close the attached session.
    CloseSession {
        /// Correlation identifier.
        id: RequestId,
    },
    /// The server created a session for this connection.
    SessionCreated {
        /// Serialized session information.
        info: Vec<u8>,
    },
    /// The server closed the session of this connection.
    SessionClosed,
}

impl Message {
    /// Build a validated request.
    pub fn request(
        id: RequestId,
        name: Option<&str>,
        payload: Payload,
    ) -> Result<Self, MessageError> {
        let name = Name::optional(name)?;
        if name.is_none() && payload.is_empty() {
            return Err(MessageError::EmptyRequest);
        }
        Ok(Message::Request { id, name, payload })
    }

    /// Build a validated signal.
    pub fn signal(name: Option<&str>, payload: Payload) -> Result<Self, MessageError> {
        Ok(Message::Signal {
            name: Name::optional(name)?,
            payload,
        })
    }

    /// Build a validated error reply.
    pub fn error_reply(
        id: RequestId,
        code: &str,
        message: impl Into<String>,
    ) -> Result<Self, MessageError> {
        Ok(Message::ErrorReply {
            id,
            code: ErrorCode::new(code)?,
            message: message.into(),
        })
    }

    /// Build a validated restore-session request.
    pub fn restore_session(id: RequestId, key: impl Into<String>) -> Result<Self, MessageError> {
        let key = key.into();
        if key.is_empty() {
            return Err(MessageError::EmptySessionKey);
        }
        Ok(Message::RestoreSession { id, key })
    }

    /// Wire type byte of this message.
    pub fn message_type(&self) -> u8 {
        match self {
            Message::Configuration(_) => ACCEPT_CONF,
            Message::Heartbeat => HEARTBEAT,
            Message::Request { payload, .. } => match payload.encoding() {
                Encoding::Binary => REQUEST_BINARY,
                Encoding::Utf8 => REQUEST_UTF8,
                Encoding::Utf16 => REQUEST_UTF16,
            },
            Message::Reply { payload, .. } => match payload.encoding() {
                Encoding::Binary => REPLY_BINARY,
                Encoding::Utf8 => REPLY_UTF8,
                Encoding::Utf16 => REPLY_UTF16,
            },
            Message::Signal { payload, .. } => match payload.encoding() {
                Encoding::Binary => SIGNAL_BINARY,
                Encoding::Utf8 => SIGNAL_UTF8,
                Encoding::Utf16 => SIGNAL_UTF16,
            },
            Message::ErrorReply { .. } => ERROR_REPLY,
            Message::SpecialReply { kind, .. } => kind.type_byte(),
            Message::RestoreSession { .. } => RESTORE_SESSION,
            Message::CloseSession { .. } => CLOSE_SESSION,
            Message::SessionCreated { .. } => SESSION_CREATED,
            Message::SessionClosed => SESSION_CLOSED,
        }
    }

    /// Correlation identifier, for the variants that carry one.
    pub fn id(&self) -> Option<RequestId> {
        match self {
            Message::Request { id, .. }
            | Message::Reply { id, .. }
            | Message::ErrorReply { id, .. }
            | Message::SpecialReply { id, .. }
            | Message::RestoreSession { id, .. }
            | Message::CloseSession { id } => Some(*id),
            _ => None,
        }
    }

    /// Replace the identifier of a message that carries one.
    pub fn set_id(&mut self, new_id: RequestId) {
        match self {
            Message::Request { id, .. }
            | Message::Reply { id, .. }
            | Message::ErrorReply { id, .. }
            | Message::SpecialReply { id, .. }
            | Message::RestoreSession { id, .. }
            | Message::CloseSession { id } => *id = new_id,
            _ => {}
        }
    }

    /// Encode into a fresh frame.
    ///
    /// Re-checks the invariants that the enum itself cannot enforce, so a
    /// hand-built value never yields an invalid frame.
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let mut buf = Vec::with_capacity(self.encoded_len_hint());
        buf.push(self.message_type());

        match self {
            Message::Configuration(conf) => {
                let read_timeout_ms =
                    u32::try_from(conf.read_timeout.as_millis()).unwrap_or(u32::MAX);
                buf.push(conf.major_version);
                buf.push(conf.minor_version);
                buf.extend_from_slice(&read_timeout_ms.to_le_bytes());
                buf.extend_from_slice(&conf.buffer_size.to_le_bytes());
                if let Some(sub_protocol) = &conf.sub_protocol {
                    if sub_protocol.is_empty() {
                        return Err(MessageError::EmptyToken {
                            field: "sub-protocol name",
                        });
                    }
                    buf.extend_from_slice(sub_protocol.as_bytes());
                }
            }
            Message::Heartbeat | Message::SessionClosed => {}
            Message::Request { id, name, payload } => {
                if name.is_none() && payload.is_empty() {
                    return Err(MessageError::EmptyRequest);
                }
                buf.extend_from_slice(&id.0);
                push_token(&mut buf, name.as_ref().map(Name::as_str), "name")?;
                push_payload(&mut buf, payload);
            }
            Message::Reply { id, payload } => {
                buf.extend_from_slice(&id.0);
                push_payload(&mut buf, payload);
            }
            Message::Signal { name, payload } => {
                push_token(&mut buf, name.as_ref().map(Name::as_str), "name")?;
                push_payload(&mut buf, payload);
            }
            Message::ErrorReply { id, code, message } => {
                buf.extend_from_slice(&id.0);
                push_token(&mut buf, Some(code.as_str()), "error code")?;
                buf.extend_from_slice(message.as_bytes());
            }
            Message::SpecialReply { id, .. } | Message::CloseSession { id } => {
                buf.extend_from_slice(&id.0);
            }
            Message::RestoreSession { id, key } => {
                if key.is_empty() {
                    return Err(MessageError::EmptySessionKey);
                }
                buf.extend_from_slice(&id.0);
                buf.extend_from_slice(key.as_bytes());
            }
            Message::SessionCreated { info } => buf.extend_from_slice(info),
        }

        Ok(buf)
    }

    /// Decode a frame.
    ///
    /// Returns `Ok(None)` for an unknown type byte, so the caller can decide
    /// whether to ignore it. Any error means the frame was structurally
    /// invalid and the stream should no longer be trusted.
    pub fn decode(frame: &[u8]) -> Result<Option<Message>, MessageError> {
        let Some(&ty) = frame.first() else {
            return Err(MessageError::EmptyFrame);
        };

        let msg = match ty {
            ACCEPT_CONF => Message::Configuration(decode_configuration(frame)?),
            HEARTBEAT => Message::Heartbeat,
            SESSION_CLOSED => Message::SessionClosed,
            SESSION_CREATED => Message::SessionCreated {
                info: frame[1..].to_vec(),
            },
            CLOSE_SESSION => Message::CloseSession {
                id: read_id(frame, "close-session")?,
            },
            RESTORE_SESSION => decode_restore_session(frame)?,
            ERROR_REPLY => decode_error_reply(frame)?,
            SIGNAL_BINARY => decode_signal(frame, Encoding::Binary)?,
            SIGNAL_UTF8 => decode_signal(frame, Encoding::Utf8)?,
            SIGNAL_UTF16 => decode_signal(frame, Encoding::Utf16)?,
            REQUEST_BINARY => decode_request(frame, Encoding::Binary)?,
            REQUEST_UTF8 => decode_request(frame, Encoding::Utf8)?,
            REQUEST_UTF16 => decode_request(frame, Encoding::Utf16)?,
            REPLY_BINARY => decode_reply(frame, Encoding::Binary)?,
            REPLY_UTF8 => decode_reply(frame, Encoding::Utf8)?,
            REPLY_UTF16 => decode_reply(frame, Encoding::Utf16)?,
            other => match SpecialReply::from_type_byte(other) {
                Some(kind) => Message::SpecialReply {
                    id: read_id(frame, "special reply")?,
                    kind,
                },
                None => return Ok(None),
            },
        };

        Ok(Some(msg))
    }

    fn encoded_len_hint(&self) -> usize {
        match self {
            Message::Request { name, payload, .. } => {
                11 + name.as_ref().map_or(0, |n| n.as_str().len()) + payload.len()
            }
            Message::Reply { payload, .. } => 10 + payload.len(),
            Message::Signal { name, payload } => {
                3 + name.as_ref().map_or(0, |n| n.as_str().len()) + payload.len()
            }
            Message::ErrorReply { code, message, .. } => 10 + code.as_str().len() + message.len(),
            Message::SessionCreated { info } => 1 + info.len(),
            _ => 16,
        }
    }
}

/// Whether a message of type `ty` expects a correlated reply.
pub fn requires_reply(ty: u8) -> bool {
    matches!(
        ty,
        CLOSE_SESSION | RESTORE_SESSION | REQUEST_BINARY | REQUEST_UTF8 | REQUEST_UTF16
    )
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

fn push_token(
    buf: &mut Vec<u8>,
    token: Option<&str>,
    field: &'static str,
) -> Result<(), MessageError> {
    let bytes = token.map_or(&[][..], str::as_bytes);
    let len = u8::try_from(bytes.len()).map_err(|_| MessageError::TokenTooLong {
        field,
        len: bytes.len(),
    })?;
    buf.push(len);
    buf.extend_from_slice(bytes);
    Ok(())
}

// UTF-16 payloads start on an even offset.
fn push_payload(buf: &mut Vec<u8>, payload: &Payload) {
    if payload.encoding() == Encoding::Utf16 && buf.len() % 2 != 0 {
        buf.push(0);
    }
    buf.extend_from_slice(payload.data());
}

// ---------------------------------------------------------------------------
// Decoding helpers
// ---------------------------------------------------------------------------

fn require_len(frame: &[u8], min: usize, kind: &'static str) -> Result<(), MessageError> {
    if frame.len() < min {
        return Err(MessageError::TooShort {
            kind,
            len: frame.len(),
            min,
        });
    }
    Ok(())
}

fn read_id(frame: &[u8], kind: &'static str) -> Result<RequestId, MessageError> {
    let bytes = frame
        .get(1..9)
        .and_then(|slice| <[u8; 8]>::try_from(slice).ok())
        .ok_or(MessageError::TooShort {
            kind,
            len: frame.len(),
            min: 9,
        })?;
    Ok(RequestId(bytes))
}

/// Read a length-prefixed token whose length byte sits at `len_at`.
/// Returns the token bytes and the offset just past them.
fn read_token<'a>(
    frame: &'a [u8],
    len_at: usize,
    field: &'static str,
) -> Result<(&'a [u8], usize), MessageError> {
    let declared = usize::from(frame[len_at]);
    let start = len_at + 1;
    let remaining = frame.len() - start;
    if declared > remaining {
        return Err(MessageError::LengthOverflow {
            field,
            declared,
            remaining,
        });
    }
    Ok((&frame[start..start + declared], start + declared))
}

fn decode_name(bytes: &[u8]) -> Result<Option<Name>, MessageError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    validate_token(bytes, "name")?;
    Ok(Some(Name(ascii_to_string(bytes))))
}

fn decode_payload(
    frame: &[u8],
    offset: usize,
    encoding: Encoding,
    kind: &'static str,
) -> Result<Payload, MessageError> {
    let mut start = offset;
    if encoding == Encoding::Utf16 && start % 2 != 0 {
        require_len(frame, start + 1, kind)?;
        if frame[start] != 0 {
            return Err(MessageError::InvalidPadding {
                kind,
                byte: frame[start],
            });
        }
        start += 1;
    }
    let data = &frame[start..];
    if encoding == Encoding::Utf16 && data.len() % 2 != 0 {
        return Err(MessageError::UnalignedUtf16(data.len()));
    }
    Ok(Payload {
        encoding,
        data: data.to_vec(),
    })
}

fn decode_configuration(frame: &[u8]) -> Result<ServerConfiguration, MessageError> {
    require_len(frame, 11, "configuration")?;
    let read_timeout_ms = u32::from_le_bytes([frame[3], frame[4], frame[5], frame[6]]);
    let buffer_size = u32::from_le_bytes([frame[7], frame[8], frame[9], frame[10]]);
    let sub_protocol = match &frame[11..] {
        [] => None,
        bytes => Some(String::from_utf8(bytes.to_vec()).map_err(|_| {
            MessageError::InvalidUtf8 {
                field: "sub-protocol name",
            }
        })?),
    };
    Ok(ServerConfiguration {
        major_version: frame[1],
        minor_version: frame[2],
        read_timeout: Duration::from_millis(u64::from(read_timeout_ms)),
        buffer_size,
        sub_protocol,
    })
}

fn decode_request(frame: &[u8], encoding: Encoding) -> Result<Message, MessageError> {
    require_len(frame, 10, "request")?;
    let id = read_id(frame, "request")?;
    let (name_bytes, payload_at) = read_token(frame, 9, "name")?;
    let name = decode_name(name_bytes)?;
    let payload = decode_payload(frame, payload_at, encoding, "request")?;
    if name.is_none() && payload.is_empty() {
        return Err(MessageError::EmptyRequest);
    }
    Ok(Message::Request { id, name, payload })
}

fn decode_reply(frame: &[u8], encoding: Encoding) -> Result<Message, MessageError> {
    require_len(frame, 9, "reply")?;
    let id = read_id(frame, "reply")?;
    let payload = decode_payload(frame, 9, encoding, "reply")?;
    Ok(Message::Reply { id, payload })
}

fn decode_signal(frame: &[u8], encoding: Encoding) -> Result<Message, MessageError> {
    require_len(frame, 2, "signal")?;
    let (name_bytes, payload_at) = read_token(frame, 1, "name")?;
    let name = decode_name(name_bytes)?;
    let payload = decode_payload(frame, payload_at, encoding, "signal")?;
    Ok(Message::Signal { name, payload })
}

fn decode_error_reply(frame: &[u8]) -> Result<Message, MessageError> {
    require_len(frame, 11, "error reply")?;
    let id = read_id(frame, "error reply")?;
    let (code_bytes, message_at) = read_token(frame, 9, "error code")?;
    validate_token(code_bytes, "error code")?;
    let message = String::from_utf8(frame[message_at..].to_vec()).map_err(|_| {
        MessageError::InvalidUtf8 {
            field: "error message",
        }
    })?;
    Ok(Message::ErrorReply {
        id,
        code: ErrorCode(ascii_to_string(code_bytes)),
        message,
    })
}

fn decode_restore_session(frame: &[u8]) -> Result<Message, MessageError> {
    require_len(frame, 10, "restore-session")?;
    let id = read_id(frame, "restore-session")?;
    let key = String::from_utf8(frame[9..].to_vec()).map_err(|_| MessageError::InvalidUtf8 {
        field: "session key",
    })?;
    Ok(Message::RestoreSession { id, key })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> RequestId {
        RequestId::from_u64(n)
    }

    fn roundtrip(msg: &Message) -> Message {
        let bytes = msg.encode().unwrap();
        Message::decode(&bytes).unwrap().expect("known type")
    }

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::Configuration(ServerConfiguration {
                major_version: 1,
                minor_version: 4,
                read_timeout: Duration::from_millis(2500),
                buffer_size: 65_536,
                sub_protocol: Some("chat.v2".to_string()),
            }),
            Message::Heartbeat,
            Message::request(id(7), Some("echo"), Payload::utf8("hi")).unwrap(),
            Message::request(id(8), None, Payload::binary(vec![1, 2, 3])).unwrap(),
            Message::request(id(9), Some("odd"), Payload::utf16("ünïcode")).unwrap(),
            Message::request(id(10), Some("even"), Payload::empty_utf16()).unwrap(),
            Message::Reply {
                id: id(11),
                payload: Payload::utf16("reply"),
            },
            Message::Reply {
                id: id(12),
                payload: Payload::binary(Vec::new()),
            },
            Message::signal(Some("tick"), Payload::utf8("1")).unwrap(),
            Message::signal(Some("ab"), Payload::utf16("x")).unwrap(),
            Message::error_reply(id(13), "NOT_FOUND", "no such thing").unwrap(),
            Message::SpecialReply {
                id: id(14),
                kind: SpecialReply::SessionsDisabled,
            },
            Message::restore_session(id(15), "session-key").unwrap(),
            Message::CloseSession { id: id(16) },
            Message::SessionCreated {
                info: br#"{"key":"k"}"#.to_vec(),
            },
            Message::SessionClosed,
        ]
    }

    impl Payload {
        fn empty_utf16() -> Self {
            Payload::new(Encoding::Utf16, Vec::new()).unwrap()
        }
    }

    #[test]
    fn test_every_variant_roundtrips() {
        for msg in sample_messages() {
            assert_eq!(roundtrip(&msg), msg);
        }
    }

    #[test]
    fn test_request_layout_is_bit_exact() {
        let msg = Message::request(id(1), Some("echo"), Payload::utf8("hi")).unwrap();
        let bytes = msg.encode().unwrap();
        let mut expected = vec![REQUEST_UTF8, 1, 0, 0, 0, 0, 0, 0, 0, 4];
        expected.extend_from_slice(b"echo");
        expected.extend_from_slice(b"hi");
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_configuration_layout_is_little_endian() {
        let msg = Message::Configuration(ServerConfiguration::new(
            Duration::from_millis(0x0102_0304),
            0x0A0B_0C0D,
        ));
        let bytes = msg.encode().unwrap();
        assert_eq!(
            bytes,
            vec![
                ACCEPT_CONF,
                PROTOCOL_MAJOR,
                PROTOCOL_MINOR,
                0x04,
                0x03,
                0x02,
                0x01,
                0x0D,
                0x0C,
                0x0B,
                0x0A
            ]
        );
    }

    #[test]
    fn test_utf16_payload_offset_always_even() {
        for name_len in 0..8usize {
            let name = "n".repeat(name_len);
            let name = (name_len > 0).then_some(name.as_str());
            let payload = Payload::utf16("ab");

            let request = Message::request(id(3), name, payload.clone()).unwrap();
            let bytes = request.encode().unwrap();
            assert_eq!((bytes.len() - payload.len()) % 2, 0, "request name_len={name_len}");

            let signal = Message::signal(name, payload.clone()).unwrap();
            let bytes = signal.encode().unwrap();
            assert_eq!((bytes.len() - payload.len()) % 2, 0, "signal name_len={name_len}");
        }

        let reply = Message::Reply {
            id: id(1),
            payload: Payload::utf16("ab"),
        };
        let bytes = reply.encode().unwrap();
        assert_eq!(bytes.len(), 10 + 4);
        assert_eq!(bytes[9], 0, "reply always pads before a utf-16 payload");
    }

    #[test]
    fn test_padding_only_when_offset_is_odd() {
        // 10 + 2 = 12: even header, no pad byte.
        let even = Message::request(id(1), Some("ab"), Payload::utf16("x")).unwrap();
        assert_eq!(even.encode().unwrap().len(), 12 + 2);
        // 10 + 3 = 13: odd header, one pad byte.
        let odd = Message::request(id(1), Some("abc"), Payload::utf16("x")).unwrap();
        assert_eq!(odd.encode().unwrap().len(), 13 + 1 + 2);
    }

    #[test]
    fn test_truncated_frames_never_panic() {
        for msg in sample_messages() {
            let bytes = msg.encode().unwrap();
            for cut in 0..bytes.len() {
                let _ = Message::decode(&bytes[..cut]);
            }
        }
    }

    #[test]
    fn test_truncation_inside_header_is_an_error() {
        let bytes = Message::request(id(5), Some("echo"), Payload::utf8("hi"))
            .unwrap()
            .encode()
            .unwrap();
        // Every cut before the end of the name is malformed.
        for cut in 1..14 {
            assert!(Message::decode(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn test_inflated_name_length_rejected() {
        let mut bytes = Message::signal(Some("tick"), Payload::utf8("x"))
            .unwrap()
            .encode()
            .unwrap();
        bytes[1] = 200;
        assert_eq!(
            Message::decode(&bytes),
            Err(MessageError::LengthOverflow {
                field: "name",
                declared: 200,
                remaining: 5,
            })
        );
    }

    #[test]
    fn test_inflated_error_code_length_rejected() {
        let mut bytes = Message::error_reply(id(1), "E", "msg")
            .unwrap()
            .encode()
            .unwrap();
        bytes[9] = 255;
        assert!(matches!(
            Message::decode(&bytes),
            Err(MessageError::LengthOverflow {
                field: "error code",
                ..
            })
        ));
    }

    #[test]
    fn test_unaligned_utf16_rejected() {
        let mut frame = vec![REPLY_UTF16];
        frame.extend_from_slice(&id(1).0);
        frame.push(0);
        frame.extend_from_slice(&[0x61, 0x00, 0x62]);
        assert_eq!(
            Message::decode(&frame),
            Err(MessageError::UnalignedUtf16(3))
        );
    }

    #[test]
    fn test_set_id_only_touches_correlated_messages() {
        let mut close = Message::CloseSession { id: RequestId::ZERO };
        close.set_id(id(7));
        assert_eq!(close.id(), Some(id(7)));
        assert!(requires_reply(close.message_type()));

        let mut signal = Message::signal(Some("tick"), Payload::utf8("1")).unwrap();
        signal.set_id(id(7));
        assert_eq!(signal.id(), None);
        assert!(!requires_reply(signal.message_type()));
    }

    #[test]
    fn test_non_zero_utf16_padding_rejected() {
        let mut frame = vec![REPLY_UTF16];
        frame.extend_from_slice(&id(1).0);
        frame.extend_from_slice(&[0xFF, 0x61, 0x00]);
        assert_eq!(
            Message::decode(&frame),
            Err(MessageError::InvalidPadding {
                kind: "reply",
                byte: 0xFF
            })
        );
    }

    #[test]
    fn test_empty_sub_protocol_is_not_advertised() {
        let config = ServerConfiguration::new(Duration::from_secs(1), 1024)
            .with_sub_protocol(Some(String::new()));
        assert_eq!(config.sub_protocol, None);

        let mut raw = ServerConfiguration::new(Duration::from_secs(1), 1024);
        raw.sub_protocol = Some(String::new());
        assert_eq!(
            Message::Configuration(raw).encode(),
            Err(MessageError::EmptyToken {
                field: "sub-protocol name"
            })
        );
    }

    #[test]
    fn test_missing_utf16_padding_rejected() {
        let mut frame = vec![REPLY_UTF16];
        frame.extend_from_slice(&id(1).0);
        assert!(matches!(
            Message::decode(&frame),
            Err(MessageError::TooShort { .. })
        ));
    }

    #[test]
    fn test_unknown_type_is_not_parsed() {
        assert_eq!(Message::decode(&[250, 1, 2, 3]), Ok(None));
        assert_eq!(Message::decode(&[7]), Ok(None));
    }

    #[test]
    fn test_empty_frame_rejected() {
        assert_eq!(Message::decode(&[]), Err(MessageError::EmptyFrame));
    }

    #[test]
    fn test_empty_request_rejected() {
        assert_eq!(
            Message::request(id(1), None, Payload::default()),
            Err(MessageError::EmptyRequest)
        );
        assert_eq!(
            Message::request(id(1), Some(""), Payload::utf8("")),
            Err(MessageError::EmptyRequest)
        );

        let mut frame = vec![REQUEST_BINARY];
        frame.extend_from_slice(&id(1).0);
        frame.push(0);
        assert_eq!(Message::decode(&frame), Err(MessageError::EmptyRequest));
    }

    #[test]
    fn test_hand_built_empty_request_fails_to_encode() {
        let msg = Message::Request {
            id: id(1),
            name: None,
            payload: Payload::default(),
        };
        assert_eq!(msg.encode(), Err(MessageError::EmptyRequest));
    }

    #[test]
    fn test_name_validation() {
        assert!(Name::new("a".repeat(255)).is_ok());
        assert_eq!(
            Name::new("a".repeat(256)),
            Err(MessageError::TokenTooLong {
                field: "name",
                len: 256
            })
        );
        assert_eq!(
            Name::new("tab\there"),
            Err(MessageError::InvalidCharacter {
                field: "name",
                byte: b'\t',
                position: 3
            })
        );
        assert!(Name::new("é").is_err());
        assert!(Name::new(" ~").is_ok());
    }

    #[test]
    fn test_invalid_name_bytes_rejected_on_decode() {
        let frame = [SIGNAL_BINARY, 2, b'o', 0x7F, 9];
        assert!(matches!(
            Message::decode(&frame),
            Err(MessageError::InvalidCharacter { byte: 0x7F, .. })
        ));
    }

    #[test]
    fn test_error_reply_requires_code() {
        assert_eq!(
            Message::error_reply(id(1), "", "boom"),
            Err(MessageError::EmptyToken {
                field: "error code"
            })
        );

        let mut frame = vec![ERROR_REPLY];
        frame.extend_from_slice(&id(1).0);
        frame.extend_from_slice(&[0, b'x']);
        assert_eq!(
            Message::decode(&frame),
            Err(MessageError::EmptyToken {
                field: "error code"
            })
        );
    }

    #[test]
    fn test_odd_utf16_payload_rejected_at_construction() {
        assert_eq!(
            Payload::new(Encoding::Utf16, vec![1, 2, 3]),
            Err(MessageError::UnalignedUtf16(3))
        );
    }

    #[test]
    fn test_restore_session_requires_key() {
        assert_eq!(
            Message::restore_session(id(1), ""),
            Err(MessageError::EmptySessionKey)
        );
        let mut frame = vec![RESTORE_SESSION];
        frame.extend_from_slice(&id(1).0);
        assert!(matches!(
            Message::decode(&frame),
            Err(MessageError::TooShort { min: 10, .. })
        ));
    }

    #[test]
    fn test_special_replies_roundtrip() {
        let kinds = [
            SpecialReply::Shutdown,
            SpecialReply::InternalError,
            SpecialReply::SessionNotFound,
            SpecialReply::MaxSessionConnections,
            SpecialReply::SessionsDisabled,
            SpecialReply::ProtocolError,
        ];
        for kind in kinds {
            let msg = Message::SpecialReply { id: id(99), kind };
            assert_eq!(msg.encode().unwrap().len(), 9);
            assert_eq!(roundtrip(&msg), msg);
        }
    }

    #[test]
    fn test_requires_reply() {
        for ty in [
            CLOSE_SESSION,
            RESTORE_SESSION,
            REQUEST_BINARY,
            REQUEST_UTF8,
            REQUEST_UTF16,
        ] {
            assert!(requires_reply(ty));
        }
        for ty in [HEARTBEAT, SIGNAL_UTF8, REPLY_BINARY, ERROR_REPLY, ACCEPT_CONF] {
            assert!(!requires_reply(ty));
        }
    }

    #[test]
    fn test_payload_text_decoding() {
        assert_eq!(Payload::utf8("hi").to_text().as_deref(), Some("hi"));
        assert_eq!(Payload::utf16("héllo").to_text().as_deref(), Some("héllo"));
        assert_eq!(Payload::binary(b"hi".to_vec()).to_text(), None);
    }

    #[test]
    fn test_request_id_zero_is_reserved() {
        assert!(RequestId::ZERO.is_zero());
        assert!(!RequestId::from_u64(1).is_zero());
        assert_eq!(RequestId::from_u64(0xABCD).as_u64(), 0xABCD);
        assert_eq!(RequestId::from_u64(255).to_string(), "00000000000000ff");
    }
}
