//! Message header peeking and synthesized control messages.
//!
//! Payloads use the strict binary message header:
//!
//! ```text
//! [u32 0x8001_0000 | type][i32 name length][name bytes][i32 sequence id]
//! ```
//!
//! Only these three fields are ever read on the hot path, so they are
//! parsed straight from the frame bytes. Everything after the header is
//! carried through untouched.

use crate::{
    byte_order::{read_i32_at, read_network_u32, write_network_i16, write_network_i32, write_network_u32},
    error::ProtocolError,
};

/// Version bits of a strict binary header word.
pub const VERSION_1: u32 = 0x8001_0000;
const VERSION_MASK: u32 = 0xffff_0000;

/// Name carried by heartbeat messages.
pub const PING_NAME: &str = "ping";
/// Name carried by stop-confirm messages.
pub const STOP_CONFIRM_NAME: &str = "stop_confirm";

/// Message type carried in the low byte of the header word.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Request expecting a reply.
    Call,
    /// Successful reply.
    Reply,
    /// Application exception reply.
    Exception,
    /// Request without a reply.
    Oneway,
    /// Heartbeat ping or pong.
    Heartbeat,
    /// Peer asks to stop receiving work.
    Stop,
    /// Acknowledges a stop.
    StopConfirm,
    /// Any other type id.
    Other(u8),
}

impl MessageType {
    /// Wire id of this type.
    #[must_use]
    pub fn id(self) -> u8 {
        match self {
            Self::Call => 1,
            Self::Reply => 2,
            Self::Exception => 3,
            Self::Oneway => 4,
            Self::Heartbeat => 20,
            Self::Stop => 21,
            Self::StopConfirm => 22,
            Self::Other(id) => id,
        }
    }
}

impl From<u8> for MessageType {
    fn from(id: u8) -> Self {
        match id {
            1 => Self::Call,
            2 => Self::Reply,
            3 => Self::Exception,
            4 => Self::Oneway,
            20 => Self::Heartbeat,
            21 => Self::Stop,
            22 => Self::StopConfirm,
            other => Self::Other(other),
        }
    }
}

/// The three header fields the proxy looks at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    /// Message type.
    pub message_type: MessageType,
    /// Method name as written on the wire.
    pub name: String,
    /// Sequence id.
    pub seq_id: i32,
}

impl MessageHeader {
    /// Encoded size of this header.
    #[must_use]
    pub fn encoded_len(&self) -> usize { header_len(&self.name) }
}

/// Encoded size of a header carrying `name`.
#[must_use]
pub fn header_len(name: &str) -> usize { 12 + name.len() }

/// Offset of the sequence id in a header carrying `name`.
#[must_use]
pub fn seq_id_offset(name: &str) -> usize { 8 + name.len() }

fn truncated(need: usize, have: usize) -> ProtocolError { ProtocolError::Truncated { need, have } }

/// Parse the message header at the start of `bytes`.
///
/// # Errors
///
/// Returns a [`ProtocolError`] when the header is truncated, the version
/// word is not strict, the name length is negative or the name is not
/// UTF-8.
///
/// # Examples
///
/// ```
/// use relayframe::message::{MessageType, decode_header, encode_message_begin};
///
/// let mut frame = Vec::new();
/// encode_message_begin(&mut frame, "user:get", MessageType::Call, 7);
/// let header = decode_header(&frame).unwrap();
/// assert_eq!(header.name, "user:get");
/// assert_eq!(header.seq_id, 7);
/// ```
pub fn decode_header(bytes: &[u8]) -> Result<MessageHeader, ProtocolError> {
    let word: [u8; 4] = bytes
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| truncated(4, bytes.len()))?;
    let word = read_network_u32(word);
    if word & VERSION_MASK != VERSION_1 {
        return Err(ProtocolError::BadVersion(word));
    }
    let message_type = MessageType::from(u8::try_from(word & 0xff).unwrap_or_default());

    let name_len = read_i32_at(bytes, 4).ok_or_else(|| truncated(8, bytes.len()))?;
    let name_len =
        usize::try_from(name_len).map_err(|_| ProtocolError::NegativeNameLength(name_len))?;
    let name_end = 8usize.saturating_add(name_len);
    let seq_id = read_i32_at(bytes, name_end)
        .ok_or_else(|| truncated(name_end.saturating_add(4), bytes.len()))?;
    let name = std::str::from_utf8(&bytes[8..name_end])
        .map_err(|_| ProtocolError::InvalidName)?
        .to_owned();

    Ok(MessageHeader {
        message_type,
        name,
        seq_id,
    })
}

fn header_word(message_type: MessageType) -> u32 { VERSION_1 | u32::from(message_type.id()) }

fn name_len_bytes(name: &str) -> [u8; 4] {
    write_network_i32(i32::try_from(name.len()).unwrap_or(i32::MAX))
}

/// Append a message header to `out`.
pub fn encode_message_begin(out: &mut Vec<u8>, name: &str, message_type: MessageType, seq_id: i32) {
    out.reserve(header_len(name));
    out.extend_from_slice(&write_network_u32(header_word(message_type)));
    out.extend_from_slice(&name_len_bytes(name));
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(&write_network_i32(seq_id));
}

/// Overwrite the start of `buf` with a message header.
///
/// Returns `false`, leaving `buf` untouched, when it is shorter than the
/// header.
pub fn write_message_begin(buf: &mut [u8], name: &str, message_type: MessageType, seq_id: i32) -> bool {
    let Some(dst) = buf.get_mut(..header_len(name)) else {
        return false;
    };
    let name_end = 8 + name.len();
    dst[..4].copy_from_slice(&write_network_u32(header_word(message_type)));
    dst[4..8].copy_from_slice(&name_len_bytes(name));
    dst[8..name_end].copy_from_slice(name.as_bytes());
    dst[name_end..].copy_from_slice(&write_network_i32(seq_id));
    true
}

/// Application exception kinds used in synthesized errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionKind {
    /// Unclassified failure.
    Unknown,
    /// The proxy failed to serve the request.
    InternalError,
}

impl ExceptionKind {
    fn id(self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::InternalError => 6,
        }
    }
}

const FIELD_STOP: u8 = 0;
const FIELD_I32: u8 = 8;
const FIELD_STRING: u8 = 11;

/// Encode an exception reply carrying `message`.
#[must_use]
pub fn encode_exception(name: &str, seq_id: i32, kind: ExceptionKind, message: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(header_len(name) + message.len() + 16);
    encode_message_begin(&mut out, name, MessageType::Exception, seq_id);
    out.push(FIELD_STRING);
    out.extend_from_slice(&write_network_i16(1));
    out.extend_from_slice(&name_len_bytes(message));
    out.extend_from_slice(message.as_bytes());
    out.push(FIELD_I32);
    out.extend_from_slice(&write_network_i16(2));
    out.extend_from_slice(&write_network_i32(kind.id()));
    out.push(FIELD_STOP);
    out
}

/// Exception returned when no pool serves `service`.
#[must_use]
pub fn service_not_found(service: &str, method: &str, seq_id: i32) -> Vec<u8> {
    encode_exception(
        method,
        seq_id,
        ExceptionKind::Unknown,
        &format!("Service: {service} Not Found"),
    )
}

/// Exception returned when a pool has no active backend connection.
#[must_use]
pub fn worker_not_found(module: &str, service: &str, method: &str, seq_id: i32) -> Vec<u8> {
    encode_exception(
        method,
        seq_id,
        ExceptionKind::InternalError,
        &format!("Worker FOR {module}#{service}.{method} Not Found"),
    )
}

/// Exception returned when a request failed with `error`.
#[must_use]
pub fn dispatch_error(
    module: &str,
    service: &str,
    method: &str,
    seq_id: i32,
    error: &dyn std::fmt::Display,
) -> Vec<u8> {
    encode_exception(
        method,
        seq_id,
        ExceptionKind::InternalError,
        &format!("Module: {module}, Service: {service}, Method: {method}, Error: {error}"),
    )
}

/// Heartbeat sent to a backend. The sequence id is replaced on send.
#[must_use]
pub fn ping_frame(seq_id: i32) -> Vec<u8> {
    let mut out = Vec::with_capacity(header_len(PING_NAME));
    encode_message_begin(&mut out, PING_NAME, MessageType::Heartbeat, seq_id);
    out
}

/// Final message sent after a backend asked to stop.
#[must_use]
pub fn stop_confirm_frame() -> Vec<u8> {
    let mut out = Vec::with_capacity(header_len(STOP_CONFIRM_NAME));
    encode_message_begin(&mut out, STOP_CONFIRM_NAME, MessageType::StopConfirm, 0);
    out
}

/// Reply to a client heartbeat: an empty `ping` result.
#[must_use]
pub fn ping_reply(seq_id: i32) -> Vec<u8> {
    let mut out = Vec::with_capacity(header_len(PING_NAME) + 1);
    encode_message_begin(&mut out, PING_NAME, MessageType::Reply, seq_id);
    out.push(FIELD_STOP);
    out
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{
        ExceptionKind,
        MessageType,
        decode_header,
        encode_exception,
        encode_message_begin,
        ping_reply,
        service_not_found,
        stop_confirm_frame,
        worker_not_found,
        write_message_begin,
    };
    use crate::error::ProtocolError;

    fn header(name: &str, ty: MessageType, seq: i32) -> Vec<u8> {
        let mut out = Vec::new();
        encode_message_begin(&mut out, name, ty, seq);
        out
    }

    #[rstest]
    #[case::call(MessageType::Call, 1)]
    #[case::reply(MessageType::Reply, 2)]
    #[case::heartbeat(MessageType::Heartbeat, 20)]
    #[case::stop(MessageType::Stop, 21)]
    #[case::stop_confirm(MessageType::StopConfirm, 22)]
    #[case::other(MessageType::Other(9), 9)]
    fn type_ids_match_wire_values(#[case] ty: MessageType, #[case] id: u8) {
        assert_eq!(ty.id(), id);
        assert_eq!(MessageType::from(id), ty);
    }

    #[test]
    fn header_layout_is_strict_binary() {
        let bytes = header("get", MessageType::Call, 0x0102_0304);
        assert_eq!(
            bytes,
            [0x80, 0x01, 0x00, 0x01, 0, 0, 0, 3, b'g', b'e', b't', 1, 2, 3, 4]
        );
    }

    #[test]
    fn decodes_header_ignoring_body() {
        let mut bytes = header("user:get", MessageType::Call, -5);
        bytes.extend_from_slice(&[0xde, 0xad]);
        let decoded = decode_header(&bytes).unwrap();
        assert_eq!(decoded.message_type, MessageType::Call);
        assert_eq!(decoded.name, "user:get");
        assert_eq!(decoded.seq_id, -5);
        assert_eq!(decoded.encoded_len(), 20);
    }

    #[rstest]
    #[case::empty(&[], ProtocolError::Truncated { need: 4, have: 0 })]
    #[case::no_name_len(&[0x80, 1, 0, 1, 0], ProtocolError::Truncated { need: 8, have: 5 })]
    #[case::no_seq(&[0x80, 1, 0, 1, 0, 0, 0, 1, b'a', 0], ProtocolError::Truncated { need: 13, have: 10 })]
    #[case::negative(&[0x80, 1, 0, 1, 0xff, 0xff, 0xff, 0xff], ProtocolError::NegativeNameLength(-1))]
    #[case::non_strict(&[0, 0, 0, 1, 0, 0, 0, 0], ProtocolError::BadVersion(1))]
    #[case::bad_utf8(&[0x80, 1, 0, 1, 0, 0, 0, 1, 0xff, 0, 0, 0, 0], ProtocolError::InvalidName)]
    fn rejects_malformed_headers(#[case] bytes: &[u8], #[case] expected: ProtocolError) {
        assert_eq!(decode_header(bytes).unwrap_err(), expected);
    }

    #[test]
    fn writes_header_in_place() {
        let mut buf = vec![0u8; 20];
        assert!(write_message_begin(&mut buf[4..], "get", MessageType::Reply, 9));
        let decoded = decode_header(&buf[4..]).unwrap();
        assert_eq!(decoded.name, "get");
        assert_eq!(decoded.message_type, MessageType::Reply);
        assert_eq!(decoded.seq_id, 9);
        assert!(!write_message_begin(&mut buf[..4], "get", MessageType::Reply, 9));
    }

    #[test]
    fn exception_encodes_application_exception_struct() {
        let bytes = encode_exception("m", 3, ExceptionKind::InternalError, "boom");
        let decoded = decode_header(&bytes).unwrap();
        assert_eq!(decoded.message_type, MessageType::Exception);
        assert_eq!(decoded.seq_id, 3);
        let body = &bytes[decoded.encoded_len()..];
        assert_eq!(
            body,
            [11, 0, 1, 0, 0, 0, 4, b'b', b'o', b'o', b'm', 8, 0, 2, 0, 0, 0, 6, 0]
        );
    }

    #[test]
    fn not_found_messages_name_service_and_method() {
        let bytes = service_not_found("user", "get", 1);
        assert!(String::from_utf8_lossy(&bytes).contains("Service: user Not Found"));
        let bytes = worker_not_found("BackendPool", "user", "get", 1);
        assert!(String::from_utf8_lossy(&bytes).contains("Worker FOR BackendPool#user.get Not Found"));
        assert_eq!(decode_header(&bytes).unwrap().name, "get");
    }

    #[test]
    fn control_frames_decode() {
        let reply = ping_reply(42);
        let decoded = decode_header(&reply).unwrap();
        assert_eq!((decoded.message_type, decoded.seq_id), (MessageType::Reply, 42));
        assert_eq!(reply.last(), Some(&0));

        let confirm = decode_header(&stop_confirm_frame()).unwrap();
        assert_eq!(confirm.message_type, MessageType::StopConfirm);
        assert_eq!(confirm.name, "stop_confirm");
    }
}
