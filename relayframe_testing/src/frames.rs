//! Builders and readers for message frames used in tests.

use relayframe::message::{self, MessageHeader, MessageType, encode_message_begin};

/// Bytes following the header of every frame built here: an empty struct.
pub const EMPTY_BODY: &[u8] = &[0];

/// A message with `name`, `message_type` and `seq_id` followed by `body`.
#[must_use]
pub fn message(name: &str, message_type: MessageType, seq_id: i32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message::header_len(name) + body.len());
    encode_message_begin(&mut out, name, message_type, seq_id);
    out.extend_from_slice(body);
    out
}

/// A call to `name` with an empty argument struct.
#[must_use]
pub fn call(name: &str, seq_id: i32) -> Vec<u8> { message(name, MessageType::Call, seq_id, EMPTY_BODY) }

/// A reply from `name` carrying `body`.
#[must_use]
pub fn reply(name: &str, seq_id: i32, body: &[u8]) -> Vec<u8> {
    message(name, MessageType::Reply, seq_id, body)
}

/// A heartbeat as clients and workers send it.
#[must_use]
pub fn heartbeat(seq_id: i32) -> Vec<u8> { message::ping_frame(seq_id) }

/// A worker's request to stop receiving work.
#[must_use]
pub fn stop() -> Vec<u8> { message("stop", MessageType::Stop, 0, &[]) }

/// The header of `frame`.
///
/// # Panics
///
/// Panics if `frame` does not start with a valid header.
#[must_use]
pub fn header(frame: &[u8]) -> MessageHeader {
    message::decode_header(frame).expect("frame starts with a message header")
}

/// The bytes of `frame` after its header.
#[must_use]
pub fn body(frame: &[u8]) -> &[u8] { &frame[header(frame).encoded_len()..] }

/// Whether `frame` is an exception whose text contains `needle`.
#[must_use]
pub fn is_exception_containing(frame: &[u8], needle: &str) -> bool {
    header(frame).message_type == MessageType::Exception
        && String::from_utf8_lossy(body(frame)).contains(needle)
}
