//! Request envelope carried from a session to a backend and back.
//!
//! A [`Request`] owns the frame it was decoded from and, once answered, the
//! response frame. Its sequence id is rewritten on the way to a backend and
//! restored on the way back. Completion is signalled through the
//! [`InFlight`]/[`Completion`] pair in [`completion`].

use std::{borrow::Cow, fmt};

use log::error;
use tokio::time::{Duration, Instant};

pub mod completion;

pub use completion::{Completion, InFlight};

use crate::{
    buffer_pool::{BufferPool, PooledBuf},
    error::{ProtocolError, ProxyError},
    message::{self, MessageType, decode_header, seq_id_offset, write_message_begin},
};

/// Separator between service and method in multiplexed names.
pub const SERVICE_SEPARATOR: char = ':';

/// Response half of a request.
#[derive(Default)]
struct Response {
    data: Option<PooledBuf>,
    error: Option<ProxyError>,
    message_type: Option<MessageType>,
}

/// One client call travelling through the proxy.
pub struct Request {
    service: String,
    method: String,
    message_type: MessageType,
    seq_id: i32,
    data: PooledBuf,
    offset: usize,
    service_in_name: bool,
    rewritten_seq_id: Option<i32>,
    start: Instant,
    response: Response,
}

impl Request {
    /// Decode a request from a client frame.
    ///
    /// With `service_in_name`, a `service:method` name is split and the
    /// service prefix is stripped from the frame when the sequence id is
    /// rewritten.
    ///
    /// # Errors
    ///
    /// Returns the [`ProtocolError`] raised while decoding the header.
    pub fn from_frame(frame: PooledBuf, service_in_name: bool) -> Result<Self, ProtocolError> {
        let header = decode_header(&frame)?;
        let (service, method) = match header.name.split_once(SERVICE_SEPARATOR) {
            Some((service, method)) if service_in_name => (service.to_owned(), method.to_owned()),
            _ => (String::new(), header.name),
        };
        Ok(Self {
            service,
            method,
            message_type: header.message_type,
            seq_id: header.seq_id,
            data: frame,
            offset: 0,
            service_in_name,
            rewritten_seq_id: None,
            start: Instant::now(),
            response: Response::default(),
        })
    }

    /// Logical service name.
    #[must_use]
    pub fn service(&self) -> &str { &self.service }

    /// Assign the logical service, used where the frame does not name one.
    pub fn set_service(&mut self, service: &str) {
        if self.service != service {
            service.clone_into(&mut self.service);
        }
    }

    /// Method name without any service prefix.
    #[must_use]
    pub fn method(&self) -> &str { &self.method }

    /// Message type of the request.
    #[must_use]
    pub fn message_type(&self) -> MessageType { self.message_type }

    /// Sequence id assigned by the client.
    #[must_use]
    pub fn seq_id(&self) -> i32 { self.seq_id }

    /// Sequence id assigned by the backend connection, once sent.
    #[must_use]
    pub fn rewritten_seq_id(&self) -> Option<i32> { self.rewritten_seq_id }

    /// When the request was decoded.
    #[must_use]
    pub fn start(&self) -> Instant { self.start }

    /// Time since the request was decoded.
    #[must_use]
    pub fn elapsed(&self) -> Duration { self.start.elapsed() }

    /// Bytes to send to the backend.
    #[must_use]
    pub fn payload(&self) -> &[u8] { &self.data[self.offset..] }

    /// Rewrite the frame's sequence id to `new_seq_id`.
    ///
    /// When the name carried a service prefix, the new header omits it and
    /// is written so it ends where the original header ended; the payload
    /// view then starts past the stripped prefix. A second call is a
    /// programming error and is logged and ignored.
    pub fn replace_seq_id(&mut self, new_seq_id: i32) {
        if let Some(previous) = self.rewritten_seq_id {
            error!(
                "sequence id already rewritten: service={}, method={}, previous={previous}, \
                 new={new_seq_id}",
                self.service, self.method
            );
            return;
        }
        let start = if self.service_in_name && !self.service.is_empty() {
            self.service.len() + 1
        } else {
            0
        };
        let Some(target) = self.data.get_mut(start..) else {
            return;
        };
        if write_message_begin(target, &self.method, self.message_type, new_seq_id) {
            self.offset = start;
            self.rewritten_seq_id = Some(new_seq_id);
        }
    }

    /// Put the client's sequence id back into the response.
    ///
    /// The response is expected to carry the same method name as the
    /// request; the id sits at a fixed offset after it.
    pub fn restore_seq_id(&mut self) {
        let offset = seq_id_offset(&self.method);
        let seq = crate::byte_order::write_network_i32(self.seq_id);
        if let Some(dst) = self
            .response
            .data
            .as_mut()
            .and_then(|data| data.get_mut(offset..offset + 4))
        {
            dst.copy_from_slice(&seq);
        }
    }

    /// Store the backend's response frame.
    pub fn set_response(&mut self, data: PooledBuf, message_type: MessageType) {
        self.response.data = Some(data);
        self.response.message_type = Some(message_type);
    }

    /// Store a locally synthesized response.
    pub fn respond_with(&mut self, data: Vec<u8>, message_type: MessageType) {
        self.set_response(PooledBuf::from(data), message_type);
    }

    /// Answer with a copy of the request frame.
    pub fn echo(&mut self, pool: &BufferPool) {
        let copy = pool.acquire_from(self.payload());
        self.set_response(copy, self.message_type);
    }

    /// Record a failure.
    pub fn set_error(&mut self, error: ProxyError) { self.response.error = Some(error); }

    /// Failure recorded for this request, if any.
    #[must_use]
    pub fn error(&self) -> Option<&ProxyError> { self.response.error.as_ref() }

    /// Response frame, if one was stored.
    #[must_use]
    pub fn response_data(&self) -> Option<&[u8]> { self.response.data.as_deref() }

    /// Message type of the response, if one was stored.
    #[must_use]
    pub fn response_type(&self) -> Option<MessageType> { self.response.message_type }

    /// Error reported when the request outlives the expiry age.
    #[must_use]
    pub fn timeout_error(&self) -> ProxyError {
        ProxyError::Timeout {
            service: self.service.clone(),
            method: self.method.clone(),
            elapsed: self.elapsed(),
        }
    }

    /// Error reported when the backend answers a different method.
    #[must_use]
    pub fn invalid_response(&self, actual: &str) -> ProxyError {
        ProxyError::InvalidResponse {
            expected: self.method.clone(),
            actual: actual.to_owned(),
        }
    }

    /// Bytes to write back to the client.
    ///
    /// Failures, and requests that were never answered, become exception
    /// replies naming `module`.
    #[must_use]
    pub fn reply_frame(&self, module: &str) -> Cow<'_, [u8]> {
        match (&self.response.error, self.response.data.as_deref()) {
            (None, Some(data)) => Cow::Borrowed(data),
            (Some(error), _) => Cow::Owned(message::dispatch_error(
                module,
                &self.service,
                &self.method,
                self.seq_id,
                error,
            )),
            (None, None) => Cow::Owned(message::dispatch_error(
                module,
                &self.service,
                &self.method,
                self.seq_id,
                &"no response",
            )),
        }
    }

    /// Release the request and response buffers into `pool`.
    pub fn recycle(self, pool: &BufferPool) {
        let Self { data, response, .. } = self;
        pool.release(data);
        if let Some(data) = response.data {
            pool.release(data);
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("service", &self.service)
            .field("method", &self.method)
            .field("message_type", &self.message_type)
            .field("seq_id", &self.seq_id)
            .field("rewritten_seq_id", &self.rewritten_seq_id)
            .field("error", &self.response.error)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::Request;
    use crate::{
        buffer_pool::{BufferPool, PooledBuf},
        error::ProxyError,
        message::{MessageType, decode_header, encode_message_begin},
    };

    fn frame(name: &str, seq: i32, body: &[u8]) -> PooledBuf {
        let mut out = Vec::new();
        encode_message_begin(&mut out, name, MessageType::Call, seq);
        out.extend_from_slice(body);
        PooledBuf::from(out)
    }

    #[rstest]
    #[case::multiplexed("user:get", true, "user", "get")]
    #[case::prefix_ignored("user:get", false, "", "user:get")]
    #[case::plain("get", true, "", "get")]
    fn splits_service_from_name(
        #[case] name: &str,
        #[case] service_in_name: bool,
        #[case] service: &str,
        #[case] method: &str,
    ) {
        let req = Request::from_frame(frame(name, 1, b""), service_in_name).unwrap();
        assert_eq!(req.service(), service);
        assert_eq!(req.method(), method);
    }

    #[test]
    fn rewrite_strips_service_prefix_and_keeps_body() {
        let mut req = Request::from_frame(frame("user:get", 77, b"body"), true).unwrap();
        req.replace_seq_id(5);

        let header = decode_header(req.payload()).unwrap();
        assert_eq!(header.name, "get");
        assert_eq!(header.seq_id, 5);
        assert_eq!(header.message_type, MessageType::Call);
        assert!(req.payload().ends_with(b"body"));
        assert_eq!(req.payload().len(), header.encoded_len() + 4);
        assert_eq!(req.rewritten_seq_id(), Some(5));
    }

    #[test]
    fn second_rewrite_is_ignored() {
        let mut req = Request::from_frame(frame("get", 1, b""), false).unwrap();
        req.replace_seq_id(10);
        req.replace_seq_id(11);
        assert_eq!(req.rewritten_seq_id(), Some(10));
        assert_eq!(decode_header(req.payload()).unwrap().seq_id, 10);
    }

    #[test]
    fn restore_puts_client_id_back_byte_for_byte() {
        let original = frame("user:get", 0x0a0b_0c0d, b"");
        let original_id = original[16..20].to_vec();
        let mut req = Request::from_frame(original, true).unwrap();
        req.replace_seq_id(3);

        let mut response = Vec::new();
        encode_message_begin(&mut response, "get", MessageType::Reply, 3);
        response.push(0);
        req.set_response(PooledBuf::from(response), MessageType::Reply);
        req.restore_seq_id();

        let data = req.response_data().unwrap();
        assert_eq!(&data[11..15], original_id.as_slice());
        assert_eq!(decode_header(data).unwrap().seq_id, 0x0a0b_0c0d);
    }

    #[test]
    fn failed_request_replies_with_exception() {
        let mut req = Request::from_frame(frame("user:get", 9, b""), true).unwrap();
        req.set_error(ProxyError::Abandoned);
        let reply = req.reply_frame("session");
        let header = decode_header(&reply).unwrap();
        assert_eq!(header.message_type, MessageType::Exception);
        assert_eq!(header.seq_id, 9);
        assert!(String::from_utf8_lossy(&reply).contains("Service: user, Method: get"));
    }

    #[test]
    fn echo_copies_request_frame() {
        let pool = BufferPool::new();
        let mut req = Request::from_frame(frame("ping", 4, b""), false).unwrap();
        req.echo(&pool);
        assert_eq!(req.response_data(), Some(req.payload()));
        req.recycle(&pool);
    }
}
