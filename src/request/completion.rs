//! Single-shot completion of a request.
//!
//! [`InFlight`] travels with the request through queues and the pending
//! table; [`Completion`] stays with the caller. Completing consumes the
//! `InFlight`, so a request can be completed at most once. An `InFlight`
//! dropped without completing reports [`ProxyError::Abandoned`], so a
//! waiter is never left hanging.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::sync::oneshot;

use super::Request;
use crate::error::ProxyError;

/// Request travelling towards a backend, carrying its completion.
pub struct InFlight {
    request: Option<Request>,
    reply: Option<oneshot::Sender<Request>>,
}

impl InFlight {
    /// Pair `request` with a fresh completion.
    #[must_use]
    pub fn new(request: Request) -> (Self, Completion) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                request: Some(request),
                reply: Some(tx),
            },
            Completion(Inner::Pending(rx)),
        )
    }

    /// The request being carried.
    #[must_use]
    pub fn request(&self) -> &Request {
        self.request
            .as_ref()
            .unwrap_or_else(|| unreachable!("request is only taken on completion"))
    }

    /// Mutable access to the request being carried.
    pub fn request_mut(&mut self) -> &mut Request {
        self.request
            .as_mut()
            .unwrap_or_else(|| unreachable!("request is only taken on completion"))
    }

    /// Hand the request back to its caller.
    pub fn complete(mut self) { self.finish(None); }

    /// Record `error` and hand the request back to its caller.
    pub fn fail(mut self, error: ProxyError) { self.finish(Some(error)); }

    fn finish(&mut self, error: Option<ProxyError>) {
        if let (Some(mut request), Some(reply)) = (self.request.take(), self.reply.take()) {
            if let Some(error) = error {
                request.set_error(error);
            }
            // The caller may have stopped waiting; the request is dropped then.
            let _ = reply.send(request);
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) { self.finish(Some(ProxyError::Abandoned)); }
}

impl std::fmt::Debug for InFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("InFlight").field(&self.request).finish()
    }
}

enum Inner {
    Pending(oneshot::Receiver<Request>),
    Ready(Option<Request>),
}

/// Future resolving to the finished request.
///
/// Request-level failures are reported through [`Request::error`]; the
/// `Err` arm is only reached when the completion side vanished.
pub struct Completion(Inner);

impl Completion {
    /// A completion that is already resolved, used for locally answered
    /// requests.
    #[must_use]
    pub fn ready(request: Request) -> Self { Self(Inner::Ready(Some(request))) }
}

impl Future for Completion {
    type Output = Result<Request, ProxyError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().0 {
            Inner::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|res| res.map_err(|_| ProxyError::Abandoned)),
            Inner::Ready(request) => Poll::Ready(request.take().ok_or(ProxyError::Abandoned)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Completion, InFlight};
    use crate::{
        buffer_pool::PooledBuf,
        error::ProxyError,
        message::{MessageType, encode_message_begin},
        request::Request,
    };

    fn request() -> Request {
        let mut frame = Vec::new();
        encode_message_begin(&mut frame, "svc:call", MessageType::Call, 1);
        Request::from_frame(PooledBuf::from(frame), true).unwrap()
    }

    #[tokio::test]
    async fn completes_with_request() {
        let (in_flight, completion) = InFlight::new(request());
        in_flight.complete();
        let req = completion.await.unwrap();
        assert!(req.error().is_none());
        assert_eq!(req.method(), "call");
    }

    #[tokio::test]
    async fn failure_is_recorded_on_request() {
        let (in_flight, completion) = InFlight::new(request());
        in_flight.fail(ProxyError::InactiveBackend { addr: "a".into() });
        let req = completion.await.unwrap();
        assert!(matches!(req.error(), Some(ProxyError::InactiveBackend { .. })));
    }

    #[tokio::test]
    async fn dropped_in_flight_reports_abandoned() {
        let (in_flight, completion) = InFlight::new(request());
        drop(in_flight);
        let req = completion.await.unwrap();
        assert!(matches!(req.error(), Some(ProxyError::Abandoned)));
    }

    #[tokio::test]
    async fn ready_completion_resolves_immediately() {
        let req = Completion::ready(request()).await.unwrap();
        assert_eq!(req.service(), "svc");
    }
}
