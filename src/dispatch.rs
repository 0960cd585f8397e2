//! The seam between sessions and whatever serves their requests.

use async_trait::async_trait;

use crate::{
    error::ProxyError,
    request::{Completion, Request},
};

/// Something that takes a request and eventually answers it.
///
/// Implemented by a single [`BackendPool`](crate::backend::BackendPool)
/// and by the multi-service [`Router`](crate::router::Router). Answers
/// that can be produced without waiting, such as "not found" exceptions,
/// come back as an already resolved [`Completion`].
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Hand `request` on, returning once it is queued.
    ///
    /// Queuing may wait while the chosen backend's queue is full.
    async fn dispatch(&self, request: Request) -> Completion;

    /// Hand `request` on and wait for its answer.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Abandoned`] if the request was lost without
    /// ever being completed. Request-level failures are reported through
    /// [`Request::error`] instead.
    async fn call(&self, request: Request) -> Result<Request, ProxyError> {
        self.dispatch(request).await.await
    }
}
