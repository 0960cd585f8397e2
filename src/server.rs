//! Listeners and the two process roles.
//!
//! [`lb`] runs next to the workers of one service: workers connect to its
//! backend listener and clients reach them through its frontend. [`proxy`]
//! runs next to clients and dials every endpoint the registry lists,
//! routing each request by the service named in it.

use std::io;

use thiserror::Error;

mod accept;
mod backoff;
pub mod lb;
pub mod proxy;

pub use accept::{AcceptListener, AcceptLoopOptions, accept_loop, bind};
pub use backoff::BackoffConfig;

use crate::discovery::DiscoveryError;

/// Errors that end a server role.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A listener could not be bound.
    #[error("bind error: addr={addr}, error={source}")]
    Bind {
        /// Address that failed.
        addr: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Accepting a connection failed.
    #[error("accept error: {0}")]
    Accept(#[from] io::Error),
    /// The registry rejected an operation.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

/// Resolves on Ctrl-C, or at once if the signal handler cannot be
/// installed.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "signal handler not installed, shutting down");
    }
}
