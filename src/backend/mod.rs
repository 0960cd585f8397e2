//! Backend connections and the pools that choose between them.
//!
//! A [`BackendConnection`] owns one physical connection to a backend worker
//! and runs a write loop and a read loop over it. A [`BackendPool`] keeps
//! the connections of one service that currently accept work and spreads
//! requests across them round robin. Connections report their transition
//! to inactive through a [`StateListener`] so the pool can drop them.

mod connection;
mod counter;
pub mod dialer;
pub mod pool;
mod read_loop;
mod write_loop;

pub use connection::{BackendConnection, StateListener};
pub use counter::open_backend_count;
pub use dialer::EndpointDialer;
pub use pool::BackendPool;
use tokio::time::Duration;

use crate::{
    buffer_pool::BufferPool,
    pending::DEFAULT_CAPACITY,
    seq_id::SeqIdRange,
    transport::TransportOptions,
};

/// Default period of the heartbeat timer.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
/// Default silence after which a connection is considered dead.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(6);
/// Default age after which a pending request fails with a timeout.
pub const DEFAULT_REQUEST_EXPIRY: Duration = Duration::from_secs(5);
/// Default age after which a queued ping is discarded unsent.
pub const DEFAULT_PING_EXPIRY: Duration = Duration::from_secs(4);
/// Default inbound queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Tunables for one backend connection.
#[derive(Clone, Debug)]
pub struct BackendOptions {
    /// Period of the heartbeat timer.
    pub heartbeat_interval: Duration,
    /// Silence after which the connection is closed.
    pub heartbeat_timeout: Duration,
    /// Age after which a pending request fails.
    pub request_expiry: Duration,
    /// Age after which a queued ping is discarded.
    pub ping_expiry: Duration,
    /// Capacity of the inbound queue.
    pub queue_capacity: usize,
    /// Capacity of the pending-request table.
    pub pending_capacity: usize,
    /// Sequence ids this connection rewrites requests into.
    pub seq_ids: SeqIdRange,
    /// Framing limits and flush policy.
    pub transport: TransportOptions,
    /// Pool response frames are read into.
    pub buffer_pool: BufferPool,
    /// Log per-request detail.
    pub verbose: bool,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            request_expiry: DEFAULT_REQUEST_EXPIRY,
            ping_expiry: DEFAULT_PING_EXPIRY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            pending_capacity: DEFAULT_CAPACITY,
            seq_ids: SeqIdRange::LB,
            transport: TransportOptions::default(),
            buffer_pool: BufferPool::new(),
            verbose: false,
        }
    }
}
