#![doc(html_root_url = "https://docs.rs/relayframe/latest")]
//! Public API for the `relayframe` library.
//!
//! An RPC load balancer and proxy tier. Client requests arrive as
//! length-prefixed frames, are routed to a backend connection of their
//! service and multiplexed over it under connection-local sequence ids;
//! responses are matched back by id and returned with the client's id
//! restored.
//!
//! The engine is [`backend::BackendConnection`] (one actor per backend
//! connection), [`pending::PendingTable`] (correlation by sequence id) and
//! [`backend::BackendPool`] (round-robin over the connections that accept
//! work). [`session`] serves client connections, [`router::Router`] and
//! [`discovery`] find backends, and [`server`] ties them into processes.

pub mod activity;
pub mod backend;
pub mod buffer_pool;
pub mod byte_order;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod metrics;
pub mod pending;
pub mod request;
pub mod router;
pub mod seq_id;
pub mod server;
pub mod session;
pub mod transport;

pub use backend::{BackendConnection, BackendOptions, BackendPool};
pub use buffer_pool::{BufferPool, PooledBuf};
pub use dispatch::Dispatcher;
pub use error::{ProtocolError, ProxyError};
pub use message::{MessageHeader, MessageType};
pub use metrics::Direction;
pub use request::{Completion, InFlight, Request};
pub use router::Router;
pub use session::{SessionMode, SessionOptions};
pub use transport::{FrameReader, FrameWriter, TransportError};
