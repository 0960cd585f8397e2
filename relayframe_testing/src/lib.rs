//! Test support for `relayframe`.
//!
//! Provides frame builders, a scripted backend worker running over
//! `tokio::io::duplex` and a serialized [`logtest`] logger fixture.
//!
//! ```rust
//! use relayframe_testing::{Behaviour, duplex_worker, frames};
//!
//! # async fn example() {
//! let (stream, worker) = duplex_worker(Behaviour::Echo);
//! let call = frames::call("get", 7);
//! # drop((stream, worker, call));
//! # }
//! ```

pub mod frames;
pub mod logging;
pub mod worker;

pub use logging::{LoggerHandle, logger};
pub use worker::{Behaviour, WRONG_METHOD, WorkerHandle, duplex_worker, spawn_worker};
