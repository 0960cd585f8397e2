//! A scripted backend worker.
//!
//! [`duplex_worker`] returns the proxy's end of an in-memory connection and
//! a [`WorkerHandle`] driving the worker on the other end. The worker
//! answers heartbeats and reacts to calls according to its [`Behaviour`].

use std::sync::{
    Arc,
    Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use relayframe::{
    buffer_pool::BufferPool,
    message::{MessageType, decode_header},
    transport::{self, Transport, TransportOptions},
};
use tokio::{
    io::DuplexStream,
    sync::mpsc,
    task::JoinHandle,
    time::{self, Duration},
};

use crate::frames;

/// How the worker treats calls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Behaviour {
    /// Reply to each call with the call's name, id and body.
    #[default]
    Echo,
    /// Record calls without replying.
    Silent,
    /// Reply under a different method name.
    WrongMethod,
    /// Answer nothing, not even heartbeats.
    Mute,
}

/// Name used in replies of a [`Behaviour::WrongMethod`] worker.
pub const WRONG_METHOD: &str = "not_the_method";

enum Control {
    Stop,
    Close,
}

#[derive(Default)]
struct Stats {
    calls: AtomicUsize,
    heartbeats: AtomicUsize,
    stop_confirmed: AtomicBool,
    seq_ids: Mutex<Vec<i32>>,
}

/// Drives and observes a running fake worker.
pub struct WorkerHandle {
    control: mpsc::UnboundedSender<Control>,
    stats: Arc<Stats>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Calls received so far.
    #[must_use]
    pub fn calls(&self) -> usize { self.stats.calls.load(Ordering::SeqCst) }

    /// Heartbeats received so far.
    #[must_use]
    pub fn heartbeats(&self) -> usize { self.stats.heartbeats.load(Ordering::SeqCst) }

    /// Whether a stop confirm arrived.
    #[must_use]
    pub fn stop_confirmed(&self) -> bool { self.stats.stop_confirmed.load(Ordering::SeqCst) }

    /// Sequence ids of the calls received, in arrival order.
    #[must_use]
    pub fn seq_ids(&self) -> Vec<i32> {
        self.stats
            .seq_ids
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Ask the proxy to stop sending work.
    pub fn send_stop(&self) { let _ = self.control.send(Control::Stop); }

    /// Drop the worker's end of the connection.
    pub async fn close(self) {
        let _ = self.control.send(Control::Close);
        let _ = self.task.await;
    }

    /// Poll every millisecond until `done` holds for this handle.
    pub async fn until(&self, done: impl Fn(&Self) -> bool) {
        while !done(self) {
            time::sleep(Duration::from_millis(1)).await;
        }
    }
}

/// Start a worker behind an in-memory connection and return the proxy's
/// end of it.
#[must_use]
pub fn duplex_worker(behaviour: Behaviour) -> (DuplexStream, WorkerHandle) {
    let (proxy_side, worker_side) = tokio::io::duplex(64 * 1024);
    (proxy_side, spawn_worker(worker_side, behaviour))
}

/// Run a worker on `stream`.
#[must_use]
pub fn spawn_worker<S: Transport>(stream: S, behaviour: Behaviour) -> WorkerHandle {
    let (control, rx) = mpsc::unbounded_channel();
    let stats = Arc::new(Stats::default());
    let task = tokio::spawn(run(stream, behaviour, rx, Arc::clone(&stats)));
    WorkerHandle {
        control,
        stats,
        task,
    }
}

async fn run<S: Transport>(
    stream: S,
    behaviour: Behaviour,
    mut control: mpsc::UnboundedReceiver<Control>,
    stats: Arc<Stats>,
) {
    let (mut reader, mut writer) =
        transport::framed(stream, BufferPool::new(), TransportOptions::default());
    loop {
        let frame = tokio::select! {
            biased;

            ctl = control.recv() => match ctl {
                Some(Control::Stop) => {
                    if writer.send_frame(&frames::stop(), true).await.is_err() {
                        break;
                    }
                    continue;
                }
                Some(Control::Close) | None => break,
            },
            res = reader.read_frame() => match res {
                Ok(frame) => frame,
                Err(_) => break,
            },
        };
        let Ok(header) = decode_header(&frame) else {
            break;
        };
        let answer = match header.message_type {
            MessageType::Heartbeat => {
                stats.heartbeats.fetch_add(1, Ordering::SeqCst);
                (behaviour != Behaviour::Mute).then(|| frame.to_vec())
            }
            MessageType::StopConfirm => {
                stats.stop_confirmed.store(true, Ordering::SeqCst);
                None
            }
            _ => {
                stats.calls.fetch_add(1, Ordering::SeqCst);
                stats
                    .seq_ids
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push(header.seq_id);
                let body = &frame[header.encoded_len()..];
                match behaviour {
                    Behaviour::Echo => Some(frames::reply(&header.name, header.seq_id, body)),
                    Behaviour::WrongMethod => Some(frames::reply(WRONG_METHOD, header.seq_id, body)),
                    Behaviour::Silent | Behaviour::Mute => None,
                }
            }
        };
        if let Some(answer) = answer
            && writer.send_frame(&answer, true).await.is_err()
        {
            break;
        }
    }
    let _ = writer.shutdown().await;
}
