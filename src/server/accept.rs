//! Accepting connections and spawning their handlers.

use std::{any::Any, future::Future, io, sync::Arc};

use async_trait::async_trait;
use futures::FutureExt;
use log::{error, info, warn};
use tokio::{
    net::TcpListener,
    select,
    time::{Duration, sleep},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{BackoffConfig, ServerError};
use crate::transport::BoxedTransport;

/// Source of incoming connections consumed by [`accept_loop`].
///
/// Dropping a pending `accept()` future must not leak the connection.
#[async_trait]
pub trait AcceptListener: Send + Sync {
    /// Wait for the next connection and name its peer.
    async fn accept(&self) -> io::Result<(BoxedTransport, String)>;

    /// Address the listener is bound to.
    fn local_addr(&self) -> String;
}

#[async_trait]
impl AcceptListener for TcpListener {
    async fn accept(&self) -> io::Result<(BoxedTransport, String)> {
        let (stream, peer) = TcpListener::accept(self).await?;
        stream.set_nodelay(true)?;
        Ok((Box::new(stream), peer.to_string()))
    }

    fn local_addr(&self) -> String {
        TcpListener::local_addr(self).map_or_else(|e| format!("<{e}>"), |a| a.to_string())
    }
}

/// Unix socket listener that removes its socket file when dropped.
#[cfg(unix)]
pub struct UnixSocketListener {
    listener: tokio::net::UnixListener,
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl UnixSocketListener {
    /// Bind `path`, replacing a socket file left by an earlier process.
    ///
    /// # Errors
    ///
    /// Returns the bind error.
    pub fn bind(path: impl Into<std::path::PathBuf>) -> io::Result<Self> {
        let path = path.into();
        match std::fs::remove_file(&path) {
            Ok(()) => info!("stale socket removed: path={}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = tokio::net::UnixListener::bind(&path)?;
        Ok(Self { listener, path })
    }
}

#[cfg(unix)]
impl Drop for UnixSocketListener {
    fn drop(&mut self) { let _ = std::fs::remove_file(&self.path); }
}

#[cfg(unix)]
#[async_trait]
impl AcceptListener for UnixSocketListener {
    async fn accept(&self) -> io::Result<(BoxedTransport, String)> {
        let (stream, _) = self.listener.accept().await?;
        Ok((Box::new(stream), self.path.display().to_string()))
    }

    fn local_addr(&self) -> String { self.path.display().to_string() }
}

/// Bind `addr`: TCP when it contains a `:`, otherwise a unix socket path.
///
/// # Errors
///
/// Returns [`ServerError::Bind`] if the address cannot be bound.
pub async fn bind(addr: &str) -> Result<Arc<dyn AcceptListener>, ServerError> {
    let bind_error = |source| ServerError::Bind {
        addr: addr.to_owned(),
        source,
    };
    if addr.contains(':') {
        let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
        return Ok(Arc::new(listener));
    }
    #[cfg(unix)]
    {
        let listener = UnixSocketListener::bind(addr).map_err(bind_error)?;
        Ok(Arc::new(listener))
    }
    #[cfg(not(unix))]
    {
        Err(bind_error(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix sockets are not supported on this platform",
        )))
    }
}

/// Controls for [`accept_loop`].
#[derive(Clone, Debug, Default)]
pub struct AcceptLoopOptions {
    /// Stops accepting when cancelled.
    pub shutdown: CancellationToken,
    /// Tracks every spawned handler.
    pub tracker: TaskTracker,
    /// Back-off after accept failures.
    pub backoff: BackoffConfig,
}

/// Accept connections from `listener` until `shutdown`, running `handler`
/// on each in a tracked task.
///
/// A failing `accept()` is retried after an exponential back-off. A
/// panicking handler is logged and does not stop the loop.
pub async fn accept_loop<H, Fut>(
    listener: Arc<dyn AcceptListener>,
    handler: H,
    options: AcceptLoopOptions,
) where
    H: Fn(BoxedTransport, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let backoff = options.backoff.normalized();
    let mut delay = backoff.initial_delay;
    tracing::info!(addr = %listener.local_addr(), "listening");
    while let Some(next) =
        accept_iteration(listener.as_ref(), &handler, &options, &backoff, delay).await
    {
        delay = next;
    }
    tracing::info!(addr = %listener.local_addr(), "stopped listening");
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
async fn accept_iteration<H, Fut>(
    listener: &dyn AcceptListener,
    handler: &H,
    options: &AcceptLoopOptions,
    backoff: &BackoffConfig,
    delay: Duration,
) -> Option<Duration>
where
    H: Fn(BoxedTransport, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    select! {
        biased;

        () = options.shutdown.cancelled() => None,
        res = listener.accept() => Some(match res {
            Ok((stream, peer)) => {
                spawn_connection_task(handler(stream, peer.clone()), peer, &options.tracker);
                backoff.initial_delay
            }
            Err(e) => {
                warn!(
                    "accept error: error={e:?}, local_addr={}",
                    listener.local_addr()
                );
                crate::metrics::inc_errors("accept");
                sleep(delay).await;
                backoff.next(delay)
            }
        }),
    }
}

fn spawn_connection_task<Fut>(task: Fut, peer: String, tracker: &TaskTracker)
where
    Fut: Future<Output = ()> + Send + 'static,
{
    tracker.spawn(async move {
        if let Err(panic) = std::panic::AssertUnwindSafe(task).catch_unwind().await {
            let panic_msg = panic_message(panic.as_ref());
            error!("connection task panicked: panic={panic_msg}, peer={peer}");
            tracing::error!(panic = %panic_msg, %peer, "connection task panicked");
        }
    });
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else {
        format!("{payload:?}")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::{io::AsyncWriteExt, net::TcpStream};
    use tracing_test::traced_test;

    use super::*;

    #[test]
    fn panic_payloads_are_readable() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&String::from("bang")), "bang");
        assert!(panic_message(&5_u32).contains("Any"));
    }

    #[traced_test]
    #[tokio::test]
    async fn handlers_run_and_panics_are_contained() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = AcceptLoopOptions::default();
        let handler = {
            let calls = Arc::clone(&calls);
            move |_stream: BoxedTransport, _peer: String| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    assert!(n != 0, "first connection panics");
                }
            }
        };
        let clients = async {
            for _ in 0..2 {
                let mut client = TcpStream::connect(&addr).await.unwrap();
                client.shutdown().await.unwrap();
            }
            while calls.load(Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
            options.shutdown.cancel();
        };
        tokio::join!(accept_loop(listener, handler, options.clone()), clients);
        options.tracker.close();
        options.tracker.wait().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(logs_contain("listening"));
        assert!(logs_contain("stopped listening"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_listener_replaces_stale_socket() {
        let dir = std::env::temp_dir().join(format!("relayframe-accept-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("stale.sock");
        std::fs::write(&path, b"").unwrap();
        let listener = UnixSocketListener::bind(&path).unwrap();
        assert_eq!(listener.local_addr(), path.display().to_string());
        drop(listener);
        assert!(!path.exists());
    }
}
