//! Concurrent dispatch, answered in completion order.
//!
//! The read side spawns one tracked task per request, at most
//! `max_pipeline` at a time. Finished requests go through a bounded queue
//! to the write side, which flushes whenever the queue runs dry.

use std::sync::Arc;

use log::{debug, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{Semaphore, mpsc},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{Context, Outcome, SessionError, exchange, next_frame};
use crate::{
    message::MessageType,
    transport::{FrameReader, FrameWriter},
};

/// Serve requests concurrently until the client closes. Returns the
/// number of requests read.
pub(super) async fn run<R, W>(
    ctx: &Context,
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
) -> Result<u64, SessionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let capacity = ctx.options.max_pipeline.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    // Cancelled by either side so the other stops too.
    let stop = ctx.options.shutdown.child_token();
    let (read, written) = tokio::join!(
        async {
            let res = read_requests(ctx, reader, tx, capacity, &stop).await;
            if res.is_err() {
                stop.cancel();
            }
            res
        },
        async {
            let res = write_replies(ctx, writer, rx).await;
            stop.cancel();
            res
        },
    );
    let ops = read?;
    written?;
    Ok(ops)
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus operations internally"
)]
async fn read_requests<R: AsyncRead + Unpin>(
    ctx: &Context,
    reader: &mut FrameReader<R>,
    tx: mpsc::Sender<Outcome>,
    capacity: usize,
    stop: &CancellationToken,
) -> Result<u64, SessionError> {
    let permits = Arc::new(Semaphore::new(capacity));
    let tracker = TaskTracker::new();
    let mut ops = 0;
    let result = loop {
        let frame = match next_frame(reader, stop).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(ops),
            Err(e) => break Err(e),
        };
        let mut request = match ctx.decode(frame) {
            Ok(request) => request,
            Err(e) => break Err(e.into()),
        };
        ops += 1;

        if request.message_type() == MessageType::Heartbeat {
            request.echo(ctx.pool());
            if tx.send(Outcome::Answered(request)).await.is_err() {
                break Ok(ops);
            }
            continue;
        }

        let permit = tokio::select! {
            biased;

            () = stop.cancelled() => break Ok(ops),
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break Ok(ops),
            },
        };
        let dispatcher = Arc::clone(&ctx.dispatcher);
        let clock = ctx.options.clock.clone();
        let module = ctx.module();
        let tx = tx.clone();
        tracker.spawn(async move {
            let outcome = exchange(dispatcher.as_ref(), &clock, module, request).await;
            if tx.send(outcome).await.is_err() {
                debug!("reply dropped, session writer gone");
            }
            drop(permit);
        });
    };
    tracker.close();
    tracker.wait().await;
    if let Err(e) = &result {
        warn!("session read failed: peer={}, error={e}", ctx.peer);
    }
    result
}

async fn write_replies<W: AsyncWrite + Unpin>(
    ctx: &Context,
    writer: &mut FrameWriter<W>,
    mut rx: mpsc::Receiver<Outcome>,
) -> Result<(), SessionError> {
    while let Some(outcome) = rx.recv().await {
        ctx.write_outcome(writer, outcome);
        writer.flush_buffer(rx.is_empty()).await?;
    }
    writer.flush_buffer(true).await?;
    Ok(())
}
