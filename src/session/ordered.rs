//! One request at a time.

use tokio::io::{AsyncRead, AsyncWrite};

use super::{Context, Outcome, SessionError, next_frame};
use crate::{
    message::{self, MessageType},
    transport::{FrameReader, FrameWriter},
};

/// Answer each request before reading the next. Returns the number of
/// requests served.
pub(super) async fn run<R, W>(
    ctx: &Context,
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
) -> Result<u64, SessionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut ops = 0;
    while let Some(frame) = next_frame(reader, &ctx.options.shutdown).await? {
        let mut request = ctx.decode(frame)?;
        ops += 1;
        let outcome = if request.message_type() == MessageType::Heartbeat {
            request.respond_with(message::ping_reply(request.seq_id()), MessageType::Reply);
            Outcome::Answered(request)
        } else {
            ctx.exchange(request).await
        };
        ctx.write_outcome(writer, outcome);
        writer.flush_buffer(true).await?;
    }
    Ok(ops)
}
