//! Tokio driver: owns the socket and pumps bytes through a [`Context`].
//!
//! The context itself performs no I/O, so a connection needs someone to
//! establish the transport, write its outbound frames, feed it inbound
//! bytes and fire its reply timers. [`run`] is that loop. Context callbacks
//! are not `Send`, which keeps the whole thing on a current-thread runtime.

use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::connector::{self, Channel};
use crate::context::Context;
use crate::error::{ClientError, ClientResult};

const READ_BUFFER_SIZE: usize = 8192;

/// Runs a connection to completion: establishes the transport for the
/// pending connect, then pumps frames until the context goes terminal.
///
/// Connection-level outcomes (refused, died, protocol failure) are reported
/// through the context's state callback and `last_error()`, not through
/// this function's result; `Err` here means `run` was called on a context
/// with no connection attempt pending.
pub async fn run(ctx: &mut Context) -> ClientResult<()> {
    let Some(addr) = ctx.take_pending_connect() else {
        return Err(ClientError::InvalidState(
            "no connection attempt pending".to_string(),
        ));
    };

    let channel = match connector::establish(&addr, ctx.config().connect_timeout()).await {
        Ok(channel) => channel,
        Err(e) => {
            warn!(server = %addr, error = %e, "connection failed");
            ctx.connection_failed();
            return Ok(());
        }
    };

    ctx.connection_ready();
    match channel {
        Channel::Unix(stream) => pump(ctx, stream).await,
        Channel::Tcp(stream) => pump(ctx, stream).await,
    }
}

async fn pump<S>(ctx: &mut Context, mut stream: S) -> ClientResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        while let Some(frame) = ctx.pop_outbound() {
            if let Err(e) = stream.write_all(&frame).await {
                debug!(error = %e, "write failed");
                ctx.transport_died();
                return Ok(());
            }
        }
        if let Err(e) = stream.flush().await {
            debug!(error = %e, "flush failed");
            ctx.transport_died();
            return Ok(());
        }
        ctx.outbound_flushed();

        if ctx.state().is_terminal() {
            let _ = stream.shutdown().await;
            return Ok(());
        }

        let deadline = ctx
            .next_reply_deadline()
            .map(tokio::time::Instant::from_std);
        tokio::select! {
            read = stream.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("server closed the connection");
                    ctx.transport_died();
                }
                Ok(n) => ctx.feed_inbound(&buf[..n]),
                Err(e) => {
                    debug!(error = %e, "read failed");
                    ctx.transport_died();
                }
            },
            _ = wait_until(deadline) => ctx.handle_reply_timeouts(Instant::now()),
        }
    }
}

/// Sleeps until the deadline, or forever when there is none.
async fn wait_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
