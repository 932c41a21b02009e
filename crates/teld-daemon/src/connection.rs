//! Per-connection protocol driver.
//!
//! Each accepted connection runs one instance of [`serve`]: read the
//! connect frame, answer it, then merge observation frames into the
//! connected entry in arrival order until the peer hangs up, the entry is
//! evicted, or the daemon shuts down. Any protocol error closes this
//! connection and nothing else.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::debug;

use crate::apps::{AppTable, ConnHandle, ObserveError};
use crate::protocol::messages::ClientMessage;
use crate::protocol::{FrameCodec, ProtocolError, ProtocolResult};

/// Drive one connection to completion.
///
/// # Errors
///
/// Returns a [`ProtocolError`] on malformed frames or transport failures;
/// the caller logs it and drops the connection.
pub async fn serve<S>(stream: S, table: Arc<AppTable>) -> ProtocolResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut framed = Framed::new(stream, FrameCodec::new());
    let state = Arc::clone(table.state());

    // The first frame must announce the application identity.
    let first = tokio::select! {
        frame = framed.next() => frame,
        () = state.wait_shutdown() => return Ok(()),
    };
    let Some(frame) = first else {
        return Ok(());
    };
    let msg = ClientMessage::decode(&frame?)?;
    let kind = msg.kind();
    let ClientMessage::Connect(identity) = msg else {
        return Err(ProtocolError::ExpectedConnect { got: kind });
    };

    let (entry, reply) = table.connect(identity).await;
    framed.send(reply.encode()?).await?;
    let Some(entry) = entry else {
        // Rejected: the reply already told the library why.
        return Ok(());
    };

    let conn = Arc::new(ConnHandle::new());
    entry.attach(&conn);

    loop {
        tokio::select! {
            frame = framed.next() => {
                let Some(frame) = frame else { break };
                let msg = ClientMessage::decode(&frame?)?;
                match entry.observe(msg) {
                    Ok(()) => {}
                    Err(e @ ObserveError::Disconnected) => {
                        // Closing makes the library reconnect and redo the
                        // connect handshake.
                        debug!(app = %entry.identity(), "{e}");
                        break;
                    }
                    Err(e @ ObserveError::UnexpectedConnect) => {
                        debug!(app = %entry.identity(), "{e}");
                        break;
                    }
                }
            }
            () = conn.wait_closed() => break,
            () = state.wait_shutdown() => break,
        }
    }
    Ok(())
}
