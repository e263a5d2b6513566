//! Per-connection protocol detection
//!
//! Every connection starts with a sniff of its first byte: `0x80` is the
//! binary magic, anything else is the text protocol. The sniffing read
//! runs under a short deadline so half-open connections cannot pin a
//! connection slot forever.

use super::Server;
use super::{binary, text};
use crate::protocol::binary::MAGIC_REQUEST;
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

/// Deadline for the first byte of a fresh connection
const PROTOCOL_DETECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle a single client connection
pub(crate) async fn handle<S>(
    server: Arc<Server>,
    mut stream: S,
    _permit: OwnedSemaphorePermit,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = drive(&server, &mut stream).await;
    server.metrics.active_connections.dec();
    result
}

async fn drive<S>(server: &Arc<Server>, stream: &mut S) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut read_buf = BytesMut::with_capacity(server.config.read_buffer_size);

    let first_read = tokio::select! {
        _ = server.cancel_token.cancelled() => return Ok(()),
        result = tokio::time::timeout(
            PROTOCOL_DETECT_TIMEOUT,
            stream.read_buf(&mut read_buf),
        ) => result,
    };

    let n = match first_read {
        Err(_) => {
            debug!("Protocol detection timed out");
            return Ok(());
        }
        Ok(Ok(0)) => return Ok(()),
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(e.into()),
    };
    server.metrics.bytes_read.inc_by(n as u64);

    if read_buf[0] == MAGIC_REQUEST {
        binary::session(server, stream, read_buf).await
    } else {
        text::session(server, stream, read_buf).await
    }
}
