//! Framed OpenFlow connection over any byte stream.

use std::io;
use std::time::Duration;

use bytes::BytesMut;
use sdn_core::codec::{self, Envelope, Message};
use sdn_core::wire::WireError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_CHUNK: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed message: {0}")]
    Wire(#[from] WireError),

    #[error("peer closed the connection")]
    Closed,

    #[error("peer speaks OpenFlow version 0x{0:02x}, need 0x04")]
    UnsupportedVersion(u8),

    #[error("no traffic from peer after an echo probe")]
    KeepaliveExpired,

    #[error("peer stopped reading, write stalled for {0:?}")]
    WriteStalled(Duration),
}

/// One OpenFlow connection: a byte stream plus a receive buffer and an
/// xid counter.
///
/// `recv` is cancel-safe: bytes read before a cancelled call stay in the
/// buffer and are framed by the next call. Sends are bounded by the write
/// timeout when one is set; a stalled write leaves the stream unusable.
pub struct Connection<T> {
    io: T,
    rx: BytesMut,
    tx: BytesMut,
    next_xid: u32,
    write_timeout: Option<Duration>,
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: T) -> Self {
        Self {
            io,
            rx: BytesMut::with_capacity(READ_CHUNK),
            tx: BytesMut::new(),
            next_xid: 1,
            write_timeout: None,
        }
    }

    /// Fail any send that cannot complete within `limit`. Zero means no limit.
    pub fn with_write_timeout(mut self, limit: Duration) -> Self {
        self.write_timeout = (!limit.is_zero()).then_some(limit);
        self
    }

    /// Next complete message from the peer.
    pub async fn recv(&mut self) -> Result<Envelope, TransportError> {
        loop {
            if let Some(envelope) = codec::decode(&mut self.rx)? {
                return Ok(envelope);
            }
            self.rx.reserve(READ_CHUNK);
            let n = self.io.read_buf(&mut self.rx).await?;
            if n == 0 {
                return Err(TransportError::Closed);
            }
        }
    }

    /// Send a new request; returns the xid assigned to it.
    pub async fn send(&mut self, message: &Message) -> Result<u32, TransportError> {
        let xid = self.next_xid;
        self.next_xid = self.next_xid.wrapping_add(1).max(1);
        self.send_with_xid(xid, message).await?;
        Ok(xid)
    }

    /// Send a reply carrying the request's xid.
    pub async fn reply(&mut self, xid: u32, message: &Message) -> Result<(), TransportError> {
        self.send_with_xid(xid, message).await
    }

    async fn send_with_xid(&mut self, xid: u32, message: &Message) -> Result<(), TransportError> {
        self.tx.clear();
        codec::encode(xid, message, &mut self.tx)?;
        let Some(limit) = self.write_timeout else {
            return write_frame(&mut self.io, &self.tx).await;
        };
        tokio::time::timeout(limit, write_frame(&mut self.io, &self.tx))
            .await
            .map_err(|_| TransportError::WriteStalled(limit))?
    }

    /// The underlying stream. Writing to it bypasses framing.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.io
    }

    /// Flush and shut down the write half. Errors are irrelevant at this
    /// point and only logged.
    pub async fn close(&mut self) {
        if let Err(e) = self.io.shutdown().await {
            tracing::trace!(error = %e, "transport shutdown failed");
        }
    }
}

async fn write_frame<T>(io: &mut T, frame: &[u8]) -> Result<(), TransportError>
where
    T: AsyncWrite + Unpin,
{
    io.write_all(frame).await?;
    io.flush().await?;
    Ok(())
}
