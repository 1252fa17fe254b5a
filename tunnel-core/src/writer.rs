//! The single outbound writer task shared by both sides: every handler
//! submits `(id, payload)` pairs through a channel instead of writing the
//! tunnel socket directly, so frames are never interleaved mid-write.

use crate::cipher::TunnelCipher;
use crate::transport::{encrypt_in_place, write_write_preamble};
use crate::{frame, ConnectionId};
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// A cheaply-cloneable handle for submitting outbound frames. Held by every
/// handler task and by the dispatcher itself (for close-frames it emits on
/// unregister/idle-timeout).
#[derive(Clone)]
pub struct TunnelWriter {
    tx: mpsc::Sender<(ConnectionId, Bytes)>,
}

impl TunnelWriter {
    pub fn new(tx: mpsc::Sender<(ConnectionId, Bytes)>) -> Self {
        Self { tx }
    }

    /// Enqueue a data frame. Fails only once the writer task has shut down
    /// (tunnel socket gone), which callers treat the same as any other
    /// write failure on a dead tunnel.
    pub async fn send_data(&self, id: ConnectionId, payload: Bytes) -> Result<(), TunnelClosed> {
        self.tx.send((id, payload)).await.map_err(|_| TunnelClosed)
    }

    /// Enqueue the close-frame (`payload_len == 0`) for `id`.
    pub async fn send_close(&self, id: ConnectionId) -> Result<(), TunnelClosed> {
        self.send_data(id, Bytes::new()).await
    }
}

#[derive(Debug)]
pub struct TunnelClosed;

/// Drains `rx`, encoding and writing each frame to `write_half` in turn.
/// Returns once the channel closes (every `TunnelWriter` clone dropped) or
/// the socket errors.
pub async fn run_writer_task<W>(
    mut write_half: W,
    mut rx: mpsc::Receiver<(ConnectionId, Bytes)>,
    mut cipher: Box<dyn TunnelCipher>,
) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    write_write_preamble(cipher.as_mut(), &mut write_half).await?;

    let mut buf = BytesMut::new();
    while let Some((id, payload)) = rx.recv().await {
        buf.clear();
        frame::encode(id, &payload, &mut buf);
        encrypt_in_place(cipher.as_mut(), &mut buf);
        write_half.write_all(&buf).await?;
    }
    Ok(())
}
