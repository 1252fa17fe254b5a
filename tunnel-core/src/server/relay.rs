//! Relays bytes between one upstream TCP socket and the tunnel, for one
//! logical connection id, after a successful dial.

use super::dispatcher::ServerHandle;
use super::UpstreamEvent;
use crate::idle::Activity;
use crate::ConnectionId;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Owns `upstream` for the lifetime of one logical connection: reads from
/// it and forwards data frames to the tunnel, and writes to it whatever the
/// dispatcher hands through `inbox`. Unregisters itself as soon as either
/// direction ends, rather than waiting for both — an upstream that closes
/// its write side (e.g. `Connection: close`) must free the id and notify
/// the peer immediately, not whenever the local side happens to close too.
pub(crate) async fn run_upstream_relay(
    connection_id: ConnectionId,
    upstream: TcpStream,
    mut inbox: mpsc::Receiver<UpstreamEvent>,
    handle: ServerHandle,
    activity: Activity,
    max_payload: usize,
) {
    let (mut read_half, mut write_half) = upstream.into_split();
    let writer = handle.writer().clone();

    let download = async {
        let mut buf = vec![0u8; max_payload];
        loop {
            let n = read_half.read(&mut buf).await?;
            if n == 0 {
                return Ok::<_, std::io::Error>(());
            }
            activity.touch();
            if writer
                .send_data(connection_id, Bytes::copy_from_slice(&buf[..n]))
                .await
                .is_err()
            {
                return Ok(());
            }
        }
    };

    let upload = async {
        while let Some(event) = inbox.recv().await {
            match event {
                UpstreamEvent::Data(payload) => {
                    activity.touch();
                    write_half.write_all(&payload).await?;
                }
                UpstreamEvent::Close => break,
            }
        }
        Ok::<_, std::io::Error>(())
    };

    tokio::select! {
        _ = download => {}
        _ = upload => {}
    }
    let _ = write_half.shutdown().await;
    handle.unregister(connection_id).await;
}
