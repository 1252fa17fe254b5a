//! One local SOCKS5 session: `INIT -> CONNECT -> CONNECT_WAIT -> STREAM ->
//! DESTROY`. Each accepted local connection runs this state machine in its
//! own task; the dispatcher never touches the local socket directly, only
//! the per-handler `mpsc` inbox.

use super::{ClientHandle, HandlerEvent};
use crate::socks5::{self, Reply, CMD_CONNECT};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Accepts local SOCKS5 connections on `listener` forever, spawning one
/// task per accepted stream. Returns only on a listener-level I/O error.
/// Takes an already-bound listener (rather than a bind address) so callers
/// can discover the assigned port — tests bind to `127.0.0.1:0` and read
/// it back via `local_addr()`.
pub async fn serve_local_listener(
    listener: TcpListener,
    handle: ClientHandle,
) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr(), "local SOCKS5 listener ready");

    loop {
        let (stream, peer) = listener.accept().await?;
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_local_connection(stream, handle).await {
                debug!(peer = %peer, error = %err, "local session ended");
            }
        });
    }
}

async fn serve_local_connection(
    mut stream: TcpStream,
    handle: ClientHandle,
) -> std::io::Result<()> {
    if !perform_greeting(&mut stream).await? {
        return Ok(());
    }

    let request_bytes = match read_connect_request(&mut stream).await? {
        Some(bytes) => bytes,
        None => return Ok(()),
    };

    let request = match socks5::parse_request(&request_bytes) {
        Ok(request) => request,
        Err(err) => {
            warn!(error = %err, "malformed SOCKS5 request, closing local session");
            return Ok(());
        }
    };

    if request.cmd != CMD_CONNECT {
        let reply = socks5::fixed_reply(Reply::CommandNotSupported);
        stream.write_all(&reply).await?;
        stream.shutdown().await?;
        return Ok(());
    }

    let (inbox_tx, mut inbox_rx) = mpsc::channel::<HandlerEvent>(64);
    let Some((connection_id, activity)) = handle.register(inbox_tx).await else {
        warn!("connection id space exhausted, rejecting local session");
        let reply = socks5::fixed_reply(Reply::GeneralFailure);
        stream.write_all(&reply).await?;
        stream.shutdown().await?;
        return Ok(());
    };

    if handle
        .writer()
        .send_data(connection_id, Bytes::from(request_bytes))
        .await
        .is_err()
    {
        return Ok(());
    }

    // CONNECT_WAIT: the next inbound frame for this id is the server's
    // SOCKS5 reply. Local reads are intentionally not polled here — bytes
    // the application sends early queue in its own OS send buffer, which
    // is an acceptable form of backpressure.
    let reply_payload = match inbox_rx.recv().await {
        Some(HandlerEvent::Data(payload)) => payload,
        Some(HandlerEvent::Close) | None => {
            let _ = stream.shutdown().await;
            return Ok(());
        }
    };
    stream.write_all(&reply_payload).await?;

    if reply_payload.len() < 2 || reply_payload[1] != Reply::Succeeded as u8 {
        let _ = stream.shutdown().await;
        handle.unregister(connection_id).await;
        return Ok(());
    }

    // STREAM: relay in both directions until either side closes. Whichever
    // direction ends first — the local app closing its write side, or a
    // close-frame arriving from the peer — tears the whole session down
    // immediately rather than waiting for the other half to follow.
    let (mut read_half, mut write_half) = stream.into_split();
    let writer = handle.writer().clone();
    let max_payload = handle.max_frame_payload() as usize;

    let upload = async {
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

    let download = async {
        while let Some(event) = inbox_rx.recv().await {
            match event {
                HandlerEvent::Data(payload) => {
                    write_half.write_all(&payload).await?;
                }
                HandlerEvent::Close => break,
            }
        }
        Ok::<_, std::io::Error>(())
    };

    tokio::select! {
        _ = upload => {}
        _ = download => {}
    }
    let _ = write_half.shutdown().await;
    handle.unregister(connection_id).await;
    Ok(())
}

/// Reads the greeting (`VER NMETHODS METHODS...`) and replies. Returns
/// `Ok(true)` if the handshake succeeded and the caller should continue
/// into `CONNECT`, `Ok(false)` if the connection was closed here.
async fn perform_greeting(stream: &mut TcpStream) -> std::io::Result<bool> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    let nmethods = header[1] as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    let mut greeting = Vec::with_capacity(2 + nmethods);
    greeting.extend_from_slice(&header);
    greeting.extend_from_slice(&methods);

    let method = match socks5::parse_greeting(&greeting) {
        Ok(method) => method,
        Err(_) => {
            warn!("unexpected greeting bytes, closing local session");
            return Ok(false);
        }
    };

    stream
        .write_all(&socks5::encode_method_selection(method))
        .await?;

    if method != socks5::METHOD_NO_AUTH {
        stream.shutdown().await?;
        return Ok(false);
    }
    Ok(true)
}

/// Reads exactly the bytes of one `CONNECT` request (`VER CMD RSV ATYP
/// DST.ADDR DST.PORT`), returning them verbatim for forwarding to the
/// server. `Ok(None)` means the stream was closed here.
async fn read_connect_request(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let atyp = header[3];

    let mut buf = header.to_vec();
    let tail_len = match atyp {
        0x01 => 4 + 2,
        0x04 => 16 + 2,
        0x03 => {
            let mut len_byte = [0u8; 1];
            stream.read_exact(&mut len_byte).await?;
            buf.push(len_byte[0]);
            len_byte[0] as usize + 2
        }
        _ => {
            let reply = socks5::fixed_reply(Reply::CommandNotSupported);
            stream.write_all(&reply).await?;
            stream.shutdown().await?;
            return Ok(None);
        }
    };

    let mut tail = vec![0u8; tail_len];
    stream.read_exact(&mut tail).await?;
    buf.extend_from_slice(&tail);
    Ok(Some(buf))
}
