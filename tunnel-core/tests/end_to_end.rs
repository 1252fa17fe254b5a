//! Wires a client dispatcher and a server dispatcher together over an
//! in-memory `tokio::io::duplex` tunnel (no real socket between the two
//! processes) and drives a raw SOCKS5 client against the client's local
//! listener, exercising connect/relay/close end to end.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tunnel_core::client::{self, DispatcherConfig as ClientDispatcherConfig};
use tunnel_core::server::{self, DispatcherConfig as ServerDispatcherConfig};

const STEP_TIMEOUT: Duration = Duration::from_secs(2);

async fn step<F: std::future::Future>(fut: F) -> F::Output {
    timeout(STEP_TIMEOUT, fut)
        .await
        .expect("step timed out")
}

/// Accepts one connection after another on `listener`, echoing back
/// whatever bytes it reads on each. Sends on the returned channel once an
/// accepted connection's echo loop observes EOF and finishes, so callers can
/// assert that upstream closure happened promptly rather than polling for it.
async fn spawn_echo_server(listener: TcpListener) -> mpsc::Receiver<()> {
    let (closed_tx, closed_rx) = mpsc::channel(8);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let closed_tx = closed_tx.clone();
            tokio::spawn(async move {
                let (mut read_half, mut write_half) = stream.into_split();
                let _ = tokio::io::copy(&mut read_half, &mut write_half).await;
                let _ = closed_tx.send(()).await;
            });
        }
    });
    closed_rx
}

async fn wire_tunnel() -> (client::ClientHandle, std::net::SocketAddr) {
    let (client_transport, server_transport) = tokio::io::duplex(64 * 1024);

    let (handle, _client_join) = client::run_dispatcher(
        client_transport,
        ClientDispatcherConfig::default(),
        None,
        None,
    )
    .await;
    let _server_join =
        server::run_dispatcher(server_transport, ServerDispatcherConfig::default(), None, None)
            .await;

    let local_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = local_listener.local_addr().unwrap();
    tokio::spawn(client::serve_local_listener(local_listener, handle.clone()));

    (handle, local_addr)
}

fn connect_request(port: u16) -> Vec<u8> {
    // CONNECT 127.0.0.1:<port>
    vec![
        0x05,
        0x01,
        0x00,
        0x01,
        127,
        0,
        0,
        1,
        (port >> 8) as u8,
        (port & 0xff) as u8,
    ]
}

#[tokio::test]
async fn connect_relay_and_clean_close_round_trip() {
    let echo_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo_listener.local_addr().unwrap();
    let mut echo_closed = spawn_echo_server(echo_listener).await;

    let (_handle, local_addr) = wire_tunnel().await;

    let mut socks_client = step(TcpStream::connect(local_addr)).await.unwrap();

    step(socks_client.write_all(&[0x05, 0x01, 0x00])).await.unwrap();
    let mut method_reply = [0u8; 2];
    step(socks_client.read_exact(&mut method_reply)).await.unwrap();
    assert_eq!(method_reply, [0x05, 0x00]);

    step(socks_client.write_all(&connect_request(echo_addr.port())))
        .await
        .unwrap();
    let mut connect_reply = [0u8; 10];
    step(socks_client.read_exact(&mut connect_reply)).await.unwrap();
    assert_eq!(connect_reply[1], 0x00, "expected REP=Succeeded");

    let sent = b"hello through the tunnel";
    step(socks_client.write_all(sent)).await.unwrap();
    let mut echoed = vec![0u8; sent.len()];
    step(socks_client.read_exact(&mut echoed)).await.unwrap();
    assert_eq!(&echoed, sent);

    step(socks_client.shutdown()).await.unwrap();
    // Closing the local half must propagate to the upstream connection right
    // away — not only once the idle sweep eventually notices — so the close
    // frame travels client -> server -> relay -> upstream shutdown well
    // within one step timeout, nowhere near the 60s idle default.
    step(echo_closed.recv())
        .await
        .expect("upstream connection should close promptly after the local side closes");

    let mut second = step(TcpStream::connect(local_addr)).await.unwrap();
    step(second.write_all(&[0x05, 0x01, 0x00])).await.unwrap();
    let mut method_reply = [0u8; 2];
    step(second.read_exact(&mut method_reply)).await.unwrap();
    assert_eq!(method_reply, [0x05, 0x00]);
}

#[tokio::test]
async fn unreachable_upstream_gets_host_unreachable_reply() {
    // Bind and immediately drop: the port is very likely refused on
    // connect, which is exactly the failure path under test.
    let doomed_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let doomed_addr = doomed_listener.local_addr().unwrap();
    drop(doomed_listener);

    let (_handle, local_addr) = wire_tunnel().await;
    let mut socks_client = step(TcpStream::connect(local_addr)).await.unwrap();

    step(socks_client.write_all(&[0x05, 0x01, 0x00])).await.unwrap();
    let mut method_reply = [0u8; 2];
    step(socks_client.read_exact(&mut method_reply)).await.unwrap();

    step(socks_client.write_all(&connect_request(doomed_addr.port())))
        .await
        .unwrap();
    let mut connect_reply = [0u8; 10];
    step(socks_client.read_exact(&mut connect_reply)).await.unwrap();
    assert_eq!(connect_reply[1], 0x04, "expected REP=HostUnreachable");
}

#[tokio::test]
async fn bind_command_is_rejected_locally_without_reaching_the_tunnel() {
    let (_handle, local_addr) = wire_tunnel().await;
    let mut socks_client = step(TcpStream::connect(local_addr)).await.unwrap();

    step(socks_client.write_all(&[0x05, 0x01, 0x00])).await.unwrap();
    let mut method_reply = [0u8; 2];
    step(socks_client.read_exact(&mut method_reply)).await.unwrap();

    // BIND (cmd=0x02) to an arbitrary address.
    let mut bind_request = connect_request(0);
    bind_request[1] = 0x02;
    step(socks_client.write_all(&bind_request)).await.unwrap();

    let mut reply = [0u8; 10];
    step(socks_client.read_exact(&mut reply)).await.unwrap();
    assert_eq!(reply[1], 0x07, "expected REP=CommandNotSupported");

    // The client side must have closed the session afterward.
    let mut trailing = [0u8; 1];
    let n = step(socks_client.read(&mut trailing)).await.unwrap();
    assert_eq!(n, 0, "expected EOF after a rejected command");
}
