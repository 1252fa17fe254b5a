use super::HandlerEvent;
use crate::cipher::{NullCipher, TunnelCipher};
use crate::error::TunnelError;
use crate::frame::FrameEvent;
use crate::idle::{Activity, DEFAULT_IDLE_TIMEOUT, SWEEP_INTERVAL};
use crate::table::ConnectionTable;
use crate::transport::DecryptingReader;
use crate::writer::{run_writer_task, TunnelWriter};
use crate::{ConnectionId, FrameCodec};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

/// Options governing one client-side tunnel dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_frame_payload: u32,
    pub idle_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_frame_payload: crate::frame::DEFAULT_MAX_PAYLOAD,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

struct ClientEntry {
    inbox: mpsc::Sender<HandlerEvent>,
    activity: Activity,
}

enum ClientCommand {
    /// A freshly-accepted local stream asking for a fresh id and a table
    /// slot. `None` on response means the id space is saturated.
    Register {
        inbox: mpsc::Sender<HandlerEvent>,
        respond: oneshot::Sender<Option<(ConnectionId, Activity)>>,
    },
    /// A handler closing locally, requesting its entry be torn down and a
    /// close-frame emitted (unless it is already gone).
    Unregister { id: ConnectionId },
}

/// Handed to every local-stream task: lets it register/unregister itself
/// with the dispatcher and submit outbound frames, without ever touching
/// the connection table directly.
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::Sender<ClientCommand>,
    writer: TunnelWriter,
    max_frame_payload: u32,
}

impl ClientHandle {
    pub fn writer(&self) -> &TunnelWriter {
        &self.writer
    }

    pub fn max_frame_payload(&self) -> u32 {
        self.max_frame_payload
    }

    /// Allocate an id and bind `inbox` as this stream's handler slot.
    pub async fn register(
        &self,
        inbox: mpsc::Sender<HandlerEvent>,
    ) -> Option<(ConnectionId, Activity)> {
        let (respond, response) = oneshot::channel();
        self.commands
            .send(ClientCommand::Register { inbox, respond })
            .await
            .ok()?;
        response.await.ok().flatten()
    }

    pub async fn unregister(&self, id: ConnectionId) {
        let _ = self.commands.send(ClientCommand::Unregister { id }).await;
    }
}

/// Spawns the writer task and the dispatcher's read/command/idle-sweep
/// loop, returning a [`ClientHandle`] immediately and a join handle the
/// caller can await for the dispatcher's eventual exit (tunnel loss).
///
/// Generic over the tunnel transport rather than tied to `TcpStream` so
/// tests can wire two dispatchers together over an in-memory
/// `tokio::io::duplex` pair instead of a real socket.
pub async fn run_dispatcher<T>(
    tunnel: T,
    config: DispatcherConfig,
    read_cipher: Option<Box<dyn TunnelCipher>>,
    write_cipher: Option<Box<dyn TunnelCipher>>,
) -> (ClientHandle, tokio::task::JoinHandle<TunnelError>)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(tunnel);
    let (outbound_tx, outbound_rx) = mpsc::channel::<(ConnectionId, bytes::Bytes)>(1024);
    let (command_tx, command_rx) = mpsc::channel(256);

    let writer = TunnelWriter::new(outbound_tx);
    let handle = ClientHandle {
        commands: command_tx,
        writer: writer.clone(),
        max_frame_payload: config.max_frame_payload,
    };

    tokio::spawn(run_writer_task(
        write_half,
        outbound_rx,
        write_cipher.unwrap_or_else(|| Box::new(NullCipher)),
    ));

    let join = tokio::spawn(dispatch_loop(
        read_half,
        read_cipher.unwrap_or_else(|| Box::new(NullCipher)),
        command_rx,
        writer,
        config,
    ));

    (handle, join)
}

async fn dispatch_loop<T>(
    mut read_half: ReadHalf<T>,
    mut read_cipher: Box<dyn TunnelCipher>,
    mut commands: mpsc::Receiver<ClientCommand>,
    writer: TunnelWriter,
    config: DispatcherConfig,
) -> TunnelError
where
    T: AsyncRead + Send + Unpin + 'static,
{
    let mut table: ConnectionTable<ClientEntry> = ConnectionTable::with_allocation();
    if let Err(err) = crate::transport::consume_read_preamble(read_cipher.as_mut(), &mut read_half).await {
        return TunnelError::Io(err);
    }
    let reader = DecryptingReader::new(read_half, read_cipher);
    let mut frames = FramedRead::new(reader, FrameCodec::new(config.max_frame_payload));
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);

    let fatal = loop {
        tokio::select! {
            frame = tokio_stream_next(&mut frames) => {
                match frame {
                    Some(Ok(event)) => handle_frame_event(&mut table, event).await,
                    Some(Err(err)) => break err,
                    None => break TunnelError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "tunnel closed by peer",
                    )),
                }
            }
            Some(command) = commands.recv() => {
                handle_command(&mut table, &writer, command).await;
            }
            _ = sweep.tick() => {
                sweep_idle(&mut table, &writer, config.idle_timeout).await;
            }
        }
    };

    if fatal.is_fatal_to_tunnel() {
        error!(error = %fatal, "client tunnel dispatcher exiting on a protocol fault, draining table");
    } else {
        warn!(error = %fatal, "client tunnel dispatcher exiting, draining table");
    }
    for (_, entry) in table.drain() {
        let _ = entry.inbox.send(HandlerEvent::Close).await;
    }
    fatal
}

/// Thin wrapper so `tokio::select!` can poll `FramedRead::next()` without
/// pulling in `futures::StreamExt` just for this one call site.
async fn tokio_stream_next<T>(
    frames: &mut FramedRead<DecryptingReader<ReadHalf<T>>, FrameCodec>,
) -> Option<Result<FrameEvent, TunnelError>>
where
    T: AsyncRead + Send + Unpin + 'static,
{
    use tokio_stream::StreamExt;
    frames.next().await
}

async fn handle_frame_event(table: &mut ConnectionTable<ClientEntry>, event: FrameEvent) {
    let id = event.connection_id();
    match event {
        FrameEvent::Data { payload, .. } => {
            let Some(entry) = table.lookup(id) else {
                debug!(connection_id = id, "data frame for unknown id, ignoring");
                return;
            };
            entry.activity.touch();
            if entry.inbox.send(HandlerEvent::Data(payload)).await.is_err() {
                table.unregister(id);
            }
        }
        FrameEvent::Close { .. } => {
            if let Some(entry) = table.unregister(id) {
                let _ = entry.inbox.send(HandlerEvent::Close).await;
            }
        }
    }
}

async fn handle_command(
    table: &mut ConnectionTable<ClientEntry>,
    writer: &TunnelWriter,
    command: ClientCommand,
) {
    match command {
        ClientCommand::Register { inbox, respond } => {
            let Some(id) = table.allocate() else {
                let _ = respond.send(None);
                return;
            };
            let activity = Activity::new();
            let bound = table.bind(
                id,
                ClientEntry {
                    inbox,
                    activity: activity.clone(),
                },
            );
            assert!(bound, "allocate() must never return an id already bound");
            let _ = respond.send(Some((id, activity)));
        }
        ClientCommand::Unregister { id } => {
            if table.unregister(id).is_some() {
                let _ = writer.send_close(id).await;
            }
        }
    }
}

async fn sweep_idle(
    table: &mut ConnectionTable<ClientEntry>,
    writer: &TunnelWriter,
    idle_timeout: Duration,
) {
    let expired: Vec<ConnectionId> = table
        .ids()
        .filter(|id| {
            table
                .lookup(*id)
                .map(|entry| entry.activity.is_idle(idle_timeout))
                .unwrap_or(false)
        })
        .collect();
    for id in expired {
        if let Some(entry) = table.unregister(id) {
            info!(connection_id = id, "idle timeout, closing handler");
            let _ = entry.inbox.send(HandlerEvent::Close).await;
            let _ = writer.send_close(id).await;
        }
    }
}
