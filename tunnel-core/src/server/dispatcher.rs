use super::dialer::{self, DialOutcome};
use super::relay::run_upstream_relay;
use super::UpstreamEvent;
use crate::cipher::{NullCipher, TunnelCipher};
use crate::error::TunnelError;
use crate::frame::FrameEvent;
use crate::idle::{Activity, DEFAULT_IDLE_TIMEOUT, SWEEP_INTERVAL};
use crate::table::ConnectionTable;
use crate::transport::DecryptingReader;
use crate::writer::{run_writer_task, TunnelWriter};
use crate::{ConnectionId, FrameCodec};
use bytes::Bytes;
use std::collections::HashSet;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

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

struct ServerEntry {
    inbox: mpsc::Sender<UpstreamEvent>,
    activity: Activity,
}

pub(crate) enum ServerCommand {
    /// A dial task finished; `inbox`/`activity` are `Some` only when the
    /// dial succeeded and a relay task is already running against them.
    DialComplete {
        id: ConnectionId,
        bind: Option<(mpsc::Sender<UpstreamEvent>, Activity)>,
    },
    Unregister {
        id: ConnectionId,
    },
}

/// Handed to each dial/relay task so it can submit outbound frames and ask
/// the dispatcher to bind or remove its table entry, without touching the
/// table directly.
#[derive(Clone)]
pub(crate) struct ServerHandle {
    commands: mpsc::Sender<ServerCommand>,
    writer: TunnelWriter,
}

impl ServerHandle {
    pub(crate) fn writer(&self) -> &TunnelWriter {
        &self.writer
    }

    pub(crate) async fn unregister(&self, id: ConnectionId) {
        let _ = self.commands.send(ServerCommand::Unregister { id }).await;
    }

    async fn dial_complete(&self, id: ConnectionId, bind: Option<(mpsc::Sender<UpstreamEvent>, Activity)>) {
        let _ = self.commands.send(ServerCommand::DialComplete { id, bind }).await;
    }
}

/// Spawns the writer task and the dispatcher's read/command/idle-sweep
/// loop for one accepted tunnel connection.
///
/// Generic over the tunnel transport rather than tied to `TcpStream` so
/// tests can wire two dispatchers together over an in-memory
/// `tokio::io::duplex` pair instead of a real socket.
pub async fn run_dispatcher<T>(
    tunnel: T,
    config: DispatcherConfig,
    read_cipher: Option<Box<dyn TunnelCipher>>,
    write_cipher: Option<Box<dyn TunnelCipher>>,
) -> tokio::task::JoinHandle<TunnelError>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(tunnel);
    let (outbound_tx, outbound_rx) = mpsc::channel::<(ConnectionId, Bytes)>(1024);
    let (command_tx, command_rx) = mpsc::channel(256);

    let writer = TunnelWriter::new(outbound_tx);
    let handle = ServerHandle {
        commands: command_tx,
        writer: writer.clone(),
    };

    tokio::spawn(run_writer_task(
        write_half,
        outbound_rx,
        write_cipher.unwrap_or_else(|| Box::new(NullCipher)),
    ));

    tokio::spawn(dispatch_loop(
        read_half,
        read_cipher.unwrap_or_else(|| Box::new(NullCipher)),
        command_rx,
        handle,
        config,
    ))
}

async fn dispatch_loop<T>(
    mut read_half: ReadHalf<T>,
    mut read_cipher: Box<dyn TunnelCipher>,
    mut commands: mpsc::Receiver<ServerCommand>,
    handle: ServerHandle,
    config: DispatcherConfig,
) -> TunnelError
where
    T: AsyncRead + Send + Unpin + 'static,
{
    let mut table: ConnectionTable<ServerEntry> = ConnectionTable::without_allocation();
    let mut pending: HashSet<ConnectionId> = HashSet::new();
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
                    Some(Ok(event)) => {
                        handle_frame_event(&mut table, &mut pending, &handle, config.max_frame_payload, event).await;
                    }
                    Some(Err(err)) => break err,
                    None => break TunnelError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "tunnel closed by peer",
                    )),
                }
            }
            Some(command) = commands.recv() => {
                handle_command(&mut table, &mut pending, &handle, command).await;
            }
            _ = sweep.tick() => {
                sweep_idle(&mut table, &handle, config.idle_timeout).await;
            }
        }
    };

    if fatal.is_fatal_to_tunnel() {
        error!(error = %fatal, "server tunnel dispatcher exiting on a protocol fault, draining table");
    } else {
        warn!(error = %fatal, "server tunnel dispatcher exiting, draining table");
    }
    for (_, entry) in table.drain() {
        let _ = entry.inbox.send(UpstreamEvent::Close).await;
    }
    fatal
}

async fn tokio_stream_next<T>(
    frames: &mut FramedRead<DecryptingReader<ReadHalf<T>>, FrameCodec>,
) -> Option<Result<FrameEvent, TunnelError>>
where
    T: AsyncRead + Send + Unpin + 'static,
{
    use tokio_stream::StreamExt;
    frames.next().await
}

async fn handle_frame_event(
    table: &mut ConnectionTable<ServerEntry>,
    pending: &mut HashSet<ConnectionId>,
    handle: &ServerHandle,
    max_payload: u32,
    event: FrameEvent,
) {
    let id = event.connection_id();
    match event {
        FrameEvent::Data { payload, .. } => {
            if let Some(entry) = table.lookup(id) {
                entry.activity.touch();
                if entry.inbox.send(UpstreamEvent::Data(payload)).await.is_err() {
                    table.unregister(id);
                }
                return;
            }
            if pending.contains(&id) {
                // A second frame for an id whose dial is still in flight is
                // logged and otherwise ignored, not an error.
                debug!(connection_id = id, "data frame for id with dial in flight, ignoring");
                return;
            }
            pending.insert(id);
            spawn_dial(id, payload, handle.clone(), max_payload);
        }
        FrameEvent::Close { .. } => {
            // Unknown (including still-pending) ids are ignored: the close
            // may have crossed an upstream close or a dial in flight.
            if let Some(entry) = table.unregister(id) {
                let _ = entry.inbox.send(UpstreamEvent::Close).await;
            }
        }
    }
}

fn spawn_dial(id: ConnectionId, payload: Bytes, handle: ServerHandle, max_payload: u32) {
    tokio::spawn(async move {
        let outcome = dialer::dial(id, &payload).await;
        let reply = dialer::reply_for(&outcome);
        let _ = handle.writer().send_data(id, Bytes::from(reply)).await;

        match outcome {
            DialOutcome::Connected(stream) => {
                info!(connection_id = id, "upstream connected");
                let (inbox_tx, inbox_rx) = mpsc::channel(64);
                let activity = Activity::new();
                handle.dial_complete(id, Some((inbox_tx, activity.clone()))).await;
                run_upstream_relay(id, stream, inbox_rx, handle, activity, max_payload as usize).await;
            }
            DialOutcome::Rejected => {
                handle.dial_complete(id, None).await;
            }
        }
    });
}

async fn handle_command(
    table: &mut ConnectionTable<ServerEntry>,
    pending: &mut HashSet<ConnectionId>,
    handle: &ServerHandle,
    command: ServerCommand,
) {
    match command {
        ServerCommand::DialComplete { id, bind } => {
            pending.remove(&id);
            if let Some((inbox, activity)) = bind {
                let bound = table.bind(id, ServerEntry { inbox, activity });
                assert!(bound, "dial completed for an id already present in the table");
            }
        }
        ServerCommand::Unregister { id } => {
            if table.unregister(id).is_some() {
                let _ = handle.writer().send_close(id).await;
            }
        }
    }
}

async fn sweep_idle(table: &mut ConnectionTable<ServerEntry>, handle: &ServerHandle, idle_timeout: Duration) {
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
            info!(connection_id = id, "idle timeout, closing upstream");
            let _ = entry.inbox.send(UpstreamEvent::Close).await;
            let _ = handle.writer().send_close(id).await;
        }
    }
}
