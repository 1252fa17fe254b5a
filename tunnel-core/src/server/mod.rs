//! Server side: demultiplexes frames off the tunnel, dials the upstream
//! target named by the first frame for a new id, and relays bytes between
//! the tunnel and each upstream socket.

mod dialer;
mod dispatcher;
mod relay;

pub use dispatcher::{run_dispatcher, DispatcherConfig};

use bytes::Bytes;

/// Delivered from the dispatcher to an upstream relay task.
#[derive(Debug, Clone)]
pub(crate) enum UpstreamEvent {
    Data(Bytes),
    Close,
}
