//! Client side: accepts local SOCKS5 sessions, multiplexes them over one
//! tunnel connection, and tears them down on local close, peer close-frame,
//! or idle timeout.

mod dispatcher;
mod local;

pub use dispatcher::{run_dispatcher, ClientHandle, DispatcherConfig};
pub use local::serve_local_listener;

use bytes::Bytes;

/// Delivered from the dispatcher to a local stream's handler task.
#[derive(Debug, Clone)]
pub(crate) enum HandlerEvent {
    Data(Bytes),
    Close,
}
