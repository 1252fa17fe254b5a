//! The multiplexing engine shared by the tunnel client and server: the
//! framed per-connection stream protocol, the connection-id table, the
//! SOCKS5 handshake, and the lifecycle rules that keep both sides'
//! tables consistent under partial failure.

pub mod cipher;
pub mod client;
pub mod error;
pub mod frame;
pub mod idle;
pub mod server;
pub mod socks5;
pub mod table;
pub mod transport;
pub mod writer;

/// Chosen at the client when a local SOCKS5 session first produces a
/// frame; reuse is permitted only after explicit unregister.
pub type ConnectionId = u32;

pub use error::{Socks5Error, TunnelError};
pub use frame::{FrameCodec, FrameEvent, DEFAULT_MAX_PAYLOAD, HARD_MAX_PAYLOAD};
pub use idle::{Activity, DEFAULT_IDLE_TIMEOUT, SWEEP_INTERVAL};
pub use writer::TunnelWriter;
