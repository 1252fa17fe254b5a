/// Everything that can go wrong reading the tunnel socket. Returned by a
/// dispatcher's read loop (see [`crate::client`] and [`crate::server`]) to
/// end it and drain the connection table.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame payload too large: {len} bytes (max {max})")]
    FrameTooLarge { len: u32, max: u32 },

    #[error("socks5 error: {0}")]
    Socks5(#[from] Socks5Error),
}

impl TunnelError {
    /// Whether this error indicates the wire format itself is compromised
    /// (oversized frame) rather than an ordinary transport failure (peer
    /// hung up, socket reset). Both still end the dispatcher loop — there is
    /// only one tunnel socket — but this governs how loudly it's logged.
    pub fn is_fatal_to_tunnel(&self) -> bool {
        matches!(self, TunnelError::FrameTooLarge { .. })
    }
}

/// SOCKS5 parsing/validation failures, scoped to a single local stream.
#[derive(Debug, thiserror::Error)]
pub enum Socks5Error {
    #[error("unexpected greeting, expected VER=5 METHODS=[NO_AUTH]")]
    BadGreeting,

    #[error("unsupported address type {0}")]
    UnsupportedAddressType(u8),

    #[error("malformed request: {0}")]
    Malformed(&'static str),
}
