use anyhow::{bail, Result};
use clap::Parser;
use std::time::Duration;
use tunnel_core::{DEFAULT_MAX_PAYLOAD, HARD_MAX_PAYLOAD};

/// Local SOCKS5 endpoint that multiplexes every accepted session over a
/// single connection to a `tunnel-server`.
#[derive(Debug, Parser)]
#[command(name = "tunnel-client", version, about)]
pub struct Config {
    /// Host of the remote tunnel-server.
    #[arg(long, env = "TUNNEL_SERVER_HOST", default_value = "127.0.0.1")]
    pub server_host: String,

    /// Port of the remote tunnel-server.
    #[arg(long, env = "TUNNEL_SERVER_PORT")]
    pub server_port: u16,

    /// Host the local SOCKS5 listener binds to.
    #[arg(long, env = "TUNNEL_LOCAL_HOST", default_value = "127.0.0.1")]
    pub local_host: String,

    /// Port the local SOCKS5 listener binds to.
    #[arg(long, env = "TUNNEL_LOCAL_PORT")]
    pub local_port: u16,

    /// Seconds of inactivity before a stream is closed and its id freed.
    #[arg(long, env = "TUNNEL_IDLE_TIMEOUT_SECONDS", default_value_t = 60)]
    pub idle_timeout_seconds: u64,

    /// Largest payload carried by one frame, in bytes.
    #[arg(long, env = "TUNNEL_MAX_FRAME_PAYLOAD", default_value_t = DEFAULT_MAX_PAYLOAD)]
    pub max_frame_payload: u32,

    /// Shared passphrase enabling the optional AES-256-CTR layer. Unset
    /// means the tunnel carries frames in the clear.
    #[arg(long, env = "TUNNEL_CIPHER_KEY")]
    pub cipher_key: Option<String>,

    /// Increase log verbosity; repeatable (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Config {
    /// Rejects configuration that would otherwise panic deep inside
    /// [`tunnel_core::FrameCodec`]. Call before wiring up the dispatcher.
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_payload > HARD_MAX_PAYLOAD {
            bail!(
                "--max-frame-payload {} exceeds the hard cap of {HARD_MAX_PAYLOAD} bytes",
                self.max_frame_payload
            );
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}
