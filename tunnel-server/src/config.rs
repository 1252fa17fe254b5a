use anyhow::{bail, Result};
use clap::Parser;
use std::time::Duration;
use tunnel_core::{DEFAULT_MAX_PAYLOAD, HARD_MAX_PAYLOAD};

/// Accepts the tunnel connection from one `tunnel-client` and dials
/// upstream targets on its behalf.
#[derive(Debug, Parser)]
#[command(name = "tunnel-server", version, about)]
pub struct Config {
    /// Host the tunnel listener binds to.
    #[arg(long, env = "TUNNEL_SERVER_HOST", default_value = "0.0.0.0")]
    pub server_host: String,

    /// Port the tunnel listener binds to.
    #[arg(long, env = "TUNNEL_SERVER_PORT")]
    pub server_port: u16,

    /// Seconds of inactivity before a stream is closed and its id forgotten.
    #[arg(long, env = "TUNNEL_IDLE_TIMEOUT_SECONDS", default_value_t = 60)]
    pub idle_timeout_seconds: u64,

    /// Largest payload carried by one frame, in bytes.
    #[arg(long, env = "TUNNEL_MAX_FRAME_PAYLOAD", default_value_t = DEFAULT_MAX_PAYLOAD)]
    pub max_frame_payload: u32,

    /// Shared passphrase enabling the optional AES-256-CTR layer. Must
    /// match the client's `--cipher-key` exactly.
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

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}
