mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use tokio::net::TcpListener;
use tracing::{error, info};
use tunnel_cipher::Aes256CtrCipher;
use tunnel_core::cipher::TunnelCipher;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    init_logging(config.verbose);
    config.validate()?;

    let listener = TcpListener::bind(config.server_addr())
        .await
        .with_context(|| format!("binding tunnel listener on {}", config.server_addr()))?;
    info!(addr = %config.server_addr(), "tunnel listener ready");

    loop {
        let (tunnel, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    error!(error = %err, "failed to accept tunnel connection");
                    continue;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                return Ok(());
            }
        };
        info!(peer = %peer, "tunnel connection accepted");

        let dispatcher_config = tunnel_core::server::DispatcherConfig {
            max_frame_payload: config.max_frame_payload,
            idle_timeout: config.idle_timeout(),
        };
        let (read_cipher, write_cipher) = build_ciphers(config.cipher_key.as_deref());

        let dispatcher =
            tunnel_core::server::run_dispatcher(tunnel, dispatcher_config, read_cipher, write_cipher)
                .await;

        tokio::spawn(async move {
            match dispatcher.await {
                Ok(err) => error!(peer = %peer, error = %err, "tunnel connection lost"),
                Err(join_err) => error!(peer = %peer, error = %join_err, "tunnel dispatcher task panicked"),
            }
        });
    }
}

fn build_ciphers(
    cipher_key: Option<&str>,
) -> (Option<Box<dyn TunnelCipher>>, Option<Box<dyn TunnelCipher>>) {
    match cipher_key {
        Some(passphrase) => {
            let key = Aes256CtrCipher::derive_key(passphrase.as_bytes());
            (
                Some(Box::new(Aes256CtrCipher::new(key)) as Box<dyn TunnelCipher>),
                Some(Box::new(Aes256CtrCipher::new(key)) as Box<dyn TunnelCipher>),
            )
        }
        None => (None, None),
    }
}

fn init_logging(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tunnel_server={default_level},tunnel_core={default_level}")));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
