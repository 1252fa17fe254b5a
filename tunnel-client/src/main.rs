mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tracing::{error, info};
use tunnel_cipher::Aes256CtrCipher;
use tunnel_core::cipher::TunnelCipher;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    init_logging(config.verbose);
    config.validate()?;

    let local_addr = lookup_host(config.local_addr())
        .await
        .with_context(|| format!("resolving local bind address {}", config.local_addr()))?
        .next()
        .with_context(|| format!("{} resolved to no addresses", config.local_addr()))?;
    let local_listener = TcpListener::bind(local_addr)
        .await
        .with_context(|| format!("binding local SOCKS5 listener on {local_addr}"))?;

    let tunnel = TcpStream::connect(config.server_addr())
        .await
        .with_context(|| format!("connecting to tunnel server at {}", config.server_addr()))?;
    info!(server = %config.server_addr(), "tunnel connected");

    let (read_cipher, write_cipher) = build_ciphers(config.cipher_key.as_deref());

    let dispatcher_config = tunnel_core::client::DispatcherConfig {
        max_frame_payload: config.max_frame_payload,
        idle_timeout: config.idle_timeout(),
    };

    let (handle, dispatcher) =
        tunnel_core::client::run_dispatcher(tunnel, dispatcher_config, read_cipher, write_cipher)
            .await;

    let listener = tokio::spawn(tunnel_core::client::serve_local_listener(
        local_listener,
        handle,
    ));
    info!(local = %local_addr, "SOCKS5 listener ready");

    tokio::select! {
        result = dispatcher => {
            match result {
                Ok(err) => error!(error = %err, "tunnel connection lost"),
                Err(join_err) => error!(error = %join_err, "tunnel dispatcher task panicked"),
            }
        }
        result = listener => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(error = %err, "local SOCKS5 listener stopped"),
                Err(join_err) => error!(error = %join_err, "local listener task panicked"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
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
        .unwrap_or_else(|_| EnvFilter::new(format!("tunnel_client={default_level},tunnel_core={default_level}")));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
