//! Resolves and dials the destination named by a SOCKS5 `CONNECT` request
//! carried in the first frame for a new id.

use crate::socks5::{self, Address, Reply, CMD_CONNECT};
use crate::ConnectionId;
use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

/// The outcome of dialing one new logical stream.
pub(crate) enum DialOutcome {
    Connected(TcpStream),
    Rejected,
}

/// Parses `payload` as a `CONNECT` request and attempts to open a TCP
/// connection to its destination. Never returns an `Err`: every failure
/// mode (malformed payload, unsupported command, dial failure) maps to
/// `DialOutcome::Rejected`, which the caller turns into a `REP=0x04` reply
/// — dial failures are surfaced as ordinary frames, never as a fatal
/// tunnel error.
pub(crate) async fn dial(connection_id: ConnectionId, payload: &[u8]) -> DialOutcome {
    if payload.len() < 5 {
        // A payload this short before the handshake can complete is
        // logged and dropped, not treated as a protocol violation — the
        // client and server may have raced a close past each other.
        debug!(connection_id, "payload too short for a CONNECT request");
        return DialOutcome::Rejected;
    }

    let request = match socks5::parse_request(payload) {
        Ok(request) => request,
        Err(err) => {
            debug!(connection_id, error = %err, "malformed CONNECT request");
            return DialOutcome::Rejected;
        }
    };

    if request.cmd != CMD_CONNECT {
        debug!(connection_id, cmd = request.cmd, "unsupported command from client");
        return DialOutcome::Rejected;
    }

    match connect(&request.address, request.port).await {
        Ok(stream) => DialOutcome::Connected(stream),
        Err(err) => {
            debug!(connection_id, error = %err, "upstream dial failed");
            DialOutcome::Rejected
        }
    }
}

async fn connect(address: &Address, port: u16) -> std::io::Result<TcpStream> {
    match address {
        Address::Ipv4(ip) => TcpStream::connect((*ip, port)).await,
        Address::Ipv6(ip) => TcpStream::connect((*ip, port)).await,
        Address::Domain(name) => {
            let mut addrs = lookup_host((name.as_str(), port)).await?;
            let addr = addrs.next().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "domain resolved to no addresses")
            })?;
            TcpStream::connect(addr).await
        }
    }
}

pub(crate) fn reply_for(outcome: &DialOutcome) -> Vec<u8> {
    match outcome {
        DialOutcome::Connected(_) => socks5::fixed_reply(Reply::Succeeded),
        DialOutcome::Rejected => socks5::fixed_reply(Reply::HostUnreachable),
    }
}
