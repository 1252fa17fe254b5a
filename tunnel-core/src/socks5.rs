//! RFC 1928 SOCKS5 wire types, parsed from and serialized to plain byte
//! slices rather than read directly off a socket: the bytes travel inside
//! tunnel frames (see [`crate::frame`]), so there is no stream to read from
//! directly on the server side.

use crate::error::Socks5Error;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// The reply code carried in `REP` of a SOCKS5 response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    HostUnreachable = 0x04,
    CommandNotSupported = 0x07,
}

/// `DST.ADDR` / `BND.ADDR`, in whichever of the three RFC 1928 shapes the
/// wire used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl Address {
    pub fn unspecified() -> Self {
        Address::Ipv4(Ipv4Addr::UNSPECIFIED)
    }
}

/// `VER CMD RSV ATYP DST.ADDR DST.PORT`, the request a local SOCKS5 client
/// sends after the greeting. Only `CMD_CONNECT` is acted on; `BIND`/
/// `ASSOCIATE` are recognized only so the client side can reject them
/// cleanly instead of forwarding garbage to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub cmd: u8,
    pub address: Address,
    pub port: u16,
}

/// Parse a greeting (`VER NMETHODS METHODS...`). Returns the chosen method
/// byte to reply with: `METHOD_NO_AUTH` if the client offered it,
/// `METHOD_NO_ACCEPTABLE` otherwise.
pub fn parse_greeting(buf: &[u8]) -> Result<u8, Socks5Error> {
    if buf.len() < 2 {
        return Err(Socks5Error::BadGreeting);
    }
    let ver = buf[0];
    let nmethods = buf[1] as usize;
    if ver != VERSION || buf.len() != 2 + nmethods {
        return Err(Socks5Error::BadGreeting);
    }
    let methods = &buf[2..];
    if methods.contains(&METHOD_NO_AUTH) {
        Ok(METHOD_NO_AUTH)
    } else {
        Ok(METHOD_NO_ACCEPTABLE)
    }
}

/// Encode the two-byte method-selection reply.
pub fn encode_method_selection(method: u8) -> [u8; 2] {
    [VERSION, method]
}

/// Parse a full `CONNECT` request payload: `VER CMD RSV ATYP DST.ADDR
/// DST.PORT`. This is the exact byte layout forwarded verbatim by the
/// client inside a data frame and re-parsed here by the server.
pub fn parse_request(buf: &[u8]) -> Result<Request, Socks5Error> {
    if buf.len() < 4 {
        return Err(Socks5Error::Malformed("request shorter than fixed header"));
    }
    let ver = buf[0];
    let cmd = buf[1];
    let rsv = buf[2];
    let atyp = buf[3];
    if ver != VERSION {
        return Err(Socks5Error::Malformed("bad VER in request"));
    }
    if rsv != 0x00 {
        return Err(Socks5Error::Malformed("RSV must be 0"));
    }

    let rest = &buf[4..];
    let (address, rest) = match atyp {
        ATYP_IPV4 => {
            if rest.len() < 4 {
                return Err(Socks5Error::Malformed("truncated IPv4 address"));
            }
            let octets: [u8; 4] = rest[..4].try_into().unwrap();
            (Address::Ipv4(Ipv4Addr::from(octets)), &rest[4..])
        }
        ATYP_IPV6 => {
            if rest.len() < 16 {
                return Err(Socks5Error::Malformed("truncated IPv6 address"));
            }
            let octets: [u8; 16] = rest[..16].try_into().unwrap();
            (Address::Ipv6(Ipv6Addr::from(octets)), &rest[16..])
        }
        ATYP_DOMAIN => {
            if rest.is_empty() {
                return Err(Socks5Error::Malformed("missing domain length byte"));
            }
            let len = rest[0] as usize;
            let rest = &rest[1..];
            if rest.len() < len {
                return Err(Socks5Error::Malformed("domain length does not match payload"));
            }
            let domain = std::str::from_utf8(&rest[..len])
                .map_err(|_| Socks5Error::Malformed("domain is not valid utf-8"))?
                .to_owned();
            (Address::Domain(domain), &rest[len..])
        }
        other => return Err(Socks5Error::UnsupportedAddressType(other)),
    };

    if rest.len() != 2 {
        return Err(Socks5Error::Malformed("trailing bytes after DST.PORT"));
    }
    let port = u16::from_be_bytes([rest[0], rest[1]]);

    Ok(Request { cmd, address, port })
}

/// Encode a reply: `VER REP RSV ATYP BND.ADDR BND.PORT`. Always 10 bytes
/// when `addr` is `Address::unspecified()` (`0.0.0.0:0`, `ATYP=1`).
pub fn encode_reply(reply: Reply, addr: &Address, port: u16) -> Vec<u8> {
    let mut out = vec![VERSION, reply as u8, 0x00];
    match addr {
        Address::Ipv4(v4) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&v4.octets());
        }
        Address::Ipv6(v6) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&v6.octets());
        }
        Address::Domain(name) => {
            out.push(ATYP_DOMAIN);
            out.push(name.len() as u8);
            out.extend_from_slice(name.as_bytes());
        }
    }
    out.extend_from_slice(&port.to_be_bytes());
    out
}

/// A fixed reply with `BND.ADDR=0.0.0.0`, `BND.PORT=0`, the only shape this
/// system ever emits.
pub fn fixed_reply(reply: Reply) -> Vec<u8> {
    encode_reply(reply, &Address::unspecified(), 0)
}

impl Address {
    /// Resolve to something `TcpStream::connect` (or `lookup_host`) accepts.
    pub fn as_host_port(&self, port: u16) -> (String, u16) {
        match self {
            Address::Ipv4(v4) => (v4.to_string(), port),
            Address::Ipv6(v6) => (v6.to_string(), port),
            Address::Domain(name) => (name.clone(), port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(v4) => Address::Ipv4(v4),
            IpAddr::V6(v6) => Address::Ipv6(v6),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_accepts_no_auth() {
        let method = parse_greeting(&[0x05, 0x01, 0x00]).unwrap();
        assert_eq!(method, METHOD_NO_AUTH);
    }

    #[test]
    fn greeting_rejects_other_versions() {
        assert!(parse_greeting(&[0x04, 0x01, 0x00]).is_err());
    }

    #[test]
    fn greeting_rejects_missing_no_auth() {
        let method = parse_greeting(&[0x05, 0x01, 0x02]).unwrap();
        assert_eq!(method, METHOD_NO_ACCEPTABLE);
    }

    #[test]
    fn request_ipv4_round_trip() {
        // 05 01 00 01 08 08 08 08 00 50 — CONNECT 8.8.8.8:80
        let buf = [0x05, 0x01, 0x00, 0x01, 8, 8, 8, 8, 0x00, 0x50];
        let req = parse_request(&buf).unwrap();
        assert_eq!(req.cmd, CMD_CONNECT);
        assert_eq!(req.address, Address::Ipv4(Ipv4Addr::new(8, 8, 8, 8)));
        assert_eq!(req.port, 80);
    }

    #[test]
    fn request_domain_round_trip() {
        // example.com:80
        let mut buf = vec![0x05, 0x01, 0x00, 0x03, 11];
        buf.extend_from_slice(b"example.com");
        buf.extend_from_slice(&80u16.to_be_bytes());
        let req = parse_request(&buf).unwrap();
        assert_eq!(req.address, Address::Domain("example.com".to_owned()));
        assert_eq!(req.port, 80);
    }

    #[test]
    fn request_rejects_domain_length_mismatch() {
        let mut buf = vec![0x05, 0x01, 0x00, 0x03, 12];
        buf.extend_from_slice(b"example.com");
        buf.extend_from_slice(&80u16.to_be_bytes());
        assert!(parse_request(&buf).is_err());
    }

    #[test]
    fn reply_is_bit_exact() {
        let reply = fixed_reply(Reply::Succeeded);
        assert_eq!(
            reply,
            vec![0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn host_unreachable_reply_is_bit_exact() {
        let reply = fixed_reply(Reply::HostUnreachable);
        assert_eq!(
            reply,
            vec![0x05, 0x04, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }
}
