//! The tunnel wire format: an 8-byte big-endian header
//! `(connection_id: u32, payload_len: u32)` followed by `payload_len` bytes.
//! `payload_len == 0` is the close signal for `connection_id`.
//!
//! `FrameCodec` implements [`tokio_util::codec::Decoder`] /
//! [`tokio_util::codec::Encoder`] so it can be driven through
//! [`tokio_util::codec::Framed`] over the tunnel socket.

use crate::error::TunnelError;
use crate::ConnectionId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const HEADER_LEN: usize = 8;

/// Default recommended cap on a single frame's payload.
pub const DEFAULT_MAX_PAYLOAD: u32 = 16_383;

/// Hard upper bound no configuration may exceed.
pub const HARD_MAX_PAYLOAD: u32 = 8 * 1024 * 1024;

/// One decoded unit handed to the dispatcher: either a payload chunk for
/// `connection_id`, or its close signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    Data {
        connection_id: ConnectionId,
        payload: Bytes,
    },
    Close {
        connection_id: ConnectionId,
    },
}

impl FrameEvent {
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            FrameEvent::Data { connection_id, .. } => *connection_id,
            FrameEvent::Close { connection_id } => *connection_id,
        }
    }
}

/// Stateless to encode, stateful (owns the reassembly buffer) to decode.
/// One instance per tunnel socket, shared by the single dispatcher reader.
pub struct FrameCodec {
    max_payload: u32,
}

impl FrameCodec {
    pub fn new(max_payload: u32) -> Self {
        assert!(
            max_payload <= HARD_MAX_PAYLOAD,
            "max_payload may not exceed the hard cap of {HARD_MAX_PAYLOAD}"
        );
        Self { max_payload }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

/// Encode `(id, payload)` as header ‖ payload. A `payload.len() == 0` call
/// encodes the close-frame for `id`.
pub fn encode(id: ConnectionId, payload: &[u8], out: &mut BytesMut) {
    out.reserve(HEADER_LEN + payload.len());
    out.put_u32(id);
    out.put_u32(payload.len() as u32);
    out.extend_from_slice(payload);
}

impl Encoder<(ConnectionId, Bytes)> for FrameCodec {
    type Error = TunnelError;

    fn encode(&mut self, item: (ConnectionId, Bytes), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (id, payload) = item;
        if payload.len() as u32 > self.max_payload {
            return Err(TunnelError::FrameTooLarge {
                len: payload.len() as u32,
                max: self.max_payload,
            });
        }
        encode(id, &payload, dst);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = FrameEvent;
    type Error = TunnelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let connection_id = u32::from_be_bytes(src[0..4].try_into().unwrap());
        let payload_len = u32::from_be_bytes(src[4..8].try_into().unwrap());

        if payload_len > self.max_payload {
            return Err(TunnelError::FrameTooLarge {
                len: payload_len,
                max: self.max_payload,
            });
        }

        let total = HEADER_LEN + payload_len as usize;
        if src.len() < total {
            // Not enough buffered yet; reserve so the next read can land the
            // rest of the frame in one go.
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        if payload_len == 0 {
            return Ok(Some(FrameEvent::Close { connection_id }));
        }
        let payload = src.split_to(payload_len as usize).freeze();
        Ok(Some(FrameEvent::Data {
            connection_id,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_frame(id: u32, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        encode(id, payload, &mut buf);
        buf
    }

    #[test]
    fn decodes_a_single_whole_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = encode_frame(42, b"hello");
        let event = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            event,
            FrameEvent::Data {
                connection_id: 42,
                payload: Bytes::from_static(b"hello"),
            }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn zero_length_payload_is_a_close_event() {
        let mut codec = FrameCodec::default();
        let mut buf = encode_frame(7, b"");
        let event = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(event, FrameEvent::Close { connection_id: 7 });
    }

    #[test]
    fn stops_and_waits_on_a_partial_header() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"\x00\x00\x00"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn stops_and_waits_on_a_partial_payload() {
        let mut codec = FrameCodec::default();
        let mut buf = encode_frame(1, b"hello world");
        let mut partial = buf.split_to(buf.len() - 3);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
    }

    #[test]
    fn rejects_oversized_frames() {
        let mut codec = FrameCodec::new(4);
        let mut buf = encode_frame(1, b"toolong");
        assert!(matches!(
            codec.decode(&mut buf),
            Err(TunnelError::FrameTooLarge { len: 7, max: 4 })
        ));
    }

    #[test]
    fn torn_frames_reassemble_identically_to_one_chunk() {
        let whole = encode_frame(9, b"abcdefghijklmnopqrstuvwxyz");
        for chunk_size in [1usize, 3, 7, 13] {
            let mut codec = FrameCodec::default();
            let mut buf = BytesMut::new();
            let mut events = Vec::new();
            for chunk in whole.chunks(chunk_size) {
                buf.extend_from_slice(chunk);
                while let Some(event) = codec.decode(&mut buf).unwrap() {
                    events.push(event);
                }
            }
            assert_eq!(
                events,
                vec![FrameEvent::Data {
                    connection_id: 9,
                    payload: Bytes::from_static(b"abcdefghijklmnopqrstuvwxyz"),
                }]
            );
        }
    }

    #[test]
    fn multiple_frames_in_one_chunk_all_decode() {
        let mut codec = FrameCodec::default();
        let mut buf = encode_frame(1, b"hello");
        buf.extend_from_slice(&encode_frame(2, b"world"));
        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            first,
            FrameEvent::Data {
                connection_id: 1,
                payload: Bytes::from_static(b"hello")
            }
        );
        assert_eq!(
            second,
            FrameEvent::Data {
                connection_id: 2,
                payload: Bytes::from_static(b"world")
            }
        );
    }
}
