//! Wires an optional [`crate::cipher::TunnelCipher`] transparently around a
//! raw tunnel socket half, so the frame codec above it only ever sees
//! plaintext bytes.

use crate::cipher::TunnelCipher;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Reads and consumes this cipher's read-direction preamble (e.g. a peer-
/// chosen IV), if it has one. Must be called exactly once, before the
/// first frame is decoded off `reader`.
pub async fn consume_read_preamble<R: AsyncRead + Unpin>(
    cipher: &mut dyn TunnelCipher,
    reader: &mut R,
) -> std::io::Result<()> {
    let len = cipher.read_preamble_len();
    if len == 0 {
        return Ok(());
    }
    let mut preamble = vec![0u8; len];
    reader.read_exact(&mut preamble).await?;
    cipher.consume_preamble(&preamble);
    Ok(())
}

/// Writes this cipher's write-direction preamble, if it has one. Must be
/// called exactly once, before the first frame is encoded onto `writer`.
pub async fn write_write_preamble<W: AsyncWrite + Unpin>(
    cipher: &mut dyn TunnelCipher,
    writer: &mut W,
) -> std::io::Result<()> {
    if let Some(preamble) = cipher.write_preamble() {
        writer.write_all(&preamble).await?;
    }
    Ok(())
}

/// Wraps an `AsyncRead` half of the tunnel socket, decrypting each chunk in
/// place as it comes off the wire, before the frame decoder ever sees it.
pub struct DecryptingReader<R> {
    inner: R,
    cipher: Box<dyn TunnelCipher>,
}

impl<R> DecryptingReader<R> {
    pub fn new(inner: R, cipher: Box<dyn TunnelCipher>) -> Self {
        Self { inner, cipher }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DecryptingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.cipher.decrypt(&mut buf.filled_mut()[before..]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Encrypt an outbound frame's bytes in place before handing them to the
/// socket write half. Kept as a free function rather than a wrapping
/// `AsyncWrite` type since every write already goes through one place: the
/// single writer task's `write_all` call.
pub fn encrypt_in_place(cipher: &mut dyn TunnelCipher, buf: &mut [u8]) {
    cipher.encrypt(buf);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::NullCipher;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn null_cipher_reader_passes_bytes_through() {
        let data = b"hello world".to_vec();
        let mut reader = DecryptingReader::new(&data[..], Box::new(NullCipher));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }
}
