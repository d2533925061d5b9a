//! Transport abstractions shared by every instrument family.
//!
//! # Types
//!
//! - [`TransportIO`]: trait alias combining `AsyncRead + AsyncWrite` for byte streams
//! - [`DynTransport`]: type-erased boxed stream
//! - [`Connector`]: opens a transport for an address (TCP in production, mock in tests)
//! - [`Framing`] / [`MessageDecoder`]: how the inbound byte stream splits into messages
//!
//! The connection owns the stream only while connected. Writes go through the
//! connection lock; reads belong to the inbound collector, which runs the
//! stream through a [`tokio_util::codec::FramedRead`] with a [`MessageDecoder`].

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Decoder;

// =============================================================================
// Stream Trait
// =============================================================================

/// Trait alias for an instrument byte stream.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send + Debug` can be used:
/// - `tokio::net::TcpStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
/// - [`crate::testing::MockTransport`]
pub trait TransportIO: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug> TransportIO for T {}

/// Type-erased boxed stream.
pub type DynTransport = Box<dyn TransportIO>;

// =============================================================================
// Connectors
// =============================================================================

/// Opens transports. One connector per connection; it may be asked to open
/// the same address again after a disconnect.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Open a stream to `address`, giving up after `timeout`.
    async fn open(&self, address: &str, timeout: Duration) -> io::Result<DynTransport>;
}

/// `host:port` TCP connector with `TCP_NODELAY` set.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&self, address: &str, timeout: Duration) -> io::Result<DynTransport> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {address} timed out after {timeout:?}"),
                )
            })??;
        stream.set_nodelay(true)?;
        tracing::debug!(address, "TCP stream opened");
        Ok(Box::new(stream))
    }
}

// =============================================================================
// Framing
// =============================================================================

/// How the inbound byte stream is split into messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// Messages end with any of the given bytes. The terminator is stripped
    /// and empty messages (e.g. the `\n` of a `\r\n` pair) are skipped.
    Delimited {
        /// Terminator bytes
        delimiters: Vec<u8>,
        /// Longest message accepted before the buffer is discarded
        max_length: usize,
    },
    /// Every message is exactly this many bytes.
    Fixed(usize),
}

impl Framing {
    /// Detector-server replies, terminated by a single 0x18 byte.
    pub fn detector_server() -> Self {
        Framing::Delimited {
            delimiters: vec![0x18],
            max_length: 64 * 1024,
        }
    }

    /// ASCII instruments terminated by CR and/or LF.
    pub fn lines() -> Self {
        Framing::Delimited {
            delimiters: vec![b'\r', b'\n'],
            max_length: 4096,
        }
    }

    /// Fixed-length binary frames.
    pub fn fixed(len: usize) -> Self {
        Framing::Fixed(len)
    }

    /// Build the decoder for this framing.
    pub fn decoder(&self) -> MessageDecoder {
        MessageDecoder {
            framing: self.clone(),
        }
    }
}

/// [`Decoder`] implementing a [`Framing`].
///
/// Never returns a decode error: an oversized message is logged and dropped
/// so a single garbled burst cannot terminate the collector.
#[derive(Debug, Clone)]
pub struct MessageDecoder {
    framing: Framing,
}

impl Decoder for MessageDecoder {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, io::Error> {
        match &self.framing {
            Framing::Fixed(len) => {
                if src.len() < *len {
                    src.reserve(*len - src.len());
                    return Ok(None);
                }
                Ok(Some(src.split_to(*len).freeze()))
            }
            Framing::Delimited {
                delimiters,
                max_length,
            } => loop {
                match src.iter().position(|b| delimiters.contains(b)) {
                    Some(pos) => {
                        let mut message = src.split_to(pos + 1);
                        message.truncate(pos);
                        if message.is_empty() {
                            continue;
                        }
                        return Ok(Some(message.freeze()));
                    }
                    None => {
                        if src.len() > *max_length {
                            tracing::warn!(
                                discarded = src.len(),
                                max_length,
                                "Inbound message exceeds maximum length, discarding"
                            );
                            src.clear();
                        }
                        return Ok(None);
                    }
                }
            },
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, io::Error> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }
        if src.is_empty() {
            return Ok(None);
        }
        match self.framing {
            Framing::Delimited { .. } => Ok(Some(src.split().freeze())),
            Framing::Fixed(_) => {
                tracing::debug!(remaining = src.len(), "Partial frame at end of stream");
                src.clear();
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::FramedRead;

    #[test]
    fn test_delimited_strips_terminator_and_skips_empty() {
        let mut decoder = Framing::lines().decoder();
        let mut buf = BytesMut::from(&b"1.0E-03\r\nOK"[..]);
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), &b"1.0E-03"[..]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"OK");
    }

    #[test]
    fn test_fixed_waits_for_full_frame() {
        let mut decoder = Framing::fixed(9).decoder();
        let mut buf = BytesMut::from(&[1u8, 2, 3, 4][..]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&[5, 6, 7, 8, 9, 10]);
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().len(), 9);
        assert_eq!(&buf[..], &[10]);
    }

    #[test]
    fn test_oversized_message_discarded() {
        let mut decoder = Framing::Delimited {
            delimiters: vec![0x18],
            max_length: 4,
        }
        .decoder();
        let mut buf = BytesMut::from(&b"0123456789"[..]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_framed_read_over_duplex() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut framed = FramedRead::new(device, Framing::detector_server().decoder());

        host.write_all(b"15 OK a\x187 OK b\x18").await.unwrap();
        drop(host);

        assert_eq!(framed.next().await.unwrap().unwrap(), &b"15 OK a"[..]);
        assert_eq!(framed.next().await.unwrap().unwrap(), &b"7 OK b"[..]);
        assert!(framed.next().await.is_none());
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let result = TcpConnector.open(&addr, Duration::from_millis(500)).await;
        assert!(result.is_err());
    }
}
