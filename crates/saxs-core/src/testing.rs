//! Mock transport for exercising connections without hardware.
//!
//! [`MockTransport`] implements `AsyncRead + AsyncWrite` and is handed to the
//! code under test (usually through a [`MockConnector`]); the paired
//! [`MockDevice`] stays in the test and scripts the instrument's side.
//!
//! The mock uses a pair of unbounded channels to simulate bidirectional
//! communication. Every `poll_write` call is recorded as one chunk, so tests
//! can inspect write boundaries.
//!
//! [`serve_modbus`] turns a [`MockDevice`] into a register-bus controller
//! backed by a shared [`ModbusImage`].
//!
//! # Example
//!
//! ```rust,ignore
//! use saxs_core::testing::MockConnector;
//!
//! let connector = MockConnector::new();
//! let mut device = connector.add_device();
//! // ... connect a Connection using `connector` ...
//! device.expect_write(b"version\n").await;
//! device.send_response(b"24 OK Code release: tvx-7.3.13\x18").unwrap();
//! ```

use crate::transport::{Connector, DynTransport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// The client-facing side of the mock.
#[derive(Debug)]
pub struct MockTransport {
    writes_tx: UnboundedSender<Vec<u8>>,
    reads_rx: UnboundedReceiver<Vec<u8>>,
    read_buffer: VecDeque<u8>,
    broken: Arc<AtomicBool>,
    chunk_size: Option<usize>,
    yield_next: bool,
}

/// The test-facing side for controlling the mock.
#[derive(Debug)]
pub struct MockDevice {
    writes_rx: UnboundedReceiver<Vec<u8>>,
    reads_tx: Option<UnboundedSender<Vec<u8>>>,
    write_buffer: Vec<u8>,
    broken: Arc<AtomicBool>,
}

/// Create a connected pair of [`MockTransport`] and [`MockDevice`].
pub fn pair() -> (MockTransport, MockDevice) {
    let (client_to_device_tx, client_to_device_rx) = mpsc::unbounded_channel();
    let (device_to_client_tx, device_to_client_rx) = mpsc::unbounded_channel();
    let broken = Arc::new(AtomicBool::new(false));

    let transport = MockTransport {
        writes_tx: client_to_device_tx,
        reads_rx: device_to_client_rx,
        read_buffer: VecDeque::new(),
        broken: broken.clone(),
        chunk_size: None,
        yield_next: false,
    };

    let device = MockDevice {
        writes_rx: client_to_device_rx,
        reads_tx: Some(device_to_client_tx),
        write_buffer: Vec::new(),
        broken,
    };

    (transport, device)
}

// =============================================================================
// MockTransport
// =============================================================================

impl MockTransport {
    /// Accept at most `size` bytes per write and yield to the scheduler
    /// between partial writes. Makes unsynchronized writers interleave.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size.max(1));
        self
    }
}

impl AsyncRead for MockTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.broken.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "mock transport reset",
            )));
        }

        if self.read_buffer.is_empty() {
            match self.reads_rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.read_buffer.extend(chunk),
                // Channel closed, which means end-of-file
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }

        let to_read = std::cmp::min(buf.remaining(), self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..to_read).collect();
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.broken.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock transport broken",
            )));
        }

        let len = match self.chunk_size {
            Some(size) => {
                if self.yield_next {
                    self.yield_next = false;
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
                self.yield_next = true;
                std::cmp::min(size, buf.len())
            }
            None => buf.len(),
        };

        match self.writes_tx.send(buf[..len].to_vec()) {
            Ok(()) => Poll::Ready(Ok(len)),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// =============================================================================
// MockDevice
// =============================================================================

impl MockDevice {
    /// Send bytes to the client as if the instrument had transmitted them.
    ///
    /// # Errors
    /// Returns error if the client side has been dropped or the device hung up.
    pub fn send_response(&self, data: &[u8]) -> Result<(), &'static str> {
        match &self.reads_tx {
            Some(tx) => tx
                .send(data.to_vec())
                .map_err(|_| "client transport disconnected"),
            None => Err("device hung up"),
        }
    }

    /// Wait for the client to write `expected` and assert it.
    ///
    /// # Panics
    /// Panics if the data does not arrive within 2 seconds or differs.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        use tokio::time::timeout;

        while self.write_buffer.len() < expected.len() {
            match timeout(Duration::from_secs(2), self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) => panic!("client transport closed while expecting a write"),
                Err(_) => panic!(
                    "timeout waiting for write. Expected {:?}, received {:?}",
                    String::from_utf8_lossy(expected),
                    String::from_utf8_lossy(&self.write_buffer)
                ),
            }
        }

        let actual = &self.write_buffer[..expected.len()];
        assert_eq!(
            actual,
            expected,
            "mismatch in expected write. Expected {:?}, got {:?}",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(actual)
        );
        self.write_buffer.drain(..expected.len());
    }

    /// Expect a write and send a response in one step.
    pub async fn expect_and_respond(&mut self, expected: &[u8], response: &[u8]) {
        self.expect_write(expected).await;
        if let Err(e) = self.send_response(response) {
            panic!("failed to send response: {e}");
        }
    }

    /// Next recorded write chunk, or `None` if nothing arrives within `wait`.
    pub async fn next_write(&mut self, wait: Duration) -> Option<Vec<u8>> {
        if !self.write_buffer.is_empty() {
            return Some(std::mem::take(&mut self.write_buffer));
        }
        tokio::time::timeout(wait, self.writes_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Collect every chunk written so far, waiting up to `settle` for stragglers.
    pub async fn drain_writes(&mut self, settle: Duration) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        if !self.write_buffer.is_empty() {
            chunks.push(std::mem::take(&mut self.write_buffer));
        }
        while let Ok(Some(chunk)) = tokio::time::timeout(settle, self.writes_rx.recv()).await {
            chunks.push(chunk);
        }
        chunks
    }

    /// Close the device's sending side. The client reads end-of-file.
    pub fn hang_up(&mut self) {
        self.reads_tx = None;
    }

    /// Make every subsequent client read and write fail with an I/O error.
    pub fn break_link(&self) {
        self.broken.store(true, Ordering::SeqCst);
        // Wake a parked reader so it observes the failure.
        if let Some(tx) = &self.reads_tx {
            let _ = tx.send(vec![0]);
        }
    }

    /// Answer every write chunk with the handler's responses until the client
    /// drops the transport. Returns all chunks received.
    pub fn serve<F>(mut self, mut handler: F) -> tokio::task::JoinHandle<Vec<Vec<u8>>>
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(chunk) = self.writes_rx.recv().await {
                for response in handler(&chunk) {
                    if self.send_response(&response).is_err() {
                        break;
                    }
                }
                seen.push(chunk);
            }
            seen
        })
    }
}

// =============================================================================
// MockConnector
// =============================================================================

/// [`Connector`] that hands out pre-registered mock transports in order.
#[derive(Debug, Default)]
pub struct MockConnector {
    pending: Mutex<VecDeque<MockTransport>>,
    refuse: AtomicBool,
    opened: AtomicUsize,
    last_address: Mutex<Option<String>>,
}

impl MockConnector {
    /// Create a connector with no devices.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device for the next `open` and return its test side.
    pub fn add_device(&self) -> MockDevice {
        let (transport, device) = pair();
        self.pending.lock().push_back(transport);
        device
    }

    /// Register a prepared transport (e.g. one built with a chunk size).
    pub fn add_transport(&self, transport: MockTransport) {
        self.pending.lock().push_back(transport);
    }

    /// Make `open` fail with `ConnectionRefused` while set.
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of successful opens.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Address passed to the latest `open`.
    pub fn last_address(&self) -> Option<String> {
        self.last_address.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, address: &str, _timeout: Duration) -> io::Result<DynTransport> {
        *self.last_address.lock() = Some(address.to_string());
        if self.refuse.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "mock connector refusing",
            ));
        }
        let transport = self.pending.lock().pop_front().ok_or_else(|| {
            io::Error::new(io::ErrorKind::ConnectionRefused, "no mock device registered")
        })?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(transport))
    }
}

// =============================================================================
// Register bus server
// =============================================================================

/// Register and coil contents of a simulated bus controller.
#[derive(Debug, Clone, Default)]
pub struct ModbusImage {
    /// Input registers, indexed from 0.
    pub input_registers: Vec<u16>,
    /// Coils, indexed from 0.
    pub coils: Vec<bool>,
}

/// Answer read-input-registers, read-coils and write-single-coil requests
/// from `image` until the client drops the transport. Out-of-range
/// addresses get an "illegal data address" exception, other function codes
/// "illegal function".
pub fn serve_modbus(
    device: MockDevice,
    image: Arc<Mutex<ModbusImage>>,
) -> tokio::task::JoinHandle<Vec<Vec<u8>>> {
    let mut buf: Vec<u8> = Vec::new();
    device.serve(move |chunk| {
        buf.extend_from_slice(chunk);
        let mut replies = Vec::new();
        // MBAP header: transaction (2), protocol (2), length (2), unit (1)
        while buf.len() >= 7 {
            let len = usize::from(u16::from_be_bytes([buf[4], buf[5]]));
            if buf.len() < 6 + len {
                break;
            }
            let frame: Vec<u8> = buf.drain(..6 + len).collect();
            let pdu = &frame[7..];
            let word = |at: usize| usize::from(u16::from_be_bytes([pdu[at], pdu[at + 1]]));
            let mut image = image.lock();
            let reply_pdu = match pdu[0] {
                0x04 => {
                    let (start, count) = (word(1), word(3));
                    match image.input_registers.get(start..start + count) {
                        Some(regs) => {
                            let mut out = vec![0x04, (count * 2) as u8];
                            regs.iter().for_each(|r| out.extend_from_slice(&r.to_be_bytes()));
                            out
                        }
                        None => vec![0x84, 0x02],
                    }
                }
                0x01 => {
                    let (start, count) = (word(1), word(3));
                    if start + count > image.coils.len() {
                        vec![0x81, 0x02]
                    } else {
                        let mut bytes = vec![0u8; count.div_ceil(8)];
                        for i in 0..count {
                            if image.coils[start + i] {
                                bytes[i / 8] |= 1 << (i % 8);
                            }
                        }
                        let mut out = vec![0x01, bytes.len() as u8];
                        out.extend(bytes);
                        out
                    }
                }
                0x05 => {
                    let index = word(1);
                    if index < image.coils.len() {
                        image.coils[index] = word(3) == 0xFF00;
                        pdu.to_vec()
                    } else {
                        vec![0x85, 0x02]
                    }
                }
                other => vec![other | 0x80, 0x01],
            };
            let mut reply = frame[..4].to_vec();
            reply.extend_from_slice(&((reply_pdu.len() + 1) as u16).to_be_bytes());
            reply.push(frame[6]);
            reply.extend(reply_pdu);
            replies.push(reply);
        }
        replies
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_command_response() {
        let (mut transport, mut device) = pair();

        let app = tokio::spawn(async move {
            transport.write_all(b"PING\n").await.unwrap();
            let mut buf = [0u8; 5];
            transport.read_exact(&mut buf).await.unwrap();
            buf
        });

        device.expect_and_respond(b"PING\n", b"PONG\n").await;
        assert_eq!(&app.await.unwrap(), b"PONG\n");
    }

    #[tokio::test]
    async fn test_chunked_writes_are_recorded_separately() {
        let (transport, mut device) = pair();
        let mut transport = transport.with_chunk_size(3);
        transport.write_all(b"ABCDEFG").await.unwrap();
        let chunks = device.drain_writes(Duration::from_millis(20)).await;
        assert_eq!(chunks, vec![b"ABC".to_vec(), b"DEF".to_vec(), b"G".to_vec()]);
    }

    #[tokio::test]
    async fn test_break_link_fails_io() {
        let (mut transport, device) = pair();
        device.break_link();
        assert!(transport.write_all(b"x").await.is_err());
        let mut buf = [0u8; 1];
        assert!(transport.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_hang_up_reads_eof() {
        let (mut transport, mut device) = pair();
        device.hang_up();
        let mut buf = [0u8; 4];
        let n = timeout(Duration::from_millis(100), transport.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_connector_hands_out_in_order() {
        let connector = MockConnector::new();
        assert!(connector.open("a:1", Duration::from_millis(10)).await.is_err());

        let _device = connector.add_device();
        assert!(connector.open("a:1", Duration::from_millis(10)).await.is_ok());
        assert_eq!(connector.open_count(), 1);
        assert_eq!(connector.last_address().as_deref(), Some("a:1"));

        let _device = connector.add_device();
        connector.refuse(true);
        assert!(connector.open("a:1", Duration::from_millis(10)).await.is_err());
    }
}
