//! Tunnel byte-channel abstraction
//!
//! The tunnel transport talks to its underlying duplex channel through a
//! readiness-style trait: wait until the channel is ready, then perform a
//! non-blocking read or write. `tokio::net::TcpStream` implements this shape
//! natively; [`MemoryIo`] provides an in-process channel with a bounded
//! buffer for clients running over an abstract reliable stream and for
//! exercising the save-queue path under controlled backpressure.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::Notify;

/// One full-duplex byte channel carrying tunnel frames.
#[async_trait]
pub trait TunnelIo: Send + Sync + 'static {
    /// Wait until the channel may have bytes to read.
    async fn readable(&self) -> io::Result<()>;

    /// Non-blocking read. `Ok(0)` signals EOF; `WouldBlock` means not ready.
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Wait until the channel may accept more output.
    async fn writable(&self) -> io::Result<()>;

    /// Non-blocking write of as many bytes as the channel will take.
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;
}

#[async_trait]
impl TunnelIo for TcpStream {
    async fn readable(&self) -> io::Result<()> {
        TcpStream::readable(self).await
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    async fn writable(&self) -> io::Result<()> {
        TcpStream::writable(self).await
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::try_write(self, buf)
    }
}

/// Read exactly `buf.len()` bytes, or fail with `UnexpectedEof`.
pub async fn read_exact(io: &dyn TunnelIo, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        io.readable().await?;
        match io.try_read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "channel closed mid-frame",
                ))
            }
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Write the whole buffer, waiting for readiness as needed.
pub async fn write_all(io: &dyn TunnelIo, buf: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        io.writable().await?;
        match io.try_write(&buf[written..]) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "channel closed")),
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

struct PipeState {
    buf: VecDeque<u8>,
    capacity: usize,
    closed: bool,
}

/// One direction of an in-memory duplex channel.
struct Pipe {
    state: Mutex<PipeState>,
    readable: Notify,
    writable: Notify,
}

impl Pipe {
    fn new(capacity: usize) -> Self {
        Pipe {
            state: Mutex::new(PipeState {
                buf: VecDeque::new(),
                capacity,
                closed: false,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }
}

/// In-process reliable byte channel with a bounded buffer per direction.
///
/// `try_write` accepts at most `capacity` unread bytes before returning
/// `WouldBlock`, which makes the tunnel spill into its save queue exactly as
/// it would on a saturated socket.
pub struct MemoryIo {
    incoming: Arc<Pipe>,
    outgoing: Arc<Pipe>,
}

impl MemoryIo {
    /// Create a connected pair of endpoints.
    pub fn pair(capacity: usize) -> (MemoryIo, MemoryIo) {
        let a = Arc::new(Pipe::new(capacity));
        let b = Arc::new(Pipe::new(capacity));
        (
            MemoryIo {
                incoming: a.clone(),
                outgoing: b.clone(),
            },
            MemoryIo {
                incoming: b,
                outgoing: a,
            },
        )
    }

    /// Close both directions; the peer observes EOF.
    pub fn close(&self) {
        self.incoming.close();
        self.outgoing.close();
    }
}

impl Drop for MemoryIo {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl TunnelIo for MemoryIo {
    async fn readable(&self) -> io::Result<()> {
        loop {
            let notified = self.incoming.readable.notified();
            {
                let state = self.incoming.state.lock().unwrap();
                if !state.buf.is_empty() || state.closed {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.incoming.state.lock().unwrap();
        if state.buf.is_empty() {
            if state.closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(state.buf.len());
        for (slot, byte) in buf.iter_mut().zip(state.buf.drain(..n)) {
            *slot = byte;
        }
        drop(state);
        self.incoming.writable.notify_waiters();
        Ok(n)
    }

    async fn writable(&self) -> io::Result<()> {
        loop {
            let notified = self.outgoing.writable.notified();
            {
                let state = self.outgoing.state.lock().unwrap();
                if state.closed || state.buf.len() < state.capacity {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.outgoing.state.lock().unwrap();
        if state.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let space = state.capacity - state.buf.len();
        if space == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(space);
        state.buf.extend(&buf[..n]);
        drop(state);
        self.outgoing.readable.notify_waiters();
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_io_roundtrip() {
        let (a, b) = MemoryIo::pair(64);
        write_all(&a, b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        read_exact(&b, &mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_memory_io_backpressure() {
        let (a, b) = MemoryIo::pair(8);
        assert_eq!(a.try_write(&[0u8; 16]).unwrap(), 8);
        assert!(matches!(
            a.try_write(&[0u8; 1]),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock
        ));

        let mut buf = [0u8; 8];
        read_exact(&b, &mut buf).await.unwrap();
        assert_eq!(a.try_write(&[0u8; 1]).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_io_eof_on_close() {
        let (a, b) = MemoryIo::pair(8);
        a.close();

        let mut buf = [0u8; 1];
        assert!(read_exact(&b, &mut buf).await.is_err());
        assert_eq!(b.try_read(&mut buf).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_memory_io_drop_closes_peer() {
        let (a, b) = MemoryIo::pair(8);
        drop(a);

        let mut buf = [0u8; 1];
        b.readable().await.unwrap();
        assert_eq!(b.try_read(&mut buf).unwrap(), 0);
    }
}
