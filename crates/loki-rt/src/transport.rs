//! Transport seam: the duplex byte streams connections are built on.
//!
//! A [`Socket`] can be cloned into independent read and write halves that
//! refer to the same underlying stream, mirroring `TcpStream::try_clone`.
//! The read loop owns one half, the write path owns another behind a lock,
//! and a third is kept for shutdown so teardown never waits on a writer.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

pub trait Socket: Read + Write + Send + Sync + 'static {
    /// Another handle to the same stream.
    fn try_clone_socket(&self) -> io::Result<Box<dyn Socket>>;

    /// Deadline for blocking reads on every handle of this stream.
    /// A read that exceeds it fails with `WouldBlock` or `TimedOut`.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Shut both directions down. Blocked reads on any handle return.
    fn shutdown(&self) -> io::Result<()>;

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl Socket for TcpStream {
    fn try_clone_socket(&self) -> io::Result<Box<dyn Socket>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        match TcpStream::shutdown(self, Shutdown::Both) {
            // Already torn down by the peer.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

#[derive(Default)]
struct Inbound {
    bytes: VecDeque<u8>,
    eof: bool,
}

#[derive(Default)]
struct Shared {
    inbound: Mutex<Inbound>,
    readable: Condvar,
    outbound: Mutex<Vec<u8>>,
    read_timeout: Mutex<Option<Duration>>,
    shut: AtomicBool,
}

/// In-memory duplex socket for driving the engine without a network.
///
/// The test side feeds client bytes with [`MemorySocket::feed`] and
/// inspects everything the engine wrote with [`MemorySocket::written`].
/// Reads block until bytes arrive, input is finished, the socket is shut
/// down, or the read timeout elapses.
#[derive(Clone, Default)]
pub struct MemorySocket {
    shared: Arc<Shared>,
}

impl MemorySocket {
    pub fn new() -> Self {
        Self::default()
    }

    /// A socket whose whole inbound stream is `bytes` followed by EOF.
    pub fn with_input(bytes: &[u8]) -> Self {
        let socket = Self::new();
        socket.feed(bytes);
        socket.finish_input();
        socket
    }

    pub fn feed(&self, bytes: &[u8]) {
        self.shared.inbound.lock().bytes.extend(bytes);
        self.shared.readable.notify_all();
    }

    /// Signal end of the inbound stream once buffered bytes are consumed.
    pub fn finish_input(&self) {
        self.shared.inbound.lock().eof = true;
        self.shared.readable.notify_all();
    }

    /// Snapshot of every byte written so far.
    pub fn written(&self) -> Vec<u8> {
        self.shared.outbound.lock().clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shut.load(Ordering::Acquire)
    }
}

impl Read for MemorySocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let timeout = *self.shared.read_timeout.lock();
        let mut inbound = self.shared.inbound.lock();
        loop {
            if !inbound.bytes.is_empty() {
                let n = buf.len().min(inbound.bytes.len());
                for (slot, byte) in buf.iter_mut().zip(inbound.bytes.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if inbound.eof || self.shared.shut.load(Ordering::Acquire) {
                return Ok(0);
            }
            match timeout {
                Some(timeout) => {
                    if self.shared.readable.wait_for(&mut inbound, timeout).timed_out()
                        && inbound.bytes.is_empty()
                        && !inbound.eof
                        && !self.shared.shut.load(Ordering::Acquire)
                    {
                        return Err(io::ErrorKind::WouldBlock.into());
                    }
                }
                None => self.shared.readable.wait(&mut inbound),
            }
        }
    }
}

impl Write for MemorySocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.is_shutdown() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.shared.outbound.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Socket for MemorySocket {
    fn try_clone_socket(&self) -> io::Result<Box<dyn Socket>> {
        Ok(Box::new(self.clone()))
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        *self.shared.read_timeout.lock() = timeout;
        Ok(())
    }

    fn shutdown(&self) -> io::Result<()> {
        self.shared.shut.store(true, Ordering::Release);
        // Take the lock so a reader between its checks and its wait
        // cannot miss the wakeup.
        let _inbound = self.shared.inbound.lock();
        self.shared.readable.notify_all();
        Ok(())
    }
}
