use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::SocketAddr,
};

use mio::{Interest, Registry, Token};
use tracing::{debug, warn};

/// Response type for all external calls.
///
/// `Alive` means the connection is still usable. `Disconnected` means the
/// peer is gone (or the socket errored) and the caller must tear the
/// connection down.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnState {
    Alive,
    Disconnected,
}

enum ReadOutcome<'a> {
    Data(&'a [u8]),
    WouldBlock,
    Disconnected,
}

const RX_BUF_SIZE: usize = 32 * 1024;

/// A single mio-backed, non-blocking TCP byte stream.
///
/// This layer knows nothing about message framing: it hands whatever bytes
/// the kernel gave it up to the caller (a [`crate::tcp::Reactor`] consumer,
/// in practice the protocol-level frame reader) and queues whatever bytes
/// the caller wants written, flushing them as the socket allows. Framing,
/// handshake, and everything else protocol-shaped lives a layer above this.
pub struct TcpStream {
    stream: mio::net::TcpStream,
    peer_addr: SocketAddr,

    rx_buf: Vec<u8>,

    /// Backlogged writes. Each entry is a contiguous run of bytes still
    /// waiting to go out; the front entry may be partially written.
    send_backlog: VecDeque<Vec<u8>>,

    /// Invariant: `writable_armed == !send_backlog.is_empty()`.
    writable_armed: bool,
}

impl TcpStream {
    pub(crate) fn from_mio(stream: mio::net::TcpStream, peer_addr: SocketAddr) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            peer_addr,
            rx_buf: vec![0; RX_BUF_SIZE],
            send_backlog: VecDeque::with_capacity(16),
            writable_armed: false,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Number of bytes currently queued but not yet written to the socket.
    pub fn backlog_bytes(&self) -> usize {
        self.send_backlog.iter().map(Vec::len).sum()
    }

    pub fn backlog_len(&self) -> usize {
        self.send_backlog.len()
    }

    /// Polls this stream for one readiness event, handing every chunk of
    /// available bytes to `on_bytes` until the socket would block.
    #[inline]
    pub fn poll_with<F>(
        &mut self,
        registry: &Registry,
        readable: bool,
        writable: bool,
        token: Token,
        on_bytes: &mut F,
    ) -> ConnState
    where
        F: for<'a> FnMut(Token, &'a [u8]),
    {
        if readable {
            loop {
                match self.read_chunk() {
                    ReadOutcome::Data(chunk) => on_bytes(token, chunk),
                    ReadOutcome::WouldBlock => break,
                    ReadOutcome::Disconnected => return ConnState::Disconnected,
                }
            }
        }

        if writable && self.drain_backlog(registry, token) == ConnState::Disconnected {
            return ConnState::Disconnected;
        }

        ConnState::Alive
    }

    fn read_chunk(&mut self) -> ReadOutcome<'_> {
        match self.stream.read(&mut self.rx_buf) {
            Ok(0) => ReadOutcome::Disconnected,
            Ok(n) => ReadOutcome::Data(&self.rx_buf[..n]),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
            Err(err) => {
                debug!(?err, "tcp: read failed");
                ReadOutcome::Disconnected
            }
        }
    }

    /// Writes `data` immediately if the backlog is empty and the socket
    /// accepts it whole, otherwise queues it (and the unwritten remainder of
    /// a partial write) to be flushed on the next writable event.
    pub fn write_or_enqueue(&mut self, registry: &Registry, token: Token, data: Vec<u8>) -> ConnState {
        if !self.send_backlog.is_empty() {
            return self.enqueue_back(registry, token, data);
        }

        match self.stream.write(&data) {
            Ok(0) => {
                warn!("tcp: stream failed to write, disconnecting");
                ConnState::Disconnected
            }
            Ok(n) if n == data.len() => ConnState::Alive,
            Ok(n) => {
                let remainder = data[n..].to_vec();
                self.enqueue_front(registry, token, remainder)
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.enqueue_back(registry, token, data)
            }
            Err(err) => {
                warn!(?err, "tcp: write failed");
                ConnState::Disconnected
            }
        }
    }

    fn drain_backlog(&mut self, registry: &Registry, token: Token) -> ConnState {
        while let Some(front) = self.send_backlog.front_mut() {
            match self.stream.write(front) {
                Ok(0) => return ConnState::Disconnected,
                Ok(n) => {
                    if n == front.len() {
                        self.send_backlog.pop_front();
                    } else {
                        front.drain(..n);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(?err, "tcp: write from backlog");
                    return ConnState::Disconnected;
                }
            }
        }

        if self.send_backlog.is_empty() && self.writable_armed {
            if let Err(err) = registry.reregister(&mut self.stream, token, Interest::READABLE) {
                debug!(?err, "tcp: reregister drop writable");
                return ConnState::Disconnected;
            }
            self.writable_armed = false;
        }

        ConnState::Alive
    }

    fn enqueue_front(&mut self, registry: &Registry, token: Token, data: Vec<u8>) -> ConnState {
        self.send_backlog.push_front(data);
        self.arm_writable(registry, token)
    }

    fn enqueue_back(&mut self, registry: &Registry, token: Token, data: Vec<u8>) -> ConnState {
        self.send_backlog.push_back(data);
        self.arm_writable(registry, token)
    }

    fn arm_writable(&mut self, registry: &Registry, token: Token) -> ConnState {
        if !self.writable_armed {
            if let Err(err) =
                registry.reregister(&mut self.stream, token, Interest::READABLE | Interest::WRITABLE)
            {
                debug!(?err, "tcp: poll reregister");
                return ConnState::Disconnected;
            }
            self.writable_armed = true;
        }
        ConnState::Alive
    }

    pub fn close(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}
