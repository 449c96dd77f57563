use std::{io, net::SocketAddr};

use mio::{Events, Interest, Poll, Token, event::Event, net::TcpListener};
use tracing::{debug, error, warn};

use crate::tcp::stream::{ConnState, TcpStream};

enum Slot {
    Listener(TcpListener),
    Stream(TcpStream),
}

/// Event emitted by [`Reactor::poll_with`] for one notable IO occurrence.
///
/// This is deliberately low-level: bytes in, bytes flushed, a peer showed up,
/// a peer left. Everything about message boundaries, handshakes or protocol
/// state lives above the reactor.
pub enum PollEvent<'a> {
    /// A new connection was accepted from a listener.
    Accept { listener: Token, stream: Token, peer_addr: SocketAddr },
    /// `token`'s peer closed the connection, or an IO error tore it down.
    Disconnected { token: Token },
    /// Bytes arrived on `token`. Only valid for the duration of the call.
    Bytes { token: Token, bytes: &'a [u8] },
}

/// Non-blocking TCP listener/connector built on `mio`.
///
/// Owns every socket it is given a [`Token`] for. Exactly three operations
/// are exposed: start listening, start connecting, and drive readiness via
/// [`Reactor::poll_with`]. Reconnection policy (whether, and when, to call
/// [`Reactor::connect`] again after a disconnect) is intentionally not this
/// type's job — it lives in the protocol-level connection state machine that
/// sits above the reactor.
pub struct Reactor {
    poll: Poll,
    events: Events,
    slots: Vec<(Token, Slot)>,
    next_token: usize,
}

impl Default for Reactor {
    fn default() -> Self {
        Self {
            poll: Poll::new().expect("couldn't create mio::Poll"),
            events: Events::with_capacity(128),
            slots: Vec::with_capacity(8),
            next_token: 0,
        }
    }
}

impl Reactor {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }

    fn index_of(&self, token: Token) -> Option<usize> {
        self.slots.iter().position(|(t, _)| *t == token)
    }

    /// Opens a non-blocking listening socket at `addr` with `SO_REUSEADDR`
    /// set and the given `backlog`, and registers it for read readiness.
    pub fn listen(&mut self, addr: SocketAddr, backlog: i32) -> io::Result<Token> {
        let std_listener = bind_listener(addr, backlog)?;
        let mut listener = TcpListener::from_std(std_listener);
        let token = self.alloc_token();
        self.poll.registry().register(&mut listener, token, Interest::READABLE)?;
        self.slots.push((token, Slot::Listener(listener)));
        Ok(token)
    }

    /// Initiates a non-blocking outbound connection to `addr`. The token is
    /// valid immediately; the connection may still be in progress until the
    /// first writable/readable event arrives (or a [`PollEvent::Disconnected`]
    /// reports it failed).
    pub fn connect(&mut self, addr: SocketAddr) -> io::Result<Token> {
        let mut stream = mio::net::TcpStream::connect(addr)?;
        let token = self.alloc_token();
        self.poll.registry().register(
            &mut stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        let stream = TcpStream::from_mio(stream, addr)?;
        self.slots.push((token, Slot::Stream(stream)));
        Ok(token)
    }

    /// Queues (or immediately writes) `data` on `token`'s stream. No-op if
    /// `token` doesn't name a live stream.
    pub fn write_or_enqueue(&mut self, token: Token, data: Vec<u8>) {
        let Some(i) = self.index_of(token) else {
            warn!(?token, "tcp: write to unknown token");
            return;
        };
        match &mut self.slots[i].1 {
            Slot::Stream(s) => {
                if s.write_or_enqueue(self.poll.registry(), token, data) == ConnState::Disconnected
                {
                    self.disconnect_at(i);
                }
            }
            Slot::Listener(_) => error!(?token, "tcp: cannot write to a listener token"),
        }
    }

    pub fn backlog_bytes(&self, token: Token) -> usize {
        self.index_of(token)
            .and_then(|i| match &self.slots[i].1 {
                Slot::Stream(s) => Some(s.backlog_bytes()),
                Slot::Listener(_) => None,
            })
            .unwrap_or(0)
    }

    pub fn backlog_len(&self, token: Token) -> usize {
        self.index_of(token)
            .and_then(|i| match &self.slots[i].1 {
                Slot::Stream(s) => Some(s.backlog_len()),
                Slot::Listener(_) => None,
            })
            .unwrap_or(0)
    }

    /// Closes and forgets `token`. No-op if unknown.
    pub fn disconnect(&mut self, token: Token) {
        if let Some(i) = self.index_of(token) {
            self.disconnect_at(i);
        }
    }

    fn disconnect_at(&mut self, index: usize) {
        let (_, slot) = self.slots.swap_remove(index);
        match slot {
            Slot::Stream(mut s) => s.close(self.poll.registry()),
            Slot::Listener(mut l) => {
                let _ = self.poll.registry().deregister(&mut l);
            }
        }
    }

    /// Polls once (non-blocking) and dispatches every ready event to
    /// `handler`. Returns whether any IO was processed.
    pub fn poll_with<F>(&mut self, mut handler: F) -> bool
    where
        F: for<'a> FnMut(PollEvent<'a>),
    {
        if let Err(err) = self.poll.poll(&mut self.events, Some(std::time::Duration::ZERO)) {
            error!(?err, "tcp: poll failed");
            return false;
        }

        let mut any = false;
        // Collect (token, readable, writable) first: the events buffer
        // borrows self.poll but handling an event (accept, read) needs
        // &mut self.slots.
        let ready: Vec<(Token, bool, bool)> =
            self.events.iter().map(|e: &Event| (e.token(), e.is_readable(), e.is_writable())).collect();
        for (token, readable, writable) in ready {
            any = true;
            self.handle_ready(token, readable, writable, &mut handler);
        }
        any
    }

    fn handle_ready<F>(&mut self, token: Token, readable: bool, writable: bool, handler: &mut F)
    where
        F: for<'a> FnMut(PollEvent<'a>),
    {
        let Some(i) = self.index_of(token) else {
            debug!(?token, "tcp: readiness for unknown/removed token");
            return;
        };

        match &mut self.slots[i].1 {
            Slot::Stream(_) => {
                // Re-borrow to satisfy the borrow checker: `poll_with` needs
                // `&Registry` (from self.poll) concurrently with `&mut
                // TcpStream` (from self.slots). Splitting the two fields is
                // always safe here since they're disjoint.
                let Reactor { poll, slots, .. } = self;
                let registry = poll.registry();
                let state = match &mut slots[i].1 {
                    Slot::Stream(s) => {
                        s.poll_with(registry, readable, writable, token, &mut |tok, bytes| {
                            handler(PollEvent::Bytes { token: tok, bytes });
                        })
                    }
                    Slot::Listener(_) => unreachable!(),
                };
                if state == ConnState::Disconnected {
                    handler(PollEvent::Disconnected { token });
                    self.disconnect_at(i);
                }
            }
            Slot::Listener(_) => loop {
                let accepted = match &mut self.slots[i].1 {
                    Slot::Listener(l) => l.accept(),
                    Slot::Stream(_) => unreachable!(),
                };
                let Ok((mut stream, peer_addr)) = accepted else { break };

                let new_token = self.alloc_token();
                if let Err(err) = self.poll.registry().register(
                    &mut stream,
                    new_token,
                    Interest::READABLE,
                ) {
                    error!(?err, "tcp: couldn't register accepted stream");
                    let _ = stream.shutdown(std::net::Shutdown::Both);
                    continue;
                }
                let Ok(conn) = TcpStream::from_mio(stream, peer_addr) else { continue };
                self.slots.push((new_token, Slot::Stream(conn)));
                handler(PollEvent::Accept { listener: token, stream: new_token, peer_addr });
            },
        }
    }
}

#[cfg(unix)]
mod raw {
    use std::{
        io,
        net::{SocketAddr, TcpListener as StdTcpListener},
        os::fd::{FromRawFd, RawFd},
    };

    pub(super) fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<StdTcpListener> {
        // SAFETY: each libc call below is checked for a `-1` return and its
        // errno surfaced via `io::Error::last_os_error`; `fd` is owned by the
        // `StdTcpListener` we construct from it on the success path and
        // closed via `libc::close` on every early-return failure path.
        unsafe {
            let domain = match addr {
                SocketAddr::V4(_) => libc::AF_INET,
                SocketAddr::V6(_) => libc::AF_INET6,
            };
            let fd = libc::socket(domain, libc::SOCK_STREAM, 0);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                libc::close(fd);
                return Err(io::Error::last_os_error());
            }

            let one: libc::c_int = 1;
            if libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const libc::c_void,
                core::mem::size_of::<libc::c_int>() as libc::socklen_t,
            ) < 0
            {
                libc::close(fd);
                return Err(io::Error::last_os_error());
            }

            let rcvlowat: libc::c_int = 8;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVLOWAT,
                &rcvlowat as *const _ as *const libc::c_void,
                core::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );

            let (sockaddr, len) = sockaddr_storage_for(addr);
            if libc::bind(fd, (&sockaddr as *const libc::sockaddr_storage).cast(), len) < 0 {
                libc::close(fd);
                return Err(io::Error::last_os_error());
            }

            if libc::listen(fd, backlog) < 0 {
                libc::close(fd);
                return Err(io::Error::last_os_error());
            }

            Ok(StdTcpListener::from_raw_fd(fd as RawFd))
        }
    }

    /// Builds a `sockaddr_storage` for `addr`, returned alongside its used
    /// length. Kept minimal: only what `bind(2)` needs.
    fn sockaddr_storage_for(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
        let mut storage: libc::sockaddr_storage = unsafe { core::mem::zeroed() };
        let len = match addr {
            SocketAddr::V4(v4) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: v4.port().to_be(),
                    sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(v4.ip().octets()) },
                    sin_zero: [0; 8],
                };
                unsafe {
                    std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
                }
                core::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
            }
            SocketAddr::V6(v6) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: v6.port().to_be(),
                    sin6_flowinfo: v6.flowinfo(),
                    sin6_addr: libc::in6_addr { s6_addr: v6.ip().octets() },
                    sin6_scope_id: v6.scope_id(),
                };
                unsafe {
                    std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
                }
                core::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
            }
        };
        (storage, len)
    }
}

#[cfg(unix)]
use raw::bind_listener;

#[cfg(not(unix))]
fn bind_listener(addr: SocketAddr, _backlog: i32) -> io::Result<std::net::TcpListener> {
    let listener = std::net::TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}
