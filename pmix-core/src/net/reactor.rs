//! The non-blocking I/O reactor (C4): a single `mio::Poll` that watches the rendezvous
//! listener (level-triggered, so one wake can yield many pending connections) and every live
//! peer socket (edge-triggered). Exactly one reactor owns all peer state; nothing here is
//! touched from another thread.

use mio::unix::EventedFd;
use mio::{Evented, Events, Poll, PollOpt, Ready, Token};
use pmix_util::error::PmixResult;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener as StdUnixListener;

/// The rendezvous listener is always token 0; peer tokens are `PeerId + 1` so they never
/// collide with it.
pub const LISTEN_TOKEN: Token = Token(0);

fn peer_token(id: usize) -> Token {
    Token(id + 1)
}

fn token_peer(token: Token) -> usize {
    token.0 - 1
}

/// Thin `Evented` wrapper so the blocking std listener can be registered directly with `Poll`;
/// accept() only blocks when no connection is pending, and the listener is only ever polled
/// after a readiness notification, so it never actually blocks the reactor.
struct ListenerHandle(RawFd);

impl Evented for ListenerHandle {
    fn register(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> std::io::Result<()> {
        EventedFd(&self.0).register(poll, token, interest, opts)
    }

    fn reregister(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> std::io::Result<()> {
        EventedFd(&self.0).reregister(poll, token, interest, opts)
    }

    fn deregister(&self, poll: &Poll) -> std::io::Result<()> {
        EventedFd(&self.0).deregister(poll)
    }
}

#[derive(Debug, Copy, Clone)]
pub struct ReadyEvent {
    pub peer: Option<usize>,
    pub is_listener: bool,
    pub readable: bool,
    pub writable: bool,
}

pub struct Reactor {
    listener: StdUnixListener,
    listener_handle: ListenerHandle,
    poll: Poll,
    events: Events,
}

impl Reactor {
    pub fn bind(path: &std::path::Path) -> PmixResult<Reactor> {
        let listener = StdUnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        let handle = ListenerHandle(listener.as_raw_fd());

        let poll = Poll::new()?;
        poll.register(&handle, LISTEN_TOKEN, Ready::readable(), PollOpt::level())?;

        Ok(Reactor {
            listener,
            listener_handle: handle,
            poll,
            events: Events::with_capacity(4096),
        })
    }

    /// Accepts every connection currently pending on the listener, stopping at `WouldBlock`.
    pub fn accept_all(&self) -> Vec<std::os::unix::net::UnixStream> {
        let mut accepted = Vec::new();
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => accepted.push(stream),
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        accepted
    }

    pub fn register_peer(&self, id: usize, stream: &mio_uds::UnixStream) -> PmixResult<()> {
        self.poll
            .register(stream, peer_token(id), Ready::readable() | Ready::writable(), PollOpt::edge())?;
        Ok(())
    }

    pub fn reregister_peer(&self, id: usize, stream: &mio_uds::UnixStream, writable: bool) -> PmixResult<()> {
        let interest = if writable {
            Ready::readable() | Ready::writable()
        } else {
            Ready::readable()
        };
        self.poll.reregister(stream, peer_token(id), interest, PollOpt::edge())?;
        Ok(())
    }

    pub fn deregister_peer(&self, stream: &mio_uds::UnixStream) -> PmixResult<()> {
        self.poll.deregister(stream)?;
        Ok(())
    }

    /// Blocks (up to `timeout_ms`, or forever if `None`) for reactor events, returning the
    /// decoded set of ready tokens. Must be called again to pick up subsequent events; edge
    /// triggering means a socket that is still readable after a partial drain will not notify
    /// again until more data arrives.
    pub fn poll(&mut self, timeout_ms: Option<u64>) -> PmixResult<Vec<ReadyEvent>> {
        let timeout = timeout_ms.map(std::time::Duration::from_millis);
        self.poll.poll(&mut self.events, timeout)?;

        let mut ready = Vec::new();
        for event in self.events.iter() {
            if event.token() == LISTEN_TOKEN {
                ready.push(ReadyEvent {
                    peer: None,
                    is_listener: true,
                    readable: true,
                    writable: false,
                });
            } else {
                ready.push(ReadyEvent {
                    peer: Some(token_peer(event.token())),
                    is_listener: false,
                    readable: event.readiness().is_readable(),
                    writable: event.readiness().is_writable(),
                });
            }
        }
        Ok(ready)
    }

    pub fn local_addr_path(&self) -> Option<std::path::PathBuf> {
        self.listener.local_addr().ok().and_then(|a| a.as_pathname().map(|p| p.to_owned()))
    }
}
