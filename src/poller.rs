//! Readiness multiplexer abstraction over mio.
//!
//! The event loop talks to the OS through the [`Multiplexer`] trait so hosts
//! and tests can substitute their own readiness source. [`MioPoller`] is the
//! default implementation, backed by epoll on Linux and kqueue on macOS.

use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Direction a fiber waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    Readable,
    Writable,
}

impl From<Interest> for mio::Interest {
    fn from(interest: Interest) -> Self {
        match interest {
            Interest::Readable => mio::Interest::READABLE,
            Interest::Writable => mio::Interest::WRITABLE,
        }
    }
}

/// A handle that became ready for one registered direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub fd: RawFd,
    pub interest: Interest,
}

/// OS readiness-notification mechanism used by the event loop.
///
/// Registrations are treated as one-shot by the caller: the event loop
/// deregisters a direction as soon as it has been reported ready.
pub trait Multiplexer {
    /// Starts watching `fd` for `interest`. Fails if `fd` cannot be polled.
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Stops watching one direction of `fd`.
    fn deregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Drops every registration of `fd` (used when the handle errored or is closing).
    fn remove(&mut self, fd: RawFd) -> io::Result<()>;

    /// Blocks until at least one registered handle is ready or `timeout`
    /// elapses, appending what became ready to `ready`.
    ///
    /// A timeout of `None` blocks indefinitely; `Some(Duration::ZERO)` only
    /// checks.
    fn poll(&mut self, ready: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()>;
}

/// [`Multiplexer`] on top of `mio::Poll`, keyed by the raw handle.
pub struct MioPoller {
    poll: Poll,
    events: Events,
    /// Combined interest currently registered for each handle.
    interests: HashMap<RawFd, mio::Interest>,
}

impl MioPoller {
    /// Creates a poller able to report up to `capacity` events per poll
    /// (clamped to 1024).
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity.clamp(1, 1024)),
            interests: HashMap::new(),
        })
    }

    /// Number of handles with at least one registered direction.
    pub fn len(&self) -> usize {
        self.interests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interests.is_empty()
    }
}

impl Multiplexer for MioPoller {
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let token = Token(fd as usize);
        let mut source = SourceFd(&fd);
        let wanted = match self.interests.get(&fd) {
            Some(&current) => {
                let merged = current | interest.into();
                self.poll
                    .registry()
                    .reregister(&mut source, token, merged)?;
                merged
            }
            None => {
                let wanted = interest.into();
                self.poll.registry().register(&mut source, token, wanted)?;
                wanted
            }
        };
        self.interests.insert(fd, wanted);
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let Some(&current) = self.interests.get(&fd) else {
            return Ok(());
        };
        let mut source = SourceFd(&fd);
        match current.remove(interest.into()) {
            Some(rest) if rest != current => {
                self.interests.insert(fd, rest);
                self.poll
                    .registry()
                    .reregister(&mut source, Token(fd as usize), rest)
            }
            Some(_) => Ok(()),
            None => {
                self.interests.remove(&fd);
                self.poll.registry().deregister(&mut source)
            }
        }
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        if self.interests.remove(&fd).is_none() {
            return Ok(());
        }
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    fn poll(&mut self, ready: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()> {
        self.events.clear();
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e);
        }

        for event in self.events.iter() {
            let fd = event.token().0 as RawFd;
            let Some(registered) = self.interests.get(&fd) else {
                continue;
            };
            let failed = event.is_error() || event.is_read_closed() || event.is_write_closed();
            if registered.is_readable() && (event.is_readable() || failed) {
                ready.push(Readiness {
                    fd,
                    interest: Interest::Readable,
                });
            }
            if registered.is_writable() && (event.is_writable() || failed) {
                ready.push(Readiness {
                    fd,
                    interest: Interest::Writable,
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for MioPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MioPoller")
            .field("registrations", &self.interests.len())
            .finish()
    }
}
