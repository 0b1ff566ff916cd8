//! Readiness waiting across one or more handles
//!
//! There is no event loop inside the library. Callers collect an
//! [`Interest`] (descriptor plus direction) from every handle they drive,
//! wait once with [`wait`], and hand each [`Readiness`] back to the handle
//! it came from.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::ClientResult;

/// Which way a connection needs to make progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Nothing to do
    None,
    /// Waiting for the server
    Read,
    /// Requests queued for sending
    Write,
    /// Both of the above
    Both,
}

impl Direction {
    /// Combine read and write interest
    pub fn from_flags(read: bool, write: bool) -> Self {
        match (read, write) {
            (false, false) => Direction::None,
            (true, false) => Direction::Read,
            (false, true) => Direction::Write,
            (true, true) => Direction::Both,
        }
    }

    /// Wants readability
    pub fn wants_read(&self) -> bool {
        matches!(self, Direction::Read | Direction::Both)
    }

    /// Wants writability
    pub fn wants_write(&self) -> bool {
        matches!(self, Direction::Write | Direction::Both)
    }

    fn poll_events(&self) -> libc::c_short {
        let mut events = 0;
        if self.wants_read() {
            events |= libc::POLLIN;
        }
        if self.wants_write() {
            events |= libc::POLLOUT;
        }
        events
    }
}

/// One descriptor to wait on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    /// Descriptor
    pub fd: RawFd,
    /// What the owner is waiting for
    pub direction: Direction,
}

/// What [`wait`] observed for one [`Interest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    /// Descriptor can be read (or hit EOF/error)
    pub readable: bool,
    /// Descriptor can be written
    pub writable: bool,
}

impl Readiness {
    /// Whether anything happened
    pub fn is_ready(&self) -> bool {
        self.readable || self.writable
    }
}

/// Wait until at least one interest is ready or the timeout expires
///
/// Entries whose direction is [`Direction::None`] are ignored. The result has
/// one [`Readiness`] per interest, in the same order. `None` waits forever.
pub fn wait(interests: &[Interest], timeout: Option<Duration>) -> ClientResult<Vec<Readiness>> {
    let mut fds: Vec<libc::pollfd> = interests
        .iter()
        .map(|interest| libc::pollfd {
            fd: if interest.direction == Direction::None {
                -1
            } else {
                interest.fd
            },
            events: interest.direction.poll_events(),
            revents: 0,
        })
        .collect();

    let timeout_ms: libc::c_int = match timeout {
        Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        None => -1,
    };

    loop {
        // SAFETY: `fds` is a valid, exclusively borrowed array of pollfd for
        // the duration of the call and its length is passed alongside.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err.into());
        }
    }

    Ok(fds
        .iter()
        .map(|pfd| Readiness {
            readable: pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0,
            writable: pfd.revents & libc::POLLOUT != 0,
        })
        .collect())
}
