//! epoll readiness multiplexer
//!
//! Descriptors are registered level-triggered with an opaque `u64` token.
//! `wait` reports, per token, which readiness directions fired. Hang-up and
//! error conditions are always reported by the kernel, even for a
//! descriptor registered with `Interest::NONE`.

use super::{Error, Result};
use libc::{
    epoll_event, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLL_CLOEXEC, EPOLL_CTL_ADD,
    EPOLL_CTL_DEL, EPOLL_CTL_MOD,
};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Readiness directions a descriptor is registered for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    /// Only hang-up and error conditions
    pub const NONE: Interest = Interest {
        read: false,
        write: false,
    };
    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };
    pub const WRITE: Interest = Interest {
        read: false,
        write: true,
    };

    fn to_epoll(self) -> u32 {
        let mut flags = 0;
        if self.read {
            flags |= EPOLLIN;
        }
        if self.write {
            flags |= EPOLLOUT;
        }
        flags as u32
    }
}

/// One readiness notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
    /// The peer closed both directions
    pub hangup: bool,
    /// An error is pending on the descriptor
    pub error: bool,
}

/// Linux `epoll` instance with a reusable event buffer
pub struct Poller {
    epoll: OwnedFd,
    events: Vec<epoll_event>,
}

impl Poller {
    /// Create a poller reporting at most `capacity` events per wait
    pub fn new(capacity: usize) -> Result<Self> {
        let epoll = unsafe { libc::epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(Error::poll("create"));
        }

        // SAFETY: epoll_create1 returned a fresh descriptor we exclusively own
        let epoll = unsafe { OwnedFd::from_raw_fd(epoll) };

        Ok(Poller {
            epoll,
            events: vec![epoll_event { events: 0, u64: 0 }; capacity.max(1)],
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let mut event = epoll_event {
            events: interest.to_epoll(),
            u64: token,
        };

        let rc = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };
        super::cvt(rc).map(|_| ())
    }

    /// Register a descriptor
    pub fn register(&self, fd: RawFd, token: u64, interest: Interest) -> Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, token, interest)
            .map_err(|source| Error::Poll { op: "add", source })
    }

    /// Replace the interest set of a registered descriptor
    pub fn reregister(&self, fd: RawFd, token: u64, interest: Interest) -> Result<()> {
        self.ctl(EPOLL_CTL_MOD, fd, token, interest)
            .map_err(|source| Error::Poll { op: "modify", source })
    }

    /// Remove a descriptor
    pub fn deregister(&self, fd: RawFd) -> Result<()> {
        let rc = unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if rc < 0 {
            return Err(Error::poll("delete"));
        }
        Ok(())
    }

    /// Wait for readiness, replacing the contents of `out`
    ///
    /// `None` waits indefinitely. An interrupted wait returns with no events.
    pub fn wait(&mut self, out: &mut Vec<Event>, timeout: Option<Duration>) -> Result<()> {
        out.clear();

        let timeout_ms = timeout
            .map(|t| t.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1);

        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(Error::Poll {
                op: "wait",
                source: err,
            });
        }

        for ev in &self.events[..n as usize] {
            // Copy out of the (possibly packed) kernel struct
            let flags = ev.events;
            let token = ev.u64;

            out.push(Event {
                token,
                readable: flags & EPOLLIN as u32 != 0,
                writable: flags & EPOLLOUT as u32 != 0,
                hangup: flags & EPOLLHUP as u32 != 0,
                error: flags & EPOLLERR as u32 != 0,
            });
        }

        Ok(())
    }
}
