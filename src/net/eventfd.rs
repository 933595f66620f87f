//! `eventfd` counter descriptors
//!
//! Used two ways by the server: as the completion-notification descriptor
//! kernel AIO signals when a submitted operation finishes, and as the
//! wake-up source behind `ShutdownHandle`.

use super::{Error, Result};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Non-blocking `eventfd`
#[derive(Debug)]
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    /// Create a non-blocking, close-on-exec eventfd with a zero counter
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        // SAFETY: eventfd just returned a fresh descriptor we exclusively own
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(EventFd { fd })
    }

    /// Add one to the counter, waking anyone polling for readability
    pub fn notify(&self) -> io::Result<()> {
        let buf: u64 = 1;
        let n = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &buf as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Read and reset the counter
    ///
    /// Returns `Ok(0)` when the counter was already zero.
    pub fn drain(&self) -> io::Result<u64> {
        let mut buf: u64 = 0;
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut buf as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(buf)
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for EventFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_and_drain() {
        let efd = EventFd::new().unwrap();
        assert_eq!(efd.drain().unwrap(), 0);

        efd.notify().unwrap();
        efd.notify().unwrap();
        assert_eq!(efd.drain().unwrap(), 2);
        assert_eq!(efd.drain().unwrap(), 0);
    }
}
