//! Linux kernel asynchronous I/O
//!
//! Raw `io_setup` / `io_submit` / `io_getevents` / `io_destroy` syscalls
//! with the ABI structs from `linux/aio_abi.h`. Operations submitted with a
//! result descriptor (`IOCB_FLAG_RESFD`) bump that eventfd on completion,
//! which lets the event loop wait for disk I/O through epoll instead of
//! blocking in `io_getevents`.

use super::{Error, Result};
use std::io;
use std::os::fd::RawFd;

const IOCB_CMD_PREAD: u16 = 0;
const IOCB_CMD_PWRITE: u16 = 1;
const IOCB_FLAG_RESFD: u32 = 1 << 0;

/// Kernel I/O control block (`struct iocb`)
#[repr(C)]
#[derive(Debug, Default, Clone)]
pub struct Iocb {
    pub aio_data: u64,
    #[cfg(target_endian = "little")]
    pub aio_key: u32,
    pub aio_rw_flags: i32,
    #[cfg(target_endian = "big")]
    pub aio_key: u32,
    pub aio_lio_opcode: u16,
    pub aio_reqprio: i16,
    pub aio_fildes: u32,
    pub aio_buf: u64,
    pub aio_nbytes: u64,
    pub aio_offset: i64,
    pub aio_reserved2: u64,
    pub aio_flags: u32,
    pub aio_resfd: u32,
}

impl Iocb {
    fn prep(opcode: u16, fd: RawFd, buf: u64, len: usize, offset: u64, resfd: RawFd) -> Self {
        Iocb {
            aio_lio_opcode: opcode,
            aio_fildes: fd as u32,
            aio_buf: buf,
            aio_nbytes: len as u64,
            aio_offset: offset as i64,
            aio_flags: IOCB_FLAG_RESFD,
            aio_resfd: resfd as u32,
            ..Default::default()
        }
    }

    /// Read `buf.len()` bytes of `fd` at `offset` into `buf`
    pub fn pread(fd: RawFd, buf: &mut [u8], offset: u64, resfd: RawFd) -> Self {
        Self::prep(
            IOCB_CMD_PREAD,
            fd,
            buf.as_mut_ptr() as u64,
            buf.len(),
            offset,
            resfd,
        )
    }

    /// Write `buf` to `fd` at `offset` (sockets require offset 0)
    pub fn pwrite(fd: RawFd, buf: &[u8], offset: u64, resfd: RawFd) -> Self {
        Self::prep(
            IOCB_CMD_PWRITE,
            fd,
            buf.as_ptr() as u64,
            buf.len(),
            offset,
            resfd,
        )
    }

    /// Tag the control block; the tag is echoed in `IoEvent::data`
    pub fn with_data(mut self, data: u64) -> Self {
        self.aio_data = data;
        self
    }
}

/// Completion record (`struct io_event`)
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct IoEvent {
    pub data: u64,
    pub obj: u64,
    pub res: i64,
    pub res2: i64,
}

impl IoEvent {
    /// Interpret `res`: a byte count, or a negated errno
    pub fn result(&self) -> io::Result<usize> {
        if self.res < 0 {
            Err(io::Error::from_raw_os_error(-self.res as i32))
        } else {
            Ok(self.res as usize)
        }
    }
}

/// Kernel AIO context (`aio_context_t`)
///
/// Dropping the context calls `io_destroy`, which cancels or waits out any
/// operation still in flight. Buffers handed to `submit` must therefore
/// outlive the context.
#[derive(Debug)]
pub struct AioContext {
    ctx: libc::c_ulong,
}

impl AioContext {
    /// Create a context able to hold `max_events` operations in flight
    pub fn new(max_events: u32) -> Result<Self> {
        let mut ctx: libc::c_ulong = 0;
        let rc = unsafe {
            libc::syscall(
                libc::SYS_io_setup,
                max_events as libc::c_long,
                &mut ctx as *mut libc::c_ulong,
            )
        };
        if rc < 0 {
            return Err(Error::aio("setup"));
        }
        Ok(AioContext { ctx })
    }

    /// Submit one operation
    ///
    /// # Safety
    /// The buffer `iocb` points at must stay valid, and must not be moved or
    /// touched by anything else, until the completion for this operation
    /// has been reaped or the context has been dropped.
    pub unsafe fn submit(&self, iocb: &mut Iocb) -> Result<()> {
        let mut iocbs = [iocb as *mut Iocb];
        let rc = unsafe {
            libc::syscall(
                libc::SYS_io_submit,
                self.ctx,
                1 as libc::c_long,
                iocbs.as_mut_ptr(),
            )
        };
        if rc < 0 {
            return Err(Error::aio("submit"));
        }
        if rc == 0 {
            return Err(Error::Aio {
                op: "submit",
                source: io::Error::from(io::ErrorKind::WouldBlock),
            });
        }
        Ok(())
    }

    /// Reap already-completed operations without blocking
    pub fn reap(&self, out: &mut [IoEvent]) -> Result<usize> {
        let mut timeout = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let rc = unsafe {
            libc::syscall(
                libc::SYS_io_getevents,
                self.ctx,
                0 as libc::c_long,
                out.len() as libc::c_long,
                out.as_mut_ptr(),
                &mut timeout as *mut libc::timespec,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(Error::Aio {
                op: "getevents",
                source: err,
            });
        }
        Ok(rc as usize)
    }
}

impl Drop for AioContext {
    fn drop(&mut self) {
        unsafe {
            libc::syscall(libc::SYS_io_destroy, self.ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::EventFd;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::time::{Duration, Instant};

    fn reap_one(ctx: &AioContext) -> IoEvent {
        let mut events = [IoEvent::default()];
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if ctx.reap(&mut events).unwrap() == 1 {
                return events[0];
            }
            assert!(Instant::now() < deadline, "AIO completion never arrived");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_iocb_layout() {
        assert_eq!(std::mem::size_of::<Iocb>(), 64);
        assert_eq!(std::mem::size_of::<IoEvent>(), 32);
    }

    #[test]
    fn test_pread_signals_eventfd() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"hello kernel aio").unwrap();

        let ctx = AioContext::new(1).unwrap();
        let efd = EventFd::new().unwrap();
        let mut buf = vec![0u8; 6];

        let mut iocb = Iocb::pread(file.as_raw_fd(), &mut buf, 6, efd.as_raw_fd()).with_data(9);
        unsafe { ctx.submit(&mut iocb).unwrap() };

        let event = reap_one(&ctx);
        assert_eq!(event.data, 9);
        assert_eq!(event.result().unwrap(), 6);
        assert_eq!(&buf, b"kernel");
        assert!(efd.drain().unwrap() >= 1);
    }

    #[test]
    fn test_negative_result_maps_to_errno() {
        let event = IoEvent {
            res: -(libc::EAGAIN as i64),
            ..Default::default()
        };
        assert_eq!(
            event.result().unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }
}
