//! Network and kernel plumbing
//!
//! Thin, safe wrappers over the Linux facilities the server is driven by:
//!
//! - `listener` binds the listening socket and tunes accepted sockets
//! - `poll` is the epoll readiness multiplexer
//! - `eventfd` wraps the counter descriptor used for wake-ups and AIO
//!   completion notification
//! - `aio` is the kernel asynchronous I/O interface (`io_setup` and friends)

pub mod aio;
pub mod eventfd;
pub mod listener;
pub mod poll;

pub use aio::{AioContext, IoEvent, Iocb};
pub use eventfd::EventFd;
pub use listener::{configure_stream, tcp_listen};
pub use poll::{Event, Interest, Poller};

use std::io;

/// Result type for network operations
pub type Result<T> = std::result::Result<T, Error>;

/// Network and kernel interface errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("epoll {op} failed: {source}")]
    Poll {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("AIO {op} failed: {source}")]
    Aio {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

impl Error {
    pub(crate) fn poll(op: &'static str) -> Self {
        Error::Poll {
            op,
            source: io::Error::last_os_error(),
        }
    }

    pub(crate) fn aio(op: &'static str) -> Self {
        Error::Aio {
            op,
            source: io::Error::last_os_error(),
        }
    }
}

/// Convert a libc return value into an `io::Result`
pub(crate) fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}
