//! Zero-copy transfer engine
//!
//! Streams a file to a non-blocking socket with `sendfile(2)`. The file
//! offset is passed explicitly, so the file's own position is never used
//! and the transfer resumes exactly where the previous call stopped.

use super::Progress;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;

/// Upper bound per `sendfile` call; larger counts fail on some kernels
const MAX_SENDFILE_CHUNK: u64 = 1 << 30;

/// Send `file[*progress..payload_size]` to `socket`
///
/// Loops over short transfers. Returns `Progress::WouldBlock` once the
/// socket buffer is full, leaving `*progress` at the number of bytes sent
/// so far, and `Progress::Complete` when `*progress == payload_size`.
pub fn send_static<S: AsRawFd>(
    socket: &S,
    file: &File,
    progress: &mut u64,
    payload_size: u64,
) -> io::Result<Progress> {
    while *progress < payload_size {
        let count = (payload_size - *progress).min(MAX_SENDFILE_CHUNK) as usize;
        let mut offset = *progress as libc::off_t;

        let sent = unsafe {
            libc::sendfile(socket.as_raw_fd(), file.as_raw_fd(), &mut offset, count)
        };

        if sent < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return Ok(Progress::WouldBlock),
                io::ErrorKind::Interrupted => continue,
                _ => return Err(err),
            }
        }

        if sent == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file ended at {} of {} bytes", *progress, payload_size),
            ));
        }

        *progress = offset as u64;
    }

    Ok(Progress::Complete)
}
