//! Asynchronous chunked transfer engine
//!
//! A dynamic resource is sent one chunk at a time through kernel AIO:
//! read the chunk from the file into the chunk buffer, write that buffer to
//! the socket, advance, repeat. Each submission carries the transfer's
//! eventfd, and the event loop watches that eventfd through epoll, so the
//! thread never waits for disk I/O while other connections have work.
//!
//! Only one operation is in flight at a time. The read and write control
//! blocks and the chunk buffer are allocated once when the transfer starts
//! and live until it is dropped.

use super::Progress;
use crate::net::{self, AioContext, EventFd, IoEvent, Iocb};
use bytes::BytesMut;
use log::trace;
use std::io;
use std::os::fd::{AsRawFd, RawFd};

const READ_TAG: u64 = 1;
const WRITE_TAG: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Nothing submitted yet
    Idle,
    /// A file read is in flight
    Reading,
    /// A socket write is in flight
    Writing,
    /// The socket refused the last write; waiting for write readiness
    AwaitingSocket,
    Finished,
}

/// Per-connection asynchronous transfer state
pub struct AsyncTransfer {
    // Declared first so it drops first: io_destroy waits out any operation
    // still pointing into `buf`.
    ctx: AioContext,
    notify: EventFd,
    read_cb: Iocb,
    write_cb: Iocb,
    buf: BytesMut,
    events: [IoEvent; 1],
    phase: Phase,
    /// Bytes of the current chunk read from disk
    chunk_len: usize,
    /// Bytes of the current chunk already written to the socket
    written: usize,
}

impl AsyncTransfer {
    /// Set up the AIO context, completion eventfd and chunk buffer
    ///
    /// The chunk is `min(payload_size, chunk_size)` bytes. Failure here
    /// means the kernel is out of AIO or descriptor resources.
    pub fn new(chunk_size: usize, payload_size: u64) -> net::Result<Self> {
        let len = payload_size.min(chunk_size as u64) as usize;

        Ok(AsyncTransfer {
            ctx: AioContext::new(1)?,
            notify: EventFd::new()?,
            read_cb: Iocb::default(),
            write_cb: Iocb::default(),
            buf: BytesMut::zeroed(len),
            events: [IoEvent::default()],
            phase: Phase::Idle,
            chunk_len: 0,
            written: 0,
        })
    }

    /// Descriptor that turns readable when an operation completes
    pub fn notify_fd(&self) -> RawFd {
        self.notify.as_raw_fd()
    }

    /// Size of one chunk
    pub fn chunk_size(&self) -> usize {
        self.buf.len()
    }

    /// Kick the transfer forward from a write-readiness event
    ///
    /// Starts the first chunk, or resubmits a write the socket refused.
    /// Does nothing while an operation is already in flight.
    pub fn resume(
        &mut self,
        file: RawFd,
        socket: RawFd,
        progress: u64,
        payload_size: u64,
    ) -> net::Result<Progress> {
        match self.phase {
            Phase::Idle => {
                self.submit_read(file, progress, payload_size)?;
                Ok(Progress::Pending)
            }
            Phase::AwaitingSocket => {
                self.submit_write(socket)?;
                Ok(Progress::Pending)
            }
            Phase::Reading | Phase::Writing => Ok(Progress::Pending),
            Phase::Finished => Ok(Progress::Complete),
        }
    }

    /// Handle readiness of the completion eventfd
    ///
    /// Reaps whatever the kernel has finished and submits the next step.
    /// Operations that complete during submission are picked up in the
    /// same call.
    pub fn on_notify(
        &mut self,
        file: RawFd,
        socket: RawFd,
        progress: &mut u64,
        payload_size: u64,
    ) -> net::Result<Progress> {
        self.notify.drain()?;

        loop {
            match self.phase {
                Phase::Reading | Phase::Writing => {}
                Phase::AwaitingSocket => return Ok(Progress::WouldBlock),
                Phase::Idle => return Ok(Progress::Pending),
                Phase::Finished => return Ok(Progress::Complete),
            }

            if self.ctx.reap(&mut self.events)? == 0 {
                return Ok(Progress::Pending);
            }
            let event = self.events[0];

            match (self.phase, event.data) {
                (Phase::Reading, READ_TAG) => {
                    let n = event.result().map_err(|source| net::Error::Aio {
                        op: "read",
                        source,
                    })?;
                    if n == 0 {
                        return Err(net::Error::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("file ended at {} of {} bytes", *progress, payload_size),
                        )));
                    }
                    trace!("read chunk of {} bytes at offset {}", n, *progress);

                    self.chunk_len = n;
                    self.written = 0;
                    self.submit_write(socket)?;
                }
                (Phase::Writing, WRITE_TAG) => match event.result() {
                    Ok(0) => {
                        return Err(net::Error::Io(io::Error::from(io::ErrorKind::WriteZero)));
                    }
                    Ok(n) => {
                        self.written += n;
                        if self.written < self.chunk_len {
                            self.submit_write(socket)?;
                            continue;
                        }

                        *progress += self.chunk_len as u64;
                        if *progress >= payload_size {
                            self.phase = Phase::Finished;
                            return Ok(Progress::Complete);
                        }
                        self.submit_read(file, *progress, payload_size)?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.phase = Phase::AwaitingSocket;
                        return Ok(Progress::WouldBlock);
                    }
                    Err(source) => {
                        return Err(net::Error::Aio {
                            op: "write",
                            source,
                        })
                    }
                },
                (phase, tag) => {
                    return Err(net::Error::Aio {
                        op: "getevents",
                        source: io::Error::other(format!(
                            "completion tagged {} while {:?}",
                            tag, phase
                        )),
                    })
                }
            }
        }
    }

    fn submit_read(&mut self, file: RawFd, offset: u64, payload_size: u64) -> net::Result<()> {
        let len = (payload_size - offset).min(self.buf.len() as u64) as usize;
        let resfd = self.notify.as_raw_fd();

        self.read_cb = Iocb::pread(file, &mut self.buf[..len], offset, resfd).with_data(READ_TAG);
        // SAFETY: `buf` is never resized and outlives `ctx`, which drops first
        unsafe { self.ctx.submit(&mut self.read_cb)? };

        self.phase = Phase::Reading;
        Ok(())
    }

    fn submit_write(&mut self, socket: RawFd) -> net::Result<()> {
        let resfd = self.notify.as_raw_fd();
        let pending = &self.buf[self.written..self.chunk_len];

        self.write_cb = Iocb::pwrite(socket, pending, 0, resfd).with_data(WRITE_TAG);
        // SAFETY: as in `submit_read`
        unsafe { self.ctx.submit(&mut self.write_cb)? };

        self.phase = Phase::Writing;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;
    use std::time::{Duration, Instant};

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 253) as u8).collect()
    }

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    /// Drive a transfer to completion, polling the way the event loop would
    fn drive(data: &[u8], chunk: usize) -> Vec<u8> {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(data).unwrap();

        let (server, mut client) = socket_pair();
        server.set_nonblocking(true).unwrap();

        let reader = thread::spawn(move || {
            let mut received = Vec::new();
            client.read_to_end(&mut received).unwrap();
            received
        });

        let size = data.len() as u64;
        let mut transfer = AsyncTransfer::new(chunk, size).unwrap();
        assert_eq!(transfer.chunk_size(), chunk.min(data.len()));

        let (f, s) = (file.as_raw_fd(), server.as_raw_fd());
        let mut progress = 0;
        let mut state = transfer.resume(f, s, progress, size).unwrap();

        let deadline = Instant::now() + Duration::from_secs(30);
        while state != Progress::Complete {
            assert!(Instant::now() < deadline, "transfer stalled at {}", progress);
            state = match state {
                Progress::WouldBlock => transfer.resume(f, s, progress, size).unwrap(),
                _ => transfer.on_notify(f, s, &mut progress, size).unwrap(),
            };
            thread::yield_now();
        }
        assert_eq!(progress, size);

        drop(transfer);
        drop(server);
        reader.join().unwrap()
    }

    #[test]
    fn test_transfer_just_under_one_chunk() {
        let data = pattern(4095);
        assert_eq!(drive(&data, 4096), data);
    }

    #[test]
    fn test_transfer_exactly_one_chunk() {
        let data = pattern(4096);
        assert_eq!(drive(&data, 4096), data);
    }

    #[test]
    fn test_transfer_several_chunks_and_remainder() {
        let data = pattern(3 * 4096 + 123);
        assert_eq!(drive(&data, 4096), data);
    }

    #[test]
    fn test_transfer_larger_than_socket_buffer() {
        let data = pattern(8 * 1024 * 1024 + 1);
        assert_eq!(drive(&data, 64 * 1024), data);
    }

    #[test]
    fn test_notify_without_completion_is_pending() {
        let mut transfer = AsyncTransfer::new(16, 16).unwrap();
        let progress = &mut 0;
        assert_eq!(
            transfer.on_notify(-1, -1, progress, 16).unwrap(),
            Progress::Pending
        );
        assert_eq!(transfer.phase, Phase::Idle);
    }
}
