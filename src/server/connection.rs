//! Per-connection state
//!
//! A `Connection` owns everything tied to one accepted socket: the receive
//! buffer, the response head still to be written, the open file, transfer
//! progress and, for dynamic resources, the asynchronous transfer context.
//! The dispatcher moves it through the `State` machine; every resource it
//! owns is released in `teardown`.

use super::async_transfer::AsyncTransfer;
use super::resolver::{Resource, TransferMode};
use super::sendfile::send_static;
use super::table::Id;
use super::{Error, Progress, Result, Source};
use crate::http::{self, Method, ParseStatus, ParserCallbacks, RequestParser, Response};
use crate::net::{self, Interest, Poller};
use bytes::{Buf, Bytes, BytesMut};
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AwaitingRequest,
    RequestParsed,
    SendingHeader,
    SendingBody,
    Closed,
}

impl State {
    fn can_advance_to(self, next: State) -> bool {
        matches!(
            (self, next),
            (State::AwaitingRequest, State::RequestParsed)
                | (State::RequestParsed, State::SendingHeader)
                | (State::SendingHeader, State::SendingBody)
                | (_, State::Closed)
        ) && self != State::Closed
    }
}

/// What the tokenizer reported about the request
#[derive(Debug, Default)]
struct RequestHead {
    method: Option<Method>,
    path: Option<String>,
}

impl ParserCallbacks for RequestHead {
    fn on_method(&mut self, method: Method) {
        self.method = Some(method);
    }

    fn on_path(&mut self, path: &str) {
        self.path = Some(path.to_string());
    }
}

/// One accepted client connection
pub struct Connection {
    id: Id,
    // Dropped before `file` and `stream`
    transfer: Option<AsyncTransfer>,
    file: Option<File>,
    stream: TcpStream,
    peer: SocketAddr,
    state: State,
    interest: Interest,
    recv_buf: BytesMut,
    request: RequestHead,
    header: Bytes,
    header_sent: bool,
    mode: TransferMode,
    payload_size: u64,
    progress: u64,
    last_active: Instant,
}

impl Connection {
    /// Wrap an accepted, already configured socket
    ///
    /// The caller registers the socket for read readiness.
    pub fn new(id: Id, stream: TcpStream, peer: SocketAddr) -> Self {
        Connection {
            id,
            stream,
            peer,
            state: State::AwaitingRequest,
            interest: Interest::READ,
            recv_buf: BytesMut::with_capacity(http::MAX_REQUEST_SIZE),
            request: RequestHead::default(),
            header: Bytes::new(),
            header_sent: false,
            transfer: None,
            file: None,
            mode: TransferMode::NotFound,
            payload_size: 0,
            progress: 0,
            last_active: Instant::now(),
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn payload_size(&self) -> u64 {
        self.payload_size
    }

    pub fn progress(&self) -> u64 {
        self.progress
    }

    pub fn header_sent(&self) -> bool {
        self.header_sent
    }

    pub fn request_method(&self) -> Option<Method> {
        self.request.method
    }

    /// Request path reported by the tokenizer, if any
    pub fn request_path(&self) -> Option<&str> {
        self.request.path.as_deref()
    }

    pub fn socket_fd(&self) -> std::os::fd::RawFd {
        self.stream.as_raw_fd()
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow
    pub fn advance(&mut self, next: State) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Record activity for idle eviction
    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active)
    }

    /// Change the socket's registered interest if it differs
    pub fn set_interest(&mut self, poller: &Poller, interest: Interest) -> net::Result<()> {
        if self.interest != interest {
            poller.reregister(
                self.stream.as_raw_fd(),
                Source::Socket(self.id).token(),
                interest,
            )?;
            self.interest = interest;
        }
        Ok(())
    }

    /// Receive whatever the socket has into the request buffer
    ///
    /// `Ok(0)` means the peer closed the connection. The read is capped so
    /// the buffer never grows past the request size limit.
    pub fn receive(&mut self) -> io::Result<usize> {
        let room = http::MAX_REQUEST_SIZE.saturating_sub(self.recv_buf.len());
        if room == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }

        let start = self.recv_buf.len();
        self.recv_buf.resize(start + room, 0);

        let result = self.stream.read(&mut self.recv_buf[start..]);
        let n = match &result {
            Ok(n) => *n,
            Err(_) => 0,
        };
        self.recv_buf.truncate(start + n);

        result
    }

    /// Run the tokenizer over everything received so far
    pub fn parse_request(&mut self, parser: &RequestParser) -> http::Result<ParseStatus> {
        parser.execute(&self.recv_buf, &mut self.request)
    }

    /// Take ownership of the resolved resource and build the response head
    pub fn prepare_response(&mut self, resource: Resource) -> io::Result<()> {
        let response = Response::for_file(resource.file.as_ref())?;

        self.header = response.head();
        self.header_sent = false;
        self.payload_size = response.payload_size();
        self.progress = 0;
        self.mode = if response.has_body() {
            resource.mode
        } else {
            TransferMode::NotFound
        };
        self.file = resource.file;

        Ok(())
    }

    /// Whether a body follows the head
    pub fn has_body(&self) -> bool {
        self.mode != TransferMode::NotFound
    }

    /// Write the remaining response head
    ///
    /// Returns `Ok(true)` once the whole head is out and `Ok(false)` if the
    /// socket is full.
    pub fn send_header(&mut self) -> io::Result<bool> {
        while self.header.has_remaining() {
            match self.stream.write(self.header.chunk()) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => self.header.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        self.header_sent = true;
        Ok(true)
    }

    /// Whether the dynamic engine still needs its AIO context
    pub fn needs_async_context(&self) -> bool {
        self.mode == TransferMode::Dynamic
            && self.transfer.is_none()
            && self.progress < self.payload_size
    }

    pub fn attach_transfer(&mut self, transfer: AsyncTransfer) {
        self.transfer = Some(transfer);
    }

    /// Drive the body transfer from a write-readiness event
    pub fn pump_body(&mut self) -> net::Result<Progress> {
        if self.progress >= self.payload_size {
            return Ok(Progress::Complete);
        }
        let Some(file) = self.file.as_ref() else {
            return Ok(Progress::Complete);
        };

        match self.mode {
            TransferMode::Static => Ok(send_static(
                &self.stream,
                file,
                &mut self.progress,
                self.payload_size,
            )?),
            TransferMode::Dynamic => match self.transfer.as_mut() {
                Some(transfer) => transfer.resume(
                    file.as_raw_fd(),
                    self.stream.as_raw_fd(),
                    self.progress,
                    self.payload_size,
                ),
                None => Err(net::Error::Aio {
                    op: "resume",
                    source: io::Error::other("transfer context missing"),
                }),
            },
            TransferMode::NotFound => Ok(Progress::Complete),
        }
    }

    /// Drive the body transfer from a completion notification
    pub fn on_completion(&mut self) -> net::Result<Progress> {
        let (Some(file), Some(transfer)) = (self.file.as_ref(), self.transfer.as_mut()) else {
            return Ok(Progress::Pending);
        };

        transfer.on_notify(
            file.as_raw_fd(),
            self.stream.as_raw_fd(),
            &mut self.progress,
            self.payload_size,
        )
    }

    /// Release every resource the connection holds
    ///
    /// Descriptors leave the poller before they are closed; the AIO context
    /// goes before the file and socket its operations reference.
    pub fn teardown(mut self, poller: &Poller) -> net::Result<()> {
        let deregistered = poller.deregister(self.stream.as_raw_fd());

        if let Some(transfer) = self.transfer.take() {
            poller.deregister(transfer.notify_fd())?;
            drop(transfer);
        }
        self.file = None;

        // The peer may already be gone
        let _ = self.stream.shutdown(Shutdown::Both);
        self.state = State::Closed;

        deregistered
    }
}
