//! Single-threaded epoll file server
//!
//! One thread multiplexes the listening socket, every client socket and the
//! completion eventfd of every asynchronous transfer through a single epoll
//! instance. Requests under the static folder are answered with `sendfile`;
//! requests under the dynamic folder are streamed in chunks through kernel
//! AIO; everything else gets a bare 404.
//!
//! # Example
//!
//! ```no_run
//! use asyncweb::{Config, Server};
//!
//! let config = Config {
//!     port: 8080,
//!     document_root: "/srv/files".into(),
//!     ..Config::default()
//! };
//!
//! let mut server = Server::bind(config)?;
//! let handle = server.shutdown_handle();
//! std::thread::spawn(move || {
//!     std::thread::sleep(std::time::Duration::from_secs(60));
//!     handle.shutdown().ok();
//! });
//! server.run()?;
//! # Ok::<(), asyncweb::server::Error>(())
//! ```

pub mod async_transfer;
pub mod connection;
pub mod resolver;
pub mod sendfile;
pub mod table;

pub use async_transfer::AsyncTransfer;
pub use connection::{Connection, State};
pub use resolver::{PathResolver, Resolution, Resource, TransferMode};
pub use table::{Id, Table};

use crate::config::Config;
use crate::http::{self, ParseStatus, RequestParser};
use crate::net::{self, configure_stream, tcp_listen, Event, EventFd, Interest, Poller};
use log::{debug, info, trace, warn};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result type for server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Server errors
///
/// Errors reaching the caller of [`Server::run`] are fatal to the whole
/// server. Failures confined to one client are logged and end only that
/// connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Network(#[from] net::Error),

    #[error(transparent)]
    Http(#[from] http::Error),

    #[error("failed to set up asynchronous transfer: {0}")]
    TransferSetup(#[source] net::Error),

    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidTransition { from: State, to: State },

    #[error("connection table full")]
    TableFull,
}

impl Error {
    /// Whether the failure only concerns the connection it happened on
    fn is_connection_local(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Http(_)
                | Error::Network(net::Error::Io(_) | net::Error::Aio { .. })
        )
    }
}

/// Outcome of one step of a body transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Every byte of the payload has been handed to the kernel
    Complete,
    /// The socket buffer is full; wait for write readiness
    WouldBlock,
    /// An asynchronous operation is in flight; wait for its completion
    Pending,
}

const LISTENER_TOKEN: u64 = u64::MAX;
const SHUTDOWN_TOKEN: u64 = u64::MAX - 1;

/// What an epoll token refers to
///
/// Connection tokens pack the slot, generation and a kind bit so that
/// events for a connection closed earlier in the same batch are
/// recognized as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    Listener,
    Shutdown,
    Socket(Id),
    Completion(Id),
}

impl Source {
    pub(crate) fn token(self) -> u64 {
        let pack = |id: Id, kind: u64| {
            (u64::from(id.generation()) << 32) | (u64::from(id.slot()) << 1) | kind
        };

        match self {
            Source::Listener => LISTENER_TOKEN,
            Source::Shutdown => SHUTDOWN_TOKEN,
            Source::Socket(id) => pack(id, 0),
            Source::Completion(id) => pack(id, 1),
        }
    }

    pub(crate) fn from_token(token: u64) -> Self {
        match token {
            LISTENER_TOKEN => Source::Listener,
            SHUTDOWN_TOKEN => Source::Shutdown,
            _ => {
                let id = Id::from_parts((token as u32) >> 1, (token >> 32) as u32);
                if token & 1 == 0 {
                    Source::Socket(id)
                } else {
                    Source::Completion(id)
                }
            }
        }
    }
}

/// Stops a running [`Server`] from another thread
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    notify: Arc<EventFd>,
}

impl ShutdownHandle {
    /// Ask the event loop to close every connection and return
    pub fn shutdown(&self) -> io::Result<()> {
        self.notify.notify()
    }
}

/// Whether a connection survives the step just taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Keep,
    Close,
}

/// The file server
pub struct Server {
    config: Config,
    listener: TcpListener,
    poller: Poller,
    resolver: PathResolver,
    parser: RequestParser,
    connections: Table<Connection>,
    shutdown: Arc<EventFd>,
}

impl Server {
    /// Bind the listening socket and set up the poller
    pub fn bind(config: Config) -> Result<Self> {
        let addr = config.listen_addr()?;
        let listener = tcp_listen(addr, config.backlog)?;

        let poller = Poller::new(config.max_events)?;
        poller.register(listener.as_raw_fd(), LISTENER_TOKEN, Interest::READ)?;

        let shutdown = Arc::new(EventFd::new()?);
        poller.register(shutdown.as_raw_fd(), SHUTDOWN_TOKEN, Interest::READ)?;

        if !config.document_root.is_dir() {
            warn!(
                "document root {} is not a directory",
                config.document_root.display()
            );
        }

        Ok(Server {
            resolver: PathResolver::from_config(&config),
            parser: RequestParser::new(),
            connections: Table::with_capacity(config.max_events),
            listener,
            poller,
            shutdown,
            config,
        })
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            notify: Arc::clone(&self.shutdown),
        }
    }

    /// Number of open client connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Run the event loop until shut down or a fatal error occurs
    pub fn run(&mut self) -> Result<()> {
        info!(
            "serving {} on {}",
            self.resolver.root().display(),
            self.local_addr()?
        );

        let idle_timeout = self.config.idle_timeout();
        let wait_timeout = idle_timeout.map(|t| (t / 2).max(Duration::from_millis(100)));
        let mut events = Vec::with_capacity(self.config.max_events);

        loop {
            self.poller.wait(&mut events, wait_timeout)?;

            for event in &events {
                match Source::from_token(event.token) {
                    Source::Listener => self.accept_connections()?,
                    Source::Shutdown => {
                        self.shutdown.drain()?;
                        info!(
                            "shutting down, closing {} connections",
                            self.connections.len()
                        );
                        self.close_all()?;
                        return Ok(());
                    }
                    Source::Socket(id) => self.on_socket_event(id, event)?,
                    Source::Completion(id) => self.on_completion(id)?,
                }
            }

            if let Some(limit) = idle_timeout {
                self.evict_idle(limit)?;
            }
        }
    }

    fn accept_connections(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.add_connection(stream, peer)?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn add_connection(&mut self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        if let Err(e) = configure_stream(&stream, self.config.linger()) {
            warn!("dropping connection from {}: {}", peer, e);
            return Ok(());
        }

        let fd = stream.as_raw_fd();
        let id = self
            .connections
            .insert_with(|id| Connection::new(id, stream, peer))
            .ok_or(Error::TableFull)?;
        self.poller
            .register(fd, Source::Socket(id).token(), Interest::READ)?;

        info!("accepted {} as {:?}", peer, id);
        Ok(())
    }

    fn on_socket_event(&mut self, id: Id, event: &Event) -> Result<()> {
        let Some(conn) = self.connections.get_mut(id) else {
            trace!("stale socket event for {:?}", id);
            return Ok(());
        };
        conn.touch();

        let step = if event.error || (event.hangup && !event.readable) {
            info!("{} went away in state {:?}", conn.peer(), conn.state());
            Ok(Flow::Close)
        } else {
            Self::drive(
                conn,
                event,
                &self.poller,
                &self.parser,
                &self.resolver,
                self.config.chunk_len(),
            )
        };

        self.settle(id, step)
    }

    fn on_completion(&mut self, id: Id) -> Result<()> {
        let Some(conn) = self.connections.get_mut(id) else {
            trace!("stale completion for {:?}", id);
            return Ok(());
        };
        conn.touch();

        let step = conn
            .on_completion()
            .map_err(Error::from)
            .and_then(|progress| Self::after_progress(conn, &self.poller, progress));

        self.settle(id, step)
    }

    /// Close the connection if the step ended it, propagate fatal errors
    fn settle(&mut self, id: Id, step: Result<Flow>) -> Result<()> {
        match step {
            Ok(Flow::Keep) => Ok(()),
            Ok(Flow::Close) => self.close(id),
            Err(e) if e.is_connection_local() => {
                if let Some(conn) = self.connections.get(id) {
                    warn!("closing {} after error: {}", conn.peer(), e);
                }
                self.close(id)
            }
            Err(e) => Err(e),
        }
    }

    /// Advance one connection on socket readiness
    fn drive(
        conn: &mut Connection,
        event: &Event,
        poller: &Poller,
        parser: &RequestParser,
        resolver: &PathResolver,
        chunk_len: usize,
    ) -> Result<Flow> {
        match conn.state() {
            State::AwaitingRequest if event.readable => {
                Self::on_readable(conn, poller, parser, resolver)
            }
            State::SendingHeader | State::SendingBody if event.writable => {
                Self::on_writable(conn, poller, chunk_len)
            }
            _ => Ok(Flow::Keep),
        }
    }

    fn on_readable(
        conn: &mut Connection,
        poller: &Poller,
        parser: &RequestParser,
        resolver: &PathResolver,
    ) -> Result<Flow> {
        let mut peer_closed = false;
        loop {
            match conn.receive() {
                Ok(0) => {
                    peer_closed = true;
                    break;
                }
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // Buffer full; the parser rejects the oversized head
                Err(e) if e.kind() == io::ErrorKind::InvalidData => break,
                Err(e) => return Err(e.into()),
            }
        }

        let resource = match conn.parse_request(parser) {
            Ok(ParseStatus::Incomplete) if peer_closed => return Ok(Flow::Close),
            Ok(ParseStatus::Incomplete) => return Ok(Flow::Keep),
            Ok(ParseStatus::Complete { .. }) => {
                let path = conn.request_path().unwrap_or("");
                let resource = resolver.open(path);
                info!(
                    "{} {} {} -> {:?}",
                    conn.peer(),
                    conn.request_method().map_or("-", |m| m.as_str()),
                    path,
                    resource.mode
                );
                resource
            }
            Err(e) => {
                debug!("{} sent a bad request: {}", conn.peer(), e);
                Resource {
                    mode: TransferMode::NotFound,
                    file: None,
                }
            }
        };

        conn.advance(State::RequestParsed)?;
        conn.prepare_response(resource)?;
        conn.advance(State::SendingHeader)?;
        conn.set_interest(poller, Interest::WRITE)?;

        Ok(Flow::Keep)
    }

    fn on_writable(conn: &mut Connection, poller: &Poller, chunk_len: usize) -> Result<Flow> {
        if conn.state() == State::SendingHeader {
            if !conn.send_header()? {
                return Ok(Flow::Keep);
            }
            if !conn.has_body() {
                return Ok(Flow::Close);
            }
            conn.advance(State::SendingBody)?;
        }

        if conn.needs_async_context() {
            let transfer = AsyncTransfer::new(chunk_len, conn.payload_size())
                .map_err(Error::TransferSetup)?;
            poller.register(
                transfer.notify_fd(),
                Source::Completion(conn.id()).token(),
                Interest::READ,
            )?;
            trace!(
                "{} streaming {} bytes in chunks of {}",
                conn.peer(),
                conn.payload_size(),
                transfer.chunk_size()
            );
            conn.attach_transfer(transfer);
        }

        let progress = conn.pump_body()?;
        Self::after_progress(conn, poller, progress)
    }

    /// Re-arm the socket for whatever the transfer waits on next
    fn after_progress(conn: &mut Connection, poller: &Poller, progress: Progress) -> Result<Flow> {
        match progress {
            Progress::Complete => {
                debug!(
                    "{} sent {} of {} bytes",
                    conn.peer(),
                    conn.progress(),
                    conn.payload_size()
                );
                Ok(Flow::Close)
            }
            Progress::WouldBlock => {
                conn.set_interest(poller, Interest::WRITE)?;
                Ok(Flow::Keep)
            }
            // Hang-up and error are still reported with no interest set
            Progress::Pending => {
                conn.set_interest(poller, Interest::NONE)?;
                Ok(Flow::Keep)
            }
        }
    }

    fn close(&mut self, id: Id) -> Result<()> {
        let Some(conn) = self.connections.remove(id) else {
            return Ok(());
        };

        trace!("closing {} ({:?})", conn.peer(), id);
        conn.teardown(&self.poller)?;
        Ok(())
    }

    fn close_all(&mut self) -> Result<()> {
        for id in self.connections.ids() {
            self.close(id)?;
        }
        Ok(())
    }

    fn evict_idle(&mut self, limit: Duration) -> Result<()> {
        let now = Instant::now();
        for id in self.connections.ids() {
            let idle = match self.connections.get(id) {
                Some(conn) if conn.idle_for(now) >= limit => conn.peer(),
                _ => continue,
            };
            info!("closing idle connection from {}", idle);
            self.close(id)?;
        }
        Ok(())
    }
}
