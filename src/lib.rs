//! asyncweb - single-threaded epoll file server
//!
//! Serves files over HTTP/1.0 from one event-loop thread. Two transfer
//! engines share the loop: zero-copy `sendfile` for the static folder and
//! chunked kernel AIO, signalled through an eventfd, for the dynamic folder.

pub mod config;
pub mod http;
pub mod net;
pub mod server;

pub use config::Config;
pub use server::{Server, ShutdownHandle};
