//! Server configuration
//!
//! Parsed from the command line with environment-variable fallbacks:
//!
//! ```bash
//! asyncweb --port 8888 --document-root ./www --chunk-size 16384
//! AWS_PORT=9000 AWS_DOCUMENT_ROOT=/srv/files asyncweb
//! ```

use crate::net::{self, listener::resolve_addr};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// File server configuration
#[derive(Debug, Clone, Parser)]
#[command(name = "asyncweb")]
#[command(about = "Single-threaded epoll file server with sendfile and kernel AIO transfers")]
#[command(version)]
pub struct Config {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0", env = "AWS_HOST")]
    pub host: String,

    /// TCP port to listen on (0 picks an ephemeral port)
    #[arg(short, long, default_value_t = 8888, env = "AWS_PORT")]
    pub port: u16,

    /// Listen backlog
    #[arg(long, default_value_t = 128, env = "AWS_BACKLOG")]
    pub backlog: i32,

    /// Directory holding the static and dynamic folders
    #[arg(long, default_value = "./", env = "AWS_DOCUMENT_ROOT")]
    pub document_root: PathBuf,

    /// First path segment selecting zero-copy transfers
    #[arg(long, default_value = "static")]
    pub static_folder: String,

    /// First path segment selecting asynchronous chunked transfers
    #[arg(long, default_value = "dynamic")]
    pub dynamic_folder: String,

    /// Extension appended to request paths that contain no dot
    #[arg(long, default_value = "dat")]
    pub extension: String,

    /// Chunk size for asynchronous transfers, in bytes
    #[arg(long, default_value_t = 8192, env = "AWS_CHUNK_SIZE",
          value_parser = clap::value_parser!(u64).range(1..))]
    pub chunk_size: u64,

    /// SO_LINGER timeout applied to accepted sockets, in seconds
    #[arg(long, default_value_t = 1)]
    pub linger_secs: u64,

    /// Close connections idle for this many seconds (0 disables)
    #[arg(long, default_value_t = 0, env = "AWS_IDLE_TIMEOUT")]
    pub idle_timeout_secs: u64,

    /// Maximum readiness events handled per wait
    #[arg(long, default_value_t = 64)]
    pub max_events: usize,
}

impl Config {
    /// Address the listener binds to
    pub fn listen_addr(&self) -> net::Result<SocketAddr> {
        resolve_addr(&self.host, self.port)
    }

    /// Linger applied to accepted sockets
    pub fn linger(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.linger_secs))
    }

    /// Idle eviction threshold, if enabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    /// Chunk size as an in-memory buffer length
    pub fn chunk_len(&self) -> usize {
        usize::try_from(self.chunk_size).unwrap_or(usize::MAX)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "0.0.0.0".to_string(),
            port: 8888,
            backlog: 128,
            document_root: PathBuf::from("./"),
            static_folder: "static".to_string(),
            dynamic_folder: "dynamic".to_string(),
            extension: "dat".to_string(),
            chunk_size: 8192,
            linger_secs: 1,
            idle_timeout_secs: 0,
            max_events: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_empty_command_line() {
        let parsed = Config::try_parse_from(["asyncweb"]).unwrap();
        let default = Config::default();

        assert_eq!(parsed.port, default.port);
        assert_eq!(parsed.backlog, default.backlog);
        assert_eq!(parsed.document_root, default.document_root);
        assert_eq!(parsed.static_folder, default.static_folder);
        assert_eq!(parsed.dynamic_folder, default.dynamic_folder);
        assert_eq!(parsed.extension, default.extension);
        assert_eq!(parsed.chunk_size, default.chunk_size);
        assert_eq!(parsed.idle_timeout(), None);
    }

    #[test]
    fn test_command_line_overrides() {
        let config = Config::try_parse_from([
            "asyncweb",
            "--port",
            "9000",
            "--document-root",
            "/srv",
            "--chunk-size",
            "4096",
            "--idle-timeout-secs",
            "30",
        ])
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.document_root, PathBuf::from("/srv"));
        assert_eq!(config.chunk_len(), 4096);
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(Config::try_parse_from(["asyncweb", "--chunk-size", "0"]).is_err());
    }

    #[test]
    fn test_listen_addr() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Config::default()
        };
        let addr = config.listen_addr().unwrap();
        assert!(addr.ip().is_loopback());
    }
}
