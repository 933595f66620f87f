//! HTTP/1.0 wire pieces for the file server
//!
//! This module holds the parts of HTTP the engine actually touches:
//!
//! - `RequestParser` tokenizes a request head and reports the request path
//!   through `ParserCallbacks`
//! - `Response` selects the fixed status line and records the payload size
//! - `Method`, `Version` and `Status` are the small value types both use
//!
//! No header is ever emitted on a response. A reply is exactly a status
//! line, an empty line, and the raw file bytes.
//!
//! # Examples
//!
//! ```
//! use asyncweb::http::{ParseStatus, ParserCallbacks, RequestParser};
//!
//! #[derive(Default)]
//! struct Path(Option<String>);
//!
//! impl ParserCallbacks for Path {
//!     fn on_path(&mut self, path: &str) {
//!         self.0 = Some(path.to_string());
//!     }
//! }
//!
//! let parser = RequestParser::new();
//! let mut path = Path::default();
//! let status = parser
//!     .execute(b"GET /static/file HTTP/1.0\r\n\r\n", &mut path)
//!     .unwrap();
//!
//! assert!(matches!(status, ParseStatus::Complete { .. }));
//! assert_eq!(path.0.as_deref(), Some("/static/file"));
//! ```

pub mod message;
pub mod parser;
pub mod response;

pub use message::{Method, Status, Version};
pub use parser::{ParseStatus, ParserCallbacks, RequestParser};
pub use response::Response;

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid HTTP version: {0}")]
    InvalidVersion(String),

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),
}

/// Maximum size of a request head the server is willing to buffer
pub const MAX_REQUEST_SIZE: usize = 8192;

/// CRLF line ending
pub const CRLF: &str = "\r\n";

/// Status line sent when the requested resource exists
pub const HTTP_OK: &[u8] = b"HTTP/1.0 200 OK\r\n\r\n";

/// Status line sent when the requested resource does not exist
pub const HTTP_NOT_FOUND: &[u8] = b"HTTP/1.0 404 Not Found\r\n\r\n";
