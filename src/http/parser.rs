//! HTTP request tokenizing
//!
//! The engine only needs the request path, so the parser does not build a
//! request object. It walks the request head and hands each piece to a
//! `ParserCallbacks` implementation. A request is reported complete as soon
//! as its request line has arrived; header lines are optional and HTTP/1.0
//! clients may send none at all.

use super::{Error, Method, Result, Version, CRLF, MAX_REQUEST_SIZE};

/// Find the next CRLF in a buffer
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Find the end of the request head (the empty line)
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse HTTP request line
///
/// Format: METHOD URI VERSION\r\n
/// Example: GET /static/index HTTP/1.0\r\n
pub fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
    let parts: Vec<&str> = line.split_whitespace().collect();

    if parts.len() != 3 {
        return Err(Error::Parse(format!(
            "Invalid request line: expected 3 parts, got {}",
            parts.len()
        )));
    }

    let method = Method::from_str(parts[0])?;
    let uri = parts[1].to_string();
    let version = Version::from_str(parts[2])?;

    Ok((method, uri, version))
}

/// Parse a single header line into name and value
pub fn parse_header_line(line: &str) -> Result<(&str, &str)> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| Error::InvalidHeader(line.to_string()))?;

    let name = name.trim();
    if name.is_empty() {
        return Err(Error::InvalidHeader(line.to_string()));
    }

    Ok((name, value.trim()))
}

/// Split a request target into its path and optional query
///
/// Absolute-form targets (`http://host/path`) are reduced to their path.
fn split_target(uri: &str) -> (&str, Option<&str>) {
    let uri = match uri.split_once("://") {
        Some((_, rest)) => rest.find('/').map_or("", |pos| &rest[pos..]),
        None => uri,
    };
    let uri = uri.split('#').next().unwrap_or_default();

    match uri.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (uri, None),
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decode `%XX` escapes in a request path
pub fn percent_decode(raw: &str) -> Result<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = bytes.get(i + 1).copied().and_then(hex_value);
            let lo = bytes.get(i + 2).copied().and_then(hex_value);
            match (hi, lo) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 3;
                }
                _ => {
                    return Err(Error::Parse(format!("Invalid percent escape in {}", raw)));
                }
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// Callbacks invoked while a request head is tokenized
///
/// Only `on_path` is required. The path is percent-decoded and carries no
/// query string or fragment.
pub trait ParserCallbacks {
    fn on_method(&mut self, _method: Method) {}

    fn on_path(&mut self, path: &str);

    fn on_query(&mut self, _query: &str) {}

    fn on_version(&mut self, _version: Version) {}

    fn on_header(&mut self, _name: &str, _value: &str) {}
}

/// Outcome of feeding bytes to the parser
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// The request head has not fully arrived yet
    Incomplete,
    /// The head was tokenized; `consumed` bytes belong to it
    Complete { consumed: usize },
}

/// HTTP request tokenizer
///
/// The parser keeps no per-request state: callers pass the whole buffer
/// received so far on every call.
#[derive(Debug, Clone)]
pub struct RequestParser {
    max_head: usize,
}

impl RequestParser {
    /// Create a new request parser
    pub fn new() -> Self {
        RequestParser {
            max_head: MAX_REQUEST_SIZE,
        }
    }

    /// Create a parser accepting request heads of up to `max_head` bytes
    pub fn with_max_head(max_head: usize) -> Self {
        RequestParser { max_head }
    }

    /// Tokenize `data`, invoking `callbacks` once the request line is in
    ///
    /// Header lines already received are reported as well; a line that is
    /// not `name: value` is skipped. `consumed` spans the whole head when
    /// its empty line has arrived, otherwise the request line and the
    /// complete header lines after it.
    ///
    /// Returns `Ok(ParseStatus::Incomplete)` while the request line is still
    /// unterminated, or `Err` when it is malformed or outgrows the
    /// configured limit.
    pub fn execute<C>(&self, data: &[u8], callbacks: &mut C) -> Result<ParseStatus>
    where
        C: ParserCallbacks + ?Sized,
    {
        let Some(line_end) = find_crlf(data) else {
            if data.len() >= self.max_head {
                return Err(Error::Parse(format!(
                    "Request line exceeds {} bytes",
                    self.max_head
                )));
            }
            return Ok(ParseStatus::Incomplete);
        };

        let line = String::from_utf8_lossy(&data[..line_end]);
        let (method, uri, version) = parse_request_line(&line)?;
        let (raw_path, query) = split_target(&uri);
        let path = percent_decode(raw_path)?;

        callbacks.on_method(method);
        callbacks.on_path(&path);
        if let Some(query) = query {
            callbacks.on_query(query);
        }
        callbacks.on_version(version);

        let (headers, consumed) = match find_head_end(data) {
            Some(end) => (&data[line_end + 2..end + 2], end + 4),
            None => {
                let last = data
                    .windows(2)
                    .rposition(|w| w == b"\r\n")
                    .unwrap_or(line_end);
                (&data[line_end + 2..last + 2], last + 2)
            }
        };

        let headers = String::from_utf8_lossy(headers);
        for line in headers.split(CRLF).filter(|l| !l.is_empty()) {
            if let Ok((name, value)) = parse_header_line(line) {
                callbacks.on_header(name, value);
            }
        }

        Ok(ParseStatus::Complete { consumed })
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        method: Option<Method>,
        path: Option<String>,
        query: Option<String>,
        version: Option<Version>,
        headers: Vec<(String, String)>,
    }

    impl ParserCallbacks for Recorder {
        fn on_method(&mut self, method: Method) {
            self.method = Some(method);
        }

        fn on_path(&mut self, path: &str) {
            self.path = Some(path.to_string());
        }

        fn on_query(&mut self, query: &str) {
            self.query = Some(query.to_string());
        }

        fn on_version(&mut self, version: Version) {
            self.version = Some(version);
        }

        fn on_header(&mut self, name: &str, value: &str) {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }

    #[test]
    fn test_parse_request_line() {
        let (method, uri, version) = parse_request_line("GET /index.html HTTP/1.1").unwrap();
        assert_eq!(method, Method::Get);
        assert_eq!(uri, "/index.html");
        assert_eq!(version, Version::Http11);

        assert!(parse_request_line("GET  HTTP/1.0").is_err());
        assert!(parse_request_line("").is_err());
    }

    #[test]
    fn test_execute_complete_request() {
        let parser = RequestParser::new();
        let mut rec = Recorder::default();
        let data = b"GET /static/small HTTP/1.0\r\nHost: localhost\r\nUser-Agent: t\r\n\r\n";

        let status = parser.execute(data, &mut rec).unwrap();

        assert_eq!(status, ParseStatus::Complete { consumed: data.len() });
        assert_eq!(rec.method, Some(Method::Get));
        assert_eq!(rec.path.as_deref(), Some("/static/small"));
        assert_eq!(rec.version, Some(Version::Http10));
        assert_eq!(
            rec.headers,
            vec![
                ("Host".to_string(), "localhost".to_string()),
                ("User-Agent".to_string(), "t".to_string()),
            ]
        );
    }

    #[test]
    fn test_execute_incremental() {
        let parser = RequestParser::new();
        let mut rec = Recorder::default();
        let full = b"GET /dynamic/big HTTP/1.0\r\n\r\n";
        let line_len = full.len() - 2;

        for cut in 0..line_len {
            let status = parser.execute(&full[..cut], &mut rec).unwrap();
            assert_eq!(status, ParseStatus::Incomplete);
            assert!(rec.path.is_none());
        }

        let status = parser.execute(&full[..line_len], &mut rec).unwrap();
        assert_eq!(status, ParseStatus::Complete { consumed: line_len });
        assert_eq!(rec.path.as_deref(), Some("/dynamic/big"));

        let status = parser.execute(full, &mut rec).unwrap();
        assert_eq!(status, ParseStatus::Complete { consumed: full.len() });
    }

    #[test]
    fn test_execute_request_line_alone() {
        let parser = RequestParser::new();
        let mut rec = Recorder::default();
        let data = b"GET /static/a HTTP/1.0\r\nHost: localhost\r\nAcc";

        let status = parser.execute(data, &mut rec).unwrap();

        assert_eq!(status, ParseStatus::Complete { consumed: data.len() - 3 });
        assert_eq!(rec.path.as_deref(), Some("/static/a"));
        assert_eq!(
            rec.headers,
            vec![("Host".to_string(), "localhost".to_string())]
        );
    }

    #[test]
    fn test_execute_skips_bad_header_lines() {
        let parser = RequestParser::new();
        let mut rec = Recorder::default();

        let status = parser
            .execute(
                b"GET /static/a HTTP/1.0\r\nno colon here\r\nHost: x\r\n\r\n",
                &mut rec,
            )
            .unwrap();

        assert!(matches!(status, ParseStatus::Complete { .. }));
        assert_eq!(rec.path.as_deref(), Some("/static/a"));
        assert_eq!(rec.headers, vec![("Host".to_string(), "x".to_string())]);
    }

    #[test]
    fn test_execute_strips_query_and_fragment() {
        let parser = RequestParser::new();
        let mut rec = Recorder::default();

        parser
            .execute(b"GET /static/a?x=1#frag HTTP/1.1\r\n\r\n", &mut rec)
            .unwrap();

        assert_eq!(rec.path.as_deref(), Some("/static/a"));
        assert_eq!(rec.query.as_deref(), Some("x=1"));
    }

    #[test]
    fn test_execute_absolute_form() {
        let parser = RequestParser::new();
        let mut rec = Recorder::default();

        parser
            .execute(b"GET http://localhost:8888/static/a HTTP/1.0\r\n\r\n", &mut rec)
            .unwrap();

        assert_eq!(rec.path.as_deref(), Some("/static/a"));
    }

    #[test]
    fn test_execute_percent_decodes_path() {
        let parser = RequestParser::new();
        let mut rec = Recorder::default();

        parser
            .execute(b"GET /static/two%20words HTTP/1.0\r\n\r\n", &mut rec)
            .unwrap();

        assert_eq!(rec.path.as_deref(), Some("/static/two words"));
    }

    #[test]
    fn test_execute_rejects_malformed() {
        let parser = RequestParser::new();
        let mut rec = Recorder::default();

        assert!(parser.execute(b"GET  HTTP/1.0\r\n\r\n", &mut rec).is_err());
        assert!(parser.execute(b"GET /%zz HTTP/1.0\r\n\r\n", &mut rec).is_err());
        assert!(parser.execute(b"garbage\r\n", &mut rec).is_err());
    }

    #[test]
    fn test_execute_head_too_large() {
        let parser = RequestParser::with_max_head(16);
        let mut rec = Recorder::default();

        let result = parser.execute(b"GET /a-very-long-path-indeed", &mut rec);
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("/a%2Fb").unwrap(), "/a/b");
        assert_eq!(percent_decode("/plain").unwrap(), "/plain");
        assert!(percent_decode("/bad%2").is_err());
    }

    #[test]
    fn test_find_crlf() {
        assert_eq!(find_crlf(b"Hello\r\nWorld"), Some(5));
        assert_eq!(find_crlf(b"NoEOL"), None);
        assert_eq!(find_head_end(b"A\r\n\r\n"), Some(1));
        assert_eq!(find_head_end(b"A\r\n"), None);
    }
}
