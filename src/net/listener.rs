//! Listening socket setup and per-connection socket options

use super::{Error, Result};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Resolve `host:port` to the first matching socket address
pub fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::InvalidAddress(format!("{}:{}: {}", host, port, e)))?
        .next()
        .ok_or_else(|| Error::InvalidAddress(format!("{}:{}", host, port)))
}

/// Create a non-blocking listening socket bound to `addr`
pub fn tcp_listen(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

/// Prepare an accepted socket for the event loop
///
/// The socket becomes non-blocking, Nagle's algorithm is disabled, and a
/// close lingers for at most `linger` to flush unsent data.
pub fn configure_stream(stream: &TcpStream, linger: Option<Duration>) -> io::Result<()> {
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)?;

    let sock = SockRef::from(stream);
    sock.set_linger(linger)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_tcp_listen_ephemeral() {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        let listener = tcp_listen(addr, 16).unwrap();
        let local = listener.local_addr().unwrap();
        assert_ne!(local.port(), 0);

        // Non-blocking: nothing pending yet
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_configure_stream() {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        let listener = tcp_listen(addr, 16).unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        configure_stream(&client, Some(Duration::from_secs(1))).unwrap();

        assert!(client.nodelay().unwrap());
        let sock = SockRef::from(&client);
        assert_eq!(sock.linger().unwrap(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_resolve_addr() {
        let addr = resolve_addr("127.0.0.1", 8888).unwrap();
        assert_eq!(addr, SocketAddr::from((Ipv4Addr::LOCALHOST, 8888)));
        assert!(resolve_addr("not an address", 1).is_err());
    }
}
