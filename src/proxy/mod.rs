//! Proxy-side handshakes: how a client tells the proxy where to connect.
//!
//! Each protocol consumes the client's opening bytes, opens the upstream
//! connection and answers on the wire. A malformed or unsupported request is
//! answered with the protocol's own rejection message and reported as the
//! `None` sentinel so the caller tears the connection down without treating
//! it as an error.

pub mod http;
pub mod simple;
pub mod socks;

pub use http::HttpConnectProxy;
pub use simple::SimpleProxy;
pub use socks::SocksProxy;

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::error::{Error, Result};

/// Destination requested through the proxy handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// `None` is the rejection sentinel: the client has been answered and no
/// tunnel must be started.
pub type HandshakeOutcome = Option<(Target, TcpStream)>;

#[async_trait]
pub trait ProxyProtocol: Send + Sync {
    /// Run the proxy handshake on an accepted connection.
    async fn handshake(&self, client: &mut TcpStream) -> Result<HandshakeOutcome>;
}

/// Resolve a host (IP literal or DNS name) to the first usable address.
pub(crate) async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::Resolution(format!("{host}: {e}")))?;
    addrs
        .next()
        .ok_or_else(|| Error::Resolution(host.to_string()))
}

/// Resolve and open the upstream connection.
pub(crate) async fn connect_upstream(host: &str, port: u16) -> Result<TcpStream> {
    let addr = resolve(host, port).await?;
    Ok(TcpStream::connect(addr).await?)
}

#[cfg(test)]
pub(crate) mod test_util {
    use tokio::net::{TcpListener, TcpStream};

    /// A connected loopback socket pair: (accepted side, connecting side).
    pub(crate) async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, connected) = tokio::join!(listener.accept(), TcpStream::connect(addr));
        (accepted.unwrap().0, connected.unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_parses_literals_without_dns() {
        let addr = resolve("192.0.2.7", 80).await.unwrap();
        assert_eq!(addr.to_string(), "192.0.2.7:80");
        let addr = resolve("::1", 443).await.unwrap();
        assert_eq!(addr.to_string(), "[::1]:443");
    }

    #[tokio::test]
    async fn resolve_reports_unknown_names() {
        let err = resolve("does-not-exist.invalid", 80).await.unwrap_err();
        assert!(matches!(err, Error::Resolution(_)));
    }

    #[test]
    fn target_displays_host_and_port() {
        assert_eq!(Target::new("example.com", 443).to_string(), "example.com:443");
    }
}
