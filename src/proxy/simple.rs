//! Fixed-destination proxying: no handshake, every connection is tunneled
//! to the configured remote.

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::{HandshakeOutcome, ProxyProtocol, Target, connect_upstream};
use crate::error::Result;

pub struct SimpleProxy {
    remote: Target,
}

impl SimpleProxy {
    pub fn new(remote: Target) -> Self {
        Self { remote }
    }
}

#[async_trait]
impl ProxyProtocol for SimpleProxy {
    async fn handshake(&self, _client: &mut TcpStream) -> Result<HandshakeOutcome> {
        let upstream = connect_upstream(&self.remote.host, self.remote.port).await?;
        Ok(Some((self.remote.clone(), upstream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::test_util::pair;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn always_connects_to_the_configured_remote() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = upstream.local_addr().unwrap();

        let proxy = SimpleProxy::new(Target::new("127.0.0.1", addr.port()));
        let (mut proxy_side, _client) = pair().await;

        let outcome = proxy.handshake(&mut proxy_side).await.unwrap().unwrap();
        assert_eq!(outcome.0, Target::new("127.0.0.1", addr.port()));
        assert_eq!(outcome.1.peer_addr().unwrap(), addr);
    }
}
