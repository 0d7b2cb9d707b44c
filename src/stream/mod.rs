//! Uniform async byte-oriented streams.
//!
//! Everything the tunnel moves bytes through implements [`ByteStream`]:
//! a plain TCP socket, or a TLS session layered on top of another stream
//! (see [`tls`]). Streams are owned as `Box<dyn ByteStream>` so a protocol
//! upgrade can swap the wrapper without the tunnel caring what is inside.

pub mod tls;

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::Result;

/// Async byte stream with the small surface the tunnel needs.
#[async_trait]
pub trait ByteStream: Send {
    /// Perform any handshake, if the transport has one. No-op for raw TCP.
    async fn handshake(&mut self) -> Result<()>;

    /// Receive up to `max` bytes. An empty buffer signals orderly close.
    async fn recv(&mut self, max: usize) -> Result<Vec<u8>>;

    /// Send the whole buffer or fail.
    async fn sendall(&mut self, data: &[u8]) -> Result<()>;

    /// Address of the real peer behind all layering.
    fn peer_info(&self) -> Result<SocketAddr>;
}

/// Raw TCP variant of [`ByteStream`].
pub struct TcpByteStream {
    stream: TcpStream,
}

impl TcpByteStream {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Open a TCP connection to an already-resolved address.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Ok(Self {
            stream: TcpStream::connect(addr).await?,
        })
    }
}

#[async_trait]
impl ByteStream for TcpByteStream {
    async fn handshake(&mut self) -> Result<()> {
        Ok(())
    }

    async fn recv(&mut self, max: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; max];
        let n = self.stream.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn sendall(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        Ok(())
    }

    fn peer_info(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn recv_returns_empty_on_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpByteStream::connect(addr).await.unwrap();
            stream.sendall(b"ping").await.unwrap();
            stream.recv(16).await.unwrap()
        });

        let (accepted, _) = listener.accept().await.unwrap();
        let mut server = TcpByteStream::new(accepted);
        assert_eq!(server.recv(16).await.unwrap(), b"ping");
        drop(server);

        assert_eq!(client.await.unwrap(), b"");
    }
}
