//! SOCKS4, SOCKS4a and SOCKS5 handshakes on one port.
//!
//! The variant is picked from the first byte of the request. Only TCP
//! CONNECT is supported; everything else is answered with the matching
//! rejection code.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::{HandshakeOutcome, ProxyProtocol, Target, connect_upstream, resolve};
use crate::error::{Error, Result};

const SOCKS4_CMD_CONNECT: u8 = 0x01;
const SOCKS4_SUCCESS: u8 = 0x5a;
const SOCKS4_REJECT: u8 = 0x5b;

const SOCKS5_METHOD_NO_AUTH: u8 = 0x00;
const SOCKS5_CMD_CONNECT: u8 = 0x01;
const SOCKS5_SUCCESS: u8 = 0x00;
const SOCKS5_ERULES: u8 = 0x02;
const SOCKS5_EPROTOCOL: u8 = 0x07;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Longest NUL-terminated field (user id or hostname) we accept.
const MAX_FIELD: usize = 255;

pub struct SocksProxy;

#[async_trait]
impl ProxyProtocol for SocksProxy {
    async fn handshake(&self, client: &mut TcpStream) -> Result<HandshakeOutcome> {
        match client.read_u8().await? {
            0x04 => self.socks4(client).await,
            0x05 => self.socks5(client).await,
            version => {
                debug!(version, "unknown SOCKS version");
                send_socks4_reject(client).await?;
                Ok(None)
            }
        }
    }
}

impl SocksProxy {
    async fn socks4(&self, client: &mut TcpStream) -> Result<HandshakeOutcome> {
        let command = client.read_u8().await?;
        if command != SOCKS4_CMD_CONNECT {
            send_socks4_reject(client).await?;
            return Ok(None);
        }

        let port = client.read_u16().await?;
        let mut raw_ip = [0u8; 4];
        client.read_exact(&mut raw_ip).await?;
        let _user_id = read_until_nul(client).await?;

        // A 0.0.0.x destination marks SOCKS4a: the real hostname follows
        // the user id.
        let host = if raw_ip[0] == 0 && raw_ip[1] == 0 && raw_ip[2] == 0 {
            let name = read_until_nul(client).await?;
            String::from_utf8(name)
                .map_err(|_| Error::ProxyProtocol("SOCKS4a hostname is not UTF-8".into()))?
        } else {
            Ipv4Addr::from(raw_ip).to_string()
        };

        let upstream = connect_upstream(&host, port).await?;
        let local = upstream.local_addr()?;

        let mut reply = vec![0x00, SOCKS4_SUCCESS];
        reply.extend_from_slice(&local.port().to_be_bytes());
        match local.ip() {
            IpAddr::V4(v4) => reply.extend_from_slice(&v4.octets()),
            IpAddr::V6(_) => reply.extend_from_slice(&[0, 0, 0, 0]),
        }
        client.write_all(&reply).await?;

        Ok(Some((Target::new(host, port), upstream)))
    }

    async fn socks5(&self, client: &mut TcpStream) -> Result<HandshakeOutcome> {
        let method_count = client.read_u8().await? as usize;
        let mut methods = vec![0u8; method_count];
        client.read_exact(&mut methods).await?;

        if !methods.contains(&SOCKS5_METHOD_NO_AUTH) {
            client.write_all(&[0x05, 0xff]).await?;
            return Ok(None);
        }
        client.write_all(&[0x05, SOCKS5_METHOD_NO_AUTH]).await?;

        if client.read_u8().await? != 0x05 {
            client
                .write_all(&[0x05, SOCKS5_EPROTOCOL, SOCKS5_EPROTOCOL])
                .await?;
            return Ok(None);
        }
        let command = client.read_u8().await?;
        if command != SOCKS5_CMD_CONNECT {
            client
                .write_all(&[0x05, SOCKS5_ERULES, SOCKS5_EPROTOCOL])
                .await?;
            return Ok(None);
        }
        let _reserved = client.read_u8().await?;

        enum Destination {
            Ip(IpAddr),
            Domain(String),
        }

        let destination = match client.read_u8().await? {
            ATYP_IPV4 => {
                let mut raw = [0u8; 4];
                client.read_exact(&mut raw).await?;
                Destination::Ip(Ipv4Addr::from(raw).into())
            }
            ATYP_DOMAIN => {
                let len = client.read_u8().await? as usize;
                let mut raw = vec![0u8; len];
                client.read_exact(&mut raw).await?;
                Destination::Domain(String::from_utf8(raw).map_err(|_| {
                    Error::ProxyProtocol("SOCKS5 domain is not UTF-8".into())
                })?)
            }
            ATYP_IPV6 => {
                let mut raw = [0u8; 16];
                client.read_exact(&mut raw).await?;
                Destination::Ip(Ipv6Addr::from(raw).into())
            }
            _ => {
                client
                    .write_all(&[0x05, SOCKS5_ERULES, SOCKS5_EPROTOCOL])
                    .await?;
                return Ok(None);
            }
        };
        let port = client.read_u16().await?;

        let host = match destination {
            Destination::Ip(ip) => ip.to_string(),
            Destination::Domain(name) => resolve(&name, port).await?.ip().to_string(),
        };

        let upstream = connect_upstream(&host, port).await?;
        let local = upstream.local_addr()?;

        let mut reply = vec![0x05, SOCKS5_SUCCESS, 0x00];
        match local.ip() {
            IpAddr::V4(v4) => {
                reply.push(ATYP_IPV4);
                reply.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                reply.push(ATYP_IPV6);
                reply.extend_from_slice(&v6.octets());
            }
        }
        reply.extend_from_slice(&local.port().to_be_bytes());
        client.write_all(&reply).await?;

        Ok(Some((Target::new(host, port), upstream)))
    }
}

async fn send_socks4_reject(client: &mut TcpStream) -> Result<()> {
    // Version, reject code, then six bytes the client must ignore.
    client
        .write_all(&[0x00, SOCKS4_REJECT, 0x00, 0x00, 0xff, 0xff, 0xff, 0xff])
        .await?;
    Ok(())
}

async fn read_until_nul(client: &mut TcpStream) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let byte = client.read_u8().await?;
        if byte == 0 {
            return Ok(out);
        }
        out.push(byte);
        if out.len() > MAX_FIELD {
            return Err(Error::ProxyProtocol(
                "unterminated SOCKS4 request field".into(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::test_util::pair;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn socks5_connect_to_ipv4_literal() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();

        let (mut proxy_side, mut client) = pair().await;
        let handshake =
            tokio::spawn(async move { SocksProxy.handshake(&mut proxy_side).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut select = [0u8; 2];
        client.read_exact(&mut select).await.unwrap();
        assert_eq!(select, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        request.extend_from_slice(&upstream_port.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);

        let outcome = handshake.await.unwrap().unwrap().unwrap();
        assert_eq!(outcome.0, Target::new("127.0.0.1", upstream_port));
        assert_eq!(
            outcome.1.peer_addr().unwrap(),
            upstream.local_addr().unwrap()
        );
    }

    #[tokio::test]
    async fn socks5_without_no_auth_is_rejected() {
        let (mut proxy_side, mut client) = pair().await;
        let handshake =
            tokio::spawn(async move { SocksProxy.handshake(&mut proxy_side).await });

        // Only GSSAPI and username/password on offer.
        client.write_all(&[0x05, 0x02, 0x01, 0x02]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xff]);

        assert!(handshake.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn socks5_bind_is_rejected() {
        let (mut proxy_side, mut client) = pair().await;
        let handshake =
            tokio::spawn(async move { SocksProxy.handshake(&mut proxy_side).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut select = [0u8; 2];
        client.read_exact(&mut select).await.unwrap();

        client
            .write_all(&[0x05, 0x03, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();
        let mut reply = [0u8; 3];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x02, 0x07]);

        assert!(handshake.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn socks4_connect_to_ipv4_literal() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();

        let (mut proxy_side, mut client) = pair().await;
        let handshake =
            tokio::spawn(async move { SocksProxy.handshake(&mut proxy_side).await });

        let mut request = vec![0x04, 0x01];
        request.extend_from_slice(&upstream_port.to_be_bytes());
        request.extend_from_slice(&[127, 0, 0, 1]);
        request.extend_from_slice(b"user\x00");
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], 0x00);
        assert_eq!(reply[1], SOCKS4_SUCCESS);

        let outcome = handshake.await.unwrap().unwrap().unwrap();
        assert_eq!(outcome.0, Target::new("127.0.0.1", upstream_port));
    }

    #[tokio::test]
    async fn socks4a_resolves_the_trailing_hostname() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();

        let (mut proxy_side, mut client) = pair().await;
        let handshake =
            tokio::spawn(async move { SocksProxy.handshake(&mut proxy_side).await });

        let mut request = vec![0x04, 0x01];
        request.extend_from_slice(&upstream_port.to_be_bytes());
        request.extend_from_slice(&[0, 0, 0, 0x7f]); // 0.0.0.127 → SOCKS4a
        request.extend_from_slice(b"user\x00");
        request.extend_from_slice(b"localhost\x00");
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], SOCKS4_SUCCESS);

        let outcome = handshake.await.unwrap().unwrap().unwrap();
        assert_eq!(outcome.0, Target::new("localhost", upstream_port));
    }

    #[tokio::test]
    async fn socks4_non_connect_command_is_rejected() {
        let (mut proxy_side, mut client) = pair().await;
        let handshake =
            tokio::spawn(async move { SocksProxy.handshake(&mut proxy_side).await });

        client.write_all(&[0x04, 0x02]).await.unwrap();
        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], SOCKS4_REJECT);

        assert!(handshake.await.unwrap().unwrap().is_none());
    }
}
