//! HTTP CONNECT handshake.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::{HandshakeOutcome, ProxyProtocol, Target, connect_upstream};
use crate::error::{Error, Result};

/// Upper bound on the request head; a CONNECT has no reason to be larger.
const MAX_REQUEST: usize = 9000;

const REJECT_RESPONSE: &[u8] = b"HTTP/1.0 405 Invalid Request\r\n\
    Content-Type: text/plain; charset=us-ascii\r\n\
    Content-Length: 31\r\n\
    Connection: Close\r\n\
    \r\n\
    This proxy only allows CONNECT.";

pub struct HttpConnectProxy;

#[async_trait]
impl ProxyProtocol for HttpConnectProxy {
    async fn handshake(&self, client: &mut TcpStream) -> Result<HandshakeOutcome> {
        let Some(head) = read_request_head(client).await? else {
            client.write_all(REJECT_RESPONSE).await?;
            return Ok(None);
        };

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut request = httparse::Request::new(&mut headers);
        let parsed = matches!(request.parse(&head), Ok(httparse::Status::Complete(_)));
        let is_connect = request
            .method
            .map(|m| m.eq_ignore_ascii_case("CONNECT"))
            .unwrap_or(false);
        if !parsed || !is_connect {
            debug!(method = ?request.method, "rejecting non-CONNECT request");
            client.write_all(REJECT_RESPONSE).await?;
            return Ok(None);
        }

        let authority = request
            .path
            .ok_or_else(|| Error::ProxyProtocol("CONNECT without authority".into()))?;
        let (host, port) = split_authority(authority)?;

        let upstream = connect_upstream(&host, port).await?;
        client.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;

        Ok(Some((Target::new(host, port), upstream)))
    }
}

/// Read until the end of the header block, bounded by `MAX_REQUEST`.
///
/// Returns `None` when the cap is reached without a complete head.
async fn read_request_head(client: &mut TcpStream) -> Result<Option<Vec<u8>>> {
    let mut head = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = client.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::ProxyProtocol(
                "client closed before finishing the request".into(),
            ));
        }
        head.extend_from_slice(&chunk[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(Some(head));
        }
        if head.len() >= MAX_REQUEST {
            return Ok(None);
        }
    }
}

/// Split `host:port`, including the `[v6-literal]:port` form.
fn split_authority(authority: &str) -> Result<(String, u16)> {
    let malformed = || Error::ProxyProtocol(format!("malformed CONNECT authority: {authority}"));

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, port) = rest.split_once("]:").ok_or_else(malformed)?;
        (host.to_string(), port)
    } else {
        let (host, port) = authority.rsplit_once(':').ok_or_else(malformed)?;
        (host.to_string(), port)
    };
    let port = port.parse().map_err(|_| malformed())?;
    Ok((host, port))
}
