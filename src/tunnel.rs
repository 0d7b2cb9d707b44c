//! Bidirectional copy with in-band protocol upgrades.
//!
//! Two cooperating loops copy client→server and server→client. Each
//! direction holds its own token while reading-and-forwarding; the bounded
//! read guarantees the token is released at least every 20 ms, which bounds
//! how long an upgrade waits to grab the opposite token. While an upgrade
//! runs, both tokens are held, so neither stream is touched by anyone else
//! and the pair can be swapped atomically.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::app::ApplicationProtocol;
use crate::error::Result;
use crate::pcap::PacketWriter;
use crate::stream::ByteStream;

/// Upper bound on one forwarded chunk.
const MAX_CHUNK: usize = 9000;

/// The heartbeat: how long a direction may sit in a read while holding its
/// token.
const READ_TIMEOUT: Duration = Duration::from_millis(20);

type StreamSlot = Mutex<Option<Box<dyn ByteStream>>>;

pub struct Tunnel {
    active: AtomicBool,
    protocol_depth: AtomicU32,
    maximum_protocol_depth: u32,
    client: StreamSlot,
    server: StreamSlot,
    client_to_server: Mutex<()>,
    server_to_client: Mutex<()>,
    protocols: Arc<Vec<Box<dyn ApplicationProtocol>>>,
    packets: std::sync::Mutex<PacketWriter>,
}

impl Tunnel {
    pub fn new(
        client: Box<dyn ByteStream>,
        server: Box<dyn ByteStream>,
        protocols: Arc<Vec<Box<dyn ApplicationProtocol>>>,
        maximum_protocol_depth: u32,
        packets: PacketWriter,
    ) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicBool::new(true),
            protocol_depth: AtomicU32::new(0),
            maximum_protocol_depth,
            client: Mutex::new(Some(client)),
            server: Mutex::new(Some(server)),
            client_to_server: Mutex::new(()),
            server_to_client: Mutex::new(()),
            protocols,
            packets: std::sync::Mutex::new(packets),
        })
    }

    /// Start both copy loops as independent tasks.
    pub fn schedule(self: &Arc<Self>) {
        tokio::spawn(Arc::clone(self).communicate_client_to_server());
        tokio::spawn(Arc::clone(self).communicate_server_to_client());
    }

    /// Run both copy loops to completion.
    pub async fn run(self: Arc<Self>) {
        let c2s = tokio::spawn(Arc::clone(&self).communicate_client_to_server());
        let s2c = tokio::spawn(Arc::clone(&self).communicate_server_to_client());
        let _ = c2s.await;
        let _ = s2c.await;
    }

    async fn communicate_client_to_server(self: Arc<Self>) {
        while self.active.load(Ordering::Relaxed) {
            let _token = self.client_to_server.lock().await;

            let data = match self.bounded_read(&self.client).await {
                ReadOutcome::Timeout => continue,
                ReadOutcome::Data(data) => data,
                ReadOutcome::Failed => break,
            };
            if data.is_empty() {
                break;
            }

            // Upgrades are only triggered by the client side; the first
            // packet of a wrapped protocol is sent by whoever opens it.
            if self.protocol_depth.load(Ordering::Relaxed) < self.maximum_protocol_depth {
                if let Some(protocol) =
                    self.protocols.iter().find(|p| p.is_protocol_packet(&data))
                {
                    match self.upgrade(protocol.as_ref(), &data).await {
                        Ok(()) => continue, // the chunk now lives in the wrapper
                        Err(e) => {
                            error!(protocol = protocol.name(), "upgrade failed: {e}");
                            break;
                        }
                    }
                }
            }

            if !self.forward(&self.server, &data).await {
                break;
            }
            if self.protocol_depth.load(Ordering::Relaxed) > 0 {
                debug!("↑ {} bytes", data.len());
            }
            self.packets.lock().unwrap().client(&data);
        }

        self.active.store(false, Ordering::Relaxed);
        // Dropping the stream closes the socket; take() makes it happen once.
        self.client.lock().await.take();
    }

    async fn communicate_server_to_client(self: Arc<Self>) {
        while self.active.load(Ordering::Relaxed) {
            let _token = self.server_to_client.lock().await;

            let data = match self.bounded_read(&self.server).await {
                ReadOutcome::Timeout => continue,
                ReadOutcome::Data(data) => data,
                ReadOutcome::Failed => break,
            };
            if data.is_empty() {
                break;
            }

            if !self.forward(&self.client, &data).await {
                break;
            }
            if self.protocol_depth.load(Ordering::Relaxed) > 0 {
                debug!("↓ {} bytes", data.len());
            }
            self.packets.lock().unwrap().server(&data);
        }

        self.active.store(false, Ordering::Relaxed);
        self.server.lock().await.take();
    }

    /// One bounded-timeout read from a stream slot.
    async fn bounded_read(&self, slot: &StreamSlot) -> ReadOutcome {
        let mut guard = slot.lock().await;
        let Some(stream) = guard.as_mut() else {
            self.active.store(false, Ordering::Relaxed);
            return ReadOutcome::Failed;
        };
        match timeout(READ_TIMEOUT, stream.recv(MAX_CHUNK)).await {
            Err(_) => ReadOutcome::Timeout,
            Ok(Ok(data)) => ReadOutcome::Data(data),
            Ok(Err(e)) => {
                debug!("read failed, tearing down tunnel: {e}");
                self.active.store(false, Ordering::Relaxed);
                ReadOutcome::Failed
            }
        }
    }

    async fn forward(&self, slot: &StreamSlot, data: &[u8]) -> bool {
        let mut guard = slot.lock().await;
        let Some(stream) = guard.as_mut() else {
            self.active.store(false, Ordering::Relaxed);
            return false;
        };
        match stream.sendall(data).await {
            Ok(()) => true,
            Err(e) => {
                debug!("write failed, tearing down tunnel: {e}");
                self.active.store(false, Ordering::Relaxed);
                false
            }
        }
    }

    /// Swap both streams for wrapped ones. The caller already holds the
    /// client→server token; taking the other one stops all forwarding for
    /// the duration.
    async fn upgrade(&self, protocol: &dyn ApplicationProtocol, packet: &[u8]) -> Result<()> {
        let _other_token = self.server_to_client.lock().await;

        let client = self.client.lock().await.take();
        let server = self.server.lock().await.take();
        let (Some(client), Some(server)) = (client, server) else {
            self.active.store(false, Ordering::Relaxed);
            return Ok(());
        };

        let (new_client, new_server) = match protocol.wrap_connection(packet, client, server).await
        {
            Ok(streams) => streams,
            Err(e) => {
                // The old streams were consumed; the tunnel is over either way.
                self.active.store(false, Ordering::Relaxed);
                return Err(e);
            }
        };

        *self.client.lock().await = Some(new_client);
        *self.server.lock().await = Some(new_server);
        let depth = self.protocol_depth.fetch_add(1, Ordering::Relaxed) + 1;
        info!(protocol = protocol.name(), depth, "connection wrapped");
        Ok(())
    }
}

enum ReadOutcome {
    Timeout,
    Data(Vec<u8>),
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::TlsProtocol;
    use crate::cert::{SelfSignedCertificates, test_certificates};
    use crate::pcap::PcapSink;
    use crate::proxy::test_util::pair;
    use crate::stream::TcpByteStream;
    use crate::stream::tls::{TlsByteStream, insecure_client_config};
    use rustls::ServerConfig;
    use rustls::pki_types::ServerName;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const TEST_TIMEOUT: Duration = Duration::from_secs(120);

    fn tunnel_parts(
        protocols: Vec<Box<dyn ApplicationProtocol>>,
        client: tokio::net::TcpStream,
        server: tokio::net::TcpStream,
        sink: Arc<PcapSink>,
    ) -> Arc<Tunnel> {
        let writer = PacketWriter::new(
            client.peer_addr().unwrap(),
            server.peer_addr().unwrap(),
            sink,
        );
        Tunnel::new(
            Box::new(TcpByteStream::new(client)),
            Box::new(TcpByteStream::new(server)),
            Arc::new(protocols),
            1,
            writer,
        )
    }

    #[tokio::test]
    async fn forwards_both_directions_and_records_chunks() {
        let (tunnel_client, mut client) = pair().await;
        let (tunnel_server, mut upstream) = pair().await;
        let sink = Arc::new(PcapSink::new());

        let tunnel = tunnel_parts(Vec::new(), tunnel_client, tunnel_server, sink.clone());
        let running = tokio::spawn(tunnel.run());

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        upstream.write_all(b"world").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        drop(client);
        drop(upstream);
        timeout(TEST_TIMEOUT, running).await.unwrap().unwrap();

        let captured = sink.drain();
        assert!(!captured.is_empty());
        let as_bytes = |needle: &[u8]| {
            captured
                .windows(needle.len())
                .any(|window| window == needle)
        };
        assert!(as_bytes(b"hello"));
        assert!(as_bytes(b"world"));
    }

    #[tokio::test]
    async fn early_close_leaves_an_empty_capture() {
        let (tunnel_client, client) = pair().await;
        let (tunnel_server, _upstream) = pair().await;
        let sink = Arc::new(PcapSink::new());

        let tunnel = tunnel_parts(Vec::new(), tunnel_client, tunnel_server, sink.clone());
        let running = tokio::spawn(tunnel.run());

        drop(client);
        timeout(TEST_TIMEOUT, running).await.unwrap().unwrap();

        // No data was forwarded, so not even the synthetic handshake exists.
        assert!(sink.drain().is_empty());
    }

    /// The full interception path: a TLS client connects through the tunnel,
    /// the tunnel swaps in wrapped streams mid-flight, and the capture ends
    /// up holding the decrypted request.
    #[tokio::test]
    async fn intercepts_tls_and_captures_cleartext() {
        let certs = test_certificates();

        let (tunnel_client, client_raw) = pair().await;
        let (tunnel_server, upstream_raw) = pair().await;
        let sink = Arc::new(PcapSink::new());

        let protocols: Vec<Box<dyn ApplicationProtocol>> =
            vec![Box::new(TlsProtocol::new(certs.clone(), "ALL"))];
        let tunnel = tunnel_parts(protocols, tunnel_client, tunnel_server, sink.clone());
        let running = tokio::spawn(tunnel.run());

        // Real upstream: a TLS server expecting our intercepted session.
        let upstream_certs = certs.clone();
        let upstream_task = tokio::spawn(async move {
            let path = upstream_certs.get_certificate("upstream.test").unwrap();
            let (chain, key) =
                SelfSignedCertificates::load_bundle(&path, upstream_certs.get_password())
                    .unwrap();
            let config = ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(chain, key)
                .unwrap();
            let mut tls =
                TlsByteStream::server(Box::new(TcpByteStream::new(upstream_raw)), config)
                    .unwrap();
            tls.handshake().await.unwrap();
            assert_eq!(tls.recv(64).await.unwrap(), b"GET /secret");
            tls.sendall(b"nothing here").await.unwrap();
            let _ = tls.recv(64).await;
        });

        let client_task = tokio::spawn(async move {
            let mut tls = TlsByteStream::client(
                Box::new(TcpByteStream::new(client_raw)),
                insecure_client_config(),
                ServerName::try_from("upstream.test").unwrap(),
            )
            .unwrap();
            tls.handshake().await.unwrap();
            tls.sendall(b"GET /secret").await.unwrap();
            assert_eq!(tls.recv(64).await.unwrap(), b"nothing here");
            let _ = tls.close().await.unwrap();
        });

        timeout(TEST_TIMEOUT, client_task).await.unwrap().unwrap();
        timeout(TEST_TIMEOUT, upstream_task).await.unwrap().unwrap();
        timeout(TEST_TIMEOUT, running).await.unwrap().unwrap();

        let captured = sink.drain();
        let contains = |needle: &[u8]| {
            captured
                .windows(needle.len())
                .any(|window| window == needle)
        };
        // The capture holds the decrypted bytes, not TLS records.
        assert!(contains(b"GET /secret"));
        assert!(contains(b"nothing here"));
    }
}
