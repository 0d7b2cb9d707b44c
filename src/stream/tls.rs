//! TLS sessions driven over in-memory buffers.
//!
//! The async TLS support in the ecosystem couples the handshake to a socket.
//! This implementation keeps the rustls state machine decoupled from I/O so
//! the caller owns every byte on the wire: the first client record can be
//! read raw, inspected for its SNI, and then handed back to the engine with
//! [`TlsByteStream::push_data`] before the handshake starts.

use std::io::{self, Read, Write};
use std::sync::Arc;

use async_trait::async_trait;
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, Connection, DigitallySignedStruct, ServerConfig,
             ServerConnection};

use super::ByteStream;
use crate::error::{Error, Result};
use crate::keylog::SessionKeyLog;

/// How many ciphertext bytes one drive-loop fill reads from the transport.
const INTERNAL_BLOCKSIZE: usize = 1024;

/// Result of one attempted TLS operation against the engine.
///
/// The engine never suspends itself; every operation reports whether it
/// finished or which direction of transport I/O it is blocked on, and the
/// drive loop performs that I/O.
pub enum Step<T> {
    Done(T),
    WantRead,
    WantWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Fresh,
    Handshaking,
    Established,
    Closed,
}

/// TLS session layered over another [`ByteStream`].
pub struct TlsByteStream {
    conn: Connection,
    inner: Box<dyn ByteStream>,
    state: SessionState,
    /// Bytes injected via `push_data`, consumed before the first socket read.
    seeded: Vec<u8>,
    /// Set once the underlying stream reported orderly close.
    peer_closed: bool,
    keylog: Arc<SessionKeyLog>,
    client_random: Option<Vec<u8>>,
}

impl TlsByteStream {
    /// Client-side session. `config.key_log` is replaced with a per-session
    /// capture so key material can be latched after the handshake.
    pub fn client(
        inner: Box<dyn ByteStream>,
        mut config: ClientConfig,
        server_name: ServerName<'static>,
    ) -> Result<Self> {
        let keylog = Arc::new(SessionKeyLog::new());
        config.key_log = keylog.clone();
        let conn = ClientConnection::new(Arc::new(config), server_name)?;
        Ok(Self::new(Connection::Client(conn), inner, keylog))
    }

    /// Server-side session.
    pub fn server(inner: Box<dyn ByteStream>, mut config: ServerConfig) -> Result<Self> {
        let keylog = Arc::new(SessionKeyLog::new());
        config.key_log = keylog.clone();
        let conn = ServerConnection::new(Arc::new(config))?;
        Ok(Self::new(Connection::Server(conn), inner, keylog))
    }

    fn new(conn: Connection, inner: Box<dyn ByteStream>, keylog: Arc<SessionKeyLog>) -> Self {
        Self {
            conn,
            inner,
            state: SessionState::Fresh,
            seeded: Vec::new(),
            peer_closed: false,
            keylog,
            client_random: None,
        }
    }

    /// Inject already-read ciphertext into the inbound buffer.
    ///
    /// Only legal before the handshake: this is how the first record,
    /// consumed off the wire to parse its SNI, is returned to the engine.
    pub fn push_data(&mut self, data: &[u8]) -> Result<()> {
        if self.state != SessionState::Fresh {
            return Err(Error::Tls(
                "push_data is only allowed before the handshake".into(),
            ));
        }
        self.seeded.extend_from_slice(data);
        Ok(())
    }

    /// Drive the handshake to completion and latch the session secrets.
    pub async fn handshake(&mut self) -> Result<()> {
        if self.state != SessionState::Fresh {
            return Err(Error::Tls("handshake may only run once".into()));
        }
        self.state = SessionState::Handshaking;

        self.drive(|conn, peer_closed| {
            // Flush before declaring completion: the final flight (e.g. the
            // Finished message) may still be queued when rustls reports the
            // handshake done.
            if conn.wants_write() {
                return Ok(Step::WantWrite);
            }
            if !conn.is_handshaking() {
                return Ok(Step::Done(()));
            }
            if peer_closed {
                return Err(Error::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed during TLS handshake",
                )));
            }
            Ok(Step::WantRead)
        })
        .await?;

        self.client_random = self.keylog.client_random();
        if self.client_random.is_none() {
            return Err(Error::Tls(
                "handshake finished without reporting key material".into(),
            ));
        }
        self.state = SessionState::Established;
        Ok(())
    }

    /// Receive up to `max` plaintext bytes; empty on orderly close.
    pub async fn recv(&mut self, max: usize) -> Result<Vec<u8>> {
        self.ensure_established().await?;

        let mut buf = vec![0u8; max];
        self.drive(|conn, peer_closed| {
            match conn.reader().read(&mut buf) {
                // 0 means the peer sent close_notify.
                Ok(n) => Ok(Step::Done(buf[..n].to_vec())),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if peer_closed {
                        // Transport closed without close_notify; surface as
                        // orderly close like the plain TCP stream does.
                        return Ok(Step::Done(Vec::new()));
                    }
                    if conn.wants_write() {
                        Ok(Step::WantWrite)
                    } else {
                        Ok(Step::WantRead)
                    }
                }
                Err(e) => Err(Error::Transport(e)),
            }
        })
        .await
    }

    /// Encrypt and send the whole buffer.
    pub async fn sendall(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_established().await?;

        self.drive(|conn, _| {
            conn.writer()
                .write_all(data)
                .map_err(Error::Transport)?;
            Ok(Step::Done(()))
        })
        .await?;
        self.flush_outgoing().await
    }

    /// Send close_notify and yield back the underlying stream for reuse.
    pub async fn close(mut self) -> Result<Box<dyn ByteStream>> {
        self.conn.send_close_notify();
        self.flush_outgoing().await?;
        self.state = SessionState::Closed;
        Ok(self.inner)
    }

    /// Client random of the established session.
    pub fn client_random(&self) -> Option<&[u8]> {
        self.client_random.as_deref()
    }

    /// NSS-format keylog lines for downstream decryption tooling.
    pub fn keylog_lines(&self) -> Vec<String> {
        self.keylog.nss_lines()
    }

    async fn ensure_established(&mut self) -> Result<()> {
        match self.state {
            SessionState::Fresh => self.handshake().await,
            SessionState::Handshaking | SessionState::Established => Ok(()),
            SessionState::Closed => Err(Error::Tls("session is closed".into())),
        }
    }

    /// The drive loop: the only place TLS work touches the transport.
    ///
    /// `op` is retried until it completes. On want-read, all queued outbound
    /// bytes are flushed first, then ciphertext is pulled into the engine;
    /// on want-write, outbound bytes are flushed.
    async fn drive<T>(
        &mut self,
        mut op: impl FnMut(&mut Connection, bool) -> Result<Step<T>>,
    ) -> Result<T> {
        loop {
            match op(&mut self.conn, self.peer_closed)? {
                Step::Done(value) => return Ok(value),
                Step::WantRead => {
                    self.flush_outgoing().await?;
                    self.fill_incoming().await?;
                }
                Step::WantWrite => self.flush_outgoing().await?,
            }
        }
    }

    /// Move everything the engine queued onto the underlying stream.
    async fn flush_outgoing(&mut self) -> Result<()> {
        let mut out = Vec::new();
        while self.conn.wants_write() {
            self.conn.write_tls(&mut out).map_err(Error::Transport)?;
        }
        if !out.is_empty() {
            self.inner.sendall(&out).await?;
        }
        Ok(())
    }

    /// Feed ciphertext into the engine: seeded bytes first, then up to
    /// `INTERNAL_BLOCKSIZE` bytes from the underlying stream.
    async fn fill_incoming(&mut self) -> Result<()> {
        let data = if !self.seeded.is_empty() {
            std::mem::take(&mut self.seeded)
        } else {
            let chunk = self.inner.recv(INTERNAL_BLOCKSIZE).await?;
            if chunk.is_empty() {
                self.peer_closed = true;
                return Ok(());
            }
            chunk
        };

        let mut cursor = io::Cursor::new(&data[..]);
        while (cursor.position() as usize) < data.len() {
            let n = self.conn.read_tls(&mut cursor).map_err(Error::Transport)?;
            if n == 0 {
                break;
            }
            if let Err(e) = self.conn.process_new_packets() {
                // Push out any alert rustls queued before giving up.
                let _ = self.flush_outgoing().await;
                return Err(Error::Tls(e.to_string()));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ByteStream for TlsByteStream {
    async fn handshake(&mut self) -> Result<()> {
        TlsByteStream::handshake(self).await
    }

    async fn recv(&mut self, max: usize) -> Result<Vec<u8>> {
        TlsByteStream::recv(self, max).await
    }

    async fn sendall(&mut self, data: &[u8]) -> Result<()> {
        TlsByteStream::sendall(self, data).await
    }

    fn peer_info(&self) -> Result<std::net::SocketAddr> {
        self.inner.peer_info()
    }
}

/// Client config that accepts any upstream certificate.
///
/// The proxy terminates and re-originates TLS; verifying the upstream would
/// defeat its purpose, so the verifier accepts everything.
pub fn insecure_client_config() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth()
}

#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
