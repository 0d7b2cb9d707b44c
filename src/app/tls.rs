//! TLS interception: the reason this proxy exists.
//!
//! When the client's first TLS record shows up, the upstream leg is wrapped
//! in an outbound TLS session using the record's SNI, a leaf certificate is
//! minted for that name, and the client-facing handshake is completed by
//! feeding the captured record back into the server-side engine.

use std::sync::Arc;

use async_trait::async_trait;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use rustls::{ServerConfig, SupportedCipherSuite};
use tracing::debug;

use super::ApplicationProtocol;
use crate::cert::SelfSignedCertificates;
use crate::error::{Error, Result};
use crate::sni::get_sni_from_handshake;
use crate::stream::ByteStream;
use crate::stream::tls::{TlsByteStream, insecure_client_config};

/// Anything shorter cannot be a ClientHello worth inspecting.
const MIN_RECORD: usize = 50;

pub struct TlsProtocol {
    certificates: Arc<SelfSignedCertificates>,
    ciphers: String,
}

impl TlsProtocol {
    pub fn new(certificates: Arc<SelfSignedCertificates>, ciphers: impl Into<String>) -> Self {
        Self {
            certificates,
            ciphers: ciphers.into(),
        }
    }

    /// Client-facing TLS configuration with a certificate for `hostname`.
    fn server_config(&self, hostname: &str) -> Result<ServerConfig> {
        let path = self.certificates.get_certificate(hostname)?;
        let (chain, key) =
            SelfSignedCertificates::load_bundle(&path, self.certificates.get_password())?;

        let provider = CryptoProvider {
            cipher_suites: cipher_suites_for(&self.ciphers)?,
            ..rustls::crypto::aws_lc_rs::default_provider()
        };
        Ok(ServerConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(rustls::ALL_VERSIONS)?
            .with_no_client_auth()
            .with_single_cert(chain, key)?)
    }
}

#[async_trait]
impl ApplicationProtocol for TlsProtocol {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn is_protocol_packet(&self, packet: &[u8]) -> bool {
        if packet.len() < MIN_RECORD {
            return false;
        }
        packet[0] == 0x16
            && packet[1] == 3
            && matches!(packet[2], 0..=3)
            && packet.len() - 5 == u16::from_be_bytes([packet[3], packet[4]]) as usize
    }

    async fn wrap_connection(
        &self,
        packet: &[u8],
        client: Box<dyn ByteStream>,
        server: Box<dyn ByteStream>,
    ) -> Result<(Box<dyn ByteStream>, Box<dyn ByteStream>)> {
        let sni = get_sni_from_handshake(packet)?;
        debug!(?sni, "intercepting TLS session");

        // Without an SNI the only name we have for either side is the
        // upstream address itself.
        let (server_name, hostname) = match sni {
            Some(name) => {
                let server_name = ServerName::try_from(name.clone())
                    .map_err(|_| Error::Tls(format!("SNI is not a valid server name: {name}")))?;
                (server_name, name)
            }
            None => {
                let ip = server.peer_info()?.ip();
                (ServerName::from(ip), ip.to_string())
            }
        };

        let mut upstream =
            TlsByteStream::client(server, insecure_client_config(), server_name)?;
        upstream.handshake().await?;

        let config = self.server_config(&hostname)?;
        let mut downstream = TlsByteStream::server(client, config)?;
        downstream.push_data(packet)?;
        downstream.handshake().await?;

        for line in downstream.keylog_lines() {
            debug!(side = "client", "keylog: {line}");
        }
        for line in upstream.keylog_lines() {
            debug!(side = "server", "keylog: {line}");
        }

        Ok((Box::new(downstream), Box::new(upstream)))
    }
}

/// Translate the configured cipher list into provider suites.
///
/// rustls has no OpenSSL-style cipher-string language; `"ALL"` selects every
/// suite the provider ships, anything else is a colon-separated list of
/// rustls suite names.
pub(crate) fn cipher_suites_for(spec: &str) -> Result<Vec<SupportedCipherSuite>> {
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if spec.eq_ignore_ascii_case("ALL") {
        return Ok(provider.cipher_suites);
    }

    let mut suites = Vec::new();
    for want in spec.split(':').filter(|s| !s.is_empty()) {
        let found = provider
            .cipher_suites
            .iter()
            .find(|suite| format!("{:?}", suite.suite()).eq_ignore_ascii_case(want));
        match found {
            Some(suite) => suites.push(*suite),
            None => return Err(Error::Config(format!("unknown cipher suite: {want}"))),
        }
    }
    if suites.is_empty() {
        return Err(Error::Config("empty cipher list".into()));
    }
    Ok(suites)
}
