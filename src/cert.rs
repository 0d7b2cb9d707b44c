//! On-the-fly certificate minting for intercepted hostnames.
//!
//! One RSA-3072 key is generated per process and shared by every minted
//! leaf; the PEM bundles on disk carry the private key as encrypted PKCS#8
//! under a per-process random password so stray temp files are not
//! immediately useful.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rand::RngCore;
use rand::rngs::OsRng;
use rcgen::{
    Certificate, CertificateParams, DnType, IsCa, KeyIdMethod, KeyPair, KeyUsagePurpose,
    SerialNumber,
};
use rsa::RsaPrivateKey;
use rsa::pkcs8::EncodePrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::{Duration, OffsetDateTime};

use crate::error::{Error, Result};

const RSA_BITS: usize = 3072;
const VALIDITY_DAYS: i64 = 365 * 10;

/// Mints self-signed leaf certificates for arbitrary hostnames.
///
/// The hostname → bundle-path mapping is append-only; repeated queries for
/// the same hostname return the same path.
pub struct SelfSignedCertificates {
    rsa_key: KeyPair,
    /// Generated alongside the RSA key; reserved for minting EC leaves for
    /// clients that refuse RSA certificates.
    #[allow(dead_code)]
    ecdsa_key: KeyPair,
    issuer_cert: Certificate,
    password: Vec<u8>,
    /// Encrypted PKCS#8 PEM of the process RSA key, shared by all bundles.
    key_pem: String,
    cache: Mutex<HashMap<String, PathBuf>>,
}

impl std::fmt::Debug for SelfSignedCertificates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfSignedCertificates").finish_non_exhaustive()
    }
}

impl SelfSignedCertificates {
    /// Generate the process keys and prepare the issuer identity.
    pub fn new(issuer: &str) -> Result<Self> {
        let rsa_private = RsaPrivateKey::new(&mut OsRng, RSA_BITS)
            .map_err(|e| Error::Tls(format!("RSA key generation: {e}")))?;
        let rsa_der = rsa_private
            .to_pkcs8_der()
            .map_err(|e| Error::Tls(format!("RSA key encoding: {e}")))?;
        let rsa_key = KeyPair::from_der_and_sign_algo(
            &PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(rsa_der.as_bytes().to_vec())),
            &rcgen::PKCS_RSA_SHA256,
        )?;
        let ecdsa_key = KeyPair::generate()?;

        let mut password = vec![0u8; 32];
        OsRng.fill_bytes(&mut password);

        let key_pem = encrypt_key_pem(&rsa_der, &password)?;

        let mut issuer_params = CertificateParams::default();
        issuer_params
            .distinguished_name
            .push(DnType::CommonName, issuer);
        let issuer_cert = issuer_params.self_signed(&rsa_key)?;

        Ok(Self {
            rsa_key,
            ecdsa_key,
            issuer_cert,
            password,
            key_pem,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Path of a PEM bundle (leaf certificate + encrypted private key) for
    /// the given hostname, minting it on first use.
    pub fn get_certificate(&self, hostname: &str) -> Result<PathBuf> {
        let mut cache = self.cache.lock().unwrap();
        if let Some(path) = cache.get(hostname) {
            return Ok(path.clone());
        }

        let cert_pem = self.mint(hostname)?;
        let path = bundle_path(hostname);
        std::fs::write(&path, format!("{cert_pem}{}", self.key_pem))?;

        cache.insert(hostname.to_string(), path.clone());
        Ok(path)
    }

    /// Password protecting the private key inside every bundle.
    pub fn get_password(&self) -> &[u8] {
        &self.password
    }

    fn mint(&self, hostname: &str) -> Result<String> {
        let mut params = CertificateParams::new(vec![hostname.to_string()])?;
        params
            .distinguished_name
            .push(DnType::CommonName, hostname);

        let mut serial = [0u8; 16];
        OsRng.fill_bytes(&mut serial);
        params.serial_number = Some(SerialNumber::from_slice(&serial));

        params.not_before = OffsetDateTime::now_utc();
        params.not_after = params.not_before + Duration::days(VALIDITY_DAYS);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::ContentCommitment,
        ];
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_identifier_method = KeyIdMethod::Sha256;

        let cert = params.signed_by(&self.rsa_key, &self.issuer_cert, &self.rsa_key)?;
        Ok(cert.pem())
    }

    /// Parse a bundle back into rustls material, decrypting the key with the
    /// process password.
    pub fn load_bundle(
        path: &Path,
        password: &[u8],
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let text = std::fs::read_to_string(path)?;

        let mut reader = io::Cursor::new(text.as_bytes());
        let chain = rustls_pemfile::certs(&mut reader)
            .collect::<io::Result<Vec<_>>>()
            .map_err(Error::Transport)?;
        if chain.is_empty() {
            return Err(Error::Tls(format!(
                "no certificate in bundle {}",
                path.display()
            )));
        }

        let b64 = pem_block_base64(&text, "ENCRYPTED PRIVATE KEY").ok_or_else(|| {
            Error::Tls(format!("no encrypted key in bundle {}", path.display()))
        })?;
        use base64::Engine;
        let der = base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| Error::Tls(format!("bundle key is not valid base64: {e}")))?;

        let encrypted = pkcs8::EncryptedPrivateKeyInfo::try_from(der.as_slice())
            .map_err(|e| Error::Tls(format!("bundle key is not PKCS#8: {e}")))?;
        let decrypted = encrypted
            .decrypt(password)
            .map_err(|e| Error::Tls(format!("bundle key decryption failed: {e}")))?;

        let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(
            decrypted.as_bytes().to_vec(),
        ));
        Ok((chain, key))
    }
}

fn encrypt_key_pem(plain_der: &pkcs8::SecretDocument, password: &[u8]) -> Result<String> {
    let info = pkcs8::PrivateKeyInfo::try_from(plain_der.as_bytes())
        .map_err(|e| Error::Tls(format!("PKCS#8 re-parse: {e}")))?;
    let encrypted = info
        .encrypt(OsRng, password)
        .map_err(|e| Error::Tls(format!("PKCS#8 encryption: {e}")))?;
    let pem = encrypted
        .to_pem("ENCRYPTED PRIVATE KEY", pkcs8::LineEnding::LF)
        .map_err(|e| Error::Tls(format!("PKCS#8 PEM encoding: {e}")))?;
    Ok(pem.to_string())
}

fn bundle_path(hostname: &str) -> PathBuf {
    let safe: String = hostname
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    std::env::temp_dir().join(format!("tmmp-{safe}-{:08x}.pem", fastrand::u32(..)))
}

fn pem_block_base64(text: &str, label: &str) -> Option<String> {
    let begin = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");
    let start = text.find(&begin)? + begin.len();
    let stop = start + text[start..].find(&end)?;
    Some(
        text[start..stop]
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect(),
    )
}

#[cfg(test)]
pub(crate) fn test_certificates() -> std::sync::Arc<SelfSignedCertificates> {
    // RSA-3072 generation is expensive; share one instance per test binary.
    use std::sync::{Arc, OnceLock};
    static CERTS: OnceLock<Arc<SelfSignedCertificates>> = OnceLock::new();
    CERTS
        .get_or_init(|| Arc::new(SelfSignedCertificates::new("TLS Breaker Proxy").unwrap()))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::*;

    #[test]
    fn repeated_queries_return_the_same_path() {
        let certs = test_certificates();
        let first = certs.get_certificate("repeat.example").unwrap();
        let second = certs.get_certificate("repeat.example").unwrap();
        assert_eq!(first, second);
        let other = certs.get_certificate("other.example").unwrap();
        assert_ne!(first, other);
    }

    #[test]
    fn bundle_round_trips_through_rustls_material() {
        let certs = test_certificates();
        let path = certs.get_certificate("bundle.example").unwrap();
        let (chain, key) =
            SelfSignedCertificates::load_bundle(&path, certs.get_password()).unwrap();
        assert_eq!(chain.len(), 1);
        assert!(matches!(key, PrivateKeyDer::Pkcs8(_)));
    }

    #[test]
    fn wrong_password_fails_to_decrypt() {
        let certs = test_certificates();
        let path = certs.get_certificate("locked.example").unwrap();
        assert!(SelfSignedCertificates::load_bundle(&path, b"not the password").is_err());
    }

    #[test]
    fn minted_leaf_has_the_specified_shape() {
        let certs = test_certificates();
        let path = certs.get_certificate("shape.example").unwrap();
        let (chain, _) =
            SelfSignedCertificates::load_bundle(&path, certs.get_password()).unwrap();

        let (_, cert) = X509Certificate::from_der(chain[0].as_ref()).unwrap();

        let subject_cn = cert
            .subject()
            .iter_common_name()
            .next()
            .unwrap()
            .as_str()
            .unwrap();
        assert_eq!(subject_cn, "shape.example");

        let issuer_cn = cert
            .issuer()
            .iter_common_name()
            .next()
            .unwrap()
            .as_str()
            .unwrap();
        assert_eq!(issuer_cn, "TLS Breaker Proxy");

        let san = cert
            .subject_alternative_name()
            .unwrap()
            .expect("SAN extension present");
        assert!(san
            .value
            .general_names
            .iter()
            .any(|name| matches!(name, GeneralName::DNSName(d) if *d == "shape.example")));

        let bc = cert.basic_constraints().unwrap().expect("basicConstraints");
        assert!(!bc.value.ca);

        let ku = cert.key_usage().unwrap().expect("keyUsage");
        assert!(ku.value.digital_signature());
        assert!(ku.value.key_encipherment());
        assert!(ku.value.non_repudiation());

        // Leaf is signed with its own (process) RSA key.
        assert!(cert.verify_signature(None).is_ok());

        let validity = cert.validity();
        let lifetime = validity.not_after.timestamp() - validity.not_before.timestamp();
        assert!((lifetime - VALIDITY_DAYS * 86_400).abs() < 86_400);
    }
}
