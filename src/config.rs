//! Configuration parsing and provider construction.
//!
//! Protocols and providers are resolved through static registries keyed by
//! stable short names (`socks`, `http`, `simple`, `tls`, `selfsigned`); the
//! `*_class` keys accept the same names and exist for configuration
//! compatibility.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::app::{ApplicationProtocol, TlsProtocol};
use crate::cert::SelfSignedCertificates;
use crate::error::{Error, Result};
use crate::proxy::{HttpConnectProxy, ProxyProtocol, SimpleProxy, SocksProxy, Target};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub proxy: ProxySection,
    pub application: ApplicationSection,
    pub tls: TlsSection,
    pub providers: ProvidersSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// IPv6 listen address; IPv4 is reached via `::ffff:a.b.c.d`.
    pub listen: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: "::".to_string(),
            port: 1234,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    pub protocol: String,
    pub protocol_class: Option<String>,
    /// Fixed destination, required by the `simple` protocol.
    pub remote: Option<String>,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            protocol: "socks".to_string(),
            protocol_class: None,
            remote: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApplicationSection {
    pub max_depth: u32,
    pub protocols: Vec<String>,
    pub protocols_class: Option<Vec<String>>,
}

impl Default for ApplicationSection {
    fn default() -> Self {
        Self {
            max_depth: 1,
            protocols: vec!["tls".to_string()],
            protocols_class: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsSection {
    /// Cipher list for the client-facing side; `"ALL"` or a colon-separated
    /// list of rustls suite names.
    pub ciphers: String,
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            ciphers: "ALL".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvidersSection {
    pub certificates: String,
    pub selfsigned_cn: String,
}

impl Default for ProvidersSection {
    fn default() -> Self {
        Self {
            certificates: "selfsigned".to_string(),
            selfsigned_cn: "TLS Breaker Proxy".to_string(),
        }
    }
}

impl Config {
    pub const EXAMPLE: &'static str = "\
[server]
listen = \"::\"
port = 1234

[proxy]
protocol = \"socks\"
# protocol_class = \"socks\"

[application]
max_depth = 1
protocols = [ \"tls\" ]
# protocols_class = [ \"tls\" ]

[tls]
ciphers = \"ALL\"

[providers]
certificates = \"selfsigned\"
selfsigned_cn = \"TLS Breaker Proxy\"
";

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::parse(&text)
    }
}

/// Everything built from the configuration that the proxy needs at runtime.
#[derive(Clone)]
pub struct Providers {
    pub certificates: Arc<SelfSignedCertificates>,
    pub proxy: Arc<dyn ProxyProtocol>,
    pub application_protocols: Arc<Vec<Box<dyn ApplicationProtocol>>>,
}

impl Providers {
    pub fn from_config(config: &Config) -> Result<Self> {
        let certificates = certificate_provider(config)?;
        let proxy = proxy_protocol(config)?;
        let application_protocols = Arc::new(application_protocols(config, &certificates)?);
        Ok(Self {
            certificates,
            proxy,
            application_protocols,
        })
    }
}

fn certificate_provider(config: &Config) -> Result<Arc<SelfSignedCertificates>> {
    match config.providers.certificates.as_str() {
        "selfsigned" => Ok(Arc::new(SelfSignedCertificates::new(
            &config.providers.selfsigned_cn,
        )?)),
        "ca" => Err(Error::Config(
            "certificate provider \"ca\" is not implemented".into(),
        )),
        other => Err(Error::Config(format!(
            "unknown certificate provider: {other}"
        ))),
    }
}

fn proxy_protocol(config: &Config) -> Result<Arc<dyn ProxyProtocol>> {
    let name = config
        .proxy
        .protocol_class
        .as_deref()
        .unwrap_or(&config.proxy.protocol);
    match name {
        "socks" => Ok(Arc::new(SocksProxy)),
        "http" => Ok(Arc::new(HttpConnectProxy)),
        "simple" => {
            let remote = config.proxy.remote.as_deref().ok_or_else(|| {
                Error::Config("proxy.remote is required for the simple protocol".into())
            })?;
            let (host, port) = split_remote(remote)?;
            Ok(Arc::new(SimpleProxy::new(Target::new(host, port))))
        }
        other => Err(Error::Config(format!("unknown proxy protocol: {other}"))),
    }
}

fn application_protocols(
    config: &Config,
    certificates: &Arc<SelfSignedCertificates>,
) -> Result<Vec<Box<dyn ApplicationProtocol>>> {
    let names = config
        .application
        .protocols_class
        .as_ref()
        .unwrap_or(&config.application.protocols);
    names
        .iter()
        .map(|name| match name.as_str() {
            "tls" => Ok(Box::new(TlsProtocol::new(
                certificates.clone(),
                config.tls.ciphers.clone(),
            )) as Box<dyn ApplicationProtocol>),
            other => Err(Error::Config(format!(
                "unknown application protocol: {other}"
            ))),
        })
        .collect()
}

fn split_remote(remote: &str) -> Result<(String, u16)> {
    let malformed = || Error::Config(format!("proxy.remote is not host:port: {remote}"));

    let (host, port) = if let Some(rest) = remote.strip_prefix('[') {
        rest.split_once("]:").ok_or_else(malformed)?
    } else {
        remote.rsplit_once(':').ok_or_else(malformed)?
    };
    let port = port.parse().map_err(|_| malformed())?;
    Ok((host.to_string(), port))
}
