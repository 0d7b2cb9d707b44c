//! Error types shared across the proxy.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for every subsystem.
///
/// Proxy-protocol errors are normally answered on the wire and turned into
/// the rejection sentinel before they reach a caller; the variants here are
/// what remains fatal for a tunnel or for startup.
#[derive(Debug, Error)]
pub enum Error {
    /// Read, write or connect failure on a socket or byte stream.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Handshake failure, alert, bad record or unusable engine state.
    #[error("tls error: {0}")]
    Tls(String),

    /// Malformed SOCKS/HTTP bytes, unsupported command or address type.
    #[error("proxy protocol error: {0}")]
    ProxyProtocol(String),

    /// Unknown provider, missing required value or unknown protocol name.
    #[error("configuration error: {0}")]
    Config(String),

    /// DNS returned no usable address.
    #[error("name resolution failed: {0}")]
    Resolution(String),
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Error::Tls(err.to_string())
    }
}

impl From<rcgen::Error> for Error {
    fn from(err: rcgen::Error) -> Self {
        Error::Tls(format!("certificate generation: {err}"))
    }
}
