//! TLS man-in-the-middle proxy.
//!
//! Accepts proxy clients (SOCKS4/4a, SOCKS5 or HTTP CONNECT), opens the
//! requested upstream connection, and forwards bytes between the two. When
//! the client starts a TLS handshake, the tunnel terminates it with a
//! certificate minted on the fly, opens its own TLS session to the real
//! upstream, and keeps forwarding — now with access to the cleartext, which
//! is recorded as a synthetic TCP stream in a pcap file.

pub mod app;
pub mod cert;
pub mod config;
pub mod error;
pub mod keylog;
pub mod pcap;
pub mod proxy;
pub mod sni;
pub mod stream;
pub mod tunnel;

pub use error::{Error, Result};
