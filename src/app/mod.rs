//! In-band protocol upgrades applied by the tunnel.
//!
//! An application protocol inspects forwarded chunks; when one recognizes
//! its opening bytes it replaces both tunnel legs with wrapped streams and
//! takes ownership of the chunk that triggered the upgrade.

pub mod tls;

pub use tls::TlsProtocol;

use async_trait::async_trait;

use crate::error::Result;
use crate::stream::ByteStream;

#[async_trait]
pub trait ApplicationProtocol: Send + Sync {
    fn name(&self) -> &'static str;

    /// Does this chunk look like the protocol's first packet?
    fn is_protocol_packet(&self, packet: &[u8]) -> bool;

    /// Upgrade both legs of the tunnel.
    ///
    /// `packet` is the chunk that matched [`is_protocol_packet`]; it has
    /// been consumed off the wire and must not be forwarded — the wrapper
    /// owns it now. Returns the replacement (client, server) streams.
    ///
    /// [`is_protocol_packet`]: ApplicationProtocol::is_protocol_packet
    async fn wrap_connection(
        &self,
        packet: &[u8],
        client: Box<dyn ByteStream>,
        server: Box<dyn ByteStream>,
    ) -> Result<(Box<dyn ByteStream>, Box<dyn ByteStream>)>;
}
