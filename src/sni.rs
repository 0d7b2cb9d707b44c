//! SNI extraction from a raw ClientHello record.
//!
//! Operates on the undecrypted bytes of the first TLS record so the server
//! name is known before any handshake state exists.

use crate::error::{Error, Result};

const RECORD_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Bounds-checked cursor over the record bytes.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::Tls("truncated ClientHello".into()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }
}

/// Extract the SNI hostname from the raw bytes of a TLS handshake record.
///
/// Returns `Ok(None)` for records that cannot carry an SNI (SSL 2.0 framing,
/// unknown versions, or a ClientHello without the server_name extension).
/// A record that is not a handshake, or a handshake that is not a
/// ClientHello, is an error.
pub fn get_sni_from_handshake(record: &[u8]) -> Result<Option<String>> {
    let mut r = Reader::new(record);

    if r.u8()? != RECORD_TYPE_HANDSHAKE {
        return Err(Error::Tls("record is not a handshake message".into()));
    }

    let record_version = r.take(2)?;
    if record_version[0] != 3 {
        // SSL 2.0 framing or garbage; neither carries an SNI.
        return Ok(None);
    }

    r.take(2)?; // record length

    if r.u8()? != HANDSHAKE_TYPE_CLIENT_HELLO {
        return Err(Error::Tls("handshake is not a ClientHello".into()));
    }

    r.take(3)?; // handshake body length

    let client_version = r.take(2)?;
    if client_version[0] != 3 {
        return Ok(None);
    }

    r.take(32)?; // client random

    let session_id_length = r.u8()? as usize;
    r.take(session_id_length)?;

    let cipher_length = r.u16()? as usize;
    r.take(cipher_length)?;

    let compression_length = r.u8()? as usize;
    r.take(compression_length)?;

    let extensions_length = r.u16()? as usize;
    get_sni_from_extensions(r.take(extensions_length)?)
}

/// Walk the extension list looking for server_name.
fn get_sni_from_extensions(extensions: &[u8]) -> Result<Option<String>> {
    let mut r = Reader::new(extensions);

    while r.pos < extensions.len() {
        let extension_type = r.u16()?;
        let extension_length = r.u16()? as usize;
        let body = r.take(extension_length)?;

        if extension_type != EXTENSION_SERVER_NAME {
            continue;
        }
        // body: u16 list length, u8 name type, u16 name length, name
        if body.len() < 5 || body[2] != NAME_TYPE_HOST_NAME {
            continue;
        }

        let name = String::from_utf8(body[5..].to_vec())
            .map_err(|_| Error::Tls("SNI is not valid UTF-8".into()))?;
        return Ok(Some(name));
    }

    Ok(None)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a syntactically valid ClientHello record, optionally with SNI.
    pub(crate) fn assemble_client_hello(sni: Option<&str>) -> Vec<u8> {
        let mut extensions = Vec::new();
        if let Some(name) = sni {
            let name = name.as_bytes();
            extensions.extend_from_slice(&0u16.to_be_bytes()); // server_name
            let body_len = 5 + name.len() as u16;
            extensions.extend_from_slice(&body_len.to_be_bytes());
            extensions.extend_from_slice(&(3 + name.len() as u16).to_be_bytes()); // list length
            extensions.push(0x00); // host_name
            extensions.extend_from_slice(&(name.len() as u16).to_be_bytes());
            extensions.extend_from_slice(name);
        }
        // An unrelated extension after server_name (supported_versions-ish).
        extensions.extend_from_slice(&0x002bu16.to_be_bytes());
        extensions.extend_from_slice(&2u16.to_be_bytes());
        extensions.extend_from_slice(&[0x03, 0x04]);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // client version
        body.extend_from_slice(&[0x42; 32]); // client random
        body.push(0); // session id length
        body.extend_from_slice(&4u16.to_be_bytes()); // cipher suites
        body.extend_from_slice(&[0x13, 0x01, 0x13, 0x02]);
        body.push(1); // compression methods
        body.push(0);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![0x01];
        let len = body.len() as u32;
        handshake.extend_from_slice(&len.to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn round_trips_the_server_name() {
        for name in ["example.com", "a.b.c.d.example.net", "localhost"] {
            let record = assemble_client_hello(Some(name));
            assert_eq!(
                get_sni_from_handshake(&record).unwrap().as_deref(),
                Some(name)
            );
        }
    }

    #[test]
    fn absent_extension_yields_none() {
        let record = assemble_client_hello(None);
        assert_eq!(get_sni_from_handshake(&record).unwrap(), None);
    }

    #[test]
    fn ssl2_framing_yields_none() {
        let mut record = assemble_client_hello(Some("example.com"));
        record[1] = 2;
        assert_eq!(get_sni_from_handshake(&record).unwrap(), None);
    }

    #[test]
    fn old_client_version_yields_none() {
        let mut record = assemble_client_hello(Some("example.com"));
        // client version lives after the 5-byte record header and the
        // 4-byte handshake header
        record[9] = 2;
        assert_eq!(get_sni_from_handshake(&record).unwrap(), None);
    }

    #[test]
    fn non_handshake_record_is_an_error() {
        let mut record = assemble_client_hello(Some("example.com"));
        record[0] = 0x17;
        assert!(get_sni_from_handshake(&record).is_err());
    }

    #[test]
    fn non_client_hello_is_an_error() {
        let mut record = assemble_client_hello(Some("example.com"));
        record[5] = 0x02; // ServerHello
        assert!(get_sni_from_handshake(&record).is_err());
    }

    #[test]
    fn truncated_record_is_an_error() {
        let record = assemble_client_hello(Some("example.com"));
        assert!(get_sni_from_handshake(&record[..20]).is_err());
    }
}
