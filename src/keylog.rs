//! Per-session TLS key material capture.
//!
//! Uses the documented `rustls::KeyLog` callback instead of reaching into
//! library internals. One `SessionKeyLog` is attached to exactly one TLS
//! session (client or server side), so every record it collects belongs to
//! that session. The records can be rendered in the NSS keylog format
//! understood by Wireshark and friends.

use std::fmt;
use std::sync::Mutex;

/// One secret reported by the TLS library.
///
/// For TLS 1.2 the label is `CLIENT_RANDOM` and the secret is the master
/// secret; TLS 1.3 reports one record per traffic secret.
#[derive(Clone)]
pub struct KeyLogEntry {
    pub label: String,
    pub client_random: Vec<u8>,
    pub secret: Vec<u8>,
}

/// Key log sink for a single TLS session.
pub struct SessionKeyLog {
    entries: Mutex<Vec<KeyLogEntry>>,
}

impl SessionKeyLog {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Client random of the session, once the handshake produced secrets.
    pub fn client_random(&self) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .unwrap()
            .first()
            .map(|e| e.client_random.clone())
    }

    pub fn entries(&self) -> Vec<KeyLogEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Render all records as NSS keylog lines (`LABEL <random> <secret>`).
    pub fn nss_lines(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|e| {
                format!(
                    "{} {} {}",
                    e.label,
                    hex::encode(&e.client_random),
                    hex::encode(&e.secret)
                )
            })
            .collect()
    }
}

impl Default for SessionKeyLog {
    fn default() -> Self {
        Self::new()
    }
}

impl rustls::KeyLog for SessionKeyLog {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        self.entries.lock().unwrap().push(KeyLogEntry {
            label: label.to_string(),
            client_random: client_random.to_vec(),
            secret: secret.to_vec(),
        });
    }
}

// Secrets stay out of debug output.
impl fmt::Debug for SessionKeyLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.entries.lock().unwrap().len();
        f.debug_struct("SessionKeyLog").field("entries", &count).finish()
    }
}
