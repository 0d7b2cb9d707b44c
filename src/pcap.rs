//! Captured cleartext rendered as a synthetic TCP stream.
//!
//! The proxy only ever sees decrypted application bytes, so the capture
//! forges a plausible TCP/IPv6 conversation around them: a three-way
//! handshake, then one data segment plus a pure ACK per forwarded chunk.
//! Sequence numbers are random per stream and only consistent within it.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use etherparse::PacketBuilder;
use tokio::io::AsyncWriteExt;
use tracing::error;

/// Classic pcap global header: microsecond timestamps, snaplen 65535,
/// link type 1 (Ethernet).
pub const PCAP_GLOBAL_HEADER: [u8; 24] = [
    0xd4, 0xc3, 0xb2, 0xa1, // magic (little endian)
    0x02, 0x00, 0x04, 0x00, // version 2.4
    0x00, 0x00, 0x00, 0x00, // thiszone
    0x00, 0x00, 0x00, 0x00, // sigfigs
    0xff, 0xff, 0x00, 0x00, // snaplen
    0x01, 0x00, 0x00, 0x00, // network = Ethernet
];

/// Map an address into the IPv6 space the capture uses throughout.
pub fn ip_to_ipv6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// Shared in-memory pcap buffer, appended to by many tunnels and drained by
/// the process-wide flush task.
pub struct PcapSink {
    buf: Mutex<Vec<u8>>,
}

impl PcapSink {
    pub fn new() -> Self {
        Self {
            buf: Mutex::new(Vec::new()),
        }
    }

    /// Append one Ethernet frame as a pcap record, stamped with now.
    pub fn append_record(&self, frame: &[u8]) {
        let now = chrono::Utc::now();
        let secs = now.timestamp() as u32;
        let micros = now.timestamp_subsec_micros();
        let len = frame.len() as u32;

        let mut buf = self.buf.lock().unwrap();
        buf.extend_from_slice(&secs.to_le_bytes());
        buf.extend_from_slice(&micros.to_le_bytes());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(frame);
    }

    /// Swap the buffer out; the caller owns everything accumulated so far.
    pub fn drain(&self) -> Vec<u8> {
        std::mem::take(&mut *self.buf.lock().unwrap())
    }
}

impl Default for PcapSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain the sink into `<dir>/<unix_time>.pcap` about once per second.
pub async fn run_flush_task(sink: Arc<PcapSink>, dir: PathBuf) -> std::io::Result<()> {
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join(format!("{}.pcap", chrono::Utc::now().timestamp()));
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    file.write_all(&PCAP_GLOBAL_HEADER).await?;

    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        let data = sink.drain();
        if !data.is_empty() {
            file.write_all(&data).await?;
            file.flush().await?;
        }
    }
}

/// Forges the TCP conversation for one tunnel.
pub struct PacketWriter {
    client: (Ipv6Addr, u16),
    server: (Ipv6Addr, u16),
    client_seq: u32,
    server_seq: u32,
    handshake_written: bool,
    sink: Arc<PcapSink>,
}

impl PacketWriter {
    pub fn new(client: SocketAddr, server: SocketAddr, sink: Arc<PcapSink>) -> Self {
        Self {
            client: (ip_to_ipv6(client.ip()), client.port()),
            server: (ip_to_ipv6(server.ip()), server.port()),
            client_seq: initial_seq(),
            server_seq: initial_seq(),
            handshake_written: false,
            sink,
        }
    }

    #[cfg(test)]
    fn with_sequences(
        client: SocketAddr,
        server: SocketAddr,
        sink: Arc<PcapSink>,
        client_seq: u32,
        server_seq: u32,
    ) -> Self {
        let mut writer = Self::new(client, server, sink);
        writer.client_seq = client_seq;
        writer.server_seq = server_seq;
        writer
    }

    /// Record a chunk observed flowing client → server.
    pub fn client(&mut self, data: &[u8]) {
        self.write_handshake_if_needed();

        let seq = self.client_seq;
        self.client_seq = seq.wrapping_add(data.len() as u32);

        self.emit(self.client, self.server, seq, Some(self.server_seq), false, true, data);
        self.emit(
            self.server,
            self.client,
            self.server_seq,
            Some(self.client_seq),
            false,
            false,
            &[],
        );
    }

    /// Record a chunk observed flowing server → client.
    pub fn server(&mut self, data: &[u8]) {
        self.write_handshake_if_needed();

        let seq = self.server_seq;
        self.server_seq = seq.wrapping_add(data.len() as u32);

        self.emit(self.server, self.client, seq, Some(self.client_seq), false, true, data);
        self.emit(
            self.client,
            self.server,
            self.client_seq,
            Some(self.server_seq),
            false,
            false,
            &[],
        );
    }

    fn write_handshake_if_needed(&mut self) {
        if self.handshake_written {
            return;
        }
        self.handshake_written = true;

        self.emit(
            self.client,
            self.server,
            self.client_seq.wrapping_sub(1),
            None,
            true,
            false,
            &[],
        );
        self.emit(
            self.server,
            self.client,
            self.server_seq.wrapping_sub(1),
            Some(self.client_seq),
            true,
            false,
            &[],
        );
        self.emit(
            self.client,
            self.server,
            self.client_seq,
            Some(self.server_seq),
            false,
            false,
            &[],
        );
    }

    fn emit(
        &self,
        src: (Ipv6Addr, u16),
        dst: (Ipv6Addr, u16),
        seq: u32,
        ack: Option<u32>,
        syn: bool,
        psh: bool,
        payload: &[u8],
    ) {
        let builder = PacketBuilder::ethernet2([0u8; 6], [0u8; 6])
            .ipv6(src.0.octets(), dst.0.octets(), 64)
            .tcp(src.1, dst.1, seq, 0xffff);
        let builder = if syn { builder.syn() } else { builder };
        let builder = if psh { builder.psh() } else { builder };
        let builder = match ack {
            Some(number) => builder.ack(number),
            None => builder,
        };

        let mut frame = Vec::with_capacity(builder.size(payload.len()));
        if let Err(e) = builder.write(&mut frame, payload) {
            error!("failed to build capture packet: {e}");
            return;
        }
        self.sink.append_record(&frame);
    }
}

fn initial_seq() -> u32 {
    fastrand::u32(1..=u32::MAX)
}
