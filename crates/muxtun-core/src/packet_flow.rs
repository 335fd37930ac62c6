//! Packet-flow seam: raw IP packets in, raw IP packets out
//!
//! IP-layer flows exchange `(packets, protocols)` batches with a host-side
//! packet interface: the platform packet-flow source on the client, the
//! host IP stack on the server. Both are modeled as a paired reader/writer
//! so the engine never couples to a concrete device.

use async_trait::async_trait;
use bytes::Bytes;
use muxtun_proto::{MAX_PACKETS_PER_MESSAGE, MAX_PACKET_BYTES};
use std::io;
use tokio::sync::mpsc;
use tracing::warn;

/// Source of outbound packet batches. `protocols` carries one address
/// family per packet and always matches `packets` in length.
#[async_trait]
pub trait PacketReader: Send + 'static {
    async fn read_packets(&mut self) -> io::Result<(Vec<Bytes>, Vec<i64>)>;
}

/// Sink for inbound packet batches.
#[async_trait]
pub trait PacketWriter: Send + 'static {
    async fn write_packets(&mut self, packets: &[Bytes], protocols: &[i64]) -> io::Result<()>;
}

/// Reader half of [`channel_packet_flow`].
pub struct ChannelPacketReader {
    rx: mpsc::Receiver<(Vec<Bytes>, Vec<i64>)>,
}

/// Writer half of [`channel_packet_flow`].
#[derive(Clone)]
pub struct ChannelPacketWriter {
    tx: mpsc::Sender<(Vec<Bytes>, Vec<i64>)>,
}

/// A connected writer/reader pair carrying packet batches over a bounded
/// channel. Useful for tests and for embedders that pump packets from a
/// platform interface on their own task.
pub fn channel_packet_flow(capacity: usize) -> (ChannelPacketWriter, ChannelPacketReader) {
    let (tx, rx) = mpsc::channel(capacity);
    (ChannelPacketWriter { tx }, ChannelPacketReader { rx })
}

#[async_trait]
impl PacketReader for ChannelPacketReader {
    async fn read_packets(&mut self) -> io::Result<(Vec<Bytes>, Vec<i64>)> {
        self.rx.recv().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "packet source closed")
        })
    }
}

#[async_trait]
impl PacketWriter for ChannelPacketWriter {
    async fn write_packets(&mut self, packets: &[Bytes], protocols: &[i64]) -> io::Result<()> {
        self.tx
            .send((packets.to_vec(), protocols.to_vec()))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "packet sink closed"))
    }
}

/// Split a packet batch into wire-sized chunks, dropping packets over the
/// per-packet limit.
pub fn batch_packets(packets: Vec<Bytes>, protocols: Vec<i64>) -> Vec<(Vec<Bytes>, Vec<i64>)> {
    let mut batches = Vec::new();
    let mut current: (Vec<Bytes>, Vec<i64>) = (Vec::new(), Vec::new());

    for (packet, protocol) in packets.into_iter().zip(protocols) {
        if packet.len() > MAX_PACKET_BYTES {
            warn!(len = packet.len(), "dropping oversize packet");
            continue;
        }
        current.0.push(packet);
        current.1.push(protocol);
        if current.0.len() == MAX_PACKETS_PER_MESSAGE {
            batches.push(std::mem::take(&mut current));
        }
    }
    if !current.0.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_flow_roundtrip() {
        let (mut writer, mut reader) = channel_packet_flow(4);
        let packets = vec![Bytes::from_static(b"\x45\x00\x00\x14")];
        writer.write_packets(&packets, &[2]).await.unwrap();

        let (got_packets, got_protocols) = reader.read_packets().await.unwrap();
        assert_eq!(got_packets, packets);
        assert_eq!(got_protocols, vec![2]);
    }

    #[tokio::test]
    async fn test_reader_eof_when_writer_dropped() {
        let (writer, mut reader) = channel_packet_flow(1);
        drop(writer);
        assert!(reader.read_packets().await.is_err());
    }

    #[test]
    fn test_batch_packets_chunks_at_limit() {
        let packets: Vec<Bytes> = (0..70).map(|_| Bytes::from_static(b"p")).collect();
        let protocols: Vec<i64> = vec![2; 70];

        let batches = batch_packets(packets, protocols);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].0.len(), MAX_PACKETS_PER_MESSAGE);
        assert_eq!(batches[1].0.len(), MAX_PACKETS_PER_MESSAGE);
        assert_eq!(batches[2].0.len(), 6);
        for (packets, protocols) in &batches {
            assert_eq!(packets.len(), protocols.len());
        }
    }

    #[test]
    fn test_batch_packets_drops_oversize() {
        let packets = vec![
            Bytes::from(vec![0u8; MAX_PACKET_BYTES + 1]),
            Bytes::from_static(b"ok"),
        ];
        let batches = batch_packets(packets, vec![2, 2]);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0.len(), 1);
        assert_eq!(batches[0].0[0], Bytes::from_static(b"ok"));
    }
}
