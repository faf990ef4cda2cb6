//! Incremental control-packet reassembly.
//!
//! Received chunks are queued as-is; [`CtrlPacketStreamer::read_packet`]
//! merges queued chunks only as far as needed to complete the next packet and
//! pushes any unconsumed remainder back to the front, so packet boundaries
//! never have to line up with read boundaries.

use std::{collections::VecDeque, io::Error};

use crate::proto::packet::CtrlPacket;

#[derive(Default)]
pub struct CtrlPacketStreamer {
    chunks: VecDeque<Vec<u8>>,
}

impl CtrlPacketStreamer {
    pub fn new() -> Self {
        CtrlPacketStreamer::default()
    }

    pub fn feed(&mut self, chunk: Vec<u8>) {
        if !chunk.is_empty() {
            self.chunks.push_back(chunk);
        }
    }

    /// Returns the next complete packet, or `None` if the buffered bytes do
    /// not amount to one yet. Framing errors are fatal and leave the streamer
    /// unusable.
    pub fn read_packet(&mut self) -> Result<Option<CtrlPacket>, Error> {
        let mut buf = match self.chunks.pop_front() {
            Some(buf) => buf,
            None => return Ok(None),
        };

        loop {
            match CtrlPacket::decode(&buf)? {
                Some((packet, consumed)) => {
                    if consumed < buf.len() {
                        self.chunks.push_front(buf.split_off(consumed));
                    }
                    return Ok(Some(packet));
                }
                None => match self.chunks.pop_front() {
                    Some(next) => buf.extend_from_slice(&next),
                    None => {
                        self.chunks.push_front(buf);
                        return Ok(None);
                    }
                },
            }
        }
    }

    /// Feeds a chunk and drains every packet completed by it.
    pub fn read_packets(&mut self, chunk: Vec<u8>) -> Result<Vec<CtrlPacket>, Error> {
        self.feed(chunk);

        let mut packets = Vec::new();
        while let Some(packet) = self.read_packet()? {
            packets.push(packet);
        }
        Ok(packets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::packet::{CtrlCmd, OpenOpt};

    fn sample_packets() -> Vec<CtrlPacket> {
        let opt = OpenOpt {
            host: "192.168.1.20".into(),
            port: 5432,
            tls: false,
            buffer_limit: 2048,
        };

        vec![
            CtrlPacket::sync_ctrl(),
            CtrlPacket::open_session(10000, 1, &opt),
            CtrlPacket::close_session(10000, 1, 77),
        ]
    }

    #[test]
    fn reassembles_across_every_split_offset() {
        let packet = CtrlPacket::ack_ctrl(4, "client-a", "key-123");
        let bytes = packet.encode();

        for cut in 1..bytes.len() {
            let mut streamer = CtrlPacketStreamer::new();
            assert!(streamer.read_packets(bytes[..cut].to_vec()).unwrap().is_empty());
            let packets = streamer.read_packets(bytes[cut..].to_vec()).unwrap();
            assert_eq!(packets, vec![packet.clone()], "cut at {cut}");
        }
    }

    #[test]
    fn drains_multiple_packets_from_one_chunk() {
        let packets = sample_packets();
        let mut bytes = Vec::new();
        for packet in &packets {
            bytes.extend_from_slice(&packet.encode());
        }

        let mut streamer = CtrlPacketStreamer::new();
        assert_eq!(streamer.read_packets(bytes).unwrap(), packets);
        assert!(streamer.read_packet().unwrap().is_none());
    }

    #[test]
    fn one_byte_at_a_time() {
        let packets = sample_packets();
        let mut bytes = Vec::new();
        for packet in &packets {
            bytes.extend_from_slice(&packet.encode());
        }

        let mut streamer = CtrlPacketStreamer::new();
        let mut decoded = Vec::new();
        for byte in bytes {
            decoded.extend(streamer.read_packets(vec![byte]).unwrap());
        }
        assert_eq!(decoded, packets);
    }

    #[test]
    fn framing_error_surfaces_mid_stream() {
        let mut streamer = CtrlPacketStreamer::new();
        let mut bytes = CtrlPacket::sync_ctrl().encode();
        bytes.extend_from_slice(b"GARBAGEGARBAGEGARBAGE");

        let mut packets = Vec::new();
        let mut error = None;
        match streamer.read_packets(bytes) {
            Ok(p) => packets = p,
            Err(e) => error = Some(e),
        }
        // The valid packet is consumed before the garbage errors out, or the
        // whole feed errors; either way garbage never decodes.
        if error.is_none() {
            assert_eq!(packets.len(), 1);
            assert_eq!(packets[0].cmd, CtrlCmd::SyncCtrl);
            assert!(streamer.read_packet().is_err());
        }
    }
}
