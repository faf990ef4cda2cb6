//! Control packets.
//!
//! Wire layout (big-endian):
//! `"CTRL"(4) | cmd(1) | id(2) | session_id(4) | data_len(4) | data`.
//!
//! The payload is capped at [`MAX_PAYLOAD_SIZE`] bytes; anything claiming more
//! is a framing error and kills the connection. The leading `C` of the magic
//! doubles as the byte the server sniffs to tell control connections apart
//! from data connections.

use std::io::{Error, ErrorKind};

use serde::{Deserialize, Serialize};

use crate::proto::serialize::{BufferReader, BufferWriter, U8ReprEnum};

pub const PACKET_MAGIC: &[u8; 4] = b"CTRL";
pub const HEADER_LEN: usize = 4 + 1 + 2 + 4 + 4;
pub const MAX_PAYLOAD_SIZE: usize = 64000;

/// First byte of [`PACKET_MAGIC`], used to classify fresh tunnel connections.
pub const CONTROL_SNIFF_BYTE: u8 = b'C';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlCmd {
    /// Client -> server, first packet on a fresh control connection. Empty payload.
    SyncCtrl = 0,
    /// Server -> client, carries the assigned control id in the id field.
    SyncCtrlAck = 1,
    /// Client -> server, carries name and key for authentication.
    AckCtrl = 2,
    /// Server -> client over the control channel, tells the client which
    /// endpoint to dial for a session.
    OpenSession = 3,
    /// Either direction; payload is the drain length the peer must finish
    /// relaying before tearing the session down.
    CloseSession = 4,
    /// Server -> client, requests a fresh physical data connection.
    NewDataHandler = 5,
    /// Client -> server, the endpoint dial failed.
    FailOfOpenSession = 6,
    /// Client -> server, the endpoint dial succeeded.
    SuccessOfOpenSession = 7,
    /// Server -> client, session fully online; the client may flush buffers.
    SuccessOfOpenSessionAck = 8,
    /// JSON side-channel: sysinfo from the client, diagnostics from the server.
    Message = 9,
}

impl U8ReprEnum for CtrlCmd {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CtrlCmd::SyncCtrl),
            1 => Some(CtrlCmd::SyncCtrlAck),
            2 => Some(CtrlCmd::AckCtrl),
            3 => Some(CtrlCmd::OpenSession),
            4 => Some(CtrlCmd::CloseSession),
            5 => Some(CtrlCmd::NewDataHandler),
            6 => Some(CtrlCmd::FailOfOpenSession),
            7 => Some(CtrlCmd::SuccessOfOpenSession),
            8 => Some(CtrlCmd::SuccessOfOpenSessionAck),
            9 => Some(CtrlCmd::Message),
            _ => None,
        }
    }

    fn into_u8(self) -> u8 {
        self as u8
    }
}

/// Where the client should connect for a session, carried by `OpenSession`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOpt {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Per-connection memory buffer limit in bytes; negative disables it.
    pub buffer_limit: i32,
}

/// JSON payload of a `Message` packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum TunnelMessage {
    SysInfo(serde_json::Value),
    Log(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CtrlPacket {
    pub cmd: CtrlCmd,
    /// Control id or data handler id, depending on the command.
    pub id: u16,
    pub session_id: u32,
    data: Vec<u8>,
}

impl CtrlPacket {
    fn new(cmd: CtrlCmd, id: u16, session_id: u32, data: Vec<u8>) -> Self {
        CtrlPacket { cmd, id, session_id, data }
    }

    pub fn sync_ctrl() -> Self {
        CtrlPacket::new(CtrlCmd::SyncCtrl, 0, 0, Vec::new())
    }

    pub fn sync_ctrl_ack(ctrl_id: u16) -> Self {
        CtrlPacket::new(CtrlCmd::SyncCtrlAck, ctrl_id, 0, Vec::new())
    }

    pub fn ack_ctrl(ctrl_id: u16, name: &str, key: &str) -> Self {
        let mut writer = BufferWriter::new();
        writer.write_string(name).write_string(key);
        CtrlPacket::new(CtrlCmd::AckCtrl, ctrl_id, 0, writer.into_vec())
    }

    pub fn open_session(handler_id: u16, session_id: u32, opt: &OpenOpt) -> Self {
        let mut writer = BufferWriter::new();
        writer
            .write_string(&opt.host)
            .write_u16(opt.port)
            .write_bool(opt.tls)
            .write_i32(opt.buffer_limit);
        CtrlPacket::new(CtrlCmd::OpenSession, handler_id, session_id, writer.into_vec())
    }

    pub fn close_session(handler_id: u16, session_id: u32, wait_receive_length: u32) -> Self {
        let mut writer = BufferWriter::with_capacity(4);
        writer.write_u32(wait_receive_length);
        CtrlPacket::new(CtrlCmd::CloseSession, handler_id, session_id, writer.into_vec())
    }

    pub fn new_data_handler(handler_id: u16, session_id: u32) -> Self {
        CtrlPacket::new(CtrlCmd::NewDataHandler, handler_id, session_id, Vec::new())
    }

    pub fn open_session_result(handler_id: u16, session_id: u32, success: bool) -> Self {
        let cmd = match success {
            true => CtrlCmd::SuccessOfOpenSession,
            false => CtrlCmd::FailOfOpenSession,
        };
        CtrlPacket::new(cmd, handler_id, session_id, Vec::new())
    }

    pub fn open_session_ack(handler_id: u16, session_id: u32) -> Self {
        CtrlPacket::new(CtrlCmd::SuccessOfOpenSessionAck, handler_id, session_id, Vec::new())
    }

    pub fn message(ctrl_id: u16, message: &TunnelMessage) -> Result<Self, Error> {
        let json = serde_json::to_vec(message).map_err(|e| Error::new(ErrorKind::InvalidData, e))?;
        if json.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::new(ErrorKind::InvalidData, "message payload too large"));
        }
        Ok(CtrlPacket::new(CtrlCmd::Message, ctrl_id, 0, json))
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Name and key from an `AckCtrl` payload.
    pub fn auth(&self) -> Result<(String, String), Error> {
        let mut reader = BufferReader::new(&self.data);
        let name = reader.read_string()?;
        let key = reader.read_string()?;
        Ok((name, key))
    }

    pub fn open_opt(&self) -> Result<OpenOpt, Error> {
        let mut reader = BufferReader::new(&self.data);
        let host = reader.read_string()?;
        let port = reader.read_u16()?;
        let tls = reader.read_bool()?;
        let buffer_limit = reader.read_i32()?;
        Ok(OpenOpt { host, port, tls, buffer_limit })
    }

    /// Drain length from a `CloseSession` payload.
    pub fn wait_receive_length(&self) -> Result<u32, Error> {
        BufferReader::new(&self.data).read_u32()
    }

    pub fn tunnel_message(&self) -> Result<TunnelMessage, Error> {
        serde_json::from_slice(&self.data).map_err(|e| Error::new(ErrorKind::InvalidData, e))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = BufferWriter::with_capacity(HEADER_LEN + self.data.len());
        writer
            .write_raw(PACKET_MAGIC)
            .write_u8(self.cmd.into_u8())
            .write_u16(self.id)
            .write_u32(self.session_id)
            .write_u32(self.data.len() as u32)
            .write_raw(&self.data);
        writer.into_vec()
    }

    /// Decodes one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed, and
    /// `Ok(Some((packet, consumed)))` once a whole packet is available.
    /// Framing violations (bad magic, unknown command, oversize payload,
    /// non-empty `SyncCtrl`) are [`ErrorKind::InvalidData`] and fatal to the
    /// connection.
    pub fn decode(buf: &[u8]) -> Result<Option<(CtrlPacket, usize)>, Error> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut reader = BufferReader::new(buf);
        let magic = reader.read_raw(4)?;
        if magic != PACKET_MAGIC {
            return Err(Error::new(ErrorKind::InvalidData, "bad control packet magic"));
        }

        let cmd_byte = reader.read_u8()?;
        let cmd = CtrlCmd::from_u8(cmd_byte)
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, format!("unknown control command {cmd_byte}")))?;

        let id = reader.read_u16()?;
        let session_id = reader.read_u32()?;
        let data_len = reader.read_u32()? as usize;
        if data_len > MAX_PAYLOAD_SIZE + HEADER_LEN {
            return Err(Error::new(ErrorKind::InvalidData, "control packet payload too large"));
        }
        if cmd == CtrlCmd::SyncCtrl && data_len != 0 {
            return Err(Error::new(ErrorKind::InvalidData, "SyncCtrl must have an empty payload"));
        }

        if reader.remaining() < data_len {
            return Ok(None);
        }

        let data = reader.read_raw(data_len)?.to_vec();
        Ok(Some((CtrlPacket::new(cmd, id, session_id, data), HEADER_LEN + data_len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(packet: CtrlPacket) -> CtrlPacket {
        let bytes = packet.encode();
        let (decoded, consumed) = CtrlPacket::decode(&bytes).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        decoded
    }

    #[test]
    fn round_trips_every_command() {
        let opt = OpenOpt {
            host: "10.0.0.7".into(),
            port: 8080,
            tls: true,
            buffer_limit: -1,
        };

        let packets = vec![
            CtrlPacket::sync_ctrl(),
            CtrlPacket::sync_ctrl_ack(12),
            CtrlPacket::ack_ctrl(12, "laptop", "secret-key"),
            CtrlPacket::open_session(10001, 55, &opt),
            CtrlPacket::close_session(10001, 55, 9999),
            CtrlPacket::new_data_handler(10002, 56),
            CtrlPacket::open_session_result(10001, 55, false),
            CtrlPacket::open_session_result(10001, 55, true),
            CtrlPacket::open_session_ack(10001, 55),
            CtrlPacket::message(12, &TunnelMessage::Log("hello".into())).unwrap(),
        ];

        for packet in packets {
            let decoded = round_trip(packet.clone());
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn accessors_parse_payloads() {
        let opt = OpenOpt {
            host: "internal.example".into(),
            port: 443,
            tls: false,
            buffer_limit: 1_048_576,
        };

        let decoded = round_trip(CtrlPacket::open_session(10005, 3, &opt));
        assert_eq!(decoded.open_opt().unwrap(), opt);

        let decoded = round_trip(CtrlPacket::ack_ctrl(1, "name", "key"));
        assert_eq!(decoded.auth().unwrap(), ("name".to_string(), "key".to_string()));

        let decoded = round_trip(CtrlPacket::close_session(10005, 3, 1234));
        assert_eq!(decoded.wait_receive_length().unwrap(), 1234);

        let message = TunnelMessage::SysInfo(serde_json::json!({"hostname": "box"}));
        let decoded = round_trip(CtrlPacket::message(1, &message).unwrap());
        assert_eq!(decoded.tunnel_message().unwrap(), message);
    }

    #[test]
    fn incomplete_buffers_ask_for_more() {
        let bytes = CtrlPacket::ack_ctrl(3, "n", "k").encode();
        for cut in 0..bytes.len() {
            assert!(CtrlPacket::decode(&bytes[..cut]).unwrap().is_none(), "cut at {cut}");
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = CtrlPacket::sync_ctrl().encode();
        bytes[0] = b'X';
        assert_eq!(CtrlPacket::decode(&bytes).unwrap_err().kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_unknown_command() {
        let mut bytes = CtrlPacket::sync_ctrl().encode();
        bytes[4] = 200;
        assert_eq!(CtrlPacket::decode(&bytes).unwrap_err().kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_oversize_payload() {
        let mut bytes = CtrlPacket::new_data_handler(10000, 1).encode();
        let claimed = (MAX_PAYLOAD_SIZE + HEADER_LEN + 1) as u32;
        bytes[11..15].copy_from_slice(&claimed.to_be_bytes());
        assert_eq!(CtrlPacket::decode(&bytes).unwrap_err().kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_sync_ctrl_with_payload() {
        let mut bytes = CtrlPacket::sync_ctrl().encode();
        bytes[11..15].copy_from_slice(&1u32.to_be_bytes());
        bytes.push(0);
        assert_eq!(CtrlPacket::decode(&bytes).unwrap_err().kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn decode_reports_consumed_bytes_with_trailing_data() {
        let mut bytes = CtrlPacket::sync_ctrl_ack(9).encode();
        let packet_len = bytes.len();
        bytes.extend_from_slice(b"extra");
        let (decoded, consumed) = CtrlPacket::decode(&bytes).unwrap().unwrap();
        assert_eq!(decoded.cmd, CtrlCmd::SyncCtrlAck);
        assert_eq!(consumed, packet_len);
    }
}
