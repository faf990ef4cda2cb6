//! The hello packet a client sends as the very first bytes of a fresh data
//! connection, binding that physical connection to a control channel, a data
//! handler id and the session it was opened for.
//!
//! Wire layout (big-endian):
//! `"DATA_STATE"(10) | ctrl_id(4) | handler_id(4) | first_session_id(4)`.
//! The leading `D` is the byte the server sniffs to classify the connection.

use std::io::{Error, ErrorKind};

use crate::proto::serialize::{BufferReader, BufferWriter};

pub const DATA_STATE_MAGIC: &[u8; 10] = b"DATA_STATE";
pub const DATA_STATE_LEN: usize = 10 + 4 + 4 + 4;

/// First byte of [`DATA_STATE_MAGIC`].
pub const DATA_SNIFF_BYTE: u8 = b'D';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataStatePacket {
    pub ctrl_id: u32,
    pub handler_id: u32,
    pub first_session_id: u32,
}

impl DataStatePacket {
    pub fn new(ctrl_id: u32, handler_id: u32, first_session_id: u32) -> Self {
        DataStatePacket {
            ctrl_id,
            handler_id,
            first_session_id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = BufferWriter::with_capacity(DATA_STATE_LEN);
        writer
            .write_raw(DATA_STATE_MAGIC)
            .write_u32(self.ctrl_id)
            .write_u32(self.handler_id)
            .write_u32(self.first_session_id);
        writer.into_vec()
    }

    /// Decodes the hello from the front of `buf`. Returns `Ok(None)` when
    /// more bytes are needed; any leftover bytes after the hello belong to
    /// the session stream.
    pub fn decode(buf: &[u8]) -> Result<Option<(DataStatePacket, usize)>, Error> {
        if buf.len() < DATA_STATE_LEN {
            return Ok(None);
        }

        let mut reader = BufferReader::new(buf);
        if reader.read_raw(10)? != DATA_STATE_MAGIC {
            return Err(Error::new(ErrorKind::InvalidData, "bad data-state magic"));
        }

        let packet = DataStatePacket {
            ctrl_id: reader.read_u32()?,
            handler_id: reader.read_u32()?,
            first_session_id: reader.read_u32()?,
        };
        Ok(Some((packet, DATA_STATE_LEN)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let packet = DataStatePacket::new(3, 10042, 77);
        let bytes = packet.encode();
        assert_eq!(bytes.len(), DATA_STATE_LEN);
        assert_eq!(bytes[0], DATA_SNIFF_BYTE);

        let (decoded, consumed) = DataStatePacket::decode(&bytes).unwrap().unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(consumed, DATA_STATE_LEN);
    }

    #[test]
    fn waits_for_full_hello() {
        let bytes = DataStatePacket::new(1, 10000, 1).encode();
        for cut in 0..bytes.len() {
            assert!(DataStatePacket::decode(&bytes[..cut]).unwrap().is_none());
        }
    }

    #[test]
    fn leftover_bytes_are_not_consumed() {
        let mut bytes = DataStatePacket::new(9, 10001, 5).encode();
        bytes.extend_from_slice(b"session payload");
        let (_, consumed) = DataStatePacket::decode(&bytes).unwrap().unwrap();
        assert_eq!(&bytes[consumed..], b"session payload");
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = DataStatePacket::new(1, 10000, 1).encode();
        bytes[1] = b'X';
        assert_eq!(DataStatePacket::decode(&bytes).unwrap_err().kind(), ErrorKind::InvalidData);
    }
}
