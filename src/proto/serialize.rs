//! Big-endian serialization helpers for the control-channel packets.
//!
//! Control packets are small and fully reassembled in memory before decoding,
//! so these operate on byte slices rather than async streams. Strings are
//! serialized with an `u16` byte-length prefix followed by UTF-8 bytes.

use std::io::{Error, ErrorKind};

/// Implemented by enums whose variants map 1:1 to a byte on the wire.
pub trait U8ReprEnum: Sized {
    fn from_u8(value: u8) -> Option<Self>;
    fn into_u8(self) -> u8;
}

/// Appends big-endian values to a growable buffer.
pub struct BufferWriter {
    buf: Vec<u8>,
}

impl BufferWriter {
    pub fn new() -> Self {
        BufferWriter { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        BufferWriter {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.buf.push(value as u8);
        self
    }

    pub fn write_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// `u16` byte-length prefix followed by UTF-8 bytes. Names, keys and
    /// hostnames all fit; a longer string is a caller bug and is truncated so
    /// the prefix and the bytes written never disagree.
    pub fn write_string(&mut self, value: &str) -> &mut Self {
        debug_assert!(
            value.len() <= u16::MAX as usize,
            "string does not fit a u16 length prefix"
        );
        let len = value.len().min(u16::MAX as usize);
        self.write_u16(len as u16);
        self.buf.extend_from_slice(&value.as_bytes()[..len]);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for BufferWriter {
    fn default() -> Self {
        BufferWriter::new()
    }
}

/// Reads big-endian values from a byte slice, erroring with
/// [`ErrorKind::UnexpectedEof`] when the slice runs out.
pub struct BufferReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BufferReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        BufferReader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], Error> {
        if self.remaining() < count {
            return Err(Error::new(ErrorKind::UnexpectedEof, "buffer ended mid-value"));
        }

        let slice = &self.buf[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, Error> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, Error> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_bool(&mut self) -> Result<bool, Error> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_raw(&mut self, count: usize) -> Result<&'a [u8], Error> {
        self.take(count)
    }

    pub fn read_string(&mut self) -> Result<String, Error> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::new(ErrorKind::InvalidData, "string is not valid UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_scalars_and_strings() {
        let mut writer = BufferWriter::new();
        writer
            .write_u8(7)
            .write_u16(65500)
            .write_u32(0xDEAD_BEEF)
            .write_i32(-5)
            .write_bool(true)
            .write_string("héllo");

        let bytes = writer.into_vec();
        let mut reader = BufferReader::new(&bytes);
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert_eq!(reader.read_u16().unwrap(), 65500);
        assert_eq!(reader.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.read_i32().unwrap(), -5);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_string().unwrap(), "héllo");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn truncated_read_is_unexpected_eof() {
        let bytes = [0u8, 9];
        let mut reader = BufferReader::new(&bytes);
        let error = reader.read_u32().unwrap_err();
        assert_eq!(error.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    #[should_panic(expected = "u16 length prefix")]
    fn oversized_string_is_rejected() {
        let mut writer = BufferWriter::new();
        writer.write_string(&"x".repeat(70_000));
    }

    #[test]
    fn string_length_prefix_is_bytes_not_chars() {
        let mut writer = BufferWriter::new();
        writer.write_string("ñ");
        let bytes = writer.into_vec();
        assert_eq!(bytes[..2], [0, 2]);
    }
}
