//! Packet cursor: append/extract big-endian primitives and length-prefixed
//! strings, with short-read detection.
//!
//! A single read/write cursor over one packet's bytes, built up on the send
//! side and drained on the receive side.

use crate::error::CursorError;

/// A growable byte buffer with an independent read cursor, used to build and
/// decode one datagram at a time.
#[derive(Debug, Clone, Default)]
pub struct PacketCursor {
    bytes: Vec<u8>,
    read_pos: usize,
}

impl PacketCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes, read_pos: 0 }
    }

    pub fn append_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    pub fn append_u16(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    pub fn append_u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    pub fn append_i32(&mut self, value: i32) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    pub fn append_bytes(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// Length-prefixed (u16 big-endian) UTF-8 string.
    pub fn append_string(&mut self, value: &str) {
        let raw = value.as_bytes();
        self.append_u16(raw.len() as u16);
        self.append_bytes(raw);
    }

    fn take(&mut self, n: usize) -> Result<&[u8], CursorError> {
        if self.bytes.len().saturating_sub(self.read_pos) < n {
            return Err(CursorError::UnexpectedEof);
        }
        let slice = &self.bytes[self.read_pos..self.read_pos + n];
        self.read_pos += n;
        Ok(slice)
    }

    pub fn extract_u8(&mut self) -> Result<u8, CursorError> {
        Ok(self.take(1)?[0])
    }

    pub fn extract_u16(&mut self) -> Result<u16, CursorError> {
        let s = self.take(2)?;
        Ok(u16::from_be_bytes([s[0], s[1]]))
    }

    pub fn extract_u32(&mut self) -> Result<u32, CursorError> {
        let s = self.take(4)?;
        Ok(u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
    }

    pub fn extract_i32(&mut self) -> Result<i32, CursorError> {
        self.extract_u32().map(|v| v as i32)
    }

    pub fn extract_string(&mut self) -> Result<String, CursorError> {
        let len = self.extract_u16()? as usize;
        let s = self.take(len)?;
        Ok(String::from_utf8_lossy(s).into_owned())
    }

    /// Consume and return every byte from the read cursor to the end.
    pub fn extract_remaining(&mut self) -> Vec<u8> {
        let rest = self.bytes[self.read_pos..].to_vec();
        self.read_pos = self.bytes.len();
        rest
    }

    pub fn end_of_packet(&self) -> bool {
        self.read_pos >= self.bytes.len()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
        self.read_pos = 0;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Overwrite the leading 4-byte type field in place, used to flip a
    /// queued packet between DATA/DATA_MORE/DATA_TAIL without reallocating.
    pub fn retag(&mut self, new_type: u32) {
        self.bytes[0..4].copy_from_slice(&new_type.to_be_bytes());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_primitives_and_strings() {
        let mut cursor = PacketCursor::new();
        cursor.append_u32(0xDEAD_BEEF);
        cursor.append_i32(-7);
        cursor.append_string("hello");
        let mut cursor = PacketCursor::from_bytes(cursor.into_bytes());
        assert_eq!(cursor.extract_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(cursor.extract_i32().unwrap(), -7);
        assert_eq!(cursor.extract_string().unwrap(), "hello");
        assert!(cursor.end_of_packet());
    }

    #[test]
    fn short_read_is_a_recoverable_error() {
        let mut cursor = PacketCursor::from_bytes(vec![0, 1]);
        assert!(cursor.extract_u32().is_err());
    }

    #[test]
    fn retag_overwrites_only_the_type_field() {
        let mut cursor = PacketCursor::new();
        cursor.append_u32(0xA765_B8F6);
        cursor.append_u32(42);
        cursor.retag(0x782A_2A78);
        let bytes = cursor.into_bytes();
        assert_eq!(&bytes[0..4], &0x782A_2A78u32.to_be_bytes());
        assert_eq!(&bytes[4..8], &42u32.to_be_bytes());
    }

    #[test]
    fn extract_remaining_drains_to_end() {
        let mut cursor = PacketCursor::new();
        cursor.append_u8(1);
        cursor.append_bytes(&[2, 3, 4]);
        let mut cursor = PacketCursor::from_bytes(cursor.into_bytes());
        let _ = cursor.extract_u8().unwrap();
        assert_eq!(cursor.extract_remaining(), vec![2, 3, 4]);
        assert!(cursor.end_of_packet());
    }
}
