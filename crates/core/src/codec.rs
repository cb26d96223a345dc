//! Binary codec shared by value persistence and the compiled-script cache.
//!
//! All multi-byte integers are little-endian. Text is written as a `u32`
//! byte length followed by UTF-8; blocks use the same length prefix.
//!
//! A [`Writer`] always stamps the stream with a [`ProtocolVersion`] so that
//! readers can decide which optional payload shapes to expect.

use thiserror::Error;

/// Errors produced while encoding or decoding a byte stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("unexpected end of data: needed {needed} more bytes at offset {offset}")]
    UnexpectedEnd { offset: usize, needed: usize },

    #[error("invalid UTF-8 text at offset {offset}")]
    InvalidText { offset: usize },

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("{0}")]
    Invalid(String),

    /// A length that does not fit the `u32` prefix.
    #[error("length {len} is too large to encode")]
    TooLong { len: usize },
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Version of the serialized format.
///
/// V2 added the high-resolution component of time values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    V1 = 1,
    V2 = 2,
}

impl ProtocolVersion {
    pub const LATEST: ProtocolVersion = ProtocolVersion::V2;

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(ProtocolVersion::V1),
            2 => Ok(ProtocolVersion::V2),
            other => Err(CodecError::UnsupportedVersion(other)),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        ProtocolVersion::LATEST
    }
}

/// Appends encoded data to an owned byte buffer.
#[derive(Debug, Clone)]
pub struct Writer {
    bytes: Vec<u8>,
    version: ProtocolVersion,
}

impl Writer {
    pub fn new() -> Self {
        Self::with_version(ProtocolVersion::LATEST)
    }

    pub fn with_version(version: ProtocolVersion) -> Self {
        Writer {
            bytes: Vec::new(),
            version,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Writes the protocol version byte. Streams that are read back with
    /// [`Reader::with_header`] must start with this.
    pub fn write_header(&mut self) -> &mut Self {
        let byte = self.version.as_byte();
        self.write_u8(byte)
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.bytes.push(value);
        self
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.write_u8(value as u8)
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_f64(&mut self, value: f64) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Writes a collection length as a `u32` prefix.
    pub fn write_len(&mut self, len: usize) -> Result<&mut Self> {
        let prefix = u32::try_from(len).map_err(|_| CodecError::TooLong { len })?;
        Ok(self.write_u32(prefix))
    }

    pub fn write_text(&mut self, text: &str) -> Result<&mut Self> {
        self.write_block(text.as_bytes())
    }

    pub fn write_block(&mut self, block: &[u8]) -> Result<&mut Self> {
        self.write_len(block.len())?;
        self.bytes.extend_from_slice(block);
        Ok(self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor over an encoded byte slice.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    version: ProtocolVersion,
}

impl<'a> Reader<'a> {
    /// Reader for a headerless stream written with the latest version.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self::with_version(bytes, ProtocolVersion::LATEST)
    }

    pub fn with_version(bytes: &'a [u8], version: ProtocolVersion) -> Self {
        Reader {
            bytes,
            pos: 0,
            version,
        }
    }

    /// Reads the leading version byte written by [`Writer::write_header`].
    pub fn with_header(bytes: &'a [u8]) -> Result<Self> {
        let mut reader = Self::new(bytes);
        let version = ProtocolVersion::from_byte(reader.read_u8()?)?;
        reader.version = version;
        Ok(reader)
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.remaining() < count {
            return Err(CodecError::UnexpectedEnd {
                offset: self.pos,
                needed: count - self.remaining(),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::Invalid(format!(
                "invalid boolean byte {} at offset {}",
                other,
                self.pos - 1
            ))),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    /// Reads a length prefix and checks that at least `min_item_size * len`
    /// bytes remain, so corrupt counts fail fast instead of allocating.
    pub fn read_len(&mut self, min_item_size: usize) -> Result<usize> {
        let len = self.read_u32()? as usize;
        let needed = len.saturating_mul(min_item_size);
        if needed > self.remaining() {
            return Err(CodecError::UnexpectedEnd {
                offset: self.pos,
                needed: needed - self.remaining(),
            });
        }
        Ok(len)
    }

    pub fn read_text(&mut self) -> Result<String> {
        let len = self.read_len(1)?;
        let offset = self.pos;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidText { offset })
    }

    pub fn read_block(&mut self) -> Result<Vec<u8>> {
        let len = self.read_len(1)?;
        Ok(self.take(len)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitives_are_little_endian() {
        let mut writer = Writer::new();
        writer.write_u32(0x0403_0201).write_u16(0x0605);
        assert_eq!(writer.as_bytes(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_read_back_mixed_stream() {
        let mut writer = Writer::new();
        writer
            .write_header()
            .write_text("héllo")
            .unwrap()
            .write_f64(-2.5)
            .write_block(&[9, 8, 7])
            .unwrap()
            .write_bool(true)
            .write_i64(-42);
        let bytes = writer.into_bytes();

        let mut reader = Reader::with_header(&bytes).unwrap();
        assert_eq!(reader.version(), ProtocolVersion::LATEST);
        assert_eq!(reader.read_text().unwrap(), "héllo");
        assert_eq!(reader.read_f64().unwrap(), -2.5);
        assert_eq!(reader.read_block().unwrap(), vec![9, 8, 7]);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_i64().unwrap(), -42);
        assert!(reader.at_end());
    }

    #[test]
    fn test_truncated_input_fails() {
        let mut reader = Reader::new(&[1, 2]);
        let err = reader.read_u32().unwrap_err();
        assert_eq!(
            err,
            CodecError::UnexpectedEnd {
                offset: 0,
                needed: 2
            }
        );
    }

    #[test]
    fn test_huge_length_prefix_is_rejected() {
        let mut writer = Writer::new();
        writer.write_u32(u32::MAX);
        let bytes = writer.into_bytes();
        let mut reader = Reader::new(&bytes);
        assert!(reader.read_text().is_err());
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_length_beyond_prefix_fails() {
        let mut writer = Writer::new();
        let len = u32::MAX as usize + 1;
        assert_eq!(writer.write_len(len).unwrap_err(), CodecError::TooLong { len });
        assert!(writer.is_empty());
        writer.write_len(u32::MAX as usize).unwrap();
        assert_eq!(writer.as_bytes(), &[0xff; 4]);
    }

    #[test]
    fn test_unknown_version_header() {
        let err = Reader::with_header(&[99]).unwrap_err();
        assert_eq!(err, CodecError::UnsupportedVersion(99));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut writer = Writer::new();
        writer.write_block(&[0xff, 0xfe]).unwrap();
        let bytes = writer.into_bytes();
        let mut reader = Reader::new(&bytes);
        assert!(matches!(
            reader.read_text(),
            Err(CodecError::InvalidText { offset: 4 })
        ));
    }
}
