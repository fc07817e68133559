//! Canonical byte encoding
//!
//! Little-endian integers and CompactSize length prefixes, the layout used
//! for transaction hashes, raw transaction bytes and the 80-byte header.

use thiserror::Error;

/// Decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("Unexpected end of data: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },
    #[error("Trailing bytes after decode: {0}")]
    TrailingBytes(usize),
    #[error("Length prefix too large: {0}")]
    LengthTooLarge(u64),
}

/// Upper bound on any decoded length prefix, guards against hostile input
const MAX_DECODE_LENGTH: u64 = 32 * 1024 * 1024;

// =============================================================================
// Encoder
// =============================================================================

#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// CompactSize: 1, 3, 5 or 9 bytes depending on magnitude
    pub fn write_var_int(&mut self, value: u64) {
        match value {
            0..=0xfc => self.write_u8(value as u8),
            0xfd..=0xffff => {
                self.write_u8(0xfd);
                self.buf.extend_from_slice(&(value as u16).to_le_bytes());
            }
            0x1_0000..=0xffff_ffff => {
                self.write_u8(0xfe);
                self.write_u32_le(value as u32);
            }
            _ => {
                self.write_u8(0xff);
                self.write_u64_le(value);
            }
        }
    }

    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_var_int(bytes.len() as u64);
        self.write_bytes(bytes);
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

// =============================================================================
// Decoder
// =============================================================================

#[derive(Debug)]
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], EncodingError> {
        let remaining = self.data.len() - self.pos;
        if len > remaining {
            return Err(EncodingError::UnexpectedEof {
                needed: len,
                remaining,
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, EncodingError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, EncodingError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, EncodingError> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, EncodingError> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn read_array32(&mut self) -> Result<[u8; 32], EncodingError> {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(self.take(32)?);
        Ok(bytes)
    }

    pub fn read_var_int(&mut self) -> Result<u64, EncodingError> {
        match self.read_u8()? {
            0xfd => Ok(self.read_u16_le()? as u64),
            0xfe => Ok(self.read_u32_le()? as u64),
            0xff => self.read_u64_le(),
            small => Ok(small as u64),
        }
    }

    /// Read a length prefix, bounded so a corrupt prefix cannot trigger a huge allocation
    pub fn read_length(&mut self) -> Result<usize, EncodingError> {
        let len = self.read_var_int()?;
        if len > MAX_DECODE_LENGTH {
            return Err(EncodingError::LengthTooLarge(len));
        }
        Ok(len as usize)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, EncodingError> {
        let len = self.read_length()?;
        Ok(self.take(len)?.to_vec())
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }

    /// Fail if any bytes are left unread
    pub fn finish(self) -> Result<(), EncodingError> {
        let remaining = self.data.len() - self.pos;
        if remaining != 0 {
            return Err(EncodingError::TrailingBytes(remaining));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_int_sizes() {
        for (value, size) in [(0u64, 1), (0xfc, 1), (0xfd, 3), (0xffff, 3), (0x10000, 5), (u64::MAX, 9)] {
            let mut encoder = Encoder::new();
            encoder.write_var_int(value);
            let bytes = encoder.into_inner();
            assert_eq!(bytes.len(), size, "value {value:#x}");

            let mut decoder = Decoder::new(&bytes);
            assert_eq!(decoder.read_var_int().unwrap(), value);
            assert!(decoder.is_empty());
        }
    }

    #[test]
    fn test_eof_reported() {
        let mut decoder = Decoder::new(&[1, 2]);
        assert_eq!(
            decoder.read_u32_le(),
            Err(EncodingError::UnexpectedEof {
                needed: 4,
                remaining: 2
            })
        );
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut decoder = Decoder::new(&[1, 2, 3]);
        decoder.read_u8().unwrap();
        assert_eq!(decoder.finish(), Err(EncodingError::TrailingBytes(2)));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut encoder = Encoder::new();
        encoder.write_var_int(u64::MAX);
        let bytes = encoder.into_inner();
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(
            decoder.read_var_bytes(),
            Err(EncodingError::LengthTooLarge(u64::MAX))
        );
    }
}
