//! Sequential binary codec used by every message payload and the save stream.
//!
//! Fields are written one after another with bincode's default options:
//! fixed-width little-endian integers and `u64` length prefixes for strings
//! and byte vectors. A [`Reader`] consumes the same fields in the same order.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to encode value: {0}")]
    Encode(#[source] bincode::Error),
    #[error("failed to decode value: {0}")]
    Decode(#[source] bincode::Error),
    #[error("bad {what} sentinel: expected {expected}, found {found}")]
    Sentinel {
        what: &'static str,
        expected: i16,
        found: i16,
    },
    #[error("length {0} does not fit the wire format")]
    Length(usize),
}

/// Append-only encoder over a growable byte buffer
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes one value at the end of the buffer
    pub fn put<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), WireError> {
        bincode::serialize_into(&mut self.buf, value).map_err(WireError::Encode)
    }

    /// Appends bytes verbatim, without a length prefix
    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Writes a collection length as the `i32` count the protocol uses
    pub fn put_count(&mut self, len: usize) -> Result<(), WireError> {
        let count = i32::try_from(len).map_err(|_| WireError::Length(len))?;
        self.put(&count)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over an encoded byte slice
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    input: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input }
    }

    /// Decodes the next value and advances past it
    pub fn get<T: DeserializeOwned>(&mut self) -> Result<T, WireError> {
        bincode::deserialize_from(&mut self.input).map_err(WireError::Decode)
    }

    /// Reads an `i32` count written by [`Writer::put_count`]
    pub fn get_count(&mut self) -> Result<usize, WireError> {
        let count: i32 = self.get()?;
        usize::try_from(count).map_err(|_| WireError::Length(count as usize))
    }

    /// Reads an `i16` and checks it against the expected sentinel
    pub fn expect_sentinel(&mut self, what: &'static str, expected: i16) -> Result<(), WireError> {
        let found: i16 = self.get()?;
        if found != expected {
            return Err(WireError::Sentinel {
                what,
                expected,
                found,
            });
        }
        Ok(())
    }

    /// Bytes not consumed yet
    pub fn remaining(&self) -> &'a [u8] {
        self.input
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }
}

/// Encodes a single value into a fresh buffer
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, WireError> {
    bincode::serialize(value).map_err(WireError::Encode)
}

/// Decodes a single value from the front of `bytes`
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    Reader::new(bytes).get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_read_back_in_order() {
        let mut writer = Writer::new();
        writer.put(&3i16).unwrap();
        writer.put(&42i32).unwrap();
        writer.put("name").unwrap();
        writer.put(&true).unwrap();

        let bytes = writer.into_bytes();
        let mut reader = Reader::new(&bytes);
        assert_eq!(reader.get::<i16>().unwrap(), 3);
        assert_eq!(reader.get::<i32>().unwrap(), 42);
        assert_eq!(reader.get::<String>().unwrap(), "name");
        assert!(reader.get::<bool>().unwrap());
        assert!(reader.is_empty());
    }

    #[test]
    fn test_integers_are_fixed_width_little_endian() {
        let bytes = encode(&0x0102_0304i32).unwrap();
        assert_eq!(bytes, vec![0x04, 0x03, 0x02, 0x01]);

        let bytes = encode(&7285i16).unwrap();
        assert_eq!(bytes.len(), 2);
    }

    #[test]
    fn test_sentinel_mismatch_is_reported() {
        let bytes = encode(&1234i16).unwrap();
        let mut reader = Reader::new(&bytes);
        let err = reader.expect_sentinel("test", 4210).unwrap_err();
        assert!(matches!(
            err,
            WireError::Sentinel {
                expected: 4210,
                found: 1234,
                ..
            }
        ));
    }

    #[test]
    fn test_truncated_input_fails() {
        let bytes = encode(&42i32).unwrap();
        let mut reader = Reader::new(&bytes[..2]);
        assert!(matches!(reader.get::<i32>(), Err(WireError::Decode(_))));
    }

    #[test]
    fn test_negative_count_rejected() {
        let bytes = encode(&-1i32).unwrap();
        let mut reader = Reader::new(&bytes);
        assert!(matches!(reader.get_count(), Err(WireError::Length(_))));
    }

    #[test]
    fn test_raw_bytes_have_no_prefix() {
        let mut writer = Writer::new();
        writer.put_raw(&[1, 2, 3]);
        assert_eq!(writer.len(), 3);
        assert_eq!(writer.into_bytes(), vec![1, 2, 3]);
    }
}
