//! Big-endian field primitives shared by every operation codec.
//!
//! Records are self-delimiting: numeric fields are fixed width, strings
//! carry a `u16` byte length and raw payloads a `u32` byte length.

/// Tag dispatch from bytes back to [`crate::op::Operation`].
pub mod factory;

use thiserror::Error;

use crate::{
    op::OperationError,
    types::{MAX_PAYLOAD_LENGTH, MAX_SEGMENT_NAME_LENGTH},
};

/// Failure to rebuild an operation from bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Leading tag does not name a known operation type.
    #[error("unknown operation type tag {0}")]
    UnknownType(u8),
    /// Record ended before `field` could be read.
    #[error("truncated record: `{field}` needs {needed} bytes but {remaining} remain")]
    Truncated {
        /// Field being read.
        field: &'static str,
        /// Bytes required.
        needed: usize,
        /// Bytes left in the record.
        remaining: usize,
    },
    /// String field holds invalid UTF-8.
    #[error("`{field}` is not valid UTF-8")]
    InvalidUtf8 {
        /// Field being read.
        field: &'static str,
    },
    /// Boolean field holds something other than 0 or 1.
    #[error("`{field}` holds invalid boolean byte {value}")]
    InvalidBool {
        /// Field being read.
        field: &'static str,
        /// Raw byte.
        value: u8,
    },
    /// Field that must be non-negative decoded as negative.
    #[error("`{field}` holds negative value {value}")]
    NegativeValue {
        /// Field being read.
        field: &'static str,
        /// Decoded value.
        value: i64,
    },
    /// Bytes left over after a complete record.
    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),
}

impl DecodeError {
    /// True when the record carried an unknown type tag, as opposed to a
    /// malformed payload.
    pub fn is_unknown_type(&self) -> bool {
        matches!(self, Self::UnknownType(_))
    }
}

/// Appends encoded fields to a caller-owned buffer.
pub struct RecordWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> RecordWriter<'a> {
    /// Wraps `buf`; existing contents are kept.
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        Self { buf }
    }

    /// Writes one byte.
    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Writes a signed 64-bit value.
    pub fn put_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Writes an unsigned 64-bit value.
    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Writes a boolean as a single `0`/`1` byte.
    pub fn put_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    /// Writes a `u16`-length-prefixed UTF-8 string.
    pub fn put_str(&mut self, field: &'static str, value: &str) -> Result<(), OperationError> {
        let len = u16::try_from(value.len()).map_err(|_| OperationError::FieldTooLong {
            field,
            len: value.len(),
            max: MAX_SEGMENT_NAME_LENGTH,
        })?;
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    /// Writes a `u32`-length-prefixed byte payload.
    pub fn put_bytes(&mut self, field: &'static str, value: &[u8]) -> Result<(), OperationError> {
        let len = u32::try_from(value.len()).map_err(|_| OperationError::FieldTooLong {
            field,
            len: value.len(),
            max: MAX_PAYLOAD_LENGTH,
        })?;
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.extend_from_slice(value);
        Ok(())
    }
}

/// Reads encoded fields from the front of a byte slice.
pub struct RecordReader<'a> {
    buf: &'a [u8],
}

impl<'a> RecordReader<'a> {
    /// Starts reading at the front of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Unread tail of the input.
    pub fn rest(&self) -> &'a [u8] {
        self.buf
    }

    fn take(&mut self, field: &'static str, needed: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < needed {
            return Err(DecodeError::Truncated {
                field,
                needed,
                remaining: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(needed);
        self.buf = tail;
        Ok(head)
    }

    fn take_array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(field, N)?);
        Ok(out)
    }

    /// Reads one byte.
    pub fn get_u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        Ok(self.take_array::<1>(field)?[0])
    }

    /// Reads a signed 64-bit value.
    pub fn get_i64(&mut self, field: &'static str) -> Result<i64, DecodeError> {
        self.take_array(field).map(i64::from_be_bytes)
    }

    /// Reads a signed 64-bit value that must be `>= 0`.
    pub fn get_non_negative(&mut self, field: &'static str) -> Result<i64, DecodeError> {
        let value = self.get_i64(field)?;
        if value < 0 {
            return Err(DecodeError::NegativeValue { field, value });
        }
        Ok(value)
    }

    /// Reads an unsigned 64-bit value.
    pub fn get_u64(&mut self, field: &'static str) -> Result<u64, DecodeError> {
        self.take_array(field).map(u64::from_be_bytes)
    }

    /// Reads a strict `0`/`1` boolean byte.
    pub fn get_bool(&mut self, field: &'static str) -> Result<bool, DecodeError> {
        match self.get_u8(field)? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(DecodeError::InvalidBool { field, value }),
        }
    }

    /// Reads a `u16`-length-prefixed UTF-8 string.
    pub fn get_str(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let len = usize::from(u16::from_be_bytes(self.take_array(field)?));
        let raw = self.take(field, len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8 { field })
    }

    /// Reads a `u32`-length-prefixed byte payload.
    pub fn get_bytes(&mut self, field: &'static str) -> Result<Vec<u8>, DecodeError> {
        let len = u32::from_be_bytes(self.take_array(field)?) as usize;
        Ok(self.take(field, len)?.to_vec())
    }
}
