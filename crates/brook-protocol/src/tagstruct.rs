//! Tag-length-value payload codec.
//!
//! Control packet bodies are sequences of typed values, each prefixed with a
//! one-byte type tag. Requests start with `(command: u32, tag: u32)` followed
//! by command-specific fields.

use crate::error::{ProtocolError, ProtocolResult};

/// Type tag for a big-endian u32.
pub const TAG_U32: u8 = b'L';
/// Type tag for a NUL-terminated UTF-8 string.
pub const TAG_STRING: u8 = b't';
/// Type tag for a u32-length-prefixed byte blob.
pub const TAG_BYTES: u8 = b'x';

/// Builder for an outgoing tagstruct payload.
#[derive(Debug, Default, Clone)]
pub struct Tagstruct {
    data: Vec<u8>,
}

impl Tagstruct {
    /// Creates an empty tagstruct.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tagstruct already carrying a command and correlation tag.
    pub fn request(command: u32, tag: u32) -> Self {
        let mut t = Self::new();
        t.put_u32(command);
        t.put_u32(tag);
        t
    }

    /// Appends a u32 value.
    pub fn put_u32(&mut self, value: u32) {
        self.data.push(TAG_U32);
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    /// Appends a string value.
    pub fn put_string(&mut self, value: &str) {
        self.data.push(TAG_STRING);
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
    }

    /// Appends an opaque byte blob.
    pub fn put_bytes(&mut self, value: &[u8]) {
        self.data.push(TAG_BYTES);
        self.data.extend_from_slice(&(value.len() as u32).to_be_bytes());
        self.data.extend_from_slice(value);
    }

    /// Returns the encoded payload.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the builder, returning the encoded payload.
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Cursor over an incoming tagstruct payload.
#[derive(Debug, Clone, Copy)]
pub struct TagstructReader<'a> {
    data: &'a [u8],
}

impl<'a> TagstructReader<'a> {
    /// Creates a reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// True once every value has been consumed.
    pub fn eof(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    fn expect_tag(&mut self, expected: u8, what: &'static str) -> ProtocolResult<()> {
        let Some((&found, rest)) = self.data.split_first() else {
            return Err(ProtocolError::Truncated { what });
        };
        if found != expected {
            return Err(ProtocolError::UnexpectedTag {
                expected: expected as char,
                found: found as char,
            });
        }
        self.data = rest;
        Ok(())
    }

    /// Reads a u32 value.
    pub fn get_u32(&mut self) -> ProtocolResult<u32> {
        self.expect_tag(TAG_U32, "u32")?;
        if self.data.len() < 4 {
            return Err(ProtocolError::Truncated { what: "u32" });
        }
        let (head, rest) = self.data.split_at(4);
        self.data = rest;
        Ok(u32::from_be_bytes(head.try_into().expect("4-byte slice")))
    }

    /// Reads a NUL-terminated string value.
    pub fn get_string(&mut self) -> ProtocolResult<&'a str> {
        self.expect_tag(TAG_STRING, "string")?;
        let end = self
            .data
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::InvalidString)?;
        let (head, rest) = self.data.split_at(end);
        self.data = &rest[1..];
        std::str::from_utf8(head).map_err(|_| ProtocolError::InvalidString)
    }

    /// Reads an opaque byte blob.
    pub fn get_bytes(&mut self) -> ProtocolResult<&'a [u8]> {
        self.expect_tag(TAG_BYTES, "bytes")?;
        if self.data.len() < 4 {
            return Err(ProtocolError::Truncated { what: "bytes" });
        }
        let (head, rest) = self.data.split_at(4);
        let len = u32::from_be_bytes(head.try_into().expect("4-byte slice")) as usize;
        if rest.len() < len {
            return Err(ProtocolError::Truncated { what: "bytes" });
        }
        let (blob, rest) = rest.split_at(len);
        self.data = rest;
        Ok(blob)
    }
}
