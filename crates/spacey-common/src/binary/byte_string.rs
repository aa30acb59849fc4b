// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Immutable byte string

use super::{Binary, ByteArray, Charset, SplitOptions, clamp_range, split_ranges};
use crate::error::Result;
use bytes::Bytes;
use std::fmt;

/// An immutable byte sequence
///
/// Cloning and slicing share storage. The empty ByteString is a static value
/// and never allocates.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct ByteString(Bytes);

impl ByteString {
    /// The empty ByteString
    pub const fn new() -> Self {
        Self(Bytes::new())
    }

    /// Encode a string with the named charset
    pub fn from_str_with(text: &str, charset: &str) -> Result<Self> {
        Ok(Self::from(Charset::parse(charset)?.encode(text)?))
    }

    /// The byte at `offset` as a one-byte ByteString, empty when out of range
    pub fn byte_at(&self, offset: usize) -> ByteString {
        if offset >= self.0.len() {
            return ByteString::new();
        }
        Self(self.0.slice(offset..offset + 1))
    }

    /// A new ByteString over `[begin, end)`, sharing storage.
    ///
    /// Negative positions count from the end.
    pub fn slice(&self, begin: isize, end: Option<isize>) -> ByteString {
        let range = clamp_range(self.0.len(), begin, end);
        Self::from(self.0.slice(range))
    }

    /// A new ByteString holding `self` followed by every item of `others`
    pub fn concat(&self, others: &[&dyn Binary]) -> ByteString {
        if others.iter().all(|other| other.is_empty()) {
            return self.clone();
        }
        let total = others.iter().fold(self.0.len(), |acc, b| acc + b.len());
        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&self.0);
        for other in others {
            buf.extend_from_slice(other.as_slice());
        }
        Self::from(buf)
    }

    /// Split at any of `delimiters`
    pub fn split(&self, delimiters: &[&[u8]], options: SplitOptions) -> Vec<ByteString> {
        split_ranges(&self.0, delimiters, options)
            .into_iter()
            .map(|range| Self::from(self.0.slice(range)))
            .collect()
    }

    /// A mutable copy. Storage stays shared until the copy is mutated.
    pub fn to_byte_array(&self) -> ByteArray {
        ByteArray::from(self)
    }

    /// The underlying platform buffer
    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl Binary for ByteString {
    fn as_slice(&self) -> &[u8] {
        &self.0
    }

    fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }
}

impl From<Bytes> for ByteString {
    fn from(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            return Self::new();
        }
        Self(bytes)
    }
}

impl From<Vec<u8>> for ByteString {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from(Bytes::from(bytes))
    }
}

impl From<&[u8]> for ByteString {
    fn from(bytes: &[u8]) -> Self {
        Self::from(Bytes::copy_from_slice(bytes))
    }
}

impl From<&str> for ByteString {
    fn from(text: &str) -> Self {
        Self::from(text.as_bytes())
    }
}

impl From<&ByteArray> for ByteString {
    fn from(bytes: &ByteArray) -> Self {
        bytes.to_byte_string()
    }
}

impl From<ByteArray> for ByteString {
    fn from(bytes: ByteArray) -> Self {
        bytes.to_byte_string()
    }
}

impl AsRef<[u8]> for ByteString {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl PartialEq<[u8]> for ByteString {
    fn eq(&self, other: &[u8]) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for ByteString {
    fn eq(&self, other: &&str) -> bool {
        self.0 == other.as_bytes()
    }
}

impl fmt::Debug for ByteString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ByteString").field(&self.0).finish()
    }
}

impl fmt::Display for ByteString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[ByteString {}]", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_at() {
        let bytes = ByteString::from("abc");
        assert_eq!(bytes.byte_at(1), "b");
        assert!(bytes.byte_at(3).is_empty());
        assert_eq!(bytes.get(0), Some(b'a'));
        assert_eq!(bytes.get(3), None);
    }

    #[test]
    fn test_slice_negative() {
        let bytes = ByteString::from("hello");
        assert_eq!(bytes.slice(-3, None), "llo");
        assert_eq!(bytes.slice(1, Some(-1)), "ell");
        assert!(bytes.slice(4, Some(2)).is_empty());
    }

    #[test]
    fn test_shares_storage_with_byte_array() {
        let array = ByteArray::from(vec![1, 2, 3]);
        let string = array.to_byte_string();
        assert_eq!(string.as_slice().as_ptr(), array.as_slice().as_ptr());

        let mut copy = string.to_byte_array();
        copy.set(0, 9).unwrap();
        assert_eq!(string.as_slice(), &[1, 2, 3]);
        assert_eq!(copy.as_slice(), &[9, 2, 3]);
    }

    #[test]
    fn test_concat_and_split() {
        let bytes = ByteString::from("a b");
        assert_eq!(bytes.concat(&[]), bytes);
        let joined = bytes.concat(&[&ByteArray::from(" c")]);
        assert_eq!(joined, "a b c");

        let words = joined.split(&[b" ".as_slice()], SplitOptions::default());
        assert_eq!(words, vec![ByteString::from("a"), "b".into(), "c".into()]);
    }

    #[test]
    fn test_display_and_charset() {
        let bytes = ByteString::from_str_with("hi", "utf-16le").unwrap();
        assert_eq!(bytes.len(), 4);
        assert_eq!(bytes.to_string(), "[ByteString 4]");
        assert_eq!(bytes.decode_to_string(Some("UTF-16LE")).unwrap(), "hi");
    }

    #[test]
    fn test_hex_and_base64_text() {
        let bytes = ByteString::from(vec![0xde, 0xad, 0xbe, 0xef]);
        let text = bytes.decode_to_string(Some("hex")).unwrap();
        assert_eq!(text, "deadbeef");
        assert_eq!(ByteString::from_str_with(&text, "hex").unwrap(), bytes);

        let text = bytes.decode_to_string(Some("base64")).unwrap();
        assert_eq!(text, "3q2+7w==");
        assert_eq!(ByteString::from_str_with(&text, "base64").unwrap(), bytes);
    }
}
