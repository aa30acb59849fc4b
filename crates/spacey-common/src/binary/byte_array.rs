// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Mutable, resizable byte buffer with copy-on-write sharing

use super::{Binary, ByteString, Charset, SplitOptions, clamp_range, split_ranges};
use crate::error::{CommonError, Result};
use bytes::Bytes;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Backing storage, possibly shared with other instances
#[derive(Clone)]
enum Storage {
    /// Frozen bytes, shared with a ByteString or a slice
    Shared(Bytes),
    /// A vector shared with other ByteArrays until one of them mutates
    Owned(Arc<Vec<u8>>),
}

/// Lets a `Bytes` view keep an `Owned` vector alive without copying it
struct SharedVec(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedVec {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// A mutable, resizable byte sequence
///
/// Cloning is cheap and shares storage. Every mutating method goes through
/// one copy-on-write barrier, so a clone never observes the mutation.
#[derive(Clone)]
pub struct ByteArray {
    storage: Storage,
    len: usize,
}

impl ByteArray {
    /// Create an empty ByteArray
    pub fn new() -> Self {
        Self {
            storage: Storage::Shared(Bytes::new()),
            len: 0,
        }
    }

    /// Create a zero-filled ByteArray of the given length
    pub fn with_length(len: usize) -> Self {
        Self::from(vec![0u8; len])
    }

    /// Encode a string with the named charset
    pub fn from_str_with(text: &str, charset: &str) -> Result<Self> {
        Ok(Self::from(Charset::parse(charset)?.encode(text)?))
    }

    /// Create a ByteArray from numeric byte values.
    ///
    /// Fails with an argument error when a value does not fit in a byte.
    pub fn from_values<I>(values: I) -> Result<Self>
    where
        I: IntoIterator<Item = i64>,
    {
        let bytes = values
            .into_iter()
            .map(|value| {
                u8::try_from(value).map_err(|_| {
                    CommonError::argument(format!("byte value out of range: {}", value))
                })
            })
            .collect::<Result<Vec<u8>>>()?;
        Ok(Self::from(bytes))
    }

    /// Set the length, zero-filling growth and truncating on shrink.
    ///
    /// Shrinking never copies shared storage.
    pub fn set_length(&mut self, len: usize) {
        if len <= self.len {
            self.len = len;
        } else {
            self.mutate(|buf| buf.resize(len, 0));
        }
    }

    /// Replace the byte at `index`
    pub fn set(&mut self, index: usize, value: u8) -> Result<()> {
        if index >= self.len {
            return Err(CommonError::argument(format!(
                "index {} out of range for ByteArray of length {}",
                index, self.len
            )));
        }
        self.mutate(|buf| buf[index] = value);
        Ok(())
    }

    /// Overwrite `[offset, offset + src.len())` with `src`.
    ///
    /// The range must lie within the current length.
    pub fn write_at(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(src.len())
            .filter(|&end| end <= self.len)
            .ok_or_else(|| {
                CommonError::argument(format!(
                    "write of {} bytes at {} exceeds length {}",
                    src.len(),
                    offset,
                    self.len
                ))
            })?;
        if !src.is_empty() {
            self.mutate(|buf| buf[offset..end].copy_from_slice(src));
        }
        Ok(())
    }

    /// Append bytes, returning the new length
    pub fn push(&mut self, values: &[u8]) -> usize {
        self.mutate(|buf| buf.extend_from_slice(values));
        self.len
    }

    /// Remove and return the last byte
    pub fn pop(&mut self) -> Option<u8> {
        let last = self.get(self.len.checked_sub(1)?)?;
        self.len -= 1;
        Some(last)
    }

    /// Remove and return the first byte
    pub fn shift(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        Some(self.mutate(|buf| buf.remove(0)))
    }

    /// Prepend bytes, returning the new length
    pub fn unshift(&mut self, values: &[u8]) -> usize {
        self.mutate(|buf| {
            buf.splice(0..0, values.iter().copied());
        });
        self.len
    }

    /// Remove `remove` bytes at `index` and insert `insert` in their place.
    ///
    /// A negative `index` counts from the end. When `remove` is `None`,
    /// everything from `index` on is removed. The removed bytes are returned.
    pub fn splice(&mut self, index: isize, remove: Option<usize>, insert: &[u8]) -> ByteArray {
        let start = clamp_range(self.len, index, None).start;
        let end = remove.map_or(self.len, |n| start.saturating_add(n).min(self.len));
        self.mutate(|buf| {
            let removed: Vec<u8> = buf.splice(start..end, insert.iter().copied()).collect();
            ByteArray::from(removed)
        })
    }

    /// Reverse the bytes in place
    pub fn reverse(&mut self) {
        self.mutate(|buf| buf.reverse());
    }

    /// Sort the bytes in ascending order
    pub fn sort(&mut self) {
        self.mutate(|buf| buf.sort_unstable());
    }

    /// Sort the bytes with a comparator
    pub fn sort_by<F>(&mut self, compare: F)
    where
        F: FnMut(&u8, &u8) -> Ordering,
    {
        self.mutate(|buf| buf.sort_by(compare));
    }

    /// A new ByteArray over `[begin, end)`, sharing storage.
    ///
    /// Negative positions count from the end.
    pub fn slice(&self, begin: isize, end: Option<isize>) -> ByteArray {
        let range = clamp_range(self.len, begin, end);
        ByteArray::from(self.to_bytes().slice(range))
    }

    /// A new ByteArray holding `self` followed by every item of `others`
    pub fn concat(&self, others: &[&dyn Binary]) -> ByteArray {
        let total = others.iter().fold(self.len, |acc, b| acc + b.len());
        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(self.as_slice());
        for other in others {
            buf.extend_from_slice(other.as_slice());
        }
        ByteArray::from(buf)
    }

    /// Split at any of `delimiters`
    pub fn split(&self, delimiters: &[&[u8]], options: SplitOptions) -> Vec<ByteArray> {
        let bytes = self.to_bytes();
        split_ranges(&bytes, delimiters, options)
            .into_iter()
            .map(|range| ByteArray::from(bytes.slice(range)))
            .collect()
    }

    /// A new ByteArray with the bytes for which `predicate` holds
    pub fn filter<F>(&self, mut predicate: F) -> ByteArray
    where
        F: FnMut(u8) -> bool,
    {
        ByteArray::from(
            self.as_slice()
                .iter()
                .copied()
                .filter(|&b| predicate(b))
                .collect::<Vec<u8>>(),
        )
    }

    /// A new ByteArray with `f` applied to every byte
    pub fn map<F>(&self, f: F) -> ByteArray
    where
        F: FnMut(u8) -> u8,
    {
        ByteArray::from(self.as_slice().iter().copied().map(f).collect::<Vec<u8>>())
    }

    /// Iterate over the bytes
    pub fn iter(&self) -> std::slice::Iter<'_, u8> {
        self.as_slice().iter()
    }

    /// An immutable view sharing this array's storage
    pub fn to_byte_string(&self) -> ByteString {
        ByteString::from(self.to_bytes())
    }

    /// Run `f` against a private copy of the storage.
    ///
    /// This is the copy-on-write barrier: storage that is still referenced by
    /// another instance is copied first.
    fn mutate<R>(&mut self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        let len = std::mem::take(&mut self.len);
        let storage = std::mem::replace(&mut self.storage, Storage::Shared(Bytes::new()));
        let mut buf = match storage {
            Storage::Owned(vec) => Arc::try_unwrap(vec).unwrap_or_else(|shared| {
                tracing::trace!(len, "copy-on-write of shared ByteArray storage");
                shared[..len].to_vec()
            }),
            Storage::Shared(bytes) => {
                tracing::trace!(len, "copy-on-write of frozen ByteArray storage");
                bytes[..len].to_vec()
            }
        };
        buf.truncate(len);

        let result = f(&mut buf);
        self.len = buf.len();
        self.storage = Storage::Owned(Arc::new(buf));
        result
    }
}

impl Binary for ByteArray {
    fn as_slice(&self) -> &[u8] {
        match &self.storage {
            Storage::Shared(bytes) => &bytes[..self.len],
            Storage::Owned(vec) => &vec[..self.len],
        }
    }

    fn to_bytes(&self) -> Bytes {
        match &self.storage {
            Storage::Shared(bytes) => bytes.slice(..self.len),
            Storage::Owned(vec) => {
                Bytes::from_owner(SharedVec(Arc::clone(vec))).slice(..self.len)
            }
        }
    }
}

impl Default for ByteArray {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Vec<u8>> for ByteArray {
    fn from(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            storage: Storage::Owned(Arc::new(bytes)),
            len,
        }
    }
}

impl From<&[u8]> for ByteArray {
    fn from(bytes: &[u8]) -> Self {
        Self::from(bytes.to_vec())
    }
}

impl From<Bytes> for ByteArray {
    fn from(bytes: Bytes) -> Self {
        let len = bytes.len();
        Self {
            storage: Storage::Shared(bytes),
            len,
        }
    }
}

impl From<&ByteString> for ByteArray {
    fn from(bytes: &ByteString) -> Self {
        Self::from(bytes.to_bytes())
    }
}

impl From<ByteString> for ByteArray {
    fn from(bytes: ByteString) -> Self {
        Self::from(bytes.into_bytes())
    }
}

impl From<&str> for ByteArray {
    fn from(text: &str) -> Self {
        Self::from(text.as_bytes())
    }
}

impl AsRef<[u8]> for ByteArray {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl PartialEq for ByteArray {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for ByteArray {}

impl PartialEq<[u8]> for ByteArray {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_slice() == other
    }
}

impl fmt::Debug for ByteArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ByteArray").field(&self.as_slice()).finish()
    }
}

impl fmt::Display for ByteArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[ByteArray {}]", self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_scenario() {
        let bytes = ByteArray::from(vec![1, 2, 3, 4]);
        let slice = bytes.slice(1, Some(3));
        assert_eq!(slice.as_slice(), &[2, 3]);
        assert_eq!(slice.len(), 2);
    }

    #[test]
    fn test_length_growth_zero_fills() {
        let mut bytes = ByteArray::from(vec![7, 7, 7]);
        bytes.set_length(2);
        bytes.set_length(5);
        assert_eq!(bytes.as_slice(), &[7, 7, 0, 0, 0]);
    }

    #[test]
    fn test_cow_isolation() {
        type Mutation = fn(&mut ByteArray);
        let mutations: [(&str, Mutation); 6] = [
            ("set", |b: &mut ByteArray| b.set(0, 99).unwrap()),
            ("push", |b: &mut ByteArray| {
                b.push(&[5]);
            }),
            ("reverse", |b: &mut ByteArray| b.reverse()),
            ("sort", |b: &mut ByteArray| b.sort_by(|x, y| y.cmp(x))),
            ("grow", |b: &mut ByteArray| b.set_length(8)),
            ("splice", |b: &mut ByteArray| {
                b.splice(1, Some(1), &[42, 43]);
            }),
        ];

        for (name, mutate) in mutations {
            let original = ByteArray::from(vec![3, 1, 2]);
            let mut copy = original.clone();
            let view = original.to_byte_string();
            let sliced = original.slice(0, None);
            mutate(&mut copy);
            assert_eq!(original.as_slice(), &[3, 1, 2], "{}", name);
            assert_eq!(view.as_slice(), &[3, 1, 2], "{}", name);
            assert_eq!(sliced.as_slice(), &[3, 1, 2], "{}", name);

            // and the other way around
            let mut original = ByteArray::from(vec![3, 1, 2]);
            let view = original.to_byte_string();
            let copy = original.clone();
            mutate(&mut original);
            assert_eq!(view.as_slice(), &[3, 1, 2], "{}", name);
            assert_eq!(copy.as_slice(), &[3, 1, 2], "{}", name);
        }
    }

    #[test]
    fn test_shrink_then_mutate_clone() {
        let original = ByteArray::from(vec![1, 2, 3, 4]);
        let mut copy = original.clone();
        copy.set_length(2);
        copy.push(&[9]);
        assert_eq!(copy.as_slice(), &[1, 2, 9]);
        assert_eq!(original.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_stack_operations() {
        let mut bytes = ByteArray::from(vec![2, 3]);
        assert_eq!(bytes.unshift(&[1]), 3);
        assert_eq!(bytes.push(&[4, 5]), 5);
        assert_eq!(bytes.shift(), Some(1));
        assert_eq!(bytes.pop(), Some(5));
        assert_eq!(bytes.as_slice(), &[2, 3, 4]);

        let removed = bytes.splice(-2, None, &[]);
        assert_eq!(removed.as_slice(), &[3, 4]);
        assert_eq!(bytes.as_slice(), &[2]);

        let mut empty = ByteArray::new();
        assert_eq!(empty.pop(), None);
        assert_eq!(empty.shift(), None);
    }

    #[test]
    fn test_set_out_of_range() {
        let mut bytes = ByteArray::with_length(2);
        assert!(matches!(bytes.set(2, 1), Err(CommonError::Argument(_))));
    }

    #[test]
    fn test_from_values_rejects_overflow() {
        assert!(ByteArray::from_values([0, 255]).is_ok());
        assert!(ByteArray::from_values([256]).is_err());
        assert!(ByteArray::from_values([-1]).is_err());
    }

    #[test]
    fn test_concat_split_filter_map() {
        let a = ByteArray::from("ab");
        let b = ByteString::from("|cd");
        let joined = a.concat(&[&b]);
        assert_eq!(joined.as_slice(), b"ab|cd");

        let parts = joined.split(&[b"|".as_slice()], SplitOptions::default());
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].as_slice(), b"cd");

        let upper = joined.filter(|b| b != b'|').map(|b| b.to_ascii_uppercase());
        assert_eq!(upper.as_slice(), b"ABCD");
    }

    #[test]
    fn test_charset_construction() {
        let bytes = ByteArray::from_str_with("héllo", "UTF-8").unwrap();
        assert_eq!(bytes.len(), 6);
        assert_eq!(bytes.decode_to_string(Some("utf8")).unwrap(), "héllo");
        assert!(ByteArray::from_str_with("x", "nope").is_err());
        assert_eq!(bytes.to_string(), "[ByteArray 6]");
    }
}
