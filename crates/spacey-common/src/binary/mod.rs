// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Binary value model
//!
//! Two concrete byte containers share one read-only interface, [`Binary`]:
//!
//! - [`ByteArray`] is mutable and resizable
//! - [`ByteString`] is an immutable view
//!
//! Instances built from one another share storage until one of them mutates.
//! The mutator pays for a private copy, so no mutation is ever observable
//! through a different instance.

mod byte_array;
mod byte_string;
pub mod charset;

pub use byte_array::ByteArray;
pub use byte_string::ByteString;
pub use charset::{Charset, Decoder};

use crate::error::{CommonError, Result};
use bytes::Bytes;
use std::ops::Range;

/// Read-only capability shared by every byte container
///
/// Binary values cross fiber boundaries, so every implementation is
/// `Send + Sync`.
pub trait Binary: Send + Sync {
    /// The bytes in `[0, len)`
    fn as_slice(&self) -> &[u8];

    /// A shared snapshot of the current bytes.
    ///
    /// The snapshot never observes later mutations of `self`.
    fn to_bytes(&self) -> Bytes;

    /// Number of bytes
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether there are no bytes
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The byte at `index`, or `None` past the end
    fn get(&self, index: usize) -> Option<u8> {
        self.as_slice().get(index).copied()
    }

    /// First position of `byte` within `[start, stop)`
    fn index_of(&self, byte: u8, start: usize, stop: Option<usize>) -> Option<usize> {
        let range = search_range(self.len(), start, stop);
        let offset = range.start;
        self.as_slice()[range]
            .iter()
            .position(|&b| b == byte)
            .map(|i| i + offset)
    }

    /// Last position of `byte` within `[start, stop)`
    fn last_index_of(&self, byte: u8, start: usize, stop: Option<usize>) -> Option<usize> {
        let range = search_range(self.len(), start, stop);
        let offset = range.start;
        self.as_slice()[range]
            .iter()
            .rposition(|&b| b == byte)
            .map(|i| i + offset)
    }

    /// Decode the bytes with the named charset, UTF-8 when `None`
    fn decode_to_string(&self, charset: Option<&str>) -> Result<String> {
        let charset = match charset {
            Some(name) => Charset::parse(name)?,
            None => Charset::Utf8,
        };
        Ok(charset.decode(self.as_slice()))
    }

    /// The bytes as a plain vector
    fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }

    /// Copy `self[begin..end]` into `target` starting at `target_start`.
    ///
    /// The target is never grown. Bytes that do not fit are dropped, and the
    /// number of bytes actually copied is returned.
    fn copy_to(
        &self,
        target: &mut ByteArray,
        begin: usize,
        end: Option<usize>,
        target_start: usize,
    ) -> Result<usize> {
        let source = search_range(self.len(), begin, end);
        if target_start > target.len() {
            return Err(CommonError::argument(format!(
                "target offset {} is past the end of a ByteArray of length {}",
                target_start,
                target.len()
            )));
        }
        let count = source.len().min(target.len() - target_start);
        let src = &self.as_slice()[source.start..source.start + count];
        target.write_at(target_start, src)?;
        Ok(count)
    }
}

/// Options for [`ByteArray::split`] and [`ByteString::split`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SplitOptions {
    /// Maximum number of parts to return. The last part keeps any
    /// remaining delimiters.
    pub count: Option<usize>,
    /// Whether matched delimiters are returned as parts of their own
    pub include_delimiter: bool,
}

/// Resolve a `slice(begin, end)` pair against a length.
///
/// Negative positions count back from the end, and both positions are
/// clamped into `[0, len]`. An inverted range is empty.
pub fn clamp_range(len: usize, begin: isize, end: Option<isize>) -> Range<usize> {
    let resolve = |pos: isize| -> usize {
        if pos < 0 {
            len.saturating_sub(pos.unsigned_abs())
        } else {
            (pos as usize).min(len)
        }
    };
    let start = resolve(begin);
    let stop = end.map_or(len, resolve);
    start..stop.max(start)
}

pub(crate) fn search_range(len: usize, start: usize, stop: Option<usize>) -> Range<usize> {
    let stop = stop.map_or(len, |s| s.min(len));
    let start = start.min(stop);
    start..stop
}

/// Split `data` at any of `delimiters`, returning the ranges of the parts.
pub(crate) fn split_ranges(
    data: &[u8],
    delimiters: &[&[u8]],
    options: SplitOptions,
) -> Vec<Range<usize>> {
    let mut parts = Vec::new();
    let mut pieces = 0;
    let mut start = 0;
    let mut current = 0;

    'bytes: while current < data.len() {
        if options.count.is_some_and(|count| pieces + 1 >= count) {
            break;
        }
        for delimiter in delimiters {
            // An empty delimiter never splits
            if delimiter.is_empty() {
                current = data.len();
                continue 'bytes;
            }
            if data[current..].starts_with(delimiter) {
                parts.push(start..current);
                pieces += 1;
                if options.include_delimiter {
                    parts.push(current..current + delimiter.len());
                }
                current += delimiter.len();
                start = current;
                continue 'bytes;
            }
        }
        current += 1;
    }

    if start < data.len() {
        parts.push(start..data.len());
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_range() {
        assert_eq!(clamp_range(4, 1, Some(3)), 1..3);
        assert_eq!(clamp_range(4, -2, None), 2..4);
        assert_eq!(clamp_range(4, 0, Some(-1)), 0..3);
        assert_eq!(clamp_range(4, 3, Some(1)), 3..3);
        assert_eq!(clamp_range(4, -10, Some(10)), 0..4);
    }

    #[test]
    fn test_split_ranges() {
        let data = b"a,b;;c";
        let delimiters = [b",".as_slice(), b";".as_slice()];
        let parts = split_ranges(data, &delimiters, SplitOptions::default());
        let parts: Vec<&[u8]> = parts.into_iter().map(|r| &data[r]).collect();
        let expected: Vec<&[u8]> = vec![&b"a"[..], &b"b"[..], &b""[..], &b"c"[..]];
        assert_eq!(parts, expected);
    }

    #[test]
    fn test_split_with_count_and_delimiters() {
        let data = b"1--2--3";
        let options = SplitOptions {
            count: Some(2),
            include_delimiter: true,
        };
        let parts: Vec<&[u8]> = split_ranges(data, &[b"--".as_slice()], options)
            .into_iter()
            .map(|r| &data[r])
            .collect();
        let expected: Vec<&[u8]> = vec![&b"1"[..], &b"--"[..], &b"2--3"[..]];
        assert_eq!(parts, expected);
    }

    #[test]
    fn test_index_of_bounds() {
        let bytes = ByteString::from(vec![1, 2, 3, 2, 1]);
        assert_eq!(bytes.index_of(2, 0, None), Some(1));
        assert_eq!(bytes.index_of(2, 2, None), Some(3));
        assert_eq!(bytes.index_of(2, 0, Some(1)), None);
        assert_eq!(bytes.last_index_of(2, 0, None), Some(3));
        assert_eq!(bytes.last_index_of(2, 0, Some(3)), Some(1));
        assert_eq!(bytes.last_index_of(9, 0, None), None);
    }

    #[test]
    fn test_copy_to_never_grows() {
        let source = ByteString::from(vec![9, 8, 7, 6]);
        let mut target = ByteArray::with_length(3);
        let copied = source.copy_to(&mut target, 0, None, 1).unwrap();
        assert_eq!(copied, 2);
        assert_eq!(target.as_slice(), &[0, 9, 8]);
        assert!(source.copy_to(&mut target, 0, None, 4).is_err());
    }
}
