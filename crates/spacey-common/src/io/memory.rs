// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! In-memory stream backed by a binary value

use super::{IoStream, RawStream, sealed};
use crate::binary::{Binary, ByteArray, ByteString, clamp_range, search_range};
use crate::error::{CommonError, Result};
use async_trait::async_trait;
use std::fmt;

enum Backing {
    /// Writable, grows on demand
    Growable(ByteArray),
    /// Read-only, fixed length
    Fixed(ByteString),
}

impl Backing {
    fn as_slice(&self) -> &[u8] {
        match self {
            Backing::Growable(bytes) => bytes.as_slice(),
            Backing::Fixed(bytes) => bytes.as_slice(),
        }
    }
}

/// A stream over an in-memory buffer
///
/// Nothing suspends, so a MemoryStream works inside or outside a fiber.
/// Invariant: `0 <= position <= length <= backing length`.
pub struct MemoryStream {
    backing: Backing,
    length: usize,
    position: usize,
    block_size: usize,
    closed: bool,
}

impl MemoryStream {
    /// An empty, growable stream
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// A growable stream with `capacity` bytes pre-allocated. The length
    /// starts at zero.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut stream = Self::from(ByteArray::with_length(capacity));
        stream.length = 0;
        stream
    }

    fn build(backing: Backing) -> Self {
        let length = backing.as_slice().len();
        Self {
            backing,
            length,
            position: 0,
            block_size: crate::runtime::system::config().block_size,
            closed: false,
        }
    }

    /// Set the most bytes `read_block` returns at once
    pub fn set_block_size(&mut self, block_size: usize) {
        self.block_size = block_size.max(1);
    }

    /// Current read/write position
    pub fn position(&self) -> Result<usize> {
        self.check_open()?;
        Ok(self.position)
    }

    /// Move the position, clamping it into `[0, length]`
    pub fn set_position(&mut self, position: usize) -> Result<()> {
        self.check_open()?;
        self.position = position.min(self.length);
        Ok(())
    }

    /// Logical length of the content
    pub fn length(&self) -> Result<usize> {
        self.check_open()?;
        Ok(self.length)
    }

    /// Truncate or zero-extend the content
    pub fn set_length(&mut self, length: usize) -> Result<()> {
        self.check_open()?;
        let Backing::Growable(bytes) = &mut self.backing else {
            return Err(CommonError::NotWritable);
        };
        if length < self.length {
            // Drop the tail so that later growth zero-fills again
            bytes.set_length(length);
        } else if length > bytes.len() {
            bytes.set_length(length);
        }
        self.length = length;
        self.position = self.position.min(length);
        Ok(())
    }

    /// The bytes in `[0, length)`, sharing storage
    pub fn content(&self) -> Result<ByteString> {
        self.check_open()?;
        Ok(self.view(0, self.length))
    }

    fn view(&self, start: usize, end: usize) -> ByteString {
        let bytes = match &self.backing {
            Backing::Growable(bytes) => bytes.to_bytes(),
            Backing::Fixed(bytes) => bytes.to_bytes(),
        };
        ByteString::from(bytes.slice(start..end))
    }

    /// Whether the stream is read-only
    pub fn writable(&self) -> bool {
        matches!(self.backing, Backing::Growable(_))
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Read up to `n` bytes from the current position
    pub fn read(&mut self, n: usize) -> Result<ByteString> {
        self.check_open()?;
        let end = self.position.saturating_add(n).min(self.length);
        let bytes = self.view(self.position, end);
        self.position = end;
        Ok(bytes)
    }

    /// Read up to one block. Empty only at the end.
    pub fn read_block(&mut self) -> Result<ByteString> {
        self.read(self.block_size)
    }

    /// Read everything from the position to the end
    pub fn read_all(&mut self) -> Result<ByteString> {
        self.read(self.length - self.position)
    }

    /// Fill `buffer[begin..end]`, returning the count or `None` at the end.
    ///
    /// The buffer is never grown.
    pub fn read_into(
        &mut self,
        buffer: &mut ByteArray,
        begin: usize,
        end: Option<usize>,
    ) -> Result<Option<usize>> {
        self.check_open()?;
        let range = search_range(buffer.len(), begin, end);
        if range.is_empty() {
            return Ok(Some(0));
        }
        if self.position == self.length {
            return Ok(None);
        }
        let count = range.len().min(self.length - self.position);
        let source = &self.backing.as_slice()[self.position..self.position + count];
        buffer.write_at(range.start, source)?;
        self.position += count;
        Ok(Some(count))
    }

    /// Skip up to `n` bytes, returning how many were skipped
    pub fn skip(&mut self, n: usize) -> Result<usize> {
        self.check_open()?;
        let skipped = n.min(self.length - self.position);
        self.position += skipped;
        Ok(skipped)
    }

    /// Write at the current position, growing the stream as needed
    pub fn write(&mut self, data: &dyn Binary) -> Result<()> {
        self.write_slice(data.as_slice())
    }

    /// Write `data[begin..end]`. Negative positions count from the end.
    pub fn write_range(&mut self, data: &dyn Binary, begin: isize, end: Option<isize>) -> Result<()> {
        let range = clamp_range(data.len(), begin, end);
        self.write_slice(&data.as_slice()[range])
    }

    fn write_slice(&mut self, src: &[u8]) -> Result<()> {
        self.check_open()?;
        let Backing::Growable(bytes) = &mut self.backing else {
            return Err(CommonError::NotWritable);
        };
        let end = self.position + src.len();
        if end > bytes.len() {
            bytes.set_length(end);
        }
        bytes.write_at(self.position, src)?;
        self.position = end;
        self.length = self.length.max(end);
        Ok(())
    }

    /// Nothing to flush, but fails once closed
    pub fn flush(&mut self) -> Result<()> {
        self.check_open()
    }

    /// Mark the stream closed. Every later operation fails.
    pub fn close(&mut self) -> Result<()> {
        self.check_open()?;
        self.closed = true;
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(CommonError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryStream {
    fn default() -> Self {
        Self::new()
    }
}

impl From<ByteArray> for MemoryStream {
    fn from(bytes: ByteArray) -> Self {
        Self::build(Backing::Growable(bytes))
    }
}

impl From<ByteString> for MemoryStream {
    fn from(bytes: ByteString) -> Self {
        Self::build(Backing::Fixed(bytes))
    }
}

impl fmt::Debug for MemoryStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStream")
            .field("length", &self.length)
            .field("position", &self.position)
            .field("writable", &self.writable())
            .field("closed", &self.closed)
            .finish()
    }
}

impl sealed::Sealed for MemoryStream {}

#[async_trait]
impl IoStream for MemoryStream {
    fn readable(&self) -> bool {
        true
    }

    fn writable(&self) -> bool {
        MemoryStream::writable(self)
    }

    fn seekable(&self) -> bool {
        true
    }

    fn closed(&self) -> bool {
        self.closed
    }

    async fn flush(&mut self) -> Result<()> {
        MemoryStream::flush(self)
    }

    async fn close(&mut self) -> Result<()> {
        MemoryStream::close(self)
    }
}

#[async_trait]
impl RawStream for MemoryStream {
    async fn read(&mut self, n: usize) -> Result<ByteString> {
        MemoryStream::read(self, n)
    }

    async fn read_block(&mut self) -> Result<ByteString> {
        MemoryStream::read_block(self)
    }

    async fn read_all(&mut self) -> Result<ByteString> {
        MemoryStream::read_all(self)
    }

    async fn read_into(
        &mut self,
        buffer: &mut ByteArray,
        begin: usize,
        end: Option<usize>,
    ) -> Result<Option<usize>> {
        MemoryStream::read_into(self, buffer, begin, end)
    }

    async fn skip(&mut self, n: usize) -> Result<usize> {
        MemoryStream::skip(self, n)
    }

    fn write(&mut self, data: &dyn Binary) -> Result<()> {
        MemoryStream::write(self, data)
    }
}
