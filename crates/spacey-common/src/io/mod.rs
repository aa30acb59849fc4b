// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Blocking-style streams over the tokio event loop
//!
//! Three stream variants share the [`IoStream`] interface:
//!
//! - [`Stream`] wraps one platform handle and suspends the calling fiber
//!   until data or a drain arrives
//! - [`MemoryStream`] is backed by a binary value and never suspends
//! - [`TextStream`] adds charset decoding and line handling on top of either

mod memory;
mod stream;
mod text;

pub use memory::MemoryStream;
pub use stream::Stream;
pub use text::{TextOptions, TextStream};

use crate::binary::{Binary, ByteArray, ByteString};
use crate::error::Result;
use async_trait::async_trait;

mod sealed {
    pub trait Sealed {}
}

/// Operations common to every stream variant
#[async_trait]
pub trait IoStream: sealed::Sealed + Send {
    /// Whether the stream can be read from
    fn readable(&self) -> bool;

    /// Whether the stream can be written to
    fn writable(&self) -> bool;

    /// Whether the stream supports positioning
    fn seekable(&self) -> bool;

    /// Whether the stream has been closed
    fn closed(&self) -> bool;

    /// Wait until written bytes have been accepted by the sink
    async fn flush(&mut self) -> Result<()>;

    /// Close the stream, releasing its handle
    async fn close(&mut self) -> Result<()>;
}

/// Byte-level operations, implemented by [`Stream`] and [`MemoryStream`]
#[async_trait]
pub trait RawStream: IoStream {
    /// Read exactly `n` bytes, or fewer at end of stream
    async fn read(&mut self, n: usize) -> Result<ByteString>;

    /// Read the next available block. Empty only at end of stream.
    async fn read_block(&mut self) -> Result<ByteString>;

    /// Read until end of stream
    async fn read_all(&mut self) -> Result<ByteString>;

    /// Fill `buffer[begin..end]`, returning the count or `None` at end
    async fn read_into(
        &mut self,
        buffer: &mut ByteArray,
        begin: usize,
        end: Option<usize>,
    ) -> Result<Option<usize>>;

    /// Discard up to `n` bytes, returning how many were skipped
    async fn skip(&mut self, n: usize) -> Result<usize>;

    /// Hand bytes to the sink without waiting
    fn write(&mut self, data: &dyn Binary) -> Result<()>;
}

/// Tuning for platform-backed streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    /// Bytes requested from the platform per read
    pub block_size: usize,
    /// Buffered bytes at which reading pauses
    pub high_water_mark: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        let config = crate::runtime::system::config();
        Self {
            block_size: config.block_size,
            high_water_mark: config.high_water_mark,
        }
    }
}

/// A stream returned by the fs and subprocess modules
#[derive(Debug)]
pub enum AnyStream {
    /// Binary mode
    Raw(Stream),
    /// Text mode
    Text(TextStream<Stream>),
}

impl AnyStream {
    /// The underlying platform stream
    pub fn raw(&self) -> &Stream {
        match self {
            AnyStream::Raw(stream) => stream,
            AnyStream::Text(text) => text.raw(),
        }
    }

    /// The stream, if opened in binary mode
    pub fn as_raw_mut(&mut self) -> Option<&mut Stream> {
        match self {
            AnyStream::Raw(stream) => Some(stream),
            AnyStream::Text(_) => None,
        }
    }

    /// The stream, if opened in text mode
    pub fn as_text_mut(&mut self) -> Option<&mut TextStream<Stream>> {
        match self {
            AnyStream::Raw(_) => None,
            AnyStream::Text(text) => Some(text),
        }
    }

    /// Unwrap the platform stream, discarding any text layer
    pub fn into_raw(self) -> Stream {
        match self {
            AnyStream::Raw(stream) => stream,
            AnyStream::Text(text) => text.into_raw(),
        }
    }

    /// Unwrap a text-mode stream
    pub fn into_text(self) -> Option<TextStream<Stream>> {
        match self {
            AnyStream::Raw(_) => None,
            AnyStream::Text(text) => Some(text),
        }
    }
}

impl sealed::Sealed for AnyStream {}

#[async_trait]
impl IoStream for AnyStream {
    fn readable(&self) -> bool {
        self.raw().readable()
    }

    fn writable(&self) -> bool {
        self.raw().writable()
    }

    fn seekable(&self) -> bool {
        false
    }

    fn closed(&self) -> bool {
        self.raw().is_closed()
    }

    async fn flush(&mut self) -> Result<()> {
        match self {
            AnyStream::Raw(stream) => stream.flush().await,
            AnyStream::Text(text) => text.flush().await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self {
            AnyStream::Raw(stream) => stream.close().await,
            AnyStream::Text(text) => text.close().await,
        }
    }
}
