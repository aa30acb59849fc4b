// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Line-oriented text stream

use super::{IoStream, MemoryStream, RawStream, sealed};
use crate::binary::{Binary, ByteString, Charset, Decoder};
use crate::error::{CommonError, Result};
use async_trait::async_trait;
use std::fmt;

/// Options for [`TextStream::new`]. Unset fields use the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct TextOptions {
    /// Charset name
    pub charset: Option<String>,
    /// Line separator
    pub newline: Option<String>,
    /// Separator between `print` arguments
    pub delimiter: Option<String>,
}

impl TextOptions {
    /// Options with only the charset set
    pub fn charset(charset: impl Into<String>) -> Self {
        Self {
            charset: Some(charset.into()),
            ..Self::default()
        }
    }
}

/// Charset-aware line reader and writer over a raw stream
pub struct TextStream<R> {
    raw: R,
    charset: Charset,
    decoder: Decoder,
    newline: String,
    delimiter: String,
    /// Decoded text read past the last line boundary
    lookahead: Option<String>,
    /// The raw stream has reported its end and the decoder is flushed
    exhausted: bool,
}

impl<R: RawStream> TextStream<R> {
    /// Wrap `raw`.
    ///
    /// Fails with an argument error for an unknown charset or an empty
    /// newline.
    pub fn new(raw: R, options: Option<TextOptions>) -> Result<Self> {
        let options = options.unwrap_or_default();
        let config = crate::runtime::system::config();

        let charset = Charset::parse(options.charset.as_deref().unwrap_or(&config.charset))?;
        let newline = options.newline.unwrap_or(config.newline);
        if newline.is_empty() {
            return Err(CommonError::argument("newline must not be empty"));
        }
        let delimiter = options.delimiter.unwrap_or(config.delimiter);

        Ok(Self {
            raw,
            charset,
            decoder: charset.decoder(),
            newline,
            delimiter,
            lookahead: None,
            exhausted: false,
        })
    }

    /// The charset used for decoding and encoding
    pub fn charset(&self) -> Charset {
        self.charset
    }

    /// The line separator
    pub fn newline(&self) -> &str {
        &self.newline
    }

    /// The wrapped stream
    pub fn raw(&self) -> &R {
        &self.raw
    }

    /// The wrapped stream, mutably. Reading from it directly bypasses the
    /// lookahead.
    pub fn raw_mut(&mut self) -> &mut R {
        &mut self.raw
    }

    /// Unwrap the raw stream. Any lookahead text is dropped.
    pub fn into_raw(self) -> R {
        self.raw
    }

    /// Next piece of decoded text, or `None` at end of stream
    async fn next_chunk(&mut self) -> Result<Option<String>> {
        if let Some(text) = self.lookahead.take() {
            return Ok(Some(text));
        }
        while !self.exhausted {
            let block = self.raw.read_block().await?;
            let text = if block.is_empty() {
                self.exhausted = true;
                self.decoder.end()
            } else {
                self.decoder.write(block.as_slice())
            };
            if !text.is_empty() {
                return Ok(Some(text));
            }
        }
        Ok(None)
    }

    /// Read one line, including its newline.
    ///
    /// The last line of a stream may lack the newline. An empty string means
    /// end of stream.
    pub async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        while let Some(chunk) = self.next_chunk().await? {
            // A newline may straddle the previous chunk and this one
            let mut from = line.len().saturating_sub(self.newline.len() - 1);
            while !line.is_char_boundary(from) {
                from -= 1;
            }
            line.push_str(&chunk);

            if let Some(pos) = line[from..].find(self.newline.as_str()) {
                let end = from + pos + self.newline.len();
                let rest = line.split_off(end);
                if !rest.is_empty() {
                    self.lookahead = Some(rest);
                }
                return Ok(line);
            }
        }
        Ok(line)
    }

    /// Read every remaining line, each including its newline
    pub async fn read_lines(&mut self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                return Ok(lines);
            }
            lines.push(line);
        }
    }

    /// The next line without its newline, or `None` at end of stream
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        let mut line = self.read_line().await?;
        if line.is_empty() {
            return Ok(None);
        }
        if line.ends_with(self.newline.as_str()) {
            line.truncate(line.len() - self.newline.len());
        }
        Ok(Some(line))
    }

    /// Call `callback` with every remaining line, without its newline
    pub async fn for_each<F>(&mut self, mut callback: F) -> Result<()>
    where
        F: FnMut(&str) -> Result<()>,
    {
        while let Some(line) = self.next_line().await? {
            callback(&line)?;
        }
        Ok(())
    }

    /// Everything still unread, as one string
    pub async fn read(&mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(chunk) = self.next_chunk().await? {
            text.push_str(&chunk);
        }
        Ok(text)
    }

    /// Not supported: decoded text cannot be aligned to a fixed byte buffer
    pub fn read_into(&mut self) -> Result<usize> {
        Err(CommonError::unsupported("read_into is not supported on text streams"))
    }

    /// Encode `text` and hand it to the raw stream
    pub fn write(&mut self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        let bytes = ByteString::from(self.charset.encode(text)?);
        self.raw.write(&bytes)
    }

    /// Write `line` followed by the newline
    pub fn write_line(&mut self, line: &str) -> Result<()> {
        self.write(line)?;
        let newline = self.newline.clone();
        self.write(&newline)
    }

    /// Write each line followed by the newline
    pub fn write_lines<I, S>(&mut self, lines: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for line in lines {
            self.write_line(line.as_ref())?;
        }
        Ok(())
    }

    /// Write the arguments joined by the delimiter, then the newline, then
    /// flush.
    pub async fn print<I, S>(&mut self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: fmt::Display,
    {
        let line = args
            .into_iter()
            .map(|arg| arg.to_string())
            .collect::<Vec<_>>()
            .join(self.delimiter.as_str());
        self.write_line(&line)?;
        self.flush().await
    }

    /// Copy every remaining line to `output`, then flush it
    pub async fn copy<W: RawStream>(&mut self, output: &mut TextStream<W>) -> Result<()> {
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                break;
            }
            output.write(&line)?;
        }
        output.flush().await
    }

    /// Whether the raw stream is readable
    pub fn readable(&self) -> bool {
        self.raw.readable()
    }

    /// Whether the raw stream is writable
    pub fn writable(&self) -> bool {
        self.raw.writable()
    }

    /// Text streams cannot be positioned
    pub fn seekable(&self) -> bool {
        false
    }

    /// Whether the raw stream is closed
    pub fn is_closed(&self) -> bool {
        self.raw.closed()
    }

    /// Flush the raw stream
    pub async fn flush(&mut self) -> Result<()> {
        self.raw.flush().await
    }

    /// Close the raw stream
    pub async fn close(&mut self) -> Result<()> {
        self.raw.close().await
    }
}

impl TextStream<MemoryStream> {
    /// A text stream over an empty in-memory buffer
    pub fn memory() -> Result<Self> {
        Self::new(MemoryStream::new(), None)
    }

    /// The whole buffer, decoded
    pub fn content(&self) -> Result<String> {
        Ok(self.charset.decode(self.raw.content()?.as_slice()))
    }
}

impl<R> fmt::Debug for TextStream<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextStream")
            .field("charset", &self.charset)
            .field("newline", &self.newline)
            .field("lookahead", &self.lookahead.as_ref().map(String::len))
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

impl<R: RawStream> sealed::Sealed for TextStream<R> {}

#[async_trait]
impl<R: RawStream> IoStream for TextStream<R> {
    fn readable(&self) -> bool {
        self.raw.readable()
    }

    fn writable(&self) -> bool {
        self.raw.writable()
    }

    fn seekable(&self) -> bool {
        false
    }

    fn closed(&self) -> bool {
        self.raw.closed()
    }

    async fn flush(&mut self) -> Result<()> {
        self.raw.flush().await
    }

    async fn close(&mut self) -> Result<()> {
        self.raw.close().await
    }
}
