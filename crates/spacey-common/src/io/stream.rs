// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Raw byte stream over one platform handle
//!
//! Each stream owns two background tasks that act as the event source:
//!
//! - the pump reads blocks from the handle into a chunk queue, pausing at the
//!   high water mark, and wakes the fiber waiting on the read side
//! - the sink writes queued chunks to the handle and wakes the fiber waiting
//!   in `flush` once everything has drained
//!
//! At most one fiber may wait on each side. A second waiter fails with
//! [`CommonError::Busy`].

use super::{IoStream, MemoryStream, RawStream, StreamOptions, sealed};
use crate::binary::{Binary, ByteArray, ByteString, clamp_range, search_range};
use crate::error::{CommonError, Direction, Result};
use crate::runtime::fiber::{self, Resumer};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

/// Work handed to the sink task
enum Command {
    /// Bytes to write
    Data(Bytes),
    /// Shut the write side down once everything before it is written
    Shutdown(Resumer<()>),
}

/// Read side bookkeeping
#[derive(Default)]
struct ReadState {
    /// Chunks delivered by the pump, oldest first
    chunks: VecDeque<Bytes>,
    /// Total bytes in `chunks`
    buffered: usize,
    /// The pump has seen end of stream or an error
    ended: bool,
    /// Error that arrived while nobody was waiting
    error: Option<CommonError>,
    /// The fiber waiting for the next chunk
    waiter: Option<Resumer<()>>,
    /// The pump task
    pump: Option<JoinHandle<()>>,
}

/// Write side bookkeeping
#[derive(Default)]
struct WriteState {
    /// Queue into the sink task, `None` once the write side is shut down
    commands: Option<mpsc::UnboundedSender<Command>>,
    /// Bytes queued but not yet accepted by the handle
    pending: usize,
    /// First write failure. Every later write and flush reports it.
    error: Option<CommonError>,
    /// The fiber waiting in `flush`
    waiter: Option<Resumer<()>>,
}

#[derive(Default)]
struct State {
    read: ReadState,
    write: WriteState,
    closed: bool,
}

struct Shared {
    state: Mutex<State>,
    /// Signalled whenever a chunk is consumed, to restart a paused pump
    demand: Arc<Notify>,
    readable: bool,
    writable: bool,
    options: StreamOptions,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(pump) = self.state.get_mut().read.pump.take() {
            pump.abort();
        }
    }
}

/// A stream over one platform I/O handle
///
/// `Stream` is a cheap handle: clones refer to the same underlying stream.
/// Handing the same stream to two fibers is allowed as long as they do not
/// wait on the same side at once.
#[derive(Clone)]
pub struct Stream {
    shared: Arc<Shared>,
}

impl Stream {
    /// Wrap a readable handle
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        Self::from_reader_with(reader, StreamOptions::default())
    }

    /// Wrap a readable handle with explicit options
    pub fn from_reader_with<R>(reader: R, options: StreamOptions) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let stream = Self::new(true, false, options);
        stream.start_pump(reader);
        stream
    }

    /// Wrap a writable handle
    pub fn from_writer<W>(writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::from_writer_with(writer, StreamOptions::default())
    }

    /// Wrap a writable handle with explicit options
    pub fn from_writer_with<W>(writer: W, options: StreamOptions) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let stream = Self::new(false, true, options);
        stream.start_sink(writer);
        stream
    }

    /// Wrap a handle that is both readable and writable
    pub fn from_duplex<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::from_duplex_with(io, StreamOptions::default())
    }

    /// Wrap a duplex handle with explicit options
    pub fn from_duplex_with<T>(io: T, options: StreamOptions) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let stream = Self::new(true, true, options);
        stream.start_pump(reader);
        stream.start_sink(writer);
        stream
    }

    fn new(readable: bool, writable: bool, options: StreamOptions) -> Self {
        tracing::debug!(readable, writable, "opening stream");
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                demand: Arc::new(Notify::new()),
                readable,
                writable,
                options,
            }),
        }
    }

    fn start_pump<R>(&self, reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let task = tokio::spawn(pump(
            Arc::downgrade(&self.shared),
            self.shared.demand.clone(),
            reader,
            self.shared.options,
        ));
        self.shared.state.lock().read.pump = Some(task);
    }

    fn start_sink<W>(&self, writer: W)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.state.lock().write.commands = Some(tx);
        tokio::spawn(sink(Arc::downgrade(&self.shared), writer, rx));
    }

    /// Whether the stream has a read side
    pub fn readable(&self) -> bool {
        self.shared.readable
    }

    /// Whether the stream has a write side
    pub fn writable(&self) -> bool {
        self.shared.writable
    }

    /// Platform streams cannot be positioned
    pub fn seekable(&self) -> bool {
        false
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// The options this stream was opened with
    pub fn options(&self) -> StreamOptions {
        self.shared.options
    }

    /// Read exactly `n` bytes, or fewer at end of stream.
    pub async fn read(&self, n: usize) -> Result<ByteString> {
        self.check_readable()?;
        let mut parts = Vec::new();
        let mut remaining = n;
        while remaining > 0 {
            match self.next_chunk(Some(remaining)).await? {
                Some(chunk) => {
                    remaining -= chunk.len();
                    parts.push(chunk);
                }
                None => break,
            }
        }
        Ok(join(parts))
    }

    /// Read whatever arrives next. Empty only at end of stream.
    pub async fn read_block(&self) -> Result<ByteString> {
        self.check_readable()?;
        let chunk = self.next_chunk(None).await?;
        Ok(chunk.map(ByteString::from).unwrap_or_default())
    }

    /// Read until end of stream
    pub async fn read_all(&self) -> Result<ByteString> {
        self.check_readable()?;
        let mut buffer = MemoryStream::new();
        while let Some(chunk) = self.next_chunk(None).await? {
            buffer.write(&ByteString::from(chunk))?;
        }
        buffer.content()
    }

    /// Read up to `max` bytes, returning as soon as any are available
    pub async fn receive(&self, max: usize) -> Result<ByteString> {
        self.check_readable()?;
        if max == 0 {
            return Ok(ByteString::new());
        }
        let chunk = self.next_chunk(Some(max)).await?;
        Ok(chunk.map(ByteString::from).unwrap_or_default())
    }

    /// Fill `buffer[begin..end]` from the stream.
    ///
    /// Returns the number of bytes read, or `None` at end of stream. The
    /// buffer is never grown.
    pub async fn read_into(
        &self,
        buffer: &mut ByteArray,
        begin: usize,
        end: Option<usize>,
    ) -> Result<Option<usize>> {
        self.check_readable()?;
        let range = search_range(buffer.len(), begin, end);
        if range.is_empty() {
            return Ok(Some(0));
        }
        match self.next_chunk(Some(range.len())).await? {
            Some(chunk) => {
                buffer.write_at(range.start, &chunk)?;
                Ok(Some(chunk.len()))
            }
            None => Ok(None),
        }
    }

    /// Call `callback` with every chunk until end of stream.
    ///
    /// The stream is left open. An error from the callback stops the loop
    /// and is returned.
    pub async fn for_each<F>(&self, mut callback: F) -> Result<()>
    where
        F: FnMut(ByteString) -> Result<()>,
    {
        self.check_readable()?;
        while let Some(chunk) = self.next_chunk(None).await? {
            callback(ByteString::from(chunk))?;
        }
        Ok(())
    }

    /// Discard up to `n` bytes, returning how many were skipped
    pub async fn skip(&self, n: usize) -> Result<usize> {
        self.check_readable()?;
        let mut skipped = 0;
        while skipped < n {
            match self.next_chunk(Some(n - skipped)).await? {
                Some(chunk) => skipped += chunk.len(),
                None => break,
            }
        }
        Ok(skipped)
    }

    /// Drain this stream into `output`, then flush `output`.
    ///
    /// Neither stream is closed.
    pub async fn copy<W>(&self, output: &mut W) -> Result<()>
    where
        W: RawStream,
    {
        self.for_each(|chunk| output.write(&chunk)).await?;
        output.flush().await
    }

    /// Hand bytes to the sink. Never suspends.
    ///
    /// The sink receives a snapshot, so mutating a ByteArray after writing it
    /// does not change what gets written.
    pub fn write(&self, data: &dyn Binary) -> Result<()> {
        self.send(data.to_bytes())
    }

    /// Hand `data[begin..end]` to the sink. Negative positions count from
    /// the end.
    pub fn write_range(&self, data: &dyn Binary, begin: isize, end: Option<isize>) -> Result<()> {
        let bytes = data.to_bytes();
        let range = clamp_range(bytes.len(), begin, end);
        self.send(bytes.slice(range))
    }

    fn send(&self, bytes: Bytes) -> Result<()> {
        if !self.shared.writable {
            return Err(CommonError::NotWritable);
        }
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(CommonError::Closed);
        }
        if let Some(err) = &state.write.error {
            return Err(err.clone());
        }
        if bytes.is_empty() {
            return Ok(());
        }

        let len = bytes.len();
        let commands = state.write.commands.as_ref().ok_or(CommonError::Closed)?;
        commands
            .send(Command::Data(bytes))
            .map_err(|_| CommonError::Closed)?;
        state.write.pending += len;
        tracing::trace!(len, pending = state.write.pending, "queued write");
        Ok(())
    }

    /// Wait until every written byte has been accepted by the handle.
    ///
    /// Returns immediately when nothing is pending.
    pub async fn flush(&self) -> Result<()> {
        if !self.shared.writable {
            return Err(CommonError::NotWritable);
        }
        let suspension = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(CommonError::Closed);
            }
            if let Some(err) = &state.write.error {
                return Err(err.clone());
            }
            if state.write.pending == 0 {
                return Ok(());
            }
            if state.write.waiter.as_ref().is_some_and(Resumer::is_waiting) {
                return Err(CommonError::Busy(Direction::Write));
            }
            let (resumer, suspension) = fiber::suspend()?;
            state.write.waiter = Some(resumer);
            suspension
        };
        suspension.wait().await
    }

    /// Gracefully shut down the write side, keeping the read side open.
    ///
    /// Suspends until everything written so far has reached the handle.
    pub async fn end(&self) -> Result<()> {
        if !self.shared.writable {
            return Err(CommonError::NotWritable);
        }
        let (resumer, suspension) = fiber::suspend()?;
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(CommonError::Closed);
            }
            match state.write.commands.take() {
                Some(commands) => {
                    commands
                        .send(Command::Shutdown(resumer))
                        .map_err(|_| CommonError::Closed)?;
                }
                None => return Ok(()),
            }
        }
        suspension.wait().await
    }

    /// Stop reading. Data already buffered is discarded, and the fiber waiting
    /// on the read side, if any, sees end of stream.
    pub fn end_read(&self) {
        let mut state = self.shared.state.lock();
        let read = &mut state.read;
        if let Some(pump) = read.pump.take() {
            pump.abort();
        }
        read.chunks.clear();
        read.buffered = 0;
        read.ended = true;
        if let Some(waiter) = read.waiter.take() {
            waiter.resume(());
        }
    }

    /// Close the stream.
    ///
    /// A writable stream suspends until the sink has shut down gracefully. A
    /// fiber still waiting on either side fails with [`CommonError::Closed`].
    /// Reads after close return empty; writes, flushes and a second close
    /// fail with [`CommonError::Closed`].
    pub async fn close(&self) -> Result<()> {
        let parked = if self.shared.writable {
            Some(fiber::suspend()?)
        } else {
            None
        };
        let suspension = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(CommonError::Closed);
            }
            state.closed = true;

            let read = &mut state.read;
            if let Some(waiter) = read.waiter.take() {
                waiter.fail(CommonError::Closed);
            }
            if let Some(pump) = read.pump.take() {
                pump.abort();
            }
            read.chunks.clear();
            read.buffered = 0;

            let write = &mut state.write;
            if let Some(waiter) = write.waiter.take() {
                waiter.fail(CommonError::Closed);
            }
            match (write.commands.take(), parked) {
                (Some(commands), Some((resumer, suspension))) => {
                    commands
                        .send(Command::Shutdown(resumer))
                        .map_err(|_| CommonError::Closed)?;
                    Some(suspension)
                }
                _ => None,
            }
        };

        tracing::debug!("closing stream");
        match suspension {
            Some(suspension) => suspension.wait().await,
            None => Ok(()),
        }
    }

    fn check_readable(&self) -> Result<()> {
        if self.shared.readable {
            Ok(())
        } else {
            Err(CommonError::NotReadable)
        }
    }

    /// Take up to `max` bytes of the oldest buffered chunk, suspending until
    /// one arrives. `None` means end of stream.
    async fn next_chunk(&self, max: Option<usize>) -> Result<Option<Bytes>> {
        loop {
            let suspension = {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return Ok(None);
                }
                let read = &mut state.read;
                if let Some(chunk) = read.take_chunk(max) {
                    self.shared.demand.notify_one();
                    return Ok(Some(chunk));
                }
                if let Some(err) = read.error.take() {
                    return Err(err);
                }
                if read.ended {
                    return Ok(None);
                }
                if read.waiter.as_ref().is_some_and(Resumer::is_waiting) {
                    return Err(CommonError::Busy(Direction::Read));
                }
                let (resumer, suspension) = fiber::suspend()?;
                read.waiter = Some(resumer);
                suspension
            };
            suspension.wait().await?;
        }
    }
}

impl ReadState {
    fn take_chunk(&mut self, max: Option<usize>) -> Option<Bytes> {
        let front = self.chunks.front_mut()?;
        let chunk = match max {
            Some(max) if max < front.len() => front.split_to(max),
            _ => self.chunks.pop_front()?,
        };
        self.buffered -= chunk.len();
        Some(chunk)
    }

    fn wake(&mut self) {
        if let Some(waiter) = self.waiter.take().filter(Resumer::is_waiting) {
            waiter.resume(());
        }
    }
}

fn join(mut parts: Vec<Bytes>) -> ByteString {
    match parts.len() {
        0 => ByteString::new(),
        1 => ByteString::from(parts.remove(0)),
        _ => {
            let total = parts.iter().map(Bytes::len).sum();
            let mut buf = BytesMut::with_capacity(total);
            for part in parts {
                buf.extend_from_slice(&part);
            }
            ByteString::from(buf.freeze())
        }
    }
}

async fn pump<R>(shared: Weak<Shared>, demand: Arc<Notify>, mut reader: R, options: StreamOptions)
where
    R: AsyncRead + Unpin,
{
    loop {
        // Backpressure: wait for a consumer while the queue is full
        loop {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if shared.state.lock().read.buffered < options.high_water_mark {
                break;
            }
            drop(shared);
            demand.notified().await;
        }

        let mut buf = BytesMut::with_capacity(options.block_size);
        let result = reader.read_buf(&mut buf).await;

        let Some(shared) = shared.upgrade() else {
            return;
        };
        let mut state = shared.state.lock();
        let read = &mut state.read;
        match result {
            Ok(0) => {
                tracing::trace!("end of stream");
                read.ended = true;
                read.wake();
                return;
            }
            Ok(n) => {
                tracing::trace!(n, buffered = read.buffered + n, "read chunk");
                read.buffered += n;
                read.chunks.push_back(buf.freeze());
                read.wake();
            }
            Err(err) => {
                let err = CommonError::from(err);
                tracing::debug!(error = %err, "read failed");
                read.ended = true;
                // A waiter whose suspension was dropped would swallow the error
                match read.waiter.take().filter(Resumer::is_waiting) {
                    Some(waiter) => waiter.fail(err),
                    None => read.error = Some(err),
                }
                return;
            }
        }
    }
}

async fn sink<W>(shared: Weak<Shared>, mut writer: W, mut commands: mpsc::UnboundedReceiver<Command>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(command) = commands.recv().await {
        match command {
            Command::Data(bytes) => {
                let failed = shared.upgrade().is_some_and(|shared| {
                    let state = shared.state.lock();
                    state.write.error.is_some()
                });
                let result = if failed {
                    Ok(())
                } else {
                    match writer.write_all(&bytes).await {
                        Ok(()) if commands.is_empty() => writer.flush().await,
                        other => other,
                    }
                };

                let Some(shared) = shared.upgrade() else {
                    continue;
                };
                let mut state = shared.state.lock();
                let write = &mut state.write;
                write.pending = write.pending.saturating_sub(bytes.len());
                match result {
                    Ok(()) => {
                        if write.pending == 0 {
                            if let Some(waiter) = write.waiter.take().filter(Resumer::is_waiting) {
                                waiter.resume(());
                            }
                        }
                    }
                    Err(err) => {
                        let err = CommonError::from(err);
                        tracing::warn!(error = %err, "write failed");
                        write.error = Some(err.clone());
                        if let Some(waiter) = write.waiter.take().filter(Resumer::is_waiting) {
                            waiter.fail(err);
                        }
                    }
                }
            }
            Command::Shutdown(resumer) => {
                let result = match writer.flush().await {
                    Ok(()) => writer.shutdown().await,
                    Err(err) => Err(err),
                };
                resumer.settle(result.map_err(CommonError::from));
                return;
            }
        }
    }

    // Every handle went away without closing
    if let Err(err) = writer.flush().await {
        tracing::debug!(error = %err, "flush of abandoned stream failed");
    }
}

impl sealed::Sealed for Stream {}

#[async_trait]
impl IoStream for Stream {
    fn readable(&self) -> bool {
        self.shared.readable
    }

    fn writable(&self) -> bool {
        self.shared.writable
    }

    fn seekable(&self) -> bool {
        false
    }

    fn closed(&self) -> bool {
        self.is_closed()
    }

    async fn flush(&mut self) -> Result<()> {
        Stream::flush(self).await
    }

    async fn close(&mut self) -> Result<()> {
        Stream::close(self).await
    }
}

#[async_trait]
impl RawStream for Stream {
    async fn read(&mut self, n: usize) -> Result<ByteString> {
        Stream::read(self, n).await
    }

    async fn read_block(&mut self) -> Result<ByteString> {
        Stream::read_block(self).await
    }

    async fn read_all(&mut self) -> Result<ByteString> {
        Stream::read_all(self).await
    }

    async fn read_into(
        &mut self,
        buffer: &mut ByteArray,
        begin: usize,
        end: Option<usize>,
    ) -> Result<Option<usize>> {
        Stream::read_into(self, buffer, begin, end).await
    }

    async fn skip(&mut self, n: usize) -> Result<usize> {
        Stream::skip(self, n).await
    }

    fn write(&mut self, data: &dyn Binary) -> Result<()> {
        Stream::write(self, data)
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Stream")
            .field("readable", &self.shared.readable)
            .field("writable", &self.shared.writable)
            .field("buffered", &state.read.buffered)
            .field("pending", &state.write.pending)
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fiber::run;
    use std::io;
    use std::time::Duration;

    fn small() -> StreamOptions {
        StreamOptions {
            block_size: 4,
            high_water_mark: 8,
        }
    }

    #[tokio::test]
    async fn test_read_exact_counts() {
        run(async {
            let stream = Stream::from_reader_with(&b"hello world"[..], small());
            assert_eq!(stream.read(5).await?, "hello");
            assert_eq!(stream.read(1).await?, " ");
            assert_eq!(stream.read(100).await?, "world");
            assert!(stream.read(1).await?.is_empty());
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_for_each_reproduces_source() {
        let source: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let expected = source.clone();
        let received = run(async move {
            let stream = Stream::from_reader_with(io::Cursor::new(source), small());
            let mut total = 0;
            let mut received = Vec::new();
            stream
                .for_each(|chunk| {
                    assert!(!chunk.is_empty());
                    total += chunk.len();
                    received.extend_from_slice(chunk.as_slice());
                    Ok(())
                })
                .await?;
            assert_eq!(total, received.len());
            // the stream is still usable, and at its end
            assert!(!stream.is_closed());
            assert!(stream.read_block().await?.is_empty());
            Ok(received)
        })
        .await
        .unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_read_all_and_read_into() {
        run(async {
            let stream = Stream::from_reader_with(&b"abcdefgh"[..], small());
            let mut buffer = ByteArray::with_length(3);
            assert_eq!(stream.read_into(&mut buffer, 1, None).await?, Some(2));
            assert_eq!(buffer.as_slice(), b"\0ab");
            assert_eq!(stream.skip(2).await?, 2);
            assert_eq!(stream.read_all().await?, "efgh");
            assert_eq!(stream.read_into(&mut buffer, 0, None).await?, None);
            assert_eq!(buffer.len(), 3);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_pending_read_fails_on_reset() {
        let mock = tokio_test::io::Builder::new()
            .read(b"par")
            .wait(Duration::from_millis(20))
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"))
            .build();

        let result = run(async move {
            let stream = Stream::from_reader(mock);
            assert_eq!(stream.read_block().await?, "par");
            stream.read_block().await
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::ConnectionReset));
    }

    #[tokio::test]
    async fn test_error_surfaces_after_buffered_data() {
        let mock = tokio_test::io::Builder::new()
            .read(b"data")
            .read_error(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"))
            .build();

        run(async move {
            let stream = Stream::from_reader(mock);
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(stream.read(4).await?, "data");
            let err = stream.read_block().await.unwrap_err();
            assert_eq!(err.io_kind(), Some(io::ErrorKind::BrokenPipe));
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_write_then_flush_round_trip() {
        let (client, server) = tokio::io::duplex(64);
        let received = run(async move {
            let writer = Stream::from_writer(client);
            let reader = Stream::from_reader(server);
            writer.write(&ByteString::from("ping "))?;
            writer.write_range(&ByteString::from("xxpongxx"), 2, Some(-2))?;
            writer.flush().await?;
            // flushing again with nothing pending is a no-op
            writer.flush().await?;
            writer.close().await?;
            reader.read_all().await
        })
        .await
        .unwrap();
        assert_eq!(received, "ping pong");
    }

    #[tokio::test]
    async fn test_write_snapshot_is_isolated() {
        let (client, server) = tokio::io::duplex(64);
        let received = run(async move {
            let writer = Stream::from_writer(client);
            let mut bytes = ByteArray::from("abc");
            writer.write(&bytes)?;
            bytes.set(0, b'X')?;
            bytes.push(b"!");
            writer.close().await?;
            Stream::from_reader(server).read_all().await
        })
        .await
        .unwrap();
        assert_eq!(received, "abc");
    }

    #[tokio::test]
    async fn test_direction_checks() {
        run(async {
            let reader = Stream::from_reader(&b""[..]);
            assert!(matches!(
                reader.write(&ByteString::from("x")),
                Err(CommonError::NotWritable)
            ));
            assert!(matches!(reader.flush().await, Err(CommonError::NotWritable)));

            let writer = Stream::from_writer(tokio::io::sink());
            assert!(matches!(writer.read(1).await, Err(CommonError::NotReadable)));
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_close_policy() {
        run(async {
            let (client, _server) = tokio::io::duplex(64);
            let stream = Stream::from_duplex(client);
            stream.close().await?;
            assert!(stream.is_closed());
            assert!(stream.read_block().await?.is_empty());
            assert!(matches!(
                stream.write(&ByteString::from("x")),
                Err(CommonError::Closed)
            ));
            assert!(matches!(stream.flush().await, Err(CommonError::Closed)));
            assert!(matches!(stream.close().await, Err(CommonError::Closed)));
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_close_fails_waiting_reader() {
        run(async {
            let (client, _server) = tokio::io::duplex(64);
            let stream = Stream::from_duplex(client);

            let waiting = stream.clone();
            let reader = fiber::spawn(async move {
                let err = waiting.read_block().await.unwrap_err();
                assert!(matches!(err, CommonError::Closed));
                Ok(())
            });

            crate::runtime::system::sleep(Duration::from_millis(10)).await?;
            stream.close().await?;
            assert_eq!(reader.join().await, fiber::FiberState::Completed);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_error_after_abandoned_read_is_kept() {
        let mock = tokio_test::io::Builder::new()
            .wait(Duration::from_millis(50))
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"))
            .build();

        let result = run(async move {
            let stream = Stream::from_reader(mock);
            let early = tokio::time::timeout(Duration::from_millis(10), stream.read_block()).await;
            assert!(early.is_err());
            // the error arrives while no live fiber is waiting
            tokio::time::sleep(Duration::from_millis(80)).await;
            stream.read_block().await
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::ConnectionReset));
    }

    #[tokio::test]
    async fn test_write_error_surfaces_at_flush_and_sticks() {
        let mock = tokio_test::io::Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"))
            .build();

        run(async move {
            let stream = Stream::from_writer(mock);
            stream.write(&ByteString::from("lost"))?;
            let err = stream.flush().await.unwrap_err();
            assert_eq!(err.io_kind(), Some(io::ErrorKind::BrokenPipe));

            let err = stream.write(&ByteString::from("more")).unwrap_err();
            assert_eq!(err.io_kind(), Some(io::ErrorKind::BrokenPipe));
            let err = stream.flush().await.unwrap_err();
            assert_eq!(err.io_kind(), Some(io::ErrorKind::BrokenPipe));
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_second_flusher_is_busy() {
        run(async {
            let (client, server) = tokio::io::duplex(4);
            let stream = Stream::from_writer(client);
            stream.write(&ByteString::from("sixteen bytes!!!"))?;

            let first = stream.clone();
            let flusher = fiber::spawn(async move { first.flush().await });

            crate::runtime::system::sleep(Duration::from_millis(10)).await?;
            assert!(matches!(
                stream.flush().await,
                Err(CommonError::Busy(Direction::Write))
            ));

            let reader = Stream::from_reader(server);
            assert_eq!(reader.read(16).await?, "sixteen bytes!!!");
            assert_eq!(flusher.join().await, fiber::FiberState::Completed);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_close_fails_waiting_flusher() {
        run(async {
            let (client, server) = tokio::io::duplex(4);
            let stream = Stream::from_writer(client);
            stream.write(&ByteString::from("sixteen bytes!!!"))?;

            let waiting = stream.clone();
            let flusher = fiber::spawn(async move {
                let err = waiting.flush().await.unwrap_err();
                assert!(matches!(err, CommonError::Closed));
                Ok(())
            });
            crate::runtime::system::sleep(Duration::from_millis(10)).await?;

            // close waits for the sink, so something has to drain the pipe
            let drain = fiber::spawn(async move {
                crate::runtime::system::sleep(Duration::from_millis(20)).await?;
                let received = Stream::from_reader(server).read_all().await?;
                assert_eq!(received, "sixteen bytes!!!");
                Ok(())
            });

            stream.close().await?;
            assert_eq!(flusher.join().await, fiber::FiberState::Completed);
            assert_eq!(drain.join().await, fiber::FiberState::Completed);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_second_reader_is_busy() {
        run(async {
            let (client, server) = tokio::io::duplex(64);
            let stream = Stream::from_reader(client);
            let writer = Stream::from_writer(server);

            let first = stream.clone();
            let reader = fiber::spawn(async move {
                assert_eq!(first.read_block().await?, "late");
                Ok(())
            });

            crate::runtime::system::sleep(Duration::from_millis(10)).await?;
            assert!(matches!(
                stream.read_block().await,
                Err(CommonError::Busy(Direction::Read))
            ));

            writer.write(&ByteString::from("late"))?;
            writer.flush().await?;
            assert_eq!(reader.join().await, fiber::FiberState::Completed);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_backpressure_pauses_pump() {
        run(async {
            let source = vec![7u8; 64];
            let stream = Stream::from_reader_with(io::Cursor::new(source), small());
            crate::runtime::system::sleep(Duration::from_millis(10)).await?;
            {
                let state = stream.shared.state.lock();
                assert!(state.read.buffered >= 8);
                assert!(state.read.buffered < 64);
            }
            assert_eq!(stream.read_all().await?.len(), 64);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_copy_leaves_streams_open() {
        let (client, server) = tokio::io::duplex(64);
        let copied = run(async move {
            let source = Stream::from_reader(&b"copy me"[..]);
            let mut target = Stream::from_writer(client);
            source.copy(&mut target).await?;
            assert!(!source.is_closed());
            assert!(!target.is_closed());
            target.close().await?;
            Stream::from_reader(server).read_all().await
        })
        .await
        .unwrap();
        assert_eq!(copied, "copy me");
    }
}
