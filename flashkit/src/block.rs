// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{self, Read},
    ops::Deref,
    sync::atomic::{AtomicBool, Ordering},
};

use thiserror::Error;

use crate::{
    align,
    buffer::{AlignedBuffer, BufferPool, ReadGuard},
    retry,
    source::{self, SourceDestination},
    CHUNK_SIZE, DEFAULT_ALIGNMENT,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Source/destination error")]
    Source(#[from] source::Error),
    #[error("Buffer pool error")]
    Buffer(#[from] crate::buffer::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Returns an I/O error with the [`io::ErrorKind::Interrupted`] type if
/// `cancel_signal` is true. This is called once per chunk in the transfer
/// loops for responsive cancellation.
pub fn check_cancel(cancel_signal: &AtomicBool) -> io::Result<()> {
    if cancel_signal.load(Ordering::SeqCst) {
        return Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "Received cancel signal",
        ));
    }

    Ok(())
}

/// A contiguous run of image bytes backed by a pool buffer. The shared lock
/// on the backing buffer is held for the lifetime of the chunk, so the
/// producer cannot refill the buffer while any consumer still references it.
pub struct Chunk {
    guard: ReadGuard,
    position: u64,
    len: usize,
}

impl Chunk {
    pub fn new(guard: ReadGuard, position: u64, len: usize) -> Self {
        debug_assert!(len <= guard.len());

        Self {
            guard,
            position,
            len,
        }
    }

    /// Absolute byte offset of the first byte within the image.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn alignment(&self) -> usize {
        self.guard.buffer().alignment()
    }

    /// Acquire another shared lock on the backing buffer so the same bytes
    /// can be handed to an additional consumer. Cannot block because a
    /// shared lock is already held.
    pub fn duplicate(&self) -> Self {
        Self {
            guard: self.guard.buffer().rlock(),
            position: self.position,
            len: self.len,
        }
    }
}

impl Deref for Chunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard[..self.len]
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("position", &self.position)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

/// Pull-based producer of in-order [`Chunk`]s.
pub trait ChunkStream {
    /// Produce the next chunk or `None` at end of stream.
    fn next_chunk(&mut self) -> Result<Option<Chunk>>;
}

#[derive(Debug, Clone, Copy)]
pub struct BlockReadStreamOptions {
    pub start: u64,
    /// Inclusive end offset. `None` reads until the source reports EOF.
    pub end: Option<u64>,
    pub chunk_size: usize,
    pub alignment: usize,
    pub num_buffers: usize,
}

impl Default for BlockReadStreamOptions {
    fn default() -> Self {
        Self {
            start: 0,
            end: None,
            chunk_size: CHUNK_SIZE,
            alignment: DEFAULT_ALIGNMENT,
            num_buffers: 2,
        }
    }
}

/// Reads a source with positioned I/O and yields aligned chunks. The chunk
/// size is rounded down to a multiple of the alignment, with a floor of one
/// alignment unit.
pub struct BlockReadStream<'a> {
    source: &'a dyn SourceDestination,
    pool: BufferPool,
    chunk_size: usize,
    position: u64,
    end: Option<u64>,
    done: bool,
}

impl<'a> BlockReadStream<'a> {
    pub fn new(source: &'a dyn SourceDestination, options: BlockReadStreamOptions) -> Self {
        let alignment = options.alignment.max(1);
        let chunk_size = align::align_down(options.chunk_size, alignment).max(alignment);

        Self {
            source,
            pool: BufferPool::new(chunk_size, alignment, options.num_buffers),
            chunk_size,
            position: options.start,
            end: options.end,
            done: false,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }
}

impl ChunkStream for BlockReadStream<'_> {
    fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.done {
            return Ok(None);
        }

        let want = match self.end {
            Some(end) => {
                let remain = (end + 1).saturating_sub(self.position);
                if remain == 0 {
                    self.done = true;
                    return Ok(None);
                }

                (self.chunk_size as u64).min(remain) as usize
            }
            None => self.chunk_size,
        };

        let buffer = self.pool.next()?;
        let mut guard = buffer.lock();

        // Request whole alignment units. The source clips at EOF.
        let request = align::align_up(want, self.pool.alignment())
            .unwrap_or(want)
            .min(guard.len());

        let n = retry::retry_on_transient(retry::MAX_RETRIES, retry::RETRY_BASE_TIMEOUT, || {
            self.source.read_full_at(&mut guard[..request], self.position)
        })?;
        if n == 0 {
            self.done = true;
            return Ok(None);
        } else if n < request {
            // Short read means EOF. Yield the final partial chunk first.
            self.done = true;
        }

        drop(guard);

        let len = n.min(want);
        let chunk = Chunk::new(buffer.rlock(), self.position, len);
        self.position += len as u64;

        Ok(Some(chunk))
    }
}

/// Writes in-order chunks to a destination with positioned I/O.
///
/// With `delay_first_buffer`, the first chunk is copied aside and only
/// written during [`Self::finish`]. Keeping the partition table unwritten
/// until the end prevents the OS from mounting a half-flashed drive.
pub struct BlockWriteStream<'a> {
    destination: &'a dyn SourceDestination,
    delay_first_buffer: bool,
    delayed: Option<(AlignedBuffer, u64, usize)>,
    started: bool,
    bytes_written: u64,
}

impl<'a> BlockWriteStream<'a> {
    pub fn new(destination: &'a dyn SourceDestination, delay_first_buffer: bool) -> Self {
        Self {
            destination,
            delay_first_buffer,
            delayed: None,
            started: false,
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Number of bytes copied aside and not yet flushed by [`Self::finish`].
    pub fn delayed_bytes(&self) -> u64 {
        self.delayed.as_ref().map(|(_, _, len)| *len as u64).unwrap_or(0)
    }

    pub fn write_chunk(&mut self, chunk: &Chunk) -> Result<()> {
        if self.delay_first_buffer && !self.started {
            let mut copy = AlignedBuffer::new(chunk.len().max(1), chunk.alignment())?;
            copy[..chunk.len()].copy_from_slice(chunk);

            self.delayed = Some((copy, chunk.position(), chunk.len()));
            self.started = true;
            self.bytes_written += chunk.len() as u64;

            return Ok(());
        }

        self.started = true;

        retry::retry_on_transient(retry::MAX_RETRIES, retry::RETRY_BASE_TIMEOUT, || {
            self.destination.write_all_at(chunk, chunk.position())
        })?;
        self.bytes_written += chunk.len() as u64;

        Ok(())
    }

    /// Flush the delayed first chunk, if any, and return the total number of
    /// bytes written.
    ///
    /// The chunk stays delayed if the write fails, so [`Self::delayed_bytes`]
    /// still reports it as unwritten.
    pub fn finish(&mut self) -> Result<u64> {
        if let Some((buf, position, len)) = &self.delayed {
            retry::retry_on_transient(retry::MAX_RETRIES, retry::RETRY_BASE_TIMEOUT, || {
                self.destination.write_all_at(&buf[..*len], *position)
            })?;
        }
        self.delayed = None;

        Ok(self.bytes_written)
    }
}

/// Repacks an arbitrary byte stream into aligned, chunk-sized pool buffers.
/// Used when the source only offers a sequential stream (eg. a decompressor)
/// but a destination requires aligned direct I/O.
pub struct AlignStream<R: Read> {
    inner: R,
    pool: BufferPool,
    position: u64,
    done: bool,
}

impl<R: Read> AlignStream<R> {
    pub fn new(inner: R, options: BlockReadStreamOptions) -> Self {
        let alignment = options.alignment.max(1);
        let chunk_size = align::align_down(options.chunk_size, alignment).max(alignment);

        Self {
            inner,
            pool: BufferPool::new(chunk_size, alignment, options.num_buffers),
            position: options.start,
            done: false,
        }
    }
}

impl<R: Read> ChunkStream for AlignStream<R> {
    fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.done {
            return Ok(None);
        }

        let chunk_size = self.pool.buffer_size();
        let buffer = self.pool.next()?;
        let mut guard = buffer.lock();

        let mut filled = 0;
        while filled < chunk_size {
            let n = self.inner.read(&mut guard[filled..chunk_size])?;
            if n == 0 {
                self.done = true;
                break;
            }

            filled += n;
        }

        drop(guard);

        if filled == 0 {
            return Ok(None);
        }

        let chunk = Chunk::new(buffer.rlock(), self.position, filled);
        self.position += filled as u64;

        Ok(Some(chunk))
    }
}
