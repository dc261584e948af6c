// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Sparse transfers copy only the occupied regions of an image. A source
//! advertises its occupied regions as a list of [`BlocksWithChecksum`]
//! entries, where each entry carries one checksum covering the concatenated
//! bytes of its block ranges. The stream stages in this module walk those
//! regions in order, keep one hasher alive per entry, and either record
//! ([`generate_checksums`](SparseReadStreamOptions::generate_checksums)) or
//! check ([`verify`](SparseReadStreamOptions::verify)) the entry checksum at
//! each entry boundary.

use std::{
    io::{self, Read},
    ops::Deref,
    sync::Arc,
};

use thiserror::Error;

use crate::{
    align,
    buffer::{AlignedBuffer, BufferPool, ReadGuard},
    checksum::{ChecksumType, Hasher},
    retry,
    source::{self, SourceDestination},
    CHUNK_SIZE, DEFAULT_ALIGNMENT,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Cannot verify and generate checksums at the same time")]
    VerifyConflictsWithGenerate,
    #[error("Block range set #{index} has no checksum type")]
    MissingChecksumType { index: usize },
    #[error("Block range set #{index} has no checksum to verify against")]
    MissingChecksum { index: usize },
    #[error(
        "{checksum_type} mismatch for bytes {offset}..{end}: expected {expected}, but have {actual}"
    )]
    BlocksVerification {
        checksum_type: ChecksumType,
        expected: String,
        actual: String,
        offset: u64,
        end: u64,
    },
    #[error("Source/destination error")]
    Source(#[from] source::Error),
    #[error("Buffer pool error")]
    Buffer(#[from] crate::buffer::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A contiguous occupied byte range of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub offset: u64,
    pub length: u64,
}

impl BlockRange {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// A group of block ranges covered by a single checksum over their
/// concatenated bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlocksWithChecksum {
    pub checksum_type: Option<ChecksumType>,
    pub checksum: Option<String>,
    pub blocks: Vec<BlockRange>,
}

/// Total number of occupied bytes across all entries. This is the progress
/// denominator for sparse transfers.
pub fn blocks_length(blocks: &[BlocksWithChecksum]) -> u64 {
    blocks
        .iter()
        .flat_map(|e| &e.blocks)
        .map(|b| b.length)
        .sum()
}

/// Payload of a [`SparseChunk`]. Pool-backed chunks hold a shared lock on
/// their ring buffer for their entire lifetime, like [`crate::block::Chunk`].
pub enum SparseData {
    Pool { guard: ReadGuard, len: usize },
    Raw(Arc<[u8]>),
}

impl Deref for SparseData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Pool { guard, len } => &guard[..*len],
            Self::Raw(data) => data,
        }
    }
}

/// A run of occupied bytes tagged with its absolute image offset.
pub struct SparseChunk {
    data: SparseData,
    position: u64,
}

impl SparseChunk {
    pub fn from_pool(guard: ReadGuard, len: usize, position: u64) -> Self {
        debug_assert!(len <= guard.len());

        Self {
            data: SparseData::Pool { guard, len },
            position,
        }
    }

    pub fn from_raw(data: impl Into<Arc<[u8]>>, position: u64) -> Self {
        Self {
            data: SparseData::Raw(data.into()),
            position,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Hand the same bytes to an additional consumer. For pool-backed chunks,
    /// this acquires another shared lock, which cannot block because one is
    /// already held.
    pub fn duplicate(&self) -> Self {
        let data = match &self.data {
            SparseData::Pool { guard, len } => SparseData::Pool {
                guard: guard.buffer().rlock(),
                len: *len,
            },
            SparseData::Raw(data) => SparseData::Raw(data.clone()),
        };

        Self {
            data,
            position: self.position,
        }
    }
}

impl Deref for SparseChunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for SparseChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseChunk")
            .field("position", &self.position)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// Pull-based producer of in-order [`SparseChunk`]s.
pub trait SparseChunkStream {
    fn next_chunk(&mut self) -> Result<Option<SparseChunk>>;

    /// The block ranges driving this stream. In checksum-generating mode,
    /// entries gain their checksums as the stream crosses entry boundaries.
    fn blocks(&self) -> &[BlocksWithChecksum];
}

/// Cursor over the occupied ranges with per-entry checksum bookkeeping.
///
/// Stream stages call [`Self::current`] for the next unread range, feed the
/// bytes they consumed to [`Self::hash`], and then [`Self::advance`] past
/// them. Crossing an entry boundary finalizes that entry's hasher: in
/// generate mode the digest is stored on the entry, in verify mode it is
/// compared against the stored one.
struct SparseReaderState {
    blocks: Vec<BlocksWithChecksum>,
    verify: bool,
    generate: bool,
    entry: usize,
    sub: usize,
    consumed: u64,
    hasher: Option<Hasher>,
}

impl SparseReaderState {
    fn new(
        mut blocks: Vec<BlocksWithChecksum>,
        verify: bool,
        generate: bool,
        image_size: Option<u64>,
    ) -> Result<Self> {
        if verify && generate {
            return Err(Error::VerifyConflictsWithGenerate);
        }

        for (index, entry) in blocks.iter().enumerate() {
            if (verify || generate) && entry.checksum_type.is_none() {
                return Err(Error::MissingChecksumType { index });
            }
            if verify && entry.checksum.is_none() {
                return Err(Error::MissingChecksum { index });
            }
        }

        // A block map may extend past the actual image (eg. a trailing
        // partial filesystem block). Clip before iteration begins.
        if let Some(size) = image_size {
            for entry in &mut blocks {
                for block in &mut entry.blocks {
                    if block.end() > size {
                        block.length = size.saturating_sub(block.offset);
                    }
                }
            }
        }

        let mut state = Self {
            blocks,
            verify,
            generate,
            entry: 0,
            sub: 0,
            consumed: 0,
            hasher: None,
        };

        if !state.blocks.is_empty() {
            state.hasher = state.new_hasher(0);
            state.normalize()?;
        }

        Ok(state)
    }

    fn new_hasher(&self, entry: usize) -> Option<Hasher> {
        if self.verify || self.generate {
            // Validated in the constructor.
            Some(Hasher::new(self.blocks[entry].checksum_type.unwrap()))
        } else {
            None
        }
    }

    /// Skip empty ranges and finalize exhausted entries until the cursor
    /// points at a non-empty unread range or the end.
    fn normalize(&mut self) -> Result<()> {
        while self.entry < self.blocks.len() {
            let subs = &self.blocks[self.entry].blocks;
            if self.sub < subs.len() && subs[self.sub].length == 0 {
                self.sub += 1;
            } else if self.sub == subs.len() {
                self.finalize_entry()?;
                self.entry += 1;
                self.sub = 0;
                if self.entry < self.blocks.len() {
                    self.hasher = self.new_hasher(self.entry);
                }
            } else {
                break;
            }
        }

        Ok(())
    }

    fn finalize_entry(&mut self) -> Result<()> {
        let Some(hasher) = self.hasher.take() else {
            return Ok(());
        };

        let actual = hasher.finalize_hex();
        let entry = &mut self.blocks[self.entry];

        if self.generate {
            entry.checksum = Some(actual);
        } else {
            let expected = entry.checksum.as_deref().unwrap();
            if actual != expected {
                let offset = entry.blocks.first().map(|b| b.offset).unwrap_or(0);
                let end = entry.blocks.last().map(|b| b.end()).unwrap_or(offset);

                return Err(Error::BlocksVerification {
                    checksum_type: entry.checksum_type.unwrap(),
                    expected: expected.to_owned(),
                    actual,
                    offset,
                    end,
                });
            }
        }

        Ok(())
    }

    /// The unread remainder of the current range, or `None` at the end.
    fn current(&self) -> Option<BlockRange> {
        let entry = self.blocks.get(self.entry)?;
        let block = entry.blocks[self.sub];

        Some(BlockRange {
            offset: block.offset + self.consumed,
            length: block.length - self.consumed,
        })
    }

    fn hash(&mut self, data: &[u8]) {
        if let Some(hasher) = &mut self.hasher {
            hasher.update(data);
        }
    }

    fn advance(&mut self, bytes: u64) -> Result<()> {
        self.consumed += bytes;

        let block = self.blocks[self.entry].blocks[self.sub];
        debug_assert!(self.consumed <= block.length);

        if self.consumed == block.length {
            self.sub += 1;
            self.consumed = 0;
            self.normalize()?;
        }

        Ok(())
    }

    fn blocks(&self) -> &[BlocksWithChecksum] {
        &self.blocks
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SparseStreamOptions {
    pub chunk_size: usize,
    pub alignment: usize,
    pub num_buffers: usize,
    /// Check each entry's bytes against its stored checksum.
    pub verify: bool,
    /// Record each entry's checksum as its bytes stream through. Mutually
    /// exclusive with `verify`.
    pub generate_checksums: bool,
}

impl Default for SparseStreamOptions {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            alignment: DEFAULT_ALIGNMENT,
            num_buffers: 2,
            verify: false,
            generate_checksums: false,
        }
    }
}

/// Produces the occupied ranges of a random-access source as sparse chunks.
pub struct SparseReadStream<'a> {
    source: &'a dyn SourceDestination,
    state: SparseReaderState,
    pool: BufferPool,
    chunk_size: usize,
}

impl std::fmt::Debug for SparseReadStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseReadStream")
            .field("pool", &self.pool)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

impl<'a> SparseReadStream<'a> {
    pub fn new(
        source: &'a dyn SourceDestination,
        blocks: Vec<BlocksWithChecksum>,
        options: SparseStreamOptions,
    ) -> Result<Self> {
        let image_size = source.metadata()?.size;
        let state = SparseReaderState::new(
            blocks,
            options.verify,
            options.generate_checksums,
            image_size,
        )?;
        let alignment = options.alignment.max(1);
        let chunk_size = align::align_down(options.chunk_size, alignment).max(alignment);

        Ok(Self {
            source,
            state,
            pool: BufferPool::new(chunk_size, alignment, options.num_buffers),
            chunk_size,
        })
    }
}

impl SparseChunkStream for SparseReadStream<'_> {
    fn next_chunk(&mut self) -> Result<Option<SparseChunk>> {
        let Some(range) = self.state.current() else {
            return Ok(None);
        };

        let want = (self.chunk_size as u64).min(range.length) as usize;
        let buffer = self.pool.next()?;
        let mut guard = buffer.lock();

        let request = align::align_up(want, self.pool.alignment())
            .unwrap_or(want)
            .min(guard.len());

        let n = retry::retry_on_transient(retry::MAX_RETRIES, retry::RETRY_BASE_TIMEOUT, || {
            self.source.read_full_at(&mut guard[..request], range.offset)
        })?;
        if n < want {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Image ended inside occupied range at {}", range.offset),
            )
            .into());
        }

        self.state.hash(&guard[..want]);
        drop(guard);

        self.state.advance(want as u64)?;

        Ok(Some(SparseChunk::from_pool(
            buffer.rlock(),
            want,
            range.offset,
        )))
    }

    fn blocks(&self) -> &[BlocksWithChecksum] {
        self.state.blocks()
    }
}

/// Drives the occupied ranges over a sequential byte stream, discarding the
/// bytes that fall outside them and re-tagging the retained bytes with their
/// absolute positions. Used when the source cannot read at arbitrary offsets
/// (eg. a decompressor).
pub struct SparseFilterStream<R: Read> {
    inner: R,
    state: SparseReaderState,
    pool: BufferPool,
    chunk_size: usize,
    position: u64,
}

impl<R: Read> SparseFilterStream<R> {
    pub fn new(
        inner: R,
        blocks: Vec<BlocksWithChecksum>,
        image_size: Option<u64>,
        options: SparseStreamOptions,
    ) -> Result<Self> {
        let state = SparseReaderState::new(
            blocks,
            options.verify,
            options.generate_checksums,
            image_size,
        )?;
        let alignment = options.alignment.max(1);
        let chunk_size = align::align_down(options.chunk_size, alignment).max(alignment);

        Ok(Self {
            inner,
            state,
            pool: BufferPool::new(chunk_size, alignment, options.num_buffers),
            chunk_size,
            position: 0,
        })
    }
}

impl<R: Read> SparseChunkStream for SparseFilterStream<R> {
    fn next_chunk(&mut self) -> Result<Option<SparseChunk>> {
        let Some(range) = self.state.current() else {
            return Ok(None);
        };

        if self.position < range.offset {
            let skip = range.offset - self.position;
            let copied = io::copy(&mut (&mut self.inner).take(skip), &mut io::sink())?;
            if copied < skip {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("Stream ended inside gap at {}", self.position + copied),
                )
                .into());
            }

            self.position = range.offset;
        }

        let want = (self.chunk_size as u64).min(range.length) as usize;
        let buffer = self.pool.next()?;
        let mut guard = buffer.lock();

        let mut filled = 0;
        while filled < want {
            let n = self.inner.read(&mut guard[filled..want])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "Stream ended inside occupied range at {}",
                        self.position + filled as u64,
                    ),
                )
                .into());
            }

            filled += n;
        }

        self.state.hash(&guard[..want]);
        drop(guard);

        self.state.advance(want as u64)?;
        self.position += want as u64;

        Ok(Some(SparseChunk::from_pool(
            buffer.rlock(),
            want,
            range.offset,
        )))
    }

    fn blocks(&self) -> &[BlocksWithChecksum] {
        self.state.blocks()
    }
}

/// Writes sparse chunks to a destination with positioned I/O.
///
/// Bytes landing below `first_bytes_to_keep` are copied aside and only
/// written during [`Self::finish`], so the OS cannot mount a half-flashed
/// drive off its partition table.
pub struct SparseWriteStream<'a> {
    destination: &'a dyn SourceDestination,
    first_bytes_to_keep: u64,
    alignment: usize,
    withheld: Vec<(AlignedBuffer, u64, usize)>,
    bytes_written: u64,
}

impl<'a> SparseWriteStream<'a> {
    pub fn new(
        destination: &'a dyn SourceDestination,
        first_bytes_to_keep: u64,
        alignment: usize,
    ) -> Self {
        Self {
            destination,
            first_bytes_to_keep,
            alignment: alignment.max(1),
            withheld: vec![],
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Number of bytes copied aside and not yet flushed by [`Self::finish`].
    pub fn withheld_bytes(&self) -> u64 {
        self.withheld.iter().map(|(_, _, len)| *len as u64).sum()
    }

    fn write_at(&mut self, data: &[u8], position: u64) -> Result<()> {
        retry::retry_on_transient(retry::MAX_RETRIES, retry::RETRY_BASE_TIMEOUT, || {
            self.destination.write_all_at(data, position)
        })?;
        self.bytes_written += data.len() as u64;

        Ok(())
    }

    pub fn write_chunk(&mut self, chunk: &SparseChunk) -> Result<()> {
        let position = chunk.position();

        if position < self.first_bytes_to_keep {
            let keep = ((self.first_bytes_to_keep - position) as usize).min(chunk.len());

            let mut copy = AlignedBuffer::new(keep.max(1), self.alignment)?;
            copy[..keep].copy_from_slice(&chunk[..keep]);
            self.withheld.push((copy, position, keep));
            // Counted now. The flush in finish() does not count it again.
            self.bytes_written += keep as u64;

            if keep < chunk.len() {
                let (_, rest) = chunk.split_at(keep);
                self.write_at(rest, position + keep as u64)?;
            }
        } else {
            self.write_at(chunk, position)?;
        }

        Ok(())
    }

    /// Flush the withheld leading bytes and return the total number of bytes
    /// written.
    ///
    /// Entries not yet on disk stay withheld if a write fails, so
    /// [`Self::withheld_bytes`] still reports them as unwritten.
    pub fn finish(&mut self) -> Result<u64> {
        while !self.withheld.is_empty() {
            {
                let (buf, position, len) = &self.withheld[0];
                retry::retry_on_transient(retry::MAX_RETRIES, retry::RETRY_BASE_TIMEOUT, || {
                    self.destination.write_all_at(&buf[..*len], *position)
                })?;
            }

            self.withheld.remove(0);
        }

        Ok(self.bytes_written)
    }
}

/// Repacks sparse chunks into alignment-sized pool buffers, merging
/// contiguous runs and splitting at gaps. Absolute positions are preserved.
pub struct SparseAlignStream<S: SparseChunkStream> {
    inner: S,
    pool: BufferPool,
    pending: Option<SparseChunk>,
    pending_offset: usize,
}

impl<S: SparseChunkStream> SparseAlignStream<S> {
    pub fn new(inner: S, chunk_size: usize, alignment: usize, num_buffers: usize) -> Self {
        let alignment = alignment.max(1);
        let chunk_size = align::align_down(chunk_size, alignment).max(alignment);

        Self {
            inner,
            pool: BufferPool::new(chunk_size, alignment, num_buffers),
            pending: None,
            pending_offset: 0,
        }
    }
}

impl<S: SparseChunkStream> SparseChunkStream for SparseAlignStream<S> {
    fn next_chunk(&mut self) -> Result<Option<SparseChunk>> {
        let chunk_size = self.pool.buffer_size();
        let mut buffer = None;
        let mut guard = None;
        let mut position = 0;
        let mut filled = 0;

        while filled < chunk_size {
            let piece = match self.pending.take() {
                Some(piece) => piece,
                None => match self.inner.next_chunk()? {
                    Some(piece) => {
                        self.pending_offset = 0;
                        piece
                    }
                    None => break,
                },
            };

            let piece_position = piece.position() + self.pending_offset as u64;

            if filled == 0 {
                let next = self.pool.next()?;
                guard = Some(next.lock());
                buffer = Some(next);
                position = piece_position;
            } else if piece_position != position + filled as u64 {
                // Gap. Flush what we have and keep the piece for later.
                self.pending = Some(piece);
                break;
            }

            let take = (chunk_size - filled).min(piece.len() - self.pending_offset);
            guard.as_mut().unwrap()[filled..filled + take]
                .copy_from_slice(&piece[self.pending_offset..self.pending_offset + take]);
            filled += take;
            self.pending_offset += take;

            if self.pending_offset < piece.len() {
                self.pending = Some(piece);
            }
        }

        drop(guard);

        if filled == 0 {
            return Ok(None);
        }

        let buffer = buffer.unwrap();
        Ok(Some(SparseChunk::from_pool(
            buffer.rlock(),
            filled,
            position,
        )))
    }

    fn blocks(&self) -> &[BlocksWithChecksum] {
        self.inner.blocks()
    }
}
