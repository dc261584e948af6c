// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{io, sync::atomic::AtomicBool};

use thiserror::Error;

use crate::{
    block::{self, check_cancel, BlockReadStream, BlockReadStreamOptions, ChunkStream},
    checksum::{ChecksumType, Hasher},
    sparse::{
        self, blocks_length, BlocksWithChecksum, SparseChunkStream, SparseFilterStream,
        SparseReadStream, SparseStreamOptions,
    },
    source::{self, ReadStreamOptions, SourceDestination},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("{checksum_type} mismatch: expected {expected}, but have {actual}")]
    ChecksumMismatch {
        checksum_type: ChecksumType,
        expected: String,
        actual: String,
    },
    #[error("Block range set #{index} needs both a checksum type and a checksum")]
    IncompleteBlocks { index: usize },
    #[error("Source/destination error")]
    Source(#[from] source::Error),
    #[error("Block stream error")]
    Block(#[from] block::Error),
    #[error("Sparse stream error")]
    Sparse(#[from] sparse::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Per-destination progress hook: `(position, delta)`.
pub type ByteProgress<'a> = &'a (dyn Fn(u64, u64) + Sync);

/// Re-reads a destination after flashing and checks it against what was
/// supposed to land there.
///
/// The checksum variant re-reads the whole written extent `[0, size)` and
/// compares one digest. The blocks variant re-reads only the occupied ranges
/// and compares each entry's checksum, through positioned reads when the
/// destination supports them and through its sequential stream otherwise.
#[derive(Debug, Clone)]
pub enum Verifier {
    Checksum {
        checksum_type: ChecksumType,
        checksum: String,
        size: u64,
    },
    Blocks(Vec<BlocksWithChecksum>),
}

impl Verifier {
    pub fn for_checksum(
        checksum_type: ChecksumType,
        checksum: impl Into<String>,
        size: u64,
    ) -> Self {
        Self::Checksum {
            checksum_type,
            checksum: checksum.into(),
            size,
        }
    }

    pub fn for_blocks(blocks: Vec<BlocksWithChecksum>) -> Result<Self> {
        for (index, entry) in blocks.iter().enumerate() {
            if entry.checksum_type.is_none() || entry.checksum.is_none() {
                return Err(Error::IncompleteBlocks { index });
            }
        }

        Ok(Self::Blocks(blocks))
    }

    /// Number of bytes one run will read.
    pub fn total_bytes(&self) -> u64 {
        match self {
            Self::Checksum { size, .. } => *size,
            Self::Blocks(blocks) => blocks_length(blocks),
        }
    }

    pub fn run(
        &self,
        destination: &dyn SourceDestination,
        alignment: usize,
        progress: ByteProgress,
        cancel_signal: &AtomicBool,
    ) -> Result<()> {
        match self {
            Self::Checksum {
                checksum_type,
                checksum,
                size,
            } => {
                let mut hasher = Hasher::new(*checksum_type);

                if *size > 0 {
                    let mut stream = BlockReadStream::new(
                        destination,
                        BlockReadStreamOptions {
                            end: Some(*size - 1),
                            alignment,
                            ..Default::default()
                        },
                    );

                    while let Some(chunk) = stream.next_chunk()? {
                        check_cancel(cancel_signal)?;

                        hasher.update(&chunk);
                        progress(chunk.position() + chunk.len() as u64, chunk.len() as u64);
                    }
                }

                let actual = hasher.finalize_hex();
                if actual != *checksum {
                    return Err(Error::ChecksumMismatch {
                        checksum_type: *checksum_type,
                        expected: checksum.clone(),
                        actual,
                    });
                }

                Ok(())
            }
            Self::Blocks(blocks) => {
                let options = SparseStreamOptions {
                    alignment,
                    verify: true,
                    ..Default::default()
                };

                if destination.can_read() {
                    let mut stream =
                        SparseReadStream::new(destination, blocks.clone(), options)?;
                    Self::drain_sparse(&mut stream, progress, cancel_signal)
                } else if destination.can_create_read_stream() {
                    let inner = destination.create_read_stream(ReadStreamOptions::default())?;
                    let size = destination.metadata()?.size;
                    let mut stream =
                        SparseFilterStream::new(inner, blocks.clone(), size, options)?;
                    Self::drain_sparse(&mut stream, progress, cancel_signal)
                } else {
                    Err(source::Error::NotCapable.into())
                }
            }
        }
    }

    fn drain_sparse(
        stream: &mut dyn SparseChunkStream,
        progress: ByteProgress,
        cancel_signal: &AtomicBool,
    ) -> Result<()> {
        while let Some(chunk) = stream.next_chunk()? {
            check_cancel(cancel_signal)?;

            progress(chunk.position() + chunk.len() as u64, chunk.len() as u64);
        }

        Ok(())
    }
}
