// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Read};

use thiserror::Error;

use crate::sparse::BlocksWithChecksum;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Operation not supported by this source or destination")]
    NotCapable,
    #[error("Source or destination is not open")]
    NotOpen,
    #[error("Device unplugged after {attempts} attempts")]
    Unplugged {
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("I/O error")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Memoized description of a source or destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub name: Option<String>,
    /// Size of the uncompressed image, if known.
    pub size: Option<u64>,
    /// Size of the compressed container, if the image is compressed.
    pub compressed_size: Option<u64>,
    /// Total size of the occupied block ranges, for sparse-capable sources.
    pub blockmapped_size: Option<u64>,
    pub is_compressed: bool,
    /// Whether `size` is an estimate (eg. from a compression container
    /// header) rather than an exact byte count.
    pub is_size_estimated: bool,
}

/// Options for [`SourceDestination::create_read_stream`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadStreamOptions {
    pub start: u64,
    /// Inclusive end offset. `None` reads to the end.
    pub end: Option<u64>,
}

/// Capability contract between the transfer engine and concrete
/// sources/destinations (raw files, block devices, archive containers,
/// remote blobs).
///
/// Every capability defaults to "unsupported" so implementors only override
/// what they can actually do. `open`/`close` must be idempotent.
pub trait SourceDestination: Send + Sync {
    fn open(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn metadata(&self) -> Result<Metadata>;

    /// Required direct-I/O alignment for positioned reads/writes, if any.
    fn alignment(&self) -> Option<usize> {
        None
    }

    /// Number of leading bytes a write stage should withhold until stream
    /// finalization. Non-zero for destinations where the OS would otherwise
    /// mount the device mid-write.
    fn first_bytes_to_keep(&self) -> u64 {
        0
    }

    fn can_read(&self) -> bool {
        false
    }

    fn can_write(&self) -> bool {
        false
    }

    fn can_create_read_stream(&self) -> bool {
        false
    }

    fn can_create_sparse_read_stream(&self) -> bool {
        false
    }

    fn can_create_write_stream(&self) -> bool {
        false
    }

    fn can_create_sparse_write_stream(&self) -> bool {
        false
    }

    /// Positioned random-access read. May return fewer bytes than requested.
    fn read_at(&self, _buf: &mut [u8], _offset: u64) -> Result<usize> {
        Err(Error::NotCapable)
    }

    /// Positioned random-access write. May write fewer bytes than requested.
    fn write_at(&self, _buf: &[u8], _offset: u64) -> Result<usize> {
        Err(Error::NotCapable)
    }

    /// Positioned read that only stops short of filling `buf` at EOF.
    fn read_full_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut filled = 0;

        while filled < buf.len() {
            let n = self.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }

            filled += n;
        }

        Ok(filled)
    }

    /// Positioned write of the entire buffer.
    fn write_all_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut written = 0;

        while written < buf.len() {
            let n = self.write_at(&buf[written..], offset + written as u64)?;
            if n == 0 {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!(
                        "Expected to write {} bytes at {offset}, but stalled after {written}",
                        buf.len(),
                    ),
                )));
            }

            written += n;
        }

        Ok(())
    }

    /// Sequential byte stream over `[start, end]`. Implementations without
    /// random access must fail with [`Error::NotCapable`] when `start` is
    /// non-zero.
    fn create_read_stream(
        &self,
        _options: ReadStreamOptions,
    ) -> Result<Box<dyn Read + Send + '_>> {
        Err(Error::NotCapable)
    }

    /// Occupied block ranges of the image, for sparse-capable sources. The
    /// list is sorted and non-overlapping.
    fn blocks(&self) -> Result<Vec<BlocksWithChecksum>> {
        Err(Error::NotCapable)
    }
}
