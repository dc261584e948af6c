// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! End-to-end flash orchestration: open everything, pick the sparse or the
//! regular path, fan the source out to the destinations, optionally verify,
//! and report consolidated progress throughout.

use std::{
    collections::BTreeMap,
    io::{self, Read, Write},
    path::Path,
    sync::{atomic::AtomicBool, Arc, Mutex},
    time::Duration,
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    block::{self, check_cancel, AlignStream, BlockReadStream, BlockReadStreamOptions},
    checksum::{ChecksumType, Hasher},
    file::LocalFile,
    multi::{self, MultiDestination},
    progress::{ProgressEvent, ProgressReporter, PROGRESS_EMISSION_INTERVAL},
    source::{self, Metadata, ReadStreamOptions, SourceDestination},
    sparse::{self, blocks_length, SparseChunkStream, SparseReadStream, SparseStreamOptions},
    verify::{self, Verifier},
    CHUNK_SIZE, DEFAULT_ALIGNMENT, MAX_ALIGNMENT,
};

/// Prefix of the scratch file used when decompressing ahead of the flash.
pub const DECOMPRESSED_IMAGE_PREFIX: &str = "decompressed-image-";

/// Images smaller than this may be decompressed to scratch space first.
pub const DECOMPRESS_LIMIT: u64 = 5 * 1024 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Source/destination error")]
    Source(#[from] source::Error),
    #[error("Block stream error")]
    Block(#[from] block::Error),
    #[error("Sparse stream error")]
    Sparse(#[from] sparse::Error),
    #[error("Verification error")]
    Verify(#[from] verify::Error),
    #[error("Fan-out error")]
    Multi(#[from] multi::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStep {
    Decompressing,
    Flashing,
    Verifying,
    Finished,
}

/// Consolidated progress for the whole flash operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlashProgress {
    pub step: TransferStep,
    pub sparse: bool,
    /// Destinations still participating.
    pub active: usize,
    /// Destinations with a recorded failure.
    pub failed: usize,
    /// Least advanced absolute position across the destinations.
    pub position: u64,
    /// Bytes transferred in the current step.
    pub bytes: u64,
    /// Windowed transfer rate in bytes per second.
    pub speed: f64,
    pub average_speed: f64,
    /// Percent complete, when the total is known.
    pub percentage: Option<f64>,
    /// Estimated seconds remaining, when the total and rate are known.
    pub eta_secs: Option<f64>,
}

pub type FlashProgressCallback<'a> = &'a (dyn Fn(FlashProgress) + Send + Sync);

#[derive(Debug, Clone)]
pub struct PipeOptions {
    /// Re-read the destinations after flashing and check what landed there.
    pub verify: bool,
    pub chunk_size: usize,
    pub num_buffers: usize,
    pub progress_interval: Duration,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self {
            verify: false,
            chunk_size: CHUNK_SIZE,
            num_buffers: 16,
            progress_interval: PROGRESS_EMISSION_INTERVAL,
        }
    }
}

/// Outcome of a flash. Individual destination failures do not fail the whole
/// operation; they end up in `failures` keyed by destination index.
#[derive(Debug)]
pub struct FlashResult {
    pub failures: BTreeMap<usize, multi::Error>,
    pub bytes_written: u64,
    pub source_metadata: Metadata,
}

fn eta_secs(current: u64, total: u64, speed: f64) -> Option<f64> {
    if speed > 0.0 {
        Some((total - current) as f64 / speed)
    } else {
        None
    }
}

struct ProgressContext<'a> {
    multi: &'a MultiDestination,
    step: Mutex<TransferStep>,
    /// Progress denominator: blockmapped size for sparse flashes, image size
    /// otherwise. May be corrected mid-operation for estimated sizes.
    total: Mutex<Option<u64>>,
    sparse: bool,
    on_progress: Option<FlashProgressCallback<'a>>,
}

impl ProgressContext<'_> {
    fn set_step(&self, step: TransferStep) {
        *self.step.lock().unwrap() = step;
    }

    fn set_total(&self, total: Option<u64>) {
        *self.total.lock().unwrap() = total;
    }

    fn emit(&self, event: ProgressEvent) {
        let Some(on_progress) = self.on_progress else {
            return;
        };

        let total = *self.total.lock().unwrap();
        // Sparse streams skip gaps, so completed work is the number of bytes
        // transferred. For regular streams it is the stream position.
        let current = if self.sparse {
            event.bytes
        } else {
            event.position
        };

        let (percentage, eta) = match total {
            Some(total) if current <= total && total > 0 => (
                Some(current as f64 / total as f64 * 100.0),
                eta_secs(current, total, event.speed),
            ),
            _ => (None, None),
        };

        let failed = self.multi.failure_count();

        on_progress(FlashProgress {
            step: *self.step.lock().unwrap(),
            sparse: self.sparse,
            active: self.multi.active_count(),
            failed,
            position: event.position,
            bytes: event.bytes,
            speed: event.speed,
            average_speed: event.average_speed,
            percentage,
            eta_secs: eta,
        });
    }
}

/// Flash one source to any number of destinations, optionally verifying the
/// result. This is the main entry point of the crate.
pub fn pipe_source_to_destinations(
    source: &dyn SourceDestination,
    destinations: Vec<Arc<dyn SourceDestination>>,
    options: &PipeOptions,
    on_progress: Option<FlashProgressCallback>,
    cancel_signal: &AtomicBool,
) -> Result<FlashResult> {
    let multi = MultiDestination::new(destinations)?;

    source.open()?;
    multi.open();

    let result = pipe_opened(source, &multi, options, on_progress, cancel_signal);

    if let Err(e) = source.close() {
        warn!("Failed to close source: {e}");
    }
    multi.close();

    let (bytes_written, source_metadata) = result?;

    Ok(FlashResult {
        failures: multi.take_failures(),
        bytes_written,
        source_metadata,
    })
}

fn pipe_opened(
    source: &dyn SourceDestination,
    multi: &MultiDestination,
    options: &PipeOptions,
    on_progress: Option<FlashProgressCallback>,
    cancel_signal: &AtomicBool,
) -> Result<(u64, Metadata)> {
    let mut metadata = source.metadata()?;

    if multi.active_count() == 0 {
        // Nothing opened successfully. The failures say why.
        return Ok((0, metadata));
    }

    let sparse = source.can_create_sparse_read_stream() && multi.can_create_sparse_write_stream();
    let alignment = multi
        .alignment()
        .into_iter()
        .chain(source.alignment())
        .max()
        .unwrap_or(DEFAULT_ALIGNMENT)
        .min(MAX_ALIGNMENT);

    info!(
        "Flashing {:?} to {} destinations (sparse: {sparse}, alignment: {alignment})",
        metadata.name.as_deref().unwrap_or("<unnamed>"),
        multi.destinations().len(),
    );

    let context = ProgressContext {
        multi,
        step: Mutex::new(TransferStep::Flashing),
        total: Mutex::new(if sparse {
            metadata.blockmapped_size
        } else {
            metadata.size
        }),
        sparse,
        on_progress,
    };

    let bytes_written = if sparse {
        pipe_sparse(source, multi, options, alignment, &context, cancel_signal)?
    } else {
        pipe_regular(
            source,
            multi,
            options,
            alignment,
            &mut metadata,
            &context,
            cancel_signal,
        )?
    };

    Ok((bytes_written, metadata))
}

fn pipe_regular(
    source: &dyn SourceDestination,
    multi: &MultiDestination,
    options: &PipeOptions,
    alignment: usize,
    metadata: &mut Metadata,
    context: &ProgressContext,
    cancel_signal: &AtomicBool,
) -> Result<u64> {
    let stream_options = BlockReadStreamOptions {
        start: 0,
        end: metadata.size.and_then(|s| s.checked_sub(1)),
        chunk_size: options.chunk_size,
        alignment,
        num_buffers: options.num_buffers,
    };

    let mut hasher = options.verify.then(|| Hasher::new(ChecksumType::XxHash3));

    let reporter = ProgressReporter::new(
        Box::new(|e| context.emit(e)),
        options.progress_interval,
    );
    let progress = |position, delta| reporter.update(position, delta);

    let bytes_written = if source.can_read() {
        let mut stream = BlockReadStream::new(source, stream_options);
        multi.write_chunks(&mut stream, hasher.as_mut(), &progress, cancel_signal)?
    } else {
        // No random access. Realign the source's sequential stream instead.
        let inner = source.create_read_stream(ReadStreamOptions::default())?;
        let mut stream = AlignStream::new(inner, stream_options);
        multi.write_chunks(&mut stream, hasher.as_mut(), &progress, cancel_signal)?
    };

    reporter.flush();
    let mut last_reporter = reporter;

    if metadata.size.is_none() || metadata.is_size_estimated {
        debug!("Correcting estimated source size to {bytes_written}");
        metadata.size = Some(bytes_written);
        metadata.is_size_estimated = false;
        context.set_total(Some(bytes_written));
    }

    if let Some(hasher) = hasher {
        if multi.active_count() > 0 {
            context.set_step(TransferStep::Verifying);

            let verifier = Verifier::for_checksum(
                ChecksumType::XxHash3,
                hasher.finalize_hex(),
                bytes_written,
            );
            let reporter = ProgressReporter::new(
                Box::new(|e| context.emit(e)),
                options.progress_interval,
            );

            multi.verify(
                &verifier,
                alignment,
                &|position, delta| reporter.update(position, delta),
                cancel_signal,
            );
            last_reporter = reporter;
        }
    }

    context.set_step(TransferStep::Finished);
    last_reporter.flush();

    Ok(bytes_written)
}

fn pipe_sparse(
    source: &dyn SourceDestination,
    multi: &MultiDestination,
    options: &PipeOptions,
    alignment: usize,
    context: &ProgressContext,
    cancel_signal: &AtomicBool,
) -> Result<u64> {
    let blocks = source.blocks()?;
    context.set_total(Some(blocks_length(&blocks)));

    let mut stream = SparseReadStream::new(
        source,
        blocks,
        SparseStreamOptions {
            chunk_size: options.chunk_size,
            alignment,
            num_buffers: options.num_buffers,
            verify: false,
            // The source owns the block layout, so checksums are computed on
            // the way through rather than by a second read.
            generate_checksums: options.verify,
        },
    )?;

    let reporter = ProgressReporter::new(
        Box::new(|e| context.emit(e)),
        options.progress_interval,
    );

    let bytes_written = multi.write_sparse(
        &mut stream,
        alignment,
        &|position, delta| reporter.update(position, delta),
        cancel_signal,
    )?;
    reporter.flush();
    let mut last_reporter = reporter;

    if options.verify && multi.active_count() > 0 {
        context.set_step(TransferStep::Verifying);

        let verifier = Verifier::for_blocks(stream.blocks().to_vec())?;
        let reporter = ProgressReporter::new(
            Box::new(|e| context.emit(e)),
            options.progress_interval,
        );

        multi.verify(
            &verifier,
            alignment,
            &|position, delta| reporter.update(position, delta),
            cancel_signal,
        );
        last_reporter = reporter;
    }

    context.set_step(TransferStep::Finished);
    last_reporter.flush();

    Ok(bytes_written)
}

fn is_worth_decompressing(name: Option<&str>) -> bool {
    let Some(name) = name else {
        return false;
    };

    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| {
            matches!(
                e,
                "img" | "bin" | "hddimg" | "raw" | "sdcard" | "rpi-sdimg" | "wic"
            )
        })
}

fn enough_space_for_decompression(free: Option<u64>, image_size: Option<u64>) -> bool {
    match (free, image_size) {
        (Some(free), Some(size)) => size < (free / 2).min(DECOMPRESS_LIMIT),
        _ => false,
    }
}

/// Like [`pipe_source_to_destinations`], but optionally decompressing the
/// image into a scratch file first when that is likely to be faster than
/// decompressing it once per destination. `free_scratch_space` is the number
/// of bytes available wherever the OS puts temporary files; decompression is
/// skipped when it is unknown or too small. The scratch file is always
/// removed afterwards.
pub fn decompress_then_flash(
    source: &dyn SourceDestination,
    destinations: Vec<Arc<dyn SourceDestination>>,
    options: &PipeOptions,
    decompress_first: bool,
    free_scratch_space: Option<u64>,
    on_progress: Option<FlashProgressCallback>,
    cancel_signal: &AtomicBool,
) -> Result<FlashResult> {
    source.open()?;
    let metadata = source.metadata()?;

    let decompress = decompress_first
        && metadata.is_compressed
        && is_worth_decompressing(metadata.name.as_deref())
        && enough_space_for_decompression(free_scratch_space, metadata.size);

    if !decompress {
        return pipe_source_to_destinations(
            source,
            destinations,
            options,
            on_progress,
            cancel_signal,
        );
    }

    info!(
        "Decompressing {:?} to scratch space before flashing",
        metadata.name.as_deref().unwrap_or("<unnamed>"),
    );

    let mut scratch = tempfile::Builder::new()
        .prefix(DECOMPRESSED_IMAGE_PREFIX)
        .tempfile()?;

    {
        let destinations = destinations.len();
        let reporter = ProgressReporter::new(
            Box::new(|e: ProgressEvent| {
                if let Some(on_progress) = on_progress {
                    let percentage = metadata
                        .size
                        .filter(|size| *size > 0 && e.bytes <= *size)
                        .map(|size| e.bytes as f64 / size as f64 * 100.0);

                    on_progress(FlashProgress {
                        step: TransferStep::Decompressing,
                        sparse: false,
                        active: destinations,
                        failed: 0,
                        position: e.position,
                        bytes: e.bytes,
                        speed: e.speed,
                        average_speed: e.average_speed,
                        percentage,
                        eta_secs: None,
                    });
                }
            }),
            options.progress_interval,
        );

        let mut stream = source.create_read_stream(ReadStreamOptions::default())?;
        let mut buf = vec![0u8; options.chunk_size];
        let mut position = 0u64;

        loop {
            check_cancel(cancel_signal)?;

            let n = stream.read(&mut buf)?;
            if n == 0 {
                break;
            }

            scratch.as_file_mut().write_all(&buf[..n])?;
            position += n as u64;
            reporter.update(position, n as u64);
        }

        scratch.as_file_mut().flush()?;
        reporter.flush();
    }

    if let Err(e) = source.close() {
        warn!("Failed to close source: {e}");
    }

    let decompressed = LocalFile::new(scratch.path(), false);
    pipe_source_to_destinations(
        &decompressed,
        destinations,
        options,
        on_progress,
        cancel_signal,
    )
}
