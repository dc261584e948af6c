// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Fan-out of one source stream to many destinations. Every chunk is
//! broadcast to one writer thread per destination over a bounded channel,
//! with each consumer holding its own shared lock on the chunk's ring
//! buffer. A destination that fails is excluded from the rest of the
//! operation without disturbing its siblings; the flash as a whole only
//! stops early once every destination has failed.

use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc, Arc, Mutex,
    },
    thread,
};

use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    block::{self, check_cancel, BlockWriteStream, Chunk, ChunkStream},
    checksum::Hasher,
    source::{self, SourceDestination},
    sparse::{self, SparseChunk, SparseChunkStream, SparseWriteStream},
    verify::{self, ByteProgress, Verifier},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("At least one destination is required")]
    NoDestinations,
    #[error("First {withheld} bytes were withheld and never written")]
    IncompleteFirstBytes {
        withheld: u64,
        #[source]
        source: Box<Error>,
    },
    #[error("Source/destination error")]
    Source(#[from] source::Error),
    #[error("Block stream error")]
    Block(#[from] block::Error),
    #[error("Sparse stream error")]
    Sparse(#[from] sparse::Error),
    #[error("Verification error")]
    Verify(#[from] verify::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A write that failed with leading bytes still withheld leaves the
/// destination without a valid partition table. Make that explicit.
fn wrap_withheld(withheld: u64, error: Error) -> Error {
    if withheld > 0 {
        Error::IncompleteFirstBytes {
            withheld,
            source: Box::new(error),
        }
    } else {
        error
    }
}

#[derive(Debug, Default)]
struct State {
    errored: BTreeSet<usize>,
    failures: BTreeMap<usize, Error>,
}

pub struct MultiDestination {
    destinations: Vec<Arc<dyn SourceDestination>>,
    state: Mutex<State>,
}

impl MultiDestination {
    pub fn new(destinations: Vec<Arc<dyn SourceDestination>>) -> Result<Self> {
        if destinations.is_empty() {
            return Err(Error::NoDestinations);
        }

        Ok(Self {
            destinations,
            state: Mutex::new(State::default()),
        })
    }

    pub fn destinations(&self) -> &[Arc<dyn SourceDestination>] {
        &self.destinations
    }

    /// Indices of the destinations that have not failed. A destination that
    /// fails stays excluded for the rest of the flash.
    fn active(&self) -> Vec<usize> {
        let state = self.state.lock().unwrap();

        (0..self.destinations.len())
            .filter(|i| !state.errored.contains(i))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.active().len()
    }

    fn mark_failed(&self, index: usize, error: Error) {
        warn!("Destination {index} failed: {error}");

        let mut state = self.state.lock().unwrap();
        state.errored.insert(index);
        state.failures.insert(index, error);
    }

    pub fn failure_count(&self) -> usize {
        self.state.lock().unwrap().failures.len()
    }

    /// Per-destination failures recorded so far, including verification
    /// mismatches.
    pub fn take_failures(&self) -> BTreeMap<usize, Error> {
        std::mem::take(&mut self.state.lock().unwrap().failures)
    }

    /// Strictest direct-I/O alignment across the remaining destinations.
    pub fn alignment(&self) -> Option<usize> {
        self.active()
            .into_iter()
            .filter_map(|i| self.destinations[i].alignment())
            .max()
    }

    pub fn can_write(&self) -> bool {
        let active = self.active();
        !active.is_empty() && active.iter().all(|&i| self.destinations[i].can_write())
    }

    pub fn can_create_sparse_write_stream(&self) -> bool {
        let active = self.active();
        !active.is_empty()
            && active
                .iter()
                .all(|&i| self.destinations[i].can_create_sparse_write_stream())
    }

    /// Open every destination, demoting individual failures to recorded
    /// per-destination errors.
    pub fn open(&self) {
        for (index, destination) in self.destinations.iter().enumerate() {
            if let Err(e) = destination.open() {
                self.mark_failed(index, e.into());
            }
        }
    }

    pub fn close(&self) {
        for (index, destination) in self.destinations.iter().enumerate() {
            if let Err(e) = destination.close() {
                warn!("Failed to close destination {index}: {e}");
            }
        }
    }

    /// Broadcast a regular chunk stream to all remaining destinations. An
    /// optional hasher digests the stream concurrently with the writers for
    /// later verification. Returns the number of bytes written to the most
    /// advanced successful destination.
    pub fn write_chunks(
        &self,
        stream: &mut dyn ChunkStream,
        mut hasher: Option<&mut Hasher>,
        progress: ByteProgress,
        cancel_signal: &AtomicBool,
    ) -> Result<u64> {
        let active = self.active();
        if active.is_empty() {
            return Ok(0);
        }

        let positions: Vec<AtomicU64> = active.iter().map(|_| AtomicU64::new(0)).collect();

        thread::scope(|scope| {
            let mut senders = Vec::with_capacity(active.len());
            let mut handles = Vec::with_capacity(active.len());

            for (slot, &index) in active.iter().enumerate() {
                let (tx, rx) = mpsc::sync_channel::<Chunk>(1);
                let destination = self.destinations[index].clone();
                let position = &positions[slot];

                handles.push((
                    index,
                    scope.spawn(move || -> Result<u64> {
                        let mut write = BlockWriteStream::new(
                            destination.as_ref(),
                            destination.first_bytes_to_keep() > 0,
                        );

                        let mut error = None;
                        while let Ok(chunk) = rx.recv() {
                            if let Err(e) = write.write_chunk(&chunk) {
                                error = Some(Error::from(e));
                                break;
                            }

                            position
                                .store(chunk.position() + chunk.len() as u64, Ordering::SeqCst);
                        }

                        // Dropping the receiver releases any queued buffer
                        // locks and lets the producer notice the failure.
                        drop(rx);

                        match error {
                            Some(e) => Err(wrap_withheld(write.delayed_bytes(), e)),
                            None => write
                                .finish()
                                .map_err(|e| wrap_withheld(write.delayed_bytes(), e.into())),
                        }
                    }),
                ));

                senders.push(Some(tx));
            }

            let hasher_worker = hasher.take().map(|hasher| {
                let (tx, rx) = mpsc::sync_channel::<Chunk>(1);
                let handle = scope.spawn(move || {
                    for chunk in rx {
                        hasher.update(&chunk);
                    }
                });

                (tx, handle)
            });

            let mut producer_error = None;

            loop {
                if let Err(e) = check_cancel(cancel_signal) {
                    producer_error = Some(Error::Io(e));
                    break;
                }

                let chunk = match stream.next_chunk() {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(e) => {
                        producer_error = Some(e.into());
                        break;
                    }
                };

                let mut alive = 0;
                for sender in &mut senders {
                    if let Some(tx) = sender {
                        if tx.send(chunk.duplicate()).is_ok() {
                            alive += 1;
                        } else {
                            // The worker bailed out. Its failure is recorded
                            // at join time.
                            *sender = None;
                        }
                    }
                }

                if let Some((tx, _)) = &hasher_worker {
                    let _ = tx.send(chunk.duplicate());
                }

                let len = chunk.len() as u64;
                drop(chunk);

                if alive == 0 {
                    debug!("All destinations have failed; stopping the source");
                    break;
                }

                let least = senders
                    .iter()
                    .zip(&positions)
                    .filter(|(tx, _)| tx.is_some())
                    .map(|(_, p)| p.load(Ordering::SeqCst))
                    .min()
                    .unwrap_or(0);
                progress(least, len);
            }

            drop(senders);
            if let Some((tx, handle)) = hasher_worker {
                drop(tx);
                handle.join().unwrap();
            }

            let mut bytes_written = 0;
            for (index, handle) in handles {
                match handle.join().unwrap() {
                    Ok(bytes) => bytes_written = bytes_written.max(bytes),
                    Err(e) => self.mark_failed(index, e),
                }
            }

            match producer_error {
                Some(e) => Err(e),
                None => Ok(bytes_written),
            }
        })
    }

    /// Broadcast a sparse chunk stream to all remaining destinations. Mirrors
    /// [`Self::write_chunks`], but with per-destination sparse write stages
    /// that honor `first_bytes_to_keep`.
    pub fn write_sparse(
        &self,
        stream: &mut dyn SparseChunkStream,
        alignment: usize,
        progress: ByteProgress,
        cancel_signal: &AtomicBool,
    ) -> Result<u64> {
        let active = self.active();
        if active.is_empty() {
            return Ok(0);
        }

        let positions: Vec<AtomicU64> = active.iter().map(|_| AtomicU64::new(0)).collect();

        thread::scope(|scope| {
            let mut senders = Vec::with_capacity(active.len());
            let mut handles = Vec::with_capacity(active.len());

            for (slot, &index) in active.iter().enumerate() {
                let (tx, rx) = mpsc::sync_channel::<SparseChunk>(1);
                let destination = self.destinations[index].clone();
                let position = &positions[slot];

                handles.push((
                    index,
                    scope.spawn(move || -> Result<u64> {
                        let mut write = SparseWriteStream::new(
                            destination.as_ref(),
                            destination.first_bytes_to_keep(),
                            alignment,
                        );

                        let mut error = None;
                        while let Ok(chunk) = rx.recv() {
                            if let Err(e) = write.write_chunk(&chunk) {
                                error = Some(Error::from(e));
                                break;
                            }

                            position
                                .store(chunk.position() + chunk.len() as u64, Ordering::SeqCst);
                        }

                        drop(rx);

                        match error {
                            Some(e) => Err(wrap_withheld(write.withheld_bytes(), e)),
                            None => write
                                .finish()
                                .map_err(|e| wrap_withheld(write.withheld_bytes(), e.into())),
                        }
                    }),
                ));

                senders.push(Some(tx));
            }

            let mut producer_error = None;

            loop {
                if let Err(e) = check_cancel(cancel_signal) {
                    producer_error = Some(Error::Io(e));
                    break;
                }

                let chunk = match stream.next_chunk() {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(e) => {
                        producer_error = Some(e.into());
                        break;
                    }
                };

                let mut alive = 0;
                for sender in &mut senders {
                    if let Some(tx) = sender {
                        if tx.send(chunk.duplicate()).is_ok() {
                            alive += 1;
                        } else {
                            *sender = None;
                        }
                    }
                }

                let len = chunk.len() as u64;
                drop(chunk);

                if alive == 0 {
                    debug!("All destinations have failed; stopping the source");
                    break;
                }

                let least = senders
                    .iter()
                    .zip(&positions)
                    .filter(|(tx, _)| tx.is_some())
                    .map(|(_, p)| p.load(Ordering::SeqCst))
                    .min()
                    .unwrap_or(0);
                progress(least, len);
            }

            drop(senders);

            let mut bytes_written = 0;
            for (index, handle) in handles {
                match handle.join().unwrap() {
                    Ok(bytes) => bytes_written = bytes_written.max(bytes),
                    Err(e) => self.mark_failed(index, e),
                }
            }

            match producer_error {
                Some(e) => Err(e),
                None => Ok(bytes_written),
            }
        })
    }

    /// Run the verifier against every remaining destination in parallel.
    /// Mismatches are recorded per destination, but unlike write failures,
    /// they do not exclude the destination from anything that follows.
    pub fn verify(
        &self,
        verifier: &Verifier,
        alignment: usize,
        progress: ByteProgress,
        cancel_signal: &AtomicBool,
    ) {
        let active = self.active();
        let positions: Vec<AtomicU64> = active.iter().map(|_| AtomicU64::new(0)).collect();

        active.par_iter().enumerate().for_each(|(slot, &index)| {
            let destination = &self.destinations[index];

            let result = verifier.run(
                destination.as_ref(),
                alignment,
                &|position, delta| {
                    positions[slot].store(position, Ordering::SeqCst);

                    let least = positions
                        .iter()
                        .map(|p| p.load(Ordering::SeqCst))
                        .min()
                        .unwrap_or(0);
                    progress(least, delta);
                },
                cancel_signal,
            );

            if let Err(e) = result {
                warn!("Destination {index} failed verification: {e}");
                self.state
                    .lock()
                    .unwrap()
                    .failures
                    .insert(index, e.into());
            }
        });
    }
}

impl std::fmt::Debug for MultiDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiDestination")
            .field("destinations", &self.destinations.len())
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;

    use crate::{
        block::{BlockReadStream, BlockReadStreamOptions},
        checksum::ChecksumType,
        file::LocalFile,
        source::{Metadata, Result as SourceResult},
        sparse::{BlockRange, BlocksWithChecksum, SparseReadStream, SparseStreamOptions},
    };

    use super::*;

    fn temp_image(data: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Fails every write at or past a given offset.
    struct FailingDisk {
        inner: LocalFile,
        fail_at: u64,
        first_bytes_to_keep: u64,
    }

    impl SourceDestination for FailingDisk {
        fn open(&self) -> SourceResult<()> {
            self.inner.open()
        }

        fn close(&self) -> SourceResult<()> {
            self.inner.close()
        }

        fn metadata(&self) -> SourceResult<Metadata> {
            self.inner.metadata()
        }

        fn can_write(&self) -> bool {
            true
        }

        fn first_bytes_to_keep(&self) -> u64 {
            self.first_bytes_to_keep
        }

        fn write_at(&self, buf: &[u8], offset: u64) -> SourceResult<usize> {
            if offset + buf.len() as u64 > self.fail_at {
                return Err(source::Error::Io(io::Error::other("disk on fire")));
            }

            self.inner.write_at(buf, offset)
        }
    }

    fn new_outputs(count: usize, size: usize) -> Vec<tempfile::NamedTempFile> {
        (0..count).map(|_| temp_image(&vec![0u8; size])).collect()
    }

    #[test]
    fn fan_out_reaches_every_destination() {
        let data = pattern(4096);
        let image = temp_image(&data);
        let source = LocalFile::new(image.path(), false);
        source.open().unwrap();

        let outputs = new_outputs(3, 4096);
        let multi = MultiDestination::new(
            outputs
                .iter()
                .map(|f| Arc::new(LocalFile::new(f.path(), true)) as Arc<dyn SourceDestination>)
                .collect(),
        )
        .unwrap();
        multi.open();
        assert_eq!(multi.active_count(), 3);

        let mut stream = BlockReadStream::new(
            &source,
            BlockReadStreamOptions {
                chunk_size: 512,
                alignment: 512,
                ..Default::default()
            },
        );

        let mut hasher = Hasher::new(ChecksumType::XxHash3);
        let cancel = AtomicBool::new(false);
        let bytes = multi
            .write_chunks(&mut stream, Some(&mut hasher), &|_, _| {}, &cancel)
            .unwrap();

        assert_eq!(bytes, 4096);
        for output in &outputs {
            assert_eq!(std::fs::read(output.path()).unwrap(), data);
        }

        let mut expected = Hasher::new(ChecksumType::XxHash3);
        expected.update(&data);
        assert_eq!(hasher.finalize_hex(), expected.finalize_hex());

        multi.close();
        assert!(multi.take_failures().is_empty());
    }

    #[test]
    fn one_failure_does_not_abort_siblings() {
        let data = pattern(4096);
        let image = temp_image(&data);
        let source = LocalFile::new(image.path(), false);
        source.open().unwrap();

        let outputs = new_outputs(3, 4096);
        let mut destinations: Vec<Arc<dyn SourceDestination>> = outputs
            .iter()
            .map(|f| Arc::new(LocalFile::new(f.path(), true)) as Arc<dyn SourceDestination>)
            .collect();
        destinations[1] = Arc::new(FailingDisk {
            inner: LocalFile::new(outputs[1].path(), true),
            fail_at: 1024,
            first_bytes_to_keep: 0,
        });

        let multi = MultiDestination::new(destinations).unwrap();
        multi.open();

        let mut stream = BlockReadStream::new(
            &source,
            BlockReadStreamOptions {
                chunk_size: 512,
                alignment: 512,
                ..Default::default()
            },
        );

        let cancel = AtomicBool::new(false);
        let bytes = multi
            .write_chunks(&mut stream, None, &|_, _| {}, &cancel)
            .unwrap();

        assert_eq!(bytes, 4096);
        assert_eq!(multi.active_count(), 2);
        assert_eq!(std::fs::read(outputs[0].path()).unwrap(), data);
        assert_eq!(std::fs::read(outputs[2].path()).unwrap(), data);

        let failures = multi.take_failures();
        assert_eq!(failures.keys().collect::<Vec<_>>(), [&1]);
    }

    #[test]
    fn all_failed_stops_the_producer() {
        let data = pattern(1024 * 1024);
        let image = temp_image(&data);
        let source = LocalFile::new(image.path(), false);
        source.open().unwrap();

        let outputs = new_outputs(2, 1024 * 1024);
        let destinations: Vec<Arc<dyn SourceDestination>> = outputs
            .iter()
            .map(|f| {
                Arc::new(FailingDisk {
                    inner: LocalFile::new(f.path(), true),
                    fail_at: 2048,
                    first_bytes_to_keep: 0,
                }) as Arc<dyn SourceDestination>
            })
            .collect();

        let multi = MultiDestination::new(destinations).unwrap();
        multi.open();

        let mut stream = BlockReadStream::new(
            &source,
            BlockReadStreamOptions {
                chunk_size: 512,
                alignment: 512,
                ..Default::default()
            },
        );

        let cancel = AtomicBool::new(false);
        multi
            .write_chunks(&mut stream, None, &|_, _| {}, &cancel)
            .unwrap();

        assert_eq!(multi.active_count(), 0);
        assert_eq!(multi.take_failures().len(), 2);
        // The source was abandoned early.
        assert!(stream.position() < 1024 * 1024);
    }

    #[test]
    fn sparse_fan_out_and_withheld_failure() {
        let data = pattern(4096);
        let image = temp_image(&data);
        let source = LocalFile::new(image.path(), false);
        source.open().unwrap();

        let blocks = vec![BlocksWithChecksum {
            checksum_type: None,
            checksum: None,
            blocks: vec![
                BlockRange {
                    offset: 0,
                    length: 1024,
                },
                BlockRange {
                    offset: 2048,
                    length: 1024,
                },
            ],
        }];

        let outputs = new_outputs(2, 4096);
        let mut destinations: Vec<Arc<dyn SourceDestination>> = vec![Arc::new(LocalFile::new(
            outputs[0].path(),
            true,
        ))];
        // Fails before finish(), so its withheld leading bytes are lost.
        destinations.push(Arc::new(FailingDisk {
            inner: LocalFile::new(outputs[1].path(), true),
            fail_at: 2560,
            first_bytes_to_keep: 512,
        }));

        let multi = MultiDestination::new(destinations).unwrap();
        multi.open();

        let mut stream = SparseReadStream::new(
            &source,
            blocks,
            SparseStreamOptions {
                chunk_size: 512,
                alignment: 512,
                ..Default::default()
            },
        )
        .unwrap();

        let cancel = AtomicBool::new(false);
        let bytes = multi
            .write_sparse(&mut stream, 512, &|_, _| {}, &cancel)
            .unwrap();

        assert_eq!(bytes, 2048);

        let good = std::fs::read(outputs[0].path()).unwrap();
        assert_eq!(good[..1024], data[..1024]);
        assert_eq!(good[2048..3072], data[2048..3072]);
        assert_eq!(good[1024..2048], vec![0u8; 1024]);

        let failures = multi.take_failures();
        assert_matches!(
            failures.get(&1),
            Some(Error::IncompleteFirstBytes { withheld: 512, .. })
        );
    }

    #[test]
    fn withheld_failure_during_finish_is_reported() {
        /// Accepts streamed writes but rejects the withheld leading region,
        /// so the only failing write happens inside `finish()`.
        struct LeadingWriteFails {
            inner: LocalFile,
            first_bytes_to_keep: u64,
        }

        impl SourceDestination for LeadingWriteFails {
            fn open(&self) -> SourceResult<()> {
                self.inner.open()
            }

            fn close(&self) -> SourceResult<()> {
                self.inner.close()
            }

            fn metadata(&self) -> SourceResult<Metadata> {
                self.inner.metadata()
            }

            fn can_write(&self) -> bool {
                true
            }

            fn first_bytes_to_keep(&self) -> u64 {
                self.first_bytes_to_keep
            }

            fn write_at(&self, buf: &[u8], offset: u64) -> SourceResult<usize> {
                if offset < self.first_bytes_to_keep {
                    return Err(source::Error::Io(io::Error::other(
                        "leading region rejected",
                    )));
                }

                self.inner.write_at(buf, offset)
            }
        }

        let data = pattern(4096);
        let image = temp_image(&data);
        let source = LocalFile::new(image.path(), false);
        source.open().unwrap();

        let blocks = vec![BlocksWithChecksum {
            checksum_type: None,
            checksum: None,
            blocks: vec![
                BlockRange {
                    offset: 0,
                    length: 1024,
                },
                BlockRange {
                    offset: 2048,
                    length: 1024,
                },
            ],
        }];

        let outputs = new_outputs(1, 4096);
        let multi = MultiDestination::new(vec![Arc::new(LeadingWriteFails {
            inner: LocalFile::new(outputs[0].path(), true),
            first_bytes_to_keep: 512,
        })])
        .unwrap();
        multi.open();

        let mut stream = SparseReadStream::new(
            &source,
            blocks,
            SparseStreamOptions {
                chunk_size: 512,
                alignment: 512,
                ..Default::default()
            },
        )
        .unwrap();

        let cancel = AtomicBool::new(false);
        let bytes = multi
            .write_sparse(&mut stream, 512, &|_, _| {}, &cancel)
            .unwrap();

        // Streaming itself succeeded everywhere; only the flush of the
        // withheld leading bytes failed.
        assert_eq!(bytes, 0);

        let failures = multi.take_failures();
        assert_matches!(
            failures.get(&0),
            Some(Error::IncompleteFirstBytes { withheld: 512, .. })
        );
    }

    #[test]
    fn verify_records_mismatch_without_deactivating() {
        let data = pattern(2048);
        let outputs = new_outputs(2, 2048);
        std::fs::write(outputs[0].path(), &data).unwrap();

        let mut corrupt = data.clone();
        corrupt[100] ^= 0xff;
        std::fs::write(outputs[1].path(), &corrupt).unwrap();

        let multi = MultiDestination::new(
            outputs
                .iter()
                .map(|f| Arc::new(LocalFile::new(f.path(), true)) as Arc<dyn SourceDestination>)
                .collect(),
        )
        .unwrap();
        multi.open();

        let mut hasher = Hasher::new(ChecksumType::XxHash3);
        hasher.update(&data);
        let verifier =
            Verifier::for_checksum(ChecksumType::XxHash3, hasher.finalize_hex(), 2048);

        let cancel = AtomicBool::new(false);
        multi.verify(&verifier, 512, &|_, _| {}, &cancel);

        let failures = multi.take_failures();
        assert_eq!(failures.keys().collect::<Vec<_>>(), [&1]);
        assert_matches!(
            failures.get(&1),
            Some(Error::Verify(verify::Error::ChecksumMismatch { .. }))
        );
        // Verification mismatches do not exclude the destination.
        assert_eq!(multi.active_count(), 2);
    }

    #[test]
    fn requires_at_least_one_destination() {
        assert_matches!(
            MultiDestination::new(vec![]),
            Err(Error::NoDestinations)
        );
    }
}
