// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    alloc::{self, Layout},
    fmt,
    ops::{Deref, DerefMut},
    ptr::NonNull,
    sync::{Arc, Condvar, Mutex},
};

use thiserror::Error;

use crate::align;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid buffer geometry: size {size}, alignment {alignment}")]
    InvalidLayout { size: usize, alignment: usize },
    #[error("Failed to allocate {size} bytes aligned to {alignment}")]
    Allocation { size: usize, alignment: usize },
}

type Result<T> = std::result::Result<T, Error>;

/// A heap allocation whose address and length are both multiples of the
/// required direct-I/O alignment. The length is rounded up to the next
/// aligned boundary and the memory is zero-initialized.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    alignment: usize,
}

// The buffer exclusively owns its allocation.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    pub fn new(size: usize, alignment: usize) -> Result<Self> {
        if size == 0 || alignment == 0 || !alignment.is_power_of_two() {
            return Err(Error::InvalidLayout { size, alignment });
        }

        let len = align::align_up(size, alignment)
            .ok_or(Error::InvalidLayout { size, alignment })?;
        let layout = Layout::from_size_align(len, alignment)
            .map_err(|_| Error::InvalidLayout { size, alignment })?;

        // SAFETY: The layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(Error::Allocation { size, alignment })?;

        Ok(Self {
            ptr,
            len,
            alignment,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: The allocation is valid for `len` bytes and lives as long
        // as `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: Same as in `deref`, plus we have exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len)
            .field("alignment", &self.alignment)
            .finish()
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: The layout parameters are the ones used for the allocation.
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.len, self.alignment);
            alloc::dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

#[derive(Debug, Default)]
struct LockCounts {
    readers: usize,
    writer: bool,
}

/// An [`AlignedBuffer`] guarded by an explicit reader/writer lock. The
/// producer refilling the buffer holds the exclusive guard; any number of
/// concurrent consumers (hashers, destination writers) hold shared guards.
///
/// Unlike [`std::sync::RwLock`] guards, [`ReadGuard`] and [`WriteGuard`] own
/// an `Arc` to the buffer and may be sent to another thread, so a producer
/// can acquire a shared guard on behalf of each consumer before handing a
/// filled buffer downstream. The buffer cannot be refilled until every guard
/// has been dropped.
pub struct PoolBuffer {
    counts: Mutex<LockCounts>,
    released: Condvar,
    data: std::cell::UnsafeCell<AlignedBuffer>,
    len: usize,
    alignment: usize,
}

// SAFETY: All access to `data` goes through the guards, which enforce the
// usual single-writer/multiple-reader discipline via `counts`.
unsafe impl Send for PoolBuffer {}
unsafe impl Sync for PoolBuffer {}

impl PoolBuffer {
    pub fn new(size: usize, alignment: usize) -> Result<Arc<Self>> {
        let data = AlignedBuffer::new(size, alignment)?;
        let len = data.len();

        Ok(Arc::new(Self {
            counts: Mutex::new(LockCounts::default()),
            released: Condvar::new(),
            data: std::cell::UnsafeCell::new(data),
            len,
            alignment,
        }))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Acquire the exclusive guard, blocking until all shared guards and any
    /// prior exclusive guard have been dropped.
    pub fn lock(self: &Arc<Self>) -> WriteGuard {
        let mut counts = self.counts.lock().unwrap();
        while counts.writer || counts.readers > 0 {
            counts = self.released.wait(counts).unwrap();
        }
        counts.writer = true;

        WriteGuard {
            buffer: self.clone(),
        }
    }

    /// Acquire a shared guard, blocking while the exclusive guard is held.
    /// Multiple shared guards may be held at once.
    pub fn rlock(self: &Arc<Self>) -> ReadGuard {
        let mut counts = self.counts.lock().unwrap();
        while counts.writer {
            counts = self.released.wait(counts).unwrap();
        }
        counts.readers += 1;

        ReadGuard {
            buffer: self.clone(),
        }
    }
}

impl fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("len", &self.len)
            .field("alignment", &self.alignment)
            .finish_non_exhaustive()
    }
}

/// RAII exclusive guard for refilling a [`PoolBuffer`].
pub struct WriteGuard {
    buffer: Arc<PoolBuffer>,
}

impl Deref for WriteGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: The exclusive guard is held.
        unsafe { &*self.buffer.data.get() }
    }
}

impl DerefMut for WriteGuard {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: The exclusive guard is held.
        unsafe { &mut *self.buffer.data.get() }
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        let mut counts = self.buffer.counts.lock().unwrap();
        counts.writer = false;
        drop(counts);

        self.buffer.released.notify_all();
    }
}

/// RAII shared guard for consuming a filled [`PoolBuffer`].
pub struct ReadGuard {
    buffer: Arc<PoolBuffer>,
}

impl ReadGuard {
    pub fn buffer(&self) -> &Arc<PoolBuffer> {
        &self.buffer
    }
}

impl Deref for ReadGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: A shared guard is held, so no exclusive guard exists.
        unsafe { &*self.buffer.data.get() }
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        let mut counts = self.buffer.counts.lock().unwrap();
        counts.readers -= 1;
        drop(counts);

        self.buffer.released.notify_all();
    }
}

/// A fixed ring of lazily allocated [`PoolBuffer`]s, cycled round-robin.
/// Reusing a small ring bounds memory while the per-buffer lock serializes
/// each refill against the consumers of the previous chunk that used the
/// same slot.
pub struct BufferPool {
    buffer_size: usize,
    alignment: usize,
    slots: Vec<Option<Arc<PoolBuffer>>>,
    index: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, alignment: usize, num_buffers: usize) -> Self {
        Self {
            buffer_size,
            alignment,
            slots: vec![None; num_buffers.max(2)],
            index: 0,
        }
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Return the buffer at the current ring index and advance the index.
    /// The first access to a slot allocates its buffer.
    pub fn next(&mut self) -> Result<Arc<PoolBuffer>> {
        let slot = &mut self.slots[self.index];
        if slot.is_none() {
            *slot = Some(PoolBuffer::new(self.buffer_size, self.alignment)?);
        }

        let buffer = slot.as_ref().unwrap().clone();
        self.index = (self.index + 1) % self.slots.len();

        Ok(buffer)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("alignment", &self.alignment)
            .field("num_buffers", &self.slots.len())
            .field("index", &self.index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::mpsc,
        thread,
        time::Duration,
    };

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn aligned_allocation() {
        let buffer = AlignedBuffer::new(1000, 512).unwrap();
        assert_eq!(buffer.len(), 1024);
        assert_eq!(buffer.alignment(), 512);
        assert_eq!(buffer.as_ptr() as usize % 512, 0);
        assert!(buffer.iter().all(|b| *b == 0));

        assert_matches!(
            AlignedBuffer::new(0, 512),
            Err(Error::InvalidLayout { .. })
        );
        assert_matches!(
            AlignedBuffer::new(512, 3),
            Err(Error::InvalidLayout { .. })
        );
    }

    #[test]
    fn pool_cycles_and_caches() {
        let mut pool = BufferPool::new(4096, 512, 2);

        let a = pool.next().unwrap();
        let b = pool.next().unwrap();
        let a2 = pool.next().unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &a2));
    }

    #[test]
    fn shared_guards_do_not_block_each_other() {
        let buffer = PoolBuffer::new(512, 512).unwrap();

        let r1 = buffer.rlock();
        let r2 = buffer.rlock();
        assert_eq!(r1.len(), r2.len());
    }

    #[test]
    fn exclusive_guard_waits_for_readers() {
        let buffer = PoolBuffer::new(512, 512).unwrap();
        let (tx, rx) = mpsc::channel();

        let r1 = buffer.rlock();
        let r2 = buffer.rlock();

        let handle = thread::spawn({
            let buffer = buffer.clone();
            move || {
                let mut guard = buffer.lock();
                guard[0] = 0xaa;
                tx.send(()).unwrap();
            }
        });

        // The writer must not get through while both readers are held.
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(100)),
            Err(mpsc::RecvTimeoutError::Timeout)
        );

        drop(r1);
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(100)),
            Err(mpsc::RecvTimeoutError::Timeout)
        );

        drop(r2);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();

        assert_eq!(buffer.rlock()[0], 0xaa);
    }

    #[test]
    fn guards_can_move_between_threads() {
        let buffer = PoolBuffer::new(512, 512).unwrap();

        {
            let mut guard = buffer.lock();
            guard[..4].copy_from_slice(b"data");
        }

        let guard = buffer.rlock();
        let handle = thread::spawn(move || guard[..4].to_vec());
        assert_eq!(handle.join().unwrap(), b"data");

        // All guards are gone, so this must not deadlock.
        let _w = buffer.lock();
    }
}
