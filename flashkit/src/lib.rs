// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! A streaming engine for writing disk images to one or more block
//! destinations, with direct-I/O-compatible buffer management, sparse
//! transfers that skip unallocated regions, and checksum verification of
//! every destination after the copy.
//!
//! Concrete image containers (gzip, xz, zip, dmg, remote blobs) and device
//! discovery live outside this crate. They plug in by implementing the
//! [`source::SourceDestination`] capability contract.

pub mod align;
pub mod block;
pub mod buffer;
pub mod checksum;
pub mod file;
pub mod multi;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod source;
pub mod sparse;
pub mod verify;

/// Default size of one transfer chunk.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Alignment assumed for block devices that don't report a sector size.
pub const DEFAULT_ALIGNMENT: usize = 512;

/// Largest alignment a destination may request.
pub const MAX_ALIGNMENT: usize = 4 * 1024 * 1024;
