// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;

use ring::digest::Context;
use xxhash_rust::xxh3::Xxh3;

/// Seed for [`ChecksumType::XxHash3`] digests ("ETCH").
pub const XXHASH_SEED: u64 = 0x45544348;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumType {
    Crc32,
    Sha1,
    Sha256,
    XxHash3,
}

impl fmt::Display for ChecksumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Crc32 => "crc32",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::XxHash3 => "xxhash3",
        };

        write!(f, "{name}")
    }
}

/// Streaming hasher producing the lowercase hex digests stored in block
/// checksum lists and compared during verification.
pub enum Hasher {
    Crc32(crc32fast::Hasher),
    Digest(Context),
    XxHash3(Box<Xxh3>),
}

impl Hasher {
    pub fn new(checksum_type: ChecksumType) -> Self {
        match checksum_type {
            ChecksumType::Crc32 => Self::Crc32(crc32fast::Hasher::new()),
            ChecksumType::Sha1 => {
                Self::Digest(Context::new(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY))
            }
            ChecksumType::Sha256 => Self::Digest(Context::new(&ring::digest::SHA256)),
            ChecksumType::XxHash3 => Self::XxHash3(Box::new(Xxh3::with_seed(XXHASH_SEED))),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Crc32(h) => h.update(data),
            Self::Digest(c) => c.update(data),
            Self::XxHash3(h) => h.update(data),
        }
    }

    pub fn finalize_hex(self) -> String {
        match self {
            Self::Crc32(h) => format!("{:08x}", h.finalize()),
            Self::Digest(c) => hex::encode(c.finish()),
            Self::XxHash3(h) => format!("{:016x}", h.digest()),
        }
    }
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Crc32(_) => "Crc32",
            Self::Digest(_) => "Digest",
            Self::XxHash3(_) => "XxHash3",
        };

        f.debug_tuple(name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digests() {
        let mut hasher = Hasher::new(ChecksumType::Crc32);
        hasher.update(b"foobar");
        assert_eq!(hasher.finalize_hex(), "9ef61f95");

        let mut hasher = Hasher::new(ChecksumType::Sha1);
        hasher.update(b"foo");
        hasher.update(b"bar");
        assert_eq!(
            hasher.finalize_hex(),
            "8843d7f92416211de9ebb963ff4ce28125932878",
        );

        let mut hasher = Hasher::new(ChecksumType::Sha256);
        hasher.update(b"foobar");
        assert_eq!(
            hasher.finalize_hex(),
            "c3ab8ff13720e8ad9047dd39466b3c8974e592c2fa383d4a3960714caef0c4f2",
        );
    }

    #[test]
    fn split_updates_match() {
        for checksum_type in [
            ChecksumType::Crc32,
            ChecksumType::Sha1,
            ChecksumType::Sha256,
            ChecksumType::XxHash3,
        ] {
            let mut whole = Hasher::new(checksum_type);
            whole.update(b"foobarbaz");

            let mut split = Hasher::new(checksum_type);
            split.update(b"foo");
            split.update(b"bar");
            split.update(b"baz");

            assert_eq!(whole.finalize_hex(), split.finalize_hex());
        }
    }
}
