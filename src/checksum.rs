//! This module provides a `Checksum` trait for verifying the integrity of
//! on-disk metadata records.

use crate::size::StaticSize;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::error::Error;
use std::fmt;
use std::hash::Hasher;
use std::iter::once;
use twox_hash::XxHash64;

/// A checksum sealing an on-disk record.
pub trait Checksum:
    Serialize + DeserializeOwned + StaticSize + Copy + Eq + Send + Sync + fmt::Debug + 'static
{
    /// Computes the checksum of `data`.
    fn of(data: &[u8]) -> Self {
        Self::of_buffer(once(data))
    }

    /// Computes the checksum of a buffer made of several slices.
    fn of_buffer<I: IntoIterator<Item = T>, T: AsRef<[u8]>>(data: I) -> Self;

    /// Verifies the contents of the given buffer which consists of multiple
    /// `u8` slices.
    fn verify_buffer<I: IntoIterator<Item = T>, T: AsRef<[u8]>>(
        &self,
        data: I,
    ) -> Result<(), ChecksumError> {
        if *self == Self::of_buffer(data) {
            Ok(())
        } else {
            Err(ChecksumError)
        }
    }

    /// Verifies the contents of the given buffer.
    fn verify(&self, data: &[u8]) -> Result<(), ChecksumError> {
        self.verify_buffer(once(data))
    }
}

/// This is the error that will be returned when a `Checksum` does not match.
#[derive(Debug)]
pub struct ChecksumError;

impl fmt::Display for ChecksumError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Failed to verify the integrity")
    }
}

impl Error for ChecksumError {}

/// 64 bit `xxHash` digest, seeded with zero.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct XxHash(u64);

impl XxHash {
    /// Returns the raw digest.
    pub fn digest(self) -> u64 {
        self.0
    }

    /// Wraps a raw digest, e.g. one read back from disk.
    pub fn from_digest(digest: u64) -> Self {
        XxHash(digest)
    }
}

impl StaticSize for XxHash {
    fn size() -> usize {
        u64::size()
    }
}

impl Checksum for XxHash {
    fn of_buffer<I: IntoIterator<Item = T>, T: AsRef<[u8]>>(data: I) -> Self {
        let mut hasher = XxHash64::with_seed(0);
        for x in data {
            hasher.write(x.as_ref());
        }
        XxHash(hasher.finish())
    }
}
