//! This module provides an abstraction over the storage extents ("backends")
//! a mirror is built on top of.
//!
//! A backend is a flat, byte-addressed extent with a fixed sector size. The
//! mirror engine only ever reads, writes, deletes and flushes whole sectors;
//! it never talks to a backend from two contexts at once.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default sector size of backends which do not report one.
pub const DEFAULT_SECTOR_SIZE: u32 = 512;

/// Provides statistics about (failed) requests performed by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    /// The total number of bytes of issued read requests
    pub read: u64,
    /// The total number of bytes of issued write requests
    pub written: u64,
    /// The total number of bytes of issued delete requests
    pub deleted: u64,
    /// The total number of bytes of failed read requests
    pub failed_reads: u64,
    /// The total number of bytes of failed write requests
    pub failed_writes: u64,
    /// The total number of failed flush requests
    pub failed_flushes: u64,
}

#[derive(Default)]
struct AtomicStatistics {
    read: AtomicU64,
    written: AtomicU64,
    deleted: AtomicU64,
    failed_reads: AtomicU64,
    failed_writes: AtomicU64,
    failed_flushes: AtomicU64,
}

impl AtomicStatistics {
    fn as_stats(&self) -> Statistics {
        Statistics {
            read: self.read.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            failed_reads: self.failed_reads.load(Ordering::Relaxed),
            failed_writes: self.failed_writes.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
        }
    }

    fn count(counter: &AtomicU64, amount: usize) {
        counter.fetch_add(amount as u64, Ordering::Relaxed);
    }
}

/// A storage extent a mirror member lives on.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Reads `len` bytes at `offset`.
    async fn read_raw(&self, len: usize, offset: u64) -> Result<Box<[u8]>, Error>;

    /// Writes `data` at `offset`.
    ///
    /// Note: `data.len()` must be a multiple of `sector_size()`.
    async fn write_raw(&self, data: &[u8], offset: u64) -> Result<(), Error>;

    /// Discards `len` bytes at `offset`. The content of a discarded range is
    /// undefined afterwards; backends without support simply keep the data.
    async fn delete(&self, _offset: u64, _len: u64) -> Result<(), Error> {
        Ok(())
    }

    /// Flushes pending data (in caches) to stable storage.
    fn flush(&self) -> Result<(), Error>;

    /// Returns the total size of this backend in bytes.
    fn size(&self) -> u64;

    /// Returns the sector size of this backend in bytes.
    fn sector_size(&self) -> u32;

    /// Returns the preferred I/O stripe of this backend, 0 if unknown.
    fn stripe_size(&self) -> u32 {
        0
    }

    /// Returns the (unique) ID of this backend, e.g. its path.
    fn id(&self) -> &str;

    /// Returns statistics about this backend.
    fn stats(&self) -> Statistics;
}

fn check_bounds(id: &str, size: u64, offset: u64, len: u64) -> Result<(), Error> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => bail!(ErrorKind::OutOfBounds(id.to_string(), offset, len)),
    }
}


mod errors;
pub use self::errors::{Error, ErrorKind, ResultExt};

mod file;
pub use self::file::File;

mod memory;
pub use self::memory::Memory;
