use super::errors::*;
use super::{check_bounds, AtomicStatistics, Backend, Statistics};
use async_trait::async_trait;
use parking_lot::Mutex;

/// `Backend` that keeps its whole extent in memory (a RAM disk).
pub struct Memory {
    buffer: Mutex<Box<[u8]>>,
    id: String,
    sector_size: u32,
    stats: AtomicStatistics,
}

impl Memory {
    /// Creates a new zero-filled `Memory` backend of `size` bytes.
    pub fn new(size: usize, sector_size: u32, id: String) -> Self {
        debug_assert!(size % sector_size as usize == 0);
        Memory {
            buffer: Mutex::new(vec![0; size].into_boxed_slice()),
            id,
            sector_size,
            stats: Default::default(),
        }
    }

    /// Returns a copy of `len` bytes at `offset` without touching the
    /// statistics.
    pub fn snapshot(&self, offset: usize, len: usize) -> Vec<u8> {
        self.buffer.lock()[offset..offset + len].to_vec()
    }
}

#[async_trait]
impl Backend for Memory {
    async fn read_raw(&self, len: usize, offset: u64) -> Result<Box<[u8]>, Error> {
        check_bounds(&self.id, self.size(), offset, len as u64)?;
        AtomicStatistics::count(&self.stats.read, len);
        let offset = offset as usize;
        Ok(self.buffer.lock()[offset..offset + len]
            .to_vec()
            .into_boxed_slice())
    }

    async fn write_raw(&self, data: &[u8], offset: u64) -> Result<(), Error> {
        check_bounds(&self.id, self.size(), offset, data.len() as u64)?;
        AtomicStatistics::count(&self.stats.written, data.len());
        let offset = offset as usize;
        self.buffer.lock()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    async fn delete(&self, offset: u64, len: u64) -> Result<(), Error> {
        check_bounds(&self.id, self.size(), offset, len)?;
        AtomicStatistics::count(&self.stats.deleted, len as usize);
        let offset = offset as usize;
        for b in &mut self.buffer.lock()[offset..offset + len as usize] {
            *b = 0;
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), Error> {
        Ok(())
    }

    fn size(&self) -> u64 {
        self.buffer.lock().len() as u64
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn stats(&self) -> Statistics {
        self.stats.as_stats()
    }
}
