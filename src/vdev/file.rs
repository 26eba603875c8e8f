use super::errors::*;
use super::{check_bounds, AtomicStatistics, Backend, Statistics, DEFAULT_SECTOR_SIZE};
use async_trait::async_trait;
use libc::{c_ulong, ioctl};
use std::fs;
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// `Backend` that is backed by a file or a block device.
pub struct File {
    file: fs::File,
    id: String,
    size: u64,
    sector_size: u32,
    stats: AtomicStatistics,
}

impl File {
    /// Creates a new `File`.
    pub fn new(file: fs::File, id: String) -> Result<Self, io::Error> {
        let file_type = file.metadata()?.file_type();
        let (size, sector_size) = if file_type.is_file() {
            (file.metadata()?.len(), DEFAULT_SECTOR_SIZE)
        } else if file_type.is_block_device() {
            (
                get_block_device_size(&file)?,
                get_block_device_sector_size(&file)?,
            )
        } else {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("Unsupported file type: {:?}", file_type),
            ));
        };
        Ok(File {
            file,
            id,
            size,
            sector_size,
            stats: Default::default(),
        })
    }

    /// Opens `path` for reading and writing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, io::Error> {
        let path = path.as_ref();
        let file = fs::OpenOptions::new().read(true).write(true).open(path)?;
        File::new(file, path.to_string_lossy().into_owned())
    }
}

#[cfg(target_os = "linux")]
fn get_block_device_size(file: &fs::File) -> Result<u64, io::Error> {
    const BLKGETSIZE64: c_ulong = 2148012658;
    let mut size: u64 = 0;
    let result = unsafe { ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
    if result == 0 {
        Ok(size)
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(target_os = "linux")]
fn get_block_device_sector_size(file: &fs::File) -> Result<u32, io::Error> {
    const BLKSSZGET: c_ulong = 0x1268;
    let mut size: libc::c_int = 0;
    let result = unsafe { ioctl(file.as_raw_fd(), BLKSSZGET, &mut size) };
    if result == 0 && size > 0 {
        Ok(size as u32)
    } else {
        Err(io::Error::last_os_error())
    }
}

impl File {
    fn flush_failed(&self, e: io::Error) -> Error {
        AtomicStatistics::count(&self.stats.failed_flushes, 1);
        Error::with_chain(e, ErrorKind::FlushError(self.id.clone()))
    }
}

#[async_trait]
impl Backend for File {
    async fn read_raw(&self, len: usize, offset: u64) -> Result<Box<[u8]>, Error> {
        check_bounds(&self.id, self.size, offset, len as u64)?;
        AtomicStatistics::count(&self.stats.read, len);
        let mut buf = vec![0; len].into_boxed_slice();
        match self
            .file
            .read_exact_at(&mut buf, offset)
            .map_err(Error::from)
            .chain_err(|| ErrorKind::ReadError(self.id.clone()))
        {
            Ok(()) => Ok(buf),
            Err(e) => {
                AtomicStatistics::count(&self.stats.failed_reads, len);
                Err(e)
            }
        }
    }

    async fn write_raw(&self, data: &[u8], offset: u64) -> Result<(), Error> {
        check_bounds(&self.id, self.size, offset, data.len() as u64)?;
        AtomicStatistics::count(&self.stats.written, data.len());
        match self
            .file
            .write_all_at(data, offset)
            .map_err(Error::from)
            .chain_err(|| ErrorKind::WriteError(self.id.clone()))
        {
            Ok(()) => Ok(()),
            Err(e) => {
                AtomicStatistics::count(&self.stats.failed_writes, data.len());
                Err(e)
            }
        }
    }

    fn flush(&self) -> Result<(), Error> {
        self.file.sync_data().map_err(|e| self.flush_failed(e))
    }

    fn size(&self) -> u64 {
        self.size
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
