//! On-disk identity record of a mirror member.
//!
//! The record lives in the last sector of every backend. It is serialized
//! with [`bincode`](../../bincode/index.html), padded to `METADATA_SIZE`
//! bytes and sealed with an `XxHash` of everything in front of the
//! checksum. A record that fails any check is never partially trusted.

use crate::checksum::{Checksum, XxHash};
use crate::mirror::Balance;
use crate::size::StaticSize;
use crate::vdev::Backend;
use bincode::{deserialize, serialize_into};
use byteorder::{ByteOrder, LittleEndian};
use futures::executor::block_on;
use std::fmt;

#[allow(missing_docs, unused_doc_comments)]
mod errors {
    error_chain! {
        foreign_links {
            Serialization(::bincode::Error);
        }
        links {
            Backend(crate::vdev::Error, crate::vdev::ErrorKind);
        }
        errors {
            InvalidMagic {
                description("invalid magic")
            }
            InvalidChecksum {
                description("invalid checksum")
            }
            UnsupportedVersion(version: u32) {
                description("unsupported metadata version")
                display("unsupported metadata version {}", version)
            }
            SectorTooSmall(sector_size: u32) {
                description("sector too small for metadata")
                display("sector size {} cannot hold the metadata record", sector_size)
            }
            BackendTooSmall(size: u64, sector_size: u32) {
                description("backend smaller than one sector")
                display("backend of {} bytes cannot hold a sector of {}", size, sector_size)
            }
            ProviderSizeMismatch(recorded: u64, actual: u64) {
                description("backend size changed")
                display("backend size changed from {} to {}", recorded, actual)
            }
        }
    }
}
pub use self::errors::{Error, ErrorKind, Result};

static MAGIC: &[u8; 16] = b"MIRRORSTACK\0\0\0\0\0";

/// Current on-disk version.
pub const VERSION: u32 = 1;

/// Bytes of the last sector covered by the record and its checksum.
pub const METADATA_SIZE: usize = 256;

/// Maximum length of a device name in bytes.
pub const NAME_LEN: usize = 16;

macro_rules! flags {
    ($(#[$doc:meta])* $name:ident { $($(#[$fdoc:meta])* $flag:ident = $bit:expr,)* }) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl $name {
            $($(#[$fdoc])* pub const $flag: $name = $name($bit);)*

            /// Returns true if every bit of `other` is set.
            pub fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            /// Sets the bits of `other`.
            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            /// Clears the bits of `other`.
            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }

            /// Sets or clears the bits of `other`.
            pub fn set(&mut self, other: $name, value: bool) {
                if value {
                    self.insert(other)
                } else {
                    self.remove(other)
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                let mut first = true;
                $(
                    if self.contains($name::$flag) {
                        if !first {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}", stringify!($flag))?;
                        first = false;
                    }
                )*
                if first {
                    write!(f, "NONE")?;
                }
                Ok(())
            }
        }
    };
}

flags! {
    /// Per-disk flags.
    DiskFlags {
        /// The disk received writes since it was last marked idle.
        DIRTY = 0x01,
        /// A synchronization is in progress; `sync_offset` is meaningful.
        SYNCHRONIZING = 0x02,
        /// The disk has to be synchronized regardless of its syncid.
        FORCE_SYNC = 0x04,
        /// The disk was deactivated by the operator.
        INACTIVE = 0x08,
        /// The disk is bound to its backend explicitly.
        HARDCODED = 0x10,
        /// The last metadata write failed.
        BROKEN = 0x20,
    }
}

flags! {
    /// Per-device flags.
    DeviceFlags {
        /// Out-of-date disks are left STALE instead of synchronized.
        NOAUTOSYNC = 0x01,
        /// Errors during synchronization do not disconnect the target.
        NOFAILSYNC = 0x02,
    }
}

/// Identity record of one mirror member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    magic: [u8; 16],
    /// On-disk version.
    pub version: u32,
    name: [u8; NAME_LEN],
    /// Identity of the mirror.
    pub mirror_id: u32,
    /// Identity of this member.
    pub disk_id: u32,
    /// Configured member count.
    pub ndisks: u32,
    /// Generation id.
    pub genid: u32,
    /// Synchronization id.
    pub syncid: u32,
    /// Disk flags.
    pub dflags: DiskFlags,
    /// Device flags.
    pub mflags: DeviceFlags,
    /// Offset up to which a synchronization completed.
    pub sync_offset: u64,
    /// Disk priority; higher is preferred.
    pub priority: u32,
    /// Read balance strategy.
    pub balance: Balance,
    /// Split threshold for the split strategy.
    pub slice: u32,
    /// Size of the mirror in bytes.
    pub mediasize: u64,
    /// Sector size of the mirror in bytes.
    pub sectorsize: u32,
    /// Size of the backend at the time it was labelled.
    pub provsize: u64,
}

impl Metadata {
    /// Creates a record with the current magic and version.
    pub fn new(name: &str) -> Self {
        let mut md = Metadata {
            magic: *MAGIC,
            version: VERSION,
            name: [0; NAME_LEN],
            mirror_id: 0,
            disk_id: 0,
            ndisks: 0,
            genid: 0,
            syncid: 0,
            dflags: DiskFlags::default(),
            mflags: DeviceFlags::default(),
            sync_offset: 0,
            priority: 0,
            balance: Balance::default(),
            slice: 0,
            mediasize: 0,
            sectorsize: 0,
            provsize: 0,
        };
        md.set_name(name);
        md
    }

    /// Returns the device name.
    pub fn name(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    /// Sets the device name, truncated to `NAME_LEN` bytes.
    pub fn set_name(&mut self, name: &str) {
        self.name = [0; NAME_LEN];
        let len = name.len().min(NAME_LEN);
        self.name[..len].copy_from_slice(&name.as_bytes()[..len]);
    }

    /// Serializes the record into a buffer of `sector_size` bytes.
    pub fn pack(&self, sector_size: u32) -> Result<Box<[u8]>> {
        if (sector_size as usize) < METADATA_SIZE {
            bail!(ErrorKind::SectorTooSmall(sector_size));
        }
        let checksum_size = XxHash::size();
        let mut data = Vec::with_capacity(sector_size as usize);
        serialize_into(&mut data, self)?;
        debug_assert!(data.len() <= METADATA_SIZE - checksum_size);
        data.resize(METADATA_SIZE - checksum_size, 0);
        let checksum = XxHash::of(&data);
        data.resize(METADATA_SIZE, 0);
        LittleEndian::write_u64(&mut data[METADATA_SIZE - checksum_size..], checksum.digest());
        data.resize(sector_size as usize, 0);
        Ok(data.into_boxed_slice())
    }

    /// Deserializes and verifies a record.
    pub fn unpack(b: &[u8]) -> Result<Self> {
        if b.len() < METADATA_SIZE {
            bail!(ErrorKind::InvalidMagic);
        }
        let checksum_size = XxHash::size();
        let body = &b[..METADATA_SIZE - checksum_size];
        let stored = XxHash::from_digest(LittleEndian::read_u64(
            &b[METADATA_SIZE - checksum_size..METADATA_SIZE],
        ));
        if stored.verify(body).is_err() {
            if body[..MAGIC.len()] != MAGIC[..] {
                bail!(ErrorKind::InvalidMagic);
            }
            bail!(ErrorKind::InvalidChecksum);
        }
        let this: Self = deserialize(body)?;
        if this.magic != *MAGIC {
            bail!(ErrorKind::InvalidMagic);
        }
        if this.version != VERSION {
            bail!(ErrorKind::UnsupportedVersion(this.version));
        }
        Ok(this)
    }
}

fn metadata_offset(backend: &dyn Backend) -> Result<u64> {
    let sector_size = backend.sector_size();
    match backend.size().checked_sub(u64::from(sector_size)) {
        Some(offset) => Ok(offset),
        None => bail!(ErrorKind::BackendTooSmall(backend.size(), sector_size)),
    }
}

/// Reads the record of `backend`.
pub fn read_metadata(backend: &dyn Backend) -> Result<Metadata> {
    let sector_size = backend.sector_size();
    if (sector_size as usize) < METADATA_SIZE {
        bail!(ErrorKind::SectorTooSmall(sector_size));
    }
    let offset = metadata_offset(backend)?;
    let data = block_on(backend.read_raw(sector_size as usize, offset))?;
    let md = Metadata::unpack(&data)?;
    if md.provsize != backend.size() {
        bail!(ErrorKind::ProviderSizeMismatch(md.provsize, backend.size()));
    }
    Ok(md)
}

/// Reads the record of `backend`, treating anything unreadable as absent.
pub fn taste(backend: &dyn Backend) -> Option<Metadata> {
    match read_metadata(backend) {
        Ok(md) => Some(md),
        Err(Error(ErrorKind::InvalidMagic, _)) => {
            debug!("No mirror metadata on {}", backend.id());
            None
        }
        Err(e) => {
            warn!("Ignoring metadata of {}: {}", backend.id(), e);
            None
        }
    }
}

/// Writes `md` to the last sector of `backend`.
pub fn write_metadata(backend: &dyn Backend, md: &Metadata) -> Result<()> {
    let offset = metadata_offset(backend)?;
    let data = md.pack(backend.sector_size())?;
    block_on(backend.write_raw(&data, offset))?;
    Ok(())
}

/// Zeroes the last sector of `backend`.
pub fn clear_metadata(backend: &dyn Backend) -> Result<()> {
    let offset = metadata_offset(backend)?;
    let empty_data = vec![0; backend.sector_size() as usize];
    block_on(backend.write_raw(&empty_data, offset))?;
    Ok(())
}

/// Number of bytes at the end of a backend reserved for the record.
pub fn reserved_size(sector_size: u32) -> u64 {
    u64::from(sector_size)
}
