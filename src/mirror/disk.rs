use crate::metadata::DiskFlags;
use crate::vdev::{Backend, Statistics};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Stable identity of a mirror member, independent of its backend path.
pub type DiskId = u32;

/// Lifecycle state of a mirror member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiskState {
    /// Not yet part of the device.
    None,
    /// Discovered, waiting for the device to decide its fate.
    New,
    /// Up to date; serves reads and receives writes.
    Active,
    /// Out of date and excluded from all I/O until synchronization is forced.
    Stale,
    /// Being brought up to date by the synchronizer.
    Synchronizing,
    /// Lost; its backend has been released.
    Disconnected,
    /// Wiped and removed from the device.
    Destroy,
}

impl fmt::Display for DiskState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            DiskState::None => "NONE",
            DiskState::New => "NEW",
            DiskState::Active => "ACTIVE",
            DiskState::Stale => "STALE",
            DiskState::Synchronizing => "SYNCHRONIZING",
            DiskState::Disconnected => "DISCONNECTED",
            DiskState::Destroy => "DESTROY",
        })
    }
}

/// Options for attaching a backend to a mirror.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskOptions {
    /// Priority of the disk; overrides the recorded one.
    pub priority: Option<u32>,
    /// Bind the disk to its backend explicitly.
    pub hardcoded: bool,
    /// Ignore any metadata on the backend and label it as a new member.
    pub insert: bool,
}

/// How a disk leaves the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// Wipe the disk's metadata and shrink the member count.
    Destroy,
    /// Release the backend but keep its metadata.
    Disconnect,
}

/// Bookkeeping of a running synchronization.
#[derive(Debug, Clone)]
pub(super) struct SyncState {
    /// Next offset to hand out to a synchronization request.
    pub offset: u64,
    /// Everything below this offset is known to be on the disk.
    pub offset_done: u64,
    /// Synchronization requests handed out and not yet finished.
    pub inflight: usize,
    /// Requests finished since synchronization started.
    pub completed: u64,
    /// Distinguishes requests of this run from those of an earlier one.
    pub generation: u64,
}

/// One mirror member.
pub(super) struct Disk {
    pub id: DiskId,
    pub backend: Option<Arc<dyn Backend>>,
    pub name: String,
    pub state: DiskState,
    pub priority: u32,
    pub seq: u64,
    pub genid: u32,
    pub syncid: u32,
    pub flags: DiskFlags,
    pub sync: Option<SyncState>,
    /// Sync offset recorded on the backend when it was discovered.
    pub recorded_sync_offset: u64,
    /// Outstanding regular requests.
    pub inflight: u32,
    /// Smoothed load used by the load balancer.
    pub load: i64,
    /// End of the last regular request.
    pub last_offset: u64,
    /// Regular I/O errors absorbed while this was the last active disk.
    pub errors: u32,
    /// Statistics of the backend, kept after it is released.
    pub last_stats: Statistics,
}

impl Disk {
    pub fn new(id: DiskId, backend: Arc<dyn Backend>, priority: u32, seq: u64) -> Self {
        Disk {
            id,
            name: backend.id().to_string(),
            backend: Some(backend),
            state: DiskState::None,
            priority,
            seq,
            genid: 0,
            syncid: 0,
            flags: DiskFlags::default(),
            sync: None,
            recorded_sync_offset: 0,
            inflight: 0,
            load: 0,
            last_offset: 0,
            errors: 0,
            last_stats: Statistics::default(),
        }
    }

    /// Returns true if a write starting at `offset` has to reach this disk.
    ///
    /// A synchronizing disk only receives writes below its sync cursor; the
    /// rest is copied by the synchronizer later on.
    pub fn accepts_write(&self, offset: u64) -> bool {
        match self.state {
            DiskState::Active => true,
            DiskState::Synchronizing => self.sync.as_ref().map_or(false, |s| offset < s.offset),
            _ => false,
        }
    }

    /// Returns true if the disk counts as a live member of the device.
    pub fn is_member(&self) -> bool {
        match self.state {
            DiskState::Disconnected | DiskState::Destroy => false,
            _ => true,
        }
    }

    pub fn stats(&self) -> Statistics {
        match self.backend {
            Some(ref backend) => backend.stats(),
            None => self.last_stats,
        }
    }

    /// Releases the backend handle.
    pub fn close(&mut self) {
        if let Some(backend) = self.backend.take() {
            self.last_stats = backend.stats();
        }
    }
}

/// Order of disks in a device: descending priority, then insertion order.
pub(super) fn disk_order(a: &Disk, b: &Disk) -> Ordering {
    b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vdev::Memory;

    fn disk(id: DiskId, priority: u32, seq: u64) -> Disk {
        let backend = Arc::new(Memory::new(4096, 512, format!("md{}", id)));
        Disk::new(id, backend, priority, seq)
    }

    #[test]
    fn ordered_by_priority_then_insertion() {
        let mut disks = vec![disk(1, 0, 0), disk(2, 5, 1), disk(3, 0, 2), disk(4, 5, 3)];
        disks.sort_by(disk_order);
        let ids: Vec<_> = disks.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![2, 4, 1, 3]);
    }

    #[test]
    fn synchronizing_disk_takes_writes_behind_cursor() {
        let mut d = disk(1, 0, 0);
        d.state = DiskState::Synchronizing;
        d.sync = Some(SyncState {
            offset: 8192,
            offset_done: 4096,
            inflight: 1,
            completed: 0,
            generation: 1,
        });
        assert!(d.accepts_write(0));
        assert!(d.accepts_write(8191));
        assert!(!d.accepts_write(8192));
        d.state = DiskState::Stale;
        assert!(!d.accepts_write(0));
    }

    #[test]
    fn closed_disk_keeps_statistics() {
        let mut d = disk(1, 0, 0);
        futures::executor::block_on(d.backend.as_ref().unwrap().write_raw(&[1; 512], 0)).unwrap();
        d.close();
        assert!(d.backend.is_none());
        assert_eq!(d.stats().written, 512);
    }
}
