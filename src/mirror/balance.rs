//! Read balancing: maps a read request onto one or more active disks.

use super::config::Balance;
use super::disk::{Disk, DiskId, DiskState};

/// Fixed-point scale of the load metric.
pub const LOAD_SCALE: i64 = 256;

/// Distance within which a disk head counts as "close" to a request.
pub const TRACK_SIZE: u64 = 1024 * 1024;

/// One piece of a read, bound to a disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub disk: DiskId,
    pub offset: u64,
    pub length: u64,
}

/// Rotation state shared by the round-robin and split strategies.
#[derive(Debug, Default)]
pub(super) struct Balancer {
    hint: Option<DiskId>,
}

impl Balancer {
    /// Chooses the disks serving a read of `length` bytes at `offset`.
    ///
    /// Returns an empty vector if no disk is active. Fragments are returned
    /// in offset order.
    pub fn choose(
        &mut self,
        balance: Balance,
        slice: u32,
        sectorsize: u32,
        disks: &mut [Disk],
        offset: u64,
        length: u64,
    ) -> Vec<Fragment> {
        let single = |disk: Option<DiskId>| -> Vec<Fragment> {
            disk.map(|disk| Fragment {
                disk,
                offset,
                length,
            })
            .into_iter()
            .collect()
        };
        match balance {
            Balance::RoundRobin => single(self.round_robin(disks)),
            Balance::Prefer => single(prefer(disks)),
            Balance::Load => single(load(disks, offset)),
            Balance::Split => {
                if length <= u64::from(slice) {
                    single(self.round_robin(disks))
                } else {
                    split(disks, sectorsize, offset, length)
                }
            }
        }
    }

    fn round_robin(&mut self, disks: &[Disk]) -> Option<DiskId> {
        let start = self
            .hint
            .and_then(|hint| disks.iter().position(|d| d.id == hint))
            .map_or(0, |idx| idx + 1);
        let n = disks.len();
        let chosen = (0..n)
            .map(|i| &disks[(start + i) % n])
            .find(|d| d.state == DiskState::Active)
            .map(|d| d.id);
        if chosen.is_some() {
            self.hint = chosen;
        }
        chosen
    }
}

fn prefer(disks: &[Disk]) -> Option<DiskId> {
    disks
        .iter()
        .find(|d| d.state == DiskState::Active)
        .map(|d| d.id)
}

fn load(disks: &mut [Disk], offset: u64) -> Option<DiskId> {
    let mut best = None;
    let mut best_prio = i64::max_value();
    for disk in disks.iter().filter(|d| d.state == DiskState::Active) {
        let mut prio = disk.load;
        if disk.last_offset == offset {
            prio -= 2 * LOAD_SCALE;
        } else if abs_diff(disk.last_offset, offset) < TRACK_SIZE {
            prio -= LOAD_SCALE;
        }
        if prio <= best_prio {
            best = Some(disk.id);
            best_prio = prio;
        }
    }
    for disk in disks.iter_mut().filter(|d| d.state == DiskState::Active) {
        disk.load = (i64::from(disk.inflight) * LOAD_SCALE + disk.load * 7) / 8;
    }
    best
}

fn split(disks: &[Disk], sectorsize: u32, offset: u64, length: u64) -> Vec<Fragment> {
    let active: Vec<DiskId> = disks
        .iter()
        .filter(|d| d.state == DiskState::Active)
        .map(|d| d.id)
        .collect();
    if active.is_empty() {
        return Vec::new();
    }
    let sectorsize = u64::from(sectorsize);
    let sectors = length / sectorsize;
    let per_disk = ((sectors + active.len() as u64 - 1) / active.len() as u64).max(1) * sectorsize;

    let mut fragments = Vec::with_capacity(active.len());
    let mut left = length;
    let mut next = offset;
    for &disk in active.iter().cycle() {
        if left == 0 {
            break;
        }
        let length = per_disk.min(left);
        fragments.push(Fragment {
            disk,
            offset: next,
            length,
        });
        next += length;
        left -= length;
    }
    fragments
}

fn abs_diff(a: u64, b: u64) -> u64 {
    if a > b {
        a - b
    } else {
        b - a
    }
}
