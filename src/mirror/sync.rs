//! The synchronizer, which copies an active disk onto a synchronizing one
//! chunk by chunk, and the collision guard keeping those copies and regular
//! writes off each other's ranges.

use super::disk::{DiskId, DiskState};
use super::queue::{IoEntry, Reason};
use super::request::{overlaps, SyncChunk, SyncCompletion, SyncPhase};
use super::state::{Device, SyncRange};
use crate::vdev;
use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

/// Attempts per chunk when failed synchronization does not disconnect.
const SYNC_RETRIES: u32 = 3;

impl Device {
    /// Hands out synchronization chunks of disk `id` until its window is
    /// full or the end of the device is reached.
    pub fn sync_fill(&mut self, id: DiskId) {
        if self.provider.is_none() || self.destroying.is_some() {
            return;
        }
        let mediasize = self.mediasize;
        let window = self.config.sync_requests;
        let chunk_size = u64::from(self.config.sync_chunk);
        loop {
            let chunk = {
                let disk = match self.disk_mut(id) {
                    Some(disk) if disk.state == DiskState::Synchronizing => disk,
                    _ => return,
                };
                let sync = match disk.sync.as_mut() {
                    Some(sync) => sync,
                    None => return,
                };
                if sync.offset >= mediasize {
                    if sync.inflight == 0 {
                        break;
                    }
                    return;
                }
                if sync.inflight >= window {
                    return;
                }
                let length = chunk_size.min(mediasize - sync.offset);
                let chunk = SyncChunk::new(id, sync.generation, sync.offset, length);
                sync.offset += length;
                sync.inflight += 1;
                chunk
            };
            self.sync_issue(chunk);
        }
        self.sync_finish(id);
    }

    fn sync_issue(&mut self, chunk: SyncChunk) {
        if self.regular_write_overlaps(chunk.offset, chunk.length) {
            debug!(
                "Device {}: synchronization of [{}, +{}) delayed by a regular write.",
                self.name(),
                chunk.offset,
                chunk.length
            );
            self.sync_delayed.push_back(chunk);
        } else {
            self.sync_read(chunk);
        }
    }

    fn sync_read(&mut self, mut chunk: SyncChunk) {
        let source = self
            .disks
            .iter()
            .filter(|d| d.state == DiskState::Active)
            .find_map(|d| d.backend.as_ref().map(|b| (d.id, Arc::clone(b))));
        let (source, backend) = match source {
            Some(source) => source,
            None => {
                warn!(
                    "Device {}: no source to synchronize [{}, +{}) from.",
                    self.name(),
                    chunk.offset,
                    chunk.length
                );
                self.sync_delayed.push_back(chunk);
                return;
            }
        };
        chunk.phase = SyncPhase::Read;
        chunk.source = Some(source);
        chunk.data = None;
        self.sync_inflight.push(SyncRange {
            disk: chunk.disk,
            generation: chunk.generation,
            offset: chunk.offset,
            length: chunk.length,
        });
        trace!(
            "Device {}: synchronization read [{}, +{}).",
            self.name(),
            chunk.offset,
            chunk.length
        );
        self.spawn_io(async move {
            let result = backend
                .read_raw(chunk.length as usize, chunk.offset)
                .await
                .map(Some);
            IoEntry::Sync(SyncCompletion { chunk, result })
        });
    }

    fn sync_write(&mut self, mut chunk: SyncChunk) {
        let backend = match self.disk(chunk.disk).and_then(|d| d.backend.as_ref()) {
            Some(backend) => Arc::clone(backend),
            None => return,
        };
        chunk.phase = SyncPhase::Write;
        self.spawn_io(async move {
            let result = match chunk.data {
                Some(ref data) => backend.write_raw(&data[..], chunk.offset).await,
                None => Ok(()),
            };
            IoEntry::Sync(SyncCompletion {
                chunk,
                result: result.map(|()| None),
            })
        });
    }

    /// Returns true if the chunk belongs to the current run of its disk.
    fn sync_current(&self, disk: DiskId, generation: u64) -> bool {
        self.disk(disk)
            .filter(|d| d.state == DiskState::Synchronizing)
            .and_then(|d| d.sync.as_ref())
            .map_or(false, |s| s.generation == generation)
    }

    fn forget_range(&mut self, chunk: &SyncChunk) {
        if let Some(idx) = self.sync_inflight.iter().position(|r| {
            r.disk == chunk.disk && r.generation == chunk.generation && r.offset == chunk.offset
        }) {
            self.sync_inflight.swap_remove(idx);
        }
    }

    /// Folds the completion of one phase of a synchronization chunk.
    pub fn on_sync_completion(&mut self, completion: SyncCompletion) {
        let SyncCompletion { mut chunk, result } = completion;
        if !self.sync_current(chunk.disk, chunk.generation) {
            trace!(
                "Device {}: dropping synchronization completion of a finished run.",
                self.name()
            );
            return;
        }
        match (chunk.phase, result) {
            (SyncPhase::Read, Ok(data)) => {
                chunk.data = Some(Arc::from(data.unwrap_or_default()));
                self.sync_write(chunk);
            }
            (SyncPhase::Read, Err(e)) => self.sync_read_failed(chunk, e),
            (SyncPhase::Write, Ok(_)) => self.sync_written(chunk),
            (SyncPhase::Write, Err(e)) => {
                warn!(
                    "Device {}: synchronization write [{}, +{}) failed: {}",
                    self.name(),
                    chunk.offset,
                    chunk.length,
                    e
                );
                self.forget_range(&chunk);
                self.sync_retry(chunk);
            }
        }
    }

    fn sync_read_failed(&mut self, mut chunk: SyncChunk, e: vdev::Error) {
        warn!(
            "Device {}: synchronization read [{}, +{}) failed: {}",
            self.name(),
            chunk.offset,
            chunk.length,
            e
        );
        self.forget_range(&chunk);
        if let Some(source) = chunk.source.take() {
            let active = self
                .disk(source)
                .map_or(false, |d| d.state == DiskState::Active);
            if active && self.other_active(&[source]) {
                self.disconnect(source, Reason::SyncSource);
                if self.sync_current(chunk.disk, chunk.generation) {
                    self.sync_delayed.push_front(chunk);
                }
                return;
            }
        }
        self.sync_retry(chunk);
    }

    fn sync_retry(&mut self, mut chunk: SyncChunk) {
        if self.config.failsync || chunk.retries >= SYNC_RETRIES {
            self.disconnect(chunk.disk, Reason::Sync);
            return;
        }
        chunk.retries += 1;
        chunk.data = None;
        chunk.phase = SyncPhase::Read;
        self.sync_delayed.push_front(chunk);
    }

    fn sync_written(&mut self, chunk: SyncChunk) {
        self.forget_range(&chunk);
        let id = chunk.disk;
        let pending = self
            .sync_inflight
            .iter()
            .filter(|r| r.disk == id && r.generation == chunk.generation)
            .map(|r| r.offset)
            .chain(
                self.sync_delayed
                    .iter()
                    .filter(|c| c.disk == id && c.generation == chunk.generation)
                    .map(|c| c.offset),
            )
            .min();
        let interval = u64::from(self.config.sync_save_interval);
        let mediasize = self.mediasize;
        let name = self.config.name.clone();
        let checkpoint = match self.disk_mut(id).and_then(|d| {
            let disk_name = d.name.clone();
            d.sync.as_mut().map(|s| (disk_name, s))
        }) {
            Some((disk_name, sync)) => {
                sync.inflight -= 1;
                sync.completed += 1;
                sync.offset_done = pending.unwrap_or(sync.offset);
                debug!(
                    "Device {}: {} synchronized up to {} of {}.",
                    name, disk_name, sync.offset_done, mediasize
                );
                interval > 0 && sync.completed % interval == 0
            }
            None => return,
        };
        if checkpoint {
            self.update_metadata(id);
        }
        self.sync_fill(id);
    }

    /// Completes the synchronization of disk `id` once nothing is left.
    fn sync_finish(&mut self, id: DiskId) {
        let mediasize = self.mediasize;
        let done = self
            .disk(id)
            .and_then(|d| d.sync.as_ref())
            .map_or(false, |s| s.offset >= mediasize && s.inflight == 0);
        if done {
            info!(
                "Device {}: synchronization of {} complete.",
                self.name(),
                self.disk(id).map_or("?", |d| d.name.as_str())
            );
            self.set_disk_state(id, DiskState::Active);
            self.update_device();
        }
    }

    /// Forgets all chunks of disk `id`. Their completions will be dropped.
    pub fn stop_sync(&mut self, id: DiskId) {
        self.sync_delayed.retain(|c| c.disk != id);
        self.sync_inflight.retain(|r| r.disk != id);
    }

    /// Returns true if a synchronization chunk in flight overlaps the range.
    pub fn sync_collides(&self, offset: u64, length: u64) -> bool {
        self.sync_inflight
            .iter()
            .any(|r| overlaps(r.offset, r.length, offset, length))
    }

    /// Returns true if a dispatched write or delete overlaps the range.
    pub fn regular_write_overlaps(&self, offset: u64, length: u64) -> bool {
        self.inflight
            .values()
            .any(|i| i.request.kind.modifies() && i.request.overlaps(offset, length))
    }

    /// Issues every delayed chunk and write whose collision has cleared.
    /// Chunks go first; a write stays behind any earlier write it overlaps.
    pub fn release_delayed(&mut self) {
        if !self.sync_delayed.is_empty() && self.destroying.is_none() {
            let delayed = mem::replace(&mut self.sync_delayed, VecDeque::new());
            for chunk in delayed {
                if !self.sync_current(chunk.disk, chunk.generation) {
                    continue;
                }
                if self.regular_write_overlaps(chunk.offset, chunk.length)
                    || self.count(DiskState::Active) == 0
                {
                    self.sync_delayed.push_back(chunk);
                } else {
                    self.sync_read(chunk);
                }
            }
        }

        if !self.regular_delayed.is_empty() {
            let delayed = mem::replace(&mut self.regular_delayed, VecDeque::new());
            let mut held: Vec<(u64, u64)> = Vec::new();
            for request in delayed {
                if self.sync_collides(request.offset, request.length)
                    || held.iter().any(|&(o, l)| request.overlaps(o, l))
                {
                    held.push((request.offset, request.length));
                    self.regular_delayed.push_back(request);
                } else {
                    self.start_write(request);
                }
            }
        }
    }
}
