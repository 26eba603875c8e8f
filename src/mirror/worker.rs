//! The worker loop: the only place where a device changes.

use super::disk::{DiskId, DiskState};
use super::errors::*;
use super::queue::{Event, IoEntry, Reason, Shared, Work};
use super::request::{Inflight, IoKind, RegularCompletion, Request};
use super::state::Device;
use super::DestroyMode;
use crate::vdev::{self, Backend};
use std::future::Future;
use std::sync::Arc;
use std::thread;

/// Closes the queues when the worker unwinds, so that callers get
/// `DeviceGone` instead of waiting for a worker that is gone.
struct CloseOnPanic(Arc<Shared>);

impl Drop for CloseOnPanic {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }
        let name = self.0.name().to_string();
        error!("Worker of {} panicked, failing outstanding requests.", name);
        let (events, entries) = self.0.close();
        drop(events);
        for entry in entries {
            if let IoEntry::Request(request) = entry {
                request.answer(Err(ErrorKind::DeviceGone(name.clone()).into()));
            }
        }
    }
}

/// Runs `device` until it is destroyed.
pub(super) fn run(mut device: Device) {
    let shared = Arc::clone(&device.shared);
    let _guard = CloseOnPanic(Arc::clone(&shared));
    debug!("Worker of {} started.", device.name());
    loop {
        if device.ready_to_destroy() {
            device.teardown();
            break;
        }
        match shared.next(device.deadline()) {
            Work::Event(event) => device.handle_event(event),
            Work::Io(entry) => device.handle_io(entry),
            Work::Timeout => device.on_timeout(),
        }
        device.release_delayed();
    }
    debug!("Worker of {} exited.", shared.name());
}

impl Device {
    /// Runs `io` on the pool and queues its result for the worker.
    pub fn spawn_io<F>(&self, io: F)
    where
        F: Future<Output = IoEntry> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.pool.spawn_ok(async move {
            let entry = io.await;
            shared.complete(entry);
        });
    }

    fn gone(&self) -> Error {
        ErrorKind::DeviceGone(self.config.name.clone()).into()
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::AddDisk {
                backend,
                options,
                reply,
            } => {
                let result = if self.destroying.is_some() {
                    Err(self.gone())
                } else {
                    self.add_disk(Arc::clone(&backend), options)
                };
                if let Err(ref e) = result {
                    warn!(
                        "Device {}: cannot add {}: {}",
                        self.name(),
                        backend.id(),
                        e
                    );
                }
                let _ = reply.send(result);
            }
            Event::RemoveDisk { id, removal, reply } => {
                let _ = reply.send(self.remove_disk(id, removal));
            }
            Event::Disconnect { id, reason } => self.disconnect(id, reason),
            Event::ForceSync { id, reply } => {
                let result = if self.destroying.is_some() {
                    Err(self.gone())
                } else {
                    self.force_sync(id)
                };
                let _ = reply.send(result);
            }
            Event::Configure { changes, reply } => {
                let _ = reply.send(self.configure(changes));
            }
            Event::Status { reply } => {
                let _ = reply.send(Ok(self.status()));
            }
            Event::Destroy { mode, reply } => self.destroy(mode, reply),
        }
    }

    fn handle_io(&mut self, entry: IoEntry) {
        match entry {
            IoEntry::Request(request) => self.dispatch(request),
            IoEntry::Regular(completion) => self.fold_regular(completion),
            IoEntry::Sync(completion) => self.on_sync_completion(completion),
        }
    }

    fn dispatch(&mut self, request: Request) {
        if self
            .destroying
            .as_ref()
            .map_or(false, |d| d.mode == DestroyMode::Hard)
        {
            let e = self.gone();
            request.answer(Err(e));
            return;
        }
        let provider = match self.provider {
            Some(provider) => provider,
            None => {
                let e = ErrorKind::NotPublished(self.config.name.clone()).into();
                request.answer(Err(e));
                return;
            }
        };
        if let IoKind::Flush = request.kind {
            self.start_flush(request);
            return;
        }
        let sector = u64::from(provider.sectorsize);
        let valid = request.length > 0
            && request.offset % sector == 0
            && request.length % sector == 0
            && request
                .offset
                .checked_add(request.length)
                .map_or(false, |end| end <= provider.mediasize);
        if !valid {
            let e = ErrorKind::InvalidRequest(request.offset, request.length).into();
            request.answer(Err(e));
            return;
        }
        match request.kind {
            IoKind::Read => self.start_read(request),
            _ => {
                if self.sync_collides(request.offset, request.length)
                    || self
                        .regular_delayed
                        .iter()
                        .any(|r| r.overlaps(request.offset, request.length))
                {
                    debug!(
                        "Device {}: {} [{}, +{}) delayed by synchronization.",
                        self.name(),
                        request.kind.name(),
                        request.offset,
                        request.length
                    );
                    self.regular_delayed.push_back(request);
                } else {
                    self.start_write(request);
                }
            }
        }
    }

    fn start_read(&mut self, request: Request) {
        let (offset, length) = (request.offset, request.length);
        let fragments = self.balancer.choose(
            self.config.balance,
            self.config.slice,
            self.sectorsize,
            &mut self.disks,
            offset,
            length,
        );
        if fragments.is_empty() {
            let e = ErrorKind::ReadFailed(self.config.name.clone()).into();
            request.answer(Err(e));
            return;
        }
        let id = self.next_request;
        self.next_request += 1;
        self.inflight.insert(id, Inflight::new(request, fragments.len()));
        for fragment in fragments {
            let backend = match self.disk_mut(fragment.disk) {
                Some(disk) => {
                    disk.inflight += 1;
                    disk.last_offset = fragment.offset + fragment.length;
                    disk.backend.as_ref().map(Arc::clone)
                }
                None => None,
            };
            trace!(
                "Device {}: read [{}, +{}) from disk {}.",
                self.name(),
                fragment.offset,
                fragment.length,
                fragment.disk
            );
            self.issue(
                id,
                fragment.disk,
                backend,
                IoKind::Read,
                fragment.offset,
                fragment.length,
            );
        }
    }

    /// Fans a write or delete out to every disk that has to see it.
    pub fn start_write(&mut self, request: Request) {
        self.prepare_write();
        let (offset, length) = (request.offset, request.length);
        let targets: Vec<DiskId> = self
            .disks
            .iter()
            .filter(|d| d.accepts_write(offset) && d.backend.is_some())
            .map(|d| d.id)
            .collect();
        if targets.is_empty() {
            let e = ErrorKind::WriteFailed(self.config.name.clone()).into();
            request.answer(Err(e));
            return;
        }
        let kind = request.kind.clone();
        let id = self.next_request;
        self.next_request += 1;
        self.inflight.insert(id, Inflight::new(request, targets.len()));
        for disk in targets {
            let backend = self.disk_mut(disk).and_then(|d| {
                d.inflight += 1;
                d.backend.as_ref().map(Arc::clone)
            });
            self.issue(id, disk, backend, kind.clone(), offset, length);
        }
    }

    fn start_flush(&mut self, request: Request) {
        let targets: Vec<DiskId> = self
            .disks
            .iter()
            .filter(|d| d.state == DiskState::Active && d.backend.is_some())
            .map(|d| d.id)
            .collect();
        if targets.is_empty() {
            let e = ErrorKind::FlushFailed(self.config.name.clone()).into();
            request.answer(Err(e));
            return;
        }
        let id = self.next_request;
        self.next_request += 1;
        self.inflight.insert(id, Inflight::new(request, targets.len()));
        for disk in targets {
            let backend = self.disk_mut(disk).and_then(|d| {
                d.inflight += 1;
                d.backend.as_ref().map(Arc::clone)
            });
            self.issue(id, disk, backend, IoKind::Flush, 0, 0);
        }
    }

    /// Sends one child of request `id` to `disk`.
    fn issue(
        &self,
        id: u64,
        disk: DiskId,
        backend: Option<Arc<dyn Backend>>,
        kind: IoKind,
        offset: u64,
        length: u64,
    ) {
        let backend = match backend {
            Some(backend) => backend,
            None => {
                self.shared.complete(IoEntry::Regular(RegularCompletion {
                    request: id,
                    disk,
                    offset,
                    length,
                    result: Err(vdev::ErrorKind::ReadError(format!("disk {}", disk)).into()),
                }));
                return;
            }
        };
        self.spawn_io(async move {
            let result = match kind {
                IoKind::Read => backend.read_raw(length as usize, offset).await.map(Some),
                IoKind::Write(data) => backend.write_raw(&data[..], offset).await.map(|()| None),
                IoKind::Delete => backend.delete(offset, length).await.map(|()| None),
                IoKind::Flush => backend.flush().map(|()| None),
            };
            IoEntry::Regular(RegularCompletion {
                request: id,
                disk,
                offset,
                length,
                result,
            })
        });
    }

    fn fold_regular(&mut self, completion: RegularCompletion) {
        let RegularCompletion {
            request: id,
            disk,
            offset,
            length,
            result,
        } = completion;
        if let Some(d) = self.disk_mut(disk) {
            d.inflight = d.inflight.saturating_sub(1);
        }
        let result = match result {
            Ok(Some(ref data)) if data.len() as u64 != length => {
                let backend = self
                    .disk(disk)
                    .map_or_else(|| disk.to_string(), |d| d.name.clone());
                warn!(
                    "Device {}: {} returned {} bytes for a read of {}.",
                    self.name(),
                    backend,
                    data.len(),
                    length
                );
                Err(vdev::ErrorKind::ReadError(backend).into())
            }
            result => result,
        };
        let error = match result {
            Ok(data) => {
                let entry = match self.inflight.get_mut(&id) {
                    Some(entry) => entry,
                    None => return,
                };
                entry.succeeded += 1;
                if let (Some(buffer), Some(data)) = (entry.buffer.as_mut(), data) {
                    let start = (offset - entry.request.offset) as usize;
                    buffer[start..start + data.len()].copy_from_slice(&data);
                }
                None
            }
            Err(e) => Some(e),
        };
        let done = match self.inflight.get_mut(&id) {
            Some(entry) => {
                if error.is_some() {
                    entry.failed.push(disk);
                }
                entry.pending -= 1;
                entry.pending == 0
            }
            None => return,
        };
        if let Some(e) = error {
            warn!(
                "Device {}: request to disk {} at {} failed: {}",
                self.name(),
                disk,
                offset,
                e
            );
        }
        if done {
            if let Some(entry) = self.inflight.remove(&id) {
                self.finish(entry);
            }
        }
    }

    /// Delivers the reply of a request whose children are all in.
    fn finish(&mut self, entry: Inflight) {
        let Inflight {
            mut request,
            succeeded,
            failed,
            buffer,
            ..
        } = entry;
        let name = self.config.name.clone();
        if let IoKind::Read = request.kind {
            if failed.is_empty() {
                let data = buffer.unwrap_or_default().into_boxed_slice();
                request.answer(Ok(data));
                return;
            }
            let retry = self.other_active(&failed) && request.retries < self.config.ndisks;
            self.absorb_failures(&failed);
            if retry {
                debug!(
                    "Device {}: retrying read [{}, +{}).",
                    name, request.offset, request.length
                );
                request.retries += 1;
                self.shared.complete(IoEntry::Request(request));
            } else {
                request.answer(Err(ErrorKind::ReadFailed(name).into()));
            }
            return;
        }

        self.absorb_failures(&failed);
        let result = if succeeded > 0 {
            Ok(Vec::new().into_boxed_slice())
        } else if let IoKind::Flush = request.kind {
            Err(ErrorKind::FlushFailed(name).into())
        } else {
            Err(ErrorKind::WriteFailed(name).into())
        };
        trace!(
            "Device {}: {} [{}, +{}) done, {} of {} children failed.",
            self.name(),
            request.kind.name(),
            request.offset,
            request.length,
            failed.len(),
            failed.len() + succeeded
        );
        request.answer(result);
    }

    /// Disconnects disks whose requests failed, as long as an active disk
    /// survives; otherwise only counts the error.
    fn absorb_failures(&mut self, failed: &[DiskId]) {
        let failsync = self.config.failsync;
        for &id in failed {
            let state = match self.disk(id) {
                Some(disk) => disk.state,
                None => continue,
            };
            let disconnect = match state {
                DiskState::Active => self.other_active(failed),
                DiskState::Synchronizing => failsync,
                _ => false,
            };
            if disconnect {
                self.disconnect(id, Reason::Io);
            } else if let Some(disk) = self.disk_mut(id) {
                disk.errors += 1;
            }
        }
    }
}
