//! The device entity and the disk and device state machines.
//!
//! Everything in here runs on the worker thread of its device. Backend I/O
//! is handed to the pool; metadata updates are written synchronously.

use super::balance::Balancer;
use super::config::Configuration;
use super::disk::{disk_order, Disk, DiskId, DiskOptions, DiskState, Removal, SyncState};
use super::errors::*;
use super::queue::{Event, IoEntry, Reason, Shared};
use super::request::{Inflight, Request, RequestId, SyncChunk};
use super::{DestroyMode, DiskStatus, Reconfigure, Status};
use crate::metadata::{self, DeviceFlags, DiskFlags, Metadata};
use crate::vdev::Backend;
use futures::channel::oneshot;
use futures::executor::ThreadPool;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hasher;
use std::sync::Arc;
use std::time::{Duration, Instant};
use twox_hash::XxHash64;

/// State of a mirror device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Waiting for its members to show up.
    Starting,
    /// Serving I/O, or about to once an active disk exists.
    Running,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            DeviceState::Starting => "STARTING",
            DeviceState::Running => "RUNNING",
        })
    }
}

/// Geometry of the published provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct ProviderInfo {
    pub mediasize: u64,
    pub sectorsize: u32,
    pub stripesize: u32,
}

/// Id bumps deferred to the next write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(super) struct PendingBump {
    pub genid: bool,
    pub syncid: bool,
}

/// Range of a synchronization chunk that is being read or written.
#[derive(Debug, Clone, Copy)]
pub(super) struct SyncRange {
    pub disk: DiskId,
    pub generation: u64,
    pub offset: u64,
    pub length: u64,
}

/// A pending device destruction.
pub(super) struct Destroying {
    pub mode: DestroyMode,
    pub waiters: Vec<oneshot::Sender<Result<()>>>,
}

/// One mirror device. Owned by its worker.
pub(super) struct Device {
    pub shared: Arc<Shared>,
    pub pool: ThreadPool,
    pub config: Configuration,
    pub id: u32,
    pub mediasize: u64,
    pub sectorsize: u32,
    pub genid: u32,
    pub syncid: u32,
    pub state: DeviceState,
    pub provider: Option<ProviderInfo>,
    pub pending_bump: PendingBump,
    /// Members in `disk_order`.
    pub disks: Vec<Disk>,
    next_seq: u64,
    pub balancer: Balancer,
    pub inflight: HashMap<RequestId, Inflight>,
    pub next_request: RequestId,
    /// Writes held back by the collision guard, in arrival order.
    pub regular_delayed: VecDeque<Request>,
    /// Synchronization chunks being read or written.
    pub sync_inflight: Vec<SyncRange>,
    /// Synchronization chunks held back by the collision guard.
    pub sync_delayed: VecDeque<SyncChunk>,
    pub next_sync_generation: u64,
    /// No write since the disks were last marked clean.
    pub idle: bool,
    pub last_write: Instant,
    first_disk_at: Option<Instant>,
    timed_out: bool,
    pub destroying: Option<Destroying>,
}

impl Device {
    pub fn new(shared: Arc<Shared>, pool: ThreadPool, config: Configuration, id: u32) -> Self {
        Device {
            shared,
            pool,
            id,
            mediasize: config.mediasize.unwrap_or(0),
            sectorsize: config.sectorsize.unwrap_or(0),
            config,
            genid: 0,
            syncid: 1,
            state: DeviceState::Starting,
            provider: None,
            pending_bump: PendingBump::default(),
            disks: Vec::new(),
            next_seq: 0,
            balancer: Balancer::default(),
            inflight: HashMap::new(),
            next_request: 0,
            regular_delayed: VecDeque::new(),
            sync_inflight: Vec::new(),
            sync_delayed: VecDeque::new(),
            next_sync_generation: 0,
            idle: true,
            last_write: Instant::now(),
            first_disk_at: None,
            timed_out: false,
            destroying: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn disk(&self, id: DiskId) -> Option<&Disk> {
        self.disks.iter().find(|d| d.id == id)
    }

    pub fn disk_mut(&mut self, id: DiskId) -> Option<&mut Disk> {
        self.disks.iter_mut().find(|d| d.id == id)
    }

    pub fn device_flags(&self) -> DeviceFlags {
        self.config.device_flags()
    }

    /// Number of disks in `state`.
    pub fn count(&self, state: DiskState) -> usize {
        self.disks.iter().filter(|d| d.state == state).count()
    }

    /// Returns true if an active disk other than those in `except` exists.
    pub fn other_active(&self, except: &[DiskId]) -> bool {
        self.disks
            .iter()
            .any(|d| d.state == DiskState::Active && !except.contains(&d.id))
    }

    fn members(&self) -> u32 {
        self.disks.iter().filter(|d| d.is_member()).count() as u32
    }

    fn sort_disks(&mut self) {
        self.disks.sort_by(disk_order);
    }

    /// Forgets all but the `ndisks` most recently attached disconnected
    /// disks.
    fn prune_tombstones(&mut self) {
        let mut tombstones: Vec<(u64, DiskId)> = self
            .disks
            .iter()
            .filter(|d| d.state == DiskState::Disconnected)
            .map(|d| (d.seq, d.id))
            .collect();
        let keep = self.config.ndisks as usize;
        if tombstones.len() <= keep {
            return;
        }
        tombstones.sort();
        let forget: Vec<DiskId> = tombstones[..tombstones.len() - keep]
            .iter()
            .map(|&(_, id)| id)
            .collect();
        debug!(
            "Device {}: forgetting disconnected disks {:?}.",
            self.name(),
            forget
        );
        self.disks.retain(|d| !forget.contains(&d.id));
    }

    /// Picks an unused, non-zero disk id.
    fn new_disk_id(&self, backend: &dyn Backend) -> DiskId {
        let mut salt = self.next_seq;
        loop {
            let mut hasher = XxHash64::with_seed(u64::from(self.id));
            hasher.write(backend.id().as_bytes());
            hasher.write_u64(salt);
            let id = hasher.finish() as DiskId;
            if id != 0 && self.disk(id).is_none() {
                return id;
            }
            salt = salt.wrapping_add(1);
        }
    }

    /// Deadline of the next timer: the discovery timeout while starting,
    /// the idle timeout while running with dirty disks.
    pub fn deadline(&self) -> Option<Instant> {
        if self.destroying.is_some() {
            return None;
        }
        match self.state {
            DeviceState::Starting => self
                .first_disk_at
                .map(|at| at + Duration::from_millis(self.config.discovery_timeout_ms)),
            DeviceState::Running if !self.idle => {
                Some(self.last_write + Duration::from_millis(self.config.idle_timeout_ms))
            }
            DeviceState::Running => None,
        }
    }

    pub fn on_timeout(&mut self) {
        let now = Instant::now();
        match self.state {
            DeviceState::Starting => {
                if self.disks.is_empty() {
                    self.first_disk_at = None;
                    return;
                }
                warn!(
                    "Device {}: discovery timed out with {} of {} disks.",
                    self.name(),
                    self.disks.len(),
                    self.config.ndisks
                );
                self.timed_out = true;
                self.update_device();
            }
            DeviceState::Running => {
                if self.idle {
                    return;
                }
                if self.inflight.values().any(|i| i.request.kind.modifies()) {
                    self.last_write = now;
                    return;
                }
                self.mark_idle();
            }
        }
    }

    /// Clears DIRTY on every active disk.
    fn mark_idle(&mut self) {
        debug!("Device {}: idle, marking disks clean.", self.name());
        self.idle = true;
        let ids: Vec<_> = self
            .disks
            .iter()
            .filter(|d| d.state == DiskState::Active && d.flags.contains(DiskFlags::DIRTY))
            .map(|d| d.id)
            .collect();
        for id in ids {
            if let Some(disk) = self.disk_mut(id) {
                disk.flags.remove(DiskFlags::DIRTY);
            }
            self.update_metadata(id);
        }
    }

    /// Applies pending id bumps and the first-write DIRTY mark before a
    /// write is fanned out.
    pub fn prepare_write(&mut self) {
        let mut changed = false;
        if self.pending_bump.syncid {
            self.pending_bump.syncid = false;
            self.syncid += 1;
            info!("Device {}: syncid bumped to {}.", self.name(), self.syncid);
            changed = true;
        }
        if self.pending_bump.genid {
            self.pending_bump.genid = false;
            self.genid += 1;
            info!("Device {}: genid bumped to {}.", self.name(), self.genid);
            changed = true;
        }
        if self.idle {
            self.idle = false;
            for disk in &mut self.disks {
                if disk.state == DiskState::Active || disk.state == DiskState::Synchronizing {
                    disk.flags.insert(DiskFlags::DIRTY);
                }
            }
            changed = true;
        }
        if changed {
            let ids: Vec<_> = self
                .disks
                .iter()
                .filter(|d| d.state == DiskState::Active || d.state == DiskState::Synchronizing)
                .map(|d| d.id)
                .collect();
            for id in ids {
                self.update_metadata(id);
            }
        }
        self.last_write = Instant::now();
    }

    fn build_metadata(&self, disk: &Disk, backend: &dyn Backend) -> Metadata {
        let mut md = Metadata::new(&self.config.name);
        md.mirror_id = self.id;
        md.disk_id = disk.id;
        md.ndisks = self.config.ndisks;
        md.genid = disk.genid;
        md.syncid = disk.syncid;
        md.dflags = disk.flags;
        md.mflags = self.device_flags();
        md.sync_offset = disk.sync.as_ref().map_or(0, |s| s.offset_done);
        md.priority = disk.priority;
        md.balance = self.config.balance;
        md.slice = self.config.slice;
        md.mediasize = self.mediasize;
        md.sectorsize = self.sectorsize;
        md.provsize = backend.size();
        md
    }

    /// Writes the metadata of disk `id`. A failure marks the disk BROKEN;
    /// a second failure in a row disconnects it.
    pub fn update_metadata(&mut self, id: DiskId) {
        let (genid, syncid) = (self.genid, self.syncid);
        let backend = match self.disk_mut(id) {
            Some(disk) => {
                if disk.state == DiskState::Active || disk.state == DiskState::Synchronizing {
                    disk.genid = genid;
                    disk.syncid = syncid;
                }
                match disk.backend {
                    Some(ref backend) => Arc::clone(backend),
                    None => return,
                }
            }
            None => return,
        };
        let md = match self.disk(id) {
            Some(disk) => self.build_metadata(disk, &*backend),
            None => return,
        };
        let result = metadata::write_metadata(&*backend, &md);

        let name = self.config.name.clone();
        let mut disconnect = false;
        if let Some(disk) = self.disk_mut(id) {
            match result {
                Ok(()) => {
                    trace!("Device {}: metadata of {} updated.", name, disk.name);
                    disk.flags.remove(DiskFlags::BROKEN);
                }
                Err(e) => {
                    warn!(
                        "Device {}: cannot update metadata of {}: {}",
                        name, disk.name, e
                    );
                    if disk.flags.contains(DiskFlags::BROKEN) {
                        disconnect = true;
                    } else {
                        disk.flags.insert(DiskFlags::BROKEN);
                    }
                }
            }
        }
        if disconnect {
            self.shared.post_event(Event::Disconnect {
                id,
                reason: Reason::Metadata,
            });
        }
    }

    /// Attaches `backend` as a new disk.
    pub fn add_disk(&mut self, backend: Arc<dyn Backend>, options: DiskOptions) -> Result<DiskId> {
        let backend_id = backend.id().to_string();
        let tombstone = match self.disks.iter().find(|d| d.name == backend_id) {
            Some(disk) if disk.state == DiskState::Disconnected => Some(disk.id),
            Some(_) => bail!(ErrorKind::DuplicateDisk(backend_id)),
            None => None,
        };

        if self.sectorsize == 0 {
            self.sectorsize = backend.sector_size();
        }
        if backend.sector_size() == 0 || self.sectorsize % backend.sector_size() != 0 {
            bail!(ErrorKind::Configuration(format!(
                "sector size {} of {} does not divide the mirror's {}",
                backend.sector_size(),
                backend_id,
                self.sectorsize
            )));
        }
        let reserved = metadata::reserved_size(backend.sector_size());
        let usable = backend.size().saturating_sub(reserved);

        let md = if options.insert {
            None
        } else {
            metadata::taste(&*backend)
        };
        let md = match md {
            Some(md) => {
                if md.name() != self.config.name || md.mirror_id != self.id {
                    bail!(ErrorKind::ForeignDisk(backend_id, md.name()));
                }
                Some(md)
            }
            None => None,
        };

        let id = match md {
            Some(md) => self.attach_labelled(backend, options, md, usable)?,
            None => self.attach_blank(backend, options, usable)?,
        };
        if let Some(tombstone) = tombstone {
            if tombstone != id {
                self.disks.retain(|d| d.id != tombstone);
            }
        }
        self.settle_new(id);
        Ok(id)
    }

    fn check_size(&self, backend: &str, usable: u64) -> Result<()> {
        if usable < self.mediasize || usable == 0 {
            bail!(ErrorKind::DiskTooSmall(
                backend.to_string(),
                usable,
                self.mediasize
            ));
        }
        Ok(())
    }

    fn attach_labelled(
        &mut self,
        backend: Arc<dyn Backend>,
        options: DiskOptions,
        md: Metadata,
        usable: u64,
    ) -> Result<DiskId> {
        let backend_id = backend.id().to_string();
        let replaces = match self.disk(md.disk_id) {
            Some(disk) if disk.state == DiskState::Disconnected => true,
            Some(_) => bail!(ErrorKind::DuplicateDisk(backend_id)),
            None => false,
        };
        if self.members() >= self.config.ndisks {
            bail!(ErrorKind::TooManyDisks(self.config.ndisks));
        }
        if self.mediasize == 0 {
            self.mediasize = md.mediasize;
        }
        self.check_size(&backend_id, usable)?;
        if self.state == DeviceState::Running {
            if md.genid < self.genid {
                warn!(
                    "Device {}: {} is from generation {}, current is {}.",
                    self.name(),
                    backend_id,
                    md.genid,
                    self.genid
                );
                bail!(ErrorKind::StaleGeneration(backend_id, md.genid, self.genid));
            }
            if md.genid > self.genid || md.syncid > self.syncid {
                warn!(
                    "Device {}: {} (genid {}, syncid {}) is fresher than the running device \
                     (genid {}, syncid {}), not connecting it.",
                    self.name(),
                    backend_id,
                    md.genid,
                    md.syncid,
                    self.genid,
                    self.syncid
                );
                bail!(ErrorKind::FresherDisk(backend_id));
            }
        }

        if replaces {
            self.disks.retain(|d| d.id != md.disk_id);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let priority = options.priority.unwrap_or(md.priority);
        let mut disk = Disk::new(md.disk_id, backend, priority, seq);
        disk.genid = md.genid;
        disk.syncid = md.syncid;
        disk.flags = md.dflags;
        disk.flags.remove(DiskFlags::BROKEN);
        disk.flags.remove(DiskFlags::INACTIVE);
        disk.flags.set(
            DiskFlags::HARDCODED,
            options.hardcoded || md.dflags.contains(DiskFlags::HARDCODED),
        );
        disk.recorded_sync_offset = md.sync_offset;
        let id = disk.id;
        info!(
            "Device {}: disk {} attached (genid {}, syncid {}, flags {}).",
            self.name(),
            disk.name,
            disk.genid,
            disk.syncid,
            disk.flags
        );
        self.insert_disk(disk);
        Ok(id)
    }

    fn attach_blank(
        &mut self,
        backend: Arc<dyn Backend>,
        options: DiskOptions,
        usable: u64,
    ) -> Result<DiskId> {
        let backend_id = backend.id().to_string();
        let running = self.state == DeviceState::Running;
        let grow = self.members() >= self.config.ndisks;
        if grow && !running {
            bail!(ErrorKind::TooManyDisks(self.config.ndisks));
        }
        if self.mediasize == 0 {
            let sector = u64::from(self.sectorsize);
            self.mediasize = self.config.mediasize.unwrap_or(usable / sector * sector);
        }
        self.check_size(&backend_id, usable)?;

        let id = self.new_disk_id(&*backend);
        let seq = self.next_seq;
        self.next_seq += 1;
        let mut disk = Disk::new(id, Arc::clone(&backend), options.priority.unwrap_or(0), seq);
        disk.genid = self.genid;
        disk.flags.set(DiskFlags::HARDCODED, options.hardcoded);
        if running {
            disk.syncid = 0;
            disk.flags.insert(DiskFlags::FORCE_SYNC);
        } else {
            disk.syncid = self.syncid;
        }
        info!(
            "Device {}: labelling {} as disk {}.",
            self.name(),
            backend_id,
            id
        );
        if grow {
            self.config.ndisks += 1;
        }
        let md = self.build_metadata(&disk, &*backend);
        if let Err(e) = metadata::write_metadata(&*backend, &md) {
            if grow {
                self.config.ndisks -= 1;
            }
            return Err(e.into());
        }
        self.insert_disk(disk);
        Ok(id)
    }

    fn insert_disk(&mut self, mut disk: Disk) {
        disk.state = DiskState::New;
        self.disks.push(disk);
        self.sort_disks();
        if self.first_disk_at.is_none() {
            self.first_disk_at = Some(Instant::now());
        }
    }

    /// Lets a freshly inserted disk take part in the device.
    pub fn settle_new(&mut self, id: DiskId) {
        match self.state {
            DeviceState::Starting => self.update_device(),
            DeviceState::Running => {
                self.determine_state(id);
                self.update_device();
            }
        }
    }

    /// Decides what a NEW disk of a running device becomes.
    pub fn determine_state(&mut self, id: DiskId) {
        let autosync = self.config.autosync;
        let syncid = self.syncid;
        let state = match self.disk(id) {
            Some(disk) => {
                let needs_sync = disk.syncid < syncid
                    || disk.flags.contains(DiskFlags::SYNCHRONIZING)
                    || disk.flags.contains(DiskFlags::FORCE_SYNC);
                if !needs_sync {
                    DiskState::Active
                } else if !autosync && !disk.flags.contains(DiskFlags::FORCE_SYNC) {
                    DiskState::Stale
                } else {
                    DiskState::Synchronizing
                }
            }
            None => return,
        };
        self.set_disk_state(id, state);
    }

    /// Moves disk `id` into `state` and performs the transition's work.
    pub fn set_disk_state(&mut self, id: DiskId, state: DiskState) {
        let name = self.config.name.clone();
        let (genid, syncid) = (self.genid, self.syncid);
        let generation = self.next_sync_generation;
        let published = self.provider.is_some();
        let old = {
            let disk = match self.disk_mut(id) {
                Some(disk) => disk,
                None => return,
            };
            let old = disk.state;
            if old == state {
                return;
            }
            info!(
                "Device {}: disk {} state changed from {} to {}.",
                name, disk.name, old, state
            );
            old
        };
        match state {
            DiskState::Active => {
                if let Some(disk) = self.disk_mut(id) {
                    disk.state = DiskState::Active;
                    disk.flags.remove(DiskFlags::SYNCHRONIZING);
                    disk.flags.remove(DiskFlags::FORCE_SYNC);
                    disk.sync = None;
                    disk.recorded_sync_offset = 0;
                }
                self.update_metadata(id);
            }
            DiskState::Synchronizing => {
                self.next_sync_generation += 1;
                if let Some(disk) = self.disk_mut(id) {
                    let resume = disk.flags.contains(DiskFlags::SYNCHRONIZING)
                        && !disk.flags.contains(DiskFlags::FORCE_SYNC)
                        && disk.syncid == syncid
                        && disk.genid == genid;
                    let offset = if resume { disk.recorded_sync_offset } else { 0 };
                    disk.state = DiskState::Synchronizing;
                    disk.flags.insert(DiskFlags::SYNCHRONIZING);
                    disk.flags.remove(DiskFlags::FORCE_SYNC);
                    disk.sync = Some(SyncState {
                        offset,
                        offset_done: offset,
                        inflight: 0,
                        completed: 0,
                        generation,
                    });
                    if offset > 0 {
                        info!(
                            "Device {}: resuming synchronization of {} at {}.",
                            name, disk.name, offset
                        );
                    }
                }
                self.update_metadata(id);
                if published {
                    self.sync_fill(id);
                }
            }
            DiskState::Stale => {
                if let Some(disk) = self.disk_mut(id) {
                    disk.state = DiskState::Stale;
                    disk.sync = None;
                    disk.genid = genid;
                }
                self.update_metadata(id);
            }
            DiskState::Disconnected => {
                self.stop_sync(id);
                if let Some(disk) = self.disk_mut(id) {
                    disk.state = DiskState::Disconnected;
                    disk.sync = None;
                    disk.inflight = 0;
                    disk.close();
                }
                if old != DiskState::New {
                    self.pending_bump.genid = true;
                }
                self.prune_tombstones();
            }
            DiskState::Destroy => {
                self.stop_sync(id);
                if let Some(disk) = self.disk_mut(id) {
                    disk.state = DiskState::Destroy;
                    if let Some(ref backend) = disk.backend {
                        if let Err(e) = metadata::clear_metadata(&**backend) {
                            warn!("Device {}: cannot clear metadata of {}: {}", name, disk.name, e);
                        }
                    }
                    disk.close();
                }
                self.disks.retain(|d| d.id != id);
                self.config.ndisks = self.config.ndisks.saturating_sub(1);
                let ids: Vec<_> = self
                    .disks
                    .iter()
                    .filter(|d| d.backend.is_some())
                    .map(|d| d.id)
                    .collect();
                for id in ids {
                    self.update_metadata(id);
                }
            }
            DiskState::None | DiskState::New => {
                if let Some(disk) = self.disk_mut(id) {
                    disk.state = state;
                }
            }
        }
    }

    /// Re-evaluates the device after a disk event.
    pub fn update_device(&mut self) {
        match self.state {
            DeviceState::Starting => self.try_start(),
            DeviceState::Running => {
                let active = self.count(DiskState::Active);
                let new = self.count(DiskState::New);
                if active == 0 && new == 0 {
                    if self.destroying.is_none() {
                        warn!("Device {}: no active disks left.", self.name());
                        self.destroy_provider();
                        self.destroying = Some(Destroying {
                            mode: DestroyMode::Hard,
                            waiters: Vec::new(),
                        });
                        self.fail_queued();
                    }
                    return;
                }
                if active > 0 && self.provider.is_none() {
                    self.launch_provider();
                }
            }
        }
    }

    /// Decides which disks start the device, once all of them are present
    /// or the discovery timeout fired.
    fn try_start(&mut self) {
        let present = self.disks.len() as u32;
        if present == 0 || (present < self.config.ndisks && !self.timed_out) {
            return;
        }

        let max_genid = self.disks.iter().map(|d| d.genid).max().unwrap_or(0);
        let outdated: Vec<_> = self
            .disks
            .iter()
            .filter(|d| d.genid < max_genid)
            .map(|d| (d.id, d.name.clone(), d.genid))
            .collect();
        for (id, name, genid) in outdated {
            warn!(
                "Device {}: discarding {} (genid {} < {}).",
                self.name(),
                name,
                genid,
                max_genid
            );
            if let Some(disk) = self.disk_mut(id) {
                disk.close();
            }
            self.disks.retain(|d| d.id != id);
        }
        self.genid = max_genid;

        let max_syncid = self.disks.iter().map(|d| d.syncid).max().unwrap_or(0);
        self.syncid = max_syncid;
        let pending = DiskFlags(DiskFlags::SYNCHRONIZING.0 | DiskFlags::FORCE_SYNC.0);
        let mut candidates: Vec<DiskId> = self
            .disks
            .iter()
            .filter(|d| d.syncid == max_syncid && d.flags.0 & pending.0 == 0)
            .map(|d| d.id)
            .collect();
        if candidates.is_empty() {
            // Every up-to-date disk was in the middle of a synchronization.
            if let Some(disk) = self.disks.iter_mut().find(|d| d.syncid == max_syncid) {
                warn!(
                    "Device {}: no complete disk, using {} as source.",
                    self.config.name, disk.name
                );
                disk.flags.remove(pending);
                candidates.push(disk.id);
            }
        }
        let dirty: Vec<DiskId> = candidates
            .iter()
            .cloned()
            .filter(|&id| {
                self.disk(id)
                    .map_or(false, |d| d.flags.contains(DiskFlags::DIRTY))
            })
            .collect();
        let forced: Vec<DiskId> = if dirty.len() == candidates.len() && candidates.len() > 1 {
            // Disks are in priority order; the first one wins.
            info!(
                "Device {}: all disks dirty, {} is authoritative.",
                self.name(),
                self.disk(candidates[0]).map_or("?", |d| d.name.as_str())
            );
            candidates[1..].to_vec()
        } else if dirty.len() < candidates.len() {
            dirty
        } else {
            Vec::new()
        };
        for id in forced {
            if let Some(disk) = self.disk_mut(id) {
                disk.flags.insert(DiskFlags::FORCE_SYNC);
            }
        }

        if (self.disks.len() as u32) < self.config.ndisks {
            self.pending_bump.genid = true;
        }
        self.pending_bump.syncid = true;
        self.state = DeviceState::Running;
        info!(
            "Device {} started (genid {}, syncid {}, {} of {} disks).",
            self.name(),
            self.genid,
            self.syncid,
            self.disks.len(),
            self.config.ndisks
        );

        let ids: Vec<_> = self.disks.iter().map(|d| d.id).collect();
        for id in ids {
            self.determine_state(id);
        }
        if self
            .disks
            .iter()
            .any(|d| d.state == DiskState::Active && d.flags.contains(DiskFlags::DIRTY))
        {
            self.idle = false;
            self.last_write = Instant::now();
        }
        self.update_device();
    }

    fn launch_provider(&mut self) {
        let sectorsize = self
            .disks
            .iter()
            .filter(|d| d.is_member())
            .filter_map(|d| d.backend.as_ref())
            .map(|b| b.sector_size())
            .fold(self.sectorsize, u32::max);
        let stripesize = self
            .disks
            .iter()
            .filter(|d| d.is_member())
            .filter_map(|d| d.backend.as_ref())
            .map(|b| b.stripe_size())
            .max()
            .unwrap_or(0);
        self.sectorsize = sectorsize;
        self.provider = Some(ProviderInfo {
            mediasize: self.mediasize,
            sectorsize,
            stripesize,
        });
        info!(
            "Device {} launched ({}/{} active, {} bytes, sector {}).",
            self.name(),
            self.count(DiskState::Active),
            self.config.ndisks,
            self.mediasize,
            sectorsize
        );
        let syncing: Vec<_> = self
            .disks
            .iter()
            .filter(|d| d.state == DiskState::Synchronizing)
            .map(|d| d.id)
            .collect();
        for id in syncing {
            self.sync_fill(id);
        }
    }

    fn destroy_provider(&mut self) {
        if self.provider.take().is_some() {
            info!("Device {}: provider destroyed.", self.name());
        }
    }

    /// Disconnects disk `id` after a failure.
    pub fn disconnect(&mut self, id: DiskId, reason: Reason) {
        let state = match self.disk(id) {
            Some(disk) => disk.state,
            None => return,
        };
        if state == DiskState::Disconnected || state == DiskState::Destroy {
            return;
        }
        warn!(
            "Device {}: disconnecting disk {} ({:?}).",
            self.name(),
            self.disk(id).map_or("?", |d| d.name.as_str()),
            reason
        );
        self.set_disk_state(id, DiskState::Disconnected);
        self.update_device();
    }

    pub fn remove_disk(&mut self, id: DiskId, removal: Removal) -> Result<()> {
        let state = match self.disk(id) {
            Some(disk) => disk.state,
            None => bail!(ErrorKind::NoSuchDisk(id)),
        };
        if state == DiskState::Active && !self.other_active(&[id]) {
            bail!(ErrorKind::LastActiveDisk(id));
        }
        match removal {
            Removal::Disconnect => {
                if state == DiskState::Disconnected {
                    bail!(ErrorKind::InvalidDiskState(id, state.to_string()));
                }
                if let Some(disk) = self.disk_mut(id) {
                    disk.flags.insert(DiskFlags::INACTIVE);
                }
                self.update_metadata(id);
                self.set_disk_state(id, DiskState::Disconnected);
            }
            Removal::Destroy => self.set_disk_state(id, DiskState::Destroy),
        }
        if self.state == DeviceState::Starting {
            self.try_start();
        } else {
            self.update_device();
        }
        Ok(())
    }

    pub fn force_sync(&mut self, id: DiskId) -> Result<()> {
        let state = match self.disk(id) {
            Some(disk) => disk.state,
            None => bail!(ErrorKind::NoSuchDisk(id)),
        };
        match state {
            DiskState::Active => {
                if !self.other_active(&[id]) {
                    bail!(ErrorKind::LastActiveDisk(id));
                }
            }
            DiskState::Stale => {}
            _ => bail!(ErrorKind::InvalidDiskState(id, state.to_string())),
        }
        if let Some(disk) = self.disk_mut(id) {
            disk.flags.insert(DiskFlags::FORCE_SYNC);
        }
        self.set_disk_state(id, DiskState::Synchronizing);
        self.update_device();
        Ok(())
    }

    pub fn configure(&mut self, changes: Reconfigure) -> Result<()> {
        for &(id, _) in &changes.priorities {
            if self.disk(id).is_none() {
                bail!(ErrorKind::NoSuchDisk(id));
            }
        }
        let mut config = self.config.clone();
        if let Some(balance) = changes.balance {
            config.balance = balance;
        }
        if let Some(slice) = changes.slice {
            config.slice = slice;
        }
        if let Some(failsync) = changes.failsync {
            config.failsync = failsync;
        }
        let enable_autosync = changes.autosync == Some(true) && !config.autosync;
        if let Some(autosync) = changes.autosync {
            config.autosync = autosync;
        }
        config.validate()?;
        self.config = config;

        for (id, priority) in changes.priorities {
            if let Some(disk) = self.disk_mut(id) {
                disk.priority = priority;
            }
        }
        self.sort_disks();
        info!(
            "Device {}: reconfigured (balance {}, slice {}, autosync {}, failsync {}).",
            self.name(),
            self.config.balance,
            self.config.slice,
            self.config.autosync,
            self.config.failsync
        );
        let ids: Vec<_> = self
            .disks
            .iter()
            .filter(|d| d.backend.is_some())
            .map(|d| d.id)
            .collect();
        for id in ids {
            self.update_metadata(id);
        }
        if enable_autosync {
            let stale: Vec<_> = self
                .disks
                .iter()
                .filter(|d| d.state == DiskState::Stale)
                .map(|d| d.id)
                .collect();
            for id in stale {
                self.set_disk_state(id, DiskState::Synchronizing);
            }
        }
        Ok(())
    }

    pub fn status(&self) -> Status {
        Status {
            name: self.config.name.clone(),
            id: self.id,
            state: self.state,
            genid: self.genid,
            syncid: self.syncid,
            ndisks: self.config.ndisks,
            balance: self.config.balance,
            slice: self.config.slice,
            mediasize: self.mediasize,
            sectorsize: self.sectorsize,
            stripesize: self.provider.map_or(0, |p| p.stripesize),
            provider_published: self.provider.is_some(),
            disks: self
                .disks
                .iter()
                .map(|d| DiskStatus {
                    id: d.id,
                    backend: d.name.clone(),
                    state: d.state,
                    flags: d.flags,
                    priority: d.priority,
                    genid: d.genid,
                    syncid: d.syncid,
                    sync_offset: d.sync.as_ref().map(|s| s.offset_done),
                    stats: d.stats(),
                    errors: d.errors,
                })
                .collect(),
        }
    }

    /// Outstanding application requests, dispatched or delayed.
    pub fn outstanding(&self) -> usize {
        self.inflight.len() + self.regular_delayed.len()
    }

    /// Fails every application request that was not dispatched yet.
    pub fn fail_queued(&mut self) {
        let name = self.config.name.clone();
        let mut requests: Vec<_> = self.regular_delayed.drain(..).collect();
        requests.extend(self.shared.take_requests());
        for request in requests {
            request.answer(Err(ErrorKind::DeviceGone(name.clone()).into()));
        }
    }

    pub fn destroy(&mut self, mode: DestroyMode, reply: oneshot::Sender<Result<()>>) {
        if mode == DestroyMode::Soft
            && self.destroying.is_none()
            && (self.outstanding() > 0 || self.shared.io_pending())
        {
            let _ = reply.send(Err(ErrorKind::Busy(self.config.name.clone()).into()));
            return;
        }
        info!("Device {}: destroying ({:?}).", self.name(), mode);
        self.shared.stop_accepting();
        match self.destroying {
            Some(ref mut destroying) => {
                if mode == DestroyMode::Hard {
                    destroying.mode = mode;
                }
                destroying.waiters.push(reply);
            }
            None => {
                self.destroying = Some(Destroying {
                    mode,
                    waiters: vec![reply],
                })
            }
        }
        if mode == DestroyMode::Hard {
            self.fail_queued();
        }
    }

    /// Returns true once a pending destruction can be carried out.
    pub fn ready_to_destroy(&self) -> bool {
        self.destroying.is_some() && self.outstanding() == 0 && !self.shared.io_pending()
    }

    /// Stops synchronization, marks the disks clean and releases them.
    pub fn teardown(&mut self) {
        info!("Device {}: tearing down.", self.name());
        self.destroy_provider();
        self.sync_delayed.clear();
        self.sync_inflight.clear();
        let ids: Vec<_> = self
            .disks
            .iter()
            .filter(|d| d.backend.is_some())
            .map(|d| d.id)
            .collect();
        for id in ids {
            if let Some(disk) = self.disk_mut(id) {
                if disk.state == DiskState::Active {
                    disk.flags.remove(DiskFlags::DIRTY);
                }
            }
            self.update_metadata(id);
            if let Some(disk) = self.disk_mut(id) {
                disk.close();
            }
        }

        let name = self.config.name.clone();
        let (events, entries) = self.shared.close();
        drop(events);
        for entry in entries {
            if let IoEntry::Request(request) = entry {
                request.answer(Err(ErrorKind::DeviceGone(name.clone()).into()));
            }
        }
        if let Some(destroying) = self.destroying.take() {
            for waiter in destroying.waiters {
                let _ = waiter.send(Ok(()));
            }
        }
    }
}
