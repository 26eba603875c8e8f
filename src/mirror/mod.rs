//! A RAID-1 device mirroring its data onto a set of backends.
//!
//! Every `Mirror` owns one worker thread. All state changes of the device
//! (disks appearing, failing and being synchronized) and all I/O dispatch
//! happen on that thread; the public methods only queue events and
//! requests and wait for the answer. Backend I/O runs on a small thread
//! pool and reports back through the same queue.
//!
//! ```no_run
//! # use mirror_storage_stack::mirror::{Balance, Configuration, DiskOptions, Mirror};
//! # use mirror_storage_stack::vdev::File;
//! # use std::sync::Arc;
//! # fn main() -> mirror_storage_stack::mirror::Result<()> {
//! let mirror = Mirror::create(Configuration::new("gm0", 2, Balance::Load))?;
//! for path in &["/dev/sdb", "/dev/sdc"] {
//!     mirror.add_disk(Arc::new(File::open(path)?), DiskOptions::default())?;
//! }
//! mirror.write(vec![0; 4096], 0)?;
//! # Ok(())
//! # }
//! ```

use crate::metadata::{self, DeviceFlags, DiskFlags};
use crate::vdev::{Backend, Statistics};
use futures::channel::oneshot;
use futures::executor::{block_on, ThreadPool};
use itertools::Itertools;
use std::fmt;
use std::future::Future;
use std::hash::Hasher;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;
use std::time::SystemTime;
use twox_hash::XxHash64;

mod balance;
mod config;
mod disk;
mod errors;
mod queue;
mod request;
mod state;
mod sync;
mod worker;

#[cfg(test)]
mod tests;

pub use self::config::{Balance, Configuration};
pub use self::disk::{DiskId, DiskOptions, DiskState, Removal};
pub use self::errors::*;
pub use self::state::DeviceState;

use self::queue::{Event, Shared};
use self::request::{IoKind, Request};
use self::state::Device;

/// How `Mirror::destroy` treats outstanding I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyMode {
    /// Refuse with `Busy` while requests are queued or in flight.
    Soft,
    /// Reject new requests and wait for outstanding ones.
    Delayed,
    /// Fail queued requests and wait only for those already dispatched.
    Hard,
}

/// Changes applied by `Mirror::configure`. `None` keeps a setting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconfigure {
    /// Read balance strategy.
    pub balance: Option<Balance>,
    /// Split threshold of `Balance::Split`.
    pub slice: Option<u32>,
    /// Synchronize out-of-date disks automatically; enabling it starts
    /// synchronizing every STALE disk.
    pub autosync: Option<bool>,
    /// Disconnect a synchronizing disk when synchronization fails.
    pub failsync: Option<bool>,
    /// New priorities of individual disks.
    pub priorities: Vec<(DiskId, u32)>,
}

/// Snapshot of one disk.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskStatus {
    /// Disk id.
    pub id: DiskId,
    /// Id of the backend.
    pub backend: String,
    /// State of the disk.
    pub state: DiskState,
    /// Disk flags.
    pub flags: DiskFlags,
    /// Priority; higher is preferred.
    pub priority: u32,
    /// Generation id last written to the disk.
    pub genid: u32,
    /// Synchronization id last written to the disk.
    pub syncid: u32,
    /// Offset up to which a running synchronization is complete.
    pub sync_offset: Option<u64>,
    /// Backend statistics.
    pub stats: Statistics,
    /// Errors tolerated without disconnecting the disk.
    pub errors: u32,
}

/// Snapshot of a mirror device.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    /// Device name.
    pub name: String,
    /// Device id.
    pub id: u32,
    /// Device state.
    pub state: DeviceState,
    /// Current generation id.
    pub genid: u32,
    /// Current synchronization id.
    pub syncid: u32,
    /// Configured number of members.
    pub ndisks: u32,
    /// Read balance strategy.
    pub balance: Balance,
    /// Split threshold.
    pub slice: u32,
    /// Size of the device in bytes.
    pub mediasize: u64,
    /// Sector size of the device in bytes.
    pub sectorsize: u32,
    /// Preferred I/O size of the published device, 0 if no member reports
    /// one.
    pub stripesize: u32,
    /// Whether the device accepts I/O.
    pub provider_published: bool,
    /// All disks in priority order.
    pub disks: Vec<DiskStatus>,
}

impl Status {
    /// Returns the disk with id `id`.
    pub fn disk(&self, id: DiskId) -> Option<&DiskStatus> {
        self.disks.iter().find(|d| d.id == id)
    }

    /// Returns the disk living on backend `backend`.
    pub fn disk_by_backend(&self, backend: &str) -> Option<&DiskStatus> {
        self.disks.iter().find(|d| d.backend == backend)
    }
}

impl fmt::Display for DiskStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({}", self.backend, self.state)?;
        if let Some(offset) = self.sync_offset {
            write!(f, " at {}", offset)?;
        }
        write!(f, ", {})", self.flags)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "{} {} genid {} syncid {} balance {} [{}/{}]",
            self.name,
            self.state,
            self.genid,
            self.syncid,
            self.balance,
            self.disks
                .iter()
                .filter(|d| d.state == DiskState::Active)
                .count(),
            self.ndisks
        )?;
        write!(f, "  {}", self.disks.iter().join("\n  "))
    }
}

/// The answer to a request submitted to a `Mirror`.
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<Box<[u8]>>>,
    name: String,
    map: fn(Box<[u8]>) -> T,
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result.map(this.map)),
            Poll::Ready(Err(_)) => {
                Poll::Ready(Err(ErrorKind::DeviceGone(this.name.clone()).into()))
            }
        }
    }
}

/// Handle of a mirror device.
///
/// Dropping the handle destroys the device the hard way.
pub struct Mirror {
    shared: Arc<Shared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Mirror {
    /// Creates a new, empty device. It starts once `config.ndisks` disks
    /// have been added or the discovery timeout fired.
    pub fn create(config: Configuration) -> Result<Self> {
        config.validate()?;
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(config.name.as_bytes());
        if let Ok(now) = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
            hasher.write_u128(now.as_nanos());
        }
        let id = (hasher.finish() as u32).max(1);
        Self::spawn(config, id)
    }

    /// Assembles a device from backends carrying its metadata.
    ///
    /// The first backend with valid metadata defines which device is
    /// assembled. Backends without metadata or belonging to another device
    /// are skipped. The runtime settings of `settings` are kept; identity,
    /// member count and policy come from the metadata.
    pub fn open(settings: Configuration, backends: Vec<Arc<dyn Backend>>) -> Result<Self> {
        let mut identity: Option<metadata::Metadata> = None;
        let mut members = Vec::new();
        for backend in backends {
            let md = match metadata::taste(&*backend) {
                Some(md) => md,
                None => {
                    info!("Skipping {}: no mirror metadata.", backend.id());
                    continue;
                }
            };
            if let Some(ref first) = identity {
                if first.name() != md.name() || first.mirror_id != md.mirror_id {
                    warn!(
                        "Skipping {}: belongs to mirror {}, not {}.",
                        backend.id(),
                        md.name(),
                        first.name()
                    );
                    continue;
                }
            } else {
                identity = Some(md);
            }
            members.push(backend);
        }
        let md = match identity {
            Some(md) => md,
            None => bail!(ErrorKind::Configuration(String::from(
                "no backend carries mirror metadata"
            ))),
        };

        let mut config = settings;
        config.name = md.name();
        config.ndisks = md.ndisks;
        config.balance = md.balance;
        config.slice = md.slice;
        config.autosync = !md.mflags.contains(DeviceFlags::NOAUTOSYNC);
        config.failsync = !md.mflags.contains(DeviceFlags::NOFAILSYNC);
        config.mediasize = Some(md.mediasize);
        config.sectorsize = Some(md.sectorsize);
        config.validate()?;

        let mirror = Self::spawn(config, md.mirror_id)?;
        for backend in members {
            let id = backend.id().to_string();
            if let Err(e) = mirror.add_disk(backend, DiskOptions::default()) {
                warn!("Cannot assemble {}: {}", id, e);
            }
        }
        Ok(mirror)
    }

    fn spawn(config: Configuration, id: u32) -> Result<Self> {
        let pool = ThreadPool::builder()
            .pool_size(config.io_threads)
            .name_prefix(format!("g_mirror {} io", config.name))
            .create()?;
        let shared = Arc::new(Shared::new(config.name.clone()));
        let device = Device::new(Arc::clone(&shared), pool, config, id);
        let worker = thread::Builder::new()
            .name(format!("g_mirror {}", shared.name()))
            .spawn(move || worker::run(device))?;
        Ok(Mirror {
            shared,
            worker: Some(worker),
        })
    }

    /// Returns the name of the device.
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    fn call<T>(&self, event: impl FnOnce(oneshot::Sender<Result<T>>) -> Event) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.shared.post_event(event(tx));
        match block_on(rx) {
            Ok(result) => result,
            Err(oneshot::Canceled) => Err(ErrorKind::DeviceGone(self.name().to_string()).into()),
        }
    }

    /// Attaches `backend` to the device and returns the id of the new disk.
    pub fn add_disk(&self, backend: Arc<dyn Backend>, options: DiskOptions) -> Result<DiskId> {
        self.call(|reply| Event::AddDisk {
            backend,
            options,
            reply,
        })
    }

    /// Removes disk `id` from the device.
    pub fn remove_disk(&self, id: DiskId, removal: Removal) -> Result<()> {
        self.call(|reply| Event::RemoveDisk { id, removal, reply })
    }

    /// Rebuilds disk `id` from scratch.
    pub fn force_sync(&self, id: DiskId) -> Result<()> {
        self.call(|reply| Event::ForceSync { id, reply })
    }

    /// Changes the policy of the device.
    pub fn configure(&self, changes: Reconfigure) -> Result<()> {
        self.call(|reply| Event::Configure { changes, reply })
    }

    /// Returns a snapshot of the device.
    pub fn status(&self) -> Result<Status> {
        self.call(|reply| Event::Status { reply })
    }

    /// Destroys the device.
    pub fn destroy(&self, mode: DestroyMode) -> Result<()> {
        self.call(|reply| Event::Destroy { mode, reply })
    }

    fn submit<T>(
        &self,
        kind: IoKind,
        offset: u64,
        length: u64,
        map: fn(Box<[u8]>) -> T,
    ) -> Pending<T> {
        let (tx, rx) = oneshot::channel();
        self.shared.submit(Request::new(kind, offset, length, tx));
        Pending {
            rx,
            name: self.name().to_string(),
            map,
        }
    }

    /// Queues a read of `len` bytes at `offset`.
    pub fn read_async(&self, offset: u64, len: u64) -> Pending<Box<[u8]>> {
        self.submit(IoKind::Read, offset, len, |data| data)
    }

    /// Queues a write of `data` at `offset`.
    pub fn write_async<B: Into<Box<[u8]>>>(&self, data: B, offset: u64) -> Pending<()> {
        let data: Arc<[u8]> = Arc::from(data.into());
        let len = data.len() as u64;
        self.submit(IoKind::Write(data), offset, len, |_| ())
    }

    /// Queues a discard of `len` bytes at `offset`.
    pub fn delete_async(&self, offset: u64, len: u64) -> Pending<()> {
        self.submit(IoKind::Delete, offset, len, |_| ())
    }

    /// Queues a flush of every active disk.
    pub fn flush_async(&self) -> Pending<()> {
        self.submit(IoKind::Flush, 0, 0, |_| ())
    }

    /// Reads `len` bytes at `offset`.
    pub fn read(&self, offset: u64, len: u64) -> Result<Box<[u8]>> {
        block_on(self.read_async(offset, len))
    }

    /// Writes `data` at `offset`.
    pub fn write<B: Into<Box<[u8]>>>(&self, data: B, offset: u64) -> Result<()> {
        block_on(self.write_async(data, offset))
    }

    /// Discards `len` bytes at `offset`.
    pub fn delete(&self, offset: u64, len: u64) -> Result<()> {
        block_on(self.delete_async(offset, len))
    }

    /// Flushes every active disk.
    pub fn flush(&self) -> Result<()> {
        block_on(self.flush_async())
    }
}

impl Drop for Mirror {
    fn drop(&mut self) {
        let (tx, _rx) = oneshot::channel();
        self.shared.post_event(Event::Destroy {
            mode: DestroyMode::Hard,
            reply: tx,
        });
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Worker of {} panicked.", self.name());
            }
        }
    }
}
