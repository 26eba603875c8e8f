//! The event queue and the I/O queue feeding a mirror's worker.
//!
//! Both queues live behind one lock so that the worker can check them and
//! go to sleep atomically. Submitters and backend completions only ever
//! push; the worker is the only consumer.

use super::disk::{DiskId, DiskOptions, Removal};
use super::errors::*;
use super::request::{RegularCompletion, Request, SyncCompletion};
use super::{DestroyMode, Reconfigure, Status};
use crate::vdev::Backend;
use futures::channel::oneshot;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

/// Why a disk is being disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Reason {
    /// A regular request failed on it.
    Io,
    /// Its metadata could not be written twice in a row.
    Metadata,
    /// Synchronization onto it failed.
    Sync,
    /// A synchronization read from it failed.
    SyncSource,
}

/// A state-change request for the worker.
pub(super) enum Event {
    AddDisk {
        backend: Arc<dyn Backend>,
        options: DiskOptions,
        reply: oneshot::Sender<Result<DiskId>>,
    },
    RemoveDisk {
        id: DiskId,
        removal: Removal,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        id: DiskId,
        reason: Reason,
    },
    ForceSync {
        id: DiskId,
        reply: oneshot::Sender<Result<()>>,
    },
    Configure {
        changes: Reconfigure,
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        reply: oneshot::Sender<Result<Status>>,
    },
    Destroy {
        mode: DestroyMode,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// An entry of the I/O queue.
pub(super) enum IoEntry {
    Request(Request),
    Regular(RegularCompletion),
    Sync(SyncCompletion),
}

/// What the worker has to do next.
pub(super) enum Work {
    Event(Event),
    Io(IoEntry),
    Timeout,
}

struct Queues {
    events: VecDeque<Event>,
    io: VecDeque<IoEntry>,
    accepting: bool,
    closed: bool,
}

/// State shared between a `Mirror` handle, its worker and its completions.
pub(super) struct Shared {
    name: String,
    queues: Mutex<Queues>,
    wakeup: Condvar,
}

impl Shared {
    pub fn new(name: String) -> Self {
        Shared {
            name,
            queues: Mutex::new(Queues {
                events: VecDeque::new(),
                io: VecDeque::new(),
                accepting: true,
                closed: false,
            }),
            wakeup: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues an event. Once the worker is gone the event is dropped, which
    /// cancels its reply channel.
    pub fn post_event(&self, event: Event) {
        let mut queues = self.queues.lock();
        if !queues.closed {
            queues.events.push_back(event);
            self.wakeup.notify_one();
        }
    }

    /// Queues a new application request, or fails it right away if the
    /// device no longer accepts I/O.
    pub fn submit(&self, request: Request) {
        let mut queues = self.queues.lock();
        if !queues.accepting {
            drop(queues);
            request.answer(Err(ErrorKind::DeviceGone(self.name.clone()).into()));
            return;
        }
        queues.io.push_back(IoEntry::Request(request));
        self.wakeup.notify_one();
    }

    /// Queues a completion or a re-issued request from the worker side.
    pub fn complete(&self, entry: IoEntry) {
        let mut queues = self.queues.lock();
        if !queues.closed {
            queues.io.push_back(entry);
            self.wakeup.notify_one();
        }
    }

    /// Pops the next event, or if there is none the next I/O entry. Blocks
    /// until there is work or `deadline` passes.
    pub fn next(&self, deadline: Option<Instant>) -> Work {
        let mut queues = self.queues.lock();
        loop {
            if let Some(event) = queues.events.pop_front() {
                return Work::Event(event);
            }
            if let Some(entry) = queues.io.pop_front() {
                return Work::Io(entry);
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Work::Timeout;
                    }
                    self.wakeup.wait_until(&mut queues, deadline);
                }
                None => self.wakeup.wait(&mut queues),
            }
        }
    }

    /// Returns true if I/O entries are queued.
    pub fn io_pending(&self) -> bool {
        !self.queues.lock().io.is_empty()
    }

    /// Stops accepting new application requests.
    pub fn stop_accepting(&self) {
        self.queues.lock().accepting = false;
    }

    /// Removes all queued application requests that were not dispatched
    /// yet. Completions stay queued.
    pub fn take_requests(&self) -> Vec<Request> {
        let mut queues = self.queues.lock();
        let (requests, rest): (VecDeque<_>, VecDeque<_>) = queues
            .io
            .drain(..)
            .partition(|entry| match entry {
                IoEntry::Request(_) => true,
                _ => false,
            });
        queues.io = rest;
        requests
            .into_iter()
            .filter_map(|entry| match entry {
                IoEntry::Request(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    /// Shuts both queues. Returns whatever was still queued.
    pub fn close(&self) -> (Vec<Event>, Vec<IoEntry>) {
        let mut queues = self.queues.lock();
        queues.accepting = false;
        queues.closed = true;
        (
            queues.events.drain(..).collect(),
            queues.io.drain(..).collect(),
        )
    }
}
