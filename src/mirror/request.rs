//! Records of application requests and synchronization chunks as they move
//! through the worker.

use super::disk::DiskId;
use super::errors::*;
use crate::vdev;
use futures::channel::oneshot;
use std::sync::Arc;

/// Worker-local identity of an in-flight application request.
pub(super) type RequestId = u64;

/// Answer to an application request. Reads carry the data, everything else
/// an empty buffer.
pub(super) type Reply = oneshot::Sender<Result<Box<[u8]>>>;

/// Operation of an application request.
#[derive(Clone)]
pub(super) enum IoKind {
    Read,
    Write(Arc<[u8]>),
    Delete,
    Flush,
}

impl IoKind {
    /// Returns true if the operation modifies the device.
    pub fn modifies(&self) -> bool {
        match *self {
            IoKind::Write(_) | IoKind::Delete => true,
            IoKind::Read | IoKind::Flush => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match *self {
            IoKind::Read => "read",
            IoKind::Write(_) => "write",
            IoKind::Delete => "delete",
            IoKind::Flush => "flush",
        }
    }
}

/// An application request as submitted through the provider.
pub(super) struct Request {
    pub kind: IoKind,
    pub offset: u64,
    pub length: u64,
    pub reply: Reply,
    /// Number of times this read was re-issued after a member failed.
    pub retries: u32,
}

impl Request {
    pub fn new(kind: IoKind, offset: u64, length: u64, reply: Reply) -> Self {
        Request {
            kind,
            offset,
            length,
            reply,
            retries: 0,
        }
    }

    /// Returns true if `[offset, offset + length)` intersects this request.
    pub fn overlaps(&self, offset: u64, length: u64) -> bool {
        overlaps(self.offset, self.length, offset, length)
    }

    /// Delivers `result` to the submitter. A vanished submitter is ignored.
    pub fn answer(self, result: Result<Box<[u8]>>) {
        let _ = self.reply.send(result);
    }
}

/// A dispatched application request waiting for its children.
pub(super) struct Inflight {
    pub request: Request,
    /// Children issued and not yet folded.
    pub pending: usize,
    /// Children that succeeded.
    pub succeeded: usize,
    /// Disks whose child failed.
    pub failed: Vec<DiskId>,
    /// Assembly buffer of a read.
    pub buffer: Option<Vec<u8>>,
}

impl Inflight {
    pub fn new(request: Request, pending: usize) -> Self {
        let buffer = match request.kind {
            IoKind::Read => Some(vec![0; request.length as usize]),
            _ => None,
        };
        Inflight {
            request,
            pending,
            succeeded: 0,
            failed: Vec::new(),
            buffer,
        }
    }
}

/// Result of one child of a regular request.
pub(super) struct RegularCompletion {
    pub request: RequestId,
    pub disk: DiskId,
    pub offset: u64,
    pub length: u64,
    pub result: ::std::result::Result<Option<Box<[u8]>>, vdev::Error>,
}

/// Phase of a synchronization chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum SyncPhase {
    /// Reading the chunk from an active disk.
    Read,
    /// Writing the chunk to the synchronizing disk.
    Write,
}

/// One read-then-write copy of a range onto a synchronizing disk.
pub(super) struct SyncChunk {
    /// Target disk.
    pub disk: DiskId,
    /// Synchronization run the chunk belongs to.
    pub generation: u64,
    pub offset: u64,
    pub length: u64,
    pub phase: SyncPhase,
    /// Disk the chunk was read from.
    pub source: Option<DiskId>,
    /// Data read from the source, present in the write phase.
    pub data: Option<Arc<[u8]>>,
    /// Failed attempts tolerated so far.
    pub retries: u32,
}

impl SyncChunk {
    pub fn new(disk: DiskId, generation: u64, offset: u64, length: u64) -> Self {
        SyncChunk {
            disk,
            generation,
            offset,
            length,
            phase: SyncPhase::Read,
            source: None,
            data: None,
            retries: 0,
        }
    }

    pub fn overlaps(&self, offset: u64, length: u64) -> bool {
        overlaps(self.offset, self.length, offset, length)
    }
}

/// Result of one phase of a synchronization chunk.
pub(super) struct SyncCompletion {
    pub chunk: SyncChunk,
    pub result: ::std::result::Result<Option<Box<[u8]>>, vdev::Error>,
}

/// Returns true if the ranges `[a, a + a_len)` and `[b, b + b_len)` intersect.
pub(super) fn overlaps(a: u64, a_len: u64, b: u64, b_len: u64) -> bool {
    a_len > 0 && b_len > 0 && a < b + b_len && b < a + a_len
}

#[cfg(test)]
mod tests {
    use super::overlaps;

    #[test]
    fn adjacent_ranges_do_not_overlap() {
        assert!(!overlaps(0, 512, 512, 512));
        assert!(!overlaps(512, 512, 0, 512));
        assert!(overlaps(0, 513, 512, 512));
        assert!(!overlaps(0, 0, 0, 512));
    }

    #[quickcheck]
    fn overlap_is_symmetric(a: u32, a_len: u16, b: u32, b_len: u16) -> bool {
        let (a, a_len, b, b_len) = (
            u64::from(a),
            u64::from(a_len),
            u64::from(b),
            u64::from(b_len),
        );
        let naive = (a..a + a_len).any(|x| x >= b && x < b + b_len);
        overlaps(a, a_len, b, b_len) == overlaps(b, b_len, a, a_len)
            && overlaps(a, a_len, b, b_len) == naive
    }
}
