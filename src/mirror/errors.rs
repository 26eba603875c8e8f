#![allow(missing_docs, unused_doc_comments)]
error_chain! {
    foreign_links {
        Toml(::toml::de::Error);
        Io(::std::io::Error);
    }
    links {
        Backend(crate::vdev::Error, crate::vdev::ErrorKind);
        Metadata(crate::metadata::Error, crate::metadata::ErrorKind);
    }
    errors {
        DeviceGone(name: String) {
            description("mirror device destroyed")
            display("mirror {} is gone", name)
        }
        Busy(name: String) {
            description("mirror device busy")
            display("mirror {} has outstanding requests", name)
        }
        NotPublished(name: String) {
            description("mirror not published")
            display("mirror {} has no provider", name)
        }
        InvalidDiskState(id: u32, state: String) {
            description("operation not allowed in the disk's state")
            display("disk {} is {}", id, state)
        }
        NoSuchDisk(id: u32) {
            description("no such disk")
            display("no disk with id {}", id)
        }
        ForeignDisk(backend: String, owner: String) {
            description("disk belongs to another mirror")
            display("{} belongs to mirror {}", backend, owner)
        }
        StaleGeneration(backend: String, genid: u32, current: u32) {
            description("disk from an older generation")
            display("{} has genid {} but the mirror is at {}", backend, genid, current)
        }
        FresherDisk(backend: String) {
            description("disk fresher than the running mirror")
            display("{} is fresher than the running mirror and will not be connected", backend)
        }
        DuplicateDisk(backend: String) {
            description("disk already attached")
            display("{} is already attached", backend)
        }
        DiskTooSmall(backend: String, size: u64, needed: u64) {
            description("disk too small")
            display("{} has {} bytes but {} are needed", backend, size, needed)
        }
        LastActiveDisk(id: u32) {
            description("last active disk")
            display("disk {} is the last active disk", id)
        }
        TooManyDisks(ndisks: u32) {
            description("mirror is complete")
            display("mirror already has {} disks", ndisks)
        }
        InvalidRequest(offset: u64, len: u64) {
            description("invalid request")
            display("invalid request [{}, +{})", offset, len)
        }
        ReadFailed(name: String) {
            description("read failed")
            display("read from mirror {} failed", name)
        }
        WriteFailed(name: String) {
            description("write failed")
            display("write to mirror {} failed", name)
        }
        FlushFailed(name: String) {
            description("flush failed")
            display("flush of mirror {} failed", name)
        }
        Configuration(reason: String) {
            description("invalid configuration")
            display("invalid configuration: {}", reason)
        }
        SpawnError(error: String) {
            description("spawn failed")
            display("spawn failed: {}", error)
        }
    }
}

impl From<::futures::task::SpawnError> for Error {
    fn from(e: ::futures::task::SpawnError) -> Error {
        Error::from(ErrorKind::SpawnError(format!("{:?}", e)))
    }
}
