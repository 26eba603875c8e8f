use super::*;
use crate::metadata::{taste, write_metadata, Metadata};
use crate::vdev::test::{generate_data, FailingBackend, FailureMode};
use crate::vdev::{self, Memory};
use async_trait::async_trait;
use futures::FutureExt;
use std::time::{Duration, Instant};

const SIZE: usize = 64 * 1024;
const MEDIASIZE: u64 = (SIZE - 512) as u64;

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(ndisks: u32, balance: Balance) -> Configuration {
    let mut config = Configuration::new("gm0", ndisks, balance);
    config.idle_timeout_ms = 60_000;
    config.discovery_timeout_ms = 300;
    config
}

fn backend(id: &str) -> Arc<FailingBackend> {
    Arc::new(FailingBackend::new(SIZE, 512, id))
}

fn build(config: Configuration, backends: &[&Arc<FailingBackend>]) -> (Mirror, Vec<DiskId>) {
    let mirror = Mirror::create(config).unwrap();
    let ids = backends
        .iter()
        .map(|&b| {
            let b: Arc<dyn Backend> = b.clone();
            mirror.add_disk(b, DiskOptions::default()).unwrap()
        })
        .collect();
    (mirror, ids)
}

fn wait_until<F: FnMut(&Status) -> bool>(mirror: &Mirror, mut done: F) -> Status {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = mirror.status().unwrap();
        if done(&status) {
            return status;
        }
        assert!(Instant::now() < deadline, "gave up waiting for\n{}", status);
        thread::sleep(Duration::from_millis(5));
    }
}

fn state_of(status: &Status, backend: &str) -> Option<DiskState> {
    status.disk_by_backend(backend).map(|d| d.state)
}

fn wait_for_held_reads(backend: &FailingBackend, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while backend.held_reads() < n {
        assert!(Instant::now() < deadline, "no read reached {}", backend.id());
        thread::sleep(Duration::from_millis(1));
    }
}

/// Labels `backend` as disk `disk_id` of mirror "gm0" without going
/// through a running device.
fn label(backend: &FailingBackend, disk_id: DiskId, edit: impl FnOnce(&mut Metadata)) {
    let mut md = Metadata::new("gm0");
    md.mirror_id = 42;
    md.disk_id = disk_id;
    md.ndisks = 2;
    md.genid = 1;
    md.syncid = 5;
    md.balance = Balance::RoundRobin;
    md.slice = 4096;
    md.mediasize = MEDIASIZE;
    md.sectorsize = 512;
    md.provsize = SIZE as u64;
    edit(&mut md);
    write_metadata(backend, &md).unwrap();
}

fn as_backends(backends: &[&Arc<FailingBackend>]) -> Vec<Arc<dyn Backend>> {
    backends
        .iter()
        .map(|&b| {
            let b: Arc<dyn Backend> = b.clone();
            b
        })
        .collect()
}

fn expect_kind<T: fmt::Debug>(result: Result<T>, check: impl FnOnce(&ErrorKind) -> bool) {
    match result {
        Err(Error(ref kind, _)) if check(kind) => {}
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn fresh_mirror_starts_active() {
    init_log();
    let a = Arc::new(FailingBackend::new(SIZE, 512, "a").with_stripe_size(4096));
    let b = Arc::new(FailingBackend::new(SIZE, 512, "b").with_stripe_size(8192));
    let (mirror, _) = build(config(2, Balance::Load), &[&a, &b]);
    let status = mirror.status().unwrap();
    assert_eq!(status.state, DeviceState::Running);
    assert!(status.provider_published);
    assert_eq!(status.mediasize, MEDIASIZE);
    assert_eq!(status.sectorsize, 512);
    assert_eq!(status.stripesize, 8192);
    assert_eq!(state_of(&status, "a"), Some(DiskState::Active));
    assert_eq!(state_of(&status, "b"), Some(DiskState::Active));
    assert!(status.to_string().starts_with("gm0 RUNNING"));

    let data = generate_data(0, 4096, 8192);
    mirror.write(data.clone(), 4096).unwrap();
    assert_eq!(&*mirror.read(4096, 8192).unwrap(), &*data);
    assert_eq!(a.contents(4096, 8192), data.to_vec());
    assert_eq!(b.contents(4096, 8192), data.to_vec());

    let status = mirror.status().unwrap();
    assert_eq!(status.syncid, 2);
    for disk in &status.disks {
        assert!(disk.flags.contains(DiskFlags::DIRTY));
        assert_eq!(disk.syncid, 2);
    }
}

#[test]
fn failover_and_resync_of_replacement() {
    init_log();
    let (a, b) = (backend("a"), backend("b"));
    let (mirror, _) = build(config(2, Balance::RoundRobin), &[&a, &b]);
    mirror.write(vec![b'a'; 512], 0).unwrap();
    mirror.write(vec![b'b'; 512], 512).unwrap();
    for disk in &[&a, &b] {
        assert_eq!(disk.contents(0, 512), vec![b'a'; 512]);
        assert_eq!(disk.contents(512, 512), vec![b'b'; 512]);
    }

    b.fail_reads(FailureMode::FailOperation);
    // Round robin hands out a and b in turn; both reads are served by a.
    for _ in 0..2 {
        assert_eq!(&*mirror.read(0, 512).unwrap(), &[b'a'; 512][..]);
    }
    let status = mirror.status().unwrap();
    assert_eq!(state_of(&status, "a"), Some(DiskState::Active));
    assert_eq!(state_of(&status, "b"), Some(DiskState::Disconnected));

    let fresh = backend("b");
    a.hold_reads();
    mirror.add_disk(fresh.clone(), DiskOptions::default()).unwrap();
    wait_for_held_reads(&a, 1);
    let status = mirror.status().unwrap();
    let replaced = status.disk_by_backend("b").unwrap();
    assert_eq!(replaced.state, DiskState::Synchronizing);
    assert_eq!(replaced.sync_offset, Some(0));
    assert_eq!(status.disks.len(), 2);

    a.release_reads();
    wait_until(&mirror, |s| state_of(s, "b") == Some(DiskState::Active));
    assert_eq!(fresh.contents(0, 1024), a.contents(0, 1024));
}

#[test]
fn interrupted_sync_resumes_at_recorded_offset() {
    init_log();
    let (a, b) = (backend("a"), backend("b"));
    label(&a, 1, |_| {});
    label(&b, 2, |md| {
        md.dflags = DiskFlags::SYNCHRONIZING;
        md.sync_offset = 32768;
    });
    let data = generate_data(7, 0, MEDIASIZE as usize);
    futures::executor::block_on(a.write_raw(&data, 0)).unwrap();

    let mirror = Mirror::open(config(2, Balance::Load), as_backends(&[&a, &b])).unwrap();
    wait_until(&mirror, |s| state_of(s, "b") == Some(DiskState::Active));
    assert_eq!(b.contents(0, 32768), vec![0; 32768]);
    assert_eq!(
        b.contents(32768, MEDIASIZE as usize - 32768),
        data[32768..].to_vec()
    );
    let md = taste(&*b).unwrap();
    assert!(!md.dflags.contains(DiskFlags::SYNCHRONIZING));
    assert_eq!(md.sync_offset, 0);
}

#[test]
fn idle_mirror_marks_disks_clean() {
    init_log();
    let (a, b) = (backend("a"), backend("b"));
    let mut config = config(2, Balance::Load);
    config.idle_timeout_ms = 200;
    let (mirror, _) = build(config, &[&a, &b]);

    mirror.write(vec![1; 512], 0).unwrap();
    assert!(taste(&*a).unwrap().dflags.contains(DiskFlags::DIRTY));
    wait_until(&mirror, |s| {
        s.disks.iter().all(|d| !d.flags.contains(DiskFlags::DIRTY))
    });
    for disk in &[&a, &b] {
        assert!(!taste(&***disk).unwrap().dflags.contains(DiskFlags::DIRTY));
    }

    mirror.write(vec![2; 512], 0).unwrap();
    assert!(taste(&*b).unwrap().dflags.contains(DiskFlags::DIRTY));
}

#[test]
fn split_reads_are_spread_and_reassembled() {
    init_log();
    let disks: Vec<_> = (0..3)
        .map(|i| Arc::new(FailingBackend::new(SIZE, 256, &format!("d{}", i))))
        .collect();
    let mut config = config(3, Balance::Split);
    config.slice = 256;
    let (mirror, _) = build(config, &disks.iter().collect::<Vec<_>>());
    let data = generate_data(1, 0, 768);
    mirror.write(data.clone(), 0).unwrap();

    let before = mirror.status().unwrap();
    assert_eq!(&*mirror.read(0, 768).unwrap(), &*data);
    let after = mirror.status().unwrap();
    for (old, new) in before.disks.iter().zip(&after.disks) {
        assert_eq!(new.stats.read - old.stats.read, 256, "{}", new.backend);
    }
}

#[test]
fn forced_resync_converges() {
    init_log();
    let (a, b) = (backend("a"), backend("b"));
    let mut config = config(2, Balance::Prefer);
    config.sync_chunk = 4096;
    config.sync_save_interval = 4;
    let (mirror, ids) = build(config, &[&a, &b]);
    for i in 0..8 {
        let offset = i * 8192;
        mirror.write(generate_data(i as usize, offset, 4096), offset).unwrap();
    }
    futures::executor::block_on(b.write_raw(&[0xff; 4096], 4096)).unwrap();
    assert_ne!(a.contents(0, MEDIASIZE as usize), b.contents(0, MEDIASIZE as usize));

    expect_kind(mirror.force_sync(99), |k| match k {
        ErrorKind::NoSuchDisk(99) => true,
        _ => false,
    });
    mirror.force_sync(ids[1]).unwrap();
    wait_until(&mirror, |s| {
        s.disk(ids[1]).map(|d| d.state) == Some(DiskState::Active)
    });
    assert_eq!(a.contents(0, MEDIASIZE as usize), b.contents(0, MEDIASIZE as usize));
    let md = taste(&*b).unwrap();
    assert!(!md.dflags.contains(DiskFlags::SYNCHRONIZING));
    assert!(!md.dflags.contains(DiskFlags::FORCE_SYNC));
}

#[test]
fn writes_during_sync_are_not_lost() {
    init_log();
    let (a, b) = (backend("a"), backend("b"));
    let (mirror, ids) = build(config(2, Balance::Prefer), &[&a, &b]);
    mirror.write(vec![1; 4096], 0).unwrap();
    mirror.remove_disk(ids[1], Removal::Disconnect).unwrap();

    let fresh = backend("b");
    a.hold_reads();
    mirror.add_disk(fresh.clone(), DiskOptions::default()).unwrap();
    wait_for_held_reads(&a, 1);

    let mut write = mirror.write_async(vec![2; 4096], 0);
    thread::sleep(Duration::from_millis(50));
    assert!((&mut write).now_or_never().is_none());
    assert_eq!(a.contents(0, 4096), vec![1; 4096]);

    a.release_reads();
    futures::executor::block_on(write).unwrap();
    wait_until(&mirror, |s| state_of(s, "b") == Some(DiskState::Active));
    assert_eq!(a.contents(0, 4096), vec![2; 4096]);
    assert_eq!(fresh.contents(0, 4096), vec![2; 4096]);
    assert_eq!(a.contents(0, MEDIASIZE as usize), fresh.contents(0, MEDIASIZE as usize));
}

#[test]
fn genid_bump_rejects_stale_disk() {
    init_log();
    let (a, b) = (backend("a"), backend("b"));
    let (mirror, ids) = build(config(2, Balance::Load), &[&a, &b]);
    mirror.write(vec![7; 512], 0).unwrap();
    let genid = mirror.status().unwrap().genid;

    mirror.remove_disk(ids[1], Removal::Disconnect).unwrap();
    assert_eq!(mirror.status().unwrap().genid, genid);
    mirror.write(vec![8; 512], 0).unwrap();
    let status = mirror.status().unwrap();
    assert_eq!(status.genid, genid + 1);
    assert_eq!(status.disk(ids[0]).unwrap().genid, genid + 1);

    expect_kind(mirror.add_disk(b.clone(), DiskOptions::default()), |k| match k {
        ErrorKind::StaleGeneration(_, old, new) => *old == genid && *new == genid + 1,
        _ => false,
    });
    assert_eq!(
        state_of(&mirror.status().unwrap(), "b"),
        Some(DiskState::Disconnected)
    );

    let insert = DiskOptions {
        insert: true,
        ..Default::default()
    };
    mirror.add_disk(b.clone(), insert).unwrap();
    let status = wait_until(&mirror, |s| state_of(s, "b") == Some(DiskState::Active));
    assert_eq!(status.disk_by_backend("b").unwrap().genid, genid + 1);
    assert_eq!(b.contents(0, 512), vec![8; 512]);
}

#[test]
fn reopen_after_clean_shutdown() {
    init_log();
    let (a, b) = (backend("a"), backend("b"));
    let data = generate_data(3, 0, 16384);
    let (genid, syncid) = {
        let (mirror, _) = build(config(2, Balance::Load), &[&a, &b]);
        mirror.write(data.clone(), 0).unwrap();
        let status = mirror.status().unwrap();
        mirror.destroy(DestroyMode::Soft).unwrap();
        expect_kind(mirror.read(0, 512), |k| match k {
            ErrorKind::DeviceGone(_) => true,
            _ => false,
        });
        (status.genid, status.syncid)
    };
    assert!(!taste(&*a).unwrap().dflags.contains(DiskFlags::DIRTY));

    let stranger = backend("c");
    let mirror = Mirror::open(config(2, Balance::Load), as_backends(&[&stranger, &a, &b])).unwrap();
    let status = mirror.status().unwrap();
    assert_eq!(status.name, "gm0");
    assert_eq!(status.disks.len(), 2);
    assert_eq!((status.genid, status.syncid), (genid, syncid));
    for disk in &status.disks {
        assert_eq!(disk.state, DiskState::Active);
        assert!(!disk.flags.contains(DiskFlags::DIRTY));
    }
    assert_eq!(&*mirror.read(0, 16384).unwrap(), &*data);
    assert!(taste(&*stranger).is_none());
}

#[test]
fn dirty_start_trusts_highest_priority() {
    init_log();
    let (a, b) = (backend("a"), backend("b"));
    label(&a, 1, |md| md.dflags = DiskFlags::DIRTY);
    label(&b, 2, |md| {
        md.dflags = DiskFlags::DIRTY;
        md.priority = 5;
    });
    futures::executor::block_on(a.write_raw(&[0xaa; 4096], 0)).unwrap();
    futures::executor::block_on(b.write_raw(&[0xbb; 4096], 0)).unwrap();

    let mirror = Mirror::open(config(2, Balance::Load), as_backends(&[&a, &b])).unwrap();
    let status = mirror.status().unwrap();
    assert_eq!(status.disks[0].backend, "b");
    assert_eq!(state_of(&status, "b"), Some(DiskState::Active));
    wait_until(&mirror, |s| state_of(s, "a") == Some(DiskState::Active));
    assert_eq!(a.contents(0, 4096), vec![0xbb; 4096]);
}

#[test]
fn older_generation_is_discarded_at_start() {
    init_log();
    let (a, b) = (backend("a"), backend("b"));
    label(&a, 1, |md| md.genid = 2);
    label(&b, 2, |md| md.genid = 1);
    let mirror = Mirror::open(config(2, Balance::Load), as_backends(&[&a, &b])).unwrap();
    let status = mirror.status().unwrap();
    assert_eq!(status.genid, 2);
    assert_eq!(status.disks.len(), 1);
    assert_eq!(state_of(&status, "a"), Some(DiskState::Active));

    mirror.write(vec![1; 512], 0).unwrap();
    assert_eq!(mirror.status().unwrap().genid, 3);
}

#[test]
fn discovery_timeout_starts_degraded() {
    init_log();
    let (a, b) = (backend("a"), backend("b"));
    label(&a, 1, |_| {});
    label(&b, 2, |_| {});
    let mut settings = config(2, Balance::Load);
    settings.discovery_timeout_ms = 500;
    let mirror = Mirror::open(settings, as_backends(&[&a])).unwrap();
    let status = mirror.status().unwrap();
    assert_eq!(status.state, DeviceState::Starting);
    assert_eq!(status.stripesize, 0);
    expect_kind(mirror.read(0, 512), |k| match k {
        ErrorKind::NotPublished(_) => true,
        _ => false,
    });

    wait_until(&mirror, |s| s.provider_published);
    mirror.write(vec![3; 512], 0).unwrap();
    let status = mirror.status().unwrap();
    assert_eq!(status.genid, 2);
    assert_eq!(status.syncid, 6);

    expect_kind(mirror.add_disk(b.clone(), DiskOptions::default()), |k| match k {
        ErrorKind::StaleGeneration(..) => true,
        _ => false,
    });
}

#[test]
fn stale_disk_waits_for_autosync() {
    init_log();
    let (a, b) = (backend("a"), backend("b"));
    label(&a, 1, |md| md.mflags = DeviceFlags::NOAUTOSYNC);
    label(&b, 2, |md| {
        md.mflags = DeviceFlags::NOAUTOSYNC;
        md.syncid = 4;
    });
    futures::executor::block_on(b.write_raw(&[0xee; 512], 0)).unwrap();
    let mirror = Mirror::open(config(2, Balance::Load), as_backends(&[&a, &b])).unwrap();
    let status = mirror.status().unwrap();
    let (a_id, b_id) = (
        status.disk_by_backend("a").unwrap().id,
        status.disk_by_backend("b").unwrap().id,
    );
    assert_eq!(status.disk(b_id).unwrap().state, DiskState::Stale);

    mirror.write(vec![5; 512], 0).unwrap();
    assert_eq!(b.contents(0, 512), vec![0xee; 512]);
    expect_kind(mirror.force_sync(a_id), |k| match k {
        ErrorKind::LastActiveDisk(_) => true,
        _ => false,
    });
    expect_kind(mirror.remove_disk(a_id, Removal::Disconnect), |k| match k {
        ErrorKind::LastActiveDisk(_) => true,
        _ => false,
    });

    mirror
        .configure(Reconfigure {
            autosync: Some(true),
            ..Default::default()
        })
        .unwrap();
    wait_until(&mirror, |s| s.disk(b_id).map(|d| d.state) == Some(DiskState::Active));
    assert_eq!(b.contents(0, 512), vec![5; 512]);
    assert!(!taste(&*a).unwrap().mflags.contains(DeviceFlags::NOAUTOSYNC));
}

#[test]
fn failed_write_disconnects_disk() {
    init_log();
    let (a, b) = (backend("a"), backend("b"));
    let (mirror, _) = build(config(2, Balance::RoundRobin), &[&a, &b]);
    b.fail_writes(FailureMode::FailOperation);
    let data = generate_data(4, 0, 4096);
    mirror.write(data.clone(), 0).unwrap();
    let status = mirror.status().unwrap();
    assert_eq!(state_of(&status, "b"), Some(DiskState::Disconnected));
    for _ in 0..3 {
        assert_eq!(&*mirror.read(0, 4096).unwrap(), &*data);
    }
}

#[test]
fn write_fails_when_every_disk_fails() {
    init_log();
    let (a, b) = (backend("a"), backend("b"));
    let (mirror, _) = build(config(2, Balance::Load), &[&a, &b]);
    a.fail_writes(FailureMode::FailOperation);
    b.fail_writes(FailureMode::FailOperation);
    expect_kind(mirror.write(vec![1; 512], 0), |k| match k {
        ErrorKind::WriteFailed(_) => true,
        _ => false,
    });
    let status = mirror.status().unwrap();
    for disk in &status.disks {
        assert_eq!(disk.state, DiskState::Active);
        assert_eq!(disk.errors, 1);
    }
}

#[test]
fn flush_survives_partial_failure() {
    init_log();
    let (a, b) = (backend("a"), backend("b"));
    let (mirror, _) = build(config(2, Balance::Load), &[&a, &b]);
    a.fail_flushes(true);
    mirror.flush().unwrap();
    let status = mirror.status().unwrap();
    assert_eq!(state_of(&status, "a"), Some(DiskState::Disconnected));

    b.fail_flushes(true);
    expect_kind(mirror.flush(), |k| match k {
        ErrorKind::FlushFailed(_) => true,
        _ => false,
    });
    let status = mirror.status().unwrap();
    assert_eq!(state_of(&status, "b"), Some(DiskState::Active));
    assert_eq!(status.disk_by_backend("b").unwrap().errors, 1);
}

#[test]
fn sync_failure_disconnects_target() {
    init_log();
    let (a, b) = (backend("a"), backend("b"));
    let (mirror, ids) = build(config(2, Balance::Load), &[&a, &b]);
    b.fail_writes(FailureMode::FailOperation);
    mirror.force_sync(ids[1]).unwrap();
    wait_until(&mirror, |s| {
        s.disk(ids[1]).map(|d| d.state) == Some(DiskState::Disconnected)
    });
    assert_eq!(
        mirror.status().unwrap().disk(ids[0]).unwrap().state,
        DiskState::Active
    );
}

#[test]
fn sync_source_failure_switches_source() {
    init_log();
    let (a, b, c) = (backend("a"), backend("b"), backend("c"));
    let (mirror, ids) = build(config(3, Balance::Prefer), &[&a, &b, &c]);
    mirror.write(generate_data(5, 0, 8192), 0).unwrap();
    futures::executor::block_on(c.write_raw(&[0; 8192], 0)).unwrap();
    a.fail_reads(FailureMode::FailOperation);
    mirror.force_sync(ids[2]).unwrap();
    let status = wait_until(&mirror, |s| {
        s.disk(ids[2]).map(|d| d.state) == Some(DiskState::Active)
    });
    assert_eq!(status.disk(ids[0]).unwrap().state, DiskState::Disconnected);
    assert_eq!(c.contents(0, 8192), b.contents(0, 8192));
}

#[test]
fn split_brain_disk_is_left_alone() {
    init_log();
    let (a, b) = (backend("a"), backend("b"));
    label(&a, 1, |_| {});
    label(&b, 2, |md| md.genid = 3);
    let mut settings = config(2, Balance::Load);
    settings.discovery_timeout_ms = 50;
    let mirror = Mirror::open(settings, as_backends(&[&a])).unwrap();
    wait_until(&mirror, |s| s.provider_published);
    expect_kind(mirror.add_disk(b.clone(), DiskOptions::default()), |k| match k {
        ErrorKind::FresherDisk(_) => true,
        _ => false,
    });
    assert_eq!(taste(&*b).unwrap().genid, 3);
}

#[test]
fn foreign_and_duplicate_disks_are_rejected() {
    init_log();
    let (a, b, c) = (backend("a"), backend("b"), backend("c"));
    let (first, _) = build(config(2, Balance::Load), &[&a, &b]);
    let mut other = config(1, Balance::Load);
    other.name = String::from("gm1");
    let second = Mirror::create(other).unwrap();
    expect_kind(second.add_disk(a.clone(), DiskOptions::default()), |k| match k {
        ErrorKind::ForeignDisk(..) => true,
        _ => false,
    });
    expect_kind(first.add_disk(a.clone(), DiskOptions::default()), |k| match k {
        ErrorKind::DuplicateDisk(_) => true,
        _ => false,
    });
    second.add_disk(c.clone(), DiskOptions::default()).unwrap();
    assert_eq!(taste(&*c).unwrap().name(), "gm1");
}

#[test]
fn invalid_requests_are_rejected() {
    init_log();
    let (a, b) = (backend("a"), backend("b"));
    let (mirror, _) = build(config(2, Balance::Load), &[&a, &b]);
    for &(offset, len) in &[(1, 512), (0, 100), (0, 0), (MEDIASIZE, 512)] {
        expect_kind(mirror.read(offset, len), |k| match k {
            ErrorKind::InvalidRequest(..) => true,
            _ => false,
        });
    }
}

#[test]
fn delete_reaches_every_disk() {
    init_log();
    let (a, b) = (backend("a"), backend("b"));
    let (mirror, _) = build(config(2, Balance::Load), &[&a, &b]);
    mirror.write(vec![9; 1024], 0).unwrap();
    mirror.delete(0, 512).unwrap();
    for disk in &[&a, &b] {
        assert_eq!(disk.contents(0, 512), vec![0; 512]);
        assert_eq!(disk.contents(512, 512), vec![9; 512]);
    }
}

#[test]
fn removed_disk_loses_its_label() {
    init_log();
    let (a, b) = (backend("a"), backend("b"));
    let (mirror, ids) = build(config(2, Balance::Load), &[&a, &b]);
    mirror.remove_disk(ids[1], Removal::Destroy).unwrap();
    assert!(taste(&*b).is_none());
    assert_eq!(taste(&*a).unwrap().ndisks, 1);
    let status = mirror.status().unwrap();
    assert_eq!(status.ndisks, 1);
    assert_eq!(status.disks.len(), 1);
    expect_kind(mirror.remove_disk(ids[0], Removal::Destroy), |k| match k {
        ErrorKind::LastActiveDisk(_) => true,
        _ => false,
    });
}

#[test]
fn priorities_reorder_disks() {
    init_log();
    let (a, b) = (backend("a"), backend("b"));
    let (mirror, ids) = build(config(2, Balance::Prefer), &[&a, &b]);
    mirror
        .configure(Reconfigure {
            priorities: vec![(ids[1], 10)],
            ..Default::default()
        })
        .unwrap();
    let before = mirror.status().unwrap();
    assert_eq!(before.disks[0].id, ids[1]);
    mirror.read(0, 4096).unwrap();
    let after = mirror.status().unwrap();
    assert_eq!(after.disks[0].stats.read - before.disks[0].stats.read, 4096);
    assert_eq!(after.disks[1].stats.read, before.disks[1].stats.read);
    assert_eq!(taste(&*b).unwrap().priority, 10);

    expect_kind(
        mirror.configure(Reconfigure {
            priorities: vec![(12345, 1)],
            ..Default::default()
        }),
        |k| match k {
            ErrorKind::NoSuchDisk(12345) => true,
            _ => false,
        },
    );
}

#[test]
fn soft_destroy_refuses_outstanding_io() {
    init_log();
    let (a, b) = (backend("a"), backend("b"));
    let (mirror, _) = build(config(2, Balance::Prefer), &[&a, &b]);
    a.hold_reads();
    let read = mirror.read_async(0, 512);
    wait_for_held_reads(&a, 1);
    expect_kind(mirror.destroy(DestroyMode::Soft), |k| match k {
        ErrorKind::Busy(_) => true,
        _ => false,
    });
    a.release_reads();
    futures::executor::block_on(read).unwrap();
    mirror.destroy(DestroyMode::Soft).unwrap();
    expect_kind(mirror.flush(), |k| match k {
        ErrorKind::DeviceGone(_) => true,
        _ => false,
    });
}

#[test]
fn hard_and_delayed_destroy_wait_for_dispatched_io() {
    init_log();
    for &mode in &[DestroyMode::Hard, DestroyMode::Delayed] {
        let (a, b) = (backend("a"), backend("b"));
        let (mirror, _) = build(config(2, Balance::Prefer), &[&a, &b]);
        let mirror = Arc::new(mirror);
        a.hold_reads();
        let read = mirror.read_async(0, 512);
        wait_for_held_reads(&a, 1);

        let destroyer = {
            let mirror = Arc::clone(&mirror);
            thread::spawn(move || mirror.destroy(mode))
        };
        let deadline = Instant::now() + Duration::from_secs(10);
        while mirror.flush().is_ok() {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }
        expect_kind(mirror.write(vec![0; 512], 0), |k| match k {
            ErrorKind::DeviceGone(_) => true,
            _ => false,
        });

        a.release_reads();
        assert_eq!(&*futures::executor::block_on(read).unwrap(), &[0; 512][..]);
        destroyer.join().unwrap().unwrap();
    }
}

#[test]
fn metadata_failures_break_then_disconnect() {
    init_log();
    let (a, b) = (backend("a"), backend("b"));
    let (mirror, ids) = build(config(2, Balance::Prefer), &[&a, &b]);
    let flags_of_b = |mirror: &Mirror| mirror.status().unwrap().disk(ids[1]).unwrap().flags;
    let reprioritize = |priority| Reconfigure {
        priorities: vec![(ids[1], priority)],
        ..Default::default()
    };

    b.fail_metadata_writes(true);
    let data = generate_data(8, 0, 4096);
    mirror.write(data.clone(), 0).unwrap();
    assert!(flags_of_b(&mirror).contains(DiskFlags::BROKEN));
    assert_eq!(b.contents(0, 4096), data.to_vec());

    b.fail_metadata_writes(false);
    mirror.configure(reprioritize(1)).unwrap();
    assert!(!flags_of_b(&mirror).contains(DiskFlags::BROKEN));

    b.fail_metadata_writes(true);
    mirror.configure(reprioritize(2)).unwrap();
    let status = mirror.status().unwrap();
    assert_eq!(status.disk(ids[1]).unwrap().state, DiskState::Active);
    assert!(status.disk(ids[1]).unwrap().flags.contains(DiskFlags::BROKEN));

    mirror.configure(reprioritize(3)).unwrap();
    wait_until(&mirror, |s| {
        s.disk(ids[1]).map(|d| d.state) == Some(DiskState::Disconnected)
    });
    assert_eq!(&*mirror.read(0, 4096).unwrap(), &*data);
}

#[test]
fn load_balance_keeps_sequential_reads_together() {
    init_log();
    let (a, b) = (backend("a"), backend("b"));
    let (mirror, _) = build(config(2, Balance::Load), &[&a, &b]);
    let before = mirror.status().unwrap();
    for i in 0..8 {
        mirror.read(i * 4096, 4096).unwrap();
    }
    let after = mirror.status().unwrap();
    let mut served: Vec<u64> = before
        .disks
        .iter()
        .zip(&after.disks)
        .map(|(old, new)| new.stats.read - old.stats.read)
        .collect();
    served.sort();
    assert_eq!(served, vec![0, 8 * 4096]);
}

#[test]
fn load_balance_moves_reads_off_a_busy_disk() {
    init_log();
    let (a, b) = (backend("a"), backend("b"));
    let mut config = config(2, Balance::Load);
    // Parked reads each occupy an I/O thread.
    config.io_threads = 20;
    let (mirror, _) = build(config, &[&a, &b]);
    let before = mirror.status().unwrap();
    mirror.read(0, 4096).unwrap();
    let after = mirror.status().unwrap();
    let read_by = |status: &Status, id: &str| status.disk_by_backend(id).unwrap().stats.read;
    let busy = if read_by(&after, "a") > read_by(&before, "a") {
        &a
    } else {
        &b
    };

    // Every read continues where the last one on `busy` ended; only the
    // growing queue of `busy` can move one to the other disk.
    busy.hold_reads();
    let mut parked = Vec::new();
    let served = loop {
        assert!(parked.len() < 16, "all reads queued on {}", busy.id());
        let mut read = mirror.read_async(4096, 4096);
        let deadline = Instant::now() + Duration::from_secs(10);
        let done = loop {
            if let Some(result) = (&mut read).now_or_never() {
                break Some(result);
            }
            if busy.held_reads() > parked.len() {
                break None;
            }
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        };
        match done {
            Some(result) => break result,
            None => parked.push(read),
        }
    };
    served.unwrap();
    assert!(parked.len() > 1);

    busy.release_reads();
    for read in parked {
        futures::executor::block_on(read).unwrap();
    }
}

#[test]
fn disconnected_disks_do_not_pile_up() {
    init_log();
    let (a, b) = (backend("a"), backend("b"));
    let (mirror, ids) = build(config(2, Balance::Prefer), &[&a, &b]);
    mirror.remove_disk(ids[1], Removal::Disconnect).unwrap();
    let mut spares = Vec::new();
    for i in 0..4 {
        let spare = backend(&format!("spare{}", i));
        let id = mirror.add_disk(spare.clone(), DiskOptions::default()).unwrap();
        wait_until(&mirror, |s| s.disk(id).map(|d| d.state) == Some(DiskState::Active));
        mirror.remove_disk(id, Removal::Disconnect).unwrap();
        spares.push(spare);
    }
    let status = mirror.status().unwrap();
    let gone: Vec<_> = status
        .disks
        .iter()
        .filter(|d| d.state == DiskState::Disconnected)
        .map(|d| d.backend.as_str())
        .collect();
    assert_eq!(gone, vec!["spare2", "spare3"]);
    assert_eq!(status.disks.len(), 3);
}

#[test]
fn undersized_backend_is_refused() {
    init_log();
    let (a, b) = (backend("a"), backend("b"));
    let mirror = Mirror::create(config(2, Balance::Load)).unwrap();
    let tiny: Arc<dyn Backend> = Arc::new(Memory::new(0, 512, String::from("tiny")));
    expect_kind(mirror.add_disk(Arc::clone(&tiny), DiskOptions::default()), |k| match k {
        ErrorKind::DiskTooSmall(..) => true,
        _ => false,
    });
    assert_eq!(mirror.status().unwrap().state, DeviceState::Starting);

    for disk in as_backends(&[&a, &b]) {
        mirror.add_disk(disk, DiskOptions::default()).unwrap();
    }
    assert_eq!(mirror.status().unwrap().state, DeviceState::Running);
    assert!(Mirror::open(config(2, Balance::Load), vec![tiny]).is_err());
}

#[test]
fn short_read_is_treated_as_failure() {
    init_log();
    let (a, b) = (backend("a"), backend("b"));
    let (mirror, _) = build(config(2, Balance::Prefer), &[&a, &b]);
    let data = generate_data(9, 0, 4096);
    mirror.write(data.clone(), 0).unwrap();
    a.fail_reads(FailureMode::ShortData);
    assert_eq!(&*mirror.read(0, 4096).unwrap(), &*data);
    let status = mirror.status().unwrap();
    assert_eq!(state_of(&status, "a"), Some(DiskState::Disconnected));
    assert_eq!(state_of(&status, "b"), Some(DiskState::Active));
}

/// Backend that panics once the mirror asks for its sector size.
struct Exploding(Memory);

#[async_trait]
impl Backend for Exploding {
    async fn read_raw(
        &self,
        len: usize,
        offset: u64,
    ) -> std::result::Result<Box<[u8]>, vdev::Error> {
        self.0.read_raw(len, offset).await
    }

    async fn write_raw(&self, data: &[u8], offset: u64) -> std::result::Result<(), vdev::Error> {
        self.0.write_raw(data, offset).await
    }

    fn flush(&self) -> std::result::Result<(), vdev::Error> {
        self.0.flush()
    }

    fn size(&self) -> u64 {
        self.0.size()
    }

    fn sector_size(&self) -> u32 {
        panic!("{} lost its geometry", self.0.id())
    }

    fn id(&self) -> &str {
        self.0.id()
    }

    fn stats(&self) -> Statistics {
        self.0.stats()
    }
}

#[test]
fn worker_panic_fails_callers_instead_of_hanging() {
    init_log();
    let a = backend("a");
    let mirror = Mirror::create(config(2, Balance::Load)).unwrap();
    mirror.add_disk(a.clone(), DiskOptions::default()).unwrap();
    let bomb = Arc::new(Exploding(Memory::new(SIZE, 512, String::from("bomb"))));
    let gone = |k: &ErrorKind| match k {
        ErrorKind::DeviceGone(_) => true,
        _ => false,
    };
    expect_kind(mirror.add_disk(bomb, DiskOptions::default()), gone);
    expect_kind(mirror.status(), gone);
    expect_kind(mirror.read(0, 512), gone);
    expect_kind(mirror.destroy(DestroyMode::Soft), gone);
}
