use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::Arc;

use serial_test::serial;
use strata::failpoint::{self, FailAction};
use strata::header::FileHeader;
use strata::node::Node;
use strata::page::{Page, PageKind};
use strata::wal::{Frame, Wal};
use strata::{Store, StoreError};
use tempfile::tempdir;

mod common;
use common::{collect, key, small_pages, wal_path, TestStore};

fn seed(store: &Store, n: u32) {
    let mut tx = store.begin().unwrap();
    for i in 0..n {
        tx.put(&key(i), format!("committed-{i}").as_bytes()).unwrap();
    }
    tx.commit().unwrap();
}

/// Runs a batch that must fail at `point`, then checks nothing leaked.
fn assert_commit_fails_cleanly(point: &str) {
    failpoint::clear();
    let t = TestStore::new(small_pages());
    seed(&t.store, 100);
    let before = collect(&t.store);
    let stats_before = t.store.stats();

    failpoint::enable(point);
    let mut tx = t.store.begin().unwrap();
    for i in 50..150 {
        tx.put(&key(i), b"lost").unwrap();
    }
    let err = tx.commit().unwrap_err();
    failpoint::disable(point);
    assert!(matches!(err, StoreError::Io(_)), "{point}: {err:?}");

    assert_eq!(collect(&t.store), before, "{point}: visible state changed");
    assert_eq!(t.store.stats().page_count, stats_before.page_count);
    assert_eq!(t.store.stats().wal_frames, stats_before.wal_frames);

    // The writer slot is free again and later commits go through.
    t.store.put(&key(500), b"after").unwrap();

    let t = t.crash_and_reopen(small_pages());
    let after = collect(&t.store);
    assert_eq!(after.len(), 101, "{point}");
    assert!(after.iter().all(|(_, v)| v != b"lost"), "{point}");
    assert_eq!(t.store.get(&key(500)).unwrap(), Some(b"after".to_vec()));
    t.store.verify().unwrap();
}

#[test]
#[serial]
fn test_failure_before_wal_append() {
    assert_commit_fails_cleanly("commit.before_wal");
}

#[test]
#[serial]
fn test_failure_before_commit_marker() {
    assert_commit_fails_cleanly("commit.before_marker");
}

#[test]
#[serial]
fn test_failure_on_frame_append() {
    assert_commit_fails_cleanly("wal.append");
}

#[test]
#[serial]
fn test_failure_on_wal_fsync() {
    assert_commit_fails_cleanly("wal.sync");
}

/// A full volume while the log grows surfaces as `StorageFull` and loses nothing.
fn assert_disk_full_is_storage_full(point: &str) {
    failpoint::clear();
    let t = TestStore::new(small_pages());
    seed(&t.store, 100);
    let before = collect(&t.store);
    let page_count = t.store.stats().page_count;

    failpoint::enable_with(point, FailAction::DiskFull);
    let err = t.store.put(&key(500), b"lost").unwrap_err();
    failpoint::disable(point);
    assert!(
        matches!(err, StoreError::StorageFull { page_count: n } if n == page_count),
        "{point}: {err:?}"
    );

    assert_eq!(collect(&t.store), before);
    t.store.put(&key(501), b"after").unwrap();
    let t = t.crash_and_reopen(small_pages());
    assert_eq!(t.store.len(), 101, "{point}");
    assert_eq!(t.store.get(&key(500)).unwrap(), None);
    t.store.verify().unwrap();
}

#[test]
#[serial]
fn test_full_volume_on_frame_append() {
    assert_disk_full_is_storage_full("wal.append");
}

#[test]
#[serial]
fn test_full_volume_on_wal_fsync() {
    assert_disk_full_is_storage_full("wal.sync");
}

#[test]
#[serial]
fn test_full_volume_during_checkpoint() {
    failpoint::clear();
    let t = TestStore::new(small_pages());
    seed(&t.store, 200);

    failpoint::enable_with("pager.extend", FailAction::DiskFull);
    let err = t.store.checkpoint().unwrap_err();
    failpoint::disable("pager.extend");
    assert!(matches!(err, StoreError::StorageFull { .. }), "{err:?}");
    assert_eq!(t.store.len(), 200);
}

/// Opens a file left behind by a bootstrap that crashed, then uses it.
fn assert_bootstrap_restarts(path: &std::path::Path) {
    let store = Store::open(path, small_pages()).unwrap();
    assert!(store.is_empty());
    assert_eq!(store.get(&key(1)).unwrap(), None);
    assert_eq!(store.page_size(), 512);
    seed(&store, 50);
    store.verify().unwrap();
    drop(store);

    let store = Store::open(path, small_pages()).unwrap();
    assert_eq!(store.len(), 50);
    store.verify().unwrap();
}

#[test]
#[serial]
fn test_crash_after_header_before_root() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.db");
    fs::write(&path, &FileHeader::new(512).to_page().data).unwrap();
    // A log from an earlier database must not be replayed onto the new one.
    fs::write(wal_path(&path), b"stale").unwrap();
    assert_bootstrap_restarts(&path);
}

#[test]
#[serial]
fn test_crash_after_root_before_header() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.db");
    let mut root = Page::with_kind(1, 512, PageKind::Leaf);
    root.seal();
    let mut raw = vec![0u8; 512];
    raw.extend_from_slice(&root.data);
    fs::write(&path, &raw).unwrap();
    assert_bootstrap_restarts(&path);
}

#[test]
#[serial]
fn test_torn_header_on_new_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.db");
    fs::write(&path, &FileHeader::new(512).to_page().data[..30]).unwrap();
    assert_bootstrap_restarts(&path);
}

#[test]
#[serial]
fn test_frames_without_marker_are_discarded() {
    let t = TestStore::new(small_pages());
    seed(&t.store, 200);
    let before = collect(&t.store);
    let root = t.store.snapshot().root();
    let TestStore { store, path, dir } = t;
    drop(store);

    // A crash mid-commit: page frames reached the log, the marker did not.
    {
        let mut wal = Wal::open(&path, 512).unwrap();
        let bogus = Node::empty_leaf().encode(root, 512).unwrap();
        wal.append(&Frame::Page {
            txid: 999,
            page: Arc::new(bogus),
        })
        .unwrap();
        wal.sync().unwrap();
    }

    let store = Store::open(&path, small_pages()).unwrap();
    assert_eq!(collect(&store), before);
    store.verify().unwrap();
    assert_eq!(fs::metadata(wal_path(&path)).unwrap().len(), 16);
    drop(dir);
}

#[test]
#[serial]
fn test_torn_tail_is_ignored() {
    let t = TestStore::new(small_pages());
    seed(&t.store, 50);
    t.store.put(&key(999), b"last").unwrap();
    let TestStore { store, path, dir } = t;
    drop(store);

    let mut wal = OpenOptions::new()
        .append(true)
        .open(wal_path(&path))
        .unwrap();
    wal.write_all(&[1, 0, 0, 0, 0, 0, 0, 3, 0xE7, 0, 0]).unwrap();
    drop(wal);

    let store = Store::open(&path, small_pages()).unwrap();
    assert_eq!(store.len(), 51);
    assert_eq!(store.get(&key(999)).unwrap(), Some(b"last".to_vec()));
    drop(dir);
}

#[test]
#[serial]
fn test_replay_is_idempotent() {
    let t = TestStore::new(small_pages());
    seed(&t.store, 300);
    let mut tx = t.store.begin().unwrap();
    for i in (0..300).step_by(2) {
        tx.delete(&key(i)).unwrap();
    }
    tx.commit().unwrap();
    let expected = collect(&t.store);
    let TestStore { store, path, dir } = t;
    drop(store);

    let log = fs::read(wal_path(&path)).unwrap();
    assert!(log.len() > 16);

    // First recovery applies the log and truncates it.
    drop(Store::open(&path, small_pages()).unwrap());
    assert_eq!(fs::metadata(wal_path(&path)).unwrap().len(), 16);

    // Replaying the same log over an already-recovered file changes nothing.
    fs::write(wal_path(&path), &log).unwrap();
    let store = Store::open(&path, small_pages()).unwrap();
    assert_eq!(collect(&store), expected);
    store.verify().unwrap();
    drop(store);

    // A clean log is a no-op.
    let store = Store::open(&path, small_pages()).unwrap();
    assert_eq!(collect(&store), expected);
    drop(dir);
}

#[test]
#[serial]
fn test_failed_checkpoint_keeps_the_log() {
    failpoint::clear();
    let t = TestStore::new(small_pages());
    seed(&t.store, 100);
    let expected = collect(&t.store);

    failpoint::enable("checkpoint.before_truncate");
    assert!(t.store.checkpoint().is_err());
    failpoint::disable("checkpoint.before_truncate");
    assert!(t.store.stats().wal_frames > 0);
    assert_eq!(collect(&t.store), expected);

    t.store.put(&key(100), b"more").unwrap();
    let t = t.crash_and_reopen(small_pages());
    assert_eq!(t.store.len(), 101);
    t.store.verify().unwrap();
}

#[test]
#[serial]
fn test_failed_file_growth_during_checkpoint() {
    failpoint::clear();
    let t = TestStore::new(small_pages());
    seed(&t.store, 200);

    failpoint::enable("pager.extend");
    assert!(t.store.checkpoint().is_err());
    failpoint::disable("pager.extend");

    let t = t.crash_and_reopen(small_pages());
    assert_eq!(t.store.len(), 200);
    assert_eq!(t.store.checkpoint().unwrap(), 0);
}

#[test]
#[serial]
fn test_failpoint_from_environment() {
    let t = TestStore::new(small_pages());
    seed(&t.store, 10);

    std::env::set_var(failpoint::ENV_VAR, "wal.sync, commit.before_wal");
    let result = t.store.put(&key(77), b"x");
    std::env::remove_var(failpoint::ENV_VAR);

    assert!(result.is_err());
    assert_eq!(t.store.get(&key(77)).unwrap(), None);
    t.store.put(&key(77), b"x").unwrap();
    assert_eq!(t.store.len(), 11);
}

#[test]
#[serial]
fn test_committed_data_survives_repeated_crashes() {
    let mut t = TestStore::new(small_pages());
    for round in 0..5u32 {
        let mut tx = t.store.begin().unwrap();
        for i in 0..100 {
            tx.put(&key(round * 100 + i), &round.to_be_bytes()).unwrap();
        }
        tx.commit().unwrap();

        // An abandoned transaction never reaches the log.
        let mut tx = t.store.begin().unwrap();
        tx.put(&key(9_999), b"never").unwrap();
        drop(tx);

        t = t.crash_and_reopen(small_pages());
        assert_eq!(t.store.len(), (round as u64 + 1) * 100);
        assert_eq!(t.store.get(&key(9_999)).unwrap(), None);
    }
    t.store.verify().unwrap();
}
