#![allow(dead_code)]

use std::path::{Path, PathBuf};

use strata::{Store, StoreOptions};
use tempfile::{tempdir, TempDir};

/// A store in a scratch directory that is removed when the value is dropped.
pub struct TestStore {
    pub store: Store,
    pub path: PathBuf,
    pub dir: TempDir,
}

impl TestStore {
    pub fn new(options: StoreOptions) -> Self {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = Store::open(&path, options.clone()).unwrap();
        Self {
            store,
            path,
            dir,
        }
    }

    /// Drops the store without closing it and opens the files again, the way
    /// a process restarting after a crash would.
    pub fn crash_and_reopen(self, options: StoreOptions) -> Self {
        let TestStore { store, path, dir } = self;
        drop(store);
        let store = Store::open(&path, options).unwrap();
        Self { store, path, dir }
    }
}

/// Small pages so that trees grow several levels with little data.
pub fn small_pages() -> StoreOptions {
    StoreOptions::default()
        .with_page_size(512)
        .with_cache_capacity(32)
}

pub fn wal_path(db: &Path) -> PathBuf {
    strata::wal::path_for(db)
}

pub fn collect(store: &Store) -> Vec<(Vec<u8>, Vec<u8>)> {
    store.scan().map(|item| item.unwrap()).collect()
}

pub fn key(i: u32) -> Vec<u8> {
    format!("key-{i:08}").into_bytes()
}
