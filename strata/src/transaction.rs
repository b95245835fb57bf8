//! Transaction management.
//!
//! One writer at a time builds its changes in memory and publishes them as a
//! new snapshot on commit. Readers never block: they pin whatever snapshot is
//! current when they start.
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::iter::Peekable;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::cursor::Cursor;
use crate::error::{Result, StoreError};
use crate::store::Store;
use crate::{PageId, TxId};

/// A committed state of the tree.
///
/// Only reachable through an `Arc` handed out by the store: the pages it
/// refers to stay allocated for as long as that `Arc` is alive.
#[derive(Debug, PartialEq, Eq)]
pub struct Snapshot {
    /// Last transaction whose changes are visible.
    pub(crate) txid: TxId,
    pub(crate) root: PageId,
    pub(crate) records: u64,
    pub(crate) page_count: u32,
}

impl Snapshot {
    pub fn txid(&self) -> TxId {
        self.txid
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    /// Records visible in this snapshot.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }
}

/// Hands out transaction ids, guards the single writer slot and tracks which
/// snapshots are still pinned by readers.
#[derive(Debug)]
pub struct TransactionManager {
    writer_active: AtomicBool,
    next_txid: AtomicU64,
    current: RwLock<Arc<Snapshot>>,
    /// Snapshots replaced by later commits. Dead entries are pruned lazily.
    retired: Mutex<Vec<Weak<Snapshot>>>,
}

impl TransactionManager {
    pub fn new(next_txid: TxId, snapshot: Snapshot) -> Self {
        Self {
            writer_active: AtomicBool::new(false),
            next_txid: AtomicU64::new(next_txid),
            current: RwLock::new(Arc::new(snapshot)),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Claims the writer slot without starting a transaction.
    pub fn try_acquire(&self) -> Result<()> {
        self.writer_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| StoreError::TransactionAlreadyActive)
    }

    /// Claims the writer slot and assigns the next transaction id.
    pub fn begin_write(&self) -> Result<(TxId, Arc<Snapshot>)> {
        self.try_acquire()?;
        let txid = self.next_txid.fetch_add(1, Ordering::SeqCst);
        Ok((txid, self.current()))
    }

    pub fn end_write(&self) {
        self.writer_active.store(false, Ordering::Release);
    }

    pub fn is_writer_active(&self) -> bool {
        self.writer_active.load(Ordering::Acquire)
    }

    pub fn next_txid(&self) -> TxId {
        self.next_txid.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    /// Makes `snapshot` current. The replaced one stays tracked while any
    /// reader still holds it.
    pub fn publish(&self, snapshot: Snapshot) {
        let snapshot = Arc::new(snapshot);
        let old = std::mem::replace(&mut *self.current.write(), snapshot);
        trace!(old = old.txid, "published snapshot");
        self.retired.lock().push(Arc::downgrade(&old));
    }

    /// Txid of the oldest retired snapshot that is still alive.
    pub fn oldest_reader(&self) -> Option<TxId> {
        let mut retired = self.retired.lock();
        retired.retain(|weak| weak.strong_count() > 0);
        retired
            .iter()
            .filter_map(Weak::upgrade)
            .map(|snapshot| snapshot.txid)
            .min()
    }
}

/// What a commit did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitInfo {
    pub txid: TxId,
    /// Buffered puts and deletes applied to the tree.
    pub mutations: usize,
    /// Page frames written to the WAL.
    pub frames: usize,
    pub wal_bytes: u64,
}

/// A read-write transaction. Changes are buffered and only become visible to
/// other readers when [`Transaction::commit`] succeeds. Dropping an unfinished
/// transaction rolls it back.
pub struct Transaction<'s> {
    store: &'s Store,
    id: TxId,
    snapshot: Arc<Snapshot>,
    /// `None` marks a delete.
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    finished: bool,
}

impl<'s> Transaction<'s> {
    pub(crate) fn new(store: &'s Store, id: TxId, snapshot: Arc<Snapshot>) -> Self {
        debug!(txid = id, base = snapshot.txid, "transaction started");
        Self {
            store,
            id,
            snapshot,
            writes: BTreeMap::new(),
            finished: false,
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    /// The committed state this transaction reads through.
    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    /// Number of buffered mutations.
    pub fn pending(&self) -> usize {
        self.writes.len()
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.writes.get(key) {
            Some(write) => Ok(write.clone()),
            None => self.store.get_at(&self.snapshot, key),
        }
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Inserts or replaces a key.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.store.layout().check_key(key)?;
        self.writes.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    /// Removes a key. Returns whether it was present.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        if !self.contains_key(key)? {
            return Ok(false);
        }
        self.writes.insert(key.to_vec(), None);
        Ok(true)
    }

    /// Replaces the value of an existing key, failing with `NotFound` otherwise.
    pub fn update(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if !self.contains_key(key)? {
            return Err(StoreError::NotFound);
        }
        self.put(key, value)
    }

    /// All visible pairs, including this transaction's own changes.
    pub fn scan(&self) -> TxScan<'_> {
        self.scan_range(None, None)
    }

    /// Visible pairs with `low <= key < high`.
    pub fn scan_range(&self, low: Option<&[u8]>, high: Option<&[u8]>) -> TxScan<'_> {
        let high = match (low, high) {
            (Some(low), Some(high)) if high < low => Some(low),
            (_, high) => high,
        };
        let base = Cursor::new(
            self.store,
            self.snapshot.clone(),
            low.map(<[u8]>::to_vec),
            high.map(<[u8]>::to_vec),
        );
        let lower = low.map_or(Bound::Unbounded, Bound::Included);
        let upper = high.map_or(Bound::Unbounded, Bound::Excluded);
        TxScan {
            base: base.peekable(),
            writes: self.writes.range::<[u8], _>((lower, upper)).peekable(),
        }
    }

    /// Applies the buffered changes atomically. The writer slot is released
    /// whether or not the commit succeeds.
    pub fn commit(mut self) -> Result<CommitInfo> {
        self.finished = true;
        let writes = std::mem::take(&mut self.writes);
        let result = self.store.commit_writes(self.id, &self.snapshot, writes);
        self.store.release_writer();
        result
    }

    /// Discards the buffered changes.
    pub fn rollback(mut self) {
        self.finished = true;
        self.writes.clear();
        self.store.release_writer();
        debug!(txid = self.id, "transaction rolled back");
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.store.release_writer();
            debug!(txid = self.id, "transaction dropped without commit, rolled back");
        }
    }
}

#[derive(PartialEq, Eq)]
enum Pick {
    Base,
    Write,
    Both,
}

/// Merges a snapshot cursor with a transaction's buffered writes.
pub struct TxScan<'t> {
    base: Peekable<Cursor<'t, Store>>,
    writes: Peekable<btree_map::Range<'t, Vec<u8>, Option<Vec<u8>>>>,
}

impl Iterator for TxScan<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let pick = match (self.base.peek(), self.writes.peek()) {
                (None, None) => return None,
                (Some(Err(_)), _) | (Some(Ok(_)), None) => Pick::Base,
                (None, Some(_)) => Pick::Write,
                (Some(Ok((base_key, _))), Some((write_key, _))) => {
                    match base_key.as_slice().cmp(write_key.as_slice()) {
                        std::cmp::Ordering::Less => Pick::Base,
                        std::cmp::Ordering::Greater => Pick::Write,
                        std::cmp::Ordering::Equal => Pick::Both,
                    }
                }
            };
            if pick == Pick::Base {
                return self.base.next();
            }
            if pick == Pick::Both {
                self.base.next();
            }
            let (key, write) = self.writes.next()?;
            if let Some(value) = write {
                return Some(Ok((key.clone(), value.clone())));
            }
        }
    }
}
