//! The store facade: opening, recovery, the read path and the commit pipeline.
//!
//! Lock order is `state`, then `wal_index`, then `wal`, then `pager`. A commit
//! appends under `wal` alone and only then takes `wal_index` to publish.
//! Readers fetch logged pages through `wal_reader` and never take `wal`.
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::btree::{btree_lookup, check_tree, TreeOutcome, TreeStats, TreeWriter};
use crate::cache::PageCache;
use crate::config::StoreOptions;
use crate::cursor::Cursor;
use crate::error::{Result, StoreError};
use crate::failpoint;
use crate::freelist::FreeList;
use crate::header::FileHeader;
use crate::node::{Node, NodeLayout};
use crate::page::Page;
use crate::page_store::{PageSource, PageStore};
use crate::pager::Pager;
use crate::transaction::{CommitInfo, Snapshot, Transaction, TransactionManager};
use crate::wal::{self, Frame, ReplayReport, Wal, WalReader};
use crate::{PageId, TxId, HEADER_PAGE_ID};

/// Lazily iterates a committed snapshot.
pub type ScanIter<'s> = Cursor<'s, Store>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub page_count: u32,
    pub free_pages: usize,
    /// Page frames waiting in the WAL for the next checkpoint.
    pub wal_frames: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub last_txid: TxId,
}

/// Allocator and header as of the last commit. Only the writer touches it.
struct CommitState {
    header: FileHeader,
    freelist: FreeList,
}

pub struct Store {
    path: PathBuf,
    options: StoreOptions,
    page_size: usize,
    layout: NodeLayout,
    pager: Mutex<Pager>,
    wal: Mutex<Wal>,
    wal_reader: WalReader,
    /// Offset of the latest committed frame of every page logged since the
    /// last checkpoint.
    wal_index: RwLock<HashMap<PageId, u64>>,
    cache: PageCache,
    tm: TransactionManager,
    state: Mutex<CommitState>,
    /// Page count of the newest published snapshot.
    page_count: AtomicU32,
    poisoned: AtomicBool,
    poison_reason: Mutex<Option<String>>,
}

impl Store {
    /// Opens or creates the database at `path`, replaying its WAL.
    pub fn open<P: AsRef<Path>>(path: P, options: StoreOptions) -> Result<Self> {
        options.validate()?;
        let path = path.as_ref().to_path_buf();
        let mut pager = Pager::open(&path, options.page_size)?;
        let page_size = pager.page_size();
        if page_size != options.page_size {
            warn!(
                requested = options.page_size,
                on_disk = page_size,
                "ignoring page size option for an existing database"
            );
        }

        if pager.is_new() {
            let wal_path = wal::path_for(&path);
            match fs::remove_file(&wal_path) {
                Ok(()) => warn!(path = %wal_path.display(), "removed WAL left without a database"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            bootstrap(&mut pager)?;
        }

        let mut wal = Wal::open(&path, page_size)?;
        let report: ReplayReport = wal.recover(&mut pager)?;
        let wal_reader = wal.reader()?;
        let header = pager.read_header()?;
        if header.page_size as usize != page_size {
            return Err(StoreError::corrupt(
                HEADER_PAGE_ID,
                format!("header page size {} disagrees with the file", header.page_size),
            ));
        }
        let freelist = FreeList::load(
            header.freelist_head,
            header.freelist_count,
            header.page_count,
            options.max_pages,
            |id| pager.read_page(id),
        )?;

        let next_txid = header.next_txid.max(report.max_txid + 1);
        let snapshot = Snapshot {
            txid: header.last_txid,
            root: header.root,
            records: header.record_count,
            page_count: header.page_count,
        };
        info!(
            path = %path.display(),
            page_size,
            page_count = header.page_count,
            records = header.record_count,
            free_pages = freelist.free_count(),
            next_txid,
            replayed_groups = report.applied_groups,
            "store opened"
        );

        Ok(Self {
            layout: NodeLayout::new(page_size),
            cache: PageCache::new(options.cache_capacity),
            tm: TransactionManager::new(next_txid, snapshot),
            page_count: AtomicU32::new(header.page_count),
            state: Mutex::new(CommitState { header, freelist }),
            pager: Mutex::new(pager),
            wal: Mutex::new(wal),
            wal_reader,
            wal_index: RwLock::new(HashMap::new()),
            poisoned: AtomicBool::new(false),
            poison_reason: Mutex::new(None),
            path,
            options,
            page_size,
        })
    }

    pub fn open_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(path, StoreOptions::default())
    }

    /// Checkpoints the log and syncs the database file.
    pub fn close(self) -> Result<()> {
        self.checkpoint()?;
        self.pager.lock().sync()?;
        info!(path = %self.path.display(), "store closed");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub(crate) fn layout(&self) -> &NodeLayout {
        &self.layout
    }

    fn check_poison(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            let reason = self
                .poison_reason
                .lock()
                .clone()
                .unwrap_or_else(|| "unknown failure".to_string());
            return Err(StoreError::Poisoned(reason));
        }
        Ok(())
    }

    fn poison(&self, err: &StoreError) {
        let mut reason = self.poison_reason.lock();
        if reason.is_none() {
            error!(%err, "fatal storage error, store poisoned");
            *reason = Some(err.to_string());
        }
        self.poisoned.store(true, Ordering::Release);
    }

    /// Reads a committed page image from the WAL if it was logged since the
    /// last checkpoint, else from the database file.
    fn read_committed(&self, page_id: PageId) -> Result<Page> {
        let logged = {
            let index = self.wal_index.read();
            match index.get(&page_id) {
                Some(&offset) => Some(self.wal_reader.read_page_image(offset, page_id)?),
                None => None,
            }
        };
        let page = match logged {
            Some(page) => page,
            None => self.pager.lock().read_page(page_id)?,
        };
        page.verify()?;
        Ok(page)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_at(&self.tm.current(), key)
    }

    /// Looks `key` up in a snapshot taken earlier with [`Store::snapshot`].
    /// Holding the `Arc` keeps every page of that snapshot readable.
    pub fn get_at(&self, snapshot: &Arc<Snapshot>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_poison()?;
        if key.len() > self.layout.max_key {
            return Ok(None);
        }
        btree_lookup(self, snapshot.page_count, snapshot.root, key)
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Iterates every record of the current snapshot in key order.
    pub fn scan(&self) -> ScanIter<'_> {
        self.scan_range(None, None)
    }

    /// Iterates records with `low <= key < high` in the current snapshot.
    pub fn scan_range(&self, low: Option<&[u8]>, high: Option<&[u8]>) -> ScanIter<'_> {
        Cursor::new(
            self,
            self.tm.current(),
            low.map(<[u8]>::to_vec),
            high.map(<[u8]>::to_vec),
        )
    }

    /// Number of records in the current snapshot.
    pub fn len(&self) -> u64 {
        self.tm.current().records
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The snapshot new readers see.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.tm.current()
    }

    /// Starts the write transaction. Fails with `TransactionAlreadyActive`
    /// while another one is open.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        self.check_poison()?;
        let (txid, snapshot) = self.tm.begin_write()?;
        Ok(Transaction::new(self, txid, snapshot))
    }

    pub fn commit(&self, tx: Transaction<'_>) -> Result<CommitInfo> {
        tx.commit()
    }

    pub fn rollback(&self, tx: Transaction<'_>) {
        tx.rollback()
    }

    /// Inserts or replaces one key in its own transaction.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<CommitInfo> {
        let mut tx = self.begin()?;
        tx.put(key, value)?;
        tx.commit()
    }

    /// Deletes one key in its own transaction. Returns whether it existed.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let mut tx = self.begin()?;
        let removed = tx.delete(key)?;
        tx.commit()?;
        Ok(removed)
    }

    /// Replaces the value of an existing key in its own transaction.
    pub fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut tx = self.begin()?;
        tx.update(key, value)?;
        tx.commit()?;
        Ok(())
    }

    pub(crate) fn release_writer(&self) {
        self.tm.end_write();
    }

    /// Runs the commit pipeline for a transaction's buffered writes.
    pub(crate) fn commit_writes(
        &self,
        txid: TxId,
        base: &Snapshot,
        writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    ) -> Result<CommitInfo> {
        self.check_poison()?;
        if writes.is_empty() {
            debug!(txid, "empty commit");
            return Ok(CommitInfo {
                txid,
                ..CommitInfo::default()
            });
        }
        let mutations = writes.len();
        let mut state = self.state.lock();

        let mut freelist = state.freelist.clone();
        freelist.reclaim(self.tm.oldest_reader());
        let mut tree = TreeWriter::new(PageStore::new(self, freelist), base.root, base.records);
        for (key, write) in &writes {
            match write {
                Some(value) => {
                    tree.insert(key, value)?;
                }
                None => {
                    tree.delete(key)?;
                }
            }
        }
        let TreeOutcome {
            store,
            root,
            records,
        } = tree.finish()?;
        let (mut pages, mut freelist) = store.into_parts();
        freelist.seal_pending(txid);
        pages.extend(freelist.write_trunks(self.page_size)?);

        let mut header = state.header.clone();
        header.page_count = freelist.page_count();
        header.root = root;
        header.freelist_head = freelist.head();
        header.freelist_count = freelist.free_count() as u32;
        header.next_txid = txid + 1;
        header.record_count = records;
        header.last_txid = txid;
        pages.push(header.to_page());
        let pages: Vec<Arc<Page>> = pages.into_iter().map(Arc::new).collect();

        failpoint::maybe_fail("commit.before_wal")?;
        let (offsets, wal_bytes, wal_frames) = {
            let mut wal = self.wal.lock();
            let grown_from = state.header.page_count;
            match append_group(&mut wal, txid, &pages, self.options.sync_on_commit)
                .map_err(|err| err.for_growth(grown_from))
            {
                Ok((offsets, wal_bytes)) => {
                    wal.mark_committed(pages.len() as u64);
                    (offsets, wal_bytes, wal.frame_count())
                }
                Err(err) => {
                    if let Err(discard_err) = wal.discard_tail() {
                        warn!(%discard_err, "could not discard uncommitted WAL tail");
                    }
                    warn!(txid, %err, "commit failed, nothing published");
                    return Err(err);
                }
            }
        };

        {
            let mut index = self.wal_index.write();
            index.extend(offsets);
        }
        for page in &pages {
            if page.id != HEADER_PAGE_ID {
                self.cache.insert(page.clone());
            }
        }
        self.page_count.store(header.page_count, Ordering::Release);
        let snapshot = Snapshot {
            txid,
            root,
            records,
            page_count: header.page_count,
        };
        state.header = header;
        state.freelist = freelist;
        self.tm.publish(snapshot);
        debug!(txid, mutations, frames = pages.len(), wal_bytes, "transaction committed");

        if wal_frames >= self.options.checkpoint_threshold {
            if let Err(err) = self.checkpoint_locked() {
                warn!(%err, "automatic checkpoint failed");
            }
        }

        Ok(CommitInfo {
            txid,
            mutations,
            frames: pages.len(),
            wal_bytes,
        })
    }

    /// Copies logged pages into the database file and empties the log.
    /// Fails with `TransactionAlreadyActive` while a writer is open.
    pub fn checkpoint(&self) -> Result<usize> {
        self.check_poison()?;
        self.tm.try_acquire()?;
        let result = {
            let _state = self.state.lock();
            self.checkpoint_locked()
        };
        self.tm.end_write();
        result
    }

    /// Checkpoint body; the caller holds the state lock.
    fn checkpoint_locked(&self) -> Result<usize> {
        let mut entries: Vec<(PageId, u64)> = self
            .wal_index
            .read()
            .iter()
            .map(|(&id, &offset)| (id, offset))
            .collect();
        if entries.is_empty() && self.wal.lock().is_empty() {
            return Ok(0);
        }
        entries.sort_unstable();
        for &(page_id, offset) in &entries {
            let page = self.wal_reader.read_page_image(offset, page_id)?;
            self.pager.lock().write_page(&page)?;
        }
        self.pager.lock().sync()?;
        failpoint::maybe_fail("checkpoint.before_truncate")?;
        {
            let mut index = self.wal_index.write();
            self.wal.lock().truncate()?;
            index.clear();
        }
        info!(pages = entries.len(), "checkpoint complete");
        Ok(entries.len())
    }

    /// Walks the current tree and checks its structure against the allocator.
    pub fn verify(&self) -> Result<TreeStats> {
        self.check_poison()?;
        let state = self.state.lock();
        let snapshot = self.tm.current();
        let freelist = &state.freelist;
        let stats = check_tree(self, snapshot.page_count, snapshot.root, |id| {
            freelist.is_free(id) || freelist.is_trunk(id)
        })?;
        if stats.records != snapshot.records {
            return Err(StoreError::corrupt(
                snapshot.root,
                format!(
                    "tree holds {} records, header says {}",
                    stats.records, snapshot.records
                ),
            ));
        }
        Ok(stats)
    }

    pub fn stats(&self) -> StoreStats {
        let free_pages = self.state.lock().freelist.free_count();
        StoreStats {
            page_count: self.page_count.load(Ordering::Acquire),
            free_pages,
            wal_frames: self.wal.lock().frame_count(),
            cache_hits: self.cache.hits(),
            cache_misses: self.cache.misses(),
            last_txid: self.tm.current().txid,
        }
    }
}

impl PageSource for Store {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn load(&self, page_id: PageId) -> Result<Arc<Page>> {
        self.check_poison()?;
        let page_count = self.page_count.load(Ordering::Acquire);
        let result = if page_id == HEADER_PAGE_ID || page_id >= page_count {
            Err(StoreError::InvalidPage {
                page_id,
                page_count,
            })
        } else if let Some(page) = self.cache.get(page_id) {
            return Ok(page);
        } else {
            self.read_committed(page_id)
        };
        match result {
            Ok(page) => {
                let page = Arc::new(page);
                self.cache.insert(page.clone());
                Ok(page)
            }
            Err(err) => {
                if err.is_fatal() {
                    self.poison(&err);
                }
                Err(err)
            }
        }
    }
}

/// Writes an empty root leaf and then the header page into a brand-new file.
/// The header is written only once the root it points at is durable.
fn bootstrap(pager: &mut Pager) -> Result<()> {
    let page_size = pager.page_size();
    let header = FileHeader::new(page_size as u32);
    pager.write_page(&Node::empty_leaf().encode(header.root, page_size)?)?;
    pager.sync()?;
    pager.write_page(&header.to_page())?;
    pager.sync()?;
    debug!(page_size, "bootstrapped new database file");
    Ok(())
}

/// Appends one transaction's page frames and its commit marker. Returns the
/// offset of every page frame and the bytes appended.
fn append_group(
    wal: &mut Wal,
    txid: TxId,
    pages: &[Arc<Page>],
    sync: bool,
) -> Result<(Vec<(PageId, u64)>, u64)> {
    let start = wal.len();
    let mut offsets = Vec::with_capacity(pages.len());
    for page in pages {
        let offset = wal.append(&Frame::Page {
            txid,
            page: page.clone(),
        })?;
        offsets.push((page.id, offset));
    }
    failpoint::maybe_fail("commit.before_marker")?;
    wal.append(&Frame::Commit {
        txid,
        frame_count: pages.len() as u32,
    })?;
    if sync {
        wal.sync()?;
    }
    Ok((offsets, wal.len() - start))
}
