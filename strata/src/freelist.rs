//! Page allocation and the persisted free list.
//!
//! Freed pages cannot be handed out right away: a reader holding an older
//! snapshot may still walk them. They are parked in a quarantine batch tagged
//! with the freeing transaction and only become allocatable once every live
//! snapshot is at least that new.
//!
//! On disk the free set is a chain of trunk pages:
//!
//! ```text
//! [crc32 u32][kind u8 = 4][next u32][count u32][page id u32 ...]
//! ```
use std::collections::{BTreeSet, HashSet, VecDeque};

use tracing::{debug, trace, warn};

use crate::error::{Result, StoreError};
use crate::page::{Page, PageKind, PAGE_BODY_OFFSET};
use crate::{PageId, TxId, HEADER_PAGE_ID};

const TRUNK_NEXT_OFFSET: usize = PAGE_BODY_OFFSET;
const TRUNK_COUNT_OFFSET: usize = PAGE_BODY_OFFSET + 4;
const TRUNK_IDS_OFFSET: usize = PAGE_BODY_OFFSET + 8;

/// Number of page ids one trunk page can record.
pub fn trunk_capacity(page_size: usize) -> usize {
    (page_size - TRUNK_IDS_OFFSET) / 4
}

#[derive(Debug, Clone)]
pub struct FreeList {
    /// Free pages nobody can observe any more.
    available: BTreeSet<PageId>,
    /// Batches freed by committed transactions, oldest first.
    quarantine: VecDeque<(TxId, Vec<PageId>)>,
    /// Pages retired by the commit in progress.
    pending: Vec<PageId>,
    /// Every id in `available`, `quarantine` and `pending`.
    members: HashSet<PageId>,
    /// Pages currently holding the persisted list.
    trunks: Vec<PageId>,
    page_count: u32,
    max_pages: Option<u32>,
    dirty: bool,
}

impl FreeList {
    pub fn new(page_count: u32, max_pages: Option<u32>) -> Self {
        Self {
            available: BTreeSet::new(),
            quarantine: VecDeque::new(),
            pending: Vec::new(),
            members: HashSet::new(),
            trunks: Vec::new(),
            page_count,
            max_pages,
            dirty: false,
        }
    }

    /// Rebuilds the list from its trunk chain. Every recorded page is immediately
    /// available since no reader survives a restart.
    pub fn load<F>(
        head: PageId,
        count: u32,
        page_count: u32,
        max_pages: Option<u32>,
        mut read: F,
    ) -> Result<Self>
    where
        F: FnMut(PageId) -> Result<Page>,
    {
        let mut list = Self::new(page_count, max_pages);
        let mut current = head;
        while current != 0 {
            if current >= page_count || list.trunks.contains(&current) {
                return Err(StoreError::corrupt(
                    current,
                    "free-list chain points outside the file or loops",
                ));
            }
            let page = read(current)?;
            page.expect_kind(PageKind::FreeTrunk)?;
            let entries = page.read_u32(TRUNK_COUNT_OFFSET) as usize;
            if entries > trunk_capacity(page.size()) {
                return Err(StoreError::corrupt(
                    current,
                    format!("trunk claims {entries} entries"),
                ));
            }
            for i in 0..entries {
                let id = page.read_u32(TRUNK_IDS_OFFSET + i * 4);
                if id == HEADER_PAGE_ID || id >= page_count || !list.members.insert(id) {
                    return Err(StoreError::corrupt(
                        current,
                        format!("invalid or repeated free page id {id}"),
                    ));
                }
                list.available.insert(id);
            }
            list.trunks.push(current);
            current = page.read_u32(TRUNK_NEXT_OFFSET);
        }
        if list.members.len() != count as usize {
            return Err(StoreError::corrupt(
                head,
                format!(
                    "free list holds {} pages, header says {count}",
                    list.members.len()
                ),
            ));
        }
        debug!(free = count, trunks = list.trunks.len(), "loaded free list");
        Ok(list)
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    /// Pages recorded as free, quarantined ones included.
    pub fn free_count(&self) -> usize {
        self.members.len()
    }

    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    pub fn is_free(&self, id: PageId) -> bool {
        self.members.contains(&id)
    }

    pub fn is_trunk(&self, id: PageId) -> bool {
        self.trunks.contains(&id)
    }

    pub fn head(&self) -> PageId {
        self.trunks.first().copied().unwrap_or(0)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Pops the lowest available page, else extends the page count by one.
    pub fn allocate(&mut self) -> Result<PageId> {
        if let Some(id) = self.available.pop_first() {
            self.members.remove(&id);
            self.dirty = true;
            trace!(page_id = id, "reused free page");
            return Ok(id);
        }
        self.extend()
    }

    fn extend(&mut self) -> Result<PageId> {
        if let Some(max) = self.max_pages {
            if self.page_count >= max {
                return Err(StoreError::StorageFull {
                    page_count: self.page_count,
                });
            }
        }
        let id = self.page_count;
        self.page_count = self
            .page_count
            .checked_add(1)
            .ok_or(StoreError::StorageFull { page_count: id })?;
        trace!(page_id = id, "extended page count");
        Ok(id)
    }

    fn check_range(&self, id: PageId) -> Result<()> {
        if id == HEADER_PAGE_ID || id >= self.page_count {
            return Err(StoreError::InvalidPage {
                page_id: id,
                page_count: self.page_count,
            });
        }
        Ok(())
    }

    /// Retires a page that published snapshots may still reference.
    /// Freeing an already-free page is a logged no-op.
    pub fn free(&mut self, id: PageId) -> Result<()> {
        self.check_range(id)?;
        if !self.members.insert(id) {
            warn!(page_id = id, "double free ignored");
            return Ok(());
        }
        self.pending.push(id);
        self.dirty = true;
        Ok(())
    }

    /// Returns a page no reader has ever seen straight to the available set.
    pub fn release(&mut self, id: PageId) -> Result<()> {
        self.check_range(id)?;
        if !self.members.insert(id) {
            warn!(page_id = id, "double free ignored");
            return Ok(());
        }
        self.available.insert(id);
        self.dirty = true;
        Ok(())
    }

    /// Closes the current commit's retired pages into a quarantine batch.
    pub fn seal_pending(&mut self, txid: TxId) {
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending);
        trace!(txid, pages = batch.len(), "quarantined freed pages");
        self.quarantine.push_back((txid, batch));
    }

    /// Makes quarantined batches allocatable once no snapshot older than the
    /// freeing transaction is alive. `oldest_reader` is the txid of the oldest
    /// live snapshot other than the current one, if any.
    pub fn reclaim(&mut self, oldest_reader: Option<TxId>) -> usize {
        let mut reclaimed = 0;
        while let Some((txid, _)) = self.quarantine.front() {
            if matches!(oldest_reader, Some(oldest) if oldest < *txid) {
                break;
            }
            if let Some((_, batch)) = self.quarantine.pop_front() {
                reclaimed += batch.len();
                self.available.extend(batch);
            }
        }
        if reclaimed > 0 {
            trace!(reclaimed, "reclaimed quarantined pages");
        }
        reclaimed
    }

    fn trunks_needed(&self, entries: usize, capacity: usize) -> usize {
        entries.div_ceil(capacity)
    }

    /// Rewrites the trunk chain if the free set changed since the last call.
    /// Returns the sealed trunk pages to log, or nothing when clean.
    pub fn write_trunks(&mut self, page_size: usize) -> Result<Vec<Page>> {
        if !self.dirty {
            return Ok(Vec::new());
        }
        let capacity = trunk_capacity(page_size);
        loop {
            let needed = self.trunks_needed(self.members.len(), capacity);
            if self.trunks.len() < needed {
                let id = match self.available.pop_first() {
                    Some(id) => {
                        self.members.remove(&id);
                        id
                    }
                    None => self.extend()?,
                };
                self.trunks.push(id);
            } else if self.trunks.len() > needed
                && self.trunks.len() > self.trunks_needed(self.members.len() + 1, capacity)
            {
                if let Some(id) = self.trunks.pop() {
                    self.members.insert(id);
                    self.available.insert(id);
                }
            } else {
                break;
            }
        }

        let ids: Vec<PageId> = {
            let mut ids: Vec<PageId> = self.members.iter().copied().collect();
            ids.sort_unstable();
            ids
        };
        let mut pages = Vec::with_capacity(self.trunks.len());
        let mut chunks = ids.chunks(capacity);
        for (i, &trunk_id) in self.trunks.iter().enumerate() {
            let chunk = chunks.next().unwrap_or(&[]);
            let mut page = Page::with_kind(trunk_id, page_size, PageKind::FreeTrunk);
            let next = self.trunks.get(i + 1).copied().unwrap_or(0);
            page.write_u32(TRUNK_NEXT_OFFSET, next);
            page.write_u32(TRUNK_COUNT_OFFSET, chunk.len() as u32);
            for (slot, id) in chunk.iter().enumerate() {
                page.write_u32(TRUNK_IDS_OFFSET + slot * 4, *id);
            }
            page.seal();
            pages.push(page);
        }
        self.dirty = false;
        debug!(
            free = ids.len(),
            trunks = pages.len(),
            "rewrote free-list trunks"
        );
        Ok(pages)
    }
}
