//! The page store seen by one commit.
//!
//! Committed pages are read through a [`PageSource`]. Everything the commit
//! allocates, writes or frees is staged here and only reaches disk as WAL
//! frames once the commit is logged.
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::error::{Result, StoreError};
use crate::freelist::FreeList;
use crate::page::Page;
use crate::PageId;

/// Read access to committed page images.
pub trait PageSource {
    fn page_size(&self) -> usize;

    /// Loads and verifies a committed page.
    fn load(&self, page_id: PageId) -> Result<Arc<Page>>;
}

pub struct PageStore<'a, S: PageSource + ?Sized> {
    source: &'a S,
    freelist: FreeList,
    dirty: BTreeMap<PageId, Page>,
    /// Pages allocated by this commit; no snapshot can reference them yet.
    fresh: HashSet<PageId>,
}

impl<'a, S: PageSource + ?Sized> PageStore<'a, S> {
    pub fn new(source: &'a S, freelist: FreeList) -> Self {
        Self {
            source,
            freelist,
            dirty: BTreeMap::new(),
            fresh: HashSet::new(),
        }
    }

    pub fn source(&self) -> &'a S {
        self.source
    }

    pub fn page_size(&self) -> usize {
        self.source.page_size()
    }

    pub fn page_count(&self) -> u32 {
        self.freelist.page_count()
    }

    fn check_range(&self, page_id: PageId) -> Result<()> {
        if page_id >= self.freelist.page_count() {
            return Err(StoreError::InvalidPage {
                page_id,
                page_count: self.freelist.page_count(),
            });
        }
        Ok(())
    }

    pub fn allocate(&mut self) -> Result<PageId> {
        let page_id = self.freelist.allocate()?;
        self.fresh.insert(page_id);
        Ok(page_id)
    }

    /// The staged image if this commit wrote the page, else the committed one.
    pub fn read(&self, page_id: PageId) -> Result<Arc<Page>> {
        self.check_range(page_id)?;
        match self.dirty.get(&page_id) {
            Some(page) => Ok(Arc::new(page.clone())),
            None => self.source.load(page_id),
        }
    }

    /// Stages a sealed page image.
    pub fn write(&mut self, page: Page) -> Result<()> {
        self.check_range(page.id)?;
        if page.size() != self.page_size() {
            return Err(StoreError::corrupt(
                page.id,
                format!("page image is {} bytes", page.size()),
            ));
        }
        self.dirty.insert(page.id, page);
        Ok(())
    }

    /// Frees a page. Pages allocated by this commit are reusable immediately;
    /// committed pages wait in quarantine for older readers to finish.
    pub fn free(&mut self, page_id: PageId) -> Result<()> {
        self.dirty.remove(&page_id);
        if self.fresh.remove(&page_id) {
            self.freelist.release(page_id)
        } else {
            self.freelist.free(page_id)
        }
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    pub fn freelist(&self) -> &FreeList {
        &self.freelist
    }

    /// Staged pages in page-id order plus the updated allocator.
    pub fn into_parts(self) -> (Vec<Page>, FreeList) {
        (self.dirty.into_values().collect(), self.freelist)
    }
}
