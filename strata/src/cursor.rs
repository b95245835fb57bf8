//! Ordered iteration over one snapshot of the tree.
use std::sync::Arc;

use crate::btree::resolve_value;
use crate::error::Result;
use crate::node::{child_index, LeafEntry, Node};
use crate::page_store::PageSource;
use crate::transaction::Snapshot;
use crate::PageId;

/// Iterates `(key, value)` pairs in ascending key order within
/// `[low, high)`. The cursor holds its snapshot, so pages it may still visit
/// stay out of the allocator until it is dropped.
pub struct Cursor<'s, S: PageSource + ?Sized> {
    source: &'s S,
    snapshot: Arc<Snapshot>,
    low: Option<Vec<u8>>,
    high: Option<Vec<u8>>,
    /// Children of each internal node on the current path, with the index of
    /// the next child to descend into.
    stack: Vec<(Vec<PageId>, usize)>,
    entries: std::vec::IntoIter<LeafEntry>,
    started: bool,
    done: bool,
}

impl<'s, S: PageSource + ?Sized> Cursor<'s, S> {
    pub fn new(
        source: &'s S,
        snapshot: Arc<Snapshot>,
        low: Option<Vec<u8>>,
        high: Option<Vec<u8>>,
    ) -> Self {
        // An inverted range is empty.
        let high = match (&low, high) {
            (Some(low), Some(high)) if high < *low => Some(low.clone()),
            (_, high) => high,
        };
        Self {
            source,
            snapshot,
            low,
            high,
            stack: Vec::new(),
            entries: Vec::new().into_iter(),
            started: false,
            done: false,
        }
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    /// Rewinds to the start of the range.
    pub fn restart(&mut self) {
        self.stack.clear();
        self.entries = Vec::new().into_iter();
        self.started = false;
        self.done = false;
    }

    fn load(&self, page_id: PageId) -> Result<Node> {
        Node::decode(&*self.source.load(page_id)?)
    }

    /// Descends from `page_id` to a leaf, following `target` or the leftmost
    /// edge when there is none.
    fn descend(&mut self, mut page_id: PageId, target: Option<&[u8]>) -> Result<Vec<LeafEntry>> {
        loop {
            match self.load(page_id)? {
                Node::Leaf { entries } => return Ok(entries),
                Node::Internal { keys, children } => {
                    let idx = target.map_or(0, |key| child_index(&keys, key));
                    page_id = children[idx];
                    self.stack.push((children, idx + 1));
                }
            }
        }
    }

    fn seek(&mut self) -> Result<()> {
        let low = self.low.clone();
        let mut entries = self.descend(self.snapshot.root, low.as_deref())?;
        if let Some(low) = &low {
            let start = entries.partition_point(|e| e.key < *low);
            entries.drain(..start);
        }
        self.entries = entries.into_iter();
        Ok(())
    }

    /// Moves to the next leaf. Returns false at the end of the tree.
    fn next_leaf(&mut self) -> Result<bool> {
        while let Some((children, next)) = self.stack.last_mut() {
            if *next < children.len() {
                let child = children[*next];
                *next += 1;
                let entries = self.descend(child, None)?;
                self.entries = entries.into_iter();
                return Ok(true);
            }
            self.stack.pop();
        }
        Ok(false)
    }

    fn advance(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if !self.started {
            self.started = true;
            self.seek()?;
        }
        loop {
            if let Some(entry) = self.entries.next() {
                if self.high.as_ref().is_some_and(|high| entry.key >= *high) {
                    return Ok(None);
                }
                let value = resolve_value(self.source, self.snapshot.page_count, entry.value)?;
                return Ok(Some((entry.key, value)));
            }
            if !self.next_leaf()? {
                return Ok(None);
            }
        }
    }
}

impl<S: PageSource + ?Sized> Iterator for Cursor<'_, S> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(pair)) => Some(Ok(pair)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
