//! Copy-on-write B-tree index.
//!
//! A commit never modifies a page reachable from a published root. The first
//! time a commit touches a node it moves the node to a freshly allocated page
//! and retires the old one; later touches in the same commit reuse the copy.
//! Touched nodes are kept decoded until [`TreeWriter::finish`] encodes them.
use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use crate::error::{Result, StoreError};
use crate::node::{child_index, LeafEntry, Node, NodeLayout, StoredValue};
use crate::overflow::{chain_pages, free_overflow_chain, read_overflow_chain, write_overflow_chain};
use crate::page_store::{PageSource, PageStore};
use crate::PageId;

/// Searches for a key in the tree rooted at `root`.
pub fn btree_lookup<S: PageSource + ?Sized>(
    source: &S,
    page_count: u32,
    root: PageId,
    key: &[u8],
) -> Result<Option<Vec<u8>>> {
    let mut current = root;
    loop {
        let node = Node::decode(&*source.load(current)?)?;
        match node {
            Node::Leaf { mut entries } => {
                return match entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
                    Ok(i) => {
                        let entry = entries.swap_remove(i);
                        resolve_value(source, page_count, entry.value).map(Some)
                    }
                    Err(_) => Ok(None),
                };
            }
            Node::Internal { keys, children } => {
                current = children[child_index(&keys, key)];
            }
        }
    }
}

/// Materializes a stored value, following its overflow chain if needed.
pub fn resolve_value<S: PageSource + ?Sized>(
    source: &S,
    page_count: u32,
    value: StoredValue,
) -> Result<Vec<u8>> {
    match value {
        StoredValue::Inline(bytes) => Ok(bytes),
        StoredValue::Overflow { first_page, len } => {
            read_overflow_chain(source, page_count, first_page, len as usize)
        }
    }
}

struct InsertOutcome {
    page: PageId,
    replaced: Option<StoredValue>,
    split: Option<Split>,
}

struct Split {
    separator: Vec<u8>,
    right: PageId,
}

/// What a finished writer hands back to the commit.
pub struct TreeOutcome<'a, S: PageSource + ?Sized> {
    pub store: PageStore<'a, S>,
    pub root: PageId,
    pub records: u64,
}

/// Applies one commit's mutations to the tree.
pub struct TreeWriter<'a, S: PageSource + ?Sized> {
    store: PageStore<'a, S>,
    layout: NodeLayout,
    root: PageId,
    records: u64,
    /// Nodes owned by this commit, keyed by their new page.
    nodes: HashMap<PageId, Node>,
}

impl<'a, S: PageSource + ?Sized> TreeWriter<'a, S> {
    pub fn new(store: PageStore<'a, S>, root: PageId, records: u64) -> Self {
        let layout = NodeLayout::new(store.page_size());
        Self {
            store,
            layout,
            root,
            records,
            nodes: HashMap::new(),
        }
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn layout(&self) -> &NodeLayout {
        &self.layout
    }

    fn peek(&self, page_id: PageId) -> Result<Node> {
        match self.nodes.get(&page_id) {
            Some(node) => Ok(node.clone()),
            None => Node::decode(&*self.store.read(page_id)?),
        }
    }

    /// Makes sure this commit owns a copy of `page_id`, returning the copy's id.
    fn own(&mut self, page_id: PageId) -> Result<PageId> {
        if self.nodes.contains_key(&page_id) {
            return Ok(page_id);
        }
        let copy = self.store.allocate()?;
        self.store.free(page_id)?;
        trace!(old = page_id, new = copy, "copied node");
        Ok(copy)
    }

    /// Removes a node from the tree for modification.
    fn take(&mut self, page_id: PageId) -> Result<(PageId, Node)> {
        if let Some(node) = self.nodes.remove(&page_id) {
            return Ok((page_id, node));
        }
        let node = Node::decode(&*self.store.read(page_id)?)?;
        let copy = self.own(page_id)?;
        Ok((copy, node))
    }

    fn put(&mut self, page_id: PageId, node: Node) {
        self.nodes.insert(page_id, node);
    }

    fn discard(&mut self, page_id: PageId) -> Result<()> {
        self.nodes.remove(&page_id);
        self.store.free(page_id)
    }

    /// Point lookup that sees this commit's changes, without copying anything.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<StoredValue>> {
        let mut current = self.root;
        loop {
            let decoded;
            let node = match self.nodes.get(&current) {
                Some(node) => node,
                None => {
                    decoded = Node::decode(&*self.store.read(current)?)?;
                    &decoded
                }
            };
            match node {
                Node::Leaf { entries } => {
                    return Ok(entries
                        .binary_search_by(|e| e.key.as_slice().cmp(key))
                        .ok()
                        .map(|i| entries[i].value.clone()));
                }
                Node::Internal { keys, children } => {
                    current = children[child_index(keys, key)];
                }
            }
        }
    }

    /// Inserts or replaces `key`. Returns true when an existing value was replaced.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.layout.check_key(key)?;
        let len = u32::try_from(value.len()).map_err(|_| {
            StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "value larger than 4 GiB",
            ))
        })?;
        let stored = if self.layout.fits_inline(key.len(), value.len()) {
            StoredValue::Inline(value.to_vec())
        } else {
            StoredValue::Overflow {
                first_page: write_overflow_chain(&mut self.store, value)?,
                len,
            }
        };

        let outcome = self.insert_recursive(self.root, key, stored)?;
        self.root = outcome.page;
        if let Some(split) = outcome.split {
            let new_root = self.store.allocate()?;
            self.put(
                new_root,
                Node::Internal {
                    keys: vec![split.separator],
                    children: vec![outcome.page, split.right],
                },
            );
            debug!(root = new_root, "root split, tree grew a level");
            self.root = new_root;
        }
        match outcome.replaced {
            Some(old) => {
                self.release_value(&old)?;
                Ok(true)
            }
            None => {
                self.records += 1;
                Ok(false)
            }
        }
    }

    fn insert_recursive(
        &mut self,
        page_id: PageId,
        key: &[u8],
        value: StoredValue,
    ) -> Result<InsertOutcome> {
        let (id, mut node) = self.take(page_id)?;
        let mut replaced = None;
        match &mut node {
            Node::Leaf { entries } => {
                match entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
                    Ok(i) => replaced = Some(std::mem::replace(&mut entries[i].value, value)),
                    Err(i) => entries.insert(
                        i,
                        LeafEntry {
                            key: key.to_vec(),
                            value,
                        },
                    ),
                }
            }
            Node::Internal { keys, children } => {
                let idx = child_index(keys, key);
                let child = self.insert_recursive(children[idx], key, value)?;
                children[idx] = child.page;
                replaced = child.replaced;
                if let Some(split) = child.split {
                    keys.insert(idx, split.separator);
                    children.insert(idx + 1, split.right);
                }
            }
        }

        let split = if self.layout.fits(&node) {
            self.put(id, node);
            None
        } else {
            Some(self.split_node(id, node)?)
        };
        Ok(InsertOutcome {
            page: id,
            replaced,
            split,
        })
    }

    fn split_node(&mut self, page_id: PageId, node: Node) -> Result<Split> {
        let (left, separator, right) = node.split();
        let right_id = self.store.allocate()?;
        trace!(page_id, right = right_id, "split node");
        self.put(page_id, left);
        self.put(right_id, right);
        Ok(Split {
            separator,
            right: right_id,
        })
    }

    /// Removes `key`. Returns false, touching nothing, when it is absent.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        if key.len() > self.layout.max_key || self.lookup(key)?.is_none() {
            return Ok(false);
        }
        let (root, removed) = self.delete_recursive(self.root, key)?;
        self.root = root;
        self.collapse_root()?;
        match removed {
            Some(value) => {
                self.release_value(&value)?;
                self.records = self.records.saturating_sub(1);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_recursive(
        &mut self,
        page_id: PageId,
        key: &[u8],
    ) -> Result<(PageId, Option<StoredValue>)> {
        let (id, mut node) = self.take(page_id)?;
        let removed = match &mut node {
            Node::Leaf { entries } => entries
                .binary_search_by(|e| e.key.as_slice().cmp(key))
                .ok()
                .map(|i| entries.remove(i).value),
            Node::Internal { keys, children } => {
                let idx = child_index(keys, key);
                let (child, removed) = self.delete_recursive(children[idx], key)?;
                children[idx] = child;
                if self.is_underfull(child) {
                    self.handle_underflow(keys, children, idx)?;
                }
                removed
            }
        };
        self.put(id, node);
        Ok((id, removed))
    }

    fn is_underfull(&self, page_id: PageId) -> bool {
        self.nodes
            .get(&page_id)
            .is_some_and(|node| self.layout.is_underfull(node))
    }

    /// Merges the underfull child at `idx` with a sibling, or redistributes
    /// their cells when the two do not fit in one page.
    fn handle_underflow(
        &mut self,
        keys: &mut Vec<Vec<u8>>,
        children: &mut Vec<PageId>,
        idx: usize,
    ) -> Result<()> {
        if children.len() < 2 {
            return Ok(());
        }
        let (li, ri) = if idx > 0 { (idx - 1, idx) } else { (idx, idx + 1) };
        let left = self.peek(children[li])?;
        let right = self.peek(children[ri])?;
        let combined = merge_nodes(children[li], left, keys[li].clone(), right)?;

        if self.layout.fits(&combined) {
            let left_id = self.own(children[li])?;
            self.discard(children[ri])?;
            self.put(left_id, combined);
            trace!(left = left_id, "merged sibling nodes");
            keys.remove(li);
            children.remove(ri);
            children[li] = left_id;
        } else {
            let (new_left, separator, new_right) = combined.split();
            let left_id = self.own(children[li])?;
            let right_id = self.own(children[ri])?;
            self.put(left_id, new_left);
            self.put(right_id, new_right);
            trace!(left = left_id, right = right_id, "redistributed sibling nodes");
            keys[li] = separator;
            children[li] = left_id;
            children[ri] = right_id;
        }
        Ok(())
    }

    /// Replaces an internal root with no keys by its only child.
    fn collapse_root(&mut self) -> Result<()> {
        loop {
            let child = match self.nodes.get(&self.root) {
                Some(Node::Internal { keys, children }) if keys.is_empty() => children[0],
                _ => return Ok(()),
            };
            let old = self.root;
            self.discard(old)?;
            debug!(old_root = old, new_root = child, "root collapsed, tree lost a level");
            self.root = child;
        }
    }

    fn release_value(&mut self, value: &StoredValue) -> Result<()> {
        if let StoredValue::Overflow { first_page, len } = value {
            free_overflow_chain(&mut self.store, *first_page, *len as usize)?;
        }
        Ok(())
    }

    /// Encodes every touched node and hands the staged pages back.
    pub fn finish(self) -> Result<TreeOutcome<'a, S>> {
        let TreeWriter {
            mut store,
            layout,
            root,
            records,
            nodes,
        } = self;
        for (page_id, node) in nodes {
            store.write(node.encode(page_id, layout.page_size)?)?;
        }
        Ok(TreeOutcome {
            store,
            root,
            records,
        })
    }
}

fn merge_nodes(page_id: PageId, left: Node, separator: Vec<u8>, right: Node) -> Result<Node> {
    match (left, right) {
        (Node::Leaf { mut entries }, Node::Leaf { entries: rest }) => {
            entries.extend(rest);
            Ok(Node::Leaf { entries })
        }
        (
            Node::Internal {
                mut keys,
                mut children,
            },
            Node::Internal {
                keys: right_keys,
                children: right_children,
            },
        ) => {
            keys.push(separator);
            keys.extend(right_keys);
            children.extend(right_children);
            Ok(Node::Internal { keys, children })
        }
        _ => Err(StoreError::corrupt(
            page_id,
            "sibling nodes sit at different depths",
        )),
    }
}

/// Shape of a tree as found by [`check_tree`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub height: usize,
    pub leaf_pages: usize,
    pub internal_pages: usize,
    pub overflow_pages: usize,
    pub records: u64,
}

struct Checker<'s, S: PageSource + ?Sized, F> {
    source: &'s S,
    page_count: u32,
    is_free: F,
    seen: HashSet<PageId>,
    leaf_depth: Option<usize>,
    stats: TreeStats,
}

impl<S: PageSource + ?Sized, F: Fn(PageId) -> bool> Checker<'_, S, F> {
    fn claim(&mut self, page_id: PageId) -> Result<()> {
        if page_id == 0 || page_id >= self.page_count {
            return Err(StoreError::InvalidPage {
                page_id,
                page_count: self.page_count,
            });
        }
        if (self.is_free)(page_id) {
            return Err(StoreError::corrupt(page_id, "reachable page is on the free list"));
        }
        if !self.seen.insert(page_id) {
            return Err(StoreError::corrupt(page_id, "page is reachable twice"));
        }
        Ok(())
    }

    fn visit(
        &mut self,
        page_id: PageId,
        depth: usize,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
    ) -> Result<()> {
        self.claim(page_id)?;
        let node = Node::decode(&*self.source.load(page_id)?)?;
        let keys: Vec<&[u8]> = match &node {
            Node::Leaf { entries } => entries.iter().map(|e| e.key.as_slice()).collect(),
            Node::Internal { keys, .. } => keys.iter().map(Vec::as_slice).collect(),
        };
        if keys.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(StoreError::corrupt(page_id, "keys out of order"));
        }
        let out_of_bounds = |key: &&[u8]| {
            low.is_some_and(|low| *key < low) || high.is_some_and(|high| *key >= high)
        };
        if keys.iter().any(out_of_bounds) {
            return Err(StoreError::corrupt(page_id, "key outside its separator bounds"));
        }

        match &node {
            Node::Leaf { entries } => {
                match self.leaf_depth {
                    None => self.leaf_depth = Some(depth),
                    Some(expected) if expected != depth => {
                        return Err(StoreError::corrupt(page_id, "leaves at uneven depth"));
                    }
                    Some(_) => {}
                }
                self.stats.leaf_pages += 1;
                self.stats.records += entries.len() as u64;
                for entry in entries {
                    if let StoredValue::Overflow { first_page, len } = entry.value {
                        let chain =
                            chain_pages(self.source, self.page_count, first_page, len as usize)?;
                        for id in &chain {
                            self.claim(*id)?;
                        }
                        self.stats.overflow_pages += chain.len();
                    }
                }
            }
            Node::Internal {
                keys: separators,
                children,
            } => {
                if separators.is_empty() {
                    return Err(StoreError::corrupt(page_id, "internal node without keys"));
                }
                self.stats.internal_pages += 1;
                for (i, child) in children.iter().enumerate() {
                    let child_low = if i == 0 {
                        low
                    } else {
                        Some(separators[i - 1].as_slice())
                    };
                    let child_high = separators.get(i).map(Vec::as_slice).or(high);
                    self.visit(*child, depth + 1, child_low, child_high)?;
                }
            }
        }
        Ok(())
    }
}

/// Walks the whole tree and validates its structure: key order, separator
/// bounds, uniform leaf depth, page checksums and kinds, overflow chains, and
/// that no reachable page is shared or marked free.
pub fn check_tree<S, F>(source: &S, page_count: u32, root: PageId, is_free: F) -> Result<TreeStats>
where
    S: PageSource + ?Sized,
    F: Fn(PageId) -> bool,
{
    let mut checker = Checker {
        source,
        page_count,
        is_free,
        seen: HashSet::new(),
        leaf_depth: None,
        stats: TreeStats::default(),
    };
    checker.visit(root, 0, None, None)?;
    let mut stats = checker.stats;
    stats.height = checker.leaf_depth.unwrap_or(0) + 1;
    Ok(stats)
}
