//! On-page encoding of B-tree nodes.
//!
//! ```text
//! [crc32 u32][kind u8][cell count u16][leftmost child u32][cells ...]
//!
//! leaf cell:     [key len u16][key][tag u8][value len u32][value bytes | first overflow page u32]
//! internal cell: [key len u16][key][child u32]
//! ```
//!
//! In an internal node `keys[i]` separates `children[i]` (keys below it) from
//! `children[i + 1]` (keys equal or above). The leftmost child lives in the
//! node header; leaves leave that field zero.
use bytes::{Buf, BufMut};

use crate::error::{Result, StoreError};
use crate::page::{Page, PageKind, PAGE_BODY_OFFSET};
use crate::PageId;

pub const NODE_HEADER_SIZE: usize = PAGE_BODY_OFFSET + 2 + 4;

const TAG_INLINE: u8 = 0;
const TAG_OVERFLOW: u8 = 1;

/// A value as stored in a leaf cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredValue {
    Inline(Vec<u8>),
    /// Spilled to an overflow chain starting at `first_page`.
    Overflow { first_page: PageId, len: u32 },
}

impl StoredValue {
    pub fn len(&self) -> usize {
        match self {
            StoredValue::Inline(bytes) => bytes.len(),
            StoredValue::Overflow { len, .. } => *len as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cell_bytes(&self) -> usize {
        match self {
            StoredValue::Inline(bytes) => bytes.len(),
            StoredValue::Overflow { .. } => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    pub key: Vec<u8>,
    pub value: StoredValue,
}

impl LeafEntry {
    fn cell_size(&self) -> usize {
        leaf_cell_size(self.key.len(), self.value.cell_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf {
        entries: Vec<LeafEntry>,
    },
    Internal {
        keys: Vec<Vec<u8>>,
        children: Vec<PageId>,
    },
}

pub fn leaf_cell_size(key_len: usize, value_bytes: usize) -> usize {
    2 + key_len + 1 + 4 + value_bytes
}

pub fn internal_cell_size(key_len: usize) -> usize {
    2 + key_len + 4
}

/// Index of the child whose subtree may hold `key`.
pub fn child_index(keys: &[Vec<u8>], key: &[u8]) -> usize {
    keys.partition_point(|k| k.as_slice() <= key)
}

/// Size limits derived from the page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLayout {
    pub page_size: usize,
    /// Bytes available for cells.
    pub usable: usize,
    /// Largest cell allowed, a quarter of the usable space.
    pub max_cell: usize,
    pub max_key: usize,
    /// Cell bytes below which a non-root node is rebalanced.
    pub min_fill: usize,
}

impl NodeLayout {
    pub fn new(page_size: usize) -> Self {
        let usable = page_size - NODE_HEADER_SIZE;
        let max_cell = usable / 4;
        Self {
            page_size,
            usable,
            max_cell,
            // A maximal key with an overflow pointer must still fit in one cell.
            max_key: max_cell - leaf_cell_size(0, 4),
            min_fill: usable * 35 / 100,
        }
    }

    pub fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() > self.max_key {
            return Err(StoreError::KeyTooLarge {
                len: key.len(),
                max: self.max_key,
            });
        }
        Ok(())
    }

    /// Whether a value of `value_len` bytes can be stored inline next to `key_len`.
    pub fn fits_inline(&self, key_len: usize, value_len: usize) -> bool {
        leaf_cell_size(key_len, value_len) <= self.max_cell
    }

    pub fn fits(&self, node: &Node) -> bool {
        node.encoded_size() <= self.page_size
    }

    pub fn is_underfull(&self, node: &Node) -> bool {
        node.encoded_size() - NODE_HEADER_SIZE < self.min_fill
    }
}

impl Node {
    pub fn empty_leaf() -> Self {
        Node::Leaf {
            entries: Vec::new(),
        }
    }

    pub fn kind(&self) -> PageKind {
        match self {
            Node::Leaf { .. } => PageKind::Leaf,
            Node::Internal { .. } => PageKind::Internal,
        }
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        match self {
            Node::Leaf { entries } => entries.len(),
            Node::Internal { keys, .. } => keys.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cell_sizes(&self) -> Vec<usize> {
        match self {
            Node::Leaf { entries } => entries.iter().map(LeafEntry::cell_size).collect(),
            Node::Internal { keys, .. } => keys.iter().map(|k| internal_cell_size(k.len())).collect(),
        }
    }

    pub fn encoded_size(&self) -> usize {
        NODE_HEADER_SIZE + self.cell_sizes().iter().sum::<usize>()
    }

    /// Serializes the node into a sealed page.
    pub fn encode(&self, id: PageId, page_size: usize) -> Result<Page> {
        let size = self.encoded_size();
        if size > page_size {
            return Err(StoreError::corrupt(
                id,
                format!("node needs {size} bytes, page holds {page_size}"),
            ));
        }
        let mut page = Page::with_kind(id, page_size, self.kind());
        let mut buf = &mut page.data[PAGE_BODY_OFFSET..];
        buf.put_u16(self.len() as u16);
        match self {
            Node::Leaf { entries } => {
                buf.put_u32(0);
                for entry in entries {
                    buf.put_u16(entry.key.len() as u16);
                    buf.put_slice(&entry.key);
                    match &entry.value {
                        StoredValue::Inline(bytes) => {
                            buf.put_u8(TAG_INLINE);
                            buf.put_u32(bytes.len() as u32);
                            buf.put_slice(bytes);
                        }
                        StoredValue::Overflow { first_page, len } => {
                            buf.put_u8(TAG_OVERFLOW);
                            buf.put_u32(*len);
                            buf.put_u32(*first_page);
                        }
                    }
                }
            }
            Node::Internal { keys, children } => {
                if children.len() != keys.len() + 1 {
                    return Err(StoreError::corrupt(
                        id,
                        format!("{} keys but {} children", keys.len(), children.len()),
                    ));
                }
                buf.put_u32(children[0]);
                for (key, child) in keys.iter().zip(&children[1..]) {
                    buf.put_u16(key.len() as u16);
                    buf.put_slice(key);
                    buf.put_u32(*child);
                }
            }
        }
        page.seal();
        Ok(page)
    }

    /// Parses a verified leaf or internal page.
    pub fn decode(page: &Page) -> Result<Node> {
        let id = page.id;
        let kind = page.verify()?;
        let mut buf = &page.data[PAGE_BODY_OFFSET..];
        let count = take_u16(&mut buf, id)? as usize;
        let leftmost = take_u32(&mut buf, id)?;
        match kind {
            PageKind::Leaf => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = take_key(&mut buf, id)?;
                    let tag = take_u8(&mut buf, id)?;
                    let len = take_u32(&mut buf, id)?;
                    let value = match tag {
                        TAG_INLINE => StoredValue::Inline(take_bytes(&mut buf, len as usize, id)?),
                        TAG_OVERFLOW => StoredValue::Overflow {
                            first_page: take_u32(&mut buf, id)?,
                            len,
                        },
                        other => {
                            return Err(StoreError::corrupt(id, format!("bad value tag {other}")))
                        }
                    };
                    entries.push(LeafEntry { key, value });
                }
                Ok(Node::Leaf { entries })
            }
            PageKind::Internal => {
                let mut keys = Vec::with_capacity(count);
                let mut children = Vec::with_capacity(count + 1);
                children.push(leftmost);
                for _ in 0..count {
                    keys.push(take_key(&mut buf, id)?);
                    children.push(take_u32(&mut buf, id)?);
                }
                Ok(Node::Internal { keys, children })
            }
            other => Err(StoreError::corrupt(
                id,
                format!("expected a tree node, found {other:?} page"),
            )),
        }
    }

    /// Splits an over-full node into two halves of balanced byte size and
    /// returns `(left, separator, right)`. Leaves copy the first right key up;
    /// internal nodes move their middle key up.
    pub fn split(self) -> (Node, Vec<u8>, Node) {
        let sizes = self.cell_sizes();
        match self {
            Node::Leaf { mut entries } => {
                let mid = balanced_split_point(&sizes, 1, entries.len(), false);
                let right = entries.split_off(mid);
                let separator = right[0].key.clone();
                (
                    Node::Leaf { entries },
                    separator,
                    Node::Leaf { entries: right },
                )
            }
            Node::Internal {
                mut keys,
                mut children,
            } => {
                let hi = keys.len().saturating_sub(1).max(1);
                let mid = balanced_split_point(&sizes, 1, hi, true);
                let right_keys = keys.split_off(mid + 1);
                let separator = keys.pop().unwrap_or_default();
                let right_children = children.split_off(mid + 1);
                (
                    Node::Internal { keys, children },
                    separator,
                    Node::Internal {
                        keys: right_keys,
                        children: right_children,
                    },
                )
            }
        }
    }
}

/// Picks the cut in `lo..hi` that minimizes the larger half. With `skip_cut`
/// the cell at the cut moves to the parent and counts toward neither half.
fn balanced_split_point(sizes: &[usize], lo: usize, hi: usize, skip_cut: bool) -> usize {
    let total: usize = sizes.iter().sum();
    let mut best = lo.min(sizes.len().saturating_sub(1));
    let mut best_cost = usize::MAX;
    let mut prefix: usize = sizes.iter().take(lo).sum();
    for (cut, size) in sizes.iter().enumerate().take(hi.max(lo + 1)).skip(lo) {
        let right = if skip_cut {
            total - prefix - size
        } else {
            total - prefix
        };
        let cost = prefix.max(right);
        if cost < best_cost {
            best_cost = cost;
            best = cut;
        }
        prefix += size;
    }
    best
}

fn truncated(id: PageId) -> StoreError {
    StoreError::corrupt(id, "cell runs past the end of the page")
}

fn take_u8(buf: &mut &[u8], id: PageId) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(truncated(id));
    }
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut &[u8], id: PageId) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(truncated(id));
    }
    Ok(buf.get_u16())
}

fn take_u32(buf: &mut &[u8], id: PageId) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(truncated(id));
    }
    Ok(buf.get_u32())
}

fn take_bytes(buf: &mut &[u8], len: usize, id: PageId) -> Result<Vec<u8>> {
    if buf.remaining() < len {
        return Err(truncated(id));
    }
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    Ok(bytes)
}

fn take_key(buf: &mut &[u8], id: PageId) -> Result<Vec<u8>> {
    let len = take_u16(buf, id)? as usize;
    take_bytes(buf, len, id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(keys: &[&str]) -> Node {
        Node::Leaf {
            entries: keys
                .iter()
                .map(|k| LeafEntry {
                    key: k.as_bytes().to_vec(),
                    value: StoredValue::Inline(format!("v-{k}").into_bytes()),
                })
                .collect(),
        }
    }

    #[test]
    fn layout_limits_for_4k_pages() {
        let layout = NodeLayout::new(4096);
        assert_eq!(layout.usable, 4085);
        assert_eq!(layout.max_cell, 1021);
        assert_eq!(layout.max_key, 1010);
        assert!(layout.check_key(&[0u8; 1010]).is_ok());
        assert!(matches!(
            layout.check_key(&[0u8; 1011]),
            Err(StoreError::KeyTooLarge {
                len: 1011,
                max: 1010
            })
        ));
        assert!(layout.fits_inline(32, 900));
        assert!(!layout.fits_inline(32, 1000));
    }

    #[test]
    fn leaf_roundtrip_with_overflow_pointer() {
        let mut node = leaf(&["a", "b"]);
        if let Node::Leaf { entries } = &mut node {
            entries.push(LeafEntry {
                key: b"c".to_vec(),
                value: StoredValue::Overflow {
                    first_page: 77,
                    len: 100_000,
                },
            });
        }
        let page = node.encode(4, 512).unwrap();
        assert_eq!(page.kind(), Some(PageKind::Leaf));
        assert_eq!(Node::decode(&page).unwrap(), node);
    }

    #[test]
    fn internal_roundtrip() {
        let node = Node::Internal {
            keys: vec![b"m".to_vec(), b"t".to_vec()],
            children: vec![3, 9, 12],
        };
        let page = node.encode(2, 512).unwrap();
        assert_eq!(Node::decode(&page).unwrap(), node);
    }

    #[test]
    fn child_index_routes_equal_keys_right() {
        let keys = vec![b"d".to_vec(), b"m".to_vec()];
        assert_eq!(child_index(&keys, b"a"), 0);
        assert_eq!(child_index(&keys, b"d"), 1);
        assert_eq!(child_index(&keys, b"e"), 1);
        assert_eq!(child_index(&keys, b"m"), 2);
        assert_eq!(child_index(&keys, b"z"), 2);
    }

    #[test]
    fn oversized_node_refuses_to_encode() {
        let node = Node::Leaf {
            entries: vec![LeafEntry {
                key: b"k".to_vec(),
                value: StoredValue::Inline(vec![0; 600]),
            }],
        };
        assert!(node.encode(1, 512).is_err());
    }

    #[test]
    fn leaf_split_is_balanced_and_ordered() {
        let keys: Vec<String> = (0..10).map(|i| format!("key{i:02}")).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let (left, sep, right) = leaf(&refs).split();
        assert_eq!(left.len(), 5);
        assert_eq!(right.len(), 5);
        assert_eq!(sep, b"key05".to_vec());
        if let Node::Leaf { entries } = &right {
            assert_eq!(entries[0].key, sep);
        }
    }

    #[test]
    fn internal_split_promotes_middle_key() {
        let node = Node::Internal {
            keys: (0..5).map(|i| vec![b'a' + i]).collect(),
            children: (10..16).collect(),
        };
        let (left, sep, right) = node.split();
        assert_eq!(sep, b"c".to_vec());
        assert_eq!(
            left,
            Node::Internal {
                keys: vec![b"a".to_vec(), b"b".to_vec()],
                children: vec![10, 11, 12],
            }
        );
        assert_eq!(
            right,
            Node::Internal {
                keys: vec![b"d".to_vec(), b"e".to_vec()],
                children: vec![13, 14, 15],
            }
        );
    }

    #[test]
    fn truncated_cell_is_corrupt() {
        let node = leaf(&["abc"]);
        let mut page = node.encode(6, 512).unwrap();
        // Claim a second cell that is not there.
        page.data[PAGE_BODY_OFFSET + 1] = 2;
        page.data[NODE_HEADER_SIZE + 20] = 0xff;
        page.data[NODE_HEADER_SIZE + 21] = 0xff;
        page.seal();
        assert!(matches!(
            Node::decode(&page),
            Err(StoreError::CorruptPage { page_id: 6, .. })
        ));
    }
}
