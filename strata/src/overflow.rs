//! Overflow chains for values too large to sit in a leaf cell.
//!
//! ```text
//! [crc32 u32][kind u8 = 3][next u32][chunk len u32][chunk ...]
//! ```
use std::sync::Arc;

use crate::error::{Result, StoreError};
use crate::page::{Page, PageKind, PAGE_BODY_OFFSET};
use crate::page_store::{PageSource, PageStore};
use crate::PageId;

const NEXT_OFFSET: usize = PAGE_BODY_OFFSET;
const CHUNK_LEN_OFFSET: usize = PAGE_BODY_OFFSET + 4;
const CHUNK_OFFSET: usize = PAGE_BODY_OFFSET + 8;

pub fn chunk_capacity(page_size: usize) -> usize {
    page_size - CHUNK_OFFSET
}

/// Number of pages a value of `len` bytes occupies.
pub fn pages_for(len: usize, page_size: usize) -> usize {
    len.div_ceil(chunk_capacity(page_size)).max(1)
}

/// Writes `data` into freshly allocated pages and returns the first page id.
pub fn write_overflow_chain<S: PageSource + ?Sized>(
    store: &mut PageStore<'_, S>,
    data: &[u8],
) -> Result<PageId> {
    let page_size = store.page_size();
    let capacity = chunk_capacity(page_size);
    let mut chunks = data.chunks(capacity).peekable();
    let first_page = store.allocate()?;
    let mut current = first_page;
    loop {
        let chunk = chunks.next().unwrap_or(&[]);
        let next = if chunks.peek().is_some() {
            store.allocate()?
        } else {
            0
        };
        let mut page = Page::with_kind(current, page_size, PageKind::Overflow);
        page.write_u32(NEXT_OFFSET, next);
        page.write_u32(CHUNK_LEN_OFFSET, chunk.len() as u32);
        page.data[CHUNK_OFFSET..CHUNK_OFFSET + chunk.len()].copy_from_slice(chunk);
        page.seal();
        store.write(page)?;
        if next == 0 {
            return Ok(first_page);
        }
        current = next;
    }
}

/// Follows a chain, calling `visit` with each page and its chunk.
fn walk_chain<F>(
    page_count: u32,
    first_page: PageId,
    len: usize,
    mut load: impl FnMut(PageId) -> Result<Arc<Page>>,
    mut visit: F,
) -> Result<()>
where
    F: FnMut(&Page, &[u8]),
{
    let mut current = first_page;
    let mut seen = 0usize;
    let mut hops = 0u32;
    loop {
        if current == 0 || current >= page_count {
            return Err(StoreError::corrupt(
                current,
                format!("overflow chain from page {first_page} is broken"),
            ));
        }
        hops += 1;
        if hops > page_count {
            return Err(StoreError::corrupt(first_page, "overflow chain loops"));
        }
        let page = load(current)?;
        page.expect_kind(PageKind::Overflow)?;
        let chunk_len = page.read_u32(CHUNK_LEN_OFFSET) as usize;
        if chunk_len > chunk_capacity(page.size()) || seen + chunk_len > len {
            return Err(StoreError::corrupt(
                current,
                format!("overflow chunk of {chunk_len} bytes does not fit the value"),
            ));
        }
        visit(&*page, &page.data[CHUNK_OFFSET..CHUNK_OFFSET + chunk_len]);
        seen += chunk_len;
        let next = page.read_u32(NEXT_OFFSET);
        if next == 0 {
            if seen != len {
                return Err(StoreError::corrupt(
                    current,
                    format!("overflow chain holds {seen} of {len} bytes"),
                ));
            }
            return Ok(());
        }
        current = next;
    }
}

/// Reassembles a value from its chain.
pub fn read_overflow_chain<S: PageSource + ?Sized>(
    source: &S,
    page_count: u32,
    first_page: PageId,
    len: usize,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(len);
    walk_chain(
        page_count,
        first_page,
        len,
        |id| source.load(id),
        |_, chunk| out.extend_from_slice(chunk),
    )?;
    Ok(out)
}

/// Page ids of a chain, in order.
pub fn chain_pages<S: PageSource + ?Sized>(
    source: &S,
    page_count: u32,
    first_page: PageId,
    len: usize,
) -> Result<Vec<PageId>> {
    let mut ids = Vec::new();
    walk_chain(
        page_count,
        first_page,
        len,
        |id| source.load(id),
        |page, _| ids.push(page.id),
    )?;
    Ok(ids)
}

/// Frees every page of a chain. Returns how many pages were released.
pub fn free_overflow_chain<S: PageSource + ?Sized>(
    store: &mut PageStore<'_, S>,
    first_page: PageId,
    len: usize,
) -> Result<usize> {
    let mut ids = Vec::new();
    walk_chain(
        store.page_count(),
        first_page,
        len,
        |id| store.read(id),
        |page, _| ids.push(page.id),
    )?;
    for id in &ids {
        store.free(*id)?;
    }
    Ok(ids.len())
}
