//! The common layout of a page on disk.
//!
//! Every page except the header page starts with a small envelope:
//!
//! ```text
//! [crc32 u32][kind u8][body ...]
//! ```
//!
//! The checksum covers everything after itself, so a page is sealed once its
//! body is final and verified every time it is read back.
use crate::error::{Result, StoreError};
use crate::PageId;

pub const PAGE_KIND_OFFSET: usize = 4;
pub const PAGE_BODY_OFFSET: usize = 5;

/// What a non-header page holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageKind {
    Leaf = 1,
    Internal = 2,
    Overflow = 3,
    FreeTrunk = 4,
}

impl PageKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(PageKind::Leaf),
            2 => Some(PageKind::Internal),
            3 => Some(PageKind::Overflow),
            4 => Some(PageKind::FreeTrunk),
            _ => None,
        }
    }
}

/// A fixed-size block read from and written to the database file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub id: PageId,
    pub data: Box<[u8]>,
}

impl Page {
    /// A zero-filled page.
    pub fn new(id: PageId, page_size: usize) -> Self {
        Page {
            id,
            data: vec![0u8; page_size].into_boxed_slice(),
        }
    }

    pub fn with_kind(id: PageId, page_size: usize, kind: PageKind) -> Self {
        let mut page = Page::new(id, page_size);
        page.set_kind(kind);
        page
    }

    pub fn from_bytes(id: PageId, data: Vec<u8>) -> Self {
        Page {
            id,
            data: data.into_boxed_slice(),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn kind(&self) -> Option<PageKind> {
        PageKind::from_byte(self.data[PAGE_KIND_OFFSET])
    }

    pub fn set_kind(&mut self, kind: PageKind) {
        self.data[PAGE_KIND_OFFSET] = kind as u8;
    }

    pub fn body(&self) -> &[u8] {
        &self.data[PAGE_BODY_OFFSET..]
    }

    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.data[PAGE_BODY_OFFSET..]
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.data[offset..offset + 4]);
        u32::from_be_bytes(raw)
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.data[offset..offset + 8]);
        u64::from_be_bytes(raw)
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
    }

    pub fn stored_checksum(&self) -> u32 {
        self.read_u32(0)
    }

    fn computed_checksum(&self) -> u32 {
        crc32fast::hash(&self.data[PAGE_KIND_OFFSET..])
    }

    /// Stamps the checksum. Call after the last modification.
    pub fn seal(&mut self) {
        let crc = self.computed_checksum();
        self.write_u32(0, crc);
    }

    /// Checks the checksum and the kind byte.
    pub fn verify(&self) -> Result<PageKind> {
        if self.data.len() <= PAGE_BODY_OFFSET {
            return Err(StoreError::corrupt(self.id, "page too short"));
        }
        let stored = self.stored_checksum();
        let computed = self.computed_checksum();
        if stored != computed {
            return Err(StoreError::corrupt(
                self.id,
                format!("checksum mismatch (stored {stored:#010x}, computed {computed:#010x})"),
            ));
        }
        self.kind().ok_or_else(|| {
            StoreError::corrupt(
                self.id,
                format!("unknown page kind {}", self.data[PAGE_KIND_OFFSET]),
            )
        })
    }

    /// Verifies the page and requires a specific kind.
    pub fn expect_kind(&self, expected: PageKind) -> Result<()> {
        let kind = self.verify()?;
        if kind != expected {
            return Err(StoreError::corrupt(
                self.id,
                format!("expected {expected:?} page, found {kind:?}"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_page_verifies() {
        let mut page = Page::with_kind(7, 512, PageKind::Leaf);
        page.body_mut()[..3].copy_from_slice(b"abc");
        page.seal();
        assert_eq!(page.verify().unwrap(), PageKind::Leaf);
        page.expect_kind(PageKind::Leaf).unwrap();
        assert!(page.expect_kind(PageKind::Overflow).is_err());
    }

    #[test]
    fn flipped_byte_is_detected() {
        let mut page = Page::with_kind(3, 512, PageKind::Internal);
        page.seal();
        page.data[100] ^= 0xff;
        let err = page.verify().unwrap_err();
        assert!(matches!(err, StoreError::CorruptPage { page_id: 3, .. }));
    }

    #[test]
    fn zeroed_page_is_not_valid() {
        let page = Page::new(9, 512);
        assert!(page.verify().is_err());
    }

    #[test]
    fn integer_accessors_are_big_endian() {
        let mut page = Page::new(1, 512);
        page.write_u32(10, 0x0102_0304);
        page.write_u64(20, 42);
        assert_eq!(&page.data[10..14], &[1, 2, 3, 4]);
        assert_eq!(page.read_u32(10), 0x0102_0304);
        assert_eq!(page.read_u64(20), 42);
    }
}
