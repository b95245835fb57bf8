//! Database file header, stored at the start of page 0.
use crate::error::{Result, StoreError};
use crate::page::Page;
use crate::{PageId, TxId, HEADER_PAGE_ID};

/// Magic bytes identifying a strata database file.
pub const MAGIC: &[u8; 16] = b"strata-kv\0\0\0\0\0\0\0";

pub const FORMAT_VERSION: u32 = 1;

/// Bytes covered by the header, checksum included.
pub const HEADER_SIZE: usize = 68;

const CRC_OFFSET: usize = 64;

/// The file header stored in page 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub page_size: u32,
    /// Total number of pages, header page included.
    pub page_count: u32,
    /// Root page of the index.
    pub root: PageId,
    /// First free-list trunk page (0 = none).
    pub freelist_head: PageId,
    /// Number of page ids recorded in the free list.
    pub freelist_count: u32,
    pub next_txid: TxId,
    pub record_count: u64,
    pub last_txid: TxId,
}

impl FileHeader {
    /// Header of a brand-new database: the header page plus an empty root leaf at page 1.
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size,
            page_count: 2,
            root: 1,
            freelist_head: 0,
            freelist_count: 0,
            next_txid: 1,
            record_count: 0,
            last_txid: 0,
        }
    }

    pub fn serialize(&self, buf: &mut [u8]) {
        buf[..HEADER_SIZE].fill(0);
        buf[0..16].copy_from_slice(MAGIC);
        buf[16..20].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
        buf[20..24].copy_from_slice(&self.page_size.to_be_bytes());
        buf[24..28].copy_from_slice(&self.page_count.to_be_bytes());
        buf[28..32].copy_from_slice(&self.root.to_be_bytes());
        buf[32..36].copy_from_slice(&self.freelist_head.to_be_bytes());
        buf[36..40].copy_from_slice(&self.freelist_count.to_be_bytes());
        buf[40..48].copy_from_slice(&self.next_txid.to_be_bytes());
        buf[48..56].copy_from_slice(&self.record_count.to_be_bytes());
        buf[56..64].copy_from_slice(&self.last_txid.to_be_bytes());
        let crc = crc32fast::hash(&buf[..CRC_OFFSET]);
        buf[CRC_OFFSET..HEADER_SIZE].copy_from_slice(&crc.to_be_bytes());
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        let corrupt = |reason: &str| StoreError::corrupt(HEADER_PAGE_ID, reason);
        if buf.len() < HEADER_SIZE {
            return Err(corrupt("header truncated"));
        }
        if &buf[0..16] != MAGIC.as_slice() {
            return Err(corrupt("bad magic"));
        }
        let stored_crc = be_u32(&buf[CRC_OFFSET..HEADER_SIZE]);
        if stored_crc != crc32fast::hash(&buf[..CRC_OFFSET]) {
            return Err(corrupt("header checksum mismatch"));
        }
        let version = be_u32(&buf[16..20]);
        if version != FORMAT_VERSION {
            return Err(StoreError::corrupt(
                HEADER_PAGE_ID,
                format!("unsupported format version {version}"),
            ));
        }
        Ok(Self {
            page_size: be_u32(&buf[20..24]),
            page_count: be_u32(&buf[24..28]),
            root: be_u32(&buf[28..32]),
            freelist_head: be_u32(&buf[32..36]),
            freelist_count: be_u32(&buf[36..40]),
            next_txid: be_u64(&buf[40..48]),
            record_count: be_u64(&buf[48..56]),
            last_txid: be_u64(&buf[56..64]),
        })
    }

    /// Builds the full page 0 image.
    pub fn to_page(&self) -> Page {
        let mut page = Page::new(HEADER_PAGE_ID, self.page_size as usize);
        self.serialize(&mut page.data);
        page
    }

    pub fn from_page(page: &Page) -> Result<Self> {
        Self::deserialize(&page.data)
    }
}

fn be_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(raw)
}

fn be_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_custom_header() {
        let header = FileHeader {
            page_size: 8192,
            page_count: 42,
            root: 17,
            freelist_head: 5,
            freelist_count: 3,
            next_txid: 99,
            record_count: 1234,
            last_txid: 98,
        };
        let page = header.to_page();
        assert_eq!(page.size(), 8192);
        assert_eq!(FileHeader::from_page(&page).unwrap(), header);
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let mut buf = [0u8; HEADER_SIZE];
        FileHeader::new(4096).serialize(&mut buf);
        buf[0] = b'x';
        assert!(matches!(
            FileHeader::deserialize(&buf),
            Err(StoreError::CorruptPage { page_id: 0, .. })
        ));
    }

    #[test]
    fn damaged_field_fails_checksum() {
        let mut buf = [0u8; HEADER_SIZE];
        FileHeader::new(4096).serialize(&mut buf);
        buf[30] ^= 1;
        let err = FileHeader::deserialize(&buf).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn too_short_is_corrupt() {
        assert!(FileHeader::deserialize(&[0u8; 10]).is_err());
    }
}
