//! Error taxonomy for the store.
use std::io;

use thiserror::Error;

use crate::PageId;

#[cfg(unix)]
pub(crate) const ENOSPC: i32 = 28;
#[cfg(windows)]
pub(crate) const ENOSPC: i32 = 112; // ERROR_DISK_FULL
#[cfg(not(any(unix, windows)))]
pub(crate) const ENOSPC: i32 = -1;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Write-if-exists on an absent key.
    #[error("key not found")]
    NotFound,

    #[error("page {page_id} is outside the allocated range (page count {page_count})")]
    InvalidPage { page_id: PageId, page_count: u32 },

    #[error("page {page_id} is corrupt: {reason}")]
    CorruptPage { page_id: PageId, reason: String },

    #[error("storage full: cannot grow beyond {page_count} pages")]
    StorageFull { page_count: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("a write transaction is already active")]
    TransactionAlreadyActive,

    #[error("key of {len} bytes exceeds the {max}-byte limit")]
    KeyTooLarge { len: usize, max: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("store is unusable after a fatal error: {0}")]
    Poisoned(String),
}

impl StoreError {
    pub fn corrupt(page_id: PageId, reason: impl Into<String>) -> Self {
        StoreError::CorruptPage {
            page_id,
            reason: reason.into(),
        }
    }

    /// Fatal errors poison the store instance that raised them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::CorruptPage { .. } | StoreError::InvalidPage { .. } | StoreError::Poisoned(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }

    /// Maps an I/O error raised while growing a file, turning a full volume into `StorageFull`.
    pub(crate) fn from_growth(err: io::Error, page_count: u32) -> Self {
        if err.raw_os_error() == Some(ENOSPC) {
            StoreError::StorageFull { page_count }
        } else {
            StoreError::Io(err)
        }
    }

    /// Same as [`StoreError::from_growth`] for an error that was already converted.
    pub(crate) fn for_growth(self, page_count: u32) -> Self {
        match self {
            StoreError::Io(err) => Self::from_growth(err, page_count),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
