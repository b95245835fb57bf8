//! strata: an embedded, ordered key-value store.
//!
//! Records live in a copy-on-write B-tree stored in fixed-size pages of a single
//! database file. Every commit is first appended to a write-ahead log and fsynced,
//! then published by swapping the visible root. Readers work against immutable
//! snapshots and never take locks beyond cloning the current root handle.

pub mod btree;

pub mod cache;

pub mod config;

pub mod cursor;

pub mod error;

pub mod failpoint;

pub mod freelist;

pub mod header;

pub mod node;

pub mod overflow;

pub mod page;

pub mod page_store;

pub mod pager;

pub mod store;

pub mod transaction;

pub mod wal;

pub const DEFAULT_PAGE_SIZE: usize = 4096;

pub type PageId = u32;

pub type TxId = u64;

/// Page 0 holds the file header and is never part of the index.
pub const HEADER_PAGE_ID: PageId = 0;

pub use btree::TreeStats;
pub use config::StoreOptions;
pub use cursor::Cursor;
pub use error::{Result, StoreError};
pub use page::Page;
pub use store::{ScanIter, Store, StoreStats};
pub use transaction::{CommitInfo, Snapshot, Transaction, TxScan};
