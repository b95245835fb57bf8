//! Store configuration.
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::DEFAULT_PAGE_SIZE;

pub const MIN_PAGE_SIZE: usize = 512;
pub const MAX_PAGE_SIZE: usize = 65536;
pub const MIN_CACHE_CAPACITY: usize = 8;

/// Tuning knobs for [`Store::open`](crate::Store::open).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Page size for newly created databases. Existing files keep their own.
    pub page_size: usize,
    /// Number of page images kept in the in-memory cache.
    pub cache_capacity: usize,
    /// Upper bound on the page count; allocation past it fails with `StorageFull`.
    pub max_pages: Option<u32>,
    /// WAL frame count that triggers an automatic checkpoint after a commit.
    pub checkpoint_threshold: u64,
    /// Fsync the WAL on every commit. Without it commits stay atomic but a power
    /// loss may drop the most recent ones.
    pub sync_on_commit: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_capacity: 1024,
            max_pages: None,
            checkpoint_threshold: 1000,
            sync_on_commit: true,
        }
    }
}

impl StoreOptions {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_cache_capacity(mut self, pages: usize) -> Self {
        self.cache_capacity = pages;
        self
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = Some(max_pages);
        self
    }

    pub fn with_checkpoint_threshold(mut self, frames: u64) -> Self {
        self.checkpoint_threshold = frames;
        self
    }

    pub fn with_sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(StoreError::InvalidConfig(format!(
                "page size {} must be a power of two between {MIN_PAGE_SIZE} and {MAX_PAGE_SIZE}",
                self.page_size
            )));
        }
        if self.cache_capacity < MIN_CACHE_CAPACITY {
            return Err(StoreError::InvalidConfig(format!(
                "cache capacity {} is below the minimum of {MIN_CACHE_CAPACITY} pages",
                self.cache_capacity
            )));
        }
        if self.checkpoint_threshold == 0 {
            return Err(StoreError::InvalidConfig(
                "checkpoint threshold must be at least one frame".to_string(),
            ));
        }
        if let Some(max) = self.max_pages {
            // Header page plus the initial root leaf.
            if max < 2 {
                return Err(StoreError::InvalidConfig(format!(
                    "max_pages {max} leaves no room for the index root"
                )));
            }
        }
        Ok(())
    }

    /// Overlays `STRATA_*` environment variables on top of `self`.
    pub fn overlay_env(self) -> Result<Self> {
        self.overlay_lookup(|name| std::env::var(name).ok())
    }

    fn overlay_lookup(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(raw) = lookup("STRATA_PAGE_SIZE") {
            self.page_size = parse_var("STRATA_PAGE_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("STRATA_CACHE_PAGES") {
            self.cache_capacity = parse_var("STRATA_CACHE_PAGES", &raw)?;
        }
        if let Some(raw) = lookup("STRATA_MAX_PAGES") {
            self.max_pages = Some(parse_var("STRATA_MAX_PAGES", &raw)?);
        }
        if let Some(raw) = lookup("STRATA_CHECKPOINT_FRAMES") {
            self.checkpoint_threshold = parse_var("STRATA_CHECKPOINT_FRAMES", &raw)?;
        }
        Ok(self)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| StoreError::InvalidConfig(format!("invalid {name} value: {raw}")))
}
