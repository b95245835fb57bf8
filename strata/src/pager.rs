//! The Pager reads and writes whole pages of the database file.
//!
//! It does no caching and knows nothing about the WAL: the store writes through
//! it only during bootstrap, WAL replay and checkpoints.
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::failpoint;
use crate::header::{FileHeader, HEADER_SIZE};
use crate::page::Page;
use crate::{PageId, HEADER_PAGE_ID};

pub struct Pager {
    file: File,
    path: PathBuf,
    page_size: usize,
    num_pages: u32,
    is_new: bool,
}

impl Pager {
    /// Opens the database file, creating it and its parent directories if they don't exist.
    ///
    /// An existing file dictates its own page size; `default_page_size` only
    /// applies to a new file. A file left behind by a bootstrap that never
    /// finished is emptied and treated as new.
    pub fn open<P: AsRef<Path>>(path: P, default_page_size: usize) -> Result<Self> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path_ref)?;

        let mut file_size = file.metadata()?.len();
        let (page_size, is_new) = match existing_page_size(&mut file, file_size)? {
            Some(size) => (size, false),
            None => {
                if file_size > 0 {
                    warn!(
                        path = %path_ref.display(),
                        file_size,
                        "restarting an unfinished database bootstrap"
                    );
                    file.set_len(0)?;
                    file_size = 0;
                }
                (default_page_size, true)
            }
        };
        let num_pages = (file_size / page_size as u64) as u32;
        info!(path = %path_ref.display(), page_size, num_pages, is_new, "opened database file");

        Ok(Self {
            file,
            path: path_ref.to_path_buf(),
            page_size,
            num_pages,
            is_new,
        })
    }

    /// True when `open` found an empty or never initialised file.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of whole pages currently in the file.
    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }

    pub fn read_header(&mut self) -> Result<FileHeader> {
        let page = self.read_raw(HEADER_PAGE_ID)?;
        FileHeader::from_page(&page)
    }

    /// Reads a page without checking its envelope.
    pub fn read_raw(&mut self, page_id: PageId) -> Result<Page> {
        if page_id >= self.num_pages {
            return Err(StoreError::InvalidPage {
                page_id,
                page_count: self.num_pages,
            });
        }
        let mut page = Page::new(page_id, self.page_size);
        self.file
            .seek(SeekFrom::Start(page_id as u64 * self.page_size as u64))?;
        self.file.read_exact(&mut page.data)?;
        Ok(page)
    }

    /// Reads a page and verifies its checksum.
    pub fn read_page(&mut self, page_id: PageId) -> Result<Page> {
        let page = self.read_raw(page_id)?;
        if page_id != HEADER_PAGE_ID {
            page.verify()?;
        }
        Ok(page)
    }

    /// Writes a page in place, growing the file when the id is past its end.
    pub fn write_page(&mut self, page: &Page) -> Result<()> {
        if page.size() != self.page_size {
            return Err(StoreError::corrupt(
                page.id,
                format!(
                    "page image is {} bytes, file uses {}-byte pages",
                    page.size(),
                    self.page_size
                ),
            ));
        }
        let grows = page.id >= self.num_pages;
        if grows {
            failpoint::maybe_fail("pager.extend")
                .map_err(|err| StoreError::from_growth(err, self.num_pages))?;
        }
        self.file
            .seek(SeekFrom::Start(page.id as u64 * self.page_size as u64))?;
        let written = self.file.write_all(&page.data);
        if grows {
            written.map_err(|err| StoreError::from_growth(err, self.num_pages))?;
            debug!(page_id = page.id, old_pages = self.num_pages, "database file grew");
            self.num_pages = page.id + 1;
        } else {
            written?;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Page size of an initialised database file, or `None` when the file still
/// needs a bootstrap: it is empty, too short to hold a header, has no header
/// yet, or has a fresh header but not the pages it points at.
fn existing_page_size(file: &mut File, file_size: u64) -> Result<Option<usize>> {
    if file_size < HEADER_SIZE as u64 {
        return Ok(None);
    }
    let mut buf = [0u8; HEADER_SIZE];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf)?;
    if buf.iter().all(|&b| b == 0) {
        return Ok(None);
    }
    let header = FileHeader::deserialize(&buf)?;
    let size = header.page_size as usize;
    if !size.is_power_of_two() || size < HEADER_SIZE {
        return Err(StoreError::corrupt(
            HEADER_PAGE_ID,
            format!("implausible page size {size}"),
        ));
    }
    let never_committed = header.last_txid == 0 && header.record_count == 0;
    if never_committed && file_size < header.page_count as u64 * size as u64 {
        return Ok(None);
    }
    Ok(Some(size))
}
