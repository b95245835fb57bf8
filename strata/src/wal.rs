//! The write-ahead log.
//!
//! Every commit appends one page-image frame per modified page followed by a
//! commit marker, then fsyncs. Frames that are not followed by their marker
//! never happened: replay drops them.
//!
//! ```text
//! header: [magic "STRAWAL1"][version u32][page size u32]
//! frame:  [kind u8][txid u64][page id u32][payload len u32][crc32 u32][payload]
//! ```
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use crc32fast::Hasher;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::failpoint;
use crate::page::Page;
use crate::pager::Pager;
use crate::{PageId, TxId};

pub const WAL_MAGIC: &[u8; 8] = b"STRAWAL1";
pub const WAL_VERSION: u32 = 1;
pub const WAL_HEADER_SIZE: u64 = 16;
pub const FRAME_HEADER_SIZE: usize = 21;

const FRAME_PAGE: u8 = 1;
const FRAME_COMMIT: u8 = 2;
const CRC_OFFSET: usize = 17;

/// A single record in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Full image of a page as of the end of `txid`.
    Page { txid: TxId, page: Arc<Page> },
    /// Terminates the `frame_count` page frames of `txid`.
    Commit { txid: TxId, frame_count: u32 },
}

impl Frame {
    pub fn txid(&self) -> TxId {
        match self {
            Frame::Page { txid, .. } | Frame::Commit { txid, .. } => *txid,
        }
    }

    fn encode(&self) -> BytesMut {
        let commit_payload;
        let (kind, txid, page_id, payload): (u8, TxId, PageId, &[u8]) = match self {
            Frame::Page { txid, page } => (FRAME_PAGE, *txid, page.id, &page.data[..]),
            Frame::Commit { txid, frame_count } => {
                commit_payload = frame_count.to_be_bytes();
                (FRAME_COMMIT, *txid, 0, &commit_payload[..])
            }
        };
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.put_u8(kind);
        buf.put_u64(txid);
        buf.put_u32(page_id);
        buf.put_u32(payload.len() as u32);
        let crc = frame_checksum(&buf[..CRC_OFFSET], payload);
        buf.put_u32(crc);
        buf.put_slice(payload);
        buf
    }
}

fn frame_checksum(header: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(header);
    hasher.update(payload);
    hasher.finalize()
}

/// The page frames of one committed transaction.
#[derive(Debug, Clone)]
pub struct FrameGroup {
    pub txid: TxId,
    pub pages: Vec<Arc<Page>>,
}

/// What a scan of the log found.
#[derive(Debug, Default)]
pub struct Replay {
    /// Committed groups in commit order.
    pub groups: Vec<FrameGroup>,
    /// Groups whose commit marker never made it to the log.
    pub discarded_groups: usize,
    /// The log ended in a cut-short or checksum-failing frame.
    pub torn_tail: bool,
    /// Highest transaction id seen in any intact frame.
    pub max_txid: TxId,
    /// Offset just past the last commit marker.
    pub committed_len: u64,
}

/// Summary of a recovery run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub applied_groups: usize,
    pub discarded_groups: usize,
    pub applied_frames: usize,
    pub torn_tail: bool,
    pub max_txid: TxId,
}

pub struct Wal {
    file: File,
    path: PathBuf,
    page_size: usize,
    /// End of the file as far as appends are concerned.
    len: u64,
    /// End of the last committed group.
    committed_len: u64,
    /// Page frames in committed groups since the last truncate.
    frames: u64,
    /// A failed append may have left partial bytes past `committed_len`.
    tail_dirty: bool,
}

/// `<db path>-wal`.
pub fn path_for(db_path: &Path) -> PathBuf {
    let mut wal_os: OsString = db_path.as_os_str().to_os_string();
    wal_os.push("-wal");
    PathBuf::from(wal_os)
}

fn invalid_data(message: String) -> StoreError {
    StoreError::Io(io::Error::new(ErrorKind::InvalidData, message))
}

impl Wal {
    /// Opens the log next to `db_path`, writing a fresh header if it is empty.
    pub fn open(db_path: &Path, page_size: usize) -> Result<Self> {
        let path = path_for(db_path);
        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&path)?;

        let mut len = file.metadata()?.len();
        if len < WAL_HEADER_SIZE {
            if len > 0 {
                warn!(path = %path.display(), len, "discarding truncated WAL header");
                file.set_len(0)?;
            }
            let mut header = BytesMut::with_capacity(WAL_HEADER_SIZE as usize);
            header.put_slice(WAL_MAGIC);
            header.put_u32(WAL_VERSION);
            header.put_u32(page_size as u32);
            file.write_all(&header)?;
            file.sync_all()?;
            len = WAL_HEADER_SIZE;
        } else {
            verify_header(&mut file, page_size)?;
        }

        Ok(Self {
            file,
            path,
            page_size,
            len,
            committed_len: len,
            frames: 0,
            tail_dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes in the log, header included.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len <= WAL_HEADER_SIZE
    }

    /// Committed page frames since the last truncate.
    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    /// Appends one frame and returns its offset in the log.
    pub fn append(&mut self, frame: &Frame) -> Result<u64> {
        if self.tail_dirty {
            self.discard_tail()?;
        }
        failpoint::maybe_fail("wal.append")?;
        let bytes = frame.encode();
        let offset = self.len;
        if let Err(err) = self.file.write_all(&bytes) {
            self.tail_dirty = true;
            return Err(err.into());
        }
        self.len += bytes.len() as u64;
        Ok(offset)
    }

    pub fn sync(&mut self) -> Result<()> {
        failpoint::maybe_fail("wal.sync")?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Records that everything appended so far belongs to committed groups.
    pub fn mark_committed(&mut self, page_frames: u64) {
        self.committed_len = self.len;
        self.frames += page_frames;
    }

    /// Cuts the log back to the end of the last committed group.
    pub fn discard_tail(&mut self) -> Result<()> {
        if self.len == self.committed_len && !self.tail_dirty {
            return Ok(());
        }
        self.tail_dirty = true;
        self.file.set_len(self.committed_len)?;
        debug!(
            from = self.len,
            to = self.committed_len,
            "discarded uncommitted WAL tail"
        );
        self.len = self.committed_len;
        self.tail_dirty = false;
        Ok(())
    }

    /// A read-only handle on the log for serving page images.
    pub fn reader(&self) -> Result<WalReader> {
        let file = OpenOptions::new().read(true).open(&self.path)?;
        Ok(WalReader {
            file,
            page_size: self.page_size,
        })
    }

    /// Scans the log and returns its committed groups in commit order.
    pub fn replay(&mut self) -> Result<Replay> {
        self.file.seek(SeekFrom::Start(WAL_HEADER_SIZE))?;
        let mut reader = BufReader::new(&self.file);
        let mut replay = Replay {
            committed_len: WAL_HEADER_SIZE,
            ..Replay::default()
        };
        let mut pos = WAL_HEADER_SIZE;
        let mut open: Option<FrameGroup> = None;

        loop {
            let mut header = [0u8; FRAME_HEADER_SIZE];
            match read_full(&mut reader, &mut header)? {
                0 => break,
                n if n < FRAME_HEADER_SIZE => {
                    replay.torn_tail = true;
                    break;
                }
                _ => {}
            }
            let mut fields = &header[..];
            let kind = fields.get_u8();
            let txid = fields.get_u64();
            let page_id = fields.get_u32();
            let payload_len = fields.get_u32() as usize;
            let crc = fields.get_u32();

            let expected_len = match kind {
                FRAME_PAGE => self.page_size,
                FRAME_COMMIT => 4,
                _ => {
                    replay.torn_tail = true;
                    break;
                }
            };
            if payload_len != expected_len {
                replay.torn_tail = true;
                break;
            }
            let mut payload = vec![0u8; payload_len];
            if read_full(&mut reader, &mut payload)? < payload_len
                || frame_checksum(&header[..CRC_OFFSET], &payload) != crc
            {
                replay.torn_tail = true;
                break;
            }
            pos += (FRAME_HEADER_SIZE + payload_len) as u64;
            replay.max_txid = replay.max_txid.max(txid);

            if kind == FRAME_PAGE {
                if open.as_ref().is_some_and(|group| group.txid != txid) {
                    replay.discarded_groups += 1;
                    open = None;
                }
                open.get_or_insert_with(|| FrameGroup {
                    txid,
                    pages: Vec::new(),
                })
                .pages
                .push(Arc::new(Page::from_bytes(page_id, payload)));
                continue;
            }

            let frame_count = (&payload[..]).get_u32() as usize;
            let group = open.take().unwrap_or(FrameGroup {
                txid,
                pages: Vec::new(),
            });
            if group.txid == txid && group.pages.len() == frame_count {
                replay.groups.push(group);
                replay.committed_len = pos;
            } else {
                warn!(
                    txid,
                    frame_count,
                    found = group.pages.len(),
                    "commit marker does not match its frames"
                );
                replay.discarded_groups += 1;
            }
        }
        if open.is_some() {
            replay.discarded_groups += 1;
        }
        if replay.torn_tail {
            warn!(path = %self.path.display(), offset = pos, "WAL ends in a torn frame");
        }
        Ok(replay)
    }

    /// Applies every committed group to the database file, fsyncs it and
    /// empties the log. Running it on a clean log does nothing.
    pub fn recover(&mut self, pager: &mut Pager) -> Result<ReplayReport> {
        let replay = self.replay()?;
        let mut report = ReplayReport {
            applied_groups: replay.groups.len(),
            discarded_groups: replay.discarded_groups,
            applied_frames: 0,
            torn_tail: replay.torn_tail,
            max_txid: replay.max_txid,
        };
        for group in &replay.groups {
            for page in &group.pages {
                pager.write_page(page)?;
            }
            report.applied_frames += group.pages.len();
        }
        if report.applied_frames > 0 {
            pager.sync()?;
        }
        if report.discarded_groups > 0 {
            warn!(
                discarded = report.discarded_groups,
                "dropped uncommitted WAL frames"
            );
        }
        if !self.is_empty() {
            self.truncate()?;
        }
        if report.applied_groups > 0 || report.torn_tail || report.discarded_groups > 0 {
            info!(
                applied_groups = report.applied_groups,
                applied_frames = report.applied_frames,
                discarded_groups = report.discarded_groups,
                torn_tail = report.torn_tail,
                "WAL recovery finished"
            );
        }
        Ok(report)
    }

    /// Empties the log down to its header.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(WAL_HEADER_SIZE)?;
        self.file.sync_all()?;
        self.len = WAL_HEADER_SIZE;
        self.committed_len = WAL_HEADER_SIZE;
        self.frames = 0;
        self.tail_dirty = false;
        Ok(())
    }
}

/// Serves committed page images out of the log with positional reads, so
/// readers never wait on the handle a commit appends through.
#[derive(Debug)]
pub struct WalReader {
    file: File,
    page_size: usize,
}

impl WalReader {
    /// Reads back the page image stored in the frame at `offset`.
    pub fn read_page_image(&self, offset: u64, page_id: PageId) -> Result<Page> {
        let corrupt = |reason: String| StoreError::corrupt(page_id, reason);
        let mut header = [0u8; FRAME_HEADER_SIZE];
        read_exact_at(&self.file, &mut header, offset)?;
        let mut fields = &header[..];
        let kind = fields.get_u8();
        let _txid = fields.get_u64();
        let frame_page = fields.get_u32();
        let payload_len = fields.get_u32() as usize;
        let crc = fields.get_u32();
        if kind != FRAME_PAGE || frame_page != page_id || payload_len != self.page_size {
            return Err(corrupt(format!("WAL frame at offset {offset} does not hold this page")));
        }
        let mut data = vec![0u8; payload_len];
        read_exact_at(&self.file, &mut data, offset + FRAME_HEADER_SIZE as u64)?;
        if frame_checksum(&header[..CRC_OFFSET], &data) != crc {
            return Err(corrupt(format!("WAL frame at offset {offset} fails its checksum")));
        }
        Ok(Page::from_bytes(page_id, data))
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::Error::from(ErrorKind::UnexpectedEof)),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Like `read_exact`, but reports how many bytes were read before EOF.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(filled)
}

fn verify_header(file: &mut File, expected_page_size: usize) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    let mut header = [0u8; WAL_HEADER_SIZE as usize];
    file.read_exact(&mut header)?;
    let mut fields = &header[8..];
    if &header[0..8] != WAL_MAGIC {
        return Err(invalid_data("invalid WAL header (bad magic)".to_string()));
    }
    let version = fields.get_u32();
    if version != WAL_VERSION {
        return Err(invalid_data(format!("unsupported WAL version {version}")));
    }
    let page_size = fields.get_u32() as usize;
    if page_size != expected_page_size {
        return Err(invalid_data(format!(
            "WAL page size {page_size} does not match database page size {expected_page_size}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::FileHeader;
    use crate::page::PageKind;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    const PAGE: usize = 512;

    fn image(id: PageId, fill: u8) -> Arc<Page> {
        let mut page = Page::with_kind(id, PAGE, PageKind::Leaf);
        page.body_mut().fill(fill);
        page.seal();
        Arc::new(page)
    }

    fn commit(wal: &mut Wal, txid: TxId, pages: &[Arc<Page>]) -> Vec<u64> {
        let offsets = pages
            .iter()
            .map(|page| {
                wal.append(&Frame::Page {
                    txid,
                    page: Arc::clone(page),
                })
                .unwrap()
            })
            .collect();
        wal.append(&Frame::Commit {
            txid,
            frame_count: pages.len() as u32,
        })
        .unwrap();
        wal.sync().unwrap();
        wal.mark_committed(pages.len() as u64);
        offsets
    }

    #[test]
    fn committed_groups_replay_in_order() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("t.db");
        let mut wal = Wal::open(&db, PAGE).unwrap();
        commit(&mut wal, 1, &[image(1, 1), image(2, 2)]);
        commit(&mut wal, 2, &[image(1, 3)]);
        assert_eq!(wal.frame_count(), 3);
        drop(wal);

        let mut wal = Wal::open(&db, PAGE).unwrap();
        let replay = wal.replay().unwrap();
        assert_eq!(replay.groups.len(), 2);
        assert_eq!(replay.groups[0].txid, 1);
        assert_eq!(replay.groups[0].pages.len(), 2);
        assert_eq!(replay.groups[1].pages[0].body()[0], 3);
        assert_eq!(replay.discarded_groups, 0);
        assert!(!replay.torn_tail);
        assert_eq!(replay.max_txid, 2);
        assert_eq!(replay.committed_len, wal.len());
    }

    #[test]
    fn frames_without_marker_are_discarded() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("t.db");
        let mut wal = Wal::open(&db, PAGE).unwrap();
        commit(&mut wal, 1, &[image(1, 1)]);
        wal.append(&Frame::Page {
            txid: 2,
            page: image(1, 9),
        })
        .unwrap();
        wal.sync().unwrap();
        drop(wal);

        let mut wal = Wal::open(&db, PAGE).unwrap();
        let replay = wal.replay().unwrap();
        assert_eq!(replay.groups.len(), 1);
        assert_eq!(replay.discarded_groups, 1);
        assert_eq!(replay.max_txid, 2);
    }

    #[test]
    fn torn_tail_keeps_earlier_commits() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("t.db");
        let mut wal = Wal::open(&db, PAGE).unwrap();
        commit(&mut wal, 1, &[image(1, 1)]);
        let good_len = wal.len();
        commit(&mut wal, 2, &[image(2, 2)]);
        drop(wal);

        // Chop the second group in the middle of its page frame.
        let file = OpenOptions::new()
            .write(true)
            .open(path_for(&db))
            .unwrap();
        file.set_len(good_len + 100).unwrap();
        drop(file);

        let mut wal = Wal::open(&db, PAGE).unwrap();
        let replay = wal.replay().unwrap();
        assert_eq!(replay.groups.len(), 1);
        assert!(replay.torn_tail);
        assert_eq!(replay.committed_len, good_len);
    }

    #[test]
    fn checksum_mismatch_ends_the_log() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("t.db");
        let mut wal = Wal::open(&db, PAGE).unwrap();
        commit(&mut wal, 1, &[image(1, 1)]);
        let offsets = commit(&mut wal, 2, &[image(2, 2)]);
        drop(wal);

        let wal_path = path_for(&db);
        let mut bytes = std::fs::read(&wal_path).unwrap();
        let target = offsets[0] as usize + FRAME_HEADER_SIZE + 50;
        bytes[target] ^= 0x55;
        std::fs::write(&wal_path, bytes).unwrap();

        let mut wal = Wal::open(&db, PAGE).unwrap();
        let replay = wal.replay().unwrap();
        assert_eq!(replay.groups.len(), 1);
        assert!(replay.torn_tail);
    }

    #[test]
    fn discard_tail_lets_later_commits_replay() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("t.db");
        let mut wal = Wal::open(&db, PAGE).unwrap();
        commit(&mut wal, 1, &[image(1, 1)]);
        // A commit that fails after its page frame.
        wal.append(&Frame::Page {
            txid: 2,
            page: image(2, 2),
        })
        .unwrap();
        wal.discard_tail().unwrap();
        commit(&mut wal, 3, &[image(3, 3)]);
        drop(wal);

        let mut wal = Wal::open(&db, PAGE).unwrap();
        let replay = wal.replay().unwrap();
        let txids: Vec<TxId> = replay.groups.iter().map(|g| g.txid).collect();
        assert_eq!(txids, vec![1, 3]);
        assert_eq!(replay.discarded_groups, 0);
    }

    #[test]
    fn read_page_image_checks_the_frame() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(&dir.path().join("t.db"), PAGE).unwrap();
        let reader = wal.reader().unwrap();
        let offsets = commit(&mut wal, 1, &[image(4, 7), image(5, 8)]);
        assert_eq!(reader.read_page_image(offsets[1], 5).unwrap().body()[3], 8);
        assert!(matches!(
            reader.read_page_image(offsets[1], 4),
            Err(StoreError::CorruptPage { page_id: 4, .. })
        ));
    }

    #[test]
    fn recover_applies_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("t.db");
        let mut pager = Pager::open(&db, PAGE).unwrap();
        pager.write_page(&FileHeader::new(PAGE as u32).to_page()).unwrap();
        pager.write_page(&image(1, 0)).unwrap();

        let mut wal = Wal::open(&db, PAGE).unwrap();
        commit(&mut wal, 1, &[image(1, 5), image(2, 6)]);
        let report = wal.recover(&mut pager).unwrap();
        assert_eq!(report.applied_groups, 1);
        assert_eq!(report.applied_frames, 2);
        assert!(wal.is_empty());
        assert_eq!(pager.num_pages(), 3);
        assert_eq!(pager.read_page(1).unwrap().body()[0], 5);
        assert_eq!(pager.read_page(2).unwrap().body()[0], 6);

        let again = wal.recover(&mut pager).unwrap();
        assert_eq!(again, ReplayReport::default());
        assert_eq!(pager.read_page(1).unwrap().body()[0], 5);
    }

    #[test]
    fn page_size_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("t.db");
        drop(Wal::open(&db, PAGE).unwrap());
        assert!(Wal::open(&db, 4096).is_err());
    }

    #[test]
    fn append_failpoint_leaves_log_unchanged() {
        failpoint::clear();
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(&dir.path().join("t.db"), PAGE).unwrap();
        failpoint::enable("wal.append");
        assert!(wal
            .append(&Frame::Commit {
                txid: 1,
                frame_count: 0
            })
            .is_err());
        failpoint::clear();
        assert!(wal.is_empty());
    }
}
