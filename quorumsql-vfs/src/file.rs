use bytes::Bytes;

use crate::error::Error;
use crate::frames::WalFrame;
use crate::page::Page;
use crate::wal::{FRAME_HDRSIZE, WAL_HDRSIZE};
use crate::{wal, Result, DB_HDRSIZE};

/// What a volatile file holds, decided once at open time from the SQLite
/// open flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    MainDb,
    Wal,
    /// Journals, super-journals and temporary artefacts. Creating them
    /// succeeds trivially, writes are discarded and reads zero-fill.
    Other,
}

/// Frames taken out of a WAL by the extractor, before the registry turns
/// them into a [`crate::FrameBatch`].
pub(crate) struct PendingFrames {
    pub(crate) start: u32,
    pub(crate) frames: Vec<WalFrame>,
    pub(crate) is_begin: bool,
    pub(crate) is_commit: bool,
    pub(crate) size_after: u32,
}

/// Content of a single file in the volatile file system.
///
/// All access is serialized by the registry mutex; methods here assume the
/// lock is held and, for WAL files, that `page_size` has been resolved.
#[derive(Debug)]
pub(crate) struct VolatileFile {
    pub(crate) filename: String,
    pub(crate) kind: FileKind,
    /// Set lazily: by the first main-db write, by a `page_size` pragma, or
    /// inherited from the sibling main file for WAL files.
    pub(crate) page_size: u32,
    pub(crate) pages: Vec<Page>,
    wal_hdr: [u8; WAL_HDRSIZE],
    wal_hdr_set: bool,
    /// Frame count already handed to the replication layer.
    polled_frames: usize,
    /// Frame count up to the last committed transaction.
    committed_frames: usize,
    /// Whether a multi-batch transaction is in progress.
    txn_open: bool,
    /// Database size in pages recorded by the last commit frame.
    pub(crate) size_after: u32,
    /// Bumped on WAL reset so synthesized headers get fresh salts.
    pub(crate) salt_counter: u32,
    pub(crate) refcount: usize,
    shm_regions: Vec<Box<[u8]>>,
    shm_refcount: usize,
}

impl VolatileFile {
    pub(crate) fn new(filename: String, kind: FileKind) -> Self {
        Self {
            filename,
            kind,
            page_size: 0,
            pages: Vec::new(),
            wal_hdr: [0; WAL_HDRSIZE],
            wal_hdr_set: false,
            polled_frames: 0,
            committed_frames: 0,
            txn_open: false,
            size_after: 0,
            salt_counter: 0,
            refcount: 0,
            shm_regions: Vec::new(),
            shm_refcount: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        match self.kind {
            FileKind::Wal => self.pages.is_empty() && !self.wal_hdr_set,
            _ => self.pages.is_empty(),
        }
    }

    pub(crate) fn size(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        let ps = self.page_size as u64;
        match self.kind {
            FileKind::MainDb => self.pages.len() as u64 * ps,
            FileKind::Wal => {
                WAL_HDRSIZE as u64 + self.pages.len() as u64 * (FRAME_HDRSIZE as u64 + ps)
            }
            FileKind::Other => 0,
        }
    }

    pub(crate) fn committed_frames(&self) -> usize {
        self.committed_frames
    }

    /// Returns the page at 1-based `pgno`, appending a fresh zero page when
    /// `pgno` is exactly one past the end. Larger page numbers are a
    /// contract violation.
    fn page_get(&mut self, pgno: u32) -> Result<&mut Page> {
        debug_assert!(self.page_size > 0);
        let len = self.pages.len() as u32;
        if pgno == len + 1 {
            self.pages
                .push(Page::new(self.page_size, self.kind == FileKind::Wal));
        } else if pgno > len {
            return Err(Error::PageOutOfBounds(pgno));
        }
        Ok(&mut self.pages[pgno as usize - 1])
    }

    fn page_lookup(&self, pgno: u32) -> Option<&Page> {
        self.pages.get(pgno as usize - 1)
    }

    pub(crate) fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.is_empty() {
            buf.fill(0);
            return Err(Error::ShortRead);
        }
        match self.kind {
            FileKind::MainDb => self.read_main(offset, buf),
            FileKind::Wal => self.read_wal(offset, buf),
            FileKind::Other => {
                buf.fill(0);
                Err(Error::ShortRead)
            }
        }
    }

    fn read_main(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let ps = self.page_size as u64;
        debug_assert!(ps > 0);
        let amount = buf.len() as u64;
        let pgno = if offset < ps {
            // A page-1 read, possibly partial (SQLite reads the 100-byte
            // header and other prefixes of the first page).
            if offset + amount > ps {
                return Err(Error::ReadGeometry {
                    offset,
                    amount: buf.len(),
                });
            }
            1
        } else {
            if offset % ps != 0 || amount != ps {
                return Err(Error::ReadGeometry {
                    offset,
                    amount: buf.len(),
                });
            }
            (offset / ps) as u32 + 1
        };
        match self.page_lookup(pgno) {
            Some(page) => {
                let start = (offset % ps) as usize;
                buf.copy_from_slice(&page.buf[start..start + buf.len()]);
                Ok(())
            }
            None => {
                buf.fill(0);
                Err(Error::ShortRead)
            }
        }
    }

    /// The WAL read path recognises five geometries: the 32-byte header,
    /// a 24-byte frame header, the 8-byte checksum half of a header, one
    /// page, or a full frame. Anything else is a contract violation.
    fn read_wal(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let ps = self.page_size as u64;
        debug_assert!(ps > 0);
        let amount = buf.len();
        let frame_size = FRAME_HDRSIZE as u64 + ps;
        let geometry_err = Error::ReadGeometry { offset, amount };

        if offset == 0 {
            if amount != WAL_HDRSIZE {
                return Err(geometry_err);
            }
            buf.copy_from_slice(&self.wal_hdr);
            return Ok(());
        }
        if amount == 8 && offset == FRAME_HDRSIZE as u64 {
            // The checksum pair at the end of the WAL header.
            buf.copy_from_slice(&self.wal_hdr[FRAME_HDRSIZE..]);
            return Ok(());
        }

        let (frame_offset, hdr_range) = if amount == FRAME_HDRSIZE {
            (offset.checked_sub(WAL_HDRSIZE as u64), Some(0..FRAME_HDRSIZE))
        } else if amount == 8 {
            (offset.checked_sub(WAL_HDRSIZE as u64 + 16), Some(16..24))
        } else if amount as u64 == ps {
            (
                offset.checked_sub(WAL_HDRSIZE as u64 + FRAME_HDRSIZE as u64),
                None,
            )
        } else if amount as u64 == frame_size {
            (offset.checked_sub(WAL_HDRSIZE as u64), None)
        } else {
            return Err(geometry_err);
        };
        let frame_offset = frame_offset.ok_or_else(|| Error::ReadGeometry { offset, amount })?;
        if frame_offset % frame_size != 0 {
            return Err(geometry_err);
        }
        let pgno = (frame_offset / frame_size) as u32 + 1;

        let Some(page) = self.page_lookup(pgno) else {
            buf.fill(0);
            return Err(Error::ShortRead);
        };
        let hdr = page.hdr.as_ref().ok_or(Error::Protocol(
            "WAL page without a frame header",
        ))?;
        match hdr_range {
            Some(range) => buf.copy_from_slice(&hdr[range]),
            None if amount as u64 == ps => buf.copy_from_slice(&page.buf),
            None => {
                buf[..FRAME_HDRSIZE].copy_from_slice(&hdr[..]);
                buf[FRAME_HDRSIZE..].copy_from_slice(&page.buf);
            }
        }
        Ok(())
    }

    pub(crate) fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        match self.kind {
            FileKind::MainDb => self.write_main(offset, buf),
            FileKind::Wal => self.write_wal(offset, buf),
            // Silently swallow writes to journals and temporary files.
            FileKind::Other => Ok(()),
        }
    }

    fn write_main(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let amount = buf.len();
        let pgno = if offset == 0 {
            // The first database page; it must contain at least the header,
            // from which the page size is parsed and pinned.
            if amount < DB_HDRSIZE {
                return Err(Error::WriteGeometry { offset, amount });
            }
            let page_size = wal::parse_db_page_size(buf)?;
            if self.page_size > 0 && page_size != self.page_size {
                return Err(Error::PageSizeMismatch {
                    expected: self.page_size,
                    got: page_size,
                });
            }
            self.page_size = page_size;
            if amount as u64 > self.page_size as u64 {
                return Err(Error::WriteGeometry { offset, amount });
            }
            1
        } else {
            if self.page_size == 0 {
                return Err(Error::PageSizeUnknown);
            }
            let ps = self.page_size as u64;
            if offset % ps != 0 || amount as u64 != ps {
                return Err(Error::WriteGeometry { offset, amount });
            }
            (offset / ps) as u32 + 1
        };
        let page = self.page_get(pgno)?;
        page.buf[..amount].copy_from_slice(buf);
        Ok(())
    }

    fn write_wal(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let amount = buf.len();
        if offset == 0 {
            if amount != WAL_HDRSIZE {
                return Err(Error::WriteGeometry { offset, amount });
            }
            let page_size = wal::parse_wal_page_size(buf)?;
            if self.page_size == 0 {
                self.page_size = page_size;
            } else if page_size != self.page_size {
                return Err(Error::PageSizeMismatch {
                    expected: self.page_size,
                    got: page_size,
                });
            }
            self.wal_hdr.copy_from_slice(buf);
            self.wal_hdr_set = true;
            return Ok(());
        }

        if self.page_size == 0 {
            return Err(Error::PageSizeUnknown);
        }
        let ps = self.page_size as u64;
        let frame_size = FRAME_HDRSIZE as u64 + ps;

        if amount == FRAME_HDRSIZE {
            let rel = offset
                .checked_sub(WAL_HDRSIZE as u64)
                .filter(|rel| rel % frame_size == 0)
                .ok_or(Error::WriteGeometry { offset, amount })?;
            let pgno = (rel / frame_size) as u32 + 1;
            let page = self.page_get(pgno)?;
            let hdr = page
                .hdr
                .as_mut()
                .ok_or(Error::Protocol("WAL page without a frame header"))?;
            hdr.copy_from_slice(buf);
            Ok(())
        } else if amount as u64 == ps {
            let rel = offset
                .checked_sub(WAL_HDRSIZE as u64 + FRAME_HDRSIZE as u64)
                .filter(|rel| rel % frame_size == 0)
                .ok_or(Error::WriteGeometry { offset, amount })?;
            let frame = (rel / frame_size) as usize;
            let overwrites_polled = frame < self.polled_frames;
            let page = self
                .pages
                .get_mut(frame)
                .ok_or(Error::Protocol("frame page written before its header"))?;
            page.buf.copy_from_slice(buf);
            if overwrites_polled {
                page.mark_dirty(0..amount);
            }
            Ok(())
        } else {
            Err(Error::WriteGeometry { offset, amount })
        }
    }

    pub(crate) fn truncate(&mut self, size: u64) -> Result<()> {
        match self.kind {
            FileKind::MainDb => {
                if self.is_empty() {
                    // SQLite never grows an empty file through xTruncate.
                    if size != 0 {
                        return Err(Error::WriteGeometry {
                            offset: size,
                            amount: 0,
                        });
                    }
                    return Ok(());
                }
                let ps = self.page_size as u64;
                if size % ps != 0 {
                    return Err(Error::WriteGeometry {
                        offset: size,
                        amount: 0,
                    });
                }
                let new_len = (size / ps) as usize;
                if new_len > self.pages.len() {
                    return Err(Error::Protocol("truncate cannot grow a file"));
                }
                self.pages.truncate(new_len);
                Ok(())
            }
            FileKind::Wal => {
                // Only a full reset after a checkpoint is meaningful; the
                // semantics of partial WAL truncation are unsupported.
                if size != 0 {
                    return Err(Error::UnsupportedTruncate);
                }
                self.pages.clear();
                self.wal_hdr = [0; WAL_HDRSIZE];
                self.wal_hdr_set = false;
                self.polled_frames = 0;
                self.committed_frames = 0;
                self.txn_open = false;
                self.size_after = 0;
                self.salt_counter += 1;
                Ok(())
            }
            FileKind::Other => Ok(()),
        }
    }

    /// Takes the frames written since the last extraction, advancing the
    /// watermark. Returns `None` when the WAL has nothing new.
    pub(crate) fn take_pending(&mut self) -> Option<PendingFrames> {
        debug_assert_eq!(self.kind, FileKind::Wal);
        let total = self.pages.len();
        if total == self.polled_frames {
            return None;
        }
        let start = self.polled_frames;
        let mut frames = Vec::with_capacity(total - start);
        for page in &mut self.pages[start..total] {
            page.drain_dirty();
            let hdr = page.hdr.as_ref().expect("WAL page owns a frame header");
            frames.push(WalFrame {
                page_no: u32::from_be_bytes(hdr[..4].try_into().unwrap()),
                page: Bytes::copy_from_slice(&page.buf),
            });
        }
        let last_hdr = self.pages[total - 1]
            .hdr
            .as_ref()
            .expect("WAL page owns a frame header");
        let size_after = u32::from_be_bytes(last_hdr[4..8].try_into().unwrap());
        let is_commit = size_after != 0;
        let is_begin = !self.txn_open;

        self.polled_frames = total;
        if is_commit {
            self.committed_frames = total;
            self.txn_open = false;
            self.size_after = size_after;
        } else {
            self.txn_open = true;
        }
        Some(PendingFrames {
            start: start as u32,
            frames,
            is_begin,
            is_commit,
            size_after,
        })
    }

    /// Discards every frame past the last committed transaction and rewinds
    /// the extraction watermark. Used when replication fails and when a
    /// rolled-back transaction leaves dead frames behind.
    pub(crate) fn rollback_uncommitted(&mut self) {
        self.pages.truncate(self.committed_frames);
        self.polled_frames = self.committed_frames;
        self.txn_open = false;
    }

    /// Bookkeeping after the apply path installed (or recognised) a batch
    /// ending at frame `end`.
    pub(crate) fn note_applied(&mut self, end: usize, commit: bool, size_after: u32) {
        debug_assert!(end <= self.pages.len());
        self.polled_frames = self.polled_frames.max(end);
        if commit {
            self.committed_frames = end;
            self.txn_open = false;
            self.size_after = size_after;
        } else {
            self.txn_open = true;
        }
    }

    /// Whether the WAL holds frames past the last committed transaction.
    pub(crate) fn has_uncommitted_tail(&self) -> bool {
        self.pages.len() > self.committed_frames
    }

    /// Whether the frames stored from index `start` match `frames` in both
    /// page number and payload. Used by the apply path to recognise batches
    /// SQLite already installed on the leader.
    pub(crate) fn wal_tail_matches(&self, start: usize, frames: &[WalFrame]) -> bool {
        if self.pages.len() < start + frames.len() {
            return false;
        }
        self.pages[start..start + frames.len()]
            .iter()
            .zip(frames)
            .all(|(page, frame)| {
                let hdr = page.hdr.as_ref().expect("WAL page owns a frame header");
                u32::from_be_bytes(hdr[..4].try_into().unwrap()) == frame.page_no
                    && page.buf[..] == frame.page[..]
            })
    }

    pub(crate) fn wal_header(&self) -> Option<&[u8; WAL_HDRSIZE]> {
        self.wal_hdr_set.then_some(&self.wal_hdr)
    }

    /// Maps (optionally allocating) a shared-memory region. Regions grow
    /// one slot at a time and are zero-initialised.
    pub(crate) fn shm_map(
        &mut self,
        region: usize,
        size: usize,
        extend: bool,
    ) -> Result<Option<*mut u8>> {
        if region >= self.shm_regions.len() {
            if !extend {
                return Ok(None);
            }
            if region != self.shm_regions.len() {
                return Err(Error::Protocol("shm regions must grow one at a time"));
            }
            self.shm_regions.push(vec![0; size].into_boxed_slice());
        }
        if region == 0 {
            self.shm_refcount += 1;
        }
        Ok(Some(self.shm_regions[region].as_mut_ptr()))
    }

    pub(crate) fn shm_unmap(&mut self) {
        if self.shm_refcount == 0 {
            return;
        }
        self.shm_refcount -= 1;
        if self.shm_refcount == 0 {
            self.shm_regions.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn main_db_header(page_size: u16) -> Vec<u8> {
        let mut hdr = vec![0u8; DB_HDRSIZE];
        hdr[16..18].copy_from_slice(&page_size.to_be_bytes());
        hdr
    }

    #[test]
    fn main_db_write_pins_page_size() {
        let mut file = VolatileFile::new("test.db".into(), FileKind::MainDb);
        file.write_at(0, &main_db_header(4096)).unwrap();
        assert_eq!(file.page_size, 4096);

        // A later first-page write with a conflicting size is refused.
        let err = file.write_at(0, &main_db_header(512)).unwrap_err();
        assert!(matches!(err, Error::PageSizeMismatch { .. }));
    }

    #[test]
    fn main_db_rejects_unaligned_writes() {
        let mut file = VolatileFile::new("test.db".into(), FileKind::MainDb);
        file.write_at(0, &main_db_header(512)).unwrap();
        assert!(matches!(
            file.write_at(100, &[0u8; 512]),
            Err(Error::WriteGeometry { .. })
        ));
        assert!(matches!(
            file.write_at(512, &[0u8; 100]),
            Err(Error::WriteGeometry { .. })
        ));
    }

    #[test]
    fn pages_append_one_past_the_end_only() {
        let mut file = VolatileFile::new("test.db".into(), FileKind::MainDb);
        file.write_at(0, &main_db_header(512)).unwrap();
        file.write_at(512, &[1u8; 512]).unwrap();
        // Page 4 would leave a gap.
        assert!(matches!(
            file.write_at(3 * 512, &[1u8; 512]),
            Err(Error::PageOutOfBounds(4))
        ));
    }

    #[test]
    fn empty_file_reads_zero_fill() {
        let file = VolatileFile::new("test.db".into(), FileKind::MainDb);
        let mut buf = [0xffu8; 16];
        assert!(matches!(file.read_at(0, &mut buf), Err(Error::ShortRead)));
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn truncate_shrinks_and_reports_size() {
        let mut file = VolatileFile::new("test.db".into(), FileKind::MainDb);
        file.write_at(0, &main_db_header(512)).unwrap();
        file.write_at(512, &[1u8; 512]).unwrap();
        file.write_at(1024, &[2u8; 512]).unwrap();
        assert_eq!(file.size(), 3 * 512);

        file.truncate(512).unwrap();
        assert_eq!(file.size(), 512);

        let mut buf = [0u8; 512];
        assert!(matches!(
            file.read_at(512, &mut buf),
            Err(Error::ShortRead)
        ));
    }

    #[test]
    fn wal_truncate_must_be_to_zero() {
        let mut file = VolatileFile::new("test.db-wal".into(), FileKind::Wal);
        file.page_size = 512;
        let mut hdr = [0u8; WAL_HDRSIZE];
        hdr[8..12].copy_from_slice(&512u32.to_be_bytes());
        file.write_at(0, &hdr).unwrap();

        assert!(matches!(
            file.truncate(512),
            Err(Error::UnsupportedTruncate)
        ));
        file.truncate(0).unwrap();
        assert!(file.wal_header().is_none());
        assert_eq!(file.size(), 0);
    }

    #[test]
    fn wal_frame_roundtrip() {
        let mut file = VolatileFile::new("test.db-wal".into(), FileKind::Wal);
        file.page_size = 512;

        let mut hdr = [0u8; WAL_HDRSIZE];
        hdr[8..12].copy_from_slice(&512u32.to_be_bytes());
        file.write_at(0, &hdr).unwrap();

        let mut frame_hdr = [0u8; FRAME_HDRSIZE];
        frame_hdr[..4].copy_from_slice(&2u32.to_be_bytes());
        file.write_at(WAL_HDRSIZE as u64, &frame_hdr).unwrap();
        file.write_at((WAL_HDRSIZE + FRAME_HDRSIZE) as u64, &[7u8; 512])
            .unwrap();

        // Frame header, checksum pair, page and full frame reads.
        let mut out = [0u8; FRAME_HDRSIZE];
        file.read_at(WAL_HDRSIZE as u64, &mut out).unwrap();
        assert_eq!(out, frame_hdr);

        let mut cksum = [0u8; 8];
        file.read_at((WAL_HDRSIZE + 16) as u64, &mut cksum).unwrap();
        assert_eq!(cksum, frame_hdr[16..24]);

        let mut page = [0u8; 512];
        file.read_at((WAL_HDRSIZE + FRAME_HDRSIZE) as u64, &mut page)
            .unwrap();
        assert_eq!(page, [7u8; 512]);

        let mut full = [0u8; FRAME_HDRSIZE + 512];
        file.read_at(WAL_HDRSIZE as u64, &mut full).unwrap();
        assert_eq!(&full[..FRAME_HDRSIZE], &frame_hdr);
        assert_eq!(&full[FRAME_HDRSIZE..], &[7u8; 512]);

        // An unrecognised geometry is a contract violation, not a short
        // read.
        let mut odd = [0u8; 100];
        assert!(matches!(
            file.read_at(WAL_HDRSIZE as u64, &mut odd),
            Err(Error::ReadGeometry { .. })
        ));
    }

    #[test]
    fn pending_frames_respect_the_watermark() {
        let mut file = VolatileFile::new("test.db-wal".into(), FileKind::Wal);
        file.page_size = 512;

        for (i, commit) in [(0u32, 0u32), (1, 2)] {
            let mut frame_hdr = [0u8; FRAME_HDRSIZE];
            frame_hdr[..4].copy_from_slice(&(i + 1).to_be_bytes());
            frame_hdr[4..8].copy_from_slice(&commit.to_be_bytes());
            let base = (WAL_HDRSIZE + i as usize * (FRAME_HDRSIZE + 512)) as u64;
            file.write_at(base, &frame_hdr).unwrap();
            file.write_at(base + FRAME_HDRSIZE as u64, &[i as u8; 512])
                .unwrap();
        }

        let pending = file.take_pending().unwrap();
        assert_eq!(pending.start, 0);
        assert_eq!(pending.frames.len(), 2);
        assert!(pending.is_begin);
        assert!(pending.is_commit);
        assert_eq!(pending.size_after, 2);

        // Drained: nothing new to extract.
        assert!(file.take_pending().is_none());
        assert_eq!(file.committed_frames(), 2);
    }

    #[test]
    fn rollback_discards_the_uncommitted_tail() {
        let mut file = VolatileFile::new("test.db-wal".into(), FileKind::Wal);
        file.page_size = 512;

        let mut frame_hdr = [0u8; FRAME_HDRSIZE];
        frame_hdr[..4].copy_from_slice(&1u32.to_be_bytes());
        file.write_at(WAL_HDRSIZE as u64, &frame_hdr).unwrap();
        file.write_at((WAL_HDRSIZE + FRAME_HDRSIZE) as u64, &[9u8; 512])
            .unwrap();

        let pending = file.take_pending().unwrap();
        assert!(!pending.is_commit);
        assert!(file.has_uncommitted_tail());
        assert!(file.wal_tail_matches(0, &pending.frames));
        assert!(!file.wal_tail_matches(1, &pending.frames));

        file.rollback_uncommitted();
        assert!(!file.has_uncommitted_tail());
        assert_eq!(file.pages.len(), 0);
        assert!(file.take_pending().is_none());
    }

    #[test]
    fn shm_regions_grow_one_at_a_time() {
        let mut file = VolatileFile::new("test.db".into(), FileKind::MainDb);
        assert!(file.shm_map(0, 32768, false).unwrap().is_none());
        assert!(file.shm_map(0, 32768, true).unwrap().is_some());
        assert!(matches!(
            file.shm_map(5, 32768, true),
            Err(Error::Protocol(_))
        ));
        assert!(file.shm_map(1, 32768, true).unwrap().is_some());

        file.shm_unmap();
        assert!(file.shm_regions.is_empty());
    }
}
