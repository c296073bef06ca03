//! Process-wide registry of volatile files.
//!
//! A registry owns every file of one VFS instance, in a bounded slot array
//! so that a name lookup and the search for a free slot happen in a single
//! pass. One mutex serializes every entry point; it is released before any
//! callback or SQLite re-entry.

use std::ffi::{c_int, CString};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Error;
use crate::file::{FileKind, VolatileFile};
use crate::frames::FrameBatch;
use crate::wal::WAL_HDRSIZE;
use crate::{Result, MAX_FILES};

bitflags::bitflags! {
    /// The subset of SQLite open flags the registry interprets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const CREATE = 1 << 0;
        const EXCLUSIVE = 1 << 1;
        const MAIN_DB = 1 << 2;
        const WAL = 1 << 3;
    }
}

impl OpenFlags {
    pub(crate) fn kind(self) -> FileKind {
        if self.contains(OpenFlags::MAIN_DB) {
            FileKind::MainDb
        } else if self.contains(OpenFlags::WAL) {
            FileKind::Wal
        } else {
            FileKind::Other
        }
    }
}

/// Suffix joining a database name to its write-ahead log.
pub const WAL_SUFFIX: &str = "-wal";

static VFS_SERIAL: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub(crate) struct RegistryInner {
    slots: Vec<Option<VolatileFile>>,
    /// errno-like value of the last failed operation, for `xGetLastError`.
    last_error: c_int,
}

impl RegistryInner {
    /// One pass over the slots: the index holding `filename`, or the first
    /// free slot if the name is absent.
    fn lookup(&self, filename: &str) -> (Option<usize>, Option<usize>) {
        let mut free_slot = None;
        for (i, slot) in self.slots.iter().enumerate() {
            match slot {
                Some(file) if file.filename == filename => return (Some(i), None),
                None if free_slot.is_none() => free_slot = Some(i),
                _ => {}
            }
        }
        (None, free_slot)
    }

    fn file(&self, slot: usize) -> &VolatileFile {
        self.slots[slot]
            .as_ref()
            .expect("open handle points at a live slot")
    }

    fn file_mut(&mut self, slot: usize) -> &mut VolatileFile {
        self.slots[slot]
            .as_mut()
            .expect("open handle points at a live slot")
    }

    /// Inherits a WAL file's page size from its sibling main file, found by
    /// stripping the `-wal` suffix. Re-resolved on every use rather than
    /// stored, so a deleted main file cannot leave a dangling link.
    fn resolve_wal_page_size(&mut self, slot: usize) {
        if self.file(slot).page_size > 0 || self.file(slot).kind != FileKind::Wal {
            return;
        }
        let main_name = match self.file(slot).filename.strip_suffix(WAL_SUFFIX) {
            Some(name) => name.to_owned(),
            None => return,
        };
        let page_size = match self.lookup(&main_name) {
            (Some(main_slot), _) => self.file(main_slot).page_size,
            _ => 0,
        };
        if page_size > 0 {
            self.file_mut(slot).page_size = page_size;
        }
    }

    fn record(&mut self, err: Error) -> Error {
        self.last_error = err.errno();
        err
    }
}

#[derive(Debug)]
pub(crate) struct VfsShared {
    pub(crate) name: CString,
    pub(crate) registry: Mutex<RegistryInner>,
}

/// A volatile VFS instance: the registry plus the name it is (or will be)
/// registered under with SQLite.
#[derive(Clone)]
pub struct Vfs {
    pub(crate) shared: Arc<VfsShared>,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    pub fn new() -> Self {
        let serial = VFS_SERIAL.fetch_add(1, Ordering::Relaxed);
        let name = CString::new(format!("quorumsql-{serial}"))
            .expect("generated VFS names contain no NUL");
        Self {
            shared: Arc::new(VfsShared {
                name,
                registry: Mutex::new(RegistryInner {
                    slots: (0..MAX_FILES).map(|_| None).collect(),
                    last_error: 0,
                }),
            }),
        }
    }

    /// The unique name this instance registers under.
    pub fn name(&self) -> &str {
        self.shared
            .name
            .to_str()
            .expect("generated VFS names are ASCII")
    }

    pub fn open(&self, filename: &str, flags: OpenFlags) -> Result<FileHandle> {
        let mut inner = self.shared.registry.lock();
        let (existing, free_slot) = inner.lookup(filename);
        let slot = match existing {
            Some(slot) => {
                if flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) {
                    return Err(inner.record(Error::Exists));
                }
                slot
            }
            None => {
                if !flags.contains(OpenFlags::CREATE) {
                    return Err(inner.record(Error::NoEntry));
                }
                let Some(slot) = free_slot else {
                    return Err(inner.record(Error::TooManyFiles));
                };
                let kind = flags.kind();
                tracing::trace!(filename, ?kind, "creating volatile file");
                inner.slots[slot] = Some(VolatileFile::new(filename.to_owned(), kind));
                slot
            }
        };
        inner.file_mut(slot).refcount += 1;
        Ok(FileHandle {
            shared: self.shared.clone(),
            slot,
        })
    }

    /// Deletes a file. Fails with [`Error::Busy`] while any handle is open
    /// and with [`Error::NoEntry`] when the name is absent.
    pub fn delete(&self, filename: &str) -> Result<()> {
        let mut inner = self.shared.registry.lock();
        let (existing, _) = inner.lookup(filename);
        let Some(slot) = existing else {
            return Err(inner.record(Error::NoEntry));
        };
        if inner.file(slot).refcount > 0 {
            return Err(inner.record(Error::Busy));
        }
        tracing::trace!(filename, "deleting volatile file");
        inner.slots[slot] = None;
        Ok(())
    }

    pub fn exists(&self, filename: &str) -> bool {
        let inner = self.shared.registry.lock();
        let (existing, _) = inner.lookup(filename);
        existing.is_some()
    }

    /// Extracts the frames written to `db_name`'s WAL since the last
    /// extraction, together with the WAL frame index the batch starts at.
    ///
    /// This is the handoff point to replication: afterwards the WAL is
    /// logically drained for the next step, though its bytes remain
    /// readable by SQLite.
    pub fn poll(&self, db_name: &str) -> Result<Option<(u32, FrameBatch)>> {
        let mut inner = self.shared.registry.lock();
        let wal_name = format!("{db_name}{WAL_SUFFIX}");
        let (Some(wal_slot), _) = inner.lookup(&wal_name) else {
            return Ok(None);
        };
        inner.resolve_wal_page_size(wal_slot);
        let main_pages = match inner.lookup(db_name) {
            (Some(main_slot), _) => inner.file(main_slot).pages.len() as u32,
            _ => 0,
        };
        let wal = inner.file_mut(wal_slot);
        let page_size = wal.page_size;
        let Some(pending) = wal.take_pending() else {
            return Ok(None);
        };
        let truncate =
            (pending.is_commit && pending.size_after < main_pages).then_some(pending.size_after);
        tracing::debug!(
            db_name,
            start = pending.start,
            frames = pending.frames.len(),
            is_begin = pending.is_begin,
            is_commit = pending.is_commit,
            "extracted frame batch"
        );
        Ok(Some((
            pending.start,
            FrameBatch {
                page_size,
                is_begin: pending.is_begin,
                is_commit: pending.is_commit,
                truncate,
                frames: pending.frames,
            },
        )))
    }

    /// Discards every WAL frame of `db_name` past the last committed
    /// transaction: after a failed replication round-trip, and after a
    /// rolled-back transaction left dead frames behind.
    pub fn rollback(&self, db_name: &str) -> Result<()> {
        let mut inner = self.shared.registry.lock();
        let wal_name = format!("{db_name}{WAL_SUFFIX}");
        if let (Some(wal_slot), _) = inner.lookup(&wal_name) {
            tracing::debug!(db_name, "rolling back uncommitted WAL tail");
            inner.file_mut(wal_slot).rollback_uncommitted();
        }
        Ok(())
    }

    /// Whether `db_name`'s WAL holds frames past its committed watermark.
    pub fn has_uncommitted_tail(&self, db_name: &str) -> bool {
        let inner = self.shared.registry.lock();
        let wal_name = format!("{db_name}{WAL_SUFFIX}");
        match inner.lookup(&wal_name) {
            (Some(wal_slot), _) => inner.file(wal_slot).has_uncommitted_tail(),
            _ => false,
        }
    }

    pub(crate) fn last_error(&self) -> c_int {
        self.shared.registry.lock().last_error
    }
}

/// An open handle on a volatile file. Closing (dropping) the handle leaves
/// the file's content in the registry; only [`Vfs::delete`] removes it.
#[derive(Debug)]
pub struct FileHandle {
    shared: Arc<VfsShared>,
    slot: usize,
}

impl FileHandle {
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut inner = self.shared.registry.lock();
        inner.resolve_wal_page_size(self.slot);
        inner.file(self.slot).read_at(offset, buf)
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut inner = self.shared.registry.lock();
        inner.resolve_wal_page_size(self.slot);
        inner.file_mut(self.slot).write_at(offset, buf)
    }

    pub fn truncate(&self, size: u64) -> Result<()> {
        let mut inner = self.shared.registry.lock();
        inner.file_mut(self.slot).truncate(size)
    }

    pub fn size(&self) -> u64 {
        let mut inner = self.shared.registry.lock();
        inner.resolve_wal_page_size(self.slot);
        inner.file(self.slot).size()
    }

    pub fn kind(&self) -> FileKind {
        self.shared.registry.lock().file(self.slot).kind
    }

    pub fn filename(&self) -> String {
        self.shared.registry.lock().file(self.slot).filename.clone()
    }

    /// The pinned page size, or `None` before the first write decides it.
    pub fn page_size(&self) -> Option<u32> {
        let mut inner = self.shared.registry.lock();
        inner.resolve_wal_page_size(self.slot);
        match inner.file(self.slot).page_size {
            0 => None,
            n => Some(n),
        }
    }

    /// Pins the page size ahead of the first write (the `page_size` pragma
    /// path, and batch adoption on the apply path).
    pub fn set_page_size(&self, page_size: u32) -> Result<()> {
        if !crate::wal::is_valid_page_size(page_size) {
            return Err(Error::InvalidPageSize(page_size));
        }
        let mut inner = self.shared.registry.lock();
        let file = inner.file_mut(self.slot);
        if file.page_size > 0 && file.page_size != page_size {
            return Err(Error::PageSizeMismatch {
                expected: file.page_size,
                got: page_size,
            });
        }
        file.page_size = page_size;
        Ok(())
    }

    /// Number of pages (for a WAL file: frames) currently stored.
    pub fn pages_len(&self) -> usize {
        self.shared.registry.lock().file(self.slot).pages.len()
    }

    pub fn committed_frames(&self) -> usize {
        self.shared
            .registry
            .lock()
            .file(self.slot)
            .committed_frames()
    }

    pub fn has_uncommitted_tail(&self) -> bool {
        self.shared
            .registry
            .lock()
            .file(self.slot)
            .has_uncommitted_tail()
    }

    /// Whether the frames stored from index `start` match `frames` exactly.
    pub fn wal_tail_matches(&self, start: usize, frames: &[crate::WalFrame]) -> bool {
        self.shared
            .registry
            .lock()
            .file(self.slot)
            .wal_tail_matches(start, frames)
    }

    pub fn note_applied(&self, end: usize, commit: bool, size_after: u32) {
        self.shared
            .registry
            .lock()
            .file_mut(self.slot)
            .note_applied(end, commit, size_after)
    }

    pub fn wal_header(&self) -> Option<[u8; WAL_HDRSIZE]> {
        self.shared
            .registry
            .lock()
            .file(self.slot)
            .wal_header()
            .copied()
    }

    /// Last recorded database size in pages, from the most recent commit
    /// frame this WAL saw.
    pub fn size_after(&self) -> u32 {
        self.shared.registry.lock().file(self.slot).size_after
    }

    pub fn salt_counter(&self) -> u32 {
        self.shared.registry.lock().file(self.slot).salt_counter
    }

    pub(crate) fn shm_map(
        &self,
        region: usize,
        size: usize,
        extend: bool,
    ) -> Result<Option<*mut u8>> {
        self.shared
            .registry
            .lock()
            .file_mut(self.slot)
            .shm_map(region, size, extend)
    }

    pub(crate) fn shm_unmap(&self) {
        self.shared.registry.lock().file_mut(self.slot).shm_unmap()
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        let mut inner = self.shared.registry.lock();
        let file = inner.file_mut(self.slot);
        debug_assert!(file.refcount > 0);
        file.refcount = file.refcount.saturating_sub(1);
    }
}
