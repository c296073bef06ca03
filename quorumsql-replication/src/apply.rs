//! Deterministic application of committed frame batches.
//!
//! Every node, the leader included, runs one [`Applier`] per database. The
//! applier is the sole writer of a follower's volatile state: it installs
//! batches in commit order, recognises batches the WAL already holds (the
//! leader's own entries, and replays from the consensus log), and flushes
//! the WAL into the main file through SQLite's checkpoint once enough
//! committed frames have piled up.
//!
//! Nothing here consults the clock or a random source: given the same
//! entries, every node's page store is byte-for-byte identical.

use quorumsql_vfs::wal::{
    WalFrameHeader, WalHeader, FRAME_HDRSIZE, WAL_HDRSIZE, WAL_MAGIC, WAL_VERSION,
};
use quorumsql_vfs::{FileHandle, OpenFlags, Vfs};
use rusqlite::Connection;
use zerocopy::{AsBytes, FromBytes};

use crate::error::Error;
use crate::frame::FramesEntry;
use crate::Result;

pub struct Applier {
    vfs: Vfs,
    db_name: String,
    main: FileHandle,
    wal: FileHandle,
    /// Committed WAL frames beyond which a checkpoint is triggered.
    checkpoint_threshold: u32,
}

impl Applier {
    pub fn new(vfs: Vfs, db_name: &str, checkpoint_threshold: u32) -> Result<Self> {
        let main = vfs.open(db_name, OpenFlags::CREATE | OpenFlags::MAIN_DB)?;
        let wal = vfs.open(
            &format!("{db_name}-wal"),
            OpenFlags::CREATE | OpenFlags::WAL,
        )?;
        Ok(Self {
            vfs,
            db_name: db_name.to_owned(),
            main,
            wal,
            checkpoint_threshold,
        })
    }

    /// Applies one committed frames entry.
    ///
    /// Atomic per batch: the frames land entirely or not at all. Re-applying
    /// the most recent entry is a no-op, detected by comparing the entry's
    /// start frame against the WAL's current frame count.
    pub fn apply(&mut self, entry: &FramesEntry) -> Result<()> {
        let batch = &entry.batch;
        if batch.is_empty() {
            return Err(Error::EmptyBatch);
        }

        // A fresh database adopts the batch's page size; a known one must
        // match it.
        self.main.set_page_size(batch.page_size)?;
        self.wal.set_page_size(batch.page_size)?;

        let committed = self.wal.committed_frames() as u32;
        let mut wal_len = self.wal.pages_len() as u32;

        // An uncommitted tail can only be this transaction's own frames,
        // pre-installed by SQLite on the leader. Anything else is the
        // residue of a leader that lost leadership (or rolled back)
        // mid-transaction and is discarded before the new transaction
        // begins. Payloads are compared, not just page numbers: a retried
        // transaction can touch the same pages with different bytes.
        if batch.is_begin && wal_len > committed {
            let tail_matches = entry.start_frame == committed
                && self
                    .wal
                    .wal_tail_matches(committed as usize, &batch.frames);
            if !tail_matches {
                tracing::warn!(
                    db = %self.db_name,
                    wal_len,
                    committed,
                    "discarding dangling uncommitted WAL tail"
                );
                self.vfs.rollback(&self.db_name)?;
                wal_len = committed;
            }
        }

        let end = entry.start_frame + batch.len() as u32;
        if end <= wal_len {
            tracing::debug!(
                db = %self.db_name,
                req_id = ?entry.req_id,
                start = entry.start_frame,
                "frame batch already present"
            );
        } else if entry.start_frame == wal_len {
            self.install(entry)?;
        } else {
            return Err(Error::FrameGap {
                expected: wal_len,
                got: entry.start_frame,
            });
        }

        if let Some(target) = batch.truncate {
            if self.main.pages_len() as u32 > target {
                self.main
                    .truncate(target as u64 * batch.page_size as u64)?;
            }
        }

        let size_after = self.size_after(entry);
        self.wal
            .note_applied(end as usize, batch.is_commit, size_after);

        // Checkpoint once enough committed frames have accumulated, but
        // only when the WAL holds nothing beyond them: truncating frames
        // the replication layer has not finished with would lose them.
        let committed = self.wal.committed_frames();
        if batch.is_commit
            && committed as u32 >= self.checkpoint_threshold
            && self.wal.pages_len() == committed
        {
            self.checkpoint()?;
        }
        Ok(())
    }

    /// Database size in pages after this entry: the truncation target when
    /// the transaction shrank the file, otherwise whatever the batch grew
    /// it to. Derived the same way on every node.
    fn size_after(&self, entry: &FramesEntry) -> u32 {
        if let Some(target) = entry.batch.truncate {
            return target;
        }
        (self.main.pages_len() as u32)
            .max(self.wal.size_after())
            .max(entry.batch.max_page_no())
    }

    /// Installs the batch's frames at the end of the WAL, synthesizing
    /// frame headers with a valid running checksum so that SQLite's
    /// recovery and checkpoint accept the log.
    fn install(&mut self, entry: &FramesEntry) -> Result<()> {
        let batch = &entry.batch;
        let page_size = batch.page_size as u64;
        let frame_size = FRAME_HDRSIZE as u64 + page_size;

        let header = match self.wal.wal_header() {
            Some(bytes) => WalHeader::read_from(&bytes[..])
                .ok_or(quorumsql_vfs::Error::Protocol("malformed WAL header"))?,
            None => {
                // First frames since the WAL was (re)created: write a fresh
                // header. Salts are derived from the reset counter, never
                // from a random source, so every node writes the same WAL.
                let salt1 = self.wal.salt_counter().wrapping_add(1);
                let mut header = WalHeader {
                    magic: WAL_MAGIC.into(),
                    version: WAL_VERSION.into(),
                    page_size: batch.page_size.into(),
                    checkpoint_seq: self.wal.salt_counter().into(),
                    salt1: salt1.into(),
                    salt2: salt1.wrapping_mul(0x9e3779b1).into(),
                    checksum1: 0.into(),
                    checksum2: 0.into(),
                };
                header.seal();
                self.wal.write_at(0, header.as_bytes())?;
                header
            }
        };

        // Chain the running checksum from the previous frame, or from the
        // header for the first frame in the log.
        let mut seed = if entry.start_frame == 0 {
            header.checksum_seed()
        } else {
            let mut prev = [0u8; FRAME_HDRSIZE];
            let offset = WAL_HDRSIZE as u64 + (entry.start_frame as u64 - 1) * frame_size;
            self.wal.read_at(offset, &mut prev)?;
            let prev = WalFrameHeader::read_from(&prev[..])
                .ok_or(quorumsql_vfs::Error::Protocol("malformed frame header"))?;
            prev.checksum_seed()
        };

        let mut db_pages = (self.main.pages_len() as u32).max(self.wal.size_after());
        for (i, frame) in batch.frames.iter().enumerate() {
            db_pages = db_pages.max(frame.page_no);
            let last = i == batch.len() - 1;
            let size_after = if last && batch.is_commit {
                batch.truncate.unwrap_or(db_pages)
            } else {
                0
            };

            let mut frame_header = WalFrameHeader {
                page_no: frame.page_no.into(),
                size_after: size_after.into(),
                salt1: header.salt1,
                salt2: header.salt2,
                checksum1: 0.into(),
                checksum2: 0.into(),
            };
            frame_header.seal(seed, &frame.page);
            seed = frame_header.checksum_seed();

            let base = WAL_HDRSIZE as u64 + (entry.start_frame as u64 + i as u64) * frame_size;
            self.wal.write_at(base, frame_header.as_bytes())?;
            self.wal.write_at(base + FRAME_HDRSIZE as u64, &frame.page)?;
        }
        tracing::debug!(
            db = %self.db_name,
            req_id = ?entry.req_id,
            start = entry.start_frame,
            frames = batch.len(),
            is_commit = batch.is_commit,
            "installed frame batch"
        );
        Ok(())
    }

    /// Flushes committed WAL frames into the main file and truncates the
    /// WAL, through a throwaway SQLite connection so recovery picks up the
    /// frames this applier wrote behind SQLite's back.
    fn checkpoint(&mut self) -> Result<()> {
        let conn = Connection::open_with_flags_and_vfs(
            &self.db_name,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE | rusqlite::OpenFlags::SQLITE_OPEN_CREATE,
            self.vfs.name(),
        )?;
        conn.pragma_update(None, "synchronous", "OFF")?;
        conn.pragma_update(None, "wal_autocheckpoint", 0)?;

        let (busy, log_frames, checkpointed): (i64, i64, i64) = conn.query_row(
            "PRAGMA wal_checkpoint(TRUNCATE)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        if busy != 0 {
            tracing::warn!(db = %self.db_name, "checkpoint could not complete");
        } else {
            tracing::debug!(
                db = %self.db_name,
                log_frames,
                checkpointed,
                "checkpointed WAL"
            );
        }
        Ok(())
    }
}
