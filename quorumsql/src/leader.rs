//! The leader execution pipeline.
//!
//! A [`Leader`] is one client's connection to a database: a SQLite
//! connection in WAL mode on the volatile VFS. Submitting an [`Exec`]
//! drives `barrier → step → replicate → done`: the statement runs locally,
//! the WAL frames it produced are extracted from the VFS and submitted as
//! a frames entry, and the request completes only after the consensus
//! layer reports the entry committed and applied.
//!
//! The state machine may suspend in exactly four places: waiting for the
//! pre-step barrier, between a work callback and its resume, waiting for
//! the replication round-trip, and (in the role manager) waiting for a
//! handover RPC. Execs on one database run strictly one at a time, queued
//! FIFO behind the database's active-exec token.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use quorumsql_replication::{FramesEntry, IdState, RequestId};
use rusqlite::Connection;
use tokio::sync::Notify;

use crate::database::Database;
use crate::error::Error;
use crate::raft::{Raft, RaftError};
use crate::Result;

/// States of an exec request. Transitions are one-way, except that
/// stepping re-enters itself while SQLite produces row chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecState {
    Idle = 0,
    BarrierWait = 1,
    Stepping = 2,
    Suspended = 3,
    Replicating = 4,
    Done = 5,
    Aborted = 6,
}

impl ExecState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ExecState::BarrierWait,
            2 => ExecState::Stepping,
            3 => ExecState::Suspended,
            4 => ExecState::Replicating,
            5 => ExecState::Done,
            6 => ExecState::Aborted,
            _ => ExecState::Idle,
        }
    }
}

/// What a work callback tells the state machine to do next.
pub enum Work {
    Continue,
    /// Suspend until [`ExecHandle::resume`] is called; the result set via
    /// [`ExecHandle::set_result`] decides whether stepping proceeds.
    Suspend,
}

/// Callback invoked on the loop thread with the prepared statement, after
/// binding and before the step. Used by request-handling code for work
/// that must happen around the statement (inspecting it, binding computed
/// values) without holding up the loop.
pub type WorkFn = Box<dyn FnOnce(&mut rusqlite::Statement<'_>) -> Result<Work> + Send>;

struct ExecShared {
    state: AtomicU8,
    aborted: AtomicBool,
    abort_notify: Notify,
    resumed: AtomicBool,
    resume_notify: Notify,
    result: parking_lot::Mutex<Option<std::result::Result<(), RaftError>>>,
}

impl ExecShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(ExecState::Idle as u8),
            aborted: AtomicBool::new(false),
            abort_notify: Notify::new(),
            resumed: AtomicBool::new(false),
            resume_notify: Notify::new(),
            result: parking_lot::Mutex::new(None),
        })
    }

    fn set_state(&self, state: ExecState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn state(&self) -> ExecState {
        ExecState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    async fn wait_aborted(&self) {
        loop {
            if self.is_aborted() {
                return;
            }
            let notified = self.abort_notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }

    async fn wait_resumed(&self) {
        loop {
            if self.resumed.swap(false, Ordering::SeqCst) {
                return;
            }
            let notified = self.resume_notify.notified();
            if self.resumed.swap(false, Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// An asynchronous request to execute one statement.
pub struct Exec {
    sql: String,
    params: Vec<rusqlite::types::Value>,
    work: Option<WorkFn>,
    shared: Arc<ExecShared>,
}

impl Exec {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            work: None,
            shared: ExecShared::new(),
        }
    }

    pub fn with_params(mut self, params: Vec<rusqlite::types::Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_work(mut self, work: WorkFn) -> Self {
        self.work = Some(work);
        self
    }

    /// A handle for aborting, resuming and observing this request from
    /// outside the state machine.
    pub fn handle(&self) -> ExecHandle {
        ExecHandle {
            shared: self.shared.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ExecHandle {
    shared: Arc<ExecShared>,
}

impl ExecHandle {
    /// Requests cancellation. Best effort: it succeeds while the request
    /// is queued, waiting on the barrier or not yet stepping; once the
    /// entry may have reached the consensus log, the request runs to
    /// completion and the abort is recorded but not acted on.
    pub fn abort(&self) {
        self.shared.aborted.store(true, Ordering::SeqCst);
        self.shared.abort_notify.notify_waiters();
    }

    /// Sets the result of the work the state machine suspended on. Call
    /// before [`ExecHandle::resume`]; the value is in Raft space.
    pub fn set_result(&self, result: std::result::Result<(), RaftError>) {
        *self.shared.result.lock() = Some(result);
    }

    /// Ends a [`Work::Suspend`] suspension.
    pub fn resume(&self) {
        self.shared.resumed.store(true, Ordering::SeqCst);
        self.shared.resume_notify.notify_waiters();
    }

    pub fn state(&self) -> ExecState {
        self.shared.state()
    }
}

/// Outcome of a completed exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecResult {
    pub changes: usize,
    pub last_insert_rowid: i64,
}

/// A per-client leader connection to a database.
pub struct Leader<R> {
    db: Arc<Database>,
    raft: Arc<R>,
    conn: Option<Connection>,
    ids: IdState,
}

impl<R: Raft> Leader<R> {
    /// Opens a leader connection: a SQLite connection on the volatile VFS,
    /// in WAL mode, with the replication-friendly pragma preamble applied.
    pub fn new(db: Arc<Database>, raft: Arc<R>) -> Result<Self> {
        db.config().validate()?;
        let conn = open_leader_conn(&db)?;
        let serial = db.leader_opened();

        // Distinct leaders draw request ids from disjoint streams: same
        // seed, one extra jump per connection.
        let mut ids = IdState::seed(db.config().node_id);
        for _ in 0..=serial {
            ids.jump();
        }
        Ok(Self {
            db,
            raft,
            conn: Some(conn),
            ids,
        })
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Executes one statement, replicating any write it performs.
    ///
    /// Completes with the translated client-facing error space; the
    /// SQLite-level error code is retrievable from the connection, which
    /// never races because one exec runs per connection at a time.
    pub async fn exec(&mut self, mut req: Exec) -> Result<ExecResult> {
        let shared = req.shared.clone();
        shared.set_state(ExecState::BarrierWait);

        let outcome = self.run(&mut req, &shared).await;
        match &outcome {
            Err(Error::Aborted) => shared.set_state(ExecState::Aborted),
            _ => shared.set_state(ExecState::Done),
        }
        outcome
    }

    async fn run(&mut self, req: &mut Exec, shared: &Arc<ExecShared>) -> Result<ExecResult> {
        if self.db.is_closing() {
            return Err(Error::Aborted);
        }

        // Queue for the database's active-exec token, bounded by the
        // heartbeat timeout. Abort is honoured while waiting; the timer is
        // dropped (cancelled) the moment the token is acquired.
        let db = self.db.clone();
        let timeout = db.config().heartbeat_timeout;
        let _guard = tokio::select! {
            biased;
            () = shared.wait_aborted() => return Err(Error::Aborted),
            acquired = tokio::time::timeout(timeout, db.acquire_exec()) => {
                acquired.map_err(|_| Error::Busy)?
            }
        };
        if self.db.is_closing() {
            return Err(Error::Aborted);
        }

        // Barrier: observe every previously committed entry before the
        // step, so read-your-writes holds across leadership changes.
        let barrier = tokio::select! {
            biased;
            () = shared.wait_aborted() => return Err(Error::Aborted),
            barrier = self.raft.barrier() => barrier,
        };
        barrier.map_err(Error::from_raft)?;

        // Last point at which an abort can win.
        if shared.is_aborted() {
            return Err(Error::Aborted);
        }
        shared.set_state(ExecState::Stepping);

        let stepped = match self.step(req, shared).await {
            Ok(result) => result,
            Err(err) => {
                // SQLite already undid the statement; frames a cache spill
                // pushed into the WAL are dead and must not reach
                // replication.
                self.discard_dead_frames()?;
                return Err(err);
            }
        };

        self.replicate(shared).await?;
        Ok(stepped)
    }

    async fn step(&mut self, req: &mut Exec, shared: &Arc<ExecShared>) -> Result<ExecResult> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare_cached(&req.sql)?;
        for (i, value) in req.params.iter().enumerate() {
            stmt.raw_bind_parameter(i + 1, value)?;
        }

        if let Some(work) = req.work.take() {
            match work(&mut stmt)? {
                Work::Continue => {}
                Work::Suspend => {
                    shared.set_state(ExecState::Suspended);
                    shared.wait_resumed().await;
                    if let Some(result) = shared.result.lock().take() {
                        result.map_err(Error::from_raft)?;
                    }
                    shared.set_state(ExecState::Stepping);
                }
            }
        }

        if stmt.column_count() == 0 {
            let changes = stmt.raw_execute()?;
            Ok(ExecResult {
                changes,
                last_insert_rowid: conn.last_insert_rowid(),
            })
        } else {
            // Row-producing statements run to completion; shipping rows to
            // the client belongs to the request-handling layer above.
            let mut rows = stmt.raw_query();
            while rows.next()?.is_some() {}
            Ok(ExecResult {
                changes: 0,
                last_insert_rowid: 0,
            })
        }
    }

    async fn replicate(&mut self, shared: &Arc<ExecShared>) -> Result<()> {
        let name = self.db.name().to_owned();
        let Some((start_frame, batch)) = self.db.vfs().poll(&name)? else {
            // No new frames. If a ROLLBACK ended the transaction, dead
            // frames from an earlier cache spill may still sit past the
            // committed watermark; drop them so the next batch starts
            // clean.
            let autocommit = self.conn.as_ref().map_or(true, |c| c.is_autocommit());
            if autocommit && self.db.vfs().has_uncommitted_tail(&name) {
                self.db.vfs().rollback(&name)?;
            }
            return Ok(());
        };

        shared.set_state(ExecState::Replicating);
        let entry = FramesEntry {
            req_id: RequestId::generate(&mut self.ids),
            start_frame,
            batch,
        };
        tracing::debug!(
            db = %name,
            req_id = ?entry.req_id,
            start = entry.start_frame,
            frames = entry.batch.len(),
            is_commit = entry.batch.is_commit,
            "submitting frames entry"
        );

        match self.raft.apply(entry).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(db = %name, error = %err, "replication failed, rolling back");
                self.db.vfs().rollback(&name)?;
                // The connection's cache still holds the transaction
                // SQLite believes committed; retire it and reopen lazily.
                self.conn = None;
                Err(Error::from_raft(err))
            }
        }
    }

    fn discard_dead_frames(&mut self) -> Result<()> {
        let name = self.db.name().to_owned();
        if let Some((_, batch)) = self.db.vfs().poll(&name)? {
            tracing::debug!(
                db = %name,
                frames = batch.len(),
                "discarding frames from a failed step"
            );
        }
        self.db.vfs().rollback(&name)?;
        Ok(())
    }

    fn connection(&mut self) -> Result<&Connection> {
        if self.conn.is_none() {
            self.conn = Some(open_leader_conn(&self.db)?);
        }
        Ok(self
            .conn
            .as_ref()
            .expect("leader connection was just opened"))
    }

    /// Closes the leader. In-flight work was already serialized by the
    /// exec token; the connection and its VFS handles are released here.
    pub fn close(self) {}
}

impl<R> Drop for Leader<R> {
    fn drop(&mut self) {
        self.conn = None;
        self.db.leader_closed();
    }
}

fn open_leader_conn(db: &Arc<Database>) -> Result<Connection> {
    let conn = Connection::open_with_flags_and_vfs(
        db.name(),
        rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE | rusqlite::OpenFlags::SQLITE_OPEN_CREATE,
        db.vfs().name(),
    )?;
    conn.pragma_update(None, "page_size", db.config().page_size)?;
    conn.pragma_update(None, "synchronous", "OFF")?;
    // Checkpoints are driven from the apply path, never by SQLite itself.
    conn.pragma_update(None, "wal_autocheckpoint", 0)?;
    let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    if mode != "wal" {
        return Err(Error::Internal(format!(
            "could not switch to WAL mode, got {mode}"
        )));
    }
    conn.pragma_update(None, "foreign_keys", true)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_handle_reports_state_and_abort() {
        let req = Exec::new("SELECT 1");
        let handle = req.handle();
        assert_eq!(handle.state(), ExecState::Idle);
        assert!(!req.shared.is_aborted());

        handle.abort();
        assert!(req.shared.is_aborted());
    }

    #[tokio::test]
    async fn resume_is_not_lost_when_signalled_early() {
        let req = Exec::new("SELECT 1");
        let handle = req.handle();
        handle.set_result(Ok(()));
        handle.resume();
        // The permit was stored; a later wait returns immediately.
        req.shared.wait_resumed().await;
        assert!(matches!(*req.shared.result.lock(), Some(Ok(()))));
    }
}
