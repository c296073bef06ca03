use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use quorumsql_replication::Applier;
use quorumsql_vfs::Vfs;

use crate::config::Config;
use crate::Result;

/// State of a single logical database.
///
/// Holds the configuration and VFS the database lives in, counts the open
/// leader connections, and owns the token that serializes execs: at most
/// one write request is active per database, the rest queue FIFO.
pub struct Database {
    config: Arc<Config>,
    vfs: Vfs,
    name: String,
    /// The active-exec token. `tokio::sync::Mutex` grants FIFO fairness, so
    /// queued execs start in submission order.
    exec_token: tokio::sync::Mutex<()>,
    leaders: AtomicUsize,
    leader_serial: AtomicU64,
    closing: AtomicBool,
}

impl Database {
    pub fn new(config: Arc<Config>, vfs: Vfs, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            config,
            vfs,
            name: name.into(),
            exec_token: tokio::sync::Mutex::new(()),
            leaders: AtomicUsize::new(0),
            leader_serial: AtomicU64::new(0),
            closing: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    /// Builds the apply-path driver for this database, shared by leader and
    /// follower duty on this node.
    pub fn applier(&self) -> Result<Applier> {
        Ok(Applier::new(
            self.vfs.clone(),
            &self.name,
            self.config.checkpoint_threshold,
        )?)
    }

    /// Starts refusing new execs; queued ones fail with a cancellation
    /// code once they reach the token.
    pub fn begin_close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn open_leaders(&self) -> usize {
        self.leaders.load(Ordering::SeqCst)
    }

    pub(crate) async fn acquire_exec(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.exec_token.lock().await
    }

    pub(crate) fn leader_opened(&self) -> u64 {
        self.leaders.fetch_add(1, Ordering::SeqCst);
        self.leader_serial.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn leader_closed(&self) {
        self.leaders.fetch_sub(1, Ordering::SeqCst);
    }
}
