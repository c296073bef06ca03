use crate::raft::RaftError;

/// The engine's client-facing error taxonomy.
///
/// Replication errors stay in Raft space ([`RaftError`]) until the
/// outermost exec boundary, where [`Error::from_raft`] translates them;
/// VFS and SQLite errors propagate in their native space.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("this node is not the leader")]
    NotLeader,
    #[error("leadership was lost while the request was in flight")]
    LeadershipLost,
    #[error("the database is busy")]
    Busy,
    #[error("the request was aborted")]
    Aborted,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("leadership handover failed: {0}")]
    Handover(String),
    #[error("raft error: {0}")]
    Raft(String),
    #[error(transparent)]
    Vfs(#[from] quorumsql_vfs::Error),
    #[error(transparent)]
    Replication(#[from] quorumsql_replication::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    // Dedicated for the few genuinely internal failures. Prefer adding a
    // variant over reaching for this one.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Translation from Raft space, applied only at the outermost
    /// client-facing boundary.
    pub(crate) fn from_raft(err: RaftError) -> Self {
        match err {
            RaftError::NotLeader => Error::NotLeader,
            RaftError::LeadershipLost => Error::LeadershipLost,
            RaftError::CantChange => Error::Busy,
            RaftError::Other(msg) => Error::Raft(msg),
        }
    }
}
