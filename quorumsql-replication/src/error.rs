#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown command tag {0:#04x}")]
    InvalidCommandTag(u8),
    #[error("truncated frames command payload")]
    UnexpectedEof,
    #[error("invalid page size {0} in frames command")]
    InvalidPageSize(u32),
    #[error("frames command declares {declared} frames but carries {got}")]
    FrameCountMismatch { declared: u32, got: usize },
    #[error("a frames command must carry at least one frame")]
    EmptyBatch,
    #[error("frame batch starts at {got} but the WAL holds {expected} frames")]
    FrameGap { expected: u32, got: u32 },
    #[error(transparent)]
    Vfs(#[from] quorumsql_vfs::Error),
    #[error("checkpoint failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
}
