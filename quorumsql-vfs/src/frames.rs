use bytes::Bytes;

/// One WAL frame as seen by the replication layer: a page number and the
/// page payload. Headers are not part of the batch; every node synthesizes
/// its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalFrame {
    pub page_no: u32,
    pub page: Bytes,
}

/// The output of one leader transaction step: the set of WAL frames written
/// since the last extraction.
///
/// This is the only payload replicated for write transactions. A batch is
/// installed atomically on every node: either all frames land or none do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBatch {
    pub page_size: u32,
    /// Whether this is the first batch of a new transaction.
    pub is_begin: bool,
    /// Whether the last frame carries the commit marker.
    pub is_commit: bool,
    /// Database size in pages to truncate the main file to, when the
    /// committed transaction shrank it.
    pub truncate: Option<u32>,
    pub frames: Vec<WalFrame>,
}

impl FrameBatch {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The largest page number any frame in the batch touches.
    pub fn max_page_no(&self) -> u32 {
        self.frames.iter().map(|f| f.page_no).max().unwrap_or(0)
    }
}
