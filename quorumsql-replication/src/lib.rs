//! The replication data plane.
//!
//! A leader transaction becomes a [`FramesEntry`]: a request id, the WAL
//! frame index the batch starts at, and the frame batch itself, encoded as
//! a byte-exact command payload for the consensus log. Committed entries
//! are installed into each node's volatile VFS by the [`Applier`],
//! deterministically and idempotently.

pub mod apply;
pub mod error;
pub mod frame;
pub mod id;

pub use apply::Applier;
pub use error::Error;
pub use frame::{FramesEntry, FRAMES_COMMAND};
pub use id::{IdState, RequestId};

pub type Result<T> = std::result::Result<T, Error>;
