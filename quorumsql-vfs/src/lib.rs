//! A SQLite VFS that keeps every byte in process memory.
//!
//! The main database file, the write-ahead log and the shared-memory regions
//! all live in a process-wide [`registry::Vfs`], so that raw pages and WAL
//! frames can be observed by the replication layer before they ever reach a
//! physical disk. Durability is explicitly not this crate's concern: state
//! survives close but not process exit.

pub mod error;
pub mod file;
pub mod frames;
pub mod registry;
pub mod wal;

mod ffi;
mod page;

pub use error::Error;
pub use file::FileKind;
pub use frames::{FrameBatch, WalFrame};
pub use registry::{FileHandle, OpenFlags, Vfs};

pub type Result<T> = std::result::Result<T, Error>;

/// Maximum number of files a single registry can hold.
pub const MAX_FILES: usize = 64;

/// Size of the SQLite database file header.
pub const DB_HDRSIZE: usize = 100;
