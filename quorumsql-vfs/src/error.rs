use std::ffi::c_int;

/// Errors surfaced by the volatile VFS.
///
/// Every variant maps onto a code in the SQLite error space; the FFI layer
/// returns [`Error::sqlite_code`] to SQLite while the Rust API keeps the
/// typed variant.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no such file")]
    NoEntry,
    #[error("file already exists")]
    Exists,
    #[error("too many open files")]
    TooManyFiles,
    #[error("file is busy")]
    Busy,
    #[error("short read")]
    ShortRead,
    #[error("invalid read geometry: {amount} bytes at offset {offset}")]
    ReadGeometry { offset: u64, amount: usize },
    #[error("invalid write geometry: {amount} bytes at offset {offset}")]
    WriteGeometry { offset: u64, amount: usize },
    #[error("invalid page size {0}")]
    InvalidPageSize(u32),
    #[error("page size mismatch: file uses {expected}, got {got}")]
    PageSizeMismatch { expected: u32, got: u32 },
    #[error("page size has not been set yet")]
    PageSizeUnknown,
    #[error("truncating the WAL to a non-zero size is not supported")]
    UnsupportedTruncate,
    #[error("page {0} is past the end of the file")]
    PageOutOfBounds(u32),
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
}

impl Error {
    /// The SQLite result code reported through the method table.
    pub fn sqlite_code(&self) -> c_int {
        use libsqlite3_sys as ffi;
        match self {
            Error::NoEntry => ffi::SQLITE_CANTOPEN,
            Error::Exists => ffi::SQLITE_CANTOPEN,
            Error::TooManyFiles => ffi::SQLITE_CANTOPEN,
            Error::Busy => ffi::SQLITE_IOERR_DELETE,
            Error::ShortRead => ffi::SQLITE_IOERR_SHORT_READ,
            Error::ReadGeometry { .. } => ffi::SQLITE_IOERR_READ,
            Error::WriteGeometry { .. }
            | Error::InvalidPageSize(_)
            | Error::PageSizeMismatch { .. }
            | Error::PageSizeUnknown => ffi::SQLITE_IOERR_WRITE,
            Error::UnsupportedTruncate => ffi::SQLITE_IOERR_TRUNCATE,
            Error::PageOutOfBounds(_) => ffi::SQLITE_IOERR_WRITE,
            Error::Protocol(_) => ffi::SQLITE_IOERR,
        }
    }

    /// The errno-like value recorded on the registry for `xGetLastError`.
    pub(crate) fn errno(&self) -> c_int {
        match self {
            Error::NoEntry => libc_errno::ENOENT,
            Error::Exists => libc_errno::EEXIST,
            Error::TooManyFiles => libc_errno::ENFILE,
            Error::Busy => libc_errno::EBUSY,
            _ => 0,
        }
    }
}

// The errno values the registry reports through xGetLastError.
mod libc_errno {
    use std::ffi::c_int;

    pub const ENOENT: c_int = 2;
    pub const EEXIST: c_int = 17;
    pub const EBUSY: c_int = 16;
    pub const ENFILE: c_int = 23;
}
