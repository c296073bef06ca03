//! Registration of the volatile VFS with SQLite.
//!
//! This module owns every `unsafe extern "C"` shim in the crate. Each shim
//! recovers the registry from `pAppData` (or the file handle from the
//! `repr(C)` wrapper SQLite hands back), performs the operation through the
//! safe registry API, and maps the typed error onto a SQLite result code.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::mem::{ManuallyDrop, MaybeUninit};
use std::ptr::null_mut;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use libsqlite3_sys as sqlite;
use rand::RngCore;

use crate::error::Error;
use crate::registry::{FileHandle, OpenFlags, Vfs, VfsShared};
use crate::Result;

/// Maximum pathname length reported to SQLite.
const MAX_PATHNAME: c_int = 512;

/// Milliseconds between the julian-day epoch and the unix epoch.
const JULIAN_UNIX_EPOCH_MS: i64 = 24405875 * 8640000;

static ANON_SERIAL: AtomicU64 = AtomicU64::new(1);

/// The `sqlite3_file` subclass handed to SQLite. `base` must come first so
/// the pointer can be cast both ways.
#[repr(C)]
struct FileWrapper {
    base: sqlite::sqlite3_file,
    handle: MaybeUninit<FileHandle>,
}

static IO_METHODS: sqlite::sqlite3_io_methods = sqlite::sqlite3_io_methods {
    iVersion: 2,
    xClose: Some(x_close),
    xRead: Some(x_read),
    xWrite: Some(x_write),
    xTruncate: Some(x_truncate),
    xSync: Some(x_sync),
    xFileSize: Some(x_file_size),
    xLock: Some(x_lock),
    xUnlock: Some(x_unlock),
    xCheckReservedLock: Some(x_check_reserved_lock),
    xFileControl: Some(x_file_control),
    xSectorSize: Some(x_sector_size),
    xDeviceCharacteristics: Some(x_device_characteristics),
    xShmMap: Some(x_shm_map),
    xShmLock: Some(x_shm_lock),
    xShmBarrier: Some(x_shm_barrier),
    xShmUnmap: Some(x_shm_unmap),
    xFetch: None,
    xUnfetch: None,
};

impl Vfs {
    /// Registers this instance with SQLite under [`Vfs::name`].
    ///
    /// The registration keeps a strong reference to the registry; content
    /// lives until [`Vfs::unregister`] and the last handle are gone.
    pub fn register(&self) -> Result<()> {
        let name_ptr = self.shared.name.as_ptr();
        if !unsafe { sqlite::sqlite3_vfs_find(name_ptr) }.is_null() {
            return Err(Error::Exists);
        }

        let app_data = Arc::into_raw(self.shared.clone());
        let vfs = Box::into_raw(Box::new(sqlite::sqlite3_vfs {
            iVersion: 2,
            szOsFile: std::mem::size_of::<FileWrapper>() as c_int,
            mxPathname: MAX_PATHNAME,
            pNext: null_mut(),
            zName: name_ptr,
            pAppData: app_data as *mut c_void,
            xOpen: Some(x_open),
            xDelete: Some(x_delete),
            xAccess: Some(x_access),
            xFullPathname: Some(x_full_pathname),
            xDlOpen: Some(x_dl_open),
            xDlError: Some(x_dl_error),
            xDlSym: Some(x_dl_sym),
            xDlClose: Some(x_dl_close),
            xRandomness: Some(x_randomness),
            xSleep: Some(x_sleep),
            xCurrentTime: Some(x_current_time),
            xGetLastError: Some(x_get_last_error),
            xCurrentTimeInt64: Some(x_current_time_int64),
            xSetSystemCall: None,
            xGetSystemCall: None,
            xNextSystemCall: None,
        }));

        let rc = unsafe { sqlite::sqlite3_vfs_register(vfs, 0) };
        if rc != sqlite::SQLITE_OK {
            unsafe {
                drop(Box::from_raw(vfs));
                drop(Arc::from_raw(app_data));
            }
            return Err(Error::Protocol("sqlite3_vfs_register failed"));
        }
        tracing::debug!(name = self.name(), "registered volatile VFS");
        Ok(())
    }

    /// Unregisters this instance.
    ///
    /// Every connection opened through the VFS must be closed first; SQLite
    /// keeps no reference after unregistration.
    pub fn unregister(&self) -> Result<()> {
        let vfs = unsafe { sqlite::sqlite3_vfs_find(self.shared.name.as_ptr()) };
        if vfs.is_null() {
            return Err(Error::NoEntry);
        }
        unsafe {
            sqlite::sqlite3_vfs_unregister(vfs);
            let vfs = Box::from_raw(vfs);
            drop(Arc::from_raw(vfs.pAppData as *const VfsShared));
        }
        Ok(())
    }
}

/// Borrows the registry out of a `sqlite3_vfs`. The reference owned by the
/// registration itself is left untouched.
unsafe fn vfs_from(p_vfs: *mut sqlite::sqlite3_vfs) -> Vfs {
    let shared = ManuallyDrop::new(Arc::from_raw((*p_vfs).pAppData as *const VfsShared));
    Vfs {
        shared: Arc::clone(&shared),
    }
}

unsafe fn handle_of<'a>(p_file: *mut sqlite::sqlite3_file) -> &'a FileHandle {
    let wrapper = &*(p_file as *const FileWrapper);
    wrapper.handle.assume_init_ref()
}

fn rc_of(result: Result<()>) -> c_int {
    match result {
        Ok(()) => sqlite::SQLITE_OK,
        Err(err) => err.sqlite_code(),
    }
}

unsafe extern "C" fn x_open(
    p_vfs: *mut sqlite::sqlite3_vfs,
    z_name: *const c_char,
    p_file: *mut sqlite::sqlite3_file,
    flags: c_int,
    p_out_flags: *mut c_int,
) -> c_int {
    let wrapper = &mut *(p_file as *mut FileWrapper);
    // Signals SQLite not to call xClose if the open fails.
    wrapper.base.pMethods = std::ptr::null();

    let vfs = vfs_from(p_vfs);
    let mut open_flags = OpenFlags::empty();
    if flags & sqlite::SQLITE_OPEN_CREATE != 0 {
        open_flags |= OpenFlags::CREATE;
    }
    if flags & sqlite::SQLITE_OPEN_EXCLUSIVE != 0 {
        open_flags |= OpenFlags::EXCLUSIVE;
    }
    if flags & sqlite::SQLITE_OPEN_MAIN_DB != 0 {
        open_flags |= OpenFlags::MAIN_DB;
    }
    if flags & sqlite::SQLITE_OPEN_WAL != 0 {
        open_flags |= OpenFlags::WAL;
    }

    // SQLite passes no name for transient files; give them a unique slot of
    // their own. Their content kind swallows all writes anyway.
    let filename = if z_name.is_null() {
        let serial = ANON_SERIAL.fetch_add(1, Ordering::Relaxed);
        open_flags |= OpenFlags::CREATE;
        format!("anon-{serial}")
    } else {
        match CStr::from_ptr(z_name).to_str() {
            Ok(name) => name.to_owned(),
            Err(_) => return sqlite::SQLITE_CANTOPEN,
        }
    };

    match vfs.open(&filename, open_flags) {
        Ok(handle) => {
            wrapper.base.pMethods = &IO_METHODS;
            wrapper.handle.write(handle);
            if !p_out_flags.is_null() {
                *p_out_flags = flags;
            }
            sqlite::SQLITE_OK
        }
        Err(err) => err.sqlite_code(),
    }
}

unsafe extern "C" fn x_delete(
    p_vfs: *mut sqlite::sqlite3_vfs,
    z_name: *const c_char,
    _sync_dir: c_int,
) -> c_int {
    let vfs = vfs_from(p_vfs);
    let Ok(name) = CStr::from_ptr(z_name).to_str() else {
        return sqlite::SQLITE_IOERR_DELETE;
    };
    match vfs.delete(name) {
        Ok(()) => sqlite::SQLITE_OK,
        Err(Error::NoEntry) => sqlite::SQLITE_IOERR_DELETE_NOENT,
        Err(err) => err.sqlite_code(),
    }
}

unsafe extern "C" fn x_access(
    p_vfs: *mut sqlite::sqlite3_vfs,
    z_name: *const c_char,
    _flags: c_int,
    p_res_out: *mut c_int,
) -> c_int {
    let vfs = vfs_from(p_vfs);
    let Ok(name) = CStr::from_ptr(z_name).to_str() else {
        return sqlite::SQLITE_IOERR_ACCESS;
    };
    *p_res_out = vfs.exists(name) as c_int;
    sqlite::SQLITE_OK
}

unsafe extern "C" fn x_full_pathname(
    _p_vfs: *mut sqlite::sqlite3_vfs,
    z_name: *const c_char,
    n_out: c_int,
    z_out: *mut c_char,
) -> c_int {
    // Paths are registry keys; return them unchanged.
    let name = CStr::from_ptr(z_name).to_bytes_with_nul();
    if name.len() > n_out as usize {
        return sqlite::SQLITE_CANTOPEN;
    }
    std::ptr::copy_nonoverlapping(name.as_ptr() as *const c_char, z_out, name.len());
    sqlite::SQLITE_OK
}

unsafe extern "C" fn x_close(p_file: *mut sqlite::sqlite3_file) -> c_int {
    let wrapper = &mut *(p_file as *mut FileWrapper);
    let handle = std::mem::replace(&mut wrapper.handle, MaybeUninit::uninit());
    drop(handle.assume_init());
    sqlite::SQLITE_OK
}

unsafe extern "C" fn x_read(
    p_file: *mut sqlite::sqlite3_file,
    buf: *mut c_void,
    amount: c_int,
    offset: sqlite::sqlite3_int64,
) -> c_int {
    let handle = handle_of(p_file);
    let buf = std::slice::from_raw_parts_mut(buf as *mut u8, amount as usize);
    rc_of(handle.read_at(offset as u64, buf))
}

unsafe extern "C" fn x_write(
    p_file: *mut sqlite::sqlite3_file,
    buf: *const c_void,
    amount: c_int,
    offset: sqlite::sqlite3_int64,
) -> c_int {
    let handle = handle_of(p_file);
    let buf = std::slice::from_raw_parts(buf as *const u8, amount as usize);
    rc_of(handle.write_at(offset as u64, buf))
}

unsafe extern "C" fn x_truncate(
    p_file: *mut sqlite::sqlite3_file,
    size: sqlite::sqlite3_int64,
) -> c_int {
    let handle = handle_of(p_file);
    rc_of(handle.truncate(size as u64))
}

unsafe extern "C" fn x_sync(_p_file: *mut sqlite::sqlite3_file, _flags: c_int) -> c_int {
    // Volatile storage has nothing to sync.
    sqlite::SQLITE_OK
}

unsafe extern "C" fn x_file_size(
    p_file: *mut sqlite::sqlite3_file,
    p_size: *mut sqlite::sqlite3_int64,
) -> c_int {
    let handle = handle_of(p_file);
    *p_size = handle.size() as sqlite::sqlite3_int64;
    sqlite::SQLITE_OK
}

// File locking is a no-op: the registry mutex serializes every operation
// and no other process has visibility on the files.

unsafe extern "C" fn x_lock(_p_file: *mut sqlite::sqlite3_file, _lock: c_int) -> c_int {
    sqlite::SQLITE_OK
}

unsafe extern "C" fn x_unlock(_p_file: *mut sqlite::sqlite3_file, _lock: c_int) -> c_int {
    sqlite::SQLITE_OK
}

unsafe extern "C" fn x_check_reserved_lock(
    _p_file: *mut sqlite::sqlite3_file,
    p_res_out: *mut c_int,
) -> c_int {
    *p_res_out = 1;
    sqlite::SQLITE_OK
}

unsafe extern "C" fn x_file_control(
    p_file: *mut sqlite::sqlite3_file,
    op: c_int,
    p_arg: *mut c_void,
) -> c_int {
    if op != sqlite::SQLITE_FCNTL_PRAGMA {
        // Everything else passes through to SQLite's defaults.
        return sqlite::SQLITE_NOTFOUND;
    }
    let handle = handle_of(p_file);
    // The argument is an array of strings: slot 1 is the pragma name, slot
    // 2 its value (or NULL), and slot 0 receives an error message.
    let args = p_arg as *mut *mut c_char;
    let Ok(name) = CStr::from_ptr(*args.add(1)).to_str() else {
        return sqlite::SQLITE_NOTFOUND;
    };
    let value = (*args.add(2))
        .as_ref()
        .map(|p| unsafe { CStr::from_ptr(p) }.to_string_lossy());

    if name.eq_ignore_ascii_case("page_size") {
        if let Some(value) = value {
            // Invalid sizes are ignored, as SQLite itself ignores them. A
            // valid size conflicting with a pinned one is refused: the page
            // size cannot change once set.
            if let Ok(page_size) = value.parse::<u32>() {
                match handle.set_page_size(page_size) {
                    Ok(()) | Err(Error::InvalidPageSize(_)) => {}
                    Err(_) => {
                        *args = error_message(b"changing page size is not supported\0");
                        return sqlite::SQLITE_ERROR;
                    }
                }
            }
        }
    } else if name.eq_ignore_ascii_case("journal_mode") {
        if let Some(value) = value {
            if !value.eq_ignore_ascii_case("wal") {
                *args = error_message(b"only WAL mode is supported\0");
                return sqlite::SQLITE_ERROR;
            }
        }
    }
    // Let SQLite process the pragma normally.
    sqlite::SQLITE_NOTFOUND
}

/// Allocates a NUL-terminated error message with SQLite's allocator, as the
/// pragma file-control convention requires (SQLite frees it).
unsafe fn error_message(msg: &'static [u8]) -> *mut c_char {
    debug_assert_eq!(msg.last(), Some(&0));
    sqlite::sqlite3_mprintf(
        b"%s\0".as_ptr() as *const c_char,
        msg.as_ptr() as *const c_char,
    )
}

unsafe extern "C" fn x_sector_size(_p_file: *mut sqlite::sqlite3_file) -> c_int {
    0
}

unsafe extern "C" fn x_device_characteristics(_p_file: *mut sqlite::sqlite3_file) -> c_int {
    0
}

unsafe extern "C" fn x_shm_map(
    p_file: *mut sqlite::sqlite3_file,
    region: c_int,
    size: c_int,
    extend: c_int,
    pp: *mut *mut c_void,
) -> c_int {
    let handle = handle_of(p_file);
    match handle.shm_map(region as usize, size as usize, extend != 0) {
        Ok(Some(ptr)) => {
            *pp = ptr as *mut c_void;
            sqlite::SQLITE_OK
        }
        Ok(None) => {
            *pp = null_mut();
            sqlite::SQLITE_OK
        }
        Err(err) => err.sqlite_code(),
    }
}

unsafe extern "C" fn x_shm_lock(
    _p_file: *mut sqlite::sqlite3_file,
    _offset: c_int,
    _n: c_int,
    _flags: c_int,
) -> c_int {
    // Shared-memory locking only matters for inter-process concurrency;
    // these regions are per-process by design.
    sqlite::SQLITE_OK
}

unsafe extern "C" fn x_shm_barrier(_p_file: *mut sqlite::sqlite3_file) {}

unsafe extern "C" fn x_shm_unmap(p_file: *mut sqlite::sqlite3_file, _delete: c_int) -> c_int {
    let handle = handle_of(p_file);
    handle.shm_unmap();
    sqlite::SQLITE_OK
}

unsafe extern "C" fn x_dl_open(
    _p_vfs: *mut sqlite::sqlite3_vfs,
    _z_path: *const c_char,
) -> *mut c_void {
    null_mut()
}

unsafe extern "C" fn x_dl_error(
    _p_vfs: *mut sqlite::sqlite3_vfs,
    n_byte: c_int,
    z_err_msg: *mut c_char,
) {
    let msg = b"Loadable extensions are not supported\0";
    let len = msg.len().min(n_byte as usize);
    if len > 0 {
        std::ptr::copy_nonoverlapping(msg.as_ptr() as *const c_char, z_err_msg, len);
        *z_err_msg.add(len - 1) = 0;
    }
}

unsafe extern "C" fn x_dl_sym(
    _p_vfs: *mut sqlite::sqlite3_vfs,
    _p_handle: *mut c_void,
    _z_symbol: *const c_char,
) -> Option<unsafe extern "C" fn(*mut sqlite::sqlite3_vfs, *mut c_void, *const c_char)> {
    None
}

unsafe extern "C" fn x_dl_close(_p_vfs: *mut sqlite::sqlite3_vfs, _p_handle: *mut c_void) {}

unsafe extern "C" fn x_randomness(
    _p_vfs: *mut sqlite::sqlite3_vfs,
    n_byte: c_int,
    z_out: *mut c_char,
) -> c_int {
    let buf = std::slice::from_raw_parts_mut(z_out as *mut u8, n_byte as usize);
    rand::thread_rng().fill_bytes(buf);
    n_byte
}

unsafe extern "C" fn x_sleep(_p_vfs: *mut sqlite::sqlite3_vfs, microseconds: c_int) -> c_int {
    std::thread::sleep(Duration::from_micros(microseconds as u64));
    microseconds
}

fn now_julian_ms() -> i64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    JULIAN_UNIX_EPOCH_MS + since_epoch.as_millis() as i64
}

unsafe extern "C" fn x_current_time(_p_vfs: *mut sqlite::sqlite3_vfs, p_now: *mut f64) -> c_int {
    *p_now = now_julian_ms() as f64 / 86_400_000.0;
    sqlite::SQLITE_OK
}

unsafe extern "C" fn x_current_time_int64(
    _p_vfs: *mut sqlite::sqlite3_vfs,
    p_now: *mut sqlite::sqlite3_int64,
) -> c_int {
    *p_now = now_julian_ms();
    sqlite::SQLITE_OK
}

unsafe extern "C" fn x_get_last_error(
    p_vfs: *mut sqlite::sqlite3_vfs,
    _n_byte: c_int,
    _z_out: *mut c_char,
) -> c_int {
    let vfs = vfs_from(p_vfs);
    vfs.last_error()
}
