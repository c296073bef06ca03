//! Drives a real SQLite through the registered volatile VFS.

use quorumsql_vfs::{OpenFlags, Vfs};
use rusqlite::Connection;

fn open_connection(vfs: &Vfs, name: &str) -> Connection {
    let conn = Connection::open_with_flags_and_vfs(
        name,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE | rusqlite::OpenFlags::SQLITE_OPEN_CREATE,
        vfs.name(),
    )
    .unwrap();
    conn.pragma_update(None, "page_size", 4096).unwrap();
    conn.pragma_update(None, "synchronous", "OFF").unwrap();
    conn.pragma_update(None, "wal_autocheckpoint", 0).unwrap();
    let mode: String = conn
        .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
        .unwrap();
    assert_eq!(mode, "wal");
    conn
}

#[test]
fn sqlite_runs_on_the_volatile_vfs() {
    let vfs = Vfs::new();
    vfs.register().unwrap();

    let conn = open_connection(&vfs, "test.db");
    conn.execute("CREATE TABLE t (n INTEGER)", []).unwrap();
    conn.execute("INSERT INTO t VALUES (1), (2), (3)", [])
        .unwrap();

    let sum: i64 = conn
        .query_row("SELECT SUM(n) FROM t", [], |row| row.get(0))
        .unwrap();
    assert_eq!(sum, 6);

    // Everything SQLite wrote landed in the registry, nowhere on disk.
    assert!(vfs.exists("test.db"));
    assert!(vfs.exists("test.db-wal"));
    assert!(!std::path::Path::new("test.db").exists());

    // The WAL frames of both transactions are extractable.
    let (start, batch) = vfs.poll("test.db").unwrap().unwrap();
    assert_eq!(start, 0);
    assert_eq!(batch.page_size, 4096);
    assert!(batch.is_begin);
    assert!(batch.is_commit);
    assert!(!batch.frames.is_empty());

    // Drained: a read-only statement produces no new frames.
    let _: i64 = conn
        .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
        .unwrap();
    assert!(vfs.poll("test.db").unwrap().is_none());

    drop(conn);
    vfs.unregister().unwrap();
}

#[test]
fn non_wal_journal_mode_is_refused() {
    let vfs = Vfs::new();
    vfs.register().unwrap();

    let conn = open_connection(&vfs, "test.db");
    let result = conn.query_row("PRAGMA journal_mode=DELETE", [], |row| {
        row.get::<_, String>(0)
    });
    assert!(result.is_err());

    drop(conn);
    vfs.unregister().unwrap();
}

#[test]
fn page_size_cannot_change_once_pinned() {
    let vfs = Vfs::new();
    vfs.register().unwrap();

    let conn = open_connection(&vfs, "test.db");
    conn.execute("CREATE TABLE t (n INTEGER)", []).unwrap();

    // The first write pinned 4096; asking for another size is refused by
    // the file-control hook.
    let result = conn.pragma_update(None, "page_size", 8192);
    assert!(result.is_err());

    drop(conn);
    vfs.unregister().unwrap();
}

#[test]
fn database_reopens_with_content() {
    let vfs = Vfs::new();
    vfs.register().unwrap();

    {
        let conn = open_connection(&vfs, "reopen.db");
        conn.execute("CREATE TABLE kv (k TEXT, v TEXT)", []).unwrap();
        conn.execute("INSERT INTO kv VALUES ('answer', '42')", [])
            .unwrap();
    }

    {
        let conn = open_connection(&vfs, "reopen.db");
        let v: String = conn
            .query_row("SELECT v FROM kv WHERE k = 'answer'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(v, "42");
    }

    // The registry still owns the file; open handles are gone.
    let handle = vfs.open("reopen.db", OpenFlags::MAIN_DB).unwrap();
    assert!(handle.pages_len() > 0);
    drop(handle);

    vfs.unregister().unwrap();
}
