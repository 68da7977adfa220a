/*!

A thin transactional wrapper over an embedded relational store
(`rusqlite`/SQLite), exposing exactly the operations the daemon's two
higher-level stores need: open/close, plain exec, shaped queries,
explicit transaction control, and the schema-version pragma.

 */
use std::collections::HashMap;
use std::path::Path;

use rusqlite::{Connection, OpenFlags as SqliteOpenFlags};

use crate::error::{Error, Result};

/// How to open the underlying database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFlags {
    /// Fail if the file doesn't already exist.
    ReadWrite,
    /// Create the file (with owner-only permissions) if it doesn't exist.
    ReadWriteCreate,
}

/// The shape of rows a caller expects back from [SqlStore::query].
#[derive(Debug, Clone, Copy)]
pub enum RowShape {
    /// A single integer (e.g. `SELECT COUNT(*) ...`).
    Int,
    /// A single string.
    Str,
    /// One column of strings, one row per match.
    Strings,
    /// One column of integers, one row per match.
    Ints,
    /// Two string columns, collected into a map.
    StringPairs,
    /// An integer key column and a string value column, collected into a map.
    IntStringPairs,
}

/// The rows returned from [SqlStore::query], tagged by [RowShape].
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Int(i64),
    Str(String),
    Strings(Vec<String>),
    Ints(Vec<i64>),
    StringPairs(HashMap<String, String>),
    IntStringPairs(HashMap<i64, String>),
}

/// An open (or not-yet-open) SQLite-backed store.
#[derive(Default)]
pub struct SqlStore {
    conn: Option<Connection>,
    last_error: Option<Error>,
}

impl SqlStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    fn conn(&mut self) -> Result<&Connection> {
        self.conn.as_ref().ok_or(Error::NotOpen)
    }

    fn record<T>(&mut self, result: std::result::Result<T, Error>) -> Result<T> {
        if let Err(ref e) = result {
            self.last_error = Some(match e {
                Error::NotOpen => Error::NotOpen,
                Error::ConnectionFailure(_) => Error::ConnectionFailure(Box::from(e.to_string())),
                Error::StatementFailure(_) => Error::StatementFailure(Box::from(e.to_string())),
                Error::Locked => Error::Locked,
                _ => Error::Unknown(Box::from(e.to_string())),
            });
        }
        result
    }

    /// Open (creating the schema file if requested and absent) the
    /// database at `path`. On creation, the resulting file is given
    /// owner-only (0600) permissions.
    pub fn open(&mut self, path: &Path, flags: OpenFlags) -> Result<()> {
        let existed = path.exists();
        let conn = match flags {
            OpenFlags::ReadWrite => Connection::open_with_flags(
                path,
                SqliteOpenFlags::SQLITE_OPEN_READ_WRITE
                    | SqliteOpenFlags::SQLITE_OPEN_URI
                    | SqliteOpenFlags::SQLITE_OPEN_NO_MUTEX,
            ),
            OpenFlags::ReadWriteCreate => Connection::open(path),
        }
        .map_err(|e| Error::ConnectionFailure(Box::new(e)))?;
        if flags == OpenFlags::ReadWriteCreate && !existed {
            set_owner_only_permissions(path)?;
        }
        self.conn = Some(conn);
        Ok(())
    }

    pub fn close(&mut self) {
        self.conn = None;
    }

    pub fn exec(&mut self, sql: &str) -> Result<()> {
        let conn = self.conn.as_ref().ok_or(Error::NotOpen)?;
        let result = conn.execute_batch(sql).map_err(Error::from);
        self.record(result)
    }

    pub fn query(&mut self, sql: &str, shape: RowShape) -> Result<QueryResult> {
        let conn = self.conn.as_ref().ok_or(Error::NotOpen)?;
        let result = run_query(conn, sql, shape);
        self.record(result)
    }

    /// Begin, then exec the batch of statements, then commit; on any
    /// sub-error, rolls back and returns the error.
    pub fn transaction(&mut self, sql: &str) -> Result<()> {
        self.begin()?;
        match self.exec(sql) {
            Ok(()) => self.commit(),
            Err(e) => {
                let _ = self.rollback();
                Err(e)
            }
        }
    }

    pub fn begin(&mut self) -> Result<()> {
        let conn = self.conn.as_ref().ok_or(Error::NotOpen)?;
        let result = conn
            .prepare_cached("BEGIN EXCLUSIVE TRANSACTION")
            .and_then(|mut stmt| stmt.execute([]))
            .map(|_| ())
            .map_err(Error::from);
        self.record(result)
    }

    pub fn commit(&mut self) -> Result<()> {
        let conn = self.conn.as_ref().ok_or(Error::NotOpen)?;
        let result = conn
            .prepare_cached("COMMIT")
            .and_then(|mut stmt| stmt.execute([]))
            .map(|_| ())
            .map_err(Error::from);
        self.record(result)
    }

    pub fn rollback(&mut self) -> Result<()> {
        let conn = self.conn.as_ref().ok_or(Error::NotOpen)?;
        let result = conn
            .prepare_cached("ROLLBACK")
            .and_then(|mut stmt| stmt.execute([]))
            .map(|_| ())
            .map_err(Error::from);
        self.record(result)
    }

    pub fn schema_version(&mut self) -> Result<i64> {
        match self.query("PRAGMA user_version", RowShape::Int)? {
            QueryResult::Int(v) => Ok(v),
            _ => unreachable!(),
        }
    }

    pub fn set_schema_version(&mut self, version: i64) -> Result<()> {
        self.exec(&format!("PRAGMA user_version = {version}"))
    }

    pub fn last_insert_rowid(&mut self) -> Result<i64> {
        Ok(self.conn()?.last_insert_rowid())
    }

    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// Direct access to the underlying connection, for callers (the
    /// secret and metadata stores) that need parameterized statements
    /// beyond the fixed [RowShape] set.
    pub fn conn_ref(&mut self) -> Result<&Connection> {
        self.conn.as_ref().ok_or(Error::NotOpen)
    }
}

fn run_query(conn: &Connection, sql: &str, shape: RowShape) -> Result<QueryResult> {
    let mut stmt = conn.prepare(sql)?;
    Ok(match shape {
        RowShape::Int => {
            let mut rows = stmt.query([])?;
            match rows.next()? {
                Some(row) => QueryResult::Int(row.get(0)?),
                None => QueryResult::Int(0),
            }
        }
        RowShape::Str => {
            let mut rows = stmt.query([])?;
            match rows.next()? {
                Some(row) => QueryResult::Str(row.get(0)?),
                None => QueryResult::Str(String::new()),
            }
        }
        RowShape::Strings => {
            let values = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            QueryResult::Strings(values)
        }
        RowShape::Ints => {
            let values = stmt
                .query_map([], |row| row.get::<_, i64>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            QueryResult::Ints(values)
        }
        RowShape::StringPairs => {
            let mut map = HashMap::new();
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                map.insert(row.get::<_, String>(0)?, row.get::<_, String>(1)?);
            }
            QueryResult::StringPairs(map)
        }
        RowShape::IntStringPairs => {
            let mut map = HashMap::new();
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                map.insert(row.get::<_, i64>(0)?, row.get::<_, String>(1)?);
            }
            QueryResult::IntStringPairs(map)
        }
    })
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| Error::ConnectionFailure(Box::new(e)))
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn opened_store(dir: &tempfile::TempDir, name: &str) -> SqlStore {
        let mut store = SqlStore::new();
        store
            .open(&dir.path().join(name), OpenFlags::ReadWriteCreate)
            .expect("open should succeed");
        store
    }

    #[test]
    fn test_query_before_open_is_not_open() {
        let mut store = SqlStore::new();
        assert!(matches!(
            store.query("SELECT 1", RowShape::Int),
            Err(Error::NotOpen)
        ));
    }

    #[test]
    fn test_read_write_without_create_fails_on_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.db");
        let mut store = SqlStore::new();
        assert!(matches!(store.open(&path, OpenFlags::ReadWrite), Err(Error::ConnectionFailure(_))));
        assert!(!path.exists());
    }

    #[test]
    fn test_read_write_opens_existing_file() {
        let dir = tempdir().unwrap();
        {
            let mut creator = opened_store(&dir, "existing.db");
            creator.exec("CREATE TABLE t(x INTEGER)").unwrap();
        }
        let mut store = SqlStore::new();
        store.open(&dir.path().join("existing.db"), OpenFlags::ReadWrite).unwrap();
        store.exec("INSERT INTO t(x) VALUES (1)").unwrap();
    }

    #[test]
    fn test_open_creates_file_with_owner_only_perms() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secret.db");
        let mut store = SqlStore::new();
        store.open(&path, OpenFlags::ReadWriteCreate).unwrap();
        store.exec("CREATE TABLE t(x INTEGER)").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn test_exec_and_query_int() {
        let dir = tempdir().unwrap();
        let mut store = opened_store(&dir, "t.db");
        store.exec("CREATE TABLE t(x INTEGER)").unwrap();
        store.exec("INSERT INTO t VALUES (42)").unwrap();
        let result = store.query("SELECT x FROM t", RowShape::Int).unwrap();
        assert_eq!(result, QueryResult::Int(42));
    }

    #[test]
    fn test_last_insert_rowid() {
        let dir = tempdir().unwrap();
        let mut store = opened_store(&dir, "t.db");
        store
            .exec("CREATE TABLE t(id INTEGER PRIMARY KEY AUTOINCREMENT, x INTEGER)")
            .unwrap();
        store.exec("INSERT INTO t (x) VALUES (1)").unwrap();
        assert_eq!(store.last_insert_rowid().unwrap(), 1);
        store.exec("INSERT INTO t (x) VALUES (2)").unwrap();
        assert_eq!(store.last_insert_rowid().unwrap(), 2);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let dir = tempdir().unwrap();
        let mut store = opened_store(&dir, "t.db");
        store.exec("CREATE TABLE t(x INTEGER UNIQUE)").unwrap();
        store.exec("INSERT INTO t VALUES (1)").unwrap();
        let result = store.transaction("INSERT INTO t VALUES (1);");
        assert!(result.is_err());
        let count = store.query("SELECT COUNT(*) FROM t", RowShape::Int).unwrap();
        assert_eq!(count, QueryResult::Int(1));
    }

    #[test]
    fn test_transaction_commits_on_success() {
        let dir = tempdir().unwrap();
        let mut store = opened_store(&dir, "t.db");
        store.exec("CREATE TABLE t(x INTEGER)").unwrap();
        store
            .transaction("INSERT INTO t VALUES (1); INSERT INTO t VALUES (2);")
            .unwrap();
        let count = store.query("SELECT COUNT(*) FROM t", RowShape::Int).unwrap();
        assert_eq!(count, QueryResult::Int(2));
    }

    #[test]
    fn test_schema_version_roundtrip() {
        let dir = tempdir().unwrap();
        let mut store = opened_store(&dir, "t.db");
        assert_eq!(store.schema_version().unwrap(), 0);
        store.set_schema_version(1).unwrap();
        assert_eq!(store.schema_version().unwrap(), 1);
    }

    #[test]
    fn test_string_pairs_shape() {
        let dir = tempdir().unwrap();
        let mut store = opened_store(&dir, "t.db");
        store.exec("CREATE TABLE t(k TEXT, v TEXT)").unwrap();
        store.exec("INSERT INTO t VALUES ('a','1'),('b','2')").unwrap();
        let result = store
            .query("SELECT k, v FROM t", RowShape::StringPairs)
            .unwrap();
        let QueryResult::StringPairs(map) = result else {
            panic!("wrong shape")
        };
        assert_eq!(map.get("a").unwrap(), "1");
        assert_eq!(map.get("b").unwrap(), "2");
    }
}
