/*!

The secret store: `secret.db`, holding plaintext passwords and
per-method opaque blobs. See spec §4.2 and §6.1.

 */
use std::path::Path;

use rusqlite::params;

use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::method_cache::{MethodCache, Value};
use crate::store::sql::{OpenFlags, SqlStore};

const SCHEMA_VERSION: i64 = 1;

/// Default ceiling (bytes) on one method's `STORE` payload, matching
/// `Db/MaxDataStorage`'s default in the original daemon.
pub const DEFAULT_MAX_DATA_STORAGE: usize = 64 * 1024;

pub struct SecretStore {
    sql: SqlStore,
}

impl Default for SecretStore {
    fn default() -> Self {
        SecretStore { sql: SqlStore::new() }
    }
}

impl SecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.sql.is_open()
    }

    pub fn open(&mut self, path: &Path) -> Result<()> {
        self.sql.open(path, OpenFlags::ReadWriteCreate)?;
        if self.sql.schema_version()? == 0 {
            self.create_schema()?;
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.sql.close();
    }

    fn create_schema(&mut self) -> Result<()> {
        self.sql.transaction(
            "CREATE TABLE IF NOT EXISTS CREDENTIALS(
                id INTEGER PRIMARY KEY UNIQUE,
                username TEXT NOT NULL DEFAULT '',
                password TEXT NOT NULL DEFAULT ''
            );
            CREATE TABLE IF NOT EXISTS STORE(
                identity_id INTEGER NOT NULL,
                method_id INTEGER NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (identity_id, method_id, key)
            );
            CREATE TRIGGER IF NOT EXISTS tg_delete_credentials
                BEFORE DELETE ON CREDENTIALS
                FOR EACH ROW BEGIN
                    DELETE FROM STORE WHERE STORE.identity_id = OLD.id;
                END;",
        )?;
        self.sql.set_schema_version(SCHEMA_VERSION)
    }

    /// Deletes all rows from all tables in one transaction.
    pub fn clear(&mut self) -> Result<()> {
        self.sql
            .transaction("DELETE FROM CREDENTIALS; DELETE FROM STORE;")
    }

    pub fn load_credentials(&mut self, id: u32) -> Result<Option<Credentials>> {
        let conn = self.sql_conn()?;
        let mut stmt =
            conn.prepare("SELECT username, password FROM CREDENTIALS WHERE id = ?1")?;
        let mut rows = stmt.query(params![id])?;
        Ok(match rows.next()? {
            Some(row) => Some(Credentials {
                id,
                username: row.get(0)?,
                password: row.get(1)?,
            }),
            None => None,
        })
    }

    pub fn update_credentials(&mut self, creds: &Credentials) -> Result<()> {
        let conn = self.sql_conn()?;
        conn.execute(
            "INSERT INTO CREDENTIALS (id, username, password) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET username = excluded.username, password = excluded.password",
            params![creds.id, creds.username, creds.password],
        )
        .map_err(Error::from)?;
        Ok(())
    }

    pub fn remove_credentials(&mut self, id: u32) -> Result<()> {
        let conn = self.sql_conn()?;
        conn.execute("DELETE FROM CREDENTIALS WHERE id = ?1", params![id])
            .map_err(Error::from)?;
        Ok(())
    }

    pub fn load_data(&mut self, id: u32, method_id: u32) -> Result<MethodCache> {
        let conn = self.sql_conn()?;
        let mut stmt =
            conn.prepare("SELECT key, value FROM STORE WHERE identity_id = ?1 AND method_id = ?2")?;
        let mut rows = stmt.query(params![id, method_id])?;
        let mut cache = MethodCache::new();
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            cache.insert(key, Value::decode(&blob)?);
        }
        Ok(cache)
    }

    /// Replace all data for `(id, method_id)` with `data`, enforcing
    /// `max_size` as the ceiling on the summed encoded size (spec §4.3).
    pub fn update_data(
        &mut self,
        id: u32,
        method_id: u32,
        data: &MethodCache,
        max_size: usize,
    ) -> Result<()> {
        let total: usize = data.iter().map(|(k, v)| v.encoded_size(k)).sum();
        if total > max_size {
            return Err(Error::InvalidArgument(
                "data".into(),
                format!("{total} bytes exceeds Db/MaxDataStorage of {max_size}"),
            ));
        }
        self.sql.begin()?;
        let result = self.update_data_body(id, method_id, data);
        match result {
            Ok(()) => self.sql.commit(),
            Err(e) => {
                let _ = self.sql.rollback();
                Err(e)
            }
        }
    }

    fn update_data_body(&mut self, id: u32, method_id: u32, data: &MethodCache) -> Result<()> {
        let conn = self.sql_conn()?;
        conn.execute(
            "DELETE FROM STORE WHERE identity_id = ?1 AND method_id = ?2",
            params![id, method_id],
        )?;
        for (key, value) in data {
            conn.execute(
                "INSERT OR REPLACE INTO STORE (identity_id, method_id, key, value) VALUES (?1, ?2, ?3, ?4)",
                params![id, method_id, key, value.encode()],
            )?;
        }
        Ok(())
    }

    pub fn remove_data(&mut self, id: u32, method_id: Option<u32>) -> Result<()> {
        let conn = self.sql_conn()?;
        match method_id {
            None => {
                conn.execute("DELETE FROM STORE WHERE identity_id = ?1", params![id])?;
            }
            Some(method_id) => {
                conn.execute(
                    "DELETE FROM STORE WHERE identity_id = ?1 AND method_id = ?2",
                    params![id, method_id],
                )?;
            }
        }
        Ok(())
    }

    fn sql_conn(&mut self) -> Result<&rusqlite::Connection> {
        self.sql.conn_ref()
    }
}
