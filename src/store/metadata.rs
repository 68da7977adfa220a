/*!

The metadata store: `metadata.db`, holding everything about an
identity except its secrets — caption, flags, realms, the method/
mechanism ACL, owner, and named references. See spec §4.2 and §6.1.

 */
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use crate::context::SecurityContext;
use crate::error::{Error, Result};
use crate::identity_info::{ALL_MECHANISMS, IdentityInfo};
use crate::store::sql::{OpenFlags, SqlStore};

const SCHEMA_VERSION: i64 = 1;

/// Bit flags packed into `CREDENTIALS.flags`.
mod flags {
    pub const VALIDATED: i64 = 1;
    pub const REMEMBER_SECRET: i64 = 2;
    pub const USERNAME_IS_SECRET: i64 = 4;
}

pub struct MetadataStore {
    sql: SqlStore,
}

impl Default for MetadataStore {
    fn default() -> Self {
        MetadataStore { sql: SqlStore::new() }
    }
}

impl MetadataStore {
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
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                caption TEXT NOT NULL DEFAULT '',
                username TEXT NOT NULL DEFAULT '',
                flags INTEGER NOT NULL DEFAULT 0,
                type INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS METHODS(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                method TEXT UNIQUE
            );
            CREATE TABLE IF NOT EXISTS MECHANISMS(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                mechanism TEXT UNIQUE
            );
            CREATE TABLE IF NOT EXISTS SECCTX(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sysctx TEXT NOT NULL DEFAULT '',
                appctx TEXT NOT NULL DEFAULT '',
                UNIQUE(sysctx, appctx) ON CONFLICT REPLACE
            );
            CREATE TABLE IF NOT EXISTS REALMS(
                identity_id INTEGER NOT NULL,
                realm TEXT NOT NULL,
                hostname TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (identity_id, realm, hostname)
            );
            CREATE TABLE IF NOT EXISTS ACL(
                rowid INTEGER PRIMARY KEY AUTOINCREMENT,
                identity_id INTEGER NOT NULL,
                method_id INTEGER,
                mechanism_id INTEGER,
                secctx_id INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS OWNER(
                rowid INTEGER PRIMARY KEY AUTOINCREMENT,
                identity_id INTEGER NOT NULL,
                secctx_id INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS REFS(
                identity_id INTEGER NOT NULL,
                secctx_id INTEGER NOT NULL,
                ref TEXT NOT NULL,
                PRIMARY KEY (identity_id, secctx_id, ref)
            );
            CREATE TRIGGER IF NOT EXISTS tg_delete_credentials
                BEFORE DELETE ON CREDENTIALS
                FOR EACH ROW BEGIN
                    DELETE FROM REALMS WHERE REALMS.identity_id = OLD.id;
                    DELETE FROM ACL WHERE ACL.identity_id = OLD.id;
                    DELETE FROM OWNER WHERE OWNER.identity_id = OLD.id;
                    DELETE FROM REFS WHERE REFS.identity_id = OLD.id;
                END;",
        )?;
        self.sql.set_schema_version(SCHEMA_VERSION)
    }

    /// Deletes all rows from all tables (but not the METHODS/MECHANISMS/
    /// SECCTX dictionaries, which are identity-independent) in one
    /// transaction.
    pub fn clear(&mut self) -> Result<()> {
        self.sql.transaction(
            "DELETE FROM CREDENTIALS; DELETE FROM REALMS; DELETE FROM ACL;
             DELETE FROM OWNER; DELETE FROM REFS;",
        )
    }

    fn conn(&mut self) -> Result<&Connection> {
        self.sql.conn_ref()
    }

    fn method_id(conn: &Connection, method: &str) -> Result<Option<i64>> {
        conn.query_row(
            "SELECT id FROM METHODS WHERE method = ?1",
            params![method],
            |row| row.get(0),
        )
        .optional()
        .map_err(Error::from)
    }

    fn method_id_or_create(conn: &Connection, method: &str) -> Result<i64> {
        if let Some(id) = Self::method_id(conn, method)? {
            return Ok(id);
        }
        conn.execute("INSERT INTO METHODS (method) VALUES (?1)", params![method])?;
        Ok(conn.last_insert_rowid())
    }

    /// Resolves `method` to its id, creating a fresh entry in the METHODS
    /// dictionary when `create` is true and no entry exists yet.
    pub fn resolve_method(&mut self, method: &str, create: bool) -> Result<Option<u32>> {
        let conn = self.conn()?;
        let id = if create {
            Some(Self::method_id_or_create(conn, method)?)
        } else {
            Self::method_id(conn, method)?
        };
        Ok(id.map(|id| id as u32))
    }

    fn mechanism_id_or_create(conn: &Connection, mechanism: &str) -> Result<i64> {
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM MECHANISMS WHERE mechanism = ?1",
                params![mechanism],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }
        conn.execute(
            "INSERT INTO MECHANISMS (mechanism) VALUES (?1)",
            params![mechanism],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn secctx_id_or_create(conn: &Connection, ctx: &SecurityContext) -> Result<i64> {
        conn.execute(
            "INSERT INTO SECCTX (sysctx, appctx) VALUES (?1, ?2)",
            params![ctx.system_ctx, ctx.app_ctx],
        )?;
        let existing: i64 = conn.query_row(
            "SELECT id FROM SECCTX WHERE sysctx = ?1 AND appctx = ?2",
            params![ctx.system_ctx, ctx.app_ctx],
            |row| row.get(0),
        )?;
        Ok(existing)
    }

    /// Returns the (possibly newly assigned) id of the identity.
    pub fn update_identity(&mut self, info: &IdentityInfo) -> Result<u32> {
        self.sql.begin()?;
        let result = self.update_identity_body(info);
        match result {
            Ok(id) => {
                self.sql.commit()?;
                Ok(id)
            }
            Err(e) => {
                let _ = self.sql.rollback();
                Err(e)
            }
        }
    }

    fn update_identity_body(&mut self, info: &IdentityInfo) -> Result<u32> {
        let conn = self.conn()?;
        let mut flag_bits = 0i64;
        if info.validated {
            flag_bits |= flags::VALIDATED;
        }
        if info.store_secret {
            flag_bits |= flags::REMEMBER_SECRET;
        }
        if info.username_is_secret {
            flag_bits |= flags::USERNAME_IS_SECRET;
        }
        let stored_username = if info.username_is_secret { "" } else { info.username.as_str() };

        let id = if info.is_new() {
            conn.execute(
                "INSERT INTO CREDENTIALS (caption, username, flags, type) VALUES (?1, ?2, ?3, ?4)",
                params![info.caption, stored_username, flag_bits, info.type_],
            )?;
            conn.last_insert_rowid() as u32
        } else {
            conn.execute(
                "UPDATE CREDENTIALS SET caption = ?2, username = ?3, flags = ?4, type = ?5 WHERE id = ?1",
                params![info.id, info.caption, stored_username, flag_bits, info.type_],
            )?;
            info.id
        };

        conn.execute("DELETE FROM REALMS WHERE identity_id = ?1", params![id])?;
        for realm in &info.realms {
            conn.execute(
                "INSERT OR REPLACE INTO REALMS (identity_id, realm, hostname) VALUES (?1, ?2, '')",
                params![id, realm],
            )?;
        }

        if !info.is_new() {
            conn.execute("DELETE FROM ACL WHERE identity_id = ?1", params![id])?;
            conn.execute("DELETE FROM OWNER WHERE identity_id = ?1", params![id])?;
        }
        // SECCTX's `UNIQUE(sysctx, appctx) ON CONFLICT REPLACE` deletes and
        // reinserts the row (a new id) on a repeat insert, so the owner's
        // secctx_id is resolved once here and threaded through rather than
        // re-resolved separately for the ACL and OWNER tables.
        let owner_secctx_id = Self::secctx_id_or_create(self.conn()?, &info.owner)?;
        self.insert_acl_rows(id, info, owner_secctx_id)?;
        self.conn()?.execute(
            "INSERT INTO OWNER (identity_id, secctx_id) VALUES (?1, ?2)",
            params![id, owner_secctx_id],
        )?;

        Ok(id)
    }

    /// The acl × methods × mechanisms cross-product insert, mirroring the
    /// daemon's identity-update transaction. The owner is unioned into the
    /// persisted ACL regardless of whether the caller included it: the
    /// owner must appear in the stored ACL per spec §3, even though an
    /// owner peer doesn't need to appear there for in-memory access checks.
    fn insert_acl_rows(&mut self, id: u32, info: &IdentityInfo, owner_secctx_id: i64) -> Result<()> {
        let mut secctx_ids = Vec::with_capacity(info.acl.len() + 1);
        for ctx in info.acl.iter().filter(|ctx| **ctx != info.owner) {
            secctx_ids.push(Self::secctx_id_or_create(self.conn()?, ctx)?);
        }
        secctx_ids.push(owner_secctx_id);
        if info.methods.is_empty() {
            let conn = self.conn()?;
            for secctx_id in &secctx_ids {
                conn.execute(
                    "INSERT INTO ACL (identity_id, method_id, mechanism_id, secctx_id) VALUES (?1, NULL, NULL, ?2)",
                    params![id, secctx_id],
                )?;
            }
            return Ok(());
        }
        for (method, mechanisms) in &info.methods {
            let method_id = Self::method_id_or_create(self.conn()?, method)?;
            if mechanisms.is_empty() || mechanisms.contains(ALL_MECHANISMS) {
                let conn = self.conn()?;
                for secctx_id in &secctx_ids {
                    conn.execute(
                        "INSERT INTO ACL (identity_id, method_id, mechanism_id, secctx_id) VALUES (?1, ?2, NULL, ?3)",
                        params![id, method_id, secctx_id],
                    )?;
                }
            } else {
                for mechanism in mechanisms {
                    let mechanism_id = Self::mechanism_id_or_create(self.conn()?, mechanism)?;
                    let conn = self.conn()?;
                    for secctx_id in &secctx_ids {
                        conn.execute(
                            "INSERT INTO ACL (identity_id, method_id, mechanism_id, secctx_id) VALUES (?1, ?2, ?3, ?4)",
                            params![id, method_id, mechanism_id, secctx_id],
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn remove_identity(&mut self, id: u32) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM CREDENTIALS WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Loads everything about `id` except its secret, or `None` if there's
    /// no such identity.
    pub fn load_identity(&mut self, id: u32) -> Result<Option<IdentityInfo>> {
        let row = {
            let conn = self.conn()?;
            conn.query_row(
                "SELECT caption, username, flags, type FROM CREDENTIALS WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, u32>(3)?,
                    ))
                },
            )
            .optional()?
        };
        let Some((caption, username, flag_bits, type_)) = row else {
            return Ok(None);
        };
        Ok(Some(IdentityInfo {
            id,
            username,
            username_is_secret: flag_bits & flags::USERNAME_IS_SECRET != 0,
            secret: String::new(),
            store_secret: flag_bits & flags::REMEMBER_SECRET != 0,
            caption,
            realms: self.load_realms(id)?,
            methods: self.load_methods_map(id)?,
            acl: self.get_acl(id)?,
            owner: self.get_owner(id)?,
            validated: flag_bits & flags::VALIDATED != 0,
            type_,
        }))
    }

    fn load_realms(&mut self, id: u32) -> Result<BTreeSet<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT realm FROM REALMS WHERE identity_id = ?1")?;
        let realms = stmt
            .query_map(params![id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<BTreeSet<_>>>()?;
        Ok(realms)
    }

    fn load_methods_map(&mut self, id: u32) -> Result<BTreeMap<String, BTreeSet<String>>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT METHODS.method, MECHANISMS.mechanism FROM
                (ACL JOIN METHODS ON ACL.method_id = METHODS.id)
                LEFT JOIN MECHANISMS ON ACL.mechanism_id = MECHANISMS.id
             WHERE ACL.identity_id = ?1",
        )?;
        let mut map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut rows = stmt.query(params![id])?;
        while let Some(row) = rows.next()? {
            let method: String = row.get(0)?;
            let mechanism: Option<String> = row.get(1)?;
            map.entry(method)
                .or_default()
                .insert(mechanism.unwrap_or_else(|| ALL_MECHANISMS.to_string()));
        }
        Ok(map)
    }

    /// The methods granted to `peer_ctx` (or every method on the identity,
    /// if `peer_ctx` is `None`), per spec §4.4's scoped `get_methods`.
    pub fn get_methods(&mut self, id: u32, peer_ctx: Option<&SecurityContext>) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let methods = match peer_ctx {
            None => {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT METHODS.method FROM
                        (ACL JOIN METHODS ON ACL.method_id = METHODS.id)
                     WHERE ACL.identity_id = ?1",
                )?;
                stmt.query_map(params![id], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
            Some(ctx) => {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT METHODS.method FROM
                        (ACL JOIN METHODS ON ACL.method_id = METHODS.id)
                     WHERE ACL.identity_id = ?1 AND ACL.secctx_id =
                        (SELECT id FROM SECCTX WHERE sysctx = ?2 AND appctx = ?3)",
                )?;
                stmt.query_map(params![id, ctx.system_ctx, ctx.app_ctx], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(methods)
    }

    pub fn get_acl(&mut self, id: u32) -> Result<Vec<SecurityContext>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT sysctx, appctx FROM SECCTX
             WHERE id IN (SELECT secctx_id FROM ACL WHERE identity_id = ?1)",
        )?;
        let acl = stmt
            .query_map(params![id], |row| {
                Ok(SecurityContext::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(acl)
    }

    pub fn get_owner(&mut self, id: u32) -> Result<SecurityContext> {
        let conn = self.conn()?;
        let owner = conn
            .query_row(
                "SELECT sysctx, appctx FROM SECCTX
                 WHERE id IN (SELECT secctx_id FROM OWNER WHERE identity_id = ?1) LIMIT 1",
                params![id],
                |row| Ok(SecurityContext::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?
            .unwrap_or_default();
        Ok(owner)
    }

    pub fn insert_reference(&mut self, id: u32, owner: &SecurityContext, name: &str) -> Result<()> {
        let secctx_id = Self::secctx_id_or_create(self.conn()?, owner)?;
        self.conn()?.execute(
            "INSERT OR REPLACE INTO REFS (identity_id, secctx_id, ref) VALUES (?1, ?2, ?3)",
            params![id, secctx_id, name],
        )?;
        Ok(())
    }

    pub fn remove_reference(&mut self, id: u32, owner: &SecurityContext, name: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM REFS WHERE identity_id = ?1 AND ref = ?2
             AND secctx_id = (SELECT id FROM SECCTX WHERE sysctx = ?3 AND appctx = ?4)",
            params![id, name, owner.system_ctx, owner.app_ctx],
        )?;
        Ok(())
    }

    pub fn get_references(&mut self, id: u32, owner: &SecurityContext) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT ref FROM REFS WHERE identity_id = ?1
             AND secctx_id = (SELECT id FROM SECCTX WHERE sysctx = ?2 AND appctx = ?3)",
        )?;
        let refs = stmt
            .query_map(params![id, owner.system_ctx, owner.app_ctx], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(refs)
    }

    /// Identities matching `filter`; see
    /// [crate::store::credentials_db::CredentialsDatabase::load_identities]
    /// for the filter semantics.
    pub fn all_identity_ids(&mut self) -> Result<Vec<u32>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM CREDENTIALS")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, u32>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }
}
