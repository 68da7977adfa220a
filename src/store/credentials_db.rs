/*!

[CredentialsDatabase]: the façade composing [MetadataStore], [SecretStore]
and [SecretCache] into the identity-level operations of spec §4.3.

 */
use std::path::Path;

use crate::context::SecurityContext;
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::identity_info::IdentityInfo;
use crate::method_cache::{self, MethodCache};
use crate::store::cache::SecretCache;
use crate::store::metadata::MetadataStore;
use crate::store::secret::{DEFAULT_MAX_DATA_STORAGE, SecretStore};

/// A filter for [CredentialsDatabase::load_identities]. Every `Some` field
/// must match; `None` fields are wildcards.
#[derive(Debug, Clone, Default)]
pub struct IdentityFilter {
    /// Case-insensitive substring match against `caption`.
    pub caption: Option<String>,
    pub owner: Option<SecurityContext>,
    pub type_: Option<u32>,
}

impl IdentityFilter {
    fn matches(&self, info: &IdentityInfo) -> bool {
        if let Some(substr) = &self.caption {
            if !info.caption.to_lowercase().contains(&substr.to_lowercase()) {
                return false;
            }
        }
        if let Some(owner) = &self.owner {
            if !owner.matches(&info.owner) {
                return false;
            }
        }
        if let Some(type_) = self.type_ {
            if info.type_ != type_ {
                return false;
            }
        }
        true
    }
}

/// The result of [CredentialsDatabase::update_identity]: the persisted id,
/// plus an error from the secret-store half, which (per spec §4.3) is
/// reported without rolling back the metadata half.
#[derive(Debug)]
pub struct UpdateOutcome {
    pub id: u32,
    pub secret_error: Option<Error>,
}

pub struct CredentialsDatabase {
    metadata: MetadataStore,
    secret: SecretStore,
    cache: SecretCache,
    max_data_storage: usize,
}

impl Default for CredentialsDatabase {
    fn default() -> Self {
        CredentialsDatabase {
            metadata: MetadataStore::new(),
            secret: SecretStore::new(),
            cache: SecretCache::new(),
            max_data_storage: DEFAULT_MAX_DATA_STORAGE,
        }
    }
}

impl CredentialsDatabase {
    pub fn new(max_data_storage: usize) -> Self {
        CredentialsDatabase {
            max_data_storage,
            ..Self::default()
        }
    }

    pub fn open(&mut self, metadata_path: &Path, secret_path: &Path) -> Result<()> {
        self.metadata.open(metadata_path)?;
        self.secret.open(secret_path)?;
        Ok(())
    }

    pub fn close(&mut self) {
        self.metadata.close();
        self.secret.close();
        self.cache.clear();
    }

    pub fn is_open(&self) -> bool {
        self.metadata.is_open()
    }

    pub fn load_identity(&mut self, id: u32, want_secret: bool) -> Result<IdentityInfo> {
        let mut info = self.metadata.load_identity(id)?.ok_or(Error::NotFound)?;
        if want_secret && !info.is_new() && self.secret.is_open() {
            if let Some(creds) = self.cached_or_loaded_credentials(id)? {
                if info.username_is_secret {
                    info.username = creds.username;
                }
                info.secret = creds.password;
            }
        }
        Ok(info)
    }

    fn cached_or_loaded_credentials(&mut self, id: u32) -> Result<Option<Credentials>> {
        if let Some(creds) = self.cache.credentials(id) {
            return Ok(Some(creds));
        }
        let creds = self.secret.load_credentials(id)?;
        if let Some(creds) = &creds {
            self.cache.put_credentials(id, creds.clone());
        }
        Ok(creds)
    }

    pub fn load_identities(&mut self, filter: &IdentityFilter) -> Result<Vec<IdentityInfo>> {
        let mut out = Vec::new();
        for id in self.metadata.all_identity_ids()? {
            if let Some(info) = self.metadata.load_identity(id)? {
                if filter.matches(&info) {
                    out.push(info);
                }
            }
        }
        Ok(out)
    }

    pub fn insert_identity(&mut self, info: &IdentityInfo, store_secret: bool) -> Result<UpdateOutcome> {
        let mut info = info.clone();
        info.id = 0;
        self.update_identity(&info, store_secret)
    }

    pub fn update_identity(&mut self, info: &IdentityInfo, store_secret: bool) -> Result<UpdateOutcome> {
        let id = self.metadata.update_identity(info)?;
        let mut secret_error = None;
        if store_secret && self.secret.is_open() {
            let username = if info.username_is_secret { info.username.clone() } else { String::new() };
            let creds = Credentials::new(id, username, info.secret.clone());
            self.cache.put_credentials(id, creds);
            // Flushing (rather than writing credentials alone) also
            // re-persists any method data already cached for this
            // identity, matching the cache's documented atomic-per-id
            // write-back contract.
            if let Err(e) = self.cache.flush(id, &mut self.secret, self.max_data_storage) {
                self.cache.remove_identity(id);
                secret_error = Some(e);
            }
        }
        Ok(UpdateOutcome { id, secret_error })
    }

    pub fn remove_identity(&mut self, id: u32) -> Result<()> {
        self.metadata.remove_identity(id)?;
        if self.secret.is_open() {
            self.secret.remove_credentials(id)?;
        }
        self.cache.remove_identity(id);
        Ok(())
    }

    /// Compares `(username, password)` against the stored secret: if the
    /// identity's username is itself a secret, both came from the secret
    /// store; otherwise the username is plaintext metadata and only the
    /// password is secret. Either way, `load_identity(id, true)` has
    /// already merged the right value into `username`.
    pub fn check_secret(&mut self, id: u32, username: &str, password: &str) -> Result<bool> {
        let info = self.load_identity(id, true)?;
        Ok(info.username == username && info.secret == password)
    }

    pub fn load_method_data(&mut self, id: u32, method_name: &str) -> Result<MethodCache> {
        let Some(method_id) = self.metadata.resolve_method(method_name, false)? else {
            return Ok(MethodCache::new());
        };
        if let Some(data) = self.cache.method_data(id, method_id) {
            return Ok(data);
        }
        let data = self.secret.load_data(id, method_id)?;
        self.cache.put_method_data(id, method_id, data.clone());
        Ok(data)
    }

    pub fn update_method_data(&mut self, id: u32, method_name: &str, data: &MethodCache) -> Result<()> {
        if method_cache::encoded_size(data) > self.max_data_storage {
            return Err(Error::InvalidArgument(
                "data".into(),
                format!("exceeds Db/MaxDataStorage of {}", self.max_data_storage),
            ));
        }
        let method_id = self.metadata.resolve_method(method_name, true)?.expect("created above");
        self.secret.update_data(id, method_id, data, self.max_data_storage)?;
        self.cache.put_method_data(id, method_id, data.clone());
        Ok(())
    }

    pub fn remove_method_data(&mut self, id: u32, method_name: &str) -> Result<()> {
        let Some(method_id) = self.metadata.resolve_method(method_name, false)? else {
            return Ok(());
        };
        self.secret.remove_data(id, Some(method_id))?;
        self.cache.remove_method_data(id, Some(method_id));
        Ok(())
    }

    pub fn get_methods(&mut self, id: u32, peer_ctx: Option<&SecurityContext>) -> Result<Vec<String>> {
        self.metadata.get_methods(id, peer_ctx)
    }

    pub fn insert_reference(&mut self, id: u32, owner: &SecurityContext, name: &str) -> Result<()> {
        self.metadata.insert_reference(id, owner, name)
    }

    pub fn remove_reference(&mut self, id: u32, owner: &SecurityContext, name: &str) -> Result<()> {
        self.metadata.remove_reference(id, owner, name)
    }

    pub fn get_references(&mut self, id: u32, owner: &SecurityContext) -> Result<Vec<String>> {
        self.metadata.get_references(id, owner)
    }

    pub fn get_acl(&mut self, id: u32) -> Result<Vec<SecurityContext>> {
        self.metadata.get_acl(id)
    }

    pub fn get_owner(&mut self, id: u32) -> Result<SecurityContext> {
        self.metadata.get_owner(id)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.metadata.clear()?;
        if self.secret.is_open() {
            self.secret.clear()?;
        }
        self.cache.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn opened() -> (tempfile::TempDir, CredentialsDatabase) {
        let dir = tempdir().unwrap();
        let mut db = CredentialsDatabase::default();
        db.open(&dir.path().join("metadata.db"), &dir.path().join("secret.db")).unwrap();
        (dir, db)
    }

    fn ctx(sys: &str, app: &str) -> SecurityContext {
        SecurityContext::new(sys, app)
    }

    #[test]
    fn test_insert_then_load_with_secret() {
        let (_dir, mut db) = opened();
        let info = IdentityInfo {
            username: "alice".into(),
            secret: "p@ss".into(),
            owner: ctx("/usr/bin/app", ""),
            ..Default::default()
        };
        let outcome = db.insert_identity(&info, true).unwrap();
        assert!(outcome.secret_error.is_none());

        let loaded = db.load_identity(outcome.id, true).unwrap();
        assert_eq!(loaded.username, "alice");
        assert_eq!(loaded.secret, "p@ss");
    }

    #[test]
    fn test_load_without_secret_omits_password() {
        let (_dir, mut db) = opened();
        let info = IdentityInfo {
            username: "alice".into(),
            secret: "p@ss".into(),
            owner: ctx("/usr/bin/app", ""),
            ..Default::default()
        };
        let outcome = db.insert_identity(&info, true).unwrap();
        let loaded = db.load_identity(outcome.id, false).unwrap();
        assert_eq!(loaded.secret, "");
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let (_dir, mut db) = opened();
        assert!(matches!(db.load_identity(404, false), Err(Error::NotFound)));
    }

    #[test]
    fn test_check_secret() {
        let (_dir, mut db) = opened();
        let info = IdentityInfo {
            username: "alice".into(),
            secret: "p@ss".into(),
            owner: ctx("/usr/bin/app", ""),
            ..Default::default()
        };
        let outcome = db.insert_identity(&info, true).unwrap();
        assert!(db.check_secret(outcome.id, "alice", "p@ss").unwrap());
        assert!(!db.check_secret(outcome.id, "alice", "wrong").unwrap());
    }

    #[test]
    fn test_method_data_roundtrip_creates_method() {
        let (_dir, mut db) = opened();
        let info = IdentityInfo { owner: ctx("/usr/bin/app", ""), ..Default::default() };
        let outcome = db.insert_identity(&info, false).unwrap();

        let mut data = MethodCache::new();
        data.insert("token".into(), crate::method_cache::Value::Str("xyz".into()));
        db.update_method_data(outcome.id, "oauth2", &data).unwrap();

        let loaded = db.load_method_data(outcome.id, "oauth2").unwrap();
        assert_eq!(loaded, data);
    }

    #[test]
    fn test_method_data_missing_method_is_empty() {
        let (_dir, mut db) = opened();
        let info = IdentityInfo { owner: ctx("/usr/bin/app", ""), ..Default::default() };
        let outcome = db.insert_identity(&info, false).unwrap();
        assert!(db.load_method_data(outcome.id, "unknown").unwrap().is_empty());
    }

    #[test]
    fn test_remove_method_data() {
        let (_dir, mut db) = opened();
        let info = IdentityInfo { owner: ctx("/usr/bin/app", ""), ..Default::default() };
        let outcome = db.insert_identity(&info, false).unwrap();
        let mut data = MethodCache::new();
        data.insert("k".into(), crate::method_cache::Value::Bool(true));
        db.update_method_data(outcome.id, "password", &data).unwrap();
        db.remove_method_data(outcome.id, "password").unwrap();
        assert!(db.load_method_data(outcome.id, "password").unwrap().is_empty());
    }

    #[test]
    fn test_remove_identity_removes_both_halves() {
        let (_dir, mut db) = opened();
        let info = IdentityInfo {
            username: "alice".into(),
            secret: "p@ss".into(),
            owner: ctx("/usr/bin/app", ""),
            ..Default::default()
        };
        let outcome = db.insert_identity(&info, true).unwrap();
        db.remove_identity(outcome.id).unwrap();
        assert!(matches!(db.load_identity(outcome.id, false), Err(Error::NotFound)));
    }

    #[test]
    fn test_load_identities_filters_by_caption_case_insensitive() {
        let (_dir, mut db) = opened();
        db.insert_identity(
            &IdentityInfo { caption: "Google Account".into(), owner: ctx("/usr/bin/app", ""), ..Default::default() },
            false,
        )
        .unwrap();
        db.insert_identity(
            &IdentityInfo { caption: "Twitter".into(), owner: ctx("/usr/bin/app", ""), ..Default::default() },
            false,
        )
        .unwrap();

        let filter = IdentityFilter { caption: Some("google".into()), ..Default::default() };
        let matches = db.load_identities(&filter).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].caption, "Google Account");
    }

    #[test]
    fn test_load_identities_filters_by_owner() {
        let (_dir, mut db) = opened();
        db.insert_identity(
            &IdentityInfo { caption: "a".into(), owner: ctx("/usr/bin/app1", ""), ..Default::default() },
            false,
        )
        .unwrap();
        db.insert_identity(
            &IdentityInfo { caption: "b".into(), owner: ctx("/usr/bin/app2", ""), ..Default::default() },
            false,
        )
        .unwrap();

        let filter = IdentityFilter { owner: Some(ctx("/usr/bin/app1", "")), ..Default::default() };
        let matches = db.load_identities(&filter).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].caption, "a");
    }

    #[test]
    fn test_update_identity_reports_secret_error_without_rolling_back_metadata() {
        let (dir, mut db) = opened();
        // Hold an exclusive lock on secret.db from a second connection so the
        // store's own write genuinely fails with SQLITE_BUSY, rather than
        // skipping the attempt via a closed store as before.
        let blocker = rusqlite::Connection::open(dir.path().join("secret.db")).unwrap();
        blocker.execute_batch("BEGIN EXCLUSIVE; UPDATE CREDENTIALS SET id = id WHERE 0;").unwrap();

        let info = IdentityInfo {
            caption: "partial".into(),
            secret: "p@ss".into(),
            owner: ctx("/usr/bin/app", ""),
            ..Default::default()
        };
        let outcome = db.update_identity(&info, true).unwrap();
        assert!(db.secret.is_open());
        assert!(outcome.secret_error.is_some(), "write against a locked secret store must fail, not be skipped");
        let loaded = db.load_identity(outcome.id, false).unwrap();
        assert_eq!(loaded.caption, "partial");

        blocker.execute_batch("ROLLBACK;").unwrap();
    }

    #[test]
    fn test_clear_empties_everything() {
        let (_dir, mut db) = opened();
        let info = IdentityInfo {
            username: "alice".into(),
            secret: "p@ss".into(),
            owner: ctx("/usr/bin/app", ""),
            ..Default::default()
        };
        let outcome = db.insert_identity(&info, true).unwrap();
        db.clear().unwrap();
        assert!(matches!(db.load_identity(outcome.id, false), Err(Error::NotFound)));
    }
}
