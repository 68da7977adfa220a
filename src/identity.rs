/*!

[Identity]: the per-client façade over one stored identity, per spec
§4.7. Owns the identity's `IdentityInfo`, the [AuthSession] children it
has handed out, and the per-operation ACL enforcement gating all of it.

 */
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::access_control::AccessControlManager;
use crate::context::SecurityContext;
use crate::error::{Error, Result};
use crate::identity_info::IdentityInfo;
use crate::plugin::proxy::{PluginProxy, ProxyRegistry};
use crate::session::AuthSession;
use crate::store::credentials_db::{CredentialsDatabase, UpdateOutcome};

/// The kind of change signaled by `info-updated`, per §4.7's rule table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Data,
    Acl,
    Owner,
    Removed,
    SignedOut,
}

pub type InfoUpdatedCallback = Box<dyn Fn(ChangeKind) + Send>;

/// Spawns (or locates) the [PluginProxy] backing a given method name.
/// Kept as an injected closure rather than resolved here, since plugin
/// discovery (reading `General/PluginsDir`/`General/LoadersDir`) is a
/// concern of the daemon's plugin-loading layer, not of one Identity.
pub type ProxySpawner = Arc<dyn Fn(&str) -> Result<PluginProxy> + Send + Sync>;

pub struct Identity {
    info: IdentityInfo,
    db: Arc<Mutex<CredentialsDatabase>>,
    acl_mgr: Arc<dyn AccessControlManager>,
    proxies: Arc<ProxyRegistry>,
    spawn_proxy: ProxySpawner,
    sessions: HashMap<String, Arc<Mutex<AuthSession>>>,
    next_session_id: u64,
    on_info_updated: InfoUpdatedCallback,
}

impl Identity {
    pub fn new(
        info: IdentityInfo,
        db: Arc<Mutex<CredentialsDatabase>>,
        acl_mgr: Arc<dyn AccessControlManager>,
        proxies: Arc<ProxyRegistry>,
        spawn_proxy: ProxySpawner,
        on_info_updated: InfoUpdatedCallback,
    ) -> Self {
        Identity {
            info,
            db,
            acl_mgr,
            proxies,
            spawn_proxy,
            sessions: HashMap::new(),
            next_session_id: 1,
            on_info_updated,
        }
    }

    pub fn id(&self) -> u32 {
        self.info.id
    }

    fn check_peer(&self, peer_ctx: &SecurityContext) -> Result<()> {
        if self.acl_mgr.peer_is_owner(peer_ctx, &self.info.owner)
            || self.acl_mgr.peer_is_in_acl(peer_ctx, &self.info.acl)
        {
            Ok(())
        } else {
            Err(Error::PermissionDenied)
        }
    }

    /// ACL-checked read of the identity's non-secret descriptive record.
    pub fn get_info(&self, peer_ctx: &SecurityContext) -> Result<IdentityInfo> {
        self.check_peer(peer_ctx)?;
        Ok(self.info.clone())
    }

    /// Requests that the owner re-enter credentials out of band. This
    /// crate has no UI surface of its own; the ACL check is the whole of
    /// what belongs at this layer, leaving the prompt itself to whatever
    /// embeds this library as the daemon's IPC front end.
    pub fn request_credentials_update(&self, _message: &str, peer_ctx: &SecurityContext) -> Result<()> {
        self.check_peer(peer_ctx)
    }

    /// Returns the [AuthSession] for `method`, spawning its [PluginProxy]
    /// on first use via the injected [ProxySpawner].
    pub fn get_auth_session(&mut self, method: &str, peer_ctx: &SecurityContext) -> Result<Arc<Mutex<AuthSession>>> {
        self.check_peer(peer_ctx)?;
        if let Some(session) = self.sessions.get(method) {
            return Ok(session.clone());
        }
        let spawn_proxy = self.spawn_proxy.clone();
        let method_owned = method.to_string();
        let proxy = self
            .proxies
            .get_or_spawn(method, move || spawn_proxy(&method_owned))?;
        let session_id = self.next_session_id;
        self.next_session_id += 1;
        let session = Arc::new(Mutex::new(AuthSession::new(session_id, &self.info, method, proxy)));
        self.sessions.insert(method.to_string(), session.clone());
        Ok(session)
    }

    /// Compares `(username, password)` against the stored secret.
    pub fn verify_secret(&mut self, username: &str, password: &str, peer_ctx: &SecurityContext) -> Result<bool> {
        self.check_peer(peer_ctx)?;
        self.db.lock().unwrap().check_secret(self.info.id, username, password)
    }

    /// Sugar over `get_auth_session(method)` followed by `process`, for
    /// clients that want an interactive user-presence check without
    /// managing a session handle themselves.
    #[allow(clippy::too_many_arguments)]
    pub fn verify_user(
        &mut self,
        method: &str,
        mechanism: &str,
        session_data: crate::method_cache::MethodCache,
        peer_ctx: &SecurityContext,
        ready_cb: crate::plugin::proxy::ReadyCallback,
        state_cb: crate::plugin::proxy::StateCallback,
        store_cb: crate::plugin::proxy::StoreCallback,
    ) -> Result<()> {
        let cache = self.db.lock().unwrap().load_method_data(self.info.id, method)?;
        let session = self.get_auth_session(method, peer_ctx)?;
        let mut session = session.lock().unwrap();
        session.process(session_data, mechanism, peer_ctx, self.acl_mgr.as_ref(), cache, ready_cb, state_cb, store_cb)
    }

    /// Persists `info`: `insert_identity` when `info.id == 0`, otherwise
    /// `update_identity`. Emits `info-updated` with the change kind the
    /// update actually produced. The returned `secret_error`, if any, is
    /// reported without the metadata half having been rolled back.
    pub fn store(&mut self, mut info: IdentityInfo, peer_ctx: &SecurityContext) -> Result<UpdateOutcome> {
        let is_new = info.id == 0;
        if !is_new {
            self.check_peer(peer_ctx)?;
        }
        if !self.acl_mgr.acl_is_valid(peer_ctx, &info.acl) {
            return Err(Error::PermissionDenied);
        }
        let outcome = {
            let mut db = self.db.lock().unwrap();
            if is_new {
                db.insert_identity(&info, info.store_secret)?
            } else {
                db.update_identity(&info, info.store_secret)?
            }
        };
        info.id = outcome.id;

        let change_kind = if is_new {
            ChangeKind::Data
        } else if info.owner != self.info.owner {
            ChangeKind::Owner
        } else if info.acl != self.info.acl {
            ChangeKind::Acl
        } else {
            ChangeKind::Data
        };
        self.info = info;
        (self.on_info_updated)(change_kind);
        Ok(outcome)
    }

    /// Removes the identity from both stores and destroys all session
    /// children. Only the owner may remove.
    pub fn remove(&mut self, peer_ctx: &SecurityContext) -> Result<()> {
        if !self.acl_mgr.peer_is_owner(peer_ctx, &self.info.owner) {
            return Err(Error::PermissionDenied);
        }
        self.db.lock().unwrap().remove_identity(self.info.id)?;
        self.sessions.clear();
        (self.on_info_updated)(ChangeKind::Removed);
        Ok(())
    }

    /// Tears down all session children without removing the persisted
    /// record, as a client-initiated logout.
    pub fn sign_out(&mut self, peer_ctx: &SecurityContext) -> Result<()> {
        self.check_peer(peer_ctx)?;
        self.sessions.clear();
        (self.on_info_updated)(ChangeKind::SignedOut);
        Ok(())
    }

    pub fn add_reference(&mut self, name: &str, peer_ctx: &SecurityContext) -> Result<()> {
        self.check_peer(peer_ctx)?;
        self.db.lock().unwrap().insert_reference(self.info.id, peer_ctx, name)
    }

    pub fn remove_reference(&mut self, name: &str, peer_ctx: &SecurityContext) -> Result<()> {
        self.check_peer(peer_ctx)?;
        self.db.lock().unwrap().remove_reference(self.info.id, peer_ctx, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_control::DefaultAccessControlManager;
    use crate::method_cache::MethodCache;
    use crate::plugin::host::PluginWorker;
    use crate::plugin::protocol::{Request, Signal};
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    fn ctx(sys: &str, app: &str) -> SecurityContext {
        SecurityContext::new(sys, app)
    }

    struct RejectingAclManager(DefaultAccessControlManager);
    impl AccessControlManager for RejectingAclManager {
        fn security_context_of_peer(&self, peer_fd: std::os::unix::io::RawFd, app_ctx: &str) -> SecurityContext {
            self.0.security_context_of_peer(peer_fd, app_ctx)
        }
        fn peer_is_in_acl(&self, peer_ctx: &SecurityContext, acl: &[SecurityContext]) -> bool {
            self.0.peer_is_in_acl(peer_ctx, acl)
        }
        fn peer_is_owner(&self, peer_ctx: &SecurityContext, owner_ctx: &SecurityContext) -> bool {
            self.0.peer_is_owner(peer_ctx, owner_ctx)
        }
        fn acl_is_valid(&self, _peer_ctx: &SecurityContext, _acl: &[SecurityContext]) -> bool {
            false
        }
        fn keychain_context(&self) -> SecurityContext {
            self.0.keychain_context()
        }
    }

    struct EchoWorker;
    impl PluginWorker for EchoWorker {
        fn send(&mut self, _request: &Request) -> Result<()> {
            Ok(())
        }
        fn recv(&mut self) -> Result<Option<Signal>> {
            Ok(Some(Signal::ResponseFinal { data: MethodCache::new() }))
        }
        fn terminate(&mut self) {}
    }

    fn spawner() -> ProxySpawner {
        Arc::new(|_method: &str| Ok(PluginProxy::new(Box::new(EchoWorker), vec!["password".into()], None)))
    }

    fn opened_db() -> (tempfile::TempDir, Arc<Mutex<CredentialsDatabase>>) {
        let dir = tempdir().unwrap();
        let mut db = CredentialsDatabase::default();
        db.open(&dir.path().join("metadata.db"), &dir.path().join("secret.db")).unwrap();
        (dir, Arc::new(Mutex::new(db)))
    }

    fn make_identity(
        db: Arc<Mutex<CredentialsDatabase>>,
        owner: SecurityContext,
        events: Arc<StdMutex<Vec<ChangeKind>>>,
    ) -> (Identity, u32) {
        let info = IdentityInfo { username: "alice".into(), secret: "p@ss".into(), owner: owner.clone(), ..Default::default() };
        let outcome = db.lock().unwrap().insert_identity(&info, true).unwrap();
        let loaded = db.lock().unwrap().load_identity(outcome.id, true).unwrap();
        let identity = Identity::new(
            loaded,
            db,
            Arc::new(DefaultAccessControlManager::new(ctx("*", "keychain"))),
            Arc::new(ProxyRegistry::new()),
            spawner(),
            Box::new(move |kind| events.lock().unwrap().push(kind)),
        );
        (identity, outcome.id)
    }

    #[test]
    fn test_get_info_denies_non_owner_non_acl_peer() {
        let (_dir, db) = opened_db();
        let (identity, _id) = make_identity(db, ctx("/usr/bin/app", ""), Arc::new(StdMutex::new(Vec::new())));
        let result = identity.get_info(&ctx("/usr/bin/other", ""));
        assert!(matches!(result, Err(Error::PermissionDenied)));
    }

    #[test]
    fn test_get_info_allows_owner() {
        let (_dir, db) = opened_db();
        let owner = ctx("/usr/bin/app", "");
        let (identity, _id) = make_identity(db, owner.clone(), Arc::new(StdMutex::new(Vec::new())));
        let info = identity.get_info(&owner).unwrap();
        assert_eq!(info.username, "alice");
    }

    #[test]
    fn test_verify_secret() {
        let (_dir, db) = opened_db();
        let owner = ctx("/usr/bin/app", "");
        let (mut identity, _id) = make_identity(db, owner.clone(), Arc::new(StdMutex::new(Vec::new())));
        assert!(identity.verify_secret("alice", "p@ss", &owner).unwrap());
        assert!(!identity.verify_secret("alice", "wrong", &owner).unwrap());
    }

    #[test]
    fn test_store_new_identity_emits_data_change() {
        let (_dir, db) = opened_db();
        let owner = ctx("/usr/bin/app", "");
        let events = Arc::new(StdMutex::new(Vec::new()));
        let info = IdentityInfo { owner: owner.clone(), ..Default::default() };
        let mut identity = Identity::new(
            IdentityInfo::blank(),
            db,
            Arc::new(DefaultAccessControlManager::new(ctx("*", "keychain"))),
            Arc::new(ProxyRegistry::new()),
            spawner(),
            Box::new({
                let events = events.clone();
                move |kind| events.lock().unwrap().push(kind)
            }),
        );
        let outcome = identity.store(info, &owner).unwrap();
        assert!(outcome.id > 0);
        assert_eq!(events.lock().unwrap().as_slice(), &[ChangeKind::Data]);
    }

    #[test]
    fn test_store_owner_change_emits_owner_change() {
        let (_dir, db) = opened_db();
        let owner = ctx("/usr/bin/app", "");
        let new_owner = ctx("/usr/bin/other", "");
        let events = Arc::new(StdMutex::new(Vec::new()));
        let (mut identity, id) = make_identity(db.clone(), owner.clone(), events.clone());

        let mut updated = identity.get_info(&owner).unwrap();
        updated.id = id;
        updated.owner = new_owner.clone();
        identity.store(updated, &owner).unwrap();
        assert_eq!(events.lock().unwrap().as_slice(), &[ChangeKind::Owner]);

        let acl = db.lock().unwrap().get_acl(id).unwrap();
        assert!(acl.contains(&new_owner), "stored ACL must contain the new owner: {acl:?}");
    }

    #[test]
    fn test_remove_requires_owner_and_emits_removed() {
        let (_dir, db) = opened_db();
        let owner = ctx("/usr/bin/app", "");
        let events = Arc::new(StdMutex::new(Vec::new()));
        let (mut identity, _id) = make_identity(db, owner.clone(), events.clone());

        assert!(matches!(identity.remove(&ctx("/usr/bin/other", "")), Err(Error::PermissionDenied)));
        identity.remove(&owner).unwrap();
        assert_eq!(events.lock().unwrap().as_slice(), &[ChangeKind::Removed]);
    }

    #[test]
    fn test_sign_out_clears_sessions_and_emits_signed_out() {
        let (_dir, db) = opened_db();
        let owner = ctx("/usr/bin/app", "");
        let events = Arc::new(StdMutex::new(Vec::new()));
        let (mut identity, _id) = make_identity(db, owner.clone(), events.clone());

        identity.get_auth_session("password", &owner).unwrap();
        assert_eq!(identity.sessions.len(), 1);
        identity.sign_out(&owner).unwrap();
        assert!(identity.sessions.is_empty());
        assert_eq!(events.lock().unwrap().as_slice(), &[ChangeKind::SignedOut]);
    }

    #[test]
    fn test_get_auth_session_reuses_same_session_for_method() {
        let (_dir, db) = opened_db();
        let owner = ctx("/usr/bin/app", "");
        let (mut identity, _id) = make_identity(db, owner.clone(), Arc::new(StdMutex::new(Vec::new())));

        let a = identity.get_auth_session("password", &owner).unwrap();
        let b = identity.get_auth_session("password", &owner).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_add_and_remove_reference() {
        let (_dir, db) = opened_db();
        let owner = ctx("/usr/bin/app", "");
        let (mut identity, id) = make_identity(db.clone(), owner.clone(), Arc::new(StdMutex::new(Vec::new())));

        identity.add_reference("browser-session", &owner).unwrap();
        assert_eq!(db.lock().unwrap().get_references(id, &owner).unwrap(), vec!["browser-session".to_string()]);
        identity.remove_reference("browser-session", &owner).unwrap();
        assert!(db.lock().unwrap().get_references(id, &owner).unwrap().is_empty());
    }

    #[test]
    fn test_store_rejects_acl_when_manager_disallows_it() {
        let (_dir, db) = opened_db();
        let owner = ctx("/usr/bin/app", "");
        let info = IdentityInfo { username: "alice".into(), secret: "p@ss".into(), owner: owner.clone(), ..Default::default() };
        let outcome = db.lock().unwrap().insert_identity(&info, true).unwrap();
        let loaded = db.lock().unwrap().load_identity(outcome.id, true).unwrap();
        let mut identity = Identity::new(
            loaded,
            db,
            Arc::new(RejectingAclManager(DefaultAccessControlManager::new(ctx("*", "keychain")))),
            Arc::new(ProxyRegistry::new()),
            spawner(),
            Box::new(|_kind| {}),
        );

        let mut updated = identity.get_info(&owner).unwrap();
        updated.acl.push(ctx("/usr/bin/other", ""));
        assert!(matches!(identity.store(updated, &owner), Err(Error::PermissionDenied)));
    }
}
