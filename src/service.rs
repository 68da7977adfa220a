/*!

[AuthService]: the daemon-core singleton. Owns the shared
[CredentialsDatabase], [ProxyRegistry], and [AccessControlManager], and
hands out per-client [Identity] façades over them. This is the object an
embedding IPC front end constructs once at startup, mirroring how the
original credential-store seam was installed with a single default
builder.

 */
use std::sync::{Arc, Mutex};

use crate::access_control::AccessControlManager;
use crate::config::Config;
use crate::context::SecurityContext;
use crate::error::{Error, Result};
use crate::identity::{Identity, InfoUpdatedCallback, ProxySpawner};
use crate::identity_info::IdentityInfo;
use crate::plugin::proxy::ProxyRegistry;
use crate::store::credentials_db::{CredentialsDatabase, IdentityFilter};

pub struct AuthService {
    config: Config,
    db: Arc<Mutex<CredentialsDatabase>>,
    acl_mgr: Arc<dyn AccessControlManager>,
    proxies: Arc<ProxyRegistry>,
    spawn_proxy: ProxySpawner,
}

impl AuthService {
    /// Opens the metadata/secret stores at the paths named by `config`.
    pub fn open(config: Config, acl_mgr: Arc<dyn AccessControlManager>, spawn_proxy: ProxySpawner) -> Result<Self> {
        let mut db = CredentialsDatabase::new(config.max_data_storage);
        db.open(&config.metadata_db_path(), &config.secret_db_path())?;
        Ok(AuthService {
            config,
            db: Arc::new(Mutex::new(db)),
            acl_mgr,
            proxies: Arc::new(ProxyRegistry::new()),
            spawn_proxy,
        })
    }

    #[cfg(test)]
    fn open_at(dir: &std::path::Path, acl_mgr: Arc<dyn AccessControlManager>, spawn_proxy: ProxySpawner) -> Result<Self> {
        let config = Config { storage_path: dir.to_path_buf(), ..Config::default() };
        Self::open(config, acl_mgr, spawn_proxy)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A blank, unpersisted identity, handed to a client that wants to
    /// create one. Its owner defaults to the requesting peer.
    pub fn register_new_identity(&self, peer_ctx: &SecurityContext, on_info_updated: InfoUpdatedCallback) -> Identity {
        let mut info = IdentityInfo::blank();
        info.owner = peer_ctx.clone();
        info.acl.push(peer_ctx.clone());
        Identity::new(info, self.db.clone(), self.acl_mgr.clone(), self.proxies.clone(), self.spawn_proxy.clone(), on_info_updated)
    }

    /// Loads identity `id` and wraps it in an `Identity`, after checking
    /// that `peer_ctx` is the owner or an ACL entry.
    pub fn get_identity(&self, id: u32, peer_ctx: &SecurityContext, on_info_updated: InfoUpdatedCallback) -> Result<Identity> {
        let info = self.db.lock().unwrap().load_identity(id, true)?;
        if !(self.acl_mgr.peer_is_owner(peer_ctx, &info.owner) || self.acl_mgr.peer_is_in_acl(peer_ctx, &info.acl)) {
            return Err(Error::PermissionDenied);
        }
        Ok(Identity::new(info, self.db.clone(), self.acl_mgr.clone(), self.proxies.clone(), self.spawn_proxy.clone(), on_info_updated))
    }

    /// Lists identities matching `filter` that `peer_ctx` may see (owner
    /// or ACL member), except for the keychain peer, which sees all.
    pub fn query_identities(&self, filter: &IdentityFilter, peer_ctx: &SecurityContext) -> Result<Vec<IdentityInfo>> {
        let is_keychain = self.acl_mgr.keychain_context().matches(peer_ctx);
        let all = self.db.lock().unwrap().load_identities(filter)?;
        Ok(all
            .into_iter()
            .filter(|info| {
                is_keychain
                    || self.acl_mgr.peer_is_owner(peer_ctx, &info.owner)
                    || self.acl_mgr.peer_is_in_acl(peer_ctx, &info.acl)
            })
            .collect())
    }

    /// Bulk-removes every identity. Restricted to the keychain context.
    pub fn clear(&self, peer_ctx: &SecurityContext) -> Result<()> {
        if !self.acl_mgr.keychain_context().matches(peer_ctx) {
            return Err(Error::PermissionDenied);
        }
        self.db.lock().unwrap().clear()
    }
}
