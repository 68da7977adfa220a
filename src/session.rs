/*!

[AuthSession]: one client's conversation with a plugin, scoped to an
identity and method. See spec §4.6.

 */
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use crate::access_control::AccessControlManager;
use crate::context::SecurityContext;
use crate::error::{Error, Result};
use crate::identity_info::IdentityInfo;
use crate::method_cache::{MethodCache, Value};
use crate::plugin::proxy::{PluginProxy, ReadyCallback, StateCallback, StoreCallback};
use crate::plugin::protocol::Request;

pub struct AuthSession {
    id: u64,
    method: String,
    allowed_mechanisms: BTreeSet<String>,
    acl: Vec<SecurityContext>,
    owner: SecurityContext,
    /// `Some(username)` when the identity's username is plaintext and
    /// non-empty, so `process` can inject it into `session_data`.
    identity_username: Option<String>,
    proxy: Arc<Mutex<PluginProxy>>,
    started: bool,
}

impl AuthSession {
    /// Computes the allowed-mechanism set as the intersection of the
    /// proxy's advertised mechanisms and the identity's ACL-granted set
    /// for `method` (the identity's full advertised set, if it grants
    /// `"*"` or is new).
    pub fn new(id: u64, identity: &IdentityInfo, method: &str, proxy: Arc<Mutex<PluginProxy>>) -> Self {
        let advertised: BTreeSet<String> =
            proxy.lock().unwrap().advertised_mechanisms().iter().cloned().collect();
        let allowed_mechanisms = if identity.grants_all_mechanisms(method) {
            advertised
        } else {
            let granted = identity.granted_mechanisms(method).cloned().unwrap_or_default();
            advertised.intersection(&granted).cloned().collect()
        };
        let identity_username = (!identity.username_is_secret && !identity.username.is_empty())
            .then(|| identity.username.clone());

        AuthSession {
            id,
            method: method.to_string(),
            allowed_mechanisms,
            acl: identity.acl.clone(),
            owner: identity.owner.clone(),
            identity_username,
            proxy,
            started: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn allowed_mechanisms(&self) -> &BTreeSet<String> {
        &self.allowed_mechanisms
    }

    fn check_peer(&self, acl_mgr: &dyn AccessControlManager, peer_ctx: &SecurityContext) -> Result<()> {
        if acl_mgr.peer_is_owner(peer_ctx, &self.owner) || acl_mgr.peer_is_in_acl(peer_ctx, &self.acl) {
            Ok(())
        } else {
            Err(Error::PermissionDenied)
        }
    }

    pub fn query_available_mechanisms(
        &self,
        wanted: &[String],
        peer_ctx: &SecurityContext,
        acl_mgr: &dyn AccessControlManager,
    ) -> Result<Vec<String>> {
        self.check_peer(acl_mgr, peer_ctx)?;
        Ok(wanted.iter().filter(|m| self.allowed_mechanisms.contains(*m)).cloned().collect())
    }

    /// ACL-checks `peer_ctx`, rejects a `mechanism` outside the allowed
    /// set, injects the identity's plaintext username into `session_data`
    /// if the caller didn't supply one, and forwards to the proxy: the
    /// first call of a session's lifetime is `request_initial` (carrying
    /// `cache`), every later call is a plain `request` continuation.
    #[allow(clippy::too_many_arguments)]
    pub fn process(
        &mut self,
        mut session_data: MethodCache,
        mechanism: &str,
        peer_ctx: &SecurityContext,
        acl_mgr: &dyn AccessControlManager,
        cache: MethodCache,
        ready_cb: ReadyCallback,
        state_cb: StateCallback,
        store_cb: StoreCallback,
    ) -> Result<()> {
        self.check_peer(acl_mgr, peer_ctx)?;
        if !self.allowed_mechanisms.contains(mechanism) {
            return Err(Error::MechanismNotAvailable(mechanism.to_string()));
        }
        if !session_data.contains_key("username") {
            if let Some(username) = &self.identity_username {
                session_data.insert("username".to_string(), Value::Str(username.clone()));
            }
        }
        let request = if self.started {
            Request::Request { data: session_data }
        } else {
            self.started = true;
            Request::RequestInitial { data: session_data, cache, mechanism: mechanism.to_string() }
        };
        self.proxy.lock().unwrap().process(self.id, request, ready_cb, state_cb, store_cb)
    }

    pub fn cancel(&mut self, peer_ctx: &SecurityContext, acl_mgr: &dyn AccessControlManager) -> Result<()> {
        self.check_peer(acl_mgr, peer_ctx)?;
        self.proxy.lock().unwrap().cancel(self.id)
    }

    pub fn refresh(
        &mut self,
        ui_data: MethodCache,
        peer_ctx: &SecurityContext,
        acl_mgr: &dyn AccessControlManager,
        ready_cb: ReadyCallback,
        state_cb: StateCallback,
        store_cb: StoreCallback,
    ) -> Result<()> {
        self.check_peer(acl_mgr, peer_ctx)?;
        self.proxy.lock().unwrap().process(self.id, Request::Refresh { ui_data }, ready_cb, state_cb, store_cb)
    }

    pub fn user_action_finished(
        &mut self,
        ui_data: MethodCache,
        peer_ctx: &SecurityContext,
        acl_mgr: &dyn AccessControlManager,
        ready_cb: ReadyCallback,
        state_cb: StateCallback,
        store_cb: StoreCallback,
    ) -> Result<()> {
        self.check_peer(acl_mgr, peer_ctx)?;
        self.proxy
            .lock()
            .unwrap()
            .process(self.id, Request::UserActionFinished { ui_data }, ready_cb, state_cb, store_cb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_control::DefaultAccessControlManager;
    use crate::plugin::host::PluginWorker;
    use crate::plugin::protocol::Signal;

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

    fn ctx(sys: &str, app: &str) -> SecurityContext {
        SecurityContext::new(sys, app)
    }

    fn noop_state_cb() -> StateCallback {
        Box::new(|_, _| {})
    }
    fn noop_store_cb() -> StoreCallback {
        Box::new(|_| {})
    }

    fn proxy_with_mechanisms(mechanisms: Vec<&str>) -> Arc<Mutex<PluginProxy>> {
        Arc::new(Mutex::new(PluginProxy::new(
            Box::new(EchoWorker),
            mechanisms.into_iter().map(String::from).collect(),
            None,
        )))
    }

    #[test]
    fn test_new_identity_grants_all_proxy_mechanisms() {
        let proxy = proxy_with_mechanisms(vec!["password", "otp"]);
        let info = IdentityInfo::blank();
        let session = AuthSession::new(1, &info, "password", proxy);
        assert_eq!(session.allowed_mechanisms().len(), 2);
    }

    #[test]
    fn test_grant_intersection_restricts_mechanisms() {
        let proxy = proxy_with_mechanisms(vec!["password", "otp"]);
        let mut info = IdentityInfo { id: 7, ..Default::default() };
        info.methods.insert("password".into(), BTreeSet::from(["password".to_string()]));
        let session = AuthSession::new(1, &info, "password", proxy);
        assert_eq!(session.allowed_mechanisms(), &BTreeSet::from(["password".to_string()]));
    }

    #[test]
    fn test_query_available_mechanisms_denies_non_acl_peer() {
        let proxy = proxy_with_mechanisms(vec!["password"]);
        let mut info = IdentityInfo { id: 7, owner: ctx("sysA", "appA"), ..Default::default() };
        info.acl.push(ctx("sysA", "appA"));
        let session = AuthSession::new(1, &info, "password", proxy);
        let acl_mgr = DefaultAccessControlManager::new(ctx("*", "keychain"));
        let result = session.query_available_mechanisms(
            &["password".to_string()],
            &ctx("sysB", "appB"),
            &acl_mgr,
        );
        assert!(matches!(result, Err(Error::PermissionDenied)));
    }

    #[test]
    fn test_query_available_mechanisms_intersects_wanted() {
        let proxy = proxy_with_mechanisms(vec!["password"]);
        let mut info = IdentityInfo { id: 7, owner: ctx("sysA", "appA"), ..Default::default() };
        info.methods.insert("password".into(), BTreeSet::from(["password".to_string()]));
        let session = AuthSession::new(1, &info, "password", proxy);
        let acl_mgr = DefaultAccessControlManager::new(ctx("*", "keychain"));
        let result = session
            .query_available_mechanisms(
                &["password".to_string(), "otp".to_string()],
                &ctx("sysA", "appA"),
                &acl_mgr,
            )
            .unwrap();
        assert_eq!(result, vec!["password".to_string()]);
    }

    #[test]
    fn test_process_rejects_mechanism_not_allowed() {
        let proxy = proxy_with_mechanisms(vec!["password"]);
        let mut info = IdentityInfo { id: 7, owner: ctx("sysA", "appA"), ..Default::default() };
        info.methods.insert("password".into(), BTreeSet::from(["password".to_string()]));
        let mut session = AuthSession::new(1, &info, "password", proxy);
        let acl_mgr = DefaultAccessControlManager::new(ctx("*", "keychain"));
        let result = session.process(
            MethodCache::new(),
            "otp",
            &ctx("sysA", "appA"),
            &acl_mgr,
            MethodCache::new(),
            Box::new(|_| {}),
            noop_state_cb(),
            noop_store_cb(),
        );
        assert!(matches!(result, Err(Error::MechanismNotAvailable(_))));
    }

    #[test]
    fn test_process_injects_plaintext_username() {
        let proxy = proxy_with_mechanisms(vec!["password"]);
        let mut info = IdentityInfo {
            id: 7,
            username: "alice".into(),
            owner: ctx("sysA", "appA"),
            ..Default::default()
        };
        info.methods.insert("password".into(), BTreeSet::from(["password".to_string()]));
        let mut session = AuthSession::new(1, &info, "password", proxy.clone());
        let acl_mgr = DefaultAccessControlManager::new(ctx("*", "keychain"));

        struct CapturingWorker {
            captured: Arc<Mutex<Option<Request>>>,
        }
        impl PluginWorker for CapturingWorker {
            fn send(&mut self, request: &Request) -> Result<()> {
                *self.captured.lock().unwrap() = Some(request.clone());
                Ok(())
            }
            fn recv(&mut self) -> Result<Option<Signal>> {
                Ok(Some(Signal::ResponseFinal { data: MethodCache::new() }))
            }
            fn terminate(&mut self) {}
        }
        let captured = Arc::new(Mutex::new(None));
        *proxy.lock().unwrap() =
            PluginProxy::new(Box::new(CapturingWorker { captured: captured.clone() }), vec!["password".into()], None);

        session
            .process(
                MethodCache::new(),
                "password",
                &ctx("sysA", "appA"),
                &acl_mgr,
                MethodCache::new(),
                Box::new(|_| {}),
                noop_state_cb(),
                noop_store_cb(),
            )
            .unwrap();

        let req = captured.lock().unwrap().clone().unwrap();
        match req {
            Request::RequestInitial { data, .. } => {
                assert_eq!(data.get("username"), Some(&Value::Str("alice".to_string())));
            }
            other => panic!("expected RequestInitial, got {other:?}"),
        }
    }
}
