/*!

[AccessControlManager]: resolves the identity of a connecting peer and
checks it against an identity's ACL/owner. See spec §4.4.

 */
use std::os::unix::io::RawFd;

use crate::context::SecurityContext;

/// Performs access-control checks using whatever system services are
/// available. The daemon can be configured to load a custom extension
/// providing its own implementation (`General/Extension`); this trait is
/// the seam that extension would implement. [DefaultAccessControlManager]
/// is the built-in used when `General/Extension` is `"default"`.
pub trait AccessControlManager: Send + Sync {
    /// Resolves the security context of a peer connected via `peer_fd` (a
    /// Unix-domain socket), carrying `app_ctx` through verbatim as the
    /// application-level half of the context.
    fn security_context_of_peer(&self, peer_fd: RawFd, app_ctx: &str) -> SecurityContext;

    /// True iff any entry in `acl` matches `peer_ctx` by the wildcard-aware
    /// equality of §3.
    fn peer_is_in_acl(&self, peer_ctx: &SecurityContext, acl: &[SecurityContext]) -> bool {
        acl.iter().any(|entry| entry.matches(peer_ctx))
    }

    /// True iff `peer_ctx` matches `owner_ctx`.
    fn peer_is_owner(&self, peer_ctx: &SecurityContext, owner_ctx: &SecurityContext) -> bool {
        owner_ctx.matches(peer_ctx)
    }

    /// Extension point called when a client tries to SET an ACL, to reject
    /// self-granted escalations. The default implementation always allows.
    fn acl_is_valid(&self, _peer_ctx: &SecurityContext, _acl: &[SecurityContext]) -> bool {
        true
    }

    /// The distinguished context allowed to perform bulk operations (e.g.
    /// clear all identities).
    fn keychain_context(&self) -> SecurityContext;
}

/// The built-in [AccessControlManager]: resolves peers via `SO_PEERCRED`
/// and `/proc/<pid>/exe`, as the daemon itself does.
pub struct DefaultAccessControlManager {
    keychain: SecurityContext,
}

impl DefaultAccessControlManager {
    pub fn new(keychain: SecurityContext) -> Self {
        DefaultAccessControlManager { keychain }
    }
}

impl AccessControlManager for DefaultAccessControlManager {
    fn security_context_of_peer(&self, peer_fd: RawFd, app_ctx: &str) -> SecurityContext {
        let system_ctx = peer_credentials(peer_fd)
            .and_then(executable_path_of)
            .unwrap_or_default();
        SecurityContext::new(system_ctx, app_ctx)
    }

    fn keychain_context(&self) -> SecurityContext {
        self.keychain.clone()
    }
}

/// Reads the remote pid off a `SO_PEERCRED` Unix-domain socket.
fn peer_credentials(fd: RawFd) -> Option<libc::pid_t> {
    let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 || cred.pid == 0 {
        return None;
    }
    Some(cred.pid)
}

fn executable_path_of(pid: libc::pid_t) -> Option<String> {
    let link = format!("/proc/{pid}/exe");
    std::fs::read_link(link)
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
}
