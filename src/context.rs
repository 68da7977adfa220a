/*!

Security contexts: the two-part peer identifier used throughout ACL checks.

 */

/// A two-part identifier of a requester: a system-level component
/// (typically the absolute path of the peer's executable) and an
/// application-level tag supplied by the client.
///
/// Comparison between two contexts is ordinary string equality with one
/// wildcard rule: a field value of `"*"` matches any value in that field
/// of the other context. Matching is not symmetric in general usage
/// (an ACL entry is matched *against* a peer), but the wildcard rule
/// itself is symmetric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SecurityContext {
    pub system_ctx: String,
    pub app_ctx: String,
}

const WILDCARD: &str = "*";

fn field_matches(pattern: &str, value: &str) -> bool {
    pattern == WILDCARD || pattern == value
}

impl SecurityContext {
    pub fn new(system_ctx: impl Into<String>, app_ctx: impl Into<String>) -> Self {
        SecurityContext {
            system_ctx: system_ctx.into(),
            app_ctx: app_ctx.into(),
        }
    }

    /// Wildcard-aware match: true if every field of `self` matches the
    /// corresponding field of `other`, where a `"*"` field in either
    /// context matches anything in that field of the other.
    pub fn matches(&self, other: &SecurityContext) -> bool {
        (field_matches(&self.system_ctx, &other.system_ctx)
            || field_matches(&other.system_ctx, &self.system_ctx))
            && (field_matches(&self.app_ctx, &other.app_ctx)
                || field_matches(&other.app_ctx, &self.app_ctx))
    }
}
