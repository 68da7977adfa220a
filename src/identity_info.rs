/*!

[IdentityInfo]: the descriptive record for one stored identity.

 */
use std::collections::{BTreeMap, BTreeSet};

use crate::context::SecurityContext;

/// Wildcard mechanism name meaning "all mechanisms the plugin advertises".
pub const ALL_MECHANISMS: &str = "*";

/// The descriptive record for one identity.
///
/// An id of `0` means the identity has never been persisted. Every
/// non-zero id is present in both the metadata store and (if
/// `store_secret` was set when it was written) the secret store.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IdentityInfo {
    pub id: u32,
    pub username: String,
    pub username_is_secret: bool,
    pub secret: String,
    pub store_secret: bool,
    pub caption: String,
    pub realms: BTreeSet<String>,
    pub methods: BTreeMap<String, BTreeSet<String>>,
    pub acl: Vec<SecurityContext>,
    pub owner: SecurityContext,
    pub validated: bool,
    pub type_: u32,
}

impl IdentityInfo {
    /// A blank identity, as handed to a client asking to create one.
    pub fn blank() -> Self {
        IdentityInfo::default()
    }

    pub fn is_new(&self) -> bool {
        self.id == 0
    }

    /// The mechanisms granted for `method`, per the identity's ACL.
    ///
    /// Returns `None` if the method isn't listed at all (nothing granted).
    pub fn granted_mechanisms(&self, method: &str) -> Option<&BTreeSet<String>> {
        self.methods.get(method)
    }

    /// True if the identity's grant for `method` is the wildcard (or the
    /// identity is new and so has no restrictions yet).
    pub fn grants_all_mechanisms(&self, method: &str) -> bool {
        self.is_new()
            || self
                .methods
                .get(method)
                .is_some_and(|set| set.contains(ALL_MECHANISMS))
    }
}
