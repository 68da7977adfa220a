/*!

The plaintext `(id, username, password)` triple held in the secret store.

 */

/// A credential as held by the secret store: an identity id paired with
/// a username and password. The password may be empty.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    pub id: u32,
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(id: u32, username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            id,
            username: username.into(),
            password: password.into(),
        }
    }
}
