/*!

Runtime configuration, per spec §6.4. There is no configuration-file
format in scope; callers build a [Config] from whatever source (env,
CLI flags, an embedding application) fits their deployment and hand it
to [crate::store::credentials_db::CredentialsDatabase] and the plugin
host.

 */
use std::path::PathBuf;
use std::time::Duration;

use crate::context::SecurityContext;

/// Daemon-wide configuration, one instance shared by the whole process.
#[derive(Debug, Clone)]
pub struct Config {
    /// `Storage/Path`: directory holding `metadata.db` and `secret.db`.
    pub storage_path: PathBuf,
    /// `Storage/SecureDir`: sub-directory forced to mode 0700.
    pub secure_dir: PathBuf,
    /// `Plugin/Timeout`: proxy idle-eviction timeout; `None` disables.
    pub plugin_timeout: Option<Duration>,
    /// `Identity/Timeout`: identity auto-dispose timeout; `None` disables.
    pub identity_timeout: Option<Duration>,
    /// `AuthSession/Timeout`: session auto-dispose timeout; `None` disables.
    pub auth_session_timeout: Option<Duration>,
    /// `General/Keychain`: the system context granted bulk-clear access.
    pub keychain: SecurityContext,
    /// `General/PluginsDir`: where worker binaries live.
    pub plugins_dir: PathBuf,
    /// `General/LoadersDir`: where loader helpers (if any) live.
    pub loaders_dir: PathBuf,
    /// `General/Extension`: name of the access-control/storage backend to
    /// load; `"default"` uses the built-ins in this crate.
    pub extension: String,
    /// `Db/MaxDataStorage`: per-update `STORE` size ceiling, in bytes.
    pub max_data_storage: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage_path: PathBuf::from("/var/lib/signond"),
            secure_dir: PathBuf::from("/var/lib/signond/secure"),
            plugin_timeout: None,
            identity_timeout: None,
            auth_session_timeout: None,
            keychain: SecurityContext::new("*", "keychain"),
            plugins_dir: PathBuf::from("/usr/libexec/signond/plugins"),
            loaders_dir: PathBuf::from("/usr/libexec/signond/loaders"),
            extension: "default".to_string(),
            max_data_storage: crate::store::secret::DEFAULT_MAX_DATA_STORAGE,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata_db_path(&self) -> PathBuf {
        self.storage_path.join("metadata.db")
    }

    pub fn secret_db_path(&self) -> PathBuf {
        self.storage_path.join("secret.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts_disabled() {
        let cfg = Config::default();
        assert!(cfg.plugin_timeout.is_none());
        assert!(cfg.identity_timeout.is_none());
        assert!(cfg.auth_session_timeout.is_none());
    }

    #[test]
    fn test_db_paths_derived_from_storage_path() {
        let cfg = Config { storage_path: PathBuf::from("/tmp/signond-test"), ..Config::default() };
        assert_eq!(cfg.metadata_db_path(), PathBuf::from("/tmp/signond-test/metadata.db"));
        assert_eq!(cfg.secret_db_path(), PathBuf::from("/tmp/signond-test/secret.db"));
    }
}
