//! Private keys for management host logins
//!
//! Keys are loaded once, when the executor is built, so a bad key path or an
//! unset variable stops the daemon at startup instead of failing every task.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use russh::keys::ssh_key::PrivateKey;
use russh::keys::{decode_secret_key, load_secret_key};
use tracing::debug;

/// Where the private key for a management host comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// OpenSSH private key on disk, mode 0600 or stricter
    Path(PathBuf),
    /// Defer to a running SSH agent
    Agent,
    /// Base64 of an OpenSSH private key, held in the named environment variable
    Env(String),
}

impl KeySource {
    /// Load the key into memory
    ///
    /// # Errors
    /// Returns `KeyError` if the file is missing, readable by group or other,
    /// or does not parse; or if the variable is unset or not base64.
    pub fn resolve(&self) -> Result<ResolvedKey, KeyError> {
        match self {
            KeySource::Agent => Ok(ResolvedKey::Agent),
            KeySource::Path(path) => {
                check_private(path)?;
                let key = load_secret_key(path, None)
                    .map_err(|e| KeyError::Unreadable(format!("{}: {e}", path.display())))?;
                debug!(path = %path.display(), algorithm = %key.algorithm(), "Loaded SSH key");
                Ok(ResolvedKey::Loaded(Arc::new(key)))
            }
            KeySource::Env(var) => {
                let encoded =
                    std::env::var(var).map_err(|_| KeyError::EnvNotSet(var.clone()))?;
                let pem = STANDARD
                    .decode(encoded.trim())
                    .map_err(|_| KeyError::InvalidBase64(var.clone()))?;
                let pem = String::from_utf8(pem)
                    .map_err(|_| KeyError::Unreadable(format!("${var} is not text")))?;
                let key = decode_secret_key(&pem, None)
                    .map_err(|e| KeyError::Unreadable(format!("${var}: {e}")))?;
                debug!(var = %var, algorithm = %key.algorithm(), "Loaded SSH key from environment");
                Ok(ResolvedKey::Loaded(Arc::new(key)))
            }
        }
    }
}

/// A key ready for authentication
#[derive(Clone)]
pub enum ResolvedKey {
    Loaded(Arc<PrivateKey>),
    Agent,
}

impl ResolvedKey {
    #[must_use]
    pub fn private_key(&self) -> Option<Arc<PrivateKey>> {
        match self {
            ResolvedKey::Loaded(key) => Some(key.clone()),
            ResolvedKey::Agent => None,
        }
    }
}

// never print key material
impl std::fmt::Debug for ResolvedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolvedKey::Loaded(key) => write!(f, "Loaded({})", key.algorithm()),
            ResolvedKey::Agent => f.write_str("Agent"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("environment variable {0} not set")]
    EnvNotSet(String),

    #[error("environment variable {0} is not valid base64")]
    InvalidBase64(String),

    #[error("{0} is readable by group or other, chmod 600 it")]
    TooOpen(String),

    #[error("cannot use key {0}")]
    Unreadable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(unix)]
fn check_private(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = std::fs::metadata(path)?.permissions().mode();
    if mode & 0o077 == 0 {
        Ok(())
    } else {
        Err(KeyError::TooOpen(path.display().to_string()))
    }
}

#[cfg(not(unix))]
fn check_private(path: &Path) -> Result<(), KeyError> {
    std::fs::metadata(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_carries_no_key() {
        let key = KeySource::Agent.resolve().unwrap();
        assert!(key.private_key().is_none());
        assert_eq!(format!("{key:?}"), "Agent");
    }

    #[test]
    fn test_unset_variable() {
        let source = KeySource::Env("ORTHOS_TEST_KEY_DOES_NOT_EXIST".to_string());
        assert!(matches!(source.resolve(), Err(KeyError::EnvNotSet(_))));
    }

    #[test]
    fn test_missing_key_file() {
        let source = KeySource::Path(PathBuf::from("/nonexistent/orthos/id_ed25519"));
        assert!(matches!(source.resolve(), Err(KeyError::Io(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_world_readable_key_is_refused() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("orthos-key-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("id_ed25519");
        std::fs::write(&path, "not a key").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let result = KeySource::Path(path.clone()).resolve();
        std::fs::remove_dir_all(&dir).unwrap();
        assert!(matches!(result, Err(KeyError::TooOpen(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_private_garbage_is_unreadable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("orthos-key-garbage-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("id_ed25519");
        std::fs::write(&path, "not a key").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();

        let result = KeySource::Path(path.clone()).resolve();
        std::fs::remove_dir_all(&dir).unwrap();
        assert!(matches!(result, Err(KeyError::Unreadable(_))));
    }
}
