use std::time::Duration;

use thiserror::Error;

/// Why a command never produced a [`crate::CommandResult`]
///
/// A command that ran and exited non-zero is not an error at this layer;
/// adapters read the exit status and output themselves.
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    #[error("cannot reach {host}: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("{host} refused login: {reason}")]
    LoginRefused { host: String, reason: String },

    #[error("SSH key error: {0}")]
    SshKeyError(String),

    #[error("command timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("failed to spawn process: {0}")]
    SpawnError(String),

    /// Channel or pipe broke while the command was running
    #[error("I/O error: {0}")]
    IoError(String),
}

impl ExecError {
    /// Whether the same command may succeed on a later attempt
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExecError::Unreachable { .. } | ExecError::Timeout { .. } | ExecError::IoError(_)
        )
    }
}

impl From<crate::keys::KeyError> for ExecError {
    fn from(e: crate::keys::KeyError) -> Self {
        ExecError::SshKeyError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_trouble_is_transient() {
        let unreachable = ExecError::Unreachable {
            host: "console.lab".into(),
            reason: "connection refused".into(),
        };
        assert!(unreachable.is_transient());
        assert!(ExecError::IoError("broken pipe".into()).is_transient());
        assert!(
            ExecError::Timeout {
                timeout: Duration::from_secs(1)
            }
            .is_transient()
        );
    }

    #[test]
    fn test_credentials_and_local_setup_are_permanent() {
        let refused = ExecError::LoginRefused {
            host: "console.lab".into(),
            reason: "publickey".into(),
        };
        assert!(!refused.is_transient());
        assert!(!ExecError::SshKeyError("missing".into()).is_transient());
        assert!(!ExecError::SpawnError("sh: not found".into()).is_transient());
    }

    #[test]
    fn test_messages_name_the_host() {
        let err = ExecError::LoginRefused {
            host: "install.lab".into(),
            reason: "publickey".into(),
        };
        assert_eq!(err.to_string(), "install.lab refused login: publickey");
    }
}
