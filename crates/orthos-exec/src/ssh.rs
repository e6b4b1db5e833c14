//! Commands run on a management host over SSH
//!
//! The serial console concentrator and the provisioning server are reached
//! this way. One session per host is opened on first use and reused.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::keys::PrivateKeyWithHashAlg;
use russh::keys::ssh_key::{HashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect, client};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::ExecError;
use crate::keys::{KeySource, ResolvedKey};
use crate::result::CommandResult;
use crate::traits::RemoteExecutor;

/// Address and login of a management host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
}

fn default_port() -> u16 {
    22
}

impl ConnectionInfo {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            user: user.into(),
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

impl std::fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Accepts any host key; management hosts are reinstalled often
struct TrustingHandler {
    host: String,
}

impl client::Handler for TrustingHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, key: &PublicKey) -> Result<bool, Self::Error> {
        debug!(
            host = %self.host,
            fingerprint = %key.fingerprint(HashAlg::Sha256),
            "Accepting host key"
        );
        Ok(true)
    }
}

type Session = client::Handle<TrustingHandler>;

/// SSH executor bound to one management host
///
/// Commands from different tasks share the session and run one at a time.
/// Any failure mid-command drops the session; the next command reconnects.
pub struct SshExecutor {
    target: ConnectionInfo,
    key: ResolvedKey,
    default_timeout: Duration,
    session: Mutex<Option<Session>>,
}

impl SshExecutor {
    /// Load the key and prepare the executor without connecting
    ///
    /// # Errors
    /// Returns `ExecError::SshKeyError` if the key cannot be loaded
    pub fn new(target: ConnectionInfo, key_source: &KeySource) -> Result<Self, ExecError> {
        Ok(Self {
            target,
            key: key_source.resolve()?,
            default_timeout: Duration::from_secs(120),
            session: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.target
    }

    fn unreachable(&self, reason: impl ToString) -> ExecError {
        ExecError::Unreachable {
            host: self.target.host.clone(),
            reason: reason.to_string(),
        }
    }

    fn refused(&self, reason: impl ToString) -> ExecError {
        ExecError::LoginRefused {
            host: self.target.host.clone(),
            reason: reason.to_string(),
        }
    }

    async fn open(&self) -> Result<Session, ExecError> {
        let Some(key) = self.key.private_key() else {
            return Err(self.refused("agent authentication is not supported, configure a key"));
        };

        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(600)),
            keepalive_interval: Some(Duration::from_secs(30)),
            ..client::Config::default()
        });
        let handler = TrustingHandler {
            host: self.target.host.clone(),
        };
        let address = (self.target.host.as_str(), self.target.port);
        let mut session = client::connect(config, address, handler)
            .await
            .map_err(|e| self.unreachable(e))?;

        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .map_err(|e| self.unreachable(e))?
            .flatten();
        let auth = session
            .authenticate_publickey(&self.target.user, PrivateKeyWithHashAlg::new(key, hash_alg))
            .await
            .map_err(|e| self.unreachable(e))?;
        if !auth.success() {
            return Err(self.refused("public key rejected"));
        }

        info!(target = %self.target, "SSH session opened");
        Ok(session)
    }

    async fn exec(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        let mut slot = self.session.lock().await;
        let session = match slot.take() {
            Some(session) if !session.is_closed() => session,
            _ => self.open().await?,
        };

        let started = Instant::now();
        let (status, stdout, stderr) = read_command(&session, cmd).await?;
        // only a session that completed a command goes back in the slot
        *slot = Some(session);

        let result = CommandResult::from_bytes(status, &stdout, &stderr, started.elapsed());
        debug!(
            host = %self.target.host,
            command = %cmd,
            status = result.status,
            duration = ?result.duration,
            "Remote command finished"
        );
        Ok(result)
    }

    /// Close the session if one is open
    ///
    /// # Errors
    /// Returns `ExecError::IoError` if the disconnect message cannot be sent
    pub async fn disconnect(&self) -> Result<(), ExecError> {
        if let Some(session) = self.session.lock().await.take() {
            session
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
                .map_err(|e| ExecError::IoError(e.to_string()))?;
            info!(target = %self.target, "SSH session closed");
        }
        Ok(())
    }
}

/// Run `cmd` on a fresh channel and collect output until the channel closes
async fn read_command(session: &Session, cmd: &str) -> Result<(i32, Vec<u8>, Vec<u8>), ExecError> {
    let io = |e: russh::Error| ExecError::IoError(e.to_string());
    let mut channel = session.channel_open_session().await.map_err(io)?;
    channel.exec(true, cmd).await.map_err(io)?;

    let mut status = -1;
    let (mut stdout, mut stderr) = (Vec::new(), Vec::new());
    // exit-status may follow EOF, so read until the channel is gone
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
            ChannelMsg::ExitStatus { exit_status } => {
                status = i32::try_from(exit_status).unwrap_or(-1);
            }
            ChannelMsg::Close => break,
            _ => {}
        }
    }
    Ok((status, stdout, stderr))
}

impl std::fmt::Debug for SshExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshExecutor")
            .field("target", &self.target)
            .field("key", &self.key)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        self.run_with_timeout(cmd, self.default_timeout).await
    }

    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        // a timed out exec drops its session, so the next command reconnects
        tokio::time::timeout(timeout, self.exec(cmd))
            .await
            .unwrap_or_else(|_| {
                warn!(
                    host = %self.target.host,
                    command = %cmd,
                    ?timeout,
                    "Remote command timed out"
                );
                Err(ExecError::Timeout { timeout })
            })
    }

    fn executor_type(&self) -> &'static str {
        "ssh"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_info() {
        let info = ConnectionInfo::new("console.lab.example.com", "orthos");
        assert_eq!(info.port, 22);
        let info = info.with_port(2222);
        assert_eq!(info.to_string(), "orthos@console.lab.example.com:2222");
    }

    #[test]
    fn test_port_defaults_when_deserialized() {
        let info: ConnectionInfo =
            serde_json::from_str(r#"{"host":"install.lab","user":"root"}"#).unwrap();
        assert_eq!(info, ConnectionInfo::new("install.lab", "root"));
    }

    #[test]
    fn test_new_does_not_connect() {
        let executor = SshExecutor::new(
            ConnectionInfo::new("console.lab.example.com", "orthos"),
            &KeySource::Agent,
        )
        .unwrap();
        assert_eq!(executor.connection_info().host, "console.lab.example.com");
        assert_eq!(executor.executor_type(), "ssh");
    }

    #[test]
    fn test_bad_key_fails_construction() {
        let err = SshExecutor::new(
            ConnectionInfo::new("console.lab.example.com", "orthos"),
            &KeySource::Env("ORTHOS_TEST_SSH_KEY_UNSET".to_string()),
        )
        .unwrap_err();
        assert!(matches!(err, ExecError::SshKeyError(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_agent_login_is_refused_permanently() {
        let executor = SshExecutor::new(
            ConnectionInfo::new("127.0.0.1", "orthos").with_port(1),
            &KeySource::Agent,
        )
        .unwrap();

        let err = executor.run("true").await.unwrap_err();
        assert!(matches!(err, ExecError::LoginRefused { .. }));
        assert!(!err.is_transient());
    }
}
