//! Reachability probers

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orthos_exec::RemoteExecutor;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::template::shell_quote;
use crate::traits::Prober;
use crate::types::{ProbeOutcome, Target};

/// ICMP echo via the system `ping`
pub struct PingProber {
    executor: Arc<dyn RemoteExecutor>,
    timeout: Duration,
}

impl PingProber {
    pub fn new(executor: Arc<dyn RemoteExecutor>, timeout: Duration) -> Self {
        Self { executor, timeout }
    }
}

#[async_trait]
impl Prober for PingProber {
    async fn probe(&self, target: &Target) -> ProbeOutcome {
        let wait = self.timeout.as_secs().max(1);
        let cmd = format!("ping -c 1 -W {wait} {}", shell_quote(&target.fqdn));

        // leave the command a little headroom over ping's own deadline
        match self
            .executor
            .run_with_timeout(&cmd, self.timeout + Duration::from_secs(1))
            .await
        {
            Ok(result) if result.success() => ProbeOutcome::reachable(),
            Ok(result) => {
                let output = result.combined_output();
                let detail = output
                    .lines()
                    .rev()
                    .find(|l| !l.trim().is_empty())
                    .unwrap_or("no echo reply")
                    .trim()
                    .to_string();
                debug!(machine = %target.machine_id, detail = %detail, "ping failed");
                ProbeOutcome::unreachable(detail)
            }
            Err(e) => ProbeOutcome::unreachable(e.to_string()),
        }
    }

    fn method(&self) -> &'static str {
        "ping"
    }
}

/// TCP connect to a well-known port (ssh by default)
pub struct TcpProber {
    port: u16,
    timeout: Duration,
}

impl TcpProber {
    #[must_use]
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, target: &Target) -> ProbeOutcome {
        match timeout(self.timeout, TcpStream::connect((target.fqdn.as_str(), self.port))).await {
            Ok(Ok(_)) => ProbeOutcome::reachable(),
            Ok(Err(e)) => ProbeOutcome::unreachable(format!("port {}: {e}", self.port)),
            Err(_) => ProbeOutcome::unreachable(format!(
                "port {}: no answer within {:?}",
                self.port, self.timeout
            )),
        }
    }

    fn method(&self) -> &'static str {
        "tcp"
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::testing::{ScriptedExecutor, failed, ok};

    #[tokio::test]
    async fn test_ping_reply() {
        let exec = Arc::new(ScriptedExecutor::new().on("ping", Ok(ok("1 received"))));
        let prober = PingProber::new(exec.clone(), Duration::from_secs(2));

        let outcome = prober.probe(&Target::new("m1", "m1.lab")).await;

        assert!(outcome.reachable);
        assert_eq!(exec.commands(), vec!["ping -c 1 -W 2 m1.lab"]);
    }

    #[tokio::test]
    async fn test_ping_loss_reports_last_line() {
        let exec = Arc::new(ScriptedExecutor::new().on(
            "ping",
            Ok(failed(1, "1 packets transmitted, 0 received, 100% packet loss\n")),
        ));
        let prober = PingProber::new(exec, Duration::from_secs(2));

        let outcome = prober.probe(&Target::new("m1", "m1.lab")).await;

        assert_eq!(
            outcome,
            ProbeOutcome::unreachable("1 packets transmitted, 0 received, 100% packet loss")
        );
    }

    #[tokio::test]
    async fn test_tcp_probe_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let prober = TcpProber::new(port, Duration::from_secs(1));

        let outcome = prober.probe(&Target::new("local", "127.0.0.1")).await;

        assert!(outcome.reachable);
    }

    #[tokio::test]
    async fn test_tcp_probe_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let prober = TcpProber::new(port, Duration::from_secs(1));

        let outcome = prober.probe(&Target::new("local", "127.0.0.1")).await;

        assert!(!outcome.reachable);
        assert!(outcome.detail.is_some());
    }
}
