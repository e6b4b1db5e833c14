use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exit status and captured output of one command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// Exit code; `-1` when the process died on a signal or the remote side
    /// closed without reporting one
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandResult {
    pub(crate) fn from_bytes(
        status: i32,
        stdout: &[u8],
        stderr: &[u8],
        duration: Duration,
    ) -> Self {
        Self {
            status,
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
            duration,
        }
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// stdout followed by stderr, for messages shown to users
    ///
    /// `ipmitool` and `conserver` tooling report some errors on stdout and
    /// some on stderr, so adapters match against both.
    #[must_use]
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(stdout: &str, stderr: &str) -> CommandResult {
        CommandResult::from_bytes(0, stdout.as_bytes(), stderr.as_bytes(), Duration::ZERO)
    }

    #[test]
    fn test_combined_output() {
        assert_eq!(
            result("Chassis Power is on", "").combined_output(),
            "Chassis Power is on"
        );
        assert_eq!(
            result("", "Unable to establish IPMI v2 / RMCP+ session").combined_output(),
            "Unable to establish IPMI v2 / RMCP+ session"
        );
        assert_eq!(result("a", "b").combined_output(), "a\nb");
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let result = CommandResult::from_bytes(1, b"ok\xff", b"", Duration::ZERO);
        assert!(!result.success());
        assert_eq!(result.stdout, "ok\u{fffd}");
    }
}
