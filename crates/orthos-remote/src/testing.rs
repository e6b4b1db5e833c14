//! Scripted executor for adapter tests

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use orthos_exec::{CommandResult, ExecError, RemoteExecutor};

type Reply = Result<CommandResult, ExecError>;

/// Answers commands by the first matching substring rule and records them
pub struct ScriptedExecutor {
    rules: Vec<(String, Reply)>,
    fallback: Reply,
    pub commands: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            fallback: Ok(ok("")),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn on(mut self, needle: &str, reply: Reply) -> Self {
        self.rules.push((needle.to_string(), reply));
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

pub fn ok(stdout: &str) -> CommandResult {
    CommandResult {
        status: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
        duration: Duration::from_millis(1),
    }
}

pub fn failed(status: i32, stderr: &str) -> CommandResult {
    CommandResult {
        status,
        stdout: String::new(),
        stderr: stderr.to_string(),
        duration: Duration::from_millis(1),
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn run(&self, cmd: &str) -> Reply {
        self.commands.lock().unwrap().push(cmd.to_string());
        self.rules
            .iter()
            .find(|(needle, _)| cmd.contains(needle.as_str()))
            .map_or_else(|| self.fallback.clone(), |(_, reply)| reply.clone())
    }

    async fn run_with_timeout(&self, cmd: &str, _timeout: Duration) -> Reply {
        self.run(cmd).await
    }

    fn executor_type(&self) -> &'static str {
        "scripted"
    }
}
