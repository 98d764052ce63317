//! Subprocess spawner
//!
//! Bridges the spawn boundary to an external agent runtime binary: the
//! registered definition travels in an environment variable, the task
//! prompt on stdin, and the agent reports a `SpawnResult` as the last JSON
//! line on stdout. Anything else the process prints is treated as plain
//! output.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use eyre::{Context, Result, bail};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::registry::{AgentDefinition, AgentSpawner};
use crate::domain::{SpawnResult, WorkerMetrics};

/// Environment variable carrying the serialized agent definition
const DEF_ENV: &str = "SWARM_AGENT_DEF";

/// Spawns worker agents as subprocesses of a configured command
pub struct CommandSpawner {
    command: Vec<String>,
    definitions: Arc<Mutex<HashMap<String, AgentDefinition>>>,
}

impl CommandSpawner {
    /// `command` is the agent runtime invocation, e.g. `["swarm-agent"]`;
    /// the agent name is appended as the final argument
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.is_empty() {
            bail!("spawner command must not be empty");
        }
        Ok(Self {
            command,
            definitions: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

#[async_trait]
impl AgentSpawner for CommandSpawner {
    async fn register(&self, def: AgentDefinition) -> Result<()> {
        debug!(agent = %def.name, model = %def.model, "registering agent definition");
        self.definitions.lock().await.insert(def.name.clone(), def);
        Ok(())
    }

    async fn spawn(&self, name: &str, task_prompt: &str) -> Result<SpawnResult> {
        let def = self
            .definitions
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| eyre::eyre!("no registered agent named {}", name))?;

        let def_json = serde_json::to_string(&def).context("failed to serialize agent definition")?;

        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .arg(name)
            .env(DEF_ENV, def_json)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().context("failed to spawn agent process")?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(task_prompt.as_bytes())
                .await
                .context("failed to write task prompt")?;
            drop(stdin);
        }

        let output = child.wait_with_output().await.context("agent process failed")?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        Ok(parse_spawn_output(&stdout, &stderr, output.status.success()))
    }

    async fn unregister(&self, name: &str) -> Result<()> {
        self.definitions.lock().await.remove(name);
        Ok(())
    }
}

/// Extract the agent's SpawnResult report from its stdout
///
/// The agent runtime is expected to print a JSON SpawnResult as its last
/// line; a process that prints something else still yields a usable (if
/// metric-less) result rather than an error.
fn parse_spawn_output(stdout: &str, stderr: &str, exit_ok: bool) -> SpawnResult {
    if let Some(line) = stdout.lines().rev().find(|l| l.trim_start().starts_with('{'))
        && let Ok(result) = serde_json::from_str::<SpawnResult>(line)
    {
        return result;
    }

    if !exit_ok {
        warn!("agent process exited nonzero without a structured report");
        return SpawnResult::spawn_error(format!("agent process failed: {}", stderr.chars().take(500).collect::<String>()));
    }

    SpawnResult {
        success: true,
        output: stdout.to_string(),
        metrics: WorkerMetrics::default(),
        structured: None,
        files_modified: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_structured_report() {
        let stdout = format!(
            "some progress chatter\n{}\n",
            serde_json::json!({
                "success": true,
                "output": "built the module",
                "metrics": {"tokens": 1234, "duration_ms": 5000, "tool_calls": 9},
                "files_modified": ["src/lib.rs"]
            })
        );
        let result = parse_spawn_output(&stdout, "", true);
        assert!(result.success);
        assert_eq!(result.metrics.tokens, 1234);
        assert_eq!(result.files_modified.as_deref(), Some(&["src/lib.rs".to_string()][..]));
    }

    #[test]
    fn test_parse_plain_output() {
        let result = parse_spawn_output("just prose, no json\n", "", true);
        assert!(result.success);
        assert_eq!(result.metrics.tool_calls, 0);
        assert!(result.output.contains("just prose"));
    }

    #[test]
    fn test_parse_failed_process() {
        let result = parse_spawn_output("", "kaboom", false);
        assert!(!result.success);
        assert!(result.output.contains("kaboom"));
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(CommandSpawner::new(vec![]).is_err());
    }
}
