//! Agent spawn boundary
//!
//! The worker agent's internal loop is someone else's problem: the pool
//! registers a definition under a unique per-task name, spawns it with a
//! task prompt, and unregisters it after completion. Implementations of
//! `AgentSpawner` bridge to the actual agent runtime.

use async_trait::async_trait;
use eyre::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::SpawnResult;

/// Definition registered for one worker run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Unique per-task agent name (worker, task id and attempt)
    pub name: String,

    /// Human-readable purpose
    pub description: String,

    /// System prompt (persona and standing rules live in the task prompt;
    /// this stays stable per worker spec)
    pub system_prompt: String,

    /// Model the agent runs on
    pub model: String,

    /// Token ceiling for the whole run
    pub max_token_budget: u64,

    /// Iteration ceiling for the agent's internal loop
    pub max_iterations: u32,

    /// The agent's own graceful timeout (the pool backstops it)
    #[serde(with = "duration_secs")]
    pub timeout: Duration,

    /// Optional idle timeout
    #[serde(default, with = "opt_duration_secs")]
    pub idle_timeout: Option<Duration>,

    /// Capabilities this run exercises
    pub capabilities: Vec<String>,

    /// Task type name, for runtime-side policy
    pub task_type: String,

    /// Tools denied to this agent
    pub denied_tools: Vec<String>,

    /// Consecutive no-progress iterations before self-abort
    pub doom_loop_threshold: u32,
}

/// External worker runtime contract
#[async_trait]
pub trait AgentSpawner: Send + Sync {
    /// Register an agent definition under its unique name
    async fn register(&self, def: AgentDefinition) -> Result<()>;

    /// Run the named agent against a task prompt to completion
    async fn spawn(&self, name: &str, task_prompt: &str) -> Result<SpawnResult>;

    /// Drop the registration after completion
    async fn unregister(&self, name: &str) -> Result<()>;

    /// Ask in-flight runs to stop (cancellation); best-effort
    async fn request_cancel(&self, _name: &str) {}
}

mod duration_secs {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

mod opt_duration_secs {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<u64>::deserialize(d)?;
        Ok(secs.map(Duration::from_secs))
    }
}
