//! WorkerPool - bounded-concurrency dispatcher over the spawn boundary
//!
//! Holds at most `max_concurrency` in-flight worker futures in a `JoinSet`.
//! Each dispatch derives budgets, renders the prompt, registers the agent
//! definition, races the spawn against a hard timeout (the worker's own
//! graceful timeout plus an outer backstop), and unregisters on the way
//! out. `wait_for_any` demultiplexes completions; a panicked worker future
//! resolves to an error result instead of poisoning the aggregate await.

mod budgets;
mod command;
mod registry;

pub use budgets::{DerivedBudgets, derive};
pub use command::CommandSpawner;
pub use registry::{AgentDefinition, AgentSpawner};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use eyre::{Result, bail};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::{SwarmConfig, WorkerSpec};
use crate::domain::{SpawnResult, Task};
use crate::health::HealthTracker;
use crate::prompts::PromptBuilder;

/// Added on top of the worker's own timeout to catch a wrapup that never
/// comes back
const OUTER_BACKSTOP: Duration = Duration::from_secs(60);

/// A finished worker run, demuxed by `wait_for_any`
#[derive(Debug)]
pub struct WorkerCompletion {
    pub task_id: String,
    pub agent_name: String,
    pub model: String,
    pub token_budget: u64,
    pub spawn: SpawnResult,
}

/// What a dispatch promised, for events and queue bookkeeping
#[derive(Debug, Clone)]
pub struct DispatchInfo {
    pub agent_name: String,
    pub model: String,
    pub token_budget: u64,
    pub timeout: Duration,
    pub prompt_tokens_estimate: u64,
}

struct WorkerMeta {
    task_id: String,
    agent_name: String,
    model: String,
    token_budget: u64,
}

/// The bounded worker dispatcher
pub struct WorkerPool {
    spawner: Arc<dyn AgentSpawner>,
    prompts: PromptBuilder,
    config: SwarmConfig,
    roster: Vec<WorkerSpec>,
    working_dir: String,
    join_set: JoinSet<WorkerCompletion>,
    meta: HashMap<tokio::task::Id, WorkerMeta>,
    active: HashSet<String>,
}

impl WorkerPool {
    pub fn new(spawner: Arc<dyn AgentSpawner>, config: SwarmConfig, working_dir: impl Into<String>) -> Result<Self> {
        let roster = config.worker_roster();
        Ok(Self {
            spawner,
            prompts: PromptBuilder::new()?,
            config,
            roster,
            working_dir: working_dir.into(),
            join_set: JoinSet::new(),
            meta: HashMap::new(),
            active: HashSet::new(),
        })
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn has_capacity(&self) -> bool {
        self.active.len() < self.config.swarm.max_concurrency
    }

    /// Ids of tasks currently owned by a live worker future
    pub fn active_task_ids(&self) -> HashSet<String> {
        self.active.clone()
    }

    /// All distinct models in the roster
    pub fn roster_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.roster.iter().map(|w| w.model.clone()).collect();
        models.sort();
        models.dedup();
        models
    }

    /// Pick a worker spec for a task: honor a pinned model first, then
    /// capability match with unhealthy models deprioritized
    pub fn select_worker(&self, task: &Task, health: &HealthTracker) -> WorkerSpec {
        if let Some(pinned) = &task.assigned_model
            && let Some(spec) = self.roster.iter().find(|w| &w.model == pinned)
        {
            return spec.clone();
        }

        let capability = self
            .config
            .task_type(&task.task_type.to_string())
            .capability
            .unwrap_or_else(|| task.task_type.default_capability().to_string());

        let candidates: Vec<&WorkerSpec> = self.roster.iter().filter(|w| w.supports(&capability)).collect();

        candidates
            .iter()
            .find(|w| health.is_healthy(&w.model))
            .or_else(|| candidates.first())
            .map(|w| (*w).clone())
            .unwrap_or_else(|| self.roster[0].clone())
    }

    /// Healthy alternative supporting the same capability, for failover
    pub fn alternative_worker(&self, task: &Task, current_model: &str, health: &HealthTracker) -> Option<WorkerSpec> {
        let capability = self
            .config
            .task_type(&task.task_type.to_string())
            .capability
            .unwrap_or_else(|| task.task_type.default_capability().to_string());

        self.roster
            .iter()
            .find(|w| w.model != current_model && w.supports(&capability) && health.is_healthy(&w.model))
            .cloned()
    }

    /// Dispatch a task to a worker. The returned info is what the caller
    /// needs for queue transitions and events; the run itself lands in
    /// `wait_for_any`.
    pub fn dispatch(&mut self, task: &Task, spec: &WorkerSpec, lessons: Vec<String>) -> Result<DispatchInfo> {
        if !self.has_capacity() {
            bail!(
                "Worker pool at capacity ({}/{})",
                self.active.len(),
                self.config.swarm.max_concurrency
            );
        }
        if self.active.contains(&task.id) {
            bail!("Task {} already owned by a worker", task.id);
        }

        let derived = budgets::derive(task, spec, &self.config);
        let prompt = self.prompts.build(task, derived.tier, &self.working_dir, lessons)?;
        let agent_name = format!("{}-{}-a{}", spec.name, task.id, task.attempts);

        let def = AgentDefinition {
            name: agent_name.clone(),
            description: format!("swarm worker for {} ({})", task.id, task.task_type),
            system_prompt: "You are a swarm worker agent. Complete exactly the subtask you are given, \
                 using tools for all real work, then report honestly."
                .to_string(),
            model: spec.model.clone(),
            max_token_budget: derived.token_budget,
            max_iterations: derived.max_iterations,
            timeout: derived.timeout,
            idle_timeout: self
                .config
                .task_type(&task.task_type.to_string())
                .idle_timeout_secs
                .map(Duration::from_secs),
            capabilities: spec.capabilities.clone(),
            task_type: task.task_type.to_string(),
            denied_tools: self.config.tools.global_denied_tools.clone(),
            doom_loop_threshold: self.config.economics.doom_loop_threshold,
        };

        let info = DispatchInfo {
            agent_name: agent_name.clone(),
            model: spec.model.clone(),
            token_budget: derived.token_budget,
            timeout: derived.timeout,
            prompt_tokens_estimate: (prompt.len() / 4) as u64,
        };

        let spawner = self.spawner.clone();
        let task_id = task.id.clone();
        let model = spec.model.clone();
        let token_budget = derived.token_budget;
        let outer_timeout = derived.timeout + OUTER_BACKSTOP;

        debug!(
            task_id = %task_id,
            agent = %agent_name,
            model = %model,
            token_budget,
            timeout_secs = derived.timeout.as_secs(),
            "dispatching worker"
        );

        let handle = self.join_set.spawn(async move {
            let spawn = run_worker(spawner, def, &agent_name, &prompt, outer_timeout).await;
            WorkerCompletion {
                task_id,
                agent_name,
                model,
                token_budget,
                spawn,
            }
        });

        self.meta.insert(
            handle.id(),
            WorkerMeta {
                task_id: task.id.clone(),
                agent_name: info.agent_name.clone(),
                model: info.model.clone(),
                token_budget,
            },
        );
        self.active.insert(task.id.clone());

        Ok(info)
    }

    /// Await the next completion. Worker panics and join errors convert to
    /// resolved error results so one bad future cannot poison the rest.
    pub async fn wait_for_any(&mut self) -> Option<WorkerCompletion> {
        loop {
            match self.join_set.join_next_with_id().await? {
                Ok((id, completion)) => {
                    self.meta.remove(&id);
                    self.active.remove(&completion.task_id);
                    return Some(completion);
                }
                Err(join_err) => {
                    let id = join_err.id();
                    let Some(meta) = self.meta.remove(&id) else {
                        warn!(error = %join_err, "worker future failed with no metadata");
                        continue;
                    };
                    self.active.remove(&meta.task_id);
                    warn!(task_id = %meta.task_id, error = %join_err, "worker future crashed");
                    return Some(WorkerCompletion {
                        task_id: meta.task_id,
                        agent_name: meta.agent_name,
                        model: meta.model,
                        token_budget: meta.token_budget,
                        spawn: SpawnResult::spawn_error(format!("worker future crashed: {}", join_err)),
                    });
                }
            }
        }
    }

    /// Request cancellation of everything in flight and wait out a short
    /// grace window before aborting what remains
    pub async fn cancel_all(&mut self, grace: Duration) {
        for meta in self.meta.values() {
            self.spawner.request_cancel(&meta.agent_name).await;
        }

        let deadline = tokio::time::Instant::now() + grace;
        while !self.join_set.is_empty() {
            match tokio::time::timeout_at(deadline, self.join_set.join_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    warn!(remaining = self.join_set.len(), "grace window elapsed; aborting workers");
                    self.join_set.abort_all();
                    while self.join_set.join_next().await.is_some() {}
                    break;
                }
            }
        }

        self.meta.clear();
        self.active.clear();
    }
}

async fn run_worker(
    spawner: Arc<dyn AgentSpawner>,
    def: AgentDefinition,
    agent_name: &str,
    prompt: &str,
    outer_timeout: Duration,
) -> SpawnResult {
    if let Err(e) = spawner.register(def).await {
        return SpawnResult::spawn_error(format!("agent registration failed: {}", e));
    }

    let started = tokio::time::Instant::now();
    let spawn = match tokio::time::timeout(outer_timeout, spawner.spawn(agent_name, prompt)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => SpawnResult::spawn_error(e.to_string()),
        Err(_) => SpawnResult::timed_out(started.elapsed().as_millis() as u64),
    };

    if let Err(e) = spawner.unregister(agent_name).await {
        warn!(agent = %agent_name, error = %e, "agent unregistration failed");
    }

    spawn
}
