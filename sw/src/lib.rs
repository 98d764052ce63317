//! Swarmd - wave-scheduled swarm orchestrator for LLM coding agents
//!
//! Swarmd decomposes a natural-language task into a dependency DAG of
//! subtasks, dispatches them to bounded-concurrency workers backed by LLM
//! providers, judges their outputs, recovers from partial failures, and
//! synthesizes a final result under hard token/cost budgets.
//!
//! # Core concepts
//!
//! - **Waves**: the DAG is layered by longest path; a wave is the unit of
//!   review, checkpointing and breaker reset.
//! - **Single owner**: the orchestrator alone mutates the task queue;
//!   worker futures only report completions.
//! - **Recovery first**: retries with growing budgets, model failover,
//!   partial-dependency rescue, cascade-skip with a recovery window,
//!   circuit breakers, one mid-swarm replan, and a final rescue pass.
//! - **Honest completion**: quality gates and hollow-completion detection
//!   stand between a worker's "done" and `completed`.
//!
//! # Modules
//!
//! - [`domain`] - tasks, states, results
//! - [`llm`] - provider contract and the Anthropic client
//! - [`throttle`] - request throttle wrapping the shared provider
//! - [`queue`] - the DAG scheduler
//! - [`pool`] - bounded worker dispatch over the spawn boundary
//! - [`gate`] - quality gate
//! - [`orchestrator`] - the pipeline
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod budget;
pub mod cli;
pub mod config;
pub mod context;
pub mod domain;
pub mod events;
pub mod gate;
pub mod health;
pub mod llm;
pub mod orchestrator;
pub mod pool;
pub mod prompts;
pub mod queue;
pub mod state;
pub mod throttle;

// Re-export commonly used types
pub use budget::{BudgetPool, BudgetSnapshot};
pub use config::{ProbeFailureStrategy, ProviderConfig, SwarmConfig, ThrottleSettings, WorkerSpec};
pub use context::SharedContextEngine;
pub use domain::{
    FailureCause, PartialContext, RetryContext, SpawnResult, StructuredReport, Task, TaskResult, TaskState, TaskType,
    WorkerMetrics,
};
pub use events::{EventBus, SwarmEvent};
pub use gate::{QualityGate, QualityVerdict};
pub use health::{FailureKind, HealthRecord, HealthTracker};
pub use llm::{
    AnthropicProvider, ChatMessage, ChatRequest, ChatResponse, ProviderClient, ProviderError, RateLimitInfo,
    StopReason, TokenUsage, ToolChoice, ToolInvocation, ToolSpec, create_provider,
};
pub use orchestrator::{CancelHandle, Orchestrator, SwarmOutcome, TaskSummary, is_hollow};
pub use pool::{AgentDefinition, AgentSpawner, CommandSpawner, DispatchInfo, WorkerCompletion, WorkerPool};
pub use prompts::{PromptBuilder, PromptTier};
pub use queue::{
    FailureDisposition, FailureOutcome, QueueCheckpoint, QueuePolicy, StatusCounts, TaskQueue, assign_waves, validate,
};
pub use state::{Checkpoint, CheckpointStore, Decision, ExecutionPlan, SessionSummary, SwarmPhase, SwarmStats};
pub use throttle::{Throttle, ThrottledProvider};
