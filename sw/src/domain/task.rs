//! Task domain types
//!
//! A `Task` is a node in the dependency DAG. Its lifecycle is encoded as a
//! tagged `TaskState` with per-variant data so that, for example, reading a
//! result off a task that never completed is unrepresentable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::now_ms;
use super::result::TaskResult;

/// Classification of a task, driving capability mapping, prompt rules and
/// quality-gate strictness. Unknown strings round-trip via `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskType {
    Research,
    Analysis,
    Design,
    Implement,
    Test,
    Refactor,
    Review,
    Document,
    Integrate,
    Deploy,
    Merge,
    Custom(String),
}

impl TaskType {
    /// Action-oriented types are expected to touch the workspace; a
    /// "successful" run with zero tool calls is hollow for these.
    pub fn is_action_oriented(&self) -> bool {
        matches!(
            self,
            TaskType::Implement | TaskType::Test | TaskType::Refactor | TaskType::Integrate | TaskType::Deploy
        )
    }

    /// Whether concrete artifact checks (file existence, syntax sanity) apply
    pub fn is_code_type(&self) -> bool {
        matches!(
            self,
            TaskType::Implement | TaskType::Test | TaskType::Refactor | TaskType::Integrate | TaskType::Merge
        )
    }

    /// Default capability requirement for worker selection
    pub fn default_capability(&self) -> &'static str {
        match self {
            TaskType::Research | TaskType::Analysis => "research",
            TaskType::Design | TaskType::Review | TaskType::Document => "reasoning",
            _ => "code",
        }
    }
}

impl From<String> for TaskType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "research" => TaskType::Research,
            "analysis" => TaskType::Analysis,
            "design" => TaskType::Design,
            "implement" => TaskType::Implement,
            "test" => TaskType::Test,
            "refactor" => TaskType::Refactor,
            "review" => TaskType::Review,
            "document" => TaskType::Document,
            "integrate" => TaskType::Integrate,
            "deploy" => TaskType::Deploy,
            "merge" => TaskType::Merge,
            _ => TaskType::Custom(s),
        }
    }
}

impl From<TaskType> for String {
    fn from(t: TaskType) -> Self {
        t.to_string()
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::Research => write!(f, "research"),
            TaskType::Analysis => write!(f, "analysis"),
            TaskType::Design => write!(f, "design"),
            TaskType::Implement => write!(f, "implement"),
            TaskType::Test => write!(f, "test"),
            TaskType::Refactor => write!(f, "refactor"),
            TaskType::Review => write!(f, "review"),
            TaskType::Document => write!(f, "document"),
            TaskType::Integrate => write!(f, "integrate"),
            TaskType::Deploy => write!(f, "deploy"),
            TaskType::Merge => write!(f, "merge"),
            TaskType::Custom(s) => write!(f, "{}", s),
        }
    }
}

/// Why a task failed; selects the retry limit and the failover policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCause {
    RateLimited,
    SpendLimited,
    Timeout,
    Hollow,
    QualityRejected,
    WorkerError,
    DependencyFailure,
}

impl FailureCause {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, FailureCause::RateLimited | FailureCause::SpendLimited)
    }
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::RateLimited => write!(f, "rate-limited"),
            FailureCause::SpendLimited => write!(f, "spend-limited"),
            FailureCause::Timeout => write!(f, "timeout"),
            FailureCause::Hollow => write!(f, "hollow"),
            FailureCause::QualityRejected => write!(f, "quality-rejected"),
            FailureCause::WorkerError => write!(f, "worker-error"),
            FailureCause::DependencyFailure => write!(f, "dependency-failure"),
        }
    }
}

/// Task lifecycle state
///
/// `Dispatched` is a single-writer state: exactly one worker future owns the
/// task between dispatch and its terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting on dependencies
    Pending,
    /// Dependencies satisfied, eligible for dispatch
    Ready,
    /// Owned by a worker future
    Dispatched {
        worker: String,
        dispatched_at: DateTime<Utc>,
    },
    /// Finished successfully (quality gate passed or bypassed by policy)
    Completed { result: TaskResult },
    /// Exhausted retries or explicitly failed
    Failed { cause: FailureCause },
    /// Invalidated by an upstream failure
    Skipped { reason: String },
    /// Replaced by finer-grained subtasks; counts as satisfied for dependents
    Decomposed,
}

impl TaskState {
    /// Short status name for events and checkpoints
    pub fn name(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Dispatched { .. } => "dispatched",
            TaskState::Completed { .. } => "completed",
            TaskState::Failed { .. } => "failed",
            TaskState::Skipped { .. } => "skipped",
            TaskState::Decomposed => "decomposed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed { .. } | TaskState::Failed { .. } | TaskState::Skipped { .. } | TaskState::Decomposed
        )
    }

    /// Satisfies a dependent's dependency requirement
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, TaskState::Completed { .. } | TaskState::Decomposed)
    }

    pub fn is_failed_or_skipped(&self) -> bool {
        matches!(self, TaskState::Failed { .. } | TaskState::Skipped { .. })
    }
}

/// Immutable retry context attached to a task before its next attempt
///
/// Each retry produces a new record; previous contexts are never mutated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryContext {
    /// Attempt number this context was produced by (the failed one)
    pub attempt: u32,
    /// Feedback for the next attempt (judge feedback, trimmed output, or a
    /// "work faster" nudge after a timeout)
    pub previous_feedback: String,
    /// Quality score of the failed attempt, if judged
    pub previous_score: Option<u8>,
    /// Files the failed attempt touched
    pub previous_files: Vec<String>,
    /// The failed attempt was hollow; the retry prompt must demand an
    /// immediate tool call
    pub previous_was_hollow: bool,
    /// The failed attempt hit the timeout backstop
    pub previous_was_timeout: bool,
    /// Set when the whole wave failed and a fundamentally different approach
    /// is wanted
    pub all_failed_wave: bool,
}

/// Degraded-input record carried by tasks rescued under the
/// partial-dependency policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialContext {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub ratio: f64,
}

/// A node in the task DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stable string id (`st-0`, `fixup-…`, `replan-…`, `verify-fix-…`)
    pub id: String,

    /// What the worker is asked to do
    pub description: String,

    /// Task classification
    #[serde(rename = "type")]
    pub task_type: TaskType,

    /// Complexity estimate in [1, 10]
    pub complexity: u8,

    /// Files this task is expected to create or modify
    pub target_files: Vec<String>,

    /// Files the worker should read for context
    pub read_files: Vec<String>,

    /// Ids of tasks that must settle before this one runs
    pub dependencies: Vec<String>,

    /// Lifecycle state
    pub state: TaskState,

    /// DAG layer (1-based; fixups/replans join the wave current at creation)
    pub wave: u32,

    /// Number of failed attempts so far; monotone, never reset
    pub attempts: u32,

    /// Model pinned by failover (overrides capability-based selection)
    pub assigned_model: Option<String>,

    /// Non-blocking cooldown before the next dispatch (rate-limit retries).
    /// Monotonic-clock value; deliberately not checkpointed.
    #[serde(skip)]
    pub retry_after: Option<Instant>,

    /// Context for the next attempt; replaced whole on every retry
    pub retry_context: Option<RetryContext>,

    /// Two or more tasks transitively depend on this one
    pub is_foundation: bool,

    /// Rendered outputs of completed dependencies, injected into the prompt
    pub dependency_context: Option<String>,

    /// Present when the task was rescued despite failed dependencies
    pub partial_context: Option<PartialContext>,

    /// Escalated instructions for the final rescue pass
    pub rescue_context: Option<String>,

    /// For fixup/replan tasks: the task being repaired
    pub fixes_task_id: Option<String>,

    /// For fixup tasks: what to fix
    pub fix_instructions: Option<String>,

    /// Decomposer hint: safe to run alongside siblings
    pub parallelizable: bool,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl Task {
    /// Create a new task; state starts `Pending` and is promoted to `Ready`
    /// by the queue when dependencies are empty or satisfied.
    pub fn new(id: impl Into<String>, description: impl Into<String>, task_type: TaskType) -> Self {
        let now = now_ms();
        Self {
            id: id.into(),
            description: description.into(),
            task_type,
            complexity: 5,
            target_files: Vec::new(),
            read_files: Vec::new(),
            dependencies: Vec::new(),
            state: TaskState::Pending,
            wave: 1,
            attempts: 0,
            assigned_model: None,
            retry_after: None,
            retry_context: None,
            is_foundation: false,
            dependency_context: None,
            partial_context: None,
            rescue_context: None,
            fixes_task_id: None,
            fix_instructions: None,
            parallelizable: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: clamp and set complexity
    pub fn with_complexity(mut self, complexity: u8) -> Self {
        self.complexity = complexity.clamp(1, 10);
        self
    }

    /// Builder: set dependencies
    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Builder: set target files
    pub fn with_target_files(mut self, files: Vec<String>) -> Self {
        self.target_files = files;
        self
    }

    /// Builder: mark as a fix-up for another task
    pub fn as_fixup(mut self, fixes: impl Into<String>, instructions: impl Into<String>) -> Self {
        self.fixes_task_id = Some(fixes.into());
        self.fix_instructions = Some(instructions.into());
        self
    }

    pub fn set_state(&mut self, state: TaskState) {
        self.state = state;
        self.updated_at = now_ms();
    }

    /// Record a failed attempt; attempts only ever grow
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
        self.updated_at = now_ms();
    }

    /// Attach a fresh retry context (replacing, never mutating, the old one)
    pub fn set_retry_context(&mut self, ctx: RetryContext) {
        self.retry_context = Some(ctx);
        self.updated_at = now_ms();
    }

    /// Whether the retry cooldown has elapsed (no cooldown = dispatchable)
    pub fn cooldown_elapsed(&self, now: Instant) -> bool {
        match self.retry_after {
            Some(t) => now >= t,
            None => true,
        }
    }

    /// The completed result, if any
    pub fn result(&self) -> Option<&TaskResult> {
        match &self.state {
            TaskState::Completed { result } => Some(result),
            _ => None,
        }
    }

    pub fn status_name(&self) -> &'static str {
        self.state.name()
    }

    pub fn is_fixup(&self) -> bool {
        self.fixes_task_id.is_some() || super::id::is_fixup(&self.id)
    }
}
