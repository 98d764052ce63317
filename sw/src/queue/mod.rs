//! TaskQueue - the DAG scheduler
//!
//! Owns every task's lifecycle: wave layering, readiness promotion, retry
//! bookkeeping with cause-dependent limits, cascade-skip with an explicit
//! two-phase disposition (so recovery gets a window before a failure
//! invalidates its dependents), partial-dependency rescue, stale-dispatch
//! reconciliation and checkpoint round-trips.
//!
//! The queue is owned by the orchestrator and mutated only from its loop;
//! worker futures never touch it.

mod context;
mod graph;

pub use context::{build_full_context, build_partial_context, truncate_output};
pub use graph::{assign_waves, direct_dependents, transitive_dependents, validate};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

use eyre::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{FailureCause, PartialContext, RetryContext, Task, TaskResult, TaskState};

/// Retry and rescue policy, derived from configuration
#[derive(Debug, Clone)]
pub struct QueuePolicy {
    pub worker_retries: u32,
    pub rate_limit_retries: u32,
    pub fixup_retries: u32,
    pub retry_base_delay: Duration,
    pub partial_dependency_threshold: f64,
    pub dependency_context_max_length: usize,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            worker_retries: 2,
            rate_limit_retries: 3,
            fixup_retries: 2,
            retry_base_delay: Duration::from_millis(1_000),
            partial_dependency_threshold: 1.0,
            dependency_context_max_length: 1_500,
        }
    }
}

/// Cap on the non-blocking rate-limit cooldown
const MAX_RETRY_COOLDOWN: Duration = Duration::from_secs(30);

/// Whether a failure immediately invalidates dependents or recovery gets a
/// window first (completed by an explicit `trigger_cascade_skip`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Walk dependents now
    Cascade,
    /// Hold the walk; the caller will trigger it if recovery is abandoned
    Defer,
}

/// What `record_failure` decided
#[derive(Debug, Clone)]
pub enum FailureOutcome {
    /// The task went back to ready for another attempt
    Retry { attempts: u32, cooldown: Option<Duration> },
    /// The task is terminally failed; `skipped` lists cascaded dependents
    /// (empty when the cascade was deferred)
    Failed { skipped: Vec<String> },
}

/// Status tally across the queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub ready: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub decomposed: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.ready + self.dispatched + self.completed + self.failed + self.skipped + self.decomposed
    }

    pub fn terminal(&self) -> usize {
        self.completed + self.failed + self.skipped + self.decomposed
    }
}

/// Serializable queue view for checkpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueCheckpoint {
    pub tasks: Vec<Task>,
    pub waves: BTreeMap<u32, Vec<String>>,
    pub current_wave: u32,
}

/// The DAG scheduler
pub struct TaskQueue {
    tasks: HashMap<String, Task>,
    /// Insertion order; dispatch iteration is FIFO within a wave
    order: Vec<String>,
    current_wave: u32,
    policy: QueuePolicy,
}

impl TaskQueue {
    pub fn new(policy: QueuePolicy) -> Self {
        Self {
            tasks: HashMap::new(),
            order: Vec::new(),
            current_wave: 1,
            policy,
        }
    }

    /// Load the decomposed task set: validate the DAG, layer waves, promote
    /// root tasks to ready
    pub fn load(&mut self, tasks: Vec<Task>) -> Result<()> {
        graph::validate(&tasks)?;

        let waves = graph::assign_waves(&tasks);
        for mut task in tasks {
            task.wave = waves.get(&task.id).copied().unwrap_or(1);
            self.order.push(task.id.clone());
            self.tasks.insert(task.id.clone(), task);
        }
        self.current_wave = 1;
        self.refresh_ready();

        info!(
            tasks = self.order.len(),
            waves = self.max_wave(),
            "task queue loaded"
        );
        Ok(())
    }

    // === Accessors ===

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Mutable task access for orchestrator-side annotations (assigned
    /// model, retry context, rescue context)
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    /// Tasks in insertion order
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    pub fn current_wave(&self) -> u32 {
        self.current_wave
    }

    pub fn max_wave(&self) -> u32 {
        self.tasks.values().map(|t| t.wave).max().unwrap_or(1)
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in self.tasks.values() {
            match task.state {
                TaskState::Pending => counts.pending += 1,
                TaskState::Ready => counts.ready += 1,
                TaskState::Dispatched { .. } => counts.dispatched += 1,
                TaskState::Completed { .. } => counts.completed += 1,
                TaskState::Failed { .. } => counts.failed += 1,
                TaskState::Skipped { .. } => counts.skipped += 1,
                TaskState::Decomposed => counts.decomposed += 1,
            }
        }
        counts
    }

    /// Every task is in a terminal state
    pub fn all_settled(&self) -> bool {
        self.tasks.values().all(|t| t.state.is_terminal())
    }

    /// Every task at or below `wave` is terminal
    pub fn wave_settled(&self, wave: u32) -> bool {
        self.tasks.values().filter(|t| t.wave <= wave).all(|t| t.state.is_terminal())
    }

    /// Ids of tasks in a wave, insertion-ordered
    pub fn wave_members(&self, wave: u32) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.tasks.get(*id).map(|t| t.wave == wave).unwrap_or(false))
            .cloned()
            .collect()
    }

    /// Ready tasks in the given wave, insertion-ordered (FIFO dispatch)
    pub fn ready_in_wave(&self, wave: u32) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                self.tasks
                    .get(*id)
                    .map(|t| t.wave == wave && matches!(t.state, TaskState::Ready))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Ready tasks irrespective of wave (opportunistic cross-wave dispatch)
    pub fn all_ready(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                self.tasks
                    .get(*id)
                    .map(|t| matches!(t.state, TaskState::Ready))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Smallest remaining cooldown among ready tasks, if every ready task
    /// is cooling down
    pub fn earliest_cooldown(&self, now: Instant) -> Option<Duration> {
        let mut any_dispatchable = false;
        let mut earliest: Option<Duration> = None;
        for task in self.tasks.values() {
            if !matches!(task.state, TaskState::Ready) {
                continue;
            }
            match task.retry_after {
                Some(t) if t > now => {
                    let remaining = t - now;
                    earliest = Some(earliest.map_or(remaining, |e| e.min(remaining)));
                }
                _ => any_dispatchable = true,
            }
        }
        if any_dispatchable { None } else { earliest }
    }

    // === Transitions ===

    /// Ready → Dispatched. The task becomes single-writer property of the
    /// named worker future.
    pub fn mark_dispatched(&mut self, id: &str, worker: &str) -> Result<()> {
        let task = self.tasks.get_mut(id).ok_or_else(|| eyre::eyre!("Unknown task id: {}", id))?;
        match task.state {
            TaskState::Ready => {
                task.set_state(TaskState::Dispatched {
                    worker: worker.to_string(),
                    dispatched_at: chrono::Utc::now(),
                });
                task.retry_after = None;
                Ok(())
            }
            ref other => bail!("Cannot dispatch task {} from state {}", id, other.name()),
        }
    }

    /// Dispatched → Completed. Promotes dependents that become eligible;
    /// returns their ids.
    pub fn mark_completed(&mut self, id: &str, result: TaskResult) -> Result<Vec<String>> {
        let task = self.tasks.get_mut(id).ok_or_else(|| eyre::eyre!("Unknown task id: {}", id))?;
        match task.state {
            TaskState::Dispatched { .. } => {
                task.set_state(TaskState::Completed { result });
                debug!(task_id = %id, "task completed");
                Ok(self.refresh_ready())
            }
            ref other => bail!("Cannot complete task {} from state {}", id, other.name()),
        }
    }

    /// Record a worker failure. Returns whether the task retries (with an
    /// optional cooldown) or is terminally failed (with cascaded skips,
    /// unless the disposition defers them).
    pub fn record_failure(
        &mut self,
        id: &str,
        cause: FailureCause,
        disposition: FailureDisposition,
    ) -> Result<FailureOutcome> {
        let policy = self.policy.clone();
        let task = self.tasks.get_mut(id).ok_or_else(|| eyre::eyre!("Unknown task id: {}", id))?;
        if !matches!(task.state, TaskState::Dispatched { .. }) {
            bail!("Cannot fail task {} from state {}", id, task.state.name());
        }

        task.record_attempt();
        let attempts = task.attempts;
        let limit = retry_limit(task, cause, &policy);

        if attempts <= limit {
            task.set_state(TaskState::Ready);
            let cooldown = if cause.is_rate_limit() {
                let delay = policy
                    .retry_base_delay
                    .saturating_mul(2u32.saturating_pow(attempts.saturating_sub(1)))
                    .min(MAX_RETRY_COOLDOWN);
                task.retry_after = Some(Instant::now() + delay);
                Some(delay)
            } else {
                None
            };
            debug!(task_id = %id, attempts, limit, ?cause, "task requeued for retry");
            return Ok(FailureOutcome::Retry { attempts, cooldown });
        }

        task.set_state(TaskState::Failed { cause });
        warn!(task_id = %id, attempts, ?cause, "task terminally failed");

        let skipped = match disposition {
            FailureDisposition::Cascade => self.trigger_cascade_skip(id),
            FailureDisposition::Defer => Vec::new(),
        };
        // A terminal failure can still unlock partial-rescue dependents
        self.refresh_ready();
        Ok(FailureOutcome::Failed { skipped })
    }

    /// Walk forward from a failed task, skipping every transitive dependent
    /// the partial-dependency threshold cannot save. Returns skipped ids.
    pub fn trigger_cascade_skip(&mut self, id: &str) -> Vec<String> {
        let dependents_map = self.dependents_map();
        let mut skipped = Vec::new();
        let mut frontier = vec![id.to_string()];
        let mut visited: HashSet<String> = HashSet::new();

        while let Some(node) = frontier.pop() {
            for dep_id in dependents_map.get(&node).cloned().unwrap_or_default() {
                if !visited.insert(dep_id.clone()) {
                    continue;
                }
                let Some(task) = self.tasks.get(&dep_id) else { continue };
                if !matches!(task.state, TaskState::Pending | TaskState::Ready) {
                    continue;
                }
                if self.best_case_ratio(&dep_id) < self.policy.partial_dependency_threshold {
                    let reason = format!("dependency {} failed", node);
                    if let Some(task) = self.tasks.get_mut(&dep_id) {
                        task.set_state(TaskState::Skipped { reason });
                    }
                    debug!(task_id = %dep_id, via = %node, "cascade-skipped");
                    skipped.push(dep_id.clone());
                    frontier.push(dep_id);
                }
            }
        }

        self.refresh_ready();
        skipped
    }

    /// Restore skipped tasks whose full dependency set is now satisfied
    /// (walks forward from `id`). Returns restored ids.
    pub fn un_skip_dependents(&mut self, id: &str) -> Vec<String> {
        let dependents_map = self.dependents_map();
        let candidates = graph::transitive_dependents(id, &dependents_map);

        let mut restored = Vec::new();
        for cand in candidates {
            let Some(task) = self.tasks.get(&cand) else { continue };
            if !matches!(task.state, TaskState::Skipped { .. }) {
                continue;
            }
            let all_satisfied = task
                .dependencies
                .iter()
                .all(|d| self.tasks.get(d).map(|t| t.state.satisfies_dependency()).unwrap_or(false));
            if all_satisfied {
                if let Some(task) = self.tasks.get_mut(&cand) {
                    task.set_state(TaskState::Ready);
                    task.partial_context = None;
                }
                restored.push(cand);
            }
        }

        if !restored.is_empty() {
            info!(count = restored.len(), from = %id, "un-skipped dependents");
            self.attach_contexts(&restored);
        }
        restored
    }

    /// Append fix-up tasks; they join the current wave
    pub fn add_fixup_tasks(&mut self, tasks: Vec<Task>) -> Result<()> {
        self.append_wave_joining(tasks)
    }

    /// Append replan tasks; dependencies must reference existing settled
    /// tasks, and they join the current wave
    pub fn add_replan_tasks(&mut self, tasks: Vec<Task>) -> Result<()> {
        for task in &tasks {
            for dep in &task.dependencies {
                let Some(existing) = self.tasks.get(dep) else {
                    bail!("Replan task {} references unknown dependency {}", task.id, dep);
                };
                if !existing.state.satisfies_dependency() {
                    bail!(
                        "Replan task {} depends on {} which is {} (must be completed)",
                        task.id,
                        dep,
                        existing.state.name()
                    );
                }
            }
        }
        self.append_wave_joining(tasks)
    }

    fn append_wave_joining(&mut self, tasks: Vec<Task>) -> Result<()> {
        for mut task in tasks {
            if self.tasks.contains_key(&task.id) {
                bail!("Duplicate task id: {}", task.id);
            }
            task.wave = self.current_wave;
            self.order.push(task.id.clone());
            self.tasks.insert(task.id.clone(), task);
        }
        self.refresh_ready();
        Ok(())
    }

    /// Reset a terminally failed/skipped task for the final rescue pass.
    /// Requires every dependency satisfied; attaches the escalated context.
    pub fn reset_for_rescue(&mut self, id: &str, rescue_context: String) -> bool {
        let Some(task) = self.tasks.get(id) else { return false };
        if !task.state.is_failed_or_skipped() {
            return false;
        }
        let all_satisfied = task
            .dependencies
            .iter()
            .all(|d| self.tasks.get(d).map(|t| t.state.satisfies_dependency()).unwrap_or(false));
        if !all_satisfied {
            return false;
        }
        if let Some(task) = self.tasks.get_mut(id) {
            task.set_state(TaskState::Ready);
            task.rescue_context = Some(rescue_context);
            task.retry_after = None;
        }
        self.attach_contexts(&[id.to_string()]);
        true
    }

    /// Requeue terminally failed tasks of a wave after an all-failed wave,
    /// with a retry context demanding a different approach
    pub fn requeue_failed_in_wave(&mut self, wave: u32) -> Vec<String> {
        let ids: Vec<String> = self
            .order
            .iter()
            .filter(|id| {
                self.tasks
                    .get(*id)
                    .map(|t| t.wave == wave && matches!(t.state, TaskState::Failed { .. }))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        for id in &ids {
            if let Some(task) = self.tasks.get_mut(id) {
                let attempt = task.attempts;
                task.set_state(TaskState::Ready);
                task.set_retry_context(RetryContext {
                    attempt,
                    previous_feedback: "Every task in this wave failed. Take a fundamentally different approach \
                                        from the previous attempt."
                        .to_string(),
                    all_failed_wave: true,
                    ..Default::default()
                });
            }
        }
        ids
    }

    /// Reset dispatched tasks that have outlived `stale_after` without a
    /// live worker reference. Returns the reconciled ids.
    pub fn reconcile_stale_dispatched(&mut self, stale_after: Duration, active: &HashSet<String>) -> Vec<String> {
        let now = chrono::Utc::now();
        let stale_ms = stale_after.as_millis() as i64;
        let worker_retries = self.policy.worker_retries;

        let mut reconciled = Vec::new();
        for id in self.order.clone() {
            let Some(task) = self.tasks.get_mut(&id) else { continue };
            let TaskState::Dispatched { dispatched_at, .. } = &task.state else {
                continue;
            };
            let dispatched_at = *dispatched_at;
            if active.contains(&id) {
                continue;
            }
            if (now - dispatched_at).num_milliseconds() >= stale_ms {
                warn!(task_id = %id, "reconciling stale dispatched task");
                task.set_state(TaskState::Ready);
                task.attempts = task.attempts.min(worker_retries.saturating_sub(1));
                reconciled.push(id);
            }
        }
        reconciled
    }

    /// Advance to the next wave that still has unsettled tasks
    pub fn advance_wave(&mut self) -> Option<u32> {
        let max = self.max_wave();
        let mut wave = self.current_wave + 1;
        while wave <= max {
            let unsettled = self
                .tasks
                .values()
                .any(|t| t.wave == wave && !t.state.is_terminal());
            if unsettled {
                self.current_wave = wave;
                return Some(wave);
            }
            wave += 1;
        }
        None
    }

    /// Retry limit the queue would apply to this task for this cause
    /// (lets the orchestrator detect last-allowed attempts)
    pub fn retry_limit_for(&self, id: &str, cause: FailureCause) -> u32 {
        self.tasks
            .get(id)
            .map(|t| retry_limit(t, cause, &self.policy))
            .unwrap_or(0)
    }

    // === Checkpointing ===

    pub fn checkpoint(&self) -> QueueCheckpoint {
        let mut waves: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        for id in &self.order {
            if let Some(task) = self.tasks.get(id) {
                waves.entry(task.wave).or_default().push(id.clone());
            }
        }
        QueueCheckpoint {
            tasks: self.order.iter().filter_map(|id| self.tasks.get(id)).cloned().collect(),
            waves,
            current_wave: self.current_wave,
        }
    }

    /// Replace queue contents from a checkpoint. Dispatched tasks are reset
    /// to ready: no worker survives a restart.
    pub fn restore_from_checkpoint(&mut self, checkpoint: QueueCheckpoint) {
        self.tasks.clear();
        self.order.clear();
        for mut task in checkpoint.tasks {
            if matches!(task.state, TaskState::Dispatched { .. }) {
                task.set_state(TaskState::Ready);
            }
            self.order.push(task.id.clone());
            self.tasks.insert(task.id.clone(), task);
        }
        self.current_wave = checkpoint.current_wave;
        self.refresh_ready();
    }

    // === Internals ===

    fn dependents_map(&self) -> HashMap<String, Vec<String>> {
        let mut out: HashMap<String, Vec<String>> = HashMap::new();
        for task in self.tasks.values() {
            for dep in &task.dependencies {
                out.entry(dep.clone()).or_default().push(task.id.clone());
            }
        }
        out
    }

    /// Completed deps / all deps
    fn satisfied_ratio(&self, id: &str) -> f64 {
        let Some(task) = self.tasks.get(id) else { return 0.0 };
        if task.dependencies.is_empty() {
            return 1.0;
        }
        let satisfied = task
            .dependencies
            .iter()
            .filter(|d| self.tasks.get(*d).map(|t| t.state.satisfies_dependency()).unwrap_or(false))
            .count();
        satisfied as f64 / task.dependencies.len() as f64
    }

    /// Ratio this task could still reach if every non-failed dep completed
    fn best_case_ratio(&self, id: &str) -> f64 {
        let Some(task) = self.tasks.get(id) else { return 0.0 };
        if task.dependencies.is_empty() {
            return 1.0;
        }
        let doomed = task
            .dependencies
            .iter()
            .filter(|d| self.tasks.get(*d).map(|t| t.state.is_failed_or_skipped()).unwrap_or(true))
            .count();
        (task.dependencies.len() - doomed) as f64 / task.dependencies.len() as f64
    }

    /// Promote pending tasks whose dependencies allow it; attaches
    /// dependency contexts. Never skips (that is the cascade's job).
    /// Returns newly promoted ids.
    fn refresh_ready(&mut self) -> Vec<String> {
        let threshold = self.policy.partial_dependency_threshold;
        let mut promoted = Vec::new();

        for id in self.order.clone() {
            let Some(task) = self.tasks.get(&id) else { continue };
            if !matches!(task.state, TaskState::Pending) {
                continue;
            }

            let all_satisfied = task
                .dependencies
                .iter()
                .all(|d| self.tasks.get(d).map(|t| t.state.satisfies_dependency()).unwrap_or(false));

            if all_satisfied {
                if let Some(task) = self.tasks.get_mut(&id) {
                    task.set_state(TaskState::Ready);
                }
                promoted.push(id);
                continue;
            }

            // Partial rescue: every dep terminal, enough of them completed
            let all_terminal = task
                .dependencies
                .iter()
                .all(|d| self.tasks.get(d).map(|t| t.state.is_terminal()).unwrap_or(false));
            if !all_terminal {
                continue;
            }
            let ratio = self.satisfied_ratio(&id);
            if ratio >= threshold && ratio > 0.0 {
                let (succeeded, failed): (Vec<String>, Vec<String>) = {
                    let task = &self.tasks[&id];
                    let succeeded = task
                        .dependencies
                        .iter()
                        .filter(|d| self.tasks.get(*d).map(|t| t.state.satisfies_dependency()).unwrap_or(false))
                        .cloned()
                        .collect();
                    let failed = task
                        .dependencies
                        .iter()
                        .filter(|d| self.tasks.get(*d).map(|t| t.state.is_failed_or_skipped()).unwrap_or(false))
                        .cloned()
                        .collect();
                    (succeeded, failed)
                };
                if let Some(task) = self.tasks.get_mut(&id) {
                    task.set_state(TaskState::Ready);
                    task.partial_context = Some(PartialContext {
                        succeeded,
                        failed,
                        ratio,
                    });
                }
                promoted.push(id);
            }
        }

        self.attach_contexts(&promoted);
        promoted
    }

    /// Build dependency contexts for newly ready tasks
    fn attach_contexts(&mut self, ids: &[String]) {
        let max_len = self.policy.dependency_context_max_length;
        for id in ids {
            let Some(task) = self.tasks.get(id) else { continue };
            let dep_outputs: Vec<(String, String)> = task
                .dependencies
                .iter()
                .filter_map(|d| {
                    self.tasks
                        .get(d)
                        .and_then(|t| t.result().map(|r| (d.clone(), r.output.clone())))
                })
                .collect();

            let ctx = match &task.partial_context {
                Some(partial) => Some(context::build_partial_context(partial, &dep_outputs, max_len)),
                None => context::build_full_context(&dep_outputs, max_len),
            };

            if let Some(task) = self.tasks.get_mut(id) {
                task.dependency_context = ctx;
            }
        }
    }
}

/// Retry limit for a task given the failure cause
fn retry_limit(task: &Task, cause: FailureCause, policy: &QueuePolicy) -> u32 {
    if cause.is_rate_limit() {
        policy.rate_limit_retries
    } else if task.is_foundation {
        policy.worker_retries + 1
    } else if task.is_fixup() {
        policy.fixup_retries
    } else {
        policy.worker_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskType;

    fn result_ok(output: &str) -> TaskResult {
        TaskResult {
            success: true,
            output: output.to_string(),
            tokens_used: 100,
            cost_used: 0.01,
            duration_ms: 50,
            model: "test-model".to_string(),
            tool_calls: 3,
            files_modified: vec![],
            findings: vec![],
            quality_score: None,
            quality_feedback: None,
            closure_report: None,
            budget_utilization: None,
        }
    }

    fn task(id: &str, deps: &[&str]) -> Task {
        Task::new(id, format!("task {}", id), TaskType::Implement)
            .with_dependencies(deps.iter().map(|s| s.to_string()).collect())
    }

    fn queue_with(tasks: Vec<Task>, threshold: f64) -> TaskQueue {
        let mut queue = TaskQueue::new(QueuePolicy {
            partial_dependency_threshold: threshold,
            ..Default::default()
        });
        queue.load(tasks).unwrap();
        queue
    }

    fn drive_to_completed(queue: &mut TaskQueue, id: &str) {
        queue.mark_dispatched(id, "w").unwrap();
        queue.mark_completed(id, result_ok(&format!("output of {}", id))).unwrap();
    }

    fn drive_to_failed(queue: &mut TaskQueue, id: &str, disposition: FailureDisposition) -> FailureOutcome {
        loop {
            queue.mark_dispatched(id, "w").unwrap();
            match queue.record_failure(id, FailureCause::WorkerError, disposition).unwrap() {
                FailureOutcome::Retry { .. } => continue,
                outcome @ FailureOutcome::Failed { .. } => return outcome,
            }
        }
    }

    #[test]
    fn test_load_promotes_roots() {
        let queue = queue_with(vec![task("a", &[]), task("b", &["a"])], 1.0);
        assert_eq!(queue.get("a").unwrap().status_name(), "ready");
        assert_eq!(queue.get("b").unwrap().status_name(), "pending");
        assert_eq!(queue.get("b").unwrap().wave, 2);
    }

    #[test]
    fn test_completion_promotes_dependents_with_context() {
        let mut queue = queue_with(vec![task("a", &[]), task("b", &["a"])], 1.0);
        drive_to_completed(&mut queue, "a");

        let b = queue.get("b").unwrap();
        assert_eq!(b.status_name(), "ready");
        assert!(b.dependency_context.as_ref().unwrap().contains("output of a"));
    }

    #[test]
    fn test_retry_then_terminal_failure() {
        let mut queue = queue_with(vec![task("a", &[])], 1.0);

        // worker_retries = 2: attempts 1 and 2 retry, attempt 3 is terminal
        queue.mark_dispatched("a", "w").unwrap();
        let outcome = queue
            .record_failure("a", FailureCause::WorkerError, FailureDisposition::Cascade)
            .unwrap();
        assert!(matches!(outcome, FailureOutcome::Retry { attempts: 1, .. }));

        queue.mark_dispatched("a", "w").unwrap();
        let outcome = queue
            .record_failure("a", FailureCause::WorkerError, FailureDisposition::Cascade)
            .unwrap();
        assert!(matches!(outcome, FailureOutcome::Retry { attempts: 2, .. }));

        queue.mark_dispatched("a", "w").unwrap();
        let outcome = queue
            .record_failure("a", FailureCause::WorkerError, FailureDisposition::Cascade)
            .unwrap();
        assert!(matches!(outcome, FailureOutcome::Failed { .. }));
        assert_eq!(queue.get("a").unwrap().attempts, 3);
    }

    #[test]
    fn test_rate_limit_retry_sets_cooldown() {
        let mut queue = queue_with(vec![task("a", &[])], 1.0);
        queue.mark_dispatched("a", "w").unwrap();
        let outcome = queue
            .record_failure("a", FailureCause::RateLimited, FailureDisposition::Cascade)
            .unwrap();
        match outcome {
            FailureOutcome::Retry { cooldown, .. } => {
                assert!(cooldown.is_some());
                assert!(cooldown.unwrap() <= MAX_RETRY_COOLDOWN);
            }
            _ => panic!("expected retry"),
        }
        assert!(queue.get("a").unwrap().retry_after.is_some());
    }

    #[test]
    fn test_strict_cascade_chain() {
        let mut queue = queue_with(
            vec![task("root", &[]), task("child", &["root"]), task("grandchild", &["child"])],
            1.0,
        );

        let outcome = drive_to_failed(&mut queue, "root", FailureDisposition::Cascade);
        let FailureOutcome::Failed { skipped } = outcome else {
            panic!("expected terminal failure")
        };

        assert_eq!(queue.get("root").unwrap().status_name(), "failed");
        assert_eq!(queue.get("child").unwrap().status_name(), "skipped");
        assert_eq!(queue.get("grandchild").unwrap().status_name(), "skipped");
        assert_eq!(skipped.len(), 2);
    }

    #[test]
    fn test_deferred_cascade_two_phase() {
        let mut queue = queue_with(vec![task("root", &[]), task("child", &["root"])], 1.0);

        let outcome = drive_to_failed(&mut queue, "root", FailureDisposition::Defer);
        let FailureOutcome::Failed { skipped } = outcome else {
            panic!("expected terminal failure")
        };
        assert!(skipped.is_empty());

        // Recovery window: dependents untouched
        assert_eq!(queue.get("child").unwrap().status_name(), "pending");

        // Recovery abandoned: explicit trigger completes the walk
        let skipped = queue.trigger_cascade_skip("root");
        assert_eq!(skipped, vec!["child".to_string()]);
        assert_eq!(queue.get("child").unwrap().status_name(), "skipped");
    }

    #[test]
    fn test_partial_rescue_merge() {
        let mut queue = queue_with(
            vec![
                task("a", &[]),
                task("b", &[]),
                task("c", &[]),
                task("merge", &["a", "b", "c"]),
            ],
            0.5,
        );

        drive_to_completed(&mut queue, "a");
        drive_to_completed(&mut queue, "b");
        drive_to_failed(&mut queue, "c", FailureDisposition::Cascade);

        let merge = queue.get("merge").unwrap();
        assert_eq!(merge.status_name(), "ready");
        let partial = merge.partial_context.as_ref().unwrap();
        assert_eq!(partial.succeeded, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(partial.failed, vec!["c".to_string()]);
        assert!((partial.ratio - 2.0 / 3.0).abs() < 1e-9);

        let ctx = merge.dependency_context.as_ref().unwrap();
        assert!(ctx.contains("degraded inputs"));
        assert!(ctx.contains("output of a"));
        assert!(ctx.contains("output of b"));
    }

    #[test]
    fn test_cascade_spares_salvageable_merge_midway() {
        // c fails while a and b are still pending: merge must not be skipped
        // because its best case (2/3) clears the 0.5 threshold
        let mut queue = queue_with(
            vec![
                task("a", &[]),
                task("b", &[]),
                task("c", &[]),
                task("merge", &["a", "b", "c"]),
            ],
            0.5,
        );

        drive_to_failed(&mut queue, "c", FailureDisposition::Cascade);
        assert_eq!(queue.get("merge").unwrap().status_name(), "pending");

        drive_to_completed(&mut queue, "a");
        drive_to_completed(&mut queue, "b");
        assert_eq!(queue.get("merge").unwrap().status_name(), "ready");
    }

    #[test]
    fn test_un_skip_dependents() {
        let mut queue = queue_with(vec![task("root", &[]), task("child", &["root"])], 1.0);
        drive_to_failed(&mut queue, "root", FailureDisposition::Cascade);
        assert_eq!(queue.get("child").unwrap().status_name(), "skipped");

        // Pretend a rescue completed root after all
        queue.reset_for_rescue("root", "try again with a smaller scope".to_string());
        drive_to_completed(&mut queue, "root");

        let restored = queue.un_skip_dependents("root");
        assert_eq!(restored, vec!["child".to_string()]);
        let child = queue.get("child").unwrap();
        assert_eq!(child.status_name(), "ready");
        assert!(child.dependency_context.is_some());
    }

    #[test]
    fn test_un_skip_leaves_unsatisfied_skips() {
        let mut queue = queue_with(
            vec![task("r1", &[]), task("r2", &[]), task("join", &["r1", "r2"])],
            1.0,
        );
        drive_to_failed(&mut queue, "r1", FailureDisposition::Cascade);
        drive_to_failed(&mut queue, "r2", FailureDisposition::Cascade);
        assert_eq!(queue.get("join").unwrap().status_name(), "skipped");

        queue.reset_for_rescue("r1", "rescue".to_string());
        drive_to_completed(&mut queue, "r1");

        // r2 still failed: join must stay skipped
        assert!(queue.un_skip_dependents("r1").is_empty());
        assert_eq!(queue.get("join").unwrap().status_name(), "skipped");
    }

    #[test]
    fn test_fixup_joins_current_wave() {
        let mut queue = queue_with(vec![task("a", &[]), task("b", &["a"])], 1.0);
        drive_to_completed(&mut queue, "a");
        queue.advance_wave();
        assert_eq!(queue.current_wave(), 2);

        let fixup = Task::new("fixup-a-0", "fix a", TaskType::Implement).as_fixup("a", "patch the parser");
        queue.add_fixup_tasks(vec![fixup]).unwrap();

        let f = queue.get("fixup-a-0").unwrap();
        assert_eq!(f.wave, 2);
        assert_eq!(f.status_name(), "ready");
    }

    #[test]
    fn test_replan_validates_dependencies() {
        let mut queue = queue_with(vec![task("a", &[]), task("b", &["a"])], 1.0);
        drive_to_completed(&mut queue, "a");

        // Depending on a completed task is fine
        let ok = Task::new("replan-0", "new work", TaskType::Implement)
            .with_dependencies(vec!["a".to_string()]);
        assert!(queue.add_replan_tasks(vec![ok]).is_ok());

        // Depending on an unsettled task is rejected
        let bad = Task::new("replan-1", "other work", TaskType::Implement)
            .with_dependencies(vec!["b".to_string()]);
        assert!(queue.add_replan_tasks(vec![bad]).is_err());
    }

    #[test]
    fn test_reconcile_stale_dispatched() {
        let mut queue = queue_with(vec![task("a", &[])], 1.0);
        queue.mark_dispatched("a", "w").unwrap();

        // Live worker: untouched
        let mut active = HashSet::new();
        active.insert("a".to_string());
        assert!(queue.reconcile_stale_dispatched(Duration::ZERO, &active).is_empty());

        // No live worker, zero threshold: reconciled to ready
        let reconciled = queue.reconcile_stale_dispatched(Duration::ZERO, &HashSet::new());
        assert_eq!(reconciled, vec!["a".to_string()]);
        let a = queue.get("a").unwrap();
        assert_eq!(a.status_name(), "ready");
        assert!(a.attempts <= 1);
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let mut queue = queue_with(vec![task("a", &[]), task("b", &["a"]), task("c", &["b"])], 1.0);
        drive_to_completed(&mut queue, "a");
        queue.mark_dispatched("b", "w").unwrap();
        queue.advance_wave();

        let checkpoint = queue.checkpoint();
        let json = serde_json::to_string(&checkpoint).unwrap();
        let parsed: QueueCheckpoint = serde_json::from_str(&json).unwrap();

        let mut restored = TaskQueue::new(QueuePolicy::default());
        restored.restore_from_checkpoint(parsed);

        assert_eq!(restored.len(), 3);
        assert_eq!(restored.current_wave(), 2);
        assert_eq!(restored.get("a").unwrap().status_name(), "completed");
        // Dispatched tasks come back as ready: no worker survives a restart
        assert_eq!(restored.get("b").unwrap().status_name(), "ready");
        assert_eq!(restored.get("c").unwrap().status_name(), "pending");
    }

    #[test]
    fn test_advance_wave_skips_settled_waves() {
        let mut queue = queue_with(vec![task("a", &[]), task("b", &["a"]), task("c", &["b"])], 1.0);
        drive_to_completed(&mut queue, "a");
        drive_to_completed(&mut queue, "b");

        // Wave 2 fully settled already: advance lands on wave 3
        assert_eq!(queue.advance_wave(), Some(3));
        assert!(queue.advance_wave().is_none());
    }

    #[test]
    fn test_all_failed_wave_requeue() {
        let mut queue = queue_with(vec![task("a", &[]), task("b", &[])], 1.0);
        drive_to_failed(&mut queue, "a", FailureDisposition::Cascade);
        drive_to_failed(&mut queue, "b", FailureDisposition::Cascade);

        let requeued = queue.requeue_failed_in_wave(1);
        assert_eq!(requeued.len(), 2);
        let a = queue.get("a").unwrap();
        assert_eq!(a.status_name(), "ready");
        assert!(a.retry_context.as_ref().unwrap().all_failed_wave);
    }

    #[test]
    fn test_foundation_gets_extra_retry() {
        let mut queue = queue_with(vec![task("a", &[])], 1.0);
        queue.get_mut("a").unwrap().is_foundation = true;

        // worker_retries = 2, foundation limit = 3: three retries then fail
        for expected in 1..=3u32 {
            queue.mark_dispatched("a", "w").unwrap();
            let outcome = queue
                .record_failure("a", FailureCause::WorkerError, FailureDisposition::Cascade)
                .unwrap();
            match outcome {
                FailureOutcome::Retry { attempts, .. } => assert_eq!(attempts, expected),
                _ => panic!("expected retry at attempt {}", expected),
            }
        }
        queue.mark_dispatched("a", "w").unwrap();
        let outcome = queue
            .record_failure("a", FailureCause::WorkerError, FailureDisposition::Cascade)
            .unwrap();
        assert!(matches!(outcome, FailureOutcome::Failed { .. }));
    }

    #[test]
    fn test_dispatch_requires_ready() {
        let mut queue = queue_with(vec![task("a", &[]), task("b", &["a"])], 1.0);
        assert!(queue.mark_dispatched("b", "w").is_err());
        queue.mark_dispatched("a", "w").unwrap();
        // Double dispatch is an invariant violation
        assert!(queue.mark_dispatched("a", "w2").is_err());
    }

    #[test]
    fn test_cross_wave_ready() {
        let mut queue = queue_with(vec![task("a", &[]), task("b", &["a"]), task("z", &[])], 1.0);
        drive_to_completed(&mut queue, "a");

        // b is in wave 2 but ready now; z never left wave 1
        let ready = queue.all_ready();
        assert!(ready.contains(&"b".to_string()));
        assert!(ready.contains(&"z".to_string()));
        assert_eq!(queue.ready_in_wave(1), vec!["z".to_string()]);
    }
}
