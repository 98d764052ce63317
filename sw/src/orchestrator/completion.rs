//! Per-task completion handling
//!
//! Every worker completion lands here: usage accounting, health updates,
//! failure classification (429/402/timeout/other), hollow-completion
//! detection, model failover, quality gating with its bypass conditions,
//! and the queue transition. Cascades are deferred to the wave boundary so
//! recovery (all-failed requeue, rescue) gets its window first.

use eyre::Result;
use tracing::{debug, warn};

use super::Orchestrator;
use crate::domain::{FailureCause, SpawnResult, Task, TaskResult, TaskState};
use crate::events::SwarmEvent;
use crate::health::FailureKind;
use crate::llm::TokenUsage;
use crate::pool::WorkerCompletion;
use crate::queue::{FailureDisposition, FailureOutcome};

/// A "successful" spawn that produced no effectful work
///
/// Timeout is explicitly not hollow: `tool_calls == -1` is its own signal
/// and gets its own recovery (bigger budget, "work faster" nudge).
pub fn is_hollow(task: &Task, spawn: &SpawnResult, failure_phrases: &[String]) -> bool {
    if spawn.is_timeout() {
        return false;
    }

    if spawn.metrics.tool_calls == 0 && spawn.output.trim().len() < 50 {
        return true;
    }

    if spawn.success {
        let lower = spawn.output.to_lowercase();
        if failure_phrases.iter().any(|p| lower.contains(p.as_str())) {
            return true;
        }
    }

    if task.task_type.is_action_oriented() && spawn.metrics.tool_calls == 0 {
        return true;
    }

    false
}

/// Classify a failed spawn into a failure cause
fn classify_failure(spawn: &SpawnResult) -> FailureCause {
    if spawn.is_timeout() {
        return FailureCause::Timeout;
    }
    let lower = spawn.output.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("rate-limit") {
        FailureCause::RateLimited
    } else if lower.contains("402") || lower.contains("spend limit") || lower.contains("credit balance") {
        FailureCause::SpendLimited
    } else {
        FailureCause::WorkerError
    }
}

impl Orchestrator {
    /// Handle one demuxed worker completion
    pub(super) async fn handle_completion(&mut self, done: WorkerCompletion) -> Result<()> {
        let WorkerCompletion {
            task_id,
            model,
            token_budget,
            spawn,
            ..
        } = done;

        // A worker resolving after its task already reached a terminal
        // state (stale reconciliation raced it) is ignored
        let Some(task) = self.queue.get(&task_id) else {
            warn!(task_id, "completion for unknown task dropped");
            return Ok(());
        };
        if !matches!(task.state, TaskState::Dispatched { .. }) {
            debug!(task_id, state = task.state.name(), "late completion ignored");
            return Ok(());
        }
        let task = task.clone();

        // Usage accounting (tokens priced as input; the worker does not
        // report the split)
        let cost = TokenUsage {
            input_tokens: spawn.metrics.tokens,
            output_tokens: 0,
            cache_read_tokens: 0,
        }
        .cost_usd(&model);
        self.budget.record(spawn.metrics.tokens, cost);
        self.stats.total_tokens += spawn.metrics.tokens;
        self.stats.total_cost += cost;

        let result = TaskResult::from_spawn(&spawn, &model, cost, token_budget);

        if !spawn.success {
            return self.handle_worker_failure(&task, result, &spawn).await;
        }

        if is_hollow(&task, &spawn, &self.config.quality.failure_phrases) {
            return self.handle_hollow(&task, result).await;
        }

        self.health.record_success(&model, spawn.metrics.duration_ms);
        self.handle_success(&task, result).await
    }

    /// Worker reported failure: classify, update health, maybe fail over,
    /// and let the queue decide on a retry
    async fn handle_worker_failure(&mut self, task: &Task, result: TaskResult, spawn: &SpawnResult) -> Result<()> {
        let cause = classify_failure(spawn);

        let kind = match cause {
            FailureCause::RateLimited => FailureKind::RateLimit,
            FailureCause::SpendLimited => FailureKind::SpendLimit,
            _ => FailureKind::Other,
        };
        self.health.record_failure(&result.model, kind);

        if cause.is_rate_limit()
            && let Some((recent, pause)) = self.rate_breaker.record()
        {
            self.emit(SwarmEvent::CircuitOpen {
                recent_count: recent,
                pause_ms: pause.as_millis() as u64,
            });
        }

        let feedback = if cause == FailureCause::Timeout {
            "The previous attempt ran out of time before wrapping up. Work faster: smaller steps, \
             less exploration, finish the core before polish."
                .to_string()
        } else {
            result.output.chars().take(400).collect()
        };

        if let Some(t) = self.queue.get_mut(&task.id) {
            t.set_retry_context(crate::domain::RetryContext {
                attempt: t.attempts + 1,
                previous_feedback: feedback,
                previous_files: result.files_modified.clone(),
                previous_was_timeout: cause == FailureCause::Timeout,
                ..Default::default()
            });
        }

        self.shared
            .record_failure(task, &result, &format!("{} failure: {}", cause, result.output.chars().take(160).collect::<String>()));

        self.maybe_failover(task, &result.model, &cause.to_string());
        self.finish_failure(&task.id, cause).await
    }

    /// Success that did no work: treat as failure with a tool-call nudge
    async fn handle_hollow(&mut self, task: &Task, result: TaskResult) -> Result<()> {
        warn!(task_id = %task.id, model = %result.model, "hollow completion detected");
        self.health.record_failure(&result.model, FailureKind::Other);
        self.emit(SwarmEvent::TaskResilience {
            task_id: task.id.clone(),
            action: "hollow-completion".to_string(),
        });

        if let Some(t) = self.queue.get_mut(&task.id) {
            t.set_retry_context(crate::domain::RetryContext {
                attempt: t.attempts + 1,
                previous_feedback: "The previous attempt reported success but produced no tool calls and no \
                                    artifacts. That does not count as work."
                    .to_string(),
                previous_was_hollow: true,
                ..Default::default()
            });
        }

        self.shared
            .record_failure(task, &result, "claimed success with zero effectful work");

        self.maybe_failover(task, &result.model, "hollow-completion");
        self.finish_failure(&task.id, FailureCause::Hollow).await
    }

    /// Genuine success: run the gate (unless bypassed), then complete or
    /// reject
    async fn handle_success(&mut self, task: &Task, mut result: TaskResult) -> Result<()> {
        let verdict = if self.gate_bypassed(task) {
            None
        } else {
            let criteria = self
                .plan
                .as_ref()
                .and_then(|p| p.criteria.get(&task.id))
                .map(|c| c.as_slice());
            Some(self.gate.evaluate(task, &result, criteria).await)
        };

        match verdict {
            None => self.complete_task(task, result).await,
            Some(v) if v.passed => {
                self.quality_breaker.record_pass();
                result.quality_score = Some(v.score);
                result.quality_feedback = Some(v.feedback);
                self.complete_task(task, result).await
            }
            Some(v) => {
                self.stats.quality_rejections += 1;
                self.emit(SwarmEvent::QualityRejected {
                    task_id: task.id.clone(),
                    score: v.score,
                    feedback: v.feedback.chars().take(300).collect(),
                    pre_flight: v.pre_flight_reject,
                });

                if !v.pre_flight_reject && self.quality_breaker.record_rejection() {
                    self.log_decision(
                        "quality-circuit-breaker",
                        "8 consecutive judge rejections; judging bypassed for the rest of this wave",
                    );
                }

                if let Some(t) = self.queue.get_mut(&task.id) {
                    t.set_retry_context(crate::domain::RetryContext {
                        attempt: t.attempts + 1,
                        previous_feedback: v.feedback.clone(),
                        previous_score: Some(v.score),
                        previous_files: result.files_modified.clone(),
                        ..Default::default()
                    });
                }

                self.shared.record_failure(
                    task,
                    &result,
                    &format!("quality rejection (score {}): {}", v.score, v.feedback.chars().take(160).collect::<String>()),
                );

                // Failover only for rock-bottom scores that are not a
                // missing-artifact auto-fail
                if v.score <= 1 && !v.artifact_auto_fail {
                    self.maybe_failover(task, &result.model, "quality-rejection");
                }

                self.finish_failure(&task.id, FailureCause::QualityRejected).await
            }
        }
    }

    /// Gate bypass conditions: disabled, breaker open, API pressure, or
    /// the attempt that has no retry left anyway
    fn gate_bypassed(&mut self, task: &Task) -> bool {
        if !self.config.quality.enabled {
            return true;
        }
        if self.quality_breaker.is_open() {
            return true;
        }
        // Under API pressure every extra judge call makes things worse
        if self.rate_breaker.recent_count() > 0 {
            debug!(task_id = %task.id, "gate bypassed under rate-limit pressure");
            return true;
        }
        // Last allowed attempt: rejecting it would terminally fail the task
        // for no benefit
        let limit = self.queue.retry_limit_for(&task.id, FailureCause::QualityRejected);
        if task.attempts >= limit {
            debug!(task_id = %task.id, attempts = task.attempts, limit, "gate bypassed on last allowed attempt");
            return true;
        }
        false
    }

    async fn complete_task(&mut self, task: &Task, result: TaskResult) -> Result<()> {
        let score = result.quality_score;
        let tokens = result.tokens_used;
        let duration_ms = result.duration_ms;

        self.queue.mark_completed(&task.id, result)?;
        self.emit(SwarmEvent::TaskCompleted {
            task_id: task.id.clone(),
            score,
            tokens,
            duration_ms,
        });
        Ok(())
    }

    /// Route a failure through the queue with a deferred cascade, then emit
    async fn finish_failure(&mut self, task_id: &str, cause: FailureCause) -> Result<()> {
        let outcome = self
            .queue
            .record_failure(task_id, cause, FailureDisposition::Defer)?;

        match outcome {
            FailureOutcome::Retry { attempts, cooldown } => {
                debug!(task_id, attempts, ?cooldown, "task will retry");
                self.emit(SwarmEvent::TaskFailed {
                    task_id: task_id.to_string(),
                    cause: cause.to_string(),
                    attempts,
                    will_retry: true,
                });
            }
            FailureOutcome::Failed { .. } => {
                self.deferred_cascades.push(task_id.to_string());
                let attempts = self.queue.get(task_id).map(|t| t.attempts).unwrap_or(0);
                self.emit(SwarmEvent::TaskFailed {
                    task_id: task_id.to_string(),
                    cause: cause.to_string(),
                    attempts,
                    will_retry: false,
                });
            }
        }
        Ok(())
    }

    /// Pin an alternative healthy model of the same capability, if one
    /// exists and failover is enabled
    fn maybe_failover(&mut self, task: &Task, current_model: &str, reason: &str) {
        if !self.config.phases.model_failover {
            return;
        }
        let Some(alternative) = self.pool.alternative_worker(task, current_model, &self.health) else {
            return;
        };

        if let Some(t) = self.queue.get_mut(&task.id) {
            t.assigned_model = Some(alternative.model.clone());
        }
        self.emit(SwarmEvent::ModelFailover {
            task_id: task.id.clone(),
            from: current_model.to_string(),
            to: alternative.model.clone(),
            reason: reason.to_string(),
        });
    }
}
