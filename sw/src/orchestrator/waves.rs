//! Wave execution loop
//!
//! Dispatch ready tasks (current wave first, later waves to fill slots),
//! wait for completions, and at each wave boundary: reconcile stale
//! dispatches, requeue all-failed waves, resolve deferred cascades, review,
//! checkpoint, consider a replan, then advance.

use std::time::Duration;

use eyre::{Result, bail};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::breakers::BreakerState;
use super::{Orchestrator, replan, review};
use crate::events::SwarmEvent;
use crate::domain::TaskState;

/// Upper bound on idle sleeps inside the loop
const MAX_IDLE_SLEEP: Duration = Duration::from_secs(5);

/// Consecutive no-progress wave boundaries before the run is declared wedged
const MAX_STAGNANT_BOUNDARIES: u32 = 3;

impl Orchestrator {
    /// Run the DAG to exhaustion
    pub(super) async fn execute_waves(&mut self) -> Result<()> {
        let wave = self.queue.current_wave();
        self.emit(SwarmEvent::WaveStart {
            wave,
            task_count: self.queue.wave_members(wave).len(),
        });

        let mut stagnant_boundaries = 0u32;

        loop {
            if self.cancelled() {
                self.pool.cancel_all(self.cancel_grace()).await;
                self.emit(SwarmEvent::Abort {
                    reason: "cancelled".to_string(),
                });
                return Ok(());
            }

            // Wave boundary: every task of the current wave is terminal
            // (later-wave tasks dispatched to fill slots may still run)
            if self.queue.wave_settled(self.queue.current_wave()) {
                let progressed = self.end_of_wave().await?;
                if self.queue.all_settled() && self.pool.is_empty() {
                    return Ok(());
                }
                if progressed {
                    stagnant_boundaries = 0;
                    continue;
                }
                if !self.pool.is_empty() {
                    if let Some(done) = self.pool.wait_for_any().await {
                        self.handle_completion(done).await?;
                    }
                    continue;
                }
                stagnant_boundaries += 1;
                if stagnant_boundaries >= MAX_STAGNANT_BOUNDARIES {
                    bail!(
                        "internal invariant violation: queue wedged with unsettled tasks ({:?})",
                        self.queue.counts()
                    );
                }
                continue;
            }

            let breaker = self.rate_breaker.check();
            if breaker == BreakerState::JustClosed {
                self.emit(SwarmEvent::CircuitClosed {});
            }
            let dispatch_allowed = !matches!(breaker, BreakerState::Open { .. });

            let dispatched = if dispatch_allowed { self.dispatch_ready().await? } else { 0 };

            if !self.pool.is_empty() {
                if let Some(done) = self.pool.wait_for_any().await {
                    self.handle_completion(done).await?;
                }
                continue;
            }

            if dispatched > 0 {
                continue;
            }

            // Nothing in flight and nothing dispatchable right now
            if let Some(delay) = self.queue.earliest_cooldown(Instant::now()) {
                debug!(delay_ms = delay.as_millis() as u64, "all ready tasks cooling down");
                tokio::time::sleep(delay.min(MAX_IDLE_SLEEP)).await;
                continue;
            }

            if !dispatch_allowed {
                if let BreakerState::Open { remaining } = breaker {
                    tokio::time::sleep(remaining.min(MAX_IDLE_SLEEP)).await;
                }
                continue;
            }

            // The wave is unsettled yet nothing can move: pending tasks are
            // waiting on deferred cascades
            if self.resolve_deferred_cascades() > 0 {
                continue;
            }

            // Budget exhaustion is not fatal: ready tasks stay ready and the
            // run ends with what completed
            if !self.queue.all_ready().is_empty() && !self.budget.admit(1_000) {
                self.log_decision(
                    "budget-exhausted",
                    "ready tasks remain but the budget cannot admit another dispatch",
                );
                return Ok(());
            }

            stagnant_boundaries += 1;
            if stagnant_boundaries >= MAX_STAGNANT_BOUNDARIES {
                bail!(
                    "internal invariant violation: queue wedged with unsettled tasks ({:?})",
                    self.queue.counts()
                );
            }
            let _ = self.end_of_wave().await?;
        }
    }

    /// Dispatch as many ready tasks as capacity, budget and the stagger
    /// allow. Current-wave tasks go first, later-wave ready tasks fill
    /// remaining slots.
    pub(super) async fn dispatch_ready(&mut self) -> Result<usize> {
        let now = Instant::now();
        let current_wave = self.queue.current_wave();

        let mut candidates = self.queue.ready_in_wave(current_wave);
        for id in self.queue.all_ready() {
            if !candidates.contains(&id) {
                candidates.push(id);
            }
        }

        let mut dispatched = 0usize;
        for task_id in candidates {
            if !self.pool.has_capacity() || self.cancelled() {
                break;
            }
            let Some(task) = self.queue.get(&task_id).cloned() else { continue };
            if !matches!(task.state, TaskState::Ready) || !task.cooldown_elapsed(now) {
                continue;
            }

            // Admission: projected input from the prompt we are about to build
            let projected_input = ((task.description.len()
                + task.dependency_context.as_ref().map(|c| c.len()).unwrap_or(0)
                + 2_000) / 4) as u64;
            if !self.budget.admit(projected_input) {
                self.emit(SwarmEvent::Status {
                    message: format!("budget gate: holding dispatch of {} until room opens", task_id),
                });
                break;
            }

            if dispatched > 0 {
                let stagger = self.stagger.current(self.rate_breaker.recent_count());
                tokio::time::sleep(stagger).await;
            }

            let spec = self.pool.select_worker(&task, &self.health);
            let lessons = self.shared.lessons_for(&task.task_type.to_string());
            let info = self.pool.dispatch(&task, &spec, lessons)?;
            self.queue.mark_dispatched(&task_id, &info.agent_name)?;

            if task.attempts > 0 {
                self.stats.retries += 1;
                self.emit(SwarmEvent::TaskAttempt {
                    task_id: task_id.clone(),
                    attempt: task.attempts,
                    model: info.model.clone(),
                });
            }
            self.emit(SwarmEvent::TaskDispatched {
                task_id,
                model: info.model,
                wave: task.wave,
                attempt: task.attempts,
            });
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// Wave-boundary processing. Returns true when it changed anything that
    /// can produce more work (requeue, fixups, un-stuck tasks, advance).
    async fn end_of_wave(&mut self) -> Result<bool> {
        let wave = self.queue.current_wave();

        // Stale dispatched tasks with no live worker go back to ready
        let stale_after = Duration::from_secs(self.config.swarm.worker_stuck_threshold_secs);
        let reconciled = self
            .queue
            .reconcile_stale_dispatched(stale_after, &self.pool.active_task_ids());
        if !reconciled.is_empty() {
            for task_id in &reconciled {
                self.emit(SwarmEvent::TaskResilience {
                    task_id: task_id.clone(),
                    action: "stale-reconciled".to_string(),
                });
            }
            return Ok(true);
        }

        // A wave where everything failed gets one collective requeue with a
        // change-of-approach nudge, budget permitting
        let members = self.queue.wave_members(wave);
        let all_failed = !members.is_empty()
            && members.iter().all(|id| {
                self.queue
                    .get(id)
                    .map(|t| matches!(t.state, TaskState::Failed { .. }))
                    .unwrap_or(false)
            });
        if all_failed && !self.requeued_waves.contains(&wave) && self.budget.has_capacity() {
            self.requeued_waves.insert(wave);
            let requeued = self.queue.requeue_failed_in_wave(wave);
            warn!(wave, requeued = requeued.len(), "entire wave failed; requeuing with a different approach");
            self.emit(SwarmEvent::WaveAllFailed {
                wave,
                requeued: requeued.len(),
            });
            return Ok(true);
        }

        // Failures whose cascade was deferred for the recovery window now
        // propagate
        let skipped = self.resolve_deferred_cascades();
        if skipped > 0 {
            debug!(wave, skipped, "deferred cascades resolved at wave boundary");
        }

        // Wave review may inject fix-up tasks into this wave
        if self.wave_review(wave).await? {
            return Ok(true);
        }

        // A stalled run gets one replan
        if self.check_replan(wave).await? {
            return Ok(true);
        }

        let (completed, failed, skipped_count) = self.wave_census(wave);
        self.emit(SwarmEvent::WaveComplete {
            wave,
            completed,
            failed,
            skipped: skipped_count,
        });
        let snapshot = self.budget.snapshot();
        self.emit(SwarmEvent::BudgetUpdate {
            tokens_used: snapshot.tokens_used,
            tokens_cap: snapshot.tokens_cap,
            cost_used: snapshot.cost_used,
            cost_cap: snapshot.cost_cap,
        });

        self.quality_breaker.reset_wave();
        self.checkpoint();

        match self.queue.advance_wave() {
            Some(next) => {
                info!(wave = next, "advancing wave");
                self.emit(SwarmEvent::WaveStart {
                    wave: next,
                    task_count: self.queue.wave_members(next).len(),
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Trigger cascades for terminally failed tasks whose walk was deferred
    pub(super) fn resolve_deferred_cascades(&mut self) -> usize {
        let pending: Vec<String> = self.deferred_cascades.drain(..).collect();
        let mut total = 0usize;
        for task_id in pending {
            let still_failed = self
                .queue
                .get(&task_id)
                .map(|t| matches!(t.state, TaskState::Failed { .. }))
                .unwrap_or(false);
            if !still_failed {
                continue; // revived by an all-failed requeue
            }
            for skipped_id in self.queue.trigger_cascade_skip(&task_id) {
                let reason = self
                    .queue
                    .get(&skipped_id)
                    .and_then(|t| match &t.state {
                        TaskState::Skipped { reason } => Some(reason.clone()),
                        _ => None,
                    })
                    .unwrap_or_default();
                self.emit(SwarmEvent::TaskSkipped {
                    task_id: skipped_id,
                    reason,
                });
                total += 1;
            }
        }
        total
    }

    /// Run the manager's wave review; returns true when fixups joined the
    /// wave
    async fn wave_review(&mut self, wave: u32) -> Result<bool> {
        if !self.config.phases.wave_review || self.reviewed_waves.contains(&wave) {
            return Ok(false);
        }
        self.reviewed_waves.insert(wave);

        // Give the background plan a chance to land first
        self.join_planning(false).await;

        self.emit(SwarmEvent::ReviewStart { wave });

        let reviewed: Vec<review::ReviewedTask> = self
            .queue
            .wave_members(wave)
            .iter()
            .filter_map(|id| self.queue.get(id))
            .filter_map(|t| {
                t.result().map(|r| review::ReviewedTask {
                    id: t.id.clone(),
                    description: t.description.clone(),
                    output_excerpt: r.output.chars().take(1_500).collect(),
                    quality_score: r.quality_score,
                })
            })
            .collect();

        let model = self.manager_model();
        let Some(result) =
            review::review_wave(self.provider.as_ref(), model.as_deref(), wave, &reviewed, self.plan.as_ref()).await
        else {
            return Ok(false);
        };

        self.record_internal_llm("wave-review", result.tokens_used, result.cost_used);

        let fixup_count = result.fixups.len();
        for fixup in &result.fixups {
            self.emit(SwarmEvent::FixupSpawned {
                task_id: fixup.id.clone(),
                fixes: fixup.fixes_task_id.clone().unwrap_or_default(),
            });
        }
        self.emit(SwarmEvent::ReviewComplete {
            wave,
            fixups: fixup_count,
        });

        if fixup_count > 0 {
            self.queue.add_fixup_tasks(result.fixups)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// One replan per run, when the run is clearly stalled
    async fn check_replan(&mut self, _wave: u32) -> Result<bool> {
        if self.replanned {
            return Ok(false);
        }

        let counts = self.queue.counts();
        let attempted = counts.completed + counts.failed + counts.skipped;
        if attempted == 0 {
            return Ok(false);
        }
        let stuck = counts.failed + counts.skipped;
        let stuck_ratio = stuck as f64 / attempted as f64;
        let progress_stopped = counts.ready == 0 && counts.dispatched == 0 && counts.pending == 0;
        if stuck_ratio < 0.4 || !progress_stopped || counts.completed == 0 {
            return Ok(false);
        }

        self.replanned = true;
        self.emit(SwarmEvent::Stall {
            failed_ratio: stuck_ratio,
        });
        warn!(stuck, attempted, "run stalled; attempting the one allowed replan");

        let completed_summary: String = self
            .queue
            .tasks()
            .filter_map(|t| {
                t.result()
                    .map(|r| format!("- {}: {}\n", t.id, r.output.chars().take(200).collect::<String>()))
            })
            .collect();
        let stuck_ids: Vec<String> = self
            .queue
            .tasks()
            .filter(|t| t.state.is_failed_or_skipped())
            .map(|t| t.id.clone())
            .collect();

        let model = self.manager_model();
        let prompt = self.original_prompt.clone();
        let Some(result) = replan::replan(
            self.provider.as_ref(),
            model.as_deref(),
            &prompt,
            &completed_summary,
            &stuck_ids,
        )
        .await
        else {
            self.log_decision("replan-failed", "replan call produced nothing usable");
            return Ok(false);
        };

        self.record_internal_llm("replan", result.tokens_used, result.cost_used);
        let new_count = result.tasks.len();
        self.queue.add_replan_tasks(result.tasks)?;
        self.emit(SwarmEvent::Replan {
            stuck: stuck_ids.len(),
            new_tasks: new_count,
        });
        self.log_decision("replan", format!("{} stuck tasks; {} new tasks joined the wave", stuck_ids.len(), new_count));
        Ok(true)
    }

    /// Dispatch/await loop without wave machinery, used by the rescue pass
    /// and verification fixups
    pub(super) async fn drain_ready(&mut self) -> Result<()> {
        loop {
            if self.cancelled() {
                self.pool.cancel_all(self.cancel_grace()).await;
                return Ok(());
            }

            let dispatched = self.dispatch_ready().await?;

            if !self.pool.is_empty() {
                if let Some(done) = self.pool.wait_for_any().await {
                    self.handle_completion(done).await?;
                }
                continue;
            }
            if dispatched > 0 {
                continue;
            }
            if let Some(delay) = self.queue.earliest_cooldown(Instant::now()) {
                tokio::time::sleep(delay.min(MAX_IDLE_SLEEP)).await;
                continue;
            }
            // Failures during a drain still cascade
            self.resolve_deferred_cascades();
            return Ok(());
        }
    }

    fn wave_census(&self, wave: u32) -> (usize, usize, usize) {
        let mut completed = 0;
        let mut failed = 0;
        let mut skipped = 0;
        for id in self.queue.wave_members(wave) {
            match self.queue.get(&id).map(|t| t.status_name()) {
                Some("completed") => completed += 1,
                Some("failed") => failed += 1,
                Some("skipped") => skipped += 1,
                _ => {}
            }
        }
        (completed, failed, skipped)
    }
}
