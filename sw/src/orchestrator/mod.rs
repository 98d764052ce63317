//! Orchestrator - drives the swarm pipeline
//!
//! decompose → probe → (plan in background) → execute waves → verify →
//! rescue → synthesize, with recovery policy (retries, failover, circuit
//! breakers, replanning) owned here. The orchestrator is the single owner
//! of the TaskQueue; worker futures communicate only through the pool's
//! completion demux.

pub mod breakers;
mod completion;
mod decompose;
mod outcome;
mod planning;
mod probe;
mod replan;
mod review;
mod synthesize;
mod verify;
mod waves;

pub use completion::is_hollow;
pub use decompose::emergency_scaffold;
pub use outcome::{SUCCESS_RATIO, SwarmOutcome, TaskSummary};

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use eyre::{Context as _, Result, bail};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::budget::BudgetPool;
use crate::config::{ProbeFailureStrategy, SwarmConfig};
use crate::context::SharedContextEngine;
use crate::domain::id;
use crate::events::{EventBus, SwarmEvent};
use crate::gate::QualityGate;
use crate::health::HealthTracker;
use crate::llm::ProviderClient;
use crate::pool::{AgentSpawner, WorkerPool};
use crate::queue::{QueuePolicy, TaskQueue};
use crate::state::{Checkpoint, CheckpointStore, Decision, ExecutionPlan, SwarmPhase, SwarmStats};
use crate::throttle::{Throttle, ThrottledProvider};

use breakers::{AdaptiveStagger, QualityBreaker, RateLimitBreaker};

/// Cooperative cancellation handle for a running swarm
#[derive(Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// The swarm orchestrator
pub struct Orchestrator {
    config: SwarmConfig,
    provider: Arc<dyn ProviderClient>,
    spawner: Arc<dyn AgentSpawner>,
    pool: WorkerPool,
    queue: TaskQueue,
    gate: QualityGate,
    budget: BudgetPool,
    health: HealthTracker,
    shared: SharedContextEngine,
    bus: EventBus,
    store: Option<CheckpointStore>,
    working_dir: PathBuf,

    session_id: String,
    original_prompt: String,
    phase: SwarmPhase,
    plan: Option<ExecutionPlan>,
    plan_handle: Option<JoinHandle<Option<planning::PlanningResult>>>,

    stats: SwarmStats,
    decisions: Vec<Decision>,
    errors: Vec<String>,

    rate_breaker: RateLimitBreaker,
    quality_breaker: QualityBreaker,
    stagger: AdaptiveStagger,
    replanned: bool,
    requeued_waves: HashSet<u32>,
    reviewed_waves: HashSet<u32>,
    /// Terminally failed tasks whose cascade is held until the wave
    /// boundary (the recovery window)
    deferred_cascades: Vec<String>,
    cancel_flag: Arc<AtomicBool>,
}

impl Orchestrator {
    /// Build an orchestrator. The raw provider is wrapped in the shared
    /// throttle here; every internal call and the quality judge go through
    /// the wrapper.
    pub fn new(
        config: SwarmConfig,
        raw_provider: Arc<dyn ProviderClient>,
        spawner: Arc<dyn AgentSpawner>,
        bus: EventBus,
        working_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let working_dir = working_dir.into();
        let throttle = Arc::new(Throttle::new(config.throttle.clone()));
        let provider: Arc<dyn ProviderClient> = Arc::new(ThrottledProvider::new(raw_provider, throttle));

        let judge_model = config.quality.model.clone().or_else(|| config.hierarchy.judge.clone());
        let gate = QualityGate::new(provider.clone(), config.quality.clone(), judge_model, working_dir.clone());

        let queue = TaskQueue::new(QueuePolicy {
            worker_retries: config.retry.worker_retries,
            rate_limit_retries: config.retry.rate_limit_retries,
            fixup_retries: 2,
            retry_base_delay: Duration::from_millis(config.retry.retry_base_delay_ms),
            partial_dependency_threshold: config.retry.partial_dependency_threshold,
            dependency_context_max_length: config.retry.dependency_context_max_length,
        });

        let budget = BudgetPool::new(
            config.swarm.total_budget,
            config.swarm.max_cost,
            config.swarm.orchestrator_reserve_ratio,
        );

        let pool = WorkerPool::new(spawner.clone(), config.clone(), working_dir.display().to_string())?;

        let store = if config.persistence.enabled {
            Some(CheckpointStore::new(config.persistence.state_dir.clone()))
        } else {
            None
        };

        let stagger = AdaptiveStagger::new(Duration::from_millis(config.swarm.dispatch_stagger_ms));
        let quality_breaker = QualityBreaker::new(config.quality.breaker_threshold);

        Ok(Self {
            config,
            provider,
            spawner,
            pool,
            queue,
            gate,
            budget,
            health: HealthTracker::new(),
            shared: SharedContextEngine::new(),
            bus,
            store,
            working_dir,
            session_id: id::session_id(),
            original_prompt: String::new(),
            phase: SwarmPhase::Decomposing,
            plan: None,
            plan_handle: None,
            stats: SwarmStats::default(),
            decisions: Vec::new(),
            errors: Vec::new(),
            rate_breaker: RateLimitBreaker::new(),
            quality_breaker,
            stagger,
            replanned: false,
            requeued_waves: HashSet::new(),
            reviewed_waves: HashSet::new(),
            deferred_cascades: Vec::new(),
            cancel_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Handle for cooperative cancellation from another task
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            flag: self.cancel_flag.clone(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Run the pipeline to completion (or cancellation)
    pub async fn run(&mut self, prompt: &str) -> Result<SwarmOutcome> {
        match self.run_inner(prompt).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.emit(SwarmEvent::Error {
                    context: format!("phase {}", self.phase),
                    message: format!("{:#}", e),
                });
                self.errors.push(format!("{:#}", e));
                self.checkpoint();
                Err(e)
            }
        }
    }

    async fn run_inner(&mut self, prompt: &str) -> Result<SwarmOutcome> {
        let resumed = self.try_resume()?;

        if !resumed {
            self.original_prompt = prompt.to_string();
            self.emit(SwarmEvent::Start {
                session_id: self.session_id.clone(),
                prompt_summary: prompt.chars().take(120).collect(),
                total_budget: self.config.swarm.total_budget,
            });
            self.decompose_phase().await?;
        }

        if phase_rank(self.phase) <= phase_rank(SwarmPhase::Executing) {
            self.probe_phase().await?;
            self.spawn_planning();
            self.phase = SwarmPhase::Executing;
            self.execute_waves().await?;
        }

        if self.config.phases.verification && !self.cancelled() && phase_rank(self.phase) <= phase_rank(SwarmPhase::Verifying)
        {
            self.phase = SwarmPhase::Verifying;
            self.emit(SwarmEvent::PhaseProgress {
                phase: "verifying".to_string(),
                detail: "running the planned verification steps".to_string(),
            });
            self.verification_phase().await?;
        }

        if !self.cancelled() && phase_rank(self.phase) <= phase_rank(SwarmPhase::Rescuing) {
            self.phase = SwarmPhase::Rescuing;
            self.rescue_phase().await?;
        }

        self.phase = SwarmPhase::Synthesizing;
        self.emit(SwarmEvent::PhaseProgress {
            phase: "synthesizing".to_string(),
            detail: "combining completed outputs".to_string(),
        });
        let synthesis = self.synthesize_phase().await;

        self.phase = SwarmPhase::Complete;
        self.checkpoint();

        let outcome = self.build_outcome(synthesis);
        self.emit(SwarmEvent::Complete {
            success: outcome.success,
            partial: outcome.partial_success,
            completed: outcome.tasks.iter().filter(|t| t.status == "completed").count(),
            total: outcome.tasks.len(),
            tokens_used: outcome.stats.total_tokens,
            cost_used: outcome.stats.total_cost,
        });
        Ok(outcome)
    }

    // === Phases ===

    async fn decompose_phase(&mut self) -> Result<()> {
        self.phase = SwarmPhase::Decomposing;
        let model = self.orchestrator_model();
        let prompt = self.original_prompt.clone();

        let decomposition = decompose::decompose(self.provider.as_ref(), model.as_deref(), &prompt).await;
        self.record_internal_llm("decomposition", decomposition.tokens_used, decomposition.cost_used);

        if decomposition.emergency {
            self.log_decision(
                "emergency-scaffold",
                "LLM decomposition failed; continuing with the deterministic design/implement/test/integrate scaffold",
            );
        } else {
            self.log_decision(
                "decomposition",
                format!(
                    "{} subtasks, strategy {}: {}",
                    decomposition.tasks.len(),
                    decomposition.strategy,
                    decomposition.reasoning.chars().take(200).collect::<String>()
                ),
            );
        }

        let mut tasks = decomposition.tasks;

        if decompose::apply_scaffold_first(&mut tasks, &self.working_dir) {
            self.log_decision("scaffold-first", "workspace is unscaffolded; scaffold task now gates all others");
        }

        let foundations = decompose::detect_foundations(&mut tasks);
        if !foundations.is_empty() {
            self.log_decision("foundation-tasks", foundations.join(", "));
        }

        self.budget
            .set_reserve_for_subtasks(self.config.swarm.orchestrator_reserve_ratio, tasks.len());

        let count = tasks.len();
        self.queue.load(tasks).context("decomposition failed validation")?;

        self.emit(SwarmEvent::TasksLoaded {
            count,
            waves: self.queue.max_wave(),
            strategy: decomposition.strategy,
        });

        self.phase = SwarmPhase::Executing;
        self.checkpoint();
        Ok(())
    }

    async fn probe_phase(&mut self) -> Result<()> {
        if !self.config.probes.enabled {
            return Ok(());
        }

        let models = self.pool.roster_models();
        let timeout = Duration::from_millis(self.config.probes.timeout_ms);
        let report = probe::probe_models(self.provider.as_ref(), &models, timeout).await;
        self.record_internal_llm("probe", report.tokens_used, 0.0);

        for model in &report.failed {
            self.health.mark_unhealthy(model);
            self.emit(SwarmEvent::ModelHealth {
                model: model.clone(),
                healthy: false,
                failures: 0,
            });
        }

        if report.all_failed() {
            match self.config.probes.failure_strategy {
                ProbeFailureStrategy::Abort => {
                    self.emit(SwarmEvent::Abort {
                        reason: "no worker model passed the capability probe".to_string(),
                    });
                    bail!("catastrophic probe failure: no worker model can emit tool calls");
                }
                ProbeFailureStrategy::Warn => {
                    self.log_decision(
                        "probe-failure",
                        "every probe failed; continuing and letting the first real failure decide",
                    );
                }
            }
        }
        Ok(())
    }

    /// Kick off background planning (manager role), concurrent with waves
    fn spawn_planning(&mut self) {
        if !self.config.phases.planning || self.plan.is_some() || self.plan_handle.is_some() {
            return;
        }

        let provider = self.provider.clone();
        let model = self.planner_model();
        let prompt = self.original_prompt.clone();
        let tasks: Vec<(String, String)> = self
            .queue
            .tasks()
            .map(|t| (t.id.clone(), t.description.clone()))
            .collect();

        self.emit(SwarmEvent::RoleAction {
            role: "manager".to_string(),
            action: "planning acceptance criteria in the background".to_string(),
        });
        self.plan_handle = Some(tokio::spawn(async move {
            planning::build_plan(provider.as_ref(), model.as_deref(), &prompt, &tasks).await
        }));
    }

    /// Collect the background plan if it has landed (or wait for it)
    async fn join_planning(&mut self, wait: bool) {
        let Some(handle) = self.plan_handle.take() else { return };

        if !wait && !handle.is_finished() {
            self.plan_handle = Some(handle);
            return;
        }

        match handle.await {
            Ok(Some(result)) => {
                self.record_internal_llm("planning", result.tokens_used, result.cost_used);
                self.emit(SwarmEvent::PlanComplete {
                    criteria_count: result.plan.criteria.len(),
                    verify_steps: result.plan.verification_steps.len(),
                });
                self.plan = Some(result.plan);
            }
            Ok(None) => {
                self.log_decision("planning-skipped", "planner failed; execution continues without criteria");
            }
            Err(e) => {
                warn!(error = %e, "planning task crashed");
            }
        }
    }

    /// Final rescue pass: failed/skipped tasks whose dependencies are now
    /// satisfied get one escalated re-dispatch, budget permitting
    async fn rescue_phase(&mut self) -> Result<()> {
        let candidates: Vec<(String, String)> = self
            .queue
            .tasks()
            .filter(|t| t.state.is_failed_or_skipped())
            .map(|t| (t.id.clone(), t.status_name().to_string()))
            .collect();

        if candidates.is_empty() || !self.budget.has_capacity() {
            return Ok(());
        }

        let mut rescued = 0usize;
        for (task_id, prior_status) in candidates {
            if !self.budget.has_capacity() {
                break;
            }
            let rescue_context = format!(
                "This task previously ended as {}. This is the final rescue attempt of the whole run: \
                 scope down to the smallest useful version and make it real.",
                prior_status
            );
            if self.queue.reset_for_rescue(&task_id, rescue_context) {
                self.emit(SwarmEvent::TaskResilience {
                    task_id: task_id.clone(),
                    action: "final-rescue".to_string(),
                });
                rescued += 1;
            }
        }

        if rescued > 0 {
            self.log_decision("final-rescue", format!("re-dispatching {} terminal tasks once", rescued));
            self.drain_ready().await?;
            // Rescued completions may satisfy skipped dependents
            let completed_ids: Vec<String> = self
                .queue
                .tasks()
                .filter(|t| t.result().is_some())
                .map(|t| t.id.clone())
                .collect();
            for task_id in completed_ids {
                self.queue.un_skip_dependents(&task_id);
            }
            if !self.queue.all_ready().is_empty() {
                self.drain_ready().await?;
            }
        }
        Ok(())
    }

    async fn synthesize_phase(&mut self) -> Option<synthesize::SynthesisResult> {
        let inputs: Vec<synthesize::SynthesisInput> = self
            .queue
            .tasks()
            .filter_map(|t| {
                t.result().map(|r| synthesize::SynthesisInput {
                    id: t.id.clone(),
                    task_type: t.task_type.to_string(),
                    description: t.description.clone(),
                    output: r.output.clone(),
                })
            })
            .collect();

        let model = self.orchestrator_model();
        let prompt = self.original_prompt.clone();
        let result = synthesize::synthesize(self.provider.as_ref(), model.as_deref(), &prompt, &inputs).await;
        if result.llm_generated {
            self.record_internal_llm("synthesis", result.tokens_used, result.cost_used);
        }
        Some(result)
    }

    // === Resume ===

    /// Load a checkpoint when a resume session id is configured
    fn try_resume(&mut self) -> Result<bool> {
        let Some(resume_id) = self.config.persistence.resume_session_id.clone() else {
            return Ok(false);
        };
        let Some(store) = &self.store else {
            bail!("resume requested but persistence is disabled");
        };
        let Some(checkpoint) = store.load(&resume_id)? else {
            bail!("no checkpoint found for session {}", resume_id);
        };

        self.session_id = checkpoint.session_id.clone();
        self.original_prompt = checkpoint.original_prompt.clone();
        self.phase = checkpoint.phase;
        self.plan = checkpoint.plan.clone();
        self.stats = checkpoint.stats.clone();
        self.decisions = checkpoint.decisions.clone();
        self.errors = checkpoint.errors.clone();
        self.health.restore(checkpoint.model_health.clone());
        self.shared.restore(checkpoint.shared_context.clone());
        self.budget.restore(checkpoint.stats.total_tokens, checkpoint.stats.total_cost);
        self.queue.restore_from_checkpoint(checkpoint.queue);

        // A checkpoint taken at completion restarts nothing
        if self.phase == SwarmPhase::Complete {
            self.phase = SwarmPhase::Synthesizing;
        }

        info!(session_id = %self.session_id, phase = %self.phase, "resumed from checkpoint");
        self.emit(SwarmEvent::StateResume {
            session_id: self.session_id.clone(),
            phase: self.phase.to_string(),
        });
        Ok(true)
    }

    // === Shared helpers ===

    fn emit(&self, event: SwarmEvent) {
        self.bus.emit(event);
    }

    fn cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }

    /// Grace window for worker teardown on cancellation
    fn cancel_grace(&self) -> Duration {
        Duration::from_secs(5).min(Duration::from_secs(self.config.swarm.worker_timeout_secs) / 10)
    }

    fn log_decision(&mut self, key: &str, detail: impl Into<String>) {
        let detail = detail.into();
        self.decisions.push(Decision::new(key, detail.clone()));
        self.emit(SwarmEvent::Decision {
            key: key.to_string(),
            detail,
        });
    }

    /// Account for an orchestrator-internal LLM call
    fn record_internal_llm(&mut self, purpose: &str, tokens: u64, cost: f64) {
        self.budget.record(tokens, cost);
        self.stats.total_tokens += tokens;
        self.stats.total_cost += cost;
        self.emit(SwarmEvent::OrchestratorLlm {
            purpose: purpose.to_string(),
            model: self
                .orchestrator_model()
                .unwrap_or_else(|| self.provider.default_model().to_string()),
            tokens,
        });
    }

    fn orchestrator_model(&self) -> Option<String> {
        self.config
            .swarm
            .orchestrator_model
            .clone()
            .or_else(|| self.config.hierarchy.manager.clone())
    }

    fn planner_model(&self) -> Option<String> {
        self.config
            .hierarchy
            .planner_model
            .clone()
            .or_else(|| self.config.hierarchy.manager.clone())
            .or_else(|| self.orchestrator_model())
    }

    fn manager_model(&self) -> Option<String> {
        self.config.hierarchy.manager.clone().or_else(|| self.orchestrator_model())
    }

    /// Best-effort checkpoint; persistence failures are warnings
    fn checkpoint(&mut self) {
        let Some(store) = &self.store else { return };

        let checkpoint = Checkpoint {
            session_id: self.session_id.clone(),
            timestamp: chrono::Utc::now(),
            phase: self.phase,
            plan: self.plan.clone(),
            queue: self.queue.checkpoint(),
            stats: self.stats.clone(),
            model_health: self.health.get_all_records(),
            decisions: self.decisions.clone(),
            errors: self.errors.clone(),
            original_prompt: self.original_prompt.clone(),
            shared_context: self.shared.snapshot(),
        };

        if let Err(e) = store.save(&checkpoint) {
            warn!(error = %e, "checkpoint save failed");
            self.errors.push(format!("checkpoint save failed: {}", e));
        } else {
            self.emit(SwarmEvent::StateCheckpoint {
                session_id: self.session_id.clone(),
                phase: self.phase.to_string(),
            });
        }
    }

    fn build_outcome(&self, synthesis: Option<synthesize::SynthesisResult>) -> SwarmOutcome {
        let tasks: Vec<TaskSummary> = self.queue.tasks().map(TaskSummary::from_task).collect();
        let counts = self.queue.counts();
        let (success, partial_success, partial_failure) = SwarmOutcome::classify(counts.completed, counts.total());

        let mut artifact_inventory: Vec<String> = Vec::new();
        for task in self.queue.tasks() {
            if let Some(result) = task.result() {
                for file in &result.files_modified {
                    if !artifact_inventory.contains(file) {
                        artifact_inventory.push(file.clone());
                    }
                }
            }
        }

        let summary = format!(
            "{}/{} tasks completed ({} failed, {} skipped) across {} waves; {} tokens, ${:.2}",
            counts.completed,
            counts.total(),
            counts.failed,
            counts.skipped,
            self.queue.max_wave(),
            self.stats.total_tokens,
            self.stats.total_cost
        );

        SwarmOutcome {
            session_id: self.session_id.clone(),
            success,
            partial_success,
            partial_failure,
            summary,
            synthesis_result: synthesis.map(|s| s.text),
            artifact_inventory,
            tasks,
            stats: self.stats.clone(),
            errors: self.errors.clone(),
        }
    }
}

fn phase_rank(phase: SwarmPhase) -> u8 {
    match phase {
        SwarmPhase::Decomposing => 0,
        SwarmPhase::Executing => 1,
        SwarmPhase::Verifying => 2,
        SwarmPhase::Rescuing => 3,
        SwarmPhase::Synthesizing => 4,
        SwarmPhase::Complete => 5,
    }
}
