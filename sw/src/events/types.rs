//! Event types for swarm activity streaming
//!
//! Every significant action in a swarm run emits one of these. Consumers
//! (CLI progress printer, log sink, tests) subscribe through the bus.

use serde::{Deserialize, Serialize};

/// Core event enum - the vocabulary of a swarm run
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SwarmEvent {
    // === Run lifecycle ===
    #[serde(rename = "swarm.start")]
    Start {
        session_id: String,
        prompt_summary: String,
        total_budget: u64,
    },
    #[serde(rename = "swarm.tasks.loaded")]
    TasksLoaded { count: usize, waves: u32, strategy: String },
    #[serde(rename = "swarm.complete")]
    Complete {
        success: bool,
        partial: bool,
        completed: usize,
        total: usize,
        tokens_used: u64,
        cost_used: f64,
    },
    #[serde(rename = "swarm.abort")]
    Abort { reason: String },
    #[serde(rename = "swarm.error")]
    Error { context: String, message: String },

    // === Waves ===
    #[serde(rename = "swarm.wave.start")]
    WaveStart { wave: u32, task_count: usize },
    #[serde(rename = "swarm.wave.complete")]
    WaveComplete {
        wave: u32,
        completed: usize,
        failed: usize,
        skipped: usize,
    },
    #[serde(rename = "swarm.wave.allFailed")]
    WaveAllFailed { wave: u32, requeued: usize },

    // === Tasks ===
    #[serde(rename = "swarm.task.dispatched")]
    TaskDispatched {
        task_id: String,
        model: String,
        wave: u32,
        attempt: u32,
    },
    #[serde(rename = "swarm.task.completed")]
    TaskCompleted {
        task_id: String,
        score: Option<u8>,
        tokens: u64,
        duration_ms: u64,
    },
    #[serde(rename = "swarm.task.failed")]
    TaskFailed {
        task_id: String,
        cause: String,
        attempts: u32,
        will_retry: bool,
    },
    #[serde(rename = "swarm.task.skipped")]
    TaskSkipped { task_id: String, reason: String },
    #[serde(rename = "swarm.task.attempt")]
    TaskAttempt { task_id: String, attempt: u32, model: String },
    #[serde(rename = "swarm.task.resilience")]
    TaskResilience { task_id: String, action: String },

    // === Quality & budget ===
    #[serde(rename = "swarm.quality.rejected")]
    QualityRejected {
        task_id: String,
        score: u8,
        feedback: String,
        pre_flight: bool,
    },
    #[serde(rename = "swarm.budget.update")]
    BudgetUpdate {
        tokens_used: u64,
        tokens_cap: u64,
        cost_used: f64,
        cost_cap: f64,
    },

    // === Planning / review / verification ===
    #[serde(rename = "swarm.plan.complete")]
    PlanComplete { criteria_count: usize, verify_steps: usize },
    #[serde(rename = "swarm.review.start")]
    ReviewStart { wave: u32 },
    #[serde(rename = "swarm.review.complete")]
    ReviewComplete { wave: u32, fixups: usize },
    #[serde(rename = "swarm.verify.start")]
    VerifyStart { steps: usize },
    #[serde(rename = "swarm.verify.step")]
    VerifyStep {
        index: usize,
        command: String,
        success: bool,
    },
    #[serde(rename = "swarm.verify.complete")]
    VerifyComplete { passed: bool, retries: u32 },
    #[serde(rename = "swarm.fixup.spawned")]
    FixupSpawned { task_id: String, fixes: String },

    // === Models ===
    #[serde(rename = "swarm.model.failover")]
    ModelFailover {
        task_id: String,
        from: String,
        to: String,
        reason: String,
    },
    #[serde(rename = "swarm.model.health")]
    ModelHealth {
        model: String,
        healthy: bool,
        failures: u64,
    },

    // === Recovery ===
    #[serde(rename = "swarm.circuit.open")]
    CircuitOpen { recent_count: usize, pause_ms: u64 },
    #[serde(rename = "swarm.circuit.closed")]
    CircuitClosed {},
    #[serde(rename = "swarm.replan")]
    Replan { stuck: usize, new_tasks: usize },
    #[serde(rename = "swarm.stall")]
    Stall { failed_ratio: f64 },

    // === State & orchestrator internals ===
    #[serde(rename = "swarm.state.checkpoint")]
    StateCheckpoint { session_id: String, phase: String },
    #[serde(rename = "swarm.state.resume")]
    StateResume { session_id: String, phase: String },
    #[serde(rename = "swarm.orchestrator.decision")]
    Decision { key: String, detail: String },
    #[serde(rename = "swarm.orchestrator.llm")]
    OrchestratorLlm {
        purpose: String,
        model: String,
        tokens: u64,
    },
    #[serde(rename = "swarm.role.action")]
    RoleAction { role: String, action: String },
    #[serde(rename = "swarm.phase.progress")]
    PhaseProgress { phase: String, detail: String },
    #[serde(rename = "swarm.status")]
    Status { message: String },
}

impl SwarmEvent {
    /// Get the dotted event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            SwarmEvent::Start { .. } => "swarm.start",
            SwarmEvent::TasksLoaded { .. } => "swarm.tasks.loaded",
            SwarmEvent::Complete { .. } => "swarm.complete",
            SwarmEvent::Abort { .. } => "swarm.abort",
            SwarmEvent::Error { .. } => "swarm.error",
            SwarmEvent::WaveStart { .. } => "swarm.wave.start",
            SwarmEvent::WaveComplete { .. } => "swarm.wave.complete",
            SwarmEvent::WaveAllFailed { .. } => "swarm.wave.allFailed",
            SwarmEvent::TaskDispatched { .. } => "swarm.task.dispatched",
            SwarmEvent::TaskCompleted { .. } => "swarm.task.completed",
            SwarmEvent::TaskFailed { .. } => "swarm.task.failed",
            SwarmEvent::TaskSkipped { .. } => "swarm.task.skipped",
            SwarmEvent::TaskAttempt { .. } => "swarm.task.attempt",
            SwarmEvent::TaskResilience { .. } => "swarm.task.resilience",
            SwarmEvent::QualityRejected { .. } => "swarm.quality.rejected",
            SwarmEvent::BudgetUpdate { .. } => "swarm.budget.update",
            SwarmEvent::PlanComplete { .. } => "swarm.plan.complete",
            SwarmEvent::ReviewStart { .. } => "swarm.review.start",
            SwarmEvent::ReviewComplete { .. } => "swarm.review.complete",
            SwarmEvent::VerifyStart { .. } => "swarm.verify.start",
            SwarmEvent::VerifyStep { .. } => "swarm.verify.step",
            SwarmEvent::VerifyComplete { .. } => "swarm.verify.complete",
            SwarmEvent::FixupSpawned { .. } => "swarm.fixup.spawned",
            SwarmEvent::ModelFailover { .. } => "swarm.model.failover",
            SwarmEvent::ModelHealth { .. } => "swarm.model.health",
            SwarmEvent::CircuitOpen { .. } => "swarm.circuit.open",
            SwarmEvent::CircuitClosed {} => "swarm.circuit.closed",
            SwarmEvent::Replan { .. } => "swarm.replan",
            SwarmEvent::Stall { .. } => "swarm.stall",
            SwarmEvent::StateCheckpoint { .. } => "swarm.state.checkpoint",
            SwarmEvent::StateResume { .. } => "swarm.state.resume",
            SwarmEvent::Decision { .. } => "swarm.orchestrator.decision",
            SwarmEvent::OrchestratorLlm { .. } => "swarm.orchestrator.llm",
            SwarmEvent::RoleAction { .. } => "swarm.role.action",
            SwarmEvent::PhaseProgress { .. } => "swarm.phase.progress",
            SwarmEvent::Status { .. } => "swarm.status",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names() {
        let event = SwarmEvent::TaskDispatched {
            task_id: "st-0".to_string(),
            model: "claude-sonnet-4".to_string(),
            wave: 1,
            attempt: 0,
        };
        assert_eq!(event.event_type(), "swarm.task.dispatched");

        assert_eq!(
            SwarmEvent::CircuitOpen {
                recent_count: 3,
                pause_ms: 15_000
            }
            .event_type(),
            "swarm.circuit.open"
        );
    }

    #[test]
    fn test_event_serialization() {
        let event = SwarmEvent::ModelFailover {
            task_id: "st-1".to_string(),
            from: "claude-haiku-3-5".to_string(),
            to: "claude-sonnet-4".to_string(),
            reason: "hollow-completion".to_string(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"swarm.model.failover\""));
        assert!(json.contains("hollow-completion"));

        let parsed: SwarmEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type(), "swarm.model.failover");
    }

}
