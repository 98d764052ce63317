//! Session state: checkpoint contract and the file-backed store

mod checkpoint;

pub use checkpoint::{
    Checkpoint, CheckpointStore, Decision, ExecutionPlan, FailureLesson, SessionSummary, SwarmPhase, SwarmStats,
    VerifyStep,
};
