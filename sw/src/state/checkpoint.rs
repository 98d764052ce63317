//! Checkpoint types and the file-backed store
//!
//! Persistence is best-effort: a checkpoint is written at wave boundaries
//! and on completion, as pretty JSON under `<state-dir>/<session-id>/`.
//! The layout is opaque to the rest of the core; only this module touches
//! the filesystem.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::health::HealthRecord;
use crate::queue::QueueCheckpoint;

/// Pipeline phase recorded in a checkpoint; resume continues here
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmPhase {
    Decomposing,
    Executing,
    Verifying,
    Rescuing,
    Synthesizing,
    Complete,
}

impl std::fmt::Display for SwarmPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decomposing => write!(f, "decomposing"),
            Self::Executing => write!(f, "executing"),
            Self::Verifying => write!(f, "verifying"),
            Self::Rescuing => write!(f, "rescuing"),
            Self::Synthesizing => write!(f, "synthesizing"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Aggregate run statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwarmStats {
    pub total_tokens: u64,
    pub total_cost: f64,
    pub quality_rejections: u64,
    pub retries: u64,
}

/// A logged orchestrator decision (kept for the final outcome)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub key: String,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl Decision {
    pub fn new(key: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            detail: detail.into(),
            at: Utc::now(),
        }
    }
}

/// A failure lesson shared across workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureLesson {
    pub task_id: String,
    pub task_type: String,
    pub model: String,
    pub lesson: String,
}

/// The acceptance-criteria plan produced by the manager role
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Acceptance criteria keyed by task id
    pub criteria: std::collections::HashMap<String, Vec<String>>,
    /// Integration verification steps run after the DAG drains
    pub verification_steps: Vec<VerifyStep>,
}

/// One planned verification step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyStep {
    /// Shell command the throwaway verification agent should run
    pub command: String,
    /// Required steps fail the verification; optional ones only warn
    pub required: bool,
}

/// Everything needed to resume a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub phase: SwarmPhase,
    pub plan: Option<ExecutionPlan>,
    pub queue: QueueCheckpoint,
    pub stats: SwarmStats,
    pub model_health: Vec<(String, HealthRecord)>,
    pub decisions: Vec<Decision>,
    pub errors: Vec<String>,
    pub original_prompt: String,
    pub shared_context: Vec<FailureLesson>,
}

/// Summary row for `sw sessions`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub phase: SwarmPhase,
    pub prompt_summary: String,
    pub tasks: usize,
}

/// File-backed checkpoint store
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn checkpoint_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(session_id).join("checkpoint.json")
    }

    /// Persist a checkpoint atomically (temp file + rename)
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let session_dir = self.dir.join(&checkpoint.session_id);
        fs::create_dir_all(&session_dir).context("Failed to create session directory")?;

        let json = serde_json::to_string_pretty(checkpoint).context("Failed to serialize checkpoint")?;

        let tmp = session_dir.join(".checkpoint.json.tmp");
        fs::write(&tmp, json).context("Failed to write checkpoint temp file")?;
        fs::rename(&tmp, session_dir.join("checkpoint.json")).context("Failed to move checkpoint into place")?;

        debug!(session_id = %checkpoint.session_id, phase = %checkpoint.phase, "checkpoint saved");
        Ok(())
    }

    /// Load a session's checkpoint, if one exists
    pub fn load(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        let path = self.checkpoint_path(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).context("Failed to read checkpoint")?;
        let checkpoint: Checkpoint = serde_json::from_str(&content).context("Failed to parse checkpoint")?;
        info!(session_id, phase = %checkpoint.phase, "checkpoint loaded");
        Ok(Some(checkpoint))
    }

    /// List resumable sessions, newest first
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let mut sessions = Vec::new();
        if !self.dir.exists() {
            return Ok(sessions);
        }

        for entry in fs::read_dir(&self.dir).context("Failed to read state directory")? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let session_id = entry.file_name().to_string_lossy().to_string();
            match self.load(&session_id) {
                Ok(Some(cp)) => sessions.push(SessionSummary {
                    session_id: cp.session_id,
                    timestamp: cp.timestamp,
                    phase: cp.phase,
                    prompt_summary: cp.original_prompt.chars().take(80).collect(),
                    tasks: cp.queue.tasks.len(),
                }),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(session_id, error = %e, "skipping unreadable checkpoint");
                }
            }
        }

        sessions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Task, TaskType};
    use std::collections::BTreeMap;

    fn sample_checkpoint(session_id: &str) -> Checkpoint {
        let task = Task::new("st-0", "build the thing", TaskType::Implement);
        let mut waves = BTreeMap::new();
        waves.insert(1, vec!["st-0".to_string()]);

        Checkpoint {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            phase: SwarmPhase::Executing,
            plan: None,
            queue: QueueCheckpoint {
                tasks: vec![task],
                waves,
                current_wave: 1,
            },
            stats: SwarmStats {
                total_tokens: 1234,
                total_cost: 0.05,
                quality_rejections: 1,
                retries: 2,
            },
            model_health: vec![],
            decisions: vec![Decision::new("decomposition", "llm produced 4 subtasks")],
            errors: vec![],
            original_prompt: "build a web scraper".to_string(),
            shared_context: vec![],
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        let checkpoint = sample_checkpoint("sess-1");
        store.save(&checkpoint).unwrap();

        let loaded = store.load("sess-1").unwrap().unwrap();
        assert_eq!(loaded.session_id, "sess-1");
        assert_eq!(loaded.phase, SwarmPhase::Executing);
        assert_eq!(loaded.stats.total_tokens, 1234);
        assert_eq!(loaded.queue.tasks.len(), 1);
        assert_eq!(loaded.decisions.len(), 1);
    }

    #[test]
    fn test_load_missing_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.load("nope").unwrap().is_none());
    }

    #[test]
    fn test_save_overwrites_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        let mut checkpoint = sample_checkpoint("sess-1");
        store.save(&checkpoint).unwrap();

        checkpoint.phase = SwarmPhase::Complete;
        store.save(&checkpoint).unwrap();

        let loaded = store.load("sess-1").unwrap().unwrap();
        assert_eq!(loaded.phase, SwarmPhase::Complete);

        // No temp file left behind
        let session_dir = dir.path().join("sess-1");
        let leftovers: Vec<_> = fs::read_dir(session_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_list_sessions_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        let mut older = sample_checkpoint("older");
        older.timestamp = Utc::now() - chrono::Duration::hours(2);
        store.save(&older).unwrap();

        let newer = sample_checkpoint("newer");
        store.save(&newer).unwrap();

        let sessions = store.list_sessions().unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, "newer");
        assert_eq!(sessions[1].session_id, "older");
    }
}
