//! SharedContextEngine - cross-worker failure learning
//!
//! Append-only blackboard of failure lessons. Workers never read it
//! directly; the pool injects recent lessons for the same task type into
//! the next worker's prompt so the swarm stops repeating the same mistake.

use std::sync::Mutex;

use crate::domain::{Task, TaskResult};
use crate::state::FailureLesson;

/// How many lessons a single prompt may carry
const MAX_LESSONS_PER_PROMPT: usize = 3;

/// Cap on a single recorded lesson
const MAX_LESSON_LEN: usize = 280;

/// Append-only failure learning store
#[derive(Default)]
pub struct SharedContextEngine {
    lessons: Mutex<Vec<FailureLesson>>,
}

impl SharedContextEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record what went wrong with a finished attempt
    pub fn record_failure(&self, task: &Task, result: &TaskResult, summary: &str) {
        let lesson = FailureLesson {
            task_id: task.id.clone(),
            task_type: task.task_type.to_string(),
            model: result.model.clone(),
            lesson: summary.chars().take(MAX_LESSON_LEN).collect(),
        };
        self.lessons.lock().unwrap().push(lesson);
    }

    /// Most recent lessons relevant to a task type, newest first
    pub fn lessons_for(&self, task_type: &str) -> Vec<String> {
        let lessons = self.lessons.lock().unwrap();
        lessons
            .iter()
            .rev()
            .filter(|l| l.task_type == task_type)
            .take(MAX_LESSONS_PER_PROMPT)
            .map(|l| format!("[{} on {}] {}", l.model, l.task_id, l.lesson))
            .collect()
    }

    /// Snapshot for checkpointing
    pub fn snapshot(&self) -> Vec<FailureLesson> {
        self.lessons.lock().unwrap().clone()
    }

    /// Restore from a checkpoint
    pub fn restore(&self, lessons: Vec<FailureLesson>) {
        *self.lessons.lock().unwrap() = lessons;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskType;

    fn failed_result(model: &str) -> TaskResult {
        TaskResult {
            success: false,
            output: String::new(),
            tokens_used: 0,
            cost_used: 0.0,
            duration_ms: 0,
            model: model.to_string(),
            tool_calls: 0,
            files_modified: vec![],
            findings: vec![],
            quality_score: None,
            quality_feedback: None,
            closure_report: None,
            budget_utilization: None,
        }
    }

    #[test]
    fn test_lessons_filtered_by_type() {
        let engine = SharedContextEngine::new();
        let impl_task = Task::new("st-0", "x", TaskType::Implement);
        let research_task = Task::new("st-1", "y", TaskType::Research);

        engine.record_failure(&impl_task, &failed_result("m"), "forgot to run the build");
        engine.record_failure(&research_task, &failed_result("m"), "source was paywalled");

        let lessons = engine.lessons_for("implement");
        assert_eq!(lessons.len(), 1);
        assert!(lessons[0].contains("forgot to run the build"));
    }

    #[test]
    fn test_lessons_capped_and_newest_first() {
        let engine = SharedContextEngine::new();
        let task = Task::new("st-0", "x", TaskType::Implement);
        for i in 0..5 {
            engine.record_failure(&task, &failed_result("m"), &format!("lesson {}", i));
        }

        let lessons = engine.lessons_for("implement");
        assert_eq!(lessons.len(), MAX_LESSONS_PER_PROMPT);
        assert!(lessons[0].contains("lesson 4"));
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let engine = SharedContextEngine::new();
        let task = Task::new("st-0", "x", TaskType::Implement);
        engine.record_failure(&task, &failed_result("m"), "a lesson");

        let other = SharedContextEngine::new();
        other.restore(engine.snapshot());
        assert_eq!(other.lessons_for("implement").len(), 1);
    }
}
