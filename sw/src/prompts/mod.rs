//! Worker prompt assembly
//!
//! Renders the embedded Handlebars templates into the task prompt handed to
//! a spawned worker. The tier decides how much scaffolding the prompt
//! carries; the context carries everything task-specific.

pub mod embedded;

use eyre::{Context as _, Result};
use handlebars::Handlebars;
use serde::Serialize;

use crate::domain::{Task, TaskType};

/// How much prompt scaffolding a worker gets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptTier {
    /// Attempt 0 on a capable model
    Full,
    /// Retries and lightweight models
    Reduced,
    /// Explicit override or a very weak model
    Minimal,
}

impl PromptTier {
    fn template_name(&self) -> &'static str {
        match self {
            Self::Full => "worker-full",
            Self::Reduced => "worker-reduced",
            Self::Minimal => "worker-minimal",
        }
    }
}

/// Render context for worker templates
#[derive(Debug, Clone, Serialize)]
struct WorkerPromptContext {
    persona: String,
    task_id: String,
    task_type: String,
    description: String,
    complexity: u8,
    working_dir: String,
    target_files: Vec<String>,
    read_files: Vec<String>,
    type_rules: String,
    dependency_context: Option<String>,
    lessons: Vec<String>,
    fix_instructions: Option<String>,
    rescue_context: Option<String>,
    retry_feedback: Option<String>,
    retry_attempt: u32,
    retry_score: Option<u8>,
    retry_files: Option<String>,
    demand_tool_call: bool,
    all_failed: bool,
}

/// Persona line per task-type kind
fn persona_for(task_type: &TaskType) -> &'static str {
    match task_type {
        TaskType::Research | TaskType::Analysis => "a meticulous research analyst",
        TaskType::Design | TaskType::Review => "a pragmatic software architect",
        TaskType::Document => "a precise technical writer",
        TaskType::Merge => "an integration engineer joining parallel workstreams",
        _ => "a senior software engineer",
    }
}

/// Rule block per task-type kind
fn rules_for(task_type: &TaskType) -> &'static str {
    match task_type {
        TaskType::Research | TaskType::Analysis => embedded::RULES_RESEARCH,
        TaskType::Design | TaskType::Review | TaskType::Merge => embedded::RULES_SYNTHESIS,
        TaskType::Document => embedded::RULES_DOCUMENT,
        _ => embedded::RULES_CODE,
    }
}

/// Renders worker prompts from the embedded templates
pub struct PromptBuilder {
    registry: Handlebars<'static>,
}

impl PromptBuilder {
    pub fn new() -> Result<Self> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(false);
        // Prompts are plain text; HTML escaping would mangle code and paths
        registry.register_escape_fn(handlebars::no_escape);
        for name in ["worker-full", "worker-reduced", "worker-minimal"] {
            let Some(template) = embedded::get_embedded(name) else {
                eyre::bail!("missing embedded template {}", name);
            };
            registry
                .register_template_string(name, template)
                .context(format!("Failed to register template {}", name))?;
        }
        Ok(Self { registry })
    }

    /// Build the task prompt for a worker attempt
    pub fn build(&self, task: &Task, tier: PromptTier, working_dir: &str, lessons: Vec<String>) -> Result<String> {
        let retry = task.retry_context.as_ref();

        let ctx = WorkerPromptContext {
            persona: persona_for(&task.task_type).to_string(),
            task_id: task.id.clone(),
            task_type: task.task_type.to_string(),
            description: task.description.clone(),
            complexity: task.complexity,
            working_dir: working_dir.to_string(),
            target_files: task.target_files.clone(),
            read_files: task.read_files.clone(),
            type_rules: rules_for(&task.task_type).to_string(),
            dependency_context: task.dependency_context.clone(),
            lessons,
            fix_instructions: task.fix_instructions.clone(),
            rescue_context: task.rescue_context.clone(),
            retry_feedback: retry.map(|r| r.previous_feedback.clone()).filter(|f| !f.is_empty()),
            retry_attempt: retry.map(|r| r.attempt).unwrap_or(0),
            retry_score: retry.and_then(|r| r.previous_score),
            retry_files: retry
                .filter(|r| !r.previous_files.is_empty())
                .map(|r| r.previous_files.join(", ")),
            demand_tool_call: retry.map(|r| r.previous_was_hollow).unwrap_or(false),
            all_failed: retry.map(|r| r.all_failed_wave).unwrap_or(false),
        };

        self.registry
            .render(tier.template_name(), &ctx)
            .context("Failed to render worker prompt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RetryContext;

    fn sample_task() -> Task {
        Task::new("st-0", "Implement the session store", TaskType::Implement)
            .with_complexity(6)
            .with_target_files(vec!["src/session.rs".to_string()])
    }

    #[test]
    fn test_full_prompt_carries_everything() {
        let builder = PromptBuilder::new().unwrap();
        let mut task = sample_task();
        task.dependency_context = Some("## Outputs from completed dependencies\n\nschema is in db.rs".to_string());

        let prompt = builder
            .build(&task, PromptTier::Full, "/work/repo", vec!["[m on st-9] ran out of budget".to_string()])
            .unwrap();

        assert!(prompt.contains("senior software engineer"));
        assert!(prompt.contains("st-0"));
        assert!(prompt.contains("Implement the session store"));
        assert!(prompt.contains("src/session.rs"));
        assert!(prompt.contains("/work/repo"));
        assert!(prompt.contains("schema is in db.rs"));
        assert!(prompt.contains("ran out of budget"));
        // No retry section on a first attempt
        assert!(!prompt.contains("did not pass"));
    }

    #[test]
    fn test_retry_prompt_demands_tool_call_after_hollow() {
        let builder = PromptBuilder::new().unwrap();
        let mut task = sample_task();
        task.set_retry_context(RetryContext {
            attempt: 1,
            previous_feedback: "claimed success with no changes".to_string(),
            previous_was_hollow: true,
            ..Default::default()
        });

        let prompt = builder.build(&task, PromptTier::Reduced, "/work", vec![]).unwrap();
        assert!(prompt.contains("claimed success with no changes"));
        assert!(prompt.contains("FIRST action must be a tool call"));
    }

    #[test]
    fn test_minimal_prompt_is_small() {
        let builder = PromptBuilder::new().unwrap();
        let task = sample_task();

        let full = builder.build(&task, PromptTier::Full, "/w", vec![]).unwrap();
        let minimal = builder.build(&task, PromptTier::Minimal, "/w", vec![]).unwrap();
        assert!(minimal.len() < full.len() / 2);
        assert!(minimal.contains("Implement the session store"));
    }

    #[test]
    fn test_personas_vary_by_type() {
        let builder = PromptBuilder::new().unwrap();
        let research = Task::new("st-1", "survey crates", TaskType::Research);
        let prompt = builder.build(&research, PromptTier::Full, "/w", vec![]).unwrap();
        assert!(prompt.contains("research analyst"));
        assert!(prompt.contains("Ground every claim"));
    }

    #[test]
    fn test_all_failed_wave_nudge() {
        let builder = PromptBuilder::new().unwrap();
        let mut task = sample_task();
        task.set_retry_context(RetryContext {
            attempt: 3,
            previous_feedback: "wave collapsed".to_string(),
            all_failed_wave: true,
            ..Default::default()
        });

        let prompt = builder.build(&task, PromptTier::Full, "/w", vec![]).unwrap();
        assert!(prompt.contains("fundamentally different"));
    }
}
