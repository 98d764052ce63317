//! QualityGate - three layers between a worker's "done" and `completed`
//!
//! 1. Pre-flight: deterministic auto-fails (missing artifacts, zero tool
//!    calls on action work, confessed failure in the closure report).
//! 2. Concrete checks: cheap syntactic sanity over modified files, for
//!    code-typed tasks only.
//! 3. LLM judge: grades the report against what is actually on disk and
//!    returns `SCORE: 1..5` + `FEEDBACK: ...`.
//!
//! A judge exception is a soft fail (score 3, not passed, `gate_error`) so
//! a broken judge can never silently wave work through.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::QualityConfig;
use crate::domain::{Task, TaskResult};
use crate::llm::{ChatRequest, ProviderClient};

/// Most files the judge sees, and how much of each
const MAX_JUDGE_FILES: usize = 10;
const FILE_EXCERPT_LEN: usize = 2000;

/// Cap on worker output quoted into the judge prompt
const MAX_OUTPUT_IN_PROMPT: usize = 4000;

/// Gross brace imbalance tolerated before a concrete check fails
const BRACE_IMBALANCE_LIMIT: i64 = 2;

/// Gate outcome
#[derive(Debug, Clone)]
pub struct QualityVerdict {
    pub score: u8,
    pub passed: bool,
    pub feedback: String,
    /// Rejected by a deterministic pre-flight check (no LLM involved)
    pub pre_flight_reject: bool,
    /// Pre-flight artifact check failed (all target files missing/empty)
    pub artifact_auto_fail: bool,
    /// The judge itself errored; treat as a soft fail
    pub gate_error: bool,
}

impl QualityVerdict {
    fn pre_flight(score: u8, feedback: impl Into<String>, artifact_auto_fail: bool) -> Self {
        Self {
            score,
            passed: false,
            feedback: feedback.into(),
            pre_flight_reject: true,
            artifact_auto_fail,
            gate_error: false,
        }
    }

    fn rejected(score: u8, feedback: impl Into<String>) -> Self {
        Self {
            score,
            passed: false,
            feedback: feedback.into(),
            pre_flight_reject: false,
            artifact_auto_fail: false,
            gate_error: false,
        }
    }
}

/// The quality gate
pub struct QualityGate {
    provider: Arc<dyn ProviderClient>,
    config: QualityConfig,
    judge_model: Option<String>,
    workspace_root: PathBuf,
}

impl QualityGate {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        config: QualityConfig,
        judge_model: Option<String>,
        workspace_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            provider,
            config,
            judge_model,
            workspace_root: workspace_root.into(),
        }
    }

    /// Pass threshold for a task (foundation tasks are graded one notch
    /// more leniently, floor 2)
    pub fn threshold_for(&self, task: &Task) -> u8 {
        if task.is_foundation {
            (self.config.threshold.saturating_sub(1)).max(2)
        } else {
            self.config.threshold
        }
    }

    /// Evaluate a successful worker result
    pub async fn evaluate(&self, task: &Task, result: &TaskResult, criteria: Option<&[String]>) -> QualityVerdict {
        if let Some(verdict) = self.pre_flight(task, result) {
            debug!(task_id = %task.id, score = verdict.score, "pre-flight rejection");
            return verdict;
        }

        if task.task_type.is_code_type()
            && let Some(verdict) = self.concrete_checks(result)
        {
            debug!(task_id = %task.id, "concrete check rejection");
            return verdict;
        }

        self.judge(task, result, criteria).await
    }

    // === Layer 1: pre-flight ===

    fn pre_flight(&self, task: &Task, result: &TaskResult) -> Option<QualityVerdict> {
        // All target files missing or empty: nothing was produced
        if !task.target_files.is_empty() {
            let all_absent = task.target_files.iter().all(|f| {
                let path = self.workspace_root.join(f);
                !file_has_content(&path)
            });
            if all_absent {
                return Some(QualityVerdict::pre_flight(
                    1,
                    format!(
                        "None of the expected files exist or have content: {}",
                        task.target_files.join(", ")
                    ),
                    true,
                ));
            }
        }

        // Action-typed work with zero tool calls did nothing
        if task.task_type.is_action_oriented() && result.tool_calls == 0 {
            return Some(QualityVerdict::pre_flight(
                0,
                format!("{} task finished with zero tool calls", task.task_type),
                false,
            ));
        }

        // Description promises an artifact, none delivered, nothing executed
        if description_mentions_artifact(&task.description) && result.files_modified.is_empty() && result.tool_calls == 0
        {
            return Some(QualityVerdict::pre_flight(
                1,
                "Task description names an artifact but no files were modified and no tools ran",
                false,
            ));
        }

        // The worker's own wrap-up admits failure
        if let Some(report) = &result.closure_report {
            let lower = report.to_lowercase();
            if let Some(phrase) = self.config.failure_phrases.iter().find(|p| lower.contains(p.as_str())) {
                return Some(QualityVerdict::pre_flight(
                    1,
                    format!("Closure report admits failure (\"{}\")", phrase),
                    false,
                ));
            }
        }

        None
    }

    // === Layer 2: concrete checks (code-typed tasks) ===

    fn concrete_checks(&self, result: &TaskResult) -> Option<QualityVerdict> {
        for file in &result.files_modified {
            let path = self.workspace_root.join(file);
            if !file_has_content(&path) {
                return Some(QualityVerdict::rejected(
                    2,
                    format!("Reported modified file {} is missing or empty", file),
                ));
            }

            let Ok(content) = std::fs::read_to_string(&path) else {
                continue; // binary or unreadable: the judge can decide
            };

            if file.ends_with(".json") && serde_json::from_str::<serde_json::Value>(&content).is_err() {
                return Some(QualityVerdict::rejected(2, format!("{} does not parse as JSON", file)));
            }

            if is_braced_source(file) {
                let open = content.matches('{').count() as i64;
                let close = content.matches('}').count() as i64;
                if (open - close).abs() > BRACE_IMBALANCE_LIMIT {
                    return Some(QualityVerdict::rejected(
                        2,
                        format!("{} has grossly unbalanced braces ({} open vs {} close)", file, open, close),
                    ));
                }
            }
        }
        None
    }

    // === Layer 3: LLM judge ===

    async fn judge(&self, task: &Task, result: &TaskResult, criteria: Option<&[String]>) -> QualityVerdict {
        let prompt = self.build_judge_prompt(task, result, criteria);
        let mut request = ChatRequest::simple(JUDGE_SYSTEM_PROMPT, prompt, 1024);
        if let Some(model) = &self.judge_model {
            request = request.with_model(model.clone());
        }

        let response = match self.provider.chat(request).await {
            Ok(r) => r,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "quality judge call failed; soft fail");
                return QualityVerdict {
                    score: 3,
                    passed: false,
                    feedback: format!("quality gate error: {}", e),
                    pre_flight_reject: false,
                    artifact_auto_fail: false,
                    gate_error: true,
                };
            }
        };

        let (score, feedback) = parse_judge_reply(response.text());
        let passed = score >= self.threshold_for(task);
        QualityVerdict {
            score,
            passed,
            feedback,
            pre_flight_reject: false,
            artifact_auto_fail: false,
            gate_error: false,
        }
    }

    fn build_judge_prompt(&self, task: &Task, result: &TaskResult, criteria: Option<&[String]>) -> String {
        let mut prompt = format!(
            "## Task ({}, complexity {}/10)\n\n{}\n\n",
            task.task_type, task.complexity, task.description
        );

        if let Some(criteria) = criteria
            && !criteria.is_empty()
        {
            prompt.push_str("## Acceptance criteria\n\n");
            for c in criteria {
                prompt.push_str(&format!("- {}\n", c));
            }
            prompt.push('\n');
        }

        prompt.push_str("## Worker report\n\n");
        let output: String = result.output.chars().take(MAX_OUTPUT_IN_PROMPT).collect();
        prompt.push_str(&output);
        prompt.push_str("\n\n");

        if let Some(report) = &result.closure_report {
            prompt.push_str(&format!("## Worker closure report\n\n{}\n\n", report));
        }

        // Ground truth: what is actually on disk beats what the worker says
        let mut files: Vec<String> = task.target_files.clone();
        for f in &result.files_modified {
            if !files.contains(f) {
                files.push(f.clone());
            }
        }
        files.truncate(MAX_JUDGE_FILES);

        if !files.is_empty() {
            prompt.push_str("## Actual file contents on disk (ground truth)\n\n");
            for file in &files {
                let path = self.workspace_root.join(file);
                match std::fs::read_to_string(&path) {
                    Ok(content) => {
                        let excerpt: String = content.chars().take(FILE_EXCERPT_LEN).collect();
                        prompt.push_str(&format!("### {}\n```\n{}\n```\n\n", file, excerpt));
                    }
                    Err(_) => {
                        prompt.push_str(&format!("### {}\nMISSING OR UNREADABLE\n\n", file));
                    }
                }
            }
        }

        prompt
    }
}

const JUDGE_SYSTEM_PROMPT: &str = "You are a strict quality judge for work done by autonomous agents. \
    Judge whether the work described was actually performed, using the on-disk ground truth over the worker's claims. \
    Penalize claims without corresponding file changes. \
    Reply with exactly two lines:\nSCORE: <integer 1-5>\nFEEDBACK: <one concise paragraph of actionable feedback>";

/// Parse `SCORE:`/`FEEDBACK:` out of a judge reply. Missing header
/// defaults to 3; the score is clamped into [1, 5].
fn parse_judge_reply(text: &str) -> (u8, String) {
    let mut score = 3u8;
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("SCORE:") {
            if let Some(parsed) = rest
                .trim()
                .split_whitespace()
                .next()
                .and_then(|tok| tok.trim_matches(|c: char| !c.is_ascii_digit()).parse::<i64>().ok())
            {
                score = parsed.clamp(1, 5) as u8;
            }
            break;
        }
    }

    let feedback = text
        .split_once("FEEDBACK:")
        .map(|(_, f)| f.trim().to_string())
        .unwrap_or_else(|| text.trim().to_string());

    (score, feedback)
}

fn file_has_content(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

fn is_braced_source(file: &str) -> bool {
    [".rs", ".ts", ".tsx", ".js", ".jsx", ".c", ".h", ".cpp", ".go", ".java", ".css"]
        .iter()
        .any(|ext| file.ends_with(ext))
}

/// A word containing a dot-extension reads as a promised artifact
fn description_mentions_artifact(description: &str) -> bool {
    description.split_whitespace().any(|tok| {
        let tok = tok.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '.' && c != '/' && c != '_' && c != '-');
        tok.contains('/')
            || tok
                .rsplit_once('.')
                .map(|(base, ext)| {
                    !base.is_empty() && !ext.is_empty() && ext.len() <= 4 && ext.chars().all(|c| c.is_ascii_alphanumeric())
                })
                .unwrap_or(false)
    })
}
