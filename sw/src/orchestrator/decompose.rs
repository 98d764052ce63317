//! Task decomposition
//!
//! Asks the decomposer LLM to break the user's prompt into a subtask DAG
//! via a forced tool call, validates the result, retries once with a
//! simplified prompt, and falls back to a deterministic emergency scaffold
//! rather than aborting the swarm.

use eyre::{Result, bail};
use serde::Deserialize;
use tracing::{info, warn};

use crate::domain::{Task, TaskType, id};
use crate::llm::{ChatRequest, ProviderClient, ToolChoice, ToolSpec};
use crate::queue;

/// Result of decomposition, however it was obtained
#[derive(Debug)]
pub struct Decomposition {
    pub tasks: Vec<Task>,
    pub strategy: String,
    pub reasoning: String,
    /// The LLM path failed and the deterministic scaffold was used
    pub emergency: bool,
    pub tokens_used: u64,
    pub cost_used: f64,
}

/// Wire schema the decomposer must produce
#[derive(Debug, Deserialize)]
struct DecomposerOutput {
    subtasks: Vec<SubtaskOutput>,
    #[serde(default)]
    strategy: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubtaskOutput {
    description: String,
    #[serde(rename = "type")]
    task_type: String,
    complexity: i64,
    /// Zero-based indices into the same array
    #[serde(default)]
    dependencies: Vec<i64>,
    #[serde(default = "default_true")]
    parallelizable: bool,
    #[serde(default, rename = "relevantFiles")]
    relevant_files: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Decompose a prompt into tasks: LLM first, simplified retry second,
/// emergency scaffold last
pub async fn decompose(provider: &dyn ProviderClient, model: Option<&str>, prompt: &str) -> Decomposition {
    let mut tokens_used = 0u64;
    let mut cost_used = 0.0f64;

    for (attempt, system) in [DECOMPOSE_SYSTEM, DECOMPOSE_SYSTEM_SIMPLE].iter().enumerate() {
        let request = build_request(system, prompt, model);
        match provider.chat(request).await {
            Ok(response) => {
                tokens_used += response.usage.total();
                cost_used += response.usage.cost_usd(model.unwrap_or(provider.default_model()));
                match parse_response(&response) {
                    Ok(output) => match build_tasks(output) {
                        Ok((tasks, strategy, reasoning)) => {
                            info!(count = tasks.len(), attempt, "decomposition accepted");
                            return Decomposition {
                                tasks,
                                strategy,
                                reasoning,
                                emergency: false,
                                tokens_used,
                                cost_used,
                            };
                        }
                        Err(e) => warn!(attempt, error = %e, "decomposition invalid"),
                    },
                    Err(e) => warn!(attempt, error = %e, "decomposer reply unparseable"),
                }
            }
            Err(e) => warn!(attempt, error = %e, "decomposer call failed"),
        }
    }

    warn!("LLM decomposition failed twice; using emergency scaffold");
    let tasks = emergency_scaffold(prompt);
    Decomposition {
        tasks,
        strategy: "sequential".to_string(),
        reasoning: "emergency scaffold after decomposition failure".to_string(),
        emergency: true,
        tokens_used,
        cost_used,
    }
}

fn build_request(system: &str, prompt: &str, model: Option<&str>) -> ChatRequest {
    let mut request = ChatRequest::simple(system, format!("Decompose this task:\n\n{}", prompt), 8192).with_tools(
        vec![decomposition_tool()],
        ToolChoice::Tool("submit_decomposition".to_string()),
    );
    if let Some(model) = model {
        request = request.with_model(model);
    }
    request
}

fn decomposition_tool() -> ToolSpec {
    ToolSpec::new(
        "submit_decomposition",
        "Submit the task decomposition. Call this once with all subtasks.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "subtasks": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "description": { "type": "string" },
                            "type": {
                                "type": "string",
                                "description": "research|analysis|design|implement|test|refactor|review|document|integrate|deploy|merge"
                            },
                            "complexity": { "type": "integer", "minimum": 1, "maximum": 10 },
                            "dependencies": {
                                "type": "array",
                                "items": { "type": "integer" },
                                "description": "Zero-based indices of subtasks this one depends on"
                            },
                            "parallelizable": { "type": "boolean" },
                            "relevantFiles": {
                                "type": "array",
                                "items": { "type": "string" }
                            }
                        },
                        "required": ["description", "type", "complexity"]
                    }
                },
                "strategy": {
                    "type": "string",
                    "enum": ["sequential", "parallel", "hierarchical", "adaptive", "pipeline"]
                },
                "reasoning": { "type": "string" }
            },
            "required": ["subtasks", "strategy", "reasoning"]
        }),
    )
}

fn parse_response(response: &crate::llm::ChatResponse) -> Result<DecomposerOutput> {
    if let Some(call) = response.tool_call("submit_decomposition") {
        return Ok(serde_json::from_value(call.input.clone())?);
    }

    // Fallback: content that happens to be the JSON body
    if let Ok(output) = serde_json::from_str::<DecomposerOutput>(response.text()) {
        return Ok(output);
    }

    bail!("decomposer did not produce a submit_decomposition call")
}

/// Validate the wire output and convert to Tasks with `st-N` ids
fn build_tasks(output: DecomposerOutput) -> Result<(Vec<Task>, String, String)> {
    let count = output.subtasks.len();
    if count < 2 {
        bail!("decomposition produced {} subtasks; need at least 2", count);
    }

    let mut tasks = Vec::with_capacity(count);
    for (idx, sub) in output.subtasks.into_iter().enumerate() {
        let mut deps = Vec::new();
        for dep in sub.dependencies {
            if dep < 0 || dep as usize >= count {
                bail!("subtask {} has out-of-range dependency index {}", idx, dep);
            }
            if dep as usize == idx {
                bail!("subtask {} depends on itself", idx);
            }
            deps.push(id::subtask_id(dep as usize));
        }

        let task_type: TaskType = sub.task_type.into();
        let mut task = Task::new(id::subtask_id(idx), sub.description, task_type.clone())
            .with_complexity(sub.complexity.clamp(1, 10) as u8)
            .with_dependencies(deps);
        task.parallelizable = sub.parallelizable;
        if task_type.is_action_oriented() {
            task.target_files = sub.relevant_files;
        } else {
            task.read_files = sub.relevant_files;
        }
        tasks.push(task);
    }

    // A cyclic decomposition is invalid, not fixable
    queue::validate(&tasks)?;

    Ok((
        tasks,
        output.strategy.unwrap_or_else(|| "adaptive".to_string()),
        output.reasoning.unwrap_or_default(),
    ))
}

/// Deterministic design → implement → test → integrate chain used when the
/// decomposer cannot be trusted
pub fn emergency_scaffold(prompt: &str) -> Vec<Task> {
    let summary: String = prompt.chars().take(200).collect();
    vec![
        Task::new(
            id::subtask_id(0),
            format!("Design an approach for: {}. Produce a short plan naming the files to create.", summary),
            TaskType::Design,
        )
        .with_complexity(4),
        Task::new(
            id::subtask_id(1),
            format!("Implement the core of: {}", summary),
            TaskType::Implement,
        )
        .with_complexity(7)
        .with_dependencies(vec![id::subtask_id(0)]),
        Task::new(
            id::subtask_id(2),
            format!("Write and run tests covering the implementation of: {}", summary),
            TaskType::Test,
        )
        .with_complexity(5)
        .with_dependencies(vec![id::subtask_id(1)]),
        Task::new(
            id::subtask_id(3),
            format!("Integrate, reconcile loose ends, and summarize the result of: {}", summary),
            TaskType::Integrate,
        )
        .with_complexity(4)
        .with_dependencies(vec![id::subtask_id(1), id::subtask_id(2)]),
    ]
}

/// If the working directory looks unscaffolded and a scaffold-ish subtask
/// exists, make every other subtask depend on it
pub fn apply_scaffold_first(tasks: &mut [Task], workspace_root: &std::path::Path) -> bool {
    if workspace_appears_scaffolded(workspace_root) {
        return false;
    }

    let Some(scaffold_id) = tasks
        .iter()
        .find(|t| {
            let d = t.description.to_lowercase();
            d.contains("scaffold") || d.contains("bootstrap") || d.contains("set up") || d.contains("setup")
        })
        .map(|t| t.id.clone())
    else {
        return false;
    };

    for task in tasks.iter_mut() {
        if task.id != scaffold_id && !task.dependencies.contains(&scaffold_id) {
            task.dependencies.push(scaffold_id.clone());
        }
    }
    // The scaffold task must not depend on anything it now gates
    if let Some(scaffold) = tasks.iter_mut().find(|t| t.id == scaffold_id) {
        scaffold.dependencies.clear();
    }

    info!(scaffold = %scaffold_id, "scaffold-first override applied");
    true
}

fn workspace_appears_scaffolded(root: &std::path::Path) -> bool {
    const MANIFESTS: &[&str] = &["Cargo.toml", "package.json", "pyproject.toml", "go.mod", "Makefile"];
    MANIFESTS.iter().any(|m| root.join(m).exists()) || root.join("src").is_dir()
}

/// Flag tasks that two or more others transitively depend on
pub fn detect_foundations(tasks: &mut [Task]) -> Vec<String> {
    let snapshot: Vec<Task> = tasks.to_vec();
    let dependents = queue::direct_dependents(&snapshot);

    let mut foundations = Vec::new();
    for task in tasks.iter_mut() {
        let transitive = queue::transitive_dependents(&task.id, &dependents);
        if transitive.len() >= 2 {
            task.is_foundation = true;
            foundations.push(task.id.clone());
        }
    }
    foundations
}

const DECOMPOSE_SYSTEM: &str = r#"You are the planning brain of a swarm of LLM coding agents. Decompose the user's task into subtasks that independent workers can execute concurrently.

Guidelines:
- Produce 2-10 subtasks; each independently executable by one agent.
- Use types: research, analysis, design, implement, test, refactor, review, document, integrate, deploy, merge.
- complexity is 1 (trivial) to 10 (very hard).
- dependencies are zero-based indices into your own subtasks array.
- A merge/integrate subtask must depend on all the independent siblings it joins.
- Dependencies must form a DAG; no cycles.
- Name concrete files in relevantFiles when you can.

Call submit_decomposition exactly once with all subtasks."#;

const DECOMPOSE_SYSTEM_SIMPLE: &str = r#"Break the user's task into 2-6 ordered subtasks for LLM coding agents.

Each subtask needs: description, type (design/implement/test/integrate), complexity 1-10, dependencies (zero-based indices of earlier subtasks). Keep it simple: a mostly linear chain is fine.

Call submit_decomposition exactly once."#;
